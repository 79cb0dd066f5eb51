//! Saved calculator result model

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::OwnerId;

/// A calculator output the visitor asked to keep.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SavedResult {
    /// Identity the record belongs to
    pub owner_id: OwnerId,
    /// Content-addressed key, unique per owner; public `id`
    #[serde(rename = "id")]
    pub result_key: String,
    /// Calculator that produced the result
    pub calculator_type: String,
    /// Display label for the calculator
    pub calculator_name: String,
    /// Calculator output fields
    pub data: Map<String, Value>,
    /// First insert timestamp (Unix ms)
    pub created_at: i64,
    /// Last upsert timestamp (Unix ms)
    pub updated_at: i64,
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::models::AnonymousId;

    #[test]
    fn serializes_with_public_field_names() {
        let record = SavedResult {
            owner_id: OwnerId::from(AnonymousId::generate()),
            result_key: "bmi-abc".to_string(),
            calculator_type: "bmi".to_string(),
            calculator_name: "BMI Calculator".to_string(),
            data: Map::new(),
            created_at: 1,
            updated_at: 2,
        };

        let value = serde_json::to_value(&record).unwrap();
        assert_eq!(value["id"], json!("bmi-abc"));
        assert_eq!(value["calculatorType"], json!("bmi"));
        assert_eq!(value["createdAt"], json!(1));
        assert!(value["ownerId"].as_str().unwrap().starts_with("anon_"));
    }
}
