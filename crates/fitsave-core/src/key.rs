//! Content-addressed keys for saved calculator results.
//!
//! A key is `"{type}-{hash}"` where `hash` is a 32-bit djb2-xor checksum of the
//! normalized calculator type and a canonical rendering of the result data.
//! Keys already stored by earlier deployments must keep deriving identically,
//! so the canonical form mirrors what browser clients produce: sorted object
//! keys, JSON string literals, and JavaScript number formatting.

use std::cmp::Ordering;
use std::fmt::Write as _;

use serde_json::{Map, Number, Value};

const DJB2_SEED: u32 = 5381;
const BASE36_DIGITS: &[u8; 36] = b"0123456789abcdefghijklmnopqrstuvwxyz";

/// Derive the stable key for a `(calculator_type, data)` pair.
///
/// ```
/// use fitsave_core::key::derive_key;
/// use serde_json::json;
///
/// let a = json!({"bmi": 24.2, "category": "Normal"});
/// let b = json!({"category": "Normal", "bmi": 24.2});
/// assert_eq!(
///     derive_key("BMI", a.as_object().unwrap()),
///     derive_key(" bmi ", b.as_object().unwrap()),
/// );
/// ```
pub fn derive_key(calculator_type: &str, data: &Map<String, Value>) -> String {
    let normalized_type = calculator_type.trim().to_lowercase();
    let mut material = String::with_capacity(normalized_type.len() + 64);
    material.push_str(&normalized_type);
    material.push(':');
    write_object(&mut material, data);

    let hash = djb2_xor(&material);
    format!("{normalized_type}-{}", to_base36(hash))
}

/// Render a JSON value in canonical form.
pub fn canonicalize(value: &Value) -> String {
    let mut out = String::new();
    write_value(&mut out, value);
    out
}

fn write_value(out: &mut String, value: &Value) {
    match value {
        Value::Null => out.push_str("null"),
        Value::Bool(flag) => out.push_str(if *flag { "true" } else { "false" }),
        Value::Number(number) => write_number(out, number),
        Value::String(text) => write_string(out, text),
        Value::Array(items) => {
            out.push('[');
            for (index, item) in items.iter().enumerate() {
                if index > 0 {
                    out.push(',');
                }
                write_value(out, item);
            }
            out.push(']');
        }
        Value::Object(map) => write_object(out, map),
    }
}

fn write_object(out: &mut String, map: &Map<String, Value>) {
    let mut keys: Vec<&String> = map.keys().collect();
    keys.sort_by(|left, right| utf16_order(left, right));

    out.push('{');
    for (index, key) in keys.into_iter().enumerate() {
        if index > 0 {
            out.push(',');
        }
        write_string(out, key);
        out.push(':');
        if let Some(value) = map.get(key) {
            write_value(out, value);
        }
    }
    out.push('}');
}

fn write_string(out: &mut String, text: &str) {
    // Display on a JSON string value yields the escaped literal, quotes included.
    let _ = write!(out, "{}", Value::String(text.to_string()));
}

fn write_number(out: &mut String, number: &Number) {
    if let Some(value) = number.as_i64() {
        let _ = write!(out, "{value}");
    } else if let Some(value) = number.as_u64() {
        let _ = write!(out, "{value}");
    } else if let Some(value) = number.as_f64() {
        out.push_str(&format_js_number(value));
    } else {
        out.push_str("null");
    }
}

/// Format an `f64` the way `String(number)` does in JavaScript.
fn format_js_number(value: f64) -> String {
    if !value.is_finite() {
        return "null".to_string();
    }
    if value == 0.0 {
        return "0".to_string();
    }

    let magnitude = value.abs();
    if (1e-6..1e21).contains(&magnitude) {
        if value.fract() == 0.0 {
            format!("{value:.0}")
        } else {
            format!("{value}")
        }
    } else {
        let scientific = format!("{value:e}");
        match scientific.split_once('e') {
            Some((mantissa, exponent)) if !exponent.starts_with('-') => {
                format!("{mantissa}e+{exponent}")
            }
            _ => scientific,
        }
    }
}

fn utf16_order(left: &str, right: &str) -> Ordering {
    left.encode_utf16().cmp(right.encode_utf16())
}

fn djb2_xor(input: &str) -> u32 {
    input
        .encode_utf16()
        .fold(DJB2_SEED, |hash, unit| hash.wrapping_mul(33) ^ u32::from(unit))
}

fn to_base36(mut value: u32) -> String {
    if value == 0 {
        return "0".to_string();
    }
    let mut digits = Vec::with_capacity(7);
    while value > 0 {
        digits.push(BASE36_DIGITS[(value % 36) as usize]);
        value /= 36;
    }
    digits.reverse();
    String::from_utf8_lossy(&digits).into_owned()
}
