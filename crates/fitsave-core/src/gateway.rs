//! Persistence gateway.
//!
//! Front door for every storage call. It validates input, builds and
//! initializes the configured driver once on first use, and applies the
//! strict/lenient failure policy. Saved-result operations always surface
//! storage failures; submission writes only do so in strict mode.

use std::sync::Arc;

use serde::Serialize;
use serde_json::{Map, Value};
use thiserror::Error;
use tokio::sync::OnceCell;

use crate::config::{DriverKind, DriverSelection, StorageConfig};
use crate::db::{EmbeddedDriver, PostgresDriver, StorageDriver, StorageError};
use crate::models::{OwnerId, SavedResult, SubmissionKind, SubmissionRecord};
use crate::util::fingerprint;
use crate::validate;

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("{0}")]
    Validation(String),
    #[error("Result storage is not configured")]
    NotConfigured,
    #[error("Result storage failed: {0}")]
    Storage(#[from] StorageError),
}

pub type GatewayResult<T> = std::result::Result<T, GatewayError>;

/// Outcome of a best-effort submission write.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SubmissionOutcome {
    pub persisted: bool,
}

enum DriverSource {
    Configured(DriverSelection),
    Injected(Arc<dyn StorageDriver>),
}

pub struct PersistenceGateway {
    source: DriverSource,
    strict_mode: bool,
    driver: OnceCell<Arc<dyn StorageDriver>>,
}

impl PersistenceGateway {
    pub fn from_config(config: &StorageConfig) -> Self {
        Self {
            source: DriverSource::Configured(config.selection.clone()),
            strict_mode: config.strict_mode,
            driver: OnceCell::new(),
        }
    }

    /// Use an already-built driver. It is still initialized on first use.
    pub fn with_driver(driver: Arc<dyn StorageDriver>, strict_mode: bool) -> Self {
        Self {
            source: DriverSource::Injected(driver),
            strict_mode,
            driver: OnceCell::new(),
        }
    }

    pub fn driver_kind(&self) -> DriverKind {
        match &self.source {
            DriverSource::Configured(selection) => selection.kind(),
            DriverSource::Injected(driver) => driver.kind(),
        }
    }

    pub fn is_configured(&self) -> bool {
        self.driver_kind() != DriverKind::None
    }

    pub const fn strict_mode(&self) -> bool {
        self.strict_mode
    }

    /// Forget the built driver so the next call builds and initializes it again.
    pub fn reset_driver(&mut self) {
        self.driver.take();
    }

    /// Build and initialize the driver now so startup fails on a bad store
    /// instead of the first request.
    pub async fn warm_up(&self) -> GatewayResult<()> {
        self.driver().await.map(|_| ())
    }

    async fn driver(&self) -> GatewayResult<&Arc<dyn StorageDriver>> {
        self.driver.get_or_try_init(|| self.build_driver()).await
    }

    async fn build_driver(&self) -> GatewayResult<Arc<dyn StorageDriver>> {
        let driver: Arc<dyn StorageDriver> = match &self.source {
            DriverSource::Configured(DriverSelection::Disabled) => {
                return Err(GatewayError::NotConfigured)
            }
            DriverSource::Configured(DriverSelection::Embedded { path }) => Arc::new(
                EmbeddedDriver::open(path)
                    .await
                    .map_err(StorageError::from)?,
            ),
            DriverSource::Configured(DriverSelection::Networked(settings)) => {
                Arc::new(PostgresDriver::connect_lazy(settings).map_err(StorageError::from)?)
            }
            DriverSource::Injected(driver) => driver.clone(),
        };

        if let Err(error) = driver.init().await {
            tracing::error!(driver = driver.kind().as_str(), %error, "Storage init failed");
            return Err(error.into());
        }
        tracing::info!(driver = driver.kind().as_str(), "Storage driver ready");
        Ok(driver)
    }

    pub async fn save_result(
        &self,
        owner: &OwnerId,
        calculator_type: &str,
        calculator_name: &str,
        data: &Value,
    ) -> GatewayResult<SavedResult> {
        let calculator_type = validate::calculator_type(calculator_type)?;
        let calculator_name = validate::calculator_name(calculator_name)?;
        let data = object_payload(data, "data")?;

        let driver = self.driver().await?;
        let saved = driver
            .upsert_saved_result(owner, calculator_type, calculator_name, data)
            .await?;
        tracing::debug!(
            owner = fingerprint(&owner.storage_key()),
            calculator_type,
            "Saved result"
        );
        Ok(saved)
    }

    pub async fn list_results(
        &self,
        owner: &OwnerId,
        limit: Option<usize>,
    ) -> GatewayResult<Vec<SavedResult>> {
        let limit = validate::list_limit(limit);
        let driver = self.driver().await?;
        Ok(driver.list_saved_results(owner, limit).await?)
    }

    pub async fn delete_result(&self, owner: &OwnerId, result_id: &str) -> GatewayResult<bool> {
        let result_id = validate::result_id(result_id)?;
        let driver = self.driver().await?;
        Ok(driver.delete_saved_result(owner, result_id).await?)
    }

    pub async fn clear_results(&self, owner: &OwnerId) -> GatewayResult<u64> {
        let driver = self.driver().await?;
        let removed = driver.clear_saved_results(owner).await?;
        tracing::info!(
            owner = fingerprint(&owner.storage_key()),
            removed,
            "Cleared saved results"
        );
        Ok(removed)
    }

    /// Move one result from `from` to `to`.
    ///
    /// The copy under `to` is written before the original is removed, so a
    /// failure in between leaves the result under both owners and a replay
    /// converges. Returns `None` when neither owner holds `result_id`.
    pub async fn transfer_result(
        &self,
        from: &OwnerId,
        to: &OwnerId,
        result_id: &str,
    ) -> GatewayResult<Option<SavedResult>> {
        let result_id = validate::result_id(result_id)?;
        let driver = self.driver().await?;

        let Some(source) = driver.get_saved_result(from, result_id).await? else {
            return Ok(driver.get_saved_result(to, result_id).await?);
        };

        let moved = driver
            .upsert_saved_result(
                to,
                &source.calculator_type,
                &source.calculator_name,
                &source.data,
            )
            .await?;
        driver.delete_saved_result(from, result_id).await?;

        tracing::info!(
            from = fingerprint(&from.storage_key()),
            to = fingerprint(&to.storage_key()),
            "Transferred saved result"
        );
        Ok(Some(moved))
    }

    /// Append a form submission under the lenient policy unless strict mode is on.
    pub async fn record_submission(
        &self,
        kind: SubmissionKind,
        payload: &Value,
    ) -> GatewayResult<SubmissionOutcome> {
        let payload = object_payload(payload, "payload")?;
        validate::submission(kind, payload)?;
        let record = SubmissionRecord::new(kind, payload.clone());

        let result = match self.driver().await {
            Ok(driver) => driver
                .append_submission(&record)
                .await
                .map_err(GatewayError::from),
            Err(error) => Err(error),
        };

        match result {
            Ok(()) => Ok(SubmissionOutcome { persisted: true }),
            Err(error) if self.strict_mode => Err(error),
            Err(error) => {
                tracing::warn!(kind = kind.as_str(), %error, "Submission not persisted");
                Ok(SubmissionOutcome { persisted: false })
            }
        }
    }
}

fn object_payload<'a>(value: &'a Value, field: &str) -> GatewayResult<&'a Map<String, Value>> {
    value
        .as_object()
        .ok_or_else(|| GatewayError::Validation(format!("{field} must be a JSON object")))
}
