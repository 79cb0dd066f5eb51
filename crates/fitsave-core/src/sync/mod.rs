//! Post-sign-in merge of anonymous results into an account.
//!
//! The coordinator is client-held and runtime agnostic. It is driven by two
//! events (a sign-in being observed and the user's decision) and never retries
//! on its own.

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

use crate::gateway::{GatewayError, PersistenceGateway};
use crate::models::{AccountId, OwnerId, SavedResult};
use crate::state::{Resolution, SyncState};
use crate::util::fingerprint;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SyncError {
    #[error("No merge is waiting for confirmation")]
    NotPending,
    #[error("No signed-in account has been observed")]
    NoSession,
}

#[derive(Debug, Error)]
#[error("Merge rejected: {0}")]
pub struct MergeError(pub String);

impl From<GatewayError> for MergeError {
    fn from(error: GatewayError) -> Self {
        Self(error.to_string())
    }
}

/// Results the client keeps locally between visits.
pub trait LocalResultCache {
    /// Cached results still scoped to an anonymous owner.
    fn anonymous_results(&self) -> Vec<SavedResult>;

    fn remove(&mut self, owner: &OwnerId, result_key: &str);
}

/// In-memory cache, keyed by owner and result key.
#[derive(Debug, Clone, Default)]
pub struct MemoryResultCache {
    results: Vec<SavedResult>,
}

impl MemoryResultCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace the entry with the same owner and key.
    pub fn insert(&mut self, result: SavedResult) {
        match self.results.iter_mut().find(|cached| {
            cached.owner_id == result.owner_id && cached.result_key == result.result_key
        }) {
            Some(existing) => *existing = result,
            None => self.results.push(result),
        }
    }

    pub fn results(&self) -> &[SavedResult] {
        &self.results
    }

    pub fn len(&self) -> usize {
        self.results.len()
    }

    pub fn is_empty(&self) -> bool {
        self.results.is_empty()
    }
}

impl LocalResultCache for MemoryResultCache {
    fn anonymous_results(&self) -> Vec<SavedResult> {
        self.results
            .iter()
            .filter(|result| result.owner_id.is_anonymous())
            .cloned()
            .collect()
    }

    fn remove(&mut self, owner: &OwnerId, result_key: &str) {
        self.results
            .retain(|result| !(result.owner_id == *owner && result.result_key == result_key));
    }
}

/// Where confirmed records are re-submitted under the account.
#[async_trait]
pub trait MergeTarget: Send + Sync {
    async fn merge(
        &self,
        account: &AccountId,
        record: &SavedResult,
    ) -> Result<SavedResult, MergeError>;
}

/// Merges straight through a [`PersistenceGateway`].
///
/// The record is upserted under the account first, then the anonymous server
/// copy is removed. Both steps are idempotent.
#[derive(Clone)]
pub struct GatewayMergeTarget {
    gateway: Arc<PersistenceGateway>,
}

impl GatewayMergeTarget {
    pub fn new(gateway: Arc<PersistenceGateway>) -> Self {
        Self { gateway }
    }
}

#[async_trait]
impl MergeTarget for GatewayMergeTarget {
    async fn merge(
        &self,
        account: &AccountId,
        record: &SavedResult,
    ) -> Result<SavedResult, MergeError> {
        let owner = OwnerId::Account(account.clone());
        let merged = self
            .gateway
            .save_result(
                &owner,
                &record.calculator_type,
                &record.calculator_name,
                &serde_json::Value::Object(record.data.clone()),
            )
            .await?;
        self.gateway
            .delete_result(&record.owner_id, &record.result_key)
            .await?;
        Ok(merged)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergeFailure {
    pub result_key: String,
    pub reason: String,
}

/// Per-record outcome of one confirmation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MergeReport {
    pub merged: Vec<String>,
    pub failed: Vec<MergeFailure>,
}

impl MergeReport {
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Holds the coordinator in `Merging` for one `confirm` call and puts it back
/// to `PendingConfirmation` if that call is dropped before it finishes.
struct MergeInProgress<'a> {
    state: &'a mut SyncState,
    remaining: usize,
}

impl<'a> MergeInProgress<'a> {
    fn start(state: &'a mut SyncState, remaining: usize) -> Self {
        *state = SyncState::Merging;
        Self { state, remaining }
    }

    fn finish(self, outcome: SyncState) {
        *self.state = outcome;
    }
}

impl Drop for MergeInProgress<'_> {
    fn drop(&mut self) {
        if *self.state == SyncState::Merging {
            tracing::debug!(remaining = self.remaining, "Merge abandoned; back to pending");
            *self.state = SyncState::PendingConfirmation {
                pending: self.remaining,
            };
        }
    }
}

#[derive(Debug, Clone)]
pub struct SyncCoordinator {
    state: SyncState,
    session: Option<AccountId>,
}

impl Default for SyncCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

impl SyncCoordinator {
    pub const fn new() -> Self {
        Self {
            state: SyncState::Idle,
            session: None,
        }
    }

    pub const fn state(&self) -> SyncState {
        self.state
    }

    /// Record that `account` is signed in.
    ///
    /// Only the first observation per sign-in session is considered; it moves
    /// to `PendingConfirmation` when the cache holds anonymous results.
    pub fn observe_sign_in<C>(&mut self, account: &AccountId, cache: &C) -> SyncState
    where
        C: LocalResultCache + ?Sized,
    {
        if self.session.as_ref() == Some(account) {
            return self.state;
        }
        self.session = Some(account.clone());

        let pending = cache.anonymous_results().len();
        self.state = if pending > 0 {
            SyncState::PendingConfirmation { pending }
        } else {
            SyncState::Idle
        };
        tracing::debug!(
            account = fingerprint(account.as_str()),
            pending,
            "Observed sign-in"
        );
        self.state
    }

    /// Re-submit every cached anonymous result under the signed-in account.
    ///
    /// A local copy is removed only after the target acknowledged it. Any
    /// failure leaves the coordinator pending so the user can retry, and so
    /// does dropping the returned future before it completes.
    pub async fn confirm<C>(
        &mut self,
        target: &dyn MergeTarget,
        cache: &mut C,
    ) -> Result<MergeReport, SyncError>
    where
        C: LocalResultCache + Send + ?Sized,
    {
        if !self.state.is_pending() {
            return Err(SyncError::NotPending);
        }
        let account = self.session.clone().ok_or(SyncError::NoSession)?;
        let records = cache.anonymous_results();
        let mut merging = MergeInProgress::start(&mut self.state, records.len());

        let mut report = MergeReport::default();
        for record in records {
            match target.merge(&account, &record).await {
                Ok(_) => {
                    cache.remove(&record.owner_id, &record.result_key);
                    report.merged.push(record.result_key);
                    merging.remaining -= 1;
                }
                Err(error) => {
                    tracing::warn!(
                        account = fingerprint(account.as_str()),
                        %error,
                        "Result merge failed"
                    );
                    report.failed.push(MergeFailure {
                        result_key: record.result_key,
                        reason: error.to_string(),
                    });
                }
            }
        }

        merging.finish(if report.is_complete() {
            SyncState::Resolved(Resolution::Merged)
        } else {
            SyncState::PendingConfirmation {
                pending: report.failed.len(),
            }
        });
        tracing::info!(
            account = fingerprint(account.as_str()),
            merged = report.merged.len(),
            failed = report.failed.len(),
            "Anonymous results merge finished"
        );
        Ok(report)
    }

    /// Keep local results as they are and stop prompting for this session.
    pub fn dismiss(&mut self) -> Result<SyncState, SyncError> {
        if !self.state.is_pending() {
            return Err(SyncError::NotPending);
        }
        self.state = SyncState::Resolved(Resolution::Dismissed);
        Ok(self.state)
    }

    pub fn sign_out(&mut self) {
        self.session = None;
        self.state = SyncState::Idle;
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, Ordering};

    use pretty_assertions::assert_eq;
    use serde_json::json;

    use super::*;
    use crate::db::EmbeddedDriver;
    use crate::models::AnonymousId;

    async fn gateway() -> Arc<PersistenceGateway> {
        let driver = EmbeddedDriver::open_in_memory().await.unwrap();
        Arc::new(PersistenceGateway::with_driver(Arc::new(driver), false))
    }

    fn account() -> AccountId {
        AccountId::new("acct-42").unwrap()
    }

    /// Fails the first merge call, then delegates.
    struct FlakyTarget {
        inner: GatewayMergeTarget,
        tripped: AtomicBool,
    }

    #[async_trait]
    impl MergeTarget for FlakyTarget {
        async fn merge(
            &self,
            account: &AccountId,
            record: &SavedResult,
        ) -> Result<SavedResult, MergeError> {
            if !self.tripped.swap(true, Ordering::SeqCst) {
                return Err(MergeError("connection reset".to_string()));
            }
            self.inner.merge(account, record).await
        }
    }

    /// Acknowledges the first record, then never answers.
    struct StallingTarget {
        answered: AtomicBool,
    }

    #[async_trait]
    impl MergeTarget for StallingTarget {
        async fn merge(
            &self,
            _account: &AccountId,
            record: &SavedResult,
        ) -> Result<SavedResult, MergeError> {
            if self.answered.swap(true, Ordering::SeqCst) {
                std::future::pending::<()>().await;
            }
            Ok(record.clone())
        }
    }

    fn cached(result_key: &str) -> SavedResult {
        SavedResult {
            owner_id: OwnerId::from(AnonymousId::generate()),
            result_key: result_key.to_string(),
            calculator_type: "bmi".to_string(),
            calculator_name: "BMI".to_string(),
            data: serde_json::Map::new(),
            created_at: 1,
            updated_at: 1,
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn cancelled_merge_returns_to_pending() {
        let mut cache = MemoryResultCache::new();
        cache.insert(cached("bmi-1"));
        cache.insert(cached("bmi-2"));
        let mut coordinator = SyncCoordinator::new();
        coordinator.observe_sign_in(&account(), &cache);

        let target = StallingTarget {
            answered: AtomicBool::new(false),
        };
        let outcome = tokio::time::timeout(
            std::time::Duration::from_millis(50),
            coordinator.confirm(&target, &mut cache),
        )
        .await;
        assert!(outcome.is_err());

        assert_eq!(
            coordinator.state(),
            SyncState::PendingConfirmation { pending: 1 }
        );
        assert_eq!(cache.len(), 1);

        let retry = StallingTarget {
            answered: AtomicBool::new(false),
        };
        let report = coordinator.confirm(&retry, &mut cache).await.unwrap();
        assert!(report.is_complete());
        assert_eq!(coordinator.state(), SyncState::Resolved(Resolution::Merged));
        assert!(cache.is_empty());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn bmi_result_follows_user_into_account() {
        let gateway = gateway().await;
        let anonymous = OwnerId::from(AnonymousId::generate());
        let mut cache = MemoryResultCache::new();

        let saved = gateway
            .save_result(
                &anonymous,
                "bmi",
                "BMI Calculator",
                &json!({"bmi": 24.2, "category": "Normal"}),
            )
            .await
            .unwrap();
        cache.insert(saved.clone());

        let mut coordinator = SyncCoordinator::new();
        assert_eq!(
            coordinator.observe_sign_in(&account(), &cache),
            SyncState::PendingConfirmation { pending: 1 }
        );

        let target = GatewayMergeTarget::new(gateway.clone());
        let report = coordinator.confirm(&target, &mut cache).await.unwrap();
        assert_eq!(report.merged, vec![saved.result_key.clone()]);
        assert_eq!(coordinator.state(), SyncState::Resolved(Resolution::Merged));
        assert!(cache.is_empty());

        let owned = gateway
            .list_results(&OwnerId::Account(account()), None)
            .await
            .unwrap();
        assert_eq!(owned.len(), 1);
        assert_eq!(owned[0].result_key, saved.result_key);
        assert_eq!(owned[0].data["category"], json!("Normal"));
        assert!(gateway.list_results(&anonymous, None).await.unwrap().is_empty());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn replaying_a_merge_creates_no_duplicates() {
        let gateway = gateway().await;
        let anonymous = OwnerId::from(AnonymousId::generate());
        let saved = gateway
            .save_result(&anonymous, "tdee", "TDEE", &json!({"kcal": 2500}))
            .await
            .unwrap();

        let target = GatewayMergeTarget::new(gateway.clone());
        let first = target.merge(&account(), &saved).await.unwrap();
        let second = target.merge(&account(), &saved).await.unwrap();
        assert_eq!(first.result_key, second.result_key);
        assert_eq!(first.created_at, second.created_at);

        let owned = gateway
            .list_results(&OwnerId::Account(account()), None)
            .await
            .unwrap();
        assert_eq!(owned.len(), 1);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn failed_records_stay_cached_and_pending() {
        let gateway = gateway().await;
        let anonymous = OwnerId::from(AnonymousId::generate());
        let mut cache = MemoryResultCache::new();
        for weight in [60, 70] {
            let saved = gateway
                .save_result(&anonymous, "bmi", "BMI", &json!({ "weight": weight }))
                .await
                .unwrap();
            cache.insert(saved);
        }

        let target = FlakyTarget {
            inner: GatewayMergeTarget::new(gateway.clone()),
            tripped: AtomicBool::new(false),
        };
        let mut coordinator = SyncCoordinator::new();
        coordinator.observe_sign_in(&account(), &cache);

        let report = coordinator.confirm(&target, &mut cache).await.unwrap();
        assert_eq!(report.merged.len(), 1);
        assert_eq!(report.failed.len(), 1);
        assert_eq!(
            coordinator.state(),
            SyncState::PendingConfirmation { pending: 1 }
        );
        assert_eq!(cache.len(), 1);

        let retry = coordinator.confirm(&target, &mut cache).await.unwrap();
        assert!(retry.is_complete());
        assert!(cache.is_empty());
        let owned = gateway
            .list_results(&OwnerId::Account(account()), None)
            .await
            .unwrap();
        assert_eq!(owned.len(), 2);
    }

    #[test]
    fn repeated_observation_in_one_session_is_ignored() {
        let mut cache = MemoryResultCache::new();
        let mut coordinator = SyncCoordinator::new();
        assert_eq!(coordinator.observe_sign_in(&account(), &cache), SyncState::Idle);

        cache.insert(cached("bmi-1"));
        assert_eq!(coordinator.observe_sign_in(&account(), &cache), SyncState::Idle);

        coordinator.sign_out();
        assert_eq!(
            coordinator.observe_sign_in(&account(), &cache),
            SyncState::PendingConfirmation { pending: 1 }
        );
    }

    #[test]
    fn dismiss_keeps_cache_and_stops_prompting() {
        let mut cache = MemoryResultCache::new();
        cache.insert(cached("bmi-1"));
        let mut coordinator = SyncCoordinator::new();
        coordinator.observe_sign_in(&account(), &cache);

        assert_eq!(
            coordinator.dismiss(),
            Ok(SyncState::Resolved(Resolution::Dismissed))
        );
        assert_eq!(cache.len(), 1);
        assert_eq!(
            coordinator.observe_sign_in(&account(), &cache),
            SyncState::Resolved(Resolution::Dismissed)
        );
        assert_eq!(coordinator.dismiss(), Err(SyncError::NotPending));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn confirm_requires_pending_state() {
        let gateway = gateway().await;
        let target = GatewayMergeTarget::new(gateway);
        let mut cache = MemoryResultCache::new();
        let mut coordinator = SyncCoordinator::new();
        let err = coordinator.confirm(&target, &mut cache).await.unwrap_err();
        assert_eq!(err, SyncError::NotPending);
    }
}
