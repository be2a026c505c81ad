//! Keeps persisted trend rows in step with a user's weigh-ins.
//!
//! Rows are always rebuilt from the user's full history and written as one
//! set stamped with the engine's model version. A row set is stale when any
//! usable weigh-in lacks a row, or a row carries another model version.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use uuid::Uuid;

use crate::config::EngineConfig;
use crate::error::StoreResult;
use crate::estimator::compute_trend;
use crate::models::{ObservationRecord, TrendRow, TrendStamp, TrendView};
use crate::store::TrendStore;

type UserLock = Arc<tokio::sync::Mutex<()>>;

/// One async mutex per user, so two materializations of the same user in
/// this process run one after the other.
#[derive(Debug, Default)]
struct UserLocks {
    inner: Mutex<HashMap<Uuid, UserLock>>,
}

impl UserLocks {
    fn handle(&self, user_id: Uuid) -> UserLock {
        let mut locks = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        locks.retain(|_, lock| Arc::strong_count(lock) > 1);
        locks.entry(user_id).or_default().clone()
    }
}

pub struct TrendMaterializer<S> {
    store: S,
    config: EngineConfig,
    locks: UserLocks,
}

impl<S: TrendStore> TrendMaterializer<S> {
    pub fn new(store: S, config: EngineConfig) -> Self {
        Self {
            store,
            config,
            locks: UserLocks::default(),
        }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn model_version(&self) -> i32 {
        self.config.model_version
    }

    /// Rebuilds every trend row of the user. Returns the number of rows written.
    pub async fn recompute(&self, user_id: Uuid) -> StoreResult<usize> {
        let lock = self.locks.handle(user_id);
        let _guard = lock.lock().await;

        let records = self.store.load_observations(user_id).await?;
        self.write_rows(user_id, &records).await
    }

    /// Recomputes only when the persisted rows are stale. Returns whether a
    /// recompute happened.
    pub async fn ensure_fresh(&self, user_id: Uuid) -> StoreResult<bool> {
        let lock = self.locks.handle(user_id);
        let _guard = lock.lock().await;

        let records = self.store.load_observations(user_id).await?;
        let stamps = self.store.load_trend_stamps(user_id).await?;
        if !self.is_stale(&records, &stamps) {
            return Ok(false);
        }

        log::debug!("trend rows for {user_id} are stale, recomputing");
        self.write_rows(user_id, &records).await?;
        Ok(true)
    }

    /// Write-path refresh. Never fails: if the recompute errors, the user's
    /// rows are dropped so the next `ensure_fresh` rebuilds them, and the
    /// failure is logged.
    pub async fn refresh_best_effort(&self, user_id: Uuid) {
        let lock = self.locks.handle(user_id);
        let _guard = lock.lock().await;

        let refresh = match self.store.load_observations(user_id).await {
            Ok(records) => self.write_rows(user_id, &records).await,
            Err(err) => Err(err),
        };

        let err = match refresh {
            Ok(written) => {
                log::debug!("refreshed {written} trend rows for {user_id}");
                return;
            }
            Err(err) => err,
        };

        match self.store.delete_trend_rows(user_id).await {
            Ok(()) => log::warn!(
                "trend refresh for {user_id} failed ({err}); trend rows invalidated for rebuild on next read"
            ),
            Err(invalidate_err) => log::warn!(
                "trend refresh for {user_id} failed ({err}) and invalidating its trend rows also failed ({invalidate_err})"
            ),
        }
    }

    /// Fresh trend rows joined with their weigh-ins, oldest first.
    pub async fn trend_view(&self, user_id: Uuid) -> StoreResult<Vec<TrendView>> {
        self.ensure_fresh(user_id).await?;
        self.store.load_trend_view(user_id).await
    }

    pub fn is_stale(&self, records: &[ObservationRecord], stamps: &[TrendStamp]) -> bool {
        let versions: HashMap<Uuid, i32> = stamps
            .iter()
            .map(|stamp| (stamp.observation_id, stamp.model_version))
            .collect();

        let mut expected = 0usize;
        for record in records.iter().filter(|r| r.observation().is_valid()) {
            expected += 1;
            if versions.get(&record.id) != Some(&self.config.model_version) {
                return true;
            }
        }

        versions.len() != expected
    }

    /// Runs the estimator over `records` and maps every point back to the
    /// weigh-in it came from.
    pub fn build_rows(&self, user_id: Uuid, records: &[ObservationRecord]) -> Vec<TrendRow> {
        let mut usable: Vec<&ObservationRecord> = records
            .iter()
            .filter(|record| record.observation().is_valid())
            .collect();
        usable.sort_by_key(|record| record.measured_on);

        let observations: Vec<_> = usable.iter().map(|record| record.observation()).collect();
        let result = compute_trend(&observations);

        usable
            .iter()
            .zip(&result.points)
            .map(|(record, point)| TrendRow {
                observation_id: record.id,
                user_id,
                measured_on: point.date,
                trend_weight: point.trend_weight,
                trend_ci_lower: point.lower95,
                trend_ci_upper: point.upper95,
                trend_std: point.trend_std,
                model_version: self.config.model_version,
            })
            .collect()
    }

    async fn write_rows(&self, user_id: Uuid, records: &[ObservationRecord]) -> StoreResult<usize> {
        let rows = self.build_rows(user_id, records);
        self.store.replace_trend_rows(user_id, &rows).await?;
        log::info!(
            "materialized {} trend rows for {user_id} (model v{})",
            rows.len(),
            self.config.model_version
        );
        Ok(rows.len())
    }
}
