use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use chrono::NaiveDate;
use uuid::Uuid;

use crate::error::{StoreError, StoreResult};
use crate::models::{ObservationRecord, TrendRow, TrendStamp, TrendView};

/// Storage the materializer reads weigh-ins from and writes trend rows to.
#[async_trait]
pub trait TrendStore: Send + Sync {
    /// Every weigh-in of the user, ascending by day.
    async fn load_observations(&self, user_id: Uuid) -> StoreResult<Vec<ObservationRecord>>;

    async fn load_trend_stamps(&self, user_id: Uuid) -> StoreResult<Vec<TrendStamp>>;

    /// Replaces the user's whole row set. Either all of `rows` become
    /// visible or the previous set is left as it was.
    async fn replace_trend_rows(&self, user_id: Uuid, rows: &[TrendRow]) -> StoreResult<()>;

    async fn delete_trend_rows(&self, user_id: Uuid) -> StoreResult<()>;

    async fn load_trend_view(&self, user_id: Uuid) -> StoreResult<Vec<TrendView>>;
}

#[async_trait]
impl<S: TrendStore + ?Sized> TrendStore for Arc<S> {
    async fn load_observations(&self, user_id: Uuid) -> StoreResult<Vec<ObservationRecord>> {
        (**self).load_observations(user_id).await
    }

    async fn load_trend_stamps(&self, user_id: Uuid) -> StoreResult<Vec<TrendStamp>> {
        (**self).load_trend_stamps(user_id).await
    }

    async fn replace_trend_rows(&self, user_id: Uuid, rows: &[TrendRow]) -> StoreResult<()> {
        (**self).replace_trend_rows(user_id, rows).await
    }

    async fn delete_trend_rows(&self, user_id: Uuid) -> StoreResult<()> {
        (**self).delete_trend_rows(user_id).await
    }

    async fn load_trend_view(&self, user_id: Uuid) -> StoreResult<Vec<TrendView>> {
        (**self).load_trend_view(user_id).await
    }
}

/// Process-local store used by the offline `estimate` command and by tests.
/// Writes can be made to fail on demand.
#[derive(Debug, Default)]
pub struct InMemoryStore {
    observations: Mutex<Vec<ObservationRecord>>,
    trend_rows: Mutex<HashMap<Uuid, TrendRow>>,
    fail_replace: AtomicBool,
    fail_delete: AtomicBool,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a weigh-in, replacing the weight if the user already has one
    /// on that day. Returns the observation id.
    pub fn record_observation(&self, user_id: Uuid, measured_on: NaiveDate, weight_kg: f64) -> Uuid {
        let mut observations = lock(&self.observations);
        if let Some(existing) = observations
            .iter_mut()
            .find(|obs| obs.user_id == user_id && obs.measured_on == measured_on)
        {
            existing.weight_kg = weight_kg;
            return existing.id;
        }

        let id = Uuid::new_v4();
        observations.push(ObservationRecord {
            id,
            user_id,
            measured_on,
            weight_kg,
        });
        id
    }

    pub fn remove_observation(&self, observation_id: Uuid) {
        lock(&self.observations).retain(|obs| obs.id != observation_id);
        lock(&self.trend_rows).remove(&observation_id);
    }

    pub fn users(&self) -> Vec<Uuid> {
        let mut users: Vec<Uuid> = lock(&self.observations).iter().map(|obs| obs.user_id).collect();
        users.sort();
        users.dedup();
        users
    }

    pub fn trend_rows(&self, user_id: Uuid) -> Vec<TrendRow> {
        let mut rows: Vec<TrendRow> = lock(&self.trend_rows)
            .values()
            .filter(|row| row.user_id == user_id)
            .cloned()
            .collect();
        rows.sort_by_key(|row| row.measured_on);
        rows
    }

    /// Writes a row directly, bypassing the estimator.
    pub fn put_trend_row(&self, row: TrendRow) {
        lock(&self.trend_rows).insert(row.observation_id, row);
    }

    pub fn fail_replace(&self, fail: bool) {
        self.fail_replace.store(fail, Ordering::SeqCst);
    }

    pub fn fail_delete(&self, fail: bool) {
        self.fail_delete.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl TrendStore for InMemoryStore {
    async fn load_observations(&self, user_id: Uuid) -> StoreResult<Vec<ObservationRecord>> {
        let mut records: Vec<ObservationRecord> = lock(&self.observations)
            .iter()
            .filter(|obs| obs.user_id == user_id)
            .cloned()
            .collect();
        records.sort_by(|a, b| a.measured_on.cmp(&b.measured_on).then(a.id.cmp(&b.id)));
        Ok(records)
    }

    async fn load_trend_stamps(&self, user_id: Uuid) -> StoreResult<Vec<TrendStamp>> {
        Ok(lock(&self.trend_rows)
            .values()
            .filter(|row| row.user_id == user_id)
            .map(|row| TrendStamp {
                observation_id: row.observation_id,
                model_version: row.model_version,
            })
            .collect())
    }

    async fn replace_trend_rows(&self, user_id: Uuid, rows: &[TrendRow]) -> StoreResult<()> {
        if self.fail_replace.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("replace rejected".to_string()));
        }
        let mut stored = lock(&self.trend_rows);
        stored.retain(|_, row| row.user_id != user_id);
        for row in rows {
            stored.insert(row.observation_id, row.clone());
        }
        Ok(())
    }

    async fn delete_trend_rows(&self, user_id: Uuid) -> StoreResult<()> {
        if self.fail_delete.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("delete rejected".to_string()));
        }
        lock(&self.trend_rows).retain(|_, row| row.user_id != user_id);
        Ok(())
    }

    async fn load_trend_view(&self, user_id: Uuid) -> StoreResult<Vec<TrendView>> {
        let observations = lock(&self.observations);
        let rows = lock(&self.trend_rows);
        let mut view: Vec<TrendView> = observations
            .iter()
            .filter(|obs| obs.user_id == user_id)
            .filter_map(|obs| {
                rows.get(&obs.id).map(|row| TrendView {
                    measured_on: obs.measured_on,
                    weight_kg: obs.weight_kg,
                    trend_weight: row.trend_weight,
                    trend_ci_lower: row.trend_ci_lower,
                    trend_ci_upper: row.trend_ci_upper,
                    trend_std: row.trend_std,
                })
            })
            .collect();
        view.sort_by_key(|row| row.measured_on);
        Ok(view)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn day(d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2025, 5, d).unwrap()
    }

    fn row_for(user_id: Uuid, observation_id: Uuid, version: i32) -> TrendRow {
        TrendRow {
            observation_id,
            user_id,
            measured_on: day(1),
            trend_weight: 80.0,
            trend_ci_lower: 79.0,
            trend_ci_upper: 81.0,
            trend_std: 0.5,
            model_version: version,
        }
    }

    #[tokio::test]
    async fn same_day_weigh_in_replaces_weight() {
        let store = InMemoryStore::new();
        let user = Uuid::new_v4();
        let first = store.record_observation(user, day(1), 80.0);
        let second = store.record_observation(user, day(1), 79.4);
        assert_eq!(first, second);

        let records = store.load_observations(user).await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].weight_kg, 79.4);
    }

    #[tokio::test]
    async fn observations_come_back_in_day_order() {
        let store = InMemoryStore::new();
        let user = Uuid::new_v4();
        store.record_observation(user, day(3), 80.0);
        store.record_observation(user, day(1), 81.0);
        store.record_observation(Uuid::new_v4(), day(2), 60.0);
        store.record_observation(user, day(2), 80.5);

        let days: Vec<NaiveDate> = store
            .load_observations(user)
            .await
            .unwrap()
            .iter()
            .map(|obs| obs.measured_on)
            .collect();
        assert_eq!(days, vec![day(1), day(2), day(3)]);
    }

    #[tokio::test]
    async fn failed_replace_keeps_previous_rows() {
        let store = InMemoryStore::new();
        let user = Uuid::new_v4();
        let obs = store.record_observation(user, day(1), 80.0);
        store.replace_trend_rows(user, &[row_for(user, obs, 1)]).await.unwrap();

        store.fail_replace(true);
        let result = store.replace_trend_rows(user, &[]).await;
        assert!(matches!(result, Err(StoreError::Unavailable(_))));
        assert_eq!(store.trend_rows(user).len(), 1);
    }

    #[tokio::test]
    async fn delete_only_touches_one_user() {
        let store = InMemoryStore::new();
        let (alice, bob) = (Uuid::new_v4(), Uuid::new_v4());
        let a = store.record_observation(alice, day(1), 61.0);
        let b = store.record_observation(bob, day(1), 90.0);
        store.put_trend_row(row_for(alice, a, 1));
        store.put_trend_row(row_for(bob, b, 1));

        store.delete_trend_rows(alice).await.unwrap();
        assert!(store.trend_rows(alice).is_empty());
        assert_eq!(store.trend_rows(bob).len(), 1);
    }

    #[tokio::test]
    async fn view_joins_rows_with_weigh_ins() {
        let store = InMemoryStore::new();
        let user = Uuid::new_v4();
        let obs = store.record_observation(user, day(1), 80.2);
        store.record_observation(user, day(2), 80.0);
        store.put_trend_row(row_for(user, obs, 1));

        let view = store.load_trend_view(user).await.unwrap();
        assert_eq!(view.len(), 1);
        assert_eq!(view[0].weight_kg, 80.2);
        assert_eq!(view[0].trend_weight, 80.0);
    }
}
