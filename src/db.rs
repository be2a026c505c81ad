use std::path::Path;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{Duration, NaiveDate};
use sqlx::{PgPool, Row};
use uuid::Uuid;

use crate::error::StoreResult;
use crate::models::{ObservationRecord, TrendRow, TrendStamp, TrendView, WeightUnit};
use crate::store::TrendStore;

pub const DEMO_USER_ID: Uuid = Uuid::from_u128(0x6f1c_2a3e_8d4b_4c1a_9e7f_2b5d_0a6c_3e91);

pub async fn init_db(pool: &PgPool) -> anyhow::Result<()> {
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}

#[derive(Debug, Clone)]
pub struct PgTrendStore {
    pool: PgPool,
}

impl PgTrendStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

/// Key for `pg_advisory_xact_lock`, so concurrent replaces of one user queue up.
pub fn advisory_key(user_id: Uuid) -> i64 {
    let value = user_id.as_u128();
    ((value >> 64) as u64 ^ value as u64) as i64
}

#[async_trait]
impl TrendStore for PgTrendStore {
    async fn load_observations(&self, user_id: Uuid) -> StoreResult<Vec<ObservationRecord>> {
        let rows = sqlx::query(
            r#"
            SELECT id, user_id, measured_on, weight_kg
            FROM weight_trend.observations
            WHERE user_id = $1
            ORDER BY measured_on, id
            "#,
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| ObservationRecord {
                id: row.get("id"),
                user_id: row.get("user_id"),
                measured_on: row.get("measured_on"),
                weight_kg: row.get("weight_kg"),
            })
            .collect())
    }

    async fn load_trend_stamps(&self, user_id: Uuid) -> StoreResult<Vec<TrendStamp>> {
        let rows = sqlx::query(
            "SELECT observation_id, model_version FROM weight_trend.trend_rows WHERE user_id = $1",
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| TrendStamp {
                observation_id: row.get("observation_id"),
                model_version: row.get("model_version"),
            })
            .collect())
    }

    async fn replace_trend_rows(&self, user_id: Uuid, rows: &[TrendRow]) -> StoreResult<()> {
        let mut tx = self.pool.begin().await?;

        sqlx::query("SELECT pg_advisory_xact_lock($1)")
            .bind(advisory_key(user_id))
            .execute(&mut *tx)
            .await?;

        sqlx::query("DELETE FROM weight_trend.trend_rows WHERE user_id = $1")
            .bind(user_id)
            .execute(&mut *tx)
            .await?;

        if !rows.is_empty() {
            let observation_ids: Vec<Uuid> = rows.iter().map(|r| r.observation_id).collect();
            let user_ids: Vec<Uuid> = rows.iter().map(|r| r.user_id).collect();
            let days: Vec<NaiveDate> = rows.iter().map(|r| r.measured_on).collect();
            let trend_weights: Vec<f64> = rows.iter().map(|r| r.trend_weight).collect();
            let lowers: Vec<f64> = rows.iter().map(|r| r.trend_ci_lower).collect();
            let uppers: Vec<f64> = rows.iter().map(|r| r.trend_ci_upper).collect();
            let stds: Vec<f64> = rows.iter().map(|r| r.trend_std).collect();
            let versions: Vec<i32> = rows.iter().map(|r| r.model_version).collect();

            sqlx::query(
                r#"
                INSERT INTO weight_trend.trend_rows
                (observation_id, user_id, measured_on, trend_weight,
                 trend_ci_lower, trend_ci_upper, trend_std, model_version)
                SELECT * FROM UNNEST(
                    $1::uuid[], $2::uuid[], $3::date[], $4::float8[],
                    $5::float8[], $6::float8[], $7::float8[], $8::int4[]
                )
                "#,
            )
            .bind(observation_ids)
            .bind(user_ids)
            .bind(days)
            .bind(trend_weights)
            .bind(lowers)
            .bind(uppers)
            .bind(stds)
            .bind(versions)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    async fn delete_trend_rows(&self, user_id: Uuid) -> StoreResult<()> {
        sqlx::query("DELETE FROM weight_trend.trend_rows WHERE user_id = $1")
            .bind(user_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn load_trend_view(&self, user_id: Uuid) -> StoreResult<Vec<TrendView>> {
        let rows = sqlx::query(
            r#"
            SELECT o.measured_on, o.weight_kg, t.trend_weight,
                   t.trend_ci_lower, t.trend_ci_upper, t.trend_std
            FROM weight_trend.trend_rows t
            JOIN weight_trend.observations o ON o.id = t.observation_id
            WHERE t.user_id = $1
            ORDER BY o.measured_on, o.id
            "#,
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| TrendView {
                measured_on: row.get("measured_on"),
                weight_kg: row.get("weight_kg"),
                trend_weight: row.get("trend_weight"),
                trend_ci_lower: row.get("trend_ci_lower"),
                trend_ci_upper: row.get("trend_ci_upper"),
                trend_std: row.get("trend_std"),
            })
            .collect())
    }
}

/// Stores one weigh-in per user and day; a second weigh-in on the same day
/// overwrites the first.
pub async fn record_observation(
    pool: &PgPool,
    user_id: Uuid,
    measured_on: NaiveDate,
    weight_kg: f64,
) -> anyhow::Result<Uuid> {
    let id: Uuid = sqlx::query(
        r#"
        INSERT INTO weight_trend.observations (id, user_id, measured_on, weight_kg)
        VALUES ($1, $2, $3, $4)
        ON CONFLICT (user_id, measured_on) DO UPDATE
        SET weight_kg = EXCLUDED.weight_kg
        RETURNING id
        "#,
    )
    .bind(Uuid::new_v4())
    .bind(user_id)
    .bind(measured_on)
    .bind(weight_kg)
    .fetch_one(pool)
    .await
    .with_context(|| format!("failed to record weigh-in for {user_id} on {measured_on}"))?
    .get("id");

    Ok(id)
}

/// Deterministic demo history: a slow cut with a weekly water-weight wobble.
pub fn demo_history(start: NaiveDate, days: i64) -> Vec<(NaiveDate, f64)> {
    (0..days)
        .filter(|d| d % 9 != 4)
        .map(|d| {
            let wobble = ((d as f64) * 2.0 * std::f64::consts::PI / 7.0).sin() * 0.6;
            let weight = 92.0 - 0.06 * d as f64 + wobble;
            (start + Duration::days(d), (weight * 10.0).round() / 10.0)
        })
        .collect()
}

pub async fn seed(pool: &PgPool, today: NaiveDate) -> anyhow::Result<Uuid> {
    for (measured_on, weight_kg) in demo_history(today - Duration::days(119), 120) {
        sqlx::query(
            r#"
            INSERT INTO weight_trend.observations (id, user_id, measured_on, weight_kg)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (user_id, measured_on) DO NOTHING
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(DEMO_USER_ID)
        .bind(measured_on)
        .bind(weight_kg)
        .execute(pool)
        .await?;
    }

    Ok(DEMO_USER_ID)
}

#[derive(Debug, Clone, PartialEq)]
pub struct WeighIn {
    pub user_id: Uuid,
    pub measured_on: NaiveDate,
    pub weight_kg: f64,
}

#[derive(Debug, Default)]
pub struct ParsedWeighIns {
    pub weigh_ins: Vec<WeighIn>,
    pub skipped: usize,
}

impl ParsedWeighIns {
    pub fn users(&self) -> Vec<Uuid> {
        let mut users: Vec<Uuid> = self.weigh_ins.iter().map(|w| w.user_id).collect();
        users.sort();
        users.dedup();
        users
    }
}

/// Reads `user_id,measured_on,weight[,unit]`. Rows with an unparseable id,
/// date, unit or a weight that is not a positive finite number are counted
/// as skipped instead of failing the import.
pub fn read_weigh_ins(csv_path: &Path) -> anyhow::Result<ParsedWeighIns> {
    #[derive(serde::Deserialize)]
    struct CsvRow {
        user_id: String,
        measured_on: String,
        weight: String,
        #[serde(default)]
        unit: Option<String>,
    }

    let mut reader = csv::ReaderBuilder::new()
        .trim(csv::Trim::All)
        .flexible(true)
        .from_path(csv_path)
        .with_context(|| format!("failed to open {}", csv_path.display()))?;
    let mut parsed = ParsedWeighIns::default();

    for result in reader.deserialize::<CsvRow>() {
        let Ok(row) = result else {
            parsed.skipped += 1;
            continue;
        };
        let unit = row.unit.as_deref().unwrap_or("kg").parse::<WeightUnit>();
        let user_id = Uuid::parse_str(&row.user_id);
        let measured_on = NaiveDate::parse_from_str(&row.measured_on, "%Y-%m-%d");
        let weight = row.weight.parse::<f64>();

        match (user_id, measured_on, weight, unit) {
            (Ok(user_id), Ok(measured_on), Ok(weight), Ok(unit))
                if weight.is_finite() && weight > 0.0 =>
            {
                parsed.weigh_ins.push(WeighIn {
                    user_id,
                    measured_on,
                    weight_kg: unit.to_kg(weight),
                });
            }
            _ => parsed.skipped += 1,
        }
    }

    log::info!(
        "read {} weigh-ins from {}, skipped {} invalid",
        parsed.weigh_ins.len(),
        csv_path.display(),
        parsed.skipped
    );
    Ok(parsed)
}

pub async fn import_weigh_ins(pool: &PgPool, weigh_ins: &[WeighIn]) -> anyhow::Result<usize> {
    let mut written = 0usize;
    for weigh_in in weigh_ins {
        record_observation(pool, weigh_in.user_id, weigh_in.measured_on, weigh_in.weight_kg).await?;
        written += 1;
    }
    Ok(written)
}
