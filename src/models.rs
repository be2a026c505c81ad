use chrono::NaiveDate;
use serde::Serialize;
use uuid::Uuid;

/// One weigh-in as the estimator sees it. Weight is in kilograms.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Observation {
    pub date: NaiveDate,
    pub weight: f64,
}

impl Observation {
    pub fn new(date: NaiveDate, weight: f64) -> Self {
        Self { date, weight }
    }

    pub fn is_valid(&self) -> bool {
        self.weight.is_finite() && self.weight > 0.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct TrendPoint {
    pub date: NaiveDate,
    pub observed_weight: f64,
    pub trend_weight: f64,
    pub trend_std: f64,
    pub lower95: f64,
    pub upper95: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Volatility {
    Low,
    Medium,
    High,
}

impl Volatility {
    pub fn as_str(&self) -> &'static str {
        match self {
            Volatility::Low => "low",
            Volatility::Medium => "medium",
            Volatility::High => "high",
        }
    }
}

impl std::fmt::Display for Volatility {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Parameters the estimator tuned from the data. Diagnostic only.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ModelParams {
    pub drift_per_day: f64,
    pub process_variance: f64,
    pub measurement_variance: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TrendResult {
    pub points: Vec<TrendPoint>,
    pub weekly_rate: f64,
    pub volatility: Volatility,
    pub params: ModelParams,
}

/// A stored weigh-in as returned by the observation store.
#[derive(Debug, Clone, PartialEq)]
pub struct ObservationRecord {
    pub id: Uuid,
    pub user_id: Uuid,
    pub measured_on: NaiveDate,
    pub weight_kg: f64,
}

impl ObservationRecord {
    pub fn observation(&self) -> Observation {
        Observation::new(self.measured_on, self.weight_kg)
    }
}

/// Materialized trend value for one observation.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TrendRow {
    pub observation_id: Uuid,
    pub user_id: Uuid,
    pub measured_on: NaiveDate,
    pub trend_weight: f64,
    pub trend_ci_lower: f64,
    pub trend_ci_upper: f64,
    pub trend_std: f64,
    pub model_version: i32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TrendStamp {
    pub observation_id: Uuid,
    pub model_version: i32,
}

/// Trend row joined with its source weigh-in, as consumed for display.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TrendView {
    pub measured_on: NaiveDate,
    pub weight_kg: f64,
    pub trend_weight: f64,
    pub trend_ci_lower: f64,
    pub trend_ci_upper: f64,
    pub trend_std: f64,
}

pub const KG_PER_LB: f64 = 0.453_592_37;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WeightUnit {
    #[default]
    Kg,
    Lb,
}

impl WeightUnit {
    pub fn to_kg(&self, value: f64) -> f64 {
        match self {
            WeightUnit::Kg => value,
            WeightUnit::Lb => value * KG_PER_LB,
        }
    }
}

impl std::str::FromStr for WeightUnit {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "" | "kg" | "kgs" => Ok(WeightUnit::Kg),
            "lb" | "lbs" => Ok(WeightUnit::Lb),
            other => Err(format!("unknown weight unit: {other}")),
        }
    }
}
