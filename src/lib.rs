//! Denoised body-weight trends from daily weigh-ins.
//!
//! [`estimator::compute_trend`] turns a weigh-in history into a trend line
//! with 95% bands. [`materializer::TrendMaterializer`] persists those values
//! per weigh-in through a [`store::TrendStore`] and keeps them fresh.

pub mod config;
pub mod db;
pub mod error;
pub mod estimator;
pub mod materializer;
pub mod models;
pub mod report;
pub mod store;
pub mod tuning;

pub use config::{EngineConfig, TREND_MODEL_VERSION};
pub use error::{StoreError, StoreResult};
pub use estimator::compute_trend;
pub use materializer::TrendMaterializer;
pub use models::{Observation, TrendPoint, TrendResult, Volatility};
pub use store::{InMemoryStore, TrendStore};
