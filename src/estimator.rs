//! Scalar Kalman filter over daily weigh-ins.
//!
//! The latent weight follows a random walk with drift; each weigh-in is the
//! latent weight plus scale noise. Drift and both noise variances are tuned
//! from the history itself (see [`crate::tuning`]).

use crate::models::{ModelParams, Observation, TrendPoint, TrendResult, Volatility};
use crate::tuning;

/// Two-sided 95% normal quantile.
pub const CI_Z: f64 = 1.96;
/// Gaps longer than this are treated as this long when growing uncertainty.
pub const MAX_GAP_DAYS: f64 = 14.0;
pub const VARIANCE_FLOOR: f64 = 1e-8;
pub const SUMMARY_WINDOW: usize = 14;
pub const LOW_VOLATILITY_MAX_STD: f64 = 0.5;
pub const MEDIUM_VOLATILITY_MAX_STD: f64 = 1.2;

pub fn compute_trend(observations: &[Observation]) -> TrendResult {
    let series = prepare(observations);
    if series.is_empty() {
        return TrendResult {
            points: Vec::new(),
            weekly_rate: 0.0,
            volatility: Volatility::Low,
            params: ModelParams::default(),
        };
    }

    let params = tuning::estimate_params(&series);
    let points = run_filter(&series, &params);
    log::debug!(
        "trend over {} weigh-ins: drift {:.4} kg/day, q {:.5}, r {:.4}",
        points.len(),
        params.drift_per_day,
        params.process_variance,
        params.measurement_variance
    );

    TrendResult {
        weekly_rate: weekly_rate(&points),
        volatility: classify_volatility(&points),
        points,
        params,
    }
}

/// Drops unusable weigh-ins and orders the rest by day. The sort is stable,
/// so weigh-ins sharing a day keep their input order.
pub fn prepare(observations: &[Observation]) -> Vec<Observation> {
    let mut series: Vec<Observation> = observations
        .iter()
        .copied()
        .filter(Observation::is_valid)
        .collect();
    series.sort_by_key(|obs| obs.date);
    series
}

pub fn run_filter(series: &[Observation], params: &ModelParams) -> Vec<TrendPoint> {
    let mut points = Vec::with_capacity(series.len());
    let Some(first) = series.first() else {
        return points;
    };

    let measurement_variance = params.measurement_variance.max(VARIANCE_FLOOR);
    let mut state_mean = first.weight;
    let mut state_variance = measurement_variance;
    let mut previous = first.date;
    points.push(trend_point(first, state_mean, state_variance));

    for obs in &series[1..] {
        let gap = ((obs.date - previous).num_days() as f64).clamp(0.0, MAX_GAP_DAYS);
        previous = obs.date;

        state_mean += params.drift_per_day * gap;
        state_variance += params.process_variance * gap;

        let residual = obs.weight - state_mean;
        let innovation_variance = state_variance + measurement_variance;
        let gain = if innovation_variance > 0.0 {
            state_variance / innovation_variance
        } else {
            0.0
        };

        state_mean += gain * residual;
        state_variance = ((1.0 - gain) * state_variance).max(VARIANCE_FLOOR);

        points.push(trend_point(obs, state_mean, state_variance));
    }

    points
}

fn trend_point(obs: &Observation, trend_weight: f64, variance: f64) -> TrendPoint {
    let trend_std = variance.max(0.0).sqrt();
    let half_width = CI_Z * trend_std;
    TrendPoint {
        date: obs.date,
        observed_weight: obs.weight,
        trend_weight,
        trend_std,
        lower95: trend_weight - half_width,
        upper95: trend_weight + half_width,
    }
}

fn summary_window(points: &[TrendPoint]) -> &[TrendPoint] {
    &points[points.len().saturating_sub(SUMMARY_WINDOW)..]
}

/// Average trend slope across the recent window, in kg per week.
pub fn weekly_rate(points: &[TrendPoint]) -> f64 {
    let window = summary_window(points);
    let (Some(first), Some(last)) = (window.first(), window.last()) else {
        return 0.0;
    };
    if window.len() < 2 {
        return 0.0;
    }

    let span_days = (last.date - first.date).num_days() as f64;
    if span_days <= 0.0 {
        return 0.0;
    }
    let rate = (last.trend_weight - first.trend_weight) / span_days * 7.0;
    if rate.is_finite() {
        rate
    } else {
        0.0
    }
}

pub fn classify_volatility(points: &[TrendPoint]) -> Volatility {
    let stds: Vec<f64> = summary_window(points).iter().map(|p| p.trend_std).collect();
    match tuning::median(&stds) {
        Some(std) => volatility_for_std(std),
        None => Volatility::Low,
    }
}

pub fn volatility_for_std(std: f64) -> Volatility {
    if std <= LOW_VOLATILITY_MAX_STD {
        Volatility::Low
    } else if std <= MEDIUM_VOLATILITY_MAX_STD {
        Volatility::Medium
    } else {
        Volatility::High
    }
}
