//! Data-driven tuning of the trend filter.
//!
//! Every function here expects observations that are already filtered to
//! valid weights and sorted ascending by date.

use crate::models::{ModelParams, Observation};

pub const DRIFT_HALF_LIFE_DAYS: f64 = 30.0;
pub const EWMA_TAU_DAYS: f64 = 7.0;
pub const DEFAULT_MEASUREMENT_STD: f64 = 0.9;
pub const DEFAULT_PROCESS_STD: f64 = 0.1;
pub const MEASUREMENT_STD_RANGE: (f64, f64) = (0.25, 3.5);
pub const PROCESS_STD_RANGE: (f64, f64) = (0.02, 0.6);
/// Process variance may not exceed this share of measurement variance.
pub const PROCESS_TO_MEASUREMENT_CAP: f64 = 0.35;
const MAD_SCALE: f64 = 1.4826;
const MIN_NOISE_SAMPLES: usize = 3;
const DENOMINATOR_EPSILON: f64 = 1e-12;

impl Default for ModelParams {
    fn default() -> Self {
        Self {
            drift_per_day: 0.0,
            process_variance: DEFAULT_PROCESS_STD * DEFAULT_PROCESS_STD,
            measurement_variance: DEFAULT_MEASUREMENT_STD * DEFAULT_MEASUREMENT_STD,
        }
    }
}

pub fn estimate_params(observations: &[Observation]) -> ModelParams {
    let drift_per_day = recency_weighted_drift(observations);
    let (measurement_variance, process_variance) = estimate_noise(observations, drift_per_day);
    ModelParams {
        drift_per_day,
        process_variance,
        measurement_variance,
    }
}

/// Days since the first observation.
pub fn day_offsets(observations: &[Observation]) -> Vec<f64> {
    let Some(first) = observations.first() else {
        return Vec::new();
    };
    observations
        .iter()
        .map(|obs| (obs.date - first.date).num_days() as f64)
        .collect()
}

/// Least-squares slope (kg/day) where each point is decayed by its age
/// relative to the latest observation.
pub fn recency_weighted_drift(observations: &[Observation]) -> f64 {
    if observations.len() < 2 {
        return 0.0;
    }

    let xs = day_offsets(observations);
    let ys: Vec<f64> = observations.iter().map(|obs| obs.weight).collect();
    let latest = xs.last().copied().unwrap_or(0.0);
    let weights: Vec<f64> = xs
        .iter()
        .map(|x| recency_weight(latest - x, DRIFT_HALF_LIFE_DAYS))
        .collect();

    weighted_slope(&xs, &ys, &weights).unwrap_or_else(|| unweighted_slope(observations))
}

pub fn unweighted_slope(observations: &[Observation]) -> f64 {
    if observations.len() < 2 {
        return 0.0;
    }
    let xs = day_offsets(observations);
    let ys: Vec<f64> = observations.iter().map(|obs| obs.weight).collect();
    let ones = vec![1.0; xs.len()];
    weighted_slope(&xs, &ys, &ones).unwrap_or(0.0)
}

pub fn recency_weight(age_days: f64, half_life_days: f64) -> f64 {
    if half_life_days <= 0.0 {
        return 1.0;
    }
    (-std::f64::consts::LN_2 * age_days.max(0.0) / half_life_days).exp()
}

/// Weighted least-squares slope, or `None` when the fit is degenerate.
pub(crate) fn weighted_slope(xs: &[f64], ys: &[f64], weights: &[f64]) -> Option<f64> {
    let total: f64 = weights.iter().sum();
    if !total.is_finite() || total <= DENOMINATOR_EPSILON {
        return None;
    }

    let mean_x = xs.iter().zip(weights).map(|(x, w)| x * w).sum::<f64>() / total;
    let mean_y = ys.iter().zip(weights).map(|(y, w)| y * w).sum::<f64>() / total;

    let mut covariance = 0.0;
    let mut spread = 0.0;
    for ((x, y), w) in xs.iter().zip(ys).zip(weights) {
        covariance += w * (x - mean_x) * (y - mean_y);
        spread += w * (x - mean_x) * (x - mean_x);
    }

    if !spread.is_finite() || spread <= DENOMINATOR_EPSILON {
        return None;
    }
    let slope = covariance / spread;
    slope.is_finite().then_some(slope)
}

/// Exponentially weighted moving average whose decay follows the gap
/// between observations.
pub fn ewma(observations: &[Observation], tau_days: f64) -> Vec<f64> {
    let mut smoothed = Vec::with_capacity(observations.len());
    let mut iter = observations.iter();
    let Some(first) = iter.next() else {
        return smoothed;
    };

    let mut level = first.weight;
    let mut previous = first.date;
    smoothed.push(level);

    for obs in iter {
        let gap = ((obs.date - previous).num_days() as f64).max(0.0);
        let alpha = if tau_days > 0.0 {
            1.0 - (-gap / tau_days).exp()
        } else {
            1.0
        };
        level += alpha * (obs.weight - level);
        previous = obs.date;
        smoothed.push(level);
    }

    smoothed
}

/// Returns `(measurement_variance, process_variance)`.
pub fn estimate_noise(observations: &[Observation], drift_per_day: f64) -> (f64, f64) {
    let defaults = ModelParams::default();
    if observations.len() < MIN_NOISE_SAMPLES {
        return (defaults.measurement_variance, defaults.process_variance);
    }

    let smoothed = ewma(observations, EWMA_TAU_DAYS);

    let measurement_residuals: Vec<f64> = observations
        .iter()
        .zip(&smoothed)
        .skip(1)
        .map(|(obs, level)| obs.weight - level)
        .collect();

    let mut process_residuals = Vec::with_capacity(observations.len());
    for i in 1..observations.len() {
        let gap = (observations[i].date - observations[i - 1].date).num_days() as f64;
        if gap <= 0.0 {
            continue;
        }
        let step = smoothed[i] - smoothed[i - 1] - drift_per_day * gap;
        process_residuals.push(step / gap.sqrt());
    }

    let measurement_std = robust_std(&measurement_residuals)
        .map(|std| clamp(std, MEASUREMENT_STD_RANGE))
        .unwrap_or(DEFAULT_MEASUREMENT_STD);
    let process_std = robust_std(&process_residuals)
        .map(|std| clamp(std, PROCESS_STD_RANGE))
        .unwrap_or(DEFAULT_PROCESS_STD);

    let measurement_variance = measurement_std * measurement_std;
    let process_variance =
        (process_std * process_std).min(PROCESS_TO_MEASUREMENT_CAP * measurement_variance);

    (measurement_variance, process_variance)
}

/// Median absolute deviation scaled to match a normal standard deviation.
pub fn robust_std(values: &[f64]) -> Option<f64> {
    let center = median(values)?;
    let deviations: Vec<f64> = values.iter().map(|v| (v - center).abs()).collect();
    let mad = median(&deviations)?;
    let std = mad * MAD_SCALE;
    std.is_finite().then_some(std)
}

pub fn median(values: &[f64]) -> Option<f64> {
    let mut sorted: Vec<f64> = values.iter().copied().filter(|v| v.is_finite()).collect();
    if sorted.is_empty() {
        return None;
    }
    sorted.sort_by(|a, b| a.total_cmp(b));
    let mid = sorted.len() / 2;
    if sorted.len() % 2 == 0 {
        Some((sorted[mid - 1] + sorted[mid]) / 2.0)
    } else {
        Some(sorted[mid])
    }
}

fn clamp(value: f64, (low, high): (f64, f64)) -> f64 {
    if value.is_nan() {
        return low;
    }
    value.clamp(low, high)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, NaiveDate};

    fn day(offset: i64) -> NaiveDate {
        NaiveDate::from_ymd_opt(2025, 1, 1).unwrap() + Duration::days(offset)
    }

    fn series(weights: &[f64]) -> Vec<Observation> {
        weights
            .iter()
            .enumerate()
            .map(|(i, w)| Observation::new(day(i as i64), *w))
            .collect()
    }

    #[test]
    fn median_handles_even_and_odd_lengths() {
        assert_eq!(median(&[3.0, 1.0, 2.0]), Some(2.0));
        assert_eq!(median(&[4.0, 1.0, 3.0, 2.0]), Some(2.5));
        assert_eq!(median(&[]), None);
        assert_eq!(median(&[f64::NAN]), None);
    }

    #[test]
    fn robust_std_ignores_single_outlier() {
        let values = [-1.0, -1.0, 0.0, 0.0, 1.0, 1.0, 100.0];
        let std = robust_std(&values).unwrap();
        assert!((std - 1.4826).abs() < 1e-9, "got {std}");
    }

    #[test]
    fn unweighted_slope_matches_linear_series() {
        let obs: Vec<Observation> = (0..10)
            .map(|i| Observation::new(day(i * 2), 90.0 - 0.1 * (i * 2) as f64))
            .collect();
        assert!((unweighted_slope(&obs) + 0.1).abs() < 1e-9);
    }

    #[test]
    fn drift_is_zero_below_two_points() {
        assert_eq!(recency_weighted_drift(&[]), 0.0);
        assert_eq!(recency_weighted_drift(&series(&[80.0])), 0.0);
    }

    #[test]
    fn drift_falls_back_when_all_on_one_day() {
        let obs = vec![
            Observation::new(day(0), 80.0),
            Observation::new(day(0), 81.0),
        ];
        assert_eq!(recency_weighted_drift(&obs), 0.0);
    }

    #[test]
    fn recency_weight_halves_each_half_life() {
        assert!((recency_weight(0.0, 30.0) - 1.0).abs() < 1e-12);
        assert!((recency_weight(30.0, 30.0) - 0.5).abs() < 1e-12);
        assert!((recency_weight(60.0, 30.0) - 0.25).abs() < 1e-12);
    }

    #[test]
    fn ewma_decay_tracks_gap_length() {
        let obs = vec![
            Observation::new(day(0), 80.0),
            Observation::new(day(1), 81.0),
            Observation::new(day(1), 90.0),
            Observation::new(day(100), 70.0),
        ];
        let smoothed = ewma(&obs, EWMA_TAU_DAYS);
        assert_eq!(smoothed[0], 80.0);
        let alpha = 1.0 - (-1.0f64 / 7.0).exp();
        assert!((smoothed[1] - (80.0 + alpha)).abs() < 1e-12);
        // zero gap leaves the level untouched
        assert_eq!(smoothed[2], smoothed[1]);
        assert!((smoothed[3] - 70.0).abs() < 1e-4);
    }

    #[test]
    fn short_history_uses_default_noise() {
        let (measurement, process) = estimate_noise(&series(&[80.0, 81.0]), 0.0);
        assert!((measurement - 0.81).abs() < 1e-12);
        assert!((process - 0.01).abs() < 1e-12);
    }

    #[test]
    fn flat_history_clamps_to_minimums() {
        let (measurement, process) = estimate_noise(&series(&[80.0; 20]), 0.0);
        assert!((measurement - 0.0625).abs() < 1e-12);
        assert!((process - 0.0004).abs() < 1e-12);
    }

    #[test]
    fn process_variance_is_capped_by_measurement_variance() {
        let weights: Vec<f64> = (0..40)
            .map(|i| if i % 2 == 0 { 75.0 } else { 85.0 })
            .collect();
        let (measurement, process) = estimate_noise(&series(&weights), 0.0);
        assert!(measurement <= 3.5 * 3.5 + 1e-12);
        assert!(process <= PROCESS_TO_MEASUREMENT_CAP * measurement + 1e-12);
        assert!(process <= 0.6 * 0.6 + 1e-12);
    }

    #[test]
    fn estimate_params_reports_linear_drift() {
        let weights: Vec<f64> = (0..60).map(|i| 90.0 - 0.05 * i as f64).collect();
        let params = estimate_params(&series(&weights));
        assert!((params.drift_per_day + 0.05).abs() < 1e-9);
        assert!(params.measurement_variance > 0.0);
        assert!(params.process_variance > 0.0);
    }
}
