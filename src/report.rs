use std::fmt::Write;

use chrono::{Duration, NaiveDate};

use crate::estimator::{volatility_for_std, SUMMARY_WINDOW};
use crate::models::{TrendView, Volatility};
use crate::tuning;

pub const DEFAULT_RATE_WINDOW_DAYS: i64 = 28;
const MAX_PROJECTION_DAYS: f64 = 3.0 * 365.0;

/// Least-squares slope of the trend over the trailing window, in kg/week.
pub fn best_fit_weekly_rate(views: &[TrendView], window_days: i64) -> f64 {
    let Some(last) = views.last() else {
        return 0.0;
    };
    // A window reaching past the calendar's range covers the whole series.
    let cutoff = Duration::try_days(window_days.max(1))
        .and_then(|span| last.measured_on.checked_sub_signed(span));
    let window: Vec<&TrendView> = views
        .iter()
        .filter(|v| cutoff.map_or(true, |cutoff| v.measured_on >= cutoff))
        .collect();
    if window.len() < 2 {
        return 0.0;
    }

    let origin = window[0].measured_on;
    let xs: Vec<f64> = window
        .iter()
        .map(|v| (v.measured_on - origin).num_days() as f64)
        .collect();
    let ys: Vec<f64> = window.iter().map(|v| v.trend_weight).collect();
    let ones = vec![1.0; xs.len()];

    tuning::weighted_slope(&xs, &ys, &ones)
        .map(|per_day| per_day * 7.0)
        .unwrap_or(0.0)
}

pub fn volatility_badge(views: &[TrendView]) -> Volatility {
    let recent = &views[views.len().saturating_sub(SUMMARY_WINDOW)..];
    let stds: Vec<f64> = recent.iter().map(|v| v.trend_std).collect();
    tuning::median(&stds)
        .map(volatility_for_std)
        .unwrap_or(Volatility::Low)
}

/// Day the trend reaches `goal_kg` if the weekly rate holds. `None` when the
/// rate is flat, heads away from the goal, or the date is too far out.
pub fn project_goal_date(
    last_day: NaiveDate,
    trend_weight: f64,
    weekly_rate: f64,
    goal_kg: f64,
) -> Option<NaiveDate> {
    let remaining = goal_kg - trend_weight;
    if remaining.abs() < 1e-9 {
        return Some(last_day);
    }

    let daily_rate = weekly_rate / 7.0;
    if !daily_rate.is_finite() || daily_rate.abs() < 1e-9 || remaining.signum() != daily_rate.signum() {
        return None;
    }

    let days = (remaining / daily_rate).ceil();
    if !days.is_finite() || days > MAX_PROJECTION_DAYS {
        return None;
    }
    Some(last_day + Duration::days(days as i64))
}

pub fn build_report(label: &str, views: &[TrendView], goal_kg: Option<f64>, window_days: i64) -> String {
    let mut output = String::new();

    let _ = writeln!(output, "# Weight Trend Report");
    let _ = writeln!(output, "Generated for {}", label);
    let _ = writeln!(output);

    let Some(latest) = views.last() else {
        let _ = writeln!(output, "No weigh-ins recorded yet.");
        return output;
    };

    let weekly_rate = best_fit_weekly_rate(views, window_days);
    let volatility = volatility_badge(views);

    let _ = writeln!(output, "## Current Trend");
    let _ = writeln!(
        output,
        "- Trend weight {:.1} kg on {} (95% interval {:.1} to {:.1})",
        latest.trend_weight, latest.measured_on, latest.trend_ci_lower, latest.trend_ci_upper
    );
    let _ = writeln!(
        output,
        "- Weekly rate {:+.2} kg over the last {} days",
        weekly_rate, window_days
    );
    let _ = writeln!(output, "- Volatility {}", volatility);

    if let Some(goal) = goal_kg {
        let _ = writeln!(output);
        let _ = writeln!(output, "## Goal");
        match project_goal_date(latest.measured_on, latest.trend_weight, weekly_rate, goal) {
            Some(date) => {
                let _ = writeln!(output, "- {:.1} kg projected for {}", goal, date);
            }
            None => {
                let _ = writeln!(output, "- {:.1} kg is not reachable at the current rate", goal);
            }
        }
    }

    let _ = writeln!(output);
    let _ = writeln!(output, "## Recent Weigh-ins");
    for view in views.iter().rev().take(7) {
        let _ = writeln!(
            output,
            "- {}: {:.1} kg (trend {:.1})",
            view.measured_on, view.weight_kg, view.trend_weight
        );
    }

    output
}

#[cfg(test)]
mod tests {
    use super::*;

    fn day(offset: i64) -> NaiveDate {
        NaiveDate::from_ymd_opt(2026, 3, 1).unwrap() + Duration::days(offset)
    }

    fn view(offset: i64, trend: f64, std: f64) -> TrendView {
        TrendView {
            measured_on: day(offset),
            weight_kg: trend + 0.3,
            trend_weight: trend,
            trend_ci_lower: trend - 1.96 * std,
            trend_ci_upper: trend + 1.96 * std,
            trend_std: std,
        }
    }

    fn linear(days: i64, per_day: f64, std: f64) -> Vec<TrendView> {
        (0..days).map(|d| view(d, 90.0 + per_day * d as f64, std)).collect()
    }

    #[test]
    fn weekly_rate_uses_trailing_window() {
        let mut views = linear(60, 0.1, 0.2);
        let start = views.last().unwrap().trend_weight;
        views.extend((1..=28).map(|d| view(59 + d, start - 0.05 * d as f64, 0.2)));

        let rate = best_fit_weekly_rate(&views, 27);
        assert!((rate + 0.35).abs() < 1e-9, "got {rate}");
    }

    #[test]
    fn weekly_rate_needs_two_points() {
        assert_eq!(best_fit_weekly_rate(&[], 28), 0.0);
        assert_eq!(best_fit_weekly_rate(&[view(0, 80.0, 0.3)], 28), 0.0);
    }

    #[test]
    fn oversized_window_covers_whole_history() {
        let views = linear(10, -0.2, 0.2);
        for window_days in [i64::MAX, 10_000_000_000, 1_000_000] {
            let rate = best_fit_weekly_rate(&views, window_days);
            assert!((rate + 1.4).abs() < 1e-9, "window {window_days}: got {rate}");
        }

        let pair = [view(0, 80.0, 0.3), view(7, 79.0, 0.3)];
        assert!((best_fit_weekly_rate(&pair, i64::MAX) + 1.0).abs() < 1e-9);

        let report = build_report("demo", &views, None, i64::MAX);
        assert!(report.contains("Weekly rate -1.40 kg"));
    }

    #[test]
    fn badge_reflects_recent_uncertainty() {
        assert_eq!(volatility_badge(&linear(20, 0.0, 0.2)), Volatility::Low);
        assert_eq!(volatility_badge(&linear(20, 0.0, 0.9)), Volatility::Medium);
        assert_eq!(volatility_badge(&linear(20, 0.0, 1.5)), Volatility::High);
        assert_eq!(volatility_badge(&[]), Volatility::Low);
    }

    #[test]
    fn projects_goal_in_direction_of_travel() {
        let date = project_goal_date(day(0), 90.0, -3.5, 85.0).unwrap();
        assert_eq!(date, day(10));
        assert_eq!(project_goal_date(day(0), 90.0, 0.5, 85.0), None);
        assert_eq!(project_goal_date(day(0), 90.0, 0.0, 85.0), None);
        assert_eq!(project_goal_date(day(0), 90.0, -0.001, 60.0), None);
        assert_eq!(project_goal_date(day(3), 85.0, 0.0, 85.0), Some(day(3)));
    }

    #[test]
    fn report_lists_trend_rate_and_goal() {
        let views = linear(30, -0.1, 0.2);
        let report = build_report("demo", &views, Some(80.0), DEFAULT_RATE_WINDOW_DAYS);

        assert!(report.contains("# Weight Trend Report"));
        assert!(report.contains("Trend weight 87.1 kg"));
        assert!(report.contains("Weekly rate -0.70 kg"));
        assert!(report.contains("Volatility low"));
        assert!(report.contains("80.0 kg projected for"));
        assert_eq!(report.matches("(trend ").count(), 7);
    }

    #[test]
    fn report_handles_empty_history() {
        let report = build_report("nobody", &[], None, DEFAULT_RATE_WINDOW_DAYS);
        assert!(report.contains("No weigh-ins recorded yet."));
    }
}
