use chrono::{Duration, NaiveDate};

use crate::error::DataError;
use crate::models::{FeatureVector, Snapshot};

/// Trailing observations required for the rolling statistics, inclusive of the observation date.
pub const ROLLING_WINDOW: usize = 7;

/// Growth reported when the prior value is zero.
pub const ZERO_PRIOR_GROWTH: f64 = 0.0;

/// How far back the orchestrator reads history. Wider than the window so gaps
/// surface as gaps instead of as short histories.
pub const HISTORY_LOOKBACK_DAYS: i64 = (ROLLING_WINDOW as i64) * 2;

#[derive(Debug, Clone, PartialEq)]
pub enum FeatureOutcome {
    Ready(FeatureVector),
    InsufficientHistory { available: usize, required: usize },
}

/// Builds the momentum features for one entity.
///
/// `history` must be ascending by date and end on `observation_date`. Only the
/// trailing `ROLLING_WINDOW` snapshots are read; they must be consecutive days.
pub fn build_features(
    history: &[Snapshot],
    observation_date: NaiveDate,
) -> Result<FeatureOutcome, DataError> {
    check_ordering(history)?;

    let Some(last) = history.last() else {
        return Ok(FeatureOutcome::InsufficientHistory {
            available: 0,
            required: ROLLING_WINDOW,
        });
    };

    if last.observation_date > observation_date {
        return Err(DataError::FutureObservation {
            date: last.observation_date,
            observation_date,
        });
    }
    if last.observation_date < observation_date {
        return Err(DataError::StaleHistory {
            last: last.observation_date,
            observation_date,
        });
    }

    if history.len() < ROLLING_WINDOW {
        return Ok(FeatureOutcome::InsufficientHistory {
            available: history.len(),
            required: ROLLING_WINDOW,
        });
    }

    let window = &history[history.len() - ROLLING_WINDOW..];
    check_contiguous(window)?;

    let previous = &window[ROLLING_WINDOW - 2];
    let downloads: Vec<f64> = window.iter().map(|s| s.downloads as f64).collect();
    let likes: Vec<f64> = window.iter().map(|s| s.likes as f64).collect();
    let downloads_mean = mean(&downloads);

    Ok(FeatureOutcome::Ready(FeatureVector {
        entity_id: last.entity_id.clone(),
        observation_date,
        downloads_delta_1d: (last.downloads - previous.downloads) as f64,
        downloads_growth_1d: growth_rate(previous.downloads, last.downloads),
        downloads_mean_7d: downloads_mean,
        downloads_std_7d: population_std(&downloads, downloads_mean),
        likes_delta_1d: (last.likes - previous.likes) as f64,
        likes_growth_1d: growth_rate(previous.likes, last.likes),
        likes_mean_7d: mean(&likes),
    }))
}

pub fn growth_rate(previous: i64, current: i64) -> f64 {
    if previous > 0 {
        (current - previous) as f64 / previous as f64
    } else {
        ZERO_PRIOR_GROWTH
    }
}

fn check_ordering(history: &[Snapshot]) -> Result<(), DataError> {
    for pair in history.windows(2) {
        let (previous, next) = (pair[0].observation_date, pair[1].observation_date);
        if next == previous {
            return Err(DataError::DuplicateDate { date: next });
        }
        if next < previous {
            return Err(DataError::Unsorted { previous, next });
        }
    }
    Ok(())
}

fn check_contiguous(window: &[Snapshot]) -> Result<(), DataError> {
    let start = window[0].observation_date;
    for (offset, snapshot) in window.iter().enumerate() {
        let expected = start + Duration::days(offset as i64);
        if snapshot.observation_date != expected {
            return Err(DataError::NonContiguous {
                expected,
                found: snapshot.observation_date,
            });
        }
    }
    Ok(())
}

fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    values.iter().sum::<f64>() / values.len() as f64
}

fn population_std(values: &[f64], mean: f64) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    let variance =
        values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / values.len() as f64;
    variance.sqrt()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn day(offset: i64) -> NaiveDate {
        NaiveDate::from_ymd_opt(2026, 4, 1).unwrap() + Duration::days(offset)
    }

    fn history(downloads: &[i64]) -> Vec<Snapshot> {
        downloads
            .iter()
            .enumerate()
            .map(|(i, &value)| Snapshot {
                entity_id: "acme/vision-small".to_string(),
                observation_date: day(i as i64),
                downloads: value,
                likes: (i as i64) * 2,
                ingested_at: Utc::now(),
            })
            .collect()
    }

    fn ready(outcome: FeatureOutcome) -> FeatureVector {
        match outcome {
            FeatureOutcome::Ready(vector) => vector,
            other => panic!("expected features, got {other:?}"),
        }
    }

    #[test]
    fn computes_momentum_for_a_full_week() {
        let snapshots = history(&[100, 120, 150, 150, 200, 210, 300]);
        let vector = ready(build_features(&snapshots, day(6)).unwrap());

        assert_eq!(vector.entity_id, "acme/vision-small");
        assert_eq!(vector.observation_date, day(6));
        assert_eq!(vector.downloads_delta_1d, 90.0);
        assert!((vector.downloads_growth_1d - 0.428_571).abs() < 1e-4);
        assert!((vector.downloads_mean_7d - 175.714_285).abs() < 1e-4);
        assert!(vector.downloads_std_7d > 0.0);
        assert_eq!(vector.likes_delta_1d, 2.0);
        assert!((vector.likes_growth_1d - 0.2).abs() < 1e-9);
        assert!((vector.likes_mean_7d - 6.0).abs() < 1e-9);
    }

    #[test]
    fn only_the_trailing_window_is_used() {
        let snapshots = history(&[5_000, 9_000, 100, 120, 150, 150, 200, 210, 300]);
        let vector = ready(build_features(&snapshots, day(8)).unwrap());
        assert!((vector.downloads_mean_7d - 175.714_285).abs() < 1e-4);
    }

    #[test]
    fn short_histories_are_never_zero_filled() {
        for len in 0..ROLLING_WINDOW {
            let snapshots = history(&vec![10; len]);
            let date = if len == 0 { day(0) } else { day(len as i64 - 1) };
            assert_eq!(
                build_features(&snapshots, date).unwrap(),
                FeatureOutcome::InsufficientHistory {
                    available: len,
                    required: ROLLING_WINDOW
                }
            );
        }
        for len in ROLLING_WINDOW..ROLLING_WINDOW + 4 {
            let snapshots = history(&vec![10; len]);
            assert!(matches!(
                build_features(&snapshots, day(len as i64 - 1)).unwrap(),
                FeatureOutcome::Ready(_)
            ));
        }
    }

    #[test]
    fn zero_prior_growth_returns_sentinel() {
        let snapshots = history(&[0, 0, 0, 0, 0, 0, 25]);
        let vector = ready(build_features(&snapshots, day(6)).unwrap());
        assert_eq!(vector.downloads_delta_1d, 25.0);
        assert_eq!(vector.downloads_growth_1d, ZERO_PRIOR_GROWTH);
        assert_eq!(growth_rate(0, 0), ZERO_PRIOR_GROWTH);
        assert_eq!(growth_rate(50, 25), -0.5);
    }

    #[test]
    fn duplicate_dates_are_rejected() {
        let mut snapshots = history(&[1, 2, 3, 4, 5, 6, 7]);
        snapshots[3].observation_date = snapshots[2].observation_date;
        assert_eq!(
            build_features(&snapshots, day(6)).unwrap_err(),
            DataError::DuplicateDate { date: day(2) }
        );
    }

    #[test]
    fn unsorted_history_is_rejected() {
        let mut snapshots = history(&[1, 2, 3, 4, 5, 6, 7]);
        snapshots.swap(1, 2);
        assert!(matches!(
            build_features(&snapshots, day(6)),
            Err(DataError::Unsorted { .. })
        ));
    }

    #[test]
    fn gaps_inside_the_window_are_rejected() {
        let mut snapshots = history(&[1, 2, 3, 4, 5, 6, 7, 8]);
        snapshots.remove(4);
        let err = build_features(&snapshots, day(7)).unwrap_err();
        assert_eq!(
            err,
            DataError::NonContiguous {
                expected: day(4),
                found: day(5)
            }
        );
    }

    #[test]
    fn future_snapshots_are_leakage() {
        let snapshots = history(&[1, 2, 3, 4, 5, 6, 7, 8]);
        assert!(matches!(
            build_features(&snapshots, day(6)),
            Err(DataError::FutureObservation { .. })
        ));
    }

    #[test]
    fn history_must_reach_the_observation_date() {
        let snapshots = history(&[1, 2, 3, 4, 5, 6, 7]);
        assert_eq!(
            build_features(&snapshots, day(9)).unwrap_err(),
            DataError::StaleHistory {
                last: day(6),
                observation_date: day(9)
            }
        );
    }
}
