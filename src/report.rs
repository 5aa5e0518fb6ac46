use std::collections::HashMap;
use std::fmt::Write;

use chrono::NaiveDate;

use crate::models::{TaskSummary, TrendLabel, TrendRow};

const UNTAGGED: &str = "untagged";

pub fn summarize_by_task(trends: &[TrendRow]) -> Vec<TaskSummary> {
    let mut map: HashMap<String, (usize, usize, f64)> = HashMap::new();

    for trend in trends {
        let task = trend
            .pipeline_tag
            .clone()
            .unwrap_or_else(|| UNTAGGED.to_string());
        let entry = map.entry(task).or_insert((0, 0, 0.0));
        entry.0 += 1;
        if trend.label == TrendLabel::Trending.as_str() {
            entry.1 += 1;
        }
        entry.2 += trend.probability;
    }

    let mut summaries: Vec<TaskSummary> = map
        .into_iter()
        .map(|(pipeline_tag, (scored, trending, total_probability))| TaskSummary {
            pipeline_tag,
            scored,
            trending,
            avg_probability: if scored == 0 {
                0.0
            } else {
                total_probability / scored as f64
            },
        })
        .collect();

    summaries.sort_by(|a, b| {
        b.trending
            .cmp(&a.trending)
            .then(b.scored.cmp(&a.scored))
            .then(a.pipeline_tag.cmp(&b.pipeline_tag))
    });
    summaries
}

/// Renders the day's predictions. `trends` is expected in descending probability order.
pub fn build_report(date: NaiveDate, limit: usize, trends: &[TrendRow]) -> String {
    let summaries = summarize_by_task(trends);
    let trending: Vec<&TrendRow> = trends
        .iter()
        .filter(|t| t.label == TrendLabel::Trending.as_str())
        .collect();

    let mut output = String::new();

    let _ = writeln!(output, "# Model Momentum Report");
    let _ = writeln!(
        output,
        "Predictions for {} ({} models scored, {} trending)",
        date,
        trends.len(),
        trending.len()
    );
    let _ = writeln!(output);
    let _ = writeln!(output, "## Task Mix");

    if summaries.is_empty() {
        let _ = writeln!(output, "No predictions recorded for this date.");
    } else {
        for summary in summaries.iter() {
            let _ = writeln!(
                output,
                "- {}: {} trending of {} (avg probability {:.2})",
                summary.pipeline_tag, summary.trending, summary.scored, summary.avg_probability
            );
        }
    }

    let _ = writeln!(output);
    let _ = writeln!(output, "## Models About To Trend");

    if trending.is_empty() {
        let _ = writeln!(output, "No models crossed the trending threshold.");
    } else {
        for trend in trending.iter().take(limit) {
            let _ = writeln!(
                output,
                "- {} ({}) p={:.2}, {:+} downloads ({:+.1}%)",
                trend.entity_id,
                trend.pipeline_tag.as_deref().unwrap_or(UNTAGGED),
                trend.probability,
                trend.downloads_yesterday,
                trend.growth_yesterday * 100.0
            );
        }
    }

    let mut movers = trends.to_vec();
    movers.sort_by(|a, b| {
        b.downloads_yesterday
            .cmp(&a.downloads_yesterday)
            .then(a.entity_id.cmp(&b.entity_id))
    });
    let _ = writeln!(output);
    let _ = writeln!(output, "## Biggest Download Movers");

    if movers.is_empty() {
        let _ = writeln!(output, "No predictions recorded for this date.");
    } else {
        for trend in movers.iter().take(5) {
            let _ = writeln!(
                output,
                "- {}: {} downloads in a day ({})",
                trend.entity_id, trend.downloads_yesterday, trend.label
            );
        }
    }

    output
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(id: &str, task: Option<&str>, probability: f64, label: TrendLabel, delta: i64) -> TrendRow {
        TrendRow {
            entity_id: id.to_string(),
            pipeline_tag: task.map(str::to_string),
            probability,
            label: label.as_str().to_string(),
            downloads_yesterday: delta,
            growth_yesterday: 0.25,
        }
    }

    fn rows() -> Vec<TrendRow> {
        vec![
            row("acme/llm-7b", Some("text-generation"), 0.91, TrendLabel::Trending, 4000),
            row("acme/llm-1b", Some("text-generation"), 0.62, TrendLabel::Trending, 900),
            row("lab/asr-small", Some("automatic-speech-recognition"), 0.40, TrendLabel::NotTrending, 12000),
            row("solo/mystery", None, 0.10, TrendLabel::NotTrending, 3),
        ]
    }

    #[test]
    fn tasks_are_ranked_by_trending_count() {
        let summaries = summarize_by_task(&rows());
        assert_eq!(summaries.len(), 3);
        assert_eq!(summaries[0].pipeline_tag, "text-generation");
        assert_eq!(summaries[0].scored, 2);
        assert_eq!(summaries[0].trending, 2);
        assert!((summaries[0].avg_probability - 0.765).abs() < 1e-9);
        assert_eq!(summaries[1].pipeline_tag, "automatic-speech-recognition");
        assert_eq!(summaries[2].pipeline_tag, UNTAGGED);
    }

    #[test]
    fn report_lists_trending_models_up_to_limit() {
        let date = NaiveDate::from_ymd_opt(2026, 9, 2).unwrap();
        let report = build_report(date, 1, &rows());

        assert!(report.starts_with("# Model Momentum Report"));
        assert!(report.contains("Predictions for 2026-09-02 (4 models scored, 2 trending)"));
        assert!(report.contains("- acme/llm-7b (text-generation) p=0.91, +4000 downloads (+25.0%)"));
        assert!(!report.contains("- acme/llm-1b (text-generation)"));
        assert!(report.contains("- lab/asr-small: 12000 downloads in a day (not_trending)"));
    }

    #[test]
    fn falling_downloads_keep_their_sign() {
        let date = NaiveDate::from_ymd_opt(2026, 9, 2).unwrap();
        let report = build_report(
            date,
            5,
            &[row("acme/fading", Some("fill-mask"), 0.7, TrendLabel::Trending, -30)],
        );
        assert!(report.contains("- acme/fading (fill-mask) p=0.70, -30 downloads (+25.0%)"));
        assert!(!report.contains("+-30"));
    }

    #[test]
    fn empty_day_renders_placeholders() {
        let date = NaiveDate::from_ymd_opt(2026, 9, 2).unwrap();
        let report = build_report(date, 10, &[]);
        assert!(report.contains("No predictions recorded for this date."));
        assert!(report.contains("No models crossed the trending threshold."));
    }
}
