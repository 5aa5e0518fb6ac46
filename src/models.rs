use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::DataError;

pub const FEATURE_COUNT: usize = 7;

/// Column order of every feature vector. Model artifacts must declare exactly this list.
pub const FEATURE_NAMES: [&str; FEATURE_COUNT] = [
    "downloads_delta_1d",
    "downloads_growth_1d",
    "downloads_mean_7d",
    "downloads_std_7d",
    "likes_delta_1d",
    "likes_growth_1d",
    "likes_mean_7d",
];

/// One row as delivered by an ingestion source, before validation.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawSnapshot {
    pub entity_id: Option<String>,
    pub observation_date: Option<NaiveDate>,
    pub downloads: Option<i64>,
    pub likes: Option<i64>,
    pub pipeline_tag: Option<String>,
    pub library_name: Option<String>,
    pub author: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
}

impl RawSnapshot {
    pub fn entity_key(&self) -> Option<&str> {
        self.entity_id
            .as_deref()
            .map(str::trim)
            .filter(|id| !id.is_empty())
    }

    pub fn validate(
        &self,
        ingested_at: DateTime<Utc>,
    ) -> Result<(EntityAttributes, Snapshot), DataError> {
        let entity_id = self
            .entity_key()
            .ok_or(DataError::MissingField { field: "entity_id" })?
            .to_string();
        let observation_date = self.observation_date.ok_or(DataError::MissingField {
            field: "observation_date",
        })?;
        let downloads = non_negative("downloads", self.downloads)?;
        let likes = non_negative("likes", self.likes)?;

        let attributes = EntityAttributes {
            entity_id: entity_id.clone(),
            pipeline_tag: self.pipeline_tag.clone(),
            library_name: self.library_name.clone(),
            author: self.author.clone(),
            tags: self.tags.clone(),
        };
        let snapshot = Snapshot {
            entity_id,
            observation_date,
            downloads,
            likes,
            ingested_at,
        };

        Ok((attributes, snapshot))
    }
}

fn non_negative(field: &'static str, value: Option<i64>) -> Result<i64, DataError> {
    match value {
        None => Err(DataError::MissingField { field }),
        Some(value) if value < 0 => Err(DataError::NegativeCounter { field, value }),
        Some(value) => Ok(value),
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntityAttributes {
    pub entity_id: String,
    pub pipeline_tag: Option<String>,
    pub library_name: Option<String>,
    pub author: Option<String>,
    pub tags: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Snapshot {
    pub entity_id: String,
    pub observation_date: NaiveDate,
    pub downloads: i64,
    pub likes: i64,
    pub ingested_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureVector {
    pub entity_id: String,
    pub observation_date: NaiveDate,
    pub downloads_delta_1d: f64,
    pub downloads_growth_1d: f64,
    pub downloads_mean_7d: f64,
    pub downloads_std_7d: f64,
    pub likes_delta_1d: f64,
    pub likes_growth_1d: f64,
    pub likes_mean_7d: f64,
}

impl FeatureVector {
    /// Values in `FEATURE_NAMES` order.
    pub fn values(&self) -> [f64; FEATURE_COUNT] {
        [
            self.downloads_delta_1d,
            self.downloads_growth_1d,
            self.downloads_mean_7d,
            self.downloads_std_7d,
            self.likes_delta_1d,
            self.likes_growth_1d,
            self.likes_mean_7d,
        ]
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrendLabel {
    Trending,
    NotTrending,
}

impl TrendLabel {
    pub fn as_str(&self) -> &'static str {
        match self {
            TrendLabel::Trending => "trending",
            TrendLabel::NotTrending => "not_trending",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ScoredRecord {
    pub entity_id: String,
    pub observation_date: NaiveDate,
    pub probability: f64,
    pub label: TrendLabel,
    pub features: FeatureVector,
    pub model_version: String,
}

#[derive(Debug, Clone)]
pub struct TrendRow {
    pub entity_id: String,
    pub pipeline_tag: Option<String>,
    pub probability: f64,
    pub label: String,
    pub downloads_yesterday: i64,
    pub growth_yesterday: f64,
}

#[derive(Debug, Clone)]
pub struct TaskSummary {
    pub pipeline_tag: String,
    pub scored: usize,
    pub trending: usize,
    pub avg_probability: f64,
}

/// Audit row for one pipeline invocation.
#[derive(Debug, Clone)]
pub struct RunLog {
    pub run_id: Uuid,
    pub observation_date: NaiveDate,
    pub status: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub fetched_count: i32,
    pub scored_count: i32,
    pub snapshot_count: i32,
    pub error_count: i32,
    pub log_message: Option<String>,
}
