use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use chrono::NaiveDate;
use serde::Deserialize;
use tracing::{info, warn};

use crate::config::{HubConfig, HubTarget};
use crate::error::SourceError;
use crate::models::RawSnapshot;

/// Produces today's raw snapshots for the current universe of entities.
#[async_trait]
pub trait SnapshotSource: Send + Sync {
    fn name(&self) -> &str;

    async fn fetch(&self, date: NaiveDate) -> Result<Vec<RawSnapshot>, SourceError>;
}

#[derive(Debug, Deserialize)]
struct CsvRow {
    entity_id: Option<String>,
    #[serde(default, deserialize_with = "csv::invalid_option")]
    observation_date: Option<NaiveDate>,
    #[serde(default, deserialize_with = "csv::invalid_option")]
    downloads: Option<i64>,
    #[serde(default, deserialize_with = "csv::invalid_option")]
    likes: Option<i64>,
    #[serde(default)]
    pipeline_tag: Option<String>,
    #[serde(default)]
    library_name: Option<String>,
    #[serde(default)]
    author: Option<String>,
    #[serde(default)]
    tags: Option<String>,
}

impl From<CsvRow> for RawSnapshot {
    fn from(row: CsvRow) -> Self {
        RawSnapshot {
            entity_id: row.entity_id,
            observation_date: row.observation_date,
            downloads: row.downloads,
            likes: row.likes,
            pipeline_tag: row.pipeline_tag.filter(|v| !v.is_empty()),
            library_name: row.library_name.filter(|v| !v.is_empty()),
            author: row.author.filter(|v| !v.is_empty()),
            tags: row
                .tags
                .map(|tags| {
                    tags.split(';')
                        .map(str::trim)
                        .filter(|tag| !tag.is_empty())
                        .map(str::to_string)
                        .collect()
                })
                .unwrap_or_default(),
        }
    }
}

/// Reads a snapshot export. Cells that fail to parse come back as missing values.
pub fn read_csv(path: &Path) -> Result<Vec<RawSnapshot>, SourceError> {
    let file = std::fs::File::open(path)?;
    let mut reader = csv::Reader::from_reader(file);
    let mut rows = Vec::new();
    for result in reader.deserialize::<CsvRow>() {
        rows.push(result?.into());
    }
    Ok(rows)
}

pub struct CsvSource {
    path: PathBuf,
}

impl CsvSource {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }
}

#[async_trait]
impl SnapshotSource for CsvSource {
    fn name(&self) -> &str {
        "csv"
    }

    async fn fetch(&self, date: NaiveDate) -> Result<Vec<RawSnapshot>, SourceError> {
        let path = self.path.clone();
        let rows = tokio::task::spawn_blocking(move || read_csv(&path))
            .await
            .map_err(|err| SourceError::Unavailable(format!("csv reader task failed: {err}")))??;
        // Rows without a date stay in so validation reports them.
        Ok(rows
            .into_iter()
            .filter(|row| row.observation_date.map_or(true, |d| d == date))
            .collect())
    }
}

#[derive(Debug, Clone, Deserialize)]
struct HubModel {
    id: Option<String>,
    #[serde(rename = "modelId")]
    model_id: Option<String>,
    downloads: Option<i64>,
    likes: Option<i64>,
    pipeline_tag: Option<String>,
    library_name: Option<String>,
    author: Option<String>,
    #[serde(default)]
    tags: Vec<String>,
    #[serde(default)]
    private: bool,
}

impl HubModel {
    fn into_raw(self, date: NaiveDate) -> RawSnapshot {
        RawSnapshot {
            entity_id: self.id.or(self.model_id),
            observation_date: Some(date),
            downloads: self.downloads,
            likes: self.likes,
            pipeline_tag: self.pipeline_tag,
            library_name: self.library_name,
            author: self.author,
            tags: self.tags,
        }
    }
}

/// Sort keys fetched in order: global popularity, community favourites,
/// short-term momentum, then fresh uploads.
const HUB_PHASES: [(&str, Option<usize>); 4] = [
    ("downloads", None),
    ("likes", None),
    ("likes7d", None),
    ("createdAt", Some(100)),
];

/// Per-target result cap and request timeout for targeted fetches.
const TARGET_FETCH_LIMIT: usize = 200;
const TARGET_TIMEOUT: Duration = Duration::from_secs(25);

fn phase_query(sort: &str, limit: usize) -> Vec<(&'static str, String)> {
    vec![
        ("limit", limit.to_string()),
        ("sort", sort.to_string()),
        ("direction", "-1".to_string()),
        ("full", "true".to_string()),
    ]
}

fn target_query(target: &HubTarget) -> Vec<(&'static str, String)> {
    vec![
        ("pipeline_tag", target.pipeline_tag.clone()),
        ("library", target.library.clone()),
        ("limit", TARGET_FETCH_LIMIT.to_string()),
        ("sort", "downloads".to_string()),
        ("full", "true".to_string()),
    ]
}

pub struct HubSource {
    client: reqwest::Client,
    config: HubConfig,
}

impl HubSource {
    pub fn new(config: HubConfig, timeout: Duration) -> Result<Self, SourceError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self { client, config })
    }

    async fn fetch_models(
        &self,
        query: &[(&'static str, String)],
        timeout: Option<Duration>,
    ) -> Result<Vec<HubModel>, SourceError> {
        let mut request = self.client.get(&self.config.base_url).query(query);
        if let Some(timeout) = timeout {
            request = request.timeout(timeout);
        }
        if let Some(token) = &self.config.token {
            request = request.bearer_auth(token);
        }

        let models = request
            .send()
            .await?
            .error_for_status()?
            .json::<Vec<HubModel>>()
            .await?;
        Ok(models)
    }
}

#[async_trait]
impl SnapshotSource for HubSource {
    fn name(&self) -> &str {
        "hub"
    }

    async fn fetch(&self, date: NaiveDate) -> Result<Vec<RawSnapshot>, SourceError> {
        let mut phases = Vec::new();
        let mut failures = 0;

        for (sort, limit) in HUB_PHASES {
            let limit = limit.unwrap_or(self.config.fetch_limit);
            match self.fetch_models(&phase_query(sort, limit), None).await {
                Ok(models) => {
                    info!(sort, fetched = models.len(), "registry phase complete");
                    phases.push(models);
                }
                Err(err) => {
                    failures += 1;
                    warn!(sort, error = %err, "registry phase failed, continuing");
                }
            }
        }

        if failures == HUB_PHASES.len() {
            return Err(SourceError::Unavailable(
                "every registry fetch phase failed".to_string(),
            ));
        }

        for target in &self.config.targets {
            let (tag, library) = (target.pipeline_tag.as_str(), target.library.as_str());
            match self
                .fetch_models(&target_query(target), Some(TARGET_TIMEOUT))
                .await
            {
                Ok(models) => {
                    info!(tag, library, fetched = models.len(), "targeted fetch complete");
                    phases.push(models);
                }
                Err(err) => warn!(tag, library, error = %err, "targeted fetch failed, skipping"),
            }
        }

        Ok(merge_phases(phases, date))
    }
}

/// De-duplicates models across phases; later phases refresh earlier entries.
/// Private models are dropped. Models with no id are kept so they get reported.
fn merge_phases(phases: Vec<Vec<HubModel>>, date: NaiveDate) -> Vec<RawSnapshot> {
    let mut unique: BTreeMap<String, RawSnapshot> = BTreeMap::new();
    let mut anonymous = Vec::new();

    for model in phases.into_iter().flatten().filter(|m| !m.private) {
        let raw = model.into_raw(date);
        match raw.entity_key().map(str::to_string) {
            Some(key) => {
                unique.insert(key, raw);
            }
            None => anonymous.push(raw),
        }
    }

    unique.into_values().chain(anonymous).collect()
}
