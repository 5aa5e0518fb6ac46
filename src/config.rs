use std::fmt::Display;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{bail, Context};

pub const DEFAULT_MODEL_PATH: &str = "models/trend_model.json";
pub const DEFAULT_THRESHOLD: f64 = 0.5;
pub const DEFAULT_CONCURRENCY: usize = 8;
pub const DEFAULT_STORE_TIMEOUT_SECS: u64 = 30;
pub const DEFAULT_INGEST_TIMEOUT_SECS: u64 = 120;
pub const DEFAULT_HUB_URL: &str = "https://huggingface.co/api/models";
pub const DEFAULT_FETCH_LIMIT: usize = 1000;

/// A pipeline tag and library pair fetched as its own registry query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HubTarget {
    pub pipeline_tag: String,
    pub library: String,
}

#[derive(Debug, Clone)]
pub struct HubConfig {
    pub base_url: String,
    pub token: Option<String>,
    pub fetch_limit: usize,
    pub targets: Vec<HubTarget>,
}

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub model_path: PathBuf,
    pub threshold: f64,
    pub concurrency: usize,
    pub store_timeout: Duration,
    pub ingest_timeout: Duration,
    pub hub: HubConfig,
}

impl PipelineConfig {
    /// Environment variables:
    /// - `TREND_MODEL_PATH` (default: models/trend_model.json)
    /// - `TREND_THRESHOLD` (default: 0.5)
    /// - `TREND_CONCURRENCY` (default: 8)
    /// - `STORE_TIMEOUT_SECS` (default: 30)
    /// - `INGEST_TIMEOUT_SECS` (default: 120)
    /// - `HF_API_URL`, `HF_TOKEN`, `HF_FETCH_LIMIT`
    /// - `HF_TARGETS`: comma separated `pipeline_tag:library` pairs (default: none)
    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> anyhow::Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let threshold: f64 = parse_or(&lookup, "TREND_THRESHOLD", DEFAULT_THRESHOLD)?;
        if !(0.0..=1.0).contains(&threshold) {
            bail!("TREND_THRESHOLD must be within [0, 1], got {threshold}");
        }

        let concurrency: usize = parse_or(&lookup, "TREND_CONCURRENCY", DEFAULT_CONCURRENCY)?;
        if concurrency == 0 {
            bail!("TREND_CONCURRENCY must be at least 1");
        }

        let store_timeout: u64 =
            parse_or(&lookup, "STORE_TIMEOUT_SECS", DEFAULT_STORE_TIMEOUT_SECS)?;
        let ingest_timeout: u64 =
            parse_or(&lookup, "INGEST_TIMEOUT_SECS", DEFAULT_INGEST_TIMEOUT_SECS)?;
        if store_timeout == 0 || ingest_timeout == 0 {
            bail!("timeouts must be greater than zero");
        }

        Ok(Self {
            model_path: lookup("TREND_MODEL_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from(DEFAULT_MODEL_PATH)),
            threshold,
            concurrency,
            store_timeout: Duration::from_secs(store_timeout),
            ingest_timeout: Duration::from_secs(ingest_timeout),
            hub: HubConfig {
                base_url: lookup("HF_API_URL").unwrap_or_else(|| DEFAULT_HUB_URL.to_string()),
                token: lookup("HF_TOKEN").filter(|token| !token.trim().is_empty()),
                fetch_limit: parse_or(&lookup, "HF_FETCH_LIMIT", DEFAULT_FETCH_LIMIT)?,
                targets: match lookup("HF_TARGETS") {
                    Some(raw) => parse_targets(&raw)?,
                    None => Vec::new(),
                },
            },
        })
    }
}

fn parse_or<F, T>(lookup: &F, key: &str, default: T) -> anyhow::Result<T>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
    T::Err: Display,
{
    match lookup(key) {
        None => Ok(default),
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|e: T::Err| anyhow::anyhow!("{e}"))
            .with_context(|| format!("invalid value for {key}: {raw:?}")),
    }
}

fn parse_targets(raw: &str) -> anyhow::Result<Vec<HubTarget>> {
    raw.split(',')
        .map(str::trim)
        .filter(|pair| !pair.is_empty())
        .map(|pair| match pair.split_once(':') {
            Some((tag, library)) if !tag.trim().is_empty() && !library.trim().is_empty() => {
                Ok(HubTarget {
                    pipeline_tag: tag.trim().to_string(),
                    library: library.trim().to_string(),
                })
            }
            _ => bail!("invalid HF_TARGETS entry {pair:?}, expected pipeline_tag:library"),
        })
        .collect()
}
