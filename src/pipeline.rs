use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, NaiveDate, Utc};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::error::{DataError, FailureClass, PipelineError, SchemaError};
use crate::features::{build_features, FeatureOutcome, HISTORY_LOOKBACK_DAYS};
use crate::ingest::SnapshotSource;
use crate::models::{EntityAttributes, RawSnapshot, RunLog, ScoredRecord, Snapshot, TrendLabel};
use crate::scoring::{ScoringEngine, ScoringError};
use crate::state::{RunEvent, RunState, RunStateKind};
use crate::store::{RunBatch, SnapshotStore};

const UNKNOWN_ENTITY: &str = "<unknown>";

#[derive(Debug, Clone, Copy)]
pub struct RunOptions {
    pub observation_date: NaiveDate,
    pub dry_run: bool,
    pub overwrite: bool,
}

#[derive(Debug, Clone, Copy)]
pub struct PipelineSettings {
    pub concurrency: usize,
    pub store_timeout: Duration,
    pub ingest_timeout: Duration,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SkipReason {
    InsufficientHistory { available: usize, required: usize },
    Data(DataError),
}

impl SkipReason {
    pub fn kind(&self) -> &'static str {
        match self {
            SkipReason::InsufficientHistory { .. } => "insufficient_history",
            SkipReason::Data(err) => err.kind(),
        }
    }
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SkipReason::InsufficientHistory {
                available,
                required,
            } => write!(f, "insufficient history ({available} of {required} days)"),
            SkipReason::Data(err) => write!(f, "{err}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SkippedEntity {
    pub entity_id: String,
    pub reason: SkipReason,
}

#[derive(Debug, Clone)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub observation_date: NaiveDate,
    pub dry_run: bool,
    pub state: RunState,
    pub model_version: String,
    pub fetched: usize,
    pub scored: usize,
    pub trending: usize,
    pub snapshots_inserted: usize,
    pub scores_persisted: usize,
    pub skipped: Vec<SkippedEntity>,
}

impl RunSummary {
    pub fn skipped_by_reason(&self) -> BTreeMap<&'static str, usize> {
        let mut counts = BTreeMap::new();
        for skipped in &self.skipped {
            *counts.entry(skipped.reason.kind()).or_insert(0) += 1;
        }
        counts
    }
}

enum EntityOutcome {
    Scored(ScoredRecord),
    Skipped(SkippedEntity),
    Fatal(SchemaError),
}

struct Ingested {
    entities: Vec<EntityAttributes>,
    snapshots: Vec<Snapshot>,
}

/// Runs ingestion, feature building, scoring and persistence for one observation date.
pub struct Orchestrator {
    store: Arc<dyn SnapshotStore>,
    source: Arc<dyn SnapshotSource>,
    engine: ScoringEngine,
    settings: PipelineSettings,
    run_id: Uuid,
    state: RunState,
    claimed: Option<NaiveDate>,
}

impl Orchestrator {
    pub fn new(
        store: Arc<dyn SnapshotStore>,
        source: Arc<dyn SnapshotSource>,
        engine: ScoringEngine,
        settings: PipelineSettings,
    ) -> Self {
        Self {
            store,
            source,
            engine,
            settings,
            run_id: Uuid::new_v4(),
            state: RunState::NotStarted,
            claimed: None,
        }
    }

    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    pub fn state(&self) -> &RunState {
        &self.state
    }

    pub async fn run_once(&mut self, options: RunOptions) -> Result<RunSummary, PipelineError> {
        if self.state != RunState::NotStarted {
            return Err(PipelineError::InvalidTransition {
                from: self.state.kind(),
                to: RunStateKind::Ingesting,
            });
        }

        let started_at = Utc::now();
        let mut summary = RunSummary {
            run_id: self.run_id,
            observation_date: options.observation_date,
            dry_run: options.dry_run,
            state: RunState::NotStarted,
            model_version: self.engine.model_version().to_string(),
            fetched: 0,
            scored: 0,
            trending: 0,
            snapshots_inserted: 0,
            scores_persisted: 0,
            skipped: Vec::new(),
        };

        info!(
            run_id = %self.run_id,
            observation_date = %options.observation_date,
            dry_run = options.dry_run,
            overwrite = options.overwrite,
            source = self.source.name(),
            model_version = %summary.model_version,
            "starting trend run"
        );

        let result = self.execute(&options, started_at, &mut summary).await;

        if let Err(err) = &result {
            if let Ok(failed) = self.state.transition(RunEvent::Fail(err.to_string())) {
                self.state = failed;
            }
            error!(
                run_id = %self.run_id,
                observation_date = %options.observation_date,
                class = ?err.class(),
                error = %err,
                "trend run failed"
            );
        }
        summary.state = self.state.clone();

        self.release_claim().await;
        if !options.dry_run {
            let conflict = matches!(&result, Err(err) if err.class() == FailureClass::Conflict);
            if !conflict {
                self.record_audit(&summary, started_at, result.as_ref().err())
                    .await;
            }
        }

        result.map(|()| {
            info!(
                run_id = %self.run_id,
                scored = summary.scored,
                trending = summary.trending,
                skipped = summary.skipped.len(),
                snapshots_inserted = summary.snapshots_inserted,
                scores_persisted = summary.scores_persisted,
                "trend run completed"
            );
            summary
        })
    }

    async fn execute(
        &mut self,
        options: &RunOptions,
        ingested_at: DateTime<Utc>,
        summary: &mut RunSummary,
    ) -> Result<(), PipelineError> {
        let date = options.observation_date;

        if !options.dry_run {
            let scored = bounded(
                "score lookup",
                self.settings.store_timeout,
                self.store.has_scores(date),
            )
            .await?;
            let processed = scored
                || bounded(
                    "run lookup",
                    self.settings.store_timeout,
                    self.store.has_completed_run(date),
                )
                .await?;
            if processed && !options.overwrite {
                return Err(PipelineError::AlreadyProcessed { date });
            }

            let claimed = bounded(
                "run claim",
                self.settings.store_timeout,
                self.store.try_claim_run(date, self.run_id),
            )
            .await?;
            if !claimed {
                return Err(PipelineError::RunInProgress { date });
            }
            self.claimed = Some(date);
        }

        self.engine.ensure_compatible()?;

        self.advance(RunEvent::Begin)?;
        let raw = bounded(
            "ingestion",
            self.settings.ingest_timeout,
            self.source.fetch(date),
        )
        .await?;
        summary.fetched = raw.len();
        let ingested = validate_batch(raw, date, ingested_at, &mut summary.skipped);

        let entity_ids: Vec<String> = ingested
            .entities
            .iter()
            .map(|entity| entity.entity_id.clone())
            .collect();
        let stored = bounded(
            "history load",
            self.settings.store_timeout,
            self.store.load_history(
                &entity_ids,
                date - chrono::Duration::days(HISTORY_LOOKBACK_DAYS - 1),
                date - chrono::Duration::days(1),
            ),
        )
        .await?;

        self.advance(RunEvent::Transform)?;
        let histories = overlay_today(stored, &ingested.snapshots);
        let mut scored = self.transform(histories, date, &mut summary.skipped).await?;
        scored.sort_by(|a, b| a.entity_id.cmp(&b.entity_id));
        summary.skipped.sort_by(|a, b| a.entity_id.cmp(&b.entity_id));
        summary.scored = scored.len();
        summary.trending = scored
            .iter()
            .filter(|record| record.label == TrendLabel::Trending)
            .count();

        for skipped in &summary.skipped {
            warn!(
                run_id = %self.run_id,
                entity_id = %skipped.entity_id,
                reason = %skipped.reason,
                "entity skipped"
            );
        }

        self.advance(RunEvent::Persist)?;
        if options.dry_run {
            for record in &scored {
                info!(
                    entity_id = %record.entity_id,
                    probability = record.probability,
                    label = record.label.as_str(),
                    "dry run score"
                );
            }
            info!(run_id = %self.run_id, "dry run, nothing persisted");
        } else {
            let batch = RunBatch {
                run_id: self.run_id,
                observation_date: date,
                entities: ingested.entities,
                snapshots: ingested.snapshots,
                scores: scored,
            };
            let outcome = bounded(
                "persist",
                self.settings.store_timeout,
                self.store.persist_run(&batch, options.overwrite),
            )
            .await?;
            summary.snapshots_inserted = outcome.snapshots_inserted;
            summary.scores_persisted = outcome.scores_written;
        }

        self.advance(RunEvent::Complete)?;
        Ok(())
    }

    /// Builds and scores every entity on blocking workers, at most `concurrency` at once.
    async fn transform(
        &self,
        histories: Vec<(String, Vec<Snapshot>)>,
        date: NaiveDate,
        skipped: &mut Vec<SkippedEntity>,
    ) -> Result<Vec<ScoredRecord>, PipelineError> {
        let workers = self.settings.concurrency.max(1);
        let chunk_size = histories.len().div_ceil(workers).max(1);

        let mut tasks = JoinSet::new();
        let mut pending = histories;
        while !pending.is_empty() {
            let chunk: Vec<_> = pending.drain(..chunk_size.min(pending.len())).collect();
            let engine = self.engine.clone();
            tasks.spawn_blocking(move || {
                chunk
                    .into_iter()
                    .map(|(entity_id, history)| evaluate(&engine, entity_id, &history, date))
                    .collect::<Vec<_>>()
            });
        }

        let mut scored = Vec::new();
        while let Some(joined) = tasks.join_next().await {
            let outcomes = joined.map_err(|err| PipelineError::Worker(err.to_string()))?;
            for outcome in outcomes {
                match outcome {
                    EntityOutcome::Scored(record) => {
                        debug!(
                            entity_id = %record.entity_id,
                            probability = record.probability,
                            "entity scored"
                        );
                        scored.push(record);
                    }
                    EntityOutcome::Skipped(entity) => skipped.push(entity),
                    EntityOutcome::Fatal(err) => return Err(err.into()),
                }
            }
        }

        Ok(scored)
    }

    fn advance(&mut self, event: RunEvent) -> Result<(), PipelineError> {
        let next = self.state.transition(event)?;
        info!(run_id = %self.run_id, from = self.state.kind().as_str(), to = next.kind().as_str(), "run state changed");
        self.state = next;
        Ok(())
    }

    async fn release_claim(&mut self) {
        let Some(date) = self.claimed.take() else {
            return;
        };
        let released = bounded(
            "claim release",
            self.settings.store_timeout,
            self.store.release_run(date, self.run_id),
        )
        .await;
        if let Err(err) = released {
            warn!(run_id = %self.run_id, error = %err, "failed to release run claim");
        }
    }

    async fn record_audit(
        &self,
        summary: &RunSummary,
        started_at: DateTime<Utc>,
        failure: Option<&PipelineError>,
    ) {
        let log = RunLog {
            run_id: self.run_id,
            observation_date: summary.observation_date,
            status: summary.state.kind().as_str().to_string(),
            started_at,
            finished_at: Some(Utc::now()),
            fetched_count: summary.fetched as i32,
            scored_count: summary.scores_persisted as i32,
            snapshot_count: summary.snapshots_inserted as i32,
            error_count: summary.skipped.len() as i32,
            log_message: Some(match failure {
                Some(err) => err.to_string(),
                None => "success".to_string(),
            }),
        };
        let recorded = bounded(
            "audit log",
            self.settings.store_timeout,
            self.store.record_run(&log),
        )
        .await;
        if let Err(err) = recorded {
            warn!(run_id = %self.run_id, error = %err, "failed to record run audit log");
        }
    }
}

async fn bounded<T, E, F>(
    operation: &'static str,
    limit: Duration,
    future: F,
) -> Result<T, PipelineError>
where
    F: Future<Output = Result<T, E>>,
    PipelineError: From<E>,
{
    match tokio::time::timeout(limit, future).await {
        Ok(result) => result.map_err(PipelineError::from),
        Err(_) => Err(PipelineError::Timeout {
            operation,
            seconds: limit.as_secs(),
        }),
    }
}

/// Validates today's raw rows. An entity with any invalid or conflicting row is rejected whole.
fn validate_batch(
    raw: Vec<RawSnapshot>,
    date: NaiveDate,
    ingested_at: DateTime<Utc>,
    skipped: &mut Vec<SkippedEntity>,
) -> Ingested {
    let mut accepted: BTreeMap<String, (EntityAttributes, Snapshot)> = BTreeMap::new();
    let mut rejected: BTreeMap<String, DataError> = BTreeMap::new();

    for row in raw {
        let Some(key) = row.entity_key().map(str::to_string) else {
            let reason = row
                .validate(ingested_at)
                .err()
                .unwrap_or(DataError::MissingField { field: "entity_id" });
            skipped.push(SkippedEntity {
                entity_id: UNKNOWN_ENTITY.to_string(),
                reason: SkipReason::Data(reason),
            });
            continue;
        };
        if rejected.contains_key(&key) {
            continue;
        }

        let checked = row.validate(ingested_at).and_then(|(attributes, snapshot)| {
            match snapshot.observation_date {
                d if d > date => Err(DataError::FutureObservation {
                    date: d,
                    observation_date: date,
                }),
                d if d < date => Err(DataError::StaleHistory {
                    last: d,
                    observation_date: date,
                }),
                _ => Ok((attributes, snapshot)),
            }
        });

        match checked {
            Err(err) => {
                accepted.remove(&key);
                rejected.insert(key, err);
            }
            Ok((attributes, snapshot)) => match accepted.get(&key) {
                Some((_, existing))
                    if existing.downloads == snapshot.downloads
                        && existing.likes == snapshot.likes => {}
                Some(_) => {
                    accepted.remove(&key);
                    rejected.insert(key, DataError::DuplicateDate { date });
                }
                None => {
                    accepted.insert(key, (attributes, snapshot));
                }
            },
        }
    }

    skipped.extend(rejected.into_iter().map(|(entity_id, err)| SkippedEntity {
        entity_id,
        reason: SkipReason::Data(err),
    }));

    let (entities, snapshots) = accepted.into_values().unzip();
    Ingested {
        entities,
        snapshots,
    }
}

/// Appends today's snapshot to each entity's stored history.
fn overlay_today(
    mut stored: HashMap<String, Vec<Snapshot>>,
    today: &[Snapshot],
) -> Vec<(String, Vec<Snapshot>)> {
    today
        .iter()
        .map(|snapshot| {
            let mut history = stored.remove(&snapshot.entity_id).unwrap_or_default();
            history.retain(|s| s.observation_date < snapshot.observation_date);
            history.push(snapshot.clone());
            (snapshot.entity_id.clone(), history)
        })
        .collect()
}

fn evaluate(
    engine: &ScoringEngine,
    entity_id: String,
    history: &[Snapshot],
    date: NaiveDate,
) -> EntityOutcome {
    let features = match build_features(history, date) {
        Ok(FeatureOutcome::Ready(features)) => features,
        Ok(FeatureOutcome::InsufficientHistory {
            available,
            required,
        }) => {
            return EntityOutcome::Skipped(SkippedEntity {
                entity_id,
                reason: SkipReason::InsufficientHistory {
                    available,
                    required,
                },
            })
        }
        Err(err) => {
            return EntityOutcome::Skipped(SkippedEntity {
                entity_id,
                reason: SkipReason::Data(err),
            })
        }
    };

    match engine.score(features) {
        Ok(record) => EntityOutcome::Scored(record),
        Err(ScoringError::Schema(err)) => EntityOutcome::Fatal(err),
        Err(ScoringError::Data(err)) => EntityOutcome::Skipped(SkippedEntity {
            entity_id,
            reason: SkipReason::Data(err),
        }),
    }
}
