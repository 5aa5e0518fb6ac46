use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use sqlx::types::Json;
use sqlx::{PgPool, Postgres, QueryBuilder, Row, Transaction};
use uuid::Uuid;

use crate::error::{DataError, StoreError};
use crate::ingest;
use crate::models::{EntityAttributes, RunLog, Snapshot, TrendRow};
use crate::store::{effective_history, PersistOutcome, RunBatch, SnapshotStore};

/// Rows per multi-row INSERT; keeps bind counts well under the Postgres limit.
pub const WRITE_BATCH_SIZE: usize = 500;

/// Claims older than this belong to a run that died without releasing them.
pub const CLAIM_TTL_HOURS: i32 = 6;

pub async fn init_db(pool: &PgPool) -> anyhow::Result<()> {
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}

#[derive(Debug, Default)]
pub struct ImportSummary {
    pub rows: usize,
    pub inserted: usize,
    pub rejected: Vec<(String, DataError)>,
}

#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Backfills history from a CSV export. Identical rows already stored are skipped.
    pub async fn import_csv(
        &self,
        csv_path: &std::path::Path,
        ingested_at: DateTime<Utc>,
    ) -> anyhow::Result<ImportSummary> {
        let rows = ingest::read_csv(csv_path)?;
        let mut summary = ImportSummary {
            rows: rows.len(),
            ..Default::default()
        };

        let mut entities: BTreeMap<String, EntityAttributes> = BTreeMap::new();
        let mut snapshots = Vec::new();
        for raw in rows {
            match raw.validate(ingested_at) {
                Ok((attributes, snapshot)) => {
                    entities.insert(attributes.entity_id.clone(), attributes);
                    snapshots.push(snapshot);
                }
                Err(err) => {
                    let key = raw.entity_key().unwrap_or("<unknown>").to_string();
                    summary.rejected.push((key, err));
                }
            }
        }

        let entities: Vec<EntityAttributes> = entities.into_values().collect();
        let mut tx = self.pool.begin().await?;
        upsert_entities(&mut tx, &entities).await?;
        summary.inserted = insert_snapshots(&mut tx, &snapshots).await?;
        tx.commit().await?;

        Ok(summary)
    }

    pub async fn fetch_trends(&self, date: NaiveDate) -> anyhow::Result<Vec<TrendRow>> {
        let rows = sqlx::query(
            r#"
            SELECT t.model_id, m.pipeline_tag, t.probability, t.label,
                   t.downloads_yesterday, t.growth_yesterday
            FROM model_momentum.daily_trends t
            LEFT JOIN model_momentum.models m ON m.model_id = t.model_id
            WHERE t.prediction_date = $1
            ORDER BY t.probability DESC, t.model_id
            "#,
        )
        .bind(date)
        .fetch_all(&self.pool)
        .await?;

        let mut trends = Vec::with_capacity(rows.len());
        for row in rows {
            trends.push(TrendRow {
                entity_id: row.get("model_id"),
                pipeline_tag: row.get("pipeline_tag"),
                probability: row.get("probability"),
                label: row.get("label"),
                downloads_yesterday: row.get("downloads_yesterday"),
                growth_yesterday: row.get("growth_yesterday"),
            });
        }

        Ok(trends)
    }
}

async fn upsert_entities(
    tx: &mut Transaction<'_, Postgres>,
    entities: &[EntityAttributes],
) -> Result<(), sqlx::Error> {
    for chunk in entities.chunks(WRITE_BATCH_SIZE) {
        let mut query = QueryBuilder::<Postgres>::new(
            "INSERT INTO model_momentum.models (model_id, pipeline_tag, library_name, author, tags) ",
        );
        query.push_values(chunk, |mut row, entity| {
            row.push_bind(entity.entity_id.clone())
                .push_bind(entity.pipeline_tag.clone())
                .push_bind(entity.library_name.clone())
                .push_bind(entity.author.clone())
                .push_bind(entity.tags.clone());
        });
        query.push(
            " ON CONFLICT (model_id) DO UPDATE \
             SET pipeline_tag = EXCLUDED.pipeline_tag, \
                 library_name = EXCLUDED.library_name, \
                 author = EXCLUDED.author, \
                 tags = EXCLUDED.tags, \
                 updated_at = now()",
        );
        query.build().execute(&mut **tx).await?;
    }
    Ok(())
}

async fn insert_snapshots(
    tx: &mut Transaction<'_, Postgres>,
    snapshots: &[Snapshot],
) -> Result<usize, sqlx::Error> {
    let mut inserted = 0usize;
    for chunk in snapshots.chunks(WRITE_BATCH_SIZE) {
        let mut query = QueryBuilder::<Postgres>::new(
            "INSERT INTO model_momentum.model_snapshots \
             (model_id, snapshot_date, downloads, likes, ingested_at) ",
        );
        query.push_values(chunk, |mut row, snapshot| {
            row.push_bind(snapshot.entity_id.clone())
                .push_bind(snapshot.observation_date)
                .push_bind(snapshot.downloads)
                .push_bind(snapshot.likes)
                .push_bind(snapshot.ingested_at);
        });
        query.push(" ON CONFLICT (model_id, snapshot_date, downloads, likes) DO NOTHING");
        let result = query.build().execute(&mut **tx).await?;
        inserted += result.rows_affected() as usize;
    }
    Ok(inserted)
}

fn conflict_or_database(err: sqlx::Error, date: NaiveDate) -> StoreError {
    match &err {
        sqlx::Error::Database(db) if db.is_unique_violation() => StoreError::Conflict { date },
        _ => StoreError::Database(err),
    }
}

fn unavailable_or_database(err: sqlx::Error) -> StoreError {
    match err {
        sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::Io(_) => {
            StoreError::Unavailable(err.to_string())
        }
        other => StoreError::Database(other),
    }
}

#[async_trait]
impl SnapshotStore for PgStore {
    async fn has_scores(&self, date: NaiveDate) -> Result<bool, StoreError> {
        let exists: bool = sqlx::query(
            "SELECT EXISTS (SELECT 1 FROM model_momentum.daily_trends WHERE prediction_date = $1)",
        )
        .bind(date)
        .fetch_one(&self.pool)
        .await
        .map_err(unavailable_or_database)?
        .get(0);
        Ok(exists)
    }

    async fn has_completed_run(&self, date: NaiveDate) -> Result<bool, StoreError> {
        let exists: bool = sqlx::query(
            r#"
            SELECT EXISTS (
                SELECT 1 FROM model_momentum.pipeline_log
                WHERE observation_date = $1 AND status = 'completed'
            )
            "#,
        )
        .bind(date)
        .fetch_one(&self.pool)
        .await
        .map_err(unavailable_or_database)?
        .get(0);
        Ok(exists)
    }

    async fn try_claim_run(&self, date: NaiveDate, run_id: Uuid) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r#"
            INSERT INTO model_momentum.pipeline_claims (observation_date, run_id, claimed_at)
            VALUES ($1, $2, now())
            ON CONFLICT (observation_date) DO UPDATE
            SET run_id = EXCLUDED.run_id, claimed_at = EXCLUDED.claimed_at
            WHERE pipeline_claims.claimed_at < now() - make_interval(hours => $3)
            "#,
        )
        .bind(date)
        .bind(run_id)
        .bind(CLAIM_TTL_HOURS)
        .execute(&self.pool)
        .await
        .map_err(unavailable_or_database)?;
        Ok(result.rows_affected() == 1)
    }

    async fn release_run(&self, date: NaiveDate, run_id: Uuid) -> Result<(), StoreError> {
        sqlx::query(
            "DELETE FROM model_momentum.pipeline_claims WHERE observation_date = $1 AND run_id = $2",
        )
        .bind(date)
        .bind(run_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn load_history(
        &self,
        entity_ids: &[String],
        from: NaiveDate,
        to: NaiveDate,
    ) -> Result<HashMap<String, Vec<Snapshot>>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT model_id, snapshot_date, downloads, likes, ingested_at
            FROM model_momentum.model_snapshots
            WHERE model_id = ANY($1) AND snapshot_date BETWEEN $2 AND $3
            "#,
        )
        .bind(entity_ids)
        .bind(from)
        .bind(to)
        .fetch_all(&self.pool)
        .await?;

        let mut grouped: HashMap<String, Vec<Snapshot>> = HashMap::new();
        for row in rows {
            let snapshot = Snapshot {
                entity_id: row.get("model_id"),
                observation_date: row.get("snapshot_date"),
                downloads: row.get("downloads"),
                likes: row.get("likes"),
                ingested_at: row.get("ingested_at"),
            };
            grouped
                .entry(snapshot.entity_id.clone())
                .or_default()
                .push(snapshot);
        }

        Ok(grouped
            .into_iter()
            .map(|(id, rows)| (id, effective_history(rows)))
            .collect())
    }

    async fn persist_run(
        &self,
        batch: &RunBatch,
        overwrite: bool,
    ) -> Result<PersistOutcome, StoreError> {
        let mut tx = self.pool.begin().await?;

        upsert_entities(&mut tx, &batch.entities).await?;
        let snapshots_inserted = insert_snapshots(&mut tx, &batch.snapshots).await?;

        let mut scores_written = 0usize;
        for chunk in batch.scores.chunks(WRITE_BATCH_SIZE) {
            let mut query = QueryBuilder::<Postgres>::new(
                "INSERT INTO model_momentum.daily_trends \
                 (model_id, prediction_date, probability, label, downloads_yesterday, \
                  growth_yesterday, features, model_version, run_id) ",
            );
            query.push_values(chunk, |mut row, score| {
                row.push_bind(score.entity_id.clone())
                    .push_bind(score.observation_date)
                    .push_bind(score.probability)
                    .push_bind(score.label.as_str())
                    .push_bind(score.features.downloads_delta_1d.round() as i64)
                    .push_bind(score.features.downloads_growth_1d)
                    .push_bind(Json(score.features.clone()))
                    .push_bind(score.model_version.clone())
                    .push_bind(batch.run_id);
            });
            if overwrite {
                query.push(
                    " ON CONFLICT (model_id, prediction_date) DO UPDATE \
                     SET probability = EXCLUDED.probability, \
                         label = EXCLUDED.label, \
                         downloads_yesterday = EXCLUDED.downloads_yesterday, \
                         growth_yesterday = EXCLUDED.growth_yesterday, \
                         features = EXCLUDED.features, \
                         model_version = EXCLUDED.model_version, \
                         run_id = EXCLUDED.run_id, \
                         created_at = now()",
                );
            }
            let result = query
                .build()
                .execute(&mut *tx)
                .await
                .map_err(|err| conflict_or_database(err, batch.observation_date))?;
            scores_written += result.rows_affected() as usize;
        }

        tx.commit().await?;

        Ok(PersistOutcome {
            snapshots_inserted,
            scores_written,
        })
    }

    async fn record_run(&self, log: &RunLog) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO model_momentum.pipeline_log
            (run_id, observation_date, status, started_at, finished_at,
             fetched_count, scored_count, snapshot_count, error_count, log_message)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            ON CONFLICT (run_id) DO UPDATE
            SET status = EXCLUDED.status,
                finished_at = EXCLUDED.finished_at,
                fetched_count = EXCLUDED.fetched_count,
                scored_count = EXCLUDED.scored_count,
                snapshot_count = EXCLUDED.snapshot_count,
                error_count = EXCLUDED.error_count,
                log_message = EXCLUDED.log_message
            "#,
        )
        .bind(log.run_id)
        .bind(log.observation_date)
        .bind(&log.status)
        .bind(log.started_at)
        .bind(log.finished_at)
        .bind(log.fetched_count)
        .bind(log.scored_count)
        .bind(log.snapshot_count)
        .bind(log.error_count)
        .bind(&log.log_message)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}
