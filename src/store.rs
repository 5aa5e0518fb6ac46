use std::collections::HashMap;

use async_trait::async_trait;
use chrono::NaiveDate;
use uuid::Uuid;

use crate::error::StoreError;
use crate::models::{EntityAttributes, RunLog, ScoredRecord, Snapshot};

/// Everything one run writes, committed together or not at all.
#[derive(Debug, Clone)]
pub struct RunBatch {
    pub run_id: Uuid,
    pub observation_date: NaiveDate,
    pub entities: Vec<EntityAttributes>,
    pub snapshots: Vec<Snapshot>,
    pub scores: Vec<ScoredRecord>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PersistOutcome {
    pub snapshots_inserted: usize,
    pub scores_written: usize,
}

#[async_trait]
pub trait SnapshotStore: Send + Sync {
    async fn has_scores(&self, date: NaiveDate) -> Result<bool, StoreError>;

    /// True when a run for the date reached `completed`, even if it scored nothing.
    async fn has_completed_run(&self, date: NaiveDate) -> Result<bool, StoreError>;

    /// Returns false when another live run already holds the date.
    async fn try_claim_run(&self, date: NaiveDate, run_id: Uuid) -> Result<bool, StoreError>;

    async fn release_run(&self, date: NaiveDate, run_id: Uuid) -> Result<(), StoreError>;

    /// Effective snapshots (latest ingestion per day) in `[from, to]`, ascending by date.
    async fn load_history(
        &self,
        entity_ids: &[String],
        from: NaiveDate,
        to: NaiveDate,
    ) -> Result<HashMap<String, Vec<Snapshot>>, StoreError>;

    async fn persist_run(
        &self,
        batch: &RunBatch,
        overwrite: bool,
    ) -> Result<PersistOutcome, StoreError>;

    async fn record_run(&self, log: &RunLog) -> Result<(), StoreError>;
}

/// Keeps the newest ingestion of each (entity, date) and sorts by date.
pub fn effective_history(mut snapshots: Vec<Snapshot>) -> Vec<Snapshot> {
    snapshots.sort_by(|a, b| {
        a.observation_date
            .cmp(&b.observation_date)
            .then(b.ingested_at.cmp(&a.ingested_at))
    });
    snapshots.dedup_by(|later, earlier| later.observation_date == earlier.observation_date);
    snapshots
}

#[cfg(test)]
pub(crate) mod memory {
    use std::collections::{BTreeMap, HashSet};
    use std::sync::Mutex;
    use std::time::Duration;

    use super::*;

    #[derive(Debug, Default, Clone)]
    pub(crate) struct MemoryState {
        pub snapshots: Vec<Snapshot>,
        pub entities: BTreeMap<String, EntityAttributes>,
        pub scores: BTreeMap<(String, NaiveDate), ScoredRecord>,
        pub claims: HashMap<NaiveDate, Uuid>,
        pub logs: Vec<RunLog>,
    }

    /// In-process store for orchestrator tests, with switchable faults.
    #[derive(Default)]
    pub(crate) struct MemoryStore {
        pub state: Mutex<MemoryState>,
        pub unreachable: bool,
        pub persist_delay: Option<Duration>,
    }

    impl MemoryStore {
        pub(crate) fn seed(&self, snapshots: Vec<Snapshot>) {
            self.state.lock().unwrap().snapshots.extend(snapshots);
        }

        pub(crate) fn snapshot(&self) -> MemoryState {
            self.state.lock().unwrap().clone()
        }

        fn check(&self) -> Result<(), StoreError> {
            if self.unreachable {
                return Err(StoreError::Unavailable("connection refused".to_string()));
            }
            Ok(())
        }
    }

    #[async_trait]
    impl SnapshotStore for MemoryStore {
        async fn has_scores(&self, date: NaiveDate) -> Result<bool, StoreError> {
            self.check()?;
            let state = self.state.lock().unwrap();
            Ok(state.scores.keys().any(|(_, d)| *d == date))
        }

        async fn has_completed_run(&self, date: NaiveDate) -> Result<bool, StoreError> {
            self.check()?;
            let state = self.state.lock().unwrap();
            Ok(state
                .logs
                .iter()
                .any(|log| log.observation_date == date && log.status == "completed"))
        }

        async fn try_claim_run(&self, date: NaiveDate, run_id: Uuid) -> Result<bool, StoreError> {
            self.check()?;
            let mut state = self.state.lock().unwrap();
            match state.claims.get(&date) {
                Some(holder) if *holder != run_id => Ok(false),
                _ => {
                    state.claims.insert(date, run_id);
                    Ok(true)
                }
            }
        }

        async fn release_run(&self, date: NaiveDate, run_id: Uuid) -> Result<(), StoreError> {
            self.check()?;
            let mut state = self.state.lock().unwrap();
            if state.claims.get(&date) == Some(&run_id) {
                state.claims.remove(&date);
            }
            Ok(())
        }

        async fn load_history(
            &self,
            entity_ids: &[String],
            from: NaiveDate,
            to: NaiveDate,
        ) -> Result<HashMap<String, Vec<Snapshot>>, StoreError> {
            self.check()?;
            let wanted: HashSet<&String> = entity_ids.iter().collect();
            let state = self.state.lock().unwrap();
            let mut grouped: HashMap<String, Vec<Snapshot>> = HashMap::new();
            for snapshot in state.snapshots.iter().filter(|s| {
                wanted.contains(&s.entity_id)
                    && s.observation_date >= from
                    && s.observation_date <= to
            }) {
                grouped
                    .entry(snapshot.entity_id.clone())
                    .or_default()
                    .push(snapshot.clone());
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
            self.check()?;
            if let Some(delay) = self.persist_delay {
                tokio::time::sleep(delay).await;
            }

            let mut state = self.state.lock().unwrap();
            if !overwrite
                && batch
                    .scores
                    .iter()
                    .any(|s| state.scores.contains_key(&(s.entity_id.clone(), s.observation_date)))
            {
                return Err(StoreError::Conflict {
                    date: batch.observation_date,
                });
            }

            for entity in &batch.entities {
                state
                    .entities
                    .insert(entity.entity_id.clone(), entity.clone());
            }

            let mut snapshots_inserted = 0;
            for snapshot in &batch.snapshots {
                let exists = state.snapshots.iter().any(|s| {
                    s.entity_id == snapshot.entity_id
                        && s.observation_date == snapshot.observation_date
                        && s.downloads == snapshot.downloads
                        && s.likes == snapshot.likes
                });
                if !exists {
                    state.snapshots.push(snapshot.clone());
                    snapshots_inserted += 1;
                }
            }

            for score in &batch.scores {
                state.scores.insert(
                    (score.entity_id.clone(), score.observation_date),
                    score.clone(),
                );
            }

            Ok(PersistOutcome {
                snapshots_inserted,
                scores_written: batch.scores.len(),
            })
        }

        async fn record_run(&self, log: &RunLog) -> Result<(), StoreError> {
            self.check()?;
            self.state.lock().unwrap().logs.push(log.clone());
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, Utc};

    #[test]
    fn corrections_supersede_earlier_ingestions() {
        let date = NaiveDate::from_ymd_opt(2026, 6, 1).unwrap();
        let first = Utc::now() - Duration::hours(3);
        let correction = Utc::now();
        let row = |day: NaiveDate, downloads: i64, ingested_at| Snapshot {
            entity_id: "acme/audio-base".to_string(),
            observation_date: day,
            downloads,
            likes: 0,
            ingested_at,
        };

        let history = effective_history(vec![
            row(date + Duration::days(1), 40, first),
            row(date, 10, first),
            row(date, 12, correction),
        ]);

        assert_eq!(history.len(), 2);
        assert_eq!(history[0].downloads, 12);
        assert_eq!(history[1].observation_date, date + Duration::days(1));
    }
}
