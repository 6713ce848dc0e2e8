//! Schedule record store: in memory, optionally mirrored to a JSON file.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, NaiveTime, Utc};
use tokio::sync::Mutex;

use super::ScheduleError;
use crate::domain::{GateDecision, ScheduleRecord};
use crate::ports::ScheduleStore;

/// Every mutation happens under one lock, and with a backing file the file is rewritten
/// before the lock is released. Check-and-set in `try_mark_run_start` is therefore atomic
/// for every gate sharing this store.
pub struct JsonScheduleStore {
    records: Mutex<HashMap<String, ScheduleRecord>>,
    path: Option<PathBuf>,
}

impl JsonScheduleStore {
    pub fn in_memory() -> Self {
        Self {
            records: Mutex::new(HashMap::new()),
            path: None,
        }
    }

    /// Load records from `path` (missing file means empty) and persist every change there.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, ScheduleError> {
        let path = path.as_ref().to_path_buf();
        let records: Vec<ScheduleRecord> = match tokio::fs::read(&path).await {
            Ok(bytes) => serde_json::from_slice(&bytes)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Vec::new(),
            Err(e) => return Err(e.into()),
        };
        Ok(Self {
            records: Mutex::new(
                records
                    .into_iter()
                    .map(|r| (r.task_name.clone(), r))
                    .collect(),
            ),
            path: Some(path),
        })
    }

    async fn persist(&self, records: &HashMap<String, ScheduleRecord>) -> Result<(), ScheduleError> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let mut rows: Vec<&ScheduleRecord> = records.values().collect();
        rows.sort_by(|a, b| a.task_name.cmp(&b.task_name));
        let tmp = path.with_extension("tmp");
        tokio::fs::write(&tmp, serde_json::to_vec_pretty(&rows)?).await?;
        tokio::fs::rename(&tmp, path).await?;
        Ok(())
    }
}

fn record_mut<'a>(
    records: &'a mut HashMap<String, ScheduleRecord>,
    task_name: &str,
) -> Result<&'a mut ScheduleRecord, ScheduleError> {
    records
        .get_mut(task_name)
        .ok_or_else(|| ScheduleError::NotFound(task_name.to_string()))
}

#[async_trait]
impl ScheduleStore for JsonScheduleStore {
    async fn get(&self, task_name: &str) -> Result<Option<ScheduleRecord>, ScheduleError> {
        Ok(self.records.lock().await.get(task_name).cloned())
    }

    async fn seed(&self, record: ScheduleRecord) -> Result<bool, ScheduleError> {
        let mut records = self.records.lock().await;
        if records.contains_key(&record.task_name) {
            return Ok(false);
        }
        records.insert(record.task_name.clone(), record);
        self.persist(&records).await?;
        Ok(true)
    }

    async fn upsert(&self, record: ScheduleRecord) -> Result<(), ScheduleError> {
        let mut records = self.records.lock().await;
        records.insert(record.task_name.clone(), record);
        self.persist(&records).await
    }

    async fn try_mark_run_start(
        &self,
        task_name: &str,
        now: DateTime<Utc>,
        local_time: NaiveTime,
    ) -> Result<GateDecision, ScheduleError> {
        let mut records = self.records.lock().await;
        let Some(record) = records.get_mut(task_name) else {
            return Ok(GateDecision::Missing);
        };
        let decision = record.evaluate(local_time);
        if decision.allows_run() {
            record.last_run_at = Some(now);
            self.persist(&records).await?;
        }
        Ok(decision)
    }

    async fn mark_run_start(&self, task_name: &str, now: DateTime<Utc>) -> Result<(), ScheduleError> {
        let mut records = self.records.lock().await;
        record_mut(&mut records, task_name)?.last_run_at = Some(now);
        self.persist(&records).await
    }

    async fn mark_run_complete(
        &self,
        task_name: &str,
        now: DateTime<Utc>,
    ) -> Result<(), ScheduleError> {
        let mut records = self.records.lock().await;
        record_mut(&mut records, task_name)?.last_run_completed_at = Some(now);
        self.persist(&records).await
    }
}
