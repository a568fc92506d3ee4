use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::debug;
use wasync_core::{CommunicationRecord, DataType, RecordDetails, message_digest};

use super::store::{RecordSink, RecordSource, RecordStoreError};

/// Local record store kept as a JSON array in one file.
pub struct JsonRecordFile {
    path: PathBuf,
    lock: Mutex<()>,
}

impl JsonRecordFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// All records in file order. A missing file holds no records.
    pub async fn load(&self) -> Result<Vec<CommunicationRecord>, RecordStoreError> {
        match tokio::fs::read(&self.path).await {
            Ok(bytes) if bytes.iter().all(u8::is_ascii_whitespace) => Ok(Vec::new()),
            Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
            Err(err) => Err(err.into()),
        }
    }

    async fn save(&self, records: &[CommunicationRecord]) -> Result<(), RecordStoreError> {
        if let Some(parent) = self.path.parent()
            && !parent.as_os_str().is_empty()
        {
            tokio::fs::create_dir_all(parent).await?;
        }
        let bytes = serde_json::to_vec(records)?;
        let tmp = self.path.with_extension("tmp");
        tokio::fs::write(&tmp, bytes).await?;
        tokio::fs::rename(&tmp, &self.path).await?;
        Ok(())
    }

    async fn pending(
        &self,
        data_type: DataType,
        checkpoint: Option<i64>,
    ) -> Result<Vec<CommunicationRecord>, RecordStoreError> {
        let mut records: Vec<_> = self
            .load()
            .await?
            .into_iter()
            .filter(|record| record.data_type() == data_type)
            .filter(|record| checkpoint.is_none_or(|checkpoint| record.timestamp > checkpoint))
            .collect();
        records.sort_by_key(|record| record.timestamp);
        Ok(records)
    }
}

#[async_trait]
impl RecordSource for JsonRecordFile {
    async fn count_after(
        &self,
        data_type: DataType,
        checkpoint: Option<i64>,
    ) -> Result<usize, RecordStoreError> {
        Ok(self.pending(data_type, checkpoint).await?.len())
    }

    async fn records_after(
        &self,
        data_type: DataType,
        checkpoint: Option<i64>,
        limit: usize,
    ) -> Result<Vec<CommunicationRecord>, RecordStoreError> {
        let mut records = self.pending(data_type, checkpoint).await?;
        records.truncate(limit);
        Ok(records)
    }
}

#[async_trait]
impl RecordSink for JsonRecordFile {
    /// Appends records that are not already present.
    async fn write_records(&self, records: &[CommunicationRecord]) -> Result<(), RecordStoreError> {
        let _guard = self.lock.lock().await;
        let mut existing = self.load().await?;
        let mut known: HashSet<String> = existing.iter().map(message_digest).collect();
        let mut next_id = existing.iter().filter_map(|record| record.id).max().unwrap_or(0) + 1;
        let mut used_ids: HashSet<i64> = existing.iter().filter_map(|record| record.id).collect();

        let mut written = 0usize;
        for record in records {
            if !known.insert(message_digest(record)) {
                continue;
            }
            let mut record = record.clone();
            if record.id.is_none_or(|id| used_ids.contains(&id)) {
                while used_ids.contains(&next_id) {
                    next_id += 1;
                }
                record.id = Some(next_id);
            }
            used_ids.extend(record.id);
            existing.push(record);
            written += 1;
        }
        self.save(&existing).await?;
        debug!(written, skipped = records.len() - written, "records written");
        Ok(())
    }

    /// Gives every message without a thread the thread of its address.
    async fn update_threads(&self) -> Result<(), RecordStoreError> {
        let _guard = self.lock.lock().await;
        let mut records = self.load().await?;
        let mut threads: HashMap<String, i64> = HashMap::new();
        for record in &records {
            if let Some(thread_id) = record.thread_id() {
                threads.entry(record.address.clone()).or_insert(thread_id);
            }
        }
        let mut next_thread = threads.values().copied().max().unwrap_or(0) + 1;
        let mut changed = false;
        for record in &mut records {
            let address = record.address.clone();
            if let RecordDetails::Sms(details) | RecordDetails::Mms(details) = &mut record.details
                && details.thread_id.is_none()
            {
                let thread_id = *threads.entry(address).or_insert_with(|| {
                    let id = next_thread;
                    next_thread += 1;
                    id
                });
                details.thread_id = Some(thread_id);
                changed = true;
            }
        }
        if changed {
            self.save(&records).await?;
        }
        Ok(())
    }
}
