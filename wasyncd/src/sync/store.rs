use std::ops::Range;

use async_trait::async_trait;
use thiserror::Error;
use wasync_core::{CommunicationRecord, DataType, WireMessage, headers};

use super::retry::Retryable;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("transient mailbox failure: {0}")]
    Transient(String),
    #[error("mailbox operation timed out")]
    Timeout,
    #[error("mailbox rejected credentials: {0}")]
    Auth(String),
    #[error("mailbox failure: {0}")]
    Permanent(String),
}

impl Retryable for StoreError {
    fn is_transient(&self) -> bool {
        matches!(self, StoreError::Transient(_) | StoreError::Timeout)
    }
}

impl From<std::io::Error> for StoreError {
    fn from(err: std::io::Error) -> Self {
        use std::io::ErrorKind;
        match err.kind() {
            ErrorKind::TimedOut => StoreError::Timeout,
            ErrorKind::Interrupted | ErrorKind::WouldBlock | ErrorKind::ResourceBusy => {
                StoreError::Transient(err.to_string())
            }
            ErrorKind::PermissionDenied => StoreError::Auth(err.to_string()),
            _ => StoreError::Permanent(err.to_string()),
        }
    }
}

/// Header predicate understood by [`MailboxStore::search`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HeaderQuery {
    pub data_type: Option<DataType>,
    pub starred_only: bool,
    /// Only messages whose record timestamp is strictly later, in ms.
    pub after: Option<i64>,
    pub message_id: Option<String>,
}

impl HeaderQuery {
    pub fn for_type(data_type: DataType) -> Self {
        Self {
            data_type: Some(data_type),
            ..Self::default()
        }
    }

    pub fn after(mut self, checkpoint: Option<i64>) -> Self {
        self.after = checkpoint;
        self
    }

    pub fn starred_only(mut self, starred_only: bool) -> Self {
        self.starred_only = starred_only;
        self
    }

    pub fn matches(&self, message: &WireMessage) -> bool {
        if self.starred_only && !message.flags.flagged {
            return false;
        }
        if let Some(data_type) = self.data_type
            && message
                .header(headers::DATATYPE)
                .and_then(DataType::from_tag)
                != Some(data_type)
        {
            return false;
        }
        if let Some(after) = self.after {
            if !message.record_timestamp().is_some_and(|date| date > after) {
                return false;
            }
        }
        if let Some(id) = self.message_id.as_deref()
            && message.message_id() != Some(id)
        {
            return false;
        }
        true
    }
}

/// Remote message store holding one wire message per record.
#[async_trait]
pub trait MailboxStore: Send + Sync {
    /// Presents an access token. Called once per run before any other call.
    async fn authenticate(&self, access_token: &str) -> Result<(), StoreError>;

    /// Stores a message and returns its identifier. Appending a message
    /// whose identifier already exists replaces it.
    async fn append(&self, message: &WireMessage) -> Result<String, StoreError>;

    /// Messages matching `query`, in no particular order.
    async fn search(&self, query: &HeaderQuery) -> Result<Vec<WireMessage>, StoreError>;

    /// Messages by position in the store's own order.
    async fn fetch(&self, range: Range<usize>) -> Result<Vec<WireMessage>, StoreError>;
}

#[derive(Debug, Error)]
pub enum RecordStoreError {
    #[error("record store I/O failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("record store data is invalid: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Local records read for backup, ordered by timestamp.
#[async_trait]
pub trait RecordSource: Send + Sync {
    async fn count_after(
        &self,
        data_type: DataType,
        checkpoint: Option<i64>,
    ) -> Result<usize, RecordStoreError>;

    /// Up to `limit` records of `data_type` newer than `checkpoint`,
    /// oldest first.
    async fn records_after(
        &self,
        data_type: DataType,
        checkpoint: Option<i64>,
        limit: usize,
    ) -> Result<Vec<CommunicationRecord>, RecordStoreError>;
}

/// Local store receiving restored records.
#[async_trait]
pub trait RecordSink: Send + Sync {
    async fn write_records(&self, records: &[CommunicationRecord]) -> Result<(), RecordStoreError>;

    /// Rebuilds conversation threads once a restore has written everything.
    async fn update_threads(&self) -> Result<(), RecordStoreError> {
        Ok(())
    }
}
