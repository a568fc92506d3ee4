use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use thiserror::Error;
use wasync_core::{DataType, MarkAsReadPolicy};

use crate::sync::retry::{Backoff, RetryPolicy};

const DEFAULT_MAX_RETRIES: i64 = 3;
const DEFAULT_IO_TIMEOUT_SECS: u64 = 30;
const DEFAULT_BATCH_SIZE: usize = 100;
const DEFAULT_DATA_TYPES: [DataType; 2] = [DataType::Sms, DataType::CallLog];
const STATE_DIR_NAME: &str = "wasync";
const BACKUP_CHECKPOINT_FILENAME: &str = "backup-checkpoints.json";
const RESTORE_CHECKPOINT_FILENAME: &str = "restore-checkpoints.json";

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("at least one data type must be enabled")]
    NoDataTypes,
    #[error("max retries must not be negative, got {0}")]
    NegativeRetries(i64),
    #[error("invalid value for {name}: {value:?}")]
    InvalidValue { name: &'static str, value: String },
    #[error("{0} is not set")]
    Missing(&'static str),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FilterPolicy {
    /// Restore only messages flagged in the mailbox.
    pub starred_only: bool,
    /// Hard ceiling on records handled by one run.
    pub max_items_per_run: Option<usize>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncKind {
    Backup,
    Restore,
}

/// Validated settings for one backup or restore run.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    kind: SyncKind,
    max_retries: u32,
    data_types: BTreeSet<DataType>,
    filter: FilterPolicy,
    mark_as_read: MarkAsReadPolicy,
    io_timeout: Duration,
    backoff: Backoff,
    batch_size: usize,
}

impl SyncConfig {
    /// Fails when `data_types` yields nothing or `max_retries` is negative.
    pub fn new(
        kind: SyncKind,
        max_retries: i64,
        data_types: impl IntoIterator<Item = DataType>,
    ) -> Result<Self, ConfigError> {
        let data_types: BTreeSet<_> = data_types.into_iter().collect();
        if data_types.is_empty() {
            return Err(ConfigError::NoDataTypes);
        }
        if max_retries < 0 {
            return Err(ConfigError::NegativeRetries(max_retries));
        }
        let max_retries =
            u32::try_from(max_retries).map_err(|_| ConfigError::InvalidValue {
                name: "max_retries",
                value: max_retries.to_string(),
            })?;
        Ok(Self {
            kind,
            max_retries,
            data_types,
            filter: FilterPolicy::default(),
            mark_as_read: MarkAsReadPolicy::default(),
            io_timeout: Duration::from_secs(DEFAULT_IO_TIMEOUT_SECS),
            backoff: Backoff::default(),
            batch_size: DEFAULT_BATCH_SIZE,
        })
    }

    pub fn with_filter(mut self, filter: FilterPolicy) -> Self {
        self.filter = filter;
        self
    }

    pub fn with_mark_as_read(mut self, policy: MarkAsReadPolicy) -> Self {
        self.mark_as_read = policy;
        self
    }

    pub fn with_io_timeout(mut self, timeout: Duration) -> Self {
        self.io_timeout = timeout;
        self
    }

    pub fn with_backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    pub fn kind(&self) -> SyncKind {
        self.kind
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    pub fn data_types(&self) -> impl Iterator<Item = DataType> + '_ {
        self.data_types.iter().copied()
    }

    pub fn includes(&self, data_type: DataType) -> bool {
        self.data_types.contains(&data_type)
    }

    pub fn filter(&self) -> FilterPolicy {
        self.filter
    }

    pub fn mark_as_read(&self) -> MarkAsReadPolicy {
        self.mark_as_read
    }

    pub fn io_timeout(&self) -> Duration {
        self.io_timeout
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.max_retries,
            timeout: self.io_timeout,
            backoff: self.backoff,
        }
    }

    /// Size of the next batch given how many items the run already handled.
    /// Zero means the per-run ceiling is reached.
    pub fn batch_limit(&self, processed: usize) -> usize {
        match self.filter.max_items_per_run {
            Some(max) => self.batch_size.min(max.saturating_sub(processed)),
            None => self.batch_size,
        }
    }
}

/// Process-wide settings read from the environment.
#[derive(Debug, Clone)]
pub struct DaemonConfig {
    pub user_email: String,
    pub max_retries: i64,
    pub io_timeout: Duration,
    pub max_items_per_run: Option<usize>,
    pub restore_starred_only: bool,
    pub mark_as_read: MarkAsReadPolicy,
    pub data_types: Vec<DataType>,
    pub state_dir: PathBuf,
    pub oauth_client_id: Option<String>,
    pub oauth_client_secret: Option<String>,
    pub oauth_base_url: Option<String>,
}

impl DaemonConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let user_email = lookup("WASYNC_USER_EMAIL")
            .filter(|value| !value.trim().is_empty())
            .ok_or(ConfigError::Missing("WASYNC_USER_EMAIL"))?;
        let max_retries = lookup("WASYNC_MAX_RETRIES")
            .and_then(|value| value.trim().parse::<i64>().ok())
            .unwrap_or(DEFAULT_MAX_RETRIES);
        let io_timeout = Duration::from_secs(read_u64(
            &lookup,
            "WASYNC_IO_TIMEOUT_SECS",
            DEFAULT_IO_TIMEOUT_SECS,
        ));
        let max_items_per_run = match read_u64(&lookup, "WASYNC_MAX_ITEMS_PER_RUN", 0) {
            0 => None,
            max => Some(usize::try_from(max).unwrap_or(usize::MAX)),
        };
        let restore_starred_only = read_bool(&lookup, "WASYNC_RESTORE_STARRED_ONLY", false);
        let mark_as_read = match lookup("WASYNC_MARK_AS_READ") {
            Some(value) => value
                .parse::<MarkAsReadPolicy>()
                .map_err(|_| ConfigError::InvalidValue {
                    name: "WASYNC_MARK_AS_READ",
                    value,
                })?,
            None => MarkAsReadPolicy::default(),
        };
        let data_types = match lookup("WASYNC_DATA_TYPES") {
            Some(value) => parse_data_types(&value)?,
            None => DEFAULT_DATA_TYPES.to_vec(),
        };
        let state_dir = match lookup("WASYNC_STATE_DIR") {
            Some(value) => match dirs::home_dir() {
                Some(home) => expand_with_home(&value, &home),
                None => PathBuf::from(value),
            },
            None => default_state_dir(),
        };

        Ok(Self {
            user_email,
            max_retries,
            io_timeout,
            max_items_per_run,
            restore_starred_only,
            mark_as_read,
            data_types,
            state_dir,
            oauth_client_id: lookup("WASYNC_OAUTH_CLIENT_ID"),
            oauth_client_secret: lookup("WASYNC_OAUTH_CLIENT_SECRET"),
            oauth_base_url: lookup("WASYNC_OAUTH_BASE_URL"),
        })
    }

    pub fn sync_config(&self, kind: SyncKind) -> Result<SyncConfig, ConfigError> {
        let filter = FilterPolicy {
            starred_only: kind == SyncKind::Restore && self.restore_starred_only,
            max_items_per_run: self.max_items_per_run,
        };
        Ok(
            SyncConfig::new(kind, self.max_retries, self.data_types.iter().copied())?
                .with_filter(filter)
                .with_mark_as_read(self.mark_as_read)
                .with_io_timeout(self.io_timeout),
        )
    }

    /// Checkpoint file for `kind`. Backup and restore track progress on
    /// opposite sides of the mailbox, so they never share a file.
    pub fn checkpoint_path(&self, kind: SyncKind) -> PathBuf {
        self.state_dir.join(match kind {
            SyncKind::Backup => BACKUP_CHECKPOINT_FILENAME,
            SyncKind::Restore => RESTORE_CHECKPOINT_FILENAME,
        })
    }
}

fn parse_data_types(value: &str) -> Result<Vec<DataType>, ConfigError> {
    value
        .split(',')
        .map(str::trim)
        .filter(|item| !item.is_empty())
        .map(|item| {
            item.parse::<DataType>()
                .map_err(|_| ConfigError::InvalidValue {
                    name: "WASYNC_DATA_TYPES",
                    value: item.to_string(),
                })
        })
        .collect()
}

fn expand_with_home(value: &str, home: &Path) -> PathBuf {
    if value == "~" {
        return home.to_path_buf();
    }
    if let Some(rest) = value.strip_prefix("~/") {
        return home.join(rest);
    }
    PathBuf::from(value)
}

fn default_state_dir() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join(STATE_DIR_NAME)
}

fn read_u64<F>(lookup: &F, name: &str, default: u64) -> u64
where
    F: Fn(&str) -> Option<String>,
{
    lookup(name)
        .and_then(|value| value.trim().parse::<u64>().ok())
        .filter(|value| *value > 0)
        .unwrap_or(default)
}

fn read_bool<F>(lookup: &F, name: &str, default: bool) -> bool
where
    F: Fn(&str) -> Option<String>,
{
    lookup(name)
        .map(|value| {
            matches!(
                value.trim().to_ascii_lowercase().as_str(),
                "1" | "true" | "yes" | "on"
            )
        })
        .unwrap_or(default)
}
