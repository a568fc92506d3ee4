use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use thiserror::Error;
use tracing::{info, warn};
use wasync_core::{WireMessage, now_unix};

use super::checkpoint::Checkpoints;
use super::convert::{Converter, RecordFailure};
use super::retry::{RetryError, with_retry};
use super::store::{HeaderQuery, MailboxStore, RecordSink, RecordSource, RecordStoreError, StoreError};
use crate::config::{SyncConfig, SyncKind};
use crate::credentials::{CredentialError, CredentialManager};
use crate::state::{FailureKind, SyncFailure, SyncPhase, SyncStateMachine, TransitionError};

/// Cooperative cancel flag, checked between batches.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_canceled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    fn reset(&self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

#[derive(Debug, Error)]
pub enum SyncError {
    #[error(transparent)]
    Transition(#[from] TransitionError),
    #[error("config is for a {0:?} run")]
    WrongKind(SyncKind),
    #[error("credentials: {0}")]
    Credential(#[from] CredentialError),
    #[error("mailbox: {0}")]
    Mailbox(#[from] RetryError<StoreError>),
    #[error("local record store: {0}")]
    RecordStore(#[from] RecordStoreError),
}

impl SyncError {
    /// Cause attached to the ERROR state.
    pub fn failure(&self) -> SyncFailure {
        let kind = match self {
            SyncError::Credential(err) if err.is_auth_rejected() => FailureKind::AuthRejected,
            SyncError::Credential(CredentialError::Storage(_)) => FailureKind::Storage,
            SyncError::Credential(CredentialError::Provider(_)) => FailureKind::Provider,
            SyncError::Credential(_) => FailureKind::TransientIo,
            SyncError::Mailbox(RetryError::Fatal(StoreError::Auth(_))) => FailureKind::AuthRejected,
            SyncError::Mailbox(RetryError::Exhausted { .. }) => FailureKind::TransientIo,
            SyncError::Mailbox(RetryError::Fatal(_)) | SyncError::RecordStore(_) => FailureKind::Storage,
            SyncError::Transition(_) | SyncError::WrongKind(_) => FailureKind::Configuration,
        };
        SyncFailure::new(kind, self.to_string())
    }
}

/// Summary of one run.
#[derive(Debug, Clone)]
pub struct SyncReport {
    pub kind: SyncKind,
    pub phase: SyncPhase,
    pub total: usize,
    /// Messages appended (backup) or records written (restore).
    pub processed: usize,
    pub skipped: usize,
    pub duplicates: usize,
    pub unclassified: usize,
    pub failures: Vec<RecordFailure>,
    pub checkpoints: Checkpoints,
}

impl SyncReport {
    fn new(kind: SyncKind) -> Self {
        Self {
            kind,
            phase: SyncPhase::Initial,
            total: 0,
            processed: 0,
            skipped: 0,
            duplicates: 0,
            unclassified: 0,
            failures: Vec::new(),
            checkpoints: Checkpoints::default(),
        }
    }

    pub fn was_canceled(&self) -> bool {
        matches!(self.phase, SyncPhase::CanceledBackup | SyncPhase::CanceledRestore)
    }
}

/// Drives backup and restore runs through the state machine.
pub struct SyncRunner {
    machine: Arc<SyncStateMachine>,
    mailbox: Arc<dyn MailboxStore>,
    credentials: Option<Arc<CredentialManager>>,
    converter: Converter,
    cancel: CancelToken,
}

impl SyncRunner {
    pub fn new(
        machine: Arc<SyncStateMachine>,
        mailbox: Arc<dyn MailboxStore>,
        converter: Converter,
    ) -> Self {
        Self {
            machine,
            mailbox,
            credentials: None,
            converter,
            cancel: CancelToken::new(),
        }
    }

    pub fn with_credentials(mut self, credentials: Arc<CredentialManager>) -> Self {
        self.credentials = Some(credentials);
        self
    }

    pub fn machine(&self) -> &Arc<SyncStateMachine> {
        &self.machine
    }

    /// Flag observed by the next or current run. A cancel requested before a
    /// run starts stops it at its first batch; the flag clears when a run ends.
    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    /// Encodes local records newer than the checkpoints and appends them.
    ///
    /// `checkpoints` advance batch by batch, so they hold committed progress
    /// even when the run fails.
    pub async fn backup(
        &self,
        config: &SyncConfig,
        source: &dyn RecordSource,
        checkpoints: &mut Checkpoints,
    ) -> Result<SyncReport, SyncError> {
        if config.kind() != SyncKind::Backup {
            return Err(SyncError::WrongKind(config.kind()));
        }
        self.machine.start(SyncKind::Backup)?;
        let result = self.run_backup(config, source, checkpoints).await;
        self.cancel.reset();
        self.finish(result)
    }

    /// Fetches messages newer than the checkpoints and writes the decoded
    /// records to `sink`.
    pub async fn restore(
        &self,
        config: &SyncConfig,
        sink: &dyn RecordSink,
        checkpoints: &mut Checkpoints,
    ) -> Result<SyncReport, SyncError> {
        if config.kind() != SyncKind::Restore {
            return Err(SyncError::WrongKind(config.kind()));
        }
        self.machine.start(SyncKind::Restore)?;
        let result = self.run_restore(config, sink, checkpoints).await;
        self.cancel.reset();
        self.finish(result)
    }

    fn finish(&self, result: Result<SyncReport, SyncError>) -> Result<SyncReport, SyncError> {
        match result {
            Ok(report) => {
                info!(
                    kind = ?report.kind,
                    phase = %report.phase,
                    processed = report.processed,
                    failed = report.failures.len(),
                    "sync run ended"
                );
                Ok(report)
            }
            Err(err) => {
                if let Err(transition) = self.machine.fail(err.failure()) {
                    warn!("could not record failure: {transition}");
                }
                Err(err)
            }
        }
    }

    async fn run_backup(
        &self,
        config: &SyncConfig,
        source: &dyn RecordSource,
        checkpoints: &mut Checkpoints,
    ) -> Result<SyncReport, SyncError> {
        let mut report = SyncReport::new(SyncKind::Backup);

        self.machine.advance(SyncPhase::Calculating)?;
        for data_type in config.data_types() {
            report.total += source.count_after(data_type, checkpoints.get(data_type)).await?;
        }
        if let Some(max) = config.filter().max_items_per_run {
            report.total = report.total.min(max);
        }
        self.machine.progress(0, report.total)?;

        self.machine.advance(SyncPhase::Authenticating)?;
        self.authenticate(config).await?;

        self.machine.advance(SyncPhase::BackingUp)?;
        let policy = config.retry_policy();
        let first_version = u64::try_from(now_unix()).unwrap_or(0).saturating_mul(1000);
        let mut handled = 0usize;
        'types: for data_type in config.data_types() {
            loop {
                if self.cancel.is_canceled() {
                    return self.cancel_run(SyncPhase::CanceledBackup, report, checkpoints);
                }
                let limit = config.batch_limit(handled);
                if limit == 0 {
                    break 'types;
                }
                let records = source
                    .records_after(data_type, checkpoints.get(data_type), limit)
                    .await?;
                if records.is_empty() {
                    break;
                }

                let batch = self
                    .converter
                    .encode_batch(&records, config, first_version + handled as u64);
                for message in &batch.messages {
                    with_retry(&policy, "mailbox append", || self.mailbox.append(message)).await?;
                }
                if let Some(highest) = batch.highest_date {
                    checkpoints.advance(data_type, highest);
                }
                handled += records.len();
                report.processed += batch.messages.len();
                report.skipped += batch.skipped;
                report.failures.extend(batch.failures);
                self.machine.progress(handled.min(report.total), report.total)?;
                info!(%data_type, batch = records.len(), handled, "backup batch committed");

                if records.len() < limit {
                    break;
                }
            }
        }

        self.machine.advance(SyncPhase::UpdatingThreads)?;
        self.machine.advance(SyncPhase::FinishedBackup)?;
        report.phase = SyncPhase::FinishedBackup;
        report.checkpoints = checkpoints.clone();
        Ok(report)
    }

    async fn run_restore(
        &self,
        config: &SyncConfig,
        sink: &dyn RecordSink,
        checkpoints: &mut Checkpoints,
    ) -> Result<SyncReport, SyncError> {
        let mut report = SyncReport::new(SyncKind::Restore);
        let policy = config.retry_policy();

        self.machine.advance(SyncPhase::Calculating)?;
        let queries: Vec<HeaderQuery> = config
            .data_types()
            .map(|data_type| {
                HeaderQuery::for_type(data_type)
                    .after(checkpoints.get(data_type))
                    .starred_only(config.filter().starred_only)
            })
            .collect();

        self.machine.advance(SyncPhase::Authenticating)?;
        self.authenticate(config).await?;

        self.machine.advance(SyncPhase::Restoring)?;
        if self.cancel.is_canceled() {
            return self.cancel_run(SyncPhase::CanceledRestore, report, checkpoints);
        }
        let mut pending: Vec<WireMessage> = Vec::new();
        for query in &queries {
            pending.extend(with_retry(&policy, "mailbox search", || self.mailbox.search(query)).await?);
        }
        pending.sort_by_key(record_date);

        let mut seen_ids = HashSet::new();
        let before = pending.len();
        pending.retain(|message| match message.message_id() {
            Some(id) => seen_ids.insert(id.to_string()),
            None => true,
        });
        report.duplicates = before - pending.len();
        if let Some(max) = config.filter().max_items_per_run {
            pending.truncate(max);
        }
        report.total = pending.len();
        self.machine.progress(0, report.total)?;

        let batch_size = config.batch_limit(0).max(1);
        let mut handled = 0usize;
        for chunk in pending.chunks(batch_size) {
            if self.cancel.is_canceled() {
                return self.cancel_run(SyncPhase::CanceledRestore, report, checkpoints);
            }
            let result = self.converter.process_batch(chunk, config);
            if !result.records.is_empty() {
                sink.write_records(&result.records).await?;
            }
            for record in &result.records {
                checkpoints.advance(record.data_type(), record.timestamp);
            }
            handled += chunk.len();
            report.processed += result.records.len();
            report.skipped += result.skipped;
            report.unclassified += result.unclassified.len();
            report.failures.extend(result.failures.into_iter().map(|mut failure| {
                failure.position += handled - chunk.len();
                failure
            }));
            self.machine.progress(handled, report.total)?;
            info!(batch = chunk.len(), handled, "restore batch committed");
        }

        self.machine.advance(SyncPhase::UpdatingThreads)?;
        sink.update_threads().await?;
        self.machine.advance(SyncPhase::FinishedRestore)?;
        report.phase = SyncPhase::FinishedRestore;
        report.checkpoints = checkpoints.clone();
        Ok(report)
    }

    /// Presents a token to the mailbox, refreshing once if it is rejected.
    async fn authenticate(&self, config: &SyncConfig) -> Result<(), SyncError> {
        let policy = config.retry_policy();
        let token = match &self.credentials {
            Some(credentials) => credentials.valid_access_token().await?,
            None => String::new(),
        };
        let first = with_retry(&policy, "mailbox authenticate", || {
            self.mailbox.authenticate(&token)
        })
        .await;
        match (first, &self.credentials) {
            (Ok(()), _) => Ok(()),
            (Err(RetryError::Fatal(StoreError::Auth(reason))), Some(credentials)) => {
                warn!("mailbox rejected access token, refreshing: {reason}");
                let token = credentials.on_unauthorized().await?;
                with_retry(&policy, "mailbox authenticate", || {
                    self.mailbox.authenticate(&token)
                })
                .await?;
                Ok(())
            }
            (Err(err), _) => Err(err.into()),
        }
    }

    fn cancel_run(
        &self,
        phase: SyncPhase,
        mut report: SyncReport,
        checkpoints: &Checkpoints,
    ) -> Result<SyncReport, SyncError> {
        self.machine.advance(phase)?;
        info!(%phase, processed = report.processed, "sync run canceled");
        report.phase = phase;
        report.checkpoints = checkpoints.clone();
        Ok(report)
    }
}

fn record_date(message: &WireMessage) -> i64 {
    message.record_timestamp().unwrap_or(i64::MIN)
}
