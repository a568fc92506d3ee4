use std::fmt;
use std::sync::Mutex;

use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::config::SyncKind;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SyncPhase {
    Initial,
    Calculating,
    Authenticating,
    BackingUp,
    Restoring,
    UpdatingThreads,
    Error,
    CanceledBackup,
    CanceledRestore,
    FinishedBackup,
    FinishedRestore,
}

impl SyncPhase {
    pub const ALL: [SyncPhase; 11] = [
        SyncPhase::Initial,
        SyncPhase::Calculating,
        SyncPhase::Authenticating,
        SyncPhase::BackingUp,
        SyncPhase::Restoring,
        SyncPhase::UpdatingThreads,
        SyncPhase::Error,
        SyncPhase::CanceledBackup,
        SyncPhase::CanceledRestore,
        SyncPhase::FinishedBackup,
        SyncPhase::FinishedRestore,
    ];

    /// Phases during which a run holds the worker.
    pub fn is_running(&self) -> bool {
        matches!(
            self,
            SyncPhase::Calculating
                | SyncPhase::Authenticating
                | SyncPhase::BackingUp
                | SyncPhase::Restoring
                | SyncPhase::UpdatingThreads
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SyncPhase::Error
                | SyncPhase::CanceledBackup
                | SyncPhase::CanceledRestore
                | SyncPhase::FinishedBackup
                | SyncPhase::FinishedRestore
        )
    }

    pub fn can_transition_to(&self, next: SyncPhase) -> bool {
        use SyncPhase::*;
        match (self, next) {
            (Initial, Calculating) => true,
            (Calculating, Authenticating) => true,
            (Authenticating, BackingUp | Restoring) => true,
            (BackingUp, UpdatingThreads | CanceledBackup) => true,
            (Restoring, UpdatingThreads | CanceledRestore) => true,
            (UpdatingThreads, FinishedBackup | FinishedRestore) => true,
            (Calculating | Authenticating | BackingUp | Restoring | UpdatingThreads, Error) => {
                true
            }
            _ => false,
        }
    }

    /// Whether this phase can occur in a run of the given kind.
    fn belongs_to(&self, kind: SyncKind) -> bool {
        match self {
            SyncPhase::BackingUp | SyncPhase::CanceledBackup | SyncPhase::FinishedBackup => {
                kind == SyncKind::Backup
            }
            SyncPhase::Restoring | SyncPhase::CanceledRestore | SyncPhase::FinishedRestore => {
                kind == SyncKind::Restore
            }
            _ => true,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SyncPhase::Initial => "initial",
            SyncPhase::Calculating => "calculating",
            SyncPhase::Authenticating => "authenticating",
            SyncPhase::BackingUp => "backing_up",
            SyncPhase::Restoring => "restoring",
            SyncPhase::UpdatingThreads => "updating_threads",
            SyncPhase::Error => "error",
            SyncPhase::CanceledBackup => "canceled_backup",
            SyncPhase::CanceledRestore => "canceled_restore",
            SyncPhase::FinishedBackup => "finished_backup",
            SyncPhase::FinishedRestore => "finished_restore",
        }
    }
}

impl fmt::Display for SyncPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    AuthRejected,
    TransientIo,
    Configuration,
    Storage,
    /// Identity provider answered with something unusable.
    Provider,
}

/// Cause attached to an ERROR state for presentation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncFailure {
    pub kind: FailureKind,
    pub message: String,
}

impl SyncFailure {
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Progress {
    pub processed: usize,
    pub total: usize,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TransitionError {
    #[error("cannot move from {from} to {to}")]
    Invalid { from: SyncPhase, to: SyncPhase },
    #[error("{phase} does not belong to a {kind:?} run")]
    WrongKind { phase: SyncPhase, kind: SyncKind },
    #[error("progress can only be reported while running, not in {0}")]
    NotRunning(SyncPhase),
    #[error("no sync run has been started")]
    NotStarted,
    #[error("a sync run is already in progress ({0})")]
    AlreadyRunning(SyncPhase),
}

/// Immutable snapshot of a run. Every change produces a new value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncState {
    kind: SyncKind,
    phase: SyncPhase,
    error: Option<SyncFailure>,
    progress: Option<Progress>,
}

impl SyncState {
    pub fn initial(kind: SyncKind) -> Self {
        Self {
            kind,
            phase: SyncPhase::Initial,
            error: None,
            progress: None,
        }
    }

    pub fn kind(&self) -> SyncKind {
        self.kind
    }

    pub fn phase(&self) -> SyncPhase {
        self.phase
    }

    pub fn error(&self) -> Option<&SyncFailure> {
        self.error.as_ref()
    }

    pub fn progress(&self) -> Option<Progress> {
        self.progress
    }

    pub fn is_running(&self) -> bool {
        self.phase.is_running()
    }

    /// Next state in `phase`. Moving to ERROR goes through [`SyncState::fail`].
    pub fn transition(&self, phase: SyncPhase) -> Result<SyncState, TransitionError> {
        if phase == SyncPhase::Error || !self.phase.can_transition_to(phase) {
            return Err(TransitionError::Invalid {
                from: self.phase,
                to: phase,
            });
        }
        if !phase.belongs_to(self.kind) {
            return Err(TransitionError::WrongKind {
                phase,
                kind: self.kind,
            });
        }
        Ok(SyncState {
            kind: self.kind,
            phase,
            error: None,
            progress: None,
        })
    }

    pub fn with_progress(&self, processed: usize, total: usize) -> Result<SyncState, TransitionError> {
        if !self.phase.is_running() {
            return Err(TransitionError::NotRunning(self.phase));
        }
        Ok(SyncState {
            progress: Some(Progress { processed, total }),
            ..self.clone()
        })
    }

    pub fn fail(&self, failure: SyncFailure) -> Result<SyncState, TransitionError> {
        if !self.phase.can_transition_to(SyncPhase::Error) {
            return Err(TransitionError::Invalid {
                from: self.phase,
                to: SyncPhase::Error,
            });
        }
        Ok(SyncState {
            kind: self.kind,
            phase: SyncPhase::Error,
            error: Some(failure),
            progress: self.progress,
        })
    }
}

/// Holds the current snapshot and fans every new one out to observers.
pub struct SyncStateMachine {
    current: Mutex<Option<SyncState>>,
    observers: Mutex<Vec<mpsc::UnboundedSender<SyncState>>>,
}

impl Default for SyncStateMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl SyncStateMachine {
    pub fn new() -> Self {
        Self {
            current: Mutex::new(None),
            observers: Mutex::new(Vec::new()),
        }
    }

    pub fn current(&self) -> Option<SyncState> {
        lock(&self.current).clone()
    }

    pub fn is_running(&self) -> bool {
        lock(&self.current)
            .as_ref()
            .is_some_and(SyncState::is_running)
    }

    /// Registers an observer. It receives the current snapshot first, if any.
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<SyncState> {
        let (tx, rx) = mpsc::unbounded_channel();
        if let Some(state) = lock(&self.current).clone() {
            let _ = tx.send(state);
        }
        lock(&self.observers).push(tx);
        rx
    }

    /// Starts a new run at INITIAL. Refused while another run is active.
    pub fn start(&self, kind: SyncKind) -> Result<SyncState, TransitionError> {
        let mut current = lock(&self.current);
        if let Some(state) = current.as_ref()
            && state.is_running()
        {
            return Err(TransitionError::AlreadyRunning(state.phase()));
        }
        let state = SyncState::initial(kind);
        *current = Some(state.clone());
        drop(current);
        info!(kind = ?kind, "sync run started");
        self.publish(&state);
        Ok(state)
    }

    pub fn advance(&self, phase: SyncPhase) -> Result<SyncState, TransitionError> {
        self.update(|state| state.transition(phase))
    }

    pub fn progress(&self, processed: usize, total: usize) -> Result<SyncState, TransitionError> {
        self.update(|state| state.with_progress(processed, total))
    }

    pub fn fail(&self, failure: SyncFailure) -> Result<SyncState, TransitionError> {
        warn!(kind = ?failure.kind, "sync run failed: {}", failure.message);
        self.update(|state| state.fail(failure))
    }

    fn update<F>(&self, next: F) -> Result<SyncState, TransitionError>
    where
        F: FnOnce(&SyncState) -> Result<SyncState, TransitionError>,
    {
        let mut current = lock(&self.current);
        let Some(previous) = current.as_ref() else {
            return Err(TransitionError::NotStarted);
        };
        let state = next(previous)?;
        if previous.phase() != state.phase() {
            debug!(phase = %state.phase(), "sync phase changed");
        }
        *current = Some(state.clone());
        drop(current);
        self.publish(&state);
        Ok(state)
    }

    fn publish(&self, state: &SyncState) {
        lock(&self.observers).retain(|tx| tx.send(state.clone()).is_ok());
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
