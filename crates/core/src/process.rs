//! Single-instance process guard
//!
//! The host agent may launch overlapping invocations of the handler. Before
//! executing, the handler records its pid and OS-reported start time. A later
//! invocation that finds a record whose process is still alive (same pid *and*
//! same start time) backs off. A record left behind by a crashed process is
//! ignored because the liveness check fails, so no cleanup is required for
//! correctness.

use crate::config::HandlerConfig;
use crate::errors::ProcessError;
use crate::io::{read_optional, write_atomic};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use sysinfo::{Pid, ProcessStatus, ProcessesToUpdate, System};
use tracing::{debug, info, instrument, warn};

/// Identity of an executing handler process
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessRecord {
    /// Operating-system process id
    pub pid: u32,
    /// Process start time in seconds since the Unix epoch, as reported by the OS
    pub start_time: u64,
}

/// Process introspection used by [`ProcessLifecycleGuard`]
pub trait ProcessLiveness {
    /// Whether a process with `pid` that started at `start_time` is running
    fn is_alive(&self, pid: u32, start_time: u64) -> bool;

    /// Identity of the calling process
    fn current(&self) -> Result<ProcessRecord, ProcessError>;
}

/// Liveness backed by the OS process table
#[derive(Debug, Default)]
pub struct SystemLiveness;

impl SystemLiveness {
    fn lookup(pid: Pid) -> Option<(u64, ProcessStatus)> {
        let mut system = System::new();
        system.refresh_processes(ProcessesToUpdate::Some(&[pid]), true);
        system
            .process(pid)
            .map(|process| (process.start_time(), process.status()))
    }
}

impl ProcessLiveness for SystemLiveness {
    fn is_alive(&self, pid: u32, start_time: u64) -> bool {
        match Self::lookup(Pid::from_u32(pid)) {
            Some((_, ProcessStatus::Zombie)) | Some((_, ProcessStatus::Dead)) => false,
            Some((actual_start, _)) => actual_start == start_time,
            None => false,
        }
    }

    fn current(&self) -> Result<ProcessRecord, ProcessError> {
        let pid = sysinfo::get_current_pid()
            .map_err(|e| ProcessError::CurrentProcess(e.to_string()))?;
        let (start_time, _) = Self::lookup(pid).ok_or_else(|| {
            ProcessError::CurrentProcess(format!("process {} not found in process table", pid))
        })?;
        Ok(ProcessRecord {
            pid: pid.as_u32(),
            start_time,
        })
    }
}

/// Liveness that reports every other process as dead.
///
/// Useful wherever overlapping invocations are impossible, such as tests.
#[derive(Debug, Clone, Copy)]
pub struct NeverAlive {
    pub current: ProcessRecord,
}

impl ProcessLiveness for NeverAlive {
    fn is_alive(&self, _pid: u32, _start_time: u64) -> bool {
        false
    }

    fn current(&self) -> Result<ProcessRecord, ProcessError> {
        Ok(self.current)
    }
}

/// Result of [`ProcessLifecycleGuard::acquire`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Acquisition {
    /// The current process now owns execution
    Acquired,
    /// Another live process owns execution
    AlreadyRunning(ProcessRecord),
}

/// Records and checks the identity of the executing process
pub struct ProcessLifecycleGuard {
    path: PathBuf,
    liveness: Box<dyn ProcessLiveness>,
}

impl ProcessLifecycleGuard {
    /// Guard backed by the process record file named in `config`
    pub fn new(config: &HandlerConfig, liveness: impl ProcessLiveness + 'static) -> Self {
        Self::with_path(config.process_path(), liveness)
    }

    /// Guard backed by an explicit file
    pub fn with_path(path: impl Into<PathBuf>, liveness: impl ProcessLiveness + 'static) -> Self {
        Self {
            path: path.into(),
            liveness: Box::new(liveness),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read the persisted record. An unreadable or malformed record is
    /// reported as absent since the liveness check is what guarantees safety.
    pub fn record(&self) -> Result<Option<ProcessRecord>, ProcessError> {
        let Some(content) = read_optional(&self.path)? else {
            return Ok(None);
        };
        match serde_json::from_str::<ProcessRecord>(&content) {
            Ok(record) => Ok(Some(record)),
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "Ignoring malformed process record");
                Ok(None)
            }
        }
    }

    /// Claim execution for the current process unless a live process already
    /// holds it.
    #[instrument(skip(self), fields(path = %self.path.display()))]
    pub fn acquire(&self) -> Result<Acquisition, ProcessError> {
        let current = self.liveness.current()?;

        if let Some(existing) = self.record()? {
            if existing != current && self.liveness.is_alive(existing.pid, existing.start_time) {
                info!(
                    pid = existing.pid,
                    start_time = existing.start_time,
                    "Another instance is still running"
                );
                return Ok(Acquisition::AlreadyRunning(existing));
            }
            debug!(pid = existing.pid, "Previous process record is stale");
        }

        let json = serde_json::to_vec(&current)?;
        write_atomic(&self.path, &json)?;
        debug!(pid = current.pid, start_time = current.start_time, "Recorded process");
        self.confirm(current)
    }

    /// Re-read the record after writing it. Two invocations racing past the
    /// first check both write; the one whose record was replaced backs off.
    fn confirm(&self, current: ProcessRecord) -> Result<Acquisition, ProcessError> {
        match self.record()? {
            Some(winner)
                if winner != current && self.liveness.is_alive(winner.pid, winner.start_time) =>
            {
                info!(pid = winner.pid, "Lost process record race, backing off");
                Ok(Acquisition::AlreadyRunning(winner))
            }
            _ => Ok(Acquisition::Acquired),
        }
    }

    /// Remove the record if it still belongs to the current process.
    /// Failures are logged and otherwise ignored.
    pub fn release(&self) {
        let current = match self.liveness.current() {
            Ok(current) => current,
            Err(e) => {
                warn!(error = %e, "Cannot identify current process, leaving record in place");
                return;
            }
        };
        match self.record() {
            Ok(Some(record)) if record == current => {
                if let Err(e) = fs::remove_file(&self.path) {
                    warn!(path = %self.path.display(), error = %e, "Failed to remove process record");
                }
            }
            Ok(_) => {}
            Err(e) => warn!(error = %e, "Failed to read process record during release"),
        }
    }
}
