//! Operation dispatch
//!
//! [`CommandDispatcher`] ties the guards, the settings resolver, the executor
//! and the status reporter together for one invocation of the handler.
//!
//! For `enable`:
//!
//! 1. compare the sequence number with the watermark (skip or reject)
//! 2. claim the single-instance process record (back off if taken)
//! 3. report `transitioning`
//! 4. resolve settings, download files, run the command
//! 5. report `success` or `error`
//! 6. on success, commit the watermark and scrub the settings files
//!
//! The other operations only report `transitioning` and a terminal status.

use crate::config::HandlerConfig;
use crate::download::{normalize_line_endings, Downloader, HttpDownloader};
use crate::errors::{ExecutionError, HandlerError, Result, SequenceError};
use crate::exec::{CommandExecutor, Invocation, ShellExecutor};
use crate::handler_env::{
    read_settings_file, scrub_settings_files, OpensslDecryptor, ProtectedSettingsDecryptor,
};
use crate::io::write_atomic;
use crate::process::{Acquisition, ProcessLifecycleGuard, ProcessLiveness, SystemLiveness};
use crate::redaction::SecretRegistry;
use crate::sequence::{SequenceDecision, SequenceGuard};
use crate::settings::{protected_values, resolve, CommandSpec};
use crate::status::{StatusKind, StatusReporter};
use std::fs;
use tracing::{error, info, instrument, warn};

/// Filename of the inline script inside the work directory
pub const SCRIPT_FILE: &str = "script.sh";

/// Exit code used when the command line itself is invalid
pub const USAGE_EXIT_CODE: i32 = 2;

/// Operations the host agent can invoke
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    Install,
    Enable,
    Disable,
    Uninstall,
    Update,
}

impl Operation {
    /// Name written into status documents
    pub fn as_str(&self) -> &'static str {
        match self {
            Operation::Install => "Install",
            Operation::Enable => "Enable",
            Operation::Disable => "Disable",
            Operation::Uninstall => "Uninstall",
            Operation::Update => "Update",
        }
    }

    /// Process exit code when the operation fails
    pub fn fail_exit_code(&self) -> i32 {
        match self {
            Operation::Install => 52,
            _ => 3,
        }
    }

    /// Whether the operation is gated by the sequence and process guards
    pub fn is_guarded(&self) -> bool {
        matches!(self, Operation::Enable)
    }
}

/// How an invocation ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// The operation ran and succeeded
    Completed,
    /// The sequence number was already applied; nothing ran or was reported
    Skipped,
    /// Another live instance owns execution; nothing ran or was reported
    AlreadyRunning,
    /// The operation failed and an error status was reported
    Failed { exit_code: i32, message: String },
}

impl Outcome {
    /// Process exit code for this outcome
    pub fn exit_code(&self) -> i32 {
        match self {
            Outcome::Failed { exit_code, .. } => *exit_code,
            _ => 0,
        }
    }
}

/// Drives one operation for one sequence number
pub struct CommandDispatcher {
    config: HandlerConfig,
    secrets: SecretRegistry,
    sequence: SequenceGuard,
    process: ProcessLifecycleGuard,
    status: StatusReporter,
    executor: Box<dyn CommandExecutor>,
    downloader: Box<dyn Downloader>,
    decryptor: Box<dyn ProtectedSettingsDecryptor>,
}

impl CommandDispatcher {
    /// Dispatcher wired to the real process table, `/bin/sh`, HTTP downloads
    /// and `openssl` decryption.
    pub fn new(config: HandlerConfig, secrets: SecretRegistry) -> Self {
        Self {
            sequence: SequenceGuard::new(&config),
            process: ProcessLifecycleGuard::new(&config, SystemLiveness),
            status: StatusReporter::new(&config.status_dir, secrets.clone()),
            executor: Box::new(ShellExecutor::new(config.output_tail_bytes)),
            downloader: Box::new(HttpDownloader),
            decryptor: Box::new(OpensslDecryptor::new(&config.certificate_dir)),
            config,
            secrets,
        }
    }

    /// Replace the process liveness check
    pub fn with_liveness(mut self, liveness: impl ProcessLiveness + 'static) -> Self {
        self.process = ProcessLifecycleGuard::new(&self.config, liveness);
        self
    }

    /// Replace the command executor
    pub fn with_executor(mut self, executor: impl CommandExecutor + 'static) -> Self {
        self.executor = Box::new(executor);
        self
    }

    /// Replace the file downloader
    pub fn with_downloader(mut self, downloader: impl Downloader + 'static) -> Self {
        self.downloader = Box::new(downloader);
        self
    }

    /// Replace the protected settings decryptor
    pub fn with_decryptor(mut self, decryptor: impl ProtectedSettingsDecryptor + 'static) -> Self {
        self.decryptor = Box::new(decryptor);
        self
    }

    pub fn config(&self) -> &HandlerConfig {
        &self.config
    }

    /// Run `operation` for sequence number `seq`.
    ///
    /// `Err` is returned only when the outcome could not be persisted (state
    /// or status files unwritable); the caller must then fail with the
    /// operation's exit code.
    #[instrument(skip(self, operation), fields(operation = operation.as_str()))]
    pub fn dispatch(&mut self, operation: Operation, seq: i64) -> Result<Outcome> {
        info!("start");

        if !operation.is_guarded() {
            return self.run_reported(operation, seq);
        }

        match self.sequence.should_process(seq)? {
            SequenceDecision::Run => {}
            SequenceDecision::Skip => {
                info!("Sequence number already processed, skipping");
                return Ok(Outcome::Skipped);
            }
            SequenceDecision::Regressed { watermark } => {
                let err: HandlerError = SequenceError::Regressed {
                    current: seq,
                    watermark,
                }
                .into();
                error!(error = %err, "Sequence number regressed");
                return self.fail(operation, seq, &err);
            }
        }

        if let Acquisition::AlreadyRunning(record) = self.process.acquire()? {
            info!(pid = record.pid, "Another instance owns this execution, exiting");
            return Ok(Outcome::AlreadyRunning);
        }

        let outcome = self.run_reported(operation, seq);
        self.process.release();
        outcome
    }

    fn run_reported(&mut self, operation: Operation, seq: i64) -> Result<Outcome> {
        self.status
            .report(seq, StatusKind::Transitioning, operation.as_str(), "")?;

        match self.execute(operation, seq) {
            Ok(message) => {
                self.status
                    .report(seq, StatusKind::Success, operation.as_str(), &message)?;
                if operation.is_guarded() {
                    self.sequence.commit(seq)?;
                    if let Err(e) = scrub_settings_files(&self.config.config_dir) {
                        warn!(error = %e, "Failed to scrub settings files");
                    }
                }
                info!("end");
                Ok(Outcome::Completed)
            }
            Err(err) => {
                let redacted = self.secrets.redact_text(&err.to_string());
                error!(error = %redacted, kind = ?err.kind(), "failed to handle");
                self.fail(operation, seq, &err)
            }
        }
    }

    fn fail(&mut self, operation: Operation, seq: i64, err: &HandlerError) -> Result<Outcome> {
        let message = format!("{}{}", err, err.output().unwrap_or_default());
        self.status
            .report(seq, StatusKind::Error, operation.as_str(), &message)?;
        Ok(Outcome::Failed {
            exit_code: operation.fail_exit_code(),
            message: self.secrets.redact_text(&message),
        })
    }

    fn execute(&mut self, operation: Operation, seq: i64) -> Result<String> {
        match operation {
            Operation::Install => {
                fs::create_dir_all(&self.config.data_dir)?;
                info!(data_dir = %self.config.data_dir.display(), "Created data directory");
                Ok(String::new())
            }
            Operation::Uninstall => {
                match fs::remove_dir_all(&self.config.data_dir) {
                    Ok(()) => info!("Removed data directory"),
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                    Err(e) => return Err(e.into()),
                }
                Ok(String::new())
            }
            Operation::Disable | Operation::Update => Ok(String::new()),
            Operation::Enable => self.enable(seq),
        }
    }

    fn enable(&mut self, seq: i64) -> Result<String> {
        let settings_path = self.config.settings_path(seq);
        let (public, protected) = read_settings_file(&settings_path, self.decryptor.as_ref())?;
        self.secrets.add_secrets(protected_values(&protected));
        self.secrets.add_secret(&public.storage_account_key);

        let settings = resolve(&public, &protected)?;
        let normalize = !settings.skip_line_ending_normalization();

        let work_dir = self.config.work_dir(seq);
        fs::create_dir_all(&work_dir)?;

        let files = self.downloader.download(
            settings.file_urls(),
            &work_dir,
            settings.storage_credentials(),
        )?;
        if normalize {
            for file in &files {
                normalize_line_endings(file)?;
            }
        }

        let invocation = match settings.command_spec() {
            CommandSpec::Command(command) => Invocation::Shell(command),
            CommandSpec::Script(script) => {
                let path = work_dir.join(SCRIPT_FILE);
                write_atomic(&path, script.as_bytes())?;
                if normalize {
                    normalize_line_endings(&path)?;
                }
                Invocation::ScriptFile(path)
            }
        };

        let output = self.executor.execute(&invocation, &work_dir)?;
        if !output.success() {
            return Err(ExecutionError::NonZeroExit {
                code: output.exit_code,
                output: output.message(),
            }
            .into());
        }
        Ok(output.message())
    }
}
