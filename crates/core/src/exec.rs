//! Command execution
//!
//! The resolved command runs under `/bin/sh` inside the sequence's work
//! directory. Its stdout and stderr are streamed to `stdout` and `stderr` files
//! in that directory; only the tail of each is kept in memory for the status
//! message.

use crate::errors::ExecutionError;
use std::fs::{self, File};
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::time::Instant;
use tracing::{debug, info, instrument};

/// Name of the captured stdout file in the work directory
pub const STDOUT_FILE: &str = "stdout";

/// Name of the captured stderr file in the work directory
pub const STDERR_FILE: &str = "stderr";

/// Shell used to run commands and scripts
const SHELL: &str = "/bin/sh";

/// What to hand to the shell
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Invocation {
    /// `sh -c <command>`
    Shell(String),
    /// `sh <path>`
    ScriptFile(PathBuf),
}

/// Result of a command that started and ran to completion
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionOutput {
    /// Exit code, `-1` when terminated by a signal
    pub exit_code: i32,
    /// Last bytes of stdout
    pub stdout_tail: String,
    /// Last bytes of stderr
    pub stderr_tail: String,
}

impl ExecutionOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    /// Status message layout surfaced to the host agent
    pub fn message(&self) -> String {
        format!(
            "\n[stdout]\n{}\n[stderr]\n{}",
            self.stdout_tail, self.stderr_tail
        )
    }
}

/// Runs the resolved command
pub trait CommandExecutor {
    /// Run `invocation` in `work_dir`. A non-zero exit is reported through
    /// [`ExecutionOutput::exit_code`]; `Err` means the command could not run.
    fn execute(
        &self,
        invocation: &Invocation,
        work_dir: &Path,
    ) -> Result<ExecutionOutput, ExecutionError>;
}

/// Executor backed by `/bin/sh`
#[derive(Debug, Clone)]
pub struct ShellExecutor {
    tail_bytes: usize,
}

impl ShellExecutor {
    pub fn new(tail_bytes: usize) -> Self {
        Self { tail_bytes }
    }
}

impl CommandExecutor for ShellExecutor {
    #[instrument(skip_all, fields(work_dir = %work_dir.display()))]
    fn execute(
        &self,
        invocation: &Invocation,
        work_dir: &Path,
    ) -> Result<ExecutionOutput, ExecutionError> {
        fs::create_dir_all(work_dir)?;
        let stdout_path = work_dir.join(STDOUT_FILE);
        let stderr_path = work_dir.join(STDERR_FILE);

        let mut command = Command::new(SHELL);
        match invocation {
            Invocation::Shell(cmd) => {
                command.arg("-c").arg(cmd);
            }
            Invocation::ScriptFile(path) => {
                command.arg(path);
            }
        }
        command
            .current_dir(work_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::from(File::create(&stdout_path)?))
            .stderr(Stdio::from(File::create(&stderr_path)?));

        let start_time = Instant::now();
        let status = command
            .status()
            .map_err(|e| ExecutionError::SpawnFailed {
                message: e.to_string(),
            })?;
        let exit_code = status.code().unwrap_or(-1);

        info!(
            exit_code,
            duration_ms = start_time.elapsed().as_millis() as u64,
            "Command finished"
        );

        Ok(ExecutionOutput {
            exit_code,
            stdout_tail: read_tail(&stdout_path, self.tail_bytes)?,
            stderr_tail: read_tail(&stderr_path, self.tail_bytes)?,
        })
    }
}

/// Read at most the last `max_bytes` of `path` as lossy UTF-8.
pub fn read_tail(path: &Path, max_bytes: usize) -> std::io::Result<String> {
    let mut file = File::open(path)?;
    let len = file.metadata()?.len();
    let start = len.saturating_sub(max_bytes as u64);
    file.seek(SeekFrom::Start(start))?;

    let mut buf = Vec::with_capacity((len - start) as usize);
    file.read_to_end(&mut buf)?;
    debug!(path = %path.display(), len, kept = buf.len(), "Read output tail");
    Ok(String::from_utf8_lossy(&buf).into_owned())
}
