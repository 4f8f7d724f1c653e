//! Handler configuration
//!
//! Every path and filename the handler touches is carried in an explicit
//! [`HandlerConfig`] handed to each component at construction. Defaults are
//! applied only by the composition root through [`HandlerConfig::from_environment`].

use crate::handler_env::HandlerEnvironment;
use std::path::{Path, PathBuf};

/// Default directory for downloaded files, command output and handler state
pub const DEFAULT_DATA_DIR: &str = "/var/lib/waagent/run-command";

/// File holding the most recently processed sequence number
pub const DEFAULT_SEQUENCE_FILE: &str = "mrseq";

/// File holding the pid and start time of the executing process
pub const DEFAULT_PROCESS_FILE: &str = "pidstart";

/// Directory (under the data dir) receiving `<seq>/` work directories
pub const DEFAULT_DOWNLOAD_DIR: &str = "download";

/// Bytes of stdout/stderr kept in the status message
pub const DEFAULT_OUTPUT_TAIL_BYTES: usize = 4 * 1024;

/// Environment variable set by the host agent with the current sequence number
pub const SEQUENCE_NUMBER_ENV: &str = "ConfigSequenceNumber";

/// Environment variable overriding [`DEFAULT_DATA_DIR`]
pub const DATA_DIR_ENV: &str = "RUNCMD_DATA_DIR";

/// Resolved locations and limits used by the handler components
#[derive(Debug, Clone, PartialEq)]
pub struct HandlerConfig {
    /// Root of handler-owned state
    pub data_dir: PathBuf,
    /// Watermark filename, relative to `data_dir`
    pub sequence_file: String,
    /// Process record filename, relative to `data_dir`
    pub process_file: String,
    /// Download directory name, relative to `data_dir`
    pub download_dir: String,
    /// Where `<seq>.status` documents are written
    pub status_dir: PathBuf,
    /// Where the host agent places `<seq>.settings` files
    pub config_dir: PathBuf,
    /// Where `<thumbprint>.crt`/`.prv` pairs live for protected settings
    pub certificate_dir: PathBuf,
    /// Tail length of captured output surfaced in status messages
    pub output_tail_bytes: usize,
}

impl HandlerConfig {
    /// Build a configuration rooted at `data_dir` with default filenames.
    pub fn new(
        data_dir: impl Into<PathBuf>,
        status_dir: impl Into<PathBuf>,
        config_dir: impl Into<PathBuf>,
    ) -> Self {
        let config_dir = config_dir.into();
        let certificate_dir = config_dir
            .parent()
            .and_then(Path::parent)
            .map(Path::to_path_buf)
            .unwrap_or_else(|| config_dir.clone());
        Self {
            data_dir: data_dir.into(),
            sequence_file: DEFAULT_SEQUENCE_FILE.to_string(),
            process_file: DEFAULT_PROCESS_FILE.to_string(),
            download_dir: DEFAULT_DOWNLOAD_DIR.to_string(),
            status_dir: status_dir.into(),
            config_dir,
            certificate_dir,
            output_tail_bytes: DEFAULT_OUTPUT_TAIL_BYTES,
        }
    }

    /// Build the configuration from the discovered host environment, honouring
    /// the `RUNCMD_DATA_DIR` override.
    pub fn from_environment(env: &HandlerEnvironment) -> Self {
        let data_dir = std::env::var_os(DATA_DIR_ENV)
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_DATA_DIR));
        Self::new(
            data_dir,
            &env.handler_environment.status_folder,
            &env.handler_environment.config_folder,
        )
    }

    /// Override where protected settings certificates are looked up
    pub fn with_certificate_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.certificate_dir = dir.into();
        self
    }

    /// Full path of the sequence watermark file
    pub fn sequence_path(&self) -> PathBuf {
        self.data_dir.join(&self.sequence_file)
    }

    /// Full path of the process record file
    pub fn process_path(&self) -> PathBuf {
        self.data_dir.join(&self.process_file)
    }

    /// Work directory for a given sequence number
    pub fn work_dir(&self, seq: i64) -> PathBuf {
        self.data_dir.join(&self.download_dir).join(seq.to_string())
    }

    /// Status document path for a given sequence number
    pub fn status_path(&self, seq: i64) -> PathBuf {
        self.status_dir.join(format!("{}.status", seq))
    }

    /// Settings file path for a given sequence number
    pub fn settings_path(&self, seq: i64) -> PathBuf {
        self.config_dir.join(format!("{}.settings", seq))
    }
}
