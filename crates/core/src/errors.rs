//! Error types and handling
//!
//! Each component owns a domain-specific error enum. They are wrapped in the
//! top-level [`HandlerError`] so the dispatcher can classify any failure into
//! the handler's error taxonomy and pick the status to report and the exit
//! code to return.

use thiserror::Error;

/// Settings resolution and validation errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SettingsError {
    /// Neither a command nor a script was supplied
    #[error("Either 'commandToExecute' or 'script' must be specified")]
    MissingCommand,

    /// commandToExecute appears in both the public and protected documents
    #[error("'commandToExecute' was specified both in public and protected settings; it must be specified only once")]
    DuplicateCommand,

    /// script appears in both the public and protected documents
    #[error("'script' was specified both in public and protected settings; it must be specified only once")]
    DuplicateScript,

    /// Both a command and a script resolved to a value
    #[error("'commandToExecute' and 'script' were both specified, but only one is allowed")]
    CommandAndScriptConflict,

    /// Only one of storageAccountName/storageAccountKey was supplied
    #[error("Both 'storageAccountName' and 'storageAccountKey' must be specified")]
    PartialStorageCredentials,

    /// The settings file could not be parsed
    #[error("Failed to parse settings file {path}: {message}")]
    Parsing { path: String, message: String },

    /// The protected settings blob could not be decrypted
    #[error("Failed to decrypt protected settings: {message}")]
    Decryption { message: String },
}

/// Sequence watermark errors
#[derive(Error, Debug)]
pub enum SequenceError {
    /// The requested sequence number is below the persisted watermark
    #[error("Sequence number {current} is lower than the last processed sequence number {watermark}")]
    Regressed { current: i64, watermark: i64 },

    /// The watermark file exists but does not hold an integer
    #[error("Sequence file {path} is corrupt: {content:?}")]
    Corrupt { path: String, content: String },

    /// The sequence number supplied by the host could not be parsed
    #[error("Invalid sequence number {value:?}")]
    InvalidValue { value: String },

    /// No numbered configuration file was found
    #[error("No configuration files found in {dir}")]
    NoConfiguration { dir: String },

    /// Watermark file I/O error
    #[error("Failed to access sequence file")]
    Io(#[from] std::io::Error),
}

/// Process record errors
#[derive(Error, Debug)]
pub enum ProcessError {
    /// The current process could not be identified
    #[error("Unable to determine current process: {0}")]
    CurrentProcess(String),

    /// Process record (de)serialization error
    #[error("Process record is malformed")]
    Json(#[from] serde_json::Error),

    /// Process record file I/O error
    #[error("Failed to access process record")]
    Io(#[from] std::io::Error),
}

/// Status reporting errors
#[derive(Error, Debug)]
pub enum StatusError {
    /// The requested transition is not permitted by the status state machine
    #[error("Invalid status transition for sequence {seq}: {from} -> {to}")]
    InvalidTransition {
        seq: i64,
        from: &'static str,
        to: &'static str,
    },

    /// Status document serialization error
    #[error("Failed to serialize status document")]
    Json(#[from] serde_json::Error),

    /// Status file I/O error
    #[error("Failed to write status file")]
    Io(#[from] std::io::Error),
}

/// Errors raised while preparing or running the wrapped command
#[derive(Error, Debug)]
pub enum ExecutionError {
    /// The command could not be started
    #[error("Failed to start command: {message}")]
    SpawnFailed { message: String },

    /// The command ran and returned a non-zero exit code; `output` holds the
    /// captured output tail surfaced in the status message
    #[error("Command exited with code {code}")]
    NonZeroExit { code: i32, output: String },

    /// A file referenced by the settings could not be downloaded
    #[error("Failed to download {url}: {message}")]
    Download { url: String, message: String },

    /// Work directory or output file I/O error
    #[error("Command I/O error")]
    Io(#[from] std::io::Error),
}

/// Host environment discovery errors
#[derive(Error, Debug)]
pub enum EnvironmentError {
    /// HandlerEnvironment.json could not be located
    #[error("Handler environment file not found: {path}")]
    NotFound { path: String },

    /// HandlerEnvironment.json could not be parsed
    #[error("Failed to parse handler environment: {message}")]
    Parsing { message: String },

    /// Environment file I/O error
    #[error("Failed to read handler environment")]
    Io(#[from] std::io::Error),
}

/// Failure classes of the handler, used to choose status and exit behaviour
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Missing, duplicate or conflicting settings
    Configuration,
    /// Sequence number moved backwards
    SequenceRegression,
    /// The wrapped command failed or could not be prepared
    Execution,
    /// State files could not be read or written
    Persistence,
}

/// Main error enum wrapping all domain-specific errors
#[derive(Error, Debug)]
pub enum HandlerError {
    /// Settings errors
    #[error("Configuration error: {0}")]
    Settings(#[from] SettingsError),

    /// Sequence watermark errors
    #[error("Sequence error: {0}")]
    Sequence(#[from] SequenceError),

    /// Process record errors
    #[error("Process record error: {0}")]
    Process(#[from] ProcessError),

    /// Status reporting errors
    #[error("Status error: {0}")]
    Status(#[from] StatusError),

    /// Command execution errors
    #[error("Execution error: {0}")]
    Execution(#[from] ExecutionError),

    /// Environment discovery errors
    #[error("Environment error: {0}")]
    Environment(#[from] EnvironmentError),

    /// Filesystem errors outside of the component-owned files
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl HandlerError {
    /// Classify this error into the handler's failure taxonomy
    pub fn kind(&self) -> ErrorKind {
        match self {
            HandlerError::Settings(_) => ErrorKind::Configuration,
            HandlerError::Sequence(SequenceError::Regressed { .. }) => {
                ErrorKind::SequenceRegression
            }
            HandlerError::Sequence(SequenceError::InvalidValue { .. })
            | HandlerError::Sequence(SequenceError::NoConfiguration { .. }) => {
                ErrorKind::Configuration
            }
            HandlerError::Sequence(_) => ErrorKind::Persistence,
            HandlerError::Process(_) | HandlerError::Status(_) | HandlerError::Io(_) => {
                ErrorKind::Persistence
            }
            HandlerError::Execution(_) => ErrorKind::Execution,
            HandlerError::Environment(_) => ErrorKind::Configuration,
        }
    }

    /// Captured command output attached to the error, if any
    pub fn output(&self) -> Option<&str> {
        match self {
            HandlerError::Execution(ExecutionError::NonZeroExit { output, .. }) => Some(output.as_str()),
            _ => None,
        }
    }
}

/// Convenience type alias for Results with HandlerError
pub type Result<T> = std::result::Result<T, HandlerError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_settings_error_display() {
        assert_eq!(
            SettingsError::MissingCommand.to_string(),
            "Either 'commandToExecute' or 'script' must be specified"
        );
        assert_eq!(
            SettingsError::PartialStorageCredentials.to_string(),
            "Both 'storageAccountName' and 'storageAccountKey' must be specified"
        );
    }

    #[test]
    fn test_sequence_regression_display() {
        let error = SequenceError::Regressed {
            current: 2,
            watermark: 5,
        };
        assert_eq!(
            error.to_string(),
            "Sequence number 2 is lower than the last processed sequence number 5"
        );
    }

    #[test]
    fn test_error_kind_classification() {
        let err: HandlerError = SettingsError::DuplicateScript.into();
        assert_eq!(err.kind(), ErrorKind::Configuration);

        let err: HandlerError = SequenceError::Regressed {
            current: 1,
            watermark: 2,
        }
        .into();
        assert_eq!(err.kind(), ErrorKind::SequenceRegression);

        let err: HandlerError = ExecutionError::NonZeroExit {
            code: 1,
            output: String::new(),
        }
        .into();
        assert_eq!(err.kind(), ErrorKind::Execution);

        let err: HandlerError =
            StatusError::Io(std::io::Error::new(std::io::ErrorKind::Other, "disk")).into();
        assert_eq!(err.kind(), ErrorKind::Persistence);
    }

    #[test]
    fn test_handler_error_wraps_source() {
        let err: HandlerError = SettingsError::MissingCommand.into();
        assert_eq!(
            err.to_string(),
            "Configuration error: Either 'commandToExecute' or 'script' must be specified"
        );
    }
}
