//! Status reporting
//!
//! The host agent learns the outcome of an operation by polling
//! `<status_dir>/<seq>.status`. The document layout and enum spellings below
//! are parsed by the host agent and must not change.
//!
//! Each sequence number follows its own state machine:
//!
//! ```text
//! NotReady -> Transitioning -> Success
//!                           -> Error
//! NotReady -> Error
//! ```
//!
//! `Success` and `Error` are terminal. `NotReady` is never written; it is the
//! implicit state before the first report for a sequence number.

use crate::errors::StatusError;
use crate::io::write_atomic;
use crate::redaction::SecretRegistry;
use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, instrument};

/// Version string written into every status document
pub const STATUS_VERSION: &str = "1.0";

/// Lifecycle state of one operation for one sequence number
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StatusKind {
    /// Initial in-memory state, never written to a status file
    #[serde(skip_serializing)]
    NotReady,
    Transitioning,
    Success,
    Error,
}

impl StatusKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            StatusKind::NotReady => "notready",
            StatusKind::Transitioning => "transitioning",
            StatusKind::Success => "success",
            StatusKind::Error => "error",
        }
    }

    /// Whether no further report may follow for the same sequence number
    pub fn is_terminal(&self) -> bool {
        matches!(self, StatusKind::Success | StatusKind::Error)
    }

    /// Whether the state machine permits moving from `self` to `next`
    pub fn can_transition_to(&self, next: StatusKind) -> bool {
        match (self, next) {
            (StatusKind::NotReady, StatusKind::Transitioning)
            | (StatusKind::NotReady, StatusKind::Error) => true,
            (StatusKind::Transitioning, StatusKind::Transitioning)
            | (StatusKind::Transitioning, StatusKind::Success)
            | (StatusKind::Transitioning, StatusKind::Error) => true,
            _ => false,
        }
    }
}

/// Localized message block
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FormattedMessage {
    pub lang: String,
    pub message: String,
}

impl FormattedMessage {
    pub fn en(message: impl Into<String>) -> Self {
        Self {
            lang: "en".to_string(),
            message: message.into(),
        }
    }
}

/// Secondary status entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubStatus {
    pub name: String,
    pub status: StatusKind,
    pub code: i32,
    pub formatted_message: FormattedMessage,
}

/// Operation status block
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusBody {
    #[serde(rename = "operationName")]
    pub operation: String,
    pub status: StatusKind,
    pub formatted_message: FormattedMessage,
    #[serde(rename = "subStatus", default, skip_serializing_if = "Vec::is_empty")]
    pub substatus: Vec<SubStatus>,
}

/// One status document as read by the host agent
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusDocument {
    pub version: String,
    #[serde(rename = "timestampUTC")]
    pub timestamp_utc: String,
    pub status: StatusBody,
}

impl StatusDocument {
    /// Build a document stamped with `now`
    pub fn new(
        now: DateTime<Utc>,
        status: StatusKind,
        operation: &str,
        message: &str,
    ) -> Self {
        Self {
            version: STATUS_VERSION.to_string(),
            timestamp_utc: now.to_rfc3339_opts(SecondsFormat::Secs, true),
            status: StatusBody {
                operation: operation.to_string(),
                status,
                formatted_message: FormattedMessage::en(message),
                substatus: Vec::new(),
            },
        }
    }

    pub fn with_substatus(mut self, substatus: SubStatus) -> Self {
        self.status.substatus.push(substatus);
        self
    }
}

/// Read the status document last written to `path`.
pub fn read_status_file(path: &Path) -> Result<StatusDocument, StatusError> {
    let content = fs::read_to_string(path)?;
    let mut documents: Vec<StatusDocument> = serde_json::from_str(&content)?;
    documents.pop().ok_or_else(|| {
        StatusError::Io(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("status file {} holds no document", path.display()),
        ))
    })
}

/// Writes per-sequence status documents and enforces the state machine
pub struct StatusReporter {
    status_dir: PathBuf,
    secrets: SecretRegistry,
    current: Option<(i64, StatusKind)>,
}

impl StatusReporter {
    pub fn new(status_dir: impl Into<PathBuf>, secrets: SecretRegistry) -> Self {
        Self {
            status_dir: status_dir.into(),
            secrets,
            current: None,
        }
    }

    /// Path of the status document for `seq`
    pub fn status_path(&self, seq: i64) -> PathBuf {
        self.status_dir.join(format!("{}.status", seq))
    }

    /// Current state of the machine for `seq`
    pub fn state(&self, seq: i64) -> StatusKind {
        match self.current {
            Some((current_seq, kind)) if current_seq == seq => kind,
            _ => StatusKind::NotReady,
        }
    }

    /// Write `status` for `seq`, replacing any earlier document for it.
    ///
    /// The message is redacted before it is written. Write failures are
    /// returned to the caller; nothing is retried.
    #[instrument(skip(self, message), fields(status = status.as_str()))]
    pub fn report(
        &mut self,
        seq: i64,
        status: StatusKind,
        operation: &str,
        message: &str,
    ) -> Result<(), StatusError> {
        let from = self.state(seq);
        if !from.can_transition_to(status) {
            return Err(StatusError::InvalidTransition {
                seq,
                from: from.as_str(),
                to: status.as_str(),
            });
        }

        let message = self.secrets.redact_text(message);
        let document = StatusDocument::new(Utc::now(), status, operation, &message);
        let json = serde_json::to_vec(&[document])?;
        let path = self.status_path(seq);
        write_atomic(&path, &json)?;

        self.current = Some((seq, status));
        debug!(seq, path = %path.display(), "Reported status");
        Ok(())
    }
}
