//! Sequence number idempotency
//!
//! The host agent numbers each configuration it hands to the handler. The
//! highest number the handler has completed (the watermark) is persisted as a
//! single decimal integer. Comparing the incoming number against the watermark
//! decides whether to run, skip an already-applied configuration, or reject a
//! sequence that went backwards.
//!
//! Committing the watermark is left to the caller so that a failed execution
//! does not advance it.

use crate::config::HandlerConfig;
use crate::errors::SequenceError;
use crate::io::{read_optional, write_atomic};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info, instrument, warn};

/// Watermark value meaning "nothing has run yet"
pub const NO_WATERMARK: i64 = -1;

/// Outcome of comparing the current sequence number against the watermark
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SequenceDecision {
    /// The configuration is new and must be applied
    Run,
    /// The configuration was already applied
    Skip,
    /// The configuration is older than one already applied
    Regressed { watermark: i64 },
}

/// Persists and compares the last processed sequence number
#[derive(Debug, Clone)]
pub struct SequenceGuard {
    path: PathBuf,
}

impl SequenceGuard {
    /// Guard backed by the watermark file named in `config`
    pub fn new(config: &HandlerConfig) -> Self {
        Self::with_path(config.sequence_path())
    }

    /// Guard backed by an explicit file
    pub fn with_path(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read the persisted watermark, [`NO_WATERMARK`] when absent.
    pub fn watermark(&self) -> Result<i64, SequenceError> {
        let Some(content) = read_optional(&self.path)? else {
            return Ok(NO_WATERMARK);
        };
        let trimmed = content.trim();
        if trimmed.is_empty() {
            warn!(path = %self.path.display(), "Sequence file is empty, treating as never run");
            return Ok(NO_WATERMARK);
        }
        trimmed.parse::<i64>().map_err(|_| SequenceError::Corrupt {
            path: self.path.display().to_string(),
            content: content.clone(),
        })
    }

    /// Decide whether the configuration numbered `current` must run.
    #[instrument(skip(self), fields(path = %self.path.display()))]
    pub fn should_process(&self, current: i64) -> Result<SequenceDecision, SequenceError> {
        let watermark = self.watermark()?;
        let decision = decide(current, watermark);
        debug!(current, watermark, ?decision, "Sequence check");
        Ok(decision)
    }

    /// Persist `seq` as the new watermark.
    #[instrument(skip(self), fields(path = %self.path.display()))]
    pub fn commit(&self, seq: i64) -> Result<(), SequenceError> {
        write_atomic(&self.path, seq.to_string().as_bytes())?;
        info!(seq, "Committed sequence watermark");
        Ok(())
    }
}

/// Pure comparison used by [`SequenceGuard::should_process`]
pub fn decide(current: i64, watermark: i64) -> SequenceDecision {
    use std::cmp::Ordering;
    match current.cmp(&watermark) {
        Ordering::Greater => SequenceDecision::Run,
        Ordering::Equal => SequenceDecision::Skip,
        Ordering::Less => SequenceDecision::Regressed { watermark },
    }
}

/// Parse a sequence number supplied by the host agent. Negative values are
/// rejected; no configuration is numbered below zero.
pub fn parse_sequence_number(value: &str) -> Result<i64, SequenceError> {
    let invalid = || SequenceError::InvalidValue {
        value: value.to_string(),
    };
    let n = value.trim().parse::<i64>().map_err(|_| invalid())?;
    if n < 0 {
        return Err(invalid());
    }
    Ok(n)
}

/// Determine the current sequence number.
///
/// The override value (normally the `ConfigSequenceNumber` environment
/// variable) takes precedence; otherwise the config directory is scanned for
/// the highest-numbered settings file. An override of `-1` means "unset".
pub fn current_sequence_number(
    override_value: Option<&str>,
    config_dir: &Path,
) -> Result<i64, SequenceError> {
    match override_value.map(str::trim).filter(|v| !v.is_empty()) {
        Some(value) if value.parse::<i64>() != Ok(NO_WATERMARK) => parse_sequence_number(value),
        _ => find_highest_numbered_config(config_dir),
    }
}

/// Return the highest `n` among `<n>.settings` files in `dir`. Only plain
/// decimal stems count, so `+5.settings` and `-3.settings` are ignored.
#[instrument]
pub fn find_highest_numbered_config(dir: &Path) -> Result<i64, SequenceError> {
    let mut highest: Option<i64> = None;
    for entry in fs::read_dir(dir)?.flatten() {
        let name = entry.file_name();
        let Some(name) = name.to_str() else {
            continue;
        };
        let Some(stem) = name.strip_suffix(".settings") else {
            continue;
        };
        if stem.is_empty() || !stem.bytes().all(|b| b.is_ascii_digit()) {
            continue;
        }
        if let Ok(n) = stem.parse::<i64>() {
            highest = Some(highest.map_or(n, |h| h.max(n)));
        }
    }
    highest.ok_or_else(|| SequenceError::NoConfiguration {
        dir: dir.display().to_string(),
    })
}
