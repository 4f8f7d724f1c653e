//! Settings resolution
//!
//! The host agent delivers configuration as two documents: public settings in
//! clear text and protected settings that arrive encrypted. [`resolve`] merges
//! them into one validated [`HandlerSettings`].
//!
//! ## Merge rules
//!
//! | field                         | rule                                           |
//! |-------------------------------|------------------------------------------------|
//! | `commandToExecute`            | public unless empty, then protected            |
//! | `script`                      | public unless empty, then protected            |
//! | `storageAccountName`          | public unless empty, then protected            |
//! | `storageAccountKey`           | public unless empty, then protected            |
//! | `skipLineEndingNormalization` | public unless false, then protected            |
//! | `fileURLs`                    | protected list if non-empty, else public list  |
//!
//! `fileURLs` is never merged element-wise; a non-empty protected list replaces
//! the public list as a whole.

use crate::errors::SettingsError;
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};

/// Clear-text settings document
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PublicSettings {
    /// Inline command line
    pub command_to_execute: String,
    /// Inline script body
    pub script: String,
    /// Files to fetch before running
    #[serde(rename = "fileUris", alias = "fileURLs")]
    pub file_urls: Vec<String>,
    /// Leave CRLF line endings untouched
    #[serde(rename = "skipDos2Unix", alias = "skipLineEndingNormalization")]
    pub skip_line_ending_normalization: bool,
    /// Storage account for authenticated downloads
    pub storage_account_name: String,
    /// Storage account key for authenticated downloads
    pub storage_account_key: String,
}

/// Encrypted settings document, same shape as the public one
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ProtectedSettings {
    pub command_to_execute: String,
    pub script: String,
    #[serde(rename = "fileUris", alias = "fileURLs")]
    pub file_urls: Vec<String>,
    #[serde(rename = "skipDos2Unix", alias = "skipLineEndingNormalization")]
    pub skip_line_ending_normalization: bool,
    pub storage_account_name: String,
    pub storage_account_key: String,
}

/// Storage credentials, present only when both halves are supplied
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageCredentials {
    pub account_name: String,
    pub account_key: String,
}

/// What the handler should run
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandSpec {
    /// A command line passed to the shell
    Command(String),
    /// A script body written to disk and run by the shell
    Script(String),
}

/// The validated, merged view of one configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandlerSettings {
    command_to_execute: Option<String>,
    script: Option<String>,
    file_urls: Vec<String>,
    skip_line_ending_normalization: bool,
    storage: Option<StorageCredentials>,
}

impl HandlerSettings {
    /// The inline command, if the configuration selected one
    pub fn command_to_execute(&self) -> Option<&str> {
        self.command_to_execute.as_deref()
    }

    /// The inline script, if the configuration selected one
    pub fn script(&self) -> Option<&str> {
        self.script.as_deref()
    }

    /// Files to download before execution, in declaration order
    pub fn file_urls(&self) -> &[String] {
        &self.file_urls
    }

    pub fn skip_line_ending_normalization(&self) -> bool {
        self.skip_line_ending_normalization
    }

    pub fn storage_credentials(&self) -> Option<&StorageCredentials> {
        self.storage.as_ref()
    }

    /// The single command or script selected by validation
    pub fn command_spec(&self) -> CommandSpec {
        match (&self.command_to_execute, &self.script) {
            (Some(cmd), _) => CommandSpec::Command(cmd.clone()),
            (None, Some(script)) => CommandSpec::Script(script.clone()),
            // resolve() guarantees one of the two is set
            (None, None) => CommandSpec::Command(String::new()),
        }
    }
}

fn pick(public: &str, protected: &str) -> Option<String> {
    let value = if public.is_empty() { protected } else { public };
    if value.is_empty() {
        None
    } else {
        Some(value.to_string())
    }
}

/// Merge and validate the two settings documents.
///
/// Validation runs in a fixed order and the first failing rule wins:
/// missing command, duplicate command, duplicate script, command/script
/// conflict, partial storage credentials.
#[instrument(skip_all)]
pub fn resolve(
    public: &PublicSettings,
    protected: &ProtectedSettings,
) -> Result<HandlerSettings, SettingsError> {
    let public_cmd = !public.command_to_execute.is_empty();
    let protected_cmd = !protected.command_to_execute.is_empty();
    let public_script = !public.script.is_empty();
    let protected_script = !protected.script.is_empty();

    if !public_cmd && !protected_cmd && !public_script && !protected_script {
        return Err(SettingsError::MissingCommand);
    }
    if public_cmd && protected_cmd {
        return Err(SettingsError::DuplicateCommand);
    }
    if public_script && protected_script {
        return Err(SettingsError::DuplicateScript);
    }

    let command_to_execute = pick(&public.command_to_execute, &protected.command_to_execute);
    let script = pick(&public.script, &protected.script);
    if command_to_execute.is_some() && script.is_some() {
        return Err(SettingsError::CommandAndScriptConflict);
    }

    let account_name = pick(&public.storage_account_name, &protected.storage_account_name);
    let account_key = pick(&public.storage_account_key, &protected.storage_account_key);
    let storage = match (account_name, account_key) {
        (Some(account_name), Some(account_key)) => Some(StorageCredentials {
            account_name,
            account_key,
        }),
        (None, None) => None,
        _ => return Err(SettingsError::PartialStorageCredentials),
    };

    let file_urls = if protected.file_urls.is_empty() {
        public.file_urls.clone()
    } else {
        protected.file_urls.clone()
    };

    let settings = HandlerSettings {
        command_to_execute,
        script,
        file_urls,
        skip_line_ending_normalization: public.skip_line_ending_normalization
            || protected.skip_line_ending_normalization,
        storage,
    };

    debug!(
        has_command = settings.command_to_execute.is_some(),
        has_script = settings.script.is_some(),
        file_count = settings.file_urls.len(),
        "Resolved handler settings"
    );

    Ok(settings)
}

/// Values from the protected document that must be kept out of logs and
/// status messages.
pub fn protected_values(protected: &ProtectedSettings) -> Vec<String> {
    let mut values = vec![
        protected.command_to_execute.clone(),
        protected.script.clone(),
        protected.storage_account_key.clone(),
    ];
    values.extend(protected.file_urls.iter().cloned());
    values.retain(|v| !v.is_empty());
    values
}
