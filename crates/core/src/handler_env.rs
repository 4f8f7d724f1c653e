//! Host agent environment and settings files
//!
//! The host agent describes where the handler should read configuration and
//! write status in `HandlerEnvironment.json`, placed one directory above the
//! handler executable. Configuration arrives as `<seq>.settings` files in the
//! config folder, with the protected half encrypted to a certificate the agent
//! installed on the machine.

use crate::errors::{EnvironmentError, SettingsError};
use crate::settings::{ProtectedSettings, PublicSettings};
use base64::Engine;
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use tracing::{debug, info, instrument, warn};

/// File the host agent writes next to the handler directory
pub const HANDLER_ENVIRONMENT_FILE: &str = "HandlerEnvironment.json";

/// Environment variable overriding where `HandlerEnvironment.json` is read from
pub const HANDLER_ENVIRONMENT_ENV: &str = "RUNCMD_HANDLER_ENVIRONMENT";

/// Folder locations provided by the host agent
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HandlerFolders {
    pub log_folder: PathBuf,
    pub config_folder: PathBuf,
    pub status_folder: PathBuf,
    #[serde(default)]
    pub heartbeat_file: Option<PathBuf>,
}

/// One entry of `HandlerEnvironment.json`
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HandlerEnvironment {
    #[serde(default)]
    pub version: serde_json::Value,
    pub handler_environment: HandlerFolders,
}

/// Locate and parse `HandlerEnvironment.json`.
///
/// `RUNCMD_HANDLER_ENVIRONMENT` wins when set; otherwise the file is expected
/// in the parent of the directory holding the executable.
#[instrument]
pub fn discover_environment() -> Result<HandlerEnvironment, EnvironmentError> {
    let path = match std::env::var_os(HANDLER_ENVIRONMENT_ENV) {
        Some(path) => PathBuf::from(path),
        None => {
            let exe = std::env::current_exe()?;
            exe.parent()
                .and_then(Path::parent)
                .map(|dir| dir.join(HANDLER_ENVIRONMENT_FILE))
                .ok_or_else(|| EnvironmentError::NotFound {
                    path: exe.display().to_string(),
                })?
        }
    };
    read_environment(&path)
}

/// Parse a `HandlerEnvironment.json` file at `path`.
pub fn read_environment(path: &Path) -> Result<HandlerEnvironment, EnvironmentError> {
    if !path.exists() {
        return Err(EnvironmentError::NotFound {
            path: path.display().to_string(),
        });
    }
    let content = fs::read_to_string(path)?;
    let mut entries: Vec<HandlerEnvironment> =
        serde_json::from_str(&content).map_err(|e| EnvironmentError::Parsing {
            message: e.to_string(),
        })?;
    if entries.len() != 1 {
        return Err(EnvironmentError::Parsing {
            message: format!("expected exactly one entry, found {}", entries.len()),
        });
    }
    let env = entries.remove(0);
    debug!(
        config = %env.handler_environment.config_folder.display(),
        status = %env.handler_environment.status_folder.display(),
        "Handler environment discovered"
    );
    Ok(env)
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SettingsFile {
    #[serde(default)]
    runtime_settings: Vec<RuntimeSettings>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RuntimeSettings {
    handler_settings: RawHandlerSettings,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct RawHandlerSettings {
    public_settings: Option<PublicSettings>,
    protected_settings: Option<String>,
    protected_settings_cert_thumbprint: Option<String>,
}

/// Decrypts the protected settings blob
pub trait ProtectedSettingsDecryptor {
    /// Decrypt `ciphertext` (DER PKCS#7) with the certificate named by `thumbprint`
    fn decrypt(&self, thumbprint: &str, ciphertext: &[u8]) -> Result<Vec<u8>, SettingsError>;
}

/// Decryption through the `openssl smime` command
#[derive(Debug, Clone)]
pub struct OpensslDecryptor {
    certificate_dir: PathBuf,
}

impl OpensslDecryptor {
    pub fn new(certificate_dir: impl Into<PathBuf>) -> Self {
        Self {
            certificate_dir: certificate_dir.into(),
        }
    }
}

impl ProtectedSettingsDecryptor for OpensslDecryptor {
    fn decrypt(&self, thumbprint: &str, ciphertext: &[u8]) -> Result<Vec<u8>, SettingsError> {
        let cert = self.certificate_dir.join(format!("{}.crt", thumbprint));
        let key = self.certificate_dir.join(format!("{}.prv", thumbprint));

        let input = tempfile::NamedTempFile::new().map_err(|e| SettingsError::Decryption {
            message: e.to_string(),
        })?;
        fs::write(input.path(), ciphertext).map_err(|e| SettingsError::Decryption {
            message: e.to_string(),
        })?;

        let output = Command::new("openssl")
            .args(["smime", "-inform", "DER", "-decrypt", "-recip"])
            .arg(&cert)
            .arg("-inkey")
            .arg(&key)
            .arg("-in")
            .arg(input.path())
            .output()
            .map_err(|e| SettingsError::Decryption {
                message: format!("failed to run openssl: {}", e),
            })?;

        if !output.status.success() {
            return Err(SettingsError::Decryption {
                message: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(output.stdout)
    }
}

/// Read the public and protected documents from a `<seq>.settings` file.
///
/// A file with no runtime settings yields two empty documents, which the
/// resolver rejects as a missing command.
#[instrument(skip(decryptor))]
pub fn read_settings_file(
    path: &Path,
    decryptor: &dyn ProtectedSettingsDecryptor,
) -> Result<(PublicSettings, ProtectedSettings), SettingsError> {
    let parse_error = |message: String| SettingsError::Parsing {
        path: path.display().to_string(),
        message,
    };

    let content = fs::read_to_string(path).map_err(|e| parse_error(e.to_string()))?;
    let file: SettingsFile =
        serde_json::from_str(&content).map_err(|e| parse_error(e.to_string()))?;

    let Some(runtime) = file.runtime_settings.into_iter().next() else {
        warn!("Settings file has no runtime settings");
        return Ok((PublicSettings::default(), ProtectedSettings::default()));
    };
    let raw = runtime.handler_settings;
    let public = raw.public_settings.unwrap_or_default();

    let protected = match raw.protected_settings.filter(|s| !s.is_empty()) {
        None => ProtectedSettings::default(),
        Some(encoded) => {
            let thumbprint = raw
                .protected_settings_cert_thumbprint
                .filter(|t| !t.is_empty())
                .ok_or_else(|| {
                    parse_error("protected settings present without a certificate thumbprint".into())
                })?;
            let ciphertext = base64::engine::general_purpose::STANDARD
                .decode(encoded.trim())
                .map_err(|e| parse_error(format!("protected settings are not base64: {}", e)))?;
            let plaintext = decryptor.decrypt(&thumbprint, &ciphertext)?;
            serde_json::from_slice(&plaintext)
                .map_err(|e| parse_error(format!("protected settings: {}", e)))?
        }
    };

    Ok((public, protected))
}

/// Truncate every `*.settings` file in `config_dir` so decrypted and encrypted
/// secrets do not remain on disk after they were consumed.
#[instrument]
pub fn scrub_settings_files(config_dir: &Path) -> std::io::Result<usize> {
    let mut scrubbed = 0;
    for entry in fs::read_dir(config_dir)?.flatten() {
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) != Some("settings") || !path.is_file() {
            continue;
        }
        fs::write(&path, b"")?;
        scrubbed += 1;
    }
    info!(count = scrubbed, "Scrubbed settings files");
    Ok(scrubbed)
}
