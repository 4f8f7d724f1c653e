//! End-to-end tests for the dispatcher with the process table, the shell and
//! the network replaced by in-memory fakes.

use runcmd_core::config::HandlerConfig;
use runcmd_core::dispatch::{CommandDispatcher, Operation, Outcome, SCRIPT_FILE};
use runcmd_core::download::Downloader;
use runcmd_core::errors::{ExecutionError, ProcessError, SettingsError};
use runcmd_core::exec::{CommandExecutor, ExecutionOutput, Invocation};
use runcmd_core::handler_env::ProtectedSettingsDecryptor;
use runcmd_core::process::{NeverAlive, ProcessLiveness, ProcessRecord};
use runcmd_core::redaction::SecretRegistry;
use runcmd_core::settings::StorageCredentials;
use runcmd_core::status::{read_status_file, StatusKind};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tempfile::TempDir;

const ME: ProcessRecord = ProcessRecord {
    pid: 100,
    start_time: 1_000,
};

/// Executor that echoes the command line back as stdout
#[derive(Clone, Default)]
struct RecordingExecutor {
    exit_code: i32,
    calls: Arc<Mutex<Vec<Invocation>>>,
}

impl RecordingExecutor {
    fn failing(exit_code: i32) -> Self {
        Self {
            exit_code,
            ..Self::default()
        }
    }

    fn calls(&self) -> Vec<Invocation> {
        self.calls.lock().unwrap().clone()
    }
}

impl CommandExecutor for RecordingExecutor {
    fn execute(
        &self,
        invocation: &Invocation,
        _work_dir: &Path,
    ) -> Result<ExecutionOutput, ExecutionError> {
        self.calls.lock().unwrap().push(invocation.clone());
        let stdout_tail = match invocation {
            Invocation::Shell(cmd) => cmd.clone(),
            Invocation::ScriptFile(path) => fs::read_to_string(path)?,
        };
        Ok(ExecutionOutput {
            exit_code: self.exit_code,
            stdout_tail,
            stderr_tail: String::new(),
        })
    }
}

/// Downloader that writes a CRLF file per URL
#[derive(Clone, Default)]
struct FakeDownloader {
    requested: Arc<Mutex<Vec<String>>>,
}

impl Downloader for FakeDownloader {
    fn download(
        &self,
        urls: &[String],
        dest_dir: &Path,
        _credentials: Option<&StorageCredentials>,
    ) -> Result<Vec<PathBuf>, ExecutionError> {
        let mut paths = Vec::new();
        for url in urls {
            self.requested.lock().unwrap().push(url.clone());
            let name = url.rsplit('/').next().unwrap_or("file");
            let path = dest_dir.join(name);
            fs::write(&path, "line one\r\nline two\r\n")?;
            paths.push(path);
        }
        Ok(paths)
    }
}

/// Decryptor returning a fixed protected document
struct FixedDecryptor(&'static str);

impl ProtectedSettingsDecryptor for FixedDecryptor {
    fn decrypt(&self, _thumbprint: &str, _ciphertext: &[u8]) -> Result<Vec<u8>, SettingsError> {
        Ok(self.0.as_bytes().to_vec())
    }
}

/// Liveness where every recorded process is still running
struct AlwaysAlive;

impl ProcessLiveness for AlwaysAlive {
    fn is_alive(&self, _pid: u32, _start_time: u64) -> bool {
        true
    }

    fn current(&self) -> Result<ProcessRecord, ProcessError> {
        Ok(ME)
    }
}

struct Harness {
    _temp_dir: TempDir,
    config: HandlerConfig,
    executor: RecordingExecutor,
    downloader: FakeDownloader,
}

impl Harness {
    fn new() -> Self {
        Self::with_executor(RecordingExecutor::default())
    }

    fn with_executor(executor: RecordingExecutor) -> Self {
        let temp_dir = TempDir::new().unwrap();
        let root = temp_dir.path();
        fs::create_dir_all(root.join("config")).unwrap();
        let config = HandlerConfig::new(root.join("data"), root.join("status"), root.join("config"));
        Self {
            _temp_dir: temp_dir,
            config,
            executor,
            downloader: FakeDownloader::default(),
        }
    }

    fn write_public(&self, seq: i64, public: &str) {
        fs::write(
            self.config.settings_path(seq),
            format!(
                r#"{{"runtimeSettings":[{{"handlerSettings":{{"publicSettings":{}}}}}]}}"#,
                public
            ),
        )
        .unwrap();
    }

    fn write_protected(&self, seq: i64, public: &str) {
        fs::write(
            self.config.settings_path(seq),
            format!(
                r#"{{"runtimeSettings":[{{"handlerSettings":{{
                    "publicSettings":{},
                    "protectedSettingsCertThumbprint":"ABC123",
                    "protectedSettings":"AAAA"}}}}]}}"#,
                public
            ),
        )
        .unwrap();
    }

    fn dispatcher(&self) -> CommandDispatcher {
        CommandDispatcher::new(self.config.clone(), SecretRegistry::new())
            .with_liveness(NeverAlive { current: ME })
            .with_executor(self.executor.clone())
            .with_downloader(self.downloader.clone())
            .with_decryptor(FixedDecryptor("{}"))
    }

    fn watermark(&self) -> Option<String> {
        fs::read_to_string(self.config.sequence_path()).ok()
    }

    fn status(&self, seq: i64) -> Option<(StatusKind, String, String)> {
        let path = self.config.status_path(seq);
        if !path.exists() {
            return None;
        }
        let doc = read_status_file(&path).unwrap();
        Some((
            doc.status.status,
            doc.status.operation,
            doc.status.formatted_message.message,
        ))
    }
}

#[test]
fn test_enable_runs_once_per_sequence_number() {
    let h = Harness::new();
    h.write_public(0, r#"{"commandToExecute":"echo hello"}"#);

    let outcome = h.dispatcher().dispatch(Operation::Enable, 0).unwrap();
    assert_eq!(outcome, Outcome::Completed);

    let (status, operation, message) = h.status(0).unwrap();
    assert_eq!(status, StatusKind::Success);
    assert_eq!(operation, "Enable");
    assert_eq!(message, "\n[stdout]\necho hello\n[stderr]\n");
    assert_eq!(h.watermark().as_deref(), Some("0"));

    // A second invocation for the same number neither runs nor reports
    fs::remove_file(h.config.status_path(0)).unwrap();
    let outcome = h.dispatcher().dispatch(Operation::Enable, 0).unwrap();
    assert_eq!(outcome, Outcome::Skipped);
    assert!(h.status(0).is_none());
    assert_eq!(h.executor.calls().len(), 1);
}

#[test]
fn test_enable_skips_numbers_below_applied_watermark() {
    let h = Harness::new();
    fs::create_dir_all(&h.config.data_dir).unwrap();
    fs::write(h.config.sequence_path(), "3").unwrap();
    h.write_public(3, r#"{"commandToExecute":"date"}"#);

    let outcome = h.dispatcher().dispatch(Operation::Enable, 3).unwrap();
    assert_eq!(outcome, Outcome::Skipped);
    assert!(h.status(3).is_none());
    assert!(h.executor.calls().is_empty());
}

#[test]
fn test_enable_rejects_regressed_sequence_number() {
    let h = Harness::new();
    fs::create_dir_all(&h.config.data_dir).unwrap();
    fs::write(h.config.sequence_path(), "5").unwrap();
    h.write_public(2, r#"{"commandToExecute":"date"}"#);

    let outcome = h.dispatcher().dispatch(Operation::Enable, 2).unwrap();
    assert_eq!(outcome.exit_code(), 3);
    assert!(matches!(outcome, Outcome::Failed { .. }));

    let (status, _, message) = h.status(2).unwrap();
    assert_eq!(status, StatusKind::Error);
    assert!(message.contains("lower than the last processed sequence number 5"));
    assert_eq!(h.watermark().as_deref(), Some("5"));
    assert!(h.executor.calls().is_empty());
}

#[test]
fn test_enable_recovers_from_stale_process_record() {
    let h = Harness::new();
    fs::create_dir_all(&h.config.data_dir).unwrap();
    fs::write(
        h.config.process_path(),
        r#"{"pid":4194304,"startTime":42}"#,
    )
    .unwrap();
    h.write_public(1, r#"{"commandToExecute":"date"}"#);

    let outcome = h.dispatcher().dispatch(Operation::Enable, 1).unwrap();
    assert_eq!(outcome, Outcome::Completed);
    // Our own record is released once done
    assert!(!h.config.process_path().exists());
}

#[test]
fn test_enable_backs_off_when_another_instance_runs() {
    let h = Harness::new();
    fs::create_dir_all(&h.config.data_dir).unwrap();
    fs::write(h.config.process_path(), r#"{"pid":200,"startTime":2000}"#).unwrap();
    h.write_public(1, r#"{"commandToExecute":"date"}"#);

    let outcome = h
        .dispatcher()
        .with_liveness(AlwaysAlive)
        .dispatch(Operation::Enable, 1)
        .unwrap();

    assert_eq!(outcome, Outcome::AlreadyRunning);
    assert_eq!(outcome.exit_code(), 0);
    assert!(h.status(1).is_none());
    assert!(h.executor.calls().is_empty());
    assert!(h.watermark().is_none());
    // The other instance's record stays in place
    assert!(h.config.process_path().exists());
}

#[test]
fn test_configuration_error_reports_error_without_commit() {
    let h = Harness::new();
    h.write_public(4, r#"{"fileUris":["https://example.com/a.sh"]}"#);

    let outcome = h.dispatcher().dispatch(Operation::Enable, 4).unwrap();
    assert_eq!(outcome.exit_code(), 3);

    let (status, _, message) = h.status(4).unwrap();
    assert_eq!(status, StatusKind::Error);
    assert!(message.contains("Either 'commandToExecute' or 'script' must be specified"));
    assert!(h.watermark().is_none());
    assert!(h.executor.calls().is_empty());
}

#[test]
fn test_failed_command_surfaces_output_and_allows_retry() {
    let h = Harness::with_executor(RecordingExecutor::failing(7));
    h.write_public(2, r#"{"commandToExecute":"false"}"#);

    let outcome = h.dispatcher().dispatch(Operation::Enable, 2).unwrap();
    assert_eq!(outcome.exit_code(), 3);

    let (status, _, message) = h.status(2).unwrap();
    assert_eq!(status, StatusKind::Error);
    assert!(message.starts_with("Execution error: Command exited with code 7"));
    assert!(message.ends_with("\n[stdout]\nfalse\n[stderr]\n"));

    // Nothing committed and the settings are kept for a retry
    assert!(h.watermark().is_none());
    assert!(!fs::read_to_string(h.config.settings_path(2))
        .unwrap()
        .is_empty());
}

#[test]
fn test_protected_values_are_redacted_in_status() {
    let h = Harness::new();
    h.write_protected(1, "{}");

    let mut dispatcher = h
        .dispatcher()
        .with_decryptor(FixedDecryptor(r#"{"commandToExecute":"echo s3cr3t-token"}"#));
    let outcome = dispatcher.dispatch(Operation::Enable, 1).unwrap();
    assert_eq!(outcome, Outcome::Completed);

    let (_, _, message) = h.status(1).unwrap();
    assert!(!message.contains("s3cr3t-token"));
    assert!(message.contains("****"));
}

#[test]
fn test_script_is_written_and_normalized() {
    let h = Harness::new();
    h.write_public(
        6,
        r#"{"script":"echo a\r\necho b\r\n","fileUris":["https://example.com/x/helper.sh?sig=1"]}"#,
    );

    let outcome = h.dispatcher().dispatch(Operation::Enable, 6).unwrap();
    assert_eq!(outcome, Outcome::Completed);

    let work_dir = h.config.work_dir(6);
    assert_eq!(
        h.executor.calls(),
        vec![Invocation::ScriptFile(work_dir.join(SCRIPT_FILE))]
    );
    assert_eq!(
        fs::read_to_string(work_dir.join(SCRIPT_FILE)).unwrap(),
        "echo a\necho b\n"
    );
    assert_eq!(
        h.downloader.requested.lock().unwrap().as_slice(),
        ["https://example.com/x/helper.sh?sig=1".to_string()]
    );
}

#[test]
fn test_skip_line_ending_normalization() {
    let h = Harness::new();
    h.write_public(
        1,
        r#"{"commandToExecute":"sh a.sh","fileUris":["https://example.com/a.sh"],"skipDos2Unix":true}"#,
    );

    h.dispatcher().dispatch(Operation::Enable, 1).unwrap();
    assert_eq!(
        fs::read_to_string(h.config.work_dir(1).join("a.sh")).unwrap(),
        "line one\r\nline two\r\n"
    );
}

#[test]
fn test_successful_enable_scrubs_settings_files() {
    let h = Harness::new();
    h.write_public(0, r#"{"commandToExecute":"date"}"#);
    h.write_public(1, r#"{"commandToExecute":"date"}"#);

    h.dispatcher().dispatch(Operation::Enable, 1).unwrap();

    assert_eq!(fs::read_to_string(h.config.settings_path(0)).unwrap(), "");
    assert_eq!(fs::read_to_string(h.config.settings_path(1)).unwrap(), "");
}

#[test]
fn test_install_and_uninstall_manage_data_dir() {
    let h = Harness::new();

    let outcome = h.dispatcher().dispatch(Operation::Install, 0).unwrap();
    assert_eq!(outcome, Outcome::Completed);
    assert!(h.config.data_dir.is_dir());
    let (status, operation, _) = h.status(0).unwrap();
    assert_eq!(status, StatusKind::Success);
    assert_eq!(operation, "Install");

    let outcome = h.dispatcher().dispatch(Operation::Uninstall, 0).unwrap();
    assert_eq!(outcome, Outcome::Completed);
    assert!(!h.config.data_dir.exists());

    // Nothing to remove is still success
    let outcome = h.dispatcher().dispatch(Operation::Uninstall, 0).unwrap();
    assert_eq!(outcome, Outcome::Completed);
}

#[test]
fn test_disable_and_update_are_not_gated() {
    let h = Harness::new();
    fs::create_dir_all(&h.config.data_dir).unwrap();
    fs::write(h.config.sequence_path(), "9").unwrap();

    for operation in [Operation::Disable, Operation::Update] {
        let outcome = h.dispatcher().dispatch(operation, 2).unwrap();
        assert_eq!(outcome, Outcome::Completed);
        let (status, name, _) = h.status(2).unwrap();
        assert_eq!(status, StatusKind::Success);
        assert_eq!(name, operation.as_str());
    }
    assert_eq!(h.watermark().as_deref(), Some("9"));
}
