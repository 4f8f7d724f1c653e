use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use runcmd_core::config::{HandlerConfig, SEQUENCE_NUMBER_ENV};
use runcmd_core::dispatch::{CommandDispatcher, Operation};
use runcmd_core::handler_env::discover_environment;
use runcmd_core::redaction::SecretRegistry;
use runcmd_core::sequence::current_sequence_number;
use tracing::{error, info};

/// Log format options
#[derive(Debug, Clone, ValueEnum)]
pub enum LogFormat {
    /// Human-readable text format
    Text,
    /// JSON structured format
    Json,
}

/// Run-command VM extension handler
#[derive(Debug, Parser)]
#[command(name = "run-command-handler", version)]
pub struct Cli {
    /// Log format (overrides RUNCMD_LOG_FORMAT)
    #[arg(long, value_enum, global = true)]
    pub log_format: Option<LogFormat>,

    #[command(subcommand)]
    pub command: Commands,
}

/// Operations invoked by the host agent
#[derive(Debug, Clone, Copy, Subcommand)]
pub enum Commands {
    /// Prepare the handler's data directory
    Install,
    /// Run the configured command for the current sequence number
    Enable,
    /// Acknowledge a disable request
    Disable,
    /// Remove the handler's data directory
    Uninstall,
    /// Acknowledge an update request
    Update,
}

impl From<Commands> for Operation {
    fn from(command: Commands) -> Self {
        match command {
            Commands::Install => Operation::Install,
            Commands::Enable => Operation::Enable,
            Commands::Disable => Operation::Disable,
            Commands::Uninstall => Operation::Uninstall,
            Commands::Update => Operation::Update,
        }
    }
}

impl Cli {
    pub fn operation(&self) -> Operation {
        self.command.into()
    }

    /// Run the selected operation and return the process exit code.
    pub fn dispatch(self) -> Result<i32> {
        let log_format = match self.log_format {
            Some(LogFormat::Text) => Some("text"),
            Some(LogFormat::Json) => Some("json"),
            None => None,
        };
        runcmd_core::logging::init(log_format)?;

        let operation = self.operation();
        info!(
            operation = operation.as_str(),
            version = runcmd_core::version(),
            "Handler invoked"
        );

        let env = discover_environment().context("failed to discover handler environment")?;
        let config = HandlerConfig::from_environment(&env);

        let override_value = std::env::var(SEQUENCE_NUMBER_ENV).ok();
        let seq = current_sequence_number(override_value.as_deref(), &config.config_dir)
            .context("failed to determine sequence number")?;

        let mut dispatcher = CommandDispatcher::new(config, SecretRegistry::new());
        let outcome = dispatcher.dispatch(operation, seq).map_err(|e| {
            error!(error = %e, kind = ?e.kind(), "Failed to record outcome");
            e
        })?;

        info!(?outcome, "Handler finished");
        Ok(outcome.exit_code())
    }
}
