//! Logging and observability
//!
//! Structured logging via `tracing-subscriber`, either human-readable text or
//! JSON, selected at runtime. Output always goes to stderr: the host agent
//! reads the handler's results from status files, and stdout of the wrapped
//! command is captured separately.
//!
//! ## Environment Variables
//!
//! * `RUNCMD_LOG_FORMAT` - `json` for JSON lines, anything else for text
//! * `RUNCMD_LOG` - filter directives (`info`, `runcmd_core=debug`, ...)
//! * `RUST_LOG` - fallback filter when `RUNCMD_LOG` is unset
//!
//! ## Example
//!
//! ```rust
//! use runcmd_core::logging;
//!
//! logging::init(None).expect("Failed to initialize logging");
//! // Later calls are no-ops
//! logging::init(Some("json")).expect("Failed to initialize logging");
//! ```

use anyhow::Result;
use std::{io, sync::Once};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Environment variable selecting the output format
pub const LOG_FORMAT_ENV: &str = "RUNCMD_LOG_FORMAT";

/// Environment variable holding filter directives
pub const LOG_FILTER_ENV: &str = "RUNCMD_LOG";

static INIT: Once = Once::new();

/// Initialize the global subscriber.
///
/// `format` wins over `RUNCMD_LOG_FORMAT`. Safe to call more than once; only
/// the first call has an effect.
pub fn init(format: Option<&str>) -> Result<()> {
    INIT.call_once(|| {
        let filter = create_env_filter();

        let env_format = std::env::var(LOG_FORMAT_ENV).ok();
        let effective_format = format.or(env_format.as_deref()).unwrap_or("text");

        match effective_format {
            "json" => {
                tracing_subscriber::registry()
                    .with(
                        fmt::layer()
                            .json()
                            .with_target(true)
                            .with_current_span(true)
                            .with_span_events(fmt::format::FmtSpan::CLOSE)
                            .with_writer(io::stderr),
                    )
                    .with(filter)
                    .init();
            }
            _ => {
                tracing_subscriber::registry()
                    .with(fmt::layer().with_target(true).with_writer(io::stderr))
                    .with(filter)
                    .init();
            }
        }

        tracing::debug!("Logging initialized with format: {}", effective_format);
    });

    Ok(())
}

/// Filter from `RUNCMD_LOG`, then `RUST_LOG`, then `info`
fn create_env_filter() -> EnvFilter {
    if let Ok(spec) = std::env::var(LOG_FILTER_ENV) {
        EnvFilter::try_new(&spec).unwrap_or_else(|_| {
            eprintln!(
                "Invalid {} specification '{}', using default 'info'",
                LOG_FILTER_ENV, spec
            );
            EnvFilter::new("info")
        })
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    }
}

/// Whether [`init`] has already run
pub fn is_initialized() -> bool {
    INIT.is_completed()
}
