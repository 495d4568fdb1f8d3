//! ---
//! ems_section: "01-core-functionality"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Shared primitives and utilities for the telemetry runtime."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use anyhow::Result;
use once_cell::sync::OnceCell;
use serde::{Deserialize, Serialize};
use tracing::info;
use tracing_appender::rolling::daily;
use tracing_subscriber::filter::EnvFilter;
use tracing_subscriber::fmt;
use tracing_subscriber::layer::{Layer, SubscriberExt};
use tracing_subscriber::util::SubscriberInitExt;

use crate::config::LoggingConfig;

const LOG_ENV: &str = "GRIDTEL_LOG";
/// Pipeline events at `info`, per-request spans at `debug`. Storage and
/// websocket plumbing crates stay at `warn` since they log every statement
/// and frame.
const DEFAULT_DIRECTIVE: &str =
    "info,tower_http=debug,rusqlite=warn,hyper=warn,tungstenite=warn,tokio_tungstenite=warn";

static FILE_GUARD: OnceCell<tracing_appender::non_blocking::WorkerGuard> = OnceCell::new();
static STDOUT_GUARD: OnceCell<tracing_appender::non_blocking::WorkerGuard> = OnceCell::new();

/// Available log formats for the daemon.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum LogFormat {
    #[default]
    StructuredJson,
    Pretty,
}

/// Initialize the tracing subscriber based on configuration and environment variables.
///
/// * `GRIDTEL_LOG` overrides the log filter (e.g. `info`, `debug,rusqlite=trace`).
///   When unset the standard `RUST_LOG` variable is honoured, finally defaulting to
///   `info` with request tracing at `debug` and storage/socket crates at `warn`.
/// * Stdout receives structured JSON or pretty output per configuration, and a
///   daily rolling JSON file named `{prefix}-{service}.log` is written under the
///   configured directory. Several daemons can therefore share one log directory.
pub fn init_tracing(service_name: &str, config: &LoggingConfig) -> Result<()> {
    std::fs::create_dir_all(&config.directory)?;
    let prefix = config
        .file_prefix
        .clone()
        .unwrap_or_else(|| service_name.to_owned());

    let file_appender = daily(&config.directory, log_file_name(&prefix, service_name));
    let (file_writer, file_guard) = tracing_appender::non_blocking(file_appender);
    let (stdout_writer, stdout_guard) = tracing_appender::non_blocking(std::io::stdout());

    let _ = FILE_GUARD.set(file_guard);
    let _ = STDOUT_GUARD.set(stdout_guard);

    let filter = build_filter(std::env::var(LOG_ENV).ok().as_deref());

    let fmt_layer = match config.format {
        LogFormat::StructuredJson => fmt::layer()
            .with_target(false)
            .with_timer(fmt::time::UtcTime::rfc_3339())
            .json()
            .with_writer(stdout_writer)
            .boxed(),
        LogFormat::Pretty => fmt::layer()
            .with_target(true)
            .with_timer(fmt::time::UtcTime::rfc_3339())
            .with_writer(stdout_writer)
            .boxed(),
    };

    let file_layer = fmt::layer()
        .with_target(true)
        .with_timer(fmt::time::UtcTime::rfc_3339())
        .json()
        .with_writer(file_writer)
        .boxed();

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt_layer)
        .with(file_layer)
        .try_init()
        .ok();

    info!(service = %service_name, log_dir = %config.directory.display(), format = ?config.format, "tracing initialised");
    Ok(())
}

/// Rolling file name for `service`; a prefix equal to the service name is not repeated.
fn log_file_name(prefix: &str, service_name: &str) -> String {
    if prefix == service_name {
        format!("{service_name}.log")
    } else {
        format!("{prefix}-{service_name}.log")
    }
}

fn build_filter(directive: Option<&str>) -> EnvFilter {
    match directive {
        Some(directive) => EnvFilter::try_new(directive).unwrap_or_else(|err| {
            eprintln!(
                "invalid {} directive ({}); defaulting to {}",
                LOG_ENV, err, DEFAULT_DIRECTIVE
            );
            EnvFilter::new(DEFAULT_DIRECTIVE)
        }),
        None => EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(DEFAULT_DIRECTIVE)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn log_format_uses_kebab_case() {
        let format: LogFormat = serde_json::from_str("\"structured-json\"").unwrap();
        assert_eq!(format, LogFormat::StructuredJson);
        let pretty: LogFormat = serde_json::from_str("\"pretty\"").unwrap();
        assert_eq!(pretty, LogFormat::Pretty);
    }

    #[test]
    fn file_name_combines_prefix_and_service() {
        assert_eq!(log_file_name("gridteld", "gridteld"), "gridteld.log");
        assert_eq!(log_file_name("site-a", "gridteld"), "site-a-gridteld.log");
    }

    #[test]
    fn default_directive_quiets_storage_and_socket_crates() {
        let filter = build_filter(Some(DEFAULT_DIRECTIVE)).to_string();
        assert!(filter.contains("rusqlite=warn"));
        assert!(filter.contains("tungstenite=warn"));
    }

    #[test]
    fn invalid_directive_falls_back_to_default() {
        let filter = build_filter(Some("gridtel=notalevel")).to_string();
        assert!(filter.contains("tower_http=debug"));
    }
}
