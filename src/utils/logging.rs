//! Structured logging setup.
//!
//! The library itself only emits `tracing` events; installing a subscriber
//! is left to the embedding process. [`init_logging`] is a convenience for
//! binaries and tests that want the configured format without wiring
//! `tracing-subscriber` themselves.

use crate::config::LoggingConfig;
use crate::error::{ProtocolError, Result};
use std::fs::OpenOptions;
use std::sync::{Mutex, OnceLock};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter, Layer, Registry};

type OutputLayer = Box<dyn Layer<Registry> + Send + Sync>;

static INSTALLED: OnceLock<std::result::Result<(), String>> = OnceLock::new();

/// Install a global subscriber built from `config`.
///
/// `RUST_LOG` overrides the configured level when set. Only the first call
/// installs anything; later calls return that first outcome, so a failed
/// install keeps being reported.
pub fn init_logging(config: &LoggingConfig) -> Result<()> {
    init_once(&INSTALLED, || install(config))
}

fn init_once<F>(cell: &OnceLock<std::result::Result<(), String>>, install: F) -> Result<()>
where
    F: FnOnce() -> std::result::Result<(), String>,
{
    cell.get_or_init(install)
        .clone()
        .map_err(|e| ProtocolError::ConfigError(format!("logging: {e}")))
}

fn install(config: &LoggingConfig) -> std::result::Result<(), String> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.log_level.as_str().to_lowercase()));

    tracing_subscriber::registry()
        .with(output_layers(config)?)
        .with(filter)
        .try_init()
        .map_err(|e| e.to_string())?;
    tracing::debug!(app = %config.app_name, "logging initialized");
    Ok(())
}

/// One formatting layer per enabled output. Console and file may both be on.
fn output_layers(config: &LoggingConfig) -> std::result::Result<Vec<OutputLayer>, String> {
    let mut layers = Vec::with_capacity(2);

    if config.log_to_console {
        let layer = fmt::layer().with_target(true);
        layers.push(if config.json_format { layer.json().boxed() } else { layer.boxed() });
    }

    if let (true, Some(path)) = (config.log_to_file, config.log_file_path.as_deref()) {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(|e| format!("cannot open {path}: {e}"))?;
        let layer = fmt::layer()
            .with_target(true)
            .with_ansi(false)
            .with_writer(Mutex::new(file));
        layers.push(if config.json_format { layer.json().boxed() } else { layer.boxed() });
    }

    Ok(layers)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_second_call_is_noop() {
        let config = LoggingConfig::default();
        let first = init_logging(&config);
        assert_eq!(init_logging(&config).is_ok(), first.is_ok());
    }

    #[test]
    fn test_failed_install_is_reported_every_time() {
        let cell = OnceLock::new();
        let first = init_once(&cell, || Err("no writer".to_string()));
        assert!(matches!(first, Err(ProtocolError::ConfigError(ref m)) if m.contains("no writer")));

        let again = init_once(&cell, || Ok(()));
        assert!(again.is_err());
    }

    #[test]
    fn test_console_and_file_both_get_a_layer() {
        let path = std::env::temp_dir().join(format!("vnet-logging-{}.log", std::process::id()));
        let mut config = LoggingConfig {
            log_to_file: true,
            log_file_path: Some(path.display().to_string()),
            ..LoggingConfig::default()
        };
        assert_eq!(output_layers(&config).unwrap().len(), 2);

        config.log_to_console = false;
        assert_eq!(output_layers(&config).unwrap().len(), 1);

        config.json_format = true;
        config.log_to_console = true;
        config.log_to_file = false;
        assert_eq!(output_layers(&config).unwrap().len(), 1);
        let _ = std::fs::remove_file(path);
    }

    #[test]
    fn test_unopenable_log_file_is_an_error() {
        let config = LoggingConfig {
            log_to_file: true,
            log_file_path: Some("/nonexistent-vnet-dir/node.log".to_string()),
            ..LoggingConfig::default()
        };
        assert!(output_layers(&config).is_err());
    }
}
