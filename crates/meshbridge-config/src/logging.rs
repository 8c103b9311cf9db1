// ── Tracing setup ──
//
// One subscriber for the whole process: `RUST_LOG` or the configured
// level, pretty or JSON lines, stdout or a daily rolling file.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use crate::ConfigError;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LogSettings {
    /// Filter directive used when `RUST_LOG` is unset.
    #[serde(default = "default_level")]
    pub level: String,

    #[serde(default)]
    pub format: LogFormat,

    /// Write to a daily rolling file here instead of stdout.
    pub directory: Option<PathBuf>,

    #[serde(default = "default_file_name")]
    pub file_name: String,
}

impl Default for LogSettings {
    fn default() -> Self {
        Self {
            level: default_level(),
            format: LogFormat::default(),
            directory: None,
            file_name: default_file_name(),
        }
    }
}

fn default_level() -> String {
    "info".into()
}
fn default_file_name() -> String {
    "meshbridge.log".into()
}

fn filter(settings: &LogSettings) -> Result<EnvFilter, ConfigError> {
    EnvFilter::try_from_default_env().or_else(|_| {
        EnvFilter::try_new(&settings.level).map_err(|e| ConfigError::Validation {
            field: "logging.level".into(),
            reason: e.to_string(),
        })
    })
}

/// Install the global subscriber. Hold the returned guard for the life
/// of the process so buffered lines are flushed.
pub fn init_tracing(settings: &LogSettings) -> Result<WorkerGuard, ConfigError> {
    let filter = filter(settings)?;

    let (writer, guard) = match &settings.directory {
        Some(directory) => {
            std::fs::create_dir_all(directory)?;
            tracing_appender::non_blocking(tracing_appender::rolling::daily(directory, &settings.file_name))
        }
        None => tracing_appender::non_blocking(std::io::stdout()),
    };
    let layer = fmt::layer()
        .with_writer(writer)
        .with_ansi(settings.directory.is_none())
        .with_target(true);

    let registry = tracing_subscriber::registry().with(filter);
    let installed = match settings.format {
        LogFormat::Pretty => registry.with(layer).try_init(),
        LogFormat::Json => registry.with(layer.json()).try_init(),
    };
    installed.map_err(|e| ConfigError::Logging(e.to_string()))?;

    Ok(guard)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn partial_section_keeps_defaults() {
        let settings: LogSettings = toml::from_str(r#"format = "json""#).unwrap();

        assert_eq!(settings.format, LogFormat::Json);
        assert_eq!(settings.level, "info");
        assert_eq!(settings.file_name, "meshbridge.log");
        assert!(settings.directory.is_none());
    }

    #[test]
    fn level_directives_are_accepted() {
        let settings = LogSettings {
            level: "warn,meshbridge_core=debug".into(),
            ..LogSettings::default()
        };

        assert!(filter(&settings).is_ok());
    }
}
