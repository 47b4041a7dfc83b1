//! Logging setup for the master and worker processes.
//!
//! # Environment Variables
//!
//! - `PIXELPIPE_LOG` - Log filter (overrides RUST_LOG)
//! - `PIXELPIPE_LOG_LEVEL` - Log level: error, warn, info, debug, trace
//! - `PIXELPIPE_LOG_FORMAT` - Output format: pretty, compact, json
//! - `PIXELPIPE_LOG_FILE` - Path to log file (in addition to stderr, master only)
//! - `PIXELPIPE_LOG_ROTATION` - Log file rotation: hourly, daily, never
//! - `RUST_LOG` - Standard Rust log filter (fallback)
//!
//! Workers inherit the master's stderr. The master hands its effective filter
//! to them through `PIXELPIPE_LOG` so `-v` on the command line reaches every
//! process.

use std::path::{Path, PathBuf};
use std::str::FromStr;

use tracing::Level;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{
    EnvFilter, Layer, Registry,
    fmt::{self, MakeWriter, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
};

pub const LOG_ENV: &str = "PIXELPIPE_LOG";
const LOG_LEVEL_ENV: &str = "PIXELPIPE_LOG_LEVEL";
const LOG_FORMAT_ENV: &str = "PIXELPIPE_LOG_FORMAT";
const LOG_FILE_ENV: &str = "PIXELPIPE_LOG_FILE";
const LOG_ROTATION_ENV: &str = "PIXELPIPE_LOG_ROTATION";

/// Log output format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LogFormat {
    /// Human-readable multi-field format
    #[default]
    Pretty,
    /// Compact single-line format
    Compact,
    /// JSON format for log aggregation systems
    Json,
}

impl FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pretty" | "full" => Ok(Self::Pretty),
            "compact" => Ok(Self::Compact),
            "json" => Ok(Self::Json),
            _ => Err(format!(
                "Unknown log format: '{}'. Valid options: pretty, compact, json",
                s
            )),
        }
    }
}

impl std::fmt::Display for LogFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pretty => write!(f, "pretty"),
            Self::Compact => write!(f, "compact"),
            Self::Json => write!(f, "json"),
        }
    }
}

/// Log rotation for file output.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LogRotation {
    Hourly,
    Daily,
    /// Single file, appended to across runs.
    #[default]
    Never,
}

impl FromStr for LogRotation {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "hourly" => Ok(Self::Hourly),
            "daily" => Ok(Self::Daily),
            "never" => Ok(Self::Never),
            _ => Err(format!(
                "Unknown log rotation: '{}'. Valid options: hourly, daily, never",
                s
            )),
        }
    }
}

impl From<LogRotation> for Rotation {
    fn from(rotation: LogRotation) -> Self {
        match rotation {
            LogRotation::Hourly => Rotation::HOURLY,
            LogRotation::Daily => Rotation::DAILY,
            LogRotation::Never => Rotation::NEVER,
        }
    }
}

/// Logging configuration.
#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Base log level (default: WARN, so a run's report stays readable)
    pub level: Level,
    pub format: LogFormat,
    /// Path to log file (None = stderr only)
    pub file_path: Option<PathBuf>,
    pub rotation: LogRotation,
    /// Log span timing on close
    pub span_events: bool,
    /// Custom filter string (overrides level if set)
    pub filter: Option<String>,
    pub show_target: bool,
    /// Tag lines with thread IDs (collector threads in the master)
    pub show_thread_ids: bool,
    /// Whether `PIXELPIPE_LOG_FILE` may enable file output.
    pub allow_file: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: Level::WARN,
            format: LogFormat::Pretty,
            file_path: None,
            rotation: LogRotation::Never,
            span_events: false,
            filter: None,
            show_target: true,
            show_thread_ids: false,
            allow_file: true,
        }
    }
}

impl LogConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Preset for a worker process: compact lines on the shared stderr and
    /// never a log file, which belongs to the master.
    pub fn for_worker() -> Self {
        Self {
            format: LogFormat::Compact,
            show_target: false,
            allow_file: false,
            ..Self::default()
        }
    }

    pub fn with_level(mut self, level: Level) -> Self {
        self.level = level;
        self
    }

    pub fn with_format(mut self, format: LogFormat) -> Self {
        self.format = format;
        self
    }

    pub fn with_file(mut self, path: PathBuf) -> Self {
        self.file_path = Some(path);
        self
    }

    pub fn with_rotation(mut self, rotation: LogRotation) -> Self {
        self.rotation = rotation;
        self
    }

    pub fn with_thread_ids(mut self, enabled: bool) -> Self {
        self.show_thread_ids = enabled;
        self
    }

    pub fn with_span_events(mut self, enabled: bool) -> Self {
        self.span_events = enabled;
        self
    }

    pub fn with_filter(mut self, filter: String) -> Self {
        self.filter = Some(filter);
        self
    }

    /// Apply environment variable overrides.
    ///
    /// CLI arguments take precedence: if a filter is already set (from `-v`
    /// or `-q`), neither `PIXELPIPE_LOG` nor `PIXELPIPE_LOG_LEVEL` applies.
    pub fn with_env_overrides(self) -> Self {
        self.with_overrides_from(|key| std::env::var(key).ok())
    }

    fn with_overrides_from(mut self, var: impl Fn(&str) -> Option<String>) -> Self {
        if self.filter.is_none() {
            self.filter = var(LOG_ENV).or_else(|| var("RUST_LOG"));
        }

        if self.filter.is_none() {
            if let Some(level) = var(LOG_LEVEL_ENV).as_deref().and_then(parse_level) {
                self = self.with_level(level);
            }
        }

        if let Some(format) = var(LOG_FORMAT_ENV) {
            if let Ok(format) = format.parse() {
                self = self.with_format(format);
            }
        }

        if self.allow_file {
            if let Some(path) = var(LOG_FILE_ENV) {
                self = self.with_file(PathBuf::from(path));
            }
            if let Some(rotation) = var(LOG_ROTATION_ENV) {
                match rotation.parse() {
                    Ok(rotation) => self = self.with_rotation(rotation),
                    Err(e) => eprintln!("Warning: {}", e),
                }
            }
        }

        self
    }

    /// The filter directive this config logs with, for handing to workers.
    pub fn effective_filter(&self) -> String {
        match &self.filter {
            Some(filter) if EnvFilter::try_new(filter).is_ok() => filter.clone(),
            _ => self.level.to_string().to_lowercase(),
        }
    }

    fn build_filter(&self) -> EnvFilter {
        if let Some(ref filter) = self.filter {
            EnvFilter::try_new(filter).unwrap_or_else(|_| {
                eprintln!("Warning: Invalid log filter '{}', using default", filter);
                EnvFilter::new(self.level.to_string().to_lowercase())
            })
        } else {
            EnvFilter::new(self.level.to_string().to_lowercase())
        }
    }

    fn fmt_layer<W>(&self, writer: W, ansi: bool) -> Box<dyn Layer<Registry> + Send + Sync>
    where
        W: for<'w> MakeWriter<'w> + Send + Sync + 'static,
    {
        let span_events = if self.span_events {
            FmtSpan::CLOSE
        } else {
            FmtSpan::NONE
        };
        match self.format {
            LogFormat::Json => fmt::layer()
                .json()
                .with_span_events(span_events)
                .with_target(self.show_target)
                .with_writer(writer)
                .boxed(),
            LogFormat::Compact => fmt::layer()
                .compact()
                .with_span_events(span_events)
                .with_target(self.show_target)
                .with_thread_ids(self.show_thread_ids)
                .with_ansi(ansi)
                .with_writer(writer)
                .boxed(),
            LogFormat::Pretty => fmt::layer()
                .with_span_events(span_events)
                .with_target(self.show_target)
                .with_thread_ids(self.show_thread_ids)
                .with_ansi(ansi)
                .with_writer(writer)
                .boxed(),
        }
    }
}

/// Parse a log level string.
fn parse_level(s: &str) -> Option<Level> {
    match s.to_lowercase().as_str() {
        "error" => Some(Level::ERROR),
        "warn" | "warning" => Some(Level::WARN),
        "info" => Some(Level::INFO),
        "debug" => Some(Level::DEBUG),
        "trace" => Some(Level::TRACE),
        _ => None,
    }
}

fn file_appender(path: &Path, rotation: LogRotation) -> RollingFileAppender {
    let parent = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };
    let file_name = path
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("pixelpipe.log");
    RollingFileAppender::new(rotation.into(), parent, file_name)
}

/// Install the global subscriber: stderr, plus the log file if configured.
///
/// Subsequent calls are silently ignored.
pub fn init(config: LogConfig) {
    let ansi = crate::theme::colors_enabled();
    let mut layers = vec![config.fmt_layer(std::io::stderr, ansi)];
    if let Some(path) = &config.file_path {
        layers.push(config.fmt_layer(file_appender(path, config.rotation), false));
    }

    let _ = tracing_subscriber::registry()
        .with(layers)
        .with(config.build_filter())
        .try_init();
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_log_format_from_str() {
        assert_eq!("pretty".parse::<LogFormat>().unwrap(), LogFormat::Pretty);
        assert_eq!("full".parse::<LogFormat>().unwrap(), LogFormat::Pretty);
        assert_eq!("compact".parse::<LogFormat>().unwrap(), LogFormat::Compact);
        assert_eq!("JSON".parse::<LogFormat>().unwrap(), LogFormat::Json);
        assert!("invalid".parse::<LogFormat>().is_err());
    }

    #[test]
    fn test_log_rotation_from_str() {
        assert_eq!("hourly".parse::<LogRotation>().unwrap(), LogRotation::Hourly);
        assert_eq!("never".parse::<LogRotation>().unwrap(), LogRotation::Never);
        assert!("weekly".parse::<LogRotation>().is_err());
    }

    #[test]
    fn test_rotation_env_applies_to_master_only() {
        let vars = env(&[
            ("PIXELPIPE_LOG_FILE", "/tmp/pixelpipe.log"),
            ("PIXELPIPE_LOG_ROTATION", "daily"),
        ]);
        assert_eq!(
            LogConfig::new().with_overrides_from(&vars).rotation,
            LogRotation::Daily
        );
        assert_eq!(
            LogConfig::for_worker().with_overrides_from(&vars).rotation,
            LogRotation::Never
        );

        let bad = env(&[("PIXELPIPE_LOG_ROTATION", "weekly")]);
        assert_eq!(
            LogConfig::new().with_overrides_from(&bad).rotation,
            LogRotation::Never
        );
    }

    #[test]
    fn test_parse_level() {
        assert_eq!(parse_level("warning"), Some(Level::WARN));
        assert_eq!(parse_level("INFO"), Some(Level::INFO));
        assert_eq!(parse_level("trace"), Some(Level::TRACE));
        assert_eq!(parse_level("loud"), None);
    }

    #[test]
    fn test_pixelpipe_log_beats_rust_log() {
        let config = LogConfig::new().with_overrides_from(env(&[
            ("PIXELPIPE_LOG", "pixelpipe=debug"),
            ("RUST_LOG", "trace"),
        ]));
        assert_eq!(config.filter.as_deref(), Some("pixelpipe=debug"));

        let config = LogConfig::new().with_overrides_from(env(&[("RUST_LOG", "info")]));
        assert_eq!(config.filter.as_deref(), Some("info"));
    }

    #[test]
    fn test_cli_filter_beats_environment() {
        let config = LogConfig::new()
            .with_filter("debug".into())
            .with_overrides_from(env(&[
                ("PIXELPIPE_LOG", "error"),
                ("PIXELPIPE_LOG_LEVEL", "trace"),
                ("PIXELPIPE_LOG_FORMAT", "json"),
            ]));
        assert_eq!(config.filter.as_deref(), Some("debug"));
        assert_eq!(config.level, Level::WARN);
        assert_eq!(config.format, LogFormat::Json);
    }

    #[test]
    fn test_level_env_without_filter() {
        let config = LogConfig::new().with_overrides_from(env(&[("PIXELPIPE_LOG_LEVEL", "debug")]));
        assert_eq!(config.level, Level::DEBUG);
        assert_eq!(config.effective_filter(), "debug");
    }

    #[test]
    fn test_worker_never_writes_log_file() {
        let vars = env(&[("PIXELPIPE_LOG_FILE", "/tmp/pixelpipe.log")]);
        assert!(LogConfig::for_worker().with_overrides_from(&vars).file_path.is_none());
        assert_eq!(
            LogConfig::new().with_overrides_from(&vars).file_path,
            Some(PathBuf::from("/tmp/pixelpipe.log"))
        );
    }

    #[test]
    fn test_effective_filter_falls_back_on_invalid() {
        let config = LogConfig::new().with_filter("pixelpipe=loud".into());
        assert_eq!(config.effective_filter(), "warn");
        let config = LogConfig::new().with_filter("pixelpipe=trace".into());
        assert_eq!(config.effective_filter(), "pixelpipe=trace");
    }

    #[test]
    fn test_worker_preset() {
        let config = LogConfig::for_worker();
        assert_eq!(config.format, LogFormat::Compact);
        assert!(!config.show_target);
        assert!(!config.span_events);
        assert!(!config.show_thread_ids);
        assert!(LogConfig::new().with_thread_ids(true).show_thread_ids);
    }
}
