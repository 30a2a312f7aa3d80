//! Logging setup for the master and for worker processes.
//!
//! The master logs to stderr (and optionally a file) through a regular
//! `tracing-subscriber` stack. A worker process owns no log output of its
//! own: every event is rendered to text and shipped to the master over the
//! `log` service, where [`emit_forwarded`] replays it tagged with the
//! worker's alias.
//!
//! # Environment Variables
//!
//! - `GENPOOL_LOG` - Log filter (overrides RUST_LOG)
//! - `GENPOOL_LOG_LEVEL` - Log level: error, warn, info, debug, trace
//! - `GENPOOL_LOG_FORMAT` - Output format: pretty, compact, json
//! - `GENPOOL_LOG_FILE` - Path to log file (in addition to stderr)
//! - `RUST_LOG` - Standard Rust log filter (fallback)

use std::io::{self, Write};
use std::path::PathBuf;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use tracing::{Level, Metadata};
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::fmt::{self, MakeWriter, format::FmtSpan};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer, Registry};

use crate::broker::{MASTER_ALIAS, Message, TransportRef, services};

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

/// Logging configuration.
#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Base log level (default: INFO)
    pub level: Level,
    /// Log format (default: Pretty)
    pub format: LogFormat,
    /// Path to log file (None = stderr only). Rotated daily.
    pub file_path: Option<PathBuf>,
    /// Log span timing on close
    pub span_events: bool,
    /// Custom filter string (overrides level if set)
    pub filter: Option<String>,
    /// Show target module in logs (default: false)
    pub show_target: bool,
    /// Use ANSI colours on stderr (default: true)
    pub ansi: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: Level::INFO,
            format: LogFormat::Pretty,
            file_path: None,
            span_events: false,
            filter: None,
            show_target: false,
            ansi: true,
        }
    }
}

impl LogConfig {
    pub fn new() -> Self {
        Self::default()
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

    pub fn with_span_events(mut self, enabled: bool) -> Self {
        self.span_events = enabled;
        self
    }

    pub fn with_filter(mut self, filter: String) -> Self {
        self.filter = Some(filter);
        self
    }

    pub fn with_ansi(mut self, ansi: bool) -> Self {
        self.ansi = ansi;
        self
    }

    /// Apply environment variable overrides.
    ///
    /// CLI values win: a filter already set is not replaced, and the level
    /// from `GENPOOL_LOG_LEVEL` only applies when no filter is set.
    pub fn with_env_overrides(mut self) -> Self {
        if self.filter.is_none() {
            if let Ok(filter) = std::env::var("GENPOOL_LOG") {
                self.filter = Some(filter);
            } else if let Ok(filter) = std::env::var("RUST_LOG") {
                self.filter = Some(filter);
            }
        }

        if self.filter.is_none()
            && let Ok(level_str) = std::env::var("GENPOOL_LOG_LEVEL")
        {
            self.level = parse_level(&level_str).unwrap_or(self.level);
        }

        if let Ok(format) = std::env::var("GENPOOL_LOG_FORMAT")
            && let Ok(f) = format.parse()
        {
            self.format = f;
        }

        if let Ok(path) = std::env::var("GENPOOL_LOG_FILE") {
            self.file_path = Some(PathBuf::from(path));
        }

        self
    }

    fn build_filter(&self) -> EnvFilter {
        if let Some(ref filter) = self.filter {
            EnvFilter::try_new(filter).unwrap_or_else(|_| {
                eprintln!("Warning: Invalid log filter '{}', using default", filter);
                EnvFilter::new(level_name(self.level))
            })
        } else {
            EnvFilter::new(level_name(self.level))
        }
    }

    fn file_appender(&self) -> Option<RollingFileAppender> {
        let path = self.file_path.as_ref()?;
        let parent = path.parent().unwrap_or(std::path::Path::new("."));
        let file_name = path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("genpool.log");
        Some(RollingFileAppender::new(Rotation::DAILY, parent, file_name))
    }
}

/// Parse a log level string.
pub fn parse_level(s: &str) -> Option<Level> {
    match s.to_lowercase().as_str() {
        "error" => Some(Level::ERROR),
        "warn" | "warning" => Some(Level::WARN),
        "info" => Some(Level::INFO),
        "debug" => Some(Level::DEBUG),
        "trace" => Some(Level::TRACE),
        _ => None,
    }
}

/// Lowercase level name, as accepted by [`parse_level`] and `EnvFilter`.
pub fn level_name(level: Level) -> String {
    level.to_string().to_lowercase()
}

const LEVELS: [Level; 5] = [Level::ERROR, Level::WARN, Level::INFO, Level::DEBUG, Level::TRACE];

/// Shift INFO by `-v`/`-q` counts: positive is more verbose.
pub fn adjust_level(verbosity: i8) -> Level {
    let index = (2 + verbosity as i32).clamp(0, LEVELS.len() as i32 - 1);
    LEVELS[index as usize]
}

type BoxedLayer = Box<dyn Layer<Registry> + Send + Sync>;

fn fmt_layer<W>(config: &LogConfig, writer: W, ansi: bool) -> BoxedLayer
where
    W: for<'w> MakeWriter<'w> + Send + Sync + 'static,
{
    let span_events = if config.span_events {
        FmtSpan::CLOSE
    } else {
        FmtSpan::NONE
    };
    let layer = fmt::layer()
        .with_span_events(span_events)
        .with_target(config.show_target)
        .with_ansi(ansi)
        .with_writer(writer);

    match config.format {
        LogFormat::Json => layer.json().boxed(),
        LogFormat::Compact => layer.compact().boxed(),
        LogFormat::Pretty => layer.boxed(),
    }
}

/// Initialize the global subscriber for the master.
///
/// Logs to stderr, and to `config.file_path` as well when set. Subsequent
/// calls are silently ignored.
pub fn init(config: LogConfig) {
    let mut layers = vec![fmt_layer(&config, io::stderr, config.ansi)];
    if let Some(appender) = config.file_appender() {
        layers.push(fmt_layer(&config, appender, false));
    }

    let _ = tracing_subscriber::registry()
        .with(layers)
        .with(config.build_filter())
        .try_init();
}

/// A log event as shipped from a worker to the master.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogRecord {
    pub level: String,
    pub target: String,
    pub message: String,
    /// Alias of the worker that logged it.
    #[serde(default)]
    pub tag: String,
}

/// Sends rendered log lines to the master.
///
/// Implements [`MakeWriter`]: each event gets a [`ForwardWriter`] that
/// buffers the formatted line and ships it when dropped.
#[derive(Debug, Clone)]
pub struct Forwarder {
    sender_id: String,
    tag: String,
    transport: TransportRef,
}

impl Forwarder {
    pub fn new(sender_id: &str, tag: &str, transport: TransportRef) -> Self {
        Self {
            sender_id: sender_id.to_string(),
            tag: tag.to_string(),
            transport,
        }
    }

    fn forward(&self, level: Level, target: String, message: String) {
        let record = LogRecord {
            level: level_name(level),
            target,
            message,
            tag: self.tag.clone(),
        };
        let Ok(data) = serde_json::to_value(&record) else {
            return;
        };
        // Nowhere left to report a failure to.
        let _ = self
            .transport
            .send(&Message::new(&self.sender_id, MASTER_ALIAS, services::LOG, data));
    }
}

impl<'a> MakeWriter<'a> for Forwarder {
    type Writer = ForwardWriter<'a>;

    fn make_writer(&'a self) -> Self::Writer {
        ForwardWriter {
            forwarder: self,
            level: Level::INFO,
            target: String::new(),
            buf: Vec::with_capacity(256),
        }
    }

    fn make_writer_for(&'a self, meta: &Metadata<'_>) -> Self::Writer {
        ForwardWriter {
            forwarder: self,
            level: *meta.level(),
            target: meta.target().to_string(),
            buf: Vec::with_capacity(256),
        }
    }
}

/// Per-event writer returned by [`Forwarder`].
pub struct ForwardWriter<'a> {
    forwarder: &'a Forwarder,
    level: Level,
    target: String,
    buf: Vec<u8>,
}

impl Write for ForwardWriter<'_> {
    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        self.buf.extend_from_slice(data);
        Ok(data.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Drop for ForwardWriter<'_> {
    fn drop(&mut self) {
        let message = String::from_utf8_lossy(&self.buf).trim_end().to_string();
        if message.is_empty() {
            return;
        }
        self.forwarder
            .forward(self.level, std::mem::take(&mut self.target), message);
    }
}

/// Initialize the global subscriber of a worker process: everything goes
/// to the master through `forwarder`.
pub fn init_forwarding(forwarder: Forwarder, level: Option<&str>) {
    let mut config = LogConfig::default();
    if let Some(level) = level.and_then(parse_level) {
        config.level = level;
    }
    let config = config.with_env_overrides();

    let layer = fmt::layer()
        .without_time()
        .with_level(false)
        .with_target(false)
        .with_ansi(false)
        .with_writer(forwarder);

    let _ = tracing_subscriber::registry()
        .with(layer)
        .with(config.build_filter())
        .try_init();
}

/// Replay a worker's log event through the master's subscriber.
pub fn emit_forwarded(record: &LogRecord) {
    let worker = record.tag.as_str();
    let origin = record.target.as_str();
    let message = record.message.as_str();
    match parse_level(&record.level).unwrap_or(Level::INFO) {
        Level::ERROR => tracing::error!(worker, origin, "{}", message),
        Level::WARN => tracing::warn!(worker, origin, "{}", message),
        Level::INFO => tracing::info!(worker, origin, "{}", message),
        Level::DEBUG => tracing::debug!(worker, origin, "{}", message),
        _ => tracing::trace!(worker, origin, "{}", message),
    }
}
