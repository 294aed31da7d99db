//! Logging bootstrap and structured event emission.
//!
//! Two distinct channels live here. `tracing` handles operator-facing log
//! lines; [`EventLog`] emits the structured NDJSON events the rest of the
//! core reports state transitions through (sessions, payments, tool calls).
//! Events are one JSON object per line: `{ts, level, event, data}`.

use chrono::{SecondsFormat, Utc};
use parking_lot::Mutex;
use serde_json::Value;
use std::io::Write;
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Initialize the logging infrastructure. Call once at startup.
pub fn init_logging() -> anyhow::Result<()> {
    init_logging_with_level(false, false)
}

/// Initialize logging with configurable verbosity.
pub fn init_logging_with_level(verbose: bool, quiet: bool) -> anyhow::Result<()> {
    let filter_level = if quiet {
        EnvFilter::new("error")
    } else if verbose {
        EnvFilter::new("dir2mcp=debug,info")
    } else {
        EnvFilter::new("dir2mcp=info,warn")
    };

    // Quiet takes precedence over RUST_LOG; otherwise the env var wins.
    let env_filter = if quiet {
        EnvFilter::new("error")
    } else if std::env::var("RUST_LOG").is_ok() {
        EnvFilter::try_from_default_env().unwrap_or(filter_level)
    } else {
        filter_level
    };

    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_target(!quiet)
        .with_ansi(true);

    match tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .try_init()
    {
        Ok(()) => Ok(()),
        // Already initialized, which is fine in test environments.
        Err(_) => Ok(()),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventLevel {
    Info,
    Warning,
    Error,
}

impl EventLevel {
    pub fn as_str(self) -> &'static str {
        match self {
            EventLevel::Info => "info",
            EventLevel::Warning => "warning",
            EventLevel::Error => "error",
        }
    }
}

/// NDJSON event sink shared across the server core.
///
/// Emission is best-effort: a failed write logs a warning and drops the
/// event rather than failing the request that produced it.
pub struct EventLog {
    sink: Mutex<Box<dyn Write + Send>>,
}

impl EventLog {
    /// Event log writing to stderr, the default sink.
    pub fn stderr() -> Self {
        Self::with_sink(Box::new(std::io::stderr()))
    }

    pub fn with_sink(sink: Box<dyn Write + Send>) -> Self {
        Self {
            sink: Mutex::new(sink),
        }
    }

    pub fn emit(&self, level: EventLevel, event: &str, data: Value) {
        let record = serde_json::json!({
            "ts": Utc::now().to_rfc3339_opts(SecondsFormat::Nanos, true),
            "level": level.as_str(),
            "event": event,
            "data": data,
        });
        let mut sink = self.sink.lock();
        let result = serde_json::to_string(&record)
            .map_err(std::io::Error::other)
            .and_then(|line| writeln!(sink, "{line}"))
            .and_then(|()| sink.flush());
        if let Err(err) = result {
            tracing::warn!("dropping event '{}': {}", event, err);
        }
    }

    pub fn info(&self, event: &str, data: Value) {
        self.emit(EventLevel::Info, event, data);
    }

    pub fn warning(&self, event: &str, data: Value) {
        self.emit(EventLevel::Warning, event, data);
    }

    pub fn error(&self, event: &str, data: Value) {
        self.emit(EventLevel::Error, event, data);
    }
}

/// In-memory sink handle, used by tests to assert on emitted events.
#[derive(Clone, Default)]
pub struct SharedBuffer(pub Arc<Mutex<Vec<u8>>>);

impl SharedBuffer {
    pub fn contents(&self) -> String {
        String::from_utf8_lossy(&self.0.lock()).into_owned()
    }

    /// Parse the buffered NDJSON lines.
    pub fn records(&self) -> Vec<Value> {
        self.contents()
            .lines()
            .filter_map(|line| serde_json::from_str(line).ok())
            .collect()
    }
}

impl Write for SharedBuffer {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.lock().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}
