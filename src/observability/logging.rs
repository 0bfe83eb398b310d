//! Tracing subscriber setup for the keeper process
//!
//! Output is controlled from the environment:
//!
//! | Variable     | Values                         | Default |
//! |--------------|--------------------------------|---------|
//! | `LOG_LEVEL`  | error, warn, info, debug, trace | info    |
//! | `LOG_FORMAT` | json, pretty, compact          | json    |
//! | `LOG_SPANS`  | true / false                   | false   |
//! | `RUST_LOG`   | full `EnvFilter` directive     | unset   |
//!
//! Each `-v` on the command line raises `LOG_LEVEL` by one step. librdkafka
//! and tokio are held at `warn` unless `RUST_LOG` says otherwise.
//!
//! ```bash
//! LOG_FORMAT=pretty ./kafka-keeper -v run
//! ```

use std::env;
use tracing::Level;
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Client libraries whose chatter is capped at `warn`
const QUIET_TARGETS: [&str; 3] = ["rdkafka", "librdkafka", "tokio"];

const LEVELS: [Level; 5] = [
    Level::ERROR,
    Level::WARN,
    Level::INFO,
    Level::DEBUG,
    Level::TRACE,
];

/// Log output format
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    /// One JSON object per event, for log shippers
    Json,
    Pretty,
    /// Single line per event, no targets
    Compact,
}

impl LogFormat {
    /// Unknown names fall back to JSON
    pub fn parse(s: &str) -> Self {
        match s.to_ascii_lowercase().as_str() {
            "pretty" => LogFormat::Pretty,
            "compact" => LogFormat::Compact,
            _ => LogFormat::Json,
        }
    }
}

/// Resolved subscriber settings
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LogSettings {
    pub level: Level,
    pub format: LogFormat,
    /// Emit span open/close events
    pub include_spans: bool,
}

impl LogSettings {
    /// Resolve settings through `lookup` (normally the process environment)
    pub fn resolve(lookup: impl Fn(&str) -> Option<String>, verbose: u8) -> Self {
        let base = lookup("LOG_LEVEL").map_or(Level::INFO, |l| parse_level(&l));
        Self {
            level: apply_verbosity(base, verbose),
            format: lookup("LOG_FORMAT").map_or(LogFormat::Json, |f| LogFormat::parse(&f)),
            include_spans: lookup("LOG_SPANS").is_some_and(|s| s.eq_ignore_ascii_case("true")),
        }
    }

    fn span_events(&self) -> FmtSpan {
        if self.include_spans {
            FmtSpan::NEW | FmtSpan::CLOSE
        } else {
            FmtSpan::NONE
        }
    }

    /// Level filter with client libraries quieted, unless `rust_log` replaces it
    pub fn filter(&self, rust_log: Option<&str>) -> EnvFilter {
        if let Some(directives) = rust_log {
            return EnvFilter::new(directives);
        }
        QUIET_TARGETS.iter().fold(
            EnvFilter::new(self.level.to_string()),
            |filter, target| filter.add_directive(format!("{target}=warn").parse().unwrap()),
        )
    }
}

/// Parse a level name, defaulting to INFO
pub fn parse_level(s: &str) -> Level {
    LEVELS
        .into_iter()
        .find(|level| level.as_str().eq_ignore_ascii_case(s.trim()))
        .unwrap_or(Level::INFO)
}

/// Raise the level by one step per `-v` flag
pub fn apply_verbosity(level: Level, verbose: u8) -> Level {
    let current = LEVELS.iter().position(|l| *l == level).unwrap_or(2);
    LEVELS[(current + verbose as usize).min(LEVELS.len() - 1)]
}

/// Install the global subscriber
pub fn init_logging(settings: LogSettings) {
    let rust_log = env::var("RUST_LOG").ok();
    let registry = tracing_subscriber::registry().with(settings.filter(rust_log.as_deref()));
    let layer = fmt::layer().with_span_events(settings.span_events());

    match settings.format {
        LogFormat::Json => registry.with(layer.json()).init(),
        LogFormat::Pretty => registry.with(layer.pretty().with_ansi(true)).init(),
        LogFormat::Compact => registry
            .with(layer.compact().with_ansi(true).with_target(false))
            .init(),
    }
}

/// Install the global subscriber from the environment, raised by CLI verbosity
pub fn init_logging_with_verbosity(verbose: u8) {
    init_logging(LogSettings::resolve(|key| env::var(key).ok(), verbose));
}

/// Span for work done on one broker connection
#[macro_export]
macro_rules! lifecycle_span {
    ($role:expr, $connection_id:expr $(, $($field:tt)*)?) => {
        tracing::info_span!(
            "kafka_session",
            role = %$role,
            connection_id = %$connection_id
            $(, $($field)*)?
        )
    };
}

pub use lifecycle_span;
