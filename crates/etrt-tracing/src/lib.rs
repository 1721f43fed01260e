//! Shared tracing configuration for the etrt workspace.
//!
//! Executables, integration tests and the emulator backend all install their
//! `tracing` subscriber through this crate so that filter resolution and
//! output formatting stay identical everywhere.
//!
//! ```no_run
//! use etrt_tracing::{init_global_tracing, TracingConfig};
//!
//! init_global_tracing(&TracingConfig::from_env()).expect("tracing setup");
//! ```

use std::env;
use std::error::Error;
use std::fmt;
use std::sync::Once;

pub use tracing::{debug, error, info, trace, warn};

use tracing::Subscriber;
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::layer::{Layer, SubscriberExt};
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt as tracing_fmt, EnvFilter, Registry};

/// Environment variable selecting the configuration preset.
pub const PROFILE_ENV: &str = "ETRT_TRACING_PROFILE";
/// Environment variable overriding the filter directives.
pub const DIRECTIVES_ENV: &str = "ETRT_TRACING_DIRECTIVES";
/// Environment variable overriding the output format.
pub const FORMAT_ENV: &str = "ETRT_TRACING_FORMAT";

/// Configuration describing how the shared tracing subscriber should behave.
#[derive(Clone, Debug)]
pub struct TracingConfig {
    /// Optional tracing directives (e.g. `etrt_runtime=debug,info`). When
    /// absent the crate falls back to `RUST_LOG` and finally to
    /// [`TracingConfig::default_directive`].
    pub directives: Option<String>,
    /// Fallback directive used when neither `directives` nor `RUST_LOG`
    /// resolve to a valid filter.
    pub default_directive: String,
    /// Whether event targets (module paths) appear in output.
    pub include_targets: bool,
    /// Whether thread names appear in output. The runtime's notification
    /// thread is named, so this makes callback-side logging easy to spot.
    pub include_thread_names: bool,
    /// ANSI colouring. Disable for CI logs.
    pub ansi: bool,
    /// Span lifecycle events to emit.
    pub span_events: FmtSpan,
    /// Output format for the formatter layer.
    pub output: TracingOutput,
}

impl Default for TracingConfig {
    fn default() -> Self {
        Self::for_local()
    }
}

impl TracingConfig {
    /// Pretty, coloured output for local development.
    pub fn for_local() -> Self {
        Self {
            directives: None,
            default_directive: "info".to_string(),
            include_targets: true,
            include_thread_names: true,
            ansi: true,
            span_events: FmtSpan::NONE,
            output: TracingOutput::Pretty,
        }
    }

    /// JSON output without ANSI codes, for log collection.
    pub fn for_ci() -> Self {
        Self {
            directives: None,
            default_directive: "info".to_string(),
            include_targets: true,
            include_thread_names: true,
            ansi: false,
            span_events: FmtSpan::NONE,
            output: TracingOutput::Json,
        }
    }

    /// Build a configuration using environment hints.
    ///
    /// # Environment Variables
    ///
    /// - `ETRT_TRACING_PROFILE` - `local` (default) or `ci`
    /// - `ETRT_TRACING_DIRECTIVES` - overrides filter directives
    /// - `ETRT_TRACING_FORMAT` - `pretty`, `compact` or `json`
    pub fn from_env() -> Self {
        let profile = env::var(PROFILE_ENV)
            .unwrap_or_else(|_| "local".to_string())
            .to_ascii_lowercase();

        let mut config = match profile.as_str() {
            "ci" => Self::for_ci(),
            _ => Self::for_local(),
        };

        if let Ok(directives) = env::var(DIRECTIVES_ENV) {
            if !directives.trim().is_empty() {
                config.directives = Some(directives);
            }
        }

        if let Ok(format) = env::var(FORMAT_ENV) {
            if let Some(parsed) = TracingOutput::from_env_value(&format) {
                config.output = parsed;
                if matches!(config.output, TracingOutput::Json) {
                    config.ansi = false;
                }
            }
        }

        config
    }

    fn resolve_filter(&self) -> Result<EnvFilter, TracingSetupError> {
        if let Some(directives) = &self.directives {
            EnvFilter::try_new(directives).map_err(|err| TracingSetupError::InvalidFilter(err.to_string()))
        } else {
            match EnvFilter::try_from_default_env() {
                Ok(filter) => Ok(filter),
                Err(_) => Ok(EnvFilter::new(self.default_directive.clone())),
            }
        }
    }
}

/// Output format choices for the formatter layer.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TracingOutput {
    Compact,
    Pretty,
    Json,
}

impl TracingOutput {
    fn from_env_value(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "compact" => Some(Self::Compact),
            "pretty" => Some(Self::Pretty),
            "json" => Some(Self::Json),
            _ => None,
        }
    }
}

/// Errors surfaced when configuring the shared tracing subscriber fails.
#[derive(Debug)]
pub enum TracingSetupError {
    /// The provided directive string could not be parsed.
    InvalidFilter(String),
    /// Installing the global subscriber failed (usually because one is
    /// already set).
    SubscriberInit(tracing_subscriber::util::TryInitError),
}

impl fmt::Display for TracingSetupError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TracingSetupError::InvalidFilter(msg) => write!(f, "invalid tracing directive: {msg}"),
            TracingSetupError::SubscriberInit(err) => {
                write!(f, "failed to install global tracing subscriber: {err}")
            }
        }
    }
}

impl Error for TracingSetupError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            TracingSetupError::SubscriberInit(err) => Some(err),
            _ => None,
        }
    }
}

/// Build a `tracing` subscriber using the provided configuration.
pub fn build_subscriber(config: &TracingConfig) -> Result<impl Subscriber + Send + Sync, TracingSetupError> {
    let filter = config.resolve_filter()?;
    Ok(Registry::default().with(format_layer(config, false)).with(filter))
}

fn format_layer(config: &TracingConfig, test_writer: bool) -> Box<dyn Layer<Registry> + Send + Sync> {
    let base = tracing_fmt::layer()
        .with_target(config.include_targets)
        .with_thread_names(config.include_thread_names)
        .with_span_events(config.span_events.clone());

    match (&config.output, test_writer) {
        (TracingOutput::Compact, false) => Box::new(base.compact().with_ansi(config.ansi)),
        (TracingOutput::Compact, true) => Box::new(base.compact().with_ansi(false).with_test_writer()),
        (TracingOutput::Pretty, false) => Box::new(base.pretty().with_ansi(config.ansi)),
        (TracingOutput::Pretty, true) => Box::new(base.pretty().with_ansi(false).with_test_writer()),
        (TracingOutput::Json, false) => Box::new(base.json().with_ansi(false)),
        (TracingOutput::Json, true) => Box::new(base.json().with_ansi(false).with_test_writer()),
    }
}

/// Install the configured subscriber as the process-wide default.
pub fn init_global_tracing(config: &TracingConfig) -> Result<(), TracingSetupError> {
    build_subscriber(config)?
        .try_init()
        .map_err(TracingSetupError::SubscriberInit)
}

/// Install a compact subscriber that writes through the libtest capture.
///
/// Safe to call from every test; only the first call has an effect and a
/// subscriber installed by someone else is left alone.
pub fn init_for_tests() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let config = TracingConfig {
            default_directive: "debug".to_string(),
            ansi: false,
            output: TracingOutput::Compact,
            ..TracingConfig::from_env()
        };
        if let Ok(filter) = config.resolve_filter() {
            let _ = Registry::default()
                .with(format_layer(&config, true))
                .with(filter)
                .try_init();
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    fn reset_env(keys: &[&str]) {
        for key in keys {
            env::remove_var(key);
        }
    }

    #[test]
    #[serial]
    fn rejects_invalid_directive() {
        reset_env(&[DIRECTIVES_ENV, "RUST_LOG"]);
        let config = TracingConfig {
            directives: Some("=::invalid".to_string()),
            ..TracingConfig::default()
        };
        let result = build_subscriber(&config);
        assert!(matches!(result, Err(TracingSetupError::InvalidFilter(_))));
    }

    #[test]
    #[serial]
    fn builds_with_defaults() {
        reset_env(&[DIRECTIVES_ENV]);
        assert!(build_subscriber(&TracingConfig::default()).is_ok());
    }

    #[test]
    #[serial]
    fn from_env_respects_profile_and_format() {
        reset_env(&[PROFILE_ENV, FORMAT_ENV, DIRECTIVES_ENV]);

        env::set_var(PROFILE_ENV, "ci");
        env::set_var(FORMAT_ENV, "compact");
        env::set_var(DIRECTIVES_ENV, "etrt_runtime=debug");

        let config = TracingConfig::from_env();
        assert_eq!(config.directives.as_deref(), Some("etrt_runtime=debug"));
        assert!(!config.ansi);
        assert_eq!(config.output, TracingOutput::Compact);

        reset_env(&[PROFILE_ENV, FORMAT_ENV, DIRECTIVES_ENV]);
    }

    #[test]
    #[serial]
    fn json_format_disables_ansi() {
        reset_env(&[PROFILE_ENV, FORMAT_ENV]);
        env::set_var(FORMAT_ENV, "JSON");

        let config = TracingConfig::from_env();
        assert_eq!(config.output, TracingOutput::Json);
        assert!(!config.ansi);

        reset_env(&[FORMAT_ENV]);
    }

    #[test]
    fn unknown_format_is_ignored() {
        assert_eq!(TracingOutput::from_env_value("xml"), None);
        assert_eq!(TracingOutput::from_env_value(" Pretty "), Some(TracingOutput::Pretty));
    }

    #[test]
    fn init_for_tests_is_idempotent() {
        init_for_tests();
        init_for_tests();
        tracing::debug!("still alive");
    }
}
