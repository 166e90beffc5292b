//! Tracing initialisation for the embedding host

use serde::{Deserialize, Serialize};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Log level for the mesh core
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Error,
    Warn,
    #[default]
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    /// Default filter directive for this level
    pub fn filter(self) -> &'static str {
        match self {
            LogLevel::Error => "room_mesh=error,webrtc=error",
            LogLevel::Warn => "room_mesh=warn,webrtc=warn",
            LogLevel::Info => "room_mesh=info,webrtc=warn",
            LogLevel::Debug => "room_mesh=debug,webrtc=info",
            LogLevel::Trace => "room_mesh=trace,webrtc=debug",
        }
    }
}

/// Install a global subscriber.
///
/// `RUST_LOG` takes priority over `level`. Calling this twice is harmless.
pub fn init_logging(level: LogLevel, json: bool) {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| level.filter().into());

    let result = if json {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer().json())
            .try_init()
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer())
            .try_init()
    };

    if let Err(err) = result {
        eprintln!("failed to initialize tracing: {}", err);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_filters_scope_crate() {
        assert!(LogLevel::default().filter().starts_with("room_mesh=info"));
        assert!(LogLevel::Trace.filter().contains("room_mesh=trace"));
    }

    #[test]
    fn test_double_init_does_not_panic() {
        init_logging(LogLevel::Debug, false);
        init_logging(LogLevel::Debug, true);
    }
}
