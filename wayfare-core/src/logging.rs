//! Logging setup and listener isolation.

use std::panic::{catch_unwind, AssertUnwindSafe};

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

/// Install the global tracing subscriber.
///
/// The filter comes from `WAYFARE_LOG`, falling back to `default_directive`.
/// Returns `false` if a subscriber was already installed.
pub fn init_tracing(default_directive: &str, format: LogFormat) -> bool {
    let env_filter = EnvFilter::try_from_env("WAYFARE_LOG")
        .unwrap_or_else(|_| EnvFilter::new(default_directive));

    let registry = tracing_subscriber::registry().with(env_filter);
    let installed = match format {
        LogFormat::Pretty => registry.with(tracing_subscriber::fmt::layer()).try_init(),
        LogFormat::Json => registry
            .with(tracing_subscriber::fmt::layer().json())
            .try_init(),
    };

    if installed.is_ok() {
        tracing::info!(filter = default_directive, "Tracing initialized");
    }
    installed.is_ok()
}

/// Run one consumer callback, containing any panic it raises.
///
/// Returns `true` if the callback completed. A panicking callback is logged
/// with `origin` so the faulty consumer can be identified; delivery to the
/// remaining listeners is unaffected.
pub fn call_isolated<F: FnOnce()>(origin: &str, f: F) -> bool {
    match catch_unwind(AssertUnwindSafe(f)) {
        Ok(()) => true,
        Err(payload) => {
            let message = payload
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| payload.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "non-string panic payload".to_string());
            tracing::error!(origin = origin, panic = %message, "Listener panicked");
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_call_isolated_reports_success() {
        let mut ran = false;
        assert!(call_isolated("test", || ran = true));
        assert!(ran);
    }

    #[test]
    fn test_init_tracing_installs_once() {
        // Whichever call runs first in this process owns the global subscriber.
        let _ = init_tracing("wayfare=debug", LogFormat::Json);
        assert!(!init_tracing("wayfare=debug", LogFormat::Pretty));
        assert!(!init_tracing("info", LogFormat::Json));
    }

    #[test]
    fn test_call_isolated_contains_panic() {
        assert!(!call_isolated("test", || panic!("boom")));
    }
}
