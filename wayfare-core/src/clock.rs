//! Time source abstraction.
//!
//! Expiry checks read "now" through [`Clock`] so tests can move time
//! forward without sleeping.

use chrono::{DateTime, Utc};
use std::sync::Arc;

/// Source of the current wall-clock time.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// The real system clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Shared handle to a clock.
pub type SharedClock = Arc<dyn Clock>;

/// The system clock behind a shared handle.
pub fn system_clock() -> SharedClock {
    Arc::new(SystemClock)
}
