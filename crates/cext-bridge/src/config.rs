//! Bridge configuration.

use std::time::Duration;

use crate::gil::DEFAULT_INTERRUPT_POLL;

/// Default name of the reaper thread.
pub const DEFAULT_REAPER_THREAD_NAME: &str = "cext-reaper";
/// Default name of the collector thread.
pub const DEFAULT_COLLECTOR_THREAD_NAME: &str = "cext-gc";
/// Default capacity reserved for one reaper batch.
pub const DEFAULT_REAPER_BATCH_HINT: usize = 64;

/// Settings fixed when a [`Bridge`](crate::Bridge) is created.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BridgeConfig {
    /// Request a cleanup pass whenever the GIL is fully released.
    pub cleanup_on_release: bool,
    /// Dispose every remaining handle during shutdown.
    pub dispose_on_shutdown: bool,
    /// Name of the reaper thread.
    pub reaper_thread_name: String,
    /// Name of the collector thread.
    pub collector_thread_name: String,
    /// How often an interruptible GIL wait re-checks its interrupt.
    pub interrupt_poll_interval: Duration,
    /// Capacity reserved for one reaper batch.
    pub reaper_batch_hint: usize,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            cleanup_on_release: true,
            dispose_on_shutdown: true,
            reaper_thread_name: DEFAULT_REAPER_THREAD_NAME.to_owned(),
            collector_thread_name: DEFAULT_COLLECTOR_THREAD_NAME.to_owned(),
            interrupt_poll_interval: DEFAULT_INTERRUPT_POLL,
            reaper_batch_hint: DEFAULT_REAPER_BATCH_HINT,
        }
    }
}

impl BridgeConfig {
    /// Sets [`cleanup_on_release`](Self::cleanup_on_release).
    #[must_use]
    pub const fn with_cleanup_on_release(mut self, enabled: bool) -> Self {
        self.cleanup_on_release = enabled;
        self
    }

    /// Sets [`dispose_on_shutdown`](Self::dispose_on_shutdown).
    #[must_use]
    pub const fn with_dispose_on_shutdown(mut self, enabled: bool) -> Self {
        self.dispose_on_shutdown = enabled;
        self
    }

    /// Sets both thread names from a common prefix.
    #[must_use]
    pub fn with_thread_prefix(mut self, prefix: &str) -> Self {
        self.reaper_thread_name = format!("{prefix}-reaper");
        self.collector_thread_name = format!("{prefix}-gc");
        self
    }

    /// Sets [`interrupt_poll_interval`](Self::interrupt_poll_interval).
    #[must_use]
    pub const fn with_interrupt_poll_interval(mut self, interval: Duration) -> Self {
        self.interrupt_poll_interval = interval;
        self
    }

    /// Sets [`reaper_batch_hint`](Self::reaper_batch_hint).
    #[must_use]
    pub const fn with_reaper_batch_hint(mut self, hint: usize) -> Self {
        self.reaper_batch_hint = hint;
        self
    }
}
