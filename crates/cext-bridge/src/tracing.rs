//! Bridge tracing support.
//!
//! With the `tracing` feature enabled, cleanup passes, reaper batches and
//! native calls get DEBUG spans, handle lifecycle events are logged at TRACE,
//! and disposal faults or invalid upcalls at WARN/ERROR. Without it every
//! helper compiles to nothing.

#[cfg(feature = "tracing")]
mod internal {
    use tracing::{span, Level};

    use crate::error::{NativeError, NativeException};
    use crate::gc::PassStats;
    use crate::object::{ObjectId, ObjectKind};
    use crate::value::NativeAddress;

    /// Guard returned by the span helpers.
    pub type SpanGuard = span::EnteredSpan;

    pub fn span_cleanup_pass(pass_id: u64) -> SpanGuard {
        span!(Level::DEBUG, "cleanup_pass", pass_id).entered()
    }

    pub fn span_reaper_batch() -> SpanGuard {
        span!(Level::DEBUG, "reaper_batch").entered()
    }

    pub fn span_native_call(method: &str, argc: usize) -> SpanGuard {
        span!(Level::DEBUG, "native_call", method, argc).entered()
    }

    pub fn log_pass_complete(stats: &PassStats) {
        tracing::debug!(
            pass_id = stats.pass_id,
            owners = stats.owners_scanned,
            marked = stats.objects_marked,
            unmarked = stats.unmarked,
            carried = stats.carried_released,
            duration_us = u64::try_from(stats.duration.as_micros()).unwrap_or(u64::MAX),
            "cleanup_pass_complete"
        );
    }

    pub fn log_pass_panicked() {
        tracing::error!("cleanup pass panicked; collector keeps running");
    }

    pub fn log_reaper_started() {
        tracing::debug!("reaper_started");
    }

    pub fn log_reaper_stopped() {
        tracing::debug!("reaper_stopped");
    }

    pub fn log_handle_created(address: NativeAddress, object: ObjectId, kind: ObjectKind) {
        tracing::trace!(%address, ?object, ?kind, "handle_created");
    }

    pub fn log_handle_disposed(address: NativeAddress) {
        tracing::trace!(%address, "handle_disposed");
    }

    pub fn log_dispose_failure(address: NativeAddress, error: &NativeError) {
        tracing::warn!(%address, %error, "native free failed");
    }

    pub fn log_dispose_panic(address: NativeAddress) {
        tracing::error!(%address, "native free panicked");
    }

    pub fn log_unknown_address(upcall: &str, address: NativeAddress) {
        tracing::warn!(upcall, %address, "upcall with an address no handle owns");
    }

    pub fn log_upcall_outside_bridge(upcall: &str) {
        tracing::warn!(upcall, "upcall outside any native call");
    }

    pub fn log_invalid_upcall(upcall: &str, reason: &str) {
        tracing::warn!(upcall, reason, "invalid upcall arguments");
    }

    pub fn log_native_exception(method: &str, exception: &NativeException) {
        tracing::debug!(method, exception = %exception.message, "native_exception");
    }

    pub fn log_shutdown_sweep(disposed: usize, skipped: usize) {
        tracing::debug!(disposed, skipped, "shutdown_sweep");
    }

    pub fn log_extension_loaded(name: &str) {
        tracing::debug!(name, "extension_loaded");
    }

    pub fn log_worker_panicked(thread: &str) {
        tracing::error!(thread, "bridge worker thread panicked");
    }
}

#[cfg(not(feature = "tracing"))]
#[allow(clippy::missing_const_for_fn)]
mod internal {
    use crate::error::{NativeError, NativeException};
    use crate::gc::PassStats;
    use crate::object::{ObjectId, ObjectKind};
    use crate::value::NativeAddress;

    /// Stub guard when tracing is disabled.
    pub struct SpanGuard;

    pub fn span_cleanup_pass(_pass_id: u64) -> SpanGuard {
        SpanGuard
    }

    pub fn span_reaper_batch() -> SpanGuard {
        SpanGuard
    }

    pub fn span_native_call(_method: &str, _argc: usize) -> SpanGuard {
        SpanGuard
    }

    pub fn log_pass_complete(_stats: &PassStats) {}
    pub fn log_pass_panicked() {}
    pub fn log_reaper_started() {}
    pub fn log_reaper_stopped() {}
    pub fn log_handle_created(_address: NativeAddress, _object: ObjectId, _kind: ObjectKind) {}
    pub fn log_handle_disposed(_address: NativeAddress) {}
    pub fn log_dispose_failure(_address: NativeAddress, _error: &NativeError) {}
    pub fn log_dispose_panic(_address: NativeAddress) {}
    pub fn log_unknown_address(_upcall: &str, _address: NativeAddress) {}
    pub fn log_upcall_outside_bridge(_upcall: &str) {}
    pub fn log_invalid_upcall(_upcall: &str, _reason: &str) {}
    pub fn log_native_exception(_method: &str, _exception: &NativeException) {}
    pub fn log_shutdown_sweep(_disposed: usize, _skipped: usize) {}
    pub fn log_extension_loaded(_name: &str) {}
    pub fn log_worker_panicked(_thread: &str) {}
}

pub(crate) use internal::*;
