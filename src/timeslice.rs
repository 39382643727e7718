//! Process-wide time-slice recording sink.
//!
//! Carbon does not implement a binary log format itself; it only calls out
//! to a caller-supplied sink at well-defined moments (entering host time,
//! entering guest time, after each classified exit, and at VM-construction
//! milestones). The sink is optional — if none is installed, every call is
//! a no-op.

use std::sync::OnceLock;

/// Receives `(slice_id, duration_ns)` pairs from the run loop.
///
/// Implementations must be cheap and non-blocking: they are called on the
/// hot vCPU exit path.
pub trait TimesliceSink: Send + Sync {
    fn record(&self, slice_id: u64, duration_ns: i64);
}

static SINK: OnceLock<Box<dyn TimesliceSink>> = OnceLock::new();

/// Installs the process-wide time-slice sink. Returns `Err(())` carrying
/// the rejected sink back if one was already installed — the slot is
/// set-once, matching the core's "process-wide" contract.
pub fn install(sink: Box<dyn TimesliceSink>) -> Result<(), Box<dyn TimesliceSink>> {
    SINK.set(sink)
}

/// Records a time slice against the installed sink, if any.
pub fn record(slice_id: u64, duration_ns: i64) {
    if let Some(sink) = SINK.get() {
        sink.record(slice_id, duration_ns);
    }
}

/// Well-known slice ids the run loop attributes time to when a device has
/// not claimed a more specific bucket via [`crate::exit::ExitContext::set_exit_timeslice`].
pub mod buckets {
    pub const HOST_TIME: u64 = 0;
    pub const GUEST_TIME: u64 = 1;
    pub const UNKNOWN_EXIT: u64 = 2;
    pub const VM_CONSTRUCTION: u64 = 3;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::Arc;

    struct CountingSink(Arc<AtomicU64>);
    impl TimesliceSink for CountingSink {
        fn record(&self, _slice_id: u64, duration_ns: i64) {
            self.0.fetch_add(duration_ns as u64, Ordering::SeqCst);
        }
    }

    #[test]
    fn record_without_sink_is_noop() {
        // No sink installed in this test binary's process by default;
        // calling record must not panic.
        record(buckets::HOST_TIME, 1234);
    }
}
