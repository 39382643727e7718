//! Per-exit scratch context.
//!
//! An [`ExitContext`] is created fresh for every VM exit and discarded the
//! moment the vCPU resumes. Its only externally observable effect is
//! [`ExitContext::set_exit_timeslice`]: a device handler may call it to
//! attribute the wall-clock cost of servicing this exit to a caller-chosen
//! bucket, which the executor reads back after dispatch completes.

/// Scratch state threaded through one exit's dispatch.
#[derive(Debug, Default)]
pub struct ExitContext {
    pending_timeslice_id: Option<u64>,
}

impl ExitContext {
    /// Creates a fresh context with no time-slice attribution yet.
    pub fn new() -> Self {
        Self::default()
    }

    /// Called by a device handler to attribute this exit's duration to
    /// `slice_id` instead of the generic "unknown exit" bucket.
    pub fn set_exit_timeslice(&mut self, slice_id: u64) {
        self.pending_timeslice_id = Some(slice_id);
    }

    /// Read back by the executor after dispatch: the slice id a handler
    /// claimed, if any.
    pub fn pending_timeslice_id(&self) -> Option<u64> {
        self.pending_timeslice_id
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_context_has_no_timeslice() {
        let ctx = ExitContext::new();
        assert_eq!(ctx.pending_timeslice_id(), None);
    }

    #[test]
    fn device_can_claim_a_timeslice_bucket() {
        let mut ctx = ExitContext::new();
        ctx.set_exit_timeslice(42);
        assert_eq!(ctx.pending_timeslice_id(), Some(42));
    }
}
