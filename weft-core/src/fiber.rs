use crate::errors::{VmError, VmException};
use crate::frame::Frame;
use crate::handle::ObjValue;
use crate::service::{EntryWork, Reply};
use crate::types::{FiberId, ServiceId};
use std::time::Instant;
use uuid::Uuid;

// ─── Status ───────────────────────────────────────────────────

/// Fiber lifecycle. Legal transitions only; anything else is a fault.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum FiberStatus {
    /// Created by message receipt, never yet dispatched.
    Initial,
    /// Holds the service's single execution slot.
    Running,
    /// Preempted by the op budget; rescheduled as soon as possible.
    Paused,
    /// Voluntarily released control; lower resume priority than Paused.
    Yielded,
    /// Blocked on futures; promoted only via the responded flag or an
    /// expired deadline.
    Waiting,
    /// Never reappears.
    Terminated,
}

impl FiberStatus {
    pub fn name(self) -> &'static str {
        match self {
            FiberStatus::Initial => "Initial",
            FiberStatus::Running => "Running",
            FiberStatus::Paused => "Paused",
            FiberStatus::Yielded => "Yielded",
            FiberStatus::Waiting => "Waiting",
            FiberStatus::Terminated => "Terminated",
        }
    }

    pub fn can_transition(self, to: FiberStatus) -> bool {
        use FiberStatus::*;
        matches!(
            (self, to),
            (Initial, Running)
                | (Running, Paused)
                | (Running, Yielded)
                | (Running, Waiting)
                | (Running, Terminated)
                | (Paused, Running)
                | (Yielded, Running)
                | (Waiting, Running)
        )
    }
}

// ─── Fiber ────────────────────────────────────────────────────

/// Where a fiber came from, for response routing and causal tracking.
#[derive(Clone, Debug)]
pub struct CallerRef {
    pub service: ServiceId,
    pub fiber: FiberId,
}

/// A lightweight unit of execution inside one service. Owns a frame
/// stack rooted at a synthetic service-entry frame.
pub struct Fiber {
    pub fiber_id: FiberId,
    pub service: ServiceId,
    pub caller: Option<CallerRef>,
    /// Services the originating call chain has passed through. Drives
    /// Exclusive re-entrancy admission.
    pub causal: Vec<ServiceId>,
    status: FiberStatus,
    /// Set by the response handler, cleared on every entry to Running.
    pub responded: bool,
    pub started_at: Instant,
    pub deadline: Option<Instant>,
    pub frames: Vec<Frame>,
    /// Work the proto-frame's entry op performs, taken on first dispatch.
    pub entry: Option<EntryWork>,
    /// Response routing for the proto-frame continuation.
    pub reply: Option<Reply>,
    /// Completion value after the proto frame pops.
    pub result: Option<Result<Vec<ObjValue>, VmException>>,
}

impl Fiber {
    pub fn new(service: ServiceId, caller: Option<CallerRef>) -> Self {
        Self {
            fiber_id: Uuid::now_v7(),
            service,
            caller,
            causal: Vec::new(),
            status: FiberStatus::Initial,
            responded: false,
            started_at: Instant::now(),
            deadline: None,
            frames: Vec::new(),
            entry: None,
            reply: None,
            result: None,
        }
    }

    pub fn status(&self) -> FiberStatus {
        self.status
    }

    pub fn transition(&mut self, to: FiberStatus) -> Result<(), VmError> {
        if !self.status.can_transition(to) {
            return Err(VmError::IllegalTransition {
                from: self.status.name(),
                to: to.name(),
            });
        }
        self.status = to;
        Ok(())
    }

    /// Shutdown teardown path: legal from any state.
    pub fn force_terminate(&mut self) {
        self.status = FiberStatus::Terminated;
    }

    pub fn current_frame(&self) -> Option<&Frame> {
        self.frames.last()
    }

    pub fn current_frame_mut(&mut self) -> Option<&mut Frame> {
        self.frames.last_mut()
    }

    pub fn deadline_exceeded(&self, now: Instant) -> bool {
        self.deadline.map(|d| now >= d).unwrap_or(false)
    }

    /// Runnable right now, given the responded hint and the clock.
    pub fn eligible(&self, now: Instant) -> bool {
        match self.status {
            FiberStatus::Paused | FiberStatus::Yielded | FiberStatus::Initial => true,
            FiberStatus::Waiting => self.responded || self.deadline_exceeded(now),
            FiberStatus::Running | FiberStatus::Terminated => false,
        }
    }
}

impl std::fmt::Debug for Fiber {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Fiber")
            .field("fiber_id", &self.fiber_id)
            .field("status", &self.status)
            .field("responded", &self.responded)
            .field("frames", &self.frames.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fiber() -> Fiber {
        Fiber::new(Uuid::now_v7(), None)
    }

    #[test]
    fn legal_lifecycle_path() {
        let mut f = fiber();
        assert_eq!(f.status(), FiberStatus::Initial);
        f.transition(FiberStatus::Running).unwrap();
        f.transition(FiberStatus::Paused).unwrap();
        f.transition(FiberStatus::Running).unwrap();
        f.transition(FiberStatus::Waiting).unwrap();
        f.transition(FiberStatus::Running).unwrap();
        f.transition(FiberStatus::Terminated).unwrap();
    }

    #[test]
    fn illegal_transitions_fault() {
        let mut f = fiber();
        assert!(f.transition(FiberStatus::Paused).is_err());
        f.transition(FiberStatus::Running).unwrap();
        f.transition(FiberStatus::Yielded).unwrap();
        // Yielded cannot go straight to Waiting.
        assert!(f.transition(FiberStatus::Waiting).is_err());
    }

    #[test]
    fn waiting_eligibility_requires_hint_or_deadline() {
        let mut f = fiber();
        f.transition(FiberStatus::Running).unwrap();
        f.transition(FiberStatus::Waiting).unwrap();
        let now = Instant::now();
        assert!(!f.eligible(now));
        f.responded = true;
        assert!(f.eligible(now));
        f.responded = false;
        f.deadline = Some(now - std::time::Duration::from_millis(1));
        assert!(f.eligible(now));
    }
}
