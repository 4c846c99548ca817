use crate::construct::ConstructState;
use crate::deferred::ContinuationChain;
use crate::dispatch::InPlaceState;
use crate::errors::VmException;
use crate::handle::{Callable, FutureCell, FutureState, ObjValue, ObjectHandle};
use crate::interp::{Interp, Op, Outcome};
use crate::module::MethodDef;
use crate::oracle::TypeOracle;
use crate::types::{Addr, ClassId, MethodRef, SlotIdx};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

// ─── Return targets ───────────────────────────────────────────

/// Where a callee's results land in its caller's slots.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReturnTarget {
    /// Results are dropped.
    Discard,
    /// Single scalar result.
    Slot(SlotIdx),
    /// Results packed into consecutive declared slots as a tuple.
    Tuple(Box<[SlotIdx]>),
    /// Multi-return: each slot may be a dynamic reference (future).
    Multi(Box<[SlotIdx]>),
    /// Conditional receiver: boolean tag + value. A single-value callee
    /// is adapted to `true` + value.
    Cond { ok: SlotIdx, value: SlotIdx },
}

// ─── Guards ───────────────────────────────────────────────────

/// One catch arm of a guarded region: exception type, handler address,
/// capture slot for the caught exception handle.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CatchArm {
    pub exc_type: ClassId,
    pub handler: Addr,
    pub capture: SlotIdx,
}

/// An entered guarded region. Pushed by `GuardStart`, popped by
/// `GuardEnd` or by being consumed during unwind.
#[derive(Clone, Debug)]
pub struct GuardScope {
    pub arms: Vec<CatchArm>,
    pub entered_at: Addr,
}

// ─── Scoped finalizers ────────────────────────────────────────

/// Deferred action registered on a frame; runs when the frame unwinds on
/// any path, in reverse registration order. Closing may itself call.
pub enum ScopedFinalizer {
    /// Invoke a callable (no arguments beyond its bound receiver).
    Call(Callable),
    /// Engine hook (construction anchors, adapters).
    Hook(Box<dyn FnMut(&Interp, &mut Frame) -> Outcome + Send>),
}

impl std::fmt::Debug for ScopedFinalizer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ScopedFinalizer::Call(c) => write!(f, "ScopedFinalizer::Call({:?})", c.method),
            ScopedFinalizer::Hook(_) => write!(f, "ScopedFinalizer::Hook"),
        }
    }
}

// ─── Slot metadata ────────────────────────────────────────────

/// Per-slot metadata: declared type plus the dynamic-reference flag.
#[derive(Clone, Copy, Debug)]
pub struct SlotInfo {
    pub declared_type: ClassId,
    pub dyn_ref: bool,
}

// ─── Op-scoped state ──────────────────────────────────────────

/// State a multi-step op anchors on its frame while it re-runs around
/// spliced calls. Cleared when the op completes or a handler in this
/// frame catches.
pub enum OpState {
    Construct(Box<ConstructState>),
    InPlace(Box<InPlaceState>),
    /// Singleton load in flight on the main context.
    SingletonLoad { identity: [u8; 32] },
    /// Singleton batch initialization (service-entry work).
    SingletonBatch {
        identities: Vec<[u8; 32]>,
        index: usize,
        /// An initializer call for `identities[index]` is in flight.
        inflight: bool,
    },
}

impl std::fmt::Debug for OpState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OpState::Construct(_) => write!(f, "OpState::Construct"),
            OpState::InPlace(_) => write!(f, "OpState::InPlace"),
            OpState::SingletonLoad { .. } => write!(f, "OpState::SingletonLoad"),
            OpState::SingletonBatch {
                index, identities, ..
            } => {
                write!(f, "OpState::SingletonBatch({index}/{})", identities.len())
            }
        }
    }
}

// ─── Frame state ──────────────────────────────────────────────

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FrameState {
    /// Executing its op vector.
    Executing,
    /// Op vector finished; finalizers/continuation are draining.
    Completing,
}

/// Readiness of a waiting frame's deferred slots on re-entry.
pub enum SlotReadiness {
    Blocked,
    Faulted(VmException),
    Ready,
}

// ─── Frame ────────────────────────────────────────────────────

/// One activation record. Owns its local slots and program counter. The
/// caller owns its not-yet-popped callee through `next_frame`; the
/// back-link is the fiber's frame stack.
pub struct Frame {
    pub method: MethodRef,
    pub def: Arc<MethodDef>,
    pub pc: Addr,
    pub slots: Vec<Option<ObjValue>>,
    pub slot_info: Vec<SlotInfo>,
    /// Where this frame's results land in the caller.
    pub ret: ReturnTarget,
    /// Results staged by a return op, delivered at pop time.
    pub ret_values: Vec<ObjValue>,
    /// At most one pending exception.
    pub exception: Option<VmException>,
    /// Callee spliced in by an op reporting `Call`.
    pub next_frame: Option<Box<Frame>>,
    /// Resume point consumed when `Call` is dispatched. `None` means the
    /// conventional pc+1; ops that must re-run (argument resolution) set
    /// their own pc.
    pub resume_pc: Option<Addr>,
    /// Runs when the frame completes normally.
    pub continuation: Option<ContinuationChain>,
    pub guards: Vec<GuardScope>,
    pub finalizers: Vec<ScopedFinalizer>,
    pub state: FrameState,
    /// In-flight multi-step op anchored at `pc`.
    pub op_state: Option<OpState>,
    /// Mark the fiber Waiting once this frame's return delivers.
    pub block_return: bool,
    /// Synthetic service-entry frame.
    pub proto: bool,
}

impl Frame {
    pub fn new(method: MethodRef, def: Arc<MethodDef>, ret: ReturnTarget) -> Self {
        let max_vars = def.max_vars as usize;
        let mut slot_info = Vec::with_capacity(max_vars);
        for p in &def.params {
            slot_info.push(SlotInfo {
                declared_type: p.declared_type,
                dyn_ref: p.dyn_ref,
            });
        }
        slot_info.resize(
            max_vars,
            SlotInfo {
                declared_type: crate::types::well_known::OBJECT,
                dyn_ref: false,
            },
        );
        Self {
            method,
            def,
            pc: 0,
            slots: (0..max_vars).map(|_| None).collect(),
            slot_info,
            ret,
            ret_values: Vec::new(),
            exception: None,
            next_frame: None,
            resume_pc: None,
            continuation: None,
            guards: Vec::new(),
            finalizers: Vec::new(),
            state: FrameState::Executing,
            op_state: None,
            block_return: false,
            proto: false,
        }
    }

    pub fn op(&self) -> Option<&Op> {
        self.def.ops.get(self.pc as usize)
    }

    pub fn slot(&self, idx: SlotIdx) -> Option<&ObjValue> {
        self.slots.get(idx as usize).and_then(|s| s.as_ref())
    }

    /// The materialized handle in a slot, if the slot is `Ready`.
    pub fn ready(&self, idx: SlotIdx) -> Option<&ObjectHandle> {
        self.slot(idx).and_then(|v| v.as_ready())
    }

    pub fn set_slot(&mut self, idx: SlotIdx, value: ObjValue) {
        if let Some(slot) = self.slots.get_mut(idx as usize) {
            *slot = Some(value);
        }
    }

    pub fn clear_slot(&mut self, idx: SlotIdx) {
        if let Some(slot) = self.slots.get_mut(idx as usize) {
            *slot = None;
        }
    }

    /// Splice a callee; the dispatcher switches to it on `Call`.
    pub fn splice(&mut self, callee: Frame) {
        self.next_frame = Some(Box::new(callee));
    }

    /// Splice and request re-entry at the current op instead of pc+1.
    pub fn splice_repeat(&mut self, callee: Frame) {
        self.resume_pc = Some(self.pc);
        self.next_frame = Some(Box::new(callee));
    }

    pub fn push_guard(&mut self, arms: Vec<CatchArm>) {
        self.guards.push(GuardScope {
            arms,
            entered_at: self.pc,
        });
    }

    pub fn pop_guard(&mut self) {
        self.guards.pop();
    }

    /// Find and consume the innermost handler matching an exception
    /// class. Guards above the match are discarded; the matching guard is
    /// consumed so a re-raise inside the handler does not loop.
    pub fn take_handler(
        &mut self,
        exc_class: ClassId,
        oracle: &dyn TypeOracle,
    ) -> Option<(Addr, SlotIdx)> {
        while let Some(scope) = self.guards.pop() {
            for arm in &scope.arms {
                if oracle.is_subclass(exc_class, arm.exc_type) {
                    return Some((arm.handler, arm.capture));
                }
            }
        }
        None
    }

    pub fn add_finalizer(&mut self, finalizer: ScopedFinalizer) {
        self.finalizers.push(finalizer);
    }

    /// Re-entry validation for a waiting fiber: resolve any completed
    /// futures in place, report a fault, or stay blocked.
    pub fn check_waiting_slots(&mut self) -> SlotReadiness {
        let mut blocked = false;
        for slot in self.slots.iter_mut() {
            if let Some(ObjValue::Future(cell)) = slot {
                match cell.state() {
                    FutureState::Pending => blocked = true,
                    FutureState::Done(h) => *slot = Some(ObjValue::Ready(h)),
                    FutureState::Failed(e) => return SlotReadiness::Faulted(e),
                }
            }
        }
        if blocked {
            SlotReadiness::Blocked
        } else {
            SlotReadiness::Ready
        }
    }

    /// Install fresh future cells into multi-return slots flagged as
    /// dynamic references. Returns the cells in slot order.
    pub fn realize_dyn_returns(&mut self, targets: &[SlotIdx]) -> Vec<FutureCell> {
        let mut cells = Vec::with_capacity(targets.len());
        for &idx in targets {
            let cell = FutureCell::new();
            self.set_slot(idx, ObjValue::Future(cell.clone()));
            cells.push(cell);
        }
        cells
    }
}

impl std::fmt::Debug for Frame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Frame")
            .field("method", &self.method)
            .field("pc", &self.pc)
            .field("state", &self.state)
            .field("guards", &self.guards.len())
            .field("finalizers", &self.finalizers.len())
            .field("exception", &self.exception)
            .finish()
    }
}
