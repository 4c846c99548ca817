use crate::frame::{Frame, ReturnTarget};
use crate::handle::{lock, FutureState, ObjValue, ObjectHandle};
use crate::interp::{Interp, Outcome};
use crate::types::SlotIdx;
use std::sync::{Arc, Mutex};

// ─── Deferred values ──────────────────────────────────────────

/// Resolves a deferred slot. The resolver must either write
/// `ObjValue::Ready` into the slot and report `Next`, splice a callee
/// whose return target is the slot (re-entering the op via
/// `splice_repeat`) and report `Call`, or set a pending exception and
/// report `Exception`. Resolution never blocks another fiber.
pub type Resolver = Box<dyn FnMut(&Interp, &mut Frame, SlotIdx) -> Outcome + Send>;

/// Argument placeholder whose resolution requires invoking a
/// continuation. Cloning shares the one-shot resolver.
#[derive(Clone)]
pub struct DeferredValue(Arc<Mutex<Option<Resolver>>>);

impl DeferredValue {
    pub fn new(resolver: Resolver) -> Self {
        Self(Arc::new(Mutex::new(Some(resolver))))
    }

    /// Invoke the resolver once. A second call (after the resolver was
    /// consumed) reports `Next` — the slot already holds the result.
    pub fn resolve(&self, interp: &Interp, frame: &mut Frame, slot: SlotIdx) -> Outcome {
        let taken = lock(&self.0).take();
        match taken {
            Some(mut resolver) => resolver(interp, frame, slot),
            None => Outcome::Next,
        }
    }
}

impl std::fmt::Debug for DeferredValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let pending = lock(&self.0).is_some();
        write!(f, "DeferredValue {{ pending: {pending} }}")
    }
}

// ─── Argument resolution ──────────────────────────────────────

/// Walk an argument slot list and materialize every entry. A `None` slot
/// ends the walk (trailing defaults). Outcomes:
/// `Next` — every argument is `Ready`;
/// `Call` — a resolver spliced a callee, the current op re-runs after it;
/// `Repeat` — a future is still pending, re-run after the next tick;
/// `Exception` — a resolver faulted or a future completed exceptionally.
pub fn resolve_arguments(interp: &Interp, frame: &mut Frame, slots: &[SlotIdx]) -> Outcome {
    for &idx in slots {
        let value = match frame.slot(idx) {
            None => break,
            Some(v) => v.clone(),
        };
        match value {
            ObjValue::Ready(_) => {}
            ObjValue::Future(cell) => match cell.state() {
                FutureState::Done(h) => frame.set_slot(idx, ObjValue::Ready(h)),
                FutureState::Failed(e) => {
                    frame.exception = Some(e);
                    return Outcome::Exception;
                }
                FutureState::Pending => return Outcome::Repeat,
            },
            ObjValue::Deferred(deferred) => {
                match deferred.resolve(interp, frame, idx) {
                    Outcome::Next => {
                        debug_assert!(
                            frame.slot(idx).map(ObjValue::is_ready).unwrap_or(false),
                            "resolver completed without materializing its slot"
                        );
                    }
                    other => return other,
                }
            }
        }
    }
    Outcome::Next
}

/// Collect materialized handles for a resolved argument list. Call only
/// after [`resolve_arguments`] reported `Next`.
pub fn collect_arguments(frame: &Frame, slots: &[SlotIdx]) -> Vec<ObjectHandle> {
    let mut out = Vec::with_capacity(slots.len());
    for &idx in slots {
        match frame.ready(idx) {
            Some(h) => out.push(h.clone()),
            None => break,
        }
    }
    out
}

// ─── Assigning results ────────────────────────────────────────

/// Write a callee's results into the caller per the return target. The
/// conditional adapter lives here: a single-value return into a `Cond`
/// receiver synthesizes `true` + value. Dynamic-reference slots that
/// already hold future cells are completed in place rather than
/// overwritten.
pub fn assign_values(frame: &mut Frame, target: &ReturnTarget, values: Vec<ObjValue>) -> Outcome {
    match target {
        ReturnTarget::Discard => Outcome::Next,
        ReturnTarget::Slot(idx) => {
            if let Some(v) = values.into_iter().next() {
                write_slot(frame, *idx, v);
            }
            Outcome::Next
        }
        ReturnTarget::Cond { ok, value } => {
            let mut iter = values.into_iter();
            match (iter.next(), iter.next()) {
                // Callee itself produced a conditional pair.
                (Some(flag), Some(v)) => {
                    write_slot(frame, *ok, flag);
                    write_slot(frame, *value, v);
                }
                // Single-value callee: synthesize the boolean tag.
                (Some(v), None) => {
                    write_slot(frame, *ok, ObjValue::Ready(ObjectHandle::of_bool(true)));
                    write_slot(frame, *value, v);
                }
                (None, _) => {
                    write_slot(frame, *ok, ObjValue::Ready(ObjectHandle::of_bool(false)));
                }
            }
            Outcome::Next
        }
        ReturnTarget::Tuple(idxs) | ReturnTarget::Multi(idxs) => {
            for (idx, v) in idxs.iter().zip(values) {
                write_slot(frame, *idx, v);
            }
            Outcome::Next
        }
    }
}

fn write_slot(frame: &mut Frame, idx: SlotIdx, value: ObjValue) {
    // A realized dynamic reference is completed, preserving identity for
    // anything already holding the cell.
    if let Some(ObjValue::Future(cell)) = frame.slot(idx) {
        if let ObjValue::Ready(h) = &value {
            cell.complete(h.clone());
            return;
        }
    }
    frame.set_slot(idx, value);
}

// ─── Continuation chains ──────────────────────────────────────

/// One step of a continuation chain.
pub type ContStep = Box<dyn FnMut(&Interp, &mut Frame) -> Outcome + Send>;

/// Ordered continuations executed in sequence against a completing
/// frame. A step reporting `Call` suspends the chain; when the inner
/// callee (and any continuation it installed) completes, the chain
/// re-runs the same step — steps observe their own completion and report
/// `Next` once done.
pub struct ContinuationChain {
    steps: Vec<ContStep>,
    current: usize,
}

impl ContinuationChain {
    pub fn new() -> Self {
        Self {
            steps: Vec::new(),
            current: 0,
        }
    }

    pub fn single(step: ContStep) -> Self {
        Self {
            steps: vec![step],
            current: 0,
        }
    }

    pub fn push(&mut self, step: ContStep) {
        self.steps.push(step);
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    pub fn run(&mut self, interp: &Interp, frame: &mut Frame) -> Outcome {
        while self.current < self.steps.len() {
            match (self.steps[self.current])(interp, frame) {
                Outcome::Next => self.current += 1,
                other => return other,
            }
        }
        Outcome::Next
    }
}

impl Default for ContinuationChain {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for ContinuationChain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "ContinuationChain {{ {}/{} }}",
            self.current,
            self.steps.len()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handle::FutureCell;

    #[test]
    fn assign_cond_adapts_single_value() {
        let mut frame = crate::interp::testkit::scratch_frame(4);
        let target = ReturnTarget::Cond { ok: 0, value: 1 };
        let oc = assign_values(
            &mut frame,
            &target,
            vec![ObjValue::Ready(ObjectHandle::of_str("hello"))],
        );
        assert!(matches!(oc, Outcome::Next));
        assert!(frame.ready(0).unwrap().truthy());
        assert_eq!(
            frame.ready(1).unwrap().native().and_then(|n| n.as_str().map(String::from)),
            Some("hello".to_string())
        );
    }

    #[test]
    fn assign_completes_realized_dyn_slot() {
        let mut frame = crate::interp::testkit::scratch_frame(4);
        let cells = frame.realize_dyn_returns(&[2]);
        let target = ReturnTarget::Multi(Box::new([2]));
        assign_values(
            &mut frame,
            &target,
            vec![ObjValue::Ready(ObjectHandle::of_int(12))],
        );
        match cells[0].state() {
            FutureState::Done(h) => {
                assert_eq!(h.native().and_then(|n| n.as_int()), Some(12))
            }
            other => unreachable!("{other:?}"),
        }
    }

    #[test]
    fn chain_reruns_current_step_until_next() {
        let mut frame = crate::interp::testkit::scratch_frame(1);
        let interp = crate::interp::testkit::scratch_interp();
        let mut chain = ContinuationChain::new();
        let mut tries = 0;
        chain.push(Box::new(move |_interp, _frame| {
            tries += 1;
            if tries < 3 {
                Outcome::Call
            } else {
                Outcome::Next
            }
        }));
        let mut order = Vec::new();
        chain.push(Box::new(move |_interp, frame| {
            order.push(frame.pc);
            Outcome::Next
        }));

        let interp = interp.as_interp();
        assert!(matches!(chain.run(&interp, &mut frame), Outcome::Call));
        assert!(matches!(chain.run(&interp, &mut frame), Outcome::Call));
        assert!(matches!(chain.run(&interp, &mut frame), Outcome::Next));
    }
}
