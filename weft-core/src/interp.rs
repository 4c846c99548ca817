use crate::composition::CompositionRegistry;
use crate::construct::construct_step;
use crate::container::{AssertSeverity, RuntimeConfig, SingletonTable};
use crate::deferred::{resolve_arguments, assign_values};
use crate::dispatch::{
    self, InPlaceAction, InPlaceState, NativeRegistry, PropRead, PropWrite,
};
use crate::errors::{ExceptionKind, FaultKind, VmError, VmException};
use crate::events::{EventLog, RuntimeEvent};
use crate::fiber::{Fiber, FiberStatus};
use crate::frame::{CatchArm, Frame, FrameState, OpState, ReturnTarget, ScopedFinalizer, SlotReadiness};
use crate::handle::{Callable, NativeValue, ObjValue, ObjectHandle};
use crate::oracle::TypeOracle;
use crate::service::{self, ServicePort};
use crate::types::{Addr, ClassId, ConstId, MethodId, MethodRef, PropertyId, ServiceId, SlotIdx, TypeArg};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering as CmpOrdering;
use std::time::Instant;

// ─── Op outcome protocol ──────────────────────────────────────

/// The closed set of results an op reports to the dispatcher. Ops never
/// throw; only the dispatcher manipulates exception state.
///
/// `Block` and `Yield` advance the pc in the op itself (resumption
/// re-enters at the next op); `Repeat` leaves it untouched (the op
/// re-runs); the dispatcher advances it for `Next` and on `Call` (to the
/// frame's `resume_pc`, conventionally pc+1).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Outcome {
    /// Advance and continue.
    Next,
    /// A callee was spliced at `next_frame`; switch to it.
    Call,
    /// Unwind the current frame normally.
    Return,
    /// Like `Return`, then mark the fiber Waiting.
    BlockReturn,
    /// A pending exception was set; search guards up the chain.
    Exception,
    /// Propagate the exception and immediately unwind one frame.
    ReturnException,
    /// Re-execute the current op after the next scheduling tick.
    Repeat,
    /// Suspend the fiber Waiting.
    Block,
    /// Cooperative yield.
    Yield,
    /// Branch to this pc (conditional jumps, terminal continuation).
    Jump(Addr),
}

// ─── Call targets ─────────────────────────────────────────────

#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum CallTarget {
    /// Direct call; any receiver travels as the first argument.
    Method(MethodRef),
    /// Virtual dispatch through the receiver's composition chain.
    Virtual { recv: SlotIdx, method: MethodId },
    /// Callable value in a slot.
    Value(SlotIdx),
}

// ─── The skeleton op set ──────────────────────────────────────

/// The ops the interpreter itself recognizes. Opcode identifiers, arity
/// and operand shapes are fixed by the compiler; anything else fails at
/// load time.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum Op {
    Nop,
    LoadConst { cp: ConstId, dst: SlotIdx },
    LoadBool { value: bool, dst: SlotIdx },
    LoadInt { value: i64, dst: SlotIdx },
    Move { src: SlotIdx, dst: SlotIdx },
    Jump { target: Addr },
    JumpIf { cond: SlotIdx, target: Addr },
    JumpIfNot { cond: SlotIdx, target: Addr },
    /// Bounded-loop support: bump an integer slot.
    IncSlot { slot: SlotIdx },
    JumpIfLt { a: SlotIdx, b: SlotIdx, target: Addr },
    Call { target: CallTarget, args: Vec<SlotIdx>, ret: ReturnTarget },
    Construct { class: ClassId, type_args: Vec<TypeArg>, args: Vec<SlotIdx>, dst: SlotIdx },
    Return0,
    Return1 { src: SlotIdx },
    ReturnN { srcs: Vec<SlotIdx> },
    GuardStart { arms: Vec<CatchArm> },
    GuardEnd,
    Throw { src: SlotIdx },
    Assert { cond: SlotIdx, msg: ConstId },
    Yield,
    /// Explicit wait until every listed slot is materialized.
    WaitAll { slots: Vec<SlotIdx> },
    /// Register a scoped finalizer from a callable slot.
    ScopeDefer { callable: SlotIdx },
    GetProp { target: SlotIdx, prop: PropertyId, dst: SlotIdx },
    SetProp { target: SlotIdx, prop: PropertyId, src: SlotIdx },
    PropInPlace {
        target: SlotIdx,
        prop: PropertyId,
        action: InPlaceAction,
        operand: Option<SlotIdx>,
        post: bool,
        dst: SlotIdx,
    },
    Eq { a: SlotIdx, b: SlotIdx, dst: SlotIdx },
    Cmp { a: SlotIdx, b: SlotIdx, dst: SlotIdx },
    SvcConstruct {
        service: SlotIdx,
        class: ClassId,
        type_args: Vec<TypeArg>,
        args: Vec<SlotIdx>,
        dst: SlotIdx,
    },
    SvcInvoke { service: SlotIdx, callee: SlotIdx, args: Vec<SlotIdx>, ret: ReturnTarget },
    SvcGetProp { service: SlotIdx, target: SlotIdx, prop: PropertyId, dst: SlotIdx },
    SvcSetProp { service: SlotIdx, target: SlotIdx, prop: PropertyId, src: SlotIdx },
    LoadSingleton { identity: [u8; 32], dst: SlotIdx },
    /// First op of every proto-frame: performs the requested operation.
    ServiceEntry,
}

impl Op {
    /// Branch targets (including guard handlers) for verification.
    pub fn branch_targets(&self) -> Vec<Addr> {
        match self {
            Op::Jump { target }
            | Op::JumpIf { target, .. }
            | Op::JumpIfNot { target, .. }
            | Op::JumpIfLt { target, .. } => vec![*target],
            Op::GuardStart { arms } => arms.iter().map(|a| a.handler).collect(),
            _ => Vec::new(),
        }
    }

    /// Whether control can continue at pc+1.
    pub fn falls_through(&self) -> bool {
        !matches!(
            self,
            Op::Jump { .. } | Op::Return0 | Op::Return1 { .. } | Op::ReturnN { .. } | Op::Throw { .. }
        )
    }

    /// Every slot index the op references, for bounds verification.
    pub fn slot_refs(&self) -> Vec<SlotIdx> {
        match self {
            Op::Nop | Op::Jump { .. } | Op::GuardEnd | Op::Yield | Op::Return0
            | Op::ServiceEntry => Vec::new(),
            Op::LoadSingleton { dst, .. } => vec![*dst],
            Op::LoadConst { dst, .. } | Op::LoadBool { dst, .. } | Op::LoadInt { dst, .. } => {
                vec![*dst]
            }
            Op::Move { src, dst } => vec![*src, *dst],
            Op::JumpIf { cond, .. } | Op::JumpIfNot { cond, .. } => vec![*cond],
            Op::IncSlot { slot } => vec![*slot],
            Op::JumpIfLt { a, b, .. } => vec![*a, *b],
            Op::Call { target, args, ret } => {
                let mut v = Vec::new();
                match target {
                    CallTarget::Virtual { recv, .. } => v.push(*recv),
                    CallTarget::Value(slot) => v.push(*slot),
                    CallTarget::Method(_) => {}
                }
                v.extend(args.iter().copied());
                v.extend(ret_slots(ret));
                v
            }
            Op::Construct { args, dst, .. } => {
                let mut v: Vec<SlotIdx> = args.clone();
                v.push(*dst);
                v
            }
            Op::Return1 { src } => vec![*src],
            Op::ReturnN { srcs } => srcs.clone(),
            Op::GuardStart { arms } => arms.iter().map(|a| a.capture).collect(),
            Op::Throw { src } => vec![*src],
            Op::Assert { cond, .. } => vec![*cond],
            Op::WaitAll { slots } => slots.clone(),
            Op::ScopeDefer { callable } => vec![*callable],
            Op::GetProp { target, dst, .. } => vec![*target, *dst],
            Op::SetProp { target, src, .. } => vec![*target, *src],
            Op::PropInPlace { target, operand, dst, .. } => {
                let mut v = vec![*target, *dst];
                if let Some(o) = operand {
                    v.push(*o);
                }
                v
            }
            Op::Eq { a, b, dst } | Op::Cmp { a, b, dst } => vec![*a, *b, *dst],
            Op::SvcConstruct { service, args, dst, .. } => {
                let mut v = vec![*service, *dst];
                v.extend(args.iter().copied());
                v
            }
            Op::SvcInvoke { service, callee, args, ret } => {
                let mut v = vec![*service, *callee];
                v.extend(args.iter().copied());
                v.extend(ret_slots(ret));
                v
            }
            Op::SvcGetProp { service, target, dst, .. } => vec![*service, *target, *dst],
            Op::SvcSetProp { service, target, src, .. } => vec![*service, *target, *src],
        }
    }

    /// Constant-pool indices the op references.
    pub fn const_refs(&self) -> Vec<ConstId> {
        match self {
            Op::LoadConst { cp, .. } => vec![*cp],
            Op::Assert { msg, .. } => vec![*msg],
            _ => Vec::new(),
        }
    }
}

fn ret_slots(ret: &ReturnTarget) -> Vec<SlotIdx> {
    match ret {
        ReturnTarget::Discard => Vec::new(),
        ReturnTarget::Slot(i) => vec![*i],
        ReturnTarget::Tuple(v) | ReturnTarget::Multi(v) => v.to_vec(),
        ReturnTarget::Cond { ok, value } => vec![*ok, *value],
    }
}

// ─── Execution context ────────────────────────────────────────

/// Everything an op may touch, passed explicitly — ops never read the
/// thread-local current context.
pub struct Interp<'a> {
    pub registry: &'a CompositionRegistry,
    pub natives: &'a NativeRegistry,
    pub oracle: &'a dyn TypeOracle,
    pub events: &'a EventLog,
    pub singletons: &'a SingletonTable,
    pub port: &'a dyn ServicePort,
    pub config: &'a RuntimeConfig,
    pub service: ServiceId,
}

/// Materialize a callee frame: receiver (if bound) in slot 0, arguments
/// after.
pub fn build_call_frame(
    interp: &Interp,
    callable: &Callable,
    args: &[ObjectHandle],
    ret: ReturnTarget,
) -> Result<Frame, VmError> {
    let def = interp.registry.method_def(callable.method)?;
    let mut frame = Frame::new(callable.method, def, ret);
    let mut idx: usize = 0;
    if let Some(recv) = &callable.bound {
        frame.set_slot(0, ObjValue::Ready(recv.clone()));
        idx = 1;
    }
    for arg in args {
        if idx >= frame.slots.len() {
            return Err(VmError::Internal(format!(
                "argument overflow calling {:?}",
                callable.method
            )));
        }
        frame.set_slot(idx as SlotIdx, ObjValue::Ready(arg.clone()));
        idx += 1;
    }
    Ok(frame)
}

// ─── Fiber dispatch ───────────────────────────────────────────

/// What a scheduling slice produced.
#[derive(Debug)]
pub enum RunOutcome {
    /// Proto frame completed; the fiber terminated.
    Done,
    /// Op budget exhausted; fiber left Paused.
    Budget,
    Yielded,
    Waiting,
    /// Unhandled exception; fiber terminated.
    Failed(VmException),
}

/// Execute a fiber until it completes, suspends, or exhausts the op
/// budget. The caller (the service scheduler) owns requeueing.
pub fn run_fiber(
    interp: &Interp,
    fiber: &mut Fiber,
    budget: usize,
) -> Result<RunOutcome, VmError> {
    fiber.responded = false;

    if fiber.status() == FiberStatus::Waiting {
        // Re-validate previously-deferred slots before resuming.
        match fiber.current_frame_mut().map(Frame::check_waiting_slots) {
            Some(SlotReadiness::Blocked) => {
                // Still blocked; only an expired deadline may resume, to
                // raise at the resumption point.
                if !fiber.deadline_exceeded(Instant::now()) {
                    return Ok(RunOutcome::Waiting);
                }
                fiber.transition(FiberStatus::Running)?;
            }
            Some(SlotReadiness::Faulted(e)) => {
                fiber.transition(FiberStatus::Running)?;
                if let Some(frame) = fiber.current_frame_mut() {
                    frame.exception = Some(e);
                }
            }
            Some(SlotReadiness::Ready) | None => {
                fiber.transition(FiberStatus::Running)?;
            }
        }
    } else {
        fiber.transition(FiberStatus::Running)?;
    }

    let mut steps = 0usize;
    loop {
        if fiber.frames.is_empty() {
            fiber.transition(FiberStatus::Terminated)?;
            return Ok(RunOutcome::Done);
        }

        // Cooperative cancellation: poll the deadline between ops. The
        // deadline is consumed so a caught Timeout does not re-raise; an
        // exception already in flight wins, and the deadline re-fires
        // once it settles.
        if fiber.deadline_exceeded(Instant::now()) {
            let clear = match fiber.current_frame_mut() {
                Some(frame) if frame.exception.is_none() => {
                    frame.exception = Some(VmException::timeout());
                    true
                }
                _ => false,
            };
            if clear {
                fiber.deadline = None;
                interp.events.append(RuntimeEvent::TimeoutRaised {
                    fiber: fiber.fiber_id,
                });
            }
        }

        if steps >= budget {
            fiber.transition(FiberStatus::Paused)?;
            return Ok(RunOutcome::Budget);
        }
        steps += 1;

        let frame = top_frame(fiber);
        let outcome = if frame.exception.is_some() {
            Outcome::Exception
        } else if frame.state == FrameState::Completing {
            finish_frame(interp, fiber)
        } else if frame.def.native {
            native_step(interp, fiber)
        } else {
            step(interp, fiber)
        };

        match outcome {
            Outcome::Next => {
                let frame = top_frame(fiber);
                if frame.state == FrameState::Executing {
                    frame.pc += 1;
                    if frame.pc as usize >= frame.def.ops.len() {
                        frame.exception = Some(VmException::new(
                            ExceptionKind::Fault(FaultKind::IllegalState),
                            "control ran off the end of the op vector",
                        ));
                    }
                }
            }
            Outcome::Jump(target) => {
                let frame = top_frame(fiber);
                frame.state = FrameState::Executing;
                frame.pc = target;
            }
            Outcome::Call => {
                let frame = top_frame(fiber);
                let resume = frame.resume_pc.take();
                if frame.state == FrameState::Executing {
                    frame.pc = resume.unwrap_or(frame.pc + 1);
                }
                match frame.next_frame.take() {
                    Some(callee) => fiber.frames.push(*callee),
                    None => {
                        return Err(VmError::Internal(
                            "Call outcome without a spliced frame".into(),
                        ))
                    }
                }
            }
            Outcome::Return => {
                let frame = top_frame(fiber);
                frame.state = FrameState::Completing;
            }
            Outcome::BlockReturn => {
                let frame = top_frame(fiber);
                frame.state = FrameState::Completing;
                frame.block_return = true;
            }
            Outcome::Exception => match unwind(interp, fiber) {
                Unwind::Resumed => {}
                Unwind::Spliced => {
                    let frame = top_frame(fiber);
                    match frame.next_frame.take() {
                        Some(callee) => fiber.frames.push(*callee),
                        None => {
                            return Err(VmError::Internal(
                                "finalizer splice without a frame".into(),
                            ))
                        }
                    }
                }
                Unwind::Unhandled(e) => {
                    interp.events.append(RuntimeEvent::UnhandledException {
                        fiber: fiber.fiber_id,
                        kind: format!("{:?}", e.kind),
                    });
                    fiber.result = Some(Err(e.clone()));
                    fiber.transition(FiberStatus::Terminated)?;
                    return Ok(RunOutcome::Failed(e));
                }
            },
            Outcome::ReturnException => {
                let mut done = fiber.frames.pop().expect("frames nonempty");
                let exc = done.exception.take().unwrap_or_else(|| {
                    VmException::new(
                        ExceptionKind::Fault(FaultKind::IllegalState),
                        "ReturnException without a pending exception",
                    )
                });
                match fiber.current_frame_mut() {
                    Some(caller) => caller.exception = Some(exc),
                    None => {
                        fiber.result = Some(Err(exc.clone()));
                        fiber.transition(FiberStatus::Terminated)?;
                        return Ok(RunOutcome::Failed(exc));
                    }
                }
            }
            Outcome::Repeat => {
                fiber.transition(FiberStatus::Waiting)?;
                return Ok(RunOutcome::Waiting);
            }
            Outcome::Block => {
                fiber.transition(FiberStatus::Waiting)?;
                return Ok(RunOutcome::Waiting);
            }
            Outcome::Yield => {
                fiber.transition(FiberStatus::Yielded)?;
                return Ok(RunOutcome::Yielded);
            }
        }
    }
}

// ─── Frame completion ─────────────────────────────────────────

/// Drain a completing frame: scoped finalizers in reverse, then the
/// continuation chain, then pop and deliver results to the caller.
fn finish_frame(interp: &Interp, fiber: &mut Fiber) -> Outcome {
    let frame = top_frame(fiber);

    // Scoped finalizers, newest first; closing may itself call.
    while let Some(fin) = frame.finalizers.pop() {
        match fin {
            ScopedFinalizer::Call(callable) => {
                match build_call_frame(interp, &callable, &[], ReturnTarget::Discard) {
                    Ok(callee) => {
                        frame.splice(callee);
                        return Outcome::Call;
                    }
                    Err(e) => {
                        frame.exception = Some(VmException::from_fault(&e));
                        return Outcome::Exception;
                    }
                }
            }
            ScopedFinalizer::Hook(mut hook) => match hook(interp, frame) {
                Outcome::Next => continue,
                Outcome::Call => {
                    frame.finalizers.push(ScopedFinalizer::Hook(hook));
                    return Outcome::Call;
                }
                other => return other,
            },
        }
    }

    // Completion continuation: may finish, splice a successor frame, or
    // set a pending exception.
    if let Some(mut chain) = frame.continuation.take() {
        match chain.run(interp, frame) {
            Outcome::Next => {}
            Outcome::Call => {
                frame.continuation = Some(chain);
                return Outcome::Call;
            }
            other => return other,
        }
    }

    // Pop and deliver.
    let done = fiber.frames.pop().expect("frames nonempty");
    let block = done.block_return;
    let outcome = match fiber.current_frame_mut() {
        Some(caller) => assign_values(caller, &done.ret, done.ret_values),
        None => {
            fiber.result = Some(Ok(done.ret_values));
            Outcome::Next
        }
    };
    if block && outcome == Outcome::Next {
        return Outcome::Block;
    }
    outcome
}

// ─── Exception unwind ─────────────────────────────────────────

enum Unwind {
    /// A handler matched; execution resumes in the handling frame.
    Resumed,
    /// A finalizer spliced a call; push it and come back.
    Spliced,
    Unhandled(VmException),
}

fn unwind(interp: &Interp, fiber: &mut Fiber) -> Unwind {
    loop {
        let frame = top_frame(fiber);
        let exc = frame.exception.clone().expect("unwind without exception");

        // Guard search first; an aborted construction or update in this
        // frame is dead state once a handler resumes.
        if exc.kind.catchable() {
            if let Some(class) = exc.kind.class_id() {
                if let Some((handler, capture)) = frame.take_handler(class, interp.oracle) {
                    frame.pc = handler;
                    frame.set_slot(
                        capture,
                        ObjValue::Ready(dispatch::exception_handle(&exc)),
                    );
                    frame.exception = None;
                    frame.state = FrameState::Executing;
                    frame.op_state = None;
                    interp.events.append(RuntimeEvent::ExceptionCaught {
                        fiber: fiber.fiber_id,
                        handler_pc: handler,
                    });
                    return Unwind::Resumed;
                }
            }
        }

        // No handler here: run this frame's scoped finalizers, newest
        // first, before popping.
        while let Some(fin) = frame.finalizers.pop() {
            match fin {
                ScopedFinalizer::Call(callable) => {
                    match build_call_frame(interp, &callable, &[], ReturnTarget::Discard) {
                        Ok(callee) => {
                            frame.splice(callee);
                            return Unwind::Spliced;
                        }
                        Err(e) => {
                            // A broken finalizer supersedes, keeping the
                            // original as the cause; remaining finalizers
                            // still run.
                            frame.exception =
                                Some(VmException::from_fault(&e).with_cause(exc.clone()));
                            continue;
                        }
                    }
                }
                ScopedFinalizer::Hook(mut hook) => match hook(interp, frame) {
                    Outcome::Next => continue,
                    Outcome::Call => {
                        frame.finalizers.push(ScopedFinalizer::Hook(hook));
                        return Unwind::Spliced;
                    }
                    Outcome::Exception => {
                        let superseding = frame
                            .exception
                            .take()
                            .unwrap_or_else(|| exc.clone())
                            .with_cause(exc.clone());
                        frame.exception = Some(superseding);
                        continue;
                    }
                    _ => continue,
                },
            }
        }

        // Propagate one frame out.
        let mut done = fiber.frames.pop().expect("frames nonempty");
        let exc = done
            .exception
            .take()
            .unwrap_or(exc);
        match fiber.current_frame_mut() {
            Some(caller) => {
                caller.exception = Some(exc);
            }
            None => return Unwind::Unhandled(exc),
        }
    }
}

// ─── Native dispatch ──────────────────────────────────────────

fn native_step(interp: &Interp, fiber: &mut Fiber) -> Outcome {
    let frame = top_frame(fiber);
    match interp.natives.get(frame.method) {
        Some(handler) => handler(interp, frame),
        None => {
            frame.exception = Some(VmException::new(
                ExceptionKind::Fault(FaultKind::Internal),
                format!("no native handler for {:?}", frame.method),
            ));
            Outcome::Exception
        }
    }
}

// ─── Op execution ─────────────────────────────────────────────

fn top_frame(fiber: &mut Fiber) -> &mut Frame {
    fiber.current_frame_mut().expect("frames nonempty")
}

/// Materialize the listed argument slots or bail out with the
/// resolution outcome (`Call`, `Repeat`, `Exception`).
macro_rules! resolve_or_return {
    ($interp:expr, $frame:expr, $slots:expr) => {
        match resolve_arguments($interp, $frame, $slots) {
            Outcome::Next => {}
            other => return other,
        }
    };
}

fn step(interp: &Interp, fiber: &mut Fiber) -> Outcome {
    let Some(op) = fiber.current_frame().and_then(Frame::op).cloned() else {
        let frame = top_frame(fiber);
        frame.exception = Some(VmException::new(
            ExceptionKind::Fault(FaultKind::IllegalState),
            "pc out of bounds",
        ));
        return Outcome::Exception;
    };

    match op {
        Op::Nop => Outcome::Next,

        Op::LoadConst { cp, dst } => {
            let frame = top_frame(fiber);
            match interp.registry.constant(frame.method.class, cp) {
                Ok(h) => {
                    frame.set_slot(dst, ObjValue::Ready(h));
                    Outcome::Next
                }
                Err(e) => raise(frame, VmException::from_fault(&e)),
            }
        }

        Op::LoadBool { value, dst } => {
            let frame = top_frame(fiber);
            frame.set_slot(dst, ObjValue::Ready(ObjectHandle::of_bool(value)));
            Outcome::Next
        }

        Op::LoadInt { value, dst } => {
            let frame = top_frame(fiber);
            frame.set_slot(dst, ObjValue::Ready(ObjectHandle::of_int(value)));
            Outcome::Next
        }

        Op::Move { src, dst } => {
            let frame = top_frame(fiber);
            let value = frame
                .slot(src)
                .cloned()
                .unwrap_or(ObjValue::Ready(ObjectHandle::nil()));
            frame.set_slot(dst, value);
            Outcome::Next
        }

        Op::Jump { target } => Outcome::Jump(target),

        Op::JumpIf { cond, target } => branch_if(interp, fiber, cond, target, true),
        Op::JumpIfNot { cond, target } => branch_if(interp, fiber, cond, target, false),

        Op::IncSlot { slot } => {
            let frame = top_frame(fiber);
            let current = frame
                .ready(slot)
                .and_then(|h| h.native())
                .and_then(NativeValue::as_int);
            match current {
                Some(n) => match n.checked_add(1) {
                    Some(next) => {
                        frame.set_slot(slot, ObjValue::Ready(ObjectHandle::of_int(next)));
                        Outcome::Next
                    }
                    None => raise(
                        frame,
                        VmException::new(ExceptionKind::Bounds, "counter overflow"),
                    ),
                },
                None => raise(
                    frame,
                    VmException::new(ExceptionKind::Unsupported, "non-integer counter"),
                ),
            }
        }

        Op::JumpIfLt { a, b, target } => {
            let frame = top_frame(fiber);
            resolve_or_return!(interp, frame, &[a, b]);
            let (x, y) = (
                frame.ready(a).and_then(|h| h.native()).and_then(NativeValue::as_int),
                frame.ready(b).and_then(|h| h.native()).and_then(NativeValue::as_int),
            );
            match (x, y) {
                (Some(x), Some(y)) if x < y => Outcome::Jump(target),
                (Some(_), Some(_)) => Outcome::Next,
                _ => raise(
                    frame,
                    VmException::new(ExceptionKind::Unsupported, "non-integer comparison"),
                ),
            }
        }

        Op::Call { target, args, ret } => {
            let frame = top_frame(fiber);

            let mut to_resolve: Vec<SlotIdx> = Vec::with_capacity(args.len() + 1);
            match &target {
                CallTarget::Virtual { recv, .. } => to_resolve.push(*recv),
                CallTarget::Value(slot) => to_resolve.push(*slot),
                CallTarget::Method(_) => {}
            }
            to_resolve.extend(args.iter().copied());
            resolve_or_return!(interp, frame, &to_resolve);

            let callable = match &target {
                CallTarget::Method(mref) => Callable::unbound(*mref),
                CallTarget::Virtual { recv, method } => {
                    let Some(receiver) = frame.ready(*recv).cloned() else {
                        return raise(
                            frame,
                            VmException::new(ExceptionKind::Unsupported, "missing receiver"),
                        );
                    };
                    match dispatch::virtual_target(interp.registry, &receiver, *method) {
                        Ok(mref) => Callable::bound(mref, receiver),
                        Err(e) => return raise(frame, e),
                    }
                }
                CallTarget::Value(slot) => {
                    let Some(value) = frame.ready(*slot) else {
                        return raise(
                            frame,
                            VmException::new(ExceptionKind::Unsupported, "missing callee"),
                        );
                    };
                    match value.callable() {
                        Some(c) => c.clone(),
                        None => {
                            return raise(
                                frame,
                                VmException::new(
                                    ExceptionKind::Unsupported,
                                    "value is not callable",
                                ),
                            )
                        }
                    }
                }
            };

            let argv: Vec<ObjectHandle> = args
                .iter()
                .filter_map(|&i| frame.ready(i).cloned())
                .collect();
            match build_call_frame(interp, &callable, &argv, ret) {
                Ok(callee) => {
                    frame.splice(callee);
                    Outcome::Call
                }
                Err(e) => raise(frame, VmException::from_fault(&e)),
            }
        }

        Op::Construct { class, type_args, args, dst } => {
            let frame = top_frame(fiber);
            construct_step(interp, frame, class, &type_args, &args, dst)
        }

        Op::Return0 => {
            let frame = top_frame(fiber);
            frame.ret_values = Vec::new();
            Outcome::Return
        }

        Op::Return1 { src } => {
            let frame = top_frame(fiber);
            resolve_or_return!(interp, frame, &[src]);
            frame.ret_values = frame.slot(src).cloned().into_iter().collect();
            Outcome::Return
        }

        Op::ReturnN { srcs } => {
            let frame = top_frame(fiber);
            // Multi-returns wait until every slot materializes.
            resolve_or_return!(interp, frame, &srcs);
            frame.ret_values = srcs.iter().filter_map(|&i| frame.slot(i).cloned()).collect();
            Outcome::Return
        }

        Op::GuardStart { arms } => {
            let frame = top_frame(fiber);
            frame.push_guard(arms);
            Outcome::Next
        }

        Op::GuardEnd => {
            let frame = top_frame(fiber);
            frame.pop_guard();
            Outcome::Next
        }

        Op::Throw { src } => {
            let fiber_id = fiber.fiber_id;
            let frame = top_frame(fiber);
            resolve_or_return!(interp, frame, &[src]);
            let Some(h) = frame.ready(src).cloned() else {
                return raise(
                    frame,
                    VmException::new(ExceptionKind::Unsupported, "throw of empty slot"),
                );
            };
            let exc = dispatch::exception_from_handle(interp.registry, &h);
            interp.events.append(RuntimeEvent::ExceptionRaised {
                fiber: fiber_id,
                kind: format!("{:?}", exc.kind),
                pc: frame.pc,
            });
            raise(frame, exc)
        }

        Op::Assert { cond, msg } => {
            let frame = top_frame(fiber);
            resolve_or_return!(interp, frame, &[cond]);
            if frame.ready(cond).map(ObjectHandle::truthy).unwrap_or(false) {
                return Outcome::Next;
            }
            let message = interp
                .registry
                .constant(frame.method.class, msg)
                .ok()
                .and_then(|h| h.native().and_then(|n| n.as_str().map(String::from)))
                .unwrap_or_else(|| "assertion failed".to_string());
            match interp.config.assert {
                AssertSeverity::Log => {
                    tracing::warn!(pc = frame.pc, %message, "assertion failed");
                    Outcome::Next
                }
                AssertSeverity::Raise => {
                    raise(frame, VmException::new(ExceptionKind::Assertion, message))
                }
                AssertSeverity::Fatal => raise(
                    frame,
                    VmException::new(ExceptionKind::Fault(FaultKind::IllegalState), message),
                ),
            }
        }

        Op::Yield => {
            let frame = top_frame(fiber);
            frame.pc += 1;
            Outcome::Yield
        }

        Op::WaitAll { slots } => {
            let frame = top_frame(fiber);
            resolve_arguments(interp, frame, &slots)
        }

        Op::ScopeDefer { callable } => {
            let frame = top_frame(fiber);
            resolve_or_return!(interp, frame, &[callable]);
            let Some(c) = frame.ready(callable).and_then(ObjectHandle::callable).cloned() else {
                return raise(
                    frame,
                    VmException::new(ExceptionKind::Unsupported, "finalizer is not callable"),
                );
            };
            frame.add_finalizer(ScopedFinalizer::Call(c));
            Outcome::Next
        }

        Op::GetProp { target, prop, dst } => {
            let frame = top_frame(fiber);
            resolve_or_return!(interp, frame, &[target]);
            let Some(t) = frame.ready(target).cloned() else {
                return raise(
                    frame,
                    VmException::new(ExceptionKind::Unsupported, "property read on empty slot"),
                );
            };
            match dispatch::read_property(interp, frame, &t, prop, dst, false) {
                Ok(PropRead::Value(v)) => {
                    frame.set_slot(dst, v);
                    Outcome::Next
                }
                Ok(PropRead::Spliced) => Outcome::Call,
                Err(e) => raise(frame, e),
            }
        }

        Op::SetProp { target, prop, src } => {
            let frame = top_frame(fiber);
            resolve_or_return!(interp, frame, &[target, src]);
            let (Some(t), Some(v)) = (frame.ready(target).cloned(), frame.slot(src).cloned())
            else {
                return raise(
                    frame,
                    VmException::new(ExceptionKind::Unsupported, "property write on empty slot"),
                );
            };
            match dispatch::write_property(interp, frame, &t, prop, v, false) {
                Ok(PropWrite::Done) => Outcome::Next,
                Ok(PropWrite::Spliced) => Outcome::Call,
                Err(e) => raise(frame, e),
            }
        }

        Op::PropInPlace { target, prop, action, operand, post, dst } => {
            let frame = top_frame(fiber);
            let mut resolve = vec![target];
            if let Some(o) = operand {
                resolve.push(o);
            }
            resolve_or_return!(interp, frame, &resolve);
            let Some(t) = frame.ready(target).cloned() else {
                return raise(
                    frame,
                    VmException::new(ExceptionKind::Unsupported, "update of empty slot"),
                );
            };
            let operand_handle = operand.and_then(|o| frame.ready(o).cloned());

            let mut state = match frame.op_state.take() {
                Some(OpState::InPlace(s)) => s,
                _ => Box::new(InPlaceState::default()),
            };
            let outcome = dispatch::prop_in_place(
                interp,
                frame,
                &mut state,
                &t,
                prop,
                action,
                operand_handle.as_ref(),
                post,
                dst,
            );
            if outcome == Outcome::Call {
                frame.op_state = Some(OpState::InPlace(state));
            }
            outcome
        }

        Op::Eq { a, b, dst } => relation(interp, fiber, a, b, dst, false),

        Op::Cmp { a, b, dst } => relation(interp, fiber, a, b, dst, true),

        Op::SvcConstruct { service: svc, class, type_args, args, dst } => {
            service::send_construct(interp, fiber, svc, class, type_args, args, dst)
        }

        Op::SvcInvoke { service: svc, callee, args, ret } => {
            service::send_invoke(interp, fiber, svc, callee, args, ret)
        }

        Op::SvcGetProp { service: svc, target, prop, dst } => {
            service::send_property_get(interp, fiber, svc, target, prop, dst)
        }

        Op::SvcSetProp { service: svc, target, prop, src } => {
            service::send_property_set(interp, fiber, svc, target, prop, src)
        }

        Op::LoadSingleton { identity, dst } => singleton_load(interp, fiber, identity, dst),

        Op::ServiceEntry => service::service_entry_step(interp, fiber),
    }
}

fn branch_if(
    interp: &Interp,
    fiber: &mut Fiber,
    cond: SlotIdx,
    target: Addr,
    wanted: bool,
) -> Outcome {
    let frame = top_frame(fiber);
    resolve_or_return!(interp, frame, &[cond]);
    let truthy = frame.ready(cond).map(ObjectHandle::truthy).unwrap_or(false);
    if truthy == wanted {
        Outcome::Jump(target)
    } else {
        Outcome::Next
    }
}

fn raise(frame: &mut Frame, e: VmException) -> Outcome {
    frame.exception = Some(e);
    Outcome::Exception
}

/// Equality and ordering share one shape: resolve both operands, run
/// the declared-type sequence, store the answer.
fn relation(
    interp: &Interp,
    fiber: &mut Fiber,
    a: SlotIdx,
    b: SlotIdx,
    dst: SlotIdx,
    ordering: bool,
) -> Outcome {
    let frame = top_frame(fiber);
    resolve_or_return!(interp, frame, &[a, b]);
    let (Some(x), Some(y)) = (frame.ready(a).cloned(), frame.ready(b).cloned()) else {
        return raise(
            frame,
            VmException::new(ExceptionKind::Unsupported, "relation over empty slot"),
        );
    };
    let (t1, t2) = (
        frame.slot_info[a as usize].declared_type,
        frame.slot_info[b as usize].declared_type,
    );
    let result = if ordering {
        dispatch::call_compare_sequence(t1, t2, &x, &y).map(|ord| {
            ObjectHandle::of_int(match ord {
                CmpOrdering::Less => -1,
                CmpOrdering::Equal => 0,
                CmpOrdering::Greater => 1,
            })
        })
    } else {
        dispatch::call_equals_sequence(interp.registry, t1, t2, &x, &y)
            .map(ObjectHandle::of_bool)
    };
    match result {
        Ok(h) => {
            frame.set_slot(dst, ObjValue::Ready(h));
            Outcome::Next
        }
        Err(e) => raise(frame, e),
    }
}

// ─── Singleton access ─────────────────────────────────────────

/// Load (and lazily initialize) a singleton identity. On the owning main
/// context the initializer runs directly with an `Initializing` marker;
/// elsewhere a batch message is posted to main and the fiber suspends on
/// the future.
fn singleton_load(interp: &Interp, fiber: &mut Fiber, identity: [u8; 32], dst: SlotIdx) -> Outcome {
    use crate::container::SingletonState;

    let fiber_id = fiber.fiber_id;
    let on_main = interp.port.main_service() == Some(interp.service);
    let frame = top_frame(fiber);

    // Continuation of an initializer this op spliced earlier.
    if let Some(OpState::SingletonLoad { identity: pending }) = &frame.op_state {
        if *pending == identity {
            frame.op_state = None;
            let Some(h) = frame.ready(dst).cloned() else {
                return raise(
                    frame,
                    VmException::new(
                        ExceptionKind::Fault(FaultKind::IllegalState),
                        "initializer produced no value",
                    ),
                );
            };
            interp.singletons.finish(identity, h);
            interp
                .events
                .append(RuntimeEvent::SingletonInitialized { identity });
            return Outcome::Next;
        }
    }

    match interp.singletons.state(identity) {
        SingletonState::Ready(h) => {
            frame.set_slot(dst, ObjValue::Ready(h));
            Outcome::Next
        }
        SingletonState::Initializing => {
            tracing::warn!(fiber = %fiber_id, "circular singleton initialization");
            interp
                .events
                .append(RuntimeEvent::SingletonCircular { identity });
            raise(frame, VmException::circular_init(&hex(identity)))
        }
        SingletonState::Absent => {
            if on_main {
                let Some(def) = interp.singletons.def(identity) else {
                    return raise(
                        frame,
                        VmException::new(
                            ExceptionKind::Fault(FaultKind::IllegalState),
                            "unknown singleton identity",
                        ),
                    );
                };
                interp.singletons.begin(identity);
                // If the initializer unwinds, the marker must not leak: no
                // partial handle is ever published.
                frame.add_finalizer(ScopedFinalizer::Hook(Box::new(move |hook_interp, _f| {
                    hook_interp.singletons.abandon(identity);
                    Outcome::Next
                })));
                let callee = match build_call_frame(
                    interp,
                    &Callable::unbound(def.init),
                    &[],
                    ReturnTarget::Slot(dst),
                ) {
                    Ok(f) => f,
                    Err(e) => return raise(frame, VmException::from_fault(&e)),
                };
                frame.op_state = Some(OpState::SingletonLoad { identity });
                frame.splice_repeat(callee);
                Outcome::Call
            } else {
                service::send_singleton_batch(interp, fiber, vec![identity], dst)
            }
        }
    }
}

fn hex(bytes: [u8; 32]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

// ─── Test kit ─────────────────────────────────────────────────

#[cfg(test)]
pub(crate) mod testkit {
    use super::*;
    use crate::container::SingletonTable;
    use crate::module::{MethodDef, Module};
    use crate::oracle::ClassTableOracle;
    use crate::service::Response;
    use crate::types::well_known;
    use std::sync::Arc;
    use tokio::sync::mpsc;
    use uuid::Uuid;

    /// Port that accepts nothing: single-service interpreter tests.
    pub struct NullPort {
        pub service: ServiceId,
        resp_tx: mpsc::UnboundedSender<Response>,
        _resp_rx: std::sync::Mutex<mpsc::UnboundedReceiver<Response>>,
    }

    impl NullPort {
        fn new(service: ServiceId) -> Self {
            let (resp_tx, resp_rx) = mpsc::unbounded_channel();
            Self {
                service,
                resp_tx,
                _resp_rx: std::sync::Mutex::new(resp_rx),
            }
        }
    }

    impl ServicePort for NullPort {
        fn self_id(&self) -> ServiceId {
            self.service
        }

        fn main_service(&self) -> Option<ServiceId> {
            Some(self.service)
        }

        fn post(&self, target: ServiceId, _message: crate::service::Message) -> Result<(), VmError> {
            Err(VmError::ServiceUnavailable(target))
        }

        fn response_sender(&self) -> mpsc::UnboundedSender<Response> {
            self.resp_tx.clone()
        }

        fn register_pending(
            &self,
            _request: crate::types::RequestId,
            _fiber: crate::types::FiberId,
            _cells: Vec<crate::handle::FutureCell>,
        ) {
        }
    }

    pub struct TestEnv {
        pub registry: CompositionRegistry,
        pub natives: NativeRegistry,
        pub oracle: ClassTableOracle,
        pub events: EventLog,
        pub singletons: SingletonTable,
        pub config: RuntimeConfig,
        pub port: NullPort,
    }

    impl TestEnv {
        pub fn as_interp(&self) -> Interp<'_> {
            Interp {
                registry: &self.registry,
                natives: &self.natives,
                oracle: &self.oracle,
                events: &self.events,
                singletons: &self.singletons,
                port: &self.port,
                config: &self.config,
                service: self.port.service,
            }
        }

        pub fn load(&self, module: &Module) {
            self.registry.load_module(module).expect("module loads");
            self.oracle.absorb(module);
            self.singletons.register_module(module);
        }
    }

    pub fn scratch_interp() -> TestEnv {
        TestEnv {
            registry: CompositionRegistry::new(),
            natives: NativeRegistry::with_intrinsics(),
            oracle: ClassTableOracle::from_module(&crate::module::intrinsic_module()),
            events: EventLog::new(),
            singletons: SingletonTable::new(),
            config: RuntimeConfig::default(),
            port: NullPort::new(Uuid::now_v7()),
        }
    }

    pub fn method_def(ops: Vec<Op>, max_vars: u16) -> Arc<MethodDef> {
        Arc::new(MethodDef {
            id: 0,
            name: "test".into(),
            params: vec![],
            returns: 1,
            max_vars,
            max_scopes: 4,
            native: false,
            ops,
        })
    }

    pub fn scratch_frame(max_vars: u16) -> Frame {
        Frame::new(
            MethodRef {
                class: well_known::OBJECT,
                method: 0,
            },
            method_def(vec![Op::Return0], max_vars),
            ReturnTarget::Discard,
        )
    }

    /// A fiber whose root frame runs the given ops.
    pub fn fiber_for(env: &TestEnv, ops: Vec<Op>, max_vars: u16) -> Fiber {
        fiber_for_in(env, well_known::OBJECT, ops, max_vars)
    }

    /// Same, with the root frame attributed to a class — constants
    /// resolve against that class's module pool.
    pub fn fiber_for_in(env: &TestEnv, class: ClassId, ops: Vec<Op>, max_vars: u16) -> Fiber {
        let mut fiber = Fiber::new(env.port.service, None);
        let frame = Frame::new(
            MethodRef { class, method: 0 },
            method_def(ops, max_vars),
            ReturnTarget::Discard,
        );
        fiber.frames.push(frame);
        fiber
    }

    pub fn int_result(fiber: &Fiber, idx: usize) -> Option<i64> {
        fiber
            .result
            .as_ref()
            .and_then(|r| r.as_ref().ok())
            .and_then(|vs| vs.get(idx))
            .and_then(ObjValue::as_ready)
            .and_then(ObjectHandle::native)
            .and_then(NativeValue::as_int)
    }
}

#[cfg(test)]
mod tests {
    use super::testkit::*;
    use super::*;
    use crate::deferred::DeferredValue;
    use crate::handle::{FutureCell, Payload};
    use crate::module::{ClassDef, Constant, FieldDef, MethodDef, Module, PropertyDef};
    use crate::types::well_known;
    use std::sync::{Arc, Mutex};

    fn run_to_end(env: &TestEnv, fiber: &mut Fiber) -> RunOutcome {
        let interp = env.as_interp();
        loop {
            match run_fiber(&interp, fiber, 1_000).expect("no engine fault") {
                RunOutcome::Budget | RunOutcome::Yielded => continue,
                done => return done,
            }
        }
    }

    #[test]
    fn straight_line_returns_value() {
        let env = scratch_interp();
        let mut fiber = fiber_for(&env, vec![Op::LoadInt { value: 7, dst: 0 }, Op::Return1 { src: 0 }], 2);
        let out = run_to_end(&env, &mut fiber);
        assert!(matches!(out, RunOutcome::Done));
        assert_eq!(int_result(&fiber, 0), Some(7));
        assert_eq!(fiber.status(), FiberStatus::Terminated);
    }

    /// One class with a bytecode method used as a callee.
    fn callee_module(ops: Vec<Op>, returns: u8) -> Module {
        Module {
            name: "callee".into(),
            constants: vec![Constant::Str("boom".into())],
            classes: vec![ClassDef {
                id: well_known::FIRST_USER,
                name: "Util".into(),
                superclass: Some(well_known::OBJECT),
                type_params: 0,
                fields: vec![],
                properties: vec![],
                methods: vec![MethodDef {
                    id: 0,
                    name: "callee".into(),
                    params: vec![],
                    returns,
                    max_vars: 4,
                    max_scopes: 2,
                    native: false,
                    ops,
                }],
                default_ctor: None,
                primary_ctor: None,
                finalizer: None,
                auto_init: None,
                singleton: false,
                publish_immutable: true,
            }],
            singletons: vec![],
            entry: None,
        }
    }

    const CALLEE: MethodRef = MethodRef {
        class: well_known::FIRST_USER,
        method: 0,
    };

    #[test]
    fn call_and_return_threads_result() {
        let env = scratch_interp();
        env.load(&callee_module(
            vec![Op::LoadInt { value: 41, dst: 0 }, Op::Return1 { src: 0 }],
            1,
        ));
        let mut fiber = fiber_for(
            &env,
            vec![
                Op::Call {
                    target: CallTarget::Method(CALLEE),
                    args: vec![],
                    ret: ReturnTarget::Slot(0),
                },
                Op::IncSlot { slot: 0 },
                Op::Return1 { src: 0 },
            ],
            2,
        );
        let out = run_to_end(&env, &mut fiber);
        assert!(matches!(out, RunOutcome::Done));
        assert_eq!(int_result(&fiber, 0), Some(42));
    }

    #[test]
    fn conditional_receiver_adapts_single_return() {
        let env = scratch_interp();
        env.load(&callee_module(
            vec![Op::LoadConst { cp: 0, dst: 0 }, Op::Return1 { src: 0 }],
            1,
        ));
        let mut fiber = fiber_for(
            &env,
            vec![
                Op::Call {
                    target: CallTarget::Method(CALLEE),
                    args: vec![],
                    ret: ReturnTarget::Cond { ok: 0, value: 1 },
                },
                Op::ReturnN { srcs: vec![0, 1] },
            ],
            3,
        );
        let out = run_to_end(&env, &mut fiber);
        assert!(matches!(out, RunOutcome::Done));
        let values = fiber.result.as_ref().unwrap().as_ref().unwrap();
        assert!(values[0].as_ready().unwrap().truthy());
        assert_eq!(
            values[1].as_ready().unwrap().native().and_then(|n| n.as_str().map(String::from)),
            Some("boom".into())
        );
    }

    #[test]
    fn conditional_receiver_propagates_callee_exception() {
        let env = scratch_interp();
        // Callee throws Bounds.
        env.load(&callee_module(
            vec![
                Op::Construct {
                    class: well_known::BOUNDS,
                    type_args: vec![],
                    args: vec![],
                    dst: 0,
                },
                Op::Throw { src: 0 },
            ],
            1,
        ));
        let mut fiber = fiber_for(
            &env,
            vec![
                Op::LoadInt { value: 99, dst: 1 },
                Op::Call {
                    target: CallTarget::Method(CALLEE),
                    args: vec![],
                    ret: ReturnTarget::Cond { ok: 0, value: 1 },
                },
                Op::ReturnN { srcs: vec![0, 1] },
            ],
            3,
        );
        let out = run_to_end(&env, &mut fiber);
        match out {
            RunOutcome::Failed(e) => assert_eq!(e.kind, ExceptionKind::Bounds),
            other => unreachable!("{other:?}"),
        }
    }

    #[test]
    fn guard_catches_matching_exception() {
        let env = scratch_interp();
        let mut fiber = fiber_for(
            &env,
            vec![
                // guard over a throw of Bounds, handler at 4
                Op::GuardStart {
                    arms: vec![CatchArm {
                        exc_type: well_known::EXCEPTION,
                        handler: 4,
                        capture: 0,
                    }],
                },
                Op::Construct {
                    class: well_known::BOUNDS,
                    type_args: vec![],
                    args: vec![],
                    dst: 1,
                },
                Op::Throw { src: 1 },
                Op::Return0,
                // handler: return the captured handle
                Op::Return1 { src: 0 },
            ],
            2,
        );
        let out = run_to_end(&env, &mut fiber);
        assert!(matches!(out, RunOutcome::Done));
        let caught = fiber.result.as_ref().unwrap().as_ref().unwrap()[0]
            .as_ready()
            .unwrap()
            .clone();
        assert_eq!(caught.composition(), well_known::BOUNDS);
        assert_eq!(env.events.read_from(0).iter().filter(|(_, e)| matches!(e, RuntimeEvent::ExceptionCaught { .. })).count(), 1);
    }

    #[test]
    fn uncatchable_fault_skips_guards() {
        let env = scratch_interp();
        let mut fiber = fiber_for(
            &env,
            vec![
                Op::GuardStart {
                    arms: vec![CatchArm {
                        exc_type: well_known::EXCEPTION,
                        handler: 2,
                        capture: 0,
                    }],
                },
                // Assert with Fatal severity raises an uncatchable fault.
                Op::Assert { cond: 1, msg: 0 },
                Op::Return0,
            ],
            2,
        );
        // cond slot holds false
        fiber.frames[0].set_slot(1, ObjValue::Ready(ObjectHandle::of_bool(false)));
        let mut env = env;
        env.config.assert = AssertSeverity::Fatal;
        let out = run_to_end(&env, &mut fiber);
        assert!(matches!(out, RunOutcome::Failed(e) if !e.kind.catchable()));
    }

    /// Natives that append a label to a shared trace.
    fn tracing_module(labels: &[&str], log: &Arc<Mutex<Vec<String>>>, env: &TestEnv) -> Module {
        let class_id = well_known::FIRST_USER + 7;
        let methods: Vec<MethodDef> = labels
            .iter()
            .enumerate()
            .map(|(i, name)| MethodDef {
                id: i as u32,
                name: (*name).into(),
                params: vec![],
                returns: 0,
                max_vars: 1,
                max_scopes: 0,
                native: true,
                ops: vec![],
            })
            .collect();
        for (i, name) in labels.iter().enumerate() {
            let log = Arc::clone(log);
            let label = name.to_string();
            env.natives.register(
                MethodRef {
                    class: class_id,
                    method: i as u32,
                },
                Arc::new(move |_interp, frame| {
                    log.lock().unwrap().push(label.clone());
                    frame.ret_values = Vec::new();
                    Outcome::Return
                }),
            );
        }
        Module {
            name: "tracer".into(),
            constants: (0..labels.len())
                .map(|i| Constant::Method(MethodRef { class: class_id, method: i as u32 }))
                .collect(),
            classes: vec![ClassDef {
                id: class_id,
                name: "Tracer".into(),
                superclass: Some(well_known::OBJECT),
                type_params: 0,
                fields: vec![],
                properties: vec![],
                methods,
                default_ctor: None,
                primary_ctor: None,
                finalizer: None,
                auto_init: None,
                singleton: false,
                publish_immutable: true,
            }],
            singletons: vec![],
            entry: None,
        }
    }

    #[test]
    fn scoped_finalizers_run_reverse_on_unwind() {
        let env = scratch_interp();
        let log = Arc::new(Mutex::new(Vec::new()));
        env.load(&tracing_module(&["first", "second"], &log, &env));
        let mut fiber = fiber_for_in(
            &env,
            well_known::FIRST_USER + 7,
            vec![
                Op::LoadConst { cp: 0, dst: 0 },
                Op::LoadConst { cp: 1, dst: 1 },
                Op::ScopeDefer { callable: 0 },
                Op::ScopeDefer { callable: 1 },
                Op::Construct {
                    class: well_known::BOUNDS,
                    type_args: vec![],
                    args: vec![],
                    dst: 2,
                },
                Op::Throw { src: 2 },
            ],
            3,
        );
        let out = run_to_end(&env, &mut fiber);
        assert!(matches!(out, RunOutcome::Failed(_)));
        assert_eq!(*log.lock().unwrap(), vec!["second", "first"]);
    }

    #[test]
    fn scoped_finalizers_run_reverse_on_success() {
        let env = scratch_interp();
        let log = Arc::new(Mutex::new(Vec::new()));
        env.load(&tracing_module(&["first", "second"], &log, &env));
        let mut fiber = fiber_for_in(
            &env,
            well_known::FIRST_USER + 7,
            vec![
                Op::LoadConst { cp: 0, dst: 0 },
                Op::LoadConst { cp: 1, dst: 1 },
                Op::ScopeDefer { callable: 0 },
                Op::ScopeDefer { callable: 1 },
                Op::Return0,
            ],
            3,
        );
        let out = run_to_end(&env, &mut fiber);
        assert!(matches!(out, RunOutcome::Done));
        assert_eq!(*log.lock().unwrap(), vec!["second", "first"]);
    }

    #[test]
    fn op_budget_pauses_and_resumes() {
        let env = scratch_interp();
        // for (i = 0; i < 50; i++) {}
        let mut fiber = fiber_for(
            &env,
            vec![
                Op::LoadInt { value: 0, dst: 0 },
                Op::LoadInt { value: 50, dst: 1 },
                Op::IncSlot { slot: 0 },
                Op::JumpIfLt { a: 0, b: 1, target: 2 },
                Op::Return1 { src: 0 },
            ],
            2,
        );
        let interp = env.as_interp();
        let mut slices = 0;
        loop {
            match run_fiber(&interp, &mut fiber, 10).unwrap() {
                RunOutcome::Budget => {
                    assert_eq!(fiber.status(), FiberStatus::Paused);
                    slices += 1;
                }
                RunOutcome::Done => break,
                other => unreachable!("{other:?}"),
            }
        }
        assert_eq!(int_result(&fiber, 0), Some(50));
        // ~100 ops at 10 per slice.
        assert!(slices >= 9, "expected ~10 slices, got {slices}");
    }

    #[test]
    fn deadline_raises_timeout_at_current_pc() {
        let env = scratch_interp();
        let mut fiber = fiber_for(
            &env,
            vec![
                Op::LoadInt { value: 0, dst: 0 },
                Op::LoadInt { value: 1_000_000, dst: 1 },
                Op::IncSlot { slot: 0 },
                Op::JumpIfLt { a: 0, b: 1, target: 2 },
                Op::Return0,
            ],
            2,
        );
        fiber.deadline = Some(Instant::now() - std::time::Duration::from_millis(1));
        let out = run_to_end(&env, &mut fiber);
        match out {
            RunOutcome::Failed(e) => assert_eq!(e.kind, ExceptionKind::Timeout),
            other => unreachable!("{other:?}"),
        }
    }

    #[test]
    fn deferred_argument_resolves_synchronously() {
        let env = scratch_interp();
        let mut fiber = fiber_for(&env, vec![Op::Return1 { src: 0 }], 1);
        fiber.frames[0].set_slot(
            0,
            ObjValue::Deferred(DeferredValue::new(Box::new(|_interp, frame, slot| {
                frame.set_slot(slot, ObjValue::Ready(ObjectHandle::of_int(5)));
                Outcome::Next
            }))),
        );
        let out = run_to_end(&env, &mut fiber);
        assert!(matches!(out, RunOutcome::Done));
        assert_eq!(int_result(&fiber, 0), Some(5));
    }

    #[test]
    fn deferred_argument_resolves_through_a_call() {
        let env = scratch_interp();
        env.load(&callee_module(
            vec![Op::LoadInt { value: 9, dst: 0 }, Op::Return1 { src: 0 }],
            1,
        ));
        let mut fiber = fiber_for(&env, vec![Op::Return1 { src: 0 }], 1);
        fiber.frames[0].set_slot(
            0,
            ObjValue::Deferred(DeferredValue::new(Box::new(move |interp, frame, slot| {
                let callee = build_call_frame(
                    interp,
                    &Callable::unbound(CALLEE),
                    &[],
                    ReturnTarget::Slot(slot),
                )
                .expect("callee exists");
                frame.splice_repeat(callee);
                Outcome::Call
            }))),
        );
        let out = run_to_end(&env, &mut fiber);
        assert!(matches!(out, RunOutcome::Done));
        assert_eq!(int_result(&fiber, 0), Some(9));
    }

    #[test]
    fn pending_future_parks_then_resumes_with_same_handle() {
        let env = scratch_interp();
        let cell = FutureCell::new();
        let mut fiber = fiber_for(&env, vec![Op::Return1 { src: 0 }], 1);
        fiber.frames[0].set_slot(0, ObjValue::Future(cell.clone()));

        let interp = env.as_interp();
        let out = run_fiber(&interp, &mut fiber, 100).unwrap();
        assert!(matches!(out, RunOutcome::Waiting));
        assert_eq!(fiber.status(), FiberStatus::Waiting);

        // Still unresolved: re-entry returns to Waiting without advancing.
        let pc_before = fiber.frames[0].pc;
        let out = run_fiber(&interp, &mut fiber, 100).unwrap();
        assert!(matches!(out, RunOutcome::Waiting));
        assert_eq!(fiber.frames[0].pc, pc_before);

        let supplied = ObjectHandle::of_str("payload");
        cell.complete(supplied.clone());
        let out = run_fiber(&interp, &mut fiber, 100).unwrap();
        assert!(matches!(out, RunOutcome::Done));
        let got = fiber.result.as_ref().unwrap().as_ref().unwrap()[0]
            .as_ready()
            .unwrap()
            .clone();
        assert!(got.ptr_eq(&supplied));
    }

    #[test]
    fn assert_severity_log_continues() {
        let mut env = scratch_interp();
        env.config.assert = AssertSeverity::Log;
        let mut fiber = fiber_for(
            &env,
            vec![
                Op::LoadBool { value: false, dst: 0 },
                Op::Assert { cond: 0, msg: 0 },
                Op::LoadInt { value: 1, dst: 1 },
                Op::Return1 { src: 1 },
            ],
            2,
        );
        // msg constant is out of the (empty) pool; the op falls back to a
        // default message rather than faulting.
        let out = run_to_end(&env, &mut fiber);
        assert!(matches!(out, RunOutcome::Done));
    }

    #[test]
    fn assert_severity_raise_is_catchable() {
        let env = scratch_interp();
        let mut fiber = fiber_for(
            &env,
            vec![
                Op::GuardStart {
                    arms: vec![CatchArm {
                        exc_type: well_known::ASSERTION,
                        handler: 4,
                        capture: 1,
                    }],
                },
                Op::LoadBool { value: false, dst: 0 },
                Op::Assert { cond: 0, msg: 0 },
                Op::Return0,
                Op::Return1 { src: 1 },
            ],
            2,
        );
        let out = run_to_end(&env, &mut fiber);
        assert!(matches!(out, RunOutcome::Done));
        let caught = fiber.result.as_ref().unwrap().as_ref().unwrap()[0]
            .as_ready()
            .unwrap()
            .clone();
        assert_eq!(caught.composition(), well_known::ASSERTION);
    }

    // ── Construction ──

    /// Animal <- Cat with default ctors, finalizers, and a primary ctor
    /// on Cat, all native, logging their order.
    fn construction_module(
        log: &Arc<Mutex<Vec<String>>>,
        env: &TestEnv,
        primary_throws: bool,
    ) -> Module {
        let base = well_known::FIRST_USER + 20;
        let leaf = well_known::FIRST_USER + 21;
        let mut register = |class: ClassId, method: MethodId, label: &str, action: u8| {
            let log = Arc::clone(log);
            let label = label.to_string();
            env.natives.register(
                MethodRef { class, method },
                Arc::new(move |_interp, frame| {
                    log.lock().unwrap().push(label.clone());
                    match action {
                        // throw Bounds
                        1 => {
                            frame.exception = Some(VmException::new(
                                ExceptionKind::Bounds,
                                "primary failed",
                            ));
                            Outcome::Exception
                        }
                        // set field 0 from arg 1 on the struct in slot 0
                        2 => {
                            let target = frame.ready(0).cloned().expect("receiver");
                            let value = frame.slot(1).cloned().expect("argument");
                            target.fields().set(0, value);
                            frame.ret_values = Vec::new();
                            Outcome::Return
                        }
                        _ => {
                            frame.ret_values = Vec::new();
                            Outcome::Return
                        }
                    }
                }),
            );
        };
        register(base, 0, "ctor:animal", 0);
        register(base, 1, "fin:animal", 0);
        register(leaf, 0, "ctor:cat", 0);
        register(leaf, 1, "fin:cat", 0);
        register(leaf, 2, "primary", if primary_throws { 1 } else { 2 });

        let native = |id: MethodId, name: &str, params: usize| MethodDef {
            id,
            name: name.into(),
            params: (0..params)
                .map(|_| crate::module::ParamInfo {
                    declared_type: well_known::OBJECT,
                    dyn_ref: false,
                })
                .collect(),
            returns: 0,
            max_vars: (params + 1) as u16,
            max_scopes: 0,
            native: true,
            ops: vec![],
        };

        Module {
            name: "zoo".into(),
            constants: vec![],
            classes: vec![
                ClassDef {
                    id: base,
                    name: "Animal".into(),
                    superclass: Some(well_known::OBJECT),
                    type_params: 0,
                    fields: vec![],
                    properties: vec![],
                    methods: vec![native(0, "default", 0), native(1, "finalize", 0)],
                    default_ctor: Some(0),
                    primary_ctor: None,
                    finalizer: Some(1),
                    auto_init: None,
                    singleton: false,
                    publish_immutable: false,
                },
                ClassDef {
                    id: leaf,
                    name: "Cat".into(),
                    superclass: Some(base),
                    type_params: 0,
                    fields: vec![FieldDef {
                        id: 0,
                        name: "name".into(),
                        declared_type: well_known::STRING,
                    }],
                    properties: vec![PropertyDef {
                        id: 0,
                        name: "name".into(),
                        field: Some(0),
                        getter: None,
                        setter: None,
                        read_only: false,
                        atomic: false,
                        ref_wrapped: false,
                        declared_type: well_known::STRING,
                    }],
                    methods: vec![
                        native(0, "default", 0),
                        native(1, "finalize", 0),
                        native(2, "construct", 1),
                    ],
                    default_ctor: Some(0),
                    primary_ctor: Some(2),
                    finalizer: Some(1),
                    auto_init: None,
                    singleton: false,
                    publish_immutable: true,
                },
            ],
            singletons: vec![],
            entry: None,
        }
    }

    #[test]
    fn construction_orders_ctors_and_finalizers() {
        let env = scratch_interp();
        let log = Arc::new(Mutex::new(Vec::new()));
        env.load(&construction_module(&log, &env, false));
        let leaf = well_known::FIRST_USER + 21;
        let mut fiber = fiber_for(
            &env,
            vec![
                Op::Construct {
                    class: leaf,
                    type_args: vec![],
                    args: vec![0],
                    dst: 1,
                },
                Op::Return1 { src: 1 },
            ],
            3,
        );
        // slot 0 = the constructor argument
        fiber.frames[0].set_slot(0, ObjValue::Ready(ObjectHandle::of_str("Mia")));

        let out = run_to_end(&env, &mut fiber);
        assert!(matches!(out, RunOutcome::Done));
        assert_eq!(
            *log.lock().unwrap(),
            vec!["ctor:animal", "ctor:cat", "primary", "fin:cat", "fin:animal"]
        );
        let cat = fiber.result.as_ref().unwrap().as_ref().unwrap()[0]
            .as_ready()
            .unwrap()
            .clone();
        assert_eq!(cat.access(), crate::types::Access::Public);
        assert!(!cat.is_mutable(), "publish_immutable seals the handle");
        let name = cat.fields().get(0).unwrap().as_ready().unwrap().clone();
        assert_eq!(name.native().and_then(|n| n.as_str().map(String::from)), Some("Mia".into()));
    }

    #[test]
    fn throwing_primary_runs_anchored_finalizers_reverse_and_skips_assignment() {
        let env = scratch_interp();
        let log = Arc::new(Mutex::new(Vec::new()));
        env.load(&construction_module(&log, &env, true));
        let leaf = well_known::FIRST_USER + 21;
        let mut fiber = fiber_for(
            &env,
            vec![
                Op::Construct {
                    class: leaf,
                    type_args: vec![],
                    args: vec![],
                    dst: 1,
                },
                Op::Return1 { src: 1 },
            ],
            3,
        );
        let out = run_to_end(&env, &mut fiber);
        match out {
            RunOutcome::Failed(e) => assert_eq!(e.kind, ExceptionKind::Bounds),
            other => unreachable!("{other:?}"),
        }
        assert_eq!(
            *log.lock().unwrap(),
            vec!["ctor:animal", "ctor:cat", "primary", "fin:cat", "fin:animal"]
        );
    }

    /// Leaf class with a primary constructor and a finalizer but no
    /// default constructor: the primary anchors the finalizer itself.
    fn primary_only_module(
        log: &Arc<Mutex<Vec<String>>>,
        env: &TestEnv,
        primary_throws: bool,
    ) -> Module {
        let class = well_known::FIRST_USER + 30;
        for (method, label, throws) in [
            (0, "fin:leaf", false),
            (1, "primary", primary_throws),
        ] {
            let log = Arc::clone(log);
            let label = label.to_string();
            env.natives.register(
                MethodRef { class, method },
                Arc::new(move |_interp, frame| {
                    log.lock().unwrap().push(label.clone());
                    if throws {
                        frame.exception =
                            Some(VmException::new(ExceptionKind::Bounds, "primary failed"));
                        Outcome::Exception
                    } else {
                        frame.ret_values = Vec::new();
                        Outcome::Return
                    }
                }),
            );
        }
        let native = |id: MethodId, name: &str| MethodDef {
            id,
            name: name.into(),
            params: vec![],
            returns: 0,
            max_vars: 1,
            max_scopes: 0,
            native: true,
            ops: vec![],
        };
        Module {
            name: "solo".into(),
            constants: vec![],
            classes: vec![ClassDef {
                id: class,
                name: "Solo".into(),
                superclass: Some(well_known::OBJECT),
                type_params: 0,
                fields: vec![],
                properties: vec![],
                methods: vec![native(0, "finalize"), native(1, "construct")],
                default_ctor: None,
                primary_ctor: Some(1),
                finalizer: Some(0),
                auto_init: None,
                singleton: false,
                publish_immutable: true,
            }],
            singletons: vec![],
            entry: None,
        }
    }

    #[test]
    fn primary_anchors_leaf_finalizer_without_default_ctor() {
        let env = scratch_interp();
        let log = Arc::new(Mutex::new(Vec::new()));
        env.load(&primary_only_module(&log, &env, false));
        let mut fiber = fiber_for(
            &env,
            vec![
                Op::Construct {
                    class: well_known::FIRST_USER + 30,
                    type_args: vec![],
                    args: vec![],
                    dst: 0,
                },
                Op::Return1 { src: 0 },
            ],
            1,
        );
        let out = run_to_end(&env, &mut fiber);
        assert!(matches!(out, RunOutcome::Done));
        assert_eq!(*log.lock().unwrap(), vec!["primary", "fin:leaf"]);
    }

    #[test]
    fn primary_anchored_finalizer_runs_on_unwind_without_default_ctor() {
        let env = scratch_interp();
        let log = Arc::new(Mutex::new(Vec::new()));
        env.load(&primary_only_module(&log, &env, true));
        let mut fiber = fiber_for(
            &env,
            vec![
                Op::Construct {
                    class: well_known::FIRST_USER + 30,
                    type_args: vec![],
                    args: vec![],
                    dst: 0,
                },
                Op::Return1 { src: 0 },
            ],
            1,
        );
        let out = run_to_end(&env, &mut fiber);
        assert!(matches!(out, RunOutcome::Failed(e) if e.kind == ExceptionKind::Bounds));
        // Anchored before the primary ran, so the unwind still runs it
        // exactly once.
        assert_eq!(*log.lock().unwrap(), vec!["primary", "fin:leaf"]);
    }

    #[test]
    fn in_place_update_post_returns_pre_value() {
        let env = scratch_interp();
        let log = Arc::new(Mutex::new(Vec::new()));
        env.load(&construction_module(&log, &env, false));
        let leaf = well_known::FIRST_USER + 21;

        // Build a struct-access instance directly.
        let comp = env.registry.ensure(leaf, vec![]).unwrap();
        let fields = crate::handle::FieldMap::with_fields([0], ObjValue::Ready(ObjectHandle::of_int(10)));
        let target = ObjectHandle::new_struct(comp, fields);

        let mut fiber = fiber_for(
            &env,
            vec![
                Op::PropInPlace {
                    target: 0,
                    prop: 0,
                    action: InPlaceAction::Inc,
                    operand: None,
                    post: true,
                    dst: 1,
                },
                Op::Return1 { src: 1 },
            ],
            2,
        );
        fiber.frames[0].set_slot(0, ObjValue::Ready(target.clone()));
        let out = run_to_end(&env, &mut fiber);
        assert!(matches!(out, RunOutcome::Done));
        assert_eq!(int_result(&fiber, 0), Some(10));
        let after = target.fields().get(0).unwrap().as_ready().unwrap().clone();
        assert_eq!(after.native().and_then(NativeValue::as_int), Some(11));
    }

    #[test]
    fn equality_and_ordering_ops() {
        let env = scratch_interp();
        let mut fiber = fiber_for(
            &env,
            vec![
                Op::LoadInt { value: 3, dst: 0 },
                Op::LoadInt { value: 3, dst: 1 },
                Op::Eq { a: 0, b: 1, dst: 2 },
                Op::LoadInt { value: 5, dst: 1 },
                Op::Cmp { a: 0, b: 1, dst: 3 },
                Op::ReturnN { srcs: vec![2, 3] },
            ],
            4,
        );
        let out = run_to_end(&env, &mut fiber);
        assert!(matches!(out, RunOutcome::Done));
        let values = fiber.result.as_ref().unwrap().as_ref().unwrap();
        assert!(values[0].as_ready().unwrap().truthy());
        assert_eq!(
            values[1].as_ready().unwrap().native().and_then(NativeValue::as_int),
            Some(-1)
        );
    }

    #[test]
    fn read_only_write_raises() {
        let env = scratch_interp();
        let log = Arc::new(Mutex::new(Vec::new()));
        env.load(&construction_module(&log, &env, false));
        let leaf = well_known::FIRST_USER + 21;
        let comp = env.registry.ensure(leaf, vec![]).unwrap();
        let fields = crate::handle::FieldMap::with_fields([0], ObjValue::Ready(ObjectHandle::nil()));
        let target = ObjectHandle::new_struct(comp, fields);
        target.seal(true); // published immutable

        let mut fiber = fiber_for(
            &env,
            vec![
                Op::LoadInt { value: 1, dst: 1 },
                Op::SetProp { target: 0, prop: 0, src: 1 },
                Op::Return0,
            ],
            2,
        );
        fiber.frames[0].set_slot(0, ObjValue::Ready(target));
        let out = run_to_end(&env, &mut fiber);
        assert!(matches!(out, RunOutcome::Failed(e) if e.kind == ExceptionKind::ReadOnly));
    }

    #[test]
    fn payload_variants_expose_expected_accessors() {
        let h = ObjectHandle::of_service(uuid::Uuid::now_v7());
        assert!(h.service().is_some());
        assert!(matches!(h.payload(), Payload::Service(_)));
    }
}
