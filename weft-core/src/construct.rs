use crate::deferred::{collect_arguments, resolve_arguments};
use crate::errors::{ExceptionKind, VmException};
use crate::frame::{Frame, OpState, ReturnTarget, ScopedFinalizer};
use crate::handle::{Callable, FieldMap, ObjValue, ObjectHandle};
use crate::interp::{build_call_frame, Interp, Outcome};
use crate::types::{ClassId, CompositionIndex, MethodRef, SlotIdx, TypeArg};

// ─── State ────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConstructPhase {
    /// Leaf auto-initializer (field defaults), when declared.
    AutoInit,
    /// Default-constructor chain, root to leaf.
    Defaults,
    /// Primary constructor with the caller's arguments.
    Primary,
    /// Anchored finalizers, leaf to root, on the still-mutable struct.
    Finalizers,
    /// Flip to public access and assign.
    Publish,
}

/// Progress of one construction, anchored on the frame while its op
/// re-runs around the spliced constructor calls. Finalizers are anchored
/// on the frame's scoped chain as the default chain progresses, so an
/// exception anywhere still runs them during unwind; the success path
/// consumes them from the same chain.
pub struct ConstructState {
    pub target: ObjectHandle,
    pub comp: CompositionIndex,
    pub phase: ConstructPhase,
    /// Next link of the root-first constructor chain.
    pub cursor: usize,
    /// Finalizer depth on entry; everything above it is ours.
    pub fin_base: usize,
    /// Finalizer to anchor once the just-spliced constructor completes.
    pub pending_fin: Option<MethodRef>,
    /// The leaf finalizer belongs to the primary constructor; it is
    /// anchored exactly once whether or not the leaf declares a default
    /// constructor.
    pub leaf_fin_anchored: bool,
    pub args: Vec<ObjectHandle>,
    pub dst: SlotIdx,
}

// ─── Driver ───────────────────────────────────────────────────

/// Drive one tick of a construction. Re-entered (same pc) after every
/// spliced constructor or finalizer call completes.
pub fn construct_step(
    interp: &Interp,
    frame: &mut Frame,
    class: ClassId,
    type_args: &[TypeArg],
    arg_slots: &[SlotIdx],
    dst: SlotIdx,
) -> Outcome {
    if frame.op_state.is_none() {
        match resolve_arguments(interp, frame, arg_slots) {
            Outcome::Next => {}
            other => return other,
        }
        let comp_idx = match interp.registry.ensure(class, type_args.to_vec()) {
            Ok(idx) => idx,
            Err(e) => return raise(frame, VmException::from_fault(&e)),
        };
        let comp = match interp.registry.get(comp_idx) {
            Some(c) => c,
            None => {
                return raise(
                    frame,
                    VmException::new(ExceptionKind::Unsupported, "unknown composition"),
                )
            }
        };
        let fields = FieldMap::with_fields(
            comp.fields.iter().map(|(id, _)| *id),
            ObjValue::Ready(ObjectHandle::nil()),
        );
        let state = ConstructState {
            target: ObjectHandle::new_struct(comp_idx, fields),
            comp: comp_idx,
            phase: ConstructPhase::AutoInit,
            cursor: 0,
            fin_base: frame.finalizers.len(),
            pending_fin: None,
            leaf_fin_anchored: false,
            args: collect_arguments(frame, arg_slots),
            dst,
        };
        frame.op_state = Some(OpState::Construct(Box::new(state)));
    }

    let Some(OpState::Construct(mut state)) = frame.op_state.take() else {
        return raise(
            frame,
            VmException::new(ExceptionKind::Unsupported, "mismatched construction state"),
        );
    };

    // The constructor behind a pending anchor has completed.
    if let Some(fin) = state.pending_fin.take() {
        frame.add_finalizer(ScopedFinalizer::Call(Callable::bound(
            fin,
            state.target.clone(),
        )));
    }

    let comp = match interp.registry.get(state.comp) {
        Some(c) => c,
        None => {
            return raise(
                frame,
                VmException::new(ExceptionKind::Unsupported, "unknown composition"),
            )
        }
    };

    loop {
        match state.phase {
            ConstructPhase::AutoInit => {
                state.phase = ConstructPhase::Defaults;
                if let Some(auto) = comp.auto_init {
                    let callee = match build_call_frame(
                        interp,
                        &Callable::bound(auto, state.target.clone()),
                        &[],
                        ReturnTarget::Discard,
                    ) {
                        Ok(f) => f,
                        Err(e) => return raise(frame, VmException::from_fault(&e)),
                    };
                    frame.splice_repeat(callee);
                    frame.op_state = Some(OpState::Construct(state));
                    return Outcome::Call;
                }
            }
            ConstructPhase::Defaults => {
                if state.cursor >= comp.ctor_chain.len() {
                    state.phase = ConstructPhase::Primary;
                    continue;
                }
                let link = comp.ctor_chain[state.cursor].clone();
                let is_leaf = state.cursor == comp.ctor_chain.len() - 1;
                state.cursor += 1;
                if let Some(ctor) = link.default_ctor {
                    state.pending_fin = link.finalizer;
                    if is_leaf && link.finalizer.is_some() {
                        state.leaf_fin_anchored = true;
                    }
                    let callee = match build_call_frame(
                        interp,
                        &Callable::bound(ctor, state.target.clone()),
                        &[],
                        ReturnTarget::Discard,
                    ) {
                        Ok(f) => f,
                        Err(e) => return raise(frame, VmException::from_fault(&e)),
                    };
                    frame.splice_repeat(callee);
                    frame.op_state = Some(OpState::Construct(state));
                    return Outcome::Call;
                }
            }
            ConstructPhase::Primary => {
                state.phase = ConstructPhase::Finalizers;
                if let Some(primary) = comp.primary_ctor {
                    // The primary constructor's finalizer anchors at the
                    // leaf even when no default constructor registered it.
                    if !state.leaf_fin_anchored {
                        if let Some(fin) =
                            comp.ctor_chain.last().and_then(|link| link.finalizer)
                        {
                            frame.add_finalizer(ScopedFinalizer::Call(Callable::bound(
                                fin,
                                state.target.clone(),
                            )));
                            state.leaf_fin_anchored = true;
                        }
                    }
                    let args: Vec<ObjectHandle> = state.args.clone();
                    let callee = match build_call_frame(
                        interp,
                        &Callable::bound(primary, state.target.clone()),
                        &args,
                        ReturnTarget::Discard,
                    ) {
                        Ok(f) => f,
                        Err(e) => return raise(frame, VmException::from_fault(&e)),
                    };
                    frame.splice_repeat(callee);
                    frame.op_state = Some(OpState::Construct(state));
                    return Outcome::Call;
                }
            }
            ConstructPhase::Finalizers => {
                // Consume our anchored finalizers leaf-to-root so they run
                // exactly once; an unwind path would have drained the same
                // entries in the same order.
                if frame.finalizers.len() > state.fin_base {
                    match frame.finalizers.pop() {
                        Some(ScopedFinalizer::Call(callable)) => {
                            let callee = match build_call_frame(
                                interp,
                                &callable,
                                &[],
                                ReturnTarget::Discard,
                            ) {
                                Ok(f) => f,
                                Err(e) => return raise(frame, VmException::from_fault(&e)),
                            };
                            frame.splice_repeat(callee);
                            frame.op_state = Some(OpState::Construct(state));
                            return Outcome::Call;
                        }
                        Some(other) => {
                            // Not ours — put it back and stop consuming.
                            frame.finalizers.push(other);
                            state.phase = ConstructPhase::Publish;
                        }
                        None => state.phase = ConstructPhase::Publish,
                    }
                } else {
                    state.phase = ConstructPhase::Publish;
                }
            }
            ConstructPhase::Publish => {
                state.target.seal(comp.publish_immutable);
                frame.set_slot(state.dst, ObjValue::Ready(state.target.clone()));
                return Outcome::Next;
            }
        }
    }
}

fn raise(frame: &mut Frame, e: VmException) -> Outcome {
    frame.exception = Some(e);
    Outcome::Exception
}
