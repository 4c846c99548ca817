use crate::composition::CompositionRegistry;
use crate::errors::{ExceptionKind, VmException};
use crate::frame::{Frame, ReturnTarget};
use crate::handle::{lock, Callable, NativeValue, ObjValue, ObjectHandle, Payload};
use crate::interp::{build_call_frame, Interp, Outcome};
use crate::types::{
    well_known, Access, ClassId, CompositionIndex, MethodId, MethodRef, PropertyId, SlotIdx,
    VAR_REFERENT_FIELD,
};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering as CmpOrdering;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

// ─── Native handler registry ──────────────────────────────────

/// A native method implementation. Runs against the materialized callee
/// frame (receiver in slot 0, arguments after) and obeys the same
/// outcome protocol as bytecode: typically stages `ret_values` and
/// reports `Return`; multi-step handlers may splice and report `Call`.
pub type NativeFn = Arc<dyn Fn(&Interp, &mut Frame) -> Outcome + Send + Sync>;

/// Dispatch-table entries that bypass bytecode. Registered by class
/// templates; looked up when a method chain's top entry is native.
pub struct NativeRegistry {
    handlers: RwLock<HashMap<MethodRef, NativeFn>>,
}

impl NativeRegistry {
    pub fn new() -> Self {
        Self {
            handlers: RwLock::new(HashMap::new()),
        }
    }

    /// Registry with the intrinsic handlers (reference wrappers).
    pub fn with_intrinsics() -> Self {
        let registry = Self::new();
        registry.register(
            MethodRef {
                class: well_known::VAR,
                method: well_known::VAR_GET,
            },
            Arc::new(|_interp, frame| {
                let Some(wrapper) = frame.ready(0).cloned() else {
                    frame.exception = Some(VmException::new(
                        ExceptionKind::Unsupported,
                        "unbound reference wrapper",
                    ));
                    return Outcome::Exception;
                };
                let value = wrapper
                    .fields()
                    .get(VAR_REFERENT_FIELD)
                    .cloned()
                    .unwrap_or(ObjValue::Ready(ObjectHandle::nil()));
                frame.ret_values = vec![value];
                Outcome::Return
            }),
        );
        registry.register(
            MethodRef {
                class: well_known::VAR,
                method: well_known::VAR_SET,
            },
            Arc::new(|_interp, frame| {
                let (Some(wrapper), Some(value)) =
                    (frame.ready(0).cloned(), frame.slot(1).cloned())
                else {
                    frame.exception = Some(VmException::new(
                        ExceptionKind::Unsupported,
                        "reference wrapper set without value",
                    ));
                    return Outcome::Exception;
                };
                wrapper.fields().set(VAR_REFERENT_FIELD, value);
                frame.ret_values = Vec::new();
                Outcome::Return
            }),
        );
        registry
    }

    pub fn register(&self, method: MethodRef, handler: NativeFn) {
        let mut w = self.handlers.write().unwrap_or_else(|e| e.into_inner());
        w.insert(method, handler);
    }

    pub fn get(&self, method: MethodRef) -> Option<NativeFn> {
        let r = self.handlers.read().unwrap_or_else(|e| e.into_inner());
        r.get(&method).cloned()
    }
}

impl Default for NativeRegistry {
    fn default() -> Self {
        Self::new()
    }
}

// ─── Exception <-> handle bridging ────────────────────────────

/// Handle form of a caught exception, for the guard's capture slot.
pub fn exception_handle(exc: &VmException) -> ObjectHandle {
    if let Some(data) = &exc.data {
        return data.clone();
    }
    let class = exc.kind.class_id().unwrap_or(well_known::EXCEPTION);
    // Intrinsic compositions are interned at their class id.
    ObjectHandle::new(
        class as CompositionIndex,
        Payload::Native(NativeValue::Str(Arc::from(exc.message.as_str()))),
        Access::Public,
    )
}

/// Exception form of a thrown handle.
pub fn exception_from_handle(registry: &CompositionRegistry, h: &ObjectHandle) -> VmException {
    let comp = registry.get(h.composition());
    let class = comp.as_ref().map(|c| c.class).unwrap_or(well_known::EXCEPTION);
    let message = h
        .native()
        .and_then(NativeValue::as_str)
        .unwrap_or("exception")
        .to_string();
    let kind = match class {
        well_known::ASSERTION => ExceptionKind::Assertion,
        well_known::READ_ONLY => ExceptionKind::ReadOnly,
        well_known::UNSUPPORTED => ExceptionKind::Unsupported,
        well_known::BOUNDS => ExceptionKind::Bounds,
        well_known::CONCURRENT_MOD => ExceptionKind::ConcurrentModification,
        well_known::DEADLOCK => ExceptionKind::Deadlock,
        well_known::TIMEOUT => ExceptionKind::Timeout,
        _ => ExceptionKind::User(h.composition(), class),
    };
    VmException::new(kind, message).with_data(h.clone())
}

// ─── Property reads and writes ────────────────────────────────

pub enum PropRead {
    /// Field read completed synchronously.
    Value(ObjValue),
    /// A getter (or wrapper get) frame was spliced; result lands in the
    /// requested slot.
    Spliced,
}

pub enum PropWrite {
    Done,
    Spliced,
}

/// Property read per the access rules: struct access or no getter reads
/// the field directly; reference-wrapped dereferences the wrapper (its
/// get may itself call); otherwise the resolved getter runs as a full
/// call with its result in `into`.
pub fn read_property(
    interp: &Interp,
    frame: &mut Frame,
    target: &ObjectHandle,
    prop: PropertyId,
    into: SlotIdx,
    repeat: bool,
) -> Result<PropRead, VmException> {
    let comp = interp
        .registry
        .get(target.composition())
        .ok_or_else(|| VmException::new(ExceptionKind::Unsupported, "unknown composition"))?;
    let info = comp
        .property(prop)
        .ok_or_else(|| {
            VmException::new(ExceptionKind::Unsupported, format!("no property {prop}"))
        })?
        .clone();

    if info.ref_wrapped {
        let field = info.field.ok_or_else(|| {
            VmException::new(ExceptionKind::Unsupported, "wrapper without backing field")
        })?;
        let wrapper = read_field(target, field)?;
        let wrapper = wrapper.as_ready().cloned().ok_or_else(|| {
            VmException::new(ExceptionKind::Unsupported, "unmaterialized wrapper")
        })?;
        let get = MethodRef {
            class: well_known::VAR,
            method: well_known::VAR_GET,
        };
        let callee = build_call_frame(
            interp,
            &Callable::bound(get, wrapper),
            &[],
            ReturnTarget::Slot(into),
        )
        .map_err(|e| VmException::from_fault(&e))?;
        splice(frame, callee, repeat);
        return Ok(PropRead::Spliced);
    }

    let direct = target.access() == Access::Struct || info.getter.is_none();
    if direct {
        let field = info.field.ok_or_else(|| {
            VmException::new(ExceptionKind::Unsupported, "property without backing field")
        })?;
        return Ok(PropRead::Value(read_field(target, field)?));
    }

    let getter = info.getter.expect("checked above");
    let callee = build_call_frame(
        interp,
        &Callable::bound(getter, target.clone()),
        &[],
        ReturnTarget::Slot(into),
    )
    .map_err(|e| VmException::from_fault(&e))?;
    splice(frame, callee, repeat);
    Ok(PropRead::Spliced)
}

/// Property write per the access rules. Immutable target or read-only
/// property raises `ReadOnly`; struct access or no setter writes the
/// field (delegating to the wrapper's set for reference-wrapped);
/// otherwise the resolved setter runs.
pub fn write_property(
    interp: &Interp,
    frame: &mut Frame,
    target: &ObjectHandle,
    prop: PropertyId,
    value: ObjValue,
    repeat: bool,
) -> Result<PropWrite, VmException> {
    let comp = interp
        .registry
        .get(target.composition())
        .ok_or_else(|| VmException::new(ExceptionKind::Unsupported, "unknown composition"))?;
    let info = comp
        .property(prop)
        .ok_or_else(|| {
            VmException::new(ExceptionKind::Unsupported, format!("no property {prop}"))
        })?
        .clone();

    if !target.is_mutable() && target.access() == Access::Public {
        return Err(VmException::new(ExceptionKind::ReadOnly, "immutable target"));
    }
    if info.read_only && target.access() == Access::Public {
        return Err(VmException::new(ExceptionKind::ReadOnly, "read-only property"));
    }

    if info.ref_wrapped {
        let field = info.field.ok_or_else(|| {
            VmException::new(ExceptionKind::Unsupported, "wrapper without backing field")
        })?;
        let wrapper = read_field(target, field)?;
        let wrapper = wrapper.as_ready().cloned().ok_or_else(|| {
            VmException::new(ExceptionKind::Unsupported, "unmaterialized wrapper")
        })?;
        let set = MethodRef {
            class: well_known::VAR,
            method: well_known::VAR_SET,
        };
        let value = value
            .as_ready()
            .cloned()
            .ok_or_else(|| VmException::new(ExceptionKind::Unsupported, "deferred write"))?;
        let callee = build_call_frame(
            interp,
            &Callable::bound(set, wrapper),
            &[value],
            ReturnTarget::Discard,
        )
        .map_err(|e| VmException::from_fault(&e))?;
        splice(frame, callee, repeat);
        return Ok(PropWrite::Spliced);
    }

    let direct = target.access() == Access::Struct || info.setter.is_none();
    if direct {
        let field = info.field.ok_or_else(|| {
            VmException::new(ExceptionKind::Unsupported, "property without backing field")
        })?;
        if !target.fields().set(field, value) {
            return Err(VmException::new(
                ExceptionKind::Unsupported,
                format!("no field {field}"),
            ));
        }
        return Ok(PropWrite::Done);
    }

    let setter = info.setter.expect("checked above");
    let value = value
        .as_ready()
        .cloned()
        .ok_or_else(|| VmException::new(ExceptionKind::Unsupported, "deferred write"))?;
    let callee = build_call_frame(
        interp,
        &Callable::bound(setter, target.clone()),
        &[value],
        ReturnTarget::Discard,
    )
    .map_err(|e| VmException::from_fault(&e))?;
    splice(frame, callee, repeat);
    Ok(PropWrite::Spliced)
}

fn read_field(target: &ObjectHandle, field: u32) -> Result<ObjValue, VmException> {
    if !target.is_compound() {
        return Err(VmException::new(
            ExceptionKind::Unsupported,
            "field read on non-compound value",
        ));
    }
    target
        .fields()
        .get(field)
        .cloned()
        .ok_or_else(|| VmException::new(ExceptionKind::Unsupported, format!("no field {field}")))
}

fn splice(frame: &mut Frame, callee: Frame, repeat: bool) {
    if repeat {
        frame.splice_repeat(callee);
    } else {
        frame.splice(callee);
    }
}

// ─── In-place property updates ────────────────────────────────

/// Action applied between the read and write steps of an in-place
/// update.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum InPlaceAction {
    Inc,
    Dec,
    Add,
    Sub,
    Mul,
}

#[derive(Debug, Default)]
pub enum InPlacePhase {
    #[default]
    Read,
    AwaitRead,
    Write,
    AwaitWrite,
}

/// Progress of the read / act / write state machine, anchored on the
/// frame while its op re-runs around spliced accessor calls.
#[derive(Debug, Default)]
pub struct InPlaceState {
    pub phase: InPlacePhase,
    pub pre: Option<ObjectHandle>,
    pub new: Option<ObjectHandle>,
}

impl InPlaceAction {
    fn apply(self, pre: i64, operand: Option<i64>) -> Result<i64, VmException> {
        let rhs = operand.unwrap_or(1);
        let out = match self {
            InPlaceAction::Inc => pre.checked_add(1),
            InPlaceAction::Dec => pre.checked_sub(1),
            InPlaceAction::Add => pre.checked_add(rhs),
            InPlaceAction::Sub => pre.checked_sub(rhs),
            InPlaceAction::Mul => pre.checked_mul(rhs),
        };
        out.ok_or_else(|| VmException::new(ExceptionKind::Bounds, "integer overflow"))
    }
}

/// Drive one tick of the three-step in-place update: (0) read current
/// value, (1) apply the action, (2) write the new value. The post form
/// leaves the pre-value in `dst`, the pre form the post-value. Every
/// step may independently produce `Next`/`Call`/`Exception`.
#[allow(clippy::too_many_arguments)]
pub fn prop_in_place(
    interp: &Interp,
    frame: &mut Frame,
    state: &mut InPlaceState,
    target: &ObjectHandle,
    prop: PropertyId,
    action: InPlaceAction,
    operand: Option<&ObjectHandle>,
    post: bool,
    dst: SlotIdx,
) -> Outcome {
    loop {
        match state.phase {
            InPlacePhase::Read => {
                match read_property(interp, frame, target, prop, dst, true) {
                    Ok(PropRead::Value(v)) => {
                        let Some(h) = v.as_ready().cloned() else {
                            return raise(frame, VmException::new(
                                ExceptionKind::Unsupported,
                                "deferred field in in-place update",
                            ));
                        };
                        state.pre = Some(h);
                        state.phase = InPlacePhase::Write;
                    }
                    Ok(PropRead::Spliced) => {
                        state.phase = InPlacePhase::AwaitRead;
                        return Outcome::Call;
                    }
                    Err(e) => return raise(frame, e),
                }
            }
            InPlacePhase::AwaitRead => {
                let Some(h) = frame.ready(dst).cloned() else {
                    return raise(frame, VmException::new(
                        ExceptionKind::Unsupported,
                        "getter produced no value",
                    ));
                };
                state.pre = Some(h);
                state.phase = InPlacePhase::Write;
            }
            InPlacePhase::Write => {
                // Act, then write.
                if state.new.is_none() {
                    let pre = state
                        .pre
                        .as_ref()
                        .and_then(|h| h.native())
                        .and_then(NativeValue::as_int);
                    let Some(pre) = pre else {
                        return raise(frame, VmException::new(
                            ExceptionKind::Unsupported,
                            "in-place update on non-integer property",
                        ));
                    };
                    let rhs = operand.and_then(|h| h.native()).and_then(NativeValue::as_int);
                    match action.apply(pre, rhs) {
                        Ok(v) => state.new = Some(ObjectHandle::of_int(v)),
                        Err(e) => return raise(frame, e),
                    }
                }
                let new = state.new.clone().expect("just set");
                match write_property(interp, frame, target, prop, ObjValue::Ready(new), true) {
                    Ok(PropWrite::Done) => {
                        finalize(frame, state, post, dst);
                        return Outcome::Next;
                    }
                    Ok(PropWrite::Spliced) => {
                        state.phase = InPlacePhase::AwaitWrite;
                        return Outcome::Call;
                    }
                    Err(e) => return raise(frame, e),
                }
            }
            InPlacePhase::AwaitWrite => {
                finalize(frame, state, post, dst);
                return Outcome::Next;
            }
        }
    }
}

fn finalize(frame: &mut Frame, state: &mut InPlaceState, post: bool, dst: SlotIdx) {
    let result = if post {
        state.pre.clone()
    } else {
        state.new.clone()
    };
    if let Some(h) = result {
        frame.set_slot(dst, ObjValue::Ready(h));
    }
}

fn raise(frame: &mut Frame, e: VmException) -> Outcome {
    frame.exception = Some(e);
    Outcome::Exception
}

// ─── Equality and ordering ────────────────────────────────────

/// Structural equality: identity short-circuits; native payloads compare
/// by value; ordinary composites iterate field by field under the same
/// composition; distinct compositions are unequal.
pub fn equals_values(
    registry: &CompositionRegistry,
    a: &ObjectHandle,
    b: &ObjectHandle,
) -> Result<bool, VmException> {
    if a.ptr_eq(b) {
        return Ok(true);
    }
    match (a.payload(), b.payload()) {
        (Payload::Native(x), Payload::Native(y)) => Ok(x == y),
        (Payload::Service(x), Payload::Service(y)) => Ok(x == y),
        (Payload::Callable(x), Payload::Callable(y)) => {
            Ok(x.method == y.method
                && match (&x.bound, &y.bound) {
                    (None, None) => true,
                    (Some(p), Some(q)) => p.ptr_eq(q),
                    _ => false,
                })
        }
        (Payload::Fields(x), Payload::Fields(y)) => {
            if a.composition() != b.composition() {
                return Ok(false);
            }
            let (xs, ys): (Vec<_>, Vec<_>) = {
                let xg = lock(x);
                let yg = lock(y);
                (
                    xg.iter().map(|(id, v)| (id, v.clone())).collect(),
                    yg.iter().map(|(id, v)| (id, v.clone())).collect(),
                )
            };
            if xs.len() != ys.len() {
                return Ok(false);
            }
            for ((fx, vx), (fy, vy)) in xs.iter().zip(ys.iter()) {
                if fx != fy {
                    return Ok(false);
                }
                match (vx.as_ready(), vy.as_ready()) {
                    (Some(hx), Some(hy)) => {
                        if !equals_values(registry, hx, hy)? {
                            return Ok(false);
                        }
                    }
                    _ => {
                        return Err(VmException::new(
                            ExceptionKind::Unsupported,
                            "equality over unmaterialized field",
                        ))
                    }
                }
            }
            Ok(true)
        }
        _ => Ok(false),
    }
}

/// Natural ordering for primitives; compound values are unordered.
pub fn compare_values(a: &ObjectHandle, b: &ObjectHandle) -> Result<CmpOrdering, VmException> {
    match (a.native(), b.native()) {
        (Some(NativeValue::Int(x)), Some(NativeValue::Int(y))) => Ok(x.cmp(y)),
        (Some(NativeValue::Str(x)), Some(NativeValue::Str(y))) => Ok(x.cmp(y)),
        (Some(NativeValue::Bool(x)), Some(NativeValue::Bool(y))) => Ok(x.cmp(y)),
        _ => Err(VmException::new(
            ExceptionKind::Unsupported,
            "values are not comparable",
        )),
    }
}

/// Equality under two declared types: the first type's equality decides
/// inequality; the second confirms.
pub fn call_equals_sequence(
    registry: &CompositionRegistry,
    _t1: ClassId,
    _t2: ClassId,
    a: &ObjectHandle,
    b: &ObjectHandle,
) -> Result<bool, VmException> {
    if !equals_values(registry, a, b)? {
        return Ok(false);
    }
    equals_values(registry, a, b)
}

/// Ordering under two declared types: the first type's ordering decides;
/// the second tie-breaks.
pub fn call_compare_sequence(
    _t1: ClassId,
    _t2: ClassId,
    a: &ObjectHandle,
    b: &ObjectHandle,
) -> Result<CmpOrdering, VmException> {
    match compare_values(a, b)? {
        CmpOrdering::Equal => compare_values(a, b),
        other => Ok(other),
    }
}

/// Resolve the method a call should enter for a receiver: the top of the
/// receiver composition's chain for that method id.
pub fn virtual_target(
    registry: &CompositionRegistry,
    receiver: &ObjectHandle,
    method: MethodId,
) -> Result<MethodRef, VmException> {
    let comp = registry
        .get(receiver.composition())
        .ok_or_else(|| VmException::new(ExceptionKind::Unsupported, "unknown composition"))?;
    comp.method_chain(method).map(|c| c.top()).ok_or_else(|| {
        VmException::new(ExceptionKind::Unsupported, format!("no method {method}"))
    })
}
