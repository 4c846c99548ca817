use crate::deferred::DeferredValue;
use crate::errors::VmException;
use crate::types::{well_known, Access, CompositionIndex, FieldId, MethodRef, ServiceId};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

// ─── Native scalar payloads ───────────────────────────────────

/// Payload of a primitive handle. Always immutable.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum NativeValue {
    /// Absent value: uninitialized fields, unit results.
    Nil,
    Bool(bool),
    Int(i64),
    Str(Arc<str>),
}

impl NativeValue {
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            NativeValue::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            NativeValue::Int(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            NativeValue::Str(s) => Some(s),
            _ => None,
        }
    }
}

// ─── Callable ─────────────────────────────────────────────────

/// A function value: a method reference plus an optional bound receiver.
#[derive(Clone, Debug)]
pub struct Callable {
    pub method: MethodRef,
    pub bound: Option<ObjectHandle>,
}

impl Callable {
    pub fn unbound(method: MethodRef) -> Self {
        Self {
            method,
            bound: None,
        }
    }

    pub fn bound(method: MethodRef, receiver: ObjectHandle) -> Self {
        Self {
            method,
            bound: Some(receiver),
        }
    }
}

// ─── Future cells ─────────────────────────────────────────────

#[derive(Clone, Debug)]
pub enum FutureState {
    Pending,
    Done(ObjectHandle),
    Failed(VmException),
}

/// Shared one-shot completion cell. Completion preserves handle identity:
/// awaiting yields the very handle the completer supplied. Late
/// completions are dropped (first write wins).
#[derive(Clone)]
pub struct FutureCell(Arc<Mutex<FutureState>>);

impl FutureCell {
    pub fn new() -> Self {
        Self(Arc::new(Mutex::new(FutureState::Pending)))
    }

    /// Complete successfully. Returns false if the cell was already
    /// resolved (the value is dropped).
    pub fn complete(&self, value: ObjectHandle) -> bool {
        let mut st = lock(&self.0);
        if matches!(*st, FutureState::Pending) {
            *st = FutureState::Done(value);
            true
        } else {
            false
        }
    }

    /// Complete exceptionally. Returns false if already resolved.
    pub fn fail(&self, exception: VmException) -> bool {
        let mut st = lock(&self.0);
        if matches!(*st, FutureState::Pending) {
            *st = FutureState::Failed(exception);
            true
        } else {
            false
        }
    }

    pub fn state(&self) -> FutureState {
        lock(&self.0).clone()
    }

    pub fn is_pending(&self) -> bool {
        matches!(*lock(&self.0), FutureState::Pending)
    }
}

impl Default for FutureCell {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for FutureCell {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "FutureCell({:?})", *lock(&self.0))
    }
}

// ─── Field maps ───────────────────────────────────────────────

/// Field storage for compound values. Declared order is preserved;
/// lookup is by field id (linear — field counts are small).
#[derive(Debug, Default)]
pub struct FieldMap {
    entries: Vec<(FieldId, ObjValue)>,
}

impl FieldMap {
    pub fn with_fields(ids: impl IntoIterator<Item = FieldId>, fill: ObjValue) -> Self {
        Self {
            entries: ids.into_iter().map(|id| (id, fill.clone())).collect(),
        }
    }

    pub fn get(&self, id: FieldId) -> Option<&ObjValue> {
        self.entries.iter().find(|(f, _)| *f == id).map(|(_, v)| v)
    }

    pub fn set(&mut self, id: FieldId, value: ObjValue) -> bool {
        if let Some(slot) = self.entries.iter_mut().find(|(f, _)| *f == id) {
            slot.1 = value;
            true
        } else {
            false
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (FieldId, &ObjValue)> {
        self.entries.iter().map(|(f, v)| (*f, v))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

// ─── Handles ──────────────────────────────────────────────────

/// Handle payload: compound field map, native scalar, callable, or a
/// service proxy.
#[derive(Debug)]
pub enum Payload {
    Fields(Mutex<FieldMap>),
    Native(NativeValue),
    Callable(Callable),
    Service(ServiceId),
    /// A first-class future result (deferred cross-service value).
    Future(FutureCell),
}

const META_MUTABLE: u8 = 0b01;
const META_STRUCT: u8 = 0b10;

#[derive(Debug)]
struct HandleInner {
    composition: CompositionIndex,
    /// Packed mutability + access bits; flipped once at publish time.
    meta: AtomicU8,
    payload: Payload,
}

/// Uniform reference to an in-memory value. Cloning shares the referent;
/// identity comparison is pointer equality on the shared inner.
#[derive(Clone, Debug)]
pub struct ObjectHandle(Arc<HandleInner>);

impl ObjectHandle {
    pub fn new(composition: CompositionIndex, payload: Payload, access: Access) -> Self {
        let mut meta = 0;
        if access == Access::Struct {
            meta |= META_STRUCT | META_MUTABLE;
        }
        Self(Arc::new(HandleInner {
            composition,
            meta: AtomicU8::new(meta),
            payload,
        }))
    }

    /// Fresh compound handle in struct access: every declared field
    /// present, mutable, all accessors bypassed.
    pub fn new_struct(composition: CompositionIndex, fields: FieldMap) -> Self {
        Self::new(composition, Payload::Fields(Mutex::new(fields)), Access::Struct)
    }

    pub fn composition(&self) -> CompositionIndex {
        self.0.composition
    }

    pub fn access(&self) -> Access {
        if self.0.meta.load(Ordering::Acquire) & META_STRUCT != 0 {
            Access::Struct
        } else {
            Access::Public
        }
    }

    pub fn is_mutable(&self) -> bool {
        self.0.meta.load(Ordering::Acquire) & META_MUTABLE != 0
    }

    /// Publish a constructed value: struct access becomes public, and the
    /// handle becomes immutable when the composition says so.
    pub fn seal(&self, publish_immutable: bool) {
        let meta = if publish_immutable { 0 } else { META_MUTABLE };
        self.0.meta.store(meta, Ordering::Release);
    }

    pub fn payload(&self) -> &Payload {
        &self.0.payload
    }

    pub fn native(&self) -> Option<&NativeValue> {
        match &self.0.payload {
            Payload::Native(v) => Some(v),
            _ => None,
        }
    }

    pub fn callable(&self) -> Option<&Callable> {
        match &self.0.payload {
            Payload::Callable(c) => Some(c),
            _ => None,
        }
    }

    pub fn service(&self) -> Option<ServiceId> {
        match &self.0.payload {
            Payload::Service(id) => Some(*id),
            _ => None,
        }
    }

    pub fn future(&self) -> Option<&FutureCell> {
        match &self.0.payload {
            Payload::Future(f) => Some(f),
            _ => None,
        }
    }

    /// Locked view of the field map. Panics on non-compound payloads —
    /// callers check the composition first.
    pub fn fields(&self) -> MutexGuard<'_, FieldMap> {
        match &self.0.payload {
            Payload::Fields(m) => lock(m),
            other => unreachable!("fields() on non-compound payload {other:?}"),
        }
    }

    pub fn is_compound(&self) -> bool {
        matches!(self.0.payload, Payload::Fields(_))
    }

    /// Reference identity.
    pub fn ptr_eq(&self, other: &ObjectHandle) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }

    // ── Intrinsic constructors ──
    //
    // Intrinsic compositions are interned first by the registry, so their
    // composition index equals their well-known class id.

    pub fn nil() -> Self {
        Self::new(
            well_known::OBJECT,
            Payload::Native(NativeValue::Nil),
            Access::Public,
        )
    }

    pub fn is_nil(&self) -> bool {
        matches!(self.native(), Some(NativeValue::Nil))
    }

    pub fn of_bool(b: bool) -> Self {
        Self::new(
            well_known::BOOLEAN,
            Payload::Native(NativeValue::Bool(b)),
            Access::Public,
        )
    }

    pub fn of_int(n: i64) -> Self {
        Self::new(
            well_known::INT64,
            Payload::Native(NativeValue::Int(n)),
            Access::Public,
        )
    }

    pub fn of_str(s: impl AsRef<str>) -> Self {
        Self::new(
            well_known::STRING,
            Payload::Native(NativeValue::Str(Arc::from(s.as_ref()))),
            Access::Public,
        )
    }

    pub fn of_callable(c: Callable) -> Self {
        Self::new(well_known::FUNCTION, Payload::Callable(c), Access::Public)
    }

    pub fn of_service(id: ServiceId) -> Self {
        Self::new(well_known::SERVICE, Payload::Service(id), Access::Public)
    }

    pub fn of_future(cell: FutureCell) -> Self {
        Self::new(well_known::OBJECT, Payload::Future(cell), Access::Public)
    }

    pub fn truthy(&self) -> bool {
        matches!(self.native(), Some(NativeValue::Bool(true)))
    }

    /// Value copy for cross-service transport. Deeply immutable values
    /// pass by reference; anything mutable is copied field by field.
    pub fn deep_copy(&self) -> ObjectHandle {
        match &self.0.payload {
            Payload::Fields(m) => {
                if !self.is_mutable() && self.access() == Access::Public {
                    // Still copy when any field is mutable underneath.
                    let all_frozen = lock(m).iter().all(|(_, v)| match v {
                        ObjValue::Ready(h) => !h.is_mutable() && !h.is_compound(),
                        _ => false,
                    });
                    if all_frozen {
                        return self.clone();
                    }
                }
                let copied: Vec<(FieldId, ObjValue)> = lock(m)
                    .iter()
                    .map(|(id, v)| (id, v.deep_copy()))
                    .collect();
                let mut map = FieldMap::default();
                for (id, v) in copied {
                    map.entries.push((id, v));
                }
                let h = ObjectHandle::new(
                    self.0.composition,
                    Payload::Fields(Mutex::new(map)),
                    self.access(),
                );
                if self.is_mutable() {
                    h.0.meta.fetch_or(META_MUTABLE, Ordering::Release);
                }
                h
            }
            // Scalars, callables, service proxies and futures are
            // immutable or shared by design.
            _ => self.clone(),
        }
    }
}

// ─── Slot values ──────────────────────────────────────────────

/// A slot value: materialized, deferred behind a resolver, or a future.
/// An op never observes `Deferred` after its resolving continuation has
/// completed.
#[derive(Clone, Debug)]
pub enum ObjValue {
    Ready(ObjectHandle),
    Deferred(DeferredValue),
    Future(FutureCell),
}

impl ObjValue {
    pub fn as_ready(&self) -> Option<&ObjectHandle> {
        match self {
            ObjValue::Ready(h) => Some(h),
            _ => None,
        }
    }

    pub fn is_ready(&self) -> bool {
        matches!(self, ObjValue::Ready(_))
    }

    pub fn deep_copy(&self) -> ObjValue {
        match self {
            ObjValue::Ready(h) => ObjValue::Ready(h.deep_copy()),
            // Resolvers and cells are shared, not copied.
            other => other.clone(),
        }
    }
}

impl From<ObjectHandle> for ObjValue {
    fn from(h: ObjectHandle) -> Self {
        ObjValue::Ready(h)
    }
}

pub(crate) fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn field_map_preserves_declared_order() {
        let mut map = FieldMap::with_fields([7, 3, 5], ObjValue::Ready(ObjectHandle::of_int(0)));
        map.set(3, ObjValue::Ready(ObjectHandle::of_int(33)));
        let order: Vec<FieldId> = map.iter().map(|(id, _)| id).collect();
        assert_eq!(order, vec![7, 3, 5]);
        let v = map.get(3).and_then(|v| v.as_ready()).unwrap();
        assert_eq!(v.native().and_then(NativeValue::as_int), Some(33));
    }

    #[test]
    fn future_cell_first_write_wins() {
        let cell = FutureCell::new();
        let a = ObjectHandle::of_int(1);
        assert!(cell.complete(a.clone()));
        assert!(!cell.complete(ObjectHandle::of_int(2)));
        assert!(!cell.fail(VmException::timeout()));
        match cell.state() {
            FutureState::Done(h) => assert!(h.ptr_eq(&a)),
            other => unreachable!("{other:?}"),
        }
    }

    #[test]
    fn seal_flips_struct_to_public() {
        let h = ObjectHandle::new_struct(42, FieldMap::default());
        assert_eq!(h.access(), Access::Struct);
        assert!(h.is_mutable());
        h.seal(true);
        assert_eq!(h.access(), Access::Public);
        assert!(!h.is_mutable());
    }

    #[test]
    fn deep_copy_detaches_mutable_fields() {
        let mut map = FieldMap::default();
        map.entries
            .push((0, ObjValue::Ready(ObjectHandle::of_int(1))));
        let original = ObjectHandle::new_struct(42, map);
        let copy = original.deep_copy();
        assert!(!copy.ptr_eq(&original));
        copy.fields().set(0, ObjValue::Ready(ObjectHandle::of_int(9)));
        let kept = original.fields().get(0).unwrap().as_ready().unwrap().clone();
        assert_eq!(kept.native().and_then(NativeValue::as_int), Some(1));
    }
}
