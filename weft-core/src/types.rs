use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ─── Scalar aliases ───────────────────────────────────────────

/// Bytecode address (index into a method's op vector).
pub type Addr = u32;

/// Local slot index inside a frame (argument/variable/return).
pub type SlotIdx = u16;

/// Canonical class identity. Ids below [`well_known::FIRST_USER`] are
/// reserved for intrinsics and shared by every loaded module.
pub type ClassId = u32;

/// Method identity, unique within its declaring class.
pub type MethodId = u32;

/// Property identity, unique within its declaring class.
pub type PropertyId = u32;

/// Field identity, unique within its declaring class chain.
pub type FieldId = u32;

/// Index into a module's constant pool.
pub type ConstId = u32;

/// Stable index into the composition registry arena. Handles carry this
/// instead of a pointer so values survive cross-service transport.
pub type CompositionIndex = u32;

/// Fiber identity (v7, creation-ordered).
pub type FiberId = Uuid;

/// Service context identity.
pub type ServiceId = Uuid;

/// Cross-service request identity, echoed by the response.
pub type RequestId = Uuid;

// ─── Type arguments ───────────────────────────────────────────

/// One actual type argument in a composition identity.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TypeArg {
    Class(ClassId),
    /// Integral argument (e.g. a fixed capacity).
    Int(i64),
}

// ─── Access marker ────────────────────────────────────────────

/// Whether a handle is still under construction (`Struct`: all fields
/// visible and mutable, accessors bypassed) or published (`Public`).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Access {
    Struct,
    Public,
}

// ─── Method reference ─────────────────────────────────────────

/// Fully-qualified method reference: declaring class + method id.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MethodRef {
    pub class: ClassId,
    pub method: MethodId,
}

// ─── Well-known class ids ─────────────────────────────────────

/// Class ids reserved for intrinsics. Every module shares these; the
/// loader rejects user classes below `FIRST_USER`.
pub mod well_known {
    use super::ClassId;

    pub const OBJECT: ClassId = 0;
    pub const EXCEPTION: ClassId = 1;
    pub const ASSERTION: ClassId = 2;
    pub const READ_ONLY: ClassId = 3;
    pub const UNSUPPORTED: ClassId = 4;
    pub const BOUNDS: ClassId = 5;
    pub const CONCURRENT_MOD: ClassId = 6;
    pub const DEADLOCK: ClassId = 7;
    pub const TIMEOUT: ClassId = 8;
    pub const BOOLEAN: ClassId = 9;
    pub const INT64: ClassId = 10;
    pub const STRING: ClassId = 11;
    pub const FUNCTION: ClassId = 12;
    pub const TUPLE: ClassId = 13;
    pub const SERVICE: ClassId = 14;
    /// Reference wrapper (`Var`) — carries `VAR_GET`/`VAR_SET`.
    pub const VAR: ClassId = 15;

    pub const FIRST_USER: ClassId = 16;

    /// Method ids on `VAR` recognized by the dispatch surface.
    pub const VAR_GET: super::MethodId = 0;
    pub const VAR_SET: super::MethodId = 1;
}

/// Returns the well-known field id used by the `VAR` wrapper to hold its
/// referent when it has no accessor methods.
pub const VAR_REFERENT_FIELD: FieldId = 0;
