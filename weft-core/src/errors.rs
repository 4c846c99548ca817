use crate::handle::ObjectHandle;
use crate::types::{well_known, Addr, ClassId, CompositionIndex, ConstId, ServiceId};
use thiserror::Error;

// ─── Runtime faults ───────────────────────────────────────────

/// Engine-level faults: bugs, corrupt input, or host failures. These are
/// never produced by well-formed bytecode and never catchable by guards.
#[derive(Debug, Error)]
pub enum VmError {
    #[error("unknown opcode `{opcode}` in {method} at pc {pc}")]
    UnknownOpcode {
        method: String,
        pc: Addr,
        opcode: String,
    },

    #[error("corrupt module: {0}")]
    CorruptModule(String),

    #[error("constant {index} is not a {expected}")]
    CorruptConstant { index: ConstId, expected: &'static str },

    #[error("unknown class id {0}")]
    UnknownClass(ClassId),

    #[error("class {class} has no method {method}")]
    UnknownMethod { class: ClassId, method: u32 },

    #[error("composition {comp} has no property {property}")]
    UnknownProperty { comp: CompositionIndex, property: u32 },

    #[error("illegal fiber transition {from} -> {to}")]
    IllegalTransition {
        from: &'static str,
        to: &'static str,
    },

    #[error("service {0} is not available")]
    ServiceUnavailable(ServiceId),

    #[error("module `{0}` not found")]
    ModuleNotFound(String),

    #[error("module version mismatch")]
    VersionMismatch,

    #[error("container is shutting down")]
    ShuttingDown,

    #[error("internal: {0}")]
    Internal(String),
}

// ─── Program exceptions ───────────────────────────────────────

/// Kinds of uncatchable faults surfaced through the exception path
/// (no guard ever matches them).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FaultKind {
    CircularInitialization,
    IllegalState,
    Internal,
}

/// Exception discriminant. One tagged enum with a common carrier handle;
/// guard matching is a single subtype query against `class_id()`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ExceptionKind {
    Assertion,
    ReadOnly,
    Unsupported,
    Bounds,
    ConcurrentModification,
    Deadlock,
    Timeout,
    /// User-defined exception type, identified by its composition.
    User(CompositionIndex, ClassId),
    /// Engine fault routed through the unwind machinery. Uncatchable.
    Fault(FaultKind),
}

impl ExceptionKind {
    /// The class identity guards are matched against. Faults have none.
    pub fn class_id(&self) -> Option<ClassId> {
        match self {
            ExceptionKind::Assertion => Some(well_known::ASSERTION),
            ExceptionKind::ReadOnly => Some(well_known::READ_ONLY),
            ExceptionKind::Unsupported => Some(well_known::UNSUPPORTED),
            ExceptionKind::Bounds => Some(well_known::BOUNDS),
            ExceptionKind::ConcurrentModification => Some(well_known::CONCURRENT_MOD),
            ExceptionKind::Deadlock => Some(well_known::DEADLOCK),
            ExceptionKind::Timeout => Some(well_known::TIMEOUT),
            ExceptionKind::User(_, class) => Some(*class),
            ExceptionKind::Fault(_) => None,
        }
    }

    pub fn catchable(&self) -> bool {
        !matches!(self, ExceptionKind::Fault(_))
    }
}

/// A program exception in flight: carried on at most one frame at a time,
/// unwind-searched against guard stacks.
#[derive(Clone, Debug)]
pub struct VmException {
    pub kind: ExceptionKind,
    pub message: String,
    /// Exception value handle, if the program constructed one.
    pub data: Option<ObjectHandle>,
    pub cause: Option<Box<VmException>>,
}

impl VmException {
    pub fn new(kind: ExceptionKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            data: None,
            cause: None,
        }
    }

    pub fn with_data(mut self, data: ObjectHandle) -> Self {
        self.data = Some(data);
        self
    }

    pub fn with_cause(mut self, cause: VmException) -> Self {
        self.cause = Some(Box::new(cause));
        self
    }

    pub fn timeout() -> Self {
        Self::new(ExceptionKind::Timeout, "deadline exceeded")
    }

    pub fn circular_init(identity: &str) -> Self {
        Self::new(
            ExceptionKind::Fault(FaultKind::CircularInitialization),
            format!("circular initialization of `{identity}`"),
        )
    }

    /// Wrap an engine fault for propagation through a future or frame.
    pub fn from_fault(err: &VmError) -> Self {
        Self::new(ExceptionKind::Fault(FaultKind::Internal), err.to_string())
    }
}

impl std::fmt::Display for VmException {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}: {}", self.kind, self.message)?;
        if let Some(cause) = &self.cause {
            write!(f, " (caused by {cause})")?;
        }
        Ok(())
    }
}
