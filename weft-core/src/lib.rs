//! Weft — the runtime core of a managed virtual machine.
//!
//! Executes a compiled, typed bytecode with cooperative lightweight
//! fibers, isolated message-passing services, a frame-based interpreter
//! with an op-outcome protocol, deferred-argument plumbing, a
//! construction pipeline, and a property/method dispatch surface with
//! native fast paths.
//!
//! Embedders start at [`container::Container`]: create a container,
//! load modules, create services, submit calls.

pub mod composition;
pub mod construct;
pub mod container;
pub mod deferred;
pub mod dispatch;
pub mod errors;
pub mod events;
pub mod fiber;
pub mod frame;
pub mod handle;
pub mod interp;
pub mod module;
pub mod oracle;
pub mod service;
pub mod types;

pub use container::{AssertSeverity, CallResult, Container, RuntimeConfig};
pub use errors::{ExceptionKind, VmError, VmException};
pub use handle::{Callable, ObjectHandle};
pub use module::{load_module, module_version, Module};
pub use service::ReentrancyMode;
