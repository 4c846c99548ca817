use crate::errors::VmError;
use crate::interp::Op;
use crate::types::{well_known, Addr, ClassId, FieldId, MethodId, MethodRef, PropertyId};
use anyhow::Result;
use async_trait::async_trait;
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::Dfs;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

// ─── Constant pool ────────────────────────────────────────────

/// Typed constant pool entry. The loader validates every index an op
/// carries, so out-of-range or ill-typed references fail at load time.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum Constant {
    Bool(bool),
    Int(i64),
    Str(String),
    Class(ClassId),
    Method(MethodRef),
    Property(PropertyId),
}

// ─── Class directory ──────────────────────────────────────────

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FieldDef {
    pub id: FieldId,
    pub name: String,
    pub declared_type: ClassId,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PropertyDef {
    pub id: PropertyId,
    pub name: String,
    /// Backing field, when the property is field-backed.
    pub field: Option<FieldId>,
    pub getter: Option<MethodId>,
    pub setter: Option<MethodId>,
    pub read_only: bool,
    pub atomic: bool,
    /// Reference-typed property realized through a `Var` wrapper.
    pub ref_wrapped: bool,
    pub declared_type: ClassId,
}

/// Per-parameter metadata: declared type plus the dynamic-reference flag
/// (a dyn-ref slot receives a future instead of a value).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ParamInfo {
    pub declared_type: ClassId,
    pub dyn_ref: bool,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MethodDef {
    pub id: MethodId,
    pub name: String,
    pub params: Vec<ParamInfo>,
    pub returns: u8,
    /// Slot array size for frames of this method.
    pub max_vars: u16,
    /// Maximum guard nesting depth.
    pub max_scopes: u16,
    /// Native methods carry no ops; dispatch goes through the handler
    /// registered by the class template.
    pub native: bool,
    #[serde(default)]
    pub ops: Vec<Op>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ClassDef {
    pub id: ClassId,
    pub name: String,
    pub superclass: Option<ClassId>,
    pub type_params: u8,
    pub fields: Vec<FieldDef>,
    pub properties: Vec<PropertyDef>,
    pub methods: Vec<MethodDef>,
    /// Parameterless constructor run during the default chain.
    pub default_ctor: Option<MethodId>,
    pub primary_ctor: Option<MethodId>,
    /// Finalizer anchored during construction: by this class's slice of
    /// the default chain, or — for the leaf class — by the primary
    /// constructor even without a default constructor.
    pub finalizer: Option<MethodId>,
    pub auto_init: Option<MethodId>,
    pub singleton: bool,
    /// Published instances become immutable.
    pub publish_immutable: bool,
}

impl ClassDef {
    pub fn method(&self, id: MethodId) -> Option<&MethodDef> {
        self.methods.iter().find(|m| m.id == id)
    }
}

// ─── Singletons ───────────────────────────────────────────────

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum SingletonKind {
    Module,
    Package,
    StaticProperty,
    SingletonClass,
}

/// A lazily-initialized process-scope constant. Initialized in module
/// order; identity is content-addressed (see [`singleton_identity`]).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SingletonDef {
    pub name: String,
    pub kind: SingletonKind,
    pub class: ClassId,
    pub init: MethodRef,
}

// ─── Module ───────────────────────────────────────────────────

/// An immutable loaded module: constant pool + class directory. The
/// interpreter only ever reads these structures.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Module {
    pub name: String,
    pub constants: Vec<Constant>,
    pub classes: Vec<ClassDef>,
    #[serde(default)]
    pub singletons: Vec<SingletonDef>,
    /// Entry point invoked by the host when the module is run directly.
    pub entry: Option<MethodRef>,
}

impl Module {
    pub fn class(&self, id: ClassId) -> Option<&ClassDef> {
        self.classes.iter().find(|c| c.id == id)
    }
}

/// SHA-256 over the canonical serialization — the module's version key.
pub fn module_version(module: &Module) -> [u8; 32] {
    let bytes = serde_json::to_vec(module).unwrap_or_default();
    let mut hasher = Sha256::new();
    hasher.update(&bytes);
    hasher.finalize().into()
}

/// Content address of a singleton identity: class id + kind + name.
pub fn singleton_identity(def: &SingletonDef) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(def.class.to_le_bytes());
    hasher.update([def.kind as u8]);
    hasher.update(def.name.as_bytes());
    hasher.finalize().into()
}

// ─── Verification ─────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct VerifyError {
    pub message: String,
    pub method: Option<String>,
}

impl std::fmt::Display for VerifyError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if let Some(m) = &self.method {
            write!(f, "[{}] {}", m, self.message)
        } else {
            write!(f, "{}", self.message)
        }
    }
}

/// Parse and verify a serialized module. An unknown opcode fails the
/// parse (never reaches run time); structural problems are collected and
/// reported together.
pub fn load_module(bytes: &[u8]) -> Result<Module, VmError> {
    let module: Module = serde_json::from_slice(bytes)
        .map_err(|e| VmError::CorruptModule(e.to_string()))?;
    let errors = verify_module(&module);
    if !errors.is_empty() {
        let msgs: Vec<String> = errors.iter().map(|e| e.to_string()).collect();
        return Err(VmError::CorruptModule(msgs.join("; ")));
    }
    Ok(module)
}

/// Verify structural invariants of a module. Empty result means valid.
pub fn verify_module(module: &Module) -> Vec<VerifyError> {
    let mut errors = Vec::new();

    for class in &module.classes {
        if class.id < well_known::FIRST_USER && !is_intrinsic_module(module) {
            errors.push(VerifyError {
                message: format!("class `{}` uses reserved id {}", class.name, class.id),
                method: None,
            });
        }
        for method in &class.methods {
            if method.native {
                if !method.ops.is_empty() {
                    errors.push(VerifyError {
                        message: "native method carries ops".into(),
                        method: Some(format!("{}.{}", class.name, method.name)),
                    });
                }
                continue;
            }
            verify_method(module, class, method, &mut errors);
        }
    }

    errors
}

fn verify_method(
    module: &Module,
    class: &ClassDef,
    method: &MethodDef,
    errors: &mut Vec<VerifyError>,
) {
    let qualified = format!("{}.{}", class.name, method.name);
    let len = method.ops.len();
    let mut push = |message: String| {
        errors.push(VerifyError {
            message,
            method: Some(qualified.clone()),
        })
    };

    if len == 0 {
        push("empty op vector".into());
        return;
    }

    for (pc, op) in method.ops.iter().enumerate() {
        for target in op.branch_targets() {
            if target as usize >= len {
                push(format!("pc {pc}: branch target {target} out of bounds ({len} ops)"));
            }
        }
        for slot in op.slot_refs() {
            if slot >= method.max_vars {
                push(format!(
                    "pc {pc}: slot {slot} exceeds max_vars {}",
                    method.max_vars
                ));
            }
        }
        for cp in op.const_refs() {
            if cp as usize >= module.constants.len() {
                push(format!("pc {pc}: constant {cp} out of bounds"));
            }
        }
    }

    // Reachability: every op must be reachable from pc 0 through
    // fallthrough, branch, or guard-handler edges.
    let mut graph: DiGraph<Addr, ()> = DiGraph::new();
    let nodes: Vec<NodeIndex> = (0..len).map(|pc| graph.add_node(pc as Addr)).collect();
    for (pc, op) in method.ops.iter().enumerate() {
        if op.falls_through() && pc + 1 < len {
            graph.add_edge(nodes[pc], nodes[pc + 1], ());
        }
        for target in op.branch_targets() {
            if (target as usize) < len {
                graph.add_edge(nodes[pc], nodes[target as usize], ());
            }
        }
    }
    let mut reachable = vec![false; len];
    let mut dfs = Dfs::new(&graph, nodes[0]);
    while let Some(nx) = dfs.next(&graph) {
        reachable[graph[nx] as usize] = true;
    }
    for (pc, seen) in reachable.iter().enumerate() {
        if !seen {
            push(format!("pc {pc}: unreachable op"));
        }
    }
}

fn is_intrinsic_module(module: &Module) -> bool {
    module.name == INTRINSIC_MODULE_NAME
}

// ─── Intrinsics ───────────────────────────────────────────────

pub const INTRINSIC_MODULE_NAME: &str = "weft.intrinsics";

fn intrinsic_class(id: ClassId, name: &str, superclass: Option<ClassId>) -> ClassDef {
    ClassDef {
        id,
        name: name.to_string(),
        superclass,
        type_params: 0,
        fields: Vec::new(),
        properties: Vec::new(),
        methods: Vec::new(),
        default_ctor: None,
        primary_ctor: None,
        finalizer: None,
        auto_init: None,
        singleton: false,
        publish_immutable: true,
    }
}

/// The built-in module every container loads first. Defines the
/// well-known classes shared by all user modules.
pub fn intrinsic_module() -> Module {
    use well_known::*;

    let mut var = intrinsic_class(VAR, "Var", Some(OBJECT));
    var.publish_immutable = false;
    var.fields.push(FieldDef {
        id: crate::types::VAR_REFERENT_FIELD,
        name: "referent".into(),
        declared_type: OBJECT,
    });
    var.methods.push(MethodDef {
        id: VAR_GET,
        name: "get".into(),
        params: vec![],
        returns: 1,
        max_vars: 1,
        max_scopes: 0,
        native: true,
        ops: vec![],
    });
    var.methods.push(MethodDef {
        id: VAR_SET,
        name: "set".into(),
        params: vec![ParamInfo {
            declared_type: OBJECT,
            dyn_ref: false,
        }],
        returns: 0,
        max_vars: 2,
        max_scopes: 0,
        native: true,
        ops: vec![],
    });

    Module {
        name: INTRINSIC_MODULE_NAME.to_string(),
        constants: Vec::new(),
        classes: vec![
            intrinsic_class(OBJECT, "Object", None),
            intrinsic_class(EXCEPTION, "Exception", Some(OBJECT)),
            intrinsic_class(ASSERTION, "AssertionFailed", Some(EXCEPTION)),
            intrinsic_class(READ_ONLY, "ReadOnly", Some(EXCEPTION)),
            intrinsic_class(UNSUPPORTED, "Unsupported", Some(EXCEPTION)),
            intrinsic_class(BOUNDS, "Bounds", Some(EXCEPTION)),
            intrinsic_class(CONCURRENT_MOD, "ConcurrentModification", Some(EXCEPTION)),
            intrinsic_class(DEADLOCK, "Deadlock", Some(EXCEPTION)),
            intrinsic_class(TIMEOUT, "Timeout", Some(EXCEPTION)),
            intrinsic_class(BOOLEAN, "Boolean", Some(OBJECT)),
            intrinsic_class(INT64, "Int64", Some(OBJECT)),
            intrinsic_class(STRING, "String", Some(OBJECT)),
            intrinsic_class(FUNCTION, "Function", Some(OBJECT)),
            intrinsic_class(TUPLE, "Tuple", Some(OBJECT)),
            intrinsic_class(SERVICE, "Service", Some(OBJECT)),
            var,
        ],
        singletons: Vec::new(),
        entry: None,
    }
}

// ─── Module store ─────────────────────────────────────────────

/// Repository of loaded modules, keyed by content version. The container
/// operates exclusively through this trait so hosts can plug their own
/// resolution (filesystem, embedded, remote).
#[async_trait]
pub trait ModuleStore: Send + Sync {
    async fn store_module(&self, version: [u8; 32], module: Module) -> Result<()>;
    async fn load_module(&self, version: [u8; 32]) -> Result<Option<Arc<Module>>>;
    async fn resolve(&self, name: &str) -> Result<Option<Arc<Module>>>;
}

struct StoreInner {
    by_version: HashMap<[u8; 32], Arc<Module>>,
    by_name: HashMap<String, [u8; 32]>,
}

/// In-memory `ModuleStore` used by the CLI and tests.
pub struct MemoryModuleStore {
    inner: RwLock<StoreInner>,
}

impl MemoryModuleStore {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(StoreInner {
                by_version: HashMap::new(),
                by_name: HashMap::new(),
            }),
        }
    }
}

impl Default for MemoryModuleStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ModuleStore for MemoryModuleStore {
    async fn store_module(&self, version: [u8; 32], module: Module) -> Result<()> {
        let mut w = self.inner.write().await;
        w.by_name.insert(module.name.clone(), version);
        w.by_version.insert(version, Arc::new(module));
        Ok(())
    }

    async fn load_module(&self, version: [u8; 32]) -> Result<Option<Arc<Module>>> {
        let r = self.inner.read().await;
        Ok(r.by_version.get(&version).cloned())
    }

    async fn resolve(&self, name: &str) -> Result<Option<Arc<Module>>> {
        let r = self.inner.read().await;
        Ok(r.by_name
            .get(name)
            .and_then(|v| r.by_version.get(v))
            .cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::well_known;

    fn one_method_module(ops: Vec<Op>) -> Module {
        Module {
            name: "test".into(),
            constants: vec![Constant::Int(7)],
            classes: vec![ClassDef {
                id: well_known::FIRST_USER,
                name: "Main".into(),
                superclass: Some(well_known::OBJECT),
                type_params: 0,
                fields: vec![],
                properties: vec![],
                methods: vec![MethodDef {
                    id: 0,
                    name: "run".into(),
                    params: vec![],
                    returns: 0,
                    max_vars: 4,
                    max_scopes: 1,
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
            entry: Some(MethodRef {
                class: well_known::FIRST_USER,
                method: 0,
            }),
        }
    }

    #[test]
    fn verify_accepts_straight_line() {
        let m = one_method_module(vec![
            Op::LoadConst { cp: 0, dst: 0 },
            Op::Return1 { src: 0 },
        ]);
        assert!(verify_module(&m).is_empty());
    }

    #[test]
    fn verify_rejects_out_of_bounds_branch() {
        let m = one_method_module(vec![Op::Jump { target: 9 }, Op::Return0]);
        let errors = verify_module(&m);
        assert!(errors.iter().any(|e| e.message.contains("out of bounds")));
    }

    #[test]
    fn verify_rejects_unreachable_op() {
        let m = one_method_module(vec![
            Op::Return0,
            Op::LoadConst { cp: 0, dst: 0 },
        ]);
        let errors = verify_module(&m);
        assert!(errors.iter().any(|e| e.message.contains("unreachable")));
    }

    #[test]
    fn verify_rejects_bad_slot_and_constant() {
        let m = one_method_module(vec![
            Op::LoadConst { cp: 44, dst: 99 },
            Op::Return0,
        ]);
        let errors = verify_module(&m);
        assert!(errors.iter().any(|e| e.message.contains("slot 99")));
        assert!(errors.iter().any(|e| e.message.contains("constant 44")));
    }

    #[test]
    fn unknown_opcode_fails_at_load_time() {
        let m = one_method_module(vec![Op::Return0]);
        let mut json = serde_json::to_value(&m).unwrap();
        json["classes"][0]["methods"][0]["ops"][0] =
            serde_json::json!({ "Quux": { "x": 1 } });
        let bytes = serde_json::to_vec(&json).unwrap();
        let err = load_module(&bytes).unwrap_err();
        assert!(matches!(err, VmError::CorruptModule(_)));
    }

    #[test]
    fn module_version_is_stable_and_content_sensitive() {
        let a = one_method_module(vec![Op::Return0]);
        let b = one_method_module(vec![Op::Return0]);
        assert_eq!(module_version(&a), module_version(&b));
        let c = one_method_module(vec![Op::Nop, Op::Return0]);
        assert_ne!(module_version(&a), module_version(&c));
    }

    #[tokio::test]
    async fn memory_store_roundtrip() {
        let store = MemoryModuleStore::new();
        let m = one_method_module(vec![Op::Return0]);
        let version = module_version(&m);
        store.store_module(version, m).await.unwrap();
        let loaded = store.load_module(version).await.unwrap().unwrap();
        assert_eq!(loaded.name, "test");
        let resolved = store.resolve("test").await.unwrap().unwrap();
        assert_eq!(module_version(&resolved), version);
    }

    #[test]
    fn intrinsics_pass_verification() {
        assert!(verify_module(&intrinsic_module()).is_empty());
    }
}
