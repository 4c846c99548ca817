use crate::errors::VmError;
use crate::handle::{lock, ObjectHandle};
use crate::module::{intrinsic_module, ClassDef, Constant, MethodDef, Module};
use crate::oracle::TypeOracle;
use crate::types::{
    ClassId, CompositionIndex, ConstId, FieldId, MethodId, MethodRef, PropertyId, TypeArg,
};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};

// ─── Resolution records ───────────────────────────────────────

/// Method resolution chain for one method id: defining classes leaf
/// first. The top entry decides native vs. interpreted dispatch.
#[derive(Clone, Debug)]
pub struct MethodChain {
    pub entries: Vec<MethodRef>,
}

impl MethodChain {
    pub fn top(&self) -> MethodRef {
        self.entries[0]
    }
}

/// Property descriptor resolved against a composition.
#[derive(Clone, Debug)]
pub struct PropertyInfo {
    pub id: PropertyId,
    pub field: Option<FieldId>,
    pub getter: Option<MethodRef>,
    pub setter: Option<MethodRef>,
    pub read_only: bool,
    pub atomic: bool,
    pub ref_wrapped: bool,
    pub declared_type: ClassId,
}

/// One link of the construction chain, root first. A link's finalizer is
/// anchored once its default constructor has run; the leaf link's
/// finalizer also belongs to the primary constructor, which anchors it
/// when no leaf default constructor exists.
#[derive(Clone, Debug)]
pub struct CtorLink {
    pub class: ClassId,
    pub default_ctor: Option<MethodRef>,
    pub finalizer: Option<MethodRef>,
}

// ─── Composition ──────────────────────────────────────────────

/// Runtime record for one class + actual type arguments. Owns the
/// dispatch tables and cached subtype answers.
pub struct Composition {
    pub index: CompositionIndex,
    pub class: ClassId,
    pub type_args: Vec<TypeArg>,
    pub methods: HashMap<MethodId, MethodChain>,
    pub properties: HashMap<PropertyId, PropertyInfo>,
    /// Root-first construction chain (default ctors + finalizers).
    pub ctor_chain: Vec<CtorLink>,
    pub primary_ctor: Option<MethodRef>,
    pub auto_init: Option<MethodRef>,
    pub singleton: bool,
    pub publish_immutable: bool,
    /// Declared fields in order, root class first.
    pub fields: Vec<(FieldId, ClassId)>,
    subtype_cache: Mutex<HashMap<ClassId, bool>>,
}

impl Composition {
    pub fn method_chain(&self, id: MethodId) -> Option<&MethodChain> {
        self.methods.get(&id)
    }

    pub fn property(&self, id: PropertyId) -> Option<&PropertyInfo> {
        self.properties.get(&id)
    }

    /// Cached subtype query against the oracle.
    pub fn is_subtype_of(&self, sup: ClassId, oracle: &dyn TypeOracle) -> bool {
        if let Some(hit) = lock(&self.subtype_cache).get(&sup) {
            return *hit;
        }
        let answer = oracle.is_subclass(self.class, sup);
        lock(&self.subtype_cache).insert(sup, answer);
        answer
    }
}

impl std::fmt::Debug for Composition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Composition")
            .field("index", &self.index)
            .field("class", &self.class)
            .field("type_args", &self.type_args)
            .finish()
    }
}

// ─── Registry ─────────────────────────────────────────────────

struct Inner {
    classes: HashMap<ClassId, Arc<ClassDef>>,
    methods: HashMap<MethodRef, Arc<MethodDef>>,
    class_module: HashMap<ClassId, [u8; 32]>,
    pools: HashMap<[u8; 32], Arc<Vec<Constant>>>,
    arena: Vec<Arc<Composition>>,
    interned: HashMap<(ClassId, Vec<TypeArg>), CompositionIndex>,
}

/// Process-wide composition arena. Interned by (class, actual type
/// args); handles carry the stable index. Writes happen at module load
/// and first-use interning; reads dominate afterwards.
pub struct CompositionRegistry {
    inner: RwLock<Inner>,
    /// Process-wide constant-handle cache.
    const_cache: Mutex<HashMap<([u8; 32], ConstId), ObjectHandle>>,
}

impl CompositionRegistry {
    /// A fresh registry with the intrinsic module loaded. Intrinsic
    /// compositions are interned first, in class-id order, so their
    /// composition index equals their well-known class id.
    pub fn new() -> Self {
        let registry = Self {
            inner: RwLock::new(Inner {
                classes: HashMap::new(),
                methods: HashMap::new(),
                class_module: HashMap::new(),
                pools: HashMap::new(),
                arena: Vec::new(),
                interned: HashMap::new(),
            }),
            const_cache: Mutex::new(HashMap::new()),
        };
        let intrinsics = intrinsic_module();
        registry
            .load_module(&intrinsics)
            .expect("intrinsic module is well-formed");
        for class in &intrinsics.classes {
            registry
                .ensure(class.id, Vec::new())
                .expect("intrinsic composition");
        }
        registry
    }

    /// Register a verified module's class directory and constant pool.
    pub fn load_module(&self, module: &Module) -> Result<[u8; 32], VmError> {
        let version = crate::module::module_version(module);
        let mut w = self.inner.write().unwrap_or_else(|e| e.into_inner());
        for class in &module.classes {
            if w.classes.contains_key(&class.id) && module.name != crate::module::INTRINSIC_MODULE_NAME
            {
                return Err(VmError::CorruptModule(format!(
                    "duplicate class id {} (`{}`)",
                    class.id, class.name
                )));
            }
            let class = Arc::new(class.clone());
            for method in &class.methods {
                w.methods.insert(
                    MethodRef {
                        class: class.id,
                        method: method.id,
                    },
                    Arc::new(method.clone()),
                );
            }
            w.class_module.insert(class.id, version);
            w.classes.insert(class.id, class);
        }
        w.pools.insert(version, Arc::new(module.constants.clone()));
        Ok(version)
    }

    pub fn class_def(&self, id: ClassId) -> Result<Arc<ClassDef>, VmError> {
        let r = self.inner.read().unwrap_or_else(|e| e.into_inner());
        r.classes.get(&id).cloned().ok_or(VmError::UnknownClass(id))
    }

    pub fn method_def(&self, mref: MethodRef) -> Result<Arc<MethodDef>, VmError> {
        let r = self.inner.read().unwrap_or_else(|e| e.into_inner());
        r.methods
            .get(&mref)
            .cloned()
            .ok_or(VmError::UnknownMethod {
                class: mref.class,
                method: mref.method,
            })
    }

    pub fn get(&self, index: CompositionIndex) -> Option<Arc<Composition>> {
        let r = self.inner.read().unwrap_or_else(|e| e.into_inner());
        r.arena.get(index as usize).cloned()
    }

    /// Intern (class, type args), building the resolution caches on
    /// first use.
    pub fn ensure(
        &self,
        class: ClassId,
        type_args: Vec<TypeArg>,
    ) -> Result<CompositionIndex, VmError> {
        {
            let r = self.inner.read().unwrap_or_else(|e| e.into_inner());
            if let Some(&idx) = r.interned.get(&(class, type_args.clone())) {
                return Ok(idx);
            }
        }

        // Build outside the write lock, insert under it (losers of the
        // race re-use the winner's entry).
        let built = self.build(class, &type_args)?;
        let mut w = self.inner.write().unwrap_or_else(|e| e.into_inner());
        if let Some(&idx) = w.interned.get(&(class, type_args.clone())) {
            return Ok(idx);
        }
        let index = w.arena.len() as CompositionIndex;
        let comp = Arc::new(Composition { index, ..built });
        w.arena.push(comp);
        w.interned.insert((class, type_args), index);
        Ok(index)
    }

    fn build(&self, class: ClassId, type_args: &[TypeArg]) -> Result<Composition, VmError> {
        let r = self.inner.read().unwrap_or_else(|e| e.into_inner());

        // Superclass chain, leaf first.
        let mut chain: Vec<Arc<ClassDef>> = Vec::new();
        let mut cursor = Some(class);
        while let Some(id) = cursor {
            let def = r.classes.get(&id).cloned().ok_or(VmError::UnknownClass(id))?;
            cursor = def.superclass;
            chain.push(def);
        }

        let mut methods: HashMap<MethodId, MethodChain> = HashMap::new();
        let mut properties: HashMap<PropertyId, PropertyInfo> = HashMap::new();
        let mut fields: Vec<(FieldId, ClassId)> = Vec::new();
        let mut ctor_chain: Vec<CtorLink> = Vec::new();

        // Root-first for fields and the construction chain.
        for def in chain.iter().rev() {
            for field in &def.fields {
                fields.push((field.id, field.declared_type));
            }
            ctor_chain.push(CtorLink {
                class: def.id,
                default_ctor: def.default_ctor.map(|m| MethodRef {
                    class: def.id,
                    method: m,
                }),
                finalizer: def.finalizer.map(|m| MethodRef {
                    class: def.id,
                    method: m,
                }),
            });
        }

        // Leaf-first for dispatch: the leaf-most definition heads the
        // chain; a superclass definition extends it.
        for def in chain.iter() {
            for method in &def.methods {
                let mref = MethodRef {
                    class: def.id,
                    method: method.id,
                };
                methods
                    .entry(method.id)
                    .and_modify(|c| c.entries.push(mref))
                    .or_insert_with(|| MethodChain { entries: vec![mref] });
            }
            for prop in &def.properties {
                properties.entry(prop.id).or_insert_with(|| PropertyInfo {
                    id: prop.id,
                    field: prop.field,
                    getter: prop.getter.map(|m| MethodRef {
                        class: def.id,
                        method: m,
                    }),
                    setter: prop.setter.map(|m| MethodRef {
                        class: def.id,
                        method: m,
                    }),
                    read_only: prop.read_only,
                    atomic: prop.atomic,
                    ref_wrapped: prop.ref_wrapped,
                    declared_type: prop.declared_type,
                });
            }
        }

        let leaf = &chain[0];
        Ok(Composition {
            index: 0, // patched by ensure()
            class,
            type_args: type_args.to_vec(),
            methods,
            properties,
            ctor_chain,
            primary_ctor: leaf.primary_ctor.map(|m| MethodRef {
                class: leaf.id,
                method: m,
            }),
            auto_init: leaf.auto_init.map(|m| MethodRef {
                class: leaf.id,
                method: m,
            }),
            singleton: leaf.singleton,
            publish_immutable: leaf.publish_immutable,
            fields,
            subtype_cache: Mutex::new(HashMap::new()),
        })
    }

    /// Materialize a constant-pool entry, using the process-wide handle
    /// cache. `class` locates the defining module's pool.
    pub fn constant(&self, class: ClassId, cp: ConstId) -> Result<ObjectHandle, VmError> {
        let version = {
            let r = self.inner.read().unwrap_or_else(|e| e.into_inner());
            *r.class_module
                .get(&class)
                .ok_or(VmError::UnknownClass(class))?
        };
        if let Some(hit) = lock(&self.const_cache).get(&(version, cp)) {
            return Ok(hit.clone());
        }
        let pool = {
            let r = self.inner.read().unwrap_or_else(|e| e.into_inner());
            r.pools
                .get(&version)
                .cloned()
                .ok_or(VmError::VersionMismatch)?
        };
        let entry = pool.get(cp as usize).ok_or(VmError::CorruptConstant {
            index: cp,
            expected: "valid index",
        })?;
        let handle = match entry {
            Constant::Bool(b) => ObjectHandle::of_bool(*b),
            Constant::Int(n) => ObjectHandle::of_int(*n),
            Constant::Str(s) => ObjectHandle::of_str(s),
            Constant::Method(mref) => {
                ObjectHandle::of_callable(crate::handle::Callable::unbound(*mref))
            }
            Constant::Class(_) | Constant::Property(_) => {
                return Err(VmError::CorruptConstant {
                    index: cp,
                    expected: "loadable constant",
                })
            }
        };
        lock(&self.const_cache).insert((version, cp), handle.clone());
        Ok(handle)
    }
}

impl Default for CompositionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::module::{FieldDef, PropertyDef};
    use crate::oracle::ClassTableOracle;
    use crate::types::well_known;

    fn two_class_module() -> Module {
        let base_id = well_known::FIRST_USER;
        let leaf_id = well_known::FIRST_USER + 1;
        Module {
            name: "pets".into(),
            constants: vec![Constant::Str("meow".into())],
            classes: vec![
                ClassDef {
                    id: base_id,
                    name: "Animal".into(),
                    superclass: Some(well_known::OBJECT),
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
                    methods: vec![MethodDef {
                        id: 7,
                        name: "speak".into(),
                        params: vec![],
                        returns: 1,
                        max_vars: 1,
                        max_scopes: 0,
                        native: true,
                        ops: vec![],
                    }],
                    default_ctor: None,
                    primary_ctor: None,
                    finalizer: None,
                    auto_init: None,
                    singleton: false,
                    publish_immutable: false,
                },
                ClassDef {
                    id: leaf_id,
                    name: "Cat".into(),
                    superclass: Some(base_id),
                    type_params: 0,
                    fields: vec![FieldDef {
                        id: 1,
                        name: "lives".into(),
                        declared_type: well_known::INT64,
                    }],
                    properties: vec![],
                    methods: vec![MethodDef {
                        id: 7,
                        name: "speak".into(),
                        params: vec![],
                        returns: 1,
                        max_vars: 1,
                        max_scopes: 0,
                        native: true,
                        ops: vec![],
                    }],
                    default_ctor: None,
                    primary_ctor: None,
                    finalizer: None,
                    auto_init: None,
                    singleton: false,
                    publish_immutable: false,
                },
            ],
            singletons: vec![],
            entry: None,
        }
    }

    #[test]
    fn interning_is_stable_per_identity() {
        let registry = CompositionRegistry::new();
        registry.load_module(&two_class_module()).unwrap();
        let leaf = well_known::FIRST_USER + 1;
        let a = registry.ensure(leaf, vec![]).unwrap();
        let b = registry.ensure(leaf, vec![]).unwrap();
        assert_eq!(a, b);
        let c = registry
            .ensure(leaf, vec![TypeArg::Class(well_known::INT64)])
            .unwrap();
        assert_ne!(a, c);
    }

    #[test]
    fn intrinsic_index_equals_class_id() {
        let registry = CompositionRegistry::new();
        let idx = registry.ensure(well_known::BOOLEAN, vec![]).unwrap();
        assert_eq!(idx, well_known::BOOLEAN);
    }

    #[test]
    fn method_chain_is_leaf_first_and_fields_root_first() {
        let registry = CompositionRegistry::new();
        registry.load_module(&two_class_module()).unwrap();
        let leaf = well_known::FIRST_USER + 1;
        let idx = registry.ensure(leaf, vec![]).unwrap();
        let comp = registry.get(idx).unwrap();

        let chain = comp.method_chain(7).unwrap();
        assert_eq!(chain.top().class, leaf);
        assert_eq!(chain.entries.len(), 2);

        let field_order: Vec<FieldId> = comp.fields.iter().map(|(id, _)| *id).collect();
        assert_eq!(field_order, vec![0, 1]);

        // Property inherited from the superclass resolves.
        assert!(comp.property(0).is_some());
    }

    #[test]
    fn subtype_answers_are_cached() {
        let registry = CompositionRegistry::new();
        registry.load_module(&two_class_module()).unwrap();
        let oracle = ClassTableOracle::from_module(&intrinsic_module());
        oracle.absorb(&two_class_module());
        let leaf = well_known::FIRST_USER + 1;
        let comp = registry
            .get(registry.ensure(leaf, vec![]).unwrap())
            .unwrap();
        assert!(comp.is_subtype_of(well_known::FIRST_USER, &oracle));
        assert!(comp.is_subtype_of(well_known::FIRST_USER, &oracle));
        assert!(!comp.is_subtype_of(well_known::EXCEPTION, &oracle));
    }

    #[test]
    fn constants_are_cached_process_wide() {
        let registry = CompositionRegistry::new();
        registry.load_module(&two_class_module()).unwrap();
        let a = registry.constant(well_known::FIRST_USER, 0).unwrap();
        let b = registry.constant(well_known::FIRST_USER, 0).unwrap();
        assert!(a.ptr_eq(&b));
    }
}
