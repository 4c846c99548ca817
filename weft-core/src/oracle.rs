use crate::module::Module;
use crate::types::{well_known, ClassId};
use std::collections::HashMap;
use std::sync::RwLock;

/// Interface to the type system's subtype/compatibility analyzer. The
/// analyzer itself lives outside the execution engine; the interpreter
/// treats it as an oracle for guard matching, equality and conversion.
pub trait TypeOracle: Send + Sync {
    /// Is `sub` the same class as, or a subclass of, `sup`?
    fn is_subclass(&self, sub: ClassId, sup: ClassId) -> bool;
}

/// Table-driven oracle backed by the loaded class directories. Writes
/// happen at module-load time; reads are lock-cheap afterwards.
pub struct ClassTableOracle {
    supers: RwLock<HashMap<ClassId, Option<ClassId>>>,
}

impl ClassTableOracle {
    pub fn new() -> Self {
        Self {
            supers: RwLock::new(HashMap::new()),
        }
    }

    pub fn from_module(module: &Module) -> Self {
        let oracle = Self::new();
        oracle.absorb(module);
        oracle
    }

    /// Record the superclass chain of every class in a module.
    pub fn absorb(&self, module: &Module) {
        let mut w = self.supers.write().unwrap_or_else(|e| e.into_inner());
        for class in &module.classes {
            w.insert(class.id, class.superclass);
        }
    }
}

impl Default for ClassTableOracle {
    fn default() -> Self {
        Self::new()
    }
}

impl TypeOracle for ClassTableOracle {
    fn is_subclass(&self, sub: ClassId, sup: ClassId) -> bool {
        if sup == well_known::OBJECT || sub == sup {
            return true;
        }
        let r = self.supers.read().unwrap_or_else(|e| e.into_inner());
        let mut cursor = sub;
        loop {
            match r.get(&cursor).copied().flatten() {
                Some(parent) if parent == sup => return true,
                Some(parent) => cursor = parent,
                None => return false,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::module::intrinsic_module;

    #[test]
    fn intrinsic_exception_hierarchy() {
        let oracle = ClassTableOracle::from_module(&intrinsic_module());
        assert!(oracle.is_subclass(well_known::BOUNDS, well_known::EXCEPTION));
        assert!(oracle.is_subclass(well_known::TIMEOUT, well_known::OBJECT));
        assert!(!oracle.is_subclass(well_known::EXCEPTION, well_known::BOUNDS));
        assert!(!oracle.is_subclass(well_known::INT64, well_known::EXCEPTION));
    }
}
