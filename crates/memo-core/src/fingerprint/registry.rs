//! Callable registry: the engine's symbol table.
//!
//! The registry stores compiled callables keyed by fully-qualified name
//! and carries the opt-in hashable marker that pulls a symbol into its
//! callers' fingerprints. Ordering is stable (BTreeMap) and there is no
//! global mutable state; stages hold a shared handle to the registry they
//! were built against.

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::errors::{MemoError, MemoResult};

use super::CodeObject;

/// One registered callable.
#[derive(Debug, Clone)]
pub struct RegisteredCallable {
    pub code: Arc<CodeObject>,
    /// The opt-in marker: when set, callers that reference this symbol
    /// fold its fingerprint into their own.
    pub hashable: bool,
    /// Wrapper link for decorator chains; resolution peels these until a
    /// primitive callable is reached.
    pub wraps: Option<String>,
}

/// Accessor bundle for one declared property of a type.
#[derive(Debug, Clone, Default)]
pub struct PropertyObject {
    pub name: String,
    pub getter: Option<CodeObject>,
    pub setter: Option<CodeObject>,
    pub deleter: Option<CodeObject>,
}

/// A type declaration: methods plus properties. Registering a type with
/// the hashable marker tags every method and every accessor of every
/// property declared on it.
#[derive(Debug, Clone, Default)]
pub struct TypeObject {
    pub name: String,
    pub methods: Vec<CodeObject>,
    pub properties: Vec<PropertyObject>,
}

#[derive(Debug, Default)]
pub struct CallableRegistry {
    entries: BTreeMap<String, RegisteredCallable>,
}

impl CallableRegistry {
    pub fn new() -> Self {
        Self {
            entries: BTreeMap::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Register a callable without the hashable marker.
    pub fn register(&mut self, code: CodeObject) -> MemoResult<()> {
        self.insert(code, false, None)
    }

    /// Register a callable with the hashable marker set.
    pub fn register_hashable(&mut self, code: CodeObject) -> MemoResult<()> {
        self.insert(code, true, None)
    }

    /// Register a wrapper around an already-registered callable. The
    /// wrapper's own code never enters a fingerprint; resolution peels it.
    pub fn register_wrapper(&mut self, code: CodeObject, wraps: impl Into<String>) -> MemoResult<()> {
        let target = wraps.into();
        if !self.entries.contains_key(&target) {
            return Err(MemoError::validation(format!(
                "wrapper target not registered: {target}"
            )));
        }
        self.insert(code, false, Some(target))
    }

    fn insert(
        &mut self,
        code: CodeObject,
        hashable: bool,
        wraps: Option<String>,
    ) -> MemoResult<()> {
        let name = code.name.clone();
        if self.entries.contains_key(&name) {
            return Err(MemoError::validation(format!(
                "callable already registered: {name}"
            )));
        }
        self.entries.insert(
            name,
            RegisteredCallable {
                code: Arc::new(code),
                hashable,
                wraps,
            },
        );
        Ok(())
    }

    /// Set the hashable marker on a callable. The effect is transitive:
    /// marking a wrapper marks the whole chain down to the primitive.
    pub fn mark_hashable(&mut self, name: &str) -> MemoResult<()> {
        let mut current = name.to_string();
        let mut seen = Vec::new();
        loop {
            if seen.contains(&current) {
                return Err(MemoError::validation(format!(
                    "wrapper cycle through `{current}`"
                )));
            }
            seen.push(current.clone());
            let entry = self.entries.get_mut(&current).ok_or_else(|| {
                MemoError::validation(format!("callable not registered: {current}"))
            })?;
            entry.hashable = true;
            match &entry.wraps {
                Some(next) => current = next.clone(),
                None => return Ok(()),
            }
        }
    }

    /// Register a type declaration. Members land under dotted names
    /// (`Type.method`, `Type.prop`, `Type.prop.set`, `Type.prop.del`) and
    /// the hashable flag applies to every one of them.
    pub fn register_type(&mut self, ty: TypeObject, hashable: bool) -> MemoResult<()> {
        for method in ty.methods {
            let mut code = method;
            code.name = format!("{}.{}", ty.name, code.name);
            self.insert(code, hashable, None)?;
        }
        for prop in ty.properties {
            let accessors = [
                (prop.getter, format!("{}.{}", ty.name, prop.name)),
                (prop.setter, format!("{}.{}.set", ty.name, prop.name)),
                (prop.deleter, format!("{}.{}.del", ty.name, prop.name)),
            ];
            for (code, name) in accessors {
                if let Some(mut code) = code {
                    code.name = name;
                    self.insert(code, hashable, None)?;
                }
            }
        }
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&RegisteredCallable> {
        self.entries.get(name)
    }

    /// Resolve a symbol to its primitive registration, peeling wrapper
    /// links. Returns `None` for unregistered symbols (built-ins).
    pub fn resolve(&self, name: &str) -> Option<&RegisteredCallable> {
        let mut current = self.entries.get(name)?;
        let mut hops = 0usize;
        while let Some(next) = &current.wraps {
            current = self.entries.get(next)?;
            hops += 1;
            if hops > self.entries.len() {
                return None;
            }
        }
        Some(current)
    }

    /// The primitive code object behind `name`, when registered.
    pub fn primitive_code(&self, name: &str) -> Option<&CodeObject> {
        self.resolve(name).map(|entry| entry.code.as_ref())
    }

    /// Registered names in deterministic order.
    pub fn names(&self) -> Vec<String> {
        self.entries.keys().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fingerprint::compile;

    #[test]
    fn duplicate_registration_is_rejected() {
        let mut reg = CallableRegistry::new();
        reg.register(compile("fn f() { return 1; }").unwrap()).unwrap();
        assert!(reg.register(compile("fn f() { return 2; }").unwrap()).is_err());
    }

    #[test]
    fn marking_a_wrapper_marks_the_primitive() {
        let mut reg = CallableRegistry::new();
        reg.register(compile("fn inner(x) { return x; }").unwrap())
            .unwrap();
        reg.register_wrapper(compile("fn outer(x) { return inner(x); }").unwrap(), "inner")
            .unwrap();

        reg.mark_hashable("outer").unwrap();
        assert!(reg.get("inner").unwrap().hashable);
        assert!(reg.resolve("outer").unwrap().hashable);
        assert_eq!(reg.primitive_code("outer").unwrap().name, "inner");
    }

    #[test]
    fn type_registration_tags_methods_and_accessors() {
        let mut reg = CallableRegistry::new();
        let ty = TypeObject {
            name: "Volume".to_string(),
            methods: vec![compile("fn resample(self, res) { return interp(self, res); }").unwrap()],
            properties: vec![PropertyObject {
                name: "shape".to_string(),
                getter: Some(compile("fn shape(self) { return dims(self); }").unwrap()),
                setter: None,
                deleter: None,
            }],
        };
        reg.register_type(ty, true).unwrap();
        assert!(reg.get("Volume.resample").unwrap().hashable);
        assert!(reg.get("Volume.shape").unwrap().hashable);
    }

    #[test]
    fn unregistered_symbols_resolve_to_none() {
        let reg = CallableRegistry::new();
        assert!(reg.resolve("os.listdir").is_none());
    }
}
