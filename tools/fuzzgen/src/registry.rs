//! Per-type construction capabilities.
//!
//! The engine never knows how a composite type is built. It only sees a
//! [`TypeCapabilities`] table of invokers, looked up by type name, and picks
//! entries from it with logged index decisions.

use crate::engine::{Builder, Value, ValueType};
use crate::errors::FuzzError;
use std::any::Any;
use std::collections::HashMap;
use std::sync::Arc;

pub type Object = Box<dyn Any + Send>;

pub type ConstructorFn = Arc<dyn Fn(&mut Builder<'_>) -> Result<Object, FuzzError> + Send + Sync>;
pub type MethodFn =
    Arc<dyn Fn(&mut Builder<'_>, &mut (dyn Any + Send + 'static)) -> Result<(), FuzzError> + Send + Sync>;
pub type SubclassFn = Arc<dyn Fn(&mut Builder<'_>) -> Result<Value, FuzzError> + Send + Sync>;

#[derive(Clone, Default)]
pub struct TypeCapabilities {
    pub constructors: Vec<ConstructorFn>,
    pub methods: Vec<MethodFn>,
    pub subclasses: Vec<SubclassFn>,
}

impl TypeCapabilities {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn constructor<T, F>(mut self, f: F) -> Self
    where
        T: Any + Send,
        F: Fn(&mut Builder<'_>) -> Result<T, FuzzError> + Send + Sync + 'static,
    {
        self.constructors.push(Arc::new(
            move |b: &mut Builder<'_>| -> Result<Object, FuzzError> { Ok(Box::new(f(b)?) as Object) },
        ));
        self
    }

    /// Registers a mutating method on objects of type `T`.
    pub fn method<T, F>(mut self, f: F) -> Self
    where
        T: Any + Send,
        F: Fn(&mut Builder<'_>, &mut T) -> Result<(), FuzzError> + Send + Sync + 'static,
    {
        self.methods.push(Arc::new(
            move |b: &mut Builder<'_>, object: &mut (dyn Any + Send + 'static)| -> Result<(), FuzzError> {
                let target = object.downcast_mut::<T>().ok_or_else(|| {
                    FuzzError::UnknownType(format!(
                        "method receiver is not {}",
                        std::any::type_name::<T>()
                    ))
                })?;
                f(b, target)
            },
        ));
        self
    }

    /// Registers `name` as a concrete subclass, built through its own table.
    pub fn subclass(mut self, name: impl Into<String>) -> Self {
        let ty = ValueType::Composite(name.into());
        self.subclasses.push(Arc::new(move |b: &mut Builder<'_>| {
            let id = b.decision_id();
            b.make(&ty, id, true)
        }));
        self
    }

    pub fn subclass_factory<F>(mut self, f: F) -> Self
    where
        F: Fn(&mut Builder<'_>) -> Result<Value, FuzzError> + Send + Sync + 'static,
    {
        self.subclasses.push(Arc::new(f));
        self
    }

    pub fn constructor_count(&self) -> usize {
        self.constructors.len()
    }

    pub fn method_count(&self) -> usize {
        self.methods.len()
    }

    pub fn subclass_count(&self) -> usize {
        self.subclasses.len()
    }
}

#[derive(Clone, Default)]
pub struct CapabilityRegistry {
    types: HashMap<String, Arc<TypeCapabilities>>,
}

impl CapabilityRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry preloaded with the [`builtin`] tables.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        builtin::register(&mut registry);
        registry
    }

    pub fn register(&mut self, name: impl Into<String>, caps: TypeCapabilities) -> &mut Self {
        self.types.insert(name.into(), Arc::new(caps));
        self
    }

    pub fn get(&self, name: &str) -> Result<Arc<TypeCapabilities>, FuzzError> {
        self.types
            .get(name)
            .cloned()
            .ok_or_else(|| FuzzError::UnknownType(name.to_string()))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.types.contains_key(name)
    }

    pub fn type_names(&self) -> Vec<String> {
        let mut names = self.types.keys().cloned().collect::<Vec<_>>();
        names.sort();
        names
    }
}

/// Tables for standard collections.
pub mod builtin {
    use super::{CapabilityRegistry, TypeCapabilities};
    use crate::engine::{Builder, ValueType};
    use crate::errors::FuzzError;

    pub const INT_SEQUENCE: &str = "seq<i64>";
    pub const BYTE_STRING: &str = "bytes";
    pub const TEXT_STREAM: &str = "string";

    const MAX_ELEMENTS: u64 = 16;

    pub fn register(registry: &mut CapabilityRegistry) {
        registry.register(INT_SEQUENCE, int_sequence());
        registry.register(BYTE_STRING, byte_string());
        registry.register(TEXT_STREAM, text_stream());
    }

    fn any_i64(b: &mut Builder<'_>) -> Result<i64, FuzzError> {
        let id = b.decision_id();
        b.between(i64::MIN, i64::MAX, id)
    }

    fn element_count(b: &mut Builder<'_>) -> Result<u64, FuzzError> {
        let id = b.decision_id();
        b.between(0u64, MAX_ELEMENTS, id)
    }

    fn int_sequence() -> TypeCapabilities {
        TypeCapabilities::new()
            .constructor(|_b: &mut Builder<'_>| Ok(Vec::<i64>::new()))
            .constructor(|b: &mut Builder<'_>| {
                let n = element_count(b)?;
                (0..n).map(|_| any_i64(b)).collect::<Result<Vec<i64>, _>>()
            })
            .method(|b: &mut Builder<'_>, v: &mut Vec<i64>| {
                v.push(any_i64(b)?);
                Ok(())
            })
            .method(|_b: &mut Builder<'_>, v: &mut Vec<i64>| {
                v.pop();
                Ok(())
            })
            .method(|b: &mut Builder<'_>, v: &mut Vec<i64>| {
                let len = element_count(b)?;
                v.truncate(len as usize);
                Ok(())
            })
    }

    fn byte_string() -> TypeCapabilities {
        TypeCapabilities::new()
            .constructor(|_b: &mut Builder<'_>| Ok(Vec::<u8>::new()))
            .constructor(|b: &mut Builder<'_>| {
                let n = element_count(b)?;
                let id = b.decision_id();
                (0..n)
                    .map(|_| b.between(u8::MIN, u8::MAX, id))
                    .collect::<Result<Vec<u8>, _>>()
            })
            .method(|b: &mut Builder<'_>, v: &mut Vec<u8>| {
                let id = b.decision_id();
                v.push(b.between(u8::MIN, u8::MAX, id)?);
                Ok(())
            })
            .method(|_b: &mut Builder<'_>, v: &mut Vec<u8>| {
                v.clear();
                Ok(())
            })
    }

    fn text_stream() -> TypeCapabilities {
        TypeCapabilities::new()
            .constructor(|_b: &mut Builder<'_>| Ok(String::new()))
            .constructor(|b: &mut Builder<'_>| {
                let id = b.decision_id();
                let value = b.make(&ValueType::Text, id, false)?;
                Ok(b.text_of(&value).unwrap_or_default())
            })
            .method(|b: &mut Builder<'_>, s: &mut String| {
                let id = b.decision_id();
                let c = b.between(b' ', b'~', id)?;
                s.push(char::from(c));
                Ok(())
            })
            .method(|b: &mut Builder<'_>, s: &mut String| {
                let id = b.decision_id();
                let n = b.between(0u64, s.chars().count() as u64, id)?;
                *s = s.chars().take(n as usize).collect();
                Ok(())
            })
    }
}
