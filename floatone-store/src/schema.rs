//! Declared store keys.
//!
//! Keys are typed `const` handles. A [`Schema`] is built once per process from
//! their descriptors and never changes afterwards; the store refuses any key
//! that is not part of it.

use std::any::TypeId;
use std::collections::HashMap;
use std::fmt;
use std::marker::PhantomData;

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

use crate::error::{SchemaError, StoreError};

/// A value type that can live in the store
pub trait StoreValue:
    Clone + PartialEq + fmt::Debug + Serialize + DeserializeOwned + Send + Sync + 'static
{
    /// Domain constraints beyond what deserialization checks
    fn validate(&self) -> Result<(), String> {
        Ok(())
    }
}

impl StoreValue for bool {}
impl StoreValue for String {}
impl StoreValue for u32 {}
impl StoreValue for u64 {}
impl StoreValue for i64 {}
impl StoreValue for f64 {}
impl StoreValue for Vec<String> {}

impl<T: StoreValue> StoreValue for Option<T> {
    fn validate(&self) -> Result<(), String> {
        match self {
            Some(value) => value.validate(),
            None => Ok(()),
        }
    }
}

/// Typed handle to one declared key
pub struct Key<V> {
    name: &'static str,
    persist: bool,
    default: fn() -> V,
    _marker: PhantomData<fn() -> V>,
}

impl<V: StoreValue> Key<V> {
    /// A key written to and hydrated from the backend
    pub const fn persisted(name: &'static str, default: fn() -> V) -> Self {
        Self {
            name,
            persist: true,
            default,
            _marker: PhantomData,
        }
    }

    /// A key that lives in memory for the window's lifetime
    pub const fn memory(name: &'static str, default: fn() -> V) -> Self {
        Self {
            name,
            persist: false,
            default,
            _marker: PhantomData,
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn persist(&self) -> bool {
        self.persist
    }

    pub fn default_value(&self) -> V {
        (self.default)()
    }

    pub fn descriptor(&self) -> Result<KeyDescriptor, SchemaError> {
        let default = serde_json::to_value(self.default_value()).map_err(|e| {
            SchemaError::InvalidDefault {
                key: self.name.to_string(),
                reason: e.to_string(),
            }
        })?;

        Ok(KeyDescriptor {
            name: self.name,
            persist: self.persist,
            default,
            type_id: TypeId::of::<V>(),
            type_name: std::any::type_name::<V>(),
            canonicalize: canonicalize_typed::<V>,
        })
    }
}

impl<V> Clone for Key<V> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<V> Copy for Key<V> {}

impl<V> fmt::Debug for Key<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Key")
            .field("name", &self.name)
            .field("persist", &self.persist)
            .finish()
    }
}

fn canonicalize_typed<V: StoreValue>(candidate: &Value) -> Result<Value, String> {
    let value = V::deserialize(candidate).map_err(|e| e.to_string())?;
    value.validate()?;
    serde_json::to_value(&value).map_err(|e| e.to_string())
}

/// Type-erased declaration of a key
#[derive(Clone)]
pub struct KeyDescriptor {
    name: &'static str,
    persist: bool,
    default: Value,
    type_id: TypeId,
    type_name: &'static str,
    canonicalize: fn(&Value) -> Result<Value, String>,
}

impl KeyDescriptor {
    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn persist(&self) -> bool {
        self.persist
    }

    pub fn default_value(&self) -> &Value {
        &self.default
    }

    pub fn type_name(&self) -> &'static str {
        self.type_name
    }

    /// Decode `candidate` as this key's type, validate it and re-encode it.
    /// Values from disk, peers and the CLI all pass through here so equality checks compare like with like.
    pub fn canonicalize(&self, candidate: &Value) -> Result<Value, String> {
        (self.canonicalize)(candidate)
    }

    pub fn check(&self, candidate: &Value) -> Result<(), String> {
        self.canonicalize(candidate).map(|_| ())
    }
}

impl fmt::Debug for KeyDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyDescriptor")
            .field("name", &self.name)
            .field("persist", &self.persist)
            .field("default", &self.default)
            .field("type", &self.type_name)
            .finish()
    }
}

/// Immutable set of declared keys, in declaration order
#[derive(Debug)]
pub struct Schema {
    keys: Vec<KeyDescriptor>,
    index: HashMap<&'static str, usize>,
}

impl Schema {
    pub fn define(
        descriptors: impl IntoIterator<Item = KeyDescriptor>,
    ) -> Result<Self, SchemaError> {
        let mut keys = Vec::new();
        let mut index = HashMap::new();

        for descriptor in descriptors {
            if index.contains_key(descriptor.name) {
                return Err(SchemaError::DuplicateKey {
                    key: descriptor.name.to_string(),
                });
            }
            descriptor
                .check(&descriptor.default)
                .map_err(|reason| SchemaError::InvalidDefault {
                    key: descriptor.name.to_string(),
                    reason,
                })?;
            index.insert(descriptor.name, keys.len());
            keys.push(descriptor);
        }

        Ok(Self { keys, index })
    }

    pub fn builder() -> SchemaBuilder {
        SchemaBuilder::default()
    }

    pub fn get(&self, name: &str) -> Option<&KeyDescriptor> {
        self.index.get(name).map(|&i| &self.keys[i])
    }

    pub fn keys(&self) -> impl Iterator<Item = &KeyDescriptor> {
        self.keys.iter()
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.index.contains_key(name)
    }

    pub(crate) fn lookup_name(&self, name: &str) -> Result<&KeyDescriptor, StoreError> {
        self.get(name).ok_or_else(|| StoreError::UnknownKey {
            key: name.to_string(),
        })
    }

    /// Resolve a typed key, checking both its name and its value type
    pub fn lookup<V: StoreValue>(&self, key: &Key<V>) -> Result<&KeyDescriptor, StoreError> {
        let descriptor = self.lookup_name(key.name)?;
        if descriptor.type_id != TypeId::of::<V>() {
            return Err(StoreError::TypeMismatch {
                key: key.name.to_string(),
                declared: descriptor.type_name,
                requested: std::any::type_name::<V>(),
            });
        }
        Ok(descriptor)
    }
}

#[derive(Default)]
pub struct SchemaBuilder {
    descriptors: Vec<Result<KeyDescriptor, SchemaError>>,
}

impl SchemaBuilder {
    pub fn key<V: StoreValue>(mut self, key: Key<V>) -> Self {
        self.descriptors.push(key.descriptor());
        self
    }

    pub fn build(self) -> Result<Schema, SchemaError> {
        let descriptors = self
            .descriptors
            .into_iter()
            .collect::<Result<Vec<_>, _>>()?;
        Schema::define(descriptors)
    }
}
