//! Produced values
//!
//! Values are a closed set of variants. Object values carry the identity
//! they were constructed under, so a cached object handed to a different
//! requester must be rebuilt through its class constructor
//! (see [`Value::for_request`]).

use crate::call::CallId;
use crate::error::{CacheError, CacheResult};
use std::any::Any;
use std::fmt;
use std::sync::Arc;

/// Opaque object state shared between re-wrapped copies
pub type Payload = Arc<dyn Any + Send + Sync>;

/// Constructor for object values of one type
pub trait ObjectClass: Send + Sync {
    fn type_name(&self) -> &str;

    /// Build an object carrying `id` around an existing payload
    fn construct(&self, id: CallId, payload: Payload) -> CacheResult<ObjectValue>;
}

/// Object class that accepts any payload unchanged
#[derive(Debug, Clone)]
pub struct PlainClass {
    name: String,
}

impl PlainClass {
    pub fn new(name: impl Into<String>) -> Arc<Self> {
        Arc::new(Self { name: name.into() })
    }
}

impl ObjectClass for PlainClass {
    fn type_name(&self) -> &str {
        &self.name
    }

    fn construct(&self, id: CallId, payload: Payload) -> CacheResult<ObjectValue> {
        Ok(ObjectValue {
            class: Arc::new(self.clone()),
            id,
            payload,
        })
    }
}

/// A value that knows its own identity
#[derive(Clone)]
pub struct ObjectValue {
    class: Arc<dyn ObjectClass>,
    id: CallId,
    payload: Payload,
}

impl ObjectValue {
    pub fn new(class: Arc<dyn ObjectClass>, id: CallId, payload: Payload) -> Self {
        Self { class, id, payload }
    }

    pub fn id(&self) -> &CallId {
        &self.id
    }

    pub fn type_name(&self) -> &str {
        self.class.type_name()
    }

    pub fn payload(&self) -> &Payload {
        &self.payload
    }

    /// Downcast the payload
    pub fn downcast<T: Any + Send + Sync>(&self) -> Option<&T> {
        self.payload.downcast_ref::<T>()
    }

    /// Rebuild this object under a new identity
    pub fn rewrap(&self, id: CallId) -> CacheResult<Self> {
        self.class
            .construct(id, self.payload.clone())
            .map_err(|e| CacheError::ObjectReconstruct(format!("{}: {}", self.type_name(), e)))
    }
}

impl fmt::Debug for ObjectValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ObjectValue")
            .field("type", &self.type_name())
            .field("id", &self.id)
            .finish_non_exhaustive()
    }
}

/// A produced value
#[derive(Debug, Clone)]
pub enum Value {
    Int(i64),
    Float(f64),
    Bool(bool),
    String(String),
    List(Vec<Value>),
    Object(ObjectValue),
}

impl Value {
    /// Copy of this value whose object identities match `id`.
    ///
    /// Scalars are returned unchanged. List elements that are objects are
    /// rebuilt under `id.select_nth(i + 1)`.
    pub fn for_request(&self, id: &CallId) -> CacheResult<Self> {
        match self {
            Self::Object(obj) => Ok(Self::Object(obj.rewrap(id.clone())?)),
            Self::List(items) => items
                .iter()
                .enumerate()
                .map(|(i, item)| match item {
                    Self::Object(obj) => Ok(Self::Object(obj.rewrap(id.select_nth(i as u64 + 1))?)),
                    other => Ok(other.clone()),
                })
                .collect::<CacheResult<Vec<_>>>()
                .map(Self::List),
            other => Ok(other.clone()),
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Self::Int(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_object(&self) -> Option<&ObjectValue> {
        match self {
            Self::Object(obj) => Some(obj),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[Value]> {
        match self {
            Self::List(items) => Some(items),
            _ => None,
        }
    }

    pub fn is_object(&self) -> bool {
        matches!(self, Self::Object(_))
    }
}

impl From<i64> for Value {
    fn from(n: i64) -> Self {
        Self::Int(n)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Self::Bool(b)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Self::String(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Self::String(s)
    }
}

impl From<ObjectValue> for Value {
    fn from(obj: ObjectValue) -> Self {
        Self::Object(obj)
    }
}
