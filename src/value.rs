//! # Values
//!
//! [`Value`] is the dynamic value model shared by plan constants, client
//! arguments, notifications and duplex calls.
//!
//! Most variants are plain data and travel over the wire as-is. [`HostValue`]
//! is the exception: it wraps something only the local process can run (a
//! function, a sequence, a live stream or an opaque object). Host values are
//! never serialized; the local evaluation visitor replaces them with
//! [`DuplexRef`]s before a plan leaves the client.

use std::any::Any;
use std::fmt;
use std::sync::Arc;

use futures::future::BoxFuture;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};

use crate::ast::{TypeDesc, well_known};
use crate::duplex::{DuplexKind, DuplexRef};
use crate::error::RemoteError;

pub type ValueResult = Result<Value, RemoteError>;
pub type ValueStream = BoxStream<'static, ValueResult>;

pub type HostFunction = Arc<dyn Fn(Vec<Value>) -> BoxFuture<'static, ValueResult> + Send + Sync>;
pub type HostStreamFactory = Arc<dyn Fn() -> ValueStream + Send + Sync>;

/// A value that exists only in the local process.
#[derive(Clone)]
pub enum HostValue {
    /// Callable with arguments, returns one value.
    Function(HostFunction),
    /// Pull-based sequence; each call to the factory starts a fresh enumeration.
    Sequence(HostStreamFactory),
    /// Push-based stream; each call to the factory is a fresh subscription.
    Stream(HostStreamFactory),
    /// Anything else. Has no remote representation at all.
    Opaque {
        type_name: String,
        value: Arc<dyn Any + Send + Sync>,
    },
}

impl HostValue {
    pub fn function<F, Fut>(f: F) -> Self
    where
        F: Fn(Vec<Value>) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = ValueResult> + Send + 'static,
    {
        HostValue::Function(Arc::new(move |args| Box::pin(f(args))))
    }

    pub fn sequence<F>(f: F) -> Self
    where
        F: Fn() -> ValueStream + Send + Sync + 'static,
    {
        HostValue::Sequence(Arc::new(f))
    }

    pub fn stream<F>(f: F) -> Self
    where
        F: Fn() -> ValueStream + Send + Sync + 'static,
    {
        HostValue::Stream(Arc::new(f))
    }

    /// The duplex pattern matching this value's runtime shape, if it has one.
    pub fn duplex_kind(&self) -> Option<DuplexKind> {
        match self {
            HostValue::Function(_) => Some(DuplexKind::Invoke),
            HostValue::Sequence(_) => Some(DuplexKind::Enumerable),
            HostValue::Stream(_) => Some(DuplexKind::Observable),
            HostValue::Opaque { .. } => None,
        }
    }

    pub fn type_name(&self) -> String {
        match self {
            HostValue::Function(_) => well_known::FUNCTION.to_string(),
            HostValue::Sequence(_) => well_known::ENUMERABLE.to_string(),
            HostValue::Stream(_) => well_known::OBSERVABLE.to_string(),
            HostValue::Opaque { type_name, .. } => type_name.clone(),
        }
    }

    fn data_ptr(&self) -> *const () {
        match self {
            HostValue::Function(f) => Arc::as_ptr(f) as *const (),
            HostValue::Sequence(f) | HostValue::Stream(f) => Arc::as_ptr(f) as *const (),
            HostValue::Opaque { value, .. } => Arc::as_ptr(value) as *const (),
        }
    }
}

impl fmt::Debug for HostValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HostValue::Function(_) => write!(f, "HostValue::Function"),
            HostValue::Sequence(_) => write!(f, "HostValue::Sequence"),
            HostValue::Stream(_) => write!(f, "HostValue::Stream"),
            HostValue::Opaque { type_name, .. } => write!(f, "HostValue::Opaque({})", type_name),
        }
    }
}

impl PartialEq for HostValue {
    fn eq(&self, other: &Self) -> bool {
        std::mem::discriminant(self) == std::mem::discriminant(other)
            && self.data_ptr() == other.data_ptr()
    }
}

/// Ordered string-keyed record; the substitute for compiler-generated types.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct PropertyBag {
    entries: Vec<(String, Value)>,
}

impl PropertyBag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.entries.iter().find(|(k, _)| k == name).map(|(_, v)| v)
    }

    /// Inserts or replaces a property, keeping first-insertion order.
    pub fn insert<S: Into<String>>(&mut self, name: S, value: Value) {
        let name = name.into();
        match self.entries.iter_mut().find(|(k, _)| *k == name) {
            Some(entry) => entry.1 = value,
            None => self.entries.push((name, value)),
        }
    }

    pub fn with<S: Into<String>>(mut self, name: S, value: Value) -> Self {
        self.insert(name, value);
        self
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn map_values<E>(&self, f: &mut impl FnMut(&Value) -> Result<Value, E>) -> Result<Self, E> {
        let entries = self
            .entries
            .iter()
            .map(|(k, v)| Ok((k.clone(), f(v)?)))
            .collect::<Result<Vec<_>, E>>()?;
        Ok(Self { entries })
    }
}

impl FromIterator<(String, Value)> for PropertyBag {
    fn from_iter<T: IntoIterator<Item = (String, Value)>>(iter: T) -> Self {
        let mut bag = PropertyBag::new();
        for (k, v) in iter {
            bag.insert(k, v);
        }
        bag
    }
}

#[derive(Clone, Default, Serialize, Deserialize)]
#[serde(tag = "type", content = "value")]
pub enum Value {
    #[default]
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
    List(Vec<Value>),
    Bag(PropertyBag),
    Duplex(DuplexRef),
    #[serde(skip)]
    Host(HostValue),
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => write!(f, "Null"),
            Value::Bool(b) => write!(f, "Bool({})", b),
            Value::Int(i) => write!(f, "Int({})", i),
            Value::Float(x) => write!(f, "Float({})", x),
            Value::String(s) => write!(f, "String({:?})", s),
            Value::List(items) => f.debug_tuple("List").field(items).finish(),
            Value::Bag(bag) => f.debug_tuple("Bag").field(bag).finish(),
            Value::Duplex(r) => write!(f, "Duplex({:?})", r),
            Value::Host(h) => write!(f, "{:?}", h),
        }
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Null, Value::Null) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Int(a), Value::Int(b)) => a == b,
            (Value::Float(a), Value::Float(b)) => a == b,
            (Value::String(a), Value::String(b)) => a == b,
            (Value::List(a), Value::List(b)) => a == b,
            (Value::Bag(a), Value::Bag(b)) => a == b,
            (Value::Duplex(a), Value::Duplex(b)) => a == b,
            (Value::Host(a), Value::Host(b)) => a == b,
            _ => false,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => write!(f, "null"),
            Value::Bool(b) => write!(f, "{}", b),
            Value::Int(i) => write!(f, "{}", i),
            Value::Float(x) => write!(f, "{}", x),
            Value::String(s) => write!(f, "{}", s),
            Value::List(items) => {
                write!(f, "[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", item)?;
                }
                write!(f, "]")
            }
            Value::Bag(bag) => {
                write!(f, "{{")?;
                for (i, (k, v)) in bag.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}: {}", k, v)?;
                }
                write!(f, "}}")
            }
            Value::Duplex(r) => write!(f, "<duplex {:?} #{}>", r.kind, r.id),
            Value::Host(h) => write!(f, "<host {}>", h.type_name()),
        }
    }
}

impl Value {
    /// Name of the runtime type, matching [`TypeDesc`] names for built-ins.
    pub fn type_name(&self) -> String {
        match self {
            Value::Null => well_known::OBJECT.to_string(),
            Value::Bool(_) => well_known::BOOL.to_string(),
            Value::Int(_) => well_known::INT.to_string(),
            Value::Float(_) => well_known::FLOAT.to_string(),
            Value::String(_) => well_known::STRING.to_string(),
            Value::List(_) => well_known::LIST.to_string(),
            Value::Bag(_) => well_known::PROPERTY_BAG.to_string(),
            Value::Duplex(r) => r.kind.type_name().to_string(),
            Value::Host(h) => h.type_name(),
        }
    }

    /// True when the value (and everything nested in it) can be sent by value.
    pub fn is_representable(&self) -> bool {
        match self {
            Value::Host(_) => false,
            Value::List(items) => items.iter().all(Value::is_representable),
            Value::Bag(bag) => bag.iter().all(|(_, v)| v.is_representable()),
            _ => true,
        }
    }

    /// Rebuilds nested lists and bags, applying `f` to every host value.
    pub fn map_host<E>(&self, f: &mut impl FnMut(&HostValue) -> Result<Value, E>) -> Result<Value, E> {
        match self {
            Value::Host(h) => f(h),
            Value::List(items) => Ok(Value::List(
                items
                    .iter()
                    .map(|v| v.map_host(f))
                    .collect::<Result<Vec<_>, E>>()?,
            )),
            Value::Bag(bag) => Ok(Value::Bag(bag.map_values(&mut |v| v.map_host(f))?)),
            other => Ok(other.clone()),
        }
    }

    /// Whether this value is an instance of `ty` for type tests.
    pub fn is_instance_of(&self, ty: &TypeDesc) -> bool {
        match ty.tag() {
            well_known::OBJECT => !matches!(self, Value::Null),
            well_known::BOOL => matches!(self, Value::Bool(_)),
            well_known::INT => matches!(self, Value::Int(_)),
            well_known::FLOAT => matches!(self, Value::Float(_)),
            well_known::STRING => matches!(self, Value::String(_)),
            well_known::LIST | "Array" => matches!(self, Value::List(_)),
            well_known::PROPERTY_BAG | "Generated" => matches!(self, Value::Bag(_)),
            well_known::FUNCTION => matches!(
                self,
                Value::Host(HostValue::Function(_))
                    | Value::Duplex(DuplexRef {
                        kind: DuplexKind::Invoke,
                        ..
                    })
            ),
            well_known::ENUMERABLE => matches!(
                self,
                Value::List(_)
                    | Value::Host(HostValue::Sequence(_))
                    | Value::Duplex(DuplexRef {
                        kind: DuplexKind::Enumerable,
                        ..
                    })
            ),
            well_known::OBSERVABLE => matches!(
                self,
                Value::Host(HostValue::Stream(_))
                    | Value::Duplex(DuplexRef {
                        kind: DuplexKind::Observable,
                        ..
                    })
            ),
            other => matches!(self, Value::Host(HostValue::Opaque { type_name, .. }) if type_name == other),
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_float(&self) -> Option<f64> {
        match self {
            Value::Float(x) => Some(*x),
            Value::Int(i) => Some(*i as f64),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Float(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::String(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::String(v)
    }
}

impl From<Vec<Value>> for Value {
    fn from(v: Vec<Value>) -> Self {
        Value::List(v)
    }
}

impl From<PropertyBag> for Value {
    fn from(v: PropertyBag) -> Self {
        Value::Bag(v)
    }
}

impl From<HostValue> for Value {
    fn from(v: HostValue) -> Self {
        Value::Host(v)
    }
}
