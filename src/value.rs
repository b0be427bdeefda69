//! Dynamic value graph shared between the two sides of a fork.
//!
//! [`Value`] is what travels over both channels: child outcomes, raised error
//! payloads, and the names/arguments of mirrored operations. Objects have
//! reference identity (two [`ObjectRef`]s may point at the same object, an
//! object may even hold a reference to itself), closures and OS resources can
//! live inside the graph but never cross a process boundary; see
//! [`crate::sanitize`].

use std::cell::{Ref, RefCell, RefMut};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::rc::Rc;

use serde::{Deserialize, Serialize};

use crate::error::TargetError;

#[derive(Clone, Default)]
pub enum Value {
    /// Marker for "nothing", also what non-transferable values turn into.
    #[default]
    Absent,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    List(Vec<Value>),
    Map(BTreeMap<String, Value>),
    Object(ObjectRef),
    Closure(Closure),
    Resource(Resource),
}

impl Value {
    pub fn is_absent(&self) -> bool {
        matches!(self, Value::Absent)
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Absent => "absent",
            Value::Bool(_) => "bool",
            Value::Int(_) => "int",
            Value::Float(_) => "float",
            Value::Str(_) => "string",
            Value::List(_) => "list",
            Value::Map(_) => "map",
            Value::Object(_) => "object",
            Value::Closure(_) => "closure",
            Value::Resource(_) => "resource",
        }
    }

    pub fn as_object(&self) -> Option<&ObjectRef> {
        match self {
            Value::Object(object) => Some(object),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            _ => None,
        }
    }

    /// Converts into a typed value, see [`FromValue`].
    pub fn into_typed<T: FromValue>(self) -> Result<T, TargetError> {
        T::from_value(self)
    }
}

impl PartialEq for Value {
    /// Structural equality. Objects compare by class and members unless they
    /// are the same object; closures and resources compare by identity.
    /// Comparing two distinct cyclic graphs does not terminate.
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Absent, Value::Absent) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Int(a), Value::Int(b)) => a == b,
            (Value::Float(a), Value::Float(b)) => a == b,
            (Value::Str(a), Value::Str(b)) => a == b,
            (Value::List(a), Value::List(b)) => a == b,
            (Value::Map(a), Value::Map(b)) => a == b,
            (Value::Object(a), Value::Object(b)) => {
                a.ptr_eq(b) || *a.borrow() == *b.borrow()
            }
            (Value::Closure(a), Value::Closure(b)) => a.ptr_eq(b),
            (Value::Resource(a), Value::Resource(b)) => a == b,
            _ => false,
        }
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Absent => f.write_str("Absent"),
            Value::Bool(b) => write!(f, "Bool({})", b),
            Value::Int(i) => write!(f, "Int({})", i),
            Value::Float(x) => write!(f, "Float({:?})", x),
            Value::Str(s) => write!(f, "Str({:?})", s),
            Value::List(items) => f.debug_list().entries(items).finish(),
            Value::Map(map) => f.debug_map().entries(map).finish(),
            Value::Object(object) => fmt::Debug::fmt(object, f),
            Value::Closure(_) => f.write_str("Closure"),
            Value::Resource(resource) => fmt::Debug::fmt(resource, f),
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Visibility {
    #[default]
    Public,
    Protected,
    Private,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Storage {
    #[default]
    Instance,
    Static,
}

#[derive(Clone, Debug, PartialEq)]
pub struct Member {
    pub name: String,
    pub value: Value,
    pub visibility: Visibility,
    pub storage: Storage,
    /// Redacted members are never sent to the other process.
    pub redacted: bool,
}

impl Member {
    pub fn new<N: Into<String>, V: Into<Value>>(
        name: N,
        value: V,
        visibility: Visibility,
        storage: Storage,
    ) -> Self {
        Member {
            name: name.into(),
            value: value.into(),
            visibility,
            storage,
            redacted: false,
        }
    }

    pub fn public<N: Into<String>, V: Into<Value>>(name: N, value: V) -> Self {
        Member::new(name, value, Visibility::Public, Storage::Instance)
    }

    pub fn private<N: Into<String>, V: Into<Value>>(name: N, value: V) -> Self {
        Member::new(name, value, Visibility::Private, Storage::Instance)
    }

    pub fn redact(mut self) -> Self {
        self.redacted = true;
        self
    }
}

/// A named bag of members, the dynamic counterpart of a struct instance.
#[derive(Clone, Debug, PartialEq)]
pub struct Object {
    pub class: String,
    pub members: Vec<Member>,
}

impl Object {
    pub fn new<C: Into<String>>(class: C) -> Self {
        Object {
            class: class.into(),
            members: Vec::new(),
        }
    }

    pub fn with<N: Into<String>, V: Into<Value>>(self, name: N, value: V) -> Self {
        self.with_member(Member::public(name, value))
    }

    pub fn with_member(mut self, member: Member) -> Self {
        self.insert(member);
        self
    }

    pub fn member(&self, name: &str) -> Option<&Member> {
        self.members.iter().find(|m| m.name == name)
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.member(name).map(|m| &m.value)
    }

    /// Replaces the value of an existing member, keeping its visibility and
    /// storage, or appends a new public member.
    pub fn set<N: Into<String>>(&mut self, name: N, value: Value) {
        let name = name.into();
        match self.members.iter_mut().find(|m| m.name == name) {
            Some(member) => member.value = value,
            None => self.members.push(Member::public(name, value)),
        }
    }

    pub fn insert(&mut self, member: Member) {
        match self.members.iter_mut().find(|m| m.name == member.name) {
            Some(existing) => *existing = member,
            None => self.members.push(member),
        }
    }

    pub fn remove(&mut self, name: &str) -> Option<Member> {
        let position = self.members.iter().position(|m| m.name == name)?;
        Some(self.members.remove(position))
    }
}

/// Shared, mutable handle to an [`Object`]. Cloning the handle does not copy
/// the object; use [`ObjectRef::deep_copy`] for that.
#[derive(Clone)]
pub struct ObjectRef(Rc<RefCell<Object>>);

impl ObjectRef {
    pub fn new(object: Object) -> Self {
        ObjectRef(Rc::new(RefCell::new(object)))
    }

    pub fn ptr_eq(&self, other: &ObjectRef) -> bool {
        Rc::ptr_eq(&self.0, &other.0)
    }

    pub fn borrow(&self) -> Ref<'_, Object> {
        self.0.borrow()
    }

    pub fn borrow_mut(&self) -> RefMut<'_, Object> {
        self.0.borrow_mut()
    }

    pub fn class(&self) -> String {
        self.borrow().class.clone()
    }

    pub fn get(&self, name: &str) -> Option<Value> {
        self.borrow().get(name).cloned()
    }

    pub fn set<N: Into<String>, V: Into<Value>>(&self, name: N, value: V) {
        let value = value.into();
        self.borrow_mut().set(name, value);
    }

    pub fn remove(&self, name: &str) -> Option<Value> {
        self.borrow_mut().remove(name).map(|m| m.value)
    }

    pub fn has(&self, name: &str) -> bool {
        self.borrow().member(name).is_some()
    }

    /// Copies the whole graph reachable from this object. Shared objects
    /// stay shared and cycles (including self-reference) are rebuilt between
    /// the copies, so the result is fully independent of the source.
    pub fn deep_copy(&self) -> ObjectRef {
        deep_copy_object(self, &mut HashMap::new())
    }

    /// Identity of the underlying object, stable for its lifetime.
    pub(crate) fn addr(&self) -> *const () {
        Rc::as_ptr(&self.0) as *const ()
    }
}

impl From<Object> for ObjectRef {
    fn from(object: Object) -> Self {
        ObjectRef::new(object)
    }
}

impl fmt::Debug for ObjectRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let object = match self.0.try_borrow() {
            Ok(object) => object,
            Err(_) => return write!(f, "Object(<borrowed>)"),
        };
        let mut s = f.debug_struct(&object.class);
        for member in &object.members {
            // Nested objects are printed shallowly so cyclic graphs terminate.
            match &member.value {
                Value::Object(nested) if nested.ptr_eq(self) => s.field(&member.name, &"<self>"),
                Value::Object(nested) => s.field(&member.name, &ShallowObject(nested)),
                other => s.field(&member.name, other),
            };
        }
        s.finish()
    }
}

struct ShallowObject<'a>(&'a ObjectRef);

impl fmt::Debug for ShallowObject<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0 .0.try_borrow() {
            Ok(object) => write!(f, "{} {{ .. }}", object.class),
            Err(_) => f.write_str("Object(<borrowed>)"),
        }
    }
}

fn deep_copy_object(
    source: &ObjectRef,
    copies: &mut HashMap<*const (), ObjectRef>,
) -> ObjectRef {
    if let Some(copy) = copies.get(&source.addr()) {
        return copy.clone();
    }
    let copy = ObjectRef::new(Object::new(source.class()));
    copies.insert(source.addr(), copy.clone());

    let members = source.borrow().members.clone();
    let members = members
        .into_iter()
        .map(|member| Member {
            value: deep_copy_value(&member.value, copies),
            ..member
        })
        .collect();
    copy.borrow_mut().members = members;
    copy
}

fn deep_copy_value(value: &Value, copies: &mut HashMap<*const (), ObjectRef>) -> Value {
    match value {
        Value::Object(object) => Value::Object(deep_copy_object(object, copies)),
        Value::List(items) => Value::List(items.iter().map(|v| deep_copy_value(v, copies)).collect()),
        Value::Map(map) => Value::Map(
            map.iter()
                .map(|(k, v)| (k.clone(), deep_copy_value(v, copies)))
                .collect(),
        ),
        other => other.clone(),
    }
}

/// A function value. It can be called in the process that created it but is
/// stripped when sent across the fork.
#[derive(Clone)]
pub struct Closure(Rc<dyn Fn(&[Value]) -> Value>);

impl Closure {
    pub fn new<F>(f: F) -> Self
    where
        F: Fn(&[Value]) -> Value + 'static,
    {
        Closure(Rc::new(f))
    }

    pub fn call(&self, args: &[Value]) -> Value {
        (self.0)(args)
    }

    pub fn ptr_eq(&self, other: &Closure) -> bool {
        Rc::as_ptr(&self.0) as *const () == Rc::as_ptr(&other.0) as *const ()
    }
}

/// An OS-level handle such as an open file or socket. Only meaningful in
/// the process that owns it.
#[derive(Clone)]
pub struct Resource {
    kind: String,
    fd: Option<Rc<OwnedFd>>,
}

impl Resource {
    pub fn new<K: Into<String>>(kind: K) -> Self {
        Resource {
            kind: kind.into(),
            fd: None,
        }
    }

    pub fn from_fd<K: Into<String>>(kind: K, fd: OwnedFd) -> Self {
        Resource {
            kind: kind.into(),
            fd: Some(Rc::new(fd)),
        }
    }

    pub fn kind(&self) -> &str {
        &self.kind
    }

    pub fn raw_fd(&self) -> Option<RawFd> {
        self.fd.as_ref().map(|fd| fd.as_raw_fd())
    }
}

impl PartialEq for Resource {
    fn eq(&self, other: &Self) -> bool {
        let same_fd = match (&self.fd, &other.fd) {
            (Some(a), Some(b)) => Rc::ptr_eq(a, b),
            (None, None) => true,
            _ => false,
        };
        self.kind == other.kind && same_fd
    }
}

impl fmt::Debug for Resource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.raw_fd() {
            Some(fd) => write!(f, "Resource({}, fd {})", self.kind, fd),
            None => write!(f, "Resource({})", self.kind),
        }
    }
}

impl From<()> for Value {
    fn from(_: ()) -> Self {
        Value::Absent
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

macro_rules! from_int {
    ($($ty:ty),*) => {
        $(
            impl From<$ty> for Value {
                fn from(i: $ty) -> Self {
                    Value::Int(i64::from(i))
                }
            }
        )*
    };
}

from_int!(i8, i16, i32, i64, u8, u16, u32);

impl From<f32> for Value {
    fn from(x: f32) -> Self {
        Value::Float(f64::from(x))
    }
}

impl From<f64> for Value {
    fn from(x: f64) -> Self {
        Value::Float(x)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Str(s.to_owned())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Str(s)
    }
}

impl<T: Into<Value>> From<Vec<T>> for Value {
    fn from(items: Vec<T>) -> Self {
        Value::List(items.into_iter().map(Into::into).collect())
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(opt: Option<T>) -> Self {
        opt.map_or(Value::Absent, Into::into)
    }
}

impl<T: Into<Value>> From<BTreeMap<String, T>> for Value {
    fn from(map: BTreeMap<String, T>) -> Self {
        Value::Map(map.into_iter().map(|(k, v)| (k, v.into())).collect())
    }
}

impl From<Object> for Value {
    fn from(object: Object) -> Self {
        Value::Object(ObjectRef::new(object))
    }
}

impl From<ObjectRef> for Value {
    fn from(object: ObjectRef) -> Self {
        Value::Object(object)
    }
}

impl From<Closure> for Value {
    fn from(closure: Closure) -> Self {
        Value::Closure(closure)
    }
}

impl From<Resource> for Value {
    fn from(resource: Resource) -> Self {
        Value::Resource(resource)
    }
}

/// Typed extraction from a [`Value`], used when decoding mirrored arguments
/// into the parameters of a typed target.
pub trait FromValue: Sized {
    fn from_value(value: Value) -> Result<Self, TargetError>;
}

fn mismatch<T>(expected: &'static str, found: &Value) -> Result<T, TargetError> {
    Err(TargetError::TypeMismatch {
        expected,
        found: found.type_name(),
    })
}

impl FromValue for Value {
    fn from_value(value: Value) -> Result<Self, TargetError> {
        Ok(value)
    }
}

impl FromValue for () {
    fn from_value(_: Value) -> Result<Self, TargetError> {
        Ok(())
    }
}

impl FromValue for bool {
    fn from_value(value: Value) -> Result<Self, TargetError> {
        match value {
            Value::Bool(b) => Ok(b),
            other => mismatch("bool", &other),
        }
    }
}

macro_rules! from_value_int {
    ($($ty:ty),*) => {
        $(
            impl FromValue for $ty {
                fn from_value(value: Value) -> Result<Self, TargetError> {
                    match value {
                        Value::Int(i) => <$ty>::try_from(i).or_else(|_| mismatch(stringify!($ty), &Value::Int(i))),
                        other => mismatch(stringify!($ty), &other),
                    }
                }
            }
        )*
    };
}

from_value_int!(i8, i16, i32, i64, u8, u16, u32, u64, usize);

impl FromValue for f64 {
    fn from_value(value: Value) -> Result<Self, TargetError> {
        match value {
            Value::Float(x) => Ok(x),
            Value::Int(i) => Ok(i as f64),
            other => mismatch("float", &other),
        }
    }
}

impl FromValue for String {
    fn from_value(value: Value) -> Result<Self, TargetError> {
        match value {
            Value::Str(s) => Ok(s),
            other => mismatch("string", &other),
        }
    }
}

impl FromValue for ObjectRef {
    fn from_value(value: Value) -> Result<Self, TargetError> {
        match value {
            Value::Object(object) => Ok(object),
            other => mismatch("object", &other),
        }
    }
}

impl<T: FromValue> FromValue for Option<T> {
    fn from_value(value: Value) -> Result<Self, TargetError> {
        match value {
            Value::Absent => Ok(None),
            other => T::from_value(other).map(Some),
        }
    }
}

impl<T: FromValue> FromValue for Vec<T> {
    fn from_value(value: Value) -> Result<Self, TargetError> {
        match value {
            Value::List(items) => items.into_iter().map(T::from_value).collect(),
            other => mismatch("list", &other),
        }
    }
}

impl<T: FromValue> FromValue for BTreeMap<String, T> {
    fn from_value(value: Value) -> Result<Self, TargetError> {
        match value {
            Value::Map(map) => map
                .into_iter()
                .map(|(k, v)| T::from_value(v).map(|v| (k, v)))
                .collect(),
            other => mismatch("map", &other),
        }
    }
}
