//! Stripping of values that cannot cross a process boundary.
//!
//! [`sanitize`] is total: whatever graph it is given, the result is
//! something [`crate::wire::serialize`] accepts.
//!
//! Only *direct* self-reference is broken: a member pointing back at the
//! object that holds it is dropped from the copy. An object reachable from
//! itself through some other object cannot be flattened into the wire's tree
//! form, so such a graph sanitizes to [`Value::Absent`] as a whole.

use std::collections::BTreeSet;

use crate::error::ProtocolError;
use crate::value::{Member, Object, ObjectRef, Value};
use crate::wire;

/// Sanitizes with the default rules, see [`Sanitizer`].
pub fn sanitize(value: &Value) -> Value {
    Sanitizer::default().sanitize(value)
}

/// Rules for what gets stripped. Closures and resources always are; objects
/// of an opaque class (database connections and other external handles
/// modelled as objects) can be added per sanitizer.
#[derive(Clone, Debug, Default)]
pub struct Sanitizer {
    opaque_classes: BTreeSet<String>,
}

impl Sanitizer {
    pub fn new() -> Self {
        Sanitizer::default()
    }

    pub fn with_opaque_class<C: Into<String>>(mut self, class: C) -> Self {
        self.opaque_classes.insert(class.into());
        self
    }

    pub fn sanitize(&self, value: &Value) -> Value {
        let stripped = match self.strip(value, &mut Vec::new()) {
            Ok(stripped) => stripped,
            Err(err) => {
                log::debug!("value degraded to absent: {}", err);
                return Value::Absent;
            }
        };

        match wire::serialize(&stripped) {
            Ok(_) => stripped,
            Err(err) => {
                log::debug!("sanitized value still not serializable: {}", err);
                Value::Absent
            }
        }
    }

    fn strip(&self, value: &Value, path: &mut Vec<*const ()>) -> Result<Value, ProtocolError> {
        let stripped = match value {
            Value::Closure(_) | Value::Resource(_) => Value::Absent,
            Value::Float(x) if !x.is_finite() => Value::Absent,
            Value::List(items) => Value::List(
                items
                    .iter()
                    .map(|item| self.strip(item, path))
                    .collect::<Result<_, _>>()?,
            ),
            Value::Map(map) => Value::Map(
                map.iter()
                    .map(|(k, v)| Ok((k.clone(), self.strip(v, path)?)))
                    .collect::<Result<_, ProtocolError>>()?,
            ),
            Value::Object(object) => {
                if self.opaque_classes.contains(&object.borrow().class) {
                    return Ok(Value::Absent);
                }
                let addr = object.addr();
                if path.contains(&addr) {
                    return Err(ProtocolError::NotTransferable("cyclic object graph"));
                }
                path.push(addr);
                let copy = self.strip_object(object, path);
                path.pop();
                Value::Object(copy?)
            }
            scalar => scalar.clone(),
        };
        Ok(stripped)
    }

    fn strip_object(
        &self,
        object: &ObjectRef,
        path: &mut Vec<*const ()>,
    ) -> Result<ObjectRef, ProtocolError> {
        let source = object.borrow();
        let mut copy = Object::new(source.class.clone());
        for member in &source.members {
            if member.redacted {
                copy.members.push(Member {
                    value: Value::Absent,
                    ..member.clone()
                });
                continue;
            }
            if let Value::Object(nested) = &member.value {
                if nested.ptr_eq(object) {
                    continue;
                }
            }
            copy.members.push(Member {
                name: member.name.clone(),
                value: self.strip(&member.value, path)?,
                visibility: member.visibility,
                storage: member.storage,
                redacted: false,
            });
        }
        Ok(ObjectRef::new(copy))
    }
}
