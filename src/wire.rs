//! JSON wire form of [`Value`].
//!
//! Only sanitized graphs have a wire form: closures, resources, non-finite
//! floats and cyclic object graphs are rejected with
//! [`ProtocolError::NotTransferable`].

use std::collections::BTreeMap;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::ProtocolError;
use crate::value::{Member, Object, ObjectRef, Storage, Value, Visibility};

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
enum WireValue {
    Absent,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    List(Vec<WireValue>),
    Map(BTreeMap<String, WireValue>),
    Object(WireObject),
}

#[derive(Debug, Serialize, Deserialize)]
struct WireObject {
    class: String,
    members: Vec<WireMember>,
}

#[derive(Debug, Serialize, Deserialize)]
struct WireMember {
    name: String,
    #[serde(default)]
    visibility: Visibility,
    #[serde(default)]
    storage: Storage,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    redacted: bool,
    value: WireValue,
}

/// Serializes a value to compact JSON. Compact JSON never contains a raw
/// newline, which the channel sentinels rely on.
pub fn serialize(value: &Value) -> Result<String, ProtocolError> {
    let wire = to_wire(value, &mut Vec::new())?;
    Ok(serde_json::to_string(&wire)?)
}

pub fn deserialize(payload: &str) -> Result<Value, ProtocolError> {
    let wire: WireValue = serde_json::from_str(payload)?;
    Ok(from_wire(wire))
}

fn to_wire(value: &Value, path: &mut Vec<*const ()>) -> Result<WireValue, ProtocolError> {
    let wire = match value {
        Value::Absent => WireValue::Absent,
        Value::Bool(b) => WireValue::Bool(*b),
        Value::Int(i) => WireValue::Int(*i),
        Value::Float(x) if x.is_finite() => WireValue::Float(*x),
        Value::Float(_) => return Err(ProtocolError::NotTransferable("non-finite float")),
        Value::Str(s) => WireValue::Str(s.clone()),
        Value::List(items) => WireValue::List(
            items
                .iter()
                .map(|item| to_wire(item, path))
                .collect::<Result<_, _>>()?,
        ),
        Value::Map(map) => WireValue::Map(
            map.iter()
                .map(|(k, v)| Ok((k.clone(), to_wire(v, path)?)))
                .collect::<Result<_, ProtocolError>>()?,
        ),
        Value::Object(object) => {
            let addr = object.addr();
            if path.contains(&addr) {
                return Err(ProtocolError::NotTransferable("cyclic object graph"));
            }
            path.push(addr);
            let result = object_to_wire(object, path);
            path.pop();
            WireValue::Object(result?)
        }
        Value::Closure(_) => return Err(ProtocolError::NotTransferable("closure")),
        Value::Resource(_) => return Err(ProtocolError::NotTransferable("resource")),
    };
    Ok(wire)
}

fn object_to_wire(object: &ObjectRef, path: &mut Vec<*const ()>) -> Result<WireObject, ProtocolError> {
    let object = object.borrow();
    let members = object
        .members
        .iter()
        .map(|member| {
            Ok(WireMember {
                name: member.name.clone(),
                visibility: member.visibility,
                storage: member.storage,
                redacted: member.redacted,
                value: to_wire(&member.value, path)?,
            })
        })
        .collect::<Result<_, ProtocolError>>()?;
    Ok(WireObject {
        class: object.class.clone(),
        members,
    })
}

fn from_wire(wire: WireValue) -> Value {
    match wire {
        WireValue::Absent => Value::Absent,
        WireValue::Bool(b) => Value::Bool(b),
        WireValue::Int(i) => Value::Int(i),
        WireValue::Float(x) => Value::Float(x),
        WireValue::Str(s) => Value::Str(s),
        WireValue::List(items) => Value::List(items.into_iter().map(from_wire).collect()),
        WireValue::Map(map) => Value::Map(map.into_iter().map(|(k, v)| (k, from_wire(v))).collect()),
        WireValue::Object(object) => {
            let members = object
                .members
                .into_iter()
                .map(|m| Member {
                    name: m.name,
                    value: from_wire(m.value),
                    visibility: m.visibility,
                    storage: m.storage,
                    redacted: m.redacted,
                })
                .collect();
            Value::Object(ObjectRef::new(Object {
                class: object.class,
                members,
            }))
        }
    }
}

impl Value {
    /// Builds a value from anything serde can serialize. Structs and JSON
    /// objects become [`Value::Map`].
    pub fn from_serialize<T: Serialize>(value: &T) -> Result<Value, ProtocolError> {
        Ok(from_json(serde_json::to_value(value)?))
    }

    /// Decodes into a typed value through its serde representation. Objects
    /// decode like maps of their members.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, ProtocolError> {
        let json = to_json(self, &mut Vec::new())?;
        Ok(serde_json::from_value(json)?)
    }
}

fn from_json(json: serde_json::Value) -> Value {
    use serde_json::Value as Json;
    match json {
        Json::Null => Value::Absent,
        Json::Bool(b) => Value::Bool(b),
        Json::Number(n) => match n.as_i64() {
            Some(i) => Value::Int(i),
            None => Value::Float(n.as_f64().unwrap_or(f64::NAN)),
        },
        Json::String(s) => Value::Str(s),
        Json::Array(items) => Value::List(items.into_iter().map(from_json).collect()),
        Json::Object(map) => Value::Map(map.into_iter().map(|(k, v)| (k, from_json(v))).collect()),
    }
}

fn to_json(value: &Value, path: &mut Vec<*const ()>) -> Result<serde_json::Value, ProtocolError> {
    use serde_json::Value as Json;
    let json = match value {
        Value::Absent => Json::Null,
        Value::Bool(b) => Json::Bool(*b),
        Value::Int(i) => Json::from(*i),
        Value::Float(x) => serde_json::Number::from_f64(*x)
            .map(Json::Number)
            .ok_or(ProtocolError::NotTransferable("non-finite float"))?,
        Value::Str(s) => Json::String(s.clone()),
        Value::List(items) => Json::Array(
            items
                .iter()
                .map(|item| to_json(item, path))
                .collect::<Result<_, _>>()?,
        ),
        Value::Map(map) => Json::Object(
            map.iter()
                .map(|(k, v)| Ok((k.clone(), to_json(v, path)?)))
                .collect::<Result<_, ProtocolError>>()?,
        ),
        Value::Object(object) => {
            let addr = object.addr();
            if path.contains(&addr) {
                return Err(ProtocolError::NotTransferable("cyclic object graph"));
            }
            path.push(addr);
            let members = object
                .borrow()
                .members
                .iter()
                .map(|m| Ok((m.name.clone(), to_json(&m.value, path)?)))
                .collect::<Result<_, ProtocolError>>();
            path.pop();
            Json::Object(members?)
        }
        Value::Closure(_) => return Err(ProtocolError::NotTransferable("closure")),
        Value::Resource(_) => return Err(ProtocolError::NotTransferable("resource")),
    };
    Ok(json)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::Closure;

    #[test]
    fn test_wire_shape() -> anyhow::Result<()> {
        let value = Value::List(vec![Value::Int(1), Value::Absent, Value::from("x")]);
        assert_eq!(serialize(&value)?, r#"{"list":[{"int":1},"absent",{"str":"x"}]}"#);
        Ok(())
    }

    #[test]
    fn test_object_members_keep_visibility() -> anyhow::Result<()> {
        let object = Object::new("Secret")
            .with_member(Member::new("key", "k", Visibility::Private, Storage::Static))
            .with_member(Member::public("hidden", Value::Absent).redact());
        let value = Value::from(object);
        let decoded = deserialize(&serialize(&value)?)?;
        assert_eq!(decoded, value);
        let decoded = decoded.as_object().unwrap().borrow().clone();
        assert_eq!(decoded.member("key").unwrap().storage, Storage::Static);
        assert!(decoded.member("hidden").unwrap().redacted);
        Ok(())
    }

    #[test]
    fn test_rejects_untransferable() {
        let closure = Value::Closure(Closure::new(|_| Value::Absent));
        assert!(matches!(
            serialize(&closure),
            Err(ProtocolError::NotTransferable("closure"))
        ));
        assert!(serialize(&Value::Float(f64::INFINITY)).is_err());

        let object = ObjectRef::new(Object::new("Loop"));
        object.set("me", object.clone());
        assert!(matches!(
            serialize(&Value::Object(object)),
            Err(ProtocolError::NotTransferable("cyclic object graph"))
        ));
    }

    #[test]
    fn test_serde_bridge() -> anyhow::Result<()> {
        #[derive(Debug, PartialEq, Serialize, Deserialize)]
        struct Point {
            x: i32,
            y: Option<String>,
        }

        let value = Value::from_serialize(&Point { x: 3, y: None })?;
        let object = Value::from(Object::new("Point").with("x", 3).with("y", Value::Absent));
        assert_eq!(value.decode::<Point>()?, Point { x: 3, y: None });
        assert_eq!(object.decode::<Point>()?, Point { x: 3, y: None });
        Ok(())
    }
}
