use std::fmt;

use crate::channel::{check_name, split_body, Message};
use crate::error::ProtocolError;
use crate::sanitize::Sanitizer;
use crate::value::Value;
use crate::wire;

/// The kinds of operation a stand-in intercepts.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum OpKind {
    Get,
    Set,
    Isset,
    Unset,
    Call,
    Invoke,
    ToString,
    /// Deep copy of the stand-in. Applied locally only, never sent.
    Duplicate,
}

impl OpKind {
    pub fn tag(self) -> &'static str {
        match self {
            OpKind::Get => "get",
            OpKind::Set => "set",
            OpKind::Isset => "isset",
            OpKind::Unset => "unset",
            OpKind::Call => "call",
            OpKind::Invoke => "invoke",
            OpKind::ToString => "to_string",
            OpKind::Duplicate => "duplicate",
        }
    }

    /// Kind of a received tag. Duplication has no wire form, so its tag is
    /// as unknown as any other.
    pub fn from_tag(tag: &str) -> Result<Self, ProtocolError> {
        let kind = match tag {
            "get" => OpKind::Get,
            "set" => OpKind::Set,
            "isset" => OpKind::Isset,
            "unset" => OpKind::Unset,
            "call" => OpKind::Call,
            "invoke" => OpKind::Invoke,
            "to_string" => OpKind::ToString,
            other => return Err(ProtocolError::UnknownAction(other.to_owned())),
        };
        Ok(kind)
    }

    pub fn is_mirrored(self) -> bool {
        self != OpKind::Duplicate
    }

    fn carries_name(self) -> bool {
        matches!(
            self,
            OpKind::Get | OpKind::Set | OpKind::Isset | OpKind::Unset | OpKind::Call
        )
    }
}

impl fmt::Display for OpKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.tag())
    }
}

/// One intercepted operation: what was done, to which member or method, with
/// which arguments. `set` carries the new value as its only argument.
#[derive(Clone, Debug, PartialEq)]
pub struct Operation {
    pub kind: OpKind,
    pub name: String,
    pub args: Vec<Value>,
}

impl Operation {
    fn new<N: Into<String>>(kind: OpKind, name: N, args: Vec<Value>) -> Self {
        Operation {
            kind,
            name: name.into(),
            args,
        }
    }

    pub fn get<N: Into<String>>(name: N) -> Self {
        Operation::new(OpKind::Get, name, Vec::new())
    }

    pub fn set<N: Into<String>>(name: N, value: Value) -> Self {
        Operation::new(OpKind::Set, name, vec![value])
    }

    pub fn isset<N: Into<String>>(name: N) -> Self {
        Operation::new(OpKind::Isset, name, Vec::new())
    }

    pub fn unset<N: Into<String>>(name: N) -> Self {
        Operation::new(OpKind::Unset, name, Vec::new())
    }

    pub fn call<N: Into<String>>(name: N, args: Vec<Value>) -> Self {
        Operation::new(OpKind::Call, name, args)
    }

    pub fn invoke(args: Vec<Value>) -> Self {
        Operation::new(OpKind::Invoke, String::new(), args)
    }

    pub fn to_string_op() -> Self {
        Operation::new(OpKind::ToString, String::new(), Vec::new())
    }

    pub fn duplicate() -> Self {
        Operation::new(OpKind::Duplicate, String::new(), Vec::new())
    }

    /// The value of a `set`, absent if none was given.
    pub fn value(&self) -> Value {
        self.args.first().cloned().unwrap_or_default()
    }

    /// The message sent to the peer. Values and arguments go through
    /// `sanitizer` first; the operation itself is left untouched.
    pub fn encode(&self, sanitizer: &Sanitizer) -> Result<Message, ProtocolError> {
        if self.kind.carries_name() {
            check_name(&self.name)?;
        }
        let body = match self.kind {
            OpKind::Get | OpKind::Isset | OpKind::Unset => self.name.clone(),
            OpKind::Set => {
                let value = wire::serialize(&sanitizer.sanitize(&self.value()))?;
                format!("{},{}", self.name, value)
            }
            OpKind::Call => format!("{},{}", self.name, encode_args(&self.args, sanitizer)?),
            OpKind::Invoke => encode_args(&self.args, sanitizer)?,
            OpKind::ToString => String::new(),
            OpKind::Duplicate => {
                return Err(ProtocolError::Malformed(
                    "duplication is never mirrored".to_owned(),
                ))
            }
        };
        Ok(Message::new(self.kind.tag(), body))
    }

    pub fn decode(message: &Message) -> Result<Self, ProtocolError> {
        let kind = OpKind::from_tag(&message.tag)?;
        let op = match kind {
            OpKind::Get | OpKind::Isset | OpKind::Unset => {
                Operation::new(kind, message.body.as_str(), Vec::new())
            }
            OpKind::Set => {
                let (name, value) = split_body(&message.body)?;
                Operation::set(name, wire::deserialize(value)?)
            }
            OpKind::Call => {
                let (name, args) = split_body(&message.body)?;
                Operation::call(name, decode_args(args)?)
            }
            OpKind::Invoke => Operation::invoke(decode_args(&message.body)?),
            OpKind::ToString => Operation::to_string_op(),
            OpKind::Duplicate => return Err(ProtocolError::UnknownAction(message.tag.clone())),
        };
        Ok(op)
    }
}

// Arguments are sanitized one by one so a single untransferable argument
// does not take the whole list with it.
fn encode_args(args: &[Value], sanitizer: &Sanitizer) -> Result<String, ProtocolError> {
    let args = args.iter().map(|arg| sanitizer.sanitize(arg)).collect();
    wire::serialize(&Value::List(args))
}

fn decode_args(payload: &str) -> Result<Vec<Value>, ProtocolError> {
    match wire::deserialize(payload)? {
        Value::List(args) => Ok(args),
        other => Err(ProtocolError::Malformed(format!(
            "expected an argument list, got {}",
            other.type_name()
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::{Closure, Object};
    use anyhow::Result;

    fn round_trip(op: &Operation) -> Result<Operation> {
        let message = op.encode(&Sanitizer::default())?;
        let frame = message.encode(crate::channel::SYNC_SENTINEL);
        let frame = &frame[..frame.len() - crate::channel::SYNC_SENTINEL.len()];
        Ok(Operation::decode(&Message::parse(frame)?)?)
    }

    #[test]
    fn test_wire_bodies() -> Result<()> {
        let sanitizer = Sanitizer::default();
        assert_eq!(
            Operation::get("count").encode(&sanitizer)?,
            Message::new("get", "count")
        );
        assert_eq!(
            Operation::set("count", Value::Int(5)).encode(&sanitizer)?,
            Message::new("set", r#"count,{"int":5}"#)
        );
        assert_eq!(
            Operation::call("add", vec![Value::Int(1)]).encode(&sanitizer)?,
            Message::new("call", r#"add,{"list":[{"int":1}]}"#)
        );
        assert_eq!(
            Operation::invoke(vec![]).encode(&sanitizer)?,
            Message::new("invoke", r#"{"list":[]}"#)
        );
        assert_eq!(
            Operation::to_string_op().encode(&sanitizer)?,
            Message::new("to_string", "")
        );
        Ok(())
    }

    #[test]
    fn test_operations_survive_framing() -> Result<()> {
        let ops = [
            Operation::get("a"),
            Operation::isset("b"),
            Operation::unset("c"),
            Operation::set("d", Value::from(Object::new("Point").with("x", 1))),
            Operation::call("e", vec![Value::from("x,y\n"), Value::Float(0.5)]),
            Operation::invoke(vec![Value::Bool(true)]),
            Operation::to_string_op(),
        ];
        for op in &ops {
            assert_eq!(&round_trip(op)?, op);
        }
        Ok(())
    }

    #[test]
    fn test_untransferable_arguments_are_stripped() -> Result<()> {
        let op = Operation::call(
            "register",
            vec![Value::Closure(Closure::new(|_| Value::Absent)), Value::Int(3)],
        );
        let decoded = round_trip(&op)?;
        assert_eq!(decoded.args, vec![Value::Absent, Value::Int(3)]);
        Ok(())
    }

    #[test]
    fn test_rejects_bad_names_and_tags() {
        let sanitizer = Sanitizer::default();
        assert!(matches!(
            Operation::get("a,b").encode(&sanitizer),
            Err(ProtocolError::InvalidName(_))
        ));
        assert!(Operation::duplicate().encode(&sanitizer).is_err());
        assert!(matches!(
            Operation::decode(&Message::new("clone", "")),
            Err(ProtocolError::UnknownAction(_))
        ));
        assert!(matches!(
            Operation::decode(&Message::new("set", "missing-value")),
            Err(ProtocolError::Malformed(_))
        ));
        assert!(matches!(
            Operation::decode(&Message::new("invoke", r#"{"int":1}"#)),
            Err(ProtocolError::Malformed(_))
        ));
    }
}
