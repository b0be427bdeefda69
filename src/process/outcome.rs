use std::any::Any;
use std::fmt;

use crate::channel::Message;
use crate::error::{ChannelError, Error, ProtocolError, Result};
use crate::sanitize::sanitize;
use crate::value::{Member, Object, Value, Visibility};
use crate::wire;

pub const RETURNED: &str = "returned";
pub const RAISED: &str = "raised";

pub const RETURNED_STATUS: i32 = 0;
pub const RAISED_STATUS: i32 = 1;
/// The child could not hand its outcome to the parent.
pub const DELIVERY_FAILED_STATUS: i32 = 2;

const DEFAULT_CLASS: &str = "Error";
const SUBSTITUTE_CLASS: &str = "Exception";
const PANIC_CLASS: &str = "panic";

// Normally, error types are not serialized, but to pass an error from the
// child process to the parent it has to be turned into plain data first.
/// An error raised by a callable running in a child process.
///
/// It keeps what can be rebuilt on the other side of the fork: a class name
/// (the Rust type name for converted errors), the message, a numeric code,
/// arbitrary sanitized data and the chain of source errors.
///
/// The data is held in its wire form so the error stays `Send + Sync` and can
/// travel inside `anyhow::Error`.
#[derive(Clone, Debug, PartialEq)]
pub struct ChildError {
    class: String,
    message: String,
    code: i64,
    // None when the data had no wire form.
    data: Option<String>,
    previous: Option<Box<ChildError>>,
}

impl ChildError {
    pub fn new<M: Into<String>>(message: M) -> Self {
        ChildError {
            class: DEFAULT_CLASS.to_owned(),
            message: message.into(),
            code: 0,
            data: Some(absent_payload()),
            previous: None,
        }
    }

    /// Captures a std error and its source chain.
    pub fn from_error<E>(err: &E) -> Self
    where
        E: std::error::Error + ?Sized,
    {
        let mut error = ChildError::new(err.to_string()).with_class(std::any::type_name::<E>());
        error.previous = err.source().map(|source| Box::new(Self::from_source(source)));
        error
    }

    fn from_source(err: &dyn std::error::Error) -> Self {
        let mut error = ChildError::new(err.to_string());
        error.previous = err.source().map(|source| Box::new(Self::from_source(source)));
        error
    }

    pub(crate) fn from_panic(payload: &(dyn Any + Send)) -> Self {
        let message = if let Some(s) = payload.downcast_ref::<&str>() {
            (*s).to_owned()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            "the closure caused the child process to panic".to_owned()
        };
        ChildError::new(message).with_class(PANIC_CLASS)
    }

    pub fn with_class<C: Into<String>>(mut self, class: C) -> Self {
        self.class = class.into();
        self
    }

    pub fn with_code(mut self, code: i64) -> Self {
        self.code = code;
        self
    }

    /// Attaches data, sanitized. Data that sanitizes away entirely (an
    /// indirect cycle, say) makes the error untransferable, and a substitute
    /// is sent in its place.
    pub fn with_data<V: Into<Value>>(mut self, data: V) -> Self {
        self.data = encode_data(&data.into());
        self
    }

    pub fn with_previous(mut self, previous: ChildError) -> Self {
        self.previous = Some(Box::new(previous));
        self
    }

    pub fn class(&self) -> &str {
        &self.class
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn code(&self) -> i64 {
        self.code
    }

    /// The attached data, rebuilt from its wire form.
    pub fn data(&self) -> Value {
        self.data
            .as_deref()
            .and_then(|payload| wire::deserialize(payload).ok())
            .unwrap_or_default()
    }

    pub fn previous(&self) -> Option<&ChildError> {
        self.previous.as_deref()
    }

    pub fn is_panic(&self) -> bool {
        self.class == PANIC_CLASS
    }

    fn is_transferable(&self) -> bool {
        self.data.is_some() && self.previous.as_ref().map_or(true, |p| p.is_transferable())
    }

    /// The error as an object graph, the form it is sanitized and sent in.
    pub fn to_value(&self) -> Value {
        let mut object = Object::new(self.class.clone())
            .with_member(Member::new(
                "message",
                self.message.clone(),
                Visibility::Protected,
                Default::default(),
            ))
            .with_member(Member::new(
                "code",
                self.code,
                Visibility::Protected,
                Default::default(),
            ))
            .with_member(Member::public("data", self.data()));
        if let Some(previous) = &self.previous {
            object = object.with_member(Member::private("previous", previous.to_value()));
        }
        Value::from(object)
    }

    /// Rebuilds an error from its object form. Objects missing the expected
    /// members still yield an error with whatever message and code they
    /// carry; a bare string becomes the message of a substitute error.
    /// Returns `None` when nothing usable was sent.
    pub fn from_value(value: &Value) -> Option<Self> {
        let object = match value {
            Value::Object(object) => object,
            Value::Str(message) => {
                return Some(ChildError::new(message.clone()).with_class(SUBSTITUTE_CLASS))
            }
            _ => return None,
        };

        let message = object.get("message").and_then(|m| m.as_str().map(str::to_owned));
        let code = object.get("code").and_then(|c| c.as_int()).unwrap_or(0);
        let class = match &message {
            Some(_) => object.class(),
            None => SUBSTITUTE_CLASS.to_owned(),
        };
        Some(ChildError {
            class,
            message: message.unwrap_or_default(),
            code,
            data: encode_data(&object.get("data").unwrap_or_default()),
            previous: object
                .get("previous")
                .and_then(|p| ChildError::from_value(&p))
                .map(Box::new),
        })
    }
}

impl fmt::Display for ChildError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.class, self.message)?;
        if self.code != 0 {
            write!(f, " (code {})", self.code)?;
        }
        Ok(())
    }
}

impl From<&str> for ChildError {
    fn from(message: &str) -> Self {
        ChildError::new(message)
    }
}

impl From<String> for ChildError {
    fn from(message: String) -> Self {
        ChildError::new(message)
    }
}

impl From<std::io::Error> for ChildError {
    fn from(err: std::io::Error) -> Self {
        let code = err.raw_os_error().map(i64::from).unwrap_or(0);
        ChildError::from_error(&err).with_code(code)
    }
}

impl From<anyhow::Error> for ChildError {
    fn from(err: anyhow::Error) -> Self {
        // Display of an anyhow error is its outermost context only.
        let mut error = ChildError::new(err.to_string());
        error.previous = err.source().map(|source| Box::new(ChildError::from_source(source)));
        error
    }
}

impl From<Box<dyn std::error::Error + Send + Sync>> for ChildError {
    fn from(err: Box<dyn std::error::Error + Send + Sync>) -> Self {
        ChildError::from_source(err.as_ref())
    }
}

impl From<Error> for ChildError {
    fn from(err: Error) -> Self {
        match err {
            // A grandchild's error travels on unchanged.
            Error::Raised(raised) => raised,
            other => ChildError::from_error(&other),
        }
    }
}

/// What a child process reports back: its callable's value or error.
#[derive(Clone, Debug, PartialEq)]
pub enum Outcome {
    Returned(Value),
    Raised(ChildError),
}

impl Outcome {
    pub fn exit_status(&self) -> i32 {
        match self {
            Outcome::Returned(_) => RETURNED_STATUS,
            Outcome::Raised(_) => RAISED_STATUS,
        }
    }

    /// The framed form sent by the child. Never fails: a value that cannot
    /// be serialized is sent as absent, an error that cannot be serialized
    /// is replaced by a plain one with the same message and code, and if even
    /// that fails an absent error is sent.
    pub fn into_message(self) -> Message {
        match self {
            Outcome::Returned(value) => {
                let payload = wire::serialize(&sanitize(&value)).unwrap_or_else(|_| absent_payload());
                Message::new(RETURNED, payload)
            }
            Outcome::Raised(error) => {
                let payload = if error.is_transferable() {
                    wire::serialize(&sanitize(&error.to_value())).ok()
                } else {
                    None
                };
                let payload = match payload {
                    Some(payload) => payload,
                    None => {
                        log::debug!("sending a substitute for unserializable error {}", error);
                        let substitute = ChildError::new(error.message())
                            .with_class(SUBSTITUTE_CLASS)
                            .with_code(error.code());
                        wire::serialize(&substitute.to_value()).unwrap_or_else(|_| absent_payload())
                    }
                };
                Message::new(RAISED, payload)
            }
        }
    }

    /// Decodes the message received by the parent.
    pub fn from_message(message: &Message) -> Result<Outcome> {
        match message.tag.as_str() {
            RETURNED => Ok(Outcome::Returned(wire::deserialize(&message.body)?)),
            RAISED => {
                let value = wire::deserialize(&message.body)?;
                ChildError::from_value(&value)
                    .map(Outcome::Raised)
                    .ok_or(Error::Channel(ChannelError::InvalidRaised))
            }
            other => Err(ProtocolError::UnknownAction(other.to_owned()).into()),
        }
    }

    pub fn into_result(self) -> Result<Value> {
        match self {
            Outcome::Returned(value) => Ok(value),
            Outcome::Raised(error) => Err(Error::Raised(error)),
        }
    }
}

fn absent_payload() -> String {
    String::from("\"absent\"")
}

fn encode_data(data: &Value) -> Option<String> {
    let sanitized = sanitize(data);
    if sanitized.is_absent() && !data.is_absent() {
        return None;
    }
    wire::serialize(&sanitized).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::{Closure, ObjectRef};

    #[test]
    fn test_returned_round_trip() -> anyhow::Result<()> {
        let outcome = Outcome::Returned(Value::from(vec![1, 2, 3]));
        let message = outcome.clone().into_message();
        assert_eq!(message.tag, RETURNED);
        assert_eq!(Outcome::from_message(&message)?, outcome);
        Ok(())
    }

    #[test]
    fn test_returned_value_is_sanitized() -> anyhow::Result<()> {
        let message = Outcome::Returned(Value::Closure(Closure::new(|_| Value::Absent))).into_message();
        assert_eq!(message.body, absent_payload());
        assert_eq!(Outcome::from_message(&message)?, Outcome::Returned(Value::Absent));
        Ok(())
    }

    #[test]
    fn test_raised_keeps_class_code_and_chain() -> anyhow::Result<()> {
        let error = ChildError::new("boom")
            .with_class("Kaboom")
            .with_code(7)
            .with_data(Object::new("Context").with("attempt", 3))
            .with_previous(ChildError::new("fuse"));
        let message = Outcome::Raised(error.clone()).into_message();
        match Outcome::from_message(&message)? {
            Outcome::Raised(decoded) => {
                assert_eq!(decoded, error);
                assert_eq!(decoded.previous().unwrap().message(), "fuse");
                let data = decoded.data();
                assert_eq!(data.as_object().unwrap().get("attempt"), Some(Value::Int(3)));
            }
            other => panic!("unexpected outcome {:?}", other),
        }
        Ok(())
    }

    #[test]
    fn test_unserializable_error_is_substituted() -> anyhow::Result<()> {
        let a = ObjectRef::new(Object::new("A"));
        let b = ObjectRef::new(Object::new("B").with("a", a.clone()));
        a.set("b", b);
        let error = ChildError::new("tangled").with_class("Custom").with_code(3).with_data(a);

        let message = Outcome::Raised(error).into_message();
        match Outcome::from_message(&message)? {
            Outcome::Raised(decoded) => {
                assert_eq!(decoded.class(), SUBSTITUTE_CLASS);
                assert_eq!(decoded.message(), "tangled");
                assert_eq!(decoded.code(), 3);
            }
            other => panic!("unexpected outcome {:?}", other),
        }
        Ok(())
    }

    #[test]
    fn test_absent_error_is_a_channel_error() {
        let message = Message::new(RAISED, absent_payload());
        assert!(matches!(
            Outcome::from_message(&message),
            Err(Error::Channel(ChannelError::InvalidRaised))
        ));
    }

    #[test]
    fn test_unknown_tag_and_bad_payload() {
        assert!(matches!(
            Outcome::from_message(&Message::new("thrown", "\"absent\"")),
            Err(Error::Protocol(ProtocolError::UnknownAction(_)))
        ));
        assert!(matches!(
            Outcome::from_message(&Message::new(RAISED, "{not json")),
            Err(Error::Protocol(ProtocolError::Serde(_)))
        ));
    }

    #[test]
    fn test_error_conversions() {
        let io = std::io::Error::from_raw_os_error(2);
        let error = ChildError::from(io);
        assert_eq!(error.code(), 2);
        assert_eq!(error.class(), "std::io::error::Error");

        let error = ChildError::from(anyhow::anyhow!("root cause").context("while testing"));
        assert_eq!(error.message(), "while testing");
        assert_eq!(error.previous().unwrap().message(), "root cause");

        let grandchild = Error::Raised(ChildError::new("deep").with_code(9));
        assert_eq!(ChildError::from(grandchild), ChildError::new("deep").with_code(9));
    }

    #[test]
    fn test_from_panic_payloads() {
        let error = ChildError::from_panic(&"static message");
        assert!(error.is_panic());
        assert_eq!(error.message(), "static message");
        let error = ChildError::from_panic(&String::from("owned"));
        assert_eq!(error.message(), "owned");
        let error = ChildError::from_panic(&42u8);
        assert!(error.message().contains("panic"));
    }
}
