//! Run closures in forked child processes, get back what they returned or
//! raised, and keep stand-in test objects consistent between the parent and
//! the child.
//!
//! ```no_run
//! use forksync::{ChildError, Object, ObjectRef, Registry, Value};
//!
//! # fn main() -> forksync::Result<()> {
//! assert_eq!(forksync::run(|| Ok::<_, ChildError>(42))?, Value::Int(42));
//!
//! let mut registry = Registry::new();
//! let counter = registry.synchronize(ObjectRef::new(Object::new("Counter").with("count", 0)))?;
//! let in_child = counter.clone();
//! registry.run(move || in_child.set("count", 5))?;
//! assert_eq!(counter.get("count")?, Value::Int(5));
//! # Ok(())
//! # }
//! ```

#[cfg(test)]
#[macro_use]
extern crate quickcheck;

pub mod channel;
pub mod config;
pub mod error;
pub mod logger;
pub mod process;
pub mod sanitize;
pub mod sync;
pub mod value;
pub mod wire;

pub use config::Config;
pub use error::{ChannelError, Error, ProtocolError, Result, TargetError};
pub use process::{
    run, spawn, spawn_with, ActivationHooks, ChildError, ForkChannel, ForkEvent, Outcome,
    ProcessHandle, Side,
};
pub use sanitize::{sanitize, Sanitizer};
pub use sync::{CallableTarget, OpKind, Operation, Registry, StandIn, SyncEndpoint, Target};
pub use value::{Closure, FromValue, Member, Object, ObjectRef, Resource, Storage, Value, Visibility};
