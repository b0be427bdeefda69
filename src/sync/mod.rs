//! Keeping a stand-in's state consistent across a fork.
//!
//! A [`StandIn`] wraps a [`Target`] and is created through a [`Registry`]
//! before forking. Forks made through the same registry arm it on both
//! sides; from then on every operation performed in one process is mirrored
//! to the other over the stand-in's own sync channel, and applied there
//! before the next operation that process performs on it.

mod endpoint;
mod message;
mod registry;
mod stand_in;
mod target;

pub use endpoint::SyncEndpoint;
pub use message::{OpKind, Operation};
pub use registry::Registry;
pub use stand_in::StandIn;
#[doc(hidden)]
pub use target::next_arg;
pub use target::{CallableTarget, Target};
