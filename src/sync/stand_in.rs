use std::cell::RefCell;
use std::os::fd::RawFd;
use std::rc::{Rc, Weak};
use std::time::Duration;

use crate::error::{Result, TargetError};
use crate::process::{ForkChannel, ForkEvent};
use crate::value::Value;

use super::endpoint::SyncEndpoint;
use super::message::{OpKind, Operation};
use super::target::Target;

struct Shared<T> {
    target: T,
    endpoint: SyncEndpoint,
}

/// A synchronized stand-in for a target value.
///
/// Every operation goes through one handler. While the stand-in is enabled
/// it first applies whatever the peer process did since the last operation,
/// then applies the operation locally, then tells the peer about it. The
/// local result is always the one returned; the peer's replay of it is fire
/// and forget, and telling the peer never waits for it.
///
/// Clones are handles to the same stand-in; see [`StandIn::duplicate`] for
/// an independent copy.
pub struct StandIn<T> {
    shared: Rc<RefCell<Shared<T>>>,
}

impl<T> Clone for StandIn<T> {
    fn clone(&self) -> Self {
        StandIn {
            shared: Rc::clone(&self.shared),
        }
    }
}

impl<T: Target> StandIn<T> {
    pub fn new(target: T, endpoint: SyncEndpoint) -> Self {
        StandIn {
            shared: Rc::new(RefCell::new(Shared { target, endpoint })),
        }
    }

    pub fn get(&self, name: &str) -> Result<Value> {
        self.perform(Operation::get(name))
    }

    pub fn set<V: Into<Value>>(&self, name: &str, value: V) -> Result<()> {
        self.perform(Operation::set(name, value.into())).map(drop)
    }

    pub fn isset(&self, name: &str) -> Result<bool> {
        Ok(matches!(self.perform(Operation::isset(name))?, Value::Bool(true)))
    }

    pub fn unset(&self, name: &str) -> Result<()> {
        self.perform(Operation::unset(name)).map(drop)
    }

    pub fn call(&self, method: &str, args: Vec<Value>) -> Result<Value> {
        self.perform(Operation::call(method, args))
    }

    pub fn invoke(&self, args: Vec<Value>) -> Result<Value> {
        self.perform(Operation::invoke(args))
    }

    /// String conversion of the target, mirrored like any other operation.
    pub fn render(&self) -> Result<String> {
        match self.perform(Operation::to_string_op())? {
            Value::Str(s) => Ok(s),
            other => Ok(format!("{:?}", other)),
        }
    }

    /// Applies pending operations from the peer without doing anything
    /// else. Returns how many were applied.
    pub fn sync(&self) -> Result<usize> {
        let mut shared = self.shared.borrow_mut();
        shared.catch_up()
    }

    /// An independent copy of the stand-in and its target. The copy starts
    /// disabled, with a sync channel of its own.
    pub fn duplicate(&self) -> Result<StandIn<T>> {
        let mut shared = self.shared.borrow_mut();
        shared.catch_up()?;
        log::trace!("{} stand-in", OpKind::Duplicate);
        let endpoint = shared.endpoint.detached()?;
        Ok(StandIn::new(shared.target.duplicate(), endpoint))
    }

    /// Reads the local target directly, bypassing synchronization.
    pub fn inspect<R, F: FnOnce(&T) -> R>(&self, f: F) -> R {
        f(&self.shared.borrow().target)
    }

    pub fn enable(&self) {
        self.shared.borrow_mut().endpoint.enable();
    }

    pub fn disable(&self) {
        self.shared.borrow_mut().endpoint.disable();
    }

    pub fn depth(&self) -> usize {
        self.shared.borrow().endpoint.depth()
    }

    pub fn is_enabled(&self) -> bool {
        self.shared.borrow().endpoint.is_enabled()
    }

    fn perform(&self, op: Operation) -> Result<Value> {
        let mut shared = self.shared.borrow_mut();
        let message = if shared.endpoint.is_enabled() {
            shared.catch_up()?;
            Some(op.encode(shared.endpoint.sanitizer())?)
        } else {
            None
        };

        let result = apply(&mut shared.target, op)?;
        if let Some(message) = message {
            shared.endpoint.send(&message);
        }
        Ok(result)
    }
}

impl<T: Target + 'static> StandIn<T> {
    /// The channel handle that arms this stand-in when a fork happens. It
    /// holds the stand-in weakly, so registering it does not keep the
    /// stand-in alive.
    pub fn fork_channel(&self) -> Rc<dyn ForkChannel> {
        Rc::new(WeakStandIn {
            shared: Rc::downgrade(&self.shared),
        })
    }
}

impl<T: Target> Shared<T> {
    // Frames are taken one at a time: when one fails, the ones after it are
    // still buffered for the next catch-up.
    fn catch_up(&mut self) -> Result<usize> {
        if !self.endpoint.is_enabled() {
            return Ok(0);
        }
        self.endpoint.receive()?;
        let mut count = 0;
        while let Some(op) = self.endpoint.next_operation()? {
            replay(&mut self.target, op)?;
            count += 1;
        }
        Ok(count)
    }
}

struct WeakStandIn<T> {
    shared: Weak<RefCell<Shared<T>>>,
}

impl<T> WeakStandIn<T> {
    fn with_endpoint<F: FnOnce(&mut SyncEndpoint)>(&self, what: &str, f: F) {
        let Some(shared) = self.shared.upgrade() else {
            return;
        };
        match shared.try_borrow_mut() {
            Ok(mut shared) => f(&mut shared.endpoint),
            Err(_) => log::warn!("stand-in busy, skipped {}", what),
        };
    }
}

impl<T> ForkChannel for WeakStandIn<T> {
    fn activate(&self, event: &ForkEvent) {
        self.with_endpoint("activation", |endpoint| endpoint.activate(event.side()));
    }

    fn is_live(&self) -> bool {
        self.shared.strong_count() > 0
    }

    fn watch_fd(&self) -> Option<RawFd> {
        let shared = self.shared.upgrade()?;
        let fd = match shared.try_borrow() {
            Ok(shared) => shared.endpoint.raw_fd(),
            Err(_) => None,
        };
        fd
    }

    fn pump(&self) {
        self.with_endpoint("pump", |endpoint| {
            if let Err(err) = endpoint.receive() {
                log::warn!("failed to read from the sync peer: {}", err);
            }
        });
    }

    fn flush(&self, timeout: Duration) {
        self.with_endpoint("flush", |endpoint| endpoint.flush(timeout));
    }
}

fn apply<T: Target>(target: &mut T, op: Operation) -> std::result::Result<Value, TargetError> {
    let Operation { kind, name, args } = op;
    match kind {
        OpKind::Get => target.get(&name),
        OpKind::Set => {
            let value = args.into_iter().next().unwrap_or_default();
            target.set(&name, value).map(|_| Value::Absent)
        }
        OpKind::Isset => Ok(Value::Bool(target.isset(&name))),
        OpKind::Unset => target.unset(&name).map(|_| Value::Absent),
        OpKind::Call => target.call(&name, args),
        OpKind::Invoke => target.invoke(args),
        OpKind::ToString => Ok(Value::Str(target.render())),
        OpKind::Duplicate => Ok(Value::Absent),
    }
}

/// Applies an operation received from the peer. Reads are repeated for their
/// effect on the target only; what they return is dropped, as is the result
/// of replayed calls.
fn replay<T: Target>(target: &mut T, op: Operation) -> std::result::Result<(), TargetError> {
    log::trace!("replaying {} {}", op.kind, op.name);
    match op.kind {
        OpKind::Get | OpKind::Isset | OpKind::ToString => {
            let _ = apply(target, op);
            Ok(())
        }
        _ => apply(target, op).map(drop),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::error::Error;
    use crate::sanitize::Sanitizer;
    use crate::value::{Object, ObjectRef};
    use anyhow::Result;

    fn account() -> ObjectRef {
        ObjectRef::new(Object::new("Account").with("balance", 10))
    }

    fn stand_in() -> Result<StandIn<ObjectRef>> {
        let endpoint = SyncEndpoint::new(Config::default(), Sanitizer::default())?;
        Ok(StandIn::new(account(), endpoint))
    }

    // A stand-in on the child end of a channel and the parent's endpoint,
    // both disabled.
    fn linked() -> Result<(StandIn<ObjectRef>, SyncEndpoint)> {
        let (parent, child) = SyncEndpoint::pair(Config::default(), Sanitizer::default())?;
        Ok((StandIn::new(account(), child), parent))
    }

    #[test]
    fn test_disabled_stand_in_acts_locally() -> Result<()> {
        let account = stand_in()?;
        assert_eq!(account.depth(), 0);
        account.set("balance", 20)?;
        assert_eq!(account.get("balance")?, Value::Int(20));
        assert!(account.isset("balance")?);
        account.unset("balance")?;
        assert!(!account.isset("balance")?);
        assert_eq!(account.render()?, "Account");
        assert_eq!(account.sync()?, 0);
        Ok(())
    }

    #[test]
    fn test_target_errors_surface() -> Result<()> {
        let account = stand_in()?;
        assert!(matches!(
            account.call("withdraw", vec![]),
            Err(Error::Target(TargetError::UnknownMethod(_)))
        ));
        assert!(matches!(
            account.invoke(vec![]),
            Err(Error::Target(TargetError::NotInvokable))
        ));
        Ok(())
    }

    #[test]
    fn test_duplicate_is_independent() -> Result<()> {
        let account = stand_in()?;
        account.enable();
        let copy = account.duplicate()?;
        assert_eq!(copy.depth(), 0);
        copy.set("balance", 99)?;
        assert_eq!(account.get("balance")?, Value::Int(10));
        assert_eq!(copy.get("balance")?, Value::Int(99));
        Ok(())
    }

    #[test]
    fn test_disable_keeps_local_state() -> Result<()> {
        let account = stand_in()?;
        account.enable();
        account.set("balance", 15)?;
        account.disable();
        assert!(!account.is_enabled());
        assert_eq!(account.get("balance")?, Value::Int(15));
        Ok(())
    }

    #[test]
    fn test_invalid_name_is_rejected_before_applying() -> Result<()> {
        let account = stand_in()?;
        account.enable();
        assert!(account.set("a,b", 1).is_err());
        assert!(!account.inspect(|target| target.has("a,b")));
        Ok(())
    }

    #[test]
    fn test_depth_zero_sends_nothing() -> Result<()> {
        let (account, mut peer) = linked()?;
        account.set("balance", 11)?;
        account.get("balance")?;
        account.unset("balance")?;
        assert!(peer.drain()?.is_empty());

        account.enable();
        account.set("balance", 12)?;
        assert_eq!(peer.drain()?, vec![Operation::set("balance", Value::Int(12))]);

        account.disable();
        account.set("balance", 13)?;
        account.render()?;
        assert!(peer.drain()?.is_empty());
        assert_eq!(account.get("balance")?, Value::Int(13));
        Ok(())
    }

    #[test]
    fn test_operations_succeed_while_peer_is_not_reading() -> Result<()> {
        let (account, mut peer) = linked()?;
        account.enable();
        for i in 0..5000 {
            account.set("balance", i)?;
        }
        assert_eq!(account.get("balance")?, Value::Int(4999));

        let mut ops = Vec::new();
        for _ in 0..10_000 {
            ops.extend(peer.drain()?);
            if ops.len() == 5001 {
                break;
            }
            account.sync()?;
        }
        assert_eq!(ops.len(), 5001);
        assert_eq!(ops[4999], Operation::set("balance", Value::Int(4999)));
        Ok(())
    }

    #[test]
    fn test_failed_replay_keeps_later_operations() -> Result<()> {
        let (account, mut peer) = linked()?;
        account.enable();
        peer.enable();
        peer.mirror(&Operation::call("audit", vec![]))?;
        peer.mirror(&Operation::set("balance", Value::Int(20)))?;

        assert!(matches!(
            account.sync(),
            Err(Error::Target(TargetError::UnknownMethod(_)))
        ));
        assert_eq!(account.get("balance")?, Value::Int(20));
        Ok(())
    }

    #[test]
    fn test_fork_channel_arms_once_per_fork() -> Result<()> {
        let account = stand_in()?;
        let channel = account.fork_channel();
        channel.activate(&ForkEvent::new(nix::unistd::getpid(), crate::process::Side::Parent));
        assert_eq!(account.depth(), 1);
        assert!(channel.is_live());
        assert!(channel.watch_fd().is_some());

        drop(account);
        // A dropped stand-in is left alone.
        assert!(!channel.is_live());
        assert!(channel.watch_fd().is_none());
        channel.activate(&ForkEvent::new(nix::unistd::getpid(), crate::process::Side::Parent));
        Ok(())
    }
}
