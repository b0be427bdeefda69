use std::fmt;
use std::io::Write;
use std::os::fd::{AsRawFd, RawFd};
use std::os::unix::net::UnixStream;
use std::panic::{self, AssertUnwindSafe};
use std::rc::Rc;
use std::time::Duration;

use mio::Interest;
use nix::errno::Errno;
use nix::sys::socket::{self, sockopt};
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::{self, ForkResult, Pid};
use serde::de::DeserializeOwned;

use super::outcome::{ChildError, Outcome, DELIVERY_FAILED_STATUS};
use crate::channel::{
    read_available, FrameBuffer, Message, ReadState, Readiness, SocketPair, OUTCOME_SENTINEL,
};
use crate::config::Config;
use crate::error::{ChannelError, Error, Result};
use crate::value::Value;

/// Which branch of a fork a process is running.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Side {
    Parent,
    Child,
}

/// Passed to activation hooks right after a fork, in both processes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ForkEvent {
    child: Pid,
    side: Side,
}

impl ForkEvent {
    pub fn new(child: Pid, side: Side) -> Self {
        ForkEvent { child, side }
    }

    /// Pid of the forked child, whichever side observes the event.
    pub fn child(&self) -> Pid {
        self.child
    }

    pub fn side(&self) -> Side {
        self.side
    }
}

/// A channel that lives across forks next to the outcome channel, such as
/// the sync channel of a stand-in.
///
/// The parent keeps reading it while it waits for the child, and the child
/// flushes it before reporting, so a child producing more traffic than the
/// socket holds does not stall or lose messages.
pub trait ForkChannel {
    /// Arms the channel on one side of a fresh fork.
    fn activate(&self, event: &ForkEvent);
    /// False once whatever owns the channel is gone.
    fn is_live(&self) -> bool;
    /// The descriptor the parent watches while waiting.
    fn watch_fd(&self) -> Option<RawFd>;
    /// Parent side: takes in whatever has arrived. Never blocks.
    fn pump(&self);
    /// Child side: sends whatever is still queued, waiting at most `timeout`
    /// each time the peer stops reading.
    fn flush(&self, timeout: Duration);
}

enum Hook {
    Callback(Box<dyn Fn(&ForkEvent)>),
    Channel(Rc<dyn ForkChannel>),
}

/// Callbacks run after every fork made with [`spawn_with`], in both the
/// parent and the child, before the child starts its callable.
#[derive(Default)]
pub struct ActivationHooks {
    hooks: Vec<Hook>,
}

impl ActivationHooks {
    pub fn new() -> Self {
        ActivationHooks::default()
    }

    pub fn register<F>(&mut self, hook: F)
    where
        F: Fn(&ForkEvent) + 'static,
    {
        self.hooks.push(Hook::Callback(Box::new(hook)));
    }

    /// Adds a channel, activated in registration order along with the
    /// callbacks.
    pub fn register_channel(&mut self, channel: Rc<dyn ForkChannel>) {
        self.hooks.push(Hook::Channel(channel));
    }

    /// Drops channels whose owner is gone.
    pub fn prune(&mut self) {
        self.hooks.retain(|hook| match hook {
            Hook::Callback(_) => true,
            Hook::Channel(channel) => channel.is_live(),
        });
    }

    pub fn len(&self) -> usize {
        self.hooks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hooks.is_empty()
    }

    pub(crate) fn fire(&self, event: &ForkEvent) {
        for hook in &self.hooks {
            match hook {
                Hook::Callback(callback) => callback(event),
                Hook::Channel(channel) => channel.activate(event),
            }
        }
    }

    fn channels(&self) -> Vec<Rc<dyn ForkChannel>> {
        self.hooks
            .iter()
            .filter_map(|hook| match hook {
                Hook::Channel(channel) if channel.is_live() => Some(Rc::clone(channel)),
                _ => None,
            })
            .collect()
    }

    fn flush(&self, timeout: Duration) {
        for channel in self.channels() {
            channel.flush(timeout);
        }
    }
}

/// Runs `f` in a forked child process and returns a handle to its outcome,
/// with configuration taken from the environment and no activation hooks.
pub fn spawn<F, T, E>(f: F) -> Result<ProcessHandle>
where
    F: FnOnce() -> std::result::Result<T, E>,
    T: Into<Value>,
    E: Into<ChildError>,
{
    spawn_with(&Config::from_env(), &ActivationHooks::default(), f)
}

/// Spawns a child and waits for its outcome.
pub fn run<F, T, E>(f: F) -> Result<Value>
where
    F: FnOnce() -> std::result::Result<T, E>,
    T: Into<Value>,
    E: Into<ChildError>,
{
    spawn(f)?.wait()
}

/// Forks the current process. The child fires `hooks`, runs `f`, sends back
/// what it returned or raised and exits; it never returns from this call.
/// The parent fires `hooks` and gets a handle to wait on.
pub fn spawn_with<F, T, E>(config: &Config, hooks: &ActivationHooks, f: F) -> Result<ProcessHandle>
where
    F: FnOnce() -> std::result::Result<T, E>,
    T: Into<Value>,
    E: Into<ChildError>,
{
    let SocketPair { child, parent } = SocketPair::new(false)?;

    match unsafe { unistd::fork() }.map_err(Error::Spawn)? {
        ForkResult::Parent { child: pid } => {
            drop(child);
            hooks.fire(&ForkEvent::new(pid, Side::Parent));
            log::debug!("forked child process {}", pid);
            Ok(ProcessHandle {
                pid,
                channel: parent,
                config: config.clone(),
                side_channels: hooks.channels(),
            })
        }
        ForkResult::Child => {
            drop(parent);
            let status = run_child(config, hooks, f, child);
            std::process::exit(status);
        }
    }
}

fn run_child<F, T, E>(config: &Config, hooks: &ActivationHooks, f: F, channel: UnixStream) -> i32
where
    F: FnOnce() -> std::result::Result<T, E>,
    T: Into<Value>,
    E: Into<ChildError>,
{
    let event = ForkEvent::new(unistd::getpid(), Side::Child);
    crate::logger::enter_child();
    // Nothing may unwind out of the child: it would keep running the
    // parent's code past the fork.
    let outcome = match panic::catch_unwind(AssertUnwindSafe(|| {
        hooks.fire(&event);
        f()
    })) {
        Ok(Ok(value)) => Outcome::Returned(value.into()),
        Ok(Err(err)) => Outcome::Raised(err.into()),
        Err(payload) => Outcome::Raised(ChildError::from_panic(payload.as_ref())),
    };
    // Everything the callable mirrored must be out before the parent learns
    // it finished.
    hooks.flush(config.write_timeout());

    let status = outcome.exit_status();
    let message = match panic::catch_unwind(AssertUnwindSafe(|| outcome.into_message())) {
        Ok(message) => message,
        Err(_) => {
            log::error!("failed to encode the outcome of child {}", event.child());
            return DELIVERY_FAILED_STATUS;
        }
    };

    match deliver(channel, &message, config) {
        Ok(()) => status,
        Err(err) => {
            log::error!("failed to send outcome to parent: {}", err);
            DELIVERY_FAILED_STATUS
        }
    }
}

/// Sends the outcome with a single blocking write, after making the send
/// buffer large enough to hold it and waiting for the socket to be writable.
fn deliver(
    mut channel: UnixStream,
    message: &Message,
    config: &Config,
) -> std::result::Result<(), ChannelError> {
    let bytes = message.encode(OUTCOME_SENTINEL);
    let size = bytes.len().min(config.max_send_buffer);
    if let Err(errno) = socket::setsockopt(&channel, sockopt::SndBuf, &size) {
        log::debug!("failed to raise send buffer to {} bytes: {}", size, errno);
    }

    let mut readiness = Readiness::new(channel.as_raw_fd(), Interest::WRITABLE)?;
    if !readiness.wait(config.write_timeout())? {
        return Err(ChannelError::Timeout(config.write_timeout()));
    }
    channel.write_all(&bytes)?;
    channel.flush()?;
    Ok(())
}

/// The parent's view of a running child.
pub struct ProcessHandle {
    pid: Pid,
    channel: UnixStream,
    config: Config,
    side_channels: Vec<Rc<dyn ForkChannel>>,
}

impl fmt::Debug for ProcessHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProcessHandle")
            .field("pid", &self.pid)
            .field("channel", &self.channel)
            .field("side_channels", &self.side_channels.len())
            .finish()
    }
}

impl ProcessHandle {
    pub fn pid(&self) -> Pid {
        self.pid
    }

    /// Blocks until the child reports, then reaps it. Returns what the
    /// callable returned, or [`Error::Raised`] with what it raised. A child
    /// that dies without reporting yields [`Error::AbnormalExit`].
    pub fn wait(mut self) -> Result<Value> {
        let message = self.receive()?;
        Outcome::from_message(&message)?.into_result()
    }

    /// Like [`ProcessHandle::wait`], decoding the returned value through serde.
    pub fn wait_as<T: DeserializeOwned>(self) -> Result<T> {
        let value = self.wait()?;
        Ok(value.decode()?)
    }

    fn receive(&mut self) -> Result<Message> {
        self.channel.set_nonblocking(true).map_err(ChannelError::from)?;
        let mut readiness = Readiness::new(self.channel.as_raw_fd(), Interest::READABLE)?;
        for (token, side_channel) in self.side_channels.iter().enumerate() {
            if let Some(fd) = side_channel.watch_fd() {
                readiness.watch(fd, token)?;
            }
        }
        let mut buffer = FrameBuffer::new(OUTCOME_SENTINEL);
        let mut reaped = false;

        let frame = loop {
            self.pump_side_channels();
            if readiness.wait(self.config.poll_interval())? {
                let state = read_available(&mut self.channel, self.config.read_chunk, &mut buffer)?;
                if let Some(frame) = buffer.next_frame() {
                    break frame;
                }
                if state == ReadState::Closed {
                    let status = waitpid(self.pid, None).map_err(ChannelError::from)?;
                    return Err(self.abnormal_exit(describe(status)));
                }
                continue;
            }

            match waitpid(self.pid, Some(WaitPidFlag::WNOHANG)) {
                Ok(WaitStatus::StillAlive) => continue,
                Ok(status) => {
                    // The outcome may have arrived between the poll timing
                    // out and the child exiting.
                    read_available(&mut self.channel, self.config.read_chunk, &mut buffer)?;
                    match buffer.next_frame() {
                        Some(frame) => {
                            reaped = true;
                            break frame;
                        }
                        None => return Err(self.abnormal_exit(describe(status))),
                    }
                }
                Err(Errno::ECHILD) => {
                    return Err(self.abnormal_exit("no longer a child of this process".to_owned()))
                }
                Err(errno) => return Err(ChannelError::from(errno).into()),
            }
        };

        if !reaped {
            match waitpid(self.pid, None) {
                Ok(status) => log::debug!("child {} finished: {}", self.pid, describe(status)),
                Err(errno) => log::warn!("failed to reap child {}: {}", self.pid, errno),
            }
        }
        Ok(Message::parse(&frame)?)
    }

    fn pump_side_channels(&self) {
        for side_channel in &self.side_channels {
            side_channel.pump();
        }
    }

    fn abnormal_exit(&self, status: String) -> Error {
        log::warn!("child {} exited without an outcome: {}", self.pid, status);
        Error::AbnormalExit {
            pid: self.pid,
            status,
        }
    }
}

fn describe(status: WaitStatus) -> String {
    match status {
        WaitStatus::Exited(_, code) => format!("exit status {}", code),
        WaitStatus::Signaled(_, signal, _) => format!("killed by {}", signal),
        other => format!("{:?}", other),
    }
}
