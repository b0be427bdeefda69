use std::io::ErrorKind;
use std::os::fd::{AsRawFd, RawFd};
use std::os::unix::net::UnixStream;
use std::time::Duration;

use crate::channel::{
    read_available, write_available, write_message, FrameBuffer, Message, ReadState, SocketPair,
    SYNC_SENTINEL,
};
use crate::config::Config;
use crate::error::{ChannelError, Result};
use crate::process::Side;
use crate::sanitize::Sanitizer;

use super::message::Operation;

// Sync messages are small; large values are written in pieces of this size.
const WRITE_CHUNK: usize = 8192;

/// One process's end of the sync channel of a stand-in.
///
/// The socket pair is created with the endpoint, before any fork, with both
/// halves non-blocking. Until a fork is observed the endpoint is disabled and
/// owns both halves; [`SyncEndpoint::activate`] keeps the half of the side
/// this process ended up on and closes the other one, so that the peer
/// exiting shows up as end of stream.
///
/// Sending never waits for the peer. Whatever the socket does not take right
/// away stays in an outbox and goes out on later sends, receives, or the
/// bounded [`SyncEndpoint::flush`] run before a child reports its outcome.
#[derive(Debug)]
pub struct SyncEndpoint {
    depth: usize,
    side: Side,
    parent: Option<UnixStream>,
    child: Option<UnixStream>,
    buffer: FrameBuffer,
    outbox: Vec<u8>,
    config: Config,
    sanitizer: Sanitizer,
}

impl SyncEndpoint {
    pub fn new(config: Config, sanitizer: Sanitizer) -> std::result::Result<Self, ChannelError> {
        let SocketPair { child, parent } = SocketPair::new(true)?;
        Ok(SyncEndpoint::with_halves(
            Side::Parent,
            Some(parent),
            Some(child),
            config,
            sanitizer,
        ))
    }

    fn with_halves(
        side: Side,
        parent: Option<UnixStream>,
        child: Option<UnixStream>,
        config: Config,
        sanitizer: Sanitizer,
    ) -> Self {
        SyncEndpoint {
            depth: 0,
            side,
            parent,
            child,
            buffer: FrameBuffer::new(SYNC_SENTINEL),
            outbox: Vec::new(),
            config,
            sanitizer,
        }
    }

    /// Both ends of one channel as the parent and the child hold them after
    /// a fork, in a single process. Both start disabled.
    pub fn pair(
        config: Config,
        sanitizer: Sanitizer,
    ) -> std::result::Result<(Self, Self), ChannelError> {
        let SocketPair { child, parent } = SocketPair::new(true)?;
        let parent = SyncEndpoint::with_halves(
            Side::Parent,
            Some(parent),
            None,
            config.clone(),
            sanitizer.clone(),
        );
        let child = SyncEndpoint::with_halves(Side::Child, None, Some(child), config, sanitizer);
        Ok((parent, child))
    }

    /// A fresh, disabled endpoint with the same settings.
    pub fn detached(&self) -> std::result::Result<Self, ChannelError> {
        SyncEndpoint::new(self.config.clone(), self.sanitizer.clone())
    }

    /// Called once per observed fork, on each side of it.
    pub fn activate(&mut self, side: Side) {
        self.side = side;
        match side {
            Side::Parent => self.child = None,
            Side::Child => {
                self.parent = None;
                // Bytes queued before the fork were meant for our own parent.
                self.outbox.clear();
            }
        }
        self.depth += 1;
        log::debug!("sync endpoint activated on {:?} side, depth {}", side, self.depth);
    }

    pub fn enable(&mut self) {
        self.depth += 1;
    }

    /// Suspends mirroring once the depth drops to zero. State already
    /// applied locally stays.
    pub fn disable(&mut self) {
        self.depth = self.depth.saturating_sub(1);
    }

    pub fn depth(&self) -> usize {
        self.depth
    }

    pub fn is_enabled(&self) -> bool {
        self.depth > 0
    }

    pub fn side(&self) -> Side {
        self.side
    }

    pub fn sanitizer(&self) -> &Sanitizer {
        &self.sanitizer
    }

    /// Bytes sent but not yet taken by the socket.
    pub fn queued(&self) -> usize {
        self.outbox.len()
    }

    /// Descriptor of the half this process uses.
    pub fn raw_fd(&self) -> Option<RawFd> {
        let stream = match self.side {
            Side::Parent => self.parent.as_ref(),
            Side::Child => self.child.as_ref(),
        };
        stream.map(AsRawFd::as_raw_fd)
    }

    /// Pushes out queued bytes and reads whatever the peer has sent so far
    /// into the frame buffer. Never blocks.
    pub fn receive(&mut self) -> Result<ReadState> {
        self.push_queued();
        let chunk = self.config.read_chunk;
        let stream = match self.side {
            Side::Parent => self.parent.as_mut(),
            Side::Child => self.child.as_mut(),
        };
        let state = match stream {
            Some(stream) => read_available(stream, chunk, &mut self.buffer)?,
            None => ReadState::Closed,
        };
        if state == ReadState::Closed {
            log::trace!("sync peer closed its half");
        }
        Ok(state)
    }

    /// Takes the oldest complete message off the frame buffer. Later
    /// messages stay buffered whatever happens to this one.
    pub fn next_operation(&mut self) -> Result<Option<Operation>> {
        let Some(frame) = self.buffer.next_frame() else {
            return Ok(None);
        };
        let message = Message::parse(&frame)?;
        Ok(Some(Operation::decode(&message)?))
    }

    /// Receives and decodes every complete message, oldest first.
    pub fn drain(&mut self) -> Result<Vec<Operation>> {
        self.receive()?;
        let mut ops = Vec::new();
        while let Some(op) = self.next_operation()? {
            ops.push(op);
        }
        Ok(ops)
    }

    /// Queues an already encoded operation for the peer and sends as much of
    /// the queue as the socket takes without waiting.
    pub fn send(&mut self, message: &Message) {
        if self.raw_fd().is_none() {
            return;
        }
        self.outbox.extend(message.encode(SYNC_SENTINEL));
        self.push_queued();
        if !self.outbox.is_empty() {
            log::trace!("{} bytes queued for the sync peer", self.outbox.len());
        }
    }

    /// Encodes and sends `op`.
    pub fn mirror(&mut self, op: &Operation) -> Result<()> {
        let message = op.encode(&self.sanitizer)?;
        self.send(&message);
        Ok(())
    }

    /// Sends everything still queued, waiting at most `timeout` each time
    /// the peer stops taking bytes. What cannot be sent is dropped.
    pub fn flush(&mut self, timeout: Duration) {
        if self.outbox.is_empty() {
            return;
        }
        let stream = match self.side {
            Side::Parent => self.parent.as_mut(),
            Side::Child => self.child.as_mut(),
        };
        let ret = match stream {
            Some(stream) => write_message(stream, &self.outbox, WRITE_CHUNK, timeout),
            None => Ok(()),
        };
        match ret {
            Ok(()) => self.outbox.clear(),
            Err(err) => self.discard_queued(err),
        }
    }

    fn push_queued(&mut self) {
        if self.outbox.is_empty() {
            return;
        }
        let stream = match self.side {
            Side::Parent => self.parent.as_mut(),
            Side::Child => self.child.as_mut(),
        };
        let Some(stream) = stream else {
            self.outbox.clear();
            return;
        };
        match write_available(stream, &self.outbox, WRITE_CHUNK) {
            Ok(n) => {
                self.outbox.drain(..n);
            }
            Err(err) => self.discard_queued(err),
        }
    }

    // A peer that has gone away is not an error: there is nobody left to
    // mirror to.
    fn discard_queued(&mut self, err: ChannelError) {
        match &err {
            ChannelError::Io(io) if io.kind() == ErrorKind::BrokenPipe => {
                log::debug!("sync peer is gone, dropping {} bytes", self.outbox.len())
            }
            _ => log::warn!(
                "failed to mirror to the sync peer, dropping {} bytes: {}",
                self.outbox.len(),
                err
            ),
        }
        self.outbox.clear();
    }
}
