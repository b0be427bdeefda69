//! Sentinel-framed messages over a unix stream socket pair.
//!
//! Channel Design
//!
//! Both the outcome channel and the sync channel are a `socketpair(2)`
//! created before the fork. After the fork each process keeps using one half:
//! the child the `child` half, the parent the `parent` half. A message is
//! `tag,body` followed by a fixed sentinel. Writers may split a message over
//! several writes, readers accumulate bytes in a [`FrameBuffer`] until the
//! sentinel shows up; whatever follows the sentinel is the start of the next
//! message.

use std::io::{ErrorKind, Read, Write};
use std::os::fd::{AsRawFd, RawFd};
use std::os::unix::net::UnixStream;
use std::time::Duration;

use mio::unix::SourceFd;
use mio::{Events, Interest, Poll, Token};
use nix::sys::socket::{self, AddressFamily, SockFlag, SockType};

use crate::error::{ChannelError, ProtocolError};

pub const OUTCOME_SENTINEL: &[u8] = b"\n__FORKSYNC_OUTCOME_END__\n";
pub const SYNC_SENTINEL: &[u8] = b"\n__FORKSYNC_SYNC_END__\n";

const SEPARATOR: char = ',';
const CHANNEL: Token = Token(0);

/// One framed message: an action tag and its body.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Message {
    pub tag: String,
    pub body: String,
}

impl Message {
    pub fn new<T: Into<String>, B: Into<String>>(tag: T, body: B) -> Self {
        Message {
            tag: tag.into(),
            body: body.into(),
        }
    }

    /// Wire bytes of the message, sentinel included.
    pub fn encode(&self, sentinel: &[u8]) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(self.tag.len() + self.body.len() + 1 + sentinel.len());
        bytes.extend_from_slice(self.tag.as_bytes());
        bytes.push(SEPARATOR as u8);
        bytes.extend_from_slice(self.body.as_bytes());
        bytes.extend_from_slice(sentinel);
        bytes
    }

    /// Parses a frame with its sentinel already stripped. A frame without a
    /// separator is a tag with an empty body.
    pub fn parse(frame: &[u8]) -> Result<Self, ProtocolError> {
        let frame = std::str::from_utf8(frame)
            .map_err(|e| ProtocolError::Malformed(format!("frame is not utf-8: {}", e)))?;
        let (tag, body) = frame.split_once(SEPARATOR).unwrap_or((frame, ""));
        Ok(Message::new(tag, body))
    }
}

/// Splits a message body once more, for bodies carrying `name,value`.
pub fn split_body(body: &str) -> Result<(&str, &str), ProtocolError> {
    body.split_once(SEPARATOR)
        .ok_or_else(|| ProtocolError::Malformed(format!("expected 'name,value', got {:?}", body)))
}

/// Rejects names that would break the framing of a message carrying them.
pub fn check_name(name: &str) -> Result<(), ProtocolError> {
    if name.contains(SEPARATOR) || name.contains('\n') {
        return Err(ProtocolError::InvalidName(name.to_owned()));
    }
    Ok(())
}

/// Accumulates raw bytes and cuts them into frames at the sentinel.
#[derive(Debug)]
pub struct FrameBuffer {
    sentinel: &'static [u8],
    buf: Vec<u8>,
}

impl FrameBuffer {
    pub fn new(sentinel: &'static [u8]) -> Self {
        FrameBuffer {
            sentinel,
            buf: Vec::new(),
        }
    }

    pub fn extend(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    fn sentinel_position(&self) -> Option<usize> {
        self.buf
            .windows(self.sentinel.len())
            .position(|window| window == self.sentinel)
    }

    pub fn has_frame(&self) -> bool {
        self.sentinel_position().is_some()
    }

    /// Removes and returns the first complete frame, without its sentinel.
    /// Bytes after the sentinel stay buffered.
    pub fn next_frame(&mut self) -> Option<Vec<u8>> {
        let position = self.sentinel_position()?;
        let rest = self.buf.split_off(position + self.sentinel.len());
        let mut frame = std::mem::replace(&mut self.buf, rest);
        frame.truncate(position);
        Some(frame)
    }

    /// Bytes received but not yet part of a complete frame.
    pub fn pending(&self) -> &[u8] {
        &self.buf
    }
}

/// Both ends of a channel, before either process has picked its half.
pub struct SocketPair {
    pub child: UnixStream,
    pub parent: UnixStream,
}

impl SocketPair {
    pub fn new(nonblocking: bool) -> Result<Self, ChannelError> {
        let mut flags = SockFlag::SOCK_CLOEXEC;
        if nonblocking {
            flags |= SockFlag::SOCK_NONBLOCK;
        }
        let (child, parent) =
            socket::socketpair(AddressFamily::Unix, SockType::Stream, None, flags)?;
        Ok(SocketPair {
            child: UnixStream::from(child),
            parent: UnixStream::from(parent),
        })
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReadState {
    /// Everything currently available has been read.
    Drained,
    /// The peer closed its half; no more bytes will arrive.
    Closed,
}

/// Reads everything currently available from a non-blocking stream into
/// `buffer`, stopping at the first read that yields nothing.
pub fn read_available(
    stream: &mut UnixStream,
    chunk: usize,
    buffer: &mut FrameBuffer,
) -> Result<ReadState, ChannelError> {
    let mut data = vec![0u8; chunk.max(1)];
    loop {
        match stream.read(&mut data) {
            Ok(0) => return Ok(ReadState::Closed),
            Ok(n) => buffer.extend(&data[..n]),
            Err(e) if e.kind() == ErrorKind::WouldBlock => return Ok(ReadState::Drained),
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        }
    }
}

/// Writes as much of `bytes` as the stream takes right now, in writes of at
/// most `chunk` bytes, and returns how many bytes went out. Never blocks.
pub fn write_available(
    stream: &mut UnixStream,
    bytes: &[u8],
    chunk: usize,
) -> Result<usize, ChannelError> {
    let chunk = chunk.max(1);
    let mut offset = 0;
    while offset < bytes.len() {
        let end = usize::min(offset + chunk, bytes.len());
        match stream.write(&bytes[offset..end]) {
            Ok(0) => return Err(std::io::Error::from(ErrorKind::WriteZero).into()),
            Ok(n) => offset += n,
            Err(e) if e.kind() == ErrorKind::WouldBlock => break,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        }
    }
    Ok(offset)
}

/// Writes a whole encoded message in writes of at most `chunk` bytes. When
/// the peer's buffer is full the writer waits for write-readiness, at most
/// `timeout` per wait.
pub fn write_message(
    stream: &mut UnixStream,
    bytes: &[u8],
    chunk: usize,
    timeout: Duration,
) -> Result<(), ChannelError> {
    let chunk = chunk.max(1);
    let mut readiness: Option<Readiness> = None;
    let mut offset = 0;
    while offset < bytes.len() {
        let end = usize::min(offset + chunk, bytes.len());
        match stream.write(&bytes[offset..end]) {
            Ok(0) => return Err(std::io::Error::from(ErrorKind::WriteZero).into()),
            Ok(n) => offset += n,
            Err(e) if e.kind() == ErrorKind::WouldBlock => {
                if readiness.is_none() {
                    readiness = Some(Readiness::new(stream.as_raw_fd(), Interest::WRITABLE)?);
                }
                if let Some(readiness) = readiness.as_mut() {
                    if !readiness.wait(timeout)? {
                        return Err(ChannelError::Timeout(timeout));
                    }
                }
            }
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        }
    }
    Ok(())
}

/// A bounded wait for one kind of readiness on one descriptor.
pub struct Readiness {
    poll: Poll,
    events: Events,
}

impl Readiness {
    pub fn new(fd: RawFd, interest: Interest) -> Result<Self, ChannelError> {
        let poll = Poll::new()?;
        poll.registry()
            .register(&mut SourceFd(&fd), CHANNEL, interest)?;
        Ok(Readiness {
            poll,
            events: Events::with_capacity(8),
        })
    }

    /// Also wakes [`Readiness::wait`] when `fd` becomes readable. Only the
    /// first descriptor decides what `wait` returns.
    pub fn watch(&mut self, fd: RawFd, token: usize) -> Result<(), ChannelError> {
        self.poll.registry().register(
            &mut SourceFd(&fd),
            Token(token.saturating_add(1)),
            Interest::READABLE,
        )?;
        Ok(())
    }

    /// Returns false when `timeout` elapsed without the descriptor becoming
    /// ready. An interrupted wait counts as a timeout.
    pub fn wait(&mut self, timeout: Duration) -> Result<bool, ChannelError> {
        match self.poll.poll(&mut self.events, Some(timeout)) {
            Ok(()) => Ok(self.events.iter().any(|event| event.token() == CHANNEL)),
            Err(e) if e.kind() == ErrorKind::Interrupted => Ok(false),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Result;

    #[test]
    fn test_frame_reassembles_partial_reads() {
        let mut buffer = FrameBuffer::new(SYNC_SENTINEL);
        let encoded = Message::new("set", "count,{\"int\":5}").encode(SYNC_SENTINEL);
        for piece in encoded.chunks(3) {
            assert!(!buffer.has_frame());
            buffer.extend(piece);
        }
        let frame = buffer.next_frame().unwrap();
        assert_eq!(Message::parse(&frame).unwrap(), Message::new("set", "count,{\"int\":5}"));
        assert!(buffer.pending().is_empty());
        assert!(buffer.next_frame().is_none());
    }

    #[test]
    fn test_frame_back_to_back_messages() {
        let mut buffer = FrameBuffer::new(OUTCOME_SENTINEL);
        let mut bytes = Message::new("get", "a").encode(OUTCOME_SENTINEL);
        bytes.extend(Message::new("unset", "b").encode(OUTCOME_SENTINEL));
        bytes.extend_from_slice(b"isset,c\n__FORK");
        buffer.extend(&bytes);

        assert_eq!(buffer.next_frame().unwrap(), b"get,a");
        assert_eq!(buffer.next_frame().unwrap(), b"unset,b");
        assert!(buffer.next_frame().is_none());
        assert_eq!(buffer.pending(), b"isset,c\n__FORK");

        buffer.extend(&OUTCOME_SENTINEL[b"\n__FORK".len()..]);
        assert_eq!(buffer.next_frame().unwrap(), b"isset,c");
    }

    #[test]
    fn test_message_parse() -> Result<()> {
        assert_eq!(Message::parse(b"to_string")?, Message::new("to_string", ""));
        assert_eq!(Message::parse(b"to_string,")?, Message::new("to_string", ""));
        let message = Message::parse(b"call,add,{\"list\":[]}")?;
        assert_eq!(message.tag, "call");
        assert_eq!(split_body(&message.body)?, ("add", "{\"list\":[]}"));
        assert!(Message::parse(&[0xff, 0xfe]).is_err());
        assert!(split_body("no-separator").is_err());
        Ok(())
    }

    #[test]
    fn test_check_name() {
        assert!(check_name("count").is_ok());
        assert!(check_name("a,b").is_err());
        assert!(check_name("a\nb").is_err());
    }

    #[test]
    fn test_socket_pair_round_trip() -> Result<()> {
        let SocketPair {
            mut child,
            mut parent,
        } = SocketPair::new(true)?;
        let mut buffer = FrameBuffer::new(SYNC_SENTINEL);
        assert_eq!(read_available(&mut parent, 16, &mut buffer)?, ReadState::Drained);

        let message = Message::new("call", "x".repeat(100));
        write_message(&mut child, &message.encode(SYNC_SENTINEL), 7, Duration::from_millis(100))?;
        write_message(
            &mut child,
            &Message::new("get", "y").encode(SYNC_SENTINEL),
            7,
            Duration::from_millis(100),
        )?;

        assert_eq!(read_available(&mut parent, 16, &mut buffer)?, ReadState::Drained);
        assert_eq!(Message::parse(&buffer.next_frame().unwrap())?, message);
        assert_eq!(Message::parse(&buffer.next_frame().unwrap())?, Message::new("get", "y"));

        drop(child);
        assert_eq!(read_available(&mut parent, 16, &mut buffer)?, ReadState::Closed);
        Ok(())
    }

    #[test]
    fn test_write_times_out_when_peer_never_reads() -> Result<()> {
        let SocketPair { mut child, parent } = SocketPair::new(true)?;
        let bytes = vec![b'x'; 8 * 1024 * 1024];
        let ret = write_message(&mut child, &bytes, 64 * 1024, Duration::from_millis(10));
        assert!(matches!(ret, Err(ChannelError::Timeout(_))));
        drop(parent);
        Ok(())
    }

    #[test]
    fn test_write_available_stops_when_full() -> Result<()> {
        let SocketPair {
            mut child,
            mut parent,
        } = SocketPair::new(true)?;
        let bytes = vec![b'x'; 8 * 1024 * 1024];
        let written = write_available(&mut child, &bytes, 64 * 1024)?;
        assert!(written > 0 && written < bytes.len());

        let mut buffer = FrameBuffer::new(SYNC_SENTINEL);
        read_available(&mut parent, 64 * 1024, &mut buffer)?;
        assert_eq!(buffer.pending().len(), written);
        assert!(write_available(&mut child, &bytes[written..], 64 * 1024)? > 0);
        Ok(())
    }

    #[test]
    fn test_readiness_wakes_for_watched_descriptors() -> Result<()> {
        let outcome = SocketPair::new(true)?;
        let side = SocketPair::new(true)?;
        let mut readiness = Readiness::new(outcome.parent.as_raw_fd(), Interest::READABLE)?;
        readiness.watch(side.parent.as_raw_fd(), 0)?;

        (&side.child).write_all(b"sync")?;
        let started = std::time::Instant::now();
        assert!(!readiness.wait(Duration::from_secs(5))?);
        assert!(started.elapsed() < Duration::from_secs(5));
        Ok(())
    }

    #[test]
    fn test_readiness_times_out_without_data() -> Result<()> {
        let pair = SocketPair::new(true)?;
        let mut readiness = Readiness::new(pair.parent.as_raw_fd(), Interest::READABLE)?;
        assert!(!readiness.wait(Duration::from_millis(10))?);
        (&pair.child).write_all(b"ping")?;
        assert!(readiness.wait(Duration::from_millis(1000))?);
        Ok(())
    }
}
