use nix::unistd::Pid;

use crate::process::ChildError;

/// Failures of the byte-stream transport underneath both channels.
#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    #[error("failed unix syscalls")]
    Nix(#[from] nix::Error),
    #[error("failed channel io")]
    Io(#[from] std::io::Error),
    #[error("peer did not become ready within {0:?}")]
    Timeout(std::time::Duration),
    #[error("child reported an error that could not be reconstructed")]
    InvalidRaised,
}

/// The bytes arrived but do not form a message this side understands.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("unknown action '{0}'")]
    UnknownAction(String),
    #[error("malformed message: {0}")]
    Malformed(String),
    #[error("failed serde serialization")]
    Serde(#[from] serde_json::Error),
    #[error("member name {0:?} cannot be framed")]
    InvalidName(String),
    #[error("value cannot be sent across processes: {0}")]
    NotTransferable(&'static str),
}

/// A target refused an operation applied to it, locally or on replay.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TargetError {
    #[error("no member named '{0}'")]
    UnknownMember(String),
    #[error("no method named '{0}'")]
    UnknownMethod(String),
    #[error("method '{method}' expects an argument at position {position}")]
    MissingArgument { method: String, position: usize },
    #[error("expected {expected}, found {found}")]
    TypeMismatch {
        expected: &'static str,
        found: &'static str,
    },
    #[error("target is not invokable")]
    NotInvokable,
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("failed to spawn child process")]
    Spawn(#[source] nix::Error),
    #[error(transparent)]
    Channel(#[from] ChannelError),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error("child process {pid} exited without reporting an outcome ({status})")]
    AbnormalExit { pid: Pid, status: String },
    #[error("child process raised: {0}")]
    Raised(ChildError),
    #[error(transparent)]
    Target(#[from] TargetError),
}

impl Error {
    /// The error raised by the child callable, if this is one.
    pub fn raised(&self) -> Option<&ChildError> {
        match self {
            Error::Raised(err) => Some(err),
            _ => None,
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Protocol(ProtocolError::Serde(err))
    }
}

pub type Result<T> = std::result::Result<T, Error>;
