//! Error taxonomy for the gfmd replication core.
//!
//! Errors come in two families. [`ChannelError`] is the small, closed set
//! that actually crosses the wire as a reply `errcode`. [`GfmdError`] is the
//! richer process-local error used by library code; most of its variants map
//! onto a [`ChannelError`] via [`GfmdError::to_channel_error`].
//!
//! Programming errors (bad downcast, double free, closing an unknown fd) are
//! not represented here: per the error handling design they abort the
//! process via `panic!` rather than propagating as a `Result`.

use std::io;
use thiserror::Error;

/// The closed set of error codes that can appear in a gfmd channel response.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelError {
    #[error("no error")]
    NoError,
    #[error("journal reader expired")]
    Expired,
    #[error("invalid remote peer")]
    InvalidRemotePeer,
    #[error("operation not permitted")]
    OperationNotPermitted,
    #[error("operation timed out")]
    OperationTimedOut,
    #[error("connection aborted")]
    ConnectionAborted,
    #[error("unexpected eof")]
    UnexpectedEof,
    #[error("protocol error")]
    Protocol,
    #[error("no such object")]
    NoSuchObject,
    #[error("no memory")]
    NoMemory,
}

impl ChannelError {
    /// `true` only for [`ChannelError::NoError`].
    #[must_use]
    pub const fn is_success(self) -> bool {
        matches!(self, Self::NoError)
    }

    /// Numeric code used on the wire.
    #[must_use]
    pub const fn code(self) -> i32 {
        match self {
            Self::NoError => 0,
            Self::Expired => 1,
            Self::InvalidRemotePeer => 2,
            Self::OperationNotPermitted => 3,
            Self::OperationTimedOut => 4,
            Self::ConnectionAborted => 5,
            Self::UnexpectedEof => 6,
            Self::Protocol => 7,
            Self::NoSuchObject => 8,
            Self::NoMemory => 9,
        }
    }

    /// Decode a wire error code. Unknown codes collapse to `Protocol` rather
    /// than panicking, since a peer on a different version may send a code
    /// we don't recognize.
    #[must_use]
    pub const fn from_code(code: i32) -> Self {
        match code {
            0 => Self::NoError,
            1 => Self::Expired,
            2 => Self::InvalidRemotePeer,
            3 => Self::OperationNotPermitted,
            4 => Self::OperationTimedOut,
            5 => Self::ConnectionAborted,
            6 => Self::UnexpectedEof,
            8 => Self::NoSuchObject,
            9 => Self::NoMemory,
            _ => Self::Protocol,
        }
    }
}

/// Main error type for gfmd replication-core operations.
#[derive(Error, Debug)]
pub enum GfmdError {
    /// IO error during socket or file operations.
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// The remote side reported a channel-level error.
    #[error("channel error: {0}")]
    Channel(ChannelError),

    /// Framing was violated: short read, oversized frame, bad header.
    #[error("protocol framing error: {0}")]
    Framing(String),

    /// A peer could not be found by id (remote-peer lookups).
    #[error("unknown peer id {0}")]
    UnknownPeer(u64),

    /// A host could not be found in the registry by name.
    #[error("unknown host: {0}")]
    UnknownHost(String),

    /// A host with this name is already registered.
    #[error("host already exists: {0}")]
    HostExists(String),

    /// A synchronous send did not complete before its deadline.
    #[error("operation timed out after {0:?}")]
    TimedOut(std::time::Duration),

    /// The journal reader could not be reopened at the requested cursor
    /// because the on-disk log no longer covers it.
    #[error("journal reader expired for host {0}")]
    ReaderExpired(String),

    /// Attempted a mutating operation while the local node is read-only.
    #[error("operation not permitted: node is read-only")]
    ReadOnly,

    /// A local-fatal condition: the caller should exit the process.
    #[error("fatal error: {0}")]
    Fatal(String),
}

impl GfmdError {
    /// Construct a channel-error-carrying variant.
    pub const fn channel(e: ChannelError) -> Self {
        Self::Channel(e)
    }

    /// Construct a framing error with a message.
    pub fn framing(msg: impl Into<String>) -> Self {
        Self::Framing(msg.into())
    }

    /// Map this error onto the closed wire vocabulary for a channel reply.
    #[must_use]
    pub fn to_channel_error(&self) -> ChannelError {
        match self {
            Self::Channel(e) => *e,
            Self::Io(e) if e.kind() == io::ErrorKind::UnexpectedEof => ChannelError::UnexpectedEof,
            Self::Io(e) if e.kind() == io::ErrorKind::TimedOut => ChannelError::OperationTimedOut,
            Self::Io(_) => ChannelError::ConnectionAborted,
            Self::Framing(_) => ChannelError::Protocol,
            Self::UnknownPeer(_) => ChannelError::InvalidRemotePeer,
            Self::UnknownHost(_) | Self::HostExists(_) => ChannelError::NoSuchObject,
            Self::TimedOut(_) => ChannelError::OperationTimedOut,
            Self::ReaderExpired(_) => ChannelError::Expired,
            Self::ReadOnly => ChannelError::OperationNotPermitted,
            Self::Fatal(_) => ChannelError::ConnectionAborted,
        }
    }

    /// Transient errors are logged and cause a single peer to be
    /// disconnected; they never fail an in-progress commit.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::TimedOut(_) | Self::Io(_))
    }

    /// Slave-fatal errors require an administrator to re-seed the slave.
    #[must_use]
    pub const fn is_slave_fatal(&self) -> bool {
        matches!(self, Self::ReaderExpired(_) | Self::Framing(_))
    }
}

/// Result type alias for gfmd replication-core operations.
pub type Result<T> = std::result::Result<T, GfmdError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn channel_error_round_trips_through_code() {
        for e in [
            ChannelError::NoError,
            ChannelError::Expired,
            ChannelError::InvalidRemotePeer,
            ChannelError::OperationNotPermitted,
            ChannelError::OperationTimedOut,
            ChannelError::ConnectionAborted,
            ChannelError::UnexpectedEof,
            ChannelError::Protocol,
            ChannelError::NoSuchObject,
            ChannelError::NoMemory,
        ] {
            assert_eq!(ChannelError::from_code(e.code()), e);
        }
    }

    #[test]
    fn unknown_code_collapses_to_protocol() {
        assert_eq!(ChannelError::from_code(999), ChannelError::Protocol);
    }

    #[test]
    fn reader_expired_maps_to_expired_and_is_slave_fatal() {
        let err = GfmdError::ReaderExpired("slave1".into());
        assert_eq!(err.to_channel_error(), ChannelError::Expired);
        assert!(err.is_slave_fatal());
        assert!(!err.is_transient());
    }

    #[test]
    fn timeout_is_transient() {
        let err = GfmdError::TimedOut(std::time::Duration::from_secs(5));
        assert!(err.is_transient());
        assert_eq!(err.to_channel_error(), ChannelError::OperationTimedOut);
    }
}
