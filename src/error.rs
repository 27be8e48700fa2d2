//! Error types for the sender, the connection handler and the listener

use std::io;
use std::path::PathBuf;

/// Failure of one `Sender::send` call.
#[derive(Debug, thiserror::Error)]
pub enum TransferError {
    #[error("failed to connect to {address}: {source}")]
    Connect {
        address: String,
        #[source]
        source: io::Error,
    },

    #[error("cannot read {}: {source}", path.display())]
    ReadSource {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to walk source tree: {0}")]
    Walk(#[from] walkdir::Error),

    #[error("path is not valid UTF-8: {}", .0.display())]
    InvalidPath(PathBuf),

    #[error("I/O error on connection: {0}")]
    Io(#[from] io::Error),

    /// The receiver answered with something other than the success token.
    #[error("{0}")]
    Rejected(String),
}

/// Failure while decoding or materializing one inbound stream.
#[derive(Debug, thiserror::Error)]
pub enum ReceiveError {
    #[error("malformed transfer stream: {0}")]
    Framing(#[source] io::Error),

    #[error("refusing unsafe entry path {0:?}")]
    UnsafePath(String),

    #[error("cannot write {}: {source}", path.display())]
    Filesystem {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("I/O error on connection: {0}")]
    Connection(#[source] io::Error),
}

/// Failure of the accept loop.
#[derive(Debug, thiserror::Error)]
pub enum ServeError {
    #[error("failed to bind {address}: {source}")]
    Bind {
        address: String,
        #[source]
        source: io::Error,
    },

    #[error("accept failed: {0}")]
    Accept(#[source] io::Error),

    #[error("listener cancelled")]
    Cancelled,
}
