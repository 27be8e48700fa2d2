//! tarxfer library
//!
//! Transfers a file or a directory tree over one TCP connection as a tar
//! stream. Every file carries its MD5 as an archive attribute; the receiver
//! recomputes it while writing and answers `OK` or a mismatch message.

pub mod checksum;
pub mod cli;
pub mod error;
pub mod fs_enum;
pub mod logger;
pub mod progress;
pub mod protocol;
pub mod receiver;
pub mod sender;
pub mod server;
pub mod tar_stream;

pub use error::{ReceiveError, ServeError, TransferError};
pub use receiver::{ConnectionHandler, ReceiveOutcome};
pub use sender::{SendSummary, Sender};
pub use server::{serve, BoundServer, Server};
pub use tar_stream::{ArchiveEntry, ArchiveReader, ArchiveWriter};
