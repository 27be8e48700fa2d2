//! Client side: walk a source path and push it to a receiver as one archive

use flate2::write::GzEncoder;
use flate2::Compression;
use std::fs::{File, Metadata};
use std::io::{self, BufWriter, Read, Write};
use std::net::{Shutdown, TcpStream};
use std::path::Path;
use std::sync::Arc;
use std::time::UNIX_EPOCH;

use crate::checksum::file_md5;
use crate::error::TransferError;
use crate::fs_enum::{enumerate_source, SourceFile};
use crate::progress::{NoProgress, ProgressFactory, ProgressReader};
use crate::protocol::{MD5_ATTRIBUTE_KEY, SUCCESS_REPLY};
use crate::tar_stream::{ArchiveEntry, ArchiveWriter};

const WRITE_BUF_SIZE: usize = 256 * 1024;

/// Totals for one completed send
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SendSummary {
    pub files: u64,
    pub bytes: u64,
}

pub struct Sender {
    progress: Arc<dyn ProgressFactory>,
}

impl Default for Sender {
    fn default() -> Self {
        Self::new(Arc::new(NoProgress))
    }
}

impl Sender {
    pub fn new(progress: Arc<dyn ProgressFactory>) -> Self {
        Self { progress }
    }

    /// Send `source` (a file or a directory tree) to the receiver at `address`.
    ///
    /// Succeeds only when the receiver replies with the success token; any
    /// other reply becomes [`TransferError::Rejected`] carrying its text.
    pub fn send(
        &self,
        source: &Path,
        address: &str,
        compress: bool,
    ) -> Result<SendSummary, TransferError> {
        let stream = TcpStream::connect(address).map_err(|source| TransferError::Connect {
            address: address.to_string(),
            source,
        })?;
        tracing::debug!(address, source = %source.display(), compress, "connected");

        let writer = BufWriter::with_capacity(WRITE_BUF_SIZE, &stream);
        let summary = if compress {
            let encoder = GzEncoder::new(writer, Compression::default());
            let (encoder, summary) = self.write_archive(source, encoder)?;
            encoder.finish()?.flush()?;
            summary
        } else {
            let (mut writer, summary) = self.write_archive(source, writer)?;
            writer.flush()?;
            summary
        };
        stream.shutdown(Shutdown::Write)?;

        let mut reply = Vec::new();
        (&stream).read_to_end(&mut reply)?;
        let reply = String::from_utf8_lossy(&reply).into_owned();
        if reply == SUCCESS_REPLY {
            tracing::debug!(files = summary.files, bytes = summary.bytes, "receiver confirmed");
            Ok(summary)
        } else {
            Err(TransferError::Rejected(reply))
        }
    }

    fn write_archive<W: Write>(
        &self,
        source: &Path,
        sink: W,
    ) -> Result<(W, SendSummary), TransferError> {
        let mut archive = ArchiveWriter::new(sink);
        let mut summary = SendSummary::default();
        for file in enumerate_source(source) {
            let file = file?;
            summary.bytes += self.send_file(&mut archive, &file)?;
            summary.files += 1;
        }
        let sink = archive.finish()?;
        Ok((sink, summary))
    }

    // Checksum pass and transfer pass are two separate reads of the file.
    fn send_file<W: Write>(
        &self,
        archive: &mut ArchiveWriter<W>,
        file: &SourceFile,
    ) -> Result<u64, TransferError> {
        let read_err = |source: io::Error| TransferError::ReadSource {
            path: file.path.clone(),
            source,
        };
        let digest = file_md5(&file.path).map_err(read_err)?;
        let handle = File::open(&file.path).map_err(read_err)?;
        let meta = handle.metadata().map_err(read_err)?;
        let size = meta.len();

        let entry = ArchiveEntry::new(file.relative.clone(), size)
            .with_mode(mode_of(&meta))
            .with_mtime(mtime_of(&meta))
            .with_attribute(MD5_ATTRIBUTE_KEY, digest);
        archive.begin_entry(&entry)?;

        let mut progress = self.progress.start(&file.relative, size);
        let copied = {
            let mut reader = ProgressReader::new(handle.take(size), progress.as_mut());
            io::copy(&mut reader, archive)
        };
        progress.finish();
        let copied = copied?;
        if copied < size {
            return Err(read_err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!("file shrank while sending: {} of {} bytes", copied, size),
            )));
        }
        tracing::trace!(path = %file.relative, bytes = copied, "entry written");
        Ok(copied)
    }
}

#[cfg(unix)]
fn mode_of(meta: &Metadata) -> u32 {
    use std::os::unix::fs::PermissionsExt;
    meta.permissions().mode() & 0o7777
}

#[cfg(not(unix))]
fn mode_of(_meta: &Metadata) -> u32 {
    0o644
}

fn mtime_of(meta: &Metadata) -> u64 {
    meta.modified()
        .ok()
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map(|d| d.as_secs())
        .unwrap_or(0)
}
