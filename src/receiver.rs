//! Server side of one connection: decode the archive, write files under
//! the destination root, verify each body against its attached MD5 and
//! answer with a single reply.

use filetime::{set_file_mtime, FileTime};
use flate2::read::GzDecoder;
use std::fs::{self, File};
use std::io::{self, BufReader, BufWriter, Cursor, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpStream};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::checksum::HashingWriter;
use crate::error::ReceiveError;
use crate::logger::{Logger, NoopLogger};
use crate::protocol::{is_gzip, mismatch_reply, MD5_ATTRIBUTE_KEY, SUCCESS_REPLY};
use crate::tar_stream::{ArchiveEntry, ArchiveReader};

const IO_BUF_SIZE: usize = 256 * 1024;

// Bounds on the post-reply drain, so a peer that never half-closes
// cannot pin the handler thread.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);
const DRAIN_LIMIT: u64 = 64 * 1024 * 1024;

/// How a stream ended when it ended without a connection-level fault
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReceiveOutcome {
    /// End marker reached, every entry matched its checksum
    Verified { files: u64, bytes: u64 },
    /// Processing stopped at this entry; its file stays on disk
    Mismatch {
        path: PathBuf,
        expected: String,
        actual: String,
    },
}

impl ReceiveOutcome {
    pub fn reply(&self) -> String {
        match self {
            ReceiveOutcome::Verified { .. } => SUCCESS_REPLY.to_string(),
            ReceiveOutcome::Mismatch {
                expected, actual, ..
            } => mismatch_reply(expected, actual),
        }
    }
}

/// Map an archive path onto the destination root.
///
/// Empty and `.` segments are dropped, a leading `/` is ignored and any
/// `..` segment is refused.
pub fn resolve_under_root(root: &Path, rel: &str) -> Result<PathBuf, ReceiveError> {
    let mut joined = root.to_path_buf();
    let mut pushed = false;
    for seg in rel.split('/') {
        match seg {
            "" | "." => {}
            ".." => return Err(ReceiveError::UnsafePath(rel.to_string())),
            s => {
                if s.contains('\0') {
                    return Err(ReceiveError::UnsafePath(rel.to_string()));
                }
                #[cfg(windows)]
                if s.contains(':') || s.contains('\\') {
                    return Err(ReceiveError::UnsafePath(rel.to_string()));
                }
                joined.push(s);
                pushed = true;
            }
        }
    }
    if !pushed {
        return Err(ReceiveError::UnsafePath(rel.to_string()));
    }
    Ok(joined)
}

/// Per-connection receiver, cheap to clone into each handler thread
#[derive(Clone)]
pub struct ConnectionHandler {
    destination: Arc<PathBuf>,
    logger: Arc<dyn Logger>,
}

impl ConnectionHandler {
    pub fn new(destination: impl Into<PathBuf>) -> Self {
        Self {
            destination: Arc::new(destination.into()),
            logger: Arc::new(NoopLogger),
        }
    }

    pub fn with_logger(mut self, logger: Arc<dyn Logger>) -> Self {
        self.logger = logger;
        self
    }

    pub fn destination(&self) -> &Path {
        &self.destination
    }

    /// Serve one accepted connection to completion, then close it.
    ///
    /// Errors are logged and isolated here; nothing propagates to the
    /// accept loop.
    pub fn handle(&self, stream: TcpStream) {
        let peer = stream
            .peer_addr()
            .unwrap_or_else(|_| SocketAddr::from(([0, 0, 0, 0], 0)));
        let started = Instant::now();
        self.logger.connection(&peer);
        tracing::debug!(peer = %peer, "connection accepted");

        let outcome = match self.receive(&stream, &peer) {
            Ok(outcome) => outcome,
            Err(e) => {
                tracing::error!(peer = %peer, error = %e, "transfer aborted");
                self.logger.error(&peer, &e.to_string());
                return;
            }
        };

        if let Err(e) = reply_and_close(&stream, outcome.reply().as_bytes(), DRAIN_TIMEOUT) {
            tracing::warn!(peer = %peer, error = %e, "failed to deliver reply");
            self.logger.error(&peer, &format!("reply failed: {}", e));
        }
        if let ReceiveOutcome::Verified { files, bytes } = outcome {
            let seconds = started.elapsed().as_secs_f64();
            tracing::info!(peer = %peer, files, bytes, seconds, "transfer complete");
            self.logger.done(&peer, files, bytes, seconds);
        }
    }

    /// Decode the whole inbound stream, plain or gzip-wrapped.
    pub fn receive(
        &self,
        stream: &TcpStream,
        peer: &SocketAddr,
    ) -> Result<ReceiveOutcome, ReceiveError> {
        let mut input = BufReader::with_capacity(IO_BUF_SIZE, stream);
        let mut magic = [0u8; 2];
        input.read_exact(&mut magic).map_err(ReceiveError::Framing)?;
        let prefixed = Cursor::new(magic).chain(input);

        if is_gzip(&magic) {
            tracing::debug!(peer = %peer, "gzip stream detected");
            self.receive_entries(ArchiveReader::new(GzDecoder::new(prefixed)), peer)
        } else {
            self.receive_entries(ArchiveReader::new(prefixed), peer)
        }
    }

    fn receive_entries<R: Read>(
        &self,
        mut archive: ArchiveReader<R>,
        peer: &SocketAddr,
    ) -> Result<ReceiveOutcome, ReceiveError> {
        let mut files = 0u64;
        let mut bytes = 0u64;
        while let Some(entry) = archive.next_entry().map_err(ReceiveError::Framing)? {
            let path = resolve_under_root(&self.destination, &entry.path)?;
            tracing::info!(peer = %peer, path = %path.display(), "saving file");
            let actual = save_entry(&mut archive, &entry, &path)?;
            files += 1;
            bytes += entry.size;
            self.logger.file_saved(peer, &path, entry.size);

            let expected = entry.attribute(MD5_ATTRIBUTE_KEY).unwrap_or_default();
            if !expected.eq_ignore_ascii_case(&actual) {
                tracing::warn!(peer = %peer, path = %path.display(), expected, actual = %actual, "md5 does not match");
                self.logger.mismatch(peer, &path, expected, &actual);
                return Ok(ReceiveOutcome::Mismatch {
                    path,
                    expected: expected.to_string(),
                    actual,
                });
            }
        }
        Ok(ReceiveOutcome::Verified { files, bytes })
    }
}

// Copy the current body to `path`, hashing what lands on disk.
fn save_entry<R: Read>(
    body: &mut R,
    entry: &ArchiveEntry,
    path: &Path,
) -> Result<String, ReceiveError> {
    let fs_err = |p: &Path| {
        let p = p.to_path_buf();
        move |source| ReceiveError::Filesystem { path: p, source }
    };
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(fs_err(parent))?;
    }
    let file = File::create(path).map_err(fs_err(path))?;
    let mut out = HashingWriter::new(BufWriter::with_capacity(IO_BUF_SIZE, file));

    let mut buf = vec![0u8; IO_BUF_SIZE];
    loop {
        let n = match body.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(ReceiveError::Framing(e)),
        };
        out.write_all(&buf[..n]).map_err(fs_err(path))?;
    }
    let (mut writer, digest) = out.finish();
    writer.flush().map_err(fs_err(path))?;
    drop(writer);

    if entry.mtime > 0 {
        let mtime = FileTime::from_unix_time(entry.mtime as i64, 0);
        if let Err(e) = set_file_mtime(path, mtime) {
            tracing::debug!(path = %path.display(), error = %e, "could not preserve mtime");
        }
    }
    Ok(digest)
}

// The reply is the last thing written. Afterwards drain whatever the sender
// still has in flight so closing does not turn into a reset that eats it.
fn reply_and_close(stream: &TcpStream, reply: &[u8], drain_timeout: Duration) -> io::Result<()> {
    let mut writer = stream;
    writer.write_all(reply)?;
    writer.flush()?;
    stream.shutdown(Shutdown::Write)?;

    // The reply is out; a drain that stalls or overruns only ends the wait.
    stream.set_read_timeout(Some(drain_timeout))?;
    let mut rest = Read::take(stream, DRAIN_LIMIT);
    if let Err(e) = io::copy(&mut rest, &mut io::sink()) {
        tracing::debug!(error = %e, "stopped draining after reply");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_joins_segments() {
        let root = Path::new("/dst");
        assert_eq!(
            resolve_under_root(root, "d1/d2/c.txt").unwrap(),
            root.join("d1").join("d2").join("c.txt")
        );
        assert_eq!(
            resolve_under_root(root, "/./a.txt").unwrap(),
            root.join("a.txt")
        );
    }

    #[test]
    fn test_resolve_rejects_escape_and_empty() {
        let root = Path::new("/dst");
        for bad in ["../x", "a/../../x", "", "/", "./"] {
            assert!(
                matches!(resolve_under_root(root, bad), Err(ReceiveError::UnsafePath(_))),
                "{bad:?} should be refused"
            );
        }
    }

    #[test]
    fn test_outcome_replies() {
        assert_eq!(ReceiveOutcome::Verified { files: 1, bytes: 2 }.reply(), "OK");
        let mismatch = ReceiveOutcome::Mismatch {
            path: PathBuf::from("a"),
            expected: "wrong".into(),
            actual: "eb9c2bf0eb63f3a7bc0ea37ef18aeba5".into(),
        };
        assert_eq!(
            mismatch.reply(),
            "md5 does not match: expected wrong, got eb9c2bf0eb63f3a7bc0ea37ef18aeba5"
        );
    }

    #[test]
    fn test_drain_gives_up_on_silent_peer() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let mut client = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let (server, _) = listener.accept().unwrap();

        let (tx, rx) = std::sync::mpsc::channel();
        std::thread::spawn(move || {
            let result = reply_and_close(&server, b"OK", Duration::from_millis(200));
            let _ = tx.send(result.is_ok());
        });

        let mut reply = [0u8; 2];
        client.read_exact(&mut reply).unwrap();
        assert_eq!(&reply, b"OK");
        // client stays open without half-closing
        assert!(rx.recv_timeout(Duration::from_secs(10)).unwrap());
        drop(client);
    }

    #[test]
    fn test_save_entry_hashes_and_creates_parents() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sub/dir/a_file.txt");
        let entry = ArchiveEntry::new("sub/dir/a_file.txt", 13).with_mtime(1_500_000_000);
        let digest = save_entry(&mut &b"some content\n"[..], &entry, &path).unwrap();
        assert_eq!(digest, "eb9c2bf0eb63f3a7bc0ea37ef18aeba5");
        assert_eq!(fs::read(&path).unwrap(), b"some content\n");
        let meta = fs::metadata(&path).unwrap();
        assert_eq!(FileTime::from_last_modification_time(&meta).unix_seconds(), 1_500_000_000);
    }
}
