use anyhow::Result;
use chrono::Utc;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Mutex;

/// Transfer event sink for the receiving side
pub trait Logger: Send + Sync {
    fn connection(&self, _peer: &SocketAddr) {}
    fn file_saved(&self, _peer: &SocketAddr, _path: &Path, _bytes: u64) {}
    fn mismatch(&self, _peer: &SocketAddr, _path: &Path, _expected: &str, _actual: &str) {}
    fn error(&self, _peer: &SocketAddr, _msg: &str) {}
    fn done(&self, _peer: &SocketAddr, _files: u64, _bytes: u64, _seconds: f64) {}
}

pub struct NoopLogger;
impl Logger for NoopLogger {}

/// Append-only, timestamped text log
pub struct TextLogger {
    file: Mutex<File>,
}

impl TextLogger {
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self> {
        if let Some(parent) = path.as_ref().parent() {
            std::fs::create_dir_all(parent).ok();
        }
        let f = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            file: Mutex::new(f),
        })
    }

    fn line(&self, s: &str) {
        if let Ok(mut f) = self.file.lock() {
            let _ = writeln!(f, "[{}] {}", Utc::now().to_rfc3339(), s);
        }
    }
}

impl Logger for TextLogger {
    fn connection(&self, peer: &SocketAddr) {
        self.line(&format!("CONNECT peer={}", peer));
    }
    fn file_saved(&self, peer: &SocketAddr, path: &Path, bytes: u64) {
        self.line(&format!(
            "SAVE peer={} path={} bytes={}",
            peer,
            path.display(),
            bytes
        ));
    }
    fn mismatch(&self, peer: &SocketAddr, path: &Path, expected: &str, actual: &str) {
        self.line(&format!(
            "MISMATCH peer={} path={} expected={} got={}",
            peer,
            path.display(),
            expected,
            actual
        ));
    }
    fn error(&self, peer: &SocketAddr, msg: &str) {
        self.line(&format!("ERROR peer={} msg={}", peer, msg));
    }
    fn done(&self, peer: &SocketAddr, files: u64, bytes: u64, seconds: f64) {
        self.line(&format!(
            "DONE peer={peer} files={files} bytes={bytes} seconds={seconds:.3}"
        ));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn text_logger_appends_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("logs/transfers.log");
        let peer: SocketAddr = "127.0.0.1:4000".parse().unwrap();

        let logger = TextLogger::new(&path).unwrap();
        logger.connection(&peer);
        logger.file_saved(&peer, Path::new("/dst/a.txt"), 13);
        logger.done(&peer, 1, 13, 0.5);

        let text = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 3);
        assert!(lines[0].ends_with("CONNECT peer=127.0.0.1:4000"));
        assert!(lines[1].ends_with("SAVE peer=127.0.0.1:4000 path=/dst/a.txt bytes=13"));
        assert!(lines[2].ends_with("DONE peer=127.0.0.1:4000 files=1 bytes=13 seconds=0.500"));
    }
}
