//! Checksum and hashing utilities

use std::fs::File;
use std::io::{self, Read, Write};
use std::path::Path;

/// Incremental MD5 over a byte stream of any length
pub struct Md5Hasher {
    ctx: md5::Context,
}

impl Md5Hasher {
    pub fn new() -> Self {
        Self {
            ctx: md5::Context::new(),
        }
    }

    pub fn update(&mut self, data: &[u8]) {
        self.ctx.consume(data);
    }

    /// Lowercase hex digest of everything fed so far
    pub fn finish_hex(self) -> String {
        format!("{:x}", self.ctx.compute())
    }
}

impl Default for Md5Hasher {
    fn default() -> Self {
        Self::new()
    }
}

impl Write for Md5Hasher {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.update(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Writer that hashes exactly the bytes its inner writer accepted, in order.
///
/// Drop this into `io::copy` as the destination to checksum a body while
/// it lands on disk.
pub struct HashingWriter<W: Write> {
    inner: W,
    hasher: Md5Hasher,
}

impl<W: Write> HashingWriter<W> {
    pub fn new(inner: W) -> Self {
        Self {
            inner,
            hasher: Md5Hasher::new(),
        }
    }

    /// Returns the inner writer and the hex digest.
    pub fn finish(self) -> (W, String) {
        (self.inner, self.hasher.finish_hex())
    }
}

impl<W: Write> Write for HashingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.hasher.update(&buf[..n]);
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

/// Hex MD5 of an in-memory buffer
pub fn md5_hex(data: &[u8]) -> String {
    format!("{:x}", md5::compute(data))
}

/// Hex MD5 of any reader, consumed to its end
pub fn reader_md5<R: Read>(mut reader: R) -> io::Result<String> {
    let mut hasher = Md5Hasher::new();
    io::copy(&mut reader, &mut hasher)?;
    Ok(hasher.finish_hex())
}

/// Hex MD5 of a file's full contents
pub fn file_md5(path: &Path) -> io::Result<String> {
    reader_md5(File::open(path)?)
}
