//! Streaming tar codec for transfer archives
//!
//! Entries are written and read one at a time, so neither side ever holds
//! more than a header block and a copy buffer in memory. Per-entry
//! attributes ride in PAX extended headers as `SCHILY.xattr.<key>` records,
//! which keeps the stream readable by stock tar tools.

use std::collections::BTreeMap;
use std::io::{self, Read, Write};

use tar::{EntryType, Header};

use crate::protocol::PAX_XATTR_PREFIX;

const BLOCK_SIZE: u64 = 512;
const ZERO_BLOCK: [u8; 512] = [0u8; 512];

// Upper bound for PAX and GNU long-name payloads we are willing to buffer
const MAX_META_SIZE: u64 = 1024 * 1024;

const PAX_HEADER_NAME: &str = "@PaxHeader";
const PAX_PATH: &str = "path";
const PAX_SIZE: &str = "size";

/// One framed file record: metadata plus attribute map. The body travels
/// separately through the writer/reader `Write`/`Read` impls.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveEntry {
    /// Forward-slash separated path relative to the transfer base
    pub path: String,
    pub size: u64,
    pub mode: u32,
    pub mtime: u64,
    pub attributes: BTreeMap<String, String>,
}

impl ArchiveEntry {
    pub fn new(path: impl Into<String>, size: u64) -> Self {
        Self {
            path: path.into(),
            size,
            mode: 0o644,
            mtime: 0,
            attributes: BTreeMap::new(),
        }
    }

    pub fn with_mode(mut self, mode: u32) -> Self {
        self.mode = mode;
        self
    }

    pub fn with_mtime(mut self, mtime: u64) -> Self {
        self.mtime = mtime;
        self
    }

    pub fn with_attribute(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes.insert(key.into(), value.into());
        self
    }

    pub fn attribute(&self, key: &str) -> Option<&str> {
        self.attributes.get(key).map(String::as_str)
    }
}

fn padding_for(size: u64) -> u64 {
    (BLOCK_SIZE - size % BLOCK_SIZE) % BLOCK_SIZE
}

// Body plus block padding, refusing sizes that would wrap.
fn padded_size(size: u64) -> io::Result<u64> {
    size.checked_add(padding_for(size))
        .ok_or_else(|| invalid_data("entry size overflows"))
}

fn invalid_data(msg: impl Into<String>) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, msg.into())
}

fn invalid_input(msg: impl Into<String>) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidInput, msg.into())
}

/// Encode one PAX record: `"<len> <key>=<value>\n"`, where len counts itself.
fn pax_record(key: &str, value: &str) -> Vec<u8> {
    let base = key.len() + value.len() + 3;
    let mut len = base;
    loop {
        let total = base + len.to_string().len();
        if total == len {
            break;
        }
        len = total;
    }
    format!("{} {}={}\n", len, key, value).into_bytes()
}

fn parse_pax_records(data: &[u8], out: &mut BTreeMap<String, String>) -> io::Result<()> {
    let mut rest = data;
    while !rest.is_empty() {
        // Trailing NUL padding is tolerated
        if rest.iter().all(|b| *b == 0) {
            break;
        }
        let space = rest
            .iter()
            .position(|b| *b == b' ')
            .ok_or_else(|| invalid_data("malformed pax record: missing length"))?;
        let len: usize = std::str::from_utf8(&rest[..space])
            .ok()
            .and_then(|s| s.parse().ok())
            .ok_or_else(|| invalid_data("malformed pax record: bad length"))?;
        if len <= space + 1 || len > rest.len() || rest[len - 1] != b'\n' {
            return Err(invalid_data("malformed pax record: bad framing"));
        }
        let kv = &rest[space + 1..len - 1];
        let eq = kv
            .iter()
            .position(|b| *b == b'=')
            .ok_or_else(|| invalid_data("malformed pax record: missing '='"))?;
        let key = String::from_utf8(kv[..eq].to_vec())
            .map_err(|_| invalid_data("pax key is not UTF-8"))?;
        let value = String::from_utf8(kv[eq + 1..].to_vec())
            .map_err(|_| invalid_data("pax value is not UTF-8"))?;
        out.insert(key, value);
        rest = &rest[len..];
    }
    Ok(())
}

fn header_checksum_ok(block: &[u8; 512], header: &Header) -> bool {
    let computed: u32 = block
        .iter()
        .enumerate()
        .map(|(i, b)| if (148..156).contains(&i) { b' ' as u32 } else { *b as u32 })
        .sum();
    matches!(header.cksum(), Ok(stored) if stored == computed)
}

// Copy as much of `path` as fits in the 100-byte ustar name field.
fn set_truncated_name(header: &mut Header, path: &str) {
    let mut cut = path.len().min(100);
    while !path.is_char_boundary(cut) {
        cut -= 1;
    }
    if let Some(ustar) = header.as_ustar_mut() {
        ustar.prefix.fill(0);
    }
    let name = &mut header.as_old_mut().name;
    name.fill(0);
    name[..cut].copy_from_slice(&path.as_bytes()[..cut]);
}

/// Sequential archive writer.
///
/// Call [`begin_entry`](Self::begin_entry), write exactly `size` body
/// bytes through the `Write` impl, repeat, then [`finish`](Self::finish).
pub struct ArchiveWriter<W: Write> {
    inner: W,
    remaining: u64,
    padding: u64,
}

impl<W: Write> ArchiveWriter<W> {
    pub fn new(inner: W) -> Self {
        Self {
            inner,
            remaining: 0,
            padding: 0,
        }
    }

    /// Write the header block(s) for a new entry.
    pub fn begin_entry(&mut self, entry: &ArchiveEntry) -> io::Result<()> {
        self.close_entry()?;
        if entry.path.is_empty() {
            return Err(invalid_input("entry path is empty"));
        }

        let mut records: Vec<u8> = Vec::new();
        for (key, value) in &entry.attributes {
            if key.is_empty() || key.contains(['=', '\n', '\0']) {
                return Err(invalid_input(format!("invalid attribute key {:?}", key)));
            }
            records.extend(pax_record(&format!("{}{}", PAX_XATTR_PREFIX, key), value));
        }

        let mut header = Header::new_ustar();
        if header.set_path(&entry.path).is_err() {
            records.extend(pax_record(PAX_PATH, &entry.path));
            set_truncated_name(&mut header, &entry.path);
        }
        header.set_size(entry.size);
        header.set_mode(entry.mode);
        header.set_mtime(entry.mtime);
        header.set_entry_type(EntryType::Regular);
        header.set_cksum();

        if !records.is_empty() {
            let mut pax = Header::new_ustar();
            pax.set_path(PAX_HEADER_NAME)?;
            pax.set_size(records.len() as u64);
            pax.set_mode(0o644);
            pax.set_mtime(entry.mtime);
            pax.set_entry_type(EntryType::XHeader);
            pax.set_cksum();
            self.inner.write_all(pax.as_bytes())?;
            self.inner.write_all(&records)?;
            let pad = padding_for(records.len() as u64) as usize;
            self.inner.write_all(&ZERO_BLOCK[..pad])?;
        }

        self.inner.write_all(header.as_bytes())?;
        self.remaining = entry.size;
        self.padding = padding_for(entry.size);
        Ok(())
    }

    fn close_entry(&mut self) -> io::Result<()> {
        if self.remaining > 0 {
            return Err(invalid_input(format!(
                "entry body incomplete: {} bytes missing",
                self.remaining
            )));
        }
        if self.padding > 0 {
            self.inner.write_all(&ZERO_BLOCK[..self.padding as usize])?;
            self.padding = 0;
        }
        Ok(())
    }

    /// Pad the last body, write the end-of-archive marker and hand back the sink.
    pub fn finish(mut self) -> io::Result<W> {
        self.close_entry()?;
        self.inner.write_all(&ZERO_BLOCK)?;
        self.inner.write_all(&ZERO_BLOCK)?;
        self.inner.flush()?;
        Ok(self.inner)
    }
}

impl<W: Write> Write for ArchiveWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        if self.remaining == 0 {
            return Err(invalid_input("write past end of entry"));
        }
        let max = buf.len().min(self.remaining.min(usize::MAX as u64) as usize);
        let n = self.inner.write(&buf[..max])?;
        self.remaining -= n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

/// Sequential archive reader.
///
/// [`next_entry`](Self::next_entry) yields headers; the `Read` impl yields
/// the current entry's body and reports EOF after exactly `size` bytes.
pub struct ArchiveReader<R: Read> {
    inner: R,
    remaining: u64,
    padding: u64,
    done: bool,
}

impl<R: Read> ArchiveReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            remaining: 0,
            padding: 0,
            done: false,
        }
    }

    /// Next file entry, or `None` once the end marker has been read.
    pub fn next_entry(&mut self) -> io::Result<Option<ArchiveEntry>> {
        if self.done {
            return Ok(None);
        }
        let unread = self
            .remaining
            .checked_add(self.padding)
            .ok_or_else(|| invalid_data("entry size overflows"))?;
        self.skip(unread)?;
        self.remaining = 0;
        self.padding = 0;

        let mut pax = BTreeMap::new();
        let mut long_name: Option<String> = None;
        let mut block = [0u8; 512];
        loop {
            if !self.read_block(&mut block)? {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "archive ended without end-of-stream marker",
                ));
            }
            if block.iter().all(|b| *b == 0) {
                // Second zero block is optional on read
                if self.read_block(&mut block)? && block.iter().any(|b| *b != 0) {
                    return Err(invalid_data("unexpected data after end-of-stream marker"));
                }
                self.done = true;
                return Ok(None);
            }

            let header = Header::from_byte_slice(&block);
            if !header_checksum_ok(&block, header) {
                return Err(invalid_data("tar header checksum mismatch"));
            }
            let size = header.entry_size()?;

            match header.entry_type() {
                EntryType::XHeader => {
                    let data = self.read_meta(size)?;
                    parse_pax_records(&data, &mut pax)?;
                }
                EntryType::XGlobalHeader => {
                    self.read_meta(size)?;
                }
                EntryType::GNULongName => {
                    let data = self.read_meta(size)?;
                    let end = data.iter().position(|b| *b == 0).unwrap_or(data.len());
                    long_name = Some(
                        String::from_utf8(data[..end].to_vec())
                            .map_err(|_| invalid_data("long name is not UTF-8"))?,
                    );
                }
                EntryType::Directory => {
                    self.skip(padded_size(size)?)?;
                    pax.clear();
                    long_name = None;
                }
                EntryType::Regular | EntryType::Continuous => {
                    let path = match pax.remove(PAX_PATH).or(long_name) {
                        Some(p) => p,
                        None => String::from_utf8(header.path_bytes().into_owned())
                            .map_err(|_| invalid_data("entry path is not UTF-8"))?,
                    };
                    let size = match pax.remove(PAX_SIZE) {
                        Some(s) => s
                            .parse()
                            .map_err(|_| invalid_data(format!("bad pax size {:?}", s)))?,
                        None => size,
                    };
                    padded_size(size)?;
                    let attributes = pax
                        .into_iter()
                        .filter_map(|(k, v)| {
                            k.strip_prefix(PAX_XATTR_PREFIX).map(|k| (k.to_string(), v))
                        })
                        .collect();

                    self.remaining = size;
                    self.padding = padding_for(size);
                    return Ok(Some(ArchiveEntry {
                        path,
                        size,
                        mode: header.mode().unwrap_or(0o644),
                        mtime: header.mtime().unwrap_or(0),
                        attributes,
                    }));
                }
                other => {
                    return Err(invalid_data(format!("unsupported entry type {:?}", other)));
                }
            }
        }
    }

    // Ok(false) on clean EOF before the first byte; partial blocks are errors.
    fn read_block(&mut self, block: &mut [u8; 512]) -> io::Result<bool> {
        let mut filled = 0;
        while filled < block.len() {
            match self.inner.read(&mut block[filled..]) {
                Ok(0) if filled == 0 => return Ok(false),
                Ok(0) => {
                    return Err(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "truncated tar header block",
                    ))
                }
                Ok(n) => filled += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e),
            }
        }
        Ok(true)
    }

    fn read_meta(&mut self, size: u64) -> io::Result<Vec<u8>> {
        if size > MAX_META_SIZE {
            return Err(invalid_data(format!("extended header too large: {} bytes", size)));
        }
        let mut data = vec![0u8; size as usize];
        self.inner.read_exact(&mut data)?;
        self.skip(padding_for(size))?;
        Ok(data)
    }

    fn skip(&mut self, n: u64) -> io::Result<()> {
        if n == 0 {
            return Ok(());
        }
        let skipped = io::copy(&mut (&mut self.inner).take(n), &mut io::sink())?;
        if skipped < n {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "archive truncated inside entry",
            ));
        }
        Ok(())
    }
}

impl<R: Read> Read for ArchiveReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.remaining == 0 || buf.is_empty() {
            return Ok(0);
        }
        let max = buf.len().min(self.remaining.min(usize::MAX as u64) as usize);
        let n = self.inner.read(&mut buf[..max])?;
        if n == 0 {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!("entry body truncated: {} bytes missing", self.remaining),
            ));
        }
        self.remaining -= n as u64;
        Ok(n)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_archive(entries: &[(ArchiveEntry, &[u8])]) -> Vec<u8> {
        let mut writer = ArchiveWriter::new(Vec::new());
        for (entry, body) in entries {
            writer.begin_entry(entry).unwrap();
            writer.write_all(body).unwrap();
        }
        writer.finish().unwrap()
    }

    #[test]
    fn test_entries_and_attributes_survive() {
        let first = ArchiveEntry::new("subdirectory/a_file.txt", 13)
            .with_mtime(1_600_000_000)
            .with_attribute("md5", "eb9c2bf0eb63f3a7bc0ea37ef18aeba5");
        let second = ArchiveEntry::new("empty", 0).with_mode(0o600);
        let bytes = write_archive(&[(first.clone(), &b"some content\n"[..]), (second.clone(), &b""[..])]);
        assert_eq!(bytes.len() % 512, 0);

        let mut reader = ArchiveReader::new(&bytes[..]);
        let got = reader.next_entry().unwrap().unwrap();
        assert_eq!(got, first);
        let mut body = String::new();
        reader.read_to_string(&mut body).unwrap();
        assert_eq!(body, "some content\n");

        assert_eq!(reader.next_entry().unwrap().unwrap(), second);
        assert!(reader.next_entry().unwrap().is_none());
        assert!(reader.next_entry().unwrap().is_none());
    }

    #[test]
    fn test_unread_body_is_skipped() {
        let bytes = write_archive(&[
            (ArchiveEntry::new("a", 600), &[7u8; 600][..]),
            (ArchiveEntry::new("b", 2), &b"hi"[..]),
        ]);
        let mut reader = ArchiveReader::new(&bytes[..]);
        assert_eq!(reader.next_entry().unwrap().unwrap().path, "a");
        let mut partial = [0u8; 10];
        reader.read_exact(&mut partial).unwrap();
        assert_eq!(reader.next_entry().unwrap().unwrap().path, "b");
    }

    #[test]
    fn test_long_path_goes_through_pax() {
        let long = format!("{}/file.txt", "d".repeat(300));
        let bytes = write_archive(&[(ArchiveEntry::new(long.clone(), 1), &b"x"[..])]);
        let mut reader = ArchiveReader::new(&bytes[..]);
        assert_eq!(reader.next_entry().unwrap().unwrap().path, long);
    }

    #[test]
    fn test_write_past_entry_size_fails() {
        let mut writer = ArchiveWriter::new(Vec::new());
        writer.begin_entry(&ArchiveEntry::new("a", 3)).unwrap();
        let err = writer.write_all(b"four").unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
    }

    #[test]
    fn test_short_body_rejected_on_next_entry_and_finish() {
        let mut writer = ArchiveWriter::new(Vec::new());
        writer.begin_entry(&ArchiveEntry::new("a", 3)).unwrap();
        writer.write_all(b"ab").unwrap();
        let err = writer.begin_entry(&ArchiveEntry::new("b", 0)).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
        assert!(writer.finish().is_err());
    }

    #[test]
    fn test_truncated_body_is_framing_error() {
        let bytes = write_archive(&[(ArchiveEntry::new("a", 1000), &[1u8; 1000][..])]);
        let cut = &bytes[..512 + 100];
        let mut reader = ArchiveReader::new(cut);
        reader.next_entry().unwrap().unwrap();
        let err = reader.read_to_end(&mut Vec::new()).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    }

    #[test]
    fn test_missing_end_marker_is_framing_error() {
        let bytes = write_archive(&[(ArchiveEntry::new("a", 1), &b"z"[..])]);
        let without_marker = &bytes[..bytes.len() - 1024];
        let mut reader = ArchiveReader::new(without_marker);
        reader.next_entry().unwrap().unwrap();
        let err = reader.next_entry().unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    }

    #[test]
    fn test_corrupt_header_checksum() {
        let mut bytes = write_archive(&[(ArchiveEntry::new("a", 1), &b"z"[..])]);
        bytes[0] = b'b';
        let err = ArchiveReader::new(&bytes[..]).next_entry().unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[test]
    fn test_stock_tar_reads_our_stream() {
        let entry = ArchiveEntry::new("d1/b.txt", 4).with_attribute("md5", "abc");
        let bytes = write_archive(&[(entry, &b"data"[..])]);

        let mut archive = tar::Archive::new(&bytes[..]);
        let mut seen = 0;
        for file in archive.entries().unwrap() {
            let mut file = file.unwrap();
            assert_eq!(file.path().unwrap().to_str(), Some("d1/b.txt"));
            let md5 = file
                .pax_extensions()
                .unwrap()
                .unwrap()
                .filter_map(|ext| ext.ok())
                .find(|ext| ext.key() == Ok("SCHILY.xattr.md5"))
                .map(|ext| ext.value().unwrap().to_string());
            assert_eq!(md5.as_deref(), Some("abc"));
            let mut body = String::new();
            file.read_to_string(&mut body).unwrap();
            assert_eq!(body, "data");
            seen += 1;
        }
        assert_eq!(seen, 1);
    }

    #[test]
    fn test_reads_stock_tar_builder_output() {
        let mut builder = tar::Builder::new(Vec::new());
        let mut header = tar::Header::new_gnu();
        header.set_size(4);
        header.set_mode(0o644);
        builder
            .append_data(&mut header, "dir/x.txt", &b"data"[..])
            .unwrap();
        let bytes = builder.into_inner().unwrap();

        let mut reader = ArchiveReader::new(&bytes[..]);
        let entry = reader.next_entry().unwrap().unwrap();
        assert_eq!(entry.path, "dir/x.txt");
        assert_eq!(entry.size, 4);
        assert!(entry.attributes.is_empty());
        assert!(reader.next_entry().unwrap().is_none());
    }

    // Header whose base-256 `size` field is all ones, with a valid checksum
    fn oversized_header(entry_type: EntryType) -> [u8; 512] {
        let mut header = Header::new_gnu();
        header.set_path("huge").unwrap();
        header.set_entry_type(entry_type);
        header.as_gnu_mut().unwrap().size = [0xff; 12];
        header.set_cksum();
        *header.as_bytes()
    }

    #[test]
    fn test_directory_size_overflow_is_framing_error() {
        let mut bytes = oversized_header(EntryType::Directory).to_vec();
        bytes.extend_from_slice(&[0u8; 1024]);
        let err = ArchiveReader::new(&bytes[..]).next_entry().unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[test]
    fn test_pax_size_overflow_is_framing_error() {
        let records = pax_record(PAX_SIZE, &u64::MAX.to_string());
        let mut pax = Header::new_ustar();
        pax.set_path(PAX_HEADER_NAME).unwrap();
        pax.set_size(records.len() as u64);
        pax.set_entry_type(EntryType::XHeader);
        pax.set_cksum();
        let mut file = Header::new_ustar();
        file.set_path("huge").unwrap();
        file.set_size(0);
        file.set_entry_type(EntryType::Regular);
        file.set_cksum();

        let mut bytes = pax.as_bytes().to_vec();
        bytes.extend_from_slice(&records);
        bytes.resize(1024, 0);
        bytes.extend_from_slice(file.as_bytes());
        bytes.extend_from_slice(&[0u8; 1024]);

        let err = ArchiveReader::new(&bytes[..]).next_entry().unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[test]
    fn test_attribute_keys_that_break_records_are_refused() {
        for key in ["a=b", "line\nbreak", ""] {
            let mut writer = ArchiveWriter::new(Vec::new());
            let entry = ArchiveEntry::new("a", 0).with_attribute(key, "v");
            let err = writer.begin_entry(&entry).unwrap_err();
            assert_eq!(err.kind(), io::ErrorKind::InvalidInput, "{key:?}");
        }
    }

    #[test]
    fn test_pax_record_length_counts_itself() {
        let rec = pax_record("path", "abc");
        assert_eq!(rec, b"12 path=abc\n");
        let mut map = BTreeMap::new();
        parse_pax_records(&rec, &mut map).unwrap();
        assert_eq!(map.get("path").map(String::as_str), Some("abc"));
    }
}
