//! Shared protocol constants for the tarxfer wire format

/// Attribute key carrying the sender's lowercase hex MD5 of an entry body.
pub const MD5_ATTRIBUTE_KEY: &str = "md5";

/// Reply written by the receiver once every entry verified.
pub const SUCCESS_REPLY: &str = "OK";

/// First two bytes of a gzip member. A ustar header never starts with them.
pub const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

// PAX record prefix used for per-entry attributes (same key layout GNU tar uses for xattrs)
pub const PAX_XATTR_PREFIX: &str = "SCHILY.xattr.";

/// Build the reply sent when a received body does not hash to the attached value.
pub fn mismatch_reply(expected: &str, actual: &str) -> String {
    format!("md5 does not match: expected {}, got {}", expected, actual)
}

/// True when the stream prefix looks like gzip output.
pub fn is_gzip(prefix: &[u8]) -> bool {
    prefix.len() >= 2 && prefix[..2] == GZIP_MAGIC
}
