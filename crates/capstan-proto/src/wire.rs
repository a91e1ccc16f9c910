//! SSH primitive type encoding (RFC 4251 §5)
//!
//! All multi-byte integers are big-endian. Strings are length-prefixed
//! byte blobs; name-lists are comma-separated ASCII inside a string;
//! mpints are two's-complement with a leading zero byte when the high
//! bit of the first byte is set.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::WireError;

/// Write a length-prefixed byte string
pub fn put_string(dst: &mut BytesMut, data: &[u8]) {
    dst.put_u32(data.len() as u32);
    dst.put_slice(data);
}

/// Write a length-prefixed UTF-8 string
pub fn put_str(dst: &mut BytesMut, s: &str) {
    put_string(dst, s.as_bytes());
}

/// Write a boolean as a single byte
pub fn put_bool(dst: &mut BytesMut, value: bool) {
    dst.put_u8(u8::from(value));
}

/// Write a comma-separated name-list
pub fn put_name_list(dst: &mut BytesMut, names: &[String]) {
    put_str(dst, &names.join(","));
}

/// Write a multiple-precision integer from unsigned magnitude bytes
///
/// Leading zero bytes are stripped; a zero byte is prepended when the
/// most significant bit is set so the value stays non-negative.
pub fn put_mpint(dst: &mut BytesMut, magnitude: &[u8]) {
    let mut start = 0;
    while start < magnitude.len() && magnitude[start] == 0 {
        start += 1;
    }
    let trimmed = &magnitude[start..];

    if trimmed.is_empty() {
        dst.put_u32(0);
        return;
    }

    if trimmed[0] & 0x80 != 0 {
        dst.put_u32(trimmed.len() as u32 + 1);
        dst.put_u8(0);
    } else {
        dst.put_u32(trimmed.len() as u32);
    }
    dst.put_slice(trimmed);
}

/// Read a u32, checking for truncation
pub fn get_u32(src: &mut Bytes) -> Result<u32, WireError> {
    if src.remaining() < 4 {
        return Err(WireError::Truncated);
    }
    Ok(src.get_u32())
}

/// Read a single byte
pub fn get_u8(src: &mut Bytes) -> Result<u8, WireError> {
    if !src.has_remaining() {
        return Err(WireError::Truncated);
    }
    Ok(src.get_u8())
}

/// Read a boolean byte (any non-zero value is true, per RFC 4251)
pub fn get_bool(src: &mut Bytes) -> Result<bool, WireError> {
    Ok(get_u8(src)? != 0)
}

/// Read a length-prefixed byte string
pub fn get_string(src: &mut Bytes) -> Result<Bytes, WireError> {
    let len = get_u32(src)? as usize;
    if src.remaining() < len {
        return Err(WireError::Truncated);
    }
    Ok(src.split_to(len))
}

/// Read a length-prefixed UTF-8 string
pub fn get_str(src: &mut Bytes) -> Result<String, WireError> {
    let raw = get_string(src)?;
    String::from_utf8(raw.to_vec()).map_err(|_| WireError::BadUtf8)
}

/// Read a comma-separated name-list
pub fn get_name_list(src: &mut Bytes) -> Result<Vec<String>, WireError> {
    let joined = get_str(src)?;
    if joined.is_empty() {
        return Ok(Vec::new());
    }
    Ok(joined.split(',').map(str::to_owned).collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_string_roundtrip() {
        let mut buf = BytesMut::new();
        put_string(&mut buf, b"hello");

        let mut src = buf.freeze();
        let out = get_string(&mut src).unwrap();
        assert_eq!(out.as_ref(), b"hello");
        assert!(!src.has_remaining());
    }

    #[test]
    fn test_string_truncated() {
        let mut buf = BytesMut::new();
        put_string(&mut buf, b"hello");
        buf.truncate(6);

        let mut src = buf.freeze();
        assert!(matches!(get_string(&mut src), Err(WireError::Truncated)));
    }

    #[test]
    fn test_name_list_roundtrip() {
        let names = vec!["curve25519-sha256".to_string(), "ext-info-c".to_string()];
        let mut buf = BytesMut::new();
        put_name_list(&mut buf, &names);

        let mut src = buf.freeze();
        assert_eq!(get_name_list(&mut src).unwrap(), names);
    }

    #[test]
    fn test_empty_name_list() {
        let mut buf = BytesMut::new();
        put_name_list(&mut buf, &[]);

        let mut src = buf.freeze();
        assert!(get_name_list(&mut src).unwrap().is_empty());
    }

    #[test]
    fn test_mpint_high_bit_padded() {
        let mut buf = BytesMut::new();
        put_mpint(&mut buf, &[0x80, 0x01]);

        // 3-byte body: leading zero, then the magnitude
        assert_eq!(buf.as_ref(), &[0, 0, 0, 3, 0x00, 0x80, 0x01]);
    }

    #[test]
    fn test_mpint_strips_leading_zeros() {
        let mut buf = BytesMut::new();
        put_mpint(&mut buf, &[0x00, 0x00, 0x12, 0x34]);

        assert_eq!(buf.as_ref(), &[0, 0, 0, 2, 0x12, 0x34]);
    }

    #[test]
    fn test_mpint_zero() {
        let mut buf = BytesMut::new();
        put_mpint(&mut buf, &[0x00, 0x00]);

        assert_eq!(buf.as_ref(), &[0, 0, 0, 0]);
    }
}
