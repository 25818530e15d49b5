//! LEB128 variable-length unsigned integers (7 bits per byte, low groups first).

use std::io::{self, Read};

/// Longest encoding of a `u64`.
pub const MAX_VARINT_LEN: usize = 10;

/// Appends the encoding of `value` to `buf`.
pub fn encode(buf: &mut Vec<u8>, mut value: u64) {
    while value >= 0x80 {
        buf.push((value as u8 & 0x7f) | 0x80);
        value >>= 7;
    }
    buf.push(value as u8);
}

/// Number of bytes [`encode`] produces for `value`.
#[must_use]
pub fn encoded_len(mut value: u64) -> usize {
    let mut len = 1;
    while value >= 0x80 {
        value >>= 7;
        len += 1;
    }
    len
}

/// Reads one varint.
///
/// Returns `Ok(None)` if the reader is exhausted before the first byte, and
/// `UnexpectedEof` if it ends in the middle of an encoding.
pub fn read<R: Read>(r: &mut R) -> io::Result<Option<u64>> {
    let mut value = 0u64;
    let mut byte = [0u8; 1];
    for i in 0..MAX_VARINT_LEN {
        match r.read(&mut byte) {
            Ok(0) if i == 0 => return Ok(None),
            Ok(0) => return Err(io::ErrorKind::UnexpectedEof.into()),
            Ok(_) => {}
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {
                return read_rest(r, value, i);
            }
            Err(e) => return Err(e),
        }
        value |= u64::from(byte[0] & 0x7f) << (7 * i);
        if byte[0] & 0x80 == 0 {
            return Ok(Some(value));
        }
    }
    Err(io::Error::new(io::ErrorKind::InvalidData, "varint too long"))
}

// Interrupted reads are retried from the group they stopped at.
fn read_rest<R: Read>(r: &mut R, mut value: u64, start: usize) -> io::Result<Option<u64>> {
    let mut byte = [0u8; 1];
    for i in start..MAX_VARINT_LEN {
        r.read_exact(&mut byte)?;
        value |= u64::from(byte[0] & 0x7f) << (7 * i);
        if byte[0] & 0x80 == 0 {
            return Ok(Some(value));
        }
    }
    Err(io::Error::new(io::ErrorKind::InvalidData, "varint too long"))
}

/// Reads one varint that must be present.
pub fn read_required<R: Read>(r: &mut R) -> io::Result<u64> {
    read(r)?.ok_or_else(|| io::ErrorKind::UnexpectedEof.into())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn small_values_take_one_byte() {
        let mut buf = Vec::new();
        encode(&mut buf, 0);
        encode(&mut buf, 127);
        assert_eq!(buf, vec![0, 127]);
        assert_eq!(encoded_len(127), 1);
        assert_eq!(encoded_len(128), 2);
    }

    #[test]
    fn decodes_what_it_encodes() {
        let values = [0u64, 1, 300, 16_384, u32::MAX as u64, u64::MAX];
        let mut buf = Vec::new();
        for v in values {
            encode(&mut buf, v);
        }
        assert_eq!(encoded_len(u64::MAX), MAX_VARINT_LEN);
        let mut r = buf.as_slice();
        for v in values {
            assert_eq!(read(&mut r).unwrap(), Some(v));
        }
        assert_eq!(read(&mut r).unwrap(), None);
    }

    #[test]
    fn truncated_varint_is_unexpected_eof() {
        let mut r: &[u8] = &[0x80, 0x80];
        let err = read(&mut r).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    }

    #[test]
    fn overlong_varint_is_invalid() {
        let data = [0xffu8; 11];
        let mut r: &[u8] = &data;
        let err = read(&mut r).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }
}
