use bytes::{Buf, BufMut, Bytes, BytesMut};
use num_traits::PrimInt;
use std::fmt::Debug;

use crate::memory::PointerSizeT;

/// A 16:16 far pointer, selector in the high word.
pub type SegPtr = u32;

/// Align a value down to the specified alignment boundary. If `value` is already
/// aligned, the same value is returned.
///
/// Args:
/// value: a value to align
/// alignment: alignment boundary; must be a power of 2.
///
/// Returns: value aligned down to boundary
pub fn align<T>(value: T, alignment: impl Into<T>) -> T
where
    T: PrimInt + Debug,
{
    let alignment = alignment.into();
    let mask = alignment - T::one();
    debug_assert_eq!(alignment & mask, T::zero());
    // round down to nearest alignment
    value & (!mask)
}

pub fn align_up<T>(value: T, alignment: impl Into<T>) -> T
where
    T: PrimInt + Debug,
{
    let alignment = alignment.into();
    let mask = alignment - T::one();
    debug_assert_eq!(alignment & mask, T::zero());
    // round up to nearest alignment
    (value + mask) & (!mask)
}

pub const fn make_segptr(selector: u16, offset: u16) -> SegPtr {
    ((selector as u32) << 16) | offset as u32
}

pub const fn selector_of(ptr: SegPtr) -> u16 {
    (ptr >> 16) as u16
}

pub const fn offset_of(ptr: SegPtr) -> u16 {
    ptr as u16
}

pub const fn loword(v: u32) -> u16 {
    v as u16
}

pub const fn hiword(v: u32) -> u16 {
    (v >> 16) as u16
}

/// Read a little-endian word, `None` when it would run past the slice.
pub fn peek_u16(data: &[u8], off: usize) -> Option<u16> {
    let b = data.get(off..off.checked_add(2)?)?;
    Some(u16::from_le_bytes([b[0], b[1]]))
}

pub fn peek_u32(data: &[u8], off: usize) -> Option<u32> {
    let b = data.get(off..off.checked_add(4)?)?;
    Some(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
}

/// Length-prefixed string at `off`; the slice excludes the length byte.
pub fn pascal_str(data: &[u8], off: usize) -> Option<&[u8]> {
    let len = *data.get(off)? as usize;
    data.get(off + 1..off + 1 + len)
}

/// Case-insensitive compare in the legacy code page sense: only ASCII letters fold.
pub fn eq_ignore_case(a: &[u8], b: &[u8]) -> bool {
    a.eq_ignore_ascii_case(b)
}

/// Parse the `#NNN` spelling used for integer names. Returns `None` if `s` is not of
/// that form; the digits are accumulated without overflow checks, like the legacy
/// `atoi` based parsers did.
pub fn parse_int_name(s: &str) -> Option<u32> {
    let digits = s.strip_prefix('#')?;
    if !digits.bytes().all(|c| c.is_ascii_digit()) {
        return None;
    }
    Some(
        digits
            .bytes()
            .fold(0u32, |acc, c| acc.wrapping_mul(10).wrapping_add((c - b'0') as u32)),
    )
}

/// Leading decimal digits of `s`, 0 if there are none.
pub fn atoi(s: &str) -> u32 {
    s.bytes()
        .take_while(u8::is_ascii_digit)
        .fold(0u32, |acc, c| acc.wrapping_mul(10).wrapping_add((c - b'0') as u32))
}

/// Bytes up to the first NUL.
pub fn c_str(data: &[u8]) -> &[u8] {
    let end = data.iter().position(|&b| b == 0).unwrap_or(data.len());
    &data[..end]
}

/// Last path component, accepting both separators.
pub fn basename(path: &str) -> &str {
    path.rsplit(|c| c == '\\' || c == '/').next().unwrap_or(path)
}

/// Little-endian integer packer for patch sites of arbitrary width.
pub struct Packer {
    pointer_size: usize,
}

impl Packer {
    pub fn new(pointer_size: PointerSizeT) -> Self {
        Self {
            pointer_size: pointer_size as usize,
        }
    }
    pub fn pack(&self, v: u64) -> Vec<u8> {
        let mut buf = BytesMut::new();
        buf.put_uint_le(v, self.pointer_size);
        buf.to_vec()
    }
    pub fn unpack(&self, data: Vec<u8>) -> u64 {
        let mut data = Bytes::from(data);
        data.get_uint_le(self.pointer_size)
    }
}

#[cfg(test)]
mod test {
    use super::{align, align_up, atoi, basename, c_str, parse_int_name, Packer};

    #[test]
    pub fn test_align() {
        let para = 0x20;

        {
            assert_eq!(align(0x0011, para), 0x0000);
            assert_eq!(align(0x0020, para), 0x0020);
            assert_eq!(align(0x0021, para), 0x0020);
        }

        {
            assert_eq!(align_up(0x0001, para), 0x0020);
            assert_eq!(align_up(0x0020, para), 0x0020);
            assert_eq!(align_up(0x0021, para), 0x0040);
            assert_eq!(align_up(0x1001u32, 0x1000u32), 0x2000);
        }
    }

    #[test]
    fn test_int_names() {
        assert_eq!(parse_int_name("#123"), Some(123));
        assert_eq!(parse_int_name("#"), Some(0));
        assert_eq!(parse_int_name("#12a"), None);
        assert_eq!(parse_int_name("abc"), None);
        assert_eq!(atoi("12a"), 12);
        assert_eq!(atoi("x"), 0);
    }

    #[test]
    fn test_paths() {
        assert_eq!(basename("C:\\WINDOWS\\SYSTEM\\USER.EXE"), "USER.EXE");
        assert_eq!(basename("/tmp/app.exe"), "app.exe");
        assert_eq!(basename("plain"), "plain");
        assert_eq!(c_str(b"abc\0def"), b"abc");
    }

    #[test]
    fn test_packer() {
        let p = Packer::new(3);
        let bytes = p.pack(0x00abcdef);
        assert_eq!(bytes, vec![0xef, 0xcd, 0xab]);
        assert_eq!(p.unpack(bytes), 0xabcdef);
    }
}
