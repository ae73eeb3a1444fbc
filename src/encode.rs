//! Serialize data into the management wire protocol.
use bytes::{BufMut, Bytes};

use crate::error::Result;

pub trait ToByte {
    fn encode<T: BufMut>(&self, buffer: &mut T) -> Result<()>;
}

impl<'a, T: ToByte + 'a + ?Sized> ToByte for &'a T {
    fn encode<W: BufMut>(&self, buffer: &mut W) -> Result<()> {
        (*self).encode(buffer)
    }
}

impl ToByte for bool {
    fn encode<T: BufMut>(&self, buffer: &mut T) -> Result<()> {
        buffer.put_i8(*self as i8);
        Ok(())
    }
}

impl ToByte for i8 {
    fn encode<T: BufMut>(&self, buffer: &mut T) -> Result<()> {
        buffer.put_i8(*self);
        Ok(())
    }
}

impl ToByte for i16 {
    fn encode<T: BufMut>(&self, buffer: &mut T) -> Result<()> {
        buffer.put_i16(*self);
        Ok(())
    }
}

impl ToByte for i32 {
    fn encode<T: BufMut>(&self, buffer: &mut T) -> Result<()> {
        buffer.put_i32(*self);
        Ok(())
    }
}

impl ToByte for i64 {
    fn encode<T: BufMut>(&self, buffer: &mut T) -> Result<()> {
        buffer.put_i64(*self);
        Ok(())
    }
}

impl ToByte for str {
    fn encode<T: BufMut>(&self, buffer: &mut T) -> Result<()> {
        buffer.put_i16(self.len() as i16);
        buffer.put(self.as_bytes());
        Ok(())
    }
}

impl ToByte for String {
    fn encode<T: BufMut>(&self, buffer: &mut T) -> Result<()> {
        self.as_str().encode(buffer)
    }
}

impl ToByte for Bytes {
    fn encode<T: BufMut>(&self, buffer: &mut T) -> Result<()> {
        buffer.put_i32(self.len() as i32);
        buffer.put(self.clone());
        Ok(())
    }
}

impl ToByte for [u8] {
    fn encode<T: BufMut>(&self, buffer: &mut T) -> Result<()> {
        buffer.put_i32(self.len() as i32);
        buffer.put(self);
        Ok(())
    }
}

/// Encode a nullable string.
///
/// A null string is rendered as length -1; a present string as its
/// length-prefixed UTF-8 bytes.
pub fn encode_nullable_string<W: BufMut>(s: Option<&str>, buffer: &mut W) -> Result<()> {
    match s {
        Some(val) => val.encode(buffer),
        None => (-1i16).encode(buffer),
    }
}

/// Renders the length of `xs` to `buffer` as the start of a protocol array
/// and then for each element of `xs` invokes `f` assuming that function will
/// render the element to the buffer.
pub fn encode_as_array<T, F, W>(buffer: &mut W, xs: &[T], mut f: F) -> Result<()>
where
    F: FnMut(&mut W, &T) -> Result<()>,
    W: BufMut,
{
    buffer.put_i32(xs.len() as i32);
    for x in xs {
        f(buffer, x)?;
    }
    Ok(())
}

/// Encode a slice of ToByte items as a protocol array.
pub fn encode_array<T: ToByte, W: BufMut>(buffer: &mut W, items: &[T]) -> Result<()> {
    encode_as_array(buffer, items, |buffer, x| x.encode(buffer))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_primitives() {
        let mut buf = Vec::new();
        true.encode(&mut buf).unwrap();
        (-2i8).encode(&mut buf).unwrap();
        (0x0102i16).encode(&mut buf).unwrap();
        (0x01020304i32).encode(&mut buf).unwrap();
        assert_eq!(buf, vec![1, 0xFE, 0x01, 0x02, 0x01, 0x02, 0x03, 0x04]);
    }

    #[test]
    fn encode_string_prefixes_length() {
        let mut buf = Vec::new();
        "hc01".encode(&mut buf).unwrap();
        assert_eq!(buf, vec![0, 4, b'h', b'c', b'0', b'1']);
    }

    #[test]
    fn encode_nullable_string_null() {
        let mut buf = Vec::new();
        encode_nullable_string(None, &mut buf).unwrap();
        assert_eq!(buf, vec![0xFF, 0xFF]);
    }

    #[test]
    fn encode_nullable_string_present() {
        let mut buf = Vec::new();
        encode_nullable_string(Some("x"), &mut buf).unwrap();
        assert_eq!(buf, vec![0, 1, b'x']);
    }

    #[test]
    fn encode_array_prefixes_count() {
        let mut buf = Vec::new();
        encode_array(&mut buf, &[1i16, 2, 3]).unwrap();
        assert_eq!(buf, vec![0, 0, 0, 3, 0, 1, 0, 2, 0, 3]);
    }

    #[test]
    fn encode_byte_slice() {
        let mut buf = Vec::new();
        [9u8, 8, 7].as_slice().encode(&mut buf).unwrap();
        assert_eq!(buf, vec![0, 0, 0, 3, 9, 8, 7]);
    }
}
