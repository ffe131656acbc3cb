use bytes::{Buf, BufMut, BytesMut};
use bytes_varint::{VarIntSupport, VarIntSupportMut};
use crate::error::{Result, TransportError};

pub fn put_string(buf: &mut BytesMut, s: &str) {
    buf.put_usize_varint(s.len());
    buf.put_slice(s.as_bytes());
}

pub fn try_get_string(buf: &mut impl Buf) -> Result<String> {
    let len = buf.try_get_usize_varint()?;
    if buf.remaining() < len {
        return Err(TransportError::malformed(format!("string of length {} exceeds buffer", len)));
    }

    let mut raw = vec![0u8; len];
    buf.copy_to_slice(&mut raw);
    String::from_utf8(raw)
        .map_err(|_| TransportError::malformed("string is not valid UTF-8"))
}
