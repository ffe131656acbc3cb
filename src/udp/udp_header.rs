use bytes::{Buf, BufMut, BytesMut};
use bytes_varint::try_get_fixed::TryGetFixedSupport;
use uuid::Uuid;
use crate::error::{Result, TransportError};
use crate::util::safe_converter::PrecheckedCast;

/// The header of every UDP datagram:
///
/// ```ascii
/// 0: magic code (u8)
/// 1: stream id (16 bytes)
/// 17: chunk number (i32 BE)
/// ```
///
/// The chunk number is the chunk's zero-based index plus one, negated for the stream's last
///  chunk. So there is no length field: the receiver knows a stream is complete when it has
///  the negative chunk and all chunks before it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UdpHeader {
    pub stream_id: Uuid,
    pub chunk_number: i32,
}

impl UdpHeader {
    pub const MAGIC: u8 = 0x5a;
    pub const SERIALIZED_LEN: usize = 21;

    /// the largest chunk index that can be encoded
    pub const MAX_CHUNK_INDEX: usize = i32::MAX as usize - 1;

    pub fn new(stream_id: Uuid, chunk_index: usize, is_last: bool) -> Result<UdpHeader> {
        if chunk_index > Self::MAX_CHUNK_INDEX {
            return Err(TransportError::Logic(format!("chunk index {} exceeds the maximum of {}", chunk_index, Self::MAX_CHUNK_INDEX)));
        }

        let magnitude: i32 = (chunk_index + 1).prechecked_cast();
        Ok(UdpHeader {
            stream_id,
            chunk_number: if is_last { -magnitude } else { magnitude },
        })
    }

    pub fn chunk_index(&self) -> usize {
        self.chunk_number.unsigned_abs() as usize - 1
    }

    pub fn is_last(&self) -> bool {
        self.chunk_number < 0
    }

    pub fn ser(&self, buf: &mut impl BufMut) {
        buf.put_u8(Self::MAGIC);
        buf.put_slice(self.stream_id.as_bytes());
        buf.put_i32(self.chunk_number);
    }

    pub fn try_deser(buf: &mut impl Buf) -> Result<UdpHeader> {
        if buf.remaining() < Self::SERIALIZED_LEN {
            return Err(TransportError::malformed(format!("datagram of {} bytes is too short for a header", buf.remaining())));
        }

        let magic = buf.try_get_u8()?;
        if magic != Self::MAGIC {
            return Err(TransportError::malformed(format!("invalid magic code {:x}", magic)));
        }
        let stream_id = Uuid::from_u128(buf.try_get_u128()?);
        let chunk_number = buf.try_get_i32()?;
        if chunk_number == 0 || chunk_number == i32::MIN {
            return Err(TransportError::malformed(format!("invalid chunk number {}", chunk_number)));
        }

        Ok(UdpHeader {
            stream_id,
            chunk_number,
        })
    }

    /// The number of datagrams needed for `len` bytes. Every stream ends with a chunk that is
    ///  shorter than `chunk_payload_len`, so a stream whose length is a multiple of the chunk
    ///  size ends with an empty chunk.
    pub fn num_chunks(len: usize, chunk_payload_len: usize) -> Result<usize> {
        let result = len / chunk_payload_len + 1;
        if result - 1 > Self::MAX_CHUNK_INDEX {
            return Err(TransportError::Logic(format!("stream of {} bytes needs more than the maximum of {} chunks", len, Self::MAX_CHUNK_INDEX + 1)));
        }
        Ok(result)
    }
}


/// Sent in compatibility mode at the start of every stream, identifying the sender independent
///  of its socket address. `skip_len` bytes follow that the receiver ignores.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompatibilityPrefix {
    pub host_id: Uuid,
    pub unique_id: u32,
    pub skip_len: u16,
}

impl CompatibilityPrefix {
    pub const MIN_SERIALIZED_LEN: usize = 22;

    pub fn new(host_id: Uuid, unique_id: u32) -> CompatibilityPrefix {
        CompatibilityPrefix {
            host_id,
            unique_id,
            skip_len: 0,
        }
    }

    pub fn ser(&self, buf: &mut BytesMut) {
        buf.put_slice(self.host_id.as_bytes());
        buf.put_u32(self.unique_id);
        buf.put_u16(self.skip_len);
        buf.put_bytes(0, self.skip_len as usize);
    }

    pub fn try_deser(buf: &mut impl Buf) -> Result<CompatibilityPrefix> {
        let host_id = Uuid::from_u128(buf.try_get_u128()?);
        let unique_id = buf.try_get_u32()?;
        let skip_len = buf.try_get_u16()?;
        if buf.remaining() < skip_len as usize {
            return Err(TransportError::malformed("compatibility prefix exceeds the stream"));
        }
        buf.advance(skip_len as usize);

        Ok(CompatibilityPrefix {
            host_id,
            unique_id,
            skip_len,
        })
    }
}
