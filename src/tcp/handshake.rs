use bytes::{Buf, BufMut, Bytes, BytesMut};
use bytes_varint::try_get_fixed::TryGetFixedSupport;
use uuid::Uuid;
use crate::error::Result;
use crate::util::buf::{put_string, try_get_string};

/// The first frame in each direction of a TCP connection. The connecting side sends the name
///  of the connection it opens, and the accepting side echoes it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Handshake {
    /// the URI under which the sender can be reached
    pub uri: String,
    pub host_id: Uuid,
    pub unique_id: u32,
    pub connection_name: String,
}

impl Handshake {
    /// upper bound for a handshake frame's length
    pub const MAX_LEN: usize = 4096;

    pub fn ser(&self, buf: &mut BytesMut) {
        put_string(buf, &self.uri);
        buf.put_slice(self.host_id.as_bytes());
        buf.put_u32(self.unique_id);
        put_string(buf, &self.connection_name);
    }

    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::new();
        self.ser(&mut buf);
        buf.freeze()
    }

    pub fn try_deser(buf: &mut impl Buf) -> Result<Handshake> {
        let uri = try_get_string(buf)?;
        let host_id = Uuid::from_u128(buf.try_get_u128()?);
        let unique_id = buf.try_get_u32()?;
        let connection_name = try_get_string(buf)?;
        Ok(Handshake {
            uri,
            host_id,
            unique_id,
            connection_name,
        })
    }
}
