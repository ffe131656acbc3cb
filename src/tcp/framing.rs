use std::io::ErrorKind;
use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use crate::error::{Result, TransportError};
use crate::util::safe_converter::{PrecheckedCast, SafeCast};

/// Writes a frame: the content's length as `u32` BE, followed by the content.
pub async fn write_frame(stream: &mut (impl AsyncWrite + Unpin), content: &[u8]) -> Result<()> {
    if content.len() > u32::MAX as usize {
        return Err(TransportError::Logic(format!("frame of {} bytes exceeds the maximum frame length", content.len())));
    }

    let len: u32 = content.len().prechecked_cast();
    stream.write_all(len.to_be_bytes().as_ref()).await?;
    stream.write_all(content).await?;
    Ok(())
}

/// Reads the next frame. Returns `None` if the peer closed the connection between frames.
pub async fn read_frame(stream: &mut (impl AsyncRead + Unpin), max_len: usize) -> Result<Option<Bytes>> {
    let mut len_buf = [0u8; 4];
    match stream.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }

    let len: usize = u32::from_be_bytes(len_buf).safe_cast();
    if len > max_len {
        return Err(TransportError::ProtocolDesync(format!("received a frame of {} bytes, the maximum is {}", len, max_len)));
    }

    let mut buf = vec![0u8; len];
    match stream.read_exact(&mut buf).await {
        Ok(_) => Ok(Some(buf.into())),
        Err(e) if e.kind() == ErrorKind::UnexpectedEof => Err(TransportError::ConnectionClosed("connection closed in the middle of a frame".to_string())),
        Err(e) => Err(e.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_frames() {
        let (mut client, mut server) = tokio::io::duplex(1024);

        write_frame(&mut client, b"hello").await.unwrap();
        write_frame(&mut client, b"").await.unwrap();
        drop(client);

        assert_eq!(read_frame(&mut server, 100).await.unwrap().unwrap().as_ref(), b"hello");
        assert_eq!(read_frame(&mut server, 100).await.unwrap().unwrap().as_ref(), b"");
        assert!(read_frame(&mut server, 100).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_oversized_frame() {
        let (mut client, mut server) = tokio::io::duplex(1024);
        write_frame(&mut client, &[0; 101]).await.unwrap();
        assert!(matches!(read_frame(&mut server, 100).await, Err(TransportError::ProtocolDesync(_))));
    }

    #[tokio::test]
    async fn test_truncated_frame() {
        let (mut client, mut server) = tokio::io::duplex(1024);
        client.write_all(&[0, 0, 0, 10, 1, 2, 3]).await.unwrap();
        drop(client);
        assert!(matches!(read_frame(&mut server, 100).await, Err(TransportError::ConnectionClosed(_))));
    }
}
