//! Big-endian frame primitives for the control channel.
//!
//! Everything on the wire is one of three shapes: a `u32` (4 bytes,
//! big-endian), a `bool` (one byte, `00` or `01`), or a length-prefixed
//! byte string (u32 length, then that many raw bytes). There is no
//! magic, no version byte and no escaping; a stream that ends inside a
//! primitive is a [`WireError::ShortRead`].

use std::io;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Errors produced while reading frame primitives.
#[derive(Debug, Error)]
pub enum WireError {
    /// The peer closed the stream in the middle of a primitive.
    #[error("short read: stream ended inside a frame")]
    ShortRead,

    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

fn eof_as_short_read(err: io::Error) -> WireError {
    if err.kind() == io::ErrorKind::UnexpectedEof {
        WireError::ShortRead
    } else {
        WireError::Io(err)
    }
}

/// Read a big-endian u32.
pub async fn read_u32<R>(reader: &mut R) -> Result<u32, WireError>
where
    R: AsyncRead + Unpin,
{
    let mut buf = [0u8; 4];
    reader.read_exact(&mut buf).await.map_err(eof_as_short_read)?;
    Ok(u32::from_be_bytes(buf))
}

/// Read a single-byte bool. Any non-zero byte reads as `true`.
pub async fn read_bool<R>(reader: &mut R) -> Result<bool, WireError>
where
    R: AsyncRead + Unpin,
{
    let mut buf = [0u8; 1];
    reader.read_exact(&mut buf).await.map_err(eof_as_short_read)?;
    Ok(buf[0] != 0)
}

/// Read exactly `len` raw bytes.
pub async fn read_exact_buf<R>(reader: &mut R, len: u32) -> Result<Vec<u8>, WireError>
where
    R: AsyncRead + Unpin,
{
    let mut buf = vec![0u8; len as usize];
    reader.read_exact(&mut buf).await.map_err(eof_as_short_read)?;
    Ok(buf)
}

/// Read a length-prefixed byte string: u32 length, then the payload.
pub async fn read_lp_bytes<R>(reader: &mut R) -> Result<Vec<u8>, WireError>
where
    R: AsyncRead + Unpin,
{
    let len = read_u32(reader).await?;
    read_exact_buf(reader, len).await
}

/// Read a length-prefixed byte string and decode it as UTF-8.
pub async fn read_lp_string<R>(reader: &mut R) -> Result<String, WireError>
where
    R: AsyncRead + Unpin,
{
    let bytes = read_lp_bytes(reader).await?;
    String::from_utf8(bytes)
        .map_err(|_| WireError::Io(io::Error::new(io::ErrorKind::InvalidData, "not valid UTF-8")))
}

/// Write a big-endian u32.
pub async fn write_u32<W>(writer: &mut W, value: u32) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    writer.write_all(&value.to_be_bytes()).await
}

/// Write a single-byte bool.
pub async fn write_bool<W>(writer: &mut W, value: bool) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    writer.write_all(&[u8::from(value)]).await
}

/// Write a length-prefixed byte string.
pub async fn write_lp_bytes<W>(writer: &mut W, payload: &[u8]) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let len = u32::try_from(payload.len())
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "payload exceeds u32 framing"))?;
    write_u32(writer, len).await?;
    writer.write_all(payload).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;

    #[tokio::test]
    async fn u32_round_trip() {
        let (mut client, mut server) = duplex(64);
        for value in [0u32, 1, 0xFFFF, u32::MAX] {
            write_u32(&mut client, value).await.unwrap();
            assert_eq!(read_u32(&mut server).await.unwrap(), value);
        }
    }

    #[tokio::test]
    async fn bool_round_trip() {
        let (mut client, mut server) = duplex(64);
        write_bool(&mut client, true).await.unwrap();
        write_bool(&mut client, false).await.unwrap();
        assert!(read_bool(&mut server).await.unwrap());
        assert!(!read_bool(&mut server).await.unwrap());
    }

    #[tokio::test]
    async fn lp_bytes_round_trip() {
        for len in [0usize, 1, 65_535, 1_000_000] {
            let (mut client, mut server) = duplex(8192);
            let payload = vec![0xA5u8; len];
            let writer = tokio::spawn({
                let payload = payload.clone();
                async move {
                    write_lp_bytes(&mut client, &payload).await.unwrap();
                }
            });
            let read = read_lp_bytes(&mut server).await.unwrap();
            assert_eq!(read, payload);
            writer.await.unwrap();
        }
    }

    #[tokio::test]
    async fn truncated_u32_is_short_read() {
        let (mut client, mut server) = duplex(64);
        client.write_all(&[0x00, 0x01]).await.unwrap();
        drop(client);
        assert!(matches!(
            read_u32(&mut server).await,
            Err(WireError::ShortRead)
        ));
    }

    #[tokio::test]
    async fn truncated_payload_is_short_read() {
        let (mut client, mut server) = duplex(64);
        write_u32(&mut client, 10).await.unwrap();
        client.write_all(b"abc").await.unwrap();
        drop(client);
        assert!(matches!(
            read_lp_bytes(&mut server).await,
            Err(WireError::ShortRead)
        ));
    }
}
