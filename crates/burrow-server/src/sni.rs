//! ClientHello inspection.
//!
//! The public listener never terminates TLS. It routes on the
//! `server_name` extension of the first record, peeked out of the
//! kernel buffer so that every byte is still unread when the splice
//! starts copying.

use std::time::Duration;
use thiserror::Error;
use tokio::net::TcpStream;

/// SNI extraction errors.
#[derive(Debug, Error)]
pub enum SniError {
    /// The bytes are not a well-formed TLS ClientHello.
    #[error("not a TLS ClientHello")]
    BadHandshake,

    /// A well-formed ClientHello without a server_name extension.
    #[error("ClientHello carries no server_name extension")]
    NoSni,

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

const RECORD_HEADER_LEN: usize = 5;
const CONTENT_TYPE_HANDSHAKE: u8 = 0x16;
const HANDSHAKE_CLIENT_HELLO: u8 = 0x01;
const EXTENSION_SERVER_NAME: u16 = 0x0000;

/// Delay between peeks while the ClientHello is still in flight.
const PEEK_RETRY: Duration = Duration::from_millis(1);

/// Extract the SNI hostname from `stream` without consuming any bytes.
///
/// After this returns the ClientHello is still the next thing read
/// from the socket, so the record can be forwarded verbatim.
pub async fn peek_sni(stream: &TcpStream) -> Result<String, SniError> {
    let header = peek_exact(stream, RECORD_HEADER_LEN).await?;
    if header[0] != CONTENT_TYPE_HANDSHAKE {
        return Err(SniError::BadHandshake);
    }

    let record_len = u16::from_be_bytes([header[3], header[4]]) as usize;
    let record = peek_exact(stream, RECORD_HEADER_LEN + record_len).await?;
    parse_client_hello_sni(&record)
}

async fn peek_exact(stream: &TcpStream, want: usize) -> Result<Vec<u8>, SniError> {
    let mut buf = vec![0u8; want];
    loop {
        let n = stream.peek(&mut buf).await?;
        if n >= want {
            return Ok(buf);
        }
        if n == 0 {
            // peer closed before the hello was complete
            return Err(SniError::BadHandshake);
        }
        tokio::time::sleep(PEEK_RETRY).await;
    }
}

/// Parse the SNI hostname out of a complete TLS record (header included).
///
/// The record-layer version check accepts 0x0301 through 0x0304; modern
/// clients put 0x0301 or 0x0303 there regardless of the version they
/// end up negotiating.
pub fn parse_client_hello_sni(record: &[u8]) -> Result<String, SniError> {
    if record.len() < RECORD_HEADER_LEN {
        return Err(SniError::BadHandshake);
    }
    if record[0] != CONTENT_TYPE_HANDSHAKE {
        return Err(SniError::BadHandshake);
    }
    if record[1] != 0x03 || !(0x01..=0x04).contains(&record[2]) {
        return Err(SniError::BadHandshake);
    }

    let record_len = u16::from_be_bytes([record[3], record[4]]) as usize;
    if record.len() < RECORD_HEADER_LEN + record_len {
        return Err(SniError::BadHandshake);
    }

    let mut hello = Cursor::new(&record[RECORD_HEADER_LEN..RECORD_HEADER_LEN + record_len]);
    if hello.u8()? != HANDSHAKE_CLIENT_HELLO {
        return Err(SniError::BadHandshake);
    }
    hello.skip(3)?; // handshake length
    hello.skip(2)?; // client version
    hello.skip(32)?; // client random

    let session_id_len = hello.u8()? as usize;
    hello.skip(session_id_len)?;

    let cipher_suites_len = hello.u16()? as usize;
    hello.skip(cipher_suites_len)?;

    let compression_len = hello.u8()? as usize;
    hello.skip(compression_len)?;

    let extensions_len = hello.u16()? as usize;
    let mut extensions = Cursor::new(hello.take(extensions_len)?);

    while extensions.remaining() >= 4 {
        let ext_type = extensions.u16()?;
        let ext_len = extensions.u16()? as usize;
        let body = extensions.take(ext_len)?;

        if ext_type == EXTENSION_SERVER_NAME {
            let mut names = Cursor::new(body);
            names.skip(2)?; // server_name_list length
            names.skip(1)?; // name type (host_name)
            let host_len = names.u16()? as usize;
            let host = names.take(host_len)?;
            let host =
                std::str::from_utf8(host).map_err(|_| SniError::BadHandshake)?;
            if host.is_empty() {
                return Err(SniError::NoSni);
            }
            return Ok(host.to_string());
        }
    }

    Err(SniError::NoSni)
}

/// Bounds-checked reader over the handshake body. Every overrun is a
/// truncated hello, never a panic.
struct Cursor<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], SniError> {
        if self.remaining() < n {
            return Err(SniError::BadHandshake);
        }
        let slice = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    fn skip(&mut self, n: usize) -> Result<(), SniError> {
        self.take(n).map(|_| ())
    }

    fn u8(&mut self) -> Result<u8, SniError> {
        Ok(self.take(1)?[0])
    }

    fn u16(&mut self) -> Result<u16, SniError> {
        let bytes = self.take(2)?;
        Ok(u16::from_be_bytes([bytes[0], bytes[1]]))
    }
}
