//! TLS ClientHello inspection for SNI-based routing.
//!
//! The SNI and mixed listeners read the first TLS record from an accepted
//! connection, extract the server name, and then replay the consumed
//! bytes: either toward the backend (raw splice) or into the local TLS
//! acceptor (terminate-and-forward).

use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, ReadBuf};
use tokio::time::timeout;
use tracing::debug;

/// Upper bound on the bytes read while looking for the SNI extension.
pub const MAX_PEEK_BYTES: usize = 16 * 1024;

/// How long to wait for the ClientHello before giving up.
pub const PEEK_TIMEOUT: Duration = Duration::from_millis(500);

/// Reads the leading TLS record from `stream` and extracts the SNI server
/// name. Returns the name (lowercased, trailing dot trimmed) and the
/// consumed bytes, which the caller must replay.
///
/// Returns `(None, bytes)` for non-TLS data, a ClientHello without SNI,
/// or a timeout.
pub async fn read_client_hello<R: AsyncRead + Unpin>(stream: &mut R) -> (Option<String>, Vec<u8>) {
    let mut buf = Vec::with_capacity(1024);
    match timeout(PEEK_TIMEOUT, read_record(stream, &mut buf)).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => {
            debug!(error = %e, "error reading ClientHello");
            return (None, buf);
        }
        Err(_) => {
            debug!("timeout waiting for ClientHello");
            return (None, buf);
        }
    }
    let sni = extract_sni(&buf);
    (sni, buf)
}

/// Reads the TLS record header and, for handshake records, the record
/// body (bounded by `MAX_PEEK_BYTES`).
async fn read_record<R: AsyncRead + Unpin>(stream: &mut R, buf: &mut Vec<u8>) -> io::Result<()> {
    buf.resize(5, 0);
    let mut read = 0;
    while read < 5 {
        let n = stream.read(&mut buf[read..5]).await?;
        if n == 0 {
            buf.truncate(read);
            return Ok(());
        }
        read += n;
    }

    // 0x16 = handshake record; anything else is not a ClientHello.
    if buf[0] != 0x16 {
        return Ok(());
    }

    let record_len = u16::from_be_bytes([buf[3], buf[4]]) as usize;
    let total = (5 + record_len).min(MAX_PEEK_BYTES);
    buf.resize(total, 0);
    while read < total {
        let n = stream.read(&mut buf[read..total]).await?;
        if n == 0 {
            buf.truncate(read);
            return Ok(());
        }
        read += n;
    }
    Ok(())
}

/// Walks a ClientHello and returns the SNI host name, if present.
pub fn extract_sni(data: &[u8]) -> Option<String> {
    // record header (5) + handshake type (1) + length (3)
    if data.len() < 9 || data[0] != 0x16 {
        return None;
    }
    let hs = &data[5..];
    // 0x01 = ClientHello
    if hs[0] != 0x01 || hs.len() < 4 {
        return None;
    }
    let hello = &hs[4..];
    // version (2) + random (32)
    if hello.len() < 35 {
        return None;
    }
    let mut pos = 34;

    let session_id_len = *hello.get(pos)? as usize;
    pos += 1 + session_id_len;

    let cipher_len =
        u16::from_be_bytes([*hello.get(pos)?, *hello.get(pos + 1)?]) as usize;
    pos += 2 + cipher_len;

    let compression_len = *hello.get(pos)? as usize;
    pos += 1 + compression_len;

    let ext_total =
        u16::from_be_bytes([*hello.get(pos)?, *hello.get(pos + 1)?]) as usize;
    pos += 2;
    let ext_end = (pos + ext_total).min(hello.len());

    while pos + 4 <= ext_end {
        let ext_type = u16::from_be_bytes([hello[pos], hello[pos + 1]]);
        let ext_len = u16::from_be_bytes([hello[pos + 2], hello[pos + 3]]) as usize;
        pos += 4;
        if ext_type == 0x0000 {
            return parse_sni_extension(hello.get(pos..pos + ext_len)?);
        }
        pos += ext_len;
    }
    None
}

/// Parses the server_name extension body: a list of typed names where
/// type 0 is a DNS host name.
fn parse_sni_extension(data: &[u8]) -> Option<String> {
    let list_len = u16::from_be_bytes([*data.first()?, *data.get(1)?]) as usize;
    let mut pos = 2;
    let end = (2 + list_len).min(data.len());

    while pos + 3 <= end {
        let name_type = data[pos];
        let name_len = u16::from_be_bytes([data[pos + 1], data[pos + 2]]) as usize;
        pos += 3;
        if name_type == 0 {
            let raw = data.get(pos..pos + name_len)?;
            let name = std::str::from_utf8(raw).ok()?;
            return Some(name.to_ascii_lowercase().trim_end_matches('.').to_string());
        }
        pos += name_len;
    }
    None
}

/// A stream that yields buffered bytes before reading from the inner
/// stream. Writes pass straight through.
pub struct PrefixedStream<S> {
    prefix: Vec<u8>,
    offset: usize,
    inner: S,
}

impl<S> PrefixedStream<S> {
    pub fn new(prefix: Vec<u8>, inner: S) -> Self {
        Self {
            prefix,
            offset: 0,
            inner,
        }
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for PrefixedStream<S> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        if self.offset < self.prefix.len() {
            let remaining = &self.prefix[self.offset..];
            let n = remaining.len().min(buf.remaining());
            buf.put_slice(&remaining[..n]);
            self.offset += n;
            return Poll::Ready(Ok(()));
        }
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for PrefixedStream<S> {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.inner).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Builds a minimal ClientHello record carrying `host` as SNI.
    fn client_hello_with_sni(host: &str) -> Vec<u8> {
        let name = host.as_bytes();
        let sni_ext_body_len = 2 + 3 + name.len(); // list len + entry header + name
        let ext_total = 4 + sni_ext_body_len; // ext type + ext len + body

        let mut hello = Vec::new();
        hello.extend_from_slice(&[0x03, 0x03]); // client version
        hello.extend_from_slice(&[0u8; 32]); // random
        hello.push(0); // session id length
        hello.extend_from_slice(&[0x00, 0x02, 0x13, 0x01]); // one cipher suite
        hello.extend_from_slice(&[0x01, 0x00]); // null compression
        hello.extend_from_slice(&(ext_total as u16).to_be_bytes());
        hello.extend_from_slice(&[0x00, 0x00]); // SNI extension type
        hello.extend_from_slice(&(sni_ext_body_len as u16).to_be_bytes());
        hello.extend_from_slice(&((3 + name.len()) as u16).to_be_bytes()); // list len
        hello.push(0); // name type: host
        hello.extend_from_slice(&(name.len() as u16).to_be_bytes());
        hello.extend_from_slice(name);

        let mut handshake = vec![0x01];
        handshake.extend_from_slice(&(hello.len() as u32).to_be_bytes()[1..]);
        handshake.extend_from_slice(&hello);

        let mut record = vec![0x16, 0x03, 0x01];
        record.extend_from_slice(&(handshake.len() as u16).to_be_bytes());
        record.extend_from_slice(&handshake);
        record
    }

    #[test]
    fn test_extract_sni() {
        let record = client_hello_with_sni("db.example.com");
        assert_eq!(extract_sni(&record).as_deref(), Some("db.example.com"));
    }

    #[test]
    fn test_extract_sni_normalizes() {
        let record = client_hello_with_sni("DB.Example.COM.");
        assert_eq!(extract_sni(&record).as_deref(), Some("db.example.com"));
    }

    #[test]
    fn test_not_tls() {
        assert_eq!(extract_sni(b"GET / HTTP/1.1\r\n\r\n"), None);
        assert_eq!(extract_sni(&[0x16, 0x03]), None);
    }

    #[tokio::test]
    async fn test_read_client_hello_returns_consumed_bytes() {
        let record = client_hello_with_sni("svc.internal");
        let mut reader = std::io::Cursor::new(record.clone());
        let (sni, consumed) = read_client_hello(&mut reader).await;
        assert_eq!(sni.as_deref(), Some("svc.internal"));
        assert_eq!(consumed, record);
    }

    #[tokio::test]
    async fn test_prefixed_stream_replays() {
        let record = b"hello ".to_vec();
        let inner = std::io::Cursor::new(b"world".to_vec());
        let mut stream = PrefixedStream::new(record, inner);
        let mut out = Vec::new();
        stream.read_to_end(&mut out).await.unwrap();
        assert_eq!(out, b"hello world");
    }
}
