//! Framed I/O for the IMAP protocol.
//!
//! IMAP responses are CRLF-terminated lines, optionally followed by
//! literals of the form `{n}\r\n<n bytes>`. Archival fetches raw RFC822
//! bodies as literals, so literal handling is the one piece of framing
//! this crate cannot do without.

#![allow(clippy::missing_errors_doc)]

use std::io;

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};

use crate::{Error, Result};

/// Read buffer capacity.
const READ_BUFFER_SIZE: usize = 8192;

/// Maximum line length to prevent memory exhaustion.
const MAX_LINE_LENGTH: usize = 1024 * 1024;

/// Maximum literal size. PEC receipts and attachments stay well below
/// this; anything larger is a misbehaving server.
const MAX_LITERAL_SIZE: usize = 256 * 1024 * 1024;

/// Buffered line/literal framing over an IMAP stream.
pub struct FramedStream<S> {
    reader: BufReader<S>,
}

impl<S> FramedStream<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    /// Wraps a stream.
    pub fn new(stream: S) -> Self {
        Self {
            reader: BufReader::with_capacity(READ_BUFFER_SIZE, stream),
        }
    }

    /// Reads one complete server response, including any embedded
    /// literals.
    ///
    /// The returned buffer holds the raw line(s) with CRLFs and literal
    /// bytes in wire order.
    pub async fn read_response(&mut self) -> Result<Bytes> {
        let mut response = BytesMut::new();

        loop {
            let line_start = response.len();
            self.read_line(&mut response).await?;

            let Some(literal_len) = parse_literal_length(&response[line_start..]) else {
                return Ok(response.freeze());
            };
            if literal_len > MAX_LITERAL_SIZE {
                return Err(Error::Protocol(format!(
                    "literal too large: {literal_len} bytes (max {MAX_LITERAL_SIZE})"
                )));
            }

            let literal_start = response.len();
            response.resize(literal_start + literal_len, 0);
            self.reader
                .read_exact(&mut response[literal_start..])
                .await?;
            // The server continues the same response after the literal.
        }
    }

    /// Appends a single CRLF-terminated line to `out`.
    async fn read_line(&mut self, out: &mut BytesMut) -> Result<()> {
        let mut line_len = 0usize;

        loop {
            let buf = self.reader.fill_buf().await?;
            if buf.is_empty() {
                return Err(Error::Io(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "connection closed",
                )));
            }

            // The terminator may arrive split across reads: '\r' as the
            // last buffered byte, '\n' at the start of the next chunk.
            if line_len > 0 && out.last() == Some(&b'\r') && buf[0] == b'\n' {
                out.extend_from_slice(b"\n");
                self.reader.consume(1);
                return Ok(());
            }

            if let Some(pos) = find_crlf(buf) {
                out.extend_from_slice(&buf[..pos + 2]);
                self.reader.consume(pos + 2);
                return Ok(());
            }

            let len = buf.len();
            out.extend_from_slice(buf);
            self.reader.consume(len);

            line_len += len;
            if line_len > MAX_LINE_LENGTH {
                return Err(Error::Protocol("line too long".to_string()));
            }
        }
    }

    /// Writes a complete command line (caller supplies the CRLF).
    pub async fn write_command(&mut self, data: &[u8]) -> Result<()> {
        let stream = self.reader.get_mut();
        stream.write_all(data).await?;
        stream.flush().await?;
        Ok(())
    }
}

/// Parses a literal announcement `{n}` (or `{n+}`) at the end of a line.
fn parse_literal_length(line: &[u8]) -> Option<usize> {
    let trimmed = line.strip_suffix(b"\r\n")?;
    let open = trimmed.iter().rposition(|&b| b == b'{')?;
    let close = trimmed.last()?;
    if *close != b'}' {
        return None;
    }

    let digits = &trimmed[open + 1..trimmed.len() - 1];
    let digits = digits.strip_suffix(b"+").unwrap_or(digits);
    if digits.is_empty() || !digits.iter().all(u8::is_ascii_digit) {
        return None;
    }

    std::str::from_utf8(digits).ok()?.parse().ok()
}

/// Finds the first CRLF in a buffer.
fn find_crlf(buf: &[u8]) -> Option<usize> {
    buf.windows(2).position(|w| w == b"\r\n")
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_literal_length() {
        assert_eq!(parse_literal_length(b"* 1 FETCH (BODY[] {42}\r\n"), Some(42));
        assert_eq!(parse_literal_length(b"a001 LOGIN user {7+}\r\n"), Some(7));
        assert_eq!(parse_literal_length(b"* OK ready\r\n"), None);
        assert_eq!(parse_literal_length(b"* 1 FETCH (BODY[] {x}\r\n"), None);
        assert_eq!(parse_literal_length(b"no crlf {5}"), None);
    }

    #[test]
    fn test_find_crlf() {
        assert_eq!(find_crlf(b"abc\r\ndef"), Some(3));
        assert_eq!(find_crlf(b"abcdef"), None);
        assert_eq!(find_crlf(b"\r\n"), Some(0));
    }

    #[tokio::test]
    async fn test_read_response_with_literal() {
        let wire = b"* 1 FETCH (BODY[] {5}\r\nhello)\r\n".to_vec();
        let mut framed = FramedStream::new(std::io::Cursor::new(wire.clone()));
        let response = framed.read_response().await.unwrap();
        assert_eq!(response, wire);
    }

    #[tokio::test]
    async fn test_read_response_plain_line() {
        let mut framed =
            FramedStream::new(std::io::Cursor::new(b"* OK ready\r\nleftover".to_vec()));
        let response = framed.read_response().await.unwrap();
        assert_eq!(&response[..], b"* OK ready\r\n");
    }

    #[tokio::test]
    async fn test_crlf_split_across_reads() {
        let stream = tokio_test::io::Builder::new()
            .read(b"* OK ready\r")
            .read(b"\n* 2 EXISTS\r\n")
            .build();
        let mut framed = FramedStream::new(stream);

        assert_eq!(&framed.read_response().await.unwrap()[..], b"* OK ready\r\n");
        assert_eq!(
            &framed.read_response().await.unwrap()[..],
            b"* 2 EXISTS\r\n"
        );
    }

    #[tokio::test]
    async fn test_literal_split_across_reads() {
        let stream = tokio_test::io::Builder::new()
            .read(b"* 1 FETCH (BODY[] {5}\r")
            .read(b"\nhel")
            .read(b"lo)\r\n")
            .build();
        let mut framed = FramedStream::new(stream);

        let response = framed.read_response().await.unwrap();
        assert_eq!(&response[..], b"* 1 FETCH (BODY[] {5}\r\nhello)\r\n");
    }

    #[tokio::test]
    async fn test_read_response_eof() {
        let mut framed = FramedStream::new(std::io::Cursor::new(Vec::new()));
        let err = framed.read_response().await.unwrap_err();
        assert!(matches!(err, Error::Io(_)));
    }
}
