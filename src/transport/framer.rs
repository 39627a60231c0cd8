//! Newline-delimited line framing over a duplex byte stream.
//!
//! A chat stream carries free text, one message per line. The newline is the
//! only framing boundary and is never escaped: content handed to
//! [`LineWriter::write_line`] must not contain it. Reading and writing are
//! independent per direction; [`split`] hands each half its own framer.

use crate::utils::StreamError;
use crate::MAX_LINE_SIZE;
use futures::io::{
    AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader, ReadHalf,
    WriteHalf,
};

const DELIMITER: u8 = b'\n';

/// Reads one line at a time from the inbound half of a stream
pub struct LineReader<R> {
    reader: BufReader<R>,
    max_line: usize,
}

/// Writes one line at a time to the outbound half of a stream
pub struct LineWriter<W> {
    writer: W,
}

/// Split a duplex stream into an independent line reader and line writer
pub fn split<S>(stream: S) -> (LineReader<ReadHalf<S>>, LineWriter<WriteHalf<S>>)
where
    S: AsyncRead + AsyncWrite,
{
    let (reader, writer) = stream.split();
    (LineReader::new(reader), LineWriter::new(writer))
}

impl<R: AsyncRead + Unpin> LineReader<R> {
    /// Create a reader with the default maximum line size
    pub fn new(reader: R) -> Self {
        Self::with_max_line(reader, MAX_LINE_SIZE)
    }

    /// Create a reader accepting lines of at most `max_line` content bytes
    pub fn with_max_line(reader: R, max_line: usize) -> Self {
        Self {
            reader: BufReader::new(reader),
            max_line,
        }
    }

    /// Wait for the next line and return its content without the delimiter.
    ///
    /// A final line without a trailing newline is returned as-is when the
    /// stream ends; after that the reader reports [`StreamError::Closed`].
    pub async fn read_line(&mut self) -> Result<String, StreamError> {
        // Room for the content plus "\r\n".
        let limit = self.max_line as u64 + 2;
        let mut buf = Vec::new();
        let read = (&mut self.reader)
            .take(limit)
            .read_until(DELIMITER, &mut buf)
            .await
            .map_err(|e| StreamError::Read {
                reason: e.to_string(),
            })?;

        if read == 0 {
            return Err(StreamError::Closed);
        }

        if buf.last() == Some(&DELIMITER) {
            buf.pop();
        } else if read as u64 == limit {
            return Err(StreamError::LineTooLong { max: self.max_line });
        }

        if buf.last() == Some(&b'\r') {
            buf.pop();
        }

        if buf.len() > self.max_line {
            return Err(StreamError::LineTooLong { max: self.max_line });
        }

        Ok(String::from_utf8_lossy(&buf).into_owned())
    }
}

impl<W: AsyncWrite + Unpin> LineWriter<W> {
    /// Create a writer
    pub fn new(writer: W) -> Self {
        Self { writer }
    }

    /// Append the delimiter to `content`, write it as one buffer and flush
    pub async fn write_line(&mut self, content: &str) -> Result<(), StreamError> {
        if content.as_bytes().contains(&DELIMITER) {
            return Err(StreamError::EmbeddedDelimiter);
        }

        let mut frame = Vec::with_capacity(content.len() + 1);
        frame.extend_from_slice(content.as_bytes());
        frame.push(DELIMITER);

        self.writer.write_all(&frame).await.map_err(write_error)?;
        self.writer.flush().await.map_err(write_error)
    }

    /// Close the outbound direction
    pub async fn close(&mut self) -> Result<(), StreamError> {
        self.writer.close().await.map_err(write_error)
    }
}

fn write_error(e: std::io::Error) -> StreamError {
    StreamError::Write {
        reason: e.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt as _;
    use tokio_util::compat::TokioAsyncReadCompatExt;

    type DuplexReader = LineReader<tokio_util::compat::Compat<tokio::io::DuplexStream>>;

    async fn reader_for(bytes: &[u8]) -> DuplexReader {
        let (mut tx, rx) = tokio::io::duplex(1024);
        tx.write_all(bytes).await.unwrap();
        drop(tx);
        LineReader::new(rx.compat())
    }

    #[tokio::test]
    async fn test_roundtrip_strips_delimiter() {
        let (a, b) = tokio::io::duplex(1024);
        let (_, mut writer) = split(a.compat());
        let (mut reader, _) = split(b.compat());

        for content in ["hello", "", "with spaces and ünïcode"] {
            writer.write_line(content).await.unwrap();
            assert_eq!(reader.read_line().await.unwrap(), content);
        }
    }

    #[tokio::test]
    async fn test_write_appends_single_delimiter_and_flushes() {
        let mock = tokio_test::io::Builder::new().write(b"hello\n").build();
        let mut writer = LineWriter::new(mock.compat());
        writer.write_line("hello").await.unwrap();
    }

    #[tokio::test]
    async fn test_write_rejects_embedded_delimiter() {
        let mock = tokio_test::io::Builder::new().build();
        let mut writer = LineWriter::new(mock.compat());
        assert_eq!(
            writer.write_line("two\nlines").await,
            Err(StreamError::EmbeddedDelimiter)
        );
    }

    #[tokio::test]
    async fn test_write_error_is_reported() {
        let mock = tokio_test::io::Builder::new()
            .write_error(std::io::Error::new(std::io::ErrorKind::BrokenPipe, "gone"))
            .build();
        let mut writer = LineWriter::new(mock.compat());
        assert!(matches!(
            writer.write_line("hello").await,
            Err(StreamError::Write { .. })
        ));
    }

    #[tokio::test]
    async fn test_partial_line_at_eof_then_closed() {
        let mut reader = reader_for(b"first\nsecond").await;
        assert_eq!(reader.read_line().await.unwrap(), "first");
        assert_eq!(reader.read_line().await.unwrap(), "second");
        assert_eq!(reader.read_line().await, Err(StreamError::Closed));
    }

    #[tokio::test]
    async fn test_empty_stream_is_closed() {
        let mut reader = reader_for(b"").await;
        assert_eq!(reader.read_line().await, Err(StreamError::Closed));
    }

    #[tokio::test]
    async fn test_blank_line_and_crlf() {
        let mut reader = reader_for(b"hello\r\n\nbye\n").await;
        assert_eq!(reader.read_line().await.unwrap(), "hello");
        assert_eq!(reader.read_line().await.unwrap(), "");
        assert_eq!(reader.read_line().await.unwrap(), "bye");
    }

    #[tokio::test]
    async fn test_line_too_long() {
        let (mut tx, rx) = tokio::io::duplex(1024);
        tx.write_all(b"abcdefgh\n").await.unwrap();
        drop(tx);

        let mut reader = LineReader::with_max_line(rx.compat(), 4);
        assert_eq!(
            reader.read_line().await,
            Err(StreamError::LineTooLong { max: 4 })
        );
    }

    #[tokio::test]
    async fn test_line_at_limit_is_accepted() {
        let (mut tx, rx) = tokio::io::duplex(1024);
        tx.write_all(b"abcd\r\nabcd\n").await.unwrap();
        drop(tx);

        let mut reader = LineReader::with_max_line(rx.compat(), 4);
        assert_eq!(reader.read_line().await.unwrap(), "abcd");
        assert_eq!(reader.read_line().await.unwrap(), "abcd");
    }

    #[tokio::test]
    async fn test_read_error_is_reported() {
        let mock = tokio_test::io::Builder::new()
            .read_error(std::io::Error::new(std::io::ErrorKind::ConnectionReset, "reset"))
            .build();
        let mut reader = LineReader::new(mock.compat());
        assert!(matches!(
            reader.read_line().await,
            Err(StreamError::Read { .. })
        ));
    }

    #[tokio::test]
    async fn test_invalid_utf8_is_replaced() {
        let mut reader = reader_for(b"ok\xff\n").await;
        assert_eq!(reader.read_line().await.unwrap(), "ok\u{fffd}");
    }
}
