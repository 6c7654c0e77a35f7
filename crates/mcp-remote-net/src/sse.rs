//! `text/event-stream` framing, extracted as its own reusable reader so both
//! the Streamable HTTP and Legacy SSE transports can share one parser
//! instead of each inlining their own buffer scan.

use mcp_remote_core::CancellationToken;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};

/// One dispatched SSE event. The reader never interprets `data` — callers
/// decide whether it is JSON, an endpoint URI, or something else.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SseEvent {
    pub event: Option<String>,
    pub data: String,
    pub id: Option<String>,
}

/// Reads events out of any `AsyncRead` byte stream per the SSE line
/// grammar: `event:`/`data:`/`id:` fields, `:`-prefixed comments, blank-line
/// dispatch, and multi-line `data:` concatenation.
pub struct SseReader<R> {
    reader: BufReader<R>,
    cancel: CancellationToken,
}

impl<R: AsyncRead + Unpin> SseReader<R> {
    pub fn new(reader: R, cancel: CancellationToken) -> Self {
        Self {
            reader: BufReader::new(reader),
            cancel,
        }
    }

    /// Reads and returns the next dispatched event, or `None` on EOF or
    /// cancellation. A trailing event with no terminating blank line is
    /// still dispatched if it accumulated at least one `data:` line.
    pub async fn next_event(&mut self) -> Option<SseEvent> {
        let mut event_type: Option<String> = None;
        let mut data_lines: Vec<String> = Vec::new();
        let mut id: Option<String> = None;

        loop {
            let mut line = String::new();
            let read = tokio::select! {
                biased;
                () = self.cancel.cancelled() => return None,
                r = self.reader.read_line(&mut line) => r,
            };

            let n = match read {
                Ok(n) => n,
                Err(_) => return None,
            };

            if n == 0 {
                // EOF. Dispatch a trailing partial event if it has data.
                return if data_lines.is_empty() {
                    None
                } else {
                    Some(SseEvent {
                        event: event_type,
                        data: data_lines.join("\n"),
                        id,
                    })
                };
            }

            let trimmed = line.trim_end_matches(['\n', '\r']);

            if trimmed.is_empty() {
                if data_lines.is_empty() {
                    // Blank line with nothing accumulated: not a dispatch.
                    continue;
                }
                return Some(SseEvent {
                    event: event_type,
                    data: data_lines.join("\n"),
                    id,
                });
            }

            if let Some(rest) = trimmed.strip_prefix(':') {
                let _ = rest; // comment line, ignored
                continue;
            }

            if let Some(rest) = trimmed.strip_prefix("event:") {
                event_type = Some(rest.trim().to_string());
            } else if let Some(rest) = trimmed.strip_prefix("data:") {
                data_lines.push(rest.trim().to_string());
            } else if let Some(rest) = trimmed.strip_prefix("id:") {
                id = Some(rest.trim().to_string());
            }
            // Unrecognized fields are ignored per the SSE grammar.
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn reader(input: &str) -> SseReader<Cursor<Vec<u8>>> {
        SseReader::new(Cursor::new(input.as_bytes().to_vec()), CancellationToken::new())
    }

    #[tokio::test]
    async fn single_event() {
        let mut r = reader("event: message\ndata: hello\n\n");
        let ev = r.next_event().await.unwrap();
        assert_eq!(ev.event.as_deref(), Some("message"));
        assert_eq!(ev.data, "hello");
        assert!(r.next_event().await.is_none());
    }

    #[tokio::test]
    async fn multi_line_data_concatenates_with_newline() {
        let mut r = reader("data: line1\ndata: line2\n\n");
        let ev = r.next_event().await.unwrap();
        assert_eq!(ev.data, "line1\nline2");
    }

    #[tokio::test]
    async fn comment_lines_are_skipped() {
        let mut r = reader(": keep-alive\ndata: hi\n\n");
        let ev = r.next_event().await.unwrap();
        assert_eq!(ev.data, "hi");
    }

    #[tokio::test]
    async fn blank_line_with_no_data_is_not_dispatched() {
        let mut r = reader("\n\ndata: hi\n\n");
        let ev = r.next_event().await.unwrap();
        assert_eq!(ev.data, "hi");
    }

    #[tokio::test]
    async fn unterminated_trailing_event_with_data_is_dispatched() {
        let mut r = reader("data: partial");
        let ev = r.next_event().await.unwrap();
        assert_eq!(ev.data, "partial");
        assert!(r.next_event().await.is_none());
    }

    #[tokio::test]
    async fn extra_blank_lines_do_not_change_dispatched_events() {
        let without_padding = "data: a\n\ndata: b\n\n";
        let with_padding = "\n\ndata: a\n\n\n\ndata: b\n\n\n";
        let mut r1 = reader(without_padding);
        let mut r2 = reader(with_padding);
        let a1 = r1.next_event().await.unwrap();
        let a2 = r2.next_event().await.unwrap();
        assert_eq!(a1, a2);
        let b1 = r1.next_event().await.unwrap();
        let b2 = r2.next_event().await.unwrap();
        assert_eq!(b1, b2);
    }

    #[tokio::test]
    async fn whitespace_around_field_values_is_trimmed() {
        let mut r = reader("event:   message   \ndata:   hi   \n\n");
        let ev = r.next_event().await.unwrap();
        assert_eq!(ev.event.as_deref(), Some("message"));
        assert_eq!(ev.data, "hi");
    }

    #[tokio::test]
    async fn cancellation_stops_the_reader() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let mut r = SseReader::new(Cursor::new(b"data: hi\n\n".to_vec()), cancel);
        assert!(r.next_event().await.is_none());
    }
}
