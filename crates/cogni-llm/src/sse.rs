//! Incremental server-sent-event decoding.
//!
//! The proxy streams `data: <json>` lines terminated by `data: [DONE]`.
//! The decoder owns the cross-chunk line buffer; payload parsing stays with
//! the caller so malformed JSON can be logged and skipped without killing
//! the stream.

/// A decoded SSE payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SseFrame {
    /// A `data:` payload.
    Data(String),
    /// The terminal `data: [DONE]` marker.
    Done,
}

/// Incremental SSE decoder.
#[derive(Debug, Default)]
pub struct SseDecoder {
    buffer: String,
}

impl SseDecoder {
    /// Create an empty decoder.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a network chunk and return the frames it completed.
    ///
    /// Lines that are not `data:` payloads (comments, event names, blanks)
    /// are ignored per the SSE grammar.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<SseFrame> {
        self.buffer.push_str(&String::from_utf8_lossy(chunk));

        let mut frames = Vec::new();
        while let Some(line_end) = self.buffer.find('\n') {
            let line = self.buffer[..line_end].trim_end_matches('\r').to_string();
            self.buffer.drain(..=line_end);

            let line = line.trim();
            if line.is_empty() {
                continue;
            }

            if let Some(data) = line.strip_prefix("data:") {
                let data = data.trim_start();
                if data == "[DONE]" {
                    frames.push(SseFrame::Done);
                } else {
                    frames.push(SseFrame::Data(data.to_string()));
                }
            }
        }
        frames
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_complete_lines() {
        let mut decoder = SseDecoder::new();
        let frames = decoder.push(b"data: {\"a\":1}\n\ndata: [DONE]\n");
        assert_eq!(
            frames,
            vec![SseFrame::Data("{\"a\":1}".into()), SseFrame::Done]
        );
    }

    #[test]
    fn buffers_split_lines() {
        let mut decoder = SseDecoder::new();
        assert!(decoder.push(b"data: {\"a\"").is_empty());
        let frames = decoder.push(b":1}\n");
        assert_eq!(frames, vec![SseFrame::Data("{\"a\":1}".into())]);
    }

    #[test]
    fn ignores_comments_and_other_fields() {
        let mut decoder = SseDecoder::new();
        let frames = decoder.push(b": keep-alive\nevent: ping\ndata: x\n");
        assert_eq!(frames, vec![SseFrame::Data("x".into())]);
    }

    #[test]
    fn handles_crlf() {
        let mut decoder = SseDecoder::new();
        let frames = decoder.push(b"data: y\r\n");
        assert_eq!(frames, vec![SseFrame::Data("y".into())]);
    }
}
