/// One parsed Server-Sent-Events frame. `data` joins multi-line `data:` fields
/// with `\n`; `event` carries the optional `event:` field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SseEvent {
    pub event: Option<String>,
    pub data: String,
}

/// Incremental SSE parser. Feed raw body chunks with [`push_bytes`](Self::push_bytes);
/// call [`finish`](Self::finish) at EOF to flush a frame that never saw its blank-line
/// terminator. Unknown field lines and comments are skipped.
#[derive(Debug, Default)]
pub struct SseParser {
    buffer: Vec<u8>,
    event: Option<String>,
    data: Vec<String>,
}

impl SseParser {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_bytes(&mut self, chunk: &[u8]) -> Vec<SseEvent> {
        self.buffer.extend_from_slice(chunk);
        let mut out = Vec::new();
        while let Some(pos) = self.buffer.iter().position(|byte| *byte == b'\n') {
            let line: Vec<u8> = self.buffer.drain(..=pos).collect();
            let line = String::from_utf8_lossy(&line);
            let line = line.trim_end_matches(['\n', '\r']);
            self.push_line(line, &mut out);
        }
        out
    }

    pub fn finish(&mut self) -> Vec<SseEvent> {
        let mut out = Vec::new();
        if !self.buffer.is_empty() {
            let line: Vec<u8> = std::mem::take(&mut self.buffer);
            let line = String::from_utf8_lossy(&line);
            let line = line.trim_end_matches(['\n', '\r']).to_string();
            self.push_line(&line, &mut out);
        }
        if let Some(event) = self.take_pending() {
            out.push(event);
        }
        out
    }

    fn push_line(&mut self, line: &str, out: &mut Vec<SseEvent>) {
        if line.is_empty() {
            if let Some(event) = self.take_pending() {
                out.push(event);
            }
        } else if let Some(rest) = line.strip_prefix("data:") {
            self.data.push(rest.strip_prefix(' ').unwrap_or(rest).to_string());
        } else if let Some(rest) = line.strip_prefix("event:") {
            self.event = Some(rest.trim().to_string());
        }
    }

    fn take_pending(&mut self) -> Option<SseEvent> {
        if self.event.is_none() && self.data.is_empty() {
            return None;
        }
        Some(SseEvent {
            event: self.event.take(),
            data: std::mem::take(&mut self.data).join("\n"),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_single_event() {
        let mut parser = SseParser::new();
        let events = parser.push_bytes(b"data: {\"a\":1}\n\n");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].data, "{\"a\":1}");
        assert_eq!(events[0].event, None);
    }

    #[test]
    fn reassembles_split_chunks() {
        let mut parser = SseParser::new();
        assert!(parser.push_bytes(b"data: {\"he").is_empty());
        let events = parser.push_bytes(b"llo\":true}\n\n");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].data, "{\"hello\":true}");
    }

    #[test]
    fn carries_event_name() {
        let mut parser = SseParser::new();
        let events = parser.push_bytes(b"event: message_start\ndata: {}\n\n");
        assert_eq!(events[0].event.as_deref(), Some("message_start"));
        assert_eq!(events[0].data, "{}");
    }

    #[test]
    fn tolerates_crlf_and_comments() {
        let mut parser = SseParser::new();
        let events = parser.push_bytes(b": keep-alive\r\ndata: one\r\n\r\ndata: two\r\n\r\n");
        let data: Vec<&str> = events.iter().map(|event| event.data.as_str()).collect();
        assert_eq!(data, vec!["one", "two"]);
    }

    #[test]
    fn skips_unknown_fields() {
        let mut parser = SseParser::new();
        let events = parser.push_bytes(b"id: 7\nretry: 100\ndata: x\n\n");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].data, "x");
    }

    #[test]
    fn finish_flushes_unterminated_frame() {
        let mut parser = SseParser::new();
        assert!(parser.push_bytes(b"data: [DONE]").is_empty());
        let events = parser.finish();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].data, "[DONE]");
    }

    #[test]
    fn joins_multi_line_data() {
        let mut parser = SseParser::new();
        let events = parser.push_bytes(b"data: a\ndata: b\n\n");
        assert_eq!(events[0].data, "a\nb");
    }
}
