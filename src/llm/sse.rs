//! Minimal SSE framing over a byte-chunk stream.
//!
//! Providers deliver `text/event-stream` bodies in arbitrary chunk
//! boundaries; this buffer reassembles complete lines and extracts `data:`
//! payloads. Event-name lines are ignored — every provider we speak to
//! carries a `type` discriminator inside the JSON payload.

/// Accumulates raw bytes and yields complete lines.
#[derive(Default)]
pub struct LineBuffer {
    buf: Vec<u8>,
}

impl LineBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a chunk, returning every complete line it finished.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.buf.extend_from_slice(chunk);
        let mut lines = Vec::new();
        while let Some(pos) = self.buf.iter().position(|&b| b == b'\n') {
            let mut line: Vec<u8> = self.buf.drain(..=pos).collect();
            line.pop(); // trailing \n
            if line.last() == Some(&b'\r') {
                line.pop();
            }
            lines.push(String::from_utf8_lossy(&line).into_owned());
        }
        lines
    }
}

/// Extract the payload of a `data:` line, or None for comments, event-name
/// lines, and blanks.
pub fn data_payload(line: &str) -> Option<&str> {
    let rest = line.strip_prefix("data:")?;
    Some(rest.strip_prefix(' ').unwrap_or(rest))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reassembles_split_lines() {
        let mut buf = LineBuffer::new();
        assert!(buf.push(b"data: {\"a\"").is_empty());
        let lines = buf.push(b":1}\ndata: [DONE]\n");
        assert_eq!(lines, vec!["data: {\"a\":1}", "data: [DONE]"]);
    }

    #[test]
    fn strips_carriage_returns() {
        let mut buf = LineBuffer::new();
        let lines = buf.push(b"data: x\r\n");
        assert_eq!(lines, vec!["data: x"]);
    }

    #[test]
    fn data_payload_filters_non_data_lines() {
        assert_eq!(data_payload("data: {\"a\":1}"), Some("{\"a\":1}"));
        assert_eq!(data_payload("data:{\"a\":1}"), Some("{\"a\":1}"));
        assert_eq!(data_payload("event: message_start"), None);
        assert_eq!(data_payload(": keepalive"), None);
        assert_eq!(data_payload(""), None);
    }
}
