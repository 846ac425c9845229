//! Decoding of the backend's `data: <json>` line framing.

use super::{BackendError, StreamEvent};
use serde::Deserialize;

#[derive(Deserialize)]
struct WireEvent {
    chunk: Option<String>,
    #[serde(default)]
    done: bool,
    error: Option<String>,
}

/// Parses one line. `Ok(None)` for lines that carry no event (blank separators,
/// comments, `event:` fields).
pub fn parse_line(line: &str) -> Result<Option<StreamEvent>, BackendError> {
    let line = line.trim();
    let Some(data) = line.strip_prefix("data:") else {
        return Ok(None);
    };
    let data = data.trim();
    if data.is_empty() || data == "[DONE]" {
        return Ok(Some(StreamEvent::Done));
    }

    let event: WireEvent =
        serde_json::from_str(data).map_err(|_| BackendError::MalformedChunk(data.to_string()))?;
    if let Some(error) = event.error {
        return Ok(Some(StreamEvent::Error(error)));
    }
    if event.done {
        return Ok(Some(StreamEvent::Done));
    }
    match event.chunk {
        Some(chunk) => Ok(Some(StreamEvent::Chunk(chunk))),
        None => Err(BackendError::MalformedChunk(data.to_string())),
    }
}

/// Splits a byte stream into lines. Bytes are buffered until a newline so
/// multi-byte characters split across network reads decode intact.
#[derive(Default)]
pub struct LineDecoder {
    buffer: Vec<u8>,
}

impl LineDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, bytes: &[u8]) -> Vec<String> {
        self.buffer.extend_from_slice(bytes);
        let mut lines = Vec::new();
        while let Some(pos) = self.buffer.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.buffer.drain(..=pos).collect();
            lines.push(String::from_utf8_lossy(&line).trim_end().to_string());
        }
        lines
    }

    /// Returns the trailing unterminated line, if any.
    pub fn finish(&mut self) -> Option<String> {
        if self.buffer.is_empty() {
            return None;
        }
        let line = String::from_utf8_lossy(&self.buffer).trim_end().to_string();
        self.buffer.clear();
        Some(line)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_chunk_done_and_error() {
        assert_eq!(
            parse_line(r#"data: {"chunk": "Hel"}"#).unwrap(),
            Some(StreamEvent::Chunk("Hel".into()))
        );
        assert_eq!(
            parse_line(r#"data: {"done": true}"#).unwrap(),
            Some(StreamEvent::Done)
        );
        assert_eq!(
            parse_line(r#"data: {"error": "model overloaded"}"#).unwrap(),
            Some(StreamEvent::Error("model overloaded".into()))
        );
    }

    #[test]
    fn test_done_marker_and_empty_payload_are_terminal() {
        assert_eq!(parse_line("data: [DONE]").unwrap(), Some(StreamEvent::Done));
        assert_eq!(parse_line("data:").unwrap(), Some(StreamEvent::Done));
    }

    #[test]
    fn test_non_data_lines_are_ignored() {
        assert_eq!(parse_line("").unwrap(), None);
        assert_eq!(parse_line(": keep-alive").unwrap(), None);
        assert_eq!(parse_line("event: message").unwrap(), None);
    }

    #[test]
    fn test_malformed_payload_is_reported() {
        assert!(matches!(
            parse_line("data: {not json"),
            Err(BackendError::MalformedChunk(_))
        ));
        assert!(matches!(
            parse_line(r#"data: {"unexpected": 1}"#),
            Err(BackendError::MalformedChunk(_))
        ));
    }

    #[test]
    fn test_line_decoder_joins_split_reads() {
        let mut decoder = LineDecoder::new();
        let text = "data: {\"chunk\": \"héllo\"}\n";
        let bytes = text.as_bytes();
        // split inside the two-byte 'é'
        let split = text.find('é').unwrap() + 1;

        assert!(decoder.push(&bytes[..split]).is_empty());
        let lines = decoder.push(&bytes[split..]);
        assert_eq!(lines, vec!["data: {\"chunk\": \"héllo\"}".to_string()]);
        assert_eq!(decoder.finish(), None);
    }

    #[test]
    fn test_line_decoder_handles_crlf_and_trailing_line() {
        let mut decoder = LineDecoder::new();
        let lines = decoder.push(b"data: [DONE]\r\n\r\ndata: tail");
        assert_eq!(lines, vec!["data: [DONE]".to_string(), String::new()]);
        assert_eq!(decoder.finish().as_deref(), Some("data: tail"));
    }
}
