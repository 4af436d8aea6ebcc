//! Worker stdio protocol: sentinel framing and output parsing.
//!
//! A worker writes `---NANOCLAW_OUTPUT_START---`, one JSON object, and
//! `---NANOCLAW_OUTPUT_END---` on stdout, then a readiness marker on stderr
//! once it can accept the next input line.

use crate::ContainerOutput;
use crate::error::PoolError;

pub const OUTPUT_START: &str = "---NANOCLAW_OUTPUT_START---";
pub const OUTPUT_END: &str = "---NANOCLAW_OUTPUT_END---";
pub const READY_MARKER: &str = "---NANOCLAW_READY---";

/// Extract the JSON payload strictly between the output markers.
pub fn extract_marked_output(stdout: &str) -> Option<&str> {
    let start = stdout.rfind(OUTPUT_START)?;
    let after_start = &stdout[start + OUTPUT_START.len()..];
    let end = after_start.find(OUTPUT_END)?;
    Some(after_start[..end].trim())
}

/// Parse a worker's stdout into a `ContainerOutput`.
///
/// Warm workers must frame their output with markers; cold workers fall back
/// to the last non-empty stdout line when the markers are missing.
pub fn parse_output(stdout: &str, allow_fallback: bool) -> Result<ContainerOutput, PoolError> {
    let payload = match extract_marked_output(stdout) {
        Some(payload) => payload,
        None if allow_fallback => stdout
            .lines()
            .rev()
            .map(str::trim)
            .find(|line| !line.is_empty())
            .ok_or_else(|| PoolError::Protocol("no output produced".to_string()))?,
        None => {
            return Err(PoolError::Protocol(
                "output markers missing from worker stdout".to_string(),
            ));
        }
    };

    serde_json::from_str(payload)
        .map_err(|error| PoolError::Protocol(format!("unparseable worker output: {error}")))
}

/// Byte accumulator with a hard cap. Past the cap, further bytes are dropped
/// and the truncation flag sticks.
#[derive(Debug)]
pub struct CappedBuffer {
    bytes: Vec<u8>,
    cap: usize,
    truncated: bool,
}

impl CappedBuffer {
    pub fn new(cap: usize) -> Self {
        Self {
            bytes: Vec::new(),
            cap,
            truncated: false,
        }
    }

    pub fn push(&mut self, chunk: &[u8]) {
        let room = self.cap.saturating_sub(self.bytes.len());
        if chunk.len() > room {
            self.truncated = true;
        }
        self.bytes.extend_from_slice(&chunk[..chunk.len().min(room)]);
    }

    pub fn truncated(&self) -> bool {
        self.truncated
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Lossy view of the accumulated bytes.
    pub fn as_text(&self) -> String {
        String::from_utf8_lossy(&self.bytes).into_owned()
    }

    /// Last `n` bytes, lossily decoded. Used for error tails.
    pub fn tail(&self, n: usize) -> String {
        let start = self.bytes.len().saturating_sub(n);
        String::from_utf8_lossy(&self.bytes[start..]).into_owned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::OutputStatus;

    #[test]
    fn extracts_payload_between_markers() {
        let stdout = format!(
            "noise\n{OUTPUT_START}\n{{\"status\":\"success\",\"result\":\"all good\",\"new_session_id\":\"s1\"}}\n{OUTPUT_END}\ntrailing"
        );
        let output = parse_output(&stdout, false).unwrap();
        assert_eq!(output.status, OutputStatus::Success);
        assert_eq!(output.result.as_deref(), Some("all good"));
        assert_eq!(output.new_session_id.as_deref(), Some("s1"));
    }

    #[test]
    fn uses_last_marker_pair_after_buffer_reuse() {
        let stdout = format!(
            "{OUTPUT_START}\n{{\"status\":\"error\",\"error\":\"old\"}}\n{OUTPUT_END}\n\
             {OUTPUT_START}\n{{\"status\":\"success\",\"result\":\"new\"}}\n{OUTPUT_END}"
        );
        let output = parse_output(&stdout, false).unwrap();
        assert_eq!(output.result.as_deref(), Some("new"));
    }

    #[test]
    fn missing_markers_fail_without_fallback() {
        let error = parse_output("{\"status\":\"success\"}", false).unwrap_err();
        assert!(matches!(error, PoolError::Protocol(_)));
    }

    #[test]
    fn cold_fallback_takes_last_non_empty_line() {
        let stdout = "log line\n\n{\"status\":\"success\",\"result\":\"ok\"}\n\n";
        let output = parse_output(stdout, true).unwrap();
        assert_eq!(output.result.as_deref(), Some("ok"));
    }

    #[test]
    fn capped_buffer_accepts_exactly_cap_bytes() {
        let mut buffer = CappedBuffer::new(8);
        buffer.push(b"12345678");
        assert!(!buffer.truncated());
        assert_eq!(buffer.len(), 8);

        buffer.push(b"9");
        assert!(buffer.truncated());
        assert_eq!(buffer.len(), 8);
    }

    #[test]
    fn capped_buffer_tail_returns_last_bytes() {
        let mut buffer = CappedBuffer::new(1024);
        buffer.push(b"abcdefgh");
        assert_eq!(buffer.tail(3), "fgh");
        assert_eq!(buffer.tail(100), "abcdefgh");
    }
}
