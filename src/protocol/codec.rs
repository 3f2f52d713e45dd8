/// Line-delimited JSON framing between the host and the sandbox runner
use crate::config::types::{Result, ScoreboxError};
use crate::protocol::{ExecutionRequest, ExecutionResult};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::io::{BufRead, Read, Write};

/// Upper bound on a single encoded frame, newline excluded
pub const MAX_FRAME_BYTES: usize = 16 * 1024 * 1024;

/// Character budget for any failure diagnostic
pub const MAX_DIAGNOSTIC_CHARS: usize = 2048;

const TRUNCATION_MARKER: &str = "[truncated] ";

/// Frames sent from the host to a runner
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(tag = "frame", rename_all = "snake_case")]
pub enum HostFrame {
    Execute {
        request_id: String,
        request: ExecutionRequest,
    },
    Shutdown,
}

/// Frames sent from a runner back to the host
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(tag = "frame", rename_all = "snake_case")]
pub enum RunnerFrame {
    /// Sent once the environment is sealed; lists the controls in force
    Ready { runner_pid: u32, controls: Vec<String> },
    Result {
        request_id: String,
        result: ExecutionResult,
    },
    Fatal { message: String },
}

/// Clamp a diagnostic to MAX_DIAGNOSTIC_CHARS, keeping the tail
pub fn bound_diagnostic(message: &str) -> String {
    let total = message.chars().count();
    if total <= MAX_DIAGNOSTIC_CHARS {
        return message.to_string();
    }
    let keep = MAX_DIAGNOSTIC_CHARS - TRUNCATION_MARKER.len();
    let tail: String = message.chars().skip(total - keep).collect();
    format!("{}{}", TRUNCATION_MARKER, tail)
}

/// Encode one frame as a single JSON line
pub fn encode_frame<T: Serialize>(frame: &T) -> Result<Vec<u8>> {
    let mut bytes = serde_json::to_vec(frame)?;
    if bytes.len() > MAX_FRAME_BYTES {
        return Err(ScoreboxError::Protocol(format!(
            "frame of {} bytes exceeds the {} byte limit",
            bytes.len(),
            MAX_FRAME_BYTES
        )));
    }
    bytes.push(b'\n');
    Ok(bytes)
}

pub fn write_frame<W: Write, T: Serialize>(writer: &mut W, frame: &T) -> Result<()> {
    let bytes = encode_frame(frame)?;
    writer.write_all(&bytes)?;
    writer.flush()?;
    Ok(())
}

/// Read the next frame. `Ok(None)` means the peer closed the stream cleanly.
pub fn read_frame<R: BufRead, T: DeserializeOwned>(reader: &mut R, limit: usize) -> Result<Option<T>> {
    loop {
        let mut line = Vec::new();
        let read = reader
            .by_ref()
            .take(limit as u64 + 1)
            .read_until(b'\n', &mut line)?;
        if read == 0 {
            return Ok(None);
        }

        if line.last() == Some(&b'\n') {
            line.pop();
        } else if line.len() > limit {
            return Err(ScoreboxError::Protocol(format!(
                "frame exceeds the {} byte limit",
                limit
            )));
        } else {
            return Err(ScoreboxError::Protocol(
                "stream closed in the middle of a frame".to_string(),
            ));
        }

        if line.iter().all(|b| b.is_ascii_whitespace()) {
            continue;
        }
        return serde_json::from_slice(&line)
            .map(Some)
            .map_err(|e| ScoreboxError::Protocol(format!("malformed frame: {}", e)));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{ErrorKind, ScoreRecord};
    use serde_json::Map;
    use std::io::Cursor;

    #[test]
    fn frames_are_one_line_each() {
        let request = ExecutionRequest::user_code("def f(): pass\n", Map::new());
        let bytes = encode_frame(&HostFrame::Execute {
            request_id: "r1".into(),
            request,
        })
        .unwrap();
        assert_eq!(bytes.iter().filter(|b| **b == b'\n').count(), 1);
        assert_eq!(bytes.last(), Some(&b'\n'));
    }

    #[test]
    fn reader_skips_blank_lines_and_stops_at_eof() {
        let mut stream = Vec::new();
        stream.extend_from_slice(b"\n");
        write_frame(
            &mut stream,
            &RunnerFrame::Result {
                request_id: "a".into(),
                result: ExecutionResult::success(vec![ScoreRecord::new("m", 1.0)]),
            },
        )
        .unwrap();
        let mut cursor = Cursor::new(stream);

        let frame: Option<RunnerFrame> = read_frame(&mut cursor, MAX_FRAME_BYTES).unwrap();
        match frame {
            Some(RunnerFrame::Result { request_id, result }) => {
                assert_eq!(request_id, "a");
                assert_eq!(result.scores().len(), 1);
            }
            other => panic!("unexpected frame {:?}", other),
        }
        let end: Option<RunnerFrame> = read_frame(&mut cursor, MAX_FRAME_BYTES).unwrap();
        assert!(end.is_none());
    }

    #[test]
    fn oversized_frame_is_rejected() {
        let mut cursor = Cursor::new(format!("{}\n", "x".repeat(64)).into_bytes());
        let result: Result<Option<RunnerFrame>> = read_frame(&mut cursor, 16);
        assert!(matches!(result, Err(ScoreboxError::Protocol(_))));
    }

    #[test]
    fn partial_frame_at_eof_is_an_error() {
        let mut cursor = Cursor::new(b"{\"frame\":\"shutdown\"".to_vec());
        let result: Result<Option<HostFrame>> = read_frame(&mut cursor, MAX_FRAME_BYTES);
        assert!(result.is_err());
    }

    #[test]
    fn garbage_is_a_protocol_error() {
        let mut cursor = Cursor::new(b"Traceback (most recent call last):\n".to_vec());
        let result: Result<Option<RunnerFrame>> = read_frame(&mut cursor, MAX_FRAME_BYTES);
        assert!(matches!(result, Err(ScoreboxError::Protocol(_))));
    }

    #[test]
    fn diagnostics_keep_their_tail() {
        let message = format!("{}ZeroDivisionError: division by zero", "frame\n".repeat(1000));
        let bounded = bound_diagnostic(&message);
        assert_eq!(bounded.chars().count(), MAX_DIAGNOSTIC_CHARS);
        assert!(bounded.starts_with("[truncated] "));
        assert!(bounded.ends_with("ZeroDivisionError: division by zero"));
    }

    #[test]
    fn short_diagnostics_pass_through() {
        assert_eq!(bound_diagnostic("boom"), "boom");
        let failure = ExecutionResult::failure(ErrorKind::InvalidCode, "é".repeat(MAX_DIAGNOSTIC_CHARS + 5));
        if let ExecutionResult::Failure { message, .. } = failure {
            assert_eq!(message.chars().count(), MAX_DIAGNOSTIC_CHARS);
        }
    }
}
