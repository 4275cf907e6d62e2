//! Single-line JSON frame codec shared by both wire protocols.
//!
//! Every message is one JSON object terminated by a newline. The simple
//! protocol only ever uses channel 0 and alternates request/response; the
//! streaming protocol interleaves frames for many channels and matches
//! responses to calls by `(chan, seq)`.

use std::io::{self, BufRead, Write};
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::PluginError;

/// Thread-safe call sequence generator.
static CALL_SEQ: AtomicU64 = AtomicU64::new(1);

/// Returns the next call sequence number. Monotonic and unique within the
/// process; the responder echoes it back unchanged.
#[must_use]
pub fn next_seq() -> u64 {
    CALL_SEQ.fetch_add(1, Ordering::SeqCst)
}

/// One wire message.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Frame {
    /// Channel the frame belongs to; 0 is the main service channel, broker
    /// sub-channels count up from 1.
    #[serde(default)]
    pub chan: u32,
    /// The message itself.
    #[serde(flatten)]
    pub payload: Payload,
}

/// Frame payload variants.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Payload {
    /// A call from the peer.
    Request {
        /// Caller-chosen sequence number, echoed in the response.
        seq: u64,
        /// Method to invoke, `<service>.<method>` on the main channel.
        method: String,
        /// Encoded arguments.
        #[serde(default)]
        params: Value,
    },
    /// The outcome of a call.
    Response {
        /// Sequence number of the request this answers.
        seq: u64,
        /// Result value on success.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        result: Option<Value>,
        /// Application error message on failure, carried verbatim.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    /// Retires a broker sub-channel; the serving side's `accept_and_serve`
    /// returns when it sees this.
    Close,
}

impl Frame {
    /// Builds a request frame with a fresh sequence number.
    #[must_use]
    pub fn request(chan: u32, method: impl Into<String>, params: Value) -> Self {
        Self {
            chan,
            payload: Payload::Request {
                seq: next_seq(),
                method: method.into(),
                params,
            },
        }
    }

    /// Builds a success response echoing `seq`.
    #[must_use]
    pub const fn response(chan: u32, seq: u64, result: Value) -> Self {
        Self {
            chan,
            payload: Payload::Response {
                seq,
                result: Some(result),
                error: None,
            },
        }
    }

    /// Builds an error response echoing `seq`.
    #[must_use]
    pub fn error_response(chan: u32, seq: u64, message: impl Into<String>) -> Self {
        Self {
            chan,
            payload: Payload::Response {
                seq,
                result: None,
                error: Some(message.into()),
            },
        }
    }

    /// Builds a channel-close frame.
    #[must_use]
    pub const fn close(chan: u32) -> Self {
        Self {
            chan,
            payload: Payload::Close,
        }
    }
}

/// Writes one frame as a JSON line and flushes.
///
/// # Errors
///
/// Returns the underlying I/O error; serialisation of a frame cannot fail.
pub fn write_frame(writer: &mut impl Write, frame: &Frame) -> io::Result<()> {
    let mut line = serde_json::to_vec(frame).map_err(io::Error::other)?;
    line.push(b'\n');
    writer.write_all(&line)?;
    writer.flush()
}

/// Reads one frame line. Returns `Ok(None)` on a clean EOF.
///
/// # Errors
///
/// Returns [`PluginError::Transport`] for I/O failures or a line that is
/// not valid frame JSON.
pub fn read_frame(reader: &mut impl BufRead) -> Result<Option<Frame>, PluginError> {
    let mut line = String::new();
    let bytes = reader
        .read_line(&mut line)
        .map_err(|e| PluginError::transport_io("failed to read frame", e))?;
    if bytes == 0 {
        return Ok(None);
    }
    serde_json::from_str(line.trim_end())
        .map(Some)
        .map_err(|e| PluginError::transport(format!("invalid frame: {e}")))
}

#[cfg(test)]
mod tests {
    use std::io::{BufReader, Cursor};

    use rstest::rstest;
    use serde_json::json;

    use super::*;

    fn round_trip(frame: &Frame) -> Frame {
        let mut buf = Vec::new();
        write_frame(&mut buf, frame).expect("write frame");
        let mut reader = BufReader::new(Cursor::new(buf));
        read_frame(&mut reader)
            .expect("read frame")
            .expect("frame present")
    }

    #[rstest]
    fn request_round_trips() {
        let frame = Frame::request(0, "kv.put", json!({"key": "k", "value": 5}));
        assert_eq!(round_trip(&frame), frame);
    }

    #[rstest]
    fn close_round_trips_on_sub_channel() {
        let frame = Frame::close(7);
        assert_eq!(round_trip(&frame), frame);
    }

    #[rstest]
    fn error_response_keeps_the_message_verbatim() {
        let frame = Frame::error_response(2, 41, "key not found");
        let Payload::Response { error, result, .. } = round_trip(&frame).payload else {
            panic!("expected response payload");
        };
        assert_eq!(error.as_deref(), Some("key not found"));
        assert!(result.is_none());
    }

    #[rstest]
    fn success_response_omits_the_error_field() {
        let mut buf = Vec::new();
        write_frame(&mut buf, &Frame::response(0, 3, json!("Hello!"))).expect("write frame");
        let text = String::from_utf8(buf).expect("utf8");
        assert!(!text.contains("\"error\""));
        assert!(text.ends_with('\n'));
    }

    #[rstest]
    fn eof_reads_as_none() {
        let mut reader = BufReader::new(Cursor::new(Vec::new()));
        assert!(read_frame(&mut reader).expect("clean eof").is_none());
    }

    #[rstest]
    fn garbage_line_is_a_transport_error() {
        let mut reader = BufReader::new(Cursor::new(b"not json\n".to_vec()));
        let err = read_frame(&mut reader).expect_err("should fail");
        assert!(matches!(err, PluginError::Transport { .. }));
    }

    #[rstest]
    fn sequence_numbers_are_unique() {
        let a = next_seq();
        let b = next_seq();
        assert_ne!(a, b);
        assert!(b > a);
    }
}
