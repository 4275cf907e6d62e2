//! The simple wire protocol: one in-order request/response exchange per
//! call over a dedicated socket.
//!
//! This is the lowest-common-denominator transport, usable by plugins whose
//! ecosystem lacks a streaming stack. There is no native way for the callee
//! to call back to the caller on the same channel; the broker arranges a
//! second throwaway listener instead (see [`crate::broker`]).

use std::io::{self, BufReader};
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use serde_json::Value;
use tracing::debug;

use crate::error::PluginError;
use crate::transport::frame::{self, Frame, Payload};
use crate::transport::{
    Endpoint, Invoker, ServiceDispatch, SocketStream, StatusCell, connect,
};

/// Tracing target for simple-protocol operations.
const SIMPLE_TARGET: &str = "tether::transport::simple";

struct SimpleIo {
    reader: BufReader<SocketStream>,
    writer: SocketStream,
}

/// Client half of the simple protocol.
///
/// Calls take the socket lock for their whole request/response exchange, so
/// concurrent callers are serialised in order.
pub struct SimpleClient {
    io: Mutex<SimpleIo>,
    socket: SocketStream,
    crashed: AtomicBool,
    status: StatusCell,
}

impl SimpleClient {
    /// Dials the endpoint and wraps the connection.
    ///
    /// # Errors
    ///
    /// Returns [`PluginError::Transport`] when the connection fails.
    pub fn connect(endpoint: &Endpoint, status: StatusCell) -> Result<Self, PluginError> {
        let stream = connect(endpoint)?;
        Self::from_stream(stream, status)
    }

    /// Wraps an already-connected socket.
    ///
    /// # Errors
    ///
    /// Returns [`PluginError::Transport`] when the socket handle cannot be
    /// duplicated.
    pub fn from_stream(stream: SocketStream, status: StatusCell) -> Result<Self, PluginError> {
        let writer = stream
            .try_clone()
            .map_err(|e| PluginError::transport_io("failed to clone socket", e))?;
        let socket = stream
            .try_clone()
            .map_err(|e| PluginError::transport_io("failed to clone socket", e))?;
        Ok(Self {
            io: Mutex::new(SimpleIo {
                reader: BufReader::new(stream),
                writer,
            }),
            socket,
            crashed: AtomicBool::new(false),
            status,
        })
    }

    fn fail_crashed(&self) -> PluginError {
        self.crashed.store(true, Ordering::SeqCst);
        self.status.crash_error()
    }
}

impl Invoker for SimpleClient {
    fn invoke(
        &self,
        method: &str,
        params: Value,
        deadline: Option<Duration>,
    ) -> Result<Value, PluginError> {
        if self.crashed.load(Ordering::SeqCst) {
            return Err(self.status.crash_error());
        }

        let mut io = self.io.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        let request = Frame::request(0, method, params);
        let seq = match &request.payload {
            Payload::Request { seq, .. } => *seq,
            _ => unreachable!("request constructor produces a request payload"),
        };

        frame::write_frame(&mut io.writer, &request).map_err(|e| {
            if e.kind() == io::ErrorKind::BrokenPipe {
                self.fail_crashed()
            } else {
                PluginError::transport_io(format!("failed to send '{method}'"), e)
            }
        })?;

        self.socket
            .set_read_timeout(deadline)
            .map_err(|e| PluginError::transport_io("failed to apply deadline", e))?;
        let result = read_response(&mut io, seq, method);
        drop(self.socket.set_read_timeout(None));

        match result {
            Err(PluginError::PluginCrashed { .. }) => Err(self.fail_crashed()),
            other => other,
        }
    }

    fn close(&self) {
        self.socket.shutdown();
    }
}

fn read_response(io: &mut SimpleIo, seq: u64, method: &str) -> Result<Value, PluginError> {
    loop {
        let frame = match frame::read_frame(&mut io.reader) {
            Ok(Some(frame)) => frame,
            Ok(None) => return Err(PluginError::PluginCrashed { status: None }),
            Err(PluginError::Transport { message, source }) => {
                let kind = source.as_ref().map(|e| e.kind());
                if matches!(kind, Some(io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut)) {
                    return Err(PluginError::transport(format!(
                        "deadline exceeded waiting for '{method}'"
                    )));
                }
                // A dead peer shows up as a reset or truncated read, not
                // always as a clean EOF.
                if matches!(
                    kind,
                    Some(
                        io::ErrorKind::ConnectionReset
                            | io::ErrorKind::ConnectionAborted
                            | io::ErrorKind::BrokenPipe
                            | io::ErrorKind::UnexpectedEof
                    )
                ) {
                    return Err(PluginError::PluginCrashed { status: None });
                }
                return Err(PluginError::Transport { message, source });
            }
            Err(other) => return Err(other),
        };

        match frame.payload {
            Payload::Response {
                seq: got,
                result,
                error,
            } if got == seq => {
                return match error {
                    Some(message) => Err(PluginError::Remote { message }),
                    None => Ok(result.unwrap_or(Value::Null)),
                };
            }
            // Late reply to an earlier call whose deadline expired; the
            // caller already gave up on it, so discard and keep reading.
            Payload::Response { seq: got, .. } if got < seq => continue,
            other => {
                return Err(PluginError::transport(format!(
                    "protocol violation: expected response {seq} to '{method}', got {other:?}"
                )));
            }
        }
    }
}

/// Serves one connection: reads requests in order and answers each before
/// reading the next. Returns when the peer disconnects.
pub fn serve_connection(stream: SocketStream, service: &dyn ServiceDispatch) {
    let writer = match stream.try_clone() {
        Ok(writer) => writer,
        Err(error) => {
            debug!(target: SIMPLE_TARGET, %error, "failed to clone connection socket");
            return;
        }
    };
    let mut reader = BufReader::new(stream);
    let mut writer = writer;

    loop {
        let frame = match frame::read_frame(&mut reader) {
            Ok(Some(frame)) => frame,
            Ok(None) => {
                debug!(target: SIMPLE_TARGET, "peer disconnected");
                return;
            }
            Err(error) => {
                debug!(target: SIMPLE_TARGET, %error, "dropping connection");
                return;
            }
        };

        let Payload::Request { seq, method, params } = frame.payload else {
            debug!(target: SIMPLE_TARGET, "ignoring non-request frame");
            continue;
        };

        let response = match service.dispatch(&method, params) {
            Ok(result) => Frame::response(0, seq, result),
            Err(error) => Frame::error_response(0, seq, error.message()),
        };

        if let Err(error) = frame::write_frame(&mut writer, &response) {
            debug!(target: SIMPLE_TARGET, %error, "failed to write response");
            return;
        }
    }
}
