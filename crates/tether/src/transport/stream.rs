//! The streaming wire protocol: concurrent calls and broker sub-channels
//! multiplexed over one physical connection.
//!
//! Both ends are symmetric. Each side holds the write half behind a mutex
//! and runs one reader thread that routes incoming frames: responses are
//! matched to pending calls by `(chan, seq)`, requests are dispatched to
//! the channel's registered service on a worker thread, and a `Close`
//! frame retires its sub-channel. A single call's request/response pair is
//! strictly ordered; calls on different sequences may complete out of
//! order.

use std::collections::{HashMap, HashSet};
use std::io::{self, BufReader};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::{Arc, Condvar, Mutex, PoisonError, RwLock};
use std::thread;
use std::time::Duration;

use serde_json::Value;
use tracing::{debug, warn};

use crate::error::PluginError;
use crate::transport::frame::{self, Frame, Payload};
use crate::transport::{Invoker, ServiceDispatch, SocketStream, StatusCell};

/// Tracing target for stream-protocol operations.
const STREAM_TARGET: &str = "tether::transport::stream";

/// Interval at which channel waiters re-check the crash flag.
const WAIT_POLL: Duration = Duration::from_millis(100);

type PendingMap = HashMap<(u32, u64), mpsc::Sender<Result<Value, PluginError>>>;

/// One end of a multiplexed connection.
pub struct StreamConnection {
    writer: Mutex<SocketStream>,
    socket: SocketStream,
    pending: Mutex<PendingMap>,
    services: RwLock<HashMap<u32, Arc<dyn ServiceDispatch>>>,
    retired: Mutex<HashSet<u32>>,
    retired_cv: Condvar,
    crashed: AtomicBool,
    status: StatusCell,
}

impl StreamConnection {
    /// Wraps a connected socket and starts the reader thread. The main
    /// service handles requests arriving on channel 0.
    ///
    /// # Errors
    ///
    /// Returns [`PluginError::Transport`] when the socket handle cannot be
    /// duplicated.
    pub fn establish(
        stream: SocketStream,
        main_service: Arc<dyn ServiceDispatch>,
        status: StatusCell,
    ) -> Result<Arc<Self>, PluginError> {
        let (conn, reader) = Self::establish_paused(stream, main_service, status)?;
        reader.start();
        Ok(conn)
    }

    /// Like [`establish`](Self::establish), but leaves the reader stopped
    /// so the caller can finish wiring services before any frame is
    /// processed. Nothing is received until [`ReaderStart::start`] runs.
    ///
    /// # Errors
    ///
    /// Returns [`PluginError::Transport`] when the socket handle cannot be
    /// duplicated.
    pub fn establish_paused(
        stream: SocketStream,
        main_service: Arc<dyn ServiceDispatch>,
        status: StatusCell,
    ) -> Result<(Arc<Self>, ReaderStart), PluginError> {
        let writer = stream
            .try_clone()
            .map_err(|e| PluginError::transport_io("failed to clone socket", e))?;
        let socket = stream
            .try_clone()
            .map_err(|e| PluginError::transport_io("failed to clone socket", e))?;

        let mut services = HashMap::new();
        services.insert(0, main_service);

        let conn = Arc::new(Self {
            writer: Mutex::new(writer),
            socket,
            pending: Mutex::new(HashMap::new()),
            services: RwLock::new(services),
            retired: Mutex::new(HashSet::new()),
            retired_cv: Condvar::new(),
            crashed: AtomicBool::new(false),
            status,
        });

        let reader = ReaderStart {
            conn: Arc::clone(&conn),
            reader: BufReader::new(stream),
        };
        Ok((conn, reader))
    }

    /// Performs one call on the given channel.
    ///
    /// # Errors
    ///
    /// See [`Invoker::invoke`].
    pub fn invoke_on(
        &self,
        chan: u32,
        method: &str,
        params: Value,
        deadline: Option<Duration>,
    ) -> Result<Value, PluginError> {
        if self.crashed.load(Ordering::SeqCst) {
            return Err(self.status.crash_error());
        }

        let request = Frame::request(chan, method, params);
        let seq = match &request.payload {
            Payload::Request { seq, .. } => *seq,
            _ => unreachable!("request constructor produces a request payload"),
        };

        let (tx, rx) = mpsc::channel();
        {
            let mut pending = self.lock_pending();
            pending.insert((chan, seq), tx);
        }

        if let Err(error) = self.send_frame(&request) {
            self.lock_pending().remove(&(chan, seq));
            return Err(if error.kind() == io::ErrorKind::BrokenPipe {
                self.status.crash_error()
            } else {
                PluginError::transport_io(format!("failed to send '{method}'"), error)
            });
        }

        let outcome = match deadline {
            Some(limit) => rx.recv_timeout(limit),
            None => rx.recv().map_err(|_| RecvTimeoutError::Disconnected),
        };

        match outcome {
            Ok(result) => result,
            Err(RecvTimeoutError::Timeout) => {
                // Abandon only this call; the connection stays usable.
                self.lock_pending().remove(&(chan, seq));
                Err(PluginError::transport(format!(
                    "deadline exceeded waiting for '{method}'"
                )))
            }
            Err(RecvTimeoutError::Disconnected) => Err(self.status.crash_error()),
        }
    }

    /// Registers a service to receive requests on a broker sub-channel.
    ///
    /// # Errors
    ///
    /// Returns [`PluginError::Transport`] when the channel is retired or
    /// already serving, or [`PluginError::PluginCrashed`] when the
    /// connection is gone.
    pub fn register_channel(
        &self,
        chan: u32,
        service: Arc<dyn ServiceDispatch>,
    ) -> Result<(), PluginError> {
        if self.crashed.load(Ordering::SeqCst) {
            return Err(self.status.crash_error());
        }
        if self.lock_retired().contains(&chan) {
            return Err(PluginError::transport(format!(
                "channel {chan} has already been retired"
            )));
        }
        let mut services = self
            .services
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        if services.contains_key(&chan) {
            return Err(PluginError::transport(format!(
                "channel {chan} is already serving"
            )));
        }
        services.insert(chan, service);
        Ok(())
    }

    /// Blocks until the peer retires the channel with a `Close` frame.
    ///
    /// # Errors
    ///
    /// Returns [`PluginError::PluginCrashed`] when the connection fails
    /// before the channel is retired.
    pub fn wait_channel_retired(&self, chan: u32) -> Result<(), PluginError> {
        let mut retired = self.lock_retired();
        loop {
            if retired.contains(&chan) {
                return Ok(());
            }
            if self.crashed.load(Ordering::SeqCst) {
                return Err(self.status.crash_error());
            }
            let (guard, _) = self
                .retired_cv
                .wait_timeout(retired, WAIT_POLL)
                .unwrap_or_else(PoisonError::into_inner);
            retired = guard;
        }
    }

    /// Sends the `Close` frame that retires a sub-channel on the peer.
    pub fn close_channel(&self, chan: u32) {
        if let Err(error) = self.send_frame(&Frame::close(chan)) {
            debug!(target: STREAM_TARGET, chan, %error, "failed to send close frame");
        }
    }

    /// Tears down the physical connection; all pending and future calls
    /// fail.
    pub fn close(&self) {
        self.socket.shutdown();
    }

    /// Returns `true` once the connection has failed.
    #[must_use]
    pub fn is_crashed(&self) -> bool {
        self.crashed.load(Ordering::SeqCst)
    }

    fn send_frame(&self, frame: &Frame) -> io::Result<()> {
        let mut writer = self.writer.lock().unwrap_or_else(PoisonError::into_inner);
        frame::write_frame(&mut *writer, frame)
    }

    fn lock_pending(&self) -> std::sync::MutexGuard<'_, PendingMap> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_retired(&self) -> std::sync::MutexGuard<'_, HashSet<u32>> {
        self.retired.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn reader_loop(self: Arc<Self>, mut reader: BufReader<SocketStream>) {
        loop {
            match frame::read_frame(&mut reader) {
                Ok(Some(frame)) => Self::route_frame(&self, frame),
                Ok(None) => {
                    debug!(target: STREAM_TARGET, "peer closed the connection");
                    break;
                }
                Err(error) => {
                    debug!(target: STREAM_TARGET, %error, "connection read failed");
                    break;
                }
            }
        }
        self.fail_connection();
    }

    fn route_frame(conn: &Arc<Self>, frame: Frame) {
        let chan = frame.chan;
        match frame.payload {
            Payload::Request { seq, method, params } => {
                Self::handle_request(conn, chan, seq, method, params);
            }
            Payload::Response { seq, result, error } => {
                let sender = conn.lock_pending().remove(&(chan, seq));
                if let Some(sender) = sender {
                    let outcome = match error {
                        Some(message) => Err(PluginError::Remote { message }),
                        None => Ok(result.unwrap_or(Value::Null)),
                    };
                    drop(sender.send(outcome));
                } else {
                    debug!(
                        target: STREAM_TARGET,
                        chan, seq, "dropping response with no pending call"
                    );
                }
            }
            Payload::Close => conn.retire_channel(chan),
        }
    }

    fn handle_request(conn: &Arc<Self>, chan: u32, seq: u64, method: String, params: Value) {
        let service = {
            let services = conn.services.read().unwrap_or_else(PoisonError::into_inner);
            services.get(&chan).cloned()
        };
        let conn = Arc::clone(conn);
        thread::spawn(move || {
            let response = match service {
                Some(service) => match service.dispatch(&method, params) {
                    Ok(result) => Frame::response(chan, seq, result),
                    Err(error) => Frame::error_response(chan, seq, error.message()),
                },
                None => Frame::error_response(chan, seq, format!("no service on channel {chan}")),
            };
            if let Err(error) = conn.send_frame(&response) {
                debug!(
                    target: STREAM_TARGET,
                    chan, seq, %error, "failed to write response"
                );
            }
        });
    }

    fn retire_channel(&self, chan: u32) {
        {
            let mut services = self
                .services
                .write()
                .unwrap_or_else(PoisonError::into_inner);
            services.remove(&chan);
        }
        self.lock_retired().insert(chan);
        self.retired_cv.notify_all();
        debug!(target: STREAM_TARGET, chan, "channel retired");
    }

    fn fail_connection(&self) {
        self.crashed.store(true, Ordering::SeqCst);
        let pending = {
            let mut map = self.lock_pending();
            std::mem::take(&mut *map)
        };
        if !pending.is_empty() {
            warn!(
                target: STREAM_TARGET,
                calls = pending.len(),
                "connection lost with calls in flight"
            );
        }
        for sender in pending.into_values() {
            drop(sender.send(Err(self.status.crash_error())));
        }
        self.retired_cv.notify_all();
    }
}

/// Deferred reader for a connection made with
/// [`StreamConnection::establish_paused`].
pub struct ReaderStart {
    conn: Arc<StreamConnection>,
    reader: BufReader<SocketStream>,
}

impl ReaderStart {
    /// Starts the reader thread; the connection begins receiving frames.
    pub fn start(self) {
        thread::spawn(move || self.conn.reader_loop(self.reader));
    }
}

/// A client handle bound to one channel of a [`StreamConnection`].
pub struct StreamChannel {
    conn: Arc<StreamConnection>,
    chan: u32,
}

impl StreamChannel {
    /// Binds a handle to a channel; channel 0 is the main service.
    #[must_use]
    pub const fn new(conn: Arc<StreamConnection>, chan: u32) -> Self {
        Self { conn, chan }
    }
}

impl Invoker for StreamChannel {
    fn invoke(
        &self,
        method: &str,
        params: Value,
        deadline: Option<Duration>,
    ) -> Result<Value, PluginError> {
        self.conn.invoke_on(self.chan, method, params, deadline)
    }

    fn close(&self) {
        if self.chan == 0 {
            self.conn.close();
        } else {
            self.conn.close_channel(self.chan);
        }
    }
}
