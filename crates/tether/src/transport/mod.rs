//! Wire transports and the RPC contracts shared by both of them.
//!
//! Two interchangeable wire protocols sit on top of the same socket and
//! frame plumbing: [`simple`] is a strict in-order call/response exchange,
//! [`stream`] multiplexes concurrent calls and callback sub-channels over
//! one physical connection. Which one a session uses is decided during the
//! handshake; everything above this module only sees the [`Invoker`] and
//! [`ServiceDispatch`] seams.

use std::collections::HashMap;
use std::fmt;
use std::io::{self, Read, Write};
use std::net::{Shutdown, TcpListener, TcpStream};
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::PathBuf;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::error::PluginError;

pub mod frame;
pub mod simple;
pub mod stream;

#[cfg(test)]
mod tests;

/// Network endpoint a plugin serves on, as announced in the handshake line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Endpoint {
    /// Loopback TCP address, e.g. `127.0.0.1:43217`.
    Tcp {
        /// The `host:port` address string.
        addr: String,
    },
    /// Unix domain socket path.
    Unix {
        /// Filesystem path of the socket.
        path: PathBuf,
    },
}

impl Endpoint {
    /// Builds an endpoint from handshake `NETWORK_TYPE` and `ADDRESS` tokens.
    ///
    /// # Errors
    ///
    /// Returns [`PluginError::MalformedHandshake`] for an unknown network
    /// type token.
    pub fn from_tokens(network: &str, address: &str) -> Result<Self, PluginError> {
        match network {
            "tcp" => Ok(Self::Tcp {
                addr: address.to_owned(),
            }),
            "unix" => Ok(Self::Unix {
                path: PathBuf::from(address),
            }),
            other => Err(PluginError::MalformedHandshake {
                message: format!("unknown network type '{other}' (expected 'tcp' or 'unix')"),
            }),
        }
    }

    /// Returns the handshake `NETWORK_TYPE` token.
    #[must_use]
    pub const fn network_token(&self) -> &'static str {
        match self {
            Self::Tcp { .. } => "tcp",
            Self::Unix { .. } => "unix",
        }
    }

    /// Returns the handshake `ADDRESS` token.
    #[must_use]
    pub fn address_token(&self) -> String {
        match self {
            Self::Tcp { addr } => addr.clone(),
            Self::Unix { path } => path.display().to_string(),
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.network_token(), self.address_token())
    }
}

/// A connected socket of either supported kind.
#[derive(Debug)]
pub enum SocketStream {
    /// TCP connection.
    Tcp(TcpStream),
    /// Unix domain socket connection.
    Unix(UnixStream),
}

impl SocketStream {
    /// Clones the underlying socket handle.
    ///
    /// # Errors
    ///
    /// Returns the OS error when the handle cannot be duplicated.
    pub fn try_clone(&self) -> io::Result<Self> {
        match self {
            Self::Tcp(s) => s.try_clone().map(Self::Tcp),
            Self::Unix(s) => s.try_clone().map(Self::Unix),
        }
    }

    /// Applies a read timeout to the socket (`None` clears it).
    ///
    /// # Errors
    ///
    /// Returns the OS error when the timeout cannot be applied.
    pub fn set_read_timeout(&self, timeout: Option<Duration>) -> io::Result<()> {
        match self {
            Self::Tcp(s) => s.set_read_timeout(timeout),
            Self::Unix(s) => s.set_read_timeout(timeout),
        }
    }

    fn set_nonblocking_off(&self) -> io::Result<()> {
        match self {
            Self::Tcp(s) => s.set_nonblocking(false),
            Self::Unix(s) => s.set_nonblocking(false),
        }
    }

    /// Shuts down both directions of the socket, waking any blocked reader.
    pub fn shutdown(&self) {
        match self {
            Self::Tcp(s) => drop(s.shutdown(Shutdown::Both)),
            Self::Unix(s) => drop(s.shutdown(Shutdown::Both)),
        }
    }
}

impl Read for SocketStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            Self::Tcp(s) => s.read(buf),
            Self::Unix(s) => s.read(buf),
        }
    }
}

impl Write for SocketStream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            Self::Tcp(s) => s.write(buf),
            Self::Unix(s) => s.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            Self::Tcp(s) => s.flush(),
            Self::Unix(s) => s.flush(),
        }
    }
}

/// A bound listener of either supported kind.
#[derive(Debug)]
pub enum SocketListener {
    /// TCP listener.
    Tcp(TcpListener),
    /// Unix domain socket listener.
    Unix(UnixListener),
}

impl SocketListener {
    /// Binds an ephemeral loopback TCP listener.
    ///
    /// # Errors
    ///
    /// Returns [`PluginError::Transport`] when binding fails.
    pub fn bind_loopback() -> Result<(Self, Endpoint), PluginError> {
        let listener = TcpListener::bind(("127.0.0.1", 0))
            .map_err(|e| PluginError::transport_io("failed to bind loopback listener", e))?;
        let addr = listener
            .local_addr()
            .map_err(|e| PluginError::transport_io("failed to read local address", e))?;
        Ok((
            Self::Tcp(listener),
            Endpoint::Tcp {
                addr: addr.to_string(),
            },
        ))
    }

    /// Binds a unix domain socket at the given path.
    ///
    /// # Errors
    ///
    /// Returns [`PluginError::Transport`] when binding fails.
    pub fn bind_unix(path: PathBuf) -> Result<(Self, Endpoint), PluginError> {
        let listener = UnixListener::bind(&path).map_err(|e| {
            PluginError::transport_io(format!("failed to bind unix socket {}", path.display()), e)
        })?;
        Ok((Self::Unix(listener), Endpoint::Unix { path }))
    }

    /// Accepts one connection, giving up after `timeout`.
    ///
    /// # Errors
    ///
    /// Returns [`PluginError::Transport`] when the accept fails or no peer
    /// dials in before the timeout.
    pub fn accept_timeout(&self, timeout: Duration) -> Result<SocketStream, PluginError> {
        self.set_nonblocking(true)
            .map_err(|e| PluginError::transport_io("failed to switch listener mode", e))?;
        let deadline = std::time::Instant::now() + timeout;
        let result = loop {
            match self.try_accept() {
                Ok(Some(stream)) => break Ok(stream),
                Ok(None) => {
                    if std::time::Instant::now() >= deadline {
                        break Err(PluginError::transport(format!(
                            "no peer dialed within {}ms",
                            timeout.as_millis()
                        )));
                    }
                    std::thread::sleep(Duration::from_millis(10));
                }
                Err(e) => break Err(PluginError::transport_io("accept failed", e)),
            }
        };
        drop(self.set_nonblocking(false));
        if let Ok(stream) = &result {
            stream
                .set_nonblocking_off()
                .map_err(|e| PluginError::transport_io("failed to switch socket mode", e))?;
        }
        result
    }

    fn set_nonblocking(&self, on: bool) -> io::Result<()> {
        match self {
            Self::Tcp(listener) => listener.set_nonblocking(on),
            Self::Unix(listener) => listener.set_nonblocking(on),
        }
    }

    fn try_accept(&self) -> io::Result<Option<SocketStream>> {
        let accepted = match self {
            Self::Tcp(listener) => listener.accept().map(|(s, _)| SocketStream::Tcp(s)),
            Self::Unix(listener) => listener.accept().map(|(s, _)| SocketStream::Unix(s)),
        };
        match accepted {
            Ok(stream) => Ok(Some(stream)),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Accepts one connection, blocking until a peer dials in.
    ///
    /// # Errors
    ///
    /// Returns [`PluginError::Transport`] when the accept fails.
    pub fn accept(&self) -> Result<SocketStream, PluginError> {
        match self {
            Self::Tcp(listener) => listener
                .accept()
                .map(|(stream, _)| SocketStream::Tcp(stream))
                .map_err(|e| PluginError::transport_io("tcp accept failed", e)),
            Self::Unix(listener) => listener
                .accept()
                .map(|(stream, _)| SocketStream::Unix(stream))
                .map_err(|e| PluginError::transport_io("unix accept failed", e)),
        }
    }
}

/// Dials the endpoint a plugin announced in its handshake line.
///
/// # Errors
///
/// Returns [`PluginError::Transport`] when the connection is refused or the
/// socket path is stale.
pub fn connect(endpoint: &Endpoint) -> Result<SocketStream, PluginError> {
    match endpoint {
        Endpoint::Tcp { addr } => TcpStream::connect(addr.as_str())
            .map(SocketStream::Tcp)
            .map_err(|e| PluginError::transport_io(format!("failed to connect to tcp {addr}"), e)),
        Endpoint::Unix { path } => UnixStream::connect(path).map(SocketStream::Unix).map_err(|e| {
            PluginError::transport_io(format!("failed to connect to unix {}", path.display()), e)
        }),
    }
}

/// An application-level error produced by a service implementation.
///
/// Travels back to the caller verbatim inside the response frame and
/// surfaces there as [`PluginError::Remote`], distinct from any transport
/// or negotiation fault.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceError {
    message: String,
}

impl ServiceError {
    /// Creates a service error with the given message.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }

    /// Returns the error message.
    #[must_use]
    pub fn message(&self) -> &str {
        &self.message
    }
}

impl fmt::Display for ServiceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

impl std::error::Error for ServiceError {}

impl From<String> for ServiceError {
    fn from(message: String) -> Self {
        Self { message }
    }
}

impl From<&str> for ServiceError {
    fn from(message: &str) -> Self {
        Self::new(message)
    }
}

/// Server-side dispatch seam: forwards a decoded call to a concrete local
/// implementation.
pub trait ServiceDispatch: Send + Sync {
    /// Handles one call and produces its result value.
    ///
    /// # Errors
    ///
    /// Returns a [`ServiceError`] when the implementation itself fails; the
    /// message is carried back to the caller verbatim.
    fn dispatch(&self, method: &str, params: Value) -> Result<Value, ServiceError>;
}

/// Client-side invocation seam implemented by both wire protocols.
pub trait Invoker: Send + Sync {
    /// Performs one remote call, blocking until the response arrives, the
    /// optional deadline expires, or the connection fails.
    ///
    /// # Errors
    ///
    /// Returns [`PluginError::Remote`] when the callee's logic failed,
    /// [`PluginError::PluginCrashed`] when the peer went away, or
    /// [`PluginError::Transport`] for other connection-level faults
    /// (including an expired deadline).
    fn invoke(
        &self,
        method: &str,
        params: Value,
        deadline: Option<Duration>,
    ) -> Result<Value, PluginError>;

    /// Releases the connection or sub-channel backing this invoker.
    fn close(&self);
}

/// A cloneable handle for making remote calls, optionally scoped to one
/// plugin's method namespace.
#[derive(Clone)]
pub struct RpcClient {
    inner: Arc<dyn Invoker>,
    prefix: Option<String>,
}

impl RpcClient {
    /// Wraps a raw invoker.
    pub fn new(inner: Arc<dyn Invoker>) -> Self {
        Self {
            inner,
            prefix: None,
        }
    }

    /// Returns a handle whose calls are routed to the named plugin's
    /// dispatcher (`<name>.<method>` on the wire).
    #[must_use]
    pub fn scoped(&self, name: &str) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
            prefix: Some(name.to_owned()),
        }
    }

    /// Performs one remote call with raw JSON values.
    ///
    /// # Errors
    ///
    /// Propagates the invoker's error; see [`Invoker::invoke`].
    pub fn invoke(
        &self,
        method: &str,
        params: Value,
        deadline: Option<Duration>,
    ) -> Result<Value, PluginError> {
        match &self.prefix {
            Some(prefix) => self.inner.invoke(&format!("{prefix}.{method}"), params, deadline),
            None => self.inner.invoke(method, params, deadline),
        }
    }

    /// Performs one remote call with typed parameters and result.
    ///
    /// # Errors
    ///
    /// Propagates the invoker's error, or [`PluginError::Transport`] when
    /// the result value does not deserialise as `R`.
    pub fn call<P: Serialize, R: DeserializeOwned>(
        &self,
        method: &str,
        params: &P,
    ) -> Result<R, PluginError> {
        let params = serde_json::to_value(params)
            .map_err(|e| PluginError::transport(format!("failed to encode parameters: {e}")))?;
        let value = self.invoke(method, params, None)?;
        serde_json::from_value(value).map_err(|e| {
            PluginError::transport(format!("failed to decode result for '{method}': {e}"))
        })
    }

    /// Releases the underlying connection or sub-channel.
    pub fn close(&self) {
        self.inner.close();
    }
}

impl fmt::Debug for RpcClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RpcClient")
            .field("prefix", &self.prefix)
            .finish_non_exhaustive()
    }
}

/// Routes `<service>.<method>` calls to named dispatchers.
///
/// The main channel of every connection carries one router; callback
/// sub-channels carry a single bare service instead.
#[derive(Default)]
pub struct Router {
    services: RwLock<HashMap<String, Arc<dyn ServiceDispatch>>>,
}

impl Router {
    /// Creates an empty router.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a dispatcher under a service name.
    pub fn register(&self, name: impl Into<String>, service: Arc<dyn ServiceDispatch>) {
        let mut services = self
            .services
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        services.insert(name.into(), service);
    }
}

impl ServiceDispatch for Router {
    fn dispatch(&self, method: &str, params: Value) -> Result<Value, ServiceError> {
        let Some((name, rest)) = method.split_once('.') else {
            return Err(ServiceError::new(format!(
                "method '{method}' is not of the form '<service>.<method>'"
            )));
        };
        let service = {
            let services = self
                .services
                .read()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            services.get(name).cloned()
        };
        match service {
            Some(service) => service.dispatch(rest, params),
            None => Err(ServiceError::new(format!("unknown service '{name}'"))),
        }
    }
}

/// Shared cell through which the supervisor publishes the subprocess exit
/// status so connection-level crash errors can name it.
#[derive(Debug, Clone, Default)]
pub struct StatusCell(Arc<Mutex<Option<i32>>>);

impl StatusCell {
    /// Creates an empty cell.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Records the exit status once known.
    pub fn record(&self, status: i32) {
        let mut slot = self.0.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        slot.get_or_insert(status);
    }

    /// Returns the recorded exit status, if any.
    #[must_use]
    pub fn get(&self) -> Option<i32> {
        *self.0.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Builds the crash error this cell currently describes.
    #[must_use]
    pub fn crash_error(&self) -> PluginError {
        PluginError::PluginCrashed {
            status: self.get(),
        }
    }
}
