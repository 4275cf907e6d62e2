//! Connection broker for callback sub-channels.
//!
//! A session's main channel carries plugin calls; whenever one side needs
//! the other to call it back (a progress sink, a helper service, a watch),
//! the broker hands out a fresh channel id and wires up a dedicated channel
//! for it. How the channel is realised depends on the wire protocol: the
//! stream protocol multiplexes it over the existing connection, the simple
//! protocol binds a throwaway listener and announces its endpoint to the
//! peer through the reserved `_broker.register` call.
//!
//! The usual shape on the serving side is:
//!
//! ```text
//! let id = broker.next_id();
//! let server = broker.serve_channel(id, service)?;
//! client.invoke("use_helper", json!({ "helper": id }), None)?;
//! server.join()?;
//! ```
//!
//! and the peer, upon receiving `id` inside a call, does `broker.dial(id)`.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use serde::Deserialize;
use serde_json::{Value, json};
use tracing::{debug, warn};

use crate::error::PluginError;
use crate::transport::simple::{SimpleClient, serve_connection};
use crate::transport::stream::{StreamChannel, StreamConnection};
use crate::transport::{
    Endpoint, RpcClient, ServiceDispatch, ServiceError, SocketListener, StatusCell,
};


/// Tracing target for broker operations.
const BROKER_TARGET: &str = "tether::broker";

/// Reserved service name for broker traffic on the main channel. Plugin
/// names starting with `_` are rejected at registration, so this can never
/// collide with an application service.
pub const BROKER_SERVICE: &str = "_broker";

/// Method through which a simple-protocol peer learns a callback endpoint.
const REGISTER_METHOD: &str = "register";

/// How long a served channel waits for the peer to dial in.
const ACCEPT_TIMEOUT: Duration = Duration::from_secs(10);

/// How long `dial` waits for the peer's endpoint announcement.
const ANNOUNCE_TIMEOUT: Duration = Duration::from_secs(5);

/// A channel set up for serving, waiting for the peer.
enum ServerChannel {
    /// Multiplexed sub-channel, already registered on the connection.
    Stream(Arc<StreamConnection>),
    /// Throwaway listener whose endpoint has been announced to the peer.
    Simple(SocketListener),
}

/// The connection a broker arranges its channels over.
enum Link {
    /// Sub-channels are multiplexed over the session connection.
    Stream(Arc<StreamConnection>),
    /// Sub-channels get their own socket each. `control` is an unscoped
    /// client over the main connection, used to announce endpoints; only
    /// the host side has one, so only the host can serve channels.
    Simple {
        control: Option<RpcClient>,
        status: StatusCell,
    },
}

/// Allocates callback channel ids and opens the channels behind them.
///
/// One broker exists per session end. Ids it allocates are unique for the
/// session's lifetime and are never reused, even after their channel is
/// torn down.
pub struct Broker {
    ids: AtomicU32,
    link: Link,
    dialed: Mutex<HashSet<u32>>,
    announced: Mutex<HashMap<u32, Endpoint>>,
    announced_cv: Condvar,
}

impl Broker {
    /// Creates the broker for a stream-protocol session end.
    #[must_use]
    pub(crate) fn for_stream(conn: Arc<StreamConnection>) -> Arc<Self> {
        Arc::new(Self::new(Link::Stream(conn)))
    }

    /// Creates the broker for a simple-protocol session end. The host side
    /// passes an unscoped client over the main connection; the plugin side
    /// passes `None` and can only dial.
    #[must_use]
    pub(crate) fn for_simple(control: Option<RpcClient>, status: StatusCell) -> Arc<Self> {
        Arc::new(Self::new(Link::Simple { control, status }))
    }

    fn new(link: Link) -> Self {
        Self {
            // Channel 0 is the main channel; sub-channels start at 1.
            ids: AtomicU32::new(1),
            link,
            dialed: Mutex::new(HashSet::new()),
            announced: Mutex::new(HashMap::new()),
            announced_cv: Condvar::new(),
        }
    }

    /// Allocates a fresh channel id.
    #[must_use]
    pub fn next_id(&self) -> u32 {
        self.ids.fetch_add(1, Ordering::SeqCst)
    }

    /// Serves `service` on the given channel, blocking until the peer tears
    /// the channel down.
    ///
    /// Call [`next_id`](Self::next_id) first and hand the id to the peer
    /// inside an application call so it knows what to dial. Prefer
    /// [`serve_channel`](Self::serve_channel), which does the waiting on
    /// its own thread.
    ///
    /// # Errors
    ///
    /// Returns [`PluginError::Configuration`] when this end cannot serve
    /// channels (the plugin side of a simple-protocol session), or a
    /// connection-level error when the channel cannot be established.
    pub fn accept_and_serve(
        &self,
        id: u32,
        service: Arc<dyn ServiceDispatch>,
    ) -> Result<(), PluginError> {
        let channel = self.open_server_channel(id, Arc::clone(&service))?;
        self.run_server_channel(id, channel, service)
    }

    /// Serves `service` on the given channel from a background thread and
    /// returns a guard over it.
    ///
    /// The channel is ready for the peer to dial before this returns, so
    /// the id can be sent to the peer immediately afterwards.
    ///
    /// # Errors
    ///
    /// See [`accept_and_serve`](Self::accept_and_serve); setup failures
    /// surface here, failures while serving surface from
    /// [`ChannelServer::join`].
    pub fn serve_channel(
        self: &Arc<Self>,
        id: u32,
        service: Arc<dyn ServiceDispatch>,
    ) -> Result<ChannelServer, PluginError> {
        let channel = self.open_server_channel(id, Arc::clone(&service))?;
        let broker = Arc::clone(self);
        let handle = thread::spawn(move || broker.run_server_channel(id, channel, service));
        Ok(ChannelServer {
            id,
            handle: Some(handle),
        })
    }

    fn open_server_channel(
        &self,
        id: u32,
        service: Arc<dyn ServiceDispatch>,
    ) -> Result<ServerChannel, PluginError> {
        match &self.link {
            Link::Stream(conn) => {
                conn.register_channel(id, service)?;
                debug!(target: BROKER_TARGET, id, "serving stream sub-channel");
                Ok(ServerChannel::Stream(Arc::clone(conn)))
            }
            Link::Simple {
                control: Some(control),
                ..
            } => {
                let (listener, endpoint) = SocketListener::bind_loopback()?;
                control.invoke(
                    &format!("{BROKER_SERVICE}.{REGISTER_METHOD}"),
                    json!({
                        "id": id,
                        "network": endpoint.network_token(),
                        "address": endpoint.address_token(),
                    }),
                    Some(ANNOUNCE_TIMEOUT),
                )?;
                debug!(target: BROKER_TARGET, id, %endpoint, "announced callback endpoint");
                Ok(ServerChannel::Simple(listener))
            }
            Link::Simple { control: None, .. } => Err(PluginError::Configuration {
                message: format!(
                    "channel {id} cannot be served from this side: \
                     the simple protocol only supports host-served callback channels"
                ),
            }),
        }
    }

    fn run_server_channel(
        &self,
        id: u32,
        channel: ServerChannel,
        service: Arc<dyn ServiceDispatch>,
    ) -> Result<(), PluginError> {
        match channel {
            ServerChannel::Stream(conn) => conn.wait_channel_retired(id),
            ServerChannel::Simple(listener) => {
                let stream = listener.accept_timeout(ACCEPT_TIMEOUT)?;
                serve_connection(stream, service.as_ref());
                Ok(())
            }
        }
    }

    /// Opens a client for a channel the peer is serving.
    ///
    /// Each id can be dialed at most once. Closing the returned client
    /// tears the channel down and unblocks the peer's server.
    ///
    /// # Errors
    ///
    /// Returns [`PluginError::Transport`] when the id was already dialed,
    /// when no endpoint announcement arrives in time (simple protocol), or
    /// when the callback connection fails.
    pub fn dial(&self, id: u32) -> Result<RpcClient, PluginError> {
        {
            let mut dialed = self.dialed.lock().unwrap_or_else(PoisonError::into_inner);
            if !dialed.insert(id) {
                return Err(PluginError::transport(format!(
                    "channel {id} has already been dialed"
                )));
            }
        }
        let client = self.open(id);
        if client.is_err() {
            let mut dialed = self.dialed.lock().unwrap_or_else(PoisonError::into_inner);
            dialed.remove(&id);
        }
        client
    }

    fn open(&self, id: u32) -> Result<RpcClient, PluginError> {
        match &self.link {
            Link::Stream(conn) => Ok(RpcClient::new(Arc::new(StreamChannel::new(
                Arc::clone(conn),
                id,
            )))),
            Link::Simple { status, .. } => {
                let endpoint = self.wait_announced(id)?;
                debug!(target: BROKER_TARGET, id, %endpoint, "dialing callback endpoint");
                let client = SimpleClient::connect(&endpoint, status.clone())?;
                Ok(RpcClient::new(Arc::new(client)))
            }
        }
    }

    fn wait_announced(&self, id: u32) -> Result<Endpoint, PluginError> {
        let deadline = std::time::Instant::now() + ANNOUNCE_TIMEOUT;
        let mut announced = self.announced.lock().unwrap_or_else(PoisonError::into_inner);
        loop {
            if let Some(endpoint) = announced.get(&id) {
                return Ok(endpoint.clone());
            }
            let now = std::time::Instant::now();
            if now >= deadline {
                return Err(PluginError::transport(format!(
                    "no endpoint announced for channel {id} within {}ms",
                    ANNOUNCE_TIMEOUT.as_millis()
                )));
            }
            let (guard, _) = self
                .announced_cv
                .wait_timeout(announced, deadline - now)
                .unwrap_or_else(PoisonError::into_inner);
            announced = guard;
        }
    }

    /// Returns the dispatcher for incoming `_broker.register` calls, to be
    /// registered on the main channel's router under [`BROKER_SERVICE`].
    #[must_use]
    pub(crate) fn registrar(self: &Arc<Self>) -> Arc<dyn ServiceDispatch> {
        Arc::new(Registrar {
            broker: Arc::clone(self),
        })
    }

    fn record_announcement(&self, id: u32, endpoint: Endpoint) {
        let mut announced = self.announced.lock().unwrap_or_else(PoisonError::into_inner);
        announced.insert(id, endpoint);
        self.announced_cv.notify_all();
    }
}

#[derive(Deserialize)]
struct RegisterParams {
    id: u32,
    network: String,
    address: String,
}

/// Handles the peer's endpoint announcements on the main channel.
struct Registrar {
    broker: Arc<Broker>,
}

impl ServiceDispatch for Registrar {
    fn dispatch(&self, method: &str, params: Value) -> Result<Value, ServiceError> {
        if method != REGISTER_METHOD {
            return Err(ServiceError::new(format!(
                "unknown broker method '{method}'"
            )));
        }
        let params: RegisterParams = serde_json::from_value(params)
            .map_err(|e| ServiceError::new(format!("invalid register parameters: {e}")))?;
        let endpoint = Endpoint::from_tokens(&params.network, &params.address)
            .map_err(|e| ServiceError::new(e.to_string()))?;
        self.broker.record_announcement(params.id, endpoint);
        Ok(Value::Null)
    }
}

/// Guard over a channel served in the background.
///
/// Dropping the guard joins the serving thread, so it blocks until the peer
/// dials in and later tears the channel down. Call [`join`](Self::join) to
/// observe the outcome instead of having failures logged.
pub struct ChannelServer {
    id: u32,
    handle: Option<JoinHandle<Result<(), PluginError>>>,
}

impl ChannelServer {
    /// Returns the channel id this server is bound to.
    #[must_use]
    pub const fn id(&self) -> u32 {
        self.id
    }

    /// Waits for the peer to tear the channel down.
    ///
    /// # Errors
    ///
    /// Propagates the serving side's error; see
    /// [`Broker::accept_and_serve`].
    pub fn join(mut self) -> Result<(), PluginError> {
        self.take_result()
    }

    /// Abandons the guard without waiting. The serving thread keeps
    /// running in the background; use this when the peer was never told
    /// the channel id and so will never dial or tear it down.
    pub fn detach(mut self) {
        drop(self.handle.take());
    }

    fn take_result(&mut self) -> Result<(), PluginError> {
        match self.handle.take() {
            Some(handle) => handle
                .join()
                .unwrap_or_else(|_| Err(PluginError::transport("channel server thread panicked"))),
            None => Ok(()),
        }
    }
}

impl Drop for ChannelServer {
    fn drop(&mut self) {
        if let Err(error) = self.take_result() {
            warn!(target: BROKER_TARGET, id = self.id, %error, "channel server failed");
        }
    }
}
