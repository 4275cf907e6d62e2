//! Out-of-process plugin framework with versioned handshakes.
//!
//! `tether` lets an application load functionality from separate binaries
//! it supervises as subprocesses, so a misbehaving plugin can crash, leak,
//! or be written against an older protocol version without taking the host
//! down with it. Host and plugin speak RPC over a local socket; which
//! socket, which application protocol version, and which wire protocol are
//! all settled by a one-line handshake the plugin prints to stdout when it
//! starts.
//!
//! # Architecture
//!
//! The host side revolves around [`HostConfig`]: it spawns the plugin
//! binary with a magic cookie and the host's negotiation parameters in the
//! environment, validates the handshake line, dials the announced endpoint,
//! and returns a [`PluginSession`] whose `dispense` hands out typed
//! proxies. The plugin side mirrors it with [`ServeConfig`] and [`serve`].
//! Both sides register [`PluginCapability`] implementations under shared
//! names, grouped per protocol version in [`VersionedPluginSets`].
//!
//! Two wire protocols are built in: a strict call/response exchange
//! (`simple`) and a multiplexed streaming protocol (`stream`) that also
//! carries [`Broker`] callback sub-channels, through which the callee can
//! call its caller back.
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use tether::{HandshakeConfig, HostConfig, VersionedPluginSets, PluginSet};
//! # use tether::{Broker, PluginCapability, RpcClient, ServiceDispatch};
//! # struct KvCapability;
//! # struct KvProxy;
//! # impl PluginCapability for KvCapability {
//! #     fn server(&self, _: &Arc<Broker>) -> Arc<dyn ServiceDispatch> { unimplemented!() }
//! #     fn client(&self, _: RpcClient, _: Arc<Broker>) -> Box<dyn std::any::Any + Send> {
//! #         Box::new(KvProxy)
//! #     }
//! # }
//!
//! # fn main() -> Result<(), tether::PluginError> {
//! let handshake = HandshakeConfig::new(1, "KV_PLUGIN_COOKIE", "d1c2f3");
//! let mut set = PluginSet::new();
//! set.insert("kv", Arc::new(KvCapability))?;
//!
//! let session = HostConfig::new(handshake, "./kv-plugin", VersionedPluginSets::single(1, set))
//!     .start()?;
//! let kv: Box<KvProxy> = session.dispense("kv")?;
//! // ... use the proxy, then:
//! session.shutdown()?;
//! # Ok(())
//! # }
//! ```

pub mod broker;
pub mod error;
pub mod handshake;
pub mod host;
pub mod registry;
pub mod serve;
pub mod transport;

pub use self::broker::{Broker, ChannelServer};
pub use self::error::PluginError;
pub use self::handshake::{HandshakeConfig, WireProtocol};
pub use self::host::{HostConfig, PluginSession, SessionState};
pub use self::registry::{PluginCapability, PluginSet, VersionedPluginSets};
pub use self::serve::{ServeConfig, ServeTransport, serve};
pub use self::transport::{Invoker, Router, RpcClient, ServiceDispatch, ServiceError};
