//! Plugin-side entry point: negotiate, announce, and serve.
//!
//! A plugin binary builds a [`ServeConfig`] mirroring the host's handshake
//! parameters and capability names, then calls [`serve`], which never
//! returns in normal operation. The sequence is the mirror image of the
//! host's [`start`](crate::host::HostConfig::start): check the magic
//! cookie, pick the best protocol version and wire protocol the host's
//! environment variables allow, bind a listener, write the one-line
//! announcement to stdout, and serve connections until the host closes the
//! plugin's stdin.

use std::env;
use std::io::{self, Read, Write};
use std::process;
use std::sync::Arc;
use std::thread;

use tracing::{debug, info, warn};

use crate::broker::{BROKER_SERVICE, Broker};
use crate::error::PluginError;
use crate::handshake::{
    HandshakeConfig, HandshakeLine, PROTOCOL_VERSIONS_ENV, WIRE_PROTOCOLS_ENV, WireProtocol,
    negotiate_version, parse_protocols, parse_versions, select_protocol,
};
use crate::registry::{PluginSet, VersionedPluginSets};
use crate::transport::simple::serve_connection;
use crate::transport::stream::StreamConnection;
use crate::transport::{Router, ServiceDispatch, SocketListener, SocketStream, StatusCell};


/// Tracing target for the serve loop.
const SERVE_TARGET: &str = "tether::serve";

/// How the plugin binds its listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServeTransport {
    /// A unix domain socket in a private temporary directory. The default.
    UnixSocket,
    /// An ephemeral loopback TCP port.
    TcpLoopback,
}

/// Everything a plugin binary needs to serve its capabilities.
pub struct ServeConfig {
    handshake: HandshakeConfig,
    plugins: VersionedPluginSets,
    supported_protocols: Vec<WireProtocol>,
    transport: ServeTransport,
}

impl ServeConfig {
    /// Creates a configuration. By default both wire protocols are
    /// supported (preferring stream) and a unix socket is used.
    #[must_use]
    pub fn new(handshake: HandshakeConfig, plugins: VersionedPluginSets) -> Self {
        Self {
            handshake,
            plugins,
            supported_protocols: vec![WireProtocol::Stream, WireProtocol::Simple],
            transport: ServeTransport::UnixSocket,
        }
    }

    /// Restricts the wire protocols this plugin supports. Order is this
    /// plugin's own preference, used when the host expresses none.
    #[must_use]
    pub fn supported_protocols(mut self, protocols: impl Into<Vec<WireProtocol>>) -> Self {
        self.supported_protocols = protocols.into();
        self
    }

    /// Selects how the listener is bound.
    #[must_use]
    pub const fn transport(mut self, transport: ServeTransport) -> Self {
        self.transport = transport;
        self
    }
}

/// Runs the plugin.
///
/// Exits the process with status 1 (after a human-readable explanation on
/// stderr) when launched without the magic cookie, and with status 0 when
/// the host closes stdin. Does not return otherwise.
///
/// # Errors
///
/// Returns [`PluginError::Configuration`] for an unusable configuration,
/// or [`PluginError::Transport`] when binding, announcing, or accepting
/// fails.
pub fn serve(config: ServeConfig) -> Result<(), PluginError> {
    if !config.handshake.cookie_present() {
        eprintln!(
            "This binary is a plugin, not meant to be executed directly.\n\
             It must be launched by its host application, which sets up the\n\
             environment the plugin expects."
        );
        process::exit(1);
    }
    if config.plugins.is_empty() {
        return Err(PluginError::Configuration {
            message: "no plugin sets registered".to_owned(),
        });
    }
    if config.supported_protocols.is_empty() {
        return Err(PluginError::Configuration {
            message: "no wire protocols supported".to_owned(),
        });
    }

    let own_versions = config.plugins.versions();
    let version = choose_version(
        &own_versions,
        env::var(PROTOCOL_VERSIONS_ENV).ok().as_deref(),
    );
    let protocol = choose_protocol(
        &config.supported_protocols,
        env::var(WIRE_PROTOCOLS_ENV).ok().as_deref(),
    );
    // A plugin set exists for every advertised version.
    let plugins = config
        .plugins
        .get(version)
        .ok_or_else(|| PluginError::Configuration {
            message: format!("no plugin set for version {version}"),
        })?;

    // The temporary directory must outlive the listener bound inside it.
    let _socket_dir;
    let (listener, endpoint) = match config.transport {
        ServeTransport::UnixSocket => {
            let dir = tempfile::tempdir().map_err(|e| {
                PluginError::transport_io("failed to create socket directory", e)
            })?;
            let bound = SocketListener::bind_unix(dir.path().join("plugin.sock"))?;
            _socket_dir = dir;
            bound
        }
        ServeTransport::TcpLoopback => SocketListener::bind_loopback()?,
    };

    let line = HandshakeLine {
        core_version: config.handshake.core_protocol_version(),
        app_version: version,
        endpoint,
        protocol: protocol.token().to_owned(),
        server_cert: None,
    };
    announce(&line)?;
    info!(
        target: SERVE_TARGET,
        version,
        protocol = %protocol,
        endpoint = %line.endpoint,
        "plugin serving"
    );

    spawn_stdin_watch();

    loop {
        let stream = listener.accept()?;
        match protocol {
            WireProtocol::Simple => {
                let router = connection_router(plugins, &Broker::for_simple(None, StatusCell::new()));
                thread::spawn(move || {
                    serve_connection(stream, router.as_ref());
                    debug!(target: SERVE_TARGET, "simple connection closed");
                });
            }
            WireProtocol::Stream => {
                serve_stream_connection(plugins, stream)?;
            }
        }
    }
}

/// Wires one stream connection: the router must be fully populated, with a
/// broker wrapping this very connection, before the first frame is read.
fn serve_stream_connection(plugins: &PluginSet, stream: SocketStream) -> Result<(), PluginError> {
    let router = Arc::new(Router::new());
    let (conn, reader) =
        StreamConnection::establish_paused(
            stream,
            Arc::clone(&router) as Arc<dyn ServiceDispatch>,
            StatusCell::new(),
        )?;
    let broker = Broker::for_stream(conn);
    populate_router(&router, plugins, &broker);
    reader.start();
    Ok(())
}

fn connection_router(plugins: &PluginSet, broker: &Arc<Broker>) -> Arc<Router> {
    let router = Arc::new(Router::new());
    populate_router(&router, plugins, broker);
    router
}

fn populate_router(router: &Router, plugins: &PluginSet, broker: &Arc<Broker>) {
    router.register(BROKER_SERVICE, broker.registrar());
    for (name, capability) in plugins.iter() {
        router.register(name, capability.server(broker));
    }
}

/// Writes the handshake line to stdout. Nothing else may be written there;
/// diagnostics belong on stderr.
fn announce(line: &HandshakeLine) -> Result<(), PluginError> {
    let mut stdout = io::stdout().lock();
    writeln!(stdout, "{}", line.to_line())
        .and_then(|()| stdout.flush())
        .map_err(|e| PluginError::transport_io("failed to write handshake line", e))
}

/// Exits the process when the host closes our stdin, so an orphaned plugin
/// never outlives a host that died without shutting it down.
fn spawn_stdin_watch() {
    thread::spawn(|| {
        let mut stdin = io::stdin().lock();
        let mut buf = [0_u8; 256];
        loop {
            match stdin.read(&mut buf) {
                Ok(0) => break,
                Ok(_) => {}
                Err(error) => {
                    warn!(target: SERVE_TARGET, %error, "failed to read stdin");
                    break;
                }
            }
        }
        info!(target: SERVE_TARGET, "host went away; exiting");
        process::exit(0);
    });
}

/// Picks the application protocol version to advertise. When the host
/// declares nothing, or declares only versions this plugin lacks, the
/// plugin advertises its own best version and lets the host's validation
/// name both sides in its error.
fn choose_version(own: &[u32], host_env: Option<&str>) -> u32 {
    let best = own.iter().copied().max().unwrap_or(0);
    let host = host_env.map(parse_versions).unwrap_or_default();
    if host.is_empty() {
        return best;
    }
    negotiate_version(&host, own).unwrap_or(best)
}

/// Picks the wire protocol to advertise, honouring the host's priority
/// order; falls back to this plugin's own first preference when the host
/// declares nothing acceptable.
fn choose_protocol(own: &[WireProtocol], host_env: Option<&str>) -> WireProtocol {
    let fallback = own[0];
    let host = host_env.map(parse_protocols).unwrap_or_default();
    if host.is_empty() {
        return fallback;
    }
    select_protocol(&host, own).unwrap_or(fallback)
}
