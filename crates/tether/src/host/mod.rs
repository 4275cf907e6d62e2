//! Host-side session supervision.
//!
//! [`HostConfig`] describes how to launch one plugin binary; its
//! [`start`](HostConfig::start) spawns the subprocess with the magic cookie
//! and negotiation variables in its environment, reads the handshake line
//! from the child's stdout, validates it, dials the announced endpoint, and
//! hands back a [`PluginSession`]. The session owns the child for its whole
//! life: a monitor thread reaps the process and records its exit status so
//! failures surface as [`PluginError::PluginCrashed`] naming it, and
//! dropping the session never leaks the subprocess.

use std::any::Any;
use std::fmt;
use std::io::{BufRead, BufReader, Read};
use std::path::PathBuf;
use std::process::{Child, ChildStdin, Command, Stdio};
use std::sync::mpsc;
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

use nix::sys::signal::{Signal, kill};
use nix::unistd::Pid;
use tracing::{debug, warn};

use crate::broker::Broker;
use crate::error::PluginError;
use crate::handshake::{
    HandshakeConfig, HandshakeLine, PROTOCOL_VERSIONS_ENV, WIRE_PROTOCOLS_ENV, WireProtocol,
    join_protocols, join_versions,
};
use crate::registry::VersionedPluginSets;
use crate::transport::simple::SimpleClient;
use crate::transport::stream::{StreamChannel, StreamConnection};
use crate::transport::{Router, RpcClient, StatusCell, connect};

#[cfg(test)]
mod tests;

/// Tracing target for session supervision.
const HOST_TARGET: &str = "tether::host";

/// Default wait for the handshake line.
const DEFAULT_STARTUP_TIMEOUT: Duration = Duration::from_secs(15);

/// Default wait for the child to exit at each shutdown stage.
const DEFAULT_SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Interval at which the monitor thread and shutdown polling check the
/// child.
const REAP_POLL: Duration = Duration::from_millis(100);

/// How long an already-observed stdout EOF waits for the exit status
/// before reporting the crash without one.
const CRASH_STATUS_WAIT: Duration = Duration::from_secs(2);

/// Where a session is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// The subprocess has not been spawned yet.
    NotStarted,
    /// The subprocess is being spawned.
    Starting,
    /// Waiting for, or validating, the handshake line.
    Handshaking,
    /// The session is connected and usable.
    Running,
    /// The session was shut down deliberately.
    Stopped,
    /// The subprocess exited without being asked to.
    Crashed,
}

/// Everything needed to launch and talk to one plugin binary.
pub struct HostConfig {
    handshake: HandshakeConfig,
    command: PathBuf,
    args: Vec<String>,
    envs: Vec<(String, String)>,
    plugins: VersionedPluginSets,
    allowed_protocols: Vec<WireProtocol>,
    startup_timeout: Duration,
    shutdown_grace: Duration,
}

impl HostConfig {
    /// Creates a configuration for one plugin binary.
    ///
    /// By default both wire protocols are acceptable, with the stream
    /// protocol preferred.
    #[must_use]
    pub fn new(
        handshake: HandshakeConfig,
        command: impl Into<PathBuf>,
        plugins: VersionedPluginSets,
    ) -> Self {
        Self {
            handshake,
            command: command.into(),
            args: Vec::new(),
            envs: Vec::new(),
            plugins,
            allowed_protocols: vec![WireProtocol::Stream, WireProtocol::Simple],
            startup_timeout: DEFAULT_STARTUP_TIMEOUT,
            shutdown_grace: DEFAULT_SHUTDOWN_GRACE,
        }
    }

    /// Appends arguments to the plugin command line.
    #[must_use]
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Adds an environment variable for the subprocess.
    #[must_use]
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.envs.push((key.into(), value.into()));
        self
    }

    /// Restricts the acceptable wire protocols. Order is priority order:
    /// when the plugin supports several, the first one listed here wins.
    #[must_use]
    pub fn allowed_protocols(mut self, protocols: impl Into<Vec<WireProtocol>>) -> Self {
        self.allowed_protocols = protocols.into();
        self
    }

    /// Sets how long to wait for the handshake line.
    #[must_use]
    pub const fn startup_timeout(mut self, timeout: Duration) -> Self {
        self.startup_timeout = timeout;
        self
    }

    /// Sets how long each shutdown stage waits before escalating.
    #[must_use]
    pub const fn shutdown_grace(mut self, grace: Duration) -> Self {
        self.shutdown_grace = grace;
        self
    }

    /// Launches the plugin and performs the handshake.
    ///
    /// # Errors
    ///
    /// Returns [`PluginError::Configuration`] when no plugin set is
    /// registered or no protocol is allowed, [`PluginError::LaunchFailed`]
    /// when the binary cannot be spawned, [`PluginError::HandshakeTimeout`]
    /// or [`PluginError::PluginCrashed`] when no handshake line arrives,
    /// one of the negotiation errors when the line is unacceptable, or
    /// [`PluginError::Transport`] when dialing the announced endpoint
    /// fails. On every post-spawn failure the subprocess is terminated
    /// before the error is returned.
    pub fn start(self) -> Result<PluginSession, PluginError> {
        if self.plugins.is_empty() {
            return Err(PluginError::Configuration {
                message: "no plugin sets registered".to_owned(),
            });
        }
        if self.allowed_protocols.is_empty() {
            return Err(PluginError::Configuration {
                message: "no wire protocols allowed".to_owned(),
            });
        }

        let state = Arc::new(Mutex::new(SessionState::Starting));
        let status = StatusCell::new();
        let host_versions = self.plugins.versions();

        let mut command = Command::new(&self.command);
        command
            .args(&self.args)
            .env(
                self.handshake.magic_cookie_key(),
                self.handshake.magic_cookie_value(),
            )
            .env(PROTOCOL_VERSIONS_ENV, join_versions(&host_versions))
            .env(WIRE_PROTOCOLS_ENV, join_protocols(&self.allowed_protocols))
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        for (key, value) in &self.envs {
            command.env(key, value);
        }

        debug!(
            target: HOST_TARGET,
            command = %self.command.display(),
            versions = %join_versions(&host_versions),
            "launching plugin"
        );

        let mut child = command.spawn().map_err(|e| PluginError::LaunchFailed {
            command: self.command.display().to_string(),
            source: Arc::new(e),
        })?;
        let pid = child.id();

        // The write half of stdin is held open for the plugin's lifetime;
        // closing it is the first, gentlest shutdown signal.
        let stdin = child.stdin.take();
        let stdout = child.stdout.take().ok_or_else(|| PluginError::LaunchFailed {
            command: self.command.display().to_string(),
            source: Arc::new(std::io::Error::other("failed to capture stdout")),
        })?;
        let stderr = child.stderr.take();

        let child = Arc::new(Mutex::new(child));
        spawn_stderr_drain(pid, stderr);
        spawn_monitor(pid, Arc::clone(&child), Arc::clone(&state), status.clone());

        set_state(&state, SessionState::Handshaking);
        let line = match self.read_handshake(pid, stdout, &child, &status) {
            Ok(line) => line,
            Err(error) => {
                terminate(&child);
                return Err(error);
            }
        };

        let (protocol_version, wire_protocol) =
            match line.validate(&self.handshake, &host_versions, &self.allowed_protocols) {
                Ok(negotiated) => negotiated,
                Err(error) => {
                    terminate(&child);
                    return Err(error);
                }
            };

        debug!(
            target: HOST_TARGET,
            pid,
            protocol_version,
            wire_protocol = %wire_protocol,
            endpoint = %line.endpoint,
            "handshake accepted"
        );

        let (client, broker) = match Self::open_connection(&line, wire_protocol, &status) {
            Ok(opened) => opened,
            Err(error) => {
                terminate(&child);
                return Err(error);
            }
        };

        set_state(&state, SessionState::Running);
        Ok(PluginSession {
            child,
            stdin: Mutex::new(stdin),
            pid,
            state,
            status,
            plugins: self.plugins,
            protocol_version,
            wire_protocol,
            client,
            broker,
            shutdown_grace: self.shutdown_grace,
        })
    }

    fn read_handshake(
        &self,
        pid: u32,
        stdout: impl Read + Send + 'static,
        child: &Arc<Mutex<Child>>,
        status: &StatusCell,
    ) -> Result<HandshakeLine, PluginError> {
        let (tx, rx) = mpsc::channel();
        thread::spawn(move || {
            let mut reader = BufReader::new(stdout);
            let mut line = String::new();
            let first = reader
                .read_line(&mut line)
                .map(|n| if n == 0 { None } else { Some(line.clone()) });
            drop(tx.send(first));
            // Keep draining so a chatty plugin cannot fill the pipe.
            for extra in reader.lines() {
                match extra {
                    Ok(extra) => debug!(target: HOST_TARGET, pid, line = %extra, "plugin stdout"),
                    Err(_) => break,
                }
            }
        });

        match rx.recv_timeout(self.startup_timeout) {
            Ok(Ok(Some(line))) => HandshakeLine::parse(&line),
            Ok(Ok(None)) => {
                // Stdout closed before any line: the plugin is gone (or
                // refused the cookie). Give the reaper a moment so the
                // error can name the exit status.
                wait_for_status(child, status, CRASH_STATUS_WAIT);
                Err(status.crash_error())
            }
            Ok(Err(e)) => Err(PluginError::transport_io("failed to read handshake line", e)),
            Err(_) => Err(PluginError::HandshakeTimeout {
                timeout_secs: self.startup_timeout.as_secs(),
            }),
        }
    }

    fn open_connection(
        line: &HandshakeLine,
        wire_protocol: WireProtocol,
        status: &StatusCell,
    ) -> Result<(RpcClient, Arc<Broker>), PluginError> {
        let stream = connect(&line.endpoint)?;
        match wire_protocol {
            WireProtocol::Stream => {
                let conn =
                    StreamConnection::establish(stream, Arc::new(Router::new()), status.clone())?;
                let client = RpcClient::new(Arc::new(StreamChannel::new(Arc::clone(&conn), 0)));
                Ok((client, Broker::for_stream(conn)))
            }
            WireProtocol::Simple => {
                let client =
                    RpcClient::new(Arc::new(SimpleClient::from_stream(stream, status.clone())?));
                let broker = Broker::for_simple(Some(client.clone()), status.clone());
                Ok((client, broker))
            }
        }
    }
}

/// A live connection to one supervised plugin subprocess.
pub struct PluginSession {
    child: Arc<Mutex<Child>>,
    stdin: Mutex<Option<ChildStdin>>,
    pid: u32,
    state: Arc<Mutex<SessionState>>,
    status: StatusCell,
    plugins: VersionedPluginSets,
    protocol_version: u32,
    wire_protocol: WireProtocol,
    client: RpcClient,
    broker: Arc<Broker>,
    shutdown_grace: Duration,
}

impl fmt::Debug for PluginSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PluginSession")
            .field("pid", &self.pid)
            .field("state", &self.state())
            .field("protocol_version", &self.protocol_version)
            .field("wire_protocol", &self.wire_protocol)
            .finish_non_exhaustive()
    }
}

impl PluginSession {
    /// Returns the subprocess id.
    #[must_use]
    pub const fn pid(&self) -> u32 {
        self.pid
    }

    /// Returns where the session is in its lifecycle.
    #[must_use]
    pub fn state(&self) -> SessionState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Returns the negotiated application protocol version.
    #[must_use]
    pub const fn protocol_version(&self) -> u32 {
        self.protocol_version
    }

    /// Returns the negotiated wire protocol.
    #[must_use]
    pub const fn wire_protocol(&self) -> WireProtocol {
        self.wire_protocol
    }

    /// Returns the subprocess exit status, once it has exited. Signal
    /// deaths use the shell convention (128 + signal number).
    #[must_use]
    pub fn exit_status(&self) -> Option<i32> {
        self.status.get()
    }

    /// Returns this end's connection broker, for serving callback channels
    /// outside a capability proxy.
    #[must_use]
    pub fn broker(&self) -> &Arc<Broker> {
        &self.broker
    }

    /// Builds the typed proxy for a named plugin.
    ///
    /// `T` must be the concrete proxy type the capability's `client`
    /// produces.
    ///
    /// # Errors
    ///
    /// Returns [`PluginError::UnknownPlugin`] when the negotiated set has
    /// no such name, or [`PluginError::Configuration`] when `T` is not the
    /// capability's proxy type.
    pub fn dispense<T: Any>(&self, name: &str) -> Result<Box<T>, PluginError> {
        let set = self
            .plugins
            .get(self.protocol_version)
            .ok_or_else(|| PluginError::Configuration {
                message: format!(
                    "no plugin set for negotiated version {}",
                    self.protocol_version
                ),
            })?;
        let capability = set.get(name).ok_or_else(|| PluginError::UnknownPlugin {
            name: name.to_owned(),
            version: self.protocol_version,
        })?;
        let proxy = capability.client(self.client.scoped(name), Arc::clone(&self.broker));
        proxy
            .downcast::<T>()
            .map_err(|_| PluginError::Configuration {
                message: format!("plugin '{name}' does not dispense the requested type"),
            })
    }

    /// Shuts the session down, escalating as needed: close stdin and the
    /// connection, wait, SIGTERM, wait, SIGKILL. Idempotent.
    ///
    /// # Errors
    ///
    /// Returns [`PluginError::Transport`] when the subprocess cannot be
    /// reaped at all.
    pub fn shutdown(&self) -> Result<(), PluginError> {
        {
            let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
            if *state == SessionState::Stopped {
                return Ok(());
            }
            *state = SessionState::Stopped;
        }

        debug!(target: HOST_TARGET, pid = self.pid, "shutting plugin down");
        {
            let mut stdin = self.stdin.lock().unwrap_or_else(PoisonError::into_inner);
            drop(stdin.take());
        }
        self.client.close();
        if wait_for_exit(&self.child, self.shutdown_grace) {
            return Ok(());
        }

        let pid = Pid::from_raw(self.pid as i32);
        if let Err(errno) = kill(pid, Signal::SIGTERM) {
            warn!(target: HOST_TARGET, pid = self.pid, %errno, "failed to send SIGTERM");
        }
        if wait_for_exit(&self.child, self.shutdown_grace) {
            return Ok(());
        }

        warn!(target: HOST_TARGET, pid = self.pid, "escalating to SIGKILL");
        let mut child = self.child.lock().unwrap_or_else(PoisonError::into_inner);
        drop(child.kill());
        child
            .wait()
            .map(|_| ())
            .map_err(|e| PluginError::transport_io("failed to reap plugin process", e))
    }
}

impl Drop for PluginSession {
    fn drop(&mut self) {
        if self.state() != SessionState::Stopped {
            let mut child = self.child.lock().unwrap_or_else(PoisonError::into_inner);
            drop(child.kill());
            drop(child.wait());
        }
    }
}

/// Kills and reaps a child that never became a session.
fn terminate(child: &Arc<Mutex<Child>>) {
    let mut child = child.lock().unwrap_or_else(PoisonError::into_inner);
    drop(child.kill());
    drop(child.wait());
}

fn set_state(state: &Arc<Mutex<SessionState>>, next: SessionState) {
    *state.lock().unwrap_or_else(PoisonError::into_inner) = next;
}

fn spawn_stderr_drain(pid: u32, stderr: Option<impl Read + Send + 'static>) {
    let Some(stderr) = stderr else { return };
    thread::spawn(move || {
        for line in BufReader::new(stderr).lines() {
            match line {
                Ok(line) => debug!(target: HOST_TARGET, pid, line = %line, "plugin stderr"),
                Err(_) => break,
            }
        }
    });
}

/// Reaps the subprocess and records its exit in the shared state: the
/// status cell always, and a `Crashed` state unless the session was shut
/// down deliberately.
fn spawn_monitor(
    pid: u32,
    child: Arc<Mutex<Child>>,
    state: Arc<Mutex<SessionState>>,
    status: StatusCell,
) {
    thread::spawn(move || {
        loop {
            let waited = {
                let mut child = child.lock().unwrap_or_else(PoisonError::into_inner);
                child.try_wait()
            };
            match waited {
                Ok(Some(exit)) => {
                    let code = exit_code(&exit);
                    if let Some(code) = code {
                        status.record(code);
                    }
                    let mut state = state.lock().unwrap_or_else(PoisonError::into_inner);
                    if *state == SessionState::Stopped {
                        debug!(target: HOST_TARGET, pid, ?code, "plugin exited after shutdown");
                    } else {
                        warn!(target: HOST_TARGET, pid, ?code, "plugin exited unexpectedly");
                        *state = SessionState::Crashed;
                    }
                    return;
                }
                Ok(None) => thread::sleep(REAP_POLL),
                Err(error) => {
                    warn!(target: HOST_TARGET, pid, %error, "failed to poll plugin process");
                    return;
                }
            }
        }
    });
}

fn exit_code(exit: &std::process::ExitStatus) -> Option<i32> {
    use std::os::unix::process::ExitStatusExt;
    exit.code().or_else(|| exit.signal().map(|sig| 128 + sig))
}

/// Polls until the child exits or the deadline passes; returns whether it
/// exited.
fn wait_for_exit(child: &Arc<Mutex<Child>>, grace: Duration) -> bool {
    let deadline = Instant::now() + grace;
    loop {
        let waited = {
            let mut child = child.lock().unwrap_or_else(PoisonError::into_inner);
            child.try_wait()
        };
        match waited {
            Ok(Some(_)) => return true,
            Ok(None) => {
                if Instant::now() >= deadline {
                    return false;
                }
                thread::sleep(REAP_POLL);
            }
            Err(_) => return false,
        }
    }
}

/// Waits briefly for the monitor (or a direct poll) to record the exit
/// status of a child whose stdout already closed.
fn wait_for_status(child: &Arc<Mutex<Child>>, status: &StatusCell, grace: Duration) {
    if wait_for_exit(child, grace) {
        // The monitor may not have polled yet; record directly.
        let mut child = child.lock().unwrap_or_else(PoisonError::into_inner);
        if let Ok(Some(exit)) = child.try_wait() {
            if let Some(code) = exit_code(&exit) {
                status.record(code);
            }
        }
    }
}
