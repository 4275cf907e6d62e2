//! Unit tests for launch, handshake supervision, and shutdown.
//!
//! These use `/bin/sh` stand-ins for plugin binaries; full sessions against
//! real plugins live in the end-to-end crate.

use std::net::TcpListener;
use std::sync::Arc;

use rstest::rstest;
use serde_json::Value;

use super::*;
use crate::registry::{PluginCapability, PluginSet};
use crate::transport::simple::serve_connection;
use crate::transport::{ServiceDispatch, ServiceError, SocketStream};

#[derive(Debug)]
struct NoopProxy;

struct NoopService;

impl ServiceDispatch for NoopService {
    fn dispatch(&self, _method: &str, _params: Value) -> Result<Value, ServiceError> {
        Ok(Value::Null)
    }
}

struct NoopCapability;

impl PluginCapability for NoopCapability {
    fn server(&self, _broker: &Arc<Broker>) -> Arc<dyn ServiceDispatch> {
        Arc::new(NoopService)
    }

    fn client(&self, _client: RpcClient, _broker: Arc<Broker>) -> Box<dyn std::any::Any + Send> {
        Box::new(NoopProxy)
    }
}

fn plugin_sets() -> VersionedPluginSets {
    let mut set = PluginSet::new();
    set.insert("noop", Arc::new(NoopCapability)).expect("insert");
    VersionedPluginSets::single(1, set)
}

fn shell_config(script: &str) -> HostConfig {
    HostConfig::new(
        HandshakeConfig::new(1, "TEST_COOKIE", "tether-test"),
        "/bin/sh",
        plugin_sets(),
    )
    .args(["-c", script])
    .startup_timeout(Duration::from_millis(500))
    .shutdown_grace(Duration::from_millis(500))
}

/// Accepts simple-protocol connections for the session under test, so a
/// shell stand-in only has to print a handshake line pointing here.
fn accepting_endpoint() -> String {
    let listener = TcpListener::bind(("127.0.0.1", 0)).expect("bind");
    let addr = listener.local_addr().expect("local addr");
    thread::spawn(move || {
        for stream in listener.incoming() {
            let Ok(stream) = stream else { return };
            thread::spawn(move || {
                serve_connection(SocketStream::Tcp(stream), &NoopService);
            });
        }
    });
    addr.to_string()
}

#[rstest]
fn missing_binary_fails_to_launch() {
    let config = HostConfig::new(
        HandshakeConfig::new(1, "TEST_COOKIE", "tether-test"),
        "/nonexistent/tether-plugin",
        plugin_sets(),
    );
    let err = config.start().expect_err("should fail");
    let PluginError::LaunchFailed { command, .. } = &err else {
        panic!("expected launch failure, got {err:?}");
    };
    assert!(command.contains("tether-plugin"));
}

#[rstest]
fn empty_plugin_sets_are_a_configuration_error() {
    let config = HostConfig::new(
        HandshakeConfig::new(1, "TEST_COOKIE", "tether-test"),
        "/bin/sh",
        VersionedPluginSets::new(),
    );
    let err = config.start().expect_err("should fail");
    assert!(matches!(err, PluginError::Configuration { .. }));
}

#[rstest]
fn immediate_exit_is_a_crash_with_status() {
    let err = shell_config("exit 3").start().expect_err("should fail");
    assert!(matches!(
        err,
        PluginError::PluginCrashed { status: Some(3) }
    ));
}

#[rstest]
fn silence_is_a_handshake_timeout() {
    let err = shell_config("sleep 5").start().expect_err("should fail");
    assert!(matches!(err, PluginError::HandshakeTimeout { .. }));
}

#[rstest]
fn garbage_output_is_a_malformed_handshake() {
    let err = shell_config("echo 'not a handshake'; sleep 5")
        .start()
        .expect_err("should fail");
    assert!(matches!(err, PluginError::MalformedHandshake { .. }));
}

#[rstest]
fn core_version_mismatch_is_fatal() {
    let err = shell_config("echo '9|1|tcp|127.0.0.1:1|simple'; sleep 5")
        .start()
        .expect_err("should fail");
    assert!(matches!(
        err,
        PluginError::CoreVersionMismatch {
            expected: 1,
            actual: 9
        }
    ));
}

#[rstest]
fn unknown_app_version_fails_without_dialing() {
    // Port 1 would refuse the connection; a version error proves
    // validation rejected the line before any dial was attempted.
    let err = shell_config("echo '1|9|tcp|127.0.0.1:1|simple'; sleep 5")
        .start()
        .expect_err("should fail");
    assert!(matches!(err, PluginError::NoCompatibleVersion { .. }));
}

#[rstest]
fn disallowed_protocol_is_rejected() {
    let err = shell_config("echo '1|1|tcp|127.0.0.1:1|carrier-pigeon'; sleep 5")
        .start()
        .expect_err("should fail");
    assert!(matches!(err, PluginError::NoCompatibleProtocol { .. }));
}

#[rstest]
fn negotiation_environment_reaches_the_subprocess() {
    // The stand-in exits 7 unless the cookie and negotiation variables
    // are present; a timeout (not a crash) proves they were.
    let script = "\
        [ \"$TEST_COOKIE\" = 'tether-test' ] || exit 7; \
        [ \"$TETHER_PROTOCOL_VERSIONS\" = '1' ] || exit 7; \
        [ \"$TETHER_WIRE_PROTOCOLS\" = 'stream,simple' ] || exit 7; \
        sleep 5";
    let err = shell_config(script).start().expect_err("should time out");
    assert!(matches!(err, PluginError::HandshakeTimeout { .. }));
}

#[rstest]
fn running_session_reports_negotiated_values() {
    let addr = accepting_endpoint();
    let session = shell_config(&format!("echo '1|1|tcp|{addr}|simple'; sleep 5"))
        .start()
        .expect("session starts");

    assert_eq!(session.state(), SessionState::Running);
    assert!(session.pid() > 0);
    assert_eq!(session.protocol_version(), 1);
    assert_eq!(session.wire_protocol(), WireProtocol::Simple);

    session.shutdown().expect("shutdown");
    assert_eq!(session.state(), SessionState::Stopped);
}

#[rstest]
fn dispense_rejects_unknown_names_and_wrong_types() {
    let addr = accepting_endpoint();
    let session = shell_config(&format!("echo '1|1|tcp|{addr}|simple'; sleep 5"))
        .start()
        .expect("session starts");

    let _proxy: Box<NoopProxy> = session.dispense("noop").expect("dispense");

    let err = session
        .dispense::<NoopProxy>("missing")
        .expect_err("unknown name must fail");
    let PluginError::UnknownPlugin { name, version } = &err else {
        panic!("expected unknown plugin, got {err:?}");
    };
    assert_eq!(name, "missing");
    assert_eq!(*version, 1);

    let err = session
        .dispense::<String>("noop")
        .expect_err("wrong proxy type must fail");
    assert!(matches!(err, PluginError::Configuration { .. }));

    session.shutdown().expect("shutdown");
}

#[rstest]
fn shutdown_is_idempotent() {
    let addr = accepting_endpoint();
    let session = shell_config(&format!("echo '1|1|tcp|{addr}|simple'; sleep 5"))
        .start()
        .expect("session starts");

    session.shutdown().expect("first shutdown");
    session.shutdown().expect("second shutdown");
    assert_eq!(session.state(), SessionState::Stopped);
}

#[rstest]
fn external_kill_is_observed_as_a_crash() {
    let addr = accepting_endpoint();
    let session = shell_config(&format!("echo '1|1|tcp|{addr}|simple'; sleep 5"))
        .start()
        .expect("session starts");

    kill(Pid::from_raw(session.pid() as i32), Signal::SIGKILL).expect("kill");
    let deadline = Instant::now() + Duration::from_secs(2);
    while session.state() != SessionState::Crashed && Instant::now() < deadline {
        thread::sleep(Duration::from_millis(20));
    }

    assert_eq!(session.state(), SessionState::Crashed);
    assert_eq!(session.exit_status(), Some(128 + 9));
}
