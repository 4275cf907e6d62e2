//! Unit tests for endpoints, routing, and the client handle.

use std::sync::Arc;
use std::time::Duration;

use rstest::rstest;
use serde_json::{Value, json};

use super::*;

#[rstest]
#[case::tcp("tcp", "127.0.0.1:5000")]
#[case::unix("unix", "/tmp/plugin.sock")]
fn endpoint_tokens_round_trip(#[case] network: &str, #[case] address: &str) {
    let endpoint = Endpoint::from_tokens(network, address).expect("parse endpoint");
    assert_eq!(endpoint.network_token(), network);
    assert_eq!(endpoint.address_token(), address);
}

#[rstest]
fn unknown_network_type_is_malformed() {
    let err = Endpoint::from_tokens("pipe", "whatever").expect_err("should fail");
    assert!(matches!(err, PluginError::MalformedHandshake { .. }));
    assert!(err.to_string().contains("pipe"));
}

struct UpperService;

impl ServiceDispatch for UpperService {
    fn dispatch(&self, method: &str, params: Value) -> Result<Value, ServiceError> {
        match method {
            "upper" => {
                let text = params.as_str().ok_or_else(|| ServiceError::new("not a string"))?;
                Ok(json!(text.to_uppercase()))
            }
            other => Err(ServiceError::new(format!("unknown method '{other}'"))),
        }
    }
}

#[rstest]
fn unix_endpoint_serves_a_round_trip() {
    let dir = tempfile::tempdir().expect("tempdir");
    let (listener, endpoint) =
        SocketListener::bind_unix(dir.path().join("plugin.sock")).expect("bind");
    assert_eq!(endpoint.network_token(), "unix");

    let server = std::thread::spawn(move || {
        let stream = listener.accept().expect("accept");
        simple::serve_connection(stream, &UpperService);
    });

    let client = simple::SimpleClient::connect(&endpoint, StatusCell::new()).expect("connect");
    let result = client.invoke("upper", json!("hi"), None).expect("call");
    assert_eq!(result, json!("HI"));
    client.close();
    server.join().expect("server thread");
}

#[rstest]
fn router_splits_service_and_method() {
    let router = Router::new();
    router.register("text", Arc::new(UpperService));

    let result = router.dispatch("text.upper", json!("hi")).expect("dispatch");
    assert_eq!(result, json!("HI"));
}

#[rstest]
fn router_rejects_unknown_service() {
    let router = Router::new();
    let err = router
        .dispatch("missing.method", Value::Null)
        .expect_err("should fail");
    assert!(err.message().contains("unknown service 'missing'"));
}

#[rstest]
fn router_rejects_unqualified_method() {
    let router = Router::new();
    let err = router.dispatch("bare", Value::Null).expect_err("should fail");
    assert!(err.message().contains("bare"));
}

struct RecordingInvoker {
    last_method: Mutex<Option<String>>,
}

impl Invoker for RecordingInvoker {
    fn invoke(
        &self,
        method: &str,
        _params: Value,
        _deadline: Option<Duration>,
    ) -> Result<Value, PluginError> {
        let mut last = self
            .last_method
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        *last = Some(method.to_owned());
        Ok(json!("ok"))
    }

    fn close(&self) {}
}

#[rstest]
fn scoped_client_prefixes_the_plugin_name() {
    let recorder = Arc::new(RecordingInvoker {
        last_method: Mutex::new(None),
    });
    let client = RpcClient::new(Arc::clone(&recorder) as Arc<dyn Invoker>);

    client
        .scoped("kv")
        .invoke("get", Value::Null, None)
        .expect("invoke");
    let last = recorder
        .last_method
        .lock()
        .unwrap_or_else(std::sync::PoisonError::into_inner)
        .clone();
    assert_eq!(last.as_deref(), Some("kv.get"));
}

#[rstest]
fn unscoped_client_passes_methods_through() {
    let recorder = Arc::new(RecordingInvoker {
        last_method: Mutex::new(None),
    });
    let client = RpcClient::new(Arc::clone(&recorder) as Arc<dyn Invoker>);

    client
        .invoke("_broker.register", Value::Null, None)
        .expect("invoke");
    let last = recorder
        .last_method
        .lock()
        .unwrap_or_else(std::sync::PoisonError::into_inner)
        .clone();
    assert_eq!(last.as_deref(), Some("_broker.register"));
}

#[rstest]
fn status_cell_records_only_the_first_status() {
    let cell = StatusCell::new();
    assert_eq!(cell.get(), None);
    cell.record(1);
    cell.record(2);
    assert_eq!(cell.get(), Some(1));
    assert!(matches!(
        cell.crash_error(),
        PluginError::PluginCrashed { status: Some(1) }
    ));
}

#[rstest]
fn service_error_message_is_verbatim() {
    let err = ServiceError::from("key 'a' not found");
    assert_eq!(err.to_string(), "key 'a' not found");
}
