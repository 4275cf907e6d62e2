//! The counter plugin type: a bidirectional flow through the broker.
//!
//! `put` deliberately makes the plugin do its arithmetic through an adder
//! served by the caller: the consuming side opens a callback channel for
//! its [`AddHelper`], passes the channel id inside the `put` call, and the
//! plugin dials back through its broker to compute the new value.

use std::any::Any;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tether::{
    Broker, PluginCapability, PluginError, RpcClient, ServiceDispatch, ServiceError,
};

/// Adder the consuming side serves and the plugin calls back into.
pub trait AddHelper: Send + Sync {
    /// Adds two numbers.
    ///
    /// # Errors
    ///
    /// Returns a [`ServiceError`] when the sum cannot be produced.
    fn sum(&self, a: i64, b: i64) -> Result<i64, ServiceError>;
}

/// What a counter implementation provides.
pub trait CounterStore: Send + Sync {
    /// Adds `value` to the key's current value using the caller's adder.
    ///
    /// # Errors
    ///
    /// Returns a [`ServiceError`] when the adder fails or the value cannot
    /// be stored.
    fn put(&self, key: &str, value: i64, adder: &dyn AddHelper) -> Result<(), ServiceError>;

    /// Returns the key's current value (zero when never written).
    ///
    /// # Errors
    ///
    /// Returns a [`ServiceError`] when the value cannot be read.
    fn get(&self, key: &str) -> Result<i64, ServiceError>;
}

#[derive(Serialize, Deserialize)]
struct PutParams {
    key: String,
    value: i64,
    add_server: u32,
}

#[derive(Serialize, Deserialize)]
struct GetParams {
    key: String,
}

#[derive(Serialize, Deserialize)]
struct SumParams {
    a: i64,
    b: i64,
}

/// Capability binding for the counter plugin type.
pub struct CounterCapability {
    implementation: Option<Arc<dyn CounterStore>>,
}

impl CounterCapability {
    /// Binds a concrete implementation, for the serving side.
    #[must_use]
    pub fn server(implementation: Arc<dyn CounterStore>) -> Self {
        Self {
            implementation: Some(implementation),
        }
    }

    /// Proxy-only binding, for the consuming side.
    #[must_use]
    pub fn proxy() -> Self {
        Self {
            implementation: None,
        }
    }
}

impl PluginCapability for CounterCapability {
    fn server(&self, broker: &Arc<Broker>) -> Arc<dyn ServiceDispatch> {
        Arc::new(CounterService {
            implementation: self.implementation.clone(),
            broker: Arc::clone(broker),
        })
    }

    fn client(&self, client: RpcClient, broker: Arc<Broker>) -> Box<dyn Any + Send> {
        Box::new(CounterClient { client, broker })
    }
}

struct CounterService {
    implementation: Option<Arc<dyn CounterStore>>,
    broker: Arc<Broker>,
}

impl CounterService {
    fn implementation(&self) -> Result<&Arc<dyn CounterStore>, ServiceError> {
        self.implementation
            .as_ref()
            .ok_or_else(|| ServiceError::new("counter registered without an implementation"))
    }
}

impl ServiceDispatch for CounterService {
    fn dispatch(&self, method: &str, params: Value) -> Result<Value, ServiceError> {
        match method {
            "put" => {
                let params: PutParams = decode(params)?;
                let implementation = self.implementation()?;
                let adder_client = self
                    .broker
                    .dial(params.add_server)
                    .map_err(|e| ServiceError::new(e.to_string()))?;
                let adder = RemoteAddHelper {
                    client: adder_client,
                };
                let result = implementation.put(&params.key, params.value, &adder);
                // Tear the callback channel down whether or not put
                // succeeded, so the caller's server is not left waiting.
                adder.client.close();
                result.map(|()| Value::Null)
            }
            "get" => {
                let params: GetParams = decode(params)?;
                self.implementation()?.get(&params.key).map(|v| json!(v))
            }
            other => Err(ServiceError::new(format!("unknown method '{other}'"))),
        }
    }
}

fn decode<T: serde::de::DeserializeOwned>(params: Value) -> Result<T, ServiceError> {
    serde_json::from_value(params).map_err(|e| ServiceError::new(format!("invalid parameters: {e}")))
}

/// The plugin's view of the caller's adder: calls forwarded over the
/// callback channel.
struct RemoteAddHelper {
    client: RpcClient,
}

impl AddHelper for RemoteAddHelper {
    fn sum(&self, a: i64, b: i64) -> Result<i64, ServiceError> {
        self.client
            .call("sum", &SumParams { a, b })
            .map_err(|e| ServiceError::new(e.to_string()))
    }
}

/// The caller's adder exposed as a wire service on the callback channel.
struct AddHelperService {
    implementation: Arc<dyn AddHelper>,
}

impl ServiceDispatch for AddHelperService {
    fn dispatch(&self, method: &str, params: Value) -> Result<Value, ServiceError> {
        match method {
            "sum" => {
                let params: SumParams = decode(params)?;
                self.implementation.sum(params.a, params.b).map(|v| json!(v))
            }
            other => Err(ServiceError::new(format!("unknown method '{other}'"))),
        }
    }
}

/// Typed proxy dispensed on the consuming side.
pub struct CounterClient {
    client: RpcClient,
    broker: Arc<Broker>,
}

impl CounterClient {
    /// Adds `value` to the key's current value, serving `adder` for the
    /// plugin to call back into.
    ///
    /// # Errors
    ///
    /// Propagates connection faults, remote failures, and callback
    /// channel errors.
    pub fn put(&self, key: &str, value: i64, adder: Arc<dyn AddHelper>) -> Result<(), PluginError> {
        let id = self.broker.next_id();
        let server = self.broker.serve_channel(
            id,
            Arc::new(AddHelperService {
                implementation: adder,
            }),
        )?;

        let params = PutParams {
            key: key.to_owned(),
            value,
            add_server: id,
        };
        let encoded = serde_json::to_value(&params)
            .map_err(|e| PluginError::transport(format!("failed to encode parameters: {e}")))?;
        match self.client.invoke("put", encoded, None) {
            Ok(_) => server.join(),
            Err(error) => {
                // The plugin may never have learnt the channel id.
                server.detach();
                Err(error)
            }
        }
    }

    /// Returns the key's current value.
    ///
    /// # Errors
    ///
    /// Propagates connection faults and remote failures.
    pub fn get(&self, key: &str) -> Result<i64, PluginError> {
        self.client.call(
            "get",
            &GetParams {
                key: key.to_owned(),
            },
        )
    }
}

/// Plain local adder for the consuming side of the tests.
pub struct LocalAdder;

impl AddHelper for LocalAdder {
    fn sum(&self, a: i64, b: i64) -> Result<i64, ServiceError> {
        a.checked_add(b)
            .ok_or_else(|| ServiceError::new("sum overflows"))
    }
}

/// In-memory store for the counter fixture binary.
#[derive(Default)]
pub struct InMemoryCounter {
    values: Mutex<HashMap<String, i64>>,
}

impl InMemoryCounter {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl CounterStore for InMemoryCounter {
    fn put(&self, key: &str, value: i64, adder: &dyn AddHelper) -> Result<(), ServiceError> {
        let current = self.get(key)?;
        let next = adder.sum(current, value)?;
        let mut values = self.values.lock().unwrap_or_else(PoisonError::into_inner);
        values.insert(key.to_owned(), next);
        Ok(())
    }

    fn get(&self, key: &str) -> Result<i64, ServiceError> {
        let values = self.values.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(values.get(key).copied().unwrap_or(0))
    }
}
