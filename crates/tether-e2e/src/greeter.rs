//! The greeter plugin type: one method, no callbacks.

use std::any::Any;
use std::sync::Arc;

use serde_json::{Value, json};
use tether::{
    Broker, PluginCapability, PluginError, RpcClient, ServiceDispatch, ServiceError,
};

/// What a greeter implementation provides.
pub trait Greeter: Send + Sync {
    /// Produces the greeting.
    ///
    /// # Errors
    ///
    /// Returns a [`ServiceError`] when the greeting cannot be produced.
    fn greet(&self) -> Result<String, ServiceError>;
}

/// Capability binding for the greeter plugin type.
///
/// The serving side wraps its implementation with
/// [`server`](Self::server); the consuming side registers
/// [`proxy`](Self::proxy) and dispenses a [`GreeterClient`].
pub struct GreeterCapability {
    implementation: Option<Arc<dyn Greeter>>,
}

impl GreeterCapability {
    /// Binds a concrete implementation, for the serving side.
    #[must_use]
    pub fn server(implementation: Arc<dyn Greeter>) -> Self {
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

impl PluginCapability for GreeterCapability {
    fn server(&self, _broker: &Arc<Broker>) -> Arc<dyn ServiceDispatch> {
        Arc::new(GreeterService {
            implementation: self.implementation.clone(),
        })
    }

    fn client(&self, client: RpcClient, _broker: Arc<Broker>) -> Box<dyn Any + Send> {
        Box::new(GreeterClient { client })
    }
}

struct GreeterService {
    implementation: Option<Arc<dyn Greeter>>,
}

impl ServiceDispatch for GreeterService {
    fn dispatch(&self, method: &str, _params: Value) -> Result<Value, ServiceError> {
        let implementation = self
            .implementation
            .as_ref()
            .ok_or_else(|| ServiceError::new("greeter registered without an implementation"))?;
        match method {
            "greet" => implementation.greet().map(|greeting| json!(greeting)),
            other => Err(ServiceError::new(format!("unknown method '{other}'"))),
        }
    }
}

/// Typed proxy dispensed on the consuming side.
pub struct GreeterClient {
    client: RpcClient,
}

impl GreeterClient {
    /// Calls the remote greeter.
    ///
    /// # Errors
    ///
    /// Propagates connection faults and remote failures.
    pub fn greet(&self) -> Result<String, PluginError> {
        self.client.call("greet", &())
    }
}
