//! Named plugin capabilities and the versioned sets a session negotiates
//! over.
//!
//! A [`PluginCapability`] is the binding layer for one plugin type: it
//! knows how to expose a concrete implementation as a wire service and how
//! to wrap a connection in a typed proxy. Host and plugin agree on
//! capability names out of band; a [`PluginSet`] collects the capabilities
//! offered at one application protocol version, and
//! [`VersionedPluginSets`] holds one set per supported version so old
//! hosts and new plugins (or the reverse) can still find common ground.

use std::any::Any;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use crate::broker::Broker;
use crate::error::PluginError;
use crate::transport::{RpcClient, ServiceDispatch};

#[cfg(test)]
mod tests;

/// The two halves of one plugin type: serving it and proxying to it.
///
/// Implementations are registered under a name on both ends of a session.
/// On the serving end, [`server`](Self::server) produces the dispatcher
/// that answers calls; on the consuming end, [`client`](Self::client)
/// wraps a scoped [`RpcClient`] in the concrete proxy type, which the
/// session's `dispense` downcasts back out of the `Box<dyn Any>`.
pub trait PluginCapability: Send + Sync {
    /// Builds the wire-facing dispatcher for this capability.
    fn server(&self, broker: &Arc<Broker>) -> Arc<dyn ServiceDispatch>;

    /// Builds the typed proxy for this capability. `client` is already
    /// scoped to the capability's method namespace.
    fn client(&self, client: RpcClient, broker: Arc<Broker>) -> Box<dyn Any + Send>;
}

/// The capabilities offered at one application protocol version.
#[derive(Default)]
pub struct PluginSet {
    plugins: HashMap<String, Arc<dyn PluginCapability>>,
}

impl PluginSet {
    /// Creates an empty set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a capability under a name.
    ///
    /// # Errors
    ///
    /// Returns [`PluginError::Configuration`] when the name is already
    /// taken, is empty, contains the `.` method separator, or starts with
    /// the reserved `_` prefix.
    pub fn insert(
        &mut self,
        name: impl Into<String>,
        capability: Arc<dyn PluginCapability>,
    ) -> Result<(), PluginError> {
        let name = name.into();
        if name.is_empty() {
            return Err(PluginError::Configuration {
                message: "plugin name must not be empty".to_owned(),
            });
        }
        if name.contains('.') {
            return Err(PluginError::Configuration {
                message: format!("plugin name '{name}' must not contain '.'"),
            });
        }
        if name.starts_with('_') {
            return Err(PluginError::Configuration {
                message: format!("plugin name '{name}' uses the reserved '_' prefix"),
            });
        }
        if self.plugins.contains_key(&name) {
            return Err(PluginError::Configuration {
                message: format!("plugin '{name}' is already registered"),
            });
        }
        self.plugins.insert(name, capability);
        Ok(())
    }

    /// Looks up a capability by name.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&Arc<dyn PluginCapability>> {
        self.plugins.get(name)
    }

    /// Iterates over the registered `(name, capability)` pairs.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &Arc<dyn PluginCapability>)> {
        self.plugins.iter().map(|(name, cap)| (name.as_str(), cap))
    }

    /// Returns the number of registered capabilities.
    #[must_use]
    pub fn len(&self) -> usize {
        self.plugins.len()
    }

    /// Returns `true` when no capability is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.plugins.is_empty()
    }
}

/// One [`PluginSet`] per supported application protocol version.
#[derive(Default)]
pub struct VersionedPluginSets {
    sets: BTreeMap<u32, PluginSet>,
}

impl VersionedPluginSets {
    /// Creates an empty collection.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Wraps a single set, for the common case of supporting exactly one
    /// protocol version.
    #[must_use]
    pub fn single(version: u32, set: PluginSet) -> Self {
        let mut sets = BTreeMap::new();
        sets.insert(version, set);
        Self { sets }
    }

    /// Adds the set for one protocol version.
    ///
    /// # Errors
    ///
    /// Returns [`PluginError::Configuration`] when the version already has
    /// a set.
    pub fn insert(&mut self, version: u32, set: PluginSet) -> Result<(), PluginError> {
        if self.sets.contains_key(&version) {
            return Err(PluginError::Configuration {
                message: format!("protocol version {version} is already registered"),
            });
        }
        self.sets.insert(version, set);
        Ok(())
    }

    /// Returns the supported versions in ascending order.
    #[must_use]
    pub fn versions(&self) -> Vec<u32> {
        self.sets.keys().copied().collect()
    }

    /// Looks up the set for one version.
    #[must_use]
    pub fn get(&self, version: u32) -> Option<&PluginSet> {
        self.sets.get(&version)
    }

    /// Returns `true` when no version is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.sets.is_empty()
    }
}
