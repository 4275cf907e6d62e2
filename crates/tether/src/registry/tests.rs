//! Unit tests for capability registration.

use std::any::Any;
use std::sync::Arc;

use rstest::rstest;
use serde_json::Value;

use super::*;
use crate::transport::ServiceError;

struct NullService;

impl ServiceDispatch for NullService {
    fn dispatch(&self, _method: &str, _params: Value) -> Result<Value, ServiceError> {
        Ok(Value::Null)
    }
}

struct NullCapability;

impl PluginCapability for NullCapability {
    fn server(&self, _broker: &Arc<Broker>) -> Arc<dyn ServiceDispatch> {
        Arc::new(NullService)
    }

    fn client(&self, _client: RpcClient, _broker: Arc<Broker>) -> Box<dyn Any + Send> {
        Box::new(())
    }
}

#[rstest]
fn registered_capabilities_are_found_by_name() {
    let mut set = PluginSet::new();
    set.insert("kv", Arc::new(NullCapability)).expect("insert");
    set.insert("greeter", Arc::new(NullCapability))
        .expect("insert");

    assert_eq!(set.len(), 2);
    assert!(set.get("kv").is_some());
    assert!(set.get("counter").is_none());
}

#[rstest]
fn duplicate_names_are_rejected() {
    let mut set = PluginSet::new();
    set.insert("kv", Arc::new(NullCapability)).expect("insert");

    let err = set
        .insert("kv", Arc::new(NullCapability))
        .expect_err("duplicate must fail");
    assert!(matches!(err, PluginError::Configuration { .. }));
    assert!(err.to_string().contains("kv"));
}

#[rstest]
#[case::empty("")]
#[case::dotted("kv.store")]
#[case::reserved_prefix("_broker")]
fn invalid_names_are_rejected(#[case] name: &str) {
    let mut set = PluginSet::new();
    let err = set
        .insert(name, Arc::new(NullCapability))
        .expect_err("invalid name must fail");
    assert!(matches!(err, PluginError::Configuration { .. }));
}

#[rstest]
fn versioned_sets_list_versions_in_ascending_order() {
    let mut sets = VersionedPluginSets::new();
    sets.insert(3, PluginSet::new()).expect("insert");
    sets.insert(1, PluginSet::new()).expect("insert");
    sets.insert(2, PluginSet::new()).expect("insert");

    assert_eq!(sets.versions(), vec![1, 2, 3]);
    assert!(sets.get(2).is_some());
    assert!(sets.get(4).is_none());
}

#[rstest]
fn duplicate_versions_are_rejected() {
    let mut sets = VersionedPluginSets::new();
    sets.insert(1, PluginSet::new()).expect("insert");
    let err = sets
        .insert(1, PluginSet::new())
        .expect_err("duplicate must fail");
    assert!(matches!(err, PluginError::Configuration { .. }));
}

#[rstest]
fn single_wraps_one_version() {
    let mut set = PluginSet::new();
    set.insert("kv", Arc::new(NullCapability)).expect("insert");
    let sets = VersionedPluginSets::single(5, set);

    assert_eq!(sets.versions(), vec![5]);
    assert!(sets.get(5).expect("set").get("kv").is_some());
}
