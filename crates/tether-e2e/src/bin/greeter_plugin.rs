//! Greeter fixture binary.
//!
//! Advertised versions and protocols are tunable through
//! `TEST_PLUGIN_VERSIONS` and `TEST_PLUGIN_PROTOCOLS` so the negotiation
//! tests can stage mismatches without separate binaries.

use std::env;
use std::process::ExitCode;
use std::sync::Arc;

use tether::handshake::{parse_protocols, parse_versions};
use tether::{PluginSet, ServeConfig, ServiceError, VersionedPluginSets, serve};
use tether_e2e::greeter::{Greeter, GreeterCapability};
use tether_e2e::{handshake, init_plugin_tracing};

struct HelloGreeter;

impl Greeter for HelloGreeter {
    fn greet(&self) -> Result<String, ServiceError> {
        Ok("Hello!".to_owned())
    }
}

fn main() -> ExitCode {
    init_plugin_tracing();

    let versions = env::var("TEST_PLUGIN_VERSIONS")
        .ok()
        .map(|v| parse_versions(&v))
        .filter(|v| !v.is_empty())
        .unwrap_or_else(|| vec![1]);

    let mut sets = VersionedPluginSets::new();
    for version in versions {
        let mut set = PluginSet::new();
        if let Err(error) = set.insert("greeter", Arc::new(GreeterCapability::server(Arc::new(HelloGreeter)))) {
            eprintln!("greeter-plugin: {error}");
            return ExitCode::FAILURE;
        }
        if let Err(error) = sets.insert(version, set) {
            eprintln!("greeter-plugin: {error}");
            return ExitCode::FAILURE;
        }
    }

    let mut config = ServeConfig::new(handshake(), sets);
    if let Some(protocols) = env::var("TEST_PLUGIN_PROTOCOLS")
        .ok()
        .map(|p| parse_protocols(&p))
        .filter(|p| !p.is_empty())
    {
        config = config.supported_protocols(protocols);
    }

    if let Err(error) = serve(config) {
        eprintln!("greeter-plugin: {error}");
        return ExitCode::FAILURE;
    }
    ExitCode::SUCCESS
}
