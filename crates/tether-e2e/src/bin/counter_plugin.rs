//! Counter fixture binary: exercises host-served callback channels.

use std::env;
use std::process::ExitCode;
use std::sync::Arc;

use tether::handshake::parse_protocols;
use tether::{PluginSet, ServeConfig, VersionedPluginSets, serve};
use tether_e2e::counter::{CounterCapability, InMemoryCounter};
use tether_e2e::{handshake, init_plugin_tracing};

fn main() -> ExitCode {
    init_plugin_tracing();

    let mut set = PluginSet::new();
    let capability = CounterCapability::server(Arc::new(InMemoryCounter::new()));
    if let Err(error) = set.insert("counter", Arc::new(capability)) {
        eprintln!("counter-plugin: {error}");
        return ExitCode::FAILURE;
    }

    let mut config = ServeConfig::new(handshake(), VersionedPluginSets::single(1, set));
    if let Some(protocols) = env::var("TEST_PLUGIN_PROTOCOLS")
        .ok()
        .map(|p| parse_protocols(&p))
        .filter(|p| !p.is_empty())
    {
        config = config.supported_protocols(protocols);
    }

    if let Err(error) = serve(config) {
        eprintln!("counter-plugin: {error}");
        return ExitCode::FAILURE;
    }
    ExitCode::SUCCESS
}
