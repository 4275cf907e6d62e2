//! End-to-end test harness: example plugin types and their fixture
//! binaries.
//!
//! The [`greeter`] module is the minimal round trip (one method, no
//! callbacks); [`counter`] exercises the broker with a bidirectional
//! flow where the plugin calls an adder the host serves. Both sides of
//! each plugin type live here so the fixture binaries under `src/bin/`
//! and the tests under `tests/` agree on names and wire shapes.

use tether::HandshakeConfig;

pub mod counter;
pub mod greeter;

/// The handshake both fixture binaries and the tests embed.
#[must_use]
pub fn handshake() -> HandshakeConfig {
    HandshakeConfig::new(1, "TETHER_E2E_PLUGIN", "5f3a9c1e8d")
}

/// Routes fixture-binary diagnostics to stderr; stdout belongs to the
/// handshake line.
pub fn init_plugin_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();
}
