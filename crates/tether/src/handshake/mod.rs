//! Handshake line format and version/protocol negotiation.
//!
//! A plugin announces itself by writing exactly one pipe-delimited line to
//! its standard output:
//!
//! ```text
//! CORE_VERSION|APP_VERSION|NETWORK_TYPE|ADDRESS|WIRE_PROTOCOL[|SERVER_CERT]
//! ```
//!
//! The host parses the line strictly (any malformed field is fatal) but
//! tolerates extra trailing fields for forward compatibility. Negotiation
//! inputs travel in the other direction through the child environment: the
//! host exports its application protocol versions and its wire protocol
//! priority list, and the plugin picks the best values it supports before
//! emitting its line.

use std::env;
use std::fmt;

use crate::error::PluginError;
use crate::transport::Endpoint;

#[cfg(test)]
mod tests;

/// Environment variable through which the host declares its application
/// protocol versions (comma-separated, e.g. `2,3`).
pub const PROTOCOL_VERSIONS_ENV: &str = "TETHER_PROTOCOL_VERSIONS";

/// Environment variable through which the host declares the wire protocols
/// it accepts, in priority order (comma-separated tokens).
pub const WIRE_PROTOCOLS_ENV: &str = "TETHER_WIRE_PROTOCOLS";

/// Handshake parameters shared by host and plugin at build time.
///
/// Both sides must embed byte-identical cookie values and the same core
/// protocol version; there is no negotiation on either. The cookie is a UX
/// safeguard that stops users from running a plugin binary directly — it is
/// **not** a security boundary and must never be treated as authentication.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandshakeConfig {
    core_protocol_version: u32,
    magic_cookie_key: String,
    magic_cookie_value: String,
}

impl HandshakeConfig {
    /// Creates a handshake configuration.
    pub fn new(
        core_protocol_version: u32,
        magic_cookie_key: impl Into<String>,
        magic_cookie_value: impl Into<String>,
    ) -> Self {
        Self {
            core_protocol_version,
            magic_cookie_key: magic_cookie_key.into(),
            magic_cookie_value: magic_cookie_value.into(),
        }
    }

    /// Returns the core protocol version, which must match exactly.
    #[must_use]
    pub const fn core_protocol_version(&self) -> u32 {
        self.core_protocol_version
    }

    /// Returns the magic cookie environment variable name.
    #[must_use]
    pub fn magic_cookie_key(&self) -> &str {
        &self.magic_cookie_key
    }

    /// Returns the expected magic cookie value.
    #[must_use]
    pub fn magic_cookie_value(&self) -> &str {
        &self.magic_cookie_value
    }

    /// Returns `true` when the current process environment carries the
    /// expected cookie, i.e. the process was launched by a host.
    #[must_use]
    pub fn cookie_present(&self) -> bool {
        env::var(&self.magic_cookie_key).is_ok_and(|v| v == self.magic_cookie_value)
    }
}

/// The wire protocols a session can speak.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WireProtocol {
    /// Strict in-order call/response exchange; lowest common denominator.
    Simple,
    /// Multiplexed bidirectional streaming; preferred when both sides
    /// support it.
    Stream,
}

impl WireProtocol {
    /// Returns the handshake token for this protocol.
    #[must_use]
    pub const fn token(self) -> &'static str {
        match self {
            Self::Simple => "simple",
            Self::Stream => "stream",
        }
    }

    /// Parses a handshake token.
    #[must_use]
    pub fn from_token(token: &str) -> Option<Self> {
        match token {
            "simple" => Some(Self::Simple),
            "stream" => Some(Self::Stream),
            _ => None,
        }
    }
}

impl fmt::Display for WireProtocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.token())
    }
}

/// The parsed announcement a plugin writes to its stdout at startup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandshakeLine {
    /// Core protocol version the plugin was built against.
    pub core_version: u32,
    /// Application protocol version the plugin selected.
    pub app_version: u32,
    /// Endpoint the plugin is serving on.
    pub endpoint: Endpoint,
    /// Wire protocol token the plugin selected. Kept as a raw token so an
    /// unknown protocol surfaces as a negotiation failure naming it, not a
    /// parse error.
    pub protocol: String,
    /// Optional base64 server certificate. Parsed and retained for wire
    /// compatibility; TLS is not implemented.
    pub server_cert: Option<String>,
}

impl HandshakeLine {
    /// Parses a handshake line.
    ///
    /// # Errors
    ///
    /// Returns [`PluginError::MalformedHandshake`] naming the offending
    /// field. Extra trailing fields are ignored.
    pub fn parse(line: &str) -> Result<Self, PluginError> {
        let fields: Vec<&str> = line.trim_end_matches(['\r', '\n']).split('|').collect();
        if fields.len() < 5 {
            return Err(PluginError::MalformedHandshake {
                message: format!("expected at least 5 fields, got {}", fields.len()),
            });
        }

        let core_version = parse_version_field(fields[0], "CORE_VERSION")?;
        let app_version = parse_version_field(fields[1], "APP_VERSION")?;
        let endpoint = Endpoint::from_tokens(fields[2], fields[3])?;
        let protocol = fields[4];
        if protocol.is_empty() {
            return Err(PluginError::MalformedHandshake {
                message: "empty WIRE_PROTOCOL field".to_owned(),
            });
        }
        let server_cert = fields.get(5).filter(|c| !c.is_empty()).map(|c| (*c).to_owned());

        Ok(Self {
            core_version,
            app_version,
            endpoint,
            protocol: protocol.to_owned(),
            server_cert,
        })
    }

    /// Renders the line a plugin writes to stdout (without the newline).
    #[must_use]
    pub fn to_line(&self) -> String {
        let mut line = format!(
            "{}|{}|{}|{}|{}",
            self.core_version,
            self.app_version,
            self.endpoint.network_token(),
            self.endpoint.address_token(),
            self.protocol,
        );
        if let Some(cert) = &self.server_cert {
            line.push('|');
            line.push_str(cert);
        }
        line
    }

    /// Validates the line against the host's configuration and returns the
    /// negotiated `(app_version, wire_protocol)` pair.
    ///
    /// # Errors
    ///
    /// Returns [`PluginError::CoreVersionMismatch`],
    /// [`PluginError::NoCompatibleVersion`], or
    /// [`PluginError::NoCompatibleProtocol`], each naming expected and
    /// actual values.
    pub fn validate(
        &self,
        config: &HandshakeConfig,
        host_versions: &[u32],
        allowed_protocols: &[WireProtocol],
    ) -> Result<(u32, WireProtocol), PluginError> {
        if self.core_version != config.core_protocol_version() {
            return Err(PluginError::CoreVersionMismatch {
                expected: config.core_protocol_version(),
                actual: self.core_version,
            });
        }

        if !host_versions.contains(&self.app_version) {
            return Err(PluginError::NoCompatibleVersion {
                host: host_versions.to_vec(),
                plugin: vec![self.app_version],
            });
        }

        let protocol = allowed_protocols
            .iter()
            .copied()
            .find(|p| p.token() == self.protocol)
            .ok_or_else(|| PluginError::NoCompatibleProtocol {
                allowed: join_protocols(allowed_protocols),
                advertised: self.protocol.clone(),
            })?;

        Ok((self.app_version, protocol))
    }
}

fn parse_version_field(field: &str, name: &str) -> Result<u32, PluginError> {
    field.parse().map_err(|_| PluginError::MalformedHandshake {
        message: format!("invalid {name} field '{field}'"),
    })
}

/// Renders a comma-separated protocol list (the [`WIRE_PROTOCOLS_ENV`]
/// encoding, also used in error messages).
#[must_use]
pub fn join_protocols(protocols: &[WireProtocol]) -> String {
    protocols
        .iter()
        .map(|p| p.token())
        .collect::<Vec<_>>()
        .join(",")
}

/// Renders a comma-separated version list (the [`PROTOCOL_VERSIONS_ENV`]
/// encoding).
#[must_use]
pub fn join_versions(versions: &[u32]) -> String {
    versions
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(",")
}

/// Parses the [`PROTOCOL_VERSIONS_ENV`] encoding, skipping blank entries.
#[must_use]
pub fn parse_versions(value: &str) -> Vec<u32> {
    value
        .split(',')
        .filter_map(|v| v.trim().parse().ok())
        .collect()
}

/// Parses the [`WIRE_PROTOCOLS_ENV`] encoding, skipping unknown tokens.
#[must_use]
pub fn parse_protocols(value: &str) -> Vec<WireProtocol> {
    value
        .split(',')
        .filter_map(|t| WireProtocol::from_token(t.trim()))
        .collect()
}

/// Picks the highest application protocol version present in both sets.
///
/// # Errors
///
/// Returns [`PluginError::NoCompatibleVersion`] naming both sets when the
/// intersection is empty.
pub fn negotiate_version(host: &[u32], plugin: &[u32]) -> Result<u32, PluginError> {
    plugin
        .iter()
        .filter(|v| host.contains(v))
        .max()
        .copied()
        .ok_or_else(|| {
            let mut host = host.to_vec();
            host.sort_unstable();
            let mut plugin = plugin.to_vec();
            plugin.sort_unstable();
            PluginError::NoCompatibleVersion { host, plugin }
        })
}

/// Picks the wire protocol for a session: the first protocol in the
/// **host's** priority list that the plugin supports. The host's order
/// wins whenever several protocols are mutually acceptable.
#[must_use]
pub fn select_protocol(
    host_priority: &[WireProtocol],
    supported: &[WireProtocol],
) -> Option<WireProtocol> {
    host_priority
        .iter()
        .copied()
        .find(|p| supported.contains(p))
}
