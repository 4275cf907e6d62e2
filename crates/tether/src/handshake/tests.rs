//! Unit tests for handshake parsing and negotiation.

use rstest::rstest;

use super::*;
use crate::transport::Endpoint;

fn config() -> HandshakeConfig {
    HandshakeConfig::new(1, "APP_PLUGIN", "abc")
}

// ---------------------------------------------------------------------------
// Parsing
// ---------------------------------------------------------------------------

#[rstest]
fn parses_five_field_line() {
    let line = HandshakeLine::parse("1|3|tcp|127.0.0.1:4444|stream").expect("parse");
    assert_eq!(line.core_version, 1);
    assert_eq!(line.app_version, 3);
    assert_eq!(
        line.endpoint,
        Endpoint::Tcp {
            addr: "127.0.0.1:4444".to_owned()
        }
    );
    assert_eq!(line.protocol, "stream");
    assert!(line.server_cert.is_none());
}

#[rstest]
fn parses_unix_endpoint_and_server_cert() {
    let line = HandshakeLine::parse("1|2|unix|/tmp/p.sock|simple|QkFTRTY0").expect("parse");
    assert_eq!(
        line.endpoint,
        Endpoint::Unix {
            path: "/tmp/p.sock".into()
        }
    );
    assert_eq!(line.server_cert.as_deref(), Some("QkFTRTY0"));
}

#[rstest]
fn ignores_extra_trailing_fields() {
    let line = HandshakeLine::parse("1|2|tcp|127.0.0.1:1|simple||future|fields").expect("parse");
    assert_eq!(line.app_version, 2);
    assert!(line.server_cert.is_none(), "empty cert field stays empty");
}

#[rstest]
fn tolerates_trailing_newline() {
    let line = HandshakeLine::parse("1|1|tcp|127.0.0.1:9|simple\n").expect("parse");
    assert_eq!(line.protocol, "simple");
}

#[rstest]
#[case::too_few_fields("1|2|tcp|addr")]
#[case::bad_core_version("one|2|tcp|127.0.0.1:1|simple")]
#[case::bad_app_version("1|x|tcp|127.0.0.1:1|simple")]
#[case::bad_network("1|2|pipe|whatever|simple")]
#[case::empty_protocol("1|2|tcp|127.0.0.1:1|")]
#[case::empty_line("")]
fn malformed_lines_are_fatal(#[case] input: &str) {
    let err = HandshakeLine::parse(input).expect_err("should fail");
    assert!(matches!(err, PluginError::MalformedHandshake { .. }));
}

#[rstest]
fn to_line_round_trips() {
    let line = HandshakeLine::parse("1|3|tcp|127.0.0.1:4444|stream").expect("parse");
    assert_eq!(line.to_line(), "1|3|tcp|127.0.0.1:4444|stream");
    let reparsed = HandshakeLine::parse(&line.to_line()).expect("reparse");
    assert_eq!(reparsed, line);
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

#[rstest]
fn validation_accepts_a_compatible_line() {
    let line = HandshakeLine::parse("1|3|tcp|127.0.0.1:1|stream").expect("parse");
    let (version, protocol) = line
        .validate(&config(), &[2, 3], &[WireProtocol::Stream, WireProtocol::Simple])
        .expect("validate");
    assert_eq!(version, 3);
    assert_eq!(protocol, WireProtocol::Stream);
}

#[rstest]
fn validation_rejects_core_version_mismatch() {
    let line = HandshakeLine::parse("9|3|tcp|127.0.0.1:1|stream").expect("parse");
    let err = line
        .validate(&config(), &[3], &[WireProtocol::Stream])
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
fn validation_rejects_unknown_app_version() {
    let line = HandshakeLine::parse("1|7|tcp|127.0.0.1:1|stream").expect("parse");
    let err = line
        .validate(&config(), &[2, 3], &[WireProtocol::Stream])
        .expect_err("should fail");
    let PluginError::NoCompatibleVersion { host, plugin } = err else {
        panic!("expected version mismatch");
    };
    assert_eq!(host, vec![2, 3]);
    assert_eq!(plugin, vec![7]);
}

#[rstest]
fn validation_rejects_disallowed_protocol() {
    let line = HandshakeLine::parse("1|2|tcp|127.0.0.1:1|stream").expect("parse");
    let err = line
        .validate(&config(), &[2], &[WireProtocol::Simple])
        .expect_err("should fail");
    let PluginError::NoCompatibleProtocol { allowed, advertised } = err else {
        panic!("expected protocol mismatch");
    };
    assert_eq!(allowed, "simple");
    assert_eq!(advertised, "stream");
}

#[rstest]
fn validation_rejects_unknown_protocol_token() {
    let line = HandshakeLine::parse("1|2|tcp|127.0.0.1:1|carrier-pigeon").expect("parse");
    let err = line
        .validate(&config(), &[2], &[WireProtocol::Simple, WireProtocol::Stream])
        .expect_err("should fail");
    assert!(matches!(err, PluginError::NoCompatibleProtocol { .. }));
}

// ---------------------------------------------------------------------------
// Negotiation
// ---------------------------------------------------------------------------

#[rstest]
#[case::both_full(&[2, 3], &[2, 3], 3)]
#[case::plugin_older(&[2, 3], &[2], 2)]
#[case::host_older(&[2], &[2, 3], 2)]
#[case::single_shared(&[1], &[1], 1)]
#[case::unordered(&[3, 1, 2], &[2, 1], 2)]
fn negotiation_picks_highest_shared_version(
    #[case] host: &[u32],
    #[case] plugin: &[u32],
    #[case] expected: u32,
) {
    assert_eq!(negotiate_version(host, plugin).expect("negotiate"), expected);
}

#[rstest]
fn negotiation_fails_on_disjoint_sets() {
    let err = negotiate_version(&[2, 3], &[4, 5]).expect_err("should fail");
    let PluginError::NoCompatibleVersion { host, plugin } = err else {
        panic!("expected version mismatch");
    };
    assert_eq!(host, vec![2, 3]);
    assert_eq!(plugin, vec![4, 5]);
}

#[rstest]
fn host_priority_order_breaks_protocol_ties() {
    use WireProtocol::{Simple, Stream};
    // Both sides accept both protocols; the host listed simple first.
    assert_eq!(select_protocol(&[Simple, Stream], &[Stream, Simple]), Some(Simple));
    assert_eq!(select_protocol(&[Stream, Simple], &[Stream, Simple]), Some(Stream));
    assert_eq!(select_protocol(&[Stream], &[Simple]), None);
}

// ---------------------------------------------------------------------------
// Environment encodings
// ---------------------------------------------------------------------------

#[rstest]
fn version_list_round_trips_through_env_encoding() {
    let versions = vec![2, 3, 5];
    assert_eq!(parse_versions(&join_versions(&versions)), versions);
}

#[rstest]
fn protocol_list_skips_unknown_tokens() {
    assert_eq!(
        parse_protocols("stream,telepathy,simple"),
        vec![WireProtocol::Stream, WireProtocol::Simple]
    );
}

#[rstest]
fn blank_version_entries_are_skipped() {
    assert_eq!(parse_versions("2,,3, "), vec![2, 3]);
}
