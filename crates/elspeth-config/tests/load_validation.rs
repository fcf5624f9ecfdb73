// crates/elspeth-config/tests/load_validation.rs
// ============================================================================
// Module: Settings Load & Validation Tests
// Description: Strict parsing, cross-reference checks, canonical hashing.
// ============================================================================
//! ## Overview
//! Settings must parse strictly (unknown fields and kinds fail), validate
//! every cross-reference before assembly, and hash canonically so that
//! logically-equal documents bind to the same run configuration.

#![allow(
    clippy::panic,
    clippy::print_stdout,
    clippy::print_stderr,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::use_debug,
    clippy::dbg_macro,
    clippy::panic_in_result_fn,
    clippy::unwrap_in_result,
    reason = "Test-only assertions and helpers are permitted."
)]

use elspeth_config::ConfigError;
use elspeth_config::parse_settings;
use elspeth_config::settings_hash;

/// A minimal valid settings document.
const VALID: &str = r"
source:
  node: src
  options:
    kind: inline
    rows:
      - { id: 1 }
      - { id: 2 }
sinks:
  out:
    options:
      kind: memory
default_sink: out
landscape:
  path: landscape.db
payload:
  dir: payloads
";

#[test]
fn valid_settings_parse_and_hash_stably() {
    let settings = parse_settings(VALID).expect("parse");
    assert_eq!(settings.source.node, "src");
    assert_eq!(settings.default_sink, "out");
    assert_eq!(settings.source.on_validation_failure, "discard");
    let first = settings_hash(&settings).expect("hash");
    let second = settings_hash(&parse_settings(VALID).expect("parse")).expect("hash");
    assert_eq!(first, second);
}

#[test]
fn unknown_fields_are_rejected() {
    let text = format!("{VALID}\nsurprise: true\n");
    assert!(matches!(parse_settings(&text), Err(ConfigError::Parse(_))));
}

#[test]
fn unknown_plugin_kinds_are_rejected() {
    let text = r"
source:
  node: src
  options:
    kind: quantum
sinks:
  out:
    options:
      kind: memory
default_sink: out
landscape:
  path: landscape.db
payload:
  dir: payloads
";
    assert!(matches!(parse_settings(text), Err(ConfigError::Parse(_))));
}

#[test]
fn default_sink_must_exist() {
    let text = r"
source:
  node: src
  options:
    kind: inline
    rows: []
sinks:
  out:
    options:
      kind: memory
default_sink: elsewhere
landscape:
  path: landscape.db
payload:
  dir: payloads
";
    let error = parse_settings(text).unwrap_err();
    assert!(matches!(error, ConfigError::Validation(message) if message.contains("elsewhere")));
}

#[test]
fn gate_routes_must_reference_known_destinations() {
    let text = r"
source:
  node: src
  options:
    kind: inline
    rows: []
steps:
  - kind: gate
    node: g1
    plugin:
      kind: route_on_equals
      field: id
      equals: 1
      route: reject
    routes:
      reject: nowhere
sinks:
  out:
    options:
      kind: memory
default_sink: out
landscape:
  path: landscape.db
payload:
  dir: payloads
";
    let error = parse_settings(text).unwrap_err();
    assert!(matches!(
        error,
        ConfigError::Validation(message) if message.contains("g1") && message.contains("nowhere")
    ));
}

#[test]
fn transform_error_sink_must_exist() {
    let text = r"
source:
  node: src
  options:
    kind: inline
    rows: []
steps:
  - kind: transform
    node: t1
    plugin:
      kind: identity
    on_error: black-hole
sinks:
  out:
    options:
      kind: memory
default_sink: out
landscape:
  path: landscape.db
payload:
  dir: payloads
";
    let error = parse_settings(text).unwrap_err();
    assert!(matches!(
        error,
        ConfigError::Validation(message) if message.contains("black-hole")
    ));
}

#[test]
fn aggregation_requires_a_plugin_unless_passthrough() {
    let text = r"
source:
  node: src
  options:
    kind: inline
    rows: []
steps:
  - kind: aggregation
    node: agg
    output_mode: single
    trigger:
      count: 5
sinks:
  out:
    options:
      kind: memory
default_sink: out
landscape:
  path: landscape.db
payload:
  dir: payloads
";
    let error = parse_settings(text).unwrap_err();
    assert!(matches!(error, ConfigError::Validation(message) if message.contains("agg")));

    let passthrough = r"
source:
  node: src
  options:
    kind: inline
    rows: []
steps:
  - kind: aggregation
    node: agg
    output_mode: passthrough
    trigger:
      count: 5
sinks:
  out:
    options:
      kind: memory
default_sink: out
landscape:
  path: landscape.db
payload:
  dir: payloads
";
    assert!(parse_settings(passthrough).is_ok());
}

#[test]
fn duplicate_node_identifiers_are_rejected() {
    let text = r"
source:
  node: src
  options:
    kind: inline
    rows: []
steps:
  - kind: transform
    node: dup
    plugin:
      kind: identity
  - kind: transform
    node: dup
    plugin:
      kind: identity
sinks:
  out:
    options:
      kind: memory
default_sink: out
landscape:
  path: landscape.db
payload:
  dir: payloads
";
    let error = parse_settings(text).unwrap_err();
    assert!(matches!(error, ConfigError::Validation(message) if message.contains("dup")));
}
