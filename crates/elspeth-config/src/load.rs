// crates/elspeth-config/src/load.rs
// ============================================================================
// Module: Elspeth Settings Loading
// Description: YAML loading, validation, and canonical hashing of settings.
// Purpose: Produce fully-validated settings or an error naming the offender.
// Dependencies: elspeth-core, serde_yaml, thiserror
// ============================================================================

//! ## Overview
//! Settings are loaded strictly: unknown fields fail, cross-references are
//! checked before a pipeline is ever assembled, and the canonical settings
//! hash binds the run to its configuration for the resume lock.

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::collections::BTreeSet;
use std::fs;
use std::path::Path;

use elspeth_core::hashing::DEFAULT_HASH_ALGORITHM;
use elspeth_core::hashing::HashDigest;
use elspeth_core::hashing::hash_canonical_json;
use serde::Serialize;
use thiserror::Error;

use crate::settings::GateOptions;
use crate::settings::OutputModeSetting;
use crate::settings::PipelineSettings;
use crate::settings::StepSettings;

// ============================================================================
// SECTION: Errors
// ============================================================================

/// Settings loading and validation errors.
///
/// # Invariants
/// - Messages name the offending node, field, or destination.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The settings file could not be read.
    #[error("settings io error: {0}")]
    Io(String),
    /// The settings document could not be parsed.
    #[error("settings parse error: {0}")]
    Parse(String),
    /// The settings document failed cross-reference validation.
    #[error("settings validation error: {0}")]
    Validation(String),
    /// The settings could not be canonically hashed.
    #[error("settings hash error: {0}")]
    Hash(String),
}

// ============================================================================
// SECTION: Loading
// ============================================================================

/// Loads and validates settings from a YAML file.
///
/// # Errors
///
/// Returns [`ConfigError`] when the file is unreadable, unparsable, or
/// fails validation.
pub fn load_settings(path: &Path) -> Result<PipelineSettings, ConfigError> {
    let text = fs::read_to_string(path).map_err(|err| ConfigError::Io(err.to_string()))?;
    parse_settings(&text)
}

/// Parses and validates settings from YAML text.
///
/// # Errors
///
/// Returns [`ConfigError`] when the text is unparsable or fails validation.
pub fn parse_settings(text: &str) -> Result<PipelineSettings, ConfigError> {
    let settings: PipelineSettings =
        serde_yaml::from_str(text).map_err(|err| ConfigError::Parse(err.to_string()))?;
    validate_settings(&settings)?;
    Ok(settings)
}

/// Validates cross-references within parsed settings.
///
/// # Errors
///
/// Returns [`ConfigError::Validation`] naming the offender.
pub fn validate_settings(settings: &PipelineSettings) -> Result<(), ConfigError> {
    let sink_names: BTreeSet<&str> = settings.sinks.keys().map(String::as_str).collect();
    if !sink_names.contains(settings.default_sink.as_str()) {
        return Err(ConfigError::Validation(format!(
            "default_sink '{}' is not a declared sink",
            settings.default_sink
        )));
    }
    let mut nodes: BTreeSet<&str> = BTreeSet::new();
    nodes.insert(settings.source.node.as_str());
    for name in &sink_names {
        if !nodes.insert(name) {
            return Err(ConfigError::Validation(format!("duplicate node identifier: {name}")));
        }
    }
    for step in &settings.steps {
        if !nodes.insert(step.node()) {
            return Err(ConfigError::Validation(format!(
                "duplicate node identifier: {}",
                step.node()
            )));
        }
    }
    validate_error_destination(
        "source.on_validation_failure",
        &settings.source.on_validation_failure,
        &sink_names,
    )?;
    for step in &settings.steps {
        match step {
            StepSettings::Transform {
                node,
                on_error,
                ..
            } => {
                validate_error_destination(
                    &format!("transform '{node}' on_error"),
                    on_error,
                    &sink_names,
                )?;
            }
            StepSettings::Gate {
                node,
                plugin,
                routes,
                on_error,
            } => {
                validate_error_destination(
                    &format!("gate '{node}' on_error"),
                    on_error,
                    &sink_names,
                )?;
                for (label, destination) in routes {
                    if destination != "continue"
                        && destination != "fork"
                        && !sink_names.contains(destination.as_str())
                    {
                        return Err(ConfigError::Validation(format!(
                            "gate '{node}' route '{label}' references unknown destination \
                             '{destination}'"
                        )));
                    }
                }
                if let GateOptions::ForkAll {
                    branches,
                } = plugin
                {
                    if branches.is_empty() {
                        return Err(ConfigError::Validation(format!(
                            "gate '{node}' declares a fork with no branches"
                        )));
                    }
                    for branch in branches {
                        if branch.destination != "continue"
                            && !sink_names.contains(branch.destination.as_str())
                        {
                            return Err(ConfigError::Validation(format!(
                                "gate '{node}' branch '{}' references unknown destination '{}'",
                                branch.branch, branch.destination
                            )));
                        }
                    }
                }
            }
            StepSettings::Aggregation {
                node,
                output_mode,
                plugin,
                on_error,
                ..
            } => {
                validate_error_destination(
                    &format!("aggregation '{node}' on_error"),
                    on_error,
                    &sink_names,
                )?;
                if *output_mode != OutputModeSetting::Passthrough && plugin.is_none() {
                    return Err(ConfigError::Validation(format!(
                        "aggregation '{node}' requires a plugin for its output mode"
                    )));
                }
            }
            StepSettings::Coalesce {
                node,
                branches,
            } => {
                if branches.is_empty() {
                    return Err(ConfigError::Validation(format!(
                        "coalesce '{node}' awaits no branches"
                    )));
                }
            }
        }
    }
    Ok(())
}

/// Validates a `discard`-or-sink destination.
fn validate_error_destination(
    what: &str,
    destination: &str,
    sink_names: &BTreeSet<&str>,
) -> Result<(), ConfigError> {
    if destination != "discard" && !sink_names.contains(destination) {
        return Err(ConfigError::Validation(format!(
            "{what} references unknown sink '{destination}'"
        )));
    }
    Ok(())
}

// ============================================================================
// SECTION: Hashing
// ============================================================================

/// Computes the canonical hash of the full settings document.
///
/// # Errors
///
/// Returns [`ConfigError::Hash`] when canonicalization fails.
pub fn settings_hash(settings: &PipelineSettings) -> Result<HashDigest, ConfigError> {
    hash_value(settings)
}

/// Computes the canonical hash of one node's settings fragment.
///
/// # Errors
///
/// Returns [`ConfigError::Hash`] when canonicalization fails.
pub fn hash_value<T: Serialize>(value: &T) -> Result<HashDigest, ConfigError> {
    hash_canonical_json(DEFAULT_HASH_ALGORITHM, value)
        .map_err(|err| ConfigError::Hash(err.to_string()))
}
