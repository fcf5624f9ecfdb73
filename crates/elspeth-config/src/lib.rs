// crates/elspeth-config/src/lib.rs
// ============================================================================
// Module: Elspeth Config
// Description: Typed pipeline settings, strict YAML loading, validation.
// Purpose: Expose the closed settings vocabulary for pipeline assembly.
// Dependencies: elspeth-core, serde, serde_yaml, thiserror
// ============================================================================

//! ## Overview
//! Pipeline configuration is a closed, typed document: every plugin family
//! is a tagged enum, every cross-reference is validated before assembly,
//! and the canonical settings hash binds a run to its configuration.

// ============================================================================
// SECTION: Modules
// ============================================================================

mod load;
mod settings;

// ============================================================================
// SECTION: Re-exports
// ============================================================================

pub use load::ConfigError;
pub use load::hash_value;
pub use load::load_settings;
pub use load::parse_settings;
pub use load::settings_hash;
pub use load::validate_settings;
pub use settings::BranchSetting;
pub use settings::ContractModeSetting;
pub use settings::ContractSettings;
pub use settings::FieldSetting;
pub use settings::GateOptions;
pub use settings::LandscapeSettings;
pub use settings::OutputModeSetting;
pub use settings::PayloadSettings;
pub use settings::PipelineSettings;
pub use settings::RetrySettings;
pub use settings::SinkOptions;
pub use settings::SinkSettings;
pub use settings::SourceOptions;
pub use settings::SourceSettings;
pub use settings::StepSettings;
pub use settings::TransformOptions;
pub use settings::TriggerSettings;
