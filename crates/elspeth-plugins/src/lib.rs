// crates/elspeth-plugins/src/lib.rs
// ============================================================================
// Module: Elspeth Plugins
// Description: Built-in plugins and the settings-to-pipeline assembly.
// Purpose: Provide the plugin implementations the CLI and tests run with.
// Dependencies: elspeth-config, elspeth-core, serde_json, thiserror
// ============================================================================

//! ## Overview
//! Built-in sources, transforms, gates, and sinks implementing the core
//! plugin contracts, an environment-backed secrets provider, and the
//! assembly that turns validated settings into an orchestrator pipeline.

// ============================================================================
// SECTION: Modules
// ============================================================================

mod assembly;
mod gate;
mod secrets;
mod sink;
mod source;
mod transform;

// ============================================================================
// SECTION: Re-exports
// ============================================================================

pub use assembly::BuildError;
pub use assembly::build_pipeline;
pub use gate::ForkAllGate;
pub use gate::RouteOnEqualsGate;
pub use secrets::EnvSecretsProvider;
pub use secrets::FINGERPRINT_KEY_ENV;
pub use secrets::StaticSecretsProvider;
pub use sink::CsvSink;
pub use sink::MemorySink;
pub use sink::MemorySinkHandle;
pub use sink::MemorySinkRecord;
pub use source::CsvSource;
pub use source::InlineSource;
pub use transform::ConcatTransform;
pub use transform::FailOnTransform;
pub use transform::IdentityTransform;
pub use transform::RenameTransform;
pub use transform::SetFieldTransform;
pub use transform::UppercaseTransform;
