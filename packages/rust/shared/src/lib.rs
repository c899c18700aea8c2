//! Shared types, error model, and configuration for the item relationship engine.
//!
//! This crate is the foundation depended on by all other `irs-*` crates.
//! It provides:
//! - [`IrsError`] — the unified error type
//! - Domain types ([`GlobalAssetId`], [`ShellDescriptor`], [`Tombstone`], [`JobParameter`])
//! - The per-job accumulator ([`ItemContainer`], [`SharedContainer`])
//! - Configuration ([`AppConfig`], [`EngineConfig`], config loading)

pub mod config;
pub mod container;
pub mod error;
pub mod types;

// Re-export public API at crate root for ergonomic imports.
pub use config::{
    AppConfig, ClientProfile, ClientsConfig, DefaultsConfig, EngineConfig, EngineSection,
    RetryPolicy, StorageConfig, config_dir, config_file_path, init_config, load_config, load_config_from,
    validate_config,
};
pub use container::{ContainerSummary, ItemContainer, ItemContainerBuilder, SharedContainer};
pub use error::{IrsError, Result};
pub use types::{
    BatchId, BomLifecycle, Bpn, Direction, GlobalAssetId, JobId, JobParameter, JobState,
    MAX_TREE_DEPTH, MIN_TREE_DEPTH, OrderId, ProcessStep, ProcessingError, Quantity,
    RelationshipEdge, ShellDescriptor, Submodel, SubmodelDescriptor, Tombstone, aspect_name,
};
