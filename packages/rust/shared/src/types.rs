//! Core domain types for the item relationship engine.

use std::collections::BTreeSet;
use std::sync::LazyLock;

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{IrsError, Result};

/// Minimum traversal depth of a job.
pub const MIN_TREE_DEPTH: u32 = 1;
/// Maximum traversal depth of a job, also the default when none is requested.
pub const MAX_TREE_DEPTH: u32 = 100;

const GLOBAL_ASSET_ID_PATTERN: &str =
    "^urn:uuid:[0-9a-fA-F]{8}-[0-9a-fA-F]{4}-[0-9a-fA-F]{4}-[0-9a-fA-F]{4}-[0-9a-fA-F]{12}$";

static GLOBAL_ASSET_ID_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(GLOBAL_ASSET_ID_PATTERN).expect("static pattern compiles"));

// ---------------------------------------------------------------------------
// Identifiers
// ---------------------------------------------------------------------------

/// Opaque identifier of a physical part, `urn:uuid:<uuid>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct GlobalAssetId(String);

impl GlobalAssetId {
    /// Parse and validate a global asset id.
    pub fn parse(value: impl Into<String>) -> Result<Self> {
        let value = value.into();
        if GLOBAL_ASSET_ID_REGEX.is_match(&value) {
            Ok(Self(value))
        } else {
            Err(IrsError::configuration(format!(
                "'{value}' is not a valid global asset id (expected urn:uuid:<uuid>)"
            )))
        }
    }

    /// Wrap an id as received from a collaborator payload, without validation.
    ///
    /// Ids discovered during traversal are used as lookup keys only; a malformed
    /// one simply fails its shell lookup and becomes a tombstone.
    pub fn from_payload(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for GlobalAssetId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::str::FromStr for GlobalAssetId {
    type Err = IrsError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Self::parse(s)
    }
}

/// Declares a time-sortable UUID v7 identifier newtype.
macro_rules! uuid_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub Uuid);

        impl $name {
            pub fn new() -> Self {
                Self(Uuid::now_v7())
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl std::str::FromStr for $name {
            type Err = uuid::Error;

            fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
                Ok(Self(Uuid::parse_str(s)?))
            }
        }
    };
}

uuid_id!(
    /// Identifier of a single crawl job.
    JobId
);
uuid_id!(
    /// Identifier of a batch order.
    OrderId
);
uuid_id!(
    /// Identifier of one batch inside a batch order.
    BatchId
);

// ---------------------------------------------------------------------------
// Shell & submodel descriptors
// ---------------------------------------------------------------------------

/// Digital-twin descriptor of one asset. Immutable once fetched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ShellDescriptor {
    pub global_asset_id: GlobalAssetId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id_short: Option<String>,
    /// Manufacturer id used for the business-partner lookup.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub manufacturer_id: Option<String>,
    #[serde(default)]
    pub submodel_descriptors: Vec<SubmodelDescriptor>,
}

/// One data aspect of a shell: semantic model URN plus access endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmodelDescriptor {
    pub semantic_id: String,
    pub endpoint: String,
}

impl SubmodelDescriptor {
    pub fn new(semantic_id: impl Into<String>, endpoint: impl Into<String>) -> Self {
        Self {
            semantic_id: semantic_id.into(),
            endpoint: endpoint.into(),
        }
    }

    /// Short aspect name, e.g. `SerialPart` for
    /// `urn:samm:io.catenax.serial_part:1.0.0#SerialPart`.
    pub fn aspect_name(&self) -> &str {
        aspect_name(&self.semantic_id)
    }
}

/// Extract the aspect name (fragment after `#`) from a semantic model URN.
pub fn aspect_name(semantic_id: &str) -> &str {
    semantic_id
        .rsplit_once('#')
        .map(|(_, name)| name)
        .unwrap_or(semantic_id)
}

// ---------------------------------------------------------------------------
// Relationships
// ---------------------------------------------------------------------------

/// Quantity attached to a relationship edge.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Quantity {
    pub quantity_number: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub measurement_unit: Option<String>,
}

/// Directed parent → child edge discovered in a relationship aspect.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RelationshipEdge {
    pub parent_id: GlobalAssetId,
    pub child_id: GlobalAssetId,
    /// Aspect the edge was read from.
    pub aspect_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lifecycle_context: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quantity: Option<Quantity>,
}

impl RelationshipEdge {
    pub fn new(parent_id: GlobalAssetId, child_id: GlobalAssetId, aspect_type: impl Into<String>) -> Self {
        Self {
            parent_id,
            child_id,
            aspect_type: aspect_type.into(),
            lifecycle_context: None,
            quantity: None,
        }
    }

    /// Uniqueness key of the edge.
    pub fn key(&self) -> (GlobalAssetId, GlobalAssetId) {
        (self.parent_id.clone(), self.child_id.clone())
    }

    /// The node a traversal in `direction` continues with.
    pub fn next_hop(&self, direction: Direction) -> &GlobalAssetId {
        match direction {
            Direction::Downward => &self.child_id,
            Direction::Upward => &self.parent_id,
        }
    }
}

/// A fetched and validated aspect payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Submodel {
    #[serde(rename = "catenaXId")]
    pub catenax_id: GlobalAssetId,
    pub semantic_id: String,
    pub aspect_type: String,
    pub payload: serde_json::Value,
}

/// Resolved business-partner number for a manufacturer.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Bpn {
    pub manufacturer_id: String,
    pub manufacturer_name: String,
}

// ---------------------------------------------------------------------------
// Tombstones
// ---------------------------------------------------------------------------

/// Chain stage a tombstone was recorded in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProcessStep {
    ShellRequest,
    SchemaRequest,
    SchemaValidation,
    SubmodelRequest,
    BpnRequest,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessingError {
    pub process_step: ProcessStep,
    pub message: String,
    pub last_attempt: DateTime<Utc>,
    pub retry_count: u32,
}

/// Record of one failed traversal step. Never mutated after creation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Tombstone {
    #[serde(rename = "catenaXId")]
    pub catenax_id: GlobalAssetId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoint_url: Option<String>,
    pub processing_error: ProcessingError,
}

impl Tombstone {
    pub fn new(
        catenax_id: GlobalAssetId,
        endpoint_url: Option<String>,
        process_step: ProcessStep,
        message: impl Into<String>,
    ) -> Self {
        Self {
            catenax_id,
            endpoint_url,
            processing_error: ProcessingError {
                process_step,
                message: message.into(),
                last_attempt: Utc::now(),
                retry_count: 0,
            },
        }
    }

    /// Record how many retries preceded the final failure.
    pub fn with_retry_count(mut self, retries: u32) -> Self {
        self.processing_error.retry_count = retries;
        self
    }

    pub fn process_step(&self) -> ProcessStep {
        self.processing_error.process_step
    }
}

// ---------------------------------------------------------------------------
// Job parameters
// ---------------------------------------------------------------------------

/// Traversal direction through the relationship graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    Upward,
    #[default]
    Downward,
}

/// Lifecycle view of the bill of materials.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BomLifecycle {
    #[default]
    AsBuilt,
    AsPlanned,
}

/// Immutable parameter set of one job, validated at job creation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobParameter {
    pub depth: u32,
    pub direction: Direction,
    pub bom_lifecycle: BomLifecycle,
    /// Aspect filter; empty means every aspect.
    #[serde(default)]
    pub aspects: BTreeSet<String>,
    #[serde(default)]
    pub collect_aspects: bool,
    #[serde(default)]
    pub lookup_bpns: bool,
}

impl Default for JobParameter {
    fn default() -> Self {
        Self {
            depth: MAX_TREE_DEPTH,
            direction: Direction::default(),
            bom_lifecycle: BomLifecycle::default(),
            aspects: BTreeSet::new(),
            collect_aspects: false,
            lookup_bpns: false,
        }
    }
}

impl JobParameter {
    /// Reject parameters outside the accepted ranges.
    pub fn validate(&self) -> Result<()> {
        if !(MIN_TREE_DEPTH..=MAX_TREE_DEPTH).contains(&self.depth) {
            return Err(IrsError::configuration(format!(
                "depth {} out of range [{MIN_TREE_DEPTH}, {MAX_TREE_DEPTH}]",
                self.depth
            )));
        }
        Ok(())
    }

    /// Aspect names whose payload carries the edges followed by this job.
    pub fn traversal_aspects(&self) -> &'static [&'static str] {
        match (self.direction, self.bom_lifecycle) {
            (Direction::Downward, BomLifecycle::AsBuilt) => {
                &["SingleLevelBomAsBuilt", "AssemblyPartRelationship"]
            }
            (Direction::Downward, BomLifecycle::AsPlanned) => &["SingleLevelBomAsPlanned"],
            (Direction::Upward, BomLifecycle::AsBuilt) => &["SingleLevelUsageAsBuilt"],
            (Direction::Upward, BomLifecycle::AsPlanned) => &["SingleLevelUsageAsPlanned"],
        }
    }

    pub fn is_traversal_aspect(&self, semantic_id: &str) -> bool {
        self.traversal_aspects().contains(&aspect_name(semantic_id))
    }

    /// Whether a non-traversal aspect should be collected.
    pub fn wants_aspect(&self, semantic_id: &str) -> bool {
        self.collect_aspects
            && (self.aspects.is_empty()
                || self.aspects.contains(semantic_id)
                || self.aspects.contains(aspect_name(semantic_id)))
    }
}

// ---------------------------------------------------------------------------
// Job state
// ---------------------------------------------------------------------------

/// Lifecycle state of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobState {
    Created,
    Running,
    Completed,
    Error,
    Cancelled,
}

impl JobState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Error | Self::Cancelled)
    }

    /// Whether the state machine allows `self -> next`.
    pub fn can_transition_to(self, next: JobState) -> bool {
        matches!(
            (self, next),
            (Self::Created, Self::Running)
                | (Self::Created, Self::Cancelled)
                | (Self::Created, Self::Error)
                | (Self::Running, Self::Completed)
                | (Self::Running, Self::Error)
                | (Self::Running, Self::Cancelled)
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Created => "CREATED",
            Self::Running => "RUNNING",
            Self::Completed => "COMPLETED",
            Self::Error => "ERROR",
            Self::Cancelled => "CANCELLED",
        }
    }
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
