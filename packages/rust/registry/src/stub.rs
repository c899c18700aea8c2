//! In-memory collaborator doubles.
//!
//! Used by the `stub` client profile and throughout the engine tests. The
//! registry builder lays out a part tree the way a twin registry would: one
//! shell per part, one relationship aspect per shell, payloads keyed by
//! endpoint.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Value, json};
use tracing::info;

use irs_shared::{GlobalAssetId, IrsError, Result, ShellDescriptor, SubmodelDescriptor, aspect_name};

use crate::aspects::{SERIAL_PART, SINGLE_LEVEL_BOM_AS_BUILT, SINGLE_LEVEL_USAGE_AS_BUILT};
use crate::{BusinessPartnerClient, CallbackEvent, CallbackNotifier, RegistryClient, SchemaClient, SubmodelClient};

/// Root of the tree served by [`demo_registry`].
pub const DEMO_ROOT: &str = "urn:uuid:6c311d29-5753-46d4-b32c-19b918ea93b0";

// ---------------------------------------------------------------------------
// InMemoryRegistry
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
struct RegistryState {
    shells: HashMap<String, ShellDescriptor>,
    payloads: HashMap<String, Vec<u8>>,
    failing_shells: HashSet<String>,
    failing_endpoints: HashSet<String>,
    bpns: HashMap<String, String>,
    latency: Option<Duration>,
    shell_lookups: HashMap<String, usize>,
}

/// Twin registry, submodel server, and BPDM in one map.
///
/// Cloning shares state, so a test can keep a handle for inspecting lookup
/// counts after handing the registry to the engine.
#[derive(Debug, Clone, Default)]
pub struct InMemoryRegistry {
    state: Arc<RwLock<RegistryState>>,
}

fn stub_endpoint(id: &str, semantic_id: &str) -> String {
    format!("stub://{id}/{}", aspect_name(semantic_id))
}

fn child_item(id: &str, lifecycle: &str) -> Value {
    json!({
        "catenaXId": id,
        "quantity": { "quantityNumber": 1.0, "measurementUnit": "unit:piece" },
        "lifecycleContext": lifecycle,
        "businessPartner": "BPNL00000003AYRE",
    })
}

impl InMemoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, RegistryState> {
        self.state.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, RegistryState> {
        self.state.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Register a shell without aspects.
    pub fn with_shell(self, id: &str) -> Self {
        self.write()
            .shells
            .entry(id.to_string())
            .or_insert_with(|| ShellDescriptor {
                global_asset_id: GlobalAssetId::from_payload(id),
                id_short: None,
                manufacturer_id: None,
                submodel_descriptors: Vec::new(),
            });
        self
    }

    /// Attach an aspect with the given payload to a shell, creating the shell if needed.
    pub fn with_aspect(self, id: &str, semantic_id: &str, payload: Value) -> Self {
        let endpoint = stub_endpoint(id, semantic_id);
        let registry = self.with_shell(id);
        {
            let mut state = registry.write();
            if let Some(shell) = state.shells.get_mut(id) {
                shell
                    .submodel_descriptors
                    .push(SubmodelDescriptor::new(semantic_id, endpoint.clone()));
            }
            state.payloads.insert(endpoint, payload.to_string().into_bytes());
        }
        registry
    }

    /// Register a part with an as-built BOM listing `children`.
    pub fn with_part(self, id: &str, children: &[&str]) -> Self {
        let items: Vec<Value> = children.iter().map(|c| child_item(c, "asBuilt")).collect();
        self.with_aspect(
            id,
            SINGLE_LEVEL_BOM_AS_BUILT,
            json!({ "catenaXId": id, "childItems": items }),
        )
    }

    /// Register a part with an as-built usage aspect listing `parents`.
    pub fn with_part_usage(self, id: &str, parents: &[&str]) -> Self {
        let items: Vec<Value> = parents.iter().map(|p| child_item(p, "asBuilt")).collect();
        self.with_aspect(
            id,
            SINGLE_LEVEL_USAGE_AS_BUILT,
            json!({ "catenaXId": id, "parentItems": items }),
        )
    }

    /// Overwrite the raw bytes served at an endpoint.
    pub fn with_payload(self, endpoint: &str, body: impl Into<Vec<u8>>) -> Self {
        self.write().payloads.insert(endpoint.to_string(), body.into());
        self
    }

    /// Make the shell lookup of `id` fail with a transport error.
    pub fn fail_shell(self, id: &str) -> Self {
        self.write().failing_shells.insert(id.to_string());
        self
    }

    /// Make fetches from `endpoint` fail with a transport error.
    pub fn fail_endpoint(self, endpoint: &str) -> Self {
        self.write().failing_endpoints.insert(endpoint.to_string());
        self
    }

    /// Delay every call by `latency`.
    pub fn with_latency(self, latency: Duration) -> Self {
        self.write().latency = Some(latency);
        self
    }

    /// Set the manufacturer of a shell.
    pub fn with_manufacturer(self, id: &str, manufacturer_id: &str) -> Self {
        let registry = self.with_shell(id);
        if let Some(shell) = registry.write().shells.get_mut(id) {
            shell.manufacturer_id = Some(manufacturer_id.to_string());
        }
        registry
    }

    /// Register the business-partner name of a manufacturer.
    pub fn with_bpn(self, manufacturer_id: &str, name: &str) -> Self {
        self.write()
            .bpns
            .insert(manufacturer_id.to_string(), name.to_string());
        self
    }

    /// Endpoint the stub serves `semantic_id` of `id` from.
    pub fn endpoint_of(id: &str, semantic_id: &str) -> String {
        stub_endpoint(id, semantic_id)
    }

    /// How often the shell of `id` was requested.
    pub fn shell_lookups(&self, id: &str) -> usize {
        self.read().shell_lookups.get(id).copied().unwrap_or(0)
    }

    async fn delay(&self) {
        let latency = self.read().latency;
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
    }
}

#[async_trait]
impl RegistryClient for InMemoryRegistry {
    async fn get_shell(&self, id: &GlobalAssetId) -> Result<ShellDescriptor> {
        self.delay().await;
        let mut state = self.write();
        *state.shell_lookups.entry(id.to_string()).or_default() += 1;

        if state.failing_shells.contains(id.as_str()) {
            return Err(IrsError::Transport(format!("registry unavailable for {id}")));
        }
        state
            .shells
            .get(id.as_str())
            .cloned()
            .ok_or_else(|| IrsError::NotFound(format!("shell {id}")))
    }
}

#[async_trait]
impl SubmodelClient for InMemoryRegistry {
    async fn fetch(&self, endpoint: &str) -> Result<Vec<u8>> {
        self.delay().await;
        let state = self.read();
        if state.failing_endpoints.contains(endpoint) {
            return Err(IrsError::Transport(format!("{endpoint}: connection refused")));
        }
        state
            .payloads
            .get(endpoint)
            .cloned()
            .ok_or_else(|| IrsError::NotFound(endpoint.to_string()))
    }
}

#[async_trait]
impl BusinessPartnerClient for InMemoryRegistry {
    async fn lookup(&self, manufacturer_id: &str) -> Result<String> {
        self.delay().await;
        self.read()
            .bpns
            .get(manufacturer_id)
            .cloned()
            .ok_or_else(|| IrsError::NotFound(format!("business partner {manufacturer_id}")))
    }
}

/// A small vehicle tree for trying the engine without any services.
///
/// ```text
/// vehicle ─┬─ gearbox ─┬─ shaft
///          │           └─ housing
///          └─ battery ─── cell
/// ```
pub fn demo_registry() -> InMemoryRegistry {
    const GEARBOX: &str = "urn:uuid:a4a26b9c-9460-4cc5-8645-85916b86adb0";
    const BATTERY: &str = "urn:uuid:3b2f6e2c-7a0d-4a37-a7a4-5d1d2c9a4f10";
    const SHAFT: &str = "urn:uuid:0733946c-59c6-41ae-9570-cb43a6e4c79e";
    const HOUSING: &str = "urn:uuid:4f6b5f2a-3c1e-4b8e-9d0a-1e2f3a4b5c6d";
    const CELL: &str = "urn:uuid:9e8d7c6b-5a49-4382-9170-6f5e4d3c2b1a";

    let mut registry = InMemoryRegistry::new()
        .with_part(DEMO_ROOT, &[GEARBOX, BATTERY])
        .with_part(GEARBOX, &[SHAFT, HOUSING])
        .with_part(BATTERY, &[CELL])
        .with_bpn("BPNL00000003AYRE", "Tier A Gearbox GmbH")
        .with_bpn("BPNL00000003B0Q0", "Tier B Cells AG");

    for leaf in [SHAFT, HOUSING, CELL] {
        registry = registry.with_part(leaf, &[]);
    }
    for (id, manufacturer) in [
        (DEMO_ROOT, "BPNL00000003AYRE"),
        (GEARBOX, "BPNL00000003AYRE"),
        (BATTERY, "BPNL00000003B0Q0"),
        (CELL, "BPNL00000003B0Q0"),
    ] {
        registry = registry.with_manufacturer(id, manufacturer).with_aspect(
            id,
            SERIAL_PART,
            json!({
                "catenaXId": id,
                "localIdentifiers": [{ "key": "manufacturerId", "value": manufacturer }],
            }),
        );
    }
    registry
}

// ---------------------------------------------------------------------------
// StubSchemaClient
// ---------------------------------------------------------------------------

/// Schema source that accepts any object unless told otherwise.
#[derive(Debug, Default)]
pub struct StubSchemaClient {
    schemas: HashMap<String, Value>,
    failing: HashSet<String>,
}

impl StubSchemaClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// Serve `schema` for `urn`.
    pub fn with_schema(mut self, urn: &str, schema: Value) -> Self {
        self.schemas.insert(urn.to_string(), schema);
        self
    }

    /// Make lookups of `urn` fail.
    pub fn fail(mut self, urn: &str) -> Self {
        self.failing.insert(urn.to_string());
        self
    }
}

#[async_trait]
impl SchemaClient for StubSchemaClient {
    async fn get_schema(&self, urn: &str) -> Result<Value> {
        if self.failing.contains(urn) {
            return Err(IrsError::Transport(format!("semantics hub unavailable for {urn}")));
        }
        Ok(self.schemas.get(urn).cloned().unwrap_or_else(|| {
            json!({
                "$schema": "http://json-schema.org/draft-07/schema#",
                "type": "object",
            })
        }))
    }
}

// ---------------------------------------------------------------------------
// Notifiers
// ---------------------------------------------------------------------------

/// Notifier that only logs. Used by the stub profile at runtime, where
/// nothing reads the events back.
#[derive(Debug, Clone, Copy, Default)]
pub struct LoggingNotifier;

#[async_trait]
impl CallbackNotifier for LoggingNotifier {
    async fn notify(&self, event: &CallbackEvent) -> Result<()> {
        info!(url = %event.resolved_url(), state = %event.state, "callback (not delivered)");
        Ok(())
    }
}

/// Notifier that logs and remembers every event.
#[derive(Debug, Clone, Default)]
pub struct RecordingNotifier {
    events: Arc<Mutex<Vec<CallbackEvent>>>,
}

impl RecordingNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Events delivered so far, in order.
    pub fn events(&self) -> Vec<CallbackEvent> {
        self.events
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }
}

#[async_trait]
impl CallbackNotifier for RecordingNotifier {
    async fn notify(&self, event: &CallbackEvent) -> Result<()> {
        info!(url = %event.resolved_url(), state = %event.state, "callback");
        self.events
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(event.clone());
        Ok(())
    }
}
