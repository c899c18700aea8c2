//! Collaborator contracts consumed by the crawl engine, with live and stub
//! implementations.
//!
//! The engine only sees the traits in this crate. Which implementation backs
//! them is decided once at process start by [`Collaborators::from_config`]:
//! - [`live`] — HTTP clients for the twin registry, submodel endpoints,
//!   semantics hub, BPDM, and callback delivery
//! - [`stub`] — in-memory registry, schema, and notifier doubles
//! - [`validation`] — JSON schema validation of aspect payloads

pub mod live;
pub mod stub;
pub mod validation;

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use irs_shared::{
    BatchId, ClientProfile, ClientsConfig, Direction, GlobalAssetId, JobId, OrderId, RelationshipEdge, Result,
    ShellDescriptor,
};

pub use live::{
    BpdmClient, HttpCallbackNotifier, HttpRegistryClient, HttpSubmodelClient, SemanticsHubClient,
};
pub use stub::{
    DEMO_ROOT, InMemoryRegistry, LoggingNotifier, RecordingNotifier, StubSchemaClient, demo_registry,
};
pub use validation::JsonSchemaValidator;

/// Well-known aspect semantic ids.
pub mod aspects {
    pub const SINGLE_LEVEL_BOM_AS_BUILT: &str =
        "urn:samm:io.catenax.single_level_bom_as_built:3.0.0#SingleLevelBomAsBuilt";
    pub const SINGLE_LEVEL_BOM_AS_PLANNED: &str =
        "urn:samm:io.catenax.single_level_bom_as_planned:3.0.0#SingleLevelBomAsPlanned";
    pub const SINGLE_LEVEL_USAGE_AS_BUILT: &str =
        "urn:samm:io.catenax.single_level_usage_as_built:3.0.0#SingleLevelUsageAsBuilt";
    pub const SERIAL_PART: &str = "urn:samm:io.catenax.serial_part:3.0.0#SerialPart";
}

// ---------------------------------------------------------------------------
// Traits
// ---------------------------------------------------------------------------

/// Resolves shell descriptors. Unknown ids yield `IrsError::NotFound`.
#[async_trait]
pub trait RegistryClient: Send + Sync {
    async fn get_shell(&self, id: &GlobalAssetId) -> Result<ShellDescriptor>;
}

/// Fetches raw aspect payloads from a submodel endpoint.
#[async_trait]
pub trait SubmodelClient: Send + Sync {
    async fn fetch(&self, endpoint: &str) -> Result<Vec<u8>>;
}

/// Resolves the JSON schema of a semantic model URN.
#[async_trait]
pub trait SchemaClient: Send + Sync {
    async fn get_schema(&self, urn: &str) -> Result<Value>;
}

/// Validates a payload against a JSON schema.
pub trait ValidationService: Send + Sync {
    fn validate(&self, payload: &Value, schema: &Value) -> Result<()>;
}

/// Resolves a manufacturer id to its business-partner name.
#[async_trait]
pub trait BusinessPartnerClient: Send + Sync {
    async fn lookup(&self, manufacturer_id: &str) -> Result<String>;
}

/// Optional cache of relationship edges already known from earlier jobs.
///
/// Purely a hint: the crawler never relies on it for correctness.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Edges reachable from `root` within `max_depth` levels, following
    /// child links for [`Direction::Downward`] and parent links for
    /// [`Direction::Upward`].
    async fn known_subtree(
        &self,
        root: &GlobalAssetId,
        max_depth: u32,
        direction: Direction,
    ) -> Result<Vec<RelationshipEdge>>;

    /// Remember edges discovered by a finished job.
    async fn record_edges(&self, edges: &[RelationshipEdge]) -> Result<()>;
}

/// Delivers terminal-state notifications. Fire-and-forget from the engine's side.
#[async_trait]
pub trait CallbackNotifier: Send + Sync {
    async fn notify(&self, event: &CallbackEvent) -> Result<()>;
}

/// A store that knows nothing.
pub struct NoopJobStore;

#[async_trait]
impl JobStore for NoopJobStore {
    async fn known_subtree(
        &self,
        _root: &GlobalAssetId,
        _max_depth: u32,
        _direction: Direction,
    ) -> Result<Vec<RelationshipEdge>> {
        Ok(Vec::new())
    }

    async fn record_edges(&self, _edges: &[RelationshipEdge]) -> Result<()> {
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Callback events
// ---------------------------------------------------------------------------

/// What a callback reports on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallbackSubject {
    Job(JobId),
    Order(OrderId),
    Batch { order_id: OrderId, batch_id: BatchId },
}

/// One terminal-state notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallbackEvent {
    /// Callback URL template as submitted.
    pub url: String,
    pub subject: CallbackSubject,
    /// Terminal state name, e.g. `COMPLETED`.
    pub state: String,
}

impl CallbackEvent {
    /// The URL with `{jobId}`, `{jobState}`, `{orderId}`, `{orderState}`,
    /// `{batchId}` and `{batchState}` placeholders filled in.
    pub fn resolved_url(&self) -> String {
        let mut url = self.url.clone();
        match &self.subject {
            CallbackSubject::Job(job_id) => {
                url = url
                    .replace("{jobId}", &job_id.to_string())
                    .replace("{jobState}", &self.state);
            }
            CallbackSubject::Order(order_id) => {
                url = url
                    .replace("{orderId}", &order_id.to_string())
                    .replace("{orderState}", &self.state);
            }
            CallbackSubject::Batch { order_id, batch_id } => {
                url = url
                    .replace("{orderId}", &order_id.to_string())
                    .replace("{batchId}", &batch_id.to_string())
                    .replace("{batchState}", &self.state);
            }
        }
        url
    }
}

// ---------------------------------------------------------------------------
// Collaborators bundle
// ---------------------------------------------------------------------------

/// Every collaborator the engine talks to.
#[derive(Clone)]
pub struct Collaborators {
    pub registry: Arc<dyn RegistryClient>,
    pub submodels: Arc<dyn SubmodelClient>,
    pub schemas: Arc<dyn SchemaClient>,
    pub validator: Arc<dyn ValidationService>,
    pub business_partners: Arc<dyn BusinessPartnerClient>,
    pub notifier: Arc<dyn CallbackNotifier>,
}

impl Collaborators {
    /// Wire the implementations selected by the configured profile.
    pub fn from_config(config: &ClientsConfig) -> Result<Self> {
        match config.profile {
            ClientProfile::Stub => {
                tracing::info!("using stub collaborators");
                Ok(Self::stub(stub::demo_registry(), LoggingNotifier))
            }
            ClientProfile::Live => {
                tracing::info!(
                    registry = %config.registry_url,
                    semantics_hub = %config.semantics_hub_url,
                    "using live collaborators"
                );
                let client = live::build_client(config.request_timeout_secs)?;
                Ok(Self {
                    registry: Arc::new(HttpRegistryClient::new(client.clone(), &config.registry_url)),
                    submodels: Arc::new(HttpSubmodelClient::new(client.clone())),
                    schemas: Arc::new(SemanticsHubClient::new(
                        client.clone(),
                        &config.semantics_hub_url,
                    )),
                    validator: Arc::new(JsonSchemaValidator),
                    business_partners: Arc::new(BpdmClient::new(client.clone(), &config.bpdm_url)),
                    notifier: Arc::new(HttpCallbackNotifier::new(client)),
                })
            }
        }
    }

    /// Stub wiring around the given in-memory registry and notifier.
    pub fn stub(registry: InMemoryRegistry, notifier: impl CallbackNotifier + 'static) -> Self {
        let registry = Arc::new(registry);
        Self {
            registry: registry.clone(),
            submodels: registry.clone(),
            schemas: Arc::new(StubSchemaClient::new()),
            validator: Arc::new(JsonSchemaValidator),
            business_partners: registry,
            notifier: Arc::new(notifier),
        }
    }

    /// Replace the schema client (e.g. to inject schema failures).
    pub fn with_schemas(mut self, schemas: impl SchemaClient + 'static) -> Self {
        self.schemas = Arc::new(schemas);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn job_callback_placeholders() {
        let job_id = JobId::new();
        let event = CallbackEvent {
            url: "https://hostname.com/callback?jobId={jobId}&jobState={jobState}".into(),
            subject: CallbackSubject::Job(job_id.clone()),
            state: "COMPLETED".into(),
        };
        assert_eq!(
            event.resolved_url(),
            format!("https://hostname.com/callback?jobId={job_id}&jobState=COMPLETED")
        );
    }

    #[test]
    fn batch_callback_placeholders() {
        let order_id = OrderId::new();
        let batch_id = BatchId::new();
        let event = CallbackEvent {
            url: "https://h/cb/{orderId}/{batchId}?state={batchState}".into(),
            subject: CallbackSubject::Batch {
                order_id: order_id.clone(),
                batch_id: batch_id.clone(),
            },
            state: "PARTIAL".into(),
        };
        assert_eq!(
            event.resolved_url(),
            format!("https://h/cb/{order_id}/{batch_id}?state=PARTIAL")
        );
    }

    #[tokio::test]
    async fn noop_store_is_empty() {
        let root = GlobalAssetId::parse("urn:uuid:6c311d29-5753-46d4-b32c-19b918ea93b0").unwrap();
        let edges = NoopJobStore.known_subtree(&root, 3, Direction::Downward).await.unwrap();
        assert!(edges.is_empty());
    }

    #[tokio::test]
    async fn stub_profile_notifier_keeps_no_events() {
        // Stateless, so a long-running process cannot accumulate events.
        assert_eq!(std::mem::size_of::<LoggingNotifier>(), 0);

        let collaborators = Collaborators::from_config(&ClientsConfig::default()).unwrap();
        for n in 0..3 {
            let event = CallbackEvent {
                url: format!("https://hostname.com/callback/{n}?jobId={{jobId}}"),
                subject: CallbackSubject::Job(JobId::new()),
                state: "COMPLETED".into(),
            };
            assert!(collaborators.notifier.notify(&event).await.is_ok());
        }
    }
}
