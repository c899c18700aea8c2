//! Per-node enrichment chain.
//!
//! Every visited node runs the same fixed list of stages. A stage records its
//! own failures as tombstones and either lets the chain continue or stops it
//! for this node; only a failed shell lookup stops it. Results are merged into
//! the job container per descriptor, so a job interrupted mid-node keeps what
//! already finished. Collaborator calls that fail in transport are retried
//! with backoff before they become tombstones.

use std::future::Future;

use serde_json::Value;
use tracing::{debug, warn};

use irs_registry::Collaborators;
use irs_shared::{
    Bpn, GlobalAssetId, ItemContainer, JobParameter, ProcessStep, Result, RetryPolicy,
    SharedContainer, ShellDescriptor, Submodel, SubmodelDescriptor, Tombstone,
};

use crate::relationships::parse_edges;

/// Stages in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stage {
    Shell,
    FilterSubmodels,
    Submodels,
    BusinessPartners,
}

const STAGES: [Stage; 4] = [
    Stage::Shell,
    Stage::FilterSubmodels,
    Stage::Submodels,
    Stage::BusinessPartners,
];

enum Flow {
    Continue,
    Stop,
}

/// Why a descriptor was selected for fetching.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Usage {
    /// Relationship aspect followed to the next level.
    Traverse,
    /// Plain aspect stored in the container.
    Collect,
}

/// What one node contributed beyond its container writes.
#[derive(Debug, Default)]
pub struct NodeReport {
    /// Ids to visit on the next level, in payload order.
    pub next_hops: Vec<GlobalAssetId>,
    /// Set when the shell lookup failed.
    pub shell_failure: Option<String>,
}

/// A failed descriptor step.
struct StepFailure {
    step: ProcessStep,
    message: String,
    retries: u32,
}

impl StepFailure {
    fn new(step: ProcessStep, message: impl Into<String>) -> Self {
        Self {
            step,
            message: message.into(),
            retries: 0,
        }
    }
}

struct NodeContext<'a> {
    id: &'a GlobalAssetId,
    level: u32,
    parameter: &'a JobParameter,
    container: &'a SharedContainer,
    shell: Option<ShellDescriptor>,
    selected: Vec<(SubmodelDescriptor, Usage)>,
    report: NodeReport,
}

impl NodeContext<'_> {
    fn tombstone(&self, endpoint: Option<&str>, step: ProcessStep, message: String, retries: u32) {
        warn!(id = %self.id, ?step, endpoint, retries, reason = %message, "tombstone");
        let tombstone = Tombstone::new(self.id.clone(), endpoint.map(str::to_string), step, message)
            .with_retry_count(retries);
        self.container
            .merge(ItemContainer::builder().tombstone(tombstone).build());
    }
}

/// Runs the stages for one node against the job's collaborators.
pub struct EnrichmentChain {
    collaborators: Collaborators,
    retry: RetryPolicy,
}

impl EnrichmentChain {
    /// Chain without retries.
    pub fn new(collaborators: Collaborators) -> Self {
        Self {
            collaborators,
            retry: RetryPolicy::NONE,
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn collaborators(&self) -> &Collaborators {
        &self.collaborators
    }

    /// Run `call` until it succeeds, fails for good, or the retry budget is
    /// spent. Returns the last outcome and the number of retries made.
    async fn retrying<T, F, Fut>(&self, what: &str, mut call: F) -> (Result<T>, u32)
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut retries = 0;
        loop {
            match call().await {
                Err(e) if e.is_transient() && retries < self.retry.max_retries => {
                    let delay = self.retry.delay(retries);
                    debug!(what, retries, ?delay, error = %e, "retrying");
                    tokio::time::sleep(delay).await;
                    retries += 1;
                }
                outcome => return (outcome, retries),
            }
        }
    }

    /// Enrich `id`, found at crawl `level`, writing into `container`.
    pub async fn process(
        &self,
        container: &SharedContainer,
        parameter: &JobParameter,
        id: &GlobalAssetId,
        level: u32,
    ) -> NodeReport {
        let mut ctx = NodeContext {
            id,
            level,
            parameter,
            container,
            shell: None,
            selected: Vec::new(),
            report: NodeReport::default(),
        };

        for stage in STAGES {
            let flow = match stage {
                Stage::Shell => self.shell(&mut ctx).await,
                Stage::FilterSubmodels => filter_submodels(&mut ctx),
                Stage::Submodels => self.submodels(&mut ctx).await,
                Stage::BusinessPartners => self.business_partners(&mut ctx).await,
            };
            if let Flow::Stop = flow {
                debug!(%id, ?stage, "chain stopped");
                break;
            }
        }
        ctx.report
    }

    async fn shell(&self, ctx: &mut NodeContext<'_>) -> Flow {
        let id = ctx.id;
        let (outcome, retries) = self
            .retrying("shell", || self.collaborators.registry.get_shell(id))
            .await;
        match outcome {
            Ok(shell) => {
                ctx.container
                    .merge(ItemContainer::builder().shell(shell.clone()).build());
                ctx.shell = Some(shell);
                Flow::Continue
            }
            Err(e) => {
                let message = e.to_string();
                ctx.tombstone(None, ProcessStep::ShellRequest, message.clone(), retries);
                ctx.report.shell_failure = Some(message);
                Flow::Stop
            }
        }
    }

    async fn submodels(&self, ctx: &mut NodeContext<'_>) -> Flow {
        let selected = std::mem::take(&mut ctx.selected);
        for (descriptor, usage) in selected {
            if let Err(failure) = self.submodel(ctx, &descriptor, usage).await {
                ctx.tombstone(
                    Some(&descriptor.endpoint),
                    failure.step,
                    failure.message,
                    failure.retries,
                );
            }
        }
        Flow::Continue
    }

    /// Schema, fetch, parse, validate, then store one descriptor.
    async fn submodel(
        &self,
        ctx: &mut NodeContext<'_>,
        descriptor: &SubmodelDescriptor,
        usage: Usage,
    ) -> std::result::Result<(), StepFailure> {
        debug!(id = %ctx.id, aspect = descriptor.aspect_name(), ?usage, "processing descriptor");

        let (schema, retries) = self
            .retrying("schema", || self.collaborators.schemas.get_schema(&descriptor.semantic_id))
            .await;
        let schema = schema.map_err(|e| StepFailure {
            retries,
            ..StepFailure::new(ProcessStep::SchemaRequest, e.to_string())
        })?;

        let (body, retries) = self
            .retrying("submodel", || self.collaborators.submodels.fetch(&descriptor.endpoint))
            .await;
        let body = body.map_err(|e| StepFailure {
            retries,
            ..StepFailure::new(ProcessStep::SubmodelRequest, e.to_string())
        })?;

        let payload: Value = serde_json::from_slice(&body).map_err(|e| {
            StepFailure::new(ProcessStep::SchemaValidation, format!("payload is not valid JSON: {e}"))
        })?;

        self.collaborators
            .validator
            .validate(&payload, &schema)
            .map_err(|e| StepFailure::new(ProcessStep::SchemaValidation, e.to_string()))?;

        let mut delta = ItemContainer::default();
        if usage == Usage::Traverse {
            let edges = parse_edges(ctx.id, descriptor.aspect_name(), &payload)
                .map_err(|e| StepFailure::new(ProcessStep::SchemaValidation, e.to_string()))?;
            for edge in edges {
                ctx.report
                    .next_hops
                    .push(edge.next_hop(ctx.parameter.direction).clone());
                delta.add_edge(edge);
            }
        }
        if ctx.parameter.wants_aspect(&descriptor.semantic_id) {
            delta.add_submodel(Submodel {
                catenax_id: ctx.id.clone(),
                semantic_id: descriptor.semantic_id.clone(),
                aspect_type: descriptor.aspect_name().to_string(),
                payload,
            });
        }
        ctx.container.merge(delta);
        Ok(())
    }

    async fn business_partners(&self, ctx: &mut NodeContext<'_>) -> Flow {
        if !ctx.parameter.lookup_bpns {
            return Flow::Continue;
        }
        let Some(manufacturer_id) = ctx.shell.as_ref().and_then(|s| s.manufacturer_id.clone()) else {
            debug!(id = %ctx.id, "shell has no manufacturer id");
            return Flow::Continue;
        };

        let (outcome, retries) = self
            .retrying("bpn", || self.lookup_bpn(&manufacturer_id))
            .await;
        match outcome {
            Ok(bpn) => {
                ctx.container.merge(ItemContainer::builder().bpn(bpn).build());
            }
            Err(e) => ctx.tombstone(None, ProcessStep::BpnRequest, e.to_string(), retries),
        }
        Flow::Continue
    }

    async fn lookup_bpn(&self, manufacturer_id: &str) -> Result<Bpn> {
        let manufacturer_name = self
            .collaborators
            .business_partners
            .lookup(manufacturer_id)
            .await?;
        Ok(Bpn {
            manufacturer_id: manufacturer_id.to_string(),
            manufacturer_name,
        })
    }
}

/// Keep the traversal aspect (below the depth limit) and requested aspects.
fn filter_submodels(ctx: &mut NodeContext<'_>) -> Flow {
    let Some(shell) = &ctx.shell else {
        return Flow::Stop;
    };
    let expand = ctx.level < ctx.parameter.depth;

    ctx.selected = shell
        .submodel_descriptors
        .iter()
        .filter_map(|descriptor| {
            let usage = if expand && ctx.parameter.is_traversal_aspect(&descriptor.semantic_id) {
                Usage::Traverse
            } else if ctx.parameter.wants_aspect(&descriptor.semantic_id) {
                Usage::Collect
            } else {
                debug!(id = %ctx.id, aspect = descriptor.aspect_name(), "aspect not requested");
                return None;
            };
            Some((descriptor.clone(), usage))
        })
        .collect();
    Flow::Continue
}

#[cfg(test)]
mod tests {
    use super::*;
    use irs_registry::aspects::{SERIAL_PART, SINGLE_LEVEL_BOM_AS_BUILT};
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use async_trait::async_trait;
    use irs_registry::{InMemoryRegistry, RecordingNotifier, RegistryClient, StubSchemaClient};
    use irs_shared::IrsError;
    use serde_json::json;

    const A: &str = "urn:uuid:00000000-0000-0000-0000-00000000000a";
    const B: &str = "urn:uuid:00000000-0000-0000-0000-00000000000b";
    const C: &str = "urn:uuid:00000000-0000-0000-0000-00000000000c";

    fn id(s: &str) -> GlobalAssetId {
        GlobalAssetId::from_payload(s)
    }

    fn part_with_serial() -> InMemoryRegistry {
        InMemoryRegistry::new()
            .with_part(A, &[B, C])
            .with_aspect(A, SERIAL_PART, json!({ "catenaXId": A }))
    }

    fn chain(registry: InMemoryRegistry) -> EnrichmentChain {
        EnrichmentChain::new(Collaborators::stub(registry, RecordingNotifier::new()))
    }

    async fn run(chain: &EnrichmentChain, parameter: &JobParameter, level: u32) -> (ItemContainer, NodeReport) {
        let container = SharedContainer::new();
        let report = chain.process(&container, parameter, &id(A), level).await;
        (container.seal(), report)
    }

    #[tokio::test]
    async fn shell_failure_stops_the_chain() {
        let chain = chain(InMemoryRegistry::new().fail_shell(A));
        let (container, report) = run(&chain, &JobParameter::default(), 0).await;

        assert!(report.shell_failure.is_some());
        assert!(report.next_hops.is_empty());
        assert_eq!(container.tombstones_for(&id(A), ProcessStep::ShellRequest).count(), 1);
        assert!(container.relationships().is_empty());
        assert!(container.shells().is_empty());
    }

    #[tokio::test]
    async fn unrequested_aspects_are_not_fetched() {
        let serial_endpoint = InMemoryRegistry::endpoint_of(A, SERIAL_PART);
        let chain = chain(part_with_serial().fail_endpoint(&serial_endpoint));
        let (container, report) = run(&chain, &JobParameter::default(), 0).await;

        assert_eq!(report.next_hops, vec![id(B), id(C)]);
        assert_eq!(container.relationships().len(), 2);
        assert!(container.tombstones().is_empty());
        assert!(container.submodels().is_empty());
    }

    #[tokio::test]
    async fn aspect_filter_selects_by_name() {
        let chain = chain(part_with_serial());
        let parameter = JobParameter {
            collect_aspects: true,
            aspects: ["SerialPart".to_string()].into(),
            ..JobParameter::default()
        };
        let (container, _) = run(&chain, &parameter, 0).await;

        assert_eq!(container.submodels().len(), 1);
        assert_eq!(container.submodels()[0].aspect_type, "SerialPart");
        assert_eq!(container.relationships().len(), 2);
    }

    #[tokio::test]
    async fn schema_failure_is_isolated_to_its_descriptor() {
        let collaborators = Collaborators::stub(part_with_serial(), RecordingNotifier::new())
            .with_schemas(StubSchemaClient::new().fail(SERIAL_PART));
        let chain = EnrichmentChain::new(collaborators);
        let parameter = JobParameter {
            collect_aspects: true,
            ..JobParameter::default()
        };
        let (container, report) = run(&chain, &parameter, 0).await;

        let a = id(A);
        let tombstones: Vec<_> = container
            .tombstones_for(&a, ProcessStep::SchemaRequest)
            .collect();
        assert_eq!(tombstones.len(), 1);
        assert_eq!(
            tombstones[0].endpoint_url.as_deref(),
            Some(InMemoryRegistry::endpoint_of(A, SERIAL_PART).as_str())
        );
        assert_eq!(container.tombstones().len(), 1);

        // the relationship aspect still went through
        assert_eq!(report.next_hops.len(), 2);
        assert_eq!(container.submodels().len(), 1);
        assert_eq!(container.submodels()[0].aspect_type, "SingleLevelBomAsBuilt");
    }

    #[tokio::test]
    async fn fetch_failure_records_submodel_request() {
        let bom_endpoint = InMemoryRegistry::endpoint_of(A, SINGLE_LEVEL_BOM_AS_BUILT);
        let chain = chain(part_with_serial().fail_endpoint(&bom_endpoint));
        let (container, report) = run(&chain, &JobParameter::default(), 0).await;

        assert!(report.next_hops.is_empty());
        assert_eq!(container.tombstones_for(&id(A), ProcessStep::SubmodelRequest).count(), 1);
        assert!(container.relationships().is_empty());
        assert_eq!(container.shells().len(), 1);
    }

    #[tokio::test]
    async fn invalid_payloads_record_schema_validation() {
        let bom_endpoint = InMemoryRegistry::endpoint_of(A, SINGLE_LEVEL_BOM_AS_BUILT);
        let serial_endpoint = InMemoryRegistry::endpoint_of(A, SERIAL_PART);
        let registry = part_with_serial()
            .with_payload(&bom_endpoint, "{ not json")
            .with_payload(&serial_endpoint, json!({ "catenaXId": 42 }).to_string());
        let collaborators = Collaborators::stub(registry, RecordingNotifier::new()).with_schemas(
            StubSchemaClient::new().with_schema(
                SERIAL_PART,
                json!({ "type": "object", "properties": { "catenaXId": { "type": "string" } } }),
            ),
        );
        let chain = EnrichmentChain::new(collaborators);
        let parameter = JobParameter {
            collect_aspects: true,
            ..JobParameter::default()
        };
        let (container, report) = run(&chain, &parameter, 0).await;

        assert!(report.next_hops.is_empty());
        assert_eq!(container.tombstones_for(&id(A), ProcessStep::SchemaValidation).count(), 2);
        assert!(container.submodels().is_empty());
    }

    #[tokio::test]
    async fn relationship_aspect_is_not_expanded_at_depth_limit() {
        let chain = chain(part_with_serial());
        let parameter = JobParameter {
            depth: 1,
            ..JobParameter::default()
        };
        let (container, report) = run(&chain, &parameter, 1).await;

        assert!(report.next_hops.is_empty());
        assert!(container.relationships().is_empty());
        assert_eq!(container.shells().len(), 1);
    }

    #[tokio::test]
    async fn business_partner_lookup() {
        let registry = part_with_serial()
            .with_manufacturer(A, "BPNL00000003AYRE")
            .with_bpn("BPNL00000003AYRE", "Tier A Gearbox GmbH");
        let parameter = JobParameter {
            lookup_bpns: true,
            ..JobParameter::default()
        };
        let (container, _) = run(&chain(registry), &parameter, 0).await;
        assert_eq!(container.bpns()[0].manufacturer_name, "Tier A Gearbox GmbH");

        let unknown = part_with_serial().with_manufacturer(A, "BPNL000000000000");
        let (container, report) = run(&chain(unknown), &parameter, 0).await;
        assert_eq!(container.tombstones_for(&id(A), ProcessStep::BpnRequest).count(), 1);
        // a failed lookup does not cost the node its edges
        assert_eq!(report.next_hops.len(), 2);
    }

    fn retrying_chain(collaborators: Collaborators) -> EnrichmentChain {
        EnrichmentChain::new(collaborators).with_retry(RetryPolicy {
            max_retries: 2,
            backoff: Duration::from_millis(100),
        })
    }

    #[tokio::test(start_paused = true)]
    async fn transport_failures_are_retried_before_the_tombstone() {
        let registry = InMemoryRegistry::new().fail_shell(A);
        let chain = retrying_chain(Collaborators::stub(registry.clone(), RecordingNotifier::new()));

        let started = tokio::time::Instant::now();
        let (container, report) = run(&chain, &JobParameter::default(), 0).await;

        assert!(report.shell_failure.is_some());
        assert_eq!(registry.shell_lookups(A), 3);
        // 100ms then 200ms of backoff
        let waited = started.elapsed();
        assert!(waited >= Duration::from_millis(300) && waited < Duration::from_millis(400));
        let a = id(A);
        let tombstones: Vec<_> = container.tombstones_for(&a, ProcessStep::ShellRequest).collect();
        assert_eq!(tombstones.len(), 1);
        assert_eq!(tombstones[0].processing_error.retry_count, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn unknown_shells_are_not_retried() {
        let registry = InMemoryRegistry::new();
        let chain = retrying_chain(Collaborators::stub(registry.clone(), RecordingNotifier::new()));
        let (container, _) = run(&chain, &JobParameter::default(), 0).await;

        assert_eq!(registry.shell_lookups(A), 1);
        let a = id(A);
        let tombstones: Vec<_> = container.tombstones_for(&a, ProcessStep::ShellRequest).collect();
        assert_eq!(tombstones[0].processing_error.retry_count, 0);
    }

    /// Registry that drops the first `failures` lookups.
    struct Flaky {
        inner: InMemoryRegistry,
        failures: AtomicUsize,
    }

    #[async_trait]
    impl RegistryClient for Flaky {
        async fn get_shell(&self, id: &GlobalAssetId) -> Result<ShellDescriptor> {
            let left = self.failures.load(Ordering::SeqCst);
            if left > 0 {
                self.failures.store(left - 1, Ordering::SeqCst);
                return Err(IrsError::Transport("connection reset".into()));
            }
            self.inner.get_shell(id).await
        }
    }

    #[tokio::test(start_paused = true)]
    async fn recovered_call_leaves_no_tombstone() {
        let registry = part_with_serial();
        let mut collaborators = Collaborators::stub(registry.clone(), RecordingNotifier::new());
        collaborators.registry = Arc::new(Flaky {
            inner: registry,
            failures: AtomicUsize::new(1),
        });
        let chain = retrying_chain(collaborators);
        let (container, report) = run(&chain, &JobParameter::default(), 0).await;

        assert!(report.shell_failure.is_none());
        assert!(container.tombstones().is_empty());
        assert_eq!(report.next_hops.len(), 2);
    }
}
