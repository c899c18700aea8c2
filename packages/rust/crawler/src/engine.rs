//! Depth-bounded, level-by-level item graph crawler.
//!
//! The crawler starts from a root id, runs the enrichment chain for every
//! node of the current level with bounded fan-out, and queues the unvisited
//! neighbours those nodes reported for the next level.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use irs_registry::{Collaborators, JobStore};
use irs_shared::{
    Direction, GlobalAssetId, ItemContainer, JobParameter, ProcessStep, RetryPolicy, SharedContainer,
    Tombstone,
};

use crate::chain::{EnrichmentChain, NodeReport};

// ---------------------------------------------------------------------------
// CrawlReport
// ---------------------------------------------------------------------------

/// Counters of one crawl.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CrawlStats {
    /// Nodes the chain ran for.
    pub nodes_visited: usize,
    /// Deepest level that was enriched.
    pub max_level: u32,
    /// Distinct nodes the job store already knew below the root.
    pub hinted_nodes: usize,
    /// Node tasks that ended without a report (panicked). Each one leaves a
    /// tombstone for its node.
    pub lost_nodes: usize,
}

/// Outcome of a crawl. The graph itself lives in the job container.
#[derive(Debug, Clone, Default)]
pub struct CrawlReport {
    pub stats: CrawlStats,
    /// Shell lookup failure of the root node.
    pub root_failure: Option<String>,
    /// The crawl was stopped before the frontier was exhausted.
    pub cancelled: bool,
    pub duration: Duration,
}

// ---------------------------------------------------------------------------
// RecursiveCrawler
// ---------------------------------------------------------------------------

/// Breadth-first crawler with a per-job fan-out limit.
pub struct RecursiveCrawler {
    chain: Arc<EnrichmentChain>,
    store: Arc<dyn JobStore>,
    fanout: usize,
}

impl RecursiveCrawler {
    pub fn new(collaborators: Collaborators, store: Arc<dyn JobStore>, fanout: usize) -> Self {
        Self {
            chain: Arc::new(EnrichmentChain::new(collaborators)),
            store,
            fanout: fanout.max(1),
        }
    }

    /// Retry collaborator calls that fail in transport.
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        let chain = EnrichmentChain::new(self.chain.collaborators().clone()).with_retry(retry);
        self.chain = Arc::new(chain);
        self
    }

    /// Crawl from `root`, writing everything found into `container`.
    ///
    /// Cancelling `cancel` stops scheduling and aborts in-flight node tasks;
    /// whatever was merged before stays in the container.
    #[instrument(skip_all, fields(root = %root, depth = parameter.depth, direction = ?parameter.direction))]
    pub async fn crawl(
        &self,
        root: &GlobalAssetId,
        parameter: Arc<JobParameter>,
        container: SharedContainer,
        cancel: CancellationToken,
    ) -> CrawlReport {
        let start_time = tokio::time::Instant::now();
        let mut report = CrawlReport::default();

        let hinted = self.known_nodes(root, parameter.depth, parameter.direction).await;
        report.stats.hinted_nodes = hinted;

        let mut visited = HashSet::with_capacity(hinted + 1);
        visited.insert(root.clone());
        let mut frontier = vec![root.clone()];
        let mut level = 0u32;

        info!(fanout = self.fanout, hinted, "starting crawl");

        'levels: while !frontier.is_empty() {
            if cancel.is_cancelled() {
                report.cancelled = true;
                break;
            }
            debug!(level, width = frontier.len(), "crawling level");

            let semaphore = Arc::new(Semaphore::new(self.fanout));
            let mut tasks = JoinSet::new();
            let mut spawned = HashMap::with_capacity(frontier.len());
            for id in frontier.drain(..) {
                let chain = self.chain.clone();
                let parameter = parameter.clone();
                let container = container.clone();
                let semaphore = semaphore.clone();
                let node_id = id.clone();
                let handle = tasks.spawn(async move {
                    let _permit = semaphore.acquire_owned().await;
                    let node = chain.process(&container, &parameter, &id, level).await;
                    (id, node)
                });
                spawned.insert(handle.id(), node_id);
            }

            let mut reports: Vec<(GlobalAssetId, NodeReport)> = Vec::new();
            loop {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => {
                        tasks.abort_all();
                        report.cancelled = true;
                        break 'levels;
                    }
                    joined = tasks.join_next_with_id() => match joined {
                        Some(Ok((_, done))) => reports.push(done),
                        Some(Err(e)) => {
                            report.stats.lost_nodes += 1;
                            let Some(id) = spawned.remove(&e.id()) else {
                                warn!(level, error = %e, "node task failed");
                                continue;
                            };
                            let message = format!("node task failed: {e}");
                            warn!(level, %id, reason = %message, "tombstone");
                            if level == 0 {
                                report.root_failure = Some(message.clone());
                            }
                            let tombstone = Tombstone::new(id, None, ProcessStep::ShellRequest, message);
                            container.merge(ItemContainer::builder().tombstone(tombstone).build());
                        }
                        None => break,
                    },
                }
            }

            report.stats.nodes_visited += reports.len();
            report.stats.max_level = level;

            // Sorted so the next frontier does not depend on completion order.
            reports.sort_by(|a, b| a.0.cmp(&b.0));
            for (id, node) in reports {
                if level == 0 {
                    report.root_failure = node.shell_failure;
                }
                for hop in node.next_hops {
                    if visited.insert(hop.clone()) {
                        frontier.push(hop);
                    } else {
                        debug!(from = %id, to = %hop, "already visited");
                    }
                }
            }
            level += 1;
        }

        report.duration = start_time.elapsed();
        info!(
            nodes = report.stats.nodes_visited,
            max_level = report.stats.max_level,
            cancelled = report.cancelled,
            duration_ms = report.duration.as_millis(),
            "crawl finished"
        );
        report
    }

    /// Number of distinct nodes the store knows around `root` in the crawl
    /// direction. Store errors are logged and read as "nothing known".
    async fn known_nodes(&self, root: &GlobalAssetId, depth: u32, direction: Direction) -> usize {
        match self.store.known_subtree(root, depth, direction).await {
            Ok(edges) => edges
                .iter()
                .flat_map(|e| [&e.parent_id, &e.child_id])
                .filter(|id| *id != root)
                .collect::<HashSet<_>>()
                .len(),
            Err(e) => {
                warn!(error = %e, "known-subtree lookup failed");
                0
            }
        }
    }
}

#[cfg(test)]
mod crawler_tests {
    use super::*;
    use async_trait::async_trait;
    use irs_registry::aspects::SINGLE_LEVEL_BOM_AS_BUILT;
    use irs_registry::{InMemoryRegistry, NoopJobStore, RecordingNotifier, RegistryClient};
    use irs_shared::{RelationshipEdge, Result, ShellDescriptor};

    fn id(n: u32) -> String {
        format!("urn:uuid:00000000-0000-0000-0000-{n:012}")
    }

    fn gid(n: u32) -> GlobalAssetId {
        GlobalAssetId::from_payload(id(n))
    }

    fn crawler_with(registry: InMemoryRegistry, store: Arc<dyn JobStore>, fanout: usize) -> RecursiveCrawler {
        RecursiveCrawler::new(
            Collaborators::stub(registry, RecordingNotifier::new()),
            store,
            fanout,
        )
    }

    fn crawler(registry: InMemoryRegistry) -> RecursiveCrawler {
        crawler_with(registry, Arc::new(NoopJobStore), 4)
    }

    async fn crawl(crawler: &RecursiveCrawler, root: u32, parameter: JobParameter) -> (CrawlReport, ItemContainer) {
        let container = SharedContainer::new();
        let report = crawler
            .crawl(&gid(root), Arc::new(parameter), container.clone(), CancellationToken::new())
            .await;
        (report, container.seal())
    }

    fn depth(depth: u32) -> JobParameter {
        JobParameter {
            depth,
            ..JobParameter::default()
        }
    }

    /// 1 -> 2 -> 3 -> 4
    fn chain_of_four() -> InMemoryRegistry {
        InMemoryRegistry::new()
            .with_part(&id(1), &[&id(2)])
            .with_part(&id(2), &[&id(3)])
            .with_part(&id(3), &[&id(4)])
            .with_part(&id(4), &[])
    }

    #[tokio::test]
    async fn depth_bounds_the_traversal() {
        let registry = chain_of_four();
        let crawler = crawler(registry.clone());
        let (report, container) = crawl(&crawler, 1, depth(2)).await;

        assert_eq!(report.stats.nodes_visited, 3);
        assert_eq!(report.stats.max_level, 2);
        assert_eq!(container.shells().len(), 3);
        let edges: Vec<_> = container.relationships().iter().map(|e| e.key()).collect();
        assert_eq!(edges, vec![(gid(1), gid(2)), (gid(2), gid(3))]);
        assert_eq!(registry.shell_lookups(&id(4)), 0);
    }

    #[tokio::test]
    async fn depth_one_enriches_direct_children() {
        let (report, container) = crawl(&crawler(chain_of_four()), 1, depth(1)).await;
        assert_eq!(report.stats.nodes_visited, 2);
        assert_eq!(container.relationships().len(), 1);
        assert_eq!(container.shells().len(), 2);
    }

    #[tokio::test]
    async fn shared_child_is_visited_once() {
        // 1 -> {2, 3}, 2 -> 4, 3 -> 4
        let registry = InMemoryRegistry::new()
            .with_part(&id(1), &[&id(2), &id(3)])
            .with_part(&id(2), &[&id(4)])
            .with_part(&id(3), &[&id(4)])
            .with_part(&id(4), &[]);
        let (report, container) = crawl(&crawler(registry.clone()), 1, depth(5)).await;

        assert_eq!(report.stats.nodes_visited, 4);
        assert_eq!(registry.shell_lookups(&id(4)), 1);
        assert_eq!(container.relationships().len(), 4);
    }

    #[tokio::test]
    async fn cycles_terminate() {
        let registry = InMemoryRegistry::new()
            .with_part(&id(1), &[&id(2)])
            .with_part(&id(2), &[&id(1)]);
        let (report, container) = crawl(&crawler(registry.clone()), 1, depth(100)).await;

        assert_eq!(report.stats.nodes_visited, 2);
        assert_eq!(registry.shell_lookups(&id(1)), 1);
        assert_eq!(registry.shell_lookups(&id(2)), 1);
        assert_eq!(container.relationships().len(), 2);
    }

    #[tokio::test]
    async fn failed_child_is_a_leaf() {
        let registry = InMemoryRegistry::new()
            .with_part(&id(1), &[&id(2), &id(3)])
            .with_part(&id(2), &[&id(4)])
            .fail_shell(&id(2))
            .with_part(&id(3), &[]);
        let (report, container) = crawl(&crawler(registry.clone()), 1, depth(5)).await;

        assert!(report.root_failure.is_none());
        assert_eq!(container.tombstones_for(&gid(2), ProcessStep::ShellRequest).count(), 1);
        assert!(container.relationships().iter().all(|e| e.parent_id != gid(2)));
        assert_eq!(registry.shell_lookups(&id(4)), 0);
        assert_eq!(registry.shell_lookups(&id(3)), 1);
    }

    #[tokio::test]
    async fn root_failure_is_reported() {
        let registry = InMemoryRegistry::new().fail_shell(&id(1));
        let (report, container) = crawl(&crawler(registry), 1, depth(5)).await;
        assert!(report.root_failure.is_some());
        assert_eq!(container.tombstones().len(), 1);
    }

    #[tokio::test]
    async fn upward_follows_usage_aspect() {
        // 3 is used in 2, 2 is used in 1
        let registry = InMemoryRegistry::new()
            .with_part_usage(&id(3), &[&id(2)])
            .with_part_usage(&id(2), &[&id(1)])
            .with_part_usage(&id(1), &[]);
        let parameter = JobParameter {
            direction: Direction::Upward,
            ..JobParameter::default()
        };
        let (report, container) = crawl(&crawler(registry), 3, parameter).await;

        assert_eq!(report.stats.nodes_visited, 3);
        let edges: Vec<_> = container.relationships().iter().map(|e| e.key()).collect();
        assert_eq!(edges, vec![(gid(2), gid(3)), (gid(1), gid(2))]);
    }

    #[tokio::test(start_paused = true)]
    async fn siblings_run_concurrently_up_to_fanout() {
        let children: Vec<String> = (2..=5).map(id).collect();
        let child_refs: Vec<&str> = children.iter().map(String::as_str).collect();
        let mut registry = InMemoryRegistry::new()
            .with_part(&id(1), &child_refs)
            .with_latency(Duration::from_secs(1));
        for child in &children {
            registry = registry.with_part(child, &[]);
        }

        // root: shell + bom = 2s; level 1: shell + bom per child
        let parallel = crawler_with(registry.clone(), Arc::new(NoopJobStore), 4);
        let (report, _) = crawl(&parallel, 1, depth(5)).await;
        assert!(report.duration >= Duration::from_secs(4));
        assert!(report.duration < Duration::from_secs(5));

        let serial = crawler_with(registry, Arc::new(NoopJobStore), 1);
        let (report, _) = crawl(&serial, 1, depth(5)).await;
        assert!(report.duration >= Duration::from_secs(10));
    }

    #[tokio::test]
    async fn cancelled_crawl_stops_before_scheduling() {
        let crawler = crawler(chain_of_four());
        let container = SharedContainer::new();
        let cancel = CancellationToken::new();
        cancel.cancel();

        let report = crawler
            .crawl(&gid(1), Arc::new(depth(5)), container.clone(), cancel)
            .await;
        assert!(report.cancelled);
        assert_eq!(report.stats.nodes_visited, 0);
        assert!(container.seal().is_empty());
    }

    /// Store that only knows edges in one direction.
    struct KnownEdges(Direction, Vec<RelationshipEdge>);

    #[async_trait]
    impl JobStore for KnownEdges {
        async fn known_subtree(
            &self,
            _root: &GlobalAssetId,
            _max_depth: u32,
            direction: Direction,
        ) -> Result<Vec<RelationshipEdge>> {
            if direction == self.0 {
                Ok(self.1.clone())
            } else {
                Ok(Vec::new())
            }
        }

        async fn record_edges(&self, _edges: &[RelationshipEdge]) -> Result<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn store_hint_does_not_change_the_result() {
        let stale = KnownEdges(Direction::Downward, vec![
            RelationshipEdge::new(gid(1), gid(2), SINGLE_LEVEL_BOM_AS_BUILT),
            RelationshipEdge::new(gid(1), gid(9), SINGLE_LEVEL_BOM_AS_BUILT),
        ]);
        let hinted = crawler_with(chain_of_four(), Arc::new(stale), 4);
        let (report, container) = crawl(&hinted, 1, depth(5)).await;

        assert_eq!(report.stats.hinted_nodes, 2);
        assert_eq!(report.stats.nodes_visited, 4);
        assert!(container.relationships().iter().all(|e| e.child_id != gid(9)));
    }

    #[tokio::test]
    async fn hint_follows_the_crawl_direction() {
        let below = KnownEdges(Direction::Downward, vec![
            RelationshipEdge::new(gid(1), gid(2), SINGLE_LEVEL_BOM_AS_BUILT),
            RelationshipEdge::new(gid(2), gid(3), SINGLE_LEVEL_BOM_AS_BUILT),
        ]);
        let crawler = crawler_with(chain_of_four(), Arc::new(below), 4);
        let upward = JobParameter {
            direction: Direction::Upward,
            ..depth(3)
        };
        let (report, _) = crawl(&crawler, 1, upward).await;
        assert_eq!(report.stats.hinted_nodes, 0);

        let (report, _) = crawl(&crawler, 1, depth(3)).await;
        assert_eq!(report.stats.hinted_nodes, 2);
    }

    /// Registry whose lookup for one id panics.
    struct PanickingRegistry {
        inner: InMemoryRegistry,
        poisoned: GlobalAssetId,
    }

    #[async_trait]
    impl RegistryClient for PanickingRegistry {
        async fn get_shell(&self, id: &GlobalAssetId) -> Result<ShellDescriptor> {
            if *id == self.poisoned {
                panic!("corrupt descriptor for {id}");
            }
            self.inner.get_shell(id).await
        }
    }

    #[tokio::test]
    async fn panicked_node_leaves_a_tombstone() {
        // 1 -> {2, 3}, 3 -> 4; the lookup for 2 panics.
        let registry = InMemoryRegistry::new()
            .with_part(&id(1), &[&id(2), &id(3)])
            .with_part(&id(2), &[])
            .with_part(&id(3), &[&id(4)])
            .with_part(&id(4), &[]);
        let mut collaborators = Collaborators::stub(registry.clone(), RecordingNotifier::new());
        collaborators.registry = Arc::new(PanickingRegistry {
            inner: registry,
            poisoned: gid(2),
        });
        let crawler = RecursiveCrawler::new(collaborators, Arc::new(NoopJobStore), 4);

        let container = SharedContainer::new();
        let report = crawler
            .crawl(&gid(1), Arc::new(depth(5)), container.clone(), CancellationToken::new())
            .await;
        let container = container.seal();

        assert_eq!(report.stats.lost_nodes, 1);
        assert!(report.root_failure.is_none());
        let lost_id = gid(2);
        let lost: Vec<_> = container.tombstones_for(&lost_id, ProcessStep::ShellRequest).collect();
        assert_eq!(lost.len(), 1);
        assert!(lost[0].processing_error.message.contains("panicked"));
        assert!(container.shells().iter().any(|s| s.global_asset_id == gid(4)));
    }
}
