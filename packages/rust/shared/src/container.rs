//! Per-job accumulator of shells, aspects, relationship edges, and tombstones.
//!
//! [`ItemContainer`] is a plain value with append-only operations. While a job
//! is running, every write goes through a [`SharedContainer`], the job's single
//! writer, which is sealed read-only when the job reaches a terminal state.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard};

use serde::Serialize;

use crate::types::{
    Bpn, GlobalAssetId, ProcessStep, RelationshipEdge, ShellDescriptor, Submodel, Tombstone,
};

// ---------------------------------------------------------------------------
// ItemContainer
// ---------------------------------------------------------------------------

/// Accumulated crawl result of one job.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ItemContainer {
    shells: Vec<ShellDescriptor>,
    submodels: Vec<Submodel>,
    relationships: Vec<RelationshipEdge>,
    tombstones: Vec<Tombstone>,
    bpns: Vec<Bpn>,
    #[serde(skip)]
    edge_keys: HashSet<(GlobalAssetId, GlobalAssetId)>,
}

/// Collection sizes of a container.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ContainerSummary {
    pub shells: usize,
    pub submodels: usize,
    pub relationships: usize,
    pub tombstones: usize,
    pub bpns: usize,
}

impl ItemContainer {
    pub fn builder() -> ItemContainerBuilder {
        ItemContainerBuilder::default()
    }

    pub fn add_shell(&mut self, shell: ShellDescriptor) {
        self.shells.push(shell);
    }

    pub fn add_submodel(&mut self, submodel: Submodel) {
        self.submodels.push(submodel);
    }

    /// Add an edge unless its (parent, child) pair is already present.
    ///
    /// Returns `true` if the edge was new.
    pub fn add_edge(&mut self, edge: RelationshipEdge) -> bool {
        if self.edge_keys.insert(edge.key()) {
            self.relationships.push(edge);
            true
        } else {
            false
        }
    }

    pub fn add_tombstone(&mut self, tombstone: Tombstone) {
        self.tombstones.push(tombstone);
    }

    pub fn add_bpn(&mut self, bpn: Bpn) {
        if !self.bpns.contains(&bpn) {
            self.bpns.push(bpn);
        }
    }

    /// Union `other` into `self`, keeping edge uniqueness.
    pub fn merge(&mut self, other: ItemContainer) {
        self.shells.extend(other.shells);
        self.submodels.extend(other.submodels);
        for edge in other.relationships {
            self.add_edge(edge);
        }
        self.tombstones.extend(other.tombstones);
        for bpn in other.bpns {
            self.add_bpn(bpn);
        }
    }

    pub fn shells(&self) -> &[ShellDescriptor] {
        &self.shells
    }

    pub fn submodels(&self) -> &[Submodel] {
        &self.submodels
    }

    pub fn relationships(&self) -> &[RelationshipEdge] {
        &self.relationships
    }

    pub fn tombstones(&self) -> &[Tombstone] {
        &self.tombstones
    }

    pub fn bpns(&self) -> &[Bpn] {
        &self.bpns
    }

    /// Tombstones recorded for `id` in the given stage.
    pub fn tombstones_for<'a>(
        &'a self,
        id: &'a GlobalAssetId,
        step: ProcessStep,
    ) -> impl Iterator<Item = &'a Tombstone> + 'a {
        self.tombstones
            .iter()
            .filter(move |t| &t.catenax_id == id && t.process_step() == step)
    }

    pub fn is_empty(&self) -> bool {
        self.shells.is_empty()
            && self.submodels.is_empty()
            && self.relationships.is_empty()
            && self.tombstones.is_empty()
            && self.bpns.is_empty()
    }

    pub fn summary(&self) -> ContainerSummary {
        ContainerSummary {
            shells: self.shells.len(),
            submodels: self.submodels.len(),
            relationships: self.relationships.len(),
            tombstones: self.tombstones.len(),
            bpns: self.bpns.len(),
        }
    }
}

/// Builder-style construction of an [`ItemContainer`].
#[derive(Debug, Default)]
pub struct ItemContainerBuilder {
    inner: ItemContainer,
}

impl ItemContainerBuilder {
    pub fn shell(mut self, shell: ShellDescriptor) -> Self {
        self.inner.add_shell(shell);
        self
    }

    pub fn submodel(mut self, submodel: Submodel) -> Self {
        self.inner.add_submodel(submodel);
        self
    }

    pub fn edge(mut self, edge: RelationshipEdge) -> Self {
        self.inner.add_edge(edge);
        self
    }

    pub fn tombstone(mut self, tombstone: Tombstone) -> Self {
        self.inner.add_tombstone(tombstone);
        self
    }

    pub fn bpn(mut self, bpn: Bpn) -> Self {
        self.inner.add_bpn(bpn);
        self
    }

    pub fn build(self) -> ItemContainer {
        self.inner
    }
}

// ---------------------------------------------------------------------------
// SharedContainer
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
struct Slot {
    container: ItemContainer,
    sealed: bool,
}

/// Lock-guarded job container. Cloning shares the same underlying container.
///
/// Writes arriving after [`SharedContainer::seal`] are discarded.
#[derive(Debug, Clone, Default)]
pub struct SharedContainer {
    slot: Arc<Mutex<Slot>>,
}

impl SharedContainer {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Slot> {
        // A panicking writer cannot leave the container half-updated: every
        // write is a single append under the lock.
        self.slot.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Merge a partial result into the job container.
    ///
    /// Returns `false` if the container was already sealed and `delta` was dropped.
    pub fn merge(&self, delta: ItemContainer) -> bool {
        let mut slot = self.lock();
        if slot.sealed {
            return false;
        }
        slot.container.merge(delta);
        true
    }

    /// Current contents, without sealing.
    pub fn snapshot(&self) -> ItemContainer {
        self.lock().container.clone()
    }

    /// Make the container read-only and return its final contents.
    pub fn seal(&self) -> ItemContainer {
        let mut slot = self.lock();
        slot.sealed = true;
        slot.container.clone()
    }

    pub fn is_sealed(&self) -> bool {
        self.lock().sealed
    }
}
