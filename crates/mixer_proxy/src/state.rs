//! Proxy state and the diff engine
//!
//! [`ProxyState`] owns every [`DatablockProxy`] by uuid, the binding of
//! each uuid to its live node, the back-references between datablocks and
//! the references still waiting for their target.
//!
//! ## Local changes
//!
//! ```ignore
//! let changeset = state.diff(&mut doc);
//! state.apply_local(&changeset, &doc);
//! // encode and send changeset
//! ```
//!
//! ## Remote changes
//!
//! ```ignore
//! state.apply_changeset(&received, &mut doc);
//! ```
//!
//! Remote changes are applied to the proxy and to the live node through the
//! same attribute-write path used at creation; local changes only update
//! the proxy since the live node already holds them.

use std::collections::hash_map::Entry;
use std::collections::{BTreeSet, HashMap, HashSet};

use crate::changeset::{Changeset, Removal, Rename};
use crate::delta::DatablockDelta;
use crate::document::Document;
use crate::error::{CreationError, DocumentError, ProxyError, ProxyResult};
use crate::handle::LiveHandle;
use crate::id::NodeUuid;
use crate::proxy::DatablockProxy;

/// Diff engine options
#[derive(Debug, Clone)]
pub struct DiffConfig {
    /// Prefix of the placeholder names used by two-pass renames
    pub temp_name_prefix: String,
}

impl Default for DiffConfig {
    fn default() -> Self {
        Self {
            temp_name_prefix: "__mixer_tmp_".to_string(),
        }
    }
}

/// Whether an operation writes the live document
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyTarget {
    /// Locally observed change: the live node already holds it
    ProxyOnly,
    /// Remotely received change
    ProxyAndLive,
}

/// Result of applying a received changeset
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ApplyReport {
    /// Datablocks created
    pub created: usize,
    /// Datablocks updated
    pub updated: usize,
    /// Datablocks removed
    pub removed: usize,
    /// Operations skipped after an error
    pub skipped: usize,
    /// Renames to broadcast so that all peers converge
    pub corrective_renames: Vec<Rename>,
}

/// Divergences found by [`ProxyState::sanity_check`]
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SanityReport {
    /// Proxies whose live node is gone
    pub missing_live: Vec<NodeUuid>,
    /// Proxies bound to a node carrying another uuid
    pub mismatched: Vec<NodeUuid>,
    /// Tagged live nodes without a proxy
    pub untracked: Vec<LiveHandle>,
    /// Referenced datablocks that never arrived
    pub unresolved: Vec<NodeUuid>,
    /// Proxies whose live node could not be created
    pub not_materialized: Vec<NodeUuid>,
}

impl SanityReport {
    /// Whether no divergence was found
    pub fn is_clean(&self) -> bool {
        self.missing_live.is_empty()
            && self.mismatched.is_empty()
            && self.untracked.is_empty()
            && self.unresolved.is_empty()
            && self.not_materialized.is_empty()
    }
}

/// All synchronized datablocks
#[derive(Debug, Default)]
pub struct ProxyState {
    /// Proxies by uuid
    pub(crate) proxies: HashMap<NodeUuid, DatablockProxy>,
    /// Live node of each materialized proxy
    pub(crate) handles: HashMap<NodeUuid, LiveHandle>,
    /// Referenced datablock -> datablocks referencing it
    pub(crate) back_references: HashMap<NodeUuid, BTreeSet<NodeUuid>>,
    /// Missing datablock -> datablocks waiting for it
    pub(crate) unresolved: HashMap<NodeUuid, BTreeSet<NodeUuid>>,
    /// Insertion rank of each proxy, removals go out in reverse
    pub(crate) creation_order: HashMap<NodeUuid, u64>,
    next_rank: u64,
    /// Options
    pub(crate) config: DiffConfig,
}

impl ProxyState {
    /// Create an empty state
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an empty state with options
    pub fn with_config(config: DiffConfig) -> Self {
        Self {
            config,
            ..Self::default()
        }
    }

    /// Options
    pub fn config(&self) -> &DiffConfig {
        &self.config
    }

    /// Number of proxies
    pub fn len(&self) -> usize {
        self.proxies.len()
    }

    /// Whether there are no proxies
    pub fn is_empty(&self) -> bool {
        self.proxies.is_empty()
    }

    /// Get a proxy
    pub fn get(&self, uuid: NodeUuid) -> Option<&DatablockProxy> {
        self.proxies.get(&uuid)
    }

    /// Iterate over proxies
    pub fn proxies(&self) -> impl Iterator<Item = &DatablockProxy> {
        self.proxies.values()
    }

    /// Live node bound to a uuid
    pub fn handle_of(&self, uuid: NodeUuid) -> Option<LiveHandle> {
        self.handles.get(&uuid).copied()
    }

    /// Datablocks referencing `uuid`
    pub fn owners_of(&self, uuid: NodeUuid) -> Vec<NodeUuid> {
        self.back_references
            .get(&uuid)
            .map(|owners| owners.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Referenced datablocks not available yet
    pub fn unresolved(&self) -> Vec<NodeUuid> {
        let mut missing: Vec<NodeUuid> = self.unresolved.keys().copied().collect();
        missing.sort();
        missing
    }

    /// Drop everything
    pub fn clear(&mut self) {
        self.proxies.clear();
        self.handles.clear();
        self.back_references.clear();
        self.unresolved.clear();
        self.creation_order.clear();
    }

    // ------------------------------------------------------------------
    // Bookkeeping
    // ------------------------------------------------------------------

    fn insert(&mut self, proxy: DatablockProxy, handle: Option<LiveHandle>) {
        let uuid = proxy.uuid;
        if let Entry::Vacant(entry) = self.creation_order.entry(uuid) {
            entry.insert(self.next_rank);
            self.next_rank += 1;
        }
        self.proxies.insert(uuid, proxy);
        match handle {
            Some(handle) => {
                self.handles.insert(uuid, handle);
            }
            None => {
                self.handles.remove(&uuid);
            }
        }
        self.reindex(uuid, &BTreeSet::new());
    }

    /// Move `owner` from the back-reference sets of `before` to those of its
    /// current references
    fn reindex(&mut self, owner: NodeUuid, before: &BTreeSet<NodeUuid>) {
        for target in before {
            if let Some(owners) = self.back_references.get_mut(target) {
                owners.remove(&owner);
                if owners.is_empty() {
                    self.back_references.remove(target);
                }
            }
        }
        let after = self
            .proxies
            .get(&owner)
            .map(|p| p.references())
            .unwrap_or_default();
        for target in after {
            self.back_references.entry(target).or_default().insert(owner);
        }
    }

    fn register_unresolved(&mut self, owner: NodeUuid, missing: BTreeSet<NodeUuid>) {
        for target in missing {
            log::debug!("{} waits for {}", owner, target);
            self.unresolved.entry(target).or_default().insert(owner);
        }
    }

    /// Remove a proxy and purge its uuid from every index
    fn forget(&mut self, uuid: NodeUuid) -> Option<DatablockProxy> {
        let references = self.proxies.get(&uuid).map(|p| p.references()).unwrap_or_default();
        self.reindex(uuid, &references);
        let proxy = self.proxies.remove(&uuid);
        self.handles.remove(&uuid);
        self.creation_order.remove(&uuid);
        self.back_references.remove(&uuid);
        self.unresolved.remove(&uuid);
        self.unresolved.retain(|_, owners| {
            owners.remove(&uuid);
            !owners.is_empty()
        });
        proxy
    }

    /// Missing datablocks `owner` is waiting for
    fn pending_targets_of(&self, owner: NodeUuid) -> Vec<NodeUuid> {
        self.unresolved
            .iter()
            .filter(|(_, owners)| owners.contains(&owner))
            .map(|(target, _)| *target)
            .collect()
    }

    // ------------------------------------------------------------------
    // Diff
    // ------------------------------------------------------------------

    /// Compute the changes of the live document since the last sync.
    ///
    /// Untagged nodes get a fresh uuid. A node carrying a uuid already bound
    /// to another live node (a duplicate) is re-tagged and reported as a
    /// creation. Proxies whose live node could not be created are never
    /// reported as removed.
    pub fn diff(&mut self, doc: &mut Document) -> Changeset {
        let live = self.tag_nodes(doc);
        let doc: &Document = doc;

        for (uuid, handle) in &live {
            if let Some(bound) = self.handles.get_mut(uuid) {
                if bound != handle {
                    log::debug!("Rebinding {} to {:?}", uuid, handle);
                    *bound = *handle;
                }
            }
        }

        let resolve = |handle: LiveHandle| doc.uuid_of(handle);
        let mut changeset = Changeset::new();
        let mut present = HashSet::with_capacity(live.len());

        for (uuid, handle) in &live {
            present.insert(*uuid);
            let Some(node) = doc.get(*handle) else {
                continue;
            };
            match self.proxies.get(uuid) {
                None => changeset
                    .creations
                    .push(DatablockProxy::from_live(*uuid, node, &resolve)),
                Some(proxy) => {
                    if proxy.name != node.name() {
                        changeset.renames.push(Rename {
                            uuid: *uuid,
                            kind: proxy.kind,
                            old_name: proxy.name.clone(),
                            new_name: node.name().to_string(),
                        });
                    }
                    if let Some(mut change) = proxy.diff(node, &resolve) {
                        self.mask_pending(proxy, &mut change);
                        if !change.is_empty() {
                            changeset.updates.push(change);
                        }
                    }
                }
            }
        }

        let mut removals: Vec<Removal> = self
            .proxies
            .values()
            .filter(|proxy| proxy.has_live_node && !present.contains(&proxy.uuid))
            .map(|proxy| Removal {
                uuid: proxy.uuid,
                kind: proxy.kind,
                name: proxy.name.clone(),
            })
            .collect();
        removals.sort_by_key(|r| std::cmp::Reverse(self.creation_order.get(&r.uuid).copied()));
        changeset.removals = removals;

        changeset.sort();
        if !changeset.is_empty() {
            log::debug!(
                "Diff: {} created, {} removed, {} renamed, {} updated",
                changeset.creations.len(),
                changeset.removals.len(),
                changeset.renames.len(),
                changeset.updates.len()
            );
        }
        changeset
    }

    /// Tag untagged nodes and re-tag duplicates. Returns every live node
    /// with its (unique) uuid, in document order.
    fn tag_nodes(&self, doc: &mut Document) -> Vec<(NodeUuid, LiveHandle)> {
        let nodes: Vec<(LiveHandle, Option<NodeUuid>)> =
            doc.iter().map(|(handle, node)| (handle, node.uuid())).collect();

        // The node already bound to a uuid keeps it
        let mut claimed: HashSet<NodeUuid> = nodes
            .iter()
            .filter_map(|(handle, tag)| tag.filter(|uuid| self.handles.get(uuid) == Some(handle)))
            .collect();

        let mut live = Vec::with_capacity(nodes.len());
        for (handle, tag) in nodes {
            let uuid = match tag {
                Some(uuid) if self.handles.get(&uuid) == Some(&handle) => uuid,
                Some(uuid) if claimed.insert(uuid) => uuid,
                previous => {
                    let fresh = NodeUuid::new();
                    if let Some(previous) = previous {
                        log::debug!("Re-tagging duplicate of {} as {}", previous, fresh);
                    }
                    if let Err(e) = doc.set_uuid(handle, fresh) {
                        log::warn!("Failed to tag node: {}", e);
                        continue;
                    }
                    fresh
                }
            };
            live.push((uuid, handle));
        }
        live
    }

    /// Ignore changes of attributes that hold references still waiting for
    /// their target: the live side holds a placeholder for them.
    fn mask_pending(&self, proxy: &DatablockProxy, change: &mut DatablockDelta) {
        let pending = self.pending_targets_of(proxy.uuid);
        if pending.is_empty() {
            return;
        }
        let masked = |key: &String| {
            proxy
                .attributes
                .get(key)
                .map(|value| pending.iter().any(|target| value.references_uuid(*target)))
                .unwrap_or(false)
        };
        change.attributes.updated.retain(|key, _| !masked(key));
        change.attributes.removed.retain(|key| !masked(key));
    }

    /// Record a locally observed changeset in the proxies only
    pub fn apply_local(&mut self, changeset: &Changeset, doc: &Document) {
        let index = doc.uuid_index();
        for removal in &changeset.removals {
            self.forget(removal.uuid);
        }
        for rename in &changeset.renames {
            if let Some(proxy) = self.proxies.get_mut(&rename.uuid) {
                proxy.name = rename.new_name.clone();
            }
        }
        for creation in &changeset.creations {
            let mut proxy = creation.clone();
            proxy.has_live_node = true;
            self.insert(proxy, index.get(&creation.uuid).copied());
        }
        for change in &changeset.updates {
            if let Err(e) = self.apply_proxy_delta(change) {
                log::warn!("Skipping local update: {}", e);
            }
        }
    }

    fn apply_proxy_delta(&mut self, change: &DatablockDelta) -> ProxyResult<()> {
        let proxy = self
            .proxies
            .get_mut(&change.uuid)
            .ok_or(ProxyError::UnknownUuid(change.uuid))?;
        let before = proxy.references();
        proxy.apply(change);
        self.reindex(change.uuid, &before);
        Ok(())
    }

    // ------------------------------------------------------------------
    // Remote changes
    // ------------------------------------------------------------------

    /// Apply one datablock change
    pub fn apply_delta(
        &mut self,
        change: &DatablockDelta,
        target: ApplyTarget,
        doc: &mut Document,
    ) -> ProxyResult<()> {
        match target {
            ApplyTarget::ProxyOnly => self.apply_proxy_delta(change),
            ApplyTarget::ProxyAndLive => self.update_datablock(change, doc),
        }
    }

    /// Create a received datablock.
    ///
    /// Returns `None` when the live node could not be created because an
    /// external resource is missing; the proxy is kept, marked as not
    /// materialized.
    pub fn create_datablock(
        &mut self,
        mut proxy: DatablockProxy,
        doc: &mut Document,
    ) -> ProxyResult<Option<LiveHandle>> {
        let uuid = proxy.uuid;
        if self.proxies.contains_key(&uuid) {
            return Err(CreationError::DuplicateUuid(uuid).into());
        }

        match proxy.materialize(doc, &self.handles) {
            Ok(materialized) => {
                proxy.has_live_node = true;
                self.insert(proxy, Some(materialized.handle));
                self.register_unresolved(uuid, materialized.unresolved);
                self.resolve_pending(uuid, doc);
                Ok(Some(materialized.handle))
            }
            Err(CreationError::MissingExternalFile(path)) => {
                log::warn!("Datablock {} '{}' not materialized: missing {}", uuid, proxy.name, path);
                proxy.has_live_node = false;
                self.insert(proxy, None);
                Ok(None)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Apply a received change to the proxy and its live node
    pub fn update_datablock(&mut self, change: &DatablockDelta, doc: &mut Document) -> ProxyResult<()> {
        self.apply_proxy_delta(change)?;

        let uuid = change.uuid;
        let has_live_node = self.proxies.get(&uuid).map(|p| p.has_live_node).unwrap_or(false);
        if !has_live_node {
            return self.retry_materialize(uuid, doc);
        }

        let handle = self.handles.get(&uuid).copied().ok_or(ProxyError::UnknownUuid(uuid))?;
        let proxy = self.proxies.get(&uuid).ok_or(ProxyError::UnknownUuid(uuid))?;
        let node = doc.get_mut(handle).ok_or(DocumentError::StaleHandle(handle))?;
        let missing = proxy.write_live(change, node, &self.handles);
        self.register_unresolved(uuid, missing);
        Ok(())
    }

    /// Try again to create the live node of a proxy that has none
    fn retry_materialize(&mut self, uuid: NodeUuid, doc: &mut Document) -> ProxyResult<()> {
        let proxy = self.proxies.get(&uuid).ok_or(ProxyError::UnknownUuid(uuid))?;
        match proxy.materialize(doc, &self.handles) {
            Ok(materialized) => {
                log::info!("Datablock {} '{}' materialized", uuid, proxy.name);
                if let Some(proxy) = self.proxies.get_mut(&uuid) {
                    proxy.has_live_node = true;
                }
                self.handles.insert(uuid, materialized.handle);
                self.register_unresolved(uuid, materialized.unresolved);
                self.resolve_pending(uuid, doc);
                Ok(())
            }
            Err(CreationError::MissingExternalFile(_)) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Remove a received datablock. References to it are dropped first, on
    /// the live nodes and on the proxies of their owners.
    pub fn remove_datablock(&mut self, uuid: NodeUuid, doc: &mut Document) -> ProxyResult<()> {
        if !self.proxies.contains_key(&uuid) {
            return Err(ProxyError::UnknownUuid(uuid));
        }

        if let Some(handle) = self.handles.get(&uuid).copied() {
            if doc.contains(handle) {
                doc.unlink_references_to(handle);
                doc.remove_node(handle)?;
            } else {
                log::warn!("Live node of {} already gone", uuid);
            }
        }

        for owner in self.owners_of(uuid) {
            if let Some(proxy) = self.proxies.get_mut(&owner) {
                proxy.unlink_references_to(uuid);
            }
        }
        self.forget(uuid);
        Ok(())
    }

    /// Apply a received changeset: removals, renames, creations, updates.
    ///
    /// Errors are logged and the offending operation skipped.
    pub fn apply_changeset(&mut self, changeset: &Changeset, doc: &mut Document) -> ApplyReport {
        let mut report = ApplyReport::default();

        let mut removals: Vec<&Removal> = changeset.removals.iter().collect();
        removals.sort_by_key(|r| std::cmp::Reverse(r.kind.priority()));
        for removal in removals {
            match self.remove_datablock(removal.uuid, doc) {
                Ok(()) => report.removed += 1,
                Err(e) => {
                    log::warn!("Skipping removal of '{}': {}", removal.name, e);
                    report.skipped += 1;
                }
            }
        }

        report.corrective_renames = self.rename_datablocks(&changeset.renames, doc);

        let mut creations: Vec<&DatablockProxy> = changeset.creations.iter().collect();
        creations.sort_by_key(|c| c.kind.priority());
        for creation in creations {
            match self.create_datablock(creation.clone(), doc) {
                Ok(_) => report.created += 1,
                Err(e) => {
                    log::warn!("Skipping creation of '{}': {}", creation.name, e);
                    report.skipped += 1;
                }
            }
        }

        let mut updates: Vec<&DatablockDelta> = changeset.updates.iter().collect();
        updates.sort_by_key(|u| u.kind.priority());
        for change in updates {
            match self.update_datablock(change, doc) {
                Ok(()) => report.updated += 1,
                Err(e) => {
                    log::warn!("Skipping update of {}: {}", change.uuid, e);
                    report.skipped += 1;
                }
            }
        }

        self.resolve_all_pending(doc);
        report
    }

    /// Patch the owners waiting for `uuid` now that it is bound.
    ///
    /// Returns the number of owners patched.
    pub fn resolve_pending(&mut self, uuid: NodeUuid, doc: &mut Document) -> usize {
        if !self.handles.contains_key(&uuid) {
            return 0;
        }
        let Some(owners) = self.unresolved.remove(&uuid) else {
            return 0;
        };

        let mut still_missing = Vec::new();
        for owner in owners {
            let (Some(proxy), Some(handle)) = (self.proxies.get(&owner), self.handles.get(&owner)) else {
                continue;
            };
            let Some(node) = doc.get_mut(*handle) else {
                continue;
            };
            let missing = proxy.write_references_to(uuid, node, &self.handles);
            still_missing.push((owner, missing));
        }

        let patched = still_missing.len();
        for (owner, missing) in still_missing {
            self.register_unresolved(owner, missing);
        }
        log::debug!("Resolved {} references to {}", patched, uuid);
        patched
    }

    /// Resolve every pending reference whose target is now bound
    pub fn resolve_all_pending(&mut self, doc: &mut Document) -> usize {
        let ready: Vec<NodeUuid> = self
            .unresolved
            .keys()
            .filter(|uuid| self.handles.contains_key(uuid))
            .copied()
            .collect();
        ready.into_iter().map(|uuid| self.resolve_pending(uuid, doc)).sum()
    }

    // ------------------------------------------------------------------
    // Diagnostics
    // ------------------------------------------------------------------

    /// Cross-check proxies against the live document. Logs divergences,
    /// never repairs them.
    pub fn sanity_check(&self, doc: &Document) -> SanityReport {
        let mut report = SanityReport::default();

        for proxy in self.proxies.values() {
            if !proxy.has_live_node {
                report.not_materialized.push(proxy.uuid);
                continue;
            }
            match self.handles.get(&proxy.uuid).and_then(|h| doc.get(*h)) {
                None => report.missing_live.push(proxy.uuid),
                Some(node) if node.uuid() != Some(proxy.uuid) => report.mismatched.push(proxy.uuid),
                Some(_) => {}
            }
        }

        for (handle, node) in doc.iter() {
            if let Some(uuid) = node.uuid() {
                if !self.proxies.contains_key(&uuid) {
                    report.untracked.push(handle);
                }
            }
        }

        report.unresolved = self.unresolved();
        report.missing_live.sort();
        report.mismatched.sort();
        report.not_materialized.sort();

        for uuid in &report.missing_live {
            log::error!("Sanity: proxy {} has no live node", uuid);
        }
        for uuid in &report.mismatched {
            log::error!("Sanity: proxy {} bound to a node with another uuid", uuid);
        }
        for handle in &report.untracked {
            log::warn!("Sanity: tagged live node {:?} has no proxy", handle);
        }
        for uuid in &report.unresolved {
            log::warn!("Sanity: unresolved reference to {}", uuid);
        }
        for uuid in &report.not_materialized {
            log::warn!("Sanity: datablock {} has no live node (missing resource)", uuid);
        }
        report
    }
}
