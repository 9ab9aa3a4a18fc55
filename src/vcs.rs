//! the version control orchestrator
//!
//! owns the revision graph, the head, the stashes, the store key and the
//! merge counter. every operation that writes live items receives the host's
//! item source explicitly and either completes or leaves graph, head and
//! items exactly as they were. observers get one [`ChangeEvent`] per
//! completed operation.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::mpsc;

use serde::{Deserialize, Serialize};

use crate::client::{CancelToken, Client, PendingPull};
use crate::error::{Error, Result};
use crate::graph::RevisionGraph;
use crate::hash::Hash;
use crate::head::{changes_to_deltas, Head, Selection};
use crate::item::TrackedItemsSource;
use crate::journal::{plan_reset, write_items, ItemWrite};
use crate::key::Key;
use crate::merge::{self, ConflictPolicy, MergeReport, VersionCounter};
use crate::pack::Pack;
use crate::stash::StashesRepository;
use crate::types::{ChangeKind, DeltaSet, ItemChange, ItemId, Revision};

const STATE_VERSION: u32 = 1;

/// notification sent after a completed operation
#[derive(Clone, Debug, PartialEq)]
pub enum ChangeEvent {
    Committed { revision: Hash },
    CheckedOut { revision: Hash, items: Vec<ItemId> },
    ChangesReset { items: Vec<ItemId> },
    CherryPicked { revision: Hash, items: Vec<ItemId> },
    Stashed { name: String },
    StashApplied { name: Option<String>, items: Vec<ItemId> },
    StashDropped { name: String },
    HeadMoved { revision: Hash },
    Amended { revision: Hash },
    Merged { head: Hash, items: Vec<ItemId>, conflicts: Vec<ItemId> },
    HistoryReset,
}

/// which stash to apply
#[derive(Clone, Debug)]
pub enum StashRef<'a> {
    Name(&'a str),
    Revision(&'a Revision),
}

/// persisted form of a store's history
#[derive(Serialize, Deserialize)]
struct State {
    format: u32,
    public_id: String,
    key: String,
    history_merge_version: u64,
    head: Hash,
    /// parents before children
    revisions: Vec<Revision>,
    #[serde(default)]
    stashes: StashesRepository,
}

pub struct VersionControl {
    key: Key,
    graph: RevisionGraph,
    head: Head,
    stashes: StashesRepository,
    history_merge_version: u64,
    policy: Box<dyn ConflictPolicy + Send + Sync>,
    subscribers: Vec<mpsc::Sender<ChangeEvent>>,
}

impl fmt::Debug for VersionControl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VersionControl")
            .field("public_id", &self.key.public_id())
            .field("head", &self.head.revision())
            .field("revisions", &self.graph.len())
            .field("stashes", &self.stashes.len())
            .field("history_merge_version", &self.history_merge_version)
            .finish()
    }
}

impl Default for VersionControl {
    fn default() -> Self {
        Self::new()
    }
}

impl VersionControl {
    /// empty history with a freshly generated key
    pub fn new() -> Self {
        Self::with_key(Key::generate())
    }

    /// empty history with the given key
    pub fn with_key(key: Key) -> Self {
        let graph = RevisionGraph::new();
        let head = Head::new(graph.root_id());
        Self {
            key,
            graph,
            head,
            stashes: StashesRepository::new(),
            history_merge_version: 0,
            policy: Box::new(VersionCounter),
            subscribers: Vec::new(),
        }
    }

    pub fn set_policy(&mut self, policy: Box<dyn ConflictPolicy + Send + Sync>) {
        self.policy = policy;
    }

    pub fn key(&self) -> &Key {
        &self.key
    }

    pub fn graph(&self) -> &RevisionGraph {
        &self.graph
    }

    pub fn head(&self) -> Hash {
        self.head.revision()
    }

    pub fn stashes(&self) -> &StashesRepository {
        &self.stashes
    }

    pub fn history_merge_version(&self) -> u64 {
        self.history_merge_version
    }

    /// channel receiving one event per completed operation
    pub fn subscribe(&mut self) -> mpsc::Receiver<ChangeEvent> {
        let (tx, rx) = mpsc::channel();
        self.subscribers.push(tx);
        rx
    }

    fn notify(&mut self, event: ChangeEvent) {
        self.subscribers.retain(|tx| tx.send(event.clone()).is_ok());
    }

    // -- inspection --

    pub fn revision(&self, id: &Hash) -> Result<&Revision> {
        self.graph.revision(id)
    }

    /// resolve a full id or unique prefix
    pub fn resolve(&self, rev: &str) -> Result<Hash> {
        self.graph.resolve(rev)
    }

    /// history from `from` (default: head) back to the root
    pub fn log(&self, from: Option<Hash>, max_count: Option<usize>) -> Result<Vec<&Revision>> {
        self.graph.log(&from.unwrap_or(self.head.revision()), max_count)
    }

    /// live changes of the selected items against the head
    pub fn status(
        &self,
        source: &dyn TrackedItemsSource,
        selection: &Selection,
    ) -> Result<Vec<ItemChange>> {
        self.head.diff(&self.graph, source, selection)
    }

    /// digest over every revision id; equal on peers with equal histories
    pub fn fingerprint(&self) -> Hash {
        self.graph.fingerprint()
    }

    // -- commit / checkout --

    /// record the selected live changes as a child of the head
    pub fn commit(
        &mut self,
        source: &dyn TrackedItemsSource,
        selection: &Selection,
        message: &str,
    ) -> Result<Hash> {
        let changes = self.status(source, selection)?;
        if changes.is_empty() {
            return Err(Error::NoChanges);
        }

        let item_count = changes.len();
        let revision = Revision::new(Some(self.head.revision()), changes_to_deltas(changes), message);
        let id = revision.id;
        self.graph.insert(revision)?;
        self.head.move_to(id);

        tracing::info!(revision = %id.short(), items = item_count, "committed");
        self.notify(ChangeEvent::Committed { revision: id });
        Ok(id)
    }

    /// make the live items match `revision` and move the head there
    pub fn checkout(&mut self, source: &mut dyn TrackedItemsSource, revision: &Hash) -> Result<()> {
        let state = self.graph.state_at(revision)?;
        let plan = plan_reset(source, &state, |_| true);
        let items = write_items(source, plan)?;
        self.head.move_to(*revision);

        tracing::info!(revision = %revision.short(), items = items.len(), "checked out");
        self.notify(ChangeEvent::CheckedOut {
            revision: *revision,
            items,
        });
        Ok(())
    }

    /// discard live changes of the selected items
    pub fn reset_changes(
        &mut self,
        source: &mut dyn TrackedItemsSource,
        selection: &Selection,
    ) -> Result<Vec<ItemId>> {
        let items = self.reset_selected(source, selection)?;
        tracing::info!(items = items.len(), "reset changes");
        self.notify(ChangeEvent::ChangesReset {
            items: items.clone(),
        });
        Ok(items)
    }

    pub fn reset_all_changes(&mut self, source: &mut dyn TrackedItemsSource) -> Result<Vec<ItemId>> {
        self.reset_changes(source, &Selection::All)
    }

    fn reset_selected(
        &self,
        source: &mut dyn TrackedItemsSource,
        selection: &Selection,
    ) -> Result<Vec<ItemId>> {
        let state = self.graph.state_at(&self.head.revision())?;
        let plan = plan_reset(source, &state, |id| selection.contains(id));
        write_items(source, plan)
    }

    /// patch the given items with the deltas `revision` carries for them
    ///
    /// the head does not move; items the revision does not touch are skipped.
    pub fn cherry_pick(
        &mut self,
        source: &mut dyn TrackedItemsSource,
        revision: &Hash,
        items: &[ItemId],
    ) -> Result<Vec<ItemId>> {
        let picked = self.graph.revision(revision)?;
        let plan: BTreeMap<ItemId, ItemWrite> = items
            .iter()
            .filter_map(|id| picked.deltas.get(id).map(|d| (id.clone(), ItemWrite::patch(d))))
            .collect();

        let touched = write_items(source, plan)?;
        tracing::info!(revision = %revision.short(), items = touched.len(), "cherry-picked");
        self.notify(ChangeEvent::CherryPicked {
            revision: *revision,
            items: touched.clone(),
        });
        Ok(touched)
    }

    /// move the head without touching live items
    pub fn move_head(&mut self, revision: &Hash) -> Result<()> {
        self.graph.revision(revision)?;
        self.head.move_to(*revision);
        tracing::debug!(revision = %revision.short(), "moved head");
        self.notify(ChangeEvent::HeadMoved {
            revision: *revision,
        });
        Ok(())
    }

    /// fold one item's live changes into the head revision
    ///
    /// the head revision itself is immutable: a sibling with the merged
    /// deltas replaces it as head. children of the old head stay where they
    /// are.
    pub fn amend(&mut self, source: &dyn TrackedItemsSource, item: &ItemId) -> Result<Hash> {
        let current = self.graph.revision(&self.head.revision())?.clone();
        let Some(parent) = current.parent else {
            return Err(Error::CannotAmendRoot);
        };

        let change = self
            .status(source, &Selection::items([item.clone()]))?
            .into_iter()
            .next()
            .ok_or(Error::NoChanges)?;

        let mut deltas = current.deltas;
        let overlay = change.kind == ChangeKind::Modified
            && deltas.get(item).is_some_and(|d| !d.is_removal());
        if overlay {
            if let Some(existing) = deltas.get_mut(item) {
                existing.overlay(&change.deltas);
            }
        } else {
            deltas.insert(item.clone(), change.deltas);
        }

        let amended = Revision::new(Some(parent), deltas, current.message);
        let id = amended.id;
        self.graph.insert(amended)?;
        self.head.move_to(id);

        tracing::info!(item = %item, revision = %id.short(), "amended head");
        self.notify(ChangeEvent::Amended { revision: id });
        Ok(id)
    }

    // -- stashes --

    /// set the selected live changes aside under `name` (default: a uuid)
    pub fn stash(
        &mut self,
        source: &mut dyn TrackedItemsSource,
        selection: &Selection,
        message: &str,
        keep_changes: bool,
        name: Option<&str>,
    ) -> Result<String> {
        let revision = self.stash_revision(source, selection, message)?;
        let name = name
            .map(str::to_string)
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        self.stashes.add(name.clone(), revision)?;

        if !keep_changes {
            if let Err(e) = self.reset_selected(source, selection) {
                let _ = self.stashes.remove(&name);
                return Err(e);
            }
        }

        tracing::info!(stash = %name, keep_changes, "stashed changes");
        self.notify(ChangeEvent::Stashed { name: name.clone() });
        Ok(name)
    }

    fn stash_revision(
        &self,
        source: &dyn TrackedItemsSource,
        selection: &Selection,
        message: &str,
    ) -> Result<Revision> {
        let changes = self.status(source, selection)?;
        if changes.is_empty() {
            return Err(Error::NoChanges);
        }
        Ok(Revision::new(
            Some(self.head.revision()),
            changes_to_deltas(changes),
            message,
        ))
    }

    /// patch a stash onto the live items, dropping it unless `keep_stash`
    pub fn apply_stash(
        &mut self,
        source: &mut dyn TrackedItemsSource,
        stash: StashRef<'_>,
        keep_stash: bool,
    ) -> Result<Vec<ItemId>> {
        let (name, revision) = match stash {
            StashRef::Name(name) => (Some(name.to_string()), self.stashes.get(name)?.clone()),
            StashRef::Revision(revision) => (
                self.stashes.find(revision).map(str::to_string),
                revision.clone(),
            ),
        };

        let items = write_items(source, patch_plan(&revision))?;
        if !keep_stash {
            if let Some(name) = &name {
                self.stashes.remove(name)?;
            }
        }

        tracing::info!(stash = ?name, items = items.len(), keep_stash, "applied stash");
        self.notify(ChangeEvent::StashApplied {
            name,
            items: items.clone(),
        });
        Ok(items)
    }

    pub fn drop_stash(&mut self, name: &str) -> Result<()> {
        self.stashes.remove(name)?;
        tracing::info!(stash = %name, "dropped stash");
        self.notify(ChangeEvent::StashDropped {
            name: name.to_string(),
        });
        Ok(())
    }

    pub fn stash_names(&self) -> Vec<String> {
        self.stashes.names()
    }

    pub fn stash_names_matching(&self, pattern: &str) -> Result<Vec<String>> {
        self.stashes.names_matching(pattern)
    }

    /// stash every live change into the single quick slot and reset
    pub fn quick_stash_all(&mut self, source: &mut dyn TrackedItemsSource) -> Result<()> {
        let revision = self.stash_revision(source, &Selection::All, "quick stash")?;
        self.reset_selected(source, &Selection::All)?;
        if self.stashes.set_quick_stash(revision).is_some() {
            tracing::debug!("replaced previous quick stash");
        }

        tracing::info!("quick-stashed all changes");
        self.notify(ChangeEvent::Stashed {
            name: "quick".to_string(),
        });
        Ok(())
    }

    pub fn has_quick_stash(&self) -> bool {
        self.stashes.has_quick_stash()
    }

    /// restore the quick stash and empty the slot
    pub fn apply_quick_stash(&mut self, source: &mut dyn TrackedItemsSource) -> Result<Vec<ItemId>> {
        let revision = self.stashes.quick_stash().ok_or(Error::NoQuickStash)?.clone();
        let items = write_items(source, patch_plan(&revision))?;
        self.stashes.take_quick_stash();

        tracing::info!(items = items.len(), "applied quick stash");
        self.notify(ChangeEvent::StashApplied {
            name: None,
            items: items.clone(),
        });
        Ok(items)
    }

    // -- merge & sync --

    /// pack of the whole history, addressed to `recipient`
    pub fn encode_pack(&self, recipient: &str) -> Result<Vec<u8>> {
        Pack::from_graph(&self.graph, self.key.public_id(), self.history_merge_version)
            .encode(&self.key, recipient)
    }

    /// merge an already decoded pack
    pub fn merge_pack(
        &mut self,
        source: &mut dyn TrackedItemsSource,
        pack: &Pack,
    ) -> Result<MergeReport> {
        let remote = pack.to_graph()?;
        self.merge_graph(source, &remote, pack.history_merge_version)
    }

    /// merge directly with another in-process history
    pub fn merge_with_history(
        &mut self,
        source: &mut dyn TrackedItemsSource,
        other: &VersionControl,
    ) -> Result<MergeReport> {
        self.merge_graph(source, &other.graph, other.history_merge_version)
    }

    /// pull from the relay and merge
    ///
    /// returns `None` when the relay holds nothing for this store.
    /// cancellation is honoured until the merge itself starts.
    pub fn merge_with(
        &mut self,
        source: &mut dyn TrackedItemsSource,
        client: &Client,
        cancel: &CancelToken,
    ) -> Result<Option<MergeReport>> {
        cancel.check()?;
        let Some(bytes) = client.fetch(self.key.public_id())? else {
            return Ok(None);
        };
        cancel.check()?;
        let pack = Pack::decode(&bytes, &self.key)?;
        cancel.check()?;
        self.merge_pack(source, &pack).map(Some)
    }

    /// merge the result of a background pull
    pub fn merge_pending(
        &mut self,
        source: &mut dyn TrackedItemsSource,
        pending: PendingPull,
    ) -> Result<Option<MergeReport>> {
        match pending.wait()? {
            Some(pack) => self.merge_pack(source, &pack).map(Some),
            None => Ok(None),
        }
    }

    /// publish the whole history to the relay
    pub fn push(&self, client: &Client) -> Result<()> {
        let bytes = self.encode_pack(self.key.public_id())?;
        client.push(&self.key, &bytes)
    }

    /// pull, merge, then push the merged history back
    ///
    /// a failed push leaves the local merge in place.
    pub fn sync(
        &mut self,
        source: &mut dyn TrackedItemsSource,
        client: &Client,
        cancel: &CancelToken,
    ) -> Result<Option<MergeReport>> {
        let report = self.merge_with(source, client, cancel)?;
        self.push(client)?;
        Ok(report)
    }

    fn merge_graph(
        &mut self,
        source: &mut dyn TrackedItemsSource,
        remote: &RevisionGraph,
        remote_version: u64,
    ) -> Result<MergeReport> {
        let outcome = merge::merge(
            &self.graph,
            remote,
            self.head.revision(),
            self.history_merge_version,
            remote_version,
            self.policy.as_ref(),
        )?;

        let old_state = self.graph.state_at(&self.head.revision())?;
        let new_state = outcome.graph.state_at(&outcome.head)?;
        let mut plan = BTreeMap::new();
        for id in old_state.keys().chain(new_state.keys()) {
            match (old_state.get(id), new_state.get(id)) {
                (old, Some(new)) if old != Some(new) => {
                    plan.insert(id.clone(), ItemWrite::Reset(new.clone()));
                }
                (Some(_), None) => {
                    plan.insert(id.clone(), ItemWrite::Delete);
                }
                _ => {}
            }
        }
        let live: &dyn TrackedItemsSource = source;
        let dirty: Vec<ItemId> = plan
            .keys()
            .filter(|id| has_live_edits(live, id, old_state.get(*id)))
            .cloned()
            .collect();
        if !dirty.is_empty() {
            tracing::warn!(items = dirty.len(), "merge blocked by uncommitted changes");
            return Err(Error::UncommittedChanges(dirty));
        }

        let items = write_items(source, plan)?;

        self.graph = outcome.graph;
        self.head.move_to(outcome.head);
        self.history_merge_version += 1;

        tracing::info!(
            head = %outcome.head.short(),
            items = items.len(),
            conflicts = outcome.report.conflicts.len(),
            version = self.history_merge_version,
            "installed merge"
        );
        self.notify(ChangeEvent::Merged {
            head: outcome.head,
            items,
            conflicts: outcome.report.conflicts.clone(),
        });
        Ok(outcome.report)
    }

    /// forget all history and stashes; the key is kept
    pub fn reset(&mut self) {
        self.graph = RevisionGraph::new();
        self.head = Head::new(self.graph.root_id());
        self.stashes.clear();
        self.history_merge_version = 0;
        tracing::info!("history reset");
        self.notify(ChangeEvent::HistoryReset);
    }

    // -- persistence --

    /// CBOR encoding of the whole store state, key included
    pub fn serialize(&self) -> Result<Vec<u8>> {
        let state = State {
            format: STATE_VERSION,
            public_id: self.key.public_id().to_string(),
            key: self.key.secret_base64(),
            history_merge_version: self.history_merge_version,
            head: self.head.revision(),
            revisions: self.graph.revisions().into_iter().cloned().collect(),
            stashes: self.stashes.clone(),
        };
        let mut bytes = Vec::new();
        ciborium::into_writer(&state, &mut bytes)?;
        Ok(bytes)
    }

    /// restore from [`serialize`](Self::serialize) output, re-verifying every id
    pub fn deserialize(bytes: &[u8]) -> Result<Self> {
        let state: State = ciborium::from_reader(bytes)?;
        if state.format != STATE_VERSION {
            return Err(Error::CorruptHistory(format!(
                "unsupported state format {}",
                state.format
            )));
        }

        let key = Key::from_base64(state.public_id, &state.key)?;
        let graph = RevisionGraph::from_revisions(state.revisions)?;
        graph.revision(&state.head)?;

        for (_, revision) in state.stashes.iter() {
            if !revision.verify() {
                return Err(Error::CorruptRevision(revision.id));
            }
        }
        if let Some(quick) = state.stashes.quick_stash() {
            if !quick.verify() {
                return Err(Error::CorruptRevision(quick.id));
            }
        }

        Ok(Self {
            key,
            head: Head::new(state.head),
            graph,
            stashes: state.stashes,
            history_merge_version: state.history_merge_version,
            policy: Box::new(VersionCounter),
            subscribers: Vec::new(),
        })
    }
}

/// live item differs from its state at head
fn has_live_edits(source: &dyn TrackedItemsSource, id: &ItemId, at_head: Option<&DeltaSet>) -> bool {
    match (source.item(id), at_head) {
        (Some(item), Some(state)) => !item.diff_against(state).is_empty(),
        (Some(_), None) | (None, Some(_)) => true,
        (None, None) => false,
    }
}

fn patch_plan(revision: &Revision) -> BTreeMap<ItemId, ItemWrite> {
    revision
        .deltas
        .iter()
        .map(|(id, deltas)| (id.clone(), ItemWrite::patch(deltas)))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::MemoryTransport;
    use crate::types::DeltaSet;
    use crate::workspace::{SectionItem, Workspace};
    use ciborium::Value;

    fn set(ws: &mut Workspace, id: &str, field: &str, value: i64) {
        match ws.section_mut(id) {
            Some(section) => section.set(field, value),
            None => ws.insert(SectionItem::new(id).with_field(field, value)),
        }
    }

    fn field(ws: &Workspace, id: &str, name: &str) -> Option<Value> {
        ws.section(id).and_then(|s| s.get(name).cloned())
    }

    fn item(id: &str) -> ItemId {
        ItemId::from(id)
    }

    #[test]
    fn test_commit_advances_head() {
        let mut vc = VersionControl::new();
        let mut ws = Workspace::new();
        set(&mut ws, "doc", "v", 1);

        let id = vc.commit(&ws, &Selection::All, "first").unwrap();
        assert_eq!(vc.head(), id);

        let rev = vc.revision(&id).unwrap();
        assert_eq!(rev.parent, Some(vc.graph().root_id()));
        assert_eq!(rev.message, "first");
        assert!(rev.verify());
        assert!(vc.status(&ws, &Selection::All).unwrap().is_empty());
    }

    #[test]
    fn test_commit_without_changes() {
        let mut vc = VersionControl::new();
        let ws = Workspace::new();
        assert!(matches!(
            vc.commit(&ws, &Selection::All, "empty"),
            Err(Error::NoChanges)
        ));
    }

    #[test]
    fn test_commit_selection_only() {
        let mut vc = VersionControl::new();
        let mut ws = Workspace::new();
        set(&mut ws, "a", "v", 1);
        set(&mut ws, "b", "v", 1);

        let id = vc.commit(&ws, &Selection::items(["a"]), "only a").unwrap();
        let rev = vc.revision(&id).unwrap();
        assert!(rev.touches(&item("a")));
        assert!(!rev.touches(&item("b")));

        let pending = vc.status(&ws, &Selection::All).unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].item, item("b"));
    }

    #[test]
    fn test_commit_then_checkout_reproduces_state() {
        let mut vc = VersionControl::new();
        let mut ws = Workspace::new();
        set(&mut ws, "doc", "v", 1);
        set(&mut ws, "other", "v", 7);
        let first = vc.commit(&ws, &Selection::All, "first").unwrap();
        let snapshot = ws.clone();

        set(&mut ws, "doc", "v", 2);
        ws.remove("other");
        set(&mut ws, "new", "v", 3);
        let second = vc.commit(&ws, &Selection::All, "second").unwrap();
        let later = ws.clone();

        vc.checkout(&mut ws, &first).unwrap();
        assert_eq!(ws, snapshot);
        assert_eq!(vc.head(), first);

        vc.checkout(&mut ws, &second).unwrap();
        assert_eq!(ws, later);
    }

    #[test]
    fn test_self_checkout_is_noop() {
        let mut vc = VersionControl::new();
        let mut ws = Workspace::new();
        set(&mut ws, "doc", "v", 1);
        let id = vc.commit(&ws, &Selection::All, "first").unwrap();
        let before = ws.clone();
        let events = vc.subscribe();

        vc.checkout(&mut ws, &id).unwrap();
        assert_eq!(ws, before);
        assert_eq!(
            events.try_recv().unwrap(),
            ChangeEvent::CheckedOut {
                revision: id,
                items: vec![]
            }
        );
    }

    #[test]
    fn test_checkout_failure_rolls_back() {
        let mut vc = VersionControl::new();
        let mut ws = Workspace::new();
        set(&mut ws, "a", "v", 1);
        set(&mut ws, "doc", "v", 1);
        let first = vc.commit(&ws, &Selection::All, "first").unwrap();
        set(&mut ws, "a", "v", 2);
        set(&mut ws, "doc", "v", 2);
        let second = vc.commit(&ws, &Selection::All, "second").unwrap();

        ws.section_mut("doc").unwrap().set_locked(true);
        let before = ws.clone();

        let result = vc.checkout(&mut ws, &first);
        assert!(matches!(result, Err(Error::ItemApply { .. })));
        assert_eq!(ws, before);
        assert_eq!(vc.head(), second);
    }

    #[test]
    fn test_checkout_unknown_revision() {
        let mut vc = VersionControl::new();
        let mut ws = Workspace::new();
        let missing = Hash::from_bytes([5u8; 32]);
        assert!(matches!(
            vc.checkout(&mut ws, &missing),
            Err(Error::RevisionNotFound(_))
        ));
    }

    #[test]
    fn test_reset_changes() {
        let mut vc = VersionControl::new();
        let mut ws = Workspace::new();
        set(&mut ws, "a", "v", 1);
        set(&mut ws, "b", "v", 1);
        vc.commit(&ws, &Selection::All, "base").unwrap();

        set(&mut ws, "a", "v", 2);
        set(&mut ws, "b", "v", 2);
        set(&mut ws, "c", "v", 2);

        let reset = vc.reset_changes(&mut ws, &Selection::items(["a", "c"])).unwrap();
        assert_eq!(reset, vec![item("a"), item("c")]);
        assert_eq!(field(&ws, "a", "v"), Some(Value::from(1)));
        assert_eq!(field(&ws, "b", "v"), Some(Value::from(2)));
        assert!(ws.section("c").is_none());

        vc.reset_all_changes(&mut ws).unwrap();
        assert!(vc.status(&ws, &Selection::All).unwrap().is_empty());
    }

    #[test]
    fn test_cherry_pick_changes_only_selected_item() {
        let mut vc = VersionControl::new();
        let mut ws = Workspace::new();
        set(&mut ws, "a", "v", 1);
        set(&mut ws, "b", "v", 1);
        let base = vc.commit(&ws, &Selection::All, "base").unwrap();

        set(&mut ws, "a", "v", 2);
        set(&mut ws, "b", "v", 2);
        let both = vc.commit(&ws, &Selection::All, "both").unwrap();

        vc.checkout(&mut ws, &base).unwrap();
        let picked = vc.cherry_pick(&mut ws, &both, &[item("a")]).unwrap();

        assert_eq!(picked, vec![item("a")]);
        assert_eq!(field(&ws, "a", "v"), Some(Value::from(2)));
        assert_eq!(field(&ws, "b", "v"), Some(Value::from(1)));
        assert_eq!(vc.head(), base);
    }

    #[test]
    fn test_cherry_pick_failure_rolls_back() {
        let mut vc = VersionControl::new();
        let mut ws = Workspace::new();
        set(&mut ws, "a", "v", 1);
        set(&mut ws, "b", "v", 1);
        let base = vc.commit(&ws, &Selection::All, "base").unwrap();
        set(&mut ws, "a", "v", 2);
        set(&mut ws, "b", "v", 2);
        let both = vc.commit(&ws, &Selection::All, "both").unwrap();
        vc.checkout(&mut ws, &base).unwrap();

        ws.section_mut("b").unwrap().set_locked(true);
        let before = ws.clone();
        let result = vc.cherry_pick(&mut ws, &both, &[item("a"), item("b")]);
        assert!(matches!(result, Err(Error::ItemApply { .. })));
        assert_eq!(ws, before);
    }

    #[test]
    fn test_stash_and_apply() {
        let mut vc = VersionControl::new();
        let mut ws = Workspace::new();
        set(&mut ws, "doc", "v", 1);
        vc.commit(&ws, &Selection::All, "base").unwrap();

        set(&mut ws, "doc", "v", 2);
        set(&mut ws, "extra", "v", 5);
        let name = vc
            .stash(&mut ws, &Selection::All, "wip", false, Some("wip"))
            .unwrap();
        assert_eq!(name, "wip");
        assert_eq!(field(&ws, "doc", "v"), Some(Value::from(1)));
        assert!(ws.section("extra").is_none());
        assert!(vc.status(&ws, &Selection::All).unwrap().is_empty());

        vc.apply_stash(&mut ws, StashRef::Name("wip"), false).unwrap();
        assert_eq!(field(&ws, "doc", "v"), Some(Value::from(2)));
        assert_eq!(field(&ws, "extra", "v"), Some(Value::from(5)));
        assert!(vc.stash_names().is_empty());
    }

    #[test]
    fn test_stash_keep_changes_and_names() {
        let mut vc = VersionControl::new();
        let mut ws = Workspace::new();
        set(&mut ws, "doc", "v", 1);

        let generated = vc.stash(&mut ws, &Selection::All, "keep", true, None).unwrap();
        assert!(uuid::Uuid::parse_str(&generated).is_ok());
        assert_eq!(field(&ws, "doc", "v"), Some(Value::from(1)));

        vc.stash(&mut ws, &Selection::All, "named", true, Some("feature/x"))
            .unwrap();
        assert!(matches!(
            vc.stash(&mut ws, &Selection::All, "again", true, Some("feature/x")),
            Err(Error::StashExists(_))
        ));
        assert_eq!(vc.stash_names_matching("feature/*").unwrap(), vec!["feature/x"]);

        vc.apply_stash(&mut ws, StashRef::Name("feature/x"), true).unwrap();
        assert!(vc.stashes().contains("feature/x"));

        vc.drop_stash("feature/x").unwrap();
        assert!(matches!(vc.drop_stash("feature/x"), Err(Error::StashNotFound(_))));
    }

    #[test]
    fn test_apply_stash_by_revision() {
        let mut vc = VersionControl::new();
        let mut ws = Workspace::new();
        set(&mut ws, "doc", "v", 1);
        vc.stash(&mut ws, &Selection::All, "wip", false, Some("wip")).unwrap();
        assert!(ws.is_empty());

        let revision = vc.stashes().get("wip").unwrap().clone();
        vc.apply_stash(&mut ws, StashRef::Revision(&revision), false).unwrap();
        assert_eq!(field(&ws, "doc", "v"), Some(Value::from(1)));
        assert!(!vc.stashes().contains("wip"));
    }

    #[test]
    fn test_quick_stash() {
        let mut vc = VersionControl::new();
        let mut ws = Workspace::new();
        assert!(matches!(vc.apply_quick_stash(&mut ws), Err(Error::NoQuickStash)));

        set(&mut ws, "doc", "v", 1);
        vc.quick_stash_all(&mut ws).unwrap();
        assert!(vc.has_quick_stash());
        assert!(ws.is_empty());

        set(&mut ws, "doc", "v", 2);
        vc.quick_stash_all(&mut ws).unwrap();

        vc.apply_quick_stash(&mut ws).unwrap();
        assert_eq!(field(&ws, "doc", "v"), Some(Value::from(2)));
        assert!(!vc.has_quick_stash());
    }

    #[test]
    fn test_move_head() {
        let mut vc = VersionControl::new();
        let mut ws = Workspace::new();
        set(&mut ws, "doc", "v", 1);
        vc.commit(&ws, &Selection::All, "first").unwrap();

        let root = vc.graph().root_id();
        vc.move_head(&root).unwrap();
        assert_eq!(vc.head(), root);
        // live items are untouched, so the doc now shows as added
        assert_eq!(vc.status(&ws, &Selection::All).unwrap()[0].kind, ChangeKind::Added);

        assert!(matches!(
            vc.move_head(&Hash::from_bytes([1u8; 32])),
            Err(Error::RevisionNotFound(_))
        ));
    }

    #[test]
    fn test_amend() {
        let mut vc = VersionControl::new();
        let mut ws = Workspace::new();
        assert!(matches!(vc.amend(&ws, &item("doc")), Err(Error::CannotAmendRoot)));

        set(&mut ws, "doc", "v", 1);
        set(&mut ws, "doc", "w", 1);
        let first = vc.commit(&ws, &Selection::All, "first").unwrap();

        set(&mut ws, "doc", "v", 2);
        let amended = vc.amend(&ws, &item("doc")).unwrap();

        assert_ne!(amended, first);
        let rev = vc.revision(&amended).unwrap();
        assert_eq!(rev.parent, vc.revision(&first).unwrap().parent);
        assert_eq!(rev.message, "first");
        assert_eq!(
            rev.deltas[&item("doc")],
            DeltaSet::new().with("v", 2).with("w", 1)
        );
        assert!(vc.status(&ws, &Selection::All).unwrap().is_empty());
        assert!(matches!(vc.amend(&ws, &item("doc")), Err(Error::NoChanges)));
    }

    #[test]
    fn test_merge_fast_forward() {
        let key = Key::generate();
        let mut a = VersionControl::with_key(key.clone());
        let mut b = VersionControl::with_key(key);
        let mut ws_a = Workspace::new();
        let mut ws_b = Workspace::new();

        set(&mut ws_b, "doc", "v", 1);
        let tip = b.commit(&ws_b, &Selection::All, "remote work").unwrap();

        let report = a.merge_with_history(&mut ws_a, &b).unwrap();
        assert!(report.conflicts.is_empty());
        assert!(report.is_fast_forward());
        assert_eq!(a.head(), tip);
        assert_eq!(a.graph(), b.graph());
        assert_eq!(field(&ws_a, "doc", "v"), Some(Value::from(1)));
        assert_eq!(a.history_merge_version(), 1);
    }

    #[test]
    fn test_two_peers_converge() {
        let key = Key::generate();
        let mut a = VersionControl::with_key(key.clone());
        let mut b = VersionControl::with_key(key.clone());
        let mut ws_a = Workspace::new();
        let mut ws_b = Workspace::new();

        set(&mut ws_a, "item1", "text", 1);
        a.commit(&ws_a, &Selection::All, "A").unwrap();
        set(&mut ws_b, "item2", "text", 2);
        b.commit(&ws_b, &Selection::All, "B").unwrap();

        let pack_a = Pack::decode(&a.encode_pack(key.public_id()).unwrap(), &key).unwrap();
        let pack_b = Pack::decode(&b.encode_pack(key.public_id()).unwrap(), &key).unwrap();

        let report_a = a.merge_pack(&mut ws_a, &pack_b).unwrap();
        let report_b = b.merge_pack(&mut ws_b, &pack_a).unwrap();

        assert!(report_a.conflicts.is_empty());
        assert_eq!(report_a.merge_nodes, report_b.merge_nodes);
        assert_eq!(a.head(), b.head());
        assert_eq!(a.fingerprint(), b.fingerprint());
        assert_eq!(a.graph(), b.graph());

        let node = a.revision(&a.head()).unwrap();
        assert_eq!(node.parent, Some(a.graph().root_id()));
        assert_eq!(node.deltas.len(), 2);

        // both workspaces now hold both items
        assert_eq!(ws_a, ws_b);
        assert_eq!(field(&ws_a, "item2", "text"), Some(Value::from(2)));
    }

    #[test]
    fn test_sync_through_relay() {
        let key = Key::generate();
        let relay = MemoryTransport::new();
        let client = Client::new(relay);
        let cancel = CancelToken::new();

        let mut a = VersionControl::with_key(key.clone());
        let mut b = VersionControl::with_key(key);
        let mut ws_a = Workspace::new();
        let mut ws_b = Workspace::new();

        set(&mut ws_a, "item1", "text", 1);
        a.commit(&ws_a, &Selection::All, "A").unwrap();
        set(&mut ws_b, "item2", "text", 2);
        b.commit(&ws_b, &Selection::All, "B").unwrap();

        assert!(a.sync(&mut ws_a, &client, &cancel).unwrap().is_none());
        let report = b.sync(&mut ws_b, &client, &cancel).unwrap().unwrap();
        assert_eq!(report.merge_nodes.len(), 1);
        a.sync(&mut ws_a, &client, &cancel).unwrap().unwrap();

        assert_eq!(a.fingerprint(), b.fingerprint());
        assert_eq!(a.head(), b.head());
        assert_eq!(ws_a, ws_b);
    }

    #[test]
    fn test_merge_conflict_prefers_higher_version() {
        let key = Key::generate();
        let mut a = VersionControl::with_key(key.clone());
        let mut b = VersionControl::with_key(key);
        let mut ws_a = Workspace::new();
        let mut ws_b = Workspace::new();

        // b has merged once before, so it carries the higher counter
        b.merge_with_history(&mut ws_b, &VersionControl::new()).unwrap();

        set(&mut ws_a, "doc", "v", 1);
        a.commit(&ws_a, &Selection::All, "a").unwrap();
        set(&mut ws_b, "doc", "v", 2);
        b.commit(&ws_b, &Selection::All, "b").unwrap();

        let report = a.merge_with_history(&mut ws_a, &b).unwrap();
        assert_eq!(report.conflicts, vec![item("doc")]);
        assert_eq!(field(&ws_a, "doc", "v"), Some(Value::from(2)));
    }

    #[test]
    fn test_merge_failure_leaves_state() {
        let key = Key::generate();
        let mut a = VersionControl::with_key(key.clone());
        let mut b = VersionControl::with_key(key);
        let mut ws_a = Workspace::new();
        let mut ws_b = Workspace::new();
        b.merge_with_history(&mut ws_b, &VersionControl::new()).unwrap();

        set(&mut ws_a, "doc", "v", 1);
        a.commit(&ws_a, &Selection::All, "a").unwrap();
        set(&mut ws_b, "doc", "v", 1);
        set(&mut ws_b, "doc", "w", 9);
        b.commit(&ws_b, &Selection::All, "b").unwrap();

        ws_a.section_mut("doc").unwrap().set_locked(true);
        let before = ws_a.clone();
        let head = a.head();
        let fingerprint = a.fingerprint();

        let result = a.merge_with_history(&mut ws_a, &b);
        assert!(matches!(result, Err(Error::ItemApply { .. })));
        assert_eq!(ws_a, before);
        assert_eq!(a.head(), head);
        assert_eq!(a.fingerprint(), fingerprint);
        assert_eq!(a.history_merge_version(), 0);
    }

    #[test]
    fn test_merge_refuses_to_overwrite_live_edits() {
        let key = Key::generate();
        let mut a = VersionControl::with_key(key.clone());
        let mut b = VersionControl::with_key(key);
        let mut ws_a = Workspace::new();
        let mut ws_b = Workspace::new();

        set(&mut ws_a, "doc", "v", 1);
        a.commit(&ws_a, &Selection::All, "a").unwrap();
        b.merge_with_history(&mut ws_b, &a).unwrap();
        set(&mut ws_b, "doc", "v", 2);
        b.commit(&ws_b, &Selection::All, "b").unwrap();

        set(&mut ws_a, "doc", "v", 99);
        let head = a.head();
        let fingerprint = a.fingerprint();
        let events = a.subscribe();

        let result = a.merge_with_history(&mut ws_a, &b);
        assert!(matches!(
            result,
            Err(Error::UncommittedChanges(ref items)) if items == &vec![item("doc")]
        ));
        assert_eq!(field(&ws_a, "doc", "v"), Some(Value::from(99)));
        assert_eq!(a.head(), head);
        assert_eq!(a.fingerprint(), fingerprint);
        assert_eq!(a.history_merge_version(), 0);
        assert!(events.try_recv().is_err());

        // once the edit is discarded the merge goes through
        a.reset_all_changes(&mut ws_a).unwrap();
        a.merge_with_history(&mut ws_a, &b).unwrap();
        assert_eq!(field(&ws_a, "doc", "v"), Some(Value::from(2)));
    }

    #[test]
    fn test_merge_keeps_live_edits_on_untouched_items() {
        let key = Key::generate();
        let mut a = VersionControl::with_key(key.clone());
        let mut b = VersionControl::with_key(key);
        let mut ws_a = Workspace::new();
        let mut ws_b = Workspace::new();

        set(&mut ws_b, "doc", "v", 1);
        b.commit(&ws_b, &Selection::All, "b").unwrap();
        set(&mut ws_a, "notes", "v", 7);

        a.merge_with_history(&mut ws_a, &b).unwrap();
        assert_eq!(field(&ws_a, "doc", "v"), Some(Value::from(1)));
        assert_eq!(field(&ws_a, "notes", "v"), Some(Value::from(7)));
        assert_eq!(a.status(&ws_a, &Selection::All).unwrap().len(), 1);
    }

    #[test]
    fn test_transport_failure_leaves_state() {
        let relay = MemoryTransport::new();
        let client = Client::new(relay.clone());
        let mut vc = VersionControl::new();
        let mut ws = Workspace::new();
        set(&mut ws, "doc", "v", 1);
        vc.commit(&ws, &Selection::All, "a").unwrap();
        let fingerprint = vc.fingerprint();

        relay.set_offline(true);
        let result = vc.sync(&mut ws, &client, &CancelToken::new());
        assert!(matches!(result, Err(Error::Transport { .. })));
        assert_eq!(vc.fingerprint(), fingerprint);
        assert_eq!(vc.history_merge_version(), 0);
    }

    #[test]
    fn test_cancelled_merge() {
        let client = Client::new(MemoryTransport::new());
        let mut vc = VersionControl::new();
        let mut ws = Workspace::new();
        let cancel = CancelToken::new();
        cancel.cancel();

        assert!(matches!(
            vc.merge_with(&mut ws, &client, &cancel),
            Err(Error::Cancelled)
        ));
    }

    #[test]
    fn test_merge_pending_pull() {
        let key = Key::generate();
        let client = Client::new(MemoryTransport::new());
        let mut remote = VersionControl::with_key(key.clone());
        let mut ws_remote = Workspace::new();
        set(&mut ws_remote, "doc", "v", 4);
        remote.commit(&ws_remote, &Selection::All, "remote").unwrap();
        remote.push(&client).unwrap();

        let mut vc = VersionControl::with_key(key);
        let mut ws = Workspace::new();
        let pending = client.spawn_pull(vc.key());
        let report = vc.merge_pending(&mut ws, pending).unwrap().unwrap();

        assert!(report.is_fast_forward());
        assert_eq!(field(&ws, "doc", "v"), Some(Value::from(4)));
    }

    #[test]
    fn test_foreign_pack_fails_to_decrypt() {
        let client = Client::new(MemoryTransport::new());
        let owner = VersionControl::new();
        owner.push(&client).unwrap();

        let intruder_key = Key::from_bytes(owner.key().public_id(), [0u8; 32]);
        let mut intruder = VersionControl::with_key(intruder_key);
        let mut ws = Workspace::new();
        let result = intruder.merge_with(&mut ws, &client, &CancelToken::new());
        assert!(matches!(result, Err(Error::Decryption(_))));
    }

    #[test]
    fn test_events_once_per_operation() {
        let mut vc = VersionControl::new();
        let events = vc.subscribe();
        let mut ws = Workspace::new();
        set(&mut ws, "a", "v", 1);
        set(&mut ws, "b", "v", 1);

        let id = vc.commit(&ws, &Selection::All, "first").unwrap();
        set(&mut ws, "a", "v", 2);
        set(&mut ws, "b", "v", 2);
        vc.reset_all_changes(&mut ws).unwrap();

        let received: Vec<ChangeEvent> = events.try_iter().collect();
        assert_eq!(
            received,
            vec![
                ChangeEvent::Committed { revision: id },
                ChangeEvent::ChangesReset {
                    items: vec![item("a"), item("b")]
                },
            ]
        );

        // failed operations stay silent
        assert!(vc.commit(&ws, &Selection::All, "none").is_err());
        assert!(events.try_recv().is_err());
    }

    #[test]
    fn test_serialize_roundtrip() {
        let mut vc = VersionControl::new();
        let mut ws = Workspace::new();
        set(&mut ws, "doc", "v", 1);
        vc.commit(&ws, &Selection::All, "first").unwrap();
        set(&mut ws, "doc", "v", 2);
        vc.stash(&mut ws, &Selection::All, "wip", false, Some("wip")).unwrap();

        let restored = VersionControl::deserialize(&vc.serialize().unwrap()).unwrap();
        assert_eq!(restored.head(), vc.head());
        assert_eq!(restored.graph(), vc.graph());
        assert_eq!(restored.stashes(), vc.stashes());
        assert_eq!(restored.key().public_id(), vc.key().public_id());
        assert_eq!(restored.key().secret_base64(), vc.key().secret_base64());
    }

    #[test]
    fn test_deserialize_rejects_garbage() {
        assert!(VersionControl::deserialize(b"not cbor at all").is_err());
    }

    #[test]
    fn test_reset_history() {
        let mut vc = VersionControl::new();
        let mut ws = Workspace::new();
        set(&mut ws, "doc", "v", 1);
        vc.commit(&ws, &Selection::All, "first").unwrap();
        let public_id = vc.key().public_id().to_string();

        vc.reset();
        assert!(vc.graph().is_empty());
        assert_eq!(vc.head(), vc.graph().root_id());
        assert_eq!(vc.key().public_id(), public_id);
        assert_eq!(field(&ws, "doc", "v"), Some(Value::from(1)));
    }
}
