//! two-tree history merge
//!
//! the merge folds a remote graph into the local one and never drops a
//! revision. where the two sides grew different children under a shared
//! node, the newest child of each side is combined into a conflict node
//! hung under that shared node, and the work built on top of both children
//! is rebased under the conflict node and merged again at that level.
//!
//! the result depends only on the two graphs, their merge counters and the
//! policy. with a symmetric policy both peers compute bit-identical graphs.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::graph::RevisionGraph;
use crate::hash::Hash;
use crate::types::{DeltaSet, ItemDeltas, ItemId, Revision};

const MERGE_PREFIX: &str = "merge ";

/// which side of a merge a conflicting sibling came from
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Side {
    Local,
    Remote,
}

/// one side's version of a conflicting item
#[derive(Clone, Copy, Debug)]
pub struct Candidate<'a> {
    /// the sibling revision carrying the deltas
    pub revision: &'a Revision,
    pub deltas: &'a DeltaSet,
    /// merge counter of the store that produced the sibling
    pub version: u64,
}

/// decides which side's deltas win for an item changed on both sides
pub trait ConflictPolicy {
    fn resolve(&self, item: &ItemId, local: Candidate<'_>, remote: Candidate<'_>) -> Side;
}

/// higher merge counter wins, ties go to the greater sibling id
///
/// symmetric: swapping the sides swaps the answer, so peers agree.
#[derive(Clone, Copy, Debug, Default)]
pub struct VersionCounter;

impl ConflictPolicy for VersionCounter {
    fn resolve(&self, _item: &ItemId, local: Candidate<'_>, remote: Candidate<'_>) -> Side {
        let l = (local.version, local.revision.id);
        let r = (remote.version, remote.revision.id);
        if l >= r {
            Side::Local
        } else {
            Side::Remote
        }
    }
}

/// local deltas always win
///
/// not symmetric: two peers both preferring themselves build different
/// conflict nodes and will not converge.
#[derive(Clone, Copy, Debug, Default)]
pub struct PreferLocal;

impl ConflictPolicy for PreferLocal {
    fn resolve(&self, _item: &ItemId, _local: Candidate<'_>, _remote: Candidate<'_>) -> Side {
        Side::Local
    }
}

/// remote deltas always win (not symmetric, see [`PreferLocal`])
#[derive(Clone, Copy, Debug, Default)]
pub struct PreferRemote;

impl ConflictPolicy for PreferRemote {
    fn resolve(&self, _item: &ItemId, _local: Candidate<'_>, _remote: Candidate<'_>) -> Side {
        Side::Remote
    }
}

/// named policy, as written in config.toml
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PolicyKind {
    #[default]
    VersionCounter,
    PreferLocal,
    PreferRemote,
}

impl PolicyKind {
    pub fn into_policy(self) -> Box<dyn ConflictPolicy + Send + Sync> {
        match self {
            PolicyKind::VersionCounter => Box::new(VersionCounter),
            PolicyKind::PreferLocal => Box::new(PreferLocal),
            PolicyKind::PreferRemote => Box::new(PreferRemote),
        }
    }
}

impl FromStr for PolicyKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "version-counter" => Ok(PolicyKind::VersionCounter),
            "prefer-local" => Ok(PolicyKind::PreferLocal),
            "prefer-remote" => Ok(PolicyKind::PreferRemote),
            _ => Err(Error::InvalidConflictPolicy(s.to_string())),
        }
    }
}

impl fmt::Display for PolicyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PolicyKind::VersionCounter => write!(f, "version-counter"),
            PolicyKind::PreferLocal => write!(f, "prefer-local"),
            PolicyKind::PreferRemote => write!(f, "prefer-remote"),
        }
    }
}

/// what a merge did
#[derive(Clone, Debug, Default, PartialEq)]
pub struct MergeReport {
    /// items changed on both sides and resolved by the policy
    pub conflicts: Vec<ItemId>,
    /// conflict nodes created
    pub merge_nodes: Vec<Hash>,
    /// remote revisions that were new to the local graph
    pub imported: usize,
    /// rebased copies created
    pub rebased: usize,
}

impl MergeReport {
    /// true when one side simply extended the other
    pub fn is_fast_forward(&self) -> bool {
        self.merge_nodes.is_empty() && self.rebased == 0
    }

    /// true when nothing was added
    pub fn is_up_to_date(&self) -> bool {
        self.is_fast_forward() && self.imported == 0
    }
}

/// merged graph plus where the local head ends up
#[derive(Clone, Debug)]
pub struct MergeOutcome {
    pub graph: RevisionGraph,
    pub head: Hash,
    pub report: MergeReport,
}

/// merge `remote` into `local`
///
/// `head` is the local head; the returned head is its image in the merged
/// graph, advanced along revisions that only the remote side introduced
/// while that path does not branch.
pub fn merge(
    local: &RevisionGraph,
    remote: &RevisionGraph,
    head: Hash,
    local_version: u64,
    remote_version: u64,
    policy: &dyn ConflictPolicy,
) -> Result<MergeOutcome> {
    if local.root_id() != remote.root_id() {
        return Err(Error::UnrelatedHistories {
            local: local.root_id(),
            remote: remote.root_id(),
        });
    }
    local.revision(&head)?;

    let mut merger = Merger {
        graph: local.clone(),
        local,
        remote,
        local_version,
        remote_version,
        policy,
        derived: BTreeMap::new(),
        superseded: BTreeMap::new(),
        created_edges: BTreeSet::new(),
        diverged: BTreeSet::new(),
        conflicts: BTreeSet::new(),
        report: MergeReport::default(),
    };

    merger.import_remote()?;
    merger.recover_merge_nodes();
    merger.run()?;

    let head = merger.advance_head(head);
    let mut report = merger.report;
    report.conflicts = merger.conflicts.into_iter().collect();

    tracing::info!(
        imported = report.imported,
        merge_nodes = report.merge_nodes.len(),
        rebased = report.rebased,
        conflicts = report.conflicts.len(),
        head = %head.short(),
        "merged histories"
    );

    Ok(MergeOutcome {
        graph: merger.graph,
        head,
        report,
    })
}

/// where a node in the merged graph comes from
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Origin {
    Local,
    Remote,
    Both,
}

struct Merger<'a> {
    graph: RevisionGraph,
    local: &'a RevisionGraph,
    remote: &'a RevisionGraph,
    local_version: u64,
    remote_version: u64,
    policy: &'a dyn ConflictPolicy,
    /// origin of revisions created by this merge
    derived: BTreeMap<Hash, Origin>,
    /// node -> the node its children now hang under
    superseded: BTreeMap<Hash, Hash>,
    /// supersession edges created by this merge (not recovered)
    created_edges: BTreeSet<Hash>,
    /// parents that already received a conflict node
    diverged: BTreeSet<Hash>,
    conflicts: BTreeSet<ItemId>,
    report: MergeReport,
}

impl Merger<'_> {
    /// union of both graphs, remote revisions inserted parent-first
    fn import_remote(&mut self) -> Result<()> {
        for revision in self.remote.revisions() {
            if revision.is_root() {
                continue;
            }
            if self.graph.insert(revision.clone())? {
                self.report.imported += 1;
            }
        }
        Ok(())
    }

    /// conflict nodes from earlier merges keep superseding their siblings
    fn recover_merge_nodes(&mut self) {
        let mut recovered = Vec::new();
        for revision in self.graph.revisions() {
            let Some((a, b)) = parse_merge_message(&revision.message) else {
                continue;
            };
            let Some(parent) = revision.parent else {
                continue;
            };
            let siblings: BTreeSet<&Hash> = self.graph.children(&parent).collect();
            if siblings.contains(&a) && siblings.contains(&b) {
                recovered.push((a, b, revision.id));
            }
        }

        // the first merge by id wins when a node was merged more than once
        recovered.sort_by_key(|(_, _, id)| *id);
        for (a, b, id) in recovered {
            self.superseded.entry(a).or_insert(id);
            self.superseded.entry(b).or_insert(id);
        }
    }

    fn origin(&self, id: &Hash) -> Origin {
        match (self.local.contains(id), self.remote.contains(id)) {
            (true, true) => Origin::Both,
            (true, false) => Origin::Local,
            (false, true) => Origin::Remote,
            (false, false) => self.derived.get(id).copied().unwrap_or(Origin::Both),
        }
    }

    /// final node standing in for `id`
    fn image(&self, id: Hash, created_only: bool) -> Hash {
        let mut current = id;
        // each hop moves to a distinct node, so the chain is bounded by the graph size
        for _ in 0..self.graph.len() {
            let Some(next) = self.superseded.get(&current) else {
                break;
            };
            if created_only && !self.created_edges.contains(&current) && self.local.contains(next) {
                break;
            }
            current = *next;
        }
        current
    }

    fn supersede(&mut self, id: Hash, by: Hash) {
        if self.superseded.contains_key(&id) {
            return;
        }
        self.superseded.insert(id, by);
        self.created_edges.insert(id);
    }

    fn run(&mut self) -> Result<()> {
        let mut queue = VecDeque::from([self.graph.root_id()]);
        let mut visited = BTreeSet::new();

        while let Some(id) = queue.pop_front() {
            if !visited.insert(id) {
                continue;
            }

            let children: Vec<Hash> = self.graph.children(&id).copied().collect();

            if self.superseded.contains_key(&id) {
                let target = self.image(id, false);
                let mut moved = false;
                for child in children.iter().copied() {
                    if self.superseded.contains_key(&child) {
                        continue;
                    }
                    let copy = self.graph.revision(&child)?.rebased(target);
                    let copy_id = copy.id;
                    if self.graph.insert(copy)? {
                        let origin = self.origin(&child);
                        self.derived.insert(copy_id, origin);
                        self.report.rebased += 1;
                        moved = true;
                    }
                    self.supersede(child, copy_id);
                    visited.remove(&child);
                    queue.push_back(child);
                }
                if moved {
                    visited.remove(&target);
                    queue.push_back(target);
                }
                continue;
            }

            if let Some(merge_id) = self.resolve_divergence(id, &children)? {
                // the merged siblings' children must follow them
                let merged: Vec<Hash> = self
                    .superseded
                    .iter()
                    .filter(|(_, by)| **by == merge_id)
                    .map(|(from, _)| *from)
                    .collect();
                for sibling in merged {
                    visited.remove(&sibling);
                    queue.push_back(sibling);
                }
                visited.remove(&id);
                queue.push_back(id);
                continue;
            }

            queue.extend(children);
        }

        Ok(())
    }

    /// newest child of `origin` not yet merged away
    fn newest(&self, children: &[Hash], origin: Origin) -> Result<Option<Revision>> {
        let mut best: Option<&Revision> = None;
        for id in children {
            if self.superseded.contains_key(id) || self.origin(id) != origin {
                continue;
            }
            let revision = self.graph.revision(id)?;
            if best.map_or(true, |b| (revision.timestamp, revision.id) > (b.timestamp, b.id)) {
                best = Some(revision);
            }
        }
        Ok(best.cloned())
    }

    /// build a conflict node under `parent` if its children diverged
    fn resolve_divergence(&mut self, parent: Hash, children: &[Hash]) -> Result<Option<Hash>> {
        if self.diverged.contains(&parent) {
            return Ok(None);
        }
        let (Some(l), Some(r)) = (
            self.newest(children, Origin::Local)?,
            self.newest(children, Origin::Remote)?,
        ) else {
            return Ok(None);
        };

        let node = self.conflict_node(parent, &l, &r);
        let node_id = node.id;

        tracing::debug!(
            parent = %parent.short(),
            local = %l.id.short(),
            remote = %r.id.short(),
            node = %node_id.short(),
            "histories diverged"
        );

        if self.graph.insert(node)? {
            self.derived.insert(node_id, Origin::Both);
            self.report.merge_nodes.push(node_id);
        }
        self.diverged.insert(parent);
        self.supersede(l.id, node_id);
        self.supersede(r.id, node_id);
        Ok(Some(node_id))
    }

    fn conflict_node(&mut self, parent: Hash, local: &Revision, remote: &Revision) -> Revision {
        let mut deltas = ItemDeltas::new();

        let items: BTreeSet<&ItemId> = local.deltas.keys().chain(remote.deltas.keys()).collect();
        for item in items {
            let set = match (local.deltas.get(item), remote.deltas.get(item)) {
                (Some(l), Some(r)) if l != r => {
                    self.conflicts.insert(item.clone());
                    let side = self.policy.resolve(
                        item,
                        Candidate {
                            revision: local,
                            deltas: l,
                            version: self.local_version,
                        },
                        Candidate {
                            revision: remote,
                            deltas: r,
                            version: self.remote_version,
                        },
                    );
                    match side {
                        Side::Local => l,
                        Side::Remote => r,
                    }
                }
                (Some(set), _) | (None, Some(set)) => set,
                (None, None) => continue,
            };
            deltas.insert(item.clone(), set.clone());
        }

        let (lo, hi) = if local.id < remote.id {
            (local.id, remote.id)
        } else {
            (remote.id, local.id)
        };
        Revision::with_timestamp(
            Some(parent),
            deltas,
            merge_message(&lo, &hi),
            local.timestamp.max(remote.timestamp),
        )
    }

    /// image of the old head, then forward along a single remote-only path
    fn advance_head(&self, head: Hash) -> Hash {
        let mut current = self.image(head, true);

        loop {
            let mut incoming = self.graph.children(&current).filter(|id| {
                !self.local.contains(id)
                    && !self.superseded.contains_key(id)
                    && self.origin(id) != Origin::Local
            });
            match (incoming.next(), incoming.next()) {
                (Some(next), None) => current = *next,
                _ => break,
            }
        }

        current
    }
}

fn merge_message(lo: &Hash, hi: &Hash) -> String {
    format!("{}{} {}", MERGE_PREFIX, lo.to_hex(), hi.to_hex())
}

/// the two sibling ids recorded in a conflict node's message
pub fn parse_merge_message(message: &str) -> Option<(Hash, Hash)> {
    let rest = message.strip_prefix(MERGE_PREFIX)?;
    let (a, b) = rest.split_once(' ')?;
    Some((Hash::from_hex(a).ok()?, Hash::from_hex(b).ok()?))
}
