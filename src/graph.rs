//! the revision graph: an arena of immutable revisions addressed by id

use std::collections::{BTreeMap, BTreeSet, VecDeque};

use crate::error::{Error, Result};
use crate::hash::{compute_fingerprint, Hash};
use crate::types::{ItemDeltas, Revision};

/// append-only tree of revisions rooted at the shared empty revision
#[derive(Clone, Debug, PartialEq)]
pub struct RevisionGraph {
    root: Hash,
    nodes: BTreeMap<Hash, Revision>,
    children: BTreeMap<Hash, BTreeSet<Hash>>,
}

impl Default for RevisionGraph {
    fn default() -> Self {
        Self::new()
    }
}

impl RevisionGraph {
    /// a graph holding only the root
    pub fn new() -> Self {
        let root = Revision::root();
        let root_id = root.id;
        let mut nodes = BTreeMap::new();
        nodes.insert(root_id, root);
        Self {
            root: root_id,
            nodes,
            children: BTreeMap::new(),
        }
    }

    pub fn root_id(&self) -> Hash {
        self.root
    }

    pub fn get(&self, id: &Hash) -> Option<&Revision> {
        self.nodes.get(id)
    }

    /// look up a revision, failing when absent
    pub fn revision(&self, id: &Hash) -> Result<&Revision> {
        self.nodes
            .get(id)
            .ok_or_else(|| Error::RevisionNotFound(id.to_hex()))
    }

    pub fn contains(&self, id: &Hash) -> bool {
        self.nodes.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// true when only the root is present
    pub fn is_empty(&self) -> bool {
        self.nodes.len() == 1
    }

    /// resolve a full hex id or a unique hex prefix
    pub fn resolve(&self, rev: &str) -> Result<Hash> {
        if rev.len() == 64 && rev.chars().all(|c| c.is_ascii_hexdigit()) {
            let id = Hash::from_hex(rev)?;
            self.revision(&id)?;
            return Ok(id);
        }

        if rev.is_empty() || !rev.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(Error::InvalidHashHex(rev.to_string()));
        }

        let prefix = rev.to_ascii_lowercase();
        let mut matches = self.nodes.keys().filter(|id| id.to_hex().starts_with(&prefix));
        match (matches.next(), matches.next()) {
            (Some(id), None) => Ok(*id),
            (Some(_), Some(_)) => Err(Error::AmbiguousRevision(rev.to_string())),
            (None, _) => Err(Error::RevisionNotFound(rev.to_string())),
        }
    }

    /// insert a revision under an existing parent
    ///
    /// returns false when an identical revision is already present.
    pub fn insert(&mut self, revision: Revision) -> Result<bool> {
        if !revision.verify() {
            return Err(Error::CorruptRevision(revision.id));
        }
        if self.nodes.contains_key(&revision.id) {
            return Ok(false);
        }

        let Some(parent) = revision.parent else {
            return Err(Error::UnrelatedHistories {
                local: self.root,
                remote: revision.id,
            });
        };
        if !self.nodes.contains_key(&parent) {
            return Err(Error::RevisionNotFound(parent.to_hex()));
        }

        self.children.entry(parent).or_default().insert(revision.id);
        self.nodes.insert(revision.id, revision);
        Ok(true)
    }

    /// children of a revision, ordered by id
    pub fn children(&self, id: &Hash) -> impl Iterator<Item = &Hash> {
        self.children.get(id).into_iter().flatten()
    }

    pub fn child_count(&self, id: &Hash) -> usize {
        self.children.get(id).map_or(0, BTreeSet::len)
    }

    /// revisions from the root down to `id`, inclusive
    pub fn path_to(&self, id: &Hash) -> Result<Vec<&Revision>> {
        let mut path = Vec::new();
        let mut current = Some(*id);

        while let Some(hash) = current {
            let revision = self.revision(&hash)?;
            path.push(revision);
            current = revision.parent;
        }

        path.reverse();
        Ok(path)
    }

    /// history from `id` back to the root, newest first
    pub fn log(&self, id: &Hash, max_count: Option<usize>) -> Result<Vec<&Revision>> {
        let mut path = self.path_to(id)?;
        path.reverse();
        if let Some(max) = max_count {
            path.truncate(max);
        }
        Ok(path)
    }

    /// cumulative item state at `id`, replayed from the root
    pub fn state_at(&self, id: &Hash) -> Result<ItemDeltas> {
        let mut state = ItemDeltas::new();

        for revision in self.path_to(id)? {
            for (item, deltas) in &revision.deltas {
                if deltas.is_removal() {
                    state.remove(item);
                } else {
                    state.entry(item.clone()).or_default().overlay(deltas);
                }
            }
        }

        Ok(state)
    }

    /// check if ancestor is an ancestor of descendant (or equal)
    pub fn is_ancestor(&self, ancestor: &Hash, descendant: &Hash) -> bool {
        let mut current = Some(*descendant);
        while let Some(hash) = current {
            if hash == *ancestor {
                return true;
            }
            current = self.nodes.get(&hash).and_then(|r| r.parent);
        }
        false
    }

    /// every revision, parents before children
    pub fn revisions(&self) -> Vec<&Revision> {
        let mut ordered = Vec::with_capacity(self.nodes.len());
        let mut queue = VecDeque::from([self.root]);

        while let Some(id) = queue.pop_front() {
            if let Some(revision) = self.nodes.get(&id) {
                ordered.push(revision);
            }
            queue.extend(self.children(&id).copied());
        }

        ordered
    }

    /// rebuild a graph from revisions in any order
    pub fn from_revisions(revisions: impl IntoIterator<Item = Revision>) -> Result<Self> {
        let mut graph = Self::new();
        let mut by_parent: BTreeMap<Hash, Vec<Revision>> = BTreeMap::new();
        let mut pending = 0usize;

        for revision in revisions {
            match revision.parent {
                None => {
                    if revision.id != graph.root {
                        return Err(Error::UnrelatedHistories {
                            local: graph.root,
                            remote: revision.id,
                        });
                    }
                }
                Some(parent) => {
                    by_parent.entry(parent).or_default().push(revision);
                    pending += 1;
                }
            }
        }

        let mut queue = VecDeque::from([graph.root]);
        while let Some(id) = queue.pop_front() {
            for revision in by_parent.remove(&id).unwrap_or_default() {
                let child = revision.id;
                if graph.insert(revision)? {
                    queue.push_back(child);
                }
                pending -= 1;
            }
        }

        // whatever is left hangs off a parent we never saw
        if pending > 0 {
            if let Some(parent) = by_parent.keys().next() {
                return Err(Error::RevisionNotFound(parent.to_hex()));
            }
        }

        Ok(graph)
    }

    /// digest over every revision id in the graph
    pub fn fingerprint(&self) -> Hash {
        compute_fingerprint(self.nodes.keys())
    }

    /// ids of every revision
    pub fn ids(&self) -> impl Iterator<Item = &Hash> {
        self.nodes.keys()
    }
}
