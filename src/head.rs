use std::collections::BTreeSet;

use crate::error::Result;
use crate::graph::RevisionGraph;
use crate::hash::Hash;
use crate::item::TrackedItemsSource;
use crate::types::{ChangeKind, DeltaSet, ItemChange, ItemDeltas, ItemId};

/// which tracked items an operation covers
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub enum Selection {
    #[default]
    All,
    Items(BTreeSet<ItemId>),
}

impl Selection {
    pub fn items<I, T>(ids: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<ItemId>,
    {
        Selection::Items(ids.into_iter().map(Into::into).collect())
    }

    pub fn contains(&self, id: &ItemId) -> bool {
        match self {
            Selection::All => true,
            Selection::Items(ids) => ids.contains(id),
        }
    }
}

/// the cursor marking which revision is materialized in the live items
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Head {
    revision: Hash,
}

impl Head {
    pub fn new(revision: Hash) -> Self {
        Self { revision }
    }

    pub fn revision(&self) -> Hash {
        self.revision
    }

    pub(crate) fn move_to(&mut self, revision: Hash) {
        self.revision = revision;
    }

    /// live changes of the selected items relative to this head
    ///
    /// items created since the head are reported with a full snapshot,
    /// items gone since the head with a tombstone.
    pub fn diff(
        &self,
        graph: &RevisionGraph,
        source: &dyn TrackedItemsSource,
        selection: &Selection,
    ) -> Result<Vec<ItemChange>> {
        let state = graph.state_at(&self.revision)?;

        let ids: BTreeSet<ItemId> = source
            .item_ids()
            .into_iter()
            .chain(state.keys().cloned())
            .filter(|id| selection.contains(id))
            .collect();

        let mut changes = Vec::new();
        for id in ids {
            let change = match (source.item(&id), state.get(&id)) {
                (Some(item), Some(prior)) => {
                    let deltas = item.diff_against(prior);
                    if deltas.is_empty() {
                        continue;
                    }
                    (ChangeKind::Modified, deltas)
                }
                (Some(item), None) => (ChangeKind::Added, item.snapshot()),
                (None, Some(_)) => (ChangeKind::Deleted, DeltaSet::removed()),
                (None, None) => continue,
            };
            changes.push(ItemChange {
                item: id,
                kind: change.0,
                deltas: change.1,
            });
        }

        Ok(changes)
    }
}

/// collapse a change list into the per-item map stored on a revision
pub fn changes_to_deltas(changes: Vec<ItemChange>) -> ItemDeltas {
    changes.into_iter().map(|c| (c.item, c.deltas)).collect()
}
