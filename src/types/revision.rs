use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::hash::{compute_revision_id, Hash};
use crate::types::{DeltaSet, ItemId};

/// per-item deltas of one revision (BTreeMap for deterministic serialization)
pub type ItemDeltas = BTreeMap<ItemId, DeltaSet>;

/// an immutable node of the history graph
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Revision {
    /// content id: hash of (parent, deltas, message)
    pub id: Hash,
    /// parent revision (None only for the root)
    pub parent: Option<Hash>,
    /// deltas keyed by tracked item
    pub deltas: ItemDeltas,
    /// commit message
    pub message: String,
    /// unix timestamp (seconds since epoch), not part of the id
    pub timestamp: i64,
}

impl Revision {
    /// create a revision stamped with the current time
    pub fn new(parent: Option<Hash>, deltas: ItemDeltas, message: impl Into<String>) -> Self {
        let timestamp = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_secs() as i64)
            .unwrap_or(0);
        Self::with_timestamp(parent, deltas, message, timestamp)
    }

    /// create a revision with explicit timestamp
    pub fn with_timestamp(
        parent: Option<Hash>,
        deltas: ItemDeltas,
        message: impl Into<String>,
        timestamp: i64,
    ) -> Self {
        let message = message.into();
        let id = compute_revision_id(parent.as_ref(), &deltas, &message);
        Self {
            id,
            parent,
            deltas,
            message,
            timestamp,
        }
    }

    /// the shared empty-history sentinel
    pub fn root() -> Self {
        Self::with_timestamp(None, ItemDeltas::new(), "", 0)
    }

    /// the same content re-attached under another parent
    pub fn rebased(&self, parent: Hash) -> Self {
        if self.parent == Some(parent) {
            return self.clone();
        }
        Self::with_timestamp(
            Some(parent),
            self.deltas.clone(),
            self.message.clone(),
            self.timestamp,
        )
    }

    pub fn is_root(&self) -> bool {
        self.parent.is_none()
    }

    /// recompute the id from content and compare
    pub fn verify(&self) -> bool {
        compute_revision_id(self.parent.as_ref(), &self.deltas, &self.message) == self.id
    }

    /// does this revision carry deltas for the item
    pub fn touches(&self, item: &ItemId) -> bool {
        self.deltas.contains_key(item)
    }
}
