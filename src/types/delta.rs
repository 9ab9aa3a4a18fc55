use std::collections::BTreeMap;
use std::fmt;

use ciborium::Value;
use serde::{Deserialize, Serialize};

/// identifier of a tracked item, stable across stores
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ItemId(String);

impl ItemId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ItemId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ItemId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for ItemId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// a named unit of change for one tracked item
#[derive(Clone, Debug, PartialEq)]
pub struct Delta {
    pub kind: String,
    pub payload: Value,
}

impl Delta {
    /// kind reserved for "this item was removed"
    pub const REMOVED: &'static str = "~removed";

    pub fn new(kind: impl Into<String>, payload: impl Into<Value>) -> Self {
        Self {
            kind: kind.into(),
            payload: payload.into(),
        }
    }

    pub fn is_removal(&self) -> bool {
        self.kind == Self::REMOVED
    }
}

/// deltas for one item, at most one per kind
///
/// kinds are kept sorted so the CBOR encoding is canonical.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeltaSet(BTreeMap<String, Value>);

impl DeltaSet {
    pub fn new() -> Self {
        Self(BTreeMap::new())
    }

    /// the tombstone set recorded when an item disappears
    pub fn removed() -> Self {
        let mut set = Self::new();
        set.insert(Delta::new(Delta::REMOVED, Value::Null));
        set
    }

    /// insert a delta, replacing any previous delta of the same kind
    pub fn insert(&mut self, delta: Delta) {
        self.0.insert(delta.kind, delta.payload);
    }

    pub fn with(mut self, kind: impl Into<String>, payload: impl Into<Value>) -> Self {
        self.insert(Delta::new(kind, payload));
        self
    }

    pub fn get(&self, kind: &str) -> Option<&Value> {
        self.0.get(kind)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_removal(&self) -> bool {
        self.0.contains_key(Delta::REMOVED)
    }

    pub fn kinds(&self) -> impl Iterator<Item = &str> {
        self.0.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// layer `newer` on top of this set (newer kinds win)
    pub fn overlay(&mut self, newer: &DeltaSet) {
        for (kind, payload) in &newer.0 {
            self.0.insert(kind.clone(), payload.clone());
        }
    }
}

impl FromIterator<Delta> for DeltaSet {
    fn from_iter<I: IntoIterator<Item = Delta>>(iter: I) -> Self {
        let mut set = Self::new();
        for delta in iter {
            set.insert(delta);
        }
        set
    }
}

/// item-level change classification
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChangeKind {
    Added,
    Modified,
    Deleted,
}

impl fmt::Display for ChangeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChangeKind::Added => write!(f, "A"),
            ChangeKind::Modified => write!(f, "M"),
            ChangeKind::Deleted => write!(f, "D"),
        }
    }
}

/// one changed item in a status listing
#[derive(Clone, Debug, PartialEq)]
pub struct ItemChange {
    pub item: ItemId,
    pub kind: ChangeKind,
    pub deltas: DeltaSet,
}

impl fmt::Display for ItemChange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.kind, self.item)
    }
}
