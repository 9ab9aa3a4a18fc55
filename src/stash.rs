use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::types::Revision;

/// detached revisions kept outside the main graph
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct StashesRepository {
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    stashes: BTreeMap<String, Revision>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    quick: Option<Revision>,
}

impl StashesRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// store a stash under a new name
    pub fn add(&mut self, name: impl Into<String>, revision: Revision) -> Result<()> {
        let name = name.into();
        if self.stashes.contains_key(&name) {
            return Err(Error::StashExists(name));
        }
        self.stashes.insert(name, revision);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Result<&Revision> {
        self.stashes
            .get(name)
            .ok_or_else(|| Error::StashNotFound(name.to_string()))
    }

    pub fn remove(&mut self, name: &str) -> Result<Revision> {
        self.stashes
            .remove(name)
            .ok_or_else(|| Error::StashNotFound(name.to_string()))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.stashes.contains_key(name)
    }

    /// stash names, sorted
    pub fn names(&self) -> Vec<String> {
        self.stashes.keys().cloned().collect()
    }

    /// stash names matching a glob pattern
    pub fn names_matching(&self, pattern: &str) -> Result<Vec<String>> {
        let glob = glob::Pattern::new(pattern).map_err(|e| Error::InvalidPattern(e.to_string()))?;
        Ok(self
            .stashes
            .keys()
            .filter(|name| glob.matches(name))
            .cloned()
            .collect())
    }

    /// name under which an identical revision is stored, if any
    pub fn find(&self, revision: &Revision) -> Option<&str> {
        self.stashes
            .iter()
            .find(|(_, r)| r.id == revision.id)
            .map(|(name, _)| name.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Revision)> {
        self.stashes.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn len(&self) -> usize {
        self.stashes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stashes.is_empty()
    }

    pub fn has_quick_stash(&self) -> bool {
        self.quick.is_some()
    }

    /// fill the quick slot, returning what it held before
    pub fn set_quick_stash(&mut self, revision: Revision) -> Option<Revision> {
        self.quick.replace(revision)
    }

    pub fn quick_stash(&self) -> Option<&Revision> {
        self.quick.as_ref()
    }

    pub fn take_quick_stash(&mut self) -> Option<Revision> {
        self.quick.take()
    }

    pub fn clear(&mut self) {
        self.stashes.clear();
        self.quick = None;
    }
}
