//! capability interface the host application implements for its items
//!
//! the engine never sees concrete item types. everything it needs is a full
//! snapshot, a diff against an earlier snapshot, and two ways of writing
//! state back. writes are silent: the engine notifies observers once per
//! batch after all items have been updated.

use crate::error::Result;
use crate::types::{DeltaSet, ItemId};

/// one versioned unit of host state
pub trait TrackedItem {
    /// full current state as a delta set
    fn snapshot(&self) -> DeltaSet;

    /// minimal change-set turning `prior` into the current state
    fn diff_against(&self, prior: &DeltaSet) -> DeltaSet;

    /// patch the item with the given deltas
    ///
    /// must be idempotent and must not emit change notifications.
    fn apply(&mut self, deltas: &DeltaSet) -> Result<()>;

    /// replace the whole state with `state` (a full snapshot)
    fn reset_to(&mut self, state: &DeltaSet) -> Result<()>;
}

/// the host-side collection of tracked items
pub trait TrackedItemsSource {
    /// ids of every live item
    fn item_ids(&self) -> Vec<ItemId>;

    fn item(&self, id: &ItemId) -> Option<&dyn TrackedItem>;

    fn item_mut(&mut self, id: &ItemId) -> Option<&mut dyn TrackedItem>;

    /// create an item from a full state
    fn create_item(&mut self, id: &ItemId, state: &DeltaSet) -> Result<()>;

    fn delete_item(&mut self, id: &ItemId) -> Result<()>;

    fn has_item(&self, id: &ItemId) -> bool {
        self.item(id).is_some()
    }
}
