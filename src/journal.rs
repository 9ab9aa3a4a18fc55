//! all-or-nothing writes to live items
//!
//! every item is snapshotted before its first write. if any write fails,
//! the touched items are restored in reverse order and the error is
//! returned unchanged.

use std::collections::BTreeMap;

use crate::error::{Error, Result};
use crate::item::{TrackedItem, TrackedItemsSource};
use crate::types::{DeltaSet, ItemDeltas, ItemId};

/// a write planned for one item
#[derive(Clone, Debug, PartialEq)]
pub enum ItemWrite {
    /// item must exist with exactly this state
    Reset(DeltaSet),
    /// patch the item (created from the deltas when missing)
    Patch(DeltaSet),
    /// item must not exist
    Delete,
}

impl ItemWrite {
    /// patch a delta set in, turning tombstones into deletes
    pub fn patch(deltas: &DeltaSet) -> Self {
        if deltas.is_removal() {
            ItemWrite::Delete
        } else {
            ItemWrite::Patch(deltas.clone())
        }
    }
}

/// writes that make the live items match `target`, restricted to `scope`
pub fn plan_reset(
    source: &dyn TrackedItemsSource,
    target: &ItemDeltas,
    scope: impl Fn(&ItemId) -> bool,
) -> BTreeMap<ItemId, ItemWrite> {
    let mut plan = BTreeMap::new();

    for (id, state) in target {
        if scope(id) {
            plan.insert(id.clone(), ItemWrite::Reset(state.clone()));
        }
    }
    for id in source.item_ids() {
        if scope(&id) && !target.contains_key(&id) {
            plan.insert(id, ItemWrite::Delete);
        }
    }

    plan
}

/// prior state of every touched item
#[derive(Default)]
struct Journal {
    entries: Vec<(ItemId, Option<DeltaSet>)>,
}

impl Journal {
    fn record(&mut self, source: &dyn TrackedItemsSource, id: &ItemId) {
        let prior = source.item(id).map(|item| item.snapshot());
        self.entries.push((id.clone(), prior));
    }

    fn rollback(self, source: &mut dyn TrackedItemsSource) {
        for (id, prior) in self.entries.into_iter().rev() {
            let result = match (prior, source.has_item(&id)) {
                (Some(state), true) => item_mut(source, &id).and_then(|item| item.reset_to(&state)),
                (Some(state), false) => source.create_item(&id, &state),
                (None, true) => source.delete_item(&id),
                (None, false) => Ok(()),
            };
            if let Err(e) = result {
                tracing::warn!(item = %id, error = %e, "rollback failed for item");
            }
        }
    }
}

/// run the planned writes; returns the ids actually written
///
/// items already in the requested state are left alone.
pub fn write_items(
    source: &mut dyn TrackedItemsSource,
    plan: BTreeMap<ItemId, ItemWrite>,
) -> Result<Vec<ItemId>> {
    let mut journal = Journal::default();
    let mut touched = Vec::new();

    for (id, write) in plan {
        match write_one(source, &mut journal, &id, &write) {
            Ok(true) => touched.push(id),
            Ok(false) => {}
            Err(e) => {
                tracing::warn!(item = %id, error = %e, "item write failed, rolling back");
                journal.rollback(source);
                return Err(e);
            }
        }
    }

    Ok(touched)
}

fn write_one(
    source: &mut dyn TrackedItemsSource,
    journal: &mut Journal,
    id: &ItemId,
    write: &ItemWrite,
) -> Result<bool> {
    let exists = source.has_item(id);

    match write {
        ItemWrite::Reset(state) => {
            if exists {
                let matches = source
                    .item(id)
                    .is_some_and(|item| item.diff_against(state).is_empty());
                if matches {
                    return Ok(false);
                }
                journal.record(source, id);
                item_mut(source, id)?.reset_to(state)?;
            } else {
                journal.record(source, id);
                source.create_item(id, state)?;
            }
        }
        ItemWrite::Patch(deltas) => {
            journal.record(source, id);
            if exists {
                item_mut(source, id)?.apply(deltas)?;
            } else {
                source.create_item(id, deltas)?;
            }
        }
        ItemWrite::Delete => {
            if !exists {
                return Ok(false);
            }
            journal.record(source, id);
            source.delete_item(id)?;
        }
    }

    Ok(true)
}

fn item_mut<'s>(
    source: &'s mut dyn TrackedItemsSource,
    id: &ItemId,
) -> Result<&'s mut dyn TrackedItem> {
    source
        .item_mut(id)
        .ok_or_else(|| Error::ItemNotFound(id.clone()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workspace::{SectionItem, Workspace};
    use ciborium::Value;

    fn workspace() -> Workspace {
        let mut ws = Workspace::new();
        ws.insert(SectionItem::new("a").with_field("v", 1));
        ws.insert(SectionItem::new("b").with_field("v", 2));
        ws
    }

    #[test]
    fn test_reset_skips_matching_items() {
        let mut ws = workspace();
        let mut plan = BTreeMap::new();
        plan.insert(ItemId::from("a"), ItemWrite::Reset(DeltaSet::new().with("v", 1)));
        plan.insert(ItemId::from("b"), ItemWrite::Reset(DeltaSet::new().with("v", 5)));

        let touched = write_items(&mut ws, plan).unwrap();
        assert_eq!(touched, vec![ItemId::from("b")]);
        assert_eq!(ws.section("b").unwrap().get("v"), Some(&Value::from(5)));
    }

    #[test]
    fn test_create_and_delete() {
        let mut ws = workspace();
        let mut plan = BTreeMap::new();
        plan.insert(ItemId::from("a"), ItemWrite::Delete);
        plan.insert(ItemId::from("c"), ItemWrite::Reset(DeltaSet::new().with("v", 3)));
        plan.insert(ItemId::from("gone"), ItemWrite::Delete);

        let touched = write_items(&mut ws, plan).unwrap();
        assert_eq!(touched, vec![ItemId::from("a"), ItemId::from("c")]);
        assert!(ws.section("a").is_none());
        assert!(ws.section("c").is_some());
    }

    #[test]
    fn test_failure_rolls_back_everything() {
        let mut ws = workspace();
        ws.section_mut("b").unwrap().set_locked(true);
        let before = ws.clone();

        let mut plan = BTreeMap::new();
        plan.insert(ItemId::from("a"), ItemWrite::Patch(DeltaSet::new().with("v", 10)));
        plan.insert(ItemId::from("aa"), ItemWrite::Reset(DeltaSet::new().with("v", 11)));
        plan.insert(ItemId::from("b"), ItemWrite::Patch(DeltaSet::new().with("v", 12)));

        let result = write_items(&mut ws, plan);
        assert!(matches!(result, Err(Error::ItemApply { .. })));
        assert_eq!(ws, before);
    }

    #[test]
    fn test_plan_reset_scope() {
        let ws = workspace();
        let mut target = ItemDeltas::new();
        target.insert(ItemId::from("a"), DeltaSet::new().with("v", 1));

        let plan = plan_reset(&ws, &target, |_| true);
        assert_eq!(plan.get(&ItemId::from("b")), Some(&ItemWrite::Delete));

        let plan = plan_reset(&ws, &target, |id| id.as_str() == "a");
        assert_eq!(plan.len(), 1);
    }

    #[test]
    fn test_patch_tombstone_is_delete() {
        assert_eq!(ItemWrite::patch(&DeltaSet::removed()), ItemWrite::Delete);
    }
}
