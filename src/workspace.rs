//! a simple host: named sections of key/value fields
//!
//! each section is one tracked item and each field one delta kind. a null
//! payload means "field absent". the CLI keeps a workspace in a TOML file
//! where every top-level table is a section.

use std::collections::BTreeMap;
use std::path::Path;

use ciborium::Value;

use crate::error::{Error, IoResultExt, Result};
use crate::item::{TrackedItem, TrackedItemsSource};
use crate::types::{Delta, DeltaSet, ItemId};

/// a section of fields
#[derive(Clone, Debug, PartialEq)]
pub struct SectionItem {
    id: ItemId,
    fields: BTreeMap<String, Value>,
    locked: bool,
}

impl SectionItem {
    pub fn new(id: impl Into<ItemId>) -> Self {
        Self {
            id: id.into(),
            fields: BTreeMap::new(),
            locked: false,
        }
    }

    pub fn with_field(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.set(name, value);
        self
    }

    pub fn id(&self) -> &ItemId {
        &self.id
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.fields.get(name)
    }

    /// set a field; a null value removes it
    pub fn set(&mut self, name: impl Into<String>, value: impl Into<Value>) {
        let name = name.into();
        match value.into() {
            Value::Null => {
                self.fields.remove(&name);
            }
            value => {
                self.fields.insert(name, value);
            }
        }
    }

    pub fn remove(&mut self, name: &str) {
        self.fields.remove(name);
    }

    pub fn fields(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.fields.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// a locked section rejects every write from the engine
    pub fn set_locked(&mut self, locked: bool) {
        self.locked = locked;
    }

    fn check_writable(&self) -> Result<()> {
        if self.locked {
            return Err(Error::ItemApply {
                item: self.id.clone(),
                message: "section is locked".to_string(),
            });
        }
        Ok(())
    }

    fn write_fields(&mut self, deltas: &DeltaSet) {
        for (kind, payload) in deltas.iter() {
            if kind == Delta::REMOVED {
                continue;
            }
            self.set(kind, payload.clone());
        }
    }
}

impl TrackedItem for SectionItem {
    fn snapshot(&self) -> DeltaSet {
        self.fields
            .iter()
            .map(|(k, v)| Delta::new(k.clone(), v.clone()))
            .collect()
    }

    fn diff_against(&self, prior: &DeltaSet) -> DeltaSet {
        let mut changes = DeltaSet::new();

        for (name, value) in &self.fields {
            if prior.get(name) != Some(value) {
                changes.insert(Delta::new(name.clone(), value.clone()));
            }
        }

        for (kind, payload) in prior.iter() {
            if kind == Delta::REMOVED || matches!(payload, Value::Null) {
                continue;
            }
            if !self.fields.contains_key(kind) {
                changes.insert(Delta::new(kind, Value::Null));
            }
        }

        changes
    }

    fn apply(&mut self, deltas: &DeltaSet) -> Result<()> {
        self.check_writable()?;
        self.write_fields(deltas);
        Ok(())
    }

    fn reset_to(&mut self, state: &DeltaSet) -> Result<()> {
        self.check_writable()?;
        self.fields.clear();
        self.write_fields(state);
        Ok(())
    }
}

/// an in-memory collection of sections
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Workspace {
    sections: BTreeMap<ItemId, SectionItem>,
}

impl Workspace {
    pub fn new() -> Self {
        Self::default()
    }

    /// add or replace a section
    pub fn insert(&mut self, section: SectionItem) {
        self.sections.insert(section.id.clone(), section);
    }

    pub fn section(&self, id: &str) -> Option<&SectionItem> {
        self.sections.get(&ItemId::from(id))
    }

    pub fn section_mut(&mut self, id: &str) -> Option<&mut SectionItem> {
        self.sections.get_mut(&ItemId::from(id))
    }

    pub fn remove(&mut self, id: &str) -> Option<SectionItem> {
        self.sections.remove(&ItemId::from(id))
    }

    pub fn len(&self) -> usize {
        self.sections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sections.is_empty()
    }

    /// load from a TOML file; a missing file is an empty workspace
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::new());
        }
        let content = std::fs::read_to_string(path).with_path(path)?;
        Self::from_toml(&content)
    }

    /// save as a TOML file
    pub fn save(&self, path: &Path) -> Result<()> {
        let content = self.to_toml()?;
        std::fs::write(path, content).with_path(path)?;
        Ok(())
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        let table: toml::Table = toml::from_str(content)?;
        let mut workspace = Self::new();

        for (name, value) in table {
            let toml::Value::Table(fields) = value else {
                tracing::warn!(entry = %name, "ignoring top-level value that is not a table");
                continue;
            };
            let mut section = SectionItem::new(name.as_str());
            for (field, value) in fields {
                section.set(field, Value::serialized(&value)?);
            }
            workspace.insert(section);
        }

        Ok(workspace)
    }

    pub fn to_toml(&self) -> Result<String> {
        let mut table = toml::Table::new();
        for (id, section) in &self.sections {
            let mut fields = toml::Table::new();
            for (name, value) in section.fields() {
                fields.insert(name.to_string(), value.deserialized::<toml::Value>()?);
            }
            table.insert(id.to_string(), toml::Value::Table(fields));
        }
        Ok(toml::to_string_pretty(&table)?)
    }
}

impl TrackedItemsSource for Workspace {
    fn item_ids(&self) -> Vec<ItemId> {
        self.sections.keys().cloned().collect()
    }

    fn item(&self, id: &ItemId) -> Option<&dyn TrackedItem> {
        self.sections.get(id).map(|s| s as &dyn TrackedItem)
    }

    fn item_mut(&mut self, id: &ItemId) -> Option<&mut dyn TrackedItem> {
        self.sections.get_mut(id).map(|s| s as &mut dyn TrackedItem)
    }

    fn create_item(&mut self, id: &ItemId, state: &DeltaSet) -> Result<()> {
        let mut section = SectionItem::new(id.clone());
        section.write_fields(state);
        self.sections.insert(id.clone(), section);
        Ok(())
    }

    fn delete_item(&mut self, id: &ItemId) -> Result<()> {
        let section = self
            .sections
            .get(id)
            .ok_or_else(|| Error::ItemNotFound(id.clone()))?;
        section.check_writable()?;
        self.sections.remove(id);
        Ok(())
    }
}
