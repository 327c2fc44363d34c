use std::collections::{BTreeMap, HashSet};
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Prefix that marks a field as a reference to another modeled entity.
pub const REFERENCE_PREFIX: &str = "set_";

/// Lifecycle bits carried by a delta record.
///
/// Two independent bits (create, delete) packed into one tag. Merging is a
/// monotonic OR: once a bit is set no later merge clears it.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Lifecycle {
    #[default]
    Update,
    Create,
    Delete,
    CreateDelete,
}

impl Lifecycle {
    /// Builds a lifecycle tag from its two bits.
    pub const fn from_bits(create: bool, delete: bool) -> Self {
        match (create, delete) {
            (false, false) => Self::Update,
            (true, false) => Self::Create,
            (false, true) => Self::Delete,
            (true, true) => Self::CreateDelete,
        }
    }

    pub const fn creates(self) -> bool {
        matches!(self, Self::Create | Self::CreateDelete)
    }

    pub const fn deletes(self) -> bool {
        matches!(self, Self::Delete | Self::CreateDelete)
    }

    /// OR-merges two lifecycle tags.
    #[must_use]
    pub const fn merge(self, other: Self) -> Self {
        Self::from_bits(
            self.creates() || other.creates(),
            self.deletes() || other.deletes(),
        )
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Update => "update",
            Self::Create => "create",
            Self::Delete => "delete",
            Self::CreateDelete => "create_delete",
        }
    }
}

impl fmt::Display for Lifecycle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identifying fields needed to rebuild a record when it is split.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Structure {
    /// Module (class family) of the modeled entity, e.g. `Instance`.
    pub module: String,
    /// Optional concrete class name.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub class_name: String,
    /// Containment path of the parent, e.g. `components/server-1`.
    #[serde(default)]
    pub container: String,
    /// Relationship the entity lives in on its container.
    #[serde(default)]
    pub relationship: String,
}

impl Structure {
    pub fn new(
        module: impl Into<String>,
        container: impl Into<String>,
        relationship: impl Into<String>,
    ) -> Self {
        Self {
            module: module.into(),
            class_name: String::new(),
            container: container.into(),
            relationship: relationship.into(),
        }
    }
}

/// A proposed change to one modeled entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeltaRecord {
    pub target_id: String,
    #[serde(default)]
    pub lifecycle: Lifecycle,
    #[serde(default)]
    pub structure: Structure,
    #[serde(default)]
    pub fields: BTreeMap<String, Value>,
}

impl DeltaRecord {
    /// Creates a plain update record with no fields.
    pub fn new(target_id: impl Into<String>, structure: Structure) -> Self {
        Self {
            target_id: target_id.into(),
            lifecycle: Lifecycle::Update,
            structure,
            fields: BTreeMap::new(),
        }
    }

    /// Creates a record that creates the entity.
    pub fn create(target_id: impl Into<String>, structure: Structure) -> Self {
        Self::new(target_id, structure).with_lifecycle(Lifecycle::Create)
    }

    /// Creates a record that deletes the entity.
    pub fn delete(target_id: impl Into<String>, structure: Structure) -> Self {
        Self::new(target_id, structure).with_lifecycle(Lifecycle::Delete)
    }

    #[must_use]
    pub fn with_lifecycle(mut self, lifecycle: Lifecycle) -> Self {
        self.lifecycle = lifecycle;
        self
    }

    #[must_use]
    pub fn with_field(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.fields.insert(name.into(), value.into());
        self
    }

    pub fn set_field(&mut self, name: impl Into<String>, value: impl Into<Value>) {
        self.fields.insert(name.into(), value.into());
    }

    pub fn field(&self, name: &str) -> Option<&Value> {
        self.fields.get(name)
    }

    pub fn creates(&self) -> bool {
        self.lifecycle.creates()
    }

    pub fn deletes(&self) -> bool {
        self.lifecycle.deletes()
    }

    /// Overlays `other` onto this record.
    ///
    /// Fields overwrite key by key, lifecycle bits are OR'd, and the
    /// identifying `target_id` and `structure` are left untouched.
    pub fn merge_from(&mut self, other: DeltaRecord) {
        self.lifecycle = self.lifecycle.merge(other.lifecycle);
        self.fields.extend(other.fields);
    }

    /// Returns an empty record for the same entity, carrying only the
    /// identifying fields.
    pub fn split_off(&self) -> Self {
        Self::new(self.target_id.clone(), self.structure.clone())
    }

    /// Iterates over `(field, referenced ids)` for every reference field.
    pub fn references(&self) -> impl Iterator<Item = (&str, Vec<&str>)> {
        self.fields
            .iter()
            .filter(|(name, _)| is_reference_field(name))
            .map(|(name, value)| (name.as_str(), referenced_ids(value)))
    }

    /// All entity ids named by reference fields.
    pub fn referenced_ids(&self) -> HashSet<&str> {
        self.references().flat_map(|(_, ids)| ids).collect()
    }

    /// Moves every reference field that names one of `ids` into a new
    /// record for the same entity. Returns `None` when nothing moved.
    pub fn extract_references_to(&mut self, ids: &HashSet<&str>) -> Option<DeltaRecord> {
        let moved: Vec<String> = self
            .references()
            .filter(|(_, refs)| refs.iter().any(|id| ids.contains(id)))
            .map(|(name, _)| name.to_string())
            .collect();

        if moved.is_empty() {
            return None;
        }

        let mut linked = self.split_off();
        for name in moved {
            if let Some(value) = self.fields.remove(&name) {
                linked.fields.insert(name, value);
            }
        }
        Some(linked)
    }
}

/// Whether a field name denotes a reference to another entity.
pub fn is_reference_field(name: &str) -> bool {
    name.len() > REFERENCE_PREFIX.len() && name.starts_with(REFERENCE_PREFIX)
}

/// Entity ids named by a reference value (a single id or a list of ids).
fn referenced_ids(value: &Value) -> Vec<&str> {
    match value {
        Value::String(id) => vec![id.as_str()],
        Value::Array(items) => items.iter().filter_map(Value::as_str).collect(),
        _ => Vec::new(),
    }
}
