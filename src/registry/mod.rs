use std::collections::{BTreeMap, HashMap, HashSet};

use serde::{Deserialize, Serialize};

use crate::model::Datapoint;
use crate::queue::QueueTuning;

/// One datasource entry of a configuration push.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DatasourceConfig {
    /// Opaque resource id reported by the telemetry source.
    pub resource_id: String,
    /// Modeled component the resource maps to.
    pub component: String,
    /// Component kind, e.g. `Instance`.
    #[serde(default)]
    pub component_kind: String,
    /// Datapoint destinations keyed by meter name.
    #[serde(default)]
    pub meters: BTreeMap<String, Vec<Datapoint>>,
}

/// A full configuration push for one target system.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TargetConfig {
    #[serde(default)]
    pub datasources: Vec<DatasourceConfig>,
    /// Event types the mapper is allowed to translate.
    #[serde(default)]
    pub event_types: Vec<String>,
    /// Hold windows for the target's consolidation queue.
    #[serde(default)]
    pub queue: QueueTuning,
}

#[derive(Debug, Clone)]
struct ResourceEntry {
    component_id: String,
    kind: String,
    meters: HashMap<String, Vec<Datapoint>>,
}

#[derive(Debug, Default, Clone)]
struct TargetRegistry {
    resources: HashMap<String, ResourceEntry>,
    event_types: HashSet<String>,
}

/// Maps external resource ids to modeled components, per target system.
///
/// Each target's namespace is replaced wholesale by [`set_config`]; there is
/// no incremental update. Lookup misses return `None`/empty and are never
/// errors.
///
/// [`set_config`]: Registry::set_config
#[derive(Debug, Default)]
pub struct Registry {
    targets: HashMap<String, TargetRegistry>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces the namespace of `target` with the contents of `config`.
    ///
    /// When a resource id is listed more than once, the meters of the later
    /// entries are added to the first one.
    pub fn set_config(&mut self, target: &str, config: &TargetConfig) {
        let mut resources: HashMap<String, ResourceEntry> = HashMap::new();

        for ds in &config.datasources {
            let entry = resources
                .entry(ds.resource_id.clone())
                .or_insert_with(|| ResourceEntry {
                    component_id: ds.component.clone(),
                    kind: ds.component_kind.clone(),
                    meters: HashMap::new(),
                });
            for (meter, points) in &ds.meters {
                entry
                    .meters
                    .entry(meter.clone())
                    .or_default()
                    .extend(points.iter().cloned());
            }
        }

        let event_types = config.event_types.iter().cloned().collect();
        self.targets.insert(
            target.to_string(),
            TargetRegistry {
                resources,
                event_types,
            },
        );
    }

    pub fn has_target(&self, target: &str) -> bool {
        self.targets.contains_key(target)
    }

    pub fn targets(&self) -> impl Iterator<Item = &str> {
        self.targets.keys().map(String::as_str)
    }

    pub fn has_resource(&self, target: &str, resource_id: &str) -> bool {
        self.resource(target, resource_id).is_some()
    }

    pub fn component_id_for(&self, target: &str, resource_id: &str) -> Option<&str> {
        self.resource(target, resource_id)
            .map(|entry| entry.component_id.as_str())
    }

    /// Datapoint destinations for one meter of one resource.
    pub fn datapoints_for(&self, target: &str, resource_id: &str, meter: &str) -> &[Datapoint] {
        self.resource(target, resource_id)
            .and_then(|entry| entry.meters.get(meter))
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    /// Resource ids whose component kind is `kind`, sorted.
    pub fn resource_ids_of_kind(&self, target: &str, kind: &str) -> Vec<String> {
        let Some(ns) = self.targets.get(target) else {
            return Vec::new();
        };
        let mut ids: Vec<String> = ns
            .resources
            .iter()
            .filter(|(_, entry)| entry.kind == kind)
            .map(|(id, _)| id.clone())
            .collect();
        ids.sort();
        ids
    }

    pub fn handles_event_type(&self, target: &str, event_type: &str) -> bool {
        self.targets
            .get(target)
            .is_some_and(|ns| ns.event_types.contains(event_type))
    }

    pub fn resource_count(&self, target: &str) -> usize {
        self.targets.get(target).map_or(0, |ns| ns.resources.len())
    }

    /// Drops the namespace of `target`. Returns whether it existed.
    pub fn remove_target_system(&mut self, target: &str) -> bool {
        self.targets.remove(target).is_some()
    }

    fn resource(&self, target: &str, resource_id: &str) -> Option<&ResourceEntry> {
        self.targets.get(target)?.resources.get(resource_id)
    }
}
