use std::collections::{HashMap, HashSet};
use std::time::{Duration, SystemTime};

use serde::{Deserialize, Serialize};

use crate::clock;
use crate::model::{DeltaRecord, Structure};
use crate::registry::Registry;

/// How telemetry for an unmodeled child resource is tied back to a parent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscoveryRule {
    /// Meter name prefix of samples that may reveal a new child.
    pub meter_prefix: String,
    /// Component kind of candidate parents.
    pub parent_kind: String,
    /// Module of the discovered child.
    pub child_module: String,
    /// Relationship the child lives in on its parent.
    pub child_relationship: String,
    /// Prefix of the child's modeled id.
    pub child_id_prefix: String,
}

impl Default for DiscoveryRule {
    /// Virtual NICs show up in `network.*` meters before they are modeled.
    fn default() -> Self {
        Self {
            meter_prefix: "network.".to_string(),
            parent_kind: "Instance".to_string(),
            child_module: "Vnic".to_string(),
            child_relationship: "vnics".to_string(),
            child_id_prefix: "vnic".to_string(),
        }
    }
}

impl DiscoveryRule {
    pub fn matches_meter(&self, meter: &str) -> bool {
        meter.starts_with(&self.meter_prefix)
    }

    /// Builds the creation record for a child found under `parent_resource_id`.
    pub fn child_record(
        &self,
        candidate: &str,
        parent_resource_id: &str,
        parent_component_id: &str,
        suffix: &str,
    ) -> DeltaRecord {
        let structure = Structure::new(
            self.child_module.clone(),
            format!("components/{parent_component_id}"),
            self.child_relationship.clone(),
        );
        DeltaRecord::create(
            format!("{}-{parent_resource_id}-{suffix}", self.child_id_prefix),
            structure,
        )
        .with_field("title", suffix)
        .with_field("resourceId", candidate)
    }
}

/// Returns the child suffix when `candidate` embeds `-<parent>-<suffix>`.
pub fn match_parent<'a>(candidate: &'a str, parent_resource_id: &str) -> Option<&'a str> {
    if parent_resource_id.is_empty() {
        return None;
    }
    let needle = format!("-{parent_resource_id}-");
    let at = candidate.find(&needle)?;
    let suffix = &candidate[at + needle.len()..];
    (!suffix.is_empty()).then_some(suffix)
}

/// Per-target record of resource ids seen in telemetry but not yet modeled.
#[derive(Debug, Default)]
pub struct DiscoveryState {
    potential: HashMap<String, SystemTime>,
    modeled: HashSet<String>,
}

/// Counts exposed in diagnostics.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct DiscoveryCounts {
    pub potential: usize,
    pub modeled: usize,
}

impl DiscoveryState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a sighting of `resource_id`. Only the first sighting counts.
    pub fn note(&mut self, resource_id: &str, now: SystemTime) {
        if self.modeled.contains(resource_id) {
            return;
        }
        self.potential.entry(resource_id.to_string()).or_insert(now);
    }

    pub fn is_modeled(&self, resource_id: &str) -> bool {
        self.modeled.contains(resource_id)
    }

    pub fn counts(&self) -> DiscoveryCounts {
        DiscoveryCounts {
            potential: self.potential.len(),
            modeled: self.modeled.len(),
        }
    }

    /// Candidates younger than `horizon` that have not been modeled.
    fn pending(&self, now: SystemTime, horizon: Duration) -> Vec<String> {
        let mut pending: Vec<String> = self
            .potential
            .iter()
            .filter(|(id, _)| !self.modeled.contains(*id))
            .filter(|(_, first_seen)| clock::elapsed_since(now, **first_seen) < horizon)
            .map(|(id, _)| id.clone())
            .collect();
        pending.sort();
        pending
    }

    /// Matches every pending candidate against the known parents of each
    /// rule's kind and returns creation records for the ones that matched.
    ///
    /// Every parent is tried; the first match wins and the candidate is
    /// marked modeled so it is never emitted again. Candidates past the
    /// horizon are skipped, not purged.
    pub fn discover(
        &mut self,
        target: &str,
        registry: &Registry,
        rules: &[DiscoveryRule],
        now: SystemTime,
        horizon: Duration,
    ) -> Vec<DeltaRecord> {
        let mut found = Vec::new();

        for candidate in self.pending(now, horizon) {
            if let Some(record) = match_candidate(target, registry, rules, &candidate) {
                self.modeled.insert(candidate);
                found.push(record);
            }
        }

        found
    }
}

fn match_candidate(
    target: &str,
    registry: &Registry,
    rules: &[DiscoveryRule],
    candidate: &str,
) -> Option<DeltaRecord> {
    for rule in rules {
        for parent in registry.resource_ids_of_kind(target, &rule.parent_kind) {
            let Some(suffix) = match_parent(candidate, &parent) else {
                continue;
            };
            let Some(parent_component) = registry.component_id_for(target, &parent) else {
                continue;
            };

            tracing::info!(
                target_system = target,
                candidate,
                parent = %parent,
                module = %rule.child_module,
                "discovered sub-resource",
            );
            return Some(rule.child_record(candidate, &parent, parent_component, suffix));
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{Clock, ManualClock};
    use crate::model::Lifecycle;
    use crate::registry::{DatasourceConfig, TargetConfig};

    const HORIZON: Duration = Duration::from_secs(20 * 60);

    fn registry_with_instances(ids: &[&str]) -> Registry {
        let mut registry = Registry::new();
        registry.set_config(
            "cloud1",
            &TargetConfig {
                datasources: ids
                    .iter()
                    .map(|id| DatasourceConfig {
                        resource_id: id.to_string(),
                        component: format!("server-{id}"),
                        component_kind: "Instance".to_string(),
                        meters: Default::default(),
                    })
                    .collect(),
                ..Default::default()
            },
        );
        registry
    }

    #[test]
    fn test_match_parent() {
        assert_eq!(
            match_parent("instance-00000001-abc-123-tap1", "abc-123"),
            Some("tap1")
        );
        assert_eq!(match_parent("instance-00000001-abc-123-", "abc-123"), None);
        assert_eq!(match_parent("abc-123-tap1", "abc-123"), None);
        assert_eq!(match_parent("instance-1-xyz-tap1", "abc"), None);
        assert_eq!(match_parent("instance-1--tap1", ""), None);
    }

    #[test]
    fn test_discovers_vnic_under_instance() {
        let clock = ManualClock::at_secs(10_000);
        let registry = registry_with_instances(&["abc-123"]);
        let rules = vec![DiscoveryRule::default()];
        let mut state = DiscoveryState::new();

        state.note("instance-00000001-abc-123-tap1", clock.now());
        let found = state.discover("cloud1", &registry, &rules, clock.now(), HORIZON);

        assert_eq!(found.len(), 1);
        let record = &found[0];
        assert_eq!(record.target_id, "vnic-abc-123-tap1");
        assert_eq!(record.lifecycle, Lifecycle::Create);
        assert_eq!(record.structure.module, "Vnic");
        assert_eq!(record.structure.container, "components/server-abc-123");
        assert_eq!(record.structure.relationship, "vnics");
        assert_eq!(record.field("title"), Some(&serde_json::json!("tap1")));
        assert!(state.is_modeled("instance-00000001-abc-123-tap1"));

        // Never emitted twice.
        state.note("instance-00000001-abc-123-tap1", clock.now());
        assert!(state
            .discover("cloud1", &registry, &rules, clock.now(), HORIZON)
            .is_empty());
    }

    #[test]
    fn test_tries_every_parent() {
        let clock = ManualClock::at_secs(10_000);
        let registry = registry_with_instances(&["aaa", "bbb", "ccc"]);
        let rules = vec![DiscoveryRule::default()];
        let mut state = DiscoveryState::new();

        state.note("instance-9-ccc-tap7", clock.now());
        let found = state.discover("cloud1", &registry, &rules, clock.now(), HORIZON);
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].target_id, "vnic-ccc-tap7");
    }

    #[test]
    fn test_unmatched_retried_until_horizon() {
        let clock = ManualClock::at_secs(10_000);
        let mut registry = registry_with_instances(&[]);
        let rules = vec![DiscoveryRule::default()];
        let mut state = DiscoveryState::new();

        state.note("instance-9-late-tap0", clock.now());
        assert!(state
            .discover("cloud1", &registry, &rules, clock.now(), HORIZON)
            .is_empty());

        // Parent shows up in a later config push, still inside the horizon.
        clock.advance_secs(60);
        registry = registry_with_instances(&["late"]);
        assert_eq!(
            state
                .discover("cloud1", &registry, &rules, clock.now(), HORIZON)
                .len(),
            1
        );
    }

    #[test]
    fn test_expired_candidates_abandoned() {
        let clock = ManualClock::at_secs(10_000);
        let registry = registry_with_instances(&["abc"]);
        let rules = vec![DiscoveryRule::default()];
        let mut state = DiscoveryState::new();

        state.note("instance-1-abc-tap1", clock.now());
        clock.advance(HORIZON);
        assert!(state
            .discover("cloud1", &registry, &rules, clock.now(), HORIZON)
            .is_empty());
        assert!(!state.is_modeled("instance-1-abc-tap1"));
        assert_eq!(state.counts().potential, 1);
    }

    #[test]
    fn test_first_sighting_time_is_kept() {
        let clock = ManualClock::at_secs(10_000);
        let registry = registry_with_instances(&["abc"]);
        let rules = vec![DiscoveryRule::default()];
        let mut state = DiscoveryState::new();

        state.note("instance-1-abc-tap1", clock.now());
        clock.advance(HORIZON);
        state.note("instance-1-abc-tap1", clock.now());
        assert!(state
            .discover("cloud1", &registry, &rules, clock.now(), HORIZON)
            .is_empty());
    }
}
