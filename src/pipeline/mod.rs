use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, warn};

use crate::clock::SharedClock;
use crate::discovery::{DiscoveryCounts, DiscoveryRule, DiscoveryState};
use crate::health::HealthMetrics;
use crate::mapper::{EventMapper, InstanceEventMapper};
use crate::model::{Datapoint, DeltaRecord, Event, MetricSample, Sample};
use crate::queue::{
    ConsolidationQueue, DrainStats, QueueSnapshot, QueueTuning, Release, TuningError,
};
use crate::registry::{Registry, TargetConfig};
use crate::scheduler::{TaskSnapshot, TaskStates};

/// Invariant violations by callers of the pipeline.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum PipelineError {
    #[error("delta record has an empty target id")]
    EmptyTargetId,

    #[error("target system id is empty")]
    EmptyTargetSystem,

    #[error("invalid queue tuning: {0}")]
    InvalidTuning(#[from] TuningError),
}

/// Reasons an ingestion request is refused.
#[derive(Error, Debug)]
pub enum IngestError {
    #[error("unknown target system {0}")]
    UnknownTarget(String),

    #[error("sample {index}: {reason}")]
    MalformedSample { index: usize, reason: String },

    #[error(transparent)]
    Pipeline(#[from] PipelineError),
}

/// Pipeline-wide settings that do not change with configuration pushes.
#[derive(Debug, Clone)]
pub struct PipelineSettings {
    /// Tuning for queues of targets that have not had a configuration push.
    pub default_tuning: QueueTuning,
    pub discovery_rules: Vec<DiscoveryRule>,
    pub discovery_horizon: Duration,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            default_tuning: QueueTuning::default(),
            discovery_rules: vec![DiscoveryRule::default()],
            discovery_horizon: Duration::from_secs(20 * 60),
        }
    }
}

/// Per-target mutable state. The owning `DashMap` shard lock serializes
/// access to it.
struct TargetState {
    queue: ConsolidationQueue,
    discovery: DiscoveryState,
}

/// Outcome of one `ingest_samples` call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IngestSummary {
    pub accepted: usize,
    pub writes: usize,
    pub unmonitored: usize,
    pub potential: usize,
}

/// Records released for one target system by a datamap drain.
#[derive(Debug, Clone, PartialEq)]
pub struct TargetBatch {
    pub target: String,
    pub records: Vec<DeltaRecord>,
}

/// Serializable diagnostics view.
#[derive(Debug, Clone, Serialize)]
pub struct PipelineSnapshot {
    pub metric_queue: usize,
    pub event_queue: usize,
    pub targets: BTreeMap<String, TargetSnapshot>,
    pub tasks: Vec<TaskSnapshot>,
}

#[derive(Debug, Clone, Serialize)]
pub struct TargetSnapshot {
    pub configured: bool,
    pub resources: usize,
    pub queue: QueueSnapshot,
    pub discovery: DiscoveryCounts,
}

/// Process-wide ingestion and consolidation state.
///
/// Created once by the daemon and shared (`Arc`) between the HTTP handlers
/// and the scheduler tasks. Every method is synchronous; locks are held only
/// for the duration of the call. Lock order is registry, then target map,
/// then the metric/event queues.
pub struct Pipeline {
    settings: PipelineSettings,
    clock: SharedClock,
    health: Arc<HealthMetrics>,
    mapper: Arc<dyn EventMapper>,
    registry: RwLock<Registry>,
    metrics: Mutex<VecDeque<MetricSample>>,
    events: Mutex<VecDeque<Event>>,
    targets: DashMap<String, TargetState>,
    tasks: TaskStates,
}

impl Pipeline {
    pub fn new(settings: PipelineSettings, clock: SharedClock, health: Arc<HealthMetrics>) -> Self {
        Self {
            settings,
            clock,
            health,
            mapper: Arc::new(InstanceEventMapper::new()),
            registry: RwLock::new(Registry::new()),
            metrics: Mutex::new(VecDeque::new()),
            events: Mutex::new(VecDeque::new()),
            targets: DashMap::new(),
            tasks: TaskStates::new(),
        }
    }

    /// Replaces the event mapper.
    #[must_use]
    pub fn with_mapper(mut self, mapper: Arc<dyn EventMapper>) -> Self {
        self.mapper = mapper;
        self
    }

    pub fn clock(&self) -> &SharedClock {
        &self.clock
    }

    pub fn health(&self) -> &Arc<HealthMetrics> {
        &self.health
    }

    pub fn tasks(&self) -> &TaskStates {
        &self.tasks
    }

    // --- Configuration ---

    /// Applies a configuration push: replaces the registry namespace and the
    /// event-type list of `target`, and retunes its queue. An out-of-range
    /// tuning rejects the whole push.
    pub fn apply_config(&self, target: &str, config: &TargetConfig) -> Result<(), PipelineError> {
        if target.is_empty() {
            return Err(PipelineError::EmptyTargetSystem);
        }
        config.queue.validate()?;

        self.registry.write().set_config(target, config);

        self.targets
            .entry(target.to_string())
            .and_modify(|state| state.queue.set_tuning(config.queue))
            .or_insert_with(|| self.new_target_state(config.queue));
        self.health.target_systems.set(self.targets.len() as f64);

        debug!(
            target_system = target,
            datasources = config.datasources.len(),
            event_types = config.event_types.len(),
            "applied configuration push",
        );
        Ok(())
    }

    /// Drops all registry, queue and discovery state of `target`.
    pub fn remove_target_system(&self, target: &str) -> bool {
        let had_config = self.registry.write().remove_target_system(target);
        let had_state = self.targets.remove(target).is_some();

        let _ = self.health.datamap_held.remove_label_values(&[target]);
        let _ = self.health.blacklisted.remove_label_values(&[target]);
        self.health.target_systems.set(self.targets.len() as f64);

        had_config || had_state
    }

    pub fn has_target(&self, target: &str) -> bool {
        self.registry.read().has_target(target)
    }

    // --- Ingestion contract ---

    /// Queues one metric write.
    pub fn append_metric(&self, datapoint: Datapoint, value: f64, timestamp: SystemTime) {
        let mut metrics = self.metrics.lock();
        metrics.push_back(MetricSample {
            datapoint,
            value,
            timestamp,
        });
        self.health
            .queue_depth
            .with_label_values(&["metric"])
            .set(metrics.len() as f64);
    }

    /// Queues one event for the event sink.
    pub fn append_event(&self, event: Event) {
        let mut events = self.events.lock();
        events.push_back(event);
        self.health
            .queue_depth
            .with_label_values(&["event"])
            .set(events.len() as f64);
    }

    /// Appends a record to the consolidation queue of `target`, creating the
    /// target's state on first reference. `None` is a no-op.
    pub fn append_delta(
        &self,
        target: &str,
        record: Option<DeltaRecord>,
    ) -> Result<(), PipelineError> {
        let Some(record) = record else {
            return Ok(());
        };
        if target.is_empty() {
            self.health.deltas_rejected.inc();
            return Err(PipelineError::EmptyTargetSystem);
        }
        if record.target_id.is_empty() {
            self.health.deltas_rejected.inc();
            return Err(PipelineError::EmptyTargetId);
        }

        let mut state = self
            .targets
            .entry(target.to_string())
            .or_insert_with(|| self.new_target_state(self.settings.default_tuning));
        state.queue.append(Some(record));
        self.health
            .datamap_held
            .with_label_values(&[target])
            .set(state.queue.len() as f64);
        drop(state);

        self.health.deltas_appended.inc();
        self.health.target_systems.set(self.targets.len() as f64);
        Ok(())
    }

    /// Records that telemetry mentioned a resource that is not modeled yet.
    pub fn note_potential_resource(
        &self,
        target: &str,
        resource_id: &str,
        now: SystemTime,
    ) -> Result<(), PipelineError> {
        if target.is_empty() {
            return Err(PipelineError::EmptyTargetSystem);
        }
        self.targets
            .entry(target.to_string())
            .or_insert_with(|| self.new_target_state(self.settings.default_tuning))
            .discovery
            .note(resource_id, now);
        Ok(())
    }

    /// Resolves samples to datapoint writes. Samples for unknown resources
    /// are dropped; those whose meter matches a discovery rule are noted as
    /// potential sub-resources. Future timestamps are clamped to now.
    pub fn ingest_samples(
        &self,
        target: &str,
        samples: Vec<Sample>,
    ) -> Result<IngestSummary, IngestError> {
        let now = self.clock.now();
        let mut summary = IngestSummary::default();
        let mut writes = Vec::new();
        let mut potential = Vec::new();

        {
            let registry = self.registry.read();
            if !registry.has_target(target) {
                return Err(IngestError::UnknownTarget(target.to_string()));
            }

            for sample in samples {
                summary.accepted += 1;
                let timestamp = if sample.timestamp > now {
                    debug!(
                        resource_id = %sample.resource_id,
                        meter = %sample.meter,
                        "sample timestamp in the future, using now",
                    );
                    now
                } else {
                    sample.timestamp
                };

                let points = registry.datapoints_for(target, &sample.resource_id, &sample.meter);
                if points.is_empty() {
                    summary.unmonitored += 1;
                    if !registry.has_resource(target, &sample.resource_id)
                        && self
                            .settings
                            .discovery_rules
                            .iter()
                            .any(|rule| rule.matches_meter(&sample.meter))
                    {
                        potential.push(sample.resource_id);
                    }
                    continue;
                }

                for dp in points {
                    writes.push((dp.clone(), sample.volume, timestamp));
                }
            }
        }

        summary.writes = writes.len();
        for (dp, value, timestamp) in writes {
            self.append_metric(dp, value, timestamp);
        }

        summary.potential = potential.len();
        for resource_id in potential {
            self.note_potential_resource(target, &resource_id, now)?;
        }

        self.health
            .samples_received
            .inc_by(summary.accepted as f64);
        self.health
            .samples_unmonitored
            .inc_by(summary.unmonitored as f64);
        Ok(summary)
    }

    /// Maps a recognized event into delta records and queues the event for
    /// the event sink. Unrecognized event types are forwarded unmapped.
    /// Returns the number of records appended.
    pub fn ingest_event(&self, target: &str, mut event: Event) -> Result<usize, IngestError> {
        let recognized = {
            let registry = self.registry.read();
            if !registry.has_target(target) {
                return Err(IngestError::UnknownTarget(target.to_string()));
            }
            registry.handles_event_type(target, &event.event_type)
        };

        event.target_system = target.to_string();
        self.health.events_received.inc();

        let mut appended = 0;
        if recognized {
            let records = self.mapper.map(&mut event);
            if !records.is_empty() {
                self.health.events_mapped.inc();
            }
            for record in records {
                match self.append_delta(target, Some(record)) {
                    Ok(()) => appended += 1,
                    Err(e) => {
                        warn!(
                            target_system = target,
                            event_type = %event.event_type,
                            error = %e,
                            "dropping mapped record",
                        );
                    }
                }
            }
        }

        if event.summary.is_empty() {
            event.summary = format!("OpenStack: {}", event.event_type);
        }
        self.append_event(event);
        Ok(appended)
    }

    // --- Scheduler side ---

    /// Removes and returns every queued metric write, oldest first.
    pub fn take_metrics(&self) -> Vec<MetricSample> {
        let drained: Vec<MetricSample> = self.metrics.lock().drain(..).collect();
        self.health
            .queue_depth
            .with_label_values(&["metric"])
            .set(0.0);
        drained
    }

    /// Removes and returns every queued event, oldest first.
    pub fn take_events(&self) -> Vec<Event> {
        let drained: Vec<Event> = self.events.lock().drain(..).collect();
        self.health
            .queue_depth
            .with_label_values(&["event"])
            .set(0.0);
        drained
    }

    /// Drains every target's consolidation queue.
    ///
    /// Returns one ordered batch per target with released records. Targets
    /// with an empty queue and no registry namespace are pruned afterwards.
    pub fn drain_datamaps(&self) -> Vec<TargetBatch> {
        let configured: Vec<String> = self.registry.read().targets().map(String::from).collect();
        let names: Vec<String> = self.targets.iter().map(|e| e.key().clone()).collect();

        let mut batches = Vec::new();
        let mut prune = Vec::new();

        for name in names {
            let Some(mut state) = self.targets.get_mut(&name) else {
                continue;
            };
            let (release, stats) = state.queue.drain_release();
            let held = state.queue.len();
            let blacklisted = state.queue.snapshot().blacklisted.len();
            drop(state);

            self.record_drain(&name, &release, &stats, held, blacklisted);

            if held == 0 && !configured.contains(&name) {
                prune.push(name.clone());
            }
            if !release.is_empty() {
                batches.push(TargetBatch {
                    target: name,
                    records: release.into_ordered(),
                });
            }
        }

        for name in prune {
            if self.targets.remove_if(&name, |_, s| s.queue.is_empty()).is_some() {
                debug!(target_system = %name, "pruned state of unconfigured target");
                let _ = self.health.datamap_held.remove_label_values(&[&name]);
                let _ = self.health.blacklisted.remove_label_values(&[&name]);
            }
        }
        self.health.target_systems.set(self.targets.len() as f64);

        batches
    }

    /// Runs sub-resource discovery for every target and appends the
    /// resulting creation records. Returns the number discovered.
    pub fn discover_subresources(&self) -> usize {
        let now = self.clock.now();
        let registry = self.registry.read();
        let mut discovered = 0;

        for mut entry in self.targets.iter_mut() {
            let target = entry.key().clone();
            let state = entry.value_mut();
            let records = state.discovery.discover(
                &target,
                &registry,
                &self.settings.discovery_rules,
                now,
                self.settings.discovery_horizon,
            );
            discovered += records.len();
            for record in records {
                state.queue.append(Some(record));
                self.health.deltas_appended.inc();
            }
        }

        self.health.discoveries.inc_by(discovered as f64);
        discovered
    }

    pub fn snapshot(&self) -> PipelineSnapshot {
        let registry = self.registry.read();
        let mut targets: BTreeMap<String, TargetSnapshot> = self
            .targets
            .iter()
            .map(|entry| {
                let name = entry.key().clone();
                let snap = TargetSnapshot {
                    configured: registry.has_target(&name),
                    resources: registry.resource_count(&name),
                    queue: entry.value().queue.snapshot(),
                    discovery: entry.value().discovery.counts(),
                };
                (name, snap)
            })
            .collect();
        drop(registry);

        // Keep configured targets visible even before their first delta.
        for name in self.registry.read().targets() {
            targets.entry(name.to_string()).or_insert_with(|| TargetSnapshot {
                configured: true,
                resources: 0,
                queue: QueueSnapshot::default(),
                discovery: DiscoveryCounts::default(),
            });
        }

        PipelineSnapshot {
            metric_queue: self.metrics.lock().len(),
            event_queue: self.events.lock().len(),
            targets,
            tasks: self.tasks.snapshot(),
        }
    }

    /// Most recent release time of `target`'s queue.
    pub fn last_release(&self, target: &str) -> Option<SystemTime> {
        self.targets.get(target)?.queue.last_release()
    }

    /// Whether `target_id` is currently blacklisted in `target`'s queue.
    pub fn is_blacklisted(&self, target: &str, target_id: &str) -> bool {
        self.targets
            .get(target)
            .is_some_and(|state| state.queue.is_blacklisted(target_id))
    }

    /// Records held in `target`'s queue.
    pub fn held(&self, target: &str) -> usize {
        self.targets.get(target).map_or(0, |state| state.queue.len())
    }

    fn new_target_state(&self, tuning: QueueTuning) -> TargetState {
        TargetState {
            queue: ConsolidationQueue::new(tuning, self.clock.clone()),
            discovery: DiscoveryState::new(),
        }
    }

    fn record_drain(
        &self,
        target: &str,
        release: &Release,
        stats: &DrainStats,
        held: usize,
        blacklisted: usize,
    ) {
        let h = &self.health;
        h.deltas_released
            .with_label_values(&["create"])
            .inc_by(release.creates.len() as f64);
        h.deltas_released
            .with_label_values(&["link"])
            .inc_by(release.links.len() as f64);
        h.deltas_released
            .with_label_values(&["update"])
            .inc_by(release.updates.len() as f64);
        h.deltas_suppressed
            .with_label_values(&["shortlived"])
            .inc_by(stats.shortlived as f64);
        h.deltas_suppressed
            .with_label_values(&["blacklisted"])
            .inc_by(stats.suppressed as f64);
        h.datamap_held
            .with_label_values(&[target])
            .set(held as f64);
        h.blacklisted
            .with_label_values(&[target])
            .set(blacklisted as f64);
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use serde_json::json;

    use super::*;
    use crate::clock::{Clock, ManualClock};
    use crate::model::{DatapointKind, Lifecycle, Structure};
    use crate::registry::DatasourceConfig;

    fn setup() -> (Pipeline, ManualClock) {
        let clock = ManualClock::at_secs(1_700_000_000);
        let health = Arc::new(HealthMetrics::new().expect("metrics"));
        let pipeline = Pipeline::new(PipelineSettings::default(), clock.shared(), health);
        (pipeline, clock)
    }

    fn datapoint(path: &str) -> Datapoint {
        Datapoint {
            id: "dp".to_string(),
            name: "ds_dp".to_string(),
            component: String::new(),
            path: path.to_string(),
            kind: DatapointKind::Gauge,
            min: None,
            max: None,
            metadata: BTreeMap::new(),
        }
    }

    fn cloud_config() -> TargetConfig {
        TargetConfig {
            datasources: vec![DatasourceConfig {
                resource_id: "abc".to_string(),
                component: "server-abc".to_string(),
                component_kind: "Instance".to_string(),
                meters: [("cpu_util".to_string(), vec![datapoint("server-abc/cpu")])]
                    .into_iter()
                    .collect(),
            }],
            event_types: vec![
                "compute.instance.create.start".to_string(),
                "compute.instance.delete.end".to_string(),
            ],
            queue: QueueTuning::default(),
        }
    }

    fn sample(resource_id: &str, meter: &str, at: SystemTime) -> Sample {
        Sample {
            resource_id: resource_id.to_string(),
            meter: meter.to_string(),
            volume: 42.0,
            timestamp: at,
        }
    }

    #[test]
    fn test_append_delta_rejects_empty_ids() {
        let (pipeline, _clock) = setup();
        let record = DeltaRecord::new("", Structure::new("X", "", "components"));
        assert_eq!(
            pipeline.append_delta("cloud1", Some(record)),
            Err(PipelineError::EmptyTargetId)
        );
        assert_eq!(
            pipeline.append_delta("", Some(DeltaRecord::new("a", Structure::default()))),
            Err(PipelineError::EmptyTargetSystem)
        );
        assert_eq!(pipeline.append_delta("cloud1", None), Ok(()));
        assert_eq!(pipeline.held("cloud1"), 0);
        assert_eq!(pipeline.health().deltas_rejected.get(), 2.0);
    }

    #[test]
    fn test_samples_resolve_to_writes() {
        let (pipeline, clock) = setup();
        pipeline
            .apply_config("cloud1", &cloud_config())
            .expect("config");

        let past = clock.now() - Duration::from_secs(30);
        let future = clock.now() + Duration::from_secs(3600);
        let summary = pipeline
            .ingest_samples(
                "cloud1",
                vec![
                    sample("abc", "cpu_util", past),
                    sample("abc", "cpu_util", future),
                    sample("abc", "memory", past),
                    sample("zzz", "cpu_util", past),
                ],
            )
            .expect("ingest");

        assert_eq!(summary.accepted, 4);
        assert_eq!(summary.writes, 2);
        assert_eq!(summary.unmonitored, 2);
        assert_eq!(summary.potential, 0);

        let writes = pipeline.take_metrics();
        assert_eq!(writes.len(), 2);
        assert_eq!(writes[0].timestamp, past);
        assert_eq!(writes[1].timestamp, clock.now(), "future clamped to now");
        assert_eq!(writes[0].datapoint.path, "server-abc/cpu");
        assert!(pipeline.take_metrics().is_empty());
    }

    #[test]
    fn test_samples_for_unknown_target_rejected() {
        let (pipeline, clock) = setup();
        let err = pipeline
            .ingest_samples("nope", vec![sample("abc", "cpu_util", clock.now())])
            .expect_err("unknown target");
        assert!(matches!(err, IngestError::UnknownTarget(t) if t == "nope"));
    }

    #[test]
    fn test_network_sample_leads_to_discovery() {
        let (pipeline, clock) = setup();
        pipeline
            .apply_config("cloud1", &cloud_config())
            .expect("config");

        let summary = pipeline
            .ingest_samples(
                "cloud1",
                vec![sample(
                    "instance-00000001-abc-tap9",
                    "network.incoming.bytes",
                    clock.now(),
                )],
            )
            .expect("ingest");
        assert_eq!(summary.potential, 1);

        assert_eq!(pipeline.discover_subresources(), 1);
        assert_eq!(pipeline.held("cloud1"), 1);
        assert_eq!(pipeline.discover_subresources(), 0);

        clock.advance_secs(40);
        let batches = pipeline.drain_datamaps();
        assert_eq!(batches.len(), 1);
        let record = &batches[0].records[0];
        assert_eq!(record.target_id, "vnic-abc-tap9");
        assert_eq!(record.structure.container, "components/server-abc");
        assert_eq!(record.lifecycle, Lifecycle::Create);
    }

    #[test]
    fn test_recognized_event_is_mapped_and_forwarded() {
        let (pipeline, _clock) = setup();
        pipeline
            .apply_config("cloud1", &cloud_config())
            .expect("config");

        let event = Event::new("ignored", "compute.instance.create.start", 1.0)
            .with_trait("instance_id", "new-1")
            .with_trait("display_name", "vm");
        assert_eq!(pipeline.ingest_event("cloud1", event).expect("ingest"), 1);
        assert_eq!(pipeline.held("cloud1"), 1);

        let events = pipeline.take_events();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].target_system, "cloud1");
        assert_eq!(events[0].component, "server-new-1");
        assert_eq!(events[0].summary, "Instance vm created");
    }

    #[test]
    fn test_unrecognized_event_only_forwarded() {
        let (pipeline, _clock) = setup();
        pipeline
            .apply_config("cloud1", &cloud_config())
            .expect("config");

        // Known to the mapper but not enabled for this target.
        let event = Event::new("cloud1", "compute.instance.update", 1.0)
            .with_trait("instance_id", "new-1");
        assert_eq!(pipeline.ingest_event("cloud1", event).expect("ingest"), 0);
        assert_eq!(pipeline.held("cloud1"), 0);
        let events = pipeline.take_events();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].summary, "OpenStack: compute.instance.update");
        assert!(events[0].component.is_empty());
    }

    #[test]
    fn test_apply_config_retunes_queue() {
        let (pipeline, clock) = setup();
        pipeline
            .append_delta(
                "cloud1",
                Some(DeltaRecord::new("c1", Structure::default()).with_field("a", json!(1))),
            )
            .expect("append");

        clock.advance_secs(10);
        assert!(pipeline.drain_datamaps().is_empty());

        let mut config = cloud_config();
        config.queue.update_consolidate = Duration::from_secs(5);
        pipeline.apply_config("cloud1", &config).expect("config");
        assert_eq!(pipeline.drain_datamaps().len(), 1);
    }

    #[test]
    fn test_apply_config_rejects_oversized_tuning() {
        let (pipeline, clock) = setup();
        pipeline
            .apply_config("cloud1", &cloud_config())
            .expect("config");
        pipeline
            .append_delta(
                "cloud1",
                Some(DeltaRecord::new("c1", Structure::default()).with_field("a", json!(1))),
            )
            .expect("append");

        let config: TargetConfig =
            serde_json::from_value(json!({"queue": {"update_consolidate": "300000000000years"}}))
                .expect("parse");
        let err = pipeline
            .apply_config("cloud1", &config)
            .expect_err("oversized window");
        assert!(matches!(err, PipelineError::InvalidTuning(_)));

        // The previous configuration stays in force.
        assert_eq!(pipeline.snapshot().targets["cloud1"].resources, 1);
        clock.advance_secs(40);
        assert_eq!(pipeline.drain_datamaps().len(), 1);
    }

    #[test]
    fn test_unconfigured_target_pruned_after_drain() {
        let (pipeline, clock) = setup();
        pipeline
            .append_delta(
                "orphan",
                Some(DeltaRecord::delete("c1", Structure::default())),
            )
            .expect("append");
        pipeline
            .append_delta(
                "orphan",
                Some(DeltaRecord::new("c2", Structure::default())),
            )
            .expect("append");

        let batches = pipeline.drain_datamaps();
        assert_eq!(batches.len(), 1);
        assert_eq!(pipeline.held("orphan"), 1, "c2 still held");
        assert!(pipeline.snapshot().targets.contains_key("orphan"));

        clock.advance_secs(40);
        assert_eq!(pipeline.drain_datamaps().len(), 1);
        assert!(!pipeline.snapshot().targets.contains_key("orphan"));
    }

    #[test]
    fn test_remove_target_system_drops_everything() {
        let (pipeline, clock) = setup();
        pipeline
            .apply_config("cloud1", &cloud_config())
            .expect("config");
        pipeline
            .append_delta(
                "cloud1",
                Some(DeltaRecord::new("c1", Structure::default())),
            )
            .expect("append");
        pipeline
            .note_potential_resource("cloud1", "x-abc-tap0", clock.now())
            .expect("note");

        assert!(pipeline.remove_target_system("cloud1"));
        assert!(!pipeline.has_target("cloud1"));
        assert_eq!(pipeline.held("cloud1"), 0);
        assert!(pipeline.snapshot().targets.is_empty());
        assert!(!pipeline.remove_target_system("cloud1"));
    }

    #[test]
    fn test_snapshot_reports_queues() {
        let (pipeline, _clock) = setup();
        pipeline
            .apply_config("cloud1", &cloud_config())
            .expect("config");
        pipeline
            .append_delta("cloud1", Some(DeltaRecord::delete("gone", Structure::default())))
            .expect("append");
        pipeline.append_event(Event::new("cloud1", "x", 0.0));
        pipeline.drain_datamaps();

        let snap = pipeline.snapshot();
        assert_eq!(snap.event_queue, 1);
        assert_eq!(snap.metric_queue, 0);
        let cloud = &snap.targets["cloud1"];
        assert!(cloud.configured);
        assert_eq!(cloud.resources, 1);
        assert_eq!(cloud.queue.blacklisted, vec!["gone".to_string()]);
        assert!(pipeline.is_blacklisted("cloud1", "gone"));
        assert!(pipeline.last_release("cloud1").is_some());
        assert_eq!(snap.tasks.len(), 4);
    }
}
