pub mod delta;

use std::collections::BTreeMap;
use std::fmt;
use std::time::SystemTime;

use serde::{Deserialize, Serialize};

pub use delta::{is_reference_field, DeltaRecord, Lifecycle, Structure, REFERENCE_PREFIX};

/// Storage semantics of a datapoint.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DatapointKind {
    #[default]
    Gauge,
    Counter,
    Derive,
    Absolute,
}

impl DatapointKind {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Gauge => "gauge",
            Self::Counter => "counter",
            Self::Derive => "derive",
            Self::Absolute => "absolute",
        }
    }
}

/// A metric destination delivered by a configuration push.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Datapoint {
    /// Datapoint id within its datasource.
    pub id: String,
    /// Fully qualified datapoint name (`<datasource>_<datapoint>`).
    pub name: String,
    /// Modeled component owning the datapoint.
    #[serde(default)]
    pub component: String,
    /// Storage path of the series.
    pub path: String,
    #[serde(default)]
    pub kind: DatapointKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max: Option<f64>,
    /// Opaque tags forwarded with every write.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, String>,
}

/// One telemetry reading as reported by the control plane, before it is
/// resolved to datapoints.
#[derive(Debug, Clone, PartialEq)]
pub struct Sample {
    pub resource_id: String,
    /// Meter name, e.g. `cpu_util` or `network.incoming.bytes`.
    pub meter: String,
    pub volume: f64,
    pub timestamp: SystemTime,
}

/// One queued metric write.
#[derive(Debug, Clone, PartialEq)]
pub struct MetricSample {
    pub datapoint: Datapoint,
    pub value: f64,
    pub timestamp: SystemTime,
}

/// Event severity, ordered from least to most severe.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Clear,
    Debug,
    #[default]
    Info,
    Warning,
    Error,
    Critical,
}

impl Severity {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Clear => "clear",
            Self::Debug => "debug",
            Self::Info => "info",
            Self::Warning => "warning",
            Self::Error => "error",
            Self::Critical => "critical",
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Prefix used when building event class keys.
pub const EVENT_CLASS_PREFIX: &str = "openstack";

/// A structured lifecycle event bound for the event sink.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// Target system the event was reported by.
    pub target_system: String,
    /// Modeled component the event concerns, once known.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub component: String,
    /// Control-plane event type, e.g. `compute.instance.create.end`.
    pub event_type: String,
    #[serde(default)]
    pub summary: String,
    #[serde(default)]
    pub severity: Severity,
    /// Fractional Unix seconds.
    pub timestamp: f64,
    /// Event payload traits keyed by trait name.
    #[serde(default)]
    pub traits: BTreeMap<String, serde_json::Value>,
}

impl Event {
    pub fn new(
        target_system: impl Into<String>,
        event_type: impl Into<String>,
        timestamp: f64,
    ) -> Self {
        Self {
            target_system: target_system.into(),
            component: String::new(),
            event_type: event_type.into(),
            summary: String::new(),
            severity: Severity::Info,
            timestamp,
            traits: BTreeMap::new(),
        }
    }

    #[must_use]
    pub fn with_trait(
        mut self,
        name: impl Into<String>,
        value: impl Into<serde_json::Value>,
    ) -> Self {
        self.traits.insert(name.into(), value.into());
        self
    }

    /// Key used to classify the event downstream.
    pub fn event_class_key(&self) -> String {
        format!("{EVENT_CLASS_PREFIX}|{}", self.event_type)
    }

    /// Returns a trait rendered as text, if present and scalar.
    pub fn trait_str(&self, name: &str) -> Option<String> {
        match self.traits.get(name)? {
            serde_json::Value::String(s) => Some(s.clone()),
            serde_json::Value::Null => None,
            other @ (serde_json::Value::Number(_) | serde_json::Value::Bool(_)) => {
                Some(other.to_string())
            }
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_class_key() {
        let event = Event::new("cloud1", "compute.instance.create.end", 0.0);
        assert_eq!(
            event.event_class_key(),
            "openstack|compute.instance.create.end"
        );
    }

    #[test]
    fn test_trait_str_renders_scalars() {
        let event = Event::new("cloud1", "x", 0.0)
            .with_trait("name", "vm1")
            .with_trait("memory_mb", 512)
            .with_trait("ips", serde_json::json!(["10.0.0.1"]));

        assert_eq!(event.trait_str("name").as_deref(), Some("vm1"));
        assert_eq!(event.trait_str("memory_mb").as_deref(), Some("512"));
        assert!(event.trait_str("ips").is_none());
        assert!(event.trait_str("missing").is_none());
    }

    #[test]
    fn test_severity_ordering() {
        assert!(Severity::Critical > Severity::Warning);
        assert!(Severity::Clear < Severity::Info);
        assert_eq!(Severity::default(), Severity::Info);
    }

    #[test]
    fn test_datapoint_deserialize_defaults() {
        let dp: Datapoint = serde_yaml::from_str(
            "id: cpu_util\nname: cpu_util_cpu_util\npath: Devices/cloud1/server-1/cpu_util\n",
        )
        .expect("valid datapoint");
        assert_eq!(dp.kind, DatapointKind::Gauge);
        assert!(dp.min.is_none());
        assert!(dp.metadata.is_empty());
    }
}
