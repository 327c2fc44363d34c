use anyhow::Result;
use tracing::{debug, info};

use crate::clock;
use crate::model::{DeltaRecord, Event, MetricSample};

use super::{EventSink, MetricSink, ModelApplier};

/// Dry-run backend: every delivery becomes a log record.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogExporter;

impl LogExporter {
    pub fn new() -> Self {
        Self
    }

    pub fn name(&self) -> &str {
        "log"
    }
}

impl MetricSink for LogExporter {
    async fn write(&self, sample: &MetricSample) -> Result<()> {
        debug!(
            path = %sample.datapoint.path,
            datapoint = %sample.datapoint.name,
            value = sample.value,
            timestamp = clock::unix_secs(sample.timestamp),
            "metric write",
        );
        Ok(())
    }
}

impl EventSink for LogExporter {
    async fn send(&self, event: &Event) -> Result<()> {
        info!(
            target_system = %event.target_system,
            component = %event.component,
            event_class_key = %event.event_class_key(),
            severity = %event.severity,
            summary = %event.summary,
            "event",
        );
        Ok(())
    }
}

impl ModelApplier for LogExporter {
    async fn apply(&self, target: &str, records: &[DeltaRecord]) -> Result<()> {
        for record in records {
            info!(
                target_system = target,
                target_id = %record.target_id,
                lifecycle = %record.lifecycle,
                module = %record.structure.module,
                fields = record.fields.len(),
                "model change",
            );
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Structure;

    #[tokio::test]
    async fn test_log_exporter_accepts_everything() {
        let exporter = LogExporter::new();
        exporter
            .send(&Event::new("cloud1", "compute.instance.update", 0.0))
            .await
            .expect("send");
        exporter
            .apply(
                "cloud1",
                &[DeltaRecord::create("server-1", Structure::default())],
            )
            .await
            .expect("apply");
        assert_eq!(exporter.name(), "log");
    }
}
