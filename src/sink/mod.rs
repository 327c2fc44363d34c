pub mod http;
pub mod log;

use std::future::Future;

use anyhow::Result;

use crate::model::{DeltaRecord, Event, MetricSample};

use self::http::HttpExporter;
use self::log::LogExporter;

/// Receives resolved metric writes, one at a time.
pub trait MetricSink: Send + Sync {
    fn write(&self, sample: &MetricSample) -> impl Future<Output = Result<()>> + Send;
}

/// Receives structured events, one at a time.
pub trait EventSink: Send + Sync {
    fn send(&self, event: &Event) -> impl Future<Output = Result<()>> + Send;
}

/// Applies an ordered batch of delta records to the object model of one
/// target system. A failure fails the whole batch.
pub trait ModelApplier: Send + Sync {
    fn apply(
        &self,
        target: &str,
        records: &[DeltaRecord],
    ) -> impl Future<Output = Result<()>> + Send;
}

/// Exporter dispatches to the configured delivery backend.
///
/// Uses enum dispatch rather than trait objects so the async trait methods
/// need no boxing.
pub enum Exporter {
    Http(HttpExporter),
    Log(LogExporter),
}

impl Exporter {
    /// Returns the exporter name for logging.
    pub fn name(&self) -> &str {
        match self {
            Self::Http(e) => e.name(),
            Self::Log(e) => e.name(),
        }
    }
}

impl MetricSink for Exporter {
    async fn write(&self, sample: &MetricSample) -> Result<()> {
        match self {
            Self::Http(e) => e.write(sample).await,
            Self::Log(e) => e.write(sample).await,
        }
    }
}

impl EventSink for Exporter {
    async fn send(&self, event: &Event) -> Result<()> {
        match self {
            Self::Http(e) => e.send(event).await,
            Self::Log(e) => e.send(event).await,
        }
    }
}

impl ModelApplier for Exporter {
    async fn apply(&self, target: &str, records: &[DeltaRecord]) -> Result<()> {
        match self {
            Self::Http(e) => e.apply(target, records).await,
            Self::Log(e) => e.apply(target, records).await,
        }
    }
}
