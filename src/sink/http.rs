use std::collections::BTreeMap;
use std::io::Write;

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::clock;
use crate::config::HttpSinkConfig;
use crate::model::{DeltaRecord, Event, MetricSample};

use super::{EventSink, MetricSink, ModelApplier};

/// JSON body of one metric write.
#[derive(Debug, Clone, Serialize)]
pub struct MetricWriteJson<'a> {
    pub path: &'a str,
    pub datapoint: &'a str,
    #[serde(skip_serializing_if = "is_empty_str")]
    pub component: &'a str,
    pub kind: &'static str,
    pub value: f64,
    /// Fractional Unix seconds.
    pub timestamp: f64,
    pub date_time: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub min: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max: Option<f64>,
    #[serde(skip_serializing_if = "is_empty_map")]
    pub metadata: &'a BTreeMap<String, String>,
}

fn is_empty_str(v: &&str) -> bool {
    v.is_empty()
}

fn is_empty_map(v: &&BTreeMap<String, String>) -> bool {
    v.is_empty()
}

impl<'a> MetricWriteJson<'a> {
    fn from_sample(sample: &'a MetricSample) -> Self {
        let dp = &sample.datapoint;
        Self {
            path: &dp.path,
            datapoint: &dp.name,
            component: &dp.component,
            kind: dp.kind.as_str(),
            value: sample.value,
            timestamp: clock::unix_secs(sample.timestamp),
            date_time: format_datetime(sample.timestamp),
            min: dp.min,
            max: dp.max,
            metadata: &dp.metadata,
        }
    }
}

/// JSON body of one model batch.
#[derive(Debug, Clone, Serialize)]
pub struct ModelBatchJson<'a> {
    pub target_system: &'a str,
    pub records: &'a [DeltaRecord],
}

/// HTTP JSON exporter with optional compression.
///
/// Each metric write, event and model batch is one POST to its configured
/// URL. A non-2xx status fails the call.
pub struct HttpExporter {
    cfg: HttpSinkConfig,
    client: reqwest::Client,
}

impl HttpExporter {
    /// Creates a new HTTP exporter with the given configuration.
    pub fn new(cfg: HttpSinkConfig) -> Result<Self> {
        if !is_supported_compression(&cfg.compression) {
            bail!("unsupported compression: {}", cfg.compression);
        }

        let mut client_builder = reqwest::Client::builder().timeout(cfg.request_timeout);

        if !cfg.keep_alive {
            client_builder = client_builder.pool_max_idle_per_host(0);
        }

        let client = client_builder.build().context("building HTTP client")?;

        tracing::info!(
            metrics_url = %cfg.metrics_url,
            events_url = %cfg.events_url,
            model_url = %cfg.model_url,
            compression = %cfg.compression,
            "HTTP exporter ready",
        );

        Ok(Self { cfg, client })
    }

    /// Returns the exporter name for logging.
    pub fn name(&self) -> &str {
        "http"
    }

    /// Serializes and compresses a payload. Returns the body and its
    /// Content-Encoding, if any.
    fn encode<T: Serialize + ?Sized>(
        &self,
        payload: &T,
    ) -> Result<(Vec<u8>, Option<&'static str>)> {
        let raw = serde_json::to_vec(payload).context("serializing payload to JSON")?;
        let body = compress(&raw, &self.cfg.compression).context("compressing JSON payload")?;
        Ok((body, content_encoding(&self.cfg.compression)))
    }

    async fn post<T: Serialize + ?Sized>(&self, url: &str, payload: &T) -> Result<()> {
        let (body, encoding) = self.encode(payload)?;
        let bytes = body.len();

        let mut request = self
            .client
            .post(url)
            .header("Content-Type", "application/json")
            .body(body);

        if let Some(encoding) = encoding {
            request = request.header("Content-Encoding", encoding);
        }

        for (k, v) in &self.cfg.headers {
            request = request.header(k.as_str(), v.as_str());
        }

        let resp = request
            .send()
            .await
            .with_context(|| format!("sending request to {url}"))?;

        let status = resp.status();
        // Drain body for connection reuse.
        let _ = resp.bytes().await;

        if !status.is_success() {
            bail!("unexpected status from {url}: {status}");
        }

        tracing::trace!(url, bytes, "delivered payload");

        Ok(())
    }
}

impl MetricSink for HttpExporter {
    async fn write(&self, sample: &MetricSample) -> Result<()> {
        let body = MetricWriteJson::from_sample(sample);
        self.post(&self.cfg.metrics_url, &body).await
    }
}

impl EventSink for HttpExporter {
    async fn send(&self, event: &Event) -> Result<()> {
        self.post(&self.cfg.events_url, event).await
    }
}

impl ModelApplier for HttpExporter {
    async fn apply(&self, target: &str, records: &[DeltaRecord]) -> Result<()> {
        let body = ModelBatchJson {
            target_system: target,
            records,
        };
        self.post(&self.cfg.model_url, &body).await
    }
}

// --- Compression ---

fn is_supported_compression(algorithm: &str) -> bool {
    matches!(algorithm, "none" | "" | "gzip" | "zstd" | "zlib")
}

/// Compresses data using the specified algorithm.
fn compress(data: &[u8], algorithm: &str) -> Result<Vec<u8>> {
    match algorithm {
        "none" | "" => Ok(data.to_vec()),
        "gzip" => compress_gzip(data),
        "zstd" => compress_zstd(data),
        "zlib" => compress_zlib(data),
        other => bail!("unsupported compression: {other}"),
    }
}

/// Returns the Content-Encoding header value for the algorithm.
fn content_encoding(algorithm: &str) -> Option<&'static str> {
    match algorithm {
        "gzip" => Some("gzip"),
        "zstd" => Some("zstd"),
        "zlib" => Some("deflate"),
        _ => None,
    }
}

fn compress_gzip(data: &[u8]) -> Result<Vec<u8>> {
    use flate2::write::GzEncoder;
    use flate2::Compression;

    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(data).context("gzip write")?;
    encoder.finish().context("gzip finish")
}

fn compress_zstd(data: &[u8]) -> Result<Vec<u8>> {
    zstd::encode_all(data, 0).context("zstd encode")
}

fn compress_zlib(data: &[u8]) -> Result<Vec<u8>> {
    use flate2::write::ZlibEncoder;
    use flate2::Compression;

    let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(data).context("zlib write")?;
    encoder.finish().context("zlib finish")
}

// --- Datetime formatting ---

/// Formats a SystemTime as `2006-01-02 15:04:05.000` in UTC.
fn format_datetime(t: std::time::SystemTime) -> String {
    let dt: DateTime<Utc> = t.into();
    dt.format("%Y-%m-%d %H:%M:%S%.3f").to_string()
}

#[cfg(test)]
mod tests {
    use std::time::{Duration, SystemTime};

    use super::*;
    use crate::model::{Datapoint, DatapointKind, Structure};

    fn test_config(compression: &str) -> HttpSinkConfig {
        HttpSinkConfig {
            metrics_url: "http://127.0.0.1:1/metrics".to_string(),
            events_url: "http://127.0.0.1:1/events".to_string(),
            model_url: "http://127.0.0.1:1/model".to_string(),
            compression: compression.to_string(),
            ..HttpSinkConfig::default()
        }
    }

    fn sample() -> MetricSample {
        MetricSample {
            datapoint: Datapoint {
                id: "cpu_util".to_string(),
                name: "cpu_util_cpu_util".to_string(),
                component: "server-1".to_string(),
                path: "Devices/cloud1/server-1/cpu_util".to_string(),
                kind: DatapointKind::Gauge,
                min: Some(0.0),
                max: None,
                metadata: BTreeMap::new(),
            },
            value: 12.5,
            timestamp: SystemTime::UNIX_EPOCH + Duration::from_millis(1_500),
        }
    }

    #[test]
    fn test_compress_none() {
        let data = b"hello world";
        let result = compress(data, "none").expect("compress none");
        assert_eq!(result, data);
    }

    #[test]
    fn test_compress_gzip_roundtrip() {
        let data = b"hello world compressed with gzip";
        let compressed = compress(data, "gzip").expect("gzip compress");
        assert_ne!(compressed, data.as_slice());

        use flate2::read::GzDecoder;
        use std::io::Read;
        let mut decoder = GzDecoder::new(compressed.as_slice());
        let mut decompressed = Vec::new();
        decoder
            .read_to_end(&mut decompressed)
            .expect("gzip decompress");
        assert_eq!(decompressed, data);
    }

    #[test]
    fn test_compress_zstd_roundtrip() {
        let data = b"hello world compressed with zstd";
        let compressed = compress(data, "zstd").expect("zstd compress");
        let decompressed = zstd::decode_all(compressed.as_slice()).expect("zstd decompress");
        assert_eq!(decompressed, data);
    }

    #[test]
    fn test_content_encoding() {
        assert_eq!(content_encoding("gzip"), Some("gzip"));
        assert_eq!(content_encoding("zstd"), Some("zstd"));
        assert_eq!(content_encoding("zlib"), Some("deflate"));
        assert_eq!(content_encoding("none"), None);
        assert_eq!(content_encoding(""), None);
    }

    #[test]
    fn test_new_rejects_unknown_compression() {
        assert!(HttpExporter::new(test_config("snappy")).is_err());
    }

    #[test]
    fn test_format_datetime() {
        let t = SystemTime::UNIX_EPOCH;
        assert_eq!(format_datetime(t), "1970-01-01 00:00:00.000");
    }

    #[test]
    fn test_metric_write_json_shape() {
        let sample = sample();
        let value =
            serde_json::to_value(MetricWriteJson::from_sample(&sample)).expect("serialize");

        assert_eq!(value["path"], "Devices/cloud1/server-1/cpu_util");
        assert_eq!(value["datapoint"], "cpu_util_cpu_util");
        assert_eq!(value["kind"], "gauge");
        assert_eq!(value["value"], 12.5);
        assert_eq!(value["timestamp"], 1.5);
        assert_eq!(value["date_time"], "1970-01-01 00:00:01.500");
        assert_eq!(value["min"], 0.0);
        assert!(value.get("max").is_none());
        assert!(value.get("metadata").is_none());
    }

    #[tokio::test]
    async fn test_encode_gzip_sets_content_encoding() {
        let exporter = HttpExporter::new(test_config("gzip")).expect("exporter");
        let records = [DeltaRecord::create("server-1", Structure::default())];
        let body = ModelBatchJson {
            target_system: "cloud1",
            records: &records,
        };

        let (bytes, encoding) = exporter.encode(&body).expect("encode");
        assert_eq!(encoding, Some("gzip"));

        use flate2::read::GzDecoder;
        use std::io::Read;
        let mut decoded = String::new();
        GzDecoder::new(bytes.as_slice())
            .read_to_string(&mut decoded)
            .expect("gzip decompress");
        let value: serde_json::Value = serde_json::from_str(&decoded).expect("json");
        assert_eq!(value["target_system"], "cloud1");
        assert_eq!(value["records"][0]["target_id"], "server-1");
    }

    #[tokio::test]
    async fn test_unreachable_endpoint_fails() {
        let mut cfg = test_config("none");
        cfg.request_timeout = Duration::from_millis(500);
        let exporter = HttpExporter::new(cfg).expect("exporter");

        let result = exporter
            .send(&Event::new("cloud1", "compute.instance.update", 0.0))
            .await;
        assert!(result.is_err());
    }
}
