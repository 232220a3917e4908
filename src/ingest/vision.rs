//! Vision service frame source.
//!
//! This module provides `VisionApiSource`, which polls a vision service over
//! HTTP (`GET {endpoint}/get_frame`) for one frame per call.
//!
//! The service answers with a JSON envelope:
//!
//! ```json
//! {
//!   "status": {"code": 200, "message": "ok"},
//!   "frame": {"frame": "<base64>", "content_type": "image/png"},
//!   "metadata": {"camera": "cam0"},
//!   "timestamp": 1700000000123
//! }
//! ```
//!
//! Code 200 carries a frame. Any other code means "no frame right now" and
//! `message` says why. `frame.content_type` is optional; a value that is not
//! a MIME type falls back to the configured default.
//!
//! `stub://` endpoints select an in-process synthetic source instead, which
//! is handy for running the daemon without a camera.

use anyhow::{anyhow, Context, Result};
use base64::{engine::general_purpose::STANDARD, Engine};
use serde::Deserialize;
use serde_json::{Map, Value};
use std::io::Read;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use url::Url;

use super::{FetchResult, FrameSource};
use crate::frame::Frame;

/// Upper bound on an envelope body. Base64 inflates frames by a third.
const MAX_ENVELOPE_BYTES: u64 = 16 * 1024 * 1024;
const FRAME_PATH: &str = "get_frame";
const STATUS_OK: u16 = 200;

/// Configuration for a vision service source.
#[derive(Clone, Debug)]
pub struct VisionApiConfig {
    /// Service base URL. `http(s)://` for a real service, `stub://` for synthetic frames.
    pub endpoint: String,
    /// Bound on each request, connect through body.
    pub timeout: Duration,
    /// Media type assumed when the envelope does not name one.
    pub content_type: String,
}

impl Default for VisionApiConfig {
    fn default() -> Self {
        Self {
            endpoint: "http://127.0.0.1:5000".to_string(),
            timeout: Duration::from_secs(5),
            content_type: "image/png".to_string(),
        }
    }
}

/// Statistics for a vision source.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct VisionStats {
    pub frames_received: u64,
    pub no_data: u64,
    pub malformed: u64,
    pub unreachable: u64,
    pub source: String,
}

/// Vision service frame source.
pub struct VisionApiSource {
    config: VisionApiConfig,
    backend: VisionBackend,
    stats: VisionStats,
}

enum VisionBackend {
    Http(HttpVisionBackend),
    Synthetic(SyntheticVisionBackend),
}

impl VisionApiSource {
    pub fn new(config: VisionApiConfig) -> Result<Self> {
        let url = Url::parse(&config.endpoint)
            .with_context(|| format!("parse vision endpoint '{}'", config.endpoint))?;
        let backend = match url.scheme() {
            "http" | "https" => VisionBackend::Http(HttpVisionBackend::new(&config)),
            "stub" => VisionBackend::Synthetic(SyntheticVisionBackend::default()),
            other => {
                return Err(anyhow!(
                    "unsupported vision endpoint scheme '{}'; expected http(s) or stub",
                    other
                ))
            }
        };
        let stats = VisionStats {
            source: config.endpoint.clone(),
            ..VisionStats::default()
        };
        Ok(Self {
            config,
            backend,
            stats,
        })
    }

    pub fn stats(&self) -> VisionStats {
        self.stats.clone()
    }

    fn record(&mut self, result: &FetchResult) {
        match result {
            FetchResult::Frame(_) => self.stats.frames_received += 1,
            FetchResult::NoData(_) => self.stats.no_data += 1,
            FetchResult::Malformed(_) => self.stats.malformed += 1,
            FetchResult::Unreachable(_) => self.stats.unreachable += 1,
        }
    }
}

impl FrameSource for VisionApiSource {
    fn connect(&mut self) -> Result<()> {
        match &mut self.backend {
            VisionBackend::Http(backend) => backend.connect(),
            VisionBackend::Synthetic(_) => Ok(()),
        }
    }

    fn fetch(&mut self) -> FetchResult {
        let result = match &mut self.backend {
            VisionBackend::Http(backend) => backend.fetch(&self.config.content_type),
            VisionBackend::Synthetic(backend) => backend.fetch(&self.config),
        };
        self.record(&result);
        match &result {
            FetchResult::Frame(frame) => {
                log::info!(
                    "frame received t={} ({} bytes)",
                    frame.timestamp,
                    frame.payload.len()
                );
            }
            FetchResult::NoData(reason) => {
                log::warn!("no frame retrieved, vision api returned: {}", reason);
            }
            FetchResult::Malformed(reason) => {
                log::warn!("discarding malformed vision api response: {}", reason);
            }
            FetchResult::Unreachable(reason) => {
                log::warn!(
                    "cannot reach vision api at {}: {}",
                    self.config.endpoint,
                    reason
                );
            }
        }
        result
    }
}

// ----------------------------------------------------------------------------
// HTTP backend
// ----------------------------------------------------------------------------

struct HttpVisionBackend {
    agent: ureq::Agent,
    base_url: String,
    frame_url: String,
}

impl HttpVisionBackend {
    fn new(config: &VisionApiConfig) -> Self {
        let agent = ureq::AgentBuilder::new().timeout(config.timeout).build();
        let base_url = config.endpoint.trim_end_matches('/').to_string();
        let frame_url = format!("{}/{}", base_url, FRAME_PATH);
        Self {
            agent,
            base_url,
            frame_url,
        }
    }

    /// Any HTTP answer, even an error status, proves the service is there.
    fn connect(&mut self) -> Result<()> {
        match self.agent.get(&self.base_url).call() {
            Ok(_) | Err(ureq::Error::Status(_, _)) => {
                log::info!("vision api reachable at {}", self.base_url);
                Ok(())
            }
            Err(ureq::Error::Transport(err)) => {
                Err(anyhow!("connect to vision api {}: {}", self.base_url, err))
            }
        }
    }

    fn fetch(&mut self, default_content_type: &str) -> FetchResult {
        // The service reports "no frame" inside the envelope, sometimes with
        // an HTTP error status, so the body is read either way.
        let response = match self.agent.get(&self.frame_url).call() {
            Ok(response) | Err(ureq::Error::Status(_, response)) => response,
            Err(ureq::Error::Transport(err)) => return FetchResult::Unreachable(err.to_string()),
        };

        let mut body = Vec::new();
        if let Err(err) = response
            .into_reader()
            .take(MAX_ENVELOPE_BYTES)
            .read_to_end(&mut body)
        {
            return FetchResult::Unreachable(format!("read response body: {}", err));
        }
        parse_envelope(&body, default_content_type)
    }
}

// ----------------------------------------------------------------------------
// Synthetic backend
// ----------------------------------------------------------------------------

#[derive(Default)]
struct SyntheticVisionBackend {
    sequence: u64,
}

impl SyntheticVisionBackend {
    fn fetch(&mut self, config: &VisionApiConfig) -> FetchResult {
        self.sequence += 1;
        let payload: Vec<u8> = (0..64u64)
            .map(|i| (i.wrapping_mul(31) ^ self.sequence) as u8)
            .collect();
        let mut metadata = Map::new();
        metadata.insert("source".to_string(), Value::from(config.endpoint.clone()));
        metadata.insert("sequence".to_string(), Value::from(self.sequence));
        FetchResult::Frame(
            Frame::new(payload, config.content_type.clone(), now_millis())
                .with_metadata(metadata),
        )
    }
}

fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_millis() as i64)
        .unwrap_or_default()
}

// ----------------------------------------------------------------------------
// Envelope parsing
// ----------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct Envelope {
    status: EnvelopeStatus,
    #[serde(default)]
    frame: Option<EnvelopeFrame>,
    #[serde(default)]
    metadata: Option<Value>,
    #[serde(default)]
    timestamp: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct EnvelopeStatus {
    code: u16,
    #[serde(default)]
    message: String,
}

#[derive(Debug, Deserialize)]
struct EnvelopeFrame {
    frame: String,
    #[serde(default)]
    content_type: Option<String>,
}

/// Decode a vision service envelope into a fetch result.
pub fn parse_envelope(body: &[u8], default_content_type: &str) -> FetchResult {
    let envelope: Envelope = match serde_json::from_slice(body) {
        Ok(envelope) => envelope,
        Err(err) => return FetchResult::Malformed(format!("invalid envelope json: {}", err)),
    };

    if envelope.status.code != STATUS_OK {
        let reason = if envelope.status.message.is_empty() {
            format!("status {}", envelope.status.code)
        } else {
            format!("status {}: {}", envelope.status.code, envelope.status.message)
        };
        return FetchResult::NoData(reason);
    }

    let Some(frame) = envelope.frame else {
        return FetchResult::Malformed("status 200 without 'frame'".to_string());
    };
    let Some(timestamp) = envelope.timestamp else {
        return FetchResult::Malformed("status 200 without 'timestamp'".to_string());
    };
    let metadata = match envelope.metadata {
        None | Some(Value::Null) => Map::new(),
        Some(Value::Object(map)) => map,
        Some(other) => {
            return FetchResult::Malformed(format!(
                "'metadata' must be an object, got {}",
                json_kind(&other)
            ))
        }
    };
    let payload = match STANDARD.decode(frame.frame.trim()) {
        Ok(payload) if !payload.is_empty() => payload,
        Ok(_) => return FetchResult::Malformed("empty frame payload".to_string()),
        Err(err) => return FetchResult::Malformed(format!("frame is not base64: {}", err)),
    };
    let content_type = match frame.content_type.as_deref().map(str::trim) {
        None | Some("") => default_content_type.to_string(),
        Some(content_type) if content_type.parse::<mime::Mime>().is_ok() => {
            content_type.to_string()
        }
        Some(content_type) => {
            log::warn!(
                "ignoring invalid frame content type {:?}, using {}",
                content_type,
                default_content_type
            );
            default_content_type.to_string()
        }
    };

    FetchResult::Frame(Frame::new(payload, content_type, timestamp).with_metadata(metadata))
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn envelope(code: u16, frame: &str, extra: &str) -> String {
        format!(
            r#"{{"status": {{"code": {}, "message": "msg"}}, "frame": {{"frame": "{}"}}{}}}"#,
            code, frame, extra
        )
    }

    #[test]
    fn parses_successful_envelope() {
        let body = envelope(
            200,
            &STANDARD.encode(b"png bytes"),
            r#", "metadata": {"camera": "cam0", "exposure": 12}, "timestamp": 42"#,
        );
        let frame = parse_envelope(body.as_bytes(), "image/png")
            .into_frame()
            .expect("frame");

        assert_eq!(frame.payload, b"png bytes");
        assert_eq!(frame.content_type, "image/png");
        assert_eq!(frame.timestamp, 42);
        assert_eq!(frame.metadata["camera"], "cam0");
        assert_eq!(frame.metadata["exposure"], 12);
    }

    #[test]
    fn envelope_content_type_overrides_default() {
        let body = format!(
            r#"{{"status": {{"code": 200}}, "frame": {{"frame": "{}", "content_type": "image/jpeg"}}, "timestamp": 1}}"#,
            STANDARD.encode(b"jpeg")
        );
        let frame = parse_envelope(body.as_bytes(), "image/png")
            .into_frame()
            .expect("frame");
        assert_eq!(frame.content_type, "image/jpeg");
        assert!(frame.metadata.is_empty());
    }

    #[test]
    fn invalid_envelope_content_type_falls_back_to_default() {
        for content_type in ["png", "", "not a type"] {
            let body = format!(
                r#"{{"status": {{"code": 200}}, "frame": {{"frame": "{}", "content_type": "{}"}}, "timestamp": 1}}"#,
                STANDARD.encode(b"png"),
                content_type
            );
            let frame = parse_envelope(body.as_bytes(), "image/png")
                .into_frame()
                .expect("frame");
            assert_eq!(frame.content_type, "image/png", "for {:?}", content_type);
        }
    }

    #[test]
    fn status_500_is_no_data() {
        let body = r#"{"status": {"code": 500, "message": "no frame in queue"}}"#;
        let result = parse_envelope(body.as_bytes(), "image/png");
        assert_eq!(
            result,
            FetchResult::NoData("status 500: no frame in queue".to_string())
        );
    }

    #[test]
    fn invalid_json_is_malformed() {
        let result = parse_envelope(b"<html>gateway timeout</html>", "image/png");
        assert!(matches!(result, FetchResult::Malformed(_)));
    }

    #[test]
    fn missing_timestamp_is_malformed() {
        let body = envelope(200, &STANDARD.encode(b"x"), "");
        let result = parse_envelope(body.as_bytes(), "image/png");
        assert!(matches!(result, FetchResult::Malformed(reason) if reason.contains("timestamp")));
    }

    #[test]
    fn bad_base64_is_malformed() {
        let body = envelope(200, "not base64!!", r#", "timestamp": 3"#);
        let result = parse_envelope(body.as_bytes(), "image/png");
        assert!(matches!(result, FetchResult::Malformed(reason) if reason.contains("base64")));
    }

    #[test]
    fn non_object_metadata_is_malformed() {
        let body = envelope(
            200,
            &STANDARD.encode(b"x"),
            r#", "metadata": [1, 2], "timestamp": 3"#,
        );
        let result = parse_envelope(body.as_bytes(), "image/png");
        assert!(matches!(result, FetchResult::Malformed(reason) if reason.contains("array")));
    }

    #[test]
    fn rejects_unknown_scheme() {
        let config = VisionApiConfig {
            endpoint: "ftp://camera".to_string(),
            ..VisionApiConfig::default()
        };
        assert!(VisionApiSource::new(config).is_err());
    }

    #[test]
    fn stub_source_produces_frames() -> Result<()> {
        let config = VisionApiConfig {
            endpoint: "stub://front_camera".to_string(),
            ..VisionApiConfig::default()
        };
        let mut source = VisionApiSource::new(config)?;
        source.connect()?;

        let first = source.fetch().into_frame().expect("frame");
        let second = source.fetch().into_frame().expect("frame");
        assert_eq!(first.content_type, "image/png");
        assert_eq!(first.metadata["sequence"], 1);
        assert_eq!(second.metadata["sequence"], 2);
        assert_ne!(first.payload, second.payload);
        assert_eq!(source.stats().frames_received, 2);

        Ok(())
    }

    #[test]
    fn unreachable_endpoint_degrades_to_absent() -> Result<()> {
        // Port 9 on loopback: nothing listens there in test environments.
        let config = VisionApiConfig {
            endpoint: "http://127.0.0.1:9".to_string(),
            timeout: Duration::from_millis(500),
            ..VisionApiConfig::default()
        };
        let mut source = VisionApiSource::new(config)?;
        assert!(source.connect().is_err());

        let result = source.fetch();
        assert!(matches!(result, FetchResult::Unreachable(_)));
        assert_eq!(source.stats().unreachable, 1);

        Ok(())
    }
}
