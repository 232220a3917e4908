//! Dataverse repository sink.
//!
//! Uploads each item as one file in an existing dataset through the native
//! API:
//!
//! `POST {endpoint}/api/datasets/:persistentId/add?persistentId={pid}&key={token}`
//!
//! The multipart form carries `jsonData` (the item metadata as a JSON
//! object) and `file` (the payload, named `frame<timestamp>.<ext>`).

use anyhow::{anyhow, Context, Result};
use reqwest::blocking::{multipart, Client};
use serde_json::Value;
use std::time::Duration;

use super::RepositorySink;
use crate::frame::BufferItem;

const API_KEY_HEADER: &str = "X-Dataverse-key";
const VERSION_PATH: &str = "api/info/version";
const ADD_FILE_PATH: &str = "api/datasets/:persistentId/add";

#[derive(Clone, Debug)]
pub struct DataverseConfig {
    /// Dataverse installation base URL.
    pub endpoint: String,
    /// API token of the uploading account.
    pub token: String,
    /// Persistent identifier of the target dataset (e.g. `doi:10.5072/FK2/ABC123`).
    pub persistent_id: String,
    /// Bound on each request.
    pub timeout: Duration,
}

impl Default for DataverseConfig {
    fn default() -> Self {
        Self {
            endpoint: "http://localhost:8080".to_string(),
            token: String::new(),
            persistent_id: String::new(),
            timeout: Duration::from_secs(30),
        }
    }
}

pub struct DataverseSink {
    client: Client,
    base_url: String,
    config: DataverseConfig,
    uploaded: u64,
    failed: u64,
}

impl DataverseSink {
    pub fn new(config: DataverseConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(config.timeout)
            .build()
            .context("build dataverse http client")?;
        let base_url = config.endpoint.trim_end_matches('/').to_string();
        Ok(Self {
            client,
            base_url,
            config,
            uploaded: 0,
            failed: 0,
        })
    }

    /// Endpoint for adding a file to the configured dataset, without query.
    pub fn add_file_url(&self) -> String {
        format!("{}/{}", self.base_url, ADD_FILE_PATH)
    }

    /// Uploads confirmed and rejected so far.
    pub fn counts(&self) -> (u64, u64) {
        (self.uploaded, self.failed)
    }

    fn try_upload(&self, item: &BufferItem) -> Result<()> {
        let file_name = file_name_for(item.timestamp(), item.content_type());
        let json_data = serde_json::to_string(item.metadata()).context("encode jsonData")?;
        let file_part = multipart::Part::bytes(item.payload().to_vec())
            .file_name(file_name)
            .mime_str(item.content_type())
            .with_context(|| format!("invalid content type '{}'", item.content_type()))?;
        let form = multipart::Form::new()
            .text("jsonData", json_data)
            .part("file", file_part);

        let response = self
            .client
            .post(self.add_file_url())
            .query(&[
                ("persistentId", self.config.persistent_id.as_str()),
                ("key", self.config.token.as_str()),
            ])
            .multipart(form)
            .send()
            .map_err(|e| {
                if e.is_timeout() {
                    anyhow!("request timed out after {:?}", self.config.timeout)
                } else {
                    anyhow!("request failed: {}", e)
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().unwrap_or_default();
            return Err(anyhow!("repository returned {}: {}", status, body.trim()));
        }
        Ok(())
    }
}

impl RepositorySink for DataverseSink {
    fn connect(&mut self) -> Result<()> {
        let url = format!("{}/{}", self.base_url, VERSION_PATH);
        let response = self
            .client
            .get(&url)
            .header(API_KEY_HEADER, &self.config.token)
            .send()
            .with_context(|| format!("connect to dataverse at {}", self.base_url))?;

        let status = response.status();
        if !status.is_success() {
            return Err(anyhow!("dataverse version check returned {}", status));
        }

        let body: Value = response.json().unwrap_or(Value::Null);
        let version = body
            .pointer("/data/version")
            .and_then(Value::as_str)
            .unwrap_or("unknown");
        log::info!(
            "connected to dataverse {} (version {}), dataset {}",
            self.base_url,
            version,
            self.config.persistent_id
        );
        Ok(())
    }

    fn upload(&mut self, item: &BufferItem) -> bool {
        match self.try_upload(item) {
            Ok(()) => {
                self.uploaded += 1;
                log::info!("uploaded frame t={} to dataset", item.timestamp());
                true
            }
            Err(err) => {
                self.failed += 1;
                log::warn!(
                    "upload of frame t={} failed (kept for retry): {}",
                    item.timestamp(),
                    err
                );
                false
            }
        }
    }
}

/// Deterministic repository file name for a frame.
pub fn file_name_for(timestamp: i64, content_type: &str) -> String {
    format!("frame{}.{}", timestamp, extension_for(content_type))
}

fn extension_for(content_type: &str) -> &'static str {
    let essence = content_type
        .split(';')
        .next()
        .unwrap_or_default()
        .trim()
        .to_ascii_lowercase();
    match essence.as_str() {
        "image/png" => "png",
        "image/jpeg" | "image/jpg" => "jpg",
        "image/bmp" => "bmp",
        "image/tiff" => "tif",
        "image/gif" => "gif",
        "image/webp" => "webp",
        _ => "bin",
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::Frame;

    #[test]
    fn file_names_follow_timestamp_and_type() {
        assert_eq!(file_name_for(1700, "image/png"), "frame1700.png");
        assert_eq!(file_name_for(5, "image/jpeg"), "frame5.jpg");
        assert_eq!(file_name_for(5, "IMAGE/JPEG; q=0.9"), "frame5.jpg");
        assert_eq!(file_name_for(5, "image/tiff"), "frame5.tif");
        assert_eq!(file_name_for(5, "application/x-custom"), "frame5.bin");
    }

    #[test]
    fn add_file_url_strips_trailing_slash() -> Result<()> {
        let sink = DataverseSink::new(DataverseConfig {
            endpoint: "https://demo.dataverse.org/".to_string(),
            token: "token".to_string(),
            persistent_id: "doi:10.5072/FK2/ABC123".to_string(),
            ..DataverseConfig::default()
        })?;
        assert_eq!(
            sink.add_file_url(),
            "https://demo.dataverse.org/api/datasets/:persistentId/add"
        );
        Ok(())
    }

    #[test]
    fn unreachable_repository_fails_connect_and_upload() -> Result<()> {
        let mut sink = DataverseSink::new(DataverseConfig {
            endpoint: "http://127.0.0.1:9".to_string(),
            token: "token".to_string(),
            persistent_id: "doi:10.5072/FK2/ABC123".to_string(),
            timeout: Duration::from_millis(500),
        })?;
        assert!(sink.connect().is_err());

        let item = BufferItem::new(Frame::new(b"bytes".to_vec(), "image/png", 5));
        assert!(!sink.upload(&item));
        assert_eq!(sink.counts(), (0, 1));
        Ok(())
    }
}
