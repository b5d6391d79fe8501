//! Thin HTTP client for the Moonraker API that fronts Klipper. Both the
//! Klipper printer adapter and the Ottoeject client talk through it.

use ottoflow_shared::AdapterError;
use ottoflow_shared::config::MoonrakerConfig;
use ottoflow_shared::ottoeject::MacroError;
use serde_json::Value;
use std::time::Duration;
use thiserror::Error;

/// Objects queried for printer telemetry.
pub const PRINTER_OBJECTS: &str = "print_stats&virtual_sdcard&extruder&heater_bed&display_status";
/// Objects queried for ejector state.
pub const EJECTOR_OBJECTS: &str = "webhooks&idle_timeout&print_stats";

#[derive(Debug, Error)]
pub enum MoonrakerError {
    #[error("request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("moonraker returned {status}: {body}")]
    Status { status: u16, body: String },
    #[error("unexpected response: {0}")]
    Decode(String),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<MoonrakerError> for AdapterError {
    fn from(err: MoonrakerError) -> Self {
        match err {
            MoonrakerError::Http(e) if e.is_timeout() => AdapterError::Network(format!("timeout: {e}")),
            MoonrakerError::Http(e) => AdapterError::Network(e.to_string()),
            MoonrakerError::Status { status: 401 | 403, body } => AdapterError::Auth(body),
            MoonrakerError::Status { status, body } => {
                AdapterError::Device(format!("HTTP {status}: {body}"))
            }
            MoonrakerError::Decode(msg) => AdapterError::Device(msg),
            MoonrakerError::Io(e) => AdapterError::Device(format!("cannot read print file: {e}")),
        }
    }
}

impl MoonrakerError {
    pub fn into_macro_error(self, macro_name: &str) -> MacroError {
        match self {
            MoonrakerError::Http(e) => MacroError::Network(e.to_string()),
            MoonrakerError::Status { status, body } => MacroError::Failed {
                name: macro_name.to_string(),
                reason: format!("HTTP {status}: {body}"),
            },
            other => MacroError::Failed { name: macro_name.to_string(), reason: other.to_string() },
        }
    }
}

#[derive(Debug, Clone)]
pub struct MoonrakerClient {
    base_url: String,
    api_key: Option<String>,
    http: reqwest::Client,
    /// Applies to script runs and uploads in place of the client timeout.
    script_timeout: Duration,
}

impl MoonrakerClient {
    pub fn new(address: &str, api_key: Option<String>, config: &MoonrakerConfig) -> Result<Self, MoonrakerError> {
        let http = reqwest::Client::builder().timeout(config.request_timeout()).build()?;
        Ok(Self { base_url: base_url(address), api_key, http, script_timeout: config.script_timeout() })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        let builder = self.http.request(method, format!("{}{}", self.base_url, path));
        match &self.api_key {
            Some(key) => builder.header("X-Api-Key", key),
            None => builder,
        }
    }

    async fn send(&self, builder: reqwest::RequestBuilder) -> Result<Value, MoonrakerError> {
        let response = builder.send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(MoonrakerError::Status { status: status.as_u16(), body });
        }
        let body: Value = response.json().await?;
        Ok(body.get("result").cloned().unwrap_or(body))
    }

    /// `GET /server/info`, used to check credentials.
    pub async fn server_info(&self) -> Result<Value, MoonrakerError> {
        self.send(self.request(reqwest::Method::GET, "/server/info")).await
    }

    /// Returns the `status` object of a printer objects query.
    pub async fn query_objects(&self, objects: &str) -> Result<Value, MoonrakerError> {
        let path = format!("/printer/objects/query?{objects}");
        let result = self.send(self.request(reqwest::Method::GET, &path)).await?;
        result
            .get("status")
            .cloned()
            .ok_or_else(|| MoonrakerError::Decode("objects query without status".to_string()))
    }

    /// Blocks until Klipper has finished running `script`.
    pub async fn run_gcode(&self, script: &str) -> Result<(), MoonrakerError> {
        let builder = self
            .request(reqwest::Method::POST, "/printer/gcode/script")
            .query(&[("script", script)])
            .timeout(self.script_timeout);
        self.send(builder).await.map(|_| ())
    }

    pub async fn print_action(&self, action: &str) -> Result<(), MoonrakerError> {
        let path = format!("/printer/print/{action}");
        self.send(self.request(reqwest::Method::POST, &path)).await.map(|_| ())
    }

    pub async fn upload_file(&self, name: &str, bytes: Vec<u8>) -> Result<(), MoonrakerError> {
        let part = reqwest::multipart::Part::bytes(bytes).file_name(name.to_string());
        let form = reqwest::multipart::Form::new()
            .text("root", "gcodes")
            .part("file", part);
        let builder = self
            .request(reqwest::Method::POST, "/server/files/upload")
            .multipart(form)
            .timeout(self.script_timeout);
        self.send(builder).await.map(|_| ())
    }
}

fn base_url(address: &str) -> String {
    let trimmed = address.trim().trim_end_matches('/');
    if trimmed.starts_with("http://") || trimmed.starts_with("https://") {
        trimmed.to_string()
    } else {
        format!("http://{trimmed}")
    }
}

/// G-code string literal, with quotes escaped.
pub fn quote_gcode_arg(value: &str) -> String {
    format!("\"{}\"", value.replace('"', "'"))
}
