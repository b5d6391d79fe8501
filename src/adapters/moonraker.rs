//! Klipper printers reached through Moonraker.

use crate::moonraker::{quote_gcode_arg, MoonrakerClient, PRINTER_OBJECTS};
use async_trait::async_trait;
use ottoflow_shared::config::MoonrakerConfig;
use ottoflow_shared::model::PrinterRecord;
use ottoflow_shared::{
    AdapterError, Capabilities, Credentials, DeviceStatus, FileRef, JobHandle, PrintState,
    PrinterAdapter, StartOptions, StatusStream,
};
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;

pub struct MoonrakerAdapter {
    client: MoonrakerClient,
    poll_interval: Duration,
    connected: AtomicBool,
    closed: watch::Sender<bool>,
}

impl MoonrakerAdapter {
    pub fn new(record: &PrinterRecord, config: &MoonrakerConfig) -> Result<Self, AdapterError> {
        let client = MoonrakerClient::new(&record.address, record.credentials.api_key.clone(), config)?;
        let (closed, _) = watch::channel(true);
        Ok(Self {
            client,
            poll_interval: config.poll_interval(),
            connected: AtomicBool::new(false),
            closed,
        })
    }

    fn ensure_connected(&self) -> Result<(), AdapterError> {
        if self.connected.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(AdapterError::NotConnected)
        }
    }
}

#[async_trait]
impl PrinterAdapter for MoonrakerAdapter {
    fn vendor(&self) -> &str {
        "moonraker"
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities::all()
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn authenticate(&self, _credentials: &Credentials) -> Result<(), AdapterError> {
        // The API key travels on every request; a successful info call proves it.
        self.client.server_info().await?;
        self.connected.store(true, Ordering::SeqCst);
        self.closed.send_replace(false);
        tracing::info!(url = self.client.base_url(), "connected to moonraker");
        Ok(())
    }

    async fn get_status(&self) -> Result<DeviceStatus, AdapterError> {
        self.ensure_connected()?;
        let status = self.client.query_objects(PRINTER_OBJECTS).await?;
        Ok(parse_status(&status))
    }

    async fn status_stream(&self) -> Result<StatusStream, AdapterError> {
        self.ensure_connected()?;
        let client = self.client.clone();
        let period = self.poll_interval;
        let mut closed = self.closed.subscribe();
        Ok(Box::pin(async_stream::stream! {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                if *closed.borrow() {
                    break;
                }
                tokio::select! {
                    changed = closed.changed() => {
                        if changed.is_err() || *closed.borrow() {
                            break;
                        }
                        continue;
                    }
                    _ = ticker.tick() => {}
                }
                match client.query_objects(PRINTER_OBJECTS).await {
                    Ok(status) => yield parse_status(&status),
                    Err(e) => {
                        tracing::warn!(url = client.base_url(), "moonraker poll failed, ending stream: {}", e);
                        break;
                    }
                }
            }
        }))
    }

    async fn upload(&self, file: &FileRef) -> Result<(), AdapterError> {
        self.ensure_connected()?;
        let Some(path) = &file.local_path else {
            // Already on the printer's storage.
            return Ok(());
        };
        let bytes = tokio::fs::read(path)
            .await
            .map_err(|e| AdapterError::Device(format!("cannot read {}: {}", path.display(), e)))?;
        self.client.upload_file(&file.name, bytes).await?;
        Ok(())
    }

    async fn start(&self, file: &FileRef, _options: &StartOptions) -> Result<JobHandle, AdapterError> {
        self.ensure_connected()?;
        let script = format!("SDCARD_PRINT_FILE FILENAME={}", quote_gcode_arg(&file.name));
        self.client.run_gcode(&script).await?;
        Ok(JobHandle::new(file.name.clone()))
    }

    async fn pause(&self) -> Result<(), AdapterError> {
        self.ensure_connected()?;
        Ok(self.client.print_action("pause").await?)
    }

    async fn resume(&self) -> Result<(), AdapterError> {
        self.ensure_connected()?;
        Ok(self.client.print_action("resume").await?)
    }

    async fn cancel(&self) -> Result<(), AdapterError> {
        self.ensure_connected()?;
        Ok(self.client.print_action("cancel").await?)
    }

    async fn send_raw(&self, command: &str) -> Result<(), AdapterError> {
        self.ensure_connected()?;
        Ok(self.client.run_gcode(command).await?)
    }

    async fn close(&self) {
        self.connected.store(false, Ordering::SeqCst);
        self.closed.send_replace(true);
    }
}

fn map_klipper_state(state: &str) -> PrintState {
    match state {
        "standby" | "ready" => PrintState::Idle,
        "printing" => PrintState::Running,
        "paused" => PrintState::Paused,
        "complete" => PrintState::Completed,
        // Klipper keeps reporting `cancelled` until the next print starts.
        "cancelled" => PrintState::Idle,
        "error" => PrintState::Error,
        _ => PrintState::Unknown,
    }
}

/// Normalizes the `status` object of a printer objects query.
pub fn parse_status(status: &Value) -> DeviceStatus {
    let print_stats = &status["print_stats"];
    let klipper_state = print_stats["state"].as_str().unwrap_or_default().to_ascii_lowercase();
    let mut out = DeviceStatus::new(map_klipper_state(&klipper_state));

    if klipper_state == "error" {
        let message = print_stats["message"].as_str().filter(|m| !m.is_empty());
        out.error_code = Some(message.unwrap_or("klipper_error").to_string());
    }

    let progress = status["virtual_sdcard"]["progress"]
        .as_f64()
        .or_else(|| status["display_status"]["progress"].as_f64());
    if let Some(progress) = progress {
        out.progress_percent = Some((progress * 100.0).clamp(0.0, 100.0));
        if let Some(elapsed) = print_stats["print_duration"].as_f64() {
            if progress > 0.0 && progress < 1.0 {
                let remaining_secs = elapsed / progress - elapsed;
                out.remaining_minutes = Some((remaining_secs / 60.0).round() as u32);
            }
        }
    }

    out.temperatures.nozzle = status["extruder"]["temperature"].as_f64();
    out.temperatures.nozzle_target = status["extruder"]["target"].as_f64();
    out.temperatures.bed = status["heater_bed"]["temperature"].as_f64();
    out.temperatures.bed_target = status["heater_bed"]["target"].as_f64();
    out.current_file = print_stats["filename"]
        .as_str()
        .filter(|name| !name.is_empty())
        .map(str::to_string);
    out.raw = status.clone();
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn printing_status_is_normalized() {
        let status = parse_status(&json!({
            "print_stats": { "state": "printing", "filename": "bracket.gcode", "print_duration": 600.0 },
            "virtual_sdcard": { "progress": 0.25 },
            "extruder": { "temperature": 214.8, "target": 215.0 },
            "heater_bed": { "temperature": 60.1, "target": 60.0 }
        }));
        assert_eq!(status.state, PrintState::Running);
        assert_eq!(status.progress_percent, Some(25.0));
        assert_eq!(status.remaining_minutes, Some(30));
        assert_eq!(status.temperatures.nozzle_target, Some(215.0));
        assert_eq!(status.current_file.as_deref(), Some("bracket.gcode"));
    }

    #[test]
    fn klipper_error_carries_message() {
        let status = parse_status(&json!({
            "print_stats": { "state": "error", "message": "Heater extruder not heating at expected rate" }
        }));
        assert_eq!(status.effective_state(), PrintState::Error);
        assert_eq!(
            status.error_code.as_deref(),
            Some("Heater extruder not heating at expected rate")
        );
    }

    #[test]
    fn complete_and_standby() {
        let done = parse_status(&json!({ "print_stats": { "state": "complete" } }));
        assert_eq!(done.effective_state(), PrintState::Completed);
        let idle = parse_status(&json!({ "print_stats": { "state": "standby", "filename": "" } }));
        assert_eq!(idle.state, PrintState::Idle);
        assert!(idle.current_file.is_none());
    }

    #[test]
    fn cancelled_printer_takes_new_work() {
        let status = parse_status(&json!({
            "print_stats": { "state": "cancelled", "filename": "bracket.gcode" }
        }));
        assert_eq!(status.effective_state(), PrintState::Idle);
        assert!(status.error_code.is_none());
        assert!(status.effective_state().accepts_new_job());
    }
}
