//! Ottoeject devices run Klipper; macros are G-code scripts sent through Moonraker.

use crate::moonraker::{MoonrakerClient, EJECTOR_OBJECTS};
use async_trait::async_trait;
use ottoflow_shared::config::MoonrakerConfig;
use ottoflow_shared::model::{OttoejectId, OttoejectRecord};
use ottoflow_shared::ottoeject::{EjectorState, MacroError, OttoejectClient};
use serde_json::Value;
use std::collections::HashMap;

pub struct MoonrakerOttoeject {
    devices: HashMap<OttoejectId, MoonrakerClient>,
}

impl MoonrakerOttoeject {
    pub fn new(records: &[OttoejectRecord], config: &MoonrakerConfig) -> Result<Self, MacroError> {
        let mut devices = HashMap::new();
        for record in records {
            let client = MoonrakerClient::new(&record.address, record.api_key.clone(), config)
                .map_err(|e| MacroError::Network(e.to_string()))?;
            devices.insert(record.id, client);
        }
        Ok(Self { devices })
    }

    fn device(&self, ottoeject_id: OttoejectId) -> Result<&MoonrakerClient, MacroError> {
        self.devices.get(&ottoeject_id).ok_or(MacroError::UnknownDevice(ottoeject_id))
    }
}

#[async_trait]
impl OttoejectClient for MoonrakerOttoeject {
    async fn execute_macro(&self, ottoeject_id: OttoejectId, name: &str) -> Result<(), MacroError> {
        let client = self.device(ottoeject_id)?;
        tracing::info!(ottoeject_id, macro_name = name, "executing ottoeject macro");
        client.run_gcode(name).await.map_err(|e| e.into_macro_error(name))
    }

    async fn get_status(&self, ottoeject_id: OttoejectId) -> Result<EjectorState, MacroError> {
        let client = self.device(ottoeject_id)?;
        match client.query_objects(EJECTOR_OBJECTS).await {
            Ok(status) => Ok(ejector_state(&status)),
            Err(e) => {
                tracing::debug!(ottoeject_id, "ottoeject status query failed: {}", e);
                Ok(EjectorState::Offline)
            }
        }
    }
}

/// Klipper's `idle_timeout` tracks whether a macro is still executing;
/// `webhooks` reports shutdown and error conditions.
pub fn ejector_state(status: &Value) -> EjectorState {
    let webhooks = status["webhooks"]["state"].as_str().unwrap_or_default().to_ascii_lowercase();
    if matches!(webhooks.as_str(), "shutdown" | "error") {
        return EjectorState::Error;
    }
    let print_state = status["print_stats"]["state"].as_str().unwrap_or_default().to_ascii_lowercase();
    if print_state == "error" {
        return EjectorState::Error;
    }
    let idle = status["idle_timeout"]["state"].as_str().unwrap_or_default().to_ascii_lowercase();
    match idle.as_str() {
        "printing" | "busy" => EjectorState::Busy,
        "ready" | "idle" => EjectorState::Idle,
        _ if webhooks == "startup" => EjectorState::Busy,
        _ => EjectorState::Idle,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn idle_timeout_states() {
        let busy = json!({ "webhooks": { "state": "ready" }, "idle_timeout": { "state": "Printing" } });
        assert_eq!(ejector_state(&busy), EjectorState::Busy);
        let ready = json!({ "webhooks": { "state": "ready" }, "idle_timeout": { "state": "Ready" } });
        assert_eq!(ejector_state(&ready), EjectorState::Idle);
        let down = json!({ "webhooks": { "state": "shutdown" }, "idle_timeout": { "state": "Idle" } });
        assert_eq!(ejector_state(&down), EjectorState::Error);
    }

    #[tokio::test]
    async fn unknown_device_rejected() {
        let client = MoonrakerOttoeject::new(&[], &MoonrakerConfig::default()).unwrap();
        let err = client.execute_macro(4, "OTTOEJECT_HOME").await.unwrap_err();
        assert_eq!(err, MacroError::UnknownDevice(4));
    }
}
