use async_trait::async_trait;
use ottoflow_shared::lock;
use ottoflow_shared::model::OttoejectId;
use ottoflow_shared::ottoeject::{EjectorState, MacroError, OttoejectClient};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Ottoeject double that records every macro and can be told to fail.
#[derive(Clone, Default)]
pub struct SimulatedOttoeject {
    inner: Arc<Mutex<EjectState>>,
}

#[derive(Default)]
struct EjectState {
    macro_delay: Duration,
    fail_next: u32,
    busy_polls: u32,
    forced_state: Option<EjectorState>,
    executed: Vec<(OttoejectId, String)>,
    failed: Vec<(OttoejectId, String)>,
    in_flight: HashMap<OttoejectId, usize>,
    max_in_flight: HashMap<OttoejectId, usize>,
}

impl SimulatedOttoeject {
    pub fn new() -> Self {
        Self::default()
    }

    /// Each macro takes this long to run.
    pub fn with_macro_delay(self, delay: Duration) -> Self {
        lock(&self.inner).macro_delay = delay;
        self
    }

    /// The next `count` macro invocations report a device failure.
    pub fn fail_next(&self, count: u32) {
        lock(&self.inner).fail_next = count;
    }

    /// `get_status` answers BUSY this many times before going IDLE.
    pub fn busy_for_polls(&self, polls: u32) {
        lock(&self.inner).busy_polls = polls;
    }

    pub fn force_state(&self, state: Option<EjectorState>) {
        lock(&self.inner).forced_state = state;
    }

    /// Successfully executed macro names, in order.
    pub fn executed(&self) -> Vec<String> {
        lock(&self.inner).executed.iter().map(|(_, name)| name.clone()).collect()
    }

    pub fn executed_on(&self, ottoeject_id: OttoejectId) -> Vec<String> {
        lock(&self.inner)
            .executed
            .iter()
            .filter(|(id, _)| *id == ottoeject_id)
            .map(|(_, name)| name.clone())
            .collect()
    }

    pub fn failed(&self) -> Vec<String> {
        lock(&self.inner).failed.iter().map(|(_, name)| name.clone()).collect()
    }

    /// Highest number of macros ever running at once on one device.
    pub fn max_concurrent(&self, ottoeject_id: OttoejectId) -> usize {
        lock(&self.inner).max_in_flight.get(&ottoeject_id).copied().unwrap_or(0)
    }
}

#[async_trait]
impl OttoejectClient for SimulatedOttoeject {
    async fn execute_macro(&self, ottoeject_id: OttoejectId, name: &str) -> Result<(), MacroError> {
        let delay = {
            let mut state = lock(&self.inner);
            if state.fail_next > 0 {
                state.fail_next -= 1;
                state.failed.push((ottoeject_id, name.to_string()));
                return Err(MacroError::Failed {
                    name: name.to_string(),
                    reason: "simulated fault".to_string(),
                });
            }
            let running = state.in_flight.entry(ottoeject_id).or_insert(0);
            *running += 1;
            let running = *running;
            let max = state.max_in_flight.entry(ottoeject_id).or_insert(0);
            *max = (*max).max(running);
            state.macro_delay
        };
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        let mut state = lock(&self.inner);
        if let Some(running) = state.in_flight.get_mut(&ottoeject_id) {
            *running -= 1;
        }
        state.executed.push((ottoeject_id, name.to_string()));
        tracing::debug!(ottoeject_id, macro_name = name, "simulated macro done");
        Ok(())
    }

    async fn get_status(&self, _ottoeject_id: OttoejectId) -> Result<EjectorState, MacroError> {
        let mut state = lock(&self.inner);
        if let Some(forced) = state.forced_state {
            return Ok(forced);
        }
        if state.busy_polls > 0 {
            state.busy_polls -= 1;
            return Ok(EjectorState::Busy);
        }
        Ok(EjectorState::Idle)
    }
}
