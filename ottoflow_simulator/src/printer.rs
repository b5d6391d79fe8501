use async_trait::async_trait;
use ottoflow_shared::{
    lock, AdapterError, Capabilities, Credentials, DeviceStatus, FileRef, JobHandle, PrintState,
    PrinterAdapter, StartOptions, StatusStream,
};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Scripted printer. Once a print starts it walks through `print_script`, one
/// state every `step`, pushing each onto the open status stream.
#[derive(Clone)]
pub struct SimulatedPrinter {
    inner: Arc<Inner>,
}

struct Inner {
    name: String,
    connected: AtomicBool,
    state: Mutex<SimState>,
}

struct SimState {
    capabilities: Capabilities,
    status: DeviceStatus,
    print_script: Vec<PrintState>,
    step: Duration,
    auth_failures: VecDeque<AdapterError>,
    upload_failures: VecDeque<AdapterError>,
    start_failures: VecDeque<AdapterError>,
    /// Added to every status poll.
    status_delay: Duration,
    /// Added to every upload and start.
    command_delay: Duration,
    stream_tx: Option<mpsc::UnboundedSender<DeviceStatus>>,
    script_task: Option<JoinHandle<()>>,
    log: SimLog,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct SimLog {
    pub auth_calls: u32,
    pub uploads: Vec<String>,
    pub starts: Vec<String>,
    pub raw_commands: Vec<String>,
    pub pauses: u32,
    pub resumes: u32,
    pub cancels: u32,
}

impl SimulatedPrinter {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(Inner {
                name: name.into(),
                connected: AtomicBool::new(false),
                state: Mutex::new(SimState {
                    capabilities: Capabilities::all(),
                    status: DeviceStatus::new(PrintState::Idle),
                    print_script: vec![
                        PrintState::Preparing,
                        PrintState::Running,
                        PrintState::Running,
                        PrintState::Completed,
                    ],
                    step: Duration::from_millis(50),
                    auth_failures: VecDeque::new(),
                    upload_failures: VecDeque::new(),
                    start_failures: VecDeque::new(),
                    status_delay: Duration::ZERO,
                    command_delay: Duration::ZERO,
                    stream_tx: None,
                    script_task: None,
                    log: SimLog::default(),
                }),
            }),
        }
    }

    pub fn with_capabilities(self, capabilities: Capabilities) -> Self {
        lock(&self.inner.state).capabilities = capabilities;
        self
    }

    pub fn with_print_script(self, script: Vec<PrintState>, step: Duration) -> Self {
        {
            let mut state = lock(&self.inner.state);
            state.print_script = script;
            state.step = step;
        }
        self
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn fail_next_auth(&self, err: AdapterError) {
        lock(&self.inner.state).auth_failures.push_back(err);
    }

    pub fn fail_next_upload(&self, err: AdapterError) {
        lock(&self.inner.state).upload_failures.push_back(err);
    }

    pub fn fail_next_start(&self, err: AdapterError) {
        lock(&self.inner.state).start_failures.push_back(err);
    }

    /// Makes status polls hang for `delay`, like a device that stopped answering.
    pub fn set_status_delay(&self, delay: Duration) {
        lock(&self.inner.state).status_delay = delay;
    }

    /// Makes uploads and starts take `delay` before they act.
    pub fn set_command_delay(&self, delay: Duration) {
        lock(&self.inner.state).command_delay = delay;
    }

    async fn pause_for(&self, pick: fn(&SimState) -> Duration) {
        let delay = pick(&lock(&self.inner.state));
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
    }

    /// Records a new observation and forwards it to the open stream, if any.
    pub fn push_status(&self, status: DeviceStatus) {
        let mut state = lock(&self.inner.state);
        state.status = status.clone();
        if let Some(tx) = &state.stream_tx {
            let _ = tx.send(status);
        }
    }

    pub fn push_state(&self, print_state: PrintState) {
        let mut status = DeviceStatus::new(print_state);
        {
            let state = lock(&self.inner.state);
            status.current_file = state.status.current_file.clone();
        }
        if print_state == PrintState::Completed {
            status.progress_percent = Some(100.0);
        }
        self.push_status(status);
    }

    /// Drops the link: the open stream ends and calls fail until re-authenticated.
    pub fn disconnect(&self) {
        self.inner.connected.store(false, Ordering::SeqCst);
        lock(&self.inner.state).stream_tx = None;
    }

    /// Ends the open stream but keeps the session authenticated.
    pub fn drop_stream(&self) {
        lock(&self.inner.state).stream_tx = None;
    }

    pub fn current_status(&self) -> DeviceStatus {
        lock(&self.inner.state).status.clone()
    }

    pub fn log(&self) -> SimLog {
        lock(&self.inner.state).log.clone()
    }

    fn ensure_connected(&self) -> Result<(), AdapterError> {
        if self.inner.connected.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(AdapterError::NotConnected)
        }
    }

    fn run_script(&self, file_name: String) {
        let printer = self.clone();
        let mut state = lock(&self.inner.state);
        if let Some(task) = state.script_task.take() {
            task.abort();
        }
        let script = state.print_script.clone();
        let step = state.step;
        state.script_task = Some(tokio::spawn(async move {
            for print_state in script {
                tokio::time::sleep(step).await;
                let mut status = DeviceStatus::new(print_state).with_file(file_name.clone());
                if print_state == PrintState::Completed {
                    status.progress_percent = Some(100.0);
                }
                printer.push_status(status);
            }
        }));
    }
}

#[async_trait]
impl PrinterAdapter for SimulatedPrinter {
    fn vendor(&self) -> &str {
        "simulated"
    }

    fn capabilities(&self) -> Capabilities {
        lock(&self.inner.state).capabilities
    }

    fn is_connected(&self) -> bool {
        self.inner.connected.load(Ordering::SeqCst)
    }

    async fn authenticate(&self, _credentials: &Credentials) -> Result<(), AdapterError> {
        let mut state = lock(&self.inner.state);
        state.log.auth_calls += 1;
        if let Some(err) = state.auth_failures.pop_front() {
            return Err(err);
        }
        self.inner.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn get_status(&self) -> Result<DeviceStatus, AdapterError> {
        self.ensure_connected()?;
        self.pause_for(|state| state.status_delay).await;
        Ok(lock(&self.inner.state).status.clone())
    }

    async fn status_stream(&self) -> Result<StatusStream, AdapterError> {
        self.ensure_connected()?;
        let (tx, mut rx) = mpsc::unbounded_channel();
        lock(&self.inner.state).stream_tx = Some(tx);
        Ok(Box::pin(async_stream::stream! {
            while let Some(status) = rx.recv().await {
                yield status;
            }
        }))
    }

    async fn upload(&self, file: &FileRef) -> Result<(), AdapterError> {
        self.ensure_connected()?;
        self.pause_for(|state| state.command_delay).await;
        let mut state = lock(&self.inner.state);
        if let Some(err) = state.upload_failures.pop_front() {
            return Err(err);
        }
        state.log.uploads.push(file.name.clone());
        Ok(())
    }

    async fn start(&self, file: &FileRef, _options: &StartOptions) -> Result<JobHandle, AdapterError> {
        self.ensure_connected()?;
        self.pause_for(|state| state.command_delay).await;
        {
            let mut state = lock(&self.inner.state);
            if let Some(err) = state.start_failures.pop_front() {
                return Err(err);
            }
            state.log.starts.push(file.name.clone());
        }
        self.push_status(DeviceStatus::new(PrintState::Preparing).with_file(file.name.clone()));
        self.run_script(file.name.clone());
        Ok(JobHandle::new(file.name.clone()))
    }

    async fn pause(&self) -> Result<(), AdapterError> {
        self.ensure_connected()?;
        lock(&self.inner.state).log.pauses += 1;
        self.push_state(PrintState::Paused);
        Ok(())
    }

    async fn resume(&self) -> Result<(), AdapterError> {
        self.ensure_connected()?;
        lock(&self.inner.state).log.resumes += 1;
        self.push_state(PrintState::Running);
        Ok(())
    }

    async fn cancel(&self) -> Result<(), AdapterError> {
        self.ensure_connected()?;
        {
            let mut state = lock(&self.inner.state);
            state.log.cancels += 1;
            if let Some(task) = state.script_task.take() {
                task.abort();
            }
        }
        self.push_status(DeviceStatus::new(PrintState::Idle));
        Ok(())
    }

    async fn send_raw(&self, command: &str) -> Result<(), AdapterError> {
        self.ensure_connected()?;
        lock(&self.inner.state).log.raw_commands.push(command.to_string());
        Ok(())
    }

    async fn close(&self) {
        self.disconnect();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::StreamExt;

    #[tokio::test]
    async fn calls_fail_before_authentication() {
        let printer = SimulatedPrinter::new("sim-1");
        assert_eq!(printer.get_status().await, Err(AdapterError::NotConnected));
        printer.authenticate(&Credentials::default()).await.unwrap();
        assert_eq!(printer.get_status().await.unwrap().state, PrintState::Idle);
        printer.close().await;
        printer.close().await;
        assert!(matches!(printer.status_stream().await, Err(AdapterError::NotConnected)));
    }

    #[tokio::test]
    async fn start_walks_the_script() {
        let printer = SimulatedPrinter::new("sim-1").with_print_script(
            vec![PrintState::Running, PrintState::Completed],
            Duration::from_millis(5),
        );
        printer.authenticate(&Credentials::default()).await.unwrap();
        let mut stream = printer.status_stream().await.unwrap();
        printer.start(&FileRef::remote("cube.gcode"), &StartOptions::default()).await.unwrap();

        let mut seen = Vec::new();
        while let Some(status) = stream.next().await {
            seen.push(status.state);
            if status.state == PrintState::Completed {
                break;
            }
        }
        assert_eq!(seen, vec![PrintState::Preparing, PrintState::Running, PrintState::Completed]);
        assert_eq!(printer.log().starts, vec!["cube.gcode".to_string()]);
    }

    #[tokio::test]
    async fn disconnect_ends_the_stream() {
        let printer = SimulatedPrinter::new("sim-1");
        printer.authenticate(&Credentials::default()).await.unwrap();
        let mut stream = printer.status_stream().await.unwrap();
        printer.disconnect();
        assert!(stream.next().await.is_none());
        assert!(!printer.is_connected());
    }
}
