//! Device Connection Manager: one persistent, reconnecting session per printer,
//! with vendor telemetry fanned out to any number of consumers.
//!
//! Workflows never hold adapters. Every operation looks the adapter up by
//! printer id, checks the capability, runs under the command timeout and
//! drops the handle.

mod session;

pub use session::LinkState;

use crate::adapters::AdapterRegistry;
use futures_util::StreamExt;
use ottoflow_shared::config::ConnectionConfig;
use ottoflow_shared::model::{PrinterId, PrinterRecord};
use ottoflow_shared::{
    AdapterError, Capabilities, DeviceStatus, FileRef, JobHandle, Operation, PrinterAdapter,
    StartOptions, StatusStream,
};
use serde::Serialize;
use session::PrinterSession;
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::MissedTickBehavior;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct InitReport {
    pub online: Vec<PrinterId>,
    pub offline: Vec<PrinterId>,
}

pub struct ConnectionManager {
    registry: AdapterRegistry,
    config: ConnectionConfig,
    command_timeout: Duration,
    sessions: RwLock<HashMap<PrinterId, Arc<PrinterSession>>>,
    shutdown_tx: broadcast::Sender<()>,
    closed: AtomicBool,
}

impl ConnectionManager {
    pub fn new(registry: AdapterRegistry, config: ConnectionConfig, command_timeout: Duration) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        Self {
            registry,
            config,
            command_timeout,
            sessions: RwLock::new(HashMap::new()),
            shutdown_tx,
            closed: AtomicBool::new(false),
        }
    }

    /// Opens a session per printer. One printer failing never aborts the rest;
    /// it is left OFFLINE (or reconnecting in the background if the failure was transient).
    pub async fn initialize(&self, printers: &[PrinterRecord]) -> InitReport {
        let attempts = printers.iter().map(|record| self.connect(record.clone()));
        let results = futures_util::future::join_all(attempts).await;
        let mut report = InitReport::default();
        for (printer_id, online) in results {
            if online {
                report.online.push(printer_id);
            } else {
                report.offline.push(printer_id);
            }
        }
        tracing::info!(
            online = report.online.len(),
            offline = report.offline.len(),
            "printer connections initialized"
        );
        report
    }

    async fn connect(&self, record: PrinterRecord) -> (PrinterId, bool) {
        let printer_id = record.id;
        if let Some(previous) = self.remove_session(printer_id) {
            if let Some(pump) = previous.take_pump() {
                pump.abort();
            }
            if let Some(adapter) = previous.adapter() {
                adapter.close().await;
            }
            previous.close_subscribers();
        }

        let adapter = match self.registry.build(&record) {
            Ok(adapter) => adapter,
            Err(e) => {
                tracing::warn!(printer_id, kind = ?e.kind(), "no adapter for printer {}: {}", record.name, e);
                self.insert_session(Arc::new(PrinterSession::detached(record)));
                return (printer_id, false);
            }
        };

        let session = Arc::new(PrinterSession::new(record, adapter.clone()));
        self.insert_session(session.clone());
        match authenticate(adapter.as_ref(), session.record(), &self.config).await {
            Ok(()) => {
                session.set_link(LinkState::Online);
                self.spawn_pump(&session, false);
                (printer_id, true)
            }
            Err(e) if e.is_retryable() => {
                tracing::warn!(printer_id, "printer unreachable at startup, retrying in background: {}", e);
                self.spawn_pump(&session, true);
                (printer_id, false)
            }
            Err(e) => {
                tracing::error!(printer_id, kind = ?e.kind(), "printer authentication failed: {}", e);
                (printer_id, false)
            }
        }
    }

    fn spawn_pump(&self, session: &Arc<PrinterSession>, needs_auth: bool) {
        let shutdown_rx = self.shutdown_tx.subscribe();
        let handle = tokio::spawn(pump(session.clone(), self.config.clone(), shutdown_rx, needs_auth));
        session.set_pump(handle);
    }

    fn session(&self, printer_id: PrinterId) -> Option<Arc<PrinterSession>> {
        self.sessions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&printer_id)
            .cloned()
    }

    fn all_sessions(&self) -> Vec<Arc<PrinterSession>> {
        self.sessions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect()
    }

    fn insert_session(&self, session: Arc<PrinterSession>) {
        self.sessions
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(session.printer_id(), session);
    }

    fn remove_session(&self, printer_id: PrinterId) -> Option<Arc<PrinterSession>> {
        self.sessions
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&printer_id)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn printer_ids(&self) -> Vec<PrinterId> {
        let mut ids: Vec<_> = self
            .sessions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .copied()
            .collect();
        ids.sort_unstable();
        ids
    }

    pub fn link_state(&self, printer_id: PrinterId) -> LinkState {
        if self.is_closed() {
            return LinkState::Offline;
        }
        self.session(printer_id).map(|s| s.link()).unwrap_or(LinkState::Offline)
    }

    /// Link state of every known printer, by id.
    pub fn link_summary(&self) -> Vec<(PrinterId, LinkState)> {
        let mut summary: Vec<_> = self
            .all_sessions()
            .iter()
            .map(|s| (s.printer_id(), if self.is_closed() { LinkState::Offline } else { s.link() }))
            .collect();
        summary.sort_unstable_by_key(|(id, _)| *id);
        summary
    }

    /// Open status feeds for a printer.
    pub fn subscriber_count(&self, printer_id: PrinterId) -> usize {
        self.session(printer_id).map(|s| s.subscriber_count()).unwrap_or(0)
    }

    pub fn capabilities(&self, printer_id: PrinterId) -> Option<Capabilities> {
        self.session(printer_id)?.adapter().map(|a| a.capabilities())
    }

    /// Last known fresh status or a fresh poll. A printer without a live
    /// session reads as OFFLINE; a failed poll falls back to the last known
    /// status, or UNKNOWN.
    pub async fn get_status(&self, printer_id: PrinterId) -> DeviceStatus {
        let Some(session) = self.session(printer_id) else {
            return DeviceStatus::offline();
        };
        if self.is_closed() || session.link() == LinkState::Offline {
            return DeviceStatus::offline();
        }
        let cached = session.last_status();
        if let Some(status) = &cached {
            if status.is_fresh(self.config.status_max_age()) {
                return status.clone();
            }
        }
        let Some(adapter) = session.adapter() else {
            return DeviceStatus::offline();
        };
        match tokio::time::timeout(self.command_timeout, adapter.get_status()).await {
            Ok(Ok(status)) => {
                session.remember(status.clone());
                status
            }
            Ok(Err(e)) => {
                tracing::debug!(printer_id, "status poll failed: {}", e);
                cached.unwrap_or_else(DeviceStatus::unknown)
            }
            Err(_) => {
                tracing::debug!(printer_id, "status poll timed out");
                cached.unwrap_or_else(DeviceStatus::unknown)
            }
        }
    }

    /// Status feed for one consumer, in adapter order. The sequence ends when
    /// the device link drops; subscribe again once it is back.
    pub fn subscribe(&self, printer_id: PrinterId) -> Result<StatusStream, AdapterError> {
        if self.is_closed() {
            return Err(AdapterError::NotConnected);
        }
        let session = self.session(printer_id).ok_or(AdapterError::NotConnected)?;
        if session.link() == LinkState::Offline {
            return Err(AdapterError::NotConnected);
        }
        let mut rx = session.subscribe(self.config.subscriber_buffer);
        Ok(Box::pin(async_stream::stream! {
            while let Some(status) = rx.recv().await {
                yield status;
            }
        }))
    }

    fn adapter_for(&self, printer_id: PrinterId) -> Result<Arc<dyn PrinterAdapter>, AdapterError> {
        if self.is_closed() {
            return Err(AdapterError::NotConnected);
        }
        let session = self.session(printer_id).ok_or(AdapterError::NotConnected)?;
        if session.link() == LinkState::Offline {
            return Err(AdapterError::NotConnected);
        }
        session.adapter().ok_or(AdapterError::NotConnected)
    }

    async fn with_adapter<T, F, Fut>(&self, printer_id: PrinterId, op: Operation, call: F) -> Result<T, AdapterError>
    where
        F: FnOnce(Arc<dyn PrinterAdapter>) -> Fut,
        Fut: Future<Output = Result<T, AdapterError>>,
    {
        self.with_adapter_within(printer_id, op, self.command_timeout, call).await
    }

    async fn with_adapter_within<T, F, Fut>(
        &self,
        printer_id: PrinterId,
        op: Operation,
        timeout: Duration,
        call: F,
    ) -> Result<T, AdapterError>
    where
        F: FnOnce(Arc<dyn PrinterAdapter>) -> Fut,
        Fut: Future<Output = Result<T, AdapterError>>,
    {
        let adapter = self.adapter_for(printer_id)?;
        adapter.capabilities().require(op)?;
        match tokio::time::timeout(timeout, call(adapter)).await {
            Ok(result) => result,
            Err(_) => Err(AdapterError::Timeout(timeout)),
        }
    }

    pub async fn upload(&self, printer_id: PrinterId, file: &FileRef) -> Result<(), AdapterError> {
        let timeout = self.config.upload_timeout();
        self.with_adapter_within(printer_id, Operation::Upload, timeout, |adapter| async move {
            adapter.upload(file).await
        })
        .await
    }

    pub async fn start(
        &self,
        printer_id: PrinterId,
        file: &FileRef,
        options: &StartOptions,
    ) -> Result<JobHandle, AdapterError> {
        self.with_adapter(printer_id, Operation::Start, |adapter| async move {
            adapter.start(file, options).await
        })
        .await
    }

    pub async fn pause(&self, printer_id: PrinterId) -> Result<(), AdapterError> {
        self.with_adapter(printer_id, Operation::Pause, |adapter| async move { adapter.pause().await })
            .await
    }

    pub async fn resume(&self, printer_id: PrinterId) -> Result<(), AdapterError> {
        self.with_adapter(printer_id, Operation::Resume, |adapter| async move { adapter.resume().await })
            .await
    }

    pub async fn cancel(&self, printer_id: PrinterId) -> Result<(), AdapterError> {
        self.with_adapter(printer_id, Operation::Cancel, |adapter| async move { adapter.cancel().await })
            .await
    }

    pub async fn send_raw(&self, printer_id: PrinterId, command: &str) -> Result<(), AdapterError> {
        self.with_adapter(printer_id, Operation::SendRaw, |adapter| async move {
            adapter.send_raw(command).await
        })
        .await
    }

    /// Drops the current session and re-authenticates in the background.
    pub fn reconnect(&self, printer_id: PrinterId) -> Result<(), AdapterError> {
        if self.is_closed() {
            return Err(AdapterError::NotConnected);
        }
        let session = self.session(printer_id).ok_or(AdapterError::NotConnected)?;
        if session.adapter().is_none() {
            return Err(AdapterError::Unsupported(format!("printer brand '{}'", session.record().brand)));
        }
        session.close_subscribers();
        session.set_link(LinkState::Reconnecting);
        self.spawn_pump(&session, true);
        Ok(())
    }

    /// Closes every adapter and stops every pump. Later calls fail fast with
    /// `NotConnected`.
    pub async fn shutdown(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let _ = self.shutdown_tx.send(());
        for session in self.all_sessions() {
            if let Some(mut pump) = session.take_pump() {
                if tokio::time::timeout(Duration::from_secs(1), &mut pump).await.is_err() {
                    pump.abort();
                }
            }
            if let Some(adapter) = session.adapter() {
                adapter.close().await;
            }
            session.close_subscribers();
            session.set_link(LinkState::Offline);
        }
        tracing::info!("printer connections closed");
    }
}

async fn authenticate(
    adapter: &dyn PrinterAdapter,
    record: &PrinterRecord,
    config: &ConnectionConfig,
) -> Result<(), AdapterError> {
    match tokio::time::timeout(config.auth_timeout(), adapter.authenticate(&record.credentials)).await {
        Ok(result) => result,
        Err(_) => Err(AdapterError::Timeout(config.auth_timeout())),
    }
}

async fn open_stream(
    adapter: Arc<dyn PrinterAdapter>,
    config: &ConnectionConfig,
) -> Result<StatusStream, AdapterError> {
    if adapter.capabilities().status_stream {
        adapter.status_stream().await
    } else {
        Ok(polling_stream(adapter, config.status_poll()))
    }
}

/// Stream for adapters that can only be polled. Ends on the first failed poll.
fn polling_stream(adapter: Arc<dyn PrinterAdapter>, period: Duration) -> StatusStream {
    Box::pin(async_stream::stream! {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            ticker.tick().await;
            match adapter.get_status().await {
                Ok(status) => yield status,
                Err(e) => {
                    tracing::debug!("status poll failed, ending stream: {}", e);
                    break;
                }
            }
        }
    })
}

/// Re-authenticates and opens a fresh stream, backing off between attempts.
/// `None` once the attempts are spent, the failure is permanent, or shutdown
/// was requested.
async fn reestablish(
    session: &PrinterSession,
    config: &ConnectionConfig,
    shutdown_rx: &mut broadcast::Receiver<()>,
) -> Option<StatusStream> {
    let adapter = session.adapter()?;
    let printer_id = session.printer_id();
    for attempt in 0..config.reconnect_attempts {
        session.set_link(LinkState::Reconnecting);
        let delay = config.backoff.delay_for(attempt);
        tokio::select! {
            _ = shutdown_rx.recv() => return None,
            _ = tokio::time::sleep(delay) => {}
        }
        match authenticate(adapter.as_ref(), session.record(), config).await {
            Ok(()) => match open_stream(adapter.clone(), config).await {
                Ok(stream) => {
                    tracing::info!(printer_id, attempt = attempt + 1, "printer reconnected");
                    return Some(stream);
                }
                Err(e) => tracing::warn!(printer_id, "reopening status stream failed: {}", e),
            },
            Err(e) if e.is_retryable() => {
                tracing::warn!(printer_id, attempt = attempt + 1, "reconnect failed: {}", e);
            }
            Err(e) => {
                tracing::error!(printer_id, kind = ?e.kind(), "reconnect rejected: {}", e);
                return None;
            }
        }
    }
    tracing::error!(printer_id, attempts = config.reconnect_attempts, "giving up on printer");
    None
}

/// Forwards one printer's adapter stream to its subscribers and keeps the
/// link alive.
async fn pump(
    session: Arc<PrinterSession>,
    config: ConnectionConfig,
    mut shutdown_rx: broadcast::Receiver<()>,
    mut needs_auth: bool,
) {
    let printer_id = session.printer_id();
    loop {
        let stream = if needs_auth {
            reestablish(&session, &config, &mut shutdown_rx).await
        } else {
            match session.adapter() {
                Some(adapter) => match open_stream(adapter, &config).await {
                    Ok(stream) => Some(stream),
                    Err(e) => {
                        tracing::warn!(printer_id, "opening status stream failed: {}", e);
                        needs_auth = true;
                        continue;
                    }
                },
                None => None,
            }
        };
        let Some(mut stream) = stream else {
            session.close_subscribers();
            session.set_link(LinkState::Offline);
            return;
        };
        session.set_link(LinkState::Online);

        let ended = loop {
            tokio::select! {
                _ = shutdown_rx.recv() => break false,
                next = stream.next() => match next {
                    Some(status) => session.publish(status).await,
                    None => break true,
                },
            }
        };
        session.close_subscribers();
        if !ended {
            return;
        }
        tracing::info!(printer_id, "status stream ended, reconnecting");
        session.set_link(LinkState::Reconnecting);
        needs_auth = true;
    }
}
