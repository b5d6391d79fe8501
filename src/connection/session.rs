use ottoflow_shared::model::{PrinterId, PrinterRecord};
use ottoflow_shared::{lock, DeviceStatus, PrinterAdapter};
use serde::Serialize;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LinkState {
    Online,
    Reconnecting,
    Offline,
}

/// One printer's live link: its adapter, the last observation and the
/// consumers of its status feed.
pub(crate) struct PrinterSession {
    record: PrinterRecord,
    adapter: Option<Arc<dyn PrinterAdapter>>,
    link: Mutex<LinkState>,
    last_status: Mutex<Option<DeviceStatus>>,
    subscribers: Mutex<Vec<mpsc::Sender<DeviceStatus>>>,
    pump: Mutex<Option<JoinHandle<()>>>,
}

impl PrinterSession {
    pub fn new(record: PrinterRecord, adapter: Arc<dyn PrinterAdapter>) -> Self {
        Self::build(record, Some(adapter))
    }

    /// A printer with no usable adapter. Stays OFFLINE.
    pub fn detached(record: PrinterRecord) -> Self {
        Self::build(record, None)
    }

    fn build(record: PrinterRecord, adapter: Option<Arc<dyn PrinterAdapter>>) -> Self {
        Self {
            record,
            adapter,
            link: Mutex::new(LinkState::Offline),
            last_status: Mutex::new(None),
            subscribers: Mutex::new(Vec::new()),
            pump: Mutex::new(None),
        }
    }

    pub fn printer_id(&self) -> PrinterId {
        self.record.id
    }

    pub fn record(&self) -> &PrinterRecord {
        &self.record
    }

    pub fn adapter(&self) -> Option<Arc<dyn PrinterAdapter>> {
        self.adapter.clone()
    }

    pub fn link(&self) -> LinkState {
        *lock(&self.link)
    }

    pub fn set_link(&self, state: LinkState) {
        let previous = std::mem::replace(&mut *lock(&self.link), state);
        if previous != state {
            tracing::info!(printer_id = self.record.id, "printer link {:?} -> {:?}", previous, state);
        }
    }

    pub fn last_status(&self) -> Option<DeviceStatus> {
        lock(&self.last_status).clone()
    }

    pub fn remember(&self, status: DeviceStatus) {
        *lock(&self.last_status) = Some(status);
    }

    /// New consumer. The latest known status is replayed first so a late
    /// subscriber does not wait a full poll period.
    pub fn subscribe(&self, buffer: usize) -> mpsc::Receiver<DeviceStatus> {
        let (tx, rx) = mpsc::channel(buffer.max(1));
        let mut subscribers = lock(&self.subscribers);
        if let Some(last) = self.last_status() {
            let _ = tx.try_send(last);
        }
        subscribers.push(tx);
        rx
    }

    /// Fans one observation out in adapter order. Non-terminal updates are
    /// dropped for a subscriber whose queue is full; terminal ones wait.
    pub async fn publish(&self, status: DeviceStatus) {
        self.remember(status.clone());
        let terminal = status.is_terminal();
        let subscribers: Vec<_> = lock(&self.subscribers).clone();
        for tx in &subscribers {
            if terminal {
                let _ = tx.send(status.clone()).await;
            } else if let Err(mpsc::error::TrySendError::Full(_)) = tx.try_send(status.clone()) {
                tracing::debug!(
                    printer_id = self.record.id,
                    "subscriber lagging, dropped {} update",
                    status.state
                );
            }
        }
        lock(&self.subscribers).retain(|tx| !tx.is_closed());
    }

    /// Ends every subscriber's sequence.
    pub fn close_subscribers(&self) {
        lock(&self.subscribers).clear();
    }

    pub fn subscriber_count(&self) -> usize {
        lock(&self.subscribers).len()
    }

    pub fn set_pump(&self, handle: JoinHandle<()>) {
        if let Some(previous) = lock(&self.pump).replace(handle) {
            previous.abort();
        }
    }

    pub fn take_pump(&self) -> Option<JoinHandle<()>> {
        lock(&self.pump).take()
    }
}
