//! Operator alerts.
//!
//! Alerts are separate from results: a caller gets `SandboxUnavailable`
//! back, while operators get an [`AlertEvent`] on the bus and an `error!`
//! line under the `signal_sandbox::alert` target.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::broadcast;
use tracing::error;
use uuid::Uuid;

const DEFAULT_CAPACITY: usize = 64;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AlertKind {
    SandboxUnavailable,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AlertEvent {
    pub ts: DateTime<Utc>,
    pub kind: AlertKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<Uuid>,
    pub reason: String,
}

pub struct AlertBus {
    sender: broadcast::Sender<AlertEvent>,
    raised: AtomicU64,
    last: Mutex<Option<AlertEvent>>,
}

impl Default for AlertBus {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

impl AlertBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            sender,
            raised: AtomicU64::new(0),
            last: Mutex::new(None),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<AlertEvent> {
        self.sender.subscribe()
    }

    pub fn sandbox_unavailable(&self, request_id: Option<Uuid>, reason: &str) {
        self.raise(AlertEvent {
            ts: Utc::now(),
            kind: AlertKind::SandboxUnavailable,
            request_id,
            reason: reason.to_string(),
        });
    }

    pub fn raise(&self, event: AlertEvent) {
        error!(
            target: "signal_sandbox::alert",
            kind = ?event.kind,
            request_id = ?event.request_id,
            reason = %event.reason,
            "Sandbox unavailable; execution refused"
        );
        self.raised.fetch_add(1, Ordering::SeqCst);
        if let Ok(mut last) = self.last.lock() {
            *last = Some(event.clone());
        }
        // No subscribers is fine; the log line above is the durable signal.
        let _ = self.sender.send(event);
    }

    /// Number of alerts raised since creation.
    pub fn raised(&self) -> u64 {
        self.raised.load(Ordering::SeqCst)
    }

    pub fn last(&self) -> Option<AlertEvent> {
        self.last.lock().ok().and_then(|last| last.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscribers_receive_alerts() {
        let bus = AlertBus::default();
        let mut rx = bus.subscribe();
        let id = Uuid::new_v4();

        bus.sandbox_unavailable(Some(id), "runtime unreachable");

        let event = rx.recv().await.unwrap();
        assert_eq!(event.kind, AlertKind::SandboxUnavailable);
        assert_eq!(event.request_id, Some(id));
        assert_eq!(event.reason, "runtime unreachable");
        assert_eq!(bus.raised(), 1);
        assert_eq!(bus.last().unwrap().reason, "runtime unreachable");
    }

    #[test]
    fn raising_without_subscribers_is_counted() {
        let bus = AlertBus::new(4);
        bus.sandbox_unavailable(None, "a");
        bus.sandbox_unavailable(None, "b");
        assert_eq!(bus.raised(), 2);
        assert_eq!(bus.last().unwrap().reason, "b");
    }
}
