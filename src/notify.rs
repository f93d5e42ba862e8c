use async_trait::async_trait;
use dashmap::DashMap;
use serde::Serialize;
use tokio::sync::broadcast;
use ulid::Ulid;

use crate::model::{Event, ReservationHold};

const CHANNEL_CAPACITY: usize = 256;

/// Broadcast hub for committed events, one channel per resource.
pub struct NotifyHub {
    channels: DashMap<Ulid, broadcast::Sender<Event>>,
}

impl NotifyHub {
    pub fn new() -> Self {
        Self {
            channels: DashMap::new(),
        }
    }

    /// Subscribe to events for a resource. Creates the channel if needed.
    pub fn subscribe(&self, resource_id: Ulid) -> broadcast::Receiver<Event> {
        let sender = self
            .channels
            .entry(resource_id)
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0);
        sender.subscribe()
    }

    /// Send an event. No-op if nobody is listening.
    pub fn send(&self, resource_id: Ulid, event: &Event) {
        if let Some(sender) = self.channels.get(&resource_id) {
            let _ = sender.send(event.clone());
        }
    }

    /// Drop a resource's channel; open receivers see `Closed`.
    pub fn remove(&self, resource_id: &Ulid) {
        self.channels.remove(resource_id);
    }
}

impl Default for NotifyHub {
    fn default() -> Self {
        Self::new()
    }
}

// ── Requester notices ────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum NoticeKind {
    /// A unit is waiting for collection until `expires_at`.
    HoldReady,
    HoldExpired,
    HoldCancelled,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HoldNotice {
    pub kind: NoticeKind,
    pub hold: ReservationHold,
}

impl HoldNotice {
    pub fn ready(hold: ReservationHold) -> Self {
        Self { kind: NoticeKind::HoldReady, hold }
    }

    pub fn expired(hold: ReservationHold) -> Self {
        Self { kind: NoticeKind::HoldExpired, hold }
    }

    pub fn cancelled(hold: ReservationHold) -> Self {
        Self { kind: NoticeKind::HoldCancelled, hold }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum NotifyError {
    #[error("delivery failed: {0}")]
    Delivery(String),
    #[error("encode notice: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Outbound channel to requesters (email, push, ...). Called after commit,
/// outside any resource lock.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, requester_id: Ulid, notice: &HoldNotice) -> Result<(), NotifyError>;
}

/// Writes each notice as a JSON line through `tracing`.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify(&self, requester_id: Ulid, notice: &HoldNotice) -> Result<(), NotifyError> {
        let payload = serde_json::to_string(notice)?;
        tracing::info!("notice for {requester_id}: {payload}");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::HoldStatus;

    fn hold() -> ReservationHold {
        ReservationHold {
            id: Ulid::new(),
            resource_id: Ulid::new(),
            requester_id: Ulid::new(),
            entry_id: Ulid::new(),
            reserved_at: 0,
            expires_at: 86_400_000,
            status: HoldStatus::Active,
            notification_sent: false,
            collected_at: None,
            closed_at: None,
            cancel_reason: None,
        }
    }

    #[tokio::test]
    async fn subscribe_and_receive() {
        let hub = NotifyHub::new();
        let rid = Ulid::new();
        let mut rx = hub.subscribe(rid);

        let event = Event::EntryLeft { id: Ulid::new(), resource_id: rid };
        hub.send(rid, &event);

        let received = rx.recv().await.unwrap();
        assert_eq!(received, event);
    }

    #[tokio::test]
    async fn send_without_subscribers_is_noop() {
        let hub = NotifyHub::new();
        let rid = Ulid::new();
        hub.send(rid, &Event::ResourceRetired { id: rid, at: 0 });
    }

    #[tokio::test]
    async fn remove_closes_receivers() {
        let hub = NotifyHub::new();
        let rid = Ulid::new();
        let mut rx = hub.subscribe(rid);
        hub.remove(&rid);
        assert!(matches!(rx.recv().await, Err(broadcast::error::RecvError::Closed)));
    }

    #[test]
    fn notice_payload_shape() {
        let notice = HoldNotice::ready(hold());
        let json: serde_json::Value = serde_json::to_value(&notice).unwrap();
        assert_eq!(json["kind"], "hold_ready");
        assert_eq!(json["hold"]["expires_at"], 86_400_000);
        assert_eq!(json["hold"]["status"], "Active");
    }

    #[tokio::test]
    async fn log_notifier_accepts_every_kind() {
        let n = LogNotifier;
        let h = hold();
        for notice in [HoldNotice::ready(h.clone()), HoldNotice::expired(h.clone()), HoldNotice::cancelled(h)] {
            n.notify(Ulid::new(), &notice).await.unwrap();
        }
    }
}
