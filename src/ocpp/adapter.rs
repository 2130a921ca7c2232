//! Maintains one logical connection per charger and exposes
//! `send_call(charger_id, action, payload) -> response | error | timeout`
//! to the state machine (spec §4.5). Call pairing uses the OCPP-J
//! `messageId`; the adapter never holds the registry lock.

use std::collections::HashMap;
use std::time::Duration as StdDuration;

use axum::extract::ws::Message as WsMessage;
use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, oneshot, Mutex};
use uuid::Uuid;

use crate::error::ProtocolError;
use crate::ocpp::{Call, ErrorCode};

#[derive(Debug, Clone)]
pub enum CallOutcome {
    Result(serde_json::Value),
    Error { error_code: ErrorCode, description: String },
}

struct Link {
    outbound: mpsc::UnboundedSender<WsMessage>,
    pending: HashMap<String, oneshot::Sender<CallOutcome>>,
    last_seen: DateTime<Utc>,
}

pub struct Adapter {
    links: Mutex<HashMap<String, Link>>,
    ping_timeout: StdDuration,
    watchdog_stale: chrono::Duration,
}

impl Adapter {
    pub fn new(ping_timeout: StdDuration, watchdog_stale: StdDuration) -> Self {
        Self {
            links: Mutex::new(HashMap::new()),
            ping_timeout,
            watchdog_stale: chrono::Duration::from_std(watchdog_stale).unwrap_or(chrono::Duration::seconds(500)),
        }
    }

    pub async fn register(&self, charger_id: &str, outbound: mpsc::UnboundedSender<WsMessage>) {
        let mut links = self.links.lock().await;
        links.insert(
            charger_id.to_string(),
            Link { outbound, pending: HashMap::new(), last_seen: Utc::now() },
        );
    }

    pub async fn unregister(&self, charger_id: &str) {
        self.links.lock().await.remove(charger_id);
    }

    pub async fn touch(&self, charger_id: &str) {
        if let Some(link) = self.links.lock().await.get_mut(charger_id) {
            link.last_seen = Utc::now();
        }
    }

    pub async fn is_connected(&self, charger_id: &str) -> bool {
        self.links.lock().await.contains_key(charger_id)
    }

    /// Sends a `Call` and awaits the matching `CallResult`/`CallError`,
    /// bounded by `ping_timeout`. Outbound calls during transient
    /// disconnects fail fast with `NotConnected` — the next allocator full
    /// pass retries.
    pub async fn send_call(
        &self,
        charger_id: &str,
        action: &str,
        payload: serde_json::Value,
    ) -> Result<CallOutcome, ProtocolError> {
        let message_id = Uuid::new_v4().to_string();
        let (tx, rx) = oneshot::channel();
        {
            let mut links = self.links.lock().await;
            let link = links
                .get_mut(charger_id)
                .ok_or_else(|| ProtocolError::NotConnected(charger_id.to_string()))?;
            link.pending.insert(message_id.clone(), tx);
            let call = Call { message_id: message_id.clone(), action: action.to_string(), payload };
            let json = serde_json::to_string(&call).map_err(|e| ProtocolError::Malformed(e.to_string()))?;
            link.outbound
                .send(WsMessage::Text(json))
                .map_err(|_| ProtocolError::NotConnected(charger_id.to_string()))?;
        }

        match tokio::time::timeout(self.ping_timeout, rx).await {
            Ok(Ok(outcome)) => Ok(outcome),
            Ok(Err(_)) => Err(ProtocolError::NotConnected(charger_id.to_string())),
            Err(_) => {
                if let Some(link) = self.links.lock().await.get_mut(charger_id) {
                    link.pending.remove(&message_id);
                }
                Err(ProtocolError::Timeout { message_id })
            }
        }
    }

    /// Resolves a pending call when a `CallResult`/`CallError` arrives.
    /// Returns `false` if the `message_id` has no matching pending call
    /// (stale retry, or a response to a call that already timed out).
    pub async fn resolve_pending(&self, charger_id: &str, message_id: &str, outcome: CallOutcome) -> bool {
        let mut links = self.links.lock().await;
        if let Some(link) = links.get_mut(charger_id) {
            link.last_seen = Utc::now();
            if let Some(tx) = link.pending.remove(message_id) {
                let _ = tx.send(outcome);
                return true;
            }
        }
        false
    }

    /// Charger ids whose last inbound traffic exceeds `watchdog_stale`.
    pub async fn stale_chargers(&self, now: DateTime<Utc>) -> Vec<String> {
        self.links
            .lock()
            .await
            .iter()
            .filter(|(_, link)| now - link.last_seen > self.watchdog_stale)
            .map(|(id, _)| id.clone())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn send_call_to_unknown_charger_fails_fast() {
        let adapter = Adapter::new(StdDuration::from_millis(50), StdDuration::from_secs(500));
        let err = adapter.send_call("GHOST", "Heartbeat", serde_json::json!({})).await.unwrap_err();
        assert_eq!(err, ProtocolError::NotConnected("GHOST".to_string()));
    }

    #[tokio::test]
    async fn send_call_times_out_without_response() {
        let adapter = Adapter::new(StdDuration::from_millis(20), StdDuration::from_secs(500));
        let (tx, mut rx) = mpsc::unbounded_channel();
        adapter.register("CP1", tx).await;
        let result = adapter.send_call("CP1", "Heartbeat", serde_json::json!({})).await;
        assert!(matches!(result, Err(ProtocolError::Timeout { .. })));
        // the frame was still sent on the wire
        assert!(rx.recv().await.is_some());
    }

    #[tokio::test]
    async fn resolve_pending_delivers_outcome() {
        let adapter = Adapter::new(StdDuration::from_secs(5), StdDuration::from_secs(500));
        let (tx, mut rx) = mpsc::unbounded_channel();
        adapter.register("CP1", tx).await;

        let call_fut = adapter.send_call("CP1", "Heartbeat", serde_json::json!({}));
        let sent = rx.recv().await.unwrap();
        let WsMessage::Text(json) = sent else { panic!("expected text frame") };
        let frame: crate::ocpp::Frame = serde_json::from_str(&json).unwrap();
        let crate::ocpp::Frame::Call(call) = frame else { panic!("expected call frame") };

        adapter
            .resolve_pending("CP1", &call.message_id, CallOutcome::Result(serde_json::json!({"currentTime": "now"})))
            .await;

        let outcome = call_fut.await.unwrap();
        assert!(matches!(outcome, CallOutcome::Result(_)));
    }

    #[tokio::test]
    async fn stale_detection_respects_watchdog_window() {
        let adapter = Adapter::new(StdDuration::from_secs(5), StdDuration::from_secs(0));
        let (tx, _rx) = mpsc::unbounded_channel();
        adapter.register("CP1", tx).await;
        let stale = adapter.stale_chargers(Utc::now() + chrono::Duration::seconds(1)).await;
        assert_eq!(stale, vec!["CP1".to_string()]);
    }
}
