//! Periodic reaper (spec §4.6): drops chargers silent past `watchdog_stale`,
//! force-closes transactions whose last traffic predates `transaction_timeout`,
//! and wakes the allocator so the next cycle reflects the drop immediately.

use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::allocator::AllocatorLoop;
use crate::domain::charger::ConnectorStatus;
use crate::domain::session::StopReason;
use crate::ocpp::adapter::Adapter;
use crate::registry::Registry;

pub struct Watchdog {
    registry: Arc<Registry>,
    adapter: Arc<Adapter>,
    allocator: Arc<AllocatorLoop>,
    watchdog_interval: StdDuration,
    transaction_timeout: chrono::Duration,
}

impl Watchdog {
    pub fn new(
        registry: Arc<Registry>,
        adapter: Arc<Adapter>,
        allocator: Arc<AllocatorLoop>,
        watchdog_interval: StdDuration,
        transaction_timeout: chrono::Duration,
    ) -> Self {
        Self { registry, adapter, allocator, watchdog_interval, transaction_timeout }
    }

    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        let mut interval = tokio::time::interval(self.watchdog_interval);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("watchdog received shutdown signal");
                    break;
                }
                _ = interval.tick() => {
                    self.sweep().await;
                }
            }
        }
    }

    pub async fn sweep(&self) {
        let now = Utc::now();

        let stale_chargers = self.adapter.stale_chargers(now).await;
        for charger_id in &stale_chargers {
            let snap = self.registry.snapshot().await;
            let Some(charger) = snap.chargers.get(charger_id) else { continue };
            for connector in &charger.connectors {
                if connector.status != ConnectorStatus::Unknown {
                    let _ = self
                        .registry
                        .mutate_connector(charger_id, connector.index, |c| c.status = ConnectorStatus::Unknown)
                        .await;
                    warn!(%charger_id, connector = connector.index, "charger silent past watchdog_stale, marked Unknown");
                }
            }
        }

        let snap = self.registry.snapshot().await;
        for session in snap.sessions.values() {
            let last_traffic = snap
                .chargers
                .get(&session.charger_id)
                .and_then(|c| c.last_seen)
                .unwrap_or(session.start_time);
            if now - last_traffic >= self.transaction_timeout {
                warn!(session_id = %session.id, charger_id = %session.charger_id, "force-closing stale transaction");
                let _ = self.registry.close_session(session.id, now, StopReason::Stale, Some(0)).await;
            }
        }

        if !stale_chargers.is_empty() {
            self.allocator.run_once(false).await;
        }
    }
}
