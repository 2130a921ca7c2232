//! The impure balanz loop driver (spec §4.4, §5): ticks every `run_interval`,
//! runs a full pass every `intervals_full` cycles, and commits offer changes
//! through the state machine, dropping the registry lock across outbound
//! OCPP calls and serializing commits per charger.

pub mod algorithm;

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::Utc;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::allocator::algorithm::{run_cycle, AllocatorConfig};
use crate::registry::Registry;
use crate::statemachine::StateMachine;

pub struct AllocatorLoop {
    registry: Arc<Registry>,
    statemachine: Arc<StateMachine>,
    config: AllocatorConfig,
    run_interval: StdDuration,
    intervals_full: u32,
    first_wait: StdDuration,
    /// Group ids frozen by `SetBalanzState(group_id, true)` — offers held,
    /// no new commits issued for chargers under these groups.
    suspended_groups: Mutex<HashSet<String>>,
}

impl AllocatorLoop {
    pub fn new(
        registry: Arc<Registry>,
        statemachine: Arc<StateMachine>,
        config: AllocatorConfig,
        run_interval: StdDuration,
        intervals_full: u32,
        first_wait: StdDuration,
    ) -> Self {
        Self {
            registry,
            statemachine,
            config,
            run_interval,
            intervals_full,
            first_wait,
            suspended_groups: Mutex::new(HashSet::new()),
        }
    }

    pub async fn suspend_group(&self, group_id: &str, suspend: bool) {
        let mut groups = self.suspended_groups.lock().await;
        if suspend {
            groups.insert(group_id.to_string());
        } else {
            groups.remove(group_id);
        }
    }

    /// Runs until `run_interval` is zero (smart charging disabled globally)
    /// is never true at construction time; a live `run_interval = 0` is
    /// handled by the caller choosing not to spawn this loop at all.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        tokio::time::sleep(self.first_wait).await;
        let mut tick: u32 = 0;
        let mut interval = tokio::time::interval(self.run_interval);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("allocator loop received shutdown signal");
                    break;
                }
                _ = interval.tick() => {
                    let full_pass = tick % self.intervals_full == 0;
                    tick = tick.wrapping_add(1);
                    self.run_once(full_pass).await;
                }
            }
        }
    }

    pub async fn run_once(&self, full_pass: bool) {
        let now = Utc::now();
        let snapshot = self.registry.snapshot().await;
        if let Err(violation) = crate::registry::check_invariants(&snapshot) {
            warn!(%violation, "registry invariant violated before allocator cycle; skipping");
            return;
        }

        let suspended = self.suspended_groups.lock().await.clone();
        let changes = run_cycle(&snapshot, now, &self.config, full_pass);

        for change in changes {
            let Some(charger) = snapshot.chargers.get(&change.charger_id) else { continue };
            if suspended.contains(&charger.group_id) {
                continue;
            }
            self.commit_one(change).await;
        }

        for (charger_id, connector_index, resume_at) in algorithm::collect_suspensions(&snapshot, now, &self.config) {
            let _ = self
                .registry
                .mutate_connector(&charger_id, connector_index, |c| {
                    c.unused_suspended_until = Some(resume_at);
                })
                .await;
        }

        for (charger_id, connector_index, plateau_a) in algorithm::collect_plateau_updates(&snapshot, now, &self.config) {
            let _ = self
                .registry
                .mutate_connector(&charger_id, connector_index, |c| {
                    c.plateau_a = Some(plateau_a);
                })
                .await;
        }
    }

    /// Issues one offer change and records the outcome. Per-charger commits
    /// are naturally serialized: the registry mutex plus the adapter's
    /// single logical connection per charger prevent overlap.
    async fn commit_one(&self, change: algorithm::OfferChange) {
        let result = self
            .statemachine
            .apply_offer(&change.charger_id, change.connector_index, change.transaction_id, change.new_offer)
            .await;

        match result {
            Ok(()) => {
                let now = Utc::now();
                let _ = self
                    .registry
                    .mutate_connector(&change.charger_id, change.connector_index, |c| {
                        c.offer_a = change.new_offer;
                        c.last_offer_change = now;
                        if change.new_offer > 0 {
                            c.unused_suspended_until = None;
                        }
                    })
                    .await;
                if let Some(session_id) = self
                    .registry
                    .snapshot()
                    .await
                    .session_for_connector(&change.charger_id, change.connector_index)
                    .map(|s| s.id)
                {
                    let offer = if change.new_offer == 0 { None } else { Some(change.new_offer) };
                    let _ = self.registry.mutate_session(session_id, |s| s.record_offer(now, offer)).await;
                }
            }
            Err(e) => {
                warn!(
                    charger_id = %change.charger_id,
                    connector = change.connector_index,
                    error = %e,
                    "offer commit failed, retrying next cycle"
                );
            }
        }
    }
}
