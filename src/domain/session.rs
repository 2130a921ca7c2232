//! Session (transaction) records and the priority-resolution chain.

use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString)]
pub enum StopReason {
    Local,
    Remote,
    EvDisconnected,
    HardReset,
    SoftReset,
    PowerLoss,
    Reboot,
    UnlockCommand,
    DeAuthorized,
    EmergencyStop,
    /// Watchdog force-close after `transaction_timeout` of silence.
    Stale,
    /// Orphaned by a `ReloadChargers`/`ReloadGroups` that removed the owner.
    ConfigReload,
    Other,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MeterSample {
    pub timestamp: DateTime<Utc>,
    pub energy_cumulative_kwh: f64,
    /// Per-phase current, amperes; empty if the charger reports aggregate only.
    pub current_a: Vec<f64>,
}

impl MeterSample {
    pub fn max_phase_current(&self) -> f64 {
        self.current_a.iter().cloned().fold(0.0, f64::max)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub id: Uuid,
    pub charger_id: String,
    pub connector_index: u32,
    pub id_tag: String,
    /// Numeric transaction id assigned in the `StartTransaction` response;
    /// `None` until the charger's start-transaction call is acknowledged.
    pub ocpp_transaction_id: Option<i32>,
    pub start_time: DateTime<Utc>,
    pub priority: i32,
    /// Bounded window of recent meter samples, newest last.
    pub meter_samples: VecDeque<MeterSample>,
    /// `(timestamp, offer_A)` transitions; `None` offer_A is recorded as the
    /// literal `None` on persistence (spec §6 sessions.csv `history` column).
    pub offer_history: Vec<(DateTime<Utc>, Option<u32>)>,
    pub stop_time: Option<DateTime<Utc>>,
    pub stop_reason: Option<StopReason>,
    /// The id-tag that issued `StopTransaction`, if reported and different
    /// from `id_tag` (a parent-group member stopping someone else's session).
    pub stop_id_tag: Option<String>,
    /// Energy threshold crossing unlocks the shorter `suspended_delayed_time`
    /// reclamation window instead of `suspended_allocation_timeout`.
    pub energy_threshold_crossed: bool,
}

impl Session {
    pub fn new(charger_id: String, connector_index: u32, id_tag: String, priority: i32, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            charger_id,
            connector_index,
            id_tag,
            ocpp_transaction_id: None,
            start_time: now,
            priority,
            meter_samples: VecDeque::new(),
            offer_history: vec![(now, None)],
            stop_time: None,
            stop_reason: None,
            stop_id_tag: None,
            energy_threshold_crossed: false,
        }
    }

    pub fn is_open(&self) -> bool {
        self.stop_time.is_none()
    }

    pub fn record_offer(&mut self, now: DateTime<Utc>, offer_a: Option<u32>) {
        self.offer_history.push((now, offer_a));
    }

    pub fn close(&mut self, now: DateTime<Utc>, reason: StopReason, final_offer: Option<u32>) {
        self.close_with_tag(now, reason, final_offer, None);
    }

    pub fn close_with_tag(&mut self, now: DateTime<Utc>, reason: StopReason, final_offer: Option<u32>, stop_id_tag: Option<String>) {
        self.record_offer(now, final_offer);
        self.stop_time = Some(now);
        self.stop_reason = Some(reason);
        self.stop_id_tag = stop_id_tag;
    }

    pub fn push_meter_sample(&mut self, sample: MeterSample, max_samples: usize) {
        self.meter_samples.push_back(sample);
        while self.meter_samples.len() > max_samples {
            self.meter_samples.pop_front();
        }
        if let Some(last) = self.meter_samples.back() {
            const ENERGY_THRESHOLD_WH: f64 = 1000.0;
            if last.energy_cumulative_kwh * 1000.0 >= ENERGY_THRESHOLD_WH {
                self.energy_threshold_crossed = true;
            }
        }
    }

    /// Rolling maximum phase current observed within `window` ending at `now`.
    pub fn rolling_max_current(&self, now: DateTime<Utc>, window: chrono::Duration) -> Option<f64> {
        let cutoff = now - window;
        self.meter_samples
            .iter()
            .filter(|s| s.timestamp >= cutoff)
            .map(|s| s.max_phase_current())
            .fold(None, |acc, v| Some(acc.map_or(v, |a: f64| a.max(v))))
    }
}

/// Session-priority override chain (spec §9 "Polymorphism"): each stage
/// fully overrides the previous one when present. `charger_default` is
/// mandatory in the data model and only takes effect as a fallback when no
/// `group_default` is configured for the session's owning group.
pub fn resolve_priority(
    config_default: i32,
    group_default: Option<i32>,
    charger_default: i32,
    tag_override: Option<i32>,
    explicit: Option<i32>,
) -> i32 {
    let mut priority = config_default;
    priority = group_default.unwrap_or(charger_default);
    if let Some(t) = tag_override {
        priority = t;
    }
    if let Some(e) = explicit {
        priority = e;
    }
    priority
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolution_chain_prefers_most_specific_present_value() {
        assert_eq!(resolve_priority(0, None, 1, None, None), 1);
        assert_eq!(resolve_priority(0, Some(2), 1, None, None), 2);
        assert_eq!(resolve_priority(0, Some(2), 1, Some(5), None), 5);
        assert_eq!(resolve_priority(0, Some(2), 1, Some(5), Some(9)), 9);
    }

    #[test]
    fn rolling_max_current_ignores_samples_outside_window() {
        let mut session = Session::new("cp1".into(), 1, "TAG1".into(), 1, Utc::now());
        let now = session.start_time;
        session.push_meter_sample(
            MeterSample {
                timestamp: now - chrono::Duration::seconds(400),
                energy_cumulative_kwh: 0.1,
                current_a: vec![20.0, 20.0, 20.0],
            },
            64,
        );
        session.push_meter_sample(
            MeterSample {
                timestamp: now,
                energy_cumulative_kwh: 0.2,
                current_a: vec![6.0, 6.0, 6.0],
            },
            64,
        );
        let max = session
            .rolling_max_current(now, chrono::Duration::seconds(300))
            .unwrap();
        assert_eq!(max, 6.0);
    }
}
