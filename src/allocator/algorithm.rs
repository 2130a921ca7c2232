//! The balanz loop's pure core (spec §4.4): `(snapshot, now) -> Vec<OfferChange>`.
//! No I/O, no locking — the driver in `allocator::mod` owns the impure commit
//! step and the registry lock.

use std::collections::HashMap;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use uuid::Uuid;

use crate::domain::charger::ConnectorStatus;
use crate::registry::Snapshot;

#[derive(Debug, Clone, Copy)]
pub struct AllocatorConfig {
    pub min_allocation_a: u32,
    pub max_offer_increase_a: u32,
    pub min_offer_increase_interval: ChronoDuration,
    pub wait_after_reduce: ChronoDuration,
    pub usage_monitoring_interval: ChronoDuration,
    pub margin_lower_a: f64,
    pub usage_threshold_a: f64,
    pub suspended_allocation_timeout: ChronoDuration,
    pub suspended_delayed_time: ChronoDuration,
    pub suspended_delayed_time_not_first: ChronoDuration,
    pub energy_threshold_wh: f64,
    pub suspend_top_of_hour: bool,
}

impl Default for AllocatorConfig {
    fn default() -> Self {
        Self {
            min_allocation_a: 6,
            max_offer_increase_a: 3,
            min_offer_increase_interval: ChronoDuration::seconds(115),
            wait_after_reduce: ChronoDuration::seconds(5),
            usage_monitoring_interval: ChronoDuration::seconds(300),
            margin_lower_a: 0.8,
            usage_threshold_a: 2.0,
            suspended_allocation_timeout: ChronoDuration::seconds(300),
            suspended_delayed_time: ChronoDuration::seconds(300),
            suspended_delayed_time_not_first: ChronoDuration::seconds(60),
            energy_threshold_wh: 1000.0,
            suspend_top_of_hour: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OfferChange {
    pub charger_id: String,
    pub connector_index: u32,
    pub transaction_id: Option<i32>,
    pub previous_offer: u32,
    pub new_offer: u32,
}

struct Candidate {
    charger_id: String,
    connector_index: u32,
    priority: i32,
    conn_max: u32,
    effective_max: u32,
    current_offer: u32,
    last_offer_change: DateTime<Utc>,
    rolling_usage: Option<f64>,
    session_id: Option<Uuid>,
    transaction_id: Option<i32>,
    energy_threshold_crossed: bool,
    ancestor_groups: Vec<String>,
    plateau_a: Option<u32>,
}

/// Allocation groups on the path from `group_id` to the root, nearest first,
/// restricted to groups that actually carry a `max_allocation` schedule.
fn ancestor_allocation_groups(snapshot: &Snapshot, group_id: &str) -> Vec<String> {
    let mut chain = Vec::new();
    let mut current = snapshot.groups.get(group_id);
    while let Some(group) = current {
        if group.is_allocation_group() {
            chain.push(group.id.clone());
        }
        current = group.parent_id.as_deref().and_then(|p| snapshot.groups.get(p));
    }
    chain
}

fn cap_for(snapshot: &Snapshot, group_id: &str, now: DateTime<Utc>, priority: i32) -> u32 {
    snapshot
        .groups
        .get(group_id)
        .and_then(|g| g.max_allocation.as_ref())
        .map(|schedule| schedule.cap_at(now, priority))
        .unwrap_or(u32::MAX)
}

/// Runs one allocator cycle. `full_pass` gates the initial-allocation step
/// (4.4 step 4); intermediate cycles only reduce, grow and reclaim.
pub fn run_cycle(snapshot: &Snapshot, now: DateTime<Utc>, config: &AllocatorConfig, full_pass: bool) -> Vec<OfferChange> {
    let mut candidates = collect_candidates(snapshot, now, config);
    candidates.sort_by(|a, b| {
        b.priority
            .cmp(&a.priority)
            .then(a.last_offer_change.cmp(&b.last_offer_change))
            .then(a.charger_id.cmp(&b.charger_id))
    });

    let mut totals: HashMap<String, u32> = HashMap::new();
    let mut tentative: HashMap<(String, u32), u32> = candidates
        .iter()
        .map(|c| ((c.charger_id.clone(), c.connector_index), c.current_offer))
        .collect();
    let mut suspensions: Vec<(String, u32, DateTime<Utc>)> = Vec::new();

    // Reductions first, so a reduced connector's `last_offer_change` blocks
    // its own growth step later this same cycle via `wait_after_reduce`.
    let mut reduced_at: HashMap<(String, u32), DateTime<Utc>> = HashMap::new();
    for c in &candidates {
        let key = (c.charger_id.clone(), c.connector_index);
        if let Some(usage) = c.rolling_usage {
            if c.current_offer as f64 > usage + config.margin_lower_a {
                let reduced = (usage.floor() as i64 + 1).max(config.min_allocation_a as i64) as u32;
                let reduced = reduced.min(c.current_offer);
                if reduced < c.current_offer {
                    tentative.insert(key.clone(), reduced);
                    reduced_at.insert(key, now);
                }
            }
        }
    }

    // Unused-offer reclamation: parked at the floor, barely drawing.
    for c in &candidates {
        let key = (c.charger_id.clone(), c.connector_index);
        let offer = tentative[&key];
        if offer != config.min_allocation_a {
            continue;
        }
        let idle_long_enough = now - c.last_offer_change >= config.usage_monitoring_interval;
        let underused = c.rolling_usage.map(|u| u < config.usage_threshold_a).unwrap_or(false);
        if idle_long_enough && underused {
            tentative.insert(key.clone(), 0);
            let delay = if c.energy_threshold_crossed {
                config.suspended_delayed_time_not_first
            } else if config.suspend_top_of_hour {
                next_top_of_hour(now) - now
            } else {
                config.suspended_allocation_timeout
            };
            suspensions.push((c.charger_id.clone(), c.connector_index, now + delay));
        }
    }

    // Seed totals with whatever survived reduction/reclamation, respecting
    // priority order so the running sum matches the invariant's prefix.
    for c in &candidates {
        let key = (c.charger_id.clone(), c.connector_index);
        let offer = tentative[&key];
        for group in &c.ancestor_groups {
            *totals.entry(group.clone()).or_insert(0) += offer;
        }
    }

    if full_pass {
        for c in &candidates {
            let key = (c.charger_id.clone(), c.connector_index);
            if tentative[&key] != 0 {
                continue;
            }
            if !room_for(snapshot, now, config, &c.ancestor_groups, &totals, c.priority, config.min_allocation_a) {
                continue;
            }
            commit_increment(&mut totals, &c.ancestor_groups, config.min_allocation_a);
            tentative.insert(key, config.min_allocation_a);
        }
    }

    // Growth phase: strictly after reductions, gated by both dwell timers.
    for c in &candidates {
        let key = (c.charger_id.clone(), c.connector_index);
        let offer = tentative[&key];
        if offer >= c.effective_max || offer == 0 {
            continue;
        }
        if now - c.last_offer_change < config.min_offer_increase_interval {
            continue;
        }
        if let Some(reduced_when) = reduced_at.get(&key) {
            if now - *reduced_when < config.wait_after_reduce {
                continue;
            }
        }
        let headroom = c.effective_max - offer;
        let mut step = headroom.min(config.max_offer_increase_a);
        while step > 0 {
            if room_for(snapshot, now, config, &c.ancestor_groups, &totals, c.priority, step) {
                break;
            }
            step -= 1;
        }
        if step > 0 {
            commit_increment(&mut totals, &c.ancestor_groups, step);
            tentative.insert(key, offer + step);
        }
    }

    let mut changes = Vec::new();
    for c in &candidates {
        let key = (c.charger_id.clone(), c.connector_index);
        let new_offer = tentative[&key];
        if new_offer != c.current_offer {
            changes.push(OfferChange {
                charger_id: c.charger_id.clone(),
                connector_index: c.connector_index,
                transaction_id: c.transaction_id,
                previous_offer: c.current_offer,
                new_offer,
            });
        }
    }
    changes
}

fn room_for(
    snapshot: &Snapshot,
    now: DateTime<Utc>,
    config: &AllocatorConfig,
    ancestor_groups: &[String],
    totals: &HashMap<String, u32>,
    priority: i32,
    amount: u32,
) -> bool {
    let _ = config;
    ancestor_groups.iter().all(|g| {
        let cap = cap_for(snapshot, g, now, priority);
        let used = totals.get(g).copied().unwrap_or(0);
        used.saturating_add(amount) <= cap
    })
}

fn commit_increment(totals: &mut HashMap<String, u32>, ancestor_groups: &[String], amount: u32) {
    for g in ancestor_groups {
        *totals.entry(g.clone()).or_insert(0) += amount;
    }
}

fn next_top_of_hour(now: DateTime<Utc>) -> DateTime<Utc> {
    use chrono::Timelike;
    let base = now
        .with_minute(0)
        .and_then(|t| t.with_second(0))
        .and_then(|t| t.with_nanosecond(0))
        .unwrap_or(now);
    if base > now {
        base
    } else {
        base + ChronoDuration::hours(1)
    }
}

/// Offer-change suspension bookkeeping the driver applies after commit:
/// `(charger_id, connector_index, resume_at)` for connectors newly parked
/// as unused-suspended this cycle.
pub fn collect_suspensions(snapshot: &Snapshot, now: DateTime<Utc>, config: &AllocatorConfig) -> Vec<(String, u32, DateTime<Utc>)> {
    // Re-derives the same decision as `run_cycle`'s reclamation pass so the
    // driver can persist `unused_suspended_until` without re-threading state
    // through the pure return value.
    let candidates = collect_candidates(snapshot, now, config);
    let mut out = Vec::new();
    for c in &candidates {
        if c.current_offer != config.min_allocation_a {
            continue;
        }
        let idle_long_enough = now - c.last_offer_change >= config.usage_monitoring_interval;
        let underused = c.rolling_usage.map(|u| u < config.usage_threshold_a).unwrap_or(false);
        if idle_long_enough && underused {
            let delay = if c.energy_threshold_crossed {
                config.suspended_delayed_time_not_first
            } else if config.suspend_top_of_hour {
                next_top_of_hour(now) - now
            } else {
                config.suspended_allocation_timeout
            };
            out.push((c.charger_id.clone(), c.connector_index, now + delay));
        }
    }
    out
}

/// Plateau detection (spec §4.4 step 2): once observed usage settles well
/// below the installed offer, the EV has revealed its own ceiling. Records
/// `(charger_id, connector_index, plateau_a)` for the driver to persist as
/// `Connector::plateau_a`, sticky for the rest of the session.
pub fn collect_plateau_updates(snapshot: &Snapshot, now: DateTime<Utc>, config: &AllocatorConfig) -> Vec<(String, u32, u32)> {
    let candidates = collect_candidates(snapshot, now, config);
    let mut out = Vec::new();
    for c in &candidates {
        if c.plateau_a.is_some() {
            continue;
        }
        let Some(usage) = c.rolling_usage else {
            continue;
        };
        if c.current_offer as f64 <= usage + config.margin_lower_a {
            continue;
        }
        let ceiling = (usage.floor() as i64 + 1).max(config.min_allocation_a as i64) as u32;
        if ceiling < c.current_offer {
            out.push((c.charger_id.clone(), c.connector_index, ceiling));
        }
    }
    out
}

fn collect_candidates(snapshot: &Snapshot, now: DateTime<Utc>, config: &AllocatorConfig) -> Vec<Candidate> {
    let mut out = Vec::new();
    for charger in snapshot.chargers.values() {
        let ancestor_groups = ancestor_allocation_groups(snapshot, &charger.group_id);
        for connector in &charger.connectors {
            if !connector.status.is_allocation_eligible() {
                continue;
            }
            if connector.is_unused_suspended(now) {
                continue;
            }
            let session = connector.live_session_id.and_then(|id| snapshot.sessions.get(&id));
            let priority = session.map(|s| s.priority).unwrap_or(charger.default_priority);
            let rolling_usage = session.and_then(|s| s.rolling_max_current(now, config.usage_monitoring_interval));
            let effective_max = connector.plateau_a.unwrap_or(charger.conn_max).min(charger.conn_max);
            out.push(Candidate {
                charger_id: charger.charger_id.clone(),
                connector_index: connector.index,
                priority,
                conn_max: charger.conn_max,
                effective_max,
                current_offer: connector.offer_a,
                last_offer_change: connector.last_offer_change,
                rolling_usage,
                session_id: connector.live_session_id,
                transaction_id: session.and_then(|s| s.ocpp_transaction_id),
                energy_threshold_crossed: session.map(|s| s.energy_threshold_crossed).unwrap_or(false),
                ancestor_groups: ancestor_groups.clone(),
                plateau_a: connector.plateau_a,
            });
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::charger::{Charger, Connector};
    use crate::domain::group::Group;
    use crate::domain::schedule::Schedule;
    use crate::domain::session::Session;
    use std::collections::HashMap as Map;
    use std::sync::Arc;
    use std::str::FromStr;

    fn snapshot_with(groups: Vec<Group>, chargers: Vec<Charger>, sessions: Vec<Session>) -> Snapshot {
        Snapshot {
            taken_at: Utc::now(),
            groups: Arc::new(groups.into_iter().map(|g| (g.id.clone(), g)).collect::<Map<_, _>>()),
            chargers: Arc::new(chargers.into_iter().map(|c| (c.charger_id.clone(), c)).collect::<Map<_, _>>()),
            tags: Arc::new(Map::new()),
            sessions: Arc::new(sessions.into_iter().map(|s| (s.id, s)).collect::<Map<_, _>>()),
        }
    }

    #[test]
    fn single_charger_unlimited_group_grants_minimum_on_first_pass() {
        let now = Utc::now();
        let schedule = Schedule::from_str("00:00-24:00>0=24").unwrap();
        let group = Group { id: "RR2".into(), parent_id: None, description: "".into(), max_allocation: Some(schedule), default_priority: None };
        let mut connector = Connector::new(1, now);
        connector.status = ConnectorStatus::Charging;
        let session = Session::new("RR2-01".into(), 1, "TAG1".into(), 1, now);
        connector.live_session_id = Some(session.id);
        let charger = Charger {
            charger_id: "RR2-01".into(),
            alias: "RR2-01".into(),
            group_id: "RR2".into(),
            connectors: vec![connector],
            conn_max: 32,
            default_priority: 1,
            auth_key_sha256: None,
            firmware_version: None,
            last_seen: None,
        };
        let snap = snapshot_with(vec![group], vec![charger], vec![session]);
        let config = AllocatorConfig::default();
        let changes = run_cycle(&snap, now, &config, true);
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].new_offer, 6);
    }

    #[test]
    fn priority_gating_blocks_low_priority_connector() {
        let now = Utc::now();
        let schedule = Schedule::from_str("00:00-24:00>0=0:5=48").unwrap();
        let group = Group { id: "RR1".into(), parent_id: None, description: "".into(), max_allocation: Some(schedule), default_priority: None };
        let mut low = Connector::new(1, now);
        low.status = ConnectorStatus::Charging;
        let low_session = Session::new("CP-LOW".into(), 1, "TAG1".into(), 1, now);
        low.live_session_id = Some(low_session.id);
        let mut high = Connector::new(1, now);
        high.status = ConnectorStatus::Charging;
        let high_session = Session::new("CP-HIGH".into(), 1, "TAG2".into(), 5, now);
        high.live_session_id = Some(high_session.id);

        let low_charger = Charger {
            charger_id: "CP-LOW".into(),
            alias: "CP-LOW".into(),
            group_id: "RR1".into(),
            connectors: vec![low],
            conn_max: 32,
            default_priority: 1,
            auth_key_sha256: None,
            firmware_version: None,
            last_seen: None,
        };
        let high_charger = Charger {
            charger_id: "CP-HIGH".into(),
            alias: "CP-HIGH".into(),
            group_id: "RR1".into(),
            connectors: vec![high],
            conn_max: 32,
            default_priority: 1,
            auth_key_sha256: None,
            firmware_version: None,
            last_seen: None,
        };
        let snap = snapshot_with(vec![group], vec![low_charger, high_charger], vec![low_session, high_session]);
        let config = AllocatorConfig::default();
        let changes = run_cycle(&snap, now, &config, true);

        let low_change = changes.iter().find(|c| c.charger_id == "CP-LOW");
        let high_change = changes.iter().find(|c| c.charger_id == "CP-HIGH").unwrap();
        assert!(low_change.is_none(), "priority 0 cap means no offer installed at all");
        assert_eq!(high_change.new_offer, 6);
    }

    #[test]
    fn reduction_scenario_drops_offer_toward_observed_usage() {
        let now = Utc::now();
        let schedule = Schedule::from_str("00:00-24:00>0=32").unwrap();
        let group = Group { id: "RR3".into(), parent_id: None, description: "".into(), max_allocation: Some(schedule), default_priority: None };
        let mut connector = Connector::new(1, now - ChronoDuration::seconds(1000));
        connector.status = ConnectorStatus::Charging;
        connector.offer_a = 16;
        connector.last_offer_change = now - ChronoDuration::seconds(1000);
        let mut session = Session::new("RR3-01".into(), 1, "TAG1".into(), 1, now - ChronoDuration::seconds(1000));
        session.push_meter_sample(
            crate::domain::session::MeterSample { timestamp: now, energy_cumulative_kwh: 1.0, current_a: vec![5.0, 5.0, 5.0] },
            64,
        );
        connector.live_session_id = Some(session.id);
        let charger = Charger {
            charger_id: "RR3-01".into(),
            alias: "RR3-01".into(),
            group_id: "RR3".into(),
            connectors: vec![connector],
            conn_max: 32,
            default_priority: 1,
            auth_key_sha256: None,
            firmware_version: None,
            last_seen: None,
        };
        let snap = snapshot_with(vec![group], vec![charger], vec![session]);
        let config = AllocatorConfig::default();
        let changes = run_cycle(&snap, now, &config, false);
        assert_eq!(changes.len(), 1);
        // usage 5.0 + margin_lower_a 0.8 = 5.8, floor+1 = 6, offer drops from 16 to 6.
        assert_eq!(changes[0].new_offer, 6);
        assert_eq!(changes[0].previous_offer, 16);
    }

    #[test]
    fn idle_minimum_offer_is_reclaimed_as_unused_suspended() {
        let now = Utc::now();
        let schedule = Schedule::from_str("00:00-24:00>0=32").unwrap();
        let group = Group { id: "RR4".into(), parent_id: None, description: "".into(), max_allocation: Some(schedule), default_priority: None };
        let long_ago = now - ChronoDuration::seconds(600);
        let mut connector = Connector::new(1, long_ago);
        connector.status = ConnectorStatus::Charging;
        connector.offer_a = 6;
        connector.last_offer_change = long_ago;
        let mut session = Session::new("RR4-01".into(), 1, "TAG1".into(), 1, long_ago);
        session.push_meter_sample(
            crate::domain::session::MeterSample { timestamp: now, energy_cumulative_kwh: 0.1, current_a: vec![0.5, 0.5, 0.5] },
            64,
        );
        connector.live_session_id = Some(session.id);
        let charger = Charger {
            charger_id: "RR4-01".into(),
            alias: "RR4-01".into(),
            group_id: "RR4".into(),
            connectors: vec![connector],
            conn_max: 32,
            default_priority: 1,
            auth_key_sha256: None,
            firmware_version: None,
            last_seen: None,
        };
        let snap = snapshot_with(vec![group], vec![charger], vec![session]);
        let config = AllocatorConfig::default();
        let changes = run_cycle(&snap, now, &config, false);
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].new_offer, 0);

        let suspensions = collect_suspensions(&snap, now, &config);
        assert_eq!(suspensions.len(), 1);
        assert_eq!(suspensions[0].0, "RR4-01");
        assert!(suspensions[0].2 > now);
    }

    #[test]
    fn group_budget_conflict_leaves_one_of_four_connectors_without_an_offer() {
        let now = Utc::now();
        // Room for exactly three minimum (6A) allocations, not four.
        let schedule = Schedule::from_str("00:00-24:00>0=18").unwrap();
        let group = Group { id: "RR5".into(), parent_id: None, description: "".into(), max_allocation: Some(schedule), default_priority: None };

        let mut chargers = Vec::new();
        let mut sessions = Vec::new();
        for i in 1..=4 {
            let mut connector = Connector::new(1, now);
            connector.status = ConnectorStatus::Charging;
            let session = Session::new(format!("RR5-0{i}"), 1, format!("TAG{i}"), 1, now);
            connector.live_session_id = Some(session.id);
            chargers.push(Charger {
                charger_id: format!("RR5-0{i}"),
                alias: format!("RR5-0{i}"),
                group_id: "RR5".into(),
                connectors: vec![connector],
                conn_max: 32,
                default_priority: 1,
                auth_key_sha256: None,
                firmware_version: None,
                last_seen: None,
            });
            sessions.push(session);
        }
        let snap = snapshot_with(vec![group], chargers, sessions);
        let config = AllocatorConfig::default();
        let changes = run_cycle(&snap, now, &config, true);

        let granted: Vec<_> = changes.iter().filter(|c| c.new_offer > 0).collect();
        assert_eq!(granted.len(), 3, "18A budget at 6A minimum fits exactly three of four equal-priority connectors");
        // Tie-break is charger_id ascending when priority and last_offer_change tie.
        let granted_ids: Vec<_> = granted.iter().map(|c| c.charger_id.as_str()).collect();
        assert!(granted_ids.contains(&"RR5-01"));
        assert!(granted_ids.contains(&"RR5-02"));
        assert!(granted_ids.contains(&"RR5-03"));
        assert!(!granted_ids.contains(&"RR5-04"));
    }

    #[test]
    fn disconnected_connector_is_excluded_and_frees_its_group_budget() {
        let now = Utc::now();
        let schedule = Schedule::from_str("00:00-24:00>0=6").unwrap();
        let group = Group { id: "RR6".into(), parent_id: None, description: "".into(), max_allocation: Some(schedule), default_priority: None };

        let mut stale = Connector::new(1, now);
        stale.status = ConnectorStatus::Faulted;
        stale.offer_a = 6;
        let stale_session = Session::new("RR6-01".into(), 1, "TAG1".into(), 1, now);
        stale.live_session_id = Some(stale_session.id);
        let stale_charger = Charger {
            charger_id: "RR6-01".into(),
            alias: "RR6-01".into(),
            group_id: "RR6".into(),
            connectors: vec![stale],
            conn_max: 32,
            default_priority: 1,
            auth_key_sha256: None,
            firmware_version: None,
            last_seen: None,
        };

        let mut fresh = Connector::new(1, now);
        fresh.status = ConnectorStatus::Preparing;
        let fresh_session = Session::new("RR6-02".into(), 1, "TAG2".into(), 1, now);
        fresh.live_session_id = Some(fresh_session.id);
        let fresh_charger = Charger {
            charger_id: "RR6-02".into(),
            alias: "RR6-02".into(),
            group_id: "RR6".into(),
            connectors: vec![fresh],
            conn_max: 32,
            default_priority: 1,
            auth_key_sha256: None,
            firmware_version: None,
            last_seen: None,
        };

        let snap = snapshot_with(vec![group], vec![stale_charger, fresh_charger], vec![stale_session, fresh_session]);
        let config = AllocatorConfig::default();
        let changes = run_cycle(&snap, now, &config, true);

        // The faulted connector is never touched (no longer a candidate at all)...
        assert!(changes.iter().all(|c| c.charger_id != "RR6-01"));
        // ...which leaves its stale 6A offer out of the running total, so the
        // reconnecting/newly-preparing connector still gets the full budget.
        let fresh_change = changes.iter().find(|c| c.charger_id == "RR6-02").unwrap();
        assert_eq!(fresh_change.new_offer, 6);
    }

    #[test]
    fn revealed_usage_well_below_offer_sets_a_sticky_plateau() {
        let now = Utc::now();
        let schedule = Schedule::from_str("00:00-24:00>0=32").unwrap();
        let group = Group { id: "RR7".into(), parent_id: None, description: "".into(), max_allocation: Some(schedule), default_priority: None };
        let mut connector = Connector::new(1, now - ChronoDuration::seconds(1000));
        connector.status = ConnectorStatus::Charging;
        connector.offer_a = 16;
        connector.last_offer_change = now - ChronoDuration::seconds(1000);
        let mut session = Session::new("RR7-01".into(), 1, "TAG1".into(), 1, now - ChronoDuration::seconds(1000));
        session.push_meter_sample(
            crate::domain::session::MeterSample { timestamp: now, energy_cumulative_kwh: 1.0, current_a: vec![10.0, 10.0, 10.0] },
            64,
        );
        connector.live_session_id = Some(session.id);
        let charger = Charger {
            charger_id: "RR7-01".into(),
            alias: "RR7-01".into(),
            group_id: "RR7".into(),
            connectors: vec![connector],
            conn_max: 32,
            default_priority: 1,
            auth_key_sha256: None,
            firmware_version: None,
            last_seen: None,
        };
        let snap = snapshot_with(vec![group], vec![charger], vec![session]);
        let config = AllocatorConfig::default();
        let updates = collect_plateau_updates(&snap, now, &config);
        assert_eq!(updates.len(), 1);
        assert_eq!(updates[0], ("RR7-01".to_string(), 1, 11));
    }

    #[test]
    fn plateau_already_set_is_not_recomputed() {
        let now = Utc::now();
        let schedule = Schedule::from_str("00:00-24:00>0=32").unwrap();
        let group = Group { id: "RR8".into(), parent_id: None, description: "".into(), max_allocation: Some(schedule), default_priority: None };
        let mut connector = Connector::new(1, now - ChronoDuration::seconds(1000));
        connector.status = ConnectorStatus::Charging;
        connector.offer_a = 16;
        connector.plateau_a = Some(11);
        connector.last_offer_change = now - ChronoDuration::seconds(1000);
        let mut session = Session::new("RR8-01".into(), 1, "TAG1".into(), 1, now - ChronoDuration::seconds(1000));
        session.push_meter_sample(
            crate::domain::session::MeterSample { timestamp: now, energy_cumulative_kwh: 1.0, current_a: vec![10.0, 10.0, 10.0] },
            64,
        );
        connector.live_session_id = Some(session.id);
        let charger = Charger {
            charger_id: "RR8-01".into(),
            alias: "RR8-01".into(),
            group_id: "RR8".into(),
            connectors: vec![connector],
            conn_max: 32,
            default_priority: 1,
            auth_key_sha256: None,
            firmware_version: None,
            last_seen: None,
        };
        let snap = snapshot_with(vec![group], vec![charger], vec![session]);
        let config = AllocatorConfig::default();
        let updates = collect_plateau_updates(&snap, now, &config);
        assert!(updates.is_empty());
    }

    #[test]
    fn idempotent_second_pass_commits_nothing() {
        let now = Utc::now();
        let schedule = Schedule::from_str("00:00-24:00>0=24").unwrap();
        let group = Group { id: "RR2".into(), parent_id: None, description: "".into(), max_allocation: Some(schedule), default_priority: None };
        let mut connector = Connector::new(1, now);
        connector.status = ConnectorStatus::Charging;
        connector.offer_a = 6;
        let session = Session::new("RR2-01".into(), 1, "TAG1".into(), 1, now);
        connector.live_session_id = Some(session.id);
        let charger = Charger {
            charger_id: "RR2-01".into(),
            alias: "RR2-01".into(),
            group_id: "RR2".into(),
            connectors: vec![connector],
            conn_max: 32,
            default_priority: 1,
            auth_key_sha256: None,
            firmware_version: None,
            last_seen: None,
        };
        let snap = snapshot_with(vec![group], vec![charger], vec![session]);
        let config = AllocatorConfig::default();
        let changes = run_cycle(&snap, now, &config, false);
        assert!(changes.is_empty());
    }
}
