//! The model registry: single-writer owner of Groups, Chargers, Connectors,
//! Tags and Sessions. All mutation is funneled through one `tokio::sync::Mutex`
//! so the registry is the crate's single serialization point (spec §5);
//! readers — principally the allocator — pull a cheap copy-on-read
//! [`Snapshot`] instead of holding the lock.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::domain::group::{detect_cycle, Group};
use crate::domain::{Charger, Connector, Session, Tag};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ModelError {
    #[error("duplicate group id: {0}")]
    DuplicateGroup(String),
    #[error("duplicate charger id: {0}")]
    DuplicateCharger(String),
    #[error("duplicate tag: {0}")]
    DuplicateTag(String),
    #[error("unknown charger: {0}")]
    UnknownCharger(String),
    #[error("unknown group: {0}")]
    UnknownGroup(String),
    #[error("unknown tag: {0}")]
    UnknownTag(String),
    #[error("unknown connector {1} on charger {0}")]
    UnknownConnector(String, u32),
    #[error("unknown session: {0}")]
    UnknownSession(Uuid),
    #[error("group {0} still contains chargers")]
    GroupNotEmpty(String),
    #[error("charger {0} has a live session")]
    ChargerHasLiveSession(String),
    #[error("parent {0} would create a group cycle")]
    CyclicGroup(String),
    #[error("connector {0}/{1} already has a live session")]
    ConnectorOccupied(String, u32),
    #[error("id-tag {0} unknown and unknown tags are not permitted")]
    UnknownTagRejected(String),
}

struct RegistryState {
    groups: HashMap<String, Group>,
    chargers: HashMap<String, Charger>,
    tags: HashMap<String, Tag>,
    sessions: HashMap<Uuid, Session>,
}

/// Copy-on-read view consumed by the allocator each tick. Cheap enough to
/// build every cycle; never mutated in place.
#[derive(Clone)]
pub struct Snapshot {
    pub taken_at: DateTime<Utc>,
    pub groups: Arc<HashMap<String, Group>>,
    pub chargers: Arc<HashMap<String, Charger>>,
    pub tags: Arc<HashMap<String, Tag>>,
    pub sessions: Arc<HashMap<Uuid, Session>>,
}

impl Snapshot {
    pub fn session_for_connector(&self, charger_id: &str, connector_index: u32) -> Option<&Session> {
        self.chargers
            .get(charger_id)
            .and_then(|c| c.connector(connector_index))
            .and_then(|c| c.live_session_id)
            .and_then(|id| self.sessions.get(&id))
    }

    /// The nearest allocation-group ancestor governing `group_id`, if any.
    pub fn nearest_allocation_group<'a>(&'a self, group_id: &str) -> Option<&'a Group> {
        let mut current = self.groups.get(group_id)?;
        loop {
            if current.is_allocation_group() {
                return Some(current);
            }
            current = self.groups.get(current.parent_id.as_deref()?)?;
        }
    }

    /// The nearest ancestor of `group_id` (inclusive) that carries an
    /// explicit `default_priority`, if any.
    pub fn nearest_group_default_priority(&self, group_id: &str) -> Option<i32> {
        let mut current = self.groups.get(group_id)?;
        loop {
            if let Some(p) = current.default_priority {
                return Some(p);
            }
            current = self.groups.get(current.parent_id.as_deref()?)?;
        }
    }
}

pub struct Registry {
    state: Mutex<RegistryState>,
    pub autoregister_group: Option<String>,
    pub allow_unknown_tags: bool,
}

impl Registry {
    pub fn new(autoregister_group: Option<String>, allow_unknown_tags: bool) -> Self {
        Self {
            state: Mutex::new(RegistryState {
                groups: HashMap::new(),
                chargers: HashMap::new(),
                tags: HashMap::new(),
                sessions: HashMap::new(),
            }),
            autoregister_group,
            allow_unknown_tags,
        }
    }

    pub async fn add_group(&self, group: Group) -> Result<(), ModelError> {
        let mut st = self.state.lock().await;
        if st.groups.contains_key(&group.id) {
            return Err(ModelError::DuplicateGroup(group.id));
        }
        if let Some(parent) = &group.parent_id {
            if !st.groups.contains_key(parent) {
                return Err(ModelError::UnknownGroup(parent.clone()));
            }
        }
        let parents: HashMap<String, String> = st
            .groups
            .values()
            .filter_map(|g| g.parent_id.clone().map(|p| (g.id.clone(), p)))
            .collect();
        if let Some(parent) = &group.parent_id {
            let mut probe = parents.clone();
            probe.insert(group.id.clone(), parent.clone());
            if detect_cycle(&group.id, |id| probe.get(id).map(String::as_str)).is_some() {
                return Err(ModelError::CyclicGroup(group.id));
            }
        }
        st.groups.insert(group.id.clone(), group);
        Ok(())
    }

    pub async fn delete_group(&self, id: &str) -> Result<(), ModelError> {
        let mut st = self.state.lock().await;
        if !st.groups.contains_key(id) {
            return Err(ModelError::UnknownGroup(id.to_string()));
        }
        if st.chargers.values().any(|c| c.group_id == id) {
            return Err(ModelError::GroupNotEmpty(id.to_string()));
        }
        st.groups.remove(id);
        Ok(())
    }

    pub async fn add_charger(&self, charger: Charger) -> Result<(), ModelError> {
        let mut st = self.state.lock().await;
        if st.chargers.contains_key(&charger.charger_id) {
            return Err(ModelError::DuplicateCharger(charger.charger_id));
        }
        if !st.groups.contains_key(&charger.group_id) {
            return Err(ModelError::UnknownGroup(charger.group_id));
        }
        st.chargers.insert(charger.charger_id.clone(), charger);
        Ok(())
    }

    pub async fn delete_charger(&self, id: &str) -> Result<(), ModelError> {
        let mut st = self.state.lock().await;
        let charger = st.chargers.get(id).ok_or_else(|| ModelError::UnknownCharger(id.to_string()))?;
        if charger.connectors.iter().any(|c| c.live_session_id.is_some()) {
            return Err(ModelError::ChargerHasLiveSession(id.to_string()));
        }
        st.chargers.remove(id);
        Ok(())
    }

    pub async fn find_charger(&self, by_id: Option<&str>, by_alias: Option<&str>) -> Option<Charger> {
        let st = self.state.lock().await;
        if let Some(id) = by_id {
            if let Some(c) = st.chargers.get(id) {
                return Some(c.clone());
            }
        }
        by_alias.and_then(|alias| st.chargers.values().find(|c| c.alias == alias).cloned())
    }

    /// Creates a charger with defaults in the configured autoregister group,
    /// if the registry was constructed with one. No-op (returns `Ok(None)`)
    /// otherwise.
    pub async fn autoregister(
        &self,
        charger_id: &str,
        conn_max: u32,
        default_priority: i32,
        now: DateTime<Utc>,
    ) -> Result<Option<Charger>, ModelError> {
        let Some(group_id) = self.autoregister_group.clone() else {
            return Ok(None);
        };
        let charger = Charger {
            charger_id: charger_id.to_string(),
            alias: charger_id.to_string(),
            group_id,
            connectors: vec![Connector::new(1, now)],
            conn_max,
            default_priority,
            auth_key_sha256: None,
            firmware_version: None,
            last_seen: Some(now),
        };
        self.add_charger(charger.clone()).await?;
        Ok(Some(charger))
    }

    pub async fn update_charger<F>(&self, id: &str, f: F) -> Result<(), ModelError>
    where
        F: FnOnce(&mut Charger),
    {
        let mut st = self.state.lock().await;
        let charger = st.chargers.get_mut(id).ok_or_else(|| ModelError::UnknownCharger(id.to_string()))?;
        f(charger);
        Ok(())
    }

    pub async fn add_tag(&self, tag: Tag) -> Result<(), ModelError> {
        let mut st = self.state.lock().await;
        if st.tags.contains_key(&tag.id_tag) {
            return Err(ModelError::DuplicateTag(tag.id_tag));
        }
        st.tags.insert(tag.id_tag.clone(), tag);
        Ok(())
    }

    /// Blocks a tag that may have active parent-group members; permitted
    /// with a warning rather than rejected (spec §4.2).
    pub async fn block_tag(&self, id_tag: &str) -> Result<bool, ModelError> {
        let mut st = self.state.lock().await;
        let has_active_members = st
            .tags
            .values()
            .any(|t| t.parent_id_tag.as_deref() == Some(id_tag) && t.status == crate::domain::tag::TagStatus::Activated);
        let tag = st.tags.get_mut(id_tag).ok_or_else(|| ModelError::UnknownTag(id_tag.to_string()))?;
        tag.status = crate::domain::tag::TagStatus::Blocked;
        Ok(has_active_members)
    }

    pub async fn tag(&self, id_tag: &str) -> Option<Tag> {
        self.state.lock().await.tags.get(id_tag).cloned()
    }

    pub async fn open_session(
        &self,
        charger_id: &str,
        connector_index: u32,
        session: Session,
    ) -> Result<(), ModelError> {
        let mut st = self.state.lock().await;
        if !self.allow_unknown_tags && !st.tags.contains_key(&session.id_tag) {
            return Err(ModelError::UnknownTagRejected(session.id_tag.clone()));
        }
        let session_id = session.id;
        let charger = st
            .chargers
            .get_mut(charger_id)
            .ok_or_else(|| ModelError::UnknownCharger(charger_id.to_string()))?;
        let connector = charger
            .connector_mut(connector_index)
            .ok_or_else(|| ModelError::UnknownConnector(charger_id.to_string(), connector_index))?;
        if connector.live_session_id.is_some() {
            return Err(ModelError::ConnectorOccupied(charger_id.to_string(), connector_index));
        }
        connector.live_session_id = Some(session_id);
        st.sessions.insert(session_id, session);
        Ok(())
    }

    pub async fn close_session(
        &self,
        session_id: Uuid,
        now: DateTime<Utc>,
        reason: crate::domain::session::StopReason,
        final_offer: Option<u32>,
    ) -> Result<Session, ModelError> {
        self.close_session_with_tag(session_id, now, reason, final_offer, None).await
    }

    pub async fn close_session_with_tag(
        &self,
        session_id: Uuid,
        now: DateTime<Utc>,
        reason: crate::domain::session::StopReason,
        final_offer: Option<u32>,
        stop_id_tag: Option<String>,
    ) -> Result<Session, ModelError> {
        let mut st = self.state.lock().await;
        let mut session = st
            .sessions
            .remove(&session_id)
            .ok_or(ModelError::UnknownSession(session_id))?;
        session.close_with_tag(now, reason, final_offer, stop_id_tag);
        if let Some(charger) = st.chargers.get_mut(&session.charger_id) {
            if let Some(connector) = charger.connector_mut(session.connector_index) {
                connector.live_session_id = None;
            }
        }
        Ok(session)
    }

    pub async fn mutate_session<F>(&self, session_id: Uuid, f: F) -> Result<(), ModelError>
    where
        F: FnOnce(&mut Session),
    {
        let mut st = self.state.lock().await;
        let session = st.sessions.get_mut(&session_id).ok_or(ModelError::UnknownSession(session_id))?;
        f(session);
        Ok(())
    }

    pub async fn mutate_connector<F>(&self, charger_id: &str, connector_index: u32, f: F) -> Result<(), ModelError>
    where
        F: FnOnce(&mut Connector),
    {
        let mut st = self.state.lock().await;
        let charger = st.chargers.get_mut(charger_id).ok_or_else(|| ModelError::UnknownCharger(charger_id.to_string()))?;
        let connector = charger
            .connector_mut(connector_index)
            .ok_or_else(|| ModelError::UnknownConnector(charger_id.to_string(), connector_index))?;
        f(connector);
        Ok(())
    }

    pub async fn snapshot(&self) -> Snapshot {
        let st = self.state.lock().await;
        Snapshot {
            taken_at: Utc::now(),
            groups: Arc::new(st.groups.clone()),
            chargers: Arc::new(st.chargers.clone()),
            tags: Arc::new(st.tags.clone()),
            sessions: Arc::new(st.sessions.clone()),
        }
    }

    /// Atomically swaps the groups map, preserving chargers/tags/sessions.
    /// Used by `ReloadGroups`.
    pub async fn replace_groups(&self, groups: HashMap<String, Group>) {
        let mut st = self.state.lock().await;
        st.groups = groups;
    }

    /// Atomically swaps the chargers map. Sessions owned by chargers that no
    /// longer exist post-reload are force-closed by the caller with reason
    /// `ConfigReload` before invoking this (spec §9 dynamic CSV reload).
    pub async fn replace_chargers(&self, chargers: HashMap<String, Charger>) {
        let mut st = self.state.lock().await;
        st.chargers = chargers;
    }

    pub async fn replace_tags(&self, tags: HashMap<String, Tag>) {
        let mut st = self.state.lock().await;
        st.tags = tags;
    }
}

/// Checks the invariants of spec §4.2 / §8 against a snapshot. Returns the
/// first violation found, if any.
pub fn check_invariants(snap: &Snapshot) -> Result<(), String> {
    for charger in snap.chargers.values() {
        if !snap.groups.contains_key(&charger.group_id) {
            return Err(format!("charger {} references unknown group {}", charger.charger_id, charger.group_id));
        }
        for connector in &charger.connectors {
            if connector.offer_a > charger.conn_max {
                return Err(format!(
                    "connector {}/{} offer {} exceeds conn_max {}",
                    charger.charger_id, connector.index, connector.offer_a, charger.conn_max
                ));
            }
            if let Some(session_id) = connector.live_session_id {
                if !snap.sessions.contains_key(&session_id) {
                    return Err(format!(
                        "connector {}/{} references missing session {}",
                        charger.charger_id, connector.index, session_id
                    ));
                }
            }
        }
    }
    for session in snap.sessions.values() {
        let charger = snap
            .chargers
            .get(&session.charger_id)
            .ok_or_else(|| format!("session {} references unknown charger {}", session.id, session.charger_id))?;
        let connector = charger
            .connector(session.connector_index)
            .ok_or_else(|| format!("session {} references unknown connector {}", session.id, session.connector_index))?;
        if connector.live_session_id != Some(session.id) {
            return Err(format!("session {} not linked back from its connector", session.id));
        }
    }
    Ok(())
}
