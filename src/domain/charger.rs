//! Charger and Connector records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

/// Per-connector lifecycle state (spec §4.3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString)]
pub enum ConnectorStatus {
    Unknown,
    Available,
    Preparing,
    Charging,
    SuspendedEV,
    SuspendedEVSE,
    Finishing,
    Reserved,
    Unavailable,
    Faulted,
}

impl ConnectorStatus {
    /// Connectors in one of these states may be given a non-zero offer.
    pub fn is_allocation_eligible(self) -> bool {
        matches!(self, Self::Preparing | Self::Charging | Self::SuspendedEV)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Connector {
    pub index: u32,
    pub status: ConnectorStatus,
    /// Installed offer, amperes, 3-phase symmetric.
    pub offer_a: u32,
    pub last_offer_change: DateTime<Utc>,
    pub live_session_id: Option<uuid::Uuid>,
    /// Smallest integer ≥ observed peak current once revealed; sticky for
    /// the remainder of the session.
    pub plateau_a: Option<u32>,
    /// Set once a connector at `min_allocation` has been idle long enough
    /// to be withdrawn from allocation; cleared at the next re-eval time.
    pub unused_suspended_until: Option<DateTime<Utc>>,
}

impl Connector {
    pub fn new(index: u32, now: DateTime<Utc>) -> Self {
        Self {
            index,
            status: ConnectorStatus::Unknown,
            offer_a: 0,
            last_offer_change: now,
            live_session_id: None,
            plateau_a: None,
            unused_suspended_until: None,
        }
    }

    pub fn is_unused_suspended(&self, now: DateTime<Utc>) -> bool {
        self.unused_suspended_until.map(|until| now < until).unwrap_or(false)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Charger {
    pub charger_id: String,
    pub alias: String,
    pub group_id: String,
    pub connectors: Vec<Connector>,
    /// Cap per connector, amperes.
    pub conn_max: u32,
    pub default_priority: i32,
    /// SHA-256 of the expected `AuthorizationKey`, hex-encoded.
    pub auth_key_sha256: Option<String>,
    pub firmware_version: Option<String>,
    pub last_seen: Option<DateTime<Utc>>,
}

impl Charger {
    pub fn connector_mut(&mut self, index: u32) -> Option<&mut Connector> {
        self.connectors.iter_mut().find(|c| c.index == index)
    }

    pub fn connector(&self, index: u32) -> Option<&Connector> {
        self.connectors.iter().find(|c| c.index == index)
    }
}
