//! RFID / id-tag authorization records.

use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString)]
pub enum TagStatus {
    Activated,
    Blocked,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Tag {
    pub id_tag: String,
    pub status: TagStatus,
    /// Any member of the parent group may stop a session this tag started.
    pub parent_id_tag: Option<String>,
    pub priority_override: Option<i32>,
}

impl Tag {
    pub fn is_usable(&self) -> bool {
        self.status == TagStatus::Activated
    }

    /// True if `other` shares this tag's parent group (stop-by-group-member).
    pub fn shares_parent_with(&self, other: &Tag) -> bool {
        match (&self.parent_id_tag, &other.parent_id_tag) {
            (Some(a), Some(b)) => a == b,
            _ => false,
        }
    }
}
