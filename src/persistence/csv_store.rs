//! Loads/saves the CSV-backed model entities (spec §3, §6) and feeds the
//! registry's atomic `replace_*` swaps for dynamic reload (`ReloadGroups`,
//! `ReloadChargers`, `ReloadTags`).

use std::collections::HashMap;
use std::path::Path;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::domain::charger::{Charger, Connector};
use crate::domain::group::Group;
use crate::domain::schedule::Schedule;
use crate::domain::tag::{Tag, TagStatus};
use crate::persistence::PersistenceError;

#[derive(Debug, Serialize, Deserialize)]
struct GroupRow {
    id: String,
    parent_id: String,
    description: String,
    /// Schedule text form, or empty for a structural (non-allocation) group.
    max_allocation: String,
    /// Empty if the group inherits its default priority from its parent.
    #[serde(default)]
    default_priority: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct ChargerRow {
    charger_id: String,
    alias: String,
    group_id: String,
    conn_max: u32,
    default_priority: i32,
    connector_count: u32,
    auth_key_sha256: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct TagRow {
    id_tag: String,
    status: String,
    parent_id_tag: String,
    priority_override: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct FirmwareRow {
    charger_id: String,
    firmware_version: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct UserRow {
    pub user_id: String,
    pub role: String,
    pub token_sha256: String,
}

fn opt(s: &str) -> Option<String> {
    if s.is_empty() {
        None
    } else {
        Some(s.to_string())
    }
}

pub fn load_groups(path: &Path) -> Result<HashMap<String, Group>, PersistenceError> {
    let path_s = path.display().to_string();
    let mut reader = csv::Reader::from_path(path).map_err(|e| PersistenceError::Csv { path: path_s.clone(), source: e })?;
    let mut groups = HashMap::new();
    for result in reader.deserialize::<GroupRow>() {
        let row = result.map_err(|e| PersistenceError::Csv { path: path_s.clone(), source: e })?;
        let max_allocation = if row.max_allocation.is_empty() {
            None
        } else {
            Some(Schedule::from_str(&row.max_allocation).map_err(|e| PersistenceError::Schedule { path: path_s.clone(), source: e })?)
        };
        let default_priority = if row.default_priority.is_empty() {
            None
        } else {
            Some(
                row.default_priority
                    .parse()
                    .map_err(|_| PersistenceError::Csv { path: path_s.clone(), source: csv::Error::from(std::io::Error::new(std::io::ErrorKind::InvalidData, "malformed default_priority")) })?,
            )
        };
        groups.insert(
            row.id.clone(),
            Group { id: row.id, parent_id: opt(&row.parent_id), description: row.description, max_allocation, default_priority },
        );
    }
    Ok(groups)
}

pub fn save_groups(path: &Path, groups: &HashMap<String, Group>) -> Result<(), PersistenceError> {
    let path_s = path.display().to_string();
    let mut writer = csv::Writer::from_path(path).map_err(|e| PersistenceError::Csv { path: path_s.clone(), source: e })?;
    let mut rows: Vec<_> = groups.values().collect();
    rows.sort_by(|a, b| a.id.cmp(&b.id));
    for g in rows {
        writer
            .serialize(GroupRow {
                id: g.id.clone(),
                parent_id: g.parent_id.clone().unwrap_or_default(),
                description: g.description.clone(),
                max_allocation: g.max_allocation.as_ref().map(|s| s.to_string()).unwrap_or_default(),
                default_priority: g.default_priority.map(|p| p.to_string()).unwrap_or_default(),
            })
            .map_err(|e| PersistenceError::Csv { path: path_s.clone(), source: e })?;
    }
    writer.flush().map_err(|e| PersistenceError::Write { path: path_s.clone(), source: e })?;
    Ok(())
}

pub fn load_chargers(path: &Path, now: chrono::DateTime<chrono::Utc>) -> Result<HashMap<String, Charger>, PersistenceError> {
    let path_s = path.display().to_string();
    let mut reader = csv::Reader::from_path(path).map_err(|e| PersistenceError::Csv { path: path_s.clone(), source: e })?;
    let mut chargers = HashMap::new();
    for result in reader.deserialize::<ChargerRow>() {
        let row = result.map_err(|e| PersistenceError::Csv { path: path_s.clone(), source: e })?;
        let connectors = (1..=row.connector_count.max(1)).map(|i| Connector::new(i, now)).collect();
        chargers.insert(
            row.charger_id.clone(),
            Charger {
                charger_id: row.charger_id,
                alias: row.alias,
                group_id: row.group_id,
                connectors,
                conn_max: row.conn_max,
                default_priority: row.default_priority,
                auth_key_sha256: opt(&row.auth_key_sha256),
                firmware_version: None,
                last_seen: None,
            },
        );
    }
    Ok(chargers)
}

pub fn save_chargers(path: &Path, chargers: &HashMap<String, Charger>) -> Result<(), PersistenceError> {
    let path_s = path.display().to_string();
    let mut writer = csv::Writer::from_path(path).map_err(|e| PersistenceError::Csv { path: path_s.clone(), source: e })?;
    let mut rows: Vec<_> = chargers.values().collect();
    rows.sort_by(|a, b| a.charger_id.cmp(&b.charger_id));
    for c in rows {
        writer
            .serialize(ChargerRow {
                charger_id: c.charger_id.clone(),
                alias: c.alias.clone(),
                group_id: c.group_id.clone(),
                conn_max: c.conn_max,
                default_priority: c.default_priority,
                connector_count: c.connectors.len() as u32,
                auth_key_sha256: c.auth_key_sha256.clone().unwrap_or_default(),
            })
            .map_err(|e| PersistenceError::Csv { path: path_s.clone(), source: e })?;
    }
    writer.flush().map_err(|e| PersistenceError::Write { path: path_s.clone(), source: e })?;
    Ok(())
}

pub fn load_tags(path: &Path) -> Result<HashMap<String, Tag>, PersistenceError> {
    let path_s = path.display().to_string();
    let mut reader = csv::Reader::from_path(path).map_err(|e| PersistenceError::Csv { path: path_s.clone(), source: e })?;
    let mut tags = HashMap::new();
    for result in reader.deserialize::<TagRow>() {
        let row = result.map_err(|e| PersistenceError::Csv { path: path_s.clone(), source: e })?;
        let status = if row.status.eq_ignore_ascii_case("blocked") { TagStatus::Blocked } else { TagStatus::Activated };
        tags.insert(
            row.id_tag.clone(),
            Tag {
                id_tag: row.id_tag,
                status,
                parent_id_tag: opt(&row.parent_id_tag),
                priority_override: row.priority_override.parse().ok(),
            },
        );
    }
    Ok(tags)
}

pub fn save_tags(path: &Path, tags: &HashMap<String, Tag>) -> Result<(), PersistenceError> {
    let path_s = path.display().to_string();
    let mut writer = csv::Writer::from_path(path).map_err(|e| PersistenceError::Csv { path: path_s.clone(), source: e })?;
    let mut rows: Vec<_> = tags.values().collect();
    rows.sort_by(|a, b| a.id_tag.cmp(&b.id_tag));
    for t in rows {
        writer
            .serialize(TagRow {
                id_tag: t.id_tag.clone(),
                status: t.status.to_string(),
                parent_id_tag: t.parent_id_tag.clone().unwrap_or_default(),
                priority_override: t.priority_override.map(|p| p.to_string()).unwrap_or_default(),
            })
            .map_err(|e| PersistenceError::Csv { path: path_s.clone(), source: e })?;
    }
    writer.flush().map_err(|e| PersistenceError::Write { path: path_s.clone(), source: e })?;
    Ok(())
}

pub fn save_firmware(path: &Path, chargers: &HashMap<String, Charger>) -> Result<(), PersistenceError> {
    let path_s = path.display().to_string();
    let mut writer = csv::Writer::from_path(path).map_err(|e| PersistenceError::Csv { path: path_s.clone(), source: e })?;
    let mut rows: Vec<_> = chargers.values().collect();
    rows.sort_by(|a, b| a.charger_id.cmp(&b.charger_id));
    for c in rows {
        writer
            .serialize(FirmwareRow { charger_id: c.charger_id.clone(), firmware_version: c.firmware_version.clone().unwrap_or_default() })
            .map_err(|e| PersistenceError::Csv { path: path_s.clone(), source: e })?;
    }
    writer.flush().map_err(|e| PersistenceError::Write { path: path_s.clone(), source: e })?;
    Ok(())
}

pub fn load_users(path: &Path) -> Result<Vec<UserRow>, PersistenceError> {
    let path_s = path.display().to_string();
    let mut reader = csv::Reader::from_path(path).map_err(|e| PersistenceError::Csv { path: path_s.clone(), source: e })?;
    let mut users = Vec::new();
    for result in reader.deserialize::<UserRow>() {
        users.push(result.map_err(|e| PersistenceError::Csv { path: path_s.clone(), source: e })?);
    }
    Ok(users)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn round_trips_groups_csv() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("groups.csv");
        let mut groups = HashMap::new();
        groups.insert(
            "root".to_string(),
            Group { id: "root".into(), parent_id: None, description: "top".into(), max_allocation: None, default_priority: Some(3) },
        );
        groups.insert(
            "RR1".to_string(),
            Group {
                id: "RR1".into(),
                parent_id: Some("root".into()),
                description: "ring".into(),
                max_allocation: Some(Schedule::from_str("00:00-24:00>0=24").unwrap()),
                default_priority: None,
            },
        );
        save_groups(&path, &groups).unwrap();
        let loaded = load_groups(&path).unwrap();
        assert_eq!(loaded.len(), 2);
        assert!(loaded["RR1"].is_allocation_group());
        assert!(!loaded["root"].is_allocation_group());
        assert_eq!(loaded["root"].default_priority, Some(3));
        assert_eq!(loaded["RR1"].default_priority, None);
    }

    #[test]
    fn loads_users_csv() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("users.csv");
        let mut f = std::fs::File::create(&path).unwrap();
        writeln!(f, "user_id,role,token_sha256").unwrap();
        writeln!(f, "alice,Admin,deadbeef").unwrap();
        let users = load_users(&path).unwrap();
        assert_eq!(users.len(), 1);
        assert_eq!(users[0].user_id, "alice");
    }
}
