//! Group tree: structural groups plus allocation groups (those carrying a
//! `max_allocation` schedule). Expressed as flat records with parent-id
//! lookups rather than mutual references, per the recommended design —
//! depth-first traversals over the tree use an explicit stack.

use serde::{Deserialize, Serialize};

use crate::domain::schedule::Schedule;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Group {
    pub id: String,
    pub parent_id: Option<String>,
    pub description: String,
    /// Present only for allocation groups.
    #[serde(skip)]
    pub max_allocation: Option<Schedule>,
    /// Session priority applied to chargers in this group when the charger
    /// itself carries no more specific override. Inherited from the nearest
    /// ancestor group that sets one.
    #[serde(default)]
    pub default_priority: Option<i32>,
}

impl Group {
    pub fn is_allocation_group(&self) -> bool {
        self.max_allocation.is_some()
    }
}

/// Detects a parent cycle reachable from `start` using the supplied lookup.
/// Returns the cyclic chain of group ids if one exists.
pub fn detect_cycle<'a, F>(start: &'a str, parent_of: F) -> Option<Vec<String>>
where
    F: Fn(&str) -> Option<&'a str>,
{
    let mut visited = Vec::new();
    let mut current = start;
    loop {
        if visited.iter().any(|v: &String| v == current) {
            visited.push(current.to_string());
            return Some(visited);
        }
        visited.push(current.to_string());
        match parent_of(current) {
            Some(parent) => current = parent,
            None => return None,
        }
    }
}
