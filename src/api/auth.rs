//! Admin API authentication (spec §6): SHA-256 token login and the
//! strictly-ordered role hierarchy gating every privileged command.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::persistence::csv_store::UserRow;

/// Strictly ordered by capability: a handler that requires `Tags` accepts
/// any caller whose role is `Tags` or higher.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Role {
    Status,
    Analysis,
    SessionPriority,
    Tags,
    Admin,
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

impl std::str::FromStr for Role {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Status" => Ok(Role::Status),
            "Analysis" => Ok(Role::Analysis),
            "SessionPriority" => Ok(Role::SessionPriority),
            "Tags" => Ok(Role::Tags),
            "Admin" => Ok(Role::Admin),
            _ => Err(()),
        }
    }
}

/// Digests `user_id || password` the way the charger-side auth key hashing
/// does it for tags — same primitive, different input shape.
pub fn hash_token(token: &str) -> String {
    let digest = Sha256::digest(token.as_bytes());
    digest.iter().map(|b| format!("{b:02x}")).collect()
}

/// A successful login's caller identity, held for the lifetime of the
/// admin WebSocket connection. Every call before a successful `Login`
/// is rejected by the command dispatcher.
#[derive(Debug, Clone)]
pub struct Caller {
    pub user_id: String,
    pub role: Role,
}

pub fn authenticate<'a>(users: &'a [UserRow], user_id: &str, password: &str) -> Option<Caller> {
    let token = format!("{user_id}{password}");
    let digest = hash_token(&token);
    users
        .iter()
        .find(|u| u.user_id == user_id && u.token_sha256.eq_ignore_ascii_case(&digest))
        .and_then(|u| u.role.parse::<Role>().ok().map(|role| Caller { user_id: user_id.to_string(), role }))
}

pub fn require_role(caller: &Caller, minimum: Role) -> Result<(), crate::error::AuthError> {
    if caller.role >= minimum {
        Ok(())
    } else {
        Err(crate::error::AuthError::InsufficientRole { required: minimum, actual: caller.role })
    }
}
