//! Admin command dispatch (spec §6): registry CRUD, config reload, live
//! priority overrides, OCPP pass-through, and `DrawAll`. Mirrors
//! `statemachine::handle_call`'s action-string dispatch shape but runs
//! against the same `Registry`/`AllocatorLoop` the charger side drives.

use std::fmt::Write as _;
use std::path::Path;
use std::sync::Arc;

use chrono::Utc;
use thiserror::Error;

use crate::api::auth::{authenticate, require_role, Caller, Role};
use crate::domain::group::Group;
use crate::domain::session::StopReason;
use crate::domain::tag::{Tag, TagStatus};
use crate::error::AuthError;
use crate::api::AppState;
use crate::persistence::csv_store;

#[derive(Debug, Error)]
pub enum CommandError {
    #[error(transparent)]
    Auth(#[from] AuthError),
    #[error("unsupported action: {0}")]
    UnsupportedAction(String),
    #[error("malformed payload for {action}: {source}")]
    MalformedPayload { action: String, source: serde_json::Error },
    #[error(transparent)]
    Model(#[from] crate::registry::ModelError),
    #[error(transparent)]
    Schedule(#[from] crate::domain::schedule::ScheduleError),
    #[error(transparent)]
    Persistence(#[from] crate::persistence::PersistenceError),
    #[error(transparent)]
    StateMachine(#[from] crate::statemachine::StateMachineError),
    #[error(transparent)]
    Protocol(#[from] crate::error::ProtocolError),
}

/// Per-connection login state. `None` until a successful `Login`; every
/// other action is refused while unauthenticated.
pub struct Session {
    pub caller: Option<Caller>,
}

impl Session {
    pub fn new() -> Self {
        Self { caller: None }
    }
}

pub async fn dispatch(
    state: &Arc<AppState>,
    session: &mut Session,
    action: &str,
    payload: &serde_json::Value,
) -> Result<serde_json::Value, CommandError> {
    macro_rules! parse {
        ($ty:ty) => {
            serde_json::from_value::<$ty>(payload.clone())
                .map_err(|source| CommandError::MalformedPayload { action: action.to_string(), source })?
        };
    }

    if action == "Login" {
        #[derive(serde::Deserialize)]
        struct LoginRequest {
            user_id: String,
            password: String,
        }
        let req: LoginRequest = parse!(LoginRequest);
        let users = state.users.read().await;
        return Ok(match authenticate(&users, &req.user_id, &req.password) {
            Some(caller) => {
                let role = caller.role;
                session.caller = Some(caller);
                serde_json::json!({"status": "Accepted", "role": role})
            }
            None => serde_json::json!({"status": "Rejected"}),
        });
    }

    let caller = session.caller.clone().ok_or(AuthError::NotAuthenticated)?;

    match action {
        "Status" => {
            require_role(&caller, Role::Status)?;
            status(state).await
        }
        "DrawAll" => {
            require_role(&caller, Role::Analysis)?;
            Ok(serde_json::json!({ "text": draw_all(state).await }))
        }
        "AddTag" => {
            require_role(&caller, Role::Tags)?;
            let req: AddTagRequest = parse!(AddTagRequest);
            state
                .registry
                .add_tag(Tag {
                    id_tag: req.id_tag.clone(),
                    status: TagStatus::Activated,
                    parent_id_tag: req.parent_id_tag,
                    priority_override: req.priority_override,
                })
                .await?;
            audit(state, &caller, "AddTag", &req.id_tag).await;
            Ok(serde_json::json!({"status": "Accepted"}))
        }
        "BlockTag" => {
            require_role(&caller, Role::Tags)?;
            let req: IdTagRequest = parse!(IdTagRequest);
            state.registry.block_tag(&req.id_tag).await?;
            audit(state, &caller, "BlockTag", &req.id_tag).await;
            Ok(serde_json::json!({"status": "Accepted"}))
        }
        "SetSessionPriority" => {
            require_role(&caller, Role::SessionPriority)?;
            let req: SetSessionPriorityRequest = parse!(SetSessionPriorityRequest);
            state.registry.mutate_session(req.session_id, |s| s.priority = req.priority).await?;
            audit(state, &caller, "SetSessionPriority", &format!("{} -> {}", req.session_id, req.priority)).await;
            Ok(serde_json::json!({"status": "Accepted"}))
        }
        "SetBalanzState" => {
            require_role(&caller, Role::Admin)?;
            let req: SetBalanzStateRequest = parse!(SetBalanzStateRequest);
            state.allocator.suspend_group(&req.group_id, req.suspend).await;
            audit(state, &caller, "SetBalanzState", &format!("{} suspend={}", req.group_id, req.suspend)).await;
            Ok(serde_json::json!({"status": "Accepted"}))
        }
        "ReloadGroups" => {
            require_role(&caller, Role::Admin)?;
            let groups = csv_store::load_groups(&state.data_dir.join("groups.csv"))?;
            state.registry.replace_groups(groups).await;
            audit(state, &caller, "ReloadGroups", "").await;
            Ok(serde_json::json!({"status": "Accepted"}))
        }
        "ReloadChargers" => {
            require_role(&caller, Role::Admin)?;
            let chargers = csv_store::load_chargers(&state.data_dir.join("chargers.csv"), Utc::now())?;
            state.registry.replace_chargers(chargers).await;
            audit(state, &caller, "ReloadChargers", "").await;
            Ok(serde_json::json!({"status": "Accepted"}))
        }
        "ReloadTags" => {
            require_role(&caller, Role::Admin)?;
            let tags = csv_store::load_tags(&state.data_dir.join("tags.csv"))?;
            state.registry.replace_tags(tags).await;
            audit(state, &caller, "ReloadTags", "").await;
            Ok(serde_json::json!({"status": "Accepted"}))
        }
        "ReloadUsers" => {
            require_role(&caller, Role::Admin)?;
            let users = csv_store::load_users(&state.data_dir.join("users.csv"))?;
            *state.users.write().await = users;
            audit(state, &caller, "ReloadUsers", "").await;
            Ok(serde_json::json!({"status": "Accepted"}))
        }
        "RemoteStopTransaction" => {
            require_role(&caller, Role::Admin)?;
            let req: RemoteStopRequest = parse!(RemoteStopRequest);
            state
                .registry
                .close_session(req.session_id, Utc::now(), StopReason::Remote, Some(0))
                .await?;
            audit(state, &caller, "RemoteStopTransaction", &req.session_id.to_string()).await;
            Ok(serde_json::json!({"status": "Accepted"}))
        }
        "OcppCall" => {
            require_role(&caller, Role::Admin)?;
            let req: OcppCallRequest = parse!(OcppCallRequest);
            let outcome = state.adapter.send_call(&req.charger_id, &req.action, req.payload).await?;
            audit(state, &caller, "OcppCall", &format!("{} {}", req.charger_id, req.action)).await;
            Ok(match outcome {
                crate::ocpp::adapter::CallOutcome::Result(value) => serde_json::json!({"status": "Accepted", "result": value}),
                crate::ocpp::adapter::CallOutcome::Error { error_code, description } => {
                    serde_json::json!({"status": "Rejected", "errorCode": error_code.to_string(), "description": description})
                }
            })
        }
        other => Err(CommandError::UnsupportedAction(other.to_string())),
    }
}

#[derive(serde::Deserialize)]
struct AddTagRequest {
    id_tag: String,
    parent_id_tag: Option<String>,
    priority_override: Option<i32>,
}

#[derive(serde::Deserialize)]
struct IdTagRequest {
    id_tag: String,
}

#[derive(serde::Deserialize)]
struct SetSessionPriorityRequest {
    session_id: uuid::Uuid,
    priority: i32,
}

#[derive(serde::Deserialize)]
struct SetBalanzStateRequest {
    group_id: String,
    suspend: bool,
}

#[derive(serde::Deserialize)]
struct RemoteStopRequest {
    session_id: uuid::Uuid,
}

/// Forwards an arbitrary OCPP action to a charger (spec §6 OCPP
/// pass-through) — e.g. `TriggerMessage`, `Reset`, `ChangeConfiguration`,
/// `GetConfiguration`, `UpdateFirmware`, `RemoteStartTransaction`.
#[derive(serde::Deserialize)]
struct OcppCallRequest {
    charger_id: String,
    action: String,
    payload: serde_json::Value,
}

async fn status(state: &Arc<AppState>) -> Result<serde_json::Value, CommandError> {
    let snap = state.registry.snapshot().await;
    Ok(serde_json::json!({
        "groups": snap.groups.len(),
        "chargers": snap.chargers.len(),
        "open_sessions": snap.sessions.values().filter(|s| s.is_open()).count(),
        "taken_at": snap.taken_at,
    }))
}

/// Human-readable multi-line snapshot of every group, charger, connector
/// and live session (spec §6), for operator debugging over the admin API.
pub async fn draw_all(state: &Arc<AppState>) -> String {
    let snap = state.registry.snapshot().await;
    let mut out = String::new();

    let mut group_ids: Vec<_> = snap.groups.keys().collect();
    group_ids.sort();
    for id in group_ids {
        let g = &snap.groups[id];
        let _ = writeln!(out, "group {} parent={:?} allocation={}", g.id, g.parent_id, g.is_allocation_group());
    }

    let mut charger_ids: Vec<_> = snap.chargers.keys().collect();
    charger_ids.sort();
    for id in charger_ids {
        let c = &snap.chargers[id];
        let _ = writeln!(out, "charger {} ({}) group={} conn_max={}A", c.charger_id, c.alias, c.group_id, c.conn_max);
        for conn in &c.connectors {
            let _ = writeln!(out, "  connector {} status={:?} offer={:?}A", conn.index, conn.status, conn.offer_a);
        }
    }

    let mut session_ids: Vec<_> = snap.sessions.values().filter(|s| s.is_open()).collect();
    session_ids.sort_by(|a, b| a.charger_id.cmp(&b.charger_id));
    for s in session_ids {
        let _ = writeln!(out, "session {} charger={} connector={} tag={} priority={}", s.id, s.charger_id, s.connector_index, s.id_tag, s.priority);
    }

    out
}

async fn audit(state: &Arc<AppState>, caller: &Caller, action: &str, detail: &str) {
    if let Err(e) = state.audit.record(&caller.role.to_string(), &caller.user_id, action, detail).await {
        tracing::warn!(error = %e, "failed to append audit log");
    }
}

pub fn users_csv_path(data_dir: &Path) -> std::path::PathBuf {
    data_dir.join("users.csv")
}

impl From<CommandError> for crate::ocpp::ErrorCode {
    fn from(e: CommandError) -> Self {
        match e {
            CommandError::Auth(AuthError::NotAuthenticated) | CommandError::Auth(AuthError::InvalidCredentials) => {
                crate::ocpp::ErrorCode::SecurityError
            }
            CommandError::Auth(AuthError::InsufficientRole { .. }) => crate::ocpp::ErrorCode::SecurityError,
            CommandError::UnsupportedAction(_) => crate::ocpp::ErrorCode::NotImplemented,
            CommandError::MalformedPayload { .. } => crate::ocpp::ErrorCode::FormationViolation,
            CommandError::Protocol(_) => crate::ocpp::ErrorCode::GenericError,
            _ => crate::ocpp::ErrorCode::InternalError,
        }
    }
}
