pub mod auth;
pub mod commands;
pub mod error;
pub mod health;
pub mod response;
pub mod router;

use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::RwLock;

use crate::allocator::AllocatorLoop;
use crate::ocpp::adapter::Adapter;
use crate::persistence::audit::AuditLog;
use crate::persistence::csv_store::UserRow;
use crate::registry::Registry;

/// Shared state behind the admin API, distinct from the charger-side
/// `StateMachine` wiring so the two WebSocket endpoints can evolve
/// independently (spec §6 treats them as two protocols over one host).
pub struct AppState {
    pub registry: Arc<Registry>,
    pub allocator: Arc<AllocatorLoop>,
    pub adapter: Arc<Adapter>,
    pub audit: Arc<AuditLog>,
    pub users: RwLock<Vec<UserRow>>,
    pub data_dir: PathBuf,
}

impl AppState {
    pub fn new(
        registry: Arc<Registry>,
        allocator: Arc<AllocatorLoop>,
        adapter: Arc<Adapter>,
        audit: Arc<AuditLog>,
        users: Vec<UserRow>,
        data_dir: PathBuf,
    ) -> Self {
        Self { registry, allocator, adapter, audit, users: RwLock::new(users), data_dir }
    }
}

pub use router::router;
