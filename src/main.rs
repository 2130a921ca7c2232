mod allocator;
mod api;
mod config;
mod domain;
mod error;
mod ocpp;
mod persistence;
mod registry;
mod statemachine;
mod telemetry;
mod watchdog;

use std::sync::Arc;
use std::time::Duration as StdDuration;

use anyhow::{Context, Result};
use chrono::Utc;
use config::AppConfig;
use telemetry::init_tracing;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let cfg = AppConfig::load()?;

    std::fs::create_dir_all(&cfg.model.data_dir).context("creating model.data_dir")?;
    if let Some(parent) = cfg.history.sessions_csv.parent() {
        std::fs::create_dir_all(parent).context("creating history.sessions_csv parent directory")?;
    }

    let now = Utc::now();
    let groups = persistence::csv_store::load_groups(&cfg.model.groups_csv()).unwrap_or_default();
    let chargers = persistence::csv_store::load_chargers(&cfg.model.chargers_csv(), now).unwrap_or_default();
    let tags = persistence::csv_store::load_tags(&cfg.model.tags_csv()).unwrap_or_default();
    let users = persistence::csv_store::load_users(&cfg.model.users_csv()).unwrap_or_default();

    let registry = Arc::new(registry::Registry::new(cfg.csms.autoregister_group.clone(), cfg.csms.allow_unknown_tags));
    registry.replace_groups(groups).await;
    registry.replace_chargers(chargers).await;
    registry.replace_tags(tags).await;

    let adapter = Arc::new(ocpp::adapter::Adapter::new(
        StdDuration::from_millis(cfg.csms.call_timeout_ms),
        StdDuration::from_secs(cfg.csms.watchdog_stale_secs),
    ));

    let session_history = Arc::new(persistence::sessions_history::SessionHistoryWriter::new(cfg.history.sessions_csv.clone()));
    let statemachine = Arc::new(
        statemachine::StateMachine::new(registry.clone(), adapter.clone(), cfg.balanz.min_allocation_a, cfg.balanz.default_priority)
            .with_session_history(session_history),
    );

    let allocator = Arc::new(allocator::AllocatorLoop::new(
        registry.clone(),
        statemachine.clone(),
        cfg.balanz.to_allocator_config(),
        StdDuration::from_secs(cfg.balanz.run_interval_secs),
        cfg.balanz.intervals_full,
        StdDuration::from_secs(cfg.balanz.first_wait_secs),
    ));

    let watchdog = Arc::new(watchdog::Watchdog::new(
        registry.clone(),
        adapter.clone(),
        allocator.clone(),
        StdDuration::from_secs(cfg.csms.watchdog_stale_secs),
        chrono::Duration::seconds(cfg.csms.transaction_timeout_secs as i64),
    ));

    let audit = Arc::new(persistence::audit::AuditLog::new(cfg.history.audit_log.clone()));
    let app_state = Arc::new(api::AppState::new(registry.clone(), allocator.clone(), adapter.clone(), audit, users, cfg.model.data_dir.clone()));

    let cancel = CancellationToken::new();
    let allocator_task = tokio::spawn(allocator.clone().run(cancel.clone()));
    let watchdog_task = tokio::spawn(watchdog.clone().run(cancel.clone()));

    let app = api::router(app_state, statemachine);

    let addr = cfg.host.socket_addr()?;
    info!(%addr, "starting ocpp-balanz");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).with_graceful_shutdown(telemetry::shutdown_signal()).await?;

    cancel.cancel();
    let _ = tokio::join!(allocator_task, watchdog_task);

    warn!("shutdown complete");
    Ok(())
}
