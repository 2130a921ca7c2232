//! Admin API WebSocket endpoint (spec §6): same subprotocol and framing as
//! the charger side, different dispatcher. Also assembles the full axum
//! router (charger endpoint + admin endpoint + health).

use std::sync::Arc;

use axum::extract::ws::{Message as WsMessage, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use futures_util::{SinkExt, StreamExt};
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{info, warn};

use crate::api::{commands, health, AppState};
use crate::ocpp::{Call, CallError, CallResult, Frame};

pub fn router(state: Arc<AppState>, statemachine: Arc<crate::statemachine::StateMachine>) -> Router {
    let admin = Router::new()
        .route("/api", get(admin_ws_handler))
        .route("/health", get(health::health_check))
        .route("/health/ready", get(health::readiness_check))
        .route("/health/live", get(health::liveness_check))
        .with_state(state);

    let charger = Router::new()
        .route("/:charger_id", get(crate::ocpp::transport::charger_ws_handler))
        .with_state(statemachine);

    admin.merge(charger).layer(CorsLayer::permissive()).layer(TraceLayer::new_for_http())
}

async fn admin_ws_handler(State(state): State<Arc<AppState>>, ws: WebSocketUpgrade) -> impl IntoResponse {
    ws.protocols(["ocpp1.6"]).on_upgrade(move |socket| handle_admin_socket(socket, state))
}

async fn handle_admin_socket(socket: WebSocket, state: Arc<AppState>) {
    let (mut ws_tx, mut ws_rx) = socket.split();
    let mut session = commands::Session::new();
    info!("admin client connected");

    while let Some(Ok(msg)) = ws_rx.next().await {
        let text = match msg {
            WsMessage::Text(t) => t,
            WsMessage::Close(_) => break,
            _ => continue,
        };

        let frame: Frame = match serde_json::from_str(&text) {
            Ok(f) => f,
            Err(e) => {
                warn!(error = %e, "malformed admin frame");
                continue;
            }
        };

        let Frame::Call(call) = frame else {
            continue;
        };

        let reply = build_reply(&state, &mut session, call).await;
        if ws_tx.send(WsMessage::Text(reply)).await.is_err() {
            break;
        }
    }
    info!("admin client disconnected");
}

async fn build_reply(state: &Arc<AppState>, session: &mut commands::Session, call: Call) -> String {
    match commands::dispatch(state, session, &call.action, &call.payload).await {
        Ok(payload) => serde_json::to_string(&CallResult { message_id: call.message_id, payload }).unwrap(),
        Err(e) => {
            let description = e.to_string();
            let error_code: crate::ocpp::ErrorCode = e.into();
            serde_json::to_string(&CallError {
                message_id: call.message_id,
                error_code,
                error_description: description,
                error_details: serde_json::Value::Null,
            })
            .unwrap()
        }
    }
}
