//! Axum WebSocket handler for the OCPP-J charger endpoint (`/<charger_id>`,
//! spec §6). Decodes frames, dispatches `Call`s to the state machine, and
//! routes `CallResult`/`CallError` back to the adapter's pending calls.

use std::sync::Arc;

use axum::extract::ws::{Message as WsMessage, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, State};
use axum::response::IntoResponse;
use chrono::Utc;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::ocpp::adapter::CallOutcome;
use crate::ocpp::{Call, CallError, CallResult, ErrorCode, Frame};
use crate::statemachine::StateMachine;

pub async fn charger_ws_handler(
    Path(charger_id): Path<String>,
    State(statemachine): State<Arc<StateMachine>>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    ws.protocols(["ocpp1.6"])
        .on_upgrade(move |socket| handle_charger_socket(charger_id, socket, statemachine))
}

async fn handle_charger_socket(charger_id: String, socket: WebSocket, statemachine: Arc<StateMachine>) {
    let (mut ws_tx, mut ws_rx) = socket.split();
    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<WsMessage>();
    let reply_tx = out_tx.clone();

    statemachine.adapter.register(&charger_id, out_tx).await;
    info!(%charger_id, "charger connected");

    let writer = tokio::spawn(async move {
        while let Some(msg) = out_rx.recv().await {
            if ws_tx.send(msg).await.is_err() {
                break;
            }
        }
    });

    while let Some(Ok(msg)) = ws_rx.next().await {
        statemachine.adapter.touch(&charger_id).await;
        let text = match msg {
            WsMessage::Text(t) => t,
            WsMessage::Close(_) => break,
            _ => continue,
        };

        let frame: Frame = match serde_json::from_str(&text) {
            Ok(f) => f,
            Err(e) => {
                warn!(%charger_id, error = %e, "malformed OCPP-J frame");
                continue;
            }
        };

        match frame {
            Frame::Call(call) => handle_inbound_call(&charger_id, call, &statemachine, &reply_tx).await,
            Frame::CallResult(result) => {
                statemachine
                    .adapter
                    .resolve_pending(&charger_id, &result.message_id, CallOutcome::Result(result.payload))
                    .await;
            }
            Frame::CallError(err) => {
                statemachine
                    .adapter
                    .resolve_pending(
                        &charger_id,
                        &err.message_id,
                        CallOutcome::Error { error_code: err.error_code, description: err.error_description },
                    )
                    .await;
            }
        }
    }

    statemachine.adapter.unregister(&charger_id).await;
    writer.abort();
    debug!(%charger_id, "charger disconnected");
}

async fn handle_inbound_call(
    charger_id: &str,
    call: Call,
    statemachine: &StateMachine,
    reply_tx: &mpsc::UnboundedSender<WsMessage>,
) {
    let now = Utc::now();
    let outgoing = match statemachine.handle_call(charger_id, &call.action, &call.payload, now).await {
        Ok(payload) => WsMessage::Text(
            serde_json::to_string(&CallResult { message_id: call.message_id, payload }).unwrap(),
        ),
        Err(e) => WsMessage::Text(
            serde_json::to_string(&CallError {
                message_id: call.message_id,
                error_code: ErrorCode::InternalError,
                error_description: e.to_string(),
                error_details: serde_json::Value::Null,
            })
            .unwrap(),
        ),
    };
    let _ = reply_tx.send(outgoing);
}
