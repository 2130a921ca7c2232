//! Per-connector lifecycle state machine (spec §4.3): translates inbound
//! OCPP calls into registry mutations, and allocator offer changes into
//! outbound `SetChargingProfile`/`ClearChargingProfile` calls.

use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::domain::charger::ConnectorStatus;
use crate::domain::session::{Session, StopReason};
use crate::ocpp::adapter::{Adapter, CallOutcome};
use crate::ocpp::messages::*;
use crate::ocpp::ErrorCode;
use crate::persistence::sessions_history::SessionHistoryWriter;
use crate::registry::{ModelError, Registry};

#[derive(Debug, Error)]
pub enum StateMachineError {
    #[error("model error: {0}")]
    Model(#[from] ModelError),
    #[error("unsupported action: {0}")]
    UnsupportedAction(String),
    #[error("malformed payload for {action}: {source}")]
    MalformedPayload { action: String, source: serde_json::Error },
    #[error("protocol error: {0}")]
    Protocol(#[from] crate::error::ProtocolError),
    #[error("charger rejected call: {0:?} {1}")]
    Rejected(ErrorCode, String),
}

pub struct StateMachine {
    pub registry: Arc<Registry>,
    pub adapter: Arc<Adapter>,
    pub min_allocation_a: u32,
    /// Fallback session priority used when neither the charger's owning
    /// group nor the charger itself carries a more specific default.
    pub config_default_priority: i32,
    pub session_history: Option<Arc<SessionHistoryWriter>>,
    next_profile_id: AtomicI32,
    next_transaction_id: AtomicI32,
}

impl StateMachine {
    pub fn new(registry: Arc<Registry>, adapter: Arc<Adapter>, min_allocation_a: u32, config_default_priority: i32) -> Self {
        Self {
            registry,
            adapter,
            min_allocation_a,
            config_default_priority,
            session_history: None,
            next_profile_id: AtomicI32::new(1),
            next_transaction_id: AtomicI32::new(1),
        }
    }

    pub fn with_session_history(mut self, writer: Arc<SessionHistoryWriter>) -> Self {
        self.session_history = Some(writer);
        self
    }

    fn next_profile_id(&self) -> i32 {
        self.next_profile_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Dispatches one inbound `Call` action, returning the JSON payload for
    /// the `CallResult`, or the OCPP error to wrap in a `CallError`.
    pub async fn handle_call(
        &self,
        charger_id: &str,
        action: &str,
        payload: &serde_json::Value,
        now: DateTime<Utc>,
    ) -> Result<serde_json::Value, StateMachineError> {
        macro_rules! parse {
            ($ty:ty) => {
                serde_json::from_value::<$ty>(payload.clone())
                    .map_err(|source| StateMachineError::MalformedPayload { action: action.to_string(), source })?
            };
        }

        match action {
            "BootNotification" => {
                let req: BootNotificationRequest = parse!(BootNotificationRequest);
                self.on_boot_notification(charger_id, req, now).await
            }
            "Heartbeat" => Ok(serde_json::to_value(HeartbeatResponse { current_time: now }).unwrap()),
            "StatusNotification" => {
                let req: StatusNotificationRequest = parse!(StatusNotificationRequest);
                self.on_status_notification(charger_id, req, now).await
            }
            "Authorize" => {
                let req: AuthorizeRequest = parse!(AuthorizeRequest);
                self.on_authorize(req).await
            }
            "StartTransaction" => {
                let req: StartTransactionRequest = parse!(StartTransactionRequest);
                self.on_start_transaction(charger_id, req, now).await
            }
            "StopTransaction" => {
                let req: StopTransactionRequest = parse!(StopTransactionRequest);
                self.on_stop_transaction(charger_id, req, now).await
            }
            "MeterValues" => {
                let req: MeterValuesRequest = parse!(MeterValuesRequest);
                self.on_meter_values(charger_id, req, now).await
            }
            "FirmwareStatusNotification" => {
                let _req: FirmwareStatusNotificationRequest = parse!(FirmwareStatusNotificationRequest);
                Ok(serde_json::to_value(FirmwareStatusNotificationResponse {}).unwrap())
            }
            other => Err(StateMachineError::UnsupportedAction(other.to_string())),
        }
    }

    async fn on_boot_notification(
        &self,
        charger_id: &str,
        req: BootNotificationRequest,
        now: DateTime<Utc>,
    ) -> Result<serde_json::Value, StateMachineError> {
        if self.registry.find_charger(Some(charger_id), None).await.is_none() {
            self.registry.autoregister(charger_id, 32, 1, now).await?;
        }
        self.registry
            .update_charger(charger_id, |c| {
                c.firmware_version = req.firmware_version.clone();
                c.last_seen = Some(now);
            })
            .await?;

        self.install_baseline_profiles(charger_id).await;

        Ok(serde_json::to_value(BootNotificationResponse {
            status: RegistrationStatus::Accepted,
            current_time: now,
            interval: 300,
        })
        .unwrap())
    }

    /// Clears existing default profiles, then installs the minimum profile
    /// at stack level 0 and the blocking profile at stack level 1, driving
    /// the charger to a known baseline.
    pub async fn install_baseline_profiles(&self, charger_id: &str) {
        let _ = self
            .adapter
            .send_call(
                charger_id,
                "ClearChargingProfile",
                serde_json::to_value(ClearChargingProfileRequest {
                    id: None,
                    connector_id: None,
                    charging_profile_purpose: Some(ChargingProfilePurpose::TxDefaultProfile),
                    stack_level: None,
                })
                .unwrap(),
            )
            .await;

        let min_profile = minimum_profile(self.next_profile_id(), self.min_allocation_a);
        let _ = self
            .adapter
            .send_call(
                charger_id,
                "SetChargingProfile",
                serde_json::to_value(SetChargingProfileRequest { connector_id: 0, cs_charging_profiles: min_profile })
                    .unwrap(),
            )
            .await;

        self.install_blocking_profile(charger_id).await;
    }

    pub async fn install_blocking_profile(&self, charger_id: &str) {
        let blocking = blocking_profile(self.next_profile_id());
        let _ = self
            .adapter
            .send_call(
                charger_id,
                "SetChargingProfile",
                serde_json::to_value(SetChargingProfileRequest { connector_id: 0, cs_charging_profiles: blocking })
                    .unwrap(),
            )
            .await;
    }

    async fn on_status_notification(
        &self,
        charger_id: &str,
        req: StatusNotificationRequest,
        now: DateTime<Utc>,
    ) -> Result<serde_json::Value, StateMachineError> {
        let new_status: ConnectorStatus = req.status.into();
        self.registry
            .mutate_connector(charger_id, req.connector_id as u32, |c| {
                c.status = new_status;
            })
            .await?;
        self.registry
            .update_charger(charger_id, |c| c.last_seen = Some(now))
            .await?;
        Ok(serde_json::to_value(StatusNotificationResponse {}).unwrap())
    }

    async fn on_authorize(&self, req: AuthorizeRequest) -> Result<serde_json::Value, StateMachineError> {
        let status = match self.registry.tag(&req.id_tag).await {
            Some(tag) if tag.is_usable() => AuthorizationStatus::Accepted,
            Some(_) => AuthorizationStatus::Blocked,
            None => AuthorizationStatus::Invalid,
        };
        Ok(serde_json::to_value(AuthorizeResponse { id_tag_info: IdTagInfo { status, expiry_date: None, parent_id_tag: None } }).unwrap())
    }

    async fn on_start_transaction(
        &self,
        charger_id: &str,
        req: StartTransactionRequest,
        now: DateTime<Utc>,
    ) -> Result<serde_json::Value, StateMachineError> {
        let charger = self
            .registry
            .find_charger(Some(charger_id), None)
            .await
            .ok_or_else(|| ModelError::UnknownCharger(charger_id.to_string()))?;

        let tag = self.registry.tag(&req.id_tag).await;
        let tag_status = tag.as_ref().map(|t| t.is_usable()).unwrap_or(self.registry.allow_unknown_tags);
        if !tag_status {
            return Ok(serde_json::to_value(StartTransactionResponse {
                id_tag_info: IdTagInfo { status: AuthorizationStatus::Blocked, expiry_date: None, parent_id_tag: None },
                transaction_id: 0,
            })
            .unwrap());
        }

        let group_default = self.registry.snapshot().await.nearest_group_default_priority(&charger.group_id);
        let priority = crate::domain::session::resolve_priority(
            self.config_default_priority,
            group_default,
            charger.default_priority,
            tag.as_ref().and_then(|t| t.priority_override),
            None,
        );
        let mut session = Session::new(charger_id.to_string(), req.connector_id as u32, req.id_tag.clone(), priority, now);
        let ocpp_tx_id = self.next_transaction_id.fetch_add(1, Ordering::Relaxed);
        session.ocpp_transaction_id = Some(ocpp_tx_id);

        self.registry.open_session(charger_id, req.connector_id as u32, session).await?;

        Ok(serde_json::to_value(StartTransactionResponse {
            id_tag_info: IdTagInfo { status: AuthorizationStatus::Accepted, expiry_date: None, parent_id_tag: None },
            transaction_id: ocpp_tx_id,
        })
        .unwrap())
    }

    async fn on_stop_transaction(
        &self,
        charger_id: &str,
        req: StopTransactionRequest,
        now: DateTime<Utc>,
    ) -> Result<serde_json::Value, StateMachineError> {
        let snap = self.registry.snapshot().await;
        let session_id = snap
            .chargers
            .get(charger_id)
            .and_then(|c| c.connectors.iter().find(|conn| conn.live_session_id.is_some()))
            .and_then(|conn| conn.live_session_id);

        if let Some(session_id) = session_id {
            let Some(session) = snap.sessions.get(&session_id) else {
                return Ok(serde_json::to_value(StopTransactionResponse { id_tag_info: None }).unwrap());
            };
            let stop_id_tag = req.id_tag.clone().filter(|t| &session.id_tag != t);

            if let Some(stopper) = &stop_id_tag {
                let starting_tag = self.registry.tag(&session.id_tag).await;
                let stopping_tag = self.registry.tag(stopper).await;
                let authorized = matches!(
                    (&starting_tag, &stopping_tag),
                    (Some(a), Some(b)) if a.shares_parent_with(b)
                );
                if !authorized {
                    tracing::warn!(%charger_id, %session_id, stopping_tag = %stopper, "stop tag does not share a parent with the starting tag, refusing stop");
                    return Ok(serde_json::to_value(StopTransactionResponse {
                        id_tag_info: Some(IdTagInfo { status: AuthorizationStatus::Blocked, expiry_date: None, parent_id_tag: None }),
                    })
                    .unwrap());
                }
            }

            let closed = self
                .registry
                .close_session_with_tag(session_id, now, StopReason::Remote, Some(0), stop_id_tag)
                .await?;
            self.install_blocking_profile(charger_id).await;

            if let (Some(writer), Some(charger)) = (&self.session_history, snap.chargers.get(charger_id)) {
                if let Err(e) = writer.append(&closed, charger).await {
                    tracing::warn!(%charger_id, error = %e, "failed to append session history");
                }
            }
        }
        Ok(serde_json::to_value(StopTransactionResponse { id_tag_info: None }).unwrap())
    }

    async fn on_meter_values(
        &self,
        charger_id: &str,
        req: MeterValuesRequest,
        now: DateTime<Utc>,
    ) -> Result<serde_json::Value, StateMachineError> {
        self.registry.update_charger(charger_id, |c| c.last_seen = Some(now)).await?;

        let snap = self.registry.snapshot().await;
        let session_id = snap
            .chargers
            .get(charger_id)
            .and_then(|c| c.connector(req.connector_id as u32))
            .and_then(|c| c.live_session_id);

        if let Some(session_id) = session_id {
            for mv in &req.meter_value {
                let energy_kwh = mv
                    .sampled_value
                    .iter()
                    .find(|sv| sv.measurand.as_deref() == Some("Energy.Active.Import.Register"))
                    .and_then(|sv| sv.value.parse::<f64>().ok())
                    .map(|wh| wh / 1000.0)
                    .unwrap_or(0.0);
                let current_a: Vec<f64> = mv
                    .sampled_value
                    .iter()
                    .filter(|sv| sv.measurand.as_deref() == Some("Current.Import"))
                    .filter_map(|sv| sv.value.parse::<f64>().ok())
                    .collect();
                let sample = crate::domain::session::MeterSample {
                    timestamp: mv.timestamp,
                    energy_cumulative_kwh: energy_kwh,
                    current_a,
                };
                let _ = self.registry.mutate_session(session_id, |s| s.push_meter_sample(sample, 128)).await;
            }
        }
        Ok(serde_json::to_value(MeterValuesResponse {}).unwrap())
    }

    /// Installs (or clears) a `TxProfile` for the given connector's granted
    /// offer, driven by the allocator's commit step (spec §4.4 step 8).
    pub async fn apply_offer(
        &self,
        charger_id: &str,
        connector_index: u32,
        transaction_id: Option<i32>,
        offer_a: u32,
    ) -> Result<(), StateMachineError> {
        if offer_a == 0 {
            self.install_blocking_profile(charger_id).await;
            return Ok(());
        }
        let Some(transaction_id) = transaction_id else {
            // No open transaction yet: clearing the blocking profile exposes
            // the minimum profile so the transaction can start.
            let _ = self
                .adapter
                .send_call(
                    charger_id,
                    "ClearChargingProfile",
                    serde_json::to_value(ClearChargingProfileRequest {
                        id: None,
                        connector_id: Some(connector_index as i32),
                        charging_profile_purpose: Some(ChargingProfilePurpose::TxDefaultProfile),
                        stack_level: Some(1),
                    })
                    .unwrap(),
                )
                .await;
            return Ok(());
        };

        let profile = tx_profile(self.next_profile_id(), transaction_id, offer_a);
        let outcome = self
            .adapter
            .send_call(
                charger_id,
                "SetChargingProfile",
                serde_json::to_value(SetChargingProfileRequest { connector_id: connector_index as i32, cs_charging_profiles: profile })
                    .unwrap(),
            )
            .await?;

        match outcome {
            CallOutcome::Result(value) => {
                let resp: SetChargingProfileResponse = serde_json::from_value(value)
                    .map_err(|source| StateMachineError::MalformedPayload { action: "SetChargingProfile".into(), source })?;
                match resp.status {
                    ChargingProfileStatus::Accepted => Ok(()),
                    other => Err(StateMachineError::Rejected(ErrorCode::GenericError, format!("{other:?}"))),
                }
            }
            CallOutcome::Error { error_code, description } => Err(StateMachineError::Rejected(error_code, description)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn make() -> (Arc<Registry>, Arc<Adapter>, StateMachine) {
        let registry = Arc::new(Registry::new(Some("root".to_string()), true));
        let adapter = Arc::new(Adapter::new(Duration::from_millis(50), Duration::from_secs(500)));
        let sm = StateMachine::new(registry.clone(), adapter.clone(), 6, 0);
        (registry, adapter, sm)
    }

    #[tokio::test]
    async fn boot_notification_autoregisters_unknown_charger() {
        let (registry, _adapter, sm) = make();
        registry
            .add_group(crate::domain::group::Group { id: "root".into(), parent_id: None, description: "root".into(), max_allocation: None, default_priority: None })
            .await
            .unwrap();

        let result = sm
            .handle_call(
                "CP1",
                "BootNotification",
                &serde_json::json!({"chargePointVendor": "acme", "chargePointModel": "x"}),
                Utc::now(),
            )
            .await
            .unwrap();
        let resp: BootNotificationResponse = serde_json::from_value(result).unwrap();
        assert_eq!(resp.status, RegistrationStatus::Accepted);
        assert!(registry.find_charger(Some("CP1"), None).await.is_some());
    }

    #[tokio::test]
    async fn status_notification_updates_connector_state() {
        let (registry, _adapter, sm) = make();
        registry
            .add_group(crate::domain::group::Group { id: "root".into(), parent_id: None, description: "root".into(), max_allocation: None, default_priority: None })
            .await
            .unwrap();
        registry.autoregister("CP1", 32, 1, Utc::now()).await.unwrap();

        sm.handle_call(
            "CP1",
            "StatusNotification",
            &serde_json::json!({"connectorId": 1, "errorCode": "NoError", "status": "Preparing"}),
            Utc::now(),
        )
        .await
        .unwrap();

        let snap = registry.snapshot().await;
        let status = snap.chargers["CP1"].connector(1).unwrap().status;
        assert_eq!(status, ConnectorStatus::Preparing);
    }

    #[tokio::test]
    async fn start_transaction_rejects_unauthorized_tag() {
        let registry = Arc::new(Registry::new(Some("root".into()), false));
        let adapter = Arc::new(Adapter::new(Duration::from_millis(50), Duration::from_secs(500)));
        let sm = StateMachine::new(registry.clone(), adapter, 6, 0);
        registry
            .add_group(crate::domain::group::Group { id: "root".into(), parent_id: None, description: "root".into(), max_allocation: None, default_priority: None })
            .await
            .unwrap();
        registry.autoregister("CP1", 32, 1, Utc::now()).await.unwrap();

        let result = sm
            .handle_call(
                "CP1",
                "StartTransaction",
                &serde_json::json!({"connectorId": 1, "idTag": "GHOST", "meterStart": 0, "timestamp": Utc::now()}),
                Utc::now(),
            )
            .await
            .unwrap();
        let resp: StartTransactionResponse = serde_json::from_value(result).unwrap();
        assert_eq!(resp.id_tag_info.status, AuthorizationStatus::Blocked);
    }

    #[tokio::test]
    async fn start_transaction_priority_prefers_group_default_over_charger_default() {
        let registry = Arc::new(Registry::new(Some("root".into()), true));
        let adapter = Arc::new(Adapter::new(Duration::from_millis(50), Duration::from_secs(500)));
        let sm = StateMachine::new(registry.clone(), adapter, 6, 0);
        registry
            .add_group(crate::domain::group::Group {
                id: "root".into(),
                parent_id: None,
                description: "root".into(),
                max_allocation: None,
                default_priority: Some(9),
            })
            .await
            .unwrap();
        registry.autoregister("CP1", 32, 1, Utc::now()).await.unwrap();

        let result = sm
            .handle_call(
                "CP1",
                "StartTransaction",
                &serde_json::json!({"connectorId": 1, "idTag": "TAG1", "meterStart": 0, "timestamp": Utc::now()}),
                Utc::now(),
            )
            .await
            .unwrap();
        let resp: StartTransactionResponse = serde_json::from_value(result).unwrap();
        assert_eq!(resp.id_tag_info.status, AuthorizationStatus::Accepted);

        let snap = registry.snapshot().await;
        let session = snap.sessions.values().next().unwrap();
        assert_eq!(session.priority, 9);
    }

    #[tokio::test]
    async fn stop_transaction_refuses_tag_without_shared_parent() {
        let (registry, _adapter, sm) = make();
        registry
            .add_group(crate::domain::group::Group { id: "root".into(), parent_id: None, description: "root".into(), max_allocation: None, default_priority: None })
            .await
            .unwrap();
        registry.autoregister("CP1", 32, 1, Utc::now()).await.unwrap();
        registry
            .add_tag(crate::domain::tag::Tag { id_tag: "TAG1".into(), status: crate::domain::tag::TagStatus::Activated, parent_id_tag: Some("FAMILY".into()), priority_override: None })
            .await
            .unwrap();
        registry
            .add_tag(crate::domain::tag::Tag { id_tag: "STRANGER".into(), status: crate::domain::tag::TagStatus::Activated, parent_id_tag: None, priority_override: None })
            .await
            .unwrap();

        sm.handle_call(
            "CP1",
            "StartTransaction",
            &serde_json::json!({"connectorId": 1, "idTag": "TAG1", "meterStart": 0, "timestamp": Utc::now()}),
            Utc::now(),
        )
        .await
        .unwrap();

        let result = sm
            .handle_call(
                "CP1",
                "StopTransaction",
                &serde_json::json!({"transactionId": 1, "idTag": "STRANGER", "meterStop": 0, "timestamp": Utc::now()}),
                Utc::now(),
            )
            .await
            .unwrap();
        let resp: StopTransactionResponse = serde_json::from_value(result).unwrap();
        assert_eq!(resp.id_tag_info.unwrap().status, AuthorizationStatus::Blocked);

        let snap = registry.snapshot().await;
        assert!(snap.sessions.values().any(|s| s.is_open()));
    }

    #[tokio::test]
    async fn stop_transaction_allows_tag_sharing_parent() {
        let (registry, _adapter, sm) = make();
        registry
            .add_group(crate::domain::group::Group { id: "root".into(), parent_id: None, description: "root".into(), max_allocation: None, default_priority: None })
            .await
            .unwrap();
        registry.autoregister("CP1", 32, 1, Utc::now()).await.unwrap();
        registry
            .add_tag(crate::domain::tag::Tag { id_tag: "TAG1".into(), status: crate::domain::tag::TagStatus::Activated, parent_id_tag: Some("FAMILY".into()), priority_override: None })
            .await
            .unwrap();
        registry
            .add_tag(crate::domain::tag::Tag { id_tag: "SIBLING".into(), status: crate::domain::tag::TagStatus::Activated, parent_id_tag: Some("FAMILY".into()), priority_override: None })
            .await
            .unwrap();

        sm.handle_call(
            "CP1",
            "StartTransaction",
            &serde_json::json!({"connectorId": 1, "idTag": "TAG1", "meterStart": 0, "timestamp": Utc::now()}),
            Utc::now(),
        )
        .await
        .unwrap();

        let result = sm
            .handle_call(
                "CP1",
                "StopTransaction",
                &serde_json::json!({"transactionId": 1, "idTag": "SIBLING", "meterStop": 0, "timestamp": Utc::now()}),
                Utc::now(),
            )
            .await
            .unwrap();
        let resp: StopTransactionResponse = serde_json::from_value(result).unwrap();
        assert!(resp.id_tag_info.is_none());

        let snap = registry.snapshot().await;
        assert!(snap.sessions.values().all(|s| !s.is_open()));
    }

    #[tokio::test]
    async fn meter_values_refreshes_charger_last_seen() {
        let (registry, _adapter, sm) = make();
        registry
            .add_group(crate::domain::group::Group { id: "root".into(), parent_id: None, description: "root".into(), max_allocation: None, default_priority: None })
            .await
            .unwrap();
        registry.autoregister("CP1", 32, 1, Utc::now()).await.unwrap();
        registry.update_charger("CP1", |c| c.last_seen = None).await.unwrap();

        let now = Utc::now();
        sm.handle_call(
            "CP1",
            "MeterValues",
            &serde_json::json!({
                "connectorId": 1,
                "meterValue": [{"timestamp": now, "sampledValue": [{"value": "1000"}]}]
            }),
            now,
        )
        .await
        .unwrap();

        let snap = registry.snapshot().await;
        assert_eq!(snap.chargers["CP1"].last_seen, Some(now));
    }
}
