//! Append-only `sessions.csv` writer (spec §6): one row per closed session.
//! A single async mutex around the open file handle is the writer's only
//! serialization point — mirrors the registry's single-writer shape.

use std::path::PathBuf;

use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

use crate::domain::charger::Charger;
use crate::domain::session::Session;
use crate::persistence::PersistenceError;

pub struct SessionHistoryWriter {
    path: PathBuf,
    lock: Mutex<()>,
}

impl SessionHistoryWriter {
    pub fn new(path: PathBuf) -> Self {
        Self { path, lock: Mutex::new(()) }
    }

    /// Appends one row. Creates the file with a header if it doesn't exist yet.
    pub async fn append(&self, session: &Session, charger: &Charger) -> Result<(), PersistenceError> {
        let _guard = self.lock.lock().await;
        let needs_header = !self.path.exists();

        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await
            .map_err(|e| PersistenceError::Write { path: self.path.display().to_string(), source: e })?;

        if needs_header {
            file.write_all(HEADER.as_bytes())
                .await
                .map_err(|e| PersistenceError::Write { path: self.path.display().to_string(), source: e })?;
        }

        let line = format_row(session, charger);
        file.write_all(line.as_bytes())
            .await
            .map_err(|e| PersistenceError::Write { path: self.path.display().to_string(), source: e })?;
        file.flush().await.map_err(|e| PersistenceError::Write { path: self.path.display().to_string(), source: e })?;
        Ok(())
    }
}

const HEADER: &str =
    "session_id,charger_id,charger_alias,group_id,id_tag,user_name,stop_id_tag,start_time,end_time,duration,energy,stop_reason,history\n";

fn format_row(session: &Session, charger: &Charger) -> String {
    let end_time = session.stop_time.unwrap_or(session.start_time);
    let duration = (end_time - session.start_time).num_seconds();
    let energy = session.meter_samples.back().map(|s| s.energy_cumulative_kwh).unwrap_or(0.0);
    let history = session
        .offer_history
        .iter()
        .map(|(ts, offer)| format!("{}={}", ts.to_rfc3339(), offer.map(|a| a.to_string()).unwrap_or_else(|| "None".to_string())))
        .collect::<Vec<_>>()
        .join(";");
    let stop_reason = session.stop_reason.map(|r| r.to_string()).unwrap_or_default();

    format!(
        "{session_id},{charger_id},{charger_alias},{group_id},{id_tag},{user_name},{stop_id_tag},{start},{end},{duration},{energy},{stop_reason},{history}\n",
        session_id = session.id,
        charger_id = session.charger_id,
        charger_alias = charger.alias,
        group_id = charger.group_id,
        id_tag = session.id_tag,
        user_name = session.id_tag,
        stop_id_tag = session.stop_id_tag.clone().unwrap_or_default(),
        start = session.start_time.to_rfc3339(),
        end = end_time.to_rfc3339(),
        duration = duration,
        energy = energy,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::charger::Connector;
    use crate::domain::session::StopReason;
    use chrono::Utc;

    fn charger() -> Charger {
        Charger {
            charger_id: "CP1".into(),
            alias: "Driveway".into(),
            group_id: "RR1".into(),
            connectors: vec![Connector::new(1, Utc::now())],
            conn_max: 32,
            default_priority: 1,
            auth_key_sha256: None,
            firmware_version: None,
            last_seen: None,
        }
    }

    #[tokio::test]
    async fn appends_header_once_then_rows() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sessions.csv");
        let writer = SessionHistoryWriter::new(path.clone());

        let mut session = Session::new("CP1".into(), 1, "TAG1".into(), 1, Utc::now());
        session.record_offer(Utc::now(), Some(6));
        session.close(Utc::now(), StopReason::Local, Some(0));

        writer.append(&session, &charger()).await.unwrap();
        writer.append(&session, &charger()).await.unwrap();

        let contents = tokio::fs::read_to_string(&path).await.unwrap();
        let lines: Vec<_> = contents.lines().collect();
        assert_eq!(lines[0], HEADER.trim_end());
        assert_eq!(lines.len(), 3);
        assert!(lines[1].contains("CP1"));
    }
}
