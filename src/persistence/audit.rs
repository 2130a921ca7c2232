//! Append-only admin audit log (spec §6): one line per privileged action.

use std::path::PathBuf;

use chrono::Utc;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

use crate::persistence::PersistenceError;

pub struct AuditLog {
    path: PathBuf,
    lock: Mutex<()>,
}

impl AuditLog {
    pub fn new(path: PathBuf) -> Self {
        Self { path, lock: Mutex::new(()) }
    }

    pub async fn record(&self, role: &str, user: &str, action: &str, detail: &str) -> Result<(), PersistenceError> {
        let _guard = self.lock.lock().await;
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await
            .map_err(|e| PersistenceError::Write { path: self.path.display().to_string(), source: e })?;

        let line = format!("{} {} {} {} {}\n", Utc::now().to_rfc3339(), role, user, action, detail);
        file.write_all(line.as_bytes())
            .await
            .map_err(|e| PersistenceError::Write { path: self.path.display().to_string(), source: e })?;
        file.flush().await.map_err(|e| PersistenceError::Write { path: self.path.display().to_string(), source: e })?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn records_one_line_per_action() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("audit_log.txt");
        let log = AuditLog::new(path.clone());

        log.record("Admin", "alice", "ReloadGroups", "ok").await.unwrap();
        log.record("Tags", "bob", "BlockTag", "TAG1").await.unwrap();

        let contents = tokio::fs::read_to_string(&path).await.unwrap();
        let lines: Vec<_> = contents.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].contains("ReloadGroups"));
        assert!(lines[1].contains("BlockTag"));
    }
}
