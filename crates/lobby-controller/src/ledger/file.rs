//! JSON-file ledger.
//!
//! The whole document is rewritten on every change: written to a sibling
//! temp file, then renamed over the original so a crash mid-write leaves the
//! previous version intact.

use super::{StaleSessionEntry, StaleSessionLedger};
use crate::errors::LobbyError;
use crate::models::LobbyId;
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;
use tracing::{debug, warn};

type Document = BTreeMap<String, StaleSessionEntry>;

#[derive(Debug)]
pub struct FileLedger {
    path: PathBuf,
    /// Serializes read-modify-write cycles within this process.
    write_lock: Mutex<()>,
}

impl FileLedger {
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn temp_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_default();
        name.push(".tmp");
        self.path.with_file_name(name)
    }

    async fn read_document(&self) -> Result<Document, LobbyError> {
        match tokio::fs::read(&self.path).await {
            Ok(bytes) if bytes.is_empty() => Ok(Document::new()),
            Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(Document::new()),
            Err(e) => {
                warn!(
                    target: "lobby.ledger",
                    error = %e,
                    path = %self.path.display(),
                    "Failed to read ledger file"
                );
                Err(e.into())
            }
        }
    }

    async fn write_document(&self, document: &Document) -> Result<(), LobbyError> {
        let bytes = serde_json::to_vec_pretty(document)?;
        let temp = self.temp_path();
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&temp, bytes).await?;
        tokio::fs::rename(&temp, &self.path).await?;
        Ok(())
    }
}

#[async_trait]
impl StaleSessionLedger for FileLedger {
    async fn record(&self, backend_type: &str, lobby_id: &LobbyId) -> Result<(), LobbyError> {
        let _guard = self.write_lock.lock().await;
        let mut document = self.read_document().await?;
        document.insert(
            backend_type.to_string(),
            StaleSessionEntry::now(lobby_id.clone()),
        );
        self.write_document(&document).await?;

        debug!(
            target: "lobby.ledger",
            backend_type = %backend_type,
            lobby_id = %lobby_id,
            "Recorded session in file ledger"
        );
        Ok(())
    }

    async fn erase(&self, backend_type: &str) -> Result<(), LobbyError> {
        let _guard = self.write_lock.lock().await;
        let mut document = self.read_document().await?;
        if document.remove(backend_type).is_none() {
            return Ok(());
        }
        self.write_document(&document).await
    }

    async fn load(&self, backend_type: &str) -> Result<Option<StaleSessionEntry>, LobbyError> {
        Ok(self.read_document().await?.remove(backend_type))
    }
}
