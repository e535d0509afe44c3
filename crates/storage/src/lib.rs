use std::{
    io::ErrorKind,
    path::{Path, PathBuf},
};

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::{fs, sync::Mutex};
use tracing::debug;

const SESSION_FILE: &str = "session.json";

/// One cookie captured from the authenticated jar. The jar is scoped to a
/// single host, so name/value is all that needs to survive a restart.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredCookie {
    pub name: String,
    pub value: String,
}

/// Everything needed to resume an authenticated session without a fresh QR
/// handshake. The blob format is private to this crate.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PersistedSession {
    pub base_url: String,
    pub sid: String,
    pub skey: String,
    pub uin: i64,
    pub device_id: String,
    pub pass_ticket: String,
    pub cookies: Vec<StoredCookie>,
}

impl PersistedSession {
    /// Structural validity: resumption is only attempted with a full
    /// credential set. A blob missing any field is treated as absent.
    pub fn is_complete(&self) -> bool {
        !self.base_url.is_empty()
            && !self.sid.is_empty()
            && !self.skey.is_empty()
            && self.uin != 0
            && !self.device_id.is_empty()
            && !self.pass_ticket.is_empty()
            && !self.cookies.is_empty()
    }
}

#[async_trait]
pub trait SessionStore: Send + Sync {
    /// `Ok(None)` when nothing is persisted; `Err` when a blob exists but
    /// cannot be decoded (the caller decides whether to clear it).
    async fn load(&self) -> Result<Option<PersistedSession>>;
    async fn save(&self, session: &PersistedSession) -> Result<()>;
    async fn clear(&self) -> Result<()>;
}

/// JSON-blob store under a configurable root directory.
pub struct FileSessionStore {
    root: PathBuf,
}

impl FileSessionStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn session_path(&self) -> PathBuf {
        self.root.join(SESSION_FILE)
    }
}

#[async_trait]
impl SessionStore for FileSessionStore {
    async fn load(&self) -> Result<Option<PersistedSession>> {
        let path = self.session_path();
        let raw = match fs::read_to_string(&path).await {
            Ok(raw) => raw,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(None),
            Err(err) => {
                return Err(err)
                    .with_context(|| format!("failed to read session blob at {}", path.display()))
            }
        };
        let session: PersistedSession = serde_json::from_str(&raw)
            .with_context(|| format!("failed to decode session blob at {}", path.display()))?;
        Ok(Some(session))
    }

    async fn save(&self, session: &PersistedSession) -> Result<()> {
        fs::create_dir_all(&self.root).await.with_context(|| {
            format!("failed to create storage root {}", self.root.display())
        })?;
        let raw = serde_json::to_vec_pretty(session).context("failed to encode session blob")?;
        let path = self.session_path();
        fs::write(&path, raw)
            .await
            .with_context(|| format!("failed to write session blob to {}", path.display()))?;
        debug!(path = %path.display(), "session blob refreshed");
        Ok(())
    }

    async fn clear(&self) -> Result<()> {
        let path = self.session_path();
        match fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err)
                .with_context(|| format!("failed to remove session blob at {}", path.display())),
        }
    }
}

/// In-memory store for tests and embedders that manage persistence
/// themselves.
#[derive(Default)]
pub struct MemorySessionStore {
    inner: Mutex<Option<PersistedSession>>,
}

impl MemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_session(session: PersistedSession) -> Self {
        Self {
            inner: Mutex::new(Some(session)),
        }
    }
}

#[async_trait]
impl SessionStore for MemorySessionStore {
    async fn load(&self) -> Result<Option<PersistedSession>> {
        Ok(self.inner.lock().await.clone())
    }

    async fn save(&self, session: &PersistedSession) -> Result<()> {
        *self.inner.lock().await = Some(session.clone());
        Ok(())
    }

    async fn clear(&self) -> Result<()> {
        *self.inner.lock().await = None;
        Ok(())
    }
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
