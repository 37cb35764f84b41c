//! Where the hosted client keeps the last issued session between runs.

use std::{
    io::ErrorKind,
    path::{Path, PathBuf},
};

use anyhow::{Context, Result};
use async_trait::async_trait;
use shared::domain::Session;
use tokio::sync::Mutex;

#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn load(&self) -> Result<Option<Session>>;
    async fn save(&self, session: &Session) -> Result<()>;
    async fn clear(&self) -> Result<()>;
}

#[derive(Default)]
pub struct MemorySessionStore {
    slot: Mutex<Option<Session>>,
}

impl MemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_session(session: Session) -> Self {
        Self {
            slot: Mutex::new(Some(session)),
        }
    }
}

#[async_trait]
impl SessionStore for MemorySessionStore {
    async fn load(&self) -> Result<Option<Session>> {
        Ok(self.slot.lock().await.clone())
    }

    async fn save(&self, session: &Session) -> Result<()> {
        *self.slot.lock().await = Some(session.clone());
        Ok(())
    }

    async fn clear(&self) -> Result<()> {
        *self.slot.lock().await = None;
        Ok(())
    }
}

/// Session persisted as pretty JSON at a fixed path.
pub struct FileSessionStore {
    path: PathBuf,
}

impl FileSessionStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl SessionStore for FileSessionStore {
    async fn load(&self) -> Result<Option<Session>> {
        let raw = match tokio::fs::read_to_string(&self.path).await {
            Ok(raw) => raw,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(None),
            Err(err) => {
                return Err(err).with_context(|| {
                    format!("failed to read session file '{}'", self.path.display())
                })
            }
        };
        let session = serde_json::from_str(&raw).with_context(|| {
            format!("failed to parse session file '{}'", self.path.display())
        })?;
        Ok(Some(session))
    }

    async fn save(&self, session: &Session) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await.with_context(|| {
                format!(
                    "failed to create parent directory '{}' for session file",
                    parent.display()
                )
            })?;
        }
        let raw = serde_json::to_string_pretty(session)?;
        tokio::fs::write(&self.path, raw)
            .await
            .with_context(|| format!("failed to write session file '{}'", self.path.display()))
    }

    async fn clear(&self) -> Result<()> {
        match tokio::fs::remove_file(&self.path).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err).with_context(|| {
                format!("failed to remove session file '{}'", self.path.display())
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::{SystemTime, UNIX_EPOCH};

    use shared::domain::{Identity, IdentityId, IdentityMetadata, Role};

    use super::*;

    fn session() -> Session {
        Session {
            access_token: "access".into(),
            refresh_token: Some("refresh".into()),
            expires_at: None,
            identity: Identity {
                id: IdentityId(uuid::Uuid::new_v4()),
                email: "linus@example.com".into(),
                metadata: IdentityMetadata {
                    display_name: Some("Linus".into()),
                    role: Some(Role::Student),
                },
            },
        }
    }

    #[tokio::test]
    async fn file_store_round_trips_and_clears() {
        let suffix = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("clock")
            .as_nanos();
        let temp_root = std::env::temp_dir().join(format!("jobboard_session_test_{suffix}"));
        let store = FileSessionStore::new(temp_root.join("nested").join("session.json"));

        assert_eq!(store.load().await.expect("load missing"), None);

        let session = session();
        store.save(&session).await.expect("save");
        assert_eq!(store.load().await.expect("load"), Some(session));

        store.clear().await.expect("clear");
        assert_eq!(store.load().await.expect("load cleared"), None);
        store.clear().await.expect("clearing twice is fine");

        std::fs::remove_dir_all(temp_root).expect("cleanup");
    }

    #[tokio::test]
    async fn corrupt_file_is_reported() {
        let suffix = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("clock")
            .as_nanos();
        let path = std::env::temp_dir().join(format!("jobboard_corrupt_session_{suffix}.json"));
        std::fs::write(&path, "not json").expect("write");

        let err = FileSessionStore::new(&path)
            .load()
            .await
            .expect_err("corrupt file");
        assert!(err.to_string().contains("failed to parse session file"));

        let _ = std::fs::remove_file(&path);
    }

    #[tokio::test]
    async fn memory_store_starts_with_seeded_session() {
        let session = session();
        let store = MemorySessionStore::with_session(session.clone());
        assert_eq!(store.load().await.expect("load"), Some(session));
        store.clear().await.expect("clear");
        assert_eq!(store.load().await.expect("load"), None);
    }
}
