use std::path::PathBuf;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::llm::types::{Content, UsageMetadata};

/// Conversation state owned by one chat
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub id: String,
    pub history: Vec<Content>,
    /// Model requests are sent to; changes only through model fallback
    pub active_model: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Cumulative token usage across all calls in this session
    #[serde(default)]
    pub cumulative_usage: UsageMetadata,
}

impl Session {
    pub fn new(model: &str) -> Self {
        let now = Utc::now();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            history: Vec::new(),
            active_model: model.to_string(),
            created_at: now,
            updated_at: now,
            cumulative_usage: UsageMetadata::default(),
        }
    }

    /// Create session with specific ID (for loading from store)
    pub fn with_id(mut self, id: &str) -> Self {
        self.id = id.to_string();
        self
    }

    pub fn push(&mut self, content: Content) {
        self.history.push(content);
        self.touch();
    }

    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}

/// Persistent session store (one JSON file per session)
pub struct SessionStore {
    base_path: PathBuf,
}

impl SessionStore {
    pub fn new(base_path: PathBuf) -> Result<Self> {
        std::fs::create_dir_all(&base_path)
            .with_context(|| format!("Failed to create session dir: {:?}", base_path))?;
        Ok(Self { base_path })
    }

    fn path_for(&self, session_id: &str) -> PathBuf {
        self.base_path.join(format!("{}.json", session_id))
    }

    /// Save session to JSON file
    pub async fn save(&self, session: &Session) -> Result<()> {
        let path = self.path_for(&session.id);
        let json = serde_json::to_string_pretty(session)?;
        tokio::fs::write(&path, json)
            .await
            .with_context(|| format!("Failed to save session: {:?}", path))?;
        info!(session = %session.id, entries = session.history.len(), "Session saved");
        Ok(())
    }

    /// Load session from JSON file
    pub async fn load(&self, session_id: &str) -> Result<Session> {
        let path = self.path_for(session_id);
        let json = tokio::fs::read_to_string(&path)
            .await
            .with_context(|| format!("Failed to load session: {:?}", path))?;
        let session: Session = serde_json::from_str(&json)
            .with_context(|| format!("Malformed session file: {:?}", path))?;
        info!(session = %session.id, entries = session.history.len(), "Session resumed");
        Ok(session)
    }

    /// List all session IDs, sorted
    pub async fn list_sessions(&self) -> Result<Vec<String>> {
        let mut sessions = Vec::new();
        let mut entries = tokio::fs::read_dir(&self.base_path)
            .await
            .with_context(|| format!("Failed to read session dir: {:?}", self.base_path))?;
        while let Some(entry) = entries.next_entry().await? {
            if let Some(name) = entry.file_name().to_str() {
                if let Some(id) = name.strip_suffix(".json") {
                    sessions.push(id.to_string());
                }
            }
        }
        sessions.sort();
        Ok(sessions)
    }
}
