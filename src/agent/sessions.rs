//! Persistent conversation sessions
//!
//! A continuation token is a session id. Each session is one JSON file under
//! the configured directory and holds only the user questions and the final
//! answers, never the intermediate plan, schema or code turns.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::state::{Speaker, Turn};

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub dir: PathBuf,
}

impl Default for SessionConfig {
    fn default() -> Self {
        let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
        Self {
            dir: PathBuf::from(home).join(".civic-audit").join("sessions"),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("unknown continuation token: {0}")]
    NotFound(String),

    #[error("malformed continuation token: {0}")]
    InvalidToken(String),

    #[error("session storage error: {0}")]
    Io(#[from] std::io::Error),

    #[error("corrupt session file: {0}")]
    Corrupt(#[from] serde_json::Error),
}

/// A saved conversation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub id: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// First question asked in this session
    pub title: String,
    pub turns: Vec<Turn>,
    /// Question/answer pairs recorded so far
    pub exchanges: usize,
}

impl Session {
    pub fn new(title: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: uuid::Uuid::now_v7().to_string(),
            created_at: now,
            updated_at: now,
            title: title.into(),
            turns: Vec::new(),
            exchanges: 0,
        }
    }

    /// Record one finished question and its answer
    pub fn record_exchange(&mut self, question: impl Into<String>, answer: impl Into<String>) {
        self.turns.push(Turn::user(question));
        self.turns.push(Turn::assistant(answer));
        self.exchanges += 1;
        self.updated_at = Utc::now();
    }

    /// Turns to seed the next request with
    pub fn history(&self) -> Vec<Turn> {
        self.turns
            .iter()
            .filter(|t| t.speaker != Speaker::Context)
            .cloned()
            .collect()
    }
}

/// Listing entry
#[derive(Debug, Clone, Serialize)]
pub struct SessionSummary {
    pub id: String,
    pub title: String,
    pub updated_at: DateTime<Utc>,
    pub exchanges: usize,
}

pub struct SessionStore {
    base_dir: PathBuf,
}

impl SessionStore {
    pub fn new(base_dir: impl Into<PathBuf>) -> Result<Self, SessionError> {
        let base_dir = base_dir.into();
        std::fs::create_dir_all(&base_dir)?;
        Ok(Self { base_dir })
    }

    pub fn from_config(config: &SessionConfig) -> Result<Self, SessionError> {
        Self::new(&config.dir)
    }

    pub fn dir(&self) -> &Path {
        &self.base_dir
    }

    /// Write through a temp file so a crash never leaves half a session
    pub fn save(&self, session: &Session) -> Result<(), SessionError> {
        let path = self.session_path(&session.id)?;
        let tmp = path.with_extension("json.tmp");
        let json = serde_json::to_string_pretty(session)?;
        std::fs::write(&tmp, json)?;
        std::fs::rename(&tmp, &path)?;
        Ok(())
    }

    pub fn load(&self, token: &str) -> Result<Session, SessionError> {
        let path = self.session_path(token)?;
        let json = match std::fs::read_to_string(&path) {
            Ok(json) => json,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(SessionError::NotFound(token.to_string()))
            }
            Err(e) => return Err(e.into()),
        };
        Ok(serde_json::from_str(&json)?)
    }

    /// Newest first; unreadable files are skipped
    pub fn list(&self) -> Result<Vec<SessionSummary>, SessionError> {
        let mut sessions = Vec::new();
        for entry in std::fs::read_dir(&self.base_dir)? {
            let path = entry?.path();
            if path.extension().map(|e| e == "json").unwrap_or(false) {
                match load_from_path(&path) {
                    Ok(session) => sessions.push(SessionSummary {
                        id: session.id,
                        title: truncate(&session.title, 50),
                        updated_at: session.updated_at,
                        exchanges: session.exchanges,
                    }),
                    Err(e) => {
                        tracing::warn!(path = %path.display(), error = %e, "Skipping unreadable session")
                    }
                }
            }
        }
        sessions.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        Ok(sessions)
    }

    pub fn delete(&self, token: &str) -> Result<(), SessionError> {
        let path = self.session_path(token)?;
        match std::fs::remove_file(path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(SessionError::NotFound(token.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Tokens are UUIDs; anything else could escape the directory
    fn session_path(&self, token: &str) -> Result<PathBuf, SessionError> {
        let id = uuid::Uuid::parse_str(token)
            .map_err(|_| SessionError::InvalidToken(token.to_string()))?;
        Ok(self.base_dir.join(format!("{}.json", id)))
    }
}

fn load_from_path(path: &Path) -> Result<Session, SessionError> {
    let json = std::fs::read_to_string(path)?;
    Ok(serde_json::from_str(&json)?)
}

fn truncate(s: &str, max_chars: usize) -> String {
    if s.chars().count() <= max_chars {
        s.to_string()
    } else {
        let head: String = s.chars().take(max_chars - 3).collect();
        format!("{}...", head)
    }
}
