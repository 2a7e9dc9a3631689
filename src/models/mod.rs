//! Data models for boxterm
//!
//! Container and language definitions, the client status protocol, and HTTP
//! response bodies.

use std::collections::{BTreeSet, HashMap};
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

// ============================================================================
// Container Models
// ============================================================================

/// What to run inside a sandbox
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerConfig {
    /// Image reference
    pub image: String,

    /// Entrypoint arguments; empty means the image default
    #[serde(rename = "cmd", default)]
    pub command: Vec<String>,
}

/// Container pair for one language
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Language {
    /// Runs an uploaded file at `/code`
    pub run: ContainerConfig,

    /// Free-form interactive shell
    pub term: ContainerConfig,
}

/// Language table, loaded once at startup
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Languages(HashMap<String, Language>);

impl Languages {
    /// Load the language table from a JSON file
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read languages file {}", path.display()))?;
        Self::from_json(&raw)
            .with_context(|| format!("Invalid languages file {}", path.display()))
    }

    /// Parse and validate a language table
    pub fn from_json(raw: &str) -> Result<Self> {
        let languages: Languages = serde_json::from_str(raw).context("Malformed language JSON")?;
        languages.validate()?;
        Ok(languages)
    }

    fn validate(&self) -> Result<()> {
        if self.0.is_empty() {
            anyhow::bail!("No languages configured");
        }

        for (name, language) in &self.0 {
            if language.run.image.trim().is_empty() || language.term.image.trim().is_empty() {
                anyhow::bail!("Language {name:?} has an empty image");
            }
        }

        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&Language> {
        self.0.get(name)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Every distinct image referenced by any language, sorted
    pub fn images(&self) -> BTreeSet<&str> {
        self.0
            .values()
            .flat_map(|l| [l.run.image.as_str(), l.term.image.as_str()])
            .collect()
    }
}

impl FromIterator<(String, Language)> for Languages {
    fn from_iter<I: IntoIterator<Item = (String, Language)>>(iter: I) -> Self {
        Languages(iter.into_iter().collect())
    }
}

// ============================================================================
// Status Protocol
// ============================================================================

/// Session progress as reported to the client
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    Starting,
    Ready,
    Uploading,
    Running,
    Error,
}

/// JSON status frame sent over the session WebSocket
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusUpdate {
    pub status: Status,

    #[serde(rename = "err", default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl StatusUpdate {
    pub fn new(status: Status) -> Self {
        Self {
            status,
            error: None,
        }
    }

    pub fn error(err: impl ToString) -> Self {
        Self {
            status: Status::Error,
            error: Some(err.to_string()),
        }
    }
}

// ============================================================================
// HTTP Models
// ============================================================================

/// Health check response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: HealthStatus,
    pub version: String,
    pub uptime_seconds: u64,
    pub active_sessions: u64,
    pub languages: usize,
    #[serde(default)]
    pub engine_version: Option<String>,
}

/// Health status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Degraded,
}

/// Error response body
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
    pub message: String,
}

impl ErrorResponse {
    pub fn new(error: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            error: error.into(),
            message: message.into(),
        }
    }
}
