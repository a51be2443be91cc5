//! Session identity and the values exchanged around `start`.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::Serialize;

/// Who is being recorded, as far as this tracker knows.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SessionIdentity {
    /// Set only after a successful negotiation
    pub session_id: Option<String>,
    pub session_token: Option<String>,
    pub user_uuid: Option<String>,
    pub user_id: Option<String>,
    pub metadata: BTreeMap<String, String>,
}

/// Options for a single `start` call.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StartOptions {
    pub user_id: Option<String>,
    pub metadata: BTreeMap<String, String>,
    /// Ask the ingest service for a brand new session
    pub force_new: bool,
}

impl StartOptions {
    pub fn force_new() -> Self {
        Self {
            force_new: true,
            ..Default::default()
        }
    }

    pub fn with_user_id(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }
}

/// What a successful `start` resolves to.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OnStartInfo {
    #[serde(rename = "sessionID")]
    pub session_id: Option<String>,
    pub session_token: String,
    #[serde(rename = "userUUID")]
    pub user_uuid: String,
}

/// Hook run after every successful start.
pub type OnStartHook = Arc<dyn Fn(&OnStartInfo) + Send + Sync>;

/// Snapshot returned by `App::session_info`.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionInfo {
    #[serde(rename = "sessionID")]
    pub session_id: Option<String>,
    pub metadata: BTreeMap<String, String>,
    #[serde(rename = "userUUID")]
    pub user_uuid: Option<String>,
    pub project_key: String,
    #[serde(rename = "revID")]
    pub rev_id: String,
    pub timestamp: i64,
    pub tracker_version: String,
    #[serde(rename = "userID")]
    pub user_id: Option<String>,
    pub is_snippet: bool,
}
