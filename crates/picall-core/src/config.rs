use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::errors::PicallError;

pub const CONFIG_FILE: &str = "config.json";

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct ClientConfig {
    #[serde(default)]
    pub homeserver: String,
    #[serde(default)]
    pub user_id: String,
    #[serde(default)]
    pub password: Option<String>,
    /// Room made active right after login.
    #[serde(default)]
    pub initial_room: Option<String>,
    #[serde(default = "default_sync_interval_ms")]
    pub sync_interval_ms: u64,
    #[serde(default = "default_sync_timeout_ms")]
    pub sync_timeout_ms: u64,
    #[serde(default = "default_history_page_size")]
    pub history_page_size: u32,
    #[serde(default = "default_history_capacity")]
    pub history_capacity: usize,
    #[serde(default = "default_call_lifetime_ms")]
    pub call_lifetime_ms: u64,
    /// STUN/TURN urls handed to the peer connection.
    #[serde(default = "default_ice_servers")]
    pub ice_servers: Vec<String>,
}

fn default_sync_interval_ms() -> u64 {
    500
}

fn default_sync_timeout_ms() -> u64 {
    200
}

fn default_history_page_size() -> u32 {
    crate::history::HISTORY_PAGE_SIZE
}

fn default_history_capacity() -> usize {
    crate::history::HISTORY_CAPACITY
}

fn default_call_lifetime_ms() -> u64 {
    crate::signaling::INVITE_LIFETIME_MS
}

fn default_ice_servers() -> Vec<String> {
    vec!["stun:stun.l.google.com:19302".to_string()]
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            homeserver: String::new(),
            user_id: String::new(),
            password: None,
            initial_room: None,
            sync_interval_ms: default_sync_interval_ms(),
            sync_timeout_ms: default_sync_timeout_ms(),
            history_page_size: default_history_page_size(),
            history_capacity: default_history_capacity(),
            call_lifetime_ms: default_call_lifetime_ms(),
            ice_servers: default_ice_servers(),
        }
    }
}

impl ClientConfig {
    /// Config file location inside a platform config directory.
    pub fn path_in(config_dir: &Path) -> PathBuf {
        config_dir.join("picall").join(CONFIG_FILE)
    }

    /// Read the config at `path`. A missing or unreadable file yields the
    /// defaults.
    pub fn load(path: &Path) -> Self {
        match std::fs::read_to_string(path) {
            Ok(contents) => serde_json::from_str(&contents).unwrap_or_else(|e| {
                tracing::warn!("ignoring malformed config {}: {e}", path.display());
                Self::default()
            }),
            Err(_) => Self::default(),
        }
    }

    pub fn save(&self, path: &Path) -> Result<(), PicallError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(self)
            .map_err(|e| PicallError::Config(e.to_string()))?;
        std::fs::write(path, json)?;
        Ok(())
    }

    /// Apply `PICALL_*` overrides read through `lookup`.
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(v) = lookup("PICALL_HOMESERVER") {
            self.homeserver = v;
        }
        if let Some(v) = lookup("PICALL_USER") {
            self.user_id = v;
        }
        if let Some(v) = lookup("PICALL_PASSWORD") {
            self.password = Some(v);
        }
        if let Some(v) = lookup("PICALL_ROOM") {
            self.initial_room = Some(v);
        }
    }

    pub fn validate(&self) -> Result<(), PicallError> {
        if self.homeserver.trim().is_empty() {
            return Err(PicallError::Config("homeserver is not set".into()));
        }
        if !self.user_id.starts_with('@') || !self.user_id.contains(':') {
            return Err(PicallError::Config(format!(
                "user id '{}' is not of the form @name:server",
                self.user_id
            )));
        }
        if self.sync_interval_ms == 0 {
            return Err(PicallError::Config("sync_interval_ms must be positive".into()));
        }
        if self.history_page_size == 0 {
            return Err(PicallError::Config("history_page_size must be positive".into()));
        }
        if self.history_capacity == 0 {
            return Err(PicallError::Config("history_capacity must be positive".into()));
        }
        Ok(())
    }
}
