//! Persisted client settings.
//!
//! One JSON document under the user config dir holds every credential this
//! client caches; flows own a top-level key each (`oauth`, `pubkey`) and
//! never touch their sibling's state.

use common::{fs, Error, Result};
use log::trace;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::{Map, Value};
use std::path::{Path, PathBuf};

/// Key of the device-code flow state.
pub const OAUTH_KEY: &str = "oauth";

/// Key of the public-key flow state.
pub const PUBKEY_KEY: &str = "pubkey";

#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
/// Tokens produced by the device-code flow.
pub struct OAuthTokens {
    pub access_token: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id_token: Option<String>,
}

#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
/// Cached result of the public-key flow.
pub struct PubkeyCache {
    pub account_guid: String,
    pub jwt_token: String,
}

#[derive(Debug)]
/// The settings document, loaded once and persisted on demand.
pub struct SettingsStore {
    path: PathBuf,
    root: Map<String, Value>,
}

impl SettingsStore {
    /// Open the per-user settings store at `$HOME/.chef/settings.json`.
    pub fn open_default() -> Result<Self> {
        let home =
            dirs::home_dir().ok_or_else(|| Error::not_found("no home directory for settings"))?;
        Self::open(&home.join(".chef").join("settings.json"))
    }

    /// Open (or initialise) the settings document at `path`.
    pub fn open(path: &Path) -> Result<Self> {
        trace!("Opening settings store {}", path.display());
        let root = match std::fs::read_to_string(path) {
            Ok(text) => serde_json::from_str::<Value>(&text)
                .map_err(|e| Error::protocol(format!("parse {}: {}", path.display(), e)))?
                .as_object()
                .cloned()
                .ok_or_else(|| {
                    Error::protocol(format!("{} is not a JSON object", path.display()))
                })?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Map::new(),
            Err(e) => return Err(Error::from_io(format!("read {}", path.display()), e)),
        };
        Ok(Self {
            path: path.to_path_buf(),
            root,
        })
    }

    /// Get the value stored under a top-level key.
    pub fn get<V: DeserializeOwned>(&self, key: &str) -> Result<Option<V>> {
        match self.root.get(key) {
            None => Ok(None),
            Some(value) => serde_json::from_value(value.clone())
                .map(Some)
                .map_err(|e| Error::protocol(format!("deserialize settings key {}: {}", key, e))),
        }
    }

    /// Insert a value under a top-level key.
    pub fn insert<V: Serialize>(&mut self, key: &str, value: &V) -> Result<()> {
        let value = serde_json::to_value(value)
            .map_err(|e| Error::invalid(format!("serialize settings key {}: {}", key, e)))?;
        self.root.insert(key.to_string(), value);
        Ok(())
    }

    /// Remove a top-level key.
    pub fn remove(&mut self, key: &str) {
        self.root.remove(key);
    }

    /// Write the document back to disk, creating parent directories as
    /// needed.
    pub fn persist(&self) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::mkdir_p(parent)?;
        }
        let text = serde_json::to_string_pretty(&Value::Object(self.root.clone()))
            .map_err(|e| Error::invalid(format!("serialize settings: {}", e)))?;
        fs::write_text_file(&self.path, &text)
    }
}
