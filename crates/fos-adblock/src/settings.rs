//! Persistence and configuration
//!
//! - `adblock_settings.json`: flags, whitelist, installed lists, custom rules
//! - `filters/<xxh3(id)>.txt`: last good body of every list, so lists are
//!   usable at startup before any refresh
//! - Bundled TOML catalog of known subscriptions
//!
//! Read failures fall back to defaults at the call site; write failures are
//! reported but never fatal.

use crate::filter_list::ListSource;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info};
use xxhash_rust::xxh3::xxh3_64;

/// Settings file name inside the data directory
pub const SETTINGS_FILE: &str = "adblock_settings.json";

/// Bundled subscription catalog
pub const DEFAULT_CATALOG: &str = include_str!("../resources/filter_lists.toml");

/// Bundled built-in rules
pub const DEFAULT_RULES: &str = include_str!("../resources/default_rules.txt");

/// Id of the built-in list
pub const BUILTIN_LIST_ID: &str = "default";

/// Default auto-update interval in hours
pub const DEFAULT_UPDATE_INTERVAL_HOURS: u32 = 24;

/// Errors reading or writing persisted state
#[derive(Debug, Error)]
pub enum SettingsError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML error: {0}")]
    Toml(#[from] toml::de::Error),
}

/// Persisted engine settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Settings {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub aggressive_blocking: bool,
    /// Hours between subscription refreshes
    #[serde(default = "default_update_interval")]
    pub auto_update_interval: u32,
    #[serde(default)]
    pub whitelist: Vec<String>,
    #[serde(default)]
    pub filter_lists: Vec<FilterListSettings>,
    #[serde(default)]
    pub custom_rules: Vec<String>,
    /// Custom rules kept but switched off
    #[serde(default)]
    pub disabled_custom_rules: Vec<String>,
    /// The bundled list was uninstalled and stays out on restart
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub removed_builtin: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            enabled: true,
            aggressive_blocking: false,
            auto_update_interval: DEFAULT_UPDATE_INTERVAL_HOURS,
            whitelist: Vec::new(),
            filter_lists: Vec::new(),
            custom_rules: Vec::new(),
            disabled_custom_rules: Vec::new(),
            removed_builtin: false,
        }
    }
}

/// One installed list
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FilterListSettings {
    /// Defaults to `url` when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub name: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub version: String,
    #[serde(default, deserialize_with = "lenient_time")]
    pub last_update: Option<DateTime<Utc>>,
    #[serde(default, deserialize_with = "lenient_time", skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<ListSource>,
}

impl FilterListSettings {
    /// Stable list id
    pub fn list_id(&self) -> &str {
        match &self.id {
            Some(id) if !id.is_empty() => id,
            _ => &self.url,
        }
    }

    /// Entries without an explicit source are subscriptions when they carry a URL
    pub fn list_source(&self) -> ListSource {
        match self.source {
            Some(source) => source,
            None if !self.url.is_empty() => ListSource::Subscription,
            None => ListSource::User,
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_update_interval() -> u32 {
    DEFAULT_UPDATE_INTERVAL_HOURS
}

/// Accept RFC 3339 timestamps, `null`, and empty or unparsable strings
fn lenient_time<'de, D>(deserializer: D) -> Result<Option<DateTime<Utc>>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw: Option<String> = Option::deserialize(deserializer)?;
    Ok(raw.and_then(|s| {
        DateTime::parse_from_rfc3339(s.trim())
            .ok()
            .map(|t| t.with_timezone(&Utc))
    }))
}

impl Settings {
    /// Load settings JSON from an arbitrary file
    pub fn from_json_file(path: &Path) -> Result<Self, SettingsError> {
        let content = fs::read_to_string(path)?;
        Self::from_json(&content)
    }

    pub fn from_json(content: &str) -> Result<Self, SettingsError> {
        Ok(serde_json::from_str(content)?)
    }

    /// Write settings JSON to an arbitrary file
    pub fn to_json_file(&self, path: &Path) -> Result<(), SettingsError> {
        write_json_atomic(path, self)
    }
}

/// Serialize pretty JSON and move it into place with a rename
pub fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<(), SettingsError> {
    let json = serde_json::to_vec_pretty(value)?;
    write_atomic(path, &json)
}

/// Write to a sibling temp file, then rename over the target
pub fn write_atomic(path: &Path, data: &[u8]) -> Result<(), SettingsError> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);

    let mut file = fs::File::create(&tmp)?;
    file.write_all(data)?;
    file.sync_all()?;
    drop(file);

    fs::rename(&tmp, path)?;
    Ok(())
}

/// On-disk state of one engine
#[derive(Debug, Clone)]
pub struct SettingsStore {
    dir: PathBuf,
}

impl SettingsStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// `<data dir>/fos-wb/adblock`
    pub fn default_dir() -> PathBuf {
        dirs::data_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("fos-wb")
            .join("adblock")
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn settings_path(&self) -> PathBuf {
        self.dir.join(SETTINGS_FILE)
    }

    /// Saved settings, `None` on first run
    pub fn load(&self) -> Result<Option<Settings>, SettingsError> {
        let path = self.settings_path();
        if !path.exists() {
            return Ok(None);
        }
        let settings = Settings::from_json_file(&path)?;
        debug!("Loaded settings from {}", path.display());
        Ok(Some(settings))
    }

    pub fn save(&self, settings: &Settings) -> Result<(), SettingsError> {
        settings.to_json_file(&self.settings_path())
    }

    /// Cache file for a list body
    pub fn list_body_path(&self, id: &str) -> PathBuf {
        self.dir
            .join("filters")
            .join(format!("{:016x}.txt", xxh3_64(id.as_bytes())))
    }

    pub fn save_list_body(&self, id: &str, body: &str) -> Result<(), SettingsError> {
        write_atomic(&self.list_body_path(id), body.as_bytes())
    }

    pub fn load_list_body(&self, id: &str) -> Result<Option<String>, SettingsError> {
        let path = self.list_body_path(id);
        if !path.exists() {
            return Ok(None);
        }
        Ok(Some(fs::read_to_string(path)?))
    }

    pub fn remove_list_body(&self, id: &str) -> Result<(), SettingsError> {
        let path = self.list_body_path(id);
        if path.exists() {
            fs::remove_file(path)?;
        }
        Ok(())
    }
}

/// Known subscription
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct CatalogEntry {
    pub name: String,
    pub url: String,
    #[serde(default)]
    pub enabled_by_default: bool,
    #[serde(default)]
    pub description: String,
}

/// Subscriptions offered to the user
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct FilterCatalog {
    #[serde(default, rename = "list")]
    pub lists: Vec<CatalogEntry>,
}

impl FilterCatalog {
    /// The catalog shipped with the engine
    pub fn bundled() -> Result<Self, SettingsError> {
        Self::from_toml(DEFAULT_CATALOG)
    }

    pub fn from_toml(content: &str) -> Result<Self, SettingsError> {
        Ok(toml::from_str(content)?)
    }

    pub fn from_toml_file(path: &Path) -> Result<Self, SettingsError> {
        let content = fs::read_to_string(path)?;
        let catalog = Self::from_toml(&content)?;
        info!("Loaded {} catalog entries from {}", catalog.lists.len(), path.display());
        Ok(catalog)
    }

    pub fn find(&self, url: &str) -> Option<&CatalogEntry> {
        self.lists.iter().find(|l| l.url == url)
    }

    /// Entries subscribed on first run
    pub fn defaults(&self) -> impl Iterator<Item = &CatalogEntry> {
        self.lists.iter().filter(|l| l.enabled_by_default)
    }
}
