use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use thiserror::Error;

const STATE_FILE_NAME: &str = "operator_agent.json";

const DEFAULT_MODEL: &str = "gpt-4.1";
const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";
const DEFAULT_TABLE_NAME: &str = "TestTable";
const DEFAULT_BRIDGE_URL: &str = "http://127.0.0.1:34115";
const DEFAULT_BIND_ADDR: &str = "0.0.0.0:8000";
const DEFAULT_MAX_ACTIONS: u32 = 30;
const DEFAULT_KEEPALIVE_SECS: u64 = 30;

/// Prefix used for placeholder store ids; such stores never enable file search.
pub const MOCK_VECTOR_STORE_PREFIX: &str = "vs_mock_";

#[derive(Error, Debug)]
pub enum SettingsError {
    #[error("State file error: {0}")]
    Io(#[from] std::io::Error),
    #[error("State file is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Invalid value for {var}: {value}")]
    InvalidValue { var: &'static str, value: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "UPPERCASE")]
pub enum ComputerMode {
    #[default]
    Mock,
    Live,
}

impl ComputerMode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Mock => "MOCK",
            Self::Live => "LIVE",
        }
    }
}

impl fmt::Display for ComputerMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ComputerMode {
    type Err = SettingsError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "MOCK" => Ok(Self::Mock),
            "LIVE" => Ok(Self::Live),
            _ => Err(SettingsError::InvalidValue {
                var: "COMPUTER_MODE",
                value: s.to_string(),
            }),
        }
    }
}

/// Record-store credentials. Only constructed when all three are present.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AirtableCredentials {
    pub api_key: String,
    pub base_id: String,
    pub table_name: String,
}

/// Process-wide configuration. Built once at startup, then shared read-only.
#[derive(Debug, Clone)]
pub struct Settings {
    pub openai_api_key: Option<String>,
    pub openai_model: String,
    pub openai_base_url: String,
    pub vector_store_id: Option<String>,
    pub airtable: Option<AirtableCredentials>,
    pub computer_mode: ComputerMode,
    pub computer_bridge_url: String,
    pub max_actions_per_run: u32,
    pub sandbox_dir: Option<PathBuf>,
    pub bind_addr: String,
    pub state_dir: PathBuf,
    pub keepalive_secs: u64,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct PersistedState {
    #[serde(skip_serializing_if = "Option::is_none")]
    vector_store_id: Option<String>,
    #[serde(flatten)]
    extra: serde_json::Map<String, serde_json::Value>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            openai_api_key: None,
            openai_model: DEFAULT_MODEL.to_string(),
            openai_base_url: DEFAULT_BASE_URL.to_string(),
            vector_store_id: None,
            airtable: None,
            computer_mode: ComputerMode::Mock,
            computer_bridge_url: DEFAULT_BRIDGE_URL.to_string(),
            max_actions_per_run: DEFAULT_MAX_ACTIONS,
            sandbox_dir: None,
            bind_addr: DEFAULT_BIND_ADDR.to_string(),
            state_dir: PathBuf::from(".state"),
            keepalive_secs: DEFAULT_KEEPALIVE_SECS,
        }
    }
}

impl Settings {
    /// Load `.env`, then the process environment, then the local state file.
    pub fn load() -> Result<Self, SettingsError> {
        if let Ok(path) = dotenvy::dotenv() {
            tracing::debug!("[settings] loaded {}", path.display());
        }
        let env: HashMap<String, String> = std::env::vars().collect();
        Self::from_lookup(|key| env.get(key).cloned())
    }

    /// Build settings from any key lookup. Blank values count as absent.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, SettingsError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        let defaults = Self::default();

        let computer_mode = match get("COMPUTER_MODE") {
            Some(v) => v.parse()?,
            None => ComputerMode::Mock,
        };

        let max_actions_per_run = match get("COMPUTER_MAX_ACTIONS") {
            Some(v) => v.trim().parse().map_err(|_| SettingsError::InvalidValue {
                var: "COMPUTER_MAX_ACTIONS",
                value: v.clone(),
            })?,
            None => DEFAULT_MAX_ACTIONS,
        };

        let keepalive_secs = match get("WS_KEEPALIVE_SECS") {
            Some(v) => v.trim().parse().map_err(|_| SettingsError::InvalidValue {
                var: "WS_KEEPALIVE_SECS",
                value: v.clone(),
            })?,
            None => DEFAULT_KEEPALIVE_SECS,
        };

        // all-or-nothing: a partial credential set leaves the capability off
        let airtable = match (
            get("AIRTABLE_API_KEY"),
            get("AIRTABLE_BASE_ID"),
            get("AIRTABLE_TABLE_NAME").unwrap_or_else(|| DEFAULT_TABLE_NAME.to_string()),
        ) {
            (Some(api_key), Some(base_id), table_name) => Some(AirtableCredentials {
                api_key,
                base_id,
                table_name,
            }),
            _ => None,
        };

        let mut settings = Self {
            openai_api_key: get("OPENAI_API_KEY"),
            openai_model: get("OPENAI_MODEL").unwrap_or(defaults.openai_model),
            openai_base_url: get("OPENAI_BASE_URL")
                .map(|u| u.trim_end_matches('/').to_string())
                .unwrap_or(defaults.openai_base_url),
            vector_store_id: get("OPENAI_VECTOR_STORE_ID"),
            airtable,
            computer_mode,
            computer_bridge_url: get("COMPUTER_BRIDGE_URL")
                .map(|u| u.trim_end_matches('/').to_string())
                .unwrap_or(defaults.computer_bridge_url),
            max_actions_per_run,
            sandbox_dir: get("MCP_SANDBOX_DIR").map(PathBuf::from),
            bind_addr: get("OPERATOR_BIND_ADDR").unwrap_or(defaults.bind_addr),
            state_dir: get("OPERATOR_STATE_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.state_dir),
            keepalive_secs,
        };

        if settings.vector_store_id.is_none() {
            match read_state(&settings.state_file()) {
                Ok(state) => settings.vector_store_id = state.vector_store_id,
                Err(e) => tracing::warn!("[settings] ignoring unreadable state file: {}", e),
            }
        }

        Ok(settings)
    }

    pub fn state_file(&self) -> PathBuf {
        self.state_dir.join(STATE_FILE_NAME)
    }

    pub fn has_openai(&self) -> bool {
        self.openai_api_key.is_some()
    }

    pub fn has_vector_store(&self) -> bool {
        self.vector_store_id.is_some()
    }

    pub fn has_airtable(&self) -> bool {
        self.airtable.is_some()
    }

    /// File search needs a credential and a real (non-placeholder) store.
    pub fn file_search_enabled(&self) -> bool {
        self.has_openai()
            && self
                .vector_store_id
                .as_deref()
                .is_some_and(|id| !id.starts_with(MOCK_VECTOR_STORE_PREFIX))
    }

    /// Persist a store id to the state file and return the updated settings.
    /// Unrelated keys already in the file are preserved.
    pub fn with_persisted_vector_store(mut self, store_id: &str) -> Result<Self, SettingsError> {
        let path = self.state_file();
        let mut state = read_state(&path).unwrap_or_default();
        state.vector_store_id = Some(store_id.to_string());

        std::fs::create_dir_all(&self.state_dir)?;
        std::fs::write(&path, serde_json::to_string_pretty(&state)?)?;

        self.vector_store_id = Some(store_id.to_string());
        Ok(self)
    }
}

fn read_state(path: &Path) -> Result<PersistedState, SettingsError> {
    if !path.exists() {
        return Ok(PersistedState::default());
    }
    let raw = std::fs::read_to_string(path)?;
    Ok(serde_json::from_str(&raw)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults_without_environment() {
        let dir = tempfile::tempdir().unwrap();
        let state = dir.path().to_string_lossy().to_string();
        let settings = Settings::from_lookup(lookup_from(&[("OPERATOR_STATE_DIR", &state)])).unwrap();
        assert!(!settings.has_openai());
        assert!(!settings.has_airtable());
        assert!(!settings.has_vector_store());
        assert_eq!(settings.computer_mode, ComputerMode::Mock);
        assert_eq!(settings.max_actions_per_run, 30);
        assert_eq!(settings.computer_bridge_url, "http://127.0.0.1:34115");
    }

    #[test]
    fn test_airtable_is_all_or_nothing() {
        let partial = Settings::from_lookup(lookup_from(&[("AIRTABLE_API_KEY", "key")])).unwrap();
        assert!(!partial.has_airtable());

        let full = Settings::from_lookup(lookup_from(&[
            ("AIRTABLE_API_KEY", "key"),
            ("AIRTABLE_BASE_ID", "app123"),
        ]))
        .unwrap();
        let creds = full.airtable.unwrap();
        assert_eq!(creds.table_name, "TestTable");
    }

    #[test]
    fn test_blank_values_are_absent() {
        let settings = Settings::from_lookup(lookup_from(&[("OPENAI_API_KEY", "   ")])).unwrap();
        assert!(!settings.has_openai());
    }

    #[test]
    fn test_invalid_computer_mode_rejected() {
        let result = Settings::from_lookup(lookup_from(&[("COMPUTER_MODE", "REMOTE")]));
        assert!(matches!(result, Err(SettingsError::InvalidValue { var: "COMPUTER_MODE", .. })));
        let live = Settings::from_lookup(lookup_from(&[("COMPUTER_MODE", "live")])).unwrap();
        assert_eq!(live.computer_mode, ComputerMode::Live);
    }

    #[test]
    fn test_mock_store_disables_file_search() {
        let settings = Settings::from_lookup(lookup_from(&[
            ("OPENAI_API_KEY", "sk-test"),
            ("OPENAI_VECTOR_STORE_ID", "vs_mock_123"),
        ]))
        .unwrap();
        assert!(settings.has_vector_store());
        assert!(!settings.file_search_enabled());
    }

    #[test]
    fn test_persisted_store_id_is_reloaded() {
        let dir = tempfile::tempdir().unwrap();
        let state = dir.path().join("state").to_string_lossy().to_string();
        let lookup = lookup_from(&[("OPERATOR_STATE_DIR", &state), ("OPENAI_API_KEY", "sk-test")]);

        let settings = Settings::from_lookup(&lookup).unwrap();
        assert!(settings.vector_store_id.is_none());
        let settings = settings.with_persisted_vector_store("vs_abc").unwrap();
        assert_eq!(settings.vector_store_id.as_deref(), Some("vs_abc"));

        let reloaded = Settings::from_lookup(&lookup).unwrap();
        assert_eq!(reloaded.vector_store_id.as_deref(), Some("vs_abc"));
        assert!(reloaded.file_search_enabled());
    }
}
