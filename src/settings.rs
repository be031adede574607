//! Typed runtime settings.
//!
//! A process-wide property map with registered defaults, optionally
//! overridden from a TOML file and from `VDEPOT_*` environment variables.
//! The map is passed down explicitly as part of the application context;
//! [`Settings::install`] is the install-once helper used by service entry
//! points.

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, OnceLock, RwLock};

use serde::Deserialize;

/// A single typed setting value.
#[derive(Debug, Clone, PartialEq)]
pub enum SettingValue {
    Bool(bool),
    Int(i32),
    Str(String),
}

/// One depot-server rewrite entry: connections whose port matches `pattern`
/// (case-insensitive regex) are redirected to `address`.
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct ServerRewrite {
    pub pattern: String,
    pub address: String,
}

/// Well-known setting names.
pub mod keys {
    pub const ALLOW_SYMLINK_RESIDENCY_POLICY: &str = "AllowSymlinkResidencyPolicy";
    pub const CREATE_FILE_RETRY_COUNT: &str = "CreateFileRetryCount";
    pub const CREATE_FILE_RETRY_WAIT_MS: &str = "CreateFileRetryWaitMs";
    pub const DEFAULT_FLUSH_TYPE: &str = "DefaultFlushType";
    pub const DEPOT_CLIENT_CACHE_IDLE_TIMEOUT_MS: &str = "DepotClientCacheIdleTimeoutMs";
    pub const EXCLUDED_PROCESS_NAMES: &str = "ExcludedProcessNames";
    pub const FILE_LOGGER_LOCAL_DIRECTORY: &str = "FileLoggerLocalDirectory";
    pub const GARBAGE_COLLECT_PERIOD_MS: &str = "GarbageCollectPeriodMs";
    pub const INTERACTIVE_LOGIN_COMMAND: &str = "InteractiveLoginCommand";
    pub const MAX_SYNC_CONNECTIONS: &str = "MaxSyncConnections";
    pub const POOL_DEFAULT_NUMBER_OF_THREADS: &str = "PoolDefaultNumberOfThreads";
    pub const POPULATE_METHOD: &str = "PopulateMethod";
    pub const SHARE_MODE_DURING_HYDRATION: &str = "ShareModeDuringHydration";
    pub const SANITIZE_ATTRIBUTES: &str = "SanitizeAttributes";
    pub const SYNC_RESIDENT_PATTERN: &str = "SyncResidentPattern";
    pub const UNATTENDED: &str = "Unattended";
    pub const VERBOSITY: &str = "Verbosity";
}

/// Process-wide typed property map.
#[derive(Debug)]
pub struct Settings {
    values: RwLock<HashMap<String, SettingValue>>,
    server_rewrites: RwLock<Vec<ServerRewrite>>,
}

impl Default for Settings {
    fn default() -> Self {
        Self::new()
    }
}

impl Settings {
    /// Creates a settings map populated with the registered defaults.
    pub fn new() -> Self {
        use keys::*;
        let mut values = HashMap::new();
        let mut set = |k: &str, v: SettingValue| {
            values.insert(k.to_string(), v);
        };
        set(ALLOW_SYMLINK_RESIDENCY_POLICY, SettingValue::Bool(false));
        set(CREATE_FILE_RETRY_COUNT, SettingValue::Int(8));
        set(CREATE_FILE_RETRY_WAIT_MS, SettingValue::Int(250));
        set(DEFAULT_FLUSH_TYPE, SettingValue::Str("Atomic".to_string()));
        set(DEPOT_CLIENT_CACHE_IDLE_TIMEOUT_MS, SettingValue::Int(5 * 60 * 1000));
        set(EXCLUDED_PROCESS_NAMES, SettingValue::Str(String::new()));
        set(FILE_LOGGER_LOCAL_DIRECTORY, SettingValue::Str(String::new()));
        set(GARBAGE_COLLECT_PERIOD_MS, SettingValue::Int(5 * 60 * 1000));
        set(INTERACTIVE_LOGIN_COMMAND, SettingValue::Str(String::new()));
        set(MAX_SYNC_CONNECTIONS, SettingValue::Int(8));
        set(POOL_DEFAULT_NUMBER_OF_THREADS, SettingValue::Int(8));
        set(POPULATE_METHOD, SettingValue::Str("Stream".to_string()));
        set(SHARE_MODE_DURING_HYDRATION, SettingValue::Bool(false));
        set(SANITIZE_ATTRIBUTES, SettingValue::Bool(true));
        set(SYNC_RESIDENT_PATTERN, SettingValue::Str(String::new()));
        set(UNATTENDED, SettingValue::Bool(false));
        set(VERBOSITY, SettingValue::Str("info".to_string()));

        let settings = Self {
            values: RwLock::new(values),
            server_rewrites: RwLock::new(Vec::new()),
        };
        settings.apply_env();
        settings
    }

    /// Install-once helper for service entry points. Later callers receive
    /// the same instance; explicit contexts should still be preferred over
    /// reaching for this.
    pub fn install() -> Arc<Settings> {
        static INSTALLED: OnceLock<Arc<Settings>> = OnceLock::new();
        INSTALLED.get_or_init(|| Arc::new(Settings::new())).clone()
    }

    /// Overrides registered values from `VDEPOT_<NAME>` environment
    /// variables, keeping the registered type of each property.
    fn apply_env(&self) {
        let names: Vec<String> = self.values.read().unwrap().keys().cloned().collect();
        for name in names {
            if let Ok(text) = std::env::var(format!("VDEPOT_{}", name.to_uppercase())) {
                self.set_from_text(&name, &text);
            }
        }
    }

    /// Loads overrides and depot-server rewrite entries from a TOML file.
    /// Unknown keys are ignored with a warning; the registered type wins.
    pub fn load_file(&self, path: &Path) -> std::io::Result<()> {
        #[derive(Deserialize)]
        struct FileFormat {
            #[serde(default)]
            settings: HashMap<String, toml::Value>,
            #[serde(default)]
            depot_server: Vec<ServerRewrite>,
        }

        let text = std::fs::read_to_string(path)?;
        let parsed: FileFormat = toml::from_str(&text)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;

        for (name, value) in parsed.settings {
            let known = self.values.read().unwrap().contains_key(&name);
            if !known {
                tracing::warn!(name, "ignoring unknown setting");
                continue;
            }
            match value {
                toml::Value::Boolean(b) => self.set(&name, SettingValue::Bool(b)),
                toml::Value::Integer(i) => self.set(&name, SettingValue::Int(i as i32)),
                toml::Value::String(s) => self.set_from_text(&name, &s),
                other => tracing::warn!(name, ?other, "unsupported setting value type"),
            }
        }
        if !parsed.depot_server.is_empty() {
            *self.server_rewrites.write().unwrap() = parsed.depot_server;
        }
        Ok(())
    }

    /// Sets a value from text, coerced to the property's registered type.
    pub fn set_from_text(&self, name: &str, text: &str) {
        let coerced = match self.values.read().unwrap().get(name) {
            Some(SettingValue::Bool(_)) => {
                SettingValue::Bool(matches!(text.trim(), "1" | "true" | "True" | "TRUE"))
            }
            Some(SettingValue::Int(old)) => SettingValue::Int(text.trim().parse().unwrap_or(*old)),
            _ => SettingValue::Str(text.to_string()),
        };
        self.set(name, coerced);
    }

    pub fn set(&self, name: &str, value: SettingValue) {
        self.values.write().unwrap().insert(name.to_string(), value);
    }

    pub fn get_bool(&self, name: &str) -> bool {
        match self.values.read().unwrap().get(name) {
            Some(SettingValue::Bool(b)) => *b,
            _ => false,
        }
    }

    pub fn get_i32(&self, name: &str) -> i32 {
        match self.values.read().unwrap().get(name) {
            Some(SettingValue::Int(i)) => *i,
            _ => 0,
        }
    }

    pub fn get_str(&self, name: &str) -> String {
        match self.values.read().unwrap().get(name) {
            Some(SettingValue::Str(s)) => s.clone(),
            _ => String::new(),
        }
    }

    /// The configured depot-server rewrite entries, first match wins.
    pub fn server_rewrites(&self) -> Vec<ServerRewrite> {
        self.server_rewrites.read().unwrap().clone()
    }

    pub fn set_server_rewrites(&self, entries: Vec<ServerRewrite>) {
        *self.server_rewrites.write().unwrap() = entries;
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_registered_defaults() {
        let s = Settings::new();
        assert_eq!(s.get_i32(keys::CREATE_FILE_RETRY_COUNT), 8);
        assert_eq!(s.get_i32(keys::CREATE_FILE_RETRY_WAIT_MS), 250);
        assert_eq!(s.get_i32(keys::MAX_SYNC_CONNECTIONS), 8);
        assert_eq!(s.get_i32(keys::DEPOT_CLIENT_CACHE_IDLE_TIMEOUT_MS), 300_000);
        assert_eq!(s.get_str(keys::POPULATE_METHOD), "Stream");
        assert!(!s.get_bool(keys::SHARE_MODE_DURING_HYDRATION));
        assert!(!s.get_bool(keys::UNATTENDED));
    }

    #[test]
    fn test_text_coercion_keeps_type() {
        let s = Settings::new();
        s.set_from_text(keys::MAX_SYNC_CONNECTIONS, "12");
        assert_eq!(s.get_i32(keys::MAX_SYNC_CONNECTIONS), 12);
        s.set_from_text(keys::UNATTENDED, "true");
        assert!(s.get_bool(keys::UNATTENDED));
        s.set_from_text(keys::MAX_SYNC_CONNECTIONS, "not-a-number");
        assert_eq!(s.get_i32(keys::MAX_SYNC_CONNECTIONS), 12);
    }

    #[test]
    fn test_load_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vdepot.toml");
        std::fs::write(
            &path,
            r#"
[settings]
MaxSyncConnections = 4
PopulateMethod = "Move"

[[depot_server]]
pattern = "ssl:(.*):1666"
address = "edge.internal:1666"
"#,
        )
        .unwrap();

        let s = Settings::new();
        s.load_file(&path).unwrap();
        assert_eq!(s.get_i32(keys::MAX_SYNC_CONNECTIONS), 4);
        assert_eq!(s.get_str(keys::POPULATE_METHOD), "Move");
        assert_eq!(s.server_rewrites().len(), 1);
        assert_eq!(s.server_rewrites()[0].address, "edge.internal:1666");
    }
}
