/// Configuration loading from daemon.json, environment, and validation
use crate::config::types::{DaemonConfig, DaemonError, ModuleSpec, Result};
use crate::core::signals::SignalBindings;
use crate::utils::paths::{ENV_CONFIG_PATH, SYSTEM_CONFIG_DIR};
use std::path::{Path, PathBuf};

/// File name looked up inside the configuration directory
pub const CONFIG_FILE_NAME: &str = "daemon.json";

/// Comma separated module list that replaces the configured one
pub const ENV_MODULES: &str = "AUDIOD_MODULES";

impl DaemonConfig {
    /// Load configuration from a JSON file
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            DaemonError::Config(format!(
                "Failed to read config file {}: {}",
                path.display(),
                e
            ))
        })?;

        serde_json::from_str(&content).map_err(|e| {
            DaemonError::Config(format!(
                "Failed to parse config file {}: {}",
                path.display(),
                e
            ))
        })
    }

    /// Explicit path if given, else the default file when present, else built-in defaults
    pub fn load(explicit: Option<&Path>) -> Result<Self> {
        if let Some(path) = explicit {
            return Self::load_from_file(path);
        }

        let path = default_config_path(|key| std::env::var(key).ok());
        if path.exists() {
            log::debug!("Loading configuration from {}", path.display());
            Self::load_from_file(path)
        } else {
            Ok(Self::default())
        }
    }

    /// Apply environment overrides from the process environment
    pub fn apply_env(&mut self) -> Result<()> {
        self.apply_env_from(|key| std::env::var(key).ok())
    }

    pub fn apply_env_from<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(list) = lookup(ENV_MODULES) {
            let mut modules = Vec::new();
            for entry in list.split(',').filter(|e| !e.trim().is_empty()) {
                modules.push(ModuleSpec::parse(entry).map_err(DaemonError::Config)?);
            }
            self.modules = modules;
        }
        Ok(())
    }

    /// Reject settings no later stage could act on safely
    pub fn validate(&self) -> Result<()> {
        if !(-20..=19).contains(&self.nice_level) {
            return Err(DaemonError::Config(format!(
                "nice_level {} out of range -20..=19",
                self.nice_level
            )));
        }

        if !(1..=99).contains(&self.realtime_priority) {
            return Err(DaemonError::Config(format!(
                "realtime_priority {} out of range 1..=99",
                self.realtime_priority
            )));
        }

        if let Some(module) = self.modules.iter().find(|m| m.name.trim().is_empty()) {
            return Err(DaemonError::Config(format!(
                "module with empty name (args: {:?})",
                module.args
            )));
        }

        if self.realtime_group.is_empty() {
            return Err(DaemonError::Config("realtime_group must not be empty".to_string()));
        }

        SignalBindings::from_config(&self.signal_bindings)?;
        Ok(())
    }

    /// Effective configuration as pretty JSON
    pub fn dump(&self) -> Result<String> {
        serde_json::to_string_pretty(self)
            .map_err(|e| DaemonError::Config(format!("Failed to serialize configuration: {}", e)))
    }
}

/// `$AUDIOD_CONFIG_PATH/daemon.json`, else `/etc/audiod/daemon.json`
pub fn default_config_path<F>(lookup: F) -> PathBuf
where
    F: Fn(&str) -> Option<String>,
{
    match lookup(ENV_CONFIG_PATH) {
        Some(dir) if !dir.is_empty() => PathBuf::from(dir).join(CONFIG_FILE_NAME),
        _ => PathBuf::from(SYSTEM_CONFIG_DIR).join(CONFIG_FILE_NAME),
    }
}
