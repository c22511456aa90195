//! In-process module registry used by the binary as its module loader.

use super::ModuleLoader;
use crate::config::types::{DaemonError, Result};
use std::collections::BTreeSet;

/// Modules every build knows about
pub const BUILTIN_MODULES: &[&str] = &[
    "module-cli",
    "module-cli-protocol-unix",
    "module-native-protocol-unix",
    "module-null-sink",
    "module-always-sink",
    "module-suspend-on-idle",
];

#[derive(Clone, Debug, PartialEq, Eq)]
struct LoadedModule {
    name: String,
    args: Option<String>,
}

/// Tracks which modules are loaded. Loading twice is an explicit error.
#[derive(Debug)]
pub struct ModuleRegistry {
    known: BTreeSet<String>,
    loaded: Vec<LoadedModule>,
}

impl Default for ModuleRegistry {
    fn default() -> Self {
        Self::with_known(BUILTIN_MODULES.iter().copied())
    }
}

impl ModuleRegistry {
    pub fn with_known<'a, I>(names: I) -> Self
    where
        I: IntoIterator<Item = &'a str>,
    {
        Self {
            known: names.into_iter().map(str::to_string).collect(),
            loaded: Vec::new(),
        }
    }

    pub fn is_loaded(&self, name: &str) -> bool {
        self.loaded.iter().any(|m| m.name == name)
    }

    pub fn args_of(&self, name: &str) -> Option<&str> {
        self.loaded
            .iter()
            .find(|m| m.name == name)
            .and_then(|m| m.args.as_deref())
    }
}

impl ModuleLoader for ModuleRegistry {
    fn load(&mut self, name: &str, args: Option<&str>) -> Result<()> {
        if !self.known.contains(name) {
            return Err(DaemonError::Module(format!("Unknown module '{}'", name)));
        }
        if self.is_loaded(name) {
            return Err(DaemonError::Module(format!("Module '{}' is already loaded", name)));
        }
        self.loaded.push(LoadedModule {
            name: name.to_string(),
            args: args.map(str::to_string),
        });
        log::info!("Loaded module '{}'{}", name, args.map(|a| format!(" ({})", a)).unwrap_or_default());
        Ok(())
    }

    fn loaded(&self) -> Vec<String> {
        self.loaded.iter().map(|m| m.name.clone()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn loads_known_modules_in_order() {
        let mut registry = ModuleRegistry::default();
        registry.load("module-null-sink", Some("rate=48000")).unwrap();
        registry.load("module-cli", None).unwrap();
        assert_eq!(registry.loaded(), vec!["module-null-sink", "module-cli"]);
        assert_eq!(registry.args_of("module-null-sink"), Some("rate=48000"));
    }

    #[test]
    fn duplicate_and_unknown_loads_fail() {
        let mut registry = ModuleRegistry::with_known(["module-cli"]);
        registry.load("module-cli", None).unwrap();
        assert!(matches!(registry.load("module-cli", None), Err(DaemonError::Module(_))));
        assert!(matches!(registry.load("module-x11-bell", None), Err(DaemonError::Module(_))));
        assert_eq!(registry.loaded().len(), 1);
    }
}
