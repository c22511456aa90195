//! Human-readable status dump of a running daemon.

use crate::core::types::{CapabilityDecision, CredentialState, SchedulingGrant};
use crate::runtime::{SharedLoader, StatusSource};
use chrono::{DateTime, Utc};
use std::fmt::Write;
use std::path::PathBuf;
use uuid::Uuid;

/// Identity of this daemon process, fixed at startup
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InstanceInfo {
    pub id: Uuid,
    pub started_at: DateTime<Utc>,
    pub pid: u32,
}

impl InstanceInfo {
    pub fn new() -> Self {
        Self {
            id: Uuid::new_v4(),
            started_at: Utc::now(),
            pid: std::process::id(),
        }
    }

    /// First block of the id, used as a log prefix
    pub fn short_id(&self) -> String {
        self.id.simple().to_string()[..8].to_string()
    }
}

impl Default for InstanceInfo {
    fn default() -> Self {
        Self::new()
    }
}

pub struct DaemonStatus {
    pub instance: InstanceInfo,
    pub system_instance: bool,
    pub runtime_dir: PathBuf,
    pub credentials: CredentialState,
    pub grant: SchedulingGrant,
    pub decision: CapabilityDecision,
    pub loader: SharedLoader,
}

impl StatusSource for DaemonStatus {
    fn status_report(&self) -> String {
        let mut out = String::new();
        let uptime = Utc::now().signed_duration_since(self.instance.started_at);
        let _ = writeln!(out, "audiod {} instance {}", env!("CARGO_PKG_VERSION"), self.instance.id);
        let _ = writeln!(
            out,
            "PID {}, started {} (up {}s)",
            self.instance.pid,
            self.instance.started_at.to_rfc3339(),
            uptime.num_seconds()
        );
        let _ = writeln!(
            out,
            "System mode: {}, runtime directory {}",
            if self.system_instance { "yes" } else { "no" },
            self.runtime_dir.display()
        );
        let _ = writeln!(
            out,
            "Started as {:?}, retained capability: {:?} ({:?})",
            self.credentials.origin, self.credentials.retained, self.decision
        );
        let _ = writeln!(
            out,
            "Scheduling: high-priority {}/{}, real-time {}/{} via {:?}",
            self.grant.granted_high_priority,
            self.grant.wants_high_priority,
            self.grant.granted_realtime,
            self.grant.wants_realtime,
            self.grant.grant_source
        );
        match self.loader.try_borrow() {
            Ok(loader) => {
                let modules = loader.loaded();
                let _ = write!(out, "{} module(s) loaded: {}", modules.len(), modules.join(", "));
            }
            Err(_) => {
                let _ = write!(out, "Module list unavailable");
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::{GrantSource, StartIdentity};
    use crate::runtime::{ModuleLoader, ModuleRegistry};
    use std::cell::RefCell;
    use std::rc::Rc;

    #[test]
    fn report_names_instance_and_modules() {
        let registry = Rc::new(RefCell::new(ModuleRegistry::default()));
        registry.borrow_mut().load("module-null-sink", None).unwrap();
        let status = DaemonStatus {
            instance: InstanceInfo::new(),
            system_instance: false,
            runtime_dir: PathBuf::from("/run/user/1000/audiod"),
            credentials: CredentialState {
                origin: StartIdentity::Unprivileged,
                retained: None,
            },
            grant: SchedulingGrant {
                wants_high_priority: true,
                wants_realtime: false,
                granted_high_priority: false,
                granted_realtime: false,
                grant_source: GrantSource::None,
            },
            decision: CapabilityDecision::NotHeld,
            loader: registry,
        };

        let report = status.status_report();
        assert!(report.contains(&status.instance.id.to_string()));
        assert!(report.contains("1 module(s) loaded: module-null-sink"));
        assert_eq!(status.instance.short_id().len(), 8);
    }
}
