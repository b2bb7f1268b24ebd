/// Guards: named "protected operation" flags that veto a shutdown.
///
/// The set is shared and writable from anywhere; the poll cycle only ever
/// reads a snapshot taken under one lock, so every guard is judged at the
/// same instant.
use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};

/// Well-known guard names.
pub const FILE_OPERATION: &str = "file-operation";
pub const SYSTEM_UPGRADE: &str = "system-upgrade";

/// Shared, caller-mutable guard registry.
#[derive(Debug, Clone, Default)]
pub struct GuardSet {
    inner: Arc<RwLock<BTreeMap<String, bool>>>,
}

impl GuardSet {
    /// Registry with the given names present but inactive.
    pub fn with_names<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let map = names.into_iter().map(|n| (n.into(), false)).collect();
        Self {
            inner: Arc::new(RwLock::new(map)),
        }
    }

    pub fn activate(&self, name: &str) {
        self.set_guard(name, true);
    }

    pub fn release(&self, name: &str) {
        self.set_guard(name, false);
    }

    pub fn set_guard(&self, name: &str, active: bool) {
        let mut map = self.inner.write().unwrap_or_else(|e| e.into_inner());
        let previous = map.insert(name.to_string(), active);
        if previous != Some(active) {
            tracing::info!(guard = name, active, "guard changed");
        }
    }

    /// Consistent point-in-time copy of every guard.
    pub fn snapshot(&self) -> GuardSnapshot {
        let map = self.inner.read().unwrap_or_else(|e| e.into_inner());
        GuardSnapshot { guards: map.clone() }
    }
}

/// Immutable view of a [`GuardSet`] at one instant.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GuardSnapshot {
    guards: BTreeMap<String, bool>,
}

impl GuardSnapshot {
    pub fn any_active(&self) -> bool {
        self.guards.values().any(|&active| active)
    }

    /// Names of active guards, sorted.
    pub fn active(&self) -> Vec<String> {
        self.guards
            .iter()
            .filter(|(_, active)| **active)
            .map(|(name, _)| name.clone())
            .collect()
    }
}

/// A shutdown is permitted only when no guard is active.
pub fn is_shutdown_permitted(snapshot: &GuardSnapshot) -> bool {
    !snapshot.any_active()
}

/// Guard names double as file names, so keep them to a safe alphabet.
pub fn is_valid_guard_name(name: &str) -> bool {
    !name.is_empty()
        && name != "."
        && name != ".."
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
}
