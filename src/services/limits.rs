//! Process-wide traversal and size limits.
//!
//! Limits are read on every context build, so reads take only a read lock.
//! Initialization happens once via double-checked locking; `refresh` exists
//! for config reloads.

use std::sync::{Mutex, RwLock};

/// Bounds applied during context construction and traversal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConfigLimits {
    /// Maximum parent-chain frames above the task itself.
    pub max_parent_depth: usize,
    /// Maximum recursion depth when expanding `children` contexts.
    pub max_children_depth: usize,
    /// Maximum config nesting accepted from a workflow definition.
    pub max_nesting_depth: usize,
    /// Maximum length of any single rendered template string.
    pub max_string_length: usize,
}

impl Default for ConfigLimits {
    fn default() -> Self {
        Self {
            max_parent_depth: 10,
            max_children_depth: 5,
            max_nesting_depth: 20,
            max_string_length: 1024 * 1024,
        }
    }
}

static LIMITS: RwLock<Option<ConfigLimits>> = RwLock::new(None);
static INIT: Mutex<()> = Mutex::new(());

/// Initialize the process-wide limits once. Later calls are no-ops; use
/// [`refresh`] to replace an installed value.
pub fn init(limits: ConfigLimits) {
    if LIMITS.read().map(|l| l.is_some()).unwrap_or(false) {
        return;
    }
    let _guard = INIT.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
    let mut slot = LIMITS.write().unwrap_or_else(std::sync::PoisonError::into_inner);
    if slot.is_none() {
        *slot = Some(limits);
    }
}

/// Current limits, installing the defaults on first use.
pub fn get() -> ConfigLimits {
    if let Some(limits) = *LIMITS.read().unwrap_or_else(std::sync::PoisonError::into_inner) {
        return limits;
    }
    init(ConfigLimits::default());
    LIMITS
        .read()
        .unwrap_or_else(std::sync::PoisonError::into_inner)
        .unwrap_or_default()
}

/// Replace the installed limits (config reload entrypoint).
pub fn refresh(limits: ConfigLimits) {
    let _guard = INIT.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
    let mut slot = LIMITS.write().unwrap_or_else(std::sync::PoisonError::into_inner);
    *slot = Some(limits);
}
