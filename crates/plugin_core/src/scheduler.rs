//! Pluggable execution-notification policy.
//!
//! The manager calls these hooks around every `execute`, whether it was
//! invoked directly or dispatched from the job queue.

use std::collections::HashMap;
use std::sync::Mutex;

/// Capability set a scheduler policy must implement.
pub trait Scheduler: Send + Sync {
    fn on_execute_begin(&self, plugin_name: &str);
    fn on_execute_end(&self, plugin_name: &str, ok: bool);
}

/// Does nothing. The default for a manager that doesn't need telemetry.
#[derive(Debug, Default)]
pub struct NullScheduler;

impl Scheduler for NullScheduler {
    fn on_execute_begin(&self, _plugin_name: &str) {}
    fn on_execute_end(&self, _plugin_name: &str, _ok: bool) {}
}

/// Tracks the multiset of plugin names currently executing, for UI/telemetry
/// consumers such as the queue's `get_state`.
#[derive(Debug, Default)]
pub struct QueueAwareScheduler {
    active: Mutex<HashMap<String, u32>>,
}

impl QueueAwareScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Plugin names currently executing, each repeated once per concurrent
    /// execution.
    pub fn active_plugins(&self) -> Vec<String> {
        let active = self.active.lock().unwrap();
        active
            .iter()
            .flat_map(|(name, count)| std::iter::repeat(name.clone()).take(*count as usize))
            .collect()
    }
}

impl Scheduler for QueueAwareScheduler {
    fn on_execute_begin(&self, plugin_name: &str) {
        let mut active = self.active.lock().unwrap();
        *active.entry(plugin_name.to_string()).or_insert(0) += 1;
    }

    fn on_execute_end(&self, plugin_name: &str, _ok: bool) {
        let mut active = self.active.lock().unwrap();
        if let Some(count) = active.get_mut(plugin_name) {
            *count -= 1;
            if *count == 0 {
                active.remove(plugin_name);
            }
        }
    }
}
