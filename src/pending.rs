use std::collections::HashSet;

use parking_lot::Mutex;

/// Bot-authored events that a reaction may still retract.
#[derive(Debug, Default)]
pub struct PendingDeletions {
    ids: Mutex<HashSet<String>>,
}

impl PendingDeletions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, event_id: impl Into<String>) {
        self.ids.lock().insert(event_id.into());
    }

    /// Removes `event_id`, returning whether it was registered. Only the first
    /// caller for a given id gets `true`.
    pub fn take(&self, event_id: &str) -> bool {
        self.ids.lock().remove(event_id)
    }

    pub fn contains(&self, event_id: &str) -> bool {
        self.ids.lock().contains(event_id)
    }

    pub fn len(&self) -> usize {
        self.ids.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.lock().is_empty()
    }
}
