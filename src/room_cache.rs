use std::collections::HashMap;

use parking_lot::Mutex;

use crate::transport::StateKind;

/// Snapshot of a room's cached metadata. Empty strings mean unset.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RoomMetadata {
    pub name: String,
    pub topic: String,
    pub avatar: String,
}

impl RoomMetadata {
    pub fn get(&self, kind: StateKind) -> &str {
        match kind {
            StateKind::Name => &self.name,
            StateKind::Topic => &self.topic,
            StateKind::Avatar => &self.avatar,
        }
    }

    pub fn set(&mut self, kind: StateKind, value: String) {
        match kind {
            StateKind::Name => self.name = value,
            StateKind::Topic => self.topic = value,
            StateKind::Avatar => self.avatar = value,
        }
    }
}

/// Each slot is loaded independently; `None` means not known yet.
#[derive(Debug, Default)]
struct Entry {
    name: Option<String>,
    topic: Option<String>,
    avatar: Option<String>,
}

impl Entry {
    fn slot(&mut self, kind: StateKind) -> &mut Option<String> {
        match kind {
            StateKind::Name => &mut self.name,
            StateKind::Topic => &mut self.topic,
            StateKind::Avatar => &mut self.avatar,
        }
    }
}

/// Process-wide room name/topic/avatar cache.
///
/// The lock is only held for map operations, never across I/O. Lazy loads go
/// through [`RoomMetadataCache::fill`], which never replaces a known value,
/// so a state notification that lands while a fetch is in flight wins.
#[derive(Debug, Default)]
pub struct RoomMetadataCache {
    rooms: Mutex<HashMap<String, Entry>>,
}

impl RoomMetadataCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Slots of `room_id` that still have to be fetched.
    pub fn missing(&self, room_id: &str) -> Vec<StateKind> {
        let mut rooms = self.rooms.lock();
        let entry = rooms.entry(room_id.to_string()).or_default();
        StateKind::ALL
            .into_iter()
            .filter(|kind| entry.slot(*kind).is_none())
            .collect()
    }

    /// Store a lazily fetched value unless the slot was set meanwhile.
    pub fn fill(&self, room_id: &str, kind: StateKind, value: &str) {
        let mut rooms = self.rooms.lock();
        let entry = rooms.entry(room_id.to_string()).or_default();
        entry.slot(kind).get_or_insert_with(|| value.trim().to_string());
    }

    /// Authoritative overwrite, from a state event or a state change we published.
    pub fn store(&self, room_id: &str, kind: StateKind, value: &str) {
        let mut rooms = self.rooms.lock();
        let entry = rooms.entry(room_id.to_string()).or_default();
        *entry.slot(kind) = Some(value.trim().to_string());
    }

    /// Current view of the room; unknown slots read as empty.
    pub fn snapshot(&self, room_id: &str) -> RoomMetadata {
        let mut rooms = self.rooms.lock();
        let entry = rooms.entry(room_id.to_string()).or_default();
        let mut metadata = RoomMetadata::default();
        for kind in StateKind::ALL {
            metadata.set(kind, entry.slot(kind).clone().unwrap_or_default());
        }
        metadata
    }

    pub fn len(&self) -> usize {
        self.rooms.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.rooms.lock().is_empty()
    }
}
