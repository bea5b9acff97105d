use std::any::Any;
use std::fmt;
use std::sync::Arc;

use crate::entry::Entry;
use crate::prop::Property;
use crate::value::Value;

/// Broad category of an entry type, used by consumers to decide how an
/// entry participates in playback and browsing.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EntryCategory {
    /// Real playable items with a backing file (songs).
    Normal,
    /// Continuous streams with no fixed duration (radio).
    Stream,
    /// Entries that group others (podcast feeds).
    Container,
    /// Bookkeeping entries that are never played (import errors, ignores).
    Virtual,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AvailabilityEvent {
    Checked,
    Mounted,
    Unmounted,
    NotFound,
}

/// One recorded property mutation, old and new value.
#[derive(Clone, Debug)]
pub struct PropertyChange {
    pub prop: Property,
    pub old: Value,
    pub new: Value,
}

#[derive(Debug)]
pub enum SyncError {
    NotSupported,
    Failed(String),
}

impl fmt::Display for SyncError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SyncError::NotSupported => write!(f, "entry type does not sync metadata"),
            SyncError::Failed(msg) => write!(f, "metadata sync failed: {}", msg),
        }
    }
}

impl std::error::Error for SyncError {}

/// Opaque per-type extension block attached to an entry at creation.
pub type TypeData = Box<dyn Any + Send + Sync>;

/// Behavior hooks an entry type may override. Every default is the
/// plainest thing the core can assume: play the location as-is, sync
/// nothing, cache nothing.
pub trait EntryTypeBehavior: Send + Sync {
    fn playback_uri(&self, entry: &Entry) -> Option<String> {
        Some(entry.location().as_str().to_string())
    }

    fn availability_changed(&self, _entry: &Entry, _event: AvailabilityEvent) {}

    fn can_sync_metadata(&self, _entry: &Entry) -> bool {
        false
    }

    fn sync_metadata(&self, _entry: &Entry, _changes: &[PropertyChange]) -> Result<(), SyncError> {
        Err(SyncError::NotSupported)
    }

    fn uri_to_cache_key(&self, _uri: &str) -> Option<String> {
        None
    }

    fn cache_key_to_uri(&self, _key: &str) -> Option<String> {
        None
    }

    fn new_type_data(&self) -> Option<TypeData> {
        None
    }
}

/// Derives a stable metadata-cache key for a URI under a type-name
/// prefix. One-way by construction; types with reversible keys override
/// both hook directions instead.
pub fn stable_cache_key(prefix: &str, uri: &str) -> String {
    format!("{}:{}", prefix, blake3::hash(uri.as_bytes()).to_hex())
}

/// A named, registered entry type: category, persistence flag, and the
/// behavior hooks the store calls polymorphically.
pub struct EntryType {
    name: String,
    category: EntryCategory,
    save_to_disk: bool,
    behavior: Box<dyn EntryTypeBehavior>,
}

impl EntryType {
    pub fn new(
        name: &str,
        category: EntryCategory,
        save_to_disk: bool,
        behavior: Box<dyn EntryTypeBehavior>,
    ) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            category,
            save_to_disk,
            behavior,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn category(&self) -> EntryCategory {
        self.category
    }

    pub fn save_to_disk(&self) -> bool {
        self.save_to_disk
    }

    pub fn behavior(&self) -> &dyn EntryTypeBehavior {
        self.behavior.as_ref()
    }
}

impl fmt::Debug for EntryType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EntryType")
            .field("name", &self.name)
            .field("category", &self.category)
            .field("save_to_disk", &self.save_to_disk)
            .finish()
    }
}

/// Default behavior used by the built-in song/ignore/import-error types.
pub struct DefaultBehavior;

impl EntryTypeBehavior for DefaultBehavior {}

/// Song behavior: default playback, cache keys derived from the location.
pub struct SongBehavior;

impl EntryTypeBehavior for SongBehavior {
    fn uri_to_cache_key(&self, uri: &str) -> Option<String> {
        Some(stable_cache_key("song", uri))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cache_key_is_stable_and_prefixed() {
        let a = stable_cache_key("song", "file:///music/x.ogg");
        let b = stable_cache_key("song", "file:///music/x.ogg");
        assert_eq!(a, b);
        assert!(a.starts_with("song:"));
        assert_ne!(a, stable_cache_key("song", "file:///music/y.ogg"));
    }
}
