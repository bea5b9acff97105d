//! The indexed entry store: single authority for entry existence,
//! identity and property values. Entries are keyed by location and
//! mirrored into a type/genre/artist/album grouping index kept free of
//! empty groups.
//!
//! Mutations follow a single-writer discipline. The locks here make
//! concurrent read access safe, not concurrent mutation correct:
//! callers marshal all writes onto one context.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tracing::{info, warn};

use common::{
    AvailabilityEvent, DefaultBehavior, Entry, EntryCategory, EntryId, EntryRef, EntryType,
    Property, PropertyChange, RefString, SongBehavior, StringPool, Value, UNKNOWN,
};
use query::Query;

pub mod eval;
mod load;
mod save;
mod tree;

pub use eval::{entry_matches, CollectResults, QueryResults, QUERY_BATCH};
pub use load::LoadError;
pub use save::{SaveError, DB_VERSION};

/// Required string fields that must never stay empty on an inserted
/// entry.
const REQUIRED_PROPS: [Property; 5] = [
    Property::Title,
    Property::Genre,
    Property::Artist,
    Property::Album,
    Property::MimeType,
];

#[derive(Debug)]
pub enum StoreError {
    DuplicateLocation(String),
    UnknownEntryType(String),
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StoreError::DuplicateLocation(loc) => {
                write!(f, "an entry already exists at {}", loc)
            }
            StoreError::UnknownEntryType(name) => {
                write!(f, "entry type {:?} is not registered", name)
            }
        }
    }
}

impl std::error::Error for StoreError {}

/// Receives store mutation events. Implementations must tolerate being
/// called from whichever context performs the mutation and should do no
/// more than hand the event off.
pub trait StoreListener: Send + Sync {
    fn entry_added(&self, entry: &EntryRef);
    fn entry_changed(&self, entry: &EntryRef, changes: &[PropertyChange]);
    fn entry_deleted(&self, entry: &EntryRef);
}

pub(crate) struct Inner {
    pub(crate) by_location: HashMap<RefString, EntryRef>,
    pub(crate) index: tree::PropIndex,
}

pub struct Store {
    pool: StringPool,
    registry: RwLock<HashMap<String, Arc<EntryType>>>,
    pub(crate) inner: RwLock<Inner>,
    listeners: Mutex<Vec<Weak<dyn StoreListener>>>,
    next_id: AtomicU64,
}

#[derive(Debug, Serialize)]
pub struct StoreStats {
    pub entries: usize,
    pub genres: usize,
    pub artists: usize,
    pub albums: usize,
    pub interned_strings: usize,
    pub by_type: BTreeMap<String, usize>,
}

impl Store {
    /// Creates an empty store with the three built-in entry types
    /// registered: `song`, `ignore` and `import-error`.
    pub fn new() -> Store {
        let store = Store {
            pool: StringPool::new(),
            registry: RwLock::new(HashMap::new()),
            inner: RwLock::new(Inner {
                by_location: HashMap::new(),
                index: tree::PropIndex::new(),
            }),
            listeners: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(1),
        };
        store.register_entry_type(EntryType::new(
            "song",
            EntryCategory::Normal,
            true,
            Box::new(SongBehavior),
        ));
        store.register_entry_type(EntryType::new(
            "ignore",
            EntryCategory::Normal,
            true,
            Box::new(DefaultBehavior),
        ));
        store.register_entry_type(EntryType::new(
            "import-error",
            EntryCategory::Virtual,
            false,
            Box::new(DefaultBehavior),
        ));
        store
    }

    pub fn pool(&self) -> &StringPool {
        &self.pool
    }

    pub fn register_entry_type(&self, entry_type: Arc<EntryType>) {
        let mut registry = self.registry.write();
        if registry
            .insert(entry_type.name().to_string(), entry_type.clone())
            .is_some()
        {
            warn!(name = entry_type.name(), "entry type registered twice");
        }
    }

    pub fn entry_type(&self, name: &str) -> Option<Arc<EntryType>> {
        self.registry.read().get(name).cloned()
    }

    pub fn add_listener(&self, listener: &Arc<dyn StoreListener>) {
        self.listeners.lock().push(Arc::downgrade(listener));
    }

    fn notify(&self, f: impl Fn(&dyn StoreListener)) {
        let mut listeners = self.listeners.lock();
        listeners.retain(|weak| match weak.upgrade() {
            Some(listener) => {
                f(listener.as_ref());
                true
            }
            None => false,
        });
    }

    /// Allocates a new entry of a registered type. The entry is not yet
    /// visible anywhere; callers populate its fields and then call
    /// `insert`.
    pub fn create(&self, type_name: &str, location: &str) -> Result<EntryRef, StoreError> {
        let entry_type = self
            .entry_type(type_name)
            .ok_or_else(|| StoreError::UnknownEntryType(type_name.to_string()))?;
        if self.inner.read().by_location.contains_key(location) {
            return Err(StoreError::DuplicateLocation(location.to_string()));
        }
        let id = EntryId(self.next_id.fetch_add(1, Ordering::Relaxed));
        Ok(Arc::new(Entry::new(id, entry_type, location, &self.pool)))
    }

    /// Places a created entry into the location map and the grouping
    /// index. Empty required fields are filled with the placeholder,
    /// with a warning, before the entry becomes visible.
    ///
    /// Panics if the entry was already inserted; `create` rejected the
    /// location, so a second insert is a caller bug.
    pub fn insert(&self, entry: &EntryRef) {
        for prop in REQUIRED_PROPS {
            if entry.get(prop).is_default() {
                warn!(entry = %entry.id(), prop = %prop, "missing required field, using placeholder");
                entry.set_uninserted(prop, Value::Str(self.pool.intern(UNKNOWN)), &self.pool);
            }
        }
        let type_name = self.pool.intern(entry.entry_type().name());
        {
            let mut inner = self.inner.write();
            let previous = inner.by_location.insert(entry.location(), entry.clone());
            assert!(
                previous.is_none(),
                "entry inserted twice at {}",
                entry.location()
            );
            inner.index.insert(&type_name, entry);
        }
        entry.mark_inserted(true);
        self.notify(|listener| listener.entry_added(entry));
    }

    /// Updates one property. For genre/artist/album the entry is
    /// detached from its old index leaf and reattached under the new
    /// one in a single writer step; for location the map is re-keyed.
    /// Returns whether the location key changed.
    ///
    /// Panics on the type property and on derived or query-only
    /// properties; those are fixed or store-maintained.
    pub fn set_property(&self, entry: &EntryRef, prop: Property, value: Value) -> bool {
        if prop == Property::Type {
            panic!("entry type is fixed at creation");
        }
        if !entry.is_inserted() {
            entry.set_uninserted(prop, value, &self.pool);
            return false;
        }
        let old = entry.get(prop);
        let location_changed = prop == Property::Location;
        {
            let mut inner = self.inner.write();
            if prop.is_indexed() {
                let type_name = self.pool.intern(entry.entry_type().name());
                inner.index.remove(&type_name, entry);
                entry.set_uninserted(prop, value.clone(), &self.pool);
                inner.index.insert(&type_name, entry);
            } else if location_changed {
                if let Some(occupant) = inner.by_location.get(value.as_str()) {
                    if occupant.id() != entry.id() {
                        warn!(location = value.as_str(), "location already taken, change rejected");
                        return false;
                    }
                }
                let old_key = entry.location();
                inner.by_location.remove(&old_key);
                entry.set_uninserted(prop, value.clone(), &self.pool);
                inner.by_location.insert(entry.location(), entry.clone());
            } else {
                entry.set_uninserted(prop, value.clone(), &self.pool);
            }
        }
        let changes = [PropertyChange {
            prop,
            old,
            new: value,
        }];
        self.notify(|listener| listener.entry_changed(entry, &changes));
        location_changed
    }

    /// Removes an entry from the map and the index and tells every
    /// listener, whether or not their query would still match it.
    pub fn delete(&self, entry: &EntryRef) {
        let type_name = self.pool.intern(entry.entry_type().name());
        {
            let mut inner = self.inner.write();
            inner.by_location.remove(&entry.location());
            inner.index.remove(&type_name, entry);
        }
        entry.mark_inserted(false);
        self.notify(|listener| listener.entry_deleted(entry));
    }

    pub fn delete_by_type(&self, type_name: &str) {
        let doomed: Vec<EntryRef> = {
            let inner = self.inner.read();
            inner
                .by_location
                .values()
                .filter(|entry| entry.entry_type().name() == type_name)
                .cloned()
                .collect()
        };
        info!(type_name, count = doomed.len(), "deleting entries by type");
        for entry in &doomed {
            self.delete(entry);
        }
    }

    pub fn lookup_by_location(&self, location: &str) -> Option<EntryRef> {
        self.inner.read().by_location.get(location).cloned()
    }

    /// Visits every entry outside the store lock. For maintenance
    /// sweeps, never for query evaluation.
    pub fn foreach(&self, mut f: impl FnMut(&EntryRef)) {
        let snapshot: Vec<EntryRef> = self.inner.read().by_location.values().cloned().collect();
        for entry in &snapshot {
            f(entry);
        }
    }

    /// Mount and unmount maintenance sweep: every non-stream entry
    /// whose location falls under the mount point gets its type's
    /// availability hook and its hidden flag brought in line.
    pub fn sweep_availability(&self, mount_prefix: &str, event: AvailabilityEvent) {
        let hidden = matches!(
            event,
            AvailabilityEvent::Unmounted | AvailabilityEvent::NotFound
        );
        let mut swept = 0usize;
        self.foreach(|entry| {
            if entry.entry_type().category() == EntryCategory::Stream {
                return;
            }
            if !entry.location().starts_with(mount_prefix) {
                return;
            }
            entry.entry_type().behavior().availability_changed(entry, event);
            if entry.get(Property::Hidden).as_bool() != hidden {
                self.set_property(entry, Property::Hidden, Value::Bool(hidden));
            }
            swept += 1;
        });
        info!(mount_prefix, ?event, swept, "availability sweep");
    }

    pub fn entry_count(&self) -> usize {
        self.inner.read().by_location.len()
    }

    pub fn stats(&self) -> StoreStats {
        let inner = self.inner.read();
        let (genres, artists, albums) = inner.index.level_counts();
        let mut by_type = BTreeMap::new();
        for entry in inner.by_location.values() {
            *by_type
                .entry(entry.entry_type().name().to_string())
                .or_insert(0usize) += 1;
        }
        StoreStats {
            entries: inner.by_location.len(),
            genres,
            artists,
            albums,
            interned_strings: self.pool.len(),
            by_type,
        }
    }

    /// Compiles and evaluates a query, pushing matches into `results`
    /// in bounded batches. Cooperative cancellation is checked at index
    /// node and batch boundaries; on cancellation the matches already
    /// delivered stand.
    pub fn evaluate_query(&self, query: &Query, results: &dyn QueryResults, cancel: &AtomicBool) {
        eval::run(self, query, results, cancel);
    }

    /// Convenience wrapper for callers that want the full match set at
    /// once.
    pub fn query_sync(&self, query: &Query) -> Vec<EntryRef> {
        let results = CollectResults::new();
        self.evaluate_query(query, &results, &AtomicBool::new(false));
        results.take()
    }

    pub fn save(&self, path: &Path) -> Result<(), SaveError> {
        save::save_store(self, path)
    }

    pub fn load(&self, path: &Path) -> Result<(), LoadError> {
        load::load_store(self, path)
    }
}

impl Default for Store {
    fn default() -> Self {
        Store::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn add_song(store: &Store, location: &str, title: &str, genre: &str, artist: &str, album: &str) -> EntryRef {
        let entry = store.create("song", location).unwrap();
        entry.set_uninserted(Property::Title, Value::Str(store.pool().intern(title)), store.pool());
        entry.set_uninserted(Property::Genre, Value::Str(store.pool().intern(genre)), store.pool());
        entry.set_uninserted(Property::Artist, Value::Str(store.pool().intern(artist)), store.pool());
        entry.set_uninserted(Property::Album, Value::Str(store.pool().intern(album)), store.pool());
        entry.set_uninserted(
            Property::MimeType,
            Value::Str(store.pool().intern("audio/ogg")),
            store.pool(),
        );
        store.insert(&entry);
        entry
    }

    #[test]
    fn duplicate_location_rejected() {
        let store = Store::new();
        add_song(&store, "file:///a.ogg", "A", "Rock", "X", "L1");
        assert!(matches!(
            store.create("song", "file:///a.ogg"),
            Err(StoreError::DuplicateLocation(_))
        ));
    }

    #[test]
    fn unknown_type_rejected() {
        let store = Store::new();
        assert!(matches!(
            store.create("podcast-post", "feed://x"),
            Err(StoreError::UnknownEntryType(_))
        ));
    }

    #[test]
    fn missing_required_fields_get_placeholder() {
        let store = Store::new();
        let entry = store.create("song", "file:///bare.ogg").unwrap();
        store.insert(&entry);
        assert_eq!(entry.title().as_str(), UNKNOWN);
        assert_eq!(entry.genre().as_str(), UNKNOWN);
        assert_eq!(entry.get(Property::MimeType).as_str(), UNKNOWN);
    }

    #[test]
    fn reindex_on_grouping_change() {
        let store = Store::new();
        let entry = add_song(&store, "file:///a.ogg", "A", "Rock", "X", "L1");
        store.set_property(
            &entry,
            Property::Genre,
            Value::Str(store.pool().intern("Jazz")),
        );
        let stats = store.stats();
        assert_eq!(stats.genres, 1);
        let inner = store.inner.read();
        let t = inner.index.type_node("song").unwrap();
        assert!(inner.index.child(t, "Rock").is_none());
        assert!(inner.index.child(t, "Jazz").is_some());
    }

    #[test]
    fn location_change_rekeys_map() {
        let store = Store::new();
        let entry = add_song(&store, "file:///old.ogg", "A", "Rock", "X", "L1");
        let changed = store.set_property(
            &entry,
            Property::Location,
            Value::Str(store.pool().intern("file:///new.ogg")),
        );
        assert!(changed);
        assert!(store.lookup_by_location("file:///old.ogg").is_none());
        assert!(store.lookup_by_location("file:///new.ogg").is_some());
    }

    #[test]
    fn location_change_onto_taken_key_is_rejected() {
        let store = Store::new();
        let a = add_song(&store, "file:///a.ogg", "A", "Rock", "X", "L1");
        let b = add_song(&store, "file:///b.ogg", "B", "Rock", "Y", "L2");
        let changed = store.set_property(
            &b,
            Property::Location,
            Value::Str(store.pool().intern("file:///a.ogg")),
        );
        assert!(!changed);
        assert_eq!(b.location().as_str(), "file:///b.ogg");
        assert_eq!(store.lookup_by_location("file:///a.ogg").unwrap().id(), a.id());
        assert_eq!(store.lookup_by_location("file:///b.ogg").unwrap().id(), b.id());
        assert_eq!(store.entry_count(), 2);
    }

    #[test]
    fn unmount_sweep_hides_covered_entries() {
        let store = Store::new();
        let on_disk = add_song(&store, "file:///media/usb/a.ogg", "A", "Rock", "X", "L1");
        let elsewhere = add_song(&store, "file:///home/me/b.ogg", "B", "Rock", "Y", "L2");
        store.sweep_availability("file:///media/usb/", AvailabilityEvent::Unmounted);
        assert!(on_disk.get(Property::Hidden).as_bool());
        assert!(!elsewhere.get(Property::Hidden).as_bool());
        store.sweep_availability("file:///media/usb/", AvailabilityEvent::Mounted);
        assert!(!on_disk.get(Property::Hidden).as_bool());
    }

    #[test]
    fn delete_by_type_spares_other_types() {
        let store = Store::new();
        add_song(&store, "file:///a.ogg", "A", "Rock", "X", "L1");
        let ignored = store.create("ignore", "file:///skip.bin").unwrap();
        store.insert(&ignored);
        store.delete_by_type("ignore");
        assert_eq!(store.entry_count(), 1);
        assert!(store.lookup_by_location("file:///a.ogg").is_some());
    }

    struct CountingListener {
        deleted: AtomicU64,
    }

    impl StoreListener for CountingListener {
        fn entry_added(&self, _entry: &EntryRef) {}
        fn entry_changed(&self, _entry: &EntryRef, _changes: &[PropertyChange]) {}
        fn entry_deleted(&self, _entry: &EntryRef) {
            self.deleted.fetch_add(1, Ordering::Relaxed);
        }
    }

    #[test]
    fn dead_listeners_are_pruned() {
        let store = Store::new();
        let listener: Arc<dyn StoreListener> = Arc::new(CountingListener {
            deleted: AtomicU64::new(0),
        });
        store.add_listener(&listener);
        let entry = add_song(&store, "file:///a.ogg", "A", "Rock", "X", "L1");
        drop(listener);
        store.delete(&entry);
        assert!(store.listeners.lock().is_empty());
    }
}
