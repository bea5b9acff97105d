use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};

use crate::entry_type::{EntryType, TypeData};
use crate::intern::{search_fold, RefString, StringPool};
use crate::prop::Property;
use crate::value::Value;

/// Process-unique entry identity. Never reused within one store.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EntryId(pub u64);

impl fmt::Display for EntryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Shared handle to an entry. The store's location map is the owning
/// collection; result sequences and in-flight evaluations hold clones.
pub type EntryRef = Arc<Entry>;

struct EntryFields {
    title: RefString,
    genre: RefString,
    artist: RefString,
    album: RefString,
    location: RefString,
    mountpoint: RefString,
    mimetype: RefString,
    playback_error: RefString,
    title_folded: RefString,
    genre_folded: RefString,
    artist_folded: RefString,
    album_folded: RefString,
    description: RefString,
    subtitle: RefString,
    summary: RefString,
    lang: RefString,
    copyright: RefString,
    image: RefString,
    musicbrainz_trackid: RefString,
    track_number: u64,
    disc_number: u64,
    duration: u64,
    file_size: u64,
    mtime: u64,
    first_seen: u64,
    last_seen: u64,
    play_count: u64,
    last_played: u64,
    bitrate: u64,
    /// Julian day (day 1 = 0001-01-01); 0 means no recorded date.
    date: u64,
    status: u64,
    post_time: u64,
    rating: f64,
    track_gain: f64,
    track_peak: f64,
    album_gain: f64,
    album_peak: f64,
    hidden: bool,
}

/// One catalogued media item. Mutable fields sit behind a lock so
/// handles can cross threads; actual mutation goes through the store's
/// single-writer discipline.
pub struct Entry {
    id: EntryId,
    entry_type: Arc<EntryType>,
    fields: RwLock<EntryFields>,
    type_data: Mutex<Option<TypeData>>,
    inserted: AtomicBool,
    needs_refresh: AtomicBool,
}

impl Entry {
    pub fn new(id: EntryId, entry_type: Arc<EntryType>, location: &str, pool: &StringPool) -> Entry {
        let empty = pool.intern("");
        let fields = EntryFields {
            title: empty.clone(),
            genre: empty.clone(),
            artist: empty.clone(),
            album: empty.clone(),
            location: pool.intern(location),
            mountpoint: empty.clone(),
            mimetype: empty.clone(),
            playback_error: empty.clone(),
            title_folded: empty.clone(),
            genre_folded: empty.clone(),
            artist_folded: empty.clone(),
            album_folded: empty.clone(),
            description: empty.clone(),
            subtitle: empty.clone(),
            summary: empty.clone(),
            lang: empty.clone(),
            copyright: empty.clone(),
            image: empty.clone(),
            musicbrainz_trackid: empty,
            track_number: 0,
            disc_number: 0,
            duration: 0,
            file_size: 0,
            mtime: 0,
            first_seen: 0,
            last_seen: 0,
            play_count: 0,
            last_played: 0,
            bitrate: 0,
            date: 0,
            status: 0,
            post_time: 0,
            rating: 0.0,
            track_gain: 0.0,
            track_peak: 0.0,
            album_gain: 0.0,
            album_peak: 0.0,
            hidden: false,
        };
        let type_data = entry_type.behavior().new_type_data();
        Entry {
            id,
            entry_type,
            fields: RwLock::new(fields),
            type_data: Mutex::new(type_data),
            inserted: AtomicBool::new(false),
            needs_refresh: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> EntryId {
        self.id
    }

    pub fn entry_type(&self) -> &Arc<EntryType> {
        &self.entry_type
    }

    pub fn location(&self) -> RefString {
        self.fields.read().location.clone()
    }

    pub fn genre(&self) -> RefString {
        self.fields.read().genre.clone()
    }

    pub fn artist(&self) -> RefString {
        self.fields.read().artist.clone()
    }

    pub fn album(&self) -> RefString {
        self.fields.read().album.clone()
    }

    pub fn title(&self) -> RefString {
        self.fields.read().title.clone()
    }

    pub fn play_count(&self) -> u64 {
        self.fields.read().play_count
    }

    pub fn rating(&self) -> f64 {
        self.fields.read().rating
    }

    pub fn last_played(&self) -> u64 {
        self.fields.read().last_played
    }

    pub fn is_inserted(&self) -> bool {
        self.inserted.load(Ordering::Acquire)
    }

    pub fn mark_inserted(&self, inserted: bool) {
        self.inserted.store(inserted, Ordering::Release);
    }

    pub fn needs_refresh(&self) -> bool {
        self.needs_refresh.load(Ordering::Acquire)
    }

    pub fn set_needs_refresh(&self, value: bool) {
        self.needs_refresh.store(value, Ordering::Release);
    }

    pub fn playback_uri(&self) -> Option<String> {
        self.entry_type.behavior().playback_uri(self)
    }

    pub fn with_type_data<R>(&self, f: impl FnOnce(Option<&TypeData>) -> R) -> R {
        let guard = self.type_data.lock();
        f(guard.as_ref())
    }

    /// Reads one property as a typed value.
    ///
    /// Panics on `SearchMatch`, which is never stored.
    pub fn get(&self, prop: Property) -> Value {
        let fields = self.fields.read();
        match prop {
            Property::Type => panic!("entry type is read via entry_type(), not get()"),
            Property::Title => Value::Str(fields.title.clone()),
            Property::Genre => Value::Str(fields.genre.clone()),
            Property::Artist => Value::Str(fields.artist.clone()),
            Property::Album => Value::Str(fields.album.clone()),
            Property::Location => Value::Str(fields.location.clone()),
            Property::Mountpoint => Value::Str(fields.mountpoint.clone()),
            Property::MimeType => Value::Str(fields.mimetype.clone()),
            Property::PlaybackError => Value::Str(fields.playback_error.clone()),
            Property::TitleFolded => Value::Str(fields.title_folded.clone()),
            Property::GenreFolded => Value::Str(fields.genre_folded.clone()),
            Property::ArtistFolded => Value::Str(fields.artist_folded.clone()),
            Property::AlbumFolded => Value::Str(fields.album_folded.clone()),
            Property::Description => Value::Str(fields.description.clone()),
            Property::Subtitle => Value::Str(fields.subtitle.clone()),
            Property::Summary => Value::Str(fields.summary.clone()),
            Property::Lang => Value::Str(fields.lang.clone()),
            Property::Copyright => Value::Str(fields.copyright.clone()),
            Property::Image => Value::Str(fields.image.clone()),
            Property::MusicbrainzTrackId => Value::Str(fields.musicbrainz_trackid.clone()),
            Property::TrackNumber => Value::ULong(fields.track_number),
            Property::DiscNumber => Value::ULong(fields.disc_number),
            Property::Duration => Value::ULong(fields.duration),
            Property::FileSize => Value::ULong(fields.file_size),
            Property::Mtime => Value::ULong(fields.mtime),
            Property::FirstSeen => Value::ULong(fields.first_seen),
            Property::LastSeen => Value::ULong(fields.last_seen),
            Property::PlayCount => Value::ULong(fields.play_count),
            Property::LastPlayed => Value::ULong(fields.last_played),
            Property::Bitrate => Value::ULong(fields.bitrate),
            Property::Date => Value::ULong(fields.date),
            Property::Status => Value::ULong(fields.status),
            Property::PostTime => Value::ULong(fields.post_time),
            Property::Rating => Value::Double(fields.rating),
            Property::TrackGain => Value::Double(fields.track_gain),
            Property::TrackPeak => Value::Double(fields.track_peak),
            Property::AlbumGain => Value::Double(fields.album_gain),
            Property::AlbumPeak => Value::Double(fields.album_peak),
            Property::Hidden => Value::Bool(fields.hidden),
            Property::SearchMatch => panic!("search-match has no stored value"),
        }
    }

    /// Writes one field directly, bypassing store bookkeeping. Only
    /// valid for entries not yet inserted into the grouping index, or
    /// for the store itself while it holds its write lock. Folded
    /// mirrors are kept in sync here.
    ///
    /// Panics on derived, query-only, or type properties and on a value
    /// kind mismatch.
    pub fn set_uninserted(&self, prop: Property, value: Value, pool: &StringPool) {
        if prop.is_derived() {
            panic!("derived property {} cannot be set", prop);
        }
        let mut fields = self.fields.write();
        match prop {
            Property::Type => panic!("entry type is fixed at creation"),
            Property::SearchMatch => panic!("search-match cannot be set"),
            Property::TitleFolded
            | Property::GenreFolded
            | Property::ArtistFolded
            | Property::AlbumFolded => unreachable!("derived properties are rejected above"),
            Property::Title => {
                fields.title = intern_value(&value, pool);
                fields.title_folded = pool.intern(&search_fold(&fields.title));
            }
            Property::Genre => {
                fields.genre = intern_value(&value, pool);
                fields.genre_folded = pool.intern(&search_fold(&fields.genre));
            }
            Property::Artist => {
                fields.artist = intern_value(&value, pool);
                fields.artist_folded = pool.intern(&search_fold(&fields.artist));
            }
            Property::Album => {
                fields.album = intern_value(&value, pool);
                fields.album_folded = pool.intern(&search_fold(&fields.album));
            }
            Property::Location => fields.location = intern_value(&value, pool),
            Property::Mountpoint => fields.mountpoint = intern_value(&value, pool),
            Property::MimeType => fields.mimetype = intern_value(&value, pool),
            Property::PlaybackError => fields.playback_error = intern_value(&value, pool),
            Property::Description => fields.description = intern_value(&value, pool),
            Property::Subtitle => fields.subtitle = intern_value(&value, pool),
            Property::Summary => fields.summary = intern_value(&value, pool),
            Property::Lang => fields.lang = intern_value(&value, pool),
            Property::Copyright => fields.copyright = intern_value(&value, pool),
            Property::Image => fields.image = intern_value(&value, pool),
            Property::MusicbrainzTrackId => {
                fields.musicbrainz_trackid = intern_value(&value, pool)
            }
            Property::TrackNumber => fields.track_number = value.as_ulong(),
            Property::DiscNumber => fields.disc_number = value.as_ulong(),
            Property::Duration => fields.duration = value.as_ulong(),
            Property::FileSize => fields.file_size = value.as_ulong(),
            Property::Mtime => fields.mtime = value.as_ulong(),
            Property::FirstSeen => fields.first_seen = value.as_ulong(),
            Property::LastSeen => fields.last_seen = value.as_ulong(),
            Property::PlayCount => fields.play_count = value.as_ulong(),
            Property::LastPlayed => fields.last_played = value.as_ulong(),
            Property::Bitrate => fields.bitrate = value.as_ulong(),
            Property::Date => fields.date = value.as_ulong(),
            Property::Status => fields.status = value.as_ulong(),
            Property::PostTime => fields.post_time = value.as_ulong(),
            Property::Rating => fields.rating = value.as_double(),
            Property::TrackGain => fields.track_gain = value.as_double(),
            Property::TrackPeak => fields.track_peak = value.as_double(),
            Property::AlbumGain => fields.album_gain = value.as_double(),
            Property::AlbumPeak => fields.album_peak = value.as_double(),
            Property::Hidden => fields.hidden = value.as_bool(),
        }
    }
}

fn intern_value(value: &Value, pool: &StringPool) -> RefString {
    pool.intern(value.as_str())
}

impl fmt::Debug for Entry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let fields = self.fields.read();
        f.debug_struct("Entry")
            .field("id", &self.id)
            .field("type", &self.entry_type.name())
            .field("location", &fields.location)
            .field("title", &fields.title)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entry_type::{DefaultBehavior, EntryCategory};

    fn song_type() -> Arc<EntryType> {
        EntryType::new("song", EntryCategory::Normal, true, Box::new(DefaultBehavior))
    }

    #[test]
    fn folded_mirrors_follow_base() {
        let pool = StringPool::new();
        let entry = Entry::new(EntryId(1), song_type(), "file:///a.ogg", &pool);
        entry.set_uninserted(
            Property::Title,
            Value::Str(pool.intern("Señorita")),
            &pool,
        );
        assert_eq!(entry.get(Property::TitleFolded).as_str(), "senorita");
    }

    #[test]
    fn default_playback_uri_is_location() {
        let pool = StringPool::new();
        let entry = Entry::new(EntryId(2), song_type(), "file:///b.ogg", &pool);
        assert_eq!(entry.playback_uri().as_deref(), Some("file:///b.ogg"));
    }

    #[test]
    #[should_panic(expected = "derived property")]
    fn setting_folded_panics() {
        let pool = StringPool::new();
        let entry = Entry::new(EntryId(3), song_type(), "file:///c.ogg", &pool);
        entry.set_uninserted(
            Property::TitleFolded,
            Value::Str(pool.intern("x")),
            &pool,
        );
    }
}
