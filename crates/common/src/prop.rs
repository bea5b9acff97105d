use std::fmt;

/// Every addressable entry property. Declaration order is the canonical
/// order properties are written to disk in.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Property {
    Type,
    Title,
    Genre,
    Artist,
    Album,
    TrackNumber,
    DiscNumber,
    Duration,
    FileSize,
    Location,
    Mountpoint,
    Mtime,
    FirstSeen,
    LastSeen,
    Rating,
    PlayCount,
    LastPlayed,
    Bitrate,
    Date,
    TrackGain,
    TrackPeak,
    AlbumGain,
    AlbumPeak,
    MimeType,
    TitleFolded,
    GenreFolded,
    ArtistFolded,
    AlbumFolded,
    Hidden,
    PlaybackError,
    Status,
    Description,
    Subtitle,
    Summary,
    Lang,
    Copyright,
    Image,
    PostTime,
    MusicbrainzTrackId,
    /// Query-only free-text match across title/genre/artist/album.
    SearchMatch,
}

/// The value shape a property carries.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ValueKind {
    Str,
    Bool,
    ULong,
    Double,
    StrList,
}

impl Property {
    /// Canonical on-disk order; excludes derived and query-only properties.
    pub const SAVE_ORDER: &'static [Property] = &[
        Property::Title,
        Property::Genre,
        Property::Artist,
        Property::Album,
        Property::TrackNumber,
        Property::DiscNumber,
        Property::Duration,
        Property::FileSize,
        Property::Location,
        Property::Mountpoint,
        Property::Mtime,
        Property::FirstSeen,
        Property::LastSeen,
        Property::Rating,
        Property::PlayCount,
        Property::LastPlayed,
        Property::Bitrate,
        Property::Date,
        Property::TrackGain,
        Property::TrackPeak,
        Property::AlbumGain,
        Property::AlbumPeak,
        Property::MimeType,
        Property::Hidden,
        Property::Status,
        Property::Description,
        Property::Subtitle,
        Property::Summary,
        Property::Lang,
        Property::Copyright,
        Property::Image,
        Property::PostTime,
        Property::MusicbrainzTrackId,
    ];

    pub fn kind(self) -> ValueKind {
        match self {
            Property::Type
            | Property::Title
            | Property::Genre
            | Property::Artist
            | Property::Album
            | Property::Location
            | Property::Mountpoint
            | Property::MimeType
            | Property::TitleFolded
            | Property::GenreFolded
            | Property::ArtistFolded
            | Property::AlbumFolded
            | Property::PlaybackError
            | Property::Description
            | Property::Subtitle
            | Property::Summary
            | Property::Lang
            | Property::Copyright
            | Property::Image
            | Property::MusicbrainzTrackId => ValueKind::Str,
            Property::Hidden => ValueKind::Bool,
            Property::TrackNumber
            | Property::DiscNumber
            | Property::Duration
            | Property::FileSize
            | Property::Mtime
            | Property::FirstSeen
            | Property::LastSeen
            | Property::PlayCount
            | Property::LastPlayed
            | Property::Bitrate
            | Property::Date
            | Property::Status
            | Property::PostTime => ValueKind::ULong,
            Property::Rating
            | Property::TrackGain
            | Property::TrackPeak
            | Property::AlbumGain
            | Property::AlbumPeak => ValueKind::Double,
            // Raw search text is a string; preprocessing turns it into
            // a word list.
            Property::SearchMatch => ValueKind::Str,
        }
    }

    /// Stable element tag name used on disk and in serialized queries.
    pub fn tag_name(self) -> &'static str {
        match self {
            Property::Type => "type",
            Property::Title => "title",
            Property::Genre => "genre",
            Property::Artist => "artist",
            Property::Album => "album",
            Property::TrackNumber => "track-number",
            Property::DiscNumber => "disc-number",
            Property::Duration => "duration",
            Property::FileSize => "file-size",
            Property::Location => "location",
            Property::Mountpoint => "mountpoint",
            Property::Mtime => "mtime",
            Property::FirstSeen => "first-seen",
            Property::LastSeen => "last-seen",
            Property::Rating => "rating",
            Property::PlayCount => "play-count",
            Property::LastPlayed => "last-played",
            Property::Bitrate => "bitrate",
            Property::Date => "date",
            Property::TrackGain => "track-gain",
            Property::TrackPeak => "track-peak",
            Property::AlbumGain => "album-gain",
            Property::AlbumPeak => "album-peak",
            Property::MimeType => "mimetype",
            Property::TitleFolded => "title-folded",
            Property::GenreFolded => "genre-folded",
            Property::ArtistFolded => "artist-folded",
            Property::AlbumFolded => "album-folded",
            Property::Hidden => "hidden",
            Property::PlaybackError => "playback-error",
            Property::Status => "status",
            Property::Description => "description",
            Property::Subtitle => "subtitle",
            Property::Summary => "summary",
            Property::Lang => "lang",
            Property::Copyright => "copyright",
            Property::Image => "image",
            Property::PostTime => "post-time",
            Property::MusicbrainzTrackId => "mb-trackid",
            Property::SearchMatch => "search-match",
        }
    }

    pub fn from_tag_name(name: &str) -> Option<Property> {
        let prop = match name {
            "type" => Property::Type,
            "title" => Property::Title,
            "genre" => Property::Genre,
            "artist" => Property::Artist,
            "album" => Property::Album,
            "track-number" => Property::TrackNumber,
            "disc-number" => Property::DiscNumber,
            "duration" => Property::Duration,
            "file-size" => Property::FileSize,
            "location" => Property::Location,
            "mountpoint" => Property::Mountpoint,
            "mtime" => Property::Mtime,
            "first-seen" => Property::FirstSeen,
            "last-seen" => Property::LastSeen,
            "rating" => Property::Rating,
            "play-count" => Property::PlayCount,
            "last-played" => Property::LastPlayed,
            "bitrate" => Property::Bitrate,
            "date" => Property::Date,
            "track-gain" => Property::TrackGain,
            "track-peak" => Property::TrackPeak,
            "album-gain" => Property::AlbumGain,
            "album-peak" => Property::AlbumPeak,
            "mimetype" => Property::MimeType,
            "title-folded" => Property::TitleFolded,
            "genre-folded" => Property::GenreFolded,
            "artist-folded" => Property::ArtistFolded,
            "album-folded" => Property::AlbumFolded,
            "hidden" => Property::Hidden,
            "playback-error" => Property::PlaybackError,
            "status" => Property::Status,
            "description" => Property::Description,
            "subtitle" => Property::Subtitle,
            "summary" => Property::Summary,
            "lang" => Property::Lang,
            "copyright" => Property::Copyright,
            "image" => Property::Image,
            "post-time" => Property::PostTime,
            "mb-trackid" => Property::MusicbrainzTrackId,
            "search-match" => Property::SearchMatch,
            _ => return None,
        };
        Some(prop)
    }

    /// True for genre/artist/album/type, the four grouping-index keys.
    pub fn is_indexed(self) -> bool {
        matches!(
            self,
            Property::Type | Property::Genre | Property::Artist | Property::Album
        )
    }

    /// Derived properties are maintained by the store and can be read
    /// and queried but never set or persisted.
    pub fn is_derived(self) -> bool {
        matches!(
            self,
            Property::TitleFolded
                | Property::GenreFolded
                | Property::ArtistFolded
                | Property::AlbumFolded
        )
    }

    /// Base property a folded derivative mirrors, if any.
    pub fn folded_base(self) -> Option<Property> {
        match self {
            Property::TitleFolded => Some(Property::Title),
            Property::GenreFolded => Some(Property::Genre),
            Property::ArtistFolded => Some(Property::Artist),
            Property::AlbumFolded => Some(Property::Album),
            _ => None,
        }
    }

    /// Written to disk even when the value is the default. Distinguishes
    /// an explicit zero rating from a rating that was never recorded.
    pub fn always_written(self) -> bool {
        matches!(self, Property::Rating)
    }
}

impl fmt::Display for Property {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.tag_name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tag_names_round_trip() {
        for &prop in Property::SAVE_ORDER {
            assert_eq!(Property::from_tag_name(prop.tag_name()), Some(prop));
        }
        assert_eq!(Property::from_tag_name("type"), Some(Property::Type));
        assert_eq!(Property::from_tag_name("no-such-prop"), None);
    }

    #[test]
    fn save_order_skips_derived_and_synthetic() {
        for &prop in Property::SAVE_ORDER {
            assert!(!prop.is_derived());
            assert_ne!(prop, Property::SearchMatch);
            assert_ne!(prop, Property::Type);
        }
    }

    #[test]
    fn folded_bases() {
        assert_eq!(Property::TitleFolded.folded_base(), Some(Property::Title));
        assert_eq!(Property::Artist.folded_base(), None);
    }
}
