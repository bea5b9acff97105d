pub mod entry;
pub mod entry_type;
pub mod intern;
pub mod prop;
pub mod value;
pub mod xml;

pub use entry::{Entry, EntryId, EntryRef};
pub use entry_type::{
    AvailabilityEvent, DefaultBehavior, EntryCategory, EntryType, EntryTypeBehavior,
    PropertyChange, SongBehavior, SyncError, TypeData,
};
pub use intern::{search_fold, split_words, RefString, StringPool};
pub use prop::{Property, ValueKind};
pub use value::{Value, ValueParseError};

/// Placeholder assigned to required string fields that arrive empty.
pub const UNKNOWN: &str = "Unknown";
