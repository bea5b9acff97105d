//! Streaming load: a small state machine over structural tokens that
//! accumulates one entry at a time and commits it on its closing
//! element. Entries already committed survive a parse error further
//! down the file.

use std::fmt;
use std::fs;
use std::io;
use std::path::Path;

use tracing::{info, warn};

use common::xml::{XmlError, XmlToken, XmlTokenReader};
use common::{Property, Value};

use crate::save::{ENTRY_ELT, ROOT_ELT, TYPE_ATTR, VERSION_ATTR};
use crate::Store;

const LEGACY_VERSION: &str = "1.0";

#[derive(Debug)]
pub enum LoadError {
    Io(io::Error),
    Xml(XmlError),
    Malformed(String),
}

impl fmt::Display for LoadError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LoadError::Io(err) => write!(f, "load failed: {}", err),
            LoadError::Xml(err) => write!(f, "load failed: {}", err),
            LoadError::Malformed(msg) => write!(f, "malformed database file: {}", msg),
        }
    }
}

impl std::error::Error for LoadError {}

impl From<io::Error> for LoadError {
    fn from(err: io::Error) -> Self {
        LoadError::Io(err)
    }
}

impl From<XmlError> for LoadError {
    fn from(err: XmlError) -> Self {
        LoadError::Xml(err)
    }
}

enum State {
    Start,
    Root,
    Entry(PendingEntry),
    EntryProperty(PendingEntry, Property, String),
    End,
}

struct PendingEntry {
    type_name: String,
    props: Vec<(Property, Value)>,
}

pub(crate) fn load_store(store: &Store, path: &Path) -> Result<(), LoadError> {
    let text = fs::read_to_string(path)?;
    let mut tokens = XmlTokenReader::new(&text);
    let mut state = State::Start;
    let mut legacy = false;
    let mut loaded = 0usize;

    while let Some(token) = tokens.next() {
        let token = token?;
        state = match (state, token) {
            (State::Start, XmlToken::Open { name, attrs }) => {
                if name != ROOT_ELT {
                    return Err(LoadError::Malformed(format!(
                        "expected <{}> root, found <{}>",
                        ROOT_ELT, name
                    )));
                }
                let version = attrs
                    .iter()
                    .find(|(key, _)| key == VERSION_ATTR)
                    .map(|(_, value)| value.as_str())
                    .unwrap_or(LEGACY_VERSION);
                legacy = version == LEGACY_VERSION;
                if legacy {
                    info!(version, "loading legacy database, canonicalizing locations");
                }
                State::Root
            }
            (State::Start, XmlToken::Text(_)) => State::Start,
            (State::Start, token) => {
                return Err(LoadError::Malformed(format!(
                    "unexpected {:?} before root element",
                    token
                )))
            }

            (State::Root, XmlToken::Open { name, attrs }) => {
                if name != ENTRY_ELT {
                    warn!(element = %name, "unknown element in database root, skipped");
                    skip_element(&mut tokens)?;
                    State::Root
                } else {
                    let type_name = attrs
                        .iter()
                        .find(|(key, _)| key == TYPE_ATTR)
                        .map(|(_, value)| value.clone())
                        .unwrap_or_else(|| "song".to_string());
                    if store.entry_type(&type_name).is_none() {
                        warn!(type_name, "entry of unregistered type, skipped");
                        skip_element(&mut tokens)?;
                        State::Root
                    } else {
                        State::Entry(PendingEntry {
                            type_name,
                            props: Vec::new(),
                        })
                    }
                }
            }
            (State::Root, XmlToken::Close(name)) if name == ROOT_ELT => State::End,
            (State::Root, XmlToken::Text(_)) => State::Root,
            (State::Root, token) => {
                return Err(LoadError::Malformed(format!(
                    "unexpected {:?} in database root",
                    token
                )))
            }

            (State::Entry(pending), XmlToken::Open { name, .. }) => {
                match Property::from_tag_name(&name) {
                    Some(prop)
                        if !prop.is_derived()
                            && prop != Property::SearchMatch
                            && prop != Property::Type =>
                    {
                        State::EntryProperty(pending, prop, String::new())
                    }
                    _ => {
                        warn!(element = %name, "unsupported entry property, skipped");
                        skip_element(&mut tokens)?;
                        State::Entry(pending)
                    }
                }
            }
            (State::Entry(pending), XmlToken::Close(name)) if name == ENTRY_ELT => {
                if commit_entry(store, pending, legacy) {
                    loaded += 1;
                }
                State::Root
            }
            (State::Entry(pending), XmlToken::Text(_)) => State::Entry(pending),
            (State::Entry(_), token) => {
                return Err(LoadError::Malformed(format!(
                    "unexpected {:?} inside entry",
                    token
                )))
            }

            (State::EntryProperty(pending, prop, mut text), XmlToken::Text(chunk)) => {
                text.push_str(&chunk);
                State::EntryProperty(pending, prop, text)
            }
            (State::EntryProperty(mut pending, prop, text), XmlToken::Close(_)) => {
                match Value::from_text(prop.kind(), &text, store.pool()) {
                    Ok(value) => pending.props.push((prop, value)),
                    Err(err) => warn!(prop = %prop, %err, "unparsable property value, dropped"),
                }
                State::Entry(pending)
            }
            (State::EntryProperty(..), token) => {
                return Err(LoadError::Malformed(format!(
                    "unexpected {:?} inside property element",
                    token
                )))
            }

            (State::End, _) => State::End,
        };
    }

    info!(path = %path.display(), entries = loaded, "store loaded");
    Ok(())
}

/// Consumes tokens until the just-opened element is balanced.
fn skip_element(tokens: &mut XmlTokenReader<'_>) -> Result<(), LoadError> {
    let mut depth = 1usize;
    for token in tokens {
        match token? {
            XmlToken::Open { .. } => depth += 1,
            XmlToken::Close(_) => {
                depth -= 1;
                if depth == 0 {
                    return Ok(());
                }
            }
            XmlToken::Text(_) => {}
        }
    }
    Err(LoadError::Malformed("unterminated element".to_string()))
}

/// Builds and inserts one parsed entry. Returns false when the record
/// was discarded or merged instead.
fn commit_entry(store: &Store, pending: PendingEntry, legacy: bool) -> bool {
    let location = pending.props.iter().find_map(|(prop, value)| {
        (*prop == Property::Location).then(|| value.as_str().to_string())
    });
    let location = match location {
        Some(location) if !location.is_empty() => location,
        _ => {
            warn!("entry with no location, skipped");
            return false;
        }
    };
    let location = if legacy {
        canonicalize_legacy(&location)
    } else {
        location
    };

    if let Some(existing) = store.lookup_by_location(&location) {
        warn!(%location, "duplicate location, merging play statistics");
        merge_duplicate(store, &existing, &pending);
        return false;
    }

    let entry = match store.create(&pending.type_name, &location) {
        Ok(entry) => entry,
        Err(err) => {
            warn!(%err, "cannot recreate stored entry, skipped");
            return false;
        }
    };
    for (prop, value) in pending.props {
        if prop == Property::Location {
            continue;
        }
        entry.set_uninserted(prop, value, store.pool());
    }
    // No recorded date means the metadata was never read; flag the
    // entry for a future scan.
    if entry.get(Property::Date).as_ulong() == 0 {
        entry.set_needs_refresh(true);
    }
    store.insert(&entry);
    true
}

/// Folds a duplicate record's play statistics into the entry already
/// loaded: counts are summed, ratings averaged when both are set and
/// the non-zero one taken otherwise, and the most recent last-played
/// time wins.
fn merge_duplicate(store: &Store, existing: &common::EntryRef, pending: &PendingEntry) {
    let mut play_count = 0u64;
    let mut rating = 0.0f64;
    let mut last_played = 0u64;
    for (prop, value) in &pending.props {
        match prop {
            Property::PlayCount => play_count = value.as_ulong(),
            Property::Rating => rating = value.as_double(),
            Property::LastPlayed => last_played = value.as_ulong(),
            _ => {}
        }
    }
    if play_count > 0 {
        store.set_property(
            existing,
            Property::PlayCount,
            Value::ULong(existing.play_count() + play_count),
        );
    }
    if rating != 0.0 {
        let merged = if existing.rating() != 0.0 {
            (existing.rating() + rating) / 2.0
        } else {
            rating
        };
        store.set_property(existing, Property::Rating, Value::Double(merged));
    }
    if last_played > existing.last_played() {
        store.set_property(existing, Property::LastPlayed, Value::ULong(last_played));
    }
}

/// Pre-1.1 files stored raw paths; give them a scheme and escape the
/// spaces so they key identically to freshly imported locations.
fn canonicalize_legacy(location: &str) -> String {
    let with_scheme = if location.contains("://") {
        location.to_string()
    } else {
        format!("file://{}", location)
    };
    with_scheme.replace(' ', "%20")
}
