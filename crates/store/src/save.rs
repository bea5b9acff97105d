//! Streaming save of the whole store. Entries are written in id order
//! so identical stores produce identical files; default-valued fields
//! are suppressed except the ones that must distinguish "explicit
//! zero" from "never written".

use std::fmt;
use std::fs::{self, File};
use std::io::{self, BufWriter, Write};
use std::path::Path;

use tracing::info;

use common::xml::XmlWriter;
use common::{EntryRef, Property};

use crate::Store;

pub const DB_VERSION: &str = "1.1";

pub(crate) const ROOT_ELT: &str = "media-db";
pub(crate) const ENTRY_ELT: &str = "entry";
pub(crate) const TYPE_ATTR: &str = "type";
pub(crate) const VERSION_ATTR: &str = "version";

#[derive(Debug)]
pub enum SaveError {
    Io(io::Error),
}

impl fmt::Display for SaveError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SaveError::Io(err) => write!(f, "save failed: {}", err),
        }
    }
}

impl std::error::Error for SaveError {}

impl From<io::Error> for SaveError {
    fn from(err: io::Error) -> Self {
        SaveError::Io(err)
    }
}

/// Writes the store to a sibling temp file and renames it over the
/// target, so a failed save leaves the previous copy untouched.
pub(crate) fn save_store(store: &Store, path: &Path) -> Result<(), SaveError> {
    let mut entries: Vec<EntryRef> = {
        let inner = store.inner.read();
        inner
            .by_location
            .values()
            .filter(|entry| entry.entry_type().save_to_disk())
            .cloned()
            .collect()
    };
    entries.sort_by_key(|entry| entry.id());

    let file_name = path
        .file_name()
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "save path has no file name"))?;
    let tmp_path = path.with_file_name(format!("{}.tmp", file_name.to_string_lossy()));

    let file = File::create(&tmp_path)?;
    let mut writer = XmlWriter::new(BufWriter::new(file));
    writer.declaration()?;
    writer.open(ROOT_ELT, &[(VERSION_ATTR, DB_VERSION)])?;
    for entry in &entries {
        write_entry(&mut writer, entry)?;
    }
    writer.close(ROOT_ELT)?;

    let file = writer
        .into_inner()
        .into_inner()
        .map_err(|err| SaveError::Io(err.into_error()))?;
    file.sync_all()?;
    drop(file);
    fs::rename(&tmp_path, path)?;
    info!(path = %path.display(), entries = entries.len(), "store saved");
    Ok(())
}

fn write_entry<W: Write>(writer: &mut XmlWriter<W>, entry: &EntryRef) -> io::Result<()> {
    writer.open(ENTRY_ELT, &[(TYPE_ATTR, entry.entry_type().name())])?;
    for &prop in Property::SAVE_ORDER {
        let value = entry.get(prop);
        if value.is_default() && !prop.always_written() {
            continue;
        }
        writer.element_text(prop.tag_name(), &value.to_text())?;
    }
    writer.close(ENTRY_ELT)
}
