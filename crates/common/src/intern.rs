use std::borrow::Borrow;
use std::collections::HashSet;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::ops::Deref;
use std::sync::Arc;

use parking_lot::Mutex;

/// A shared interned string. Cloning acquires a reference, dropping
/// releases it; two handles obtained from the same pool for equal text
/// point at the same allocation, so equality is a pointer check first.
#[derive(Clone)]
pub struct RefString(Arc<str>);

impl RefString {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn ptr_eq(a: &RefString, b: &RefString) -> bool {
        Arc::ptr_eq(&a.0, &b.0)
    }
}

impl PartialEq for RefString {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0) || self.0 == other.0
    }
}

impl Eq for RefString {}

impl PartialEq<str> for RefString {
    fn eq(&self, other: &str) -> bool {
        &*self.0 == other
    }
}

impl Hash for RefString {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.0.hash(state)
    }
}

impl Borrow<str> for RefString {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl Deref for RefString {
    type Target = str;

    fn deref(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RefString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for RefString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", &*self.0)
    }
}

/// Interning pool for entry strings. Handles stay valid for as long as
/// anyone holds them; `sweep` evicts pooled strings with no outside
/// holders left.
pub struct StringPool {
    inner: Mutex<HashSet<Arc<str>>>,
}

impl StringPool {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(HashSet::new()),
        }
    }

    pub fn intern(&self, s: &str) -> RefString {
        let mut pool = self.inner.lock();
        if let Some(existing) = pool.get(s) {
            return RefString(Arc::clone(existing));
        }
        let arc: Arc<str> = Arc::from(s);
        pool.insert(Arc::clone(&arc));
        RefString(arc)
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }

    /// Drops pooled strings nobody outside the pool references.
    /// Returns how many were evicted.
    pub fn sweep(&self) -> usize {
        let mut pool = self.inner.lock();
        let before = pool.len();
        pool.retain(|s| Arc::strong_count(s) > 1);
        before - pool.len()
    }
}

impl Default for StringPool {
    fn default() -> Self {
        Self::new()
    }
}

/// Case-folds a string for search matching: lowercase, common diacritics
/// stripped, punctuation collapsed to single spaces.
pub fn search_fold(value: &str) -> String {
    let lower = value.trim().to_lowercase();
    let mut out = String::with_capacity(lower.len());
    let mut last_space = false;
    for ch in lower.chars() {
        let mapped = match ch {
            'à' | 'á' | 'â' | 'ä' | 'ã' | 'å' => 'a',
            'ç' => 'c',
            'è' | 'é' | 'ê' | 'ë' => 'e',
            'ì' | 'í' | 'î' | 'ï' => 'i',
            'ñ' => 'n',
            'ò' | 'ó' | 'ô' | 'ö' | 'õ' => 'o',
            'ù' | 'ú' | 'û' | 'ü' => 'u',
            'ý' | 'ÿ' => 'y',
            'œ' => {
                out.push('o');
                'e'
            }
            'æ' => {
                out.push('a');
                'e'
            }
            _ => ch,
        };
        if mapped.is_alphanumeric() {
            out.push(mapped);
            last_space = false;
        } else if !last_space && !out.is_empty() {
            out.push(' ');
            last_space = true;
        }
    }
    while out.ends_with(' ') {
        out.pop();
    }
    out
}

/// Splits folded text into search words, dropping empties.
pub fn split_words(value: &str) -> Vec<String> {
    value
        .split_whitespace()
        .filter(|w| !w.is_empty())
        .map(|w| w.to_string())
        .collect()
}
