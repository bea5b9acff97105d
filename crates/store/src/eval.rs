//! Query evaluation against the grouping index. A conjunctive branch
//! consumes its equality clauses on type, genre, artist and album by
//! descending one index level per clause; whatever clauses remain are
//! checked per candidate entry.

use std::cmp::Ordering as CmpOrdering;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;
use tracing::debug;

use common::{search_fold, split_words, Entry, EntryId, EntryRef, Property, RefString, Value};
use query::{Clause, Op, Query};

use crate::tree::NodeId;
use crate::{Inner, Store};

/// Matches are delivered in batches of at most this many entries.
pub const QUERY_BATCH: usize = 64;

/// Fields searched by the free-text property, in fallback order.
const SEARCH_FIELDS: [Property; 4] = [
    Property::TitleFolded,
    Property::GenreFolded,
    Property::ArtistFolded,
    Property::AlbumFolded,
];

/// Receives match batches from an evaluation that may run on a worker
/// thread.
pub trait QueryResults: Send + Sync {
    fn add_results(&self, entries: Vec<EntryRef>);
    fn finished(&self);
}

/// Accumulates everything an evaluation delivers. For synchronous
/// callers and tests.
pub struct CollectResults {
    entries: Mutex<Vec<EntryRef>>,
    done: AtomicBool,
}

impl CollectResults {
    pub fn new() -> CollectResults {
        CollectResults {
            entries: Mutex::new(Vec::new()),
            done: AtomicBool::new(false),
        }
    }

    pub fn is_finished(&self) -> bool {
        self.done.load(Ordering::Acquire)
    }

    pub fn take(&self) -> Vec<EntryRef> {
        std::mem::take(&mut self.entries.lock())
    }
}

impl Default for CollectResults {
    fn default() -> Self {
        CollectResults::new()
    }
}

impl QueryResults for CollectResults {
    fn add_results(&self, entries: Vec<EntryRef>) {
        self.entries.lock().extend(entries);
    }

    fn finished(&self) {
        self.done.store(true, Ordering::Release);
    }
}

pub(crate) fn run(store: &Store, query: &Query, results: &dyn QueryResults, cancel: &AtomicBool) {
    let mut compiled = query.clone();
    compiled.preprocess(store.pool());
    let branches = compiled.split_disjunctions();

    let inner = store.inner.read();
    let mut seen: HashSet<EntryId> = HashSet::new();
    let mut batch: Vec<EntryRef> = Vec::with_capacity(QUERY_BATCH);
    let mut delivered = 0usize;
    for branch in &branches {
        if !conjunctive(&inner, branch, results, cancel, &mut seen, &mut batch, &mut delivered) {
            break;
        }
    }
    if !batch.is_empty() {
        delivered += batch.len();
        results.add_results(std::mem::take(&mut batch));
    }
    debug!(matches = delivered, branches = branches.len(), "query finished");
    results.finished();
}

/// Index levels in descent order, paired with the property whose
/// equality clause each consumes.
const LEVELS: [Property; 4] = [
    Property::Type,
    Property::Genre,
    Property::Artist,
    Property::Album,
];

/// Evaluates one conjunctive branch. Returns false once cancelled.
#[allow(clippy::too_many_arguments)]
fn conjunctive(
    inner: &Inner,
    branch: &Query,
    results: &dyn QueryResults,
    cancel: &AtomicBool,
    seen: &mut HashSet<EntryId>,
    batch: &mut Vec<EntryRef>,
    delivered: &mut usize,
) -> bool {
    let mut clauses: Vec<Clause> = branch.clauses().to_vec();
    let mut keys: [Option<RefString>; 4] = [None, None, None, None];
    for (slot, prop) in LEVELS.iter().enumerate() {
        match take_equality(&mut clauses, *prop) {
            Ok(key) => keys[slot] = key,
            // Two different equality literals at one level can never
            // both hold; the branch is empty.
            Err(()) => return true,
        }
    }

    let type_nodes: Vec<NodeId> = match &keys[0] {
        Some(name) => inner.index.type_node(name).into_iter().collect(),
        None => inner.index.type_nodes().collect(),
    };
    for type_node in type_nodes {
        for genre in level_nodes(inner, type_node, &keys[1]) {
            if cancel.load(Ordering::Relaxed) {
                return false;
            }
            for artist in level_nodes(inner, genre, &keys[2]) {
                for album in level_nodes(inner, artist, &keys[3]) {
                    for entry in inner.index.entries(album) {
                        if seen.contains(&entry.id()) {
                            continue;
                        }
                        if clauses.iter().all(|c| clause_matches(entry, c)) {
                            seen.insert(entry.id());
                            batch.push(entry.clone());
                            if batch.len() >= QUERY_BATCH {
                                *delivered += batch.len();
                                results.add_results(std::mem::take(batch));
                                if cancel.load(Ordering::Relaxed) {
                                    return false;
                                }
                            }
                        }
                    }
                }
            }
        }
    }
    true
}

fn level_nodes(inner: &Inner, node: NodeId, key: &Option<RefString>) -> Vec<NodeId> {
    match key {
        Some(key) => inner.index.child(node, key).into_iter().collect(),
        None => inner.index.children(node).collect(),
    }
}

/// Pulls the top-level equality clause on `prop` out of the clause
/// list, if any. `Err` means two clashing literals were found.
fn take_equality(clauses: &mut Vec<Clause>, prop: Property) -> Result<Option<RefString>, ()> {
    let mut found: Option<RefString> = None;
    let mut i = 0;
    while i < clauses.len() {
        let key = match &clauses[i] {
            Clause::Prop {
                op: Op::Equals,
                prop: p,
                value: Value::Str(s),
            } if *p == prop => Some(s.clone()),
            _ => None,
        };
        match key {
            Some(key) => {
                if let Some(existing) = &found {
                    if *existing != key {
                        return Err(());
                    }
                } else {
                    found = Some(key);
                }
                clauses.remove(i);
            }
            None => i += 1,
        }
    }
    Ok(found)
}

/// True when the entry satisfies the query, disjunctions and nested
/// sub-queries included. Assumes the query has been preprocessed.
pub fn entry_matches(entry: &Entry, query: &Query) -> bool {
    query
        .split_disjunctions()
        .iter()
        .any(|branch| branch.clauses().iter().all(|c| clause_matches(entry, c)))
}

fn clause_matches(entry: &Entry, clause: &Clause) -> bool {
    match clause {
        // Disjunctions at this level were consumed by splitting.
        Clause::Disjunction => true,
        Clause::SubQuery(sub) => entry_matches(entry, sub),
        Clause::Prop { op, prop, value } => prop_matches(entry, *op, *prop, value),
    }
}

fn prop_matches(entry: &Entry, op: Op, prop: Property, literal: &Value) -> bool {
    if prop == Property::Type {
        let eq = entry.entry_type().name() == literal.as_str();
        return match op {
            Op::Equals | Op::Like => eq,
            Op::NotLike => !eq,
            other => panic!("operator {:?} is not valid on the type property", other),
        };
    }
    if prop == Property::SearchMatch {
        let hit = search_matches(entry, literal);
        return match op {
            Op::Equals | Op::Like => hit,
            Op::NotLike => !hit,
            other => panic!("operator {:?} is not valid on search-match", other),
        };
    }
    let value = entry.get(prop);
    match op {
        Op::Equals => value.matches_eq(literal),
        Op::Like => value_contains(&value, literal),
        Op::NotLike => !value_contains(&value, literal),
        Op::Prefix => value.as_str().starts_with(literal.as_str()),
        Op::Suffix => value.as_str().ends_with(literal.as_str()),
        // Range operators are inclusive at both ends.
        Op::Greater => value.compare(literal) != CmpOrdering::Less,
        Op::Less => value.compare(literal) != CmpOrdering::Greater,
        Op::YearEquals => match query::year_bounds(literal.as_ulong()) {
            Some((begin, end)) => {
                let day = value.as_ulong();
                day >= begin && day <= end
            }
            None => value.as_ulong() == literal.as_ulong(),
        },
        Op::YearGreater => {
            let bound = query::year_bounds(literal.as_ulong())
                .map(|(begin, _)| begin)
                .unwrap_or_else(|| literal.as_ulong());
            value.as_ulong() >= bound
        }
        Op::YearLess => {
            let bound = query::year_bounds(literal.as_ulong())
                .map(|(_, end)| end)
                .unwrap_or_else(|| literal.as_ulong());
            value.as_ulong() <= bound
        }
    }
}

/// Substring containment for strings; plain equality for scalar kinds,
/// which is what a like clause degenerates to there.
fn value_contains(value: &Value, literal: &Value) -> bool {
    match (value, literal) {
        (Value::Str(haystack), Value::Str(needle)) => haystack.as_str().contains(needle.as_str()),
        _ => value.matches_eq(literal),
    }
}

/// Every search word must appear in at least one of the four folded
/// fallback fields.
fn search_matches(entry: &Entry, literal: &Value) -> bool {
    let folded_words;
    let words: &[String] = match literal {
        Value::StrList(words) => words,
        // Raw text reaches here only when the query skipped
        // preprocessing; fold on the fly.
        Value::Str(text) => {
            folded_words = split_words(&search_fold(text));
            &folded_words
        }
        other => panic!("search-match literal must be text, got {:?}", other.kind()),
    };
    if words.is_empty() {
        return true;
    }
    let fields: Vec<String> = SEARCH_FIELDS
        .iter()
        .map(|&prop| entry.get(prop).as_str().to_string())
        .collect();
    words
        .iter()
        .all(|word| fields.iter().any(|field| field.contains(word.as_str())))
}
