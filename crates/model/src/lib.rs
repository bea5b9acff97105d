//! The result sequence: a live, ordered, deduplicated view of one
//! query's matches. Producers (evaluation workers, the writer context)
//! enqueue updates into a bounded channel; the consumer drains them
//! with a time budget via `poll`, so a render loop is never stalled by
//! a large batch.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam_channel::{bounded, Receiver, Sender};
use parking_lot::Mutex;
use tracing::debug;

use common::{EntryId, EntryRef, PropertyChange};
use query::Query;
use store::{entry_matches, QueryResults, Store, StoreListener};

/// Producers block once this many updates are waiting; the consumer is
/// expected to poll often enough that they rarely do.
const UPDATE_QUEUE_DEPTH: usize = 1024;

enum Update {
    Add(EntryRef),
    Change(EntryRef),
    Remove(EntryRef),
}

/// One applied change to the visible order. Any event invalidates all
/// previously obtained positions.
pub enum RowEvent<'a> {
    Inserted(usize, &'a EntryRef),
    Changed(usize, &'a EntryRef),
    Removed(usize, &'a EntryRef),
}

/// Arrival-ordered visible rows. Entries live in append-ordered slots
/// whose indices never shift, with a Fenwick tree of alive flags on
/// top: the slot index doubles as a stable handle, and append, removal,
/// rank lookup, and positional access each cost O(log n).
struct RowOrder {
    /// One-based partial sums of alive flags; `tree[0]` is unused.
    tree: Vec<u32>,
    slots: Vec<Option<EntryRef>>,
    handles: HashMap<EntryId, usize>,
    alive: usize,
}

impl RowOrder {
    fn new() -> RowOrder {
        RowOrder {
            tree: vec![0],
            slots: Vec::new(),
            handles: HashMap::new(),
            alive: 0,
        }
    }

    fn len(&self) -> usize {
        self.alive
    }

    /// Alive slots among the first `count`.
    fn prefix(&self, count: usize) -> u32 {
        let mut idx = count;
        let mut sum = 0;
        while idx > 0 {
            sum += self.tree[idx];
            idx &= idx - 1;
        }
        sum
    }

    /// Appends at the end and returns the new row's position.
    fn append(&mut self, entry: EntryRef) -> usize {
        let slot = self.slots.len();
        let idx = slot + 1;
        let lowbit = idx & idx.wrapping_neg();
        let covered = self.prefix(idx - 1) - self.prefix(idx - lowbit);
        self.tree.push(covered + 1);
        self.handles.insert(entry.id(), slot);
        self.slots.push(Some(entry));
        self.alive += 1;
        self.alive - 1
    }

    /// Removes the entry and returns the position it occupied.
    fn remove(&mut self, id: EntryId) -> Option<usize> {
        let slot = self.handles.remove(&id)?;
        let position = self.prefix(slot) as usize;
        self.slots[slot] = None;
        let mut idx = slot + 1;
        while idx < self.tree.len() {
            self.tree[idx] -= 1;
            idx += idx & idx.wrapping_neg();
        }
        self.alive -= 1;
        self.maybe_compact();
        Some(position)
    }

    fn position_of(&self, id: EntryId) -> Option<usize> {
        let slot = *self.handles.get(&id)?;
        Some(self.prefix(slot) as usize)
    }

    fn get(&self, position: usize) -> Option<EntryRef> {
        if position >= self.alive {
            return None;
        }
        // Descend the implicit tree to the slot holding the
        // (position + 1)-th alive entry.
        let mut remaining = position as u32 + 1;
        let mut slot = 0usize;
        let mut bit = self.tree.len().next_power_of_two();
        while bit > 0 {
            let next = slot + bit;
            if next < self.tree.len() && self.tree[next] < remaining {
                slot = next;
                remaining -= self.tree[next];
            }
            bit >>= 1;
        }
        self.slots[slot].clone()
    }

    /// Rebuilds once dead slots outnumber live ones, keeping the slot
    /// array proportional to the visible row count under churn.
    fn maybe_compact(&mut self) {
        if self.slots.len() < 64 || self.alive * 2 >= self.slots.len() {
            return;
        }
        let survivors: Vec<EntryRef> = self.slots.drain(..).flatten().collect();
        self.tree.clear();
        self.tree.push(0);
        self.handles.clear();
        self.alive = 0;
        for entry in survivors {
            self.append(entry);
        }
    }

    /// Drops every row and returns how many were held.
    fn clear(&mut self) -> usize {
        let dropped = self.alive;
        self.tree.clear();
        self.tree.push(0);
        self.slots.clear();
        self.handles.clear();
        self.alive = 0;
        dropped
    }
}

pub struct ResultSequence {
    query: Query,
    tx: Sender<Update>,
    rx: Receiver<Update>,
    /// Entry identities currently in the sequence, tracked at enqueue
    /// time so a deleted entry produces exactly one removal no matter
    /// how many query branches it matched.
    members: Mutex<HashSet<EntryId>>,
    visible: Mutex<RowOrder>,
    complete: AtomicBool,
    disposed: AtomicBool,
}

impl ResultSequence {
    /// Creates an empty sequence subscribed to the store's mutation
    /// events. Call `populate` to run the initial scan.
    pub fn new(store: &Store, query: &Query) -> Arc<ResultSequence> {
        let mut compiled = query.clone();
        compiled.preprocess(store.pool());
        let (tx, rx) = bounded(UPDATE_QUEUE_DEPTH);
        let sequence = Arc::new(ResultSequence {
            query: compiled,
            tx,
            rx,
            members: Mutex::new(HashSet::new()),
            visible: Mutex::new(RowOrder::new()),
            complete: AtomicBool::new(false),
            disposed: AtomicBool::new(false),
        });
        let listener: Arc<dyn StoreListener> = sequence.clone();
        store.add_listener(&listener);
        sequence
    }

    pub fn query(&self) -> &Query {
        &self.query
    }

    /// Runs the full scan that seeds the sequence. May be called from a
    /// worker thread; matches arrive through the update queue.
    pub fn populate(self: &Arc<Self>, store: &Store, cancel: &AtomicBool) {
        store.evaluate_query(&self.query, self.as_ref(), cancel);
    }

    fn enqueue(&self, update: Update) {
        // The receiver lives as long as self, so this only fails after
        // dispose has drained and dropped interest.
        let _ = self.tx.send(update);
    }

    /// Drains pending updates into the visible order until the budget
    /// runs out, invoking the callback once per applied update.
    /// Returns true when more updates remain.
    pub fn poll(&self, budget: Duration, mut callback: impl FnMut(RowEvent<'_>)) -> bool {
        let deadline = Instant::now() + budget;
        let mut visible = self.visible.lock();
        loop {
            if Instant::now() >= deadline {
                return !self.rx.is_empty();
            }
            match self.rx.try_recv() {
                Ok(update) => apply(&mut visible, update, &mut callback),
                Err(_) => return false,
            }
        }
    }

    pub fn len(&self) -> usize {
        self.visible.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.visible.lock().len() == 0
    }

    pub fn get(&self, position: usize) -> Option<EntryRef> {
        self.visible.lock().get(position)
    }

    pub fn position_of(&self, entry: &EntryRef) -> Option<usize> {
        self.visible.lock().position_of(entry.id())
    }

    /// True once the initial scan has delivered everything it will.
    pub fn is_complete(&self) -> bool {
        self.complete.load(Ordering::Acquire)
    }

    pub fn has_pending(&self) -> bool {
        !self.rx.is_empty()
    }

    /// Stops reacting to store events and releases all entry
    /// references. The sequence stays safely callable but empty.
    pub fn dispose(&self) {
        self.disposed.store(true, Ordering::Release);
        while self.rx.try_recv().is_ok() {}
        self.members.lock().clear();
        let dropped = self.visible.lock().clear();
        debug!(entries = dropped, "result sequence disposed");
    }
}

fn apply(visible: &mut RowOrder, update: Update, callback: &mut impl FnMut(RowEvent<'_>)) {
    match update {
        Update::Add(entry) => {
            let position = visible.append(entry.clone());
            callback(RowEvent::Inserted(position, &entry));
        }
        Update::Change(entry) => {
            if let Some(position) = visible.position_of(entry.id()) {
                callback(RowEvent::Changed(position, &entry));
            }
        }
        Update::Remove(entry) => {
            if let Some(position) = visible.remove(entry.id()) {
                callback(RowEvent::Removed(position, &entry));
            }
        }
    }
}

impl QueryResults for ResultSequence {
    fn add_results(&self, entries: Vec<EntryRef>) {
        if self.disposed.load(Ordering::Acquire) {
            return;
        }
        for entry in entries {
            if self.members.lock().insert(entry.id()) {
                self.enqueue(Update::Add(entry));
            }
        }
    }

    fn finished(&self) {
        self.complete.store(true, Ordering::Release);
    }
}

impl StoreListener for ResultSequence {
    fn entry_added(&self, entry: &EntryRef) {
        if self.disposed.load(Ordering::Acquire) {
            return;
        }
        if entry_matches(entry, &self.query) && self.members.lock().insert(entry.id()) {
            self.enqueue(Update::Add(entry.clone()));
        }
    }

    fn entry_changed(&self, entry: &EntryRef, _changes: &[PropertyChange]) {
        if self.disposed.load(Ordering::Acquire) {
            return;
        }
        let matches = entry_matches(entry, &self.query);
        let mut members = self.members.lock();
        if members.contains(&entry.id()) {
            if matches {
                self.enqueue(Update::Change(entry.clone()));
            } else {
                members.remove(&entry.id());
                self.enqueue(Update::Remove(entry.clone()));
            }
        } else if matches && members.insert(entry.id()) {
            self.enqueue(Update::Add(entry.clone()));
        }
    }

    fn entry_deleted(&self, entry: &EntryRef) {
        if self.disposed.load(Ordering::Acquire) {
            return;
        }
        let mut members = self.members.lock();
        if members.remove(&entry.id()) {
            self.enqueue(Update::Remove(entry.clone()));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::{Property, Value};
    use query::{Clause, Op};

    const BUDGET: Duration = Duration::from_secs(5);

    fn fixture() -> Store {
        let store = Store::new();
        for (title, genre, artist, album, location) in [
            ("A", "Rock", "X", "L1", "file:///1.ogg"),
            ("B", "Rock", "Y", "L2", "file:///2.ogg"),
            ("C", "Jazz", "X", "L3", "file:///3.ogg"),
        ] {
            let entry = store.create("song", location).unwrap();
            for (prop, text) in [
                (Property::Title, title),
                (Property::Genre, genre),
                (Property::Artist, artist),
                (Property::Album, album),
                (Property::MimeType, "audio/ogg"),
            ] {
                entry.set_uninserted(prop, Value::Str(store.pool().intern(text)), store.pool());
            }
            store.insert(&entry);
        }
        store
    }

    fn eq(store: &Store, prop: Property, text: &str) -> Clause {
        Clause::prop(Op::Equals, prop, Value::Str(store.pool().intern(text)))
    }

    fn rock_or_artist_x(store: &Store) -> Query {
        Query::new()
            .with(eq(store, Property::Genre, "Rock"))
            .with(Clause::Disjunction)
            .with(eq(store, Property::Artist, "X"))
    }

    #[test]
    fn populate_then_poll_fills_the_order() {
        let store = fixture();
        let seq = ResultSequence::new(&store, &rock_or_artist_x(&store));
        seq.populate(&store, &AtomicBool::new(false));
        assert!(seq.is_complete());

        let mut inserted = 0;
        while seq.poll(BUDGET, |event| {
            if matches!(event, RowEvent::Inserted(..)) {
                inserted += 1;
            }
        }) {}
        assert_eq!(inserted, 3);
        assert_eq!(seq.len(), 3);
    }

    #[test]
    fn deletion_removes_exactly_once_across_branches() {
        let store = fixture();
        let seq = ResultSequence::new(&store, &rock_or_artist_x(&store));
        seq.populate(&store, &AtomicBool::new(false));
        seq.poll(BUDGET, |_| {});

        // L1 matches both the genre branch and the artist branch.
        let entry = store.lookup_by_location("file:///1.ogg").unwrap();
        store.delete(&entry);

        let mut removed = 0;
        seq.poll(BUDGET, |event| {
            if matches!(event, RowEvent::Removed(..)) {
                removed += 1;
            }
        });
        assert_eq!(removed, 1);
        assert_eq!(seq.len(), 2);
        assert!(seq.position_of(&entry).is_none());
    }

    #[test]
    fn change_that_breaks_the_match_removes_the_row() {
        let store = fixture();
        let query = Query::new().with(eq(&store, Property::Genre, "Rock"));
        let seq = ResultSequence::new(&store, &query);
        seq.populate(&store, &AtomicBool::new(false));
        seq.poll(BUDGET, |_| {});
        assert_eq!(seq.len(), 2);

        let entry = store.lookup_by_location("file:///2.ogg").unwrap();
        store.set_property(
            &entry,
            Property::Genre,
            Value::Str(store.pool().intern("Jazz")),
        );
        let mut removed = 0;
        seq.poll(BUDGET, |event| {
            if matches!(event, RowEvent::Removed(..)) {
                removed += 1;
            }
        });
        assert_eq!(removed, 1);
        assert_eq!(seq.len(), 1);
    }

    #[test]
    fn newly_matching_entry_is_inserted_live() {
        let store = fixture();
        let query = Query::new().with(eq(&store, Property::Genre, "Jazz"));
        let seq = ResultSequence::new(&store, &query);
        seq.populate(&store, &AtomicBool::new(false));
        seq.poll(BUDGET, |_| {});
        assert_eq!(seq.len(), 1);

        let entry = store.create("song", "file:///4.ogg").unwrap();
        entry.set_uninserted(
            Property::Genre,
            Value::Str(store.pool().intern("Jazz")),
            store.pool(),
        );
        store.insert(&entry);
        seq.poll(BUDGET, |_| {});
        assert_eq!(seq.len(), 2);
        assert_eq!(seq.position_of(&entry), Some(1));
    }

    #[test]
    fn removal_shifts_later_rows_down() {
        let store = fixture();
        let seq = ResultSequence::new(&store, &rock_or_artist_x(&store));
        seq.populate(&store, &AtomicBool::new(false));
        seq.poll(BUDGET, |_| {});
        assert_eq!(seq.len(), 3);

        let first = seq.get(0).unwrap();
        let middle = seq.get(1).unwrap();
        let last = seq.get(2).unwrap();
        store.delete(&middle);
        let mut removed_at = None;
        seq.poll(BUDGET, |event| {
            if let RowEvent::Removed(position, _) = event {
                removed_at = Some(position);
            }
        });
        assert_eq!(removed_at, Some(1));
        assert_eq!(seq.len(), 2);
        assert_eq!(seq.get(0).unwrap().id(), first.id());
        assert_eq!(seq.get(1).unwrap().id(), last.id());
        assert_eq!(seq.position_of(&first), Some(0));
        assert_eq!(seq.position_of(&last), Some(1));
        assert!(seq.position_of(&middle).is_none());
    }

    #[test]
    fn heavy_churn_keeps_positions_consistent() {
        let store = Store::new();
        for index in 0..80 {
            let location = format!("file:///bulk/{index}.ogg");
            let entry = store.create("song", &location).unwrap();
            for (prop, text) in [
                (Property::Title, format!("T{index}")),
                (Property::Genre, "Jazz".to_string()),
                (Property::Artist, "X".to_string()),
                (Property::Album, "L".to_string()),
                (Property::MimeType, "audio/ogg".to_string()),
            ] {
                entry.set_uninserted(prop, Value::Str(store.pool().intern(&text)), store.pool());
            }
            store.insert(&entry);
        }

        let query = Query::new().with(eq(&store, Property::Genre, "Jazz"));
        let seq = ResultSequence::new(&store, &query);
        seq.populate(&store, &AtomicBool::new(false));
        while seq.poll(BUDGET, |_| {}) {}
        assert_eq!(seq.len(), 80);

        let order: Vec<_> = (0..80).map(|position| seq.get(position).unwrap()).collect();
        for entry in &order[..70] {
            store.delete(entry);
            seq.poll(BUDGET, |_| {});
        }
        assert_eq!(seq.len(), 10);
        for (position, survivor) in order[70..].iter().enumerate() {
            assert_eq!(seq.position_of(survivor), Some(position));
            assert_eq!(seq.get(position).unwrap().id(), survivor.id());
        }
        assert!(seq.get(10).is_none());
    }

    #[test]
    fn zero_budget_applies_nothing_but_reports_backlog() {
        let store = fixture();
        let seq = ResultSequence::new(&store, &rock_or_artist_x(&store));
        seq.populate(&store, &AtomicBool::new(false));
        assert!(seq.poll(Duration::ZERO, |_| panic!("no update fits a zero budget")));
        assert_eq!(seq.len(), 0);
        assert!(seq.has_pending());
    }

    #[test]
    fn disposed_sequence_ignores_store_events() {
        let store = fixture();
        let seq = ResultSequence::new(&store, &rock_or_artist_x(&store));
        seq.populate(&store, &AtomicBool::new(false));
        seq.poll(BUDGET, |_| {});
        seq.dispose();
        assert_eq!(seq.len(), 0);

        let entry = store.lookup_by_location("file:///1.ogg").unwrap();
        store.delete(&entry);
        assert!(!seq.poll(BUDGET, |_| panic!("disposed sequence saw an update")));
    }
}
