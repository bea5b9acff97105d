//! The grouping index: a four-level tree keyed type, genre, artist,
//! album, with entries hanging off the album leaves. Nodes live in an
//! arena addressed by stable handles; a node disappears the moment its
//! last child does, so the tree never carries empty groups.

use std::collections::HashMap;

use common::{EntryId, EntryRef, RefString};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct NodeId(u32);

struct Node {
    parent: Option<NodeId>,
    key: RefString,
    children: HashMap<RefString, NodeId>,
    entries: HashMap<EntryId, EntryRef>,
}

pub struct PropIndex {
    slots: Vec<Option<Node>>,
    free: Vec<u32>,
    types: HashMap<RefString, NodeId>,
}

impl PropIndex {
    pub fn new() -> PropIndex {
        PropIndex {
            slots: Vec::new(),
            free: Vec::new(),
            types: HashMap::new(),
        }
    }

    fn alloc(&mut self, parent: Option<NodeId>, key: RefString) -> NodeId {
        let node = Node {
            parent,
            key,
            children: HashMap::new(),
            entries: HashMap::new(),
        };
        match self.free.pop() {
            Some(slot) => {
                self.slots[slot as usize] = Some(node);
                NodeId(slot)
            }
            None => {
                self.slots.push(Some(node));
                NodeId((self.slots.len() - 1) as u32)
            }
        }
    }

    fn node(&self, id: NodeId) -> &Node {
        self.slots[id.0 as usize]
            .as_ref()
            .expect("stale index node handle")
    }

    fn node_mut(&mut self, id: NodeId) -> &mut Node {
        self.slots[id.0 as usize]
            .as_mut()
            .expect("stale index node handle")
    }

    fn child_or_insert(&mut self, parent: NodeId, key: &RefString) -> NodeId {
        if let Some(&child) = self.node(parent).children.get(key) {
            return child;
        }
        let child = self.alloc(Some(parent), key.clone());
        self.node_mut(parent).children.insert(key.clone(), child);
        child
    }

    /// Attaches an entry under its current type/genre/artist/album,
    /// creating any missing intermediate nodes.
    pub fn insert(&mut self, type_name: &RefString, entry: &EntryRef) {
        let type_node = match self.types.get(type_name) {
            Some(&node) => node,
            None => {
                let node = self.alloc(None, type_name.clone());
                self.types.insert(type_name.clone(), node);
                node
            }
        };
        let genre = self.child_or_insert(type_node, &entry.genre());
        let artist = self.child_or_insert(genre, &entry.artist());
        let album = self.child_or_insert(artist, &entry.album());
        self.node_mut(album).entries.insert(entry.id(), entry.clone());
    }

    /// Detaches an entry from its leaf, then frees every ancestor left
    /// childless, in leaf-to-root order. Returns false if the entry was
    /// not where its fields say it should be.
    pub fn remove(&mut self, type_name: &RefString, entry: &EntryRef) -> bool {
        let leaf = match self.leaf_for(type_name, entry) {
            Some(leaf) => leaf,
            None => return false,
        };
        if self.node_mut(leaf).entries.remove(&entry.id()).is_none() {
            return false;
        }
        self.cleanup(leaf);
        true
    }

    fn leaf_for(&self, type_name: &RefString, entry: &EntryRef) -> Option<NodeId> {
        let type_node = *self.types.get(type_name)?;
        let genre = self.child(type_node, &entry.genre())?;
        let artist = self.child(genre, &entry.artist())?;
        self.child(artist, &entry.album())
    }

    fn cleanup(&mut self, mut id: NodeId) {
        loop {
            let node = self.node(id);
            if !node.children.is_empty() || !node.entries.is_empty() {
                return;
            }
            let parent = node.parent;
            let key = node.key.clone();
            self.slots[id.0 as usize] = None;
            self.free.push(id.0);
            match parent {
                Some(parent) => {
                    self.node_mut(parent).children.remove(&key);
                    id = parent;
                }
                None => {
                    self.types.remove(&key);
                    return;
                }
            }
        }
    }

    pub fn type_node(&self, type_name: &str) -> Option<NodeId> {
        self.types.get(type_name).copied()
    }

    pub fn type_nodes(&self) -> impl Iterator<Item = NodeId> + '_ {
        self.types.values().copied()
    }

    pub fn child(&self, id: NodeId, key: &str) -> Option<NodeId> {
        self.node(id).children.get(key).copied()
    }

    pub fn children(&self, id: NodeId) -> impl Iterator<Item = NodeId> + '_ {
        self.node(id).children.values().copied()
    }

    pub fn entries(&self, leaf: NodeId) -> impl Iterator<Item = &EntryRef> {
        self.node(leaf).entries.values()
    }

    pub fn live_nodes(&self) -> usize {
        self.slots.len() - self.free.len()
    }

    /// Distinct group counts at the genre, artist and album levels.
    pub fn level_counts(&self) -> (usize, usize, usize) {
        let mut genres = 0;
        let mut artists = 0;
        let mut albums = 0;
        for &type_node in self.types.values() {
            for genre in self.node(type_node).children.values() {
                genres += 1;
                for artist in self.node(*genre).children.values() {
                    artists += 1;
                    albums += self.node(*artist).children.len();
                }
            }
        }
        (genres, artists, albums)
    }
}

impl Default for PropIndex {
    fn default() -> Self {
        PropIndex::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::{DefaultBehavior, Entry, EntryCategory, EntryType, Property, StringPool, Value};
    use std::sync::Arc;

    fn entry(pool: &StringPool, id: u64, genre: &str, artist: &str, album: &str) -> EntryRef {
        let song = EntryType::new("song", EntryCategory::Normal, true, Box::new(DefaultBehavior));
        let e = Arc::new(Entry::new(
            EntryId(id),
            song,
            &format!("file:///{}.ogg", id),
            pool,
        ));
        e.set_uninserted(Property::Genre, Value::Str(pool.intern(genre)), pool);
        e.set_uninserted(Property::Artist, Value::Str(pool.intern(artist)), pool);
        e.set_uninserted(Property::Album, Value::Str(pool.intern(album)), pool);
        e
    }

    #[test]
    fn insert_then_walk_reaches_entry() {
        let pool = StringPool::new();
        let mut index = PropIndex::new();
        let song = pool.intern("song");
        let e = entry(&pool, 1, "Rock", "X", "L1");
        index.insert(&song, &e);

        let t = index.type_node("song").unwrap();
        let g = index.child(t, "Rock").unwrap();
        let a = index.child(g, "X").unwrap();
        let l = index.child(a, "L1").unwrap();
        let found: Vec<_> = index.entries(l).collect();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].id(), EntryId(1));
    }

    #[test]
    fn remove_cascades_to_empty_ancestors() {
        let pool = StringPool::new();
        let mut index = PropIndex::new();
        let song = pool.intern("song");
        let a = entry(&pool, 1, "Rock", "X", "L1");
        let b = entry(&pool, 2, "Rock", "Y", "L2");
        index.insert(&song, &a);
        index.insert(&song, &b);
        // type + genre + 2 artists + 2 albums
        assert_eq!(index.live_nodes(), 6);

        assert!(index.remove(&song, &a));
        // X and L1 are gone, Rock survives because Y remains.
        assert_eq!(index.live_nodes(), 4);
        let t = index.type_node("song").unwrap();
        let g = index.child(t, "Rock").unwrap();
        assert!(index.child(g, "X").is_none());

        assert!(index.remove(&song, &b));
        assert_eq!(index.live_nodes(), 0);
        assert!(index.type_node("song").is_none());
    }

    #[test]
    fn slots_are_reused() {
        let pool = StringPool::new();
        let mut index = PropIndex::new();
        let song = pool.intern("song");
        let a = entry(&pool, 1, "Rock", "X", "L1");
        index.insert(&song, &a);
        index.remove(&song, &a);
        let b = entry(&pool, 2, "Jazz", "Y", "L2");
        index.insert(&song, &b);
        assert_eq!(index.live_nodes(), 4);
        assert_eq!(index.slots.len(), 4);
    }
}
