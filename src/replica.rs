//! Local queryable copy of world state.
//!
//! Rows are grouped per chunk. Every write is made under one exclusive
//! guard, so a reader either sees a whole apply or none of it. Only the
//! snapshot applier writes.

use crate::types::{ChunkCoord, EntityKey, Tick};
use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};

/// One committed entity row.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Row {
    pub key: EntityKey,
    pub chunk: ChunkCoord,
    /// Tick of the snapshot or update that wrote this row.
    pub tick: Tick,
    pub entity: serde_json::Value,
}

#[derive(Default)]
pub(crate) struct Tables {
    chunks: HashMap<ChunkCoord, BTreeMap<EntityKey, Row>>,
    /// Which chunk currently holds each entity.
    locations: HashMap<EntityKey, ChunkCoord>,
}

impl Tables {
    /// Replace every row of a chunk. Returns how many rows were dropped.
    pub(crate) fn replace_chunk(&mut self, chunk: ChunkCoord, rows: Vec<Row>) -> usize {
        let removed = self.clear_chunk(chunk);
        for row in rows {
            self.upsert(row);
        }
        removed
    }

    pub(crate) fn clear_chunk(&mut self, chunk: ChunkCoord) -> usize {
        match self.chunks.remove(&chunk) {
            Some(old) => {
                for key in old.keys() {
                    if self.locations.get(key) == Some(&chunk) {
                        self.locations.remove(key);
                    }
                }
                old.len()
            }
            None => 0,
        }
    }

    /// Insert or overwrite a row; an entity that moved chunks leaves its
    /// old chunk.
    pub(crate) fn upsert(&mut self, row: Row) {
        if let Some(prev) = self.locations.insert(row.key.clone(), row.chunk) {
            if prev != row.chunk {
                if let Some(rows) = self.chunks.get_mut(&prev) {
                    rows.remove(&row.key);
                }
            }
        }
        self.chunks
            .entry(row.chunk)
            .or_default()
            .insert(row.key.clone(), row);
    }

    /// Remove an entity from a chunk. Returns whether a row was removed.
    pub(crate) fn remove(&mut self, chunk: ChunkCoord, key: &EntityKey) -> bool {
        let removed = self
            .chunks
            .get_mut(&chunk)
            .and_then(|rows| rows.remove(key))
            .is_some();
        if removed && self.locations.get(key) == Some(&chunk) {
            self.locations.remove(key);
        }
        removed
    }
}

/// The replica store.
#[derive(Default)]
pub struct Replica {
    tables: RwLock<Tables>,
    generation: AtomicU64,
}

impl Replica {
    pub fn new() -> Self {
        Self::default()
    }

    /// Shared read access to committed rows.
    pub fn read(&self) -> ReplicaView<'_> {
        ReplicaView {
            tables: self.tables.read(),
            generation: self.generation.load(Ordering::SeqCst),
        }
    }

    /// Number of committed write units so far.
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    /// Run one write unit under the exclusive guard.
    pub(crate) fn write<R>(&self, f: impl FnOnce(&mut Tables) -> R) -> R {
        let mut guard: RwLockWriteGuard<'_, Tables> = self.tables.write();
        let out = f(&mut guard);
        self.generation.fetch_add(1, Ordering::SeqCst);
        out
    }
}

/// Read-only view over the replica, held for the duration of one query.
pub struct ReplicaView<'a> {
    tables: RwLockReadGuard<'a, Tables>,
    generation: u64,
}

impl<'a> ReplicaView<'a> {
    /// Generation the view was taken at.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Rows in one chunk, ordered by key.
    pub fn entities_in(&self, chunk: ChunkCoord) -> Vec<&Row> {
        self.tables
            .chunks
            .get(&chunk)
            .map(|rows| rows.values().collect())
            .unwrap_or_default()
    }

    /// Rows of one kind across all chunks.
    pub fn entities_of_kind(&self, kind: &str) -> Vec<&Row> {
        let mut out: Vec<&Row> = self
            .tables
            .chunks
            .values()
            .flat_map(|rows| rows.values())
            .filter(|row| row.key.kind == kind)
            .collect();
        out.sort_by(|a, b| a.key.cmp(&b.key));
        out
    }

    pub fn get(&self, key: &EntityKey) -> Option<&Row> {
        let chunk = self.tables.locations.get(key)?;
        self.tables.chunks.get(chunk)?.get(key)
    }

    pub fn contains(&self, key: &EntityKey) -> bool {
        self.tables.locations.contains_key(key)
    }

    /// Rows matching an arbitrary predicate.
    pub fn filter<F>(&self, predicate: F) -> Vec<&Row>
    where
        F: Fn(&Row) -> bool,
    {
        let mut out: Vec<&Row> = self
            .tables
            .chunks
            .values()
            .flat_map(|rows| rows.values())
            .filter(|row| predicate(row))
            .collect();
        out.sort_by(|a, b| a.key.cmp(&b.key));
        out
    }

    pub fn chunks(&self) -> Vec<ChunkCoord> {
        let mut out: Vec<ChunkCoord> = self
            .tables
            .chunks
            .iter()
            .filter(|(_, rows)| !rows.is_empty())
            .map(|(c, _)| *c)
            .collect();
        out.sort();
        out
    }

    pub fn chunk_count(&self) -> usize {
        self.tables.chunks.values().filter(|r| !r.is_empty()).count()
    }

    pub fn len(&self) -> usize {
        self.tables.locations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn row(chunk: ChunkCoord, id: &str) -> Row {
        Row {
            key: EntityKey::new("tree", id),
            chunk,
            tick: Tick(1),
            entity: json!({"id": id}),
        }
    }

    #[test]
    fn test_replace_chunk_drops_missing_rows() {
        let replica = Replica::new();
        let c = ChunkCoord::new(0, 0);

        replica.write(|t| t.replace_chunk(c, vec![row(c, "a"), row(c, "b")]));
        let removed = replica.write(|t| t.replace_chunk(c, vec![row(c, "b")]));
        assert_eq!(removed, 2);

        let view = replica.read();
        let ids: Vec<&str> = view.entities_in(c).iter().map(|r| r.key.id.as_str()).collect();
        assert_eq!(ids, vec!["b"]);
        assert_eq!(view.len(), 1);
    }

    #[test]
    fn test_entity_moves_between_chunks() {
        let replica = Replica::new();
        let a = ChunkCoord::new(0, 0);
        let b = ChunkCoord::new(1, 0);

        replica.write(|t| t.upsert(row(a, "walker")));
        replica.write(|t| t.upsert(row(b, "walker")));

        let view = replica.read();
        assert!(view.entities_in(a).is_empty());
        assert_eq!(view.entities_in(b).len(), 1);
        assert_eq!(view.get(&EntityKey::new("tree", "walker")).unwrap().chunk, b);
        assert_eq!(view.chunks(), vec![b]);
    }

    #[test]
    fn test_clearing_old_chunk_keeps_moved_entity() {
        let replica = Replica::new();
        let a = ChunkCoord::new(0, 0);
        let b = ChunkCoord::new(1, 0);

        replica.write(|t| t.replace_chunk(a, vec![row(a, "x")]));
        replica.write(|t| t.upsert(row(b, "x")));
        replica.write(|t| t.replace_chunk(a, vec![]));

        assert!(replica.read().contains(&EntityKey::new("tree", "x")));
    }

    #[test]
    fn test_generation_counts_write_units() {
        let replica = Replica::new();
        let c = ChunkCoord::new(0, 0);
        assert_eq!(replica.generation(), 0);
        replica.write(|t| t.upsert(row(c, "a")));
        replica.write(|t| t.remove(c, &EntityKey::new("tree", "a")));
        assert_eq!(replica.generation(), 2);
        assert!(replica.read().is_empty());
    }
}
