//! Local projection cache
//!
//! Holds the latest known rows a screen displays. The cache is never persisted:
//! every mount starts from an authoritative reload.
//!
//! Two write paths exist. A reload replaces everything and bumps the cache
//! epoch; an incremental patch applies one change. Patches tagged with an
//! older epoch than the current one were issued before a reload started and
//! are dropped, so a completing reload always wins.

use std::collections::HashMap;
use std::hash::Hash;

use tracing::debug;

use crate::feed::Change;
use crate::metrics::SyncMetrics;

/// A row that can be addressed by a stable key.
pub trait Keyed: Clone {
    /// Key type, usually the row id
    type Key: Eq + Hash + Clone + std::fmt::Debug;

    /// Key of this row
    fn key(&self) -> Self::Key;
}

/// Issued by [`ProjectionCache::begin_reload`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReloadTicket {
    epoch: u64,
}

/// Issued by [`ProjectionCache::begin_patch`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PatchTicket {
    epoch: u64,
}

/// In-memory projection of one entity type for one screen.
#[derive(Debug)]
pub struct ProjectionCache<T: Keyed> {
    name: &'static str,
    rows: HashMap<T::Key, T>,
    order: Vec<T::Key>,
    epoch: u64,
    loaded: bool,
}

impl<T: Keyed> ProjectionCache<T> {
    /// Empty cache; `name` labels logs and metrics
    #[must_use]
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            rows: HashMap::new(),
            order: Vec::new(),
            epoch: 0,
            loaded: false,
        }
    }

    /// True once at least one reload completed
    #[must_use]
    pub const fn is_loaded(&self) -> bool {
        self.loaded
    }

    /// Number of cached rows
    #[must_use]
    pub fn len(&self) -> usize {
        self.order.len()
    }

    /// True when nothing is cached
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// Row by key
    #[must_use]
    pub fn get(&self, key: &T::Key) -> Option<&T> {
        self.rows.get(key)
    }

    /// Rows in insertion order
    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.order.iter().filter_map(|key| self.rows.get(key))
    }

    /// Owned copy of all rows in insertion order
    #[must_use]
    pub fn to_vec(&self) -> Vec<T> {
        self.iter().cloned().collect()
    }

    /// Start an authoritative reload; invalidates outstanding patch tickets.
    pub fn begin_reload(&mut self) -> ReloadTicket {
        self.epoch += 1;
        ReloadTicket { epoch: self.epoch }
    }

    /// Apply a reload result. Returns false if a newer reload superseded it.
    pub fn complete_reload(&mut self, ticket: ReloadTicket, rows: Vec<T>) -> bool {
        if ticket.epoch != self.epoch {
            debug!(
                cache = self.name,
                ticket = ticket.epoch,
                current = self.epoch,
                "Discarding superseded reload"
            );
            return false;
        }
        self.replace_all(rows);
        true
    }

    /// Tag an incremental write whose result will arrive later.
    #[must_use]
    pub const fn begin_patch(&self) -> PatchTicket {
        PatchTicket { epoch: self.epoch }
    }

    /// Apply a patch result unless a reload started after it was issued.
    pub fn apply_patch(&mut self, ticket: PatchTicket, change: Change<T>) -> bool {
        if ticket.epoch < self.epoch {
            debug!(
                cache = self.name,
                ticket = ticket.epoch,
                current = self.epoch,
                "Dropping patch issued before the latest reload"
            );
            SyncMetrics::record_stale_patch(self.name);
            return false;
        }
        self.apply(change);
        true
    }

    /// Discard everything and install `rows`.
    pub fn replace_all(&mut self, rows: Vec<T>) {
        self.rows.clear();
        self.order.clear();
        for row in rows {
            self.upsert(row);
        }
        self.loaded = true;
        SyncMetrics::record_cache_reload(self.name);
    }

    /// Apply one change event: insert appends, update replaces, delete removes.
    pub fn apply(&mut self, change: Change<T>) {
        match change {
            Change::Insert(row) | Change::Update { new: row, .. } => self.upsert(row),
            Change::Delete { old } => {
                self.remove(&old.key());
            }
        }
    }

    /// Insert or replace by key. New keys go to the end.
    pub fn upsert(&mut self, row: T) {
        let key = row.key();
        if self.rows.insert(key.clone(), row).is_none() {
            self.order.push(key);
        }
    }

    /// Remove by key, returning the row if it was cached.
    pub fn remove(&mut self, key: &T::Key) -> Option<T> {
        let removed = self.rows.remove(key);
        if removed.is_some() {
            self.order.retain(|k| k != key);
        }
        removed
    }

    /// Keep only rows matching `keep`; returns how many were removed.
    pub fn retain(&mut self, mut keep: impl FnMut(&T) -> bool) -> usize {
        let before = self.order.len();
        self.rows.retain(|_, row| keep(row));
        let rows = &self.rows;
        self.order.retain(|key| rows.contains_key(key));
        before - self.order.len()
    }

    /// Mutate a row in place.
    pub fn update_with(&mut self, key: &T::Key, f: impl FnOnce(&mut T)) -> bool {
        self.rows.get_mut(key).map(f).is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, PartialEq, Eq)]
    struct Row {
        id: u32,
        value: &'static str,
    }

    impl Keyed for Row {
        type Key = u32;
        fn key(&self) -> u32 {
            self.id
        }
    }

    fn row(id: u32, value: &'static str) -> Row {
        Row { id, value }
    }

    #[test]
    fn test_replace_all_discards_stale_entries() {
        let mut cache = ProjectionCache::new("rows");
        cache.replace_all(vec![row(1, "a"), row(2, "b")]);
        cache.replace_all(vec![row(2, "b2"), row(3, "c")]);

        assert!(cache.get(&1).is_none());
        assert_eq!(cache.get(&2).map(|r| r.value), Some("b2"));
        assert_eq!(cache.len(), 2);
        assert!(cache.is_loaded());
    }

    #[test]
    fn test_incremental_patch_paths() {
        let mut cache = ProjectionCache::new("rows");
        cache.replace_all(vec![row(1, "a")]);

        cache.apply(Change::Insert(row(2, "b")));
        cache.apply(Change::Update {
            new: row(1, "a2"),
            old: None,
        });
        cache.apply(Change::Delete { old: row(2, "b") });

        assert_eq!(cache.to_vec(), vec![row(1, "a2")]);
    }

    #[test]
    fn test_retain_drops_rows_and_their_order_slots() {
        let mut cache = ProjectionCache::new("rows");
        cache.replace_all(vec![
            Row { id: 1, value: "a" },
            Row { id: 2, value: "b" },
            Row { id: 3, value: "c" },
        ]);
        assert_eq!(cache.retain(|r| r.id != 2), 1);
        let ids: Vec<u32> = cache.iter().map(|r| r.id).collect();
        assert_eq!(ids, vec![1, 3]);
        assert!(cache.get(&2).is_none());
    }

    #[test]
    fn test_insert_keeps_arrival_order() {
        let mut cache = ProjectionCache::new("rows");
        cache.apply(Change::Insert(row(5, "x")));
        cache.apply(Change::Insert(row(1, "y")));
        cache.apply(Change::Insert(row(5, "x2")));
        let ids: Vec<u32> = cache.iter().map(|r| r.id).collect();
        assert_eq!(ids, vec![5, 1]);
    }

    #[test]
    fn test_reload_wins_over_patch_issued_before_it() {
        let mut cache = ProjectionCache::new("rows");
        cache.replace_all(vec![row(1, "a")]);

        let patch = cache.begin_patch();
        let reload = cache.begin_reload();

        // The patch response lands while the reload is in flight.
        assert!(!cache.apply_patch(patch, Change::Insert(row(9, "late"))));
        assert!(cache.complete_reload(reload, vec![row(1, "fresh")]));

        assert!(cache.get(&9).is_none());
        assert_eq!(cache.get(&1).map(|r| r.value), Some("fresh"));
    }

    #[test]
    fn test_superseded_reload_is_ignored() {
        let mut cache = ProjectionCache::new("rows");
        let first = cache.begin_reload();
        let second = cache.begin_reload();

        assert!(cache.complete_reload(second, vec![row(2, "new")]));
        assert!(!cache.complete_reload(first, vec![row(1, "old")]));
        assert_eq!(cache.to_vec(), vec![row(2, "new")]);
    }

    #[test]
    fn test_patch_issued_after_reload_applies() {
        let mut cache = ProjectionCache::new("rows");
        let reload = cache.begin_reload();
        let patch = cache.begin_patch();
        assert!(cache.complete_reload(reload, vec![row(1, "a")]));
        assert!(cache.apply_patch(patch, Change::Insert(row(2, "b"))));
        assert_eq!(cache.len(), 2);
    }
}
