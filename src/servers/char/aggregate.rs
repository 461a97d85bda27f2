//! Demand-loaded cache for guild- and party-style aggregates.
//!
//! Each resident aggregate carries a [`DirtyMask`] of sub-aspects with
//! unsaved changes. The flush cycle calls [`AggregateCache::flush_step`] once
//! per tick: it evicts clean entries that were marked for removal, saves the
//! next dirty entry after the cursor (in id order, wrapping), and returns how
//! long to wait before the next tick.

use std::collections::BTreeMap;
use std::fmt;
use std::ops::{Bound, BitOr, BitOrAssign};
use std::time::Duration;

use crate::config::TableConfig;

use super::db::{Statement, Store};

#[derive(Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct DirtyMask(pub u32);

impl DirtyMask {
    pub const EMPTY: DirtyMask = DirtyMask(0);

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub fn contains(self, other: DirtyMask) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn insert(&mut self, other: DirtyMask) {
        self.0 |= other.0;
    }

    pub fn remove(&mut self, other: DirtyMask) {
        self.0 &= !other.0;
    }

    /// Single-bit masks, lowest first.
    pub fn iter(self) -> impl Iterator<Item = DirtyMask> {
        (0..32).map(|b| DirtyMask(1 << b)).filter(move |m| self.contains(*m))
    }
}

impl BitOr for DirtyMask {
    type Output = DirtyMask;

    fn bitor(self, rhs: DirtyMask) -> DirtyMask {
        DirtyMask(self.0 | rhs.0)
    }
}

impl BitOrAssign for DirtyMask {
    fn bitor_assign(&mut self, rhs: DirtyMask) {
        self.0 |= rhs.0;
    }
}

impl fmt::Debug for DirtyMask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DirtyMask({:#x})", self.0)
    }
}

pub trait Aggregate: Clone + Send + Sync + 'static {
    /// Log tag, e.g. `"guild"`.
    const KIND: &'static str;

    fn id(&self) -> u32;

    fn online_members(&self) -> usize;

    /// Statements persisting one aspect. More than one statement means the
    /// aspect is written atomically.
    fn aspect_statements(&self, tables: &TableConfig, aspect: DirtyMask) -> Vec<Statement>;

    /// Statements deleting the aggregate from every table it lives in.
    fn delete_statements(&self, tables: &TableConfig) -> Vec<Statement>;
}

#[derive(Debug)]
pub struct Entry<A> {
    pub value: A,
    pub dirty: DirtyMask,
    pub pending_removal: bool,
}

pub struct AggregateCache<A: Aggregate> {
    entries: BTreeMap<u32, Entry<A>>,
    cursor: Option<u32>,
}

impl<A: Aggregate> Default for AggregateCache<A> {
    fn default() -> Self {
        Self::new()
    }
}

impl<A: Aggregate> AggregateCache<A> {
    pub fn new() -> Self {
        Self { entries: BTreeMap::new(), cursor: None }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, id: u32) -> bool {
        self.entries.contains_key(&id)
    }

    pub fn get(&self, id: u32) -> Option<&A> {
        self.entries.get(&id).map(|e| &e.value)
    }

    pub fn entry(&self, id: u32) -> Option<&Entry<A>> {
        self.entries.get(&id)
    }

    pub fn dirty(&self, id: u32) -> DirtyMask {
        self.entries.get(&id).map(|e| e.dirty).unwrap_or_default()
    }

    pub fn ids(&self) -> impl Iterator<Item = u32> + '_ {
        self.entries.keys().copied()
    }

    /// Makes `value` resident and clean. An already-resident copy wins.
    pub fn insert(&mut self, value: A) -> &mut A {
        let id = value.id();
        &mut self
            .entries
            .entry(id)
            .or_insert(Entry { value, dirty: DirtyMask::EMPTY, pending_removal: false })
            .value
    }

    /// Mutates a resident aggregate. `aspects` are marked dirty only when
    /// `f` returns `Some`, so a refused request leaves the mask alone.
    pub fn modify<R>(&mut self, id: u32, aspects: DirtyMask, f: impl FnOnce(&mut A) -> Option<R>) -> Option<R> {
        let e = self.entries.get_mut(&id)?;
        let r = f(&mut e.value)?;
        e.dirty |= aspects;
        Some(r)
    }

    /// Runs `f` on a resident aggregate without touching its mask; the
    /// caller marks whatever `f` reports as changed.
    pub fn update<R>(&mut self, id: u32, f: impl FnOnce(&mut A) -> R) -> Option<R> {
        self.entries.get_mut(&id).map(|e| f(&mut e.value))
    }

    pub fn mark(&mut self, id: u32, aspects: DirtyMask) {
        if let Some(e) = self.entries.get_mut(&id) {
            e.dirty |= aspects;
        }
    }

    /// A member came back: cancel a pending removal.
    pub fn touch(&mut self, id: u32) {
        if let Some(e) = self.entries.get_mut(&id) {
            e.pending_removal = false;
        }
    }

    /// Schedules eviction once the entry is clean; still queryable until then.
    pub fn release(&mut self, id: u32) {
        if let Some(e) = self.entries.get_mut(&id) {
            e.pending_removal = true;
        }
    }

    /// Drops the entry regardless of its mask. Only for aggregates that were
    /// deleted from the store.
    pub fn remove(&mut self, id: u32) -> Option<A> {
        self.entries.remove(&id).map(|e| e.value)
    }

    /// Persists every dirty aspect of one aggregate. Succeeded aspects are
    /// cleared; the returned mask holds the ones that failed.
    pub async fn save(&mut self, store: &dyn Store, tables: &TableConfig, id: u32) -> DirtyMask {
        let Some(e) = self.entries.get(&id) else {
            return DirtyMask::EMPTY;
        };
        let work: Vec<(DirtyMask, Vec<Statement>)> = e
            .dirty
            .iter()
            .map(|aspect| (aspect, e.value.aspect_statements(tables, aspect)))
            .collect();

        let mut failed = DirtyMask::EMPTY;
        for (aspect, stmts) in work {
            let res = match stmts.as_slice() {
                [] => Ok(()),
                [one] => store.execute(one).await.map(|_| ()),
                many => store.execute_atomic(many).await,
            };
            if let Err(err) = res {
                tracing::warn!(
                    "[char] [{}] save #{} aspect {:?} failed: {}",
                    A::KIND,
                    id,
                    aspect,
                    err
                );
                failed.insert(aspect);
            }
        }
        if let Some(e) = self.entries.get_mut(&id) {
            e.dirty = failed;
        }
        failed
    }

    /// Saves every dirty aggregate. Used at shutdown.
    pub async fn save_all(&mut self, store: &dyn Store, tables: &TableConfig) -> usize {
        let ids: Vec<u32> = self.entries.iter().filter(|(_, e)| !e.dirty.is_empty()).map(|(id, _)| *id).collect();
        let mut failed = 0;
        for id in ids {
            if !self.save(store, tables, id).await.is_empty() {
                failed += 1;
            }
        }
        failed
    }

    fn next_dirty(&self) -> Option<u32> {
        let after = match self.cursor {
            Some(c) => (Bound::Excluded(c), Bound::Unbounded),
            None => (Bound::Unbounded, Bound::Unbounded),
        };
        let before = self.cursor.map(|c| self.entries.range(..=c)).into_iter().flatten();
        self.entries
            .range(after)
            .chain(before)
            .find(|(_, e)| !e.dirty.is_empty())
            .map(|(id, _)| *id)
    }

    /// One tick of the flush cycle. Returns the delay until the next tick:
    /// `budget` divided by the resident count (at least one).
    pub async fn flush_step(&mut self, store: &dyn Store, tables: &TableConfig, budget: Duration) -> Duration {
        let evict: Vec<u32> = self
            .entries
            .iter()
            .filter(|(_, e)| e.pending_removal && e.dirty.is_empty())
            .map(|(id, _)| *id)
            .collect();
        for id in evict {
            self.entries.remove(&id);
            tracing::debug!("[char] [{}] #{} unloaded", A::KIND, id);
        }

        if let Some(id) = self.next_dirty() {
            self.save(store, tables, id).await;
            self.cursor = Some(id);
        }

        budget / self.entries.len().max(1) as u32
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::servers::char::db::{Arg, MemoryStore};

    const BASIC: DirtyMask = DirtyMask(1);
    const MEMBER: DirtyMask = DirtyMask(2);

    #[derive(Clone, Debug)]
    struct Club {
        id: u32,
        online: usize,
    }

    impl Aggregate for Club {
        const KIND: &'static str = "club";

        fn id(&self) -> u32 {
            self.id
        }

        fn online_members(&self) -> usize {
            self.online
        }

        fn aspect_statements(&self, _tables: &TableConfig, aspect: DirtyMask) -> Vec<Statement> {
            if aspect == MEMBER {
                vec![
                    Statement::new("member", "DELETE FROM club_member").arg(self.id),
                    Statement::new("member", "INSERT INTO club_member").arg(self.id),
                ]
            } else {
                vec![Statement::new("basic", "UPDATE club").arg(self.id)]
            }
        }

        fn delete_statements(&self, _tables: &TableConfig) -> Vec<Statement> {
            vec![Statement::new("break", "DELETE FROM club").arg(self.id)]
        }
    }

    fn cache(ids: &[u32]) -> AggregateCache<Club> {
        let mut c = AggregateCache::new();
        for &id in ids {
            c.insert(Club { id, online: 1 });
        }
        c
    }

    #[test]
    fn test_mask_iter() {
        let m = DirtyMask(0b1010_0001);
        assert_eq!(m.iter().map(|b| b.0).collect::<Vec<_>>(), vec![1, 32, 128]);
        assert!(DirtyMask::EMPTY.iter().next().is_none());
    }

    #[tokio::test]
    async fn test_interval_is_budget_over_resident_count() {
        let store = MemoryStore::new();
        let tables = TableConfig::default();
        let budget = Duration::from_millis(300);
        let mut c = cache(&[1, 2, 3]);
        assert_eq!(c.flush_step(&store, &tables, budget).await, Duration::from_millis(100));
        let mut empty: AggregateCache<Club> = AggregateCache::new();
        assert_eq!(empty.flush_step(&store, &tables, budget).await, budget);
    }

    #[tokio::test]
    async fn test_one_dirty_aggregate_per_tick_in_id_order() {
        let store = MemoryStore::new();
        let tables = TableConfig::default();
        let budget = Duration::from_secs(1);
        let mut c = cache(&[5, 1, 9]);
        for id in [1, 5, 9] {
            c.mark(id, BASIC);
        }
        c.flush_step(&store, &tables, budget).await;
        c.flush_step(&store, &tables, budget).await;
        c.flush_step(&store, &tables, budget).await;
        let saved: Vec<Arg> = store.statements().into_iter().flat_map(|s| s.args).collect();
        assert_eq!(saved, vec![Arg::U64(1), Arg::U64(5), Arg::U64(9)]);

        // clean now: nothing more is written
        c.flush_step(&store, &tables, budget).await;
        assert_eq!(store.statements().len(), 3);

        // the cursor wraps past the end
        c.mark(1, BASIC);
        c.flush_step(&store, &tables, budget).await;
        assert_eq!(store.statements().len(), 4);
        assert!(c.dirty(1).is_empty());
    }

    #[tokio::test]
    async fn test_failed_aspect_stays_dirty() {
        let store = MemoryStore::new();
        let tables = TableConfig::default();
        let mut c = cache(&[1]);
        c.mark(1, BASIC | MEMBER);
        store.fail_matching("member");
        let failed = c.save(&store, &tables, 1).await;
        assert_eq!(failed, MEMBER);
        assert_eq!(c.dirty(1), MEMBER);
        // only the basic update got through; the member pair was rolled back
        assert_eq!(store.statements().len(), 1);
    }

    #[tokio::test]
    async fn test_eviction_waits_for_clean_mask() {
        let store = MemoryStore::new();
        let tables = TableConfig::default();
        let budget = Duration::from_secs(1);

        let mut c = cache(&[1, 2]);
        c.release(1);
        c.flush_step(&store, &tables, budget).await;
        assert!(!c.contains(1));
        assert!(c.contains(2));

        c.mark(2, MEMBER);
        c.release(2);
        store.fail_matching("member");
        for _ in 0..5 {
            c.flush_step(&store, &tables, budget).await;
            assert!(c.contains(2));
            assert!(c.get(2).is_some());
        }
        store.clear_failures();
        c.flush_step(&store, &tables, budget).await;
        assert!(c.contains(2));
        assert!(c.dirty(2).is_empty());
        c.flush_step(&store, &tables, budget).await;
        assert!(!c.contains(2));
    }

    #[tokio::test]
    async fn test_touch_cancels_removal() {
        let store = MemoryStore::new();
        let tables = TableConfig::default();
        let mut c = cache(&[1]);
        c.release(1);
        c.touch(1);
        c.flush_step(&store, &tables, Duration::from_secs(1)).await;
        assert!(c.contains(1));
    }

    #[test]
    fn test_insert_keeps_resident_copy() {
        let mut c = cache(&[1]);
        c.modify(1, BASIC, |club| {
            club.online = 7;
            Some(())
        });
        c.insert(Club { id: 1, online: 0 });
        assert_eq!(c.get(1).map(|g| g.online), Some(7));
        assert_eq!(c.dirty(1), BASIC);
    }

    #[tokio::test]
    async fn test_refused_modify_writes_nothing() {
        let store = MemoryStore::new();
        let tables = TableConfig::default();
        let mut c = cache(&[1]);
        let refused: Option<()> = c.modify(1, MEMBER, |club| if club.online > 5 { Some(()) } else { None });
        assert!(refused.is_none());
        assert_eq!(c.update(1, |club| club.online), Some(1));
        assert!(c.dirty(1).is_empty());
        c.flush_step(&store, &tables, Duration::from_secs(1)).await;
        assert!(store.statements().is_empty());

        assert_eq!(c.modify(1, MEMBER, |club| Some(club.online)), Some(1));
        assert_eq!(c.dirty(1), MEMBER);
    }
}
