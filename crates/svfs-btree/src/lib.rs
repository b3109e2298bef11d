#![forbid(unsafe_code)]
//! Transactional B-tree substrate.
//!
//! Six named trees keyed by `Bpos`, with optimistic transactions layered
//! on top: reads taken with intent record the version they observed, and
//! commit re-validates the read set, returning `Restart` on contention so
//! the caller's transaction loop re-executes the body. Iteration is
//! snapshot-aware by construction: keys are stored and yielded with
//! their snapshot component.
//!
//! Also hosts the key cache used for hot inode rows: cached entries can
//! be dirty (pending writeback) or pinned (writeback deferred to journal
//! reclaim), and the reclamation sweep flushes them before deleting keys.

use asupersync::Cx;
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use svfs_error::{Result, SvfsError};
use svfs_types::{Bpos, BtreeId};
use tracing::trace;

fn checkpoint(cx: &Cx) -> Result<()> {
    cx.checkpoint().map_err(|_| SvfsError::Cancelled)
}

#[derive(Debug, Clone)]
struct Row {
    seq: u64,
    bytes: Vec<u8>,
}

#[derive(Debug, Default)]
struct Trees {
    maps: [BTreeMap<Bpos, Row>; BtreeId::ALL.len()],
    commit_seq: u64,
}

impl Trees {
    fn map(&self, btree: BtreeId) -> &BTreeMap<Bpos, Row> {
        &self.maps[btree.index()]
    }

    fn map_mut(&mut self, btree: BtreeId) -> &mut BTreeMap<Bpos, Row> {
        &mut self.maps[btree.index()]
    }
}

#[derive(Debug, Clone)]
struct KeyCacheEntry {
    bytes: Vec<u8>,
    dirty: bool,
    pinned: bool,
}

/// Result of flushing one key cache position back into its tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushOutcome {
    /// Nothing cached, or the cached copy was clean.
    Clean,
    /// A dirty row was written back.
    Flushed,
    /// The entry is pinned; writeback was deferred. The caller must skip
    /// this position and come back on a later pass.
    Deferred,
}

// ── Read flags ──────────────────────────────────────────────────────────────

/// Iterator/read flags, mirroring the host filesystem's conventions.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReadFlags {
    with_updates: bool,
    intent: bool,
    cached: bool,
}

impl ReadFlags {
    #[must_use]
    pub fn empty() -> Self {
        Self::default()
    }

    /// See this transaction's own staged writes.
    #[must_use]
    pub fn with_updates(mut self) -> Self {
        self.with_updates = true;
        self
    }

    /// Record the read for conflict detection (read-for-update).
    #[must_use]
    pub fn intent(mut self) -> Self {
        self.intent = true;
        self
    }

    /// Consult the key cache before the tree.
    #[must_use]
    pub fn cached(mut self) -> Self {
        self.cached = true;
        self
    }
}

// ── Store ───────────────────────────────────────────────────────────────────

#[derive(Debug, Default)]
struct StoreInner {
    trees: RwLock<Trees>,
    key_cache: Mutex<HashMap<(BtreeId, Bpos), KeyCacheEntry>>,
}

/// The shared, internally locked B-tree store.
///
/// Cloning is cheap; all clones observe the same trees.
#[derive(Debug, Clone, Default)]
pub struct BtreeStore {
    inner: Arc<StoreInner>,
}

impl BtreeStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn begin(&self) -> Transaction {
        Transaction {
            store: self.clone(),
            reads: BTreeMap::new(),
            updates: BTreeMap::new(),
            hooks: Vec::new(),
        }
    }

    /// Committed rows of one tree in key order. Test and fsck helper;
    /// does not see any transaction's staged writes.
    #[must_use]
    pub fn rows(&self, btree: BtreeId) -> Vec<(Bpos, Vec<u8>)> {
        self.inner
            .trees
            .read()
            .map(btree)
            .iter()
            .map(|(pos, row)| (*pos, row.bytes.clone()))
            .collect()
    }

    // ── Key cache ───────────────────────────────────────────────────────

    /// Install a cached copy of a row. `dirty` marks it as pending
    /// writeback into the tree.
    pub fn key_cache_fill(&self, btree: BtreeId, pos: Bpos, bytes: Vec<u8>, dirty: bool) {
        self.inner.key_cache.lock().insert(
            (btree, pos),
            KeyCacheEntry {
                bytes,
                dirty,
                pinned: false,
            },
        );
    }

    /// Pin a cached entry so flushes defer. Returns false if nothing is
    /// cached at that position.
    pub fn key_cache_pin(&self, btree: BtreeId, pos: Bpos) -> bool {
        match self.inner.key_cache.lock().get_mut(&(btree, pos)) {
            Some(entry) => {
                entry.pinned = true;
                true
            }
            None => false,
        }
    }

    pub fn key_cache_unpin(&self, btree: BtreeId, pos: Bpos) {
        if let Some(entry) = self.inner.key_cache.lock().get_mut(&(btree, pos)) {
            entry.pinned = false;
        }
    }

    fn key_cache_get(&self, btree: BtreeId, pos: Bpos) -> Option<Vec<u8>> {
        self.inner
            .key_cache
            .lock()
            .get(&(btree, pos))
            .map(|entry| entry.bytes.clone())
    }

    /// Flush one cached position back into its tree.
    pub fn key_cache_flush(&self, cx: &Cx, btree: BtreeId, pos: Bpos) -> Result<FlushOutcome> {
        checkpoint(cx)?;
        let mut cache = self.inner.key_cache.lock();
        match cache.get(&(btree, pos)) {
            None => return Ok(FlushOutcome::Clean),
            Some(entry) if entry.pinned => {
                trace!(target: "svfs::btree", btree = %btree, pos = %pos, "key cache flush deferred");
                return Ok(FlushOutcome::Deferred);
            }
            Some(_) => {}
        }
        if let Some(entry) = cache.remove(&(btree, pos)) {
            if entry.dirty {
                let mut trees = self.inner.trees.write();
                trees.commit_seq += 1;
                let seq = trees.commit_seq;
                trees.map_mut(btree).insert(
                    pos,
                    Row {
                        seq,
                        bytes: entry.bytes,
                    },
                );
                return Ok(FlushOutcome::Flushed);
            }
        }
        Ok(FlushOutcome::Clean)
    }
}

// ── Transactions ────────────────────────────────────────────────────────────

type CommitHook = Box<dyn FnOnce() + Send + 'static>;

/// One optimistic transaction over the store.
///
/// Staged writes are invisible to other transactions until commit; a
/// transaction dropped without committing has no effect and its commit
/// hooks never run.
pub struct Transaction {
    store: BtreeStore,
    /// Observed row sequence per intent-read key (0 = absent).
    reads: BTreeMap<(BtreeId, Bpos), u64>,
    /// Staged updates; `None` stages a deletion.
    updates: BTreeMap<(BtreeId, Bpos), Option<Vec<u8>>>,
    hooks: Vec<CommitHook>,
}

impl Transaction {
    /// Slot-level read of one key position. `Ok(None)` is an empty slot.
    pub fn peek_slot(
        &mut self,
        cx: &Cx,
        btree: BtreeId,
        pos: Bpos,
        flags: ReadFlags,
    ) -> Result<Option<Vec<u8>>> {
        checkpoint(cx)?;
        if flags.with_updates {
            if let Some(staged) = self.updates.get(&(btree, pos)) {
                return Ok(staged.clone());
            }
        }
        if flags.cached {
            if let Some(bytes) = self.store.key_cache_get(btree, pos) {
                if flags.intent {
                    self.record_read_locked(btree, pos);
                }
                return Ok(Some(bytes));
            }
        }
        let trees = self.store.inner.trees.read();
        let row = trees.map(btree).get(&pos);
        if flags.intent {
            let seq = row.map_or(0, |r| r.seq);
            self.reads.entry((btree, pos)).or_insert(seq);
        }
        Ok(row.map(|r| r.bytes.clone()))
    }

    fn record_read_locked(&mut self, btree: BtreeId, pos: Bpos) {
        let trees = self.store.inner.trees.read();
        let seq = trees.map(btree).get(&pos).map_or(0, |r| r.seq);
        self.reads.entry((btree, pos)).or_insert(seq);
    }

    /// First key at or after `from`, in key order.
    pub fn peek(
        &mut self,
        cx: &Cx,
        btree: BtreeId,
        from: Bpos,
        flags: ReadFlags,
    ) -> Result<Option<(Bpos, Vec<u8>)>> {
        checkpoint(cx)?;
        let committed = {
            let trees = self.store.inner.trees.read();
            trees
                .map(btree)
                .range(from..)
                .find(|(pos, _)| !flags.with_updates || !self.updates.contains_key(&(btree, **pos)))
                .map(|(pos, row)| (*pos, row.bytes.clone(), row.seq))
        };
        let staged = if flags.with_updates {
            self.updates
                .range((btree, from)..)
                .take_while(|((b, _), _)| *b == btree)
                .find_map(|((_, pos), val)| val.as_ref().map(|bytes| (*pos, bytes.clone())))
        } else {
            None
        };

        let chosen = match (committed, staged) {
            (Some((cp, cb, cs)), Some((sp, sb))) => {
                if sp <= cp {
                    Some((sp, sb, None))
                } else {
                    Some((cp, cb, Some(cs)))
                }
            }
            (Some((cp, cb, cs)), None) => Some((cp, cb, Some(cs))),
            (None, Some((sp, sb))) => Some((sp, sb, None)),
            (None, None) => None,
        };

        match chosen {
            Some((pos, bytes, seq)) => {
                if flags.intent {
                    if let Some(seq) = seq {
                        self.reads.entry((btree, pos)).or_insert(seq);
                    }
                }
                Ok(Some((pos, bytes)))
            }
            None => Ok(None),
        }
    }

    /// Greatest key at or below `upto`, in key order.
    pub fn peek_last(
        &mut self,
        cx: &Cx,
        btree: BtreeId,
        upto: Bpos,
        flags: ReadFlags,
    ) -> Result<Option<(Bpos, Vec<u8>)>> {
        checkpoint(cx)?;
        let committed = {
            let trees = self.store.inner.trees.read();
            trees
                .map(btree)
                .range(..=upto)
                .rev()
                .find(|(pos, _)| !flags.with_updates || !self.updates.contains_key(&(btree, **pos)))
                .map(|(pos, row)| (*pos, row.bytes.clone(), row.seq))
        };
        let staged = if flags.with_updates {
            self.updates
                .range(..=(btree, upto))
                .rev()
                .take_while(|((b, _), _)| *b == btree)
                .find_map(|((_, pos), val)| val.as_ref().map(|bytes| (*pos, bytes.clone())))
        } else {
            None
        };

        let chosen = match (committed, staged) {
            (Some((cp, cb, cs)), Some((sp, sb))) => {
                if sp >= cp {
                    Some((sp, sb, None))
                } else {
                    Some((cp, cb, Some(cs)))
                }
            }
            (Some((cp, cb, cs)), None) => Some((cp, cb, Some(cs))),
            (None, Some((sp, sb))) => Some((sp, sb, None)),
            (None, None) => None,
        };

        match chosen {
            Some((pos, bytes, seq)) => {
                if flags.intent {
                    if let Some(seq) = seq {
                        self.reads.entry((btree, pos)).or_insert(seq);
                    }
                }
                Ok(Some((pos, bytes)))
            }
            None => Ok(None),
        }
    }

    /// Collect all keys in `[from, to]` in key order.
    pub fn scan(
        &mut self,
        cx: &Cx,
        btree: BtreeId,
        from: Bpos,
        to: Bpos,
        flags: ReadFlags,
    ) -> Result<Vec<(Bpos, Vec<u8>)>> {
        let mut out = Vec::new();
        let mut cursor = from;
        while let Some((pos, bytes)) = self.peek(cx, btree, cursor, flags)? {
            if pos > to {
                break;
            }
            out.push((pos, bytes));
            let Some(next) = pos.successor() else { break };
            cursor = next;
        }
        Ok(out)
    }

    /// Stage a row write.
    pub fn update(&mut self, btree: BtreeId, pos: Bpos, bytes: Vec<u8>) {
        self.updates.insert((btree, pos), Some(bytes));
    }

    /// Stage a row deletion.
    pub fn delete(&mut self, btree: BtreeId, pos: Bpos) {
        self.updates.insert((btree, pos), None);
    }

    /// Register a callback to run exactly once after a successful commit.
    pub fn on_commit(&mut self, hook: impl FnOnce() + Send + 'static) {
        self.hooks.push(Box::new(hook));
    }

    /// Commit, re-validating the read set. `Restart` means a row this
    /// transaction read with intent changed underneath it.
    pub fn commit(self, cx: &Cx) -> Result<()> {
        self.commit_inner(cx, true)
    }

    /// Commit without read-set validation. Used where the caller must
    /// make forward progress under contention (the reclamation sweep).
    pub fn commit_nofail(self, cx: &Cx) -> Result<()> {
        self.commit_inner(cx, false)
    }

    fn commit_inner(mut self, cx: &Cx, validate: bool) -> Result<()> {
        checkpoint(cx)?;
        {
            let mut trees = self.store.inner.trees.write();
            if validate {
                for ((btree, pos), observed) in &self.reads {
                    let current = trees.map(*btree).get(pos).map_or(0, |r| r.seq);
                    if current != *observed {
                        trace!(
                            target: "svfs::btree",
                            btree = %btree,
                            pos = %pos,
                            observed,
                            current,
                            "read set conflict"
                        );
                        return Err(SvfsError::Restart);
                    }
                }
            }
            if !self.updates.is_empty() {
                trees.commit_seq += 1;
                let seq = trees.commit_seq;
                for ((btree, pos), val) in std::mem::take(&mut self.updates) {
                    match val {
                        Some(bytes) => {
                            trees.map_mut(btree).insert(pos, Row { seq, bytes });
                        }
                        None => {
                            trees.map_mut(btree).remove(&pos);
                        }
                    }
                }
            }
        }
        for hook in self.hooks.drain(..) {
            hook();
        }
        Ok(())
    }
}

/// Run `body` in a fresh transaction, retrying from the top on `Restart`.
///
/// No durable effects are observable until the commit inside a given
/// iteration succeeds; a restarted iteration's staged writes and hooks
/// are discarded wholesale.
pub fn retry_transaction<T>(
    store: &BtreeStore,
    cx: &Cx,
    mut body: impl FnMut(&mut Transaction) -> Result<T>,
) -> Result<T> {
    let mut contended = 0_u32;
    loop {
        let mut txn = store.begin();
        let value = match body(&mut txn) {
            Ok(value) => value,
            Err(SvfsError::Restart) => {
                contended += 1;
                trace!(target: "svfs::btree", contended, "transaction body restart");
                continue;
            }
            Err(err) => return Err(err),
        };
        match txn.commit(cx) {
            Ok(()) => return Ok(value),
            Err(SvfsError::Restart) => {
                contended += 1;
                trace!(target: "svfs::btree", contended, "transaction commit restart");
            }
            Err(err) => return Err(err),
        }
    }
}
