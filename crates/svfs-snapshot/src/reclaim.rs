//! Dead-snapshot reclamation.
//!
//! A snapshot node whose subvolume is gone and which has no live children
//! is dead: every key tagged with its id across the snapshot-bearing
//! trees must be erased before the row itself can go. The work runs as a
//! single coalesced background job guarded by the filesystem write gate,
//! in five restartable phases, each its own transaction:
//!
//! 1. mark childless, subvolume-less nodes deleted
//! 2. recompute the equivalence map
//! 3. materialize the list of deleted ids
//! 4. sweep keys in every snapshot-bearing tree
//! 5. physically remove the dead snapshot rows
//!
//! A crash anywhere in between is harmless: mount re-queues the job
//! whenever a `DELETED` row survives, and every phase is idempotent.

use asupersync::Cx;
use parking_lot::{Condvar, Mutex};
use std::sync::Arc;
use std::thread::JoinHandle;
use svfs_btree::{BtreeStore, FlushOutcome, ReadFlags, retry_transaction};
use svfs_error::{Result, SvfsError};
use svfs_ondisk::SnapshotRecord;
use svfs_types::{Bpos, BtreeId, POS_MIN, SNAPSHOT_ID_MAX, SNAPSHOT_ID_MIN};
use tracing::{debug, error, info, trace};

use crate::node::{
    MissingBackpointerPolicy, snapshot_delete_physical, snapshot_is_live, snapshot_mark_deleted,
};
use crate::table::SnapshotTable;

// ── Write gate ──────────────────────────────────────────────────────────────

#[derive(Debug, Default)]
struct GateState {
    refs: u32,
    closed: bool,
}

#[derive(Debug, Default)]
struct GateInner {
    state: Mutex<GateState>,
    cond: Condvar,
}

/// Filesystem-wide write gate. Background work holds a reference while it
/// runs; unmount closes the gate and waits for the references to drain.
#[derive(Debug, Clone, Default)]
pub struct WritesGate {
    inner: Arc<GateInner>,
}

/// A held reference on the write gate. Dropping it releases the gate.
#[derive(Debug)]
pub struct WritesRef {
    inner: Arc<GateInner>,
}

impl WritesGate {
    /// Take a reference, or `None` if the gate is closed (unmounting).
    #[must_use]
    pub fn try_get(&self) -> Option<WritesRef> {
        let mut state = self.inner.state.lock();
        if state.closed {
            return None;
        }
        state.refs += 1;
        Some(WritesRef {
            inner: Arc::clone(&self.inner),
        })
    }

    /// Close the gate and block until every outstanding reference drops.
    pub fn close_and_wait(&self) {
        let mut state = self.inner.state.lock();
        state.closed = true;
        while state.refs > 0 {
            self.inner.cond.wait(&mut state);
        }
    }

    #[must_use]
    pub fn refs(&self) -> u32 {
        self.inner.state.lock().refs
    }
}

impl Drop for WritesRef {
    fn drop(&mut self) {
        let mut state = self.inner.state.lock();
        state.refs -= 1;
        if state.refs == 0 {
            self.inner.cond.notify_all();
        }
    }
}

// ── Scheduling ──────────────────────────────────────────────────────────────

/// Knobs for the reclamation job.
#[derive(Debug, Clone, Copy, Default)]
pub struct ReclaimConfig {
    pub policy: MissingBackpointerPolicy,
}

#[derive(Debug, Default)]
struct QueueState {
    /// The queued job, holding the write reference it was enqueued with.
    pending: Option<WritesRef>,
    running: bool,
    shutdown: bool,
}

#[derive(Debug)]
struct ReclaimShared {
    store: BtreeStore,
    table: Arc<SnapshotTable>,
    config: ReclaimConfig,
    gate: WritesGate,
    queue: Mutex<QueueState>,
    cond: Condvar,
}

/// Handle for scheduling reclamation. Cheap to clone; commit hooks hold
/// one.
#[derive(Debug, Clone)]
pub struct ReclaimHandle {
    shared: Arc<ReclaimShared>,
}

impl ReclaimHandle {
    #[must_use]
    pub fn new(store: BtreeStore, table: Arc<SnapshotTable>, config: ReclaimConfig) -> Self {
        Self {
            shared: Arc::new(ReclaimShared {
                store,
                table,
                config,
                gate: WritesGate::default(),
                queue: Mutex::new(QueueState::default()),
                cond: Condvar::new(),
            }),
        }
    }

    #[must_use]
    pub fn gate(&self) -> &WritesGate {
        &self.shared.gate
    }

    /// Schedule a reclamation run. Coalesces: the queue holds at most one
    /// pending instance, and a no-op enqueue does not stack a second
    /// write reference.
    pub fn queue(&self) {
        let Some(wref) = self.shared.gate.try_get() else {
            debug!(target: "svfs::reclaim", "write gate closed; reclamation not scheduled");
            return;
        };
        let mut queue = self.shared.queue.lock();
        if queue.shutdown || queue.pending.is_some() {
            drop(queue);
            drop(wref);
            debug!(target: "svfs::reclaim", "reclamation already queued");
            return;
        }
        queue.pending = Some(wref);
        self.shared.cond.notify_all();
    }

    /// Run reclamation synchronously on the calling thread, absorbing a
    /// pending queued instance if there is one. Used by the fsck-style
    /// mount path and by tests that need determinism.
    pub fn run_now(&self, cx: &Cx) -> Result<()> {
        let wref = {
            let mut queue = self.shared.queue.lock();
            while queue.running {
                self.shared.cond.wait(&mut queue);
            }
            let wref = match queue.pending.take() {
                Some(wref) => wref,
                None => match self.shared.gate.try_get() {
                    Some(wref) => wref,
                    None => return Ok(()),
                },
            };
            queue.running = true;
            wref
        };

        let result = delete_dead_snapshots(
            cx,
            &self.shared.store,
            &self.shared.table,
            self.shared.config.policy,
        );

        drop(wref);
        let mut queue = self.shared.queue.lock();
        queue.running = false;
        self.shared.cond.notify_all();
        result
    }

    /// Block until no job is queued or running.
    pub fn wait_idle(&self) {
        let mut queue = self.shared.queue.lock();
        while queue.running || (queue.pending.is_some() && !queue.shutdown) {
            self.shared.cond.wait(&mut queue);
        }
    }

    pub(crate) fn spawn_worker(&self, cx: Cx) -> JoinHandle<()> {
        let shared = Arc::clone(&self.shared);
        std::thread::spawn(move || worker_loop(&shared, &cx))
    }

    pub(crate) fn shutdown(&self) {
        let mut queue = self.shared.queue.lock();
        queue.shutdown = true;
        // Abandon a queued-but-unstarted job; mount re-arms it.
        queue.pending.take();
        self.shared.cond.notify_all();
    }
}

fn worker_loop(shared: &Arc<ReclaimShared>, cx: &Cx) {
    loop {
        let wref = {
            let mut queue = shared.queue.lock();
            loop {
                if queue.shutdown {
                    return;
                }
                if !queue.running {
                    if let Some(wref) = queue.pending.take() {
                        queue.running = true;
                        break wref;
                    }
                }
                shared.cond.wait(&mut queue);
            }
        };

        if let Err(err) =
            delete_dead_snapshots(cx, &shared.store, &shared.table, shared.config.policy)
        {
            // Fatal for this job; the write reference drops below and the
            // work is retried after the next mount.
            error!(target: "svfs::reclaim", error = %err, "dead snapshot deletion failed");
        }

        drop(wref);
        let mut queue = shared.queue.lock();
        queue.running = false;
        shared.cond.notify_all();
    }
}

// ── The reclamation pass ────────────────────────────────────────────────────

/// Decode every row in the snapshot node table, skipping (and logging)
/// anything that does not decode as a snapshot row.
pub(crate) fn scan_snapshot_rows(
    cx: &Cx,
    store: &BtreeStore,
) -> Result<Vec<(u32, SnapshotRecord)>> {
    let mut txn = store.begin();
    let raw = txn.scan(
        cx,
        BtreeId::Snapshots,
        Bpos::snapshot_row(SNAPSHOT_ID_MIN),
        Bpos::snapshot_row(SNAPSHOT_ID_MAX),
        ReadFlags::empty(),
    )?;
    let mut rows = Vec::new();
    rows.try_reserve(raw.len())
        .map_err(|_| SvfsError::OutOfMemory)?;
    for (pos, bytes) in raw {
        let Ok(id) = u32::try_from(pos.offset) else {
            continue;
        };
        match SnapshotRecord::decode(&bytes) {
            Ok(rec) => rows.push((id, rec)),
            Err(reason) => {
                error!(
                    target: "svfs::snapshot",
                    %pos,
                    %reason,
                    "unexpected row in snapshot node table"
                );
            }
        }
    }
    Ok(rows)
}

/// One full reclamation pass. Idempotent; safe to re-run after a crash at
/// any point.
pub fn delete_dead_snapshots(
    cx: &Cx,
    store: &BtreeStore,
    table: &SnapshotTable,
    policy: MissingBackpointerPolicy,
) -> Result<()> {
    debug!(target: "svfs::reclaim", "starting dead snapshot deletion");

    // Phase 1: a node with no live children and no owning subvolume is
    // dead; mark it. Children sit above their parents in the id space,
    // so walking from the top lets a whole dead chain cascade in one
    // pass: each mark is visible to the liveness probe of the next row
    // down.
    let rows = scan_snapshot_rows(cx, store)?;
    for (id, rec) in rows.iter().rev() {
        if rec.deleted() || rec.is_subvol() {
            continue;
        }
        let children = rec.children;
        let any_live = retry_transaction(store, cx, |txn| {
            Ok(snapshot_is_live(cx, txn, children[0])? || snapshot_is_live(cx, txn, children[1])?)
        })?;
        if !any_live {
            retry_transaction(store, cx, |txn| snapshot_mark_deleted(cx, txn, table, *id))?;
        }
    }

    // Phase 2: equivalence recomputation over the whole tree.
    let rows = scan_snapshot_rows(cx, store)?;
    table.recompute_equiv(&rows)?;

    // Phase 3: the deleted set is the ground truth for the key sweep.
    let rows = scan_snapshot_rows(cx, store)?;
    let mut dead: Vec<u32> = Vec::new();
    dead.try_reserve(rows.len())
        .map_err(|_| SvfsError::OutOfMemory)?;
    for (id, rec) in &rows {
        if rec.deleted() {
            dead.push(*id);
        }
    }
    info!(target: "svfs::reclaim", dead = dead.len(), "deleting keys of dead snapshots");

    // Phase 4: sweep every snapshot-bearing tree.
    for btree in BtreeId::ALL {
        if !btree.has_snapshots() {
            continue;
        }
        if let Err(err) = delete_keys_in_btree(cx, store, table, &dead, btree) {
            error!(target: "svfs::reclaim", btree = %btree, error = %err, "error deleting snapshot keys");
            return Err(err);
        }
    }

    // Phase 5: remove the snapshot rows themselves. Children sit above
    // their parents in the id space; unhook them first so the parent
    // rewrite still finds its row when both are dead.
    for id in dead.iter().rev() {
        retry_transaction(store, cx, |txn| {
            snapshot_delete_physical(cx, txn, table, *id, policy)
        })?;
    }

    debug!(target: "svfs::reclaim", "dead snapshot deletion finished");
    Ok(())
}

/// Delete every key in `btree` whose snapshot is dead or redundant.
///
/// A key is redundant when an equivalent key (same logical slot, same
/// equivalence representative) was already kept. Newer versions sit at
/// larger snapshot ids, so each slot's keys are visited newest-first and
/// the newest of each equivalence class survives.
fn delete_keys_in_btree(
    cx: &Cx,
    store: &BtreeStore,
    table: &SnapshotTable,
    dead: &[u32],
    btree: BtreeId,
) -> Result<()> {
    let mut seen_equivs: Vec<u32> = Vec::new();
    let mut cursor = POS_MIN;
    loop {
        let mut txn = store.begin();
        let Some((first, _)) = txn.peek(cx, btree, cursor, ReadFlags::empty())? else {
            break;
        };
        let slot_start = Bpos::new(first.inode, first.offset, 0);
        let slot_end = Bpos::new(first.inode, first.offset, u32::MAX);
        let keys = txn.scan(cx, btree, slot_start, slot_end, ReadFlags::empty())?;
        drop(txn);

        seen_equivs.clear();
        for (pos, _) in keys.iter().rev() {
            let equiv = table.equiv(pos.snapshot);
            if dead.contains(&pos.snapshot) || seen_equivs.contains(&equiv) {
                if btree == BtreeId::Inodes
                    && store.key_cache_flush(cx, btree, *pos)? == FlushOutcome::Deferred
                {
                    trace!(target: "svfs::reclaim", %pos, "key cache flush deferred; retrying next scan");
                    continue;
                }
                let mut txn = store.begin();
                txn.delete(btree, *pos);
                txn.commit_nofail(cx)?;
                trace!(target: "svfs::reclaim", btree = %btree, %pos, equiv, "deleted key");
            } else {
                seen_equivs
                    .try_reserve(1)
                    .map_err(|_| SvfsError::OutOfMemory)?;
                seen_equivs.push(equiv);
            }
        }

        match slot_end.successor() {
            Some(next) => cursor = next,
            None => break,
        }
    }
    Ok(())
}
