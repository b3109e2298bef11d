#![forbid(unsafe_code)]
//! Snapshot and subvolume engine.
//!
//! Maintains the persistent versioned graph of snapshot nodes over the
//! B-tree store, ties subvolumes (mountable roots) to snapshots, creates
//! writable or read-only clones, and asynchronously reclaims the storage
//! of dropped snapshots. Everything here is a transactional overlay on
//! the `svfs-btree` substrate: each mutation commits atomically with the
//! surrounding transaction, restarts on contention, and is rebuilt
//! consistently at mount.

pub mod check;
pub mod node;
pub mod reclaim;
pub mod subvol;
pub mod table;

use asupersync::Cx;
use parking_lot::Mutex;
use std::sync::Arc;
use std::thread::JoinHandle;
use svfs_btree::{BtreeStore, retry_transaction};
use svfs_error::Result;
use svfs_types::{InodeNumber, SnapshotId, SubvolumeId};
use tracing::{error, info};

pub use node::MissingBackpointerPolicy;
pub use reclaim::{ReclaimConfig, ReclaimHandle, WritesGate, WritesRef, delete_dead_snapshots};
pub use table::{SnapshotSlot, SnapshotTable};

/// The engine instance owned by a mounted filesystem.
///
/// Construction spawns the reclamation worker; `snapshots_start` must run
/// once at mount (before normal operation resumes) to rebuild the in-core
/// snapshot table and re-arm any reclamation left unfinished by a crash.
/// `snapshots_exit` stops the worker, drains the write gate, and frees
/// the in-core state.
pub struct SnapshotEngine {
    store: BtreeStore,
    table: Arc<SnapshotTable>,
    reclaim: ReclaimHandle,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl SnapshotEngine {
    #[must_use]
    pub fn new(store: BtreeStore, cx: &Cx) -> Self {
        Self::with_config(store, cx, ReclaimConfig::default())
    }

    #[must_use]
    pub fn with_config(store: BtreeStore, cx: &Cx, config: ReclaimConfig) -> Self {
        let table = Arc::new(SnapshotTable::new());
        let reclaim = ReclaimHandle::new(store.clone(), Arc::clone(&table), config);
        let worker = reclaim.spawn_worker(cx.clone());
        Self {
            store,
            table,
            reclaim,
            worker: Mutex::new(Some(worker)),
        }
    }

    #[must_use]
    pub fn store(&self) -> &BtreeStore {
        &self.store
    }

    #[must_use]
    pub fn table(&self) -> &SnapshotTable {
        &self.table
    }

    #[must_use]
    pub fn reclaim(&self) -> &ReclaimHandle {
        &self.reclaim
    }

    /// Mount-time start: replay every snapshot row into the in-core
    /// table, recompute equivalence, and re-queue reclamation if any
    /// `DELETED` row survived a crash.
    pub fn snapshots_start(&self, cx: &Cx) -> Result<()> {
        let rows = reclaim::scan_snapshot_rows(cx, &self.store)?;
        let mut have_deleted = false;
        for (id, rec) in &rows {
            if rec.deleted() {
                have_deleted = true;
            }
            self.table.update_from_row(*id, rec)?;
        }
        self.table.recompute_equiv(&rows)?;

        if have_deleted {
            info!(target: "svfs::reclaim", "restarting deletion of dead snapshots");
            self.reclaim.queue();
        }
        Ok(())
    }

    /// The snapshot a subvolume currently lives at.
    pub fn subvolume_get_snapshot(&self, cx: &Cx, id: SubvolumeId) -> Result<SnapshotId> {
        retry_transaction(&self.store, cx, |txn| {
            subvol::subvolume_get_snapshot(cx, txn, id.0)
        })
        .map(SnapshotId)
    }

    /// Create a subvolume: standalone when `src` is `None`, a snapshot of
    /// `src` otherwise. Returns the new subvolume and its snapshot.
    pub fn subvolume_create(
        &self,
        cx: &Cx,
        inode: InodeNumber,
        src: Option<SubvolumeId>,
        read_only: bool,
    ) -> Result<(SubvolumeId, SnapshotId)> {
        let src_raw = src.map_or(0, |s| s.0);
        retry_transaction(&self.store, cx, |txn| {
            subvol::subvolume_create(cx, txn, &self.table, inode.0, src_raw, read_only)
        })
        .map(|(subvol, snapshot)| (SubvolumeId(subvol), SnapshotId(snapshot)))
    }

    /// Delete a subvolume and schedule reclamation of its snapshot.
    ///
    /// `expect_snapshot`: `Some(x)` fails with `NotFound` when the row's
    /// `IS_SNAPSHOT` flag is not `x`; `None` deletes either kind.
    pub fn subvolume_delete(
        &self,
        cx: &Cx,
        id: SubvolumeId,
        expect_snapshot: Option<bool>,
    ) -> Result<()> {
        retry_transaction(&self.store, cx, |txn| {
            subvol::subvolume_delete(cx, txn, &self.table, id.0, expect_snapshot, &self.reclaim)
        })
    }

    /// fsck entry point.
    pub fn snapshots_check(&self, cx: &Cx) -> Result<()> {
        check::snapshots_check(cx, &self.store)
    }

    /// Run reclamation synchronously, absorbing any queued instance.
    pub fn run_reclaim_now(&self, cx: &Cx) -> Result<()> {
        self.reclaim.run_now(cx)
    }

    /// Block until no reclamation is queued or running.
    pub fn wait_reclaim_idle(&self) {
        self.reclaim.wait_idle();
    }

    /// Unmount: stop the worker, wait for the write gate to drain, free
    /// the in-core table.
    pub fn snapshots_exit(&self) {
        self.shutdown_worker();
        self.reclaim.gate().close_and_wait();
        self.table.clear();
    }

    fn shutdown_worker(&self) {
        let handle = self.worker.lock().take();
        if let Some(handle) = handle {
            self.reclaim.shutdown();
            if handle.join().is_err() {
                error!(target: "svfs::reclaim", "reclaim worker panicked");
            }
        }
    }
}

impl Drop for SnapshotEngine {
    fn drop(&mut self) {
        self.shutdown_worker();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn engine_lifecycle_is_clean() {
        let cx = Cx::for_testing();
        let store = BtreeStore::new();
        let engine = SnapshotEngine::new(store, &cx);
        engine.snapshots_start(&cx).unwrap();
        engine.snapshots_check(&cx).unwrap();
        engine.snapshots_exit();
        assert!(engine.table().is_empty());
    }

    #[test]
    fn fresh_subvolume_via_engine_api() {
        let cx = Cx::for_testing();
        let engine = SnapshotEngine::new(BtreeStore::new(), &cx);
        engine.snapshots_start(&cx).unwrap();

        let (subvol, snapshot) = engine
            .subvolume_create(&cx, InodeNumber(100), None, false)
            .unwrap();
        assert_eq!(
            engine.subvolume_get_snapshot(&cx, subvol).unwrap(),
            snapshot
        );
        engine.snapshots_check(&cx).unwrap();
        engine.snapshots_exit();
    }
}
