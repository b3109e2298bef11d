//! Subvolume store and the creation protocol.
//!
//! A subvolume row ties a mountable root (an inode) to the snapshot node
//! it currently lives at. Creating a subvolume allocates one new snapshot
//! node; snapshotting an existing subvolume allocates two siblings under
//! the source's former snapshot and rebases the source onto one of them.

use asupersync::Cx;
use svfs_btree::{ReadFlags, Transaction};
use svfs_error::{Result, SvfsError};
use svfs_ondisk::SubvolumeRecord;
use svfs_types::{Bpos, BtreeId, SUBVOL_MAX, SUBVOL_MIN};
use tracing::{debug, error};

use crate::node::{snapshot_mark_deleted, snapshot_node_create};
use crate::reclaim::ReclaimHandle;
use crate::table::SnapshotTable;

/// Read one subvolume row.
///
/// With `inconsistent_if_absent`, a missing row is logged as a
/// filesystem inconsistency before `NotFound` is returned, for callers
/// that hold a reference which should have kept the row alive.
pub fn subvolume_get(
    cx: &Cx,
    txn: &mut Transaction,
    id: u32,
    flags: ReadFlags,
    inconsistent_if_absent: bool,
) -> Result<SubvolumeRecord> {
    match txn.peek_slot(cx, BtreeId::Subvolumes, Bpos::subvolume_row(id), flags)? {
        Some(bytes) => SubvolumeRecord::decode(&bytes).map_err(|reason| {
            error!(target: "svfs::subvol", id, %reason, "undecodable subvolume row");
            SvfsError::Format(format!("subvolume row {id}: {reason}"))
        }),
        None => {
            if inconsistent_if_absent {
                error!(target: "svfs::subvol", id, "missing subvolume");
            }
            Err(SvfsError::NotFound(format!("subvolume {id}")))
        }
    }
}

/// The snapshot a subvolume currently lives at.
pub fn subvolume_get_snapshot(cx: &Cx, txn: &mut Transaction, id: u32) -> Result<u32> {
    let rec = subvolume_get(
        cx,
        txn,
        id,
        ReadFlags::empty().cached().with_updates(),
        true,
    )?;
    Ok(rec.snapshot)
}

/// First free slot in the reserved subvolume id range.
pub fn subvolume_find_free_slot(cx: &Cx, txn: &mut Transaction) -> Result<u32> {
    find_free_slot_upto(cx, txn, SUBVOL_MAX)
}

/// Linear scan from `SUBVOL_MIN` for the first empty slot at or below
/// `max`. Split out so the saturation path is testable with a small
/// range.
pub(crate) fn find_free_slot_upto(cx: &Cx, txn: &mut Transaction, max: u32) -> Result<u32> {
    let mut candidate = SUBVOL_MIN;
    let mut cursor = Bpos::subvolume_row(SUBVOL_MIN);
    loop {
        match txn.peek(
            cx,
            BtreeId::Subvolumes,
            cursor,
            ReadFlags::empty().with_updates(),
        )? {
            Some((pos, _)) if pos.offset <= u64::from(max) => {
                if pos.offset > u64::from(candidate) {
                    break;
                }
                let occupied =
                    u32::try_from(pos.offset).map_err(|_| SvfsError::Invalid(pos.to_string()))?;
                let Some(next) = occupied.checked_add(1) else {
                    return Err(SvfsError::NoSpace);
                };
                candidate = next;
                if candidate > max {
                    return Err(SvfsError::NoSpace);
                }
                let Some(next_pos) = pos.successor() else {
                    return Err(SvfsError::NoSpace);
                };
                cursor = next_pos;
            }
            _ => break,
        }
    }
    if candidate > max {
        return Err(SvfsError::NoSpace);
    }
    // Intent-read the empty slot: a racing creation of the same slot
    // restarts instead of double-allocating.
    if txn
        .peek_slot(
            cx,
            BtreeId::Subvolumes,
            Bpos::subvolume_row(candidate),
            ReadFlags::empty().intent(),
        )?
        .is_some()
    {
        return Err(SvfsError::Restart);
    }
    Ok(candidate)
}

/// Delete a subvolume and mark its snapshot for reclamation.
///
/// `expect_snapshot` guards the caller's view of the row: `Some(x)`
/// fails with `NotFound` when the row's `IS_SNAPSHOT` flag disagrees.
/// On successful commit, a dead-snapshot reclamation run is scheduled.
pub fn subvolume_delete(
    cx: &Cx,
    txn: &mut Transaction,
    table: &SnapshotTable,
    id: u32,
    expect_snapshot: Option<bool>,
    reclaim: &ReclaimHandle,
) -> Result<()> {
    let rec = match subvolume_get(
        cx,
        txn,
        id,
        ReadFlags::empty().cached().with_updates().intent(),
        false,
    ) {
        Ok(rec) => rec,
        Err(SvfsError::NotFound(_)) => {
            error!(target: "svfs::subvol", id, "missing subvolume");
            return Err(SvfsError::Inconsistent(format!("missing subvolume {id}")));
        }
        Err(err) => return Err(err),
    };

    if let Some(expect) = expect_snapshot {
        if expect != rec.is_snapshot() {
            return Err(SvfsError::NotFound(format!("subvolume {id}")));
        }
    }

    txn.delete(BtreeId::Subvolumes, Bpos::subvolume_row(id));
    snapshot_mark_deleted(cx, txn, table, rec.snapshot)?;

    let handle = reclaim.clone();
    txn.on_commit(move || handle.queue());
    debug!(target: "svfs::subvol", id, snapshot = rec.snapshot, "subvolume deleted");
    Ok(())
}

/// Create a new subvolume, either standalone (`src == 0`) or as a
/// snapshot of `src`. Returns `(new_subvolume, new_snapshot)`.
///
/// When snapshotting, two sibling nodes are allocated under the source's
/// former snapshot: the first anchors the new subvolume, the second is
/// what the source is rebased onto, so the new child can itself be
/// snapshotted again later.
pub fn subvolume_create(
    cx: &Cx,
    txn: &mut Transaction,
    table: &SnapshotTable,
    inode: u64,
    src: u32,
    read_only: bool,
) -> Result<(u32, u32)> {
    let slot = subvolume_find_free_slot(cx, txn)?;

    let snapshot_subvols = [slot, src];
    let nr = if src != 0 { 2 } else { 1 };

    let mut parent = 0;
    let mut src_rec = None;
    if src != 0 {
        let rec = match subvolume_get(
            cx,
            txn,
            src,
            ReadFlags::empty().cached().with_updates().intent(),
            false,
        ) {
            Ok(rec) => rec,
            Err(SvfsError::NotFound(_)) => {
                error!(target: "svfs::subvol", id = src, "subvolume not found");
                return Err(SvfsError::NotFound(format!("subvolume {src}")));
            }
            Err(err) => return Err(err),
        };
        parent = rec.snapshot;
        src_rec = Some(rec);
    }

    let new_nodes = snapshot_node_create(cx, txn, table, parent, &snapshot_subvols[..nr])?;

    if let Some(mut rec) = src_rec {
        rec.snapshot = new_nodes[1];
        txn.update(
            BtreeId::Subvolumes,
            Bpos::subvolume_row(src),
            rec.encode().to_vec(),
        );
    }

    let mut rec = SubvolumeRecord {
        flags: 0,
        snapshot: new_nodes[0],
        inode,
    };
    rec.set_read_only(read_only);
    rec.set_is_snapshot(src != 0);
    txn.update(
        BtreeId::Subvolumes,
        Bpos::subvolume_row(slot),
        rec.encode().to_vec(),
    );

    debug!(
        target: "svfs::subvol",
        subvol = slot,
        snapshot = new_nodes[0],
        src,
        read_only,
        "subvolume created"
    );
    Ok((slot, new_nodes[0]))
}
