//! Snapshot node store: transactional read/write/delete of individual
//! snapshot rows, keeping parent and child pointers symmetric.
//!
//! All operations take a transaction handle and are safe to retry end to
//! end; partial state is only observable inside an uncommitted
//! transaction. Every row write is mirrored into the in-core table.

use asupersync::Cx;
use svfs_btree::{ReadFlags, Transaction};
use svfs_error::{Result, SvfsError};
use svfs_ondisk::SnapshotRecord;
use svfs_types::{Bpos, BtreeId, SNAPSHOT_ID_MAX, SNAPSHOT_ID_MIN};
use tracing::{debug, error};

use crate::table::SnapshotTable;

/// What to do when a physical delete finds the parent row or its
/// child back-pointer missing.
///
/// The lenient default matches the behavior this engine has always had:
/// log the inconsistency and carry on, so one corrupt pointer does not
/// wedge reclamation forever.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum MissingBackpointerPolicy {
    #[default]
    Tolerate,
    Abort,
}

fn decode_row(id: u32, bytes: &[u8]) -> Result<SnapshotRecord> {
    SnapshotRecord::decode(bytes).map_err(|reason| {
        error!(target: "svfs::snapshot", id, %reason, "undecodable snapshot row");
        SvfsError::Format(format!("snapshot row {id}: {reason}"))
    })
}

/// Look up one snapshot row. `NotFound` when the slot is empty.
pub fn snapshot_lookup(cx: &Cx, txn: &mut Transaction, id: u32) -> Result<SnapshotRecord> {
    let bytes = txn
        .peek_slot(
            cx,
            BtreeId::Snapshots,
            Bpos::snapshot_row(id),
            ReadFlags::empty().with_updates(),
        )?
        .ok_or_else(|| SvfsError::NotFound(format!("snapshot node {id}")))?;
    decode_row(id, &bytes)
}

/// Whether `id` names a live (present, not `DELETED`) snapshot node.
///
/// Id 0 is never live: it means "none" and the answer is a harmless
/// `false`. A missing non-zero node is an error: the caller was holding
/// a pointer to it.
pub fn snapshot_is_live(cx: &Cx, txn: &mut Transaction, id: u32) -> Result<bool> {
    if id == 0 {
        return Ok(false);
    }
    match snapshot_lookup(cx, txn, id) {
        Ok(rec) => Ok(!rec.deleted()),
        Err(SvfsError::NotFound(_)) => {
            error!(target: "svfs::snapshot", id, "snapshot node not found");
            Err(SvfsError::NotFound(format!("snapshot node {id}")))
        }
        Err(err) => Err(err),
    }
}

/// Mark a snapshot node as deleted, for future cleanup. No-op if it
/// already is.
pub fn snapshot_mark_deleted(
    cx: &Cx,
    txn: &mut Transaction,
    table: &SnapshotTable,
    id: u32,
) -> Result<()> {
    let pos = Bpos::snapshot_row(id);
    let Some(bytes) = txn.peek_slot(
        cx,
        BtreeId::Snapshots,
        pos,
        ReadFlags::empty().with_updates().intent(),
    )?
    else {
        error!(target: "svfs::snapshot", id, "missing snapshot");
        return Err(SvfsError::Inconsistent(format!("missing snapshot {id}")));
    };
    let mut rec = decode_row(id, &bytes)?;
    if rec.deleted() {
        return Ok(());
    }
    rec.set_deleted(true);
    txn.update(BtreeId::Snapshots, pos, rec.encode().to_vec());
    table.update_from_row(id, &rec)?;
    debug!(target: "svfs::snapshot", id, "snapshot marked deleted");
    Ok(())
}

/// Physically remove a `DELETED` snapshot row, unhooking it from its
/// parent's child array and re-normalizing the parent.
pub fn snapshot_delete_physical(
    cx: &Cx,
    txn: &mut Transaction,
    table: &SnapshotTable,
    id: u32,
    policy: MissingBackpointerPolicy,
) -> Result<()> {
    let pos = Bpos::snapshot_row(id);
    let Some(bytes) = txn.peek_slot(
        cx,
        BtreeId::Snapshots,
        pos,
        ReadFlags::empty().with_updates().intent(),
    )?
    else {
        error!(target: "svfs::snapshot", id, "missing snapshot");
        return Err(SvfsError::Inconsistent(format!("missing snapshot {id}")));
    };
    let rec = decode_row(id, &bytes)?;
    debug_assert!(rec.deleted(), "physical delete of a live snapshot node");

    if rec.parent != 0 {
        let parent_pos = Bpos::snapshot_row(rec.parent);
        match txn.peek_slot(
            cx,
            BtreeId::Snapshots,
            parent_pos,
            ReadFlags::empty().with_updates().intent(),
        )? {
            None => {
                error!(target: "svfs::snapshot", id = rec.parent, "missing snapshot");
                if policy == MissingBackpointerPolicy::Abort {
                    return Err(SvfsError::Inconsistent(format!(
                        "missing snapshot {}",
                        rec.parent
                    )));
                }
            }
            Some(parent_bytes) => {
                let mut parent = decode_row(rec.parent, &parent_bytes)?;
                match parent.children.iter().position(|child| *child == id) {
                    Some(i) => parent.children[i] = 0,
                    None => {
                        error!(
                            target: "svfs::snapshot",
                            parent = rec.parent,
                            child = id,
                            "snapshot missing child pointer"
                        );
                        if policy == MissingBackpointerPolicy::Abort {
                            return Err(SvfsError::Inconsistent(format!(
                                "snapshot {} missing child pointer to {id}",
                                rec.parent
                            )));
                        }
                    }
                }
                parent.normalize_children();
                txn.update(BtreeId::Snapshots, parent_pos, parent.encode().to_vec());
                table.update_from_row(rec.parent, &parent)?;
            }
        }
    }

    txn.delete(BtreeId::Snapshots, pos);
    table.remove(id);
    debug!(target: "svfs::snapshot", id, "snapshot row removed");
    Ok(())
}

/// Create `subvol_ids.len()` new snapshot nodes under `parent` (0 for
/// roots), returning their ids. Unused slots of the returned array are 0.
///
/// Ids are taken immediately above the occupied region of the id space,
/// so every node's id exceeds its parent's. A parent may be assigned
/// children exactly once.
pub fn snapshot_node_create(
    cx: &Cx,
    txn: &mut Transaction,
    table: &SnapshotTable,
    parent: u32,
    subvol_ids: &[u32],
) -> Result<[u32; 2]> {
    let nr = subvol_ids.len();
    debug_assert!(nr == 1 || nr == 2);

    let last = txn.peek_last(
        cx,
        BtreeId::Snapshots,
        Bpos::snapshot_row(SNAPSHOT_ID_MAX),
        ReadFlags::empty().with_updates().intent(),
    )?;
    let base = match last {
        Some((pos, _)) => {
            let last_id =
                u32::try_from(pos.offset).map_err(|_| SvfsError::Invalid(pos.to_string()))?;
            u64::from(last_id) + 1
        }
        None => u64::from(SNAPSHOT_ID_MIN),
    };
    if base + nr as u64 - 1 > u64::from(SNAPSHOT_ID_MAX) {
        return Err(SvfsError::NoSpace);
    }
    #[allow(clippy::cast_possible_truncation)]
    let base = base as u32;

    let mut new_ids = [0_u32; 2];
    for (i, subvol) in subvol_ids.iter().enumerate() {
        let id = base + u32::try_from(i).map_err(|_| SvfsError::Invalid(i.to_string()))?;
        let pos = Bpos::snapshot_row(id);
        // Take an intent read on the empty slot so a racing creation
        // restarts one of us instead of silently colliding.
        if txn
            .peek_slot(cx, BtreeId::Snapshots, pos, ReadFlags::empty().intent())?
            .is_some()
        {
            return Err(SvfsError::Restart);
        }

        let mut rec = SnapshotRecord {
            parent,
            subvol: *subvol,
            ..SnapshotRecord::default()
        };
        rec.set_is_subvol(true);
        txn.update(BtreeId::Snapshots, pos, rec.encode().to_vec());
        table.update_from_row(id, &rec)?;
        new_ids[i] = id;
        debug!(target: "svfs::snapshot", id, parent, subvol, "snapshot node created");
    }

    if parent != 0 {
        let parent_pos = Bpos::snapshot_row(parent);
        let Some(bytes) = txn.peek_slot(
            cx,
            BtreeId::Snapshots,
            parent_pos,
            ReadFlags::empty().with_updates().intent(),
        )?
        else {
            error!(target: "svfs::snapshot", id = parent, "snapshot not found");
            return Err(SvfsError::NotFound(format!("snapshot node {parent}")));
        };
        let mut rec = decode_row(parent, &bytes)?;
        if rec.children[0] != 0 || rec.children[1] != 0 {
            error!(
                target: "svfs::snapshot",
                id = parent,
                "cannot add child nodes to a snapshot that already has children"
            );
            return Err(SvfsError::Invalid(format!(
                "snapshot node {parent} already has children"
            )));
        }
        rec.children = new_ids;
        rec.normalize_children();
        rec.set_is_subvol(false);
        txn.update(BtreeId::Snapshots, parent_pos, rec.encode().to_vec());
        table.update_from_row(parent, &rec)?;
    }

    Ok(new_ids)
}

#[cfg(test)]
mod tests {
    use super::*;
    use svfs_btree::{BtreeStore, retry_transaction};

    fn setup() -> (Cx, BtreeStore, SnapshotTable) {
        (Cx::for_testing(), BtreeStore::new(), SnapshotTable::new())
    }

    fn lookup(cx: &Cx, store: &BtreeStore, id: u32) -> Result<SnapshotRecord> {
        let mut txn = store.begin();
        snapshot_lookup(cx, &mut txn, id)
    }

    #[test]
    fn create_root_then_children() {
        let (cx, store, table) = setup();

        let root = retry_transaction(&store, &cx, |txn| {
            snapshot_node_create(&cx, txn, &table, 0, &[10])
        })
        .unwrap();
        assert_eq!(root, [1, 0]);

        let kids = retry_transaction(&store, &cx, |txn| {
            snapshot_node_create(&cx, txn, &table, root[0], &[11, 10])
        })
        .unwrap();
        assert_eq!(kids, [2, 3]);

        let parent = lookup(&cx, &store, 1).unwrap();
        assert_eq!(parent.children, [3, 2]);
        assert!(!parent.is_subvol());

        for id in [2, 3] {
            let child = lookup(&cx, &store, id).unwrap();
            assert_eq!(child.parent, 1);
            assert_eq!(child.children, [0, 0]);
            assert!(child.is_subvol());
        }

        // In-core image mirrors the rows.
        assert_eq!(table.get(1).unwrap().children, [3, 2]);
        assert_eq!(table.get(2).unwrap().parent, 1);
    }

    #[test]
    fn create_rejects_parent_with_children() {
        let (cx, store, table) = setup();
        retry_transaction(&store, &cx, |txn| {
            let root = snapshot_node_create(&cx, txn, &table, 0, &[10])?;
            snapshot_node_create(&cx, txn, &table, root[0], &[11, 10])?;
            Ok(root[0])
        })
        .unwrap();

        let err = retry_transaction(&store, &cx, |txn| {
            snapshot_node_create(&cx, txn, &table, 1, &[12, 10])
        })
        .unwrap_err();
        assert!(matches!(err, SvfsError::Invalid(_)));
    }

    #[test]
    fn create_exhausts_id_space() {
        let (cx, store, table) = setup();
        // Occupy the top of the id space.
        let top = SnapshotRecord::default();
        let mut txn = store.begin();
        txn.update(
            BtreeId::Snapshots,
            Bpos::snapshot_row(SNAPSHOT_ID_MAX),
            top.encode().to_vec(),
        );
        txn.commit(&cx).unwrap();

        let err = retry_transaction(&store, &cx, |txn| {
            snapshot_node_create(&cx, txn, &table, 0, &[10])
        })
        .unwrap_err();
        assert_eq!(err, SvfsError::NoSpace);
    }

    #[test]
    fn mark_deleted_is_idempotent() {
        let (cx, store, table) = setup();
        retry_transaction(&store, &cx, |txn| {
            snapshot_node_create(&cx, txn, &table, 0, &[10])
        })
        .unwrap();

        retry_transaction(&store, &cx, |txn| {
            snapshot_mark_deleted(&cx, txn, &table, 1)
        })
        .unwrap();
        assert!(lookup(&cx, &store, 1).unwrap().deleted());

        retry_transaction(&store, &cx, |txn| {
            snapshot_mark_deleted(&cx, txn, &table, 1)
        })
        .unwrap();
        assert!(lookup(&cx, &store, 1).unwrap().deleted());
    }

    #[test]
    fn mark_deleted_missing_row_is_inconsistent() {
        let (cx, store, table) = setup();
        let err = retry_transaction(&store, &cx, |txn| {
            snapshot_mark_deleted(&cx, txn, &table, 42)
        })
        .unwrap_err();
        assert!(matches!(err, SvfsError::Inconsistent(_)));
    }

    #[test]
    fn physical_delete_renormalizes_parent() {
        let (cx, store, table) = setup();
        retry_transaction(&store, &cx, |txn| {
            let root = snapshot_node_create(&cx, txn, &table, 0, &[10])?;
            snapshot_node_create(&cx, txn, &table, root[0], &[11, 10])
        })
        .unwrap();

        // Delete child 3 (currently children[0] of the root).
        retry_transaction(&store, &cx, |txn| {
            snapshot_mark_deleted(&cx, txn, &table, 3)
        })
        .unwrap();
        retry_transaction(&store, &cx, |txn| {
            snapshot_delete_physical(&cx, txn, &table, 3, MissingBackpointerPolicy::Tolerate)
        })
        .unwrap();

        let parent = lookup(&cx, &store, 1).unwrap();
        assert_eq!(parent.children, [2, 0]);
        assert!(lookup(&cx, &store, 3).is_err());
        assert!(table.get(3).is_none());
    }

    #[test]
    fn physical_delete_tolerates_missing_backpointer() {
        let (cx, store, table) = setup();
        // Hand-craft a parent that lost its pointer to child 2.
        let mut txn = store.begin();
        let parent = SnapshotRecord::default();
        txn.update(
            BtreeId::Snapshots,
            Bpos::snapshot_row(1),
            parent.encode().to_vec(),
        );
        let mut child = SnapshotRecord {
            parent: 1,
            ..SnapshotRecord::default()
        };
        child.set_deleted(true);
        txn.update(
            BtreeId::Snapshots,
            Bpos::snapshot_row(2),
            child.encode().to_vec(),
        );
        txn.commit(&cx).unwrap();

        retry_transaction(&store, &cx, |txn| {
            snapshot_delete_physical(&cx, txn, &table, 2, MissingBackpointerPolicy::Tolerate)
        })
        .unwrap();
        assert!(lookup(&cx, &store, 2).is_err());
        // The parent row survives, untouched apart from normalization.
        assert_eq!(lookup(&cx, &store, 1).unwrap().children, [0, 0]);
    }

    #[test]
    fn physical_delete_abort_policy_fails_on_missing_backpointer() {
        let (cx, store, table) = setup();
        let mut txn = store.begin();
        txn.update(
            BtreeId::Snapshots,
            Bpos::snapshot_row(1),
            SnapshotRecord::default().encode().to_vec(),
        );
        let mut child = SnapshotRecord {
            parent: 1,
            ..SnapshotRecord::default()
        };
        child.set_deleted(true);
        txn.update(
            BtreeId::Snapshots,
            Bpos::snapshot_row(2),
            child.encode().to_vec(),
        );
        txn.commit(&cx).unwrap();

        let err = retry_transaction(&store, &cx, |txn| {
            snapshot_delete_physical(&cx, txn, &table, 2, MissingBackpointerPolicy::Abort)
        })
        .unwrap_err();
        assert!(matches!(err, SvfsError::Inconsistent(_)));
        // Aborted: the child row is still there.
        assert!(lookup(&cx, &store, 2).is_ok());
    }

    #[test]
    fn is_live_semantics() {
        let (cx, store, table) = setup();
        retry_transaction(&store, &cx, |txn| {
            snapshot_node_create(&cx, txn, &table, 0, &[10])
        })
        .unwrap();

        let mut txn = store.begin();
        assert!(!snapshot_is_live(&cx, &mut txn, 0).unwrap());
        assert!(snapshot_is_live(&cx, &mut txn, 1).unwrap());
        assert!(snapshot_is_live(&cx, &mut txn, 7).is_err());

        retry_transaction(&store, &cx, |txn| {
            snapshot_mark_deleted(&cx, txn, &table, 1)
        })
        .unwrap();
        let mut txn = store.begin();
        assert!(!snapshot_is_live(&cx, &mut txn, 1).unwrap());
    }
}
