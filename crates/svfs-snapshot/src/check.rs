//! Snapshot/subvolume consistency check, run at mount before normal
//! operation resumes.
//!
//! Pass 1 walks every snapshot row and verifies its subvolume, parent,
//! and child back-pointers. Pass 2 walks every subvolume row and
//! verifies it points at a real snapshot. Each failure is logged with the
//! ids involved; the check succeeds only when nothing was flagged.

use asupersync::Cx;
use svfs_btree::{BtreeStore, ReadFlags, Transaction};
use svfs_error::{Result, SvfsError};
use svfs_ondisk::{SnapshotRecord, SubvolumeRecord};
use svfs_types::{Bpos, BtreeId, SNAPSHOT_ID_MAX, SNAPSHOT_ID_MIN, SUBVOL_MAX, SUBVOL_MIN};
use tracing::error;

use crate::node::snapshot_lookup;
use crate::subvol::subvolume_get;

fn check_snapshot_row(
    cx: &Cx,
    txn: &mut Transaction,
    id: u32,
    rec: &SnapshotRecord,
) -> Result<u64> {
    let mut failures = 0_u64;

    match subvolume_get(cx, txn, rec.subvol, ReadFlags::empty(), false) {
        Ok(subvol) => {
            if rec.is_subvol() != (subvol.snapshot == id) {
                error!(
                    target: "svfs::fsck",
                    id,
                    subvol = rec.subvol,
                    "snapshot node has wrong is_subvol flag"
                );
                failures += 1;
            }
        }
        Err(SvfsError::NotFound(_)) => {
            error!(
                target: "svfs::fsck",
                id,
                subvol = rec.subvol,
                "snapshot node has nonexistent subvolume"
            );
            failures += 1;
        }
        Err(err) => return Err(err),
    }

    if rec.parent != 0 {
        match snapshot_lookup(cx, txn, rec.parent) {
            Ok(parent) => {
                if !parent.children.contains(&id) {
                    error!(
                        target: "svfs::fsck",
                        parent = rec.parent,
                        child = id,
                        "snapshot parent missing pointer to child"
                    );
                    failures += 1;
                }
            }
            Err(SvfsError::NotFound(_)) => {
                error!(
                    target: "svfs::fsck",
                    id,
                    parent = rec.parent,
                    "snapshot node has nonexistent parent"
                );
                failures += 1;
            }
            Err(err) => return Err(err),
        }
    }

    for child in rec.children {
        if child == 0 {
            continue;
        }
        match snapshot_lookup(cx, txn, child) {
            Ok(child_rec) => {
                if child_rec.parent != id {
                    error!(
                        target: "svfs::fsck",
                        child,
                        got = child_rec.parent,
                        want = id,
                        "snapshot child has wrong parent"
                    );
                    failures += 1;
                }
            }
            Err(SvfsError::NotFound(_)) => {
                error!(
                    target: "svfs::fsck",
                    id,
                    child,
                    "snapshot node has nonexistent child"
                );
                failures += 1;
            }
            Err(err) => return Err(err),
        }
    }

    Ok(failures)
}

/// Full fsck over the snapshot and subvolume tables.
pub fn snapshots_check(cx: &Cx, store: &BtreeStore) -> Result<()> {
    let mut failures = 0_u64;
    let mut txn = store.begin();

    let snap_raw = txn.scan(
        cx,
        BtreeId::Snapshots,
        Bpos::snapshot_row(SNAPSHOT_ID_MIN),
        Bpos::snapshot_row(SNAPSHOT_ID_MAX),
        ReadFlags::empty(),
    )?;
    for (pos, bytes) in &snap_raw {
        match SnapshotRecord::validate(*pos, bytes) {
            Ok(rec) => {
                let Ok(id) = u32::try_from(pos.offset) else {
                    continue;
                };
                failures += check_snapshot_row(cx, &mut txn, id, &rec)?;
            }
            Err(reason) => {
                error!(target: "svfs::fsck", %pos, %reason, "invalid snapshot row");
                failures += 1;
            }
        }
    }

    let subvol_raw = txn.scan(
        cx,
        BtreeId::Subvolumes,
        Bpos::subvolume_row(SUBVOL_MIN),
        Bpos::subvolume_row(SUBVOL_MAX),
        ReadFlags::empty(),
    )?;
    for (pos, bytes) in &subvol_raw {
        match SubvolumeRecord::validate(*pos, bytes) {
            Ok(rec) => match snapshot_lookup(cx, &mut txn, rec.snapshot) {
                Ok(_) => {}
                Err(SvfsError::NotFound(_)) => {
                    error!(
                        target: "svfs::fsck",
                        subvol = pos.offset,
                        snapshot = rec.snapshot,
                        "subvolume points to nonexistent snapshot"
                    );
                    failures += 1;
                }
                Err(err) => return Err(err),
            },
            Err(reason) => {
                error!(target: "svfs::fsck", %pos, %reason, "invalid subvolume row");
                failures += 1;
            }
        }
    }

    if failures != 0 {
        return Err(SvfsError::Inconsistent(format!(
            "{failures} snapshot consistency failures"
        )));
    }
    Ok(())
}
