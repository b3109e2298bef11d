#![forbid(unsafe_code)]
//! On-disk row codec and validator for snapshot and subvolume rows.
//!
//! All multi-byte integers are little-endian. Decoding is strict: a row
//! either matches the fixed record layout exactly or is rejected with a
//! reason. Structural validation (id ordering, child normalization) is a
//! separate pass so the consistency checker can report a precise cause.

use serde::{Deserialize, Serialize};
use std::fmt;
use svfs_types::{Bpos, SNAPSHOT_ID_MAX, SNAPSHOT_ID_MIN, SUBVOL_MAX, SUBVOL_MIN};
use thiserror::Error;

/// Fixed encoded size of a snapshot node row.
pub const SNAPSHOT_RECORD_BYTES: usize = 24;
/// Fixed encoded size of a subvolume row.
pub const SUBVOLUME_RECORD_BYTES: usize = 16;

/// Snapshot row flag: a subvolume row points at this node.
pub const SNAPSHOT_FLAG_IS_SUBVOL: u32 = 1 << 0;
/// Snapshot row flag: reclamation pending.
pub const SNAPSHOT_FLAG_DELETED: u32 = 1 << 1;

const SNAPSHOT_FLAGS_KNOWN: u32 = SNAPSHOT_FLAG_IS_SUBVOL | SNAPSHOT_FLAG_DELETED;

/// Subvolume row flag: mounted read-only.
pub const SUBVOLUME_FLAG_READ_ONLY: u32 = 1 << 0;
/// Subvolume row flag: created by a snapshot operation, not as a fresh root.
pub const SUBVOLUME_FLAG_IS_SNAPSHOT: u32 = 1 << 1;

const SUBVOLUME_FLAGS_KNOWN: u32 = SUBVOLUME_FLAG_READ_ONLY | SUBVOLUME_FLAG_IS_SNAPSHOT;

/// Reason a row failed structural validation or decoding.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum InvalidRecord {
    #[error("bad pos")]
    BadPos,
    #[error("bad val size")]
    BadValSize,
    #[error("bad parent node")]
    BadParentNode,
    #[error("children not normalized")]
    ChildrenNotNormalized,
    #[error("duplicate child nodes")]
    DuplicateChildNodes,
    #[error("bad child node")]
    BadChildNode,
    #[error("reserved bits set")]
    ReservedBitsSet,
    #[error("invalid pos")]
    InvalidPos,
}

fn read_u32(data: &[u8], off: usize) -> u32 {
    let mut raw = [0_u8; 4];
    raw.copy_from_slice(&data[off..off + 4]);
    u32::from_le_bytes(raw)
}

fn read_u64(data: &[u8], off: usize) -> u64 {
    let mut raw = [0_u8; 8];
    raw.copy_from_slice(&data[off..off + 8]);
    u64::from_le_bytes(raw)
}

// ── Snapshot rows ───────────────────────────────────────────────────────────

/// A snapshot node row: one version of the filesystem tree.
///
/// `children` is kept normalized (`children[0] >= children[1]`); 0 denotes
/// an empty slot. `subvol` is meaningful only while `IS_SUBVOL` is set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SnapshotRecord {
    pub flags: u32,
    pub parent: u32,
    pub children: [u32; 2],
    pub subvol: u32,
    pub pad: u32,
}

impl SnapshotRecord {
    #[must_use]
    pub fn is_subvol(&self) -> bool {
        self.flags & SNAPSHOT_FLAG_IS_SUBVOL != 0
    }

    #[must_use]
    pub fn deleted(&self) -> bool {
        self.flags & SNAPSHOT_FLAG_DELETED != 0
    }

    pub fn set_is_subvol(&mut self, value: bool) {
        if value {
            self.flags |= SNAPSHOT_FLAG_IS_SUBVOL;
        } else {
            self.flags &= !SNAPSHOT_FLAG_IS_SUBVOL;
        }
    }

    pub fn set_deleted(&mut self, value: bool) {
        if value {
            self.flags |= SNAPSHOT_FLAG_DELETED;
        } else {
            self.flags &= !SNAPSHOT_FLAG_DELETED;
        }
    }

    /// Restore `children[0] >= children[1]` after clearing a slot.
    pub fn normalize_children(&mut self) {
        if self.children[0] < self.children[1] {
            self.children.swap(0, 1);
        }
    }

    #[must_use]
    pub fn encode(&self) -> [u8; SNAPSHOT_RECORD_BYTES] {
        let mut out = [0_u8; SNAPSHOT_RECORD_BYTES];
        out[0..4].copy_from_slice(&self.flags.to_le_bytes());
        out[4..8].copy_from_slice(&self.parent.to_le_bytes());
        out[8..12].copy_from_slice(&self.children[0].to_le_bytes());
        out[12..16].copy_from_slice(&self.children[1].to_le_bytes());
        out[16..20].copy_from_slice(&self.subvol.to_le_bytes());
        out[20..24].copy_from_slice(&self.pad.to_le_bytes());
        out
    }

    pub fn decode(data: &[u8]) -> Result<Self, InvalidRecord> {
        if data.len() != SNAPSHOT_RECORD_BYTES {
            return Err(InvalidRecord::BadValSize);
        }
        Ok(Self {
            flags: read_u32(data, 0),
            parent: read_u32(data, 4),
            children: [read_u32(data, 8), read_u32(data, 12)],
            subvol: read_u32(data, 16),
            pad: read_u32(data, 20),
        })
    }

    /// Structural validation of an encoded snapshot row at key `pos`.
    ///
    /// The snapshot tree grows toward larger ids: a parent precedes its
    /// children, so `parent < own_id` and each child id exceeds `own_id`.
    pub fn validate(pos: Bpos, data: &[u8]) -> Result<Self, InvalidRecord> {
        if pos.inode != 0
            || pos.snapshot != 0
            || pos.offset < u64::from(SNAPSHOT_ID_MIN)
            || pos.offset > u64::from(SNAPSHOT_ID_MAX)
        {
            return Err(InvalidRecord::BadPos);
        }
        let own_id = u32::try_from(pos.offset).map_err(|_| InvalidRecord::BadPos)?;

        let rec = Self::decode(data)?;

        if rec.flags & !SNAPSHOT_FLAGS_KNOWN != 0 || rec.pad != 0 {
            return Err(InvalidRecord::ReservedBitsSet);
        }
        if rec.parent != 0 && rec.parent >= own_id {
            return Err(InvalidRecord::BadParentNode);
        }
        if rec.children[0] < rec.children[1] {
            return Err(InvalidRecord::ChildrenNotNormalized);
        }
        if rec.children[0] != 0 && rec.children[0] == rec.children[1] {
            return Err(InvalidRecord::DuplicateChildNodes);
        }
        for child in rec.children {
            if child != 0 && child <= own_id {
                return Err(InvalidRecord::BadChildNode);
            }
        }
        Ok(rec)
    }
}

impl fmt::Display for SnapshotRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "is_subvol {} deleted {} parent {} children {} {} subvol {}",
            u32::from(self.is_subvol()),
            u32::from(self.deleted()),
            self.parent,
            self.children[0],
            self.children[1],
            self.subvol
        )
    }
}

// ── Subvolume rows ──────────────────────────────────────────────────────────

/// A subvolume row: a mountable root tied to one snapshot node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SubvolumeRecord {
    pub flags: u32,
    pub snapshot: u32,
    pub inode: u64,
}

impl SubvolumeRecord {
    #[must_use]
    pub fn read_only(&self) -> bool {
        self.flags & SUBVOLUME_FLAG_READ_ONLY != 0
    }

    #[must_use]
    pub fn is_snapshot(&self) -> bool {
        self.flags & SUBVOLUME_FLAG_IS_SNAPSHOT != 0
    }

    pub fn set_read_only(&mut self, value: bool) {
        if value {
            self.flags |= SUBVOLUME_FLAG_READ_ONLY;
        } else {
            self.flags &= !SUBVOLUME_FLAG_READ_ONLY;
        }
    }

    pub fn set_is_snapshot(&mut self, value: bool) {
        if value {
            self.flags |= SUBVOLUME_FLAG_IS_SNAPSHOT;
        } else {
            self.flags &= !SUBVOLUME_FLAG_IS_SNAPSHOT;
        }
    }

    #[must_use]
    pub fn encode(&self) -> [u8; SUBVOLUME_RECORD_BYTES] {
        let mut out = [0_u8; SUBVOLUME_RECORD_BYTES];
        out[0..4].copy_from_slice(&self.flags.to_le_bytes());
        out[4..8].copy_from_slice(&self.snapshot.to_le_bytes());
        out[8..16].copy_from_slice(&self.inode.to_le_bytes());
        out
    }

    pub fn decode(data: &[u8]) -> Result<Self, InvalidRecord> {
        if data.len() != SUBVOLUME_RECORD_BYTES {
            return Err(InvalidRecord::BadValSize);
        }
        Ok(Self {
            flags: read_u32(data, 0),
            snapshot: read_u32(data, 4),
            inode: read_u64(data, 8),
        })
    }

    /// Structural validation of an encoded subvolume row at key `pos`.
    pub fn validate(pos: Bpos, data: &[u8]) -> Result<Self, InvalidRecord> {
        if pos.inode != 0
            || pos.snapshot != 0
            || pos.offset < u64::from(SUBVOL_MIN)
            || pos.offset > u64::from(SUBVOL_MAX)
        {
            return Err(InvalidRecord::InvalidPos);
        }
        let rec = Self::decode(data)?;
        if rec.flags & !SUBVOLUME_FLAGS_KNOWN != 0 {
            return Err(InvalidRecord::ReservedBitsSet);
        }
        Ok(rec)
    }
}

impl fmt::Display for SubvolumeRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "root {} snapshot id {}", self.inode, self.snapshot)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn snap_pos(id: u32) -> Bpos {
        Bpos::snapshot_row(id)
    }

    #[test]
    fn snapshot_round_trip() {
        let rec = SnapshotRecord {
            flags: SNAPSHOT_FLAG_IS_SUBVOL,
            parent: 3,
            children: [9, 7],
            subvol: 12,
            pad: 0,
        };
        let bytes = rec.encode();
        assert_eq!(bytes.len(), SNAPSHOT_RECORD_BYTES);
        assert_eq!(SnapshotRecord::decode(&bytes).unwrap(), rec);
    }

    #[test]
    fn subvolume_round_trip() {
        let rec = SubvolumeRecord {
            flags: SUBVOLUME_FLAG_READ_ONLY | SUBVOLUME_FLAG_IS_SNAPSHOT,
            snapshot: 42,
            inode: 0xDEAD_BEEF,
        };
        assert_eq!(SubvolumeRecord::decode(&rec.encode()).unwrap(), rec);
    }

    #[test]
    fn snapshot_wire_layout_is_little_endian() {
        let rec = SnapshotRecord {
            flags: SNAPSHOT_FLAG_DELETED,
            parent: 0x0102_0304,
            children: [0x0A0B_0C0D, 0],
            subvol: 1,
            pad: 0,
        };
        let bytes = rec.encode();
        assert_eq!(&bytes[0..4], &[2, 0, 0, 0]);
        assert_eq!(&bytes[4..8], &[0x04, 0x03, 0x02, 0x01]);
        assert_eq!(&bytes[8..12], &[0x0D, 0x0C, 0x0B, 0x0A]);
    }

    #[test]
    fn snapshot_validate_rejects_bad_pos() {
        let rec = SnapshotRecord::default();
        let bytes = rec.encode();
        assert_eq!(
            SnapshotRecord::validate(snap_pos(0), &bytes),
            Err(InvalidRecord::BadPos)
        );
        assert_eq!(
            SnapshotRecord::validate(Bpos::new(0, u64::from(u32::MAX), 0), &bytes),
            Err(InvalidRecord::BadPos)
        );
        assert_eq!(
            SnapshotRecord::validate(Bpos::new(7, 5, 0), &bytes),
            Err(InvalidRecord::BadPos)
        );
    }

    #[test]
    fn snapshot_validate_rejects_bad_val_size() {
        assert_eq!(
            SnapshotRecord::validate(snap_pos(5), &[0_u8; 23]),
            Err(InvalidRecord::BadValSize)
        );
    }

    #[test]
    fn snapshot_validate_rejects_parent_not_below_own_id() {
        let rec = SnapshotRecord {
            parent: 5,
            ..SnapshotRecord::default()
        };
        assert_eq!(
            SnapshotRecord::validate(snap_pos(5), &rec.encode()),
            Err(InvalidRecord::BadParentNode)
        );
        assert_eq!(
            SnapshotRecord::validate(snap_pos(4), &rec.encode()),
            Err(InvalidRecord::BadParentNode)
        );
        assert!(SnapshotRecord::validate(snap_pos(6), &rec.encode()).is_ok());
    }

    #[test]
    fn snapshot_validate_rejects_unnormalized_children() {
        let rec = SnapshotRecord {
            children: [7, 9],
            ..SnapshotRecord::default()
        };
        assert_eq!(
            SnapshotRecord::validate(snap_pos(5), &rec.encode()),
            Err(InvalidRecord::ChildrenNotNormalized)
        );
    }

    #[test]
    fn snapshot_validate_rejects_duplicate_children() {
        let rec = SnapshotRecord {
            children: [9, 9],
            ..SnapshotRecord::default()
        };
        assert_eq!(
            SnapshotRecord::validate(snap_pos(5), &rec.encode()),
            Err(InvalidRecord::DuplicateChildNodes)
        );
    }

    #[test]
    fn snapshot_validate_rejects_child_not_above_own_id() {
        let rec = SnapshotRecord {
            children: [5, 0],
            ..SnapshotRecord::default()
        };
        assert_eq!(
            SnapshotRecord::validate(snap_pos(5), &rec.encode()),
            Err(InvalidRecord::BadChildNode)
        );
        let rec = SnapshotRecord {
            children: [4, 0],
            ..SnapshotRecord::default()
        };
        assert_eq!(
            SnapshotRecord::validate(snap_pos(5), &rec.encode()),
            Err(InvalidRecord::BadChildNode)
        );
    }

    #[test]
    fn snapshot_validate_rejects_reserved_bits() {
        let rec = SnapshotRecord {
            flags: 1 << 5,
            ..SnapshotRecord::default()
        };
        assert_eq!(
            SnapshotRecord::validate(snap_pos(5), &rec.encode()),
            Err(InvalidRecord::ReservedBitsSet)
        );
        let rec = SnapshotRecord {
            pad: 1,
            ..SnapshotRecord::default()
        };
        assert_eq!(
            SnapshotRecord::validate(snap_pos(5), &rec.encode()),
            Err(InvalidRecord::ReservedBitsSet)
        );
    }

    #[test]
    fn subvolume_validate_rejects_out_of_range_pos() {
        let bytes = SubvolumeRecord::default().encode();
        assert_eq!(
            SubvolumeRecord::validate(Bpos::subvolume_row(0), &bytes),
            Err(InvalidRecord::InvalidPos)
        );
        assert_eq!(
            SubvolumeRecord::validate(Bpos::new(0, u64::from(SUBVOL_MAX) + 1, 0), &bytes),
            Err(InvalidRecord::InvalidPos)
        );
        assert!(SubvolumeRecord::validate(Bpos::subvolume_row(SUBVOL_MIN), &bytes).is_ok());
    }

    #[test]
    fn display_matches_debug_tooling_format() {
        let snap = SnapshotRecord {
            flags: SNAPSHOT_FLAG_IS_SUBVOL | SNAPSHOT_FLAG_DELETED,
            parent: 2,
            children: [9, 4],
            subvol: 11,
            pad: 0,
        };
        assert_eq!(
            snap.to_string(),
            "is_subvol 1 deleted 1 parent 2 children 9 4 subvol 11"
        );

        let subvol = SubvolumeRecord {
            flags: 0,
            snapshot: 8,
            inode: 256,
        };
        assert_eq!(subvol.to_string(), "root 256 snapshot id 8");
    }

    #[test]
    fn records_survive_json_fixtures() {
        let rec = SnapshotRecord {
            flags: SNAPSHOT_FLAG_IS_SUBVOL,
            parent: 1,
            children: [3, 2],
            subvol: 7,
            pad: 0,
        };
        let json = serde_json::to_string(&rec).unwrap();
        let back: SnapshotRecord = serde_json::from_str(&json).unwrap();
        assert_eq!(back, rec);
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(64))]

        #[test]
        fn snapshot_decode_never_panics(data in proptest::collection::vec(any::<u8>(), 0..64)) {
            let _ = SnapshotRecord::decode(&data);
        }

        #[test]
        fn snapshot_validate_never_panics(
            id in any::<u32>(),
            data in proptest::collection::vec(any::<u8>(), 0..64),
        ) {
            let _ = SnapshotRecord::validate(Bpos::snapshot_row(id), &data);
        }

        #[test]
        fn snapshot_encode_decode_round_trips(
            flags in 0_u32..4,
            parent in any::<u32>(),
            c0 in any::<u32>(),
            c1 in any::<u32>(),
            subvol in any::<u32>(),
        ) {
            let rec = SnapshotRecord { flags, parent, children: [c0, c1], subvol, pad: 0 };
            prop_assert_eq!(SnapshotRecord::decode(&rec.encode()).unwrap(), rec);
        }

        #[test]
        fn subvolume_encode_decode_round_trips(
            flags in 0_u32..4,
            snapshot in any::<u32>(),
            inode in any::<u64>(),
        ) {
            let rec = SubvolumeRecord { flags, snapshot, inode };
            prop_assert_eq!(SubvolumeRecord::decode(&rec.encode()).unwrap(), rec);
        }
    }
}
