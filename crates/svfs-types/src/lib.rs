#![forbid(unsafe_code)]
//! Shared identifier and key-position types for svfs.
//!
//! Defines the id newtypes, the B-tree namespace enum, and the `Bpos`
//! key position used by every row in the store.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Lowest valid snapshot node id. Id 0 means "none" wherever a snapshot
/// id field can be absent (parent of a root, empty child slot).
pub const SNAPSHOT_ID_MIN: u32 = 1;
/// Highest valid snapshot node id.
pub const SNAPSHOT_ID_MAX: u32 = u32::MAX - 1;

/// Reserved subvolume id range. Slot 0 is never a subvolume.
pub const SUBVOL_MIN: u32 = 1;
pub const SUBVOL_MAX: u32 = 0x7FFF_FFFF;

/// A snapshot node id: one version of the filesystem tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SnapshotId(pub u32);

/// A subvolume id: a mountable root anchored at one snapshot node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SubvolumeId(pub u32);

/// An inode number (the root directory of a subvolume, for our purposes).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct InodeNumber(pub u64);

impl fmt::Display for SnapshotId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for SubvolumeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for InodeNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Error for id constructors that enforce the reserved ranges.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum IdRangeError {
    #[error("snapshot id {0} outside [{SNAPSHOT_ID_MIN}, {SNAPSHOT_ID_MAX}]")]
    Snapshot(u32),
    #[error("subvolume id {0} outside [{SUBVOL_MIN}, {SUBVOL_MAX}]")]
    Subvolume(u32),
}

impl SnapshotId {
    /// Create a validated snapshot id.
    pub fn new(raw: u32) -> Result<Self, IdRangeError> {
        if (SNAPSHOT_ID_MIN..=SNAPSHOT_ID_MAX).contains(&raw) {
            Ok(Self(raw))
        } else {
            Err(IdRangeError::Snapshot(raw))
        }
    }
}

impl SubvolumeId {
    /// Create a validated subvolume id.
    pub fn new(raw: u32) -> Result<Self, IdRangeError> {
        if (SUBVOL_MIN..=SUBVOL_MAX).contains(&raw) {
            Ok(Self(raw))
        } else {
            Err(IdRangeError::Subvolume(raw))
        }
    }
}

// ── B-tree namespaces ───────────────────────────────────────────────────────

/// The B-trees the snapshot engine touches.
///
/// `Snapshots` and `Subvolumes` hold the engine's own rows; the other four
/// carry snapshot-tagged keys and are swept during reclamation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum BtreeId {
    Snapshots,
    Subvolumes,
    Inodes,
    Dirents,
    Extents,
    Xattrs,
}

impl BtreeId {
    pub const ALL: [Self; 6] = [
        Self::Snapshots,
        Self::Subvolumes,
        Self::Inodes,
        Self::Dirents,
        Self::Extents,
        Self::Xattrs,
    ];

    /// Whether keys in this tree carry a meaningful snapshot component.
    #[must_use]
    pub fn has_snapshots(self) -> bool {
        matches!(
            self,
            Self::Inodes | Self::Dirents | Self::Extents | Self::Xattrs
        )
    }

    /// Dense index for per-tree storage arrays.
    #[must_use]
    pub fn index(self) -> usize {
        match self {
            Self::Snapshots => 0,
            Self::Subvolumes => 1,
            Self::Inodes => 2,
            Self::Dirents => 3,
            Self::Extents => 4,
            Self::Xattrs => 5,
        }
    }
}

impl fmt::Display for BtreeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Snapshots => "snapshots",
            Self::Subvolumes => "subvolumes",
            Self::Inodes => "inodes",
            Self::Dirents => "dirents",
            Self::Extents => "extents",
            Self::Xattrs => "xattrs",
        };
        f.write_str(name)
    }
}

// ── Key positions ───────────────────────────────────────────────────────────

/// A key position: (inode, offset, snapshot), ordered lexicographically.
///
/// The snapshot component is the least significant; two keys that differ
/// only in snapshot are versions of the same logical slot.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
pub struct Bpos {
    pub inode: u64,
    pub offset: u64,
    pub snapshot: u32,
}

/// The smallest key position.
pub const POS_MIN: Bpos = Bpos {
    inode: 0,
    offset: 0,
    snapshot: 0,
};

impl Bpos {
    #[must_use]
    pub fn new(inode: u64, offset: u64, snapshot: u32) -> Self {
        Self {
            inode,
            offset,
            snapshot,
        }
    }

    /// Key position of a snapshot node row.
    #[must_use]
    pub fn snapshot_row(id: u32) -> Self {
        Self::new(0, u64::from(id), 0)
    }

    /// Key position of a subvolume row.
    #[must_use]
    pub fn subvolume_row(id: u32) -> Self {
        Self::new(0, u64::from(id), 0)
    }

    /// Whether two positions name the same logical slot, ignoring the
    /// snapshot component.
    #[must_use]
    pub fn same_slot(self, other: Self) -> bool {
        self.inode == other.inode && self.offset == other.offset
    }

    /// The next position in key order, or `None` at the end of the space.
    #[must_use]
    pub fn successor(self) -> Option<Self> {
        if let Some(snapshot) = self.snapshot.checked_add(1) {
            return Some(Self { snapshot, ..self });
        }
        if let Some(offset) = self.offset.checked_add(1) {
            return Some(Self {
                offset,
                snapshot: 0,
                ..self
            });
        }
        self.inode.checked_add(1).map(|inode| Self {
            inode,
            offset: 0,
            snapshot: 0,
        })
    }
}

impl fmt::Display for Bpos {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.inode, self.offset, self.snapshot)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bpos_orders_inode_offset_snapshot() {
        let a = Bpos::new(1, 0, 9);
        let b = Bpos::new(1, 1, 0);
        let c = Bpos::new(2, 0, 0);
        assert!(a < b);
        assert!(b < c);
        assert!(POS_MIN < a);
    }

    #[test]
    fn bpos_successor_carries() {
        let p = Bpos::new(3, 7, u32::MAX);
        assert_eq!(p.successor(), Some(Bpos::new(3, 8, 0)));

        let q = Bpos::new(3, u64::MAX, u32::MAX);
        assert_eq!(q.successor(), Some(Bpos::new(4, 0, 0)));

        let end = Bpos::new(u64::MAX, u64::MAX, u32::MAX);
        assert_eq!(end.successor(), None);
    }

    #[test]
    fn same_slot_ignores_snapshot() {
        let a = Bpos::new(5, 10, 1);
        let b = Bpos::new(5, 10, 99);
        let c = Bpos::new(5, 11, 1);
        assert!(a.same_slot(b));
        assert!(!a.same_slot(c));
    }

    #[test]
    fn only_leaf_trees_carry_snapshots() {
        assert!(!BtreeId::Snapshots.has_snapshots());
        assert!(!BtreeId::Subvolumes.has_snapshots());
        assert!(BtreeId::Inodes.has_snapshots());
        assert!(BtreeId::Dirents.has_snapshots());
        assert!(BtreeId::Extents.has_snapshots());
        assert!(BtreeId::Xattrs.has_snapshots());
    }

    #[test]
    fn id_range_constructors() {
        assert!(SnapshotId::new(0).is_err());
        assert!(SnapshotId::new(u32::MAX).is_err());
        assert!(SnapshotId::new(1).is_ok());
        assert!(SubvolumeId::new(SUBVOL_MAX + 1).is_err());
        assert!(SubvolumeId::new(SUBVOL_MIN).is_ok());
    }
}
