//! In-core snapshot table: the equivalence cache.
//!
//! A sparse map from snapshot id to its decoded row fields plus the
//! equivalence representative. The table is authoritative only for the
//! current in-memory image; B-tree rows are the source of truth. It is
//! rebuilt at mount and updated synchronously inside the same transaction
//! body as every snapshot-row write.

use parking_lot::RwLock;
use std::collections::HashMap;
use svfs_error::{Result, SvfsError};
use svfs_ondisk::SnapshotRecord;

/// Per-snapshot in-core state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SnapshotSlot {
    pub parent: u32,
    pub children: [u32; 2],
    /// Owning subvolume, or 0 when the row's `IS_SUBVOL` flag is clear.
    pub subvol: u32,
    /// Canonical representative: chains of single-live-child collapses
    /// map to the same id.
    pub equiv: u32,
}

/// The equivalence cache. Single-writer (serialized by the transaction
/// machinery), multi-reader.
#[derive(Debug, Default)]
pub struct SnapshotTable {
    slots: RwLock<HashMap<u32, SnapshotSlot>>,
}

impl SnapshotTable {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Ensure a slot exists for `id`.
    pub fn touch(&self, id: u32) -> Result<()> {
        let mut slots = self.slots.write();
        if !slots.contains_key(&id) {
            slots
                .try_reserve(1)
                .map_err(|_| SvfsError::OutOfMemory)?;
            slots.insert(
                id,
                SnapshotSlot {
                    equiv: id,
                    ..SnapshotSlot::default()
                },
            );
        }
        Ok(())
    }

    /// Mirror a snapshot row write into the in-core image.
    pub fn update_from_row(&self, id: u32, rec: &SnapshotRecord) -> Result<()> {
        self.touch(id)?;
        let mut slots = self.slots.write();
        if let Some(slot) = slots.get_mut(&id) {
            slot.parent = rec.parent;
            slot.children = rec.children;
            slot.subvol = if rec.is_subvol() { rec.subvol } else { 0 };
        }
        Ok(())
    }

    /// Drop the slot for a physically deleted snapshot row.
    pub fn remove(&self, id: u32) {
        self.slots.write().remove(&id);
    }

    #[must_use]
    pub fn get(&self, id: u32) -> Option<SnapshotSlot> {
        self.slots.read().get(&id).copied()
    }

    /// Equivalence representative for `id`; an unknown id represents
    /// itself.
    #[must_use]
    pub fn equiv(&self, id: u32) -> u32 {
        self.slots.read().get(&id).map_or(id, |slot| slot.equiv)
    }

    pub fn set_equiv(&self, id: u32, equiv: u32) {
        if let Some(slot) = self.slots.write().get_mut(&id) {
            slot.equiv = equiv;
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.slots.read().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.slots.read().is_empty()
    }

    /// Free the in-core image (unmount).
    pub fn clear(&self) {
        self.slots.write().clear();
    }

    /// Recompute every slot's equivalence representative from a full scan
    /// of the snapshot rows (ascending id order, as stored).
    ///
    /// A node with exactly one live child inherits that child's
    /// representative; anything else represents itself. Children carry
    /// larger ids than their parents, so the walk runs from the top of
    /// the id space down: a child's representative is final before any
    /// parent reads it, and whole single-child chains collapse in one
    /// pass.
    pub fn recompute_equiv(&self, rows: &[(u32, SnapshotRecord)]) -> Result<()> {
        let mut live: HashMap<u32, bool> = HashMap::new();
        live.try_reserve(rows.len())
            .map_err(|_| SvfsError::OutOfMemory)?;
        for (id, rec) in rows {
            live.insert(*id, !rec.deleted());
        }

        for (id, rec) in rows.iter().rev() {
            let mut nr_live = 0_u32;
            let mut live_child = 0_u32;
            for child in rec.children {
                if child != 0 && live.get(&child).copied().unwrap_or(false) {
                    nr_live += 1;
                    live_child = child;
                }
            }
            self.touch(*id)?;
            let equiv = if nr_live == 1 {
                self.equiv(live_child)
            } else {
                *id
            };
            self.set_equiv(*id, equiv);
        }
        Ok(())
    }
}
