// Copyright © 2025 Lukas Bower
// SPDX-License-Identifier: Apache-2.0
// Purpose: CSpace slot allocation with scoped rollback guards.
// Author: Lukas Bower

//! Slot allocation within the server's capability space.
//!
//! Slots are the one scarce, shared resource every broker operation draws
//! on. [`SlotGuard`] owns a freshly allocated slot and returns it to the
//! allocator when dropped unless the caller commits it.

use alloc::collections::BTreeSet;
use core::ops::Range;

use log::{debug, error, trace};

use crate::error::ProcservError;
use crate::kernel::{CPtr, Capability};

/// Index of one slot in the server's root CNode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct Slot(CPtr);

impl Slot {
    /// Wraps a raw slot index.
    #[inline]
    #[must_use]
    pub const fn new(index: CPtr) -> Self {
        Self(index)
    }

    /// Returns the raw slot index.
    #[inline]
    #[must_use]
    pub const fn index(self) -> CPtr {
        self.0
    }

    /// Names the capability installed in this slot of a single-level CSpace.
    #[inline]
    #[must_use]
    pub const fn cap(self) -> Capability {
        Capability::new(self.0)
    }
}

impl From<Capability> for Slot {
    fn from(cap: Capability) -> Self {
        Self(cap.cptr())
    }
}

/// Fully resolved address of a slot: root CNode, index and guard depth.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CSpacePath {
    /// Root CNode capability the index is resolved against.
    pub root: CPtr,
    /// Slot index within the root CNode.
    pub index: CPtr,
    /// Number of bits resolved when walking the index.
    pub depth: u8,
}

impl CSpacePath {
    /// Builds a path from its parts.
    #[must_use]
    pub const fn new(root: CPtr, index: CPtr, depth: u8) -> Self {
        Self { root, index, depth }
    }

    /// Returns the capability named by this path.
    #[must_use]
    pub const fn cap(&self) -> Capability {
        Capability::new(self.index)
    }
}

/// Allocator of slots in the server's capability space.
pub trait SlotAllocator {
    /// Reserves one free slot, failing once the CSpace is exhausted.
    fn alloc_slot(&mut self) -> Result<Slot, ProcservError>;

    /// Returns a previously allocated slot to the pool.
    ///
    /// Must be called exactly once per allocated slot that was not committed.
    fn free_slot(&mut self, slot: Slot);

    /// Root CNode capability backing allocations.
    fn root(&self) -> CPtr;

    /// Guard depth of the root CNode in bits.
    fn depth(&self) -> u8;

    /// Number of slots that can still be handed out.
    fn free_count(&self) -> usize;

    /// Resolves `slot` to a full CSpace path.
    fn path(&self, slot: Slot) -> CSpacePath {
        CSpacePath::new(self.root(), slot.index(), self.depth())
    }

    /// Resolves the slot holding `cap` to a full CSpace path.
    fn path_of(&self, cap: Capability) -> CSpacePath {
        self.path(Slot::from(cap))
    }
}

/// Bump allocator over the bootinfo empty-slot region with slot recycling.
///
/// Freed slots are handed out again before the bump cursor advances.
/// Releasing a slot that is outside the handed-out range or already free is
/// reported and ignored so the free list never holds duplicates.
pub struct SlotPool {
    root: CPtr,
    depth: u8,
    start: CPtr,
    next: CPtr,
    end: CPtr,
    recycled: BTreeSet<CPtr>,
}

impl SlotPool {
    /// Creates a pool spanning `region` of the root CNode `root`.
    #[must_use]
    pub fn new(root: CPtr, region: Range<CPtr>, depth: u8) -> Self {
        let capacity = 1usize.checked_shl(u32::from(depth)).unwrap_or(usize::MAX);
        debug_assert!(
            region.end <= capacity,
            "empty slot region exceeds root cnode capacity",
        );
        debug_assert!(region.start <= region.end, "empty slot region is inverted");
        Self {
            root,
            depth,
            start: region.start,
            next: region.start,
            end: region.end,
            recycled: BTreeSet::new(),
        }
    }

    /// Returns the total capacity of the pool in slots.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.end - self.start
    }

    /// Returns the number of slots currently held by callers.
    #[must_use]
    pub fn used(&self) -> usize {
        self.capacity() - self.remaining()
    }

    /// Returns the number of slots that can still be allocated.
    #[must_use]
    pub fn remaining(&self) -> usize {
        (self.end - self.next) + self.recycled.len()
    }

    /// Bump-allocates `count` consecutive slots, bypassing recycled ones.
    ///
    /// Used at boot to lay out capability runs that are addressed by offset.
    pub fn alloc_run(&mut self, count: usize) -> Result<Range<CPtr>, ProcservError> {
        let start = self.next;
        let end = start
            .checked_add(count)
            .filter(|&end| end <= self.end)
            .ok_or(ProcservError::OutOfCapabilitySpace)?;
        self.next = end;
        trace!("[cspace] alloc run=[0x{start:04x}..0x{end:04x})");
        Ok(start..end)
    }

    /// Reports whether `slot` is currently held by a caller.
    #[must_use]
    pub fn is_allocated(&self, slot: Slot) -> bool {
        let index = slot.index();
        index >= self.start && index < self.next && !self.recycled.contains(&index)
    }
}

impl SlotAllocator for SlotPool {
    fn alloc_slot(&mut self) -> Result<Slot, ProcservError> {
        if let Some(index) = self.recycled.pop_first() {
            trace!("[cspace] reuse slot=0x{index:04x}");
            return Ok(Slot::new(index));
        }
        if self.next >= self.end {
            debug!(
                "[cspace] exhausted capacity={} region=[0x{:04x}..0x{:04x})",
                self.capacity(),
                self.start,
                self.end
            );
            return Err(ProcservError::OutOfCapabilitySpace);
        }
        let index = self.next;
        self.next += 1;
        trace!("[cspace] alloc slot=0x{index:04x}");
        Ok(Slot::new(index))
    }

    fn free_slot(&mut self, slot: Slot) {
        if !self.is_allocated(slot) {
            error!(
                "[cspace] refusing to free slot=0x{:04x}: not allocated",
                slot.index()
            );
            return;
        }
        trace!("[cspace] free slot=0x{:04x}", slot.index());
        self.recycled.insert(slot.index());
    }

    fn root(&self) -> CPtr {
        self.root
    }

    fn depth(&self) -> u8 {
        self.depth
    }

    fn free_count(&self) -> usize {
        self.remaining()
    }
}

/// Scoped ownership of one freshly allocated slot.
///
/// Dropping the guard frees the slot. [`SlotGuard::commit`] hands the slot
/// to the caller instead, once a capability has been installed in it and
/// ownership has moved into a cache or a reply.
pub struct SlotGuard<'a, A: SlotAllocator + ?Sized> {
    allocator: &'a mut A,
    slot: Slot,
    path: CSpacePath,
    armed: bool,
}

impl<'a, A: SlotAllocator + ?Sized> SlotGuard<'a, A> {
    /// Allocates a slot from `allocator` under guard.
    pub fn new(allocator: &'a mut A) -> Result<Self, ProcservError> {
        let slot = allocator.alloc_slot()?;
        let path = allocator.path(slot);
        Ok(Self {
            allocator,
            slot,
            path,
            armed: true,
        })
    }

    /// Returns the guarded slot.
    #[must_use]
    pub fn slot(&self) -> Slot {
        self.slot
    }

    /// Returns the full path of the guarded slot.
    #[must_use]
    pub fn path(&self) -> &CSpacePath {
        &self.path
    }

    /// Resolves another capability against the same allocator.
    #[must_use]
    pub fn path_of(&self, cap: Capability) -> CSpacePath {
        self.allocator.path_of(cap)
    }

    /// Keeps the slot allocated and returns it to the caller.
    #[must_use = "a committed slot leaks unless it is stored or returned"]
    pub fn commit(mut self) -> Slot {
        self.armed = false;
        self.slot
    }
}

impl<A: SlotAllocator + ?Sized> Drop for SlotGuard<'_, A> {
    fn drop(&mut self) {
        if self.armed {
            debug!("[cspace] rollback slot=0x{:04x}", self.slot.index());
            self.allocator.free_slot(self.slot);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ROOT: CPtr = 2;

    #[test]
    fn pool_hands_out_region_then_exhausts() {
        let mut pool = SlotPool::new(ROOT, 64..68, 8);
        for expected in 64..68 {
            assert_eq!(pool.alloc_slot(), Ok(Slot::new(expected)));
        }
        assert_eq!(pool.alloc_slot(), Err(ProcservError::OutOfCapabilitySpace));
        assert_eq!(pool.free_count(), 0);
    }

    #[test]
    fn freed_slots_are_reused_before_the_cursor_moves() {
        let mut pool = SlotPool::new(ROOT, 10..20, 8);
        let first = pool.alloc_slot().unwrap();
        let _second = pool.alloc_slot().unwrap();
        pool.free_slot(first);
        assert_eq!(pool.alloc_slot(), Ok(first));
        assert_eq!(pool.used(), 2);
    }

    #[test]
    fn double_free_is_ignored() {
        let mut pool = SlotPool::new(ROOT, 10..20, 8);
        let slot = pool.alloc_slot().unwrap();
        pool.free_slot(slot);
        let before = pool.free_count();
        pool.free_slot(slot);
        assert_eq!(pool.free_count(), before);
        pool.free_slot(Slot::new(99));
        assert_eq!(pool.free_count(), before);
    }

    #[test]
    fn runs_are_contiguous_and_bounded() {
        let mut pool = SlotPool::new(ROOT, 10..20, 8);
        let recycled = pool.alloc_slot().unwrap();
        pool.free_slot(recycled);
        assert_eq!(pool.alloc_run(4), Ok(11..15));
        assert_eq!(pool.alloc_run(6), Err(ProcservError::OutOfCapabilitySpace));
        assert_eq!(pool.free_count(), 6);
        assert_eq!(pool.alloc_slot(), Ok(recycled));
    }

    #[test]
    fn guard_rolls_back_unless_committed() {
        let mut pool = SlotPool::new(ROOT, 10..12, 8);
        {
            let guard = SlotGuard::new(&mut pool).unwrap();
            assert_eq!(guard.path(), &CSpacePath::new(ROOT, 10, 8));
        }
        assert_eq!(pool.free_count(), 2);

        let slot = SlotGuard::new(&mut pool).unwrap().commit();
        assert!(pool.is_allocated(slot));
        assert_eq!(pool.free_count(), 1);
    }
}
