// Copyright © 2025 Lukas Bower
// SPDX-License-Identifier: Apache-2.0
// Purpose: Resolve physical device regions to frame capabilities.
// Author: Lukas Bower

//! Device frame capabilities looked up through platform introspection.
//!
//! Every successful resolution produces a fresh capability in a new slot;
//! repeated lookups of the same frame are not deduplicated.

use heapless::Vec;
use log::{debug, error};

use crate::cspace::{CSpacePath, SlotAllocator, SlotGuard};
use crate::error::ProcservError;
use crate::kernel::{CapRights, Capability, Kernel};

/// Largest supported device region width in bits.
pub const MAX_DEVICE_SIZE_BITS: u8 = 31;

/// Maximum number of device regions a [`DeviceCatalog`] can describe.
pub const MAX_DEVICE_REGIONS: usize = 64;

/// Returns `k` such that `2^k == size`, rejecting unsupported sizes.
pub fn size_bits_for(size: usize) -> Result<u8, ProcservError> {
    if !size.is_power_of_two() {
        return Err(ProcservError::InvalidSize(size));
    }
    let bits = size.trailing_zeros();
    if bits > u32::from(MAX_DEVICE_SIZE_BITS) {
        return Err(ProcservError::InvalidSize(size));
    }
    // Bounded by MAX_DEVICE_SIZE_BITS above.
    Ok(bits as u8)
}

/// Platform introspection service mapping physical ranges to frame capabilities.
pub trait Platform {
    /// Installs a capability for `[paddr, paddr + 2^size_bits)` into `dst`.
    fn frame_cap<K: Kernel + ?Sized>(
        &mut self,
        kernel: &mut K,
        paddr: usize,
        size_bits: u8,
        dst: &CSpacePath,
    ) -> Result<(), ProcservError>;

    /// Reports which known region covers the range, without allocating.
    fn device_coverage(&self, _paddr: usize, _size_bits: u8) -> Option<DeviceCoverage> {
        None
    }

    /// Reports whether `cap` is one of the platform's own capabilities.
    fn owns(&self, _cap: Capability) -> bool {
        false
    }
}

/// A device region exported to the server at boot as a run of frames.
///
/// The region is cut into `2^(size_bits - frame_bits)` frames of
/// `2^frame_bits` bytes each, whose capabilities occupy consecutive slots
/// starting at `first_frame`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceRegion {
    /// Physical base address of the region.
    pub paddr: usize,
    /// Size of the region in bits.
    pub size_bits: u8,
    /// Size of each exported frame in bits.
    pub frame_bits: u8,
    /// Capability to the lowest frame of the region.
    pub first_frame: Capability,
}

impl DeviceRegion {
    /// Exclusive upper bound of the region.
    #[must_use]
    pub fn limit(&self) -> usize {
        self.paddr.saturating_add(1usize << self.size_bits)
    }

    /// Number of frames the region is exported as.
    #[must_use]
    pub fn frame_count(&self) -> usize {
        1usize << self.size_bits.saturating_sub(self.frame_bits)
    }

    /// Reports whether `cap` names one of the region's frames.
    #[must_use]
    pub fn holds(&self, cap: Capability) -> bool {
        let first = self.first_frame.cptr();
        cap.cptr() >= first && cap.cptr() - first < self.frame_count()
    }

    fn covers(&self, paddr: usize, size_bits: u8) -> bool {
        let end = paddr.saturating_add(1usize << size_bits);
        self.paddr <= paddr && end <= self.limit()
    }

    /// Returns the frame backing exactly `[paddr, paddr + 2^size_bits)`.
    fn frame_at(&self, paddr: usize, size_bits: u8) -> Option<Capability> {
        if size_bits != self.frame_bits || !self.covers(paddr, size_bits) {
            return None;
        }
        let offset = paddr - self.paddr;
        if offset & ((1usize << self.frame_bits) - 1) != 0 {
            return None;
        }
        Some(Capability::new(self.first_frame.cptr() + (offset >> self.frame_bits)))
    }
}

/// Diagnostic view describing the device region that covers a physical range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceCoverage {
    /// Physical base address of the covering region.
    pub base: usize,
    /// Exclusive upper bound of the covering region.
    pub limit: usize,
    /// Size of the covering region in bits.
    pub size_bits: u8,
    /// Size of the frames the region is exported as.
    pub frame_bits: u8,
    /// Index of the region within the catalog.
    pub index: usize,
    /// Number of capabilities resolved from the region so far.
    pub lookups: u32,
}

/// Summary of catalog utilisation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DeviceStats {
    /// Regions described by the catalog.
    pub regions: usize,
    /// Successful resolutions across all regions.
    pub lookups: u32,
}

/// Catalog of boot-exported device frame capabilities.
///
/// A lookup succeeds for any frame-aligned range of one frame's width that
/// lies inside a region; the kernel then copies that frame's capability
/// into the destination slot. The catalog keeps the originals.
#[derive(Debug, Default)]
pub struct DeviceCatalog {
    regions: Vec<DeviceRegion, MAX_DEVICE_REGIONS>,
    lookups: Vec<u32, MAX_DEVICE_REGIONS>,
}

impl DeviceCatalog {
    /// Creates an empty catalog.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            regions: Vec::new(),
            lookups: Vec::new(),
        }
    }

    /// Adds a region; hands it back if it is malformed or the catalog is full.
    pub fn register(&mut self, region: DeviceRegion) -> Result<(), DeviceRegion> {
        if region.frame_bits > region.size_bits || region.size_bits > MAX_DEVICE_SIZE_BITS {
            return Err(region);
        }
        self.regions.push(region)?;
        if self.lookups.push(0).is_err() {
            self.regions.pop();
            return Err(region);
        }
        Ok(())
    }

    /// Returns the catalogued regions.
    #[must_use]
    pub fn regions(&self) -> &[DeviceRegion] {
        &self.regions
    }

    /// Returns catalog utilisation statistics.
    #[must_use]
    pub fn stats(&self) -> DeviceStats {
        DeviceStats {
            regions: self.regions.len(),
            lookups: self.lookups.iter().sum(),
        }
    }
}

impl Platform for DeviceCatalog {
    fn frame_cap<K: Kernel + ?Sized>(
        &mut self,
        kernel: &mut K,
        paddr: usize,
        size_bits: u8,
        dst: &CSpacePath,
    ) -> Result<(), ProcservError> {
        let hit = self
            .regions
            .iter()
            .enumerate()
            .find_map(|(index, region)| {
                region.frame_at(paddr, size_bits).map(|cap| (index, cap))
            });
        let Some((index, frame)) = hit else {
            if let Some(coverage) = self.device_coverage(paddr, size_bits) {
                debug!(
                    "[device] 0x{paddr:x}/{size_bits} lies inside region 0x{:x}..0x{:x} exported as {}-bit frames",
                    coverage.base, coverage.limit, coverage.frame_bits
                );
            }
            return Err(ProcservError::NotFound { paddr, size_bits });
        };
        let src = CSpacePath::new(dst.root, frame.cptr(), dst.depth);
        kernel.cnode_copy(dst, &src, CapRights::all())?;
        self.lookups[index] = self.lookups[index].saturating_add(1);
        Ok(())
    }

    fn device_coverage(&self, paddr: usize, size_bits: u8) -> Option<DeviceCoverage> {
        self.regions
            .iter()
            .enumerate()
            .find(|(_, region)| region.covers(paddr, size_bits))
            .map(|(index, region)| DeviceCoverage {
                base: region.paddr,
                limit: region.limit(),
                size_bits: region.size_bits,
                frame_bits: region.frame_bits,
                index,
                lookups: self.lookups[index],
            })
    }

    fn owns(&self, cap: Capability) -> bool {
        self.regions.iter().any(|region| region.holds(cap))
    }
}

/// Resolves `[paddr, paddr + size)` to a fresh device frame capability.
///
/// The size is validated before any slot is taken; the slot is released
/// again if the platform has no matching region.
pub fn resolve<A, K, P>(
    slots: &mut A,
    kernel: &mut K,
    platform: &mut P,
    paddr: usize,
    size: usize,
) -> Result<Capability, ProcservError>
where
    A: SlotAllocator + ?Sized,
    K: Kernel + ?Sized,
    P: Platform + ?Sized,
{
    let size_bits = size_bits_for(size).map_err(|err| {
        error!("[device] find_device invalid size 0x{size:x}");
        err
    })?;
    let guard = SlotGuard::new(slots).map_err(|err| {
        error!("[device] find_device failed to allocate cslot");
        err
    })?;
    if let Err(err) = platform.frame_cap(kernel, paddr, size_bits, guard.path()) {
        error!("[device] lookup failed paddr=0x{paddr:x} size_bits={size_bits} err={err}");
        return Err(err);
    }
    let cap = guard.commit().cap();
    debug!("[device] paddr=0x{paddr:x} size_bits={size_bits} -> cap={cap}");
    Ok(cap)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn region(paddr: usize, size_bits: u8, frame_bits: u8, first: usize) -> DeviceRegion {
        DeviceRegion {
            paddr,
            size_bits,
            frame_bits,
            first_frame: Capability::new(first),
        }
    }

    #[test]
    fn size_bits_accepts_powers_of_two() {
        assert_eq!(size_bits_for(1), Ok(0));
        assert_eq!(size_bits_for(2), Ok(1));
        assert_eq!(size_bits_for(4096), Ok(12));
        assert_eq!(size_bits_for(1 << 30), Ok(30));
        assert_eq!(size_bits_for(1 << 31), Ok(31));
    }

    #[test]
    fn size_bits_rejects_everything_else() {
        for size in [0usize, 3, 5, 100, 4095] {
            assert_eq!(size_bits_for(size), Err(ProcservError::InvalidSize(size)));
        }
    }

    #[test]
    fn coverage_reports_enclosing_region() {
        let mut catalog = DeviceCatalog::new();
        catalog.register(region(0x1000_0000, 16, 12, 0x30)).unwrap();
        let coverage = catalog.device_coverage(0x1000_2000, 12).unwrap();
        assert_eq!(coverage.base, 0x1000_0000);
        assert_eq!(coverage.limit, 0x1001_0000);
        assert_eq!(coverage.frame_bits, 12);
        assert_eq!(coverage.index, 0);
        assert!(catalog.device_coverage(0x2000_0000, 12).is_none());
    }

    #[test]
    fn frames_are_found_by_offset_within_the_region() {
        let region = region(0x1000_0000, 16, 12, 0x30);
        assert_eq!(region.frame_count(), 16);
        assert_eq!(region.frame_at(0x1000_0000, 12), Some(Capability::new(0x30)));
        assert_eq!(region.frame_at(0x1000_1000, 12), Some(Capability::new(0x31)));
        assert_eq!(region.frame_at(0x1000_f000, 12), Some(Capability::new(0x3f)));
        assert_eq!(region.frame_at(0x1000_0800, 12), None);
        assert_eq!(region.frame_at(0x1000_0000, 13), None);
        assert_eq!(region.frame_at(0x1001_0000, 12), None);
        assert!(region.holds(Capability::new(0x3f)));
        assert!(!region.holds(Capability::new(0x40)));
    }

    #[test]
    fn malformed_regions_are_refused() {
        let mut catalog = DeviceCatalog::new();
        let inverted = region(0x1000_0000, 12, 16, 0x30);
        assert_eq!(catalog.register(inverted), Err(inverted));
        assert_eq!(catalog.stats().regions, 0);
    }

    #[test]
    fn catalog_hands_back_regions_once_full() {
        let mut catalog = DeviceCatalog::new();
        for i in 0..MAX_DEVICE_REGIONS {
            assert!(catalog.register(region(i << 12, 12, 12, 0x100 + i)).is_ok());
        }
        let overflow = region(0xdead_0000, 12, 12, 0x1);
        assert_eq!(catalog.register(overflow), Err(overflow));
        assert_eq!(catalog.stats().regions, MAX_DEVICE_REGIONS);
    }
}
