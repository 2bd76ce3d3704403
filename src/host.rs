// Copyright © 2025 Lukas Bower
// SPDX-License-Identifier: Apache-2.0
// Purpose: In-memory kernel, address space and bootstrap used for host-mode testing.
// Author: Lukas Bower
#![allow(unsafe_code)]
#![allow(clippy::module_name_repetitions)]

//! Host-mode simulation of the microkernel seams.
//!
//! [`HostKernel`] keeps a model of the server's CSpace so tests can observe
//! exactly which capabilities are installed, counts every privileged call,
//! and fails on demand. [`HostVSpace`] backs frames with heap pages.
//! [`HostBootstrap`] wires everything into a [`ProcServer`](crate::ProcServer).

use std::collections::{BTreeMap, BTreeSet};
use std::ptr::NonNull;

use log::{debug, info};

use crate::cache::TargetCoherence;
use crate::config::ProcservConfig;
use crate::cspace::{CSpacePath, Slot, SlotAllocator, SlotPool};
use crate::device::{DeviceCatalog, DeviceRegion};
use crate::error::ProcservError;
use crate::kernel::{Badge, CPtr, CapRights, Capability, Kernel, KernelError};
use crate::server::Bootstrap;
use crate::vspace::VSpace;
use crate::{PAGE_BITS, PAGE_SIZE};

/// Slot of the root CNode capability in the simulated CSpace.
pub const ROOT_CNODE: CPtr = 2;

/// Kernel object a simulated CSpace slot refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostObject {
    /// An endpoint created by `endpoint_create`.
    Endpoint {
        /// Identifier of the endpoint object.
        id: u32,
    },
    /// A badged derivation of an endpoint.
    MintedEndpoint {
        /// Identifier of the source endpoint object.
        id: u32,
        /// Badge carried by the derivation.
        badge: Badge,
        /// Rights carried by the derivation.
        rights: CapRights,
    },
    /// A handler for one interrupt line.
    IrqHandler(u32),
    /// A device frame.
    DeviceFrame {
        /// Physical base of the frame.
        paddr: usize,
        /// Width of the frame in bits.
        size_bits: u8,
    },
}

/// Per-operation invocation counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct KernelCalls {
    /// `CNode_Mint` invocations.
    pub mint: usize,
    /// `CNode_Copy` invocations.
    pub copy: usize,
    /// `CNode_Delete` invocations.
    pub delete: usize,
    /// `IRQControl_Get` invocations.
    pub irq_control_get: usize,
    /// Endpoint creations.
    pub endpoint_create: usize,
    /// Instruction cache unify invocations.
    pub unify: usize,
}

/// In-memory model of the privileged kernel interface.
#[derive(Debug, Default)]
pub struct HostKernel {
    cspace: BTreeMap<CPtr, HostObject>,
    issued_irqs: BTreeSet<u32>,
    calls: KernelCalls,
    next_endpoint: u32,
    fail_mint: Option<KernelError>,
    fail_unify: Option<KernelError>,
    fail_endpoint: Option<KernelError>,
    rejected_irqs: BTreeSet<u32>,
}

impl HostKernel {
    /// Creates a kernel with an empty CSpace.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Places a boot-provided capability directly into the CSpace.
    pub fn install(&mut self, cap: Capability, object: HostObject) {
        self.cspace.insert(cap.cptr(), object);
    }

    /// Returns the object stored at `cap`, if any.
    #[must_use]
    pub fn object(&self, cap: Capability) -> Option<HostObject> {
        self.cspace.get(&cap.cptr()).copied()
    }

    /// Number of occupied CSpace slots.
    #[must_use]
    pub fn installed(&self) -> usize {
        self.cspace.len()
    }

    /// Invocation counters.
    #[must_use]
    pub fn calls(&self) -> KernelCalls {
        self.calls
    }

    /// Makes every subsequent mint fail with `err`.
    pub fn fail_mint(&mut self, err: Option<KernelError>) {
        self.fail_mint = err;
    }

    /// Makes every subsequent unify fail with `err`.
    pub fn fail_unify(&mut self, err: Option<KernelError>) {
        self.fail_unify = err;
    }

    /// Makes every subsequent endpoint creation fail with `err`.
    pub fn fail_endpoint(&mut self, err: Option<KernelError>) {
        self.fail_endpoint = err;
    }

    /// Makes handler requests for `irq` fail as if the line were invalid.
    pub fn reject_irq(&mut self, irq: u32) {
        self.rejected_irqs.insert(irq);
    }

    /// Lets handler requests for `irq` succeed again.
    pub fn accept_irq(&mut self, irq: u32) {
        self.rejected_irqs.remove(&irq);
    }

    fn vacant(&self, dst: &CSpacePath) -> Result<(), KernelError> {
        if dst.root != ROOT_CNODE {
            return Err(KernelError::FailedLookup);
        }
        if self.cspace.contains_key(&dst.index) {
            return Err(KernelError::DeleteFirst);
        }
        Ok(())
    }

    fn lookup(&self, src: &CSpacePath) -> Result<HostObject, KernelError> {
        if src.root != ROOT_CNODE {
            return Err(KernelError::FailedLookup);
        }
        self.cspace
            .get(&src.index)
            .copied()
            .ok_or(KernelError::FailedLookup)
    }
}

impl Kernel for HostKernel {
    fn cnode_mint(
        &mut self,
        dst: &CSpacePath,
        src: &CSpacePath,
        rights: CapRights,
        badge: Badge,
    ) -> Result<(), KernelError> {
        self.calls.mint += 1;
        if let Some(err) = self.fail_mint {
            return Err(err);
        }
        self.vacant(dst)?;
        let HostObject::Endpoint { id } = self.lookup(src)? else {
            return Err(KernelError::InvalidCapability);
        };
        self.cspace.insert(
            dst.index,
            HostObject::MintedEndpoint { id, badge, rights },
        );
        Ok(())
    }

    fn cnode_copy(
        &mut self,
        dst: &CSpacePath,
        src: &CSpacePath,
        _rights: CapRights,
    ) -> Result<(), KernelError> {
        self.calls.copy += 1;
        self.vacant(dst)?;
        let object = self.lookup(src)?;
        self.cspace.insert(dst.index, object);
        Ok(())
    }

    fn cnode_delete(&mut self, path: &CSpacePath) -> Result<(), KernelError> {
        self.calls.delete += 1;
        if path.root != ROOT_CNODE {
            return Err(KernelError::FailedLookup);
        }
        if let Some(HostObject::IrqHandler(irq)) = self.cspace.remove(&path.index) {
            self.issued_irqs.remove(&irq);
        }
        Ok(())
    }

    fn irq_control_get(&mut self, irq: u32, dst: &CSpacePath) -> Result<(), KernelError> {
        self.calls.irq_control_get += 1;
        if self.rejected_irqs.contains(&irq) {
            return Err(KernelError::RangeError);
        }
        if self.issued_irqs.contains(&irq) {
            return Err(KernelError::RevokeFirst);
        }
        self.vacant(dst)?;
        self.cspace.insert(dst.index, HostObject::IrqHandler(irq));
        self.issued_irqs.insert(irq);
        Ok(())
    }

    fn endpoint_create(&mut self, dst: &CSpacePath) -> Result<(), KernelError> {
        self.calls.endpoint_create += 1;
        if let Some(err) = self.fail_endpoint {
            return Err(err);
        }
        self.vacant(dst)?;
        self.next_endpoint += 1;
        self.cspace.insert(
            dst.index,
            HostObject::Endpoint {
                id: self.next_endpoint,
            },
        );
        Ok(())
    }

    fn page_unify_instruction(
        &mut self,
        _frame: Capability,
        start: usize,
        end: usize,
    ) -> Result<(), KernelError> {
        self.calls.unify += 1;
        if let Some(err) = self.fail_unify {
            return Err(err);
        }
        if start > end || end > PAGE_SIZE {
            return Err(KernelError::RangeError);
        }
        Ok(())
    }
}

type Page = Box<[u8; PAGE_SIZE]>;

/// Address space whose frames are heap pages keyed by capability.
///
/// Pages are created zeroed on first mapping and persist across mappings,
/// so data written through one mapping is visible through the next.
#[derive(Debug, Default)]
pub struct HostVSpace {
    pages: BTreeMap<Capability, Page>,
    live: BTreeMap<usize, Capability>,
    maps: usize,
    unmaps: usize,
    fail_maps: bool,
}

impl HostVSpace {
    /// Creates an empty address space.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes subsequent map requests fail until cleared.
    pub fn fail_maps(&mut self, fail: bool) {
        self.fail_maps = fail;
    }

    /// Number of successful map calls.
    #[must_use]
    pub fn map_count(&self) -> usize {
        self.maps
    }

    /// Number of unmap calls.
    #[must_use]
    pub fn unmap_count(&self) -> usize {
        self.unmaps
    }

    /// Number of mappings currently outstanding.
    #[must_use]
    pub fn live_mappings(&self) -> usize {
        self.live.len()
    }

    /// Returns the backing page of `frame`, if it was ever mapped.
    #[must_use]
    pub fn page(&self, frame: Capability) -> Option<&[u8]> {
        self.pages.get(&frame).map(|page| &page[..])
    }
}

// SAFETY: pages are boxed, so their addresses are stable while the map
// grows, and a frame is never mapped twice at once.
unsafe impl VSpace for HostVSpace {
    fn map_page(&mut self, frame: Capability) -> Result<NonNull<u8>, KernelError> {
        if self.fail_maps {
            return Err(KernelError::NotEnoughMemory);
        }
        if frame.is_null() {
            return Err(KernelError::InvalidCapability);
        }
        if self.live.values().any(|&mapped| mapped == frame) {
            return Err(KernelError::DeleteFirst);
        }
        let page = self
            .pages
            .entry(frame)
            .or_insert_with(|| Box::new([0u8; PAGE_SIZE]));
        let base = NonNull::from(&mut **page).cast::<u8>();
        self.live.insert(base.as_ptr() as usize, frame);
        self.maps += 1;
        Ok(base)
    }

    fn unmap_page(&mut self, vaddr: NonNull<u8>) {
        self.unmaps += 1;
        self.live.remove(&(vaddr.as_ptr() as usize));
    }
}

/// Slot allocator that refuses service after a fixed number of allocations.
pub struct CappedSlots<A> {
    inner: A,
    remaining_allocations: Option<usize>,
}

impl<A: SlotAllocator> CappedSlots<A> {
    /// Wraps `inner` with no ceiling.
    pub fn new(inner: A) -> Self {
        Self {
            inner,
            remaining_allocations: None,
        }
    }

    /// Fails every allocation after the next `count` successful ones.
    pub fn fail_after(&mut self, count: usize) {
        self.remaining_allocations = Some(count);
    }

    /// Removes the ceiling.
    pub fn clear_ceiling(&mut self) {
        self.remaining_allocations = None;
    }

    /// Returns the wrapped allocator.
    pub fn inner(&self) -> &A {
        &self.inner
    }
}

impl<A: SlotAllocator> SlotAllocator for CappedSlots<A> {
    fn alloc_slot(&mut self) -> Result<Slot, ProcservError> {
        match self.remaining_allocations.as_mut() {
            Some(0) => return Err(ProcservError::OutOfCapabilitySpace),
            Some(left) => *left -= 1,
            None => {}
        }
        self.inner.alloc_slot()
    }

    fn free_slot(&mut self, slot: Slot) {
        self.inner.free_slot(slot);
    }

    fn root(&self) -> CPtr {
        self.inner.root()
    }

    fn depth(&self) -> u8 {
        self.inner.depth()
    }

    fn free_count(&self) -> usize {
        self.inner.free_count()
    }
}

/// Stand-in for the process, window, dataspace and name-service registries.
#[derive(Debug, Default)]
pub struct HostRegistries {
    /// Whether the registries were initialised.
    pub initialised: bool,
}

/// Description of the simulated machine.
#[derive(Debug, Clone)]
pub struct HostMachine {
    /// Radix width of the root CNode.
    pub cnode_bits: u8,
    /// First empty slot exported at boot.
    pub empty_start: CPtr,
    /// One past the last empty slot exported at boot.
    pub empty_end: CPtr,
    /// Device regions `(paddr, size_bits, frame_bits)` exported at boot.
    pub devices: Vec<(usize, u8, u8)>,
}

impl Default for HostMachine {
    fn default() -> Self {
        Self {
            cnode_bits: 12,
            empty_start: 0x100,
            empty_end: 0x400,
            devices: Vec::new(),
        }
    }
}

impl HostMachine {
    /// Adds a device region exported as page-sized frames.
    ///
    /// Regions smaller than a page are exported as a single frame.
    #[must_use]
    pub fn with_device(self, paddr: usize, size_bits: u8) -> Self {
        let frame_bits = size_bits.min(PAGE_BITS as u8);
        self.with_device_frames(paddr, size_bits, frame_bits)
    }

    /// Adds a device region exported as frames of `2^frame_bits` bytes.
    #[must_use]
    pub fn with_device_frames(mut self, paddr: usize, size_bits: u8, frame_bits: u8) -> Self {
        self.devices.push((paddr, size_bits, frame_bits));
        self
    }

    /// Shrinks the empty-slot region to `count` slots.
    #[must_use]
    pub fn with_empty_slots(mut self, count: usize) -> Self {
        self.empty_end = self.empty_start + count;
        self
    }
}

/// Bootstrap for host-mode servers; records the order of bring-up stages.
#[derive(Debug, Default)]
pub struct HostBootstrap {
    machine: HostMachine,
    stages: Vec<&'static str>,
    device_caps: Vec<DeviceRegion>,
}

impl HostBootstrap {
    /// Creates a bootstrap for `machine`.
    #[must_use]
    pub fn new(machine: HostMachine) -> Self {
        Self {
            machine,
            stages: Vec::new(),
            device_caps: Vec::new(),
        }
    }

    /// Stages executed so far, in order.
    #[must_use]
    pub fn stages(&self) -> &[&'static str] {
        &self.stages
    }
}

impl Bootstrap for HostBootstrap {
    type Kernel = HostKernel;
    type Slots = CappedSlots<SlotPool>;
    type VSpace = HostVSpace;
    type Platform = DeviceCatalog;
    type Coherence = TargetCoherence;
    type Registries = HostRegistries;

    fn bootstrap_allocator(
        &mut self,
        config: &ProcservConfig,
    ) -> Result<(HostKernel, CappedSlots<SlotPool>), ProcservError> {
        self.stages.push("allocator");
        info!(
            "[host] bootstrap allocator mem={} bytes cnode_bits={}",
            config.initial_mem_bytes(),
            self.machine.cnode_bits
        );
        let mut kernel = HostKernel::new();
        let mut pool = SlotPool::new(
            ROOT_CNODE,
            self.machine.empty_start..self.machine.empty_end,
            self.machine.cnode_bits,
        );
        // Device frames arrive in the CSpace at boot like any other
        // bootinfo capability, so they take slots before the broker runs.
        self.device_caps.clear();
        for &(paddr, size_bits, frame_bits) in &self.machine.devices {
            let count = 1usize << size_bits.saturating_sub(frame_bits);
            let run = pool.alloc_run(count)?;
            for (i, index) in run.clone().enumerate() {
                kernel.install(
                    Capability::new(index),
                    HostObject::DeviceFrame {
                        paddr: paddr + (i << frame_bits),
                        size_bits: frame_bits,
                    },
                );
            }
            self.device_caps.push(DeviceRegion {
                paddr,
                size_bits,
                frame_bits,
                first_frame: Capability::new(run.start),
            });
        }
        Ok((kernel, CappedSlots::new(pool)))
    }

    fn reserve_virtual_pool(
        &mut self,
        _kernel: &mut HostKernel,
        _slots: &mut CappedSlots<SlotPool>,
        pool_bytes: usize,
    ) -> Result<HostVSpace, ProcservError> {
        self.stages.push("virtual-pool");
        debug!("[host] reserve virtual pool bytes={pool_bytes}");
        Ok(HostVSpace::new())
    }

    fn configure_platform(
        &mut self,
        _kernel: &mut HostKernel,
        _slots: &mut CappedSlots<SlotPool>,
    ) -> Result<DeviceCatalog, ProcservError> {
        self.stages.push("platform");
        let mut catalog = DeviceCatalog::new();
        for &region in &self.device_caps {
            catalog
                .register(region)
                .map_err(|_| ProcservError::OutOfMemory)?;
        }
        Ok(catalog)
    }

    fn initialise_registries(
        &mut self,
        _kernel: &mut HostKernel,
        _slots: &mut CappedSlots<SlotPool>,
    ) -> Result<HostRegistries, ProcservError> {
        self.stages.push("registries");
        Ok(HostRegistries { initialised: true })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn path(index: CPtr) -> CSpacePath {
        CSpacePath::new(ROOT_CNODE, index, 12)
    }

    #[test]
    fn occupied_destination_is_refused() {
        let mut kernel = HostKernel::new();
        kernel.endpoint_create(&path(0x10)).unwrap();
        assert_eq!(
            kernel.endpoint_create(&path(0x10)),
            Err(KernelError::DeleteFirst)
        );
        kernel.fail_endpoint(Some(KernelError::NotEnoughMemory));
        assert_eq!(
            kernel.endpoint_create(&path(0x11)),
            Err(KernelError::NotEnoughMemory)
        );
        assert_eq!(kernel.installed(), 1);
    }

    #[test]
    fn deleting_a_handler_lets_the_line_be_issued_again() {
        let mut kernel = HostKernel::new();
        kernel.irq_control_get(5, &path(0x20)).unwrap();
        assert_eq!(
            kernel.irq_control_get(5, &path(0x21)),
            Err(KernelError::RevokeFirst)
        );
        kernel.cnode_delete(&path(0x20)).unwrap();
        kernel.irq_control_get(5, &path(0x21)).unwrap();
        assert_eq!(
            kernel.object(Capability::new(0x21)),
            Some(HostObject::IrqHandler(5))
        );
    }

    #[test]
    fn mint_requires_an_endpoint_source() {
        let mut kernel = HostKernel::new();
        kernel.install(
            Capability::new(0x30),
            HostObject::DeviceFrame {
                paddr: 0x1000,
                size_bits: 12,
            },
        );
        assert_eq!(
            kernel.cnode_mint(&path(0x31), &path(0x30), CapRights::GRANT_WRITE, Badge::new(1)),
            Err(KernelError::InvalidCapability)
        );
        assert_eq!(
            kernel.cnode_mint(&path(0x31), &path(0x99), CapRights::GRANT_WRITE, Badge::new(1)),
            Err(KernelError::FailedLookup)
        );
    }

    #[test]
    fn pages_persist_between_mappings() {
        let mut vspace = HostVSpace::new();
        let frame = Capability::new(0x40);
        let base = vspace.map_page(frame).unwrap();
        assert_eq!(vspace.map_page(frame), Err(KernelError::DeleteFirst));
        vspace.unmap_page(base);
        assert_eq!(vspace.live_mappings(), 0);
        assert!(vspace.map_page(frame).is_ok());
        assert_eq!(vspace.map_count(), 2);
    }
}
