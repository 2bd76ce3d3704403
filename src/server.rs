// Copyright © 2025 Lukas Bower
// SPDX-License-Identifier: Apache-2.0
// Purpose: Process-server state aggregate, initialisation order and brokered operations.
// Author: Lukas Bower

//! The process server's resource-brokering state.
//!
//! [`ProcServer`] owns the main endpoint, its receive slot, the IRQ handler
//! cache and every kernel-facing collaborator. It only exists in the ready
//! state: [`ProcServer::initialise`] runs the bring-up sequence and either
//! returns a ready server or the error that stopped it.
//!
//! Callers must serialise access. Every operation takes `&mut self` and runs
//! to completion, rollback included, before the next one starts; wrap the
//! server in [`crate::LockedServer`] when requests arrive concurrently.

use log::{info, warn};

use crate::cache::{flush_frames, CoherenceFlush};
use crate::config::ProcservConfig;
use crate::cspace::{CSpacePath, Slot, SlotAllocator, SlotGuard};
use crate::device::{self, DeviceCoverage, Platform};
use crate::endpoint::BadgeMinter;
use crate::error::ProcservError;
use crate::frame::FrameMapper;
use crate::irq::{Irq, IrqHandlerCache};
use crate::kernel::{Badge, Capability, Kernel};
use crate::vspace::VSpace;

/// Process identifier as understood by the external process registry.
pub type Pid = u32;

/// External collaborators brought up before the broker itself.
///
/// The methods are invoked once each, in declaration order, by
/// [`ProcServer::initialise`].
pub trait Bootstrap {
    /// Privileged kernel interface.
    type Kernel: Kernel;
    /// CSpace slot allocator.
    type Slots: SlotAllocator;
    /// The server's own address space.
    type VSpace: VSpace;
    /// Platform introspection service.
    type Platform: Platform;
    /// Coherence flush strategy for the target.
    type Coherence: CoherenceFlush + Default;
    /// Opaque process, window, dataspace and name-service registries.
    type Registries;

    /// Bootstraps the kernel-object and slot allocators.
    fn bootstrap_allocator(
        &mut self,
        config: &ProcservConfig,
    ) -> Result<(Self::Kernel, Self::Slots), ProcservError>;

    /// Reserves the allocator's virtual pool and yields the address space.
    fn reserve_virtual_pool(
        &mut self,
        kernel: &mut Self::Kernel,
        slots: &mut Self::Slots,
        pool_bytes: usize,
    ) -> Result<Self::VSpace, ProcservError>;

    /// Configures platform introspection.
    fn configure_platform(
        &mut self,
        kernel: &mut Self::Kernel,
        slots: &mut Self::Slots,
    ) -> Result<Self::Platform, ProcservError>;

    /// Initialises the collaborator registries.
    fn initialise_registries(
        &mut self,
        kernel: &mut Self::Kernel,
        slots: &mut Self::Slots,
    ) -> Result<Self::Registries, ProcservError>;
}

/// Diagnostic snapshot of broker resource usage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ServerSnapshot {
    /// Main endpoint capability.
    pub endpoint: Capability,
    /// Slots still available to the allocator.
    pub cspace_free: usize,
    /// Interrupt lines with a cached handler.
    pub irq_handlers: usize,
    /// Current fake clock value.
    pub fake_time: u32,
}

/// Ready process-server state.
pub struct ProcServer<B: Bootstrap> {
    config: ProcservConfig,
    kernel: B::Kernel,
    slots: B::Slots,
    vspace: B::VSpace,
    platform: B::Platform,
    coherence: B::Coherence,
    minter: BadgeMinter,
    recv: CSpacePath,
    irq_handlers: IrqHandlerCache,
    registries: B::Registries,
    fake_clock: u32,
    unblock_client_fault_pid: Option<Pid>,
}

impl<B: Bootstrap> ProcServer<B> {
    /// Runs the bring-up sequence and returns the ready server.
    ///
    /// Order: allocator bootstrap, virtual pool, platform introspection,
    /// main endpoint and receive slot, registries, empty IRQ cache.
    pub fn initialise(boot: &mut B, config: ProcservConfig) -> Result<Self, ProcservError> {
        let (mut kernel, mut slots) = boot.bootstrap_allocator(&config)?;
        let vspace = boot.reserve_virtual_pool(&mut kernel, &mut slots, config.virtual_pool_bytes())?;
        let platform = boot.configure_platform(&mut kernel, &mut slots)?;

        info!("[procserv] allocating main process server endpoint");
        let endpoint = {
            let guard = SlotGuard::new(&mut slots)?;
            kernel.endpoint_create(guard.path())?;
            guard.commit().cap()
        };

        info!("[procserv] setting recv cslot");
        let recv_slot = slots.alloc_slot()?;
        let recv = slots.path(recv_slot);

        info!("[procserv] initialising process server modules");
        let registries = boot.initialise_registries(&mut kernel, &mut slots)?;

        let server = Self {
            minter: BadgeMinter::new(endpoint, config.badge_rights),
            config,
            kernel,
            slots,
            vspace,
            platform,
            coherence: B::Coherence::default(),
            recv,
            irq_handlers: IrqHandlerCache::new(),
            registries,
            fake_clock: 0,
            unblock_client_fault_pid: None,
        };
        server.banner();
        Ok(server)
    }

    fn banner(&self) {
        info!("================= {} =================", self.config.server_name);
        info!("  version {}", env!("CARGO_PKG_VERSION"));
        info!(
            "  endpoint={} recv=0x{:04x} cspace_free={} flush={}",
            self.minter.endpoint(),
            self.recv.index,
            self.slots.free_count(),
            B::Coherence::REQUIRED
        );
        info!("OK.");
    }

    /// Mints a badged endpoint capability identifying a client session.
    pub fn mint_badge(&mut self, badge: Badge) -> Result<Capability, ProcservError> {
        self.minter.mint(&mut self.slots, &mut self.kernel, badge)
    }

    /// Copies `src` into `frame` at `offset`.
    pub fn frame_write(
        &mut self,
        frame: Capability,
        src: &[u8],
        offset: usize,
    ) -> Result<(), ProcservError> {
        FrameMapper::new(&mut self.vspace, &mut self.kernel, &self.coherence)
            .write(frame, src, offset)
    }

    /// Fills `dst` from `frame` starting at `offset`.
    pub fn frame_read(
        &mut self,
        frame: Capability,
        dst: &mut [u8],
        offset: usize,
    ) -> Result<(), ProcservError> {
        FrameMapper::new(&mut self.vspace, &mut self.kernel, &self.coherence)
            .read(frame, dst, offset)
    }

    /// Resolves a physical device region of `size` bytes to a frame capability.
    pub fn find_device(&mut self, paddr: usize, size: usize) -> Result<Capability, ProcservError> {
        device::resolve(
            &mut self.slots,
            &mut self.kernel,
            &mut self.platform,
            paddr,
            size,
        )
    }

    /// Returns the handler capability for `irq`, creating it on first use.
    pub fn get_irq_handler(&mut self, irq: Irq) -> Result<Capability, ProcservError> {
        self.irq_handlers
            .get_or_create(irq, &mut self.slots, &mut self.kernel)
    }

    /// Disposes of a capability handed back by the name service.
    ///
    /// The capability is deleted without revocation, so clients keep any
    /// copies they hold, and its slot returns to the allocator. If the
    /// delete fails the slot stays allocated. Capabilities the server
    /// itself depends on are refused.
    pub fn release_cap(&mut self, cap: Capability) -> Result<(), ProcservError> {
        if cap.is_null() {
            warn!("[procserv] release_cap called on NULL cap");
            return Err(ProcservError::NullCapability);
        }
        if self.owns(cap) {
            warn!("[procserv] release_cap refused for server-owned cap={cap}");
            return Err(ProcservError::ServerOwned(cap));
        }
        let path = self.slots.path_of(cap);
        if let Err(err) = self.kernel.cnode_delete(&path) {
            warn!("[procserv] release_cap could not delete cap={cap} err={err}");
            return Err(err.into());
        }
        self.slots.free_slot(Slot::from(cap));
        Ok(())
    }

    fn owns(&self, cap: Capability) -> bool {
        cap == self.minter.endpoint()
            || cap == self.recv.cap()
            || self.irq_handlers.holds(cap)
            || self.platform.owns(cap)
    }

    /// Applies the coherence flush to every non-null frame in `frames`.
    pub fn flush_frames(&mut self, frames: &[Capability]) -> usize {
        flush_frames(&self.coherence, &mut self.kernel, frames)
    }

    /// Returns the fake clock value and advances it.
    pub fn fake_time(&mut self) -> u32 {
        let now = self.fake_clock;
        self.fake_clock = self.fake_clock.wrapping_add(1);
        now
    }

    /// Reports the catalogued device region covering a range, if any.
    #[must_use]
    pub fn device_coverage(&self, paddr: usize, size_bits: u8) -> Option<DeviceCoverage> {
        self.platform.device_coverage(paddr, size_bits)
    }

    /// Produces a diagnostic snapshot of resource usage.
    #[must_use]
    pub fn snapshot(&self) -> ServerSnapshot {
        ServerSnapshot {
            endpoint: self.minter.endpoint(),
            cspace_free: self.slots.free_count(),
            irq_handlers: self.irq_handlers.len(),
            fake_time: self.fake_clock,
        }
    }

    /// Main endpoint capability.
    #[must_use]
    pub fn endpoint(&self) -> Capability {
        self.minter.endpoint()
    }

    /// Path of the slot reserved for receiving capabilities over IPC.
    #[must_use]
    pub fn recv_path(&self) -> CSpacePath {
        self.recv
    }

    /// Client whose fault should be unblocked, if any.
    #[must_use]
    pub fn unblock_client_fault_pid(&self) -> Option<Pid> {
        self.unblock_client_fault_pid
    }

    /// Records the client whose fault should be unblocked.
    pub fn set_unblock_client_fault_pid(&mut self, pid: Option<Pid>) {
        self.unblock_client_fault_pid = pid;
    }

    /// Configuration the server was brought up with.
    #[must_use]
    pub fn config(&self) -> &ProcservConfig {
        &self.config
    }

    /// Cached IRQ handlers.
    #[must_use]
    pub fn irq_handlers(&self) -> &IrqHandlerCache {
        &self.irq_handlers
    }

    /// Kernel interface.
    #[must_use]
    pub fn kernel(&self) -> &B::Kernel {
        &self.kernel
    }

    /// Mutable kernel interface.
    pub fn kernel_mut(&mut self) -> &mut B::Kernel {
        &mut self.kernel
    }

    /// Slot allocator.
    #[must_use]
    pub fn slots(&self) -> &B::Slots {
        &self.slots
    }

    /// Mutable slot allocator.
    pub fn slots_mut(&mut self) -> &mut B::Slots {
        &mut self.slots
    }

    /// The server's address space.
    #[must_use]
    pub fn vspace(&self) -> &B::VSpace {
        &self.vspace
    }

    /// Mutable address space.
    pub fn vspace_mut(&mut self) -> &mut B::VSpace {
        &mut self.vspace
    }

    /// Platform introspection service.
    #[must_use]
    pub fn platform(&self) -> &B::Platform {
        &self.platform
    }

    /// Collaborator registries.
    #[must_use]
    pub fn registries(&self) -> &B::Registries {
        &self.registries
    }

    /// Mutable collaborator registries.
    pub fn registries_mut(&mut self) -> &mut B::Registries {
        &mut self.registries
    }
}
