// Copyright © 2025 Lukas Bower
// SPDX-License-Identifier: Apache-2.0
// Purpose: Mint badge-tagged endpoint capabilities from the main server endpoint.
// Author: Lukas Bower

//! Badged endpoint derivation for session identification.

use log::{debug, warn};

use crate::cspace::{SlotAllocator, SlotGuard};
use crate::error::ProcservError;
use crate::kernel::{Badge, CapRights, Capability, Kernel};

/// Derives restricted, badged copies of the server's main endpoint.
#[derive(Debug, Clone, Copy)]
pub struct BadgeMinter {
    endpoint: Capability,
    rights: CapRights,
}

impl BadgeMinter {
    /// Creates a minter over `endpoint` handing out `rights`.
    #[must_use]
    pub const fn new(endpoint: Capability, rights: CapRights) -> Self {
        Self { endpoint, rights }
    }

    /// Returns the source endpoint.
    #[must_use]
    pub const fn endpoint(&self) -> Capability {
        self.endpoint
    }

    /// Returns the rights minted capabilities carry.
    #[must_use]
    pub const fn rights(&self) -> CapRights {
        self.rights
    }

    /// Mints a new capability to the endpoint tagged with `badge`.
    ///
    /// Uses exactly one slot. The slot is released again if the kernel
    /// refuses the derive; nothing is minted if no slot is available.
    pub fn mint<A, K>(
        &self,
        slots: &mut A,
        kernel: &mut K,
        badge: Badge,
    ) -> Result<Capability, ProcservError>
    where
        A: SlotAllocator + ?Sized,
        K: Kernel + ?Sized,
    {
        let guard = SlotGuard::new(slots).map_err(|err| {
            warn!("[mint] could not allocate a cslot for badge={badge:?}");
            err
        })?;
        let src = guard.path_of(self.endpoint);
        if let Err(err) = kernel.cnode_mint(guard.path(), &src, self.rights, badge) {
            warn!("[mint] could not mint endpoint cap badge={badge:?} err={err}");
            return Err(err.into());
        }
        let slot = guard.commit();
        debug!(
            "[mint] endpoint={} badge={badge:?} -> cap={}",
            self.endpoint,
            slot.cap()
        );
        Ok(slot.cap())
    }
}
