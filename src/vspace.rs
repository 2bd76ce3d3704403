// Copyright © 2025 Lukas Bower
// SPDX-License-Identifier: Apache-2.0
// Purpose: Transient single-page mappings of caller-owned frames.
// Author: Lukas Bower
#![allow(unsafe_code)]

//! Scoped mappings of foreign frames into the server's address space.

use core::ptr::NonNull;

use log::{error, trace};

use crate::error::ProcservError;
use crate::kernel::{Capability, KernelError};
use crate::PAGE_SIZE;

/// The server's own virtual address space.
///
/// # Safety
///
/// A pointer returned by [`VSpace::map_page`] must address `PAGE_SIZE`
/// readable and writable bytes backed by `frame`, and must stay valid and
/// unaliased by any other mapping the server holds until it is passed to
/// [`VSpace::unmap_page`].
pub unsafe trait VSpace {
    /// Maps `frame` with full rights at a free address of the reserved pool.
    fn map_page(&mut self, frame: Capability) -> Result<NonNull<u8>, KernelError>;

    /// Unmaps the page at `vaddr`, preserving the frame capability.
    fn unmap_page(&mut self, vaddr: NonNull<u8>);
}

/// A frame mapped for the duration of one copy.
///
/// The mapping is released when the value is dropped, on every exit path.
pub struct TransientMapping<'a, V: VSpace + ?Sized> {
    vspace: &'a mut V,
    frame: Capability,
    base: NonNull<u8>,
}

impl<'a, V: VSpace + ?Sized> TransientMapping<'a, V> {
    /// Maps `frame` into `vspace`.
    pub fn map(vspace: &'a mut V, frame: Capability) -> Result<Self, ProcservError> {
        let base = vspace.map_page(frame).map_err(|err| {
            error!("[frame] couldn't map frame={frame} err={err}");
            ProcservError::OutOfMemory
        })?;
        trace!("[frame] map frame={frame} vaddr={:p}", base.as_ptr());
        Ok(Self {
            vspace,
            frame,
            base,
        })
    }

    /// Returns the mapped frame capability.
    #[must_use]
    pub fn frame(&self) -> Capability {
        self.frame
    }

    /// Returns the mapped page as a byte slice.
    #[must_use]
    pub fn as_slice(&self) -> &[u8] {
        // SAFETY: `VSpace` guarantees PAGE_SIZE valid bytes until unmap, and
        // the mapping is only unmapped when `self` is dropped.
        unsafe { core::slice::from_raw_parts(self.base.as_ptr(), PAGE_SIZE) }
    }

    /// Returns the mapped page as a mutable byte slice.
    #[must_use]
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        // SAFETY: as for `as_slice`; `&mut self` rules out other borrows.
        unsafe { core::slice::from_raw_parts_mut(self.base.as_ptr(), PAGE_SIZE) }
    }
}

impl<V: VSpace + ?Sized> Drop for TransientMapping<'_, V> {
    fn drop(&mut self) {
        trace!("[frame] unmap frame={} vaddr={:p}", self.frame, self.base.as_ptr());
        self.vspace.unmap_page(self.base);
    }
}
