// Copyright © 2025 Lukas Bower
// SPDX-License-Identifier: Apache-2.0
// Purpose: Copy bytes into and out of caller-owned frames through a transient mapping.
// Author: Lukas Bower

//! Frame read/write through a scoped map, copy, flush, unmap sequence.
//!
//! Bounds are checked before anything is mapped. Map, copy and unmap form
//! one unit: the mapping is released on every path once it exists, and no
//! CSpace slot is consumed.

use log::{error, warn};

use crate::cache::CoherenceFlush;
use crate::error::ProcservError;
use crate::kernel::{Capability, Kernel};
use crate::vspace::{TransientMapping, VSpace};
use crate::PAGE_SIZE;

/// Rejects any `offset + len` that does not fit in one page.
pub fn check_bounds(offset: usize, len: usize) -> Result<(), ProcservError> {
    match offset.checked_add(len) {
        Some(end) if end <= PAGE_SIZE => Ok(()),
        _ => Err(ProcservError::InvalidParameter {
            offset,
            len,
            page_size: PAGE_SIZE,
        }),
    }
}

/// Borrowed view of the collaborators a frame copy needs.
pub struct FrameMapper<'a, V: ?Sized, K: ?Sized, C> {
    vspace: &'a mut V,
    kernel: &'a mut K,
    coherence: &'a C,
}

impl<'a, V, K, C> FrameMapper<'a, V, K, C>
where
    V: VSpace + ?Sized,
    K: Kernel + ?Sized,
    C: CoherenceFlush,
{
    /// Bundles the address space, kernel and flush strategy for one copy.
    pub fn new(vspace: &'a mut V, kernel: &'a mut K, coherence: &'a C) -> Self {
        Self {
            vspace,
            kernel,
            coherence,
        }
    }

    /// Copies `src` into `frame` starting at `offset`, then flushes.
    pub fn write(
        &mut self,
        frame: Capability,
        src: &[u8],
        offset: usize,
    ) -> Result<(), ProcservError> {
        if let Err(err) = check_bounds(offset, src.len()) {
            error!("[frame] write invalid offset and length: {err}");
            return Err(err);
        }
        let mut mapping = TransientMapping::map(&mut *self.vspace, frame)?;
        mapping.as_mut_slice()[offset..offset + src.len()].copy_from_slice(src);
        flush_mapped(self.coherence, &mut *self.kernel, frame);
        Ok(())
    }

    /// Flushes `frame`, then copies `dst.len()` bytes out of it from `offset`.
    pub fn read(
        &mut self,
        frame: Capability,
        dst: &mut [u8],
        offset: usize,
    ) -> Result<(), ProcservError> {
        if let Err(err) = check_bounds(offset, dst.len()) {
            error!("[frame] read invalid offset and length: {err}");
            return Err(err);
        }
        let mapping = TransientMapping::map(&mut *self.vspace, frame)?;
        flush_mapped(self.coherence, &mut *self.kernel, frame);
        dst.copy_from_slice(&mapping.as_slice()[offset..offset + dst.len()]);
        Ok(())
    }
}

fn flush_mapped<C, K>(coherence: &C, kernel: &mut K, frame: Capability)
where
    C: CoherenceFlush,
    K: Kernel + ?Sized,
{
    if let Err(err) = coherence.flush(kernel, frame) {
        warn!("[frame] coherence flush failed frame={frame} err={err}");
    }
}
