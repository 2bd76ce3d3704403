// Copyright © 2025 Lukas Bower
// SPDX-License-Identifier: Apache-2.0
// Purpose: Append-only cache of interrupt handler capabilities.
// Author: Lukas Bower

//! Interrupt handler capabilities, created at most once per line.
//!
//! The kernel issues a handler for a given line only once, so a second
//! request for the same line must be served from the cache rather than by
//! another `IRQControl_Get`.

use alloc::collections::BTreeMap;

use log::{debug, warn};

use crate::cspace::{SlotAllocator, SlotGuard};
use crate::error::ProcservError;
use crate::kernel::{Capability, Kernel};

/// Interrupt line number.
pub type Irq = u32;

/// Lazy, append-only map from interrupt line to handler capability.
///
/// Entries are never evicted. The set of lines is fixed by hardware, so the
/// map stays small.
#[derive(Debug, Default)]
pub struct IrqHandlerCache {
    handlers: BTreeMap<Irq, Capability>,
}

impl IrqHandlerCache {
    /// Creates an empty cache.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            handlers: BTreeMap::new(),
        }
    }

    /// Returns the cached handler for `irq`, if one has been created.
    #[must_use]
    pub fn get(&self, irq: Irq) -> Option<Capability> {
        self.handlers.get(&irq).copied()
    }

    /// Number of lines with a cached handler.
    #[must_use]
    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    /// Returns `true` when no handler has been created yet.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    /// Reports whether `cap` is one of the cached handlers.
    #[must_use]
    pub fn holds(&self, cap: Capability) -> bool {
        self.handlers.values().any(|&handler| handler == cap)
    }

    /// Iterates cached `(irq, handler)` pairs in line order.
    pub fn iter(&self) -> impl Iterator<Item = (Irq, Capability)> + '_ {
        self.handlers.iter().map(|(&irq, &cap)| (irq, cap))
    }

    /// Returns the handler for `irq`, asking the kernel for it on first use.
    ///
    /// On failure the slot is released and the cache is left untouched so
    /// a later call may retry.
    pub fn get_or_create<A, K>(
        &mut self,
        irq: Irq,
        slots: &mut A,
        kernel: &mut K,
    ) -> Result<Capability, ProcservError>
    where
        A: SlotAllocator + ?Sized,
        K: Kernel + ?Sized,
    {
        if let Some(handler) = self.get(irq) {
            debug!("[irq] cached handler irq={irq} cap={handler}");
            return Ok(handler);
        }

        let guard = SlotGuard::new(slots).map_err(|err| {
            warn!("[irq] could not allocate IRQ handler cslot irq={irq}");
            err
        })?;
        if let Err(err) = kernel.irq_control_get(irq, guard.path()) {
            warn!("[irq] could not get IRQ handler for irq={irq} err={err}");
            return Err(err.into());
        }
        let handler = guard.commit().cap();
        self.handlers.insert(irq, handler);
        debug!("[irq] created handler irq={irq} cap={handler}");
        Ok(handler)
    }
}
