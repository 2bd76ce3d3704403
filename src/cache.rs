// Copyright © 2025 Lukas Bower
// SPDX-License-Identifier: Apache-2.0
// Purpose: Build-time selected cache coherence flush for transiently mapped frames.
// Author: Lukas Bower

//! Instruction/data cache coherence for frames the server writes into.
//!
//! The frame mapper always calls [`CoherenceFlush::flush`]; on targets with
//! unified caches the selected strategy is [`NoFlush`] and the call is free.

use log::{trace, warn};

use crate::kernel::{Capability, Kernel, KernelError};
use crate::PAGE_SIZE;

/// Coherence strategy applied to a frame around a transient copy.
pub trait CoherenceFlush {
    /// Whether this strategy issues any kernel call at all.
    const REQUIRED: bool;

    /// Makes the contents of `frame` coherent between I- and D-caches.
    fn flush<K: Kernel + ?Sized>(
        &self,
        kernel: &mut K,
        frame: Capability,
    ) -> Result<(), KernelError>;
}

/// Unifies the instruction cache over the whole frame through the kernel.
#[derive(Debug, Clone, Copy, Default)]
pub struct UnifyInstruction;

impl CoherenceFlush for UnifyInstruction {
    const REQUIRED: bool = true;

    fn flush<K: Kernel + ?Sized>(
        &self,
        kernel: &mut K,
        frame: Capability,
    ) -> Result<(), KernelError> {
        trace!("[cache] unify enter frame={frame} len={PAGE_SIZE}");
        let result = kernel.page_unify_instruction(frame, 0, PAGE_SIZE);
        trace!("[cache] unify exit frame={frame} ok={}", result.is_ok());
        result
    }
}

/// No-op strategy for architectures whose caches are already coherent.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoFlush;

impl CoherenceFlush for NoFlush {
    const REQUIRED: bool = false;

    #[inline(always)]
    fn flush<K: Kernel + ?Sized>(
        &self,
        _kernel: &mut K,
        _frame: Capability,
    ) -> Result<(), KernelError> {
        Ok(())
    }
}

/// Strategy selected for the build target.
#[cfg(any(
    feature = "unify-instruction",
    all(
        not(feature = "no-flush"),
        any(target_arch = "arm", target_arch = "aarch64")
    )
))]
pub type TargetCoherence = UnifyInstruction;

/// Strategy selected for the build target.
#[cfg(not(any(
    feature = "unify-instruction",
    all(
        not(feature = "no-flush"),
        any(target_arch = "arm", target_arch = "aarch64")
    )
)))]
pub type TargetCoherence = NoFlush;

/// Flushes every non-null frame in `frames`, skipping null entries.
///
/// A failed flush is reported and the remaining frames are still processed.
/// Returns the number of frames that were flushed successfully.
pub fn flush_frames<C, K>(coherence: &C, kernel: &mut K, frames: &[Capability]) -> usize
where
    C: CoherenceFlush,
    K: Kernel + ?Sized,
{
    if !C::REQUIRED {
        return 0;
    }
    let mut flushed = 0;
    for &frame in frames.iter().filter(|frame| !frame.is_null()) {
        match coherence.flush(kernel, frame) {
            Ok(()) => flushed += 1,
            Err(err) => warn!("[cache] flush failed frame={frame} err={err}"),
        }
    }
    flushed
}
