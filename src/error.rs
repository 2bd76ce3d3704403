// Copyright © 2025 Lukas Bower
// SPDX-License-Identifier: Apache-2.0
// Purpose: Error taxonomy and RPC status codes for the capability broker.
// Author: Lukas Bower

//! Errors surfaced by broker operations and their RPC-visible encodings.

use thiserror::Error;

use crate::kernel::{Capability, KernelError};

/// Errors raised by process-server operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ProcservError {
    /// `offset + len` exceeds the page bound.
    #[error("invalid offset {offset} and length {len} for a {page_size}-byte frame")]
    InvalidParameter {
        /// Offset supplied by the caller.
        offset: usize,
        /// Length supplied by the caller.
        len: usize,
        /// Page bound the request was checked against.
        page_size: usize,
    },
    /// Requested device region size is not a supported power of two.
    #[error("invalid device size 0x{0:x}")]
    InvalidSize(usize),
    /// The CSpace slot allocator is exhausted.
    #[error("out of capability space")]
    OutOfCapabilitySpace,
    /// A transient address-space mapping could not be established.
    #[error("out of memory")]
    OutOfMemory,
    /// A privileged derive/create call was refused by the kernel.
    #[error("kernel rejected request: {0}")]
    KernelRejected(#[from] KernelError),
    /// No backing region exists for the requested physical range.
    #[error("no device region at 0x{paddr:x} with width {size_bits}")]
    NotFound {
        /// Physical address that was looked up.
        paddr: usize,
        /// Size of the requested region in bits.
        size_bits: u8,
    },
    /// A null capability was passed where a live one is required.
    #[error("null capability")]
    NullCapability,
    /// The capability belongs to the server and cannot be handed back.
    #[error("capability {0} is owned by the server")]
    ServerOwned(Capability),
}

/// Status codes returned to clients by the frame read/write operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum Status {
    /// The copy completed.
    Success = 0,
    /// `offset + len` exceeded the page bound.
    InvalidParam = 1,
    /// The frame could not be mapped.
    OutOfMemory = 2,
}

impl Status {
    /// Returns the wire encoding of this status.
    #[must_use]
    pub const fn code(self) -> i32 {
        self as i32
    }

    /// Returns `true` when the operation succeeded.
    #[must_use]
    pub const fn is_success(self) -> bool {
        matches!(self, Self::Success)
    }
}

impl From<ProcservError> for Status {
    fn from(err: ProcservError) -> Self {
        match err {
            ProcservError::InvalidParameter { .. } => Self::InvalidParam,
            // Frame operations only fail on bounds or mapping; anything else
            // reaching a status means the mapping could not be honoured.
            _ => Self::OutOfMemory,
        }
    }
}

impl From<Result<(), ProcservError>> for Status {
    fn from(result: Result<(), ProcservError>) -> Self {
        match result {
            Ok(()) => Self::Success,
            Err(err) => err.into(),
        }
    }
}

/// Collapses a capability result into the null-sentinel form used on the wire.
#[must_use]
pub fn cap_or_null(result: Result<Capability, ProcservError>) -> Capability {
    result.unwrap_or(Capability::NULL)
}
