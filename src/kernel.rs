// Copyright © 2025 Lukas Bower
// SPDX-License-Identifier: Apache-2.0
// Purpose: Capability handles, rights, badges and the privileged kernel seam.
// Author: Lukas Bower

//! Capability vocabulary and the privileged kernel calls the broker issues.
//!
//! [`Kernel`] is the only path by which the server asks the microkernel to
//! derive, copy, delete or create a capability. Every call either completes
//! or fails immediately with a [`KernelError`].

use core::fmt;

use bitflags::bitflags;
use thiserror::Error;

use crate::cspace::CSpacePath;

/// Machine word used for capability pointers and badges.
pub type Word = usize;

/// Raw capability pointer into the server's CSpace.
pub type CPtr = Word;

/// Opaque handle naming one kernel-enforced access right.
///
/// Capabilities are never compared across unrelated allocations; the only
/// meaningful comparison is against [`Capability::NULL`] or against a value
/// previously returned by the same cache.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[repr(transparent)]
pub struct Capability(CPtr);

impl Capability {
    /// Sentinel meaning "no capability".
    pub const NULL: Self = Self(0);

    /// Wraps a raw capability pointer.
    #[inline]
    #[must_use]
    pub const fn new(cptr: CPtr) -> Self {
        Self(cptr)
    }

    /// Returns the raw capability pointer.
    #[inline]
    #[must_use]
    pub const fn cptr(self) -> CPtr {
        self.0
    }

    /// Returns `true` for the null sentinel.
    #[inline]
    #[must_use]
    pub const fn is_null(self) -> bool {
        self.0 == 0
    }
}

impl fmt::Debug for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_null() {
            f.write_str("Capability(null)")
        } else {
            write!(f, "Capability(0x{:04x})", self.0)
        }
    }
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:04x}", self.0)
    }
}

/// Badge embedded into a derived endpoint capability.
///
/// The receiver of a message observes the badge as the caller's claimed
/// session identity. Distinct badges minted from the same endpoint are
/// independent capabilities.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[repr(transparent)]
pub struct Badge(Word);

impl Badge {
    /// Unbadged capability.
    pub const NONE: Self = Self(0);

    /// Creates a badge from a raw value.
    #[inline]
    #[must_use]
    pub const fn new(value: Word) -> Self {
        Self(value)
    }

    /// Returns the raw badge value.
    #[inline]
    #[must_use]
    pub const fn value(self) -> Word {
        self.0
    }
}

impl fmt::Debug for Badge {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Badge(0x{:x})", self.0)
    }
}

impl From<Word> for Badge {
    fn from(value: Word) -> Self {
        Self(value)
    }
}

bitflags! {
    /// Access rights attached to a capability when it is derived.
    ///
    /// Rights can only be attenuated by a derive, never escalated.
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
    pub struct CapRights: u8 {
        /// Receive on endpoints, read on frames.
        const READ = 1 << 0;
        /// Send on endpoints, write on frames.
        const WRITE = 1 << 1;
        /// Transfer capabilities over IPC.
        const GRANT = 1 << 2;
        /// Transfer reply capabilities only.
        const GRANT_REPLY = 1 << 3;
    }
}

impl CapRights {
    /// Rights handed to clients on badged endpoints: send and grant.
    pub const GRANT_WRITE: Self = Self::GRANT.union(Self::WRITE);
}

/// Error codes returned by privileged kernel invocations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Error)]
pub enum KernelError {
    /// An argument was outside the accepted domain.
    #[error("invalid argument")]
    InvalidArgument,
    /// A capability argument was of the wrong type or lacked rights.
    #[error("invalid capability")]
    InvalidCapability,
    /// The invoked object does not support the operation.
    #[error("illegal operation")]
    IllegalOperation,
    /// A numeric argument was out of range.
    #[error("range error")]
    RangeError,
    /// An address argument was misaligned.
    #[error("alignment error")]
    AlignmentError,
    /// A capability lookup failed.
    #[error("failed lookup")]
    FailedLookup,
    /// The message did not carry enough words.
    #[error("truncated message")]
    TruncatedMessage,
    /// The destination slot is occupied.
    #[error("delete first")]
    DeleteFirst,
    /// The object still has derived children.
    #[error("revoke first")]
    RevokeFirst,
    /// The backing untyped memory is exhausted.
    #[error("not enough memory")]
    NotEnoughMemory,
    /// A code the broker does not recognise.
    #[error("unknown kernel error {0}")]
    Unknown(Word),
}

impl KernelError {
    /// Converts a raw kernel return word, treating zero as success.
    pub fn check(raw: Word) -> Result<(), Self> {
        match raw {
            0 => Ok(()),
            1 => Err(Self::InvalidArgument),
            2 => Err(Self::InvalidCapability),
            3 => Err(Self::IllegalOperation),
            4 => Err(Self::RangeError),
            5 => Err(Self::AlignmentError),
            6 => Err(Self::FailedLookup),
            7 => Err(Self::TruncatedMessage),
            8 => Err(Self::DeleteFirst),
            9 => Err(Self::RevokeFirst),
            10 => Err(Self::NotEnoughMemory),
            other => Err(Self::Unknown(other)),
        }
    }

    /// Returns the raw kernel word for this error.
    #[must_use]
    pub const fn code(self) -> Word {
        match self {
            Self::InvalidArgument => 1,
            Self::InvalidCapability => 2,
            Self::IllegalOperation => 3,
            Self::RangeError => 4,
            Self::AlignmentError => 5,
            Self::FailedLookup => 6,
            Self::TruncatedMessage => 7,
            Self::DeleteFirst => 8,
            Self::RevokeFirst => 9,
            Self::NotEnoughMemory => 10,
            Self::Unknown(code) => code,
        }
    }
}

/// Privileged kernel invocations brokered by the server.
///
/// Implementations wrap the microkernel ABI. Destination paths always name a
/// slot the caller has just allocated and still owns.
pub trait Kernel {
    /// Derives `src` into `dst` with `rights` and `badge` (`CNode_Mint`).
    fn cnode_mint(
        &mut self,
        dst: &CSpacePath,
        src: &CSpacePath,
        rights: CapRights,
        badge: Badge,
    ) -> Result<(), KernelError>;

    /// Copies `src` into `dst` with `rights` (`CNode_Copy`).
    fn cnode_copy(
        &mut self,
        dst: &CSpacePath,
        src: &CSpacePath,
        rights: CapRights,
    ) -> Result<(), KernelError>;

    /// Deletes the capability stored at `path` (`CNode_Delete`).
    fn cnode_delete(&mut self, path: &CSpacePath) -> Result<(), KernelError>;

    /// Issues the handler capability for `irq` into `dst` (`IRQControl_Get`).
    fn irq_control_get(&mut self, irq: u32, dst: &CSpacePath) -> Result<(), KernelError>;

    /// Creates a fresh endpoint object and installs its capability at `dst`.
    fn endpoint_create(&mut self, dst: &CSpacePath) -> Result<(), KernelError>;

    /// Unifies instruction and data caches over `[start, end)` of `frame`.
    fn page_unify_instruction(
        &mut self,
        frame: Capability,
        start: usize,
        end: usize,
    ) -> Result<(), KernelError>;
}
