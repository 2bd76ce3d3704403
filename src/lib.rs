// Copyright © 2025 Lukas Bower
// SPDX-License-Identifier: Apache-2.0
// Purpose: Crate root for the process-server capability broker.
// Author: Lukas Bower
#![cfg_attr(not(feature = "std"), no_std)]
#![deny(unsafe_code)]
#![deny(unsafe_op_in_unsafe_fn)]
#![deny(deprecated)]
#![warn(missing_docs)]

//! Capability-lifecycle and transient-mapping core of the process server.
//!
//! The server brokers every privileged resource an untrusted client can
//! reach: badged endpoint capabilities, interrupt handler capabilities,
//! device frame capabilities, and temporary mappings of client-owned frames.
//! Each operation allocates at most a bounded number of CSpace slots and
//! either commits them into a cache/output or releases them before it
//! returns.
//!
//! The microkernel itself is reached through the [`kernel::Kernel`],
//! [`vspace::VSpace`], [`cspace::SlotAllocator`] and [`device::Platform`]
//! traits. The [`host`] module provides in-memory implementations for
//! developer testing.

extern crate alloc;

#[cfg(all(feature = "unify-instruction", feature = "no-flush"))]
compile_error!("`unify-instruction` and `no-flush` select conflicting coherence strategies");

pub mod cache;
pub mod config;
pub mod cspace;
pub mod device;
pub mod endpoint;
pub mod error;
pub mod frame;
pub mod irq;
pub mod kernel;
pub mod server;
pub mod sync;
pub mod vspace;

#[cfg(feature = "std")]
pub mod host;

pub use config::ProcservConfig;
pub use cspace::{CSpacePath, Slot, SlotAllocator, SlotGuard, SlotPool};
pub use error::{cap_or_null, ProcservError, Status};
pub use kernel::{Badge, CapRights, Capability, Kernel, KernelError};
pub use server::{Bootstrap, ProcServer, ServerSnapshot};
pub use sync::LockedServer;

/// Page size exponent of the target architecture.
pub const PAGE_BITS: usize = 12;

/// Size in bytes of one frame; bounds every `offset + len` check.
pub const PAGE_SIZE: usize = 1 << PAGE_BITS;
