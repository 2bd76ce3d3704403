// Copyright © 2025 Lukas Bower
// SPDX-License-Identifier: Apache-2.0
// Purpose: Single mutual-exclusion boundary around a ready process server.
// Author: Lukas Bower

//! Lock wrapper for servers that receive requests concurrently.
//!
//! Each operation holds the lock for its whole duration, so slot rollback
//! and IRQ cache insertion are never observed half done.

use spin::{Mutex, MutexGuard};

use crate::error::ProcservError;
use crate::irq::Irq;
use crate::kernel::{Badge, Capability};
use crate::server::{Bootstrap, ProcServer, ServerSnapshot};

/// A [`ProcServer`] behind one spin lock.
pub struct LockedServer<B: Bootstrap> {
    inner: Mutex<ProcServer<B>>,
}

impl<B: Bootstrap> LockedServer<B> {
    /// Wraps a ready server.
    pub const fn new(server: ProcServer<B>) -> Self {
        Self {
            inner: Mutex::new(server),
        }
    }

    /// Acquires the lock for a multi-step sequence.
    pub fn lock(&self) -> MutexGuard<'_, ProcServer<B>> {
        self.inner.lock()
    }

    /// Unwraps the server.
    pub fn into_inner(self) -> ProcServer<B> {
        self.inner.into_inner()
    }

    /// See [`ProcServer::mint_badge`].
    pub fn mint_badge(&self, badge: Badge) -> Result<Capability, ProcservError> {
        self.lock().mint_badge(badge)
    }

    /// See [`ProcServer::frame_write`].
    pub fn frame_write(
        &self,
        frame: Capability,
        src: &[u8],
        offset: usize,
    ) -> Result<(), ProcservError> {
        self.lock().frame_write(frame, src, offset)
    }

    /// See [`ProcServer::frame_read`].
    pub fn frame_read(
        &self,
        frame: Capability,
        dst: &mut [u8],
        offset: usize,
    ) -> Result<(), ProcservError> {
        self.lock().frame_read(frame, dst, offset)
    }

    /// See [`ProcServer::find_device`].
    pub fn find_device(&self, paddr: usize, size: usize) -> Result<Capability, ProcservError> {
        self.lock().find_device(paddr, size)
    }

    /// See [`ProcServer::get_irq_handler`].
    pub fn get_irq_handler(&self, irq: Irq) -> Result<Capability, ProcservError> {
        self.lock().get_irq_handler(irq)
    }

    /// See [`ProcServer::release_cap`].
    pub fn release_cap(&self, cap: Capability) -> Result<(), ProcservError> {
        self.lock().release_cap(cap)
    }

    /// See [`ProcServer::snapshot`].
    pub fn snapshot(&self) -> ServerSnapshot {
        self.lock().snapshot()
    }
}
