// Copyright © 2025 Lukas Bower
// SPDX-License-Identifier: Apache-2.0
// Purpose: Process-server tunables consumed during initialisation.
// Author: Lukas Bower

//! Process-server configuration.

use crate::kernel::CapRights;
use crate::PAGE_SIZE;

/// Pages reserved for the kernel-object allocator's virtual pool.
pub const DEFAULT_VIRTUAL_POOL_PAGES: usize = 100;

/// Pages of static memory handed to the allocator bootstrap.
pub const DEFAULT_INITIAL_MEM_PAGES: usize = 32;

/// Name used in the startup banner.
pub const DEFAULT_SERVER_NAME: &str = "PROCSERV";

/// Tunables applied while bringing the server to the ready state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcservConfig {
    /// Size of the allocator's reserved virtual pool, in pages.
    pub virtual_pool_pages: usize,
    /// Size of the static bootstrap memory pool, in pages.
    pub initial_mem_pages: usize,
    /// Name reported in the banner.
    pub server_name: &'static str,
    /// Rights carried by badged endpoint capabilities.
    pub badge_rights: CapRights,
}

impl Default for ProcservConfig {
    fn default() -> Self {
        Self {
            virtual_pool_pages: DEFAULT_VIRTUAL_POOL_PAGES,
            initial_mem_pages: DEFAULT_INITIAL_MEM_PAGES,
            server_name: DEFAULT_SERVER_NAME,
            badge_rights: CapRights::GRANT_WRITE,
        }
    }
}

impl ProcservConfig {
    /// Sets the virtual pool size in pages.
    #[must_use]
    pub fn with_virtual_pool_pages(mut self, pages: usize) -> Self {
        self.virtual_pool_pages = pages;
        self
    }

    /// Sets the bootstrap memory pool size in pages.
    #[must_use]
    pub fn with_initial_mem_pages(mut self, pages: usize) -> Self {
        self.initial_mem_pages = pages;
        self
    }

    /// Sets the banner name.
    #[must_use]
    pub fn with_server_name(mut self, name: &'static str) -> Self {
        self.server_name = name;
        self
    }

    /// Sets the rights minted into badged endpoints.
    #[must_use]
    pub fn with_badge_rights(mut self, rights: CapRights) -> Self {
        self.badge_rights = rights;
        self
    }

    /// Virtual pool size in bytes.
    #[must_use]
    pub fn virtual_pool_bytes(&self) -> usize {
        self.virtual_pool_pages.saturating_mul(PAGE_SIZE)
    }

    /// Bootstrap memory pool size in bytes.
    #[must_use]
    pub fn initial_mem_bytes(&self) -> usize {
        self.initial_mem_pages.saturating_mul(PAGE_SIZE)
    }
}
