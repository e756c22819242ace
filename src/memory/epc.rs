// Copyright (C) 2023 Ant Group CO., Ltd. All rights reserved.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! The Enclave Page Cache: a fixed pool of protected 4K pages shared by all
//! enclaves, each with its EPCM entry.

use alloc::{boxed::Box, sync::Arc, vec::Vec};
use core::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use bitmap_allocator::BitAlloc;
use spin::mutex::{SpinMutex, SpinMutexGuard};

use super::addr::{is_aligned, PAGE_SIZE};
use crate::config::PagerConfig;
use crate::enclave::epcm::EpcmEntry;
use crate::error::EpcResult;

/// Physical address of an EPC page.
pub type EpcPhysAddr = usize;

// Support max 64K * 4096 = 256MB of EPC.
type EpcFrameAlloc = bitmap_allocator::BitAlloc64K;
pub const MAX_EPC_PAGES: usize = 0x1_0000;

/// Hardware state of an EPC page as recorded in its EPCM entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EpcPageState {
    Free,
    Assigned,
    Blocked,
    Tracked,
}

pub struct EpcPage {
    pub(crate) epcm: SpinMutex<EpcmEntry>,
    pub(crate) data: SpinMutex<Box<[u8; PAGE_SIZE]>>,
}

impl EpcPage {
    fn new() -> Self {
        Self {
            epcm: SpinMutex::new(EpcmEntry::empty()),
            data: SpinMutex::new(Box::new([0; PAGE_SIZE])),
        }
    }
}

pub struct Epc {
    config: PagerConfig,
    allocator: SpinMutex<EpcFrameAlloc>,
    pages: Vec<EpcPage>,
    /// Source of version-array values; never yields zero.
    nonce: AtomicU64,
    free_pages: AtomicUsize,
}

impl Epc {
    pub fn new(config: PagerConfig) -> EpcResult<Arc<Self>> {
        config.validate()?;
        let mut allocator = EpcFrameAlloc::DEFAULT;
        allocator.insert(0..config.epc_pages);
        let pages = (0..config.epc_pages).map(|_| EpcPage::new()).collect();
        info!(
            "EPC initialized: [{:#x}, {:#x}), {} pages",
            config.epc_base,
            config.epc_base + config.epc_pages * PAGE_SIZE,
            config.epc_pages
        );
        Ok(Arc::new(Self {
            nonce: AtomicU64::new(config.nonce_seed),
            free_pages: AtomicUsize::new(config.epc_pages),
            allocator: SpinMutex::new(allocator),
            pages,
            config,
        }))
    }

    pub fn config(&self) -> &PagerConfig {
        &self.config
    }

    pub fn free_pages(&self) -> usize {
        self.free_pages.load(Ordering::Acquire)
    }

    fn index(&self, paddr: EpcPhysAddr) -> EpcResult<usize> {
        let base = self.config.epc_base;
        let end = base + self.pages.len() * PAGE_SIZE;
        if !is_aligned(paddr) || !(base..end).contains(&paddr) {
            return epc_result_err!(
                EINVAL,
                format!("Epc::index(): {:#x} is not an EPC page", paddr)
            );
        }
        Ok((paddr - base) / PAGE_SIZE)
    }

    pub(crate) fn page(&self, paddr: EpcPhysAddr) -> EpcResult<&EpcPage> {
        Ok(&self.pages[self.index(paddr)?])
    }

    pub(crate) fn epcm(&self, paddr: EpcPhysAddr) -> EpcResult<SpinMutexGuard<EpcmEntry>> {
        Ok(self.page(paddr)?.epcm.lock())
    }

    pub(crate) fn data(&self, paddr: EpcPhysAddr) -> EpcResult<SpinMutexGuard<Box<[u8; PAGE_SIZE]>>> {
        Ok(self.page(paddr)?.data.lock())
    }

    /// Takes a page out of the free pool. Its EPCM entry stays free until the
    /// caller assigns it.
    pub fn alloc(&self) -> EpcResult<EpcPhysAddr> {
        let idx = self
            .allocator
            .lock()
            .alloc()
            .ok_or_else(|| epc_err!(ENOMEM, "EPC is exhausted"))?;
        self.free_pages.fetch_sub(1, Ordering::AcqRel);
        let paddr = self.config.epc_base + idx * PAGE_SIZE;
        trace!("Allocate EPC page: {:#x}", paddr);
        Ok(paddr)
    }

    /// Scrubs the page, resets its EPCM entry and returns it to the pool.
    pub fn free(&self, paddr: EpcPhysAddr) -> EpcResult {
        let idx = self.index(paddr)?;
        let mut allocator = self.allocator.lock();
        if allocator.test(idx) {
            return epc_result_err!(
                EINVAL,
                format!("Epc::free(): {:#x} is already free", paddr)
            );
        }
        self.pages[idx].data.lock().fill(0);
        *self.pages[idx].epcm.lock() = EpcmEntry::empty();
        allocator.dealloc(idx);
        self.free_pages.fetch_add(1, Ordering::AcqRel);
        trace!("Deallocate EPC page: {:#x}", paddr);
        Ok(())
    }

    pub fn page_state(&self, paddr: EpcPhysAddr) -> EpcResult<EpcPageState> {
        Ok(self.epcm(paddr)?.state())
    }

    /// Returns a fresh version-array value. Values are unique for the life
    /// of the pool and zero (the empty-slot marker) is never handed out.
    pub(crate) fn next_nonce(&self) -> u64 {
        loop {
            let nonce = self.nonce.fetch_add(1, Ordering::AcqRel);
            if nonce != 0 {
                return nonce;
            }
        }
    }
}
