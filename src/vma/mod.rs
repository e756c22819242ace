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

//! The virtual-memory collaborator: what a host kernel calls when a process
//! maps an enclave, faults on it, peeks at it from a debugger, or unmaps it.

mod access;
mod fault;

use alloc::sync::Arc;

use crate::enclave::sgx::EnclaveErrorCode;
use crate::enclave::Enclave;
use crate::memory::GuestVirtAddr;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultOutcome {
    /// The translation is installed; resume the faulting context.
    Resolved,
    /// Another path owns the page right now; retry the fault without
    /// signalling the faulting context.
    Busy,
    /// Unmapped address, dead enclave or failed integrity check.
    Violation,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessError {
    /// The enclave is not a debug enclave, not initialized, or dead.
    NotPermitted,
    /// The range touches TCS fields a debugger may not see or change.
    Restricted,
    Violation,
    Busy,
}

impl From<EnclaveErrorCode> for AccessError {
    fn from(code: EnclaveErrorCode) -> Self {
        match code {
            EnclaveErrorCode::ELOCKFAIL | EnclaveErrorCode::EBLKSTATE => AccessError::Busy,
            _ => AccessError::Violation,
        }
    }
}

/// One mapping of an enclave into an address space.
///
/// Every live mapping holds a reference on the enclave; dropping the last
/// one tears the enclave down.
pub struct EnclaveVma {
    /// `None` for a mapping inherited across fork.
    enclave: Option<Arc<Enclave>>,
}

impl EnclaveVma {
    pub(crate) fn new(enclave: Arc<Enclave>) -> Self {
        Self {
            enclave: Some(enclave),
        }
    }

    /// A mapping that lost its enclave, as a forked child sees it.
    pub fn detached() -> Self {
        Self { enclave: None }
    }

    pub fn enclave(&self) -> Option<&Arc<Enclave>> {
        self.enclave.as_ref()
    }

    /// vma open: the mapping got split or copied.
    pub fn dup(&self) -> Self {
        if let Some(enclave) = &self.enclave {
            enclave.acquire_mapping();
        }
        Self {
            enclave: self.enclave.clone(),
        }
    }

    pub fn fault(&self, addr: GuestVirtAddr) -> FaultOutcome {
        match &self.enclave {
            Some(enclave) => enclave.handle_fault(addr),
            None => FaultOutcome::Violation,
        }
    }

    /// Reads `buf.len()` bytes at `addr`, or writes them when `write` is set,
    /// one machine word at a time. Returns how many bytes were transferred
    /// before the first failing word; fails only if nothing was transferred.
    pub fn access(
        &self,
        addr: GuestVirtAddr,
        buf: &mut [u8],
        write: bool,
    ) -> Result<usize, AccessError> {
        match &self.enclave {
            Some(enclave) => enclave.debug_access(addr, buf, write),
            None => Err(AccessError::Violation),
        }
    }
}

impl Drop for EnclaveVma {
    fn drop(&mut self) {
        if let Some(enclave) = self.enclave.take() {
            enclave.release_mapping();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::enclave::tests::*;
    use crate::memory::PAGE_SIZE;
    use crate::stats::EnclaveStatsId;
    use std::thread;

    #[test]
    fn test_last_close_invalidates() {
        let epc = new_epc(16);
        let enclave = build_enclave(&epc, 1);
        let vma = enclave.mmap().unwrap();
        let copy = vma.dup();
        assert_eq!(enclave.mapping_count(), 2);

        drop(vma);
        assert!(!enclave.is_dead());
        assert_eq!(copy.fault(BASE + 0x1000), FaultOutcome::Resolved);

        drop(copy);
        assert!(enclave.is_dead());
        assert_eq!(epc.free_pages(), 16);
        assert!(enclave.mmap().is_err());
    }

    #[test]
    fn test_detached_mapping() {
        let vma = EnclaveVma::detached();
        assert!(vma.enclave().is_none());
        assert_eq!(vma.fault(0x1000), FaultOutcome::Violation);
        let mut buf = [0; 8];
        assert_eq!(vma.access(0x1000, &mut buf, false), Err(AccessError::Violation));
        drop(vma.dup());
    }

    #[test]
    fn test_last_close_during_faults() {
        let epc = new_epc(16);
        let enclave = build_enclave(&epc, 2);
        let vma = enclave.mmap().unwrap();

        let faulters: Vec<_> = (0..4)
            .map(|i| {
                let enclave = enclave.clone();
                thread::spawn(move || {
                    let vaddr = BASE + (1 + i % 2) * PAGE_SIZE;
                    loop {
                        let _ = enclave.evict_page(vaddr);
                        match enclave.handle_fault(vaddr + 8) {
                            FaultOutcome::Resolved | FaultOutcome::Busy => {}
                            FaultOutcome::Violation => {
                                assert!(enclave.is_dead());
                                return;
                            }
                        }
                    }
                })
            })
            .collect();

        while enclave.stats(EnclaveStatsId::Reload).count() < 16 {
            thread::yield_now();
        }
        drop(vma);
        for faulter in faulters {
            faulter.join().unwrap();
        }

        assert!(enclave.is_dead());
        assert!(enclave.backing_store().is_empty());
        assert_eq!(epc.free_pages(), 16);
    }
}
