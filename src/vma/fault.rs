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

use alloc::sync::Arc;

use spin::mutex::SpinMutexGuard;

use super::FaultOutcome;
use crate::enclave::page::PageBacking;
use crate::enclave::reclaim::ReloadError;
use crate::enclave::{Enclave, EnclaveMem};
use crate::memory::addr::align_down;
use crate::memory::epc::{EpcPageState, EpcPhysAddr};
use crate::memory::{GuestVirtAddr, MemFlags, PagingError};
use crate::stats::EnclaveStatsId;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum FaultError {
    Busy,
    Violation,
}

impl From<ReloadError> for FaultError {
    fn from(err: ReloadError) -> Self {
        match err {
            ReloadError::OutOfEpc => FaultError::Busy,
            ReloadError::Integrity | ReloadError::Dead => FaultError::Violation,
        }
    }
}

impl Enclave {
    pub(crate) fn handle_fault(self: &Arc<Self>, addr: GuestVirtAddr) -> FaultOutcome {
        self.atomic_add_stats(EnclaveStatsId::Fault, 1);
        let outcome = if self.elrange().contains(&addr) {
            let vaddr = align_down(addr);
            match self.fault_in(vaddr) {
                Ok((mut mem, paddr)) => Self::install(&mut mem, vaddr, paddr),
                Err(FaultError::Busy) => FaultOutcome::Busy,
                Err(FaultError::Violation) => FaultOutcome::Violation,
            }
        } else {
            FaultOutcome::Violation
        };
        match outcome {
            FaultOutcome::Busy => self.atomic_add_stats(EnclaveStatsId::FaultBusy, 1),
            FaultOutcome::Violation => {
                self.atomic_add_stats(EnclaveStatsId::FaultViolation, 1);
                debug!("Enclave {:#x}: fault at {:#x} is a violation", self.id(), addr);
            }
            FaultOutcome::Resolved => {}
        }
        outcome
    }

    fn install(mem: &mut EnclaveMem, vaddr: GuestVirtAddr, paddr: EpcPhysAddr) -> FaultOutcome {
        let flags = match mem.pages.get(&vaddr) {
            Some(page) => MemFlags::from(page.sec_info()),
            None => return FaultOutcome::Violation,
        };
        match mem.gpt.map(vaddr, paddr, flags) {
            Ok(()) | Err(PagingError::AlreadyMapped(_)) => FaultOutcome::Resolved,
            Err(err) => {
                warn!("Enclave::install(): {:?}", err);
                FaultOutcome::Violation
            }
        }
    }

    /// Makes the page at `vaddr` resident and returns it together with the
    /// enclave lock, so the caller can use it before anyone evicts it again.
    ///
    /// The lock is dropped while the sealed copy is verified; concurrent
    /// faults on the same page see it loading and get `Busy`.
    pub(crate) fn fault_in(
        self: &Arc<Self>,
        vaddr: GuestVirtAddr,
    ) -> Result<(SpinMutexGuard<'_, EnclaveMem>, EpcPhysAddr), FaultError> {
        let mut mem = self.lock_mem();
        if self.is_dead() {
            return Err(FaultError::Violation);
        }
        let (backing, sec_info) = match mem.pages.get(&vaddr) {
            Some(page) => (page.backing(), *page.sec_info()),
            None => return Err(FaultError::Violation),
        };
        let slot = match backing {
            PageBacking::Resident(paddr) => {
                return match self.epc().page_state(paddr) {
                    Ok(EpcPageState::Assigned) => Ok((mem, paddr)),
                    Ok(EpcPageState::Blocked) | Ok(EpcPageState::Tracked) => Err(FaultError::Busy),
                    _ => Err(FaultError::Violation),
                };
            }
            PageBacking::Loading(_) => return Err(FaultError::Busy),
            PageBacking::Evicted(slot) => slot,
        };

        let (paddr, version) = self.reclaim_for_reload(&mut mem, vaddr, slot)?;
        drop(mem);

        let contents = self.unseal_page(vaddr, version, &sec_info);

        let mut mem = self.lock_mem();
        self.finish_reload(&mut mem, vaddr, paddr, slot, contents)?;
        Ok((mem, paddr))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::enclave::tests::*;
    use crate::enclave::EnclavePageState;
    use crate::memory::PAGE_SIZE;

    #[test]
    fn test_fault_resident_page() {
        let epc = new_epc(16);
        let enclave = build_enclave(&epc, 1);
        assert_eq!(enclave.handle_fault(BASE + PAGE_SIZE + 0x123), FaultOutcome::Resolved);
        assert_eq!(enclave.handle_fault(BASE + 2 * PAGE_SIZE), FaultOutcome::Violation);
        assert_eq!(enclave.handle_fault(BASE - 1), FaultOutcome::Violation);
        assert_eq!(enclave.stats(EnclaveStatsId::Fault).count(), 3);
        assert_eq!(enclave.stats(EnclaveStatsId::FaultViolation).count(), 2);
    }

    #[test]
    fn test_fault_reloads_evicted_page() {
        let epc = new_epc(16);
        let enclave = build_enclave(&epc, 1);
        let vaddr = BASE + PAGE_SIZE;
        enclave.evict_page(vaddr).unwrap();
        assert_eq!(enclave.page_state(vaddr), Some(EnclavePageState::Evicted));
        assert!(enclave.translate(vaddr).is_err());

        assert_eq!(enclave.handle_fault(vaddr), FaultOutcome::Resolved);
        assert_eq!(enclave.page_state(vaddr), Some(EnclavePageState::Resident));
        let paddr = enclave.epc_page(vaddr).unwrap();
        assert_eq!(enclave.translate(vaddr).unwrap().0, paddr);
        assert!(epc.data(paddr).unwrap().iter().all(|b| *b == 1));
        assert!(enclave.backing_store().is_empty());
        assert_eq!(enclave.stats(EnclaveStatsId::Reload).count(), 1);
    }

    #[test]
    fn test_blocked_page_is_busy() {
        let epc = new_epc(16);
        let enclave = build_enclave(&epc, 1);
        let vaddr = BASE + PAGE_SIZE;
        enclave.enter(BASE, 0).unwrap();
        assert!(enclave.evict_page(vaddr).is_err());
        assert_eq!(enclave.page_state(vaddr), Some(EnclavePageState::Tracked));
        assert_eq!(enclave.handle_fault(vaddr), FaultOutcome::Busy);

        enclave.cancel_eviction(vaddr).unwrap();
        assert_eq!(enclave.handle_fault(vaddr), FaultOutcome::Resolved);
        enclave.exit(BASE, 0).unwrap();
    }

    #[test]
    fn test_tampered_slot_is_violation() {
        let epc = new_epc(16);
        let enclave = build_enclave(&epc, 1);
        let vaddr = BASE + PAGE_SIZE;
        enclave.evict_page(vaddr).unwrap();
        let slot = match enclave.lock_mem().pages.get(&vaddr).unwrap().backing() {
            PageBacking::Evicted(slot) => slot,
            backing => panic!("unexpected backing {:?}", backing),
        };
        let version = epc.va_slot(slot).unwrap();
        assert_ne!(version, 0);
        epc.set_va_slot(slot, version + 1).unwrap();

        let free = epc.free_pages();
        assert_eq!(enclave.handle_fault(vaddr), FaultOutcome::Violation);
        assert_eq!(enclave.page_state(vaddr), Some(EnclavePageState::Evicted));
        assert_eq!(epc.free_pages(), free);
        assert_eq!(enclave.stats(EnclaveStatsId::ReloadMacFail).count(), 1);

        // Putting the right value back makes the copy loadable again.
        epc.set_va_slot(slot, version).unwrap();
        assert_eq!(enclave.handle_fault(vaddr), FaultOutcome::Resolved);
        assert_eq!(epc.va_slot(slot).unwrap(), 0);
    }

    #[test]
    fn test_reload_without_free_epc_is_busy() {
        // SECS, TCS, one regular page and the version array.
        let epc = new_epc(5);
        let enclave = build_enclave(&epc, 1);
        let vaddr = BASE + PAGE_SIZE;
        enclave.evict_page(vaddr).unwrap();
        let taken = [epc.alloc().unwrap(), epc.alloc().unwrap()];
        assert_eq!(epc.free_pages(), 0);

        assert_eq!(enclave.handle_fault(vaddr), FaultOutcome::Busy);
        assert_eq!(enclave.page_state(vaddr), Some(EnclavePageState::Evicted));

        epc.free(taken[0]).unwrap();
        assert_eq!(enclave.handle_fault(vaddr), FaultOutcome::Resolved);
        assert_eq!(enclave.page_state(vaddr), Some(EnclavePageState::Resident));
        epc.free(taken[1]).unwrap();
    }
}
