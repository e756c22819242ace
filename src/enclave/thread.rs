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

//! EENTER/EEXIT bookkeeping. Only what the pager depends on is modelled: the
//! TCS state word, which makes entry exclusive per TCS and keeps a busy TCS
//! from being written back, and the shoot-down tracking state.

use super::sgx::SgxTcs;
use super::{Enclave, EnclaveMem};
use crate::error::EpcResult;
use crate::memory::epc::{EpcPageState, EpcPhysAddr};
use crate::memory::GuestVirtAddr;
use crate::stats::EnclaveStatsId;

const TCS_STATE_INACTIVE: u64 = 0;
const TCS_STATE_ACTIVE: u64 = 1;

impl Enclave {
    fn get_tcs_paddr(
        &self,
        mem: &EnclaveMem,
        tcs_vaddr: GuestVirtAddr,
        cpuid: usize,
        is_enter: bool,
    ) -> EpcResult<EpcPhysAddr> {
        if cpuid >= self.epc.config().max_cpus {
            return epc_result_err!(
                EINVAL,
                format!("Enclave::get_tcs_paddr(): invalid cpu id {}", cpuid)
            );
        }
        let page = match mem.pages.get(&tcs_vaddr) {
            Some(page) if page.is_tcs() => page,
            _ => {
                return epc_result_err!(
                    EINVAL,
                    format!("Enclave::get_tcs_paddr(): no TCS at {:#x}", tcs_vaddr)
                )
            }
        };
        // A context already inside may always leave, even through a TCS
        // that is being evicted.
        match page.epc_paddr() {
            Some(paddr) if !is_enter => Ok(paddr),
            Some(paddr) if self.epc.page_state(paddr)? == EpcPageState::Assigned => Ok(paddr),
            _ => epc_result_err!(
                EBUSY,
                format!(
                    "Enclave::get_tcs_paddr(): TCS {:#x} is not resident: {:?}",
                    tcs_vaddr,
                    page.backing()
                )
            ),
        }
    }

    /// EENTER on the TCS at `tcs_vaddr` from logical processor `cpuid`.
    pub fn enter(&self, tcs_vaddr: GuestVirtAddr, cpuid: usize) -> EpcResult {
        let mut mem = self.lock_mem();
        if !self.is_init() {
            return epc_result_err!(
                EINVAL,
                "Enclave::enter(): enclave is not initialized"
            );
        }
        let tcs_paddr = self.get_tcs_paddr(&mem, tcs_vaddr, cpuid, true)?;
        let mut tracking_state = self.tracking_state.lock();
        if tracking_state.is_cpu_active(cpuid) {
            return epc_result_err!(
                EBUSY,
                format!("Enclave::enter(): cpu {} is already inside the enclave", cpuid)
            );
        }
        let mut tcs = self.epc.data(tcs_paddr)?;
        if SgxTcs::state_of(&tcs) != TCS_STATE_INACTIVE {
            return epc_result_err!(
                EBUSY,
                format!("Enclave::enter(): TCS {:#x} is already in use", tcs_vaddr)
            );
        }
        SgxTcs::set_state_of(&mut tcs, TCS_STATE_ACTIVE);
        if let Some(page) = mem.pages.get_mut(&tcs_vaddr) {
            page.set_entered_cpu(Some(cpuid));
        }
        tracking_state.update(true, cpuid);
        self.stats.add(EnclaveStatsId::Enter, 1);
        trace!("EENTER tcs {:#x} on cpu {}", tcs_vaddr, cpuid);
        Ok(())
    }

    /// EEXIT (or AEX) from the TCS at `tcs_vaddr`. The exit is accounted to
    /// the processor that entered, whatever `cpuid` reports.
    pub fn exit(&self, tcs_vaddr: GuestVirtAddr, cpuid: usize) -> EpcResult {
        let mut mem = self.lock_mem();
        let tcs_paddr = self.get_tcs_paddr(&mem, tcs_vaddr, cpuid, false)?;
        let mut tcs = self.epc.data(tcs_paddr)?;
        let entered_cpu = mem.pages.get(&tcs_vaddr).and_then(|page| page.entered_cpu());
        let entered_cpu = match entered_cpu {
            Some(entered_cpu) if SgxTcs::state_of(&tcs) == TCS_STATE_ACTIVE => entered_cpu,
            _ => {
                return epc_result_err!(
                    EINVAL,
                    format!("Enclave::exit(): TCS {:#x} is not active", tcs_vaddr)
                )
            }
        };
        if entered_cpu != cpuid {
            debug!(
                "Enclave::exit(): TCS {:#x} entered on cpu {}, exits on cpu {}",
                tcs_vaddr, entered_cpu, cpuid
            );
        }
        SgxTcs::set_state_of(&mut tcs, TCS_STATE_INACTIVE);
        drop(tcs);
        if let Some(page) = mem.pages.get_mut(&tcs_vaddr) {
            page.set_entered_cpu(None);
        }
        self.tracking_state.lock().update(false, entered_cpu);
        self.stats.add(EnclaveStatsId::Exit, 1);
        trace!("EEXIT tcs {:#x} on cpu {}", tcs_vaddr, entered_cpu);
        Ok(())
    }
}
