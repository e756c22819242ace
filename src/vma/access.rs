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
use core::cmp::min;

use spin::mutex::SpinMutexGuard;

use super::fault::FaultError;
use super::AccessError;
use crate::enclave::epcm::DEBUG_WORD_SIZE;
use crate::enclave::sgx::SgxTcs;
use crate::enclave::{Enclave, EnclaveMem};
use crate::memory::addr::{align_down, page_offset};
use crate::memory::epc::EpcPhysAddr;
use crate::memory::GuestVirtAddr;
use crate::stats::EnclaveStatsId;

impl From<FaultError> for AccessError {
    fn from(err: FaultError) -> Self {
        match err {
            FaultError::Busy => AccessError::Busy,
            FaultError::Violation => AccessError::Violation,
        }
    }
}

impl Enclave {
    pub(crate) fn debug_access(
        self: &Arc<Self>,
        addr: GuestVirtAddr,
        buf: &mut [u8],
        write: bool,
    ) -> Result<usize, AccessError> {
        if !self.is_debug() || !self.is_init() || self.is_dead() {
            return Err(AccessError::NotPermitted);
        }
        let len = buf.len();
        if addr.checked_add(len).is_none() {
            return Err(AccessError::Violation);
        }

        let mut i = 0;
        while i < len {
            let align = align_down_word(addr + i);
            let offset = addr + i - align;
            let cnt = min(DEBUG_WORD_SIZE - offset, len - i);
            if let Err(err) = self.access_word(align, offset, &mut buf[i..i + cnt], write) {
                debug!(
                    "Enclave::debug_access(): {:#x} failed after {} bytes: {:?}",
                    align, i, err
                );
                if i == 0 {
                    return Err(err);
                }
                break;
            }
            i += cnt;
        }

        let id = if write {
            EnclaveStatsId::DebugWrite
        } else {
            EnclaveStatsId::DebugRead
        };
        self.atomic_add_stats(id, i as u64);
        Ok(i)
    }

    /// Like `fault_in`, but waits out concurrent users of the page.
    fn reserve_page(
        self: &Arc<Self>,
        vaddr: GuestVirtAddr,
    ) -> Result<(SpinMutexGuard<'_, EnclaveMem>, EpcPhysAddr), AccessError> {
        let mut retries = self.epc().config().busy_retries;
        loop {
            match self.fault_in(vaddr) {
                Err(FaultError::Busy) if retries > 0 => {
                    retries -= 1;
                    core::hint::spin_loop();
                }
                res => return res.map_err(Into::into),
            }
        }
    }

    /// EDBGRD of the word at `align`, then EDBGWR of it with `bytes` spliced
    /// in at `offset` when writing.
    fn access_word(
        self: &Arc<Self>,
        align: GuestVirtAddr,
        offset: usize,
        bytes: &mut [u8],
        write: bool,
    ) -> Result<(), AccessError> {
        let vaddr = align_down(align);
        let page_off = page_offset(align);
        let (mem, paddr) = self.reserve_page(vaddr)?;
        let is_tcs = mem.pages.get(&vaddr).map_or(false, |page| page.is_tcs());

        if is_tcs && page_off > SgxTcs::GS_LIMIT_OFFSET {
            return Err(AccessError::Restricted);
        }
        let mut data = self.epc().edbgrd(paddr, page_off)?;

        if write {
            // Writing anything else than flags corrupts EENTER/EEXIT state.
            if is_tcs && page_off != SgxTcs::FLAGS_OFFSET {
                return Err(AccessError::Restricted);
            }
            data[offset..offset + bytes.len()].copy_from_slice(bytes);
            self.epc().edbgwr(paddr, page_off, &data)?;
        } else {
            bytes.copy_from_slice(&data[offset..offset + bytes.len()]);
        }
        Ok(())
    }
}

fn align_down_word(addr: GuestVirtAddr) -> GuestVirtAddr {
    addr & !(DEBUG_WORD_SIZE - 1)
}
