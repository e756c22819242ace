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

use alloc::sync::{Arc, Weak};
use core::mem::size_of;

use super::sgx::{EnclaveErrorCode, SgxEnclPageFlags, SgxEnclPageType, SgxSecInfo};
use super::Enclave;
use crate::error::EpcResult;
use crate::memory::epc::{Epc, EpcPageState, EpcPhysAddr};
use crate::memory::{GuestVirtAddr, PAGE_SIZE};

/// Granularity of EDBGRD/EDBGWR.
pub const DEBUG_WORD_SIZE: usize = size_of::<usize>();
pub type DebugWord = [u8; DEBUG_WORD_SIZE];

/// Enclave Page Cache Map Entry
#[derive(Debug)]
pub struct EpcmEntry {
    state: EpcPageState,
    /// R, W and X.
    perm: SgxEnclPageFlags,
    /// EPCM page type (PT_SECS, PT_TCS, PT_REG, PT_VA, PT_TRIM).
    page_type: SgxEnclPageType,
    /// Linear enclave address of the EPC page, 0 for SECS and VA pages.
    vaddr: GuestVirtAddr,
    /// The page is owned by the enclave's page set; this only points back.
    enclave: Weak<Enclave>,
    /// Shoot-down epoch that has to complete before the page may be written back.
    tracked_epoch: u64,
}

impl EpcmEntry {
    pub fn empty() -> Self {
        Self {
            state: EpcPageState::Free,
            perm: SgxEnclPageFlags::empty(),
            page_type: SgxEnclPageType::SECS,
            vaddr: 0,
            enclave: Weak::new(),
            tracked_epoch: 0,
        }
    }

    pub fn state(&self) -> EpcPageState {
        self.state
    }

    pub fn page_type(&self) -> SgxEnclPageType {
        self.page_type
    }

    pub fn vaddr(&self) -> GuestVirtAddr {
        self.vaddr
    }

    pub fn tracked_epoch(&self) -> u64 {
        self.tracked_epoch
    }

    pub fn owner(&self) -> Option<Arc<Enclave>> {
        self.enclave.upgrade()
    }

    pub fn sec_info(&self) -> SgxSecInfo {
        SgxSecInfo::new(self.perm, self.page_type)
    }

    fn is_blockable(&self) -> bool {
        matches!(self.page_type, SgxEnclPageType::REG | SgxEnclPageType::TCS)
    }
}

/// EPCM transitions. Callers hold the owning enclave's memory lock, so every
/// transition of one page is serialized.
impl Epc {
    /// EADD/ELDU/EPA: binds a free EPC page to `enclave`.
    pub(crate) fn epcm_add(
        &self,
        paddr: EpcPhysAddr,
        vaddr: GuestVirtAddr,
        sec_info: &SgxSecInfo,
        enclave: &Arc<Enclave>,
    ) -> EpcResult {
        let page_type = sec_info.page_type()?;
        let mut entry = self.epcm(paddr)?;
        if entry.state != EpcPageState::Free {
            return epc_result_err!(
                EINVAL,
                format!(
                    "Epc::epcm_add(): page ({:#x} -> {:#x}) is already in use",
                    vaddr, paddr
                )
            );
        }
        *entry = EpcmEntry {
            state: EpcPageState::Assigned,
            perm: sec_info.perm(),
            page_type,
            vaddr,
            enclave: Arc::downgrade(enclave),
            tracked_epoch: 0,
        };
        Ok(())
    }

    /// EBLOCK
    pub(crate) fn epcm_block(&self, paddr: EpcPhysAddr) -> Result<(), EnclaveErrorCode> {
        let mut entry = self.epcm(paddr).map_err(|_| EnclaveErrorCode::EPGINVLD)?;
        match entry.state {
            EpcPageState::Free => Err(EnclaveErrorCode::EPGINVLD),
            EpcPageState::Blocked | EpcPageState::Tracked => Err(EnclaveErrorCode::EBLKSTATE),
            EpcPageState::Assigned if !entry.is_blockable() => Err(EnclaveErrorCode::ENOTBLOCKABLE),
            EpcPageState::Assigned => {
                entry.state = EpcPageState::Blocked;
                Ok(())
            }
        }
    }

    /// Records that the blocked page is covered by shoot-down `epoch`.
    pub(crate) fn epcm_track(&self, paddr: EpcPhysAddr, epoch: u64) -> Result<(), EnclaveErrorCode> {
        let mut entry = self.epcm(paddr).map_err(|_| EnclaveErrorCode::EPGINVLD)?;
        match entry.state {
            EpcPageState::Blocked | EpcPageState::Tracked => {
                entry.state = EpcPageState::Tracked;
                entry.tracked_epoch = epoch;
                Ok(())
            }
            _ => Err(EnclaveErrorCode::EPAGENOTBLOCKED),
        }
    }

    /// Cancels a pending eviction.
    pub(crate) fn epcm_unblock(&self, paddr: EpcPhysAddr) -> EpcResult {
        let mut entry = self.epcm(paddr)?;
        if matches!(entry.state, EpcPageState::Blocked | EpcPageState::Tracked) {
            entry.state = EpcPageState::Assigned;
            entry.tracked_epoch = 0;
        }
        Ok(())
    }

    pub fn query_sec_info(&self, paddr: EpcPhysAddr) -> EpcResult<SgxSecInfo> {
        let entry = self.epcm(paddr)?;
        if entry.state == EpcPageState::Free {
            return epc_result_err!(
                EINVAL,
                format!("Epc::query_sec_info(): {:#x} is not assigned", paddr)
            );
        }
        Ok(entry.sec_info())
    }

    fn debug_target(&self, paddr: EpcPhysAddr, offset: usize) -> Result<(), EnclaveErrorCode> {
        let entry = self.epcm(paddr).map_err(|_| EnclaveErrorCode::EPGINVLD)?;
        if offset % DEBUG_WORD_SIZE != 0 || offset >= PAGE_SIZE {
            return Err(EnclaveErrorCode::EPGINVLD);
        }
        match entry.state {
            EpcPageState::Free => Err(EnclaveErrorCode::EPGINVLD),
            EpcPageState::Blocked | EpcPageState::Tracked => Err(EnclaveErrorCode::ELOCKFAIL),
            EpcPageState::Assigned if entry.page_type == SgxEnclPageType::SECS => {
                Err(EnclaveErrorCode::EPGISSECS)
            }
            EpcPageState::Assigned if entry.page_type == SgxEnclPageType::VA => {
                Err(EnclaveErrorCode::EPGINVLD)
            }
            EpcPageState::Assigned => Ok(()),
        }
    }

    /// EDBGRD: reads one aligned word of a debug enclave's page.
    pub(crate) fn edbgrd(&self, paddr: EpcPhysAddr, offset: usize) -> Result<DebugWord, EnclaveErrorCode> {
        self.debug_target(paddr, offset)?;
        let data = self.data(paddr).map_err(|_| EnclaveErrorCode::EPGINVLD)?;
        let mut word = [0; DEBUG_WORD_SIZE];
        word.copy_from_slice(&data[offset..offset + DEBUG_WORD_SIZE]);
        Ok(word)
    }

    /// EDBGWR: writes one aligned word of a debug enclave's page.
    pub(crate) fn edbgwr(
        &self,
        paddr: EpcPhysAddr,
        offset: usize,
        word: &DebugWord,
    ) -> Result<(), EnclaveErrorCode> {
        self.debug_target(paddr, offset)?;
        let mut data = self.data(paddr).map_err(|_| EnclaveErrorCode::EPGINVLD)?;
        data[offset..offset + DEBUG_WORD_SIZE].copy_from_slice(word);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PagerConfig;
    use crate::enclave::reclaim::RECLAIM_KEY_LEN;
    use crate::enclave::sgx::{SgxAttributeFlags, SgxSecs};

    fn setup() -> (Arc<Epc>, Arc<Enclave>) {
        let epc = Epc::new(PagerConfig {
            reclaim_key: [0x5c; RECLAIM_KEY_LEN],
            ..Default::default()
        })
        .unwrap();
        let secs = SgxSecs::new(0x10_0000, 0x10_0000, 1, SgxAttributeFlags::DEBUG | SgxAttributeFlags::MODE64BIT);
        let enclave = Enclave::create(&epc, &secs).unwrap();
        (epc, enclave)
    }

    #[test]
    fn test_block_track_unblock() {
        let (epc, enclave) = setup();
        let paddr = epc.alloc().unwrap();
        let sec_info = SgxSecInfo::new(SgxEnclPageFlags::R, SgxEnclPageType::REG);
        assert!(epc.query_sec_info(paddr).is_err());
        epc.epcm_add(paddr, 0x10_1000, &sec_info, &enclave).unwrap();
        assert!(epc.epcm_add(paddr, 0x10_1000, &sec_info, &enclave).is_err());
        assert!(epc.query_sec_info(paddr).unwrap() == sec_info);

        assert_eq!(epc.epcm_track(paddr, 1), Err(EnclaveErrorCode::EPAGENOTBLOCKED));
        epc.epcm_block(paddr).unwrap();
        assert_eq!(epc.epcm_block(paddr), Err(EnclaveErrorCode::EBLKSTATE));
        epc.epcm_track(paddr, 3).unwrap();
        assert_eq!(epc.epcm(paddr).unwrap().tracked_epoch(), 3);
        assert_eq!(epc.page_state(paddr).unwrap(), EpcPageState::Tracked);

        epc.epcm_unblock(paddr).unwrap();
        assert_eq!(epc.page_state(paddr).unwrap(), EpcPageState::Assigned);
        assert!(Arc::ptr_eq(&epc.epcm(paddr).unwrap().owner().unwrap(), &enclave));
        epc.free(paddr).unwrap();
    }

    #[test]
    fn test_va_page_is_not_blockable() {
        let (epc, enclave) = setup();
        let paddr = epc.alloc().unwrap();
        let sec_info = SgxSecInfo::new(SgxEnclPageFlags::empty(), SgxEnclPageType::VA);
        epc.epcm_add(paddr, 0, &sec_info, &enclave).unwrap();
        assert_eq!(epc.epcm_block(paddr), Err(EnclaveErrorCode::ENOTBLOCKABLE));
        assert_eq!(epc.edbgrd(paddr, 0), Err(EnclaveErrorCode::EPGINVLD));
        epc.free(paddr).unwrap();
    }

    #[test]
    fn test_debug_word_access() {
        let (epc, enclave) = setup();
        let paddr = epc.alloc().unwrap();
        let sec_info = SgxSecInfo::new(SgxEnclPageFlags::R | SgxEnclPageFlags::W, SgxEnclPageType::REG);
        epc.epcm_add(paddr, 0x10_2000, &sec_info, &enclave).unwrap();

        let word = [0xab; DEBUG_WORD_SIZE];
        epc.edbgwr(paddr, DEBUG_WORD_SIZE, &word).unwrap();
        assert_eq!(epc.edbgrd(paddr, DEBUG_WORD_SIZE), Ok(word));
        assert_eq!(epc.edbgrd(paddr, 0), Ok([0; DEBUG_WORD_SIZE]));
        assert_eq!(epc.edbgrd(paddr, 3), Err(EnclaveErrorCode::EPGINVLD));

        epc.epcm_block(paddr).unwrap();
        assert_eq!(epc.edbgrd(paddr, 0), Err(EnclaveErrorCode::ELOCKFAIL));
        epc.free(paddr).unwrap();
    }
}
