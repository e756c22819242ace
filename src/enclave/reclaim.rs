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

//! EPC page reclaiming: EBLOCK, ETRACK and EWB on the way out, ELDU on the
//! way back in.
//!
//! An evicted page leaves two things behind: its sealed contents and PCMD in
//! the untrusted [`BackingStore`], and the version value in a Version Array
//! slot inside the EPC. The value is fresh for every eviction and is part of
//! the AES-GCM nonce, so a stale copy cannot be loaded once the slot moved on.

use alloc::{boxed::Box, collections::BTreeMap, sync::Arc};
use core::mem::size_of;

use aes_gcm::{AeadInPlace, Aes128Gcm, KeyInit, Nonce, Tag};

use super::page::{PageBacking, VaSlotRef};
use super::sgx::{read_u64, EnclaveErrorCode, SgxEnclPageType, SgxPcmd, SgxSecInfo, SgxTcs};
use super::{Enclave, EnclaveMem};
use crate::error::{EpcError, EpcResult};
use crate::memory::epc::{Epc, EpcPageState, EpcPhysAddr};
use crate::memory::{GuestVirtAddr, PAGE_SIZE};
use crate::stats::EnclaveStatsId;

pub const RECLAIM_KEY_LEN: usize = 16;
pub const RECLAIM_NONCE_LEN: usize = 12;

pub type NonceValue = u64;

/// Number of version slots in one VA page.
pub const VA_SLOTS_PER_PAGE: usize = PAGE_SIZE / size_of::<NonceValue>();

#[derive(Debug)]
pub enum EvictError {
    /// Not possible yet; retry later.
    Deferred(EnclaveErrorCode),
    Failed(EpcError),
}

impl From<EpcError> for EvictError {
    fn from(err: EpcError) -> Self {
        EvictError::Failed(err)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReloadError {
    /// No free EPC page to load into.
    OutOfEpc,
    /// The sealed copy is missing, tampered with or stale.
    Integrity,
    /// The enclave was torn down while the page was being loaded.
    Dead,
}

/// Sealed contents and metadata of one evicted page.
#[derive(Clone)]
pub struct SwappedPage {
    pub contents: Box<[u8; PAGE_SIZE]>,
    pub pcmd: SgxPcmd,
}

/// Untrusted memory holding evicted pages, keyed by enclave linear address.
#[derive(Default)]
pub struct BackingStore {
    pages: BTreeMap<GuestVirtAddr, SwappedPage>,
}

impl BackingStore {
    pub fn insert(&mut self, vaddr: GuestVirtAddr, page: SwappedPage) {
        self.pages.insert(vaddr, page);
    }

    pub fn get(&self, vaddr: GuestVirtAddr) -> Option<&SwappedPage> {
        self.pages.get(&vaddr)
    }

    pub fn get_mut(&mut self, vaddr: GuestVirtAddr) -> Option<&mut SwappedPage> {
        self.pages.get_mut(&vaddr)
    }

    pub fn remove(&mut self, vaddr: GuestVirtAddr) -> Option<SwappedPage> {
        self.pages.remove(&vaddr)
    }

    pub fn len(&self) -> usize {
        self.pages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pages.is_empty()
    }

    pub fn clear(&mut self) {
        self.pages.clear();
    }
}

/// PCMD without the MAC, followed by the linear address.
const AAD_LEN: usize = SgxPcmd::MAC_OFFSET + size_of::<u64>();

struct PageCrypto {
    cipher: Aes128Gcm,
    nonce: [u8; RECLAIM_NONCE_LEN],
    aad: [u8; AAD_LEN],
}

impl PageCrypto {
    fn new(
        key: &[u8; RECLAIM_KEY_LEN],
        version: NonceValue,
        pcmd: &SgxPcmd,
        vaddr: GuestVirtAddr,
    ) -> EpcResult<Self> {
        let cipher = Aes128Gcm::new_from_slice(key)
            .map_err(|_| epc_err!(EINVAL, "invalid reclaim key length"))?;
        let mut nonce = [0; RECLAIM_NONCE_LEN];
        nonce[..size_of::<NonceValue>()].copy_from_slice(&version.to_le_bytes());
        let mut aad = [0; AAD_LEN];
        let metadata = pcmd.authenticated_bytes();
        aad[..metadata.len()].copy_from_slice(metadata);
        aad[metadata.len()..].copy_from_slice(&(vaddr as u64).to_le_bytes());
        Ok(Self { cipher, nonce, aad })
    }

    /// Encrypts `contents` in place and stores the tag into `pcmd.mac`.
    fn seal(&self, contents: &mut [u8; PAGE_SIZE], pcmd: &mut SgxPcmd) -> EpcResult {
        let tag = self
            .cipher
            .encrypt_in_place_detached(Nonce::from_slice(&self.nonce), &self.aad, contents)
            .map_err(|_| epc_err!(EIO, "failed to seal EPC page"))?;
        pcmd.mac.copy_from_slice(tag.as_slice());
        Ok(())
    }

    fn unseal(&self, contents: &mut [u8; PAGE_SIZE], pcmd: &SgxPcmd) -> Result<(), ReloadError> {
        self.cipher
            .decrypt_in_place_detached(
                Nonce::from_slice(&self.nonce),
                &self.aad,
                contents,
                Tag::from_slice(&pcmd.mac),
            )
            .map_err(|_| ReloadError::Integrity)
    }
}

impl Epc {
    fn check_va_slot(&self, slot: VaSlotRef) -> EpcResult {
        let entry = self.epcm(slot.va_page)?;
        if entry.state() != EpcPageState::Assigned
            || entry.page_type() != SgxEnclPageType::VA
            || slot.index >= VA_SLOTS_PER_PAGE
        {
            return epc_result_err!(EINVAL, format!("invalid VA slot {:#x?}", slot));
        }
        Ok(())
    }

    pub(crate) fn va_slot(&self, slot: VaSlotRef) -> EpcResult<NonceValue> {
        self.check_va_slot(slot)?;
        let data = self.data(slot.va_page)?;
        Ok(read_u64(&data[..], slot.index * size_of::<NonceValue>()))
    }

    pub(crate) fn set_va_slot(&self, slot: VaSlotRef, value: NonceValue) -> EpcResult {
        self.check_va_slot(slot)?;
        let offset = slot.index * size_of::<NonceValue>();
        self.data(slot.va_page)?[offset..offset + size_of::<NonceValue>()]
            .copy_from_slice(&value.to_le_bytes());
        Ok(())
    }

    /// Evicts whatever logical page `paddr` currently backs, found through
    /// the EPCM back-reference.
    pub fn evict(&self, paddr: EpcPhysAddr) -> Result<(), EvictError> {
        let (owner, vaddr) = {
            let entry = self.epcm(paddr)?;
            let owner = entry.owner().ok_or_else(|| {
                epc_err!(EINVAL, format!("Epc::evict(): {:#x} has no owner", paddr))
            })?;
            (owner, entry.vaddr())
        };
        owner.evict_resident(vaddr, Some(paddr))
    }
}

impl EnclaveMem {
    fn find_free_va_slot(&self, epc: &Epc) -> EpcResult<VaSlotRef> {
        for &va_page in &self.va_pages {
            let data = epc.data(va_page)?;
            let index = data
                .chunks_exact(size_of::<NonceValue>())
                .position(|slot| slot.iter().all(|b| *b == 0));
            if let Some(index) = index {
                return Ok(VaSlotRef { va_page, index });
            }
        }
        epc_result_err!(ENOMEM, "no free version array slot")
    }
}

impl Enclave {
    /// Drives the resident page at `vaddr` one or more steps along
    /// ASSIGNED -> BLOCKED -> TRACKED -> EVICTED, stopping with
    /// `EvictError::Deferred` when a step has to wait for execution contexts
    /// to leave the enclave. Calling it again resumes where it stopped.
    pub fn evict_page(&self, vaddr: GuestVirtAddr) -> Result<(), EvictError> {
        self.evict_resident(vaddr, None)
    }

    pub(crate) fn evict_resident(
        &self,
        vaddr: GuestVirtAddr,
        expected: Option<EpcPhysAddr>,
    ) -> Result<(), EvictError> {
        let mut mem = self.lock_mem();
        if self.is_dead() {
            return Err(epc_err!(EINVAL, "enclave is dead").into());
        }
        let page = mem.pages.get(&vaddr).ok_or_else(|| {
            epc_err!(
                ENOENT,
                format!("Enclave::evict_page(): no page at {:#x}", vaddr)
            )
        })?;
        let paddr = match (page.backing(), expected) {
            (PageBacking::Resident(paddr), None) => paddr,
            (PageBacking::Resident(paddr), Some(expected)) if paddr == expected => paddr,
            (backing, _) => {
                return Err(epc_err!(
                    EINVAL,
                    format!(
                        "Enclave::evict_page(): {:#x} is not resident at the expected page: {:?}",
                        vaddr, backing
                    )
                )
                .into())
            }
        };
        if !matches!(page.page_type(), SgxEnclPageType::REG | SgxEnclPageType::TCS) {
            return Err(epc_err!(
                EINVAL,
                format!("Enclave::evict_page(): {:?} page can't be evicted", page.page_type())
            )
            .into());
        }

        let res = self.evict_steps(&mut mem, vaddr, paddr);
        match &res {
            Err(EvictError::Deferred(code)) => {
                self.stats.add(EnclaveStatsId::WriteBackDeferred, 1);
                debug!(
                    "Enclave::evict_page(): {:#x} deferred: {}",
                    vaddr,
                    code.as_str()
                );
            }
            Err(EvictError::Failed(err)) => {
                warn!("Enclave::evict_page(): {:#x} failed: {:?}", vaddr, err);
                // Still backed by `paddr` means write-back never happened.
                if mem.pages.get(&vaddr).and_then(|page| page.epc_paddr()) == Some(paddr) {
                    self.unblock(&mut mem, vaddr, paddr)?;
                }
            }
            Ok(()) => {}
        }
        res
    }

    fn evict_steps(
        &self,
        mem: &mut EnclaveMem,
        vaddr: GuestVirtAddr,
        paddr: EpcPhysAddr,
    ) -> Result<(), EvictError> {
        loop {
            match self.epc.page_state(paddr)? {
                EpcPageState::Assigned => {
                    // Nothing to write back into: leave the page untouched.
                    mem.find_free_va_slot(&self.epc)?;
                    self.block(mem, vaddr, paddr)?
                }
                EpcPageState::Blocked => self.track(paddr)?,
                EpcPageState::Tracked => return self.write_back(mem, vaddr, paddr),
                EpcPageState::Free => {
                    return Err(epc_err!(
                        EFAULT,
                        format!("resident page {:#x} -> {:#x} is free in EPCM", vaddr, paddr)
                    )
                    .into())
                }
            }
        }
    }

    /// EBLOCK: no new translation to the page may be created from now on.
    fn block(
        &self,
        mem: &mut EnclaveMem,
        vaddr: GuestVirtAddr,
        paddr: EpcPhysAddr,
    ) -> Result<(), EvictError> {
        self.epc.epcm_block(paddr).map_err(EvictError::Deferred)?;
        // A page that was never faulted in has nothing to hide.
        let _ = mem.gpt.set_notpresent(vaddr);
        self.stats.add(EnclaveStatsId::Block, 1);
        trace!("EBLOCK {:#x} -> {:#x}", vaddr, paddr);
        Ok(())
    }

    /// ETRACK: opens a shoot-down epoch covering the blocked page.
    fn track(&self, paddr: EpcPhysAddr) -> Result<(), EvictError> {
        let epoch = self
            .tracking_state
            .lock()
            .activate()
            .ok_or(EvictError::Deferred(EnclaveErrorCode::EPREVTRKINCMPL))?;
        self.epc
            .epcm_track(paddr, epoch)
            .map_err(EvictError::Deferred)?;
        self.stats.add(EnclaveStatsId::Track, 1);
        trace!("ETRACK {:#x} epoch {}", paddr, epoch);
        Ok(())
    }

    /// EWB: seals the page into the backing store and frees the EPC page.
    fn write_back(
        &self,
        mem: &mut EnclaveMem,
        vaddr: GuestVirtAddr,
        paddr: EpcPhysAddr,
    ) -> Result<(), EvictError> {
        let (sec_info, epoch) = {
            let entry = self.epc.epcm(paddr)?;
            (entry.sec_info(), entry.tracked_epoch())
        };
        if !self.tracking_state.lock().is_epoch_done(epoch) {
            return Err(EvictError::Deferred(EnclaveErrorCode::ENOTTRACKED));
        }

        let mut contents = Box::new([0; PAGE_SIZE]);
        contents.copy_from_slice(&self.epc.data(paddr)?[..]);
        if sec_info.page_type()? == SgxEnclPageType::TCS && SgxTcs::state_of(&contents) != 0 {
            return Err(EvictError::Deferred(EnclaveErrorCode::EENCLAVEACT));
        }

        let slot = mem.find_free_va_slot(&self.epc)?;
        let version = self.epc.next_nonce();
        let mut pcmd = SgxPcmd::new(sec_info, self.id as u64);
        PageCrypto::new(&self.epc.config().reclaim_key, version, &pcmd, vaddr)?
            .seal(&mut contents, &mut pcmd)?;

        self.epc.set_va_slot(slot, version)?;
        let _ = mem.gpt.unmap(vaddr);
        if let Some(page) = mem.pages.get_mut(&vaddr) {
            page.set_backing(PageBacking::Evicted(slot));
        }
        self.epc.free(paddr)?;
        self.backing.lock().insert(vaddr, SwappedPage { contents, pcmd });
        self.stats.add(EnclaveStatsId::WriteBack, 1);
        debug!("EWB {:#x} -> {:#x} slot {:x?}", vaddr, paddr, slot);
        Ok(())
    }

    /// Returns a blocked or tracked page to the ASSIGNED state.
    pub fn cancel_eviction(&self, vaddr: GuestVirtAddr) -> EpcResult {
        let mut mem = self.lock_mem();
        let paddr = match mem.pages.get(&vaddr).and_then(|page| page.epc_paddr()) {
            Some(paddr) => paddr,
            None => return Ok(()),
        };
        self.unblock(&mut mem, vaddr, paddr)
    }

    fn unblock(&self, mem: &mut EnclaveMem, vaddr: GuestVirtAddr, paddr: EpcPhysAddr) -> EpcResult {
        if !matches!(
            self.epc.page_state(paddr)?,
            EpcPageState::Blocked | EpcPageState::Tracked
        ) {
            return Ok(());
        }
        self.epc.epcm_unblock(paddr)?;
        let _ = mem.gpt.set_present(vaddr);
        self.stats.add(EnclaveStatsId::WriteBackCancel, 1);
        trace!("unblocked {:#x} -> {:#x}", vaddr, paddr);
        Ok(())
    }

    /// `evict_page` with bounded exponential back-off. A page that still
    /// can't be written back after the last attempt is left resident.
    pub fn evict_with_retry(&self, vaddr: GuestVirtAddr) -> Result<(), EvictError> {
        let config = self.epc.config();
        let mut spins = config.backoff_spins;
        let mut last = EnclaveErrorCode::ENOTTRACKED;
        for attempt in 0..config.evict_retries {
            match self.evict_page(vaddr) {
                Err(EvictError::Deferred(code)) => last = code,
                res => return res,
            }
            if attempt + 1 < config.evict_retries {
                for _ in 0..spins {
                    core::hint::spin_loop();
                }
                spins = spins.saturating_mul(2);
            }
        }
        warn!(
            "Enclave::evict_with_retry(): giving up on {:#x}: {}",
            vaddr,
            last.as_str()
        );
        self.cancel_eviction(vaddr)?;
        Err(EvictError::Deferred(last))
    }

    /// ELDU: allocates an EPC page for the evicted page at `vaddr` and marks
    /// it as loading. The returned slot value is the one the sealed copy has
    /// to verify against.
    pub(crate) fn reclaim_for_reload(
        &self,
        mem: &mut EnclaveMem,
        vaddr: GuestVirtAddr,
        slot: VaSlotRef,
    ) -> Result<(EpcPhysAddr, NonceValue), ReloadError> {
        let version = self.epc.va_slot(slot).map_err(|_| ReloadError::Integrity)?;
        let paddr = self.epc.alloc().map_err(|_| ReloadError::OutOfEpc)?;
        if let Some(page) = mem.pages.get_mut(&vaddr) {
            page.set_backing(PageBacking::Loading(slot));
        }
        Ok((paddr, version))
    }

    /// Verifies and decrypts the sealed copy of `vaddr` without holding the
    /// enclave lock.
    pub(crate) fn unseal_page(
        &self,
        vaddr: GuestVirtAddr,
        version: NonceValue,
        sec_info: &SgxSecInfo,
    ) -> Result<Box<[u8; PAGE_SIZE]>, ReloadError> {
        let swapped = self
            .backing
            .lock()
            .get(vaddr)
            .cloned()
            .ok_or(ReloadError::Integrity)?;
        if swapped.pcmd.enclave_id != self.id as u64 || swapped.pcmd.secinfo != *sec_info {
            return Err(ReloadError::Integrity);
        }
        let mut contents = swapped.contents;
        PageCrypto::new(&self.epc.config().reclaim_key, version, &swapped.pcmd, vaddr)
            .map_err(|_| ReloadError::Integrity)?
            .unseal(&mut contents, &swapped.pcmd)?;
        Ok(contents)
    }

    /// Completes a reload under the enclave lock: installs the verified
    /// contents in `paddr`, or gives `paddr` back and restores the evicted
    /// state on failure.
    pub(crate) fn finish_reload(
        self: &Arc<Self>,
        mem: &mut EnclaveMem,
        vaddr: GuestVirtAddr,
        paddr: EpcPhysAddr,
        slot: VaSlotRef,
        contents: Result<Box<[u8; PAGE_SIZE]>, ReloadError>,
    ) -> Result<(), ReloadError> {
        let loading = mem
            .pages
            .get(&vaddr)
            .map_or(false, |page| page.backing() == PageBacking::Loading(slot));
        if self.is_dead() || !loading {
            let _ = self.epc.free(paddr);
            return Err(ReloadError::Dead);
        }
        let contents = match contents {
            Ok(contents) => contents,
            Err(err) => {
                let _ = self.epc.free(paddr);
                if let Some(page) = mem.pages.get_mut(&vaddr) {
                    page.set_backing(PageBacking::Evicted(slot));
                }
                self.stats.add(EnclaveStatsId::ReloadMacFail, 1);
                warn!("ELDU {:#x} failed: {:?}", vaddr, err);
                return Err(err);
            }
        };

        let sec_info = match mem.pages.get(&vaddr) {
            Some(page) => *page.sec_info(),
            None => return Err(ReloadError::Dead),
        };
        let installed = self
            .epc
            .data(paddr)
            .map(|mut data| data.copy_from_slice(&contents[..]))
            .and_then(|_| self.epc.epcm_add(paddr, vaddr, &sec_info, self))
            .and_then(|_| self.epc.set_va_slot(slot, 0));
        if let Err(err) = installed {
            error!("ELDU {:#x} -> {:#x}: {:?}", vaddr, paddr, err);
            let _ = self.epc.free(paddr);
            if let Some(page) = mem.pages.get_mut(&vaddr) {
                page.set_backing(PageBacking::Evicted(slot));
            }
            return Err(ReloadError::Integrity);
        }
        if let Some(page) = mem.pages.get_mut(&vaddr) {
            page.set_backing(PageBacking::Resident(paddr));
        }
        self.backing.lock().remove(vaddr);
        self.stats.add(EnclaveStatsId::Reload, 1);
        debug!("ELDU {:#x} -> {:#x}", vaddr, paddr);
        Ok(())
    }
}
