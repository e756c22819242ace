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

pub mod epcm;
pub mod measure;
pub mod page;
pub mod reclaim;
pub mod sgx;
pub mod structs;
mod thread;
pub mod tlb_track;

use alloc::{collections::BTreeMap, sync::Arc, vec::Vec};
use core::fmt::{Debug, Formatter, Result};
use core::sync::atomic::{AtomicUsize, Ordering};

use sha2::{Digest, Sha256};
use spin::mutex::{SpinMutex, SpinMutexGuard};
use spin::RwLock;

use crate::error::EpcResult;
use crate::memory::addr::is_aligned;
use crate::memory::epc::{Epc, EpcPageState, EpcPhysAddr};
use crate::memory::{GuestVirtAddr, MemFlags, PageTable, PagingError, PAGE_SIZE};
use crate::stats::{EnclaveStats, EnclaveStatsId, StatsValue};
use crate::vma::EnclaveVma;

use measure::Measure;
use page::{EnclavePage, PageBacking};
use reclaim::BackingStore;
use sgx::{
    EinitToken, ElRange, SgxAttributeFlags, SgxEnclPageFlags, SgxEnclPageType, SgxSecInfo,
    SgxSecs, SgxTcs, SigStruct,
};
use structs::Sha256Value;
use tlb_track::TLBFlushTrackingState;

pub use page::EnclavePageState;

/// Enclave state
const STATE_UNINIT: usize = 0x0;
const STATE_INIT_TRY: usize = 0x1;
const STATE_INIT_OK: usize = 0x2;
const STATE_DEAD: usize = 0x3;

/// Everything guarded by the enclave lock.
pub(crate) struct EnclaveMem {
    /// Logical pages in ELRANGE, keyed by linear address.
    pub(crate) pages: BTreeMap<GuestVirtAddr, EnclavePage>,
    /// Translations handed out to faulting contexts.
    pub(crate) gpt: PageTable,
    /// Version Array pages owned by this enclave.
    pub(crate) va_pages: Vec<EpcPhysAddr>,
}

pub struct Enclave {
    /// EPC address of SECS. It does not change over the lifetime of the
    /// enclave, and therefore is used to identify the enclave.
    id: EpcPhysAddr,
    epc: Arc<Epc>,

    /// SGX Enclave Control Structrue.
    secs: RwLock<SgxSecs>,
    /// Enclave Linear Address Range (ELRANGE).
    elrange: ElRange,

    /// Enclave state
    state: AtomicUsize,
    /// SGX Enclave measurement.
    measure: SpinMutex<Measure>,

    /// Number of live `EnclaveVma`s.
    mapping_count: AtomicUsize,
    /// Number of TCS pages.
    tcs_count: AtomicUsize,

    /// Concurrency control for all the memory transactions in elrange.
    ///
    /// Faults, debug accesses, evictions and teardown all take this lock
    /// before they look at or change a page's binding, so the transitions of
    /// a single page are totally ordered. It is never held while waiting for
    /// a shoot-down epoch.
    encl_mem_lock: SpinMutex<EnclaveMem>,

    /// Tracking cycle state. Taken after `encl_mem_lock`.
    tracking_state: SpinMutex<TLBFlushTrackingState>,

    /// Sealed copies of evicted pages. Taken after `encl_mem_lock`.
    backing: SpinMutex<BackingStore>,

    stats: EnclaveStats,
}

impl Enclave {
    /// ECREATE
    pub fn create(epc: &Arc<Epc>, secs: &SgxSecs) -> EpcResult<Arc<Self>> {
        Self::validate_secs(secs)?;

        let secs_paddr = epc.alloc()?;
        let mut measure = Measure::new();
        measure.start(secs.size, secs.ssa_frame_size);
        let enclave = Arc::new(Self {
            id: secs_paddr,
            epc: epc.clone(),
            secs: RwLock::new(*secs),
            elrange: secs.elrange(),
            state: AtomicUsize::new(STATE_UNINIT),
            measure: SpinMutex::new(measure),
            mapping_count: AtomicUsize::new(0),
            tcs_count: AtomicUsize::new(0),
            encl_mem_lock: SpinMutex::new(EnclaveMem {
                pages: BTreeMap::new(),
                gpt: PageTable::new(),
                va_pages: Vec::new(),
            }),
            tracking_state: SpinMutex::new(Default::default()),
            backing: SpinMutex::new(Default::default()),
            stats: Default::default(),
        });

        let sec_info = SgxSecInfo::new(SgxEnclPageFlags::empty(), SgxEnclPageType::SECS);
        if let Err(err) = epc.epcm_add(secs_paddr, 0, &sec_info, &enclave) {
            let _ = epc.free(secs_paddr);
            return Err(err);
        }
        debug!("Enclave::create() OK: {:#x?}", enclave);
        Ok(enclave)
    }

    fn validate_secs(secs: &SgxSecs) -> EpcResult {
        if !secs.size.is_power_of_two() || secs.size < 2 * PAGE_SIZE as u64 {
            return epc_result_err!(
                EINVAL,
                format!("Enclave::create(): invalid enclave size {:#x}", secs.size)
            );
        }
        if secs.base_addr & (secs.size - 1) != 0 {
            return epc_result_err!(
                EINVAL,
                format!(
                    "Enclave::create(): base {:#x} is not aligned to size {:#x}",
                    secs.base_addr, secs.size
                )
            );
        }
        if secs.base_addr.checked_add(secs.size).is_none() {
            return epc_result_err!(EINVAL, "Enclave::create(): ELRANGE overflows");
        }
        if secs.ssa_frame_size == 0 {
            return epc_result_err!(EINVAL, "Enclave::create(): ssa_frame_size is 0");
        }
        if secs.attributes & SgxAttributeFlags::RESERVED_MASK != 0 {
            return epc_result_err!(
                EINVAL,
                format!(
                    "Enclave::create(): reserved attribute bits set: {:#x}",
                    secs.attributes
                )
            );
        }
        if secs.attribute_flags().contains(SgxAttributeFlags::INIT) {
            return epc_result_err!(EINVAL, "Enclave::create(): INIT must be clear");
        }
        Ok(())
    }

    pub fn id(&self) -> EpcPhysAddr {
        self.id
    }

    pub fn epc(&self) -> &Arc<Epc> {
        &self.epc
    }

    pub fn elrange(&self) -> &ElRange {
        &self.elrange
    }

    pub fn is_init(&self) -> bool {
        self.state.load(Ordering::SeqCst) == STATE_INIT_OK
    }

    pub fn is_dead(&self) -> bool {
        self.state.load(Ordering::SeqCst) == STATE_DEAD
    }

    pub fn is_debug(&self) -> bool {
        self.secs
            .read()
            .attribute_flags()
            .contains(SgxAttributeFlags::DEBUG)
    }

    pub fn secs(&self) -> SgxSecs {
        *self.secs.read()
    }

    pub fn measurement(&self) -> Sha256Value {
        self.secs.read().mr_enclave
    }

    pub fn mr_signer(&self) -> Sha256Value {
        self.secs.read().mr_signer
    }

    pub fn isv(&self) -> (u16, u16) {
        let secs = self.secs.read();
        (secs.isv_prod_id, secs.isv_svn)
    }

    pub fn tcs_count(&self) -> usize {
        self.tcs_count.load(Ordering::Acquire)
    }

    pub fn mapping_count(&self) -> usize {
        self.mapping_count.load(Ordering::Acquire)
    }

    pub fn stats(&self, id: EnclaveStatsId) -> &StatsValue {
        self.stats.get(id)
    }

    pub(crate) fn atomic_add_stats(&self, id: EnclaveStatsId, value: u64) {
        self.stats.add(id, value)
    }

    pub(crate) fn lock_mem(&self) -> SpinMutexGuard<EnclaveMem> {
        self.encl_mem_lock.lock()
    }

    /// Untrusted storage of evicted pages. Must not be held across any other
    /// call into the enclave.
    pub fn backing_store(&self) -> SpinMutexGuard<BackingStore> {
        self.backing.lock()
    }

    fn validate_vaddr(&self, vaddr: GuestVirtAddr, caller: &str) -> EpcResult {
        if !is_aligned(vaddr) {
            return epc_result_err!(
                EINVAL,
                format!("Enclave::{}(): {:#x} is not aligned", caller, vaddr)
            );
        }
        if !self.elrange.contains(&vaddr) {
            return epc_result_err!(
                EINVAL,
                format!(
                    "Enclave::{}(): {:#x} is out of ELRANGE {:#x?}",
                    caller, vaddr, self.elrange
                )
            );
        }
        Ok(())
    }

    /// EADD, followed by EEXTENDs of the whole page if `measure` is set.
    pub fn add_page(
        self: &Arc<Self>,
        vaddr: GuestVirtAddr,
        data: &[u8; PAGE_SIZE],
        sec_info: &SgxSecInfo,
        measure: bool,
    ) -> EpcResult {
        if self.state.load(Ordering::SeqCst) != STATE_UNINIT {
            return epc_result_err!(
                EBUSY,
                "Enclave::add_page(): enclave is already initialized"
            );
        }
        self.validate_vaddr(vaddr, "add_page")?;
        sec_info.validate()?;
        let page_type = sec_info.page_type()?;
        match page_type {
            SgxEnclPageType::REG => {}
            SgxEnclPageType::TCS => {
                if !SgxTcs::validate_at_creation(data) {
                    return epc_result_err!(
                        EINVAL,
                        format!("Enclave::add_page(): Invalid TCS at {:#x}", vaddr)
                    );
                }
            }
            _ => {
                return epc_result_err!(
                    EINVAL,
                    format!("Enclave::add_page(): can't add a {:?} page", page_type)
                )
            }
        }

        let mut mem = self.lock_mem();
        if mem.pages.contains_key(&vaddr) {
            return epc_result_err!(
                EEXIST,
                format!("Enclave::add_page(): {:#x} is already added", vaddr)
            );
        }
        let paddr = self.epc.alloc()?;
        let added = self
            .epc
            .data(paddr)
            .map(|mut page| page.copy_from_slice(data))
            .and_then(|_| self.epc.epcm_add(paddr, vaddr, sec_info, self))
            .and_then(|_| {
                mem.gpt
                    .map(vaddr, paddr, MemFlags::from(sec_info))
                    .map_err(Into::into)
            });
        if let Err(err) = added {
            let _ = self.epc.free(paddr);
            return Err(err);
        }

        self.measure.lock().update(
            (vaddr - self.elrange.start) as u64,
            sec_info,
            if measure { Some(data) } else { None },
        );
        mem.pages
            .insert(vaddr, EnclavePage::new(vaddr, *sec_info, page_type, paddr));
        if page_type == SgxEnclPageType::TCS {
            info!("New enclave thread(tcs_vaddr={:#x})", vaddr);
            self.tcs_count.fetch_add(1, Ordering::Release);
        }
        Ok(())
    }

    /// EPA: gives the enclave one more page of version-array slots.
    pub fn add_version_array(self: &Arc<Self>) -> EpcResult<EpcPhysAddr> {
        let mut mem = self.lock_mem();
        if self.is_dead() {
            return epc_result_err!(EINVAL, "Enclave::add_version_array(): enclave is dead");
        }
        let paddr = self.epc.alloc()?;
        let sec_info = SgxSecInfo::new(SgxEnclPageFlags::empty(), SgxEnclPageType::VA);
        // Version array page does not bind to any linear address.
        if let Err(err) = self.epc.epcm_add(paddr, 0, &sec_info, self) {
            let _ = self.epc.free(paddr);
            return Err(err);
        }
        mem.va_pages.push(paddr);
        Ok(paddr)
    }

    /// EINIT
    pub fn init(&self, sigstruct: &SigStruct, token: &EinitToken) -> EpcResult {
        let init_inner = || -> EpcResult {
            debug!("{:#x?}", sigstruct);
            let mut secs = self.secs.write();
            secs.mr_enclave = self.measure.lock().finish();

            // verify mr_enclave from sigstruct
            if secs.mr_enclave != sigstruct.body.mr_enclave {
                return epc_result_err!(
                    EINVAL,
                    format!(
                        "Enclave::init(): mr_enclave not match {:#x?} {:#x?}",
                        secs.mr_enclave, sigstruct.body.mr_enclave
                    )
                );
            }

            let attributes_mask = sigstruct.body.attributes_mask();
            let xfrm_mask = sigstruct.body.xfrm_mask();
            if secs.attributes & attributes_mask != sigstruct.body.attributes() & attributes_mask
                || secs.xfrm & xfrm_mask != sigstruct.body.xfrm() & xfrm_mask
            {
                return epc_result_err!(
                    EINVAL,
                    format!(
                        "Enclave::init(): attributes {:#x}/{:#x} rejected by sigstruct",
                        secs.attributes, secs.xfrm
                    )
                );
            }

            let mut hasher = Sha256::new();
            hasher.update(sigstruct.key.modulus.as_slice());
            secs.mr_signer
                .as_mut_slice()
                .copy_from_slice(hasher.finalize().as_slice());

            if token.is_valid()
                && (token.mr_enclave != secs.mr_enclave
                    || token.mr_signer != secs.mr_signer
                    || token.attributes != secs.attributes
                    || token.xfrm != secs.xfrm)
            {
                return epc_result_err!(EINVAL, "Enclave::init(): launch token does not match");
            }

            secs.isv_prod_id = sigstruct.body.isv_prod_id;
            secs.isv_svn = sigstruct.body.isv_svn;
            secs.attributes |= SgxAttributeFlags::INIT.bits();
            info!("Enclave::init(): OK {:#x?}", *secs);
            Ok(())
        };

        if self
            .state
            .compare_exchange(
                STATE_UNINIT,
                STATE_INIT_TRY,
                Ordering::SeqCst,
                Ordering::SeqCst,
            )
            .is_err()
        {
            return epc_result_err!(EBUSY, "Enclave::init(): enclave is already initialized");
        }
        let (res, next) = match init_inner() {
            Ok(()) => (Ok(()), STATE_INIT_OK),
            Err(err) => (Err(err), STATE_UNINIT),
        };
        if self
            .state
            .compare_exchange(STATE_INIT_TRY, next, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return epc_result_err!(EINVAL, "Enclave::init(): enclave died during EINIT");
        }
        res
    }

    /// Maps the enclave into an address space. The enclave stays alive for
    /// as long as any mapping of it does.
    pub fn mmap(self: &Arc<Self>) -> EpcResult<EnclaveVma> {
        if self.is_dead() {
            return epc_result_err!(EINVAL, "Enclave::mmap(): enclave is dead");
        }
        self.mapping_count.fetch_add(1, Ordering::AcqRel);
        Ok(EnclaveVma::new(self.clone()))
    }

    pub(crate) fn acquire_mapping(&self) {
        self.mapping_count.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn release_mapping(&self) {
        if self.mapping_count.fetch_sub(1, Ordering::AcqRel) == 1 {
            info!("Enclave {:#x}: last mapping closed", self.id);
            self.invalidate();
        }
    }

    /// Marks the enclave dead and drops every page it owns. Contents are
    /// discarded, not written back. Calling it more than once is harmless.
    pub fn invalidate(&self) {
        if self.state.swap(STATE_DEAD, Ordering::SeqCst) == STATE_DEAD {
            return;
        }

        let mut mem = self.lock_mem();
        for page in mem.pages.values() {
            if let Some(paddr) = page.epc_paddr() {
                if let Err(err) = self.epc.free(paddr) {
                    error!("Enclave::invalidate(): {:?}", err);
                }
            }
        }
        mem.pages.clear();
        mem.gpt.clear();
        for paddr in mem.va_pages.drain(..) {
            if let Err(err) = self.epc.free(paddr) {
                error!("Enclave::invalidate(): {:?}", err);
            }
        }
        drop(mem);

        self.backing.lock().clear();
        if let Err(err) = self.epc.free(self.id) {
            error!("Enclave::invalidate(): SECS {:?}", err);
        }
        info!("Enclave {:#x} invalidated", self.id);
    }

    /// Looks up the translation installed for `vaddr`.
    pub fn translate(&self, vaddr: GuestVirtAddr) -> EpcResult<(EpcPhysAddr, MemFlags)> {
        let mem = self.lock_mem();
        mem.gpt.query(vaddr).map_err(|err| match err {
            PagingError::NotPresent(_) => epc_err!(EBUSY, format!("{:?}", err)),
            _ => err.into(),
        })
    }

    pub fn page_state(&self, vaddr: GuestVirtAddr) -> Option<EnclavePageState> {
        let mem = self.lock_mem();
        let page = mem.pages.get(&vaddr)?;
        match page.backing() {
            PageBacking::Resident(paddr) => match self.epc.page_state(paddr).ok()? {
                EpcPageState::Assigned => Some(EnclavePageState::Resident),
                EpcPageState::Blocked => Some(EnclavePageState::Blocked),
                EpcPageState::Tracked => Some(EnclavePageState::Tracked),
                EpcPageState::Free => None,
            },
            PageBacking::Loading(_) => Some(EnclavePageState::Loading),
            PageBacking::Evicted(_) => Some(EnclavePageState::Evicted),
        }
    }

    /// EPC page currently backing `vaddr`, if it is resident.
    pub fn epc_page(&self, vaddr: GuestVirtAddr) -> Option<EpcPhysAddr> {
        self.lock_mem().pages.get(&vaddr)?.epc_paddr()
    }
}

impl Drop for Enclave {
    fn drop(&mut self) {
        #[cfg(feature = "stats")]
        self.stats.print(self.id);
        self.invalidate();
    }
}

impl Debug for Enclave {
    fn fmt(&self, f: &mut Formatter) -> Result {
        f.debug_struct("Enclave")
            .field("id", &self.id)
            .field("elrange", &self.elrange)
            .field("state", &self.state)
            .field("mapping_count", &self.mapping_count)
            .field("tcs_count", &self.tcs_count)
            .finish()
    }
}
