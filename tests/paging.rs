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

use std::sync::{Arc, Barrier};
use std::thread;

use enclave_pager::enclave::measure::Measure;
use enclave_pager::sgx::{
    EinitToken, EnclaveErrorCode, SgxAttributeFlags, SgxEnclPageFlags, SgxEnclPageType,
    SgxSecInfo, SgxSecs, SgxTcs, SigStruct,
};
use enclave_pager::{
    AccessError, Enclave, EnclavePageState, EnclaveStatsId, Epc, EvictError, FaultOutcome,
    PagerConfig, PAGE_SIZE,
};

const BASE: usize = 0x40_0000;
const SIZE: usize = 0x4_0000;
const TCS: usize = BASE;
const REG: usize = BASE + PAGE_SIZE;

fn new_epc() -> Arc<Epc> {
    Epc::new(PagerConfig {
        epc_pages: 32,
        max_cpus: 8,
        reclaim_key: *b"0123456789abcdef",
        evict_retries: 3,
        busy_retries: 16,
        backoff_spins: 4,
        ..Default::default()
    })
    .unwrap()
}

fn reg_contents(i: usize) -> [u8; PAGE_SIZE] {
    let mut page = [0; PAGE_SIZE];
    for (j, b) in page.iter_mut().enumerate() {
        *b = (i * 31 + j) as u8;
    }
    page
}

/// A TCS at `TCS` and `regs` measured regular pages after it.
fn build(epc: &Arc<Epc>, attributes: SgxAttributeFlags, regs: usize, init: bool) -> Arc<Enclave> {
    let secs = SgxSecs::new(BASE as u64, SIZE as u64, 1, attributes);
    let enclave = Enclave::create(epc, &secs).unwrap();
    let mut measure = Measure::new();
    measure.start(secs.size, secs.ssa_frame_size);

    let tcs_info = SgxSecInfo::new(SgxEnclPageFlags::empty(), SgxEnclPageType::TCS);
    let tcs = SgxTcs::new(0x2000, 1, 0x1000).as_page();
    enclave.add_page(TCS, &tcs, &tcs_info, true).unwrap();
    measure.update(0, &tcs_info, Some(&tcs));

    let reg_info = SgxSecInfo::new(
        SgxEnclPageFlags::R | SgxEnclPageFlags::W,
        SgxEnclPageType::REG,
    );
    for i in 0..regs {
        let vaddr = REG + i * PAGE_SIZE;
        let data = reg_contents(i);
        enclave.add_page(vaddr, &data, &reg_info, true).unwrap();
        measure.update((vaddr - BASE) as u64, &reg_info, Some(&data));
    }
    enclave.add_version_array().unwrap();

    if init {
        let mut sigstruct = SigStruct::default();
        sigstruct.body.mr_enclave = measure.finish();
        enclave.init(&sigstruct, &EinitToken::default()).unwrap();
    }
    enclave
}

fn debug_enclave(epc: &Arc<Epc>, regs: usize) -> Arc<Enclave> {
    build(
        epc,
        SgxAttributeFlags::DEBUG | SgxAttributeFlags::MODE64BIT,
        regs,
        true,
    )
}

fn read_page(vma: &enclave_pager::EnclaveVma, vaddr: usize) -> Vec<u8> {
    let mut buf = vec![0; PAGE_SIZE];
    assert_eq!(vma.access(vaddr, &mut buf, false), Ok(PAGE_SIZE));
    buf
}

#[test]
fn evict_then_fault_restores_contents() {
    let epc = new_epc();
    let enclave = debug_enclave(&epc, 2);
    let vma = enclave.mmap().unwrap();
    let free = epc.free_pages();

    enclave.evict_page(REG).unwrap();
    assert_eq!(enclave.page_state(REG), Some(EnclavePageState::Evicted));
    assert_eq!(epc.free_pages(), free + 1);
    {
        let store = enclave.backing_store();
        let swapped = store.get(REG).unwrap();
        assert_ne!(&swapped.contents[..], &reg_contents(0)[..]);
    }

    assert_eq!(vma.fault(REG + 0x10), FaultOutcome::Resolved);
    assert_eq!(enclave.page_state(REG), Some(EnclavePageState::Resident));
    assert_eq!(epc.free_pages(), free);
    assert_eq!(read_page(&vma, REG), reg_contents(0).to_vec());
    assert!(enclave.backing_store().is_empty());
    assert_eq!(enclave.stats(EnclaveStatsId::WriteBack).count(), 1);
    assert_eq!(enclave.stats(EnclaveStatsId::Reload).count(), 1);
}

#[test]
fn evict_by_physical_page() {
    let epc = new_epc();
    let enclave = debug_enclave(&epc, 1);
    let vma = enclave.mmap().unwrap();
    let paddr = enclave.epc_page(REG).unwrap();
    epc.evict(paddr).unwrap();
    assert_eq!(enclave.page_state(REG), Some(EnclavePageState::Evicted));
    assert!(epc.evict(enclave.id()).is_err());
    assert!(epc.evict(paddr).is_err());
    assert_eq!(vma.fault(REG), FaultOutcome::Resolved);
}

#[test]
fn tampered_copy_is_violation() {
    let epc = new_epc();
    let enclave = debug_enclave(&epc, 1);
    let vma = enclave.mmap().unwrap();

    let tampers: [fn(&mut enclave_pager::SwappedPage); 4] = [
        |page| page.contents[PAGE_SIZE - 1] ^= 0x80,
        |page| page.pcmd.mac[0] ^= 1,
        |page| page.pcmd.enclave_id ^= 1,
        |page| {
            page.pcmd.secinfo = SgxSecInfo::new(
                SgxEnclPageFlags::R | SgxEnclPageFlags::W | SgxEnclPageFlags::X,
                SgxEnclPageType::REG,
            )
        },
    ];
    for tamper in tampers {
        enclave.evict_page(REG).unwrap();
        let original = enclave.backing_store().get(REG).unwrap().clone();
        tamper(enclave.backing_store().get_mut(REG).unwrap());

        assert_eq!(vma.fault(REG), FaultOutcome::Violation);
        assert_eq!(enclave.page_state(REG), Some(EnclavePageState::Evicted));

        enclave.backing_store().insert(REG, original);
        assert_eq!(vma.fault(REG), FaultOutcome::Resolved);
    }
    assert_eq!(enclave.stats(EnclaveStatsId::ReloadMacFail).count(), 4);
    assert_eq!(read_page(&vma, REG), reg_contents(0).to_vec());
}

#[test]
fn replayed_copy_is_violation() {
    let epc = new_epc();
    let enclave = debug_enclave(&epc, 1);
    let vma = enclave.mmap().unwrap();

    enclave.evict_page(REG).unwrap();
    let stale = enclave.backing_store().get(REG).unwrap().clone();
    assert_eq!(vma.fault(REG), FaultOutcome::Resolved);

    let mut new_data = [0x5a; 8];
    assert_eq!(vma.access(REG, &mut new_data, true), Ok(8));
    enclave.evict_page(REG).unwrap();
    let fresh = enclave.backing_store().get(REG).unwrap().clone();
    assert_ne!(stale.pcmd.mac, fresh.pcmd.mac);

    enclave.backing_store().insert(REG, stale);
    assert_eq!(vma.fault(REG), FaultOutcome::Violation);

    enclave.backing_store().insert(REG, fresh);
    assert_eq!(vma.fault(REG), FaultOutcome::Resolved);
    let mut word = [0; 8];
    assert_eq!(vma.access(REG, &mut word, false), Ok(8));
    assert_eq!(word, [0x5a; 8]);
}

#[test]
fn concurrent_faults_reload_once() {
    const THREADS: usize = 8;
    let epc = new_epc();
    let enclave = debug_enclave(&epc, 1);
    let vma = Arc::new(enclave.mmap().unwrap());
    enclave.evict_page(REG).unwrap();

    let barrier = Arc::new(Barrier::new(THREADS));
    let handles: Vec<_> = (0..THREADS)
        .map(|_| {
            let vma = vma.clone();
            let barrier = barrier.clone();
            thread::spawn(move || {
                barrier.wait();
                loop {
                    match vma.fault(REG + 0x80) {
                        FaultOutcome::Busy => thread::yield_now(),
                        outcome => return outcome,
                    }
                }
            })
        })
        .collect();
    for handle in handles {
        assert_eq!(handle.join().unwrap(), FaultOutcome::Resolved);
    }

    assert_eq!(enclave.stats(EnclaveStatsId::Reload).count(), 1);
    assert_eq!(enclave.stats(EnclaveStatsId::ReloadMacFail).count(), 0);
    assert_eq!(read_page(&vma, REG), reg_contents(0).to_vec());
}

#[test]
fn tcs_write_outside_flags_is_restricted() {
    let epc = new_epc();
    let enclave = debug_enclave(&epc, 1);
    let vma = enclave.mmap().unwrap();
    let before = {
        let mut buf = [0; 64];
        assert_eq!(vma.access(TCS, &mut buf, false), Ok(64));
        buf
    };

    let mut oentry = 0xdead_beef_u64.to_le_bytes();
    assert_eq!(
        vma.access(TCS + 32, &mut oentry, true),
        Err(AccessError::Restricted)
    );
    let mut after = [0; 64];
    assert_eq!(vma.access(TCS, &mut after, false), Ok(64));
    assert_eq!(before, after);

    let mut flags = 1u64.to_le_bytes();
    assert_eq!(vma.access(TCS + SgxTcs::FLAGS_OFFSET, &mut flags, true), Ok(8));
}

#[test]
fn access_not_permitted() {
    let epc = new_epc();

    let production = build(&epc, SgxAttributeFlags::MODE64BIT, 1, true);
    let vma = production.mmap().unwrap();
    let mut buf = [0; 8];
    assert_eq!(vma.access(REG, &mut buf, false), Err(AccessError::NotPermitted));
    assert_eq!(vma.fault(REG), FaultOutcome::Resolved);
    drop(vma);

    let uninit = build(
        &epc,
        SgxAttributeFlags::DEBUG | SgxAttributeFlags::MODE64BIT,
        1,
        false,
    );
    let vma = uninit.mmap().unwrap();
    assert_eq!(vma.access(REG, &mut buf, true), Err(AccessError::NotPermitted));
    drop(vma);

    let dead = debug_enclave(&epc, 1);
    let vma = dead.mmap().unwrap();
    dead.invalidate();
    assert_eq!(vma.access(REG, &mut buf, false), Err(AccessError::NotPermitted));
    assert_eq!(vma.fault(REG), FaultOutcome::Violation);
}

#[test]
fn eviction_waits_for_entered_context() {
    let epc = new_epc();
    let enclave = debug_enclave(&epc, 1);
    let vma = enclave.mmap().unwrap();

    // Nothing references the regular page's translation: eviction succeeds.
    enclave.evict_page(REG).unwrap();

    enclave.enter(TCS, 3).unwrap();
    match enclave.evict_page(TCS) {
        Err(EvictError::Deferred(code)) => assert_eq!(code, EnclaveErrorCode::ENOTTRACKED),
        res => panic!("unexpected {:?}", res),
    }
    assert!(matches!(
        enclave.evict_page(TCS),
        Err(EvictError::Deferred(_))
    ));
    assert_eq!(enclave.page_state(TCS), Some(EnclavePageState::Tracked));
    assert_eq!(vma.fault(TCS), FaultOutcome::Busy);

    enclave.exit(TCS, 3).unwrap();
    enclave.evict_page(TCS).unwrap();
    assert_eq!(enclave.page_state(TCS), Some(EnclavePageState::Evicted));

    assert_eq!(vma.fault(REG), FaultOutcome::Resolved);
    assert_eq!(vma.fault(TCS), FaultOutcome::Resolved);
    assert_eq!(read_page(&vma, REG), reg_contents(0).to_vec());
    enclave.enter(TCS, 0).unwrap();
    enclave.exit(TCS, 0).unwrap();
}

#[test]
fn bounded_retry_leaves_page_resident() {
    let epc = new_epc();
    let enclave = debug_enclave(&epc, 1);
    let vma = enclave.mmap().unwrap();

    enclave.enter(TCS, 1).unwrap();
    assert!(matches!(
        enclave.evict_with_retry(REG),
        Err(EvictError::Deferred(_))
    ));
    assert_eq!(enclave.page_state(REG), Some(EnclavePageState::Resident));
    assert_eq!(enclave.stats(EnclaveStatsId::WriteBackCancel).count(), 1);
    assert_eq!(vma.fault(REG), FaultOutcome::Resolved);
    enclave.exit(TCS, 1).unwrap();

    enclave.evict_with_retry(REG).unwrap();
    assert_eq!(enclave.page_state(REG), Some(EnclavePageState::Evicted));
}

#[test]
fn last_close_tears_down() {
    let epc = new_epc();
    let total = epc.free_pages();
    let enclave = debug_enclave(&epc, 3);
    let vma = enclave.mmap().unwrap();
    let second = vma.dup();
    enclave.evict_page(REG + PAGE_SIZE).unwrap();

    drop(vma);
    assert!(!enclave.is_dead());
    assert_eq!(second.fault(REG + PAGE_SIZE), FaultOutcome::Resolved);

    enclave.evict_page(REG).unwrap();
    drop(second);
    assert!(enclave.is_dead());
    assert_eq!(epc.free_pages(), total);
    assert!(enclave.backing_store().is_empty());
    assert!(matches!(enclave.evict_page(REG + 2 * PAGE_SIZE), Err(EvictError::Failed(_))));
}
