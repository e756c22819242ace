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

//! Per-enclave translation from ELRANGE linear addresses to EPC pages.

use alloc::collections::BTreeMap;

use super::addr::{align_down, GuestVirtAddr};
use super::epc::EpcPhysAddr;
use super::MemFlags;
use crate::enclave::sgx::{SgxEnclPageFlags, SgxSecInfo};
use crate::error::EpcError;

#[derive(Debug, PartialEq, Eq)]
pub enum PagingError {
    /// No translation has ever been installed for the page.
    NotMapped(GuestVirtAddr),
    /// The translation exists but its present bit is clear (e.g. the page is
    /// blocked for eviction).
    NotPresent((GuestVirtAddr, EpcPhysAddr, MemFlags)),
    AlreadyMapped((GuestVirtAddr, EpcPhysAddr, MemFlags)),
}

pub type PagingResult<T = ()> = Result<T, PagingError>;

impl From<PagingError> for EpcError {
    fn from(err: PagingError) -> Self {
        epc_err!(EFAULT, format!("{:?}", err))
    }
}

impl From<&SgxSecInfo> for MemFlags {
    fn from(secinfo: &SgxSecInfo) -> Self {
        let perm = secinfo.perm();
        let mut flags = MemFlags::USER;
        if perm.contains(SgxEnclPageFlags::R) {
            flags |= MemFlags::READ;
        }
        if perm.contains(SgxEnclPageFlags::W) {
            flags |= MemFlags::WRITE;
        }
        if perm.contains(SgxEnclPageFlags::X) {
            flags |= MemFlags::EXECUTE;
        }
        flags
    }
}

#[derive(Debug, Clone, Copy)]
struct PageTableEntry {
    paddr: EpcPhysAddr,
    flags: MemFlags,
}

impl PageTableEntry {
    fn is_present(&self) -> bool {
        !self.flags.contains(MemFlags::NO_PRESENT)
    }
}

/// Single-level table of 4K leaf entries.
#[derive(Debug, Default)]
pub struct PageTable {
    entries: BTreeMap<GuestVirtAddr, PageTableEntry>,
}

impl PageTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn map(&mut self, vaddr: GuestVirtAddr, paddr: EpcPhysAddr, flags: MemFlags) -> PagingResult {
        let vaddr = align_down(vaddr);
        if let Some(entry) = self.entries.get(&vaddr) {
            return Err(PagingError::AlreadyMapped((vaddr, entry.paddr, entry.flags)));
        }
        trace!("map {:#x} -> {:#x} {:?}", vaddr, paddr, flags);
        self.entries.insert(vaddr, PageTableEntry { paddr, flags });
        Ok(())
    }

    pub fn unmap(&mut self, vaddr: GuestVirtAddr) -> PagingResult<EpcPhysAddr> {
        let vaddr = align_down(vaddr);
        let entry = self
            .entries
            .remove(&vaddr)
            .ok_or(PagingError::NotMapped(vaddr))?;
        trace!("unmap {:#x} -> {:#x}", vaddr, entry.paddr);
        Ok(entry.paddr)
    }

    /// Translates `vaddr`, failing for entries whose present bit is clear.
    pub fn query(&self, vaddr: GuestVirtAddr) -> PagingResult<(EpcPhysAddr, MemFlags)> {
        let page = align_down(vaddr);
        let entry = self.entries.get(&page).ok_or(PagingError::NotMapped(page))?;
        if !entry.is_present() {
            return Err(PagingError::NotPresent((page, entry.paddr, entry.flags)));
        }
        Ok((entry.paddr + (vaddr - page), entry.flags))
    }

    pub fn set_notpresent(&mut self, vaddr: GuestVirtAddr) -> PagingResult {
        let vaddr = align_down(vaddr);
        let entry = self
            .entries
            .get_mut(&vaddr)
            .ok_or(PagingError::NotMapped(vaddr))?;
        entry.flags |= MemFlags::NO_PRESENT;
        Ok(())
    }

    pub fn set_present(&mut self, vaddr: GuestVirtAddr) -> PagingResult {
        let vaddr = align_down(vaddr);
        let entry = self
            .entries
            .get_mut(&vaddr)
            .ok_or(PagingError::NotMapped(vaddr))?;
        entry.flags.remove(MemFlags::NO_PRESENT);
        Ok(())
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_map_query_unmap() {
        let mut pt = PageTable::new();
        let flags = MemFlags::READ | MemFlags::USER;
        pt.map(0x10_0000, 0x8000_1000, flags).unwrap();
        assert_eq!(pt.query(0x10_0123), Ok((0x8000_1123, flags)));
        assert!(matches!(
            pt.map(0x10_0000, 0x8000_2000, flags),
            Err(PagingError::AlreadyMapped(_))
        ));

        pt.set_notpresent(0x10_0000).unwrap();
        assert!(matches!(
            pt.query(0x10_0000),
            Err(PagingError::NotPresent((0x10_0000, 0x8000_1000, _)))
        ));
        pt.set_present(0x10_0000).unwrap();
        assert!(pt.query(0x10_0000).is_ok());

        assert_eq!(pt.unmap(0x10_0fff), Ok(0x8000_1000));
        assert_eq!(pt.query(0x10_0000), Err(PagingError::NotMapped(0x10_0000)));
        assert!(pt.is_empty());
    }
}
