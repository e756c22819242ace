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

use super::sgx::{SgxEnclPageType, SgxSecInfo};
use crate::memory::epc::EpcPhysAddr;
use crate::memory::GuestVirtAddr;

/// One 8-byte slot of a Version Array page.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VaSlotRef {
    pub va_page: EpcPhysAddr,
    pub index: usize,
}

/// Where the contents of a logical page currently live.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageBacking {
    Resident(EpcPhysAddr),
    /// A fault is verifying the sealed copy; the slot still holds its value.
    Loading(VaSlotRef),
    Evicted(VaSlotRef),
}

/// Observable state of a logical enclave page.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnclavePageState {
    Resident,
    Blocked,
    Tracked,
    Loading,
    Evicted,
}

#[derive(Debug)]
pub struct EnclavePage {
    vaddr: GuestVirtAddr,
    sec_info: SgxSecInfo,
    page_type: SgxEnclPageType,
    backing: PageBacking,
    /// Logical processor running on this TCS, if any.
    entered_cpu: Option<usize>,
}

impl EnclavePage {
    pub fn new(
        vaddr: GuestVirtAddr,
        sec_info: SgxSecInfo,
        page_type: SgxEnclPageType,
        paddr: EpcPhysAddr,
    ) -> Self {
        Self {
            vaddr,
            sec_info,
            page_type,
            backing: PageBacking::Resident(paddr),
            entered_cpu: None,
        }
    }

    pub fn vaddr(&self) -> GuestVirtAddr {
        self.vaddr
    }

    pub fn sec_info(&self) -> &SgxSecInfo {
        &self.sec_info
    }

    pub fn page_type(&self) -> SgxEnclPageType {
        self.page_type
    }

    pub fn is_tcs(&self) -> bool {
        self.page_type == SgxEnclPageType::TCS
    }

    pub fn backing(&self) -> PageBacking {
        self.backing
    }

    pub fn set_backing(&mut self, backing: PageBacking) {
        self.backing = backing;
    }

    pub fn entered_cpu(&self) -> Option<usize> {
        self.entered_cpu
    }

    pub fn set_entered_cpu(&mut self, cpuid: Option<usize>) {
        self.entered_cpu = cpuid;
    }

    pub fn epc_paddr(&self) -> Option<EpcPhysAddr> {
        match self.backing {
            PageBacking::Resident(paddr) => Some(paddr),
            _ => None,
        }
    }
}
