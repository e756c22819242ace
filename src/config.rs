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

use core::fmt::{Debug, Formatter, Result};

use crate::cpumask::NR_CPUS;
use crate::enclave::reclaim::RECLAIM_KEY_LEN;
use crate::error::EpcResult;
use crate::memory::addr::is_aligned;
use crate::memory::epc::MAX_EPC_PAGES;

/// Boot-time description of the EPC and of the reclaimer's policy.
#[derive(Clone)]
pub struct PagerConfig {
    /// Physical address of the first EPC page.
    pub epc_base: usize,
    /// Number of 4K pages in the EPC.
    pub epc_pages: usize,
    /// Highest logical processor id plus one that may enter an enclave.
    pub max_cpus: usize,
    /// Key protecting evicted pages. Must come from a real entropy source;
    /// the all-zero default is rejected by `validate()`.
    pub reclaim_key: [u8; RECLAIM_KEY_LEN],
    /// Starting point of the version-array nonce sequence.
    pub nonce_seed: u64,
    /// How many times a deferred eviction is retried before it is cancelled.
    pub evict_retries: u32,
    /// How many times a busy page is retried by the debug access path.
    pub busy_retries: u32,
    /// Spin iterations of the first back-off step; doubled on every retry.
    pub backoff_spins: u32,
}

impl PagerConfig {
    pub fn validate(&self) -> EpcResult {
        if !is_aligned(self.epc_base) {
            return epc_result_err!(
                EINVAL,
                format!("epc_base {:#x} is not page aligned", self.epc_base)
            );
        }
        if self.epc_pages == 0 || self.epc_pages > MAX_EPC_PAGES {
            return epc_result_err!(
                EINVAL,
                format!(
                    "epc_pages {} must be in [1, {}]",
                    self.epc_pages, MAX_EPC_PAGES
                )
            );
        }
        if self.max_cpus == 0 || self.max_cpus > NR_CPUS {
            return epc_result_err!(
                EINVAL,
                format!(
                    "Invalid max_cpus: {}, supported max cpus are {}",
                    self.max_cpus, NR_CPUS
                )
            );
        }
        if self.evict_retries == 0 {
            return epc_result_err!(EINVAL, "evict_retries must be at least 1");
        }
        if self.reclaim_key.iter().all(|b| *b == 0) {
            return epc_result_err!(EINVAL, "reclaim_key is not set");
        }
        Ok(())
    }
}

impl Default for PagerConfig {
    fn default() -> Self {
        Self {
            epc_base: 0x8000_0000,
            epc_pages: 256,
            max_cpus: 64,
            reclaim_key: [0; RECLAIM_KEY_LEN],
            nonce_seed: 1,
            evict_retries: 8,
            busy_retries: 64,
            backoff_spins: 16,
        }
    }
}

impl Debug for PagerConfig {
    fn fmt(&self, f: &mut Formatter) -> Result {
        f.debug_struct("PagerConfig")
            .field("epc_base", &self.epc_base)
            .field("epc_pages", &self.epc_pages)
            .field("max_cpus", &self.max_cpus)
            .field("evict_retries", &self.evict_retries)
            .field("busy_retries", &self.busy_retries)
            .field("backoff_spins", &self.backoff_spins)
            .finish()
    }
}
