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

//! Lifecycle of EPC pages that belong to SGX-style enclaves.
//!
//! The crate owns the Enclave Page Cache (EPC) pool and the per-enclave page
//! sets, and services the three paths that touch them after the control plane
//! has built an enclave:
//!
//! - page faults against an enclave mapping ([`EnclaveVma::fault`]),
//! - debugger peek/poke ([`EnclaveVma::access`]),
//! - secure eviction to untrusted memory ([`Enclave::evict_page`]).

#![cfg_attr(not(test), no_std)]

#[macro_use]
extern crate alloc;
#[macro_use]
extern crate log;

#[macro_use]
pub mod error;
pub mod logging;

pub mod config;
pub mod cpumask;
pub mod enclave;
pub mod memory;
pub mod stats;
pub mod vma;

pub use config::PagerConfig;
pub use enclave::reclaim::{BackingStore, EvictError, ReloadError, SwappedPage};
pub use enclave::sgx;
pub use enclave::{Enclave, EnclavePageState};
pub use error::{EpcError, EpcErrorNum, EpcResult};
pub use memory::epc::{Epc, EpcPageState, EpcPhysAddr};
pub use memory::{GuestVirtAddr, PAGE_SIZE};
pub use stats::EnclaveStatsId;
pub use vma::{AccessError, EnclaveVma, FaultOutcome};
