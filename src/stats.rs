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

use alloc::string::String;
use core::sync::atomic::{AtomicU64, Ordering};

#[repr(usize)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnclaveStatsId {
    Fault = 0,
    FaultBusy = 1,
    FaultViolation = 2,
    Block = 3,
    Track = 4,
    WriteBack = 5,
    WriteBackDeferred = 6,
    WriteBackCancel = 7,
    Reload = 8,
    ReloadMacFail = 9,
    DebugRead = 10,
    DebugWrite = 11,
    Enter = 12,
    Exit = 13,

    MaxId = 14,
}

impl EnclaveStatsId {
    const ALL: [EnclaveStatsId; EnclaveStatsId::MaxId as usize] = [
        EnclaveStatsId::Fault,
        EnclaveStatsId::FaultBusy,
        EnclaveStatsId::FaultViolation,
        EnclaveStatsId::Block,
        EnclaveStatsId::Track,
        EnclaveStatsId::WriteBack,
        EnclaveStatsId::WriteBackDeferred,
        EnclaveStatsId::WriteBackCancel,
        EnclaveStatsId::Reload,
        EnclaveStatsId::ReloadMacFail,
        EnclaveStatsId::DebugRead,
        EnclaveStatsId::DebugWrite,
        EnclaveStatsId::Enter,
        EnclaveStatsId::Exit,
    ];
}

#[derive(Default)]
pub struct StatsValue {
    count: AtomicU64,
    sum: AtomicU64,
}

impl StatsValue {
    pub fn atomic_add(&self, value: u64) {
        self.count.fetch_add(1, Ordering::Release);
        self.sum.fetch_add(value, Ordering::Release);
    }

    pub fn count(&self) -> u64 {
        self.count.load(Ordering::Acquire)
    }

    pub fn sum(&self) -> u64 {
        self.sum.load(Ordering::Acquire)
    }

    pub fn as_string(&self) -> String {
        let sum = self.sum();
        let count = self.count();
        let ave = if count == 0 { 0 } else { sum * 1000 / count };
        format!(
            "count = {}, sum = {}, average = {}.{:03}",
            count,
            sum,
            ave / 1000,
            ave % 1000
        )
    }
}

/// Per-enclave operation counters.
#[derive(Default)]
pub struct EnclaveStats([StatsValue; EnclaveStatsId::MaxId as usize]);

impl EnclaveStats {
    pub fn add(&self, id: EnclaveStatsId, value: u64) {
        self.0[id as usize].atomic_add(value)
    }

    pub fn get(&self, id: EnclaveStatsId) -> &StatsValue {
        &self.0[id as usize]
    }

    #[cfg(feature = "stats")]
    pub fn print(&self, enclave_id: usize) {
        info!("Enclave {:#x} stats:", enclave_id);
        for id in EnclaveStatsId::ALL {
            info!("  {:?}: {}", id, self.get(id).as_string());
        }
    }

    pub fn nonzero(&self) -> impl Iterator<Item = (EnclaveStatsId, &StatsValue)> {
        EnclaveStatsId::ALL
            .into_iter()
            .map(move |id| (id, self.get(id)))
            .filter(|(_, value)| value.count() != 0)
    }
}
