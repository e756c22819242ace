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

use crate::cpumask::CpuMask;

/// ETRACK bookkeeping for one enclave.
///
/// Every `activate()` opens a new shoot-down epoch. The epoch completes once
/// every execution context that was inside the enclave when it was opened
/// has exited; a page tracked in epoch `n` may be written back only after
/// `is_epoch_done(n)`.
#[derive(Debug, Default)]
pub struct TLBFlushTrackingState {
    /// Indicates if the process of TLB Flush track is active.
    tracking: bool,
    /// Last epoch opened by ETRACK.
    epoch: u64,
    /// Last epoch known to have no stale translations left.
    completed_epoch: u64,
    /// The number of logic processors that are currently executing the code of the enclave.
    active_threads: u16,
    /// The number of logic processors that were executing the enclave's code when the ETRACK instruction was issued.
    tracked_threads: u16,
    /// Keep track of the logic processors that have exited the current enclave after the ETRACK instruction was issued.
    lp_mask: CpuMask,
    /// Logic processors currently inside the enclave, at most one context each.
    active_mask: CpuMask,
}

impl TLBFlushTrackingState {
    pub fn active_thread_num(&self) -> u16 {
        self.active_threads
    }

    pub fn is_in_tracking(&self) -> bool {
        self.tracking
    }

    pub fn is_cpu_active(&self, cpuid: usize) -> bool {
        self.active_mask.test_cpu(cpuid)
    }

    pub fn is_epoch_done(&self, epoch: u64) -> bool {
        self.completed_epoch >= epoch
    }

    /// Opens a new epoch, or returns `None` while the previous one is still
    /// in progress.
    pub fn activate(&mut self) -> Option<u64> {
        if self.tracking {
            return None;
        }
        self.epoch += 1;
        if self.active_threads == 0 {
            self.completed_epoch = self.epoch;
            return Some(self.epoch);
        }
        self.tracking = true;
        self.tracked_threads = self.active_threads;
        self.lp_mask.clear();

        Some(self.epoch)
    }

    /// Accounts one context entering or leaving on `cpuid`. A processor runs
    /// at most one context of the enclave, so `cpuid` names the context.
    pub fn update(&mut self, is_enter: bool, cpuid: usize) {
        if is_enter {
            self.active_threads += 1;
            self.active_mask.set_cpu(cpuid);

            if self.is_in_tracking() {
                self.lp_mask.set_cpu(cpuid);
            }
        } else {
            self.active_threads = self.active_threads.saturating_sub(1);
            self.active_mask.clear_cpu(cpuid);

            if self.is_in_tracking() && !self.lp_mask.test_cpu(cpuid) {
                self.lp_mask.set_cpu(cpuid);
                self.tracked_threads = self.tracked_threads.saturating_sub(1);
                if self.tracked_threads == 0 {
                    self.completed_epoch = self.epoch;
                    self.tracking = false;
                }
            }
        }
    }
}
