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

//! MRENCLAVE accumulation: ECREATE, EADD and EEXTEND records hashed in the
//! order the control plane issues them.

use core::mem::size_of;

use sha2::{Digest, Sha256};

use super::structs::Sha256Value;
use crate::enclave::sgx::SgxSecInfo;
use crate::memory::PAGE_SIZE;

#[derive(Copy, Clone, Debug, PartialEq, Eq, Ord, PartialOrd)]
pub enum MeasureState {
    None,
    Started,
    Update,
    Finished,
}

#[derive(Clone, Debug)]
pub struct Measure {
    state: MeasureState,
    hasher: Sha256,
}

impl Measure {
    const DATA_BLOCK_SIZE: usize = 64;
    const SIZE_NAMED_VALUE: usize = 8;
    /// Bytes covered by one EEXTEND.
    pub const EEXTEND_CHUNK: usize = 256;

    pub fn new() -> Self {
        Self {
            state: MeasureState::None,
            hasher: Sha256::new(),
        }
    }

    pub fn state(&self) -> MeasureState {
        self.state
    }

    fn named_block(name: &str) -> [u8; Self::DATA_BLOCK_SIZE] {
        let mut data_block = [0; Self::DATA_BLOCK_SIZE];
        data_block[..name.len()].copy_from_slice(name.as_bytes());
        data_block
    }

    pub fn start(&mut self, enclave_size: u64, ssa_frame_size: u32) {
        let mut data_block = Self::named_block("ECREATE");
        let mut offset = Self::SIZE_NAMED_VALUE;
        data_block[offset..(offset + size_of::<u32>())]
            .copy_from_slice(&ssa_frame_size.to_le_bytes());
        offset += size_of::<u32>();
        data_block[offset..(offset + size_of::<u64>())]
            .copy_from_slice(&enclave_size.to_le_bytes());

        self.hasher.update(data_block);
        self.state = MeasureState::Started;
    }

    /// Records an EADD of the page at `page_offset` and, when `page_data` is
    /// given, the EEXTENDs covering the whole page.
    pub fn update(
        &mut self,
        page_offset: u64,
        secinfo: &SgxSecInfo,
        page_data: Option<&[u8; PAGE_SIZE]>,
    ) {
        let mut data_block = Self::named_block("EADD");
        let mut offset = Self::SIZE_NAMED_VALUE;
        data_block[offset..(offset + size_of::<u64>())]
            .copy_from_slice(&page_offset.to_le_bytes());
        offset += size_of::<u64>();
        data_block[offset..(offset + size_of::<u64>())]
            .copy_from_slice(&secinfo.flags.to_le_bytes());
        self.hasher.update(data_block);

        if let Some(page_data) = page_data {
            for (i, chunk) in page_data.chunks(Self::EEXTEND_CHUNK).enumerate() {
                let chunk_offset = page_offset + (i * Self::EEXTEND_CHUNK) as u64;
                let mut data_block = Self::named_block("EEXTEND");
                data_block[Self::SIZE_NAMED_VALUE..(Self::SIZE_NAMED_VALUE + size_of::<u64>())]
                    .copy_from_slice(&chunk_offset.to_le_bytes());
                self.hasher.update(data_block);
                self.hasher.update(chunk);
            }
        }
        self.state = MeasureState::Update;
    }

    pub fn finish(&mut self) -> Sha256Value {
        let mut output = Sha256Value::default();
        output
            .as_mut_slice()
            .copy_from_slice(self.hasher.finalize_reset().as_slice());
        self.state = MeasureState::Finished;
        output
    }
}

impl Default for Measure {
    fn default() -> Self {
        Self::new()
    }
}
