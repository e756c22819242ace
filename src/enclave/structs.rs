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

//! Fixed-size values embedded in the SGX records.

use core::fmt::{Debug, Formatter, Result};

pub const SHA256_HASH_SIZE: usize = 32;
pub const SIG_KEY_3072_SIZE: usize = 384;

#[repr(transparent)]
#[derive(Clone, Copy, Default, PartialEq, Eq)]
pub struct Sha256Value([u8; SHA256_HASH_SIZE]);

impl Sha256Value {
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.0
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.0
    }
}

impl From<[u8; SHA256_HASH_SIZE]> for Sha256Value {
    fn from(value: [u8; SHA256_HASH_SIZE]) -> Self {
        Self(value)
    }
}

impl Debug for Sha256Value {
    fn fmt(&self, f: &mut Formatter) -> Result {
        write!(f, "Sha256Value(")?;
        for byte in &self.0 {
            write!(f, "{:02x}", byte)?;
        }
        write!(f, ")")
    }
}

/// A 3072-bit RSA quantity (modulus, signature, Q1 or Q2), little-endian.
#[repr(transparent)]
#[derive(Clone, Copy)]
pub struct SigKey3072Value([u8; SIG_KEY_3072_SIZE]);

impl SigKey3072Value {
    pub fn as_slice(&self) -> &[u8] {
        &self.0
    }
}

impl From<[u8; SIG_KEY_3072_SIZE]> for SigKey3072Value {
    fn from(value: [u8; SIG_KEY_3072_SIZE]) -> Self {
        Self(value)
    }
}

impl Debug for SigKey3072Value {
    fn fmt(&self, f: &mut Formatter) -> Result {
        write!(f, "SigKey3072Value(")?;
        for byte in &self.0[..8] {
            write!(f, "{:02x}", byte)?;
        }
        write!(f, "..)")
    }
}
