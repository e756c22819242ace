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

//! Architectural SGX structures. Every record here is byte-exact with the
//! layout the hardware and the signing tools expect; reserved regions are kept
//! and must stay zero.

use bitflags::bitflags;
use core::fmt::{Debug, Formatter, Result};
use core::mem::{size_of, MaybeUninit};
use core::ops::Range;
use core::slice;

use numeric_enum_macro::numeric_enum;
use static_assertions::const_assert_eq;

use super::structs::{Sha256Value, SigKey3072Value};
use crate::error::EpcResult;
use crate::memory::{GuestVirtAddr, PAGE_SIZE};

/// Enclave Linear Address Range (ELRANGE).
pub type ElRange = Range<GuestVirtAddr>;

bitflags! {
    /// The ATTRIBUTES data structure is comprised of bit-granular fields that are used in the SECS.
    pub struct SgxAttributeFlags: u64 {
        /// This bit indicates if the enclave has been initialized by EINIT.
        const INIT              = 1 << 0;
        /// If 1, the enclave permit debugger to read and write enclave data using EDBGRD and EDBGWR.
        const DEBUG             = 1 << 1;
        /// Enclave runs in 64-bit mode.
        const MODE64BIT         = 1 << 2;
        /// Provisioning Key is available from EGETKEY.
        const PROVISIONKEY      = 1 << 4;
        /// EINIT token key is available from EGETKEY.
        const EINITTOKEN_KEY    = 1 << 5;
        /// Key Separation and Sharing Enabled.
        const KSS               = 1 << 7;
    }
}

impl SgxAttributeFlags {
    /// Bits that must be zero in SECS.ATTRIBUTES.
    pub const RESERVED_MASK: u64 = (1 << 3) | !0xff;
}

bitflags! {
    /// Access permissions carried by SECINFO.FLAGS.
    pub struct SgxEnclPageFlags: u8 {
        /// The page can be read from inside the enclave.
        const R         = 1 << 0;
        /// The page can be written from inside the enclave.
        const W         = 1 << 1;
        /// The page can be executed from inside the enclave.
        const X         = 1 << 2;
    }
}

impl SgxEnclPageFlags {
    pub const PERM_MASK: Self = Self {
        bits: Self::R.bits() | Self::W.bits() | Self::X.bits(),
    };
}

numeric_enum! {
    #[repr(u8)]
    #[derive(Clone, Copy, Debug, Eq, PartialEq)]
    #[allow(clippy::upper_case_acronyms)]
    pub enum SgxEnclPageType {
        /// Page is an SECS.
        SECS = 0,
        /// Page is a TCS.
        TCS = 1,
        /// Page is a regular page.
        REG = 2,
        /// Page is a Version Array.
        VA = 3,
        /// Page is in trimmed state.
        TRIM = 4,
    }
}

/// Security Information (SECINFO).
#[repr(C, align(64))]
#[derive(Copy, Clone, PartialEq, Eq)]
pub struct SgxSecInfo {
    /// Bits 0-2: R/W/X, bits 8-15: page type, everything else must be zero.
    pub flags: u64,
    _reserved: [u8; 56],
}
const_assert_eq!(size_of::<SgxSecInfo>(), 64);

impl SgxSecInfo {
    const PAGE_TYPE_SHIFT: u64 = 8;
    const PAGE_TYPE_MASK: u64 = 0xff << Self::PAGE_TYPE_SHIFT;
    const RESERVED_MASK: u64 = !(Self::PAGE_TYPE_MASK | SgxEnclPageFlags::PERM_MASK.bits() as u64);

    pub fn new(perm: SgxEnclPageFlags, page_type: SgxEnclPageType) -> Self {
        Self {
            flags: ((page_type as u64) << Self::PAGE_TYPE_SHIFT) | perm.bits() as u64,
            _reserved: [0; 56],
        }
    }

    pub fn perm(&self) -> SgxEnclPageFlags {
        SgxEnclPageFlags::from_bits_truncate(self.flags as u8)
    }

    pub fn page_type(&self) -> EpcResult<SgxEnclPageType> {
        let raw = ((self.flags & Self::PAGE_TYPE_MASK) >> Self::PAGE_TYPE_SHIFT) as u8;
        SgxEnclPageType::try_from(raw)
            .map_err(|raw| epc_err!(EINVAL, format!("Invalid page_type={:#x}", raw)))
    }

    /// Rejects set reserved bits and unknown page types.
    pub fn validate(&self) -> EpcResult {
        if self.flags & Self::RESERVED_MASK != 0 || self._reserved.iter().any(|b| *b != 0) {
            return epc_result_err!(
                EINVAL,
                format!("SECINFO reserved bits are set: {:#x}", self.flags)
            );
        }
        self.page_type()?;
        Ok(())
    }

    pub fn as_bytes(&self) -> &[u8] {
        as_bytes(self)
    }
}

impl Debug for SgxSecInfo {
    fn fmt(&self, f: &mut Formatter) -> Result {
        f.debug_struct("SgxSecInfo")
            .field("perm", &self.perm())
            .field("page_type", &self.page_type().ok())
            .finish()
    }
}

/// Paging Crypto Metadata (PCMD).
#[repr(C, align(128))]
#[derive(Copy, Clone)]
pub struct SgxPcmd {
    /// SECINFO of the evicted page.
    pub secinfo: SgxSecInfo,
    /// Identity of the owning enclave.
    pub enclave_id: u64,
    _reserved: [u8; 40],
    /// Tag over the page contents, the metadata above and the version value.
    pub mac: [u8; 16],
}
const_assert_eq!(size_of::<SgxPcmd>(), 128);

impl SgxPcmd {
    pub(crate) const MAC_OFFSET: usize = 112;

    pub fn new(secinfo: SgxSecInfo, enclave_id: u64) -> Self {
        Self {
            secinfo,
            enclave_id,
            _reserved: [0; 40],
            mac: [0; 16],
        }
    }

    /// Every byte of the record except the MAC itself.
    pub fn authenticated_bytes(&self) -> &[u8] {
        &as_bytes(self)[..Self::MAC_OFFSET]
    }
}

impl Debug for SgxPcmd {
    fn fmt(&self, f: &mut Formatter) -> Result {
        f.debug_struct("SgxPcmd")
            .field("secinfo", &self.secinfo)
            .field("enclave_id", &self.enclave_id)
            .field("mac", &self.mac)
            .finish()
    }
}

/// SGX Enclave Control Structrue (SECS).
#[repr(C)]
#[derive(Clone, Copy)]
pub struct SgxSecs {
    /// (  0) Size of the enclave in bytes; must be power of 2.
    pub size: u64,
    /// (  8) Enclave Base Linear Address must be naturally aligned to size.
    pub base_addr: u64,
    /// ( 16) Size of 1 SSA frame in pages.
    pub ssa_frame_size: u32,
    /// ( 20) Bit vector specifying which extended features are saved to the MISC region of the SSA
    /// frame when an AEX occurs.
    pub misc_select: u32,
    /// ( 24) Reserved
    _reserved1: [u8; 24],
    /// ( 48) Attributes of the Enclave, see [`SgxAttributeFlags`].
    pub attributes: u64,
    /// ( 56) XSAVE Feature Request Mask.
    pub xfrm: u64,
    /// ( 64) Measurement Register of enclave build process.
    pub mr_enclave: Sha256Value,
    /// ( 96) Reserved
    _reserved2: [u8; 32],
    /// (128) Measurement Register extended with the public key that verified the enclave.
    pub mr_signer: Sha256Value,
    /// (160) Reserved
    _reserved3: [u8; 96],
    /// (256) Product ID of enclave.
    pub isv_prod_id: u16,
    /// (258) Security version number (SVN) of the enclave.
    pub isv_svn: u16,
    /// (260) Reserved
    _reserved4: [u8; 3836],
}
const_assert_eq!(size_of::<SgxSecs>(), PAGE_SIZE);

impl SgxSecs {
    pub fn new(base_addr: u64, size: u64, ssa_frame_size: u32, attributes: SgxAttributeFlags) -> Self {
        Self {
            size,
            base_addr,
            ssa_frame_size,
            attributes: attributes.bits(),
            xfrm: 0x3,
            ..Default::default()
        }
    }

    pub fn attribute_flags(&self) -> SgxAttributeFlags {
        SgxAttributeFlags::from_bits_truncate(self.attributes)
    }

    pub fn elrange(&self) -> ElRange {
        self.base_addr as usize..(self.base_addr + self.size) as usize
    }
}

impl Default for SgxSecs {
    fn default() -> Self {
        unsafe { MaybeUninit::zeroed().assume_init() }
    }
}

impl Debug for SgxSecs {
    fn fmt(&self, f: &mut Formatter) -> Result {
        f.debug_struct("SgxSecs")
            .field("size", &self.size)
            .field("base_addr", &self.base_addr)
            .field("ssa_frame_size", &self.ssa_frame_size)
            .field("misc_select", &self.misc_select)
            .field("attributes", &self.attribute_flags())
            .field("xfrm", &self.xfrm)
            .field("mr_enclave", &self.mr_enclave)
            .field("mr_signer", &self.mr_signer)
            .field("isv_prod_id", &self.isv_prod_id)
            .field("isv_svn", &self.isv_svn)
            .finish()
    }
}

/// Thread Control Structure (TCS).
#[repr(C)]
pub struct SgxTcs {
    /// ( 0) Enclave execution state of the thread controlled by this TCS. Must be 0 at creation.
    pub state: u64,
    /// ( 8) The thread's execution flags.
    pub flags: u64,
    /// (16) Offset of the base of the State Save Area stack, relative to the enclave base. Must be page
    /// aligned.
    pub ossa: u64,
    /// (24) Current slot index of an SSA frame.
    pub cssa: u32,
    /// (28) Number of available slots for SSA frames.
    pub nssa: u32,
    /// (32) Offset in enclave to which control is transferred on EENTER relative to the base of the
    /// enclave.
    pub oentry: u64,
    /// (40) The value of the Asynchronous Exit Pointer that was saved at EENTER time.
    pub aep: u64,
    /// (48) Offset to add to the base address of the enclave for producing the base address of FS
    /// segment inside the enclave. Must be page aligned.
    pub ofs_base: u64,
    /// (56) Offset to add to the base address of the enclave for producing the base address of GS
    /// segment inside the enclave. Must be page aligned.
    pub ogs_base: u64,
    /// (64) Size to become the new FS limit in 32-bit mode.
    pub fs_limit: u32,
    /// (68) Size to become the new GS limit in 32-bit mode.
    pub gs_limit: u32,
    /// (72) Rerserved field in TCS, must be 0 at creation.
    _reserved: [u8; 4024],
}
const_assert_eq!(size_of::<SgxTcs>(), PAGE_SIZE);

impl SgxTcs {
    pub const STATE_OFFSET: usize = 0;
    pub const FLAGS_OFFSET: usize = 8;
    pub const GS_LIMIT_OFFSET: usize = 68;
    const RESERVED_OFFSET: usize = 72;

    pub fn new(ossa: u64, nssa: u32, oentry: u64) -> Self {
        Self {
            ossa,
            nssa,
            oentry,
            ..Default::default()
        }
    }

    pub fn as_page(&self) -> [u8; PAGE_SIZE] {
        let mut page = [0; PAGE_SIZE];
        page.copy_from_slice(as_bytes(self));
        page
    }

    /// Reads the execution state word of a TCS stored in an EPC page.
    pub fn state_of(page: &[u8; PAGE_SIZE]) -> u64 {
        read_u64(page, Self::STATE_OFFSET)
    }

    pub fn set_state_of(page: &mut [u8; PAGE_SIZE], state: u64) {
        page[Self::STATE_OFFSET..Self::STATE_OFFSET + 8].copy_from_slice(&state.to_le_bytes());
    }

    /// Check whether the MBZ(Must Be Zero) bits and reserved bits is 0
    /// when newing a TCS.
    pub fn validate_at_creation(page: &[u8; PAGE_SIZE]) -> bool {
        Self::state_of(page) == 0 && page[Self::RESERVED_OFFSET..].iter().all(|b| *b == 0)
    }
}

impl Default for SgxTcs {
    fn default() -> Self {
        unsafe { MaybeUninit::zeroed().assume_init() }
    }
}

impl Debug for SgxTcs {
    fn fmt(&self, f: &mut Formatter) -> Result {
        f.debug_struct("SgxTcs")
            .field("state", &self.state)
            .field("flags", &self.flags)
            .field("ossa", &self.ossa)
            .field("cssa", &self.cssa)
            .field("nssa", &self.nssa)
            .field("oentry", &self.oentry)
            .field("aep", &self.aep)
            .field("ofs_base", &self.ofs_base)
            .field("ogs_base", &self.ogs_base)
            .field("fs_limit", &self.fs_limit)
            .field("gs_limit", &self.gs_limit)
            .finish()
    }
}

#[repr(C)]
pub struct SigStructHeader {
    /// (0) must be (06000000E10000000000010000000000H)
    pub header1: [u8; 16],
    /// (16) Intel=0x8086, ISV=0x0000
    pub vendor: u32,
    /// (20) build date as yyyymmdd
    pub date: u32,
    /// (24) must be (01010000600000006000000001000000H)
    pub header2: [u8; 16],
    /// (40) Software defined
    pub sw_defined: u32,
    /// (44) Must be 0
    _reserved1: [u8; 84],
}

#[repr(C)]
pub struct SigStructKey {
    /// (128) Module Public Key (keylength=3072 bits)
    pub modulus: SigKey3072Value,
    /// (512) RSA Exponent = 3
    pub exponent: u32,
    /// (516) Signature over Header and Body
    pub signature: SigKey3072Value,
}

/// The body starts at an offset that is not 8-byte aligned, so its 64-bit
/// fields are kept as little-endian byte arrays.
#[repr(C)]
pub struct SigStructBody {
    /// (900) The MISCSELECT that must be set
    pub misc_select: u32,
    /// (904) Mask of MISCSELECT to enforce
    pub misc_mask: u32,
    /// (908) Reserved. Must be 0.
    _reserved2: [u8; 20],
    /// (928) Enclave Attributes that must be set
    pub attributes: [u8; 8],
    /// (936) XFRM that must be set
    pub xfrm: [u8; 8],
    /// (944) Mask of Attributes to Enforce
    pub attributes_mask: [u8; 8],
    /// (952) Mask of XFRM to Enforce
    pub xfrm_mask: [u8; 8],
    /// (960) MRENCLAVE - (32 bytes)
    pub mr_enclave: Sha256Value,
    /// (992) Must be 0
    _reserved3: [u8; 32],
    /// (1024) ISV assigned Product ID
    pub isv_prod_id: u16,
    /// (1026) ISV assigned SVN
    pub isv_svn: u16,
}

impl SigStructBody {
    pub fn attributes(&self) -> u64 {
        u64::from_le_bytes(self.attributes)
    }

    pub fn attributes_mask(&self) -> u64 {
        u64::from_le_bytes(self.attributes_mask)
    }

    pub fn xfrm(&self) -> u64 {
        u64::from_le_bytes(self.xfrm)
    }

    pub fn xfrm_mask(&self) -> u64 {
        u64::from_le_bytes(self.xfrm_mask)
    }
}

#[repr(C)]
pub struct SigStructBuffer {
    /// (1028) Must be 0
    _reserved4: [u8; 12],
    /// (1040) Q1 value for RSA Signature Verification
    pub q1: SigKey3072Value,
    /// (1424) Q2 value for RSA Signature Verification
    pub q2: SigKey3072Value,
}

/// ENCLAVE SIGNATURE STRUCTURE
#[repr(C)]
pub struct SigStruct {
    pub header: SigStructHeader,
    pub key: SigStructKey,
    pub body: SigStructBody,
    pub buffer: SigStructBuffer,
}
const_assert_eq!(size_of::<SigStruct>(), 1808);

impl Default for SigStruct {
    fn default() -> Self {
        unsafe { MaybeUninit::zeroed().assume_init() }
    }
}

impl Debug for SigStruct {
    fn fmt(&self, f: &mut Formatter) -> Result {
        f.debug_struct("SigStruct")
            .field("vendor", &self.header.vendor)
            .field("date", &self.header.date)
            .field("modulus", &self.key.modulus)
            .field("exponent", &self.key.exponent)
            .field("misc_select", &self.body.misc_select)
            .field("attributes", &self.body.attributes())
            .field("attributes_mask", &self.body.attributes_mask())
            .field("mr_enclave", &self.body.mr_enclave)
            .field("isv_prod_id", &self.body.isv_prod_id)
            .field("isv_svn", &self.body.isv_svn)
            .finish()
    }
}

/// Launch token (EINITTOKEN).
#[repr(C, align(512))]
#[derive(Clone, Copy)]
pub struct EinitToken {
    /// (  0) Bit 0: 1 if the token is valid.
    pub valid: u32,
    _reserved1: [u32; 11],
    /// ( 48) ATTRIBUTES of the enclave.
    pub attributes: u64,
    /// ( 56) XFRM of the enclave.
    pub xfrm: u64,
    /// ( 64) MRENCLAVE of the enclave.
    pub mr_enclave: Sha256Value,
    _reserved2: [u8; 32],
    /// (128) MRSIGNER of the enclave.
    pub mr_signer: Sha256Value,
    _reserved3: [u8; 32],
    /// (192) Launch enclave's CPUSVN.
    pub le_cpu_svn: [u8; 16],
    /// (208) Launch enclave's ISVPRODID.
    pub le_isv_prod_id: u16,
    /// (210) Launch enclave's ISVSVN.
    pub le_isv_svn: u16,
    _reserved4: [u8; 24],
    /// (236) MISCSELECT masked by the launch enclave.
    pub le_keyed_misc_select: u32,
    /// (240) ATTRIBUTES masked by the launch enclave.
    pub le_keyed_attributes: u64,
    /// (248) XFRM masked by the launch enclave.
    pub le_keyed_xfrm: u64,
    /// (256) Salt for the launch key derivation.
    pub salt: [u8; 32],
    /// (288) MAC over the first 192 bytes.
    pub mac: [u8; 16],
}
const_assert_eq!(size_of::<EinitToken>(), 512);

impl EinitToken {
    pub fn is_valid(&self) -> bool {
        self.valid & 1 != 0
    }
}

impl Default for EinitToken {
    fn default() -> Self {
        unsafe { MaybeUninit::zeroed().assume_init() }
    }
}

impl Debug for EinitToken {
    fn fmt(&self, f: &mut Formatter) -> Result {
        f.debug_struct("EinitToken")
            .field("valid", &self.valid)
            .field("attributes", &self.attributes)
            .field("xfrm", &self.xfrm)
            .field("mr_enclave", &self.mr_enclave)
            .field("mr_signer", &self.mr_signer)
            .finish()
    }
}

numeric_enum! {
    #[repr(u32)]
    /// Status codes reported by the ENCLS leaves.
    #[derive(Debug, PartialEq, Eq, Copy, Clone)]
    #[allow(clippy::upper_case_acronyms)]
    pub enum EnclaveErrorCode {
        EINVALIDSIGSTRUCT = 1,
        EINVALIDATTRIBUTE = 2,
        EBLKSTATE = 3,
        EINVALIDMEASUREMENT = 4,
        ENOTBLOCKABLE = 5,
        EPGINVLD = 6,
        ELOCKFAIL = 7,
        EINVALIDSIGNATURE = 8,
        EMACCOMPAREFAIL = 9,
        EPAGENOTBLOCKED = 10,
        ENOTTRACKED = 11,
        EVASLOTOCCUPIED = 12,
        EENCLAVEACT = 14,
        EINVALIDEINITTOKEN = 16,
        EPREVTRKINCMPL = 17,
        EPGISSECS = 18,
    }
}

impl EnclaveErrorCode {
    pub fn as_str(&self) -> &'static str {
        use EnclaveErrorCode::*;
        match self {
            EINVALIDSIGSTRUCT => "SIGSTRUCT is malformed",
            EINVALIDATTRIBUTE => "Enclave attributes are not allowed",
            EBLKSTATE => "Page is already in blocked state",
            EINVALIDMEASUREMENT => "Measurement does not match SIGSTRUCT",
            ENOTBLOCKABLE => "Page type cannot be blocked",
            EPGINVLD => "EPCM entry is not valid for this operation",
            ELOCKFAIL => "EPC page is in use by another operation",
            EINVALIDSIGNATURE => "Signature does not verify",
            EMACCOMPAREFAIL => "MAC check failed while loading page",
            EPAGENOTBLOCKED => "Page is not marked as blocked",
            ENOTTRACKED => "Tracking cycle isn't done",
            EVASLOTOCCUPIED => "Version array slot is in use",
            EENCLAVEACT => "Exists logical processors executing inside the enclave",
            EINVALIDEINITTOKEN => "Launch token does not match the enclave",
            EPREVTRKINCMPL => "Previous tracking cycle isn't done",
            EPGISSECS => "Page is an SECS",
        }
    }

    pub fn code(&self) -> i32 {
        -(*self as u32 as i32)
    }
}

fn as_bytes<T>(value: &T) -> &[u8] {
    unsafe { slice::from_raw_parts(value as *const T as *const u8, size_of::<T>()) }
}

pub(crate) fn read_u64(page: &[u8], offset: usize) -> u64 {
    let mut word = [0; 8];
    word.copy_from_slice(&page[offset..offset + 8]);
    u64::from_le_bytes(word)
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::mem::align_of;
    use memoffset::offset_of;

    #[test]
    fn test_secs_layout() {
        assert_eq!(offset_of!(SgxSecs, size), 0);
        assert_eq!(offset_of!(SgxSecs, base_addr), 8);
        assert_eq!(offset_of!(SgxSecs, ssa_frame_size), 16);
        assert_eq!(offset_of!(SgxSecs, misc_select), 20);
        assert_eq!(offset_of!(SgxSecs, attributes), 48);
        assert_eq!(offset_of!(SgxSecs, xfrm), 56);
        assert_eq!(offset_of!(SgxSecs, mr_enclave), 64);
        assert_eq!(offset_of!(SgxSecs, mr_signer), 128);
        assert_eq!(offset_of!(SgxSecs, isv_prod_id), 256);
        assert_eq!(offset_of!(SgxSecs, isv_svn), 258);
    }

    #[test]
    fn test_tcs_layout() {
        assert_eq!(offset_of!(SgxTcs, state), SgxTcs::STATE_OFFSET);
        assert_eq!(offset_of!(SgxTcs, flags), SgxTcs::FLAGS_OFFSET);
        assert_eq!(offset_of!(SgxTcs, ossa), 16);
        assert_eq!(offset_of!(SgxTcs, cssa), 24);
        assert_eq!(offset_of!(SgxTcs, nssa), 28);
        assert_eq!(offset_of!(SgxTcs, oentry), 32);
        assert_eq!(offset_of!(SgxTcs, aep), 40);
        assert_eq!(offset_of!(SgxTcs, ofs_base), 48);
        assert_eq!(offset_of!(SgxTcs, ogs_base), 56);
        assert_eq!(offset_of!(SgxTcs, fs_limit), 64);
        assert_eq!(offset_of!(SgxTcs, gs_limit), SgxTcs::GS_LIMIT_OFFSET);
        assert_eq!(offset_of!(SgxTcs, _reserved), SgxTcs::RESERVED_OFFSET);
    }

    #[test]
    fn test_pcmd_and_secinfo_layout() {
        assert_eq!(align_of::<SgxSecInfo>(), 64);
        assert_eq!(align_of::<SgxPcmd>(), 128);
        assert_eq!(offset_of!(SgxPcmd, secinfo), 0);
        assert_eq!(offset_of!(SgxPcmd, enclave_id), 64);
        assert_eq!(offset_of!(SgxPcmd, mac), SgxPcmd::MAC_OFFSET);
    }

    #[test]
    fn test_sigstruct_layout() {
        assert_eq!(offset_of!(SigStruct, key), 128);
        assert_eq!(offset_of!(SigStruct, body), 900);
        assert_eq!(offset_of!(SigStruct, buffer), 1028);
        assert_eq!(offset_of!(SigStructHeader, vendor), 16);
        assert_eq!(offset_of!(SigStructHeader, header2), 24);
        assert_eq!(offset_of!(SigStructKey, exponent), 512 - 128);
        assert_eq!(offset_of!(SigStructKey, signature), 516 - 128);
        assert_eq!(offset_of!(SigStructBody, attributes), 928 - 900);
        assert_eq!(offset_of!(SigStructBody, xfrm_mask), 952 - 900);
        assert_eq!(offset_of!(SigStructBody, mr_enclave), 960 - 900);
        assert_eq!(offset_of!(SigStructBody, isv_prod_id), 1024 - 900);
        assert_eq!(offset_of!(SigStructBuffer, q1), 1040 - 1028);
        assert_eq!(offset_of!(SigStructBuffer, q2), 1424 - 1028);
    }

    #[test]
    fn test_einittoken_layout() {
        assert_eq!(align_of::<EinitToken>(), 512);
        assert_eq!(offset_of!(EinitToken, attributes), 48);
        assert_eq!(offset_of!(EinitToken, mr_enclave), 64);
        assert_eq!(offset_of!(EinitToken, mr_signer), 128);
        assert_eq!(offset_of!(EinitToken, le_cpu_svn), 192);
        assert_eq!(offset_of!(EinitToken, le_isv_prod_id), 208);
        assert_eq!(offset_of!(EinitToken, le_keyed_misc_select), 236);
        assert_eq!(offset_of!(EinitToken, le_keyed_attributes), 240);
        assert_eq!(offset_of!(EinitToken, le_keyed_xfrm), 248);
        assert_eq!(offset_of!(EinitToken, salt), 256);
        assert_eq!(offset_of!(EinitToken, mac), 288);
    }

    #[test]
    fn test_secinfo_flags() {
        let secinfo = SgxSecInfo::new(SgxEnclPageFlags::R | SgxEnclPageFlags::W, SgxEnclPageType::TCS);
        assert_eq!(secinfo.flags, 0x103);
        assert_eq!(secinfo.page_type().unwrap(), SgxEnclPageType::TCS);
        assert!(secinfo.validate().is_ok());

        let mut bad = secinfo;
        bad.flags |= 1 << 3;
        assert!(bad.validate().is_err());
        bad.flags = 0x7 << 8;
        assert!(bad.page_type().is_err());
    }

    #[test]
    fn test_tcs_state_word() {
        let mut page = SgxTcs::new(0x1000, 2, 0x2000).as_page();
        assert!(SgxTcs::validate_at_creation(&page));
        SgxTcs::set_state_of(&mut page, 1);
        assert_eq!(SgxTcs::state_of(&page), 1);
        assert!(!SgxTcs::validate_at_creation(&page));
    }

    #[test]
    fn test_error_code_conversion() {
        assert_eq!(EnclaveErrorCode::try_from(11), Ok(EnclaveErrorCode::ENOTTRACKED));
        assert_eq!(EnclaveErrorCode::try_from(13), Err(13));
        assert_eq!(EnclaveErrorCode::EENCLAVEACT.code(), -14);
    }
}
