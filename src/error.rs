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
use core::fmt::{Debug, Display, Formatter, Result};

/// POSIX errno
#[repr(u32)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[allow(dead_code, clippy::upper_case_acronyms)]
pub enum EpcErrorNum {
    EPERM = 1,
    ENOENT = 2,
    EIO = 5,
    ENOMEM = 12,
    EFAULT = 14,
    EBUSY = 16,
    EEXIST = 17,
    EINVAL = 22,
    ERANGE = 34,
    ECANCELED = 125,
}

pub struct EpcError {
    num: EpcErrorNum,
    loc_file: &'static str,
    loc_line: u32,
    loc_col: u32,
    msg: Option<String>,
}

pub type EpcResult<T = ()> = core::result::Result<T, EpcError>;

impl EpcErrorNum {
    pub fn as_str(&self) -> &'static str {
        use EpcErrorNum::*;
        match *self {
            EPERM => "Operation not permitted",
            ENOENT => "No such file or directory",
            EIO => "I/O error",
            ENOMEM => "Out of memory",
            EFAULT => "Bad address",
            EBUSY => "Device or resource busy",
            EEXIST => "File exists",
            EINVAL => "Invalid argument",
            ERANGE => "Math result not representable",
            ECANCELED => "Operation canceled",
        }
    }

    pub fn code(&self) -> i32 {
        -(*self as u32 as i32)
    }
}

impl EpcError {
    pub fn new(
        num: EpcErrorNum,
        loc_file: &'static str,
        loc_line: u32,
        loc_col: u32,
        msg: Option<String>,
    ) -> Self {
        Self {
            num,
            loc_file,
            loc_line,
            loc_col,
            msg,
        }
    }

    pub fn num(&self) -> EpcErrorNum {
        self.num
    }

    pub fn loc_line(&self) -> u32 {
        self.loc_line
    }

    pub fn loc_file(&self) -> &'static str {
        self.loc_file
    }

    pub fn msg(&self) -> Option<&str> {
        self.msg.as_deref()
    }

    pub fn code(&self) -> i32 {
        self.num.code()
    }
}

impl Debug for EpcError {
    fn fmt(&self, f: &mut Formatter) -> Result {
        write!(
            f,
            "[{}:{}:{}] {}",
            self.loc_file,
            self.loc_line,
            self.loc_col,
            self.num.as_str()
        )?;
        if let Some(ref msg) = self.msg {
            write!(f, ": {}", msg)?;
        }
        Ok(())
    }
}

impl Display for EpcError {
    fn fmt(&self, f: &mut Formatter) -> Result {
        match self.msg {
            Some(ref msg) => write!(f, "{}: {}", self.num.as_str(), msg),
            None => f.write_str(self.num.as_str()),
        }
    }
}

#[macro_export]
macro_rules! epc_err {
    ($num: ident) => {{
        $crate::error::EpcError::new(
            $crate::error::EpcErrorNum::$num,
            file!(),
            line!(),
            column!(),
            None,
        )
    }};
    ($num: ident, $msg: expr) => {{
        $crate::error::EpcError::new(
            $crate::error::EpcErrorNum::$num,
            file!(),
            line!(),
            column!(),
            Some($msg.into()),
        )
    }};
}

#[macro_export]
macro_rules! epc_result_err {
    ($num: ident) => {
        Err($crate::epc_err!($num))
    };
    ($num: ident, $msg: expr) => {
        Err($crate::epc_err!($num, $msg))
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fails() -> EpcResult<usize> {
        epc_result_err!(EBUSY, format!("page {:#x} is busy", 0x1000))
    }

    #[test]
    fn test_error_carries_location_and_message() {
        let err = fails().unwrap_err();
        assert_eq!(err.num(), EpcErrorNum::EBUSY);
        assert_eq!(err.code(), -16);
        assert!(err.loc_file().ends_with("error.rs"));
        assert_eq!(err.msg(), Some("page 0x1000 is busy"));
        assert_eq!(
            format!("{}", err),
            "Device or resource busy: page 0x1000 is busy"
        );
    }
}
