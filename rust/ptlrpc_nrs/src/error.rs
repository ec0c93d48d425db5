// Copyright (c) Meta Platforms, Inc. and affiliates.
//
// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

use thiserror::Error;

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum NrsError {
    #[error("out of memory")]
    NoMem,
    #[error("try again")]
    Again,
    #[error("operation not permitted")]
    Perm,
    #[error("no such policy")]
    NoDev,
    #[error("invalid argument")]
    Invalid,
    #[error("operation not supported by the policy")]
    NoSys,
    #[error("policy busy")]
    Busy,
    #[error("policy already registered")]
    Exists,
    #[error("bad request")]
    Fault,
}

impl NrsError {
    /// Negative errno for this error.
    pub fn errno(&self) -> i32 {
        -match self {
            NrsError::NoMem => libc::ENOMEM,
            NrsError::Again => libc::EAGAIN,
            NrsError::Perm => libc::EPERM,
            NrsError::NoDev => libc::ENODEV,
            NrsError::Invalid => libc::EINVAL,
            NrsError::NoSys => libc::ENOSYS,
            NrsError::Busy => libc::EBUSY,
            NrsError::Exists => libc::EEXIST,
            NrsError::Fault => libc::EFAULT,
        }
    }
}

pub type NrsResult<T> = std::result::Result<T, NrsError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_errno() {
        assert_eq!(NrsError::NoDev.errno(), -libc::ENODEV);
        assert_eq!(NrsError::Perm.errno(), -libc::EPERM);
    }
}
