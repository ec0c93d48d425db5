// Copyright (c) Meta Platforms, Inc. and affiliates.
//
// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

use thiserror::Error;

/// Runtime errors callers of the engine are expected to branch on.
///
/// Invariant violations are not represented here; they panic.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum LnetError {
    #[error("out of memory")]
    NoMem,
    #[error("resource temporarily unavailable")]
    Again,
    #[error("no route to host")]
    HostUnreachable,
    #[error("network is shutting down")]
    Shutdown,
    #[error("invalid argument")]
    Invalid,
    #[error("no such object")]
    NotFound,
    #[error("stale cursor")]
    Stale,
    #[error("object busy")]
    Busy,
    #[error("event queue overflowed")]
    Overflow,
    #[error("no such device")]
    NoDev,
    #[error("operation not permitted")]
    Perm,
    #[error("protocol error")]
    Proto,
    #[error("I/O error")]
    Io,
    #[error("bad address")]
    Fault,
    #[error("operation canceled")]
    Canceled,
}

impl LnetError {
    /// Negative errno for this error.
    pub fn errno(&self) -> i32 {
        -match self {
            LnetError::NoMem => libc::ENOMEM,
            LnetError::Again => libc::EAGAIN,
            LnetError::HostUnreachable => libc::EHOSTUNREACH,
            LnetError::Shutdown => libc::ESHUTDOWN,
            LnetError::Invalid => libc::EINVAL,
            LnetError::NotFound => libc::ENOENT,
            LnetError::Stale => libc::ESTALE,
            LnetError::Busy => libc::EBUSY,
            LnetError::Overflow => libc::EOVERFLOW,
            LnetError::NoDev => libc::ENODEV,
            LnetError::Perm => libc::EPERM,
            LnetError::Proto => libc::EPROTO,
            LnetError::Io => libc::EIO,
            LnetError::Fault => libc::EFAULT,
            LnetError::Canceled => libc::ECANCELED,
        }
    }

    /// Reverse of `errno()`, accepting either sign.
    pub fn from_errno(errno: i32) -> Option<LnetError> {
        let e = match errno.abs() {
            libc::ENOMEM => LnetError::NoMem,
            libc::EAGAIN => LnetError::Again,
            libc::EHOSTUNREACH => LnetError::HostUnreachable,
            libc::ESHUTDOWN => LnetError::Shutdown,
            libc::EINVAL => LnetError::Invalid,
            libc::ENOENT => LnetError::NotFound,
            libc::ESTALE => LnetError::Stale,
            libc::EBUSY => LnetError::Busy,
            libc::EOVERFLOW => LnetError::Overflow,
            libc::ENODEV => LnetError::NoDev,
            libc::EPERM => LnetError::Perm,
            libc::EPROTO => LnetError::Proto,
            libc::EIO => LnetError::Io,
            libc::EFAULT => LnetError::Fault,
            libc::ECANCELED => LnetError::Canceled,
            _ => return None,
        };
        Some(e)
    }
}

pub type LnetResult<T> = std::result::Result<T, LnetError>;

/// Completion status of a message or event, `Ok(())` on success.
pub type Status = LnetResult<()>;

/// Status as an errno, 0 on success.
pub fn status_errno(status: &Status) -> i32 {
    match status {
        Ok(()) => 0,
        Err(e) => e.errno(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_errno_round_trip() {
        for e in [
            LnetError::NoMem,
            LnetError::HostUnreachable,
            LnetError::Stale,
            LnetError::Overflow,
            LnetError::Proto,
        ] {
            assert!(e.errno() < 0);
            assert_eq!(LnetError::from_errno(e.errno()), Some(e));
        }
        assert_eq!(LnetError::from_errno(0), None);
        assert_eq!(status_errno(&Err(LnetError::NotFound)), -libc::ENOENT);
        assert_eq!(status_errno(&Ok(())), 0);
    }
}
