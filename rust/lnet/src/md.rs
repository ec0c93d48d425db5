// Copyright (c) Meta Platforms, Inc. and affiliates.
//
// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! # Memory descriptors
//!
//! An MD describes a region of user memory that network operations read
//! from or write into. The memory is a list of fragments; without
//! `IOVEC`/`KIOV` it must be a single contiguous buffer, with `KIOV` every
//! fragment must fit in a page.
//!
//! Every operation committed to an MD takes a reference and consumes one
//! unit of its threshold. An MD is unlinked once nothing references it and
//! it was either explicitly unlinked (a zombie) or it auto-unlinks and is
//! exhausted.

use crate::eq::Event;
use crate::eq::EventKind;
use crate::eq::EventQueue;
use crate::error::LnetError;
use crate::error::LnetResult;
use crate::handle::EqHandle;
use crate::handle::MdHandle;
use crate::types::MAX_IOV;
use crate::types::PAGE_SIZE;
use crate::Recycle;
use std::fmt;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::PoisonError;

/// The MD accepts incoming PUTs.
pub const MD_OP_PUT: u32 = 1 << 0;
/// The MD can be fetched by incoming GETs.
pub const MD_OP_GET: u32 = 1 << 1;
/// Use the offset the remote side asks for instead of the local one.
pub const MD_MANAGE_REMOTE: u32 = 1 << 2;
/// Accept oversized requests, truncating them to what's left.
pub const MD_TRUNCATE: u32 = 1 << 3;
/// Never ACK PUTs out of this MD.
pub const MD_ACK_DISABLE: u32 = 1 << 4;
/// Memory is a list of independent buffers.
pub const MD_IOVEC: u32 = 1 << 5;
/// Every operation consumes exactly `max_size` bytes; exhausted once
/// fewer are left.
pub const MD_MAX_SIZE: u32 = 1 << 6;
/// Memory is a list of page sized buffers.
pub const MD_KIOV: u32 = 1 << 7;
/// Unlink once exhausted, same as passing `Unlink::Unlink`.
pub const MD_AUTO_UNLINK: u32 = 1 << 8;

/// Threshold of an MD that is never exhausted by use.
pub const MD_THRESH_INF: i32 = -1;

pub(crate) const MD_FLAG_ZOMBIE: u32 = 1 << 0;
pub(crate) const MD_FLAG_AUTO_UNLINK: u32 = 1 << 1;

/// Whether an MD or ME goes away by itself once it can't match any more.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Unlink {
    Retain,
    Unlink,
}

/// A shareable byte buffer. LNDs copy payload in and out of it while the
/// owner keeps its own clone.
#[derive(Clone, Default)]
pub struct IoBuf(Arc<Mutex<Vec<u8>>>);

impl IoBuf {
    pub fn new(len: usize) -> IoBuf {
        IoBuf::from_vec(vec![0; len])
    }

    pub fn from_vec(data: Vec<u8>) -> IoBuf {
        IoBuf(Arc::new(Mutex::new(data)))
    }

    pub fn len(&self) -> usize {
        self.0.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn to_vec(&self) -> Vec<u8> {
        self.0.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn fill(&self, val: u8) {
        let mut data = self.0.lock().unwrap_or_else(PoisonError::into_inner);
        data.iter_mut().for_each(|b| *b = val);
    }

    /// Grow the buffer to at least `len` bytes.
    pub(crate) fn ensure_len(&self, len: usize) {
        let mut data = self.0.lock().unwrap_or_else(PoisonError::into_inner);
        if data.len() < len {
            data.resize(len, 0);
        }
    }
}

impl fmt::Debug for IoBuf {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "IoBuf({})", self.len())
    }
}

/// A byte range `[offset, offset + len)` over a list of fragments.
#[derive(Debug, Clone, Default)]
pub struct Payload {
    pub frags: Vec<IoBuf>,
    pub offset: u32,
    pub len: u32,
}

impl Payload {
    pub fn new(frags: Vec<IoBuf>, offset: u32, len: u32) -> Payload {
        Payload { frags, offset, len }
    }

    /// Walk the fragments overlapping the range, handing out each
    /// fragment with the in-fragment range and the offset into the payload.
    fn for_each_chunk(&self, mut f: impl FnMut(&mut Vec<u8>, usize, usize, usize)) {
        let mut skip = self.offset as usize;
        let mut left = self.len as usize;
        let mut done = 0;
        for frag in self.frags.iter() {
            if left == 0 {
                break;
            }
            let mut data = frag.0.lock().unwrap_or_else(PoisonError::into_inner);
            if skip >= data.len() {
                skip -= data.len();
                continue;
            }
            let nob = (data.len() - skip).min(left);
            f(&mut *data, skip, nob, done);
            done += nob;
            left -= nob;
            skip = 0;
        }
    }

    /// Gather the payload bytes.
    pub fn read(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.len as usize);
        self.for_each_chunk(|data, start, nob, _| {
            out.extend_from_slice(&data[start..start + nob]);
        });
        out
    }

    /// Scatter `src` into the payload, returning the bytes written.
    pub fn write(&self, src: &[u8]) -> usize {
        let mut written = 0;
        self.for_each_chunk(|data, start, nob, done| {
            if done >= src.len() {
                return;
            }
            let nob = nob.min(src.len() - done);
            data[start..start + nob].copy_from_slice(&src[done..done + nob]);
            written += nob;
        });
        written
    }

    /// Copy as much of `src` as fits. The source is gathered first, so the
    /// two payloads may share buffers.
    pub fn copy_from(&self, src: &Payload) -> usize {
        self.write(&src.read())
    }
}

/// What a user passes to `md_attach()` and `md_bind()`.
#[derive(Debug, Clone)]
pub struct MdDesc {
    pub memory: Vec<IoBuf>,
    /// Operations allowed before the MD is exhausted, `MD_THRESH_INF`
    /// for unlimited.
    pub threshold: i32,
    /// Only with `MD_MAX_SIZE`.
    pub max_size: u32,
    pub options: u32,
    /// Opaque value handed back in events.
    pub user_ptr: u64,
    pub eq: EqHandle,
}

impl Default for MdDesc {
    fn default() -> Self {
        Self {
            memory: vec![],
            threshold: MD_THRESH_INF,
            max_size: 0,
            options: 0,
            user_ptr: 0,
            eq: EqHandle::INVALID,
        }
    }
}

impl MdDesc {
    /// A single contiguous buffer.
    pub fn contiguous(buf: IoBuf, threshold: i32, options: u32) -> MdDesc {
        MdDesc {
            memory: vec![buf],
            threshold,
            options,
            ..Default::default()
        }
    }

    pub(crate) fn validate(&self) -> LnetResult<()> {
        let frags = self.options & (MD_IOVEC | MD_KIOV);
        if frags == MD_IOVEC | MD_KIOV {
            log::error!("Invalid option: both IOVEC and KIOV set");
            return Err(LnetError::Invalid);
        }
        if frags == 0 && self.memory.len() > 1 {
            log::error!(
                "Contiguous MD can't have {} fragments",
                self.memory.len()
            );
            return Err(LnetError::Invalid);
        }
        if frags != 0 && self.memory.len() > MAX_IOV {
            log::error!(
                "Invalid option: too many fragments {}, {} max",
                self.memory.len(),
                MAX_IOV
            );
            return Err(LnetError::Invalid);
        }
        if self.options & MD_KIOV != 0 {
            if let Some(frag) = self.memory.iter().find(|f| f.len() > PAGE_SIZE as usize) {
                log::error!("KIOV fragment of {} bytes exceeds a page", frag.len());
                return Err(LnetError::Invalid);
            }
        }
        if self.threshold < MD_THRESH_INF {
            return Err(LnetError::Invalid);
        }
        let length: usize = self.memory.iter().map(|f| f.len()).sum();
        if length > u32::MAX as usize {
            return Err(LnetError::Invalid);
        }
        if self.options & MD_MAX_SIZE != 0 && self.max_size as usize > length {
            log::error!(
                "Invalid max_size {} for MD of {} bytes",
                self.max_size,
                length
            );
            return Err(LnetError::Invalid);
        }
        Ok(())
    }
}

/// Snapshot of an MD as reported in events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MdInfo {
    pub length: u32,
    pub niov: u32,
    pub threshold: i32,
    pub max_size: u32,
    pub options: u32,
    pub user_ptr: u64,
    pub eq: Option<EqHandle>,
}

/// The library side of an MD.
pub(crate) struct Md {
    pub(crate) memory: Vec<IoBuf>,
    pub(crate) length: u32,
    pub(crate) offset: u32,
    pub(crate) threshold: i32,
    pub(crate) max_size: u32,
    pub(crate) options: u32,
    pub(crate) flags: u32,
    pub(crate) refcount: u32,
    pub(crate) user_ptr: u64,
    pub(crate) eq: Option<(EqHandle, Arc<EventQueue>)>,
    /// Cookie of the ME this MD is attached to.
    pub(crate) me: Option<u64>,
}

impl Default for Md {
    fn default() -> Self {
        Self {
            memory: vec![],
            length: 0,
            offset: 0,
            threshold: 0,
            max_size: 0,
            options: 0,
            flags: 0,
            refcount: 0,
            user_ptr: 0,
            eq: None,
            me: None,
        }
    }
}

impl Recycle for Md {
    fn recycle(&mut self) {
        // Pooled MDs keep room for the largest fragment list.
        let mut memory = std::mem::take(&mut self.memory);
        memory.clear();
        memory.reserve(MAX_IOV);
        *self = Md {
            memory,
            ..Default::default()
        };
    }
}

impl Md {
    /// Fill a freshly allocated MD from a validated descriptor.
    pub(crate) fn build(&mut self, desc: &MdDesc, unlink: Unlink) {
        self.memory.extend(desc.memory.iter().cloned());
        self.length = desc.memory.iter().map(|f| f.len() as u32).sum();
        self.offset = 0;
        self.threshold = desc.threshold;
        self.max_size = desc.max_size;
        self.options = desc.options;
        self.user_ptr = desc.user_ptr;
        self.refcount = 0;
        self.flags = 0;
        if unlink == Unlink::Unlink || desc.options & MD_AUTO_UNLINK != 0 {
            self.flags |= MD_FLAG_AUTO_UNLINK;
        }
    }

    pub(crate) fn is_zombie(&self) -> bool {
        self.flags & MD_FLAG_ZOMBIE != 0
    }

    pub(crate) fn exhausted(&self) -> bool {
        self.threshold == 0
            || (self.options & MD_MAX_SIZE != 0
                && self.offset as u64 + self.max_size as u64 > self.length as u64)
    }

    pub(crate) fn unlinkable(&self) -> bool {
        if self.refcount != 0 {
            return false;
        }
        if self.is_zombie() {
            return true;
        }
        self.flags & MD_FLAG_AUTO_UNLINK != 0 && self.exhausted()
    }

    pub(crate) fn info(&self) -> MdInfo {
        MdInfo {
            length: self.length,
            niov: self.memory.len() as u32,
            threshold: self.threshold,
            max_size: self.max_size,
            options: self.options,
            user_ptr: self.user_ptr,
            eq: self.eq.as_ref().map(|(h, _)| *h),
        }
    }

    /// Commit the MD to one more operation.
    pub(crate) fn commit(&mut self) {
        self.refcount += 1;
        if self.threshold != MD_THRESH_INF {
            assert!(self.threshold > 0, "committing an exhausted MD");
            self.threshold -= 1;
        }
    }

    pub(crate) fn payload(&self, offset: u32, len: u32) -> Payload {
        Payload::new(self.memory.clone(), offset, len)
    }

    pub(crate) fn unlink_event(&self, handle: MdHandle) -> Event {
        Event {
            kind: EventKind::Unlink,
            unlinked: true,
            md: self.info(),
            md_handle: handle,
            ..Default::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_payload_scatter_gather() {
        let frags = vec![IoBuf::new(3), IoBuf::new(3), IoBuf::new(3)];
        let payload = Payload::new(frags.clone(), 2, 5);
        assert_eq!(payload.write(&[1, 2, 3, 4, 5, 6]), 5);
        assert_eq!(frags[0].to_vec(), vec![0, 0, 1]);
        assert_eq!(frags[1].to_vec(), vec![2, 3, 4]);
        assert_eq!(frags[2].to_vec(), vec![5, 0, 0]);
        assert_eq!(payload.read(), vec![1, 2, 3, 4, 5]);

        // Same buffers on both sides.
        let shifted = Payload::new(frags.clone(), 0, 9);
        assert_eq!(shifted.copy_from(&payload), 5);
        assert_eq!(frags[0].to_vec(), vec![1, 2, 3]);
    }

    #[test]
    fn test_validate() {
        let mut desc = MdDesc::contiguous(IoBuf::new(16), 1, MD_OP_PUT);
        desc.validate().unwrap();

        desc.memory.push(IoBuf::new(1));
        assert_eq!(desc.validate(), Err(LnetError::Invalid));
        desc.options |= MD_IOVEC;
        desc.validate().unwrap();
        desc.options |= MD_KIOV;
        assert_eq!(desc.validate(), Err(LnetError::Invalid));

        let kiov = MdDesc {
            memory: vec![IoBuf::new(PAGE_SIZE as usize + 1)],
            options: MD_KIOV,
            ..Default::default()
        };
        assert_eq!(kiov.validate(), Err(LnetError::Invalid));

        let big = MdDesc {
            memory: vec![IoBuf::new(8)],
            options: MD_MAX_SIZE,
            max_size: 9,
            ..Default::default()
        };
        assert_eq!(big.validate(), Err(LnetError::Invalid));
    }

    #[test]
    fn test_exhaustion_and_unlinkable() {
        let desc = MdDesc {
            memory: vec![IoBuf::new(10)],
            threshold: MD_THRESH_INF,
            options: MD_OP_PUT | MD_MAX_SIZE,
            max_size: 4,
            ..Default::default()
        };
        let mut md = Md::default();
        md.build(&desc, Unlink::Unlink);
        assert!(!md.exhausted());
        md.commit();
        md.offset = 8;
        assert!(md.exhausted());
        assert!(!md.unlinkable());
        md.refcount = 0;
        assert!(md.unlinkable());

        let mut md = Md::default();
        md.build(&MdDesc::contiguous(IoBuf::new(1), 1, MD_OP_GET), Unlink::Retain);
        md.commit();
        md.refcount = 0;
        assert!(md.exhausted());
        assert!(!md.unlinkable());
        md.flags |= MD_FLAG_ZOMBIE;
        assert!(md.unlinkable());
    }

    #[test]
    fn test_recycle_keeps_room() {
        let mut md = Md::default();
        md.build(&MdDesc::contiguous(IoBuf::new(1), 1, MD_OP_GET), Unlink::Retain);
        md.recycle();
        assert!(md.memory.is_empty());
        assert!(md.memory.capacity() >= MAX_IOV);
        assert_eq!(md.threshold, 0);
        assert!(md.eq.is_none());
    }
}
