// Copyright (c) Meta Platforms, Inc. and affiliates.
//
// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! The parts of an incoming RPC the schedulers look at.

use serde::Deserialize;
use serde::Serialize;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Opcode {
    OstRead,
    OstWrite,
    OstPunch,
    ObdPing,
    Other(u32),
}

impl fmt::Display for Opcode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Opcode::OstRead => write!(f, "ost_read"),
            Opcode::OstWrite => write!(f, "ost_write"),
            Opcode::OstPunch => write!(f, "ost_punch"),
            Opcode::ObdPing => write!(f, "obd_ping"),
            Opcode::Other(opc) => write!(f, "opc {}", opc),
        }
    }
}

/// One contiguous piece of a bulk transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Niobuf {
    pub offset: u64,
    pub len: u32,
}

/// An object of a bulk I/O and how many niobufs describe its part.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct IoObj {
    pub object_id: u64,
    pub bufcnt: u32,
}

/// Body of an OST request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct OstBody {
    pub object_id: u64,
}

/// An RPC as handed to the request scheduler.
///
/// `body`, `ioobjs` and `niobufs` are what the client sent and may be
/// missing or short; schedulers that need them refuse the request and it
/// is served by the fallback policy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Request {
    pub xid: u64,
    /// Who sent it, for tracing.
    pub peer: String,
    pub opcode: Opcode,
    /// Index of the OST the request was sent to.
    pub ost_idx: u32,
    pub body: Option<OstBody>,
    pub ioobjs: Vec<IoObj>,
    pub niobufs: Vec<Niobuf>,
}

impl Request {
    /// A bulk read or write of `niobufs` from object `object_id`.
    pub fn brw(xid: u64, write: bool, ost_idx: u32, object_id: u64, niobufs: Vec<Niobuf>) -> Request {
        Request {
            xid,
            peer: String::new(),
            opcode: if write {
                Opcode::OstWrite
            } else {
                Opcode::OstRead
            },
            ost_idx,
            body: Some(OstBody { object_id }),
            ioobjs: vec![IoObj {
                object_id,
                bufcnt: niobufs.len() as u32,
            }],
            niobufs,
        }
    }

    /// A request without a bulk part.
    pub fn simple(xid: u64, opcode: Opcode) -> Request {
        Request {
            xid,
            peer: String::new(),
            opcode,
            ost_idx: 0,
            body: None,
            ioobjs: vec![],
            niobufs: vec![],
        }
    }

    pub fn is_write(&self) -> bool {
        self.opcode == Opcode::OstWrite
    }

    /// The niobufs announced by the ioobjs, None when the request carries
    /// fewer than that or none at all.
    pub fn announced_niobufs(&self) -> Option<&[Niobuf]> {
        let count: usize = self.ioobjs.iter().map(|ioo| ioo.bufcnt as usize).sum();
        if count == 0 || count > self.niobufs.len() {
            return None;
        }
        Some(&self.niobufs[..count])
    }
}

impl fmt::Display for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "x{} {}", self.xid, self.opcode)?;
        if !self.peer.is_empty() {
            write!(f, " from {}", self.peer)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_announced_niobufs() {
        let nb = |offset| Niobuf { offset, len: 4096 };
        let mut req = Request::brw(1, false, 0, 7, vec![nb(0), nb(8192)]);
        assert_eq!(req.announced_niobufs().map(|n| n.len()), Some(2));

        req.ioobjs[0].bufcnt = 3;
        assert_eq!(req.announced_niobufs(), None);
        req.ioobjs.clear();
        assert_eq!(req.announced_niobufs(), None);
        assert_eq!(Request::simple(2, Opcode::ObdPing).announced_niobufs(), None);
    }
}
