// Copyright (c) Meta Platforms, Inc. and affiliates.
//
// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! # Identifiers and the message header
//!
//! A NID names one network interface: the upper 32 bits carry the network
//! (LND type in the upper half, network number in the lower half) and the
//! lower 32 bits the address on that network.
//!
//!```
//!     use lnet::Nid;
//!
//!     let nid: Nid = "192.168.1.5@tcp1".parse().unwrap();
//!     assert_eq!(nid.net().num(), 1);
//!     assert_eq!(nid.to_string(), "192.168.1.5@tcp1");
//!     assert_eq!("0@lo".parse::<Nid>().unwrap(), Nid::LOOPBACK);
//!```

use anyhow::bail;
use anyhow::Context;
use anyhow::Result;
use lazy_static::lazy_static;
use serde::Deserialize;
use serde::Serialize;
use sscanf::sscanf;
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

pub const SOCKLND: u16 = 2;
pub const PTLLND: u16 = 4;
pub const O2IBLND: u16 = 5;
pub const LOLND: u16 = 9;
pub const MXLND: u16 = 12;
pub const GNILND: u16 = 13;

/// Largest payload a single message may carry.
pub const MTU: u32 = 1 << 20;
pub const MAX_PAYLOAD: u32 = MTU;
pub const PAGE_SIZE: u32 = 4096;
/// Size of the wire header, accounted in `txqnob` next to the payload.
pub const HDR_SIZE: u32 = 72;
pub const MAX_IOV: usize = 256;
pub const MAX_PORTALS: usize = 64;

/// Process ids with this bit set belong to userspace processes and are
/// never subject to peer aliveness checks.
pub const PID_USERFLAG: u32 = 0x8000_0000;
pub const PID_ANY: u32 = u32::MAX;
/// Well-known pid used to address routers.
pub const LUSTRE_SRV_PID: u32 = 12345;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AddrFmt {
    Ip,
    Num,
}

struct LndName {
    name: &'static str,
    fmt: AddrFmt,
}

lazy_static! {
    static ref LND_NAMES: BTreeMap<u16, LndName> = {
        let mut m = BTreeMap::new();
        m.insert(LOLND, LndName { name: "lo", fmt: AddrFmt::Num });
        m.insert(SOCKLND, LndName { name: "tcp", fmt: AddrFmt::Ip });
        m.insert(O2IBLND, LndName { name: "o2ib", fmt: AddrFmt::Ip });
        m.insert(PTLLND, LndName { name: "ptl", fmt: AddrFmt::Num });
        m.insert(MXLND, LndName { name: "mx", fmt: AddrFmt::Ip });
        m.insert(GNILND, LndName { name: "gni", fmt: AddrFmt::Num });
        m
    };
}

/// Name of an LND type, `None` when unknown.
pub fn lnd_name(lnd: u16) -> Option<&'static str> {
    LND_NAMES.get(&lnd).map(|n| n.name)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NetId(u32);

impl NetId {
    pub const ANY: NetId = NetId(u32::MAX);
    pub const LOOPBACK: NetId = NetId((LOLND as u32) << 16);

    pub fn new(lnd: u16, num: u16) -> NetId {
        NetId(((lnd as u32) << 16) | num as u32)
    }

    pub fn from_raw(raw: u32) -> NetId {
        NetId(raw)
    }

    pub fn raw(&self) -> u32 {
        self.0
    }

    pub fn lnd_type(&self) -> u16 {
        (self.0 >> 16) as u16
    }

    pub fn num(&self) -> u16 {
        self.0 as u16
    }

    pub fn is_any(&self) -> bool {
        *self == NetId::ANY
    }
}

impl fmt::Display for NetId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_any() {
            return write!(f, "<?>");
        }
        let name = lnd_name(self.lnd_type()).unwrap_or("?");
        match self.num() {
            0 => write!(f, "{}", name),
            n => write!(f, "{}{}", name, n),
        }
    }
}

impl FromStr for NetId {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<NetId> {
        let s = s.trim();
        // "o2ib" carries a digit, so split after the longest known name.
        let found = LND_NAMES
            .iter()
            .filter(|(_, n)| s.starts_with(n.name))
            .max_by_key(|(_, n)| n.name.len());
        let (lnd, num) = match found {
            Some((ty, n)) => (*ty, &s[n.name.len()..]),
            None => bail!("Unknown network type {:?}", s),
        };
        let num = if num.is_empty() {
            0
        } else {
            num.parse::<u16>()
                .with_context(|| format!("Bad network number in {:?}", s))?
        };
        Ok(NetId::new(lnd, num))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Nid(u64);

impl Nid {
    pub const ANY: Nid = Nid(u64::MAX);
    pub const LOOPBACK: Nid = Nid((NetId::LOOPBACK.0 as u64) << 32);

    pub fn new(net: NetId, addr: u32) -> Nid {
        Nid(((net.0 as u64) << 32) | addr as u64)
    }

    pub fn from_raw(raw: u64) -> Nid {
        Nid(raw)
    }

    pub fn raw(&self) -> u64 {
        self.0
    }

    pub fn net(&self) -> NetId {
        NetId((self.0 >> 32) as u32)
    }

    pub fn addr(&self) -> u32 {
        self.0 as u32
    }

    pub fn is_any(&self) -> bool {
        *self == Nid::ANY
    }
}

impl fmt::Display for Nid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_any() {
            return write!(f, "<?>");
        }
        let addr = self.addr();
        match LND_NAMES.get(&self.net().lnd_type()).map(|n| n.fmt) {
            Some(AddrFmt::Ip) => write!(
                f,
                "{}.{}.{}.{}@{}",
                addr >> 24,
                (addr >> 16) & 0xff,
                (addr >> 8) & 0xff,
                addr & 0xff,
                self.net()
            ),
            _ => write!(f, "{}@{}", addr, self.net()),
        }
    }
}

impl FromStr for Nid {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Nid> {
        let s = s.trim();
        if s == "*" {
            return Ok(Nid::ANY);
        }
        let (addr, net) = match s.rsplit_once('@') {
            Some(parts) => parts,
            None => bail!("Missing network in NID {:?}", s),
        };
        let net: NetId = net.parse()?;
        let addr = match LND_NAMES.get(&net.lnd_type()).map(|n| n.fmt) {
            Some(AddrFmt::Ip) => match sscanf!(addr, "{u8}.{u8}.{u8}.{u8}") {
                Ok((a, b, c, d)) => u32::from_be_bytes([a, b, c, d]),
                Err(_) => bail!("Bad IPv4 address in NID {:?}", s),
            },
            _ => addr
                .parse::<u32>()
                .with_context(|| format!("Bad address in NID {:?}", s))?,
        };
        Ok(Nid::new(net, addr))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ProcessId {
    pub nid: Nid,
    pub pid: u32,
}

impl ProcessId {
    pub const ANY: ProcessId = ProcessId {
        nid: Nid::ANY,
        pid: PID_ANY,
    };

    pub fn new(nid: Nid, pid: u32) -> ProcessId {
        ProcessId { nid, pid }
    }
}

impl fmt::Display for ProcessId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.pid & PID_USERFLAG != 0 {
            write!(f, "U{}-{}", self.pid & !PID_USERFLAG, self.nid)
        } else {
            write!(f, "{}-{}", self.pid, self.nid)
        }
    }
}

/// Remote reference to an MD, carried in PUT/GET/ACK/REPLY headers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct WireHandle {
    pub interface_cookie: u64,
    pub object_cookie: u64,
}

impl WireHandle {
    pub const NONE: WireHandle = WireHandle {
        interface_cookie: u64::MAX,
        object_cookie: u64::MAX,
    };

    pub fn is_none(&self) -> bool {
        *self == WireHandle::NONE
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MsgType {
    Ack,
    Put,
    Get,
    Reply,
}

impl fmt::Display for MsgType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            MsgType::Ack => "ACK",
            MsgType::Put => "PUT",
            MsgType::Get => "GET",
            MsgType::Reply => "REPLY",
        };
        write!(f, "{}", s)
    }
}

/// Type specific part of the header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HdrBody {
    Ack {
        dst_wmd: WireHandle,
        match_bits: u64,
        mlength: u32,
    },
    Put {
        ack_wmd: WireHandle,
        match_bits: u64,
        hdr_data: u64,
        ptl_index: u32,
        offset: u32,
    },
    Get {
        return_wmd: WireHandle,
        match_bits: u64,
        ptl_index: u32,
        src_offset: u32,
        sink_length: u32,
    },
    Reply {
        dst_wmd: WireHandle,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Hdr {
    pub dest_nid: Nid,
    pub src_nid: Nid,
    pub dest_pid: u32,
    pub src_pid: u32,
    pub payload_length: u32,
    pub body: HdrBody,
}

impl Default for Hdr {
    fn default() -> Hdr {
        Hdr {
            dest_nid: Nid::ANY,
            src_nid: Nid::ANY,
            dest_pid: PID_ANY,
            src_pid: PID_ANY,
            payload_length: 0,
            body: HdrBody::Reply {
                dst_wmd: WireHandle::NONE,
            },
        }
    }
}

impl Hdr {
    pub fn msg_type(&self) -> MsgType {
        match self.body {
            HdrBody::Ack { .. } => MsgType::Ack,
            HdrBody::Put { .. } => MsgType::Put,
            HdrBody::Get { .. } => MsgType::Get,
            HdrBody::Reply { .. } => MsgType::Reply,
        }
    }

    pub fn src(&self) -> ProcessId {
        ProcessId::new(self.src_nid, self.src_pid)
    }

    pub fn dest(&self) -> ProcessId {
        ProcessId::new(self.dest_nid, self.dest_pid)
    }
}

impl fmt::Display for Hdr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} -> {} len {}",
            self.msg_type(),
            self.src(),
            self.dest(),
            self.payload_length
        )?;
        match self.body {
            HdrBody::Put {
                ptl_index,
                match_bits,
                offset,
                hdr_data,
                ..
            } => write!(
                f,
                " ptl {} mb {:#x} offset {} hdr_data {:#x}",
                ptl_index, match_bits, offset, hdr_data
            ),
            HdrBody::Get {
                ptl_index,
                match_bits,
                src_offset,
                sink_length,
                ..
            } => write!(
                f,
                " ptl {} mb {:#x} offset {} sink {}",
                ptl_index, match_bits, src_offset, sink_length
            ),
            HdrBody::Ack {
                match_bits,
                mlength,
                ..
            } => write!(f, " mb {:#x} mlength {}", match_bits, mlength),
            HdrBody::Reply { .. } => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_nid_parse_and_format() {
        let nid: Nid = "10.0.0.1@o2ib".parse().unwrap();
        assert_eq!(nid.net(), NetId::new(O2IBLND, 0));
        assert_eq!(nid.addr(), 0x0a00_0001);
        assert_eq!(nid.to_string(), "10.0.0.1@o2ib");

        let nid: Nid = "17@gni3".parse().unwrap();
        assert_eq!(nid.net().lnd_type(), GNILND);
        assert_eq!(nid.net().num(), 3);
        assert_eq!(nid.to_string(), "17@gni3");

        assert_eq!("*".parse::<Nid>().unwrap(), Nid::ANY);
        assert_eq!(Nid::LOOPBACK.to_string(), "0@lo");
    }

    #[test]
    fn test_nid_parse_errors() {
        assert!("10.0.0.1".parse::<Nid>().is_err());
        assert!("10.0.0@tcp".parse::<Nid>().is_err());
        assert!("1@nosuch".parse::<Nid>().is_err());
        assert!("x@lo".parse::<Nid>().is_err());
    }

    #[test]
    fn test_process_id_display() {
        let nid: Nid = "1.2.3.4@tcp".parse().unwrap();
        assert_eq!(ProcessId::new(nid, 12345).to_string(), "12345-1.2.3.4@tcp");
        assert_eq!(
            ProcessId::new(nid, PID_USERFLAG | 7).to_string(),
            "U7-1.2.3.4@tcp"
        );
    }

    #[test]
    fn test_hdr_type() {
        let mut hdr = Hdr::default();
        assert_eq!(hdr.msg_type(), MsgType::Reply);
        hdr.body = HdrBody::Get {
            return_wmd: WireHandle::NONE,
            match_bits: 1,
            ptl_index: 4,
            src_offset: 0,
            sink_length: 100,
        };
        assert_eq!(hdr.msg_type(), MsgType::Get);
        assert!(hdr.to_string().starts_with("GET"));
    }
}
