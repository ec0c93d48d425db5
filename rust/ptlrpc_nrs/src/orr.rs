// Copyright (c) Meta Platforms, Inc. and affiliates.
//
// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! # Object and target round robin
//!
//! ORR batches bulk I/O requests by the backend object they touch, TRR by
//! the OST they are sent to. Each object (or target) is served up to
//! `quantum` requests per round, and within a round requests go out by
//! ascending offset so the disk sees sequential I/O.
//!
//! Every queued request carries the round its object was in when it
//! arrived. An object joins a fresh round when it has no requests queued
//! or used up its quantum, and rounds are numbered in the order objects
//! join them, so objects with a lot of traffic can't starve the others:
//! a newcomer always lands before the next batch of a busy object.
//!
//! Offsets are logical file offsets unless the policy is set to physical
//! offsets and the backend can map the request to exactly one extent;
//! physical offsets are only ever used for reads.

use crate::error::NrsError;
use crate::error::NrsResult;
use crate::extent::ExtentMapper;
use crate::policy::Compat;
use crate::policy::CtlOp;
use crate::policy::CtlReply;
use crate::policy::Policy;
use crate::policy::PolicyDesc;
use crate::policy::PolicyEnv;
use crate::policy::ReqId;
use crate::policy::ResId;
use crate::request::Opcode;
use crate::request::Request;
use anyhow::anyhow;
use cfs_utils::BinHeap;
use cfs_utils::HeapHandle;
use serde::Deserialize;
use serde::Serialize;
use std::cmp::Ordering;
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::PoisonError;
use std::sync::RwLock;

pub const QUANTUM_DFLT: u16 = 256;

/// Extents asked of the backend per request.
const ORR_NUM_EXTENTS: usize = 1;

/// Service the ORR and TRR policies apply to.
pub const OST_IO_SERVICE: &str = "ost_io";

pub const ORR_DESC: PolicyDesc = PolicyDesc {
    name: "orr",
    fallback: false,
    reg_start: false,
    external: false,
    compat: Compat::Service(OST_IO_SERVICE),
    init: OrrPolicy::create_orr,
};

pub const TRR_DESC: PolicyDesc = PolicyDesc {
    name: "trr",
    fallback: false,
    reg_start: false,
    external: false,
    compat: Compat::Service(OST_IO_SERVICE),
    init: OrrPolicy::create_trr,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrrKind {
    /// Batches by backend object.
    Orr,
    /// Batches by OST.
    Trr,
}

impl OrrKind {
    pub fn name(&self) -> &'static str {
        match self {
            OrrKind::Orr => "orr",
            OrrKind::Trr => "trr",
        }
    }
}

/// Requests the policy schedules; the others go to the fallback policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SuppReq {
    Read,
    Write,
    ReadWrite,
}

impl SuppReq {
    pub fn supports(&self, opcode: Opcode) -> bool {
        matches!(
            (self, opcode),
            (SuppReq::Read, Opcode::OstRead)
                | (SuppReq::Write, Opcode::OstWrite)
                | (SuppReq::ReadWrite, Opcode::OstRead)
                | (SuppReq::ReadWrite, Opcode::OstWrite)
        )
    }
}

impl FromStr for SuppReq {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<SuppReq> {
        match s {
            "read" => Ok(SuppReq::Read),
            "write" => Ok(SuppReq::Write),
            "readwrite" => Ok(SuppReq::ReadWrite),
            _ => Err(anyhow!("{s} is not a supported request type")),
        }
    }
}

impl fmt::Display for SuppReq {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SuppReq::Read => "reads",
            SuppReq::Write => "writes",
            SuppReq::ReadWrite => "reads_and_writes",
        };
        write!(f, "{}", s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OffsetType {
    Physical,
    Logical,
}

impl FromStr for OffsetType {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<OffsetType> {
        match s {
            "physical" => Ok(OffsetType::Physical),
            "logical" => Ok(OffsetType::Logical),
            _ => Err(anyhow!("{s} is not an offset type")),
        }
    }
}

impl fmt::Display for OffsetType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            OffsetType::Physical => "physical",
            OffsetType::Logical => "logical",
        };
        write!(f, "{}", s)
    }
}

#[derive(Debug, Clone, Copy)]
struct Settings {
    quantum: u16,
    offset_type: OffsetType,
    supp: SuppReq,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            quantum: QUANTUM_DFLT,
            offset_type: OffsetType::Physical,
            supp: SuppReq::Read,
        }
    }
}

/// What requests are batched by. TRR leaves `object_id` at 0.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct OrrKey {
    pub ost_idx: u32,
    pub object_id: u64,
}

/// Bytes `start..=end` of the object a request covers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Range {
    pub start: u64,
    pub end: u64,
}

/// An object, or a target for TRR, and its place in the rounds.
#[derive(Debug)]
struct OrrObject {
    key: OrrKey,
    /// Requests holding the object.
    refs: usize,
    round: u64,
    /// Requests left in the current round.
    quantum: u16,
    /// Requests queued.
    active: usize,
    started: bool,
}

/// Heap position of a queued request.
#[derive(Debug, PartialEq, Eq)]
struct HeapEntry {
    round: u64,
    start: u64,
    end: u64,
    id: ReqId,
}

impl Ord for HeapEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        // Shorter spans go first on the same start offset.
        self.round
            .cmp(&other.round)
            .then_with(|| self.start.cmp(&other.start))
            .then_with(|| self.end.cmp(&other.end))
            .then_with(|| self.id.cmp(&other.id))
    }
}

impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Scheduling state of one request, named by the `ResId` handed out for
/// it.
#[derive(Debug)]
struct OrrReq {
    obj: usize,
    range: Range,
    round: u64,
    node: Option<HeapHandle>,
}

#[derive(Default)]
struct OrrData {
    heap: BinHeap<HeapEntry>,
    objects: Vec<OrrObject>,
    index: HashMap<OrrKey, usize>,
    reqs: HashMap<usize, OrrReq>,
    next_res: usize,
    /// Next round to hand out.
    round: u64,
}

/// Snapshot of one request as scheduled, for tracing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OrrReqInfo {
    pub key: OrrKey,
    pub range: Range,
    pub round: u64,
}

pub struct OrrPolicy {
    kind: OrrKind,
    name: String,
    mapper: Option<Arc<dyn ExtentMapper>>,
    settings: RwLock<Settings>,
    data: Mutex<OrrData>,
}

impl OrrPolicy {
    pub fn new(kind: OrrKind, env: &PolicyEnv) -> OrrPolicy {
        OrrPolicy {
            kind,
            name: format!("nrs_{}_{}_cpt_{}", kind.name(), env.queue, env.cpt),
            mapper: env.mapper.clone(),
            settings: RwLock::new(Settings::default()),
            data: Mutex::new(OrrData::default()),
        }
    }

    fn create_orr(env: &PolicyEnv) -> Arc<dyn Policy> {
        Arc::new(OrrPolicy::new(OrrKind::Orr, env))
    }

    fn create_trr(env: &PolicyEnv) -> Arc<dyn Policy> {
        Arc::new(OrrPolicy::new(OrrKind::Trr, env))
    }

    fn settings(&self) -> Settings {
        *self.settings.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_data(&self) -> std::sync::MutexGuard<'_, OrrData> {
        self.data.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn req_info(&self, res: ResId) -> Option<OrrReqInfo> {
        let data = self.lock_data();
        let oreq = data.reqs.get(&res.0)?;
        Some(OrrReqInfo {
            key: data.objects[oreq.obj].key,
            range: oreq.range,
            round: oreq.round,
        })
    }

    fn key_fill(&self, req: &Request) -> NrsResult<OrrKey> {
        let object_id = match self.kind {
            OrrKind::Orr => match &req.body {
                Some(body) => body.object_id,
                None => return Err(NrsError::Fault),
            },
            OrrKind::Trr => 0,
        };
        Ok(OrrKey {
            ost_idx: req.ost_idx,
            object_id,
        })
    }

    /// Byte range of the request in file offsets, from its first to the
    /// end of its last niobuf.
    fn logical_range(req: &Request) -> NrsResult<Range> {
        let nb = match req.announced_niobufs() {
            Some(nb) => nb,
            None => return Err(NrsError::Fault),
        };
        let first = nb[0];
        let last = nb[nb.len() - 1];
        let end = match last.offset.checked_add(last.len as u64) {
            Some(end) => end.saturating_sub(1),
            // Runs past the largest offset.
            None => return Err(NrsError::Fault),
        };
        Ok(Range {
            start: first.offset,
            end: end.max(first.offset),
        })
    }

    /// Translate `log` to disk offsets. Ranges the backend can't map to a
    /// single extent keep their logical offsets.
    fn log2phys(&self, mapper: &dyn ExtentMapper, req: &Request, log: Range) -> NrsResult<Range> {
        let object_id = req.body.map_or(0, |body| body.object_id);
        let len = log.end - log.start;
        // Ask for one more than we use to tell multiple extents apart.
        let exts = match mapper.fiemap(
            req.ost_idx,
            object_id,
            log.start,
            len + 1,
            ORR_NUM_EXTENTS + 1,
        ) {
            Ok(exts) => exts,
            Err(e) => {
                log::error!("fiemap of {} failed: {:#}", req, e);
                return Err(NrsError::Fault);
            }
        };
        match exts.as_slice() {
            [ext] if ext.covers(log.start, len + 1) => {
                let start = ext.physical + (log.start - ext.logical);
                Ok(Range {
                    start,
                    end: start + len,
                })
            }
            exts => {
                log::debug!(
                    "{}: {} extents for {}..={}, using logical offsets",
                    req,
                    exts.len(),
                    log.start,
                    log.end
                );
                Ok(log)
            }
        }
    }

    fn range_fill(&self, req: &Request, settings: &Settings, moving: bool) -> NrsResult<Range> {
        let range = Self::logical_range(req)?;
        let physical = settings.offset_type == OffsetType::Physical && !req.is_write();
        match &self.mapper {
            // Mapping may block.
            Some(mapper) if physical && !moving => self.log2phys(mapper.as_ref(), req, range),
            _ => Ok(range),
        }
    }
}

impl Policy for OrrPolicy {
    fn start(&self) -> NrsResult<()> {
        let mut data = self.lock_data();
        *data = OrrData::default();
        log::debug!("Started {}", self.name);
        Ok(())
    }

    fn stop(&self) {
        let mut data = self.lock_data();
        assert!(data.heap.is_empty(), "stopping {} with requests queued", self.name);
        for obj in data.objects.iter() {
            match self.kind {
                OrrKind::Orr => assert_eq!(
                    obj.refs, 0,
                    "Busy NRS orr policy for object with objid {:#x} at OST with OST index {}",
                    obj.key.object_id, obj.key.ost_idx
                ),
                OrrKind::Trr => assert_eq!(
                    obj.refs, 0,
                    "Busy NRS trr policy at OST with index {}",
                    obj.key.ost_idx
                ),
            }
        }
        *data = OrrData::default();
        log::debug!("Stopped {}", self.name);
    }

    fn ctl(&self, op: &CtlOp) -> NrsResult<CtlReply> {
        let mut settings = self.settings.write().unwrap_or_else(PoisonError::into_inner);
        match op {
            CtlOp::RdQuantum => Ok(CtlReply::Quantum(settings.quantum)),
            CtlOp::WrQuantum(0) => Err(NrsError::Invalid),
            CtlOp::WrQuantum(quantum) => {
                settings.quantum = *quantum;
                Ok(CtlReply::Done)
            }
            CtlOp::RdOffType => Ok(CtlReply::OffType(settings.offset_type)),
            CtlOp::WrOffType(s) => {
                settings.offset_type = s.parse().map_err(|_| NrsError::Invalid)?;
                Ok(CtlReply::Done)
            }
            CtlOp::RdSuppReq => Ok(CtlReply::SuppReq(settings.supp)),
            CtlOp::WrSuppReq(s) => {
                settings.supp = s.parse().map_err(|_| NrsError::Invalid)?;
                Ok(CtlReply::Done)
            }
            _ => Err(NrsError::Invalid),
        }
    }

    fn res_get(&self, _id: ReqId, req: &Request, moving: bool) -> Option<ResId> {
        let settings = self.settings();
        if !settings.supp.supports(req.opcode) {
            return None;
        }
        let key = match self.key_fill(req) {
            Ok(key) => key,
            Err(e) => {
                log::debug!("{}: no {} key for {}: {}", self.name, self.kind.name(), req, e);
                return None;
            }
        };
        let range = match self.range_fill(req, &settings, moving) {
            Ok(range) => range,
            Err(e) => {
                log::debug!("{}: no range for {}: {}", self.name, req, e);
                return None;
            }
        };

        let mut data = self.lock_data();
        let obj = match data.index.get(&key) {
            Some(obj) => *obj,
            None => {
                data.objects.push(OrrObject {
                    key,
                    refs: 0,
                    round: 0,
                    quantum: settings.quantum,
                    active: 0,
                    started: false,
                });
                let obj = data.objects.len() - 1;
                data.index.insert(key, obj);
                obj
            }
        };
        data.objects[obj].refs += 1;

        let res = data.next_res;
        data.next_res += 1;
        data.reqs.insert(
            res,
            OrrReq {
                obj,
                range,
                round: 0,
                node: None,
            },
        );
        Some(ResId(res))
    }

    fn res_put(&self, id: ReqId, res: ResId) {
        let mut data = self.lock_data();
        let oreq = match data.reqs.remove(&res.0) {
            Some(oreq) => oreq,
            None => panic!("{} released unknown resource {:?} of {}", id, res, self.name),
        };
        assert!(oreq.node.is_none(), "{} released while queued", id);
        let obj = &mut data.objects[oreq.obj];
        assert!(obj.refs > 0, "ORR object {:?} refcount underflow", obj.key);
        obj.refs -= 1;
    }

    fn req_add(&self, id: ReqId, _req: &Request, res: ResId) -> NrsResult<()> {
        let mut guard = self.lock_data();
        let data = &mut *guard;
        let oreq = match data.reqs.get_mut(&res.0) {
            Some(oreq) => oreq,
            None => panic!("{} queued on {} without a resource", id, self.name),
        };
        let obj = &mut data.objects[oreq.obj];

        if !obj.started || obj.active == 0 {
            obj.round = data.round;
            data.round += 1;
            obj.started = true;
        }
        oreq.round = obj.round;
        oreq.node = Some(data.heap.insert(HeapEntry {
            round: oreq.round,
            start: oreq.range.start,
            end: oreq.range.end,
            id,
        }));

        obj.active += 1;
        obj.quantum -= 1;
        if obj.quantum == 0 {
            obj.quantum = self.settings().quantum;
            obj.started = false;
        }
        Ok(())
    }

    fn req_poll(&self) -> Option<ReqId> {
        let data = self.lock_data();
        data.heap.peek().map(|(_, entry)| entry.id)
    }

    fn req_del(&self, id: ReqId, res: ResId) {
        let mut guard = self.lock_data();
        let data = &mut *guard;
        let oreq = match data.reqs.get_mut(&res.0) {
            Some(oreq) => oreq,
            None => panic!("{} is not queued on {}", id, self.name),
        };
        let obj = &mut data.objects[oreq.obj];
        assert!(oreq.round < data.round);
        assert!(oreq.round <= obj.round);

        let node = match oreq.node.take() {
            Some(node) => node,
            None => panic!("{} is not queued on {}", id, self.name),
        };
        if data.heap.remove(node).is_none() {
            panic!("{} missing from the {} heap", id, self.name);
        }
        obj.active -= 1;
    }

    fn req_start(&self, _id: ReqId, res: ResId, req: &Request) {
        if let Some(info) = self.req_info(res) {
            match self.kind {
                OrrKind::Orr => log::debug!(
                    "NRS start orr request {} for object with ID {:#x} from OST with index {}, with round {}",
                    req,
                    info.key.object_id,
                    info.key.ost_idx,
                    info.round
                ),
                OrrKind::Trr => log::debug!(
                    "NRS start trr request {} from OST with index {}, with round {}",
                    req,
                    info.key.ost_idx,
                    info.round
                ),
            }
        }
    }

    fn req_stop(&self, _id: ReqId, res: ResId, req: &Request) {
        if let Some(info) = self.req_info(res) {
            log::debug!(
                "NRS stop {} request {} from OST with index {}, with round {}",
                self.kind.name(),
                req,
                info.key.ost_idx,
                info.round
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::extent::ExtentTable;
    use crate::policy::QueueType;
    use crate::request::Niobuf;

    fn env(mapper: Option<Arc<dyn ExtentMapper>>) -> PolicyEnv {
        PolicyEnv {
            service: OST_IO_SERVICE.to_string(),
            cpt: 0,
            queue: QueueType::Reg,
            mapper,
        }
    }

    fn read(xid: u64, object_id: u64, offset: u64, len: u32) -> Request {
        Request::brw(xid, false, 0, object_id, vec![Niobuf { offset, len }])
    }

    /// Queues in a test, keeping track of the resources handed out.
    struct Queue {
        pol: OrrPolicy,
        held: HashMap<ReqId, ResId>,
    }

    impl Queue {
        fn new(kind: OrrKind, mapper: Option<Arc<dyn ExtentMapper>>) -> Queue {
            let pol = OrrPolicy::new(kind, &env(mapper));
            pol.start().unwrap();
            Queue {
                pol,
                held: HashMap::new(),
            }
        }

        fn add(&mut self, id: u64, req: &Request) -> ResId {
            let res = self.pol.res_get(ReqId(id), req, false).unwrap();
            self.pol.req_add(ReqId(id), req, res).unwrap();
            self.held.insert(ReqId(id), res);
            res
        }

        fn info(&self, id: u64) -> OrrReqInfo {
            self.pol.req_info(self.held[&ReqId(id)]).unwrap()
        }

        /// Poll and dequeue everything, in service order.
        fn drain(&mut self) -> Vec<u64> {
            let mut out = vec![];
            while let Some(id) = self.pol.req_poll() {
                let res = self.held.remove(&id).unwrap();
                self.pol.req_del(id, res);
                self.pol.res_put(id, res);
                out.push(id.raw());
            }
            out
        }
    }

    #[test]
    fn test_heap_order() {
        let entry = |round, start, end, id| HeapEntry {
            round,
            start,
            end,
            id: ReqId(id),
        };
        assert!(entry(0, 100, 200, 1) < entry(1, 0, 10, 0));
        assert!(entry(0, 10, 19, 1) < entry(0, 30, 39, 0));
        assert!(entry(0, 10, 14, 1) < entry(0, 10, 19, 0));
    }

    #[test]
    fn test_offset_order_within_round() {
        let mut q = Queue::new(OrrKind::Orr, None);
        q.add(0, &read(0, 1, 30, 10));
        q.add(1, &read(1, 1, 10, 10));
        q.add(2, &read(2, 1, 10, 5));
        assert_eq!(q.info(2).range, Range { start: 10, end: 14 });
        assert_eq!(q.drain(), vec![2, 1, 0]);
        q.pol.stop();
    }

    #[test]
    fn test_quantum_rounds() {
        let mut q = Queue::new(OrrKind::Orr, None);
        q.pol.ctl(&CtlOp::WrQuantum(2)).unwrap();
        for id in 0..3 {
            q.add(id, &read(id, 1, id * 4096, 4096));
        }
        assert_eq!(q.info(1).round, q.info(0).round);
        assert_eq!(q.info(2).round, q.info(0).round + 1);
        q.drain();

        // An idle object always joins a new round.
        q.add(3, &read(3, 1, 0, 4096));
        assert_eq!(q.info(3).round, 2);
        q.drain();
        q.pol.stop();
    }

    #[test]
    fn test_trr_batches_by_target() {
        let mut q = Queue::new(OrrKind::Trr, None);
        q.add(0, &read(0, 1, 4096, 10));
        q.add(1, &read(1, 2, 0, 10));
        // Same OST, one object.
        assert_eq!(q.pol.lock_data().objects.len(), 1);
        assert_eq!(q.info(1).key.object_id, 0);
        assert_eq!(q.drain(), vec![1, 0]);
        q.pol.stop();
    }

    #[test]
    fn test_resources_per_grant() {
        let mut q = Queue::new(OrrKind::Orr, None);
        let req = read(0, 1, 0, 4096);
        let queued = q.add(0, &req);
        // A second grant for the same request leaves the first one alone.
        let other = q.pol.res_get(ReqId(0), &req, true).unwrap();
        assert_ne!(queued, other);
        q.pol.res_put(ReqId(0), other);
        assert_eq!(q.pol.lock_data().objects[0].refs, 1);
        assert_eq!(q.drain(), vec![0]);
        q.pol.stop();
    }

    #[test]
    fn test_unsupported_and_malformed() {
        let pol = OrrPolicy::new(OrrKind::Orr, &env(None));
        pol.start().unwrap();
        let write = Request::brw(0, true, 0, 1, vec![Niobuf { offset: 0, len: 1 }]);
        assert_eq!(pol.res_get(ReqId(0), &write, false), None);
        pol.ctl(&CtlOp::WrSuppReq("readwrite".to_string())).unwrap();
        let res = pol.res_get(ReqId(0), &write, false).unwrap();
        pol.res_put(ReqId(0), res);

        let mut nobody = read(1, 1, 0, 1);
        nobody.body = None;
        assert_eq!(pol.res_get(ReqId(1), &nobody, false), None);
        let mut nobufs = read(2, 1, 0, 1);
        nobufs.niobufs.clear();
        assert_eq!(pol.res_get(ReqId(2), &nobufs, false), None);
        pol.stop();
    }

    #[test]
    fn test_range_past_end_of_file() {
        let pol = OrrPolicy::new(OrrKind::Orr, &env(None));
        pol.start().unwrap();
        let wraps = read(0, 1, u64::MAX - 10, 4096);
        assert_eq!(OrrPolicy::logical_range(&wraps), Err(NrsError::Fault));
        assert_eq!(pol.res_get(ReqId(0), &wraps, false), None);

        // Ending exactly at the top still fits.
        let top = read(1, 1, u64::MAX - 4096, 4096);
        assert_eq!(
            OrrPolicy::logical_range(&top),
            Ok(Range {
                start: u64::MAX - 4096,
                end: u64::MAX - 1,
            })
        );
        let res = pol.res_get(ReqId(1), &top, false).unwrap();
        pol.res_put(ReqId(1), res);
        pol.stop();
    }

    #[test]
    fn test_ctl() {
        let pol = OrrPolicy::new(OrrKind::Orr, &env(None));
        assert_eq!(pol.ctl(&CtlOp::RdQuantum), Ok(CtlReply::Quantum(QUANTUM_DFLT)));
        assert_eq!(pol.ctl(&CtlOp::WrQuantum(0)), Err(NrsError::Invalid));
        pol.ctl(&CtlOp::WrQuantum(16)).unwrap();
        assert_eq!(pol.ctl(&CtlOp::RdQuantum), Ok(CtlReply::Quantum(16)));
        assert_eq!(
            pol.ctl(&CtlOp::RdOffType),
            Ok(CtlReply::OffType(OffsetType::Physical))
        );
        assert_eq!(
            pol.ctl(&CtlOp::WrOffType("sideways".to_string())),
            Err(NrsError::Invalid)
        );
        pol.ctl(&CtlOp::WrOffType("logical".to_string())).unwrap();
        assert_eq!(
            pol.ctl(&CtlOp::RdOffType),
            Ok(CtlReply::OffType(OffsetType::Logical))
        );
        assert_eq!(pol.ctl(&CtlOp::RdSuppReq), Ok(CtlReply::SuppReq(SuppReq::Read)));
        assert_eq!(pol.ctl(&CtlOp::Shrink), Err(NrsError::Invalid));
    }

    #[test]
    fn test_parse_settings() {
        assert_eq!("readwrite".parse::<SuppReq>().unwrap(), SuppReq::ReadWrite);
        assert!("rw".parse::<SuppReq>().is_err());
        assert_eq!(SuppReq::ReadWrite.to_string(), "reads_and_writes");
        assert!(SuppReq::Write.supports(Opcode::OstWrite));
        assert!(!SuppReq::Write.supports(Opcode::OstRead));
        assert!(!SuppReq::ReadWrite.supports(Opcode::OstPunch));
        assert_eq!("physical".parse::<OffsetType>().unwrap(), OffsetType::Physical);
        assert!("Physical".parse::<OffsetType>().is_err());
    }

    #[test]
    fn test_physical_offsets() {
        let table = Arc::new(ExtentTable::new());
        table.map(0, 1, 0, 1 << 30, 1 << 20);
        table.map(0, 2, 0, 4096, 8192);
        table.map(0, 2, 8192, 1 << 20, 8192);
        let mut q = Queue::new(OrrKind::Orr, Some(table));

        q.add(0, &read(0, 1, 8192, 4096));
        assert_eq!(
            q.info(0).range,
            Range {
                start: (1 << 30) + 8192,
                end: (1 << 30) + 8192 + 4095
            }
        );

        // Straddles two extents.
        q.add(1, &read(1, 2, 4096, 8192));
        assert_eq!(q.info(1).range, Range { start: 4096, end: 12287 });

        // No physical offsets while moving between queues.
        let res = q.pol.res_get(ReqId(2), &read(2, 1, 0, 4096), true).unwrap();
        assert_eq!(q.pol.req_info(res).unwrap().range, Range { start: 0, end: 4095 });
        q.pol.res_put(ReqId(2), res);

        // Unknown objects can't be mapped at all.
        assert_eq!(q.pol.res_get(ReqId(3), &read(3, 9, 0, 4096), false), None);

        q.drain();
        q.pol.stop();
    }

    #[test]
    #[should_panic(expected = "Busy NRS orr policy")]
    fn test_stop_with_references() {
        let pol = OrrPolicy::new(OrrKind::Orr, &env(None));
        pol.start().unwrap();
        pol.res_get(ReqId(0), &read(0, 1, 0, 1), false).unwrap();
        pol.stop();
    }
}
