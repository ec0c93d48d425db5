// Copyright (c) Meta Platforms, Inc. and affiliates.
//
// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

use crate::error::NrsError;
use crate::error::NrsResult;
use crate::extent::ExtentMapper;
use crate::orr::OffsetType;
use crate::orr::SuppReq;
use crate::request::Request;
use serde::Deserialize;
use serde::Serialize;
use std::fmt;
use std::sync::Arc;

/// Names a request within its service partition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ReqId(pub(crate) u64);

impl ReqId {
    pub fn raw(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for ReqId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "req#{}", self.0)
    }
}

/// What a policy handed out for one request in `res_get()`, such as its
/// place in an ORR object's batch. Only meaningful to that policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ResId(pub usize);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PolicyState {
    /// Registered from outside and not made available yet.
    Unavail,
    Stopped,
    Starting,
    Started,
    /// Stopped by the administrator, waiting for its requests to drain.
    Stopping,
}

impl fmt::Display for PolicyState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            PolicyState::Unavail => "unavailable",
            PolicyState::Stopped => "stopped",
            PolicyState::Starting => "starting",
            PolicyState::Started => "started",
            PolicyState::Stopping => "stopping",
        };
        write!(f, "{}", s)
    }
}

/// Which of the queues of a service partition an operation is for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueueType {
    Reg,
    Hp,
    Both,
}

impl fmt::Display for QueueType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            QueueType::Reg => "reg",
            QueueType::Hp => "hp",
            QueueType::Both => "both",
        };
        write!(f, "{}", s)
    }
}

/// Policy control operations. The first four are handled by the NRS head,
/// the rest are passed on to the policy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CtlOp {
    GetInfo,
    Start,
    Stop,
    Shrink,
    RdQuantum,
    WrQuantum(u16),
    RdOffType,
    WrOffType(String),
    RdSuppReq,
    WrSuppReq(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyInfo {
    pub name: String,
    pub fallback: bool,
    pub state: PolicyState,
    pub queued: usize,
    pub active: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CtlReply {
    Done,
    Info(PolicyInfo),
    Quantum(u16),
    OffType(OffsetType),
    SuppReq(SuppReq),
}

/// A request scheduling policy instance of one NRS head.
///
/// Methods are called without any head lock held except for `req_add()`,
/// `req_poll()`, `req_del()`, `req_start()` and `req_stop()`, which run
/// under the lock of the service partition and must not block.
pub trait Policy: Send + Sync {
    /// Set up scheduling state. A failure leaves the policy stopped.
    fn start(&self) -> NrsResult<()> {
        Ok(())
    }

    /// Tear down scheduling state. Nothing is queued or started.
    fn stop(&self) {}

    fn ctl(&self, _op: &CtlOp) -> NrsResult<CtlReply> {
        Err(NrsError::NoSys)
    }

    /// The resource `req` is scheduled with, None to leave it to the
    /// fallback policy. `moving` is set when the request is being moved
    /// between queues, in which case the policy must not block.
    fn res_get(&self, id: ReqId, req: &Request, moving: bool) -> Option<ResId>;

    fn res_put(&self, _id: ReqId, _res: ResId) {}

    /// Queue `req`. On failure the next policy in line gets it.
    fn req_add(&self, id: ReqId, req: &Request, res: ResId) -> NrsResult<()>;

    /// The request to serve next, left queued.
    fn req_poll(&self) -> Option<ReqId>;

    fn req_del(&self, id: ReqId, res: ResId);

    fn req_start(&self, _id: ReqId, _res: ResId, _req: &Request) {}

    fn req_stop(&self, _id: ReqId, _res: ResId, _req: &Request) {}
}

/// Where a policy instance is being created.
#[derive(Clone)]
pub struct PolicyEnv {
    pub service: String,
    pub cpt: usize,
    pub queue: QueueType,
    pub mapper: Option<Arc<dyn ExtentMapper>>,
}

/// The services a policy can be registered with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Compat {
    All,
    Service(&'static str),
}

/// How to make instances of a policy.
#[derive(Clone, Copy)]
pub struct PolicyDesc {
    pub name: &'static str,
    /// Always started, serves whatever the primary policy refuses.
    pub fallback: bool,
    /// Start on registration.
    pub reg_start: bool,
    /// Registered after the services were set up, available once every
    /// head has it.
    pub external: bool,
    pub compat: Compat,
    pub init: fn(&PolicyEnv) -> Arc<dyn Policy>,
}

impl PolicyDesc {
    pub fn compatible(&self, service: &str) -> bool {
        match self.compat {
            Compat::All => true,
            Compat::Service(name) => name == service,
        }
    }
}

impl fmt::Debug for PolicyDesc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PolicyDesc")
            .field("name", &self.name)
            .field("fallback", &self.fallback)
            .field("reg_start", &self.reg_start)
            .field("compat", &self.compat)
            .finish()
    }
}

/// The policies every service knows about.
pub fn builtin_policies() -> Vec<PolicyDesc> {
    vec![
        crate::fifo::FIFO_DESC,
        crate::orr::ORR_DESC,
        crate::orr::TRR_DESC,
    ]
}
