// Copyright (c) Meta Platforms, Inc. and affiliates.
//
// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! # Network request scheduler
//!
//! Orders the RPCs a ptlrpc service has received before its threads handle
//! them. Every partition of a service has a regular queue and, for services
//! handling high priority requests, a second one; each queue is an
//! `NrsHead` scheduling with pluggable policies.
//!
//! ## Policies
//!
//! - `fifo`: arrival order. The fallback of every head.
//! - `orr`: batches bulk I/O by backend object, served in offset order,
//!   `quantum` requests per object and round.
//! - `trr`: the same, batching by OST instead.
//!
//! Policies are controlled by name with `ServicePart::policy_ctl()`:
//! `CtlOp::Start` makes a policy the primary one, `CtlOp::Start` on `fifo`
//! goes back to the fallback only. The other operations tune ORR and TRR.
//!
//! ## Example
//!
//! ```no_run
//! use cfs_utils::CptTable;
//! use cfs_utils::Topology;
//! use ptlrpc_nrs::CtlOp;
//! use ptlrpc_nrs::Niobuf;
//! use ptlrpc_nrs::QueueType;
//! use ptlrpc_nrs::Request;
//! use ptlrpc_nrs::Service;
//! use ptlrpc_nrs::ServiceConf;
//! use std::sync::Arc;
//!
//! let cptab = CptTable::create(1, &Topology::synthetic(1, 2, 1)).unwrap();
//! let svc = Service::setup(
//!     ServiceConf {
//!         name: "ost_io".to_string(),
//!         hp: false,
//!         mapper: None,
//!     },
//!     Arc::new(cptab),
//! )
//! .unwrap();
//! let part = &svc.parts()[0];
//! part.policy_ctl(QueueType::Reg, "orr", &CtlOp::Start).unwrap();
//!
//! let req = Request::brw(1, false, 0, 0x42, vec![Niobuf { offset: 0, len: 4096 }]);
//! let id = part.req_initialize(req);
//! part.req_add(id, false);
//! let next = part.next_request(false).unwrap();
//! part.req_stop(next);
//! part.req_finalize(next);
//! ```

mod error;
pub use error::NrsError;
pub use error::NrsResult;

mod extent;
pub use extent::Extent;
pub use extent::ExtentMapper;
pub use extent::ExtentTable;

pub mod fifo;

mod head;
pub use head::NrsHead;

pub mod orr;
pub use orr::OffsetType;
pub use orr::OrrKind;
pub use orr::SuppReq;

mod policy;
pub use policy::builtin_policies;
pub use policy::Compat;
pub use policy::CtlOp;
pub use policy::CtlReply;
pub use policy::Policy;
pub use policy::PolicyDesc;
pub use policy::PolicyEnv;
pub use policy::PolicyInfo;
pub use policy::PolicyState;
pub use policy::QueueType;
pub use policy::ReqId;
pub use policy::ResId;

mod request;
pub use request::IoObj;
pub use request::Niobuf;
pub use request::Opcode;
pub use request::OstBody;
pub use request::Request;

mod service;
pub use service::Service;
pub use service::ServiceConf;
pub use service::ServicePart;
