// Copyright (c) Meta Platforms, Inc. and affiliates.
//
// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! # LNet message engine
//!
//! A userspace rendition of the Lustre networking core: the objects
//! applications post buffers and learn about completions through, and the
//! engine moving messages between them and the network drivers.
//!
//! ## Resources
//!
//! Applications attach match entries (`me_attach()`) to portals and memory
//! descriptors to them (`md_attach()`) to receive, or bind free standing
//! MDs (`md_bind()`) to `put()` and `get()` from. Every operation on an MD
//! is reported as an `Event` on its event queue (`eq_alloc()`,
//! `eq_poll()`). Objects are named by generation checked handles, so a
//! stale handle never resolves to a reused object.
//!
//! ## Flow control
//!
//! Messages need credits of the NI and of the peer they go to, and
//! messages being forwarded additionally need router buffer credits of the
//! peer they come from and a router buffer. A message missing a credit is
//! queued and sent when the credit comes back; callers never block.
//!
//! ## Drivers
//!
//! A network driver implements `Lnd`, hands incoming messages to
//! `LNet::parse()` and completes every message it was given with
//! `LNet::finalize()`. The loopback driver, `LoLnd`, is always present.
//!
//! ## Locking
//!
//! All state is sharded over the CPU partitions of the instance with
//! `cfs_utils::ScaleLock`. Drivers are never called and events never
//! posted with an LNet lock held.

mod api;
pub use api::LNet;
pub use api::LNetState;

mod config;
pub use config::Forwarding;
pub use config::LnetConfig;

mod eq;
pub use eq::EqCallback;
pub use eq::Event;
pub use eq::EventKind;
pub use eq::PolledEvent;

mod error;
pub use error::status_errno;
pub use error::LnetError;
pub use error::LnetResult;
pub use error::Status;

pub mod freelist;
pub use freelist::ObjPool;
pub use freelist::Recycle;

pub mod handle;
pub use handle::EqHandle;
pub use handle::MdHandle;
pub use handle::MeHandle;

pub mod md;
pub use md::IoBuf;
pub use md::MdDesc;
pub use md::MdInfo;
pub use md::Payload;
pub use md::Unlink;

mod me;
pub use me::InsPos;

mod msg;
pub use msg::Msg;
pub use msg::Private;

mod net;
pub use net::Counters;

mod ni;
pub use ni::LndResult;
pub use ni::LoLnd;
pub use ni::Lnd;
pub use ni::Ni;
pub use ni::NiConfig;
pub use ni::RecvArgs;

mod parse;
pub use parse::AckReq;
pub use parse::Distance;
pub use parse::FAIL_THRESH_INF;

mod peer;

mod proc;
pub use proc::ProcCursor;

mod ptl;

mod res;

mod router;

mod send;

pub mod types;
pub use types::Hdr;
pub use types::HdrBody;
pub use types::MsgType;
pub use types::NetId;
pub use types::Nid;
pub use types::ProcessId;
pub use types::WireHandle;
