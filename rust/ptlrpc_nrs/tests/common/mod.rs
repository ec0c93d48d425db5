// Copyright (c) Meta Platforms, Inc. and affiliates.
//
// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

#![allow(dead_code)]

use cfs_utils::CptTable;
use cfs_utils::Topology;
use ptlrpc_nrs::orr::OST_IO_SERVICE;
use ptlrpc_nrs::CtlOp;
use ptlrpc_nrs::CtlReply;
use ptlrpc_nrs::ExtentMapper;
use ptlrpc_nrs::Niobuf;
use ptlrpc_nrs::PolicyInfo;
use ptlrpc_nrs::QueueType;
use ptlrpc_nrs::Request;
use ptlrpc_nrs::Service;
use ptlrpc_nrs::ServiceConf;
use ptlrpc_nrs::ServicePart;
use std::sync::Arc;
use std::sync::Once;

static LOG_INIT: Once = Once::new();

/// Log to the terminal when `NRS_TEST_LOG` is set.
pub fn setup_test() {
    LOG_INIT.call_once(|| {
        if std::env::var_os("NRS_TEST_LOG").is_some() {
            let _ = simplelog::TermLogger::init(
                simplelog::LevelFilter::Debug,
                simplelog::Config::default(),
                simplelog::TerminalMode::Stderr,
                simplelog::ColorChoice::Auto,
            );
        }
    });
}

/// An ost_io service with `ncpt` partitions.
pub fn ost_io(ncpt: i32, hp: bool, mapper: Option<Arc<dyn ExtentMapper>>) -> Service {
    setup_test();
    let cptab = CptTable::create(ncpt, &Topology::synthetic(1, 4, 1)).unwrap();
    Service::setup(
        ServiceConf {
            name: OST_IO_SERVICE.to_string(),
            hp,
            mapper,
        },
        Arc::new(cptab),
    )
    .unwrap()
}

/// A read of bytes `[offset, offset + len)` of `object_id` on OST 0.
pub fn read(xid: u64, object_id: u64, offset: u64, len: u32) -> Request {
    Request::brw(xid, false, 0, object_id, vec![Niobuf { offset, len }])
}

pub fn write(xid: u64, object_id: u64, offset: u64, len: u32) -> Request {
    Request::brw(xid, true, 0, object_id, vec![Niobuf { offset, len }])
}

/// Initialize and queue every request on the regular head.
pub fn submit(part: &ServicePart, reqs: Vec<Request>) {
    for req in reqs {
        let id = part.req_initialize(req);
        part.req_add(id, false);
    }
}

/// Handle everything queued on a head, returning the xids in service order.
pub fn drain(part: &ServicePart, hp: bool) -> Vec<u64> {
    let mut xids = vec![];
    while let Some(id) = part.next_request(hp) {
        part.req_stop(id);
        xids.push(part.req_finalize(id).unwrap().xid);
    }
    xids
}

pub fn info(part: &ServicePart, queue: QueueType, name: &str) -> PolicyInfo {
    match part.policy_ctl(queue, name, &CtlOp::GetInfo) {
        Ok(CtlReply::Info(info)) => info,
        res => panic!("no info on {}: {:?}", name, res),
    }
}
