// Copyright (c) Meta Platforms, Inc. and affiliates.
//
// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! # First come, first served
//!
//! The fallback policy of every NRS head: requests are served in arrival
//! order and never refused.

use crate::error::NrsResult;
use crate::policy::Compat;
use crate::policy::Policy;
use crate::policy::PolicyDesc;
use crate::policy::PolicyEnv;
use crate::policy::ReqId;
use crate::policy::ResId;
use crate::request::Request;
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::MutexGuard;
use std::sync::PoisonError;

pub const FIFO_DESC: PolicyDesc = PolicyDesc {
    name: "fifo",
    fallback: true,
    reg_start: true,
    external: false,
    compat: Compat::All,
    init: FifoPolicy::create,
};

#[derive(Default)]
struct FifoHead {
    list: VecDeque<ReqId>,
    /// Arrival sequence handed out with the next resource.
    sequence: u64,
}

#[derive(Default)]
pub struct FifoPolicy {
    head: Mutex<FifoHead>,
}

impl FifoPolicy {
    fn create(_env: &PolicyEnv) -> Arc<dyn Policy> {
        Arc::new(FifoPolicy::default())
    }

    fn lock(&self) -> MutexGuard<'_, FifoHead> {
        self.head.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Policy for FifoPolicy {
    fn stop(&self) {
        let head = self.lock();
        assert!(head.list.is_empty(), "stopping fifo with requests queued");
    }

    fn res_get(&self, _id: ReqId, _req: &Request, _moving: bool) -> Option<ResId> {
        // The resource is the arrival sequence.
        let mut head = self.lock();
        let seq = head.sequence;
        head.sequence += 1;
        Some(ResId(seq as usize))
    }

    fn req_add(&self, id: ReqId, _req: &Request, _res: ResId) -> NrsResult<()> {
        self.lock().list.push_back(id);
        Ok(())
    }

    fn req_poll(&self) -> Option<ReqId> {
        self.lock().list.front().copied()
    }

    fn req_del(&self, id: ReqId, _res: ResId) {
        let mut head = self.lock();
        match head.list.iter().position(|queued| *queued == id) {
            Some(pos) => {
                head.list.remove(pos);
            }
            None => panic!("{} is not queued on fifo", id),
        }
    }

    fn req_start(&self, _id: ReqId, res: ResId, req: &Request) {
        log::debug!("NRS start fifo request {}, seq: {}", req, res.0);
    }

    fn req_stop(&self, _id: ReqId, res: ResId, req: &Request) {
        log::debug!("NRS stop fifo request {}, seq: {}", req, res.0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::Opcode;

    #[test]
    fn test_arrival_order() {
        let fifo = FifoPolicy::default();
        let req = Request::simple(1, Opcode::ObdPing);
        let mut held = vec![];
        for i in 0..3 {
            let res = fifo.res_get(ReqId(i), &req, false).unwrap();
            fifo.req_add(ReqId(i), &req, res).unwrap();
            held.push(res);
        }
        assert_eq!(held, vec![ResId(0), ResId(1), ResId(2)]);
        assert_eq!(fifo.req_poll(), Some(ReqId(0)));
        fifo.req_del(ReqId(1), held[1]);
        fifo.req_del(ReqId(0), held[0]);
        assert_eq!(fifo.req_poll(), Some(ReqId(2)));
        fifo.req_del(ReqId(2), held[2]);
        assert_eq!(fifo.req_poll(), None);
        fifo.stop();
    }
}
