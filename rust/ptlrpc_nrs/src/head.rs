// Copyright (c) Meta Platforms, Inc. and affiliates.
//
// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! # NRS head
//!
//! An NRS head schedules the requests of one queue of a service
//! partition. It owns an instance of every policy compatible with the
//! service: the fallback policy, which is always started and takes any
//! request, and at most one started primary policy, which gets the first
//! pick of each request.
//!
//! Policies move through the states below. A policy that is stopped while
//! requests still hold it becomes invisible to new requests right away and
//! finishes stopping when the last of them is finalized.
//!
//! ```text
//!  unavail -> stopped -> starting -> started -> stopping -> stopped
//! ```

use crate::error::NrsError;
use crate::error::NrsResult;
use crate::policy::CtlOp;
use crate::policy::CtlReply;
use crate::policy::Policy;
use crate::policy::PolicyDesc;
use crate::policy::PolicyEnv;
use crate::policy::PolicyInfo;
use crate::policy::PolicyState;
use crate::policy::QueueType;
use crate::policy::ReqId;
use crate::policy::ResId;
use crate::request::Request;
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::MutexGuard;
use std::sync::PoisonError;

pub(crate) const RES_FALLBACK: usize = 0;
pub(crate) const RES_PRIMARY: usize = 1;
pub(crate) const RES_MAX: usize = 2;

/// Resources a request holds on a head: the policy slot handing each out
/// and the resource itself, indexed by `RES_FALLBACK` and `RES_PRIMARY`.
pub(crate) type ResSet = [Option<(usize, ResId)>; RES_MAX];

struct PolicySlot {
    desc: PolicyDesc,
    ops: Arc<dyn Policy>,
    state: PolicyState,
    /// Requests holding resources of the policy.
    refs: usize,
    queued: usize,
    started: usize,
}

impl PolicySlot {
    fn info(&self) -> PolicyInfo {
        PolicyInfo {
            name: self.desc.name.to_string(),
            fallback: self.desc.fallback,
            state: self.state,
            queued: self.queued,
            active: self.started,
        }
    }
}

#[derive(Default)]
struct HeadState {
    /// Registered policies. Slots of unregistered ones are left empty so
    /// the indices held by requests stay valid.
    policies: Vec<Option<PolicySlot>>,
    primary: Option<usize>,
    fallback: Option<usize>,
    /// A policy start is in progress.
    starting: bool,
    /// The service is going away, the fallback policy may be stopped.
    stopping: bool,
    /// Policies with requests queued, in the order they are polled.
    queued: VecDeque<usize>,
    req_queued: usize,
    req_started: usize,
}

impl HeadState {
    fn find(&self, name: &str) -> Option<usize> {
        self.policies
            .iter()
            .position(|slot| matches!(slot, Some(slot) if slot.desc.name == name))
    }

    fn slot(&self, idx: usize) -> &PolicySlot {
        match self.policies.get(idx) {
            Some(Some(slot)) => slot,
            _ => panic!("no NRS policy in slot {}", idx),
        }
    }

    fn slot_mut(&mut self, idx: usize) -> &mut PolicySlot {
        match self.policies.get_mut(idx) {
            Some(Some(slot)) => slot,
            _ => panic!("no NRS policy in slot {}", idx),
        }
    }

    fn stop0(&mut self, idx: usize) {
        assert!(!self.queued.contains(&idx));
        let slot = self.slot_mut(idx);
        assert!(slot.queued == 0 && slot.started == 0);
        slot.ops.stop();
        slot.state = PolicyState::Stopped;
        log::info!("NRS policy {} stopped", slot.desc.name);
    }

    fn stop_locked(&mut self, idx: usize) -> NrsResult<()> {
        if self.fallback == Some(idx) && !self.stopping {
            return Err(NrsError::Perm);
        }
        let slot = self.slot_mut(idx);
        match slot.state {
            PolicyState::Starting => return Err(NrsError::Again),
            // In progress or already stopped.
            PolicyState::Started => {}
            _ => return Ok(()),
        }
        slot.state = PolicyState::Stopping;
        let refs = slot.refs;

        // Invisible to new requests from now on.
        if self.primary == Some(idx) {
            self.primary = None;
        } else {
            assert_eq!(self.fallback, Some(idx));
            self.fallback = None;
        }

        if refs == 0 {
            self.stop0(idx);
        }
        Ok(())
    }

    fn stop_primary(&mut self) {
        let idx = match self.primary.take() {
            Some(idx) => idx,
            None => return,
        };
        let slot = self.slot_mut(idx);
        assert_eq!(slot.state, PolicyState::Started);
        slot.state = PolicyState::Stopping;
        if slot.refs == 0 {
            self.stop0(idx);
        }
    }

    fn get_locked(&mut self, idx: usize) {
        self.slot_mut(idx).refs += 1;
    }

    fn put_locked(&mut self, idx: usize) {
        let slot = self.slot_mut(idx);
        assert!(slot.refs > 0, "NRS policy {} refcount underflow", slot.desc.name);
        slot.refs -= 1;
        if slot.refs == 0 && slot.state == PolicyState::Stopping {
            self.stop0(idx);
        }
    }
}

/// One queue of a service partition and the policies scheduling it.
pub struct NrsHead {
    env: PolicyEnv,
    state: Mutex<HeadState>,
}

impl NrsHead {
    pub(crate) fn new(env: PolicyEnv) -> NrsHead {
        NrsHead {
            env,
            state: Mutex::new(HeadState::default()),
        }
    }

    pub fn queue(&self) -> QueueType {
        self.env.queue
    }

    pub fn cpt(&self) -> usize {
        self.env.cpt
    }

    fn lock(&self) -> MutexGuard<'_, HeadState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Start the policy in slot `idx`. The head lock is dropped while the
    /// policy sets itself up, the guard handed back holds it again.
    fn start_locked<'a>(
        &'a self,
        mut st: MutexGuard<'a, HeadState>,
        idx: usize,
    ) -> (MutexGuard<'a, HeadState>, NrsResult<()>) {
        // One start at a time.
        if st.starting {
            return (st, Err(NrsError::Again));
        }

        let (state, fallback) = {
            let slot = st.slot(idx);
            (slot.state, slot.desc.fallback)
        };
        assert_ne!(state, PolicyState::Starting);
        if matches!(state, PolicyState::Stopping | PolicyState::Unavail) {
            return (st, Err(NrsError::Again));
        }

        if fallback {
            // Going back to the fallback policy only stops the primary.
            if st.fallback == Some(idx) {
                st.stop_primary();
                return (st, Ok(()));
            }
            // Only during setup.
            assert!(st.fallback.is_none());
        } else {
            if st.fallback.is_none() {
                return (st, Err(NrsError::Perm));
            }
            if state == PolicyState::Started {
                return (st, Ok(()));
            }
        }

        st.starting = true;
        let slot = st.slot_mut(idx);
        slot.state = PolicyState::Starting;
        let ops = slot.ops.clone();
        let name = slot.desc.name;

        drop(st);
        let res = ops.start();
        let mut st = self.lock();

        if let Err(e) = res {
            log::error!("Failed to start NRS policy {}: {}", name, e);
            st.slot_mut(idx).state = PolicyState::Stopped;
            st.starting = false;
            return (st, Err(e));
        }

        st.slot_mut(idx).state = PolicyState::Started;
        if fallback {
            st.fallback = Some(idx);
        } else {
            st.stop_primary();
            st.primary = Some(idx);
        }
        st.starting = false;
        log::info!(
            "NRS policy {} started on {} cpt {} ({})",
            name,
            self.env.service,
            self.env.cpt,
            self.env.queue
        );
        (st, Ok(()))
    }

    /// Create an instance of the policy `desc` describes. Externally
    /// registered policies stay unavailable until made available.
    pub(crate) fn register(&self, desc: &PolicyDesc) -> NrsResult<()> {
        let ops = (desc.init)(&self.env);
        let mut st = self.lock();
        if st.find(desc.name).is_some() {
            log::error!(
                "NRS policy {} has been registered, can't register it for {}",
                desc.name,
                self.env.service
            );
            return Err(NrsError::Exists);
        }

        st.policies.push(Some(PolicySlot {
            desc: *desc,
            ops,
            state: if desc.external {
                PolicyState::Unavail
            } else {
                PolicyState::Stopped
            },
            refs: 0,
            queued: 0,
            started: 0,
        }));
        let idx = st.policies.len() - 1;

        if !desc.reg_start {
            return Ok(());
        }
        let (st, res) = self.start_locked(st, idx);
        drop(st);
        if let Err(e) = res {
            let _ = self.unregister(desc.name);
            return Err(e);
        }
        Ok(())
    }

    pub(crate) fn unregister(&self, name: &str) -> NrsResult<()> {
        let mut st = self.lock();
        let idx = match st.find(name) {
            Some(idx) => idx,
            None => {
                log::error!("Can't find NRS policy {}", name);
                return Err(NrsError::NoDev);
            }
        };

        let slot = st.slot(idx);
        if slot.refs > 0 {
            log::error!("Policy {} is busy with {} references", name, slot.refs);
            return Err(NrsError::Busy);
        }
        assert!(slot.queued == 0 && slot.started == 0);

        if !matches!(slot.state, PolicyState::Stopped | PolicyState::Unavail) {
            st.stop_locked(idx)?;
            assert_eq!(st.slot(idx).state, PolicyState::Stopped);
        }
        st.policies[idx] = None;
        Ok(())
    }

    /// Let an externally registered policy be started.
    pub(crate) fn make_available(&self, name: &str) {
        let mut st = self.lock();
        if let Some(idx) = st.find(name) {
            let slot = st.slot_mut(idx);
            assert_eq!(slot.state, PolicyState::Unavail);
            slot.state = PolicyState::Stopped;
        }
    }

    /// Take resources for `req` from the fallback and the primary policy.
    /// Policies are called with the head unlocked since they may block
    /// unless `moving` is set.
    pub(crate) fn resource_get_safe(&self, id: ReqId, req: &Request, moving: bool) -> ResSet {
        let mut pols: [Option<(usize, Arc<dyn Policy>)>; RES_MAX] = [None, None];
        {
            let mut st = self.lock();
            let fallback = match st.fallback {
                Some(idx) => idx,
                None => panic!("NRS head of {} has no fallback policy", self.env.service),
            };
            st.get_locked(fallback);
            pols[RES_FALLBACK] = Some((fallback, st.slot(fallback).ops.clone()));
            if let Some(primary) = st.primary {
                st.get_locked(primary);
                pols[RES_PRIMARY] = Some((primary, st.slot(primary).ops.clone()));
            }
        }

        let mut res: ResSet = [None, None];
        let mut refused = vec![];
        for (i, pol) in pols.iter().enumerate() {
            if let Some((idx, ops)) = pol {
                match ops.res_get(id, req, moving) {
                    Some(r) => res[i] = Some((*idx, r)),
                    None => refused.push(*idx),
                }
            }
        }

        if !refused.is_empty() {
            let mut st = self.lock();
            for idx in refused {
                st.put_locked(idx);
            }
        }
        res
    }

    pub(crate) fn resource_put_safe(&self, id: ReqId, res: &ResSet) {
        let held: Vec<(usize, ResId, Arc<dyn Policy>)> = {
            let st = self.lock();
            res.iter()
                .flatten()
                .map(|(idx, r)| (*idx, *r, st.slot(*idx).ops.clone()))
                .collect()
        };
        for (_, r, ops) in held.iter() {
            ops.res_put(id, *r);
        }
        let mut st = self.lock();
        for (idx, _, _) in held {
            st.put_locked(idx);
        }
    }

    /// Queue `req` with the primary policy, or the fallback one if that
    /// fails. Returns the `res` index used.
    ///
    /// # Panics
    ///
    /// When no policy takes the request.
    pub(crate) fn enqueue(&self, id: ReqId, req: &Request, res: &ResSet) -> usize {
        let mut st = self.lock();
        for i in (0..RES_MAX).rev() {
            let (idx, r) = match res[i] {
                Some(held) => held,
                None => continue,
            };
            let slot = st.slot_mut(idx);
            if slot.ops.req_add(id, req, r).is_ok() {
                slot.queued += 1;
                st.req_queued += 1;
                if !st.queued.contains(&idx) {
                    st.queued.push_back(idx);
                }
                return i;
            }
        }
        panic!("no NRS policy of {} took {}", self.env.service, req);
    }

    /// Next request to serve, from the first policy with queued requests.
    /// Policies that are stopping are drained too.
    pub(crate) fn poll(&self) -> Option<ReqId> {
        let st = self.lock();
        if st.req_queued == 0 {
            return None;
        }
        st.queued.iter().find_map(|idx| {
            let slot = st.slot(*idx);
            assert!(slot.queued > 0);
            slot.ops.req_poll()
        })
    }

    pub(crate) fn dequeue(&self, id: ReqId, held: (usize, ResId)) {
        let mut st = self.lock();
        let (idx, r) = held;
        let slot = st.slot_mut(idx);
        slot.ops.req_del(id, r);
        slot.queued -= 1;
        let queued = slot.queued;
        st.req_queued -= 1;

        if queued == 0 {
            st.queued.retain(|queued| *queued != idx);
        } else if queued != st.req_queued {
            // Round robin over the policies with requests left.
            assert!(queued < st.req_queued);
            st.queued.retain(|queued| *queued != idx);
            st.queued.push_back(idx);
        }
    }

    pub(crate) fn start_request(&self, id: ReqId, req: &Request, held: (usize, ResId)) {
        let (idx, r) = held;
        let mut st = self.lock();
        st.req_started += 1;
        let slot = st.slot_mut(idx);
        slot.started += 1;
        slot.ops.req_start(id, r, req);
    }

    pub(crate) fn stop_request(&self, id: ReqId, req: &Request, held: (usize, ResId)) {
        let (idx, r) = held;
        let mut st = self.lock();
        let slot = st.slot_mut(idx);
        slot.ops.req_stop(id, r, req);
        slot.started -= 1;
        st.req_started -= 1;
    }

    pub fn pending(&self) -> bool {
        self.lock().req_queued > 0
    }

    pub fn started(&self) -> usize {
        self.lock().req_started
    }

    /// Name of the policy in slot `idx`.
    pub(crate) fn policy_name(&self, idx: usize) -> &'static str {
        self.lock().slot(idx).desc.name
    }

    pub fn primary(&self) -> Option<&'static str> {
        let st = self.lock();
        st.primary.map(|idx| st.slot(idx).desc.name)
    }

    /// Carry out `op` on the policy called `name`. Operations NRS doesn't
    /// know about are passed on to the policy.
    pub fn ctl(&self, name: &str, op: &CtlOp) -> NrsResult<CtlReply> {
        let st = self.lock();
        let idx = match st.find(name) {
            Some(idx) => idx,
            None => return Err(NrsError::NoDev),
        };

        match op {
            CtlOp::GetInfo => Ok(CtlReply::Info(st.slot(idx).info())),
            CtlOp::Start => {
                let (_st, res) = self.start_locked(st, idx);
                res.map(|_| CtlReply::Done)
            }
            CtlOp::Stop => {
                let mut st = st;
                st.stop_locked(idx).map(|_| CtlReply::Done)
            }
            CtlOp::Shrink => Err(NrsError::NoSys),
            op => st.slot(idx).ops.ctl(op),
        }
    }

    pub fn policies_info(&self) -> Vec<PolicyInfo> {
        let st = self.lock();
        st.policies.iter().flatten().map(|slot| slot.info()).collect()
    }

    /// Unregister every policy, the fallback one included.
    ///
    /// # Panics
    ///
    /// When requests still hold policies of the head.
    pub(crate) fn cleanup(&self) {
        let names: Vec<&'static str> = {
            let mut st = self.lock();
            st.stopping = true;
            st.policies.iter().flatten().map(|slot| slot.desc.name).collect()
        };
        for name in names {
            if let Err(e) = self.unregister(name) {
                panic!("Failed to unregister NRS policy {}: {}", name, e);
            }
        }
    }
}
