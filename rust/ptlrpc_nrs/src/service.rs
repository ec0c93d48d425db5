// Copyright (c) Meta Platforms, Inc. and affiliates.
//
// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! Services, their partitions and the life of a request through NRS.
//!
//! A request is initialized when it arrives, taking resources from the
//! policies of the regular head, then added to the regular or the high
//! priority head. Service threads poll it, dequeue it and start it, and
//! once it has been handled it is stopped and finalized, which drops the
//! resources again.

use crate::error::NrsError;
use crate::error::NrsResult;
use crate::extent::ExtentMapper;
use crate::head::NrsHead;
use crate::head::ResSet;
use crate::policy::builtin_policies;
use crate::policy::CtlOp;
use crate::policy::CtlReply;
use crate::policy::PolicyDesc;
use crate::policy::PolicyEnv;
use crate::policy::PolicyInfo;
use crate::policy::QueueType;
use crate::policy::ReqId;
use crate::policy::ResId;
use crate::request::Opcode;
use crate::request::Request;
use anyhow::Context;
use anyhow::Result;
use cfs_utils::CptTable;
use std::collections::HashMap;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::MutexGuard;
use std::sync::PoisonError;

#[derive(Clone)]
pub struct ServiceConf {
    pub name: String,
    /// The service handles high priority requests and needs a second head.
    pub hp: bool,
    /// Backend for physical offsets, if it has one.
    pub mapper: Option<Arc<dyn ExtentMapper>>,
}

/// NRS state of a request.
struct NrsRequest {
    req: Request,
    res: ResSet,
    /// `res` came from the high priority head.
    hp: bool,
    /// Index into `res` of the policy the request was queued with.
    policy: Option<usize>,
    enqueued: bool,
    dequeued: bool,
    started: bool,
    stopped: bool,
}

impl NrsRequest {
    fn held(&self) -> (usize, ResId) {
        match self.policy.and_then(|i| self.res[i]) {
            Some(held) => held,
            None => panic!("x{} was never queued", self.req.xid),
        }
    }
}

/// One partition of a service, with its own queues and service threads.
pub struct ServicePart {
    cpt: usize,
    reg: NrsHead,
    hp: Option<NrsHead>,
    /// The request lock. Taken before the lock of any head.
    reqs: Mutex<HashMap<ReqId, NrsRequest>>,
    next_id: AtomicU64,
}

impl ServicePart {
    fn new(conf: &ServiceConf, cpt: usize) -> ServicePart {
        let env = |queue| PolicyEnv {
            service: conf.name.clone(),
            cpt,
            queue,
            mapper: conf.mapper.clone(),
        };
        ServicePart {
            cpt,
            reg: NrsHead::new(env(QueueType::Reg)),
            hp: conf.hp.then(|| NrsHead::new(env(QueueType::Hp))),
            reqs: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(0),
        }
    }

    pub fn cpt(&self) -> usize {
        self.cpt
    }

    pub fn has_hp(&self) -> bool {
        self.hp.is_some()
    }

    fn lock_reqs(&self) -> MutexGuard<'_, HashMap<ReqId, NrsRequest>> {
        self.reqs.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn heads(&self) -> impl Iterator<Item = &NrsHead> {
        std::iter::once(&self.reg).chain(self.hp.iter())
    }

    fn head(&self, hp: bool) -> &NrsHead {
        match (hp, &self.hp) {
            (false, _) => &self.reg,
            (true, Some(head)) => head,
            (true, None) => panic!("cpt {} has no high priority queue", self.cpt),
        }
    }

    fn head_of(&self, queue: QueueType) -> NrsResult<&NrsHead> {
        match queue {
            QueueType::Reg => Ok(&self.reg),
            QueueType::Hp => self.hp.as_ref().ok_or(NrsError::NoDev),
            QueueType::Both => Err(NrsError::Invalid),
        }
    }

    pub fn head_for(&self, queue: QueueType) -> Option<&NrsHead> {
        self.head_of(queue).ok()
    }

    /// Take the regular head's resources for a request that just arrived.
    pub fn req_initialize(&self, req: Request) -> ReqId {
        let id = ReqId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let res = self.reg.resource_get_safe(id, &req, false);
        self.lock_reqs().insert(
            id,
            NrsRequest {
                req,
                res,
                hp: false,
                policy: None,
                enqueued: false,
                dequeued: false,
                started: false,
                stopped: false,
            },
        );
        id
    }

    fn with_req<T>(
        reqs: &mut HashMap<ReqId, NrsRequest>,
        id: ReqId,
        f: impl FnOnce(&mut NrsRequest) -> T,
    ) -> T {
        match reqs.get_mut(&id) {
            Some(nrq) => f(nrq),
            None => panic!("{} is not a request of this partition", id),
        }
    }

    fn add_nolock(&self, nrq: &mut NrsRequest, id: ReqId) {
        assert!(!nrq.enqueued);
        let i = self.head(nrq.hp).enqueue(id, &nrq.req, &nrq.res);
        nrq.policy = Some(i);
        nrq.enqueued = true;
    }

    /// Queue request `id` on the regular head, or on the high priority one
    /// when `hp` is set.
    pub fn req_add(&self, id: ReqId, hp: bool) {
        if !hp {
            let mut reqs = self.lock_reqs();
            Self::with_req(&mut reqs, id, |nrq| self.add_nolock(nrq, id));
            return;
        }

        let req = Self::with_req(&mut self.lock_reqs(), id, |nrq| nrq.req.clone());
        let hp_head = self.head(true);
        let res = hp_head.resource_get_safe(id, &req, true);
        let old = {
            let mut reqs = self.lock_reqs();
            Self::with_req(&mut reqs, id, |nrq| {
                assert!(!nrq.hp);
                let old = std::mem::replace(&mut nrq.res, res);
                nrq.hp = true;
                self.add_nolock(nrq, id);
                if nrq.req.opcode != Opcode::ObdPing {
                    log::debug!("high priority req {}", nrq.req);
                }
                old
            })
        };
        self.reg.resource_put_safe(id, &old);
    }

    /// The next request the head would hand out, left queued.
    pub fn req_poll(&self, hp: bool) -> Option<ReqId> {
        let _reqs = self.lock_reqs();
        self.head(hp).poll()
    }

    pub fn req_del(&self, id: ReqId) {
        let mut reqs = self.lock_reqs();
        Self::with_req(&mut reqs, id, |nrq| {
            assert!(nrq.enqueued && !nrq.dequeued);
            self.head(nrq.hp).dequeue(id, nrq.held());
            nrq.dequeued = true;
        });
    }

    pub fn req_start(&self, id: ReqId) {
        let mut reqs = self.lock_reqs();
        Self::with_req(&mut reqs, id, |nrq| {
            assert!(nrq.dequeued && !nrq.started);
            nrq.started = true;
            self.head(nrq.hp).start_request(id, &nrq.req, nrq.held());
        });
    }

    pub fn req_stop(&self, id: ReqId) {
        let mut reqs = self.lock_reqs();
        Self::with_req(&mut reqs, id, |nrq| {
            if nrq.started && !nrq.stopped {
                self.head(nrq.hp).stop_request(id, &nrq.req, nrq.held());
                nrq.stopped = true;
            }
        });
    }

    /// Poll, dequeue and start the next request, as a service thread does.
    pub fn next_request(&self, hp: bool) -> Option<ReqId> {
        let mut reqs = self.lock_reqs();
        let head = self.head(hp);
        let id = head.poll()?;
        Self::with_req(&mut reqs, id, |nrq| {
            head.dequeue(id, nrq.held());
            nrq.dequeued = true;
            nrq.started = true;
            head.start_request(id, &nrq.req, nrq.held());
        });
        Some(id)
    }

    /// Drop the resources of a handled request and hand it back.
    ///
    /// # Panics
    ///
    /// When the request is still queued.
    pub fn req_finalize(&self, id: ReqId) -> Option<Request> {
        let nrq = self.lock_reqs().remove(&id)?;
        assert!(
            !nrq.enqueued || nrq.dequeued,
            "finalizing x{} while it is queued",
            nrq.req.xid
        );
        assert!(
            !nrq.started || nrq.stopped,
            "finalizing x{} while it is being handled",
            nrq.req.xid
        );
        self.head(nrq.hp).resource_put_safe(id, &nrq.res);
        Some(nrq.req)
    }

    /// Move a queued request from the regular to the high priority head.
    /// Returns false when the request can't be moved anymore.
    pub fn req_hp_move(&self, id: ReqId) -> bool {
        let req = Self::with_req(&mut self.lock_reqs(), id, |nrq| nrq.req.clone());
        let hp_head = self.head(true);
        // Mapping may block, moving requests use logical offsets.
        let res = hp_head.resource_get_safe(id, &req, true);

        let (moved, put) = {
            let mut reqs = self.lock_reqs();
            Self::with_req(&mut reqs, id, |nrq| {
                if !nrq.enqueued || nrq.dequeued || nrq.started || nrq.hp {
                    return (false, res);
                }
                self.reg.dequeue(id, nrq.held());
                nrq.enqueued = false;
                nrq.dequeued = false;
                let old = std::mem::replace(&mut nrq.res, res);
                nrq.hp = true;
                self.add_nolock(nrq, id);
                (true, old)
            })
        };

        // The regular head's resources if moved, the fresh ones otherwise.
        if moved {
            self.reg.resource_put_safe(id, &put);
        } else {
            hp_head.resource_put_safe(id, &put);
        }
        moved
    }

    pub fn req_pending(&self, hp: bool) -> bool {
        let _reqs = self.lock_reqs();
        self.head(hp).pending()
    }

    pub fn request(&self, id: ReqId) -> Option<Request> {
        self.lock_reqs().get(&id).map(|nrq| nrq.req.clone())
    }

    /// Name of the policy request `id` was queued with.
    pub fn req_policy(&self, id: ReqId) -> Option<&'static str> {
        let reqs = self.lock_reqs();
        let nrq = reqs.get(&id)?;
        let (idx, _) = nrq.policy.and_then(|i| nrq.res[i])?;
        Some(self.head(nrq.hp).policy_name(idx))
    }

    /// Carry out `op` on policy `name` of the heads `queue` selects.
    /// With both heads the high priority one is only tried once the
    /// regular one succeeded, and its reply is returned.
    pub fn policy_ctl(&self, queue: QueueType, name: &str, op: &CtlOp) -> NrsResult<CtlReply> {
        match queue {
            QueueType::Both => {
                let reply = self.reg.ctl(name, op)?;
                match &self.hp {
                    Some(hp) => hp.ctl(name, op),
                    None => Ok(reply),
                }
            }
            queue => self.head_of(queue)?.ctl(name, op),
        }
    }

    pub fn policies_info(&self, queue: QueueType) -> NrsResult<Vec<PolicyInfo>> {
        match queue {
            QueueType::Both => Ok(self.heads().flat_map(|head| head.policies_info()).collect()),
            queue => Ok(self.head_of(queue)?.policies_info()),
        }
    }

    fn register(&self, desc: &PolicyDesc) -> NrsResult<()> {
        for head in self.heads() {
            head.register(desc)?;
        }
        Ok(())
    }

    fn cleanup(&self) {
        let reqs = self.lock_reqs();
        assert!(
            reqs.is_empty(),
            "cpt {} still has {} requests",
            self.cpt,
            reqs.len()
        );
        drop(reqs);
        for head in self.heads() {
            head.cleanup();
        }
    }
}

/// A ptlrpc service: a partition per CPU partition, each scheduling its
/// requests with the same set of policies.
pub struct Service {
    name: String,
    cptab: Arc<CptTable>,
    parts: Vec<ServicePart>,
    policies: Mutex<Vec<PolicyDesc>>,
}

impl Service {
    /// Set up a partition per CPU partition and register every compatible
    /// builtin policy on its heads.
    pub fn setup(conf: ServiceConf, cptab: Arc<CptTable>) -> Result<Service> {
        let descs: Vec<PolicyDesc> = builtin_policies()
            .into_iter()
            .filter(|desc| desc.compatible(&conf.name))
            .collect();

        let mut parts: Vec<ServicePart> = vec![];
        for cpt in 0..cptab.number() {
            let part = ServicePart::new(&conf, cpt);
            for desc in descs.iter() {
                if let Err(e) = part.register(desc) {
                    part.cleanup();
                    for part in parts.iter() {
                        part.cleanup();
                    }
                    return Err(e).with_context(|| {
                        format!(
                            "Failed to register NRS policy {} for partition {} of service {}",
                            desc.name, cpt, conf.name
                        )
                    });
                }
            }
            parts.push(part);
        }

        log::info!(
            "Service {} set up with {} partitions, policies: {}",
            conf.name,
            parts.len(),
            descs.iter().map(|desc| desc.name).collect::<Vec<_>>().join(" ")
        );

        Ok(Service {
            name: conf.name,
            cptab,
            parts,
            policies: Mutex::new(descs),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn parts(&self) -> &[ServicePart] {
        &self.parts
    }

    pub fn part(&self, cpt: usize) -> Option<&ServicePart> {
        self.parts.get(cpt)
    }

    /// The partition of the CPU the caller runs on.
    pub fn current_part(&self) -> &ServicePart {
        let cpt = self.cptab.current(true).unwrap_or(0);
        &self.parts[cpt % self.parts.len()]
    }

    /// `policy_ctl()` on every partition, stopping at the first failure.
    pub fn policy_ctl_all(&self, queue: QueueType, name: &str, op: &CtlOp) -> NrsResult<Vec<CtlReply>> {
        self.parts
            .iter()
            .map(|part| part.policy_ctl(queue, name, op))
            .collect()
    }

    /// Register a policy after setup. Its instances only become available
    /// once every partition has one.
    pub fn policy_register(&self, desc: PolicyDesc) -> NrsResult<()> {
        if desc.fallback || desc.reg_start {
            log::error!(
                "Failing to register NRS policy {}; externally-registered policies cannot act as fallback policies or be started on registration",
                desc.name
            );
            return Err(NrsError::Invalid);
        }
        let desc = PolicyDesc {
            external: true,
            ..desc
        };

        let mut policies = self.policies.lock().unwrap_or_else(PoisonError::into_inner);
        if policies.iter().any(|known| known.name == desc.name) {
            log::error!("NRS policy {} has already been registered", desc.name);
            return Err(NrsError::Exists);
        }
        if !desc.compatible(&self.name) {
            policies.push(desc);
            return Ok(());
        }

        for part in self.parts.iter() {
            if let Err(e) = part.register(&desc) {
                log::error!(
                    "Failed to register NRS policy {} for partition {} of service {}: {}",
                    desc.name,
                    part.cpt,
                    self.name,
                    e
                );
                if let Err(e) = self.unregister_all(desc.name) {
                    panic!("Failed to roll back NRS policy {}: {}", desc.name, e);
                }
                return Err(e);
            }
        }

        for head in self.parts.iter().flat_map(|part| part.heads()) {
            head.make_available(desc.name);
        }
        policies.push(desc);
        Ok(())
    }

    /// Remove every instance of an externally registered policy.
    pub fn policy_unregister(&self, name: &str) -> NrsResult<()> {
        let mut policies = self.policies.lock().unwrap_or_else(PoisonError::into_inner);
        let pos = match policies.iter().position(|desc| desc.name == name) {
            Some(pos) => pos,
            None => {
                log::error!("Failing to unregister NRS policy {} which has not been registered", name);
                return Err(NrsError::NoDev);
            }
        };
        if policies[pos].fallback {
            log::error!("Unable to unregister a fallback policy unless the service is stopping");
            return Err(NrsError::Perm);
        }

        if let Err(e) = self.unregister_all(name) {
            if e == NrsError::Busy {
                log::error!(
                    "Please first stop policy {} on all service partitions and then retry to unregister the policy",
                    name
                );
            }
            return Err(e);
        }
        log::info!("Unregistering policy {} from {}", name, self.name);
        policies.remove(pos);
        Ok(())
    }

    fn unregister_all(&self, name: &str) -> NrsResult<()> {
        for head in self.parts.iter().flat_map(|part| part.heads()) {
            match head.unregister(name) {
                // It may not have made it onto every head.
                Ok(()) | Err(NrsError::NoDev) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    /// Unregister every policy of every partition.
    ///
    /// # Panics
    ///
    /// When requests are still around.
    pub fn cleanup(&self) {
        for part in self.parts.iter() {
            part.cleanup();
        }
        self.policies
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::orr::OST_IO_SERVICE;
    use crate::policy::PolicyState;
    use cfs_utils::Topology;

    fn service(name: &str, hp: bool) -> Service {
        let cptab = CptTable::create(2, &Topology::synthetic(1, 4, 1)).unwrap();
        Service::setup(
            ServiceConf {
                name: name.to_string(),
                hp,
                mapper: None,
            },
            Arc::new(cptab),
        )
        .unwrap()
    }

    #[test]
    fn test_setup() {
        let svc = service(OST_IO_SERVICE, true);
        assert_eq!(svc.parts().len(), 2);
        let names: Vec<String> = svc.parts()[0]
            .policies_info(QueueType::Reg)
            .unwrap()
            .into_iter()
            .map(|info| info.name)
            .collect();
        assert_eq!(names, vec!["fifo", "orr", "trr"]);
        assert_eq!(svc.parts()[1].policies_info(QueueType::Both).unwrap().len(), 6);
        svc.cleanup();

        // ORR and TRR only serve ost_io.
        let svc = service("mdt", false);
        let info = svc.parts()[0].policies_info(QueueType::Reg).unwrap();
        assert_eq!(info.len(), 1);
        assert_eq!(info[0].state, PolicyState::Started);
        assert_eq!(
            svc.parts()[0].policies_info(QueueType::Hp),
            Err(NrsError::NoDev)
        );
        svc.cleanup();
    }

    #[test]
    fn test_external_policy() {
        let svc = service(OST_IO_SERVICE, false);
        let mut desc = crate::fifo::FIFO_DESC;
        desc.name = "ext";
        assert_eq!(svc.policy_register(desc), Err(NrsError::Invalid));
        desc.fallback = false;
        desc.reg_start = false;
        svc.policy_register(desc).unwrap();
        assert_eq!(svc.policy_register(desc), Err(NrsError::Exists));

        let part = &svc.parts()[0];
        match part.policy_ctl(QueueType::Reg, "ext", &CtlOp::GetInfo) {
            Ok(CtlReply::Info(info)) => assert_eq!(info.state, PolicyState::Stopped),
            res => panic!("unexpected {:?}", res),
        }

        assert_eq!(svc.policy_unregister("fifo"), Err(NrsError::Perm));
        svc.policy_unregister("ext").unwrap();
        assert_eq!(svc.policy_unregister("ext"), Err(NrsError::NoDev));
        svc.cleanup();
    }
}
