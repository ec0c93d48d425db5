// Copyright (c) Meta Platforms, Inc. and affiliates.
//
// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! # Routes and router buffers
//!
//! A remote network is reached through one or more gateways on a local
//! network. Routes live in `NetShared` and change only under the exclusive
//! net lock; every gateway also sits in the router list, sorted by NID,
//! for as long as at least one route uses it.
//!
//! When this node forwards traffic, incoming routed messages borrow a
//! buffer from one of three pools per partition (tiny for header only
//! messages, one page, and MTU sized), picking the smallest buffer that
//! fits. A message that finds its pool empty waits on the pool's queue and
//! is resumed when a buffer comes back.

use crate::api::LNet;
use crate::config::Forwarding;
use crate::error::LnetError;
use crate::error::LnetResult;
use crate::md::IoBuf;
use crate::msg::Deferred;
use crate::msg::Msg;
use crate::net::NetPart;
use crate::net::NetShared;
use crate::net::RemoteNet;
use crate::net::Route;
use crate::net::RouterEntry;
use crate::ni::Ni;
use crate::peer::GatewayState;
use crate::peer::PeerRef;
use crate::types::NetId;
use crate::types::Nid;
use crate::types::LOLND;
use crate::types::MTU;
use crate::types::PAGE_SIZE;
use cfs_utils::LockSel;
use rand::Rng;
use std::cmp::Ordering;
use std::collections::VecDeque;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering as AtomicOrdering;
use std::sync::Arc;

pub(crate) const NRBPOOLS: usize = 3;

const NRB_TINY_MIN: i32 = 512;
const NRB_TINY: i32 = NRB_TINY_MIN * 4;
const NRB_SMALL_MIN: i32 = 4096;
const NRB_SMALL: i32 = NRB_SMALL_MIN * 4;
const NRB_LARGE_MIN: i32 = 256;
const NRB_LARGE: i32 = NRB_LARGE_MIN * 4;

/// Pages per buffer of each pool.
const POOL_PAGES: [u32; NRBPOOLS] = [0, 1, (MTU + PAGE_SIZE - 1) / PAGE_SIZE];

/// A forwarding buffer, owned by the message it was lent to.
#[derive(Debug)]
pub(crate) struct RtrBuf {
    pub(crate) pool: usize,
    pub(crate) data: IoBuf,
}

pub(crate) struct RtrBufPool {
    pub(crate) idx: usize,
    pub(crate) npages: u32,
    /// Buffers in existence, lent out or not.
    pub(crate) nbuffers: i32,
    /// What the pool is being resized to.
    req_nbuffers: i32,
    /// Free buffers, minus messages waiting for one.
    pub(crate) credits: i32,
    pub(crate) mincredits: i32,
    bufs: Vec<RtrBuf>,
    pub(crate) msgs: VecDeque<Box<Msg>>,
}

impl RtrBufPool {
    pub(crate) fn new(idx: usize, npages: u32) -> RtrBufPool {
        RtrBufPool {
            idx,
            npages,
            nbuffers: 0,
            req_nbuffers: 0,
            credits: 0,
            mincredits: 0,
            bufs: Vec::new(),
            msgs: VecDeque::new(),
        }
    }

    pub(crate) fn bufsize(&self) -> u32 {
        self.npages * PAGE_SIZE
    }

    /// Resize the pool to `nbufs` buffers. Free buffers beyond the new
    /// size go right away, lent ones when they are returned. Returns the
    /// waiters the new buffers can serve.
    pub(crate) fn adjust(&mut self, nbufs: i32) -> Vec<Box<Msg>> {
        self.req_nbuffers = nbufs;
        while self.nbuffers > nbufs && self.bufs.pop().is_some() {
            self.nbuffers -= 1;
            self.credits -= 1;
        }

        let mut ready = Vec::new();
        while self.nbuffers < nbufs {
            // Pages are only touched once a buffer is first lent.
            self.bufs.push(RtrBuf {
                pool: self.idx,
                data: IoBuf::new(0),
            });
            self.nbuffers += 1;
            self.credits += 1;
            if self.credits <= 0 {
                if let Some(msg) = self.msgs.pop_front() {
                    ready.push(msg);
                }
            }
        }
        ready
    }

    /// Take a credit. False means the caller has to queue.
    pub(crate) fn take_credit(&mut self) -> bool {
        assert_eq!(self.credits < 0, !self.msgs.is_empty());
        self.credits -= 1;
        self.mincredits = self.mincredits.min(self.credits);
        self.credits >= 0
    }

    /// A buffer for a message holding a credit.
    pub(crate) fn take(&mut self) -> RtrBuf {
        let buf = match self.bufs.pop() {
            Some(buf) => buf,
            None => panic!("router pool {} has a credit but no buffer", self.idx),
        };
        buf.data.ensure_len(self.bufsize() as usize);
        buf
    }

    /// Give back a buffer, returning the waiter it can serve next.
    pub(crate) fn put_back(&mut self, buf: RtrBuf) -> Option<Box<Msg>> {
        assert_eq!(buf.pool, self.idx);
        assert_eq!(self.credits < 0, !self.msgs.is_empty());
        if self.nbuffers > self.req_nbuffers {
            // Shrinking; the buffer and the credit it carried go away.
            self.nbuffers -= 1;
            return None;
        }
        self.bufs.push(buf);
        self.credits += 1;
        if self.credits <= 0 {
            return self.msgs.pop_front();
        }
        None
    }

    /// Hand back every waiter, with the credits they took.
    pub(crate) fn drain(&mut self) -> Vec<Box<Msg>> {
        let msgs: Vec<Box<Msg>> = self.msgs.drain(..).collect();
        self.credits += msgs.len() as i32;
        msgs
    }
}

/// Index of the smallest pool whose buffers hold `len` bytes.
pub(crate) fn pool_of_len(len: u32) -> usize {
    assert!(len <= MTU, "routed message of {} bytes exceeds the MTU", len);
    POOL_PAGES
        .iter()
        .position(|npages| len <= npages * PAGE_SIZE)
        .unwrap_or(NRBPOOLS - 1)
}

/// Buffers per partition for a configured router buffer count, 0 meaning
/// the default.
fn rtrbufs_per_cpt(name: &str, configured: i32, default: i32, min: i32, ncpt: usize) -> LnetResult<i32> {
    if configured < 0 {
        log::error!("{}={} invalid when routing enabled", name, configured);
        return Err(LnetError::Invalid);
    }
    let nrbs = if configured > 0 { configured } else { default };
    Ok((nrbs / ncpt.max(1) as i32).max(min))
}

fn rtrbuf_counts(vals: [i32; NRBPOOLS], ncpt: usize) -> LnetResult<[i32; NRBPOOLS]> {
    Ok([
        rtrbufs_per_cpt("tiny_router_buffers", vals[0], NRB_TINY, NRB_TINY_MIN, ncpt)?,
        rtrbufs_per_cpt("small_router_buffers", vals[1], NRB_SMALL, NRB_SMALL_MIN, ncpt)?,
        rtrbufs_per_cpt("large_router_buffers", vals[2], NRB_LARGE, NRB_LARGE_MIN, ncpt)?,
    ])
}

/// What route selection compares. Greater is better.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct RouteKey {
    pub(crate) hops: u32,
    pub(crate) txqnob: u64,
    pub(crate) txcredits: i32,
    pub(crate) seq: u64,
}

impl RouteKey {
    /// Fewer hops, then fewer queued bytes, then more credits, then the
    /// route picked least recently.
    pub(crate) fn compare(&self, other: &RouteKey) -> Ordering {
        other
            .hops
            .cmp(&self.hops)
            .then(other.txqnob.cmp(&self.txqnob))
            .then(self.txcredits.cmp(&other.txcredits))
            .then(other.seq.cmp(&self.seq))
    }
}

impl Route {
    fn key(&self) -> RouteKey {
        RouteKey {
            hops: self.hops,
            txqnob: self.gw.txqnob(),
            txcredits: self.gw.txcredits(),
            seq: self.seq.load(AtomicOrdering::Relaxed),
        }
    }
}

/// Best live route to `dst`, through `src_ni` if one is given. A live
/// route through `rtr_nid` wins outright.
pub(crate) fn find_route_locked<'a>(
    shared: &'a NetShared,
    src_ni: Option<&Arc<Ni>>,
    dst: Nid,
    rtr_nid: Option<Nid>,
) -> Option<&'a Route> {
    let rnet = shared.remote_nets.get(&dst.net())?;
    let mut best: Option<&Route> = None;
    let mut last_seq = 0;

    for route in &rnet.routes {
        if !route.gw.alive() {
            continue;
        }
        if let Some(ni) = src_ni {
            if !Arc::ptr_eq(&route.ni, ni) {
                continue;
            }
        }
        if rtr_nid == Some(route.gateway) {
            return Some(route);
        }
        let key = route.key();
        last_seq = last_seq.max(key.seq);
        best = match best {
            Some(b) if key.compare(&b.key()) != Ordering::Greater => Some(b),
            _ => Some(route),
        };
    }

    if let Some(route) = best {
        route.seq.store(last_seq + 1, AtomicOrdering::Relaxed);
    }
    best
}

/// A route now uses the gateway `pref`; list it as a router on first use.
fn rtr_addref_locked(shared: &mut NetShared, part: &mut NetPart, pref: &PeerRef) {
    let lp = part.peers.get_mut(pref);
    lp.rtr_refcount += 1;
    if lp.rtr_refcount > 1 {
        return;
    }
    let gw = match &lp.gw {
        Some(gw) => gw.clone(),
        None => panic!("router {} without gateway state", pref.nid()),
    };
    let peer = part.peers.addref_of(pref);
    shared.routers.insert(pref.nid(), RouterEntry { gw, peer });
    shared.routers_version += 1;
}

fn rtr_decref_locked(shared: &mut NetShared, part: &mut NetPart, pref: &PeerRef) {
    let lp = part.peers.get_mut(pref);
    assert!(lp.rtr_refcount > 0, "router {} refcount underflow", pref.nid());
    lp.rtr_refcount -= 1;
    if lp.rtr_refcount > 0 {
        return;
    }
    lp.gw = None;
    let entry = match shared.routers.remove(&pref.nid()) {
        Some(entry) => entry,
        None => panic!("router {} missing from the router list", pref.nid()),
    };
    part.peers.decref(entry.peer);
    shared.routers_version += 1;
}

impl LNet {
    /// Route traffic for `net` through `gateway`, `hops` away.
    ///
    /// Routes to a local network, or through a gateway on no local
    /// network, are silently ignored. Adding an existing route is a no-op.
    pub fn add_route(&self, net: NetId, hops: u32, gateway: Nid) -> LnetResult<()> {
        log::debug!("Add route: net {} hops {} gw {}", net, hops, gateway);

        if gateway.is_any()
            || gateway.net().lnd_type() == LOLND
            || net.is_any()
            || net.lnd_type() == LOLND
            || gateway.net() == net
            || !(1..=255).contains(&hops)
        {
            return Err(LnetError::Invalid);
        }

        let ni = {
            let mut ex = self.net.lock_exclusive();
            let (shared, mut parts) = ex.split_mut();
            if shared.net2ni(net).is_some() {
                return Ok(());
            }

            let part = &mut *parts[self.cpt_of_nid(gateway)];
            let pref = match self.nid2peer_locked(shared, part, gateway) {
                Ok(pref) => pref,
                Err(LnetError::HostUnreachable) => return Ok(()),
                Err(e) => {
                    log::error!(
                        "Error {} creating route {} {} {}",
                        e.errno(),
                        net,
                        hops,
                        gateway
                    );
                    return Err(e);
                }
            };

            let exists = shared
                .remote_nets
                .get(&net)
                .map_or(false, |rnet| rnet.routes.iter().any(|r| r.gateway == gateway));
            if exists {
                part.peers.decref(pref);
                return Ok(());
            }

            let lp = part.peers.get_mut(&pref);
            let gw = lp
                .gw
                .get_or_insert_with(|| Arc::new(GatewayState::default()))
                .clone();
            lp.sync_gw();
            let ni = lp.ni.clone();

            rtr_addref_locked(shared, part, &pref);
            let rnet = shared
                .remote_nets
                .entry(net)
                .or_insert_with(|| RemoteNet { routes: Vec::new() });
            // Random position so that equal routes share the load.
            let pos = rand::thread_rng().gen_range(0..=rnet.routes.len());
            rnet.routes.insert(
                pos,
                Route {
                    gateway,
                    hops,
                    ni: ni.clone(),
                    gw,
                    peer: pref,
                    seq: AtomicU64::new(0),
                },
            );
            shared.remote_nets_version += 1;
            ni
        };

        // Assume alive.
        ni.lnd.notify(&ni, gateway, true);
        Ok(())
    }

    /// Remove the routes to `net` through `gateway`; either may be ANY.
    pub fn del_route(&self, net: NetId, gateway: Nid) -> LnetResult<()> {
        log::debug!("Del route: net {} : gw {}", net, gateway);

        let mut ex = self.net.lock_exclusive();
        let (shared, mut parts) = ex.split_mut();
        let nets: Vec<NetId> = shared
            .remote_nets
            .keys()
            .filter(|n| net.is_any() || **n == net)
            .copied()
            .collect();

        let mut found = false;
        for n in nets {
            let gone: Vec<Route> = match shared.remote_nets.get_mut(&n) {
                Some(rnet) => {
                    let (gone, keep): (Vec<Route>, Vec<Route>) = std::mem::take(&mut rnet.routes)
                        .into_iter()
                        .partition(|r| gateway.is_any() || r.gateway == gateway);
                    rnet.routes = keep;
                    gone
                }
                None => continue,
            };
            if shared
                .remote_nets
                .get(&n)
                .map_or(false, |rnet| rnet.routes.is_empty())
            {
                shared.remote_nets.remove(&n);
            }

            for route in gone {
                found = true;
                shared.remote_nets_version += 1;
                let part = &mut *parts[route.peer.cpt()];
                rtr_decref_locked(shared, part, &route.peer);
                part.peers.decref(route.peer);
            }
        }

        if found {
            Ok(())
        } else {
            Err(LnetError::NotFound)
        }
    }

    /// Routes to one network must all go through the same local NI.
    pub fn check_routes(&self) -> LnetResult<()> {
        let part = self.net.read(LockSel::Current);
        for (net, rnet) in &part.shared().remote_nets {
            let first = match rnet.routes.first() {
                Some(first) => first,
                None => continue,
            };
            if let Some(route) = rnet.routes.iter().find(|r| !Arc::ptr_eq(&r.ni, &first.ni)) {
                log::error!(
                    "Routes to {} via {} and {} not supported",
                    net,
                    route.gateway,
                    first.gateway
                );
                return Err(LnetError::Invalid);
            }
        }
        Ok(())
    }

    /// Resize every partition's pools under the exclusive lock.
    fn resize_rtrpools_locked(
        &self,
        shared: &mut NetShared,
        parts: &mut [&mut NetPart],
        counts: [i32; NRBPOOLS],
        work: &mut Vec<Deferred>,
    ) {
        for part in parts.iter_mut() {
            if part.rtrpools.is_empty() {
                part.rtrpools = POOL_PAGES
                    .iter()
                    .enumerate()
                    .map(|(idx, npages)| RtrBufPool::new(idx, *npages))
                    .collect();
            }
            for (idx, nbufs) in counts.iter().enumerate() {
                for msg in part.rtrpools[idx].adjust(*nbufs) {
                    self.resume_routed_recv_locked(part, msg, work);
                }
            }
        }
        shared.rtr_nbuffers = counts;
    }

    /// Set up the router buffer pools if this node forwards.
    pub(crate) fn rtrpools_alloc(&self, im_a_router: bool) -> LnetResult<()> {
        match self.config.forwarding() {
            Ok(Forwarding::Unset) if !im_a_router => return Ok(()),
            Ok(Forwarding::Disabled) => return Ok(()),
            Ok(_) => {}
            Err(e) => {
                log::error!("{:#}", e);
                return Err(LnetError::Invalid);
            }
        }

        let ncpt = self.net.number();
        let mut counts = rtrbuf_counts(
            [
                self.config.tiny_router_buffers,
                self.config.small_router_buffers,
                self.config.large_router_buffers,
            ],
            ncpt,
        )?;

        let mut work = Vec::new();
        {
            let mut ex = self.net.lock_exclusive();
            let (shared, mut parts) = ex.split_mut();
            for (count, hold) in counts.iter_mut().zip(shared.rtr_hold) {
                if hold > 0 {
                    *count = hold;
                }
            }
            self.resize_rtrpools_locked(shared, &mut parts, counts, &mut work);
            self.routing.store(true, AtomicOrdering::Release);
        }
        self.run_deferred(work);

        log::info!(
            "Routing enabled: {} tiny, {} small, {} large buffers per partition",
            counts[0],
            counts[1],
            counts[2]
        );
        Ok(())
    }

    /// Change the router buffer counts. A negative value keeps the current
    /// count; when routing is off the counts apply the next time it is
    /// enabled.
    pub fn adjust_rtrpools(&self, tiny: i32, small: i32, large: i32) -> LnetResult<()> {
        let vals = [tiny, small, large];
        let ncpt = self.net.number();
        // Negative only means "unchanged" here.
        let wanted = rtrbuf_counts(vals.map(|v| v.max(0)), ncpt)?;

        let mut work = Vec::new();
        {
            let mut ex = self.net.lock_exclusive();
            let (shared, mut parts) = ex.split_mut();
            if !self.is_routing() {
                for (idx, val) in vals.iter().enumerate() {
                    if *val >= 0 {
                        shared.rtr_hold[idx] = wanted[idx];
                    }
                }
                return Ok(());
            }

            let mut counts = shared.rtr_nbuffers;
            for (idx, val) in vals.iter().enumerate() {
                if *val >= 0 {
                    counts[idx] = wanted[idx];
                }
            }
            self.resize_rtrpools_locked(shared, &mut parts, counts, &mut work);
        }
        self.run_deferred(work);
        Ok(())
    }

    pub fn enable_rtrpools(&self) -> LnetResult<()> {
        if self.is_routing() {
            return Ok(());
        }
        let allocated = !self.net.read(LockSel::Cpt(0)).rtrpools.is_empty();
        if !allocated {
            return self.rtrpools_alloc(true);
        }

        let mut work = Vec::new();
        {
            let mut ex = self.net.lock_exclusive();
            let (shared, mut parts) = ex.split_mut();
            let counts = shared.rtr_hold;
            self.resize_rtrpools_locked(shared, &mut parts, counts, &mut work);
            self.routing.store(true, AtomicOrdering::Release);
        }
        self.run_deferred(work);
        log::info!("Routing enabled");
        Ok(())
    }

    /// Stop forwarding. Messages waiting for a buffer are dropped; the
    /// current counts are kept for `enable_rtrpools()`.
    pub fn disable_rtrpools(&self) -> LnetResult<()> {
        if !self.is_routing() {
            return Ok(());
        }

        let mut work = Vec::new();
        {
            let mut ex = self.net.lock_exclusive();
            let (shared, parts) = ex.split_mut();
            self.routing.store(false, AtomicOrdering::Release);
            shared.rtr_hold = shared.rtr_nbuffers;
            shared.rtr_nbuffers = [0; NRBPOOLS];
            for part in parts {
                for pool in part.rtrpools.iter_mut() {
                    for mut msg in pool.drain() {
                        msg.rtrcredit = false;
                        work.push(Deferred::Drop(msg, Err(LnetError::Canceled)));
                    }
                    pool.adjust(0);
                }
            }
        }
        self.run_deferred(work);
        log::info!("Routing disabled");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn waiting_msg() -> Box<Msg> {
        Box::new(Msg {
            routing: true,
            rtrcredit: true,
            ..Default::default()
        })
    }

    #[test]
    fn test_pool_of_len() {
        assert_eq!(pool_of_len(0), 0);
        assert_eq!(pool_of_len(1), 1);
        assert_eq!(pool_of_len(PAGE_SIZE), 1);
        assert_eq!(pool_of_len(PAGE_SIZE + 1), 2);
        assert_eq!(pool_of_len(MTU), 2);
    }

    #[test]
    fn test_rtrbufs_per_cpt() {
        assert_eq!(rtrbufs_per_cpt("tiny", 0, NRB_TINY, NRB_TINY_MIN, 1).unwrap(), 2048);
        assert_eq!(rtrbufs_per_cpt("tiny", 0, NRB_TINY, NRB_TINY_MIN, 8).unwrap(), 512);
        assert_eq!(rtrbufs_per_cpt("large", 4000, NRB_LARGE, NRB_LARGE_MIN, 2).unwrap(), 2000);
        assert_eq!(
            rtrbufs_per_cpt("small", -1, NRB_SMALL, NRB_SMALL_MIN, 1),
            Err(LnetError::Invalid)
        );
    }

    #[test]
    fn test_pool_credits() {
        let mut pool = RtrBufPool::new(1, 1);
        assert!(pool.adjust(1).is_empty());
        assert_eq!((pool.nbuffers, pool.credits), (1, 1));

        assert!(pool.take_credit());
        let buf = pool.take();
        assert_eq!(buf.data.len(), PAGE_SIZE as usize);

        // Second message waits.
        assert!(!pool.take_credit());
        pool.msgs.push_back(waiting_msg());
        assert_eq!(pool.mincredits, -1);

        // The returned buffer goes to the waiter.
        assert!(pool.put_back(buf).is_some());
        assert_eq!(pool.credits, 0);
        let buf = pool.take();
        assert!(pool.put_back(buf).is_none());
        assert_eq!(pool.credits, 1);
    }

    #[test]
    fn test_pool_grow_serves_waiters() {
        let mut pool = RtrBufPool::new(0, 0);
        assert!(!pool.take_credit());
        pool.msgs.push_back(waiting_msg());
        let ready = pool.adjust(2);
        assert_eq!(ready.len(), 1);
        assert_eq!((pool.nbuffers, pool.credits), (2, 1));
    }

    #[test]
    fn test_pool_shrink() {
        let mut pool = RtrBufPool::new(1, 1);
        pool.adjust(3);
        assert!(pool.take_credit());
        let lent = pool.take();

        pool.adjust(1);
        // Both free buffers went, the lent one is still counted.
        assert_eq!((pool.nbuffers, pool.credits), (1, 0));
        assert!(pool.put_back(lent).is_none());
        assert_eq!((pool.nbuffers, pool.credits), (1, 1));

        assert!(pool.take_credit());
        let lent = pool.take();
        pool.adjust(0);
        // Destroyed on return.
        assert!(pool.put_back(lent).is_none());
        assert_eq!((pool.nbuffers, pool.credits), (0, 0));
    }

    #[test]
    fn test_pool_drain() {
        let mut pool = RtrBufPool::new(2, 256);
        assert!(!pool.take_credit());
        pool.msgs.push_back(waiting_msg());
        assert!(!pool.take_credit());
        pool.msgs.push_back(waiting_msg());
        assert_eq!(pool.drain().len(), 2);
        assert_eq!(pool.credits, 0);
        assert!(pool.msgs.is_empty());
    }

    #[test]
    fn test_route_compare() {
        let base = RouteKey {
            hops: 2,
            txqnob: 100,
            txcredits: 4,
            seq: 3,
        };
        let fewer_hops = RouteKey { hops: 1, txqnob: 999, ..base };
        assert_eq!(fewer_hops.compare(&base), Ordering::Greater);
        let less_queued = RouteKey { txqnob: 50, txcredits: 0, ..base };
        assert_eq!(less_queued.compare(&base), Ordering::Greater);
        let more_credits = RouteKey { txcredits: 5, seq: 9, ..base };
        assert_eq!(more_credits.compare(&base), Ordering::Greater);
        let older = RouteKey { seq: 1, ..base };
        assert_eq!(older.compare(&base), Ordering::Greater);
        assert_eq!(base.compare(&base), Ordering::Equal);
    }
}
