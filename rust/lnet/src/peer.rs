// Copyright (c) Meta Platforms, Inc. and affiliates.
//
// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! # Peers
//!
//! Every network partition hashes the peers whose NID maps to it. A peer
//! carries the credits this node may use towards it (`txcredits`) and the
//! router buffer credits it may use on this node (`rtrcredits`), each with
//! a low watermark and a queue of messages waiting for a credit.
//!
//! The hash table holds one reference on each peer; every `PeerRef` handed
//! out holds another. A peer goes away when its last reference is
//! returned, which for a peer still in the table only happens when the
//! table is cleaned up.

use crate::api::LNet;
use crate::error::LnetError;
use crate::error::LnetResult;
use crate::msg::Msg;
use crate::net::NetPart;
use crate::net::NetShared;
use crate::ni::Ni;
use crate::types::Nid;
use cfs_utils::LockSel;
use std::collections::VecDeque;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicI32;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::sync::Arc;

pub(crate) const PEER_HASH_SIZE: usize = 503;

/// Seconds between two LND queries about a peer that looks dead.
const QUERY_INTERVAL: u64 = 1;

/// Route selection state of a gateway, readable from any partition.
#[derive(Debug, Default)]
pub(crate) struct GatewayState {
    alive: AtomicBool,
    txcredits: AtomicI32,
    txqnob: AtomicU64,
}

impl GatewayState {
    pub(crate) fn alive(&self) -> bool {
        self.alive.load(Ordering::Relaxed)
    }

    pub(crate) fn txcredits(&self) -> i32 {
        self.txcredits.load(Ordering::Relaxed)
    }

    pub(crate) fn txqnob(&self) -> u64 {
        self.txqnob.load(Ordering::Relaxed)
    }
}

pub(crate) struct Peer {
    pub(crate) nid: Nid,
    pub(crate) ni: Arc<Ni>,
    pub(crate) refcount: u32,
    /// Routes and router list entries using this peer as a gateway.
    pub(crate) rtr_refcount: u32,
    pub(crate) txcredits: i32,
    pub(crate) mintxcredits: i32,
    pub(crate) rtrcredits: i32,
    pub(crate) minrtrcredits: i32,
    /// Bytes queued or in flight towards this peer.
    pub(crate) txqnob: u64,
    pub(crate) txq: VecDeque<Box<Msg>>,
    pub(crate) rtrq: VecDeque<Box<Msg>>,
    pub(crate) alive: bool,
    /// Times the alive state changed.
    pub(crate) alive_count: u32,
    /// A state change has not been passed on yet.
    pub(crate) notify: bool,
    pub(crate) notifylnd: bool,
    pub(crate) notifying: bool,
    /// When the alive state was last set.
    pub(crate) timestamp: u64,
    pub(crate) last_alive: u64,
    pub(crate) last_query: u64,
    pub(crate) gw: Option<Arc<GatewayState>>,
}

impl Peer {
    pub(crate) fn is_router(&self) -> bool {
        self.rtr_refcount > 0
    }

    pub(crate) fn aliveness_enabled(&self, routing: bool) -> bool {
        routing && self.ni.peertimeout > 0
    }

    /// Publish the fields route selection looks at.
    pub(crate) fn sync_gw(&self) {
        if let Some(gw) = &self.gw {
            gw.alive.store(self.alive, Ordering::Relaxed);
            gw.txcredits.store(self.txcredits, Ordering::Relaxed);
            gw.txqnob.store(self.txqnob, Ordering::Relaxed);
        }
    }

    /// Record news about the peer's health, ignoring anything older than
    /// what is already known.
    pub(crate) fn notify_locked(&mut self, notifylnd: bool, alive: bool, when: u64) {
        if when < self.timestamp {
            log::debug!("Out of date news about {}", self.nid);
            return;
        }
        self.timestamp = when;

        if self.alive_count != 0 && self.alive == alive {
            log::debug!("Old news about {}", self.nid);
            return;
        }

        self.alive_count += 1;
        self.alive = alive;
        self.notify = true;
        self.notifylnd |= notifylnd;
        self.sync_gw();
        log::debug!("set {} {}", self.nid, if alive { "up" } else { "down" });
    }

    fn is_alive(&mut self, now: u64) -> bool {
        // Trust notify() when it has more recent news, but ignore the
        // initial assumed death.
        if !self.alive && self.alive_count > 0 && self.timestamp >= self.last_alive {
            return false;
        }

        let deadline = self.last_alive + self.ni.peertimeout.max(0) as u64;
        let alive = deadline > now;

        // Routers assumed dead at creation wait for real news.
        if alive && !self.alive && !(self.is_router() && self.alive_count == 0) {
            let last_alive = self.last_alive;
            self.notify_locked(false, true, last_alive);
        }
        alive
    }
}

/// One counted reference on a peer.
#[must_use]
#[derive(Debug, PartialEq, Eq)]
pub(crate) struct PeerRef {
    nid: Nid,
    cpt: usize,
}

impl PeerRef {
    pub(crate) fn nid(&self) -> Nid {
        self.nid
    }

    /// Network partition hashing the peer.
    pub(crate) fn cpt(&self) -> usize {
        self.cpt
    }
}

pub(crate) struct PeerTable {
    cpt: usize,
    buckets: Vec<Vec<Peer>>,
    number: usize,
    /// Bumped whenever a peer is added or removed.
    version: u64,
}

fn bucket_of(nid: Nid) -> usize {
    nid.addr() as usize % PEER_HASH_SIZE
}

impl PeerTable {
    pub(crate) fn new(cpt: usize) -> PeerTable {
        PeerTable {
            cpt,
            buckets: (0..PEER_HASH_SIZE).map(|_| Vec::new()).collect(),
            number: 0,
            version: 0,
        }
    }

    pub(crate) fn number(&self) -> usize {
        self.number
    }

    pub(crate) fn version(&self) -> u64 {
        self.version
    }

    pub(crate) fn bucket(&self, idx: usize) -> &[Peer] {
        &self.buckets[idx]
    }

    pub(crate) fn find(&self, nid: Nid) -> Option<&Peer> {
        self.buckets[bucket_of(nid)].iter().find(|lp| lp.nid == nid)
    }

    pub(crate) fn find_mut(&mut self, nid: Nid) -> Option<&mut Peer> {
        self.buckets[bucket_of(nid)]
            .iter_mut()
            .find(|lp| lp.nid == nid)
    }

    /// # Panics
    ///
    /// Panics if `pref` belongs to another partition or its peer is gone.
    pub(crate) fn get_mut(&mut self, pref: &PeerRef) -> &mut Peer {
        assert_eq!(pref.cpt, self.cpt, "peer {} in the wrong table", pref.nid);
        let cpt = self.cpt;
        match self.find_mut(pref.nid) {
            Some(lp) => lp,
            None => panic!("referenced peer {} not in table {}", pref.nid, cpt),
        }
    }

    pub(crate) fn get(&self, pref: &PeerRef) -> &Peer {
        assert_eq!(pref.cpt, self.cpt, "peer {} in the wrong table", pref.nid);
        match self.find(pref.nid) {
            Some(lp) => lp,
            None => panic!("referenced peer {} not in table {}", pref.nid, self.cpt),
        }
    }

    /// Take a new reference on the peer of `nid`, if it is known.
    pub(crate) fn addref(&mut self, nid: Nid) -> Option<PeerRef> {
        let cpt = self.cpt;
        self.find_mut(nid).map(|lp| {
            lp.refcount += 1;
            PeerRef { nid, cpt }
        })
    }

    /// Duplicate a reference.
    pub(crate) fn addref_of(&mut self, pref: &PeerRef) -> PeerRef {
        self.get_mut(pref).refcount += 1;
        PeerRef {
            nid: pref.nid,
            cpt: pref.cpt,
        }
    }

    fn insert(&mut self, mut lp: Peer) -> PeerRef {
        // One for the table, one for the caller.
        lp.refcount = 2;
        let nid = lp.nid;
        self.buckets[bucket_of(nid)].push(lp);
        self.number += 1;
        self.version += 1;
        PeerRef { nid, cpt: self.cpt }
    }

    /// Return a reference, destroying the peer with the last one.
    ///
    /// # Panics
    ///
    /// Panics when destroying a peer still used as a gateway or with
    /// messages queued on it.
    pub(crate) fn decref(&mut self, pref: PeerRef) {
        let lp = self.get_mut(&pref);
        assert!(lp.refcount > 0, "peer {} refcount underflow", pref.nid);
        lp.refcount -= 1;
        if lp.refcount > 0 {
            return;
        }

        assert_eq!(lp.rtr_refcount, 0, "destroying router {}", pref.nid);
        assert!(
            lp.txq.is_empty() && lp.rtrq.is_empty(),
            "destroying peer {} with queued messages",
            pref.nid
        );
        let bucket = &mut self.buckets[bucket_of(pref.nid)];
        bucket.retain(|lp| lp.nid != pref.nid);
        self.number -= 1;
        self.version += 1;
    }

    /// Drop the table's own reference on every peer. Peers still referenced
    /// elsewhere stay until their last `PeerRef` is returned.
    pub(crate) fn cleanup(&mut self) -> usize {
        let nids: Vec<Nid> = self
            .buckets
            .iter()
            .flat_map(|b| b.iter().map(|lp| lp.nid))
            .collect();
        for nid in nids {
            self.decref(PeerRef { nid, cpt: self.cpt });
        }
        self.number
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = &Peer> {
        self.buckets.iter().flat_map(|b| b.iter())
    }
}

impl LNet {
    /// Router buffer credits of a new peer on `ni`.
    fn peer_buffer_credits(&self, ni: &Ni) -> i32 {
        if ni.peerrtrcredits > 0 {
            return ni.peerrtrcredits;
        }
        if self.config.peer_buffer_credits > 0 {
            return self.config.peer_buffer_credits;
        }
        ni.peertxcredits
    }

    /// Find or create the peer of `nid` in `part`, which must be the
    /// partition `nid` hashes to.
    pub(crate) fn nid2peer_locked(
        &self,
        shared: &NetShared,
        part: &mut NetPart,
        nid: Nid,
    ) -> LnetResult<PeerRef> {
        if self.is_shutdown() {
            return Err(LnetError::Shutdown);
        }
        debug_assert_eq!(self.cpt_of_nid(nid), part.cpt);
        if let Some(pref) = part.peers.addref(nid) {
            return Ok(pref);
        }

        let ni = match shared.net2ni(nid.net()) {
            Some(ni) => ni.clone(),
            None => return Err(LnetError::HostUnreachable),
        };
        let rtrcredits = self.peer_buffer_credits(&ni);
        let lp = Peer {
            nid,
            txcredits: ni.peertxcredits,
            mintxcredits: ni.peertxcredits,
            rtrcredits,
            minrtrcredits: rtrcredits,
            ni,
            refcount: 0,
            rtr_refcount: 0,
            txqnob: 0,
            txq: VecDeque::new(),
            rtrq: VecDeque::new(),
            alive: !self.config.check_routers_before_use,
            alive_count: 0,
            notify: false,
            notifylnd: false,
            notifying: false,
            timestamp: 0,
            // Assume alive until told otherwise.
            last_alive: self.now(),
            last_query: 0,
            gw: None,
        };
        Ok(part.peers.insert(lp))
    }

    /// Whether the next hop of a message looks alive. Always true when
    /// aliveness is not tracked for the peer.
    pub(crate) fn peer_alive_locked(&self, part: &mut NetPart, nid: Nid) -> bool {
        let routing = self.is_routing();
        let now = self.now();
        let lp = match part.peers.find_mut(nid) {
            Some(lp) => lp,
            None => return true,
        };
        if !lp.aliveness_enabled(routing) {
            return true;
        }
        if lp.is_alive(now) {
            return true;
        }

        // Avoid hammering the NI with queries about a dead peer.
        if lp.last_query != 0 && now < lp.last_query + QUERY_INTERVAL {
            if lp.alive {
                log::warn!(
                    "Unexpected aliveness of peer {}: {} < {} ({}/{})",
                    lp.nid,
                    now,
                    lp.last_query + QUERY_INTERVAL,
                    QUERY_INTERVAL,
                    lp.ni.peertimeout
                );
            }
            return false;
        }

        let last_alive = lp.ni.lnd.query(&lp.ni, lp.nid);
        lp.last_query = now;
        if let Some(last_alive) = last_alive {
            lp.last_alive = last_alive;
        }

        if lp.is_alive(now) {
            return true;
        }
        let last_alive = lp.last_alive;
        lp.notify_locked(false, false, last_alive);
        false
    }

    /// Pass pending state changes of a peer to its LND, from one thread at
    /// a time so notifications arrive in order.
    pub(crate) fn ni_notify(&self, nid: Nid) {
        let cpt = self.cpt_of_nid(nid);
        {
            let mut part = self.net.lock(LockSel::Cpt(cpt));
            match part.peers.find_mut(nid) {
                Some(lp) if !lp.notifying => lp.notifying = true,
                _ => return,
            }
        }

        loop {
            let (ni, alive, notifylnd) = {
                let mut part = self.net.lock(LockSel::Cpt(cpt));
                let lp = match part.peers.find_mut(nid) {
                    Some(lp) => lp,
                    None => return,
                };
                if !lp.notify {
                    lp.notifying = false;
                    return;
                }
                let notifylnd = lp.notifylnd;
                lp.notify = false;
                lp.notifylnd = false;
                (lp.ni.clone(), lp.alive, notifylnd)
            };
            // A new change may land meanwhile; the next round picks it up.
            if notifylnd {
                ni.lnd.notify(&ni, nid, alive);
            }
        }
    }

    /// Tell LNet that `nid` went up or down at `when` (LNet seconds). `ni`
    /// is the reporting interface, `None` for administrative news.
    pub fn notify(&self, ni: Option<&Arc<Ni>>, nid: Nid, alive: bool, when: u64) -> LnetResult<()> {
        let now = self.now();
        let state = if alive { "up" } else { "down" };

        if let Some(ni) = ni {
            if ni.nid.net() != nid.net() {
                log::warn!(
                    "Ignoring notification of {} {} by {} (different net)",
                    nid,
                    state,
                    ni.nid
                );
                return Err(LnetError::Invalid);
            }
        }

        if when > now {
            log::warn!(
                "Ignoring prediction from {} of {} {} {} seconds in the future",
                ni.map(|ni| ni.nid.to_string())
                    .unwrap_or_else(|| "userspace".to_string()),
                nid,
                state,
                when - now
            );
            return Err(LnetError::Invalid);
        }

        if ni.is_some() && !alive && !self.config.auto_down {
            log::debug!("Auto-down disabled");
            return Ok(());
        }

        let cpt = self.cpt_of_nid(nid);
        {
            let mut part = self.net.lock(LockSel::Cpt(cpt));
            if self.is_shutdown() {
                return Err(LnetError::Shutdown);
            }
            let lp = match part.peers.find_mut(nid) {
                Some(lp) => lp,
                None => {
                    log::debug!("{} not found", nid);
                    return Ok(());
                }
            };

            // LNDs report death with whatever time they have; don't let
            // that move the clock back.
            let when = if ni.is_some() && !alive && when < lp.last_alive {
                lp.last_alive
            } else {
                when
            };
            lp.notify_locked(ni.is_none(), alive, when);
        }

        self.ni_notify(nid);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ni::LoLnd;
    use crate::ni::NiConfig;

    fn peer(nid: &str) -> Peer {
        let ni = Arc::new(Ni::new(
            Nid::LOOPBACK,
            0,
            Arc::new(LoLnd),
            &NiConfig {
                credits: 8,
                peer_credits: 2,
                peer_buffer_credits: 0,
                peer_timeout: 10,
            },
        ));
        Peer {
            nid: nid.parse().unwrap(),
            ni,
            refcount: 0,
            rtr_refcount: 0,
            txcredits: 2,
            mintxcredits: 2,
            rtrcredits: 2,
            minrtrcredits: 2,
            txqnob: 0,
            txq: VecDeque::new(),
            rtrq: VecDeque::new(),
            alive: true,
            alive_count: 0,
            notify: false,
            notifylnd: false,
            notifying: false,
            timestamp: 0,
            last_alive: 100,
            last_query: 0,
            gw: None,
        }
    }

    #[test]
    fn test_refcounts() {
        let mut table = PeerTable::new(0);
        let first = table.insert(peer("1@gni"));
        assert_eq!(table.number(), 1);
        let second = table.addref(first.nid()).unwrap();
        assert_eq!(table.get(&first).refcount, 3);
        table.decref(first);
        table.decref(second);
        // Still held by the table.
        assert_eq!(table.number(), 1);
        let version = table.version();
        assert_eq!(table.cleanup(), 0);
        assert!(table.version() > version);
        assert!(table.find("1@gni".parse().unwrap()).is_none());
    }

    #[test]
    fn test_cleanup_keeps_referenced_peers() {
        let mut table = PeerTable::new(0);
        let pref = table.insert(peer("7@gni"));
        assert_eq!(table.cleanup(), 1);
        table.decref(pref);
        assert_eq!(table.number(), 0);
    }

    #[test]
    #[should_panic(expected = "destroying router")]
    fn test_destroy_router_panics() {
        let mut table = PeerTable::new(0);
        let pref = table.insert(peer("2@gni"));
        table.get_mut(&pref).rtr_refcount = 1;
        table.cleanup();
        table.decref(pref);
    }

    #[test]
    fn test_notify_ordering() {
        let mut lp = peer("3@gni");
        lp.notify_locked(false, false, 50);
        assert!(!lp.alive);
        assert_eq!(lp.alive_count, 1);
        assert!(lp.notify);

        // Older news is ignored.
        lp.notify_locked(false, true, 40);
        assert!(!lp.alive);
        // Same state again is old news.
        lp.notify = false;
        lp.notify_locked(false, false, 60);
        assert!(!lp.notify);
        assert_eq!(lp.timestamp, 60);

        lp.notify_locked(true, true, 70);
        assert!(lp.alive);
        assert!(lp.notifylnd);
        assert_eq!(lp.alive_count, 2);
    }

    #[test]
    fn test_is_alive_deadline() {
        let mut lp = peer("4@gni");
        assert!(lp.is_alive(105));
        assert!(!lp.is_alive(110));

        // Fresher death notice wins over the deadline.
        lp.notify_locked(false, false, 101);
        assert!(!lp.is_alive(102));
    }

    #[test]
    fn test_gateway_state_mirror() {
        let mut lp = peer("5@gni");
        let gw = Arc::new(GatewayState::default());
        lp.gw = Some(gw.clone());
        lp.txcredits = -1;
        lp.txqnob = 4096;
        lp.sync_gw();
        assert!(gw.alive());
        assert_eq!(gw.txcredits(), -1);
        assert_eq!(gw.txqnob(), 4096);
    }
}
