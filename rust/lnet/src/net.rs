// Copyright (c) Meta Platforms, Inc. and affiliates.
//
// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! # Network partitions
//!
//! The network state is sharded over the partitions of the `net` scale lock.
//! Each partition (`NetPart`) owns the peers whose NID hashes to it, its
//! share of every NI's send credits, its router buffer pools, the messages
//! committed to it and its statistics.
//!
//! What all partitions need to see (`NetShared`) is the NI list, the
//! remote networks with their routes and the router list. It is read under
//! any partition lock and only changed under the exclusive lock.

use crate::api::LNet;
use crate::msg::MsgContainer;
use crate::ni::Ni;
use crate::ni::NiTxQueue;
use crate::peer::GatewayState;
use crate::peer::PeerRef;
use crate::peer::PeerTable;
use crate::router::RtrBufPool;
use crate::router::NRBPOOLS;
use crate::types::NetId;
use crate::types::Nid;
use cfs_utils::hash::order_base_2;
use cfs_utils::hash_long;
use serde::Deserialize;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::atomic::AtomicU64;
use std::sync::Arc;

/// Message statistics of one partition, or summed over all of them.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Counters {
    pub msgs_alloc: u32,
    pub msgs_max: u32,
    pub errors: u32,
    pub send_count: u32,
    pub recv_count: u32,
    pub route_count: u32,
    pub drop_count: u32,
    pub send_length: u64,
    pub recv_length: u64,
    pub route_length: u64,
    pub drop_length: u64,
}

impl Counters {
    pub fn add(&mut self, other: &Counters) {
        self.msgs_alloc += other.msgs_alloc;
        self.msgs_max += other.msgs_max;
        self.errors += other.errors;
        self.send_count += other.send_count;
        self.recv_count += other.recv_count;
        self.route_count += other.route_count;
        self.drop_count += other.drop_count;
        self.send_length += other.send_length;
        self.recv_length += other.recv_length;
        self.route_length += other.route_length;
        self.drop_length += other.drop_length;
    }

    pub(crate) fn drop_msg(&mut self, nob: u32) {
        self.drop_count += 1;
        self.drop_length += nob as u64;
    }
}

/// Simulated failure of traffic to or from a peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct TestPeer {
    pub(crate) nid: Nid,
    /// Messages left to fail, `u32::MAX` for all of them.
    pub(crate) threshold: u32,
}

pub(crate) struct NetPart {
    pub(crate) cpt: usize,
    pub(crate) peers: PeerTable,
    pub(crate) counters: Counters,
    pub(crate) msgs: MsgContainer,
    /// This partition's share of each NI's send credits, indexed by
    /// `Ni::idx`.
    pub(crate) ni_tx: Vec<NiTxQueue>,
    /// Empty until routing is first enabled.
    pub(crate) rtrpools: Vec<RtrBufPool>,
    /// Only partition 0 keeps any.
    pub(crate) test_peers: Vec<TestPeer>,
}

impl NetPart {
    pub(crate) fn new(cpt: usize, nfinalizers: usize) -> NetPart {
        NetPart {
            cpt,
            peers: PeerTable::new(cpt),
            counters: Counters::default(),
            msgs: MsgContainer::new(nfinalizers),
            ni_tx: Vec::new(),
            rtrpools: Vec::new(),
            test_peers: Vec::new(),
        }
    }
}

pub(crate) struct Route {
    pub(crate) gateway: Nid,
    pub(crate) hops: u32,
    /// NI the gateway is reached through.
    pub(crate) ni: Arc<Ni>,
    pub(crate) gw: Arc<GatewayState>,
    /// Reference on the gateway peer held by the route.
    pub(crate) peer: PeerRef,
    /// Bumped each time the route wins, rotating among equal routes.
    pub(crate) seq: AtomicU64,
}

pub(crate) struct RemoteNet {
    pub(crate) routes: Vec<Route>,
}

pub(crate) struct RouterEntry {
    pub(crate) gw: Arc<GatewayState>,
    pub(crate) peer: PeerRef,
}

#[derive(Default)]
pub(crate) struct NetShared {
    pub(crate) nis: Vec<Arc<Ni>>,
    pub(crate) remote_nets: BTreeMap<NetId, RemoteNet>,
    pub(crate) remote_nets_version: u64,
    /// Gateways of any route, sorted by NID.
    pub(crate) routers: BTreeMap<Nid, RouterEntry>,
    pub(crate) routers_version: u64,
    /// Buffers per partition of each router pool, as last configured.
    pub(crate) rtr_nbuffers: [i32; NRBPOOLS],
    /// Counts kept across `disable_rtrpools()`.
    pub(crate) rtr_hold: [i32; NRBPOOLS],
}

impl NetShared {
    /// The local NI on network `net`.
    pub(crate) fn net2ni(&self, net: NetId) -> Option<&Arc<Ni>> {
        self.nis.iter().find(|ni| ni.nid.net() == net)
    }

    pub(crate) fn nid2ni(&self, nid: Nid) -> Option<&Arc<Ni>> {
        self.nis.iter().find(|ni| ni.nid == nid)
    }

    pub(crate) fn loni(&self) -> Option<&Arc<Ni>> {
        self.nis.iter().find(|ni| ni.is_loopback())
    }

    pub(crate) fn is_local_nid(&self, nid: Nid) -> bool {
        self.nid2ni(nid).is_some()
    }
}

/// Partition a NID's peer and credits live in.
pub(crate) fn cpt_of_nid(nid: Nid, ncpt: usize) -> usize {
    if ncpt <= 1 {
        return 0;
    }
    let key = nid.raw();
    let val = hash_long(key, order_base_2(ncpt)) as usize;
    if val < ncpt {
        return val;
    }
    (key as usize)
        .wrapping_add(val)
        .wrapping_add(val / 2)
        % ncpt
}

impl LNet {
    pub(crate) fn cpt_of_nid(&self, nid: Nid) -> usize {
        cpt_of_nid(nid, self.net.number())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cpt_of_nid_spread() {
        assert_eq!(cpt_of_nid("7@gni".parse().unwrap(), 1), 0);
        for ncpt in [2, 3, 4, 6] {
            let mut seen = vec![0; ncpt];
            for addr in 0..512 {
                let nid = Nid::new("gni".parse().unwrap(), addr);
                let cpt = cpt_of_nid(nid, ncpt);
                assert!(cpt < ncpt);
                assert_eq!(cpt, cpt_of_nid(nid, ncpt));
                seen[cpt] += 1;
            }
            assert!(seen.iter().all(|n| *n > 0), "{:?}", seen);
        }
    }

    #[test]
    fn test_counters_add() {
        let mut total = Counters::default();
        let mut one = Counters::default();
        one.send_count = 2;
        one.drop_msg(100);
        total.add(&one);
        total.add(&one);
        assert_eq!(total.send_count, 4);
        assert_eq!(total.drop_count, 2);
        assert_eq!(total.drop_length, 200);
    }
}
