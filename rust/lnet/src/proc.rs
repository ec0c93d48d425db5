// Copyright (c) Meta Platforms, Inc. and affiliates.
//
// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! # Text reports of the LNet tables
//!
//! The peer, route, router and NI tables are read one row per call. Each
//! call takes the cursor the previous one returned, starting from
//! `ProcCursor::START`, and an empty row means the end of the table. A
//! cursor remembers the version of the table it walks; once the table
//! changes under it, reads fail with `Stale` and the walk has to start
//! over. The buffer and statistics reports are short and returned whole.
//!
//! A cursor packs, from the top: one unused bit, the partition, the table
//! version, the hash bucket and the position inside the bucket.

use crate::api::LNet;
use crate::error::LnetError;
use crate::error::LnetResult;
use crate::peer::PEER_HASH_SIZE;
use crate::router::NRBPOOLS;
use cfs_utils::LockSel;
use std::sync::Arc;

const CPT_BITS: u32 = 16;
const VER_BITS: u32 = 16;
const IDX_BITS: u32 = 9;
const NUM_BITS: u32 = 64 - CPT_BITS - VER_BITS - IDX_BITS - 1;

const TBL_BITS: u32 = IDX_BITS + NUM_BITS;
const ALL_BITS: u32 = TBL_BITS + VER_BITS;

const CPT_MASK: u64 = (1 << CPT_BITS) - 1;
const VER_MASK: u64 = (1 << VER_BITS) - 1;
const IDX_MASK: u64 = (1 << IDX_BITS) - 1;
const NUM_MASK: u64 = (1 << NUM_BITS) - 1;

/// Ages beyond this many seconds are all reported as this.
const MAX_REPORTED_AGE: u64 = 9999;

/// Position in a table walk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ProcCursor(u64);

impl ProcCursor {
    pub const START: ProcCursor = ProcCursor(0);

    fn make(cpt: usize, ver: u64, idx: usize, num: usize) -> ProcCursor {
        ProcCursor(
            ((cpt as u64 & CPT_MASK) << ALL_BITS)
                | ((ver & VER_MASK) << TBL_BITS)
                | ((idx as u64 & IDX_MASK) << NUM_BITS)
                | (num as u64 & NUM_MASK),
        )
    }

    pub fn from_raw(raw: u64) -> ProcCursor {
        ProcCursor(raw)
    }

    pub fn raw(&self) -> u64 {
        self.0
    }

    fn cpt(&self) -> usize {
        ((self.0 >> ALL_BITS) & CPT_MASK) as usize
    }

    fn version(&self) -> u64 {
        (self.0 >> TBL_BITS) & VER_MASK
    }

    fn idx(&self) -> usize {
        ((self.0 >> NUM_BITS) & IDX_MASK) as usize
    }

    fn num(&self) -> usize {
        (self.0 & NUM_MASK) as usize
    }

    fn is_start(&self) -> bool {
        self.0 == 0
    }

    /// Rows are counted from one, so a cursor that is not the start and
    /// has no row number points nowhere.
    fn is_void(&self) -> bool {
        !self.is_start() && self.num() == 0
    }
}

/// The part of a table version a cursor can hold.
fn ver_valid(ver: u64) -> u64 {
    ver & VER_MASK
}

fn up_down(alive: bool) -> &'static str {
    if alive {
        "up"
    } else {
        "down"
    }
}

impl LNet {
    /// One row of the remote route table. The first call returns the
    /// routing state and the column header.
    pub fn read_routes(&self, cursor: ProcCursor) -> LnetResult<(String, ProcCursor)> {
        let net = self.net.read(LockSel::Cpt(0));
        let shared = net.shared();

        if cursor.is_start() {
            let text = format!(
                "Routing {}\n{:<8} {:>4} {:>7} {}\n",
                if self.is_routing() { "enabled" } else { "disabled" },
                "net",
                "hops",
                "state",
                "router"
            );
            let ver = ver_valid(shared.remote_nets_version);
            return Ok((text, ProcCursor::make(0, ver, 0, 1)));
        }

        if cursor.is_void() {
            return Ok((String::new(), cursor));
        }
        let ver = cursor.version();
        if ver != ver_valid(shared.remote_nets_version) {
            return Err(LnetError::Stale);
        }

        let skip = cursor.num() - 1;
        let row = shared
            .remote_nets
            .iter()
            .flat_map(|(net, rnet)| rnet.routes.iter().map(move |route| (net, route)))
            .nth(skip);
        match row {
            Some((net, route)) => {
                let text = format!(
                    "{:<8} {:>4} {:>7} {}\n",
                    net.to_string(),
                    route.hops,
                    up_down(route.gw.alive()),
                    route.gateway
                );
                Ok((text, ProcCursor::make(0, ver, 0, cursor.num() + 1)))
            }
            None => Ok((String::new(), cursor)),
        }
    }

    /// One row of the router table, sorted by NID.
    pub fn read_routers(&self, cursor: ProcCursor) -> LnetResult<(String, ProcCursor)> {
        if cursor.is_start() {
            let text = format!(
                "{:<4} {:>7} {:>9} {:>6} {}\n",
                "ref", "rtr_ref", "alive_cnt", "state", "router"
            );
            let ver = ver_valid(self.net.read(LockSel::Cpt(0)).shared().routers_version);
            return Ok((text, ProcCursor::make(0, ver, 0, 1)));
        }

        if cursor.is_void() {
            return Ok((String::new(), cursor));
        }
        let ver = cursor.version();
        let pref = {
            let net = self.net.read(LockSel::Cpt(0));
            let shared = net.shared();
            if ver != ver_valid(shared.routers_version) {
                return Err(LnetError::Stale);
            }
            match shared.routers.values().nth(cursor.num() - 1) {
                Some(rtr) => (rtr.peer.nid(), rtr.peer.cpt()),
                None => return Ok((String::new(), cursor)),
            }
        };

        // The peer lives in its own partition.
        let (nid, cpt) = pref;
        let part = self.net.read(LockSel::Cpt(cpt));
        let text = match part.peers.find(nid) {
            Some(lp) => format!(
                "{:<4} {:>7} {:>9} {:>6} {}\n",
                lp.refcount,
                lp.rtr_refcount,
                lp.alive_count,
                up_down(lp.alive),
                nid
            ),
            None => return Err(LnetError::Stale),
        };
        Ok((text, ProcCursor::make(0, ver, 0, cursor.num() + 1)))
    }

    /// One row of the peer tables, walking partition after partition.
    pub fn read_peers(&self, cursor: ProcCursor) -> LnetResult<(String, ProcCursor)> {
        if cursor.is_start() {
            let text = format!(
                "{:<24} {:>4} {:>5} {:>5} {:>5} {:>5} {:>5} {:>5} {:>5} {}\n",
                "nid", "refs", "state", "last", "max", "rtr", "min", "tx", "min", "queue"
            );
            return Ok((text, ProcCursor::make(0, 0, 0, 1)));
        }

        let ncpt = self.net.number();
        if cursor.is_void() || cursor.cpt() >= ncpt {
            return Ok((String::new(), cursor));
        }
        let now = self.now();
        let routing = self.is_routing();
        let mut cpt = cursor.cpt();
        let mut ver = cursor.version();
        let mut idx = cursor.idx();
        let mut num = cursor.num();

        while cpt < ncpt {
            let part = self.net.read(LockSel::Cpt(cpt));
            // The version is picked up when a partition walk starts.
            if idx == 0 && num == 1 {
                ver = ver_valid(part.peers.version());
            }
            if ver != ver_valid(part.peers.version()) {
                return Err(LnetError::Stale);
            }

            while idx < PEER_HASH_SIZE {
                let bucket = part.peers.bucket(idx);
                if let Some(lp) = bucket.get(num - 1) {
                    let (state, last) = if lp.aliveness_enabled(routing) {
                        let age = now.saturating_sub(lp.last_alive).min(MAX_REPORTED_AGE);
                        (up_down(lp.alive), age as i64)
                    } else if lp.is_router() {
                        (up_down(lp.alive), -1)
                    } else {
                        ("NA", -1)
                    };
                    let text = format!(
                        "{:<24} {:>4} {:>5} {:>5} {:>5} {:>5} {:>5} {:>5} {:>5} {}\n",
                        lp.nid.to_string(),
                        lp.refcount,
                        state,
                        last,
                        lp.ni.peertxcredits,
                        lp.rtrcredits,
                        lp.minrtrcredits,
                        lp.txcredits,
                        lp.mintxcredits,
                        lp.txqnob
                    );
                    let next = if num == bucket.len() {
                        ProcCursor::make(cpt, ver, idx + 1, 1)
                    } else {
                        ProcCursor::make(cpt, ver, idx, num + 1)
                    };
                    return Ok((text, next));
                }
                idx += 1;
                num = 1;
            }

            cpt += 1;
            idx = 0;
            num = 1;
        }
        Ok((String::new(), cursor))
    }

    /// Router buffer pools of every partition.
    pub fn read_buffers(&self) -> String {
        let mut text = format!("{:>5} {:>5} {:>7} {:>7}\n", "pages", "count", "credits", "min");
        for cpt in 0..self.net.number() {
            let part = self.net.read(LockSel::Cpt(cpt));
            if part.rtrpools.is_empty() {
                for _ in 0..NRBPOOLS {
                    text += &format!("{:>5} {:>5} {:>7} {:>7}\n", 0, 0, 0, 0);
                }
                continue;
            }
            for pool in part.rtrpools.iter() {
                text += &format!(
                    "{:>5} {:>5} {:>7} {:>7}\n",
                    pool.npages, pool.nbuffers, pool.credits, pool.mincredits
                );
            }
        }
        text
    }

    /// One row per NI and partition.
    pub fn read_nis(&self, cursor: ProcCursor) -> LnetResult<(String, ProcCursor)> {
        if cursor.is_start() {
            let text = format!(
                "{:<24} {:>6} {:>5} {:>4} {:>4} {:>4} {:>5} {:>5} {:>5}\n",
                "nid", "status", "alive", "refs", "peer", "rtr", "max", "tx", "min"
            );
            return Ok((text, ProcCursor::make(0, 0, 0, 1)));
        }

        if cursor.is_void() {
            return Ok((String::new(), cursor));
        }
        let ncpt = self.net.number();
        let skip = cursor.num() - 1;
        let nis = self.nis();
        let ni = match nis.get(skip / ncpt) {
            Some(ni) => ni,
            None => return Ok((String::new(), cursor)),
        };
        let cpt = skip % ncpt;

        let last_alive = if ni.is_loopback() {
            // Forever alive.
            0
        } else if self.is_routing() {
            self.now().saturating_sub(ni.last_alive()) as i64
        } else {
            -1
        };
        let part = self.net.read(LockSel::Cpt(cpt));
        let tq = match part.ni_tx.get(ni.idx) {
            Some(tq) => tq,
            None => return Err(LnetError::Stale),
        };
        let text = format!(
            "{:<24} {:>6} {:>5} {:>4} {:>4} {:>4} {:>5} {:>5} {:>5}\n",
            ni.nid.to_string(),
            "up",
            last_alive,
            // Without the copy in `nis` and the one in the NI list.
            Arc::strong_count(ni).saturating_sub(2),
            ni.peertxcredits,
            ni.peerrtrcredits,
            tq.maxcredits,
            tq.credits,
            tq.mincredits
        );
        Ok((text, ProcCursor::make(0, 0, 0, cursor.num() + 1)))
    }

    /// Message counters on one line.
    pub fn read_stats(&self) -> String {
        let c = self.counters();
        format!(
            "{} {} {} {} {} {} {} {} {} {} {}\n",
            c.msgs_alloc,
            c.msgs_max,
            c.errors,
            c.send_count,
            c.recv_count,
            c.route_count,
            c.drop_count,
            c.send_length,
            c.recv_length,
            c.route_length,
            c.drop_length
        )
    }

    /// Walk a whole table with one of the `read_*` row readers, starting
    /// over when it changes underneath. Gives up with `Stale` after
    /// `retries` restarts.
    pub fn read_table<F>(&self, mut read: F, retries: usize) -> LnetResult<String>
    where
        F: FnMut(&LNet, ProcCursor) -> LnetResult<(String, ProcCursor)>,
    {
        let mut attempt = 0;
        'restart: loop {
            let mut text = String::new();
            let mut cursor = ProcCursor::START;
            loop {
                match read(self, cursor) {
                    Ok((row, _)) if row.is_empty() => return Ok(text),
                    Ok((row, next)) => {
                        text += &row;
                        cursor = next;
                    }
                    Err(LnetError::Stale) if attempt < retries => {
                        attempt += 1;
                        log::debug!("Table changed while reading, restarting");
                        continue 'restart;
                    }
                    Err(e) => return Err(e),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cursor_fields() {
        assert_eq!(NUM_BITS, 22);
        let c = ProcCursor::make(3, 0x1_2345, 502, 17);
        assert_eq!(c.cpt(), 3);
        // Only the low bits of the version fit.
        assert_eq!(c.version(), 0x2345);
        assert_eq!(c.idx(), 502);
        assert_eq!(c.num(), 17);
        assert!(!c.is_start());
        assert_eq!(ProcCursor::from_raw(c.raw()), c);
        // The sign bit stays clear.
        assert_eq!(ProcCursor::make(CPT_MASK as usize, VER_MASK, 511, NUM_MASK as usize).raw() >> 63, 0);
    }

    #[test]
    fn test_void_cursor() {
        assert!(!ProcCursor::START.is_void());
        assert!(ProcCursor::from_raw(1 << 62).is_void());
        assert!(ProcCursor::make(0, 3, 7, 0).is_void());
        assert!(!ProcCursor::make(0, 0, 0, 1).is_void());
    }

    #[test]
    fn test_ver_valid_wraps() {
        assert_eq!(ver_valid(VER_MASK + 1), 0);
        assert_eq!(ver_valid(7), 7);
    }
}
