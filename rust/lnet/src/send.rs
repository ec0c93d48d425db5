// Copyright (c) Meta Platforms, Inc. and affiliates.
//
// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! # Credit flow control
//!
//! An outgoing message needs a send credit of its next hop peer and one of
//! its NI's partition queue. A message being forwarded additionally needs a
//! router buffer credit of the peer it came from and a buffer from a router
//! pool before its payload can be received. Whenever a credit is missing
//! the message is queued, oldest first, and posted again when a credit is
//! returned.
//!
//! For every credit counter `credits < 0` exactly when its queue is not
//! empty, and `-credits` is the queue length.

use crate::api::LNet;
use crate::error::LnetError;
use crate::md::Payload;
use crate::msg::commit;
use crate::msg::Deferred;
use crate::msg::Msg;
use crate::net::NetPart;
use crate::ni::RecvArgs;
use crate::router::find_route_locked;
use crate::router::pool_of_len;
use crate::types::Nid;
use crate::types::HDR_SIZE;
use crate::types::LUSTRE_SRV_PID;
use crate::types::PID_USERFLAG;
use cfs_utils::LockSel;
use std::sync::Arc;

/// Outcome of asking for credits.
pub(crate) enum Posted {
    /// Every credit is held; the message can go.
    Ready(Box<Msg>),
    /// Parked on a credit queue.
    Queued,
    /// The next hop is dead, or routing went away.
    Dropped(Box<Msg>),
}

impl LNet {
    /// Take the peer and NI send credits `msg` still lacks.
    pub(crate) fn post_send_locked(&self, part: &mut NetPart, mut msg: Box<Msg>) -> Posted {
        let ni = match &msg.txni {
            Some(ni) => ni.clone(),
            None => panic!("posting {} without an NI", msg.hdr),
        };
        assert_eq!(msg.tx_cpt, part.cpt);

        if let Some(pref) = &msg.txpeer {
            let nid = pref.nid();
            // Users can ask for traffic to go out regardless.
            if msg.target.pid & PID_USERFLAG == 0 && !self.peer_alive_locked(part, nid) {
                part.counters.drop_msg(msg.len);
                log::warn!("Dropping message for {}: peer not alive", msg.target);
                return Posted::Dropped(msg);
            }

            if !msg.peertxcredit {
                let lp = part.peers.get_mut(pref);
                assert_eq!(lp.txcredits < 0, !lp.txq.is_empty());
                msg.peertxcredit = true;
                lp.txqnob += (msg.len + HDR_SIZE) as u64;
                lp.txcredits -= 1;
                lp.mintxcredits = lp.mintxcredits.min(lp.txcredits);
                lp.sync_gw();
                if lp.txcredits < 0 {
                    msg.delayed = true;
                    lp.txq.push_back(msg);
                    return Posted::Queued;
                }
            }
        }

        if !msg.txcredit {
            let tq = &mut part.ni_tx[ni.idx];
            assert_eq!(tq.credits < 0, !tq.txq.is_empty());
            msg.txcredit = true;
            tq.credits -= 1;
            tq.mincredits = tq.mincredits.min(tq.credits);
            if tq.credits < 0 {
                msg.delayed = true;
                tq.txq.push_back(msg);
                return Posted::Queued;
            }
        }

        Posted::Ready(msg)
    }

    /// Post a message that was waiting for a send credit.
    fn resume_send_locked(&self, part: &mut NetPart, msg: Box<Msg>, work: &mut Vec<Deferred>) {
        assert!(msg.delayed);
        match self.post_send_locked(part, msg) {
            Posted::Ready(msg) => work.push(Deferred::Send(msg)),
            Posted::Queued => {}
            Posted::Dropped(msg) => {
                work.push(Deferred::Finalize(msg, Err(LnetError::HostUnreachable)))
            }
        }
    }

    /// Take the router credits and the buffer a message being forwarded
    /// needs before its payload can be received.
    pub(crate) fn post_routed_recv_locked(&self, part: &mut NetPart, mut msg: Box<Msg>) -> Posted {
        assert!(msg.routing && msg.receiving && !msg.sending);
        assert!(!msg.target_is_router);
        assert_eq!(msg.rx_cpt, part.cpt);

        if !self.is_routing() || part.rtrpools.is_empty() {
            return Posted::Dropped(msg);
        }

        if !msg.peerrtrcredit {
            let pref = match &msg.rxpeer {
                Some(pref) => pref,
                None => panic!("routed message {} without a sender", msg.hdr),
            };
            let lp = part.peers.get_mut(pref);
            assert_eq!(lp.rtrcredits < 0, !lp.rtrq.is_empty());
            msg.peerrtrcredit = true;
            lp.rtrcredits -= 1;
            lp.minrtrcredits = lp.minrtrcredits.min(lp.rtrcredits);
            if lp.rtrcredits < 0 {
                msg.delayed = true;
                lp.rtrq.push_back(msg);
                return Posted::Queued;
            }
        }

        let pool = &mut part.rtrpools[pool_of_len(msg.len)];
        if !msg.rtrcredit {
            msg.rtrcredit = true;
            if !pool.take_credit() {
                msg.delayed = true;
                pool.msgs.push_back(msg);
                return Posted::Queued;
            }
        }

        let buf = pool.take();
        msg.payload = Payload::new(vec![buf.data.clone()], 0, msg.len);
        msg.rtrbuf = Some(buf);
        Posted::Ready(msg)
    }

    pub(crate) fn resume_routed_recv_locked(
        &self,
        part: &mut NetPart,
        msg: Box<Msg>,
        work: &mut Vec<Deferred>,
    ) {
        match self.post_routed_recv_locked(part, msg) {
            Posted::Ready(msg) => {
                let len = msg.len;
                work.push(Deferred::Recv {
                    msg,
                    args: RecvArgs {
                        delayed: true,
                        offset: 0,
                        mlen: len,
                        rlen: len,
                    },
                });
            }
            Posted::Queued => {}
            Posted::Dropped(msg) => work.push(Deferred::Drop(msg, Err(LnetError::Canceled))),
        }
    }

    /// Give back the send credits of `msg` and its next hop reference,
    /// posting whoever was waiting for them. `part` is the partition the
    /// message was sent from.
    pub(crate) fn return_tx_credits_locked(
        &self,
        part: &mut NetPart,
        msg: &mut Msg,
        work: &mut Vec<Deferred>,
    ) {
        if msg.txcredit {
            msg.txcredit = false;
            let ni = match &msg.txni {
                Some(ni) => ni.clone(),
                None => panic!("send credit held without an NI"),
            };
            let tq = &mut part.ni_tx[ni.idx];
            assert_eq!(tq.credits < 0, !tq.txq.is_empty());
            tq.credits += 1;
            if tq.credits <= 0 {
                if let Some(msg2) = tq.txq.pop_front() {
                    self.resume_send_locked(part, msg2, work);
                }
            }
        }

        if msg.peertxcredit {
            msg.peertxcredit = false;
            let pref = match &msg.txpeer {
                Some(pref) => pref,
                None => panic!("peer credit held without a peer"),
            };
            let lp = part.peers.get_mut(pref);
            assert_eq!(lp.txcredits < 0, !lp.txq.is_empty());
            let nob = (msg.len + HDR_SIZE) as u64;
            assert!(lp.txqnob >= nob, "peer {} queued bytes underflow", lp.nid);
            lp.txqnob -= nob;
            lp.txcredits += 1;
            lp.sync_gw();
            if lp.txcredits <= 0 {
                if let Some(msg2) = lp.txq.pop_front() {
                    self.resume_send_locked(part, msg2, work);
                }
            }
        }

        if let Some(pref) = msg.txpeer.take() {
            part.peers.decref(pref);
        }
    }

    /// Give back the router buffer and credits of `msg` and drop its
    /// reference on the peer it came from.
    pub(crate) fn return_rx_credits_locked(
        &self,
        part: &mut NetPart,
        msg: &mut Msg,
        work: &mut Vec<Deferred>,
    ) {
        if msg.rtrcredit {
            msg.rtrcredit = false;
            let buf = match msg.rtrbuf.take() {
                Some(buf) => buf,
                None => panic!("router credit held without a buffer"),
            };
            msg.payload = Payload::default();
            assert_eq!(buf.pool, pool_of_len(msg.len));
            if let Some(msg2) = part.rtrpools[buf.pool].put_back(buf) {
                self.resume_routed_recv_locked(part, msg2, work);
            }
        }

        if msg.peerrtrcredit {
            msg.peerrtrcredit = false;
            if let Some(pref) = &msg.rxpeer {
                let lp = part.peers.get_mut(pref);
                assert_eq!(lp.rtrcredits < 0, !lp.rtrq.is_empty());
                lp.rtrcredits += 1;
                if lp.rtrcredits <= 0 {
                    if let Some(msg2) = lp.rtrq.pop_front() {
                        self.resume_routed_recv_locked(part, msg2, work);
                    }
                }
            }
        }

        if let Some(pref) = msg.rxpeer.take() {
            part.peers.decref(pref);
        }
    }

    /// Send `msg` from `src_nid` (ANY to let LNet pick) to its target,
    /// through a router if the target is on a remote network.
    ///
    /// On failure the message is handed back, possibly committed, for the
    /// caller to finalize.
    pub(crate) fn send(&self, src_nid: Nid, mut msg: Box<Msg>) -> Result<(), (LnetError, Box<Msg>)> {
        let dst_nid = msg.target.nid;
        if dst_nid.is_any() {
            return Err((LnetError::Invalid, msg));
        }
        assert!(msg.txpeer.is_none() && !msg.sending);
        assert!(!msg.target_is_router && !msg.receiving);
        assert!(!msg.tx_committed);
        msg.sending = true;

        let mut rtr_nid: Option<Nid> = None;
        let mut cpt = self.cpt_of_nid(dst_nid);
        loop {
            let mut guard = self.net.lock(LockSel::Cpt(cpt));
            if self.is_shutdown() {
                return Err((LnetError::Shutdown, msg));
            }
            let (shared, part) = guard.split_mut();

            let mut src_ni = None;
            if !src_nid.is_any() {
                match shared.nid2ni(src_nid) {
                    Some(ni) => src_ni = Some(ni.clone()),
                    None => {
                        log::warn!(
                            "Can't send to {}: src {} is not a local nid",
                            dst_nid,
                            src_nid
                        );
                        return Err((LnetError::Invalid, msg));
                    }
                }
                assert!(!msg.routing);
            }

            let pref;
            let txni;
            if let Some(local_ni) = shared.net2ni(dst_nid.net()) {
                if src_ni.map_or(false, |ni| !Arc::ptr_eq(&ni, local_ni)) {
                    log::warn!("No route to {} via from {}", dst_nid, src_nid);
                    return Err((LnetError::Invalid, msg));
                }
                txni = local_ni.clone();

                if !msg.tx_committed {
                    commit(part, &mut msg);
                }
                if !msg.routing {
                    msg.hdr.src_nid = txni.nid;
                }

                if txni.is_loopback() {
                    // No credits on the loopback.
                    msg.txni = Some(txni);
                    drop(guard);
                    self.ni_send(msg);
                    return Ok(());
                }

                pref = match self.nid2peer_locked(shared, part, dst_nid) {
                    Ok(pref) => pref,
                    Err(e) => {
                        log::warn!("Error {} finding peer {}", e.errno(), dst_nid);
                        return Err((e, msg));
                    }
                };
            } else {
                let route = match find_route_locked(shared, src_ni.as_ref(), dst_nid, rtr_nid) {
                    Some(route) => route,
                    None => {
                        log::warn!(
                            "No route to {} via {} (all routers down)",
                            msg.target,
                            src_nid
                        );
                        return Err((LnetError::HostUnreachable, msg));
                    }
                };

                // The gateway's credits live in its own partition.
                if route.peer.cpt() != cpt {
                    rtr_nid = Some(route.gateway);
                    cpt = route.peer.cpt();
                    continue;
                }

                log::debug!(
                    "Best route to {} via {} for {} {}",
                    dst_nid,
                    route.gateway,
                    msg.hdr,
                    msg.len
                );
                pref = part.peers.addref_of(&route.peer);
                txni = route.ni.clone();

                if !msg.tx_committed {
                    commit(part, &mut msg);
                }
                if !msg.routing {
                    msg.hdr.src_nid = txni.nid;
                }
                msg.target_is_router = true;
                msg.target.nid = route.gateway;
                msg.target.pid = LUSTRE_SRV_PID;
            }

            assert!(!msg.peertxcredit && !msg.txcredit);
            msg.txpeer = Some(pref);
            msg.txni = Some(txni);

            let posted = self.post_send_locked(part, msg);
            drop(guard);
            return match posted {
                Posted::Ready(msg) => {
                    self.ni_send(msg);
                    Ok(())
                }
                Posted::Queued => Ok(()),
                Posted::Dropped(msg) => Err((LnetError::HostUnreachable, msg)),
            };
        }
    }
}
