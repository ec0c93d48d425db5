// Copyright (c) Meta Platforms, Inc. and affiliates.
//
// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! # Incoming messages and the active operations
//!
//! `parse()` is where an LND hands over every message it receives. Once a
//! header passes the sanity checks the LND is always called back, to land
//! the payload or to discard it. A message for this node is matched against
//! the portals (PUT, GET) or against the MD named in its header (ACK,
//! REPLY); a message for another node is forwarded once it has its router
//! credits and a buffer.
//!
//! A PUT that matches nothing on a lazy portal waits on the portal until an
//! MD shows up or the portal stops being lazy.

use crate::api::LNet;
use crate::eq::EventKind;
use crate::error::LnetError;
use crate::error::LnetResult;
use crate::error::Status;
use crate::handle::cpt_of_cookie;
use crate::handle::CookieType;
use crate::handle::MdHandle;
use crate::md::MD_ACK_DISABLE;
use crate::md::MD_TRUNCATE;
use crate::msg::commit;
use crate::msg::Msg;
use crate::msg::Private;
use crate::net::NetPart;
use crate::net::TestPeer;
use crate::ni::Ni;
use crate::ni::RecvArgs;
use crate::res::MatchInfo;
use crate::res::MatchResult;
use crate::router::pool_of_len;
use crate::send::Posted;
use crate::types::Hdr;
use crate::types::HdrBody;
use crate::types::MsgType;
use crate::types::Nid;
use crate::types::ProcessId;
use crate::types::WireHandle;
use crate::types::LOLND;
use crate::types::MAX_PAYLOAD;
use crate::types::MTU;
use cfs_utils::LockSel;
use std::sync::Arc;

/// Whether the target of a PUT should acknowledge it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckReq {
    Ack,
    NoAck,
}

/// How far away a NID is, see `LNet::dist()`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Distance {
    /// 0 for one of our own NIDs, 1 for a local network, hops + 1 beyond.
    pub hops: u32,
    /// NID traffic to the destination goes out of.
    pub src_nid: Nid,
    /// Position of the network in the local then remote net lists.
    pub order: u32,
}

/// Threshold of a simulated failure that never wears off.
pub const FAIL_THRESH_INF: u32 = u32::MAX;

impl LNet {
    /// Handle a message received by `ni` from `from`, the last hop.
    ///
    /// Malformed headers are refused with `Proto` and `private` is handed
    /// back. Any other outcome, drops included, goes through the LND's
    /// `recv()`.
    pub fn parse(
        &self,
        ni: &Arc<Ni>,
        hdr: Hdr,
        from: Nid,
        private: Private,
        rdma_req: bool,
    ) -> Result<(), (LnetError, Private)> {
        let msg_type = hdr.msg_type();
        let src_nid = hdr.src_nid;
        let payload_length = hdr.payload_length;
        let for_me = ni.nid == hdr.dest_nid;
        let cpt = self.cpt_of_nid(from);

        match msg_type {
            MsgType::Ack | MsgType::Get => {
                if payload_length > 0 {
                    log::error!(
                        "{}, src {}: bad {} payload {} (0 expected)",
                        from,
                        src_nid,
                        msg_type,
                        payload_length
                    );
                    return Err((LnetError::Proto, private));
                }
            }
            MsgType::Put | MsgType::Reply => {
                let max = if for_me { MAX_PAYLOAD } else { MTU };
                if payload_length > max {
                    log::error!(
                        "{}, src {}: bad {} payload {} ({} max expected)",
                        from,
                        src_nid,
                        msg_type,
                        payload_length,
                        max
                    );
                    return Err((LnetError::Proto, private));
                }
            }
        }

        if self.is_routing() {
            ni.touch(self.now());
        }

        if !for_me {
            let dest_nid = hdr.dest_nid;
            if dest_nid.net() == ni.nid.net() {
                log::error!(
                    "{}, src {}: Bad dest nid {} (should have been sent direct)",
                    from,
                    src_nid,
                    dest_nid
                );
                return Err((LnetError::Proto, private));
            }
            if self.net.read(LockSel::Current).shared().is_local_nid(dest_nid) {
                log::error!(
                    "{}, src {}: Bad dest nid {} (it's my nid but on a different network)",
                    from,
                    src_nid,
                    dest_nid
                );
                return Err((LnetError::Proto, private));
            }
            if rdma_req && msg_type == MsgType::Get {
                log::error!(
                    "{}, src {}: Bad optimized GET for {} (final destination must be me)",
                    from,
                    src_nid,
                    dest_nid
                );
                return Err((LnetError::Proto, private));
            }
            if !self.is_routing() {
                log::error!(
                    "{}, src {}: Dropping message for {} (routing not enabled)",
                    from,
                    src_nid,
                    dest_nid
                );
                self.drop_message(ni, cpt, Some(private), payload_length);
                return Ok(());
            }
        }

        if self.fail_peer(src_nid, false) {
            log::error!(
                "{}, src {}: Dropping {} to simulate failure",
                from,
                src_nid,
                msg_type
            );
            self.drop_message(ni, cpt, Some(private), payload_length);
            return Ok(());
        }

        let mut msg = match self.msg_alloc() {
            Some(msg) => msg,
            None => {
                log::error!(
                    "{}, src {}: Dropping {} (out of memory)",
                    from,
                    src_nid,
                    msg_type
                );
                self.drop_message(ni, cpt, Some(private), payload_length);
                return Ok(());
            }
        };
        msg.msg_type = msg_type;
        msg.private = Some(private);
        msg.receiving = true;
        msg.len = payload_length;
        msg.wanted = payload_length;
        msg.offset = 0;
        msg.hdr = hdr;
        msg.from = from;
        msg.rxni = Some(ni.clone());
        if !for_me {
            msg.target = hdr.dest();
            msg.routing = true;
        }

        let mut notify = false;
        let mut guard = self.net.lock(LockSel::Cpt(cpt));
        let (shared, part) = guard.split_mut();
        let pref = match self.nid2peer_locked(shared, part, from) {
            Ok(pref) => pref,
            Err(e) => {
                drop(guard);
                log::error!(
                    "{}, src {}: Dropping {} (error {} looking up sender)",
                    from,
                    src_nid,
                    msg_type,
                    e.errno()
                );
                let private = msg.private.take();
                self.msg_free(msg);
                self.drop_message(ni, cpt, private, payload_length);
                return Ok(());
            }
        };

        let now = self.now();
        let lp = part.peers.get_mut(&pref);
        if lp.is_router() {
            lp.last_alive = now;
            lp.last_query = now;
            if !lp.alive {
                lp.notify_locked(false, true, now);
                notify = true;
            }
        }
        msg.rxpeer = Some(pref);

        if !for_me {
            commit(part, &mut msg);
            let posted = self.parse_forward_locked(ni, part, msg);
            drop(guard);
            if notify {
                self.ni_notify(from);
            }
            match posted {
                Ok(Posted::Ready(mut msg)) => {
                    let private = msg.private.take();
                    self.ni_recv(
                        ni,
                        private,
                        Some(msg),
                        RecvArgs {
                            delayed: false,
                            offset: 0,
                            mlen: payload_length,
                            rlen: payload_length,
                        },
                    );
                }
                Ok(Posted::Queued) => {}
                Ok(Posted::Dropped(msg)) => {
                    self.free_drop(ni, cpt, msg, Err(LnetError::Canceled))
                }
                Err((e, msg)) => self.free_drop(ni, cpt, msg, Err(e)),
            }
            return Ok(());
        }
        drop(guard);
        if notify {
            self.ni_notify(from);
        }

        let rc = match msg_type {
            MsgType::Ack => self.parse_ack(ni, msg),
            MsgType::Put => self.parse_put(ni, msg),
            MsgType::Get => self.parse_get(ni, msg, rdma_req),
            MsgType::Reply => self.parse_reply(ni, msg),
        };
        if let Err(msg) = rc {
            self.free_drop(ni, cpt, msg, Err(LnetError::NotFound));
        }
        Ok(())
    }

    /// Finalize a message that was refused and tell the LND to discard
    /// its payload.
    fn free_drop(&self, ni: &Arc<Ni>, cpt: usize, mut msg: Box<Msg>, status: Status) {
        assert!(msg.md.is_none());
        let private = msg.private.take();
        let len = msg.len;
        self.finalize(msg, status);
        self.drop_message(ni, cpt, private, len);
    }

    /// Count a dropped message and have the LND discard it.
    pub(crate) fn drop_message(&self, ni: &Arc<Ni>, cpt: usize, private: Option<Private>, nob: u32) {
        self.net.lock(LockSel::Cpt(cpt)).counters.drop_msg(nob);
        self.ni_recv(
            ni,
            private,
            None,
            RecvArgs {
                delayed: false,
                offset: 0,
                mlen: 0,
                rlen: nob,
            },
        );
    }

    fn parse_forward_locked(
        &self,
        ni: &Arc<Ni>,
        part: &mut NetPart,
        mut msg: Box<Msg>,
    ) -> Result<Posted, (LnetError, Box<Msg>)> {
        let pref = match &msg.rxpeer {
            Some(pref) => pref,
            None => panic!("forwarding {} without a sender", msg.hdr),
        };
        // The payload may have to wait; let the LND stash it.
        let short = part.peers.get(pref).rtrcredits <= 0
            || part
                .rtrpools
                .get(pool_of_len(msg.len))
                .map_or(false, |pool| pool.credits <= 0);
        if short {
            if let Err(e) = ni.lnd.eager_recv(ni, &mut msg) {
                return Err((e, msg));
            }
        }
        Ok(self.post_routed_recv_locked(part, msg))
    }

    fn commit_rx(&self, msg: &mut Msg) {
        let cpt = match &msg.rxpeer {
            Some(pref) => pref.cpt(),
            None => self.cpt_of_nid(msg.from),
        };
        let mut part = self.net.lock(LockSel::Cpt(cpt));
        commit(&mut part, msg);
    }

    /// Resolve a wire handle naming one of our MDs to its partition.
    fn wire_md_cpt(&self, wmd: &WireHandle) -> Option<usize> {
        if wmd.interface_cookie != self.interface_cookie {
            return None;
        }
        self.res_cpt_of(wmd.object_cookie, CookieType::Md).ok()
    }

    fn parse_put(&self, ni: &Arc<Ni>, mut msg: Box<Msg>) -> Result<(), Box<Msg>> {
        let info = match MatchInfo::of(&msg.hdr) {
            Some(info) => info,
            None => panic!("parsing {} as a PUT", msg.hdr),
        };

        let rc = {
            let mut res = self.res.lock(LockSel::Cpt(self.match_cpt()));
            match res.match_md(&info, &mut msg) {
                MatchResult::None => match ni.lnd.eager_recv(ni, &mut msg) {
                    Ok(()) => {
                        log::debug!(
                            "Delaying PUT from {} portal {} match {} offset {} length {}",
                            info.id,
                            info.portal,
                            info.mbits,
                            info.roffset,
                            info.rlength
                        );
                        msg.delayed = true;
                        res.portals[info.portal].delayed.push_back(msg);
                        return Ok(());
                    }
                    Err(e) => {
                        log::debug!("Can't delay PUT from {}: {}", info.id, e);
                        MatchResult::Drop
                    }
                },
                rc => rc,
            }
        };

        if rc == MatchResult::Ok {
            self.recv_put(ni, msg);
            return Ok(());
        }
        log::warn!(
            "Dropping PUT from {} portal {} match {} offset {} length {}",
            info.id,
            info.portal,
            info.mbits,
            info.roffset,
            info.rlength
        );
        Err(msg)
    }

    /// Land a matched PUT, asking for an ACK if the sender wants one and
    /// the MD allows it.
    fn recv_put(&self, ni: &Arc<Ni>, mut msg: Box<Msg>) {
        msg.build_event(EventKind::Put, self.pid);
        self.commit_rx(&mut msg);

        let ack_wmd = match msg.hdr.body {
            HdrBody::Put { ack_wmd, .. } => ack_wmd,
            body => panic!("receiving {:?} as a PUT", body),
        };
        msg.ack = !ack_wmd.is_none() && msg.ev.md.options & MD_ACK_DISABLE == 0;

        let args = RecvArgs {
            delayed: msg.delayed,
            offset: msg.offset,
            mlen: msg.wanted,
            rlen: msg.len,
        };
        let private = msg.private.take();
        self.ni_recv(ni, private, Some(msg), args);
    }

    /// Land a PUT that waited on a lazy portal and just got an MD.
    pub(crate) fn recv_delayed_put(&self, msg: Box<Msg>) {
        let ni = match &msg.rxni {
            Some(ni) => ni.clone(),
            None => panic!("delayed {} without an NI", msg.hdr),
        };
        self.recv_put(&ni, msg);
    }

    pub(crate) fn drop_delayed_puts(&self, msgs: Vec<Box<Msg>>, reason: &str) {
        for mut msg in msgs {
            assert!(msg.md.is_none() && msg.delayed);
            assert_eq!(msg.msg_type, MsgType::Put);
            if let Some(info) = MatchInfo::of(&msg.hdr) {
                log::warn!(
                    "Dropping delayed PUT from {} portal {} match {} offset {} length {}: {}",
                    info.id,
                    info.portal,
                    info.mbits,
                    info.roffset,
                    info.rlength,
                    reason
                );
            }
            let ni = match &msg.rxni {
                Some(ni) => ni.clone(),
                None => panic!("delayed {} without an NI", msg.hdr),
            };
            let cpt = self.cpt_of_nid(msg.from);
            let private = msg.private.take();
            let len = msg.len;
            self.drop_message(&ni, cpt, private, len);
            self.finalize(msg, Err(LnetError::NotFound));
        }
    }

    fn parse_get(&self, ni: &Arc<Ni>, mut msg: Box<Msg>, rdma_get: bool) -> Result<(), Box<Msg>> {
        let info = match MatchInfo::of(&msg.hdr) {
            Some(info) => info,
            None => panic!("parsing {} as a GET", msg.hdr),
        };

        let rc = self
            .res
            .lock(LockSel::Cpt(self.match_cpt()))
            .match_md(&info, &mut msg);
        if rc != MatchResult::Ok {
            log::warn!(
                "Dropping GET from {} portal {} match {} offset {} length {}",
                info.id,
                info.portal,
                info.mbits,
                info.roffset,
                info.rlength
            );
            return Err(msg);
        }

        msg.build_event(EventKind::Get, self.pid);
        self.commit_rx(&mut msg);

        let reply_wmd = match msg.hdr.body {
            HdrBody::Get { return_wmd, .. } => return_wmd,
            body => panic!("serving {:?} as a GET", body),
        };
        let offset = msg.offset;
        let wanted = msg.wanted;
        msg.prep_send(
            HdrBody::Reply { dst_wmd: reply_wmd },
            info.id,
            self.pid,
            offset,
            wanted,
        );

        if rdma_get {
            // The LND completes the REPLY from its receive.
            let private = msg.private.take();
            self.ni_recv(
                ni,
                private,
                Some(msg),
                RecvArgs {
                    delayed: false,
                    offset,
                    mlen: wanted,
                    rlen: wanted,
                },
            );
            return Ok(());
        }

        let private = msg.private.take();
        self.ni_recv(ni, private, None, RecvArgs::default());
        msg.receiving = false;

        if let Err((e, msg)) = self.send(ni.nid, msg) {
            log::error!(
                "{}: Unable to send REPLY for GET from {}: {}",
                ni.nid,
                info.id,
                e
            );
            self.finalize(msg, Err(e));
        }
        Ok(())
    }

    fn parse_reply(&self, ni: &Arc<Ni>, mut msg: Box<Msg>) -> Result<(), Box<Msg>> {
        let dst_wmd = match msg.hdr.body {
            HdrBody::Reply { dst_wmd } => dst_wmd,
            body => panic!("parsing {:?} as a REPLY", body),
        };
        let src = msg.hdr.src();
        let rlength = msg.hdr.payload_length;
        let cookie = dst_wmd.object_cookie;

        let cpt = match self.wire_md_cpt(&dst_wmd) {
            Some(cpt) => cpt,
            None => {
                log::warn!(
                    "{}: Dropping REPLY from {} for invalid MD {:#x}.{:#x}",
                    ni.nid,
                    src,
                    dst_wmd.interface_cookie,
                    cookie
                );
                return Err(msg);
            }
        };

        let mlength;
        {
            let mut res = self.res.lock(LockSel::Cpt(cpt));
            let md = match res.mds.lookup_mut(cookie) {
                Some(md) if md.threshold != 0 && md.me.is_none() => md,
                other => {
                    log::warn!(
                        "{}: Dropping REPLY from {} for {} MD {:#x}.{:#x}",
                        ni.nid,
                        src,
                        if other.is_none() { "invalid" } else { "inactive" },
                        dst_wmd.interface_cookie,
                        cookie
                    );
                    if other.map_or(false, |md| md.me.is_some()) {
                        log::error!("REPLY MD also attached to a portal");
                    }
                    return Err(msg);
                }
            };

            assert_eq!(md.offset, 0, "active MD with an offset");
            mlength = rlength.min(md.length);
            if mlength < rlength && md.options & MD_TRUNCATE == 0 {
                log::warn!(
                    "{}: Dropping REPLY from {} length {} for MD {:#x} would overflow ({})",
                    ni.nid,
                    src,
                    rlength,
                    cookie,
                    mlength
                );
                return Err(msg);
            }

            log::debug!(
                "{}: Reply from {} of length {}/{} into md {:#x}",
                ni.nid,
                src,
                mlength,
                rlength,
                cookie
            );
            msg.attach_md(cookie, md, 0, mlength);
        }

        msg.build_event(EventKind::Reply, self.pid);
        self.commit_rx(&mut msg);
        let private = msg.private.take();
        self.ni_recv(
            ni,
            private,
            Some(msg),
            RecvArgs {
                delayed: false,
                offset: 0,
                mlen: mlength,
                rlen: rlength,
            },
        );
        Ok(())
    }

    fn parse_ack(&self, ni: &Arc<Ni>, mut msg: Box<Msg>) -> Result<(), Box<Msg>> {
        let dst_wmd = match msg.hdr.body {
            HdrBody::Ack { dst_wmd, .. } => dst_wmd,
            body => panic!("parsing {:?} as an ACK", body),
        };
        let src = msg.hdr.src();
        let cookie = dst_wmd.object_cookie;

        // An ACK for an MD that went away is expected; no moaning.
        let cpt = match self.wire_md_cpt(&dst_wmd) {
            Some(cpt) => cpt,
            None => {
                log::debug!(
                    "{}: Dropping ACK from {} to invalid MD {:#x}.{:#x}",
                    ni.nid,
                    src,
                    dst_wmd.interface_cookie,
                    cookie
                );
                return Err(msg);
            }
        };

        {
            let mut res = self.res.lock(LockSel::Cpt(cpt));
            let md = match res.mds.lookup_mut(cookie) {
                Some(md) if md.threshold != 0 && md.me.is_none() => md,
                other => {
                    log::debug!(
                        "{}: Dropping ACK from {} to {} MD {:#x}.{:#x}",
                        ni.nid,
                        src,
                        if other.is_none() { "invalid" } else { "inactive" },
                        dst_wmd.interface_cookie,
                        cookie
                    );
                    if other.map_or(false, |md| md.me.is_some()) {
                        log::error!("Source MD also attached to a portal");
                    }
                    return Err(msg);
                }
            };
            log::debug!("{}: ACK from {} into md {:#x}", ni.nid, src, cookie);
            msg.attach_md(cookie, md, 0, 0);
        }

        msg.build_event(EventKind::Ack, self.pid);
        self.commit_rx(&mut msg);
        let private = msg.private.take();
        let len = msg.len;
        self.ni_recv(
            ni,
            private,
            Some(msg),
            RecvArgs {
                delayed: false,
                offset: 0,
                mlen: 0,
                rlen: len,
            },
        );
        Ok(())
    }

    /// Build the message an LND completes the REPLY of an optimized GET
    /// into. `getmsg` is the GET being sent and still holds its MD.
    pub fn create_reply_msg(&self, ni: &Arc<Ni>, getmsg: &Msg) -> Option<Box<Msg>> {
        assert!(!getmsg.target_is_router && !getmsg.routing);
        let peer_id = getmsg.target;
        let cookie = match getmsg.md {
            Some(cookie) => cookie,
            None => panic!("optimized GET to {} without an MD", peer_id),
        };
        let msg = self.msg_alloc();

        let mut res = self.res.lock(LockSel::Cpt(cpt_of_cookie(cookie)));
        let getmd = match res.mds.get_mut(cookie) {
            Some(md) => md,
            None => panic!("GET to {} holds a freed MD", peer_id),
        };
        assert!(getmd.refcount > 0);
        let length = getmd.length;

        let mut msg = match msg {
            Some(msg) if getmd.threshold != 0 => msg,
            msg => {
                match &msg {
                    None => log::error!(
                        "{}: Dropping REPLY from {}: can't allocate msg",
                        ni.nid,
                        peer_id
                    ),
                    Some(_) => log::error!(
                        "{}: Dropping REPLY from {} for inactive MD {:#x}",
                        ni.nid,
                        peer_id,
                        cookie
                    ),
                }
                drop(res);
                if let Some(msg) = msg {
                    self.msg_free(msg);
                }
                self.count_drop(peer_id.nid, length);
                return None;
            }
        };

        assert_eq!(getmd.offset, 0);
        log::debug!("{}: Reply from {} md {:#x}", ni.nid, peer_id, cookie);
        msg.from = peer_id.nid;
        // Flags the message as an optimized GET.
        msg.msg_type = MsgType::Get;
        msg.hdr.src_nid = peer_id.nid;
        msg.hdr.payload_length = length;
        msg.receiving = true;
        msg.attach_md(cookie, getmd, 0, length);
        drop(res);

        msg.build_event(EventKind::Reply, self.pid);
        let mut part = self.net.lock(LockSel::Cpt(self.cpt_of_nid(peer_id.nid)));
        commit(&mut part, &mut msg);
        drop(part);
        Some(msg)
    }

    fn count_drop(&self, nid: Nid, nob: u32) {
        self.net
            .lock(LockSel::Cpt(self.cpt_of_nid(nid)))
            .counters
            .drop_msg(nob);
    }

    /// Set the length of an optimized GET's REPLY once the RDMA that
    /// replaced it is done.
    pub fn set_reply_msg_len(&self, reply: &mut Msg, len: u32) {
        assert_eq!(reply.msg_type, MsgType::Get);
        assert_eq!(reply.ev.kind, EventKind::Reply);
        assert!(len <= reply.ev.mlength, "REPLY longer than the GET asked");
        reply.ev.mlength = len;
    }

    /// Send the memory of `mdh` to portal `portal` of `target`.
    ///
    /// Completion, and the ACK if one was requested, are reported as
    /// events on the MD's queue; only failures to get started are returned.
    #[allow(clippy::too_many_arguments)]
    pub fn put(
        &self,
        src_nid: Nid,
        mdh: MdHandle,
        ack: AckReq,
        target: ProcessId,
        portal: u32,
        match_bits: u64,
        offset: u32,
        hdr_data: u64,
    ) -> LnetResult<()> {
        if self.fail_peer(target.nid, true) {
            log::error!("Dropping PUT to {}: simulated failure", target);
            return Err(LnetError::Io);
        }
        let mut msg = match self.msg_alloc() {
            Some(msg) => msg,
            None => {
                log::error!("Dropping PUT to {}: ENOMEM on lnet_msg_t", target);
                return Err(LnetError::NoMem);
            }
        };

        let cookie = mdh.cookie();
        let cpt = match self.res_cpt_of(cookie, CookieType::Md) {
            Ok(cpt) => cpt,
            Err(e) => {
                self.msg_free(msg);
                return Err(e);
            }
        };
        {
            let mut res = self.res.lock(LockSel::Cpt(cpt));
            let md = match res.mds.lookup_mut(cookie) {
                Some(md) if md.threshold != 0 && md.me.is_none() => md,
                other => {
                    log::error!(
                        "Dropping PUT ({}:{}:{}): MD ({}) invalid",
                        match_bits,
                        portal,
                        target,
                        other.as_ref().map_or(-1, |md| md.threshold)
                    );
                    drop(res);
                    self.msg_free(msg);
                    return Err(LnetError::NotFound);
                }
            };
            log::debug!("LNetPut -> {}", target);

            msg.attach_md(cookie, md, 0, 0);
            let ack_wmd = match ack {
                AckReq::Ack => WireHandle {
                    interface_cookie: self.interface_cookie,
                    object_cookie: cookie,
                },
                AckReq::NoAck => WireHandle::NONE,
            };
            msg.prep_send(
                HdrBody::Put {
                    ack_wmd,
                    match_bits,
                    hdr_data,
                    ptl_index: portal,
                    offset,
                },
                target,
                self.pid,
                0,
                md.length,
            );
            msg.payload = md.payload(0, md.length);
        }

        msg.build_event(EventKind::Send, self.pid);
        if let Err((e, msg)) = self.send(src_nid, msg) {
            log::warn!("Error sending PUT to {}: {}", target, e.errno());
            self.finalize(msg, Err(e));
        }
        Ok(())
    }

    /// Fetch from portal `portal` of `target` into the memory of `mdh`.
    /// The MD needs a threshold of two: one for the send, one for the
    /// REPLY.
    pub fn get(
        &self,
        src_nid: Nid,
        mdh: MdHandle,
        target: ProcessId,
        portal: u32,
        match_bits: u64,
        offset: u32,
    ) -> LnetResult<()> {
        if self.fail_peer(target.nid, true) {
            log::error!("Dropping GET to {}: simulated failure", target);
            return Err(LnetError::Io);
        }
        let mut msg = match self.msg_alloc() {
            Some(msg) => msg,
            None => {
                log::error!("Dropping GET to {}: ENOMEM on lnet_msg_t", target);
                return Err(LnetError::NoMem);
            }
        };

        let cookie = mdh.cookie();
        let cpt = match self.res_cpt_of(cookie, CookieType::Md) {
            Ok(cpt) => cpt,
            Err(e) => {
                self.msg_free(msg);
                return Err(e);
            }
        };
        {
            let mut res = self.res.lock(LockSel::Cpt(cpt));
            let md = match res.mds.lookup_mut(cookie) {
                Some(md) if md.threshold != 0 && md.me.is_none() => md,
                other => {
                    log::error!(
                        "Dropping GET ({}:{}:{}): MD ({}) invalid",
                        match_bits,
                        portal,
                        target,
                        other.as_ref().map_or(-1, |md| md.threshold)
                    );
                    drop(res);
                    self.msg_free(msg);
                    return Err(LnetError::NotFound);
                }
            };
            log::debug!("LNetGet -> {}", target);

            msg.attach_md(cookie, md, 0, 0);
            msg.prep_send(
                HdrBody::Get {
                    return_wmd: WireHandle {
                        interface_cookie: self.interface_cookie,
                        object_cookie: cookie,
                    },
                    match_bits,
                    ptl_index: portal,
                    src_offset: offset,
                    sink_length: md.length,
                },
                target,
                self.pid,
                0,
                0,
            );
        }

        msg.build_event(EventKind::Send, self.pid);
        if let Err((e, msg)) = self.send(src_nid, msg) {
            log::warn!("Error sending GET to {}: {}", target, e.errno());
            self.finalize(msg, Err(e));
        }
        Ok(())
    }

    /// Distance to `dst`, and the NID traffic to it leaves from.
    pub fn dist(&self, dst: Nid) -> LnetResult<Distance> {
        let net = self.net.read(LockSel::Current);
        let shared = net.shared();
        let dstnet = dst.net();
        let mut order = 2;

        for ni in shared.nis.iter() {
            if ni.nid == dst {
                return Ok(Distance {
                    hops: 0,
                    src_nid: dst,
                    order: if dstnet.lnd_type() == LOLND { 0 } else { 1 },
                });
            }
            if ni.nid.net() == dstnet {
                return Ok(Distance {
                    hops: 1,
                    src_nid: ni.nid,
                    order,
                });
            }
            order += 1;
        }

        for (net, rnet) in shared.remote_nets.iter() {
            if *net == dstnet {
                let shortest = match rnet.routes.iter().min_by_key(|r| r.hops) {
                    Some(route) => route,
                    None => panic!("remote net {} without routes", net),
                };
                return Ok(Distance {
                    hops: shortest.hops + 1,
                    src_nid: shortest.ni.nid,
                    order,
                });
            }
            order += 1;
        }
        Err(LnetError::HostUnreachable)
    }

    /// Fail the next `threshold` messages to or from `nid` (`Nid::ANY` for
    /// everyone; `FAIL_THRESH_INF` until cleared). A zero threshold clears
    /// the matching rules.
    pub fn fail_nid(&self, nid: Nid, threshold: u32) {
        let mut part = self.net.lock(LockSel::Cpt(0));
        if threshold != 0 {
            part.test_peers.push(TestPeer { nid, threshold });
            return;
        }
        part.test_peers
            .retain(|tp| !(tp.threshold == 0 || nid.is_any() || tp.nid == nid));
    }

    /// Whether a message to (`outgoing`) or from `nid` should fail.
    pub(crate) fn fail_peer(&self, nid: Nid, outgoing: bool) -> bool {
        let mut part = self.net.lock(LockSel::Cpt(0));
        if part.test_peers.is_empty() {
            return false;
        }
        let mut fail = false;
        for tp in part.test_peers.iter_mut() {
            // Exhausted entries linger until an outgoing check culls them.
            if tp.threshold == 0 {
                continue;
            }
            if tp.nid.is_any() || tp.nid == nid {
                fail = true;
                if tp.threshold != FAIL_THRESH_INF {
                    tp.threshold -= 1;
                }
                break;
            }
        }
        if outgoing {
            part.test_peers.retain(|tp| tp.threshold != 0);
        }
        fail
    }

    /// Park PUTs that match nothing on `portal` instead of dropping them.
    pub fn set_lazy_portal(&self, portal: usize) -> LnetResult<()> {
        let mut res = self.res.lock(LockSel::Cpt(self.match_cpt()));
        match res.portals.get_mut(portal) {
            Some(ptl) => {
                log::debug!("Setting portal {} lazy", portal);
                ptl.lazy = true;
                Ok(())
            }
            None => Err(LnetError::Invalid),
        }
    }

    /// Stop parking PUTs on `portal`, dropping those waiting.
    pub fn clear_lazy_portal(&self, portal: usize) -> LnetResult<()> {
        let zombies: Vec<Box<Msg>> = {
            let mut res = self.res.lock(LockSel::Cpt(self.match_cpt()));
            let ptl = match res.portals.get_mut(portal) {
                Some(ptl) => ptl,
                None => return Err(LnetError::Invalid),
            };
            if !ptl.lazy {
                return Ok(());
            }
            if self.is_shutdown() {
                log::warn!("Active lazy portal {} on exit", portal);
            } else {
                log::debug!("clearing portal {} lazy", portal);
            }
            ptl.lazy = false;
            ptl.delayed.drain(..).collect()
        };
        self.drop_delayed_puts(zombies, "Clearing lazy portal attr");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ack_req() {
        assert_ne!(AckReq::Ack, AckReq::NoAck);
        assert_eq!(FAIL_THRESH_INF, u32::MAX);
    }
}
