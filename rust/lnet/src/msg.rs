// Copyright (c) Meta Platforms, Inc. and affiliates.
//
// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! # Message lifecycle
//!
//! A message goes through
//!
//!```text
//!  allocated -> prepared -> committed -> finalized -> freed
//!```
//!
//! Committing a message charges it to one network partition (two for a
//! routed message, which is committed for receiving and then for sending).
//! While committed it may hold peer, NI and router buffer credits. It is
//! finalized exactly once, by whoever owns it when the operation ends:
//! the LND, a credit queue draining, or the engine itself on failure.
//! Finalizing posts the MD event, returns every credit and frees the
//! message, unless an ACK or a forward is still owed, in which case the
//! message is sent again.
//!
//! Freeing a message that is still committed, still references peers, or
//! still holds an MD is a bug and panics.

use crate::api::LNet;
use crate::eq::Event;
use crate::eq::EventKind;
use crate::eq::EventQueue;
use crate::error::Status;
use crate::handle::cpt_of_cookie;
use crate::handle::MdHandle;
use crate::md::Md;
use crate::md::Payload;
use crate::net::NetPart;
use crate::ni::Ni;
use crate::ni::RecvArgs;
use crate::peer::PeerRef;
use crate::router::RtrBuf;
use crate::types::Hdr;
use crate::types::HdrBody;
use crate::types::MsgType;
use crate::types::Nid;
use crate::types::ProcessId;
use crate::Recycle;
use cfs_utils::LockSel;
use std::any::Any;
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::PoisonError;
use std::thread;
use std::thread::ThreadId;

/// LND private data travelling with a message.
pub type Private = Box<dyn Any + Send + Sync>;

pub struct Msg {
    pub(crate) msg_type: MsgType,
    pub(crate) hdr: Hdr,
    pub(crate) target: ProcessId,
    /// NID the message was received from, the last hop.
    pub(crate) from: Nid,
    pub(crate) len: u32,
    pub(crate) wanted: u32,
    pub(crate) offset: u32,
    pub(crate) payload: Payload,
    pub(crate) private: Option<Private>,
    /// Cookie of the MD the message owns a reference on.
    pub(crate) md: Option<u64>,
    pub(crate) ev: Event,
    pub(crate) status: Status,

    pub(crate) target_is_router: bool,
    pub(crate) routing: bool,
    pub(crate) sending: bool,
    pub(crate) receiving: bool,
    pub(crate) ack: bool,
    pub(crate) delayed: bool,
    pub(crate) txcredit: bool,
    pub(crate) peertxcredit: bool,
    pub(crate) rtrcredit: bool,
    pub(crate) peerrtrcredit: bool,
    pub(crate) onactivelist: bool,
    pub(crate) tx_committed: bool,
    pub(crate) tx_cpt: usize,
    pub(crate) rx_committed: bool,
    pub(crate) rx_cpt: usize,

    pub(crate) txpeer: Option<PeerRef>,
    pub(crate) rxpeer: Option<PeerRef>,
    pub(crate) txni: Option<Arc<Ni>>,
    pub(crate) rxni: Option<Arc<Ni>>,
    pub(crate) rtrbuf: Option<RtrBuf>,
}

impl Default for Msg {
    fn default() -> Self {
        Self {
            msg_type: MsgType::Put,
            hdr: Hdr::default(),
            target: ProcessId::ANY,
            from: Nid::ANY,
            len: 0,
            wanted: 0,
            offset: 0,
            payload: Payload::default(),
            private: None,
            md: None,
            ev: Event::default(),
            status: Ok(()),
            target_is_router: false,
            routing: false,
            sending: false,
            receiving: false,
            ack: false,
            delayed: false,
            txcredit: false,
            peertxcredit: false,
            rtrcredit: false,
            peerrtrcredit: false,
            onactivelist: false,
            tx_committed: false,
            tx_cpt: 0,
            rx_committed: false,
            rx_cpt: 0,
            txpeer: None,
            rxpeer: None,
            txni: None,
            rxni: None,
            rtrbuf: None,
        }
    }
}

impl Recycle for Msg {}

impl Msg {
    pub fn hdr(&self) -> &Hdr {
        &self.hdr
    }

    pub fn msg_type(&self) -> MsgType {
        self.msg_type
    }

    pub fn target(&self) -> ProcessId {
        self.target
    }

    /// Bytes on the wire.
    pub fn len(&self) -> u32 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Bytes the receiver actually takes.
    pub fn wanted(&self) -> u32 {
        self.wanted
    }

    /// Buffers to transmit from or receive into.
    pub fn payload(&self) -> &Payload {
        &self.payload
    }

    pub fn private_mut(&mut self) -> &mut Option<Private> {
        &mut self.private
    }

    pub(crate) fn is_committed(&self) -> bool {
        self.tx_committed || self.rx_committed
    }

    /// Bind the message to an MD, consuming one unit of its threshold.
    /// Called with the MD's resource partition locked.
    pub(crate) fn attach_md(&mut self, cookie: u64, md: &mut Md, offset: u32, mlen: u32) {
        assert!(!self.routing, "attaching an MD to a routed message");
        self.md = Some(cookie);
        if self.receiving {
            self.offset = offset;
            self.wanted = mlen;
        }
        md.commit();
        self.ev.md_handle = MdHandle::from_cookie(cookie);
        self.ev.md = md.info();
        self.payload = md.payload(offset, mlen);
    }

    /// Fill in the header of an outgoing message. The source NID is set
    /// once the sending NI is known.
    pub(crate) fn prep_send(
        &mut self,
        body: HdrBody,
        target: ProcessId,
        src_pid: u32,
        offset: u32,
        len: u32,
    ) {
        self.hdr = Hdr {
            dest_nid: target.nid,
            dest_pid: target.pid,
            src_pid,
            payload_length: len,
            body,
            ..Default::default()
        };
        self.msg_type = self.hdr.msg_type();
        self.target = target;
        self.len = len;
        self.offset = offset;
        if len == 0 {
            self.payload = Payload::default();
        }
    }

    /// Fill the event the message will post on completion.
    pub(crate) fn build_event(&mut self, kind: EventKind, my_pid: u32) {
        assert!(!self.routing, "no event for a routed message");
        let hdr = self.hdr;
        let ev = &mut self.ev;
        ev.kind = kind;

        if kind == EventKind::Send {
            ev.target = hdr.dest();
            ev.initiator = ProcessId::new(Nid::ANY, my_pid);
            ev.sender = Nid::ANY;
        } else {
            ev.target = hdr.dest();
            ev.initiator = hdr.src();
            ev.rlength = hdr.payload_length;
            ev.sender = self.from;
            ev.mlength = self.wanted;
            ev.offset = self.offset;
        }

        match (kind, hdr.body) {
            (
                EventKind::Put,
                HdrBody::Put {
                    ptl_index,
                    match_bits,
                    hdr_data,
                    ..
                },
            ) => {
                ev.pt_index = ptl_index;
                ev.match_bits = match_bits;
                ev.hdr_data = hdr_data;
            }
            (
                EventKind::Get,
                HdrBody::Get {
                    ptl_index,
                    match_bits,
                    ..
                },
            ) => {
                ev.pt_index = ptl_index;
                ev.match_bits = match_bits;
                ev.hdr_data = 0;
            }
            (
                EventKind::Ack,
                HdrBody::Ack {
                    match_bits,
                    mlength,
                    ..
                },
            ) => {
                ev.match_bits = match_bits;
                ev.mlength = mlength;
            }
            (EventKind::Reply, _) => {}
            (
                EventKind::Send,
                HdrBody::Put {
                    ptl_index,
                    match_bits,
                    offset,
                    hdr_data,
                    ..
                },
            ) => {
                ev.pt_index = ptl_index;
                ev.match_bits = match_bits;
                ev.offset = offset;
                ev.mlength = hdr.payload_length;
                ev.rlength = hdr.payload_length;
                ev.hdr_data = hdr_data;
            }
            (
                EventKind::Send,
                HdrBody::Get {
                    ptl_index,
                    match_bits,
                    src_offset,
                    sink_length,
                    ..
                },
            ) => {
                ev.pt_index = ptl_index;
                ev.match_bits = match_bits;
                ev.mlength = sink_length;
                ev.rlength = sink_length;
                ev.offset = src_offset;
                ev.hdr_data = 0;
            }
            (kind, body) => panic!("no {} event for {:?}", kind, body),
        }
    }
}

/// Per-partition bookkeeping of committed messages.
pub(crate) struct MsgContainer {
    /// Messages committed in this partition.
    pub(crate) nactive: usize,
    pub(crate) finalizing: VecDeque<Box<Msg>>,
    /// Threads currently completing messages of this partition.
    pub(crate) finalizers: Vec<Option<ThreadId>>,
}

impl MsgContainer {
    pub(crate) fn new(nfinalizers: usize) -> MsgContainer {
        MsgContainer {
            nactive: 0,
            finalizing: VecDeque::new(),
            finalizers: vec![None; nfinalizers.max(1)],
        }
    }
}

/// Charge `msg` to partition `part`.
///
/// A message already committed for receiving (routed, or the REPLY of an
/// optimized GET) is only marked as committed for sending.
pub(crate) fn commit(part: &mut NetPart, msg: &mut Msg) {
    assert!(!msg.tx_committed, "message committed twice for sending");
    let cpt = part.cpt;

    if msg.rx_committed {
        assert!(msg.onactivelist);
        msg.tx_committed = true;
        msg.tx_cpt = cpt;
        return;
    }

    assert!(!msg.onactivelist);
    msg.onactivelist = true;
    part.msgs.nactive += 1;

    let counters = &mut part.counters;
    counters.msgs_alloc += 1;
    counters.msgs_max = counters.msgs_max.max(counters.msgs_alloc);

    if msg.routing {
        msg.rx_cpt = cpt;
        msg.rx_committed = true;
        counters.route_count += 1;
        counters.route_length += msg.len as u64;
        return;
    }

    match msg.ev.kind {
        EventKind::Send => {
            assert!(
                msg.msg_type != MsgType::Reply,
                "REPLY committed as an active send"
            );
            msg.tx_cpt = cpt;
            msg.tx_committed = true;
            counters.send_count += 1;
            if msg.msg_type == MsgType::Put {
                counters.send_length += msg.ev.mlength as u64;
            }
        }
        EventKind::Put | EventKind::Get | EventKind::Ack | EventKind::Reply => {
            msg.rx_cpt = cpt;
            msg.rx_committed = true;
            counters.recv_count += 1;
            // A served GET sends its payload back.
            match msg.ev.kind {
                EventKind::Get => counters.send_length += msg.ev.mlength as u64,
                EventKind::Put | EventKind::Reply => {
                    counters.recv_length += msg.ev.mlength as u64
                }
                _ => {}
            }
        }
        EventKind::Unlink => panic!("committing a message without an event"),
    }
}

/// Work that must run once every LNet lock is dropped.
pub(crate) enum Deferred {
    /// Hand the message to its NI for transmission.
    Send(Box<Msg>),
    /// Let the receiving NI land the payload.
    Recv { msg: Box<Msg>, args: RecvArgs },
    Finalize(Box<Msg>, Status),
    /// Tell the LND to discard the payload, then fail the message.
    Drop(Box<Msg>, Status),
}

impl LNet {
    pub(crate) fn msg_alloc(&self) -> Option<Box<Msg>> {
        self.msg_pool
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .alloc()
    }

    /// # Panics
    ///
    /// Panics if the message is still committed or still holds a peer or
    /// an MD.
    pub(crate) fn msg_free(&self, mut msg: Box<Msg>) {
        assert!(
            !msg.is_committed() && !msg.onactivelist,
            "freeing a committed message"
        );
        assert!(
            msg.txpeer.is_none() && msg.rxpeer.is_none(),
            "freeing a message that still references a peer"
        );
        assert!(msg.md.is_none(), "freeing a message that still owns an MD");
        assert!(msg.rtrbuf.is_none(), "freeing a message holding a router buffer");
        msg.private = None;
        msg.payload = Payload::default();
        msg.txni = None;
        msg.rxni = None;
        self.msg_pool
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .free(msg);
    }

    /// Return every credit `msg` holds and uncharge it from its
    /// partitions. Takes the net locks itself.
    pub(crate) fn decommit(&self, msg: &mut Msg) {
        let mut work = Vec::new();

        if msg.tx_committed {
            let mut part = self.net.lock(LockSel::Cpt(msg.tx_cpt));
            self.return_tx_credits_locked(&mut part, msg, &mut work);
            msg.tx_committed = false;
            if !msg.rx_committed {
                part.counters.msgs_alloc -= 1;
                part.msgs.nactive -= 1;
                msg.onactivelist = false;
            }
        }

        if msg.rx_committed {
            let mut part = self.net.lock(LockSel::Cpt(msg.rx_cpt));
            self.return_rx_credits_locked(&mut part, msg, &mut work);
            msg.rx_committed = false;
            msg.onactivelist = false;
            part.msgs.nactive -= 1;
            part.counters.msgs_alloc -= 1;
        }

        self.run_deferred(work);
    }

    /// Drop the message's MD reference, posting its event and unlinking
    /// the MD if that was the last thing keeping it.
    fn detach_md(&self, msg: &mut Msg, status: Status) {
        let cookie = match msg.md.take() {
            Some(cookie) => cookie,
            None => return,
        };

        let mut post: Option<(Arc<EventQueue>, Event)> = None;
        {
            let mut res = self.res.lock(LockSel::Cpt(cpt_of_cookie(cookie)));
            let md = match res.mds.get_mut(cookie) {
                Some(md) => md,
                None => panic!("message references a freed MD {:#x}", cookie),
            };
            assert!(md.refcount > 0, "MD refcount underflow");
            md.refcount -= 1;

            let unlink = md.unlinkable();
            if let Some((_, eq)) = &md.eq {
                msg.ev.status = status;
                msg.ev.unlinked = unlink;
                post = Some((eq.clone(), msg.ev.clone()));
            }
            if unlink {
                res.md_unlink(cookie);
            }
        }

        if let Some((eq, ev)) = post {
            eq.enqueue(ev);
        }
    }

    /// Complete a message. Every message that was handed to an LND or
    /// queued by the engine ends up here exactly once.
    pub fn finalize(&self, mut msg: Box<Msg>, status: Status) {
        msg.status = status;
        msg.ev.status = status;
        if msg.md.is_some() {
            self.detach_md(&mut msg, status);
        }

        if !msg.is_committed() {
            assert!(!msg.onactivelist);
            self.release_unused(msg);
            return;
        }

        // A routed message is committed twice; sending is undone first.
        let cpt = if msg.tx_committed {
            msg.tx_cpt
        } else {
            msg.rx_cpt
        };
        let me = thread::current().id();

        let slot = {
            let mut part = self.net.lock(LockSel::Cpt(cpt));
            part.msgs.finalizing.push_back(msg);

            // Don't recurse into completions already running on this
            // thread; the running loop picks the message up.
            let finalizers = &mut part.msgs.finalizers;
            if finalizers.iter().any(|f| *f == Some(me)) {
                return;
            }
            match finalizers.iter().position(|f| f.is_none()) {
                Some(slot) => {
                    finalizers[slot] = Some(me);
                    slot
                }
                None => return,
            }
        };

        loop {
            let msg = {
                let mut part = self.net.lock(LockSel::Cpt(cpt));
                match part.msgs.finalizing.pop_front() {
                    Some(msg) => msg,
                    None => {
                        part.msgs.finalizers[slot] = None;
                        break;
                    }
                }
            };
            self.complete(msg);
        }
    }

    /// Free a message that never got committed, dropping any peer
    /// reference it picked up on the way.
    fn release_unused(&self, mut msg: Box<Msg>) {
        for pref in [msg.txpeer.take(), msg.rxpeer.take()].into_iter().flatten() {
            let mut part = self.net.lock(LockSel::Cpt(pref.cpt()));
            part.peers.decref(pref);
        }
        self.msg_free(msg);
    }

    fn complete(&self, mut msg: Box<Msg>) {
        if msg.status.is_ok() && msg.ack {
            // Only ACK a PUT that completed successfully.
            self.decommit(&mut msg);
            msg.ack = false;

            assert_eq!(msg.ev.kind, EventKind::Put);
            assert!(!msg.routing);
            let ack_wmd = match msg.hdr.body {
                HdrBody::Put { ack_wmd, .. } => ack_wmd,
                body => panic!("ACK owed for {:?}", body),
            };

            // No event is posted for the ACK, but commit goes by the kind.
            msg.ev.kind = EventKind::Send;
            let body = HdrBody::Ack {
                dst_wmd: ack_wmd,
                match_bits: msg.ev.match_bits,
                mlength: msg.ev.mlength,
            };
            let initiator = msg.ev.initiator;
            let dst = msg.ev.target.nid;
            msg.sending = false;
            msg.prep_send(body, initiator, self.pid, 0, 0);

            match self.send(dst, msg) {
                Ok(()) => return,
                Err((e, m)) => {
                    log::debug!("Failed to ACK {}: {}", initiator, e);
                    msg = m;
                }
            }
        } else if msg.status.is_ok() && msg.routing && !msg.sending {
            assert!(!msg.receiving, "forwarding before the receive finished");
            match self.send(Nid::ANY, msg) {
                Ok(()) => return,
                Err((e, m)) => {
                    log::debug!("Failed to forward {}: {}", m.hdr, e);
                    msg = m;
                }
            }
        }

        self.decommit(&mut msg);
        self.msg_free(msg);
    }

    pub(crate) fn ni_send(&self, msg: Box<Msg>) {
        let ni = match &msg.txni {
            Some(ni) => ni.clone(),
            None => panic!("sending {} without an NI", msg.hdr),
        };
        if let Err((e, msg)) = ni.lnd.send(self, &ni, msg) {
            if let Some(msg) = msg {
                self.finalize(msg, Err(e));
            }
        }
    }

    /// Ask the NI to receive (or, without `msg`, discard) a message.
    pub(crate) fn ni_recv(
        &self,
        ni: &Arc<Ni>,
        private: Option<Private>,
        msg: Option<Box<Msg>>,
        args: RecvArgs,
    ) {
        let msg = msg.map(|mut msg| {
            assert!(msg.receiving && !msg.sending);
            assert_eq!(args.rlen, msg.len);
            assert_eq!(args.mlen, msg.wanted);
            assert_eq!(args.offset, msg.offset);
            msg.receiving = false;
            msg
        });
        if let Err((e, msg)) = ni.lnd.recv(self, ni, private, msg, args) {
            if let Some(msg) = msg {
                self.finalize(msg, Err(e));
            }
        }
    }

    pub(crate) fn run_deferred(&self, work: Vec<Deferred>) {
        for item in work {
            match item {
                Deferred::Send(msg) => self.ni_send(msg),
                Deferred::Recv { mut msg, args } => {
                    let ni = match &msg.rxni {
                        Some(ni) => ni.clone(),
                        None => panic!("receiving {} without an NI", msg.hdr),
                    };
                    let private = msg.private.take();
                    self.ni_recv(&ni, private, Some(msg), args);
                }
                Deferred::Finalize(msg, status) => self.finalize(msg, status),
                Deferred::Drop(mut msg, status) => {
                    if let Some(ni) = msg.rxni.clone() {
                        let private = msg.private.take();
                        self.ni_recv(
                            &ni,
                            private,
                            None,
                            RecvArgs {
                                delayed: msg.delayed,
                                offset: 0,
                                mlen: 0,
                                rlen: msg.len,
                            },
                        );
                    }
                    self.finalize(msg, status);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LnetConfig;
    use crate::types::WireHandle;
    use cfs_utils::CptArgs;
    use cfs_utils::Topology;

    fn lnet() -> LNet {
        let config = LnetConfig {
            cpt: CptArgs {
                cpu_npartitions: 2,
                ..Default::default()
            },
            ..Default::default()
        };
        LNet::init(config, &Topology::synthetic(2, 2, 2)).unwrap()
    }

    fn sending() -> Box<Msg> {
        let mut msg = Box::new(Msg::default());
        msg.ev.kind = EventKind::Send;
        msg
    }

    fn put_hdr() -> Hdr {
        Hdr {
            dest_nid: "5@gni".parse().unwrap(),
            src_nid: "6@gni".parse().unwrap(),
            dest_pid: 12345,
            src_pid: 7,
            payload_length: 100,
            body: HdrBody::Put {
                ack_wmd: WireHandle::NONE,
                match_bits: 0x42,
                hdr_data: 9,
                ptl_index: 4,
                offset: 16,
            },
        }
    }

    #[test]
    fn test_passive_put_event() {
        let mut msg = Msg {
            hdr: put_hdr(),
            from: "1@gni".parse().unwrap(),
            wanted: 64,
            offset: 8,
            ..Default::default()
        };
        msg.build_event(EventKind::Put, 12345);
        let ev = &msg.ev;
        assert_eq!(ev.kind, EventKind::Put);
        assert_eq!(ev.initiator, msg.hdr.src());
        assert_eq!(ev.target, msg.hdr.dest());
        assert_eq!(ev.sender, msg.from);
        assert_eq!(ev.rlength, 100);
        assert_eq!(ev.mlength, 64);
        assert_eq!(ev.offset, 8);
        assert_eq!(ev.pt_index, 4);
        assert_eq!(ev.match_bits, 0x42);
        assert_eq!(ev.hdr_data, 9);
    }

    #[test]
    fn test_send_get_event() {
        let mut msg = Msg::default();
        let target = ProcessId::new("5@gni".parse().unwrap(), 12345);
        msg.prep_send(
            HdrBody::Get {
                return_wmd: WireHandle::NONE,
                match_bits: 3,
                ptl_index: 2,
                src_offset: 10,
                sink_length: 300,
            },
            target,
            77,
            0,
            0,
        );
        assert_eq!(msg.msg_type, MsgType::Get);
        assert_eq!(msg.hdr.src_pid, 77);
        msg.build_event(EventKind::Send, 77);
        assert_eq!(msg.ev.target, target);
        assert_eq!(msg.ev.initiator, ProcessId::new(Nid::ANY, 77));
        assert_eq!(msg.ev.mlength, 300);
        assert_eq!(msg.ev.rlength, 300);
        assert_eq!(msg.ev.offset, 10);
    }

    #[test]
    #[should_panic(expected = "no event for a routed message")]
    fn test_routed_has_no_event() {
        let mut msg = Msg {
            routing: true,
            ..Default::default()
        };
        msg.build_event(EventKind::Put, 0);
    }

    #[test]
    fn test_alloc_free() {
        let lnet = lnet();
        let msg = lnet.msg_alloc().unwrap();
        assert_eq!(lnet.msgs_in_use(), 1);
        lnet.msg_free(msg);
        assert_eq!(lnet.msgs_in_use(), 0);
        lnet.shutdown();
    }

    #[test]
    fn test_commit_counts_send() {
        let mut part = NetPart::new(0, 1);
        let mut msg = sending();
        msg.msg_type = MsgType::Put;
        msg.ev.mlength = 32;
        commit(&mut part, &mut msg);
        assert!(msg.tx_committed);
        assert!(msg.onactivelist);
        assert_eq!(part.msgs.nactive, 1);
        assert_eq!(part.counters.send_count, 1);
        assert_eq!(part.counters.send_length, 32);
    }

    #[test]
    #[should_panic(expected = "freeing a committed message")]
    fn test_free_committed() {
        let lnet = lnet();
        let mut msg = sending();
        commit(&mut NetPart::new(0, 1), &mut msg);
        lnet.msg_free(msg);
    }

    #[test]
    #[should_panic(expected = "message committed twice for sending")]
    fn test_commit_twice() {
        let mut part = NetPart::new(0, 1);
        let mut msg = sending();
        commit(&mut part, &mut msg);
        commit(&mut part, &mut msg);
    }
}
