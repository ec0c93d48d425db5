// Copyright (c) Meta Platforms, Inc. and affiliates.
//
// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

use lnet::md::MD_OP_GET;
use lnet::md::MD_OP_PUT;
use lnet::md::MD_THRESH_INF;
use lnet::types::LUSTRE_SRV_PID;
use lnet::AckReq;
use lnet::EqHandle;
use lnet::Event;
use lnet::EventKind;
use lnet::InsPos;
use lnet::IoBuf;
use lnet::LNet;
use lnet::LnetError;
use lnet::MdDesc;
use lnet::MdHandle;
use lnet::NiConfig;
use lnet::Nid;
use lnet::ProcessId;
use lnet::Unlink;

mod common;

use common::Fabric;

const PORTAL: usize = 5;
const MBITS: u64 = 0x1234;

fn drain(lnet: &LNet, eqh: EqHandle) -> Vec<Event> {
    let mut events = Vec::new();
    while let Some(polled) = lnet.eq_get(eqh).unwrap() {
        assert!(!polled.overflowed);
        events.push(polled.event);
    }
    events
}

fn kinds(events: &[Event]) -> Vec<EventKind> {
    let mut kinds: Vec<EventKind> = events.iter().map(|e| e.kind).collect();
    kinds.sort_by_key(|k| k.to_string());
    kinds
}

/// Post a receive buffer on `PORTAL`.
fn post_buffer(lnet: &LNet, buf: &IoBuf, options: u32, eqh: EqHandle) -> MdHandle {
    let meh = lnet
        .me_attach(PORTAL, ProcessId::ANY, MBITS, 0, Unlink::Unlink, InsPos::After)
        .unwrap();
    let desc = MdDesc {
        eq: eqh,
        ..MdDesc::contiguous(buf.clone(), MD_THRESH_INF, options)
    };
    lnet.md_attach(meh, &desc, Unlink::Unlink).unwrap()
}

fn bind(lnet: &LNet, buf: &IoBuf, threshold: i32, eqh: EqHandle) -> MdHandle {
    let desc = MdDesc {
        eq: eqh,
        ..MdDesc::contiguous(buf.clone(), threshold, 0)
    };
    lnet.md_bind(&desc, Unlink::Unlink).unwrap()
}

fn nid(s: &str) -> Nid {
    s.parse().unwrap()
}

fn peer_row(lnet: &LNet, peer: &str) -> Vec<String> {
    let table = lnet.read_table(LNet::read_peers, 3).unwrap();
    match table.lines().find(|l| l.starts_with(peer)) {
        Some(row) => row.split_whitespace().map(String::from).collect(),
        None => panic!("no row for {} in\n{}", peer, table),
    }
}

#[test]
fn test_loopback_put_with_ack() {
    let lnet = common::node(common::config());
    let eq_tgt = lnet.eq_alloc(16, None).unwrap();
    let eq_src = lnet.eq_alloc(16, None).unwrap();

    let sink = IoBuf::new(128);
    post_buffer(&lnet, &sink, MD_OP_PUT, eq_tgt);
    let src = IoBuf::from_vec((0..64).collect());
    let mdh = bind(&lnet, &src, 2, eq_src);

    let me = ProcessId::new(Nid::LOOPBACK, LUSTRE_SRV_PID);
    lnet.put(Nid::ANY, mdh, AckReq::Ack, me, PORTAL as u32, MBITS, 0, 77)
        .unwrap();

    let tgt = drain(&lnet, eq_tgt);
    assert_eq!(kinds(&tgt), vec![EventKind::Put]);
    assert_eq!(tgt[0].mlength, 64);
    assert_eq!(tgt[0].rlength, 64);
    assert_eq!(tgt[0].hdr_data, 77);
    assert_eq!(tgt[0].initiator, me);
    assert!(tgt[0].status.is_ok());
    assert_eq!(&sink.to_vec()[..64], &src.to_vec()[..]);

    // The ACK comes back on the source MD, which is used up with it.
    let src_events = drain(&lnet, eq_src);
    assert_eq!(kinds(&src_events), vec![EventKind::Ack, EventKind::Send]);
    assert!(src_events.iter().any(|e| e.unlinked));
    assert_eq!(lnet.md_unlink(mdh), Err(LnetError::NotFound));

    let counters = lnet.counters();
    assert_eq!(counters.msgs_alloc, 0);
    assert_eq!(counters.send_length, 64);
    assert_eq!(counters.recv_length, 64);
    assert_eq!(lnet.msgs_in_use(), 0);
    lnet.shutdown();
}

#[test]
fn test_loopback_get() {
    let lnet = common::node(common::config());
    let eq_tgt = lnet.eq_alloc(16, None).unwrap();
    let eq_src = lnet.eq_alloc(16, None).unwrap();

    let served = IoBuf::from_vec(vec![0xab; 32]);
    post_buffer(&lnet, &served, MD_OP_GET, eq_tgt);
    let sink = IoBuf::new(32);
    let mdh = bind(&lnet, &sink, 2, eq_src);

    let me = ProcessId::new(Nid::LOOPBACK, LUSTRE_SRV_PID);
    lnet.get(Nid::ANY, mdh, me, PORTAL as u32, MBITS, 0).unwrap();

    assert_eq!(kinds(&drain(&lnet, eq_tgt)), vec![EventKind::Get]);
    let src_events = drain(&lnet, eq_src);
    assert_eq!(kinds(&src_events), vec![EventKind::Reply, EventKind::Send]);
    let reply = src_events
        .iter()
        .find(|e| e.kind == EventKind::Reply)
        .unwrap();
    assert_eq!(reply.mlength, 32);
    assert_eq!(sink.to_vec(), vec![0xab; 32]);
    assert_eq!(lnet.counters().msgs_alloc, 0);
    lnet.shutdown();
}

#[test]
fn test_eq_busy_while_referenced() {
    let lnet = common::node(common::config());
    let eqh = lnet.eq_alloc(4, None).unwrap();
    let mdh = bind(&lnet, &IoBuf::new(8), 1, eqh);
    assert_eq!(lnet.eq_free(eqh), Err(LnetError::Busy));
    lnet.md_unlink(mdh).unwrap();
    let events = drain(&lnet, eqh);
    assert_eq!(kinds(&events), vec![EventKind::Unlink]);
    lnet.eq_free(eqh).unwrap();
    assert_eq!(lnet.eq_free(eqh), Err(LnetError::NotFound));
    lnet.shutdown();
}

#[test]
fn test_peer_credits_queue_and_drain() {
    let fabric = Fabric::new();
    let a = common::node(common::config());
    let b = common::node(common::config());
    let cfg = NiConfig {
        credits: 8,
        peer_credits: 1,
        ..Default::default()
    };
    fabric.attach(&a, "1@gni", cfg);
    fabric.attach(&b, "2@gni", cfg);

    let eq_b = b.eq_alloc(16, None).unwrap();
    let sink = IoBuf::new(48);
    post_buffer(&b, &sink, MD_OP_PUT, eq_b);

    let eq_a = a.eq_alloc(16, None).unwrap();
    let target = ProcessId::new(nid("2@gni"), LUSTRE_SRV_PID);
    for i in 0..3u8 {
        let mdh = bind(&a, &IoBuf::from_vec(vec![i; 16]), 1, eq_a);
        a.put(Nid::ANY, mdh, AckReq::NoAck, target, PORTAL as u32, MBITS, 0, 0)
            .unwrap();
    }

    // One credit towards the peer: the other two wait.
    assert_eq!(fabric.pending(), 1);
    let row = peer_row(&a, "2@gni");
    assert_eq!(row[7], "-2");
    assert_eq!(row[8], "-2");

    assert_eq!(fabric.pump(), 3);
    let events = drain(&b, eq_b);
    assert_eq!(events.len(), 3);
    assert!(events.iter().all(|e| e.kind == EventKind::Put));
    let data = sink.to_vec();
    assert_eq!(&data[..16], &[0; 16]);
    assert_eq!(&data[16..32], &[1; 16]);
    assert_eq!(&data[32..], &[2; 16]);

    // Every credit came back; the low-water mark stays.
    let row = peer_row(&a, "2@gni");
    assert_eq!(row[7], "1");
    assert_eq!(row[8], "-2");
    assert_eq!(row[9], "0");
    assert_eq!(drain(&a, eq_a).len(), 3);
    assert_eq!(a.counters().msgs_alloc, 0);
    assert_eq!(b.counters().msgs_alloc, 0);

    a.shutdown();
    b.shutdown();
}

#[test]
fn test_lazy_portal_delays_put() {
    let fabric = Fabric::new();
    let a = common::node(common::config());
    let b = common::node(common::config());
    fabric.attach(&a, "1@gni", NiConfig::default());
    fabric.attach(&b, "2@gni", NiConfig::default());
    b.set_lazy_portal(PORTAL).unwrap();

    let target = ProcessId::new(nid("2@gni"), LUSTRE_SRV_PID);
    let mdh = bind(&a, &IoBuf::from_vec(vec![9; 8]), 1, EqHandle::INVALID);
    a.put(Nid::ANY, mdh, AckReq::NoAck, target, PORTAL as u32, MBITS, 0, 0)
        .unwrap();
    assert_eq!(fabric.pump(), 1);
    // Parked, not dropped.
    assert_eq!(b.counters().drop_count, 0);
    assert_eq!(b.msgs_in_use(), 1);

    let eq_b = b.eq_alloc(4, None).unwrap();
    let sink = IoBuf::new(8);
    post_buffer(&b, &sink, MD_OP_PUT, eq_b);
    assert_eq!(kinds(&drain(&b, eq_b)), vec![EventKind::Put]);
    assert_eq!(sink.to_vec(), vec![9; 8]);
    assert_eq!(b.msgs_in_use(), 0);

    // Once the portal is no longer lazy, unmatched PUTs are dropped.
    let mdh = bind(&a, &IoBuf::from_vec(vec![1; 8]), 1, EqHandle::INVALID);
    a.put(Nid::ANY, mdh, AckReq::NoAck, target, PORTAL as u32, 0xdead, 0, 0)
        .unwrap();
    fabric.pump();
    assert_eq!(b.counters().drop_count, 0);
    b.clear_lazy_portal(PORTAL).unwrap();
    assert_eq!(b.counters().drop_count, 1);
    assert_eq!(b.counters().drop_length, 8);
    assert_eq!(b.counters().msgs_alloc, 0);

    a.shutdown();
    b.shutdown();
}

#[test]
fn test_unmatched_put_dropped() {
    let fabric = Fabric::new();
    let a = common::node(common::config());
    let b = common::node(common::config());
    fabric.attach(&a, "1@gni", NiConfig::default());
    fabric.attach(&b, "2@gni", NiConfig::default());

    let eq_a = a.eq_alloc(4, None).unwrap();
    let mdh = bind(&a, &IoBuf::new(100), 1, eq_a);
    let target = ProcessId::new(nid("2@gni"), LUSTRE_SRV_PID);
    a.put(Nid::ANY, mdh, AckReq::Ack, target, 3, 1, 0, 0).unwrap();
    fabric.pump();

    let counters = b.counters();
    assert_eq!(counters.drop_count, 1);
    assert_eq!(counters.drop_length, 100);
    assert_eq!(counters.msgs_alloc, 0);
    // The sender only learns the PUT went out.
    let events = drain(&a, eq_a);
    assert_eq!(kinds(&events), vec![EventKind::Send]);
    assert!(events[0].status.is_ok());

    a.shutdown();
    b.shutdown();
}

#[test]
fn test_simulated_failure() {
    let fabric = Fabric::new();
    let a = common::node(common::config());
    fabric.attach(&a, "1@gni", NiConfig::default());

    let target = ProcessId::new(nid("2@gni"), LUSTRE_SRV_PID);
    a.fail_nid(target.nid, 1);
    let mdh = bind(&a, &IoBuf::new(4), 2, EqHandle::INVALID);
    assert_eq!(
        a.put(Nid::ANY, mdh, AckReq::NoAck, target, 1, 0, 0, 0),
        Err(LnetError::Io)
    );
    // Only one message was to fail.
    a.put(Nid::ANY, mdh, AckReq::NoAck, target, 1, 0, 0, 0)
        .unwrap();
    assert_eq!(fabric.pending(), 1);

    a.fail_nid(Nid::ANY, lnet::FAIL_THRESH_INF);
    let mdh = bind(&a, &IoBuf::new(4), 1, EqHandle::INVALID);
    assert_eq!(
        a.put(Nid::ANY, mdh, AckReq::NoAck, target, 1, 0, 0, 0),
        Err(LnetError::Io)
    );
    a.fail_nid(Nid::ANY, 0);
    a.put(Nid::ANY, mdh, AckReq::NoAck, target, 1, 0, 0, 0)
        .unwrap();
    assert_eq!(fabric.pending(), 2);
    fabric.black_hole("2@gni");
    fabric.pump();
    assert_eq!(a.counters().msgs_alloc, 0);
    a.shutdown();
}

#[test]
fn test_routed_put() {
    let fabric = Fabric::new();
    let a = common::node(common::config());
    let mut rcfg = common::config();
    rcfg.forwarding = "enabled".to_string();
    let r = common::node(rcfg);
    let b = common::node(common::config());

    fabric.attach(&a, "1@gni", NiConfig::default());
    fabric.attach(&r, "2@gni", NiConfig::default());
    fabric.attach(&r, "2@gni1", NiConfig::default());
    fabric.attach(&b, "3@gni1", NiConfig::default());
    a.add_route("gni1".parse().unwrap(), 1, nid("2@gni")).unwrap();
    a.check_routes().unwrap();

    let dist = a.dist(nid("3@gni1")).unwrap();
    assert_eq!(dist.hops, 2);
    assert_eq!(dist.src_nid, nid("1@gni"));
    assert_eq!(a.dist(nid("7@gni")).unwrap().hops, 1);
    assert_eq!(a.dist(Nid::LOOPBACK).unwrap().hops, 0);
    assert_eq!(a.dist(nid("1@gni2")), Err(LnetError::HostUnreachable));

    let eq_b = b.eq_alloc(4, None).unwrap();
    let sink = IoBuf::new(5000);
    post_buffer(&b, &sink, MD_OP_PUT, eq_b);

    let payload: Vec<u8> = (0..5000).map(|i| (i % 251) as u8).collect();
    let mdh = bind(&a, &IoBuf::from_vec(payload.clone()), 1, EqHandle::INVALID);
    let target = ProcessId::new(nid("3@gni1"), LUSTRE_SRV_PID);
    a.put(Nid::ANY, mdh, AckReq::NoAck, target, PORTAL as u32, MBITS, 0, 0)
        .unwrap();

    // A to R, then R to B.
    assert_eq!(fabric.pump(), 2);
    let events = drain(&b, eq_b);
    assert_eq!(kinds(&events), vec![EventKind::Put]);
    assert_eq!(events[0].initiator.nid, nid("1@gni"));
    assert_eq!(events[0].sender, nid("2@gni1"));
    assert_eq!(sink.to_vec(), payload);

    let counters = r.counters();
    assert_eq!(counters.route_count, 1);
    assert_eq!(counters.route_length, 5000);
    assert_eq!(counters.msgs_alloc, 0);
    // The large buffer went back to its pool.
    let buffers = r.read_buffers();
    let large: Vec<&str> = buffers.lines().nth(3).unwrap().split_whitespace().collect();
    assert_eq!(large[2], large[1]);

    let routes = a.read_table(LNet::read_routes, 3).unwrap();
    assert!(routes.starts_with("Routing disabled\n"));
    assert!(routes.contains("gni1"));
    assert!(routes.contains("2@gni"));
    let routers = a.read_table(LNet::read_routers, 3).unwrap();
    assert_eq!(routers.lines().count(), 2);

    a.shutdown();
    r.shutdown();
    b.shutdown();
}

#[test]
fn test_stale_cursor() {
    let fabric = Fabric::new();
    let a = common::node(common::config());
    fabric.attach(&a, "1@gni", NiConfig::default());
    a.add_route("gni1".parse().unwrap(), 1, nid("2@gni")).unwrap();

    let (_, cursor) = a.read_routes(lnet::ProcCursor::START).unwrap();
    let (row, next) = a.read_routes(cursor).unwrap();
    assert!(row.contains("gni1"));
    // Past the end.
    assert!(a.read_routes(next).unwrap().0.is_empty());

    a.add_route("gni2".parse().unwrap(), 2, nid("2@gni")).unwrap();
    assert_eq!(a.read_routes(cursor), Err(LnetError::Stale));
    let routes = a.read_table(LNet::read_routes, 0).unwrap();
    assert_eq!(routes.lines().count(), 4);

    a.del_route(lnet::NetId::ANY, nid("2@gni")).unwrap();
    assert_eq!(
        a.del_route(lnet::NetId::ANY, nid("2@gni")),
        Err(LnetError::NotFound)
    );
    a.shutdown();
}

#[test]
fn test_me_attach_portal_kind() {
    let a = common::node(common::config());
    a.me_attach(PORTAL, ProcessId::ANY, MBITS, 0, Unlink::Unlink, InsPos::After)
        .unwrap();
    // The portal is now wildcard; a unique ME is refused.
    let peer = ProcessId::new(nid("2@gni"), LUSTRE_SRV_PID);
    assert_eq!(
        a.me_attach(PORTAL, peer, MBITS, 0, Unlink::Unlink, InsPos::After),
        Err(LnetError::Perm)
    );
    assert_eq!(
        a.me_attach(usize::MAX, ProcessId::ANY, MBITS, 0, Unlink::Unlink, InsPos::After),
        Err(LnetError::Invalid)
    );
    a.shutdown();
}

#[test]
fn test_foreign_cursor_ends_table() {
    let fabric = Fabric::new();
    let a = common::node(common::config());
    fabric.attach(&a, "1@gni", NiConfig::default());
    a.add_route("gni1".parse().unwrap(), 1, nid("2@gni")).unwrap();

    // No row number, partition bits set.
    let bogus = lnet::ProcCursor::from_raw(1 << 62);
    let (row, next) = a.read_routes(bogus).unwrap();
    assert!(row.is_empty());
    assert_eq!(next, bogus);
    assert!(a.read_routers(bogus).unwrap().0.is_empty());
    assert!(a.read_peers(bogus).unwrap().0.is_empty());
    assert!(a.read_nis(bogus).unwrap().0.is_empty());

    // A real row number in a partition this node does not have.
    let far = lnet::ProcCursor::from_raw((1 << 62) | 1);
    assert!(a.read_peers(far).unwrap().0.is_empty());
    a.shutdown();
}

#[test]
fn test_stats_and_nis() {
    let fabric = Fabric::new();
    let a = common::node(common::config());
    fabric.attach(&a, "1@gni", NiConfig::default());
    let stats = a.read_stats();
    assert_eq!(stats.split_whitespace().count(), 11);

    // Header plus one row per NI and partition.
    let nis = a.read_table(LNet::read_nis, 0).unwrap();
    assert_eq!(nis.lines().count(), 1 + 2 * 2);
    assert!(nis.lines().any(|l| l.starts_with("0@lo")));
    assert!(nis.lines().any(|l| l.starts_with("1@gni")));
    a.shutdown();
}
