// Copyright (c) Meta Platforms, Inc. and affiliates.
//
// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

#![allow(dead_code)]

use cfs_utils::CptArgs;
use cfs_utils::Topology;
use crossbeam::channel::Receiver;
use crossbeam::channel::Sender;
use lnet::LNet;
use lnet::LndResult;
use lnet::Lnd;
use lnet::LnetConfig;
use lnet::Msg;
use lnet::Ni;
use lnet::NiConfig;
use lnet::Nid;
use lnet::Private;
use lnet::RecvArgs;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::Once;

static LOG_INIT: Once = Once::new();

/// Log to the terminal when `LNET_TEST_LOG` is set.
pub fn setup_test() {
    LOG_INIT.call_once(|| {
        if std::env::var_os("LNET_TEST_LOG").is_some() {
            let _ = simplelog::TermLogger::init(
                simplelog::LevelFilter::Debug,
                simplelog::Config::default(),
                simplelog::TerminalMode::Stderr,
                simplelog::ColorChoice::Auto,
            );
        }
    });
}

pub fn config() -> LnetConfig {
    LnetConfig {
        cpt: CptArgs {
            cpu_npartitions: 2,
            ..Default::default()
        },
        ..Default::default()
    }
}

pub fn node(config: LnetConfig) -> LNet {
    setup_test();
    LNet::init(config, &Topology::synthetic(2, 2, 1)).unwrap()
}

/// A message on the wire. The sender's message rides along and is
/// completed once the packet is delivered.
pub struct Packet {
    pub from: Nid,
    pub to: Nid,
    pub hdr: lnet::Hdr,
    pub data: Vec<u8>,
    sendmsg: Option<(LNet, Box<Msg>)>,
}

/// Connects NIs of any number of LNet instances. Packets queue up until
/// `pump()` delivers them, so tests decide when the network makes
/// progress.
pub struct Fabric {
    tx: Sender<Packet>,
    rx: Receiver<Packet>,
    nodes: Mutex<HashMap<Nid, (LNet, Arc<Ni>)>>,
    /// Peers that lose every packet sent to them.
    black_holes: Mutex<Vec<Nid>>,
}

impl Fabric {
    pub fn new() -> Arc<Fabric> {
        let (tx, rx) = crossbeam::channel::unbounded();
        Arc::new(Fabric {
            tx,
            rx,
            nodes: Mutex::new(HashMap::new()),
            black_holes: Mutex::new(Vec::new()),
        })
    }

    /// Bring up `nid` on `lnet`, wired to this fabric.
    pub fn attach(self: &Arc<Self>, lnet: &LNet, nid: &str, cfg: NiConfig) -> Arc<Ni> {
        let nid: Nid = nid.parse().unwrap();
        let lnd = Arc::new(WireLnd {
            lnd_type: nid.net().lnd_type(),
            fabric: self.clone(),
        });
        let ni = lnet.add_ni(nid, lnd, cfg).unwrap();
        self.nodes
            .lock()
            .unwrap()
            .insert(nid, (lnet.clone(), ni.clone()));
        ni
    }

    pub fn black_hole(&self, nid: &str) {
        self.black_holes.lock().unwrap().push(nid.parse().unwrap());
    }

    pub fn pending(&self) -> usize {
        self.rx.len()
    }

    /// Deliver one packet, false when the wire is idle.
    pub fn pump_one(&self) -> bool {
        let mut pkt = match self.rx.try_recv() {
            Ok(pkt) => pkt,
            Err(_) => return false,
        };
        if let Some((lnet, msg)) = pkt.sendmsg.take() {
            lnet.finalize(msg, Ok(()));
        }
        if self.black_holes.lock().unwrap().contains(&pkt.to) {
            return true;
        }
        let dest = self.nodes.lock().unwrap().get(&pkt.to).cloned();
        if let Some((lnet, ni)) = dest {
            let (from, hdr) = (pkt.from, pkt.hdr);
            let private: Private = Box::new(pkt);
            if let Err((e, _)) = lnet.parse(&ni, hdr, from, private, false) {
                panic!("{} refused a packet from {}: {}", ni.nid(), from, e);
            }
        }
        true
    }

    /// Deliver packets until the wire is idle, returning how many went.
    pub fn pump(&self) -> usize {
        let mut n = 0;
        while self.pump_one() {
            n += 1;
        }
        n
    }
}

struct WireLnd {
    lnd_type: u16,
    fabric: Arc<Fabric>,
}

impl Lnd for WireLnd {
    fn lnd_type(&self) -> u16 {
        self.lnd_type
    }

    fn send(&self, lnet: &LNet, ni: &Arc<Ni>, msg: Box<Msg>) -> LndResult {
        let pkt = Packet {
            from: ni.nid(),
            to: msg.target().nid,
            hdr: *msg.hdr(),
            data: msg.payload().read(),
            sendmsg: Some((lnet.clone(), msg)),
        };
        if let Err(e) = self.fabric.tx.send(pkt) {
            panic!("fabric closed: {}", e);
        }
        Ok(())
    }

    fn recv(
        &self,
        lnet: &LNet,
        _ni: &Arc<Ni>,
        private: Option<Private>,
        msg: Option<Box<Msg>>,
        args: RecvArgs,
    ) -> LndResult {
        let pkt = match private.map(|p| p.downcast::<Packet>()) {
            Some(Ok(pkt)) => pkt,
            _ => panic!("receive without a packet"),
        };
        assert_eq!(args.rlen as usize, pkt.data.len());
        if let Some(msg) = msg {
            let mlen = args.mlen as usize;
            msg.payload().write(&pkt.data[..mlen]);
            lnet.finalize(msg, Ok(()));
        }
        Ok(())
    }
}
