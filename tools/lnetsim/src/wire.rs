// Copyright (c) Meta Platforms, Inc. and affiliates.
//
// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! An in-memory network connecting the NIs of several LNet instances.
//!
//! Every send becomes a `Packet` on a shared channel. Pump threads take
//! packets off the channel, complete the sender's message and hand the
//! packet to the receiving instance, so the whole exchange crosses threads
//! the way a real LND's completions would.

use anyhow::Context;
use anyhow::Result;
use crossbeam::channel::Receiver;
use crossbeam::channel::RecvTimeoutError;
use crossbeam::channel::Sender;
use lnet::Hdr;
use lnet::LNet;
use lnet::LndResult;
use lnet::Lnd;
use lnet::LnetError;
use lnet::Msg;
use lnet::Ni;
use lnet::NiConfig;
use lnet::Nid;
use lnet::Private;
use lnet::RecvArgs;
use std::collections::HashMap;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::PoisonError;
use std::time::Duration;

struct Packet {
    from: Nid,
    to: Nid,
    hdr: Hdr,
    data: Vec<u8>,
    sendmsg: Option<(LNet, Box<Msg>)>,
}

#[derive(Debug, Default, Clone, Copy)]
pub struct WireStats {
    pub delivered: u64,
    pub dropped: u64,
    pub refused: u64,
}

pub struct Wire {
    tx: Sender<Packet>,
    rx: Receiver<Packet>,
    nodes: Mutex<HashMap<Nid, (LNet, Arc<Ni>)>>,
    /// Packets sent and not yet handed over.
    queued: AtomicUsize,
    delivered: AtomicU64,
    dropped: AtomicU64,
    refused: AtomicU64,
}

impl Wire {
    pub fn new() -> Arc<Wire> {
        let (tx, rx) = crossbeam::channel::unbounded();
        Arc::new(Wire {
            tx,
            rx,
            nodes: Mutex::new(HashMap::new()),
            queued: AtomicUsize::new(0),
            delivered: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
            refused: AtomicU64::new(0),
        })
    }

    /// Bring up `nid` on `lnet`, plugged into this wire.
    pub fn attach(self: &Arc<Self>, lnet: &LNet, nid: &str, cfg: NiConfig) -> Result<Arc<Ni>> {
        let nid: Nid = nid.parse()?;
        let lnd = Arc::new(WireLnd {
            lnd_type: nid.net().lnd_type(),
            wire: self.clone(),
        });
        let ni = lnet
            .add_ni(nid, lnd, cfg)
            .with_context(|| format!("Failed to add NI {}", nid))?;
        self.nodes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(nid, (lnet.clone(), ni.clone()));
        log::debug!("{} attached", nid);
        Ok(ni)
    }

    /// Every packet sent so far has been handed over.
    pub fn is_idle(&self) -> bool {
        self.queued.load(Ordering::Acquire) == 0
    }

    pub fn stats(&self) -> WireStats {
        WireStats {
            delivered: self.delivered.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            refused: self.refused.load(Ordering::Relaxed),
        }
    }

    /// Deliver packets until `stop` is set.
    pub fn pump(&self, stop: &AtomicBool) {
        while !stop.load(Ordering::Relaxed) {
            match self.rx.recv_timeout(Duration::from_millis(20)) {
                Ok(pkt) => {
                    self.deliver(pkt);
                    self.queued.fetch_sub(1, Ordering::AcqRel);
                }
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }
    }

    fn deliver(&self, mut pkt: Packet) {
        if let Some((lnet, msg)) = pkt.sendmsg.take() {
            lnet.finalize(msg, Ok(()));
        }
        let dest = self
            .nodes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&pkt.to)
            .cloned();
        let (lnet, ni) = match dest {
            Some(dest) => dest,
            None => {
                log::debug!("No NI at {}, dropping packet from {}", pkt.to, pkt.from);
                self.dropped.fetch_add(1, Ordering::Relaxed);
                return;
            }
        };
        let (from, hdr) = (pkt.from, pkt.hdr);
        let private: Private = Box::new(pkt);
        match lnet.parse(&ni, hdr, from, private, false) {
            Ok(()) => {
                self.delivered.fetch_add(1, Ordering::Relaxed);
            }
            Err((e, _)) => {
                log::warn!("{} refused a packet from {}: {}", ni.nid(), from, e);
                self.refused.fetch_add(1, Ordering::Relaxed);
            }
        }
    }
}

struct WireLnd {
    lnd_type: u16,
    wire: Arc<Wire>,
}

impl Lnd for WireLnd {
    fn lnd_type(&self) -> u16 {
        self.lnd_type
    }

    fn send(&self, lnet: &LNet, ni: &Arc<Ni>, msg: Box<Msg>) -> LndResult {
        let (to, hdr, data) = (msg.target().nid, *msg.hdr(), msg.payload().read());
        let pkt = Packet {
            from: ni.nid(),
            to,
            hdr,
            data,
            sendmsg: Some((lnet.clone(), msg)),
        };
        self.wire.queued.fetch_add(1, Ordering::AcqRel);
        match self.wire.tx.send(pkt) {
            Ok(()) => Ok(()),
            Err(err) => {
                self.wire.queued.fetch_sub(1, Ordering::AcqRel);
                let pkt = err.into_inner();
                Err((LnetError::Shutdown, pkt.sendmsg.map(|(_, msg)| msg)))
            }
        }
    }

    fn recv(
        &self,
        lnet: &LNet,
        ni: &Arc<Ni>,
        private: Option<Private>,
        msg: Option<Box<Msg>>,
        args: RecvArgs,
    ) -> LndResult {
        let pkt = match private.map(|p| p.downcast::<Packet>()) {
            Some(Ok(pkt)) => pkt,
            _ => {
                log::error!("{}: receive without a packet", ni.nid());
                return Err((LnetError::Proto, msg));
            }
        };
        let mlen = args.mlen as usize;
        if args.rlen as usize != pkt.data.len() || mlen > pkt.data.len() {
            log::error!(
                "{}: bad lengths from {}: mlen {} rlen {}, {} on the wire",
                ni.nid(),
                pkt.from,
                args.mlen,
                args.rlen,
                pkt.data.len()
            );
            return Err((LnetError::Proto, msg));
        }
        if let Some(msg) = msg {
            msg.payload().write(&pkt.data[..mlen]);
            lnet.finalize(msg, Ok(()));
        }
        Ok(())
    }
}
