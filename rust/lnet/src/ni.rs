// Copyright (c) Meta Platforms, Inc. and affiliates.
//
// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! # Network interfaces and drivers
//!
//! An `Ni` is one local interface on one network, driven by an `Lnd`.
//! Its send credits are split over the network partitions, each of which
//! keeps its own `NiTxQueue` of messages waiting for a credit.

use crate::api::LNet;
use crate::config::LnetConfig;
use crate::error::LnetError;
use crate::error::LnetResult;
use crate::msg::Msg;
use crate::msg::Private;
use crate::types::Nid;
use crate::types::LOLND;
use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::sync::Arc;

/// Lower bound on the per-partition share of NI credits, in units of
/// peer credits.
const NI_TQ_PEER_CREDITS: i32 = 8;

/// How much of a message the LND is asked to receive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RecvArgs {
    /// The message was queued for credits; the LND may have to fetch the
    /// payload it held back in `eager_recv()`.
    pub delayed: bool,
    pub offset: u32,
    /// Bytes to land in the message payload.
    pub mlen: u32,
    /// Bytes on the wire.
    pub rlen: u32,
}

/// On failure the LND hands the message back and the engine finalizes it
/// with the error.
pub type LndResult = Result<(), (LnetError, Option<Box<Msg>>)>;

/// A network driver.
///
/// `send()` and `recv()` take ownership of the message. The driver calls
/// `LNet::finalize()` once the transfer is done, from any thread, or
/// returns it with an error right away.
///
/// `eager_recv()`, `query()` and `notify()` are invoked with a network
/// partition locked and must not call back into LNet.
pub trait Lnd: Send + Sync {
    fn lnd_type(&self) -> u16;

    fn send(&self, lnet: &LNet, ni: &Arc<Ni>, msg: Box<Msg>) -> LndResult;

    /// Receive the payload of `msg`, or discard the incoming message when
    /// `msg` is `None`.
    fn recv(
        &self,
        lnet: &LNet,
        ni: &Arc<Ni>,
        private: Option<Private>,
        msg: Option<Box<Msg>>,
        args: RecvArgs,
    ) -> LndResult;

    /// The message has to wait for credits; release whatever receive
    /// resources the driver can't hold on to for long.
    fn eager_recv(&self, _ni: &Arc<Ni>, _msg: &mut Msg) -> LnetResult<()> {
        Ok(())
    }

    /// When `nid` was last heard from, in LNet seconds.
    fn query(&self, _ni: &Ni, _nid: Nid) -> Option<u64> {
        None
    }

    /// Peer `nid` went up or down.
    fn notify(&self, _ni: &Ni, _nid: Nid, _alive: bool) {}
}

/// Credit setup of a new NI. Zero fields take the LNet defaults.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct NiConfig {
    pub credits: i32,
    pub peer_credits: i32,
    pub peer_buffer_credits: i32,
    pub peer_timeout: i32,
}

impl NiConfig {
    pub fn new(config: &LnetConfig) -> NiConfig {
        NiConfig {
            credits: config.credits,
            peer_credits: config.peer_credits,
            peer_buffer_credits: config.peer_buffer_credits,
            peer_timeout: config.peer_timeout,
        }
    }
}

pub struct Ni {
    pub(crate) nid: Nid,
    /// Position in the NI list, also the index of its per-partition TX
    /// queues.
    pub(crate) idx: usize,
    pub(crate) lnd: Arc<dyn Lnd>,
    pub(crate) maxtxcredits: i32,
    pub(crate) peertxcredits: i32,
    pub(crate) peerrtrcredits: i32,
    pub(crate) peertimeout: i32,
    last_alive: AtomicU64,
}

impl fmt::Debug for Ni {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Ni")
            .field("nid", &self.nid)
            .field("idx", &self.idx)
            .field("maxtxcredits", &self.maxtxcredits)
            .field("peertxcredits", &self.peertxcredits)
            .finish()
    }
}

impl Ni {
    pub(crate) fn new(nid: Nid, idx: usize, lnd: Arc<dyn Lnd>, cfg: &NiConfig) -> Ni {
        Ni {
            nid,
            idx,
            lnd,
            maxtxcredits: cfg.credits,
            peertxcredits: cfg.peer_credits,
            peerrtrcredits: cfg.peer_buffer_credits,
            peertimeout: cfg.peer_timeout,
            last_alive: AtomicU64::new(0),
        }
    }

    pub fn nid(&self) -> Nid {
        self.nid
    }

    pub fn peer_timeout(&self) -> i32 {
        self.peertimeout
    }

    pub fn is_loopback(&self) -> bool {
        self.nid.net().lnd_type() == LOLND
    }

    pub(crate) fn last_alive(&self) -> u64 {
        self.last_alive.load(Ordering::Relaxed)
    }

    pub(crate) fn touch(&self, now: u64) {
        if self.last_alive.load(Ordering::Relaxed) != now {
            self.last_alive.store(now, Ordering::Relaxed);
        }
    }
}

/// NI send credits of one partition.
pub(crate) struct NiTxQueue {
    pub(crate) credits: i32,
    pub(crate) mincredits: i32,
    pub(crate) maxcredits: i32,
    /// Messages waiting for a credit, oldest first.
    pub(crate) txq: VecDeque<Box<Msg>>,
}

impl NiTxQueue {
    pub(crate) fn new(credits: i32) -> NiTxQueue {
        NiTxQueue {
            credits,
            mincredits: credits,
            maxcredits: credits,
            txq: VecDeque::new(),
        }
    }
}

/// Share of `maxtx` NI credits one of `ncpt` partitions gets.
pub(crate) fn tq_credits(maxtx: i32, peertx: i32, ncpt: usize) -> i32 {
    if ncpt <= 1 {
        return maxtx;
    }
    let credits = maxtx / ncpt as i32;
    credits.max(NI_TQ_PEER_CREDITS * peertx).min(maxtx)
}

/// The loopback driver: a send is parsed straight back as a receive and
/// the payload copied over when the receive is posted.
pub struct LoLnd;

impl Lnd for LoLnd {
    fn lnd_type(&self) -> u16 {
        LOLND
    }

    fn send(&self, lnet: &LNet, ni: &Arc<Ni>, msg: Box<Msg>) -> LndResult {
        let hdr = msg.hdr;
        let private: Private = msg;
        match lnet.parse(ni, hdr, ni.nid, private, false) {
            Ok(()) => Ok(()),
            Err((e, private)) => match private.downcast::<Msg>() {
                Ok(msg) => Err((e, Some(msg))),
                Err(_) => panic!("loopback private data is not a message"),
            },
        }
    }

    fn recv(
        &self,
        lnet: &LNet,
        _ni: &Arc<Ni>,
        private: Option<Private>,
        msg: Option<Box<Msg>>,
        _args: RecvArgs,
    ) -> LndResult {
        let sendmsg = match private.map(|p| p.downcast::<Msg>()) {
            Some(Ok(sendmsg)) => sendmsg,
            _ => panic!("loopback receive without the sent message"),
        };
        if let Some(msg) = msg {
            msg.payload.copy_from(&sendmsg.payload);
            lnet.finalize(msg, Ok(()));
        }
        lnet.finalize(sendmsg, Ok(()));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tq_credits() {
        assert_eq!(tq_credits(256, 8, 1), 256);
        assert_eq!(tq_credits(256, 8, 4), 64);
        // Never less than 8 peers' worth.
        assert_eq!(tq_credits(256, 8, 16), 64);
        assert_eq!(tq_credits(32, 8, 2), 32);
    }

    #[test]
    fn test_ni_config_defaults() {
        let cfg = NiConfig::new(&LnetConfig::default());
        assert_eq!(cfg.credits, 256);
        assert_eq!(cfg.peer_credits, 8);
        let ni = Ni::new(Nid::LOOPBACK, 0, Arc::new(LoLnd), &cfg);
        assert!(ni.is_loopback());
        ni.touch(5);
        assert_eq!(ni.last_alive(), 5);
    }
}
