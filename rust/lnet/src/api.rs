// Copyright (c) Meta Platforms, Inc. and affiliates.
//
// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! # The LNet context
//!
//! Everything LNet knows lives in one `LNet`, built by `LNet::init()` and
//! torn down by `LNet::shutdown()`. It is cheap to clone and every clone
//! refers to the same instance, so LNDs and threads can each hold one.
//!
//! State is split over two scalable locks sized by the CPU partition
//! table: `net` guards peers, NIs, routes, credits and message counters,
//! `res` guards EQs, MDs, MEs and the portals. The two are never held at
//! the same time.

use crate::config::LnetConfig;
use crate::eq::EqWaitq;
use crate::error::LnetError;
use crate::error::LnetResult;
use crate::freelist::new_pool;
use crate::freelist::ObjPool;
use crate::msg::Msg;
use crate::net::Counters;
use crate::net::NetPart;
use crate::net::NetShared;
use crate::ni::tq_credits;
use crate::ni::LoLnd;
use crate::ni::Lnd;
use crate::ni::Ni;
use crate::ni::NiConfig;
use crate::ni::NiTxQueue;
use crate::res::ResPart;
use crate::res::ResShared;
use crate::types::NetId;
use crate::types::Nid;
use anyhow::anyhow;
use anyhow::Context;
use anyhow::Result;
use cfs_utils::CptTable;
use cfs_utils::LockSel;
use cfs_utils::ScaleLock;
use cfs_utils::Topology;
use rand::Rng;
use std::ops::Deref;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::Instant;

pub struct LNetState {
    pub(crate) config: LnetConfig,
    pub(crate) cptab: Arc<CptTable>,
    pub(crate) net: ScaleLock<NetPart, NetShared>,
    pub(crate) res: ScaleLock<ResPart, ResShared>,
    pub(crate) msg_pool: Mutex<Box<dyn ObjPool<Msg>>>,
    pub(crate) eq_waitq: Arc<EqWaitq>,
    /// Tells our wire handles apart from those of a previous instance.
    pub(crate) interface_cookie: u64,
    pub(crate) pid: u32,
    pub(crate) routing: AtomicBool,
    shutdown: AtomicBool,
    start: Instant,
}

/// Handle on an LNet instance.
#[derive(Clone)]
pub struct LNet(Arc<LNetState>);

impl Deref for LNet {
    type Target = LNetState;

    fn deref(&self) -> &LNetState {
        &self.0
    }
}

impl LNet {
    /// Build an LNet instance with only the loopback NI. Router buffers are
    /// set up right away when forwarding is enabled in `config`.
    pub fn init(config: LnetConfig, topo: &Topology) -> Result<LNet> {
        config.validate()?;
        let cptab = Arc::new(CptTable::cpu_init(&config.cpt, topo)?);
        let ncpt = cptab.number();
        let weights: Vec<usize> = (0..ncpt).map(|cpt| cptab.weight(Some(cpt))).collect();

        let net = ScaleLock::new(
            cptab.clone(),
            |cpt| NetPart::new(cpt, weights[cpt]),
            NetShared::default(),
        );
        // Portals live with the MEs, in the last partition.
        let res = ScaleLock::new(
            cptab.clone(),
            |cpt| {
                let nportals = if cpt == ncpt - 1 { config.nportals } else { 0 };
                ResPart::new(cpt, &config, nportals)
            },
            ResShared::new(&config),
        );

        let lnet = LNet(Arc::new(LNetState {
            msg_pool: Mutex::new(new_pool(config.use_freelist, config.max_msgs)),
            pid: config.pid,
            config,
            cptab,
            net,
            res,
            eq_waitq: Arc::new(EqWaitq::default()),
            interface_cookie: rand::thread_rng().gen(),
            routing: AtomicBool::new(false),
            shutdown: AtomicBool::new(false),
            start: Instant::now(),
        }));

        let lo_config = NiConfig {
            credits: 0,
            peer_credits: 0,
            peer_buffer_credits: 0,
            peer_timeout: 0,
        };
        lnet.add_ni(Nid::LOOPBACK, Arc::new(LoLnd), lo_config)
            .map_err(|e| anyhow!("Failed to add the loopback NI: {}", e))?;
        lnet.rtrpools_alloc(false)
            .map_err(|e| anyhow!(e))
            .context("Failed to allocate router buffers")?;

        log::info!(
            "LNet up: pid {}, {} partitions, {} portals{}",
            lnet.pid,
            ncpt,
            lnet.config.nportals,
            if lnet.config.use_freelist {
                ", freelists"
            } else {
                ""
            }
        );
        Ok(lnet)
    }

    /// Bring up a local NI with address `nid`, driven by `lnd`. Zero
    /// fields of `cfg` take the configured defaults.
    pub fn add_ni(&self, nid: Nid, lnd: Arc<dyn Lnd>, cfg: NiConfig) -> LnetResult<Arc<Ni>> {
        if self.is_shutdown() {
            return Err(LnetError::Shutdown);
        }
        let defaults = NiConfig::new(&self.config);
        let cfg = NiConfig {
            credits: if cfg.credits > 0 { cfg.credits } else { defaults.credits },
            peer_credits: if cfg.peer_credits > 0 {
                cfg.peer_credits
            } else {
                defaults.peer_credits
            },
            peer_buffer_credits: if cfg.peer_buffer_credits > 0 {
                cfg.peer_buffer_credits
            } else {
                defaults.peer_buffer_credits
            },
            peer_timeout: if cfg.peer_timeout > 0 {
                cfg.peer_timeout
            } else {
                defaults.peer_timeout
            },
        };
        if cfg.peer_credits > cfg.credits {
            log::error!(
                "{}: peer credits {} exceed NI credits {}",
                nid,
                cfg.peer_credits,
                cfg.credits
            );
            return Err(LnetError::Invalid);
        }
        if lnd.lnd_type() != nid.net().lnd_type() {
            log::error!("{}: LND of type {} can't drive it", nid, lnd.lnd_type());
            return Err(LnetError::Invalid);
        }

        let ni = {
            let mut ex = self.net.lock_exclusive();
            let ncpt = ex.number();
            let (shared, parts) = ex.split_mut();
            if shared.net2ni(nid.net()).is_some() {
                log::error!("Net {} is not unique", nid.net());
                return Err(LnetError::Invalid);
            }
            let ni = Arc::new(Ni::new(nid, shared.nis.len(), lnd, &cfg));
            let credits = tq_credits(cfg.credits, cfg.peer_credits, ncpt);
            for part in parts {
                part.ni_tx.push(NiTxQueue::new(credits));
            }
            shared.nis.push(ni.clone());
            ni
        };
        ni.touch(self.now());

        if !ni.is_loopback() {
            log::info!(
                "Added LNI {} [{}/{}/{}/{}]",
                nid,
                cfg.peer_credits,
                cfg.credits,
                cfg.peer_buffer_credits,
                cfg.peer_timeout
            );
        }
        Ok(ni)
    }

    /// Stop the instance. Lazy portals drop what they hold back, routes and
    /// router buffers go, and whatever is still around is reported.
    pub fn shutdown(&self) {
        if self.shutdown.swap(true, Ordering::AcqRel) {
            return;
        }

        for portal in 0..self.config.nportals {
            let _ = self.clear_lazy_portal(portal);
        }
        let _ = self.del_route(NetId::ANY, Nid::ANY);
        let _ = self.disable_rtrpools();

        let (mut nactive, mut npeers) = (0, 0);
        {
            let mut ex = self.net.lock_exclusive();
            for part in ex.iter_mut() {
                nactive += part.msgs.nactive;
                npeers += part.peers.cleanup();
            }
        }
        if nactive > 0 {
            log::warn!("{} messages still active on shutdown", nactive);
        }
        if npeers > 0 {
            log::warn!("{} peers still referenced on shutdown", npeers);
        }

        let (mds, mes, eqs) = self.res_counts();
        if mds + mes + eqs > 0 {
            log::warn!(
                "Leaked {} MDs, {} MEs and {} EQs on shutdown",
                mds,
                mes,
                eqs
            );
        }
        log::info!("LNet down");
    }

    /// Message statistics summed over all partitions.
    pub fn counters(&self) -> Counters {
        let mut total = Counters::default();
        for cpt in 0..self.net.number() {
            total.add(&self.net.read(LockSel::Cpt(cpt)).counters);
        }
        total
    }

    /// Seconds since the instance was built, the clock peer and NI
    /// aliveness is kept in.
    pub fn now(&self) -> u64 {
        self.start.elapsed().as_secs()
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }

    pub fn is_routing(&self) -> bool {
        self.routing.load(Ordering::Acquire)
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn config(&self) -> &LnetConfig {
        &self.config
    }

    pub fn cptab(&self) -> &Arc<CptTable> {
        &self.cptab
    }

    pub fn nis(&self) -> Vec<Arc<Ni>> {
        self.net.read(LockSel::Current).shared().nis.clone()
    }

    /// The local NI with address `nid`.
    pub fn nid2ni(&self, nid: Nid) -> Option<Arc<Ni>> {
        self.net.read(LockSel::Current).shared().nid2ni(nid).cloned()
    }

    /// Messages handed out and not yet freed.
    pub fn msgs_in_use(&self) -> usize {
        self.msg_pool
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .in_use()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cfs_utils::CptArgs;

    fn config(ncpt: i32) -> LnetConfig {
        LnetConfig {
            cpt: CptArgs {
                cpu_npartitions: ncpt,
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[test]
    fn test_init_shutdown() {
        let topo = Topology::synthetic(2, 2, 2);
        let lnet = LNet::init(config(2), &topo).unwrap();
        assert_eq!(lnet.net.number(), 2);
        assert_eq!(lnet.res.number(), 2);
        assert_eq!(lnet.nis().len(), 1);
        assert!(lnet.nis()[0].is_loopback());
        assert!(!lnet.is_routing());
        // Only the matching partition carries portals.
        assert!(lnet.res.read(LockSel::Cpt(0)).portals.is_empty());
        assert_eq!(
            lnet.res.read(LockSel::Cpt(1)).portals.len(),
            lnet.config.nportals
        );
        lnet.shutdown();
        assert!(lnet.is_shutdown());
        assert_eq!(
            lnet.add_ni(Nid::LOOPBACK, Arc::new(LoLnd), NiConfig::default())
                .unwrap_err(),
            LnetError::Shutdown
        );
    }

    #[test]
    fn test_duplicate_net() {
        let topo = Topology::synthetic(1, 2, 1);
        let lnet = LNet::init(config(1), &topo).unwrap();
        assert_eq!(
            lnet.add_ni(Nid::LOOPBACK, Arc::new(LoLnd), NiConfig::default())
                .unwrap_err(),
            LnetError::Invalid
        );
        lnet.shutdown();
    }

    #[test]
    fn test_forwarding_enabled_allocates_pools() {
        let topo = Topology::synthetic(1, 2, 1);
        let mut config = config(1);
        config.forwarding = "enabled".to_string();
        config.tiny_router_buffers = 8;
        config.small_router_buffers = 8;
        config.large_router_buffers = 8;
        let lnet = LNet::init(config, &topo).unwrap();
        assert!(lnet.is_routing());
        assert_eq!(lnet.net.read(LockSel::Cpt(0)).rtrpools.len(), 3);
        lnet.shutdown();
        assert!(!lnet.is_routing());
    }
}
