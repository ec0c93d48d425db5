// Copyright (c) Meta Platforms, Inc. and affiliates.
//
// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! lnetsim: push bulk traffic through LNet and schedule it with NRS.
//!
//! Three LNet instances share one in-memory wire: a client on `gni`, a
//! router joining `gni` and `gni1`, and a server on `gni1`. Client threads
//! PUT and GET against a buffer the server exposes on a portal; every
//! completed transfer the server sees turns into a bulk I/O request on an
//! `ost_io` NRS service, whose handler threads serve them. With
//! `--switch-ms` the primary policy keeps changing under the load.

mod wire;
use wire::Wire;

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use std::time::Instant;

use anyhow::anyhow;
use anyhow::bail;
use anyhow::Context;
use anyhow::Result;
use cfs_utils::Topology;
use clap::Parser;
use lnet::md::MD_MANAGE_REMOTE;
use lnet::md::MD_OP_GET;
use lnet::md::MD_OP_PUT;
use lnet::md::MD_THRESH_INF;
use lnet::AckReq;
use lnet::EqHandle;
use lnet::Event;
use lnet::EventKind;
use lnet::InsPos;
use lnet::IoBuf;
use lnet::LNet;
use lnet::LnetConfig;
use lnet::MdDesc;
use lnet::NiConfig;
use lnet::Nid;
use lnet::ProcessId;
use lnet::Unlink;
use log::info;
use ptlrpc_nrs::orr::OST_IO_SERVICE;
use ptlrpc_nrs::CtlOp;
use ptlrpc_nrs::ExtentTable;
use ptlrpc_nrs::Niobuf;
use ptlrpc_nrs::QueueType;
use ptlrpc_nrs::Request;
use ptlrpc_nrs::Service;
use ptlrpc_nrs::ServiceConf;
use rand::Rng;

const PORTAL: usize = 8;
const CLIENT_NID: &str = "1@gni";
const ROUTER_NIDS: [&str; 2] = ["2@gni", "2@gni1"];
const SERVER_NID: &str = "3@gni1";
/// Policies cycled through by `--switch-ms`.
const ROTATION: [&str; 3] = ["orr", "trr", "fifo"];
/// Blocks per simulated object.
const OBJECT_BLOCKS: u64 = 64;
/// How long to wait for in-flight traffic once the clients are done.
const SETTLE_TIMEOUT: Duration = Duration::from_secs(10);

/// lnetsim: drive LNet messaging and routing over an in-memory network and
/// feed what arrives to the NRS policies of an ost_io service.
#[derive(Debug, Parser)]
struct Opts {
    /// Read the LNet tunables from a JSON file instead of the command line.
    #[clap(short = 'c', long)]
    config: Option<PathBuf>,

    /// Client threads.
    #[clap(short = 't', long, default_value = "4")]
    threads: usize,

    /// Transfers per client thread.
    #[clap(short = 'n', long, default_value = "1000")]
    count: u64,

    /// Bytes per transfer.
    #[clap(short = 's', long, default_value = "4096")]
    size: u32,

    /// Percentage of transfers that are GETs rather than PUTs.
    #[clap(long, default_value = "50")]
    get_pct: u32,

    /// Number of backend objects the transfers are spread over.
    #[clap(long, default_value = "16")]
    objects: u64,

    /// Number of OSTs the objects are spread over.
    #[clap(long, default_value = "2")]
    osts: u32,

    /// Threads moving packets over the wire.
    #[clap(long, default_value = "2")]
    wire_threads: usize,

    /// NRS policy to start with.
    #[clap(short = 'p', long, default_value = "orr")]
    policy: String,

    /// Switch to the next NRS policy this often, 0 to stay put.
    #[clap(long, default_value = "0")]
    switch_ms: u64,

    /// ORR and TRR quantum.
    #[clap(long)]
    quantum: Option<u16>,

    /// ORR and TRR offset type, "physical" or "logical".
    #[clap(long)]
    offset_type: Option<String>,

    /// Requests ORR and TRR handle: "read", "write" or "readwrite".
    #[clap(long)]
    supported: Option<String>,

    /// Print the LNet tunables in use as JSON and exit.
    #[clap(long, action = clap::ArgAction::SetTrue)]
    dump_config: bool,

    /// Enable verbose output. Specify multiple times to increase verbosity.
    #[clap(short = 'v', long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[clap(flatten)]
    lnet: LnetConfig,
}

impl Opts {
    fn validate(&self) -> Result<()> {
        if self.threads == 0 || self.wire_threads == 0 {
            bail!("--threads and --wire-threads must be positive");
        }
        if self.size == 0 {
            bail!("--size must be positive");
        }
        if self.get_pct > 100 {
            bail!("--get-pct must be in 0..=100, got {}", self.get_pct);
        }
        if self.objects == 0 || self.objects > u16::MAX as u64 {
            bail!("--objects must be in 1..={}", u16::MAX);
        }
        if self.osts == 0 || self.osts > u16::MAX as u32 {
            bail!("--osts must be in 1..={}", u16::MAX);
        }
        Ok(())
    }
}

/// Match bits of a transfer: object in bits 0-15, OST in 16-31, block
/// above.
fn pack_bits(object: u64, ost: u32, block: u64) -> u64 {
    (block << 32) | ((ost as u64) << 16) | object
}

fn unpack_bits(bits: u64) -> (u64, u32, u64) {
    (bits & 0xffff, ((bits >> 16) & 0xffff) as u32, bits >> 32)
}

/// The bulk I/O request a server event stands for.
fn event_request(xid: u64, ev: &Event) -> Option<Request> {
    let write = match ev.kind {
        EventKind::Put => true,
        EventKind::Get => false,
        _ => return None,
    };
    let (object, ost, block) = unpack_bits(ev.match_bits);
    let niobuf = Niobuf {
        offset: block * ev.rlength as u64,
        len: ev.mlength,
    };
    let mut req = Request::brw(xid, write, ost, object, vec![niobuf]);
    req.peer = ev.initiator.nid.to_string();
    Some(req)
}

#[derive(Default)]
struct Stats {
    puts: AtomicU64,
    gets: AtomicU64,
    failed: AtomicU64,
    events: AtomicU64,
    overflows: AtomicU64,
    served: AtomicU64,
    switches: AtomicU64,
}

struct Sim {
    wire: Arc<Wire>,
    client: LNet,
    router: LNet,
    server: LNet,
    server_eq: EqHandle,
    service: Service,
    stats: Stats,
}

impl Sim {
    fn init(opts: &Opts, config: LnetConfig, topo: &Topology) -> Result<Sim> {
        let mut rconfig = config.clone();
        rconfig.forwarding = "enabled".to_string();

        let client = LNet::init(config.clone(), topo).context("Failed to set up the client")?;
        let router = LNet::init(rconfig, topo).context("Failed to set up the router")?;
        let server = LNet::init(config.clone(), topo).context("Failed to set up the server")?;

        let wire = Wire::new();
        let cfg = NiConfig::new(&config);
        wire.attach(&client, CLIENT_NID, cfg)?;
        for nid in ROUTER_NIDS {
            wire.attach(&router, nid, cfg)?;
        }
        wire.attach(&server, SERVER_NID, cfg)?;

        client
            .add_route("gni1".parse()?, 1, ROUTER_NIDS[0].parse()?)
            .context("Failed to add the client route")?;
        server
            .add_route("gni".parse()?, 1, ROUTER_NIDS[1].parse()?)
            .context("Failed to add the server route")?;
        for lnet in [&client, &server] {
            lnet.check_routes().context("Route check failed")?;
        }

        // One buffer serves every PUT and GET at the offset the client
        // asks for.
        let server_eq = server
            .eq_alloc(4096, None)
            .context("Failed to allocate the server event queue")?;
        let meh = server
            .me_attach(PORTAL, ProcessId::ANY, 0, u64::MAX, Unlink::Retain, InsPos::After)
            .context("Failed to attach the server ME")?;
        let desc = MdDesc {
            eq: server_eq,
            ..MdDesc::contiguous(
                IoBuf::new(opts.size as usize),
                MD_THRESH_INF,
                MD_OP_PUT | MD_OP_GET | MD_MANAGE_REMOTE,
            )
        };
        server
            .md_attach(meh, &desc, Unlink::Retain)
            .context("Failed to attach the server MD")?;

        let extents = Arc::new(ExtentTable::new());
        let object_bytes = OBJECT_BLOCKS * opts.size as u64;
        for object in 0..opts.objects {
            let ost = (object % opts.osts as u64) as u32;
            // Objects sit on disk in reverse order.
            let physical = (opts.objects - 1 - object) * object_bytes;
            extents.map(ost, object, 0, physical, object_bytes);
        }
        let service = Service::setup(
            ServiceConf {
                name: OST_IO_SERVICE.to_string(),
                hp: false,
                mapper: Some(extents),
            },
            server.cptab().clone(),
        )?;

        Ok(Sim {
            wire,
            client,
            router,
            server,
            server_eq,
            service,
            stats: Stats::default(),
        })
    }

    fn configure_nrs(&self, opts: &Opts) -> Result<()> {
        let mut ops = vec![];
        if let Some(quantum) = opts.quantum {
            ops.push(CtlOp::WrQuantum(quantum));
        }
        if let Some(offset_type) = &opts.offset_type {
            ops.push(CtlOp::WrOffType(offset_type.clone()));
        }
        if let Some(supported) = &opts.supported {
            ops.push(CtlOp::WrSuppReq(supported.clone()));
        }
        for name in ["orr", "trr"] {
            for op in ops.iter() {
                self.service
                    .policy_ctl_all(QueueType::Reg, name, op)
                    .map_err(|e| anyhow!("{} {:?}: {}", name, op, e))?;
            }
        }
        self.service
            .policy_ctl_all(QueueType::Reg, &opts.policy, &CtlOp::Start)
            .map_err(|e| anyhow!("Failed to start NRS policy {}: {}", opts.policy, e))?;
        info!("NRS policy {} started", opts.policy);
        Ok(())
    }

    /// Issue `opts.count` transfers to the server.
    fn client(&self, opts: &Opts, shutdown: &AtomicBool) -> Result<()> {
        let mut rng = rand::thread_rng();
        let target = ProcessId::new(SERVER_NID.parse()?, self.server.pid());

        for _ in 0..opts.count {
            if shutdown.load(Ordering::Relaxed) {
                break;
            }
            let object = rng.gen_range(0..opts.objects);
            let ost = (object % opts.osts as u64) as u32;
            let bits = pack_bits(object, ost, rng.gen_range(0..OBJECT_BLOCKS));
            let get = rng.gen_range(0..100) < opts.get_pct;

            let (buf, threshold) = if get {
                (IoBuf::new(opts.size as usize), 2)
            } else {
                (IoBuf::from_vec(vec![object as u8; opts.size as usize]), 1)
            };
            let desc = MdDesc::contiguous(buf, threshold, 0);
            let mdh = match self.client.md_bind(&desc, Unlink::Unlink) {
                Ok(mdh) => mdh,
                Err(e) => {
                    log::debug!("md_bind: {}", e);
                    self.stats.failed.fetch_add(1, Ordering::Relaxed);
                    thread::yield_now();
                    continue;
                }
            };
            let res = if get {
                self.client.get(Nid::ANY, mdh, target, PORTAL as u32, bits, 0)
            } else {
                self.client
                    .put(Nid::ANY, mdh, AckReq::NoAck, target, PORTAL as u32, bits, 0, 0)
            };
            match res {
                Ok(()) if get => self.stats.gets.fetch_add(1, Ordering::Relaxed),
                Ok(()) => self.stats.puts.fetch_add(1, Ordering::Relaxed),
                Err(e) => {
                    log::debug!("{} {:#x}: {}", if get { "GET" } else { "PUT" }, bits, e);
                    let _ = self.client.md_unlink(mdh);
                    self.stats.failed.fetch_add(1, Ordering::Relaxed)
                }
            };
        }
        Ok(())
    }

    /// Turn server events into NRS requests until `done` is set and the
    /// queue is empty.
    fn dispatch(&self, done: &AtomicBool) -> Result<()> {
        let parts = self.service.parts();
        let mut xid = 0;
        loop {
            let polled = self
                .server
                .eq_poll(&[self.server_eq], Some(Duration::from_millis(20)))
                .map_err(|e| anyhow!("Server event queue: {}", e))?;
            let polled = match polled {
                Some(polled) => polled,
                None if done.load(Ordering::Acquire) => return Ok(()),
                None => continue,
            };
            if polled.overflowed {
                self.stats.overflows.fetch_add(1, Ordering::Relaxed);
            }
            self.stats.events.fetch_add(1, Ordering::Relaxed);
            xid += 1;
            if let Some(req) = event_request(xid, &polled.event) {
                let (object, _, _) = unpack_bits(polled.event.match_bits);
                let part = &parts[(object % parts.len() as u64) as usize];
                let id = part.req_initialize(req);
                part.req_add(id, false);
            }
        }
    }

    /// Serve requests of partition `cpt` until `done` is set and nothing
    /// is pending.
    fn handle(&self, cpt: usize, done: &AtomicBool) -> HashMap<&'static str, u64> {
        let mut served = HashMap::new();
        let part = &self.service.parts()[cpt];
        loop {
            let id = match part.next_request(false) {
                Some(id) => id,
                None if done.load(Ordering::Acquire) && !part.req_pending(false) => break,
                None => {
                    thread::sleep(Duration::from_millis(1));
                    continue;
                }
            };
            if let Some(policy) = part.req_policy(id) {
                *served.entry(policy).or_insert(0) += 1;
            }
            part.req_stop(id);
            part.req_finalize(id);
            self.stats.served.fetch_add(1, Ordering::Relaxed);
        }
        served
    }

    fn rotate_policies(&self, first: &str, interval: Duration, done: &AtomicBool) {
        let mut next = ROTATION.iter().position(|p| *p == first).unwrap_or(0);
        while !done.load(Ordering::Acquire) {
            thread::sleep(interval);
            next = (next + 1) % ROTATION.len();
            match self
                .service
                .policy_ctl_all(QueueType::Reg, ROTATION[next], &CtlOp::Start)
            {
                Ok(_) => {
                    log::debug!("Switched NRS policy to {}", ROTATION[next]);
                    self.stats.switches.fetch_add(1, Ordering::Relaxed);
                }
                Err(e) => log::debug!("Can't switch to {}: {}", ROTATION[next], e),
            }
        }
    }

    /// Wait for the wire and every instance to go quiet.
    fn settle(&self) -> bool {
        let deadline = Instant::now() + SETTLE_TIMEOUT;
        while Instant::now() < deadline {
            let busy = [&self.client, &self.router, &self.server]
                .iter()
                .any(|lnet| lnet.msgs_in_use() > 0);
            if !busy && self.wire.is_idle() {
                return true;
            }
            thread::sleep(Duration::from_millis(5));
        }
        false
    }

    fn run(&self, opts: &Opts, shutdown: &AtomicBool) -> Result<HashMap<&'static str, u64>> {
        let wire_stop = AtomicBool::new(false);
        let traffic_done = AtomicBool::new(false);
        let nrs_done = AtomicBool::new(false);
        let mut served: HashMap<&'static str, u64> = HashMap::new();

        thread::scope(|s| -> Result<()> {
            for _ in 0..opts.wire_threads {
                s.spawn(|| self.wire.pump(&wire_stop));
            }
            let dispatcher = s.spawn(|| self.dispatch(&traffic_done));
            let handlers: Vec<_> = (0..self.service.parts().len())
                .map(|cpt| {
                    let nrs_done = &nrs_done;
                    s.spawn(move || self.handle(cpt, nrs_done))
                })
                .collect();
            if opts.switch_ms > 0 {
                let interval = Duration::from_millis(opts.switch_ms);
                let nrs_done = &nrs_done;
                s.spawn(move || self.rotate_policies(&opts.policy, interval, nrs_done));
            }

            let clients: Vec<_> = (0..opts.threads)
                .map(|_| s.spawn(|| self.client(opts, shutdown)))
                .collect();
            let mut res = Ok(());
            for client in clients {
                match client.join() {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => res = Err(e),
                    Err(_) => res = Err(anyhow!("Client thread panicked")),
                }
            }
            if !self.settle() {
                log::warn!("Traffic did not settle in {:?}", SETTLE_TIMEOUT);
            }

            traffic_done.store(true, Ordering::Release);
            match dispatcher.join() {
                Ok(Ok(())) => {}
                Ok(Err(e)) => res = Err(e),
                Err(_) => res = Err(anyhow!("Dispatcher panicked")),
            }
            nrs_done.store(true, Ordering::Release);
            for handler in handlers {
                match handler.join() {
                    Ok(part_served) => {
                        for (policy, n) in part_served {
                            *served.entry(policy).or_insert(0) += n;
                        }
                    }
                    Err(_) => res = Err(anyhow!("Handler thread panicked")),
                }
            }
            wire_stop.store(true, Ordering::Relaxed);
            res
        })?;
        Ok(served)
    }

    fn report(&self, served: &HashMap<&'static str, u64>, elapsed: Duration) -> Result<()> {
        let s = &self.stats;
        let transfers = s.puts.load(Ordering::Relaxed) + s.gets.load(Ordering::Relaxed);
        info!(
            "{} transfers ({} PUT, {} GET, {} failed) in {:.2}s",
            transfers,
            s.puts.load(Ordering::Relaxed),
            s.gets.load(Ordering::Relaxed),
            s.failed.load(Ordering::Relaxed),
            elapsed.as_secs_f64()
        );
        let wire = self.wire.stats();
        info!(
            "wire: {} delivered, {} dropped, {} refused",
            wire.delivered, wire.dropped, wire.refused
        );
        info!(
            "server: {} events ({} overflows), {} requests served, {} policy switches",
            s.events.load(Ordering::Relaxed),
            s.overflows.load(Ordering::Relaxed),
            s.served.load(Ordering::Relaxed),
            s.switches.load(Ordering::Relaxed)
        );

        let mut by_policy: Vec<_> = served.iter().collect();
        by_policy.sort();
        for (policy, n) in by_policy {
            info!("nrs: {} served {}", policy, n);
        }

        for (name, lnet) in [
            ("client", &self.client),
            ("router", &self.router),
            ("server", &self.server),
        ] {
            println!("{} stats: {}", name, lnet.read_stats().trim_end());
            println!("{}", serde_json::to_string(&lnet.counters())?);
        }
        println!("{}", self.router.read_buffers().trim_end());
        for part in self.service.parts() {
            let policies = part
                .policies_info(QueueType::Reg)
                .map_err(|e| anyhow!("cpt {} policies: {}", part.cpt(), e))?;
            println!(
                "cpt {} policies: {}",
                part.cpt(),
                serde_json::to_string(&policies)?
            );
        }
        Ok(())
    }

    fn shutdown(&self) {
        self.service.cleanup();
        for lnet in [&self.client, &self.router, &self.server] {
            lnet.shutdown();
        }
    }
}

fn main() -> Result<()> {
    let opts = Opts::parse();

    let llv = match opts.verbose {
        0 => simplelog::LevelFilter::Info,
        1 => simplelog::LevelFilter::Debug,
        _ => simplelog::LevelFilter::Trace,
    };
    let mut lcfg = simplelog::ConfigBuilder::new();
    lcfg.set_time_level(simplelog::LevelFilter::Error)
        .set_location_level(simplelog::LevelFilter::Off)
        .set_target_level(simplelog::LevelFilter::Off)
        .set_thread_level(simplelog::LevelFilter::Off);
    simplelog::TermLogger::init(
        llv,
        lcfg.build(),
        simplelog::TerminalMode::Stderr,
        simplelog::ColorChoice::Auto,
    )?;

    opts.validate()?;
    let config = match &opts.config {
        Some(path) => LnetConfig::from_json_file(path)?,
        None => {
            opts.lnet.validate()?;
            opts.lnet.clone()
        }
    };
    if opts.dump_config {
        println!("{}", config.to_json()?);
        return Ok(());
    }

    let shutdown = Arc::new(AtomicBool::new(false));
    let shutdown_clone = shutdown.clone();
    ctrlc::set_handler(move || {
        shutdown_clone.store(true, Ordering::Relaxed);
    })
    .context("Error setting Ctrl-C handler")?;

    let topo = Topology::new()?;
    let sim = Sim::init(&opts, config, &topo)?;
    sim.configure_nrs(&opts)?;

    let started = Instant::now();
    let served = sim.run(&opts, &shutdown)?;
    sim.report(&served, started.elapsed())?;
    sim.shutdown();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_match_bits() {
        let bits = pack_bits(0x1234, 7, 63);
        assert_eq!(unpack_bits(bits), (0x1234, 7, 63));
        assert_eq!(unpack_bits(pack_bits(0, 0, 0)), (0, 0, 0));
    }

    #[test]
    fn test_opts() {
        let opts = Opts::parse_from(["lnetsim", "-t", "2", "--objects", "4", "--peer-credits", "4"]);
        assert_eq!(opts.threads, 2);
        assert_eq!(opts.lnet.peer_credits, 4);
        assert!(opts.validate().is_ok());
        assert!(opts.lnet.validate().is_ok());

        let opts = Opts::parse_from(["lnetsim", "--get-pct", "101"]);
        assert!(opts.validate().is_err());
        let opts = Opts::parse_from(["lnetsim", "--objects", "0"]);
        assert!(opts.validate().is_err());
    }
}
