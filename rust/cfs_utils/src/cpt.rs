// Copyright (c) Meta Platforms, Inc. and affiliates.
//
// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! # CPU partition table
//!
//! A CptTable groups the online CPUs of a Topology into a fixed number of
//! disjoint partitions. Each partition owns a Cpumask, the Nodemask of the
//! NUMA nodes its CPUs live on, and a rotor used to spread allocations over
//! those nodes. A CPU belongs to at most one partition.
//!
//! Tables are built once, either from a partition count or from a pattern:
//!
//!```
//!     use cfs_utils::{CptTable, Topology};
//!     let topo = Topology::synthetic(1, 4, 1);
//!     let cptab = CptTable::create_pattern("0[0,1] 1[2,3]", &topo).unwrap();
//!     assert_eq!(cptab.number(), 2);
//!     assert_eq!(cptab.of_cpu(3), Some(1));
//!     assert_eq!(cptab.print(), "0\t: 0 1\n1\t: 2 3\n");
//!```
//!
//! Partition selectors that accept "any partition" take an `Option<usize>`,
//! `None` standing for the whole table.

use crate::expr_list::ExprList;
use crate::topology::current_cpu;
use crate::CptArgs;
use crate::Cpumask;
use crate::Nodemask;
use crate::Topology;
use anyhow::bail;
use anyhow::Context;
use anyhow::Result;
use log::debug;
use log::info;
use log::warn;
use sscanf::sscanf;
use std::fmt::Write;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;

/// Partitions with at most this many CPUs are never split further.
pub const CPT_WEIGHT_MIN: usize = 4;

#[derive(Debug)]
pub struct CptPartition {
    cpumask: Cpumask,
    nodemask: Nodemask,
    node: Option<usize>,
    rotor: AtomicUsize,
}

impl CptPartition {
    fn new(topo: &Topology) -> CptPartition {
        CptPartition {
            cpumask: Cpumask::new(topo.nr_cpus()),
            nodemask: Nodemask::new(topo.nr_nodes()),
            node: None,
            rotor: AtomicUsize::new(0),
        }
    }
}

/// Hotplug events delivered to `CptTable::cpu_notify()`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CpuAction {
    Online,
    Dead,
}

#[derive(Debug)]
pub struct CptTable {
    topo: Topology,
    parts: Vec<CptPartition>,
    cpumask: Cpumask,
    nodemask: Nodemask,
    cpu2cpt: Vec<Option<usize>>,
    rotor: AtomicUsize,
    version: AtomicU64,
}

impl CptTable {
    /// Allocate a table of `ncpt` empty partitions over `topo`.
    pub fn alloc(ncpt: usize, topo: &Topology) -> CptTable {
        CptTable {
            topo: topo.clone(),
            parts: (0..ncpt).map(|_| CptPartition::new(topo)).collect(),
            cpumask: Cpumask::new(topo.nr_cpus()),
            nodemask: Nodemask::new(topo.nr_nodes()),
            cpu2cpt: vec![None; topo.nr_cpus()],
            rotor: AtomicUsize::new(0),
            version: AtomicU64::new(0),
        }
    }

    /// Number of partitions.
    pub fn number(&self) -> usize {
        self.parts.len()
    }

    pub fn topology(&self) -> &Topology {
        &self.topo
    }

    fn scope_cpumask(&self, cpt: Option<usize>) -> &Cpumask {
        match cpt {
            None => &self.cpumask,
            Some(cpt) => &self.parts[cpt].cpumask,
        }
    }

    /// Number of CPUs in partition `cpt`, or in the whole table.
    ///
    /// # Panics
    ///
    /// Panics if `cpt` is out of range.
    pub fn weight(&self, cpt: Option<usize>) -> usize {
        self.scope_cpumask(cpt).weight()
    }

    /// Whether partition `cpt` (or the table) has at least one online CPU.
    pub fn online(&self, cpt: Option<usize>) -> bool {
        self.scope_cpumask(cpt).intersects(self.topo.online_mask())
    }

    pub fn cpumask(&self, cpt: usize) -> &Cpumask {
        &self.parts[cpt].cpumask
    }

    pub fn nodemask(&self, cpt: usize) -> &Nodemask {
        &self.parts[cpt].nodemask
    }

    /// Partition `cpu` is assigned to.
    pub fn of_cpu(&self, cpu: usize) -> Option<usize> {
        self.cpu2cpt.get(cpu).copied().flatten()
    }

    /// Add `cpu` to partition `cpt`. Fails if the partition is out of
    /// range, the CPU is offline or the CPU already belongs to a partition.
    pub fn set_cpu(&mut self, cpt: usize, cpu: usize) -> bool {
        if cpt >= self.parts.len() {
            debug!("Invalid partition {} for CPU {}", cpt, cpu);
            return false;
        }
        if cpu >= self.cpu2cpt.len() || !self.topo.cpu_online(cpu) {
            debug!("CPU {} is invalid or it's offline", cpu);
            return false;
        }
        if let Some(owner) = self.cpu2cpt[cpu] {
            debug!("CPU {} is already in partition {}", cpu, owner);
            return false;
        }

        assert!(!self.cpumask.test_cpu(cpu));
        assert!(!self.parts[cpt].cpumask.test_cpu(cpu));
        self.cpu2cpt[cpu] = Some(cpt);
        let _ = self.cpumask.set_cpu(cpu);
        let _ = self.parts[cpt].cpumask.set_cpu(cpu);

        let node = self.topo.cpu_to_node(cpu);
        // First CPU of the node in the table and in the partition.
        if !self.nodemask.test_node(node) {
            let _ = self.nodemask.set_node(node);
        }
        let part = &mut self.parts[cpt];
        if !part.nodemask.test_node(node) {
            let _ = part.nodemask.set_node(node);
            if part.node.is_none() {
                part.node = Some(node);
            }
        }
        true
    }

    /// Remove `cpu` from partition `cpt`, or from whatever partition holds
    /// it when `cpt` is `None`.
    pub fn unset_cpu(&mut self, cpt: Option<usize>, cpu: usize) {
        if cpu >= self.cpu2cpt.len() {
            debug!("Invalid CPU id {}", cpu);
            return;
        }
        let cpt = match (cpt, self.cpu2cpt[cpu]) {
            (None, None) => {
                debug!("Try to unset cpu {} which is not in CPT-table", cpu);
                return;
            }
            (None, Some(owner)) => owner,
            (Some(cpt), owner) if owner != Some(cpt) => {
                debug!("CPU {} is not in cpu-partition {}", cpu, cpt);
                return;
            }
            (Some(cpt), _) => cpt,
        };

        assert!(self.cpumask.test_cpu(cpu));
        assert!(self.parts[cpt].cpumask.test_cpu(cpu));
        let _ = self.cpumask.clear_cpu(cpu);
        let _ = self.parts[cpt].cpumask.clear_cpu(cpu);
        self.cpu2cpt[cpu] = None;

        let node = self.topo.cpu_to_node(cpu);
        assert!(self.parts[cpt].nodemask.test_node(node));
        assert!(self.nodemask.test_node(node));

        let topo = &self.topo;
        let part = &mut self.parts[cpt];
        if !part.cpumask.iter().any(|i| topo.cpu_to_node(i) == node) {
            let _ = part.nodemask.clear_node(node);
            if part.node == Some(node) {
                part.node = part.nodemask.first();
            }
        }
        if !self.cpumask.iter().any(|i| topo.cpu_to_node(i) == node) {
            let _ = self.nodemask.clear_node(node);
        }
    }

    /// Add every online CPU of `mask` to partition `cpt`. Nothing is changed
    /// on failure.
    pub fn set_cpumask(&mut self, cpt: usize, mask: &Cpumask) -> bool {
        if mask.is_empty() || !mask.intersects(self.topo.online_mask()) {
            warn!(
                "No online CPU is found in the CPU mask for CPU partition {}",
                cpt
            );
            return false;
        }

        let mut added = vec![];
        for cpu in mask.iter() {
            if !self.topo.cpu_online(cpu) {
                continue;
            }
            if !self.set_cpu(cpt, cpu) {
                for cpu in added {
                    self.unset_cpu(Some(cpt), cpu);
                }
                return false;
            }
            added.push(cpu);
        }
        true
    }

    pub fn unset_cpumask(&mut self, cpt: Option<usize>, mask: &Cpumask) {
        for cpu in mask.iter() {
            self.unset_cpu(cpt, cpu);
        }
    }

    /// Add all CPUs of NUMA `node` to partition `cpt`.
    pub fn set_node(&mut self, cpt: usize, node: usize) -> bool {
        if node >= self.topo.nr_nodes() {
            debug!("Invalid NUMA id {} for CPU partition {}", node, cpt);
            return false;
        }
        let mask = self.topo.node_cpus(node);
        if !self.set_cpumask(cpt, &mask) {
            return false;
        }
        self.parts[cpt].node = Some(node);
        true
    }

    pub fn unset_node(&mut self, cpt: Option<usize>, node: usize) {
        if node >= self.topo.nr_nodes() {
            debug!("Invalid NUMA id {}", node);
            return;
        }
        let mask = self.topo.node_cpus(node);
        self.unset_cpumask(cpt, &mask);
    }

    pub fn set_nodemask(&mut self, cpt: usize, mask: &Nodemask) -> bool {
        let mut added = vec![];
        for node in mask.iter() {
            if !self.set_node(cpt, node) {
                for node in added {
                    self.unset_node(Some(cpt), node);
                }
                return false;
            }
            added.push(node);
        }
        true
    }

    pub fn unset_nodemask(&mut self, cpt: Option<usize>, mask: &Nodemask) {
        for node in mask.iter() {
            self.unset_node(cpt, node);
        }
    }

    /// Remove every CPU from partition `cpt`.
    pub fn clear(&mut self, cpt: usize) {
        let mask = self.parts[cpt].cpumask.clone();
        self.unset_cpumask(Some(cpt), &mask);
    }

    /// Pick a NUMA node of partition `cpt` (or of the table), a different
    /// one on each call when several are available.
    pub fn spread_node(&self, cpt: Option<usize>) -> usize {
        let (mask, rotor, fallback) = match cpt {
            None => (&self.nodemask, &self.rotor, 0),
            Some(cpt) => {
                let part = &self.parts[cpt];
                (&part.nodemask, &part.rotor, part.node.unwrap_or(0))
            }
        };
        let weight = mask.weight();
        if weight == 0 {
            return fallback;
        }
        let rotor = rotor.fetch_add(1, Ordering::Relaxed) % weight;
        mask.nth(rotor).unwrap_or(fallback)
    }

    /// Partition of `cpu`. Unassigned CPUs map to `cpu % number()` when
    /// `remap` is set.
    pub fn current_of(&self, cpu: usize, remap: bool) -> Option<usize> {
        match self.of_cpu(cpu) {
            Some(cpt) => Some(cpt),
            None if remap && !self.parts.is_empty() => Some(cpu % self.parts.len()),
            None => None,
        }
    }

    /// Partition of the CPU the caller runs on.
    pub fn current(&self, remap: bool) -> Option<usize> {
        self.current_of(current_cpu(), remap)
    }

    /// Restrict the calling thread to the CPUs of partition `cpt` (or of the
    /// whole table).
    pub fn bind(&self, cpt: Option<usize>) -> Result<()> {
        let mask = self.scope_cpumask(cpt);
        if !mask.intersects(self.topo.online_mask()) {
            bail!(
                concat!(
                    "No online CPU found in CPU partition {:?}, did someone do CPU hotplug",
                    " on system? You might need to reload the stack to keep system working well."
                ),
                cpt
            );
        }

        // Nothing to restrict if the mask already covers every online CPU.
        if self.topo.online_mask().iter().all(|cpu| mask.test_cpu(cpu)) {
            return Ok(());
        }

        let mut set = unsafe { std::mem::zeroed::<libc::cpu_set_t>() };
        for cpu in mask.iter() {
            unsafe { libc::CPU_SET(cpu, &mut set) };
        }
        let rc =
            unsafe { libc::sched_setaffinity(0, std::mem::size_of::<libc::cpu_set_t>(), &set) };
        if rc != 0 {
            return Err(std::io::Error::last_os_error())
                .with_context(|| format!("Failed to bind to CPU partition {:?}", cpt));
        }
        Ok(())
    }

    /// One line per partition: the partition id, a tab, a colon and its CPUs.
    pub fn print(&self) -> String {
        let mut buf = String::new();
        for (cpt, part) in self.parts.iter().enumerate() {
            let _ = write!(buf, "{}\t:", cpt);
            for cpu in part.cpumask.iter() {
                let _ = write!(buf, " {}", cpu);
            }
            buf.push('\n');
        }
        buf
    }

    /// Hotplug counter, bumped on every CPU online/dead notification.
    pub fn version(&self) -> u64 {
        self.version.load(Ordering::Acquire)
    }

    /// Record a CPU hotplug event. The table layout is not rebalanced.
    /// `topo` is the topology after the event.
    pub fn cpu_notify(&self, cpu: usize, action: CpuAction, topo: &Topology) {
        match action {
            CpuAction::Dead => {
                // All HTs of a core offline may break affinity.
                let siblings = topo.thread_siblings(cpu);
                if !siblings.intersects(topo.online_mask()) {
                    warn!(
                        "Can't support CPU plug-out well now, performance and stability could be impacted [CPU {}]",
                        cpu
                    );
                } else {
                    info!("CPU {} went offline", cpu);
                }
            }
            CpuAction::Online => debug!("CPU {} came online", cpu),
        }
        self.version.fetch_add(1, Ordering::AcqRel);
    }

    /// Suggested number of partitions for `topo`.
    pub fn estimate_count(topo: &Topology) -> usize {
        let ncpu = topo.nr_online_cpus();
        let mut nnode = topo.online_nodes().weight().max(1);

        let mut ncpt = if ncpu <= CPT_WEIGHT_MIN {
            1
        } else {
            // Power of two N with 2 * (N - 1)^2 < NCPUS <= 2 * N^2.
            let mut ncpt = 2;
            while ncpu > 2 * ncpt * ncpt {
                ncpt <<= 1;
            }

            if ncpt <= nnode {
                // fat numa system
                while nnode > ncpt {
                    nnode >>= 1;
                }
            } else {
                while (nnode << 1) <= ncpt {
                    nnode <<= 1;
                }
            }
            nnode
        };

        if cfg!(target_pointer_width = "32") {
            ncpt = ncpt.min(2);
        }

        while ncpt > 1 && ncpu % ncpt != 0 {
            ncpt -= 1;
        }
        ncpt.max(1)
    }

    /// Assign up to `number` CPUs from `node_mask` to partition `cpt`,
    /// keeping hardware threads of a core and cores of a package together.
    /// Assigned CPUs are removed from `node_mask`.
    fn choose_ncpus(&mut self, cpt: usize, node_mask: &mut Cpumask, mut number: usize) -> Result<()> {
        if number >= node_mask.weight() {
            while let Some(cpu) = node_mask.first() {
                if !self.set_cpu(cpt, cpu) {
                    bail!("Failed to add CPU {} to partition {}", cpu, cpt);
                }
                node_mask.clear_cpu(cpu)?;
            }
            return Ok(());
        }

        while let Some(first) = node_mask.first() {
            let mut socket = self.topo.core_siblings(first).and(node_mask);
            let mut cpu = first;
            loop {
                let core = self.topo.thread_siblings(cpu).and(node_mask);
                assert!(!core.is_empty());
                for i in core.iter() {
                    socket.clear_cpu(i)?;
                    node_mask.clear_cpu(i)?;
                    if !self.set_cpu(cpt, i) {
                        bail!("Failed to add CPU {} to partition {}", i, cpt);
                    }
                    number -= 1;
                    if number == 0 {
                        return Ok(());
                    }
                }
                match socket.first() {
                    Some(next) => cpu = next,
                    None => break,
                }
            }
        }
        Ok(())
    }

    /// Build a table of `ncpt` equally sized partitions. `ncpt <= 0` uses
    /// `estimate_count()`.
    pub fn create(ncpt: i32, topo: &Topology) -> Result<CptTable> {
        let estimate = Self::estimate_count(topo);
        let ncpu = topo.nr_online_cpus();
        let ncpt = if ncpt <= 0 { estimate } else { ncpt as usize };

        if ncpt > ncpu || ncpt > 4 * estimate {
            warn!(
                concat!(
                    "CPU partition number {} is larger than suggested value ({}), your system",
                    " may have performance issue or run out of memory while under pressure"
                ),
                ncpt,
                estimate
            );
        }

        Self::create_exact(ncpt, topo).with_context(|| {
            format!(
                "Failed to setup CPU-partition-table with {} CPU-partitions, online HW nodes: {}, HW cpus: {}",
                ncpt,
                topo.online_nodes().weight(),
                ncpu
            )
        })
    }

    fn create_exact(ncpt: usize, topo: &Topology) -> Result<CptTable> {
        let ncpu = topo.nr_online_cpus();
        if ncpt == 0 || ncpu % ncpt != 0 {
            bail!(
                concat!(
                    "CPU number {} is not multiple of cpu_npartition {}, please try different",
                    " cpu_npartitions value or set pattern string by cpu_pattern=STRING"
                ),
                ncpu,
                ncpt
            );
        }

        let mut cptab = CptTable::alloc(ncpt, topo);
        let num = ncpu / ncpt;
        let mut cpt = 0;
        for node in topo.online_nodes().iter() {
            let mut mask = topo.node_cpus(node).and(topo.online_mask());
            while !mask.is_empty() {
                if cpt >= ncpt {
                    bail!("Ran out of partitions at node {}", node);
                }
                let n = num - cptab.parts[cpt].cpumask.weight();
                assert!(n > 0);
                cptab.choose_ncpus(cpt, &mut mask, n)?;
                let weight = cptab.parts[cpt].cpumask.weight();
                assert!(num >= weight);
                if weight == num {
                    cpt += 1;
                }
            }
        }

        let last = cptab.parts[ncpt - 1].cpumask.weight();
        if cpt != ncpt || num != last {
            bail!(
                "Expect {}({}) CPU partitions but got {}({}), CPU hotplug/unplug while setting?",
                ncpt,
                num,
                cpt,
                last
            );
        }
        Ok(cptab)
    }

    /// Build a table from a pattern such as `"0[0,1] 1[2-3]"`, or
    /// `"N 0[0] 1[1]"` to list NUMA nodes instead of CPUs. A bare `"N"`
    /// creates one partition per NUMA node that has online CPUs.
    pub fn create_pattern(pattern: &str, topo: &Topology) -> Result<CptTable> {
        let mut rest = pattern.trim();
        let mut node_mode = false;
        if let Some(nodes) = rest.strip_prefix(['N', 'n']) {
            if nodes.trim().is_empty() {
                return Self::create_per_node(topo);
            }
            node_mode = true;
            rest = nodes.trim();
        }

        let ncpt = rest.matches('[').count();
        let max_ncpt = if node_mode {
            topo.nr_nodes()
        } else {
            topo.nr_cpus()
        };
        if ncpt == 0 || ncpt > max_ncpt {
            bail!("Invalid pattern {}, or too many partitions {}", pattern, ncpt);
        }

        let high = max_ncpt - 1;
        let mut cptab = CptTable::alloc(ncpt, topo);
        let mut count = 0;
        loop {
            let bracket = match rest.find('[') {
                Some(pos) => pos,
                None => {
                    if !rest.is_empty() {
                        bail!("Invalid pattern {}", rest);
                    }
                    if count != ncpt {
                        bail!("expect {} partitions but found {}", ncpt, count);
                    }
                    break;
                }
            };

            let id = rest[..bracket].trim();
            let cpt = match sscanf!(id, "{usize}") {
                Ok(cpt) => cpt,
                Err(_) => bail!("Invalid cpu pattern {}", rest),
            };
            if cpt >= ncpt {
                bail!("Invalid partition id {}, total partitions {}", cpt, ncpt);
            }
            if cptab.weight(Some(cpt)) != 0 {
                bail!("Partition {} has already been set.", cpt);
            }

            let close = match rest[bracket..].find(']') {
                Some(pos) => bracket + pos,
                None => bail!("missing right bracket for cpt {}, {}", cpt, rest),
            };
            let list = ExprList::parse(&rest[bracket..=close], 0, high)
                .with_context(|| format!("Can't parse number range: {}", &rest[bracket..=close]))?;
            for i in list.values() {
                let ok = if node_mode {
                    cptab.set_node(cpt, i)
                } else {
                    cptab.set_cpu(cpt, i)
                };
                if !ok {
                    bail!(
                        "Failed to add {} {} to partition {}",
                        if node_mode { "node" } else { "CPU" },
                        i,
                        cpt
                    );
                }
            }

            if !cptab.online(Some(cpt)) {
                bail!("No online CPU is found on partition {}", cpt);
            }
            count += 1;
            rest = rest[close + 1..].trim_start();
        }
        Ok(cptab)
    }

    fn create_per_node(topo: &Topology) -> Result<CptTable> {
        let nodes = topo.online_nodes();
        if nodes.is_empty() {
            bail!("No NUMA node with online CPUs");
        }
        let mut cptab = CptTable::alloc(nodes.weight(), topo);
        for (cpt, node) in nodes.iter().enumerate() {
            if !cptab.set_node(cpt, node) {
                bail!("Failed to add node {} to partition {}", node, cpt);
            }
        }
        Ok(cptab)
    }

    /// Build the table described by `args`: the pattern if one is set,
    /// otherwise `cpu_npartitions` partitions.
    pub fn cpu_init(args: &CptArgs, topo: &Topology) -> Result<CptTable> {
        args.validate()?;
        let cptab = if args.has_pattern() {
            Self::create_pattern(&args.cpu_pattern, topo).with_context(|| {
                format!("Failed to create cptab from pattern {}", args.cpu_pattern)
            })?
        } else {
            Self::create(args.cpu_npartitions, topo).with_context(|| {
                format!(
                    "Failed to create ptable with npartitions {}",
                    args.cpu_npartitions
                )
            })?
        };

        info!(
            "HW CPU cores: {}, npartitions: {}",
            topo.nr_online_cpus(),
            cptab.number()
        );
        Ok(cptab)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assert_disjoint(cptab: &CptTable) {
        let mut union = Cpumask::new(cptab.topology().nr_cpus());
        for a in 0..cptab.number() {
            for b in (a + 1)..cptab.number() {
                assert!(!cptab.cpumask(a).intersects(cptab.cpumask(b)));
            }
            union |= cptab.cpumask(a);
        }
        assert_eq!(&union, &cptab.cpumask);
    }

    #[test]
    fn test_estimate_count() {
        let topo = Topology::synthetic(1, 16, 1);
        let ncpt = CptTable::estimate_count(&topo);
        assert_eq!(ncpt, 4);
        assert!(ncpt.is_power_of_two() && ncpt * ncpt.max(4) >= 16);

        assert_eq!(CptTable::estimate_count(&Topology::synthetic(1, 4, 1)), 1);
        assert_eq!(CptTable::estimate_count(&Topology::synthetic(2, 8, 2)), 4);
        // 6 CPUs: estimate 2, divides evenly.
        assert_eq!(CptTable::estimate_count(&Topology::synthetic(1, 6, 1)), 2);
        // fat numa: 8 nodes with 1 CPU each
        assert_eq!(CptTable::estimate_count(&Topology::synthetic(8, 1, 1)), 2);
    }

    #[test]
    fn test_set_unset_cpu() {
        let topo = Topology::synthetic(2, 2, 1);
        let mut cptab = CptTable::alloc(2, &topo);
        assert!(cptab.set_cpu(0, 0));
        assert!(!cptab.set_cpu(1, 0));
        assert!(!cptab.set_cpu(2, 1));
        assert!(!cptab.set_cpu(0, 9));
        assert!(cptab.set_cpu(0, 2));
        assert_eq!(cptab.nodemask(0).to_nodelist(), "0-1");

        // Wrong partition is ignored.
        cptab.unset_cpu(Some(1), 2);
        assert_eq!(cptab.of_cpu(2), Some(0));

        cptab.unset_cpu(None, 2);
        assert_eq!(cptab.of_cpu(2), None);
        assert_eq!(cptab.nodemask(0).to_nodelist(), "0");
        assert!(!cptab.nodemask.test_node(1));
        assert_disjoint(&cptab);
    }

    #[test]
    fn test_offline_cpu_rejected() {
        let mut topo = Topology::synthetic(1, 4, 1);
        topo.set_cpu_online(1, false).unwrap();
        let mut cptab = CptTable::alloc(1, &topo);
        assert!(!cptab.set_cpu(0, 1));

        let mask = Cpumask::from_cpulist("1", 4).unwrap();
        assert!(!cptab.set_cpumask(0, &mask));
        let mask = Cpumask::from_cpulist("0-2", 4).unwrap();
        assert!(cptab.set_cpumask(0, &mask));
        assert_eq!(cptab.cpumask(0).to_cpulist(), "0,2");
    }

    #[test]
    fn test_set_cpumask_atomic() {
        let topo = Topology::synthetic(1, 4, 1);
        let mut cptab = CptTable::alloc(2, &topo);
        assert!(cptab.set_cpu(1, 3));
        let mask = Cpumask::from_cpulist("0-3", 4).unwrap();
        assert!(!cptab.set_cpumask(0, &mask));
        assert_eq!(cptab.weight(Some(0)), 0);
        assert_eq!(cptab.weight(None), 1);
    }

    #[test]
    fn test_spread_node() {
        let topo = Topology::synthetic(4, 1, 1);
        let cptab = CptTable::create_pattern("N 0[0,2] 1[1,3]", &topo).unwrap();
        let a = cptab.spread_node(Some(0));
        let b = cptab.spread_node(Some(0));
        assert_ne!(a, b);
        assert!([0, 2].contains(&a) && [0, 2].contains(&b));
        assert_eq!(cptab.spread_node(Some(0)), a);

        let all: Vec<usize> = (0..4).map(|_| cptab.spread_node(None)).collect();
        assert_eq!(all, vec![0, 1, 2, 3]);
    }

    #[test]
    fn test_current_remap() {
        let topo = Topology::synthetic(1, 8, 1);
        let cptab = CptTable::create_pattern("0[0,1] 1[2,3]", &topo).unwrap();
        assert_eq!(cptab.current_of(3, false), Some(1));
        assert_eq!(cptab.current_of(7, false), None);
        assert_eq!(cptab.current_of(7, true), Some(1));
        assert_eq!(cptab.current_of(6, true), Some(0));
    }

    #[test]
    fn test_pattern_basic() {
        let topo = Topology::synthetic(1, 4, 1);
        let cptab = CptTable::create_pattern("0[0,1] 1[2,3]", &topo).unwrap();
        assert_eq!(cptab.number(), 2);
        assert_eq!(cptab.cpumask(0).to_cpulist(), "0-1");
        assert_eq!(cptab.cpumask(1).to_cpulist(), "2-3");
        assert_disjoint(&cptab);
    }

    #[test]
    fn test_pattern_errors() {
        let topo = Topology::synthetic(1, 4, 1);
        assert!(CptTable::create_pattern("0[0] 5[1]", &topo).is_err());
        assert!(CptTable::create_pattern("0[0] 0[1]", &topo).is_err());
        assert!(CptTable::create_pattern("0[0,1", &topo).is_err());
        assert!(CptTable::create_pattern("0[0] 1[0]", &topo).is_err());
        assert!(CptTable::create_pattern("0[0] junk", &topo).is_err());
        assert!(CptTable::create_pattern("", &topo).is_err());
        assert!(CptTable::create_pattern("x[0]", &topo).is_err());
    }

    #[test]
    fn test_pattern_stride_and_nodes() {
        let topo = Topology::synthetic(2, 4, 1);
        let cptab = CptTable::create_pattern("0[0-7/2] 1[1-7/2]", &topo).unwrap();
        assert_eq!(cptab.cpumask(0).to_cpulist(), "0,2,4,6");
        assert_eq!(cptab.nodemask(0).to_nodelist(), "0-1");

        let cptab = CptTable::create_pattern("N", &topo).unwrap();
        assert_eq!(cptab.number(), 2);
        assert_eq!(cptab.cpumask(1).to_cpulist(), "4-7");
        assert_eq!(cptab.spread_node(Some(1)), 1);

        let cptab = CptTable::create_pattern("n 0[1] 1[0]", &topo).unwrap();
        assert_eq!(cptab.cpumask(0).to_cpulist(), "4-7");
        assert!(CptTable::create_pattern("N 0[2]", &topo).is_err());
    }

    #[test]
    fn test_create_by_count() {
        let topo = Topology::synthetic(2, 4, 2);
        let cptab = CptTable::create(4, &topo).unwrap();
        assert_eq!(cptab.number(), 4);
        for cpt in 0..4 {
            assert_eq!(cptab.weight(Some(cpt)), 4);
            assert_eq!(cptab.nodemask(cpt).weight(), 1);
        }
        // HT siblings stay together.
        assert_eq!(cptab.cpumask(0).to_cpulist(), "0-3");
        assert_disjoint(&cptab);

        assert!(CptTable::create(3, &topo).is_err());
        let cptab = CptTable::create(0, &topo).unwrap();
        assert_eq!(cptab.number(), CptTable::estimate_count(&topo));
    }

    #[test]
    fn test_print() {
        let topo = Topology::synthetic(1, 4, 1);
        let cptab = CptTable::create(2, &topo).unwrap();
        assert_eq!(cptab.print(), "0\t: 0 1\n1\t: 2 3\n");
    }

    #[test]
    fn test_cpu_notify_bumps_version() {
        let mut topo = Topology::synthetic(1, 2, 2);
        let cptab = CptTable::create(1, &topo).unwrap();
        assert_eq!(cptab.version(), 0);
        topo.set_cpu_online(1, false).unwrap();
        cptab.cpu_notify(1, CpuAction::Dead, &topo);
        topo.set_cpu_online(1, true).unwrap();
        cptab.cpu_notify(1, CpuAction::Online, &topo);
        assert_eq!(cptab.version(), 2);
    }

    #[test]
    fn test_cpu_init() {
        let topo = Topology::synthetic(1, 4, 1);
        let args = CptArgs {
            cpu_npartitions: 2,
            cpu_pattern: String::new(),
        };
        assert_eq!(CptTable::cpu_init(&args, &topo).unwrap().number(), 2);
        let args = CptArgs {
            cpu_npartitions: 2,
            cpu_pattern: "0[0-3]".into(),
        };
        assert_eq!(CptTable::cpu_init(&args, &topo).unwrap().number(), 1);
    }
}
