// Copyright (c) Meta Platforms, Inc. and affiliates.
//
// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! # Machine topology
//!
//! The partition table only needs a flat view of the machine: which CPUs are
//! possible and online, which NUMA node each CPU sits on, and which CPUs share
//! a physical core (thread siblings) or a package (core siblings).
//!
//! A Topology is either read from a sysfs tree or built synthetically:
//!
//!```
//!     use cfs_utils::Topology;
//!     // 2 nodes, 4 cores per node, 2 hardware threads per core.
//!     let topo = Topology::synthetic(2, 4, 2);
//!     assert_eq!(topo.nr_cpus(), 16);
//!     assert_eq!(topo.cpu_to_node(9), 1);
//!```
//!
//! Reading sysfs takes the root of the tree so tests can point it at a fake
//! one. `Topology::new()` reads the live `/sys`.

use crate::cpumask::read_cpulist;
use crate::Cpumask;
use crate::Nodemask;
use anyhow::bail;
use anyhow::Context;
use anyhow::Result;
use glob::glob;
use sscanf::sscanf;
use std::path::Path;

#[derive(Debug, Clone)]
pub struct Topology {
    nr_cpus: usize,
    nr_nodes: usize,
    online: Cpumask,
    cpu_node: Vec<usize>,
    thread_siblings: Vec<Cpumask>,
    core_siblings: Vec<Cpumask>,
}

impl Topology {
    /// Build the host Topology from `/sys`.
    pub fn new() -> Result<Topology> {
        Self::from_sysfs(Path::new("/sys"))
    }

    /// Build a Topology from the sysfs tree rooted at `root`.
    pub fn from_sysfs(root: &Path) -> Result<Topology> {
        let cpu_dir = root.join("devices/system/cpu");
        let possible = read_cpulist_file(&cpu_dir.join("possible"))?;
        let nr_cpus = match possible.iter().max() {
            Some(max) => max + 1,
            None => bail!("No possible CPU found under {:?}", cpu_dir),
        };
        let mut online = Cpumask::new(nr_cpus);
        for cpu in read_cpulist_file(&cpu_dir.join("online"))? {
            online.set_cpu(cpu)?;
        }

        let mut cpu_node = vec![0; nr_cpus];
        let mut nr_nodes = 1;
        let node_dir = root.join("devices/system/node");
        let node_pattern = node_dir.join("node[0-9]*");
        for node_path in glob(node_pattern.to_string_lossy().as_ref())?.filter_map(Result::ok) {
            let name = match node_path.file_name().and_then(|n| n.to_str()) {
                Some(name) => name,
                None => continue,
            };
            let node_id = match sscanf!(name, "node{usize}") {
                Ok(val) => val,
                Err(_) => {
                    bail!("Failed to parse NUMA node ID {}", name);
                }
            };
            nr_nodes = nr_nodes.max(node_id + 1);
            for cpu in read_cpulist_file(&node_path.join("cpulist"))? {
                if cpu >= nr_cpus {
                    bail!("Node {} lists impossible CPU {}", node_id, cpu);
                }
                cpu_node[cpu] = node_id;
            }
        }

        let mut thread_siblings = Vec::with_capacity(nr_cpus);
        let mut core_siblings = Vec::with_capacity(nr_cpus);
        for cpu in 0..nr_cpus {
            let top_path = cpu_dir.join(format!("cpu{cpu}/topology"));
            thread_siblings.push(read_siblings(
                &top_path.join("thread_siblings_list"),
                cpu,
                nr_cpus,
            )?);
            core_siblings.push(read_siblings(
                &top_path.join("core_siblings_list"),
                cpu,
                nr_cpus,
            )?);
        }

        Ok(Topology {
            nr_cpus,
            nr_nodes,
            online,
            cpu_node,
            thread_siblings,
            core_siblings,
        })
    }

    /// Build a fully online topology where each node is one package of
    /// `cores_per_node` cores with `threads_per_core` hardware threads each.
    /// CPU ids are assigned node by node, core by core.
    pub fn synthetic(nr_nodes: usize, cores_per_node: usize, threads_per_core: usize) -> Topology {
        let nr_nodes = nr_nodes.max(1);
        let per_node = cores_per_node.max(1) * threads_per_core.max(1);
        let threads = threads_per_core.max(1);
        let nr_cpus = nr_nodes * per_node;

        let mut online = Cpumask::new(nr_cpus);
        online.set_all();
        let cpu_node = (0..nr_cpus).map(|cpu| cpu / per_node).collect();
        let thread_siblings = (0..nr_cpus)
            .map(|cpu| span(nr_cpus, cpu - cpu % threads, threads))
            .collect();
        let core_siblings = (0..nr_cpus)
            .map(|cpu| span(nr_cpus, cpu - cpu % per_node, per_node))
            .collect();

        Topology {
            nr_cpus,
            nr_nodes,
            online,
            cpu_node,
            thread_siblings,
            core_siblings,
        }
    }

    /// Number of possible CPUs.
    pub fn nr_cpus(&self) -> usize {
        self.nr_cpus
    }

    /// Number of possible NUMA nodes.
    pub fn nr_nodes(&self) -> usize {
        self.nr_nodes
    }

    pub fn online_mask(&self) -> &Cpumask {
        &self.online
    }

    pub fn nr_online_cpus(&self) -> usize {
        self.online.weight()
    }

    pub fn cpu_online(&self, cpu: usize) -> bool {
        self.online.test_cpu(cpu)
    }

    /// Mark a CPU on or offline, as a hotplug event would.
    pub fn set_cpu_online(&mut self, cpu: usize, online: bool) -> Result<()> {
        if online {
            self.online.set_cpu(cpu)
        } else {
            self.online.clear_cpu(cpu)
        }
    }

    /// NUMA node of `cpu`, node 0 for CPUs outside the topology.
    pub fn cpu_to_node(&self, cpu: usize) -> usize {
        self.cpu_node.get(cpu).copied().unwrap_or(0)
    }

    /// All possible CPUs of `node`.
    pub fn node_cpus(&self, node: usize) -> Cpumask {
        let mut mask = Cpumask::new(self.nr_cpus);
        for (cpu, &n) in self.cpu_node.iter().enumerate() {
            if n == node {
                let _ = mask.set_cpu(cpu);
            }
        }
        mask
    }

    /// Nodes with at least one online CPU.
    pub fn online_nodes(&self) -> Nodemask {
        let mut nodes = Nodemask::new(self.nr_nodes);
        for cpu in self.online.iter() {
            let _ = nodes.set_node(self.cpu_to_node(cpu));
        }
        nodes
    }

    /// Hardware threads sharing the physical core of `cpu`.
    pub fn thread_siblings(&self, cpu: usize) -> Cpumask {
        match self.thread_siblings.get(cpu) {
            Some(mask) => mask.clone(),
            None => Cpumask::new(self.nr_cpus),
        }
    }

    /// CPUs sharing the package of `cpu`.
    pub fn core_siblings(&self, cpu: usize) -> Cpumask {
        match self.core_siblings.get(cpu) {
            Some(mask) => mask.clone(),
            None => Cpumask::new(self.nr_cpus),
        }
    }
}

/// CPU the calling thread runs on.
pub fn current_cpu() -> usize {
    let cpu = unsafe { libc::sched_getcpu() };
    if cpu < 0 {
        0
    } else {
        cpu as usize
    }
}

/**********************************************
 * Helper functions for creating the Topology *
 **********************************************/

fn span(nr_cpus: usize, first: usize, count: usize) -> Cpumask {
    let mut mask = Cpumask::new(nr_cpus);
    for cpu in first..(first + count).min(nr_cpus) {
        let _ = mask.set_cpu(cpu);
    }
    mask
}

fn read_cpulist_file(path: &Path) -> Result<Vec<usize>> {
    let val = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to open or read file {:?}", path))?;
    read_cpulist(&val).with_context(|| format!("Failed to parse {:?}", path))
}

fn read_siblings(path: &Path, cpu: usize, nr_cpus: usize) -> Result<Cpumask> {
    let mut mask = Cpumask::new(nr_cpus);
    if path.exists() {
        for sibling in read_cpulist_file(path)? {
            mask.set_cpu(sibling)?;
        }
    }
    mask.set_cpu(cpu)?;
    Ok(mask)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_synthetic_shape() {
        let topo = Topology::synthetic(2, 2, 2);
        assert_eq!(topo.nr_cpus(), 8);
        assert_eq!(topo.nr_nodes(), 2);
        assert_eq!(topo.node_cpus(1).to_cpulist(), "4-7");
        assert_eq!(topo.thread_siblings(5).to_cpulist(), "4-5");
        assert_eq!(topo.core_siblings(5).to_cpulist(), "4-7");
        assert_eq!(topo.online_nodes().weight(), 2);
    }

    #[test]
    fn test_hotplug_state() {
        let mut topo = Topology::synthetic(1, 4, 1);
        topo.set_cpu_online(2, false).unwrap();
        assert!(!topo.cpu_online(2));
        assert_eq!(topo.nr_online_cpus(), 3);
        assert!(topo.set_cpu_online(9, false).is_err());
    }
}
