// Copyright (c) Meta Platforms, Inc. and affiliates.
//
// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

use std::fs;
use std::path::Path;
use tempfile::TempDir;

fn write(root: &Path, rel: &str, content: &str) {
    let path = root.join(rel);
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).unwrap();
    }
    fs::write(path, content).unwrap();
}

/// Lay out a minimal sysfs tree: `nodes` NUMA nodes of `cores` cores with
/// `threads` hardware threads each. CPU ids are assigned node by node.
pub fn fake_sysfs(nodes: usize, cores: usize, threads: usize, online: &str) -> TempDir {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path();
    let per_node = cores * threads;
    let nr_cpus = nodes * per_node;

    write(root, "devices/system/cpu/possible", &format!("0-{}\n", nr_cpus - 1));
    write(root, "devices/system/cpu/online", &format!("{online}\n"));
    for node in 0..nodes {
        let first = node * per_node;
        write(
            root,
            &format!("devices/system/node/node{node}/cpulist"),
            &format!("{}-{}\n", first, first + per_node - 1),
        );
    }
    for cpu in 0..nr_cpus {
        let core_first = cpu - cpu % threads;
        let node_first = cpu - cpu % per_node;
        write(
            root,
            &format!("devices/system/cpu/cpu{cpu}/topology/thread_siblings_list"),
            &format!("{}-{}\n", core_first, core_first + threads - 1),
        );
        write(
            root,
            &format!("devices/system/cpu/cpu{cpu}/topology/core_siblings_list"),
            &format!("{}-{}\n", node_first, node_first + per_node - 1),
        );
    }
    dir
}
