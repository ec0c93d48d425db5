// Copyright (c) Meta Platforms, Inc. and affiliates.
//
// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

mod common;

use cfs_utils::CptArgs;
use cfs_utils::CptTable;
use cfs_utils::Topology;

#[test]
fn test_topology_from_sysfs() {
    let dir = common::fake_sysfs(2, 4, 2, "0-15");
    let topo = Topology::from_sysfs(dir.path()).unwrap();
    assert_eq!(topo.nr_cpus(), 16);
    assert_eq!(topo.nr_nodes(), 2);
    assert_eq!(topo.cpu_to_node(12), 1);
    assert_eq!(topo.thread_siblings(5).to_cpulist(), "4-5");
    assert_eq!(topo.core_siblings(5).to_cpulist(), "0-7");
}

#[test]
fn test_missing_sysfs_fails() {
    let dir = tempfile::tempdir().unwrap();
    assert!(Topology::from_sysfs(dir.path()).is_err());
}

#[test]
fn test_partial_online() {
    let dir = common::fake_sysfs(1, 8, 1, "0-5");
    let topo = Topology::from_sysfs(dir.path()).unwrap();
    assert_eq!(topo.nr_online_cpus(), 6);

    // 6 online CPUs do not split into 4 partitions.
    assert!(CptTable::create(4, &topo).is_err());
    let cptab = CptTable::create(3, &topo).unwrap();
    assert_eq!(cptab.weight(None), 6);
    assert_eq!(cptab.of_cpu(6), None);

    // Offline CPUs in a pattern are refused.
    assert!(CptTable::create_pattern("0[0-2] 1[6,7]", &topo).is_err());
}

#[test]
fn test_cpu_init_from_sysfs() {
    let dir = common::fake_sysfs(2, 2, 2, "0-7");
    let topo = Topology::from_sysfs(dir.path()).unwrap();
    let args = CptArgs {
        cpu_npartitions: 0,
        cpu_pattern: "N".into(),
    };
    let cptab = CptTable::cpu_init(&args, &topo).unwrap();
    assert_eq!(cptab.number(), 2);
    assert_eq!(cptab.print(), "0\t: 0 1 2 3\n1\t: 4 5 6 7\n");
}
