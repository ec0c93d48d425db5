// Copyright (c) Meta Platforms, Inc. and affiliates.
//
// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! # Support library for the LNet stack
//!
//! This crate collects the low level building blocks the networking and
//! request scheduling crates are built on:
//!
//! ## Machine model
//!
//! `Topology`, `Cpumask` and `Nodemask` describe the CPUs and NUMA nodes of
//! the host (or of a synthetic machine), and `CptTable` groups them into CPU
//! partitions. Per-partition resources throughout the stack are sized and
//! indexed by the partition table.
//!
//! ## Concurrency
//!
//! `ScaleLock` shards a lock over the partitions of a table with an
//! all-partition exclusive mode and an ascending lock order for taking two
//! partitions at once.
//!
//! ## Data structures
//!
//! `BinHeap` is a binary min-heap with stable handles, `ExprList` parses the
//! range expressions used in CPU patterns and `hash_long` spreads keys over
//! hash buckets.

mod cpumask;
pub use cpumask::read_cpulist;
pub use cpumask::Cpumask;
pub use cpumask::CpumaskIterator;
pub use cpumask::Nodemask;

mod topology;
pub use topology::current_cpu;
pub use topology::Topology;

pub mod expr_list;
pub use expr_list::ExprList;

mod cpt;
pub use cpt::CpuAction;
pub use cpt::CptTable;
pub use cpt::CPT_WEIGHT_MIN;

mod cli;
pub use cli::CptArgs;

pub mod hash;
pub use hash::hash_long;

mod heap;
pub use heap::BinHeap;
pub use heap::HeapHandle;

mod scale_lock;
pub use scale_lock::key_index;
pub use scale_lock::CptGuard;
pub use scale_lock::CptReadGuard;
pub use scale_lock::ExclusiveGuard;
pub use scale_lock::LockSel;
pub use scale_lock::PairGuard;
pub use scale_lock::ScaleLock;
