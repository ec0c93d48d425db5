// Copyright (c) Meta Platforms, Inc. and affiliates.
//
// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! # CPU and NUMA node masks
//!
//! A Cpumask is a BitVec of u64's sized to the number of possible CPUs of the
//! topology it was created for, along with helpers for creating, manipulating
//! and printing it. A Nodemask is the same thing indexed by NUMA node.
//!
//! Masks are sized explicitly instead of from a process-wide CPU count so that
//! synthetic topologies of any shape can be modelled side by side:
//!
//!```
//!     use cfs_utils::Cpumask;
//!     let mut mask = Cpumask::new(8);
//!     mask.set_cpu(3).unwrap();
//!     assert!(mask.test_cpu(3));
//!     assert_eq!(mask.weight(), 1);
//!
//!     let mask = Cpumask::from_cpulist("0-3,6", 8).unwrap();
//!     assert_eq!(mask.to_cpulist(), "0-3,6");
//!```

use anyhow::bail;
use anyhow::Context;
use anyhow::Result;
use bitvec::prelude::*;
use sscanf::sscanf;
use std::fmt;
use std::ops::BitAndAssign;
use std::ops::BitOrAssign;

#[derive(Debug, Eq, Clone, Hash, Ord, PartialEq, PartialOrd)]
pub struct Cpumask {
    mask: BitVec<u64, Lsb0>,
}

impl Cpumask {
    fn check_cpu(&self, cpu: usize) -> Result<()> {
        if cpu >= self.mask.len() {
            bail!("Invalid CPU {} passed, max {}", cpu, self.mask.len());
        }

        Ok(())
    }

    /// Build a new empty Cpumask able to hold `nr_cpus` CPUs.
    pub fn new(nr_cpus: usize) -> Cpumask {
        Cpumask {
            mask: bitvec![u64, Lsb0; 0; nr_cpus],
        }
    }

    /// Build a Cpumask object from a hexadecimal string.
    pub fn from_str(cpumask: &str, nr_cpus: usize) -> Result<Cpumask> {
        match cpumask {
            "none" => return Ok(Self::new(nr_cpus)),
            "all" => {
                let mask = bitvec![u64, Lsb0; 1; nr_cpus];
                return Ok(Self { mask });
            }
            _ => {}
        }
        let hex_str = {
            let mut tmp_str = cpumask
                .strip_prefix("0x")
                .unwrap_or(cpumask)
                .replace([',', '_'], "");
            if tmp_str.len() % 2 != 0 {
                tmp_str = "0".to_string() + &tmp_str;
            }
            tmp_str
        };
        let byte_vec =
            hex::decode(&hex_str).with_context(|| format!("Failed to parse cpumask: {cpumask}"))?;

        let mut mask = Self::new(nr_cpus);
        for (index, &val) in byte_vec.iter().rev().enumerate() {
            let mut v = val;
            while v != 0 {
                let lsb = v.trailing_zeros() as usize;
                v &= !(1 << lsb);
                let cpu = index * 8 + lsb;
                if cpu >= nr_cpus {
                    bail!(
                        concat!(
                            "Found cpu ({}) in cpumask ({}) which is larger",
                            " than the number of cpus on the machine ({})"
                        ),
                        cpu,
                        cpumask,
                        nr_cpus
                    );
                }
                mask.mask.set(cpu, true);
            }
        }

        Ok(mask)
    }

    pub fn from_cpulist(cpulist: &str, nr_cpus: usize) -> Result<Cpumask> {
        let mut mask = Cpumask::new(nr_cpus);
        for cpu_id in read_cpulist(cpulist)? {
            mask.set_cpu(cpu_id)?;
        }

        Ok(mask)
    }

    /// Return the raw BitVec object backing the Cpumask.
    pub fn as_raw_bitvec(&self) -> &BitVec<u64, Lsb0> {
        &self.mask
    }

    /// Set all bits in the Cpumask to 1
    pub fn set_all(&mut self) {
        self.mask.fill(true);
    }

    /// Set all bits in the Cpumask to 0
    pub fn clear_all(&mut self) {
        self.mask.fill(false);
    }

    /// Set a bit in the Cpumask. Returns an error if the specified CPU exceeds
    /// the size of the Cpumask.
    pub fn set_cpu(&mut self, cpu: usize) -> Result<()> {
        self.check_cpu(cpu)?;
        self.mask.set(cpu, true);
        Ok(())
    }

    /// Clear a bit from the Cpumask. Returns an error if the specified CPU
    /// exceeds the size of the Cpumask.
    pub fn clear_cpu(&mut self, cpu: usize) -> Result<()> {
        self.check_cpu(cpu)?;
        self.mask.set(cpu, false);
        Ok(())
    }

    /// Test whether the specified CPU bit is set in the Cpumask. Out of range
    /// CPUs are never set.
    pub fn test_cpu(&self, cpu: usize) -> bool {
        match self.mask.get(cpu) {
            Some(bit) => *bit,
            None => false,
        }
    }

    /// Count the number of bits set in the Cpumask.
    pub fn weight(&self) -> usize {
        self.mask.count_ones()
    }

    /// Return true if the Cpumask has no bit set, false otherwise.
    pub fn is_empty(&self) -> bool {
        self.mask.not_any()
    }

    /// The total size of the cpumask.
    pub fn len(&self) -> usize {
        self.mask.len()
    }

    /// Lowest CPU set in the mask.
    pub fn first(&self) -> Option<usize> {
        self.mask.first_one()
    }

    /// The `n`th (zero based) CPU set in the mask.
    pub fn nth(&self, n: usize) -> Option<usize> {
        self.iter().nth(n)
    }

    /// Return true if any CPU is set in both masks.
    pub fn intersects(&self, other: &Cpumask) -> bool {
        self.iter().any(|cpu| other.test_cpu(cpu))
    }

    /// Create a Cpumask that is the AND of the current Cpumask and another.
    pub fn and(&self, other: &Cpumask) -> Cpumask {
        let mut new = self.clone();
        new &= other;
        new
    }

    /// Create a Cpumask that is the OR of the current Cpumask and another.
    pub fn or(&self, other: &Cpumask) -> Cpumask {
        let mut new = self.clone();
        new |= other;
        new
    }

    /// Create a Cpumask holding the CPUs of this one that are not in `other`.
    pub fn and_not(&self, other: &Cpumask) -> Cpumask {
        let mut new = self.clone();
        for cpu in other.iter() {
            if cpu < new.mask.len() {
                new.mask.set(cpu, false);
            }
        }
        new
    }

    /// Iterate over each element of a Cpumask, and return the indices with bits
    /// set.
    pub fn iter(&self) -> CpumaskIterator<'_> {
        CpumaskIterator {
            mask: self,
            index: 0,
        }
    }

    /// Render the mask as a kernel style cpulist, e.g. "0-3,8,10-11".
    pub fn to_cpulist(&self) -> String {
        let mut groups = vec![];
        let mut iter = self.iter().peekable();
        while let Some(lo) = iter.next() {
            let mut hi = lo;
            while iter.peek() == Some(&(hi + 1)) {
                hi += 1;
                iter.next();
            }
            if lo == hi {
                groups.push(format!("{lo}"));
            } else {
                groups.push(format!("{lo}-{hi}"));
            }
        }
        groups.join(",")
    }

    fn fmt_with(&self, f: &mut fmt::Formatter<'_>, case: char) -> fmt::Result {
        let nr_cpus = self.mask.len().max(1);
        let mut masks: Vec<u32> = self
            .mask
            .as_raw_slice()
            .iter()
            .flat_map(|x| [*x as u32, (x >> 32) as u32])
            .collect();

        // Throw out possible stray from u64 -> u32.
        masks.truncate(nr_cpus.div_ceil(32));

        // Print the highest 32bit. Trim digits beyond the mask size.
        let width = match nr_cpus.div_ceil(4) % 8 {
            0 => 8,
            v => v,
        };
        let top = masks.pop().unwrap_or(0);
        match case {
            'X' => write!(f, "{:0width$X}", top, width = width)?,
            _ => write!(f, "{:0width$x}", top, width = width)?,
        }

        // The rest in descending order.
        for submask in masks.iter().rev() {
            match case {
                'X' => write!(f, ",{submask:08X}")?,
                _ => write!(f, ",{submask:08x}")?,
            }
        }
        Ok(())
    }
}

pub fn read_cpulist(cpulist: &str) -> Result<Vec<usize>> {
    let cpulist = cpulist.trim_end_matches('\0').trim();
    if cpulist.is_empty() {
        return Ok(vec![]);
    }
    let mut cpu_ids = vec![];
    for group in cpulist.split(',') {
        let (min, max) = match sscanf!(group.trim(), "{usize}-{usize}") {
            Ok((x, y)) => (x, y),
            Err(_) => match sscanf!(group.trim(), "{usize}") {
                Ok(x) => (x, x),
                Err(_) => {
                    bail!("Failed to parse cpulist {}", group.trim());
                }
            },
        };
        for i in min..(max + 1) {
            cpu_ids.push(i);
        }
    }

    Ok(cpu_ids)
}

pub struct CpumaskIterator<'a> {
    mask: &'a Cpumask,
    index: usize,
}

impl Iterator for CpumaskIterator<'_> {
    type Item = usize;

    fn next(&mut self) -> Option<Self::Item> {
        let rest = self.mask.mask.get(self.index..)?;
        let offset = rest.first_one()?;
        let cpu = self.index + offset;
        self.index = cpu + 1;
        Some(cpu)
    }
}

impl fmt::Display for Cpumask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.fmt_with(f, 'x')
    }
}

impl fmt::LowerHex for Cpumask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.fmt_with(f, 'x')
    }
}

impl fmt::UpperHex for Cpumask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.fmt_with(f, 'X')
    }
}

impl BitAndAssign<&Self> for Cpumask {
    fn bitand_assign(&mut self, rhs: &Self) {
        for cpu in 0..self.mask.len() {
            if !rhs.test_cpu(cpu) {
                self.mask.set(cpu, false);
            }
        }
    }
}

impl BitOrAssign<&Self> for Cpumask {
    fn bitor_assign(&mut self, rhs: &Self) {
        for cpu in rhs.iter() {
            if cpu < self.mask.len() {
                self.mask.set(cpu, true);
            }
        }
    }
}

/// Mask of NUMA nodes. Same representation as a Cpumask, indexed by node.
#[derive(Debug, Eq, Clone, Hash, Ord, PartialEq, PartialOrd)]
pub struct Nodemask(Cpumask);

impl Nodemask {
    pub fn new(nr_nodes: usize) -> Nodemask {
        Nodemask(Cpumask::new(nr_nodes))
    }

    pub fn set_node(&mut self, node: usize) -> Result<()> {
        self.0
            .set_cpu(node)
            .with_context(|| format!("Invalid NUMA node {node}"))
    }

    pub fn clear_node(&mut self, node: usize) -> Result<()> {
        self.0
            .clear_cpu(node)
            .with_context(|| format!("Invalid NUMA node {node}"))
    }

    pub fn test_node(&self, node: usize) -> bool {
        self.0.test_cpu(node)
    }

    pub fn weight(&self) -> usize {
        self.0.weight()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn first(&self) -> Option<usize> {
        self.0.first()
    }

    pub fn nth(&self, n: usize) -> Option<usize> {
        self.0.nth(n)
    }

    pub fn iter(&self) -> CpumaskIterator<'_> {
        self.0.iter()
    }

    pub fn to_nodelist(&self) -> String {
        self.0.to_cpulist()
    }
}

impl fmt::Display for Nodemask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt_with(f, 'x')
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hex_parse() {
        let mask = Cpumask::from_str("0xf0", 16).unwrap();
        assert_eq!(mask.iter().collect::<Vec<_>>(), vec![4, 5, 6, 7]);
        assert!(Cpumask::from_str("0x10000", 8).is_err());
        assert_eq!(Cpumask::from_str("all", 5).unwrap().weight(), 5);
        assert!(Cpumask::from_str("none", 5).unwrap().is_empty());
    }

    #[test]
    fn test_cpulist_render() {
        let mask = Cpumask::from_cpulist("0-2,4,6-7", 8).unwrap();
        assert_eq!(mask.to_cpulist(), "0-2,4,6-7");
        assert_eq!(mask.nth(3), Some(4));
        assert_eq!(mask.first(), Some(0));
        assert_eq!(Cpumask::new(4).to_cpulist(), "");
        assert_eq!(format!("{}", mask), "d7");
    }

    #[test]
    fn test_set_ops() {
        let a = Cpumask::from_cpulist("0-3", 8).unwrap();
        let b = Cpumask::from_cpulist("2-5", 8).unwrap();
        assert_eq!(a.and(&b).to_cpulist(), "2-3");
        assert_eq!(a.or(&b).to_cpulist(), "0-5");
        assert_eq!(a.and_not(&b).to_cpulist(), "0-1");
        assert!(a.intersects(&b));

        let mut c = a.clone();
        assert!(c.set_cpu(8).is_err());
        assert!(!c.test_cpu(8));
    }

    #[test]
    fn test_nodemask() {
        let mut nodes = Nodemask::new(4);
        nodes.set_node(1).unwrap();
        nodes.set_node(3).unwrap();
        assert_eq!(nodes.weight(), 2);
        assert_eq!(nodes.nth(1), Some(3));
        assert!(nodes.set_node(4).is_err());
        nodes.clear_node(1).unwrap();
        assert_eq!(nodes.to_nodelist(), "3");
    }
}
