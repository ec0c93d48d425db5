// Copyright (c) Meta Platforms, Inc. and affiliates.
//
// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! CLI argument utilities for CPU partition setup.
//!

use anyhow::{bail, Result};
use clap::Args;
use serde::Deserialize;
use serde::Serialize;

/// CPU partition configuration arguments
#[derive(Args, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CptArgs {
    /// Number of CPU partitions. 0 estimates a value from the number of
    /// online CPUs and NUMA nodes. Ignored when --cpu-pattern is set.
    #[clap(long = "cpu-npartitions", default_value = "0")]
    pub cpu_npartitions: i32,

    /// Explicit CPU partition layout.
    ///
    /// Examples:
    ///   --cpu-pattern="0[0,1] 1[2,3]"     (CPUs 0-1 in partition 0, 2-3 in 1)
    ///   --cpu-pattern="N 0[0] 1[1]"       (NUMA node 0 in partition 0, node 1 in 1)
    ///   --cpu-pattern="0[0-7/2] 1[1-7/2]" (even and odd CPUs)
    ///   --cpu-pattern=N                   (one partition per NUMA node)
    #[clap(long = "cpu-pattern", default_value = "")]
    pub cpu_pattern: String,
}

impl CptArgs {
    pub fn validate(&self) -> Result<()> {
        if self.cpu_npartitions < 0 {
            bail!(
                "cpu_npartitions must not be negative, got {}",
                self.cpu_npartitions
            );
        }
        if !self.cpu_pattern.trim().is_empty() && !self.cpu_pattern.contains('[') {
            let trimmed = self.cpu_pattern.trim();
            if trimmed != "N" && trimmed != "n" {
                bail!("Invalid cpu_pattern '{}'", self.cpu_pattern);
            }
        }
        Ok(())
    }

    pub fn has_pattern(&self) -> bool {
        !self.cpu_pattern.trim().is_empty()
    }
}

impl Default for CptArgs {
    fn default() -> Self {
        Self {
            cpu_npartitions: 0,
            cpu_pattern: String::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate() {
        assert!(CptArgs::default().validate().is_ok());
        let args = CptArgs {
            cpu_npartitions: -2,
            ..Default::default()
        };
        assert!(args.validate().is_err());
        let args = CptArgs {
            cpu_pattern: "N".into(),
            ..Default::default()
        };
        assert!(args.validate().is_ok());
        assert!(args.has_pattern());
        let args = CptArgs {
            cpu_pattern: "bogus".into(),
            ..Default::default()
        };
        assert!(args.validate().is_err());
    }
}
