// Copyright (c) Meta Platforms, Inc. and affiliates.
//
// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! LNet tunables.
//!
//! The same structure is filled from command line flags (clap) or from a
//! JSON file (serde), and checked with `validate()` before use.

use crate::types::LUSTRE_SRV_PID;
use crate::types::MAX_PORTALS;
use anyhow::bail;
use anyhow::Context;
use anyhow::Result;
use cfs_utils::CptArgs;
use clap::ArgAction;
use clap::Args;
use serde::Deserialize;
use serde::Serialize;
use std::fs;
use std::path::Path;

pub const FL_MAX_MES: usize = 2048;
pub const FL_MAX_MDS: usize = 2048;
pub const FL_MAX_EQS: usize = 512;
pub const FL_MAX_MSGS: usize = 2048;

#[derive(Args, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LnetConfig {
    #[clap(flatten)]
    #[serde(flatten)]
    pub cpt: CptArgs,

    /// Draw MDs, MEs, EQs and messages from fixed size freelists instead of
    /// the general allocator.
    #[clap(long, action = ArgAction::SetTrue)]
    pub use_freelist: bool,

    /// Freelist capacity for match entries.
    #[clap(long, default_value_t = FL_MAX_MES)]
    pub max_mes: usize,

    /// Freelist capacity for memory descriptors.
    #[clap(long, default_value_t = FL_MAX_MDS)]
    pub max_mds: usize,

    /// Freelist capacity for event queues.
    #[clap(long, default_value_t = FL_MAX_EQS)]
    pub max_eqs: usize,

    /// Freelist capacity for outstanding messages.
    #[clap(long, default_value_t = FL_MAX_MSGS)]
    pub max_msgs: usize,

    /// Default send credits of a network interface.
    #[clap(long, default_value = "256")]
    pub credits: i32,

    /// Default send credits per peer.
    #[clap(long, default_value = "8")]
    pub peer_credits: i32,

    /// Router buffer credits per peer. 0 uses the peer send credits.
    #[clap(long, default_value = "0")]
    pub peer_buffer_credits: i32,

    /// Seconds without news before a peer is considered dead. 0 disables
    /// aliveness tracking.
    #[clap(long, default_value = "0")]
    pub peer_timeout: i32,

    /// "enabled", "disabled" or empty to route only when configured as a
    /// router.
    #[clap(long, default_value = "")]
    pub forwarding: String,

    /// Tiny (header only) router buffers, 0 for the default.
    #[clap(long, default_value = "0")]
    pub tiny_router_buffers: i32,

    /// One page router buffers, 0 for the default.
    #[clap(long, default_value = "0")]
    pub small_router_buffers: i32,

    /// MTU sized router buffers, 0 for the default.
    #[clap(long, default_value = "0")]
    pub large_router_buffers: i32,

    /// Mark peers down when the network driver reports a failure.
    #[clap(long, default_value_t = true, action = ArgAction::Set)]
    pub auto_down: bool,

    /// Assume gateways are down until told otherwise.
    #[clap(long, action = ArgAction::SetTrue)]
    pub check_routers_before_use: bool,

    /// Number of portals.
    #[clap(long, default_value_t = MAX_PORTALS)]
    pub nportals: usize,

    /// Process id of this LNet instance.
    #[clap(long, default_value_t = LUSTRE_SRV_PID)]
    pub pid: u32,
}

impl Default for LnetConfig {
    fn default() -> Self {
        Self {
            cpt: CptArgs::default(),
            use_freelist: false,
            max_mes: FL_MAX_MES,
            max_mds: FL_MAX_MDS,
            max_eqs: FL_MAX_EQS,
            max_msgs: FL_MAX_MSGS,
            credits: 256,
            peer_credits: 8,
            peer_buffer_credits: 0,
            peer_timeout: 0,
            forwarding: String::new(),
            tiny_router_buffers: 0,
            small_router_buffers: 0,
            large_router_buffers: 0,
            auto_down: true,
            check_routers_before_use: false,
            nportals: MAX_PORTALS,
            pid: LUSTRE_SRV_PID,
        }
    }
}

/// What the `forwarding` tunable asks for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Forwarding {
    Unset,
    Enabled,
    Disabled,
}

impl LnetConfig {
    pub fn from_json_str(json: &str) -> Result<LnetConfig> {
        let config: LnetConfig =
            serde_json::from_str(json).context("Failed to parse LNet configuration")?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_json_file(path: &Path) -> Result<LnetConfig> {
        let json = fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        Self::from_json_str(&json).with_context(|| format!("Bad configuration in {}", path.display()))
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn validate(&self) -> Result<()> {
        self.cpt.validate()?;
        self.forwarding()?;
        if self.use_freelist
            && (self.max_mes == 0 || self.max_mds == 0 || self.max_eqs == 0 || self.max_msgs == 0)
        {
            bail!("Freelist sizes must be positive");
        }
        if self.credits <= 0 {
            bail!("credits must be positive, got {}", self.credits);
        }
        if self.peer_credits <= 0 || self.peer_credits > self.credits {
            bail!(
                "peer_credits must be in 1..={}, got {}",
                self.credits,
                self.peer_credits
            );
        }
        if self.peer_buffer_credits < 0 {
            bail!("peer_buffer_credits must not be negative");
        }
        for (name, val) in [
            ("tiny_router_buffers", self.tiny_router_buffers),
            ("small_router_buffers", self.small_router_buffers),
            ("large_router_buffers", self.large_router_buffers),
        ] {
            if val < 0 {
                bail!("{}={} invalid when routing enabled", name, val);
            }
        }
        if self.nportals == 0 || self.nportals > MAX_PORTALS {
            bail!("nportals must be in 1..={}", MAX_PORTALS);
        }
        Ok(())
    }

    pub fn forwarding(&self) -> Result<Forwarding> {
        match self.forwarding.as_str() {
            "" => Ok(Forwarding::Unset),
            "enabled" => Ok(Forwarding::Enabled),
            "disabled" => Ok(Forwarding::Disabled),
            s => bail!(
                "'forwarding' not set to either 'enabled' or 'disabled': {:?}",
                s
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_is_valid() {
        let config = LnetConfig::default();
        config.validate().unwrap();
        assert_eq!(config.forwarding().unwrap(), Forwarding::Unset);
    }

    #[test]
    fn test_json_partial() {
        let config = LnetConfig::from_json_str(
            r#"{"forwarding": "enabled", "peer_credits": 4, "cpu_npartitions": 2}"#,
        )
        .unwrap();
        assert_eq!(config.forwarding().unwrap(), Forwarding::Enabled);
        assert_eq!(config.peer_credits, 4);
        assert_eq!(config.cpt.cpu_npartitions, 2);
        assert_eq!(config.credits, 256);
    }

    #[test]
    fn test_invalid() {
        assert!(LnetConfig::from_json_str(r#"{"forwarding": "maybe"}"#).is_err());
        assert!(LnetConfig::from_json_str(r#"{"peer_credits": 0}"#).is_err());
        assert!(LnetConfig::from_json_str(r#"{"small_router_buffers": -1}"#).is_err());
        assert!(LnetConfig::from_json_str(r#"{"nportals": 65}"#).is_err());
    }

    #[test]
    fn test_json_file_round_trip() {
        let mut config = LnetConfig::default();
        config.use_freelist = true;
        config.max_msgs = 16;
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(config.to_json().unwrap().as_bytes()).unwrap();
        let loaded = LnetConfig::from_json_file(file.path()).unwrap();
        assert_eq!(loaded, config);
    }
}
