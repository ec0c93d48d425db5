// Copyright (c) Meta Platforms, Inc. and affiliates.
//
// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! Match entries.
//!
//! An ME sits on the match list of one portal and selects incoming PUTs and
//! GETs by source and match bits. At most one MD hangs off an ME at a time.

use crate::md::Unlink;
use crate::types::ProcessId;
use crate::Recycle;

/// Where a new ME goes relative to the list (or to another ME).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsPos {
    Before,
    After,
}

pub(crate) struct Me {
    pub(crate) portal: usize,
    pub(crate) match_id: ProcessId,
    pub(crate) match_bits: u64,
    pub(crate) ignore_bits: u64,
    pub(crate) unlink: Unlink,
    /// Cookie of the attached MD.
    pub(crate) md: Option<u64>,
}

impl Default for Me {
    fn default() -> Self {
        Self {
            portal: 0,
            match_id: ProcessId::ANY,
            match_bits: 0,
            ignore_bits: 0,
            unlink: Unlink::Retain,
            md: None,
        }
    }
}

impl Recycle for Me {}

impl Me {
    /// The ME accepts messages from `src` carrying `match_bits`.
    pub(crate) fn matches(&self, src: ProcessId, match_bits: u64) -> bool {
        if !self.match_id.nid.is_any() && self.match_id.nid != src.nid {
            return false;
        }
        if self.match_id.pid != ProcessId::ANY.pid && self.match_id.pid != src.pid {
            return false;
        }
        (self.match_bits ^ match_bits) & !self.ignore_bits == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Nid;

    #[test]
    fn test_matches() {
        let nid: Nid = "1@gni".parse().unwrap();
        let me = Me {
            match_id: ProcessId::new(nid, ProcessId::ANY.pid),
            match_bits: 0xf0,
            ignore_bits: 0x0f,
            ..Default::default()
        };
        assert!(me.matches(ProcessId::new(nid, 7), 0xf3));
        assert!(!me.matches(ProcessId::new(nid, 7), 0x70));
        assert!(!me.matches(ProcessId::new("2@gni".parse().unwrap(), 7), 0xf0));

        let any = Me::default();
        assert!(any.matches(ProcessId::new(nid, 1), 0));
        assert!(!any.matches(ProcessId::new(nid, 1), 1));
    }
}
