// Copyright (c) Meta Platforms, Inc. and affiliates.
//
// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! # Portals
//!
//! A portal is an index into a table of match lists. The first ME attached
//! to a portal fixes how it matches for good:
//!
//! - unique: every ME names an exact source NID and PID and has no ignore
//!   bits, so MEs are spread over hash buckets keyed by source and match
//!   bits and an incoming message only scans its own bucket;
//! - wildcard: a single ordered list.
//!
//! A lazy portal parks PUTs that match nothing instead of dropping them, and
//! retries them whenever a new MD is attached.

use crate::me::InsPos;
use crate::msg::Msg;
use crate::types::ProcessId;
use cfs_utils::hash_long;
use std::collections::VecDeque;

pub(crate) const PORTAL_HASH_BITS: u32 = 8;
pub(crate) const PORTAL_HASH_SIZE: usize = 1 << PORTAL_HASH_BITS;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PortalKind {
    Unset,
    Unique,
    Wildcard,
}

fn is_unique(match_id: ProcessId, ignore_bits: u64) -> bool {
    ignore_bits == 0 && !match_id.nid.is_any() && match_id.pid != ProcessId::ANY.pid
}

fn bucket_of(id: ProcessId, match_bits: u64) -> usize {
    let key = match_bits
        .wrapping_add(id.nid.raw())
        .wrapping_add(id.pid as u64);
    hash_long(key, PORTAL_HASH_BITS) as usize
}

pub(crate) struct Portal {
    pub(crate) index: usize,
    kind: PortalKind,
    pub(crate) lazy: bool,
    wildcard: Vec<u64>,
    /// Allocated when the portal turns unique.
    unique: Vec<Vec<u64>>,
    /// PUTs waiting for an MD, oldest first.
    pub(crate) delayed: VecDeque<Box<Msg>>,
}

impl Portal {
    pub(crate) fn new(index: usize) -> Portal {
        Portal {
            index,
            kind: PortalKind::Unset,
            lazy: false,
            wildcard: Vec::new(),
            unique: Vec::new(),
            delayed: VecDeque::new(),
        }
    }

    pub(crate) fn kind(&self) -> PortalKind {
        self.kind
    }

    /// Check an ME with these match criteria may go on this portal, fixing
    /// the portal kind if this is its first ME.
    pub(crate) fn type_match(&mut self, match_id: ProcessId, ignore_bits: u64) -> bool {
        let unique = is_unique(match_id, ignore_bits);
        match self.kind {
            PortalKind::Unset => {
                if unique {
                    self.kind = PortalKind::Unique;
                    self.unique = vec![Vec::new(); PORTAL_HASH_SIZE];
                } else {
                    self.kind = PortalKind::Wildcard;
                }
                true
            }
            PortalKind::Unique => unique,
            PortalKind::Wildcard => !unique,
        }
    }

    fn list(&self, id: ProcessId, match_bits: u64) -> Option<&Vec<u64>> {
        match self.kind {
            PortalKind::Unset => None,
            PortalKind::Wildcard => Some(&self.wildcard),
            PortalKind::Unique => self.unique.get(bucket_of(id, match_bits)),
        }
    }

    fn list_mut(&mut self, id: ProcessId, match_bits: u64) -> Option<&mut Vec<u64>> {
        match self.kind {
            PortalKind::Unset => None,
            PortalKind::Wildcard => Some(&mut self.wildcard),
            PortalKind::Unique => self.unique.get_mut(bucket_of(id, match_bits)),
        }
    }

    /// MEs an incoming message from `src` carrying `match_bits` may match,
    /// in match order.
    pub(crate) fn candidates(&self, src: ProcessId, match_bits: u64) -> Vec<u64> {
        self.list(src, match_bits).cloned().unwrap_or_default()
    }

    /// Put a new ME at the head or the tail of its list.
    pub(crate) fn attach(&mut self, me: u64, match_id: ProcessId, match_bits: u64, pos: InsPos) {
        if let Some(list) = self.list_mut(match_id, match_bits) {
            match pos {
                InsPos::Before => list.insert(0, me),
                InsPos::After => list.push(me),
            }
        }
    }

    /// Put a new ME next to `anchor`. Returns false if `anchor` is not on
    /// the list the new ME belongs to.
    pub(crate) fn insert_near(
        &mut self,
        me: u64,
        match_id: ProcessId,
        match_bits: u64,
        anchor: u64,
        pos: InsPos,
    ) -> bool {
        let list = match self.list_mut(match_id, match_bits) {
            Some(list) => list,
            None => return false,
        };
        match list.iter().position(|c| *c == anchor) {
            Some(idx) => {
                let idx = match pos {
                    InsPos::Before => idx,
                    InsPos::After => idx + 1,
                };
                list.insert(idx, me);
                true
            }
            None => false,
        }
    }

    pub(crate) fn detach(&mut self, me: u64, match_id: ProcessId, match_bits: u64) {
        if let Some(list) = self.list_mut(match_id, match_bits) {
            if let Some(idx) = list.iter().position(|c| *c == me) {
                list.remove(idx);
            }
        }
    }

    pub(crate) fn nmes(&self) -> usize {
        match self.kind {
            PortalKind::Unset => 0,
            PortalKind::Wildcard => self.wildcard.len(),
            PortalKind::Unique => self.unique.iter().map(|b| b.len()).sum(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Nid;

    fn nid(s: &str) -> Nid {
        s.parse().unwrap()
    }

    #[test]
    fn test_kind_is_sticky() {
        let mut ptl = Portal::new(3);
        assert_eq!(ptl.kind(), PortalKind::Unset);
        assert!(ptl.type_match(ProcessId::ANY, 0));
        assert_eq!(ptl.kind(), PortalKind::Wildcard);
        assert!(!ptl.type_match(ProcessId::new(nid("1@gni"), 12345), 0));
        assert!(ptl.type_match(ProcessId::new(nid("1@gni"), 12345), 1));

        let mut ptl = Portal::new(4);
        assert!(ptl.type_match(ProcessId::new(nid("1@gni"), 12345), 0));
        assert_eq!(ptl.kind(), PortalKind::Unique);
        assert!(!ptl.type_match(ProcessId::ANY, 0));
    }

    #[test]
    fn test_wildcard_order() {
        let mut ptl = Portal::new(0);
        ptl.type_match(ProcessId::ANY, 0);
        ptl.attach(1, ProcessId::ANY, 0, InsPos::After);
        ptl.attach(2, ProcessId::ANY, 0, InsPos::After);
        ptl.attach(0, ProcessId::ANY, 0, InsPos::Before);
        assert!(ptl.insert_near(5, ProcessId::ANY, 0, 1, InsPos::After));
        assert!(!ptl.insert_near(6, ProcessId::ANY, 0, 42, InsPos::After));
        assert_eq!(ptl.candidates(ProcessId::ANY, 7), vec![0, 1, 5, 2]);
        ptl.detach(1, ProcessId::ANY, 0);
        assert_eq!(ptl.candidates(ProcessId::ANY, 7), vec![0, 5, 2]);
        assert_eq!(ptl.nmes(), 3);
    }

    #[test]
    fn test_unique_buckets() {
        let mut ptl = Portal::new(0);
        let a = ProcessId::new(nid("1@gni"), 12345);
        let b = ProcessId::new(nid("2@gni"), 12345);
        ptl.type_match(a, 0);
        ptl.attach(10, a, 0x10, InsPos::After);
        ptl.attach(20, b, 0x20, InsPos::After);
        assert!(ptl.candidates(a, 0x10).contains(&10));
        assert!(ptl.candidates(b, 0x20).contains(&20));
        assert_eq!(ptl.nmes(), 2);
        ptl.detach(10, a, 0x10);
        assert!(!ptl.candidates(a, 0x10).contains(&10));
    }
}
