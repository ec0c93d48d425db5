// Copyright (c) Meta Platforms, Inc. and affiliates.
//
// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! Logical to physical offset translation for the object backend.

use anyhow::bail;
use anyhow::Result;
use std::collections::BTreeMap;
use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::PoisonError;

/// A run of object bytes stored contiguously on disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Extent {
    pub logical: u64,
    pub physical: u64,
    pub length: u64,
}

impl Extent {
    pub fn covers(&self, start: u64, len: u64) -> bool {
        start >= self.logical && start + len <= self.logical + self.length
    }
}

/// fiemap of the object store.
///
/// May block; it is never called while a request queue is locked.
pub trait ExtentMapper: Send + Sync {
    /// At most `max` extents mapping bytes `[start, start + len)` of
    /// object `object_id` on OST `ost_idx`, in logical order.
    fn fiemap(&self, ost_idx: u32, object_id: u64, start: u64, len: u64, max: usize)
        -> Result<Vec<Extent>>;
}

/// Extent maps kept in memory, for simulations and tests.
#[derive(Default)]
pub struct ExtentTable {
    objects: Mutex<HashMap<(u32, u64), BTreeMap<u64, Extent>>>,
}

impl ExtentTable {
    pub fn new() -> ExtentTable {
        ExtentTable::default()
    }

    /// Map `length` bytes of the object at `logical` to `physical`.
    pub fn map(&self, ost_idx: u32, object_id: u64, logical: u64, physical: u64, length: u64) {
        let mut objects = self.objects.lock().unwrap_or_else(PoisonError::into_inner);
        objects.entry((ost_idx, object_id)).or_default().insert(
            logical,
            Extent {
                logical,
                physical,
                length,
            },
        );
    }
}

impl ExtentMapper for ExtentTable {
    fn fiemap(
        &self,
        ost_idx: u32,
        object_id: u64,
        start: u64,
        len: u64,
        max: usize,
    ) -> Result<Vec<Extent>> {
        let objects = self.objects.lock().unwrap_or_else(PoisonError::into_inner);
        let map = match objects.get(&(ost_idx, object_id)) {
            Some(map) => map,
            None => bail!("No object {:#x} on OST {}", object_id, ost_idx),
        };
        let end = start.saturating_add(len);
        // The extent holding `start` may begin before it.
        let first = map
            .range(..=start)
            .next_back()
            .map_or(start, |(logical, _)| *logical);
        Ok(map
            .range(first..end)
            .map(|(_, ext)| *ext)
            .filter(|ext| ext.logical + ext.length > start)
            .take(max)
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fiemap() {
        let table = ExtentTable::new();
        table.map(0, 1, 0, 1 << 20, 8192);
        table.map(0, 1, 8192, 4 << 20, 8192);

        let exts = table.fiemap(0, 1, 4096, 2048, 2).unwrap();
        assert_eq!(exts.len(), 1);
        assert!(exts[0].covers(4096, 2048));
        assert_eq!(exts[0].physical, 1 << 20);

        let exts = table.fiemap(0, 1, 4096, 8192, 2).unwrap();
        assert_eq!(exts.len(), 2);
        assert!(!exts[0].covers(4096, 8192));

        assert!(table.fiemap(0, 1, 65536, 10, 2).unwrap().is_empty());
        assert!(table.fiemap(1, 1, 0, 10, 2).is_err());
    }
}
