// Copyright (c) Meta Platforms, Inc. and affiliates.
//
// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! # Per-partition scalable lock
//!
//! A ScaleLock shards one logical lock over the partitions of a CptTable.
//! Every partition owns a private read/write lock protecting a block of
//! partition data `P`; the blocks are cache padded so that two partitions
//! never share a cacheline. Holders of different partitions run fully in
//! parallel.
//!
//! Table-wide mutations take the exclusive lock, which locks every partition
//! in ascending order. While an exclusive locker is waiting, new private
//! lockers queue behind it on a parent rwlock instead of starving it.
//!
//! Data shared by all partitions (`S`) can be read under any private lock
//! and written only under the exclusive lock.
//!
//! A thread already holding partition `a` may take partition `b` only when
//! `a < b` (see `lock_more()` and `lock_pair()`). This single ascending
//! order is what keeps every two-partition critical section deadlock free.
//!
//!```
//!     use cfs_utils::{CptTable, LockSel, ScaleLock, Topology};
//!     use std::sync::Arc;
//!
//!     let topo = Topology::synthetic(1, 4, 1);
//!     let cptab = Arc::new(CptTable::create(2, &topo).unwrap());
//!     let lock = ScaleLock::new(cptab, |_| 0u64, ());
//!     {
//!         let mut first = lock.lock(LockSel::Cpt(0));
//!         *first += 1;
//!         let mut second = lock.lock_more(&first, 1);
//!         *second += 1;
//!     }
//!     let mut all = lock.lock_exclusive();
//!     assert_eq!(all.iter_mut().map(|p| *p).sum::<u64>(), 2);
//!```

use crate::hash::hash_long;
use crate::hash::order_base_2;
use crate::CptTable;
use crossbeam::utils::CachePadded;
use std::cell::UnsafeCell;
use std::ops::Deref;
use std::ops::DerefMut;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::sync::PoisonError;
use std::sync::RwLock;
use std::sync::RwLockReadGuard;
use std::sync::RwLockWriteGuard;

/// Which private lock to take.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockSel {
    Cpt(usize),
    /// Partition of the CPU the caller runs on.
    Current,
}

pub struct ScaleLock<P, S = ()> {
    cptab: Arc<CptTable>,
    excl: RwLock<()>,
    locked: AtomicBool,
    parts: Vec<CachePadded<RwLock<P>>>,
    shared: UnsafeCell<S>,
}

// The shared block is only handed out as `&S` while a partition lock is held
// and as `&mut S` while every partition lock is held.
unsafe impl<P: Send, S: Send> Send for ScaleLock<P, S> {}
unsafe impl<P: Send + Sync, S: Send + Sync> Sync for ScaleLock<P, S> {}

impl<P, S> ScaleLock<P, S> {
    /// Build one private block per partition of `cptab` with `init(cpt)`.
    pub fn new(cptab: Arc<CptTable>, mut init: impl FnMut(usize) -> P, shared: S) -> Self {
        let nparts = cptab.number().max(1);
        Self {
            excl: RwLock::new(()),
            locked: AtomicBool::new(false),
            parts: (0..nparts)
                .map(|cpt| CachePadded::new(RwLock::new(init(cpt))))
                .collect(),
            shared: UnsafeCell::new(shared),
            cptab,
        }
    }

    pub fn cptab(&self) -> &Arc<CptTable> {
        &self.cptab
    }

    /// Number of private locks.
    pub fn number(&self) -> usize {
        self.parts.len()
    }

    fn resolve(&self, sel: LockSel) -> usize {
        let cpt = match sel {
            LockSel::Cpt(cpt) => cpt,
            LockSel::Current => self.cptab.current(true).unwrap_or(0),
        };
        assert!(
            cpt < self.parts.len(),
            "partition {} out of range ({})",
            cpt,
            self.parts.len()
        );
        cpt
    }

    /// Wait for a pending exclusive locker before touching a private lock.
    fn wait_exclusive(&self) {
        if self.locked.load(Ordering::Acquire) {
            drop(self.excl.read().unwrap_or_else(PoisonError::into_inner));
        }
    }

    /// Take a private lock for mutation.
    pub fn lock(&self, sel: LockSel) -> CptGuard<'_, P, S> {
        let cpt = self.resolve(sel);
        self.wait_exclusive();
        CptGuard {
            lock: self,
            cpt,
            guard: self.parts[cpt]
                .write()
                .unwrap_or_else(PoisonError::into_inner),
        }
    }

    /// Take a private lock for lookups only.
    pub fn read(&self, sel: LockSel) -> CptReadGuard<'_, P, S> {
        let cpt = self.resolve(sel);
        self.wait_exclusive();
        CptReadGuard {
            lock: self,
            cpt,
            guard: self.parts[cpt]
                .read()
                .unwrap_or_else(PoisonError::into_inner),
        }
    }

    /// Take partition `cpt` while already holding `held`.
    ///
    /// # Panics
    ///
    /// Panics unless `held.cpt() < cpt`.
    pub fn lock_more(&self, held: &CptGuard<'_, P, S>, cpt: usize) -> CptGuard<'_, P, S> {
        assert!(
            std::ptr::eq(held.lock, self),
            "lock_more() across different locks"
        );
        assert!(
            held.cpt < cpt,
            "lock order violation: holding {} while locking {}",
            held.cpt,
            cpt
        );
        let cpt = self.resolve(LockSel::Cpt(cpt));
        CptGuard {
            lock: self,
            cpt,
            guard: self.parts[cpt]
                .write()
                .unwrap_or_else(PoisonError::into_inner),
        }
    }

    /// Lock two partitions in ascending order. Both selectors may name the
    /// same partition, in which case it is locked once.
    pub fn lock_pair(&self, a: usize, b: usize) -> PairGuard<'_, P, S> {
        let (lo, hi) = if a <= b { (a, b) } else { (b, a) };
        let first = self.lock(LockSel::Cpt(lo));
        let second = if hi != lo {
            Some(self.lock_more(&first, hi))
        } else {
            None
        };
        PairGuard { first, second }
    }

    /// Lock every partition, excluding all private lock holders.
    pub fn lock_exclusive(&self) -> ExclusiveGuard<'_, P, S> {
        if self.parts.len() == 1 {
            return ExclusiveGuard {
                lock: self,
                guards: vec![self.parts[0]
                    .write()
                    .unwrap_or_else(PoisonError::into_inner)],
                _excl: None,
            };
        }

        let excl = self.excl.write().unwrap_or_else(PoisonError::into_inner);
        assert!(!self.locked.load(Ordering::Acquire));
        // Private lockers arriving from now on wait on `excl`.
        self.locked.store(true, Ordering::Release);
        let guards = self
            .parts
            .iter()
            .map(|part| part.write().unwrap_or_else(PoisonError::into_inner))
            .collect();
        ExclusiveGuard {
            lock: self,
            guards,
            _excl: Some(excl),
        }
    }

    /// Map a 64-bit key onto a partition.
    pub fn key_index(&self, key: u64) -> usize {
        key_index(key, self.parts.len())
    }
}

/// Map a 64-bit key onto one of `nparts` partitions.
pub fn key_index(key: u64, nparts: usize) -> usize {
    if nparts <= 1 {
        return 0;
    }
    if nparts.is_power_of_two() {
        hash_long(key, order_base_2(nparts)) as usize
    } else {
        (hash_long(key, 32) % nparts as u64) as usize
    }
}

pub struct CptGuard<'a, P, S> {
    lock: &'a ScaleLock<P, S>,
    cpt: usize,
    guard: RwLockWriteGuard<'a, P>,
}

impl<P, S> CptGuard<'_, P, S> {
    pub fn cpt(&self) -> usize {
        self.cpt
    }

    pub fn shared(&self) -> &S {
        unsafe { &*self.lock.shared.get() }
    }

    /// Shared data and this partition's block at once.
    pub fn split_mut(&mut self) -> (&S, &mut P) {
        let shared = unsafe { &*self.lock.shared.get() };
        (shared, &mut self.guard)
    }
}

impl<P, S> Deref for CptGuard<'_, P, S> {
    type Target = P;

    fn deref(&self) -> &P {
        &self.guard
    }
}

impl<P, S> DerefMut for CptGuard<'_, P, S> {
    fn deref_mut(&mut self) -> &mut P {
        &mut self.guard
    }
}

pub struct CptReadGuard<'a, P, S> {
    lock: &'a ScaleLock<P, S>,
    cpt: usize,
    guard: RwLockReadGuard<'a, P>,
}

impl<P, S> CptReadGuard<'_, P, S> {
    pub fn cpt(&self) -> usize {
        self.cpt
    }

    pub fn shared(&self) -> &S {
        unsafe { &*self.lock.shared.get() }
    }
}

impl<P, S> Deref for CptReadGuard<'_, P, S> {
    type Target = P;

    fn deref(&self) -> &P {
        &self.guard
    }
}

/// Two partitions taken in ascending order, released together.
pub struct PairGuard<'a, P, S> {
    first: CptGuard<'a, P, S>,
    second: Option<CptGuard<'a, P, S>>,
}

impl<P, S> PairGuard<'_, P, S> {
    /// Data of partition `cpt`, which must be one of the pair.
    ///
    /// # Panics
    ///
    /// Panics if `cpt` is not held by this guard.
    pub fn get_mut(&mut self, cpt: usize) -> &mut P {
        if self.first.cpt == cpt {
            return &mut *self.first;
        }
        match &mut self.second {
            Some(second) if second.cpt == cpt => &mut **second,
            _ => panic!("partition {} is not held by this pair", cpt),
        }
    }

    /// Mutable access to both partitions, lower index first.
    pub fn both_mut(&mut self) -> (&mut P, Option<&mut P>) {
        (&mut *self.first, self.second.as_deref_mut())
    }

    pub fn shared(&self) -> &S {
        self.first.shared()
    }
}

pub struct ExclusiveGuard<'a, P, S> {
    lock: &'a ScaleLock<P, S>,
    guards: Vec<RwLockWriteGuard<'a, P>>,
    _excl: Option<RwLockWriteGuard<'a, ()>>,
}

impl<P, S> ExclusiveGuard<'_, P, S> {
    pub fn number(&self) -> usize {
        self.guards.len()
    }

    pub fn part(&self, cpt: usize) -> &P {
        &self.guards[cpt]
    }

    pub fn part_mut(&mut self, cpt: usize) -> &mut P {
        &mut self.guards[cpt]
    }

    pub fn iter_mut(&mut self) -> std::vec::IntoIter<&mut P> {
        let parts: Vec<&mut P> = self.guards.iter_mut().map(|g| &mut **g).collect();
        parts.into_iter()
    }

    pub fn shared(&self) -> &S {
        unsafe { &*self.lock.shared.get() }
    }

    pub fn shared_mut(&mut self) -> &mut S {
        unsafe { &mut *self.lock.shared.get() }
    }

    /// Shared data and every partition at once.
    pub fn split_mut(&mut self) -> (&mut S, Vec<&mut P>) {
        let shared = unsafe { &mut *self.lock.shared.get() };
        (shared, self.guards.iter_mut().map(|g| &mut **g).collect())
    }
}

impl<P, S> Drop for ExclusiveGuard<'_, P, S> {
    fn drop(&mut self) {
        // Partitions go first, then `excl` is released by the field drop.
        self.guards.clear();
        if self._excl.is_some() {
            self.lock.locked.store(false, Ordering::Release);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Topology;
    use rand::Rng;
    use std::thread;

    fn make_lock(ncpt: i32) -> ScaleLock<u64, u64> {
        let topo = Topology::synthetic(1, 8, 1);
        let cptab = Arc::new(CptTable::create(ncpt, &topo).unwrap());
        ScaleLock::new(cptab, |_| 0, 0)
    }

    #[test]
    fn test_private_and_exclusive() {
        let lock = make_lock(4);
        assert_eq!(lock.number(), 4);
        for cpt in 0..4 {
            *lock.lock(LockSel::Cpt(cpt)) += cpt as u64;
        }
        {
            let guard = lock.read(LockSel::Cpt(3));
            assert_eq!(*guard, 3);
            assert_eq!(*guard.shared(), 0);
        }
        let mut all = lock.lock_exclusive();
        *all.shared_mut() = 7;
        assert_eq!(all.iter_mut().map(|p| *p).sum::<u64>(), 6);
        drop(all);
        assert_eq!(*lock.lock(LockSel::Current).shared(), 7);
        assert!(!lock.locked.load(Ordering::Acquire));
    }

    #[test]
    fn test_single_partition_exclusive() {
        let lock = make_lock(1);
        let all = lock.lock_exclusive();
        assert_eq!(all.number(), 1);
        drop(all);
        assert_eq!(lock.key_index(12345), 0);
    }

    #[test]
    #[should_panic(expected = "lock order violation")]
    fn test_lock_more_descending_panics() {
        let lock = make_lock(4);
        let held = lock.lock(LockSel::Cpt(2));
        let _more = lock.lock_more(&held, 1);
    }

    #[test]
    fn test_pair_same_partition() {
        let lock = make_lock(4);
        let mut pair = lock.lock_pair(2, 2);
        *pair.get_mut(2) = 5;
        let (a, b) = pair.both_mut();
        assert_eq!(*a, 5);
        assert!(b.is_none());
    }

    #[test]
    fn test_key_index_in_range() {
        for n in [1usize, 2, 3, 4, 6, 8] {
            for key in 0..256u64 {
                assert!(key_index(key * 0x1_0000_0001, n) < n);
            }
        }
    }

    #[test]
    fn test_random_pairs_stress() {
        let lock = Arc::new(make_lock(4));
        let threads: Vec<_> = (0..8)
            .map(|i| {
                let lock = lock.clone();
                thread::spawn(move || {
                    let mut rng = rand::thread_rng();
                    for n in 0..2000 {
                        if i == 0 && n % 100 == 0 {
                            let mut all = lock.lock_exclusive();
                            *all.shared_mut() += 1;
                            continue;
                        }
                        let a = rng.gen_range(0..4);
                        let b = rng.gen_range(0..4);
                        let mut pair = lock.lock_pair(a, b);
                        *pair.get_mut(a) += 1;
                        if a != b {
                            *pair.get_mut(b) += 1;
                        }
                    }
                })
            })
            .collect();
        for t in threads {
            t.join().unwrap();
        }
        let mut all = lock.lock_exclusive();
        assert_eq!(*all.shared(), 20);
        assert!(all.iter_mut().map(|p| *p).sum::<u64>() > 0);
    }
}
