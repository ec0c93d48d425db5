// Copyright (c) Meta Platforms, Inc. and affiliates.
//
// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! # Handle tables
//!
//! Every EQ, MD and ME is registered in the handle table of one resource
//! partition. A cookie packs the object type, the partition and a
//! generation:
//!
//!```text
//!  63            32 31          10 9        2 1    0
//! +----------------+--------------+----------+------+
//! |   generation   |     slot     |   cpt    | type |
//! +----------------+--------------+----------+------+
//!```
//!
//! The slot indexes an arena and the generation counts how often that slot
//! has been filled. Lookups compare the whole cookie, so a reused slot does
//! not resolve an old cookie until the same slot has been refilled 2^32
//! times. Freed slots are reused oldest first.
//!
//! An invalidated entry stays in the arena until it is removed, which lets
//! the engine keep using a zombie object its messages still reference while
//! user lookups already fail.

use std::collections::VecDeque;
use std::fmt;

pub const COOKIE_TYPE_BITS: u32 = 2;
pub const CPT_BITS: u32 = 8;
const SLOT_SHIFT: u32 = COOKIE_TYPE_BITS + CPT_BITS;
const SLOT_BITS: u32 = 22;
const UNIQ_SHIFT: u32 = SLOT_SHIFT + SLOT_BITS;

/// Cookie value that never names an object.
pub const COOKIE_NONE: u64 = u64::MAX;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CookieType {
    Eq = 0,
    Md = 1,
    Me = 2,
}

impl CookieType {
    fn from_bits(bits: u64) -> Option<CookieType> {
        match bits {
            0 => Some(CookieType::Eq),
            1 => Some(CookieType::Md),
            2 => Some(CookieType::Me),
            _ => None,
        }
    }
}

/// Type of the object a cookie names, `None` for garbage.
pub fn cookie_type(cookie: u64) -> Option<CookieType> {
    if cookie == COOKIE_NONE {
        return None;
    }
    CookieType::from_bits(cookie & ((1 << COOKIE_TYPE_BITS) - 1))
}

/// Resource partition a cookie was minted in.
pub fn cpt_of_cookie(cookie: u64) -> usize {
    ((cookie >> COOKIE_TYPE_BITS) & ((1 << CPT_BITS) - 1)) as usize
}

fn slot_of_cookie(cookie: u64) -> usize {
    ((cookie >> SLOT_SHIFT) & ((1 << SLOT_BITS) - 1)) as usize
}

macro_rules! handle_type {
    ($name:ident, $what:literal) => {
        #[doc = concat!("User handle of ", $what, ".")]
        #[derive(Clone, Copy, PartialEq, Eq, Hash)]
        pub struct $name(pub(crate) u64);

        impl $name {
            pub const INVALID: $name = $name(COOKIE_NONE);

            pub fn cookie(&self) -> u64 {
                self.0
            }

            pub fn from_cookie(cookie: u64) -> $name {
                $name(cookie)
            }

            pub fn is_invalid(&self) -> bool {
                self.0 == COOKIE_NONE
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, concat!(stringify!($name), "({:#x})"), self.0)
            }
        }
    };
}

handle_type!(EqHandle, "an event queue");
handle_type!(MdHandle, "a memory descriptor");
handle_type!(MeHandle, "a match entry");

struct Entry<T> {
    cookie: u64,
    hashed: bool,
    obj: T,
}

/// Arena of objects of one type in one resource partition.
///
/// All methods expect the caller to hold the partition's lock.
pub struct HandleTable<T> {
    kind: CookieType,
    cpt: usize,
    slots: Vec<Option<Entry<T>>>,
    /// Generation last minted per slot.
    gens: Vec<u32>,
    free: VecDeque<usize>,
    nlive: usize,
}

impl<T> HandleTable<T> {
    pub fn new(kind: CookieType, cpt: usize) -> Self {
        assert!(cpt < (1 << CPT_BITS), "partition {} can't be encoded", cpt);
        Self {
            kind,
            cpt,
            slots: Vec::new(),
            gens: Vec::new(),
            free: VecDeque::new(),
            nlive: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.nlive
    }

    pub fn is_empty(&self) -> bool {
        self.nlive == 0
    }

    /// Register `obj` under a freshly minted cookie.
    ///
    /// # Panics
    ///
    /// Panics when the arena has no slot left to encode.
    pub fn insert(&mut self, obj: T) -> u64 {
        let slot = match self.free.pop_front() {
            Some(slot) => slot,
            None => {
                self.slots.push(None);
                self.gens.push(0);
                self.slots.len() - 1
            }
        };
        assert!(slot < (1 << SLOT_BITS), "handle table full");

        let gen = self.gens[slot].wrapping_add(1);
        self.gens[slot] = gen;
        let cookie = ((gen as u64) << UNIQ_SHIFT)
            | ((slot as u64) << SLOT_SHIFT)
            | ((self.cpt as u64) << COOKIE_TYPE_BITS)
            | self.kind as u64;
        self.slots[slot] = Some(Entry {
            cookie,
            hashed: true,
            obj,
        });
        self.nlive += 1;
        cookie
    }

    fn entry(&self, cookie: u64) -> Option<&Entry<T>> {
        if cookie_type(cookie) != Some(self.kind) || cpt_of_cookie(cookie) != self.cpt {
            return None;
        }
        match self.slots.get(slot_of_cookie(cookie)) {
            Some(Some(entry)) if entry.cookie == cookie => Some(entry),
            _ => None,
        }
    }

    fn entry_mut(&mut self, cookie: u64) -> Option<&mut Entry<T>> {
        if cookie_type(cookie) != Some(self.kind) || cpt_of_cookie(cookie) != self.cpt {
            return None;
        }
        match self.slots.get_mut(slot_of_cookie(cookie)) {
            Some(Some(entry)) if entry.cookie == cookie => Some(entry),
            _ => None,
        }
    }

    /// Resolve a user cookie. Invalidated objects never resolve.
    pub fn lookup(&self, cookie: u64) -> Option<&T> {
        self.entry(cookie).filter(|e| e.hashed).map(|e| &e.obj)
    }

    pub fn lookup_mut(&mut self, cookie: u64) -> Option<&mut T> {
        self.entry_mut(cookie).filter(|e| e.hashed).map(|e| &mut e.obj)
    }

    /// Resolve a cookie held internally, including invalidated objects
    /// that have not been removed yet.
    pub fn get(&self, cookie: u64) -> Option<&T> {
        self.entry(cookie).map(|e| &e.obj)
    }

    pub fn get_mut(&mut self, cookie: u64) -> Option<&mut T> {
        self.entry_mut(cookie).map(|e| &mut e.obj)
    }

    /// Stop resolving `cookie` for users. Returns false if it was not live.
    pub fn invalidate(&mut self, cookie: u64) -> bool {
        match self.entry_mut(cookie) {
            Some(entry) if entry.hashed => {
                entry.hashed = false;
                true
            }
            _ => false,
        }
    }

    pub fn is_valid(&self, cookie: u64) -> bool {
        self.lookup(cookie).is_some()
    }

    /// Take the object out of the arena, freeing its slot.
    pub fn remove(&mut self, cookie: u64) -> Option<T> {
        let slot = slot_of_cookie(cookie);
        self.entry(cookie)?;
        let entry = self.slots[slot].take()?;
        self.free.push_back(slot);
        self.nlive -= 1;
        Some(entry.obj)
    }

    /// Cookies of every object still in the arena.
    pub fn cookies(&self) -> Vec<u64> {
        self.slots
            .iter()
            .flatten()
            .map(|e| e.cookie)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_trip_and_invalidate() {
        let mut table = HandleTable::new(CookieType::Md, 3);
        let a = table.insert("a");
        let b = table.insert("b");
        assert_eq!(cookie_type(a), Some(CookieType::Md));
        assert_eq!(cpt_of_cookie(a), 3);
        assert_eq!(table.lookup(a), Some(&"a"));
        assert_eq!(table.lookup(b), Some(&"b"));

        assert!(table.invalidate(a));
        assert!(!table.invalidate(a));
        assert_eq!(table.lookup(a), None);
        // Still reachable internally until removed.
        assert_eq!(table.get(a), Some(&"a"));
        assert_eq!(table.remove(a), Some("a"));
        assert_eq!(table.get(a), None);
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_reused_slot_does_not_alias() {
        let mut table = HandleTable::new(CookieType::Me, 0);
        let old = table.insert(1);
        table.invalidate(old);
        table.remove(old);
        let new = table.insert(2);
        assert_eq!(slot_of_cookie(old), slot_of_cookie(new));
        assert_ne!(old, new);
        assert_eq!(table.lookup(old), None);
        assert_eq!(table.lookup(new), Some(&2));
    }

    #[test]
    fn test_slot_generations() {
        let mut table = HandleTable::new(CookieType::Md, 2);
        let first = table.insert(0);
        table.remove(first);
        let mut seen = std::collections::HashSet::new();
        seen.insert(first);
        let mut cookie = first;
        for i in 1..1000 {
            table.remove(cookie);
            cookie = table.insert(i);
            assert_eq!(slot_of_cookie(cookie), slot_of_cookie(first));
            assert!(seen.insert(cookie));
            assert_eq!(cookie >> UNIQ_SHIFT, i as u64 + 1);
        }
        assert_eq!(table.lookup(first), None);
        assert_eq!(table.lookup(cookie), Some(&999));
    }

    #[test]
    fn test_generation_wraps_in_field() {
        let mut table = HandleTable::new(CookieType::Eq, 1);
        let a = table.insert("a");
        table.remove(a);
        table.gens[slot_of_cookie(a)] = u32::MAX;
        let b = table.insert("b");
        // The counter wraps to zero without spilling into the type bits.
        assert_eq!(b >> UNIQ_SHIFT, 0);
        assert_eq!(cookie_type(b), Some(CookieType::Eq));
        assert_eq!(cpt_of_cookie(b), 1);
        assert_eq!(table.lookup(b), Some(&"b"));
        assert_eq!(table.lookup(a), None);
    }

    #[test]
    fn test_foreign_cookies() {
        let mut eqs = HandleTable::new(CookieType::Eq, 0);
        let mut mds = HandleTable::new(CookieType::Md, 0);
        let eq = eqs.insert(());
        let md = mds.insert(());
        assert_eq!(mds.lookup(eq), None);
        assert_eq!(eqs.lookup(md), None);

        let other = HandleTable::<()>::new(CookieType::Eq, 1);
        assert_eq!(other.lookup(eq), None);
        assert_eq!(eqs.lookup(COOKIE_NONE), None);
        assert!(EqHandle::INVALID.is_invalid());
    }
}
