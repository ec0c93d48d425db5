// Copyright (c) Meta Platforms, Inc. and affiliates.
//
// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! # Object allocation strategies
//!
//! EQs, MDs, MEs and messages are drawn from an `ObjPool`. Two strategies
//! exist and the one in use is picked once, when the LNet context is built
//! (`LnetConfig::use_freelist`):
//!
//! - `FreeList`: a fixed number of objects allocated up front. `alloc()`
//!   fails once they are all handed out, and freed objects go back on the
//!   list for reuse.
//! - `HeapAlloc`: every `alloc()` is a fresh allocation and `free()` drops
//!   the object.
//!
//! Either way the caller gets a fully reset object. Pools do no locking of
//! their own; they live inside a partition block or behind a mutex.

/// Objects that can be recycled through a pool.
pub trait Recycle: Default {
    /// Bring a previously used object back to its initial state.
    fn recycle(&mut self) {
        *self = Self::default();
    }
}

pub trait ObjPool<T>: Send + Sync {
    /// Hand out a reset object, `None` when the pool is exhausted.
    fn alloc(&mut self) -> Option<Box<T>>;

    /// Take an object back.
    fn free(&mut self, obj: Box<T>);

    /// Objects currently handed out.
    fn in_use(&self) -> usize;

    /// Upper bound on `in_use()`, `None` when unbounded.
    fn capacity(&self) -> Option<usize>;
}

pub struct FreeList<T> {
    objs: Vec<Box<T>>,
    nobjs: usize,
}

impl<T: Recycle> FreeList<T> {
    pub fn new(nobjs: usize) -> Self {
        Self {
            objs: (0..nobjs).map(|_| Box::default()).collect(),
            nobjs,
        }
    }
}

impl<T: Recycle + Send + Sync> ObjPool<T> for FreeList<T> {
    fn alloc(&mut self) -> Option<Box<T>> {
        let mut obj = self.objs.pop()?;
        obj.recycle();
        Some(obj)
    }

    fn free(&mut self, obj: Box<T>) {
        assert!(
            self.objs.len() < self.nobjs,
            "freelist overflow: more objects freed than allocated"
        );
        self.objs.push(obj);
    }

    fn in_use(&self) -> usize {
        self.nobjs - self.objs.len()
    }

    fn capacity(&self) -> Option<usize> {
        Some(self.nobjs)
    }
}

#[derive(Default)]
pub struct HeapAlloc {
    nallocs: usize,
}

impl<T: Recycle + Send + Sync> ObjPool<T> for HeapAlloc {
    fn alloc(&mut self) -> Option<Box<T>> {
        self.nallocs += 1;
        Some(Box::default())
    }

    fn free(&mut self, _obj: Box<T>) {
        assert!(self.nallocs > 0, "freeing an object that was never allocated");
        self.nallocs -= 1;
    }

    fn in_use(&self) -> usize {
        self.nallocs
    }

    fn capacity(&self) -> Option<usize> {
        None
    }
}

/// Pick the strategy for one object type.
pub fn new_pool<T: Recycle + Send + Sync + 'static>(
    use_freelist: bool,
    nobjs: usize,
) -> Box<dyn ObjPool<T>> {
    if use_freelist {
        Box::new(FreeList::<T>::new(nobjs))
    } else {
        Box::new(HeapAlloc::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct Obj {
        val: u64,
        buf: Vec<u8>,
    }

    impl Recycle for Obj {
        fn recycle(&mut self) {
            self.val = 0;
            self.buf.clear();
        }
    }

    #[test]
    fn test_freelist_exhaustion() {
        let mut pool = new_pool::<Obj>(true, 2);
        let mut a = pool.alloc().unwrap();
        let b = pool.alloc().unwrap();
        assert!(pool.alloc().is_none());
        assert_eq!(pool.in_use(), 2);
        assert_eq!(pool.capacity(), Some(2));

        a.val = 7;
        a.buf.extend_from_slice(&[1, 2, 3]);
        pool.free(a);
        let c = pool.alloc().unwrap();
        assert_eq!(c.val, 0);
        assert!(c.buf.is_empty());
        assert!(c.buf.capacity() >= 3);
        pool.free(b);
        pool.free(c);
        assert_eq!(pool.in_use(), 0);
    }

    #[test]
    fn test_heap_alloc() {
        let mut pool = new_pool::<Obj>(false, 2);
        let objs: Vec<_> = (0..10).map(|_| pool.alloc().unwrap()).collect();
        assert_eq!(pool.in_use(), 10);
        assert_eq!(pool.capacity(), None);
        for obj in objs {
            pool.free(obj);
        }
        assert_eq!(pool.in_use(), 0);
    }

    #[test]
    #[should_panic(expected = "freelist overflow")]
    fn test_freelist_double_free() {
        let mut pool = FreeList::<Obj>::new(1);
        pool.free(Box::default());
    }
}
