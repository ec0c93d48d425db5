// Copyright (c) Meta Platforms, Inc. and affiliates.
//
// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! # Event queues
//!
//! An event queue is a ring of `Event`s whose size is a power of two.
//! Producers stamp every event with an ever increasing sequence number and
//! store it at `sequence & (size - 1)`, overwriting whatever was there.
//! The consumer remembers the next sequence it expects; finding a newer
//! sequence in the slot means the ring wrapped and events were lost, which
//! is reported as an overflow together with the oldest surviving event.
//!
//! Keeping the size a power of two means the sequence counters can wrap
//! without the ring ever changing its apparent capacity.

use crate::error::Status;
use crate::handle::MdHandle;
use crate::md::MdInfo;
use crate::types::Nid;
use crate::types::ProcessId;
use crate::Recycle;
use std::fmt;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::sync::Condvar;
use std::sync::Mutex;
use std::sync::PoisonError;
use std::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    /// An incoming GET was served from an MD.
    Get,
    /// An incoming PUT landed in an MD.
    Put,
    /// The REPLY to a GET arrived.
    Reply,
    /// The ACK of a PUT arrived.
    Ack,
    /// An outgoing PUT or GET left the MD.
    Send,
    /// The MD was unlinked.
    Unlink,
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            EventKind::Get => "GET",
            EventKind::Put => "PUT",
            EventKind::Reply => "REPLY",
            EventKind::Ack => "ACK",
            EventKind::Send => "SEND",
            EventKind::Unlink => "UNLINK",
        };
        write!(f, "{}", s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Event {
    pub kind: EventKind,
    pub target: ProcessId,
    pub initiator: ProcessId,
    /// Peer the message actually came from, the last router if routed.
    pub sender: Nid,
    pub pt_index: u32,
    pub match_bits: u64,
    /// Length the sender asked for.
    pub rlength: u32,
    /// Length that was actually manipulated.
    pub mlength: u32,
    pub offset: u32,
    pub hdr_data: u64,
    pub md_handle: MdHandle,
    /// State of the MD right after the operation was committed.
    pub md: MdInfo,
    pub status: Status,
    /// The MD went away with this event.
    pub unlinked: bool,
    pub sequence: u64,
}

impl Default for Event {
    fn default() -> Self {
        Self {
            kind: EventKind::Unlink,
            target: ProcessId::ANY,
            initiator: ProcessId::ANY,
            sender: Nid::ANY,
            pt_index: 0,
            match_bits: 0,
            rlength: 0,
            mlength: 0,
            offset: 0,
            hdr_data: 0,
            md_handle: MdHandle::INVALID,
            md: MdInfo::default(),
            status: Ok(()),
            unlinked: false,
            sequence: 0,
        }
    }
}

/// Invoked for every event enqueued, outside of any LNet lock.
pub type EqCallback = Arc<dyn Fn(&Event) + Send + Sync>;

/// Wakes up `eq_poll()` callers whenever any queue gets an event.
#[derive(Default)]
pub(crate) struct EqWaitq {
    gen: Mutex<u64>,
    cond: Condvar,
}

impl EqWaitq {
    pub(crate) fn generation(&self) -> u64 {
        *self.gen.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn wake_all(&self) {
        let mut gen = self.gen.lock().unwrap_or_else(PoisonError::into_inner);
        *gen = gen.wrapping_add(1);
        self.cond.notify_all();
    }

    /// Sleep until the generation moves past `seen` or `deadline` passes.
    /// Returns false on timeout.
    pub(crate) fn wait(&self, seen: u64, deadline: Option<Instant>) -> bool {
        let mut gen = self.gen.lock().unwrap_or_else(PoisonError::into_inner);
        while *gen == seen {
            match deadline {
                None => {
                    gen = self
                        .cond
                        .wait(gen)
                        .unwrap_or_else(PoisonError::into_inner);
                }
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return false;
                    }
                    gen = self
                        .cond
                        .wait_timeout(gen, deadline - now)
                        .unwrap_or_else(PoisonError::into_inner)
                        .0;
                }
            }
        }
        true
    }
}

struct Ring {
    events: Vec<Event>,
    enq_seq: u64,
    deq_seq: u64,
}

/// `a` is strictly after `b`, tolerating wrap around.
fn seq_gt(a: u64, b: u64) -> bool {
    (a.wrapping_sub(b) as i64) > 0
}

pub(crate) struct EventQueue {
    ring: Mutex<Ring>,
    callback: Option<EqCallback>,
    /// MDs currently pointing at this queue.
    refs: AtomicUsize,
    waitq: Arc<EqWaitq>,
}

impl EventQueue {
    /// `count` is rounded up to a power of two. A queue with a callback
    /// may have no ring at all (`count` 0), in which case events only go
    /// to the callback. Returns `None` for a queue that could hold nothing
    /// or whose size can't be rounded.
    pub(crate) fn new(
        count: usize,
        callback: Option<EqCallback>,
        waitq: Arc<EqWaitq>,
    ) -> Option<EventQueue> {
        if count == 0 && callback.is_none() {
            return None;
        }
        let size = match count {
            0 => 0,
            n => n.checked_next_power_of_two()?,
        };
        Some(EventQueue {
            ring: Mutex::new(Ring {
                // Sequence 0 everywhere is older than the first deq_seq.
                events: vec![Event::default(); size],
                enq_seq: 1,
                deq_seq: 1,
            }),
            callback,
            refs: AtomicUsize::new(0),
            waitq,
        })
    }

    pub(crate) fn size(&self) -> usize {
        self.ring
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .events
            .len()
    }

    pub(crate) fn refs(&self) -> usize {
        self.refs.load(Ordering::Acquire)
    }

    pub(crate) fn addref(&self) {
        self.refs.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn decref(&self) {
        let prev = self.refs.fetch_sub(1, Ordering::AcqRel);
        assert!(prev > 0, "event queue refcount underflow");
    }

    pub(crate) fn enqueue(&self, mut ev: Event) {
        {
            let mut ring = self.ring.lock().unwrap_or_else(PoisonError::into_inner);
            ev.sequence = ring.enq_seq;
            ring.enq_seq = ring.enq_seq.wrapping_add(1);
            if !ring.events.is_empty() {
                let mask = ring.events.len() as u64 - 1;
                let slot = (ev.sequence & mask) as usize;
                ring.events[slot] = ev.clone();
            }
        }

        if let Some(callback) = &self.callback {
            callback(&ev);
        }
        self.waitq.wake_all();
    }

    /// Next unseen event, and whether events were lost before it.
    pub(crate) fn dequeue(&self) -> Option<(Event, bool)> {
        let mut ring = self.ring.lock().unwrap_or_else(PoisonError::into_inner);
        if ring.events.is_empty() {
            return None;
        }
        let mask = ring.events.len() as u64 - 1;
        let idx = (ring.deq_seq & mask) as usize;
        let seq = ring.events[idx].sequence;
        if seq_gt(ring.deq_seq, seq) {
            return None;
        }

        let overflowed = ring.deq_seq != seq;
        if overflowed {
            log::debug!(
                "Event Queue Overflow: eq seq {} ev seq {}",
                ring.deq_seq,
                seq
            );
        }
        ring.deq_seq = seq.wrapping_add(1);
        Some((ring.events[idx].clone(), overflowed))
    }
}

/// Pooled EQ object registered in the handle table.
#[derive(Default)]
pub(crate) struct Eq {
    pub(crate) queue: Option<Arc<EventQueue>>,
}

impl Recycle for Eq {}

/// One event returned by `eq_poll()`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PolledEvent {
    /// Index of the queue in the handles passed to `eq_poll()`.
    pub which: usize,
    pub event: Event,
    /// Events were dropped from this queue before `event`.
    pub overflowed: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn queue(count: usize) -> EventQueue {
        EventQueue::new(count, None, Arc::new(EqWaitq::default())).unwrap()
    }

    fn ev(mlength: u32) -> Event {
        Event {
            kind: EventKind::Put,
            mlength,
            ..Default::default()
        }
    }

    #[test]
    fn test_size_rounding() {
        assert_eq!(queue(1).size(), 1);
        assert_eq!(queue(5).size(), 8);
        assert_eq!(queue(64).size(), 64);
        assert!(EventQueue::new(0, None, Arc::new(EqWaitq::default())).is_none());
        assert!(EventQueue::new(usize::MAX, None, Arc::new(EqWaitq::default())).is_none());
    }

    #[test]
    fn test_fifo() {
        let eq = queue(4);
        assert!(eq.dequeue().is_none());
        for i in 0..3 {
            eq.enqueue(ev(i));
        }
        for i in 0..3 {
            let (e, overflowed) = eq.dequeue().unwrap();
            assert!(!overflowed);
            assert_eq!(e.mlength, i);
            assert_eq!(e.sequence, i as u64 + 1);
        }
        assert!(eq.dequeue().is_none());
    }

    #[test]
    fn test_overflow() {
        let eq = queue(2);
        for i in 0..5 {
            eq.enqueue(ev(i));
        }
        // The reader still expects sequence 1, whose slot now holds the
        // newest event. Taking it skips past the older survivor.
        let (e, overflowed) = eq.dequeue().unwrap();
        assert!(overflowed);
        assert_eq!(e.mlength, 4);
        assert_eq!(e.sequence, 5);
        assert!(eq.dequeue().is_none());

        eq.enqueue(ev(5));
        let (e, overflowed) = eq.dequeue().unwrap();
        assert!(!overflowed);
        assert_eq!(e.mlength, 5);
    }

    #[test]
    fn test_callback_and_wakeup() {
        let seen = Arc::new(AtomicUsize::new(0));
        let seen2 = seen.clone();
        let waitq = Arc::new(EqWaitq::default());
        let eq = EventQueue::new(
            1,
            Some(Arc::new(move |_: &Event| {
                seen2.fetch_add(1, Ordering::Relaxed);
            })),
            waitq.clone(),
        )
        .unwrap();

        let gen = waitq.generation();
        eq.enqueue(ev(1));
        assert_eq!(seen.load(Ordering::Relaxed), 1);
        assert!(waitq.wait(gen, Some(Instant::now())));
        let gen = waitq.generation();
        assert!(!waitq.wait(gen, Some(Instant::now())));
    }

    #[test]
    fn test_callback_only_queue() {
        let seen = Arc::new(AtomicUsize::new(0));
        let seen2 = seen.clone();
        let eq = EventQueue::new(
            0,
            Some(Arc::new(move |_: &Event| {
                seen2.fetch_add(1, Ordering::Relaxed);
            })),
            Arc::new(EqWaitq::default()),
        )
        .unwrap();
        assert_eq!(eq.size(), 0);
        eq.enqueue(ev(1));
        eq.enqueue(ev(2));
        assert_eq!(seen.load(Ordering::Relaxed), 2);
        assert!(eq.dequeue().is_none());
    }

    #[test]
    fn test_seq_wrap() {
        assert!(seq_gt(1, 0));
        assert!(!seq_gt(0, 0));
        assert!(seq_gt(0, u64::MAX));
    }
}
