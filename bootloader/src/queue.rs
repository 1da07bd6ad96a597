// SPDX-FileCopyrightText: 2024 Foundation Devices, Inc. <hello@foundationdevices.com>
// SPDX-License-Identifier: GPL-3.0-or-later

//! Intrusive multi-producer single-consumer queue of pool slot indices.
//!
//! Nodes are slot indices; their successor links live in a [`Links`] array shared by
//! every queue of the same pool, since a slot is a member of at most one queue at a time.
//! Enqueue is wait-free and safe from any context. Dequeue must only ever run in one
//! context at a time and can transiently report empty while an enqueue is half done.

use core::sync::atomic::{AtomicUsize, Ordering};

/// No node.
pub const NIL: usize = usize::MAX;

/// Stands for the queue itself as the predecessor of its first node.
const SENTINEL: usize = usize::MAX - 1;

/// Successor links for `N` nodes.
pub struct Links<const N: usize> {
    next: [AtomicUsize; N],
}

impl<const N: usize> Links<N> {
    pub const fn new() -> Self {
        Self {
            next: [const { AtomicUsize::new(NIL) }; N],
        }
    }
}

impl<const N: usize> Default for Links<N> {
    fn default() -> Self {
        Self::new()
    }
}

pub struct Queue {
    head: AtomicUsize,
    tail: AtomicUsize,
}

impl Queue {
    pub const fn new() -> Self {
        Self {
            head: AtomicUsize::new(NIL),
            tail: AtomicUsize::new(SENTINEL),
        }
    }

    /// Append `node`. Any number of producers may call this concurrently, including from
    /// interrupt context.
    ///
    /// `node` must be below `N` and must not currently be a member of any queue.
    pub fn enqueue<const N: usize>(&self, links: &Links<N>, node: usize) {
        let prev = self.claim(links, node);
        self.link(links, prev, node);
    }

    /// First half of an enqueue: make `node` the tail and return its predecessor.
    /// Until [`Self::link`] runs the node is unreachable from the head.
    fn claim<const N: usize>(&self, links: &Links<N>, node: usize) -> usize {
        links.next[node].store(NIL, Ordering::Relaxed);
        self.tail.swap(node, Ordering::AcqRel)
    }

    fn link<const N: usize>(&self, links: &Links<N>, prev: usize, node: usize) {
        if prev == SENTINEL {
            self.head.store(node, Ordering::Release);
        } else {
            links.next[prev].store(node, Ordering::Release);
        }
    }

    /// Remove the oldest node.
    ///
    /// `None` means empty, or that a producer is between its tail swap and its link and
    /// the node will show up on a later call.
    ///
    /// # Safety
    ///
    /// At most one context may be dequeuing from this queue at any time.
    pub unsafe fn dequeue<const N: usize>(&self, links: &Links<N>) -> Option<usize> {
        let head = self.head.load(Ordering::Acquire);
        if head == NIL {
            return None;
        }

        let next = links.next[head].load(Ordering::Acquire);
        if next == NIL {
            // Either `head` is the last node or its successor is not linked yet.
            if self
                .tail
                .compare_exchange(head, SENTINEL, Ordering::AcqRel, Ordering::Acquire)
                .is_err()
            {
                return None;
            }
            // A producer that already saw the sentinel may have published a new head.
            let _ = self
                .head
                .compare_exchange(head, NIL, Ordering::AcqRel, Ordering::Acquire);
        } else {
            self.head.store(next, Ordering::Release);
        }

        links.next[head].store(NIL, Ordering::Relaxed);
        Some(head)
    }

    pub fn is_empty(&self) -> bool {
        self.head.load(Ordering::Acquire) == NIL
    }

    /// Number of linked nodes. Only meaningful while no context touches the queue.
    /// `None` if the walk does not terminate within `N` nodes.
    pub fn count<const N: usize>(&self, links: &Links<N>) -> Option<usize> {
        let mut node = self.head.load(Ordering::Acquire);
        let mut count = 0;
        while node != NIL {
            if count == N || node >= N {
                return None;
            }
            count += 1;
            node = links.next[node].load(Ordering::Acquire);
        }
        Some(count)
    }
}

impl Default for Queue {
    fn default() -> Self {
        Self::new()
    }
}
