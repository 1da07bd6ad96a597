// SPDX-FileCopyrightText: 2024 Foundation Devices, Inc. <hello@foundationdevices.com>
// SPDX-License-Identifier: GPL-3.0-or-later

//! Fixed pool of packet buffers and the three queues they circulate through.
//!
//! ```text
//!   free ──alloc──▶ transport RX ──deliver──▶ inbox ──receive──▶ engine
//!    ▲                                                             │
//!    └──drop── transport TX ◀──next_outgoing── outbox ◀──send──────┘
//! ```
//!
//! The pool is split once into a [`Mailbox`] for the main loop and a [`FramePort`] for
//! the transport. Each queue's single consumer is one of those unique endpoints, except
//! the free queue which both sides allocate from under a critical section.

use crate::queue::{Links, Queue};
use consts::PACKET_POOL_SIZE;
use core::cell::UnsafeCell;
use core::mem::ManuallyDrop;
use core::ops::{Deref, DerefMut};
use core::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use host_protocol::Packet;

pub struct PacketPool<const N: usize = PACKET_POOL_SIZE> {
    slots: [UnsafeCell<Packet>; N],
    links: Links<N>,
    free: Queue,
    inbox: Queue,
    outbox: Queue,
    /// Packets taken off the outbox by the transport and not freed yet.
    in_flight: AtomicUsize,
    /// Receives frames clocked in while no buffer is free; never delivered.
    rx_sink: UnsafeCell<Packet>,
    /// Sent when there is nothing to say; never written.
    tx_zero: Packet,
    split: AtomicBool,
}

// SAFETY: a slot is only touched through the single `PacketBox` that owns it, queue
// consumers are the unique endpoints or run inside a critical section, and the RX sink is
// only handed to the one `FramePort`.
unsafe impl<const N: usize> Sync for PacketPool<N> {}

impl<const N: usize> PacketPool<N> {
    pub const fn new() -> Self {
        Self {
            slots: [const { UnsafeCell::new(Packet::EMPTY) }; N],
            links: Links::new(),
            free: Queue::new(),
            inbox: Queue::new(),
            outbox: Queue::new(),
            in_flight: AtomicUsize::new(0),
            rx_sink: UnsafeCell::new(Packet::EMPTY),
            tx_zero: Packet::EMPTY,
            split: AtomicBool::new(false),
        }
    }

    /// Fill the free queue and hand out the two endpoints. Only the first call succeeds.
    pub fn split(&self) -> Option<(Mailbox<'_, N>, FramePort<'_, N>)> {
        if self.split.swap(true, Ordering::AcqRel) {
            return None;
        }
        for index in 0..N {
            self.free.enqueue(&self.links, index);
        }
        Some((Mailbox { pool: self }, FramePort { pool: self }))
    }

    fn alloc(&self) -> Option<PacketBox<'_, N>> {
        // SAFETY: both endpoints consume the free queue, the critical section serializes them.
        let index = critical_section::with(|_| unsafe { self.free.dequeue(&self.links) })?;
        Some(PacketBox {
            pool: self,
            index,
            outgoing: false,
        })
    }

    fn census(&self) -> Census {
        critical_section::with(|_| Census {
            free: self.free.count(&self.links),
            inbox: self.inbox.count(&self.links),
            outbox: self.outbox.count(&self.links),
        })
    }
}

impl<const N: usize> Default for PacketPool<N> {
    fn default() -> Self {
        Self::new()
    }
}

/// Exclusive ownership of one pool slot.
///
/// Dropping it zeroes the packet and returns the slot to the free queue.
pub struct PacketBox<'p, const N: usize = PACKET_POOL_SIZE> {
    pool: &'p PacketPool<N>,
    index: usize,
    /// Taken from the outbox, counted in `in_flight` until dropped.
    outgoing: bool,
}

impl<'p, const N: usize> PacketBox<'p, N> {
    /// Give up ownership without freeing, for moving the slot into a queue.
    fn into_index(self) -> usize {
        ManuallyDrop::new(self).index
    }

    /// Start of the frame, for programming DMA.
    pub fn as_ptr(&self) -> *const u8 {
        self.pool.slots[self.index].get() as *const u8
    }

    pub fn as_mut_ptr(&mut self) -> *mut u8 {
        self.pool.slots[self.index].get() as *mut u8
    }
}

impl<const N: usize> Deref for PacketBox<'_, N> {
    type Target = Packet;

    fn deref(&self) -> &Packet {
        // SAFETY: this box is the slot's only owner.
        unsafe { &*self.pool.slots[self.index].get() }
    }
}

impl<const N: usize> DerefMut for PacketBox<'_, N> {
    fn deref_mut(&mut self) -> &mut Packet {
        // SAFETY: this box is the slot's only owner.
        unsafe { &mut *self.pool.slots[self.index].get() }
    }
}

impl<const N: usize> Drop for PacketBox<'_, N> {
    fn drop(&mut self) {
        self.clear();
        self.pool.free.enqueue(&self.pool.links, self.index);
        if self.outgoing {
            self.pool.in_flight.fetch_sub(1, Ordering::AcqRel);
        }
    }
}

/// Queue occupancy, for diagnostics. A count is `None` if its list looks corrupted.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Census {
    pub free: Option<usize>,
    pub inbox: Option<usize>,
    pub outbox: Option<usize>,
}

/// Main loop side of the pool.
pub struct Mailbox<'p, const N: usize = PACKET_POOL_SIZE> {
    pool: &'p PacketPool<N>,
}

impl<'p, const N: usize> Mailbox<'p, N> {
    pub fn alloc(&self) -> Option<PacketBox<'p, N>> {
        self.pool.alloc()
    }

    /// Queue a packet for transmission; the transport frees it once it has been clocked out.
    pub fn send(&self, packet: PacketBox<'p, N>) {
        self.pool.outbox.enqueue(&self.pool.links, packet.into_index());
    }

    pub fn receive(&mut self) -> Option<PacketBox<'p, N>> {
        // SAFETY: the only `Mailbox` is the inbox's only consumer, `&mut self` keeps it serial.
        let index = unsafe { self.pool.inbox.dequeue(&self.pool.links) }?;
        Some(PacketBox {
            pool: self.pool,
            index,
            outgoing: false,
        })
    }

    /// Nothing is queued for transmission and the transport holds no packet it has not
    /// finished sending.
    pub fn tx_idle(&self) -> bool {
        // Outbox first: a packet only moves from there to in flight, never back.
        self.pool.outbox.is_empty() && self.pool.in_flight.load(Ordering::Acquire) == 0
    }

    pub fn census(&self) -> Census {
        self.pool.census()
    }
}

/// Transport side of the pool.
pub struct FramePort<'p, const N: usize = PACKET_POOL_SIZE> {
    pool: &'p PacketPool<N>,
}

impl<'p, const N: usize> FramePort<'p, N> {
    pub fn alloc(&self) -> Option<PacketBox<'p, N>> {
        self.pool.alloc()
    }

    /// Take the oldest queued packet. It counts as in flight until it is dropped.
    pub fn next_outgoing(&mut self) -> Option<PacketBox<'p, N>> {
        // Counted before the dequeue, so a packet is always either queued or counted.
        self.pool.in_flight.fetch_add(1, Ordering::AcqRel);
        // SAFETY: the only `FramePort` is the outbox's only consumer, `&mut self` keeps it serial.
        let Some(index) = (unsafe { self.pool.outbox.dequeue(&self.pool.links) }) else {
            self.pool.in_flight.fetch_sub(1, Ordering::AcqRel);
            return None;
        };
        Some(PacketBox {
            pool: self.pool,
            index,
            outgoing: true,
        })
    }

    /// Hand a received packet to the main loop.
    pub fn deliver(&self, packet: PacketBox<'p, N>) {
        self.pool.inbox.enqueue(&self.pool.links, packet.into_index());
    }

    /// Frame that absorbs received bytes nobody has a buffer for.
    pub fn rx_sink(&self) -> *mut u8 {
        self.pool.rx_sink.get() as *mut u8
    }

    /// All-zero frame, an Empty packet.
    pub fn tx_zero(&self) -> *const u8 {
        &self.pool.tx_zero as *const Packet as *const u8
    }
}
