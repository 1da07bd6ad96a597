// SPDX-FileCopyrightText: 2024 Foundation Devices, Inc. <hello@foundationdevices.com>
// SPDX-License-Identifier: GPL-3.0-or-later

//! SPI slave frame transport.
//!
//! The host frames every transfer with a chip select style GPIO: the falling edge starts
//! a transaction and the rising edge ends it. DMA moves the frame in both directions
//! while the line is low; all buffer bookkeeping happens on the rising edge, off the
//! time critical path.
//!
//! The first byte on the wire is a transfer counter preloaded into the data register,
//! TX DMA picks up from the packet type onwards.

use crate::pool::{FramePort, PacketBox};
use consts::PACKET_POOL_SIZE;
use host_protocol::{Flags, DMA_LEN};

/// Which edge of the framing signal the next interrupt fires on.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Edge {
    Falling,
    Rising,
}

/// The SPI peripheral, its two DMA channels and the framing edge interrupt.
pub trait FrameHardware {
    /// Point RX DMA at `len` bytes at `buf`. The channel is disabled.
    ///
    /// # Safety
    ///
    /// `buf` must stay valid for writes of `len` bytes until [`Self::stop_rx`] returns.
    unsafe fn set_rx_buffer(&mut self, buf: *mut u8, len: usize);

    /// Point TX DMA at `len` bytes at `buf`. The channel is disabled.
    ///
    /// # Safety
    ///
    /// `buf` must stay valid for reads of `len` bytes until [`Self::stop_tx`] returns.
    unsafe fn set_tx_buffer(&mut self, buf: *const u8, len: usize);

    fn enable_rx(&mut self);

    fn enable_tx(&mut self);

    /// Disable the RX channel and clear its flags. Returns whether the transfer completed.
    fn stop_rx(&mut self) -> bool;

    /// Disable the TX channel and clear its flags. Returns whether the transfer completed.
    fn stop_tx(&mut self) -> bool;

    /// Read and clear the SPI CRC error status.
    fn take_crc_error(&mut self) -> bool;

    /// Drop the last byte left in the data register.
    fn discard_rx_byte(&mut self);

    /// Reset the SPI peripheral back to an enabled slave with hardware CRC.
    fn reset_link(&mut self);

    /// Byte clocked out first in the next transaction.
    fn preload_tx(&mut self, byte: u8);

    fn set_edge(&mut self, edge: Edge);

    /// Clear the edge interrupt's pending flag.
    fn acknowledge_edge(&mut self) {}
}

/// A DMA buffer: a pool packet or one of the pool's scratch frames.
enum Frame<'p, const N: usize> {
    Packet(PacketBox<'p, N>),
    Scratch,
}

pub struct Transport<'p, H, const N: usize = PACKET_POOL_SIZE> {
    hw: H,
    port: FramePort<'p, N>,
    busy: bool,
    /// Buffer the next RX transfer lands in.
    rx: Option<Frame<'p, N>>,
    /// Buffer being sent, kept until a transfer of it completes.
    tx: Option<Frame<'p, N>>,
    transfer_id: u8,
}

impl<'p, H: FrameHardware, const N: usize> Transport<'p, H, N> {
    /// Bring the link up, ready for the first falling edge.
    pub fn new(hw: H, port: FramePort<'p, N>) -> Self {
        let mut transport = Self {
            hw,
            port,
            busy: false,
            rx: None,
            tx: None,
            transfer_id: 0,
        };
        transport.hw.reset_link();
        transport.hw.set_edge(Edge::Falling);
        transport.prepare_rx();
        transport.prepare_tx();
        transport
    }

    /// Edge interrupt handler body.
    pub fn on_edge(&mut self) {
        self.hw.acknowledge_edge();
        if self.busy {
            self.finish_transaction();
            self.hw.set_edge(Edge::Falling);
            self.busy = false;
        } else {
            self.start_transaction();
            self.hw.set_edge(Edge::Rising);
            self.busy = true;
        }
    }

    fn start_transaction(&mut self) {
        // RX first, there is a whole byte time to sort out TX.
        self.hw.enable_rx();

        let frame = match self.tx.take() {
            Some(frame) => frame,
            None => match self.port.next_outgoing() {
                Some(packet) => Frame::Packet(packet),
                None => Frame::Scratch,
            },
        };
        let start = match &frame {
            Frame::Packet(packet) => packet.as_ptr(),
            Frame::Scratch => self.port.tx_zero(),
        };
        // SAFETY: the frame is parked in `self.tx` until `stop_tx`; the id byte is skipped.
        unsafe { self.hw.set_tx_buffer(start.wrapping_add(1), DMA_LEN - 1) };
        self.tx = Some(frame);
        self.hw.enable_tx();
    }

    fn finish_transaction(&mut self) {
        self.hw.discard_rx_byte();

        if self.hw.stop_rx() {
            if let Some(Frame::Packet(mut packet)) = self.rx.take() {
                if self.hw.take_crc_error() {
                    packet.insert_flags(Flags::CRC_ERROR);
                }
                trace!("rx id {} type {}", packet.id, packet.kind);
                self.port.deliver(packet);
            }
        }

        if self.hw.stop_tx() {
            // Dropping a sent packet returns it to the free queue.
            self.tx = None;
        }

        // Also throws away whatever is left in the TX data register.
        self.hw.reset_link();

        self.prepare_rx();
        self.prepare_tx();
    }

    /// Stage the next RX buffer. Allocating here rather than on the falling edge keeps
    /// the pool off the critical path, at the price of using the sink when the pool
    /// happens to be empty right now.
    fn prepare_rx(&mut self) {
        let frame = self.rx.get_or_insert_with(|| match self.port.alloc() {
            Some(packet) => Frame::Packet(packet),
            None => {
                warn!("no free packet, receiving into the sink");
                Frame::Scratch
            }
        });
        let start = match frame {
            Frame::Packet(packet) => packet.as_mut_ptr(),
            Frame::Scratch => self.port.rx_sink(),
        };
        // SAFETY: the frame stays parked in `self.rx` until `stop_rx`.
        unsafe { self.hw.set_rx_buffer(start, DMA_LEN) };
    }

    fn prepare_tx(&mut self) {
        self.hw.preload_tx(self.transfer_id);
        self.transfer_id = self.transfer_id.wrapping_add(1);
    }
}
