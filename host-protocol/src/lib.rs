// SPDX-FileCopyrightText: 2024 Foundation Devices, Inc. <hello@foundationdevices.com>
// SPDX-License-Identifier: GPL-3.0-or-later

//! Host to bootloader SPI link protocol.
//! The host is the SPI bus master and delimits every frame with a GPIO edge pair;
//! the STM32 bootloader is the slave and answers one frame per transaction.
//! Defines the frame layout, packet types and the payload layout of each type.

#![no_std]

mod packet;
mod payload;
mod reassembly;

pub use consts::PACKET_DATA_LEN;
pub use packet::{Flags, Packet, PacketType, DMA_LEN, FRAME_LEN};
pub use payload::{
    AckPayload, BlockHeader, ErasePayload, ErrorHeader, GoPayload, QueryParameter, QueryPayload, QueryResponsePayload,
    ReadRequestPayload, Request, SyncPayload,
};
pub use reassembly::{Reassembly, ReassemblyError};

/// Number of frames needed to carry `header` bytes followed by `len` bytes of data.
/// Always at least one, a message with no data still needs its header frame.
pub const fn fragments_for(header: usize, len: usize) -> usize {
    let total = (header + len + PACKET_DATA_LEN - 1) / PACKET_DATA_LEN;
    if total == 0 {
        1
    } else {
        total
    }
}
