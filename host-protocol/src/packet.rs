// SPDX-FileCopyrightText: 2024 Foundation Devices, Inc. <hello@foundationdevices.com>
// SPDX-License-Identifier: GPL-3.0-or-later

use consts::PACKET_DATA_LEN;
use serde::{de::DeserializeOwned, Serialize};

/// Bytes of a frame on the wire, including the trailing hardware CRC byte.
pub const FRAME_LEN: usize = 4 + PACKET_DATA_LEN + 1;

/// Bytes moved by DMA for each frame: everything from `id` up to the end of the payload.
/// The trailing CRC byte is generated and checked by the SPI peripheral itself.
pub const DMA_LEN: usize = FRAME_LEN - 1;

/// Packet type, the second byte of every frame.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u8)]
pub enum PacketType {
    /// Nothing to say; the host clocks these to collect responses
    Empty = 0x00,
    /// Request completed
    Ack = 0x01,
    /// Link handshake
    Sync = 0x02,
    /// Erase one flash page
    Erase = 0x03,
    /// Program a block of flash, possibly over several fragments
    Write = 0x04,
    /// Read a block of flash back
    ReadRequest = 0x05,
    /// Flash contents answering a ReadRequest
    ReadResponse = 0x06,
    /// Start the application at an address
    Go = 0x07,
    /// Ask for a bootloader parameter
    Query = 0x08,
    /// Parameter value answering a Query
    QueryResponse = 0x09,
    /// Reset the microcontroller
    Reset = 0xFE,
    /// Request failed, carries a text reason
    Error = 0xFF,
}

impl TryFrom<u8> for PacketType {
    type Error = u8;

    fn try_from(value: u8) -> Result<Self, u8> {
        Ok(match value {
            0x00 => Self::Empty,
            0x01 => Self::Ack,
            0x02 => Self::Sync,
            0x03 => Self::Erase,
            0x04 => Self::Write,
            0x05 => Self::ReadRequest,
            0x06 => Self::ReadResponse,
            0x07 => Self::Go,
            0x08 => Self::Query,
            0x09 => Self::QueryResponse,
            0xFE => Self::Reset,
            0xFF => Self::Error,
            other => return Err(other),
        })
    }
}

bitflags::bitflags! {
    /// Per-frame status set by the receiving side of the link.
    #[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
    pub struct Flags: u8 {
        /// The SPI hardware CRC did not match this frame.
        const CRC_ERROR = 1 << 0;
    }
}

#[cfg(feature = "defmt")]
impl defmt::Format for Flags {
    fn format(&self, f: defmt::Formatter) {
        defmt::write!(f, "Flags({=u8:#x})", self.bits())
    }
}

/// One SPI frame.
///
/// The layout is the wire layout: DMA reads and writes it in place, starting at `id`.
#[derive(Clone, Debug, Eq, PartialEq)]
#[repr(C)]
pub struct Packet {
    /// Host-assigned request id.
    pub id: u8,
    /// Raw [`PacketType`]; unknown values are kept so they can be reported.
    pub kind: u8,
    /// Fragments still to come after this one in the same message.
    pub remaining: u8,
    /// Raw [`Flags`].
    pub flags: u8,
    pub payload: [u8; PACKET_DATA_LEN],
    /// Link CRC, owned by the SPI peripheral.
    pub crc: u8,
}

const _: () = assert!(core::mem::size_of::<Packet>() == FRAME_LEN);
const _: () = assert!(core::mem::offset_of!(Packet, crc) == DMA_LEN);

impl Packet {
    /// An all-zero frame, which is also a valid Empty packet.
    pub const EMPTY: Self = Self {
        id: 0,
        kind: 0,
        remaining: 0,
        flags: 0,
        payload: [0; PACKET_DATA_LEN],
        crc: 0,
    };

    pub fn new(id: u8, kind: PacketType) -> Self {
        Self {
            id,
            kind: kind as u8,
            ..Self::EMPTY
        }
    }

    pub fn packet_type(&self) -> Result<PacketType, u8> {
        PacketType::try_from(self.kind)
    }

    pub fn set_type(&mut self, kind: PacketType) {
        self.kind = kind as u8;
    }

    pub fn flags(&self) -> Flags {
        Flags::from_bits_retain(self.flags)
    }

    pub fn insert_flags(&mut self, flags: Flags) {
        self.flags |= flags.bits();
    }

    /// Zero every field, so nothing from a previous use can leak into the next one.
    pub fn clear(&mut self) {
        *self = Self::EMPTY;
    }

    /// Decode the start of the payload as `T`.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, postcard::Error> {
        postcard::from_bytes(&self.payload)
    }

    /// Encode `value` at the start of the payload, returning the number of bytes used.
    pub fn encode<T: Serialize>(&mut self, value: &T) -> Result<usize, postcard::Error> {
        postcard::to_slice(value, &mut self.payload).map(|used| used.len())
    }

    /// The frame as clocked over the wire.
    pub fn to_frame(&self) -> [u8; FRAME_LEN] {
        let mut frame = [0; FRAME_LEN];
        frame[0] = self.id;
        frame[1] = self.kind;
        frame[2] = self.remaining;
        frame[3] = self.flags;
        frame[4..DMA_LEN].copy_from_slice(&self.payload);
        frame[DMA_LEN] = self.crc;
        frame
    }

    pub fn from_frame(frame: &[u8; FRAME_LEN]) -> Self {
        let mut payload = [0; PACKET_DATA_LEN];
        payload.copy_from_slice(&frame[4..DMA_LEN]);
        Self {
            id: frame[0],
            kind: frame[1],
            remaining: frame[2],
            flags: frame[3],
            payload,
            crc: frame[DMA_LEN],
        }
    }
}

impl Default for Packet {
    fn default() -> Self {
        Self::EMPTY
    }
}
