// SPDX-FileCopyrightText: 2024 Foundation Devices, Inc. <hello@foundationdevices.com>
// SPDX-License-Identifier: GPL-3.0-or-later

//! Payload layouts. All integers are fixed-width little-endian.

use crate::packet::{Packet, PacketType};
use serde::{Deserialize, Serialize};

/// Sync handshake, in both directions.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct SyncPayload {
    pub id: u8,
    pad: [u8; 3],
    #[serde(with = "postcard::fixint::le")]
    pub cookie: u32,
}

impl SyncPayload {
    pub const fn new(id: u8, cookie: u32) -> Self {
        Self { id, pad: [0; 3], cookie }
    }
}

/// Acknowledges a request, echoing its id.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct AckPayload {
    pub id: u8,
    pad: [u8; 3],
}

impl AckPayload {
    pub const fn new(id: u8) -> Self {
        Self { id, pad: [0; 3] }
    }
}

/// Header of an Error message; the NUL-terminated reason follows it, spilling into
/// further fragments as needed.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct ErrorHeader {
    pub id: u8,
    pad: [u8; 3],
}

impl ErrorHeader {
    /// Encoded size; the message text starts at this payload offset.
    pub const LEN: usize = 4;

    pub const fn new(id: u8) -> Self {
        Self { id, pad: [0; 3] }
    }
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct ErasePayload {
    #[serde(with = "postcard::fixint::le")]
    pub address: u32,
}

/// Leads the first fragment of a Write and of a ReadResponse; data follows it.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct BlockHeader {
    #[serde(with = "postcard::fixint::le")]
    pub address: u32,
    #[serde(with = "postcard::fixint::le")]
    pub len: u32,
    /// CRC over the block's `len / 4` little-endian words.
    #[serde(with = "postcard::fixint::le")]
    pub crc: u32,
}

impl BlockHeader {
    /// Encoded size; block data starts at this payload offset.
    pub const LEN: usize = 12;
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct ReadRequestPayload {
    #[serde(with = "postcard::fixint::le")]
    pub address: u32,
    #[serde(with = "postcard::fixint::le")]
    pub len: u32,
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct GoPayload {
    #[serde(with = "postcard::fixint::le")]
    pub address: u32,
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct QueryPayload {
    #[serde(with = "postcard::fixint::le")]
    pub parameter: u32,
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct QueryResponsePayload {
    #[serde(with = "postcard::fixint::le")]
    pub parameter: u32,
    #[serde(with = "postcard::fixint::le")]
    pub value: u32,
}

/// Parameters the host can query.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u32)]
pub enum QueryParameter {
    /// Largest Write/ReadRequest length in bytes
    MaxTransfer = 1,
    /// Address application images are expected at
    DefaultAppAddress = 2,
}

impl TryFrom<u32> for QueryParameter {
    type Error = u32;

    fn try_from(value: u32) -> Result<Self, u32> {
        match value {
            1 => Ok(Self::MaxTransfer),
            2 => Ok(Self::DefaultAppAddress),
            other => Err(other),
        }
    }
}

/// A packet received by the bootloader, decoded according to its type.
///
/// Only the first fragment of a message has a header; Write continuations are raw
/// data and are not parsed through here.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Request {
    Empty,
    Sync(SyncPayload),
    Erase(ErasePayload),
    Write(BlockHeader),
    ReadRequest(ReadRequestPayload),
    Go(GoPayload),
    Query(QueryPayload),
    Reset,
    /// A known type that only the bootloader sends
    Unexpected(PacketType),
    /// A type value outside the protocol
    Unknown(u8),
}

impl Request {
    pub fn parse(packet: &Packet) -> Result<Self, postcard::Error> {
        let kind = match packet.packet_type() {
            Ok(kind) => kind,
            Err(raw) => return Ok(Self::Unknown(raw)),
        };
        Ok(match kind {
            PacketType::Empty => Self::Empty,
            PacketType::Sync => Self::Sync(packet.decode()?),
            PacketType::Erase => Self::Erase(packet.decode()?),
            PacketType::Write => Self::Write(packet.decode()?),
            PacketType::ReadRequest => Self::ReadRequest(packet.decode()?),
            PacketType::Go => Self::Go(packet.decode()?),
            PacketType::Query => Self::Query(packet.decode()?),
            PacketType::Reset => Self::Reset,
            PacketType::Ack
            | PacketType::ReadResponse
            | PacketType::QueryResponse
            | PacketType::Error => Self::Unexpected(kind),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn block_header_is_little_endian() {
        let mut packet = Packet::new(1, PacketType::Write);
        let header = BlockHeader {
            address: 0x0800_2000,
            len: 0x40,
            crc: 0xDEAD_BEEF,
        };
        assert_eq!(packet.encode(&header).unwrap(), BlockHeader::LEN);
        assert_eq!(
            packet.payload[..BlockHeader::LEN],
            [0x00, 0x20, 0x00, 0x08, 0x40, 0x00, 0x00, 0x00, 0xEF, 0xBE, 0xAD, 0xDE]
        );
        assert_eq!(Request::parse(&packet).unwrap(), Request::Write(header));
    }

    #[test]
    fn id_headers_are_padded() {
        let mut packet = Packet::new(0, PacketType::Sync);
        assert_eq!(packet.encode(&SyncPayload::new(3, 0x0102_0304)).unwrap(), 8);
        assert_eq!(packet.payload[..8], [3, 0, 0, 0, 0x04, 0x03, 0x02, 0x01]);

        let mut packet = Packet::new(0, PacketType::Error);
        assert_eq!(packet.encode(&ErrorHeader::new(0x77)).unwrap(), ErrorHeader::LEN);
        assert_eq!(packet.payload[..4], [0x77, 0, 0, 0]);
    }

    #[test]
    fn parse_by_type() {
        let mut packet = Packet::new(5, PacketType::Query);
        packet.encode(&QueryPayload { parameter: 2 }).unwrap();
        assert_eq!(Request::parse(&packet).unwrap(), Request::Query(QueryPayload { parameter: 2 }));

        packet.set_type(PacketType::Ack);
        assert_eq!(Request::parse(&packet).unwrap(), Request::Unexpected(PacketType::Ack));

        packet.kind = 0x33;
        assert_eq!(Request::parse(&packet).unwrap(), Request::Unknown(0x33));

        assert_eq!(Request::parse(&Packet::EMPTY).unwrap(), Request::Empty);
    }

    #[test]
    fn query_parameters() {
        assert_eq!(QueryParameter::try_from(1), Ok(QueryParameter::MaxTransfer));
        assert_eq!(QueryParameter::try_from(2), Ok(QueryParameter::DefaultAppAddress));
        assert_eq!(QueryParameter::try_from(3), Err(3));
    }
}
