// SPDX-FileCopyrightText: 2024 Foundation Devices, Inc. <hello@foundationdevices.com>
// SPDX-License-Identifier: GPL-3.0-or-later

use core::fmt;
use host_protocol::PacketType;

/// Why a request was refused. The message text is what the host sees in the Error packet.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Error {
    /// A request announced the wrong number of fragments: any for a single-frame
    /// request, or a count that does not match a Write's length
    UnexpectedFragments(PacketType),
    /// A Write continuation broke the countdown
    FragmentMismatch,
    /// The last Write fragment arrived before all announced bytes
    WriteIncomplete,
    EraseMisaligned,
    EraseOutOfRange,
    WriteTooLong,
    WriteMisaligned,
    WriteOutOfRange,
    /// Another request arrived in the middle of a multi-fragment Write
    WriteInterrupted,
    ReadMisalignedAddress,
    ReadMisalignedLength,
    ReadTooLong,
    ReadOutOfRange,
    /// Go target has no plausible initial stack pointer
    DubiousJumpTarget,
    UnknownQuery,
    UnknownType,
    /// The payload did not decode as the packet type's layout
    MalformedPayload,
    /// The SPI peripheral flagged a CRC mismatch on the frame
    TransportCrc,
    /// A Write block did not match its CRC
    WriteIntegrity,
    EraseFailed,
    ProgramFailed,
    ReadFailed,
    /// No packet buffer was free for a response
    PoolExhausted,
}

/// Broad failure category, used for logging.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ErrorClass {
    Protocol,
    Integrity,
    Hardware,
    ResourceExhaustion,
}

impl Error {
    /// The text sent to the host, without the terminating NUL.
    pub fn message(&self) -> &'static str {
        match self {
            Self::UnexpectedFragments(kind) => match kind {
                PacketType::Sync => "Unexpected nparts on sync pkt",
                PacketType::Erase => "Unexpected nparts on erase pkt",
                PacketType::Write => "Unexpected nparts on write pkt",
                PacketType::ReadRequest => "Unexpected nparts on readreq pkt",
                PacketType::Go => "Unexpected nparts on go pkt",
                PacketType::Query => "Unexpected nparts on query pkt",
                _ => "Unexpected nparts.",
            },
            Self::FragmentMismatch => "Unexpected nparts.",
            Self::WriteIncomplete => "Expected to be finished.",
            Self::EraseMisaligned => "Erase address must be 1 kB aligned.",
            Self::EraseOutOfRange => "Erase address outside flash!",
            Self::WriteTooLong => "Write request too long.",
            Self::WriteMisaligned => "Write address and length must be word-aligned.",
            Self::WriteOutOfRange => "Write address outside flash!",
            Self::WriteInterrupted => "Write interrupted.",
            Self::ReadMisalignedAddress => "Read address must be word-aligned",
            Self::ReadMisalignedLength => "Read length must be word-aligned",
            Self::ReadTooLong => "Read request too long.",
            Self::ReadOutOfRange => "Read address outside flash!",
            Self::DubiousJumpTarget => "Jump target looks dubious.",
            Self::UnknownQuery => "Unknown query.",
            Self::UnknownType => "Unknown type.",
            Self::MalformedPayload => "Malformed payload.",
            Self::TransportCrc => "CRC Error.",
            Self::WriteIntegrity => "Write integrity error.",
            Self::EraseFailed => "Flash erase error.",
            Self::ProgramFailed => "Flash program error.",
            Self::ReadFailed => "Flash read error.",
            Self::PoolExhausted => "Out of packets.",
        }
    }

    pub fn class(&self) -> ErrorClass {
        match self {
            Self::TransportCrc | Self::WriteIntegrity => ErrorClass::Integrity,
            Self::EraseFailed | Self::ProgramFailed | Self::ReadFailed => ErrorClass::Hardware,
            Self::PoolExhausted => ErrorClass::ResourceExhaustion,
            _ => ErrorClass::Protocol,
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.message())
    }
}

impl From<postcard::Error> for Error {
    fn from(_: postcard::Error) -> Self {
        Self::MalformedPayload
    }
}
