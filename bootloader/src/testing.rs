// SPDX-FileCopyrightText: 2024 Foundation Devices, Inc. <hello@foundationdevices.com>
// SPDX-License-Identifier: GPL-3.0-or-later

//! Test doubles: a RAM backed NOR flash, the host end of the packet queues, a clock
//! and an LED.

use crate::hal::{Clock, FlashErrorType, NorFlash, NorFlashError, NorFlashErrorKind, ReadNorFlash};
use crate::pool::FramePort;
use consts::{FLASH_BASE, PACKET_DATA_LEN};
use core::cell::Cell;
use core::convert::Infallible;
use crc::{Crc, CRC_32_MPEG_2};
use embedded_hal::digital::{ErrorType, OutputPin, StatefulOutputPin};
use host_protocol::{fragments_for, BlockHeader, ErrorHeader, Packet, PacketType, Reassembly};
use serde::Serialize;
use std::string::String;
use std::vec;
use std::vec::Vec;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum MemFlashError {
    OutOfBounds,
    NotAligned,
    /// Programming over a word that is not erased, PGERR on the real part
    NotErased,
    /// Injected with [`MemFlash::fail`]
    Failed,
}

impl NorFlashError for MemFlashError {
    fn kind(&self) -> NorFlashErrorKind {
        match self {
            Self::OutOfBounds => NorFlashErrorKind::OutOfBounds,
            Self::NotAligned => NorFlashErrorKind::NotAligned,
            Self::NotErased | Self::Failed => NorFlashErrorKind::Other,
        }
    }
}

/// NOR flash in RAM with STM32F1 like rules: 1 KiB pages, word programming, and a word
/// can only be programmed while erased.
pub struct MemFlash {
    mem: Vec<u8>,
    pub erases: usize,
    pub writes: usize,
    /// Make every erase and write fail.
    pub fail: bool,
}

impl MemFlash {
    pub fn new(capacity: usize) -> Self {
        Self {
            mem: vec![0xFF; capacity],
            erases: 0,
            writes: 0,
            fail: false,
        }
    }

    /// Contents at an absolute address.
    pub fn at(&self, address: u32, len: usize) -> &[u8] {
        let start = (address - FLASH_BASE) as usize;
        &self.mem[start..start + len]
    }

    /// Put bytes in place without going through the programming rules.
    pub fn preload(&mut self, address: u32, bytes: &[u8]) {
        let start = (address - FLASH_BASE) as usize;
        self.mem[start..start + bytes.len()].copy_from_slice(bytes);
    }

    fn range(&self, offset: u32, len: usize) -> Result<core::ops::Range<usize>, MemFlashError> {
        let start = offset as usize;
        match start.checked_add(len) {
            Some(end) if end <= self.mem.len() => Ok(start..end),
            _ => Err(MemFlashError::OutOfBounds),
        }
    }
}

impl FlashErrorType for MemFlash {
    type Error = MemFlashError;
}

impl ReadNorFlash for MemFlash {
    const READ_SIZE: usize = 1;

    fn read(&mut self, offset: u32, bytes: &mut [u8]) -> Result<(), Self::Error> {
        let range = self.range(offset, bytes.len())?;
        bytes.copy_from_slice(&self.mem[range]);
        Ok(())
    }

    fn capacity(&self) -> usize {
        self.mem.len()
    }
}

impl NorFlash for MemFlash {
    const WRITE_SIZE: usize = 4;
    const ERASE_SIZE: usize = 1024;

    fn erase(&mut self, from: u32, to: u32) -> Result<(), Self::Error> {
        if self.fail {
            return Err(MemFlashError::Failed);
        }
        if from as usize % Self::ERASE_SIZE != 0 || to as usize % Self::ERASE_SIZE != 0 || to < from {
            return Err(MemFlashError::NotAligned);
        }
        let range = self.range(from, (to - from) as usize)?;
        self.mem[range].fill(0xFF);
        self.erases += 1;
        Ok(())
    }

    fn write(&mut self, offset: u32, bytes: &[u8]) -> Result<(), Self::Error> {
        if self.fail {
            return Err(MemFlashError::Failed);
        }
        if offset as usize % Self::WRITE_SIZE != 0 || bytes.len() % Self::WRITE_SIZE != 0 {
            return Err(MemFlashError::NotAligned);
        }
        let range = self.range(offset, bytes.len())?;
        if self.mem[range.clone()].iter().any(|&b| b != 0xFF) {
            return Err(MemFlashError::NotErased);
        }
        self.mem[range].copy_from_slice(bytes);
        self.writes += 1;
        Ok(())
    }
}

/// CRC of `data` computed the way the host tool does, independently of the bootloader's
/// [`crate::hal::Crc32`] implementations.
pub fn host_crc(data: &[u8]) -> u32 {
    let crc = Crc::<u32>::new(&CRC_32_MPEG_2);
    let mut digest = crc.digest();
    for word in data.chunks_exact(4) {
        let word = u32::from_le_bytes([word[0], word[1], word[2], word[3]]);
        digest.update(&word.to_be_bytes());
    }
    digest.finalize()
}

pub fn request<T: Serialize>(id: u8, kind: PacketType, payload: &T) -> Packet {
    let mut packet = Packet::new(id, kind);
    packet.encode(payload).unwrap();
    packet
}

/// All fragments of a Write of `data` to `address`, with the given CRC.
pub fn write_fragments(id: u8, address: u32, data: &[u8], crc: u32) -> Vec<Packet> {
    let header = BlockHeader {
        address,
        len: data.len() as u32,
        crc,
    };
    let total = fragments_for(BlockHeader::LEN, data.len());
    let mut first = request(id, PacketType::Write, &header);
    let take = data.len().min(PACKET_DATA_LEN - BlockHeader::LEN);
    first.payload[BlockHeader::LEN..BlockHeader::LEN + take].copy_from_slice(&data[..take]);

    let mut packets = vec![first];
    for chunk in data[take..].chunks(PACKET_DATA_LEN) {
        let mut packet = Packet::new(id, PacketType::Write);
        packet.payload[..chunk.len()].copy_from_slice(chunk);
        packets.push(packet);
    }
    for (index, packet) in packets.iter_mut().enumerate() {
        packet.remaining = (total - 1 - index) as u8;
    }
    packets
}

/// The host end of a pool: injects requests and collects replies.
pub struct Host<'p, const N: usize> {
    port: FramePort<'p, N>,
}

impl<'p, const N: usize> Host<'p, N> {
    pub fn new(port: FramePort<'p, N>) -> Self {
        Self { port }
    }

    pub fn send(&self, packet: &Packet) {
        let mut slot = self.port.alloc().expect("pool exhausted");
        *slot = packet.clone();
        self.port.deliver(slot);
    }

    pub fn send_all(&self, packets: &[Packet]) {
        for packet in packets {
            self.send(packet);
        }
    }

    /// Everything queued for transmission, oldest first. The slots go back to the pool.
    pub fn replies(&mut self) -> Vec<Packet> {
        let mut replies = Vec::new();
        while let Some(packet) = self.port.next_outgoing() {
            replies.push(packet.clone());
        }
        replies
    }

    pub fn port(&self) -> &FramePort<'p, N> {
        &self.port
    }
}

/// Request id and text of a complete Error message.
pub fn error_message(packets: &[Packet]) -> (u8, String) {
    let mut message = Reassembly::<256>::new(ErrorHeader::LEN);
    for packet in packets {
        assert_eq!(packet.packet_type(), Ok(PacketType::Error));
        message.push(packet).unwrap();
    }
    assert!(message.is_complete());
    let header: ErrorHeader = packets[0].decode().unwrap();
    let text = message.data();
    let end = text.iter().position(|&b| b == 0).expect("message is NUL terminated");
    (header.id, String::from_utf8(text[..end].to_vec()).unwrap())
}

/// Milliseconds set by the test.
pub struct TestClock<'a>(pub &'a Cell<u32>);

impl Clock for TestClock<'_> {
    fn now_ms(&self) -> u32 {
        self.0.get()
    }
}

/// Counts level changes.
pub struct TestLed<'a>(pub &'a Cell<usize>);

impl ErrorType for TestLed<'_> {
    type Error = Infallible;
}

impl OutputPin for TestLed<'_> {
    fn set_low(&mut self) -> Result<(), Infallible> {
        self.0.set(self.0.get() + 1);
        Ok(())
    }

    fn set_high(&mut self) -> Result<(), Infallible> {
        self.0.set(self.0.get() + 1);
        Ok(())
    }
}

impl StatefulOutputPin for TestLed<'_> {
    fn is_set_high(&mut self) -> Result<bool, Infallible> {
        Ok(self.0.get() % 2 == 1)
    }

    fn is_set_low(&mut self) -> Result<bool, Infallible> {
        Ok(self.0.get() % 2 == 0)
    }
}
