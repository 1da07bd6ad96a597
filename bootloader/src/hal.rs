// SPDX-FileCopyrightText: 2024 Foundation Devices, Inc. <hello@foundationdevices.com>
// SPDX-License-Identifier: GPL-3.0-or-later

//! Collaborators the bootloader logic is written against. The board module implements
//! them on the STM32F103; tests substitute doubles.

use crc::{Crc, Digest, CRC_32_MPEG_2};

pub use embedded_storage::nor_flash::{
    ErrorType as FlashErrorType, NorFlash, NorFlashError, NorFlashErrorKind, ReadNorFlash,
};

/// Word-oriented CRC-32 with the STM32 CRC unit's conventions: polynomial 0x04C11DB7,
/// initial value 0xFFFFFFFF, each 32-bit word shifted in most significant bit first,
/// no reflection and no final XOR (CRC-32/MPEG-2 over the big-endian bytes of each word).
pub trait Crc32 {
    fn reset(&mut self);

    fn feed(&mut self, word: u32);

    fn value(&mut self) -> u32;

    /// CRC of a fresh computation over `words`.
    fn block_crc32<I: IntoIterator<Item = u32>>(&mut self, words: I) -> u32 {
        self.reset();
        for word in words {
            self.feed(word);
        }
        self.value()
    }
}

static CRC_MPEG2: Crc<u32> = Crc::<u32>::new(&CRC_32_MPEG_2);

/// [`Crc32`] in software, for hosts and parts without a CRC unit.
pub struct SoftCrc {
    digest: Digest<'static, u32>,
}

impl SoftCrc {
    pub fn new() -> Self {
        Self {
            digest: CRC_MPEG2.digest(),
        }
    }
}

impl Default for SoftCrc {
    fn default() -> Self {
        Self::new()
    }
}

impl Crc32 for SoftCrc {
    fn reset(&mut self) {
        self.digest = CRC_MPEG2.digest();
    }

    fn feed(&mut self, word: u32) {
        self.digest.update(&word.to_be_bytes());
    }

    fn value(&mut self) -> u32 {
        self.digest.clone().finalize()
    }
}

/// Free-running millisecond tick. Wraps around; compare with `wrapping_sub`.
pub trait Clock {
    fn now_ms(&self) -> u32;
}

/// Ways of leaving the bootloader.
pub trait System {
    /// Tear the bootloader down and start the image whose vector table is at `address`.
    fn jump(&mut self, address: u32) -> !;

    fn reset(&mut self) -> !;
}

/// Whether `stack_pointer`, the first word of a vector table, points into SRAM.
pub fn plausible_stack_pointer(stack_pointer: u32) -> bool {
    stack_pointer & 0x2FFE_0000 == 0x2000_0000
}

/// Little-endian words of `bytes`; a trailing partial word is ignored.
pub fn le_words(bytes: &[u8]) -> impl Iterator<Item = u32> + '_ {
    bytes
        .chunks_exact(4)
        .map(|chunk| u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn matches_stm32_crc_unit() {
        let mut crc = SoftCrc::new();
        // Reference value of the STM32 CRC unit for a single word.
        assert_eq!(crc.block_crc32([0x1234_5678]), 0xDF8A_8A2B);
        // Value is not consumed by reading it.
        crc.reset();
        crc.feed(0x1234_5678);
        assert_eq!(crc.value(), crc.value());
        assert_eq!(crc.block_crc32([]), 0xFFFF_FFFF);
    }

    #[test]
    fn stack_pointer_plausibility() {
        assert!(plausible_stack_pointer(0x2000_5000));
        assert!(plausible_stack_pointer(0x2001_FFFC));
        assert!(!plausible_stack_pointer(0xFFFF_FFFF));
        assert!(!plausible_stack_pointer(0x0800_2000));
        assert!(!plausible_stack_pointer(0x2002_0000));
    }

    #[test]
    fn words() {
        let bytes = [1, 0, 0, 0, 0x78, 0x56, 0x34, 0x12, 9];
        let words: std::vec::Vec<_> = le_words(&bytes).collect();
        assert_eq!(words, [1, 0x1234_5678]);
    }
}
