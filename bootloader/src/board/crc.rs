// SPDX-FileCopyrightText: 2024 Foundation Devices, Inc. <hello@foundationdevices.com>
// SPDX-License-Identifier: GPL-3.0-or-later

use crate::hal::Crc32;
use stm32f1::stm32f103::CRC;

const CR_RESET: u32 = 1 << 0;

/// The CRC calculation unit.
pub struct HwCrc {
    regs: CRC,
}

impl HwCrc {
    pub fn new(regs: CRC) -> Self {
        Self { regs }
    }
}

impl Crc32 for HwCrc {
    fn reset(&mut self) {
        self.regs.cr.write(|w| unsafe { w.bits(CR_RESET) });
    }

    fn feed(&mut self, word: u32) {
        self.regs.dr.write(|w| unsafe { w.bits(word) });
    }

    fn value(&mut self) -> u32 {
        self.regs.dr.read().bits()
    }
}
