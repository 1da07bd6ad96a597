// SPDX-FileCopyrightText: 2024 Foundation Devices, Inc. <hello@foundationdevices.com>
// SPDX-License-Identifier: GPL-3.0-or-later

//! Internal flash through the FPEC. Offsets are relative to `FLASH_BASE`.

use crate::hal::{FlashErrorType, NorFlash, NorFlashErrorKind, ReadNorFlash};
use consts::{FLASH_BASE, FLASH_PAGE};
use embedded_storage::nor_flash::{check_erase, check_read, check_write};
use stm32f1::stm32f103::FLASH;

const KEY1: u32 = 0x4567_0123;
const KEY2: u32 = 0xCDEF_89AB;

const CR_PG: u32 = 1 << 0;
const CR_PER: u32 = 1 << 1;
const CR_STRT: u32 = 1 << 6;
const CR_LOCK: u32 = 1 << 7;

const SR_BSY: u32 = 1 << 0;
const SR_PGERR: u32 = 1 << 2;
const SR_WRPRTERR: u32 = 1 << 4;
const SR_EOP: u32 = 1 << 5;

/// Flash size in KiB, from the device electronic signature.
const FLASH_SIZE_REGISTER: u32 = 0x1FFF_F7E0;

pub struct InternalFlash {
    regs: FLASH,
    capacity: usize,
}

impl InternalFlash {
    pub fn new(regs: FLASH) -> Self {
        // SAFETY: the signature area is always readable.
        let kib = unsafe { core::ptr::read_volatile(FLASH_SIZE_REGISTER as *const u16) };
        let capacity = usize::from(kib) * 1024;
        info!("flash: {} KiB", kib);
        Self { regs, capacity }
    }

    fn unlock(&mut self) {
        if self.regs.cr.read().bits() & CR_LOCK != 0 {
            self.regs.keyr.write(|w| unsafe { w.bits(KEY1) });
            self.regs.keyr.write(|w| unsafe { w.bits(KEY2) });
        }
    }

    fn lock(&mut self) {
        self.regs.cr.write(|w| unsafe { w.bits(CR_LOCK) });
    }

    fn wait_idle(&self) {
        while self.regs.sr.read().bits() & SR_BSY != 0 {}
    }

    /// Check and clear the status of the last operation.
    fn status(&mut self) -> Result<(), NorFlashErrorKind> {
        let status = self.regs.sr.read().bits();
        self.regs
            .sr
            .write(|w| unsafe { w.bits(SR_EOP | SR_PGERR | SR_WRPRTERR) });
        if status & (SR_PGERR | SR_WRPRTERR) != 0 {
            warn!("flash status {:#x}", status);
            return Err(NorFlashErrorKind::Other);
        }
        Ok(())
    }

    fn erase_page(&mut self, address: u32) -> Result<(), NorFlashErrorKind> {
        self.wait_idle();
        self.regs.cr.write(|w| unsafe { w.bits(CR_PER) });
        self.regs.ar.write(|w| unsafe { w.bits(address) });
        self.regs.cr.write(|w| unsafe { w.bits(CR_PER | CR_STRT) });
        self.wait_idle();
        self.regs.cr.write(|w| unsafe { w.bits(0) });
        self.status()
    }

    fn program_half_word(&mut self, address: u32, value: u16) -> Result<(), NorFlashErrorKind> {
        self.wait_idle();
        self.regs.cr.write(|w| unsafe { w.bits(CR_PG) });
        // SAFETY: address is inside flash and half-word aligned, checked by the caller.
        unsafe { core::ptr::write_volatile(address as *mut u16, value) };
        self.wait_idle();
        self.regs.cr.write(|w| unsafe { w.bits(0) });
        self.status()
    }
}

impl FlashErrorType for InternalFlash {
    type Error = NorFlashErrorKind;
}

impl ReadNorFlash for InternalFlash {
    const READ_SIZE: usize = 1;

    fn read(&mut self, offset: u32, bytes: &mut [u8]) -> Result<(), Self::Error> {
        check_read(self, offset, bytes.len())?;
        let start = (FLASH_BASE + offset) as *const u8;
        for (index, byte) in bytes.iter_mut().enumerate() {
            // SAFETY: the range was checked against the flash size.
            *byte = unsafe { core::ptr::read_volatile(start.add(index)) };
        }
        Ok(())
    }

    fn capacity(&self) -> usize {
        self.capacity
    }
}

impl NorFlash for InternalFlash {
    const WRITE_SIZE: usize = 4;
    const ERASE_SIZE: usize = FLASH_PAGE as usize;

    fn erase(&mut self, from: u32, to: u32) -> Result<(), Self::Error> {
        check_erase(self, from, to)?;
        self.unlock();
        let mut result = Ok(());
        for page in (from..to).step_by(Self::ERASE_SIZE) {
            result = self.erase_page(FLASH_BASE + page);
            if result.is_err() {
                break;
            }
        }
        self.lock();
        result
    }

    fn write(&mut self, offset: u32, bytes: &[u8]) -> Result<(), Self::Error> {
        check_write(self, offset, bytes.len())?;
        self.unlock();
        let mut result = Ok(());
        for (address, half) in (FLASH_BASE + offset..).step_by(2).zip(bytes.chunks_exact(2)) {
            result = self.program_half_word(address, u16::from_le_bytes([half[0], half[1]]));
            if result.is_err() {
                break;
            }
        }
        self.lock();
        result
    }
}
