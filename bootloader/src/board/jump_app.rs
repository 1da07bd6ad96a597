// SPDX-FileCopyrightText: 2024 Foundation Devices, Inc. <hello@foundationdevices.com>
// SPDX-License-Identifier: GPL-3.0-or-later

use crate::hal::System;
use cortex_m::peripheral::{NVIC, SCB, SYST};
use stm32f1::stm32f103::RCC;

const APB2RSTR_SPI1RST: u32 = 1 << 12;

/// Leaves the bootloader through the core: a jump into an image or a system reset.
pub struct Stm32System {
    _private: (),
}

impl Stm32System {
    pub(super) fn new() -> Self {
        Self { _private: () }
    }
}

impl System for Stm32System {
    fn jump(&mut self, address: u32) -> ! {
        // SAFETY: the engine only jumps to images with a plausible stack pointer.
        unsafe { jump_to_app(address) }
    }

    fn reset(&mut self) -> ! {
        SCB::sys_reset()
    }
}

/// Stop everything the bootloader started, put the clocks back to HSI and start the
/// image whose vector table is at `address`.
///
/// # Safety
///
/// This modifies the stack pointer and vector table and runs whatever code `address` points at.
pub unsafe fn jump_to_app(address: u32) -> ! {
    // No interrupt may fire once the vector table moves, SysTick included.
    let nvic = &*NVIC::PTR;
    for bank in 0..2 {
        nvic.icer[bank].write(0xFFFF_FFFF);
        nvic.icpr[bank].write(0xFFFF_FFFF);
    }
    (*SYST::PTR).csr.write(0x04);

    let rcc = &*RCC::ptr();
    rcc.apb2rstr.modify(|r, w| w.bits(r.bits() | APB2RSTR_SPI1RST));
    rcc.apb2rstr.modify(|r, w| w.bits(r.bits() & !APB2RSTR_SPI1RST));

    // HSI on, then switch to it and turn off HSE, CSS, PLL and all clock interrupts.
    rcc.cr.modify(|r, w| w.bits(r.bits() | 0x0000_0001));
    rcc.cfgr.modify(|r, w| w.bits(r.bits() & 0xF8FF_0000));
    rcc.cr.modify(|r, w| w.bits(r.bits() & 0xFEF6_FFFF));
    rcc.cr.modify(|r, w| w.bits(r.bits() & 0xFFFB_FFFF));
    rcc.cfgr.modify(|r, w| w.bits(r.bits() & 0xFF80_FFFF));
    rcc.cir.write(|w| w.bits(0));

    let msp = core::ptr::read_volatile(address as *const u32);
    let rv = core::ptr::read_volatile((address + 4) as *const u32);
    (*SCB::PTR).vtor.write(address);

    // These instructions perform the following operations:
    //
    // * Modify control register to use MSP as stack pointer (clear spsel bit)
    // * Synchronize instruction barrier
    // * Initialize stack pointer from the image's vector table
    // * Set link register to not return (0xFF)
    // * Jump to the image's reset vector
    core::arch::asm!(
        "mrs {tmp}, CONTROL",
        "bics {tmp}, {spsel}",
        "msr CONTROL, {tmp}",
        "isb",
        "msr MSP, {msp}",
        "mov lr, {new_lr}",
        "bx {rv}",
        // `out(reg) _` is not permitted in a `noreturn` asm! call,
        // so instead use `in(reg) 0` and don't restore it afterwards.
        tmp = in(reg) 0,
        spsel = in(reg) 2,
        new_lr = in(reg) 0xFFFFFFFFu32,
        msp = in(reg) msp,
        rv = in(reg) rv,
        options(noreturn),
    );
}
