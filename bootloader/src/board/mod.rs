// SPDX-FileCopyrightText: 2024 Foundation Devices, Inc. <hello@foundationdevices.com>
// SPDX-License-Identifier: GPL-3.0-or-later

//! STM32F103 support: clocks, pins and the hardware behind the collaborator traits.
//!
//! Pins: PA4 frame select (EXTI4), PA5 SCK, PA6 MISO, PA7 MOSI, PC13 LED.

mod crc;
mod flash;
mod jump_app;
mod link;

pub use self::crc::HwCrc;
pub use self::flash::InternalFlash;
pub use self::jump_app::{jump_to_app, Stm32System};
pub use self::link::Spi1Dma;

use crate::hal::Clock;
use core::convert::Infallible;
use core::sync::atomic::{AtomicU32, Ordering};
use cortex_m::peripheral::syst::SystClkSource;
use cortex_m::peripheral::NVIC;
use embedded_hal::delay::DelayNs;
use embedded_hal::digital::{ErrorType, OutputPin, StatefulOutputPin};
use stm32f1::stm32f103::{self as pac, Interrupt, GPIOC};

pub const SYSCLK_HZ: u32 = 72_000_000;

/// SysTick runs from HCLK / 8.
const SYSTICK_RELOAD: u32 = SYSCLK_HZ / 8 / 1000 - 1;

const LED_PIN: u32 = 13;

static MILLIS: AtomicU32 = AtomicU32::new(0);

/// SysTick exception body.
pub fn tick() {
    MILLIS.fetch_add(1, Ordering::Relaxed);
}

/// Milliseconds since boot, counted by SysTick.
pub struct TickClock {
    _private: (),
}

impl Clock for TickClock {
    fn now_ms(&self) -> u32 {
        MILLIS.load(Ordering::Relaxed)
    }
}

/// Busy-wait delay counted in core cycles; works with interrupts off.
pub struct CycleDelay;

impl DelayNs for CycleDelay {
    fn delay_ns(&mut self, ns: u32) {
        let cycles = u64::from(ns) * u64::from(SYSCLK_HZ) / 1_000_000_000;
        cortex_m::asm::delay(cycles.max(1) as u32);
    }
}

/// The Blue Pill LED on PC13.
pub struct Led {
    port: GPIOC,
}

impl Led {
    /// Take the LED from whoever owns it. For fault handlers only.
    ///
    /// # Safety
    ///
    /// Nothing else may be driving PC13 anymore.
    pub unsafe fn steal() -> Self {
        Self {
            port: pac::Peripherals::steal().GPIOC,
        }
    }
}

impl ErrorType for Led {
    type Error = Infallible;
}

impl OutputPin for Led {
    fn set_low(&mut self) -> Result<(), Self::Error> {
        self.port.bsrr.write(|w| unsafe { w.bits(1 << (LED_PIN + 16)) });
        Ok(())
    }

    fn set_high(&mut self) -> Result<(), Self::Error> {
        self.port.bsrr.write(|w| unsafe { w.bits(1 << LED_PIN) });
        Ok(())
    }
}

impl StatefulOutputPin for Led {
    fn is_set_high(&mut self) -> Result<bool, Self::Error> {
        Ok(self.port.odr.read().bits() & (1 << LED_PIN) != 0)
    }

    fn is_set_low(&mut self) -> Result<bool, Self::Error> {
        Ok(!self.is_set_high()?)
    }
}

pub struct Board {
    pub link: Spi1Dma,
    pub flash: InternalFlash,
    pub crc: HwCrc,
    pub led: Led,
    pub clock: TickClock,
    pub system: Stm32System,
}

impl Board {
    pub fn init(p: pac::Peripherals, mut core: cortex_m::Peripherals) -> Self {
        clock_setup_72mhz(&p.RCC, &p.FLASH);

        // AFIO, GPIOA, GPIOB, GPIOC and SPI1 on APB2; DMA1 and CRC on AHB.
        p.RCC
            .apb2enr
            .modify(|r, w| unsafe { w.bits(r.bits() | 1 << 0 | 1 << 2 | 1 << 3 | 1 << 4 | 1 << 12) });
        p.RCC
            .ahbenr
            .modify(|r, w| unsafe { w.bits(r.bits() | 1 << 0 | 1 << 6) });

        // PA4, PA5, PA7 floating inputs; PA6 alternate function push-pull, 50 MHz.
        p.GPIOA.crl.modify(|r, w| unsafe {
            w.bits(r.bits() & 0x0000_FFFF | 0x4 << 16 | 0x4 << 20 | 0xB << 24 | 0x4 << 28)
        });
        // EXTI4 from port A.
        p.AFIO.exticr2.modify(|r, w| unsafe { w.bits(r.bits() & !0xF) });
        // PC13 push-pull output, 2 MHz.
        p.GPIOC
            .crh
            .modify(|r, w| unsafe { w.bits(r.bits() & !(0xF << 20) | 0x2 << 20) });

        core.SYST.set_clock_source(SystClkSource::External);
        core.SYST.set_reload(SYSTICK_RELOAD);
        core.SYST.clear_current();
        core.SYST.enable_interrupt();
        core.SYST.enable_counter();

        info!("board up at {} Hz", SYSCLK_HZ);

        Self {
            link: Spi1Dma::new(p.SPI1, p.DMA1, p.EXTI),
            flash: InternalFlash::new(p.FLASH),
            crc: HwCrc::new(p.CRC),
            led: Led { port: p.GPIOC },
            clock: TickClock { _private: () },
            system: Stm32System::new(),
        }
    }
}

/// Start taking frame select edges. Call once the transport is in place.
pub fn enable_link_interrupt() {
    // SAFETY: the handler only touches the transport behind a critical section.
    unsafe { NVIC::unmask(Interrupt::EXTI4) };
}

/// 8 MHz HSE, PLL x9, APB1 at 36 MHz, two flash wait states.
fn clock_setup_72mhz(rcc: &pac::RCC, flash: &pac::FLASH) {
    rcc.cr.modify(|r, w| unsafe { w.bits(r.bits() | 1 << 16) });
    while rcc.cr.read().bits() & 1 << 17 == 0 {}

    flash.acr.write(|w| unsafe { w.bits(1 << 4 | 2) });

    rcc.cfgr
        .write(|w| unsafe { w.bits(0b0111 << 18 | 1 << 16 | 0b100 << 8) });
    rcc.cr.modify(|r, w| unsafe { w.bits(r.bits() | 1 << 24) });
    while rcc.cr.read().bits() & 1 << 25 == 0 {}

    rcc.cfgr.modify(|r, w| unsafe { w.bits(r.bits() & !0b11 | 0b10) });
    while rcc.cfgr.read().bits() >> 2 & 0b11 != 0b10 {}
}
