// SPDX-FileCopyrightText: 2024 Foundation Devices, Inc. <hello@foundationdevices.com>
// SPDX-License-Identifier: GPL-3.0-or-later

#![no_std]
#![no_main]

use defmt_rtt as _;
// global logger
use panic_probe as _;

use bootloader::board::{self, Board, CycleDelay, Led, Spi1Dma};
use bootloader::{halt_blinking, Bootloader, Engine, PacketPool, Transport};
use core::cell::RefCell;
use cortex_m_rt::{entry, exception, ExceptionFrame};
use critical_section::Mutex;
use defmt::{error, info};
use stm32f1::stm32f103::{self as pac, interrupt};

static POOL: PacketPool = PacketPool::new();

// Owned by the frame select interrupt once the board is up
static TRANSPORT: Mutex<RefCell<Option<Transport<'static, Spi1Dma>>>> = Mutex::new(RefCell::new(None));

#[entry]
fn main() -> ! {
    info!("bootloader {}", env!("CARGO_PKG_VERSION"));

    let (Some(p), Some(core)) = (pac::Peripherals::take(), cortex_m::Peripherals::take()) else {
        defmt::panic!("peripherals already taken");
    };
    let Some((mailbox, port)) = POOL.split() else {
        defmt::panic!("packet pool already split");
    };

    let Board {
        link,
        flash,
        crc,
        led,
        clock,
        mut system,
    } = Board::init(p, core);

    critical_section::with(|cs| {
        TRANSPORT.borrow_ref_mut(cs).replace(Transport::new(link, port));
    });
    board::enable_link_interrupt();

    let engine = Engine::new(mailbox, flash, crc);
    Bootloader::new(engine, clock, led).run(&mut system)
}

#[interrupt]
fn EXTI4() {
    critical_section::with(|cs| {
        if let Some(transport) = TRANSPORT.borrow_ref_mut(cs).as_mut() {
            transport.on_edge();
        }
    });
}

#[exception]
fn SysTick() {
    board::tick();
}

#[exception]
unsafe fn HardFault(frame: &ExceptionFrame) -> ! {
    error!("hard fault at pc {:#x}", frame.pc());
    // The main loop is never coming back.
    let mut led = Led::steal();
    halt_blinking(&mut led, &mut CycleDelay)
}
