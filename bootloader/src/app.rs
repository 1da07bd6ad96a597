// SPDX-FileCopyrightText: 2024 Foundation Devices, Inc. <hello@foundationdevices.com>
// SPDX-License-Identifier: GPL-3.0-or-later

//! Main loop: feeds received packets to the engine, blinks the heartbeat LED and starts
//! the default application if no host shows up.

use crate::engine::{Action, Engine};
use crate::hal::{Clock, Crc32, NorFlash, System};
use consts::{
    AUTOBOOT_HEARTBEATS, DEFAULT_APP_ADDR, FAULT_BLINK_MS, HEARTBEAT_PERIOD_MS, PACKET_POOL_SIZE, RESET_DRAIN_MS,
};
use embedded_hal::delay::DelayNs;
use embedded_hal::digital::StatefulOutputPin;

/// Outcome of one pass of the main loop.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Step {
    Idle,
    Jump(u32),
    Reset,
}

pub struct Bootloader<'p, F, C, K, L, const N: usize = PACKET_POOL_SIZE> {
    engine: Engine<'p, F, C, N>,
    clock: K,
    led: L,
    /// No packet has been received yet, the autoboot countdown is running.
    booting: bool,
    countdown: u32,
    last_beat: u32,
    /// When a reset was requested; replies not sent yet get a little time to go out.
    reset_at: Option<u32>,
}

impl<'p, F, C, K, L, const N: usize> Bootloader<'p, F, C, K, L, N>
where
    F: NorFlash,
    C: Crc32,
    K: Clock,
    L: StatefulOutputPin,
{
    pub fn new(engine: Engine<'p, F, C, N>, clock: K, led: L) -> Self {
        let last_beat = clock.now_ms();
        Self {
            engine,
            clock,
            led,
            booting: true,
            countdown: AUTOBOOT_HEARTBEATS,
            last_beat,
            reset_at: None,
        }
    }

    pub fn engine(&self) -> &Engine<'p, F, C, N> {
        &self.engine
    }

    pub fn is_booting(&self) -> bool {
        self.booting
    }

    pub fn poll(&mut self) -> Step {
        while self.reset_at.is_none() {
            let Some(action) = self.engine.poll() else {
                break;
            };
            if self.booting {
                info!("host is talking, autoboot cancelled");
                self.booting = false;
            }
            match action {
                Action::Continue => {}
                Action::Jump(address) => return Step::Jump(address),
                Action::Reset => self.reset_at = Some(self.clock.now_ms()),
            }
        }

        let now = self.clock.now_ms();
        if let Some(requested) = self.reset_at {
            if self.engine.mailbox().tx_idle() || now.wrapping_sub(requested) >= RESET_DRAIN_MS {
                return Step::Reset;
            }
        }

        if now.wrapping_sub(self.last_beat) >= HEARTBEAT_PERIOD_MS {
            self.last_beat = now;
            self.heartbeat()
        } else {
            Step::Idle
        }
    }

    fn heartbeat(&mut self) -> Step {
        if self.led.toggle().is_err() {
            warn!("heartbeat LED error");
        }
        trace!("pool {:?}", self.engine.mailbox().census());

        if !self.booting {
            return Step::Idle;
        }
        self.countdown = self.countdown.saturating_sub(1);
        if self.countdown > 0 {
            return Step::Idle;
        }

        self.booting = false;
        if self.engine.image_is_plausible(DEFAULT_APP_ADDR) {
            info!("starting application at {:#x}", DEFAULT_APP_ADDR);
            Step::Jump(DEFAULT_APP_ADDR)
        } else {
            info!("no application at {:#x}, waiting for the host", DEFAULT_APP_ADDR);
            Step::Idle
        }
    }

    /// Serve the host until it is time to leave.
    pub fn run<S: System>(mut self, system: &mut S) -> ! {
        loop {
            match self.poll() {
                Step::Idle => {}
                Step::Jump(address) => system.jump(address),
                Step::Reset => system.reset(),
            }
        }
    }
}

/// Unrecoverable fault: blink forever. Busy-waits, interrupts may be unusable.
pub fn halt_blinking<L: StatefulOutputPin, D: DelayNs>(led: &mut L, delay: &mut D) -> ! {
    loop {
        let _ = led.toggle();
        delay.delay_ms(FAULT_BLINK_MS);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hal::SoftCrc;
    use crate::pool::PacketPool;
    use crate::testing::{error_message, request, Host, MemFlash, TestClock, TestLed};
    use core::cell::Cell;
    use host_protocol::{GoPayload, Packet, PacketType};

    type TestLoader<'a> = Bootloader<'a, MemFlash, SoftCrc, TestClock<'a>, TestLed<'a>, 32>;

    fn setup<'a>(
        pool: &'a PacketPool<32>,
        now: &'a Cell<u32>,
        toggles: &'a Cell<usize>,
        with_image: bool,
    ) -> (TestLoader<'a>, Host<'a, 32>) {
        let (mailbox, port) = pool.split().unwrap();
        let mut flash = MemFlash::new(64 * 1024);
        if with_image {
            flash.preload(DEFAULT_APP_ADDR, &0x2000_5000u32.to_le_bytes());
        }
        let engine = Engine::new(mailbox, flash, SoftCrc::new());
        (
            Bootloader::new(engine, TestClock(now), TestLed(toggles)),
            Host::new(port),
        )
    }

    /// Advance one heartbeat period and poll.
    fn beat(loader: &mut TestLoader<'_>, now: &Cell<u32>) -> Step {
        now.set(now.get().wrapping_add(HEARTBEAT_PERIOD_MS));
        loader.poll()
    }

    #[test]
    fn autoboot_after_countdown() {
        let (pool, now, toggles) = (PacketPool::new(), Cell::new(0), Cell::new(0));
        let (mut loader, _host) = setup(&pool, &now, &toggles, true);

        assert_eq!(loader.poll(), Step::Idle);
        for _ in 1..AUTOBOOT_HEARTBEATS {
            assert_eq!(beat(&mut loader, &now), Step::Idle);
        }
        assert_eq!(beat(&mut loader, &now), Step::Jump(DEFAULT_APP_ADDR));
        assert_eq!(toggles.get(), AUTOBOOT_HEARTBEATS as usize);
    }

    #[test]
    fn no_image_keeps_waiting() {
        let (pool, now, toggles) = (PacketPool::new(), Cell::new(0), Cell::new(0));
        let (mut loader, _host) = setup(&pool, &now, &toggles, false);

        for _ in 0..AUTOBOOT_HEARTBEATS * 2 {
            assert_eq!(beat(&mut loader, &now), Step::Idle);
        }
        assert!(!loader.is_booting());
        assert_eq!(toggles.get(), AUTOBOOT_HEARTBEATS as usize * 2);
    }

    #[test]
    fn heartbeat_is_periodic_and_wraps() {
        let (pool, now, toggles) = (PacketPool::new(), Cell::new(u32::MAX - 150), Cell::new(0));
        let (mut loader, _host) = setup(&pool, &now, &toggles, false);

        now.set(now.get().wrapping_add(HEARTBEAT_PERIOD_MS - 1));
        loader.poll();
        assert_eq!(toggles.get(), 0);
        now.set(now.get().wrapping_add(1));
        loader.poll();
        assert_eq!(toggles.get(), 1);
        assert_eq!(beat(&mut loader, &now), Step::Idle);
        assert_eq!(toggles.get(), 2);
    }

    #[test]
    fn any_packet_cancels_autoboot() {
        let (pool, now, toggles) = (PacketPool::new(), Cell::new(0), Cell::new(0));
        let (mut loader, host) = setup(&pool, &now, &toggles, true);

        beat(&mut loader, &now);
        host.send(&Packet::EMPTY);
        assert_eq!(loader.poll(), Step::Idle);
        assert!(!loader.is_booting());

        for _ in 0..AUTOBOOT_HEARTBEATS * 2 {
            assert_eq!(beat(&mut loader, &now), Step::Idle);
        }
    }

    #[test]
    fn go_is_obeyed() {
        let (pool, now, toggles) = (PacketPool::new(), Cell::new(0), Cell::new(0));
        let (mut loader, host) = setup(&pool, &now, &toggles, true);

        host.send(&request(1, PacketType::Go, &GoPayload { address: DEFAULT_APP_ADDR }));
        assert_eq!(loader.poll(), Step::Jump(DEFAULT_APP_ADDR));
    }

    #[test]
    fn reset_waits_for_the_reply() {
        let (pool, now, toggles) = (PacketPool::new(), Cell::new(0), Cell::new(0));
        let (mut loader, mut host) = setup(&pool, &now, &toggles, false);

        host.send(&request(2, PacketType::Go, &GoPayload { address: DEFAULT_APP_ADDR }));
        // Packets after the reset request are left alone.
        host.send(&Packet::new(3, PacketType::Sync));
        assert_eq!(loader.poll(), Step::Idle);
        assert_eq!(loader.poll(), Step::Idle);

        let replies = host.replies();
        assert_eq!(error_message(&replies), (2, "Jump target looks dubious.".into()));
        assert_eq!(loader.poll(), Step::Reset);
        assert_eq!(loader.engine().mailbox().census().inbox, Some(1));
    }

    #[test]
    fn reset_gives_up_waiting() {
        let (pool, now, toggles) = (PacketPool::new(), Cell::new(0), Cell::new(0));
        let (mut loader, host) = setup(&pool, &now, &toggles, false);

        host.send(&request(4, PacketType::Go, &GoPayload { address: 0 }));
        assert_eq!(loader.poll(), Step::Idle);
        now.set(RESET_DRAIN_MS - 1);
        assert_eq!(loader.poll(), Step::Idle);
        now.set(RESET_DRAIN_MS);
        assert_eq!(loader.poll(), Step::Reset);
    }

    #[test]
    fn reset_with_nothing_queued_is_immediate() {
        let (pool, now, toggles) = (PacketPool::new(), Cell::new(0), Cell::new(0));
        let (mut loader, host) = setup(&pool, &now, &toggles, false);

        host.send(&Packet::new(5, PacketType::Reset));
        assert_eq!(loader.poll(), Step::Reset);
    }
}
