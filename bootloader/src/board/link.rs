// SPDX-FileCopyrightText: 2024 Foundation Devices, Inc. <hello@foundationdevices.com>
// SPDX-License-Identifier: GPL-3.0-or-later

//! SPI1 in slave mode with hardware CRC, DMA1 channel 2 (RX) and 3 (TX), framed by
//! EXTI line 4 on PA4.

use crate::transport::{Edge, FrameHardware};
use core::sync::atomic::{compiler_fence, Ordering};
use stm32f1::stm32f103::{DMA1, EXTI, RCC, SPI1};

const RX_CHANNEL: u32 = 2;
const TX_CHANNEL: u32 = 3;

const CCR_EN: u32 = 1 << 0;
const CCR_DIR: u32 = 1 << 4;
const CCR_MINC: u32 = 1 << 7;

const CR1_SPE: u32 = 1 << 6;
const CR1_CRCEN: u32 = 1 << 13;
const CR2_RXDMAEN: u32 = 1 << 0;
const CR2_TXDMAEN: u32 = 1 << 1;
const SR_CRCERR: u32 = 1 << 4;

const APB2RSTR_SPI1RST: u32 = 1 << 12;

const FRAME_LINE: u32 = 1 << 4;

/// Transfer complete flag of a DMA1 channel in ISR.
const fn tcif(channel: u32) -> u32 {
    1 << (4 * (channel - 1) + 1)
}

/// All four flags of a DMA1 channel in IFCR.
const fn channel_flags(channel: u32) -> u32 {
    0xF << (4 * (channel - 1))
}

pub struct Spi1Dma {
    spi: SPI1,
    dma: DMA1,
    exti: EXTI,
}

impl Spi1Dma {
    /// Static DMA channel setup and the framing line's interrupt mask. The edge trigger
    /// and the SPI itself are configured by the transport.
    pub fn new(spi: SPI1, dma: DMA1, exti: EXTI) -> Self {
        // SAFETY: only the register's address is taken.
        let data_register = unsafe { core::ptr::addr_of!((*SPI1::ptr()).dr) } as u32;

        dma.ch2.cr.write(|w| unsafe { w.bits(CCR_MINC) });
        dma.ch2.par.write(|w| unsafe { w.bits(data_register) });
        dma.ch3.cr.write(|w| unsafe { w.bits(CCR_MINC | CCR_DIR) });
        dma.ch3.par.write(|w| unsafe { w.bits(data_register) });
        dma.ifcr
            .write(|w| unsafe { w.bits(channel_flags(RX_CHANNEL) | channel_flags(TX_CHANNEL)) });

        exti.imr.modify(|r, w| unsafe { w.bits(r.bits() | FRAME_LINE) });

        Self { spi, dma, exti }
    }

    /// Disable a channel and clear its flags, reporting whether it completed.
    fn stop_channel(&mut self, channel: u32) -> bool {
        match channel {
            RX_CHANNEL => self.dma.ch2.cr.modify(|r, w| unsafe { w.bits(r.bits() & !CCR_EN) }),
            _ => self.dma.ch3.cr.modify(|r, w| unsafe { w.bits(r.bits() & !CCR_EN) }),
        }
        compiler_fence(Ordering::SeqCst);
        let complete = self.dma.isr.read().bits() & tcif(channel) != 0;
        self.dma.ifcr.write(|w| unsafe { w.bits(channel_flags(channel)) });
        complete
    }
}

impl FrameHardware for Spi1Dma {
    unsafe fn set_rx_buffer(&mut self, buf: *mut u8, len: usize) {
        self.dma.ch2.mar.write(|w| w.bits(buf as u32));
        self.dma.ch2.ndtr.write(|w| w.bits(len as u32));
    }

    unsafe fn set_tx_buffer(&mut self, buf: *const u8, len: usize) {
        self.dma.ch3.mar.write(|w| w.bits(buf as u32));
        self.dma.ch3.ndtr.write(|w| w.bits(len as u32));
    }

    fn enable_rx(&mut self) {
        compiler_fence(Ordering::SeqCst);
        self.dma.ch2.cr.modify(|r, w| unsafe { w.bits(r.bits() | CCR_EN) });
        self.spi.cr2.modify(|r, w| unsafe { w.bits(r.bits() | CR2_RXDMAEN) });
    }

    fn enable_tx(&mut self) {
        compiler_fence(Ordering::SeqCst);
        self.dma.ch3.cr.modify(|r, w| unsafe { w.bits(r.bits() | CCR_EN) });
        self.spi.cr2.modify(|r, w| unsafe { w.bits(r.bits() | CR2_TXDMAEN) });
    }

    fn stop_rx(&mut self) -> bool {
        self.stop_channel(RX_CHANNEL)
    }

    fn stop_tx(&mut self) -> bool {
        self.stop_channel(TX_CHANNEL)
    }

    fn take_crc_error(&mut self) -> bool {
        let status = self.spi.sr.read().bits();
        self.spi.sr.write(|w| unsafe { w.bits(0) });
        status & SR_CRCERR != 0
    }

    fn discard_rx_byte(&mut self) {
        // Survives the peripheral reset otherwise.
        let _ = self.spi.dr.read().bits();
    }

    fn reset_link(&mut self) {
        // SAFETY: only the reset bit of SPI1 is touched, nothing else drives it after init.
        let rcc = unsafe { &*RCC::ptr() };
        rcc.apb2rstr.modify(|r, w| unsafe { w.bits(r.bits() | APB2RSTR_SPI1RST) });
        rcc.apb2rstr.modify(|r, w| unsafe { w.bits(r.bits() & !APB2RSTR_SPI1RST) });

        // Slave, mode 0, 8 bit, MSB first, hardware NSS. CRCEN only while SPE is clear.
        self.spi.cr1.write(|w| unsafe { w.bits(CR1_CRCEN) });
        self.spi.cr1.write(|w| unsafe { w.bits(CR1_CRCEN | CR1_SPE) });
    }

    fn preload_tx(&mut self, byte: u8) {
        self.spi.dr.write(|w| unsafe { w.bits(u32::from(byte)) });
    }

    fn set_edge(&mut self, edge: Edge) {
        let (falling, rising) = match edge {
            Edge::Falling => (FRAME_LINE, 0),
            Edge::Rising => (0, FRAME_LINE),
        };
        self.exti
            .ftsr
            .modify(|r, w| unsafe { w.bits(r.bits() & !FRAME_LINE | falling) });
        self.exti
            .rtsr
            .modify(|r, w| unsafe { w.bits(r.bits() & !FRAME_LINE | rising) });
    }

    fn acknowledge_edge(&mut self) {
        self.exti.pr.write(|w| unsafe { w.bits(FRAME_LINE) });
    }
}
