// SPDX-FileCopyrightText: 2024 Foundation Devices, Inc. <hello@foundation.xyz>
// SPDX-License-Identifier: GPL-3.0-or-later

#![no_std]

/// Payload bytes carried by every SPI frame.
/// The frame adds a 4-byte header in front and the hardware CRC byte behind.
pub const PACKET_DATA_LEN: usize = 32;

/// Number of packet buffers in the bootloader's pool.
/// Every frame in flight, queued or held by the protocol engine is one of these.
pub const PACKET_POOL_SIZE: usize = 32;

/// Largest Write or ReadRequest payload the bootloader accepts, in bytes.
/// The protocol engine keeps a single scratch buffer of this size.
pub const MAX_TRANSFER: usize = 512;

/// Start of the internal flash in the STM32F1 memory map.
pub const FLASH_BASE: u32 = 0x0800_0000;

/// Size of a flash erase page (medium density STM32F103).
pub const FLASH_PAGE: u32 = 1024;

/// Flash reserved for the bootloader itself, from `FLASH_BASE`.
pub const BOOTLOADER_SIZE: u32 = 0x2000;

/// Where application images are linked, right after the bootloader partition.
/// Reported to the host by the "default application address" query and used for autoboot.
pub const DEFAULT_APP_ADDR: u32 = FLASH_BASE + BOOTLOADER_SIZE;

/// Start of SRAM. A plausible initial stack pointer points in here.
pub const RAM_BASE: u32 = 0x2000_0000;

/// SRAM size of the STM32F103x8/xB.
pub const RAM_SIZE: u32 = 20 * 1024;

/// Heartbeat LED period.
pub const HEARTBEAT_PERIOD_MS: u32 = 200;

/// Heartbeats without any host traffic before the default application is started.
pub const AUTOBOOT_HEARTBEATS: u32 = 20;

/// How long a requested reset waits for queued responses to be clocked out.
pub const RESET_DRAIN_MS: u32 = 50;

/// LED toggle period once the bootloader has hit an unrecoverable fault.
pub const FAULT_BLINK_MS: u32 = 500;
