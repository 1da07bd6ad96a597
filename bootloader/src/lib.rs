// SPDX-FileCopyrightText: 2024 Foundation Devices, Inc. <hello@foundationdevices.com>
// SPDX-License-Identifier: GPL-3.0-or-later

//! SPI packet bootloader. Everything above the register level lives here and builds
//! for the host, so the protocol can be tested without a board.

#![cfg_attr(not(test), no_std)]

// Must come first, the logging macros are used by every module below.
#[macro_use]
mod fmt;

pub mod app;
pub mod engine;
pub mod error;
pub mod hal;
pub mod pool;
pub mod queue;
pub mod stream;
pub mod transport;

#[cfg(feature = "stm32f103")]
pub mod board;

#[cfg(test)]
mod testing;

pub use app::{halt_blinking, Bootloader, Step};
pub use engine::{Action, Engine};
pub use error::Error;
pub use pool::{FramePort, Mailbox, PacketBox, PacketPool};
pub use transport::{Edge, FrameHardware, Transport};
