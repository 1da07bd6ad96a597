// SPDX-FileCopyrightText: 2024 Foundation Devices, Inc. <hello@foundation.xyz>
// SPDX-License-Identifier: GPL-3.0-or-later

//! Generates `memory.x` for the firmware binary from the shared flash map, so the
//! bootloader partition and the application address can never disagree.
//! Host builds of the library skip the linker scripts.

use consts::{BOOTLOADER_SIZE, FLASH_BASE, RAM_BASE, RAM_SIZE};
use std::env;
use std::fs::File;
use std::io::Write;
use std::path::PathBuf;

fn main() {
    println!("cargo:rerun-if-changed=build.rs");

    if env::var_os("CARGO_FEATURE_STM32F103").is_none() {
        return;
    }

    let memory_x_content = format!(
        r##"
        MEMORY
        {{
            /* NOTE 1 K = 1 KiBi = 1024 bytes */
            /* The bootloader owns the start of flash, applications are linked after it */
            FLASH (rx) : ORIGIN = {:#010X}, LENGTH = {}K
            RAM (rwx) : ORIGIN = {:#010X}, LENGTH = {}K
        }}
        "##,
        FLASH_BASE,
        BOOTLOADER_SIZE / 1024,
        RAM_BASE,
        RAM_SIZE / 1024,
    );

    // Put `memory.x` in our output directory and ensure it's
    // on the linker search path.
    let out = &PathBuf::from(env::var_os("OUT_DIR").expect("OUT_DIR is set by cargo"));
    File::create(out.join("memory.x"))
        .and_then(|mut file| file.write_all(memory_x_content.as_bytes()))
        .expect("failed to write memory.x");
    println!("cargo:rustc-link-search={}", out.display());

    println!("cargo:rustc-link-arg-bins=-Tlink.x");
    println!("cargo:rustc-link-arg-bins=-Tdefmt.x");
}
