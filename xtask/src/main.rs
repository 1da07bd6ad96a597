// SPDX-FileCopyrightText: 2024 Foundation Devices, Inc. <hello@foundationdevices.com>
// SPDX-License-Identifier: GPL-3.0-or-later

use clap::{Parser, Subcommand};
use consts::{BOOTLOADER_SIZE, DEFAULT_APP_ADDR, FLASH_BASE};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::{exit, Command, Stdio};
use std::{env, fs};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

const TARGET: &str = "thumbv7m-none-eabi";
const PACKAGE_DIR: &str = "BootPackage";

/// Data bytes per Intel HEX record.
const HEX_RECORD_LEN: usize = 16;

#[derive(Parser)]
#[command(version, about, long_about = None)]
#[command(propagate_version = true)]
struct XtaskArgs {
    #[command(subcommand)]
    command: Commands,
    #[arg(short, long)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Build the bootloader in release and package it:
    /// BootPackage/bootloader.bin
    /// BootPackage/bootloader.hex
    #[command(verbatim_doc_comment)]
    BuildImage,

    /// Convert an application binary into an Intel HEX file for flashing
    AppHex {
        /// Raw application binary, as produced by objcopy -O binary
        bin: PathBuf,
        /// Load address, the default application address if not given
        #[arg(short, long, value_parser = parse_address)]
        address: Option<u32>,
        /// Output file, the input with a .hex extension if not given
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
}

fn parse_address(arg: &str) -> Result<u32, String> {
    let parsed = match arg.strip_prefix("0x").or_else(|| arg.strip_prefix("0X")) {
        Some(hex) => u32::from_str_radix(&hex.replace('_', ""), 16),
        None => arg.parse(),
    };
    parsed.map_err(|e| format!("invalid address {arg}: {e}"))
}

fn project_root() -> PathBuf {
    let manifest_dir = Path::new(env!("CARGO_MANIFEST_DIR"));
    manifest_dir.parent().unwrap_or(manifest_dir).to_path_buf()
}

pub fn cargo() -> String {
    env::var("CARGO").unwrap_or_else(|_| "cargo".to_string())
}

/// Run `cmd`, leaving the xtask with an error if it fails.
fn run(cmd: &mut Command, verbose: bool, what: &str) {
    if !verbose {
        cmd.stdout(Stdio::null()).stderr(Stdio::null());
    }
    match cmd.status() {
        Ok(status) if status.success() => {}
        Ok(status) => {
            tracing::error!("{what} failed: {status}");
            exit(-1);
        }
        Err(e) => {
            tracing::error!("{what} could not be started: {e}");
            exit(-1);
        }
    }
}

fn build_tools_check(verbose: bool) {
    tracing::info!("Checking cargo binutils install state");
    let mut cmd = Command::new(cargo());
    cmd.current_dir(project_root()).args(["objcopy", "--version"]);
    if !verbose {
        cmd.stdout(Stdio::null()).stderr(Stdio::null());
    }
    if !cmd.status().map(|status| status.success()).unwrap_or(false) {
        tracing::info!("Please install cargo binutils with these commands:");
        tracing::info!("cargo install cargo-binutils");
        tracing::info!("rustup component add llvm-tools");
        exit(-1);
    }

    tracing::info!("Removing package folder...");
    let package_dir = project_root().join(PACKAGE_DIR);
    if package_dir.exists() {
        if let Err(e) = fs::remove_dir_all(&package_dir) {
            tracing::error!("Removing package folder failed: {e}");
            exit(-1);
        }
    }
    if let Err(e) = fs::create_dir(&package_dir) {
        tracing::error!("Creating package folder failed: {e}");
        exit(-1);
    }
}

/// Cargo arguments selecting the firmware binary, shared by build and objcopy.
fn firmware_args(subcommand: &str) -> [&str; 8] {
    [subcommand, "--release", "--target", TARGET, "--features", "stm32f103", "--bin", "bootloader"]
}

fn build_bootloader(verbose: bool) {
    tracing::info!("Building bootloader....");
    let mut cmd = Command::new(cargo());
    cmd.current_dir(project_root().join("bootloader"))
        .args(firmware_args("build"));
    if !verbose {
        cmd.arg("--quiet");
    }
    run(&mut cmd, verbose, "Bootloader build");

    tracing::info!("Creating bootloader binary file");
    let bin = format!("../{PACKAGE_DIR}/bootloader.bin");
    let mut cmd = Command::new(cargo());
    cmd.current_dir(project_root().join("bootloader"))
        .args(firmware_args("objcopy"))
        .args(["--", "-O", "binary", &bin]);
    run(&mut cmd, verbose, "Bootloader binary generation");

    check_bootloader_size(&project_root().join(PACKAGE_DIR).join("bootloader.bin"));

    tracing::info!("Generating bootloader hex file...");
    let hex = format!("../{PACKAGE_DIR}/bootloader.hex");
    let mut cmd = Command::new(cargo());
    cmd.current_dir(project_root().join("bootloader"))
        .args(firmware_args("objcopy"))
        .args(["--", "-O", "ihex", &hex]);
    run(&mut cmd, verbose, "Bootloader hex generation");
}

/// The bootloader must leave the application partition alone.
fn check_bootloader_size(binary_path: &Path) {
    let size_bytes = match fs::metadata(binary_path) {
        Ok(metadata) => metadata.len(),
        Err(e) => {
            tracing::error!("Could not read binary metadata for {}: {e}", binary_path.display());
            exit(-1);
        }
    };
    let usage_percentage = (size_bytes as f64 / f64::from(BOOTLOADER_SIZE)) * 100.0;

    println!("Bootloader Binary Size:");
    println!("   Bytes: {} bytes", size_bytes);
    println!("   KiB: {:.2} KiB", size_bytes as f64 / 1024.0);
    println!(
        "   Flash Usage: {:.1}% of {} bytes available",
        usage_percentage, BOOTLOADER_SIZE
    );

    if size_bytes > u64::from(BOOTLOADER_SIZE) {
        tracing::error!(
            "Bootloader is {} bytes too big, the application starts at {:#010x}",
            size_bytes - u64::from(BOOTLOADER_SIZE),
            DEFAULT_APP_ADDR
        );
        exit(-1);
    }
}

/// Intel HEX records placing `data` at `address`, with extended linear address records
/// whenever the upper half of the address changes. No record crosses a 64 KiB boundary.
fn hex_records(data: &[u8], address: u32) -> Vec<ihex::Record> {
    let mut records = vec![];
    let mut upper_address = None;
    let mut addr = address;
    let mut rest = data;

    while !rest.is_empty() {
        let upper = (addr >> 16) as u16;
        if upper_address != Some(upper) {
            records.push(ihex::Record::ExtendedLinearAddress(upper));
            upper_address = Some(upper);
        }
        let to_boundary = 0x1_0000 - (addr & 0xffff) as usize;
        let (chunk, tail) = rest.split_at(rest.len().min(HEX_RECORD_LEN).min(to_boundary));
        records.push(ihex::Record::Data {
            offset: (addr & 0xffff) as u16,
            value: chunk.to_vec(),
        });
        addr = addr.wrapping_add(chunk.len() as u32);
        rest = tail;
    }

    records.push(ihex::Record::EndOfFile);
    records
}

fn app_hex(bin: &Path, address: u32, output: &Path) {
    if address < DEFAULT_APP_ADDR {
        tracing::warn!(
            "{:#010x} is inside the bootloader partition ({:#010x}..{:#010x})",
            address,
            FLASH_BASE,
            DEFAULT_APP_ADDR
        );
    }
    if address % 4 != 0 {
        tracing::error!("Load address {address:#010x} must be word aligned");
        exit(-1);
    }

    let data = match fs::read(bin) {
        Ok(data) => data,
        Err(e) => {
            tracing::error!("Reading {} failed: {e}", bin.display());
            exit(-1);
        }
    };
    if u64::from(address) + data.len() as u64 > u64::from(u32::MAX) {
        tracing::error!("{} bytes do not fit above {address:#010x}", data.len());
        exit(-1);
    }
    tracing::info!("{} bytes at {:#010x}", data.len(), address);

    let object = match ihex::create_object_file_representation(&hex_records(&data, address)) {
        Ok(object) => object,
        Err(e) => {
            tracing::error!("Creating the hex object failed: {e}");
            exit(-1);
        }
    };
    let written = fs::File::create(output).and_then(|mut file| file.write_all(object.as_bytes()));
    if let Err(e) = written {
        tracing::error!("Writing {} failed: {e}", output.display());
        exit(-1);
    }
    tracing::info!("Wrote {}", output.display());
}

fn main() {
    // Tracing using RUST_LOG, info by default
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = XtaskArgs::parse();

    match args.command {
        Commands::BuildImage => {
            build_tools_check(args.verbose);
            build_bootloader(args.verbose);
        }
        Commands::AppHex { bin, address, output } => {
            let output = output.unwrap_or_else(|| bin.with_extension("hex"));
            app_hex(&bin, address.unwrap_or(DEFAULT_APP_ADDR), &output);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn addresses_parse_as_hex_or_decimal() {
        assert_eq!(parse_address("0x0800_2000"), Ok(0x0800_2000));
        assert_eq!(parse_address("0X8002000"), Ok(0x0800_2000));
        assert_eq!(parse_address("134225920"), Ok(0x0800_2000));
        assert!(parse_address("0xZZ").is_err());
    }

    #[test]
    fn records_track_the_upper_address() {
        let data: Vec<u8> = (0..40).collect();
        let records = hex_records(&data, 0x0800_FFF0);

        assert_eq!(
            records,
            vec![
                ihex::Record::ExtendedLinearAddress(0x0800),
                ihex::Record::Data {
                    offset: 0xFFF0,
                    value: data[..16].to_vec()
                },
                ihex::Record::ExtendedLinearAddress(0x0801),
                ihex::Record::Data {
                    offset: 0x0000,
                    value: data[16..32].to_vec()
                },
                ihex::Record::Data {
                    offset: 0x0010,
                    value: data[32..].to_vec()
                },
                ihex::Record::EndOfFile,
            ]
        );
    }

    #[test]
    fn records_split_at_the_boundary() {
        let data = [0xAA; 8];
        let records = hex_records(&data, 0x0800_FFFC);

        assert_eq!(
            records,
            vec![
                ihex::Record::ExtendedLinearAddress(0x0800),
                ihex::Record::Data {
                    offset: 0xFFFC,
                    value: vec![0xAA; 4]
                },
                ihex::Record::ExtendedLinearAddress(0x0801),
                ihex::Record::Data {
                    offset: 0x0000,
                    value: vec![0xAA; 4]
                },
                ihex::Record::EndOfFile,
            ]
        );
    }

    #[test]
    fn empty_binary_is_just_the_end() {
        assert_eq!(hex_records(&[], DEFAULT_APP_ADDR), vec![ihex::Record::EndOfFile]);
    }

    #[test]
    fn hex_text_reads_back() {
        let records = hex_records(&[0xDE, 0xAD, 0xBE, 0xEF], DEFAULT_APP_ADDR);
        let object = ihex::create_object_file_representation(&records).unwrap();
        assert!(object.starts_with(":020000040800F2"));
        let parsed: Vec<_> = ihex::Reader::new(&object).map(Result::unwrap).collect();
        assert_eq!(parsed, records);
    }
}
