//! Command-line front end for the linker

#![deny(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, ValueEnum};
use log::{info, LevelFilter};

use soxld::base::{Format, Machine, Object};
use soxld::{reader, Config};

/// The output container format
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum FormatArg {
    /// ELF64 executable
    Elf,
    /// Mach-O executable
    Macho,
}

/// The output machine
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum ArchArg {
    /// AMD64 / Intel 64
    X86_64,
    /// AArch64
    Aarch64,
}

#[derive(Debug, Parser)]
#[command(name = "soxld", about = "Link relocatable objects into an executable")]
struct Args {
    /// Input object files
    #[arg(required = true)]
    inputs: Vec<PathBuf>,
    /// Output executable path
    #[arg(short, long)]
    output: PathBuf,
    /// Override the image base address (hex, ELF output)
    #[arg(long, value_parser = parse_hex)]
    base_addr: Option<u64>,
    /// Output format; defaults to the first input's format
    #[arg(long, value_enum)]
    format: Option<FormatArg>,
    /// Output architecture; defaults to the first input's architecture
    #[arg(long, value_enum)]
    arch: Option<ArchArg>,
    /// Produce a position-independent executable
    #[arg(long)]
    pie: bool,
}

/// Parse a base address with or without a `0x` prefix
fn parse_hex(value: &str) -> Result<u64, String> {
    let digits = value
        .strip_prefix("0x")
        .or_else(|| value.strip_prefix("0X"))
        .unwrap_or(value);
    u64::from_str_radix(digits, 16).map_err(|error| format!("invalid hex address: {error}"))
}

/// Whether an environment toggle is set non-empty
fn env_toggle(name: &str) -> bool {
    std::env::var_os(name).map(|value| !value.is_empty()).unwrap_or(false)
}

fn main() -> ExitCode {
    let tlv_debug = env_toggle("SOX_MACHO_TLV_DEBUG");
    let got_debug = env_toggle("SOX_MACHO_GOT_DEBUG");
    let mut logger = env_logger::Builder::from_default_env();
    if tlv_debug || got_debug {
        logger.filter_level(LevelFilter::Debug);
    }
    logger.init();

    let args = Args::parse();

    let mut objects: Vec<Object> = Vec::new();
    let mut failed = false;
    for input in &args.inputs {
        let name = input.display().to_string();
        let bytes = match std::fs::read(input) {
            Ok(bytes) => bytes,
            Err(error) => {
                eprintln!("error: cannot read {name}: {error}");
                failed = true;
                continue;
            }
        };
        match reader::read_object(&name, &bytes) {
            Ok(object) => {
                info!("read {name}");
                objects.push(object);
            }
            Err(error) => {
                eprintln!("error: {error}");
                failed = true;
            }
        }
    }
    if failed {
        return ExitCode::FAILURE;
    }

    let format = match args.format {
        Some(FormatArg::Elf) => Format::Elf,
        Some(FormatArg::Macho) => Format::MachO,
        None => match objects.first() {
            Some(object) => object.format,
            None => Format::Elf,
        },
    };
    let machine = match args.arch {
        Some(ArchArg::X86_64) => Machine::X86_64,
        Some(ArchArg::Aarch64) => Machine::Arm64,
        None => match objects.first() {
            Some(object) => object.machine,
            None => Machine::X86_64,
        },
    };

    let mut config = Config::builder()
        .format(format)
        .machine(machine)
        .pie(args.pie)
        .macho_tlv_debug(tlv_debug)
        .macho_got_debug(got_debug)
        .build();
    config.base_addr = args.base_addr;

    match soxld::link_to_file(objects, config, &args.output) {
        Ok(()) => ExitCode::SUCCESS,
        Err(errors) => {
            for error in errors {
                eprintln!("error: {error}");
            }
            ExitCode::FAILURE
        }
    }
}
