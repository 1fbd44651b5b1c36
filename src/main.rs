//! tinyvmm - A minimal KVM monitor.
//!
//! Loads a flat machine-code image into one page of guest memory, points a
//! single vCPU at it and runs it until it halts. The only device is one
//! output port: every byte the guest writes there goes to stdout.
//!
//! This VMM requires Linux with KVM support. It will not run on other platforms.

#[cfg(target_os = "linux")]
mod config;
#[cfg(target_os = "linux")]
mod guest;
#[cfg(target_os = "linux")]
mod kvm;
#[cfg(target_os = "linux")]
mod runloop;
#[cfg(target_os = "linux")]
mod vmm;

use clap::Parser;
use std::path::PathBuf;
use std::process::ExitCode;

#[derive(Parser, Debug)]
#[command(name = "tinyvmm")]
#[command(about = "Run a flat guest image on a single KVM vCPU")]
struct Args {
    /// Raw guest image (defaults to the built-in add-and-print guest)
    #[arg(short, long)]
    image: Option<PathBuf>,

    /// Guest memory size in bytes
    #[arg(short, long, default_value = "0x1000", value_parser = parse_u64)]
    memory: u64,

    /// Guest physical address the memory (and image) is mapped at
    #[arg(long, default_value = "0x1000", value_parser = parse_u64)]
    guest_addr: u64,

    /// KVM memory slot
    #[arg(long, default_value = "0")]
    slot: u32,

    /// Entry instruction pointer
    #[arg(short, long, default_value = "0x1000", value_parser = parse_u64)]
    entry: u64,

    /// Initial RAX
    #[arg(long, default_value = "4", value_parser = parse_u64)]
    rax: u64,

    /// Initial RBX
    #[arg(long, default_value = "2", value_parser = parse_u64)]
    rbx: u64,

    /// I/O port whose writes are forwarded to stdout
    #[arg(short, long, default_value = "0x3f8", value_parser = parse_u16)]
    port: u16,

    /// Access width in bytes the output port accepts (1, 2 or 4)
    #[arg(long, default_value = "1", value_parser = parse_port_width)]
    port_width: u8,

    /// Single-step the guest, logging every instruction address (RUST_LOG=trace)
    #[arg(long)]
    trace: bool,
}

/// Parse a decimal or `0x`-prefixed hexadecimal number.
fn parse_u64(s: &str) -> Result<u64, String> {
    let parsed = match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => u64::from_str_radix(hex, 16),
        None => s.parse(),
    };
    parsed.map_err(|e| format!("invalid number '{}': {}", s, e))
}

fn parse_u16(s: &str) -> Result<u16, String> {
    let value = parse_u64(s)?;
    u16::try_from(value).map_err(|_| format!("port {:#x} is out of range", value))
}

fn parse_port_width(s: &str) -> Result<u8, String> {
    match parse_u64(s)? {
        width @ (1 | 2 | 4) => Ok(width as u8),
        width => Err(format!("port width must be 1, 2 or 4 bytes, got {}", width)),
    }
}

fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();

    if let Err(e) = run(args) {
        eprintln!("Error: {e}");
        return ExitCode::FAILURE;
    }

    ExitCode::SUCCESS
}

#[cfg(target_os = "linux")]
fn run(args: Args) -> Result<(), Box<dyn std::error::Error>> {
    use config::{PortFilter, RegisterState, VmConfig};

    let mut config = VmConfig {
        slot: args.slot,
        guest_addr: args.guest_addr,
        mem_size: args.memory,
        registers: RegisterState {
            rip: args.entry,
            rax: args.rax,
            rbx: args.rbx,
            ..Default::default()
        },
        port_filter: PortFilter {
            port: args.port,
            size: args.port_width,
        },
        single_step: args.trace,
        ..Default::default()
    };

    match args.image {
        Some(ref path) => {
            config.load_image(path)?;
            log::info!("Image: {} ({} bytes)", path.display(), config.image.len());
        }
        None => log::info!("Image: built-in add-and-print ({} bytes)", config.image.len()),
    }
    log::info!(
        "Memory: {:#x} bytes at {:#x}, slot {}",
        config.mem_size,
        config.guest_addr,
        config.slot
    );

    let stdout = std::io::stdout();
    vmm::run_guest(&config, stdout.lock())?;

    Ok(())
}

#[cfg(not(target_os = "linux"))]
fn run(_args: Args) -> Result<(), Box<dyn std::error::Error>> {
    Err("tinyvmm requires Linux with KVM support. This platform is not supported.".into())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_decimal() {
        assert_eq!(parse_u64("4096"), Ok(4096));
    }

    #[test]
    fn test_parse_hex() {
        assert_eq!(parse_u64("0x1000"), Ok(0x1000));
        assert_eq!(parse_u64("0X3F8"), Ok(0x3f8));
    }

    #[test]
    fn test_parse_garbage() {
        assert!(parse_u64("0xzz").is_err());
        assert!(parse_u64("").is_err());
    }

    #[test]
    fn test_parse_port_range() {
        assert_eq!(parse_u16("0x3f8"), Ok(0x3f8));
        assert!(parse_u16("0x10000").is_err());
    }

    #[test]
    fn test_parse_port_width() {
        assert_eq!(parse_port_width("1"), Ok(1));
        assert_eq!(parse_port_width("2"), Ok(2));
        assert_eq!(parse_port_width("0x4"), Ok(4));
        assert!(parse_port_width("3").is_err());
        assert!(parse_port_width("0").is_err());
        assert!(parse_port_width("8").is_err());
    }

    #[test]
    fn test_args_reject_bad_port_width() {
        assert!(Args::try_parse_from(["tinyvmm", "--port-width", "3"]).is_err());
    }

    #[test]
    fn test_args_defaults() {
        let args = Args::try_parse_from(["tinyvmm"]).unwrap();
        assert_eq!(args.memory, 0x1000);
        assert_eq!(args.guest_addr, 0x1000);
        assert_eq!(args.entry, 0x1000);
        assert_eq!(args.rax, 4);
        assert_eq!(args.rbx, 2);
        assert_eq!(args.port, 0x3f8);
        assert_eq!(args.port_width, 1);
        assert_eq!(args.slot, 0);
        assert!(args.image.is_none());
        assert!(!args.trace);
    }

    #[test]
    fn test_args_overrides() {
        let args = Args::try_parse_from([
            "tinyvmm", "--image", "guest.bin", "--memory", "0x2000", "--rax", "1", "--rbx", "0x7",
            "--port", "0x2f8", "--port-width", "2", "--trace",
        ])
        .unwrap();
        assert_eq!(args.image, Some(PathBuf::from("guest.bin")));
        assert_eq!(args.memory, 0x2000);
        assert_eq!(args.rax, 1);
        assert_eq!(args.rbx, 7);
        assert_eq!(args.port, 0x2f8);
        assert_eq!(args.port_width, 2);
        assert!(args.trace);
    }
}
