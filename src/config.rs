//! Monitor configuration.
//!
//! Every value the monitor needs is a named field with a default matching
//! the built-in `ADD_AND_PRINT` guest: 4 KiB of memory at guest physical
//! `0x1000`, entry at `0x1000`, `RAX = 4`, `RBX = 2`, output on COM1
//! (`0x3f8`).

use std::path::PathBuf;

use thiserror::Error;

use crate::guest;

/// Default guest memory layout.
pub mod defaults {
    /// Memory slot of the only region.
    pub const SLOT: u32 = 0;

    /// Guest physical address of the region (and of the image).
    pub const GUEST_ADDR: u64 = 0x1000;

    /// Size of the region: one page.
    pub const MEM_SIZE: u64 = 0x1000;

    /// Entry instruction pointer: start of the image.
    pub const ENTRY: u64 = GUEST_ADDR;

    /// RFLAGS with only the reserved bit 1 set (interrupts disabled).
    pub const RFLAGS: u64 = 0x2;

    /// COM1 data port.
    pub const OUTPUT_PORT: u16 = 0x3f8;
}

/// Errors in a configuration that are caught before touching `/dev/kvm`.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Guest memory size must be non-zero")]
    ZeroMemory,

    #[error("Guest image is {len} bytes but guest memory is only {size} bytes")]
    ImageTooLarge { len: usize, size: u64 },

    #[error("Guest memory {addr:#x}+{size:#x} overflows the physical address space")]
    RegionOverflow { addr: u64, size: u64 },

    #[error("Entry point {entry:#x} is outside guest memory {start:#x}..{end:#x}")]
    EntryOutsideMemory { entry: u64, start: u64, end: u64 },

    #[error("Failed to read guest image {}: {source}", .path.display())]
    ReadImage {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Initial general-purpose register values of the vCPU.
///
/// Registers not listed here start at zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegisterState {
    pub rip: u64,
    pub rax: u64,
    pub rbx: u64,
    pub rcx: u64,
    pub rdx: u64,
    pub rsi: u64,
    pub rdi: u64,
    pub rsp: u64,
    pub rbp: u64,
    pub rflags: u64,
}

impl Default for RegisterState {
    fn default() -> Self {
        Self {
            rip: defaults::ENTRY,
            rax: 4,
            rbx: 2,
            rcx: 0,
            rdx: 0,
            rsi: 0,
            rdi: 0,
            rsp: 0,
            rbp: 0,
            rflags: defaults::RFLAGS,
        }
    }
}

/// The single I/O port exit forwarded to the output sink.
///
/// Only `OUT` accesses of exactly `size` bytes, one at a time, to `port`
/// are accepted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortFilter {
    pub port: u16,
    pub size: u8,
}

impl Default for PortFilter {
    fn default() -> Self {
        Self {
            port: defaults::OUTPUT_PORT,
            size: 1,
        }
    }
}

/// Complete description of one guest run.
#[derive(Debug, Clone)]
pub struct VmConfig {
    /// Flat machine code loaded at offset 0 of guest memory.
    pub image: Vec<u8>,
    pub slot: u32,
    pub guest_addr: u64,
    pub mem_size: u64,
    pub registers: RegisterState,
    pub port_filter: PortFilter,
    /// Trap after every instruction and log the guest PC.
    pub single_step: bool,
}

impl Default for VmConfig {
    fn default() -> Self {
        Self {
            image: guest::ADD_AND_PRINT.to_vec(),
            slot: defaults::SLOT,
            guest_addr: defaults::GUEST_ADDR,
            mem_size: defaults::MEM_SIZE,
            registers: RegisterState::default(),
            port_filter: PortFilter::default(),
            single_step: false,
        }
    }
}

impl VmConfig {
    /// Replace the built-in image with the contents of `path`.
    pub fn load_image(&mut self, path: &std::path::Path) -> Result<(), ConfigError> {
        self.image = std::fs::read(path).map_err(|source| ConfigError::ReadImage {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(())
    }

    /// Check the configuration for mistakes that need no host facility to detect.
    ///
    /// Slot and address collisions are left to KVM.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.mem_size == 0 {
            return Err(ConfigError::ZeroMemory);
        }

        if self.image.len() as u64 > self.mem_size {
            return Err(ConfigError::ImageTooLarge {
                len: self.image.len(),
                size: self.mem_size,
            });
        }

        let end = self
            .guest_addr
            .checked_add(self.mem_size)
            .ok_or(ConfigError::RegionOverflow {
                addr: self.guest_addr,
                size: self.mem_size,
            })?;

        let entry = self.registers.rip;
        if entry < self.guest_addr || entry >= end {
            return Err(ConfigError::EntryOutsideMemory {
                entry,
                start: self.guest_addr,
                end,
            });
        }

        Ok(())
    }
}
