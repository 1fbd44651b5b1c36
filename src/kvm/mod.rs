//! KVM (Kernel-based Virtual Machine) wrapper module.
//!
//! This module provides a safe Rust interface to the small slice of Linux KVM
//! the monitor needs: one VM, one memory slot, one vCPU and its shared
//! `kvm_run` page.
//!
//! # KVM Architecture
//!
//! The monitor talks to KVM through ioctls on three kinds of descriptors:
//!
//! - `/dev/kvm` - System-level operations (API version, mmap size, create VMs)
//! - VM file descriptor - VM-level operations (create vCPUs, set memory)
//! - vCPU file descriptor - vCPU-level operations (run, get/set registers)
//!
//! ```text
//! User Space (tinyvmm)                Kernel Space (KVM)
//! ┌──────────────┐                   ┌──────────────────┐
//! │  Kvm ────────┼──────────────────►│  /dev/kvm        │
//! │              │    ioctl()        │  ┌────────────┐  │
//! │  VmFd ───────┼──────────────────►│  │ VM State   │  │
//! │              │                   │  └────────────┘  │
//! │  VcpuFd ─────┼──────────────────►│  ┌────────────┐  │
//! │   RunState ◄─┼──── mmap ─────────┼──│ kvm_run    │  │
//! └──────────────┘                   │  └────────────┘  │
//!                                    └──────────────────┘
//! ```
//!
//! Every handle is an owning value. Dropping it releases the underlying
//! descriptor or mapping exactly once, so a failure anywhere during setup
//! unwinds everything acquired before it.
//!
//! # Example Usage
//!
//! ```ignore
//! let kvm = Kvm::open()?;
//! let run_state_size = kvm.run_state_size()?;
//! let mut vm = kvm.create_vm()?;
//! vm.register_memory_region(0, 0x1000, 0x1000, &code)?;
//! let mut vcpu = vm.create_vcpu(0, run_state_size)?;
//! vcpu.setup_registers(&registers)?;
//! loop {
//!     match vcpu.run()? {
//!         VcpuExit::Hlt => break,
//!         _ => {}
//!     }
//! }
//! ```

mod memory;
mod run_state;
mod vcpu;
mod vm;

pub use memory::GuestRegion;
pub use run_state::{IoDirection, IoExit, RunState, VcpuExit};
pub use vcpu::{Vcpu, VcpuFd};
pub use vm::VmFd;

use std::num::NonZeroUsize;

use kvm_bindings::kvm_run;
use log::{debug, info};
use thiserror::Error;

/// The only KVM API version ever shipped by Linux.
const KVM_API_VERSION: i32 = 12;

/// Errors that can occur during KVM operations.
#[derive(Error, Debug)]
pub enum KvmError {
    /// Failed to open /dev/kvm device.
    ///
    /// This usually means:
    /// - The KVM module is not loaded
    /// - Insufficient permissions (user not in kvm group)
    /// - Running in a VM without nested virtualization enabled
    #[error("Failed to open /dev/kvm: {source}{}", open_hint(.source))]
    OpenKvm {
        #[source]
        source: kvm_ioctls::Error,
    },

    /// /dev/kvm speaks an API version we do not understand.
    #[error("Unsupported KVM API version {0} (expected {expected})", expected = KVM_API_VERSION)]
    ApiVersion(i32),

    /// Failed to create a new VM.
    #[error("Failed to create VM: {0}")]
    CreateVm(#[source] kvm_ioctls::Error),

    /// KVM reported an unusable size for the shared `kvm_run` mapping.
    #[error("KVM reported an invalid vCPU run-state size: {0} bytes")]
    InvalidRunStateSize(usize),

    /// Failed to query the run-state size at all.
    #[error("Failed to query vCPU run-state size: {0}")]
    QueryRunStateSize(#[source] kvm_ioctls::Error),

    /// A guest memory region must have a non-zero size.
    #[error("Guest memory region in slot {slot} has zero size")]
    InvalidRegionSize { slot: u32 },

    /// The guest image does not fit into the region it should be loaded into.
    #[error("Guest image is {len} bytes but the memory region is only {size} bytes")]
    ImageTooLarge { len: usize, size: u64 },

    /// Failed to allocate or populate host memory backing guest RAM.
    #[error("Failed to allocate guest memory: {0}")]
    AllocateMemory(#[source] std::io::Error),

    /// Failed to register guest memory with KVM.
    #[error("Failed to set user memory region: {0}")]
    SetMemoryRegion(#[source] kvm_ioctls::Error),

    /// Failed to create a vCPU.
    #[error("Failed to create vCPU: {0}")]
    CreateVcpu(#[source] kvm_ioctls::Error),

    /// Failed to mmap the vCPU's `kvm_run` structure.
    #[error("Failed to map vCPU run state: {0}")]
    MapRunState(#[source] nix::Error),

    /// Failed to get CPU registers.
    #[error("Failed to get registers: {0}")]
    GetRegisters(#[source] kvm_ioctls::Error),

    /// Failed to set CPU registers.
    #[error("Failed to set registers: {0}")]
    SetRegisters(#[source] kvm_ioctls::Error),

    /// Failed to configure guest debugging (single-step).
    #[error("Failed to set guest debug: {0}")]
    SetGuestDebug(#[source] kvm_ioctls::Error),

    /// Failed to run vCPU.
    #[error("Failed to run vCPU: {0}")]
    Run(#[source] kvm_ioctls::Error),

    /// KVM hit an internal error while running the guest.
    #[error("KVM internal error (suberror {suberror})")]
    InternalError { suberror: u32 },

    /// Hardware refused to enter the guest.
    #[error("Failed to enter guest: hardware reason {reason:#x}")]
    FailEntry { reason: u64 },

    /// The I/O data window described by `kvm_run` lies outside the mapping.
    #[error("I/O data at offset {offset:#x} (+{len} bytes) is outside the {size}-byte run state")]
    RunStateOutOfBounds { offset: u64, len: usize, size: usize },
}

fn open_hint(err: &kvm_ioctls::Error) -> &'static str {
    match err.errno() {
        libc::ENOENT => " (is the kvm module loaded?)",
        libc::EACCES | libc::EPERM => " (is the user in the kvm group?)",
        _ => "",
    }
}

/// Handle on the host virtualization facility (`/dev/kvm`).
///
/// Acts as the factory for virtual machines and answers the capability
/// queries the rest of the monitor needs.
pub struct Kvm {
    kvm: kvm_ioctls::Kvm,
}

impl Kvm {
    /// Open `/dev/kvm` and check that it speaks the stable KVM API.
    pub fn open() -> Result<Self, KvmError> {
        let kvm = kvm_ioctls::Kvm::new().map_err(|source| KvmError::OpenKvm { source })?;

        let version = kvm.get_api_version();
        if version != KVM_API_VERSION {
            return Err(KvmError::ApiVersion(version));
        }

        info!("Opened /dev/kvm (API version {})", version);
        Ok(Self { kvm })
    }

    /// Size in bytes of the per-vCPU `kvm_run` mapping.
    ///
    /// KVM places variable-length exit data (e.g. I/O port bytes) after the
    /// `kvm_run` header, so the mapping is usually several pages long. A size
    /// that cannot even hold the header is rejected.
    pub fn run_state_size(&self) -> Result<NonZeroUsize, KvmError> {
        let size = self
            .kvm
            .get_vcpu_mmap_size()
            .map_err(KvmError::QueryRunStateSize)?;

        let size = check_run_state_size(size)?;
        debug!("vCPU run state is {} bytes", size);
        Ok(size)
    }

    /// Create a new, empty virtual machine.
    pub fn create_vm(&self) -> Result<VmFd, KvmError> {
        let vm = self.kvm.create_vm().map_err(KvmError::CreateVm)?;
        info!("Created VM");
        Ok(VmFd::new(vm))
    }
}

/// Accept a reported run-state size only if it can hold a `kvm_run` header.
fn check_run_state_size(size: usize) -> Result<NonZeroUsize, KvmError> {
    if size < std::mem::size_of::<kvm_run>() {
        return Err(KvmError::InvalidRunStateSize(size));
    }
    NonZeroUsize::new(size).ok_or(KvmError::InvalidRunStateSize(size))
}

impl Drop for Kvm {
    fn drop(&mut self) {
        debug!("Closing /dev/kvm");
    }
}

/// Whether `/dev/kvm` can be opened by this process.
///
/// Used by tests that need real hardware virtualization.
#[cfg(test)]
pub fn is_available() -> bool {
    Kvm::open().is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_open_hint_permission() {
        let err = kvm_ioctls::Error::new(libc::EACCES);
        assert!(open_hint(&err).contains("kvm group"));
    }

    #[test]
    fn test_open_hint_missing_device() {
        let err = kvm_ioctls::Error::new(libc::ENOENT);
        assert!(open_hint(&err).contains("module"));
    }

    #[test]
    fn test_open_error_message_includes_hint() {
        let err = KvmError::OpenKvm {
            source: kvm_ioctls::Error::new(libc::EACCES),
        };
        let msg = err.to_string();
        assert!(msg.starts_with("Failed to open /dev/kvm"));
        assert!(msg.contains("kvm group"));
    }

    #[test]
    fn test_api_version_message() {
        let msg = KvmError::ApiVersion(11).to_string();
        assert_eq!(msg, "Unsupported KVM API version 11 (expected 12)");
    }

    #[test]
    fn test_run_state_size_zero_rejected() {
        assert!(matches!(
            check_run_state_size(0),
            Err(KvmError::InvalidRunStateSize(0))
        ));
    }

    #[test]
    fn test_run_state_size_smaller_than_header_rejected() {
        let short = std::mem::size_of::<kvm_run>() - 1;
        assert!(matches!(
            check_run_state_size(short),
            Err(KvmError::InvalidRunStateSize(n)) if n == short
        ));
    }

    #[test]
    fn test_run_state_size_accepted() {
        let size = check_run_state_size(3 * 4096).unwrap();
        assert_eq!(size.get(), 3 * 4096);

        let exact = std::mem::size_of::<kvm_run>();
        assert_eq!(check_run_state_size(exact).unwrap().get(), exact);
    }

    #[test]
    fn test_run_state_size_holds_kvm_run() {
        if !is_available() {
            return;
        }
        let kvm = Kvm::open().unwrap();
        let size = kvm.run_state_size().unwrap();
        assert!(size.get() >= std::mem::size_of::<kvm_run>());
    }
}
