//! Virtual machine creation and memory management.
//!
//! A [`VmFd`] owns the guest memory it registers and hands out vCPUs that
//! borrow it. Guest memory is managed through KVM "memory slots"; each slot
//! maps a range of guest physical addresses onto a host mapping:
//!
//! ```text
//! Guest Physical          Host Virtual
//! ┌──────────────┐       ┌──────────────┐
//! │ 0x1000       │ ────► │ mmap'd region│
//! │   (code)     │       │              │
//! │ 0x1fff       │       │              │
//! └──────────────┘       └──────────────┘
//! ```
//!
//! Slot and address collisions are not checked here; KVM rejects them and
//! the error is reported as `SetMemoryRegion`.

use std::num::NonZeroUsize;

use kvm_bindings::kvm_userspace_memory_region;
use log::info;

use super::{GuestRegion, KvmError, VcpuFd};

/// Wrapper around the KVM VM file descriptor.
pub struct VmFd {
    /// The underlying KVM VM file descriptor. Declared before `regions` so
    /// the VM is torn down before its memory is unmapped.
    vm: kvm_ioctls::VmFd,

    /// Guest memory registered with this VM.
    regions: Vec<GuestRegion>,
}

impl VmFd {
    pub(super) fn new(vm: kvm_ioctls::VmFd) -> Self {
        Self {
            vm,
            regions: Vec::new(),
        }
    }

    /// Allocate guest memory, load `image` at its start and register it.
    ///
    /// The image must fit in `size` bytes; this is checked before anything is
    /// allocated or passed to KVM.
    ///
    /// # Arguments
    ///
    /// * `slot` - Memory slot number (0 for the first region)
    /// * `guest_addr` - Starting guest physical address
    /// * `size` - Size of the region in bytes
    /// * `image` - Bytes copied to offset 0 of the region
    pub fn register_memory_region(
        &mut self,
        slot: u32,
        guest_addr: u64,
        size: u64,
        image: &[u8],
    ) -> Result<&GuestRegion, KvmError> {
        if image.len() as u64 > size {
            return Err(KvmError::ImageTooLarge {
                len: image.len(),
                size,
            });
        }

        let region = GuestRegion::new(slot, guest_addr, size)?;
        region.load_image(image)?;

        let mem_region = kvm_userspace_memory_region {
            slot,
            guest_phys_addr: guest_addr,
            memory_size: size,
            userspace_addr: region.host_addr(),
            flags: 0,
        };

        // SAFETY: the host mapping is owned by `region`, which is stored in
        // `self.regions` below and therefore lives as long as the VM fd.
        unsafe {
            self.vm
                .set_user_memory_region(mem_region)
                .map_err(KvmError::SetMemoryRegion)?;
        }

        info!(
            "Registered slot {}: {:#x} bytes at guest {:#x} ({} image bytes)",
            slot,
            size,
            guest_addr,
            image.len()
        );

        self.regions.push(region);
        Ok(&self.regions[self.regions.len() - 1])
    }

    /// Guest memory registered so far.
    pub fn regions(&self) -> &[GuestRegion] {
        &self.regions
    }

    /// The region that backs guest physical address `addr`, if any.
    pub fn region_at(&self, addr: u64) -> Option<&GuestRegion> {
        self.regions.iter().find(|r| r.contains(addr))
    }

    /// Read one guest byte, or `None` if `addr` is not backed by memory.
    pub fn read_byte(&self, addr: u64) -> Option<u8> {
        let mut byte = [0u8; 1];
        self.region_at(addr)?.read(addr, &mut byte).ok()?;
        Some(byte[0])
    }

    /// Create a vCPU and map its run state.
    ///
    /// # Arguments
    ///
    /// * `index` - vCPU ID (0 for the boot CPU)
    /// * `run_state_size` - Size from [`Kvm::run_state_size`](super::Kvm::run_state_size)
    pub fn create_vcpu(
        &self,
        index: u64,
        run_state_size: NonZeroUsize,
    ) -> Result<VcpuFd<'_>, KvmError> {
        let vcpu = self.vm.create_vcpu(index).map_err(KvmError::CreateVcpu)?;
        let vcpu = VcpuFd::new(self, vcpu, index, run_state_size)?;
        info!("Created vCPU {}", index);
        Ok(vcpu)
    }
}

impl Drop for VmFd {
    fn drop(&mut self) {
        log::debug!("Closing VM ({} memory regions)", self.regions.len());
    }
}
