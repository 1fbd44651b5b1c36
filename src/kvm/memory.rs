//! Guest physical memory backed by the vm-memory crate.
//!
//! A [`GuestRegion`] is one contiguous block of anonymous host memory that
//! appears in the guest's physical address space at `guest_addr`:
//!
//! ```text
//! Guest Physical            Host Virtual
//! ┌──────────────────┐     ┌──────────────────┐
//! │ guest_addr       │ ──► │ mmap'd, zeroed   │  offset 0: guest image
//! │                  │     │                  │
//! │ guest_addr+size  │     │                  │
//! └──────────────────┘     └──────────────────┘
//! ```
//!
//! The mapping is created with `MAP_PRIVATE | MAP_ANONYMOUS`, so it starts
//! out zero-filled. It is unmapped when the region is dropped.

use super::KvmError;
use vm_memory::{Bytes, GuestAddress, GuestMemory as GuestMemoryTrait, GuestMemoryMmap};

/// A single guest memory slot and the host memory behind it.
#[derive(Debug)]
pub struct GuestRegion {
    /// KVM memory slot number.
    slot: u32,
    /// First guest physical address covered by the region.
    guest_addr: u64,
    /// Size of the region in bytes.
    size: u64,
    /// Host virtual address of the mapping, handed to KVM.
    host_addr: u64,
    /// The underlying vm-memory mapping.
    inner: GuestMemoryMmap,
}

impl GuestRegion {
    /// Allocate a zero-filled region of `size` bytes for guest address `guest_addr`.
    ///
    /// # Errors
    ///
    /// Returns `InvalidRegionSize` for a zero size and `AllocateMemory` if the
    /// host mapping cannot be created.
    pub fn new(slot: u32, guest_addr: u64, size: u64) -> Result<Self, KvmError> {
        if size == 0 {
            return Err(KvmError::InvalidRegionSize { slot });
        }

        let len = usize::try_from(size).map_err(|_| {
            KvmError::AllocateMemory(std::io::Error::other(format!(
                "region size {:#x} does not fit the host address space",
                size
            )))
        })?;

        let inner = GuestMemoryMmap::<()>::from_ranges(&[(GuestAddress(guest_addr), len)])
            .map_err(|e| {
                KvmError::AllocateMemory(std::io::Error::other(format!(
                    "Failed to create guest memory: {}",
                    e
                )))
            })?;

        let host_addr = inner
            .get_host_address(GuestAddress(guest_addr))
            .map_err(|e| {
                KvmError::AllocateMemory(std::io::Error::other(format!(
                    "Failed to resolve host address for {:#x}: {}",
                    guest_addr, e
                )))
            })? as u64;

        Ok(Self {
            slot,
            guest_addr,
            size,
            host_addr,
            inner,
        })
    }

    /// Copy `image` to the start of the region.
    ///
    /// The image must fit entirely; it is never truncated.
    pub fn load_image(&self, image: &[u8]) -> Result<(), KvmError> {
        if image.len() as u64 > self.size {
            return Err(KvmError::ImageTooLarge {
                len: image.len(),
                size: self.size,
            });
        }

        self.write(self.guest_addr, image)
    }

    /// Write bytes at a guest physical address inside the region.
    pub fn write(&self, addr: u64, data: &[u8]) -> Result<(), KvmError> {
        self.inner
            .write_slice(data, GuestAddress(addr))
            .map_err(|e| {
                KvmError::AllocateMemory(std::io::Error::other(format!(
                    "Failed to write to guest memory at {:#x}: {}",
                    addr, e
                )))
            })
    }

    /// Read bytes from a guest physical address inside the region.
    pub fn read(&self, addr: u64, data: &mut [u8]) -> Result<(), KvmError> {
        self.inner
            .read_slice(data, GuestAddress(addr))
            .map_err(|e| {
                KvmError::AllocateMemory(std::io::Error::other(format!(
                    "Failed to read from guest memory at {:#x}: {}",
                    addr, e
                )))
            })
    }

    /// Whether guest physical address `addr` falls inside the region.
    pub fn contains(&self, addr: u64) -> bool {
        addr >= self.guest_addr && addr - self.guest_addr < self.size
    }

    pub fn slot(&self) -> u32 {
        self.slot
    }

    pub fn guest_addr(&self) -> u64 {
        self.guest_addr
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    /// Host virtual address of the first byte, for `KVM_SET_USER_MEMORY_REGION`.
    ///
    /// Only valid while this region is alive.
    pub fn host_addr(&self) -> u64 {
        self.host_addr
    }
}

impl Drop for GuestRegion {
    fn drop(&mut self) {
        log::debug!(
            "Unmapping guest memory slot {} ({:#x} bytes at {:#x})",
            self.slot,
            self.size,
            self.guest_addr
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn read_vec(region: &GuestRegion, addr: u64, len: usize) -> Vec<u8> {
        let mut data = vec![0u8; len];
        region.read(addr, &mut data).unwrap();
        data
    }

    #[test]
    fn test_allocate() {
        let region = GuestRegion::new(0, 0x1000, 0x1000).unwrap();
        assert_eq!(region.slot(), 0);
        assert_eq!(region.guest_addr(), 0x1000);
        assert_eq!(region.size(), 0x1000);
        assert_ne!(region.host_addr(), 0);
    }

    #[test]
    fn test_zero_size_rejected() {
        assert!(matches!(
            GuestRegion::new(3, 0x1000, 0),
            Err(KvmError::InvalidRegionSize { slot: 3 })
        ));
    }

    #[test]
    fn test_starts_zeroed() {
        let region = GuestRegion::new(0, 0x1000, 0x1000).unwrap();
        assert!(read_vec(&region, 0x1000, 0x1000).iter().all(|&b| b == 0));
    }

    #[test]
    fn test_load_image_at_offset_zero() {
        let region = GuestRegion::new(0, 0x1000, 0x1000).unwrap();
        region.load_image(&[0xba, 0xf8, 0x03, 0xf4]).unwrap();
        assert_eq!(read_vec(&region, 0x1000, 5), vec![0xba, 0xf8, 0x03, 0xf4, 0]);
    }

    #[test]
    fn test_load_image_filling_region() {
        let region = GuestRegion::new(0, 0, 16).unwrap();
        region.load_image(&[0xf4; 16]).unwrap();
        assert_eq!(read_vec(&region, 0, 16), vec![0xf4; 16]);
    }

    #[test]
    fn test_image_too_large() {
        let region = GuestRegion::new(0, 0x1000, 4).unwrap();
        let err = region.load_image(&[0x90; 5]).unwrap_err();
        assert!(matches!(err, KvmError::ImageTooLarge { len: 5, size: 4 }));
        // Nothing was written.
        assert_eq!(read_vec(&region, 0x1000, 4), vec![0; 4]);
    }

    #[test]
    fn test_contains() {
        let region = GuestRegion::new(0, 0x1000, 0x1000).unwrap();
        assert!(region.contains(0x1000));
        assert!(region.contains(0x1fff));
        assert!(!region.contains(0x2000));
        assert!(!region.contains(0xfff));
    }

    #[test]
    fn test_write_out_of_bounds() {
        let region = GuestRegion::new(0, 0x1000, 100).unwrap();
        assert!(region.write(0x1000 + 99, &[1, 2]).is_err());
        assert!(region.write(0, &[1]).is_err());
    }
}
