//! The shared `kvm_run` page of a vCPU and the exits decoded from it.
//!
//! After every `KVM_RUN` the kernel describes why the guest stopped in a
//! `struct kvm_run` at the start of a mapping of the vCPU file descriptor.
//! For I/O exits the transferred bytes live in the same mapping, at
//! `io.data_offset` from its start (usually the second page):
//!
//! ```text
//! 0x0000 ┌──────────────────────────┐
//!        │ struct kvm_run           │  exit_reason, io { direction, size,
//!        │                          │  port, count, data_offset }, ...
//! 0x1000 ├──────────────────────────┤
//!        │ PIO data                 │  size * count bytes
//!        └──────────────────────────┘
//! ```
//!
//! [`RunState`] owns that mapping and turns it into a [`VcpuExit`] once per
//! resume, so nothing above this module reads raw offsets.

use std::num::NonZeroUsize;
use std::os::fd::AsFd;
use std::ptr::NonNull;

use kvm_bindings::{
    kvm_run, KVM_EXIT_DEBUG, KVM_EXIT_FAIL_ENTRY, KVM_EXIT_HLT, KVM_EXIT_INTERNAL_ERROR,
    KVM_EXIT_IO, KVM_EXIT_IO_IN, KVM_EXIT_IO_OUT,
};
use nix::sys::mman::{self, MapFlags, ProtFlags};

use super::KvmError;

/// Direction of a port I/O access, from the guest's point of view.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoDirection {
    /// `IN`: the guest reads from the port.
    In,
    /// `OUT`: the guest writes to the port.
    Out,
    /// A direction byte KVM should never report; kept so it can be refused.
    Other(u8),
}

/// A port I/O exit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IoExit {
    pub direction: IoDirection,
    pub port: u16,
    /// Width of a single access in bytes (1, 2 or 4).
    pub size: u8,
    /// Number of accesses (greater than 1 for `REP INS`/`REP OUTS`).
    pub count: u32,
    /// `size * count` bytes copied out of the run state.
    pub data: Vec<u8>,
}

/// Why the vCPU returned to the monitor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VcpuExit {
    /// Guest executed HLT.
    Hlt,

    /// Guest executed an IN/OUT instruction.
    Io(IoExit),

    /// A single-step debug trap; `pc` is the next guest instruction.
    Debug { pc: u64 },

    /// Any other exit reason, carrying the raw `KVM_EXIT_*` value.
    Unknown(u32),
}

/// Owned `MAP_SHARED` mapping of a vCPU's `kvm_run` structure.
pub struct RunState {
    ptr: NonNull<u8>,
    size: NonZeroUsize,
}

impl RunState {
    /// Map `size` bytes of the vCPU descriptor `fd`.
    ///
    /// `size` must come from [`Kvm::run_state_size`](super::Kvm::run_state_size).
    pub fn map<F: AsFd>(fd: F, size: NonZeroUsize) -> Result<Self, KvmError> {
        // SAFETY: a fresh shared mapping of a vCPU fd at offset 0; nothing
        // else aliases it mutably from our side.
        let ptr = unsafe {
            mman::mmap(
                None,
                size,
                ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
                MapFlags::MAP_SHARED,
                fd,
                0,
            )
        }
        .map_err(KvmError::MapRunState)?;

        log::debug!("Mapped vCPU run state ({} bytes)", size);
        Ok(Self {
            ptr: ptr.cast(),
            size,
        })
    }

    /// Decode the exit the kernel left in the mapping after the last `KVM_RUN`.
    pub fn exit(&self) -> Result<VcpuExit, KvmError> {
        decode(self.as_slice())
    }

    fn as_slice(&self) -> &[u8] {
        // SAFETY: the mapping is `size` bytes long and lives as long as `self`.
        // The kernel only writes to it while KVM_RUN is in progress, which
        // cannot overlap with this borrow on a single thread.
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.size.get()) }
    }
}

impl Drop for RunState {
    fn drop(&mut self) {
        // SAFETY: `ptr`/`size` describe exactly the mapping made in `map`.
        if let Err(e) = unsafe { mman::munmap(self.ptr.cast(), self.size.get()) } {
            log::error!("Failed to unmap vCPU run state: {}", e);
        } else {
            log::debug!("Unmapped vCPU run state");
        }
    }
}

/// Decode a `kvm_run` image (header plus trailing data pages).
pub(crate) fn decode(raw: &[u8]) -> Result<VcpuExit, KvmError> {
    if raw.len() < std::mem::size_of::<kvm_run>() {
        return Err(KvmError::InvalidRunStateSize(raw.len()));
    }

    // SAFETY: `raw` holds at least one `kvm_run`, which is plain old data.
    let run: kvm_run = unsafe { std::ptr::read_unaligned(raw.as_ptr().cast()) };

    match run.exit_reason {
        KVM_EXIT_HLT => Ok(VcpuExit::Hlt),

        KVM_EXIT_IO => {
            // SAFETY: `io` is the active union member for KVM_EXIT_IO.
            let io = unsafe { run.__bindgen_anon_1.io };

            let direction = match u32::from(io.direction) {
                KVM_EXIT_IO_OUT => IoDirection::Out,
                KVM_EXIT_IO_IN => IoDirection::In,
                _ => {
                    return Ok(VcpuExit::Io(IoExit {
                        direction: IoDirection::Other(io.direction),
                        port: io.port,
                        size: io.size,
                        count: io.count,
                        data: Vec::new(),
                    }))
                }
            };

            let len = usize::from(io.size) * io.count as usize;
            let data = usize::try_from(io.data_offset)
                .ok()
                .and_then(|start| raw.get(start..start.checked_add(len)?))
                .ok_or(KvmError::RunStateOutOfBounds {
                    offset: io.data_offset,
                    len,
                    size: raw.len(),
                })?;

            Ok(VcpuExit::Io(IoExit {
                direction,
                port: io.port,
                size: io.size,
                count: io.count,
                data: data.to_vec(),
            }))
        }

        KVM_EXIT_DEBUG => {
            // SAFETY: `debug` is the active union member for KVM_EXIT_DEBUG.
            let pc = unsafe { run.__bindgen_anon_1.debug.arch.pc };
            Ok(VcpuExit::Debug { pc })
        }

        KVM_EXIT_INTERNAL_ERROR => {
            // SAFETY: `internal` is the active union member.
            let suberror = unsafe { run.__bindgen_anon_1.internal.suberror };
            Err(KvmError::InternalError { suberror })
        }

        KVM_EXIT_FAIL_ENTRY => {
            // SAFETY: `fail_entry` is the active union member.
            let reason = unsafe { run.__bindgen_anon_1.fail_entry.hardware_entry_failure_reason };
            Err(KvmError::FailEntry { reason })
        }

        reason => Ok(VcpuExit::Unknown(reason)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kvm_bindings::KVM_EXIT_SHUTDOWN;

    const PAGE: usize = 0x1000;

    /// Build a three-page run-state image around `run`.
    fn image(run: &kvm_run) -> Vec<u8> {
        let mut raw = vec![0u8; 3 * PAGE];
        // SAFETY: viewing a POD struct as bytes.
        let bytes = unsafe {
            std::slice::from_raw_parts(
                (run as *const kvm_run).cast::<u8>(),
                std::mem::size_of::<kvm_run>(),
            )
        };
        raw[..bytes.len()].copy_from_slice(bytes);
        raw
    }

    fn io_run(direction: u32, port: u16, size: u8, count: u32, data_offset: u64) -> kvm_run {
        // SAFETY: kvm_run is POD; all-zero is a valid value.
        let mut run: kvm_run = unsafe { std::mem::zeroed() };
        run.exit_reason = KVM_EXIT_IO;
        run.__bindgen_anon_1.io.direction = direction as u8;
        run.__bindgen_anon_1.io.port = port;
        run.__bindgen_anon_1.io.size = size;
        run.__bindgen_anon_1.io.count = count;
        run.__bindgen_anon_1.io.data_offset = data_offset;
        run
    }

    #[test]
    fn test_decode_hlt() {
        let mut run: kvm_run = unsafe { std::mem::zeroed() };
        run.exit_reason = KVM_EXIT_HLT;
        assert_eq!(decode(&image(&run)).unwrap(), VcpuExit::Hlt);
    }

    #[test]
    fn test_decode_io_out_byte() {
        let run = io_run(KVM_EXIT_IO_OUT, 0x3f8, 1, 1, PAGE as u64);
        let mut raw = image(&run);
        raw[PAGE] = b'6';

        let exit = decode(&raw).unwrap();
        assert_eq!(
            exit,
            VcpuExit::Io(IoExit {
                direction: IoDirection::Out,
                port: 0x3f8,
                size: 1,
                count: 1,
                data: vec![b'6'],
            })
        );
    }

    #[test]
    fn test_decode_io_in_rep() {
        let run = io_run(KVM_EXIT_IO_IN, 0x60, 2, 3, PAGE as u64);
        let exit = decode(&image(&run)).unwrap();
        match exit {
            VcpuExit::Io(io) => {
                assert_eq!(io.direction, IoDirection::In);
                assert_eq!(io.port, 0x60);
                assert_eq!(io.data.len(), 6);
            }
            other => panic!("expected I/O exit, got {:?}", other),
        }
    }

    #[test]
    fn test_decode_io_bad_direction() {
        let run = io_run(7, 0x3f8, 1, 1, PAGE as u64);
        match decode(&image(&run)).unwrap() {
            VcpuExit::Io(io) => {
                assert_eq!(io.direction, IoDirection::Other(7));
                assert_eq!(io.port, 0x3f8);
                assert!(io.data.is_empty());
            }
            other => panic!("expected I/O exit, got {:?}", other),
        }
    }

    #[test]
    fn test_decode_io_data_out_of_bounds() {
        let run = io_run(KVM_EXIT_IO_OUT, 0x3f8, 4, 2, (3 * PAGE - 4) as u64);
        assert!(matches!(
            decode(&image(&run)),
            Err(KvmError::RunStateOutOfBounds { len: 8, .. })
        ));
    }

    #[test]
    fn test_decode_debug_pc() {
        let mut run: kvm_run = unsafe { std::mem::zeroed() };
        run.exit_reason = KVM_EXIT_DEBUG;
        run.__bindgen_anon_1.debug.arch.pc = 0x1003;
        assert_eq!(decode(&image(&run)).unwrap(), VcpuExit::Debug { pc: 0x1003 });
    }

    #[test]
    fn test_decode_internal_error() {
        let mut run: kvm_run = unsafe { std::mem::zeroed() };
        run.exit_reason = KVM_EXIT_INTERNAL_ERROR;
        run.__bindgen_anon_1.internal.suberror = 1;
        assert!(matches!(
            decode(&image(&run)),
            Err(KvmError::InternalError { suberror: 1 })
        ));
    }

    #[test]
    fn test_decode_fail_entry() {
        let mut run: kvm_run = unsafe { std::mem::zeroed() };
        run.exit_reason = KVM_EXIT_FAIL_ENTRY;
        run.__bindgen_anon_1.fail_entry.hardware_entry_failure_reason = 0x21;
        assert!(matches!(
            decode(&image(&run)),
            Err(KvmError::FailEntry { reason: 0x21 })
        ));
    }

    #[test]
    fn test_decode_unknown_reason() {
        let mut run: kvm_run = unsafe { std::mem::zeroed() };
        run.exit_reason = KVM_EXIT_SHUTDOWN;
        assert_eq!(
            decode(&image(&run)).unwrap(),
            VcpuExit::Unknown(KVM_EXIT_SHUTDOWN)
        );
    }

    #[test]
    fn test_decode_short_buffer() {
        assert!(matches!(
            decode(&[0u8; 8]),
            Err(KvmError::InvalidRunStateSize(8))
        ));
    }
}
