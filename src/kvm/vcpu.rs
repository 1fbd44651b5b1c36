//! Virtual CPU management and execution.
//!
//! A vCPU is the one execution context of the guest. The monitor configures
//! its registers once, then resumes it in a loop:
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │                      VMM (User Space)                   │
//! │  ┌─────────┐         ┌─────────────┐                    │
//! │  │  Loop   │◄────────│ Handle Exit │                    │
//! │  │  Start  │         │ (I/O, HLT)  │                    │
//! │  └────┬────┘         └──────▲──────┘                    │
//! │       │ vcpu.run()          │ VcpuExit (from RunState)  │
//! ├───────┼─────────────────────┼───────────────────────────┤
//! │       ▼      KVM (Kernel)   │                           │
//! │  ┌─────────┐          ┌─────┴─────┐                     │
//! │  │ VMENTER │─────────►│  VMEXIT   │                     │
//! │  └─────────┘  Guest   └───────────┘                     │
//! │               Runs                                      │
//! └─────────────────────────────────────────────────────────┘
//! ```
//!
//! # Initial State
//!
//! A freshly created x86 vCPU starts in real mode at the reset vector with
//! `CS.base = 0xffff0000`. [`VcpuFd::setup_registers`] clears the code
//! segment base and selector so that RIP is a flat address inside the
//! loaded guest image.
//!
//! # Single-Step
//!
//! With single-step enabled, KVM reports the trap that follows a HLT as a
//! debug exit rather than `KVM_EXIT_HLT`, and the vCPU would carry on past
//! the end of the image. Before every resume the vCPU looks at the opcode
//! at RIP; if it is HLT, the next trap is reported as [`VcpuExit::Hlt`].

use std::num::NonZeroUsize;
use std::os::fd::{AsRawFd, BorrowedFd};

use kvm_bindings::{
    kvm_guest_debug, kvm_regs, kvm_sregs, KVM_GUESTDBG_ENABLE, KVM_GUESTDBG_SINGLESTEP,
};
use log::debug;

use super::{KvmError, RunState, VcpuExit, VmFd};
use crate::config::RegisterState;

/// The one-byte `HLT` opcode.
const HLT_OPCODE: u8 = 0xf4;

/// Anything that can be resumed and reports why it stopped.
///
/// The run loop only needs this, which keeps it independent of `/dev/kvm`.
pub trait Vcpu {
    /// Resume the guest and block until it exits back to the monitor.
    fn run(&mut self) -> Result<VcpuExit, KvmError>;
}

/// Wrapper around the KVM vCPU file descriptor and its run state.
///
/// Borrows the [`VmFd`] it was created from, so the VM always outlives it.
pub struct VcpuFd<'vm> {
    /// Shared `kvm_run` mapping. Declared first so it is unmapped before
    /// the descriptor is closed.
    run_state: RunState,
    /// The underlying KVM vCPU file descriptor.
    vcpu: kvm_ioctls::VcpuFd,
    index: u64,
    /// The VM this vCPU belongs to; guest memory is read through it.
    vm: &'vm VmFd,
    /// Present once single-step is enabled.
    step: Option<StepTracker>,
}

/// Turns the single-step trap after a HLT back into a halt.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
struct StepTracker {
    /// The instruction at RIP before the last resume was HLT.
    at_hlt: bool,
}

impl StepTracker {
    /// Record the opcode the vCPU is about to execute.
    fn arm(&mut self, opcode: Option<u8>) {
        self.at_hlt = opcode == Some(HLT_OPCODE);
    }

    fn classify(&self, exit: VcpuExit) -> VcpuExit {
        match exit {
            VcpuExit::Debug { .. } if self.at_hlt => VcpuExit::Hlt,
            exit => exit,
        }
    }
}

/// Opcode at the vCPU's current RIP, if guest memory backs it.
fn opcode_at_rip(vcpu: &kvm_ioctls::VcpuFd, vm: &VmFd) -> Result<Option<u8>, KvmError> {
    let rip = vcpu.get_regs().map_err(KvmError::GetRegisters)?.rip;
    Ok(vm.read_byte(rip))
}

impl<'vm> VcpuFd<'vm> {
    /// Wrap a freshly created vCPU and map its run state.
    pub(super) fn new(
        vm: &'vm VmFd,
        vcpu: kvm_ioctls::VcpuFd,
        index: u64,
        run_state_size: NonZeroUsize,
    ) -> Result<Self, KvmError> {
        // SAFETY: `vcpu` owns the descriptor and outlives the borrow, which
        // only lasts for the mmap call.
        let fd = unsafe { BorrowedFd::borrow_raw(vcpu.as_raw_fd()) };
        let run_state = RunState::map(fd, run_state_size)?;

        Ok(Self {
            run_state,
            vcpu,
            index,
            vm,
            step: None,
        })
    }

    pub fn index(&self) -> u64 {
        self.index
    }

    /// Get the current general-purpose registers.
    pub fn get_regs(&self) -> Result<kvm_regs, KvmError> {
        self.vcpu.get_regs().map_err(KvmError::GetRegisters)
    }

    /// Set the general-purpose registers.
    pub fn set_regs(&self, regs: &kvm_regs) -> Result<(), KvmError> {
        self.vcpu.set_regs(regs).map_err(KvmError::SetRegisters)
    }

    /// Get the special registers.
    pub fn get_sregs(&self) -> Result<kvm_sregs, KvmError> {
        self.vcpu.get_sregs().map_err(KvmError::GetRegisters)
    }

    /// Set the special registers.
    pub fn set_sregs(&self, sregs: &kvm_sregs) -> Result<(), KvmError> {
        self.vcpu.set_sregs(sregs).map_err(KvmError::SetRegisters)
    }

    /// Apply the initial register state.
    ///
    /// Must be called before the first [`run`](Vcpu::run). The code segment
    /// keeps KVM's real-mode defaults except for base and selector, which
    /// are zeroed so that `state.rip` is the linear entry address.
    pub fn setup_registers(&self, state: &RegisterState) -> Result<(), KvmError> {
        let mut sregs = self.get_sregs()?;
        sregs.cs.base = 0;
        sregs.cs.selector = 0;
        self.set_sregs(&sregs)?;

        let regs = kvm_regs {
            rip: state.rip,
            rax: state.rax,
            rbx: state.rbx,
            rcx: state.rcx,
            rdx: state.rdx,
            rsi: state.rsi,
            rdi: state.rdi,
            rsp: state.rsp,
            rbp: state.rbp,
            rflags: state.rflags,
            ..Default::default()
        };
        self.set_regs(&regs)?;

        debug!(
            "vCPU {}: rip={:#x} rax={:#x} rbx={:#x} rflags={:#x}",
            self.index, regs.rip, regs.rax, regs.rbx, regs.rflags
        );
        Ok(())
    }

    /// Trap back to the monitor after every guest instruction.
    ///
    /// Each step then surfaces as [`VcpuExit::Debug`], except the one after
    /// HLT, which surfaces as [`VcpuExit::Hlt`]. Call after
    /// [`setup_registers`](Self::setup_registers).
    pub fn enable_single_step(&mut self) -> Result<(), KvmError> {
        let dbg = kvm_guest_debug {
            control: KVM_GUESTDBG_ENABLE | KVM_GUESTDBG_SINGLESTEP,
            ..Default::default()
        };

        self.vcpu
            .set_guest_debug(&dbg)
            .map_err(KvmError::SetGuestDebug)?;

        let mut step = StepTracker::default();
        step.arm(opcode_at_rip(&self.vcpu, self.vm)?);
        self.step = Some(step);

        debug!("vCPU {}: single-step enabled", self.index);
        Ok(())
    }
}

impl Vcpu for VcpuFd<'_> {
    /// Enter the guest and decode the exit from the run state.
    ///
    /// Internal errors and failed entries are reported as errors; every
    /// other exit reason is handed to the caller.
    fn run(&mut self) -> Result<VcpuExit, KvmError> {
        // The exit kvm-ioctls decodes borrows its own copy of the mapping;
        // ours carries the full I/O description, so it is the one we read.
        self.vcpu.run().map_err(KvmError::Run)?;
        let exit = self.run_state.exit()?;

        let Some(step) = self.step.as_mut() else {
            return Ok(exit);
        };

        let exit = step.classify(exit);
        if exit == VcpuExit::Hlt {
            debug!("vCPU {}: halted while single-stepping", self.index);
        } else {
            step.arm(opcode_at_rip(&self.vcpu, self.vm)?);
        }
        Ok(exit)
    }
}

impl Drop for VcpuFd<'_> {
    fn drop(&mut self) {
        debug!("Closing vCPU {}", self.index);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_step_before_hlt_is_debug() {
        let mut step = StepTracker::default();
        step.arm(Some(0xee));
        assert_eq!(
            step.classify(VcpuExit::Debug { pc: 0x100b }),
            VcpuExit::Debug { pc: 0x100b }
        );
    }

    #[test]
    fn test_step_over_hlt_is_hlt() {
        let mut step = StepTracker::default();
        step.arm(Some(HLT_OPCODE));
        assert_eq!(step.classify(VcpuExit::Debug { pc: 0x100c }), VcpuExit::Hlt);
    }

    #[test]
    fn test_non_debug_exits_pass_through() {
        let mut step = StepTracker::default();
        step.arm(Some(HLT_OPCODE));
        assert_eq!(step.classify(VcpuExit::Hlt), VcpuExit::Hlt);
        assert_eq!(step.classify(VcpuExit::Unknown(6)), VcpuExit::Unknown(6));
    }

    #[test]
    fn test_unbacked_rip_never_halts() {
        let mut step = StepTracker::default();
        step.arm(Some(HLT_OPCODE));
        step.arm(None);
        assert_eq!(
            step.classify(VcpuExit::Debug { pc: 0x3000 }),
            VcpuExit::Debug { pc: 0x3000 }
        );
    }
}
