//! Machine assembly: turns a [`VmConfig`] into a running guest.
//!
//! Resources are acquired in dependency order and held as locals, so they
//! are released in reverse order exactly once, whether the guest halts,
//! faults, or setup fails halfway:
//!
//! ```text
//! Kvm ──► VmFd ──► GuestRegion (image loaded) ──► VcpuFd + RunState ──► RunLoop
//!  ▲        ▲            ▲                              ▲
//!  └────────┴────────────┴──── dropped in reverse ──────┘
//! ```

use std::io::Write;

use log::{debug, error, info};
use thiserror::Error;

use crate::config::{ConfigError, VmConfig};
use crate::kvm::{Kvm, KvmError, VcpuFd, VmFd};
use crate::runloop::{RunError, RunLoop, RunSummary};

/// Any failure while setting up or running a guest.
#[derive(Error, Debug)]
pub enum VmmError {
    #[error("Invalid configuration: {0}")]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Kvm(#[from] KvmError),

    #[error("Guest faulted: {0}")]
    Run(#[from] RunError),
}

/// Build a VM from `config`, run it to completion and forward its output to `sink`.
pub fn run_guest<W: Write>(config: &VmConfig, sink: W) -> Result<RunSummary, VmmError> {
    config.validate()?;

    let kvm = Kvm::open()?;
    let run_state_size = kvm.run_state_size()?;

    let mut vm = kvm.create_vm()?;
    vm.register_memory_region(
        config.slot,
        config.guest_addr,
        config.mem_size,
        &config.image,
    )?;

    let mut vcpu = vm.create_vcpu(0, run_state_size)?;
    vcpu.setup_registers(&config.registers)?;
    if config.single_step {
        vcpu.enable_single_step()?;
    }

    info!(
        "Starting vCPU at {:#x} ({} byte image)",
        config.registers.rip,
        config.image.len()
    );

    let mut run_loop = RunLoop::new(&mut vcpu, config.port_filter, sink);
    let result = run_loop.run();
    let summary = run_loop.summary();
    debug!("Run loop finished: {:?}", run_loop.state());
    drop(run_loop);

    match result {
        Ok(summary) => Ok(summary),
        Err(e) => {
            error!(
                "Guest faulted after {} exits, {} bytes of output: {}",
                summary.exits, summary.bytes_written, e
            );
            dump_state(&vm, &vcpu);
            Err(e.into())
        }
    }
}

/// Log the final registers of a faulted vCPU and the code it stopped at.
fn dump_state(vm: &VmFd, vcpu: &VcpuFd<'_>) {
    let regs = match vcpu.get_regs() {
        Ok(regs) => regs,
        Err(e) => {
            error!("Could not read final registers of vCPU {}: {}", vcpu.index(), e);
            return;
        }
    };

    error!(
        "vCPU {} final registers: rip={:#x} rax={:#x} rbx={:#x} rdx={:#x} rflags={:#x}",
        vcpu.index(),
        regs.rip,
        regs.rax,
        regs.rbx,
        regs.rdx,
        regs.rflags
    );

    let Some(region) = vm.region_at(regs.rip) else {
        error!("rip {:#x} is outside guest memory", regs.rip);
        return;
    };

    let end = region.guest_addr() + region.size();
    let mut code = vec![0u8; (end - regs.rip).min(8) as usize];
    if region.read(regs.rip, &mut code).is_ok() {
        error!("Code at rip (slot {}): {:02x?}", region.slot(), code);
    }
}
