//! The vCPU run loop.
//!
//! Resumes a configured vCPU until the guest halts or does something the
//! monitor does not support:
//!
//! ```text
//!            run()
//! Configured ─────► Running ──┬── Hlt ─────────────────────► Halted
//!                     ▲  │    ├── OUT 1 byte to the port ──┐
//!                     │  │    │   (byte → sink)            │
//!                     └──┼────┴── Debug (single-step) ◄────┘
//!                        │
//!                        └── other I/O, unknown exit, error ─► Faulted
//! ```
//!
//! `Halted` and `Faulted` are terminal: once reached, the vCPU is never
//! resumed again.

use std::io::Write;

use log::{debug, info, trace};
use thiserror::Error;

use crate::config::PortFilter;
use crate::kvm::{IoDirection, IoExit, KvmError, Vcpu, VcpuExit};

/// Errors that end a run.
#[derive(Error, Debug)]
pub enum RunError {
    /// The vCPU could not be resumed.
    #[error(transparent)]
    Kvm(#[from] KvmError),

    /// The guest touched an I/O port in a way the monitor does not emulate.
    #[error(
        "Unrecognized I/O exit: {direction:?} port={port:#x} size={size} count={count}"
    )]
    UnrecognizedIo {
        direction: IoDirection,
        port: u16,
        size: u8,
        count: u32,
    },

    /// The guest stopped for a reason the monitor does not handle.
    #[error("Unhandled exit reason {0}")]
    UnhandledExit(u32),

    /// The output sink refused a byte.
    #[error("Failed to write guest output: {0}")]
    Output(#[source] std::io::Error),

    /// `run` was called after the loop already reached a terminal state.
    #[error("Run loop already finished ({0:?})")]
    AlreadyTerminated(LoopState),
}

/// Where the run loop is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopState {
    /// Registers set, not yet resumed.
    Configured,
    /// Inside the loop.
    Running,
    /// Guest executed HLT. Terminal.
    Halted,
    /// Run ended with an error. Terminal.
    Faulted,
}

impl LoopState {
    pub fn is_terminal(self) -> bool {
        matches!(self, LoopState::Halted | LoopState::Faulted)
    }
}

/// Counters reported after a successful run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunSummary {
    /// Number of times the vCPU returned to the monitor, including the halt.
    pub exits: u64,
    /// Bytes forwarded to the output sink.
    pub bytes_written: u64,
    /// Single-step traps observed.
    pub debug_steps: u64,
}

/// Drives one vCPU to a terminal state, forwarding guest output to `sink`.
pub struct RunLoop<'a, V: Vcpu, W: Write> {
    vcpu: &'a mut V,
    filter: PortFilter,
    sink: W,
    state: LoopState,
    summary: RunSummary,
}

impl<'a, V: Vcpu, W: Write> RunLoop<'a, V, W> {
    pub fn new(vcpu: &'a mut V, filter: PortFilter, sink: W) -> Self {
        Self {
            vcpu,
            filter,
            sink,
            state: LoopState::Configured,
            summary: RunSummary::default(),
        }
    }

    pub fn state(&self) -> LoopState {
        self.state
    }

    /// Counters so far; complete once the loop is terminal.
    pub fn summary(&self) -> RunSummary {
        self.summary
    }

    /// Run until the guest halts (`Ok`) or faults (`Err`).
    ///
    /// There is no iteration bound; a guest that never exits blocks here.
    pub fn run(&mut self) -> Result<RunSummary, RunError> {
        if self.state.is_terminal() {
            return Err(RunError::AlreadyTerminated(self.state));
        }

        self.state = LoopState::Running;
        match self.drive() {
            Ok(()) => {
                self.state = LoopState::Halted;
                info!(
                    "Guest halted after {} exits, {} bytes of output",
                    self.summary.exits, self.summary.bytes_written
                );
                Ok(self.summary)
            }
            Err(e) => {
                self.state = LoopState::Faulted;
                Err(e)
            }
        }
    }

    fn drive(&mut self) -> Result<(), RunError> {
        loop {
            let exit = self.vcpu.run()?;
            self.summary.exits += 1;

            match exit {
                VcpuExit::Hlt => return Ok(()),
                VcpuExit::Io(io) => self.handle_io(io)?,
                VcpuExit::Debug { pc } => {
                    self.summary.debug_steps += 1;
                    trace!("step {}: pc={:#x}", self.summary.debug_steps, pc);
                }
                VcpuExit::Unknown(reason) => return Err(RunError::UnhandledExit(reason)),
            }
        }
    }

    /// Forward one OUT of the filtered width on the filtered port; anything else is fatal.
    fn handle_io(&mut self, io: IoExit) -> Result<(), RunError> {
        let accepted = io.direction == IoDirection::Out
            && io.size == self.filter.size
            && io.port == self.filter.port
            && io.count == 1;

        if !accepted {
            return Err(RunError::UnrecognizedIo {
                direction: io.direction,
                port: io.port,
                size: io.size,
                count: io.count,
            });
        }

        debug!("[I/O] OUT port={:#x} <- {:?}", io.port, io.data);
        self.sink.write_all(&io.data).map_err(RunError::Output)?;
        self.sink.flush().map_err(RunError::Output)?;
        self.summary.bytes_written += io.data.len() as u64;
        Ok(())
    }
}
