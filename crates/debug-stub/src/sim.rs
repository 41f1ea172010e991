//! Byte-at-a-time executor for driving the stub without real hardware.
//!
//! Every byte is one instruction: `0xCC` traps, `0xF4` ends the program and
//! anything else just advances `rip`. The trap flag is honoured, so
//! single-stepping works as it does on the processor, and an interrupt
//! request stops the thread before its next instruction.

use std::sync::Arc;

use rsp_proto::reply::{SIGINT, SIGTRAP};
use sandbox_port::LockKind;
use tracing::debug;

use crate::abi::Registers;
use crate::breakpoints::TRAP_OPCODE;
use crate::halt::{HaltChannel, Resume};
use crate::target::Target;

const HALT_OPCODE: u8 = sandbox::HALT_OPCODE;

/// Reported when `rip` leaves sandbox memory.
pub const SIGSEGV: u8 = 11;

/// How a run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    Exited(u8),
    Killed,
}

pub struct LinearExecutor<L: LockKind> {
    target: Arc<dyn Target>,
    halts: Arc<HaltChannel<L>>,
}

impl<L: LockKind> LinearExecutor<L> {
    pub fn new(target: Arc<dyn Target>, halts: Arc<HaltChannel<L>>) -> Self {
        Self { target, halts }
    }

    fn trap(&self, regs: &Registers, signal: u8) -> Option<Registers> {
        match self.halts.trap(regs, signal) {
            Resume::Continue(next) => Some(next),
            Resume::Kill => None,
        }
    }

    /// Run from `entry`, halting there first so a debugger can attach.
    pub fn run(&self, entry: Registers) -> RunOutcome {
        let Some(mut regs) = self.trap(&entry, SIGTRAP) else {
            return RunOutcome::Killed;
        };
        loop {
            if self.halts.take_interrupt() {
                match self.trap(&regs, SIGINT) {
                    Some(next) => regs = next,
                    None => return RunOutcome::Killed,
                }
            }
            let pc = regs.rip();
            let op = match self.target.read_memory(pc, 1) {
                Ok(bytes) => bytes.first().copied().unwrap_or(HALT_OPCODE),
                Err(_) => {
                    debug!(pc = format_args!("{pc:#x}"), "instruction fetch fault");
                    match self.trap(&regs, SIGSEGV) {
                        Some(next) => {
                            regs = next;
                            continue;
                        }
                        None => return RunOutcome::Killed,
                    }
                }
            };

            match op {
                HALT_OPCODE => {
                    self.halts.exit(0);
                    return RunOutcome::Exited(0);
                }
                TRAP_OPCODE => {
                    regs.set_rip(pc.wrapping_add(1));
                    match self.trap(&regs, SIGTRAP) {
                        Some(next) => regs = next,
                        None => return RunOutcome::Killed,
                    }
                }
                _ => {
                    regs.set_rip(pc.wrapping_add(1));
                    if regs.trap_flag() {
                        match self.trap(&regs, SIGTRAP) {
                            Some(next) => regs = next,
                            None => return RunOutcome::Killed,
                        }
                    }
                }
            }
        }
    }
}
