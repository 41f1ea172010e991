//! Halt rendezvous between the sandboxed thread and the stub.
//!
//! The sandboxed thread reports a stop with [`HaltChannel::trap`] and stays
//! blocked there until the stub calls [`HaltChannel::resume`]. Waiting is
//! done by polling the shared state under the port lock.
//!
//! The stub asks a running thread to stop with
//! [`HaltChannel::request_interrupt`]; the thread checks
//! [`HaltChannel::take_interrupt`] between instructions.

use std::time::Duration;

use sandbox_port::time::poll_until;
use sandbox_port::{Blocking, Deadline, LockKind, PortMutex};
use tracing::debug;

use crate::abi::{RegisterSnapshot, Registers};

const POLL_INTERVAL: Duration = Duration::from_millis(1);

/// A stopped sandboxed thread.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Halt {
    pub registers: RegisterSnapshot,
    pub signal: u8,
}

/// What the stub observes while waiting.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StopEvent {
    Halted(Halt),
    Exited(u8),
}

/// How the stub releases a halted thread.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resume {
    /// Continue with these registers. A set trap flag makes the thread stop
    /// again after one instruction.
    Continue(Registers),
    /// Terminate the thread.
    Kill,
}

#[derive(Default)]
struct Shared {
    halted: Option<Halt>,
    resume: Option<Resume>,
    exited: Option<u8>,
    interrupt: bool,
}

pub struct HaltChannel<L: LockKind = Blocking> {
    shared: L::Mutex<Shared>,
}

impl<L: LockKind> Default for HaltChannel<L> {
    fn default() -> Self {
        Self::new()
    }
}

impl<L: LockKind> HaltChannel<L> {
    pub fn new() -> Self {
        Self {
            shared: PortMutex::new(Shared::default()),
        }
    }

    /// Called on the sandboxed thread: publish the stop and block until the
    /// stub resumes it.
    pub fn trap(&self, registers: &Registers, signal: u8) -> Resume {
        {
            let mut shared = self.shared.lock();
            shared.resume = None;
            // Any stop answers a pending interrupt.
            shared.interrupt = false;
            shared.halted = Some(Halt {
                registers: RegisterSnapshot::capture(registers),
                signal,
            });
        }
        debug!(rip = format_args!("{:#x}", registers.rip()), signal, "thread halted");
        let resume = poll_until(Deadline::never(), POLL_INTERVAL, || {
            self.shared.lock().resume.take()
        });
        resume.unwrap_or(Resume::Kill)
    }

    /// Called on the sandboxed thread when the program ends.
    pub fn exit(&self, status: u8) {
        let mut shared = self.shared.lock();
        shared.halted = None;
        shared.exited = Some(status);
        debug!(status, "program exited");
    }

    /// The current halt, if the thread is stopped and not yet resumed.
    pub fn current(&self) -> Option<Halt> {
        self.shared.lock().halted.clone()
    }

    /// Replace the registers of the current halt, keeping its signal, so the
    /// next waiter observes them. Returns `false` when nothing is halted.
    pub fn amend(&self, registers: &Registers) -> bool {
        let mut shared = self.shared.lock();
        let Some(halt) = &mut shared.halted else {
            return false;
        };
        halt.registers = RegisterSnapshot::capture(registers);
        true
    }

    /// Ask the running thread to stop at its next instruction.
    pub fn request_interrupt(&self) {
        self.shared.lock().interrupt = true;
    }

    /// Called on the sandboxed thread: consume a pending interrupt request.
    pub fn take_interrupt(&self) -> bool {
        std::mem::take(&mut self.shared.lock().interrupt)
    }

    pub fn exit_status(&self) -> Option<u8> {
        self.shared.lock().exited
    }

    fn poll(&self) -> Option<StopEvent> {
        let shared = self.shared.lock();
        if let Some(halt) = &shared.halted {
            return Some(StopEvent::Halted(halt.clone()));
        }
        shared.exited.map(StopEvent::Exited)
    }

    /// Wait until the thread is halted or has exited.
    pub fn wait(&self, deadline: Deadline) -> Option<StopEvent> {
        poll_until(deadline, POLL_INTERVAL, || self.poll())
    }

    /// Release a halted thread. Returns `false` when nothing is halted.
    pub fn resume(&self, resume: Resume) -> bool {
        let mut shared = self.shared.lock();
        if shared.halted.take().is_none() {
            return false;
        }
        shared.resume = Some(resume);
        true
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::thread;

    use super::*;

    #[test]
    fn rendezvous_round_trip() {
        let ch: Arc<HaltChannel> = Arc::new(HaltChannel::new());
        let worker = {
            let ch = ch.clone();
            thread::spawn(move || {
                let mut regs = Registers::default();
                regs.set_rip(0x2000);
                ch.trap(&regs, 5)
            })
        };

        let Some(StopEvent::Halted(halt)) = ch.wait(Deadline::after(Duration::from_secs(5)))
        else {
            panic!("thread did not halt");
        };
        assert_eq!(halt.registers.registers().rip(), 0x2000);
        assert_eq!(halt.signal, 5);

        let mut regs = halt.registers.registers().clone();
        regs.set_rip(0x3000);
        assert!(ch.resume(Resume::Continue(regs.clone())));
        assert_eq!(worker.join().unwrap(), Resume::Continue(regs));
        assert_eq!(ch.current(), None);
    }

    #[test]
    fn resume_without_halt_is_refused() {
        let ch: HaltChannel = HaltChannel::new();
        assert!(!ch.resume(Resume::Kill));
    }

    #[test]
    fn wait_times_out_while_running() {
        let ch: HaltChannel = HaltChannel::new();
        assert_eq!(ch.wait(Deadline::after(Duration::from_millis(10))), None);
    }

    #[test]
    fn amend_updates_current_halt() {
        let ch: Arc<HaltChannel> = Arc::new(HaltChannel::new());
        assert!(!ch.amend(&Registers::default()));

        let worker = {
            let ch = ch.clone();
            thread::spawn(move || ch.trap(&Registers::default(), 5))
        };
        ch.wait(Deadline::after(Duration::from_secs(5))).unwrap();
        let mut regs = Registers::default();
        regs.set_rip(0x1234);
        assert!(ch.amend(&regs));

        let halt = ch.current().unwrap();
        assert_eq!(halt.registers.registers().rip(), 0x1234);
        assert_eq!(halt.signal, 5);
        ch.resume(Resume::Kill);
        assert_eq!(worker.join().unwrap(), Resume::Kill);
    }

    #[test]
    fn interrupt_is_taken_once_and_cleared_by_a_stop() {
        let ch: Arc<HaltChannel> = Arc::new(HaltChannel::new());
        assert!(!ch.take_interrupt());
        ch.request_interrupt();
        assert!(ch.take_interrupt());
        assert!(!ch.take_interrupt());

        ch.request_interrupt();
        let worker = {
            let ch = ch.clone();
            thread::spawn(move || ch.trap(&Registers::default(), 5))
        };
        ch.wait(Deadline::after(Duration::from_secs(5))).unwrap();
        assert!(!ch.take_interrupt());
        ch.resume(Resume::Kill);
        worker.join().unwrap();
    }

    #[test]
    fn exit_is_observed() {
        let ch: HaltChannel = HaltChannel::new();
        ch.exit(0);
        assert_eq!(ch.wait(Deadline::never()), Some(StopEvent::Exited(0)));
        assert_eq!(ch.exit_status(), Some(0));
    }
}
