//! One debugger connection.
//!
//! ```text
//! Disconnected --first valid packet--> Connected --thread halts--> Halted
//!      ^                                   ^                         |
//!      |                                   +-------- c / s ----------+
//!      +---- detach, kill, timeout, transport error (any state) -----+
//! ```
//!
//! The session is half-duplex: each packet gets exactly one reply, and the
//! reply to `c`/`s` is the stop reply sent once the thread halts again.
//! While the thread runs the connection is still watched: `0x03` asks the
//! thread to stop, `D` detaches, and other packets wait for the stop.

use std::collections::VecDeque;
use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};
use std::time::Duration;

use rsp_proto::reply::{self, E_ACCESS_DENIED, E_FAILED, E_MALFORMED, SIGTRAP};
use rsp_proto::{BreakpointKind, Command, Decoder, Frame, MAX_PACKET_SIZE, hex};
use sandbox::SandboxError;
use sandbox_port::{Deadline, LockKind};
use tracing::{debug, info, warn};

use crate::abi::{self, Registers};
use crate::breakpoints::{Breakpoints, TRAP_OPCODE};
use crate::halt::{Halt, HaltChannel, Resume, StopEvent};
use crate::target::Target;
use crate::transport::{Transport, is_timeout};

const READ_BUFFER_SIZE: usize = 4096;

/// How long each halt check and each transport read may block while the
/// thread runs.
const STOP_POLL_INTERVAL: Duration = Duration::from_millis(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SessionState {
    Disconnected = 0,
    Connected = 1,
    Halted = 2,
}

/// Session state shared with the host.
#[derive(Debug, Clone, Default)]
pub struct StatusHandle(Arc<AtomicU8>);

impl StatusHandle {
    pub fn get(&self) -> SessionState {
        match self.0.load(Ordering::Acquire) {
            1 => SessionState::Connected,
            2 => SessionState::Halted,
            _ => SessionState::Disconnected,
        }
    }

    pub(crate) fn set(&self, state: SessionState) {
        self.0.store(state as u8, Ordering::Release);
    }
}

#[derive(Debug, Clone)]
pub struct StubConfig {
    /// Longest wait for the next byte from the debugger. `None` waits forever.
    pub recv_timeout: Option<Duration>,
    /// Resends of one reply on `-` before the connection is dropped.
    pub max_retransmits: u32,
}

impl Default for StubConfig {
    fn default() -> Self {
        Self {
            recv_timeout: Some(Duration::from_secs(60)),
            max_retransmits: 3,
        }
    }
}

/// Why a session ended. The program is never resumed by the ending itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEnd {
    Detached,
    Killed,
    TimedOut,
    Disconnected,
}

enum Flow {
    Continue,
    End(SessionEnd),
}

enum Waited {
    Stopped,
    End(SessionEnd),
}

/// How the thread was last resumed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RunMode {
    Continue,
    Step,
    /// Stepping off the breakpoint at `from` before arming it. `own_trap`
    /// is set when the program itself has a trap opcode there.
    StepOver { from: u64, own_trap: bool },
}

/// Register state of the halted thread as the debugger sees it.
struct HaltedThread {
    working: Registers,
    signal: u8,
}

fn to_io_error(e: rsp_proto::ProtocolError) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, e.to_string())
}

pub(crate) struct Session<'a, L: LockKind> {
    transport: &'a mut dyn Transport,
    target: &'a dyn Target,
    halts: &'a HaltChannel<L>,
    config: &'a StubConfig,
    status: &'a StatusHandle,
    decoder: Decoder,
    no_ack: bool,
    last_reply: Option<Vec<u8>>,
    retransmits: u32,
    breakpoints: Breakpoints,
    thread: Option<HaltedThread>,
    exited: Option<u8>,
    mode: RunMode,
    /// Packets received while the thread ran, handled once it stops.
    deferred: VecDeque<Vec<u8>>,
}

impl<'a, L: LockKind> Session<'a, L> {
    pub(crate) fn new(
        transport: &'a mut dyn Transport,
        target: &'a dyn Target,
        halts: &'a HaltChannel<L>,
        config: &'a StubConfig,
        status: &'a StatusHandle,
    ) -> Self {
        Self {
            transport,
            target,
            halts,
            config,
            status,
            decoder: Decoder::new(),
            no_ack: false,
            last_reply: None,
            retransmits: 0,
            breakpoints: Breakpoints::new(),
            thread: None,
            exited: None,
            mode: RunMode::Continue,
            deferred: VecDeque::new(),
        }
    }

    pub(crate) fn run(mut self) -> SessionEnd {
        self.status.set(SessionState::Disconnected);
        let end = self.serve();
        self.breakpoints.clear(self.target);
        // Edits made while halted, and a rewound breakpoint pc, outlive the session.
        if let Some(t) = &self.thread {
            self.halts.amend(&t.working);
        }
        self.status.set(SessionState::Disconnected);
        end
    }

    fn serve(&mut self) -> SessionEnd {
        let mut buf = [0u8; READ_BUFFER_SIZE];
        loop {
            while let Some(payload) = self.deferred.pop_front() {
                match self.handle_packet(&payload) {
                    Ok(Flow::Continue) => {}
                    Ok(Flow::End(end)) => return end,
                    Err(e) => {
                        warn!(error = %e, "transport error, closing session");
                        return SessionEnd::Disconnected;
                    }
                }
            }

            let n = match self.transport.read(&mut buf) {
                Ok(0) => {
                    info!("debugger disconnected");
                    return SessionEnd::Disconnected;
                }
                Ok(n) => n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) if is_timeout(&e) => {
                    warn!(timeout = ?self.config.recv_timeout, "receive timeout, closing session");
                    return SessionEnd::TimedOut;
                }
                Err(e) => {
                    warn!(error = %e, "transport error, closing session");
                    return SessionEnd::Disconnected;
                }
            };

            // n <= buf.len() is guaranteed by read()
            let frames = match self.decoder.decode(buf.get(..n).unwrap_or_default()) {
                Ok(frames) => frames,
                Err(e) => {
                    warn!(error = %e, "discarding oversized input");
                    if let Err(e) = self.send_raw(&[rsp_proto::NACK]) {
                        warn!(error = %e, "transport error, closing session");
                        return SessionEnd::Disconnected;
                    }
                    continue;
                }
            };

            for frame in frames {
                match self.handle_frame(frame) {
                    Ok(Flow::Continue) => {}
                    Ok(Flow::End(end)) => return end,
                    Err(e) => {
                        warn!(error = %e, "transport error, closing session");
                        return SessionEnd::Disconnected;
                    }
                }
            }
        }
    }

    fn send_raw(&mut self, bytes: &[u8]) -> io::Result<()> {
        self.transport.write_all(bytes)?;
        self.transport.flush()
    }

    fn respond(&mut self, payload: &[u8]) -> io::Result<Flow> {
        self.reply(payload)?;
        Ok(Flow::Continue)
    }

    fn reply(&mut self, payload: &[u8]) -> io::Result<()> {
        let framed = rsp_proto::encode(payload)
            .or_else(|e| {
                warn!(error = %e, "reply does not fit a packet");
                rsp_proto::encode(&reply::error(E_FAILED))
            })
            .map_err(to_io_error)?;
        self.send_raw(&framed)?;
        self.last_reply = Some(framed);
        self.retransmits = 0;
        Ok(())
    }

    fn handle_frame(&mut self, frame: Frame) -> io::Result<Flow> {
        match frame {
            Frame::Ack => self.retransmits = 0,
            Frame::Nack => {
                if self.no_ack {
                    return Ok(Flow::Continue);
                }
                let Some(last) = self.last_reply.clone() else {
                    return Ok(Flow::Continue);
                };
                if self.retransmits >= self.config.max_retransmits {
                    warn!(
                        attempts = self.retransmits,
                        "debugger keeps rejecting reply, closing session"
                    );
                    return Ok(Flow::End(SessionEnd::Disconnected));
                }
                self.retransmits += 1;
                debug!(attempt = self.retransmits, "retransmitting reply");
                self.send_raw(&last)?;
            }
            Frame::Interrupt => {
                if self.thread.is_none()
                    && self.exited.is_none()
                    && self.halts.current().is_none()
                {
                    debug!("interrupt requested");
                    self.halts.request_interrupt();
                } else {
                    debug!("interrupt ignored, thread is not running");
                }
            }
            Frame::Corrupt => {
                warn!("packet checksum mismatch");
                if !self.no_ack {
                    self.send_raw(&[rsp_proto::NACK])?;
                }
            }
            Frame::Packet(payload) => {
                if !self.no_ack {
                    self.send_raw(&[rsp_proto::ACK])?;
                }
                if self.status.get() == SessionState::Disconnected {
                    self.status.set(SessionState::Connected);
                    info!("debugger connected");
                }
                return self.handle_packet(&payload);
            }
        }
        Ok(Flow::Continue)
    }

    fn handle_packet(&mut self, payload: &[u8]) -> io::Result<Flow> {
        match Command::parse(payload) {
            Ok(command) => self.dispatch(command),
            Err(e) => {
                warn!(error = %e, "malformed command");
                self.respond(&reply::error(E_MALFORMED))
            }
        }
    }

    fn dispatch(&mut self, command: Command) -> io::Result<Flow> {
        debug!(?command, "command");
        if command.needs_halt()
            && self.thread.is_none()
            && self.exited.is_none()
            && let Waited::End(end) = self.await_stop()?
        {
            return Ok(Flow::End(end));
        }

        let response = match command {
            Command::HaltReason => self.stop_reply(),
            Command::ReadRegisters => match &self.thread {
                Some(t) => hex::encode(&t.working.to_bytes()).into_bytes(),
                None => reply::error(E_FAILED),
            },
            Command::WriteRegisters(bytes) => self.write_registers(&bytes),
            Command::ReadRegister(index) => self.read_register(index),
            Command::WriteRegister { index, value } => self.write_register(index, &value),
            Command::ReadMemory { addr, len } => {
                let len = len.min((MAX_PACKET_SIZE / 2) as u64);
                match self.target.read_memory(addr, len) {
                    Ok(bytes) => hex::encode(&bytes).into_bytes(),
                    Err(e) => Self::failure(&e),
                }
            }
            Command::WriteMemory { addr, data } => match self.target.write_memory(addr, &data) {
                Ok(()) => reply::OK.to_vec(),
                Err(e) => Self::failure(&e),
            },
            Command::Continue(addr) => return self.resume(addr, false),
            Command::Step(addr) => return self.resume(addr, true),
            Command::InsertBreakpoint { kind, addr } => match kind {
                BreakpointKind::Software => match self.breakpoints.insert(self.target, addr) {
                    Ok(()) => reply::OK.to_vec(),
                    Err(e) => Self::failure(&e),
                },
                BreakpointKind::Other(_) => reply::EMPTY.to_vec(),
            },
            Command::RemoveBreakpoint { kind, addr } => match kind {
                BreakpointKind::Software => match self.breakpoints.remove(self.target, addr) {
                    Ok(()) => reply::OK.to_vec(),
                    Err(e) => Self::failure(&e),
                },
                BreakpointKind::Other(_) => reply::EMPTY.to_vec(),
            },
            Command::Detach => {
                self.reply(reply::OK)?;
                info!("debugger detached");
                return Ok(Flow::End(SessionEnd::Detached));
            }
            Command::Kill => {
                self.breakpoints.clear(self.target);
                if self.halts.resume(Resume::Kill) {
                    info!("sandboxed thread killed by debugger");
                }
                return Ok(Flow::End(SessionEnd::Killed));
            }
            Command::SetThread => reply::OK.to_vec(),
            Command::QuerySupported => reply::supported(),
            Command::QueryAttached => reply::attached(),
            Command::QueryCurrentThread => reply::current_thread(),
            Command::QueryThreadInfoFirst => reply::thread_list(),
            Command::QueryThreadInfoNext => reply::end_of_list(),
            Command::StartNoAckMode => {
                self.reply(reply::OK)?;
                self.no_ack = true;
                debug!("acknowledgements disabled");
                return Ok(Flow::Continue);
            }
            Command::Unknown(_) => reply::EMPTY.to_vec(),
        };
        self.reply(&response)?;
        Ok(Flow::Continue)
    }

    fn failure(e: &SandboxError) -> Vec<u8> {
        match e {
            SandboxError::AccessDenied { addr, len } => {
                warn!(
                    addr = format_args!("{addr:#x}"),
                    len, "debugger access outside sandbox denied"
                );
                reply::error(E_ACCESS_DENIED)
            }
            other => {
                warn!(error = %other, "debugger request failed");
                reply::error(E_FAILED)
            }
        }
    }

    fn stop_reply(&self) -> Vec<u8> {
        match (&self.exited, &self.thread) {
            (Some(status), _) => reply::exited(*status),
            (None, Some(t)) => reply::stopped(t.signal),
            (None, None) => reply::stopped(SIGTRAP),
        }
    }

    /// `rip` must stay inside sandbox memory and `rsp` at most one past it.
    fn check_pointers(&self, regs: &Registers) -> Result<(), SandboxError> {
        let size = self.target.memory_size();
        if regs.rip() >= size {
            return Err(SandboxError::AccessDenied {
                addr: regs.rip(),
                len: 1,
            });
        }
        if regs.rsp() > size {
            return Err(SandboxError::AccessDenied {
                addr: regs.rsp(),
                len: 0,
            });
        }
        Ok(())
    }

    fn write_registers(&mut self, bytes: &[u8]) -> Vec<u8> {
        let Some(regs) = Registers::from_bytes(bytes) else {
            warn!(len = bytes.len(), "register file has the wrong size");
            return reply::error(E_MALFORMED);
        };
        if let Err(e) = self.check_pointers(&regs) {
            return Self::failure(&e);
        }
        match &mut self.thread {
            Some(t) => {
                t.working = regs;
                reply::OK.to_vec()
            }
            None => reply::error(E_FAILED),
        }
    }

    fn read_register(&self, index: usize) -> Vec<u8> {
        let Some(t) = &self.thread else {
            return reply::error(E_FAILED);
        };
        match t.working.read_one(index) {
            Some(bytes) => hex::encode(&bytes).into_bytes(),
            None => {
                warn!(index, "register index outside the register file");
                reply::error(E_ACCESS_DENIED)
            }
        }
    }

    fn write_register(&mut self, index: usize, value: &[u8]) -> Vec<u8> {
        let Some(t) = &self.thread else {
            return reply::error(E_FAILED);
        };
        if abi::width(index).is_none() {
            warn!(index, "register index outside the register file");
            return reply::error(E_ACCESS_DENIED);
        }
        let mut regs = t.working.clone();
        if !regs.write_one(index, value) {
            return reply::error(E_MALFORMED);
        }
        if let Err(e) = self.check_pointers(&regs) {
            return Self::failure(&e);
        }
        if let Some(t) = &mut self.thread {
            t.working = regs;
        }
        reply::OK.to_vec()
    }

    /// Resume the halted thread and reply once it stops again.
    fn resume(&mut self, addr: Option<u64>, step: bool) -> io::Result<Flow> {
        if let Some(status) = self.exited {
            return self.respond(&reply::exited(status));
        }
        let Some(t) = &self.thread else {
            return self.respond(&reply::error(E_FAILED));
        };
        let mut regs = t.working.clone();
        if let Some(addr) = addr {
            regs.set_rip(addr);
            if let Err(e) = self.check_pointers(&regs) {
                return self.respond(&Self::failure(&e));
            }
        }

        let pc = regs.rip();
        self.mode = if step {
            RunMode::Step
        } else if self.breakpoints.contains(pc) {
            // Breakpoints are lifted while halted, so this is the program's byte.
            let own_trap = self
                .target
                .read_memory(pc, 1)
                .is_ok_and(|b| b.first() == Some(&TRAP_OPCODE));
            RunMode::StepOver { from: pc, own_trap }
        } else {
            RunMode::Continue
        };
        if self.mode != RunMode::Continue {
            regs.set_trap_flag(true);
        }
        if let Err(e) = self.breakpoints.arm(self.target, Some(pc)) {
            self.breakpoints.disarm(self.target);
            self.mode = RunMode::Continue;
            return self.respond(&Self::failure(&e));
        }
        if !self.halts.resume(Resume::Continue(regs)) {
            self.breakpoints.disarm(self.target);
            self.mode = RunMode::Continue;
            warn!("thread was not halted");
            return self.respond(&reply::error(E_FAILED));
        }
        self.thread = None;
        self.status.set(SessionState::Connected);
        debug!(pc = format_args!("{pc:#x}"), step, "thread resumed");

        match self.await_stop()? {
            Waited::Stopped => {
                let stop = self.stop_reply();
                self.respond(&stop)
            }
            Waited::End(end) => Ok(Flow::End(end)),
        }
    }

    /// Wait until the thread halts or the program exits, watching the
    /// debugger in short slices meanwhile.
    fn await_stop(&mut self) -> io::Result<Waited> {
        self.transport.set_read_timeout(Some(STOP_POLL_INTERVAL))?;
        let waited = self.watch_until_stop()?;
        if let Waited::Stopped = waited {
            self.transport.set_read_timeout(self.config.recv_timeout)?;
        }
        Ok(waited)
    }

    fn watch_until_stop(&mut self) -> io::Result<Waited> {
        let mut idle = Deadline::from_timeout(self.config.recv_timeout);
        let mut buf = [0u8; READ_BUFFER_SIZE];
        loop {
            if let Some(event) = self.halts.wait(Deadline::after(STOP_POLL_INTERVAL)) {
                if self.observe(event) {
                    return Ok(Waited::Stopped);
                }
                continue;
            }

            let n = match self.transport.read(&mut buf) {
                Ok(0) => {
                    info!("debugger disconnected while the thread runs");
                    return Ok(Waited::End(SessionEnd::Disconnected));
                }
                Ok(n) => n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) if is_timeout(&e) => {
                    if idle.expired() {
                        warn!(
                            timeout = ?self.config.recv_timeout,
                            "receive timeout while the thread runs, closing session"
                        );
                        return Ok(Waited::End(SessionEnd::TimedOut));
                    }
                    continue;
                }
                Err(e) => {
                    warn!(error = %e, "transport error while the thread runs, closing session");
                    return Ok(Waited::End(SessionEnd::Disconnected));
                }
            };
            idle = Deadline::from_timeout(self.config.recv_timeout);

            let frames = match self.decoder.decode(buf.get(..n).unwrap_or_default()) {
                Ok(frames) => frames,
                Err(e) => {
                    warn!(error = %e, "discarding oversized input");
                    self.send_raw(&[rsp_proto::NACK])?;
                    continue;
                }
            };
            for frame in frames {
                if let Some(end) = self.handle_running_frame(frame)? {
                    return Ok(Waited::End(end));
                }
            }
        }
    }

    fn handle_running_frame(&mut self, frame: Frame) -> io::Result<Option<SessionEnd>> {
        match frame {
            Frame::Ack | Frame::Nack => {}
            Frame::Interrupt => {
                debug!("interrupt requested");
                self.halts.request_interrupt();
            }
            Frame::Corrupt => {
                warn!("packet checksum mismatch");
                if !self.no_ack {
                    self.send_raw(&[rsp_proto::NACK])?;
                }
            }
            Frame::Packet(payload) => {
                if !self.no_ack {
                    self.send_raw(&[rsp_proto::ACK])?;
                }
                if let Ok(Command::Detach) = Command::parse(&payload) {
                    self.reply(reply::OK)?;
                    info!("debugger detached while the thread runs");
                    return Ok(Some(SessionEnd::Detached));
                }
                debug!(len = payload.len(), "packet deferred until the thread stops");
                self.deferred.push_back(payload);
            }
        }
        Ok(None)
    }

    /// Take in a stop. Returns `false` when it only ended the step off a
    /// breakpoint and the thread was sent on.
    fn observe(&mut self, event: StopEvent) -> bool {
        match event {
            StopEvent::Halted(halt) => {
                if let RunMode::StepOver {
                    from,
                    own_trap: false,
                } = self.mode
                    && halt.signal == SIGTRAP
                    && halt.registers.registers().rip() != from
                {
                    self.mode = RunMode::Continue;
                    let mut regs = halt.registers.registers().clone();
                    regs.set_trap_flag(false);
                    if let Err(e) = self.breakpoints.arm(self.target, None) {
                        warn!(error = %e, "failed to re-arm breakpoints");
                    }
                    if !self.halts.resume(Resume::Continue(regs)) {
                        warn!("thread left the step before it was resumed");
                    }
                    return false;
                }
                self.enter_halted(halt);
                true
            }
            StopEvent::Exited(status) => {
                self.breakpoints.disarm(self.target);
                self.exited = Some(status);
                self.mode = RunMode::Continue;
                info!(status, "program exited");
                true
            }
        }
    }

    fn enter_halted(&mut self, halt: Halt) {
        self.breakpoints.disarm(self.target);
        let mut working = halt.registers.registers().clone();
        match std::mem::replace(&mut self.mode, RunMode::Continue) {
            RunMode::Step | RunMode::StepOver { .. } => working.set_trap_flag(false),
            RunMode::Continue => {
                let pc = working.rip();
                if halt.signal == SIGTRAP && pc > 0 && self.breakpoints.contains(pc - 1) {
                    working.set_rip(pc - 1);
                }
            }
        }
        debug!(
            rip = format_args!("{:#x}", working.rip()),
            signal = halt.signal,
            "thread halted"
        );
        self.thread = Some(HaltedThread {
            working,
            signal: halt.signal,
        });
        self.status.set(SessionState::Halted);
    }
}
