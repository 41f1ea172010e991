#![allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    clippy::indexing_slicing,
    clippy::unreachable
)]

use std::collections::VecDeque;
use std::io::{Read, Write};
use std::os::unix::net::UnixStream;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use debug_stub::sim::{LinearExecutor, RunOutcome};
use debug_stub::{
    DebugStub, HaltChannel, Registers, Resume, SessionEnd, SessionState, StubConfig, StubError,
    TRAP_OPCODE, Target,
};
use rsp_proto::reply::{SIGINT, SIGTRAP};
use rsp_proto::{Decoder, Frame};
use sandbox::{BundleValidator, CodeRegionConfig, Sandbox, SandboxConfig, SegmentManager};
use sandbox_port::Deadline;
use sandbox_port::time::poll_until;

const CODE_START: u64 = 0x1000;
const MEMORY_SIZE: u64 = 0x10_0000;
/// 64 NOPs at the start of the code region; the HLT fill behind them ends the program.
const PROGRAM_LEN: usize = 64;
const EXIT_PC: u64 = CODE_START + PROGRAM_LEN as u64;

const WAIT: Duration = Duration::from_secs(5);

/// `rip` as the 16 hex digits of its little-endian encoding.
fn rip_hex(rip: u64) -> String {
    rip.to_le_bytes().iter().map(|b| format!("{b:02x}")).collect()
}

/// Minimal debugger side of the protocol.
struct Gdb {
    stream: UnixStream,
    decoder: Decoder,
    frames: VecDeque<Frame>,
    no_ack: bool,
}

impl Gdb {
    fn new(stream: UnixStream) -> Self {
        stream.set_read_timeout(Some(WAIT)).unwrap();
        Self {
            stream,
            decoder: Decoder::new(),
            frames: VecDeque::new(),
            no_ack: false,
        }
    }

    fn send_raw(&mut self, bytes: &[u8]) {
        self.stream.write_all(bytes).unwrap();
    }

    /// Next frame from the stub, or `None` once it closed the connection.
    fn next_frame(&mut self) -> Option<Frame> {
        let mut buf = [0u8; 1024];
        loop {
            if let Some(frame) = self.frames.pop_front() {
                return Some(frame);
            }
            let n = self.stream.read(&mut buf).expect("stub did not answer");
            if n == 0 {
                return None;
            }
            self.frames.extend(self.decoder.decode(&buf[..n]).unwrap());
        }
    }

    fn expect_frame(&mut self, expected: Frame) {
        assert_eq!(self.next_frame(), Some(expected));
    }

    /// Send a packet; in acknowledged mode the stub must accept it with `+`.
    fn send(&mut self, payload: &str) {
        let framed = rsp_proto::encode(payload.as_bytes()).unwrap();
        self.send_raw(&framed);
        if !self.no_ack {
            self.expect_frame(Frame::Ack);
        }
    }

    /// Receive a reply packet without acknowledging it.
    fn recv_unacked(&mut self) -> String {
        match self.next_frame() {
            Some(Frame::Packet(payload)) => String::from_utf8(payload).unwrap(),
            other => panic!("expected a packet, got {other:?}"),
        }
    }

    fn recv(&mut self) -> String {
        let reply = self.recv_unacked();
        if !self.no_ack {
            self.send_raw(b"+");
        }
        reply
    }

    fn request(&mut self, payload: &str) -> String {
        self.send(payload);
        self.recv()
    }

    fn assert_closed(&mut self) {
        assert_eq!(self.next_frame(), None);
    }
}

/// A sandbox running a program, halted at its entry point, plus a debug
/// stub for it.
///
/// Implements `Drop` to kill the program and join its thread even on panic.
struct Harness {
    sandbox: Arc<Sandbox>,
    halts: Arc<HaltChannel>,
    stub: Arc<DebugStub>,
    program: Option<JoinHandle<RunOutcome>>,
}

fn entry_registers() -> Registers {
    let mut entry = Registers::default();
    entry.set_rip(CODE_START);
    assert!(entry.set(debug_stub::abi::RSP, MEMORY_SIZE));
    assert!(entry.set(debug_stub::abi::EFLAGS, 0x202));
    entry
}

/// Stands in for a program stuck in a loop: it halts at entry and after
/// that only stops when interrupted.
fn spin(halts: &HaltChannel, entry: Registers) -> RunOutcome {
    let mut regs = entry;
    let mut signal = SIGTRAP;
    loop {
        match halts.trap(&regs, signal) {
            Resume::Continue(next) => regs = next,
            Resume::Kill => return RunOutcome::Killed,
        }
        poll_until(Deadline::never(), Duration::from_millis(1), || {
            halts.take_interrupt().then_some(())
        });
        signal = SIGINT;
    }
}

impl Harness {
    /// 64 NOPs under the linear executor.
    fn new() -> Self {
        Self::with_config(StubConfig::default())
    }

    fn with_config(stub_config: StubConfig) -> Self {
        Self::with_program(&[0x90; PROGRAM_LEN], stub_config)
    }

    fn with_program(code: &[u8], stub_config: StubConfig) -> Self {
        Self::start(code, stub_config, |target, halts, entry| {
            LinearExecutor::new(target, halts).run(entry)
        })
    }

    /// A program that runs until interrupted.
    fn spinning(stub_config: StubConfig) -> Self {
        Self::start(&[0x90; PROGRAM_LEN], stub_config, |_, halts, entry| {
            spin(&halts, entry)
        })
    }

    fn start<F>(code: &[u8], stub_config: StubConfig, run: F) -> Self
    where
        F: FnOnce(Arc<dyn Target>, Arc<HaltChannel>, Registers) -> RunOutcome + Send + 'static,
    {
        let config = SandboxConfig {
            memory_size: MEMORY_SIZE,
            code_region: CodeRegionConfig {
                start: CODE_START,
                size: 0xF000,
            },
            ..SandboxConfig::default()
        };
        let segments = Arc::new(SegmentManager::with_software_table(config.platform.clone()));
        let sandbox =
            Arc::new(Sandbox::create(config, segments, Box::new(BundleValidator)).unwrap());
        sandbox.dyncode_create(CODE_START, code).unwrap();

        let target: Arc<dyn Target> = sandbox.clone();
        let halts: Arc<HaltChannel> = Arc::new(HaltChannel::new());
        let stub = Arc::new(DebugStub::new(target.clone(), halts.clone(), stub_config));

        let program = {
            let halts = halts.clone();
            thread::spawn(move || run(target, halts, entry_registers()))
        };

        let h = Self {
            sandbox,
            halts,
            stub,
            program: Some(program),
        };
        h.wait_halted();
        h
    }

    fn wait_halted(&self) {
        poll_until(Deadline::after(WAIT), Duration::from_millis(1), || {
            self.halts.current()
        })
        .expect("program did not halt");
    }

    /// Start a session on a fresh connection.
    fn connect(&self) -> (Gdb, JoinHandle<debug_stub::Result<SessionEnd>>) {
        let (client, server) = UnixStream::pair().unwrap();
        let stub = self.stub.clone();
        let session = thread::spawn(move || stub.serve(server));
        (Gdb::new(client), session)
    }

    fn finish(mut self) -> RunOutcome {
        self.program.take().unwrap().join().unwrap()
    }
}

impl Drop for Harness {
    fn drop(&mut self) {
        let Some(program) = self.program.take() else {
            return;
        };
        let start = Instant::now();
        while !program.is_finished() && start.elapsed() < WAIT {
            self.halts.request_interrupt();
            self.halts.resume(Resume::Kill);
            thread::sleep(Duration::from_millis(1));
        }
        if program.is_finished() {
            let _ = program.join();
        }
    }
}

// ── attach and inspect ───────────────────────────────────────────────

#[test]
fn test_attach_reports_entry_halt() {
    let h = Harness::new();
    let (mut gdb, session) = h.connect();

    assert_eq!(h.stub.state(), SessionState::Disconnected);
    assert_eq!(gdb.request("qSupported:multiprocess+"), "PacketSize=4000;QStartNoAckMode+");
    assert_eq!(gdb.request("?"), "S05");
    assert_eq!(h.stub.state(), SessionState::Halted);

    let regs = gdb.request("g");
    assert_eq!(regs.len(), 164 * 2);
    assert_eq!(&regs[16 * 16..17 * 16], rip_hex(CODE_START));
    assert_eq!(gdb.request("p10"), rip_hex(CODE_START));
    assert_eq!(gdb.request("p7"), rip_hex(MEMORY_SIZE));
    assert_eq!(gdb.request("p11"), "02020000");

    assert_eq!(gdb.request("Hg0"), "OK");
    assert_eq!(gdb.request("qC"), "QC1");
    assert_eq!(gdb.request("qfThreadInfo"), "m1");
    assert_eq!(gdb.request("qsThreadInfo"), "l");
    assert_eq!(gdb.request("qAttached"), "1");
    assert_eq!(gdb.request("vMustReplyEmpty"), "");

    assert_eq!(gdb.request("D"), "OK");
    assert_eq!(session.join().unwrap().unwrap(), SessionEnd::Detached);
}

#[test]
fn test_continue_runs_to_exit() {
    let h = Harness::new();
    let (mut gdb, session) = h.connect();

    assert_eq!(gdb.request("?"), "S05");
    assert_eq!(gdb.request("c"), "W00");
    assert_eq!(h.stub.state(), SessionState::Connected);
    // Stop queries after exit keep reporting the exit.
    assert_eq!(gdb.request("?"), "W00");

    drop(gdb);
    assert_eq!(session.join().unwrap().unwrap(), SessionEnd::Disconnected);
    assert_eq!(h.stub.state(), SessionState::Disconnected);
    assert_eq!(h.finish(), RunOutcome::Exited(0));
}

// ── breakpoints and stepping ─────────────────────────────────────────

#[test]
fn test_breakpoint_hit_rewinds_pc() {
    let h = Harness::new();
    let (mut gdb, _session) = h.connect();
    let bp = CODE_START + 0x10;

    assert_eq!(gdb.request("?"), "S05");
    assert_eq!(gdb.request(&format!("Z0,{bp:x},1")), "OK");
    assert_eq!(gdb.request("c"), "S05");
    assert_eq!(gdb.request("p10"), rip_hex(bp));

    // The trap byte is never visible while halted.
    assert_eq!(gdb.request(&format!("m{bp:x},4")), "90909090");
    assert_eq!(h.sandbox.read_memory(bp, 1).unwrap(), vec![0x90]);

    // Continuing from the breakpoint steps over it and runs to the end.
    assert_eq!(gdb.request("c"), "W00");
    assert_eq!(h.sandbox.read_memory(bp, 1).unwrap(), vec![0x90]);
}

#[test]
fn test_breakpoints_stay_armed_after_step_over() {
    let h = Harness::new();
    let (mut gdb, _session) = h.connect();
    let first = CODE_START + 0x8;
    let second = CODE_START + 0x10;

    assert_eq!(gdb.request(&format!("Z0,{first:x},1")), "OK");
    assert_eq!(gdb.request(&format!("Z0,{second:x},1")), "OK");
    assert_eq!(gdb.request("c"), "S05");
    assert_eq!(gdb.request("p10"), rip_hex(first));
    assert_eq!(gdb.request("c"), "S05");
    assert_eq!(gdb.request("p10"), rip_hex(second));

    // Jump back before the first breakpoint: it was re-armed after the step-over.
    assert_eq!(gdb.request(&format!("c{CODE_START:x}")), "S05");
    assert_eq!(gdb.request("p10"), rip_hex(first));

    assert_eq!(gdb.request(&format!("z0,{first:x},1")), "OK");
    assert_eq!(gdb.request(&format!("z0,{second:x},1")), "OK");
    assert_eq!(gdb.request(&format!("c{CODE_START:x}")), "W00");
}

#[test]
fn test_breakpoint_on_program_trap_reports_the_trap() {
    let mut code = [0x90; PROGRAM_LEN];
    code[8] = TRAP_OPCODE;
    let h = Harness::with_program(&code, StubConfig::default());
    let (mut gdb, _session) = h.connect();
    let bp = CODE_START + 8;

    assert_eq!(gdb.request(&format!("Z0,{bp:x},1")), "OK");
    assert_eq!(gdb.request("c"), "S05");
    assert_eq!(gdb.request("p10"), rip_hex(bp));
    assert_eq!(gdb.request(&format!("m{bp:x},1")), "cc");

    // Leaving the breakpoint runs the program's own trap, which must stop it.
    assert_eq!(gdb.request("c"), "S05");
    assert_eq!(gdb.request("p10"), rip_hex(bp + 1));
    assert_eq!(gdb.request("p11"), "02020000");
    assert_eq!(gdb.request("c"), "W00");
}

#[test]
fn test_single_step() {
    let h = Harness::new();
    let (mut gdb, _session) = h.connect();

    assert_eq!(gdb.request("?"), "S05");
    assert_eq!(gdb.request("s"), "S05");
    assert_eq!(gdb.request("p10"), rip_hex(CODE_START + 1));
    assert_eq!(gdb.request("s"), "S05");
    assert_eq!(gdb.request("p10"), rip_hex(CODE_START + 2));
    // The trap flag used for stepping is not left behind.
    assert_eq!(gdb.request("p11"), "02020000");

    let target = EXIT_PC - 1;
    assert_eq!(gdb.request(&format!("s{target:x}")), "S05");
    assert_eq!(gdb.request("p10"), rip_hex(EXIT_PC));
    assert_eq!(gdb.request("s"), "W00");
}

#[test]
fn test_unsupported_breakpoint_kind_is_empty() {
    let h = Harness::new();
    let (mut gdb, _session) = h.connect();

    assert_eq!(gdb.request("Z1,1010,1"), "");
    assert_eq!(gdb.request("z2,1010,4"), "");
}

// ── registers and memory ─────────────────────────────────────────────

#[test]
fn test_register_and_memory_writes() {
    let h = Harness::new();
    let (mut gdb, _session) = h.connect();
    let target = CODE_START + 0x20;

    assert_eq!(gdb.request(&format!("P10={}", rip_hex(target))), "OK");
    assert_eq!(gdb.request("p10"), rip_hex(target));

    let mut regs = gdb.request("g");
    regs.replace_range(0..16, &rip_hex(0xdead_beef));
    assert_eq!(gdb.request(&format!("G{regs}")), "OK");
    assert_eq!(gdb.request("p0"), rip_hex(0xdead_beef));

    assert_eq!(gdb.request("M20000,4:01020304"), "OK");
    assert_eq!(gdb.request("m20000,4"), "01020304");
    assert_eq!(h.sandbox.read_memory(0x20000, 4).unwrap(), vec![1, 2, 3, 4]);

    // Resumes from the edited pc.
    assert_eq!(gdb.request("s"), "S05");
    assert_eq!(gdb.request("p10"), rip_hex(target + 1));
}

#[test]
fn test_access_outside_sandbox_denied() {
    let h = Harness::new();
    let (mut gdb, session) = h.connect();

    assert_eq!(gdb.request("?"), "S05");
    let end = MEMORY_SIZE;
    assert_eq!(gdb.request(&format!("m{end:x},4")), "E01");
    assert_eq!(gdb.request(&format!("m{:x},4", end - 2)), "E01");
    assert_eq!(gdb.request(&format!("M{end:x},1:00")), "E01");
    assert_eq!(gdb.request(&format!("Z0,{end:x},1")), "E01");
    assert_eq!(gdb.request(&format!("P10={}", rip_hex(end))), "E01");
    assert_eq!(gdb.request(&format!("P7={}", rip_hex(end + 1))), "E01");
    assert_eq!(gdb.request(&format!("c{end:x}")), "E01");
    assert_eq!(gdb.request("p18"), "E01");

    // Nothing changed and the session carries on.
    assert_eq!(h.stub.state(), SessionState::Halted);
    assert_eq!(gdb.request("p10"), rip_hex(CODE_START));
    // rsp may sit one past the end of memory.
    assert_eq!(gdb.request(&format!("P7={}", rip_hex(end))), "OK");
    assert_eq!(gdb.request("D"), "OK");
    assert_eq!(session.join().unwrap().unwrap(), SessionEnd::Detached);
}

#[test]
fn test_malformed_command_gets_e00() {
    let h = Harness::new();
    let (mut gdb, _session) = h.connect();

    assert_eq!(gdb.request("m2000"), "E00");
    assert_eq!(gdb.request("Gabc"), "E00");
    assert_eq!(gdb.request("?"), "S05");
}

// ── framing ──────────────────────────────────────────────────────────

#[test]
fn test_corrupt_checksum_is_nacked() {
    let h = Harness::new();
    let (mut gdb, _session) = h.connect();

    gdb.send_raw(b"$?#00");
    gdb.expect_frame(Frame::Nack);
    assert_eq!(h.stub.state(), SessionState::Disconnected);

    assert_eq!(gdb.request("?"), "S05");
}

#[test]
fn test_nack_retransmits_last_reply() {
    let h = Harness::new();
    let (mut gdb, session) = h.connect();

    gdb.send("qC");
    assert_eq!(gdb.recv_unacked(), "QC1");
    gdb.send_raw(b"-");
    assert_eq!(gdb.recv_unacked(), "QC1");
    gdb.send_raw(b"+");
    assert_eq!(gdb.request("qAttached"), "1");

    // A debugger that rejects every copy is eventually dropped.
    gdb.send("qC");
    gdb.recv_unacked();
    for _ in 0..3 {
        gdb.send_raw(b"-");
        assert_eq!(gdb.recv_unacked(), "QC1");
    }
    gdb.send_raw(b"-");
    gdb.assert_closed();
    assert_eq!(session.join().unwrap().unwrap(), SessionEnd::Disconnected);
}

#[test]
fn test_escaped_payload() {
    let h = Harness::new();
    let (mut gdb, _session) = h.connect();

    // `}m` is the escaped form of `M`.
    let body = b"}m20000,2:2324";
    let mut framed = vec![b'$'];
    framed.extend_from_slice(body);
    framed.extend_from_slice(format!("#{:02x}", rsp_proto::checksum(body)).as_bytes());
    gdb.send_raw(&framed);
    gdb.expect_frame(Frame::Ack);
    assert_eq!(gdb.recv(), "OK");

    assert_eq!(h.sandbox.read_memory(0x20000, 2).unwrap(), vec![b'#', b'$']);
    assert_eq!(gdb.request("m20000,2"), "2324");
}

#[test]
fn test_no_ack_mode() {
    let h = Harness::new();
    let (mut gdb, _session) = h.connect();

    assert_eq!(gdb.request("QStartNoAckMode"), "OK");
    gdb.no_ack = true;

    // No `+` precedes the replies any more.
    assert_eq!(gdb.request("?"), "S05");
    assert_eq!(gdb.request("s"), "S05");
    assert_eq!(gdb.request("p10"), rip_hex(CODE_START + 1));

    // Corrupt packets are dropped silently.
    gdb.send_raw(b"$?#00");
    assert_eq!(gdb.request("qC"), "QC1");
}

#[test]
fn test_interrupt_while_halted_is_ignored() {
    let h = Harness::new();
    let (mut gdb, _session) = h.connect();

    gdb.send_raw(&[0x03]);
    assert_eq!(gdb.request("?"), "S05");
}

// ── session lifecycle ────────────────────────────────────────────────

#[test]
fn test_detach_leaves_program_halted() {
    let h = Harness::new();
    let bp = CODE_START + 0x10;
    {
        let (mut gdb, session) = h.connect();
        assert_eq!(gdb.request(&format!("Z0,{bp:x},1")), "OK");
        assert_eq!(gdb.request("c"), "S05");
        assert_eq!(gdb.request("D"), "OK");
        assert_eq!(session.join().unwrap().unwrap(), SessionEnd::Detached);
    }

    assert_eq!(h.stub.state(), SessionState::Disconnected);
    let halt = h.halts.current().expect("program resumed on detach");
    assert_eq!(halt.registers.registers().rip(), bp);
    // Breakpoints do not outlive the session.
    assert_eq!(h.sandbox.read_memory(bp, 1).unwrap(), vec![0x90]);

    let (mut gdb, _session) = h.connect();
    assert_eq!(gdb.request("?"), "S05");
    assert_eq!(gdb.request("p10"), rip_hex(bp));
    assert_eq!(gdb.request("c"), "W00");
}

#[test]
fn test_receive_timeout_ends_session() {
    let h = Harness::with_config(StubConfig {
        recv_timeout: Some(Duration::from_millis(100)),
        ..StubConfig::default()
    });
    let (mut gdb, session) = h.connect();

    assert_eq!(gdb.request("?"), "S05");
    assert_eq!(session.join().unwrap().unwrap(), SessionEnd::TimedOut);
    gdb.assert_closed();

    assert_eq!(h.stub.state(), SessionState::Disconnected);
    assert!(h.halts.current().is_some());
}

// ── while the program runs ───────────────────────────────────────────

#[test]
fn test_interrupt_stops_running_program() {
    let h = Harness::spinning(StubConfig::default());
    let (mut gdb, _session) = h.connect();

    assert_eq!(gdb.request("?"), "S05");
    gdb.send("c");
    gdb.send_raw(&[0x03]);
    assert_eq!(gdb.recv(), "S02");
    assert_eq!(h.stub.state(), SessionState::Halted);
    assert_eq!(gdb.request("p10"), rip_hex(CODE_START));
}

#[test]
fn test_disconnect_while_running_frees_the_stub() {
    let h = Harness::spinning(StubConfig::default());
    let (mut gdb, session) = h.connect();

    assert_eq!(gdb.request("?"), "S05");
    gdb.send("c");
    drop(gdb);
    assert_eq!(session.join().unwrap().unwrap(), SessionEnd::Disconnected);
    assert_eq!(h.stub.state(), SessionState::Disconnected);
    assert!(h.halts.current().is_none());

    // A new debugger can attach and stop the program.
    let (mut gdb, _session) = h.connect();
    gdb.send_raw(&[0x03]);
    assert_eq!(gdb.request("?"), "S02");
    assert_eq!(gdb.request("qC"), "QC1");
}

#[test]
fn test_receive_timeout_while_running() {
    let h = Harness::spinning(StubConfig {
        recv_timeout: Some(Duration::from_millis(100)),
        ..StubConfig::default()
    });
    let (mut gdb, session) = h.connect();

    assert_eq!(gdb.request("?"), "S05");
    gdb.send("c");
    assert_eq!(session.join().unwrap().unwrap(), SessionEnd::TimedOut);
    gdb.assert_closed();
    assert_eq!(h.stub.state(), SessionState::Disconnected);
}

#[test]
fn test_detach_while_running() {
    let h = Harness::spinning(StubConfig::default());
    let (mut gdb, session) = h.connect();

    assert_eq!(gdb.request("?"), "S05");
    gdb.send("c");
    assert_eq!(gdb.request("D"), "OK");
    assert_eq!(session.join().unwrap().unwrap(), SessionEnd::Detached);
    assert_eq!(h.stub.state(), SessionState::Disconnected);
}

#[test]
fn test_packets_sent_while_running_are_answered_after_the_stop() {
    let h = Harness::spinning(StubConfig::default());
    let (mut gdb, _session) = h.connect();

    assert_eq!(gdb.request("?"), "S05");
    gdb.send("c");
    gdb.send("qC");
    gdb.send_raw(&[0x03]);
    assert_eq!(gdb.recv(), "S02");
    assert_eq!(gdb.recv(), "QC1");
}

#[test]
fn test_second_debugger_is_busy() {
    let h = Harness::new();
    let (mut gdb, _session) = h.connect();
    assert_eq!(gdb.request("?"), "S05");

    let (_client, server) = UnixStream::pair().unwrap();
    assert!(matches!(h.stub.serve(server), Err(StubError::Busy)));

    // The first session is unaffected.
    assert_eq!(gdb.request("qC"), "QC1");
    assert_eq!(gdb.request("D"), "OK");
}

#[test]
fn test_kill_terminates_program() {
    let h = Harness::new();
    let (mut gdb, session) = h.connect();

    assert_eq!(gdb.request("?"), "S05");
    gdb.send("k");
    gdb.assert_closed();
    assert_eq!(session.join().unwrap().unwrap(), SessionEnd::Killed);
    assert_eq!(h.finish(), RunOutcome::Killed);
}
