//! Remote debug stub for a sandboxed program.
//!
//! The stub speaks the remote serial protocol ([`rsp_proto`]) over a
//! [`Transport`] and inspects the program through a [`Target`]. The
//! sandboxed thread reports every stop through a [`HaltChannel`] and stays
//! halted until the debugger resumes it.

pub mod abi;
mod breakpoints;
mod error;
mod halt;
mod session;
pub mod sim;
mod stub;
mod target;
mod transport;

pub use abi::{RegisterSnapshot, Registers};
pub use breakpoints::{Breakpoints, TRAP_OPCODE};
pub use error::{Result, StubError};
pub use halt::{Halt, HaltChannel, Resume, StopEvent};
pub use session::{SessionEnd, SessionState, StatusHandle, StubConfig};
pub use stub::DebugStub;
pub use target::Target;
pub use transport::{Transport, is_timeout};
