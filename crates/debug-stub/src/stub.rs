use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use sandbox_port::{Blocking, LockKind};
use tracing::{info, warn};

use crate::error::{Result, StubError};
use crate::halt::HaltChannel;
use crate::session::{Session, SessionEnd, SessionState, StatusHandle, StubConfig};
use crate::target::Target;
use crate::transport::Transport;

/// Debug stub for one sandboxed program. Serves at most one debugger at a
/// time, on the caller's thread.
pub struct DebugStub<L: LockKind = Blocking> {
    target: Arc<dyn Target>,
    halts: Arc<HaltChannel<L>>,
    config: StubConfig,
    status: StatusHandle,
    active: AtomicBool,
}

struct ActiveGuard<'a>(&'a AtomicBool);

impl Drop for ActiveGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl<L: LockKind> DebugStub<L> {
    pub fn new(target: Arc<dyn Target>, halts: Arc<HaltChannel<L>>, config: StubConfig) -> Self {
        Self {
            target,
            halts,
            config,
            status: StatusHandle::default(),
            active: AtomicBool::new(false),
        }
    }

    pub fn state(&self) -> SessionState {
        self.status.get()
    }

    /// Shared handle for observing the session state from other threads.
    pub fn status(&self) -> StatusHandle {
        self.status.clone()
    }

    /// Run a session over `transport` until it ends.
    pub fn serve<T: Transport>(&self, mut transport: T) -> Result<SessionEnd> {
        if self.active.swap(true, Ordering::AcqRel) {
            warn!("rejecting debugger: a session is already active");
            return Err(StubError::Busy);
        }
        let _active = ActiveGuard(&self.active);
        transport.set_read_timeout(self.config.recv_timeout)?;

        info!("debug session started");
        let end = Session::new(
            &mut transport,
            &*self.target,
            &self.halts,
            &self.config,
            &self.status,
        )
        .run();
        info!(?end, "debug session ended");
        Ok(end)
    }
}
