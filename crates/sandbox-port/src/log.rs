//! Leveled log emission.
//!
//! Every crate logs through `tracing`; this module installs the subscriber
//! for binaries. Timestamps are elapsed time since start-up.

use std::fmt;
use std::time::Instant;

use tracing_subscriber::fmt::format::Writer;
use tracing_subscriber::fmt::time::FormatTime;

pub use tracing::Level;

struct Elapsed(Instant);

impl FormatTime for Elapsed {
    fn format_time(&self, w: &mut Writer<'_>) -> fmt::Result {
        let d = self.0.elapsed();
        let total_secs = d.as_secs();
        let mins = total_secs / 60;
        let secs = total_secs % 60;
        let millis = d.subsec_millis();
        write!(w, "[{mins:02}:{secs:02}:{millis:03}]")
    }
}

/// Install the global subscriber writing to stderr.
///
/// Returns `false` if a subscriber was already installed (tests install
/// their own, and a second call from the same process is harmless).
pub fn init(max_level: Level) -> bool {
    tracing_subscriber::fmt()
        .with_timer(Elapsed(Instant::now()))
        .with_max_level(max_level)
        .with_writer(std::io::stderr)
        .try_init()
        .is_ok()
}
