mod check;
mod debug;

pub use check::{CheckArgs, run_check};
pub use debug::{DebugArgs, run_debug};
