//! Halt-first publication of code into the executable region.
//!
//! A bundle is replaced by first turning its leading byte into `HLT`, then
//! writing the tail, then the real leading byte. A thread racing through the
//! bundle sees either the old instruction stream, a halt, or the new stream.

use std::sync::atomic::{Ordering, fence};

pub const HALT_OPCODE: u8 = 0xF4;

/// Copy `src` over `dst` bundle by bundle, halt-first. Unchanged bundles are
/// left untouched. Returns the number of bundles rewritten.
pub fn publish_code(dst: &mut [u8], src: &[u8], bundle: usize) -> usize {
    let bundle = bundle.max(1);
    let mut rewritten = 0;
    for (d, s) in dst.chunks_mut(bundle).zip(src.chunks(bundle)) {
        if d == s {
            continue;
        }
        let (Some((d_first, d_tail)), Some((s_first, s_tail))) =
            (d.split_first_mut(), s.split_first())
        else {
            continue;
        };
        *d_first = HALT_OPCODE;
        fence(Ordering::SeqCst);
        let n = d_tail.len().min(s_tail.len());
        if let (Some(dt), Some(st)) = (d_tail.get_mut(..n), s_tail.get(..n)) {
            dt.copy_from_slice(st);
        }
        fence(Ordering::SeqCst);
        *d_first = *s_first;
        rewritten += 1;
    }
    fence(Ordering::SeqCst);
    rewritten
}

/// Overwrite `dst` with halt bytes.
pub fn fill_halt(dst: &mut [u8]) {
    dst.fill(HALT_OPCODE);
    fence(Ordering::SeqCst);
}
