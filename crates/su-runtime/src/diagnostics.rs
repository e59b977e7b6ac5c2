//! Runtime diagnostics for production debugging.
//!
//! Installs a SIGQUIT (`kill -3`) handler that dumps VM statistics to
//! stderr, the same "thread dump on demand, without stopping the
//! process" idea the embedding host uses for its own scheduler. Gated
//! behind the `diagnostics` feature (Unix-only, since `signal_hook`'s
//! low-level registration is).
//!
//! Because `State` is owned per-embedding (there is no single global VM
//! instance the way the host has a single global scheduler), the numbers
//! dumped here are global atomics that `State` updates at the points
//! where it would otherwise be cheap to do so: after each GC pulse and on
//! every call/return. A process embedding more than one `State` sees
//! their combined totals, which is an acceptable tradeoff for a signal
//! handler meant for "is anything stuck" debugging, not per-instance
//! accounting.

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Once;

static SIGNAL_HANDLER_INIT: Once = Once::new();

pub static ACTIVE_CALL_DEPTH: AtomicI64 = AtomicI64::new(0);
pub static GC_CYCLES_RUN: AtomicU64 = AtomicU64::new(0);
pub static GC_OBJECTS_FREED: AtomicU64 = AtomicU64::new(0);
pub static HEAP_LIVE_OBJECTS: AtomicU64 = AtomicU64::new(0);

/// Installs the SIGQUIT handler. Safe to call more than once (idempotent,
/// like `install_signal_handler` elsewhere in this codebase); a no-op off
/// Unix and without the `diagnostics` feature.
pub fn install_signal_handler() {
    SIGNAL_HANDLER_INIT.call_once(|| {
        #[cfg(all(unix, feature = "diagnostics"))]
        {
            unsafe {
                let _ = signal_hook::low_level::register(signal_hook::consts::SIGQUIT, || {
                    dump_diagnostics();
                });
            }
        }

        #[cfg(not(all(unix, feature = "diagnostics")))]
        {
            // No signal support; diagnostics can still be dumped directly.
        }
    });
}

/// Dumps current VM diagnostics to stderr. Callable directly (e.g. from
/// `su-cli`'s `--dump` flag) or via the installed SIGQUIT handler.
pub fn dump_diagnostics() {
    use std::io::Write;

    let mut out = std::io::stderr().lock();

    let _ = writeln!(out, "\n=== Saurus VM Diagnostics ===");
    let _ = writeln!(out, "\n[Calls]");
    let _ = writeln!(
        out,
        "  Active call depth: {}",
        ACTIVE_CALL_DEPTH.load(Ordering::Relaxed)
    );
    let _ = writeln!(out, "\n[GC]");
    let _ = writeln!(
        out,
        "  Cycles run: {}",
        GC_CYCLES_RUN.load(Ordering::Relaxed)
    );
    let _ = writeln!(
        out,
        "  Objects freed (lifetime): {}",
        GC_OBJECTS_FREED.load(Ordering::Relaxed)
    );
    let _ = writeln!(
        out,
        "  Live heap objects (last sample): {}",
        HEAP_LIVE_OBJECTS.load(Ordering::Relaxed)
    );
    let _ = writeln!(out, "\n=== End Diagnostics ===\n");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::State;
    use serial_test::serial;

    #[test]
    fn dump_diagnostics_does_not_panic() {
        dump_diagnostics();
    }

    #[test]
    fn install_signal_handler_is_idempotent() {
        install_signal_handler();
        install_signal_handler();
    }

    /// These globals are process-wide, so asserting on them only holds up
    /// if no other test's `State` is running a GC cycle concurrently.
    #[test]
    #[serial]
    fn gc_full_publishes_its_cycle_count() {
        let before = GC_CYCLES_RUN.load(Ordering::Relaxed);
        let mut s = State::new();
        s.gc_full();
        assert_eq!(GC_CYCLES_RUN.load(Ordering::Relaxed), before + 1);
    }
}
