//! Persistent event loop.
//!
//! Events are handled strictly one at a time. SIGINT and SIGTERM only set a
//! flag that is checked between passes, so a running pass always completes.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::RecvTimeoutError;
use std::time::Duration;

use nix::sys::signal::{SaFlags, SigAction, SigHandler, SigSet, Signal, sigaction};
use tracing::{info, warn};

use swift_drive_autopilot_core::{Config, Context, EventSource, Reconciler, Result};

static SHUTDOWN: AtomicBool = AtomicBool::new(false);

/// How often the loop wakes up to look at the shutdown flag.
const POLL_INTERVAL: Duration = Duration::from_millis(500);

extern "C" fn request_shutdown(_: nix::libc::c_int) {
    SHUTDOWN.store(true, Ordering::SeqCst);
}

fn install_signal_handlers() {
    let action = SigAction::new(
        SigHandler::Handler(request_shutdown),
        SaFlags::empty(),
        SigSet::empty(),
    );
    for signal in [Signal::SIGINT, Signal::SIGTERM] {
        // SAFETY: the handler only stores to an atomic.
        if let Err(err) = unsafe { sigaction(signal, &action) } {
            warn!("cannot install handler for {signal}: {err}");
        }
    }
}

/// Runs reconciliation passes until a shutdown signal arrives.
///
/// Returns whether the most recent pass completed with errors.
pub fn run(config: Config) -> Result<bool> {
    install_signal_handlers();

    let config = Arc::new(config);
    let events = EventSource::spawn(Arc::clone(&config));
    let mut reconciler = Reconciler::new(Context::new(Config::clone(&config)));
    let mut failed = false;

    while !SHUTDOWN.load(Ordering::SeqCst) {
        match events.recv_timeout(POLL_INTERVAL) {
            Ok(event) => failed = reconciler.handle(&event)?.failed,
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }

    info!("shutting down");
    Ok(failed)
}

/// Runs exactly one pass, for supervisors that re-invoke us per event.
pub fn run_once(config: Config) -> Result<bool> {
    let mut reconciler = Reconciler::new(Context::new(config));
    Ok(reconciler.run_pass()?.failed)
}
