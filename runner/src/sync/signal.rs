use super::Cancellation;
use nix::sys::signal::{SigSet, Signal};
use std::thread;
use tracing::{error, info, warn};

fn termination_signals() -> SigSet {
    let mut signals = SigSet::empty();
    signals.add(Signal::SIGINT);
    signals.add(Signal::SIGTERM);

    signals
}

/// route SIGINT and SIGTERM to `cancellation`
///
/// Must be called before any other thread is spawned, threads inherit the blocked signal mask
/// which leaves the listener as the only receiver. A second signal while already cancelled
/// terminates the process immediately.
pub fn listen(cancellation: Cancellation) -> std::io::Result<()> {
    let signals = termination_signals();
    signals.thread_block()?;

    thread::Builder::new()
        .name("signal".to_owned())
        .spawn(move || loop {
            match signals.wait() {
                Ok(signal) if cancellation.is_cancelled() => {
                    warn!(signal = ?signal, "Received second termination signal, exiting now");
                    std::process::exit(130);
                }
                Ok(signal) => {
                    info!(
                        signal = ?signal,
                        "Received termination signal, stopping after the current benchmark"
                    );
                    cancellation.cancel();
                }
                Err(error) => {
                    error!(error = ?error, "Failed to wait for signals: {error}");
                    break;
                }
            }
        })?;

    Ok(())
}
