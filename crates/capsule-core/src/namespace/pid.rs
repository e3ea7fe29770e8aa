//! PID namespace isolation.
//!
//! A new PID namespace only applies to children forked after `unshare(2)`.
//! The first such child becomes PID 1: it owns the namespace, reaps every
//! orphan reparented to it, and must forward termination signals since
//! PID 1 ignores signals it has no handler for.

use std::sync::atomic::{AtomicI32, Ordering};

use capsule_common::error::NamespaceError;
use nix::errno::Errno;
use nix::sys::signal::{self, SaFlags, SigAction, SigHandler, SigSet, Signal};
use nix::sys::wait::{WaitStatus, waitpid};
use nix::unistd::{ForkResult, Pid, fork};

/// Signals relayed from the orchestrating process down to the target.
pub const FORWARDED_SIGNALS: [Signal; 6] = [
    Signal::SIGTERM,
    Signal::SIGINT,
    Signal::SIGHUP,
    Signal::SIGQUIT,
    Signal::SIGUSR1,
    Signal::SIGUSR2,
];

static FORWARD_TARGET: AtomicI32 = AtomicI32::new(0);

extern "C" fn forward_signal(signo: libc::c_int) {
    let target = FORWARD_TARGET.load(Ordering::SeqCst);
    if target > 0 {
        // SAFETY: kill(2) is async-signal-safe and takes no pointers.
        let _ = unsafe { libc::kill(target, signo) };
    }
}

/// Forks a child that runs `body` and exits with its return value.
///
/// Returns the child's PID in the parent. When called after the PID
/// namespace was unshared, the child is PID 1 of that namespace.
///
/// # Errors
///
/// Returns [`NamespaceError::InitProcessRequired`] if `fork(2)` fails.
pub fn spawn_child<F>(body: F) -> Result<Pid, NamespaceError>
where
    F: FnOnce() -> i32,
{
    // SAFETY: the engine is single-threaded while staging a launch, so the
    // child inherits no locks held by other threads.
    match unsafe { fork() } {
        Ok(ForkResult::Parent { child }) => {
            tracing::debug!(child = child.as_raw(), "namespace child forked");
            Ok(child)
        }
        Ok(ForkResult::Child) => {
            let code = body();
            std::process::exit(code);
        }
        Err(e) => Err(NamespaceError::InitProcessRequired {
            reason: format!("fork failed: {e}"),
        }),
    }
}

/// Converts a wait status into a shell-style exit code.
///
/// Signals map to `128 + signal`; stop/continue events yield `None`.
#[must_use]
pub fn exit_code(status: WaitStatus) -> Option<i32> {
    match status {
        WaitStatus::Exited(_, code) => Some(code),
        WaitStatus::Signaled(_, sig, _) => Some(128 + sig as i32),
        _ => None,
    }
}

/// Installs handlers relaying [`FORWARDED_SIGNALS`] to `target`.
///
/// # Errors
///
/// Returns [`NamespaceError::Supervise`] if `sigaction(2)` fails.
pub fn forward_signals_to(target: Pid) -> Result<(), NamespaceError> {
    FORWARD_TARGET.store(target.as_raw(), Ordering::SeqCst);
    let action = SigAction::new(
        SigHandler::Handler(forward_signal),
        SaFlags::SA_RESTART,
        SigSet::empty(),
    );
    for sig in FORWARDED_SIGNALS {
        // SAFETY: the handler only performs an atomic load and kill(2).
        let _ = unsafe { signal::sigaction(sig, &action) }
            .map_err(|source| NamespaceError::Supervise { source })?;
    }
    Ok(())
}

/// Stops relaying signals; handlers installed by [`forward_signals_to`]
/// become no-ops.
pub fn stop_forwarding() {
    FORWARD_TARGET.store(0, Ordering::SeqCst);
}

/// Reaps every child until `target` exits, returning its exit code.
///
/// Used by PID 1: orphans reparented to it are collected along the way.
/// Once the target is gone the namespace is torn down with init.
///
/// # Errors
///
/// Returns [`NamespaceError::Supervise`] if `waitpid(2)` fails, or if no
/// children remain before the target was seen exiting.
pub fn reap_until(target: Pid) -> Result<i32, NamespaceError> {
    loop {
        match waitpid(Pid::from_raw(-1), None) {
            Ok(status) => {
                if status.pid() == Some(target) {
                    if let Some(code) = exit_code(status) {
                        tracing::debug!(pid = target.as_raw(), code, "target exited");
                        return Ok(code);
                    }
                } else if let Some(pid) = status.pid() {
                    tracing::trace!(pid = pid.as_raw(), "reaped orphan");
                }
            }
            Err(Errno::EINTR) => {}
            Err(source) => return Err(NamespaceError::Supervise { source }),
        }
    }
}

/// Waits for `child` from the orchestrating process.
///
/// SIGINT, SIGTERM, and SIGHUP delivered to the orchestrator are relayed
/// to the child as SIGTERM.
///
/// # Errors
///
/// Returns [`NamespaceError::Supervise`] if `waitpid(2)` fails.
pub fn supervise(child: Pid) -> Result<i32, NamespaceError> {
    if let Err(e) = ctrlc::set_handler(move || {
        let _ = signal::kill(child, Signal::SIGTERM);
    }) {
        tracing::warn!(error = %e, "termination forwarding unavailable");
    }

    loop {
        match waitpid(child, None) {
            Ok(status) => {
                if let Some(code) = exit_code(status) {
                    tracing::debug!(pid = child.as_raw(), code, "namespace child exited");
                    return Ok(code);
                }
            }
            Err(Errno::EINTR) => {}
            Err(source) => return Err(NamespaceError::Supervise { source }),
        }
    }
}

/// Kills `child` and collects it; used on the abort path.
pub fn terminate(child: Pid) {
    if let Err(e) = signal::kill(child, Signal::SIGKILL) {
        tracing::debug!(pid = child.as_raw(), error = %e, "child already gone");
        return;
    }
    let _ = waitpid(child, None);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exit_code_passes_status_through() {
        let pid = Pid::from_raw(42);
        assert_eq!(exit_code(WaitStatus::Exited(pid, 0)), Some(0));
        assert_eq!(exit_code(WaitStatus::Exited(pid, 7)), Some(7));
    }

    #[test]
    fn exit_code_maps_signals_to_128_plus() {
        let pid = Pid::from_raw(42);
        assert_eq!(
            exit_code(WaitStatus::Signaled(pid, Signal::SIGKILL, false)),
            Some(137)
        );
        assert_eq!(
            exit_code(WaitStatus::Signaled(pid, Signal::SIGTERM, true)),
            Some(143)
        );
        assert_eq!(exit_code(WaitStatus::StillAlive), None);
    }
}
