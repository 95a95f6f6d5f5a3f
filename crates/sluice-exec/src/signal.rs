//! Signal delivery to managed subprocesses.

#[cfg(unix)]
fn send(pid: i32, signal: nix::sys::signal::Signal) {
  use nix::sys::signal::kill;
  use nix::unistd::Pid;
  if let Err(err) = kill(Pid::from_raw(pid), signal) {
    tracing::debug!(pid, %signal, error = %err, "signal delivery failed");
  }
}

/// Polite termination (SIGTERM).
pub(crate) fn terminate(pid: i32) {
  #[cfg(unix)]
  send(pid, nix::sys::signal::Signal::SIGTERM);
  #[cfg(not(unix))]
  let _ = pid;
}

/// Interrupt (SIGINT); never kills the process.
pub(crate) fn interrupt(pid: i32) {
  #[cfg(unix)]
  send(pid, nix::sys::signal::Signal::SIGINT);
  #[cfg(not(unix))]
  let _ = pid;
}

/// Forceful kill (SIGKILL).
pub(crate) fn kill(pid: i32) {
  #[cfg(unix)]
  send(pid, nix::sys::signal::Signal::SIGKILL);
  #[cfg(not(unix))]
  let _ = pid;
}
