use std::mem::size_of;
use std::os::unix::prelude::RawFd;
use std::sync::atomic::{AtomicI32, Ordering};

use log::debug;
use nix::fcntl::OFlag;
use nix::libc;
use nix::sys::signal::{sigaction, SaFlags, SigAction, SigHandler, SigSet, Signal};
use nix::unistd::{close, pipe2, read};

use crate::CorralError;

/// Signals funneled through the pipe into the event loop
const WATCHED_SIGNALS: [Signal; 4] = [
  Signal::SIGCHLD,
  Signal::SIGINT,
  Signal::SIGQUIT,
  Signal::SIGTERM,
];

static SIGNAL_WRITE_FD: AtomicI32 = AtomicI32::new(-1);

extern "C" fn forward_signal(signum: libc::c_int) {
  // Async-signal-safe only: one fixed-width write, no allocation, no locks,
  // failures dropped
  let fd = SIGNAL_WRITE_FD.load(Ordering::Relaxed);
  if fd >= 0 {
    let bytes = signum.to_ne_bytes();
    unsafe {
      libc::write(fd, bytes.as_ptr() as *const libc::c_void, bytes.len());
    }
  }
}

/// Self pipe bridging kernel signal delivery into a pollable fd
pub struct SignalPipe {
  read_fd: RawFd,
  write_fd: RawFd,
}

impl SignalPipe {
  /// Create the pipe, then route the watched signals into it. The pipe
  /// exists before any handler is installed so the handler always has a
  /// valid fd to write to.
  pub fn install() -> Result<Self, CorralError> {
    let (read_fd, write_fd) = pipe2(OFlag::O_CLOEXEC)?;
    SIGNAL_WRITE_FD.store(write_fd, Ordering::SeqCst);

    let action = SigAction::new(
      SigHandler::Handler(forward_signal),
      SaFlags::empty(),
      SigSet::empty(),
    );
    for signal in WATCHED_SIGNALS {
      unsafe { sigaction(signal, &action) }?;
    }

    Ok(SignalPipe { read_fd, write_fd })
  }

  pub fn read_fd(&self) -> RawFd {
    self.read_fd
  }

  /// Read the next delivered signal. Writes of size_of::<c_int>() bytes are
  /// atomic up to PIPE_BUF, so exactly one number is consumed.
  pub fn next(&self) -> Result<Signal, CorralError> {
    let mut buf = [0u8; size_of::<libc::c_int>()];
    let amt = read(self.read_fd, &mut buf)?;
    if amt != buf.len() {
      return Err(CorralError::signal(format!(
        "Short read of {} bytes from the signal pipe",
        amt
      )));
    }
    let signum = libc::c_int::from_ne_bytes(buf);
    let signal = Signal::try_from(signum)
      .map_err(|_| CorralError::signal(format!("Unknown signal number {}", signum)))?;
    debug!("Read {} from the signal pipe", signal);
    Ok(signal)
  }

  /// Restore the default dispositions so teardown cannot be re-entered by a
  /// late signal
  pub fn disarm(&self) {
    let action = SigAction::new(SigHandler::SigDfl, SaFlags::empty(), SigSet::empty());
    for signal in WATCHED_SIGNALS {
      let _ = unsafe { sigaction(signal, &action) };
    }
    SIGNAL_WRITE_FD.store(-1, Ordering::SeqCst);
  }
}

impl Drop for SignalPipe {
  fn drop(&mut self) {
    self.disarm();
    let _ = close(self.write_fd);
    let _ = close(self.read_fd);
  }
}
