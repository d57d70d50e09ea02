use std::thread::sleep;
use std::time::Duration;

use log::{debug, error, info};
use nix::errno::Errno;
use nix::libc::{self, STDIN_FILENO, STDOUT_FILENO};
use nix::poll::{poll, PollFd, PollFlags};
use nix::sys::signal::{kill, Signal};
use nix::sys::wait::{wait, WaitStatus};
use nix::unistd::{execvp, fork, getpid, setgid, setuid, ForkResult, Pid};

use crate::cgroup::CorralCgroup;
use crate::config::CorralOption;
use crate::signal::SignalPipe;
use crate::CorralError;

const EXIT_FAILURE: u8 = 1;

/// Ties signal disarm, descendant reaping and cgroup removal to every exit
/// path of run(). Dropped exactly once, whether run() returns a code or
/// propagates an error.
struct CleanupGuard {
  signals: SignalPipe,
  cgroup: CorralCgroup,
}

impl Drop for CleanupGuard {
  fn drop(&mut self) {
    debug!("cleaning up");
    self.signals.disarm();
    self.cgroup.reap_members();
    self.cgroup.destroy();
    debug!("cleanup done");
  }
}

enum Verdict {
  Exited(u8),
  HostClosed,
  Signalled,
}

/// Spawn the program inside the configured cgroups and supervise it until
/// the child dies, the host disappears or a termination signal arrives.
/// Returns the exit code this process should report.
pub fn run(option: &CorralOption) -> Result<u8, CorralError> {
  let signals = SignalPipe::install()?;
  let mut guard = CleanupGuard {
    signals,
    cgroup: CorralCgroup::new(option),
  };

  guard.cgroup.create()?;
  guard.cgroup.apply_settings()?;

  let child = spawn(option, &guard.cgroup)?;
  info!("Start running child process (pid = {})", child);

  match supervise(child, &guard.signals, option.grace_micros())? {
    Verdict::Exited(code) => Ok(code),
    Verdict::HostClosed => Ok(0),
    Verdict::Signalled => Ok(EXIT_FAILURE),
  }
}

fn spawn(option: &CorralOption, cgroup: &CorralCgroup) -> Result<Pid, CorralError> {
  match unsafe { fork() } {
    Ok(ForkResult::Parent { child, .. }) => Ok(child),
    Ok(ForkResult::Child) => {
      // Join the cgroups before arbitrary code gets to run
      if let Err(err) = cgroup.attach(getpid()) {
        error!("{}", err);
        unsafe { libc::_exit(libc::EXIT_FAILURE) };
      }

      // gid first: once the real uid is dropped, changing groups may no
      // longer be permitted
      if let Some(gid) = option.gid() {
        if let Err(err) = setgid(gid) {
          error!("Set gid {} fails: {}", gid, err);
          unsafe { libc::_exit(libc::EXIT_FAILURE) };
        }
      }
      if let Some(uid) = option.uid() {
        if let Err(err) = setuid(uid) {
          error!("Set uid {} fails: {}", uid, err);
          unsafe { libc::_exit(libc::EXIT_FAILURE) };
        }
      }

      let program = option.program();
      let args = [vec![program.clone()], option.arguments()].concat();
      let result = execvp(&program, args.as_slice());
      if let Err(err) = result {
        error!("Execvp {} fails: {}", option.program_name(), err.desc());
      }
      unsafe { libc::_exit(libc::EXIT_FAILURE) };
    }
    Err(errno) => Err(CorralError::fork(format!("Fork failed: {}", errno))),
  }
}

/// Poll the host pipes and the signal pipe until something decides the
/// helper's fate
fn supervise(
  child: Pid,
  signals: &SignalPipe,
  grace_micros: u64,
) -> Result<Verdict, CorralError> {
  let mut fds = [
    PollFd::new(STDIN_FILENO, PollFlags::POLLHUP),
    PollFd::new(signals.read_fd(), PollFlags::POLLIN),
    PollFd::new(STDOUT_FILENO, PollFlags::POLLHUP),
  ];

  loop {
    match poll(&mut fds, -1) {
      Ok(_) => {}
      Err(Errno::EINTR) => continue,
      Err(errno) => return Err(errno.into()),
    }

    let stdin_woke = fds[0].revents().map_or(false, |r| !r.is_empty());
    let stdout_woke = fds[2].revents().map_or(false, |r| !r.is_empty());
    if stdin_woke || stdout_woke {
      info!(
        "{} closed, shutting down",
        if stdin_woke { "stdin" } else { "stdout" }
      );
      kill_child_nicely(child, grace_micros);
      return Ok(Verdict::HostClosed);
    }

    if fds[1]
      .revents()
      .map_or(false, |r| r.contains(PollFlags::POLLIN))
    {
      match signals.next()? {
        Signal::SIGCHLD => {
          if let Some(verdict) = reap_child(child) {
            return Ok(verdict);
          }
        }
        Signal::SIGTERM | Signal::SIGQUIT | Signal::SIGINT => {
          info!("Received a termination signal, shutting down");
          return Ok(Verdict::Signalled);
        }
        signal => {
          return Err(CorralError::signal(format!("Unexpected signal: {}", signal)));
        }
      }
    }
  }
}

fn reap_child(child: Pid) -> Option<Verdict> {
  match wait() {
    Ok(WaitStatus::Exited(pid, code)) if pid == child => {
      info!("Child process #{}. exited with status {}", pid, code);
      Some(Verdict::Exited(code as u8))
    }
    Ok(WaitStatus::Signaled(pid, signal, _)) if pid == child => {
      info!("Child process #{}. is signaled by {}", pid, signal);
      Some(Verdict::Exited(EXIT_FAILURE))
    }
    Ok(status) => {
      info!("Some other process caused SIGCHLD: {:?}", status);
      None
    }
    Err(errno) => {
      info!("Nothing to reap after SIGCHLD: {}", errno);
      None
    }
  }
}

/// SIGTERM, a bounded grace period, then SIGKILL. The direct child only;
/// descendants are reaped through the cgroup procfiles during cleanup.
fn kill_child_nicely(child: Pid, grace_micros: u64) {
  let _ = kill(child, Signal::SIGTERM);
  if grace_micros > 0 {
    sleep(Duration::from_micros(grace_micros));
  }
  let _ = kill(child, Signal::SIGKILL);
}
