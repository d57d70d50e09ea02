use std::{
  error::Error,
  fmt::{Debug, Display},
  process::{ExitCode, Termination},
};

use flexi_logger::FlexiLoggerError;
use nix::{errno::Errno, libc::STDERR_FILENO, unistd::isatty};

pub enum CorralError {
  Cli(String),
  Cgroup(String),
  Fork(String),
  Signal(String),
  Nix(Errno),
  Fs(String),
  Logger(FlexiLoggerError),
}

pub enum CorralExit {
  Code(u8),
  Err(CorralError),
}

impl CorralError {
  pub fn cli<MS: Into<String>>(msg: MS) -> CorralError {
    CorralError::Cli(msg.into())
  }

  pub fn cgroup<MS: Into<String>>(msg: MS) -> CorralError {
    CorralError::Cgroup(msg.into())
  }

  pub fn fork<MS: Into<String>>(msg: MS) -> CorralError {
    CorralError::Fork(msg.into())
  }

  pub fn signal<MS: Into<String>>(msg: MS) -> CorralError {
    CorralError::Signal(msg.into())
  }
}

impl Debug for CorralError {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    std::fmt::Display::fmt(&self, f)
  }
}

impl Display for CorralError {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    match &self {
      CorralError::Cli(msg) => f.write_fmt(format_args!("Corral CLI Error: {}", msg)),
      CorralError::Cgroup(msg) => f.write_fmt(format_args!("Corral Cgroup Error: {}", msg)),
      CorralError::Fork(msg) => f.write_fmt(format_args!("Corral Fork Error: {}", msg)),
      CorralError::Signal(msg) => f.write_fmt(format_args!("Corral Signal Error: {}", msg)),
      CorralError::Nix(errno) => f.write_fmt(format_args!("Corral Nix Error: {}", errno)),
      CorralError::Fs(msg) => f.write_fmt(format_args!("Corral File System Error: {}", msg)),
      CorralError::Logger(err) => f.write_fmt(format_args!("Corral Logger Error: {}", err)),
    }
  }
}

impl From<Errno> for CorralError {
  fn from(errno: Errno) -> Self {
    CorralError::Nix(errno)
  }
}

impl From<std::io::Error> for CorralError {
  fn from(err: std::io::Error) -> Self {
    CorralError::Fs(err.to_string())
  }
}

impl From<FlexiLoggerError> for CorralError {
  fn from(err: FlexiLoggerError) -> Self {
    CorralError::Logger(err)
  }
}

impl Error for CorralError {}

impl Termination for CorralExit {
  fn report(self) -> ExitCode {
    match self {
      CorralExit::Code(code) => ExitCode::from(code).report(),
      CorralExit::Err(err) => {
        let text = format!("{}", err);
        let text = match text.split_once(": ") {
          Some((prefix, message)) => {
            let is_tty = isatty(STDERR_FILENO).unwrap_or(false);
            if is_tty {
              format!("\x1b[1m\x1b[91m{}\x1b[39m\x1b[22m  {}", prefix, message)
            } else {
              format!("{}: {}", prefix, message)
            }
          }
          None => {
            format!("{}", err)
          }
        };
        eprintln!("{}", text);
        ExitCode::FAILURE.report()
      }
    }
  }
}
