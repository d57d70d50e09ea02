use std::ffi::CString;

use nix::unistd::{Gid, Group, Uid, User};

use crate::utils::{into_c_string, GidType, UidType};
use crate::CorralError;

/// Longest SIGTERM to SIGKILL delay that may be requested (one second).
pub const MAX_GRACE_MICROS: u64 = 1_000_000;

const DEFAULT_GRACE_MICROS: u64 = 1000;

/// One cgroup controller declaration: its name and the settings to be
/// written into the controller directory, in declaration order.
#[derive(Debug, Clone)]
pub struct Controller {
  name: String,
  settings: Vec<(String, String)>,
}

/// Corral running option that configs its behavior
#[derive(Debug, Clone)]
pub struct CorralOption {
  path: Option<String>,
  controllers: Vec<Controller>,
  grace_micros: u64,
  uid: Option<Uid>,
  gid: Option<Gid>,
  program: String,
  arguments: Vec<String>,
}

/// Build CorralOption from command line shaped input
pub struct CorralBuilder {
  path: Option<String>,
  controllers: Vec<Controller>,
  grace_micros: u64,
  uid: Option<Uid>,
  gid: Option<Gid>,
  program: Option<String>,
  arguments: Vec<String>,
}

impl Controller {
  pub fn name(&self) -> &str {
    &self.name
  }

  pub fn settings(&self) -> &Vec<(String, String)> {
    &self.settings
  }
}

impl CorralBuilder {
  pub fn new() -> Self {
    CorralBuilder {
      path: None,
      controllers: vec![],
      grace_micros: DEFAULT_GRACE_MICROS,
      uid: None,
      gid: None,
      program: None,
      arguments: vec![],
    }
  }

  /// Set the shared cgroup sub path
  pub fn path<PS: Into<String>>(mut self, path: PS) -> Result<Self, CorralError> {
    if self.path.is_some() {
      return Err(CorralError::cli("Only one cgroup path is supported"));
    }
    self.path = Some(path.into());
    Ok(self)
  }

  /// Declare a cgroup controller; later settings attach to it
  pub fn controller<NS: Into<String>>(mut self, name: NS) -> Self {
    self.controllers.push(Controller {
      name: name.into(),
      settings: vec![],
    });
    self
  }

  /// Attach a KEY=VALUE setting to the most recently declared controller
  pub fn set<TS: AsRef<str>>(mut self, text: TS) -> Result<Self, CorralError> {
    let Some(controller) = self.controllers.last_mut() else {
      return Err(CorralError::cli(
        "Declare a cgroup controller (-c) before setting a variable",
      ));
    };
    let text = text.as_ref();
    let Some((key, value)) = text.split_once('=') else {
      return Err(CorralError::cli(format!(
        "No '=' found when setting a variable: '{}'",
        text
      )));
    };
    controller.settings.push((key.to_string(), value.to_string()));
    Ok(self)
  }

  /// Set the SIGTERM to SIGKILL delay in microseconds
  pub fn grace_micros(mut self, micros: u64) -> Result<Self, CorralError> {
    if micros > MAX_GRACE_MICROS {
      return Err(CorralError::cli(
        "Delay to sending a SIGKILL must be at most 1,000,000 (1 second)",
      ));
    }
    self.grace_micros = micros;
    Ok(self)
  }

  /// Set the uid to drop to, by decimal id or by user name
  pub fn uid<TS: AsRef<str>>(mut self, text: TS) -> Result<Self, CorralError> {
    let text = text.as_ref();
    let uid = match text.parse::<UidType>() {
      Ok(id) => Uid::from_raw(id),
      Err(_) => match User::from_name(text)? {
        Some(user) => user.uid,
        None => return Err(CorralError::cli(format!("Unknown user '{}'", text))),
      },
    };
    if uid.is_root() {
      return Err(CorralError::cli(
        "Setting the user to root or uid 0 is not allowed",
      ));
    }
    self.uid = Some(uid);
    Ok(self)
  }

  /// Set the gid to drop to, by decimal id or by group name
  pub fn gid<TS: AsRef<str>>(mut self, text: TS) -> Result<Self, CorralError> {
    let text = text.as_ref();
    let gid = match text.parse::<GidType>() {
      Ok(id) => Gid::from_raw(id),
      Err(_) => match Group::from_name(text)? {
        Some(group) => group.gid,
        None => return Err(CorralError::cli(format!("Unknown group '{}'", text))),
      },
    };
    if gid.as_raw() == 0 {
      return Err(CorralError::cli(
        "Setting the group to root or gid 0 is not allowed",
      ));
    }
    self.gid = Some(gid);
    Ok(self)
  }

  /// Set the program to run and its arguments
  pub fn command<PS: Into<String>, AS: Into<String>>(
    mut self,
    program: PS,
    arguments: Vec<AS>,
  ) -> Self {
    self.program = Some(program.into());
    self.arguments = arguments.into_iter().map(|a| a.into()).collect();
    self
  }

  /// Validate cross field invariants and freeze the option
  pub fn build(self) -> Result<CorralOption, CorralError> {
    let Some(program) = self.program else {
      return Err(CorralError::cli("Specify a program to run"));
    };
    if self.path.is_none() && !self.controllers.is_empty() {
      return Err(CorralError::cli("Specify a cgroup path (-p)"));
    }
    if self.path.is_some() && self.controllers.is_empty() {
      return Err(CorralError::cli(
        "Specify a cgroup controller (-c) if you specify a path",
      ));
    }
    Ok(CorralOption {
      path: self.path,
      controllers: self.controllers,
      grace_micros: self.grace_micros,
      uid: self.uid,
      gid: self.gid,
      program,
      arguments: self.arguments,
    })
  }
}

impl CorralOption {
  /// Shortcut for an option without any cgroup work
  pub fn new<PS: Into<String>, AS: Into<String>>(program: PS, arguments: Vec<AS>) -> Self {
    CorralOption {
      path: None,
      controllers: vec![],
      grace_micros: DEFAULT_GRACE_MICROS,
      uid: None,
      gid: None,
      program: program.into(),
      arguments: arguments.into_iter().map(|a| a.into()).collect(),
    }
  }

  pub fn path(&self) -> Option<&str> {
    self.path.as_deref()
  }

  pub fn controllers(&self) -> &Vec<Controller> {
    &self.controllers
  }

  pub fn grace_micros(&self) -> u64 {
    self.grace_micros
  }

  pub fn uid(&self) -> Option<Uid> {
    self.uid
  }

  pub fn gid(&self) -> Option<Gid> {
    self.gid
  }

  pub fn program(&self) -> CString {
    into_c_string(&self.program)
  }

  pub fn program_name(&self) -> &str {
    &self.program
  }

  pub fn arguments(&self) -> Vec<CString> {
    self.arguments.iter().map(|p| into_c_string(p)).collect()
  }
}
