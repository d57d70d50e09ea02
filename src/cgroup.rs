use std::fs::{self, DirBuilder};
use std::os::unix::fs::DirBuilderExt;
use std::path::{Path, PathBuf};
use std::thread::sleep;
use std::time::Duration;

use log::{debug, info, warn};
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;

use crate::config::CorralOption;
use crate::CorralError;

pub const CGROUP_MOUNT_PATH: &str = "/sys/fs/cgroup";

const KILL_ROUNDS: u32 = 10;

/// One resolved controller directory under the cgroup mount
struct ControllerDir {
  name: String,
  base: PathBuf,
  dir: PathBuf,
  procfile: PathBuf,
  settings: Vec<(String, String)>,
  created: bool,
}

/// The set of cgroup directories this process owns
pub struct CorralCgroup {
  dirs: Vec<ControllerDir>,
}

fn resolve(root: &Path, option: &CorralOption) -> Vec<ControllerDir> {
  let Some(path) = option.path() else {
    return vec![];
  };
  option
    .controllers()
    .iter()
    .map(|controller| {
      let base = root.join(controller.name());
      let dir = base.join(path);
      let procfile = dir.join("cgroup.procs");
      ControllerDir {
        name: controller.name().to_string(),
        base,
        dir,
        procfile,
        settings: controller.settings().clone(),
        created: false,
      }
    })
    .collect()
}

impl CorralCgroup {
  pub fn new(option: &CorralOption) -> Self {
    CorralCgroup {
      dirs: resolve(Path::new(CGROUP_MOUNT_PATH), option),
    }
  }

  /// Create every controller directory. The mount root and the controller
  /// root are assumed to exist already; the leaf must not.
  pub fn create(&mut self) -> Result<(), CorralError> {
    for controller in self.dirs.iter_mut() {
      if !controller.base.is_dir() {
        return Err(CorralError::cgroup(format!(
          "Controller root '{}' does not exist. Is the '{}' controller mounted?",
          controller.base.display(),
          controller.name
        )));
      }
      if controller.dir.exists() {
        return Err(CorralError::cgroup(format!(
          "'{}' already exists. Please specify a deeper path or clean up the cgroup",
          controller.dir.display()
        )));
      }
      debug!("Create cgroup: mkdir -p {}", controller.dir.display());
      if let Err(err) = DirBuilder::new()
        .recursive(true)
        .mode(0o755)
        .create(&controller.dir)
      {
        return Err(CorralError::cgroup(format!(
          "Couldn't create '{}'. Check permissions. ({})",
          controller.dir.display(),
          err
        )));
      }
      controller.created = true;
    }
    Ok(())
  }

  /// Write every controller setting file, in declaration order
  pub fn apply_settings(&self) -> Result<(), CorralError> {
    for controller in self.dirs.iter() {
      for (key, value) in controller.settings.iter() {
        let setting_file = controller.dir.join(key);
        debug!("Write {} = {}", setting_file.display(), value);
        if let Err(err) = fs::write(&setting_file, value) {
          return Err(CorralError::cgroup(format!(
            "Error writing '{}' to '{}' ({})",
            value,
            setting_file.display(),
            err
          )));
        }
      }
    }
    Ok(())
  }

  /// Move a pid into every controller
  pub fn attach(&self, pid: Pid) -> Result<(), CorralError> {
    for controller in self.dirs.iter() {
      if let Err(err) = fs::write(&controller.procfile, pid.to_string()) {
        return Err(CorralError::cgroup(format!(
          "Can't add pid to {} ({})",
          controller.procfile.display(),
          err
        )));
      }
      debug!("Moved pid {} into {}", pid, controller.dir.display());
    }
    Ok(())
  }

  /// All pids currently listed in any controller procfile. A missing
  /// procfile reads as empty.
  pub fn member_pids(&self) -> Vec<Pid> {
    let mut pids = vec![];
    for controller in self.dirs.iter() {
      let Ok(text) = fs::read_to_string(&controller.procfile) else {
        continue;
      };
      for token in text.split_whitespace() {
        if let Ok(pid) = token.parse::<i32>() {
          pids.push(Pid::from_raw(pid));
        }
      }
    }
    pids
  }

  pub fn has_members(&self) -> bool {
    !self.member_pids().is_empty()
  }

  /// Signal every pid listed in the procfiles, ignoring per pid errors
  pub fn kill_members(&self, signal: Signal) {
    for pid in self.member_pids() {
      debug!("kill -{} {}", signal, pid);
      let _ = kill(pid, signal);
    }
  }

  /// Repeatedly SIGKILL whatever the procfiles still list. Two bounded
  /// bursts, the first with a short sleep between rounds.
  pub fn reap_members(&self) {
    let mut retries = KILL_ROUNDS;
    while retries > 0 && self.has_members() {
      self.kill_members(Signal::SIGKILL);
      sleep(Duration::from_micros(1000));
      retries -= 1;
    }

    if retries == 0 {
      // Hammer the remaining processes as a final attempt (no waiting this time)
      retries = KILL_ROUNDS;
      while retries > 0 && self.has_members() {
        self.kill_members(Signal::SIGKILL);
        retries -= 1;
      }

      if retries == 0 {
        warn!("Failed to kill all cgroup members even after retrying");
      }
    }
  }

  /// Remove the leaf directories. Only the leaf is removed since deeper
  /// bookkeeping is not kept; errors are ignored so teardown stays
  /// idempotent.
  pub fn destroy(&self) {
    for controller in self.dirs.iter() {
      if !controller.created {
        continue;
      }
      info!("rmdir {}", controller.dir.display());
      let _ = fs::remove_dir(&controller.dir);
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use tempfile::tempdir;

  use crate::CorralBuilder;

  fn option(controllers: Vec<(&str, Vec<&str>)>) -> CorralOption {
    let mut builder = CorralBuilder::new().path("scope/job1").unwrap();
    for (name, settings) in controllers {
      builder = builder.controller(name);
      for setting in settings {
        builder = builder.set(setting).unwrap();
      }
    }
    builder
      .command("/bin/true", Vec::<String>::new())
      .build()
      .unwrap()
  }

  fn cgroup_at(root: &Path, option: &CorralOption) -> CorralCgroup {
    CorralCgroup {
      dirs: resolve(root, option),
    }
  }

  #[test]
  fn it_should_create_nested_dirs() {
    let root = tempdir().unwrap();
    fs::create_dir(root.path().join("memory")).unwrap();

    let option = option(vec![("memory", vec![])]);
    let mut cgroup = cgroup_at(root.path(), &option);
    cgroup.create().unwrap();

    assert!(root.path().join("memory/scope/job1").is_dir());
  }

  #[test]
  fn it_should_refuse_existing_leaf() {
    let root = tempdir().unwrap();
    let leaf = root.path().join("memory/scope/job1");
    fs::create_dir_all(&leaf).unwrap();
    fs::write(leaf.join("marker"), "keep").unwrap();

    let option = option(vec![("memory", vec![])]);
    let mut cgroup = cgroup_at(root.path(), &option);
    assert!(cgroup.create().is_err());

    // The pre-existing cgroup is left untouched, including by destroy()
    cgroup.destroy();
    assert_eq!(fs::read_to_string(leaf.join("marker")).unwrap(), "keep");
  }

  #[test]
  fn it_should_refuse_missing_controller_root() {
    let root = tempdir().unwrap();

    let option = option(vec![("memory", vec![])]);
    let mut cgroup = cgroup_at(root.path(), &option);
    assert!(cgroup.create().is_err());
  }

  #[test]
  fn it_should_write_settings_in_order() {
    let root = tempdir().unwrap();
    fs::create_dir(root.path().join("memory")).unwrap();

    // The same key twice: the later declaration must win
    let option = option(vec![(
      "memory",
      vec![
        "memory.limit_in_bytes=1048576",
        "memory.swappiness=0",
        "memory.limit_in_bytes=2097152",
      ],
    )]);
    let mut cgroup = cgroup_at(root.path(), &option);
    cgroup.create().unwrap();
    cgroup.apply_settings().unwrap();

    let dir = root.path().join("memory/scope/job1");
    assert_eq!(
      fs::read_to_string(dir.join("memory.limit_in_bytes")).unwrap(),
      "2097152"
    );
    assert_eq!(fs::read_to_string(dir.join("memory.swappiness")).unwrap(), "0");
  }

  #[test]
  fn it_should_attach_and_list_pids() {
    let root = tempdir().unwrap();
    fs::create_dir(root.path().join("cpu")).unwrap();

    let option = option(vec![("cpu", vec![])]);
    let mut cgroup = cgroup_at(root.path(), &option);
    cgroup.create().unwrap();

    cgroup.attach(Pid::from_raw(4321)).unwrap();
    assert_eq!(cgroup.member_pids(), vec![Pid::from_raw(4321)]);
    assert!(cgroup.has_members());
  }

  #[test]
  fn it_should_parse_whitespace_separated_pids() {
    let root = tempdir().unwrap();
    fs::create_dir_all(root.path().join("pids/scope/job1")).unwrap();
    fs::write(root.path().join("pids/scope/job1/cgroup.procs"), "12 34\n56\n").unwrap();

    let option = option(vec![("pids", vec![])]);
    let cgroup = cgroup_at(root.path(), &option);
    assert_eq!(
      cgroup.member_pids(),
      vec![Pid::from_raw(12), Pid::from_raw(34), Pid::from_raw(56)]
    );
  }

  #[test]
  fn it_should_read_missing_procfile_as_empty() {
    let root = tempdir().unwrap();

    let option = option(vec![("memory", vec![])]);
    let cgroup = cgroup_at(root.path(), &option);
    assert!(cgroup.member_pids().is_empty());
    assert!(!cgroup.has_members());
  }

  #[test]
  fn it_should_destroy_idempotently() {
    let root = tempdir().unwrap();
    fs::create_dir(root.path().join("memory")).unwrap();

    let option = option(vec![("memory", vec![])]);
    let mut cgroup = cgroup_at(root.path(), &option);
    cgroup.create().unwrap();

    cgroup.destroy();
    assert!(!root.path().join("memory/scope/job1").exists());
    cgroup.destroy();
  }
}
