use std::process::{Command, Stdio};
use std::thread::sleep;
use std::time::{Duration, Instant};

use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;

fn corral() -> Command {
  Command::new(env!("CARGO_BIN_EXE_corral"))
}

#[test]
fn it_should_exit_cleanly_when_host_closes_stdin() {
  let mut child = corral()
    .args(["--delay-to-sigkill", "10000", "--", "sleep", "30"])
    .stdin(Stdio::piped())
    .stdout(Stdio::piped())
    .spawn()
    .unwrap();

  sleep(Duration::from_millis(500));
  drop(child.stdin.take());

  let start = Instant::now();
  let status = child.wait().unwrap();

  assert_eq!(status.code(), Some(0));
  // Well before the 30 seconds the child would have slept
  assert!(start.elapsed() < Duration::from_secs(10));
}

#[test]
fn it_should_exit_with_failure_on_sigterm() {
  let mut child = corral()
    .args(["--", "sleep", "5"])
    .stdin(Stdio::piped())
    .stdout(Stdio::piped())
    .spawn()
    .unwrap();

  // Keep the write end of the helper's stdin open ourselves; Child::wait
  // would close it and trigger the hangup path instead
  let stdin = child.stdin.take();

  sleep(Duration::from_millis(500));
  kill(Pid::from_raw(child.id() as i32), Signal::SIGTERM).unwrap();

  let status = child.wait().unwrap();
  assert_eq!(status.code(), Some(1));
  drop(stdin);
}

#[test]
fn it_should_pass_through_exit_codes() {
  let mut child = corral()
    .args(["--", "/bin/sh", "-c", "exit 7"])
    .stdin(Stdio::piped())
    .stdout(Stdio::piped())
    .spawn()
    .unwrap();

  let stdin = child.stdin.take();

  let status = child.wait().unwrap();
  assert_eq!(status.code(), Some(7));
  drop(stdin);
}

#[test]
fn it_should_refuse_uid_zero() {
  let output = corral()
    .args(["--uid", "0", "--", "/bin/true"])
    .output()
    .unwrap();

  assert!(!output.status.success());
  let stderr = String::from_utf8_lossy(&output.stderr);
  assert!(stderr.contains("not allowed"));
}

#[test]
fn it_should_refuse_gid_zero() {
  let output = corral()
    .args(["--gid", "0", "--", "/bin/true"])
    .output()
    .unwrap();

  assert!(!output.status.success());
}

#[test]
fn it_should_reject_setting_without_equal_sign() {
  let output = corral()
    .args(["-c", "cpu", "-p", "scope/j", "-s", "cpu.shares", "--", "/bin/true"])
    .output()
    .unwrap();

  assert!(!output.status.success());
  let stdout = String::from_utf8_lossy(&output.stdout);
  assert!(stdout.contains("Usage"));
}

#[test]
fn it_should_reject_missing_program() {
  let output = corral().args(["--"]).output().unwrap();
  assert!(!output.status.success());
}

#[test]
fn it_should_print_help() {
  let output = corral().arg("--help").output().unwrap();

  assert!(output.status.success());
  let stdout = String::from_utf8_lossy(&output.stdout);
  assert!(stdout.contains("--delay-to-sigkill"));
}
