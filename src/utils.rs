use std::ffi::CString;

use flexi_logger::DeferredNow;
use log::Record;
use nix::libc::{gid_t, uid_t};

pub type UidType = uid_t;

pub type GidType = gid_t;

/// A logline-formatter that produces log lines like <br>
/// ```[datetime: INFO] Moved pid 1234 into memory/scope/job1```
#[allow(unused)]
pub fn default_format(
  w: &mut dyn std::io::Write,
  now: &mut DeferredNow,
  record: &Record,
) -> Result<(), std::io::Error> {
  write!(
    w,
    "[{}: {:5}] {}",
    now.format("%Y-%m-%d %H:%M:%S"),
    record.level(),
    record.args()
  )
}

pub(crate) fn into_c_string(string: &String) -> CString {
  let string = string.as_str();
  CString::new(string).expect("Convert &str to CString should work")
}
