use std::sync::{Mutex, MutexGuard, Once};

use flexi_logger::Logger;

static INIT: Once = Once::new();

static LOCK: Mutex<()> = Mutex::new(());

pub fn setup() {
  INIT.call_once(|| {
    Logger::try_with_str("corral=debug,info")
      .unwrap()
      .start()
      .unwrap();
  });
}

/// The signal funnel is process global, so concurrent run() calls from the
/// test threads must take turns
pub fn exclusive() -> MutexGuard<'static, ()> {
  LOCK.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
