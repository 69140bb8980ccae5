//! Process-wide log capture for unit tests.
//!
//! `logtest` can install its logger only once per process, so every test in
//! the library binary shares one instance behind a lock.

use std::sync::OnceLock;

use logtest::Logger;
use parking_lot::{Mutex, MutexGuard};

static LOGGER: OnceLock<Mutex<Logger>> = OnceLock::new();

/// Borrow the shared logger with records from earlier tests discarded.
///
/// Holding the guard keeps other capturing tests out until it is dropped.
pub(crate) fn capture_logs() -> MutexGuard<'static, Logger> {
    let mut logger = LOGGER.get_or_init(|| Mutex::new(Logger::start())).lock();
    while logger.pop().is_some() {}
    logger
}
