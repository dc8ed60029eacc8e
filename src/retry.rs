//! Fixed-interval, unbounded retry of fallible operations.
//!
//! The process runs unattended: persistent failures (bad credentials, an
//! unplugged receiver) are logged on every attempt and left for an operator
//! to fix, while the loop keeps trying at the same pace.

use std::fmt::Display;
use std::sync::Arc;
use std::time::Duration;

use log::error;

use crate::clock::Clock;

#[derive(Clone)]
pub struct Retry {
    clock: Arc<dyn Clock>,
    interval: Duration,
}

impl Retry {
    pub fn new(clock: Arc<dyn Clock>, interval: Duration) -> Self {
        Self { clock, interval }
    }

    /// Re-invokes `op` until it succeeds. Never gives up.
    pub fn run<T, E, F>(&self, operation: &str, mut op: F) -> T
    where
        E: Display,
        F: FnMut() -> Result<T, E>,
    {
        loop {
            match op() {
                Ok(value) => return value,
                Err(err) => self.log_and_wait(operation, &err),
            }
        }
    }

    /// Like [`Retry::run`], but hands back errors that `is_transient` rejects
    /// instead of retrying them.
    pub fn run_transient<T, E, F, P>(&self, operation: &str, mut op: F, is_transient: P) -> Result<T, E>
    where
        E: Display,
        F: FnMut() -> Result<T, E>,
        P: Fn(&E) -> bool,
    {
        loop {
            match op() {
                Ok(value) => return Ok(value),
                Err(err) if is_transient(&err) => self.log_and_wait(operation, &err),
                Err(err) => return Err(err),
            }
        }
    }

    fn log_and_wait(&self, operation: &str, err: &dyn Display) {
        error!("{} failed: {}", operation, err);
        error!(
            "Retrying {} in {} seconds...",
            operation,
            self.interval.as_secs_f64()
        );
        self.clock.sleep(self.interval);
    }
}
