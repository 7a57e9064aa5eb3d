use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use crate::error::{HarnessError, HarnessResult};

const POLL_SLICE: Duration = Duration::from_millis(100);

/// Shared stop flag raised by the process-level interrupt handler and polled
/// at every blocking point of a trial.
#[derive(Debug, Clone, Default)]
pub struct InterruptFlag {
    raised: Arc<AtomicBool>,
}

impl InterruptFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn raise(&self) {
        self.raised.store(true, Ordering::SeqCst);
    }

    pub fn is_raised(&self) -> bool {
        self.raised.load(Ordering::SeqCst)
    }

    pub fn check(&self) -> HarnessResult<()> {
        if self.is_raised() {
            return Err(HarnessError::Interrupted);
        }
        Ok(())
    }

    /// Sleeps for `total`, waking early with `Interrupted` if the flag goes up.
    pub fn sleep(&self, total: Duration) -> HarnessResult<()> {
        let deadline = Instant::now() + total;
        loop {
            self.check()?;
            let now = Instant::now();
            if now >= deadline {
                return Ok(());
            }
            thread::sleep(POLL_SLICE.min(deadline - now));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sleep_returns_early_when_raised() {
        let flag = InterruptFlag::new();
        let remote = flag.clone();
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(50));
            remote.raise();
        });
        let started = Instant::now();
        let result = flag.sleep(Duration::from_secs(30));
        handle.join().expect("join");
        assert!(matches!(result, Err(HarnessError::Interrupted)));
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn zero_sleep_is_immediate() {
        let flag = InterruptFlag::new();
        flag.sleep(Duration::ZERO).expect("no interrupt");
        assert!(!flag.is_raised());
    }
}
