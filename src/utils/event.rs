use std::sync::{Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

/// A settable flag threads can sleep on. Waiting wakes early as soon as the
/// flag is set, which makes interval sleeps interruptible.
#[derive(Debug, Default)]
pub struct Event {
    flag: Mutex<bool>,
    cond: Condvar,
}

impl Event {
    pub fn new() -> Self {
        Self::default()
    }

    fn guard(&self) -> MutexGuard<'_, bool> {
        self.flag.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn set(&self) {
        *self.guard() = true;
        self.cond.notify_all();
    }

    pub fn clear(&self) {
        *self.guard() = false;
    }

    pub fn is_set(&self) -> bool {
        *self.guard()
    }

    /// Block for at most `timeout`. Returns whether the flag is set.
    pub fn wait(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut flag = self.guard();
        while !*flag {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            flag = match self.cond.wait_timeout(flag, deadline - now) {
                Ok((guard, _)) => guard,
                Err(poisoned) => poisoned.into_inner().0,
            };
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_wait_times_out_when_unset() {
        let event = Event::new();
        let started = Instant::now();
        assert!(!event.wait(Duration::from_millis(20)));
        assert!(started.elapsed() >= Duration::from_millis(20));
    }

    #[test]
    fn test_set_interrupts_wait() {
        let event = Arc::new(Event::new());
        let setter = event.clone();
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(10));
            setter.set();
        });
        let started = Instant::now();
        assert!(event.wait(Duration::from_secs(5)));
        assert!(started.elapsed() < Duration::from_secs(5));
        handle.join().unwrap();
    }

    #[test]
    fn test_clear_resets_flag() {
        let event = Event::new();
        event.set();
        assert!(event.is_set());
        event.clear();
        assert!(!event.is_set());
    }
}
