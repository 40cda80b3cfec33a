use crate::dn::Dn;
use crate::error::LockError;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};
use tracing::error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockMode {
    Read,
    Write,
}

impl LockMode {
    fn as_str(self) -> &'static str {
        match self {
            LockMode::Read => "read",
            LockMode::Write => "write",
        }
    }
}

#[derive(Debug)]
enum HeldLock {
    Read(usize),
    Write,
}

#[derive(Default)]
struct LockState {
    held: HashMap<String, HeldLock>,
}

/// Per-DN read/write mutual exclusion. Two operations racing on the same DN
/// are serialized here; no ordering is guaranteed between different DNs.
///
/// Acquisition is a timed wait; callers retry a bounded number of times and
/// treat exhaustion as a server-internal error rather than a data violation.
/// Guards release on drop, exactly once, on every exit path.
pub struct LockManager {
    state: Mutex<LockState>,
    cv: Condvar,
    /// Set if a thread panics while the table mutex is held. After
    /// poisoning, all new acquisitions are rejected.
    poisoned: AtomicBool,
    attempt_timeout: Duration,
}

impl LockManager {
    pub fn new(attempt_timeout: Duration) -> Self {
        Self {
            state: Mutex::new(LockState::default()),
            cv: Condvar::new(),
            poisoned: AtomicBool::new(false),
            attempt_timeout,
        }
    }

    /// One timed acquisition attempt. `None` means the lock could not be
    /// obtained within the attempt window.
    pub fn acquire(&self, dn: &Dn, mode: LockMode) -> Option<LockGuard<'_>> {
        if self.poisoned.load(Ordering::Acquire) {
            return None;
        }
        let key = dn.normalized().to_string();
        let deadline = Instant::now() + self.attempt_timeout;
        let mut state = match self.state.lock() {
            Ok(state) => state,
            Err(_) => {
                self.poisoned.store(true, Ordering::Release);
                error!("entry lock table poisoned, rejecting new acquisitions");
                return None;
            }
        };
        loop {
            let compatible = match (state.held.get(&key), mode) {
                (None, _) => true,
                (Some(HeldLock::Read(_)), LockMode::Read) => true,
                _ => false,
            };
            if compatible {
                match (state.held.get_mut(&key), mode) {
                    (Some(HeldLock::Read(count)), LockMode::Read) => *count += 1,
                    (None, LockMode::Read) => {
                        state.held.insert(key.clone(), HeldLock::Read(1));
                    }
                    (None, LockMode::Write) => {
                        state.held.insert(key.clone(), HeldLock::Write);
                    }
                    _ => unreachable!("incompatible lock state after compatibility check"),
                }
                return Some(LockGuard {
                    manager: self,
                    key,
                    mode,
                });
            }
            let now = Instant::now();
            if now >= deadline {
                return None;
            }
            let remaining = deadline.saturating_duration_since(now);
            let (new_state, wait) = match self.cv.wait_timeout(state, remaining) {
                Ok(result) => result,
                Err(_) => {
                    self.poisoned.store(true, Ordering::Release);
                    error!("entry lock table poisoned during wait");
                    return None;
                }
            };
            state = new_state;
            if wait.timed_out() {
                // One more compatibility check before giving up; the holder
                // may have released between the timeout and the wakeup.
                let compatible = match (state.held.get(&key), mode) {
                    (None, _) => true,
                    (Some(HeldLock::Read(_)), LockMode::Read) => true,
                    _ => false,
                };
                if !compatible {
                    return None;
                }
            }
        }
    }

    /// Bounded-retry acquisition. Exhaustion is fatal to the operation and
    /// reported with the server's internal-error result code by the caller.
    pub fn acquire_with_retry(
        &self,
        dn: &Dn,
        mode: LockMode,
        attempts: u32,
    ) -> Result<LockGuard<'_>, LockError> {
        if self.poisoned.load(Ordering::Acquire) {
            return Err(LockError::Poisoned);
        }
        for _ in 0..attempts.max(1) {
            if let Some(guard) = self.acquire(dn, mode) {
                return Ok(guard);
            }
        }
        Err(LockError::Exhausted {
            dn: dn.to_string(),
            mode: mode.as_str(),
            attempts: attempts.max(1),
        })
    }
}

impl Default for LockManager {
    fn default() -> Self {
        Self::new(Duration::from_millis(9_000))
    }
}

/// An acquired entry lock. Dropping the guard releases the lock and wakes
/// all waiters.
pub struct LockGuard<'a> {
    manager: &'a LockManager,
    key: String,
    mode: LockMode,
}

impl LockGuard<'_> {
    pub fn mode(&self) -> LockMode {
        self.mode
    }
}

impl Drop for LockGuard<'_> {
    fn drop(&mut self) {
        let Ok(mut state) = self.manager.state.lock() else {
            self.manager.poisoned.store(true, Ordering::Release);
            error!("entry lock table poisoned during release");
            return;
        };
        let remove = match state.held.get_mut(&self.key) {
            Some(HeldLock::Read(count)) if *count > 1 => {
                *count -= 1;
                false
            }
            Some(_) => true,
            None => false,
        };
        if remove {
            state.held.remove(&self.key);
        }
        drop(state);
        self.manager.cv.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use super::{LockManager, LockMode};
    use crate::dn::Dn;
    use std::sync::Arc;
    use std::time::Duration;

    fn manager() -> LockManager {
        LockManager::new(Duration::from_millis(20))
    }

    fn dn() -> Dn {
        Dn::parse("cn=test,o=example").unwrap()
    }

    #[test]
    fn shared_readers_exclusive_writer() {
        let locks = manager();
        let target = dn();
        let r1 = locks.acquire(&target, LockMode::Read).expect("first read");
        let r2 = locks.acquire(&target, LockMode::Read).expect("second read");
        assert!(locks.acquire(&target, LockMode::Write).is_none());
        drop(r1);
        assert!(locks.acquire(&target, LockMode::Write).is_none());
        drop(r2);
        assert!(locks.acquire(&target, LockMode::Write).is_some());
    }

    #[test]
    fn write_lock_blocks_everything() {
        let locks = manager();
        let target = dn();
        let w = locks.acquire(&target, LockMode::Write).expect("write");
        assert!(locks.acquire(&target, LockMode::Read).is_none());
        assert!(locks.acquire(&target, LockMode::Write).is_none());
        drop(w);
        assert!(locks.acquire(&target, LockMode::Read).is_some());
    }

    #[test]
    fn different_dns_do_not_contend() {
        let locks = manager();
        let _a = locks
            .acquire(&Dn::parse("cn=a,o=example").unwrap(), LockMode::Write)
            .expect("a");
        assert!(
            locks
                .acquire(&Dn::parse("cn=b,o=example").unwrap(), LockMode::Write)
                .is_some()
        );
    }

    #[test]
    fn retry_exhaustion_reports_lock_error() {
        let locks = manager();
        let target = dn();
        let _held = locks.acquire(&target, LockMode::Write).expect("hold");
        let err = match locks.acquire_with_retry(&target, LockMode::Write, 3) {
            Err(err) => err,
            Ok(_) => panic!("acquisition should exhaust its retries"),
        };
        let text = err.to_string();
        assert!(text.contains("3 attempts"), "unexpected error: {text}");
    }

    #[test]
    fn release_wakes_waiter() {
        let locks = Arc::new(LockManager::new(Duration::from_millis(500)));
        let target = dn();
        let guard = locks.acquire(&target, LockMode::Write).expect("hold");
        let waiter = {
            let locks = Arc::clone(&locks);
            let target = target.clone();
            std::thread::spawn(move || locks.acquire(&target, LockMode::Write).is_some())
        };
        std::thread::sleep(Duration::from_millis(50));
        drop(guard);
        assert!(waiter.join().expect("join"));
    }
}
