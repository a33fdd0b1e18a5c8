use std::env;
use std::ffi::{OsStr, OsString};
use std::sync::{Mutex, MutexGuard};

static ENV_LOCK: Mutex<()> = Mutex::new(());

pub fn env_lock() -> MutexGuard<'static, ()> {
    ENV_LOCK.lock().unwrap_or_else(|poison| poison.into_inner())
}

/// Holds the env lock, clears `keys` on creation and restores their
/// previous values on drop.
pub struct EnvGuard {
    saved: Vec<(String, Option<OsString>)>,
    _lock: MutexGuard<'static, ()>,
}

impl EnvGuard {
    pub fn new(keys: &[&str]) -> Self {
        let lock = env_lock();
        let saved = keys
            .iter()
            .map(|key| (key.to_string(), env::var_os(key)))
            .collect();
        for key in keys {
            unsafe { env::remove_var(key) };
        }
        Self { saved, _lock: lock }
    }

    pub fn set(&self, key: &str, value: impl AsRef<OsStr>) {
        debug_assert!(
            self.saved.iter().any(|(saved, _)| saved == key),
            "{key} is not guarded"
        );
        unsafe { env::set_var(key, value) };
    }
}

impl Drop for EnvGuard {
    fn drop(&mut self) {
        for (key, value) in &self.saved {
            match value {
                Some(value) => unsafe { env::set_var(key, value) },
                None => unsafe { env::remove_var(key) },
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Barrier, mpsc};
    use std::thread;
    use std::time::Duration;

    #[test]
    fn env_lock_is_usable_after_panic_in_prior_holder() {
        let handle = thread::spawn(|| {
            let _guard = env_lock();
            panic!("poison env lock");
        });

        assert!(handle.join().is_err());

        let (tx, rx) = mpsc::channel();
        let handle = thread::spawn(move || {
            let _guard = env_lock();
            tx.send(()).expect("send acquired");
        });

        assert_eq!(rx.recv_timeout(Duration::from_secs(1)), Ok(()));
        assert!(handle.join().is_ok());
    }

    #[test]
    fn env_guard_serializes_access_under_contention() {
        const THREADS: usize = 4;
        let barrier = Arc::new(Barrier::new(THREADS));
        let active = Arc::new(AtomicUsize::new(0));
        let max_active = Arc::new(AtomicUsize::new(0));
        let mut handles = Vec::with_capacity(THREADS);

        for _ in 0..THREADS {
            let barrier = Arc::clone(&barrier);
            let active = Arc::clone(&active);
            let max_active = Arc::clone(&max_active);
            handles.push(thread::spawn(move || {
                barrier.wait();
                let _guard = EnvGuard::new(&["DEPLOY_HARNESS_TEST_CONTENTION"]);
                let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                max_active.fetch_max(now, Ordering::SeqCst);
                thread::sleep(Duration::from_millis(10));
                active.fetch_sub(1, Ordering::SeqCst);
            }));
        }

        for handle in handles {
            assert!(handle.join().is_ok());
        }

        assert_eq!(max_active.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn env_guard_restores_previous_values() {
        const KEY: &str = "DEPLOY_HARNESS_TEST_RESTORE";
        {
            let _lock = env_lock();
            unsafe { env::set_var(KEY, "before") };
        }
        {
            let guard = EnvGuard::new(&[KEY]);
            assert_eq!(env::var_os(KEY), None);
            guard.set(KEY, "during");
            assert_eq!(env::var(KEY).as_deref(), Ok("during"));
        }
        let _lock = env_lock();
        assert_eq!(env::var(KEY).as_deref(), Ok("before"));
        unsafe { env::remove_var(KEY) };
    }
}
