//! In-process table of keys currently being produced.
//!
//! The first caller for a key registers it and produces; concurrent callers for
//! the same key wait until the guard is dropped and then re-check the cache.
//! Garbage collection freezes the whole table for its scan-and-delete pass, so
//! no new producer can start while entries are being removed.

use std::collections::HashSet;
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};

#[derive(Debug, Default)]
pub struct InflightTable {
    keys: Mutex<HashSet<String>>,
    released: Condvar,
}

impl InflightTable {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashSet<String>> {
        self.keys.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register `key`, blocking while another holder has it.
    pub fn acquire(&self, key: &str) -> InflightGuard<'_> {
        let mut keys = self.lock();
        while keys.contains(key) {
            keys = self
                .released
                .wait(keys)
                .unwrap_or_else(PoisonError::into_inner);
        }
        keys.insert(key.to_string());
        InflightGuard {
            table: self,
            key: key.to_string(),
        }
    }

    /// Hold the table lock. New registrations block until the snapshot drops.
    pub fn freeze(&self) -> InflightSnapshot<'_> {
        InflightSnapshot { keys: self.lock() }
    }
}

/// Registration of one key. Releases and wakes waiters on drop.
#[derive(Debug)]
pub struct InflightGuard<'a> {
    table: &'a InflightTable,
    key: String,
}

impl Drop for InflightGuard<'_> {
    fn drop(&mut self) {
        let mut keys = self.table.lock();
        keys.remove(&self.key);
        drop(keys);
        self.table.released.notify_all();
    }
}

/// Frozen view of the in-flight keys.
pub struct InflightSnapshot<'a> {
    keys: MutexGuard<'a, HashSet<String>>,
}

impl InflightSnapshot<'_> {
    pub fn contains(&self, key: &str) -> bool {
        self.keys.contains(key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn same_key_is_exclusive() {
        let table = InflightTable::new();
        let active = AtomicUsize::new(0);
        let peak = AtomicUsize::new(0);

        std::thread::scope(|s| {
            for _ in 0..8 {
                s.spawn(|| {
                    let _guard = table.acquire("k");
                    let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    std::thread::sleep(Duration::from_millis(5));
                    active.fetch_sub(1, Ordering::SeqCst);
                });
            }
        });

        assert_eq!(peak.load(Ordering::SeqCst), 1);
        assert!(table.freeze().keys.is_empty());
    }

    #[test]
    fn distinct_keys_do_not_block() {
        let table = InflightTable::new();
        let a = table.acquire("a");
        let b = table.acquire("b");
        let snapshot = table.freeze();
        assert!(snapshot.contains("a"));
        assert!(snapshot.contains("b"));
        assert_eq!(snapshot.keys.len(), 2);
        drop(snapshot);
        drop(a);
        drop(b);
    }

    #[test]
    fn freeze_blocks_new_registrations() {
        let table = Arc::new(InflightTable::new());
        let acquired = Arc::new(AtomicUsize::new(0));

        let snapshot = table.freeze();
        let handle = {
            let table = Arc::clone(&table);
            let acquired = Arc::clone(&acquired);
            std::thread::spawn(move || {
                let _guard = table.acquire("x");
                acquired.store(1, Ordering::SeqCst);
            })
        };
        std::thread::sleep(Duration::from_millis(50));
        assert_eq!(acquired.load(Ordering::SeqCst), 0);
        drop(snapshot);
        handle.join().unwrap();
        assert_eq!(acquired.load(Ordering::SeqCst), 1);
    }
}
