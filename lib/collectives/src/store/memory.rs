// SPDX-FileCopyrightText: Copyright (c) 2025-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

use std::collections::HashMap;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use super::{Store, StoreError};

/// In-process store shared by every rank of a simulated world.
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: Mutex<HashMap<String, Vec<u8>>>,
    changed: Condvar,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

impl Store for MemoryStore {
    fn set(&self, key: &str, value: &[u8]) -> Result<(), StoreError> {
        self.entries.lock().insert(key.to_string(), value.to_vec());
        self.changed.notify_all();
        Ok(())
    }

    fn get(&self, key: &str, timeout: Duration) -> Result<Vec<u8>, StoreError> {
        let deadline = Instant::now() + timeout;
        let mut entries = self.entries.lock();
        loop {
            if let Some(value) = entries.get(key) {
                return Ok(value.clone());
            }
            if self.changed.wait_until(&mut entries, deadline).timed_out()
                && !entries.contains_key(key)
            {
                return Err(StoreError::Timeout {
                    keys: vec![key.to_string()],
                    timeout,
                });
            }
        }
    }

    fn wait(&self, keys: &[String], timeout: Duration) -> Result<(), StoreError> {
        let deadline = Instant::now() + timeout;
        let mut entries = self.entries.lock();
        loop {
            let missing: Vec<String> = keys
                .iter()
                .filter(|k| !entries.contains_key(k.as_str()))
                .cloned()
                .collect();
            if missing.is_empty() {
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(StoreError::Timeout {
                    keys: missing,
                    timeout,
                });
            }
            self.changed.wait_until(&mut entries, deadline);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;

    #[test]
    fn test_set_get() {
        let store = MemoryStore::new();
        store.set("k", b"v").unwrap();
        assert_eq!(store.get("k", Duration::from_millis(1)).unwrap(), b"v");
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_get_times_out() {
        let store = MemoryStore::new();
        let start = Instant::now();
        let err = store.get("missing", Duration::from_millis(50)).unwrap_err();
        assert!(start.elapsed() >= Duration::from_millis(50));
        assert!(matches!(err, StoreError::Timeout { ref keys, .. } if keys == &["missing"]));
    }

    #[test]
    fn test_get_blocks_until_set() {
        let store = Arc::new(MemoryStore::new());
        let writer = {
            let store = store.clone();
            std::thread::spawn(move || {
                std::thread::sleep(Duration::from_millis(20));
                store.set("late", b"here").unwrap();
            })
        };
        let value = store.get("late", Duration::from_secs(5)).unwrap();
        assert_eq!(value, b"here");
        writer.join().unwrap();
    }

    #[test]
    fn test_wait_reports_missing_keys() {
        let store = MemoryStore::new();
        store.set("a", b"1").unwrap();
        let keys = vec!["a".to_string(), "b".to_string()];
        let err = store.wait(&keys, Duration::from_millis(20)).unwrap_err();
        assert!(matches!(err, StoreError::Timeout { ref keys, .. } if keys == &["b"]));

        store.set("b", b"2").unwrap();
        store.wait(&keys, Duration::from_millis(20)).unwrap();
    }
}
