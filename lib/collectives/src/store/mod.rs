// SPDX-FileCopyrightText: Copyright (c) 2025-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Rendezvous key/value store used to exchange bootstrap data between ranks.
//!
//! The store is an external collaborator; the process group only relies on
//! the narrow blocking contract of [`Store`]. [`MemoryStore`] is an
//! in-process implementation shared by threads that simulate ranks, and
//! [`PrefixStore`] namespaces keys per process group.

mod memory;
mod prefix;

pub use memory::MemoryStore;
pub use prefix::PrefixStore;

use std::time::Duration;

use serde::Serialize;
use serde::de::DeserializeOwned;

#[derive(Debug, Clone, thiserror::Error)]
pub enum StoreError {
    #[error("Timed out after {timeout:?} waiting for keys {keys:?}")]
    Timeout { keys: Vec<String>, timeout: Duration },

    #[error("Failed to decode value for key {key}: {reason}")]
    Decode { key: String, reason: String },
}

/// Blocking key/value store contract.
pub trait Store: Send + Sync {
    /// Set `key` to `value`, waking any waiter blocked on it.
    fn set(&self, key: &str, value: &[u8]) -> Result<(), StoreError>;

    /// Get the value of `key`, blocking up to `timeout` for it to appear.
    fn get(&self, key: &str, timeout: Duration) -> Result<Vec<u8>, StoreError>;

    /// Block until all `keys` exist or `timeout` elapses.
    fn wait(&self, keys: &[String], timeout: Duration) -> Result<(), StoreError>;
}

pub(crate) fn set_json<T: Serialize>(
    store: &dyn Store,
    key: &str,
    value: &T,
) -> Result<(), StoreError> {
    let bytes = serde_json::to_vec(value).map_err(|e| StoreError::Decode {
        key: key.to_string(),
        reason: e.to_string(),
    })?;
    store.set(key, &bytes)
}

pub(crate) fn get_json<T: DeserializeOwned>(
    store: &dyn Store,
    key: &str,
    timeout: Duration,
) -> Result<T, StoreError> {
    let bytes = store.get(key, timeout)?;
    serde_json::from_slice(&bytes).map_err(|e| StoreError::Decode {
        key: key.to_string(),
        reason: e.to_string(),
    })
}
