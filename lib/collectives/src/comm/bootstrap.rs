// SPDX-FileCopyrightText: Copyright (c) 2025-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use super::DeviceKey;
use crate::backend::{CollectiveBackend, UniqueId};
use crate::error::{CollectiveError, Result};
use crate::store::{Store, StoreError, get_json, set_json};

/// Record rank 0 publishes so every rank joins the same channel with the same shape.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BootstrapInfo {
    pub unique_id: UniqueId,
    pub world_size: usize,
    pub devices_per_rank: usize,
}

/// Store key for the `generation`-th fresh communicator on `key`.
///
/// Every rank creates communicators for a device set in the same order, so
/// the local generation counter agrees across ranks.
pub(crate) fn bootstrap_key(key: &DeviceKey, generation: u64) -> String {
    format!("bootstrap/{key}/{generation}")
}

/// Publish (rank 0) or fetch (everyone else) the bootstrap record.
pub(crate) fn exchange(
    store: &dyn Store,
    backend: &dyn CollectiveBackend,
    rank: usize,
    world_size: usize,
    key: &DeviceKey,
    generation: u64,
    timeout: Duration,
) -> Result<BootstrapInfo> {
    let store_key = bootstrap_key(key, generation);

    if rank == 0 {
        let info = BootstrapInfo {
            unique_id: backend.unique_id()?,
            world_size,
            devices_per_rank: key.len(),
        };
        set_json(store, &store_key, &info)?;
        tracing::debug!(rank, key = %store_key, id = %info.unique_id, "published bootstrap id");
        return Ok(info);
    }

    let started = Instant::now();
    let info: BootstrapInfo = get_json(store, &store_key, timeout).map_err(|e| match e {
        StoreError::Timeout { .. } => CollectiveError::CommInitTimeout {
            rank,
            devices: key.to_string(),
            elapsed: started.elapsed(),
            reason: format!("no bootstrap id from rank 0: {e}"),
        },
        other => other.into(),
    })?;

    if info.world_size != world_size || info.devices_per_rank != key.len() {
        return Err(CollectiveError::ShapeMismatch(format!(
            "rank 0 bootstrapped {} ranks with {} devices each, rank {rank} expects {world_size} ranks with {} devices",
            info.world_size,
            info.devices_per_rank,
            key.len()
        )));
    }
    tracing::debug!(rank, key = %store_key, id = %info.unique_id, "received bootstrap id");
    Ok(info)
}
