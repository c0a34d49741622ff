// SPDX-FileCopyrightText: Copyright (c) 2025-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use uuid::Uuid;

use crate::backend::{DeviceComm, UniqueId};
use crate::device::DeviceStream;
use crate::error::{CollectiveError, Result};

/// Ordered, duplicate-free set of local device indices identifying a communicator.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DeviceKey(Vec<usize>);

impl DeviceKey {
    pub fn new(devices: &[usize]) -> Result<Self> {
        if devices.is_empty() {
            return Err(CollectiveError::InvalidArgument(
                "device set must not be empty".to_string(),
            ));
        }
        let mut seen = HashSet::with_capacity(devices.len());
        if let Some(dup) = devices.iter().find(|d| !seen.insert(**d)) {
            return Err(CollectiveError::InvalidArgument(format!(
                "device {dup} appears more than once; tensors must be on distinct devices"
            )));
        }
        Ok(Self(devices.to_vec()))
    }

    pub fn devices(&self) -> &[usize] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for DeviceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, device) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str(",")?;
            }
            write!(f, "{device}")?;
        }
        Ok(())
    }
}

/// How a communicator's channel was established.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelOrigin {
    /// Bootstrapped through the rendezvous store.
    Fresh { bootstrap_id: UniqueId },
    /// Derived from the parent group's communicator for the same devices.
    SplitFrom { parent_id: Uuid, color: i32 },
}

/// One logical channel spanning the local devices of a [`DeviceKey`].
///
/// The device set never changes after creation. Once aborted a communicator
/// stays aborted and reports the original cause to every later caller.
pub struct Communicator {
    id: Uuid,
    rank: usize,
    key: DeviceKey,
    origin: ChannelOrigin,
    comms: Vec<Arc<dyn DeviceComm>>,
    streams: Vec<Arc<dyn DeviceStream>>,
    aborted: Mutex<Option<CollectiveError>>,
}

impl Communicator {
    pub(crate) fn new(
        rank: usize,
        key: DeviceKey,
        origin: ChannelOrigin,
        comms: Vec<Arc<dyn DeviceComm>>,
        streams: Vec<Arc<dyn DeviceStream>>,
    ) -> Self {
        debug_assert_eq!(comms.len(), key.len());
        debug_assert_eq!(streams.len(), key.len());
        Self {
            id: Uuid::new_v4(),
            rank,
            key,
            origin,
            comms,
            streams,
            aborted: Mutex::new(None),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn key(&self) -> &DeviceKey {
        &self.key
    }

    pub fn origin(&self) -> &ChannelOrigin {
        &self.origin
    }

    pub fn comms(&self) -> &[Arc<dyn DeviceComm>] {
        &self.comms
    }

    /// Dedicated stream collectives on the `index`-th device are issued to.
    pub fn stream(&self, index: usize) -> &Arc<dyn DeviceStream> {
        &self.streams[index]
    }

    pub fn is_aborted(&self) -> bool {
        self.aborted.lock().is_some()
    }

    /// Abort every device channel. The first cause wins and is returned.
    pub fn abort(&self, cause: CollectiveError) -> CollectiveError {
        let mut aborted = self.aborted.lock();
        if let Some(existing) = &*aborted {
            return existing.clone();
        }
        *aborted = Some(cause.clone());
        drop(aborted);

        tracing::warn!(
            rank = self.rank,
            devices = %self.key,
            communicator = %self.id,
            error = %cause,
            "aborting communicator"
        );
        let reason = cause.to_string();
        for comm in &self.comms {
            comm.abort(&reason);
        }
        cause
    }

    /// Check the device channels for asynchronous faults, aborting on the first one.
    pub fn poll_async_error(&self) -> Option<CollectiveError> {
        if let Some(cause) = self.aborted.lock().clone() {
            return Some(cause);
        }
        for comm in &self.comms {
            if let Some(reason) = comm.async_error() {
                let cause = CollectiveError::AsyncBackendError {
                    rank: self.rank,
                    reason: format!("device {}: {reason}", comm.device()),
                };
                return Some(self.abort(cause));
            }
        }
        None
    }

    pub fn ensure_healthy(&self) -> Result<()> {
        match self.poll_async_error() {
            Some(cause) => Err(cause),
            None => Ok(()),
        }
    }
}

impl fmt::Debug for Communicator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Communicator")
            .field("id", &self.id)
            .field("rank", &self.rank)
            .field("devices", &self.key.devices())
            .field("origin", &self.origin)
            .field("aborted", &self.is_aborted())
            .finish()
    }
}

impl Drop for Communicator {
    fn drop(&mut self) {
        for comm in &self.comms {
            comm.destroy();
        }
        tracing::debug!(rank = self.rank, devices = %self.key, communicator = %self.id, "communicator destroyed");
    }
}
