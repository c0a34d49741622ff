// SPDX-FileCopyrightText: Copyright (c) 2025-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Accelerator collective backend abstraction.
//!
//! The backend owns the transport and the reduction kernels. The process
//! group only drives its lifecycle primitives:
//!
//! - [`CollectiveBackend::unique_id`] / [`CollectiveBackend::init_rank`]: fresh
//!   channel bootstrap, non-blocking (poll [`DeviceComm::init_state`])
//! - [`DeviceComm::split`]: derive a child channel from an initialized one
//! - [`DeviceComm::abort`] / [`DeviceComm::destroy`]: teardown
//! - [`DeviceComm::async_error`]: faults raised while kernels were in flight
//!
//! Kernel methods enqueue work on the given stream and return once it is
//! enqueued. Failures detected while the kernel runs are reported through
//! [`DeviceComm::async_error`], never through the enqueue result.

mod local;

pub use local::{LocalCollectiveBackend, LocalComm};

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::device::{DeviceStream, SparseTensor, Tensor};
use crate::error::{CollectiveError, Result};

/// Opaque channel identifier generated by one rank and shared with the
/// others through the rendezvous store.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct UniqueId(Vec<u8>);

impl UniqueId {
    pub fn new(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Display for UniqueId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in &self.0 {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum ReduceOp {
    #[default]
    Sum,
    Product,
    Min,
    Max,
    Avg,
}

impl ReduceOp {
    /// Element-wise reduction of equally sized contributions.
    pub fn apply(&self, contributions: &[Vec<f64>]) -> Vec<f64> {
        let Some((first, rest)) = contributions.split_first() else {
            return Vec::new();
        };
        let mut out = first.clone();
        for contribution in rest {
            for (acc, v) in out.iter_mut().zip(contribution) {
                *acc = match self {
                    ReduceOp::Sum | ReduceOp::Avg => *acc + v,
                    ReduceOp::Product => *acc * v,
                    ReduceOp::Min => acc.min(*v),
                    ReduceOp::Max => acc.max(*v),
                };
            }
        }
        if *self == ReduceOp::Avg {
            let n = contributions.len() as f64;
            out.iter_mut().for_each(|v| *v /= n);
        }
        out
    }
}

/// Progress of a non-blocking communicator initialization.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommInitState {
    InProgress,
    Ready,
    Failed(String),
}

/// Factory for per-device communicators.
pub trait CollectiveBackend: Send + Sync {
    fn name(&self) -> &'static str;

    /// Generate a fresh channel identifier. Called on exactly one rank.
    fn unique_id(&self) -> Result<UniqueId>;

    /// Reject rank/size combinations the backend cannot represent.
    fn validate_rank(&self, rank: usize, world_size: usize) -> Result<()> {
        if world_size == 0 || rank >= world_size {
            return Err(CollectiveError::InvalidRank { rank, world_size });
        }
        Ok(())
    }

    /// Begin joining channel `id` as `rank` of `world_size` on `device`.
    ///
    /// Returns immediately; the communicator is usable once
    /// [`DeviceComm::init_state`] reports [`CommInitState::Ready`].
    fn init_rank(
        &self,
        id: &UniqueId,
        world_size: usize,
        rank: usize,
        device: usize,
    ) -> Result<Arc<dyn DeviceComm>>;
}

/// One rank's endpoint of a channel, bound to a single device.
pub trait DeviceComm: Send + Sync {
    /// Rank within the channel. Until a split resolves this reports the
    /// position in the parent channel.
    fn rank(&self) -> usize;

    fn world_size(&self) -> usize;

    fn device(&self) -> usize;

    fn init_state(&self) -> CommInitState;

    /// Collective over all members of this channel. Members passing the same
    /// `color` form one child channel ordered by `key`; `None` opts out and
    /// returns `Ok(None)`. The child initializes asynchronously.
    fn split(&self, color: Option<i32>, key: usize) -> Result<Option<Arc<dyn DeviceComm>>>;

    /// Fail all pending and future work on the channel.
    fn abort(&self, reason: &str);

    /// Leave the channel and release its resources.
    fn destroy(&self);

    fn async_error(&self) -> Option<String>;

    fn all_reduce(&self, buffer: &Tensor, op: ReduceOp, stream: &dyn DeviceStream) -> Result<()>;

    fn broadcast(&self, buffer: &Tensor, root: usize, stream: &dyn DeviceStream) -> Result<()>;

    /// Result materializes on `root` only; other buffers are left untouched.
    fn reduce(
        &self,
        buffer: &Tensor,
        op: ReduceOp,
        root: usize,
        stream: &dyn DeviceStream,
    ) -> Result<()>;

    /// `output` holds `world_size` contiguous chunks of `input.numel()` elements.
    fn all_gather(&self, input: &Tensor, output: &Tensor, stream: &dyn DeviceStream) -> Result<()>;

    /// `input` holds `world_size` contiguous chunks of `output.numel()` elements.
    fn reduce_scatter(
        &self,
        input: &Tensor,
        output: &Tensor,
        op: ReduceOp,
        stream: &dyn DeviceStream,
    ) -> Result<()>;

    /// Reduce row-format sparse inputs into the dense `output`.
    fn all_reduce_sparse(
        &self,
        input: &SparseTensor,
        output: &Tensor,
        op: ReduceOp,
        stream: &dyn DeviceStream,
    ) -> Result<()>;
}
