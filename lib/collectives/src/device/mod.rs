// SPDX-FileCopyrightText: Copyright (c) 2025-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Compute backend abstraction: device buffers, streams and events.
//!
//! The process group only needs a narrow view of the compute runtime:
//!
//! - allocate a buffer on device `d`
//! - get/set the current stream of device `d`
//! - order one stream after an event recorded on another
//! - synchronize a stream and copy a buffer back to the host
//!
//! A stream executes enqueued kernels in issue order; different streams are
//! independent. [`HostComputeBackend`] implements the contract with one OS
//! thread per stream.

mod host;
mod sparse;
mod tensor;

pub use host::{HostComputeBackend, HostEvent, HostStream};
pub use sparse::SparseTensor;
pub use tensor::{DType, Tensor};

use std::sync::Arc;
use std::time::Duration;

use crate::error::Result;

/// Unit of device work enqueued on a stream.
pub type Kernel = Box<dyn FnOnce() + Send + 'static>;

/// Completion marker recorded on a stream.
pub trait DeviceEvent: Send + Sync {
    /// Non-blocking completion check.
    fn query(&self) -> bool;

    /// Block until the event completes.
    fn synchronize(&self);

    /// Block up to `timeout`; returns whether the event completed.
    fn wait_timeout(&self, timeout: Duration) -> bool;
}

/// Ordered execution queue bound to one device.
pub trait DeviceStream: Send + Sync {
    fn device(&self) -> usize;

    fn id(&self) -> u64;

    /// Enqueue a kernel behind all previously enqueued work.
    fn launch(&self, kernel: Kernel) -> Result<()>;

    /// Record an event that completes once all work enqueued so far has run.
    fn record_event(&self) -> Result<Arc<dyn DeviceEvent>>;

    /// Make all future work on this stream wait for `event`.
    fn wait_event(&self, event: Arc<dyn DeviceEvent>) -> Result<()>;

    /// Block the calling thread until all enqueued work has run.
    fn synchronize(&self) -> Result<()> {
        self.record_event()?.synchronize();
        Ok(())
    }
}

/// External compute runtime providing devices, streams and buffers.
pub trait ComputeBackend: Send + Sync {
    fn device_count(&self) -> usize;

    /// The stream that user work on `device` is currently issued to.
    fn current_stream(&self, device: usize) -> Result<Arc<dyn DeviceStream>>;

    /// Make `stream` the current stream of its device.
    fn set_current_stream(&self, stream: Arc<dyn DeviceStream>) -> Result<()>;

    /// Create a new stream on `device`.
    fn new_stream(&self, device: usize, high_priority: bool) -> Result<Arc<dyn DeviceStream>>;

    /// Allocate a zero-initialized buffer on `device`.
    fn allocate(&self, device: usize, shape: &[usize], dtype: DType) -> Result<Tensor>;
}

/// Makes a set of streams current for their devices and restores the
/// previous current streams on drop.
pub struct MultiStreamGuard {
    backend: Arc<dyn ComputeBackend>,
    previous: Vec<Arc<dyn DeviceStream>>,
}

impl MultiStreamGuard {
    pub fn new(backend: Arc<dyn ComputeBackend>, streams: &[Arc<dyn DeviceStream>]) -> Result<Self> {
        let mut previous = Vec::with_capacity(streams.len());
        for stream in streams {
            previous.push(backend.current_stream(stream.device())?);
            backend.set_current_stream(stream.clone())?;
        }
        Ok(Self { backend, previous })
    }
}

impl Drop for MultiStreamGuard {
    fn drop(&mut self) {
        for stream in self.previous.drain(..).rev() {
            if let Err(e) = self.backend.set_current_stream(stream) {
                tracing::warn!("failed to restore current stream: {e}");
            }
        }
    }
}
