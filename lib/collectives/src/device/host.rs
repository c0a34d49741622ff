// SPDX-FileCopyrightText: Copyright (c) 2025-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Host-memory compute backend.
//!
//! Every stream is a dedicated worker thread draining a FIFO of kernels, so
//! work on one stream runs in issue order while streams run concurrently.
//! Events are host-side flags signalled by a kernel enqueued at record time.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{Sender, unbounded};
use parking_lot::{Condvar, Mutex};

use super::{ComputeBackend, DType, DeviceEvent, DeviceStream, Kernel, Tensor};
use crate::error::{CollectiveError, Result};

#[derive(Debug, Default)]
pub struct HostEvent {
    done: Mutex<bool>,
    cv: Condvar,
}

impl HostEvent {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn complete(&self) {
        *self.done.lock() = true;
        self.cv.notify_all();
    }
}

impl DeviceEvent for HostEvent {
    fn query(&self) -> bool {
        *self.done.lock()
    }

    fn synchronize(&self) {
        let mut done = self.done.lock();
        while !*done {
            self.cv.wait(&mut done);
        }
    }

    fn wait_timeout(&self, timeout: Duration) -> bool {
        let mut done = self.done.lock();
        if !*done {
            self.cv.wait_for(&mut done, timeout);
        }
        *done
    }
}

pub struct HostStream {
    device: usize,
    id: u64,
    high_priority: bool,
    tx: Option<Sender<Kernel>>,
    worker: Option<JoinHandle<()>>,
}

impl HostStream {
    pub fn spawn(device: usize, id: u64, high_priority: bool) -> Result<Self> {
        let (tx, rx) = unbounded::<Kernel>();
        let worker = thread::Builder::new()
            .name(format!("host-stream-d{device}-s{id}"))
            .spawn(move || {
                while let Ok(kernel) = rx.recv() {
                    if catch_unwind(AssertUnwindSafe(kernel)).is_err() {
                        tracing::error!(device, stream = id, "kernel panicked");
                    }
                }
            })
            .map_err(|e| CollectiveError::Device(format!("failed to spawn stream thread: {e}")))?;

        Ok(Self {
            device,
            id,
            high_priority,
            tx: Some(tx),
            worker: Some(worker),
        })
    }

    pub fn is_high_priority(&self) -> bool {
        self.high_priority
    }
}

impl DeviceStream for HostStream {
    fn device(&self) -> usize {
        self.device
    }

    fn id(&self) -> u64 {
        self.id
    }

    fn launch(&self, kernel: Kernel) -> Result<()> {
        let tx = self.tx.as_ref().ok_or_else(|| {
            CollectiveError::Device(format!("stream {} on device {} is closed", self.id, self.device))
        })?;
        tx.send(kernel).map_err(|_| {
            CollectiveError::Device(format!("stream {} on device {} is closed", self.id, self.device))
        })
    }

    fn record_event(&self) -> Result<Arc<dyn DeviceEvent>> {
        let event = Arc::new(HostEvent::new());
        let signal = event.clone();
        self.launch(Box::new(move || signal.complete()))?;
        let event: Arc<dyn DeviceEvent> = event;
        Ok(event)
    }

    fn wait_event(&self, event: Arc<dyn DeviceEvent>) -> Result<()> {
        self.launch(Box::new(move || event.synchronize()))
    }
}

impl Drop for HostStream {
    fn drop(&mut self) {
        // closing the queue lets the worker drain and exit
        self.tx.take();
        if let Some(worker) = self.worker.take() {
            if worker.thread().id() != thread::current().id() && worker.join().is_err() {
                tracing::warn!(device = self.device, stream = self.id, "stream worker panicked");
            }
        }
    }
}

struct HostDevice {
    current: Mutex<Arc<dyn DeviceStream>>,
}

/// Compute backend with `num_devices` simulated devices backed by host memory.
pub struct HostComputeBackend {
    devices: Vec<HostDevice>,
    next_stream_id: AtomicU64,
}

impl HostComputeBackend {
    pub fn new(num_devices: usize) -> Result<Self> {
        if num_devices == 0 {
            return Err(CollectiveError::InvalidArgument(
                "host compute backend needs at least one device".to_string(),
            ));
        }
        let next_stream_id = AtomicU64::new(0);
        let devices = (0..num_devices)
            .map(|device| -> Result<HostDevice> {
                let id = next_stream_id.fetch_add(1, Ordering::Relaxed);
                let stream: Arc<dyn DeviceStream> = Arc::new(HostStream::spawn(device, id, false)?);
                Ok(HostDevice {
                    current: Mutex::new(stream),
                })
            })
            .collect::<Result<Vec<_>>>()?;

        tracing::debug!(num_devices, "host compute backend created");
        Ok(Self {
            devices,
            next_stream_id,
        })
    }

    fn device(&self, device: usize) -> Result<&HostDevice> {
        self.devices.get(device).ok_or_else(|| {
            CollectiveError::InvalidArgument(format!(
                "device {device} out of range for {} devices",
                self.devices.len()
            ))
        })
    }
}

impl ComputeBackend for HostComputeBackend {
    fn device_count(&self) -> usize {
        self.devices.len()
    }

    fn current_stream(&self, device: usize) -> Result<Arc<dyn DeviceStream>> {
        Ok(self.device(device)?.current.lock().clone())
    }

    fn set_current_stream(&self, stream: Arc<dyn DeviceStream>) -> Result<()> {
        let device = stream.device();
        *self.device(device)?.current.lock() = stream;
        Ok(())
    }

    fn new_stream(&self, device: usize, high_priority: bool) -> Result<Arc<dyn DeviceStream>> {
        self.device(device)?;
        let id = self.next_stream_id.fetch_add(1, Ordering::Relaxed);
        let stream: Arc<dyn DeviceStream> = Arc::new(HostStream::spawn(device, id, high_priority)?);
        Ok(stream)
    }

    fn allocate(&self, device: usize, shape: &[usize], dtype: DType) -> Result<Tensor> {
        self.device(device)?;
        Ok(Tensor::zeros(device, shape, dtype))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::MultiStreamGuard;

    #[test]
    fn test_stream_runs_in_issue_order() {
        let stream = HostStream::spawn(0, 0, false).unwrap();
        let log = Arc::new(Mutex::new(Vec::new()));
        for i in 0..16 {
            let log = log.clone();
            stream.launch(Box::new(move || log.lock().push(i))).unwrap();
        }
        stream.synchronize().unwrap();
        assert_eq!(*log.lock(), (0..16).collect::<Vec<_>>());
    }

    #[test]
    fn test_wait_event_orders_across_streams() {
        let producer = HostStream::spawn(0, 0, false).unwrap();
        let consumer = HostStream::spawn(0, 1, false).unwrap();
        let gate = Arc::new(HostEvent::new());
        let value = Arc::new(Mutex::new(0));

        {
            let gate = gate.clone();
            producer.launch(Box::new(move || gate.synchronize())).unwrap();
        }
        {
            let value = value.clone();
            producer.launch(Box::new(move || *value.lock() = 1)).unwrap();
        }
        consumer.wait_event(producer.record_event().unwrap()).unwrap();
        let observed = Arc::new(Mutex::new(None));
        {
            let value = value.clone();
            let observed = observed.clone();
            consumer
                .launch(Box::new(move || *observed.lock() = Some(*value.lock())))
                .unwrap();
        }

        let done = consumer.record_event().unwrap();
        assert!(!done.wait_timeout(Duration::from_millis(20)));
        gate.complete();
        done.synchronize();
        assert_eq!(*observed.lock(), Some(1));
    }

    #[test]
    fn test_kernel_panic_does_not_kill_stream() {
        let stream = HostStream::spawn(0, 0, false).unwrap();
        stream.launch(Box::new(|| panic!("boom"))).unwrap();
        let event = stream.record_event().unwrap();
        assert!(event.wait_timeout(Duration::from_secs(5)));
    }

    #[test]
    fn test_backend_streams() {
        let backend = HostComputeBackend::new(2).unwrap();
        assert_eq!(backend.device_count(), 2);
        assert!(backend.current_stream(2).is_err());
        assert!(backend.allocate(3, &[1], DType::Float32).is_err());

        let stream = backend.new_stream(1, true).unwrap();
        assert_eq!(stream.device(), 1);
        let default_id = backend.current_stream(1).unwrap().id();
        assert_ne!(stream.id(), default_id);

        let backend: Arc<dyn ComputeBackend> = Arc::new(backend);
        {
            let _guard = MultiStreamGuard::new(backend.clone(), &[stream.clone()]).unwrap();
            assert_eq!(backend.current_stream(1).unwrap().id(), stream.id());
        }
        assert_eq!(backend.current_stream(1).unwrap().id(), default_id);
    }

    #[test]
    fn test_zero_devices_rejected() {
        assert!(HostComputeBackend::new(0).is_err());
    }
}
