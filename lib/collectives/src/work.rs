// SPDX-FileCopyrightText: Copyright (c) 2025-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Completion handles for issued collectives.
//!
//! A [`Work`] is returned as soon as a collective has been enqueued on the
//! communicator streams. Its status moves from `Pending` to exactly one
//! terminal state and never changes afterwards. The status is driven by
//! polling: the caller's [`Work::wait`] / [`Work::is_completed`] and the
//! process group watchdog both call into the same `poll` routine.

use std::fmt;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use serde::{Deserialize, Serialize};

use crate::comm::Communicator;
use crate::device::{ComputeBackend, DeviceEvent, SparseTensor, Tensor};
use crate::error::{CollectiveError, Result};

const WAIT_POLL_INTERVAL: Duration = Duration::from_millis(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OpType {
    AllReduce,
    SparseAllReduce,
    Broadcast,
    Reduce,
    AllGather,
    AllGatherBase,
    ReduceScatter,
    ReduceScatterBase,
    Barrier,
}

impl OpType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::AllReduce => "all_reduce",
            Self::SparseAllReduce => "sparse_all_reduce",
            Self::Broadcast => "broadcast",
            Self::Reduce => "reduce",
            Self::AllGather => "all_gather",
            Self::AllGatherBase => "all_gather_base",
            Self::ReduceScatter => "reduce_scatter",
            Self::ReduceScatterBase => "reduce_scatter_base",
            Self::Barrier => "barrier",
        }
    }
}

impl fmt::Display for OpType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone)]
pub enum WorkStatus {
    Pending,
    Success,
    Error(CollectiveError),
    TimedOut(CollectiveError),
}

impl WorkStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Pending)
    }

    pub fn error(&self) -> Option<&CollectiveError> {
        match self {
            Self::Error(err) | Self::TimedOut(err) => Some(err),
            _ => None,
        }
    }
}

/// Tensor produced by a collective, available after successful completion.
#[derive(Debug, Clone)]
pub enum WorkOutput {
    Dense(Tensor),
    Sparse(SparseTensor),
}

impl WorkOutput {
    pub fn as_dense(&self) -> Option<&Tensor> {
        match self {
            Self::Dense(tensor) => Some(tensor),
            Self::Sparse(_) => None,
        }
    }

    pub fn as_sparse(&self) -> Option<&SparseTensor> {
        match self {
            Self::Sparse(tensor) => Some(tensor),
            Self::Dense(_) => None,
        }
    }
}

/// Everything captured when a collective is launched.
pub(crate) struct WorkLaunch {
    pub rank: usize,
    pub seq: u64,
    pub op: OpType,
    pub devices: Vec<usize>,
    pub communicator: Weak<Communicator>,
    pub compute: Arc<dyn ComputeBackend>,
    pub end_events: Vec<Arc<dyn DeviceEvent>>,
    pub outputs: Vec<WorkOutput>,
    pub timeout: Duration,
    pub blocking_wait: bool,
}

pub(crate) struct WorkInner {
    launch: WorkLaunch,
    started: Instant,
    status: Mutex<WorkStatus>,
    settled: Condvar,
}

impl WorkInner {
    pub fn is_terminal(&self) -> bool {
        self.status.lock().is_terminal()
    }

    pub fn status(&self) -> WorkStatus {
        self.status.lock().clone()
    }

    /// Advance the status if a terminal condition holds. Returns whether
    /// the work is terminal.
    ///
    /// Communicator faults are checked before event completion, so a
    /// collective running on an aborted communicator never reports success.
    pub fn poll(&self) -> bool {
        if self.is_terminal() {
            return true;
        }

        let communicator = self.launch.communicator.upgrade();
        if let Some(cause) = communicator.as_ref().and_then(|c| c.poll_async_error()) {
            self.settle(WorkStatus::Error(cause));
            return true;
        }

        if self.launch.end_events.iter().all(|event| event.query()) {
            self.settle(WorkStatus::Success);
            return true;
        }

        if self.started.elapsed() >= self.launch.timeout {
            self.expire(communicator.as_deref(), self.launch.timeout);
            return true;
        }
        false
    }

    fn expire(&self, communicator: Option<&Communicator>, timeout: Duration) {
        let err = CollectiveError::TimedOut {
            rank: self.launch.rank,
            op: self.launch.op,
            seq: self.launch.seq,
            timeout,
        };
        // settle before aborting so a concurrent poll cannot record the abort as an Error
        if self.settle(WorkStatus::TimedOut(err.clone())) {
            if let Some(communicator) = communicator {
                communicator.abort(err);
            }
        }
    }

    fn settle(&self, next: WorkStatus) -> bool {
        let mut status = self.status.lock();
        if status.is_terminal() {
            return false;
        }
        *status = next.clone();
        drop(status);
        self.settled.notify_all();

        let WorkLaunch { rank, seq, op, .. } = &self.launch;
        match &next {
            WorkStatus::Success => {
                tracing::trace!(rank, seq, op = %op, "collective completed");
            }
            WorkStatus::Error(err) => {
                tracing::error!(rank, seq, op = %op, error = %err, "collective failed");
            }
            WorkStatus::TimedOut(err) => {
                tracing::error!(rank, seq, op = %op, error = %err, "collective timed out");
            }
            WorkStatus::Pending => {}
        }
        true
    }
}

/// Handle to one issued collective.
#[derive(Clone)]
pub struct Work {
    inner: Arc<WorkInner>,
}

impl Work {
    pub(crate) fn new(launch: WorkLaunch) -> Self {
        Self {
            inner: Arc::new(WorkInner {
                launch,
                started: Instant::now(),
                status: Mutex::new(WorkStatus::Pending),
                settled: Condvar::new(),
            }),
        }
    }

    pub(crate) fn inner(&self) -> &Arc<WorkInner> {
        &self.inner
    }

    pub fn sequence_number(&self) -> u64 {
        self.inner.launch.seq
    }

    pub fn op_type(&self) -> OpType {
        self.inner.launch.op
    }

    pub fn status(&self) -> WorkStatus {
        self.inner.status()
    }

    /// Non-blocking completion check.
    pub fn is_completed(&self) -> bool {
        self.inner.poll()
    }

    pub fn is_success(&self) -> bool {
        self.inner.poll() && matches!(self.inner.status(), WorkStatus::Success)
    }

    pub fn exception(&self) -> Option<CollectiveError> {
        self.inner.poll();
        self.inner.status().error().cloned()
    }

    /// Output tensors, in device order. Only meaningful after success.
    pub fn result(&self) -> Vec<WorkOutput> {
        self.inner.launch.outputs.clone()
    }

    /// Make the caller's current streams wait for the collective to finish.
    pub fn synchronize(&self) -> Result<()> {
        let launch = &self.inner.launch;
        for (&device, event) in launch.devices.iter().zip(&launch.end_events) {
            launch
                .compute
                .current_stream(device)?
                .wait_event(event.clone())?;
        }
        Ok(())
    }

    /// Wait for completion.
    ///
    /// Without an explicit `timeout` and with blocking wait disabled this
    /// only orders the current streams after the collective and returns;
    /// errors then surface through the watchdog. Otherwise the caller blocks
    /// until a terminal state, bounded by `timeout` measured from this call
    /// and by the group timeout measured from launch. Repeated calls return
    /// the same outcome.
    pub fn wait(&self, timeout: Option<Duration>) -> Result<bool> {
        let inner = &self.inner;
        if timeout.is_none() && !inner.launch.blocking_wait {
            self.synchronize()?;
            return match inner.status().error() {
                Some(err) => Err(err.clone()),
                None => Ok(true),
            };
        }

        let deadline = timeout.map(|t| (Instant::now() + t, t));
        while !inner.poll() {
            if let Some((deadline, limit)) = deadline {
                if Instant::now() >= deadline {
                    let communicator = inner.launch.communicator.upgrade();
                    inner.expire(communicator.as_deref(), limit);
                    break;
                }
            }
            let mut status = inner.status.lock();
            if !status.is_terminal() {
                inner.settled.wait_for(&mut status, WAIT_POLL_INTERVAL);
            }
        }

        match inner.status() {
            WorkStatus::Success => {
                self.synchronize()?;
                Ok(true)
            }
            WorkStatus::Error(err) | WorkStatus::TimedOut(err) => Err(err),
            WorkStatus::Pending => Ok(false),
        }
    }
}

impl fmt::Debug for Work {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Work")
            .field("seq", &self.inner.launch.seq)
            .field("op", &self.inner.launch.op)
            .field("devices", &self.inner.launch.devices)
            .field("status", &self.inner.status())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{DType, HostComputeBackend, HostEvent};
    use crate::error::ErrorKind;

    fn work(event: &Arc<HostEvent>, timeout: Duration, blocking_wait: bool) -> Work {
        let event: Arc<dyn DeviceEvent> = event.clone();
        let compute: Arc<dyn ComputeBackend> = Arc::new(HostComputeBackend::new(1).unwrap());
        let output = compute.allocate(0, &[2], DType::Float32).unwrap();
        Work::new(WorkLaunch {
            rank: 0,
            seq: 7,
            op: OpType::AllReduce,
            devices: vec![0],
            communicator: Weak::new(),
            compute,
            end_events: vec![event],
            outputs: vec![WorkOutput::Dense(output)],
            timeout,
            blocking_wait,
        })
    }

    #[test]
    fn test_op_type_display() {
        assert_eq!(OpType::ReduceScatterBase.to_string(), "reduce_scatter_base");
        assert_eq!(
            serde_json::to_string(&OpType::AllGather).unwrap(),
            "\"all_gather\""
        );
    }

    #[test]
    fn test_success_is_sticky() {
        let event = Arc::new(HostEvent::new());
        let work = work(&event, Duration::from_secs(5), true);
        assert!(!work.is_completed());
        assert!(matches!(work.status(), WorkStatus::Pending));

        event.complete();
        assert!(work.wait(None).unwrap());
        assert!(work.is_success());
        assert!(work.wait(None).unwrap());
        assert!(work.exception().is_none());
        assert_eq!(work.sequence_number(), 7);
        assert!(work.result()[0].as_dense().is_some());
    }

    #[test]
    fn test_explicit_timeout() {
        let event = Arc::new(HostEvent::new());
        let work = work(&event, Duration::from_secs(60), true);

        let started = Instant::now();
        let err = work.wait(Some(Duration::from_millis(50))).unwrap_err();
        assert!(started.elapsed() < Duration::from_secs(5));
        assert_eq!(err.kind(), ErrorKind::TimedOut);
        assert!(matches!(work.status(), WorkStatus::TimedOut(_)));

        // a late completion does not revive the work
        event.complete();
        assert!(work.wait(None).is_err());
        assert!(!work.is_success());
    }

    #[test]
    fn test_group_timeout_applies_to_poll() {
        let event = Arc::new(HostEvent::new());
        let work = work(&event, Duration::from_millis(20), true);
        std::thread::sleep(Duration::from_millis(40));
        assert!(work.is_completed());
        assert_eq!(work.exception().unwrap().kind(), ErrorKind::TimedOut);
    }

    #[test]
    fn test_non_blocking_wait_returns_immediately() {
        let event = Arc::new(HostEvent::new());
        let work = work(&event, Duration::from_secs(60), false);
        assert!(work.wait(None).unwrap());
        assert!(!work.is_completed());

        let compute = work.inner.launch.compute.clone();
        let current = compute.current_stream(0).unwrap();
        let marker = current.record_event().unwrap();
        assert!(!marker.wait_timeout(Duration::from_millis(20)));
        event.complete();
        assert!(marker.wait_timeout(Duration::from_secs(5)));
    }
}
