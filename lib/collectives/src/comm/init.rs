// SPDX-FileCopyrightText: Copyright (c) 2025-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use super::DeviceKey;
use crate::backend::{CommInitState, DeviceComm};
use crate::error::{CollectiveError, Result};

/// Tracks non-blocking initialization of the device channels of one communicator.
///
/// Both the creating thread and the watchdog poll an attempt; whichever
/// observes the terminal condition first records the outcome and wakes the
/// other. A failed or timed-out attempt aborts every device channel.
pub(crate) struct InitAttempt {
    rank: usize,
    key: DeviceKey,
    comms: Vec<Arc<dyn DeviceComm>>,
    started: Instant,
    timeout: Duration,
    outcome: Mutex<Option<Result<()>>>,
    settled: Condvar,
}

impl InitAttempt {
    pub fn new(
        rank: usize,
        key: DeviceKey,
        comms: Vec<Arc<dyn DeviceComm>>,
        started: Instant,
        timeout: Duration,
    ) -> Self {
        Self {
            rank,
            key,
            comms,
            started,
            timeout,
            outcome: Mutex::new(None),
            settled: Condvar::new(),
        }
    }

    pub fn is_finished(&self) -> bool {
        self.outcome.lock().is_some()
    }

    /// Returns the outcome once the attempt is settled.
    pub fn poll(&self) -> Option<Result<()>> {
        if let Some(outcome) = self.outcome.lock().clone() {
            return Some(outcome);
        }

        let mut pending = 0;
        for comm in &self.comms {
            match comm.init_state() {
                CommInitState::Ready => {}
                CommInitState::InProgress => pending += 1,
                CommInitState::Failed(reason) => {
                    return self.settle(Err(CollectiveError::AsyncBackendError {
                        rank: self.rank,
                        reason: format!(
                            "communicator init failed on device {}: {reason}",
                            comm.device()
                        ),
                    }));
                }
            }
        }

        if pending == 0 {
            return self.settle(Ok(()));
        }

        let elapsed = self.started.elapsed();
        if elapsed >= self.timeout {
            return self.settle(Err(CollectiveError::CommInitTimeout {
                rank: self.rank,
                devices: self.key.to_string(),
                elapsed,
                reason: format!(
                    "{pending} of {} device channels still waiting for peers",
                    self.comms.len()
                ),
            }));
        }
        None
    }

    /// Block until the attempt settles, polling every `interval`.
    pub fn wait(&self, interval: Duration) -> Result<()> {
        loop {
            if let Some(outcome) = self.poll() {
                return outcome;
            }
            let mut outcome = self.outcome.lock();
            if outcome.is_none() {
                self.settled.wait_for(&mut outcome, interval);
            }
        }
    }

    fn settle(&self, result: Result<()>) -> Option<Result<()>> {
        let mut outcome = self.outcome.lock();
        if let Some(existing) = &*outcome {
            return Some(existing.clone());
        }
        *outcome = Some(result.clone());
        drop(outcome);
        self.settled.notify_all();

        match &result {
            Ok(()) => tracing::debug!(
                rank = self.rank,
                devices = %self.key,
                elapsed_ms = self.started.elapsed().as_millis() as u64,
                "communicator ready"
            ),
            Err(err) => {
                tracing::error!(rank = self.rank, devices = %self.key, error = %err, "communicator init failed");
                let reason = err.to_string();
                for comm in &self.comms {
                    comm.abort(&reason);
                }
            }
        }
        Some(result)
    }
}
