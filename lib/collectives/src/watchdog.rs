// SPDX-FileCopyrightText: Copyright (c) 2025-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Background thread that drives in-flight work and communicator init to a
//! terminal state even when no caller is waiting.
//!
//! The registry only holds weak references; dropping a [`Work`](crate::Work)
//! handle or a communicator removes it from watch on the next pass.

use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

use crate::comm::{Communicator, InitAttempt};
use crate::error::{CollectiveError, Result};
use crate::work::WorkInner;

#[derive(Default)]
struct Registry {
    works: Vec<Weak<WorkInner>>,
    inits: Vec<Weak<InitAttempt>>,
    communicators: Vec<Weak<Communicator>>,
}

#[derive(Default)]
struct Shared {
    registry: Mutex<Registry>,
    stopped: Mutex<bool>,
    wake: Condvar,
}

pub(crate) struct Watchdog {
    shared: Arc<Shared>,
    worker: Option<JoinHandle<()>>,
}

impl Watchdog {
    /// Start the watchdog thread for the group `name`.
    ///
    /// With `handle_async_errors` off the thread still drives communicator
    /// init, but leaves work and communicator faults to explicit waits.
    pub fn start(
        name: &str,
        rank: usize,
        poll_interval: Duration,
        handle_async_errors: bool,
    ) -> Result<Self> {
        let shared = Arc::new(Shared::default());
        let worker = thread::Builder::new()
            .name(format!("watchdog-{name}-r{rank}"))
            .spawn({
                let shared = shared.clone();
                move || run(&shared, rank, poll_interval, handle_async_errors)
            })
            .map_err(|e| CollectiveError::Device(format!("failed to spawn watchdog thread: {e}")))?;

        tracing::debug!(
            group = name,
            rank,
            poll_interval_ms = poll_interval.as_millis() as u64,
            handle_async_errors,
            "watchdog started"
        );
        Ok(Self {
            shared,
            worker: Some(worker),
        })
    }

    pub fn watch_work(&self, work: &Arc<WorkInner>) {
        self.shared.registry.lock().works.push(Arc::downgrade(work));
    }

    pub fn watch_init(&self, attempt: &Arc<InitAttempt>) {
        self.shared.registry.lock().inits.push(Arc::downgrade(attempt));
    }

    pub fn watch_communicator(&self, communicator: &Arc<Communicator>) {
        self.shared
            .registry
            .lock()
            .communicators
            .push(Arc::downgrade(communicator));
    }

    #[cfg(test)]
    fn watched(&self) -> (usize, usize, usize) {
        let registry = self.shared.registry.lock();
        (
            registry.works.len(),
            registry.inits.len(),
            registry.communicators.len(),
        )
    }
}

impl Drop for Watchdog {
    fn drop(&mut self) {
        *self.shared.stopped.lock() = true;
        self.shared.wake.notify_all();
        if let Some(worker) = self.worker.take() {
            if worker.thread().id() != thread::current().id() && worker.join().is_err() {
                tracing::warn!("watchdog thread panicked");
            }
        }
    }
}

fn upgrade_all<T>(list: &mut Vec<Weak<T>>) -> Vec<Arc<T>> {
    list.retain(|weak| weak.strong_count() > 0);
    list.iter().filter_map(Weak::upgrade).collect()
}

fn prune<T>(list: &mut Vec<Weak<T>>, done: &[Arc<T>]) {
    list.retain(|weak| {
        weak.strong_count() > 0
            && !done
                .iter()
                .any(|arc| std::ptr::eq(Arc::as_ptr(arc), weak.as_ptr()))
    });
}

fn run(shared: &Shared, rank: usize, poll_interval: Duration, handle_async_errors: bool) {
    loop {
        {
            let mut stopped = shared.stopped.lock();
            if !*stopped {
                shared.wake.wait_for(&mut stopped, poll_interval);
            }
            if *stopped {
                break;
            }
        }

        let (works, inits, communicators) = {
            let mut registry = shared.registry.lock();
            (
                upgrade_all(&mut registry.works),
                upgrade_all(&mut registry.inits),
                upgrade_all(&mut registry.communicators),
            )
        };

        let settled_inits: Vec<_> = inits
            .iter()
            .filter(|attempt| attempt.poll().is_some())
            .cloned()
            .collect();

        let mut finished_works = Vec::new();
        let mut aborted = Vec::new();
        if handle_async_errors {
            for communicator in &communicators {
                if communicator.poll_async_error().is_some() {
                    aborted.push(communicator.clone());
                }
            }
            for work in &works {
                if work.poll() {
                    finished_works.push(work.clone());
                }
            }
        }

        {
            let mut registry = shared.registry.lock();
            prune(&mut registry.works, &finished_works);
            prune(&mut registry.inits, &settled_inits);
            prune(&mut registry.communicators, &aborted);
        }
        if !aborted.is_empty() || !finished_works.is_empty() {
            tracing::trace!(
                rank,
                finished = finished_works.len(),
                aborted = aborted.len(),
                "watchdog pass"
            );
        }
    }
    tracing::debug!(rank, "watchdog stopped");
}
