// SPDX-FileCopyrightText: Copyright (c) 2025-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Multi-rank harness: every rank is an OS thread with its own compute
//! backend, sharing one rendezvous store and one local collective fabric.

#![allow(dead_code)]

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use dynamo_collectives::device::{DeviceStream, MultiStreamGuard};
use dynamo_collectives::{
    Backends, CollectivesConfig, ComputeBackend, DType, HostComputeBackend, LocalCollectiveBackend,
    MemoryStore, ProcessGroup, ProcessGroupOptions, Store, Tensor,
};

pub const WORLD: usize = 2;
pub const DEVICES: usize = 2;

pub struct RankContext {
    pub rank: usize,
    pub world: usize,
    pub devices: usize,
    pub pg: Arc<ProcessGroup>,
    pub store: Arc<dyn Store>,
    pub backends: Backends,
    pub compute: Arc<HostComputeBackend>,
    pub collectives: LocalCollectiveBackend,
}

impl RankContext {
    /// One `[3, 3]` tensor per local device, filled with `rank * D + i`.
    pub fn ranked_tensors(&self) -> Vec<Tensor> {
        (0..self.devices)
            .map(|i| Tensor::full(i, &[3, 3], DType::Float32, (self.rank * self.devices + i) as f64))
            .collect()
    }

    /// Number of participants: ranks times devices.
    pub fn participants(&self) -> usize {
        self.world * self.devices
    }

    /// Block until the current streams have drained everything enqueued so far.
    pub fn sync_current_streams(&self) {
        for device in 0..self.devices {
            self.compute.current_stream(device).unwrap().synchronize().unwrap();
        }
    }
}

pub fn test_config() -> CollectivesConfig {
    CollectivesConfig::builder()
        .timeout_ms(30_000u64)
        .watchdog_poll_interval_ms(10u64)
        .build()
        .unwrap()
}

pub fn run_ranks<F, T>(world: usize, devices: usize, config: CollectivesConfig, f: F) -> Vec<T>
where
    F: Fn(RankContext) -> T + Send + Sync + 'static,
    T: Send + 'static,
{
    dynamo_collectives::logging::init();

    let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
    let collectives = LocalCollectiveBackend::new();
    let f = Arc::new(f);

    let handles: Vec<_> = (0..world)
        .map(|rank| {
            let store = store.clone();
            let collectives = collectives.clone();
            let config = config.clone();
            let f = f.clone();
            thread::Builder::new()
                .name(format!("rank-{rank}"))
                .spawn(move || {
                    let compute = Arc::new(HostComputeBackend::new(devices).unwrap());

                    // collectives must order against user streams, not the defaults
                    let streams: Vec<Arc<dyn DeviceStream>> = (0..devices)
                        .map(|d| compute.new_stream(d, false).unwrap())
                        .collect();
                    let _guard = MultiStreamGuard::new(compute.clone(), &streams).unwrap();

                    let backends = Backends::new(compute.clone(), Arc::new(collectives.clone()));
                    let options = ProcessGroupOptions::builder().config(config).build().unwrap();
                    let pg = ProcessGroup::new(store.clone(), rank, world, backends.clone(), options).unwrap();

                    f(RankContext {
                        rank,
                        world,
                        devices,
                        pg,
                        store,
                        backends,
                        compute,
                        collectives,
                    })
                })
                .unwrap()
        })
        .collect();

    handles
        .into_iter()
        .map(|handle| handle.join().expect("rank thread panicked"))
        .collect()
}

pub fn eventually(mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(10);
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    false
}

pub fn assert_all(tensor: &Tensor, expected: f64) {
    for (i, value) in tensor.to_vec().into_iter().enumerate() {
        assert_eq!(value, expected, "element {i} on device {}", tensor.device());
    }
}
