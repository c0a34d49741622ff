// SPDX-FileCopyrightText: Copyright (c) 2025-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use super::{ChannelOrigin, Communicator, DeviceKey, InitAttempt, bootstrap};
use crate::backend::{CollectiveBackend, DeviceComm};
use crate::device::ComputeBackend;
use crate::error::{CollectiveError, Result};
use crate::store::Store;
use crate::watchdog::Watchdog;

const INIT_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Everything a cache needs from its owning process group to build a communicator.
pub(crate) struct CommContext<'a> {
    pub rank: usize,
    pub size: usize,
    pub store: &'a dyn Store,
    pub compute: &'a dyn ComputeBackend,
    pub collectives: &'a dyn CollectiveBackend,
    pub timeout: Duration,
    pub high_priority: bool,
    pub watchdog: &'a Watchdog,
}

/// Parent group a new communicator may be split from.
pub(crate) struct SplitSource<'a> {
    pub parent: &'a CommunicatorCache,
    pub color: i32,
}

/// Per-group map from device set to communicator.
///
/// Entries are only removed explicitly; an aborted communicator stays cached
/// so later collectives on it fail fast with the original cause.
///
/// Creation is serialized per device key: a second caller racing on a miss
/// blocks until the first finishes and then takes the cached entry, so one
/// rank never joins the same bootstrap round twice.
#[derive(Default)]
pub(crate) struct CommunicatorCache {
    entries: Mutex<HashMap<DeviceKey, Arc<Communicator>>>,
    creating: Mutex<HashMap<DeviceKey, Arc<Mutex<()>>>>,
    generation: AtomicU64,
    split_count: AtomicU64,
}

impl CommunicatorCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &DeviceKey) -> Option<Arc<Communicator>> {
        self.entries.lock().get(key).cloned()
    }

    pub fn communicators(&self) -> Vec<Arc<Communicator>> {
        self.entries.lock().values().cloned().collect()
    }

    pub fn remove(&self, key: &DeviceKey) -> Option<Arc<Communicator>> {
        self.entries.lock().remove(key)
    }

    /// Number of per-device split requests issued against this cache's communicators.
    pub fn split_count(&self) -> u64 {
        self.split_count.load(Ordering::Acquire)
    }

    pub fn get_or_create(
        &self,
        ctx: &CommContext<'_>,
        key: &DeviceKey,
        split: Option<SplitSource<'_>>,
    ) -> Result<Arc<Communicator>> {
        if let Some(existing) = self.get(key) {
            tracing::debug!(rank = ctx.rank, devices = %key, communicator = %existing.id(), "communicator cache hit");
            return Ok(existing);
        }

        let creation = self.creation_lock(key);
        let _creating = creation.lock();
        if let Some(existing) = self.get(key) {
            tracing::debug!(rank = ctx.rank, devices = %key, communicator = %existing.id(), "communicator created concurrently");
            return Ok(existing);
        }
        self.create(ctx, key, split)
    }

    fn creation_lock(&self, key: &DeviceKey) -> Arc<Mutex<()>> {
        self.creating
            .lock()
            .entry(key.clone())
            .or_default()
            .clone()
    }

    fn create(
        &self,
        ctx: &CommContext<'_>,
        key: &DeviceKey,
        split: Option<SplitSource<'_>>,
    ) -> Result<Arc<Communicator>> {
        let started = Instant::now();
        let parent = split.and_then(|source| {
            source
                .parent
                .get(key)
                .filter(|parent| !parent.is_aborted())
                .map(|parent| (source, parent))
        });

        let (origin, comms) = match parent {
            Some((source, parent)) => {
                let comms = self.split_comms(ctx, key, &source, &parent)?;
                let origin = ChannelOrigin::SplitFrom {
                    parent_id: parent.id(),
                    color: source.color,
                };
                (origin, comms)
            }
            None => self.bootstrap_comms(ctx, key)?,
        };

        let streams = key
            .devices()
            .iter()
            .map(|&device| ctx.compute.new_stream(device, ctx.high_priority))
            .collect::<Result<Vec<_>>>()?;
        let communicator = Arc::new(Communicator::new(ctx.rank, key.clone(), origin, comms, streams));

        let attempt = Arc::new(InitAttempt::new(
            ctx.rank,
            key.clone(),
            communicator.comms().to_vec(),
            started,
            ctx.timeout,
        ));
        ctx.watchdog.watch_init(&attempt);
        if let Err(err) = attempt.wait(INIT_POLL_INTERVAL) {
            return Err(communicator.abort(err));
        }
        Self::check_shape(ctx, &communicator)?;

        self.entries.lock().insert(key.clone(), communicator.clone());
        ctx.watchdog.watch_communicator(&communicator);

        tracing::info!(
            rank = ctx.rank,
            devices = %key,
            communicator = %communicator.id(),
            origin = ?communicator.origin(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "communicator initialized"
        );
        Ok(communicator)
    }

    fn bootstrap_comms(
        &self,
        ctx: &CommContext<'_>,
        key: &DeviceKey,
    ) -> Result<(ChannelOrigin, Vec<Arc<dyn DeviceComm>>)> {
        let per_rank = key.len();
        let world_size = ctx.size * per_rank;
        for i in 0..per_rank {
            ctx.collectives
                .validate_rank(ctx.rank * per_rank + i, world_size)?;
        }

        let generation = self.generation.fetch_add(1, Ordering::AcqRel);
        let info = bootstrap::exchange(
            ctx.store,
            ctx.collectives,
            ctx.rank,
            ctx.size,
            key,
            generation,
            ctx.timeout,
        )?;

        let comms = key
            .devices()
            .iter()
            .enumerate()
            .map(|(i, &device)| {
                ctx.collectives
                    .init_rank(&info.unique_id, world_size, ctx.rank * per_rank + i, device)
            })
            .collect::<Result<Vec<_>>>()?;

        let origin = ChannelOrigin::Fresh {
            bootstrap_id: info.unique_id,
        };
        Ok((origin, comms))
    }

    fn split_comms(
        &self,
        ctx: &CommContext<'_>,
        key: &DeviceKey,
        source: &SplitSource<'_>,
        parent: &Communicator,
    ) -> Result<Vec<Arc<dyn DeviceComm>>> {
        let per_rank = key.len();
        let mut comms = Vec::with_capacity(per_rank);
        for (i, comm) in parent.comms().iter().enumerate() {
            let child = comm
                .split(Some(source.color), ctx.rank * per_rank + i)?
                .ok_or_else(|| {
                    CollectiveError::InvalidArgument(format!(
                        "split with color {} produced no communicator on device {}",
                        source.color,
                        comm.device()
                    ))
                })?;
            comms.push(child);
            source.parent.split_count.fetch_add(1, Ordering::AcqRel);
        }
        tracing::debug!(
            rank = ctx.rank,
            devices = %key,
            parent = %parent.id(),
            color = source.color,
            "splitting communicator from parent group"
        );
        Ok(comms)
    }

    /// Every device channel must sit at `rank * D + i` in a world of `size * D`.
    fn check_shape(ctx: &CommContext<'_>, communicator: &Communicator) -> Result<()> {
        let per_rank = communicator.key().len();
        let world_size = ctx.size * per_rank;
        for (i, comm) in communicator.comms().iter().enumerate() {
            let expected = ctx.rank * per_rank + i;
            if comm.world_size() != world_size || comm.rank() != expected {
                let err = CollectiveError::ShapeMismatch(format!(
                    "device channel {} is rank {} of {}, expected rank {expected} of {world_size}",
                    comm.device(),
                    comm.rank(),
                    comm.world_size()
                ));
                return Err(communicator.abort(err));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::thread;

    use super::*;
    use crate::backend::LocalCollectiveBackend;
    use crate::device::HostComputeBackend;
    use crate::error::ErrorKind;
    use crate::store::{MemoryStore, PrefixStore};

    struct Rank {
        rank: usize,
        size: usize,
        store: Arc<dyn Store>,
        compute: HostComputeBackend,
        collectives: LocalCollectiveBackend,
        watchdog: Watchdog,
        timeout: Duration,
    }

    impl Rank {
        fn new(rank: usize, size: usize, store: Arc<dyn Store>, collectives: LocalCollectiveBackend, timeout: Duration) -> Self {
            Self {
                rank,
                size,
                store,
                compute: HostComputeBackend::new(2).unwrap(),
                collectives,
                watchdog: Watchdog::start("test", rank, Duration::from_millis(10), true).unwrap(),
                timeout,
            }
        }

        fn ctx(&self) -> CommContext<'_> {
            CommContext {
                rank: self.rank,
                size: self.size,
                store: self.store.as_ref(),
                compute: &self.compute,
                collectives: &self.collectives,
                timeout: self.timeout,
                high_priority: false,
                watchdog: &self.watchdog,
            }
        }
    }

    #[test]
    fn test_fresh_then_split() {
        let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
        let collectives = LocalCollectiveBackend::new();
        let key = DeviceKey::new(&[0, 1]).unwrap();

        let handles: Vec<_> = (0..2)
            .map(|rank| {
                let store = store.clone();
                let collectives = collectives.clone();
                let key = key.clone();
                thread::spawn(move || {
                    let parent_rank = Rank::new(rank, 2, Arc::new(PrefixStore::new("parent", store.clone())), collectives.clone(), Duration::from_secs(10));
                    let parent = CommunicatorCache::new();
                    let first = parent.get_or_create(&parent_rank.ctx(), &key, None).unwrap();
                    let again = parent.get_or_create(&parent_rank.ctx(), &key, None).unwrap();
                    assert!(Arc::ptr_eq(&first, &again));
                    assert!(matches!(first.origin(), ChannelOrigin::Fresh { .. }));

                    let child_rank = Rank::new(rank, 2, Arc::new(PrefixStore::new("child", store)), collectives, Duration::from_secs(10));
                    let child = CommunicatorCache::new();
                    let source = SplitSource { parent: &parent, color: 2 };
                    let split = child.get_or_create(&child_rank.ctx(), &key, Some(source)).unwrap();
                    assert_eq!(
                        split.origin(),
                        &ChannelOrigin::SplitFrom { parent_id: first.id(), color: 2 }
                    );
                    assert_eq!(parent.split_count(), 2);
                    assert_eq!(child.split_count(), 0);
                    (first.id(), split.id())
                })
            })
            .collect();

        for handle in handles {
            let (parent_id, child_id) = handle.join().unwrap();
            assert_ne!(parent_id, child_id);
        }
    }

    #[test]
    fn test_concurrent_first_use_shares_one_communicator() {
        let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
        let collectives = LocalCollectiveBackend::new();
        let key = DeviceKey::new(&[0]).unwrap();

        let peer = {
            let store = store.clone();
            let collectives = collectives.clone();
            let key = key.clone();
            thread::spawn(move || {
                let rank = Rank::new(1, 2, store, collectives, Duration::from_secs(10));
                let cache = CommunicatorCache::new();
                cache.get_or_create(&rank.ctx(), &key, None).unwrap().origin().clone()
            })
        };

        let rank = Rank::new(0, 2, store, collectives, Duration::from_secs(10));
        let cache = CommunicatorCache::new();
        let (first, second) = thread::scope(|scope| {
            let a = scope.spawn(|| cache.get_or_create(&rank.ctx(), &key, None));
            let b = scope.spawn(|| cache.get_or_create(&rank.ctx(), &key, None));
            (a.join().unwrap().unwrap(), b.join().unwrap().unwrap())
        });

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(cache.communicators().len(), 1);
        assert_eq!(&peer.join().unwrap(), first.origin());
    }

    #[test]
    fn test_lone_rank_times_out() {
        let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
        let rank = Rank::new(0, 2, store, LocalCollectiveBackend::new(), Duration::from_millis(100));
        let cache = CommunicatorCache::new();
        let key = DeviceKey::new(&[0]).unwrap();

        let err = cache.get_or_create(&rank.ctx(), &key, None).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::CommInitTimeout);
        assert!(cache.get(&key).is_none());
    }

    #[test]
    fn test_invalid_rank() {
        let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
        let rank = Rank::new(2, 2, store, LocalCollectiveBackend::new(), Duration::from_millis(100));
        let cache = CommunicatorCache::new();
        let err = cache
            .get_or_create(&rank.ctx(), &DeviceKey::new(&[0]).unwrap(), None)
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidRank);
    }
}
