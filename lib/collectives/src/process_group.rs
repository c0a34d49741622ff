// SPDX-FileCopyrightText: Copyright (c) 2025-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! The process group facade.
//!
//! One [`ProcessGroup`] instance lives on every rank. Each collective call
//! validates its arguments, resolves the communicator for the devices the
//! tensors live on (creating it on first use), enqueues the operation on the
//! communicator streams ordered after the caller's current streams, and
//! returns a [`Work`] handle without waiting for completion.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use derive_builder::Builder;
use validator::Validate;

use crate::backend::{CollectiveBackend, DeviceComm, ReduceOp};
use crate::comm::{ChannelOrigin, CommContext, Communicator, CommunicatorCache, DeviceKey, SplitSource};
use crate::config::CollectivesConfig;
use crate::device::{ComputeBackend, DeviceStream, SparseTensor, Tensor};
use crate::dispatch::{self, FlatLayout};
use crate::error::{CollectiveError, Result};
use crate::store::{PrefixStore, Store, get_json, set_json};
use crate::watchdog::Watchdog;
use crate::work::{OpType, Work, WorkLaunch, WorkOutput};

pub const DEFAULT_GROUP_NAME: &str = "default_pg";

/// The two external collaborators a group drives.
#[derive(Clone)]
pub struct Backends {
    pub compute: Arc<dyn ComputeBackend>,
    pub collectives: Arc<dyn CollectiveBackend>,
}

impl Backends {
    pub fn new(compute: Arc<dyn ComputeBackend>, collectives: Arc<dyn CollectiveBackend>) -> Self {
        Self {
            compute,
            collectives,
        }
    }
}

/// Construction options for [`ProcessGroup::new`].
#[derive(Clone, Default, Builder)]
#[builder(pattern = "owned", default)]
pub struct ProcessGroupOptions {
    pub config: CollectivesConfig,

    /// Store namespace; defaults to `default_pg`, or `<parent>.<n>` for split groups.
    #[builder(setter(into, strip_option))]
    pub group_name: Option<String>,

    /// Overrides `config.timeout_ms`.
    #[builder(setter(strip_option))]
    pub timeout: Option<Duration>,

    /// Parent group whose communicators new ones are split from.
    #[builder(setter(strip_option))]
    pub split_from: Option<Arc<ProcessGroup>>,

    /// Color passed to the backend split; required with `split_from`.
    #[builder(setter(strip_option))]
    pub split_color: Option<i32>,
}

impl ProcessGroupOptions {
    pub fn builder() -> ProcessGroupOptionsBuilder {
        ProcessGroupOptionsBuilder::default()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BroadcastOptions {
    pub root_rank: usize,
    pub root_tensor: usize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReduceOptions {
    pub root_rank: usize,
    pub root_tensor: usize,
    pub op: ReduceOp,
}

pub struct ProcessGroup {
    // stopped first so no background poll outlives the communicators
    watchdog: Watchdog,
    rank: usize,
    size: usize,
    group_name: String,
    store: Arc<dyn Store>,
    backends: Backends,
    config: CollectivesConfig,
    timeout: Duration,
    split: Option<(Arc<ProcessGroup>, i32)>,
    cache: CommunicatorCache,
    seq: AtomicU64,
    seq_rounds: AtomicU64,
    children: AtomicU64,
}

impl ProcessGroup {
    pub fn new(
        store: Arc<dyn Store>,
        rank: usize,
        size: usize,
        backends: Backends,
        options: ProcessGroupOptions,
    ) -> Result<Arc<Self>> {
        let ProcessGroupOptions {
            config,
            group_name,
            timeout,
            split_from,
            split_color,
        } = options;

        config
            .validate()
            .map_err(|e| CollectiveError::InvalidArgument(format!("invalid configuration: {e}")))?;
        backends.collectives.validate_rank(rank, size)?;

        let split = match (split_from, split_color) {
            (Some(parent), Some(color)) => Some((parent, color)),
            (Some(_), None) => {
                return Err(CollectiveError::InvalidArgument(
                    "split_color is required when split_from is set".to_string(),
                ));
            }
            (None, _) => None,
        };

        let group_name = group_name.unwrap_or_else(|| match &split {
            Some((parent, _)) => format!(
                "{}.{}",
                parent.group_name,
                parent.children.fetch_add(1, Ordering::AcqRel)
            ),
            None => DEFAULT_GROUP_NAME.to_string(),
        });
        let timeout = timeout.unwrap_or_else(|| config.timeout());
        let watchdog = Watchdog::start(
            &group_name,
            rank,
            config.watchdog_poll_interval(),
            config.async_error_handling,
        )?;

        let group = Arc::new(Self {
            watchdog,
            rank,
            size,
            store: Arc::new(PrefixStore::new(group_name.clone(), store)),
            group_name,
            backends,
            config,
            timeout,
            split,
            cache: CommunicatorCache::new(),
            seq: AtomicU64::new(0),
            seq_rounds: AtomicU64::new(0),
            children: AtomicU64::new(0),
        });

        tracing::info!(
            rank,
            size,
            group = %group.group_name,
            backend = group.backend_name(),
            timeout_ms = group.timeout.as_millis() as u64,
            split_color = group.split.as_ref().map(|(_, color)| *color),
            "process group created"
        );

        if group.config.enable_health_check {
            group.health_check()?;
        }
        Ok(group)
    }

    pub fn rank(&self) -> usize {
        self.rank
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn group_name(&self) -> &str {
        &self.group_name
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn config(&self) -> &CollectivesConfig {
        &self.config
    }

    pub fn backend_name(&self) -> &'static str {
        self.backends.collectives.name()
    }

    pub fn device_count(&self) -> usize {
        self.backends.compute.device_count()
    }

    /// Number of per-device splits issued against this group's communicators.
    pub fn comm_split_count(&self) -> u64 {
        self.cache.split_count()
    }

    pub fn sequence_number_for_group(&self) -> u64 {
        self.seq.load(Ordering::Acquire)
    }

    /// Agree on a starting sequence number across all ranks.
    ///
    /// Rank 0 draws a random value and publishes it through the store; every
    /// rank then acknowledges the value it adopted and checks that all peers
    /// adopted the same one.
    pub fn set_sequence_number_for_group(&self) -> Result<()> {
        let round = self.seq_rounds.fetch_add(1, Ordering::AcqRel);
        let value_key = format!("seq_num/{round}/value");
        let store = self.store.as_ref();

        let value: u64 = if self.rank == 0 {
            let value = u64::from(rand::random::<u32>());
            set_json(store, &value_key, &value)?;
            value
        } else {
            get_json(store, &value_key, self.timeout)?
        };

        set_json(store, &format!("seq_num/{round}/ack/{}", self.rank), &value)?;
        let ack_keys: Vec<String> = (0..self.size)
            .map(|peer| format!("seq_num/{round}/ack/{peer}"))
            .collect();
        store.wait(&ack_keys, self.timeout)?;
        for (peer, key) in ack_keys.iter().enumerate() {
            let observed: u64 = get_json(store, key, self.timeout)?;
            if observed != value {
                return Err(CollectiveError::SequenceMismatch {
                    rank: self.rank,
                    peer,
                    expected: value,
                    observed,
                });
            }
        }

        self.seq.store(value, Ordering::Release);
        tracing::debug!(rank = self.rank, group = %self.group_name, seq = value, "sequence number agreed");
        Ok(())
    }

    /// Abort every communicator of this group. In-flight and later work on
    /// them fails with an asynchronous backend error carrying `reason`.
    pub fn abort(&self, reason: &str) {
        for communicator in self.cache.communicators() {
            communicator.abort(CollectiveError::AsyncBackendError {
                rank: self.rank,
                reason: reason.to_string(),
            });
        }
    }

    /// Evict an aborted communicator so the next collective on `devices`
    /// bootstraps a new one. Returns whether an entry was evicted.
    pub fn reset_communicator(&self, devices: &[usize]) -> Result<bool> {
        let key = DeviceKey::new(devices)?;
        let Some(communicator) = self.cache.get(&key) else {
            return Ok(false);
        };
        communicator.poll_async_error();
        if !communicator.is_aborted() {
            return Ok(false);
        }
        self.cache.remove(&key);
        tracing::info!(rank = self.rank, devices = %key, communicator = %communicator.id(), "communicator reset");
        Ok(true)
    }

    pub fn communicator_origin(&self, devices: &[usize]) -> Option<ChannelOrigin> {
        let key = DeviceKey::new(devices).ok()?;
        self.cache.get(&key).map(|c| c.origin().clone())
    }

    pub fn all_reduce(&self, tensors: &[Tensor], op: ReduceOp) -> Result<Work> {
        let key = dispatch::device_key(tensors, self.device_count())?;
        let outputs = dense_outputs(tensors);
        self.collective(OpType::AllReduce, &key, outputs, |i, comm, stream| {
            comm.all_reduce(&tensors[i], op, stream)
        })
    }

    /// Sparse all-reduce. The reduced result is written back into `tensors`
    /// in row format and is also available from [`Work::result`].
    pub fn all_reduce_sparse(&self, tensors: &[SparseTensor], op: ReduceOp) -> Result<Work> {
        let key = dispatch::sparse_device_key(tensors, self.device_count())?;
        let compute = &self.backends.compute;

        let staging: Vec<SparseTensor> = tensors.iter().map(SparseTensor::empty_rows_like).collect();
        let results: Vec<SparseTensor> = tensors.iter().map(SparseTensor::empty_rows_like).collect();
        let dense = tensors
            .iter()
            .map(|t| compute.allocate(t.device(), t.sizes(), t.dtype()))
            .collect::<Result<Vec<_>>>()?;
        let outputs = results.iter().cloned().map(WorkOutput::Sparse).collect();

        self.collective(OpType::SparseAllReduce, &key, outputs, |i, comm, stream| {
            stream.launch(dispatch::sparse_rows_kernel(tensors[i].clone(), staging[i].clone()))?;
            comm.all_reduce_sparse(&staging[i], &dense[i], op, stream)?;
            stream.launch(dispatch::sparse_result_kernel(
                dense[i].clone(),
                tensors[i].clone(),
                results[i].clone(),
            ))
        })
    }

    /// Broadcast tensor `root_tensor` of rank `root_rank` to every tensor of every rank.
    pub fn broadcast(&self, tensors: &[Tensor], options: BroadcastOptions) -> Result<Work> {
        let key = dispatch::device_key(tensors, self.device_count())?;
        dispatch::check_root(options.root_rank, self.size, options.root_tensor, tensors.len())?;
        let root = options.root_rank * tensors.len() + options.root_tensor;
        let outputs = dense_outputs(tensors);
        self.collective(OpType::Broadcast, &key, outputs, |i, comm, stream| {
            comm.broadcast(&tensors[i], root, stream)
        })
    }

    /// Reduce into the root tensor. Every other tensor is left untouched.
    pub fn reduce(&self, tensors: &[Tensor], options: ReduceOptions) -> Result<Work> {
        let key = dispatch::device_key(tensors, self.device_count())?;
        dispatch::check_root(options.root_rank, self.size, options.root_tensor, tensors.len())?;
        let root = options.root_rank * tensors.len() + options.root_tensor;
        let outputs = dense_outputs(tensors);
        self.collective(OpType::Reduce, &key, outputs, |i, comm, stream| {
            comm.reduce(&tensors[i], options.op, root, stream)
        })
    }

    /// `outputs[i][j]` receives input `i % D` of rank `j / D` (participant `j`).
    pub fn all_gather(&self, outputs: &[Vec<Tensor>], inputs: &[Tensor]) -> Result<Work> {
        let key = dispatch::device_key(inputs, self.device_count())?;
        let participants = self.size * inputs.len();
        dispatch::check_tensor_lists(outputs, inputs, participants)?;
        let staging = self.staging(inputs, participants)?;
        let work_outputs = outputs.iter().flatten().cloned().map(WorkOutput::Dense).collect();

        self.collective(OpType::AllGather, &key, work_outputs, |i, comm, stream| {
            comm.all_gather(&inputs[i], &staging[i], stream)?;
            stream.launch(dispatch::unpack_kernel(staging[i].clone(), outputs[i].clone()))
        })
    }

    /// Flat all-gather: `outputs[i]` holds every participant's input, in participant order.
    pub fn all_gather_base(&self, outputs: &[Tensor], inputs: &[Tensor]) -> Result<Work> {
        let key = dispatch::device_key(inputs, self.device_count())?;
        let participants = self.size * inputs.len();
        dispatch::check_flat_pairs(outputs, inputs, participants, FlatLayout::Gather)?;
        self.collective(OpType::AllGatherBase, &key, dense_outputs(outputs), |i, comm, stream| {
            comm.all_gather(&inputs[i], &outputs[i], stream)
        })
    }

    /// `outputs[i]` receives the reduction over all participants of their
    /// list entry for participant `rank * D + i`.
    pub fn reduce_scatter(&self, outputs: &[Tensor], inputs: &[Vec<Tensor>], op: ReduceOp) -> Result<Work> {
        let key = dispatch::device_key(outputs, self.device_count())?;
        let participants = self.size * outputs.len();
        dispatch::check_tensor_lists(inputs, outputs, participants)?;
        let staging = self.staging(outputs, participants)?;

        self.collective(OpType::ReduceScatter, &key, dense_outputs(outputs), |i, comm, stream| {
            stream.launch(dispatch::pack_kernel(inputs[i].clone(), staging[i].clone()))?;
            comm.reduce_scatter(&staging[i], &outputs[i], op, stream)
        })
    }

    pub fn reduce_scatter_base(&self, outputs: &[Tensor], inputs: &[Tensor], op: ReduceOp) -> Result<Work> {
        let key = dispatch::device_key(inputs, self.device_count())?;
        let participants = self.size * inputs.len();
        dispatch::check_flat_pairs(outputs, inputs, participants, FlatLayout::Scatter)?;
        self.collective(OpType::ReduceScatterBase, &key, dense_outputs(outputs), |i, comm, stream| {
            comm.reduce_scatter(&inputs[i], &outputs[i], op, stream)
        })
    }

    /// Synchronize all ranks through a one-element all-reduce on every local device.
    pub fn barrier(&self) -> Result<Work> {
        let devices: Vec<usize> = (0..self.device_count()).collect();
        let key = DeviceKey::new(&devices)?;
        let scratch = devices
            .iter()
            .map(|&device| self.backends.compute.allocate(device, &[1], dispatch::BARRIER_DTYPE))
            .collect::<Result<Vec<_>>>()?;
        self.collective(OpType::Barrier, &key, Vec::new(), |i, comm, stream| {
            comm.all_reduce(&scratch[i], ReduceOp::Sum, stream)
        })
    }

    fn health_check(&self) -> Result<()> {
        let devices: Vec<usize> = (0..self.device_count()).collect();
        let key = DeviceKey::new(&devices)?;
        self.communicator(&key)?;
        tracing::debug!(rank = self.rank, devices = %key, "health check passed");
        Ok(())
    }

    fn staging(&self, anchors: &[Tensor], participants: usize) -> Result<Vec<Tensor>> {
        anchors
            .iter()
            .map(|t| {
                self.backends
                    .compute
                    .allocate(t.device(), &[participants * t.numel()], t.dtype())
            })
            .collect()
    }

    fn communicator(&self, key: &DeviceKey) -> Result<Arc<Communicator>> {
        let ctx = CommContext {
            rank: self.rank,
            size: self.size,
            store: self.store.as_ref(),
            compute: self.backends.compute.as_ref(),
            collectives: self.backends.collectives.as_ref(),
            timeout: self.timeout,
            high_priority: self.config.high_priority_streams,
            watchdog: &self.watchdog,
        };
        let split = self.split.as_ref().map(|(parent, color)| SplitSource {
            parent: &parent.cache,
            color: *color,
        });
        self.cache.get_or_create(&ctx, key, split)
    }

    /// Enqueue one collective on every device of `key`.
    ///
    /// Per device: the communicator stream waits for the caller's current
    /// stream, `launch` enqueues the kernels, and an end event is recorded.
    fn collective<F>(&self, op: OpType, key: &DeviceKey, outputs: Vec<WorkOutput>, mut launch: F) -> Result<Work>
    where
        F: FnMut(usize, &dyn DeviceComm, &dyn DeviceStream) -> Result<()>,
    {
        let communicator = self.communicator(key)?;
        communicator.ensure_healthy()?;

        let compute = &self.backends.compute;
        let mut end_events = Vec::with_capacity(key.len());
        for (i, &device) in key.devices().iter().enumerate() {
            let stream = communicator.stream(i);
            stream.wait_event(compute.current_stream(device)?.record_event()?)?;
            if let Err(err) = launch(i, communicator.comms()[i].as_ref(), stream.as_ref()) {
                if err.is_communicator_fatal() {
                    return Err(communicator.abort(err));
                }
                return Err(err);
            }
            end_events.push(stream.record_event()?);
        }

        // only launched collectives consume a sequence number
        let seq = self.seq.fetch_add(1, Ordering::AcqRel).wrapping_add(1);
        let work = Work::new(WorkLaunch {
            rank: self.rank,
            seq,
            op,
            devices: key.devices().to_vec(),
            communicator: Arc::downgrade(&communicator),
            compute: compute.clone(),
            end_events,
            outputs,
            timeout: self.timeout,
            blocking_wait: self.config.blocking_wait,
        });
        self.watchdog.watch_work(work.inner());
        tracing::debug!(rank = self.rank, seq, op = %op, devices = %key, "collective launched");
        Ok(work)
    }
}

impl std::fmt::Debug for ProcessGroup {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessGroup")
            .field("rank", &self.rank)
            .field("size", &self.size)
            .field("group_name", &self.group_name)
            .field("backend", &self.backend_name())
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

fn dense_outputs(tensors: &[Tensor]) -> Vec<WorkOutput> {
    tensors.iter().cloned().map(WorkOutput::Dense).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::LocalCollectiveBackend;
    use crate::device::{DType, HostComputeBackend};
    use crate::error::ErrorKind;
    use crate::store::MemoryStore;

    fn backends(devices: usize) -> Backends {
        Backends::new(
            Arc::new(HostComputeBackend::new(devices).unwrap()),
            Arc::new(LocalCollectiveBackend::new()),
        )
    }

    #[test]
    fn test_single_rank_all_reduce() {
        let pg = ProcessGroup::new(
            Arc::new(MemoryStore::new()),
            0,
            1,
            backends(2),
            ProcessGroupOptions::default(),
        )
        .unwrap();
        assert_eq!(pg.group_name(), DEFAULT_GROUP_NAME);
        assert_eq!(pg.backend_name(), "local");

        let tensors = vec![
            Tensor::full(0, &[2], DType::Float32, 1.0),
            Tensor::full(1, &[2], DType::Float32, 2.0),
        ];
        let work = pg.all_reduce(&tensors, ReduceOp::Sum).unwrap();
        assert!(work.wait(None).unwrap());
        assert_eq!(work.sequence_number(), 1);
        assert_eq!(tensors[0].to_vec(), vec![3.0, 3.0]);
        assert_eq!(tensors[1].to_vec(), vec![3.0, 3.0]);
        assert!(matches!(
            pg.communicator_origin(&[0, 1]),
            Some(ChannelOrigin::Fresh { .. })
        ));
    }

    #[test]
    fn test_invalid_rank() {
        let err = ProcessGroup::new(
            Arc::new(MemoryStore::new()),
            4,
            4,
            backends(1),
            ProcessGroupOptions::default(),
        )
        .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidRank);
        assert!(err.to_string().contains("Invalid rank"));
    }

    #[test]
    fn test_split_requires_color() {
        let parent = ProcessGroup::new(
            Arc::new(MemoryStore::new()),
            0,
            1,
            backends(1),
            ProcessGroupOptions::default(),
        )
        .unwrap();
        let options = ProcessGroupOptions::builder().split_from(parent).build().unwrap();
        let err = ProcessGroup::new(Arc::new(MemoryStore::new()), 0, 1, backends(1), options).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);
    }

    #[test]
    fn test_options_builder() {
        let options = ProcessGroupOptions::builder()
            .group_name("trainer")
            .timeout(Duration::from_secs(3))
            .build()
            .unwrap();
        assert_eq!(options.group_name.as_deref(), Some("trainer"));
        assert_eq!(options.timeout, Some(Duration::from_secs(3)));
        assert!(options.split_from.is_none());
    }

    #[test]
    fn test_validation_leaves_no_communicator() {
        let pg = ProcessGroup::new(
            Arc::new(MemoryStore::new()),
            0,
            1,
            backends(2),
            ProcessGroupOptions::default(),
        )
        .unwrap();
        let err = pg
            .broadcast(
                &[Tensor::zeros(0, &[2], DType::Float32)],
                BroadcastOptions {
                    root_rank: 1,
                    root_tensor: 0,
                },
            )
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);
        assert!(pg.communicator_origin(&[0]).is_none());
        assert_eq!(pg.sequence_number_for_group(), 0);
    }

    #[test]
    fn test_failed_launch_keeps_sequence_number() {
        let pg = ProcessGroup::new(
            Arc::new(MemoryStore::new()),
            0,
            1,
            backends(1),
            ProcessGroupOptions::default(),
        )
        .unwrap();
        let key = DeviceKey::new(&[0]).unwrap();
        let err = pg
            .collective(OpType::AllReduce, &key, Vec::new(), |_, _, _| {
                Err(CollectiveError::InvalidArgument("rejected by backend".into()))
            })
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);
        assert_eq!(pg.sequence_number_for_group(), 0);

        let tensors = vec![Tensor::full(0, &[2], DType::Float32, 1.0)];
        let work = pg.all_reduce(&tensors, ReduceOp::Sum).unwrap();
        assert!(work.wait(None).unwrap());
        assert_eq!(work.sequence_number(), 1);
    }

    #[test]
    fn test_sequence_number_mismatch() {
        let store = Arc::new(MemoryStore::new());
        let pg = ProcessGroup::new(store.clone(), 0, 2, backends(1), ProcessGroupOptions::default()).unwrap();

        // rank 0 draws a 32-bit value, so a peer acknowledging u64::MAX always disagrees
        let ack = serde_json::to_vec(&u64::MAX).unwrap();
        store.set(&format!("{DEFAULT_GROUP_NAME}/seq_num/0/ack/1"), &ack).unwrap();

        let err = pg.set_sequence_number_for_group().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::SequenceMismatch);
        match err {
            CollectiveError::SequenceMismatch { rank, peer, observed, .. } => {
                assert_eq!((rank, peer, observed), (0, 1, u64::MAX));
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(pg.sequence_number_for_group(), 0);
    }
}
