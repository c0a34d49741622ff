// SPDX-FileCopyrightText: Copyright (c) 2025-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! In-process collective backend.
//!
//! All ranks of a simulated world share one [`LocalCollectiveBackend`]. A
//! channel is a *clique*: a rendezvous point keyed by its [`UniqueId`] where
//! each collective is a numbered round. Every member deposits its
//! contribution for round `seq`, blocks until all members have done so, and
//! then computes its own result from the full set of contributions.
//!
//! Members must issue collectives in the same order; a round whose members
//! disagree on the operation aborts the whole clique. Aborting wakes every
//! member blocked in a round, and a member that leaves (destroy) fails any
//! round still waiting on it.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use parking_lot::{Condvar, Mutex};
use uuid::Uuid;

use super::{CollectiveBackend, CommInitState, DeviceComm, ReduceOp, UniqueId};
use crate::device::{DeviceStream, SparseTensor, Tensor};
use crate::error::{CollectiveError, Result};

type KernelResult = std::result::Result<(), String>;

struct Round {
    tag: String,
    contributions: Vec<Option<Vec<f64>>>,
    readers: usize,
}

#[derive(Default)]
struct SplitRound {
    /// parent rank -> (color, key)
    requests: BTreeMap<usize, (Option<i32>, usize)>,
    readers: usize,
}

enum SplitOutcome {
    Pending,
    Resolved {
        color: i32,
        child_rank: usize,
        child_world: usize,
    },
    Failed(String),
}

#[derive(Default)]
struct CliqueState {
    joined: HashSet<usize>,
    departed: HashSet<usize>,
    aborted: Option<String>,
    rounds: HashMap<u64, Round>,
    splits: HashMap<u64, SplitRound>,
}

struct Clique {
    id: UniqueId,
    world_size: usize,
    state: Mutex<CliqueState>,
    cv: Condvar,
}

impl Clique {
    fn new(id: UniqueId, world_size: usize) -> Self {
        Self {
            id,
            world_size,
            state: Mutex::new(CliqueState::default()),
            cv: Condvar::new(),
        }
    }

    fn join(&self, rank: usize, world_size: usize) -> KernelResult {
        if world_size != self.world_size {
            return Err(format!(
                "world size mismatch for channel {}: joined with {world_size}, channel has {}",
                self.id, self.world_size
            ));
        }
        self.state.lock().joined.insert(rank);
        self.cv.notify_all();
        Ok(())
    }

    fn is_ready(&self) -> bool {
        let state = self.state.lock();
        state.aborted.is_none() && state.joined.len() == self.world_size
    }

    fn aborted(&self) -> Option<String> {
        self.state.lock().aborted.clone()
    }

    fn abort(&self, reason: &str) {
        let mut state = self.state.lock();
        if state.aborted.is_none() {
            state.aborted = Some(reason.to_string());
        }
        drop(state);
        self.cv.notify_all();
    }

    /// Returns true once every member that joined has left.
    fn depart(&self, rank: usize) -> bool {
        let mut state = self.state.lock();
        state.departed.insert(rank);
        let empty = state.departed.is_superset(&state.joined);
        drop(state);
        self.cv.notify_all();
        empty
    }

    fn exchange(
        &self,
        seq: u64,
        rank: usize,
        tag: &str,
        data: Vec<f64>,
    ) -> std::result::Result<Vec<Vec<f64>>, String> {
        let world = self.world_size;
        let mut state = self.state.lock();
        if let Some(reason) = &state.aborted {
            return Err(reason.clone());
        }

        let round = state.rounds.entry(seq).or_insert_with(|| Round {
            tag: tag.to_string(),
            contributions: vec![None; world],
            readers: 0,
        });
        if round.tag != tag {
            let reason = format!(
                "mismatched collectives at sequence {seq}: {} vs {tag}",
                round.tag
            );
            state.aborted = Some(reason.clone());
            drop(state);
            self.cv.notify_all();
            return Err(reason);
        }
        round.contributions[rank] = Some(data);
        self.cv.notify_all();

        loop {
            if let Some(reason) = &state.aborted {
                return Err(reason.clone());
            }
            let round = state
                .rounds
                .get(&seq)
                .ok_or_else(|| format!("round {seq} vanished"))?;
            if round.contributions.iter().all(Option::is_some) {
                break;
            }
            if let Some(peer) = (0..world)
                .find(|r| round.contributions[*r].is_none() && state.departed.contains(r))
            {
                return Err(format!(
                    "rank {peer} left before contributing to sequence {seq}"
                ));
            }
            if state.departed.contains(&rank) {
                return Err("communicator destroyed".to_string());
            }
            self.cv.wait(&mut state);
        }

        let round = state
            .rounds
            .get_mut(&seq)
            .ok_or_else(|| format!("round {seq} vanished"))?;
        let out = round
            .contributions
            .iter()
            .map(|c| c.clone().unwrap_or_default())
            .collect();
        round.readers += 1;
        if round.readers == world {
            state.rounds.remove(&seq);
        }
        Ok(out)
    }

    fn request_split(&self, round: u64, rank: usize, color: Option<i32>, key: usize) {
        self.state
            .lock()
            .splits
            .entry(round)
            .or_default()
            .requests
            .insert(rank, (color, key));
        self.cv.notify_all();
    }

    fn split_outcome(&self, round: u64, rank: usize) -> SplitOutcome {
        let mut state = self.state.lock();
        if let Some(reason) = &state.aborted {
            return SplitOutcome::Failed(reason.clone());
        }
        let Some(split) = state.splits.get(&round) else {
            return SplitOutcome::Failed(format!("unknown split round {round}"));
        };
        if split.requests.len() < self.world_size {
            if let Some(peer) = state
                .departed
                .iter()
                .find(|r| !split.requests.contains_key(*r))
            {
                return SplitOutcome::Failed(format!(
                    "rank {peer} left before joining split round {round}"
                ));
            }
            return SplitOutcome::Pending;
        }

        let Some(&(Some(color), _)) = split.requests.get(&rank) else {
            return SplitOutcome::Failed(format!(
                "rank {rank} did not request a colored split in round {round}"
            ));
        };
        let mut members: Vec<(usize, usize)> = split
            .requests
            .iter()
            .filter(|(_, (c, _))| *c == Some(color))
            .map(|(r, (_, key))| (*key, *r))
            .collect();
        members.sort_unstable();
        let colored = split.requests.values().filter(|(c, _)| c.is_some()).count();
        let Some(child_rank) = members.iter().position(|(_, r)| *r == rank) else {
            return SplitOutcome::Failed(format!("rank {rank} missing from split round {round}"));
        };
        let child_world = members.len();

        if let Some(split) = state.splits.get_mut(&round) {
            split.readers += 1;
            if split.readers == colored {
                state.splits.remove(&round);
            }
        }
        SplitOutcome::Resolved {
            color,
            child_rank,
            child_world,
        }
    }

    fn child_id(&self, round: u64, color: i32) -> UniqueId {
        let mut name = self.id.as_bytes().to_vec();
        name.extend_from_slice(&round.to_le_bytes());
        name.extend_from_slice(&color.to_le_bytes());
        UniqueId::new(Uuid::new_v5(&Uuid::NAMESPACE_OID, &name).as_bytes().to_vec())
    }
}

#[derive(Default)]
struct Fabric {
    cliques: DashMap<UniqueId, Arc<Clique>>,
}

impl Fabric {
    fn clique(&self, id: &UniqueId, world_size: usize) -> Arc<Clique> {
        self.cliques
            .entry(id.clone())
            .or_insert_with(|| Arc::new(Clique::new(id.clone(), world_size)))
            .value()
            .clone()
    }

    fn release(&self, clique: &Arc<Clique>) {
        self.cliques
            .remove_if(&clique.id, |_, existing| Arc::ptr_eq(existing, clique));
    }
}

/// In-process collective backend shared by every simulated rank.
#[derive(Clone, Default)]
pub struct LocalCollectiveBackend {
    fabric: Arc<Fabric>,
}

impl LocalCollectiveBackend {
    pub const NAME: &'static str = "local";

    pub fn new() -> Self {
        Self::default()
    }

    /// Raise an asynchronous error on every live channel, as a device or
    /// network fault would. Returns the number of channels affected.
    pub fn inject_fault(&self, reason: &str) -> usize {
        let mut count = 0;
        for entry in self.fabric.cliques.iter() {
            entry.value().abort(reason);
            count += 1;
        }
        tracing::warn!(channels = count, reason, "injected fault");
        count
    }

    /// Number of channels with at least one member still attached.
    pub fn live_channels(&self) -> usize {
        self.fabric.cliques.len()
    }
}

impl CollectiveBackend for LocalCollectiveBackend {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn unique_id(&self) -> Result<UniqueId> {
        Ok(UniqueId::new(Uuid::new_v4().as_bytes().to_vec()))
    }

    fn init_rank(
        &self,
        id: &UniqueId,
        world_size: usize,
        rank: usize,
        device: usize,
    ) -> Result<Arc<dyn DeviceComm>> {
        self.validate_rank(rank, world_size)?;
        let clique = self.fabric.clique(id, world_size);
        let comm = LocalComm::new(
            self.fabric.clone(),
            device,
            Binding::Member {
                clique: clique.clone(),
                rank,
            },
        );
        if let Err(reason) = clique.join(rank, world_size) {
            comm.set_error(reason);
        }
        tracing::debug!(rank, world_size, device, channel = %id, "joining channel");
        let comm: Arc<dyn DeviceComm> = Arc::new(comm);
        Ok(comm)
    }
}

enum InitStep {
    Joined(Arc<Clique>, usize),
    Splitting(Arc<Clique>, u64, usize),
}

enum Binding {
    Member {
        clique: Arc<Clique>,
        rank: usize,
    },
    PendingSplit {
        parent: Arc<Clique>,
        round: u64,
        parent_rank: usize,
    },
    Detached {
        rank: usize,
        world_size: usize,
    },
}

/// One rank's endpoint of a local channel.
pub struct LocalComm {
    fabric: Arc<Fabric>,
    device: usize,
    binding: Mutex<Binding>,
    op_seq: AtomicU64,
    split_seq: AtomicU64,
    error: Arc<Mutex<Option<String>>>,
}

impl LocalComm {
    fn new(fabric: Arc<Fabric>, device: usize, binding: Binding) -> Self {
        Self {
            fabric,
            device,
            binding: Mutex::new(binding),
            op_seq: AtomicU64::new(0),
            split_seq: AtomicU64::new(0),
            error: Arc::new(Mutex::new(None)),
        }
    }

    fn set_error(&self, reason: String) {
        self.error.lock().get_or_insert(reason);
    }

    fn position(&self) -> (usize, usize) {
        match &*self.binding.lock() {
            Binding::Member { clique, rank } => (*rank, clique.world_size),
            Binding::PendingSplit {
                parent,
                parent_rank,
                ..
            } => (*parent_rank, parent.world_size),
            Binding::Detached { rank, world_size } => (*rank, *world_size),
        }
    }

    /// The joined clique, once initialization has completed.
    fn member(&self) -> Result<(Arc<Clique>, usize)> {
        let (clique, rank) = match &*self.binding.lock() {
            Binding::Member { clique, rank } => (clique.clone(), *rank),
            _ => {
                return Err(CollectiveError::InvalidArgument(format!(
                    "communicator on device {} is not initialized",
                    self.device
                )));
            }
        };
        if let Some(reason) = self.async_error() {
            return Err(CollectiveError::AsyncBackendError { rank, reason });
        }
        if !clique.is_ready() {
            return Err(CollectiveError::InvalidArgument(format!(
                "communicator on device {} is not initialized",
                self.device
            )));
        }
        Ok((clique, rank))
    }

    fn enqueue<F>(&self, stream: &dyn DeviceStream, op: &'static str, body: F) -> Result<()>
    where
        F: FnOnce(&Clique, usize, u64) -> KernelResult + Send + 'static,
    {
        let (clique, rank) = self.member()?;
        let seq = self.op_seq.fetch_add(1, Ordering::Relaxed);
        let error = self.error.clone();
        let device = self.device;
        stream.launch(Box::new(move || {
            if let Err(reason) = body(&clique, rank, seq) {
                tracing::warn!(device, rank, seq, op, %reason, "collective kernel failed");
                error.lock().get_or_insert(reason);
            }
        }))
    }
}

fn reduce_uniform(op: ReduceOp, contributions: &[Vec<f64>]) -> std::result::Result<Vec<f64>, String> {
    let len = contributions.first().map(Vec::len).unwrap_or(0);
    if let Some((rank, c)) = contributions.iter().enumerate().find(|(_, c)| c.len() != len) {
        return Err(format!(
            "contribution size mismatch: rank {rank} sent {} elements, expected {len}",
            c.len()
        ));
    }
    Ok(op.apply(contributions))
}

impl DeviceComm for LocalComm {
    fn rank(&self) -> usize {
        self.position().0
    }

    fn world_size(&self) -> usize {
        self.position().1
    }

    fn device(&self) -> usize {
        self.device
    }

    fn init_state(&self) -> CommInitState {
        if let Some(reason) = self.error.lock().clone() {
            return CommInitState::Failed(reason);
        }

        let mut binding = self.binding.lock();
        let step = match &*binding {
            Binding::Member { clique, rank } => InitStep::Joined(clique.clone(), *rank),
            Binding::PendingSplit {
                parent,
                round,
                parent_rank,
            } => InitStep::Splitting(parent.clone(), *round, *parent_rank),
            Binding::Detached { .. } => {
                return CommInitState::Failed("communicator destroyed".to_string());
            }
        };

        let (clique, rank) = match step {
            InitStep::Joined(clique, rank) => (clique, rank),
            InitStep::Splitting(parent, round, parent_rank) => {
                match parent.split_outcome(round, parent_rank) {
                    SplitOutcome::Pending => return CommInitState::InProgress,
                    SplitOutcome::Failed(reason) => {
                        self.set_error(reason.clone());
                        return CommInitState::Failed(reason);
                    }
                    SplitOutcome::Resolved {
                        color,
                        child_rank,
                        child_world,
                    } => {
                        let id = parent.child_id(round, color);
                        let clique = self.fabric.clique(&id, child_world);
                        if let Err(reason) = clique.join(child_rank, child_world) {
                            self.set_error(reason.clone());
                            return CommInitState::Failed(reason);
                        }
                        tracing::debug!(
                            parent_rank,
                            child_rank,
                            child_world,
                            color,
                            channel = %id,
                            "split resolved"
                        );
                        *binding = Binding::Member {
                            clique: clique.clone(),
                            rank: child_rank,
                        };
                        (clique, child_rank)
                    }
                }
            }
        };
        drop(binding);

        if let Some(reason) = clique.aborted() {
            return CommInitState::Failed(reason);
        }
        if clique.is_ready() {
            CommInitState::Ready
        } else {
            tracing::trace!(rank, device = self.device, "waiting for peers");
            CommInitState::InProgress
        }
    }

    fn split(&self, color: Option<i32>, key: usize) -> Result<Option<Arc<dyn DeviceComm>>> {
        let (parent, parent_rank) = self.member()?;
        let round = self.split_seq.fetch_add(1, Ordering::Relaxed);
        parent.request_split(round, parent_rank, color, key);
        if color.is_none() {
            return Ok(None);
        }
        let child = LocalComm::new(
            self.fabric.clone(),
            self.device,
            Binding::PendingSplit {
                parent,
                round,
                parent_rank,
            },
        );
        let child: Arc<dyn DeviceComm> = Arc::new(child);
        Ok(Some(child))
    }

    fn abort(&self, reason: &str) {
        self.set_error(reason.to_string());
        if let Binding::Member { clique, .. } = &*self.binding.lock() {
            clique.abort(reason);
        }
    }

    fn destroy(&self) {
        let (rank, world_size) = self.position();
        let previous = std::mem::replace(
            &mut *self.binding.lock(),
            Binding::Detached { rank, world_size },
        );
        if let Binding::Member { clique, rank } = previous {
            if clique.depart(rank) {
                self.fabric.release(&clique);
            }
        }
    }

    fn async_error(&self) -> Option<String> {
        if let Some(reason) = self.error.lock().clone() {
            return Some(reason);
        }
        match &*self.binding.lock() {
            Binding::Member { clique, .. } => clique.aborted(),
            _ => None,
        }
    }

    fn all_reduce(&self, buffer: &Tensor, op: ReduceOp, stream: &dyn DeviceStream) -> Result<()> {
        let buffer = buffer.clone();
        self.enqueue(stream, "all_reduce", move |clique, rank, seq| {
            let all = clique.exchange(seq, rank, &format!("all_reduce:{op:?}"), buffer.to_vec())?;
            let reduced = reduce_uniform(op, &all)?;
            buffer.copy_from_slice(&reduced).map_err(|e| e.to_string())
        })
    }

    fn broadcast(&self, buffer: &Tensor, root: usize, stream: &dyn DeviceStream) -> Result<()> {
        let world_size = self.world_size();
        if root >= world_size {
            return Err(CollectiveError::InvalidArgument(format!(
                "broadcast root {root} out of range for {world_size} ranks"
            )));
        }
        let buffer = buffer.clone();
        self.enqueue(stream, "broadcast", move |clique, rank, seq| {
            let data = if rank == root {
                buffer.to_vec()
            } else {
                Vec::new()
            };
            let all = clique.exchange(seq, rank, &format!("broadcast:{root}"), data)?;
            let source = &all[root];
            if source.len() != buffer.numel() {
                return Err(format!(
                    "broadcast size mismatch: root sent {} elements, buffer holds {}",
                    source.len(),
                    buffer.numel()
                ));
            }
            if rank != root {
                buffer.copy_from_slice(source).map_err(|e| e.to_string())?;
            }
            Ok(())
        })
    }

    fn reduce(
        &self,
        buffer: &Tensor,
        op: ReduceOp,
        root: usize,
        stream: &dyn DeviceStream,
    ) -> Result<()> {
        let world_size = self.world_size();
        if root >= world_size {
            return Err(CollectiveError::InvalidArgument(format!(
                "reduce root {root} out of range for {world_size} ranks"
            )));
        }
        let buffer = buffer.clone();
        self.enqueue(stream, "reduce", move |clique, rank, seq| {
            let tag = format!("reduce:{op:?}:{root}");
            let all = clique.exchange(seq, rank, &tag, buffer.to_vec())?;
            let reduced = reduce_uniform(op, &all)?;
            if rank == root {
                buffer.copy_from_slice(&reduced).map_err(|e| e.to_string())?;
            }
            Ok(())
        })
    }

    fn all_gather(&self, input: &Tensor, output: &Tensor, stream: &dyn DeviceStream) -> Result<()> {
        let (input, output) = (input.clone(), output.clone());
        self.enqueue(stream, "all_gather", move |clique, rank, seq| {
            let all = clique.exchange(seq, rank, "all_gather", input.to_vec())?;
            let chunk = input.numel();
            if all.iter().any(|c| c.len() != chunk) || output.numel() != chunk * all.len() {
                return Err(format!(
                    "all_gather size mismatch: {} chunks of {chunk} into {} elements",
                    all.len(),
                    output.numel()
                ));
            }
            output.copy_from_slice(&all.concat()).map_err(|e| e.to_string())
        })
    }

    fn reduce_scatter(
        &self,
        input: &Tensor,
        output: &Tensor,
        op: ReduceOp,
        stream: &dyn DeviceStream,
    ) -> Result<()> {
        let (input, output) = (input.clone(), output.clone());
        self.enqueue(stream, "reduce_scatter", move |clique, rank, seq| {
            let tag = format!("reduce_scatter:{op:?}");
            let all = clique.exchange(seq, rank, &tag, input.to_vec())?;
            let reduced = reduce_uniform(op, &all)?;
            let chunk = output.numel();
            if reduced.len() != chunk * all.len() {
                return Err(format!(
                    "reduce_scatter size mismatch: {} elements for {} chunks of {chunk}",
                    reduced.len(),
                    all.len()
                ));
            }
            output
                .copy_from_slice(&reduced[rank * chunk..(rank + 1) * chunk])
                .map_err(|e| e.to_string())
        })
    }

    fn all_reduce_sparse(
        &self,
        input: &SparseTensor,
        output: &Tensor,
        op: ReduceOp,
        stream: &dyn DeviceStream,
    ) -> Result<()> {
        let (input, output) = (input.clone(), output.clone());
        self.enqueue(stream, "all_reduce_sparse", move |clique, rank, seq| {
            // contribute even when encoding fails so peers are not left waiting
            let encoded = input.encode_rows();
            let data = encoded.clone().unwrap_or_default();
            let tag = format!("all_reduce_sparse:{op:?}");
            let all = clique.exchange(seq, rank, &tag, data)?;
            encoded?;
            let dense = all
                .iter()
                .map(|rows| SparseTensor::decode_rows(rows, output.shape()))
                .collect::<std::result::Result<Vec<_>, _>>()?;
            let reduced = reduce_uniform(op, &dense)?;
            output.copy_from_slice(&reduced).map_err(|e| e.to_string())
        })
    }
}

impl Drop for LocalComm {
    fn drop(&mut self) {
        self.destroy();
    }
}
