// SPDX-FileCopyrightText: Copyright (c) 2025-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Dynamo Collectives
//!
//! Orchestration layer for device-group collective communication. A
//! [`ProcessGroup`] turns a set of cooperating ranks, each owning one or more
//! accelerator devices, into a single logical group that can run collective
//! operations asynchronously against device memory.
//!
//! # Architecture
//!
//! ```text
//! ProcessGroup ──► dispatch (validate) ──► CommunicatorCache ──► CollectiveBackend
//!      │                                        │                      │
//!      │                                        ▼                      ▼
//!      │                                   Store (bootstrap)     DeviceComm kernels
//!      ▼                                                               │
//!    Work ◄──────────── Watchdog (poll events, timeouts, faults) ◄─────┘
//! ```
//!
//! The reduction arithmetic and the tensor storage are delegated to two
//! external collaborators expressed as traits:
//!
//! - [`device::ComputeBackend`]: buffer allocation, per-device streams and events
//! - [`backend::CollectiveBackend`]: communicator init/split/abort and the kernels
//!
//! In-process implementations of both ([`device::HostComputeBackend`] and
//! [`backend::LocalCollectiveBackend`]) are provided so that multi-rank groups
//! can be exercised with plain OS threads.
//!
//! # Example
//!
//! ```rust,ignore
//! use dynamo_collectives::{ProcessGroup, ProcessGroupOptions, ReduceOp};
//!
//! let pg = ProcessGroup::new(store, rank, world_size, backends, ProcessGroupOptions::default())?;
//! let work = pg.all_reduce(&tensors, ReduceOp::Sum)?;
//! work.wait(None)?;
//! ```

pub mod backend;
pub mod comm;
pub mod config;
pub mod device;
pub mod error;
pub mod logging;
pub mod process_group;
pub mod store;
pub mod work;

mod dispatch;
mod watchdog;

pub use backend::{CollectiveBackend, DeviceComm, LocalCollectiveBackend, ReduceOp, UniqueId};
pub use comm::{ChannelOrigin, DeviceKey};
pub use config::{CollectivesConfig, ConfigError};
pub use device::{ComputeBackend, DType, HostComputeBackend, SparseTensor, Tensor};
pub use error::{CollectiveError, ErrorKind, Result};
pub use process_group::{
    Backends, BroadcastOptions, ProcessGroup, ProcessGroupOptions, ProcessGroupOptionsBuilder,
    ReduceOptions,
};
pub use store::{MemoryStore, PrefixStore, Store, StoreError};
pub use work::{OpType, Work, WorkOutput, WorkStatus};
