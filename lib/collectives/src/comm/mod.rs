// SPDX-FileCopyrightText: Copyright (c) 2025-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Multi-device communicators and their per-group cache.
//!
//! A [`Communicator`] binds one ordered set of local devices to a channel of
//! the collective backend. It is created lazily by [`CommunicatorCache`]
//! either through a fresh bootstrap (rank 0 publishes a unique id through
//! the rendezvous store) or by splitting the parent group's communicator for
//! the same device set. Creation completes asynchronously; an
//! [`InitAttempt`] tracks it until every device is ready, fails, or times out.

mod bootstrap;
mod cache;
mod communicator;
mod init;

pub use bootstrap::BootstrapInfo;
pub use communicator::{ChannelOrigin, Communicator, DeviceKey};

pub(crate) use cache::{CommContext, CommunicatorCache, SplitSource};
pub(crate) use init::InitAttempt;
