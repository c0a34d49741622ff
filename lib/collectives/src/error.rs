// SPDX-FileCopyrightText: Copyright (c) 2025-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Error taxonomy for collective orchestration.
//!
//! Validation errors ([`CollectiveError::ShapeMismatch`],
//! [`CollectiveError::InvalidArgument`]) are local and synchronous: they never
//! touch communicator state. Init and asynchronous errors are fatal for the
//! communicator they occur on and are delivered to every caller that uses it
//! afterwards, which is why the error type is `Clone`.

use std::time::Duration;

use crate::store::StoreError;
use crate::work::OpType;

pub type Result<T, E = CollectiveError> = std::result::Result<T, E>;

/// Coarse error category, so callers can branch on cause without matching
/// on messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    InvalidRank,
    CommInitTimeout,
    AsyncBackend,
    TimedOut,
    ShapeMismatch,
    InvalidArgument,
    SequenceMismatch,
    Store,
    Device,
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum CollectiveError {
    #[error("Invalid rank {rank} for world size {world_size}")]
    InvalidRank { rank: usize, world_size: usize },

    #[error(
        "Failed to initialize communicator on rank {rank} for devices [{devices}] after {elapsed:?}: {reason}"
    )]
    CommInitTimeout {
        rank: usize,
        devices: String,
        elapsed: Duration,
        reason: String,
    },

    #[error("Asynchronous backend error on rank {rank}: {reason}")]
    AsyncBackendError { rank: usize, reason: String },

    #[error("Collective {op} (seq {seq}) on rank {rank} timed out after {timeout:?}")]
    TimedOut {
        rank: usize,
        op: OpType,
        seq: u64,
        timeout: Duration,
    },

    #[error("Shape mismatch: {0}")]
    ShapeMismatch(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error(
        "Sequence number mismatch on rank {rank}: expected {expected}, rank {peer} observed {observed}"
    )]
    SequenceMismatch {
        rank: usize,
        peer: usize,
        expected: u64,
        observed: u64,
    },

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Device error: {0}")]
    Device(String),
}

impl CollectiveError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::InvalidRank { .. } => ErrorKind::InvalidRank,
            Self::CommInitTimeout { .. } => ErrorKind::CommInitTimeout,
            Self::AsyncBackendError { .. } => ErrorKind::AsyncBackend,
            Self::TimedOut { .. } => ErrorKind::TimedOut,
            Self::ShapeMismatch(_) => ErrorKind::ShapeMismatch,
            Self::InvalidArgument(_) => ErrorKind::InvalidArgument,
            Self::SequenceMismatch { .. } => ErrorKind::SequenceMismatch,
            Self::Store(_) => ErrorKind::Store,
            Self::Device(_) => ErrorKind::Device,
        }
    }

    /// Whether this error leaves the communicator it occurred on unusable.
    pub fn is_communicator_fatal(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::CommInitTimeout | ErrorKind::AsyncBackend | ErrorKind::TimedOut
        )
    }
}
