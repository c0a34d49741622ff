// SPDX-FileCopyrightText: Copyright (c) 2025-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Argument validation and staging kernels shared by the collective entry points.
//!
//! Validation runs before any communicator is touched, so a rejected call
//! never leaves device or communicator state behind.

use crate::comm::DeviceKey;
use crate::device::{DType, Kernel, SparseTensor, Tensor};
use crate::error::{CollectiveError, Result};

/// Validate per-device tensors and derive the device set they address.
pub(crate) fn device_key(tensors: &[Tensor], device_count: usize) -> Result<DeviceKey> {
    let devices: Vec<usize> = tensors.iter().map(Tensor::device).collect();
    let key = key_for(&devices, device_count)?;
    let first = &tensors[0];
    for tensor in &tensors[1..] {
        if tensor.dtype() != first.dtype() || tensor.shape() != first.shape() {
            return Err(CollectiveError::ShapeMismatch(format!(
                "tensor on device {} is {:?} {:?}, expected {:?} {:?}",
                tensor.device(),
                tensor.dtype(),
                tensor.shape(),
                first.dtype(),
                first.shape()
            )));
        }
    }
    Ok(key)
}

pub(crate) fn sparse_device_key(tensors: &[SparseTensor], device_count: usize) -> Result<DeviceKey> {
    let devices: Vec<usize> = tensors.iter().map(SparseTensor::device).collect();
    let key = key_for(&devices, device_count)?;
    let first = &tensors[0];
    for tensor in &tensors[1..] {
        if tensor.dtype() != first.dtype() || tensor.sizes() != first.sizes() {
            return Err(CollectiveError::ShapeMismatch(format!(
                "sparse tensor on device {} has sizes {:?}, expected {:?}",
                tensor.device(),
                tensor.sizes(),
                first.sizes()
            )));
        }
    }
    Ok(key)
}

fn key_for(devices: &[usize], device_count: usize) -> Result<DeviceKey> {
    if devices.is_empty() {
        return Err(CollectiveError::InvalidArgument(
            "expected at least one tensor".to_string(),
        ));
    }
    if devices.len() > device_count {
        return Err(CollectiveError::InvalidArgument(format!(
            "{} tensors given but only {device_count} devices are available",
            devices.len()
        )));
    }
    if let Some(bad) = devices.iter().find(|&&d| d >= device_count) {
        return Err(CollectiveError::InvalidArgument(format!(
            "device {bad} out of range for {device_count} devices"
        )));
    }
    DeviceKey::new(devices)
}

pub(crate) fn check_root(root_rank: usize, size: usize, root_tensor: usize, local: usize) -> Result<()> {
    if root_rank >= size {
        return Err(CollectiveError::InvalidArgument(format!(
            "root rank {root_rank} out of range for {size} ranks"
        )));
    }
    if root_tensor >= local {
        return Err(CollectiveError::InvalidArgument(format!(
            "root tensor {root_tensor} out of range for {local} tensors"
        )));
    }
    Ok(())
}

/// Each `lists[i]` must hold `participants` tensors co-located with and
/// shaped like `anchors[i]`.
pub(crate) fn check_tensor_lists(lists: &[Vec<Tensor>], anchors: &[Tensor], participants: usize) -> Result<()> {
    if lists.len() != anchors.len() {
        return Err(CollectiveError::ShapeMismatch(format!(
            "{} tensor lists for {} devices",
            lists.len(),
            anchors.len()
        )));
    }
    for (list, anchor) in lists.iter().zip(anchors) {
        if list.len() != participants {
            return Err(CollectiveError::ShapeMismatch(format!(
                "tensor list for device {} has {} entries, expected one per participant ({participants})",
                anchor.device(),
                list.len()
            )));
        }
        for tensor in list {
            if tensor.device() != anchor.device() {
                return Err(CollectiveError::InvalidArgument(format!(
                    "tensor on device {} listed for device {}",
                    tensor.device(),
                    anchor.device()
                )));
            }
            if tensor.dtype() != anchor.dtype() || tensor.numel() != anchor.numel() {
                return Err(CollectiveError::ShapeMismatch(format!(
                    "list entry of {} {:?} elements does not match {} {:?} elements",
                    tensor.numel(),
                    tensor.dtype(),
                    anchor.numel(),
                    anchor.dtype()
                )));
            }
        }
    }
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum FlatLayout {
    /// Output holds `participants` input-sized chunks.
    Gather,
    /// Input holds `participants` output-sized chunks.
    Scatter,
}

/// Validate flat input/output pairs of the `_base` variants.
pub(crate) fn check_flat_pairs(
    outputs: &[Tensor],
    inputs: &[Tensor],
    participants: usize,
    layout: FlatLayout,
) -> Result<()> {
    if outputs.len() != inputs.len() {
        return Err(CollectiveError::ShapeMismatch(format!(
            "{} outputs for {} inputs",
            outputs.len(),
            inputs.len()
        )));
    }
    for (output, input) in outputs.iter().zip(inputs) {
        if output.device() != input.device() {
            return Err(CollectiveError::InvalidArgument(format!(
                "output on device {} paired with input on device {}",
                output.device(),
                input.device()
            )));
        }
        if output.dtype() != input.dtype() {
            return Err(CollectiveError::ShapeMismatch(format!(
                "output dtype {:?} does not match input dtype {:?}",
                output.dtype(),
                input.dtype()
            )));
        }
        let (large, small) = match layout {
            FlatLayout::Gather => (output, input),
            FlatLayout::Scatter => (input, output),
        };
        if large.numel() != participants * small.numel() {
            return Err(CollectiveError::ShapeMismatch(format!(
                "expected {participants} x {} = {} elements, got {}",
                small.numel(),
                participants * small.numel(),
                large.numel()
            )));
        }
    }
    Ok(())
}

/// Copy consecutive chunks of `staging` into `outputs`.
pub(crate) fn unpack_kernel(staging: Tensor, outputs: Vec<Tensor>) -> Kernel {
    Box::new(move || {
        let data = staging.to_vec();
        let mut offset = 0;
        for output in &outputs {
            let end = offset + output.numel();
            if let Err(err) = output.copy_from_slice(&data[offset..end]) {
                tracing::error!(error = %err, "failed to unpack staging buffer");
                return;
            }
            offset = end;
        }
    })
}

/// Concatenate `inputs` into `staging`.
pub(crate) fn pack_kernel(inputs: Vec<Tensor>, staging: Tensor) -> Kernel {
    Box::new(move || {
        let mut offset = 0;
        for input in &inputs {
            let data = input.to_vec();
            if let Err(err) = staging.copy_into_range(offset, &data) {
                tracing::error!(error = %err, "failed to pack staging buffer");
                return;
            }
            offset += data.len();
        }
    })
}

/// Coalesce `input` into row format inside `staging`.
pub(crate) fn sparse_rows_kernel(input: SparseTensor, staging: SparseTensor) -> Kernel {
    Box::new(move || {
        let assigned = input.to_row_format().and_then(|rows| staging.assign(&rows));
        if let Err(err) = assigned {
            tracing::error!(error = %err, "failed to coalesce sparse input");
        }
    })
}

/// Write the reduced dense buffer back into the input and the result handle.
pub(crate) fn sparse_result_kernel(dense: Tensor, input: SparseTensor, result: SparseTensor) -> Kernel {
    Box::new(move || {
        let assigned = SparseTensor::from_dense_rows(&dense)
            .and_then(|rows| input.assign(&rows).and_then(|()| result.assign(&rows)));
        if let Err(err) = assigned {
            tracing::error!(error = %err, "failed to write sparse result");
        }
    })
}

/// Scratch dtype for the barrier's single-element exchange.
pub(crate) const BARRIER_DTYPE: DType = DType::Float32;
