// SPDX-FileCopyrightText: Copyright (c) 2025-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::error::{CollectiveError, Result};

/// Element type of a buffer.
///
/// Storage is always `f64`; the dtype decides how written values are
/// narrowed, so integer buffers hold whole numbers and `Float32` buffers
/// hold values representable in single precision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DType {
    Float32,
    Float64,
    Int32,
    Int64,
}

impl DType {
    pub fn is_integral(&self) -> bool {
        matches!(self, DType::Int32 | DType::Int64)
    }

    pub fn element_size(&self) -> usize {
        match self {
            DType::Float32 | DType::Int32 => 4,
            DType::Float64 | DType::Int64 => 8,
        }
    }

    pub(crate) fn narrow(&self, value: f64) -> f64 {
        match self {
            DType::Float32 => value as f32 as f64,
            DType::Float64 => value,
            DType::Int32 => value.trunc() as i32 as f64,
            DType::Int64 => value.trunc() as i64 as f64,
        }
    }
}

#[derive(Debug)]
struct TensorInner {
    device: usize,
    shape: Vec<usize>,
    dtype: DType,
    data: RwLock<Vec<f64>>,
}

/// Dense device buffer.
///
/// Cloning a `Tensor` shares the underlying storage, the same way a device
/// pointer is shared between the host and the kernels operating on it.
#[derive(Debug, Clone)]
pub struct Tensor {
    inner: Arc<TensorInner>,
}

impl Tensor {
    pub fn zeros(device: usize, shape: &[usize], dtype: DType) -> Self {
        Self::full(device, shape, dtype, 0.0)
    }

    pub fn full(device: usize, shape: &[usize], dtype: DType, value: f64) -> Self {
        let numel = shape.iter().product();
        Self {
            inner: Arc::new(TensorInner {
                device,
                shape: shape.to_vec(),
                dtype,
                data: RwLock::new(vec![dtype.narrow(value); numel]),
            }),
        }
    }

    pub fn from_vec(device: usize, shape: &[usize], dtype: DType, data: Vec<f64>) -> Result<Self> {
        let numel: usize = shape.iter().product();
        if data.len() != numel {
            return Err(CollectiveError::ShapeMismatch(format!(
                "shape {shape:?} holds {numel} elements, got {}",
                data.len()
            )));
        }
        let data = data.into_iter().map(|v| dtype.narrow(v)).collect();
        Ok(Self {
            inner: Arc::new(TensorInner {
                device,
                shape: shape.to_vec(),
                dtype,
                data: RwLock::new(data),
            }),
        })
    }

    pub fn device(&self) -> usize {
        self.inner.device
    }

    pub fn shape(&self) -> &[usize] {
        &self.inner.shape
    }

    pub fn dtype(&self) -> DType {
        self.inner.dtype
    }

    pub fn numel(&self) -> usize {
        self.inner.shape.iter().product()
    }

    /// Copy the buffer contents to the host.
    pub fn to_vec(&self) -> Vec<f64> {
        self.inner.data.read().clone()
    }

    pub fn fill(&self, value: f64) {
        let value = self.inner.dtype.narrow(value);
        self.inner.data.write().iter_mut().for_each(|v| *v = value);
    }

    pub fn copy_from_slice(&self, values: &[f64]) -> Result<()> {
        self.copy_into_range(0, values)
    }

    /// Overwrite `values.len()` elements starting at `offset`.
    pub fn copy_into_range(&self, offset: usize, values: &[f64]) -> Result<()> {
        let mut data = self.inner.data.write();
        let end = offset + values.len();
        if end > data.len() {
            return Err(CollectiveError::ShapeMismatch(format!(
                "write of {} elements at offset {offset} overflows buffer of {}",
                values.len(),
                data.len()
            )));
        }
        let dtype = self.inner.dtype;
        for (dst, src) in data[offset..end].iter_mut().zip(values) {
            *dst = dtype.narrow(*src);
        }
        Ok(())
    }

    /// Whether both handles refer to the same storage.
    pub fn same_storage(&self, other: &Tensor) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}
