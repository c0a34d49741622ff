// SPDX-FileCopyrightText: Copyright (c) 2025-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

use std::sync::Arc;

use parking_lot::RwLock;

use super::tensor::{DType, Tensor};
use crate::error::{CollectiveError, Result};

#[derive(Debug, Clone, PartialEq)]
struct SparseParts {
    /// `indices[d][k]` is the coordinate along dimension `d` of entry `k`.
    indices: Vec<Vec<usize>>,
    /// `nnz * dense_len` values, one dense block per entry.
    values: Vec<f64>,
}

#[derive(Debug)]
struct SparseInner {
    device: usize,
    dtype: DType,
    sizes: Vec<usize>,
    parts: RwLock<SparseParts>,
}

/// Sparse device buffer in coordinate (COO) layout.
///
/// The first `sparse_dim` dimensions are indexed explicitly; the remaining
/// dimensions are stored densely per entry. `sparse_dim == 1` is the row
/// format: each entry is a full row of the dense tensor. Like [`Tensor`],
/// clones share storage.
#[derive(Debug, Clone)]
pub struct SparseTensor {
    inner: Arc<SparseInner>,
}

impl SparseTensor {
    pub fn from_parts(
        device: usize,
        dtype: DType,
        sizes: &[usize],
        indices: Vec<Vec<usize>>,
        values: Vec<f64>,
    ) -> Result<Self> {
        let sparse_dim = indices.len();
        if sparse_dim == 0 || sparse_dim > sizes.len() {
            return Err(CollectiveError::ShapeMismatch(format!(
                "sparse dimension {sparse_dim} invalid for sizes {sizes:?}"
            )));
        }
        let nnz = indices[0].len();
        for (d, row) in indices.iter().enumerate() {
            if row.len() != nnz {
                return Err(CollectiveError::ShapeMismatch(format!(
                    "index row {d} has {} entries, expected {nnz}",
                    row.len()
                )));
            }
            if let Some(bad) = row.iter().find(|&&i| i >= sizes[d]) {
                return Err(CollectiveError::InvalidArgument(format!(
                    "index {bad} out of bounds for dimension {d} of size {}",
                    sizes[d]
                )));
            }
        }
        let dense_len: usize = sizes[sparse_dim..].iter().product();
        if values.len() != nnz * dense_len {
            return Err(CollectiveError::ShapeMismatch(format!(
                "{nnz} entries of {dense_len} elements need {} values, got {}",
                nnz * dense_len,
                values.len()
            )));
        }
        let values = values.into_iter().map(|v| dtype.narrow(v)).collect();
        Ok(Self {
            inner: Arc::new(SparseInner {
                device,
                dtype,
                sizes: sizes.to_vec(),
                parts: RwLock::new(SparseParts { indices, values }),
            }),
        })
    }

    /// Coordinate format: one entry per non-zero element.
    pub fn from_dense(tensor: &Tensor) -> Result<Self> {
        let sizes = tensor.shape().to_vec();
        let ndim = sizes.len();
        let mut indices = vec![Vec::new(); ndim];
        let mut values = Vec::new();
        for (linear, value) in tensor.to_vec().into_iter().enumerate() {
            if value == 0.0 {
                continue;
            }
            let mut rem = linear;
            for d in (0..ndim).rev() {
                indices[d].push(rem % sizes[d]);
                rem /= sizes[d];
            }
            values.push(value);
        }
        Self::from_parts(tensor.device(), tensor.dtype(), &sizes, indices, values)
    }

    /// Row format: one entry per row holding at least one non-zero element.
    pub fn from_dense_rows(tensor: &Tensor) -> Result<Self> {
        let sizes = tensor.shape().to_vec();
        let Some(&rows) = sizes.first() else {
            return Err(CollectiveError::ShapeMismatch(
                "row format needs at least one dimension".to_string(),
            ));
        };
        let row_len = if rows == 0 { 0 } else { tensor.numel() / rows };
        let data = tensor.to_vec();
        let mut row_indices = Vec::new();
        let mut values = Vec::new();
        for (row, chunk) in data.chunks(row_len.max(1)).enumerate().take(rows) {
            if chunk.iter().any(|v| *v != 0.0) {
                row_indices.push(row);
                values.extend_from_slice(chunk);
            }
        }
        Self::from_parts(
            tensor.device(),
            tensor.dtype(),
            &sizes,
            vec![row_indices],
            values,
        )
    }

    /// Empty row-format tensor with the same metadata.
    pub(crate) fn empty_rows_like(other: &SparseTensor) -> Self {
        Self {
            inner: Arc::new(SparseInner {
                device: other.device(),
                dtype: other.dtype(),
                sizes: other.sizes().to_vec(),
                parts: RwLock::new(SparseParts {
                    indices: vec![Vec::new()],
                    values: Vec::new(),
                }),
            }),
        }
    }

    pub fn device(&self) -> usize {
        self.inner.device
    }

    pub fn dtype(&self) -> DType {
        self.inner.dtype
    }

    pub fn sizes(&self) -> &[usize] {
        &self.inner.sizes
    }

    pub fn sparse_dim(&self) -> usize {
        self.inner.parts.read().indices.len()
    }

    pub fn nnz(&self) -> usize {
        self.inner.parts.read().indices[0].len()
    }

    /// Shape of the index matrix: `[sparse_dim, nnz]`.
    pub fn indices_shape(&self) -> [usize; 2] {
        let parts = self.inner.parts.read();
        [parts.indices.len(), parts.indices[0].len()]
    }

    pub fn indices(&self) -> Vec<Vec<usize>> {
        self.inner.parts.read().indices.clone()
    }

    pub fn values(&self) -> Vec<f64> {
        self.inner.parts.read().values.clone()
    }

    pub fn numel(&self) -> usize {
        self.inner.sizes.iter().product()
    }

    /// Materialize as a dense tensor; duplicate entries are summed.
    pub fn to_dense(&self) -> Tensor {
        let sizes = &self.inner.sizes;
        let parts = self.inner.parts.read();
        let sparse_dim = parts.indices.len();
        let dense_len: usize = sizes[sparse_dim..].iter().product();
        let mut dense = vec![0.0; self.numel()];
        for k in 0..parts.indices[0].len() {
            let mut block = 0;
            for d in 0..sparse_dim {
                block = block * sizes[d] + parts.indices[d][k];
            }
            let src = &parts.values[k * dense_len..(k + 1) * dense_len];
            for (dst, v) in dense[block * dense_len..(block + 1) * dense_len]
                .iter_mut()
                .zip(src)
            {
                *dst += v;
            }
        }
        drop(parts);
        let tensor = Tensor::zeros(self.device(), sizes, self.dtype());
        // sizes match by construction
        let _ = tensor.copy_from_slice(&dense);
        tensor
    }

    /// Re-encode in row format.
    pub fn to_row_format(&self) -> Result<Self> {
        Self::from_dense_rows(&self.to_dense())
    }

    /// Replace this tensor's indices and values with those of `other`.
    pub fn assign(&self, other: &SparseTensor) -> Result<()> {
        if other.sizes() != self.sizes() || other.dtype() != self.dtype() {
            return Err(CollectiveError::ShapeMismatch(format!(
                "cannot assign sparse tensor of sizes {:?} ({:?}) to {:?} ({:?})",
                other.sizes(),
                other.dtype(),
                self.sizes(),
                self.dtype()
            )));
        }
        if Arc::ptr_eq(&self.inner, &other.inner) {
            return Ok(());
        }
        let parts = other.inner.parts.read().clone();
        *self.inner.parts.write() = parts;
        Ok(())
    }

    /// Serialize a row-format tensor as `[nrows, row indices.., row values..]`.
    pub(crate) fn encode_rows(&self) -> std::result::Result<Vec<f64>, String> {
        let parts = self.inner.parts.read();
        if parts.indices.len() != 1 {
            return Err(format!(
                "expected row format, got sparse dimension {}",
                parts.indices.len()
            ));
        }
        let rows = &parts.indices[0];
        let mut encoded = Vec::with_capacity(1 + rows.len() + parts.values.len());
        encoded.push(rows.len() as f64);
        encoded.extend(rows.iter().map(|&r| r as f64));
        encoded.extend_from_slice(&parts.values);
        Ok(encoded)
    }

    /// Densify an encoding produced by [`Self::encode_rows`]; repeated rows are summed.
    pub(crate) fn decode_rows(
        encoded: &[f64],
        sizes: &[usize],
    ) -> std::result::Result<Vec<f64>, String> {
        let numel: usize = sizes.iter().product();
        let rows = sizes.first().copied().unwrap_or(0);
        let row_len = if rows == 0 { 0 } else { numel / rows };
        let Some(&count) = encoded.first() else {
            return Err("empty sparse row encoding".to_string());
        };
        let count = count as usize;
        if encoded.len() != 1 + count + count * row_len {
            return Err(format!(
                "sparse row encoding of {count} rows has length {}",
                encoded.len()
            ));
        }
        let (indices, values) = encoded[1..].split_at(count);
        let mut dense = vec![0.0; numel];
        for (k, &row) in indices.iter().enumerate() {
            let row = row as usize;
            if row >= rows {
                return Err(format!("row index {row} out of bounds for {rows} rows"));
            }
            for (dst, v) in dense[row * row_len..(row + 1) * row_len]
                .iter_mut()
                .zip(&values[k * row_len..(k + 1) * row_len])
            {
                *dst += v;
            }
        }
        Ok(dense)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dense_3x3(value: f64) -> Tensor {
        Tensor::full(0, &[3, 3], DType::Float32, value)
    }

    #[test]
    fn test_from_dense_coordinate_format() {
        let sparse = SparseTensor::from_dense(&dense_3x3(2.0)).unwrap();
        assert_eq!(sparse.indices_shape(), [2, 9]);
        assert!(sparse.values().iter().all(|v| *v == 2.0));
        assert_eq!(sparse.to_dense().to_vec(), vec![2.0; 9]);
    }

    #[test]
    fn test_row_format_skips_empty_rows() {
        let dense = Tensor::from_vec(
            0,
            &[3, 2],
            DType::Float64,
            vec![1.0, 0.0, 0.0, 0.0, 0.0, 3.0],
        )
        .unwrap();
        let rows = SparseTensor::from_dense_rows(&dense).unwrap();
        assert_eq!(rows.indices(), vec![vec![0, 2]]);
        assert_eq!(rows.values(), vec![1.0, 0.0, 0.0, 3.0]);
        assert_eq!(rows.to_dense().to_vec(), dense.to_vec());
    }

    #[test]
    fn test_to_row_format_from_coordinates() {
        let coo = SparseTensor::from_parts(
            1,
            DType::Float32,
            &[2, 2],
            vec![vec![1, 1], vec![0, 1]],
            vec![4.0, 5.0],
        )
        .unwrap();
        let rows = coo.to_row_format().unwrap();
        assert_eq!(rows.indices_shape(), [1, 1]);
        assert_eq!(rows.values(), vec![4.0, 5.0]);
        assert_eq!(rows.device(), 1);
    }

    #[test]
    fn test_duplicates_sum_when_densified() {
        let coo = SparseTensor::from_parts(
            0,
            DType::Float64,
            &[3],
            vec![vec![1, 1]],
            vec![2.0, 3.0],
        )
        .unwrap();
        assert_eq!(coo.to_dense().to_vec(), vec![0.0, 5.0, 0.0]);
    }

    #[test]
    fn test_from_parts_validation() {
        assert!(SparseTensor::from_parts(0, DType::Float32, &[2], vec![vec![2]], vec![1.0]).is_err());
        assert!(
            SparseTensor::from_parts(0, DType::Float32, &[2, 2], vec![vec![0]], vec![1.0]).is_err()
        );
        assert!(SparseTensor::from_parts(0, DType::Float32, &[2], vec![], vec![]).is_err());
    }

    #[test]
    fn test_row_encoding() {
        let rows = SparseTensor::from_dense_rows(&dense_3x3(1.0)).unwrap();
        let encoded = rows.encode_rows().unwrap();
        assert_eq!(encoded.len(), 1 + 3 + 9);
        let dense = SparseTensor::decode_rows(&encoded, &[3, 3]).unwrap();
        assert_eq!(dense, vec![1.0; 9]);
        assert!(SparseTensor::decode_rows(&encoded[..5], &[3, 3]).is_err());

        let coo = SparseTensor::from_dense(&dense_3x3(1.0)).unwrap();
        assert!(coo.encode_rows().is_err());
    }

    #[test]
    fn test_assign_shares_result() {
        let target = SparseTensor::from_dense(&dense_3x3(1.0)).unwrap();
        let source = SparseTensor::from_dense_rows(&dense_3x3(6.0)).unwrap();
        target.assign(&source).unwrap();
        assert_eq!(target.indices_shape(), [1, 3]);
        assert_eq!(target.to_dense().to_vec(), vec![6.0; 9]);

        let other = SparseTensor::from_dense(&Tensor::full(0, &[2], DType::Float32, 1.0)).unwrap();
        assert!(target.assign(&other).is_err());
    }
}
