//! Matrix Operations for the Transformer
//!
//! Every activation in the model is a 2-D matrix: one row per sequence
//! position, one column per feature. This module provides a small row-major
//! `f32` matrix type with the handful of operations the layers need.
//!
//! ## Core Concepts
//!
//! - **Data**: Flat `Vec<f32>` storing all elements in row-major order
//! - **Shape**: `[rows, cols]`
//!
//! ## Example
//!
//! ```rust
//! use viola::Tensor;
//!
//! let a = Tensor::from_rows(&[vec![1.0, 2.0, 3.0], vec![4.0, 5.0, 6.0]])?;
//! let b = Tensor::from_rows(&[vec![1.0, 0.0], vec![0.0, 1.0], vec![1.0, 1.0]])?;
//! let c = a.matmul(&b)?;
//! assert_eq!(c.shape, vec![2, 2]);
//! assert_eq!(c.data, vec![4.0, 5.0, 10.0, 11.0]);
//! # Ok::<(), viola::ViolaError>(())
//! ```
//!
//! ## Errors Instead of Panics
//!
//! Shapes flow in from callers (token sequences of any length, one-hot
//! targets, loaded weights), so every operation that combines two matrices
//! checks their shapes and returns [`ViolaError::ShapeMismatch`] rather than
//! asserting.
//!
//! ## Performance Optimizations
//!
//! - **Matrix multiplication**: Cache-blocked algorithm with parallel row
//!   processing via Rayon for larger products
//! - **Element-wise operations**: Parallel iteration over data

use crate::error::{Result, ViolaError};
use rayon::prelude::*;

/// A row-major matrix of `f32` values.
#[derive(Clone, Debug, PartialEq)]
pub struct Tensor {
    /// Flat storage of all elements
    pub data: Vec<f32>,
    /// `[rows, cols]` for matrices, `[len]` for parameter vectors
    pub shape: Vec<usize>,
}

impl Tensor {
    /// Create a tensor from flat data and a shape.
    ///
    /// Fails if the product of the shape does not equal the data length.
    pub fn new(data: Vec<f32>, shape: Vec<usize>) -> Result<Self> {
        let expected: usize = shape.iter().product();
        if data.len() != expected {
            return Err(ViolaError::shape(format!(
                "data length ({}) doesn't match shape {:?} (expected {})",
                data.len(),
                shape,
                expected
            )));
        }
        Ok(Self { data, shape })
    }

    /// Internal constructor for shapes computed from already-checked operands.
    pub(crate) fn from_parts(data: Vec<f32>, shape: Vec<usize>) -> Self {
        debug_assert_eq!(data.len(), shape.iter().product::<usize>());
        Self { data, shape }
    }

    /// Create a matrix filled with zeros.
    pub fn zeros(rows: usize, cols: usize) -> Self {
        Self::from_parts(vec![0.0; rows * cols], vec![rows, cols])
    }

    /// Create a vector (1-D tensor) filled with `value`.
    pub fn filled_vector(len: usize, value: f32) -> Self {
        Self::from_parts(vec![value; len], vec![len])
    }

    /// Build a matrix from nested rows.
    ///
    /// Fails on ragged input. An empty slice produces a `[0, 0]` matrix.
    pub fn from_rows(rows: &[Vec<f32>]) -> Result<Self> {
        let cols = rows.first().map_or(0, Vec::len);
        let mut data = Vec::with_capacity(rows.len() * cols);
        for (i, row) in rows.iter().enumerate() {
            if row.len() != cols {
                return Err(ViolaError::shape(format!(
                    "row {} has {} columns, expected {}",
                    i,
                    row.len(),
                    cols
                )));
            }
            data.extend_from_slice(row);
        }
        Ok(Self::from_parts(data, vec![rows.len(), cols]))
    }

    /// Copy the matrix out as nested rows.
    pub fn to_rows(&self) -> Vec<Vec<f32>> {
        (0..self.rows()).map(|i| self.row(i).to_vec()).collect()
    }

    /// Number of rows (sequence positions). A vector has one row.
    pub fn rows(&self) -> usize {
        match self.shape.len() {
            2 => self.shape[0],
            _ => 1,
        }
    }

    /// Number of columns (features). For a vector, its length.
    pub fn cols(&self) -> usize {
        self.shape.last().copied().unwrap_or(0)
    }

    /// Borrow one row.
    pub fn row(&self, i: usize) -> &[f32] {
        let cols = self.cols();
        &self.data[i * cols..(i + 1) * cols]
    }

    /// Mutably borrow one row.
    pub fn row_mut(&mut self, i: usize) -> &mut [f32] {
        let cols = self.cols();
        &mut self.data[i * cols..(i + 1) * cols]
    }

    /// Fail unless this tensor has exactly `expected` shape.
    pub fn ensure_shape(&self, expected: &[usize], what: &str) -> Result<()> {
        if self.shape != expected {
            return Err(ViolaError::shape(format!(
                "{} has shape {:?}, expected {:?}",
                what, self.shape, expected
            )));
        }
        Ok(())
    }

    /// Fail unless this is a matrix with `cols` columns and at least one row.
    pub fn ensure_width(&self, cols: usize, what: &str) -> Result<()> {
        if self.shape.len() != 2 || self.shape[0] == 0 {
            return Err(ViolaError::EmptyInput(format!(
                "{} must be a non-empty matrix, got shape {:?}",
                what, self.shape
            )));
        }
        if self.shape[1] != cols {
            return Err(ViolaError::shape(format!(
                "{} has width {}, expected {}",
                what, self.shape[1], cols
            )));
        }
        Ok(())
    }

    /// SIMD-friendly inner loop: `result[j] += a_val * b[j]`
    #[inline(always)]
    fn matmul_inner_simd(a_val: f32, b: &[f32], result: &mut [f32]) {
        for (r, &b_val) in result.iter_mut().zip(b.iter()) {
            *r += a_val * b_val;
        }
    }

    /// Matrix multiplication `[m, k] @ [k, n] -> [m, n]`.
    ///
    /// Small products run sequentially; products of at least 1K
    /// multiply-adds use the parallel cache-blocked kernel.
    pub fn matmul(&self, other: &Tensor) -> Result<Tensor> {
        if self.shape.len() != 2 || other.shape.len() != 2 || self.shape[1] != other.shape[0] {
            return Err(ViolaError::shape(format!(
                "matrix dimensions incompatible: {:?} @ {:?}",
                self.shape, other.shape
            )));
        }

        let m = self.shape[0];
        let k = self.shape[1];
        let n = other.shape[1];

        if m * n * k >= 1_000 {
            return Ok(self.matmul_parallel_blocked(other, m, n, k));
        }

        let mut result = vec![0.0; m * n];
        for i in 0..m {
            for l in 0..k {
                let a_val = self.data[i * k + l];
                Self::matmul_inner_simd(
                    a_val,
                    &other.data[l * n..(l + 1) * n],
                    &mut result[i * n..(i + 1) * n],
                );
            }
        }
        Ok(Tensor::from_parts(result, vec![m, n]))
    }

    /// Parallel cache-blocked matrix multiplication.
    ///
    /// Output rows are split into 8-row blocks processed on the Rayon pool;
    /// inside a block the inner dimension and columns are tiled 8×8.
    fn matmul_parallel_blocked(&self, other: &Tensor, m: usize, n: usize, k: usize) -> Tensor {
        const BLOCK_SIZE: usize = 8;

        let mut result = vec![0.0; m * n];
        if n == 0 {
            return Tensor::from_parts(result, vec![m, n]);
        }

        result
            .par_chunks_mut(BLOCK_SIZE * n)
            .enumerate()
            .for_each(|(block_i, result_block)| {
                let i_start = block_i * BLOCK_SIZE;
                let i_end = (i_start + BLOCK_SIZE).min(m);

                for j_start in (0..n).step_by(BLOCK_SIZE) {
                    let j_end = (j_start + BLOCK_SIZE).min(n);

                    for k_start in (0..k).step_by(BLOCK_SIZE) {
                        let k_end = (k_start + BLOCK_SIZE).min(k);

                        for i in i_start..i_end {
                            let row_offset = (i - i_start) * n;
                            for k_idx in k_start..k_end {
                                let a_val = self.data[i * k + k_idx];
                                Self::matmul_inner_simd(
                                    a_val,
                                    &other.data[k_idx * n + j_start..k_idx * n + j_end],
                                    &mut result_block[row_offset + j_start..row_offset + j_end],
                                );
                            }
                        }
                    }
                }
            });

        Tensor::from_parts(result, vec![m, n])
    }

    /// Transpose a matrix.
    pub fn transpose(&self) -> Tensor {
        let rows = self.rows();
        let cols = self.cols();
        let mut result = vec![0.0; rows * cols];
        for i in 0..rows {
            for j in 0..cols {
                result[j * rows + i] = self.data[i * cols + j];
            }
        }
        Tensor::from_parts(result, vec![cols, rows])
    }

    /// Element-wise addition of two tensors of identical shape.
    pub fn add(&self, other: &Tensor) -> Result<Tensor> {
        if self.shape != other.shape {
            return Err(ViolaError::shape(format!(
                "cannot add {:?} and {:?}",
                self.shape, other.shape
            )));
        }
        let result = self
            .data
            .par_iter()
            .zip(&other.data)
            .map(|(a, b)| a + b)
            .collect();
        Ok(Tensor::from_parts(result, self.shape.clone()))
    }

    /// Add a bias vector `[cols]` to every row of a matrix `[rows, cols]`.
    pub fn add_row_vector(&self, bias: &Tensor) -> Result<Tensor> {
        let cols = self.cols();
        if bias.shape != [cols] {
            return Err(ViolaError::shape(format!(
                "cannot broadcast bias {:?} over {:?}",
                bias.shape, self.shape
            )));
        }
        let result = self
            .data
            .par_iter()
            .enumerate()
            .map(|(i, &x)| x + bias.data[i % cols])
            .collect();
        Ok(Tensor::from_parts(result, self.shape.clone()))
    }

    /// Multiply all elements by a scalar.
    pub fn mul_scalar(&self, scalar: f32) -> Tensor {
        let result = self.data.par_iter().map(|&x| x * scalar).collect();
        Tensor::from_parts(result, self.shape.clone())
    }

    /// Sum over rows, producing a `[cols]` vector (bias gradients).
    pub fn sum_rows(&self) -> Tensor {
        let cols = self.cols();
        let mut sums = vec![0.0; cols];
        for row in self.data.chunks(cols.max(1)) {
            for (s, &v) in sums.iter_mut().zip(row) {
                *s += v;
            }
        }
        Tensor::from_parts(sums, vec![cols])
    }

    /// Plain gradient descent step: `self -= lr * grad`.
    pub fn sgd_step(&mut self, grad: &Tensor, lr: f32) -> Result<()> {
        if self.shape != grad.shape {
            return Err(ViolaError::shape(format!(
                "gradient {:?} does not match parameter {:?}",
                grad.shape, self.shape
            )));
        }
        self.data
            .par_iter_mut()
            .zip(&grad.data)
            .for_each(|(p, &g)| *p -= lr * g);
        Ok(())
    }

    /// Index of the largest value in each row.
    pub fn argmax_rows(&self) -> Vec<usize> {
        (0..self.rows())
            .map(|i| {
                let row = self.row(i);
                let mut best = 0;
                for (j, &v) in row.iter().enumerate() {
                    if v > row[best] {
                        best = j;
                    }
                }
                best
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn m(rows: &[Vec<f32>]) -> Tensor {
        Tensor::from_rows(rows).unwrap()
    }

    #[test]
    fn test_new_rejects_wrong_length() {
        assert!(matches!(
            Tensor::new(vec![1.0, 2.0, 3.0], vec![2, 2]),
            Err(ViolaError::ShapeMismatch(_))
        ));
    }

    #[test]
    fn test_from_rows_rejects_ragged() {
        let err = Tensor::from_rows(&[vec![1.0, 2.0], vec![3.0]]).unwrap_err();
        assert!(matches!(err, ViolaError::ShapeMismatch(_)));
    }

    #[test]
    fn test_matmul_small() {
        let a = m(&[vec![1.0, 2.0], vec![3.0, 4.0]]);
        let b = m(&[vec![5.0, 6.0], vec![7.0, 8.0]]);
        let c = a.matmul(&b).unwrap();
        assert_eq!(c.data, vec![19.0, 22.0, 43.0, 50.0]);
    }

    #[test]
    fn test_matmul_incompatible() {
        let a = Tensor::zeros(2, 3);
        let b = Tensor::zeros(2, 3);
        assert!(matches!(a.matmul(&b), Err(ViolaError::ShapeMismatch(_))));
    }

    #[test]
    fn test_blocked_matches_naive() {
        // 20 × 30 @ 30 × 17 exceeds the parallel threshold
        let a_data: Vec<f32> = (0..600).map(|i| ((i * 7) % 13) as f32 - 6.0).collect();
        let b_data: Vec<f32> = (0..510).map(|i| ((i * 5) % 11) as f32 - 5.0).collect();
        let a = Tensor::new(a_data, vec![20, 30]).unwrap();
        let b = Tensor::new(b_data, vec![30, 17]).unwrap();

        let fast = a.matmul(&b).unwrap();
        for i in 0..20 {
            for j in 0..17 {
                let mut expected = 0.0;
                for l in 0..30 {
                    expected += a.data[i * 30 + l] * b.data[l * 17 + j];
                }
                assert!((fast.data[i * 17 + j] - expected).abs() < 1e-3);
            }
        }
    }

    #[test]
    fn test_transpose() {
        let a = m(&[vec![1.0, 2.0, 3.0], vec![4.0, 5.0, 6.0]]);
        let t = a.transpose();
        assert_eq!(t.shape, vec![3, 2]);
        assert_eq!(t.data, vec![1.0, 4.0, 2.0, 5.0, 3.0, 6.0]);
    }

    #[test]
    fn test_bias_broadcast_and_sum_rows() {
        let a = m(&[vec![1.0, 2.0], vec![3.0, 4.0]]);
        let b = Tensor::new(vec![10.0, 20.0], vec![2]).unwrap();
        let c = a.add_row_vector(&b).unwrap();
        assert_eq!(c.data, vec![11.0, 22.0, 13.0, 24.0]);
        assert_eq!(a.sum_rows().data, vec![4.0, 6.0]);
    }

    #[test]
    fn test_sgd_step() {
        let mut p = m(&[vec![1.0, 1.0]]);
        let g = m(&[vec![2.0, -4.0]]);
        p.sgd_step(&g, 0.5).unwrap();
        assert_eq!(p.data, vec![0.0, 3.0]);

        let wrong = Tensor::zeros(2, 2);
        assert!(p.sgd_step(&wrong, 0.1).is_err());
    }

    #[test]
    fn test_argmax_rows() {
        let a = m(&[vec![0.1, 0.7, 0.2], vec![0.5, 0.2, 0.3]]);
        assert_eq!(a.argmax_rows(), vec![1, 0]);
    }
}
