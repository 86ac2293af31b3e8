// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of LayerLens — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

//! Dense rank-4 tensor primitives for the LayerLens layer stack.
//!
//! Everything here is safe Rust on top of a flat `Vec<f64>`: activations are
//! batch-major `(N, H, W, D)` volumes, convolution weights are
//! `(fh, fw, fd, n)` filter banks, and biases ride along as `(1, 1, 1, n)`.
//! The module deliberately stays small — the layer crate owns all of the
//! sliding-window arithmetic and only leans on the constructors and the
//! handful of elementwise helpers below.

use core::fmt;
use rand::rngs::StdRng;
use rand::SeedableRng;
use rand_distr::{Distribution, StandardNormal};
use serde::{Deserialize, Serialize};
use std::error::Error;

/// Result alias used throughout the LayerLens crates.
pub type PureResult<T> = Result<T, TensorError>;

/// Errors emitted by tensor utilities and the layers built on top of them.
#[derive(Clone, Debug, PartialEq)]
pub enum TensorError {
    /// A tensor constructor received a shape with a zero-sized axis.
    InvalidDimensions { shape: [usize; 4] },
    /// Data provided to a constructor does not match the tensor shape.
    DataLength { expected: usize, got: usize },
    /// An operator was asked to combine tensors of incompatible shapes.
    ShapeMismatch {
        left: [usize; 4],
        right: [usize; 4],
    },
    /// The input extent minus the filter extent is not a non-negative
    /// multiple of the stride, so the sliding window would truncate.
    InvalidStride {
        extent: usize,
        filter: usize,
        stride: usize,
    },
    /// Generic configuration violation.
    InvalidValue { label: &'static str },
    /// Learning rates must stay strictly positive.
    NonPositiveLearningRate { rate: f64 },
    /// backward/update/lrp was invoked before forward cached a pass.
    NoCachedForwardPass { layer: &'static str },
    /// Attempted to load a parameter that was missing from the state dict.
    MissingParameter { name: String },
    /// Wrapper around I/O failures when persisting or restoring tensors.
    IoError { message: String },
    /// Wrapper around serde failures when (de)serialising tensors.
    SerializationError { message: String },
}

impl fmt::Display for TensorError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TensorError::InvalidDimensions { shape } => {
                write!(
                    f,
                    "invalid tensor dimensions {shape:?}; every axis must be non-zero"
                )
            }
            TensorError::DataLength { expected, got } => {
                write!(f, "data length mismatch: expected {expected}, got {got}")
            }
            TensorError::ShapeMismatch { left, right } => {
                write!(
                    f,
                    "shape mismatch: left={left:?}, right={right:?} cannot be combined"
                )
            }
            TensorError::InvalidStride {
                extent,
                filter,
                stride,
            } => {
                write!(
                    f,
                    "extent {extent} minus filter {filter} is not a non-negative multiple of stride {stride}"
                )
            }
            TensorError::InvalidValue { label } => {
                write!(f, "invalid value for {label}")
            }
            TensorError::NonPositiveLearningRate { rate } => {
                write!(f, "learning rate must be positive, got {rate}")
            }
            TensorError::NoCachedForwardPass { layer } => {
                write!(
                    f,
                    "{layer} has no cached forward pass; call forward before backward/update/lrp"
                )
            }
            TensorError::MissingParameter { name } => {
                write!(f, "parameter {name} missing from state dict")
            }
            TensorError::IoError { message } => write!(f, "io failure: {message}"),
            TensorError::SerializationError { message } => {
                write!(f, "serialization failure: {message}")
            }
        }
    }
}

impl Error for TensorError {}

/// Dense rank-4 tensor stored row-major as `(n, h, w, d)`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Tensor {
    data: Vec<f64>,
    shape: [usize; 4],
}

impl Tensor {
    fn checked(shape: [usize; 4], data: Vec<f64>) -> PureResult<Self> {
        if shape.iter().any(|&axis| axis == 0) {
            return Err(TensorError::InvalidDimensions { shape });
        }
        let expected = shape.iter().product();
        if data.len() != expected {
            return Err(TensorError::DataLength {
                expected,
                got: data.len(),
            });
        }
        Ok(Self { data, shape })
    }

    /// Create a tensor filled with zeros.
    pub fn zeros(shape: [usize; 4]) -> PureResult<Self> {
        if shape.iter().any(|&axis| axis == 0) {
            return Err(TensorError::InvalidDimensions { shape });
        }
        let len = shape.iter().product();
        Ok(Self {
            data: vec![0.0; len],
            shape,
        })
    }

    /// Create a tensor from raw data. The vector must hold exactly
    /// `n * h * w * d` elements.
    pub fn from_vec(shape: [usize; 4], data: Vec<f64>) -> PureResult<Self> {
        Self::checked(shape, data)
    }

    /// Construct a tensor by applying a generator function to each coordinate.
    pub fn from_fn<F>(shape: [usize; 4], mut f: F) -> PureResult<Self>
    where
        F: FnMut([usize; 4]) -> f64,
    {
        if shape.iter().any(|&axis| axis == 0) {
            return Err(TensorError::InvalidDimensions { shape });
        }
        let mut data = Vec::with_capacity(shape.iter().product());
        for n in 0..shape[0] {
            for h in 0..shape[1] {
                for w in 0..shape[2] {
                    for d in 0..shape[3] {
                        data.push(f([n, h, w, d]));
                    }
                }
            }
        }
        Ok(Self { data, shape })
    }

    /// Construct a tensor by sampling a normal distribution with the provided
    /// mean and standard deviation.
    ///
    /// When `seed` is provided the RNG becomes deterministic which keeps
    /// tests reproducible; otherwise entropy from the host is used.
    pub fn random_normal(
        shape: [usize; 4],
        mean: f64,
        std: f64,
        seed: Option<u64>,
    ) -> PureResult<Self> {
        if shape.iter().any(|&axis| axis == 0) {
            return Err(TensorError::InvalidDimensions { shape });
        }
        if std <= 0.0 || !std.is_finite() {
            return Err(TensorError::InvalidValue {
                label: "random_normal_std",
            });
        }
        let mut rng = match seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        let gaussian = StandardNormal;
        let len = shape.iter().product();
        let mut data = Vec::with_capacity(len);
        for _ in 0..len {
            let sample: f64 = gaussian.sample(&mut rng);
            data.push(mean + std * sample);
        }
        Ok(Self { data, shape })
    }

    /// Returns the `(n, h, w, d)` shape of the tensor.
    pub fn shape(&self) -> [usize; 4] {
        self.shape
    }

    /// Total number of elements stored in the tensor.
    #[inline]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// True when the tensor stores no data. Unreachable for constructed
    /// tensors (every axis is validated non-zero) but kept for API hygiene.
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Flat offset of the `(n, h, w, d)` coordinate in the backing vector.
    #[inline]
    pub fn offset(&self, index: [usize; 4]) -> usize {
        debug_assert!(index
            .iter()
            .zip(self.shape.iter())
            .all(|(idx, axis)| idx < axis));
        ((index[0] * self.shape[1] + index[1]) * self.shape[2] + index[2]) * self.shape[3]
            + index[3]
    }

    /// Immutable view of the backing data.
    pub fn data(&self) -> &[f64] {
        &self.data
    }

    /// Mutable view of the backing data.
    pub fn data_mut(&mut self) -> &mut [f64] {
        &mut self.data
    }

    /// Accumulates `factor * other` into `self`.
    pub fn add_scaled(&mut self, other: &Tensor, factor: f64) -> PureResult<()> {
        if self.shape != other.shape {
            return Err(TensorError::ShapeMismatch {
                left: self.shape,
                right: other.shape,
            });
        }
        for (value, increment) in self.data.iter_mut().zip(other.data.iter()) {
            *value += factor * increment;
        }
        Ok(())
    }

    /// Returns a copy of the tensor with every element scaled.
    pub fn scale(&self, factor: f64) -> Tensor {
        let mut scaled = self.clone();
        for value in scaled.data.iter_mut() {
            *value *= factor;
        }
        scaled
    }

    /// Sum of every element.
    pub fn sum(&self) -> f64 {
        self.data.iter().sum()
    }

    /// Squared L2 norm of the tensor.
    pub fn squared_l2_norm(&self) -> f64 {
        self.data.iter().map(|&value| value * value).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zeros_rejects_zero_axis() {
        let err = Tensor::zeros([1, 0, 3, 2]).unwrap_err();
        assert_eq!(
            err,
            TensorError::InvalidDimensions {
                shape: [1, 0, 3, 2]
            }
        );
    }

    #[test]
    fn from_vec_checks_data_length() {
        let err = Tensor::from_vec([1, 2, 2, 1], vec![0.0; 3]).unwrap_err();
        assert_eq!(
            err,
            TensorError::DataLength {
                expected: 4,
                got: 3
            }
        );
    }

    #[test]
    fn from_fn_matches_row_major_offsets() {
        let tensor = Tensor::from_fn([2, 2, 3, 2], |[n, h, w, d]| {
            (n * 1000 + h * 100 + w * 10 + d) as f64
        })
        .unwrap();
        assert_eq!(tensor.data()[tensor.offset([1, 0, 2, 1])], 1021.0);
        assert_eq!(tensor.data()[tensor.offset([0, 1, 0, 0])], 100.0);
        assert_eq!(tensor.len(), 24);
    }

    #[test]
    fn random_normal_is_deterministic_with_seed() {
        let a = Tensor::random_normal([1, 2, 2, 3], 0.0, 0.5, Some(42)).unwrap();
        let b = Tensor::random_normal([1, 2, 2, 3], 0.0, 0.5, Some(42)).unwrap();
        assert_eq!(a, b);
        assert!(a.squared_l2_norm() > 0.0);
    }

    #[test]
    fn random_normal_rejects_degenerate_std() {
        let err = Tensor::random_normal([1, 1, 1, 1], 0.0, 0.0, None).unwrap_err();
        assert_eq!(
            err,
            TensorError::InvalidValue {
                label: "random_normal_std"
            }
        );
    }

    #[test]
    fn add_scaled_accumulates_elementwise() {
        let mut acc = Tensor::from_vec([1, 1, 2, 2], vec![1.0, 2.0, 3.0, 4.0]).unwrap();
        let delta = Tensor::from_vec([1, 1, 2, 2], vec![1.0, 1.0, 1.0, 1.0]).unwrap();
        acc.add_scaled(&delta, -0.5).unwrap();
        assert_eq!(acc.data(), &[0.5, 1.5, 2.5, 3.5]);
    }

    #[test]
    fn add_scaled_rejects_shape_mismatch() {
        let mut acc = Tensor::zeros([1, 1, 2, 2]).unwrap();
        let delta = Tensor::zeros([1, 2, 1, 2]).unwrap();
        let err = acc.add_scaled(&delta, 1.0).unwrap_err();
        assert!(matches!(err, TensorError::ShapeMismatch { .. }));
    }

    #[test]
    fn scale_and_sum_agree() {
        let tensor = Tensor::from_vec([1, 1, 1, 4], vec![1.0, -2.0, 3.0, 0.5]).unwrap();
        let scaled = tensor.scale(2.0);
        assert_eq!(scaled.sum(), 2.0 * tensor.sum());
    }
}
