// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of LayerLens — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

use crate::module::Module;
use crate::{PureResult, Tensor, TensorError};

/// Stateless normalization layer, `Y = exp(X) / Σ exp(X)` per batch row.
///
/// The exponentials are taken without max-subtraction, so very large logits
/// overflow to infinity; callers are expected to feed moderately scaled
/// activations. The `lrp` rule is the simplified `R ⊙ X` product, which
/// neither renormalizes nor accounts for the softmax coupling across
/// classes.
#[derive(Debug, Default)]
pub struct SoftMax {
    input: Option<Tensor>,
}

impl SoftMax {
    /// Creates a new softmax layer.
    pub fn new() -> Self {
        Self::default()
    }
}

impl Module for SoftMax {
    fn forward(&mut self, input: &Tensor) -> PureResult<Tensor> {
        let [batch, height, width, depth] = input.shape();
        let row = height * width * depth;
        let mut output = input.clone();
        {
            let data = output.data_mut();
            for b in 0..batch {
                let slice = &mut data[b * row..(b + 1) * row];
                let mut sum = 0.0;
                for value in slice.iter_mut() {
                    *value = value.exp();
                    sum += *value;
                }
                for value in slice.iter_mut() {
                    *value /= sum;
                }
            }
        }
        self.input = Some(input.clone());
        Ok(output)
    }

    fn lrp(&mut self, relevance: &Tensor) -> PureResult<Tensor> {
        let input = self
            .input
            .as_ref()
            .ok_or(TensorError::NoCachedForwardPass { layer: "softmax" })?;
        if relevance.shape() != input.shape() {
            return Err(TensorError::ShapeMismatch {
                left: relevance.shape(),
                right: input.shape(),
            });
        }
        let mut redistributed = relevance.clone();
        for (value, x) in redistributed.data_mut().iter_mut().zip(input.data().iter()) {
            *value *= x;
        }
        Ok(redistributed)
    }

    fn clean(&mut self) {
        self.input = None;
    }
}
