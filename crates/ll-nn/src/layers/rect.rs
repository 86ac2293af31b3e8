// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of LayerLens — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

use crate::module::Module;
use crate::{PureResult, Tensor, TensorError};

/// Stateless rectification layer, `Y = max(0, X)`.
///
/// The gradient mask comes from the cached output rather than the input, so
/// ties at exactly zero are killed, matching the usual ReLU subgradient
/// convention. Relevance passes through unchanged (the default `lrp`): the
/// layer contributes no redistribution of its own.
#[derive(Debug, Default)]
pub struct Rect {
    output: Option<Tensor>,
}

impl Rect {
    /// Creates a new rectification layer.
    pub fn new() -> Self {
        Self::default()
    }
}

impl Module for Rect {
    fn forward(&mut self, input: &Tensor) -> PureResult<Tensor> {
        let mut output = input.clone();
        for value in output.data_mut() {
            *value = value.max(0.0);
        }
        self.output = Some(output.clone());
        Ok(output)
    }

    fn backward(&mut self, grad_output: &Tensor) -> PureResult<Tensor> {
        let output = self
            .output
            .as_ref()
            .ok_or(TensorError::NoCachedForwardPass { layer: "rect" })?;
        if grad_output.shape() != output.shape() {
            return Err(TensorError::ShapeMismatch {
                left: grad_output.shape(),
                right: output.shape(),
            });
        }
        let mut grad_input = grad_output.clone();
        for (grad, cached) in grad_input.data_mut().iter_mut().zip(output.data().iter()) {
            if *cached == 0.0 {
                *grad = 0.0;
            }
        }
        Ok(grad_input)
    }

    fn clean(&mut self) {
        self.output = None;
    }
}
