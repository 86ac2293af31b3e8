// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of LayerLens — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

use crate::module::{Module, Parameter};
use crate::{PureResult, Tensor, TensorError};

/// Substituted for a fractional contribution whose pre-activation sum is
/// exactly zero, so relevance never divides by zero.
const STABILIZATION_EPSILON: f64 = 1e-12;

fn validate_positive(value: usize, label: &'static str) -> PureResult<()> {
    if value == 0 {
        return Err(TensorError::InvalidValue { label });
    }
    Ok(())
}

/// Number of sliding-window positions along one axis. The input extent minus
/// the filter extent must be a non-negative exact multiple of the stride;
/// anything else would silently drop trailing rows or columns.
fn output_extent(extent: usize, filter: usize, stride: usize) -> PureResult<usize> {
    if extent < filter || (extent - filter) % stride != 0 {
        return Err(TensorError::InvalidStride {
            extent,
            filter,
            stride,
        });
    }
    Ok((extent - filter) / stride + 1)
}

struct ForwardContext {
    input: Tensor,
    output: Tensor,
}

/// Two-dimensional convolution over batch-major `(N, H, W, D)` activations.
///
/// The filter bank is a `(fh, fw, fd, n)` tensor contracted against every
/// input sub-window over its three trailing axes. Besides the usual
/// forward/backward/update lifecycle the layer implements the LRP z-rule,
/// redistributing each output's relevance onto the inputs of its receptive
/// field in proportion to their share of the pre-activation sum.
pub struct Convolution {
    weight: Parameter,
    bias: Parameter,
    filter: (usize, usize, usize, usize),
    stride: (usize, usize),
    context: Option<ForwardContext>,
    grad_output: Option<Tensor>,
}

impl core::fmt::Debug for Convolution {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(
            f,
            "Convolution(filter={:?},stride={:?},cached={})",
            self.filter,
            self.stride,
            self.context.is_some()
        )
    }
}

impl Convolution {
    /// Builds the layer with a depth-scaled random weight draw and a zero
    /// bias. The weight standard deviation is `1/sqrt(fh * fw * fd)` so the
    /// pre-activation variance stays independent of the filter volume.
    pub fn new(
        name: impl Into<String>,
        filter: (usize, usize, usize, usize),
        stride: (usize, usize),
        seed: Option<u64>,
    ) -> PureResult<Self> {
        let (fh, fw, fd, filters) = filter;
        validate_positive(fh, "filter_height")?;
        validate_positive(fw, "filter_width")?;
        validate_positive(fd, "filter_depth")?;
        validate_positive(filters, "filter_count")?;
        validate_positive(stride.0, "row_stride")?;
        validate_positive(stride.1, "col_stride")?;
        let name = name.into();
        let std = 1.0 / ((fh * fw * fd) as f64).sqrt();
        let weight = Tensor::random_normal([fh, fw, fd, filters], 0.0, std, seed)?;
        let bias = Tensor::zeros([1, 1, 1, filters])?;
        Ok(Self {
            weight: Parameter::new(format!("{name}::weight"), weight),
            bias: Parameter::new(format!("{name}::bias"), bias),
            filter,
            stride,
            context: None,
            grad_output: None,
        })
    }

    /// Returns the `(fh, fw, fd, n)` filter shape.
    pub fn filter(&self) -> (usize, usize, usize, usize) {
        self.filter
    }

    /// Returns the `(row, col)` stride pair.
    pub fn stride(&self) -> (usize, usize) {
        self.stride
    }

    fn output_shape(&self, input: &Tensor) -> PureResult<[usize; 4]> {
        let [batch, height, width, depth] = input.shape();
        let (fh, fw, fd, filters) = self.filter;
        if depth != fd {
            return Err(TensorError::ShapeMismatch {
                left: input.shape(),
                right: [fh, fw, fd, filters],
            });
        }
        let hout = output_extent(height, fh, self.stride.0)?;
        let wout = output_extent(width, fw, self.stride.1)?;
        Ok([batch, hout, wout, filters])
    }

    fn cached(&self) -> PureResult<&ForwardContext> {
        self.context.as_ref().ok_or(TensorError::NoCachedForwardPass {
            layer: "convolution",
        })
    }
}

impl Module for Convolution {
    fn forward(&mut self, input: &Tensor) -> PureResult<Tensor> {
        let out_shape = self.output_shape(input)?;
        let [batch, hout, wout, filters] = out_shape;
        let depth = input.shape()[3];
        let (fh, fw, fd, _) = self.filter;
        let (sh, sw) = self.stride;
        let mut output = Tensor::zeros(out_shape)?;
        let weight_data = self.weight.value().data();
        let bias_data = self.bias.value().data();
        let input_data = input.data();
        {
            let out_data = output.data_mut();
            for b in 0..batch {
                for i in 0..hout {
                    for j in 0..wout {
                        let out_base = ((b * hout + i) * wout + j) * filters;
                        for k in 0..filters {
                            let mut acc = bias_data[k];
                            for u in 0..fh {
                                let in_row = input.offset([b, i * sh + u, j * sw, 0]);
                                for v in 0..fw {
                                    let in_base = in_row + v * depth;
                                    let w_base = (u * fw + v) * fd * filters;
                                    for c in 0..fd {
                                        acc += input_data[in_base + c]
                                            * weight_data[w_base + c * filters + k];
                                    }
                                }
                            }
                            out_data[out_base + k] = acc;
                        }
                    }
                }
            }
        }
        self.context = Some(ForwardContext {
            input: input.clone(),
            output: output.clone(),
        });
        self.grad_output = None;
        Ok(output)
    }

    /// Transpose of the forward contraction: every output gradient is
    /// distributed back across its receptive field scaled by the filter
    /// weights. Overlapping windows accumulate additively, which is exactly
    /// the transpose-convolution semantics when strides are smaller than
    /// the filter.
    fn backward(&mut self, grad_output: &Tensor) -> PureResult<Tensor> {
        let context = self.cached()?;
        if grad_output.shape() != context.output.shape() {
            return Err(TensorError::ShapeMismatch {
                left: grad_output.shape(),
                right: context.output.shape(),
            });
        }
        let [batch, hout, wout, filters] = grad_output.shape();
        let [_, _, _, depth] = context.input.shape();
        let (fh, fw, fd, _) = self.filter;
        let (sh, sw) = self.stride;
        let mut grad_input = Tensor::zeros(context.input.shape())?;
        let weight_data = self.weight.value().data();
        let grad_data = grad_output.data();
        {
            let grad_in = grad_input.data_mut();
            for b in 0..batch {
                for i in 0..hout {
                    for j in 0..wout {
                        let out_base = ((b * hout + i) * wout + j) * filters;
                        for k in 0..filters {
                            let go = grad_data[out_base + k];
                            if go == 0.0 {
                                continue;
                            }
                            for u in 0..fh {
                                let in_row = context.input.offset([b, i * sh + u, j * sw, 0]);
                                for v in 0..fw {
                                    let in_base = in_row + v * depth;
                                    let w_base = (u * fw + v) * fd * filters;
                                    for c in 0..fd {
                                        grad_in[in_base + c] +=
                                            weight_data[w_base + c * filters + k] * go;
                                    }
                                }
                            }
                        }
                    }
                }
            }
        }
        self.grad_output = Some(grad_output.clone());
        Ok(grad_input)
    }

    /// Outer-accumulates each input window against the per-filter gradient
    /// into the weight gradient, sums the bias gradient over batch and
    /// spatial axes, and takes one gradient-descent step.
    fn update(&mut self, learning_rate: f64) -> PureResult<()> {
        if learning_rate <= 0.0 || !learning_rate.is_finite() {
            return Err(TensorError::NonPositiveLearningRate {
                rate: learning_rate,
            });
        }
        let grad_output = self
            .grad_output
            .take()
            .ok_or(TensorError::NoCachedForwardPass {
                layer: "convolution",
            })?;
        let context = self.context.as_ref().ok_or(TensorError::NoCachedForwardPass {
            layer: "convolution",
        })?;
        let [batch, hout, wout, filters] = grad_output.shape();
        let [_, _, _, depth] = context.input.shape();
        let (fh, fw, fd, _) = self.filter;
        let (sh, sw) = self.stride;
        let mut grad_weight = Tensor::zeros(self.weight.value().shape())?;
        let mut grad_bias = Tensor::zeros(self.bias.value().shape())?;
        let input_data = context.input.data();
        let grad_data = grad_output.data();
        {
            let dw = grad_weight.data_mut();
            let db = grad_bias.data_mut();
            for b in 0..batch {
                for i in 0..hout {
                    for j in 0..wout {
                        let out_base = ((b * hout + i) * wout + j) * filters;
                        for k in 0..filters {
                            let go = grad_data[out_base + k];
                            db[k] += go;
                            if go == 0.0 {
                                continue;
                            }
                            for u in 0..fh {
                                let in_row = context.input.offset([b, i * sh + u, j * sw, 0]);
                                for v in 0..fw {
                                    let in_base = in_row + v * depth;
                                    let w_base = (u * fw + v) * fd * filters;
                                    for c in 0..fd {
                                        dw[w_base + c * filters + k] +=
                                            input_data[in_base + c] * go;
                                    }
                                }
                            }
                        }
                    }
                }
            }
        }
        self.weight.accumulate_euclidean(&grad_weight)?;
        self.bias.accumulate_euclidean(&grad_bias)?;
        self.weight.apply_step(learning_rate)?;
        self.bias.apply_step(learning_rate)?;
        Ok(())
    }

    /// LRP z-rule. Per output position the weighted window `Z = W ⊙ x` is
    /// normalized by its pre-activation sum (plus bias), so each input
    /// element receives the share of relevance proportional to its
    /// contribution. A pre-activation sum of exactly zero substitutes the
    /// stabilization epsilon for the fraction instead of dividing.
    fn lrp(&mut self, relevance: &Tensor) -> PureResult<Tensor> {
        let context = self.cached()?;
        if relevance.shape() != context.output.shape() {
            return Err(TensorError::ShapeMismatch {
                left: relevance.shape(),
                right: context.output.shape(),
            });
        }
        let [batch, hout, wout, filters] = relevance.shape();
        let [_, _, _, depth] = context.input.shape();
        let (fh, fw, fd, _) = self.filter;
        let (sh, sw) = self.stride;
        let mut redistributed = Tensor::zeros(context.input.shape())?;
        let weight_data = self.weight.value().data();
        let bias_data = self.bias.value().data();
        let input_data = context.input.data();
        let relevance_data = relevance.data();
        let mut presums = vec![0.0f64; filters];
        {
            let out = redistributed.data_mut();
            for b in 0..batch {
                for i in 0..hout {
                    for j in 0..wout {
                        // First pass: total pre-activation per filter, which
                        // the forward pass produced at this position.
                        for (k, presum) in presums.iter_mut().enumerate() {
                            let mut acc = bias_data[k];
                            for u in 0..fh {
                                let in_row = context.input.offset([b, i * sh + u, j * sw, 0]);
                                for v in 0..fw {
                                    let in_base = in_row + v * depth;
                                    let w_base = (u * fw + v) * fd * filters;
                                    for c in 0..fd {
                                        acc += input_data[in_base + c]
                                            * weight_data[w_base + c * filters + k];
                                    }
                                }
                            }
                            *presum = acc;
                        }
                        // Second pass: fractional contributions times the
                        // incoming relevance, summed over filters.
                        let rel_base = ((b * hout + i) * wout + j) * filters;
                        for u in 0..fh {
                            let in_row = context.input.offset([b, i * sh + u, j * sw, 0]);
                            for v in 0..fw {
                                let in_base = in_row + v * depth;
                                let w_base = (u * fw + v) * fd * filters;
                                for c in 0..fd {
                                    let x = input_data[in_base + c];
                                    let mut share = 0.0;
                                    for k in 0..filters {
                                        let z = weight_data[w_base + c * filters + k] * x;
                                        let fraction = if presums[k] != 0.0 {
                                            z / presums[k]
                                        } else {
                                            STABILIZATION_EPSILON
                                        };
                                        share += fraction * relevance_data[rel_base + k];
                                    }
                                    out[in_base + c] += share;
                                }
                            }
                        }
                    }
                }
            }
        }
        Ok(redistributed)
    }

    fn clean(&mut self) {
        self.context = None;
        self.grad_output = None;
        self.weight.zero_gradient();
        self.bias.zero_gradient();
    }

    fn visit_parameters(
        &self,
        visitor: &mut dyn FnMut(&Parameter) -> PureResult<()>,
    ) -> PureResult<()> {
        visitor(&self.weight)?;
        visitor(&self.bias)?;
        Ok(())
    }

    fn visit_parameters_mut(
        &mut self,
        visitor: &mut dyn FnMut(&mut Parameter) -> PureResult<()>,
    ) -> PureResult<()> {
        visitor(&mut self.weight)?;
        visitor(&mut self.bias)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn load_parameters(layer: &mut Convolution, weight: Tensor, bias: Tensor) {
        let mut state = HashMap::new();
        state.insert("probe::weight".to_string(), weight);
        state.insert("probe::bias".to_string(), bias);
        layer.load_state_dict(&state).unwrap();
    }

    fn unit_window_layer() -> Convolution {
        let mut layer = Convolution::new("probe", (2, 2, 1, 1), (2, 2), Some(7)).unwrap();
        load_parameters(
            &mut layer,
            Tensor::from_vec([2, 2, 1, 1], vec![1.0; 4]).unwrap(),
            Tensor::zeros([1, 1, 1, 1]).unwrap(),
        );
        layer
    }

    fn ramp_input() -> Tensor {
        Tensor::from_fn([1, 4, 4, 1], |[_, h, w, _]| (h * 4 + w) as f64).unwrap()
    }

    fn dot(a: &Tensor, b: &Tensor) -> f64 {
        a.data().iter().zip(b.data().iter()).map(|(x, y)| x * y).sum()
    }

    #[test]
    fn forward_shape_follows_stride_arithmetic() {
        let mut layer = Convolution::new("conv", (3, 3, 3, 4), (1, 1), Some(1)).unwrap();
        let input = Tensor::random_normal([2, 5, 5, 3], 0.0, 1.0, Some(2)).unwrap();
        let output = layer.forward(&input).unwrap();
        assert_eq!(output.shape(), [2, 3, 3, 4]);
    }

    #[test]
    fn forward_sums_each_window_with_unit_weights() {
        let mut layer = unit_window_layer();
        let output = layer.forward(&ramp_input()).unwrap();
        assert_eq!(output.shape(), [1, 2, 2, 1]);
        assert_eq!(output.data(), &[10.0, 18.0, 42.0, 50.0]);
    }

    #[test]
    fn forward_rejects_depth_mismatch() {
        let mut layer = Convolution::new("conv", (2, 2, 2, 1), (1, 1), Some(1)).unwrap();
        let input = Tensor::zeros([1, 4, 4, 1]).unwrap();
        let err = layer.forward(&input).unwrap_err();
        assert!(matches!(err, TensorError::ShapeMismatch { .. }));
    }

    #[test]
    fn forward_rejects_uneven_stride() {
        let mut layer = Convolution::new("conv", (2, 2, 1, 1), (2, 2), Some(1)).unwrap();
        let input = Tensor::zeros([1, 5, 5, 1]).unwrap();
        let err = layer.forward(&input).unwrap_err();
        assert_eq!(
            err,
            TensorError::InvalidStride {
                extent: 5,
                filter: 2,
                stride: 2
            }
        );
    }

    #[test]
    fn backward_requires_a_cached_forward_pass() {
        let mut layer = Convolution::new("conv", (2, 2, 1, 1), (1, 1), Some(1)).unwrap();
        let grad = Tensor::zeros([1, 3, 3, 1]).unwrap();
        let err = layer.backward(&grad).unwrap_err();
        assert_eq!(
            err,
            TensorError::NoCachedForwardPass {
                layer: "convolution"
            }
        );
    }

    #[test]
    fn backward_distributes_gradient_through_unit_filter() {
        let mut layer = unit_window_layer();
        layer.forward(&ramp_input()).unwrap();
        let grad_output = Tensor::from_vec([1, 2, 2, 1], vec![1.0; 4]).unwrap();
        let grad_input = layer.backward(&grad_output).unwrap();
        // Non-overlapping unit windows hand every input exactly one unit.
        assert_eq!(grad_input.shape(), [1, 4, 4, 1]);
        assert!(grad_input.data().iter().all(|&g| g == 1.0));
    }

    #[test]
    fn backward_matches_finite_difference() {
        let mut layer = Convolution::new("conv", (2, 2, 2, 3), (1, 1), Some(11)).unwrap();
        let input = Tensor::random_normal([2, 4, 4, 2], 0.0, 1.0, Some(12)).unwrap();
        let probe = Tensor::random_normal([2, 3, 3, 3], 0.0, 1.0, Some(13)).unwrap();
        layer.forward(&input).unwrap();
        let analytic = layer.backward(&probe).unwrap();

        let eps = 1e-6;
        for index in (0..input.len()).step_by(7) {
            let mut plus = input.clone();
            plus.data_mut()[index] += eps;
            let mut minus = input.clone();
            minus.data_mut()[index] -= eps;
            let loss_plus = dot(&layer.forward(&plus).unwrap(), &probe);
            let loss_minus = dot(&layer.forward(&minus).unwrap(), &probe);
            let numeric = (loss_plus - loss_minus) / (2.0 * eps);
            assert!(
                (numeric - analytic.data()[index]).abs() < 1e-6,
                "input gradient off at {index}: numeric={numeric}, analytic={}",
                analytic.data()[index]
            );
        }
    }

    #[test]
    fn update_matches_finite_difference_for_weights() {
        let mut layer = Convolution::new("conv", (2, 2, 2, 2), (2, 2), Some(21)).unwrap();
        let input = Tensor::random_normal([2, 4, 4, 2], 0.0, 1.0, Some(22)).unwrap();
        let probe = Tensor::random_normal([2, 2, 2, 2], 0.0, 1.0, Some(23)).unwrap();
        let before = layer.state_dict().unwrap();

        layer.forward(&input).unwrap();
        layer.backward(&probe).unwrap();
        layer.update(1.0).unwrap();
        let after = layer.state_dict().unwrap();

        // With lrate = 1 the step equals the analytic gradient exactly.
        let weight_before = &before["conv::weight"];
        let weight_after = &after["conv::weight"];

        let eps = 1e-6;
        for index in (0..weight_before.len()).step_by(3) {
            let analytic = weight_before.data()[index] - weight_after.data()[index];
            let mut probe_layer = Convolution::new("conv", (2, 2, 2, 2), (2, 2), Some(21)).unwrap();

            let mut plus_state = before.clone();
            plus_state.get_mut("conv::weight").unwrap().data_mut()[index] += eps;
            probe_layer.load_state_dict(&plus_state).unwrap();
            let loss_plus = dot(&probe_layer.forward(&input).unwrap(), &probe);

            let mut minus_state = before.clone();
            minus_state.get_mut("conv::weight").unwrap().data_mut()[index] -= eps;
            probe_layer.load_state_dict(&minus_state).unwrap();
            let loss_minus = dot(&probe_layer.forward(&input).unwrap(), &probe);

            let numeric = (loss_plus - loss_minus) / (2.0 * eps);
            assert!(
                (numeric - analytic).abs() < 1e-6,
                "weight gradient off at {index}: numeric={numeric}, analytic={analytic}"
            );
        }
    }

    #[test]
    fn update_applies_bias_gradient_sum() {
        let mut layer = unit_window_layer();
        layer.forward(&ramp_input()).unwrap();
        let grad_output = Tensor::from_vec([1, 2, 2, 1], vec![1.0; 4]).unwrap();
        layer.backward(&grad_output).unwrap();
        layer.update(0.1).unwrap();
        let state = layer.state_dict().unwrap();
        // DB = sum of DY over batch and spatial axes = 4.
        let bias = &state["probe::bias"];
        assert!((bias.data()[0] + 0.4).abs() < 1e-12);
    }

    #[test]
    fn update_rejects_non_positive_learning_rate() {
        let mut layer = unit_window_layer();
        layer.forward(&ramp_input()).unwrap();
        let grad_output = Tensor::from_vec([1, 2, 2, 1], vec![1.0; 4]).unwrap();
        layer.backward(&grad_output).unwrap();
        let err = layer.update(0.0).unwrap_err();
        assert_eq!(err, TensorError::NonPositiveLearningRate { rate: 0.0 });
    }

    #[test]
    fn update_requires_a_backward_pass() {
        let mut layer = unit_window_layer();
        layer.forward(&ramp_input()).unwrap();
        let err = layer.update(0.1).unwrap_err();
        assert!(matches!(err, TensorError::NoCachedForwardPass { .. }));
    }

    #[test]
    fn lrp_requires_a_cached_forward_pass() {
        let mut layer = Convolution::new("conv", (2, 2, 1, 1), (1, 1), Some(1)).unwrap();
        let relevance = Tensor::zeros([1, 3, 3, 1]).unwrap();
        let err = layer.lrp(&relevance).unwrap_err();
        assert!(matches!(err, TensorError::NoCachedForwardPass { .. }));
    }

    #[test]
    fn lrp_conserves_relevance_with_zero_bias() {
        // Overlapping stride, multiple filters, freshly drawn (zero-bias)
        // layer: the z-rule redistributes relevance mass exactly.
        let mut layer = Convolution::new("conv", (3, 3, 2, 4), (1, 1), Some(31)).unwrap();
        let input = Tensor::random_normal([2, 5, 5, 2], 0.0, 1.0, Some(32)).unwrap();
        let output = layer.forward(&input).unwrap();
        let redistributed = layer.lrp(&output).unwrap();
        assert_eq!(redistributed.shape(), input.shape());
        let incoming = output.sum();
        let outgoing = redistributed.sum();
        assert!(
            (incoming - outgoing).abs() < 1e-9 * incoming.abs().max(1.0),
            "relevance not conserved: in={incoming}, out={outgoing}"
        );
    }

    #[test]
    fn lrp_stabilizes_zero_preactivations() {
        let mut layer = unit_window_layer();
        load_parameters(
            &mut layer,
            Tensor::zeros([2, 2, 1, 1]).unwrap(),
            Tensor::zeros([1, 1, 1, 1]).unwrap(),
        );
        layer.forward(&ramp_input()).unwrap();
        let relevance = Tensor::from_vec([1, 2, 2, 1], vec![1.0; 4]).unwrap();
        let redistributed = layer.lrp(&relevance).unwrap();
        // Every fraction collapses to the epsilon, never to NaN.
        assert!(redistributed.data().iter().all(|v| v.is_finite()));
        assert!(redistributed.data().iter().all(|v| v.abs() < 1e-9));
    }

    #[test]
    fn clean_releases_cached_passes() {
        let mut layer = unit_window_layer();
        layer.forward(&ramp_input()).unwrap();
        let grad_output = Tensor::from_vec([1, 2, 2, 1], vec![1.0; 4]).unwrap();
        layer.backward(&grad_output).unwrap();
        layer.clean();
        assert!(matches!(
            layer.backward(&grad_output).unwrap_err(),
            TensorError::NoCachedForwardPass { .. }
        ));
        assert!(matches!(
            layer.update(0.1).unwrap_err(),
            TensorError::NoCachedForwardPass { .. }
        ));
    }
}
