// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of LayerLens — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

//! Feed-forward layers with forward/backward/update lifecycles and
//! layer-wise relevance propagation (LRP).
//!
//! Each layer owns its parameters and its per-batch caches; `backward`,
//! `update`, and `lrp` operate on the cached forward pass and report
//! [`TensorError::NoCachedForwardPass`] when invoked out of order. Callers
//! drive layers forward in chain order and propagate gradients or relevance
//! backwards in reverse; `clean` releases the caches between batches.

pub mod io;
pub mod layers;
pub mod module;

pub use io::{load_bincode, load_json, save_bincode, save_json};
pub use layers::{Convolution, Rect, SoftMax};
pub use module::{Module, Parameter};

pub use ll_tensor::{PureResult, Tensor, TensorError};
