// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of LayerLens — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

pub mod conv;
pub mod rect;
pub mod softmax;

pub use conv::Convolution;
pub use rect::Rect;
pub use softmax::SoftMax;
