// Copyright (c) 2020-2024, The rav1e contributors. All rights reserved
//
// This source code is subject to the terms of the BSD 2 Clause License and
// the Alliance for Open Media Patent License 1.0. If the BSD 2 Clause License
// was not distributed with this source code in the LICENSE file, you can
// obtain it at www.aomedia.org/license/software. If the Alliance for Open
// Media Patent License 1.0 was not distributed with this source code in the
// PATENTS file, you can obtain it at www.aomedia.org/license/patent.

use num_derive::*;

use crate::serialize::{Deserialize, Serialize};

use std::fmt;

/// Highest quantizer on the user scale.
pub const MAX_USER_QUANTIZER: u8 = 63;

/// How the bitrate budget is enforced.
#[derive(
  Clone,
  Copy,
  Debug,
  Default,
  PartialEq,
  Eq,
  FromPrimitive,
  Serialize,
  Deserialize,
)]
pub enum EndUsage {
  /// Variable bitrate with a relaxed buffer model.
  #[default]
  LocalFilePlayback,
  /// Constant bitrate, the buffer model is enforced.
  StreamFromServer,
  /// Variable bitrate with a quality floor at `cq_level`.
  ConstrainedQuality,
  /// Every frame is coded at `cq_level`.
  ConstantQuality,
}

impl fmt::Display for EndUsage {
  fn fmt(&self, f: &mut fmt::Formatter) -> Result<(), fmt::Error> {
    write!(
      f,
      "{}",
      match self {
        EndUsage::LocalFilePlayback => "vbr",
        EndUsage::StreamFromServer => "cbr",
        EndUsage::ConstrainedQuality => "cq",
        EndUsage::ConstantQuality => "q",
      }
    )
  }
}

/// Rate control configuration
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateControlConfig {
  /// Buffer model and quality policy.
  pub end_usage: EndUsage,
  /// Target bitrate in kbit/s.
  pub target_bitrate: u32,
  /// Best quantizer allowed, 0..=63.
  pub min_quantizer: u8,
  /// Worst quantizer allowed, 0..=63.
  pub max_quantizer: u8,
  /// Quality level for the constrained and constant quality modes, 0..=63.
  pub cq_level: u8,
  /// Largest cut applied to a frame target when over budget, in percent.
  pub undershoot_pct: u32,
  /// Largest raise applied to a frame target when under budget, in percent.
  pub overshoot_pct: u32,
  /// Initial decoder buffer fullness, in ms.
  pub buf_initial_sz: u32,
  /// Decoder buffer fullness to aim for, in ms.
  pub buf_optimal_sz: u32,
  /// Decoder buffer size, in ms.
  pub buf_sz: u32,
  /// Allows frames to be dropped to keep the buffer from underflowing.
  pub drop_frames: bool,
  /// Buffer fullness, in percent of optimal, below which frames are dropped.
  pub drop_frame_water_mark: u32,
  /// Key frame size cap in percent of the average frame size, 0 disables.
  pub max_intra_bitrate_pct: u32,
  /// Extra bits given to a golden frame in one-pass CBR, in percent.
  pub gf_cbr_boost_pct: u32,
}

impl Default for RateControlConfig {
  fn default() -> Self {
    RateControlConfig {
      end_usage: EndUsage::LocalFilePlayback,
      target_bitrate: 256,
      min_quantizer: 4,
      max_quantizer: MAX_USER_QUANTIZER,
      cq_level: 10,
      undershoot_pct: 100,
      overshoot_pct: 100,
      buf_initial_sz: 4000,
      buf_optimal_sz: 5000,
      buf_sz: 6000,
      drop_frames: false,
      drop_frame_water_mark: 0,
      max_intra_bitrate_pct: 0,
      gf_cbr_boost_pct: 0,
    }
  }
}

impl RateControlConfig {
  /// Create a default rate control configuration
  ///
  /// By default the encoder targets 256 kbit/s in VBR mode.
  pub fn new() -> Self {
    Default::default()
  }

  /// Set the buffer model
  pub const fn with_end_usage(mut self, end_usage: EndUsage) -> Self {
    self.end_usage = end_usage;
    self
  }

  /// Set the target bitrate, in kbit/s
  pub const fn with_target_bitrate(mut self, kbps: u32) -> Self {
    self.target_bitrate = kbps;
    self
  }

  /// Set the quantizer range, on the 0..=63 scale
  pub const fn with_quantizer_range(mut self, min: u8, max: u8) -> Self {
    self.min_quantizer = min;
    self.max_quantizer = max;
    self
  }

  /// Set the quality level used by the quality modes
  pub const fn with_cq_level(mut self, cq_level: u8) -> Self {
    self.cq_level = cq_level;
    self
  }

  /// Set the decoder buffer model, in ms
  pub const fn with_buffer(
    mut self, initial: u32, optimal: u32, size: u32,
  ) -> Self {
    self.buf_initial_sz = initial;
    self.buf_optimal_sz = optimal;
    self.buf_sz = size;
    self
  }

  /// Allow frame dropping below `water_mark` percent of the optimal level
  pub const fn with_drop_frames(mut self, water_mark: u32) -> Self {
    self.drop_frames = true;
    self.drop_frame_water_mark = water_mark;
    self
  }

  /// Set the under and overshoot limits, in percent
  pub const fn with_shoot_pct(mut self, under: u32, over: u32) -> Self {
    self.undershoot_pct = under;
    self.overshoot_pct = over;
    self
  }

  /// Whether the mode drives quantizers from a bitrate.
  pub const fn needs_bitrate(&self) -> bool {
    !matches!(self.end_usage, EndUsage::ConstantQuality)
  }
}
