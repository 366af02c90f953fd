// Copyright (c) 2020-2024, The rav1e contributors. All rights reserved
//
// This source code is subject to the terms of the BSD 2 Clause License and
// the Alliance for Open Media Patent License 1.0. If the BSD 2 Clause License
// was not distributed with this source code in the LICENSE file, you can
// obtain it at www.aomedia.org/license/software. If the Alliance for Open
// Media Patent License 1.0 was not distributed with this source code in the
// PATENTS file, you can obtain it at www.aomedia.org/license/patent.

use itertools::*;

use crate::api::{Rational, SpeedSettings};
use crate::serialize::{Deserialize, Serialize};

use std::fmt;

/// Deepest lookahead accepted.
pub const MAX_LAG_IN_FRAMES: usize = 25;
/// Most temporal layers a stream may carry.
pub const MAX_TEMPORAL_LAYERS: usize = 5;
/// Longest layer pattern.
pub const MAX_PERIODICITY: usize = 16;

/// Temporal scalability pattern.
///
/// Layer `i` runs at `1 / rate_decimator[i]` of the input framerate and
/// carries `target_bitrate[i]` kbit/s including the layers below it.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TemporalLayers {
  /// Number of layers, 1 disables layering.
  pub number_of_layers: usize,
  /// Cumulative bitrate of each layer, in kbit/s.
  pub target_bitrate: [u32; MAX_TEMPORAL_LAYERS],
  /// Framerate divider of each layer.
  pub rate_decimator: [u32; MAX_TEMPORAL_LAYERS],
  /// Length of the `layer_id` pattern.
  pub periodicity: usize,
  /// Layer of each frame in the pattern.
  pub layer_id: [usize; MAX_PERIODICITY],
}

impl Default for TemporalLayers {
  fn default() -> Self {
    TemporalLayers {
      number_of_layers: 1,
      target_bitrate: [0; MAX_TEMPORAL_LAYERS],
      rate_decimator: [1; MAX_TEMPORAL_LAYERS],
      periodicity: 1,
      layer_id: [0; MAX_PERIODICITY],
    }
  }
}

impl TemporalLayers {
  /// The classic two layer pattern: even frames in the base layer.
  pub fn two_layers(base_kbps: u32, total_kbps: u32) -> Self {
    let mut layers = TemporalLayers {
      number_of_layers: 2,
      periodicity: 2,
      ..Default::default()
    };
    layers.target_bitrate[0] = base_kbps;
    layers.target_bitrate[1] = total_kbps;
    layers.rate_decimator[0] = 2;
    layers.rate_decimator[1] = 1;
    layers.layer_id[1] = 1;
    layers
  }

  /// More than one temporal layer is configured.
  pub const fn is_layered(&self) -> bool {
    self.number_of_layers > 1
  }

  /// Layer of the `counter`-th shown frame.
  pub fn layer_for_frame(&self, counter: u64) -> usize {
    let periodicity = self.periodicity.clamp(1, MAX_PERIODICITY);
    self.layer_id[(counter % periodicity as u64) as usize]
  }
}

/// Encoder settings which impact the produced bitstream.
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct EncoderConfig {
  // output size
  /// Width of the frames in pixels.
  pub width: usize,
  /// Height of the frames in pixels.
  pub height: usize,
  /// Video time base.
  pub time_base: Rational,

  /// Flag to force all frames to be error resilient.
  ///
  /// Disables golden frame boosting and carries no probability updates
  /// from frame to frame.
  pub error_resilient: bool,

  // encoder configuration
  /// Place key frames automatically every `key_freq` frames.
  pub auto_key: bool,
  /// The *maximum* interval between two keyframes
  pub key_freq: u64,
  /// Number of frames held back for lookahead decisions.
  pub lag_in_frames: usize,
  /// Allow hidden alt-ref frames.
  pub play_alternate: bool,
  /// Golden frame interval, 0 selects the default.
  pub alt_freq: u32,
  /// Temporal scalability pattern.
  pub temporal_layers: TemporalLayers,

  /// Settings which affect the enconding speed vs. quality trade-off.
  pub speed_settings: SpeedSettings,
}

/// Default preset for EncoderConfig: it is a balance between quality and
/// speed. See [`with_speed_preset()`].
///
/// [`with_speed_preset()`]: struct.EncoderConfig.html#method.with_speed_preset
impl Default for EncoderConfig {
  fn default() -> Self {
    const DEFAULT_SPEED: usize = 2;
    Self::with_speed_preset(DEFAULT_SPEED)
  }
}

impl EncoderConfig {
  /// This is a preset which provides default settings according to a speed
  /// value in the specific range 0..=16. Speed 0 is the slowest and
  /// produces the best results.
  pub fn with_speed_preset(speed: usize) -> Self {
    EncoderConfig {
      width: 640,
      height: 480,
      time_base: Rational { num: 1, den: 30 },

      error_resilient: false,

      auto_key: true,
      key_freq: 128,
      lag_in_frames: 0,
      play_alternate: false,
      alt_freq: 0,
      temporal_layers: TemporalLayers::default(),

      speed_settings: SpeedSettings::from_preset(speed),
    }
  }

  /// Number of 16x16 macroblocks in a frame.
  pub fn mbs(&self) -> usize {
    ((self.width + 15) >> 4) * ((self.height + 15) >> 4)
  }

  /// Nominal framerate implied by the time base.
  pub fn frame_rate(&self) -> f64 {
    Rational::from_reciprocal(self.time_base).as_f64()
  }
}

impl fmt::Display for EncoderConfig {
  fn fmt(&self, f: &mut fmt::Formatter) -> Result<(), fmt::Error> {
    let layers = &self.temporal_layers;
    let pairs = [
      ("width", self.width.to_string()),
      ("height", self.height.to_string()),
      ("auto_key", self.auto_key.to_string()),
      ("kf_max_dist", self.key_freq.to_string()),
      ("lag_in_frames", self.lag_in_frames.to_string()),
      ("auto_alt_ref", self.play_alternate.to_string()),
      ("error_resilient", self.error_resilient.to_string()),
      ("ts_number_layers", layers.number_of_layers.to_string()),
      (
        "ts_target_bitrate",
        layers.target_bitrate.iter().take(layers.number_of_layers).join(","),
      ),
      ("search_method", self.speed_settings.search_method.to_string()),
      ("recode_loop", self.speed_settings.recode_loop.to_string()),
    ];
    write!(
      f,
      "{}",
      pairs.iter().map(|pair| format!("{}={}", pair.0, pair.1)).join(" ")
    )
  }
}
