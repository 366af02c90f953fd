// Copyright (c) 2019-2024, The rav1e contributors. All rights reserved
//
// This source code is subject to the terms of the BSD 2 Clause License and
// the Alliance for Open Media Patent License 1.0. If the BSD 2 Clause License
// was not distributed with this source code in the LICENSE file, you can
// obtain it at www.aomedia.org/license/software. If the Alliance for Open
// Media Patent License 1.0 was not distributed with this source code in the
// PATENTS file, you can obtain it at www.aomedia.org/license/patent.

use arrayvec::ArrayVec;
use log::{debug, trace};

use crate::api::{
  EncoderConfig, EndUsage, FrameDecision, FrameType, RateControlConfig,
  MAX_TEMPORAL_LAYERS,
};
use crate::framerate::rescale;
use crate::gf::GoldenFrameScheduler;

use std::fmt;
use std::sync::Arc;

/// Highest quantizer index.
pub const MAXQ: u8 = 127;
pub const QINDEX_RANGE: usize = MAXQ as usize + 1;

/// Bits per macroblock are kept scaled by `1 << BPER_MB_NORMBITS`.
pub const BPER_MB_NORMBITS: u32 = 9;

const ZBIN_OQ_MAX: i32 = 192;

const MIN_BPB_FACTOR: f64 = 0.01;
const MAX_BPB_FACTOR: f64 = 50.0;

const KEY_FRAME_CONTEXT: usize = 5;
const PRIOR_KEY_FRAME_WEIGHT: [i64; KEY_FRAME_CONTEXT] = [1, 2, 3, 4, 5];

// Inter frames seen before the quantizer history drives the bounds.
const NI_WARMUP_FRAMES: u32 = 150;

/// Maps the 0..=63 user quantizer scale to quantizer indices.
#[rustfmt::skip]
pub const Q_TRANS: [u8; 64] = [
  0, 1, 2, 3, 4, 5, 7, 8, 9, 10, 12, 13, 15, 17, 18, 19,
  20, 21, 23, 24, 25, 26, 27, 28, 29, 30, 31, 33, 35, 37, 39, 41,
  43, 45, 47, 49, 51, 53, 55, 57, 59, 61, 64, 67, 70, 73, 76, 79,
  82, 85, 88, 91, 94, 97, 100, 103, 106, 109, 112, 115, 118, 121, 124, 127,
];

/// Quantizer index for a quantizer on the user scale.
pub fn q_trans(user_q: u8) -> u8 {
  Q_TRANS[(user_q as usize).min(Q_TRANS.len() - 1)]
}

/// Smallest user scale quantizer mapping to at least `qindex`.
pub fn reverse_q_trans(qindex: u8) -> u8 {
  Q_TRANS.iter().position(|&q| q >= qindex).unwrap_or(Q_TRANS.len() - 1)
    as u8
}

#[rustfmt::skip]
const KF_HIGH_MOTION_MINQ: [u8; 128] = [
  0, 0, 1, 1, 2, 2, 3, 3, 4, 4, 5, 5, 6, 6, 7, 7,
  8, 8, 9, 10, 10, 11, 11, 12, 12, 13, 13, 13, 14, 14, 15, 15,
  16, 16, 17, 17, 18, 18, 19, 19, 20, 20, 21, 21, 21, 22, 22, 23,
  23, 24, 24, 25, 25, 25, 26, 26, 27, 27, 28, 28, 28, 29, 29, 30,
  30, 31, 31, 31, 32, 32, 33, 33, 33, 34, 34, 35, 35, 35, 36, 36,
  37, 37, 37, 38, 38, 39, 39, 39, 40, 40, 40, 41, 41, 42, 42, 42,
  43, 43, 43, 44, 44, 44, 45, 45, 46, 46, 46, 47, 47, 47, 48, 48,
  48, 49, 49, 49, 50, 50, 50, 51, 51, 51, 52, 52, 52, 53, 53, 53,
];

#[rustfmt::skip]
const GF_HIGH_MOTION_MINQ: [u8; 128] = [
  0, 0, 0, 0, 1, 1, 1, 2, 2, 2, 2, 3, 3, 3, 4, 4,
  4, 4, 5, 5, 5, 5, 6, 6, 6, 6, 7, 7, 7, 7, 8, 8,
  8, 8, 9, 9, 9, 9, 10, 10, 10, 10, 11, 11, 11, 11, 12, 12,
  12, 12, 12, 13, 13, 13, 13, 14, 14, 14, 14, 14, 15, 15, 15, 15,
  15, 16, 16, 16, 16, 16, 17, 17, 17, 17, 17, 18, 18, 18, 18, 18,
  19, 19, 19, 19, 19, 19, 20, 20, 20, 20, 20, 20, 21, 21, 21, 21,
  21, 22, 22, 22, 22, 22, 22, 22, 23, 23, 23, 23, 23, 23, 24, 24,
  24, 24, 24, 24, 25, 25, 25, 25, 25, 25, 25, 26, 26, 26, 26, 26,
];

#[rustfmt::skip]
const INTER_MINQ: [u8; 128] = [
  0, 0, 1, 2, 3, 4, 5, 6, 7, 8, 8, 9, 10, 11, 12, 13,
  14, 14, 15, 16, 17, 18, 19, 20, 20, 21, 22, 23, 24, 25, 26, 26,
  27, 28, 29, 30, 31, 31, 32, 33, 34, 35, 36, 36, 37, 38, 39, 40,
  40, 41, 42, 43, 44, 44, 45, 46, 47, 48, 48, 49, 50, 51, 52, 52,
  53, 54, 55, 56, 56, 57, 58, 59, 59, 60, 61, 62, 63, 63, 64, 65,
  66, 66, 67, 68, 69, 70, 70, 71, 72, 73, 73, 74, 75, 76, 76, 77,
  78, 79, 79, 80, 81, 82, 82, 83, 84, 85, 85, 86, 87, 88, 88, 89,
  90, 91, 91, 92, 93, 94, 94, 95, 96, 97, 97, 98, 99, 100, 100, 101,
];

#[rustfmt::skip]
const KF_BOOST_QADJUSTMENT: [i32; 128] = [
  128, 129, 130, 131, 132, 133, 134, 135, 136, 137, 138, 139,
  140, 141, 142, 143, 144, 145, 146, 147, 148, 149, 150, 151,
  152, 153, 154, 155, 156, 157, 158, 159, 160, 161, 162, 163,
  164, 165, 166, 167, 168, 169, 170, 171, 172, 173, 174, 175,
  176, 177, 178, 179, 180, 181, 182, 183, 184, 185, 186, 187,
  188, 189, 190, 191, 192, 193, 194, 195, 196, 197, 198, 199,
  200, 200, 201, 201, 202, 203, 203, 203, 204, 204, 205, 205,
  206, 206, 207, 207, 208, 208, 209, 209, 210, 210, 211, 211,
  212, 212, 213, 213, 214, 214, 215, 215, 216, 216, 217, 217,
  218, 218, 219, 219, 220, 220, 220, 220, 220, 220, 220, 220,
  220, 220, 220, 220, 220, 220, 220, 220,
];

/// Size model of the quantizer collaborator.
///
/// Returns the expected bits per macroblock at `qindex`, scaled by
/// `1 << BPER_MB_NORMBITS`. Must not increase with `qindex`.
pub trait BitsPerMb: Send + Sync {
  fn bits_per_mb(&self, frame_type: FrameType, qindex: u8) -> i32;
}

/// Hyperbolic fallback model, used until a coder supplies its own.
#[derive(Clone, Copy, Debug, Default)]
pub struct DefaultBitsPerMb;

impl BitsPerMb for DefaultBitsPerMb {
  fn bits_per_mb(&self, frame_type: FrameType, qindex: u8) -> i32 {
    match frame_type {
      FrameType::KEY => 4_500_000 / (qindex as i32 + 4),
      FrameType::INTER => 2_850_000 / (qindex as i32 + 4),
    }
  }
}

/// Frame size predicted by `model` at `qindex`, in bits.
pub fn estimate_bits_at_q(
  model: &dyn BitsPerMb, frame_type: FrameType, qindex: u8, mbs: usize,
  correction_factor: f64,
) -> i64 {
  let bpm = (0.5
    + correction_factor * model.bits_per_mb(frame_type, qindex) as f64)
    as i64;
  let mbs = mbs as i64;
  // Keep the product within 31 bits for large frames.
  if mbs > (1 << 11) {
    (bpm >> BPER_MB_NORMBITS) * mbs
  } else {
    (bpm * mbs) >> BPER_MB_NORMBITS
  }
}

fn zbin_adjusted(mut size: f64, zbin_over_quant: i32) -> f64 {
  let mut factor = 0.99;
  for _ in 0..zbin_over_quant {
    size = (factor * size).trunc();
    factor = (factor + 0.01 / 256.0).min(0.999);
  }
  size
}

#[inline]
const fn round_power_of_two(value: i64, n: u32) -> i64 {
  (value + (1 << (n - 1))) >> n
}

/// Which correction factor a frame is steered with.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RateCategory {
  Key,
  Golden,
  Inter,
}

/// Rate control state that is kept once per temporal layer.
#[derive(Clone, Debug, Default)]
pub struct LayerContext {
  // Layer bitrate including the layers below, in bits per second.
  pub target_bandwidth: i64,
  pub framerate: f64,
  // Bits per frame this layer adds on top of the layer below.
  pub avg_frame_size_for_layer: i64,
  // Decoder buffer model, in bits.
  pub starting_buffer_level: i64,
  pub optimal_buffer_level: i64,
  pub maximum_buffer_size: i64,
  pub buffer_level: i64,
  pub bits_off_target: i64,
  pub total_actual_bits: i64,
  pub total_target_vs_actual: i64,
  pub total_byte_count: i64,
  pub worst_quality: u8,
  pub best_quality: u8,
  pub active_worst_quality: u8,
  pub active_best_quality: u8,
  // Average quantizer of ordinary inter frames.
  pub ni_av_qi: i32,
  pub ni_tot_qi: i64,
  pub ni_frames: u32,
  // Running average of every inter frame quantizer.
  pub avg_frame_qindex: i32,
  pub rate_correction_factor: f64,
  pub key_frame_rate_correction_factor: f64,
  pub gf_rate_correction_factor: f64,
  pub zbin_over_quant: i32,
  // Target of the last frame that was not an alt-ref frame.
  pub inter_frame_target: i64,
  pub last_q: [u8; 2],
}

impl LayerContext {
  fn new(
    target_bandwidth: i64, framerate: f64, rc: &RateControlConfig,
    buffer_ms: (i64, i64, i64),
  ) -> Self {
    let (initial, optimal, size) = buffer_ms;
    let starting_buffer_level = rescale(initial, target_bandwidth, 1000);
    let optimal_buffer_level = if optimal == 0 {
      target_bandwidth / 8
    } else {
      rescale(optimal, target_bandwidth, 1000)
    };
    let maximum_buffer_size = if size == 0 {
      target_bandwidth / 8
    } else {
      rescale(size, target_bandwidth, 1000)
    };
    let worst_quality = q_trans(rc.max_quantizer);
    let best_quality = q_trans(rc.min_quantizer);
    LayerContext {
      target_bandwidth,
      framerate,
      avg_frame_size_for_layer: 0,
      starting_buffer_level,
      optimal_buffer_level,
      maximum_buffer_size,
      buffer_level: starting_buffer_level,
      bits_off_target: starting_buffer_level,
      total_actual_bits: 0,
      total_target_vs_actual: 0,
      total_byte_count: 0,
      worst_quality,
      best_quality,
      active_worst_quality: worst_quality,
      active_best_quality: best_quality,
      ni_av_qi: worst_quality as i32,
      ni_tot_qi: 0,
      ni_frames: 0,
      avg_frame_qindex: worst_quality as i32,
      rate_correction_factor: 1.0,
      key_frame_rate_correction_factor: 1.0,
      gf_rate_correction_factor: 1.0,
      zbin_over_quant: 0,
      inter_frame_target: 0,
      last_q: [worst_quality; 2],
    }
  }

  fn refill(&mut self, bits: i64) {
    self.bits_off_target =
      (self.bits_off_target + bits).min(self.maximum_buffer_size);
    self.buffer_level = self.bits_off_target;
  }

  fn correction_factor(&self, category: RateCategory) -> f64 {
    match category {
      RateCategory::Key => self.key_frame_rate_correction_factor,
      RateCategory::Golden => self.gf_rate_correction_factor,
      RateCategory::Inter => self.rate_correction_factor,
    }
  }

  fn correction_factor_mut(&mut self, category: RateCategory) -> &mut f64 {
    match category {
      RateCategory::Key => &mut self.key_frame_rate_correction_factor,
      RateCategory::Golden => &mut self.gf_rate_correction_factor,
      RateCategory::Inter => &mut self.rate_correction_factor,
    }
  }
}

/// One-pass VP8 rate control.
///
/// The state of the active temporal layer lives in `lc`; with several layers
/// it is swapped in and out of `layers` around every frame.
#[derive(Clone)]
pub struct RCState {
  pub lc: LayerContext,
  layers: ArrayVec<LayerContext, MAX_TEMPORAL_LAYERS>,
  pub current_layer: usize,
  number_of_layers: usize,
  // Cumulative layer bitrates, in kbit/s.
  layer_bitrates: [u32; MAX_TEMPORAL_LAYERS],
  rate_decimator: [u32; MAX_TEMPORAL_LAYERS],
  model: Arc<dyn BitsPerMb>,
  mbs: usize,
  end_usage: EndUsage,
  // Pinned quantizers of the constant quality mode.
  fixed_q: Option<u8>,
  cq_target_quality: u8,
  under_shoot_pct: i64,
  over_shoot_pct: i64,
  max_intra_bitrate_pct: i64,
  drop_frames_allowed: bool,
  drop_frame_water_mark: i64,
  buffered_mode: bool,
  auto_worst_q: bool,
  auto_key: bool,
  key_freq: u64,
  pub output_framerate: f64,
  pub per_frame_bandwidth: i64,
  pub av_per_frame_bandwidth: i64,
  pub this_frame_target: i64,
  pub projected_frame_size: i64,
  pub current_video_frame: u64,
  pub frames_since_key: u32,
  pub key_frame_count: u32,
  prior_key_frame_distance: [i64; KEY_FRAME_CONTEXT],
  // Key frame bits still to be recovered from inter frames.
  pub kf_overspend_bits: i64,
  pub kf_bitrate_adjustment: i64,
  pub decimation_factor: u32,
  pub decimation_count: u32,
  pub rolling_target_bits: i64,
  pub rolling_actual_bits: i64,
  pub long_rolling_target_bits: i64,
  pub long_rolling_actual_bits: i64,
}

impl fmt::Debug for RCState {
  fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
    f.debug_struct("RCState")
      .field("current_layer", &self.current_layer)
      .field("buffer_level", &self.lc.buffer_level)
      .field("per_frame_bandwidth", &self.per_frame_bandwidth)
      .field("this_frame_target", &self.this_frame_target)
      .field("active_best_quality", &self.lc.active_best_quality)
      .field("active_worst_quality", &self.lc.active_worst_quality)
      .finish()
  }
}

impl RCState {
  pub fn new(
    enc: &EncoderConfig, rc: &RateControlConfig, model: Arc<dyn BitsPerMb>,
  ) -> Self {
    let framerate = enc.frame_rate();
    let layers_cfg = &enc.temporal_layers;
    let number_of_layers = layers_cfg.number_of_layers.max(1);
    let buffer_ms = if rc.end_usage == EndUsage::LocalFilePlayback {
      (60000, 60000, 240000)
    } else {
      (
        rc.buf_initial_sz as i64,
        rc.buf_optimal_sz as i64,
        rc.buf_sz as i64,
      )
    };
    let target_bandwidth = rc.target_bitrate as i64 * 1000;
    let lc = LayerContext::new(target_bandwidth, framerate, rc, buffer_ms);

    let mut layers = ArrayVec::new();
    if number_of_layers > 1 {
      for layer in 0..number_of_layers {
        let bandwidth = layers_cfg.target_bitrate[layer] as i64 * 1000;
        let decimator = layers_cfg.rate_decimator[layer].max(1) as f64;
        layers.push(LayerContext::new(
          bandwidth,
          framerate / decimator,
          rc,
          buffer_ms,
        ));
      }
    }

    let fixed_q = (rc.end_usage == EndUsage::ConstantQuality)
      .then(|| q_trans(rc.cq_level));
    let buffered_mode = lc.optimal_buffer_level > 0;

    let mut state = RCState {
      lc,
      layers,
      current_layer: 0,
      number_of_layers,
      layer_bitrates: layers_cfg.target_bitrate,
      rate_decimator: layers_cfg.rate_decimator,
      model,
      mbs: enc.mbs().max(1),
      end_usage: rc.end_usage,
      fixed_q,
      cq_target_quality: q_trans(rc.cq_level),
      under_shoot_pct: rc.undershoot_pct as i64,
      over_shoot_pct: rc.overshoot_pct as i64,
      max_intra_bitrate_pct: rc.max_intra_bitrate_pct as i64,
      drop_frames_allowed: rc.drop_frames && buffered_mode,
      drop_frame_water_mark: rc.drop_frame_water_mark as i64,
      buffered_mode,
      auto_worst_q: true,
      auto_key: enc.auto_key,
      key_freq: enc.key_freq.max(1),
      output_framerate: framerate,
      per_frame_bandwidth: 0,
      av_per_frame_bandwidth: 0,
      this_frame_target: 0,
      projected_frame_size: 0,
      current_video_frame: 0,
      frames_since_key: 0,
      key_frame_count: 0,
      prior_key_frame_distance: [0; KEY_FRAME_CONTEXT],
      kf_overspend_bits: 0,
      kf_bitrate_adjustment: 0,
      decimation_factor: 0,
      decimation_count: 0,
      rolling_target_bits: 0,
      rolling_actual_bits: 0,
      long_rolling_target_bits: 0,
      long_rolling_actual_bits: 0,
    };
    state.set_layer_framerates(framerate);
    state.new_framerate(framerate);
    if state.is_layered() {
      state.restore_layer_context(0);
    }
    state.rolling_target_bits = state.av_per_frame_bandwidth;
    state.rolling_actual_bits = state.av_per_frame_bandwidth;
    state.long_rolling_target_bits = state.av_per_frame_bandwidth;
    state.long_rolling_actual_bits = state.av_per_frame_bandwidth;
    state
  }

  /// Replaces the size model of the quantizer collaborator.
  pub fn set_bits_per_mb(&mut self, model: Arc<dyn BitsPerMb>) {
    self.model = model;
  }

  pub fn bits_per_mb(&self) -> &dyn BitsPerMb {
    self.model.as_ref()
  }

  pub const fn mbs(&self) -> usize {
    self.mbs
  }

  pub const fn is_layered(&self) -> bool {
    self.number_of_layers > 1
  }

  pub const fn fixed_q(&self) -> Option<u8> {
    self.fixed_q
  }

  pub const fn end_usage(&self) -> EndUsage {
    self.end_usage
  }

  /// Frame rate dependent budgets of the active layer.
  pub fn new_framerate(&mut self, framerate: f64) {
    let framerate = crate::framerate::sanitize_framerate(framerate);
    self.output_framerate = framerate;
    self.per_frame_bandwidth =
      (self.lc.target_bandwidth as f64 / framerate).round() as i64;
    self.av_per_frame_bandwidth = self.per_frame_bandwidth;
  }

  /// Derives every layer's frame rate from the stream frame rate.
  pub fn set_layer_framerates(&mut self, ref_framerate: f64) {
    let mut prev_layer_framerate = 0.0;
    for (layer, lc) in self.layers.iter_mut().enumerate() {
      lc.framerate = ref_framerate / self.rate_decimator[layer].max(1) as f64;
      if layer > 0 {
        let bitrate_diff = (self.layer_bitrates[layer] as i64
          - self.layer_bitrates[layer - 1] as i64)
          * 1000;
        lc.avg_frame_size_for_layer = (bitrate_diff as f64
          / (lc.framerate - prev_layer_framerate))
          .round() as i64;
      }
      prev_layer_framerate = lc.framerate;
    }
  }

  pub fn layer_framerate(&self, layer: usize) -> Option<f64> {
    self.layers.get(layer).map(|lc| lc.framerate)
  }

  /// Makes `layer` the active layer.
  pub fn restore_layer_context(&mut self, layer: usize) {
    if let Some(lc) = self.layers.get(layer) {
      self.lc = lc.clone();
      self.current_layer = layer;
      let framerate = self.lc.framerate;
      self.new_framerate(framerate);
    }
  }

  /// Writes the active layer back.
  pub fn save_layer_context(&mut self) {
    if let Some(lc) = self.layers.get_mut(self.current_layer) {
      *lc = self.lc.clone();
    }
  }

  /// Saved state of `layer`, or the active state for a single layer.
  pub fn layer(&self, layer: usize) -> &LayerContext {
    if layer == self.current_layer || self.layers.is_empty() {
      &self.lc
    } else {
      &self.layers[layer]
    }
  }

  pub fn is_key_frame_due(&self, forced: bool) -> bool {
    self.current_video_frame == 0
      || forced
      || (self.auto_key
        && self.frames_since_key as u64 % self.key_freq == 0)
  }

  pub fn category(
    &self, frame_type: FrameType, fd: &FrameDecision, noboost: bool,
  ) -> RateCategory {
    if frame_type == FrameType::KEY {
      RateCategory::Key
    } else if !self.is_layered()
      && !noboost
      && (fd.refresh.alt_ref || fd.updates_golden())
    {
      RateCategory::Golden
    } else {
      RateCategory::Inter
    }
  }

  fn propagate_to_higher_layers(&mut self, bits: impl Fn(&LayerContext) -> i64) {
    for lc in self.layers.iter_mut().skip(self.current_layer + 1) {
      let bits = bits(lc);
      lc.refill(bits);
    }
  }

  /// Accounts for a frame that is skipped: its share of the bandwidth goes
  /// to the buffer.
  pub fn frame_dropped(&mut self) {
    let bits = self.av_per_frame_bandwidth;
    self.lc.refill(bits);
    self.propagate_to_higher_layers(|lc| {
      (lc.target_bandwidth as f64 / lc.framerate) as i64
    });
    self.current_video_frame += 1;
    self.frames_since_key += 1;
  }

  /// Regular frame rate decimation driven by the buffer level. Scales the
  /// per frame budget and returns `true` when the frame must be dropped.
  pub fn decimate(&mut self, frame_type: FrameType) -> bool {
    if !self.drop_frames_allowed {
      self.decimation_count = 0;
      return false;
    }

    let drop_mark =
      self.drop_frame_water_mark * self.lc.optimal_buffer_level / 100;
    let drop_mark75 = drop_mark * 2 / 3;
    let drop_mark50 = drop_mark / 4;
    let drop_mark25 = drop_mark / 8;
    let buffer_level = self.lc.buffer_level;

    if buffer_level > drop_mark && self.decimation_factor > 0 {
      self.decimation_factor -= 1;
    }
    if buffer_level > drop_mark75 && self.decimation_factor > 0 {
      self.decimation_factor = 1;
    } else if buffer_level < drop_mark25
      && matches!(self.decimation_factor, 2 | 3)
    {
      self.decimation_factor = 3;
    } else if buffer_level < drop_mark50
      && matches!(self.decimation_factor, 1 | 2)
    {
      self.decimation_factor = 2;
    } else if buffer_level < drop_mark75
      && matches!(self.decimation_factor, 0 | 1)
    {
      self.decimation_factor = 1;
    }

    if self.decimation_factor == 0 {
      self.decimation_count = 0;
      return false;
    }

    self.per_frame_bandwidth = match self.decimation_factor {
      1 => self.per_frame_bandwidth * 3 / 2,
      _ => self.per_frame_bandwidth * 5 / 4,
    };

    if frame_type == FrameType::KEY {
      self.decimation_count = self.decimation_factor;
      false
    } else if self.decimation_count > 0 {
      self.decimation_count -= 1;
      debug!(
        "decimation drop: buffer {} factor {}",
        buffer_level, self.decimation_factor
      );
      true
    } else {
      self.decimation_count = self.decimation_factor;
      false
    }
  }

  /// Sets the frame target and active worst quality. Returns `false` when
  /// the buffer is in crisis and the frame must be dropped.
  pub fn pick_frame_size(
    &mut self, fd: &mut FrameDecision, gf: &mut GoldenFrameScheduler,
    zero_mv_count: u32,
  ) -> bool {
    let keep = if fd.frame_type == FrameType::KEY {
      self.calc_iframe_target_size(fd.forced_key);
      true
    } else {
      self.calc_pframe_target_size(fd, gf, zero_mv_count)
    };
    fd.target_bits = self.this_frame_target;
    debug!(
      "frame {} {}: target {} bits, buffer {}",
      self.current_video_frame,
      fd.frame_type,
      self.this_frame_target,
      self.lc.buffer_level
    );
    keep
  }

  fn calc_iframe_target_size(&mut self, forced: bool) {
    let target = if let Some(key_q) = self.fixed_q {
      estimate_bits_at_q(
        self.model.as_ref(),
        FrameType::KEY,
        key_q,
        self.mbs,
        self.lc.key_frame_rate_correction_factor,
      )
    } else if self.current_video_frame == 0 {
      (self.lc.starting_buffer_level / 2)
        .min(self.lc.target_bandwidth * 3 / 2)
    } else {
      let q = if forced { self.lc.avg_frame_qindex } else { self.lc.ni_av_qi };
      let q = q.clamp(0, MAXQ as i32) as usize;
      let initial_boost = 32;
      let mut kf_boost = if self.is_layered() {
        initial_boost
      } else {
        initial_boost.max((2.0 * self.output_framerate - 16.0) as i64)
      };
      kf_boost = kf_boost * KF_BOOST_QADJUSTMENT[q] as i64 / 100;
      let half_second = self.output_framerate / 2.0;
      if (self.frames_since_key as f64) < half_second {
        kf_boost =
          (kf_boost as f64 * self.frames_since_key as f64 / half_second) as i64;
      }
      kf_boost = kf_boost.max(16);
      (((16 + kf_boost) * self.per_frame_bandwidth) >> 4).min(i32::MAX as i64)
    };

    self.this_frame_target = if self.max_intra_bitrate_pct > 0 {
      let max_rate = (self.per_frame_bandwidth * self.max_intra_bitrate_pct
        / 100)
        .min(i32::MAX as i64);
      target.min(max_rate)
    } else {
      target
    };
    self.lc.active_worst_quality = self.lc.worst_quality;
  }

  fn calc_pframe_target_size(
    &mut self, fd: &mut FrameDecision, gf: &mut GoldenFrameScheduler,
    zero_mv_count: u32,
  ) -> bool {
    let old_per_frame_bandwidth = self.per_frame_bandwidth;
    if self.current_layer > 0 {
      self.per_frame_bandwidth = self.lc.avg_frame_size_for_layer;
    }
    let min_frame_target = (self.per_frame_bandwidth / 4).max(0);

    if !(fd.refresh.alt_ref && !self.is_layered()) {
      let mut target = if self.kf_overspend_bits > 0 {
        let adjustment = self
          .kf_bitrate_adjustment
          .min(self.kf_overspend_bits)
          .min(self.per_frame_bandwidth - min_frame_target);
        self.kf_overspend_bits -= adjustment;
        (self.per_frame_bandwidth - adjustment).max(min_frame_target)
      } else {
        self.per_frame_bandwidth
      };
      target = gf.recover_overspend(target, min_frame_target);
      target = gf.pulse(target, min_frame_target);
      self.this_frame_target = target;
    }

    self.this_frame_target = self.this_frame_target.max(min_frame_target);
    if !fd.refresh.alt_ref {
      self.lc.inter_frame_target = self.this_frame_target;
    }

    if self.buffered_mode {
      self.shape_target_to_buffer();
    } else {
      self.lc.active_worst_quality = self.lc.worst_quality;
    }
    if self.end_usage == EndUsage::ConstrainedQuality
      && self.lc.active_worst_quality < self.cq_target_quality
    {
      self.lc.active_worst_quality = self.cq_target_quality;
    }

    let mut drop_frame = false;
    if self.drop_frames_allowed
      && self.lc.optimal_buffer_level > 0
      && self.lc.buffer_level < 0
    {
      debug!("buffer underrun {}, dropping", self.lc.buffer_level);
      drop_frame = true;
    }

    if !gf.is_error_resilient()
      && gf.frames_till_gf_update_due == 0
      && !drop_frame
    {
      if !gf.gf_update_onepass_cbr {
        let q = self.fixed_q.unwrap_or(self.lc.last_q[FrameType::INTER.index()]);
        if gf.golden_due(q) {
          fd.refresh.golden = true;
          if !gf.source_alt_ref_active {
            self.this_frame_target = if let Some(fixed_q) = self.fixed_q {
              estimate_bits_at_q(
                self.model.as_ref(),
                FrameType::INTER,
                fixed_q,
                self.mbs,
                1.0,
              ) * gf.last_boost as i64
                / 100
            } else {
              self.golden_target(gf)
            };
          } else {
            // The alt-ref frame already carries the quality.
            self.this_frame_target = 0;
          }
          gf.current_gf_interval = gf.frames_till_gf_update_due;
        }
      } else {
        let (refresh, target) =
          gf.onepass_cbr_golden(zero_mv_count, self.this_frame_target);
        fd.refresh.golden |= refresh;
        self.this_frame_target = target;
      }
    }

    self.per_frame_bandwidth = old_per_frame_bandwidth;
    !drop_frame
  }

  fn golden_target(&self, gf: &GoldenFrameScheduler) -> i64 {
    let mut boost = gf.last_boost as i64;
    let frames_in_section = gf.frames_till_gf_update_due as i64 + 1;
    let mut allocation_chunks = frames_in_section * 100 + (boost - 100);
    let bits_in_section = self.lc.inter_frame_target * frames_in_section;
    while boost > 1000 {
      boost /= 2;
      allocation_chunks /= 2;
    }
    let allocation_chunks = allocation_chunks.max(1);
    if (bits_in_section >> 7) > allocation_chunks {
      boost * (bits_in_section / allocation_chunks)
    } else {
      boost * bits_in_section / allocation_chunks
    }
  }

  fn shape_target_to_buffer(&mut self) {
    let lc = &mut self.lc;
    let one_percent_bits = 1 + lc.optimal_buffer_level / 100;
    let cbr = self.end_usage == EndUsage::StreamFromServer;
    let warmed_up = self.auto_worst_q && lc.ni_frames > NI_WARMUP_FRAMES;

    if lc.buffer_level < lc.optimal_buffer_level
      || lc.bits_off_target < lc.optimal_buffer_level
    {
      let mut percent_low = if cbr && lc.buffer_level < lc.optimal_buffer_level
      {
        (lc.optimal_buffer_level - lc.buffer_level) / one_percent_bits
      } else if lc.bits_off_target < 0 && lc.total_byte_count > 0 {
        100 * -lc.bits_off_target / (lc.total_byte_count * 8)
      } else {
        0
      };
      percent_low = percent_low.clamp(0, self.under_shoot_pct);
      self.this_frame_target -= self.this_frame_target * percent_low / 200;

      lc.active_worst_quality = if warmed_up {
        let critical_buffer_level = if cbr {
          lc.buffer_level.min(lc.bits_off_target)
        } else {
          lc.bits_off_target
        };
        if critical_buffer_level < lc.optimal_buffer_level {
          let quarter = lc.optimal_buffer_level >> 2;
          if critical_buffer_level > quarter {
            let qadjustment_range =
              lc.worst_quality as i64 - lc.ni_av_qi as i64;
            let above_base = critical_buffer_level - quarter;
            let range = (lc.optimal_buffer_level * 3 >> 2).max(1);
            (lc.worst_quality as i64 - qadjustment_range * above_base / range)
              .clamp(0, MAXQ as i64) as u8
          } else {
            lc.worst_quality
          }
        } else {
          lc.ni_av_qi.clamp(0, MAXQ as i32) as u8
        }
      } else {
        lc.worst_quality
      };
    } else {
      let mut percent_high =
        if cbr && lc.buffer_level > lc.optimal_buffer_level {
          (lc.buffer_level - lc.optimal_buffer_level) / one_percent_bits
        } else if lc.bits_off_target > lc.optimal_buffer_level {
          if lc.total_byte_count > 0 {
            100 * lc.bits_off_target / (lc.total_byte_count * 8)
          } else {
            self.over_shoot_pct
          }
        } else {
          0
        };
      percent_high = percent_high.clamp(0, self.over_shoot_pct);
      self.this_frame_target = (self.this_frame_target
        + self.this_frame_target * percent_high / 200)
        .min(i32::MAX as i64);

      lc.active_worst_quality = if warmed_up {
        lc.ni_av_qi.clamp(0, MAXQ as i32) as u8
      } else {
        lc.worst_quality
      };
    }

    lc.active_best_quality = lc.best_quality;
    if lc.active_worst_quality <= lc.active_best_quality {
      lc.active_worst_quality = (lc.active_best_quality + 1).min(MAXQ);
    }
  }

  /// Narrows the quantizer range from the history of the stream.
  pub fn select_active_quality(&mut self, fd: &FrameDecision) {
    let cq = self.end_usage == EndUsage::ConstrainedQuality;
    let golden_or_alt = fd.is_golden_or_alt_ref();
    let lc = &mut self.lc;

    if lc.ni_frames > NI_WARMUP_FRAMES {
      let mut q = lc.active_worst_quality as usize;
      if fd.frame_type == FrameType::KEY {
        lc.active_best_quality = KF_HIGH_MOTION_MINQ[q];
      } else if self.number_of_layers == 1 && golden_or_alt {
        if self.frames_since_key > 1
          && lc.avg_frame_qindex < lc.active_worst_quality as i32
        {
          q = lc.avg_frame_qindex.clamp(0, MAXQ as i32) as usize;
        }
        if cq && q < self.cq_target_quality as usize {
          q = self.cq_target_quality as usize;
        }
        lc.active_best_quality = GF_HIGH_MOTION_MINQ[q];
      } else {
        lc.active_best_quality = INTER_MINQ[q];
        if cq && lc.active_best_quality < self.cq_target_quality {
          lc.active_best_quality = self.cq_target_quality;
        }
      }

      if self.end_usage == EndUsage::StreamFromServer {
        if lc.buffer_level >= lc.maximum_buffer_size {
          lc.active_best_quality = lc.best_quality;
        } else if lc.buffer_level > lc.optimal_buffer_level {
          let fraction = (lc.buffer_level - lc.optimal_buffer_level) * 128
            / (lc.maximum_buffer_size - lc.optimal_buffer_level);
          let min_qadjustment = (lc.active_best_quality as i64
            - lc.best_quality as i64)
            * fraction
            / 128;
          lc.active_best_quality =
            (lc.active_best_quality as i64 - min_qadjustment) as u8;
        }
      }
    } else if cq {
      if fd.frame_type == FrameType::KEY || golden_or_alt {
        lc.active_best_quality = lc.best_quality;
      } else if lc.active_best_quality < self.cq_target_quality {
        lc.active_best_quality = self.cq_target_quality;
      }
    }

    lc.active_worst_quality = lc.active_worst_quality.min(lc.worst_quality);
    lc.active_best_quality = lc.active_best_quality.max(lc.best_quality);
    lc.active_worst_quality =
      lc.active_worst_quality.max(lc.active_best_quality);
  }

  /// Upper bound of the zero-bin extension for a frame.
  pub fn zbin_oq_max(
    &self, fd: &FrameDecision, noboost: bool, source_alt_ref_active: bool,
  ) -> i32 {
    if fd.frame_type == FrameType::KEY {
      0
    } else if !self.is_layered()
      && !noboost
      && (fd.refresh.alt_ref || (fd.refresh.golden && !source_alt_ref_active))
    {
      16
    } else {
      ZBIN_OQ_MAX
    }
  }

  /// Quantizer whose predicted size best matches `target_bits`, and the
  /// zero-bin extension applied on top of it.
  pub fn regulate_q(
    &self, fd: &FrameDecision, target_bits: i64, noboost: bool,
    source_alt_ref_active: bool,
  ) -> (u8, i32) {
    if let Some(fixed_q) = self.fixed_q {
      // Every pinned quantizer maps to the same level.
      return (fixed_q, 0);
    }

    let category = self.category(fd.frame_type, fd, noboost);
    let correction_factor = self.lc.correction_factor(category);
    let mbs = self.mbs as i64;
    let target_bits_per_mb = if target_bits >= (i32::MAX >> BPER_MB_NORMBITS) as i64 {
      (target_bits / mbs) << BPER_MB_NORMBITS
    } else {
      (target_bits << BPER_MB_NORMBITS) / mbs
    };

    let mut q = self.lc.active_worst_quality;
    let mut last_error = i64::MAX;
    let mut bits_per_mb_at_this_q = 0;
    for i in self.lc.active_best_quality..=self.lc.active_worst_quality {
      bits_per_mb_at_this_q = (0.5
        + correction_factor
          * self.model.bits_per_mb(fd.frame_type, i) as f64)
        as i64;
      if bits_per_mb_at_this_q <= target_bits_per_mb {
        q = if target_bits_per_mb - bits_per_mb_at_this_q <= last_error {
          i
        } else {
          i.saturating_sub(1)
        };
        break;
      }
      last_error = bits_per_mb_at_this_q - target_bits_per_mb;
    }

    let mut zbin_over_quant = 0;
    if q >= MAXQ {
      let zbin_oqmax = self.zbin_oq_max(fd, noboost, source_alt_ref_active);
      let mut factor = 0.99;
      while zbin_over_quant < zbin_oqmax {
        zbin_over_quant += 1;
        bits_per_mb_at_this_q = (factor * bits_per_mb_at_this_q as f64) as i64;
        factor = (factor + 0.01 / 256.0).min(0.999);
        if bits_per_mb_at_this_q <= target_bits_per_mb {
          break;
        }
      }
    }
    trace!(
      "regulate_q: target {} bits/mb {} -> q {} zbin {}",
      target_bits,
      target_bits_per_mb,
      q,
      zbin_over_quant
    );
    (q, zbin_over_quant)
  }

  /// Sizes outside `(under, over)` send the frame back through the recode
  /// loop.
  pub fn frame_size_bounds(&self, fd: &FrameDecision) -> (i64, i64) {
    if self.fixed_q.is_some() {
      return (0, i64::MAX);
    }
    let target = self.this_frame_target;
    let lc = &self.lc;
    let (over, under) = if fd.frame_type == FrameType::KEY
      || self.is_layered()
      || fd.is_golden_or_alt_ref()
    {
      (target * 9 / 8, target * 7 / 8)
    } else if self.end_usage == EndUsage::StreamFromServer {
      if lc.buffer_level >= (lc.optimal_buffer_level + lc.maximum_buffer_size) >> 1
      {
        (target * 12 / 8, target * 6 / 8)
      } else if lc.buffer_level <= lc.optimal_buffer_level >> 1 {
        (target * 10 / 8, target * 4 / 8)
      } else {
        (target * 11 / 8, target * 5 / 8)
      }
    } else if self.end_usage == EndUsage::ConstrainedQuality {
      (target * 11 / 8, target * 2 / 8)
    } else {
      (target * 11 / 8, target * 5 / 8)
    };
    ((under - 200).max(0), over + 200)
  }

  /// Moves the correction factor of `category` towards the ratio of the
  /// actual to the predicted size. Heavier `damp` reacts less.
  pub fn update_rate_correction_factors(
    &mut self, category: RateCategory, frame_type: FrameType, qindex: u8,
    zbin_over_quant: i32, damp: usize,
  ) {
    let mut rate_correction_factor = self.lc.correction_factor(category);
    let projected_size_based_on_q = zbin_adjusted(
      ((0.5
        + rate_correction_factor
          * self.model.bits_per_mb(frame_type, qindex) as f64)
        * self.mbs as f64
        / (1 << BPER_MB_NORMBITS) as f64)
        .trunc(),
      zbin_over_quant,
    ) as i64;

    let mut correction_factor = 100;
    if projected_size_based_on_q > 0 {
      correction_factor =
        100 * self.projected_frame_size / projected_size_based_on_q;
    }

    let adjustment_limit = match damp {
      0 => 0.75,
      1 => 0.375,
      _ => 0.25,
    };

    if correction_factor > 102 {
      let correction_factor = (100.5
        + (correction_factor - 100) as f64 * adjustment_limit)
        as i64;
      rate_correction_factor = (rate_correction_factor
        * correction_factor as f64
        / 100.0)
        .min(MAX_BPB_FACTOR);
    } else if correction_factor < 99 {
      let correction_factor = (100.5
        - (100 - correction_factor) as f64 * adjustment_limit)
        as i64;
      rate_correction_factor = (rate_correction_factor
        * correction_factor as f64
        / 100.0)
        .max(MIN_BPB_FACTOR);
    }

    trace!(
      "correction factor {:?}: {} (projected {} actual {})",
      category,
      rate_correction_factor,
      projected_size_based_on_q,
      self.projected_frame_size
    );
    *self.lc.correction_factor_mut(category) = rate_correction_factor;
  }

  fn estimate_keyframe_frequency(&mut self) -> i64 {
    let av_key_frame_frequency = if self.key_frame_count == 1 {
      // No history yet: one key frame every two seconds, at most.
      let key_freq = self.key_freq as i64;
      let mut frequency = 1 + (self.output_framerate * 2.0) as i64;
      if self.auto_key && frequency > key_freq {
        frequency = key_freq;
      }
      self.prior_key_frame_distance[KEY_FRAME_CONTEXT - 1] = frequency;
      frequency
    } else {
      let last_kf_interval = self.frames_since_key.max(1) as i64;
      self.prior_key_frame_distance.rotate_left(1);
      self.prior_key_frame_distance[KEY_FRAME_CONTEXT - 1] = last_kf_interval;
      let total_weight: i64 = PRIOR_KEY_FRAME_WEIGHT.iter().sum();
      self
        .prior_key_frame_distance
        .iter()
        .zip(PRIOR_KEY_FRAME_WEIGHT.iter())
        .map(|(distance, weight)| distance * weight)
        .sum::<i64>()
        / total_weight
    };
    av_key_frame_frequency.max(1)
  }

  fn adjust_key_frame_context(&mut self, gf: &mut GoldenFrameScheduler) {
    self.key_frame_count += 1;
    if self.projected_frame_size > self.per_frame_bandwidth {
      let overspend = self.projected_frame_size - self.per_frame_bandwidth;
      if self.is_layered() {
        self.kf_overspend_bits += overspend;
      } else {
        // The key frame is also a golden frame; recover part of it faster.
        self.kf_overspend_bits += overspend * 7 / 8;
        gf.gf_overspend_bits += overspend / 8;
      }
      self.kf_bitrate_adjustment =
        self.kf_overspend_bits / self.estimate_keyframe_frequency();
    }
    self.frames_since_key = 0;
  }

  /// Folds the coded size of a committed frame into the model and the
  /// buffer.
  pub fn postencode_update(
    &mut self, fd: &FrameDecision, size_bytes: usize,
    active_worst_qchanged: bool, gf: &mut GoldenFrameScheduler,
  ) {
    let size_bytes = size_bytes as i64;
    self.projected_frame_size = size_bytes << 3;
    self.lc.total_byte_count += size_bytes;
    for lc in self.layers.iter_mut().skip(self.current_layer + 1) {
      lc.total_byte_count += size_bytes;
    }

    let category =
      self.category(fd.frame_type, fd, gf.gf_noboost_onepass_cbr);
    if !active_worst_qchanged {
      self.update_rate_correction_factors(
        category,
        fd.frame_type,
        fd.qindex,
        fd.zbin_over_quant,
        2,
      );
    }
    self.lc.last_q[fd.frame_type.index()] = fd.qindex;

    let q = fd.qindex as i32;
    if fd.frame_type == FrameType::KEY {
      self.adjust_key_frame_context(gf);
    } else {
      self.lc.avg_frame_qindex = (2 + 3 * self.lc.avg_frame_qindex + q) >> 2;
      if self.is_layered() || !fd.is_golden_or_alt_ref() {
        let lc = &mut self.lc;
        lc.ni_frames += 1;
        lc.ni_tot_qi += q as i64;
        let average = (lc.ni_tot_qi / lc.ni_frames as i64) as i32;
        lc.ni_av_qi = if lc.ni_frames > NI_WARMUP_FRAMES {
          average
        } else {
          // Damp towards the worst quality early on.
          (average + lc.worst_quality as i32 + 1) / 2
        };
        if q > lc.ni_av_qi {
          lc.ni_av_qi = q - 1;
        }
      }
    }

    if fd.show_frame {
      self.lc.bits_off_target +=
        self.av_per_frame_bandwidth - self.projected_frame_size;
    } else {
      // Hidden frames are pure overhead.
      self.lc.bits_off_target -= self.projected_frame_size;
    }
    self.lc.bits_off_target =
      self.lc.bits_off_target.min(self.lc.maximum_buffer_size);

    self.rolling_target_bits =
      round_power_of_two(self.rolling_target_bits * 3 + self.this_frame_target, 2);
    self.rolling_actual_bits = round_power_of_two(
      self.rolling_actual_bits * 3 + self.projected_frame_size,
      2,
    );
    self.long_rolling_target_bits = round_power_of_two(
      self.long_rolling_target_bits * 31 + self.this_frame_target,
      5,
    );
    self.long_rolling_actual_bits = round_power_of_two(
      self.long_rolling_actual_bits * 31 + self.projected_frame_size,
      5,
    );

    self.lc.total_actual_bits += self.projected_frame_size;
    self.lc.total_target_vs_actual +=
      self.this_frame_target - self.projected_frame_size;
    self.lc.buffer_level = self.lc.bits_off_target;

    let projected_frame_size = self.projected_frame_size;
    for lc in self.layers.iter_mut().skip(self.current_layer + 1) {
      let bits_off_for_this_layer = (lc.target_bandwidth as f64 / lc.framerate
        - projected_frame_size as f64)
        .round() as i64;
      lc.bits_off_target = (lc.bits_off_target + bits_off_for_this_layer)
        .min(lc.maximum_buffer_size);
      lc.total_actual_bits += projected_frame_size;
      lc.total_target_vs_actual += bits_off_for_this_layer;
      lc.buffer_level = lc.bits_off_target;
    }

    debug!(
      "frame {} committed: q {} size {} target {} buffer {}",
      self.current_video_frame,
      fd.qindex,
      self.projected_frame_size,
      self.this_frame_target,
      self.lc.buffer_level
    );

    if fd.show_frame {
      self.current_video_frame += 1;
      self.frames_since_key += 1;
    }
  }
}

/// Quantizer search state across the attempts at coding one frame.
#[derive(Clone, Copy, Debug)]
pub struct RecodeState {
  q_low: u8,
  q_high: u8,
  zbin_oq_low: i32,
  zbin_oq_high: i32,
  overshoot_seen: bool,
  undershoot_seen: bool,
  top_index: u8,
  bottom_index: u8,
  /// Set when the last attempt raised the active worst quality, which also
  /// skips the correction factor update for that attempt.
  pub active_worst_qchanged: bool,
  pub loop_count: usize,
}

impl RecodeState {
  pub fn new(
    rc: &RCState, fd: &FrameDecision, noboost: bool,
    source_alt_ref_active: bool,
  ) -> Self {
    RecodeState {
      q_low: rc.lc.active_best_quality,
      q_high: rc.lc.active_worst_quality,
      zbin_oq_low: 0,
      zbin_oq_high: rc.zbin_oq_max(fd, noboost, source_alt_ref_active),
      overshoot_seen: false,
      undershoot_seen: false,
      top_index: rc.lc.active_worst_quality,
      bottom_index: rc.lc.active_best_quality,
      active_worst_qchanged: false,
      loop_count: 0,
    }
  }

  fn recode_loop_test(
    &self, rc: &RCState, fd: &FrameDecision, recode_allowed: bool,
  ) -> bool {
    if !recode_allowed {
      return false;
    }
    let q = fd.qindex;
    let size = rc.projected_frame_size;
    if (size > fd.overshoot_limit && q < self.top_index)
      || (size < fd.undershoot_limit && q > self.bottom_index)
    {
      true
    } else {
      rc.end_usage == EndUsage::ConstrainedQuality
        && q > rc.cq_target_quality
        && size < (rc.this_frame_target * 7) >> 3
    }
  }

  /// Takes the size of the attempt coded with `fd`. Returns the quantizer
  /// and zero-bin extension to try next, or `None` to commit.
  pub fn next_q(
    &mut self, rc: &mut RCState, fd: &FrameDecision, size_bytes: usize,
    recode_allowed: bool, max_recodes: usize, noboost: bool,
    source_alt_ref_active: bool,
  ) -> Option<(u8, i32)> {
    rc.projected_frame_size = (size_bytes as i64) << 3;
    let q = fd.qindex;
    let category = rc.category(fd.frame_type, fd, noboost);

    if q == rc.lc.active_worst_quality
      && rc.lc.active_worst_quality < rc.lc.worst_quality
      && rc.projected_frame_size > fd.overshoot_limit
    {
      let mut over_size_percent = (rc.projected_frame_size
        - fd.overshoot_limit)
        * 100
        / fd.overshoot_limit.max(1);
      while rc.lc.active_worst_quality < rc.lc.worst_quality
        && over_size_percent > 0
      {
        rc.lc.active_worst_quality += 1;
        // One quantizer step is worth about 4% of the frame size.
        over_size_percent = (over_size_percent as f64 * 0.96) as i64;
      }
      self.top_index = rc.lc.active_worst_quality;
      self.active_worst_qchanged = true;
    } else {
      self.active_worst_qchanged = false;
    }

    if fd.is_src_frame_alt_ref
      || self.loop_count >= max_recodes
      || !self.recode_loop_test(rc, fd, recode_allowed)
    {
      return None;
    }

    let last_q = q;
    let mut zbin = fd.zbin_over_quant;
    let mut new_q;
    let mut retries = 0;
    let target = rc.this_frame_target;

    if rc.projected_frame_size > target {
      self.q_low = if q < self.q_high { q + 1 } else { self.q_high };
      if zbin > 0 {
        self.zbin_oq_low =
          if zbin < self.zbin_oq_high { zbin + 1 } else { self.zbin_oq_high };
      }
      if self.undershoot_seen {
        if !self.active_worst_qchanged {
          rc.update_rate_correction_factors(category, fd.frame_type, q, zbin, 1);
        }
        new_q = ((self.q_high as u32 + self.q_low as u32 + 1) / 2) as u8;
        zbin = if new_q < MAXQ {
          0
        } else {
          self.zbin_oq_low = self.zbin_oq_low.max(1);
          (self.zbin_oq_high + self.zbin_oq_low) / 2
        };
      } else {
        if !self.active_worst_qchanged {
          rc.update_rate_correction_factors(category, fd.frame_type, q, zbin, 0);
        }
        (new_q, zbin) =
          rc.regulate_q(fd, target, noboost, source_alt_ref_active);
        while (new_q < self.q_low || zbin < self.zbin_oq_low) && retries < 10
        {
          rc.update_rate_correction_factors(category, fd.frame_type, q, zbin, 0);
          (new_q, zbin) =
            rc.regulate_q(fd, target, noboost, source_alt_ref_active);
          retries += 1;
        }
      }
      self.overshoot_seen = true;
    } else {
      if zbin == 0 {
        self.q_high = if q > self.q_low { q - 1 } else { self.q_low };
      } else {
        self.zbin_oq_high =
          if zbin > self.zbin_oq_low { zbin - 1 } else { self.zbin_oq_low };
      }
      if self.overshoot_seen {
        if !self.active_worst_qchanged {
          rc.update_rate_correction_factors(category, fd.frame_type, q, zbin, 1);
        }
        new_q = ((self.q_high as u32 + self.q_low as u32) / 2) as u8;
        zbin = if new_q < MAXQ {
          0
        } else {
          (self.zbin_oq_high + self.zbin_oq_low) / 2
        };
      } else {
        if !self.active_worst_qchanged {
          rc.update_rate_correction_factors(category, fd.frame_type, q, zbin, 0);
        }
        (new_q, zbin) =
          rc.regulate_q(fd, target, noboost, source_alt_ref_active);
        if rc.end_usage == EndUsage::ConstrainedQuality && new_q < self.q_low {
          self.q_low = new_q;
        }
        while (new_q > self.q_high || zbin > self.zbin_oq_high) && retries < 10
        {
          rc.update_rate_correction_factors(category, fd.frame_type, q, zbin, 0);
          (new_q, zbin) =
            rc.regulate_q(fd, target, noboost, source_alt_ref_active);
          retries += 1;
        }
      }
      self.undershoot_seen = true;
    }

    new_q = new_q.clamp(self.q_low, self.q_high.max(self.q_low));
    zbin = zbin.clamp(self.zbin_oq_low, self.zbin_oq_high.max(self.zbin_oq_low));

    if new_q == last_q {
      return None;
    }
    self.loop_count += 1;
    debug!(
      "recode {}: size {} outside [{}, {}], q {} -> {}",
      self.loop_count,
      rc.projected_frame_size,
      fd.undershoot_limit,
      fd.overshoot_limit,
      last_q,
      new_q
    );
    Some((new_q, zbin))
  }
}

#[cfg(test)]
mod test {
  use super::*;
  use crate::api::*;
  use crate::encoder::RefreshFlags;

  fn decision(frame_type: FrameType) -> FrameDecision {
    FrameDecision {
      input_frameno: 0,
      frame_type,
      qindex: 0,
      zbin_over_quant: 0,
      refresh: RefreshFlags { last: true, ..Default::default() },
      show_frame: true,
      is_src_frame_alt_ref: false,
      forced_key: false,
      dropped: false,
      layer: 0,
      target_bits: 0,
      undershoot_limit: 0,
      overshoot_limit: 0,
      recodes: 0,
    }
  }

  fn qcif() -> EncoderConfig {
    let mut enc = EncoderConfig::default();
    enc.width = 176;
    enc.height = 144;
    enc.time_base = Rational::new(1, 25);
    enc
  }

  fn cbr() -> RateControlConfig {
    RateControlConfig::new()
      .with_end_usage(EndUsage::StreamFromServer)
      .with_target_bitrate(256)
  }

  fn new_state(enc: &EncoderConfig, rc: &RateControlConfig) -> RCState {
    RCState::new(enc, rc, Arc::new(DefaultBitsPerMb))
  }

  #[test]
  fn q_trans_is_monotone() {
    assert_eq!(q_trans(0), 0);
    assert_eq!(q_trans(63), MAXQ);
    assert!(Q_TRANS.windows(2).all(|w| w[0] < w[1]));
    for user_q in 0..64u8 {
      assert_eq!(reverse_q_trans(q_trans(user_q)), user_q);
    }
  }

  #[test]
  fn estimate_switches_precision_for_large_frames() {
    let model = DefaultBitsPerMb;
    let small = estimate_bits_at_q(&model, FrameType::INTER, 46, 99, 1.0);
    assert_eq!(small, ((0.5 + 57000.0) as i64 * 99) >> 9);
    let large = estimate_bits_at_q(&model, FrameType::INTER, 46, 4096, 1.0);
    assert_eq!(large, (57000 >> 9) * 4096);
  }

  #[test]
  fn buffer_levels_from_milliseconds() {
    let rc = new_state(&qcif(), &cbr());
    assert_eq!(rc.lc.starting_buffer_level, 1_024_000);
    assert_eq!(rc.lc.optimal_buffer_level, 1_280_000);
    assert_eq!(rc.lc.maximum_buffer_size, 1_536_000);
    assert_eq!(rc.per_frame_bandwidth, 10_240);

    // The VBR buffer model is fixed.
    let vbr = new_state(&qcif(), &RateControlConfig::default());
    assert_eq!(vbr.lc.maximum_buffer_size, 240_000 * 256);
  }

  #[test]
  fn regulate_q_matches_model() {
    let mut rc = new_state(&qcif(), &cbr());
    rc.lc.active_best_quality = 0;
    rc.lc.active_worst_quality = MAXQ;
    let fd = decision(FrameType::INTER);
    for &q in &[10u8, 46, 90] {
      let target =
        estimate_bits_at_q(&DefaultBitsPerMb, FrameType::INTER, q, 99, 1.0);
      let (chosen, zbin) = rc.regulate_q(&fd, target, false, false);
      assert!((chosen as i32 - q as i32).abs() <= 1, "{} vs {}", chosen, q);
      assert_eq!(zbin, 0);
    }
  }

  #[test]
  fn regulate_q_extends_zero_bin_at_maxq() {
    let mut rc = new_state(&qcif(), &cbr());
    rc.lc.active_worst_quality = MAXQ;
    let fd = decision(FrameType::INTER);
    let (q, zbin) = rc.regulate_q(&fd, 10, false, false);
    assert_eq!(q, MAXQ);
    assert_eq!(zbin, ZBIN_OQ_MAX);

    let key = decision(FrameType::KEY);
    assert_eq!(rc.regulate_q(&key, 10, false, false), (MAXQ, 0));

    let mut golden = decision(FrameType::INTER);
    golden.refresh.golden = true;
    assert_eq!(rc.regulate_q(&golden, 10, false, false), (MAXQ, 16));
  }

  #[test]
  fn correction_factor_is_damped_and_bounded() {
    let mut rc = new_state(&qcif(), &cbr());
    let projected =
      estimate_bits_at_q(&DefaultBitsPerMb, FrameType::INTER, 40, 99, 1.0);
    rc.projected_frame_size = projected * 2;
    rc.update_rate_correction_factors(
      RateCategory::Inter,
      FrameType::INTER,
      40,
      0,
      0,
    );
    assert!((rc.lc.rate_correction_factor - 1.75).abs() < 0.02);

    for _ in 0..100 {
      rc.projected_frame_size = i32::MAX as i64;
      rc.update_rate_correction_factors(
        RateCategory::Inter,
        FrameType::INTER,
        40,
        0,
        0,
      );
    }
    assert_eq!(rc.lc.rate_correction_factor, MAX_BPB_FACTOR);

    for _ in 0..1000 {
      rc.projected_frame_size = 0;
      rc.update_rate_correction_factors(
        RateCategory::Key,
        FrameType::KEY,
        40,
        0,
        2,
      );
    }
    assert_eq!(rc.lc.key_frame_rate_correction_factor, MIN_BPB_FACTOR);
    assert_eq!(rc.lc.gf_rate_correction_factor, 1.0);
  }

  #[test]
  fn size_bounds() {
    let mut rc = new_state(&qcif(), &cbr());
    rc.this_frame_target = 8000;
    let key = decision(FrameType::KEY);
    assert_eq!(rc.frame_size_bounds(&key), (7000 - 200, 9000 + 200));

    let inter = decision(FrameType::INTER);
    rc.lc.buffer_level = rc.lc.maximum_buffer_size;
    assert_eq!(rc.frame_size_bounds(&inter), (6000 - 200, 12000 + 200));
    rc.lc.buffer_level = 0;
    assert_eq!(rc.frame_size_bounds(&inter), (4000 - 200, 10000 + 200));
    rc.lc.buffer_level = rc.lc.optimal_buffer_level;
    assert_eq!(rc.frame_size_bounds(&inter), (5000 - 200, 11000 + 200));

    rc.this_frame_target = 100;
    assert_eq!(rc.frame_size_bounds(&inter).0, 0);

    let q = RateControlConfig::new().with_end_usage(EndUsage::ConstantQuality);
    let fixed = new_state(&qcif(), &q);
    assert_eq!(fixed.frame_size_bounds(&inter), (0, i64::MAX));
  }

  #[test]
  fn first_key_frame_target() {
    let enc = qcif();
    let mut rc = new_state(&enc, &cbr());
    let mut gf =
      GoldenFrameScheduler::new(&enc, &cbr(), enc.frame_rate());
    let mut fd = decision(FrameType::KEY);
    assert!(rc.pick_frame_size(&mut fd, &mut gf, 0));
    // Half the initial buffer, capped at 1.5 seconds worth of bits.
    assert_eq!(fd.target_bits, 384_000);

    let capped = cbr().with_buffer(400, 5000, 6000);
    let mut rc = new_state(&enc, &capped);
    let mut fd = decision(FrameType::KEY);
    rc.pick_frame_size(&mut fd, &mut gf, 0);
    assert_eq!(fd.target_bits, 51_200);
  }

  #[test]
  fn key_frame_overspend_is_split() {
    let enc = qcif();
    let mut rc = new_state(&enc, &cbr());
    let mut gf = GoldenFrameScheduler::new(&enc, &cbr(), 25.0);
    let mut fd = decision(FrameType::KEY);
    fd.refresh = RefreshFlags::KEY_FRAME;
    fd.qindex = 20;
    let size_bytes = (rc.per_frame_bandwidth as usize + 8000) / 8;
    rc.postencode_update(&fd, size_bytes, false, &mut gf);
    assert_eq!(rc.kf_overspend_bits, 7000);
    assert_eq!(gf.gf_overspend_bits, 1000);
    // One key frame every two seconds.
    assert_eq!(rc.kf_bitrate_adjustment, 7000 / 51);
    assert_eq!(rc.frames_since_key, 1);
    assert_eq!(rc.current_video_frame, 1);
  }

  #[test]
  fn buffer_accounting() {
    let enc = qcif();
    let mut rc = new_state(&enc, &cbr());
    let mut gf = GoldenFrameScheduler::new(&enc, &cbr(), 25.0);
    let start = rc.lc.buffer_level;
    let mut fd = decision(FrameType::INTER);
    fd.qindex = 60;
    rc.postencode_update(&fd, 1000, false, &mut gf);
    assert_eq!(rc.lc.buffer_level, start + 10_240 - 8000);

    let mut hidden = decision(FrameType::INTER);
    hidden.refresh = RefreshFlags { alt_ref: true, ..Default::default() };
    hidden.show_frame = false;
    let before = rc.lc.buffer_level;
    let frames = rc.current_video_frame;
    rc.postencode_update(&hidden, 500, false, &mut gf);
    assert_eq!(rc.lc.buffer_level, before - 4000);
    assert_eq!(rc.current_video_frame, frames);

    for _ in 0..1000 {
      rc.postencode_update(&fd, 0, false, &mut gf);
    }
    assert_eq!(rc.lc.buffer_level, rc.lc.maximum_buffer_size);
  }

  #[test]
  fn ambient_quantizer_averages() {
    let enc = qcif();
    let mut rc = new_state(&enc, &cbr());
    let mut gf = GoldenFrameScheduler::new(&enc, &cbr(), 25.0);
    let mut fd = decision(FrameType::INTER);
    fd.qindex = 40;
    rc.postencode_update(&fd, 1000, false, &mut gf);
    assert_eq!(rc.lc.ni_frames, 1);
    assert_eq!(rc.lc.avg_frame_qindex, (2 + 3 * 127 + 40) >> 2);
    // Early frames are averaged with the worst quality.
    assert_eq!(rc.lc.ni_av_qi, (40 + 127 + 1) / 2);

    let mut golden = fd;
    golden.refresh.golden = true;
    rc.postencode_update(&golden, 1000, false, &mut gf);
    assert_eq!(rc.lc.ni_frames, 1);
  }

  #[test]
  fn decimation_drops_on_a_pattern() {
    let enc = qcif();
    let rcfg = cbr().with_drop_frames(60);
    let mut rc = new_state(&enc, &rcfg);
    rc.lc.buffer_level = 0;

    let pfb = rc.per_frame_bandwidth;
    assert!(!rc.decimate(FrameType::INTER));
    assert_eq!(rc.decimation_factor, 1);
    assert_eq!(rc.per_frame_bandwidth, pfb * 3 / 2);

    let drops: Vec<bool> = (0..4)
      .map(|_| {
        rc.new_framerate(25.0);
        rc.decimate(FrameType::INTER)
      })
      .collect();
    assert!(drops.iter().any(|&d| d));
    assert!(drops.iter().any(|&d| !d));

    // Key frames are never decimated.
    rc.decimation_count = 2;
    assert!(!rc.decimate(FrameType::KEY));
  }

  #[test]
  fn dropped_frames_refill_buffer() {
    let mut rc = new_state(&qcif(), &cbr());
    rc.lc.bits_off_target = -5000;
    rc.lc.buffer_level = -5000;
    rc.frame_dropped();
    assert_eq!(rc.lc.buffer_level, -5000 + 10_240);
    assert_eq!(rc.current_video_frame, 1);
  }

  #[test]
  fn underrun_crisis_drops_inter_frames() {
    let enc = qcif();
    let rcfg = cbr().with_drop_frames(30);
    let mut rc = new_state(&enc, &rcfg);
    let mut gf = GoldenFrameScheduler::new(&enc, &rcfg, 25.0);
    gf.frames_till_gf_update_due = 5;
    rc.current_video_frame = 10;
    rc.lc.buffer_level = -1;
    let mut fd = decision(FrameType::INTER);
    assert!(!rc.pick_frame_size(&mut fd, &mut gf, 0));

    let mut key = decision(FrameType::KEY);
    assert!(rc.pick_frame_size(&mut key, &mut gf, 0));
  }

  #[test]
  fn layer_contexts() {
    let mut enc = qcif();
    enc.temporal_layers = TemporalLayers::two_layers(100, 250);
    let mut rc = new_state(&enc, &cbr());
    assert_eq!(rc.layer(0).framerate, 12.5);
    assert_eq!(rc.layer(1).framerate, 25.0);
    assert_eq!(rc.layer(1).avg_frame_size_for_layer, 12_000);

    rc.restore_layer_context(1);
    assert_eq!(rc.per_frame_bandwidth, 10_000);
    rc.lc.buffer_level = 42;
    rc.save_layer_context();
    rc.restore_layer_context(0);
    assert_eq!(rc.per_frame_bandwidth, 8_000);
    assert_eq!(rc.layer(1).buffer_level, 42);

    // Bits saved on the base layer also reach the enhancement layer.
    let before = rc.layer(1).bits_off_target;
    rc.frame_dropped();
    assert_eq!(rc.layer(1).bits_off_target, before + 10_000);
  }

  #[test]
  fn active_quality_after_warmup() {
    let mut rc = new_state(&qcif(), &cbr());
    rc.lc.ni_frames = NI_WARMUP_FRAMES + 1;
    rc.lc.active_worst_quality = 100;
    rc.lc.buffer_level = rc.lc.optimal_buffer_level;
    let fd = decision(FrameType::INTER);
    rc.select_active_quality(&fd);
    assert_eq!(rc.lc.active_best_quality, INTER_MINQ[100]);

    // A full buffer lets the quality rise to the absolute best.
    rc.lc.active_worst_quality = 100;
    rc.lc.buffer_level = rc.lc.maximum_buffer_size;
    rc.select_active_quality(&fd);
    assert_eq!(rc.lc.active_best_quality, rc.lc.best_quality);
    assert!(rc.lc.active_worst_quality >= rc.lc.active_best_quality);
  }

  #[test]
  fn recode_raises_q_on_overshoot() {
    let enc = qcif();
    let mut rc = new_state(&enc, &cbr());
    rc.this_frame_target = 8000;
    rc.lc.active_best_quality = 4;
    rc.lc.active_worst_quality = MAXQ;
    let mut fd = decision(FrameType::INTER);
    let (q, zbin) = rc.regulate_q(&fd, 8000, false, false);
    fd.qindex = q;
    fd.zbin_over_quant = zbin;
    let (under, over) = rc.frame_size_bounds(&fd);
    fd.undershoot_limit = under;
    fd.overshoot_limit = over;

    let mut recode = RecodeState::new(&rc, &fd, false, false);
    let next = recode.next_q(&mut rc, &fd, 3000, true, 2, false, false);
    let (next_q, _) = next.expect("overshoot should recode");
    assert!(next_q > q);
    assert!(rc.lc.rate_correction_factor > 1.0);

    // The budget bounds the number of attempts.
    fd.qindex = next_q;
    recode.loop_count = 2;
    assert_eq!(recode.next_q(&mut rc, &fd, 3000, true, 2, false, false), None);
  }

  #[test]
  fn recode_respects_mode_and_alt_ref_source() {
    let mut rc = new_state(&qcif(), &cbr());
    rc.this_frame_target = 8000;
    let mut fd = decision(FrameType::INTER);
    fd.qindex = 60;
    fd.overshoot_limit = 9000;
    fd.undershoot_limit = 7000;
    let mut recode = RecodeState::new(&rc, &fd, false, false);
    assert_eq!(recode.next_q(&mut rc, &fd, 3000, false, 2, false, false), None);
    fd.is_src_frame_alt_ref = true;
    assert_eq!(recode.next_q(&mut rc, &fd, 3000, true, 2, false, false), None);
  }
}
