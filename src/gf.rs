// Copyright (c) 2020-2024, The rav1e contributors. All rights reserved
//
// This source code is subject to the terms of the BSD 2 Clause License and
// the Alliance for Open Media Patent License 1.0. If the BSD 2 Clause License
// was not distributed with this source code in the LICENSE file, you can
// obtain it at www.aomedia.org/license/software. If the Alliance for Open
// Media Patent License 1.0 was not distributed with this source code in the
// PATENTS file, you can obtain it at www.aomedia.org/license/patent.

//! Golden and alt-ref frame scheduling.

use log::debug;

use crate::api::{EncoderConfig, EndUsage, FrameDecision, MbInfo};
use crate::api::{FrameType, RateControlConfig};
use crate::context::ModeCounts;
use crate::encoder::RefFrame;
use crate::util::clamp;

pub const MIN_GF_INTERVAL: u32 = 4;
pub const DEFAULT_GF_INTERVAL: u32 = 7;

#[rustfmt::skip]
const GF_BOOST_QADJUSTMENT: [i32; 128] = [
  80, 82, 84, 86, 88, 90, 92, 94, 96, 97, 98, 99,
  100, 101, 102, 103, 104, 105, 106, 107, 108, 109, 110, 111,
  112, 113, 114, 115, 116, 117, 118, 119, 120, 121, 122, 123,
  124, 125, 126, 127, 128, 129, 130, 131, 132, 133, 134, 135,
  136, 137, 138, 139, 140, 141, 142, 143, 144, 145, 146, 147,
  148, 149, 150, 151, 152, 153, 154, 155, 156, 157, 158, 159,
  160, 161, 162, 163, 164, 165, 166, 167, 168, 169, 170, 171,
  172, 173, 174, 175, 176, 177, 178, 179, 180, 181, 182, 183,
  184, 185, 186, 187, 188, 189, 190, 191, 192, 193, 194, 195,
  196, 197, 198, 199, 200, 200, 200, 200, 200, 200, 200, 200,
  200, 200, 200, 200, 200, 200, 200, 200,
];

#[rustfmt::skip]
const KF_GF_BOOST_QLIMITS: [i32; 128] = [
  150, 155, 160, 165, 170, 175, 180, 185, 190, 195, 200, 205,
  210, 215, 220, 225, 230, 235, 240, 245, 250, 255, 260, 265,
  270, 275, 280, 285, 290, 295, 300, 305, 310, 320, 330, 340,
  350, 360, 370, 380, 390, 400, 410, 420, 430, 440, 450, 460,
  470, 480, 490, 500, 510, 520, 530, 540, 550, 560, 570, 580,
  590, 600, 600, 600, 600, 600, 600, 600, 600, 600, 600, 600,
  600, 600, 600, 600, 600, 600, 600, 600, 600, 600, 600, 600,
  600, 600, 600, 600, 600, 600, 600, 600, 600, 600, 600, 600,
  600, 600, 600, 600, 600, 600, 600, 600, 600, 600, 600, 600,
  600, 600, 600, 600, 600, 600, 600, 600, 600, 600, 600, 600,
  600, 600, 600, 600, 600, 600, 600, 600,
];

#[rustfmt::skip]
const GF_ADJUST_TABLE: [i32; 101] = [
  100, 115, 130, 145, 160, 175, 190, 200, 210, 220, 230, 240,
  260, 270, 280, 290, 300, 310, 320, 330, 340, 350, 360, 370,
  380, 390, 400, 400, 400, 400, 400, 400, 400, 400, 400, 400,
  400, 400, 400, 400, 400, 400, 400, 400, 400, 400, 400, 400,
  400, 400, 400, 400, 400, 400, 400, 400, 400, 400, 400, 400,
  400, 400, 400, 400, 400, 400, 400, 400, 400, 400, 400, 400,
  400, 400, 400, 400, 400, 400, 400, 400, 400, 400, 400, 400,
  400, 400, 400, 400, 400, 400, 400, 400, 400, 400, 400, 400,
  400, 400, 400, 400, 400,
];

const GF_INTRA_USAGE_ADJUSTMENT: [i32; 20] = [
  125, 120, 115, 110, 105, 100, 95, 85, 80, 75, 70, 65, 60, 55, 50, 50, 50,
  50, 50, 50,
];

#[rustfmt::skip]
const GF_INTERVAL_TABLE: [u32; 101] = [
  7, 7, 7, 7, 7, 7, 7, 7, 7, 7, 7, 7, 7, 7, 7, 7, 7, 7, 7, 7,
  7, 7, 7, 7, 7, 7, 7, 7, 7, 7, 7, 7, 7, 7, 7, 7, 7, 7, 7, 7,
  8, 8, 8, 8, 8, 8, 8, 8, 8, 8, 8, 8, 8, 8, 8, 8, 8, 8, 8, 8,
  9, 9, 9, 9, 9, 9, 9, 9, 9, 9, 9, 9, 9, 9, 9, 9, 9, 9, 9, 9,
  10, 10, 10, 10, 10, 10, 10, 10, 10, 10, 11, 11, 11, 11, 11, 11, 11, 11, 11, 11,
  11,
];

/// Golden frame boost limit for a quantizer index.
pub(crate) fn boost_qlimit(q: u8) -> i32 {
  KF_GF_BOOST_QLIMITS[q as usize]
}

/// Schedules golden and alt-ref refreshes and keeps the bit debt they
/// leave behind.
///
/// Every field is plain data, so a `clone()` is a full snapshot.
#[derive(Clone, Debug)]
pub struct GoldenFrameScheduler {
  /// Interval the next golden group is planned with.
  pub baseline_gf_interval: u32,
  pub max_gf_interval: u32,
  /// Length of the golden group in progress.
  pub current_gf_interval: u32,
  /// Countdown to the next golden refresh.
  pub frames_till_gf_update_due: u32,
  pub frames_since_golden: u32,
  pub frames_till_alt_ref_frame: u32,
  /// Bits spent on golden frames above the inter frame target, still to be
  /// recovered from ordinary frames.
  pub gf_overspend_bits: i64,
  /// Bits taken off each ordinary frame towards `gf_overspend_bits`.
  pub non_gf_bitrate_adjustment: i64,
  /// Boost of the last golden frame, in percent of an inter frame.
  pub last_boost: i32,
  /// Reference usage accumulated since the last golden refresh.
  pub recent_ref_frame_usage: [u32; RefFrame::COUNT],
  gf_active_flags: Vec<bool>,
  /// Macroblocks still predicted well by the golden frame.
  pub gf_active_count: usize,
  pub this_frame_percent_intra: u32,
  pub last_frame_percent_intra: u32,
  /// The next golden group opens with a hidden alt-ref frame.
  pub source_alt_ref_pending: bool,
  /// The golden group in progress is served by an alt-ref frame.
  pub source_alt_ref_active: bool,
  /// One-pass CBR: golden frames come at a fixed period.
  pub gf_update_onepass_cbr: bool,
  /// One-pass CBR: golden frames share the inter frame rate model.
  pub gf_noboost_onepass_cbr: bool,
  pub gf_interval_onepass_cbr: u32,
  requested_interval: u32,
  gf_cbr_boost_pct: u32,
  key_freq: u64,
  auto_gold: bool,
  auto_adjust_gold_quantizer: bool,
  halve_boost: bool,
  play_alternate: bool,
  lag_in_frames: usize,
  fixed_q: bool,
  error_resilient: bool,
  mbs: usize,
}

impl GoldenFrameScheduler {
  pub fn new(
    enc: &EncoderConfig, rc: &RateControlConfig, framerate: f64,
  ) -> Self {
    let mbs = enc.mbs().max(1);
    let speed = &enc.speed_settings;
    let onepass_cbr =
      rc.end_usage == EndUsage::StreamFromServer && !enc.error_resilient;
    // Cyclic refresh covers a tenth of the frame each frame.
    let refresh_mbs = mbs / 10;
    let gf_interval_onepass_cbr = if refresh_mbs > 0 {
      clamp((2 * mbs / refresh_mbs) as u32, 6, 40)
    } else {
      10
    };
    let requested_interval = if onepass_cbr {
      gf_interval_onepass_cbr
    } else if enc.alt_freq > 0 {
      enc.alt_freq
    } else {
      DEFAULT_GF_INTERVAL
    };

    let mut gf = GoldenFrameScheduler {
      baseline_gf_interval: requested_interval,
      max_gf_interval: 0,
      current_gf_interval: 0,
      frames_till_gf_update_due: 0,
      frames_since_golden: 0,
      frames_till_alt_ref_frame: 0,
      gf_overspend_bits: 0,
      non_gf_bitrate_adjustment: 0,
      last_boost: 0,
      recent_ref_frame_usage: [1; RefFrame::COUNT],
      gf_active_flags: vec![true; mbs],
      gf_active_count: mbs,
      this_frame_percent_intra: 0,
      last_frame_percent_intra: 0,
      source_alt_ref_pending: false,
      source_alt_ref_active: false,
      gf_update_onepass_cbr: onepass_cbr,
      gf_noboost_onepass_cbr: onepass_cbr,
      gf_interval_onepass_cbr,
      requested_interval,
      gf_cbr_boost_pct: rc.gf_cbr_boost_pct,
      key_freq: enc.key_freq,
      auto_gold: speed.auto_gold,
      auto_adjust_gold_quantizer: speed.auto_adjust_gold_quantizer,
      halve_boost: speed.half_gf_boost && !speed.recode_allowed(true),
      play_alternate: enc.play_alternate && enc.lag_in_frames > 0,
      lag_in_frames: enc.lag_in_frames,
      fixed_q: rc.end_usage == EndUsage::ConstantQuality,
      error_resilient: enc.error_resilient,
      mbs,
    };
    gf.new_framerate(framerate);
    gf
  }

  /// Recomputes the longest golden interval for `framerate` and brings the
  /// baseline interval back within bounds.
  pub fn new_framerate(&mut self, framerate: f64) {
    let mut max = ((framerate / 2.0) as u32 + 2).max(12);
    let mut static_scene_max = (self.key_freq >> 1).min(u32::MAX as u64) as u32;
    if self.play_alternate {
      let lag_max = self.lag_in_frames.saturating_sub(1) as u32;
      max = max.min(lag_max);
      static_scene_max = static_scene_max.min(lag_max);
    }
    self.max_gf_interval = max.min(static_scene_max).max(MIN_GF_INTERVAL);
    self.baseline_gf_interval =
      clamp(self.requested_interval, MIN_GF_INTERVAL, self.max_gf_interval);
  }

  pub const fn is_error_resilient(&self) -> bool {
    self.error_resilient
  }

  pub const fn is_fixed_q(&self) -> bool {
    self.fixed_q
  }

  /// Percentage of recent macroblocks, or of golden-active macroblocks if
  /// higher, that reference the golden or alt-ref frame.
  pub fn gf_frame_usage(&self) -> usize {
    let usage = &self.recent_ref_frame_usage;
    let tot_mbs: u32 = usage.iter().sum();
    let pct_gf_active = 100 * self.gf_active_count / self.mbs;
    let gf_frame_usage = if tot_mbs > 0 {
      ((usage[RefFrame::Golden as usize] + usage[RefFrame::AltRef as usize])
        as u64
        * 100
        / tot_mbs as u64) as usize
    } else {
      0
    };
    gf_frame_usage.max(pct_gf_active).min(100)
  }

  /// Picks the boost of the golden frame about to be coded at `q` and the
  /// provisional length of its group.
  pub fn calc_gf_params(&mut self, q: u8) {
    let gf_frame_usage = self.gf_frame_usage();

    let mut boost = GF_BOOST_QADJUSTMENT[q as usize];
    boost = boost
      * GF_INTRA_USAGE_ADJUSTMENT[self.this_frame_percent_intra.min(14) as usize]
      / 100;
    boost = boost * GF_ADJUST_TABLE[gf_frame_usage] / 100;

    if self.halve_boost {
      boost /= 2;
    }

    let limit = KF_GF_BOOST_QLIMITS[q as usize];
    if boost > limit {
      boost = limit;
    } else if boost < 110 {
      boost = 110;
    }
    self.last_boost = boost;

    if self.fixed_q {
      self.frames_till_gf_update_due = self.baseline_gf_interval;
    } else {
      let mut due = self.baseline_gf_interval;
      for threshold in [750, 1000, 1250] {
        if self.last_boost > threshold {
          due += 1;
        }
      }
      if self.last_boost >= 1500 {
        due += 1;
      }
      due = due.max(GF_INTERVAL_TABLE[gf_frame_usage]);
      self.frames_till_gf_update_due = due.min(self.max_gf_interval);
    }
    self.source_alt_ref_pending = false;

    debug!(
      "gf params: q {} usage {}% boost {} due {}",
      q, gf_frame_usage, self.last_boost, self.frames_till_gf_update_due
    );
  }

  /// Takes this frame's share of the golden overspend off `target`.
  pub fn recover_overspend(&mut self, target: i64, min_target: i64) -> i64 {
    if self.gf_overspend_bits > 0 && target > min_target {
      let adjustment = self
        .non_gf_bitrate_adjustment
        .min(self.gf_overspend_bits)
        .min(target - min_target);
      self.gf_overspend_bits -= adjustment;
      target - adjustment
    } else {
      target
    }
  }

  /// Small boost for the frame halfway through a strongly boosted golden
  /// group, paid for by the frames around it.
  pub fn pulse(&self, target: i64, min_target: i64) -> i64 {
    if self.last_boost > 150
      && self.frames_till_gf_update_due > 0
      && self.current_gf_interval >= MIN_GF_INTERVAL << 1
    {
      let pct = clamp((self.last_boost - 100) >> 5, 1, 10) as i64;
      let adjustment = (target * pct / 100).min(target - min_target);
      if self.frames_since_golden == self.current_gf_interval >> 1 {
        let boost = (self.current_gf_interval as i64 - 1) * adjustment;
        target + boost.min(10 * target / 100)
      } else {
        target - adjustment
      }
    } else {
      target
    }
  }

  /// Decides whether the due golden frame is worth refreshing, and if so
  /// plans its group. Returns `true` on refresh.
  pub fn golden_due(&mut self, q: u8) -> bool {
    // A manual golden frequency refreshes whenever the countdown expires.
    let refresh = !self.auto_gold
      || self.this_frame_percent_intra < 15
      || self.gf_frame_usage() >= 5;
    if refresh && self.auto_adjust_gold_quantizer {
      self.calc_gf_params(q);
    }
    refresh
  }

  /// One-pass CBR golden period. Refreshes only when more than half of the
  /// last frame was static; returns the refresh decision and the target.
  pub fn onepass_cbr_golden(
    &mut self, zero_mv_count: u32, target: i64,
  ) -> (bool, i64) {
    self.gf_noboost_onepass_cbr = self.gf_cbr_boost_pct <= 100;
    self.requested_interval = self.gf_interval_onepass_cbr;
    self.baseline_gf_interval =
      clamp(self.requested_interval, MIN_GF_INTERVAL, self.max_gf_interval);
    let mut refresh = false;
    let mut target = target;
    if zero_mv_count as usize > self.mbs >> 1 {
      refresh = true;
      target = target * (100 + self.gf_cbr_boost_pct as i64) / 100;
    }
    self.frames_till_gf_update_due = self.baseline_gf_interval;
    self.current_gf_interval = self.frames_till_gf_update_due;
    (refresh, target)
  }

  /// Golden scheduling for a new key frame.
  pub fn setup_key_frame(&mut self) {
    self.frames_till_gf_update_due = if self.auto_gold {
      self.baseline_gf_interval
    } else {
      DEFAULT_GF_INTERVAL
    };
    self.source_alt_ref_active = false;
  }

  /// Tracks which macroblocks still lean on the golden frame.
  pub fn update_usage_maps(&mut self, fd: &FrameDecision, mb_info: &[MbInfo]) {
    if fd.frame_type == FrameType::KEY || fd.updates_golden() {
      self.reset_usage_maps();
      return;
    }
    for (active, mb) in self.gf_active_flags.iter_mut().zip(mb_info) {
      match mb.ref_frame {
        RefFrame::Golden | RefFrame::AltRef => {
          if !*active {
            *active = true;
            self.gf_active_count += 1;
          }
        }
        RefFrame::Intra | RefFrame::Last => {
          let moved = mb.ref_frame == RefFrame::Intra || !mb.mv.is_zero();
          if moved && *active {
            *active = false;
            self.gf_active_count -= 1;
          }
        }
      }
    }
  }

  fn reset_usage_maps(&mut self) {
    self.gf_active_flags.fill(true);
    self.gf_active_count = self.mbs;
  }

  /// Bookkeeping after a shown frame or golden refresh is committed.
  pub fn update_golden_frame_stats(
    &mut self, fd: &FrameDecision, projected_frame_size: i64,
    inter_frame_target: i64, counts: &ModeCounts,
  ) {
    if fd.updates_golden() {
      if !self.auto_gold {
        self.frames_till_gf_update_due = DEFAULT_GF_INTERVAL;
      }
      if self.frames_till_gf_update_due > 0 {
        self.current_gf_interval = self.frames_till_gf_update_due;
        if fd.frame_type != FrameType::KEY && !self.source_alt_ref_active {
          self.gf_overspend_bits += projected_frame_size - inter_frame_target;
        }
        self.non_gf_bitrate_adjustment =
          self.gf_overspend_bits / self.frames_till_gf_update_due as i64;
      }

      self.reset_usage_maps();
      self.frames_since_golden = 0;
      self.recent_ref_frame_usage = [1; RefFrame::COUNT];

      if self.fixed_q && self.play_alternate && !fd.refresh.alt_ref {
        self.source_alt_ref_pending = true;
        self.frames_till_gf_update_due = self.baseline_gf_interval;
      }
      if !self.source_alt_ref_pending {
        self.source_alt_ref_active = false;
      }
      self.frames_till_gf_update_due =
        self.frames_till_gf_update_due.saturating_sub(1);
    } else if !fd.refresh.alt_ref {
      self.frames_till_gf_update_due =
        self.frames_till_gf_update_due.saturating_sub(1);
      self.frames_till_alt_ref_frame =
        self.frames_till_alt_ref_frame.saturating_sub(1);
      self.frames_since_golden += 1;
      if self.frames_since_golden > 1 {
        for (recent, used) in
          self.recent_ref_frame_usage.iter_mut().zip(&counts.ref_frame_usage)
        {
          *recent += used;
        }
      }
    }
  }

  /// Bookkeeping after a hidden alt-ref frame is committed.
  pub fn update_alt_ref_frame_stats(&mut self, projected_frame_size: i64) {
    if !self.auto_gold {
      self.frames_till_gf_update_due = DEFAULT_GF_INTERVAL;
    }
    if self.frames_till_gf_update_due > 0 {
      self.current_gf_interval = self.frames_till_gf_update_due;
      self.gf_overspend_bits += projected_frame_size;
      self.non_gf_bitrate_adjustment =
        self.gf_overspend_bits / self.frames_till_gf_update_due as i64;
    }
    self.reset_usage_maps();
    self.frames_since_golden = 0;
    self.source_alt_ref_pending = false;
    self.source_alt_ref_active = true;
  }

  /// Commit-time dispatch between golden and alt-ref bookkeeping.
  pub fn update_stats(
    &mut self, fd: &FrameDecision, projected_frame_size: i64,
    inter_frame_target: i64, counts: &ModeCounts,
  ) {
    if self.error_resilient {
      return;
    }
    if self.play_alternate
      && fd.refresh.alt_ref
      && fd.frame_type != FrameType::KEY
    {
      self.update_alt_ref_frame_stats(projected_frame_size);
    } else {
      self.update_golden_frame_stats(
        fd,
        projected_frame_size,
        inter_frame_target,
        counts,
      );
    }
    self.last_frame_percent_intra = if fd.frame_type == FrameType::KEY {
      100
    } else {
      self.this_frame_percent_intra
    };
  }
}
