// Copyright (c) 2017-2024, The rav1e contributors. All rights reserved
//
// This source code is subject to the terms of the BSD 2 Clause License and
// the Alliance for Open Media Patent License 1.0. If the BSD 2 Clause License
// was not distributed with this source code in the LICENSE file, you can
// obtain it at www.aomedia.org/license/software. If the Alliance for Open
// Media Patent License 1.0 was not distributed with this source code in the
// PATENTS file, you can obtain it at www.aomedia.org/license/patent.

use super::*;
use crate::encoder::reference::{RefFrame, RefreshFlags};

pub const VP8_YMODES: usize = 5;
pub const VP8_UV_MODES: usize = 4;
pub const BLOCK_TYPES: usize = 4;
pub const COEF_BANDS: usize = 8;
pub const PREV_COEF_CONTEXTS: usize = 3;
pub const ENTROPY_NODES: usize = 11;

pub type CoefProbs =
  [[[[Prob; ENTROPY_NODES]; PREV_COEF_CONTEXTS]; COEF_BANDS]; BLOCK_TYPES];

pub const DEFAULT_YMODE_PROB: [Prob; VP8_YMODES - 1] = [112, 86, 140, 37];
pub const DEFAULT_UV_MODE_PROB: [Prob; VP8_UV_MODES - 1] = [162, 101, 204];

/// Probabilities adapted from frame to frame.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FrameContext {
  pub mvc: [MvContext; 2],
  pub ymode_prob: [Prob; VP8_YMODES - 1],
  pub uv_mode_prob: [Prob; VP8_UV_MODES - 1],
  pub coef_probs: CoefProbs,
}

impl Default for FrameContext {
  fn default() -> Self {
    FrameContext {
      mvc: DEFAULT_MV_CONTEXT,
      ymode_prob: DEFAULT_YMODE_PROB,
      uv_mode_prob: DEFAULT_UV_MODE_PROB,
      coef_probs: [[[[128; ENTROPY_NODES]; PREV_COEF_CONTEXTS]; COEF_BANDS];
        BLOCK_TYPES],
    }
  }
}

impl FrameContext {
  /// Replaces the coefficient probabilities, e.g. with the tables owned by
  /// the entropy coder.
  pub fn set_coef_probs(&mut self, coef_probs: &CoefProbs) {
    self.coef_probs = *coef_probs;
  }
}

/// Per-frame mode and reference usage counters.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ModeCounts {
  pub ymode: [u32; VP8_YMODES],
  pub uv_mode: [u32; VP8_UV_MODES],
  pub ref_frame_usage: [u32; RefFrame::COUNT],
}

impl ModeCounts {
  pub fn merge(&mut self, other: &ModeCounts) {
    for (a, b) in self.ymode.iter_mut().zip(other.ymode.iter()) {
      *a += b;
    }
    for (a, b) in self.uv_mode.iter_mut().zip(other.uv_mode.iter()) {
      *a += b;
    }
    for (a, b) in
      self.ref_frame_usage.iter_mut().zip(other.ref_frame_usage.iter())
    {
      *a += b;
    }
  }

  pub fn total_mbs(&self) -> u32 {
    self.ref_frame_usage.iter().sum()
  }

  /// Share of intra coded macroblocks, in percent.
  pub fn percent_intra(&self) -> u32 {
    let total = self.total_mbs();
    if total == 0 {
      return 100;
    }
    self.ref_frame_usage[RefFrame::Intra as usize] * 100 / total
  }
}

/// Entropy state live during the coding of one frame.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct EntropyContext {
  pub fc: FrameContext,
  pub mv_costs: MvCostTables,
  pub counts: ModeCounts,
}

impl EntropyContext {
  /// Resets probabilities and cost tables to the key frame defaults.
  pub fn setup_key_frame(&mut self) {
    self.fc = FrameContext::default();
    self.mv_costs.update(&self.fc.mvc, [true, true]);
  }

  /// Installs `fc` and rebuilds the motion vector cost tables from it.
  pub fn load(&mut self, fc: &FrameContext) {
    let flags = [fc.mvc[0] != self.fc.mvc[0], fc.mvc[1] != self.fc.mvc[1]];
    self.fc = *fc;
    self.mv_costs.update(&self.fc.mvc, flags);
  }
}

/// Scalars restored together with the entropy state.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ContextScalars {
  pub frames_since_key: u32,
  pub filter_level: u8,
  pub frames_till_gf_update_due: u32,
  pub frames_since_golden: u32,
  pub this_frame_percent_intra: u32,
}

/// Snapshot taken before a trial encode.
///
/// Holds owned copies only, so mutating the live state never reaches a
/// saved snapshot.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CodingContext {
  pub entropy: EntropyContext,
  pub scalars: ContextScalars,
}

impl CodingContext {
  pub fn save(entropy: &EntropyContext, scalars: ContextScalars) -> Self {
    CodingContext { entropy: entropy.clone(), scalars }
  }

  pub fn restore(&self, entropy: &mut EntropyContext) -> ContextScalars {
    entropy.clone_from(&self.entropy);
    self.scalars
  }
}

/// Frame contexts remembered per reference role, for streams that do not
/// carry probability updates forward.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RefContexts {
  pub last: FrameContext,
  pub golden: FrameContext,
  pub alt_ref: FrameContext,
}

impl RefContexts {
  pub fn reset(&mut self, fc: &FrameContext) {
    self.last = *fc;
    self.golden = *fc;
    self.alt_ref = *fc;
  }

  pub fn get(&self, rf: RefFrame) -> &FrameContext {
    match rf {
      RefFrame::Golden => &self.golden,
      RefFrame::AltRef => &self.alt_ref,
      RefFrame::Intra | RefFrame::Last => &self.last,
    }
  }

  /// Stores `fc` for every role the frame refreshed.
  pub fn update(&mut self, refresh: &RefreshFlags, fc: &FrameContext) {
    if refresh.golden {
      self.golden = *fc;
    }
    if refresh.alt_ref {
      self.alt_ref = *fc;
    }
    if refresh.last {
      self.last = *fc;
    }
  }
}

#[cfg(test)]
mod test {
  use super::*;
  use pretty_assertions::assert_eq;

  fn mutate(entropy: &mut EntropyContext) {
    entropy.fc.mvc[0].prob[MVP_IS_SHORT] = 3;
    entropy.fc.ymode_prob[2] = 1;
    entropy.fc.coef_probs[1][2][0][5] = 7;
    entropy.counts.ymode[4] += 9;
    entropy.counts.ref_frame_usage[RefFrame::Golden as usize] += 2;
    let mvc = entropy.fc.mvc;
    entropy.mv_costs.update(&mvc, [true, false]);
  }

  #[test]
  fn restore_undoes_mutation() {
    let mut entropy = EntropyContext::default();
    let scalars = ContextScalars {
      frames_since_key: 12,
      filter_level: 20,
      frames_till_gf_update_due: 3,
      frames_since_golden: 4,
      this_frame_percent_intra: 30,
    };
    let saved = CodingContext::save(&entropy, scalars);
    let pristine = entropy.clone();

    mutate(&mut entropy);
    assert_ne!(entropy, pristine);

    let restored = saved.restore(&mut entropy);
    assert_eq!(entropy, pristine);
    assert_eq!(restored, scalars);
  }

  #[test]
  fn restore_without_mutation_is_noop() {
    let mut entropy = EntropyContext::default();
    mutate(&mut entropy);
    let before = entropy.clone();
    CodingContext::save(&entropy, ContextScalars::default())
      .restore(&mut entropy);
    assert_eq!(entropy, before);
  }

  #[test]
  fn snapshot_is_independent() {
    let mut entropy = EntropyContext::default();
    let saved = CodingContext::save(&entropy, ContextScalars::default());
    mutate(&mut entropy);
    assert_eq!(saved.entropy, EntropyContext::default());
  }

  #[test]
  fn load_rebuilds_mv_costs() {
    let mut entropy = EntropyContext::default();
    let mut fc = FrameContext::default();
    fc.mvc[1].prob[MVP_SIGN] = 10;
    entropy.load(&fc);
    assert_eq!(entropy.mv_costs, MvCostTables::new(&fc.mvc));
  }

  #[test]
  fn ref_contexts_follow_refresh_flags() {
    let mut ctxs = RefContexts::default();
    let mut fc = FrameContext::default();
    fc.uv_mode_prob[0] = 1;
    let refresh = RefreshFlags { golden: true, ..Default::default() };
    ctxs.update(&refresh, &fc);
    assert_eq!(ctxs.get(RefFrame::Golden), &fc);
    assert_eq!(ctxs.get(RefFrame::Last), &FrameContext::default());
    assert_eq!(ctxs.get(RefFrame::AltRef), &FrameContext::default());
  }

  #[test]
  fn mode_counts_merge_and_percent() {
    let mut a = ModeCounts::default();
    a.ref_frame_usage = [1, 2, 0, 1];
    let mut b = ModeCounts::default();
    b.ref_frame_usage = [3, 1, 1, 1];
    b.ymode[0] = 5;
    a.merge(&b);
    assert_eq!(a.ref_frame_usage, [4, 3, 1, 2]);
    assert_eq!(a.ymode[0], 5);
    assert_eq!(a.percent_intra(), 40);
  }
}
