// Copyright (c) 2020-2024, The rav1e contributors. All rights reserved
//
// This source code is subject to the terms of the BSD 2 Clause License and
// the Alliance for Open Media Patent License 1.0. If the BSD 2 Clause License
// was not distributed with this source code in the LICENSE file, you can
// obtain it at www.aomedia.org/license/software. If the Alliance for Open
// Media Patent License 1.0 was not distributed with this source code in the
// PATENTS file, you can obtain it at www.aomedia.org/license/patent.

use num_derive::*;

use crate::me::{
  DiamondSearch, FullSearch, HexSearch, MotionSearch, SearchSites,
  MAX_MVSEARCH_STEPS,
};
use crate::serialize::{Deserialize, Serialize};

use std::fmt;

/// Highest accepted speed preset.
pub const MAX_SPEED_PRESET: usize = 16;

/// Upper bound on re-encodes of one frame.
pub const MAX_RECODES: usize = 2;

/// Contains the speed settings.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpeedSettings {
  /// Motion search strategy used for inter macroblocks.
  pub search_method: SearchMethod,

  /// Index of the first diamond step, 0 being the largest.
  ///
  /// Higher is faster.
  pub search_param: usize,

  /// Additional diamond passes started at smaller steps.
  ///
  /// Higher is slower.
  pub further_steps: usize,

  /// Runs the 4-neighbour refinement after a diamond search.
  ///
  /// Enabled is slower.
  pub do_refine: bool,

  /// Half width of the window scanned by the exhaustive search.
  pub exhaustive_range: i16,

  /// Which frames may be re-encoded when they miss their size target.
  pub recode_loop: RecodeLoop,

  /// Re-encodes allowed per frame, at most [`MAX_RECODES`].
  pub max_recodes: usize,

  /// Lets the encoder decide when to refresh the golden frame.
  pub auto_gold: bool,

  /// Recomputes the golden frame boost on each golden refresh.
  pub auto_adjust_gold_quantizer: bool,

  /// Halves the golden frame boost when frames cannot be re-encoded.
  pub half_gf_boost: bool,
}

impl Default for SpeedSettings {
  /// The default settings are equivalent to speed 0
  fn default() -> Self {
    SpeedSettings {
      search_method: SearchMethod::NStep,
      search_param: 0,
      further_steps: MAX_MVSEARCH_STEPS - 1,
      do_refine: true,
      exhaustive_range: 16,
      recode_loop: RecodeLoop::AllFrames,
      max_recodes: MAX_RECODES,
      auto_gold: true,
      auto_adjust_gold_quantizer: true,
      half_gf_boost: false,
    }
  }
}

impl SpeedSettings {
  /// Set the speed setting according to a numeric speed preset.
  pub fn from_preset(speed: usize) -> Self {
    // The default settings are equivalent to speed 0
    let mut settings = SpeedSettings::default();

    if speed >= 1 {
      settings.search_method = SearchMethod::Diamond;
    }

    if speed >= 2 {
      settings.recode_loop = RecodeLoop::KeyAndGoldenOnly;
      settings.further_steps = MAX_MVSEARCH_STEPS - 3;
    }

    if speed >= 3 {
      settings.search_param = 1;
      settings.further_steps = MAX_MVSEARCH_STEPS - 4;
      settings.do_refine = false;
    }

    if speed >= 4 {
      settings.recode_loop = RecodeLoop::Disabled;
      settings.max_recodes = 0;
      settings.half_gf_boost = true;
    }

    if speed >= 5 {
      settings.search_method = SearchMethod::Hex;
    }

    if speed >= 8 {
      settings.search_param = 2;
      settings.further_steps = 1;
    }

    if speed >= 12 {
      settings.search_param = 3;
      settings.further_steps = 0;
      settings.auto_adjust_gold_quantizer = false;
    }

    settings
  }

  /// Builds the search strategy for luma planes of stride `stride`.
  pub fn motion_search(&self, stride: usize) -> Box<dyn MotionSearch> {
    match self.search_method {
      SearchMethod::Exhaustive => {
        Box::new(FullSearch { distance: self.exhaustive_range })
      }
      SearchMethod::NStep => Box::new(DiamondSearch {
        sites: SearchSites::three_step(stride),
        step_param: self.search_param,
        further_steps: self.further_steps,
        do_refine: self.do_refine,
      }),
      SearchMethod::Diamond => Box::new(DiamondSearch {
        sites: SearchSites::dsmotion(stride),
        step_param: self.search_param,
        further_steps: self.further_steps,
        do_refine: self.do_refine,
      }),
      SearchMethod::Hex => Box::new(HexSearch),
    }
  }

  /// Whether a frame of this kind may go through the recode loop.
  pub const fn recode_allowed(&self, key_or_golden: bool) -> bool {
    match self.recode_loop {
      RecodeLoop::Disabled => false,
      RecodeLoop::AllFrames => true,
      RecodeLoop::KeyAndGoldenOnly => key_or_golden,
    }
  }
}

/// Motion search strategy.
#[derive(
  Clone,
  Copy,
  Debug,
  PartialOrd,
  PartialEq,
  Eq,
  FromPrimitive,
  Serialize,
  Deserialize,
)]
pub enum SearchMethod {
  /// Every full-pel offset in a square window.
  Exhaustive,
  /// Diamond search over the eight-site table.
  NStep,
  /// Diamond search over the four-site table.
  Diamond,
  /// Hexagon search with a unit-step refinement.
  Hex,
}

impl fmt::Display for SearchMethod {
  fn fmt(&self, f: &mut fmt::Formatter) -> Result<(), fmt::Error> {
    write!(
      f,
      "{}",
      match self {
        SearchMethod::Exhaustive => "Exhaustive",
        SearchMethod::NStep => "N-Step",
        SearchMethod::Diamond => "Diamond",
        SearchMethod::Hex => "Hex",
      }
    )
  }
}

/// Frames allowed to go through the recode loop.
#[derive(
  Clone,
  Copy,
  Debug,
  PartialOrd,
  PartialEq,
  Eq,
  FromPrimitive,
  Serialize,
  Deserialize,
)]
pub enum RecodeLoop {
  /// Frames are committed at their first quantizer.
  Disabled,
  /// Any frame may be re-encoded.
  AllFrames,
  /// Only key, golden and alt-ref frames may be re-encoded.
  KeyAndGoldenOnly,
}

impl fmt::Display for RecodeLoop {
  fn fmt(&self, f: &mut fmt::Formatter) -> Result<(), fmt::Error> {
    write!(
      f,
      "{}",
      match self {
        RecodeLoop::Disabled => "Disabled",
        RecodeLoop::AllFrames => "All",
        RecodeLoop::KeyAndGoldenOnly => "Key+Golden",
      }
    )
  }
}

#[cfg(test)]
mod test {
  use super::*;

  #[test]
  fn presets_get_faster() {
    let s0 = SpeedSettings::from_preset(0);
    assert_eq!(s0, SpeedSettings::default());
    assert_eq!(s0.recode_loop, RecodeLoop::AllFrames);

    let s4 = SpeedSettings::from_preset(4);
    assert_eq!(s4.recode_loop, RecodeLoop::Disabled);
    assert!(s4.half_gf_boost);

    let top = SpeedSettings::from_preset(MAX_SPEED_PRESET);
    assert_eq!(top.search_method, SearchMethod::Hex);
    assert_eq!(top.further_steps, 0);
  }

  #[test]
  fn recode_modes() {
    let mut s = SpeedSettings::default();
    assert!(s.recode_allowed(false));
    s.recode_loop = RecodeLoop::KeyAndGoldenOnly;
    assert!(!s.recode_allowed(false));
    assert!(s.recode_allowed(true));
    s.recode_loop = RecodeLoop::Disabled;
    assert!(!s.recode_allowed(true));
  }

  #[test]
  fn modes_from_numbers() {
    use num_traits::FromPrimitive;

    assert_eq!(SearchMethod::from_u8(0), Some(SearchMethod::Exhaustive));
    assert_eq!(SearchMethod::from_u8(3), Some(SearchMethod::Hex));
    assert_eq!(SearchMethod::from_u8(4), None);
    assert_eq!(RecodeLoop::from_i32(2), Some(RecodeLoop::KeyAndGoldenOnly));
    assert_eq!(SearchMethod::NStep.to_string(), "N-Step");
  }
}
