// Copyright (c) 2017-2024, The rav1e contributors. All rights reserved
//
// This source code is subject to the terms of the BSD 2 Clause License and
// the Alliance for Open Media Patent License 1.0. If the BSD 2 Clause License
// was not distributed with this source code in the LICENSE file, you can
// obtain it at www.aomedia.org/license/software. If the Alliance for Open
// Media Patent License 1.0 was not distributed with this source code in the
// PATENTS file, you can obtain it at www.aomedia.org/license/patent.

//! Block motion search.
//!
//! Motion vectors are stored in 1/8 pel. The searches themselves work on
//! full-pel positions and convert on the way out.

use std::ops;

use log::trace;
use rayon::prelude::*;

use crate::context::{MvCostTables, MvSadCosts};
use crate::dist::{get_sad, get_variance};
use crate::frame::*;
use crate::util::*;

/// Number of step sizes in the iterative search site tables.
pub const MAX_MVSEARCH_STEPS: usize = 8;
pub const MAX_FIRST_STEP: i16 = 1 << (MAX_MVSEARCH_STEPS - 1);
/// Largest full-pel distance searched from the reference vector.
pub const MAX_FULL_PEL_VAL: i16 = (1 << MAX_MVSEARCH_STEPS) - 1;
/// Largest full-pel bound whose 1/8 pel form fits a vector component.
const MAX_FULL_PEL_BOUND: i32 = (i16::MAX >> 3) as i32;

const HEX_RANGE: usize = 127;
const DIA_RANGE: usize = 8;
const REFINE_RANGE: usize = 8;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct MotionVector {
  pub row: i16,
  pub col: i16,
}

impl MotionVector {
  pub const ZERO: MotionVector = MotionVector { row: 0, col: 0 };

  #[inline]
  pub const fn new(row: i16, col: i16) -> Self {
    MotionVector { row, col }
  }

  #[inline]
  pub const fn is_zero(self) -> bool {
    self.row == 0 && self.col == 0
  }

  /// Drops the fractional part of a 1/8 pel vector.
  #[inline]
  pub const fn to_full_pel(self) -> Self {
    MotionVector { row: self.row >> 3, col: self.col >> 3 }
  }

  #[inline]
  pub const fn from_full_pel(self) -> Self {
    MotionVector {
      row: self.row.saturating_mul(8),
      col: self.col.saturating_mul(8),
    }
  }

  /// Clamps both components to `bounds`, expressed in the same unit as
  /// the vector.
  #[inline]
  pub fn clamp(self, bounds: &MvBounds) -> Self {
    MotionVector {
      row: clamp(self.row, bounds.row_min, bounds.row_max),
      col: clamp(self.col, bounds.col_min, bounds.col_max),
    }
  }
}

impl ops::Add<MotionVector> for MotionVector {
  type Output = MotionVector;

  #[inline]
  fn add(self, rhs: MotionVector) -> MotionVector {
    MotionVector { row: self.row + rhs.row, col: self.col + rhs.col }
  }
}

impl ops::Sub<MotionVector> for MotionVector {
  type Output = MotionVector;

  #[inline]
  fn sub(self, rhs: MotionVector) -> MotionVector {
    MotionVector { row: self.row - rhs.row, col: self.col - rhs.col }
  }
}

/// Legal motion vector range of one macroblock.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MvBounds {
  pub row_min: i16,
  pub row_max: i16,
  pub col_min: i16,
  pub col_max: i16,
}

impl MvBounds {
  /// Full-pel range that keeps the predictor inside the frame border.
  ///
  /// Bounds past what a 1/8 pel component can hold are saturated.
  pub fn for_macroblock(
    mb_row: usize, mb_col: usize, mb_rows: usize, mb_cols: usize,
  ) -> Self {
    let margin = (VP8_BORDER_IN_PIXELS - MB_SIZE) as i32;
    let bound = |v: i32| {
      v.clamp(-MAX_FULL_PEL_BOUND, MAX_FULL_PEL_BOUND) as i16
    };
    let before = |pos: usize| bound(-((pos * MB_SIZE) as i32 + margin));
    let after = |pos: usize, count: usize| {
      bound(((count - 1 - pos) * MB_SIZE) as i32 + margin)
    };
    MvBounds {
      row_min: before(mb_row),
      row_max: after(mb_row, mb_rows),
      col_min: before(mb_col),
      col_max: after(mb_col, mb_cols),
    }
  }

  /// Narrows the range to [`MAX_FULL_PEL_VAL`] around the full-pel
  /// `center`, which is first clamped into the range.
  pub fn limit_around(self, center: MotionVector) -> Self {
    let c = center.clamp(&self);
    MvBounds {
      row_min: self.row_min.max(c.row.saturating_sub(MAX_FULL_PEL_VAL)),
      row_max: self.row_max.min(c.row.saturating_add(MAX_FULL_PEL_VAL)),
      col_min: self.col_min.max(c.col.saturating_sub(MAX_FULL_PEL_VAL)),
      col_max: self.col_max.min(c.col.saturating_add(MAX_FULL_PEL_VAL)),
    }
  }

  #[inline]
  pub fn to_eighth_pel(self) -> Self {
    let eighth = |v: i16| {
      (v as i32 * 8).clamp(i16::MIN as i32, i16::MAX as i32) as i16
    };
    MvBounds {
      row_min: eighth(self.row_min),
      row_max: eighth(self.row_max),
      col_min: eighth(self.col_min),
      col_max: eighth(self.col_max),
    }
  }

  #[inline]
  pub fn contains(&self, mv: MotionVector) -> bool {
    mv.row >= self.row_min
      && mv.row <= self.row_max
      && mv.col >= self.col_min
      && mv.col <= self.col_max
  }

  #[inline]
  fn contains_strict(&self, mv: MotionVector) -> bool {
    mv.row > self.row_min
      && mv.row < self.row_max
      && mv.col > self.col_min
      && mv.col < self.col_max
  }

  /// Whether every position within `range` of `mv` lies in bounds.
  #[inline]
  fn contains_range(&self, mv: MotionVector, range: i16) -> bool {
    mv.row - range >= self.row_min
      && mv.row + range <= self.row_max
      && mv.col - range >= self.col_min
      && mv.col + range <= self.col_max
  }
}

/// One candidate offset of an iterative search.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SearchSite {
  pub mv: MotionVector,
  /// Offset of the candidate in a buffer of the table's stride.
  pub offset: isize,
}

/// Site table of the diamond searches, one group of sites per step, with
/// the step size halving from [`MAX_FIRST_STEP`] down to 1. Entry 0 is
/// the origin.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SearchSites {
  sites: Vec<SearchSite>,
  searches_per_step: usize,
  stride: usize,
}

impl SearchSites {
  fn build(stride: usize, pattern: &[(i16, i16)]) -> Self {
    let mut sites = Vec::with_capacity(1 + pattern.len() * MAX_MVSEARCH_STEPS);
    sites.push(SearchSite { mv: MotionVector::ZERO, offset: 0 });

    let mut len = MAX_FIRST_STEP;
    while len > 0 {
      for &(row, col) in pattern {
        let mv = MotionVector::new(row * len, col * len);
        let offset = mv.row as isize * stride as isize + mv.col as isize;
        sites.push(SearchSite { mv, offset });
      }
      len /= 2;
    }

    SearchSites { sites, searches_per_step: pattern.len(), stride }
  }

  /// Four sites per step: up, down, left, right.
  pub fn dsmotion(stride: usize) -> Self {
    Self::build(stride, &[(-1, 0), (1, 0), (0, -1), (0, 1)])
  }

  /// Eight sites per step: the four neighbours, then the diagonals.
  pub fn three_step(stride: usize) -> Self {
    Self::build(
      stride,
      &[(-1, 0), (1, 0), (0, -1), (0, 1), (-1, -1), (-1, 1), (1, -1), (1, 1)],
    )
  }

  pub fn stride(&self) -> usize {
    self.stride
  }

  pub fn searches_per_step(&self) -> usize {
    self.searches_per_step
  }

  pub fn steps(&self) -> usize {
    (self.sites.len() - 1) / self.searches_per_step
  }

  pub fn sites(&self) -> &[SearchSite] {
    &self.sites
  }
}

/// Distortion of a source block against a displaced reference block.
pub trait BlockCost {
  /// SAD at the full-pel displacement `mv`.
  fn sad(&self, mv: MotionVector) -> u32;
  /// Variance of the difference at the full-pel displacement `mv`.
  fn variance(&self, mv: MotionVector) -> u32;
}

/// A 16×16 luma macroblock and the reference plane it is searched in.
#[derive(Clone, Copy, Debug)]
pub struct MeBlock<'a, T: Pixel> {
  org: PlaneSlice<'a, T>,
  reference: &'a Plane<T>,
  po: PlaneOffset,
}

impl<'a, T: Pixel> MeBlock<'a, T> {
  pub fn new(
    src: &'a Plane<T>, reference: &'a Plane<T>, mb_row: usize, mb_col: usize,
  ) -> Self {
    let po = PlaneOffset {
      x: (mb_col << MB_SIZE_LOG2) as isize,
      y: (mb_row << MB_SIZE_LOG2) as isize,
    };
    MeBlock { org: src.slice(po), reference, po }
  }

  #[inline]
  fn ref_slice(&self, mv: MotionVector) -> PlaneSlice<'a, T> {
    let slice = self.reference.slice(PlaneOffset {
      x: self.po.x + mv.col as isize,
      y: self.po.y + mv.row as isize,
    });
    debug_assert!(slice.fits(MB_SIZE, MB_SIZE));
    slice
  }
}

impl<T: Pixel> BlockCost for MeBlock<'_, T> {
  fn sad(&self, mv: MotionVector) -> u32 {
    get_sad(&self.org, &self.ref_slice(mv), MB_SIZE, MB_SIZE)
  }

  fn variance(&self, mv: MotionVector) -> u32 {
    get_variance(&self.org, &self.ref_slice(mv), MB_SIZE, MB_SIZE).0
  }
}

/// Per-macroblock search inputs.
#[derive(Clone, Copy, Debug)]
pub struct MeParams<'a> {
  /// Full-pel search range.
  pub bounds: MvBounds,
  /// Vector the coded motion vector is predicted from, in 1/8 pel.
  pub center_mv: MotionVector,
  pub sad_per_bit: i32,
  pub error_per_bit: i32,
  pub mv_costs: &'a MvCostTables,
  pub sad_costs: &'a MvSadCosts,
}

impl MeParams<'_> {
  #[inline]
  fn fcenter(&self) -> MotionVector {
    self.center_mv.to_full_pel()
  }
}

/// Approximate cost of the full-pel vector `mv` relative to `center`.
#[inline]
pub fn mvsad_err_cost(
  mv: MotionVector, center: MotionVector, sad_costs: &MvSadCosts,
  sad_per_bit: i32,
) -> u32 {
  let c = sad_costs.cost((mv.row - center.row) as i32)
    + sad_costs.cost((mv.col - center.col) as i32);
  ((c * sad_per_bit + 128) >> 8) as u32
}

/// Rate cost of the 1/8 pel vector `mv` relative to `center`.
#[inline]
pub fn mv_err_cost(
  mv: MotionVector, center: MotionVector, mv_costs: &MvCostTables,
  error_per_bit: i32,
) -> u32 {
  let c = mv_costs.cost(0, ((mv.row - center.row) >> 1) as i32)
    + mv_costs.cost(1, ((mv.col - center.col) >> 1) as i32);
  ((c * error_per_bit + 128) >> 8) as u32
}

/// Bit cost of the 1/8 pel vector `mv` scaled by `weight / 128`.
#[inline]
pub fn mv_bit_cost(
  mv: MotionVector, center: MotionVector, mv_costs: &MvCostTables,
  weight: i32,
) -> i32 {
  let c = mv_costs.cost(0, ((mv.row - center.row) >> 1) as i32)
    + mv_costs.cost(1, ((mv.col - center.col) >> 1) as i32);
  (c * weight) >> 7
}

/// VP8 DC quantizer step per quantizer index.
#[rustfmt::skip]
const DC_QLOOKUP: [u8; 128] = [
  4, 5, 6, 7, 8, 9, 10, 10, 11, 12, 13, 14, 15, 16, 17, 17,
  18, 19, 20, 20, 21, 21, 22, 22, 23, 23, 24, 25, 25, 26, 27, 28,
  29, 30, 31, 32, 33, 34, 35, 36, 37, 37, 38, 39, 40, 41, 42, 43,
  44, 45, 46, 46, 47, 48, 49, 50, 51, 52, 53, 54, 55, 56, 57, 58,
  59, 60, 61, 62, 63, 64, 65, 66, 67, 68, 69, 70, 71, 72, 73, 74,
  75, 76, 76, 77, 78, 79, 80, 81, 82, 83, 84, 85, 86, 87, 88, 89,
  91, 93, 95, 96, 98, 100, 101, 102, 104, 106, 108, 110, 112, 114, 116, 118,
  122, 124, 126, 128, 130, 132, 134, 136, 138, 140, 143, 145, 148, 151, 154, 157,
];

/// Returns `(sad_per_bit, error_per_bit)` for a quantizer index.
pub fn rd_multipliers(qindex: u8) -> (i32, i32) {
  let q = DC_QLOOKUP[(qindex as usize).min(DC_QLOOKUP.len() - 1)] as f64;
  let capped_q = q.min(160.0);
  let rdmult = (2.80 * capped_q * capped_q) as i32;
  let error_per_bit = (rdmult / 110).max(1);
  let sad_per_bit = (0.0418 * q + 2.4107) as i32;
  (sad_per_bit, error_per_bit)
}

/// Outcome of one diamond pass, positions in full pel.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DiamondResult {
  pub mv: MotionVector,
  /// Best SAD plus motion vector SAD cost.
  pub bestsad: u32,
  /// Variance plus motion vector rate cost.
  pub cost: u32,
  /// Steps in which the best position stayed at the start.
  pub num00: usize,
}

/// Iterative diamond search starting at the full-pel `ref_mv`.
///
/// `search_param` skips the largest steps. Ties keep the earlier site in
/// table order.
pub fn diamond_search_sad<B: BlockCost + ?Sized>(
  blk: &B, ref_mv: MotionVector, sites: &SearchSites, search_param: usize,
  p: &MeParams<'_>,
) -> DiamondResult {
  diamond_steps(blk, ref_mv, sites, search_param, p, |step, mv, sad| {
    trace!("diamond step {}: best {:?} sad {}", step, mv, sad)
  })
}

fn diamond_steps<B: BlockCost + ?Sized>(
  blk: &B, ref_mv: MotionVector, sites: &SearchSites, search_param: usize,
  p: &MeParams<'_>, mut on_step: impl FnMut(usize, MotionVector, u32),
) -> DiamondResult {
  let fcenter = p.fcenter();
  let per_step = sites.searches_per_step;
  let tot_steps = sites.steps().saturating_sub(search_param);
  let first = (search_param * per_step).min(sites.sites.len() - 1);
  let ss = &sites.sites[first..];

  let mut best_mv = ref_mv;
  let mut bestsad = blk.sad(best_mv)
    + mvsad_err_cost(best_mv, fcenter, p.sad_costs, p.sad_per_bit);
  let mut num00 = 0;
  let mut best_site = 0;
  let mut last_site = 0;
  let mut i = 1;

  for step in 0..tot_steps {
    for _ in 0..per_step {
      let this_mv = best_mv + ss[i].mv;
      if p.bounds.contains_strict(this_mv) {
        let thissad = blk.sad(this_mv);
        if thissad < bestsad {
          let thissad = thissad
            + mvsad_err_cost(this_mv, fcenter, p.sad_costs, p.sad_per_bit);
          if thissad < bestsad {
            bestsad = thissad;
            best_site = i;
          }
        }
      }
      i += 1;
    }

    if best_site != last_site {
      best_mv = best_mv + ss[best_site].mv;
      last_site = best_site;
    } else if best_mv == ref_mv {
      num00 += 1;
    }
    on_step(step, best_mv, bestsad);
  }

  let cost = blk.variance(best_mv)
    + mv_err_cost(
      best_mv.from_full_pel(),
      p.center_mv,
      p.mv_costs,
      p.error_per_bit,
    );

  DiamondResult { mv: best_mv, bestsad, cost, num00 }
}

/// Searches the 4-neighbourhood of the full-pel `ref_mv` for up to
/// `search_range` rounds. Returns the full-pel best and its cost.
pub fn refining_search_sad<B: BlockCost + ?Sized>(
  blk: &B, ref_mv: MotionVector, search_range: usize, p: &MeParams<'_>,
) -> (MotionVector, u32) {
  const NEIGHBORS: [MotionVector; 4] = [
    MotionVector::new(-1, 0),
    MotionVector::new(0, -1),
    MotionVector::new(0, 1),
    MotionVector::new(1, 0),
  ];
  let fcenter = p.fcenter();

  let mut best_mv = ref_mv;
  let mut bestsad = blk.sad(best_mv)
    + mvsad_err_cost(best_mv, fcenter, p.sad_costs, p.sad_per_bit);

  for _ in 0..search_range {
    let mut best_site = None;
    for (j, &n) in NEIGHBORS.iter().enumerate() {
      let this_mv = best_mv + n;
      if !p.bounds.contains_strict(this_mv) {
        continue;
      }
      let thissad = blk.sad(this_mv);
      if thissad < bestsad {
        let thissad = thissad
          + mvsad_err_cost(this_mv, fcenter, p.sad_costs, p.sad_per_bit);
        if thissad < bestsad {
          bestsad = thissad;
          best_site = Some(j);
        }
      }
    }

    match best_site {
      Some(j) => best_mv = best_mv + NEIGHBORS[j],
      None => break,
    }
  }

  let cost = blk.variance(best_mv)
    + mv_err_cost(
      best_mv.from_full_pel(),
      p.center_mv,
      p.mv_costs,
      p.error_per_bit,
    );
  (best_mv, cost)
}

/// Diamond search followed by up to `further_steps` smaller-step passes
/// and the optional 1-away refinement. Returns the full-pel best and its
/// cost.
pub fn full_pixel_diamond<B: BlockCost + ?Sized>(
  blk: &B, ref_mv: MotionVector, sites: &SearchSites, step_param: usize,
  further_steps: usize, do_refine: bool, p: &MeParams<'_>,
) -> (MotionVector, u32) {
  let further_steps =
    further_steps.min((sites.steps() - 1).saturating_sub(step_param));

  let first = diamond_search_sad(blk, ref_mv, sites, step_param, p);
  let mut best_mv = first.mv;
  let mut bestsme = first.cost;

  let mut n = first.num00;
  let mut num00 = 0;
  let mut do_refine = do_refine && n <= further_steps;

  while n < further_steps {
    n += 1;
    if num00 > 0 {
      num00 -= 1;
      continue;
    }

    let r = diamond_search_sad(blk, ref_mv, sites, step_param + n, p);
    num00 = r.num00;
    if num00 > further_steps - n {
      do_refine = false;
    }
    if r.cost < bestsme {
      bestsme = r.cost;
      best_mv = r.mv;
    }
  }

  if do_refine {
    let (mv, cost) = refining_search_sad(blk, best_mv, REFINE_RANGE, p);
    if cost < bestsme {
      bestsme = cost;
      best_mv = mv;
    }
  }

  (best_mv, bestsme)
}

#[rustfmt::skip]
const HEX: [MotionVector; 6] = [
  MotionVector::new(-1, -2), MotionVector::new(1, -2), MotionVector::new(2, 0),
  MotionVector::new(1, 2), MotionVector::new(-1, 2), MotionVector::new(-2, 0),
];

/// The three hexagon points not yet visited after moving in direction `k`.
#[rustfmt::skip]
const NEXT_CHKPTS: [[MotionVector; 3]; 6] = [
  [MotionVector::new(-2, 0), MotionVector::new(-1, -2), MotionVector::new(1, -2)],
  [MotionVector::new(-1, -2), MotionVector::new(1, -2), MotionVector::new(2, 0)],
  [MotionVector::new(1, -2), MotionVector::new(2, 0), MotionVector::new(1, 2)],
  [MotionVector::new(2, 0), MotionVector::new(1, 2), MotionVector::new(-1, 2)],
  [MotionVector::new(1, 2), MotionVector::new(-1, 2), MotionVector::new(-2, 0)],
  [MotionVector::new(-1, 2), MotionVector::new(-2, 0), MotionVector::new(-1, -2)],
];

const HEX_NEIGHBORS: [MotionVector; 4] = [
  MotionVector::new(0, -1),
  MotionVector::new(-1, 0),
  MotionVector::new(1, 0),
  MotionVector::new(0, 1),
];

struct HexState {
  br: MotionVector,
  bestsad: u32,
}

impl HexState {
  /// Evaluates `points` around the current best and returns the index of
  /// the one that improved it, if any.
  fn check_points<B: BlockCost + ?Sized>(
    &mut self, blk: &B, points: &[MotionVector], range: i16,
    p: &MeParams<'_>,
  ) -> Option<usize> {
    let fcenter = p.fcenter();
    let all_in = p.bounds.contains_range(self.br, range);
    let mut best_site = None;

    for (i, &pt) in points.iter().enumerate() {
      let this_mv = self.br + pt;
      if !all_in && !p.bounds.contains(this_mv) {
        continue;
      }
      let thissad = blk.sad(this_mv);
      if thissad < self.bestsad {
        let thissad = thissad
          + mvsad_err_cost(this_mv, fcenter, p.sad_costs, p.sad_per_bit);
        if thissad < self.bestsad {
          self.bestsad = thissad;
          best_site = Some(i);
        }
      }
    }

    best_site
  }
}

/// Hexagon phases of [`hex_search`]: the initial six points, then three
/// new points per move for up to 127 moves.
fn hex_walk<B: BlockCost + ?Sized>(
  blk: &B, state: &mut HexState, p: &MeParams<'_>,
) {
  let Some(mut k) = state.check_points(blk, &HEX, 2, p) else {
    return;
  };
  state.br = state.br + HEX[k];

  for _ in 1..HEX_RANGE {
    match state.check_points(blk, &NEXT_CHKPTS[k], 2, p) {
      Some(best_site) => {
        state.br = state.br + NEXT_CHKPTS[k][best_site];
        k = (k + 5 + best_site) % 6;
      }
      None => break,
    }
  }
}

/// Hexagon search from the full-pel `ref_mv`, clamped to the bounds first.
/// Returns the full-pel best and its SAD plus motion vector SAD cost.
pub fn hex_search<B: BlockCost + ?Sized>(
  blk: &B, ref_mv: MotionVector, p: &MeParams<'_>,
) -> (MotionVector, u32) {
  let br = ref_mv.clamp(&p.bounds);
  let bestsad =
    blk.sad(br) + mvsad_err_cost(br, p.fcenter(), p.sad_costs, p.sad_per_bit);
  let mut state = HexState { br, bestsad };

  hex_walk(blk, &mut state, p);

  for _ in 0..DIA_RANGE {
    match state.check_points(blk, &HEX_NEIGHBORS, 1, p) {
      Some(best_site) => state.br = state.br + HEX_NEIGHBORS[best_site],
      None => break,
    }
  }

  (state.br, state.bestsad)
}

/// Exhaustive search of the inclusive `[-distance, distance]` window
/// around the full-pel `ref_mv`, clipped to the bounds. Returns the
/// full-pel best and its cost.
pub fn full_search_sad<B: BlockCost + ?Sized>(
  blk: &B, ref_mv: MotionVector, distance: i16, p: &MeParams<'_>,
) -> (MotionVector, u32) {
  let fcenter = p.fcenter();
  let b = &p.bounds;

  let mut best_mv = ref_mv;
  let mut bestsad = blk.sad(best_mv)
    + mvsad_err_cost(best_mv, fcenter, p.sad_costs, p.sad_per_bit);

  let row_min = (ref_mv.row - distance).max(b.row_min);
  let row_max = (ref_mv.row + distance).min(b.row_max);
  let col_min = (ref_mv.col - distance).max(b.col_min);
  let col_max = (ref_mv.col + distance).min(b.col_max);

  for r in row_min..=row_max {
    for c in col_min..=col_max {
      let this_mv = MotionVector::new(r, c);
      let thissad = blk.sad(this_mv);
      if thissad < bestsad {
        let thissad = thissad
          + mvsad_err_cost(this_mv, fcenter, p.sad_costs, p.sad_per_bit);
        if thissad < bestsad {
          bestsad = thissad;
          best_mv = this_mv;
        }
      }
    }
  }

  let cost = blk.variance(best_mv)
    + mv_err_cost(
      best_mv.from_full_pel(),
      p.center_mv,
      p.mv_costs,
      p.error_per_bit,
    );
  (best_mv, cost)
}

/// Result of a search, vector in 1/8 pel.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SearchResult {
  pub mv: MotionVector,
  pub cost: u32,
}

/// A full-pel motion search strategy, chosen once per configuration.
pub trait MotionSearch: Send + Sync {
  /// Searches from `ref_mv` (1/8 pel), which is clamped to the bounds
  /// before the search starts.
  fn search(
    &self, blk: &dyn BlockCost, ref_mv: MotionVector, p: &MeParams<'_>,
  ) -> SearchResult;
}

fn start_mv(ref_mv: MotionVector, p: &MeParams<'_>) -> MotionVector {
  ref_mv.clamp(&p.bounds.to_eighth_pel()).to_full_pel()
}

#[derive(Clone, Debug)]
pub struct DiamondSearch {
  pub sites: SearchSites,
  pub step_param: usize,
  pub further_steps: usize,
  pub do_refine: bool,
}

impl MotionSearch for DiamondSearch {
  fn search(
    &self, blk: &dyn BlockCost, ref_mv: MotionVector, p: &MeParams<'_>,
  ) -> SearchResult {
    let (mv, cost) = full_pixel_diamond(
      blk,
      start_mv(ref_mv, p),
      &self.sites,
      self.step_param,
      self.further_steps,
      self.do_refine,
      p,
    );
    SearchResult { mv: mv.from_full_pel(), cost }
  }
}

#[derive(Clone, Copy, Debug, Default)]
pub struct HexSearch;

impl MotionSearch for HexSearch {
  fn search(
    &self, blk: &dyn BlockCost, ref_mv: MotionVector, p: &MeParams<'_>,
  ) -> SearchResult {
    let (mv, cost) = hex_search(blk, start_mv(ref_mv, p), p);
    SearchResult { mv: mv.from_full_pel(), cost }
  }
}

#[derive(Clone, Copy, Debug)]
pub struct FullSearch {
  pub distance: i16,
}

impl MotionSearch for FullSearch {
  fn search(
    &self, blk: &dyn BlockCost, ref_mv: MotionVector, p: &MeParams<'_>,
  ) -> SearchResult {
    let (mv, cost) =
      full_search_sad(blk, start_mv(ref_mv, p), self.distance, p);
    SearchResult { mv: mv.from_full_pel(), cost }
  }
}

/// Frame-level search counters, merged in macroblock order.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct MotionStats {
  pub zero_motion_mbs: u32,
  pub total_cost: u64,
  pub sum_abs_row: u64,
  pub sum_abs_col: u64,
}

impl MotionStats {
  fn add(&mut self, r: &SearchResult) {
    if r.mv.is_zero() {
      self.zero_motion_mbs += 1;
    }
    self.total_cost += r.cost as u64;
    self.sum_abs_row += r.mv.row.unsigned_abs() as u64;
    self.sum_abs_col += r.mv.col.unsigned_abs() as u64;
  }

  pub fn merge(&mut self, other: &MotionStats) {
    self.zero_motion_mbs += other.zero_motion_mbs;
    self.total_cost += other.total_cost;
    self.sum_abs_row += other.sum_abs_row;
    self.sum_abs_col += other.sum_abs_col;
  }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct FrameMotion {
  /// One result per macroblock, raster order.
  pub results: Vec<SearchResult>,
  pub stats: MotionStats,
}

/// Searches every luma macroblock of `src` in `reference`.
///
/// Rows run in parallel. Each row keeps its own counters and the rows are
/// merged in order, so the outcome does not depend on scheduling.
/// `hints` holds one start vector per macroblock; it is also the vector the
/// coded motion is predicted from.
pub fn search_frame<T: Pixel>(
  search: &dyn MotionSearch, src: &Frame<T>, reference: &Frame<T>,
  hints: Option<&[MotionVector]>, template: &MeParams<'_>,
) -> FrameMotion {
  let mb_rows = src.mb_rows();
  let mb_cols = src.mb_cols();

  let rows: Vec<(Vec<SearchResult>, MotionStats)> = (0..mb_rows)
    .into_par_iter()
    .map(|mb_row| {
      let mut stats = MotionStats::default();
      let mut results = Vec::with_capacity(mb_cols);
      for mb_col in 0..mb_cols {
        let blk =
          MeBlock::new(&src.planes[0], &reference.planes[0], mb_row, mb_col);
        let hint = hints
          .and_then(|h| h.get(mb_row * mb_cols + mb_col))
          .copied()
          .unwrap_or_default();
        let bounds = MvBounds::for_macroblock(mb_row, mb_col, mb_rows, mb_cols)
          .limit_around(hint.to_full_pel());
        let p = MeParams {
          bounds,
          center_mv: hint,
          ..*template
        };
        let r = search.search(&blk, hint, &p);
        stats.add(&r);
        results.push(r);
      }
      (results, stats)
    })
    .collect();

  let mut motion = FrameMotion {
    results: Vec::with_capacity(mb_rows * mb_cols),
    stats: MotionStats::default(),
  };
  for (results, stats) in rows.iter() {
    motion.results.extend_from_slice(results);
    motion.stats.merge(stats);
  }
  motion
}
