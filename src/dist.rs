// Copyright (c) 2019-2024, The rav1e contributors. All rights reserved
//
// This source code is subject to the terms of the BSD 2 Clause License and
// the Alliance for Open Media Patent License 1.0. If the BSD 2 Clause License
// was not distributed with this source code in the LICENSE file, you can
// obtain it at www.aomedia.org/license/software. If the Alliance for Open
// Media Patent License 1.0 was not distributed with this source code in the
// PATENTS file, you can obtain it at www.aomedia.org/license/patent.

use crate::frame::*;
use crate::util::*;

/// Sum of absolute differences over a `blk_w`×`blk_h` block.
#[inline(always)]
pub fn get_sad<T: Pixel>(
  plane_org: &PlaneSlice<'_, T>, plane_ref: &PlaneSlice<'_, T>,
  blk_w: usize, blk_h: usize,
) -> u32 {
  let mut sum = 0u32;

  for (slice_org, slice_ref) in
    plane_org.rows_iter().take(blk_h).zip(plane_ref.rows_iter())
  {
    sum += slice_org
      .iter()
      .take(blk_w)
      .zip(slice_ref)
      .map(|(&a, &b)| (i32::cast_from(a) - i32::cast_from(b)).unsigned_abs())
      .sum::<u32>();
  }

  sum
}

/// Returns the sum of squared differences and the signed sum of
/// differences over a `blk_w`×`blk_h` block.
#[inline(always)]
pub fn get_sse_sum<T: Pixel>(
  plane_org: &PlaneSlice<'_, T>, plane_ref: &PlaneSlice<'_, T>,
  blk_w: usize, blk_h: usize,
) -> (u32, i32) {
  let mut sse = 0u32;
  let mut sum = 0i32;

  for (slice_org, slice_ref) in
    plane_org.rows_iter().take(blk_h).zip(plane_ref.rows_iter())
  {
    for (&a, &b) in slice_org.iter().take(blk_w).zip(slice_ref) {
      let diff = i32::cast_from(a) - i32::cast_from(b);
      sum += diff;
      sse += (diff * diff) as u32;
    }
  }

  (sse, sum)
}

/// Block variance of the difference signal, `sse - sum² / (w·h)`.
///
/// Returns `(variance, sse)`.
#[inline(always)]
pub fn get_variance<T: Pixel>(
  plane_org: &PlaneSlice<'_, T>, plane_ref: &PlaneSlice<'_, T>,
  blk_w: usize, blk_h: usize,
) -> (u32, u32) {
  let (sse, sum) = get_sse_sum(plane_org, plane_ref, blk_w, blk_h);
  let mean_sq = (sum as i64 * sum as i64) / (blk_w * blk_h) as i64;

  ((sse as i64 - mean_sq) as u32, sse)
}
