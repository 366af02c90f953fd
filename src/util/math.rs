// Copyright (c) 2017-2024, The rav1e contributors. All rights reserved
//
// This source code is subject to the terms of the BSD 2 Clause License and
// the Alliance for Open Media Patent License 1.0. If the BSD 2 Clause License
// was not distributed with this source code in the LICENSE file, you can
// obtain it at www.aomedia.org/license/software. If the Alliance for Open
// Media Patent License 1.0 was not distributed with this source code in the
// PATENTS file, you can obtain it at www.aomedia.org/license/patent.

pub trait Fixed {
  fn floor_log2(&self, n: usize) -> usize;
  fn ceil_log2(&self, n: usize) -> usize;
  fn align_power_of_two(&self, n: usize) -> usize;
  fn align_power_of_two_and_shift(&self, n: usize) -> usize;
}

impl Fixed for usize {
  #[inline]
  fn floor_log2(&self, n: usize) -> usize {
    self & !((1 << n) - 1)
  }
  #[inline]
  fn ceil_log2(&self, n: usize) -> usize {
    (self + (1 << n) - 1).floor_log2(n)
  }
  #[inline]
  fn align_power_of_two(&self, n: usize) -> usize {
    self.ceil_log2(n)
  }
  #[inline]
  fn align_power_of_two_and_shift(&self, n: usize) -> usize {
    (self + (1 << n) - 1) >> n
  }
}

pub fn clamp<T: PartialOrd>(input: T, min: T, max: T) -> T {
  if input < min {
    min
  } else if input > max {
    max
  } else {
    input
  }
}

/// Rounds `value / 2^n` to the nearest integer, ties away from zero for
/// positive values.
#[inline(always)]
pub const fn round_power_of_two_i64(value: i64, n: u32) -> i64 {
  (value + ((1 << n) >> 1)) >> n
}

#[cfg(test)]
mod test {
  use super::*;

  #[test]
  fn align_to_macroblocks() {
    assert_eq!(0usize.align_power_of_two(4), 0);
    assert_eq!(1usize.align_power_of_two(4), 16);
    assert_eq!(16usize.align_power_of_two(4), 16);
    assert_eq!(17usize.align_power_of_two(4), 32);
    assert_eq!(33usize.align_power_of_two_and_shift(4), 3);
  }

  #[test]
  fn clamp_orders() {
    assert_eq!(clamp(-5, 0, 10), 0);
    assert_eq!(clamp(15, 0, 10), 10);
    assert_eq!(clamp(7, 0, 10), 7);
  }

  #[test]
  fn rolling_round() {
    assert_eq!(round_power_of_two_i64(6, 2), 2);
    assert_eq!(round_power_of_two_i64(5, 2), 1);
    assert_eq!(round_power_of_two_i64(7, 2), 2);
  }
}
