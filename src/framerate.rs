// Copyright (c) 2020-2024, The rav1e contributors. All rights reserved
//
// This source code is subject to the terms of the BSD 2 Clause License and
// the Alliance for Open Media Patent License 1.0. If the BSD 2 Clause License
// was not distributed with this source code in the LICENSE file, you can
// obtain it at www.aomedia.org/license/software. If the Alliance for Open
// Media Patent License 1.0 was not distributed with this source code in the
// PATENTS file, you can obtain it at www.aomedia.org/license/patent.

use log::warn;

use crate::api::Rational;

/// Internal timestamps run at 10 MHz.
pub const TICKS_PER_SECOND: i64 = 10_000_000;

/// Framerate assumed when the measured one is unusable.
pub const FALLBACK_FRAMERATE: f64 = 30.0;

/// `val * num / den` without intermediate overflow, rounded towards zero.
pub fn rescale(val: i64, num: i64, den: i64) -> i64 {
  if den == 0 {
    return 0;
  }
  (val as i128 * num as i128 / den as i128) as i64
}

/// Replaces framerates too low to budget with [`FALLBACK_FRAMERATE`].
pub fn sanitize_framerate(framerate: f64) -> f64 {
  if framerate < 0.1 || !framerate.is_finite() {
    warn!(
      "framerate {} out of range, using {}",
      framerate, FALLBACK_FRAMERATE
    );
    FALLBACK_FRAMERATE
  } else {
    framerate
  }
}

/// Tracks the framerate actually delivered by the input timestamps.
///
/// A duration change of 10% or more is followed at once, smaller changes
/// are averaged over at most the last second of input.
#[derive(Clone, Copy, Debug)]
pub struct FramerateEstimator {
  // Ticks per timebase unit, as a reduced fraction.
  ratio_num: i64,
  ratio_den: i64,
  first_time_stamp_ever: Option<i64>,
  last_time_stamp_seen: i64,
  last_end_time_stamp_seen: i64,
  ref_framerate: f64,
}

impl FramerateEstimator {
  pub fn new(time_base: Rational) -> Self {
    let num = time_base.num.max(1) as i64 * TICKS_PER_SECOND;
    let den = time_base.den.max(1) as i64;
    let g = gcd(num, den);
    FramerateEstimator {
      ratio_num: num / g,
      ratio_den: den / g,
      first_time_stamp_ever: None,
      last_time_stamp_seen: 0,
      last_end_time_stamp_seen: 0,
      ref_framerate: sanitize_framerate(
        Rational::from_reciprocal(time_base).as_f64(),
      ),
    }
  }

  /// Converts a timestamp in timebase units to ticks.
  pub fn to_ticks(&self, pts: u64) -> i64 {
    rescale(pts as i64, self.ratio_num, self.ratio_den)
  }

  /// Timestamps, in ticks, of a frame lasting `duration` timebase units.
  pub fn frame_ticks(&self, pts: u64, duration: u64) -> (i64, i64) {
    (self.to_ticks(pts), self.to_ticks(pts + duration.max(1)))
  }

  /// Records an input frame; the earliest start is the origin of the
  /// averaging window.
  pub fn note_input(&mut self, ts_start: i64) {
    match self.first_time_stamp_ever {
      Some(first) if first <= ts_start => {}
      _ => {
        self.first_time_stamp_ever = Some(ts_start);
        self.last_end_time_stamp_seen = ts_start;
      }
    }
  }

  pub const fn framerate(&self) -> f64 {
    self.ref_framerate
  }

  /// Folds a shown frame into the estimate. Returns the new framerate when
  /// the frame had a usable duration.
  pub fn update(&mut self, ts_start: i64, ts_end: i64) -> Option<f64> {
    let first = *self.first_time_stamp_ever.get_or_insert(ts_start);
    let (this_duration, step) = if ts_start == first {
      (ts_end - ts_start, true)
    } else {
      let last_duration =
        self.last_end_time_stamp_seen - self.last_time_stamp_seen;
      let this_duration = ts_end - self.last_end_time_stamp_seen;
      let step = last_duration != 0
        && (this_duration - last_duration) * 10 / last_duration != 0;
      (this_duration, step)
    };
    self.last_time_stamp_seen = ts_start;
    self.last_end_time_stamp_seen = ts_end;

    if this_duration == 0 {
      return None;
    }
    let ticks = TICKS_PER_SECOND as f64;
    if step {
      self.ref_framerate = ticks / this_duration as f64;
    } else {
      let interval = ((ts_end - first) as f64).min(ticks);
      let mut avg_duration = ticks / self.ref_framerate;
      avg_duration *= interval - avg_duration + this_duration as f64;
      avg_duration /= interval;
      self.ref_framerate = ticks / avg_duration;
    }
    self.ref_framerate = sanitize_framerate(self.ref_framerate);
    Some(self.ref_framerate)
  }
}

fn gcd(mut a: i64, mut b: i64) -> i64 {
  while b != 0 {
    (a, b) = (b, a % b);
  }
  a.max(1)
}

#[cfg(test)]
mod test {
  use super::*;

  #[test]
  fn rescale_does_not_overflow() {
    assert_eq!(rescale(4000, 256_000, 1000), 1_024_000);
    assert_eq!(rescale(i64::MAX / 2, 4, 8), i64::MAX / 4);
    assert_eq!(rescale(5, 1, 0), 0);
  }

  #[test]
  fn low_framerates_fall_back() {
    assert_eq!(sanitize_framerate(0.05), FALLBACK_FRAMERATE);
    assert_eq!(sanitize_framerate(f64::NAN), FALLBACK_FRAMERATE);
    assert_eq!(sanitize_framerate(12.5), 12.5);
  }

  #[test]
  fn ticks_follow_the_timebase() {
    let est = FramerateEstimator::new(Rational::new(1, 25));
    assert_eq!(est.to_ticks(1), 400_000);
    assert_eq!(est.frame_ticks(25, 1), (TICKS_PER_SECOND, 10_400_000));
    let ntsc = FramerateEstimator::new(Rational::new(1001, 30000));
    assert_eq!(ntsc.to_ticks(30), 10_010_000);
  }

  #[test]
  fn steady_input_keeps_the_rate() {
    let mut est = FramerateEstimator::new(Rational::new(1, 25));
    for pts in 0..50 {
      let (start, end) = est.frame_ticks(pts, 1);
      est.note_input(start);
      let fps = est.update(start, end).unwrap();
      assert!((fps - 25.0).abs() < 1e-6);
    }
  }

  // Milliseconds to ticks.
  const fn ms(v: i64) -> i64 {
    v * 10_000
  }

  #[test]
  fn large_duration_change_steps() {
    let mut est = FramerateEstimator::new(Rational::new(1, 1000));
    est.update(ms(0), ms(40));
    assert!((est.framerate() - 25.0).abs() < 1e-6);
    est.update(ms(40), ms(80));
    // Twice the duration is followed at once.
    assert!((est.update(ms(80), ms(160)).unwrap() - 12.5).abs() < 1e-6);
  }

  #[test]
  fn small_duration_change_is_averaged() {
    let mut est = FramerateEstimator::new(Rational::new(1, 1000));
    for i in 0..25 {
      est.update(ms(i * 40), ms((i + 1) * 40));
    }
    let fps = est.update(ms(1000), ms(1041)).unwrap();
    assert!(fps < 25.0 && fps > 24.9);
  }

  #[test]
  fn zero_duration_is_ignored() {
    let mut est = FramerateEstimator::new(Rational::new(1, 30));
    assert_eq!(est.update(0, 0), None);
    assert_eq!(est.framerate(), 30.0);
  }
}
