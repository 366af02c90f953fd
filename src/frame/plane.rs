// Copyright (c) 2017-2024, The rav1e contributors. All rights reserved
//
// This source code is subject to the terms of the BSD 2 Clause License and
// the Alliance for Open Media Patent License 1.0. If the BSD 2 Clause License
// was not distributed with this source code in the LICENSE file, you can
// obtain it at www.aomedia.org/license/software. If the Alliance for Open
// Media Patent License 1.0 was not distributed with this source code in the
// PATENTS file, you can obtain it at www.aomedia.org/license/patent.

use std::fmt::{Debug, Formatter};
use std::iter::FusedIterator;
use std::mem;
use std::ops::Range;

use crate::util::*;

/// Plane-specific configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlaneConfig {
  /// Data stride.
  pub stride: usize,
  /// Allocated height in pixels.
  pub alloc_height: usize,
  /// Width in pixels.
  pub width: usize,
  /// Height in pixels.
  pub height: usize,
  /// Decimator along the X axis.
  ///
  /// For example, for chroma planes in a 4:2:0 configuration this would be 1.
  pub xdec: usize,
  /// Decimator along the Y axis.
  ///
  /// For example, for chroma planes in a 4:2:0 configuration this would be 1.
  pub ydec: usize,
  /// Number of padding pixels on the right.
  pub xpad: usize,
  /// Number of padding pixels on the bottom.
  pub ypad: usize,
  /// X where the data starts.
  pub xorigin: usize,
  /// Y where the data starts.
  pub yorigin: usize,
}

impl PlaneConfig {
  /// Stride alignment in bytes.
  const STRIDE_ALIGNMENT_LOG2: usize = 5;

  #[inline]
  pub fn new(
    width: usize, height: usize, xdec: usize, ydec: usize, xpad: usize,
    ypad: usize, type_size: usize,
  ) -> Self {
    let xorigin =
      xpad.align_power_of_two(Self::STRIDE_ALIGNMENT_LOG2 + 1 - type_size);
    let yorigin = ypad;
    let stride = (xorigin + width + xpad)
      .align_power_of_two(Self::STRIDE_ALIGNMENT_LOG2 + 1 - type_size);
    let alloc_height = yorigin + height + ypad;

    PlaneConfig {
      stride,
      alloc_height,
      width,
      height,
      xdec,
      ydec,
      xpad,
      ypad,
      xorigin,
      yorigin,
    }
  }
}

/// Absolute offset in pixels inside a plane
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PlaneOffset {
  pub x: isize,
  pub y: isize,
}

/// One data plane of a frame.
///
/// The visible area starts at `(xorigin, yorigin)` inside a padded
/// allocation. The padding is the border motion compensation may read.
#[derive(Clone, PartialEq, Eq)]
pub struct Plane<T: Pixel> {
  pub data: Vec<T>,
  /// Plane configuration.
  pub cfg: PlaneConfig,
}

impl<T: Pixel> Debug for Plane<T> {
  fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
    write!(f, "Plane {{ data: [{}, ...], cfg: {:?} }}", self.data[0], self.cfg)
  }
}

impl<T: Pixel> Plane<T> {
  /// Allocates and returns a new plane.
  pub fn new(
    width: usize, height: usize, xdec: usize, ydec: usize, xpad: usize,
    ypad: usize,
  ) -> Self {
    let cfg = PlaneConfig::new(
      width,
      height,
      xdec,
      ydec,
      xpad,
      ypad,
      mem::size_of::<T>(),
    );
    let data = vec![T::default(); cfg.stride * cfg.alloc_height];

    Plane { data, cfg }
  }

  /// Extends the borders of the plane by replicating the outermost
  /// visible samples of a `w`×`h` luma-sized area.
  pub fn pad(&mut self, w: usize, h: usize) {
    let xorigin = self.cfg.xorigin;
    let yorigin = self.cfg.yorigin;
    let stride = self.cfg.stride;
    let alloc_height = self.cfg.alloc_height;
    let width = (w + self.cfg.xdec) >> self.cfg.xdec;
    let height = (h + self.cfg.ydec) >> self.cfg.ydec;

    if xorigin > 0 {
      for y in 0..height {
        let base = (yorigin + y) * stride;
        let fill_val = self.data[base + xorigin];
        for val in &mut self.data[base..base + xorigin] {
          *val = fill_val;
        }
      }
    }

    if xorigin + width < stride {
      for y in 0..height {
        let base = (yorigin + y) * stride + xorigin + width;
        let fill_val = self.data[base - 1];
        for val in &mut self.data[base..base + stride - (xorigin + width)] {
          *val = fill_val;
        }
      }
    }

    if yorigin > 0 {
      let (top, bottom) = self.data.split_at_mut(yorigin * stride);
      let src = &bottom[..stride];
      for y in 0..yorigin {
        let dst = &mut top[y * stride..(y + 1) * stride];
        dst.copy_from_slice(src);
      }
    }

    if yorigin + height < alloc_height {
      let (top, bottom) = self.data.split_at_mut((yorigin + height) * stride);
      let src = &top[(yorigin + height - 1) * stride..];
      for y in 0..alloc_height - (yorigin + height) {
        let dst = &mut bottom[y * stride..(y + 1) * stride];
        dst.copy_from_slice(src);
      }
    }
  }

  /// Minimally test that the plane has been padded.
  #[cfg(test)]
  pub fn probe_padding(&self, w: usize, h: usize) -> bool {
    let PlaneConfig {
      xorigin, yorigin, stride, alloc_height, xdec, ydec, ..
    } = self.cfg;
    let width = (w + xdec) >> xdec;
    let height = (h + ydec) >> ydec;
    let corner = (yorigin + height - 1) * stride + xorigin + width - 1;
    let corner_value = self.data[corner];

    self.data[(yorigin + height) * stride - 1] == corner_value
      && self.data[(alloc_height - 1) * stride + xorigin + width - 1]
        == corner_value
      && self.data[alloc_height * stride - 1] == corner_value
  }

  pub fn slice(&self, po: PlaneOffset) -> PlaneSlice<'_, T> {
    PlaneSlice { plane: self, x: po.x, y: po.y }
  }

  #[inline]
  fn index(&self, x: usize, y: usize) -> usize {
    (y + self.cfg.yorigin) * self.cfg.stride + (x + self.cfg.xorigin)
  }

  #[inline]
  fn row_range(&self, x: isize, y: isize) -> Range<usize> {
    debug_assert!(self.cfg.yorigin as isize + y >= 0);
    debug_assert!(self.cfg.xorigin as isize + x >= 0);
    let base_y = (self.cfg.yorigin as isize + y) as usize;
    let base_x = (self.cfg.xorigin as isize + x) as usize;
    let base = base_y * self.cfg.stride + base_x;
    let width = self.cfg.stride - base_x;
    base..base + width
  }

  /// Returns the pixel at the given coordinates.
  pub fn p(&self, x: usize, y: usize) -> T {
    self.data[self.index(x, y)]
  }

  /// Returns mutable plane data starting from the origin.
  #[cfg(test)]
  pub fn data_origin_mut(&mut self) -> &mut [T] {
    let i = self.index(0, 0);
    &mut self.data[i..]
  }

  /// Copies the `w`×`h` rectangle at `(x, y)` of `src` into the same
  /// position of this plane, cropped to the visible area of both planes.
  pub fn copy_rect(
    &mut self, src: &Plane<T>, x: usize, y: usize, w: usize, h: usize,
  ) {
    let width = self.cfg.width.min(src.cfg.width);
    let height = self.cfg.height.min(src.cfg.height);
    if x >= width || y >= height {
      return;
    }
    let w = w.min(width - x);
    let h = h.min(height - y);

    for row in y..y + h {
      let s = src.index(x, row);
      let d = self.index(x, row);
      self.data[d..d + w].copy_from_slice(&src.data[s..s + w]);
    }
  }
}

#[derive(Clone, Copy, Debug)]
pub struct PlaneSlice<'a, T: Pixel> {
  pub plane: &'a Plane<T>,
  pub x: isize,
  pub y: isize,
}

pub struct RowsIter<'a, T: Pixel> {
  plane: &'a Plane<T>,
  x: isize,
  y: isize,
  remaining: usize,
}

impl<'a, T: Pixel> Iterator for RowsIter<'a, T> {
  type Item = &'a [T];

  fn next(&mut self) -> Option<Self::Item> {
    if self.remaining > 0 {
      let range = self.plane.row_range(self.x, self.y);
      self.y += 1;
      self.remaining -= 1;
      Some(&self.plane.data[range])
    } else {
      None
    }
  }

  fn size_hint(&self) -> (usize, Option<usize>) {
    (self.remaining, Some(self.remaining))
  }
}

impl<'a, T: Pixel> ExactSizeIterator for RowsIter<'a, T> {}
impl<'a, T: Pixel> FusedIterator for RowsIter<'a, T> {}

impl<'a, T: Pixel> PlaneSlice<'a, T> {
  /// Iterates over the rows below this position, down to the bottom of the
  /// allocation.
  pub fn rows_iter(&self) -> RowsIter<'a, T> {
    let remaining = (self.plane.cfg.alloc_height as isize
      - self.plane.cfg.yorigin as isize
      - self.y)
      .max(0) as usize;
    RowsIter { plane: self.plane, x: self.x, y: self.y, remaining }
  }

  /// Returns `true` if a `w`×`h` block at this position lies inside the
  /// allocation, border included.
  pub fn fits(&self, w: usize, h: usize) -> bool {
    let cfg = &self.plane.cfg;
    let x0 = cfg.xorigin as isize + self.x;
    let y0 = cfg.yorigin as isize + self.y;
    x0 >= 0
      && y0 >= 0
      && x0 as usize + w <= cfg.stride
      && y0 as usize + h <= cfg.alloc_height
  }

  #[cfg(test)]
  pub fn p(&self, add_x: usize, add_y: usize) -> T {
    let new_y =
      (self.y + add_y as isize + self.plane.cfg.yorigin as isize) as usize;
    let new_x =
      (self.x + add_x as isize + self.plane.cfg.xorigin as isize) as usize;
    self.plane.data[new_y * self.plane.cfg.stride + new_x]
  }
}

#[cfg(test)]
pub mod test {
  use super::*;

  #[rustfmt::skip]
  fn bordered() -> Plane<u8> {
    Plane::<u8> {
      data: vec![
        0, 0, 0, 0, 0, 0, 0, 0,
        0, 0, 0, 0, 0, 0, 0, 0,
        0, 0, 0, 0, 0, 0, 0, 0,
        0, 0, 1, 2, 3, 4, 0, 0,
        0, 0, 8, 7, 6, 5, 0, 0,
        0, 0, 9, 8, 7, 6, 0, 0,
        0, 0, 2, 3, 4, 5, 0, 0,
        0, 0, 0, 0, 0, 0, 0, 0,
        0, 0, 0, 0, 0, 0, 0, 0,
      ],
      cfg: PlaneConfig {
        stride: 8,
        alloc_height: 9,
        width: 4,
        height: 4,
        xdec: 0,
        ydec: 0,
        xpad: 2,
        ypad: 2,
        xorigin: 2,
        yorigin: 3,
      },
    }
  }

  #[test]
  fn pad_replicates_edges() {
    let mut plane = bordered();
    plane.pad(4, 4);

    #[rustfmt::skip]
    let expected: &[u8] = &[
      1, 1, 1, 2, 3, 4, 4, 4,
      1, 1, 1, 2, 3, 4, 4, 4,
      1, 1, 1, 2, 3, 4, 4, 4,
      1, 1, 1, 2, 3, 4, 4, 4,
      8, 8, 8, 7, 6, 5, 5, 5,
      9, 9, 9, 8, 7, 6, 6, 6,
      2, 2, 2, 3, 4, 5, 5, 5,
      2, 2, 2, 3, 4, 5, 5, 5,
      2, 2, 2, 3, 4, 5, 5, 5,
    ];

    assert_eq!(expected, &plane.data[..]);
    assert!(plane.probe_padding(4, 4));
  }

  #[test]
  fn unpadded_border_is_detected() {
    let plane = bordered();
    assert!(!plane.probe_padding(4, 4));
  }

  #[test]
  fn copy_rect_is_cropped() {
    let src = bordered();
    let mut dst = Plane::<u8> { data: vec![0; 72], cfg: src.cfg.clone() };

    dst.copy_rect(&src, 2, 1, 16, 16);

    assert_eq!(dst.p(1, 1), 0);
    assert_eq!(dst.p(2, 1), 6);
    assert_eq!(dst.p(3, 1), 5);
    assert_eq!(dst.p(2, 3), 4);
    assert_eq!(dst.p(3, 3), 5);
    assert_eq!(dst.p(0, 0), 0);
  }

  #[test]
  fn slice_reads_into_border() {
    let mut plane = bordered();
    plane.pad(4, 4);
    let s = plane.slice(PlaneOffset { x: -2, y: -3 });

    assert!(s.fits(8, 9));
    assert!(!s.fits(9, 9));
    assert_eq!(s.p(0, 0), 1);
    assert_eq!(s.p(2, 5), 9);
  }

  #[test]
  fn rows_run_to_the_bottom_of_the_allocation() {
    let plane = bordered();
    let s = plane.slice(PlaneOffset { x: 0, y: 1 });
    let rows: Vec<_> = s.rows_iter().collect();

    assert_eq!(rows.len(), 5);
    assert_eq!(&rows[0][..4], &[8, 7, 6, 5]);
    assert_eq!(&rows[2][..4], &[2, 3, 4, 5]);
    assert_eq!(rows[0].len(), 6);
  }
}
