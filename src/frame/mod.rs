// Copyright (c) 2018-2024, The rav1e contributors. All rights reserved
//
// This source code is subject to the terms of the BSD 2 Clause License and
// the Alliance for Open Media Patent License 1.0. If the BSD 2 Clause License
// was not distributed with this source code in the LICENSE file, you can
// obtain it at www.aomedia.org/license/software. If the Alliance for Open
// Media Patent License 1.0 was not distributed with this source code in the
// PATENTS file, you can obtain it at www.aomedia.org/license/patent.

use num_derive::FromPrimitive;

use crate::util::*;

mod plane;
pub use plane::*;

/// Border around every reference-capable plane, in luma pixels.
pub const VP8_BORDER_IN_PIXELS: usize = 32;

pub const MB_SIZE_LOG2: usize = 4;
pub const MB_SIZE: usize = 1 << MB_SIZE_LOG2;

/// Override the frame type decision
///
/// Only certain frame types can be selected.
#[derive(Debug, PartialEq, Eq, Clone, Copy, Default, FromPrimitive)]
#[repr(C)]
pub enum FrameTypeOverride {
  /// Do not force any decision.
  #[default]
  No,
  /// Force the frame to be a Keyframe.
  Key,
}

/// Optional per-frame encoder parameters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FrameParameters {
  /// Force emitted frame to be of the type selected
  pub frame_type_override: FrameTypeOverride,
}

impl FrameParameters {
  /// Returns `true` when no per-frame request is attached.
  pub fn is_empty(&self) -> bool {
    self.frame_type_override == FrameTypeOverride::No
  }
}

/// One 4:2:0 video frame.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct Frame<T: Pixel> {
  /// Planes constituting the frame.
  pub planes: [Plane<T>; 3],
}

impl<T: Pixel> Frame<T> {
  /// Creates a new frame with the given luma dimensions.
  ///
  /// Allocates data for the planes, including a border of
  /// [`VP8_BORDER_IN_PIXELS`] luma pixels.
  pub fn new(width: usize, height: usize) -> Self {
    let luma_padding = VP8_BORDER_IN_PIXELS;
    let chroma_width = (width + 1) >> 1;
    let chroma_height = (height + 1) >> 1;
    let chroma_padding = luma_padding >> 1;

    Frame {
      planes: [
        Plane::new(width, height, 0, 0, luma_padding, luma_padding),
        Plane::new(
          chroma_width,
          chroma_height,
          1,
          1,
          chroma_padding,
          chroma_padding,
        ),
        Plane::new(
          chroma_width,
          chroma_height,
          1,
          1,
          chroma_padding,
          chroma_padding,
        ),
      ],
    }
  }

  pub fn width(&self) -> usize {
    self.planes[0].cfg.width
  }

  pub fn height(&self) -> usize {
    self.planes[0].cfg.height
  }

  pub fn mb_cols(&self) -> usize {
    self.width().align_power_of_two_and_shift(MB_SIZE_LOG2)
  }

  pub fn mb_rows(&self) -> usize {
    self.height().align_power_of_two_and_shift(MB_SIZE_LOG2)
  }

  pub fn pad(&mut self, w: usize, h: usize) {
    for p in self.planes.iter_mut() {
      p.pad(w, h);
    }
  }

  /// Replicates the visible edges of every plane into the border.
  pub fn extend_borders(&mut self) {
    let (w, h) = (self.width(), self.height());
    self.pad(w, h);
  }

  /// Copies the visible area of `src` and extends the result into the
  /// border, replicating from the edges of `src`.
  pub fn copy_and_extend(&mut self, src: &Frame<T>) {
    let w = src.width().min(self.width());
    let h = src.height().min(self.height());
    for (dst, src) in self.planes.iter_mut().zip(src.planes.iter()) {
      let xdec = dst.cfg.xdec;
      let ydec = dst.cfg.ydec;
      dst.copy_rect(src, 0, 0, (w + xdec) >> xdec, (h + ydec) >> ydec);
    }
    self.pad(w, h);
  }

  /// Copies only the macroblocks flagged in `active_map`, one row-major
  /// flag per macroblock of `src`, then extends the borders.
  pub fn copy_active_region(&mut self, src: &Frame<T>, active_map: &[bool]) {
    let mb_rows = src.mb_rows();
    let mb_cols = src.mb_cols();
    debug_assert!(active_map.len() >= mb_rows * mb_cols);

    for (mb_row, row_map) in
      active_map.chunks(mb_cols).take(mb_rows).enumerate()
    {
      let mut col = 0;
      loop {
        while col < mb_cols && !row_map[col] {
          col += 1;
        }
        if col == mb_cols {
          break;
        }
        let mut active_end = col;
        while active_end < mb_cols && row_map[active_end] {
          active_end += 1;
        }
        self.copy_rect(
          src,
          mb_row << MB_SIZE_LOG2,
          col << MB_SIZE_LOG2,
          MB_SIZE,
          (active_end - col) << MB_SIZE_LOG2,
        );
        col = active_end;
      }
    }

    let w = src.width().min(self.width());
    let h = src.height().min(self.height());
    self.pad(w, h);
  }

  fn copy_rect(
    &mut self, src: &Frame<T>, row: usize, col: usize, rows: usize,
    cols: usize,
  ) {
    for (dst, src) in self.planes.iter_mut().zip(src.planes.iter()) {
      let xdec = dst.cfg.xdec;
      let ydec = dst.cfg.ydec;
      dst.copy_rect(src, col >> xdec, row >> ydec, cols >> xdec, rows >> ydec);
    }
  }
}

#[cfg(test)]
mod test {
  use super::*;

  fn ramp(w: usize, h: usize) -> Frame<u8> {
    let mut f = Frame::<u8>::new(w, h);
    for p in f.planes.iter_mut() {
      let (pw, ph) = (p.cfg.width, p.cfg.height);
      for y in 0..ph {
        for x in 0..pw {
          let i = (y + p.cfg.yorigin) * p.cfg.stride + x + p.cfg.xorigin;
          p.data[i] = ((x + 3 * y) & 255) as u8;
        }
      }
    }
    f
  }

  #[test]
  fn chroma_is_half_size() {
    let f = Frame::<u8>::new(35, 17);
    assert_eq!(f.planes[1].cfg.width, 18);
    assert_eq!(f.planes[2].cfg.height, 9);
    assert_eq!(f.mb_cols(), 3);
    assert_eq!(f.mb_rows(), 2);
  }

  #[test]
  fn extended_border_matches_edges() {
    let mut f = ramp(32, 32);
    f.extend_borders();
    for p in f.planes.iter() {
      assert!(p.probe_padding(32, 32));
    }
    let luma = &f.planes[0];
    let s = luma.slice(PlaneOffset { x: -16, y: -16 });
    assert_eq!(s.p(0, 0), luma.p(0, 0));
    let s = luma.slice(PlaneOffset { x: 40, y: 5 });
    assert_eq!(s.p(0, 0), luma.p(31, 5));
  }

  #[test]
  fn active_region_copies_only_flagged_macroblocks() {
    let src = ramp(48, 32);
    let mut dst = Frame::<u8>::new(48, 32);

    #[rustfmt::skip]
    let map = [
      false, true, true,
      false, false, true,
    ];
    dst.copy_active_region(&src, &map);

    let (s, d) = (&src.planes[0], &dst.planes[0]);
    assert_eq!(d.p(0, 0), 0);
    assert_eq!(d.p(15, 15), 0);
    assert_eq!(d.p(16, 0), s.p(16, 0));
    assert_eq!(d.p(47, 15), s.p(47, 15));
    assert_eq!(d.p(20, 20), 0);
    assert_eq!(d.p(40, 20), s.p(40, 20));
    let (s, d) = (&src.planes[1], &dst.planes[1]);
    assert_eq!(d.p(9, 3), s.p(9, 3));
    assert_eq!(d.p(3, 3), 0);
  }
}
