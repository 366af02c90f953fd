// Copyright (c) 2018-2024, The rav1e contributors. All rights reserved
//
// This source code is subject to the terms of the BSD 2 Clause License and
// the Alliance for Open Media Patent License 1.0. If the BSD 2 Clause License
// was not distributed with this source code in the LICENSE file, you can
// obtain it at www.aomedia.org/license/software. If the Alliance for Open
// Media Patent License 1.0 was not distributed with this source code in the
// PATENTS file, you can obtain it at www.aomedia.org/license/patent.

use log::trace;

use crate::frame::*;
use crate::util::Pixel;

pub const NUM_FRAME_BUFFERS: usize = 4;

#[derive(PartialEq, Eq, PartialOrd, Ord, Copy, Clone, Debug, Hash)]
pub enum RefFrame {
  Intra = 0,
  Last = 1,
  Golden = 2,
  AltRef = 3,
}

impl RefFrame {
  pub const COUNT: usize = 4;
  pub const INTER: [RefFrame; 3] =
    [RefFrame::Last, RefFrame::Golden, RefFrame::AltRef];
}

/// Source of a buffer-to-buffer role copy.
#[derive(PartialEq, Eq, Copy, Clone, Debug, Default)]
pub enum CopyBuffer {
  #[default]
  None,
  FromLast,
  FromGolden,
  FromAltRef,
}

/// Reference updates applied once a frame has been coded.
#[derive(PartialEq, Eq, Copy, Clone, Debug, Default)]
pub struct RefreshFlags {
  pub last: bool,
  pub golden: bool,
  pub alt_ref: bool,
  /// Either [`CopyBuffer::FromLast`] or [`CopyBuffer::FromAltRef`].
  pub copy_buffer_to_gf: CopyBuffer,
  /// Either [`CopyBuffer::FromLast`] or [`CopyBuffer::FromGolden`].
  pub copy_buffer_to_arf: CopyBuffer,
}

impl RefreshFlags {
  pub const KEY_FRAME: RefreshFlags = RefreshFlags {
    last: true,
    golden: true,
    alt_ref: true,
    copy_buffer_to_gf: CopyBuffer::None,
    copy_buffer_to_arf: CopyBuffer::None,
  };
}

/// Fixed set of physical frame buffers onto which the reference roles
/// are mapped.
///
/// A role change is an index update. The same buffer may back several
/// roles at once; its reference count tracks how many.
#[derive(Debug, Clone)]
pub struct FrameBufferPool<T: Pixel> {
  frames: [Frame<T>; NUM_FRAME_BUFFERS],
  ref_count: [u32; NUM_FRAME_BUFFERS],
  new_idx: usize,
  last_idx: usize,
  golden_idx: usize,
  alt_idx: usize,
}

impl<T: Pixel> FrameBufferPool<T> {
  pub fn new(width: usize, height: usize) -> Self {
    FrameBufferPool {
      frames: [
        Frame::new(width, height),
        Frame::new(width, height),
        Frame::new(width, height),
        Frame::new(width, height),
      ],
      ref_count: [0, 1, 1, 1],
      new_idx: 0,
      last_idx: 1,
      golden_idx: 2,
      alt_idx: 3,
    }
  }

  /// Claims the first unreferenced buffer.
  ///
  /// # Panics
  ///
  /// - If every buffer is still referenced, which means the role
  ///   bookkeeping is broken.
  pub fn get_free_fb(&mut self) -> usize {
    let idx = self
      .ref_count
      .iter()
      .position(|&c| c == 0)
      .unwrap_or_else(|| panic!("no free frame buffer: {:?}", self.ref_count));
    self.ref_count[idx] = 1;
    idx
  }

  /// Points `*idx` at `new_idx`, moving one reference along.
  fn ref_cnt_fb(ref_count: &mut [u32], idx: &mut usize, new_idx: usize) {
    if ref_count[*idx] > 0 {
      ref_count[*idx] -= 1;
    }
    *idx = new_idx;
    ref_count[new_idx] += 1;
  }

  /// Claims a buffer for the frame about to be coded.
  pub fn begin_frame(&mut self) -> usize {
    self.new_idx = self.get_free_fb();
    self.new_idx
  }

  /// Applies the reference updates of the frame just coded and releases
  /// the scratch reference to it. Returns the index of the buffer shown.
  pub fn swap_frame_buffers(&mut self, refresh: &RefreshFlags) -> usize {
    let rc = &mut self.ref_count;

    match refresh.copy_buffer_to_arf {
      CopyBuffer::FromLast => {
        Self::ref_cnt_fb(rc, &mut self.alt_idx, self.last_idx)
      }
      CopyBuffer::FromGolden => {
        Self::ref_cnt_fb(rc, &mut self.alt_idx, self.golden_idx)
      }
      CopyBuffer::None | CopyBuffer::FromAltRef => {}
    }

    match refresh.copy_buffer_to_gf {
      CopyBuffer::FromLast => {
        Self::ref_cnt_fb(rc, &mut self.golden_idx, self.last_idx)
      }
      CopyBuffer::FromAltRef => {
        Self::ref_cnt_fb(rc, &mut self.golden_idx, self.alt_idx)
      }
      CopyBuffer::None | CopyBuffer::FromGolden => {}
    }

    if refresh.golden {
      Self::ref_cnt_fb(rc, &mut self.golden_idx, self.new_idx);
    }
    if refresh.alt_ref {
      Self::ref_cnt_fb(rc, &mut self.alt_idx, self.new_idx);
    }

    let shown = if refresh.last {
      Self::ref_cnt_fb(rc, &mut self.last_idx, self.new_idx);
      self.last_idx
    } else {
      self.new_idx
    };

    rc[self.new_idx] -= 1;

    trace!(
      "buffers: last={} golden={} alt={} counts={:?}",
      self.last_idx,
      self.golden_idx,
      self.alt_idx,
      rc
    );

    shown
  }

  pub fn idx(&self, rf: RefFrame) -> usize {
    match rf {
      RefFrame::Intra => self.new_idx,
      RefFrame::Last => self.last_idx,
      RefFrame::Golden => self.golden_idx,
      RefFrame::AltRef => self.alt_idx,
    }
  }

  pub fn ref_count(&self, idx: usize) -> u32 {
    self.ref_count[idx]
  }

  pub fn frame(&self, idx: usize) -> &Frame<T> {
    &self.frames[idx]
  }

  /// The reference frame currently holding role `rf`.
  pub fn get(&self, rf: RefFrame) -> &Frame<T> {
    &self.frames[self.idx(rf)]
  }

  /// The buffer claimed by [`begin_frame`](Self::begin_frame).
  pub fn new_frame(&self) -> &Frame<T> {
    &self.frames[self.new_idx]
  }

  pub fn new_frame_mut(&mut self) -> &mut Frame<T> {
    &mut self.frames[self.new_idx]
  }

  /// Extends the borders of the frame just written. Must run before it is
  /// used as a motion compensation reference.
  pub fn extend_new_frame(&mut self) {
    self.frames[self.new_idx].extend_borders();
  }

  /// Distinct buffers that currently back at least one role.
  pub fn live_buffers(&self) -> usize {
    self.ref_count.iter().filter(|&&c| c > 0).count()
  }
}
