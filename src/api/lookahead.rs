// Copyright (c) 2018-2024, The rav1e contributors. All rights reserved
//
// This source code is subject to the terms of the BSD 2 Clause License and
// the Alliance for Open Media Patent License 1.0. If the BSD 2 Clause License
// was not distributed with this source code in the LICENSE file, you can
// obtain it at www.aomedia.org/license/software. If the Alliance for Open
// Media Patent License 1.0 was not distributed with this source code in the
// PATENTS file, you can obtain it at www.aomedia.org/license/patent.

use log::warn;

use crate::api::MAX_LAG_IN_FRAMES;
use crate::frame::{Frame, FrameParameters, MB_SIZE};
use crate::util::Pixel;

use std::sync::Arc;

/// Direction of a lookahead peek.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PeekDirection {
  /// Frames not yet popped, oldest first.
  Forward,
  /// The frame popped last.
  Backward,
}

/// A source frame waiting in the lookahead queue.
#[derive(Clone, Debug)]
pub struct LookaheadEntry<T: Pixel> {
  /// Copy of the source frame, borders extended.
  pub img: Arc<Frame<T>>,
  /// Start of the frame, in ticks.
  pub ts_start: i64,
  /// End of the frame, in ticks.
  pub ts_end: i64,
  /// Per-frame parameters sent with the frame.
  pub params: FrameParameters,
  /// Position of the frame in the input.
  pub input_frameno: u64,
}

/// Bounded ring of source frames.
///
/// Slots are allocated once and overwritten on every push. One slot is
/// always kept out of reach of `push`, so the frame popped last stays valid
/// until the next pop.
#[derive(Clone, Debug)]
pub struct LookaheadQueue<T: Pixel> {
  buf: Vec<LookaheadEntry<T>>,
  max_sz: usize,
  sz: usize,
  read_idx: usize,
  write_idx: usize,
  popped_any: bool,
  next_input_frameno: u64,
}

impl<T: Pixel> LookaheadQueue<T> {
  /// Allocates a queue holding up to `depth` frames of the given size.
  pub fn new(width: usize, height: usize, depth: usize) -> Self {
    let clamped = depth.clamp(1, MAX_LAG_IN_FRAMES);
    if depth > MAX_LAG_IN_FRAMES {
      warn!("lookahead depth {} clamped to {}", depth, clamped);
    }
    let max_sz = clamped + 1;
    // Frames are stored with macroblock aligned dimensions.
    let width = (width + MB_SIZE - 1) & !(MB_SIZE - 1);
    let height = (height + MB_SIZE - 1) & !(MB_SIZE - 1);

    let buf = (0..max_sz)
      .map(|_| LookaheadEntry {
        img: Arc::new(Frame::new(width, height)),
        ts_start: 0,
        ts_end: 0,
        params: FrameParameters::default(),
        input_frameno: 0,
      })
      .collect();

    LookaheadQueue {
      buf,
      max_sz,
      sz: 0,
      read_idx: 0,
      write_idx: 0,
      popped_any: false,
      next_input_frameno: 0,
    }
  }

  /// Number of frames waiting.
  pub const fn len(&self) -> usize {
    self.sz
  }

  /// No frame is waiting.
  pub const fn is_empty(&self) -> bool {
    self.sz == 0
  }

  /// Slots in the ring, one more than the requested depth.
  pub const fn max_sz(&self) -> usize {
    self.max_sz
  }

  /// Frames the queue holds before `pop` releases one.
  pub const fn depth(&self) -> usize {
    self.max_sz - 1
  }

  /// Queues a copy of `src`. Returns `true` when the queue is full and the
  /// frame was dropped.
  ///
  /// With a depth of one, an `active_map` of one flag per macroblock and no
  /// per-frame parameters, only the active macroblocks are copied over the
  /// previous contents of the slot.
  pub fn push(
    &mut self, src: &Frame<T>, ts_start: i64, ts_end: i64,
    params: FrameParameters, active_map: Option<&[bool]>,
  ) -> bool {
    if self.sz + 2 > self.max_sz {
      return true;
    }
    let partial = self.max_sz == 2 && params.is_empty();

    let entry = &mut self.buf[self.write_idx];
    let img = Arc::make_mut(&mut entry.img);
    match active_map {
      Some(active_map) if partial => img.copy_active_region(src, active_map),
      _ => img.copy_and_extend(src),
    }
    entry.ts_start = ts_start;
    entry.ts_end = ts_end;
    entry.params = params;
    entry.input_frameno = self.next_input_frameno;

    self.next_input_frameno += 1;
    self.sz += 1;
    self.write_idx = (self.write_idx + 1) % self.max_sz;
    false
  }

  /// Takes the oldest frame once the queue is full, or whenever `drain`
  /// is set.
  pub fn pop(&mut self, drain: bool) -> Option<&LookaheadEntry<T>> {
    if self.sz != 0 && (drain || self.sz == self.max_sz - 1) {
      let idx = self.read_idx;
      self.read_idx = (self.read_idx + 1) % self.max_sz;
      self.sz -= 1;
      self.popped_any = true;
      Some(&self.buf[idx])
    } else {
      None
    }
  }

  /// Looks at a queued frame without taking it. `Forward` reaches the
  /// `index`-th waiting frame; `Backward` only supports `index == 1`, the
  /// frame popped last.
  pub fn peek(
    &self, index: usize, direction: PeekDirection,
  ) -> Option<&LookaheadEntry<T>> {
    match direction {
      PeekDirection::Forward => {
        if index >= self.max_sz - 1 || index >= self.sz {
          return None;
        }
        Some(&self.buf[(self.read_idx + index) % self.max_sz])
      }
      PeekDirection::Backward => {
        if index != 1 || !self.popped_any {
          return None;
        }
        let idx = if self.read_idx == 0 {
          self.max_sz - 1
        } else {
          self.read_idx - 1
        };
        Some(&self.buf[idx])
      }
    }
  }
}
