// Copyright (c) 2018-2024, The rav1e contributors. All rights reserved
//
// This source code is subject to the terms of the BSD 2 Clause License and
// the Alliance for Open Media Patent License 1.0. If the BSD 2 Clause License
// was not distributed with this source code in the LICENSE file, you can
// obtain it at www.aomedia.org/license/software. If the Alliance for Open
// Media Patent License 1.0 was not distributed with this source code in the
// PATENTS file, you can obtain it at www.aomedia.org/license/patent.
#![deny(missing_docs)]

use thiserror::Error;

use crate::context::{EntropyContext, ModeCounts};
use crate::encoder::{CopyBuffer, RefFrame, RefreshFlags};
use crate::frame::{Frame, FrameParameters};
use crate::me::{FrameMotion, MotionVector};
use crate::serialize::{Deserialize, Serialize};
use crate::util::Pixel;

use std::fmt;
use std::sync::Arc;

/// A rational number.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(C)]
pub struct Rational {
  /// Numerator.
  pub num: u64,
  /// Denominator.
  pub den: u64,
}

impl Rational {
  /// Creates a rational number from the given numerator and denominator.
  pub const fn new(num: u64, den: u64) -> Self {
    Rational { num, den }
  }

  /// Returns a rational number that is the reciprocal of the given one.
  pub const fn from_reciprocal(reciprocal: Self) -> Self {
    Rational { num: reciprocal.den, den: reciprocal.num }
  }

  /// Returns the rational number as a floating-point number.
  pub fn as_f64(self) -> f64 {
    self.num as f64 / self.den as f64
  }
}

#[cfg(feature = "serialize")]
impl serde::Serialize for Rational {
  fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
  where
    S: serde::Serializer,
  {
    (self.num, self.den).serialize(serializer)
  }
}

#[cfg(feature = "serialize")]
impl<'a> serde::Deserialize<'a> for Rational {
  fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
  where
    D: serde::Deserializer<'a>,
  {
    let (num, den) = serde::Deserialize::deserialize(deserializer)?;

    Ok(Rational::new(num, den))
  }
}

/// Possible types of a frame.
#[allow(non_camel_case_types)]
#[derive(Debug, Eq, PartialEq, Clone, Copy, Serialize, Deserialize)]
#[repr(C)]
pub enum FrameType {
  /// Key frame.
  KEY,
  /// Inter-frame.
  INTER,
}

impl FrameType {
  /// Index into per frame type tables.
  #[inline]
  pub const fn index(self) -> usize {
    self as usize
  }
}

impl fmt::Display for FrameType {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    use self::FrameType::*;
    match self {
      KEY => write!(f, "Key frame"),
      INTER => write!(f, "Inter frame"),
    }
  }
}

/// Everything the controller decided about the frame about to be coded.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FrameDecision {
  /// Position of the source frame in input order.
  pub input_frameno: u64,
  /// Key or inter frame.
  pub frame_type: FrameType,
  /// Quantizer index to code at, 0..=127.
  pub qindex: u8,
  /// Zero-bin widening applied on top of the quantizer.
  pub zbin_over_quant: i32,
  /// Reference roles updated once the frame is committed.
  pub refresh: RefreshFlags,
  /// `false` for hidden alt-ref frames.
  pub show_frame: bool,
  /// The source was already coded as the pending alt-ref frame.
  pub is_src_frame_alt_ref: bool,
  /// The key frame was requested by the caller.
  pub forced_key: bool,
  /// The frame is skipped and must not be coded.
  pub dropped: bool,
  /// Temporal layer of the frame.
  pub layer: usize,
  /// Size budget, in bits.
  pub target_bits: i64,
  /// Below this size the frame is re-encoded at a finer quantizer.
  pub undershoot_limit: i64,
  /// Above this size the frame is re-encoded at a coarser quantizer.
  pub overshoot_limit: i64,
  /// Re-encodes done so far.
  pub recodes: usize,
}

impl FrameDecision {
  /// Whether the frame becomes the new golden frame, by refresh or by copy.
  pub fn updates_golden(&self) -> bool {
    self.refresh.golden
      || self.refresh.copy_buffer_to_gf == CopyBuffer::FromAltRef
  }

  /// Whether the golden or alt-ref frame is updated.
  pub fn is_golden_or_alt_ref(&self) -> bool {
    self.updates_golden() || self.refresh.alt_ref
  }
}

/// Coding decision taken for one macroblock.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MbInfo {
  /// Reference the macroblock predicts from.
  pub ref_frame: RefFrame,
  /// Motion vector, in 1/8 pel.
  pub mv: MotionVector,
}

/// What the frame coder reports after coding one frame.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct EncodedFrame {
  /// Size of the coded frame, in bytes.
  pub size_bytes: usize,
  /// Mode and reference usage counts.
  pub counts: ModeCounts,
  /// Per macroblock decisions in raster order, may be empty.
  pub mb_info: Vec<MbInfo>,
}

/// A committed or dropped frame.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Packet {
  /// Position of the source frame in input order.
  pub input_frameno: u64,
  /// Key or inter frame.
  pub frame_type: FrameType,
  /// Quantizer index the frame was committed at.
  pub qindex: u8,
  /// Coded size in bytes, 0 for dropped frames.
  pub size_bytes: usize,
  /// Size budget the frame was coded against, in bits.
  pub target_bits: i64,
  /// `false` for hidden alt-ref frames.
  pub show_frame: bool,
  /// The frame was skipped.
  pub dropped: bool,
  /// Reference roles updated by the frame.
  pub refresh: RefreshFlags,
  /// Temporal layer of the frame.
  pub layer: usize,
  /// Re-encodes spent on the frame.
  pub recodes: usize,
  /// Decoder buffer level after the frame, in bits.
  pub buffer_level: i64,
}

impl fmt::Display for Packet {
  fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
    if self.dropped {
      return write!(f, "Frame {} - dropped", self.input_frameno);
    }
    write!(
      f,
      "Frame {} - {} - {} bytes - q {}",
      self.input_frameno, self.frame_type, self.size_bytes, self.qindex
    )
  }
}

/// Status that can be returned by [`Context`] functions.
///
/// [`Context`]: struct.Context.html
#[derive(Clone, Copy, Debug, Eq, PartialEq, Error)]
pub enum EncoderStatus {
  /// The encoder needs more data to produce an output packet.
  ///
  /// Emitted by [`Context::receive_packet()`] until the lookahead is full.
  ///
  /// [`Context::receive_packet()`]: struct.Context.html#method.receive_packet
  #[error("need more data")]
  NeedMoreData,
  /// There are enough frames in the queue.
  ///
  /// Emitted by [`Context::send_frame()`] when the lookahead is full, in
  /// which case the frame was dropped, or after the encoder was flushed.
  ///
  /// [`Context::send_frame()`]: struct.Context.html#method.send_frame
  #[error("enough data")]
  EnoughData,
  /// Every frame sent before the flush has been processed.
  #[error("limit reached")]
  LimitReached,
}

/// One attempt at coding a frame, handed to the [`FrameCoder`].
pub struct CodingFrame<'a, T: Pixel> {
  /// What to code and at which quantizer.
  pub decision: &'a FrameDecision,
  /// Source pixels.
  pub source: &'a Frame<T>,
  /// Motion found against the last frame, empty for key frames.
  pub motion: &'a FrameMotion,
  /// Probabilities and counters the coder reads and adapts.
  pub entropy: &'a mut EntropyContext,
  /// Buffer receiving the reconstruction.
  pub recon: &'a mut Frame<T>,
}

/// The pixel, transform and entropy coding stages of the encoder.
///
/// Called once per attempt; the entropy state is restored between
/// attempts, so an implementation may adapt it freely.
pub trait FrameCoder<T: Pixel> {
  /// Codes one attempt and reports its size and statistics.
  fn encode_frame(&mut self, frame: CodingFrame<'_, T>) -> EncodedFrame;
}

impl<T: Pixel, F> FrameCoder<T> for F
where
  F: FnMut(CodingFrame<'_, T>) -> EncodedFrame,
{
  fn encode_frame(&mut self, frame: CodingFrame<'_, T>) -> EncodedFrame {
    self(frame)
  }
}

/// A convenience trait for converting the various frame inputs of
/// [`Context::send_frame`] into the frame and its parameters.
///
/// Frames may come bare or wrapped in `Arc`, with or without per-frame
/// parameters; `None` flushes the encoder.
///
/// [`Context::send_frame`]: struct.Context.html#method.send_frame
pub trait IntoFrame<T: Pixel> {
  /// Converts the type into a tuple of frame and parameters.
  fn into(self) -> (Option<Arc<Frame<T>>>, Option<FrameParameters>);
}

impl<T: Pixel> IntoFrame<T> for Option<Arc<Frame<T>>> {
  fn into(self) -> (Option<Arc<Frame<T>>>, Option<FrameParameters>) {
    (self, None)
  }
}

impl<T: Pixel> IntoFrame<T> for Arc<Frame<T>> {
  fn into(self) -> (Option<Arc<Frame<T>>>, Option<FrameParameters>) {
    (Some(self), None)
  }
}

impl<T: Pixel> IntoFrame<T> for (Arc<Frame<T>>, FrameParameters) {
  fn into(self) -> (Option<Arc<Frame<T>>>, Option<FrameParameters>) {
    (Some(self.0), Some(self.1))
  }
}

impl<T: Pixel> IntoFrame<T> for Frame<T> {
  fn into(self) -> (Option<Arc<Frame<T>>>, Option<FrameParameters>) {
    (Some(Arc::new(self)), None)
  }
}

impl<T: Pixel> IntoFrame<T> for (Frame<T>, FrameParameters) {
  fn into(self) -> (Option<Arc<Frame<T>>>, Option<FrameParameters>) {
    (Some(Arc::new(self.0)), Some(self.1))
  }
}
