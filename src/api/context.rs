// Copyright (c) 2018-2024, The rav1e contributors. All rights reserved
//
// This source code is subject to the terms of the BSD 2 Clause License and
// the Alliance for Open Media Patent License 1.0. If the BSD 2 Clause License
// was not distributed with this source code in the LICENSE file, you can
// obtain it at www.aomedia.org/license/software. If the Alliance for Open
// Media Patent License 1.0 was not distributed with this source code in the
// PATENTS file, you can obtain it at www.aomedia.org/license/patent.
#![deny(missing_docs)]

use crate::api::config::*;
use crate::api::internal::*;
use crate::api::util::*;

use crate::frame::*;
use crate::gf::GoldenFrameScheduler;
use crate::rate::{BitsPerMb, RCState};
use crate::util::Pixel;

use rayon::ThreadPool;
use std::sync::Arc;

/// The encoder context.
///
/// Contains the control state of the encoder: the lookahead, the reference
/// buffers, the rate controller and the golden frame scheduler.
pub struct Context<T: Pixel> {
  pub(crate) inner: ContextInner<T>,
  pub(crate) config: Config,
  pub(crate) pool: Option<Arc<ThreadPool>>,
  pub(crate) is_flushing: bool,
}

impl<T: Pixel> Context<T> {
  /// Allocates and returns a new frame.
  ///
  /// # Examples
  ///
  /// ```
  /// use vp8ctl::prelude::*;
  ///
  /// # fn main() -> Result<(), InvalidConfig> {
  /// let cfg = Config::default();
  /// let ctx: Context<u8> = cfg.new_context()?;
  /// let frame = ctx.new_frame();
  /// # Ok(())
  /// # }
  /// ```
  #[inline]
  pub fn new_frame(&self) -> Frame<T> {
    Frame::new(self.config.enc.width, self.config.enc.height)
  }

  /// Sends the frame for encoding.
  ///
  /// Frames sent this way are one timebase unit long and follow each other
  /// without gaps.
  ///
  /// Passing `None` is equivalent to calling [`flush`].
  ///
  /// # Errors
  ///
  /// If this method is called with a frame after the encoder has been
  /// flushed, or while the lookahead is full, the
  /// [`EncoderStatus::EnoughData`] error is returned and the frame is not
  /// kept.
  ///
  /// # Examples
  ///
  /// ```
  /// use vp8ctl::prelude::*;
  ///
  /// # fn main() -> Result<(), Box<dyn std::error::Error>> {
  /// let cfg = Config::default();
  /// let mut ctx: Context<u8> = cfg.new_context()?;
  /// let f1 = ctx.new_frame();
  /// let f2 = f1.clone();
  /// let info =
  ///   FrameParameters { frame_type_override: FrameTypeOverride::Key };
  ///
  /// // Send the plain frame data
  /// ctx.send_frame(f1)?;
  /// # let _ = ctx.receive_packet(&mut |_: CodingFrame<'_, u8>| {
  /// #   EncodedFrame::default()
  /// # });
  /// // Send the data and the per-frame parameters
  /// // In this case the frame is forced to be a keyframe.
  /// ctx.send_frame((f2, info))?;
  /// // Flush the encoder, it is equivalent to a call to `flush()`
  /// ctx.send_frame(None)?;
  /// # Ok(())
  /// # }
  /// ```
  ///
  /// [`flush`]: #method.flush
  /// [`EncoderStatus::EnoughData`]: enum.EncoderStatus.html#variant.EnoughData
  #[inline]
  pub fn send_frame<F>(&mut self, frame: F) -> Result<(), EncoderStatus>
  where
    F: IntoFrame<T>,
  {
    let (frame, params) = frame.into();

    match frame {
      None => {
        self.flush();
        Ok(())
      }
      Some(_) if self.is_flushing => Err(EncoderStatus::EnoughData),
      Some(frame) => self.inner.send_frame(
        &frame,
        None,
        1,
        params.unwrap_or_default(),
        None,
      ),
    }
  }

  /// Sends a frame with explicit timing.
  ///
  /// `pts` and `duration` are in units of the configured time base. The
  /// frame rate the rate controller budgets for follows these timestamps.
  ///
  /// `active_map` holds one flag per macroblock, in raster order. With a
  /// lookahead of one frame and no per-frame parameters, only the active
  /// macroblocks of `frame` replace the previously queued pixels.
  ///
  /// # Errors
  ///
  /// Same as [`send_frame`].
  ///
  /// [`send_frame`]: #method.send_frame
  pub fn send_frame_at(
    &mut self, frame: &Frame<T>, pts: u64, duration: u64,
    params: FrameParameters, active_map: Option<&[bool]>,
  ) -> Result<(), EncoderStatus> {
    if self.is_flushing {
      return Err(EncoderStatus::EnoughData);
    }
    self.inner.send_frame(frame, Some(pts), duration, params, active_map)
  }

  /// Runs the control loop for the next frame, calling `coder` once per
  /// coding attempt.
  ///
  /// Frames are released once the lookahead is full, or one by one after
  /// the encoder has been flushed.
  ///
  /// # Errors
  ///
  /// - [`EncoderStatus::NeedMoreData`] while the lookahead fills up.
  /// - [`EncoderStatus::LimitReached`] once every frame sent before the
  ///   flush has been processed.
  ///
  /// # Examples
  ///
  /// ```
  /// use vp8ctl::prelude::*;
  ///
  /// # fn main() -> Result<(), Box<dyn std::error::Error>> {
  /// let cfg = Config::default();
  /// let mut ctx: Context<u8> = cfg.new_context()?;
  /// let frame = ctx.new_frame();
  ///
  /// ctx.send_frame(frame)?;
  /// ctx.flush();
  ///
  /// let mut coder = |_f: CodingFrame<'_, u8>| EncodedFrame {
  ///   size_bytes: 1000,
  ///   ..Default::default()
  /// };
  /// loop {
  ///   match ctx.receive_packet(&mut coder) {
  ///     Ok(_packet) => { /* Inspect the decision. */ }
  ///     Err(EncoderStatus::LimitReached) => break,
  ///     Err(err) => Err(err)?,
  ///   }
  /// }
  /// # Ok(())
  /// # }
  /// ```
  ///
  /// [`EncoderStatus::NeedMoreData`]: enum.EncoderStatus.html#variant.NeedMoreData
  /// [`EncoderStatus::LimitReached`]: enum.EncoderStatus.html#variant.LimitReached
  #[inline]
  pub fn receive_packet<C>(
    &mut self, coder: &mut C,
  ) -> Result<Packet, EncoderStatus>
  where
    C: FrameCoder<T> + Send,
  {
    let inner = &mut self.inner;
    let mut run = move || inner.receive_packet(coder);

    match &self.pool {
      Some(pool) => pool.install(run),
      None => run(),
    }
  }

  /// Flushes the encoder.
  ///
  /// Flushing signals the end of the video. After the encoder has been
  /// flushed, no additional frames are accepted.
  #[inline]
  pub fn flush(&mut self) {
    self.is_flushing = true;
    self.inner.flush();
  }

  /// Frames waiting in the lookahead.
  #[inline]
  pub fn queued_frames(&self) -> usize {
    self.inner.queued_frames()
  }

  /// Replaces the bits per macroblock model used to pick quantizers.
  pub fn set_bits_per_mb(&mut self, model: Arc<dyn BitsPerMb>) {
    self.inner.rc_state.set_bits_per_mb(model);
  }

  /// Rate control state, for inspection.
  #[inline]
  pub fn rate_control(&self) -> &RCState {
    &self.inner.rc_state
  }

  /// Golden and alt-ref frame scheduling state, for inspection.
  #[inline]
  pub fn golden_frames(&self) -> &GoldenFrameScheduler {
    &self.inner.gf
  }

  /// Returns the configuration of the context.
  #[inline]
  pub const fn config(&self) -> &Config {
    &self.config
  }
}
