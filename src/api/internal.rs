// Copyright (c) 2018-2024, The rav1e contributors. All rights reserved
//
// This source code is subject to the terms of the BSD 2 Clause License and
// the Alliance for Open Media Patent License 1.0. If the BSD 2 Clause License
// was not distributed with this source code in the LICENSE file, you can
// obtain it at www.aomedia.org/license/software. If the Alliance for Open
// Media Patent License 1.0 was not distributed with this source code in the
// PATENTS file, you can obtain it at www.aomedia.org/license/patent.
#![deny(missing_docs)]

use log::{debug, warn};

use crate::api::lookahead::{LookaheadEntry, LookaheadQueue, PeekDirection};
use crate::api::{
  CodingFrame, EncoderConfig, EncoderStatus, FrameCoder, FrameDecision,
  FrameType, Packet, RateControlConfig,
};
use crate::context::{
  CodingContext, ContextScalars, EntropyContext, FrameContext, MvSadCosts,
  RefContexts,
};
use crate::encoder::{CopyBuffer, FrameBufferPool, RefFrame, RefreshFlags};
use crate::frame::{Frame, FrameParameters, FrameTypeOverride, MB_SIZE};
use crate::framerate::FramerateEstimator;
use crate::gf::GoldenFrameScheduler;
use crate::me::{
  rd_multipliers, search_frame, FrameMotion, MeParams, MotionSearch,
  MotionVector, MvBounds,
};
use crate::rate::{DefaultBitsPerMb, RCState, RecodeState};
use crate::util::Pixel;

use std::sync::Arc;

/// Drives one frame at a time through the control loop: source selection,
/// frame type and reference decisions, rate control, the recode loop and
/// the commit of every piece of state that survives the frame.
pub(crate) struct ContextInner<T: Pixel> {
  /// Frames accepted so far.
  pub(crate) frame_count: u64,
  /// Input count at which the encode stops, once flushed.
  limit: Option<u64>,
  /// Timestamp given to the next frame sent without one.
  next_pts: u64,
  /// Shown frames processed, dropped ones included.
  shown_frames: u64,
  pub(crate) config: EncoderConfig,
  lookahead: LookaheadQueue<T>,
  framerate: FramerateEstimator,
  pub(crate) rc_state: RCState,
  pub(crate) gf: GoldenFrameScheduler,
  buffers: FrameBufferPool<T>,
  pub(crate) entropy: EntropyContext,
  ref_contexts: RefContexts,
  search: Box<dyn MotionSearch>,
  sad_costs: MvSadCosts,
  /// Motion of the last searched frame, hints for the next search.
  prev_mvs: Vec<MotionVector>,
  last_zero_mv_count: u32,
  filter_level: u8,
  /// Input frame coded ahead of time as the hidden alt-ref frame.
  alt_ref_source: Option<u64>,
}

impl<T: Pixel> ContextInner<T> {
  pub fn new(enc: &EncoderConfig, rc: &RateControlConfig) -> Self {
    let width = (enc.width + MB_SIZE - 1) & !(MB_SIZE - 1);
    let height = (enc.height + MB_SIZE - 1) & !(MB_SIZE - 1);
    let buffers = FrameBufferPool::new(width, height);
    let stride = buffers.get(RefFrame::Last).planes[0].cfg.stride;
    let search = enc.speed_settings.motion_search(stride);

    let framerate = FramerateEstimator::new(enc.time_base);
    let mut entropy = EntropyContext::default();
    entropy.setup_key_frame();
    let mut ref_contexts = RefContexts::default();
    ref_contexts.reset(&entropy.fc);

    ContextInner {
      frame_count: 0,
      limit: None,
      next_pts: 0,
      shown_frames: 0,
      config: *enc,
      lookahead: LookaheadQueue::new(
        enc.width,
        enc.height,
        enc.lag_in_frames,
      ),
      rc_state: RCState::new(enc, rc, Arc::new(DefaultBitsPerMb)),
      gf: GoldenFrameScheduler::new(enc, rc, framerate.framerate()),
      framerate,
      buffers,
      entropy,
      ref_contexts,
      search,
      sad_costs: MvSadCosts::new(),
      prev_mvs: Vec::new(),
      last_zero_mv_count: 0,
      filter_level: 0,
      alt_ref_source: None,
    }
  }

  /// Queues a source frame lasting `duration` timebase units from `pts`,
  /// or from the end of the previous frame when `pts` is `None`.
  ///
  /// Returns `EnoughData` when the lookahead is full; the frame is not
  /// kept.
  pub fn send_frame(
    &mut self, frame: &Frame<T>, pts: Option<u64>, duration: u64,
    params: FrameParameters, active_map: Option<&[bool]>,
  ) -> Result<(), EncoderStatus> {
    if self.limit.is_some() {
      return Err(EncoderStatus::EnoughData);
    }
    let pts = pts.unwrap_or(self.next_pts);
    let (ts_start, ts_end) = self.framerate.frame_ticks(pts, duration);

    let mbs = frame.mb_cols() * frame.mb_rows();
    let active_map = match active_map {
      Some(map) if map.len() != mbs => {
        warn!(
          "active map of {} entries ignored, expected {}",
          map.len(),
          mbs
        );
        None
      }
      map => map,
    };

    if self.lookahead.push(frame, ts_start, ts_end, params, active_map) {
      return Err(EncoderStatus::EnoughData);
    }
    self.framerate.note_input(ts_start);
    self.next_pts = pts + duration.max(1);
    self.frame_count += 1;
    Ok(())
  }

  /// No more frames will be sent; the lookahead drains from now on.
  pub fn flush(&mut self) {
    self.limit.get_or_insert(self.frame_count);
  }

  pub(crate) fn done_processing(&self) -> bool {
    self.limit.is_some() && self.lookahead.is_empty()
  }

  /// Frames waiting in the lookahead.
  pub fn queued_frames(&self) -> usize {
    self.lookahead.len()
  }

  /// Picks the next frame to code: the pending alt-ref frame when one is
  /// due, otherwise the oldest queued frame.
  fn next_source(&mut self) -> Option<(LookaheadEntry<T>, bool)> {
    if self.gf.source_alt_ref_pending && self.config.play_alternate {
      let distance = self.gf.frames_till_gf_update_due as usize;
      if let Some(entry) =
        self.lookahead.peek(distance, PeekDirection::Forward)
      {
        return Some((entry.clone(), true));
      }
    }
    let drain = self.limit.is_some();
    self.lookahead.pop(drain).map(|entry| (entry.clone(), false))
  }

  fn scalars(&self) -> ContextScalars {
    ContextScalars {
      frames_since_key: self.rc_state.frames_since_key,
      filter_level: self.filter_level,
      frames_till_gf_update_due: self.gf.frames_till_gf_update_due,
      frames_since_golden: self.gf.frames_since_golden,
      this_frame_percent_intra: self.gf.this_frame_percent_intra,
    }
  }

  fn restore_scalars(&mut self, scalars: ContextScalars) {
    self.rc_state.frames_since_key = scalars.frames_since_key;
    self.filter_level = scalars.filter_level;
    self.gf.frames_till_gf_update_due = scalars.frames_till_gf_update_due;
    self.gf.frames_since_golden = scalars.frames_since_golden;
    self.gf.this_frame_percent_intra = scalars.this_frame_percent_intra;
  }

  fn packet(&self, fd: &FrameDecision, size_bytes: usize) -> Packet {
    Packet {
      input_frameno: fd.input_frameno,
      frame_type: fd.frame_type,
      qindex: fd.qindex,
      size_bytes,
      target_bits: fd.target_bits,
      show_frame: fd.show_frame,
      dropped: fd.dropped,
      refresh: fd.refresh,
      layer: fd.layer,
      recodes: fd.recodes,
      buffer_level: self.rc_state.lc.buffer_level,
    }
  }

  fn drop_frame(&mut self, mut fd: FrameDecision) -> Packet {
    self.rc_state.frame_dropped();
    if self.rc_state.is_layered() {
      self.rc_state.save_layer_context();
    }
    fd.dropped = true;
    fd.refresh = RefreshFlags::default();
    debug!("frame {} dropped", fd.input_frameno);
    self.packet(&fd, 0)
  }

  fn motion(&self, fd: &FrameDecision, source: &Frame<T>) -> FrameMotion {
    if fd.frame_type == FrameType::KEY {
      return FrameMotion::default();
    }
    let reference = self.buffers.get(RefFrame::Last);
    let (sad_per_bit, error_per_bit) = rd_multipliers(fd.qindex);
    let template = MeParams {
      bounds: MvBounds::for_macroblock(0, 0, source.mb_rows(), source.mb_cols()),
      center_mv: MotionVector::default(),
      sad_per_bit,
      error_per_bit,
      mv_costs: &self.entropy.mv_costs,
      sad_costs: &self.sad_costs,
    };
    let hints =
      if self.prev_mvs.is_empty() { None } else { Some(&self.prev_mvs[..]) };
    search_frame(self.search.as_ref(), source, reference, hints, &template)
  }

  /// Runs the control loop for the next frame.
  ///
  /// Returns `NeedMoreData` while the lookahead fills up and
  /// `LimitReached` once a flushed encode has emitted every frame.
  pub fn receive_packet<C: FrameCoder<T> + ?Sized>(
    &mut self, coder: &mut C,
  ) -> Result<Packet, EncoderStatus> {
    if self.done_processing() {
      return Err(EncoderStatus::LimitReached);
    }
    let (entry, is_alt_ref) =
      self.next_source().ok_or(EncoderStatus::NeedMoreData)?;

    let is_src_frame_alt_ref =
      !is_alt_ref && self.alt_ref_source == Some(entry.input_frameno);
    if is_src_frame_alt_ref {
      self.alt_ref_source = None;
    }
    let show_frame = !is_alt_ref;

    if show_frame {
      if let Some(fps) = self.framerate.update(entry.ts_start, entry.ts_end)
      {
        if self.rc_state.is_layered() {
          self.rc_state.set_layer_framerates(fps);
        } else {
          self.rc_state.new_framerate(fps);
        }
        self.gf.new_framerate(fps);
      }
    }

    let layers = &self.config.temporal_layers;
    let layer = if layers.is_layered() {
      let layer = layers.layer_for_frame(self.shown_frames);
      self.rc_state.restore_layer_context(layer);
      layer
    } else {
      0
    };
    if show_frame {
      self.shown_frames += 1;
    }

    let forced_key =
      entry.params.frame_type_override == FrameTypeOverride::Key;
    let frame_type =
      if !is_alt_ref && self.rc_state.is_key_frame_due(forced_key) {
        FrameType::KEY
      } else {
        FrameType::INTER
      };
    let refresh = if frame_type == FrameType::KEY {
      RefreshFlags::KEY_FRAME
    } else if is_alt_ref {
      RefreshFlags { alt_ref: true, ..Default::default() }
    } else {
      RefreshFlags { last: true, ..Default::default() }
    };
    let mut fd = FrameDecision {
      input_frameno: entry.input_frameno,
      frame_type,
      qindex: 0,
      zbin_over_quant: 0,
      refresh,
      show_frame,
      is_src_frame_alt_ref,
      forced_key: forced_key && frame_type == FrameType::KEY,
      dropped: false,
      layer,
      target_bits: 0,
      undershoot_limit: 0,
      overshoot_limit: 0,
      recodes: 0,
    };

    if show_frame && self.rc_state.decimate(frame_type) {
      return Ok(self.drop_frame(fd));
    }

    if frame_type == FrameType::KEY {
      self.entropy.setup_key_frame();
      self.ref_contexts.reset(&self.entropy.fc);
      self.gf.setup_key_frame();
    }

    // Streams without probability carry-over code every frame from the
    // state the decoder is guaranteed to hold.
    let carried_fc: Option<FrameContext> = if self.config.error_resilient {
      Some(self.entropy.fc)
    } else {
      None
    };
    if self.rc_state.is_layered() && frame_type != FrameType::KEY {
      let fc = *self.ref_contexts.get(RefFrame::Last);
      self.entropy.load(&fc);
    }

    let zero_mv_count = self.last_zero_mv_count;
    if !self.rc_state.pick_frame_size(&mut fd, &mut self.gf, zero_mv_count) {
      return Ok(self.drop_frame(fd));
    }
    if is_src_frame_alt_ref
      && frame_type != FrameType::KEY
      && fd.refresh.golden
    {
      fd.refresh.golden = false;
      fd.refresh.copy_buffer_to_gf = CopyBuffer::FromAltRef;
    }

    self.rc_state.select_active_quality(&fd);
    let noboost = self.gf.gf_noboost_onepass_cbr;
    let alt_active = self.gf.source_alt_ref_active;
    let (q, zbin) =
      self.rc_state.regulate_q(&fd, fd.target_bits, noboost, alt_active);
    fd.qindex = q;
    fd.zbin_over_quant = zbin;
    (fd.undershoot_limit, fd.overshoot_limit) =
      self.rc_state.frame_size_bounds(&fd);
    if frame_type == FrameType::KEY {
      self.filter_level = ((q as u32 * 3) / 8) as u8;
    }

    self.buffers.begin_frame();
    let snapshot = CodingContext::save(&self.entropy, self.scalars());
    let mut recode = RecodeState::new(&self.rc_state, &fd, noboost, alt_active);
    let speed = self.config.speed_settings;
    let recode_allowed = speed.recode_allowed(
      frame_type == FrameType::KEY || fd.is_golden_or_alt_ref(),
    );

    let source: &Frame<T> = &entry.img;
    let (encoded, motion) = loop {
      let motion = self.motion(&fd, source);
      let encoded = coder.encode_frame(CodingFrame {
        decision: &fd,
        source,
        motion: &motion,
        entropy: &mut self.entropy,
        recon: self.buffers.new_frame_mut(),
      });
      match recode.next_q(
        &mut self.rc_state,
        &fd,
        encoded.size_bytes,
        recode_allowed,
        speed.max_recodes,
        noboost,
        alt_active,
      ) {
        Some((q, zbin)) => {
          let scalars = snapshot.restore(&mut self.entropy);
          self.restore_scalars(scalars);
          fd.qindex = q;
          fd.zbin_over_quant = zbin;
          fd.recodes += 1;
        }
        None => break (encoded, motion),
      }
    };

    self.gf.this_frame_percent_intra = if frame_type == FrameType::KEY {
      100
    } else {
      encoded.counts.percent_intra()
    };
    self.rc_state.postencode_update(
      &fd,
      encoded.size_bytes,
      recode.active_worst_qchanged,
      &mut self.gf,
    );
    self.gf.update_usage_maps(&fd, &encoded.mb_info);
    self.gf.update_stats(
      &fd,
      self.rc_state.projected_frame_size,
      self.rc_state.lc.inter_frame_target,
      &encoded.counts,
    );

    self.ref_contexts.update(&fd.refresh, &self.entropy.fc);
    if let Some(fc) = carried_fc {
      self.entropy.load(&fc);
    }
    self.buffers.extend_new_frame();
    self.buffers.swap_frame_buffers(&fd.refresh);

    if frame_type != FrameType::KEY {
      self.last_zero_mv_count = motion.stats.zero_motion_mbs;
      self.prev_mvs = motion.results.iter().map(|r| r.mv).collect();
    } else {
      self.last_zero_mv_count = 0;
      self.prev_mvs.clear();
    }
    if is_alt_ref {
      self.alt_ref_source = Some(entry.input_frameno);
    }
    if self.rc_state.is_layered() {
      self.rc_state.save_layer_context();
    }

    let packet = self.packet(&fd, encoded.size_bytes);
    debug!("{}", packet);
    Ok(packet)
  }
}
