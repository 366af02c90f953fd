// Copyright (c) 2018-2024, The rav1e contributors. All rights reserved
//
// This source code is subject to the terms of the BSD 2 Clause License and
// the Alliance for Open Media Patent License 1.0. If the BSD 2 Clause License
// was not distributed with this source code in the LICENSE file, you can
// obtain it at www.aomedia.org/license/software. If the Alliance for Open
// Media Patent License 1.0 was not distributed with this source code in the
// PATENTS file, you can obtain it at www.aomedia.org/license/patent.

use crate::context::{FrameContext, ModeCounts};
use crate::prelude::*;
use crate::rate::{estimate_bits_at_q, q_trans};

use interpolate_name::interpolate_test;
use pretty_assertions::assert_eq;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaChaRng;

use std::sync::Arc;

fn setup_config(
  w: usize, h: usize, speed: usize, lag_in_frames: usize,
  rate_control: RateControlConfig,
) -> Config {
  let mut enc = EncoderConfig::with_speed_preset(speed);
  enc.width = w;
  enc.height = h;
  enc.time_base = Rational::new(1, 25);
  enc.lag_in_frames = lag_in_frames;

  Config::new()
    .with_encoder_config(enc)
    .with_rate_control(rate_control)
    .with_threads(1)
}

fn cbr(kbps: u32) -> RateControlConfig {
  RateControlConfig::new()
    .with_end_usage(EndUsage::StreamFromServer)
    .with_target_bitrate(kbps)
}

fn fill_frame_const<T: Pixel>(frame: &mut Frame<T>, value: T) {
  for plane in frame.planes.iter_mut() {
    plane.data.fill(value);
  }
}

fn fill_frame<T: Pixel>(ra: &mut ChaChaRng, frame: &mut Frame<T>) {
  for plane in frame.planes.iter_mut() {
    for pixel in plane.data.iter_mut() {
      let v: u8 = ra.gen();
      *pixel = T::cast_from(v);
    }
  }
}

/// Codes every frame at exactly the size the default model predicts.
fn model_coder<T: Pixel>(
  mbs: usize,
) -> impl FnMut(CodingFrame<'_, T>) -> EncodedFrame + Send {
  move |f: CodingFrame<'_, T>| {
    let bits = estimate_bits_at_q(
      &DefaultBitsPerMb,
      f.decision.frame_type,
      f.decision.qindex,
      mbs,
      1.0,
    );
    EncodedFrame { size_bytes: (bits / 8) as usize, ..Default::default() }
  }
}

fn receive_all<T: Pixel, C: FrameCoder<T> + Send>(
  ctx: &mut Context<T>, coder: &mut C, packets: &mut Vec<Packet>,
) {
  loop {
    match ctx.receive_packet(coder) {
      Ok(packet) => packets.push(packet),
      Err(EncoderStatus::NeedMoreData) | Err(EncoderStatus::LimitReached) => {
        break
      }
      Err(e) => panic!("unexpected status {:?}", e),
    }
  }
}

/// Sends every frame, taking packets out as soon as they are ready, then
/// flushes.
fn encode<T: Pixel, C: FrameCoder<T> + Send>(
  ctx: &mut Context<T>,
  frames: impl IntoIterator<Item = (Frame<T>, FrameParameters)>,
  coder: &mut C,
) -> Vec<Packet> {
  let mut packets = Vec::new();
  for (frame, params) in frames {
    ctx.send_frame((frame, params)).unwrap();
    receive_all(ctx, coder, &mut packets);
  }
  ctx.flush();
  receive_all(ctx, coder, &mut packets);
  packets
}

fn flat_frames<T: Pixel>(
  ctx: &Context<T>, n: usize,
) -> Vec<(Frame<T>, FrameParameters)> {
  (0..n)
    .map(|i| {
      let mut f = ctx.new_frame();
      fill_frame_const(&mut f, T::cast_from(((i * 3) % 256) as u8));
      (f, FrameParameters::default())
    })
    .collect()
}

fn shown_input_framenos(packets: &[Packet]) -> Vec<u64> {
  packets.iter().filter(|p| p.show_frame).map(|p| p.input_frameno).collect()
}

#[interpolate_test(no_lag, 0)]
#[interpolate_test(lag_1, 1)]
#[interpolate_test(lag_5, 5)]
#[interpolate_test(lag_25, 25)]
fn flush(lag_in_frames: usize) {
  let cfg = setup_config(64, 64, 6, lag_in_frames, cbr(200));
  let mut ctx: Context<u8> = cfg.new_context().unwrap();
  let limit = 41;
  let frames = flat_frames(&ctx, limit);
  let mut coder = model_coder::<u8>(16);

  let packets = encode(&mut ctx, frames, &mut coder);

  assert_eq!(
    shown_input_framenos(&packets),
    (0..limit as u64).collect::<Vec<_>>()
  );
  assert_eq!(
    ctx.receive_packet(&mut coder),
    Err(EncoderStatus::LimitReached)
  );
}

#[test]
fn lookahead_holds_lag_frames() {
  let cfg = setup_config(64, 64, 6, 3, cbr(200));
  let mut ctx: Context<u8> = cfg.new_context().unwrap();
  let mut coder = model_coder::<u8>(16);

  for _ in 0..2 {
    ctx.send_frame(ctx.new_frame()).unwrap();
    assert_eq!(
      ctx.receive_packet(&mut coder),
      Err(EncoderStatus::NeedMoreData)
    );
  }
  ctx.send_frame(ctx.new_frame()).unwrap();
  assert_eq!(ctx.queued_frames(), 3);
  // Full: the frame is refused until one is taken out.
  assert_eq!(
    ctx.send_frame(ctx.new_frame()),
    Err(EncoderStatus::EnoughData)
  );
  let packet = ctx.receive_packet(&mut coder).unwrap();
  assert_eq!(packet.input_frameno, 0);
  assert!(ctx.send_frame(ctx.new_frame()).is_ok());
}

#[test]
fn send_after_flush_is_refused() {
  let cfg = setup_config(64, 64, 6, 0, cbr(200));
  let mut ctx: Context<u8> = cfg.new_context().unwrap();
  let mut coder = model_coder::<u8>(16);

  ctx.send_frame(ctx.new_frame()).unwrap();
  ctx.send_frame(None::<Arc<Frame<u8>>>).unwrap();
  ctx.send_frame(None::<Arc<Frame<u8>>>).unwrap();
  assert_eq!(
    ctx.send_frame(ctx.new_frame()),
    Err(EncoderStatus::EnoughData)
  );
  assert!(ctx.receive_packet(&mut coder).is_ok());
  assert_eq!(
    ctx.receive_packet(&mut coder),
    Err(EncoderStatus::LimitReached)
  );
}

#[test]
fn first_and_forced_frames_are_key_frames() {
  let cfg = setup_config(64, 64, 6, 2, cbr(200));
  let mut ctx: Context<u8> = cfg.new_context().unwrap();
  let mut frames = flat_frames(&ctx, 20);
  frames[7].1.frame_type_override = FrameTypeOverride::Key;
  let mut coder = model_coder::<u8>(16);

  let packets = encode(&mut ctx, frames, &mut coder);

  let keys = packets
    .iter()
    .filter(|p| p.frame_type == FrameType::KEY)
    .map(|p| p.input_frameno)
    .collect::<Vec<_>>();
  assert_eq!(keys, [0, 7]);
  for p in packets.iter().filter(|p| p.frame_type == FrameType::KEY) {
    assert_eq!(p.refresh, RefreshFlags::KEY_FRAME);
  }
}

#[test]
fn key_frame_interval() {
  let mut cfg = setup_config(64, 64, 6, 0, cbr(200));
  cfg.enc.key_freq = 10;
  let mut ctx: Context<u8> = cfg.new_context().unwrap();
  let frames = flat_frames(&ctx, 25);
  let mut coder = model_coder::<u8>(16);

  let packets = encode(&mut ctx, frames, &mut coder);

  let keys = packets
    .iter()
    .filter(|p| p.frame_type == FrameType::KEY)
    .map(|p| p.input_frameno)
    .collect::<Vec<_>>();
  assert_eq!(keys, [0, 10, 20]);
}

#[test]
fn coder_sees_the_decision() {
  let cfg = setup_config(64, 48, 6, 0, cbr(200));
  let mut ctx: Context<u8> = cfg.new_context().unwrap();
  let frames = flat_frames(&ctx, 6);
  let mut seen = Vec::new();
  let mut coder = |f: CodingFrame<'_, u8>| {
    seen.push((
      f.decision.frame_type,
      f.decision.qindex,
      f.motion.results.len(),
      f.source.width(),
      f.recon.height(),
    ));
    EncodedFrame { size_bytes: 500, ..Default::default() }
  };

  let packets = encode(&mut ctx, frames, &mut coder);

  assert_eq!(packets.len(), 6);
  assert!(seen.len() >= 6);
  for &(frame_type, qindex, motion, width, height) in &seen {
    assert!(qindex <= 127);
    assert_eq!(width, 64);
    assert_eq!(height, 48);
    // Key frames are not searched; inter frames get one result per
    // macroblock.
    let expected = if frame_type == FrameType::KEY { 0 } else { 12 };
    assert_eq!(motion, expected);
  }
}

#[test]
fn recodes_start_from_the_saved_context() {
  let mut cfg = setup_config(64, 64, 6, 0, cbr(200));
  cfg.enc.speed_settings.recode_loop = RecodeLoop::AllFrames;
  cfg.enc.speed_settings.max_recodes = 2;
  let mut ctx: Context<u8> = cfg.new_context().unwrap();
  let frames = flat_frames(&ctx, 8);

  let mut attempts: Vec<(u64, FrameContext, ModeCounts)> = Vec::new();
  let mut coder = |f: CodingFrame<'_, u8>| {
    attempts.push((
      f.decision.input_frameno,
      f.entropy.fc,
      f.entropy.counts,
    ));
    // Adapt the state freely; it must not leak into the next attempt.
    f.entropy.fc.ymode_prob[0] = f.entropy.fc.ymode_prob[0].wrapping_add(1);
    f.entropy.counts.ymode[0] += 1;
    let bits = estimate_bits_at_q(
      &DefaultBitsPerMb,
      f.decision.frame_type,
      f.decision.qindex,
      16,
      1.0,
    );
    // Three times the predicted size: every frame overshoots.
    EncodedFrame { size_bytes: (bits * 3 / 8) as usize, ..Default::default() }
  };

  let packets = encode(&mut ctx, frames, &mut coder);

  assert!(packets.iter().any(|p| p.recodes > 0));
  for pair in attempts.windows(2) {
    if pair[0].0 == pair[1].0 {
      assert_eq!(pair[0].1, pair[1].1);
      assert_eq!(pair[0].2, pair[1].2);
    }
  }
}

#[test]
fn recode_never_lowers_the_quantizer() {
  let mut cfg = setup_config(64, 64, 6, 0, cbr(200));
  cfg.enc.speed_settings.recode_loop = RecodeLoop::AllFrames;
  cfg.enc.speed_settings.max_recodes = 2;
  let mut ctx: Context<u8> = cfg.new_context().unwrap();
  let frames = flat_frames(&ctx, 4);

  let mut qs: Vec<(u64, u8)> = Vec::new();
  let mut coder = |f: CodingFrame<'_, u8>| {
    qs.push((f.decision.input_frameno, f.decision.qindex));
    let bits = estimate_bits_at_q(
      &DefaultBitsPerMb,
      f.decision.frame_type,
      f.decision.qindex,
      16,
      1.0,
    );
    EncodedFrame { size_bytes: (bits * 3 / 8) as usize, ..Default::default() }
  };

  encode(&mut ctx, frames, &mut coder);

  for pair in qs.windows(2) {
    if pair[0].0 == pair[1].0 {
      assert!(pair[1].1 >= pair[0].1, "{:?}", pair);
    }
  }
}

#[interpolate_test(error_resilient, true)]
#[interpolate_test(carried_over, false)]
fn probability_carry_over(error_resilient: bool) {
  let mut cfg = setup_config(64, 64, 6, 0, cbr(200));
  cfg.enc.error_resilient = error_resilient;
  let mut ctx: Context<u8> = cfg.new_context().unwrap();
  let frames = flat_frames(&ctx, 3);

  let mut probs = Vec::new();
  let mut coder = |f: CodingFrame<'_, u8>| {
    probs.push((f.decision.input_frameno, f.entropy.fc.ymode_prob[0]));
    f.entropy.fc.ymode_prob[0] = 1;
    EncodedFrame { size_bytes: 500, ..Default::default() }
  };

  encode(&mut ctx, frames, &mut coder);

  let default = FrameContext::default().ymode_prob[0];
  let later = if error_resilient { default } else { 1 };
  assert_eq!(probs[0], (0, default));
  for &(frameno, prob) in probs.iter().filter(|(n, _)| *n > 0) {
    assert_eq!((frameno, prob), (frameno, later));
  }
}

#[test]
fn cbr_buffer_stays_within_bounds() {
  let cfg = setup_config(176, 144, 6, 0, cbr(256));
  let mut ctx: Context<u8> = cfg.new_context().unwrap();
  let max = ctx.rate_control().lc.maximum_buffer_size;
  let frames = flat_frames(&ctx, 60);
  let mut coder = model_coder::<u8>(99);

  let packets = encode(&mut ctx, frames, &mut coder);

  assert_eq!(packets.len(), 60);
  for p in &packets {
    assert!(!p.dropped);
    assert!(p.buffer_level > 0 && p.buffer_level <= max, "{:?}", p);
  }
}

#[test]
fn overshooting_stream_drops_frames() {
  let rc = cbr(256).with_drop_frames(50);
  let cfg = setup_config(176, 144, 6, 0, rc);
  let mut ctx: Context<u8> = cfg.new_context().unwrap();
  let frames = flat_frames(&ctx, 30);
  let mut coder = |f: CodingFrame<'_, u8>| EncodedFrame {
    // Four times the budget.
    size_bytes: (f.decision.target_bits.max(8000) / 2) as usize,
    ..Default::default()
  };

  let packets = encode(&mut ctx, frames, &mut coder);

  assert_eq!(shown_input_framenos(&packets).len(), 30);
  let dropped = packets.iter().filter(|p| p.dropped).collect::<Vec<_>>();
  assert!(!dropped.is_empty());
  for p in dropped {
    assert_eq!(p.size_bytes, 0);
    assert_eq!(p.refresh, RefreshFlags::default());
  }
}

#[test]
fn constant_quality_with_alt_ref() {
  let rc = RateControlConfig::new()
    .with_end_usage(EndUsage::ConstantQuality)
    .with_cq_level(20);
  let mut cfg = setup_config(64, 64, 6, 16, rc);
  cfg.enc.play_alternate = true;
  let mut ctx: Context<u8> = cfg.new_context().unwrap();
  let frames = flat_frames(&ctx, 40);
  let mut coder = model_coder::<u8>(16);

  let packets = encode(&mut ctx, frames, &mut coder);

  assert_eq!(shown_input_framenos(&packets), (0..40).collect::<Vec<_>>());
  for p in &packets {
    assert_eq!(p.qindex, q_trans(20));
  }

  let (pos, alt_ref) = packets
    .iter()
    .enumerate()
    .find(|(_, p)| !p.show_frame)
    .unwrap();
  assert!(alt_ref.refresh.alt_ref);
  assert!(!alt_ref.refresh.last && !alt_ref.refresh.golden);
  let shown = packets[pos..]
    .iter()
    .find(|p| p.show_frame && p.input_frameno == alt_ref.input_frameno)
    .unwrap();
  assert_eq!(shown.refresh.copy_buffer_to_gf, CopyBuffer::FromAltRef);
  assert!(!shown.refresh.golden);
}

#[test]
fn threads_do_not_change_decisions() {
  let run = |threads: usize| {
    let cfg = setup_config(176, 144, 1, 3, cbr(300)).with_threads(threads);
    let mut ctx: Context<u8> = cfg.new_context().unwrap();
    let mut ra = ChaChaRng::from_seed([0; 32]);
    let frames = (0..12)
      .map(|_| {
        let mut f = ctx.new_frame();
        fill_frame(&mut ra, &mut f);
        (f, FrameParameters::default())
      })
      .collect::<Vec<_>>();
    let mut motion = Vec::new();
    let mut coder = |f: CodingFrame<'_, u8>| {
      motion.push(f.motion.clone());
      EncodedFrame { size_bytes: 1200, ..Default::default() }
    };
    let packets = encode(&mut ctx, frames, &mut coder);
    (packets, motion)
  };

  assert_eq!(run(1), run(4));
}

#[test]
fn temporal_layers_alternate() {
  let mut cfg = setup_config(64, 64, 6, 0, cbr(250));
  cfg.enc.temporal_layers = TemporalLayers::two_layers(100, 250);
  let mut ctx: Context<u8> = cfg.new_context().unwrap();
  let frames = flat_frames(&ctx, 10);
  let mut coder = model_coder::<u8>(16);

  let packets = encode(&mut ctx, frames, &mut coder);

  let layers = packets.iter().map(|p| p.layer).collect::<Vec<_>>();
  assert_eq!(layers, [0, 1, 0, 1, 0, 1, 0, 1, 0, 1]);
  let rc = ctx.rate_control();
  assert_eq!(rc.layer(0).target_bandwidth, 100_000);
  assert_eq!(rc.layer(1).target_bandwidth, 250_000);
  assert!((rc.layer_framerate(0).unwrap() - 12.5).abs() < 1e-9);
  assert!((rc.layer_framerate(1).unwrap() - 25.0).abs() < 1e-9);
}

#[test]
fn framerate_follows_timestamps() {
  let mut cfg = setup_config(64, 64, 6, 0, cbr(200));
  cfg.enc.time_base = Rational::new(1, 1000);
  let mut ctx: Context<u8> = cfg.new_context().unwrap();
  let mut coder = model_coder::<u8>(16);
  let frame = ctx.new_frame();

  let mut pts = 0;
  for duration in [40, 40, 40, 80] {
    ctx
      .send_frame_at(&frame, pts, duration, FrameParameters::default(), None)
      .unwrap();
    ctx.receive_packet(&mut coder).unwrap();
    pts += duration;
    if duration == 40 {
      assert!((ctx.rate_control().output_framerate - 25.0).abs() < 1e-6);
    }
  }
  // Doubling the duration is followed at once.
  assert!((ctx.rate_control().output_framerate - 12.5).abs() < 1e-6);
  assert_eq!(ctx.rate_control().per_frame_bandwidth, 16_000);
}

#[test]
fn active_map_keeps_static_macroblocks() {
  let cfg = setup_config(32, 32, 6, 0, cbr(200));
  let mut ctx: Context<u8> = cfg.new_context().unwrap();
  let mut samples = Vec::new();
  let mut coder = |f: CodingFrame<'_, u8>| {
    let luma = &f.source.planes[0];
    samples.push((luma.p(0, 0), luma.p(20, 20)));
    EncodedFrame { size_bytes: 100, ..Default::default() }
  };

  let mut background = ctx.new_frame();
  fill_frame_const(&mut background, 1);
  let mut foreground = ctx.new_frame();
  fill_frame_const(&mut foreground, 5);
  let params = FrameParameters::default();

  // Both ring slots hold the background.
  for pts in 0..2 {
    ctx.send_frame_at(&background, pts, 1, params, None).unwrap();
    ctx.receive_packet(&mut coder).unwrap();
  }
  let map = [true, false, false, false];
  ctx.send_frame_at(&foreground, 2, 1, params, Some(&map)).unwrap();
  ctx.receive_packet(&mut coder).unwrap();
  // A map of the wrong size is ignored.
  ctx.send_frame_at(&foreground, 3, 1, params, Some(&map[..2])).unwrap();
  ctx.receive_packet(&mut coder).unwrap();

  assert_eq!(samples, [(1, 1), (1, 1), (5, 1), (5, 5)]);
}

#[test]
fn custom_size_model() {
  struct Flat;
  impl BitsPerMb for Flat {
    fn bits_per_mb(&self, _: FrameType, qindex: u8) -> i32 {
      (128 - qindex as i32) << 9
    }
  }

  let cfg = setup_config(64, 64, 6, 0, cbr(200));
  let mut ctx: Context<u8> = cfg.new_context().unwrap();
  ctx.set_bits_per_mb(Arc::new(Flat));
  let model = ctx.rate_control().bits_per_mb();
  assert_eq!(model.bits_per_mb(FrameType::INTER, 0), 128 << 9);
}
