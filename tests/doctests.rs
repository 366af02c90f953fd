use vp8ctl::prelude::*;

use std::sync::Arc;

fn cbr_config() -> Config {
  let enc = EncoderConfig {
    width: 176,
    height: 144,
    time_base: Rational::new(1, 25),
    ..EncoderConfig::with_speed_preset(6)
  };
  let rc = RateControlConfig::new()
    .with_end_usage(EndUsage::StreamFromServer)
    .with_target_bitrate(256);
  Config::new().with_encoder_config(enc).with_rate_control(rc)
}

/// Stands in for the coding stages: the frame costs what the default size
/// model predicts at the chosen quantizer.
fn model_coder(f: CodingFrame<'_, u8>) -> EncodedFrame {
  let mbs = f.source.mb_cols() * f.source.mb_rows();
  let bits = vp8ctl::rate::estimate_bits_at_q(
    &DefaultBitsPerMb,
    f.decision.frame_type,
    f.decision.qindex,
    mbs,
    1.0,
  );
  EncodedFrame { size_bytes: (bits / 8) as usize, ..Default::default() }
}

#[test]
fn send_frame() -> Result<(), Box<dyn std::error::Error>> {
  let cfg = Config::default();
  let mut ctx: Context<u8> = cfg.new_context().unwrap();
  let f1 = ctx.new_frame();
  let f2 = f1.clone();
  let info =
    FrameParameters { frame_type_override: FrameTypeOverride::Key };

  // Send the plain frame data
  ctx.send_frame(f1)?;
  let _ = ctx.receive_packet(&mut model_coder);
  // Send the data and the per-frame parameters
  // In this case the frame is forced to be a keyframe.
  ctx.send_frame((f2, info))?;
  // Flush the encoder, it is equivalent to a call to `flush()`
  ctx.send_frame(None)?;
  Ok(())
}

#[test]
fn receive_packet() -> Result<(), Box<dyn std::error::Error>> {
  let cfg = Config::default();
  let mut ctx: Context<u8> = cfg.new_context()?;
  let frame = ctx.new_frame();

  ctx.send_frame(frame)?;
  ctx.flush();

  loop {
    match ctx.receive_packet(&mut model_coder) {
      Ok(_packet) => { /* Inspect the decision. */ }
      Err(EncoderStatus::LimitReached) => break,
      Err(err) => Err(err)?,
    }
  }
  Ok(())
}

fn encode_frames(
  ctx: &mut Context<u8>, mut frames: impl Iterator<Item = Frame<u8>>,
) -> Result<Vec<Packet>, EncoderStatus> {
  let mut packets = Vec::new();
  // Frames are produced lazily and only sent when the encoder asks for
  // them, so they are never all held at once.
  loop {
    match ctx.receive_packet(&mut model_coder) {
      Ok(packet) => packets.push(packet),
      Err(EncoderStatus::LimitReached) => {
        // All frames have been processed.
        break;
      }
      Err(EncoderStatus::NeedMoreData) => {
        // Push the next frame in, or flush the encoder if there are no
        // frames left (on None).
        ctx.send_frame(frames.next().map(Arc::new))?;
      }
      Err(EncoderStatus::EnoughData) => {
        // We aren't trying to push frames after flushing.
        unreachable!();
      }
    }
  }

  Ok(packets)
}

#[test]
fn encoding() -> Result<(), Box<dyn std::error::Error>> {
  let mut enc = EncoderConfig::default();
  // So it runs faster.
  enc.width = 16;
  enc.height = 16;
  let cfg = Config::new().with_encoder_config(enc);
  let mut ctx: Context<u8> = cfg.new_context()?;

  let frames = vec![ctx.new_frame(); 4].into_iter();
  let packets = encode_frames(&mut ctx, frames)?;
  assert_eq!(packets.len(), 4);

  Ok(())
}

#[test]
fn cbr_stream_tracks_its_buffer() -> Result<(), Box<dyn std::error::Error>> {
  let cfg = cbr_config();
  let mut ctx: Context<u8> = cfg.new_context()?;
  let max = ctx.rate_control().lc.maximum_buffer_size;

  let frames = vec![ctx.new_frame(); 50].into_iter();
  let packets = encode_frames(&mut ctx, frames)?;

  assert_eq!(packets.len(), 50);
  assert_eq!(packets[0].frame_type, FrameType::KEY);
  for p in &packets {
    assert!(p.buffer_level > 0 && p.buffer_level <= max);
    assert!(p.qindex <= 127);
  }
  Ok(())
}

#[test]
fn invalid_config_is_rejected() {
  let rc = RateControlConfig::new().with_quantizer_range(40, 20);
  let cfg = Config::new().with_rate_control(rc);
  assert_eq!(
    cfg.new_context::<u8>().err(),
    Some(InvalidConfig::InvalidQuantizerRange { min: 40, max: 20 })
  );
}
