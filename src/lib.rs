// Copyright (c) 2017-2024, The rav1e contributors. All rights reserved
//
// This source code is subject to the terms of the BSD 2 Clause License and
// the Alliance for Open Media Patent License 1.0. If the BSD 2 Clause License
// was not distributed with this source code in the LICENSE file, you can
// obtain it at www.aomedia.org/license/software. If the Alliance for Open
// Media Patent License 1.0 was not distributed with this source code in the
// PATENTS file, you can obtain it at www.aomedia.org/license/patent.

//! Adaptive control core of a VP8 encoder.
//!
//! The crate decides, frame by frame, what the pixel and entropy coding
//! stages should do: which source frame comes next, its frame type and
//! reference updates, its size budget and quantizer, and whether it must be
//! coded again. Motion search runs in here too. The coding stages
//! themselves plug in through the [`FrameCoder`] trait.
//!
//! # Basic encoding
//!
//! ```
//! use vp8ctl::prelude::*;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let enc = EncoderConfig {
//!   width: 176,
//!   height: 144,
//!   time_base: Rational::new(1, 25),
//!   ..Default::default()
//! };
//! let rc = RateControlConfig::new()
//!   .with_end_usage(EndUsage::StreamFromServer)
//!   .with_target_bitrate(256);
//! let cfg = Config::new().with_encoder_config(enc).with_rate_control(rc);
//! let mut ctx: Context<u8> = cfg.new_context()?;
//!
//! // A stand-in for the coding stages: every frame costs 1000 bytes.
//! let mut coder = |_f: CodingFrame<'_, u8>| EncodedFrame {
//!   size_bytes: 1000,
//!   ..Default::default()
//! };
//!
//! for _ in 0..10 {
//!   ctx.send_frame(ctx.new_frame())?;
//!   let packet = ctx.receive_packet(&mut coder)?;
//!   assert!(packet.qindex <= 127);
//! }
//! # Ok(())
//! # }
//! ```
//!
//! [`FrameCoder`]: crate::FrameCoder

#![deny(bare_trait_objects)]
#![allow(clippy::cast_lossless)]
#![allow(clippy::cast_ptr_alignment)]
#![allow(clippy::cognitive_complexity)]
#![allow(clippy::new_without_default)]
#![allow(clippy::too_many_arguments)]
#![allow(clippy::verbose_bit_mask)]
#![allow(clippy::unreadable_literal)]
#![allow(clippy::many_single_char_names)]
#![warn(clippy::map_unwrap_or)]
#![warn(clippy::unnecessary_wraps)]

pub mod util;
pub mod context;
pub mod dist;
pub mod encoder;
pub mod frame;
pub mod framerate;
pub mod gf;
pub mod me;
pub mod rate;

mod api;

mod serialize {
  cfg_if::cfg_if! {
    if #[cfg(feature="serialize")] {
      pub use serde::*;
    } else {
      pub use noop_proc_macro::{Deserialize, Serialize};
    }
  }
}

pub use crate::api::*;
pub use crate::frame::{Frame, FrameParameters, FrameTypeOverride};
pub use crate::util::Pixel;

/// Commonly used types and traits.
pub mod prelude {
  pub use crate::api::*;
  pub use crate::encoder::{CopyBuffer, RefFrame, RefreshFlags};
  pub use crate::frame::{Frame, FrameParameters, FrameTypeOverride, Plane};
  pub use crate::rate::{BitsPerMb, DefaultBitsPerMb};
  pub use crate::util::{CastFromPrimitive, Pixel};
}
