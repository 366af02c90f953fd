// Copyright (c) 2020-2024, The rav1e contributors. All rights reserved
//
// This source code is subject to the terms of the BSD 2 Clause License and
// the Alliance for Open Media Patent License 1.0. If the BSD 2 Clause License
// was not distributed with this source code in the LICENSE file, you can
// obtain it at www.aomedia.org/license/software. If the Alliance for Open
// Media Patent License 1.0 was not distributed with this source code in the
// PATENTS file, you can obtain it at www.aomedia.org/license/patent.

use thiserror::Error;

use rayon::{ThreadPool, ThreadPoolBuilder};
use std::sync::Arc;

use crate::api::{Context, ContextInner};
use crate::util::Pixel;

mod encoder;
pub use encoder::*;

mod rate;
pub use rate::*;

mod speedsettings;
pub use speedsettings::*;

/// Largest frame dimension a VP8 stream can signal.
pub const MAX_FRAME_DIMENSION: usize = (1 << 14) - 1;
/// Largest timebase numerator or denominator accepted.
pub const MAX_TIMEBASE: u64 = 1_000_000_000;
/// Largest under/overshoot percentage accepted.
pub const MAX_SHOOT_PCT: u32 = 1000;

/// Enumeration of possible invalid configuration errors.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Error)]
#[non_exhaustive]
pub enum InvalidConfig {
  /// The width is invalid.
  #[error("invalid width {0} (expected >= 16, <= 16383)")]
  InvalidWidth(usize),
  /// The height is invalid.
  #[error("invalid height {0} (expected >= 16, <= 16383)")]
  InvalidHeight(usize),
  /// Timebase numerator is invalid.
  #[error("invalid timebase numerator {actual} (expected > 0, <= {max})")]
  InvalidTimebaseNum {
    /// The actual value.
    actual: u64,
    /// The maximal supported value.
    max: u64,
  },
  /// Timebase denominator is invalid.
  #[error("invalid timebase denominator {actual} (expected > 0, <= {max})")]
  InvalidTimebaseDen {
    /// The actual value.
    actual: u64,
    /// The maximal supported value.
    max: u64,
  },
  /// Worst quantizer is out of range.
  #[error("invalid max quantizer {actual} (expected <= {max})")]
  InvalidMaxQuantizer {
    /// The actual value.
    actual: u8,
    /// The maximal supported value.
    max: u8,
  },
  /// Best quantizer is above the worst one.
  #[error("invalid quantizer range {min}..={max}")]
  InvalidQuantizerRange {
    /// The configured best quantizer.
    min: u8,
    /// The configured worst quantizer.
    max: u8,
  },
  /// Quality level is outside the quantizer range.
  #[error("invalid cq level {actual} (expected >= {min}, <= {max})")]
  InvalidCqLevel {
    /// The actual value.
    actual: u8,
    /// The minimal supported value.
    min: u8,
    /// The maximal supported value.
    max: u8,
  },
  /// Lookahead depth is invalid.
  #[error("invalid lag in frames {actual} (expected <= {max})")]
  InvalidLagInFrames {
    /// The actual value.
    actual: usize,
    /// The maximal supported value.
    max: usize,
  },
  /// Number of temporal layers is invalid.
  #[error("invalid number of temporal layers {0} (expected >= 1, <= 5)")]
  InvalidTemporalLayers(usize),
  /// Layer pattern length is invalid.
  #[error("invalid layer periodicity {actual} (expected >= 1, <= {max})")]
  InvalidPeriodicity {
    /// The actual value.
    actual: usize,
    /// The maximal supported value.
    max: usize,
  },
  /// Layer bitrates must grow from one layer to the next.
  #[error("temporal layer bitrates are not strictly increasing")]
  TemporalBitratesNotIncreasing,
  /// Layer decimators must halve from one layer to the next down to 1.
  #[error("temporal layer decimators are not powers of 2")]
  TemporalDecimatorsNotPowerOfTwo,
  /// A layer pattern entry names a layer that does not exist.
  #[error("invalid layer id {actual} (expected <= {max})")]
  InvalidLayerId {
    /// The actual value.
    actual: usize,
    /// The maximal supported value.
    max: usize,
  },
  /// Drop water mark is not a percentage.
  #[error("invalid drop frame water mark {0} (expected <= 100)")]
  InvalidDropFrameWaterMark(u32),
  /// Undershoot limit is too large.
  #[error("invalid undershoot percentage {0} (expected <= 1000)")]
  InvalidUndershootPct(u32),
  /// Overshoot limit is too large.
  #[error("invalid overshoot percentage {0} (expected <= 1000)")]
  InvalidOvershootPct(u32),
  /// Recode budget is too large.
  #[error("invalid max recodes {actual} (expected <= {max})")]
  InvalidMaxRecodes {
    /// The actual value.
    actual: usize,
    /// The maximal supported value.
    max: usize,
  },
  /// The rate control needs a target bitrate in order to produce results
  #[error("The rate control requires a target bitrate")]
  TargetBitrateNeeded,
}

/// Contains the encoder configuration.
#[derive(Clone, Debug, Default)]
pub struct Config {
  /// Settings which impact the produced bitstream.
  pub(crate) enc: EncoderConfig,
  /// Rate control configuration
  pub(crate) rate_control: RateControlConfig,
  /// The number of threads in the threadpool.
  pub(crate) threads: usize,
}

impl Config {
  /// Create a default configuration
  ///
  /// same as `Default::default()`
  pub fn new() -> Self {
    Config::default()
  }

  /// Set the encoder configuration
  ///
  /// `EncoderConfig` contains the frame geometry, timing, reference
  /// scheduling and speed settings.
  pub const fn with_encoder_config(mut self, enc: EncoderConfig) -> Self {
    self.enc = enc;
    self
  }

  /// Set the number of workers in the threadpool
  ///
  /// The threadpool runs the motion search of one frame, one macroblock
  /// row per task.
  ///
  /// If it is left unset, the encoder will use the default global
  /// threadpool provided by Rayon instead.
  pub const fn with_threads(mut self, threads: usize) -> Self {
    self.threads = threads;
    self
  }

  /// Set the rate control configuration
  ///
  /// The default configuration is VBR at 256 kbit/s.
  pub const fn with_rate_control(
    mut self, rate_control: RateControlConfig,
  ) -> Self {
    self.rate_control = rate_control;
    self
  }

  /// The encoder configuration.
  pub const fn enc(&self) -> &EncoderConfig {
    &self.enc
  }

  /// The rate control configuration.
  pub const fn rate_control(&self) -> &RateControlConfig {
    &self.rate_control
  }

  /// Create a new threadpool with this configuration if set,
  /// or return `None` if global threadpool should be used instead.
  pub(crate) fn new_thread_pool(&self) -> Option<Arc<ThreadPool>> {
    if self.threads == 0 {
      return None;
    }
    match ThreadPoolBuilder::new().num_threads(self.threads).build() {
      Ok(pool) => Some(Arc::new(pool)),
      Err(e) => {
        log::warn!("falling back to the global thread pool: {}", e);
        None
      }
    }
  }

  /// Creates a [`Context`] with this configuration.
  ///
  /// # Errors
  ///
  /// Returns `InvalidConfig` if the config is invalid.
  ///
  /// # Examples
  ///
  /// ```
  /// use vp8ctl::prelude::*;
  ///
  /// # fn main() -> Result<(), InvalidConfig> {
  /// let cfg = Config::default();
  /// let ctx: Context<u8> = cfg.new_context()?;
  /// # Ok(())
  /// # }
  /// ```
  ///
  /// [`Context`]: struct.Context.html
  pub fn new_context<T: Pixel>(&self) -> Result<Context<T>, InvalidConfig> {
    self.validate()?;
    let inner = ContextInner::new(&self.enc, &self.rate_control);
    let pool = self.new_thread_pool();

    Ok(Context { is_flushing: false, inner, pool, config: self.clone() })
  }

  /// Validates the configuration.
  ///
  /// # Errors
  ///
  /// - Returns `InvalidConfig` if any setting is out of range or the
  ///   temporal layer description is inconsistent.
  pub fn validate(&self) -> Result<(), InvalidConfig> {
    use InvalidConfig::*;

    let config = &self.enc;
    let rc = &self.rate_control;

    if config.width < 16 || config.width > MAX_FRAME_DIMENSION {
      return Err(InvalidWidth(config.width));
    }
    if config.height < 16 || config.height > MAX_FRAME_DIMENSION {
      return Err(InvalidHeight(config.height));
    }

    if config.time_base.num == 0 || config.time_base.num > MAX_TIMEBASE {
      return Err(InvalidTimebaseNum {
        actual: config.time_base.num,
        max: MAX_TIMEBASE,
      });
    }
    if config.time_base.den == 0 || config.time_base.den > MAX_TIMEBASE {
      return Err(InvalidTimebaseDen {
        actual: config.time_base.den,
        max: MAX_TIMEBASE,
      });
    }

    if config.lag_in_frames > MAX_LAG_IN_FRAMES {
      return Err(InvalidLagInFrames {
        actual: config.lag_in_frames,
        max: MAX_LAG_IN_FRAMES,
      });
    }

    if config.speed_settings.max_recodes > MAX_RECODES {
      return Err(InvalidMaxRecodes {
        actual: config.speed_settings.max_recodes,
        max: MAX_RECODES,
      });
    }

    if rc.max_quantizer > MAX_USER_QUANTIZER {
      return Err(InvalidMaxQuantizer {
        actual: rc.max_quantizer,
        max: MAX_USER_QUANTIZER,
      });
    }
    if rc.min_quantizer > rc.max_quantizer {
      return Err(InvalidQuantizerRange {
        min: rc.min_quantizer,
        max: rc.max_quantizer,
      });
    }
    let cq_mode = matches!(
      rc.end_usage,
      EndUsage::ConstrainedQuality | EndUsage::ConstantQuality
    );
    if rc.cq_level > MAX_USER_QUANTIZER
      || (cq_mode
        && !(rc.min_quantizer..=rc.max_quantizer).contains(&rc.cq_level))
    {
      return Err(InvalidCqLevel {
        actual: rc.cq_level,
        min: rc.min_quantizer,
        max: rc.max_quantizer,
      });
    }

    if rc.drop_frame_water_mark > 100 {
      return Err(InvalidDropFrameWaterMark(rc.drop_frame_water_mark));
    }
    if rc.undershoot_pct > MAX_SHOOT_PCT {
      return Err(InvalidUndershootPct(rc.undershoot_pct));
    }
    if rc.overshoot_pct > MAX_SHOOT_PCT {
      return Err(InvalidOvershootPct(rc.overshoot_pct));
    }

    if rc.needs_bitrate() && rc.target_bitrate == 0 {
      return Err(TargetBitrateNeeded);
    }

    self.validate_temporal_layers()
  }

  fn validate_temporal_layers(&self) -> Result<(), InvalidConfig> {
    use InvalidConfig::*;

    let layers = &self.enc.temporal_layers;
    let n = layers.number_of_layers;
    if n == 0 || n > MAX_TEMPORAL_LAYERS {
      return Err(InvalidTemporalLayers(n));
    }
    if n == 1 {
      return Ok(());
    }

    if layers.periodicity == 0 || layers.periodicity > MAX_PERIODICITY {
      return Err(InvalidPeriodicity {
        actual: layers.periodicity,
        max: MAX_PERIODICITY,
      });
    }
    if layers.target_bitrate[..n].windows(2).any(|w| w[1] <= w[0]) {
      return Err(TemporalBitratesNotIncreasing);
    }
    let decimators = &layers.rate_decimator[..n];
    if decimators[n - 1] != 1
      || decimators.windows(2).any(|w| w[0] != 2 * w[1])
    {
      return Err(TemporalDecimatorsNotPowerOfTwo);
    }
    if let Some(&actual) =
      layers.layer_id[..layers.periodicity].iter().find(|&&id| id >= n)
    {
      return Err(InvalidLayerId { actual, max: n - 1 });
    }
    Ok(())
  }
}

#[cfg(test)]
mod test {
  use super::*;
  use crate::api::Rational;

  fn valid() -> Config {
    let enc = EncoderConfig {
      width: 176,
      height: 144,
      time_base: Rational::new(1, 25),
      ..Default::default()
    };
    Config::new().with_encoder_config(enc)
  }

  #[test]
  fn default_is_valid() {
    assert_eq!(Config::default().validate(), Ok(()));
    assert_eq!(valid().validate(), Ok(()));
  }

  #[test]
  fn geometry_and_timebase() {
    let mut cfg = valid();
    cfg.enc.width = 8;
    assert_eq!(cfg.validate(), Err(InvalidConfig::InvalidWidth(8)));

    let mut cfg = valid();
    cfg.enc.height = 1 << 14;
    assert_eq!(cfg.validate(), Err(InvalidConfig::InvalidHeight(1 << 14)));

    let mut cfg = valid();
    cfg.enc.time_base = Rational::new(1, 0);
    assert_eq!(
      cfg.validate(),
      Err(InvalidConfig::InvalidTimebaseDen { actual: 0, max: MAX_TIMEBASE })
    );
  }

  #[test]
  fn quantizers() {
    let cfg = valid()
      .with_rate_control(RateControlConfig::new().with_quantizer_range(4, 64));
    assert_eq!(
      cfg.validate(),
      Err(InvalidConfig::InvalidMaxQuantizer { actual: 64, max: 63 })
    );

    let cfg = valid()
      .with_rate_control(RateControlConfig::new().with_quantizer_range(40, 20));
    assert_eq!(
      cfg.validate(),
      Err(InvalidConfig::InvalidQuantizerRange { min: 40, max: 20 })
    );

    let rc = RateControlConfig::new()
      .with_end_usage(EndUsage::ConstrainedQuality)
      .with_quantizer_range(20, 50)
      .with_cq_level(10);
    assert_eq!(
      valid().with_rate_control(rc).validate(),
      Err(InvalidConfig::InvalidCqLevel { actual: 10, min: 20, max: 50 })
    );
  }

  #[test]
  fn bitrate_needed_unless_constant_quality() {
    let rc = RateControlConfig::new().with_target_bitrate(0);
    assert_eq!(
      valid().with_rate_control(rc).validate(),
      Err(InvalidConfig::TargetBitrateNeeded)
    );
    let rc = rc.with_end_usage(EndUsage::ConstantQuality);
    assert_eq!(valid().with_rate_control(rc).validate(), Ok(()));
  }

  #[test]
  fn temporal_layers() {
    let mut cfg = valid();
    cfg.enc.temporal_layers = TemporalLayers::two_layers(100, 250);
    assert_eq!(cfg.validate(), Ok(()));

    cfg.enc.temporal_layers.target_bitrate[1] = 100;
    assert_eq!(
      cfg.validate(),
      Err(InvalidConfig::TemporalBitratesNotIncreasing)
    );

    cfg.enc.temporal_layers = TemporalLayers::two_layers(100, 250);
    cfg.enc.temporal_layers.rate_decimator[0] = 3;
    assert_eq!(
      cfg.validate(),
      Err(InvalidConfig::TemporalDecimatorsNotPowerOfTwo)
    );

    cfg.enc.temporal_layers = TemporalLayers::two_layers(100, 250);
    cfg.enc.temporal_layers.layer_id[1] = 2;
    assert_eq!(
      cfg.validate(),
      Err(InvalidConfig::InvalidLayerId { actual: 2, max: 1 })
    );

    cfg.enc.temporal_layers.number_of_layers = 6;
    assert_eq!(cfg.validate(), Err(InvalidConfig::InvalidTemporalLayers(6)));
  }

  #[test]
  fn lag_and_percentages() {
    let mut cfg = valid();
    cfg.enc.lag_in_frames = 26;
    assert_eq!(
      cfg.validate(),
      Err(InvalidConfig::InvalidLagInFrames { actual: 26, max: 25 })
    );

    let cfg = valid().with_rate_control(RateControlConfig::new().with_drop_frames(101));
    assert_eq!(
      cfg.validate(),
      Err(InvalidConfig::InvalidDropFrameWaterMark(101))
    );

    let cfg = valid()
      .with_rate_control(RateControlConfig::new().with_shoot_pct(50, 2000));
    assert_eq!(cfg.validate(), Err(InvalidConfig::InvalidOvershootPct(2000)));
  }
}
