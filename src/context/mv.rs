// Copyright (c) 2017-2024, The rav1e contributors. All rights reserved
//
// This source code is subject to the terms of the BSD 2 Clause License and
// the Alliance for Open Media Patent License 1.0. If the BSD 2 Clause License
// was not distributed with this source code in the LICENSE file, you can
// obtain it at www.aomedia.org/license/software. If the Alliance for Open
// Media Patent License 1.0 was not distributed with this source code in the
// PATENTS file, you can obtain it at www.aomedia.org/license/patent.

use super::*;

pub const MVP_IS_SHORT: usize = 0;
pub const MVP_SIGN: usize = 1;
pub const MVP_SHORT: usize = 2;
pub const MVNUM_SHORT: usize = 8;
pub const MVP_BITS: usize = MVP_SHORT + MVNUM_SHORT - 1;
pub const MVLONG_WIDTH: usize = 10;
pub const MVP_COUNT: usize = MVP_BITS + MVLONG_WIDTH;

/// Largest magnitude of a coded motion vector component.
pub const MV_MAX: usize = (1 << MVLONG_WIDTH) - 1;
pub const MV_VALS: usize = 2 * MV_MAX + 1;

/// Largest full-pel magnitude covered by the SAD cost tables.
pub const MVFP_MAX: usize = 255;
pub const MVFP_VALS: usize = 2 * MVFP_MAX + 1;

#[rustfmt::skip]
pub static SMALL_MV_TREE: [i8; 14] = [
  2, 8,
  4, 6,
  -0, -1,
  -2, -3,
  10, 12,
  -4, -5,
  -6, -7,
];

/// Probabilities of one motion vector component.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MvContext {
  pub prob: [Prob; MVP_COUNT],
}

#[rustfmt::skip]
pub const DEFAULT_MV_CONTEXT: [MvContext; 2] = [
  MvContext {
    // row
    prob: [
      162, 128,
      225, 146, 172, 147, 214, 39, 156,
      128, 129, 132, 75, 145, 178, 206, 239, 254, 254,
    ],
  },
  MvContext {
    // col
    prob: [
      164, 128,
      204, 170, 119, 235, 140, 230, 228,
      128, 130, 130, 74, 148, 180, 203, 236, 254, 254,
    ],
  },
];

impl MvContext {
  /// Bit cost of the magnitude `x` of one component, sign excluded.
  pub fn component_cost(&self, x: usize) -> u32 {
    let p = &self.prob;

    if x < MVNUM_SHORT {
      return cost_zero(p[MVP_IS_SHORT])
        + treed_cost(&SMALL_MV_TREE, &p[MVP_SHORT..], x as u32, 3);
    }

    let mut cost = cost_one(p[MVP_IS_SHORT]);
    for i in 0..3 {
      cost += cost_bit(p[MVP_BITS + i], (x >> i) & 1 == 1);
    }
    // Bit 3 is implicit when no higher bit is set.
    for i in (4..MVLONG_WIDTH).rev() {
      cost += cost_bit(p[MVP_BITS + i], (x >> i) & 1 == 1);
    }
    if x & 0xFFF0 != 0 {
      cost += cost_bit(p[MVP_BITS + 3], (x >> 3) & 1 == 1);
    }

    cost
  }
}

/// Signed per-component bit cost tables derived from the motion vector
/// contexts, indexed by `value + MV_MAX`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MvCostTables {
  cost: [Box<[i32]>; 2],
}

impl MvCostTables {
  pub fn new(mvc: &[MvContext; 2]) -> Self {
    let mut tables = MvCostTables {
      cost: [
        vec![0; MV_VALS].into_boxed_slice(),
        vec![0; MV_VALS].into_boxed_slice(),
      ],
    };
    tables.update(mvc, [true, true]);
    tables
  }

  /// Rebuilds the table of every component whose flag is set.
  pub fn update(&mut self, mvc: &[MvContext; 2], flags: [bool; 2]) {
    for (comp, ctx) in mvc.iter().enumerate() {
      if !flags[comp] {
        continue;
      }
      let table = &mut self.cost[comp];
      let sign = ctx.prob[MVP_SIGN];

      table[MV_MAX] = ctx.component_cost(0) as i32;
      for i in 1..=MV_MAX {
        let c = ctx.component_cost(i);
        table[MV_MAX + i] = (c + cost_zero(sign)) as i32;
        table[MV_MAX - i] = (c + cost_one(sign)) as i32;
      }
    }
  }

  /// Cost of value `v` of component `comp` (0 = row, 1 = col).
  ///
  /// Values beyond the coded range cost as much as the range limit.
  #[inline]
  pub fn cost(&self, comp: usize, v: i32) -> i32 {
    let idx = (v.clamp(-(MV_MAX as i32), MV_MAX as i32) + MV_MAX as i32)
      as usize;
    self.cost[comp][idx]
  }
}

impl Default for MvCostTables {
  fn default() -> Self {
    Self::new(&DEFAULT_MV_CONTEXT)
  }
}

/// Approximate full-pel motion vector costs used while searching on SAD.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MvSadCosts {
  cost: Box<[i32]>,
}

impl MvSadCosts {
  pub fn new() -> Self {
    let mut cost = vec![0; MVFP_VALS];
    cost[MVFP_MAX] = 300;
    for i in 1..=MVFP_MAX {
      let z = 256.0 * (2.0 * (((8 * i) as f32).log2() as f64 + 0.6));
      cost[MVFP_MAX + i] = z as i32;
      cost[MVFP_MAX - i] = z as i32;
    }
    MvSadCosts { cost: cost.into_boxed_slice() }
  }

  /// Cost of the full-pel component value `v`, shared by rows and columns.
  #[inline]
  pub fn cost(&self, v: i32) -> i32 {
    let idx = (v.clamp(-(MVFP_MAX as i32), MVFP_MAX as i32) + MVFP_MAX as i32)
      as usize;
    self.cost[idx]
  }
}

impl Default for MvSadCosts {
  fn default() -> Self {
    Self::new()
  }
}

#[cfg(test)]
mod test {
  use super::*;

  #[test]
  fn short_values_use_the_tree() {
    let ctx = &DEFAULT_MV_CONTEXT[0];
    let p = &ctx.prob;
    // 0 is the left-most leaf: three zero bits.
    let expected = cost_zero(p[MVP_IS_SHORT])
      + cost_zero(p[MVP_SHORT])
      + cost_zero(p[MVP_SHORT + 1])
      + cost_zero(p[MVP_SHORT + 2]);
    assert_eq!(ctx.component_cost(0), expected);
  }

  #[test]
  fn long_values_skip_implicit_bit() {
    let ctx = &DEFAULT_MV_CONTEXT[1];
    let p = &ctx.prob;
    // 8 = 0b1000: bit 3 is implied by the absence of higher bits.
    let mut expected = cost_one(p[MVP_IS_SHORT]);
    for i in 0..3 {
      expected += cost_zero(p[MVP_BITS + i]);
    }
    for i in 4..MVLONG_WIDTH {
      expected += cost_zero(p[MVP_BITS + i]);
    }
    assert_eq!(ctx.component_cost(8), expected);
    assert_eq!(
      ctx.component_cost(24),
      expected - cost_zero(p[MVP_BITS + 4])
        + cost_one(p[MVP_BITS + 4])
        + cost_one(p[MVP_BITS + 3])
    );
  }

  #[test]
  fn signed_tables_add_sign_cost() {
    let tables = MvCostTables::default();
    let ctx = &DEFAULT_MV_CONTEXT[0];
    let sign = ctx.prob[MVP_SIGN];
    assert_eq!(tables.cost(0, 0), ctx.component_cost(0) as i32);
    assert_eq!(
      tables.cost(0, 5),
      (ctx.component_cost(5) + cost_zero(sign)) as i32
    );
    assert_eq!(
      tables.cost(0, -5),
      (ctx.component_cost(5) + cost_one(sign)) as i32
    );
    assert_eq!(tables.cost(1, 5000), tables.cost(1, MV_MAX as i32));
  }

  #[test]
  fn update_respects_flags() {
    let mut tables = MvCostTables::default();
    let mut mvc = DEFAULT_MV_CONTEXT;
    mvc[0].prob[MVP_IS_SHORT] = 2;
    mvc[1].prob[MVP_IS_SHORT] = 2;
    let before = tables.clone();
    tables.update(&mvc, [false, true]);
    assert_eq!(tables.cost(0, 3), before.cost(0, 3));
    assert_ne!(tables.cost(1, 3), before.cost(1, 3));
  }

  #[test]
  fn sad_costs_grow_with_distance() {
    let costs = MvSadCosts::new();
    assert_eq!(costs.cost(0), 300);
    assert_eq!(costs.cost(1), 1843);
    assert_eq!(costs.cost(-1), costs.cost(1));
    for v in 1..MVFP_MAX as i32 {
      assert!(costs.cost(v) <= costs.cost(v + 1));
    }
    assert_eq!(costs.cost(1000), costs.cost(MVFP_MAX as i32));
  }
}
