// Copyright (c) 2017-2024, The rav1e contributors. All rights reserved
//
// This source code is subject to the terms of the BSD 2 Clause License and
// the Alliance for Open Media Patent License 1.0. If the BSD 2 Clause License
// was not distributed with this source code in the LICENSE file, you can
// obtain it at www.aomedia.org/license/software. If the Alliance for Open
// Media Patent License 1.0 was not distributed with this source code in the
// PATENTS file, you can obtain it at www.aomedia.org/license/patent.

//! Entropy-adaptive coding state: probability costs, motion vector
//! contexts and the snapshot used by the recode loop.

mod coding_context;
mod mv;

pub use self::coding_context::*;
pub use self::mv::*;

pub type Prob = u8;

/// Cost in 1/256 bit of coding a zero with probability `p/256`.
#[rustfmt::skip]
pub static PROB_COST: [u16; 256] = [
  2047, 2047, 1791, 1641, 1535, 1452, 1385, 1328, 1279, 1235, 1196, 1161,
  1129, 1099, 1072, 1046, 1023, 1000, 979, 959, 940, 922, 905, 888,
  873, 858, 843, 829, 816, 803, 790, 778, 767, 755, 744, 733,
  723, 713, 703, 693, 684, 675, 666, 657, 649, 641, 632, 625,
  617, 609, 602, 594, 587, 580, 573, 566, 560, 553, 547, 541,
  534, 528, 522, 516, 511, 505, 499, 494, 488, 483, 477, 472,
  467, 462, 457, 452, 447, 442, 437, 433, 428, 423, 419, 414,
  410, 406, 401, 397, 393, 389, 385, 381, 376, 372, 369, 365,
  361, 357, 353, 349, 346, 342, 338, 335, 331, 328, 324, 321,
  317, 314, 310, 307, 304, 301, 297, 294, 291, 288, 285, 281,
  278, 275, 272, 269, 266, 263, 260, 257, 255, 252, 249, 246,
  243, 240, 238, 235, 232, 229, 227, 224, 221, 219, 216, 214,
  211, 208, 206, 203, 201, 198, 196, 193, 191, 189, 186, 184,
  181, 179, 177, 174, 172, 170, 167, 165, 163, 161, 158, 156,
  154, 152, 150, 148, 145, 143, 141, 139, 137, 135, 133, 131,
  129, 127, 125, 122, 120, 118, 116, 114, 113, 111, 109, 107,
  105, 103, 101, 99, 97, 95, 93, 92, 90, 88, 86, 84,
  82, 81, 79, 77, 75, 73, 72, 70, 68, 66, 65, 63,
  61, 60, 58, 56, 54, 53, 51, 49, 48, 46, 45, 43,
  41, 40, 38, 36, 35, 33, 32, 30, 29, 27, 25, 24,
  22, 21, 19, 18, 16, 15, 13, 12, 10, 9, 7, 6,
  4, 3, 1, 1,
];

#[inline]
pub fn cost_zero(p: Prob) -> u32 {
  PROB_COST[p as usize] as u32
}

#[inline]
pub fn cost_one(p: Prob) -> u32 {
  PROB_COST[255 - p as usize] as u32
}

#[inline]
pub fn cost_bit(p: Prob, bit: bool) -> u32 {
  if bit {
    cost_one(p)
  } else {
    cost_zero(p)
  }
}

/// Binary tree as stored by the bitstream: positive entries index the next
/// node pair, non-positive entries are negated leaf values.
pub type Tree = [i8];

/// Cost of coding the `n` low bits of `v` through `tree`, most significant
/// bit first, with one probability per node pair.
pub fn treed_cost(tree: &Tree, probs: &[Prob], v: u32, n: u32) -> u32 {
  let mut cost = 0;
  let mut i = 0usize;
  let mut n = n;

  while n > 0 {
    n -= 1;
    let bit = (v >> n) & 1 == 1;
    cost += cost_bit(probs[i >> 1], bit);
    let next = tree[i + bit as usize];
    if next <= 0 {
      break;
    }
    i = next as usize;
  }

  cost
}
