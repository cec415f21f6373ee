// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::hash::Hasher;

use fnv::FnvHasher;
use serde::{Deserialize, Serialize};

/// Register index bits. 2^14 registers = 16 KiB per sketch, standard error
/// `1.04 / sqrt(2^14)` ≈ 0.8%.
const PRECISION: u32 = 14;
const NUM_REGISTERS: usize = 1 << PRECISION;

/// HyperLogLog cardinality sketch over byte strings.
///
/// `add` is idempotent per distinct input, `merge` is a register-wise max
/// (associative and commutative), and memory is fixed regardless of the
/// true cardinality. The hash is unseeded so two hosts sketching the same
/// members produce identical registers, which keeps merges meaningful.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CardSketch {
    registers: Vec<u8>,
}

impl Default for CardSketch {
    fn default() -> Self {
        Self::new()
    }
}

/// 64-bit finalizer (splitmix64). FNV alone clusters similar strings; the
/// finalizer spreads them across registers.
fn mix(mut x: u64) -> u64 {
    x ^= x >> 30;
    x = x.wrapping_mul(0xbf58476d1ce4e5b9);
    x ^= x >> 27;
    x = x.wrapping_mul(0x94d049bb133111eb);
    x ^ (x >> 31)
}

impl CardSketch {
    pub fn new() -> Self {
        CardSketch {
            registers: vec![0; NUM_REGISTERS],
        }
    }

    pub fn add(&mut self, member: &[u8]) {
        let mut hasher = FnvHasher::default();
        hasher.write(member);
        let hash = mix(hasher.finish());

        let index = (hash >> (64 - PRECISION)) as usize;
        // Rank of the first set bit in the remaining stream, 1-based.
        let rest = hash << PRECISION;
        let rank = if rest == 0 {
            (64 - PRECISION + 1) as u8
        } else {
            rest.leading_zeros() as u8 + 1
        };
        if rank > self.registers[index] {
            self.registers[index] = rank;
        }
    }

    /// Register-wise max. The result is exactly the sketch that would have
    /// been produced by adding both member streams to one sketch.
    pub fn merge(&mut self, other: &CardSketch) {
        for (mine, theirs) in self.registers.iter_mut().zip(&other.registers) {
            if *theirs > *mine {
                *mine = *theirs;
            }
        }
    }

    /// Estimated number of distinct members.
    pub fn estimate(&self) -> f64 {
        let m = NUM_REGISTERS as f64;
        let alpha = 0.7213 / (1.0 + 1.079 / m);

        let mut inverse_sum = 0.0;
        let mut zeros = 0u64;
        for &register in &self.registers {
            inverse_sum += 1.0 / (1u64 << register) as f64;
            if register == 0 {
                zeros += 1;
            }
        }

        let raw = alpha * m * m / inverse_sum;
        if raw <= 2.5 * m && zeros > 0 {
            // Linear counting is more accurate while most registers are
            // still empty.
            m * (m / zeros as f64).ln()
        } else {
            raw
        }
    }

    pub fn is_empty(&self) -> bool {
        self.registers.iter().all(|&r| r == 0)
    }
}
