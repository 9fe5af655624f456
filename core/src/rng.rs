//! Injected randomness.
//!
//! RULE: Nothing in the core may call a global RNG.
//! Every draw goes through a `UnitRng` handed in by the caller, so a
//! round can be replayed exactly by replaying the same draws.
//!
//! Seeded runs derive one stream per slot from (master_seed, slot), so
//! adding a new slot never shifts the draws of an existing one.

use rand::{RngCore, SeedableRng};
use rand_pcg::Pcg64Mcg;

/// A source of uniform floats in [0.0, 1.0).
pub trait UnitRng {
    fn next_f64(&mut self) -> f64;

    /// Uniform float in [min, max).
    fn between(&mut self, min: f64, max: f64) -> f64 {
        min + (max - min) * self.next_f64()
    }

    /// Pick an index in [0, len). `len` must be > 0.
    fn index_below(&mut self, len: usize) -> usize {
        assert!(len > 0, "len must be > 0");
        let idx = (self.next_f64() * len as f64).floor() as usize;
        idx.min(len - 1)
    }
}

/// A named PCG stream.
pub struct StreamRng {
    pub name: &'static str,
    inner: Pcg64Mcg,
}

impl StreamRng {
    /// Derive a stream from the master seed and a stable slot index.
    /// The index must never change once assigned.
    pub fn new(master_seed: u64, slot_index: u64) -> Self {
        let derived_seed = master_seed ^ (slot_index.wrapping_mul(0x9e37_79b9_7f4a_7c15));
        Self {
            name: "unnamed",
            inner: Pcg64Mcg::seed_from_u64(derived_seed),
        }
    }

    /// Production stream seeded from OS entropy.
    pub fn from_entropy() -> Self {
        Self {
            name: "entropy",
            inner: Pcg64Mcg::from_entropy(),
        }
    }

    pub fn with_name(mut self, name: &'static str) -> Self {
        self.name = name;
        self
    }

    /// Draw a raw u64 (full range).
    pub fn next_u64(&mut self) -> u64 {
        self.inner.next_u64()
    }
}

impl UnitRng for StreamRng {
    fn next_f64(&mut self) -> f64 {
        let bits = self.inner.next_u64();
        (bits >> 11) as f64 * (1.0 / (1u64 << 53) as f64)
    }
}

/// Replays a fixed list of draws. Once exhausted it keeps returning the
/// last value (0.5 for an empty list).
#[derive(Debug, Clone)]
pub struct SequenceRng {
    values: Vec<f64>,
    pos: usize,
}

impl SequenceRng {
    pub fn new(values: impl Into<Vec<f64>>) -> Self {
        Self {
            values: values.into(),
            pos: 0,
        }
    }

    /// Number of draws consumed so far.
    pub fn consumed(&self) -> usize {
        self.pos
    }
}

impl UnitRng for SequenceRng {
    fn next_f64(&mut self) -> f64 {
        match self.values.get(self.pos) {
            Some(v) => {
                self.pos += 1;
                *v
            }
            None => self.values.last().copied().unwrap_or(0.5),
        }
    }
}

/// All streams for one engine, indexed by stable slot.
pub struct RngBank {
    master_seed: Option<u64>,
}

impl RngBank {
    pub fn seeded(master_seed: u64) -> Self {
        Self {
            master_seed: Some(master_seed),
        }
    }

    /// Streams come from OS entropy; nothing is reproducible.
    pub fn from_entropy() -> Self {
        Self { master_seed: None }
    }

    pub fn for_slot(&self, slot: RngSlot) -> StreamRng {
        match self.master_seed {
            Some(seed) => StreamRng::new(seed, slot as u64).with_name(slot.name()),
            None => StreamRng::from_entropy().with_name(slot.name()),
        }
    }
}

/// Stable stream slot assignments.
/// NEVER reorder or remove entries, only append.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u64)]
pub enum RngSlot {
    WinCap = 0,
    Payout = 1,
    PureRng = 2,
    Issuance = 3,
}

impl RngSlot {
    pub fn name(&self) -> &'static str {
        match self {
            Self::WinCap => "win_cap",
            Self::Payout => "payout",
            Self::PureRng => "pure_rng",
            Self::Issuance => "issuance",
        }
    }
}
