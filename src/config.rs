use serde::{Deserialize, Serialize};

use crate::rotation::RandomRotator;
use crate::{DistType, SaqError, DIM_PAD_SIZE, MAX_QUANTIZE_BITS};

/// Static description of how a collection was quantized.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuantizerConfig {
    /// Padded dimensionality; always a multiple of 64.
    pub num_dim_pad: usize,
    /// Total bits per dimension per code, 0 to 13.
    pub num_bits: u8,
    /// Selects the block-batched layout over the single-code layout.
    pub use_fastscan: bool,
}

impl QuantizerConfig {
    pub fn new(num_dim_pad: usize, num_bits: u8, use_fastscan: bool) -> Self {
        Self {
            num_dim_pad,
            num_bits,
            use_fastscan,
        }
    }

    /// Bits per dimension in the extended refinement code.
    pub fn ex_bits(&self) -> u8 {
        self.num_bits.saturating_sub(1)
    }

    pub fn validate(&self) -> Result<(), SaqError> {
        if self.num_dim_pad == 0 || self.num_dim_pad % DIM_PAD_SIZE != 0 {
            return Err(SaqError::ConfigMismatch(
                "num_dim_pad must be a positive multiple of 64",
            ));
        }
        if self.num_bits > MAX_QUANTIZE_BITS {
            return Err(SaqError::QuantizeOutOfRange(self.num_bits));
        }
        Ok(())
    }
}

/// Quantizer configuration plus the optional query rotator.
///
/// Shared read-only across all estimators of a collection.
#[derive(Debug, Clone)]
pub struct QuantizerData {
    pub cfg: QuantizerConfig,
    pub rotator: Option<RandomRotator>,
}

impl QuantizerData {
    pub fn new(cfg: QuantizerConfig) -> Self {
        Self { cfg, rotator: None }
    }

    pub fn with_rotator(cfg: QuantizerConfig, rotator: RandomRotator) -> Self {
        Self {
            cfg,
            rotator: Some(rotator),
        }
    }
}

/// Per-search knobs consumed by the estimators.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct SearcherConfig {
    pub dist_type: DistType,
    /// Multiplier applied to the variance value handed to
    /// `set_prune_bound`.
    pub searcher_vars_bound_m: f32,
}

impl SearcherConfig {
    pub fn new(dist_type: DistType) -> Self {
        Self {
            dist_type,
            searcher_vars_bound_m: 1.0,
        }
    }
}

impl Default for SearcherConfig {
    fn default() -> Self {
        Self::new(DistType::L2Sqr)
    }
}
