//! Read-only per-cluster code storage
//!
//! A cluster owns its centroid plus the packed codes and factors for every
//! member vector, laid out for whichever estimation path the collection was
//! built for. Estimators borrow a cluster immutably; one cluster may be
//! shared by any number of concurrent queries.
//!
//! Fast-scan blocks interleave the 4-bit group codes of 32 vectors so that
//! 16 dimensions of a whole block occupy one 64-byte line. Extended codes
//! are stored as bit-planes with the vector stride rounded up to 64 bytes,
//! so every accessor below hands out 64-byte aligned data.

use crate::memory::{round_up_to_multiple_of, AlignedVec};
use crate::{SaqError, FAST_SCAN_SIZE};

/// Per-vector refinement factor.
#[derive(Debug, Clone, Copy, Default)]
pub struct ExFactor {
    /// Maps the reconstructed code-space inner product back to the scale of
    /// the original residual.
    pub rescale: f32,
}

/// Packed codes and factors for one cluster.
#[derive(Debug)]
pub struct ClusterData {
    num_dim_pad: usize,
    num_bits: u8,
    ex_bits: u8,
    use_fastscan: bool,
    num_vectors: usize,
    num_blocks: usize,
    long_stride: usize,
    centroid: AlignedVec<f32>,
    /// `|o - c|` per vector, grouped by block.
    factors: AlignedVec<f32>,
    /// Fast-scan interleaved sign codes, one segment per block.
    short_codes: AlignedVec<u8>,
    /// Single-layout sign codes, `num_dim_pad / 64` words per vector.
    single_codes: AlignedVec<u64>,
    /// Bit-plane extended codes, `long_stride` bytes per vector.
    long_codes: AlignedVec<u8>,
    long_factors: Vec<ExFactor>,
}

impl ClusterData {
    /// Allocate zeroed storage for `num_vectors` codes.
    pub fn new(
        num_dim_pad: usize,
        num_bits: u8,
        num_vectors: usize,
        use_fastscan: bool,
        centroid: &[f32],
    ) -> Result<Self, SaqError> {
        crate::config::QuantizerConfig::new(num_dim_pad, num_bits, use_fastscan).validate()?;
        assert_eq!(centroid.len(), num_dim_pad);

        let ex_bits = num_bits.saturating_sub(1);
        let num_blocks = (num_vectors + FAST_SCAN_SIZE - 1) / FAST_SCAN_SIZE;
        let block_bytes = FAST_SCAN_SIZE * num_dim_pad / 8;
        let short_len = if use_fastscan && num_bits > 0 {
            num_blocks * block_bytes
        } else {
            0
        };
        let single_len = if !use_fastscan && num_bits > 0 {
            num_vectors * num_dim_pad / 64
        } else {
            0
        };
        let long_stride = if ex_bits > 0 {
            round_up_to_multiple_of(ex_bits as usize * num_dim_pad / 8, 64)
        } else {
            0
        };

        let mut centroid_buf = AlignedVec::zeroed(num_dim_pad, 64)?;
        centroid_buf.copy_from_slice(centroid);

        let short_codes = AlignedVec::zeroed(short_len, 64)?;
        let long_codes = AlignedVec::zeroed(num_vectors * long_stride, 64)?;
        #[cfg(feature = "huge_pages")]
        {
            short_codes.advise_huge_pages();
            long_codes.advise_huge_pages();
        }

        Ok(Self {
            num_dim_pad,
            num_bits,
            ex_bits,
            use_fastscan,
            num_vectors,
            num_blocks,
            long_stride,
            centroid: centroid_buf,
            factors: AlignedVec::zeroed(num_blocks * FAST_SCAN_SIZE, 64)?,
            short_codes,
            single_codes: AlignedVec::zeroed(single_len, 64)?,
            long_codes,
            long_factors: vec![ExFactor::default(); num_vectors],
        })
    }

    /// Write one vector's codes and factors into the packed layouts.
    ///
    /// `bits` holds the per-dimension sign bits (0 or 1) and `ex_code` the
    /// per-dimension extended values; both are ignored where the bit width
    /// makes them empty. Each slot is expected to be written once.
    pub fn set_vector(
        &mut self,
        vec_idx: usize,
        bits: &[u8],
        ex_code: &[u16],
        o_l2norm: f32,
        rescale: f32,
    ) {
        assert!(vec_idx < self.num_vectors);
        let block_idx = vec_idx / FAST_SCAN_SIZE;
        let j = vec_idx % FAST_SCAN_SIZE;

        self.factors[block_idx * FAST_SCAN_SIZE + j] = o_l2norm;
        self.long_factors[vec_idx].rescale = rescale;

        if self.num_bits == 0 {
            return;
        }
        assert_eq!(bits.len(), self.num_dim_pad);

        if self.use_fastscan {
            let block_bytes = FAST_SCAN_SIZE * self.num_dim_pad / 8;
            let seg = &mut self.short_codes[block_idx * block_bytes..][..block_bytes];
            for g in 0..self.num_dim_pad / 4 {
                let mut v = 0u8;
                for i in 0..4 {
                    v |= (bits[4 * g + i] & 1) << i;
                }
                let byte = (g / 4) * 64 + (g % 4) * 16 + j / 2;
                if j % 2 == 0 {
                    seg[byte] |= v;
                } else {
                    seg[byte] |= v << 4;
                }
            }
        } else {
            let words = self.num_dim_pad / 64;
            let seg = &mut self.single_codes[vec_idx * words..][..words];
            for (i, &bit) in bits.iter().enumerate() {
                if bit != 0 {
                    seg[i / 64] |= 1u64 << (i % 64);
                }
            }
        }

        if self.ex_bits > 0 {
            assert_eq!(ex_code.len(), self.num_dim_pad);
            let plane_bytes = self.num_dim_pad / 8;
            let seg = &mut self.long_codes[vec_idx * self.long_stride..][..self.long_stride];
            for p in 0..self.ex_bits as usize {
                for (i, &code) in ex_code.iter().enumerate() {
                    if (code >> p) & 1 == 1 {
                        seg[p * plane_bytes + i / 8] |= 1 << (i % 8);
                    }
                }
            }
        }
    }

    pub fn num_dim_pad(&self) -> usize {
        self.num_dim_pad
    }

    pub fn num_bits(&self) -> u8 {
        self.num_bits
    }

    pub fn is_fastscan(&self) -> bool {
        self.use_fastscan
    }

    pub fn num_vectors(&self) -> usize {
        self.num_vectors
    }

    pub fn num_blocks(&self) -> usize {
        self.num_blocks
    }

    pub fn centroid(&self) -> &[f32] {
        &self.centroid
    }

    /// Residual norms `|o - c|` for the 32 codes of a block.
    pub fn factor_o_l2norm(&self, block_idx: usize) -> &[f32] {
        &self.factors[block_idx * FAST_SCAN_SIZE..][..FAST_SCAN_SIZE]
    }

    /// Interleaved fast-scan sign codes for a block.
    pub fn short_code(&self, block_idx: usize) -> &[u8] {
        let block_bytes = FAST_SCAN_SIZE * self.num_dim_pad / 8;
        &self.short_codes[block_idx * block_bytes..][..block_bytes]
    }

    /// Packed sign code of one vector in the single layout.
    pub fn short_code_single(&self, vec_idx: usize) -> &[u64] {
        let words = self.num_dim_pad / 64;
        &self.single_codes[vec_idx * words..][..words]
    }

    /// Bit-plane extended code of one vector; empty when `num_bits <= 1`.
    pub fn long_code(&self, vec_idx: usize) -> &[u8] {
        &self.long_codes[vec_idx * self.long_stride..][..self.long_stride]
    }

    pub fn long_factor(&self, vec_idx: usize) -> &ExFactor {
        &self.long_factors[vec_idx]
    }
}
