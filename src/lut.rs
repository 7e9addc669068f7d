//! Per-query lookup table for fast-scan evaluation
//!
//! Database sign codes are stored 4 bits per dimension group (4 consecutive
//! dimensions). For each group the table holds the inner product between
//! the query restricted to those 4 dimensions and each of the 16 possible
//! group values, so evaluating one code costs one table lookup per group
//! instead of a full-width dot product.

use crate::estimator::EST_ERROR;
use crate::memory::AlignedVec;
use crate::{SaqError, DIM_PAD_SIZE, FAST_SCAN_SIZE};

/// Query lookup table plus the per-block accumulator state shared with the
/// refinement path.
#[derive(Debug)]
pub struct Lut {
    num_dim_pad: usize,
    ex_bits: u8,
    /// 16 entries per dimension group; `4 * num_dim_pad` floats total.
    table: AlignedVec<f32>,
    /// Plain code-vs-query sums for the most recent block, consumed by
    /// [`Lut::ext_ip`].
    block_ip: [f32; FAST_SCAN_SIZE],
    q_l2sqr: f32,
    sum_q: f32,
    inv_sqrt_d: f32,
}

impl Lut {
    /// Allocate the table for `num_dim_pad` dimensions and `ex_bits`
    /// refinement bits.
    pub fn new(num_dim_pad: usize, ex_bits: u8) -> Result<Self, SaqError> {
        assert!(
            num_dim_pad > 0 && num_dim_pad % DIM_PAD_SIZE == 0,
            "num_dim_pad must be a positive multiple of 64"
        );
        let table = AlignedVec::zeroed(num_dim_pad * 4, 64)?;
        Ok(Self {
            num_dim_pad,
            ex_bits,
            table,
            block_ip: [0.0; FAST_SCAN_SIZE],
            q_l2sqr: 0.0,
            sum_q: 0.0,
            inv_sqrt_d: 1.0 / (num_dim_pad as f32).sqrt(),
        })
    }

    /// Fill the table for a (possibly centroid-shifted) query.
    pub fn prepare(&mut self, query: &[f32]) {
        assert_eq!(query.len(), self.num_dim_pad);
        self.q_l2sqr = crate::math::l2_norm_sqr(query);
        self.sum_q = crate::math::sum(query);

        for (g, chunk) in query.chunks_exact(4).enumerate() {
            let t = &mut self.table[g * 16..(g + 1) * 16];
            t[0] = 0.0;
            // Each entry extends the entry with its lowest set bit cleared.
            for v in 1..16usize {
                t[v] = t[v & (v - 1)] + chunk[v.trailing_zeros() as usize];
            }
        }
        self.block_ip = [0.0; FAST_SCAN_SIZE];
    }

    /// Squared norm of the prepared query.
    pub fn q_l2sqr(&self) -> f32 {
        self.q_l2sqr
    }

    /// Sum of the prepared query's coordinates.
    pub fn sum_q(&self) -> f32 {
        self.sum_q
    }

    /// Evaluate one 32-code block.
    ///
    /// `short_code` is the interleaved nibble layout: the group code for
    /// dimension group `G` and slot `j` lives at byte
    /// `(G/4)*64 + (G%4)*16 + j/2`, low nibble for even `j`. When `out` is
    /// given, writes an estimate of twice the inner product between the
    /// prepared query and each encoded residual, modulated by that code's
    /// residual norm. With `out == None` only the internal accumulator is
    /// refreshed for a later [`Lut::ext_ip`].
    pub fn comp_fast_ip(
        &mut self,
        o_l2norm: &[f32],
        short_code: &[u8],
        out: Option<&mut [f32; FAST_SCAN_SIZE]>,
    ) {
        debug_assert_eq!(o_l2norm.len(), FAST_SCAN_SIZE);
        debug_assert_eq!(
            short_code.len(),
            FAST_SCAN_SIZE * self.num_dim_pad / 8
        );

        self.block_ip = [0.0; FAST_SCAN_SIZE];
        let lines = self.num_dim_pad / 16;
        for line in 0..lines {
            for lane in 0..4 {
                let g = line * 4 + lane;
                let tab = &self.table[g * 16..g * 16 + 16];
                let seg_base = line * 64 + lane * 16;
                let seg = &short_code[seg_base..seg_base + 16];
                for (pair, &byte) in seg.iter().enumerate() {
                    let j = pair * 2;
                    self.block_ip[j] += tab[(byte & 0x0F) as usize];
                    self.block_ip[j + 1] += tab[(byte >> 4) as usize];
                }
            }
        }

        if let Some(out) = out {
            let scale = 2.0 * self.inv_sqrt_d / EST_ERROR;
            for j in 0..FAST_SCAN_SIZE {
                out[j] = o_l2norm[j] * (2.0 * self.block_ip[j] - self.sum_q) * scale;
            }
        }
    }

    /// Refine slot `j` of the current block with its extended code.
    ///
    /// `long_code` holds `ex_bits` bit-planes of `num_dim_pad / 8` bytes
    /// each and `delta` is the quantization step `2 / 2^num_bits`. Returns
    /// the reconstructed inner product in code space; the caller applies
    /// the per-vector rescale.
    pub fn ext_ip(&self, long_code: &[u8], delta: f64, j: usize) -> f32 {
        debug_assert!(j < FAST_SCAN_SIZE);
        let plane_bytes = self.num_dim_pad / 8;
        let mut ex_acc = 0.0f32;
        for p in 0..self.ex_bits as usize {
            let plane = &long_code[p * plane_bytes..(p + 1) * plane_bytes];
            let mut ip = 0.0f32;
            for (pair, &byte) in plane.iter().enumerate() {
                let g = pair * 2;
                ip += self.table[g * 16 + (byte & 0x0F) as usize];
                ip += self.table[(g + 1) * 16 + (byte >> 4) as usize];
            }
            ex_acc += ((1u32 << p) as f32) * ip;
        }
        let delta = delta as f32;
        self.block_ip[j] + delta * ex_acc + (0.5 * delta - 1.0) * self.sum_q
    }
}
