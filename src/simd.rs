//! Bit-level kernels for quantized inner products
//!
//! These are the scalar building blocks behind both estimation paths: the
//! bit-plane transpose of the quantized query, popcount-based inner products
//! against packed sign codes, and the plane-walking inner product used to
//! refine with extended codes. All layouts assume the dimensionality is a
//! multiple of 64, so every bitmap is a whole number of `u64` words.

/// Transpose per-dimension quantized values into bit-planes of 64-bit words.
///
/// Bit `k` of `out[plane * (dim / 64) + w]` is set iff the `plane`-th bit of
/// `values[64 * w + k]` is set.
pub fn transpose_bin(values: &[u16], out: &mut [u64], dim: usize, num_planes: usize) {
    debug_assert_eq!(values.len(), dim);
    debug_assert_eq!(dim % 64, 0);
    let words = dim / 64;
    debug_assert_eq!(out.len(), words * num_planes);

    out.fill(0);
    for (i, &v) in values.iter().enumerate() {
        let w = i / 64;
        let k = i % 64;
        for p in 0..num_planes {
            if (v >> p) & 1 == 1 {
                out[p * words + w] |= 1u64 << k;
            }
        }
    }
}

/// Inner product between a bit-plane quantized query and a packed sign code.
///
/// Reconstructs each query coordinate as `vl_base + delta * q_sq[i]` and
/// accumulates it over the set bits of `code` using AND + popcount per
/// plane, weighted by `2^plane * delta`.
pub fn bitplane_code_ip(
    code: &[u64],
    query_bin: &[u64],
    delta: f32,
    vl_base: f32,
    dim: usize,
    num_planes: usize,
) -> f32 {
    let words = dim / 64;
    debug_assert_eq!(code.len(), words);
    debug_assert_eq!(query_bin.len(), words * num_planes);

    let mut ones = 0u64;
    for &w in code {
        ones += u64::from(w.count_ones());
    }

    let mut weighted = 0u64;
    for p in 0..num_planes {
        let plane = &query_bin[p * words..(p + 1) * words];
        let mut acc = 0u64;
        for (qw, cw) in plane.iter().zip(code.iter()) {
            acc += u64::from((qw & cw).count_ones());
        }
        weighted += acc << p;
    }

    vl_base * ones as f32 + delta * weighted as f32
}

/// Exact masked inner product: sums `query[i]` over the set bits of `code`.
pub fn masked_float_ip(query: &[f32], code: &[u64]) -> f32 {
    debug_assert!(query.len() >= code.len() * 64);
    let mut acc = 0.0f32;
    for (w, &word) in code.iter().enumerate() {
        let base = w * 64;
        let mut m = word;
        while m != 0 {
            let k = m.trailing_zeros() as usize;
            acc += query[base + k];
            m &= m - 1;
        }
    }
    acc
}

/// Inner product between float query and a bit-plane packed extended code.
pub type ExtIpFn = fn(&[f32], &[u8], usize) -> f32;

/// Select the plane-walking routine for the given number of extended bits.
///
/// `ex_bits` is validated to be at most 12 wherever codes are configured.
pub fn ext_ip_func(ex_bits: u8) -> ExtIpFn {
    match ex_bits {
        0 => ext_ip_planes::<0>,
        1 => ext_ip_planes::<1>,
        2 => ext_ip_planes::<2>,
        3 => ext_ip_planes::<3>,
        4 => ext_ip_planes::<4>,
        5 => ext_ip_planes::<5>,
        6 => ext_ip_planes::<6>,
        7 => ext_ip_planes::<7>,
        8 => ext_ip_planes::<8>,
        9 => ext_ip_planes::<9>,
        10 => ext_ip_planes::<10>,
        11 => ext_ip_planes::<11>,
        12 => ext_ip_planes::<12>,
        _ => unreachable!("ex_bits validated at configuration time"),
    }
}

/// Computes `sum_i query[i] * ex_code[i]` where `ex_code` is stored as
/// `PLANES` bit-planes of `dim / 8` bytes each, LSB-first within a byte.
fn ext_ip_planes<const PLANES: usize>(query: &[f32], long_code: &[u8], dim: usize) -> f32 {
    debug_assert_eq!(dim % 8, 0);
    let plane_bytes = dim / 8;
    debug_assert!(long_code.len() >= PLANES * plane_bytes);

    let mut total = 0.0f32;
    for p in 0..PLANES {
        let plane = &long_code[p * plane_bytes..(p + 1) * plane_bytes];
        let mut acc = 0.0f32;
        for (byte_idx, &b) in plane.iter().enumerate() {
            let base = byte_idx * 8;
            let mut m = b;
            while m != 0 {
                let k = m.trailing_zeros() as usize;
                acc += query[base + k];
                m &= m - 1;
            }
        }
        total += ((1u32 << p) as f32) * acc;
    }
    total
}
