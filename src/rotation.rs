//! Random orthonormal query rotation
//!
//! Queries are optionally projected through a random orthonormal matrix
//! before estimation so that quantization errors spread evenly across
//! dimensions. The matrix is generated once from a seed and shared
//! read-only across query threads.

use rand::prelude::*;
use rand_distr::{Distribution, Normal};

use crate::math::{dot, normalize};

/// Random orthonormal rotator built via Gram-Schmidt orthogonalisation.
#[derive(Debug, Clone)]
pub struct RandomRotator {
    dim: usize,
    matrix: Vec<f32>, // Row-major storage
}

impl RandomRotator {
    /// Create a new random rotator with the provided seed.
    pub fn new(dim: usize, seed: u64) -> Self {
        let mut rng = StdRng::seed_from_u64(seed);
        let normal = Normal::new(0.0, 1.0).expect("failed to create normal distribution");
        let mut basis: Vec<Vec<f32>> = Vec::with_capacity(dim);

        while basis.len() < dim {
            let mut vec: Vec<f32> = (0..dim).map(|_| normal.sample(&mut rng) as f32).collect();

            // Orthogonalise against previous basis vectors.
            for prev in &basis {
                let proj = dot(&vec, prev);
                for (v, p) in vec.iter_mut().zip(prev.iter()) {
                    *v -= proj * *p;
                }
            }

            // Degenerate draws are discarded and re-sampled.
            if normalize(&mut vec) > f32::EPSILON {
                basis.push(vec);
            }
        }

        let mut matrix = Vec::with_capacity(dim * dim);
        for row in basis {
            matrix.extend_from_slice(&row);
        }

        Self { dim, matrix }
    }

    pub fn dim(&self) -> usize {
        self.dim
    }

    /// Row-major projection matrix.
    pub fn matrix(&self) -> &[f32] {
        &self.matrix
    }

    /// Apply the rotation to a vector, returning the rotated output.
    pub fn apply(&self, input: &[f32]) -> Vec<f32> {
        let mut output = vec![0.0f32; self.dim];
        self.apply_into(input, &mut output);
        output
    }

    /// Apply the rotation into an existing buffer.
    pub fn apply_into(&self, input: &[f32], output: &mut [f32]) {
        assert_eq!(input.len(), self.dim);
        assert_eq!(output.len(), self.dim);

        // Single-threaded sgemm keeps thread counts composable with an
        // outer query worker pool.
        unsafe {
            matrixmultiply::sgemm(
                self.dim,
                self.dim,
                1,
                1.0,
                self.matrix.as_ptr(),
                self.dim as isize,
                1,
                input.as_ptr(),
                1,
                1,
                0.0,
                output.as_mut_ptr(),
                1,
                1,
            );
        }
    }
}
