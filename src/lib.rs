pub mod buffer;
pub mod cluster;
pub mod config;
pub mod estimator;
pub mod lut;
pub mod memory;
pub mod rotation;

mod math;
mod simd;

pub use buffer::SearchBuffer;
pub use cluster::{ClusterData, ExFactor};
pub use config::{QuantizerConfig, QuantizerData, SearcherConfig};
pub use estimator::{CluEstimator, CluSingleEstimator, QueryRuntimeMetrics, SingleEstimator};
pub use lut::Lut;
pub use memory::AlignedVec;
pub use rotation::RandomRotator;


/// Number of codes evaluated together by the fast-scan kernels.
pub const FAST_SCAN_SIZE: usize = 32;

/// Vectors are padded so their dimensionality is a multiple of this.
pub const DIM_PAD_SIZE: usize = 64;

/// Upper bound on `num_bits`; the extended-code rescale overflows beyond it.
pub const MAX_QUANTIZE_BITS: u8 = 13;

/// Distance measure used by the estimators.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum DistType {
    /// Squared Euclidean distance.
    L2Sqr,
    /// Inner product (maximum similarity).
    InnerProduct,
}

/// Errors that can occur when constructing or driving the estimators.
#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum SaqError {
    /// Returned when the storage layout conflicts with the estimator being
    /// constructed.
    #[error("configuration mismatch: {0}")]
    ConfigMismatch(&'static str),
    /// Returned when `num_bits` exceeds [`MAX_QUANTIZE_BITS`].
    #[error("num_bits = {0} exceeds the supported maximum of 13")]
    QuantizeOutOfRange(u8),
    /// Returned for contract surface that is not implemented.
    #[error("not implemented: {0}")]
    NotImplemented(&'static str),
    /// Returned when the platform allocator refuses an aligned allocation.
    #[error("aligned allocation of {size} bytes (alignment {alignment}) failed")]
    AllocationError { size: usize, alignment: usize },
    /// Returned when a call sequencing requirement is broken.
    #[error("precondition violated: {0}")]
    PreconditionViolated(&'static str),
}

/// A scored candidate; the ordering key is `distance` ascending.
///
/// The top bit of `id` is reserved for the search buffer's checked flag, so
/// database ids must fit in 31 bits.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
#[repr(C)]
pub struct Candidate {
    pub id: u32,
    pub distance: f32,
}

impl Candidate {
    pub fn new(id: u32, distance: f32) -> Self {
        Self { id, distance }
    }
}
