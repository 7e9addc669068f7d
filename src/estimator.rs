//! Query-time distance estimators
//!
//! Each query constructs one estimator and walks clusters through it:
//! `prepare(cluster)` binds the cluster and precomputes the lookup table or
//! bit-transposed query, `comp_fast_dist` screens whole 32-code blocks, and
//! `comp_accurate_dist` refines the survivors with the extended codes. The
//! two storage layouts get separate estimators: [`CluEstimator`] for
//! fast-scan blocks and [`SingleEstimator`] / [`CluSingleEstimator`] for
//! single-code storage.
//!
//! Estimators are single-threaded and never allocate after construction;
//! run disjoint queries on their own estimators to parallelize.

use crate::cluster::{ClusterData, ExFactor};
use crate::config::{QuantizerData, SearcherConfig};
use crate::lut::Lut;
use crate::memory::{self, AlignedVec};
use crate::{math, simd, DistType, SaqError, FAST_SCAN_SIZE};

/// Expected fraction of a residual's magnitude captured by its sign code.
pub(crate) const EST_ERROR: f32 = 0.8;
/// Bias-correction coefficient for the quantized-query inner product.
pub(crate) const CONST_BOUND: f32 = 0.58;

/// Bits used to quantize the query in the single-code path.
const QUERY_QUANT_BITS: usize = 8;

/// Work counters accumulated over one query's lifetime.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct QueryRuntimeMetrics {
    /// Code bits touched by fast screening.
    pub fast_bitsum: usize,
    /// Code bits touched by refinement.
    pub acc_bitsum: usize,
    /// Number of refinement evaluations.
    pub total_comp_cnt: usize,
}

/// Block-batched estimator over fast-scan cluster storage.
pub struct CluEstimator<'a> {
    num_dim_pad: usize,
    num_bits: u8,
    cfg: SearcherConfig,
    query: Vec<f32>,
    without_ip_prune_bound: f32,
    sq_delta: f64,
    ip_q_c: f32,
    q_l2sqr: f32,
    lut: Lut,
    cluster: Option<&'a ClusterData>,
    prepared_block: Option<usize>,
    metrics: QueryRuntimeMetrics,
}

impl<'a> CluEstimator<'a> {
    /// Build an estimator for one query. The query is rotated here if the
    /// collection carries a rotator.
    pub fn new(
        data: &QuantizerData,
        cfg: SearcherConfig,
        query: &[f32],
    ) -> Result<Self, SaqError> {
        data.cfg.validate()?;
        if !data.cfg.use_fastscan {
            return Err(SaqError::ConfigMismatch(
                "fast-scan layout required; use SingleEstimator for single-code storage",
            ));
        }
        assert_eq!(query.len(), data.cfg.num_dim_pad);

        let query = match &data.rotator {
            Some(rotator) => rotator.apply(query),
            None => query.to_vec(),
        };
        let lut = Lut::new(data.cfg.num_dim_pad, data.cfg.ex_bits())?;

        Ok(Self {
            num_dim_pad: data.cfg.num_dim_pad,
            num_bits: data.cfg.num_bits,
            cfg,
            query,
            without_ip_prune_bound: 0.0,
            sq_delta: 2.0 / f64::from(1u32 << data.cfg.num_bits),
            ip_q_c: 0.0,
            q_l2sqr: 0.0,
            lut,
            cluster: None,
            prepared_block: None,
            metrics: QueryRuntimeMetrics::default(),
        })
    }

    /// Store the variance-based pruning bound.
    pub fn set_prune_bound(&mut self, vars: f32) {
        self.without_ip_prune_bound = vars * self.cfg.searcher_vars_bound_m;
    }

    pub fn runtime_metrics(&self) -> QueryRuntimeMetrics {
        self.metrics
    }

    /// Bind a cluster and precompute the lookup table for it. Must run
    /// before any distance computation on that cluster.
    pub fn prepare(&mut self, cluster: &'a ClusterData) {
        assert_eq!(cluster.num_dim_pad(), self.num_dim_pad);
        self.cluster = Some(cluster);
        self.prepared_block = None;

        match self.cfg.dist_type {
            DistType::InnerProduct => {
                self.ip_q_c = math::dot(&self.query, cluster.centroid());
                self.lut.prepare(&self.query);
            }
            DistType::L2Sqr => {
                let residual = math::subtract(&self.query, cluster.centroid());
                self.lut.prepare(&residual);
            }
        }
        self.q_l2sqr = self.lut.q_l2sqr();
    }

    fn cluster(&self) -> &'a ClusterData {
        match self.cluster {
            Some(cluster) => cluster,
            None => panic!("prepare() must be called before distance computation"),
        }
    }

    /// Pessimistic per-block estimate from the variance bound alone; no
    /// code bits are touched.
    pub fn vars_est_dist(&self, block_idx: usize, out: &mut [f32; FAST_SCAN_SIZE]) {
        match self.cfg.dist_type {
            DistType::InnerProduct => {
                out.fill(self.ip_q_c - self.without_ip_prune_bound);
            }
            DistType::L2Sqr => {
                let factor = self.cluster().factor_o_l2norm(block_idx);
                let base = self.q_l2sqr - 2.0 * self.without_ip_prune_bound;
                for j in 0..FAST_SCAN_SIZE {
                    out[j] = (factor[j] * factor[j] + base).max(0.0);
                }
            }
        }
    }

    /// Fast screening distances for one block.
    ///
    /// Passing `out = None` refreshes the lookup-table state for later
    /// refinement without producing distances. With `num_bits == 0` this
    /// degrades to [`CluEstimator::vars_est_dist`].
    pub fn comp_fast_dist(&mut self, block_idx: usize, out: Option<&mut [f32; FAST_SCAN_SIZE]>) {
        if self.num_bits == 0 {
            if let Some(out) = out {
                self.vars_est_dist(block_idx, out);
            }
            return;
        }

        let cluster = self.cluster();
        let o_l2norm = cluster.factor_o_l2norm(block_idx);
        let short_code = cluster.short_code(block_idx);
        if block_idx + 1 < cluster.num_blocks() {
            memory::mem_prefetch_l1(
                cluster.short_code(block_idx + 1).as_ptr(),
                self.num_dim_pad / 16,
            );
        }

        match out {
            None => {
                self.lut.comp_fast_ip(o_l2norm, short_code, None);
                self.prepared_block = Some(block_idx);
            }
            Some(out) => {
                self.lut.comp_fast_ip(o_l2norm, short_code, Some(&mut *out));
                self.prepared_block = Some(block_idx);

                match self.cfg.dist_type {
                    DistType::InnerProduct => {
                        for v in out.iter_mut() {
                            *v = 0.5 * *v + self.ip_q_c;
                        }
                    }
                    DistType::L2Sqr => {
                        for (v, &o) in out.iter_mut().zip(o_l2norm.iter()) {
                            *v = (o * o + self.q_l2sqr - *v).max(0.0);
                        }
                    }
                }
                self.metrics.fast_bitsum += FAST_SCAN_SIZE * self.num_dim_pad;
            }
        }
    }

    /// Refined distance for one vector using its extended code.
    ///
    /// Requires a preceding [`CluEstimator::comp_fast_dist`] on the
    /// vector's block with no intervening `prepare` or fast evaluation of a
    /// different block, since the lookup-table accumulator from that call
    /// is consumed here.
    pub fn comp_accurate_dist(&mut self, vec_idx: usize) -> Result<f32, SaqError> {
        let cluster = self.cluster();
        let block_idx = vec_idx / FAST_SCAN_SIZE;
        let j = vec_idx % FAST_SCAN_SIZE;
        let o_l2norm = cluster.factor_o_l2norm(block_idx)[j];
        let o_l2sqr = o_l2norm * o_l2norm;

        if self.num_bits == 0 {
            return Ok(match self.cfg.dist_type {
                DistType::InnerProduct => self.ip_q_c,
                DistType::L2Sqr => o_l2sqr + self.q_l2sqr,
            });
        }

        if self.prepared_block != Some(block_idx) {
            return Err(SaqError::PreconditionViolated(
                "comp_fast_dist must run on the same block before comp_accurate_dist",
            ));
        }

        let long_code = cluster.long_code(vec_idx);
        let ex_fac = cluster.long_factor(vec_idx);
        let ip_o_q = ex_fac.rescale * self.lut.ext_ip(long_code, self.sq_delta, j);

        self.metrics.acc_bitsum += self.num_dim_pad * (self.num_bits as usize - 1);
        self.metrics.total_comp_cnt += 1;

        Ok(match self.cfg.dist_type {
            DistType::InnerProduct => ip_o_q + self.ip_q_c,
            DistType::L2Sqr => o_l2sqr + self.q_l2sqr - 2.0 * ip_o_q,
        })
    }
}

/// Shared state of the single-code estimation paths.
struct SingleCore {
    num_dim_pad: usize,
    num_bits: u8,
    one_over_sqrt_d: f32,
    ip_func: simd::ExtIpFn,
    cfg: SearcherConfig,
    caq_delta: f64,
    query: AlignedVec<f32>,
    query_sq: AlignedVec<u16>,
    query_bin: AlignedVec<u64>,
    delta: f32,
    q_vl: f32,
    ip_q_c: f32,
    sum_q: f32,
    q_l2sqr: f32,
    q_l2norm: f32,
    without_ip_prune_bound: f32,
    metrics: QueryRuntimeMetrics,
}

impl SingleCore {
    fn new(data: &QuantizerData, cfg: SearcherConfig) -> Result<Self, SaqError> {
        data.cfg.validate()?;
        if data.cfg.use_fastscan {
            return Err(SaqError::ConfigMismatch(
                "single-code layout required; use CluEstimator for fast-scan storage",
            ));
        }
        let num_dim_pad = data.cfg.num_dim_pad;
        let words = num_dim_pad / 64;

        Ok(Self {
            num_dim_pad,
            num_bits: data.cfg.num_bits,
            one_over_sqrt_d: 1.0 / (num_dim_pad as f32).sqrt(),
            ip_func: simd::ext_ip_func(data.cfg.ex_bits()),
            cfg,
            caq_delta: 2.0 / f64::from(1u32 << data.cfg.num_bits),
            query: AlignedVec::zeroed(num_dim_pad, 64)?,
            query_sq: AlignedVec::zeroed(num_dim_pad, 64)?,
            query_bin: AlignedVec::zeroed(words * QUERY_QUANT_BITS, 64)?,
            delta: 0.0,
            q_vl: 0.0,
            ip_q_c: 0.0,
            sum_q: 0.0,
            q_l2sqr: 0.0,
            q_l2norm: 0.0,
            without_ip_prune_bound: 0.0,
            metrics: QueryRuntimeMetrics::default(),
        })
    }

    /// Quantize and bit-transpose the (possibly centroid-shifted) query.
    fn prepare(&mut self, query: &[f32]) {
        assert_eq!(query.len(), self.num_dim_pad);
        self.query.copy_from_slice(query);
        self.q_l2sqr = math::l2_norm_sqr(query);
        self.q_l2norm = self.q_l2sqr.sqrt();
        self.sum_q = math::sum(query);

        let (q_vl, q_vr) = math::min_max(query);
        self.q_vl = q_vl;
        // The 0.01 keeps the largest quantized value below the code maximum.
        self.delta = (q_vr - q_vl) / ((1 << QUERY_QUANT_BITS) as f32 - 0.01);
        if self.delta > 0.0 {
            for (sq, &q) in self.query_sq.iter_mut().zip(query.iter()) {
                *sq = ((q - q_vl) / self.delta).floor() as u16;
            }
        } else {
            self.query_sq.fill(0);
        }

        simd::transpose_bin(
            &self.query_sq,
            &mut self.query_bin,
            self.num_dim_pad,
            QUERY_QUANT_BITS,
        );
    }

    fn set_prune_bound(&mut self, vars: f32) {
        self.without_ip_prune_bound = vars * self.cfg.searcher_vars_bound_m;
    }

    fn is_ip_dist(&self) -> bool {
        self.cfg.dist_type == DistType::InnerProduct
    }

    fn vars_est_dist(&self, o_l2norm: f32) -> f32 {
        if self.is_ip_dist() {
            return self.ip_q_c - self.without_ip_prune_bound;
        }
        (o_l2norm * o_l2norm + self.q_l2sqr - 2.0 * self.without_ip_prune_bound).max(0.0)
    }

    fn comp_fast_dist(&mut self, o_l2norm: f32, short_code: &[u64]) -> f32 {
        if self.num_bits == 0 {
            return self.vars_est_dist(o_l2norm);
        }

        let tmp = simd::bitplane_code_ip(
            short_code,
            &self.query_bin,
            self.delta,
            self.q_vl + 0.5 * self.delta,
            self.num_dim_pad,
            QUERY_QUANT_BITS,
        );
        let ip_oa1_qq = (tmp - (0.5 * self.sum_q - CONST_BOUND * self.q_l2norm))
            * (4.0 / EST_ERROR * self.one_over_sqrt_d)
            * o_l2norm;

        self.metrics.fast_bitsum += self.num_dim_pad;

        if !self.is_ip_dist() {
            (self.q_l2sqr + o_l2norm * o_l2norm - ip_oa1_qq).max(0.0)
        } else {
            ip_oa1_qq * 0.5
        }
    }

    fn comp_accurate_dist(
        &mut self,
        o_l2norm: f32,
        short_code: &[u64],
        long_code: &[u8],
        ex_fac: &ExFactor,
    ) -> f32 {
        let o_l2sqr = o_l2norm * o_l2norm;
        if self.num_bits == 0 {
            return if self.is_ip_dist() {
                self.ip_q_c
            } else {
                o_l2sqr + self.q_l2sqr
            };
        }

        let ip_oa1_q = simd::masked_float_ip(&self.query, short_code);
        let ex_ip = (self.ip_func)(&self.query, long_code, self.num_dim_pad);

        let o_vl = -1.0f64;
        let tmp = (f64::from(ip_oa1_q)
            + f64::from(ex_ip) * self.caq_delta
            + (o_vl + self.caq_delta * 0.5) * f64::from(self.sum_q)) as f32;
        let ip_o_q = ex_fac.rescale * tmp;

        self.metrics.acc_bitsum += self.num_dim_pad * (self.num_bits as usize - 1);
        self.metrics.total_comp_cnt += 1;

        if self.is_ip_dist() {
            ip_o_q + self.ip_q_c
        } else {
            o_l2sqr + self.q_l2sqr - 2.0 * ip_o_q
        }
    }
}

/// Scalar-per-code estimator over single-layout storage, with the query
/// bound at construction.
pub struct SingleEstimator {
    core: SingleCore,
}

impl SingleEstimator {
    pub fn new(
        data: &QuantizerData,
        cfg: SearcherConfig,
        query: &[f32],
    ) -> Result<Self, SaqError> {
        let mut core = SingleCore::new(data, cfg)?;
        match &data.rotator {
            Some(rotator) => core.prepare(&rotator.apply(query)),
            None => core.prepare(query),
        }
        Ok(Self { core })
    }

    pub fn set_prune_bound(&mut self, vars: f32) {
        self.core.set_prune_bound(vars);
    }

    pub fn runtime_metrics(&self) -> QueryRuntimeMetrics {
        self.core.metrics
    }

    pub fn vars_est_dist(&self, o_l2norm: f32) -> f32 {
        self.core.vars_est_dist(o_l2norm)
    }

    pub fn comp_fast_dist(&mut self, o_l2norm: f32, short_code: &[u64]) -> f32 {
        self.core.comp_fast_dist(o_l2norm, short_code)
    }

    pub fn comp_accurate_dist(
        &mut self,
        o_l2norm: f32,
        short_code: &[u64],
        long_code: &[u8],
        ex_fac: &ExFactor,
    ) -> f32 {
        self.core
            .comp_accurate_dist(o_l2norm, short_code, long_code, ex_fac)
    }
}

/// Cluster-scoped wrapper over the single-code path; shifts the query by
/// each cluster's centroid on `prepare`.
pub struct CluSingleEstimator<'a> {
    core: SingleCore,
    query_data: Vec<f32>,
    cluster: Option<&'a ClusterData>,
}

impl<'a> CluSingleEstimator<'a> {
    pub fn new(
        data: &QuantizerData,
        cfg: SearcherConfig,
        query: &[f32],
    ) -> Result<Self, SaqError> {
        let core = SingleCore::new(data, cfg)?;
        assert_eq!(query.len(), data.cfg.num_dim_pad);
        let query_data = match &data.rotator {
            Some(rotator) => rotator.apply(query),
            None => query.to_vec(),
        };
        Ok(Self {
            core,
            query_data,
            cluster: None,
        })
    }

    pub fn set_prune_bound(&mut self, vars: f32) {
        self.core.set_prune_bound(vars);
    }

    pub fn runtime_metrics(&self) -> QueryRuntimeMetrics {
        self.core.metrics
    }

    /// Bind a cluster; the inner-product variant of this path is not
    /// supported yet.
    pub fn prepare(&mut self, cluster: &'a ClusterData) -> Result<(), SaqError> {
        assert_eq!(cluster.num_dim_pad(), self.core.num_dim_pad);
        if self.core.is_ip_dist() {
            return Err(SaqError::NotImplemented(
                "inner-product cluster mode for the single-code estimator",
            ));
        }
        self.cluster = Some(cluster);
        let residual = math::subtract(&self.query_data, cluster.centroid());
        self.core.prepare(&residual);
        Ok(())
    }

    fn cluster(&self) -> &'a ClusterData {
        match self.cluster {
            Some(cluster) => cluster,
            None => panic!("prepare() must be called before distance computation"),
        }
    }

    fn o_l2norm(&self, vec_idx: usize) -> f32 {
        let block_idx = vec_idx / FAST_SCAN_SIZE;
        let j = vec_idx % FAST_SCAN_SIZE;
        self.cluster().factor_o_l2norm(block_idx)[j]
    }

    pub fn vars_est_dist(&self, vec_idx: usize) -> f32 {
        self.core.vars_est_dist(self.o_l2norm(vec_idx))
    }

    pub fn comp_fast_dist(&mut self, vec_idx: usize) -> f32 {
        let o_l2norm = self.o_l2norm(vec_idx);
        let cluster = self.cluster();
        self.core
            .comp_fast_dist(o_l2norm, cluster.short_code_single(vec_idx))
    }

    pub fn comp_accurate_dist(&mut self, vec_idx: usize) -> f32 {
        let o_l2norm = self.o_l2norm(vec_idx);
        let cluster = self.cluster();
        self.core.comp_accurate_dist(
            o_l2norm,
            cluster.short_code_single(vec_idx),
            cluster.long_code(vec_idx),
            cluster.long_factor(vec_idx),
        )
    }
}
