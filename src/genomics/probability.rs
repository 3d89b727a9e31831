//! Precomputed log-probability tables of the Maq genotype model.
//!
//! The tables are built once per run and shared read-only (usually behind an
//! [`Arc`](std::sync::Arc)) by every window of the scan.

use statrs::distribution::{ContinuousCDF, Normal};
use statrs::function::gamma::ln_gamma;

use crate::config::{AmplificationConfig, MaqModelConfig};

/// Largest read count represented in the tables.
pub const MAX_COUNT: usize = 255;
/// Number of quality levels represented in the homozygous table.
pub const QUALITY_LEVELS: usize = 64;

const PHRED: f64 = 4.343;

/// Lookup tables for the Bayesian genotype model.
#[derive(Debug, Clone)]
pub struct ProbabilityTables {
    fks: Vec<f64>,
    cnks: Vec<f64>,
    het: Vec<f64>,
    prior_het_q: f64,
}

impl ProbabilityTables {
    /// Build all tables from the model parameters.
    pub fn build(maq: &MaqModelConfig, amplification: &AmplificationConfig) -> Self {
        let fks = rank_discounts(maq.theta, maq.eta);
        let cnks = homozygous_table(&fks);
        let (het, prior_het_q) = if amplification.corrected_het_table {
            corrected_het_table(maq, amplification)
        } else {
            combinatorial_het_table(maq)
        };
        Self {
            fks,
            cnks,
            het,
            prior_het_q,
        }
    }

    /// Discount applied to the observation of rank `rank` (0 = highest quality).
    pub fn fk(&self, rank: usize) -> f64 {
        self.fks[rank.min(MAX_COUNT)]
    }

    /// Phred-scaled cost of `k` minority reads among `n` at average quality `q`.
    ///
    /// Out of range arguments are clamped; non-finite entries read as zero.
    pub fn cnk(&self, q: usize, n: usize, k: usize) -> f64 {
        let q = q.min(QUALITY_LEVELS - 1);
        let n = n.min(MAX_COUNT);
        let k = k.min(n);
        finite_or_zero(self.cnks[q << 16 | n << 8 | k])
    }

    /// Log-probability of `n2` minor-allele reads against `n1` major-allele reads
    /// under the heterozygous model.
    pub fn het(&self, n1: usize, n2: usize) -> f64 {
        finite_or_zero(self.het[n1.min(MAX_COUNT) << 8 | n2.min(MAX_COUNT)])
    }

    /// Phred-scaled heterozygous prior.
    pub fn prior_het_q(&self) -> f64 {
        self.prior_het_q
    }
}

fn finite_or_zero(value: f64) -> f64 {
    if value.is_finite() {
        value
    } else {
        0.0
    }
}

fn rank_discounts(theta: f64, eta: f64) -> Vec<f64> {
    let mut fks = vec![1.0; MAX_COUNT + 1];
    for (n, fk) in fks.iter_mut().enumerate().skip(1) {
        *fk = theta.powi(n as i32) * (1.0 - eta) + eta;
    }
    fks
}

fn ln_binomial(n: usize, k: usize) -> f64 {
    ln_gamma((n + 1) as f64) - ln_gamma((k + 1) as f64) - ln_gamma((n - k + 1) as f64)
}

fn homozygous_table(fks: &[f64]) -> Vec<f64> {
    let size = MAX_COUNT + 1;
    let mut cnks = vec![0.0; size * size * QUALITY_LEVELS];

    let mut l_fks = vec![1.0; size];
    for n in 1..size {
        l_fks[n] = fks[n >> 1];
    }
    let mut l_c = vec![0.0; size * size];
    for n in 1..size {
        for k in 0..=n {
            l_c[n << 8 | k] = ln_binomial(n, k);
        }
    }

    let mut sum_a = vec![0.0f64; size + 1];
    let mut beta = vec![0.0f64; size];
    let mut q_c = vec![0.0f64; size];

    for q in 1..QUALITY_LEVELS {
        let e = 10f64.powf(-(q as f64) / 10.0);
        let le = e.ln();
        let le1 = (1.0 - e).ln();
        for n in 1..size {
            sum_a[n + 1] = 0.0;
            for k in (0..=n).rev() {
                sum_a[k] = sum_a[k + 1] + (l_c[n << 8 | k] + k as f64 * le + (n - k) as f64 * le1).exp();
                let ratio = sum_a[k + 1] / sum_a[k];
                // NaN from underflow is kept and later read back as zero
                beta[k] = if ratio > 0.99 { 0.99 } else { ratio };
            }
            for k in 0..n {
                q_c[k] = -PHRED * l_fks[k] * (beta[k] / e).ln();
            }
            for k in 1..n {
                q_c[k] += q_c[k - 1];
            }
            for k in 0..=n {
                let tail = -PHRED * (1.0 - (l_fks[k] * beta[k].ln()).exp()).ln();
                let mut value = if k > 0 { q_c[k - 1] } else { 0.0 };
                if !tail.is_nan() {
                    value += tail;
                }
                cnks[q << 16 | n << 8 | k] = value;
            }
        }
    }
    cnks
}

fn harmonic(ploidy: u32) -> f64 {
    (1..ploidy).map(|k| 1.0 / k as f64).sum()
}

fn het_prior(het_rate: f64, sum_harmo: f64) -> f64 {
    let poly_rate = het_rate * sum_harmo;
    -PHRED * (2.0 * poly_rate / (1.0 - poly_rate)).ln()
}

fn combinatorial_het_table(maq: &MaqModelConfig) -> (Vec<f64>, f64) {
    let size = MAX_COUNT + 1;
    let ploidy = maq.ploidy;
    let sum_harmo = harmonic(ploidy);
    let mut het = vec![0.0; size * size];
    for n1 in 0..size {
        for n2 in 0..size {
            let mut sum = 0.0f64;
            for k in 1..ploidy {
                let pk = 1.0 / k as f64 / sum_harmo;
                let log1 = (k as f64 / ploidy as f64).ln();
                let log2 = (1.0 - k as f64 / ploidy as f64).ln();
                sum += pk
                    * 0.5
                    * ((log1 * n2 as f64).exp() * (log2 * n1 as f64).exp()
                        + (log1 * n1 as f64).exp() * (log2 * n2 as f64).exp());
            }
            het[n1 << 8 | n2] = ln_binomial(n1 + n2, n1) + sum.ln();
        }
    }
    (het, het_prior(maq.het_rate, sum_harmo))
}

/// Normal approximation of the allele split with variance inflated by PCR
/// amplification noise. Diploid only.
fn corrected_het_table(maq: &MaqModelConfig, amp: &AmplificationConfig) -> (Vec<f64>, f64) {
    let size = MAX_COUNT + 1;
    let sum_harmo = harmonic(2);
    let maf = amp.mean_allele_frequency;
    let eff = 1.0 + amp.efficiency;
    let cycles = amp.cycles as f64;

    let distributions: Vec<Option<Normal>> = (0..2 * size)
        .map(|n| {
            if n == 0 {
                return None;
            }
            let n = n as f64;
            let mean = maf * n;
            let standard_dev = ((1.0 - maf) * mean).sqrt();
            let correction = (n * (2.0 / eff - 2.0 * eff.powf(-cycles - 1.0) + eff.powf(-cycles) - 1.0)
                / (8.0 * amp.initial_n as f64))
                .sqrt();
            let correction = if correction.is_finite() { correction } else { 0.0 };
            Normal::new(mean, standard_dev + correction).ok()
        })
        .collect();

    let mut het = vec![0.0; size * size];
    for n1 in 0..size {
        for n2 in 0..size {
            let corrected = match &distributions[n1 + n2] {
                Some(dist) => dist.cdf(n2 as f64 + 0.5) - dist.cdf(n2 as f64 - 0.5),
                None => 0.0,
            };
            het[n1 << 8 | n2] = corrected.ln();
        }
    }
    (het, het_prior(maq.het_rate, sum_harmo))
}
