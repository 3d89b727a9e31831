//! Genotype models applied to a single pileup column.
//!
//! Two interchangeable models sit behind [`GenotypeModel`]: a count based
//! [`ThresholdCaller`] and the Maq style [`BayesianCaller`]. The model is picked
//! once per run with [`genotype_model`].

use std::fmt;
use std::sync::Arc;

use crate::config::{CallerConfig, CallingMethod, MaqModelConfig, ThresholdModelConfig};
use crate::genomics::pileup::PileupColumn;
use crate::genomics::probability::{ProbabilityTables, MAX_COUNT};
use crate::genomics::types::{base_index, iupac, pack_genotype};

const PHRED: f64 = 4.343;
const MAQ_QUALITY_CAP: f64 = 30.0;

/// Outcome of genotyping one candidate column.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct SingleBaseVariant {
    /// Whether the column passed the calling criteria.
    pub called: bool,
    /// Packed genotype `allele1 << 2 | allele2`.
    pub genotype: u8,
    /// Observations of the leading non-reference (or best) allele.
    pub count: u32,
    /// Genotype quality.
    pub quality: i32,
    /// Variant quality, reported by the Bayesian model only.
    pub snp_quality: Option<i32>,
    /// Column coverage over A, C, G and T.
    pub coverage: u32,
}

impl SingleBaseVariant {
    /// IUPAC character of the called genotype.
    pub fn iupac(&self) -> char {
        iupac(self.genotype)
    }
}

/// Genotype model evaluated on a candidate column.
pub trait GenotypeModel: fmt::Debug + Send + Sync {
    /// Genotype the column against `reference`.
    ///
    /// Returns `None` when the column carries no usable evidence, otherwise a
    /// variant that may or may not be `called`.
    fn call(&self, column: &PileupColumn, reference: u8) -> Option<SingleBaseVariant>;

    /// Which method this model implements.
    fn method(&self) -> CallingMethod;
}

/// Build the configured genotype model.
///
/// The Bayesian model shares `tables` when given and builds them otherwise.
pub fn genotype_model(
    config: &CallerConfig,
    tables: Option<Arc<ProbabilityTables>>,
) -> Box<dyn GenotypeModel> {
    match config.method {
        CallingMethod::Threshold => Box::new(ThresholdCaller::new(config.threshold.clone())),
        CallingMethod::Maq => {
            let tables = tables
                .unwrap_or_else(|| Arc::new(ProbabilityTables::build(&config.maq, &config.amplification)));
            Box::new(BayesianCaller::new(tables, &config.maq))
        }
    }
}

/// Count, fraction and average quality thresholds on the leading mutant allele.
#[derive(Debug, Clone)]
pub struct ThresholdCaller {
    config: ThresholdModelConfig,
}

impl ThresholdCaller {
    /// Create a caller with the given thresholds.
    pub fn new(config: ThresholdModelConfig) -> Self {
        Self { config }
    }
}

impl GenotypeModel for ThresholdCaller {
    fn call(&self, column: &PileupColumn, reference: u8) -> Option<SingleBaseVariant> {
        let ref_allele = base_index(reference);
        let mut allele1 = None;
        let mut max_count = 0;
        for k in 0..4 {
            if column.count(k) > max_count {
                max_count = column.count(k);
                allele1 = Some(k);
            }
        }
        let allele1 = allele1?;
        let mut allele2 = allele1;
        let mut max_count = 0;
        for k in (0..4).filter(|&k| k != allele1) {
            if column.count(k) >= max_count {
                max_count = column.count(k);
                allele2 = k;
            }
        }

        let mut_allele = if allele1 == ref_allele { allele2 } else { allele1 };
        let mut_coverage = column.count(mut_allele);
        let total = column.coverage();
        let quality_sum = column.quality_sum(mut_allele);
        let avg_quality = if mut_coverage > 0 {
            quality_sum as f32 / mut_coverage as f32
        } else {
            0.0
        };
        let fraction = if total > 0 {
            mut_coverage as f32 / total as f32
        } else {
            0.0
        };

        let genotype_ref = pack_genotype(ref_allele, ref_allele);
        let mut genotype = genotype_ref;
        if mut_coverage >= self.config.min_mut_t
            && fraction >= self.config.percentage_t
            && avg_quality >= self.config.avg_qual_t
        {
            genotype = if fraction <= self.config.snp_het_max {
                pack_genotype(mut_allele, ref_allele)
            } else {
                pack_genotype(mut_allele, mut_allele)
            };
        }

        Some(SingleBaseVariant {
            called: genotype != genotype_ref,
            genotype,
            count: mut_coverage,
            quality: if mut_coverage > 0 {
                (quality_sum / mut_coverage) as i32
            } else {
                0
            },
            snp_quality: None,
            coverage: total,
        })
    }

    fn method(&self) -> CallingMethod {
        CallingMethod::Threshold
    }
}

/// Maq genotype model backed by precomputed tables.
#[derive(Debug, Clone)]
pub struct BayesianCaller {
    tables: Arc<ProbabilityTables>,
    min_explained_column: f32,
}

/// Rank-discounted quality evidence of one allele.
#[derive(Debug, Clone, Copy, Default)]
struct AlleleEvidence {
    weighted: f64,
    weights: f64,
    count: usize,
}

impl BayesianCaller {
    /// Create a caller over shared tables.
    pub fn new(tables: Arc<ProbabilityTables>, maq: &MaqModelConfig) -> Self {
        Self {
            tables,
            min_explained_column: maq.min_explained_column,
        }
    }

    fn evidence(&self, column: &PileupColumn) -> [AlleleEvidence; 4] {
        let mut evidence = [AlleleEvidence::default(); 4];
        for (base, slot) in evidence.iter_mut().enumerate() {
            for strand in [&column.forward, &column.reverse] {
                let mut runs = strand.qualities[base].clone();
                runs.sort_unstable_by(|a, b| b.0.cmp(&a.0));
                let mut rank = 0;
                for &(q, n) in &runs {
                    let q = (q as f64).min(MAQ_QUALITY_CAP);
                    let n = n as usize;
                    // Ranks past MAX_COUNT share the last discount.
                    let ranked = n.min(MAX_COUNT.saturating_sub(rank));
                    for r in rank..rank + ranked {
                        let fk = self.tables.fk(r);
                        slot.weighted += fk * q;
                        slot.weights += fk;
                    }
                    let tail = (n - ranked) as f64;
                    if tail > 0.0 {
                        let fk = self.tables.fk(MAX_COUNT);
                        slot.weighted += fk * q * tail;
                        slot.weights += fk * tail;
                    }
                    rank += n;
                }
                slot.count += rank;
            }
        }
        evidence
    }

    /// Phred costs of the homozygous genotypes of the best and second best allele.
    fn homozygous_costs(&self, evidence: &[AlleleEvidence; 4]) -> (Option<usize>, Option<usize>, f64, f64) {
        let mut best = None;
        let mut second = None;
        let mut best_sum = 0.0;
        let mut second_sum = 0.0;
        for (j, allele) in evidence.iter().enumerate() {
            if allele.weighted > best_sum {
                second_sum = best_sum;
                second = best;
                best_sum = allele.weighted;
                best = Some(j);
            } else if allele.weighted > second_sum {
                second_sum = allele.weighted;
                second = Some(j);
            }
        }

        let average = |idx: Option<usize>| match idx {
            Some(i) => ((evidence[i].weighted / evidence[i].weights + 0.5) as usize, evidence[i].count),
            None => (0, 0),
        };
        let (q_best, mut count_best) = average(best);
        let (q_second, mut count_second) = average(second);
        let mut total = count_best + count_second;
        if total > MAX_COUNT {
            count_best = (MAX_COUNT as f64 * count_best as f64 / total as f64 + 0.5) as usize;
            count_second = (MAX_COUNT as f64 * count_second as f64 / total as f64 + 0.5) as usize;
            total = MAX_COUNT;
        }

        let mut homo_best = self.tables.cnk(q_second, total, count_second);
        if count_second > 0 {
            homo_best += second.map_or(0.0, |i| evidence[i].weighted);
        }
        let mut homo_second = self.tables.cnk(q_best, total, count_best);
        if count_best > 0 {
            homo_second += best.map_or(0.0, |i| evidence[i].weighted);
        }
        (best, second, homo_best, homo_second)
    }
}

impl GenotypeModel for BayesianCaller {
    fn call(&self, column: &PileupColumn, reference: u8) -> Option<SingleBaseVariant> {
        let ref_allele = base_index(reference);
        let evidence = self.evidence(column);
        let (best, second, p_homo1, p_homo2) = self.homozygous_costs(&evidence);
        let best = best?;
        let second = match second {
            Some(second) => second,
            None if best == ref_allele => return None,
            None => ref_allele,
        };

        let count_best = column.count(best) as usize;
        let count_second = column.count(second) as usize;
        let n = count_best + count_second;
        let het = if n > MAX_COUNT {
            let scaled_second = (count_second as f64 * MAX_COUNT as f64 / n as f64 + 0.5) as usize;
            let scaled_best = (count_best as f64 * MAX_COUNT as f64 / n as f64 + 0.5) as usize;
            self.tables.het(scaled_second, scaled_best)
        } else {
            self.tables.het(count_second, count_best)
        };

        let p_het = (self.tables.prior_het_q() - PHRED * het).max(0.0);
        let p_homo1 = p_homo1.max(0.0);
        let p_homo2 = p_homo2.max(0.0);
        let p_ref = if best == ref_allele { p_homo1 } else { p_homo2 };
        let round = |x: f64| (x + 0.5) as i32;

        let genotype_ref = pack_genotype(ref_allele, ref_allele);
        let het_genotype = if best == ref_allele {
            pack_genotype(best, second)
        } else {
            pack_genotype(second, best)
        };

        // (genotype, genotype quality, variant quality, trusted)
        let (mut genotype, mut quality, snp_quality, trusted) = if p_het < p_homo1 {
            if p_het < p_homo2 {
                let runner_up = p_homo1.min(p_homo2);
                (het_genotype, round(runner_up - p_het), round(p_ref - p_het), true)
            } else {
                (pack_genotype(second, second), round(p_het - p_homo2), round(p_ref - p_homo2), false)
            }
        } else if p_homo2 < p_homo1 {
            (pack_genotype(second, second), round(p_homo1 - p_homo2), round(p_ref - p_homo2), false)
        } else if p_het < p_homo2 {
            (pack_genotype(best, best), round(p_het - p_homo1), round(p_ref - p_homo1), true)
        } else {
            (pack_genotype(best, best), round(p_homo2 - p_homo1), round(p_ref - p_homo1), true)
        };

        // the second best allele winning as a homozygote is not trusted
        if !trusted {
            genotype = genotype_ref;
            quality = 0;
        }
        let snp_quality = if best != ref_allele && second != ref_allele {
            255
        } else {
            snp_quality
        };

        let coverage = column.coverage();
        let explained = if coverage > 0 {
            n as f64 / coverage as f64
        } else {
            0.0
        };
        Some(SingleBaseVariant {
            called: genotype != genotype_ref && explained >= self.min_explained_column as f64,
            genotype,
            count: count_best as u32,
            quality,
            snp_quality: Some(snp_quality),
            coverage,
        })
    }

    fn method(&self) -> CallingMethod {
        CallingMethod::Maq
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::genomics::types::Strand;

    fn column(observations: &[(u8, u32, u8)]) -> PileupColumn {
        let mut column = PileupColumn::new();
        for (i, &(base, count, quality)) in observations.iter().enumerate() {
            let strand = if i % 2 == 0 { Strand::Forward } else { Strand::Reverse };
            for _ in 0..count {
                column.observe(base, quality, strand, 1);
            }
        }
        column
    }

    fn bayesian() -> Box<dyn GenotypeModel> {
        genotype_model(&CallerConfig::default(), None)
    }

    fn threshold() -> Box<dyn GenotypeModel> {
        genotype_model(&CallerConfig::default().with_method(CallingMethod::Threshold), None)
    }

    #[test]
    fn threshold_calls_balanced_het() {
        let call = threshold()
            .call(&column(&[(b'A', 15, 30), (b'G', 15, 30)]), b'A')
            .expect("evidence");
        assert!(call.called);
        assert_eq!(call.iupac(), 'R');
        assert_eq!(call.count, 15);
        assert_eq!(call.quality, 30);
        assert_eq!(call.coverage, 30);
    }

    #[test]
    fn threshold_calls_homozygous_above_het_max() {
        let call = threshold()
            .call(&column(&[(b'A', 1, 30), (b'G', 9, 30)]), b'A')
            .expect("evidence");
        assert!(call.called);
        assert_eq!(call.iupac(), 'G');
    }

    #[test]
    fn threshold_rejects_low_quality_mutant() {
        let call = threshold()
            .call(&column(&[(b'A', 10, 30), (b'G', 5, 5)]), b'A')
            .expect("evidence");
        assert!(!call.called);
    }

    #[test]
    fn bayesian_calls_balanced_het() {
        let call = bayesian()
            .call(&column(&[(b'A', 15, 30), (b'G', 15, 30)]), b'A')
            .expect("evidence");
        assert!(call.called);
        assert_eq!(call.iupac(), 'R');
        assert!(call.quality > 0);
        assert!(call.snp_quality.unwrap_or(0) > 0);
    }

    #[test]
    fn bayesian_calls_homozygous_alt() {
        let call = bayesian()
            .call(&column(&[(b'T', 6, 30)]), b'A')
            .expect("evidence");
        assert!(call.called);
        assert_eq!(call.iupac(), 'T');
    }

    #[test]
    fn pure_reference_column_is_not_called() {
        let col = column(&[(b'C', 20, 30)]);
        assert!(bayesian().call(&col, b'C').is_none());
        let call = threshold().call(&col, b'C').expect("evidence");
        assert!(!call.called);
    }

    #[test]
    fn unexplained_column_is_not_called() {
        let call = bayesian()
            .call(&column(&[(b'A', 5, 30), (b'G', 5, 30), (b'C', 5, 30), (b'T', 5, 30)]), b'A')
            .expect("evidence");
        assert!(!call.called);
    }
}
