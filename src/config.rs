//! Run configuration for the calling engine.
//!
//! A [`CallerConfig`] is built once (usually from the command line), checked
//! with [`CallerConfig::validate`] and then shared immutably with every
//! component of the scan. Defaults match the long-standing snp_store defaults.

use thiserror::Error;

/// Errors raised when a configuration is internally inconsistent.
#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    /// A numeric option lies outside its admissible range.
    #[error("invalid value for {option}: {reason}")]
    OutOfRange {
        /// Name of the offending option.
        option: &'static str,
        /// Human readable description of the admissible range.
        reason: String,
    },
}

impl ConfigError {
    fn out_of_range(option: &'static str, reason: impl Into<String>) -> Self {
        ConfigError::OutOfRange {
            option,
            reason: reason.into(),
        }
    }
}

/// Genotype model used for SNV calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CallingMethod {
    /// Count/percentage/quality thresholds on the most frequent alleles.
    Threshold,
    /// Bayesian model introduced by Maq.
    #[default]
    Maq,
}

/// Thresholds of the count based model.
#[derive(Debug, Clone, PartialEq)]
pub struct ThresholdModelConfig {
    /// Minimum average quality of the mutant allele.
    pub avg_qual_t: f32,
    /// Minimum fraction of the column supporting the mutant allele.
    pub percentage_t: f32,
    /// Minimum number of reads supporting the mutant allele.
    pub min_mut_t: u32,
    /// Above this mutant fraction the genotype is called homozygous.
    pub snp_het_max: f32,
}

impl Default for ThresholdModelConfig {
    fn default() -> Self {
        Self {
            avg_qual_t: 10.0,
            percentage_t: 0.25,
            min_mut_t: 3,
            snp_het_max: 0.8,
        }
    }
}

/// Parameters of the Maq error and heterozygosity model.
#[derive(Debug, Clone, PartialEq)]
pub struct MaqModelConfig {
    /// Error dependency coefficient θ.
    pub theta: f64,
    /// Floor η of the rank discount.
    pub eta: f64,
    /// Prior heterozygosity rate.
    pub het_rate: f64,
    /// Number of haplotypes.
    pub ploidy: u32,
    /// Minimum fraction of the column explained by the two leading alleles.
    pub min_explained_column: f32,
}

impl Default for MaqModelConfig {
    fn default() -> Self {
        Self {
            theta: 0.85,
            eta: 0.03,
            het_rate: 0.001,
            ploidy: 2,
            min_explained_column: 0.8,
        }
    }
}

/// Amplification bias correction of the heterozygote table.
#[derive(Debug, Clone, PartialEq)]
pub struct AmplificationConfig {
    /// Replace the combinatorial het table by the corrected normal model.
    pub corrected_het_table: bool,
    /// Number of PCR cycles.
    pub cycles: u32,
    /// Per-cycle amplification efficiency.
    pub efficiency: f64,
    /// Initial number of template molecules.
    pub initial_n: u32,
    /// Expected allele frequency of a heterozygous site.
    pub mean_allele_frequency: f64,
}

impl Default for AmplificationConfig {
    fn default() -> Self {
        Self {
            corrected_het_table: false,
            cycles: 18,
            efficiency: 0.3,
            initial_n: 10,
            mean_allele_frequency: 0.51,
        }
    }
}

/// Indel calling thresholds.
#[derive(Debug, Clone, PartialEq)]
pub struct IndelConfig {
    /// Reject indels flanked by a homopolymer run longer than this.
    pub max_polymer_run: u32,
    /// Require support from both strands.
    pub both_strands: bool,
    /// Minimum average quality of deletion columns.
    pub quality_threshold: u32,
    /// Minimum overlap on each side for an alignment to count towards depth.
    pub depth_min_overlap: u32,
    /// Minimum supporting fraction.
    pub percentage_t: f32,
    /// Minimum supporting read count.
    pub count_threshold: u32,
    /// Merge same-length candidates within this distance.
    pub window: u32,
    /// Above this fraction the indel is called homozygous.
    pub het_max: f32,
}

impl Default for IndelConfig {
    fn default() -> Self {
        Self {
            max_polymer_run: 100,
            both_strands: false,
            quality_threshold: 1,
            depth_min_overlap: 0,
            percentage_t: 0.25,
            count_threshold: 3,
            window: 0,
            het_max: 0.70,
        }
    }
}

/// Genome scan windowing.
#[derive(Debug, Clone, PartialEq)]
pub struct WindowConfig {
    /// Bases per scan window.
    pub window_size: u32,
    /// Overlap buffer used when carrying alignments into the next window.
    pub window_buff: u32,
    /// Extra reference context materialised around the aligned span.
    pub realign_border: u32,
}

impl Default for WindowConfig {
    fn default() -> Self {
        Self {
            window_size: 1_000_000,
            window_buff: 70,
            realign_border: 0,
        }
    }
}

/// Output layout options.
#[derive(Debug, Clone, PartialEq)]
pub struct OutputConfig {
    /// Report uncalled candidate positions as well as calls.
    pub all_candidates: bool,
    /// Print per-base quality strings instead of counts.
    pub show_quality_strings: bool,
    /// Offset added to 0-based coordinates on output.
    pub position_offset: u32,
    /// ASCII offset used when rendering quality strings.
    pub ascii_qual_offset: u8,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            all_candidates: true,
            show_quality_strings: true,
            position_offset: 1,
            ascii_qual_offset: 33,
        }
    }
}

/// Complete configuration of a calling run.
#[derive(Debug, Clone, PartialEq)]
pub struct CallerConfig {
    /// Genotype model selector.
    pub method: CallingMethod,
    /// Minimum column coverage for a candidate.
    pub min_coverage: u32,
    /// Maximum alignments kept per identical start/end stack.
    pub max_pile: u32,
    /// Apply pileup correction per input lane rather than on the merged set.
    pub lane_specific_max_pile: bool,
    /// Distinguish strands in stacks and output columns.
    pub orientation_aware: bool,
    /// Run local realignment before calling.
    pub realign: bool,
    /// Minimum number of distinct read offsets supporting a variant.
    pub min_different_read_pos: u32,
    /// Read offsets this close to either read end are ignored for the above.
    pub exclude_border_pos: u32,
    /// Minimum read length left after clipping.
    pub min_clipped_length: u32,
    /// Ignore explicit clip annotations, keeping soft clips only.
    pub dont_clip: bool,
    /// Use per-base qualities rather than the alignment's average quality.
    pub use_base_quality: bool,
    /// Error rate dependent quality calibration factor.
    pub quality_calibration_factor: f32,
    /// Minimum mapping quality accepted from alignment sources.
    pub min_map_qual: u8,
    /// Keep reads with several best hits.
    pub keep_multi_reads: bool,
    /// Threshold model parameters.
    pub threshold: ThresholdModelConfig,
    /// Maq model parameters.
    pub maq: MaqModelConfig,
    /// Het table amplification correction.
    pub amplification: AmplificationConfig,
    /// Indel thresholds.
    pub indel: IndelConfig,
    /// Scan windowing.
    pub window: WindowConfig,
    /// Output layout.
    pub output: OutputConfig,
}

impl Default for CallerConfig {
    fn default() -> Self {
        Self {
            method: CallingMethod::Maq,
            min_coverage: 5,
            max_pile: 1,
            lane_specific_max_pile: true,
            orientation_aware: false,
            realign: false,
            min_different_read_pos: 0,
            exclude_border_pos: 0,
            min_clipped_length: 10,
            dont_clip: false,
            use_base_quality: true,
            quality_calibration_factor: 0.0,
            min_map_qual: 1,
            keep_multi_reads: false,
            threshold: ThresholdModelConfig::default(),
            maq: MaqModelConfig::default(),
            amplification: AmplificationConfig::default(),
            indel: IndelConfig::default(),
            window: WindowConfig::default(),
            output: OutputConfig::default(),
        }
    }
}

impl CallerConfig {
    /// Select the genotype model.
    pub fn with_method(mut self, method: CallingMethod) -> Self {
        self.method = method;
        self
    }

    /// Set the minimum coverage.
    pub fn with_min_coverage(mut self, min_coverage: u32) -> Self {
        self.min_coverage = min_coverage;
        self
    }

    /// Set the maximum pile depth per stack.
    pub fn with_max_pile(mut self, max_pile: u32) -> Self {
        self.max_pile = max_pile;
        self
    }

    /// Apply pileup correction per lane or on the merged alignment set.
    pub fn with_lane_specific_max_pile(mut self, enabled: bool) -> Self {
        self.lane_specific_max_pile = enabled;
        self
    }

    /// Toggle strand aware stacks and output.
    pub fn with_orientation_aware(mut self, enabled: bool) -> Self {
        self.orientation_aware = enabled;
        self
    }

    /// Toggle local realignment.
    pub fn with_realign(mut self, enabled: bool) -> Self {
        self.realign = enabled;
        self
    }

    /// Require support from distinct read offsets.
    pub fn with_min_different_read_pos(mut self, count: u32, exclude_border: u32) -> Self {
        self.min_different_read_pos = count;
        self.exclude_border_pos = exclude_border;
        self
    }

    /// Set the minimum clipped read length.
    pub fn with_min_clipped_length(mut self, len: u32) -> Self {
        self.min_clipped_length = len;
        self
    }

    /// Ignore explicit clip annotations.
    pub fn with_dont_clip(mut self, enabled: bool) -> Self {
        self.dont_clip = enabled;
        self
    }

    /// Use per-base qualities.
    pub fn with_use_base_quality(mut self, enabled: bool) -> Self {
        self.use_base_quality = enabled;
        self
    }

    /// Set the quality calibration factor.
    pub fn with_quality_calibration(mut self, factor: f32) -> Self {
        self.quality_calibration_factor = factor;
        self
    }

    /// Set the mapping quality floor applied by alignment sources.
    pub fn with_min_map_qual(mut self, min_map_qual: u8) -> Self {
        self.min_map_qual = min_map_qual;
        self
    }

    /// Keep multi-mapped reads.
    pub fn with_keep_multi_reads(mut self, enabled: bool) -> Self {
        self.keep_multi_reads = enabled;
        self
    }

    /// Replace the threshold model parameters.
    pub fn with_threshold_model(mut self, threshold: ThresholdModelConfig) -> Self {
        self.threshold = threshold;
        self
    }

    /// Replace the Maq model parameters.
    pub fn with_maq_model(mut self, maq: MaqModelConfig) -> Self {
        self.maq = maq;
        self
    }

    /// Replace the amplification correction parameters.
    pub fn with_amplification(mut self, amplification: AmplificationConfig) -> Self {
        self.amplification = amplification;
        self
    }

    /// Replace the indel thresholds.
    pub fn with_indel(mut self, indel: IndelConfig) -> Self {
        self.indel = indel;
        self
    }

    /// Set window size and overlap buffer.
    pub fn with_window(mut self, window_size: u32, window_buff: u32) -> Self {
        self.window.window_size = window_size;
        self.window.window_buff = window_buff;
        self
    }

    /// Set the extra reference border around each window's aligned span.
    pub fn with_realign_border(mut self, border: u32) -> Self {
        self.window.realign_border = border;
        self
    }

    /// Replace the output layout.
    pub fn with_output(mut self, output: OutputConfig) -> Self {
        self.output = output;
        self
    }

    /// Check the configuration for values the engine cannot work with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.window.window_size == 0 {
            return Err(ConfigError::out_of_range("window-size", "must be > 0"));
        }
        if self.max_pile == 0 {
            return Err(ConfigError::out_of_range("max-pile", "must be > 0"));
        }
        if !(self.maq.theta > 0.0 && self.maq.theta <= 1.0) {
            return Err(ConfigError::out_of_range("theta", "must lie in (0, 1]"));
        }
        if !(0.0..1.0).contains(&self.maq.eta) {
            return Err(ConfigError::out_of_range("eta", "must lie in [0, 1)"));
        }
        if !(self.maq.het_rate > 0.0 && self.maq.het_rate < 0.5) {
            return Err(ConfigError::out_of_range("het-rate", "must lie in (0, 0.5)"));
        }
        if self.maq.ploidy < 2 {
            return Err(ConfigError::out_of_range("ploidy", "must be >= 2"));
        }
        let amp = &self.amplification;
        if amp.corrected_het_table {
            if !(amp.mean_allele_frequency > 0.0 && amp.mean_allele_frequency < 1.0) {
                return Err(ConfigError::out_of_range(
                    "mean-allele-frequency",
                    "must lie in (0, 1)",
                ));
            }
            if amp.initial_n == 0 {
                return Err(ConfigError::out_of_range("initial-n", "must be > 0"));
            }
        }
        for (option, value) in [
            ("min-explained-column", self.maq.min_explained_column),
            ("percentage-t", self.threshold.percentage_t),
            ("snp-het-max", self.threshold.snp_het_max),
            ("indel-percentage-t", self.indel.percentage_t),
            ("indel-het-max", self.indel.het_max),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(ConfigError::out_of_range(option, "must lie in [0, 1]"));
            }
        }
        if self.quality_calibration_factor < 0.0 {
            return Err(ConfigError::out_of_range("quality-calibration", "must be >= 0"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = CallerConfig::default();
        assert_eq!(config.min_coverage, 5);
        assert_eq!(config.window.window_buff, 70);
        assert_eq!(config.method, CallingMethod::Maq);
        config.validate().expect("defaults validate");
    }

    #[test]
    fn builder_overrides_fields() {
        let config = CallerConfig::default()
            .with_method(CallingMethod::Threshold)
            .with_min_coverage(3)
            .with_window(500, 20)
            .with_realign(true);
        assert_eq!(config.method, CallingMethod::Threshold);
        assert_eq!(config.min_coverage, 3);
        assert_eq!(config.window.window_size, 500);
        assert_eq!(config.window.window_buff, 20);
        assert!(config.realign);
    }

    #[test]
    fn zero_window_is_rejected() {
        let err = CallerConfig::default().with_window(0, 10).validate().unwrap_err();
        assert!(matches!(err, ConfigError::OutOfRange { option: "window-size", .. }));
    }

    #[test]
    fn fraction_outside_unit_interval_is_rejected() {
        let mut config = CallerConfig::default();
        config.indel.percentage_t = 1.5;
        assert!(config.validate().is_err());
    }
}
