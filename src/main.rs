use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use snpstore::genomics::ProbabilityTables;
use snpstore::{
    load_positions, load_reference, AmplificationConfig, BamAlignmentSource, CallerConfig, CallingMethod,
    IndelConfig, MaqModelConfig, OutputConfig, RowLayout, ThresholdModelConfig, TsvVariantWriter,
    WindowedScanner,
};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "snpstore", about = "Windowed SNV and indel caller for aligned reads")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Call SNVs and indels from sorted BAM/SAM files.
    Call(CallArgs),
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum Method {
    /// Count, fraction and quality thresholds.
    Threshold,
    /// Maq Bayesian genotype model.
    Maq,
}

impl From<Method> for CallingMethod {
    fn from(method: Method) -> Self {
        match method {
            Method::Threshold => CallingMethod::Threshold,
            Method::Maq => CallingMethod::Maq,
        }
    }
}

#[derive(Args, Debug)]
struct CallArgs {
    /// Reference genome (multi-record FASTA).
    genome: PathBuf,
    /// Coordinate-sorted alignment files; each one is a separate lane.
    #[arg(required = true)]
    alignments: Vec<PathBuf>,
    /// SNV output file (stdout when no output is given at all).
    #[arg(short = 'o', long)]
    snp_output: Option<PathBuf>,
    /// Indel output file.
    #[arg(long)]
    indel_output: Option<PathBuf>,
    /// Positions to report base counts for (`<chrom>\t<pos>` per line).
    #[arg(long)]
    positions: Option<PathBuf>,
    /// Position report output file.
    #[arg(long, requires = "positions")]
    positions_output: Option<PathBuf>,
    /// Genotype model.
    #[arg(long, value_enum, default_value_t = Method::Maq)]
    method: Method,
    /// Only log warnings and errors.
    #[arg(short, long)]
    quiet: bool,
    #[command(flatten)]
    calling: CallingArgs,
    #[command(flatten)]
    models: ModelArgs,
    #[command(flatten)]
    indels: IndelArgs,
    #[command(flatten)]
    window: WindowArgs,
}

#[derive(Args, Debug)]
struct CallingArgs {
    /// Minimum column coverage.
    #[arg(long, default_value_t = 5)]
    min_coverage: u32,
    /// Maximum alignments kept per identical start position.
    #[arg(long, default_value_t = 1)]
    max_pile: u32,
    /// Apply pileup correction to the merged lanes instead of per lane.
    #[arg(long)]
    merged_max_pile: bool,
    /// Distinguish strands in pileup correction and output.
    #[arg(long)]
    orientation_aware: bool,
    /// Realign indel-bearing read groups before calling.
    #[arg(long)]
    realign: bool,
    /// Minimum number of distinct read positions supporting a variant.
    #[arg(long, default_value_t = 0)]
    min_different_read_pos: u32,
    /// Read positions this close to a read end are not counted.
    #[arg(long, default_value_t = 0)]
    exclude_border_pos: u32,
    /// Minimum read length after clipping.
    #[arg(long, default_value_t = 10)]
    min_clipped_length: u32,
    /// Ignore XC clip tags.
    #[arg(long)]
    dont_clip: bool,
    /// Cap base qualities at the read's average quality.
    #[arg(long)]
    no_base_quality: bool,
    /// Error-rate dependent quality calibration factor.
    #[arg(long, default_value_t = 0.0)]
    quality_calibration: f32,
    /// Minimum mapping quality.
    #[arg(long, default_value_t = 1)]
    min_map_qual: u8,
    /// Keep reads with several best hits.
    #[arg(long)]
    keep_multi_reads: bool,
    /// Only report called SNVs.
    #[arg(long)]
    only_calls: bool,
    /// Print base counts instead of quality strings.
    #[arg(long)]
    no_quality_strings: bool,
    /// Report 0-based positions.
    #[arg(long)]
    zero_based: bool,
    /// ASCII offset of rendered qualities.
    #[arg(long, default_value_t = 33)]
    ascii_qual_offset: u8,
}

#[derive(Args, Debug)]
struct ModelArgs {
    /// Threshold model: minimum average quality of the mutant allele.
    #[arg(long, default_value_t = 10.0)]
    avg_qual_t: f32,
    /// Threshold model: minimum mutant fraction.
    #[arg(long, default_value_t = 0.25)]
    percentage_t: f32,
    /// Threshold model: minimum mutant count.
    #[arg(long, default_value_t = 3)]
    min_mut_t: u32,
    /// Threshold model: homozygous above this fraction.
    #[arg(long, default_value_t = 0.8)]
    snp_het_max: f32,
    /// Maq model: error dependency coefficient.
    #[arg(long, default_value_t = 0.85)]
    theta: f64,
    /// Maq model: rank discount floor.
    #[arg(long, default_value_t = 0.03)]
    eta: f64,
    /// Maq model: prior heterozygosity rate.
    #[arg(long, default_value_t = 0.001)]
    het_rate: f64,
    /// Maq model: number of haplotypes.
    #[arg(long, default_value_t = 2)]
    ploidy: u32,
    /// Maq model: minimum column fraction explained by the two leading alleles.
    #[arg(long, default_value_t = 0.8)]
    min_explained_column: f32,
    /// Use the amplification corrected heterozygote table.
    #[arg(long)]
    corrected_het_table: bool,
    /// PCR cycles for the corrected heterozygote table.
    #[arg(long, default_value_t = 18)]
    amplification_cycles: u32,
    /// Per-cycle amplification efficiency.
    #[arg(long, default_value_t = 0.3)]
    amplification_efficiency: f64,
    /// Initial template molecules.
    #[arg(long, default_value_t = 10)]
    initial_n: u32,
    /// Expected allele frequency at heterozygous sites.
    #[arg(long, default_value_t = 0.51)]
    mean_allele_frequency: f64,
}

#[derive(Args, Debug)]
struct IndelArgs {
    /// Reject indels next to a longer homopolymer run.
    #[arg(long, default_value_t = 100)]
    max_polymer_run: u32,
    /// Require indel support on both strands.
    #[arg(long)]
    both_indel_strands: bool,
    /// Minimum average indel quality.
    #[arg(long, default_value_t = 1)]
    indel_quality_threshold: u32,
    /// Minimum flank overlap for depth counting.
    #[arg(long, default_value_t = 0)]
    indel_depth_min_overlap: u32,
    /// Minimum supporting fraction.
    #[arg(long, default_value_t = 0.25)]
    indel_percentage_t: f32,
    /// Minimum supporting reads.
    #[arg(long, default_value_t = 3)]
    indel_count_threshold: u32,
    /// Merge same-length indels within this distance.
    #[arg(long, default_value_t = 0)]
    indel_window: u32,
    /// Homozygous above this fraction.
    #[arg(long, default_value_t = 0.70)]
    indel_het_max: f32,
}

#[derive(Args, Debug)]
struct WindowArgs {
    /// Bases per scan window.
    #[arg(long, default_value_t = 1_000_000)]
    window_size: u32,
    /// Overlap used to carry alignments into the next window.
    #[arg(long, default_value_t = 70)]
    window_buff: u32,
    /// Extra reference context around realigned groups.
    #[arg(long, default_value_t = 0)]
    realign_border: u32,
}

impl CallArgs {
    fn config(&self) -> CallerConfig {
        let calling = &self.calling;
        let models = &self.models;
        let indels = &self.indels;
        CallerConfig::default()
            .with_method(self.method.into())
            .with_min_coverage(calling.min_coverage)
            .with_max_pile(calling.max_pile)
            .with_lane_specific_max_pile(!calling.merged_max_pile)
            .with_orientation_aware(calling.orientation_aware)
            .with_realign(calling.realign)
            .with_min_different_read_pos(calling.min_different_read_pos, calling.exclude_border_pos)
            .with_min_clipped_length(calling.min_clipped_length)
            .with_dont_clip(calling.dont_clip)
            .with_use_base_quality(!calling.no_base_quality)
            .with_quality_calibration(calling.quality_calibration)
            .with_min_map_qual(calling.min_map_qual)
            .with_keep_multi_reads(calling.keep_multi_reads)
            .with_threshold_model(ThresholdModelConfig {
                avg_qual_t: models.avg_qual_t,
                percentage_t: models.percentage_t,
                min_mut_t: models.min_mut_t,
                snp_het_max: models.snp_het_max,
            })
            .with_maq_model(MaqModelConfig {
                theta: models.theta,
                eta: models.eta,
                het_rate: models.het_rate,
                ploidy: models.ploidy,
                min_explained_column: models.min_explained_column,
            })
            .with_amplification(AmplificationConfig {
                corrected_het_table: models.corrected_het_table,
                cycles: models.amplification_cycles,
                efficiency: models.amplification_efficiency,
                initial_n: models.initial_n,
                mean_allele_frequency: models.mean_allele_frequency,
            })
            .with_indel(IndelConfig {
                max_polymer_run: indels.max_polymer_run,
                both_strands: indels.both_indel_strands,
                quality_threshold: indels.indel_quality_threshold,
                depth_min_overlap: indels.indel_depth_min_overlap,
                percentage_t: indels.indel_percentage_t,
                count_threshold: indels.indel_count_threshold,
                window: indels.indel_window,
                het_max: indels.indel_het_max,
            })
            .with_window(self.window.window_size, self.window.window_buff)
            .with_realign_border(self.window.realign_border)
            .with_output(OutputConfig {
                all_candidates: !calling.only_calls,
                show_quality_strings: !calling.no_quality_strings,
                position_offset: if calling.zero_based { 0 } else { 1 },
                ascii_qual_offset: calling.ascii_qual_offset,
            })
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Call(args) => {
            init_tracing(args.quiet);
            run_call(&args)?
        }
    }

    Ok(())
}

fn init_tracing(quiet: bool) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(if quiet { "warn" } else { "info" }));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .init();
}

fn create_output(path: &Path) -> Result<Box<dyn Write>> {
    let file =
        File::create(path).with_context(|| format!("failed to create output file {}", path.display()))?;
    Ok(Box::new(BufWriter::new(file)))
}

fn run_call(args: &CallArgs) -> Result<()> {
    let config = args.config();
    config.validate().context("invalid calling options")?;

    let contigs = load_reference(&args.genome)
        .with_context(|| format!("failed to load reference from {}", args.genome.display()))?;

    let positions = match &args.positions {
        Some(path) => Some(
            load_positions(path, &contigs)
                .with_context(|| format!("failed to load positions from {}", path.display()))?,
        ),
        None => None,
    };

    let mut writer = TsvVariantWriter::new(RowLayout::from_config(&config));
    let wants_stdout = args.snp_output.is_none() && args.indel_output.is_none() && args.positions_output.is_none();
    if let Some(path) = &args.snp_output {
        writer = writer.with_snv_stream(create_output(path)?)?;
    } else if wants_stdout {
        writer = writer.with_snv_stream(Box::new(BufWriter::new(io::stdout().lock())))?;
    }
    let emit_indels = args.indel_output.is_some();
    if let Some(path) = &args.indel_output {
        writer = writer.with_indel_stream(create_output(path)?);
    }
    if let Some(path) = &args.positions_output {
        writer = writer.with_position_stream(create_output(path)?)?;
    }

    let mut sources = args
        .alignments
        .iter()
        .enumerate()
        .map(|(lane, path)| {
            BamAlignmentSource::open(path, &contigs, &config, lane)
                .with_context(|| format!("failed to open alignments {}", path.display()))
        })
        .collect::<Result<Vec<_>>>()?;

    let tables = Arc::new(ProbabilityTables::build(&config.maq, &config.amplification));
    let mut scanner = WindowedScanner::new(&config, &contigs)?
        .with_tables(tables)
        .with_outputs(writer.has_snv_stream(), emit_indels);
    if let Some(positions) = positions {
        scanner = scanner.with_positions(positions);
    }

    let summary = scanner
        .run(&mut sources, &mut writer)
        .context("variant calling failed")?;
    info!(
        windows = summary.windows,
        skipped = summary.skipped_windows,
        snvs = summary.snvs,
        indels = summary.indels,
        positions = summary.positions,
        "calling complete"
    );
    Ok(())
}
