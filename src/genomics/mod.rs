//! Windowed SNV and short-indel calling.
//!
//! Records flow from an [`AlignmentSource`] through the [`WindowedScanner`],
//! which clips, deduplicates and stores each reference window, calls
//! genotypes and indels, and hands rows to a [`VariantSink`].

mod align;
mod indel;
mod io;
mod output;
mod pileup;
mod probability;
mod realign;
mod scan;
mod source;
mod statistics;
mod store;
mod types;
mod variant_caller;

pub use align::{align, align_with, EditOp, EndGaps, IndelEvent, PairwiseAlignment, Scoring};
pub use indel::{
    direct_indels, homopolymer_run, realigned_indels, IndelCall, IndelColumn, IndelColumnKind, Zygosity,
};
pub use io::{load_positions, load_reference, read_positions, BamAlignmentSource};
pub use output::{
    position_header, render_indel, render_indels, render_position, render_positions, render_snv, render_snvs,
    snv_header, OutputError, RowLayout, TsvVariantWriter, VariantBuffer, VariantSink,
};
pub use pileup::{correct_pileup, PileupColumn, StrandCounts};
pub use probability::{ProbabilityTables, MAX_COUNT, QUALITY_LEVELS};
pub use realign::{AlignedRow, MultipleAlignment, RowCell};
pub use scan::{clip_record, effective_clip, prepare_score, ScanError, ScanSummary, WindowedScanner};
pub use source::{contig_index, AlignmentSource, Contig, PositionSet, SourceError, VecAlignmentSource};
pub use statistics::{genotype_model, BayesianCaller, GenotypeModel, SingleBaseVariant, ThresholdCaller};
pub use store::{
    Alignment, AlignmentQuality, AlignmentRecord, ContigWindow, Read, ReadClip, ReadId, StoreError, WindowStore,
};
pub use types::{
    base_index, complement, index_base, iupac, normalize_sequence, pack_genotype, reverse_complement, CigarOp,
    CigarOpKind, Strand, GAP,
};
pub use variant_caller::{calibrate_quality, PositionReport, RealignedCalls, SnvCall, SnvCaller};
