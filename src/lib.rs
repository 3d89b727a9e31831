//! # snpstore
//!
//! Windowed SNV and short-indel calling for reads aligned to a reference.
//!
//! ## Pipeline
//!
//! 1. **Windowing**: each contig is scanned in fixed windows; alignments
//!    reaching past a window boundary are carried into the next one.
//! 2. **Preparation**: clipping, pileup correction and an optional
//!    re-alignment of indel-bearing groups into a multiple alignment.
//! 3. **Calling**: per-column genotypes from either the threshold model or
//!    the Maq-style Bayesian model, plus indel candidates from CIGARs or
//!    gap columns.
//! 4. **Output**: tab-separated SNV, indel and per-position rows.
//!
//! ## Usage Example
//!
//! ```ignore
//! use snpstore::{CallerConfig, Contig, RowLayout, TsvVariantWriter, VecAlignmentSource, WindowedScanner};
//!
//! let config = CallerConfig::default().with_min_coverage(3);
//! let contigs = vec![Contig::new("chr1", reference)];
//! let scanner = WindowedScanner::new(&config, &contigs)?;
//! let mut writer = TsvVariantWriter::new(RowLayout::from_config(&config))
//!     .with_snv_stream(std::io::stdout())?;
//! let summary = scanner.run(&mut [VecAlignmentSource::new(records)], &mut writer)?;
//! ```

#![warn(missing_docs, missing_debug_implementations)]
#![allow(clippy::new_without_default)]

pub mod config; // Caller parameters and validation
pub mod genomics; // Windowed calling pipeline

pub use config::{
    AmplificationConfig, CallerConfig, CallingMethod, ConfigError, IndelConfig, MaqModelConfig, OutputConfig,
    ThresholdModelConfig, WindowConfig,
};
pub use genomics::{
    load_positions, load_reference, AlignmentRecord, AlignmentSource, BamAlignmentSource, Contig, IndelCall,
    PositionReport, PositionSet, Read, ReadClip, RowLayout, ScanError, ScanSummary, SnvCall, Strand,
    TsvVariantWriter, VariantBuffer, VariantSink, VecAlignmentSource, WindowedScanner,
};
