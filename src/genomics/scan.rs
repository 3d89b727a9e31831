//! Windowed genome scan.
//!
//! [`WindowedScanner`] walks every contig in fixed-size windows. For each
//! window it pulls the newly started records from every
//! [`AlignmentSource`], adds the records carried over from the previous
//! window, applies pileup correction and read clipping, materialises the
//! reference slice the records actually span and hands the resulting
//! [`WindowStore`] to the SNV and indel callers. Records reaching past the
//! window end (padded by the overlap buffer) are copied into the next window.

use std::ops::Range;
use std::sync::Arc;

use thiserror::Error;
use tracing::{debug, info, trace};

use crate::config::{CallerConfig, ConfigError};
use crate::genomics::align::{align, EndGaps, PairwiseAlignment, Scoring};
use crate::genomics::indel::{direct_indels, realigned_indels};
use crate::genomics::output::{OutputError, VariantSink};
use crate::genomics::pileup::correct_pileup;
use crate::genomics::probability::ProbabilityTables;
use crate::genomics::realign::MultipleAlignment;
use crate::genomics::source::{AlignmentSource, Contig, PositionSet, SourceError};
use crate::genomics::statistics::{genotype_model, GenotypeModel};
use crate::genomics::store::{AlignmentRecord, ContigWindow, Read, ReadClip, StoreError, WindowStore};
use crate::genomics::types::{has_indel, span_len, trim_read_back, trim_read_front};
use crate::genomics::variant_caller::{PositionReport, SnvCaller};

/// Errors that abort a scan.
#[derive(Debug, Error)]
pub enum ScanError {
    /// The configuration was rejected.
    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),
    /// An alignment source failed or produced unsorted records.
    #[error("alignment source failed: {0}")]
    Source(#[from] SourceError),
    /// A window could not be assembled.
    #[error("window assembly failed: {0}")]
    Store(#[from] StoreError),
    /// Records could not be written.
    #[error("output failed: {0}")]
    Output(#[from] OutputError),
}

/// Counters gathered over a scan.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ScanSummary {
    /// Windows handed to the callers.
    pub windows: usize,
    /// Windows skipped in position-only mode.
    pub skipped_windows: usize,
    /// Records received from the sources.
    pub records: usize,
    /// Records dropped by pileup correction.
    pub pileup_discarded: usize,
    /// Records dropped while clipping.
    pub clip_discarded: usize,
    /// SNV rows written.
    pub snvs: usize,
    /// Indel calls written.
    pub indels: usize,
    /// Position rows written.
    pub positions: usize,
}

/// Replace the alignment score by the read's average base quality when the
/// score is unset or exceeds that average.
pub fn prepare_score(record: &mut AlignmentRecord) {
    let average = record.read.average_quality();
    if record.quality.score == 0 || average < record.quality.score {
        record.quality.score = average;
    }
}

/// Clip applied to a record: the larger of the explicit and soft clip on each
/// side, explicit clips being ignored under `dont_clip`.
pub fn effective_clip(record: &AlignmentRecord, config: &CallerConfig) -> ReadClip {
    let explicit = if config.dont_clip {
        ReadClip::default()
    } else {
        record.clip
    };
    explicit.max(record.soft_clip)
}

/// Apply the effective clip to `record`, with `reference` the whole contig.
///
/// Returns `None` when the clip consumes the read or leaves fewer than
/// `min_clipped_length` bases. The edit distance and score are recomputed
/// for the remaining bases.
pub fn clip_record(mut record: AlignmentRecord, reference: &[u8], config: &CallerConfig) -> Option<AlignmentRecord> {
    let clip = effective_clip(&record, config);
    if clip.is_empty() {
        return Some(record);
    }
    let len = record.read.len();
    let (left, right) = (clip.left as usize, clip.right as usize);
    if left + right >= len || record.end as usize > reference.len() {
        debug!(id = record.id, left, right, len, "clip overruns read, discarded");
        return None;
    }
    if len - left - right < config.min_clipped_length as usize {
        debug!(id = record.id, remaining = len - left - right, "read too short after clipping, discarded");
        return None;
    }

    let read = Read::new(
        &record.read.sequence[left..len - right],
        &record.read.qualities[left..len - right],
    );
    let errors = if !record.cigar.is_empty() {
        let mut cigar = std::mem::take(&mut record.cigar);
        record.begin += trim_read_front(&mut cigar, clip.left);
        trim_read_back(&mut cigar, clip.right);
        record.end = record.begin + span_len(&cigar);
        record.quality.has_indel = has_indel(&cigar);
        record.cigar = cigar;
        PairwiseAlignment::from_cigar(&record.cigar, record.begin as usize).edit_distance(&read.sequence, reference)
    } else if record.quality.has_indel {
        let target = &reference[record.begin as usize..record.end as usize];
        let gapped = align(&read.sequence, target, Scoring::INDEL_DISCOVERY, EndGaps::FreeTarget, None);
        let errors = gapped.edit_distance(&read.sequence, target);
        record.end = record.begin + gapped.target_end as u32;
        record.begin += gapped.target_begin as u32;
        record.quality.has_indel = !gapped.indels().is_empty();
        errors
    } else {
        record.begin += clip.left;
        record.end -= clip.right;
        let target = &reference[record.begin as usize..record.end as usize];
        read.sequence
            .iter()
            .zip(target)
            .filter(|(a, b)| a != b || **a == b'N')
            .count() as u32
    };

    record.read = read;
    record.quality.errors = errors;
    record.quality.score = record.read.average_quality();
    record.clip = ReadClip::default();
    record.soft_clip = ReadClip::default();
    Some(record)
}

/// Drives pileup correction, realignment and calling window by window.
#[derive(Debug)]
pub struct WindowedScanner<'a> {
    config: &'a CallerConfig,
    contigs: &'a [Contig],
    model: Box<dyn GenotypeModel>,
    positions: PositionSet,
    emit_snvs: bool,
    emit_indels: bool,
}

impl<'a> WindowedScanner<'a> {
    /// Scanner over `contigs`, emitting SNVs and indels.
    pub fn new(config: &'a CallerConfig, contigs: &'a [Contig]) -> Result<Self, ScanError> {
        config.validate()?;
        Ok(Self {
            config,
            contigs,
            model: genotype_model(config, None),
            positions: PositionSet::new(contigs.len()),
            emit_snvs: true,
            emit_indels: true,
        })
    }

    /// Reuse prebuilt probability tables for the Bayesian model.
    pub fn with_tables(mut self, tables: Arc<ProbabilityTables>) -> Self {
        self.model = genotype_model(self.config, Some(tables));
        self
    }

    /// Report base counts at these positions.
    pub fn with_positions(mut self, positions: PositionSet) -> Self {
        self.positions = positions;
        self
    }

    /// Choose which call kinds are produced.
    pub fn with_outputs(mut self, snvs: bool, indels: bool) -> Self {
        self.emit_snvs = snvs;
        self.emit_indels = indels;
        self
    }

    /// Only position reports are wanted, so windows without a requested
    /// position can be skipped.
    fn position_only(&self) -> bool {
        !self.emit_snvs && !self.emit_indels && !self.positions.is_empty()
    }

    /// Scan every contig, feeding calls into `sink`.
    pub fn run<S: AlignmentSource>(
        &self,
        sources: &mut [S],
        sink: &mut dyn VariantSink,
    ) -> Result<ScanSummary, ScanError> {
        let mut summary = ScanSummary::default();
        for contig in 0..self.contigs.len() {
            self.scan_contig(contig, sources, sink, &mut summary)?;
        }
        sink.finish()?;
        info!(
            windows = summary.windows,
            records = summary.records,
            snvs = summary.snvs,
            indels = summary.indels,
            "scan finished"
        );
        Ok(summary)
    }

    fn scan_contig<S: AlignmentSource>(
        &self,
        contig_id: usize,
        sources: &mut [S],
        sink: &mut dyn VariantSink,
        summary: &mut ScanSummary,
    ) -> Result<(), ScanError> {
        let contig = &self.contigs[contig_id];
        let requested = self.positions.contig(contig_id);
        if self.position_only() && requested.is_empty() {
            return Ok(());
        }
        let len = contig.len() as u32;
        let window_size = self.config.window.window_size;
        let buffer = self.config.window.window_buff;
        let border = self.config.window.realign_border;
        let mut next_requested = 0;
        let mut carry: Vec<AlignmentRecord> = Vec::new();
        let mut window_begin = 0u32;

        info!(contig = %contig.name, len, "scanning contig");
        while window_begin < len {
            let window_end = window_begin.saturating_add(window_size).min(len);

            let wanted = requested
                .get(next_requested)
                .map_or(false, |&p| p >= window_begin && p < window_end);
            if self.position_only() && !wanted {
                for source in sources.iter_mut() {
                    source.next_window(contig_id, window_begin, window_end)?;
                }
                carry.clear();
                summary.skipped_windows += 1;
                window_begin = window_end;
                continue;
            }

            let mut records = std::mem::take(&mut carry);
            for source in sources.iter_mut() {
                let mut batch = source.next_window(contig_id, window_begin, window_end)?;
                summary.records += batch.len();
                batch.iter_mut().for_each(prepare_score);
                if self.config.lane_specific_max_pile {
                    summary.pileup_discarded +=
                        correct_pileup(&mut batch, self.config.max_pile, self.config.orientation_aware);
                }
                records.extend(batch);
            }
            if !self.config.lane_specific_max_pile {
                summary.pileup_discarded +=
                    correct_pileup(&mut records, self.config.max_pile, self.config.orientation_aware);
            }

            let mut reports = Vec::new();
            let min_coord = records.iter().map(AlignmentRecord::min_pos).min();
            let max_coord = records.iter().map(AlignmentRecord::max_pos).max();
            if let (Some(min_coord), Some(max_coord)) = (min_coord, max_coord) {
                if window_end != len {
                    carry = records
                        .iter()
                        .filter(|r| r.max_pos() + buffer > window_end)
                        .cloned()
                        .collect();
                }
                let slice = min_coord.saturating_sub(border)..max_coord.saturating_add(border).min(len);
                reports = self.call_window(contig_id, records, window_begin..window_end, slice, sink, summary)?;
                summary.windows += 1;
            }

            let mut reports = reports.into_iter().peekable();
            while let Some(&position) = requested.get(next_requested) {
                if position >= window_end {
                    break;
                }
                let report = match reports.peek() {
                    Some(report) if report.position == position => reports.next(),
                    _ => None,
                }
                .unwrap_or_else(|| PositionReport::zero(Arc::clone(&contig.name), position));
                sink.write_position(&report)?;
                summary.positions += 1;
                next_requested += 1;
            }
            window_begin = window_end;
        }
        Ok(())
    }

    /// Build the store of one window and run the callers over `bounds`.
    fn call_window(
        &self,
        contig_id: usize,
        records: Vec<AlignmentRecord>,
        bounds: Range<u32>,
        slice: Range<u32>,
        sink: &mut dyn VariantSink,
        summary: &mut ScanSummary,
    ) -> Result<Vec<PositionReport>, ScanError> {
        let contig = &self.contigs[contig_id];
        let use_base_quality = self.config.use_base_quality;
        let clipping = records.iter().any(|r| !effective_clip(r, self.config).is_empty());
        let records = if clipping {
            let before = records.len();
            let clipped: Vec<_> = records
                .into_iter()
                .filter_map(|r| clip_record(r, &contig.sequence, self.config))
                .collect();
            summary.clip_discarded += before - clipped.len();
            clipped
        } else {
            records
        };

        let window = ContigWindow::new(
            contig_id,
            Arc::clone(&contig.name),
            slice.start,
            &contig.sequence[slice.start as usize..slice.end as usize],
        );
        let store = WindowStore::build(window, &records)?;
        let range = bounds.start.saturating_sub(slice.start) as usize..bounds.end.saturating_sub(slice.start) as usize;
        debug!(
            contig = %contig.name,
            window_begin = bounds.start,
            window_end = bounds.end,
            records = store.len(),
            "calling window"
        );

        let caller = SnvCaller::new(self.config, self.model.as_ref());
        if self.config.realign && (self.emit_snvs || self.emit_indels) {
            self.call_groups(&store, &caller, bounds, use_base_quality, sink, summary)?;
        } else {
            if self.emit_indels {
                for call in direct_indels(&store, range.clone(), self.config) {
                    sink.write_indel(&call)?;
                    summary.indels += 1;
                }
            }
            if self.emit_snvs {
                for call in caller.call_direct(&store, range.clone(), use_base_quality) {
                    sink.write_snv(&call)?;
                    summary.snvs += 1;
                }
            }
        }

        let requested = self.positions.contig(contig_id);
        if requested.is_empty() {
            return Ok(Vec::new());
        }
        Ok(caller.position_reports(&store, requested, range))
    }

    /// Split the window into overlap groups and realign those with enough
    /// indel-bearing reads.
    fn call_groups(
        &self,
        store: &WindowStore,
        caller: &SnvCaller<'_>,
        bounds: Range<u32>,
        use_base_quality: bool,
        sink: &mut dyn VariantSink,
        summary: &mut ScanSummary,
    ) -> Result<(), ScanError> {
        let alignments = store.alignments();
        let border = self.config.window.realign_border as usize;
        let mut next = 0;
        while next < alignments.len() {
            let group_begin = alignments[next].begin;
            let mut group_end = alignments[next].end;
            let mut members = Vec::new();
            let mut indel_reads = 0;
            while next < alignments.len() && alignments[next].begin < group_end {
                group_end = group_end.max(alignments[next].end);
                indel_reads += alignments[next].quality.has_indel as u32;
                members.push(next);
                next += 1;
            }
            if (members.len() as u32) < self.config.min_coverage {
                continue;
            }
            let calls_begin = store.window().global(group_begin).max(bounds.start);
            let calls_end = store.window().global(group_end).min(bounds.end);
            if calls_begin >= calls_end {
                continue;
            }

            let group = store.subset(&members, border);
            let start = group.window().start;
            let range = (calls_begin - start) as usize..(calls_end - start) as usize;
            trace!(members = members.len(), indel_reads, calls_begin, calls_end, "overlap group");

            if indel_reads >= self.config.indel.count_threshold {
                let msa = MultipleAlignment::realign(&group);
                let calls = caller.call_realigned(&group, &msa, range, use_base_quality);
                if self.emit_snvs {
                    for call in &calls.snvs {
                        sink.write_snv(call)?;
                        summary.snvs += 1;
                    }
                }
                if self.emit_indels {
                    for call in realigned_indels(&group, &msa, &calls.indel_columns, self.config) {
                        if (calls_begin..calls_end).contains(&call.position) {
                            sink.write_indel(&call)?;
                            summary.indels += 1;
                        }
                    }
                }
            } else {
                if self.emit_indels {
                    for call in direct_indels(&group, range.clone(), self.config) {
                        sink.write_indel(&call)?;
                        summary.indels += 1;
                    }
                }
                if self.emit_snvs {
                    for call in caller.call_direct(&group, range, use_base_quality) {
                        sink.write_snv(&call)?;
                        summary.snvs += 1;
                    }
                }
            }
        }
        Ok(())
    }
}
