//! Per-position SNV calling over raw or realigned alignments.
//!
//! [`SnvCaller`] walks the reference positions of a window, gathers the bases
//! of every overlapping read into a [`PileupColumn`] and hands candidate
//! columns to the configured [`GenotypeModel`]. The realigned variant also
//! collects the per-column insertion and deletion evidence consumed by the
//! indel caller.

use std::ops::Range;
use std::sync::Arc;

use crate::config::CallerConfig;
use crate::genomics::align::{align, EndGaps, PairwiseAlignment, Scoring};
use crate::genomics::indel::{IndelColumn, IndelColumnKind};
use crate::genomics::pileup::PileupColumn;
use crate::genomics::realign::{MultipleAlignment, RowCell};
use crate::genomics::statistics::{GenotypeModel, SingleBaseVariant};
use crate::genomics::store::{Alignment, WindowStore};
use crate::genomics::types::{base_index, index_base, Strand, GAP, NUM_BASES};

/// SNV candidate at one reference position.
#[derive(Debug, Clone, PartialEq)]
pub struct SnvCall {
    /// Contig name.
    pub contig: Arc<str>,
    /// Genomic position (0-based).
    pub position: u32,
    /// Reference base.
    pub reference: u8,
    /// Evidence gathered at the position.
    pub column: PileupColumn,
    /// Genotype model outcome, `None` when the model found nothing to weigh.
    pub variant: Option<SingleBaseVariant>,
}

impl SnvCall {
    /// Whether the genotype model called a variant.
    pub fn is_called(&self) -> bool {
        self.variant.map_or(false, |v| v.called)
    }
}

/// Base counts reported for a requested position.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct PositionReport {
    /// Contig name.
    pub contig: Arc<str>,
    /// Genomic position (0-based).
    pub position: u32,
    /// Forward strand counts of A, C, G and T.
    pub forward: [u32; 4],
    /// Reverse strand counts of A, C, G and T.
    pub reverse: [u32; 4],
    /// Reads with a deletion at the position, forward then reverse.
    pub deletions: [u32; 2],
}

impl PositionReport {
    /// Report for a position no read covers.
    pub fn zero(contig: Arc<str>, position: u32) -> Self {
        Self {
            contig,
            position,
            forward: [0; 4],
            reverse: [0; 4],
            deletions: [0; 2],
        }
    }

    /// Bases plus deletions on both strands.
    pub fn coverage(&self) -> u32 {
        self.forward.iter().sum::<u32>()
            + self.reverse.iter().sum::<u32>()
            + self.deletions.iter().sum::<u32>()
    }
}

/// Calls produced from one realigned group.
#[derive(Debug, Clone, Default)]
pub struct RealignedCalls {
    /// SNV candidates in position order.
    pub snvs: Vec<SnvCall>,
    /// Indel evidence per alignment column, `None` where nothing qualified.
    pub indel_columns: Vec<Option<IndelColumn>>,
}

/// Read offset aligned to each reference position of an alignment.
#[derive(Debug, Clone)]
pub(crate) struct ReadLayout {
    begin: usize,
    read_len: usize,
    offsets: Option<Vec<Option<usize>>>,
}

impl ReadLayout {
    /// Layout of `alignment`: its edit script, a gapped alignment for reads
    /// flagged with an indel, or the identity.
    pub(crate) fn new(store: &WindowStore, alignment: &Alignment) -> Self {
        let read_len = store.read(alignment.read).len();
        let gapped = gapped_layout(store, alignment, EndGaps::Global);
        Self {
            begin: gapped.as_ref().map_or(alignment.begin, |g| g.target_begin),
            read_len,
            offsets: gapped.map(|g| g.query_positions()),
        }
    }

    /// Read offset at window position `pos`, `None` for a gap or outside.
    pub(crate) fn offset(&self, pos: usize) -> Option<usize> {
        let i = pos.checked_sub(self.begin)?;
        match &self.offsets {
            Some(offsets) => offsets.get(i).copied().flatten(),
            None => (i < self.read_len).then_some(i),
        }
    }
}

/// Gapped alignment of a read that carries an indel, `None` for ungapped reads.
pub(crate) fn gapped_layout(
    store: &WindowStore,
    alignment: &Alignment,
    ends: EndGaps,
) -> Option<PairwiseAlignment> {
    if !alignment.cigar.is_empty() {
        return Some(PairwiseAlignment::from_cigar(&alignment.cigar, alignment.begin));
    }
    let read = store.read(alignment.read);
    if !alignment.quality.has_indel && alignment.end - alignment.begin == read.len() {
        return None;
    }
    let mut gapped = align(
        &read.sequence,
        &store.reference()[alignment.begin..alignment.end],
        Scoring::INDEL_DISCOVERY,
        ends,
        None,
    );
    gapped.target_begin += alignment.begin;
    gapped.target_end += alignment.begin;
    Some(gapped)
}

/// Sweep over alignments sorted by begin, tracking those covering a position.
#[derive(Debug)]
struct CoverageSweep<'s> {
    store: &'s WindowStore,
    next: usize,
    active: Vec<(usize, ReadLayout)>,
}

impl<'s> CoverageSweep<'s> {
    fn new(store: &'s WindowStore) -> Self {
        Self {
            store,
            next: 0,
            active: Vec::new(),
        }
    }

    /// Alignments covering `pos`; positions must not decrease between calls.
    fn advance(&mut self, pos: usize) -> &[(usize, ReadLayout)] {
        let alignments = self.store.alignments();
        while self.next < alignments.len() && alignments[self.next].begin <= pos {
            let alignment = &alignments[self.next];
            self.active.push((self.next, ReadLayout::new(self.store, alignment)));
            self.next += 1;
        }
        self.active.retain(|(idx, _)| alignments[*idx].end > pos);
        &self.active
    }
}

/// Apply error-rate calibration to a base quality.
///
/// `q' = (eps * f * score / 2^(20f - 1) + q) / (20f + 1)` with `eps` the
/// alignment's error rate, truncated twice like integer arithmetic.
pub fn calibrate_quality(quality: u8, errors: u32, read_len: usize, score: u32, factor: f32) -> u8 {
    if read_len == 0 {
        return quality;
    }
    let eps = errors as f32 / read_len as f32;
    let raised = (eps * factor * score as f32 / 2f32.powf(20.0 * factor - 1.0) + quality as f32) as i32;
    (raised as f32 / (20.0 * factor + 1.0)).clamp(0.0, 255.0) as u8
}

/// Running deletion or insertion evidence of one realigned column.
#[derive(Debug, Clone, Default)]
struct IndelTally {
    reads: [u32; 2],
    quality: [u32; 2],
    column: PileupColumn,
}

impl IndelTally {
    fn note(&mut self, strand: Strand, count: u32, quality: u32, read_position: u32) {
        let s = strand.is_reverse() as usize;
        self.reads[s] += count;
        self.quality[s] += quality;
        self.column.note_read_position(read_position);
    }

    fn total(&self) -> u32 {
        self.reads[0] + self.reads[1]
    }

    fn both_strands(&self) -> bool {
        self.reads[0] > 0 && self.reads[1] > 0
    }
}

/// SNV caller bound to a configuration and genotype model.
#[derive(Debug, Clone, Copy)]
pub struct SnvCaller<'a> {
    config: &'a CallerConfig,
    model: &'a dyn GenotypeModel,
}

impl<'a> SnvCaller<'a> {
    /// Create a caller.
    pub fn new(config: &'a CallerConfig, model: &'a dyn GenotypeModel) -> Self {
        Self { config, model }
    }

    /// Quality of one observation after calibration and the base quality cap.
    fn observed_quality(&self, raw: u8, alignment: &Alignment, read_len: usize, use_base_quality: bool) -> u8 {
        let mut quality = raw;
        let factor = self.config.quality_calibration_factor;
        if factor > 0.0001 {
            quality = calibrate_quality(
                quality,
                alignment.quality.errors,
                read_len,
                alignment.quality.score,
                factor,
            );
        }
        if !use_base_quality && quality as u32 > alignment.quality.score {
            quality = alignment.quality.score.min(u8::MAX as u32) as u8;
        }
        quality
    }

    /// Record the read offset of a mismatch for the distinct-offset filter.
    fn note_read_position(&self, column: &mut PileupColumn, offset: usize, read_len: usize, strand: Strand) {
        if self.config.min_different_read_pos == 0 {
            return;
        }
        let sequencing = match strand {
            Strand::Forward => offset,
            Strand::Reverse => read_len - offset - 1,
        };
        let border = self.config.exclude_border_pos as usize;
        if read_len - sequencing > border && sequencing >= border {
            column.note_read_position(sequencing as u32);
        }
    }

    /// Run the genotype model on a candidate column.
    fn genotype(&self, column: PileupColumn, reference: u8, contig: &Arc<str>, position: u32) -> Option<SnvCall> {
        if column.coverage() < self.config.min_coverage {
            return None;
        }
        if (column.distinct_read_positions() as u32) < self.config.min_different_read_pos {
            return None;
        }
        let variant = self.model.call(&column, reference);
        let call = SnvCall {
            contig: Arc::clone(contig),
            position,
            reference,
            column,
            variant,
        };
        (call.is_called() || self.config.output.all_candidates).then_some(call)
    }

    /// Call SNVs at window positions `range` from the raw alignments.
    pub fn call_direct(&self, store: &WindowStore, range: Range<usize>, use_base_quality: bool) -> Vec<SnvCall> {
        let reference = store.reference();
        let contig = &store.window().name;
        let mut sweep = CoverageSweep::new(store);
        let mut calls = Vec::new();

        for pos in range.start..range.end.min(reference.len()) {
            let reference_base = reference[pos];
            let covering = sweep.advance(pos);
            if reference_base == b'N' || (covering.len() as u32) < self.config.min_coverage {
                continue;
            }

            let mut column = PileupColumn::new();
            let mut observed_mutation = false;
            for (idx, layout) in covering {
                let Some(offset) = layout.offset(pos) else {
                    continue;
                };
                let alignment = &store.alignments()[*idx];
                let read = store.read(alignment.read);
                let base = read.sequence[offset];
                let quality =
                    self.observed_quality(read.qualities[offset], alignment, read.len(), use_base_quality);
                column.observe(base, quality, alignment.strand, alignment.count);
                if base != reference_base {
                    observed_mutation = true;
                    self.note_read_position(&mut column, offset, read.len(), alignment.strand);
                }
            }
            if !observed_mutation {
                continue;
            }
            if let Some(call) = self.genotype(column, reference_base, contig, store.window().global(pos)) {
                calls.push(call);
            }
        }
        calls
    }

    /// Call SNVs and gather indel evidence over a realigned group.
    ///
    /// `range` holds the group positions whose calls belong to this window.
    pub fn call_realigned(
        &self,
        store: &WindowStore,
        msa: &MultipleAlignment,
        range: Range<usize>,
        use_base_quality: bool,
    ) -> RealignedCalls {
        let reference = store.reference();
        let contig = &store.window().name;
        let mut calls = RealignedCalls {
            snvs: Vec::new(),
            indel_columns: vec![None; msa.columns()],
        };
        let rows = msa.rows();
        let mut first_row = 0;

        for view in 0..msa.columns() {
            let pos = msa.position_gap_to_seq(view);
            if !range.contains(&pos) {
                continue;
            }
            let reference_gap = msa.is_reference_gap(view);
            let reference_base = if reference_gap { GAP } else { reference[pos] };
            if reference_base == b'N' {
                continue;
            }

            // rows are ordered by begin, so only a finished prefix can be skipped
            while first_row < rows.len() && rows[first_row].end() <= view {
                first_row += 1;
            }
            let covering: Vec<usize> = (first_row..rows.len())
                .take_while(|&r| rows[r].begin() <= view)
                .filter(|&r| rows[r].covers(view))
                .collect();
            if (covering.len() as u32) < self.config.min_coverage {
                continue;
            }

            let mut column = PileupColumn::new();
            let mut tally = IndelTally::default();
            let mut observed_mutation = false;
            let mut position_coverage = 0;

            for &r in &covering {
                let row = &rows[r];
                let alignment = &store.alignments()[row.alignment];
                let read = store.read(alignment.read);
                let strand = alignment.strand;
                position_coverage += alignment.count;
                match row.cell(view) {
                    Some(RowCell::Base(offset)) => {
                        let base = read.sequence[offset];
                        let quality = self.observed_quality(
                            read.qualities[offset],
                            alignment,
                            read.len(),
                            use_base_quality,
                        );
                        if reference_gap {
                            let sequencing = read.sequencing_offset(offset, strand) as u32;
                            tally.note(strand, alignment.count, 0, sequencing);
                        } else if base != reference_base {
                            observed_mutation = true;
                            self.note_read_position(&mut column, offset, read.len(), strand);
                        }
                        column.observe(base, quality, strand, alignment.count);
                    }
                    Some(RowCell::Gap) if !reference_gap => {
                        let before = row.bases_before(view);
                        let (left, right) = (before.saturating_sub(1), before.min(read.len() - 1));
                        let quality = (read.qualities[left] as u32 + read.qualities[right] as u32) / 2;
                        let sequencing = match strand {
                            Strand::Forward => before,
                            Strand::Reverse => read.len() - before,
                        } as u32;
                        tally.note(strand, alignment.count, quality * alignment.count, sequencing);
                        column.observe_gap(strand);
                    }
                    _ => {}
                }
            }
            if position_coverage < self.config.min_coverage {
                continue;
            }

            let entry = if reference_gap {
                self.insertion_column(&column, &tally, position_coverage)
            } else {
                self.deletion_column(&tally, position_coverage)
            };
            calls.indel_columns[view] = entry;

            if observed_mutation && !reference_gap {
                let position = store.window().global(pos);
                if let Some(call) = self.genotype(column, reference_base, contig, position) {
                    calls.snvs.push(call);
                }
            }
        }
        calls
    }

    /// Tests shared by insertion and deletion columns on the reads with an event.
    fn indel_support(&self, tally: &IndelTally, position_coverage: u32) -> bool {
        let indel = &self.config.indel;
        let reads = tally.total();
        reads > 0
            && reads >= indel.count_threshold
            && reads as f32 / position_coverage as f32 >= indel.percentage_t
            && tally.column.distinct_read_positions() as u32 >= self.config.min_different_read_pos
            && (!indel.both_strands || tally.both_strands())
    }

    fn deletion_column(&self, tally: &IndelTally, position_coverage: u32) -> Option<IndelColumn> {
        if !self.indel_support(tally, position_coverage) {
            return None;
        }
        let reads = tally.total();
        let quality = (tally.quality[0] + tally.quality[1]) / reads;
        (quality >= self.config.indel.quality_threshold).then_some(IndelColumn {
            kind: IndelColumnKind::Deletion,
            quality,
            both_strands: tally.both_strands(),
            count: reads,
            depth: position_coverage,
        })
    }

    fn insertion_column(&self, column: &PileupColumn, tally: &IndelTally, position_coverage: u32) -> Option<IndelColumn> {
        if !self.indel_support(tally, position_coverage) {
            return None;
        }
        let indel = &self.config.indel;
        let reads = tally.total();
        let mut most_common = 0;
        let mut max_count = 0;
        for k in 0..NUM_BASES {
            if column.count(k) > max_count {
                max_count = column.count(k);
                most_common = k;
            }
        }
        let coverage = position_coverage as f32;
        if max_count < indel.count_threshold
            || (max_count as f32) / coverage < indel.percentage_t
            || ((max_count + position_coverage - reads) as f32) / coverage < self.config.maq.min_explained_column
        {
            return None;
        }
        let quality = column.quality_sum(most_common) / max_count;
        (quality >= indel.quality_threshold).then_some(IndelColumn {
            kind: IndelColumnKind::Insertion(index_base(most_common)),
            quality,
            both_strands: tally.both_strands(),
            count: max_count,
            depth: position_coverage,
        })
    }

    /// Base and deletion counts at requested genomic `positions` inside `range`.
    pub fn position_reports(&self, store: &WindowStore, positions: &[u32], range: Range<usize>) -> Vec<PositionReport> {
        let window = store.window();
        let contig = &window.name;
        let mut sweep = CoverageSweep::new(store);
        let mut reports = Vec::new();

        for &position in positions {
            let Some(pos) = window.local(position) else {
                continue;
            };
            if !range.contains(&pos) {
                continue;
            }
            let mut report = PositionReport::zero(Arc::clone(contig), position);
            for (idx, layout) in sweep.advance(pos) {
                let alignment = &store.alignments()[*idx];
                let strand = alignment.strand.is_reverse() as usize;
                match layout.offset(pos) {
                    Some(offset) => {
                        let base = base_index(store.read(alignment.read).sequence[offset]);
                        if base < 4 {
                            let counts = if strand == 0 {
                                &mut report.forward
                            } else {
                                &mut report.reverse
                            };
                            counts[base] += alignment.count;
                        }
                    }
                    None => report.deletions[strand] += alignment.count,
                }
            }
            reports.push(report);
        }
        reports
    }
}
