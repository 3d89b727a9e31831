//! Short indel calling.
//!
//! Without realignment, indel events are read off every alignment's edit
//! script (or a gap-averse semi-global alignment) and counted per
//! `(position, signed length)`. After realignment, the per-column evidence
//! gathered by the SNV caller is stitched into runs of deleted reference
//! columns and runs of inserted columns. Both paths share the homopolymer
//! filter and the output record [`IndelCall`].

use std::collections::BTreeMap;
use std::ops::Range;
use std::sync::Arc;

use crate::config::CallerConfig;
use crate::genomics::align::EndGaps;
use crate::genomics::realign::MultipleAlignment;
use crate::genomics::store::{Read, WindowStore};
use crate::genomics::types::Strand;
use crate::genomics::variant_caller::gapped_layout;

const CONTEXT_FLANK: usize = 6;

/// Zygosity label of an indel call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub enum Zygosity {
    /// Supporting fraction at or below the het threshold.
    Het,
    /// Supporting fraction above the het threshold.
    Hom,
}

impl Zygosity {
    fn from_fraction(fraction: f32, het_max: f32) -> Self {
        if fraction <= het_max {
            Zygosity::Het
        } else {
            Zygosity::Hom
        }
    }

    /// Label used in indel records.
    pub fn label(self) -> &'static str {
        match self {
            Zygosity::Het => "het",
            Zygosity::Hom => "hom",
        }
    }
}

/// An emitted insertion or deletion.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct IndelCall {
    /// Contig name.
    pub contig: Arc<str>,
    /// Genomic position (0-based) of the first deleted base, or of the base
    /// following an insertion.
    pub position: u32,
    /// Positive for deletions, negative for insertions.
    pub length: i32,
    /// Inserted bases.
    pub sequence: Option<Vec<u8>>,
    /// Supporting fraction.
    pub fraction: f32,
    /// Supporting reads.
    pub count: u32,
    /// Reads spanning the event.
    pub depth: u32,
    /// Depth the fraction was computed against, when it differs in meaning
    /// from `depth` (minimum overlap depth of the direct path).
    pub ebi_depth: Option<u32>,
    /// Support coming from explicit edit scripts.
    pub split_support: u32,
    /// Indel quality.
    pub quality: u32,
    /// Longest homopolymer run flanking the event.
    pub homopolymer_run: u32,
    /// Observed on both strands.
    pub both_strands: bool,
    /// Reference bases around the event.
    pub context: Vec<u8>,
    /// Zygosity label.
    pub zygosity: Zygosity,
}

impl IndelCall {
    /// Whether the call is a deletion.
    pub fn is_deletion(&self) -> bool {
        self.length > 0
    }
}

/// Kind of event a realigned column supports.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndelColumnKind {
    /// Reads skip a reference base.
    Deletion,
    /// Reads carry this base where the reference has a gap.
    Insertion(u8),
}

/// Qualifying indel evidence at one realigned column.
#[derive(Debug, Clone, PartialEq)]
pub struct IndelColumn {
    /// Event kind.
    pub kind: IndelColumnKind,
    /// Average quality of the supporting observations.
    pub quality: u32,
    /// Support seen on both strands.
    pub both_strands: bool,
    /// Supporting reads.
    pub count: u32,
    /// Reads covering the column.
    pub depth: u32,
}

fn run_through(reference: &[u8], at: usize) -> u32 {
    let base = reference[at];
    let mut lo = at;
    while lo > 0 && reference[lo - 1] == base {
        lo -= 1;
    }
    let mut hi = at;
    while hi + 1 < reference.len() && reference[hi + 1] == base {
        hi += 1;
    }
    (hi - lo + 1) as u32
}

/// Longest run of identical bases touching the left or right end of an indel
/// at `pos` of signed `length` (deletions positive).
pub fn homopolymer_run(reference: &[u8], pos: usize, length: i32) -> u32 {
    if reference.is_empty() {
        return 0;
    }
    let last = reference.len() - 1;
    let left = pos.saturating_sub(1).min(last);
    let right = if length > 0 {
        (pos + length as usize).min(last)
    } else {
        pos.min(last)
    };
    run_through(reference, left).max(run_through(reference, right))
}

fn context(reference: &[u8], pos: usize, span: usize) -> Vec<u8> {
    let lo = pos.saturating_sub(CONTEXT_FLANK).min(reference.len());
    let hi = (pos + span + CONTEXT_FLANK).min(reference.len()).max(lo);
    reference[lo..hi].to_vec()
}

/// Candidate collected by the direct path.
#[derive(Debug, Clone, Default, PartialEq)]
struct Candidate {
    count: u32,
    quality_sum: u32,
    forward: bool,
    reverse: bool,
    sequence: Option<Vec<u8>>,
    split_support: u32,
}

/// Quality of an event starting at read offset `offset`.
fn event_quality(read: &Read, offset: usize, length: i32) -> u32 {
    let quality = |i: usize| read.quality_at(i.min(read.len().saturating_sub(1))).unwrap_or(0) as u32;
    if length > 0 {
        (quality(offset.saturating_sub(1)) + quality(offset)) / 2
    } else {
        let len = length.unsigned_abs() as usize;
        let sum: u32 = (offset..offset + len).map(quality).sum();
        sum / len.max(1) as u32
    }
}

impl Candidate {
    /// Move the evidence of `other` into `self`, leaving `other` empty.
    fn absorb(&mut self, other: &mut Candidate) {
        self.count += std::mem::take(&mut other.count);
        self.quality_sum += std::mem::take(&mut other.quality_sum);
        self.split_support += std::mem::take(&mut other.split_support);
        self.forward |= std::mem::take(&mut other.forward);
        self.reverse |= std::mem::take(&mut other.reverse);
    }
}

/// Fold same-length candidates closer than `window` into the stronger one.
fn merge_nearby(candidates: &mut [((usize, i32), Candidate)], window: usize) {
    for i in 0..candidates.len() {
        if candidates[i].1.count == 0 {
            continue;
        }
        let (origin, length) = candidates[i].0;
        let mut j = i + 1;
        while j < candidates.len() && candidates[j].0 .0 < origin + window {
            if candidates[j].0 .1 == length {
                let (head, tail) = candidates.split_at_mut(j);
                let (earlier, later) = (&mut head[i].1, &mut tail[0].1);
                if earlier.count < later.count {
                    later.absorb(earlier);
                    break;
                }
                earlier.absorb(later);
            }
            j += 1;
        }
    }
}

/// Indel calls from the raw alignments of a window, restricted to window
/// positions `range`.
pub fn direct_indels(store: &WindowStore, range: Range<usize>, config: &CallerConfig) -> Vec<IndelCall> {
    let reference = store.reference();
    let indel = &config.indel;
    let mut collected: BTreeMap<(usize, i32), Candidate> = BTreeMap::new();

    for alignment in store.alignments() {
        let Some(layout) = gapped_layout(store, alignment, EndGaps::FreeTarget) else {
            continue;
        };
        let read = store.read(alignment.read);
        let scripted = !alignment.cigar.is_empty();
        for event in layout.indels() {
            let candidate = collected.entry((event.target_pos, event.length)).or_default();
            candidate.count += alignment.count;
            candidate.quality_sum += event_quality(read, event.query_pos, event.length) * alignment.count;
            match alignment.strand {
                Strand::Forward => candidate.forward = true,
                Strand::Reverse => candidate.reverse = true,
            }
            if event.length < 0 && candidate.sequence.is_none() {
                let end = (event.query_pos + event.length.unsigned_abs() as usize).min(read.len());
                candidate.sequence = Some(read.sequence[event.query_pos..end].to_vec());
            }
            if scripted {
                candidate.split_support += alignment.count;
            }
        }
    }

    let mut candidates: Vec<_> = collected.into_iter().collect();
    if indel.window > 0 {
        merge_nearby(&mut candidates, indel.window as usize);
    }

    let alignments = store.alignments();
    let mut calls = Vec::new();
    for ((pos, length), candidate) in candidates {
        if candidate.count == 0 || candidate.count < indel.count_threshold {
            continue;
        }
        if !range.contains(&pos) || pos >= reference.len() {
            continue;
        }
        let both_strands = candidate.forward && candidate.reverse;
        if indel.both_strands && !both_strands {
            continue;
        }

        let upto = alignments.partition_point(|a| a.begin <= pos);
        let covering: Vec<_> = alignments[..upto].iter().filter(|a| a.end > pos).collect();
        if (covering.len() as u32) < config.min_coverage || reference[pos] == b'N' {
            continue;
        }
        let spanning: u32 = covering.iter().map(|a| a.count).sum();
        let overlap = indel.depth_min_overlap as usize;
        let depth = if overlap > 0 {
            covering
                .iter()
                .filter(|a| pos >= overlap && pos - overlap >= a.begin && pos + overlap < a.end)
                .map(|a| a.count)
                .sum()
        } else {
            spanning
        };
        if depth < config.min_coverage || depth == 0 {
            continue;
        }
        let fraction = candidate.count as f32 / depth as f32;
        if fraction < indel.percentage_t {
            continue;
        }
        let quality = candidate.quality_sum / candidate.count;
        if quality < indel.quality_threshold {
            continue;
        }
        let homopolymer_run = homopolymer_run(reference, pos, length);
        if homopolymer_run > indel.max_polymer_run {
            continue;
        }

        let span = if length > 0 { length as usize } else { 0 };
        calls.push(IndelCall {
            contig: Arc::clone(&store.window().name),
            position: store.window().global(pos),
            length,
            sequence: candidate.sequence,
            fraction,
            count: candidate.count,
            depth: spanning,
            ebi_depth: Some(depth),
            split_support: candidate.split_support,
            quality,
            homopolymer_run,
            both_strands,
            context: context(reference, pos, span),
            zygosity: Zygosity::from_fraction(fraction, indel.het_max),
        });
    }
    calls
}

/// Evidence summed over the columns of one run.
#[derive(Debug, Default)]
struct Run {
    size: u32,
    depth: u32,
    support: u32,
    quality: u32,
    both_strands: bool,
    inserted: Vec<u8>,
}

impl Run {
    fn new() -> Self {
        Self {
            both_strands: true,
            ..Self::default()
        }
    }

    fn add(&mut self, column: &IndelColumn) {
        self.size += 1;
        self.depth += column.depth;
        self.support += column.count;
        self.quality += column.quality;
        self.both_strands &= column.both_strands;
    }

    fn finish(self, store: &WindowStore, pos: usize, config: &CallerConfig) -> Option<IndelCall> {
        let reference = store.reference();
        let length = if self.inserted.is_empty() {
            self.size as i32
        } else {
            -(self.size as i32)
        };
        let homopolymer_run = homopolymer_run(reference, pos, length);
        if homopolymer_run > config.indel.max_polymer_run || self.depth == 0 {
            return None;
        }
        let half = self.size / 2;
        let fraction = self.support as f32 / self.depth as f32;
        let depth = (self.depth + half) / self.size;
        let quality = (self.quality + half) / self.size;
        let mut indel_quality = (quality as f32 * fraction) as u32;
        if !self.both_strands {
            indel_quality /= 2;
        }
        let span = if length > 0 { self.size as usize } else { 0 };
        Some(IndelCall {
            contig: Arc::clone(&store.window().name),
            position: store.window().global(pos),
            length,
            sequence: (!self.inserted.is_empty()).then_some(self.inserted),
            fraction,
            count: (fraction * depth as f32 + 0.00001) as u32,
            depth,
            ebi_depth: None,
            split_support: 0,
            quality: indel_quality,
            homopolymer_run,
            both_strands: self.both_strands,
            context: context(reference, pos, span),
            zygosity: Zygosity::from_fraction(fraction, config.indel.het_max),
        })
    }
}

/// Indel calls from the per-column evidence of a realigned group.
///
/// A deletion is a run of deletion columns, possibly interrupted by reference
/// gap columns without evidence. An insertion is a run of insertion columns
/// sharing one reference position.
pub fn realigned_indels(
    store: &WindowStore,
    msa: &MultipleAlignment,
    columns: &[Option<IndelColumn>],
    config: &CallerConfig,
) -> Vec<IndelCall> {
    let total = msa.columns().min(columns.len());
    let mut calls = Vec::new();
    let mut view = 0;
    while view < total {
        if columns[view].is_none() {
            view += 1;
            continue;
        }

        let mut pos = msa.position_gap_to_seq(view);
        let mut deletion = Run::new();
        while view < total {
            match &columns[view] {
                Some(column) if column.kind == IndelColumnKind::Deletion => deletion.add(column),
                None if msa.is_reference_gap(view) => {}
                _ => break,
            }
            view += 1;
        }
        if deletion.size > 0 {
            calls.extend(deletion.finish(store, pos, config));
            pos = msa.position_gap_to_seq(view);
        }

        let mut insertion = Run::new();
        while view < total {
            match &columns[view] {
                Some(column) => match column.kind {
                    IndelColumnKind::Insertion(base) => {
                        insertion.add(column);
                        insertion.inserted.push(base);
                    }
                    IndelColumnKind::Deletion => break,
                },
                None if msa.position_gap_to_seq(view) == pos => {}
                None => break,
            }
            view += 1;
        }
        if insertion.size > 0 {
            calls.extend(insertion.finish(store, pos, config));
        }
    }
    calls
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::IndelConfig;
    use crate::genomics::store::{AlignmentRecord, ContigWindow};
    use crate::genomics::types::{CigarOp, CigarOpKind};
    use test_case::test_case;

    const REFERENCE: &[u8] = b"GATTACACCGTGAACTGGCT";

    fn deletion_store() -> WindowStore {
        let mut sequence = REFERENCE[..8].to_vec();
        sequence.extend_from_slice(&REFERENCE[10..]);
        let cigar = vec![
            CigarOp::new(CigarOpKind::Match, 8),
            CigarOp::new(CigarOpKind::Deletion, 2),
            CigarOp::new(CigarOpKind::Match, 10),
        ];
        let records: Vec<_> = (0..4)
            .map(|i| {
                let strand = if i % 2 == 0 { Strand::Forward } else { Strand::Reverse };
                AlignmentRecord::new(i, 0, 0, strand, Read::new(sequence.clone(), vec![30; sequence.len()]))
                    .with_cigar(cigar.clone())
            })
            .collect();
        WindowStore::build(ContigWindow::new(0, "chr2", 100, REFERENCE.to_vec()), &records).expect("records fit")
    }

    #[test_case(b"ACGTTTTGCA", 3, 1 => 4; "deletion before run")]
    #[test_case(b"ACGTTTTGCA", 7, -1 => 4; "insertion after run")]
    #[test_case(b"AAAAACGT", 0, 2 => 5; "deletion at contig start")]
    #[test_case(b"ACGT", 4, -2 => 1; "insertion at contig end")]
    #[test_case(b"ACGTACGT", 4, 2 => 1; "no run")]
    fn homopolymer_runs(reference: &[u8], pos: usize, length: i32) -> u32 {
        homopolymer_run(reference, pos, length)
    }

    #[test]
    fn direct_path_reports_scripted_deletion() {
        let store = deletion_store();
        let config = CallerConfig::default().with_min_coverage(3);
        let calls = direct_indels(&store, 0..REFERENCE.len(), &config);
        assert_eq!(calls.len(), 1);
        let call = &calls[0];
        assert_eq!(call.position, 108);
        assert_eq!(call.length, 2);
        assert_eq!(call.count, 4);
        assert_eq!(call.depth, 4);
        assert_eq!(call.ebi_depth, Some(4));
        assert_eq!(call.split_support, 4);
        assert_eq!(call.quality, 30);
        assert_eq!(call.homopolymer_run, 2);
        assert!(call.both_strands);
        assert_eq!(call.zygosity, Zygosity::Hom);
        assert_eq!(call.context, REFERENCE[2..16].to_vec());
    }

    #[test]
    fn homopolymer_filter_suppresses_unanimous_deletion() {
        let store = deletion_store();
        let config = CallerConfig::default().with_min_coverage(3).with_indel(IndelConfig {
            max_polymer_run: 1,
            ..IndelConfig::default()
        });
        assert!(direct_indels(&store, 0..REFERENCE.len(), &config).is_empty());
    }

    #[test]
    fn range_restricts_direct_calls() {
        let store = deletion_store();
        let config = CallerConfig::default().with_min_coverage(3);
        assert!(direct_indels(&store, 0..8, &config).is_empty());
    }

    #[test]
    fn nearby_candidates_merge_into_the_stronger() {
        let candidate = |count| Candidate {
            count,
            quality_sum: 30 * count,
            forward: true,
            ..Candidate::default()
        };
        let mut candidates = vec![
            ((10, 1), candidate(1)),
            ((11, 1), candidate(3)),
            ((11, -1), candidate(2)),
            ((30, 1), candidate(5)),
        ];
        merge_nearby(&mut candidates, 2);
        let counts: Vec<u32> = candidates.iter().map(|(_, c)| c.count).collect();
        assert_eq!(counts, vec![0, 4, 2, 5]);
        assert_eq!(candidates[1].1.quality_sum, 120);
    }

    #[test]
    fn stronger_later_candidate_takes_strands_and_split_support() {
        let mut candidates = vec![
            (
                (10, -2),
                Candidate {
                    count: 1,
                    quality_sum: 20,
                    forward: true,
                    split_support: 1,
                    ..Candidate::default()
                },
            ),
            (
                (11, -2),
                Candidate {
                    count: 3,
                    quality_sum: 90,
                    reverse: true,
                    split_support: 2,
                    ..Candidate::default()
                },
            ),
        ];
        merge_nearby(&mut candidates, 3);
        let merged = &candidates[1].1;
        assert_eq!((merged.count, merged.quality_sum, merged.split_support), (4, 110, 3));
        assert!(merged.forward && merged.reverse);
        assert!(!candidates[0].1.forward);
    }

    #[test]
    fn realigned_columns_form_a_deletion_run() {
        let store = deletion_store();
        let msa = MultipleAlignment::realign(&store);
        let mut columns = vec![None; msa.columns()];
        for (view, slot) in columns.iter_mut().enumerate() {
            if !msa.is_reference_gap(view) && (8..10).contains(&msa.position_gap_to_seq(view)) {
                *slot = Some(IndelColumn {
                    kind: IndelColumnKind::Deletion,
                    quality: 30,
                    both_strands: true,
                    count: 4,
                    depth: 4,
                });
            }
        }
        let config = CallerConfig::default();
        let calls = realigned_indels(&store, &msa, &columns, &config);
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].position, 108);
        assert_eq!(calls[0].length, 2);
        assert_eq!(calls[0].count, 4);
        assert_eq!(calls[0].depth, 4);
        assert_eq!(calls[0].quality, 30);
        assert_eq!(calls[0].zygosity, Zygosity::Hom);
    }
}
