//! Pileup correction and per-column evidence accumulation.

use std::cmp::Ordering;

use bitvec::prelude::*;

use crate::genomics::store::AlignmentRecord;
use crate::genomics::types::{base_index, Strand, NUM_BASES};

/// Stack key of an alignment: contig, extent and (optionally) strand.
fn stack_key(record: &AlignmentRecord, orientation_aware: bool) -> (usize, u32, u32, Option<Strand>) {
    (
        record.contig,
        record.min_pos(),
        record.max_pos(),
        orientation_aware.then_some(record.strand),
    )
}

/// Order used by pileup correction: stack key, then preference inside a stack.
fn pile_order(a: &AlignmentRecord, b: &AlignmentRecord, orientation_aware: bool) -> Ordering {
    stack_key(a, orientation_aware)
        .cmp(&stack_key(b, orientation_aware))
        .then_with(|| b.quality.score.cmp(&a.quality.score))
        .then_with(|| a.quality.errors.cmp(&b.quality.errors))
        .then_with(|| a.id.cmp(&b.id))
}

/// Cap every stack of alignments sharing contig, begin and end (and strand in
/// orientation-aware mode) at `max_pile` members.
///
/// Inside a stack, higher score wins, then fewer errors, then lower id.
/// Returns the number of discarded records. The surviving records are left
/// sorted by stack key, so applying the correction again changes nothing.
pub fn correct_pileup(records: &mut Vec<AlignmentRecord>, max_pile: u32, orientation_aware: bool) -> usize {
    if max_pile == 0 || records.is_empty() {
        return 0;
    }
    records.sort_by(|a, b| pile_order(a, b, orientation_aware));

    let mut keep = bitvec![1; records.len()];
    let mut run_start = 0;
    for i in 1..=records.len() {
        let run_ends = i == records.len()
            || stack_key(&records[i], orientation_aware) != stack_key(&records[run_start], orientation_aware);
        if run_ends {
            let capped = run_start + max_pile as usize;
            if capped < i {
                keep[capped..i].fill(false);
            }
            run_start = i;
        }
    }

    let removed = keep.count_zeros();
    let mut flags = keep.iter().by_vals();
    records.retain(|_| flags.next().unwrap_or(true));
    removed
}

/// Base observations of one strand at one column.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StrandCounts {
    /// Observation count per base (A, C, G, T, N).
    pub counts: [u32; NUM_BASES],
    /// Summed quality per base.
    pub quality_sums: [u32; NUM_BASES],
    /// Observed qualities per base as `(quality, multiplicity)` runs, in
    /// observation order. Consecutive equal qualities share one run.
    pub qualities: [Vec<(u8, u32)>; NUM_BASES],
    /// Reads with a gap at this column.
    pub gaps: u32,
}

impl StrandCounts {
    fn observe(&mut self, idx: usize, quality: u8, count: u32) {
        self.counts[idx] += count;
        self.quality_sums[idx] += quality as u32 * count;
        match self.qualities[idx].last_mut() {
            Some((last, n)) if *last == quality => *n += count,
            _ => self.qualities[idx].push((quality, count)),
        }
    }

    /// Every observed quality of base `idx`, runs expanded.
    pub fn expanded_qualities(&self, idx: usize) -> impl Iterator<Item = u8> + '_ {
        self.qualities[idx]
            .iter()
            .flat_map(|&(q, n)| std::iter::repeat(q).take(n as usize))
    }

    /// Observations over A, C, G and T.
    pub fn coverage(&self) -> u32 {
        self.counts[..4].iter().sum()
    }
}

/// Evidence gathered for one reference column.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PileupColumn {
    /// Forward strand observations.
    pub forward: StrandCounts,
    /// Reverse strand observations.
    pub reverse: StrandCounts,
    read_positions: Vec<u32>,
}

impl PileupColumn {
    /// Empty column.
    pub fn new() -> Self {
        Self::default()
    }

    /// Strand accumulator.
    pub fn strand(&self, strand: Strand) -> &StrandCounts {
        match strand {
            Strand::Forward => &self.forward,
            Strand::Reverse => &self.reverse,
        }
    }

    fn strand_mut(&mut self, strand: Strand) -> &mut StrandCounts {
        match strand {
            Strand::Forward => &mut self.forward,
            Strand::Reverse => &mut self.reverse,
        }
    }

    /// Record `count` observations of `base` at `quality`.
    pub fn observe(&mut self, base: u8, quality: u8, strand: Strand, count: u32) {
        self.strand_mut(strand).observe(base_index(base), quality, count);
    }

    /// Record a read with a gap at this column.
    pub fn observe_gap(&mut self, strand: Strand) {
        self.strand_mut(strand).gaps += 1;
    }

    /// Remember the read offset (sequencing orientation) of a non-reference base.
    pub fn note_read_position(&mut self, offset: u32) {
        self.read_positions.push(offset);
    }

    /// Number of distinct read offsets noted.
    pub fn distinct_read_positions(&self) -> usize {
        let mut positions = self.read_positions.clone();
        positions.sort_unstable();
        positions.dedup();
        positions.len()
    }

    /// Observations of base index `idx` on both strands.
    pub fn count(&self, idx: usize) -> u32 {
        self.forward.counts[idx] + self.reverse.counts[idx]
    }

    /// Summed quality of base index `idx` on both strands.
    pub fn quality_sum(&self, idx: usize) -> u32 {
        self.forward.quality_sums[idx] + self.reverse.quality_sums[idx]
    }

    /// Total coverage over A, C, G and T on both strands.
    pub fn coverage(&self) -> u32 {
        self.forward.coverage() + self.reverse.coverage()
    }

    /// Gap observations on both strands.
    pub fn gaps(&self) -> u32 {
        self.forward.gaps + self.reverse.gaps
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::genomics::store::Read;

    fn record(id: u64, begin: u32, len: usize, score: u32, errors: u32) -> AlignmentRecord {
        AlignmentRecord::new(id, 0, begin, Strand::Forward, Read::new(vec![b'A'; len], vec![30; len]))
            .with_score(score)
            .with_errors(errors)
    }

    #[test]
    fn keeps_best_members_of_each_stack() {
        let mut records = vec![
            record(1, 10, 5, 20, 0),
            record(2, 10, 5, 30, 2),
            record(3, 10, 5, 30, 1),
            record(4, 12, 5, 10, 0),
        ];
        let removed = correct_pileup(&mut records, 1, false);
        assert_eq!(removed, 2);
        let ids: Vec<u64> = records.iter().map(|r| r.id).collect();
        assert_eq!(ids, vec![3, 4]);
    }

    #[test]
    fn ties_fall_back_to_lower_id() {
        let mut records = vec![record(9, 0, 4, 30, 0), record(5, 0, 4, 30, 0), record(7, 0, 4, 30, 0)];
        correct_pileup(&mut records, 2, false);
        let ids: Vec<u64> = records.iter().map(|r| r.id).collect();
        assert_eq!(ids, vec![5, 7]);
    }

    #[test]
    fn orientation_aware_mode_caps_strands_separately() {
        let mut reverse = record(2, 0, 4, 30, 0);
        reverse.strand = Strand::Reverse;
        let mut records = vec![record(1, 0, 4, 30, 0), reverse, record(3, 0, 4, 20, 0)];
        assert_eq!(correct_pileup(&mut records.clone(), 1, false), 2);
        assert_eq!(correct_pileup(&mut records, 1, true), 1);
        assert_eq!(records.len(), 2);
    }

    #[test]
    fn zero_cap_disables_correction() {
        let mut records = vec![record(1, 0, 4, 30, 0), record(2, 0, 4, 30, 0)];
        assert_eq!(correct_pileup(&mut records, 0, false), 0);
        assert_eq!(records.len(), 2);
    }

    #[test]
    fn column_tracks_strands_and_duplicates() {
        let mut column = PileupColumn::new();
        column.observe(b'A', 30, Strand::Forward, 2);
        column.observe(b'G', 20, Strand::Reverse, 1);
        column.observe(b'N', 10, Strand::Reverse, 1);
        column.observe_gap(Strand::Forward);
        assert_eq!(column.count(0), 2);
        assert_eq!(column.quality_sum(0), 60);
        assert_eq!(column.forward.qualities[0], vec![(30, 2)]);
        assert_eq!(column.coverage(), 3);
        assert_eq!(column.gaps(), 1);
    }

    #[test]
    fn duplicate_counts_are_kept_as_runs() {
        let mut column = PileupColumn::new();
        column.observe(b'C', 30, Strand::Forward, 1_000_000);
        column.observe(b'C', 30, Strand::Forward, 5);
        column.observe(b'C', 12, Strand::Forward, 2);
        assert_eq!(column.forward.qualities[1], vec![(30, 1_000_005), (12, 2)]);
        assert_eq!(column.count(1), 1_000_007);
        assert_eq!(column.forward.expanded_qualities(1).skip(1_000_004).collect::<Vec<_>>(), vec![30, 12, 12]);
    }

    #[test]
    fn distinct_read_positions_ignore_repeats() {
        let mut column = PileupColumn::new();
        for offset in [3, 5, 3, 9] {
            column.note_read_position(offset);
        }
        assert_eq!(column.distinct_read_positions(), 3);
    }
}
