//! Alignment records and the per-window alignment store.
//!
//! Records arrive from an alignment source in genomic coordinates. For every
//! window they are copied into a fresh [`WindowStore`] whose coordinates are
//! local to the materialised reference slice. Reads live in an arena and
//! alignments refer to them through [`ReadId`], so every alignment owns
//! exactly one [`AlignmentQuality`] by construction.

use std::sync::Arc;

use thiserror::Error;

use crate::genomics::types::{self, CigarOp, CigarOpKind, Strand};

/// Errors raised when alignment data violates the store invariants.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum StoreError {
    /// Sequence and quality strings differ in length.
    #[error("alignment {id}: sequence has {sequence} bases but {qualities} qualities")]
    QualityLengthMismatch {
        /// Alignment identifier.
        id: u64,
        /// Sequence length.
        sequence: usize,
        /// Quality string length.
        qualities: usize,
    },

    /// An alignment falls outside the materialised reference slice.
    #[error("alignment {id} spans {begin}..{end} outside window of length {len}")]
    OutsideWindow {
        /// Alignment identifier.
        id: u64,
        /// Genomic begin of the alignment.
        begin: u32,
        /// Genomic end of the alignment.
        end: u32,
        /// Length of the reference slice.
        len: usize,
    },
}

/// Immutable read sequence with per-base Phred qualities.
///
/// Bases are stored in reference orientation, i.e. reverse strand reads are
/// kept reverse complemented exactly as they align.
#[derive(Debug, Clone, PartialEq)]
pub struct Read {
    /// Read bases (uppercase ASCII).
    pub sequence: Arc<[u8]>,
    /// Per-base Phred qualities.
    pub qualities: Arc<[u8]>,
}

impl Read {
    /// Construct a read from sequence and qualities.
    pub fn new(sequence: impl Into<Arc<[u8]>>, qualities: impl Into<Arc<[u8]>>) -> Self {
        Self {
            sequence: sequence.into(),
            qualities: qualities.into(),
        }
    }

    /// Read length.
    pub fn len(&self) -> usize {
        self.sequence.len()
    }

    /// Whether the read has no bases.
    pub fn is_empty(&self) -> bool {
        self.sequence.is_empty()
    }

    /// Average base quality, rounded down.
    pub fn average_quality(&self) -> u32 {
        if self.qualities.is_empty() {
            return 0;
        }
        let sum: u32 = self.qualities.iter().map(|&q| q as u32).sum();
        sum / self.qualities.len() as u32
    }

    /// Base at the provided offset.
    pub fn base_at(&self, offset: usize) -> Option<u8> {
        self.sequence.get(offset).copied()
    }

    /// Quality at the provided offset.
    pub fn quality_at(&self, offset: usize) -> Option<u8> {
        self.qualities.get(offset).copied()
    }

    /// Offset in sequencing orientation of a reference-orientation offset.
    pub fn sequencing_offset(&self, offset: usize, strand: Strand) -> usize {
        match strand {
            Strand::Forward => offset,
            Strand::Reverse => self.len() - offset - 1,
        }
    }
}

/// Per-alignment confidence annotations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct AlignmentQuality {
    /// Edit distance of the alignment.
    pub errors: u32,
    /// Aggregate confidence (mapping quality or average base quality).
    pub score: u32,
    /// Whether the alignment contains an indel and needs gapped alignment.
    pub has_indel: bool,
}

/// Bases to trim from either end of a read, in reference orientation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ReadClip {
    /// Bases trimmed at the leftmost genomic end.
    pub left: u32,
    /// Bases trimmed at the rightmost genomic end.
    pub right: u32,
}

impl ReadClip {
    /// Construct a clip.
    pub fn new(left: u32, right: u32) -> Self {
        Self { left, right }
    }

    /// Whether nothing is clipped.
    pub fn is_empty(&self) -> bool {
        self.left == 0 && self.right == 0
    }

    /// Combine two clip sources by keeping the larger trim on each side.
    pub fn max(self, other: Self) -> Self {
        Self {
            left: self.left.max(other.left),
            right: self.right.max(other.right),
        }
    }

    /// Swap sides, converting between read and reference orientation.
    pub fn swapped(self) -> Self {
        Self {
            left: self.right,
            right: self.left,
        }
    }
}

/// Alignment record as produced by an alignment source.
///
/// Coordinates are genomic and half-open. The span `begin..end` covers every
/// read base including soft clipped ones, so `end - begin` equals the span of
/// the edit script (or the read length when no script is present).
#[derive(Debug, Clone, PartialEq)]
pub struct AlignmentRecord {
    /// Stable identifier used as the final tie-break.
    pub id: u64,
    /// Index of the contig in the reference.
    pub contig: usize,
    /// Genomic begin (0-based, inclusive).
    pub begin: u32,
    /// Genomic end (exclusive).
    pub end: u32,
    /// Alignment strand.
    pub strand: Strand,
    /// Aligned read.
    pub read: Read,
    /// Error and score annotations.
    pub quality: AlignmentQuality,
    /// Pending clip, applied after pileup correction.
    pub clip: ReadClip,
    /// Soft clip part of `clip`, which is honoured even when clip tags are ignored.
    pub soft_clip: ReadClip,
    /// Explicit edit script, empty for ungapped alignments.
    pub cigar: Vec<CigarOp>,
    /// Number of identical reads this record stands for.
    pub count: u32,
    /// Input lane (file) the record came from.
    pub lane: usize,
}

impl AlignmentRecord {
    /// Ungapped alignment of `read` starting at `begin`.
    pub fn new(id: u64, contig: usize, begin: u32, strand: Strand, read: Read) -> Self {
        let end = begin + read.len() as u32;
        Self {
            id,
            contig,
            begin,
            end,
            strand,
            read,
            quality: AlignmentQuality::default(),
            clip: ReadClip::default(),
            soft_clip: ReadClip::default(),
            cigar: Vec::new(),
            count: 1,
            lane: 0,
        }
    }

    /// Attach an explicit edit script, updating the span, soft clips and
    /// indel flag.
    pub fn with_cigar(mut self, cigar: Vec<CigarOp>) -> Self {
        self.end = self.begin + types::span_len(&cigar);
        self.quality.has_indel = types::has_indel(&cigar);
        let soft = |op: Option<&CigarOp>| match op {
            Some(op) if op.kind == CigarOpKind::SoftClip => op.len,
            _ => 0,
        };
        self.soft_clip = ReadClip::new(soft(cigar.first()), soft(cigar.last()));
        self.cigar = cigar;
        self
    }

    /// Set the edit distance.
    pub fn with_errors(mut self, errors: u32) -> Self {
        self.quality.errors = errors;
        self
    }

    /// Set the alignment score.
    pub fn with_score(mut self, score: u32) -> Self {
        self.quality.score = score;
        self
    }

    /// Mark the alignment as indel-bearing without an explicit script.
    pub fn with_indel_flag(mut self, has_indel: bool) -> Self {
        self.quality.has_indel = has_indel;
        self
    }

    /// Set a pending explicit clip (clip tag), in reference orientation.
    pub fn with_clip(mut self, clip: ReadClip) -> Self {
        self.clip = clip;
        self
    }

    /// Set the duplicate count.
    pub fn with_count(mut self, count: u32) -> Self {
        self.count = count.max(1);
        self
    }

    /// Set the input lane.
    pub fn with_lane(mut self, lane: usize) -> Self {
        self.lane = lane;
        self
    }

    /// Leftmost genomic coordinate.
    pub fn min_pos(&self) -> u32 {
        self.begin
    }

    /// Rightmost genomic coordinate (exclusive).
    pub fn max_pos(&self) -> u32 {
        self.end
    }

    /// Check sequence/quality consistency.
    pub fn validate(&self) -> Result<(), StoreError> {
        if self.read.sequence.len() != self.read.qualities.len() {
            return Err(StoreError::QualityLengthMismatch {
                id: self.id,
                sequence: self.read.sequence.len(),
                qualities: self.read.qualities.len(),
            });
        }
        Ok(())
    }
}

/// Index of a read inside a [`WindowStore`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ReadId(pub usize);

/// Alignment translated into window-local coordinates.
#[derive(Debug, Clone, PartialEq)]
pub struct Alignment {
    /// Stable identifier inherited from the record.
    pub id: u64,
    /// Aligned read.
    pub read: ReadId,
    /// Window-local begin.
    pub begin: usize,
    /// Window-local end (exclusive).
    pub end: usize,
    /// Alignment strand.
    pub strand: Strand,
    /// Error and score annotations.
    pub quality: AlignmentQuality,
    /// Explicit edit script, empty for ungapped alignments.
    pub cigar: Vec<CigarOp>,
    /// Number of identical reads this alignment stands for.
    pub count: u32,
}

impl Alignment {
    /// Whether the alignment lies on the reverse strand.
    pub fn is_reverse(&self) -> bool {
        self.strand.is_reverse()
    }

    /// Whether the alignment covers the window-local position.
    pub fn covers(&self, pos: usize) -> bool {
        self.begin <= pos && pos < self.end
    }
}

/// Reference slice backing one window.
#[derive(Debug, Clone, PartialEq)]
pub struct ContigWindow {
    /// Contig index.
    pub contig: usize,
    /// Contig name.
    pub name: Arc<str>,
    /// Genomic coordinate of the first base of `sequence`.
    pub start: u32,
    /// Reference bases of the slice.
    pub sequence: Arc<[u8]>,
}

impl ContigWindow {
    /// Construct a window over `sequence` starting at genomic `start`.
    pub fn new(
        contig: usize,
        name: impl Into<Arc<str>>,
        start: u32,
        sequence: impl Into<Arc<[u8]>>,
    ) -> Self {
        Self {
            contig,
            name: name.into(),
            start,
            sequence: sequence.into(),
        }
    }

    /// Slice length.
    pub fn len(&self) -> usize {
        self.sequence.len()
    }

    /// Whether the slice is empty.
    pub fn is_empty(&self) -> bool {
        self.sequence.is_empty()
    }

    /// Genomic coordinate of a window-local position.
    pub fn global(&self, local: usize) -> u32 {
        self.start + local as u32
    }

    /// Window-local position of a genomic coordinate, if inside the slice.
    pub fn local(&self, global: u32) -> Option<usize> {
        let local = global.checked_sub(self.start)? as usize;
        (local < self.len()).then_some(local)
    }
}

/// Reads and alignments of one window in window-local coordinates.
#[derive(Debug, Clone)]
pub struct WindowStore {
    window: ContigWindow,
    reads: Vec<Read>,
    alignments: Vec<Alignment>,
}

impl WindowStore {
    /// Translate `records` into the coordinate system of `window`.
    ///
    /// Alignments are ordered by begin, end and id. Any record outside the
    /// slice violates the window invariant and is reported as an error.
    pub fn build(window: ContigWindow, records: &[AlignmentRecord]) -> Result<Self, StoreError> {
        let len = window.len();
        let mut reads = Vec::with_capacity(records.len());
        let mut alignments = Vec::with_capacity(records.len());

        for record in records {
            record.validate()?;
            let outside = StoreError::OutsideWindow {
                id: record.id,
                begin: record.begin,
                end: record.end,
                len,
            };
            let begin = record.begin.checked_sub(window.start).ok_or_else(|| outside.clone())? as usize;
            let end = record.end.checked_sub(window.start).ok_or_else(|| outside.clone())? as usize;
            if end > len || begin >= end {
                return Err(outside);
            }

            let read = ReadId(reads.len());
            reads.push(record.read.clone());
            alignments.push(Alignment {
                id: record.id,
                read,
                begin,
                end,
                strand: record.strand,
                quality: record.quality,
                cigar: record.cigar.clone(),
                count: record.count,
            });
        }

        alignments.sort_by_key(|a| (a.begin, a.end, a.id));
        Ok(Self {
            window,
            reads,
            alignments,
        })
    }

    /// Reference slice of this window.
    pub fn window(&self) -> &ContigWindow {
        &self.window
    }

    /// Reference bases.
    pub fn reference(&self) -> &[u8] {
        &self.window.sequence
    }

    /// Alignments ordered by begin position.
    pub fn alignments(&self) -> &[Alignment] {
        &self.alignments
    }

    /// Read referenced by an alignment.
    pub fn read(&self, id: ReadId) -> &Read {
        &self.reads[id.0]
    }

    /// Number of alignments.
    pub fn len(&self) -> usize {
        self.alignments.len()
    }

    /// Whether the store holds no alignments.
    pub fn is_empty(&self) -> bool {
        self.alignments.is_empty()
    }

    /// Copy a subset of alignments into a store over a narrower slice.
    ///
    /// The slice starts `border` bases before the first member and ends
    /// `border` bases after the last member's end, clamped to this window.
    pub fn subset(&self, members: &[usize], border: usize) -> WindowStore {
        let lo = members
            .iter()
            .map(|&i| self.alignments[i].begin)
            .min()
            .unwrap_or(0)
            .saturating_sub(border);
        let hi = members
            .iter()
            .map(|&i| self.alignments[i].end)
            .max()
            .unwrap_or(0)
            .saturating_add(border)
            .min(self.window.len())
            .max(lo);

        let window = ContigWindow {
            contig: self.window.contig,
            name: Arc::clone(&self.window.name),
            start: self.window.global(lo),
            sequence: Arc::from(&self.window.sequence[lo..hi]),
        };

        let mut reads = Vec::with_capacity(members.len());
        let mut alignments = Vec::with_capacity(members.len());
        for &i in members {
            let source = &self.alignments[i];
            let read = ReadId(reads.len());
            reads.push(self.reads[source.read.0].clone());
            alignments.push(Alignment {
                read,
                begin: source.begin - lo,
                end: source.end - lo,
                ..source.clone()
            });
        }
        alignments.sort_by_key(|a| (a.begin, a.end, a.id));
        WindowStore {
            window,
            reads,
            alignments,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(id: u64, begin: u32, seq: &[u8]) -> AlignmentRecord {
        AlignmentRecord::new(id, 0, begin, Strand::Forward, Read::new(seq.to_vec(), vec![30; seq.len()]))
    }

    #[test]
    fn build_translates_coordinates() {
        let window = ContigWindow::new(0, "chr1", 100, b"ACGTACGTAC".to_vec());
        let records = vec![record(2, 104, b"ACGT"), record(1, 100, b"ACG")];
        let store = WindowStore::build(window, &records).expect("records fit");
        assert_eq!(store.len(), 2);
        assert_eq!(store.alignments()[0].begin, 0);
        assert_eq!(store.alignments()[0].end, 3);
        assert_eq!(store.alignments()[1].begin, 4);
        assert_eq!(store.read(store.alignments()[1].read).sequence.as_ref(), b"ACGT");
    }

    #[test]
    fn build_rejects_alignment_outside_slice() {
        let window = ContigWindow::new(0, "chr1", 100, b"ACGT".to_vec());
        let err = WindowStore::build(window, &[record(7, 102, b"ACGT")]).unwrap_err();
        assert!(matches!(err, StoreError::OutsideWindow { id: 7, .. }));
    }

    #[test]
    fn build_rejects_quality_mismatch() {
        let window = ContigWindow::new(0, "chr1", 0, b"ACGTACGT".to_vec());
        let mut bad = record(3, 0, b"ACGT");
        bad.read.qualities = Arc::from(vec![30u8; 2]);
        assert!(matches!(
            WindowStore::build(window, &[bad]),
            Err(StoreError::QualityLengthMismatch { id: 3, .. })
        ));
    }

    #[test]
    fn cigar_updates_span() {
        let rec = record(1, 10, b"ACGTAC").with_cigar(vec![
            CigarOp::new(CigarOpKind::Match, 3),
            CigarOp::new(CigarOpKind::Deletion, 2),
            CigarOp::new(CigarOpKind::Match, 3),
        ]);
        assert_eq!(rec.end, 18);
        assert!(rec.quality.has_indel);
    }

    #[test]
    fn subset_shifts_into_narrower_slice() {
        let window = ContigWindow::new(0, "chr1", 0, b"ACGTACGTACGTACGT".to_vec());
        let records = vec![record(1, 0, b"ACGT"), record(2, 8, b"ACGT"), record(3, 10, b"GTAC")];
        let store = WindowStore::build(window, &records).expect("records fit");
        let group = store.subset(&[1, 2], 1);
        assert_eq!(group.window().start, 7);
        assert_eq!(group.reference(), b"TACGTACG");
        assert_eq!(group.alignments()[0].begin, 1);
        assert_eq!(group.alignments()[1].begin, 3);
    }

    #[test]
    fn clip_sources_combine_by_maximum() {
        let explicit = ReadClip::new(3, 0);
        let soft = ReadClip::new(1, 4);
        assert_eq!(explicit.max(soft), ReadClip::new(3, 4));
        assert_eq!(soft.swapped(), ReadClip::new(4, 1));
    }
}
