//! Reference contigs, requested positions and the alignment source seam.

use std::collections::VecDeque;
use std::sync::Arc;

use thiserror::Error;

use crate::genomics::store::{AlignmentRecord, StoreError};

/// Errors raised by alignment, reference and position inputs.
#[derive(Debug, Error)]
pub enum SourceError {
    /// Records went backwards in contig or position.
    #[error(
        "alignments are not sorted: contig {contig} position {position} follows contig {previous_contig} position {previous_position}"
    )]
    Unsorted {
        /// Contig of the offending record.
        contig: usize,
        /// Begin of the offending record.
        position: u32,
        /// Contig of the previous record.
        previous_contig: usize,
        /// Begin of the previous record.
        previous_position: u32,
    },
    /// BAM/SAM decoding failed.
    #[error("failed to read alignments from {path}: {source}")]
    Htslib {
        /// Input path.
        path: String,
        /// Underlying htslib error.
        #[source]
        source: rust_htslib::errors::Error,
    },
    /// Reference parsing failed.
    #[error("failed to parse reference {path}: {message}")]
    Reference {
        /// Input path.
        path: String,
        /// Parser message.
        message: String,
    },
    /// A positions line could not be parsed.
    #[error("malformed positions line {line}: {message}")]
    Positions {
        /// 1-based line number.
        line: usize,
        /// What was wrong.
        message: String,
    },
    /// A record violates the store invariants.
    #[error(transparent)]
    Store(#[from] StoreError),
    /// Plain I/O failure.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// One reference sequence.
#[derive(Debug, Clone, PartialEq)]
pub struct Contig {
    /// Name as given in the reference.
    pub name: Arc<str>,
    /// Upper-case bases, non-ACGT mapped to `N`.
    pub sequence: Arc<[u8]>,
}

impl Contig {
    /// Contig from a name and normalised sequence.
    pub fn new(name: impl Into<Arc<str>>, sequence: impl Into<Arc<[u8]>>) -> Self {
        Self {
            name: name.into(),
            sequence: sequence.into(),
        }
    }

    /// Contig length.
    pub fn len(&self) -> usize {
        self.sequence.len()
    }

    /// Whether the contig has no bases.
    pub fn is_empty(&self) -> bool {
        self.sequence.is_empty()
    }
}

fn strip_chr(name: &str) -> &str {
    name.strip_prefix("chr").unwrap_or(name)
}

/// Index of the contig called `name`, tolerating a missing or extra `chr`
/// prefix on either side.
pub fn contig_index(contigs: &[Contig], name: &str) -> Option<usize> {
    contigs
        .iter()
        .position(|c| c.name.as_ref() == name)
        .or_else(|| contigs.iter().position(|c| strip_chr(&c.name) == strip_chr(name)))
}

/// Requested 0-based positions, sorted per contig.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PositionSet {
    per_contig: Vec<Vec<u32>>,
}

impl PositionSet {
    /// Empty set over `contigs` contigs.
    pub fn new(contigs: usize) -> Self {
        Self {
            per_contig: vec![Vec::new(); contigs],
        }
    }

    /// Add a position; out-of-range contigs are ignored.
    pub fn insert(&mut self, contig: usize, position: u32) {
        if let Some(positions) = self.per_contig.get_mut(contig) {
            positions.push(position);
        }
    }

    /// Sort and deduplicate every contig's positions.
    pub fn finalize(mut self) -> Self {
        for positions in &mut self.per_contig {
            positions.sort_unstable();
            positions.dedup();
        }
        self
    }

    /// Positions on `contig`.
    pub fn contig(&self, contig: usize) -> &[u32] {
        self.per_contig.get(contig).map_or(&[], Vec::as_slice)
    }

    /// Whether no position was requested.
    pub fn is_empty(&self) -> bool {
        self.per_contig.iter().all(Vec::is_empty)
    }
}

/// Streaming producer of alignment records sorted by contig and begin.
pub trait AlignmentSource {
    /// Records on `contig` beginning before `end` that were not returned yet.
    ///
    /// Records on earlier contigs are dropped. `begin` is the start of the
    /// requested window and only serves diagnostics.
    fn next_window(&mut self, contig: usize, begin: u32, end: u32) -> Result<Vec<AlignmentRecord>, SourceError>;

    /// Input lane of this source.
    fn lane(&self) -> usize;
}

/// Tracks the last emitted record to reject unsorted input.
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct SortGuard {
    last: Option<(usize, u32)>,
}

impl SortGuard {
    pub(crate) fn check(&mut self, contig: usize, position: u32) -> Result<(), SourceError> {
        if let Some((previous_contig, previous_position)) = self.last {
            if (contig, position) < (previous_contig, previous_position) {
                return Err(SourceError::Unsorted {
                    contig,
                    position,
                    previous_contig,
                    previous_position,
                });
            }
        }
        self.last = Some((contig, position));
        Ok(())
    }
}

/// In-memory source over records already sorted by contig and begin.
#[derive(Debug, Clone, Default)]
pub struct VecAlignmentSource {
    records: VecDeque<AlignmentRecord>,
    lane: usize,
    guard: SortGuard,
}

impl VecAlignmentSource {
    /// Source over `records`.
    pub fn new(records: Vec<AlignmentRecord>) -> Self {
        Self {
            records: records.into(),
            lane: 0,
            guard: SortGuard::default(),
        }
    }

    /// Assign the lane reported to the scanner.
    pub fn with_lane(mut self, lane: usize) -> Self {
        self.lane = lane;
        self
    }

    /// Records not handed out yet.
    pub fn remaining(&self) -> usize {
        self.records.len()
    }
}

impl AlignmentSource for VecAlignmentSource {
    fn next_window(&mut self, contig: usize, _begin: u32, end: u32) -> Result<Vec<AlignmentRecord>, SourceError> {
        let mut batch = Vec::new();
        while let Some(record) = self.records.front() {
            if record.contig > contig || (record.contig == contig && record.begin >= end) {
                break;
            }
            self.guard.check(record.contig, record.begin)?;
            let Some(record) = self.records.pop_front() else {
                break;
            };
            if record.contig == contig {
                batch.push(record.with_lane(self.lane));
            }
        }
        Ok(batch)
    }

    fn lane(&self) -> usize {
        self.lane
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::genomics::store::Read;
    use crate::genomics::types::Strand;

    fn record(id: u64, contig: usize, begin: u32) -> AlignmentRecord {
        AlignmentRecord::new(id, contig, begin, Strand::Forward, Read::new(b"ACGT".to_vec(), vec![30; 4]))
    }

    #[test]
    fn windows_hand_out_records_once() {
        let mut source = VecAlignmentSource::new(vec![record(0, 0, 1), record(1, 0, 5), record(2, 0, 12)]);
        assert_eq!(source.next_window(0, 0, 10).expect("sorted").len(), 2);
        assert_eq!(source.next_window(0, 10, 20).expect("sorted").len(), 1);
        assert_eq!(source.remaining(), 0);
    }

    #[test]
    fn earlier_contigs_are_dropped() {
        let mut source = VecAlignmentSource::new(vec![record(0, 0, 1), record(1, 1, 0)]);
        let batch = source.next_window(1, 0, 10).expect("sorted");
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].id, 1);
    }

    #[test]
    fn position_regression_is_rejected() {
        let mut source = VecAlignmentSource::new(vec![record(0, 0, 8), record(1, 0, 3)]);
        let err = source.next_window(0, 0, 10).unwrap_err();
        assert!(matches!(err, SourceError::Unsorted { position: 3, previous_position: 8, .. }));
    }

    #[test]
    fn contig_lookup_tolerates_chr_prefix() {
        let contigs = vec![Contig::new("chr1", b"A".to_vec()), Contig::new("2", b"C".to_vec())];
        assert_eq!(contig_index(&contigs, "1"), Some(0));
        assert_eq!(contig_index(&contigs, "chr2"), Some(1));
        assert_eq!(contig_index(&contigs, "3"), None);
    }

    #[test]
    fn positions_are_sorted_per_contig() {
        let mut positions = PositionSet::new(2);
        positions.insert(1, 9);
        positions.insert(1, 4);
        positions.insert(1, 9);
        positions.insert(5, 1);
        let positions = positions.finalize();
        assert_eq!(positions.contig(1), &[4, 9]);
        assert!(positions.contig(0).is_empty());
        assert!(positions.contig(7).is_empty());
    }
}
