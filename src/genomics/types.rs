//! Nucleotide codes, strands and CIGAR-style edit scripts.

/// Gap character used in gapped rows and profiles.
pub const GAP: u8 = b'-';

/// Number of nucleotide slots tracked per column (A, C, G, T, N).
pub const NUM_BASES: usize = 5;

/// IUPAC code indexed by `allele1 << 2 | allele2`.
const TO_IUPAC: &[u8; 16] = b"AMRWMCSYRSGKWYKT";

/// Map a nucleotide to its code: A=0, C=1, G=2, T=3, anything else N=4.
pub fn base_index(base: u8) -> usize {
    match base {
        b'A' | b'a' => 0,
        b'C' | b'c' => 1,
        b'G' | b'g' => 2,
        b'T' | b't' | b'U' | b'u' => 3,
        _ => 4,
    }
}

/// Inverse of [`base_index`].
pub fn index_base(idx: usize) -> u8 {
    match idx {
        0 => b'A',
        1 => b'C',
        2 => b'G',
        3 => b'T',
        _ => b'N',
    }
}

/// Watson-Crick complement; `N` and unknown symbols map to `N`.
pub fn complement(base: u8) -> u8 {
    match base {
        b'A' | b'a' => b'T',
        b'C' | b'c' => b'G',
        b'G' | b'g' => b'C',
        b'T' | b't' => b'A',
        GAP => GAP,
        _ => b'N',
    }
}

/// Reverse complement of a sequence.
pub fn reverse_complement(seq: &[u8]) -> Vec<u8> {
    seq.iter().rev().map(|&b| complement(b)).collect()
}

/// Upper-case a reference sequence and replace non-ACGT symbols by `N`.
pub fn normalize_sequence(seq: &[u8]) -> Vec<u8> {
    seq.iter().map(|&b| index_base(base_index(b))).collect()
}

/// Packed diploid genotype `allele1 << 2 | allele2`.
pub fn pack_genotype(allele1: usize, allele2: usize) -> u8 {
    (((allele1 & 3) << 2) | (allele2 & 3)) as u8
}

/// IUPAC ambiguity character of a packed genotype.
pub fn iupac(genotype: u8) -> char {
    TO_IUPAC[(genotype & 15) as usize] as char
}

/// Strand of an alignment relative to the reference.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Strand {
    /// Read maps to the forward strand.
    Forward,
    /// Read maps to the reverse complement strand.
    Reverse,
}

impl Strand {
    /// Whether this is the reverse strand.
    pub fn is_reverse(self) -> bool {
        matches!(self, Strand::Reverse)
    }
}

/// Simple CIGAR operation kinds describing how a read aligns to the reference.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CigarOpKind {
    /// Consuming match/mismatch.
    Match,
    /// Insertion relative to the reference.
    Insertion,
    /// Deletion relative to the reference.
    Deletion,
    /// Soft clipping (sequence present in read only).
    SoftClip,
    /// Hard clipping (trimmed sequence not present in read).
    HardClip,
}

impl CigarOpKind {
    /// Whether the operation consumes read bases.
    pub fn consumes_read(self) -> bool {
        matches!(
            self,
            CigarOpKind::Match | CigarOpKind::Insertion | CigarOpKind::SoftClip
        )
    }

    /// Whether the operation occupies reference columns of the alignment span.
    ///
    /// Soft clipped bases stay inside the span until they are clipped away.
    pub fn consumes_span(self) -> bool {
        matches!(
            self,
            CigarOpKind::Match | CigarOpKind::Deletion | CigarOpKind::SoftClip
        )
    }
}

/// CIGAR operation with length.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CigarOp {
    /// Operation kind.
    pub kind: CigarOpKind,
    /// Number of bases affected by the operation.
    pub len: u32,
}

impl CigarOp {
    /// Construct a new CIGAR operation.
    pub fn new(kind: CigarOpKind, len: u32) -> Self {
        Self { kind, len }
    }
}

/// Append an operation, extending the last one when the kinds agree.
pub fn push_op(ops: &mut Vec<CigarOp>, kind: CigarOpKind, len: u32) {
    if len == 0 {
        return;
    }
    match ops.last_mut() {
        Some(last) if last.kind == kind => last.len += len,
        _ => ops.push(CigarOp::new(kind, len)),
    }
}

/// Number of reference columns spanned by an edit script.
pub fn span_len(ops: &[CigarOp]) -> u32 {
    ops.iter()
        .filter(|op| op.kind.consumes_span())
        .map(|op| op.len)
        .sum()
}

/// Number of read bases described by an edit script.
pub fn read_len(ops: &[CigarOp]) -> u32 {
    ops.iter()
        .filter(|op| op.kind.consumes_read())
        .map(|op| op.len)
        .sum()
}

/// Whether an edit script contains an insertion or deletion.
pub fn has_indel(ops: &[CigarOp]) -> bool {
    ops.iter()
        .any(|op| matches!(op.kind, CigarOpKind::Insertion | CigarOpKind::Deletion))
}

/// Remove `n` read bases from the start of an edit script.
///
/// Returns the number of span columns removed alongside, i.e. the amount the
/// alignment begin moves right. Deletions adjacent to the cut are dropped.
pub fn trim_read_front(ops: &mut Vec<CigarOp>, n: u32) -> u32 {
    let mut reversed: Vec<CigarOp> = ops.iter().rev().copied().collect();
    let shift = trim_read_back(&mut reversed, n);
    *ops = reversed.into_iter().rev().collect();
    shift
}

/// Remove `n` read bases from the end of an edit script.
///
/// Returns the number of span columns removed alongside.
pub fn trim_read_back(ops: &mut Vec<CigarOp>, n: u32) -> u32 {
    let mut remaining = n;
    let mut shift = 0;
    while let Some(last) = ops.last_mut() {
        if remaining == 0 && last.kind != CigarOpKind::Deletion && last.kind != CigarOpKind::HardClip {
            break;
        }
        if !last.kind.consumes_read() {
            if last.kind.consumes_span() {
                shift += last.len;
            }
            ops.pop();
            continue;
        }
        let take = remaining.min(last.len);
        remaining -= take;
        if last.kind.consumes_span() {
            shift += take;
        }
        last.len -= take;
        if last.len == 0 {
            ops.pop();
        }
    }
    shift
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn iupac_covers_homozygous_and_heterozygous() {
        assert_eq!(iupac(pack_genotype(0, 0)), 'A');
        assert_eq!(iupac(pack_genotype(0, 2)), 'R');
        assert_eq!(iupac(pack_genotype(2, 0)), 'R');
        assert_eq!(iupac(pack_genotype(1, 3)), 'Y');
        assert_eq!(iupac(pack_genotype(3, 3)), 'T');
    }

    #[test]
    fn reverse_complement_roundtrip() {
        assert_eq!(reverse_complement(b"ACGTN"), b"NACGT".to_vec());
        assert_eq!(normalize_sequence(b"acgRt"), b"ACGNT".to_vec());
    }

    #[test]
    fn span_counts_soft_clips_and_deletions() {
        let ops = vec![
            CigarOp::new(CigarOpKind::SoftClip, 2),
            CigarOp::new(CigarOpKind::Match, 5),
            CigarOp::new(CigarOpKind::Deletion, 2),
            CigarOp::new(CigarOpKind::Insertion, 1),
            CigarOp::new(CigarOpKind::Match, 3),
        ];
        assert_eq!(span_len(&ops), 12);
        assert_eq!(read_len(&ops), 11);
        assert!(has_indel(&ops));
    }

    #[test]
    fn trimming_front_moves_begin() {
        let mut ops = vec![
            CigarOp::new(CigarOpKind::SoftClip, 2),
            CigarOp::new(CigarOpKind::Match, 5),
            CigarOp::new(CigarOpKind::Deletion, 1),
            CigarOp::new(CigarOpKind::Match, 3),
        ];
        let shift = trim_read_front(&mut ops, 7);
        assert_eq!(shift, 8);
        assert_eq!(ops, vec![CigarOp::new(CigarOpKind::Match, 3)]);
    }

    #[test]
    fn trimming_back_drops_trailing_insertion() {
        let mut ops = vec![
            CigarOp::new(CigarOpKind::Match, 5),
            CigarOp::new(CigarOpKind::Insertion, 2),
            CigarOp::new(CigarOpKind::Match, 1),
        ];
        let shift = trim_read_back(&mut ops, 3);
        assert_eq!(shift, 1);
        assert_eq!(ops, vec![CigarOp::new(CigarOpKind::Match, 5)]);
    }
}
