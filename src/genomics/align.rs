//! Affine-gap pairwise alignment (Gotoh) with optional diagonal band.
//!
//! Scores follow the convention that a gap of length `k` costs
//! `gap_open + (k - 1) * gap_extend`. The query (a read) is always aligned
//! end to end; target ends are either charged (global) or free
//! (semi-global), which places a read inside a longer reference infix.

use crate::genomics::types::{push_op, CigarOp, CigarOpKind};

const NEG: i32 = i32::MIN / 4;

/// Affine scoring scheme.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Scoring {
    /// Score of identical characters.
    pub match_score: i32,
    /// Score of differing characters.
    pub mismatch: i32,
    /// Score of the first column of a gap.
    pub gap_open: i32,
    /// Score of every further gap column.
    pub gap_extend: i32,
}

impl Scoring {
    /// Scheme used to place reads before realignment: one indel is cheaper
    /// than a handful of adjacent substitutions but gaps are never free.
    pub const REALIGN: Scoring = Scoring {
        match_score: 0,
        mismatch: -1,
        gap_open: -10,
        gap_extend: -2,
    };

    /// Scheme used to discover indels in reads without an edit script.
    pub const INDEL_DISCOVERY: Scoring = Scoring {
        match_score: 0,
        mismatch: -999,
        gap_open: -1000,
        gap_extend: -1001,
    };

    /// Unit edit distance.
    pub const EDIT: Scoring = Scoring {
        match_score: 0,
        mismatch: -1,
        gap_open: -1,
        gap_extend: -1,
    };

    fn substitution(&self, a: u8, b: u8) -> i32 {
        if a == b && a != b'N' {
            self.match_score
        } else {
            self.mismatch
        }
    }
}

/// Treatment of unaligned target ends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndGaps {
    /// Both sequences aligned end to end.
    Global,
    /// Leading and trailing target characters are skipped at no cost.
    FreeTarget,
}

/// Column of a pairwise alignment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EditOp {
    /// Query and target characters aligned (match or mismatch).
    Match,
    /// Query character aligned to a gap (insertion in the query).
    Insertion,
    /// Target character aligned to a gap (deletion in the query).
    Deletion,
}

/// Result of a pairwise alignment.
#[derive(Debug, Clone, PartialEq)]
pub struct PairwiseAlignment {
    /// First target offset covered by the alignment.
    pub target_begin: usize,
    /// Target offset one past the last covered character.
    pub target_end: usize,
    /// Alignment columns from left to right.
    pub ops: Vec<EditOp>,
    /// Alignment score.
    pub score: i32,
}

/// Indel event extracted from an alignment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndelEvent {
    /// Target offset of the first deleted base, or of the base following an insertion.
    pub target_pos: usize,
    /// Positive for deletions, negative for insertions.
    pub length: i32,
    /// Query offset where the event starts.
    pub query_pos: usize,
}

impl PairwiseAlignment {
    /// Build from an edit script containing only match, insertion and deletion
    /// operations. Clipping operations are skipped.
    pub fn from_cigar(cigar: &[CigarOp], target_begin: usize) -> Self {
        let mut ops = Vec::new();
        for op in cigar {
            let edit = match op.kind {
                CigarOpKind::Match => EditOp::Match,
                CigarOpKind::Insertion => EditOp::Insertion,
                CigarOpKind::Deletion => EditOp::Deletion,
                CigarOpKind::SoftClip | CigarOpKind::HardClip => continue,
            };
            ops.extend(std::iter::repeat(edit).take(op.len as usize));
        }
        let span = ops.iter().filter(|op| **op != EditOp::Insertion).count();
        Self {
            target_begin,
            target_end: target_begin + span,
            ops,
            score: 0,
        }
    }

    /// Ungapped alignment of `len` characters.
    pub fn ungapped(target_begin: usize, len: usize) -> Self {
        Self {
            target_begin,
            target_end: target_begin + len,
            ops: vec![EditOp::Match; len],
            score: 0,
        }
    }

    /// Compressed edit script of the alignment.
    pub fn to_cigar(&self) -> Vec<CigarOp> {
        let mut cigar = Vec::new();
        for op in &self.ops {
            let kind = match op {
                EditOp::Match => CigarOpKind::Match,
                EditOp::Insertion => CigarOpKind::Insertion,
                EditOp::Deletion => CigarOpKind::Deletion,
            };
            push_op(&mut cigar, kind, 1);
        }
        cigar
    }

    /// Query offset aligned to every target offset in `target_begin..target_end`,
    /// `None` where the query has a gap.
    pub fn query_positions(&self) -> Vec<Option<usize>> {
        let mut positions = Vec::with_capacity(self.target_end - self.target_begin);
        let mut q = 0;
        for op in &self.ops {
            match op {
                EditOp::Match => {
                    positions.push(Some(q));
                    q += 1;
                }
                EditOp::Insertion => q += 1,
                EditOp::Deletion => positions.push(None),
            }
        }
        positions
    }

    /// Insertions and deletions with target coordinates.
    pub fn indels(&self) -> Vec<IndelEvent> {
        let mut events = Vec::new();
        let mut t = self.target_begin;
        let mut q = 0;
        let mut i = 0;
        while i < self.ops.len() {
            let op = self.ops[i];
            let run = self.ops[i..].iter().take_while(|&&o| o == op).count();
            match op {
                EditOp::Match => {
                    t += run;
                    q += run;
                }
                EditOp::Insertion => {
                    events.push(IndelEvent {
                        target_pos: t,
                        length: -(run as i32),
                        query_pos: q,
                    });
                    q += run;
                }
                EditOp::Deletion => {
                    events.push(IndelEvent {
                        target_pos: t,
                        length: run as i32,
                        query_pos: q,
                    });
                    t += run;
                }
            }
            i += run;
        }
        events
    }

    /// Number of mismatches plus gap columns against the target.
    pub fn edit_distance(&self, query: &[u8], target: &[u8]) -> u32 {
        let mut q = 0;
        let mut t = self.target_begin;
        let mut errors = 0;
        for op in &self.ops {
            match op {
                EditOp::Match => {
                    if query[q] != target[t] || query[q] == b'N' {
                        errors += 1;
                    }
                    q += 1;
                    t += 1;
                }
                EditOp::Insertion => {
                    errors += 1;
                    q += 1;
                }
                EditOp::Deletion => {
                    errors += 1;
                    t += 1;
                }
            }
        }
        errors
    }
}

/// Align `query` against `target` under `scoring`.
pub fn align(
    query: &[u8],
    target: &[u8],
    scoring: Scoring,
    ends: EndGaps,
    band: Option<usize>,
) -> PairwiseAlignment {
    align_with(
        query.len(),
        target.len(),
        |i, j| scoring.substitution(query[i], target[j]),
        scoring.gap_open,
        scoring.gap_extend,
        ends,
        band,
    )
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum State {
    Diag,
    Ins,
    Del,
}

/// Banded score and traceback storage; row `i` holds columns `lo[i]..=hi[i]`.
struct Matrix {
    lo: Vec<usize>,
    hi: Vec<usize>,
    offset: Vec<usize>,
    scores: Vec<[i32; 3]>,
    trace: Vec<[State; 3]>,
}

impl Matrix {
    fn new(qlen: usize, tlen: usize, band: Option<usize>) -> Self {
        let mut lo = Vec::with_capacity(qlen + 1);
        let mut hi = Vec::with_capacity(qlen + 1);
        let mut offset = Vec::with_capacity(qlen + 1);
        let mut total = 0;
        for i in 0..=qlen {
            let (l, h) = match band {
                Some(band) => {
                    let below = band + qlen.saturating_sub(tlen);
                    let above = band + tlen.saturating_sub(qlen);
                    (i.saturating_sub(below), (i + above).min(tlen))
                }
                None => (0, tlen),
            };
            lo.push(l);
            hi.push(h);
            offset.push(total);
            total += h + 1 - l;
        }
        Self {
            lo,
            hi,
            offset,
            scores: vec![[NEG; 3]; total],
            trace: vec![[State::Diag; 3]; total],
        }
    }

    fn index(&self, i: usize, j: usize) -> Option<usize> {
        (j >= self.lo[i] && j <= self.hi[i]).then(|| self.offset[i] + j - self.lo[i])
    }

    fn get(&self, i: usize, j: usize) -> [i32; 3] {
        match self.index(i, j) {
            Some(idx) => self.scores[idx],
            None => [NEG; 3],
        }
    }
}

fn best_of(cells: [i32; 3]) -> (i32, State) {
    let mut best = (cells[0], State::Diag);
    if cells[1] > best.0 {
        best = (cells[1], State::Ins);
    }
    if cells[2] > best.0 {
        best = (cells[2], State::Del);
    }
    best
}

fn pick(candidates: [(i32, State); 3]) -> (i32, State) {
    let mut best = candidates[0];
    for &candidate in &candidates[1..] {
        if candidate.0 > best.0 {
            best = candidate;
        }
    }
    best
}

/// Generic affine alignment with a caller supplied substitution score.
///
/// `substitution(i, j)` scores query character `i` against target character
/// `j`. The band, when given, is widened by the length difference of the two
/// sequences so the end cell is always reachable.
pub fn align_with<F>(
    qlen: usize,
    tlen: usize,
    substitution: F,
    gap_open: i32,
    gap_extend: i32,
    ends: EndGaps,
    band: Option<usize>,
) -> PairwiseAlignment
where
    F: Fn(usize, usize) -> i32,
{
    let band = match ends {
        EndGaps::Global => band,
        EndGaps::FreeTarget => None,
    };
    let mut m = Matrix::new(qlen, tlen, band);
    let diag = State::Diag as usize;
    let ins = State::Ins as usize;
    let del = State::Del as usize;

    for i in 0..=qlen {
        for j in m.lo[i]..=m.hi[i] {
            let mut cell = [NEG; 3];
            let mut trace = [State::Diag; 3];
            if i == 0 {
                match ends {
                    EndGaps::FreeTarget => cell[diag] = 0,
                    EndGaps::Global if j == 0 => cell[diag] = 0,
                    EndGaps::Global => {
                        cell[del] = gap_open + (j as i32 - 1) * gap_extend;
                        trace[del] = State::Del;
                    }
                }
            } else {
                if j > 0 {
                    let prev = m.get(i - 1, j - 1);
                    let (score, state) = best_of(prev);
                    if score > NEG {
                        cell[diag] = score + substitution(i - 1, j - 1);
                        trace[diag] = state;
                    }
                }
                let up = m.get(i - 1, j);
                let (score, state) = pick([
                    (up[diag] + gap_open, State::Diag),
                    (up[ins] + gap_extend, State::Ins),
                    (up[del] + gap_open, State::Del),
                ]);
                if score > NEG {
                    cell[ins] = score;
                    trace[ins] = state;
                }
                if j > 0 {
                    let left = m.get(i, j - 1);
                    let (score, state) = pick([
                        (left[diag] + gap_open, State::Diag),
                        (left[ins] + gap_open, State::Ins),
                        (left[del] + gap_extend, State::Del),
                    ]);
                    if score > NEG {
                        cell[del] = score;
                        trace[del] = state;
                    }
                }
            }
            if let Some(idx) = m.index(i, j) {
                m.scores[idx] = cell;
                m.trace[idx] = trace;
            }
        }
    }

    // choose the end cell
    let (mut j, mut state, score) = match ends {
        EndGaps::Global => {
            let (score, state) = best_of(m.get(qlen, tlen));
            (tlen, state, score)
        }
        EndGaps::FreeTarget => {
            let mut best = (0, State::Diag, NEG);
            for j in m.lo[qlen]..=m.hi[qlen] {
                let (score, state) = best_of(m.get(qlen, j));
                if score > best.2 {
                    best = (j, state, score);
                }
            }
            best
        }
    };
    let target_end = j;

    let mut i = qlen;
    let mut ops = Vec::with_capacity(qlen + tlen);
    while i > 0 || (j > 0 && ends == EndGaps::Global) {
        let Some(idx) = m.index(i, j) else { break };
        let prev = m.trace[idx][state as usize];
        match state {
            State::Diag => {
                if i == 0 {
                    break;
                }
                ops.push(EditOp::Match);
                i -= 1;
                j -= 1;
            }
            State::Ins => {
                ops.push(EditOp::Insertion);
                i -= 1;
            }
            State::Del => {
                ops.push(EditOp::Deletion);
                j -= 1;
            }
        }
        state = prev;
    }
    ops.reverse();

    PairwiseAlignment {
        target_begin: j,
        target_end,
        ops,
        score,
    }
}
