//! Local realignment of overlapping reads into one multiple alignment.
//!
//! Independent pairwise alignments disagree on where a gap goes inside a
//! repeat, which scatters the evidence of one indel over neighbouring
//! positions. [`MultipleAlignment::realign`] builds a single gapped view of a
//! read group in three stages:
//!
//! 1. every read is placed against the reference slice (edit script, gapped
//!    semi-global alignment, or ungapped placement) and the placements are
//!    merged into columns with room for the longest insertion at each site;
//! 2. each read is realigned in a narrow band against the profile of all
//!    other rows, and only moves when that lowers its cost;
//! 3. the reference row is re-anchored against the diploid read consensus so
//!    that reference bases follow the columns the reads agree on.
//!
//! Rows keep read offsets rather than copies of the bases, so the ungapped
//! content of every row is the read itself.

use std::sync::Arc;

use bitvec::prelude::*;
use tracing::{debug, trace};

use crate::genomics::align::{align, align_with, EditOp, EndGaps, PairwiseAlignment, Scoring};
use crate::genomics::store::{Alignment, WindowStore};
use crate::genomics::types::{base_index, index_base, read_len, CigarOpKind, GAP};

/// Reference context added on both sides when placing reads without a script.
const PLACEMENT_FLANK: usize = 10;
const FIRST_PASS_BAND: usize = 10;
const REFINE_BAND: usize = 5;
const MAX_ROUNDS: usize = 3;

const REANCHOR_BAND: usize = 30;
const REANCHOR_MARGIN: usize = 20;
const REANCHOR_MISMATCH: i32 = -4;
const REANCHOR_DISPLACED: i32 = -1;
const REANCHOR_GAP_OPEN: i32 = -4;
const REANCHOR_GAP_EXTEND: i32 = -2;

const NEW_COLUMN_COST: f64 = 1.0;
const EPSILON: f64 = 1e-9;

const SYMBOLS: usize = 6;
const GAP_SYMBOL: usize = 5;

fn symbol_index(symbol: u8) -> usize {
    if symbol == GAP {
        GAP_SYMBOL
    } else {
        base_index(symbol)
    }
}

/// Content of a row at one column.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RowCell {
    /// Read base at this offset (reference orientation).
    Base(usize),
    /// The read has a gap here.
    Gap,
}

/// One read placed in the columns of a [`MultipleAlignment`].
///
/// A row starts and ends with a base; gaps only occur between them.
#[derive(Debug, Clone, PartialEq)]
pub struct AlignedRow {
    /// Index of the alignment in the originating [`WindowStore`].
    pub alignment: usize,
    begin: usize,
    cells: Vec<RowCell>,
    sequence: Arc<[u8]>,
}

impl AlignedRow {
    fn from_columns(alignment: usize, sequence: Arc<[u8]>, columns: &[usize]) -> Self {
        let begin = columns.first().copied().unwrap_or(0);
        let end = columns.last().map_or(begin, |&c| c + 1);
        let mut cells = vec![RowCell::Gap; end - begin];
        for (offset, &column) in columns.iter().enumerate() {
            cells[column - begin] = RowCell::Base(offset);
        }
        Self {
            alignment,
            begin,
            cells,
            sequence,
        }
    }

    /// First column of the row.
    pub fn begin(&self) -> usize {
        self.begin
    }

    /// Column one past the last base.
    pub fn end(&self) -> usize {
        self.begin + self.cells.len()
    }

    /// Whether the row spans `column`.
    pub fn covers(&self, column: usize) -> bool {
        self.begin <= column && column < self.end()
    }

    /// Cell at `column`, `None` outside the row.
    pub fn cell(&self, column: usize) -> Option<RowCell> {
        column
            .checked_sub(self.begin)
            .and_then(|i| self.cells.get(i).copied())
    }

    /// Number of read bases placed left of `column`.
    pub fn bases_before(&self, column: usize) -> usize {
        let upto = column.saturating_sub(self.begin).min(self.cells.len());
        self.cells[..upto]
            .iter()
            .rev()
            .find_map(|cell| match cell {
                RowCell::Base(offset) => Some(offset + 1),
                RowCell::Gap => None,
            })
            .unwrap_or(0)
    }

    /// Base or [`GAP`] at every column of the row.
    pub fn symbols(&self) -> impl Iterator<Item = (usize, u8)> + '_ {
        self.cells.iter().enumerate().map(move |(i, cell)| {
            let symbol = match cell {
                RowCell::Base(offset) => self.sequence[*offset],
                RowCell::Gap => GAP,
            };
            (self.begin + i, symbol)
        })
    }

    /// Row content with gaps removed.
    pub fn ungapped(&self) -> Vec<u8> {
        self.symbols()
            .filter_map(|(_, s)| (s != GAP).then_some(s))
            .collect()
    }
}

/// Placement of one read base while a row is rebuilt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Placement {
    /// Existing column.
    Column(usize),
    /// New column inserted before the given existing column.
    Before(usize),
}

/// Per-column symbol counts of the rows currently in the alignment.
#[derive(Debug)]
struct Profile {
    counts: Vec<[u32; SYMBOLS]>,
}

impl Profile {
    fn new(msa: &MultipleAlignment, with_reference: bool) -> Self {
        let mut profile = Self {
            counts: vec![[0; SYMBOLS]; msa.columns()],
        };
        if with_reference {
            for (column, &symbol) in msa.reference.iter().enumerate() {
                profile.counts[column][symbol_index(symbol)] += 1;
            }
        }
        for row in &msa.rows {
            profile.add(row);
        }
        profile
    }

    fn add(&mut self, row: &AlignedRow) {
        for (column, symbol) in row.symbols() {
            self.counts[column][symbol_index(symbol)] += 1;
        }
    }

    fn remove(&mut self, row: &AlignedRow) {
        for (column, symbol) in row.symbols() {
            let count = &mut self.counts[column][symbol_index(symbol)];
            *count = count.saturating_sub(1);
        }
    }

    fn insert(&mut self, at: usize, count: usize, gaps: u32) {
        let mut column = [0; SYMBOLS];
        column[GAP_SYMBOL] = gaps;
        self.counts
            .splice(at..at, std::iter::repeat(column).take(count));
    }

    /// One minus the frequency of `symbol` at `column`.
    fn cost(&self, column: usize, symbol: usize) -> f64 {
        let counts = &self.counts[column];
        let total: u32 = counts.iter().sum();
        if total == 0 {
            1.0
        } else {
            1.0 - counts[symbol] as f64 / total as f64
        }
    }
}

/// Read bases and reference in a shared gapped coordinate space.
#[derive(Debug, Clone, PartialEq)]
pub struct MultipleAlignment {
    reference: Vec<u8>,
    rows: Vec<AlignedRow>,
    seq_positions: Vec<usize>,
}

impl MultipleAlignment {
    /// Realign every alignment of `store` against its reference slice.
    pub fn realign(store: &WindowStore) -> Self {
        let mut msa = Self::from_pairwise(store);
        let mut rounds = 0;
        for round in 0..MAX_ROUNDS {
            let (band, with_reference) = if round == 0 {
                (FIRST_PASS_BAND, false)
            } else {
                (REFINE_BAND, true)
            };
            let moved = msa.refine(band, with_reference);
            let removed = msa.remove_empty_columns();
            rounds += 1;
            trace!(round, moved, removed, columns = msa.columns(), "profile refinement");
            if moved == 0 && round > 0 {
                break;
            }
        }
        msa.reanchor_reference();
        msa.remove_empty_columns();
        msa.finalize();
        debug!(
            contig = %store.window().name,
            start = store.window().start,
            rows = msa.rows.len(),
            columns = msa.columns(),
            rounds,
            "realigned group"
        );
        msa
    }

    /// Merge the initial pairwise placements of every alignment without any
    /// refinement.
    pub fn from_pairwise(store: &WindowStore) -> Self {
        let reference = store.reference();
        let len = reference.len();
        let pairwise: Vec<PairwiseAlignment> = store
            .alignments()
            .iter()
            .map(|alignment| initial_placement(store, alignment))
            .collect();

        // longest insertion in front of every reference position
        let mut slots = vec![0usize; len + 1];
        for placement in &pairwise {
            for event in placement.indels() {
                if event.length < 0 {
                    let slot = &mut slots[event.target_pos.min(len)];
                    *slot = (*slot).max(event.length.unsigned_abs() as usize);
                }
            }
        }

        let mut slot_start = Vec::with_capacity(len + 1);
        let mut reference_column = Vec::with_capacity(len);
        let mut columns = 0;
        for (pos, &slot) in slots.iter().enumerate() {
            slot_start.push(columns);
            columns += slot;
            if pos < len {
                reference_column.push(columns);
                columns += 1;
            }
        }
        let mut gapped = vec![GAP; columns];
        for (pos, &column) in reference_column.iter().enumerate() {
            gapped[column] = reference[pos];
        }

        let rows = store
            .alignments()
            .iter()
            .zip(&pairwise)
            .enumerate()
            .map(|(idx, (alignment, placement))| {
                let read = store.read(alignment.read);
                let mut placed = Vec::with_capacity(read.len());
                let mut target = placement.target_begin;
                let mut used = 0;
                for op in &placement.ops {
                    match op {
                        EditOp::Match => {
                            placed.push(reference_column[target]);
                            target += 1;
                            used = 0;
                        }
                        EditOp::Deletion => {
                            target += 1;
                            used = 0;
                        }
                        EditOp::Insertion => {
                            placed.push(slot_start[target] + used);
                            used += 1;
                        }
                    }
                }
                AlignedRow::from_columns(idx, Arc::clone(&read.sequence), &placed)
            })
            .collect();

        let mut msa = Self {
            reference: gapped,
            rows,
            seq_positions: Vec::new(),
        };
        msa.finalize();
        msa
    }

    /// Number of columns.
    pub fn columns(&self) -> usize {
        self.reference.len()
    }

    /// Gapped reference row.
    pub fn reference_row(&self) -> &[u8] {
        &self.reference
    }

    /// Reference bases in order.
    pub fn ungapped_reference(&self) -> Vec<u8> {
        self.reference.iter().copied().filter(|&b| b != GAP).collect()
    }

    /// Whether the reference has a gap at `column`.
    pub fn is_reference_gap(&self, column: usize) -> bool {
        self.reference.get(column).map_or(true, |&b| b == GAP)
    }

    /// Reference offset of `column`; for a reference gap this is the offset of
    /// the next reference base.
    pub fn position_gap_to_seq(&self, column: usize) -> usize {
        self.seq_positions[column.min(self.columns())]
    }

    /// Rows ordered by first column.
    pub fn rows(&self) -> &[AlignedRow] {
        &self.rows
    }

    fn finalize(&mut self) {
        self.rows.sort_by_key(|row| (row.begin, row.alignment));
        self.seq_positions = Vec::with_capacity(self.columns() + 1);
        let mut pos = 0;
        for &symbol in &self.reference {
            self.seq_positions.push(pos);
            if symbol != GAP {
                pos += 1;
            }
        }
        self.seq_positions.push(pos);
    }

    /// Insert `count` gap columns before column `at`, skipping one row that is
    /// about to be rebuilt. Returns the number of rows spanning the insertion.
    fn insert_columns(&mut self, at: usize, count: usize, skip: Option<usize>) -> u32 {
        self.reference
            .splice(at..at, std::iter::repeat(GAP).take(count));
        let mut spanning = 0;
        for (idx, row) in self.rows.iter_mut().enumerate() {
            if Some(idx) == skip {
                continue;
            }
            if row.begin >= at {
                row.begin += count;
            } else if row.end() > at {
                let offset = at - row.begin;
                row.cells
                    .splice(offset..offset, std::iter::repeat(RowCell::Gap).take(count));
                spanning += 1;
            }
        }
        spanning
    }

    /// Drop columns without a reference or read base.
    fn remove_empty_columns(&mut self) -> usize {
        let mut occupied = bitvec![0; self.columns()];
        for (column, &symbol) in self.reference.iter().enumerate() {
            if symbol != GAP {
                occupied.set(column, true);
            }
        }
        for row in &self.rows {
            for (column, symbol) in row.symbols() {
                if symbol != GAP {
                    occupied.set(column, true);
                }
            }
        }
        let empty = occupied.count_zeros();
        if empty == 0 {
            return 0;
        }

        let mut remap = Vec::with_capacity(occupied.len());
        let mut next = 0;
        for kept in occupied.iter().by_vals() {
            remap.push(next);
            if kept {
                next += 1;
            }
        }
        let mut flags = occupied.iter().by_vals();
        self.reference.retain(|_| flags.next().unwrap_or(true));
        for row in &mut self.rows {
            let begin = row.begin;
            let mut flags = occupied[begin..row.end()].iter().by_vals();
            row.cells.retain(|_| flags.next().unwrap_or(true));
            row.begin = remap[begin];
        }
        empty
    }

    /// One pass of profile realignment over all rows. Returns how many rows
    /// moved.
    fn refine(&mut self, band: usize, with_reference: bool) -> usize {
        let mut profile = Profile::new(self, with_reference);
        let mut moved = 0;
        for r in 0..self.rows.len() {
            profile.remove(&self.rows[r]);
            let row = &self.rows[r];
            let lo = row.begin.saturating_sub(band);
            let hi = (row.end() + band).min(self.columns());
            let current: f64 = row
                .symbols()
                .map(|(column, symbol)| profile.cost(column, symbol_index(symbol)))
                .sum();
            let sequence = Arc::clone(&row.sequence);
            let (placements, cost) = align_to_profile(&profile, &sequence, lo, hi);
            if cost + EPSILON < current {
                let inserts = group_inserts(&placements);
                for &(at, count) in inserts.iter().rev() {
                    let spanning = self.insert_columns(at, count, Some(r));
                    profile.insert(at, count, spanning + u32::from(with_reference));
                }
                let columns = resolve_columns(&placements, &inserts);
                let alignment = self.rows[r].alignment;
                self.rows[r] = AlignedRow::from_columns(alignment, sequence, &columns);
                moved += 1;
            }
            profile.add(&self.rows[r]);
        }
        moved
    }

    fn diploid_consensus(&self) -> Vec<Option<Alleles>> {
        let mut counts = vec![[0u32; SYMBOLS]; self.columns()];
        for row in &self.rows {
            for (column, symbol) in row.symbols() {
                counts[column][symbol_index(symbol)] += 1;
            }
        }
        counts
            .iter()
            .zip(&self.reference)
            .map(|(column, &reference)| column_alleles(column, reference))
            .collect()
    }

    /// Move reference bases onto the columns supported by the read consensus.
    fn reanchor_reference(&mut self) {
        let consensus = self.diploid_consensus();
        let columns = self.columns();
        let mut unstable = bitvec![0; columns];
        for (column, alleles) in consensus.iter().enumerate() {
            let symbol = self.reference[column];
            let stable = match alleles {
                Some(alleles) => symbol != GAP && alleles.contains(&Some(symbol)),
                None => symbol == GAP,
            };
            if !stable {
                unstable.set(column, true);
            }
        }

        let mut regions: Vec<(usize, usize)> = Vec::new();
        for column in unstable.iter_ones() {
            let lo = column.saturating_sub(REANCHOR_MARGIN);
            let hi = (column + REANCHOR_MARGIN + 1).min(columns);
            match regions.last_mut() {
                Some(last) if lo <= last.1 => last.1 = last.1.max(hi),
                _ => regions.push((lo, hi)),
            }
        }
        trace!(regions = regions.len(), "re-anchoring reference");
        // right to left, so inserted columns never shift a pending region
        for &(lo, hi) in regions.iter().rev() {
            self.reanchor_region(lo, hi, &consensus[lo..hi]);
        }
    }

    fn reanchor_region(&mut self, lo: usize, hi: usize, consensus: &[Option<Alleles>]) {
        let home: Vec<usize> = (lo..hi).filter(|&c| self.reference[c] != GAP).collect();
        let kept: Vec<usize> = (lo..hi).filter(|&c| consensus[c - lo].is_some()).collect();
        if home.is_empty() || kept.is_empty() {
            return;
        }
        let bases: Vec<u8> = home.iter().map(|&c| self.reference[c]).collect();

        let anchored = align_with(
            bases.len(),
            kept.len(),
            |i, j| {
                let column = kept[j];
                let allowed = consensus[column - lo].map_or(false, |a| a.contains(&Some(bases[i])));
                let mut score = if allowed { 0 } else { REANCHOR_MISMATCH };
                if column != home[i] {
                    score += REANCHOR_DISPLACED;
                }
                score
            },
            REANCHOR_GAP_OPEN,
            REANCHOR_GAP_EXTEND,
            EndGaps::Global,
            Some(REANCHOR_BAND),
        );

        let mut placements = Vec::with_capacity(bases.len());
        let mut j = 0;
        let mut last: Option<usize> = None;
        for op in &anchored.ops {
            match op {
                EditOp::Match => {
                    placements.push(Placement::Column(kept[j]));
                    last = Some(kept[j]);
                    j += 1;
                }
                EditOp::Deletion => {
                    last = Some(kept[j]);
                    j += 1;
                }
                EditOp::Insertion => {
                    // unkept columns up to the next kept one are free
                    let bound = kept.get(j).copied().unwrap_or(hi);
                    let free = last.map_or(lo, |c| c + 1);
                    if free < bound {
                        placements.push(Placement::Column(free));
                        last = Some(free);
                    } else {
                        placements.push(Placement::Before(bound));
                    }
                }
            }
        }
        if placements.len() != bases.len() {
            return;
        }

        let inserts = group_inserts(&placements);
        self.reference[lo..hi].fill(GAP);
        for &(at, count) in inserts.iter().rev() {
            self.insert_columns(at, count, None);
        }
        for (column, base) in resolve_columns(&placements, &inserts).into_iter().zip(bases) {
            self.reference[column] = base;
        }
    }
}

/// The one or two read alleles of a consensus column.
type Alleles = [Option<u8>; 2];

/// Leading two bases of a column, or `None` when gaps dominate.
fn column_alleles(column: &[u32; SYMBOLS], reference: u8) -> Option<Alleles> {
    let mut first: Option<usize> = None;
    let mut second: Option<usize> = None;
    for k in 0..4 {
        if column[k] == 0 {
            continue;
        }
        match first {
            Some(f) if column[k] <= column[f] => {
                if second.map_or(true, |s| column[k] > column[s]) {
                    second = Some(k);
                }
            }
            _ => {
                second = first;
                first = Some(k);
            }
        }
    }
    let gaps = column[GAP_SYMBOL];
    match first {
        Some(f) if gaps <= column[f] => Some([Some(index_base(f)), second.map(index_base)]),
        Some(_) => None,
        None if gaps == 0 && reference != GAP => Some([Some(reference), None]),
        None => None,
    }
}

/// Initial placement of an alignment in reference slice coordinates.
fn initial_placement(store: &WindowStore, alignment: &Alignment) -> PairwiseAlignment {
    let read = store.read(alignment.read);
    let reference = store.reference();
    let usable_script = !alignment.cigar.is_empty()
        && alignment.cigar.iter().all(|op| op.kind != CigarOpKind::SoftClip)
        && read_len(&alignment.cigar) as usize == read.len();
    if usable_script {
        let placement = PairwiseAlignment::from_cigar(&alignment.cigar, alignment.begin);
        if placement.target_end <= reference.len() {
            return placement;
        }
    }
    if alignment.quality.has_indel
        || !alignment.cigar.is_empty()
        || alignment.end - alignment.begin != read.len()
    {
        let lo = alignment.begin.saturating_sub(PLACEMENT_FLANK);
        let hi = (alignment.end + PLACEMENT_FLANK).min(reference.len());
        let mut placement = align(
            &read.sequence,
            &reference[lo..hi],
            Scoring::REALIGN,
            EndGaps::FreeTarget,
            None,
        );
        placement.target_begin += lo;
        placement.target_end += lo;
        return placement;
    }
    PairwiseAlignment::ungapped(alignment.begin, read.len())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Step {
    Diagonal,
    Skip,
    New,
}

/// Linear-cost alignment of `query` against profile columns `lo..hi`.
///
/// Skipping profile columns before the first and after the last read base is
/// free, so the read may settle anywhere inside the band.
fn align_to_profile(profile: &Profile, query: &[u8], lo: usize, hi: usize) -> (Vec<Placement>, f64) {
    let n = query.len();
    let m = hi - lo;
    let width = m + 1;
    let mut cost = vec![0.0f64; (n + 1) * width];
    let mut trace = vec![Step::Skip; (n + 1) * width];

    for i in 1..=n {
        cost[i * width] = cost[(i - 1) * width] + NEW_COLUMN_COST;
        trace[i * width] = Step::New;
        let symbol = base_index(query[i - 1]);
        for j in 1..=m {
            let column = lo + j - 1;
            let diagonal = cost[(i - 1) * width + j - 1] + profile.cost(column, symbol);
            let skip = cost[i * width + j - 1]
                + if i == n {
                    0.0
                } else {
                    profile.cost(column, GAP_SYMBOL)
                };
            let new = cost[(i - 1) * width + j] + NEW_COLUMN_COST;
            let (best, step) = if diagonal <= skip && diagonal <= new {
                (diagonal, Step::Diagonal)
            } else if skip <= new {
                (skip, Step::Skip)
            } else {
                (new, Step::New)
            };
            cost[i * width + j] = best;
            trace[i * width + j] = step;
        }
    }

    let mut placements = vec![Placement::Before(lo); n];
    let (mut i, mut j) = (n, m);
    while i > 0 {
        match trace[i * width + j] {
            Step::Diagonal => {
                placements[i - 1] = Placement::Column(lo + j - 1);
                i -= 1;
                j -= 1;
            }
            Step::Skip => j -= 1,
            Step::New => {
                placements[i - 1] = Placement::Before(lo + j);
                i -= 1;
            }
        }
    }
    (placements, cost[n * width + m])
}

/// Runs of new columns as `(before column, count)`, left to right.
fn group_inserts(placements: &[Placement]) -> Vec<(usize, usize)> {
    let mut inserts: Vec<(usize, usize)> = Vec::new();
    for placement in placements {
        if let Placement::Before(at) = *placement {
            match inserts.last_mut() {
                Some(last) if last.0 == at => last.1 += 1,
                _ => inserts.push((at, 1)),
            }
        }
    }
    inserts
}

/// Final column of every placement once `inserts` have been applied.
fn resolve_columns(placements: &[Placement], inserts: &[(usize, usize)]) -> Vec<usize> {
    let shift = |column: usize, inclusive: bool| -> usize {
        inserts
            .iter()
            .filter(|&&(at, _)| at < column || (inclusive && at == column))
            .map(|&(_, count)| count)
            .sum()
    };
    let mut columns = Vec::with_capacity(placements.len());
    let mut previous = None;
    let mut run = 0;
    for &placement in placements {
        match placement {
            Placement::Column(column) => columns.push(column + shift(column, true)),
            Placement::Before(at) => {
                if previous == Some(at) {
                    run += 1;
                } else {
                    previous = Some(at);
                    run = 0;
                }
                columns.push(at + shift(at, false) + run);
            }
        }
    }
    columns
}
