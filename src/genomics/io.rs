//! File inputs: BAM/SAM alignments, FASTA reference and position lists.

use std::fmt;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;

use needletail::parse_fastx_file;
use rust_htslib::bam::{self, record::Aux, record::Cigar, Read as _};
use tracing::{debug, info, warn};

use crate::config::CallerConfig;
use crate::genomics::source::{contig_index, AlignmentSource, Contig, PositionSet, SortGuard, SourceError};
use crate::genomics::store::{AlignmentRecord, Read, ReadClip};
use crate::genomics::types::{has_indel, normalize_sequence, push_op, span_len, CigarOpKind, Strand};

/// Load every record of a FASTA file, normalising bases to `ACGTN`.
pub fn load_reference(path: impl AsRef<Path>) -> Result<Vec<Contig>, SourceError> {
    let path = path.as_ref();
    let reference_error = |message: String| SourceError::Reference {
        path: path.display().to_string(),
        message,
    };
    let mut reader = parse_fastx_file(path).map_err(|e| reference_error(e.to_string()))?;
    let mut contigs = Vec::new();
    while let Some(record) = reader.next() {
        let record = record.map_err(|e| reference_error(e.to_string()))?;
        let id = String::from_utf8_lossy(record.id());
        let name = id.split_whitespace().next().unwrap_or_default().to_string();
        contigs.push(Contig::new(name, normalize_sequence(&record.seq())));
    }
    info!(path = %path.display(), contigs = contigs.len(), "reference loaded");
    Ok(contigs)
}

/// Parse `<chrom>\t<1-based position>` lines into 0-based positions.
///
/// Blank lines and `#` comments are ignored, unknown contigs are skipped
/// with a warning.
pub fn read_positions<R: BufRead>(reader: R, contigs: &[Contig]) -> Result<PositionSet, SourceError> {
    let mut positions = PositionSet::new(contigs.len());
    for (number, line) in reader.lines().enumerate() {
        let line = line?;
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let malformed = |message: &str| SourceError::Positions {
            line: number + 1,
            message: message.to_string(),
        };
        let mut fields = line.split_whitespace();
        let (Some(chrom), Some(position)) = (fields.next(), fields.next()) else {
            return Err(malformed("expected <chrom> <position>"));
        };
        let position: u32 = position.parse().map_err(|_| malformed("position is not a number"))?;
        if position == 0 {
            return Err(malformed("positions are 1-based"));
        }
        match contig_index(contigs, chrom) {
            Some(contig) => positions.insert(contig, position - 1),
            None => warn!(chrom, line = number + 1, "position on unknown contig skipped"),
        }
    }
    Ok(positions.finalize())
}

/// Load a positions file, see [`read_positions`].
pub fn load_positions(path: impl AsRef<Path>, contigs: &[Contig]) -> Result<PositionSet, SourceError> {
    read_positions(BufReader::new(File::open(path)?), contigs)
}

/// Parse an `XC:Z` clip value `<left><separator><right>`.
fn parse_clip_tag(value: &str) -> Option<ReadClip> {
    let split = value.find(|c: char| !c.is_ascii_digit()).unwrap_or(value.len());
    let left = value[..split].parse().ok()?;
    let right = match value.get(split + 1..) {
        Some(rest) if !rest.is_empty() => rest.parse().ok()?,
        _ => 0,
    };
    Some(ReadClip::new(left, right))
}

fn aux_integer(aux: Aux<'_>) -> Option<i64> {
    match aux {
        Aux::I8(v) => Some(v as i64),
        Aux::U8(v) => Some(v as i64),
        Aux::I16(v) => Some(v as i64),
        Aux::U16(v) => Some(v as i64),
        Aux::I32(v) => Some(v as i64),
        Aux::U32(v) => Some(v as i64),
        _ => None,
    }
}

const LANE_SHIFT: u32 = 40;

/// Record id unique across lanes: the lane sits above the per-file serial.
fn record_id(lane: usize, serial: u64) -> u64 {
    ((lane as u64) << LANE_SHIFT) | (serial & ((1 << LANE_SHIFT) - 1))
}

/// Streaming BAM/SAM source; one per input file (lane).
pub struct BamAlignmentSource {
    path: String,
    reader: bam::Reader,
    tid_to_contig: Vec<Option<usize>>,
    contig_lengths: Vec<usize>,
    lookahead: Option<AlignmentRecord>,
    guard: SortGuard,
    lane: usize,
    min_map_qual: u8,
    keep_multi_reads: bool,
    next_id: u64,
    exhausted: bool,
}

impl fmt::Debug for BamAlignmentSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BamAlignmentSource")
            .field("path", &self.path)
            .field("lane", &self.lane)
            .field("next_id", &self.next_id)
            .finish_non_exhaustive()
    }
}

impl BamAlignmentSource {
    /// Open `path` and map its header targets onto `contigs`.
    pub fn open(
        path: impl AsRef<Path>,
        contigs: &[Contig],
        config: &CallerConfig,
        lane: usize,
    ) -> Result<Self, SourceError> {
        let path = path.as_ref();
        let display = path.display().to_string();
        let reader = bam::Reader::from_path(path).map_err(|source| SourceError::Htslib {
            path: display.clone(),
            source,
        })?;
        let tid_to_contig: Vec<Option<usize>> = reader
            .header()
            .target_names()
            .iter()
            .map(|name| contig_index(contigs, &String::from_utf8_lossy(name)))
            .collect();
        let unknown = tid_to_contig.iter().filter(|c| c.is_none()).count();
        if unknown > 0 {
            warn!(path = %display, unknown, "header targets missing from the reference are skipped");
        }
        Ok(Self {
            path: display,
            reader,
            tid_to_contig,
            contig_lengths: contigs.iter().map(Contig::len).collect(),
            lookahead: None,
            guard: SortGuard::default(),
            lane,
            min_map_qual: config.min_map_qual,
            keep_multi_reads: config.keep_multi_reads,
            next_id: 0,
            exhausted: false,
        })
    }

    /// Next usable record, or `None` at end of file.
    fn read_next(&mut self) -> Result<Option<AlignmentRecord>, SourceError> {
        if let Some(record) = self.lookahead.take() {
            return Ok(Some(record));
        }
        let mut raw = bam::Record::new();
        while !self.exhausted {
            match self.reader.read(&mut raw) {
                None => self.exhausted = true,
                Some(Err(source)) => {
                    return Err(SourceError::Htslib {
                        path: self.path.clone(),
                        source,
                    })
                }
                Some(Ok(())) => {
                    if let Some(record) = self.convert(&raw)? {
                        self.guard.check(record.contig, record.begin)?;
                        return Ok(Some(record));
                    }
                }
            }
        }
        Ok(None)
    }

    /// Translate an htslib record, `None` when a filter rejects it.
    fn convert(&mut self, raw: &bam::Record) -> Result<Option<AlignmentRecord>, SourceError> {
        if raw.is_unmapped() || raw.is_secondary() || raw.cigar_len() == 0 || raw.mapq() < self.min_map_qual {
            return Ok(None);
        }
        let Some(contig) = usize::try_from(raw.tid())
            .ok()
            .and_then(|tid| self.tid_to_contig.get(tid).copied().flatten())
        else {
            return Ok(None);
        };
        if !self.keep_multi_reads {
            if let Some(best_hits) = raw.aux(b"X0").ok().and_then(aux_integer) {
                if best_hits > 1 {
                    return Ok(None);
                }
            }
        }

        let mut cigar = Vec::new();
        for op in raw.cigar().iter() {
            match *op {
                Cigar::Match(n) | Cigar::Equal(n) | Cigar::Diff(n) => push_op(&mut cigar, CigarOpKind::Match, n),
                Cigar::Ins(n) => push_op(&mut cigar, CigarOpKind::Insertion, n),
                Cigar::Del(n) | Cigar::RefSkip(n) => push_op(&mut cigar, CigarOpKind::Deletion, n),
                Cigar::SoftClip(n) => push_op(&mut cigar, CigarOpKind::SoftClip, n),
                Cigar::HardClip(_) | Cigar::Pad(_) => {}
            }
        }
        let leading_soft = match cigar.first() {
            Some(op) if op.kind == CigarOpKind::SoftClip => op.len,
            _ => 0,
        };
        let pos = raw.pos().max(0) as u32;
        let Some(begin) = pos.checked_sub(leading_soft) else {
            debug!(qname = %String::from_utf8_lossy(raw.qname()), "soft clip before contig start, skipped");
            return Ok(None);
        };
        if (begin + span_len(&cigar)) as usize > self.contig_lengths[contig] {
            debug!(qname = %String::from_utf8_lossy(raw.qname()), "alignment past contig end, skipped");
            return Ok(None);
        }

        let strand = if raw.is_reverse() {
            Strand::Reverse
        } else {
            Strand::Forward
        };
        let sequence = normalize_sequence(&raw.seq().as_bytes());
        let qualities: Vec<u8> = raw.qual().iter().map(|&q| if q == 0xff { 0 } else { q }).collect();
        let errors = raw
            .aux(b"NM")
            .ok()
            .and_then(aux_integer)
            .map_or(1, |nm| nm.max(0) as u32);
        let clip = match raw.aux(b"XC") {
            Ok(Aux::String(value)) => parse_clip_tag(value).unwrap_or_default(),
            _ => ReadClip::default(),
        };
        let clip = match strand {
            Strand::Forward => clip,
            Strand::Reverse => clip.swapped(),
        };

        // Split reads are never clipped by tag.
        let clip = if has_indel(&cigar) { ReadClip::default() } else { clip };
        let id = record_id(self.lane, self.next_id);
        self.next_id += 1;
        let record = AlignmentRecord::new(id, contig, begin, strand, Read::new(sequence, qualities))
            .with_cigar(cigar)
            .with_errors(errors)
            .with_score(raw.mapq() as u32)
            .with_clip(clip)
            .with_lane(self.lane);
        record.validate()?;
        Ok(Some(record))
    }
}

impl AlignmentSource for BamAlignmentSource {
    fn next_window(&mut self, contig: usize, begin: u32, end: u32) -> Result<Vec<AlignmentRecord>, SourceError> {
        let mut batch = Vec::new();
        while let Some(record) = self.read_next()? {
            if record.contig > contig || (record.contig == contig && record.begin >= end) {
                self.lookahead = Some(record);
                break;
            }
            if record.contig == contig {
                batch.push(record);
            }
        }
        debug!(path = %self.path, contig, begin, end, records = batch.len(), "window parsed");
        Ok(batch)
    }

    fn lane(&self) -> usize {
        self.lane
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn contigs() -> Vec<Contig> {
        vec![Contig::new("chr1", b"ACGT".to_vec()), Contig::new("chr2", b"ACGT".to_vec())]
    }

    #[test]
    fn positions_are_converted_to_zero_based() {
        let input = "# requested\nchr2\t4\n1\t2\n\nchr1\t1\n";
        let positions = read_positions(Cursor::new(input), &contigs()).expect("well formed");
        assert_eq!(positions.contig(0), &[0, 1]);
        assert_eq!(positions.contig(1), &[3]);
    }

    #[test]
    fn unknown_contigs_are_skipped() {
        let positions = read_positions(Cursor::new("chrX\t10\n"), &contigs()).expect("well formed");
        assert!(positions.is_empty());
    }

    #[test]
    fn malformed_position_reports_line() {
        let err = read_positions(Cursor::new("chr1\t1\nchr1\tten\n"), &contigs()).unwrap_err();
        assert!(matches!(err, SourceError::Positions { line: 2, .. }));
        let err = read_positions(Cursor::new("chr1\t0\n"), &contigs()).unwrap_err();
        assert!(matches!(err, SourceError::Positions { line: 1, .. }));
    }

    #[test]
    fn record_ids_differ_across_lanes() {
        assert_eq!(record_id(0, 7), 7);
        assert_ne!(record_id(0, 0), record_id(1, 0));
        assert!(record_id(1, 0) > record_id(0, (1 << LANE_SHIFT) - 1));
        assert_eq!(record_id(2, 5) & 0xff, 5);
    }

    #[test]
    fn clip_tags_split_on_first_separator() {
        assert_eq!(parse_clip_tag("5,3"), Some(ReadClip::new(5, 3)));
        assert_eq!(parse_clip_tag("12"), Some(ReadClip::new(12, 0)));
        assert_eq!(parse_clip_tag("0;7"), Some(ReadClip::new(0, 7)));
        assert_eq!(parse_clip_tag("x"), None);
    }
}
