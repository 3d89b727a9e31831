#![allow(dead_code)]

use snpstore::genomics::{CigarOp, CigarOpKind};
use snpstore::{
    AlignmentRecord, CallerConfig, Contig, OutputConfig, Read, ScanSummary, Strand, VariantBuffer,
    VecAlignmentSource, WindowedScanner,
};

/// Record on contig 0 with uniform quality 30; odd ids map to the reverse strand.
pub fn record(id: u64, begin: u32, sequence: &[u8]) -> AlignmentRecord {
    let strand = if id % 2 == 0 { Strand::Forward } else { Strand::Reverse };
    AlignmentRecord::new(
        id,
        0,
        begin,
        strand,
        Read::new(sequence.to_vec(), vec![30; sequence.len()]),
    )
}

/// `count` copies of the same read, with consecutive ids from `first_id`.
pub fn stack(first_id: u64, count: u64, begin: u32, sequence: &[u8]) -> Vec<AlignmentRecord> {
    (first_id..first_id + count)
        .map(|id| record(id, begin, sequence))
        .collect()
}

/// Read carrying a `deleted`-base deletion after `prefix` matching bases.
pub fn deletion_record(id: u64, begin: u32, reference: &[u8], prefix: usize, deleted: usize, suffix: usize) -> AlignmentRecord {
    let start = begin as usize;
    let mut sequence = reference[start..start + prefix].to_vec();
    let resume = start + prefix + deleted;
    sequence.extend_from_slice(&reference[resume..resume + suffix]);
    record(id, begin, &sequence).with_cigar(vec![
        CigarOp::new(CigarOpKind::Match, prefix as u32),
        CigarOp::new(CigarOpKind::Deletion, deleted as u32),
        CigarOp::new(CigarOpKind::Match, suffix as u32),
    ])
}

/// Configuration for small synthetic data: low coverage requirement, no
/// pileup capping and only called SNVs reported.
pub fn small_config() -> CallerConfig {
    CallerConfig::default()
        .with_min_coverage(3)
        .with_max_pile(100)
        .with_min_clipped_length(2)
        .with_output(OutputConfig {
            all_candidates: false,
            ..OutputConfig::default()
        })
}

/// Run a scan over one in-memory lane and collect everything it emits.
pub fn scan(config: &CallerConfig, contigs: &[Contig], mut records: Vec<AlignmentRecord>) -> (VariantBuffer, ScanSummary) {
    records.sort_by_key(|r| (r.contig, r.begin, r.id));
    let scanner = WindowedScanner::new(config, contigs).expect("valid configuration");
    let mut sink = VariantBuffer::default();
    let summary = scanner
        .run(&mut [VecAlignmentSource::new(records)], &mut sink)
        .expect("scan succeeds");
    (sink, summary)
}
