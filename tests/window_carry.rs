mod common;

use common::{record, scan, small_config, stack};
use snpstore::genomics::{CigarOp, CigarOpKind};
use snpstore::{AlignmentRecord, Contig, Read, Strand};

const REFERENCE: &[u8] = b"TTGACCATGCAGTCCAGTAGCTAGGCTTACGGATCAACGTTGCAAGCTTAGCATGCCA";

fn mutated(begin: usize, len: usize, at: usize, base: u8) -> Vec<u8> {
    let mut read = REFERENCE[begin..begin + len].to_vec();
    read[at - begin] = base;
    read
}

fn records() -> Vec<AlignmentRecord> {
    let mut records = Vec::new();
    records.extend(stack(0, 4, 3, &REFERENCE[3..15]));
    records.extend(stack(10, 5, 18, &mutated(18, 12, 25, b'T')));
    records.extend(stack(20, 4, 22, &mutated(22, 14, 25, b'T')));
    records.extend(stack(30, 6, 36, &mutated(36, 10, 41, b'C')));
    records
}

fn called(window: u32) -> Vec<(u32, char)> {
    let contigs = vec![Contig::new("chr7", REFERENCE.to_vec())];
    let config = small_config().with_window(window, 70);
    let (sink, _) = scan(&config, &contigs, records());
    sink.snvs
        .iter()
        .filter_map(|c| c.variant.map(|v| (c.position, v.iupac())))
        .collect()
}

#[test]
fn window_size_does_not_change_calls() {
    let whole = called(1_000);
    assert_eq!(whole.iter().map(|(p, _)| *p).collect::<Vec<_>>(), vec![25, 41]);
    for window in [5, 7, 13, 25, 26] {
        assert_eq!(called(window), whole, "window size {window}");
    }
}

#[test]
fn every_window_with_reads_is_visited() {
    let contigs = vec![Contig::new("chr7", REFERENCE.to_vec())];
    let config = small_config().with_window(10, 70);
    let (_, summary) = scan(&config, &contigs, records());
    assert_eq!(summary.records, 19);
    assert_eq!(summary.windows, 6);
}

fn quality_peak_records() -> Vec<AlignmentRecord> {
    let mut qualities = vec![8; 16];
    qualities[8] = 40;
    let mut records: Vec<AlignmentRecord> = (0..5)
        .map(|id| {
            let strand = if id % 2 == 0 { Strand::Forward } else { Strand::Reverse };
            AlignmentRecord::new(id, 0, 0, strand, Read::new(mutated(0, 16, 8, b'A'), qualities.clone()))
        })
        .collect();
    records.push(
        record(10, 42, &REFERENCE[42..54]).with_cigar(vec![
            CigarOp::new(CigarOpKind::SoftClip, 2),
            CigarOp::new(CigarOpKind::Match, 10),
        ]),
    );
    records
}

#[test]
fn clipped_reads_elsewhere_do_not_change_quality_mode() {
    let contigs = vec![Contig::new("chr7", REFERENCE.to_vec())];
    let snvs = |window: u32| {
        let config = small_config().with_window(window, 70);
        let (sink, _) = scan(&config, &contigs, quality_peak_records());
        sink.snvs
    };
    let whole = snvs(1_000);
    assert!(whole.iter().any(|c| c.position == 8 && c.variant.is_some()));
    assert_eq!(snvs(20), whole);
}
