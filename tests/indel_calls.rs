mod common;

use common::{deletion_record, record, scan, small_config};
use snpstore::genomics::{render_indels, CigarOp, CigarOpKind, Zygosity};
use snpstore::{AlignmentRecord, Contig, IndelConfig, RowLayout};

const REFERENCE: &[u8] = b"GATTACACCGTGAACTGGCT";

fn contigs() -> Vec<Contig> {
    vec![Contig::new("chr1", REFERENCE.to_vec())]
}

fn deletion_reads(count: u64) -> Vec<AlignmentRecord> {
    (0..count).map(|id| deletion_record(id, 0, REFERENCE, 8, 2, 10)).collect()
}

fn insertion_reads(count: u64) -> Vec<AlignmentRecord> {
    let mut sequence = REFERENCE[..8].to_vec();
    sequence.extend_from_slice(b"GG");
    sequence.extend_from_slice(&REFERENCE[8..18]);
    (0..count)
        .map(|id| {
            record(id, 0, &sequence).with_cigar(vec![
                CigarOp::new(CigarOpKind::Match, 8),
                CigarOp::new(CigarOpKind::Insertion, 2),
                CigarOp::new(CigarOpKind::Match, 10),
            ])
        })
        .collect()
}

#[test]
fn scripted_deletion_is_called() {
    let (sink, _) = scan(&small_config(), &contigs(), deletion_reads(4));
    assert_eq!(sink.indels.len(), 1);
    let call = &sink.indels[0];
    assert!(call.is_deletion());
    assert_eq!((call.position, call.length), (8, 2));
    assert_eq!(call.count, 4);
    assert_eq!(call.split_support, 4);
    assert_eq!(call.zygosity, Zygosity::Hom);
    assert!(sink.snvs.is_empty());
}

#[test]
fn deletion_row_spans_deleted_bases() {
    let config = small_config();
    let (sink, _) = scan(&config, &contigs(), deletion_reads(4));
    let text = render_indels(&sink.indels, &RowLayout::from_config(&config)).expect("render");
    let row: Vec<&str> = text.lines().next().expect("row").split('\t').collect();
    assert_eq!(&row[..5], &["chr1", "snpstore", "deletion", "9", "10"]);
    assert!(row[8].starts_with("ID=9;size=2;count=4;"));
    assert!(row[8].ends_with("geno=hom"));
}

#[test]
fn scripted_insertion_keeps_inserted_bases() {
    let (sink, _) = scan(&small_config(), &contigs(), insertion_reads(4));
    assert_eq!(sink.indels.len(), 1);
    let call = &sink.indels[0];
    assert!(!call.is_deletion());
    assert_eq!((call.position, call.length), (8, -2));
    assert_eq!(call.sequence.as_deref(), Some(&b"GG"[..]));
}

#[test]
fn support_below_count_threshold_is_dropped() {
    let (sink, _) = scan(&small_config(), &contigs(), deletion_reads(2));
    assert!(sink.indels.is_empty());
}

#[test]
fn minority_deletion_is_heterozygous() {
    let mut records = deletion_reads(3);
    records.extend((3..7).map(|id| record(id, 0, &REFERENCE[..18])));
    let (sink, _) = scan(&small_config(), &contigs(), records);
    assert_eq!(sink.indels.len(), 1);
    assert_eq!(sink.indels[0].zygosity, Zygosity::Het);
    assert_eq!(sink.indels[0].depth, 7);
}

#[test]
fn homopolymer_filter_applies_during_scan() {
    let config = small_config().with_indel(IndelConfig {
        max_polymer_run: 1,
        ..IndelConfig::default()
    });
    let (sink, _) = scan(&config, &contigs(), deletion_reads(4));
    assert!(sink.indels.is_empty());
}

#[test]
fn realigned_scan_reports_the_same_deletion() {
    let config = small_config().with_realign(true);
    let (sink, _) = scan(&config, &contigs(), deletion_reads(4));
    assert_eq!(sink.indels.len(), 1);
    let call = &sink.indels[0];
    assert_eq!((call.position, call.length), (8, 2));
    assert_eq!(call.count, 4);
    assert!(sink.snvs.is_empty());
}
