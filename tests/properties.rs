mod common;

use common::{deletion_record, record, small_config};
use proptest::prelude::*;
use snpstore::genomics::{correct_pileup, ContigWindow, MultipleAlignment, WindowStore};
use snpstore::{AlignmentRecord, Contig, PositionSet, Strand, VariantBuffer, VecAlignmentSource, WindowedScanner};

const CONTIG_LEN: usize = 48;

fn reference() -> impl Strategy<Value = Vec<u8>> {
    prop::collection::vec(prop::sample::select(b"ACGT".to_vec()), CONTIG_LEN)
}

/// (begin, length, deletion) triples; deletions sit in the middle of the read.
fn placements() -> impl Strategy<Value = Vec<(u32, usize, bool)>> {
    prop::collection::vec((0u32..24, 8usize..16, any::<bool>()), 1..20)
}

fn build_records(reference: &[u8], placements: &[(u32, usize, bool)]) -> Vec<AlignmentRecord> {
    let mut records: Vec<AlignmentRecord> = placements
        .iter()
        .enumerate()
        .map(|(id, &(begin, len, deletion))| {
            let id = id as u64;
            if deletion {
                let half = len / 2;
                deletion_record(id, begin, reference, half, 2, len - half)
            } else {
                record(id, begin, &reference[begin as usize..begin as usize + len])
            }
        })
        .collect();
    records.sort_by_key(|r| (r.begin, r.id));
    records
}

fn coverage(reference: &[u8], records: Vec<AlignmentRecord>) -> Vec<u32> {
    let contigs = vec![Contig::new("chr1", reference.to_vec())];
    let mut positions = PositionSet::new(1);
    for p in 0..CONTIG_LEN as u32 {
        positions.insert(0, p);
    }
    let config = small_config().with_window(16, 70);
    let scanner = WindowedScanner::new(&config, &contigs)
        .expect("valid configuration")
        .with_outputs(false, false)
        .with_positions(positions.finalize());
    let mut sink = VariantBuffer::default();
    scanner
        .run(&mut [VecAlignmentSource::new(records)], &mut sink)
        .expect("scan succeeds");
    sink.positions.iter().map(|r| r.coverage()).collect()
}

proptest! {
    #[test]
    fn pileup_correction_is_idempotent(
        stacks in prop::collection::vec((0u32..6, any::<bool>()), 1..40),
        max_pile in 1u32..4,
        orientation_aware in any::<bool>(),
    ) {
        let mut records: Vec<AlignmentRecord> = stacks
            .iter()
            .enumerate()
            .map(|(id, &(begin, reverse))| {
                let strand = if reverse { Strand::Reverse } else { Strand::Forward };
                let mut r = record(id as u64, begin, b"ACGTACGT");
                r.strand = strand;
                r.with_score(id as u32 % 7)
            })
            .collect();
        let first = correct_pileup(&mut records, max_pile, orientation_aware);
        prop_assert!(first < stacks.len());
        let snapshot = records.clone();
        let second = correct_pileup(&mut records, max_pile, orientation_aware);
        prop_assert_eq!(second, 0);
        prop_assert_eq!(records, snapshot);
    }

    #[test]
    fn realignment_preserves_reads_and_reference(
        reference in reference(),
        placements in placements(),
    ) {
        let records = build_records(&reference, &placements);
        let window = ContigWindow::new(0, "chr1", 0, reference.clone());
        let store = WindowStore::build(window, &records).expect("records fit the window");
        let msa = MultipleAlignment::realign(&store);

        prop_assert_eq!(msa.ungapped_reference(), store.reference().to_vec());
        prop_assert_eq!(msa.rows().len(), store.len());
        for row in msa.rows() {
            prop_assert!(row.begin() < row.end() && row.end() <= msa.columns());
            let alignment = &store.alignments()[row.alignment];
            prop_assert_eq!(row.ungapped(), store.read(alignment.read).sequence.to_vec());
        }
    }

    #[test]
    fn adding_a_read_never_lowers_coverage(
        reference in reference(),
        placements in placements(),
        extra in (0u32..24, 8usize..16),
    ) {
        let records = build_records(&reference, &placements);
        let before = coverage(&reference, records.clone());

        let (begin, len) = extra;
        let mut grown = records;
        grown.push(record(1_000, begin, &reference[begin as usize..begin as usize + len]));
        grown.sort_by_key(|r| (r.begin, r.id));
        let after = coverage(&reference, grown);

        prop_assert_eq!(before.len(), CONTIG_LEN);
        prop_assert_eq!(after.len(), CONTIG_LEN);
        for (b, a) in before.iter().zip(&after) {
            prop_assert!(a >= b);
        }
    }
}
