//! Performance benchmarks

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use snpstore::genomics::ProbabilityTables;
use snpstore::{
    AlignmentRecord, CallerConfig, Contig, Read, Strand, VariantBuffer, VecAlignmentSource, WindowedScanner,
};

const CONTIG_LEN: usize = 20_000;
const READ_LEN: usize = 50;

fn synthetic_reference() -> Vec<u8> {
    let mut state = 0x2545_f491_u32;
    (0..CONTIG_LEN)
        .map(|_| {
            state ^= state << 13;
            state ^= state >> 17;
            state ^= state << 5;
            b"ACGT"[(state % 4) as usize]
        })
        .collect()
}

/// Reads tiled every `step` bases with a substitution every 97 bases.
fn synthetic_reads(reference: &[u8], step: usize) -> Vec<AlignmentRecord> {
    (0..(CONTIG_LEN - READ_LEN) / step)
        .map(|i| {
            let begin = i * step;
            let mut sequence = reference[begin..begin + READ_LEN].to_vec();
            for (offset, base) in sequence.iter_mut().enumerate() {
                if (begin + offset) % 97 == 0 {
                    *base = if *base == b'A' { b'C' } else { b'A' };
                }
            }
            let strand = if i % 2 == 0 { Strand::Forward } else { Strand::Reverse };
            AlignmentRecord::new(i as u64, 0, begin as u32, strand, Read::new(sequence, vec![30; READ_LEN]))
        })
        .collect()
}

fn benchmark_tables(c: &mut Criterion) {
    let config = CallerConfig::default();
    c.bench_function("probability_tables", |b| {
        b.iter(|| black_box(ProbabilityTables::build(&config.maq, &config.amplification)));
    });
}

fn benchmark_scan(c: &mut Criterion) {
    let reference = synthetic_reference();
    let contigs = vec![Contig::new("chrBench", reference.clone())];
    let config = CallerConfig::default().with_min_coverage(3).with_window(5_000, 70);
    let tables = std::sync::Arc::new(ProbabilityTables::build(&config.maq, &config.amplification));

    let mut group = c.benchmark_group("window_scan");
    for step in [10usize, 5, 2] {
        let reads = synthetic_reads(&reference, step);
        group.bench_with_input(BenchmarkId::from_parameter(READ_LEN / step), &reads, |b, reads| {
            b.iter(|| {
                let scanner = WindowedScanner::new(&config, &contigs)
                    .expect("valid configuration")
                    .with_tables(tables.clone());
                let mut sink = VariantBuffer::default();
                let summary = scanner
                    .run(&mut [VecAlignmentSource::new(reads.clone())], &mut sink)
                    .expect("scan succeeds");
                black_box((summary, sink.snvs.len()))
            });
        });
    }
    group.finish();
}

criterion_group!(benches, benchmark_tables, benchmark_scan);
criterion_main!(benches);
