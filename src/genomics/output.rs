//! Tab separated SNV, indel and position records.
//!
//! Calls are pushed into a [`VariantSink`]. [`TsvVariantWriter`] renders
//! them to up to three streams in the classic snp_store layout, while
//! [`VariantBuffer`] keeps them in memory for library users and tests.

use std::fmt::Write as _;
use std::io::Write;

use thiserror::Error;

use crate::config::{CallerConfig, CallingMethod};
use crate::genomics::indel::IndelCall;
use crate::genomics::pileup::StrandCounts;
use crate::genomics::variant_caller::{PositionReport, SnvCall};

/// Errors raised while writing records.
#[derive(Debug, Error)]
pub enum OutputError {
    /// Underlying stream failed.
    #[error("failed to write records: {0}")]
    Io(#[from] std::io::Error),
    /// Rendered buffer was not UTF-8.
    #[error("rendered records are not valid UTF-8")]
    Utf8(#[from] std::string::FromUtf8Error),
}

/// Destination for the records produced by a scan.
pub trait VariantSink {
    /// Accept an SNV candidate row.
    fn write_snv(&mut self, call: &SnvCall) -> Result<(), OutputError>;
    /// Accept an indel call.
    fn write_indel(&mut self, call: &IndelCall) -> Result<(), OutputError>;
    /// Accept a position report.
    fn write_position(&mut self, report: &PositionReport) -> Result<(), OutputError>;
    /// Flush pending output.
    fn finish(&mut self) -> Result<(), OutputError> {
        Ok(())
    }
}

/// In-memory sink.
#[derive(Debug, Clone, Default)]
pub struct VariantBuffer {
    /// SNV rows in emission order.
    pub snvs: Vec<SnvCall>,
    /// Indel calls in emission order.
    pub indels: Vec<IndelCall>,
    /// Position reports in emission order.
    pub positions: Vec<PositionReport>,
}

impl VariantSink for VariantBuffer {
    fn write_snv(&mut self, call: &SnvCall) -> Result<(), OutputError> {
        self.snvs.push(call.clone());
        Ok(())
    }

    fn write_indel(&mut self, call: &IndelCall) -> Result<(), OutputError> {
        self.indels.push(call.clone());
        Ok(())
    }

    fn write_position(&mut self, report: &PositionReport) -> Result<(), OutputError> {
        self.positions.push(report.clone());
        Ok(())
    }
}

/// Formatting switches shared by all record kinds.
#[derive(Debug, Clone, PartialEq)]
pub struct RowLayout {
    /// Split per-base fields into strand blocks.
    pub orientation_aware: bool,
    /// Print bracketed quality strings instead of counts.
    pub show_quality_strings: bool,
    /// Added to 0-based positions.
    pub position_offset: u32,
    /// Added to phred values in quality strings.
    pub ascii_qual_offset: u8,
    /// Genotype model, which decides whether `snpQ` is printed.
    pub method: CallingMethod,
}

impl RowLayout {
    /// Layout of a run.
    pub fn from_config(config: &CallerConfig) -> Self {
        Self {
            orientation_aware: config.orientation_aware,
            show_quality_strings: config.output.show_quality_strings,
            position_offset: config.output.position_offset,
            ascii_qual_offset: config.output.ascii_qual_offset,
            method: config.method,
        }
    }
}

impl Default for RowLayout {
    fn default() -> Self {
        Self::from_config(&CallerConfig::default())
    }
}

/// Header line of the SNV stream.
pub fn snv_header(layout: &RowLayout) -> &'static str {
    if layout.orientation_aware {
        "#chr\tpos\tref\t[A+]\t[C+]\t[G+]\t[T+]\t[A-]\t[C-]\t[G-]\t[T-]\tcov\tcall\tquality\tsnpQ"
    } else {
        "#chr\tpos\tref\tA\tC\tG\tT\tcov\tcall\tquality\tsnpQ"
    }
}

/// Header line of the position stream.
pub fn position_header(layout: &RowLayout) -> &'static str {
    if layout.orientation_aware {
        "#chr\tpos\t[A+]\t[C+]\t[G+]\t[T+]\t[gap+]\t[A-]\t[C-]\t[G-]\t[T-]\t[gap-]\tcov"
    } else {
        "#chr\tpos\tA\tC\tG\tT\tgap\tcov"
    }
}

fn quality_string(out: &mut String, strand: &StrandCounts, idx: usize, offset: u8) {
    out.extend(strand.expanded_qualities(idx).map(|q| q.saturating_add(offset) as char));
}

/// Render one SNV row without trailing newline.
pub fn render_snv(call: &SnvCall, layout: &RowLayout) -> String {
    let mut line = format!(
        "{}\t{}\t{}",
        call.contig,
        call.position + layout.position_offset,
        call.reference as char
    );
    let field = |strands: &[&StrandCounts], idx: usize| -> String {
        if layout.show_quality_strings {
            let mut s = String::from("[");
            for strand in strands {
                quality_string(&mut s, strand, idx, layout.ascii_qual_offset);
            }
            s.push(']');
            s
        } else {
            strands.iter().map(|s| s.counts[idx]).sum::<u32>().to_string()
        }
    };
    let column = &call.column;
    if layout.orientation_aware {
        for strand in [&column.forward, &column.reverse] {
            for idx in 0..4 {
                let _ = write!(line, "\t{}", field(&[strand], idx));
            }
        }
    } else {
        for idx in 0..4 {
            let _ = write!(line, "\t{}", field(&[&column.forward, &column.reverse], idx));
        }
    }

    let coverage = call.variant.map_or_else(|| column.coverage(), |v| v.coverage);
    let _ = write!(line, "\t{coverage}");
    match call.variant {
        Some(variant) if variant.called => {
            let _ = write!(line, "\t{}\t{}", variant.iupac(), variant.quality);
            if layout.method == CallingMethod::Maq {
                let _ = write!(line, "\t{}", variant.snp_quality.unwrap_or(0));
            }
        }
        _ => line.push_str("\t\t"),
    }
    line
}

fn format_fraction(value: f32) -> String {
    let fixed = format!("{value:.6}");
    fixed.trim_end_matches('0').trim_end_matches('.').to_string()
}

/// Render one indel row without trailing newline.
pub fn render_indel(call: &IndelCall, layout: &RowLayout) -> String {
    let id = call.position + layout.position_offset;
    let (kind, start, end) = if call.is_deletion() {
        ("deletion", id, id + call.length as u32 - 1)
    } else {
        ("insertion", id - 1, id - 1)
    };
    let mut line = format!(
        "{}\tsnpstore\t{kind}\t{start}\t{end}\t{}\t+\t.\tID={id};size={};count={};",
        call.contig,
        format_fraction(call.fraction),
        call.length,
        call.count
    );
    if let Some(sequence) = &call.sequence {
        let _ = write!(line, "seq={};", String::from_utf8_lossy(sequence));
    }
    if let Some(ebi_depth) = call.ebi_depth {
        let _ = write!(line, "ebiDepth={ebi_depth};");
    }
    let _ = write!(line, "depth={};", call.depth);
    if call.split_support > 0 {
        let _ = write!(line, "splitSupport={};", call.split_support);
    }
    let _ = write!(line, "quality={};homorun={};", call.quality, call.homopolymer_run);
    if call.both_strands {
        line.push_str("bsi;");
    }
    let _ = write!(
        line,
        "seqContext={};geno={}",
        String::from_utf8_lossy(&call.context),
        call.zygosity.label()
    );
    line
}

/// Render one position row without trailing newline.
pub fn render_position(report: &PositionReport, layout: &RowLayout) -> String {
    let mut line = format!("{}\t{}", report.contig, report.position + layout.position_offset);
    if layout.orientation_aware {
        for (counts, gaps) in [(report.forward, report.deletions[0]), (report.reverse, report.deletions[1])] {
            for count in counts {
                let _ = write!(line, "\t{count}");
            }
            let _ = write!(line, "\t{gaps}");
        }
    } else {
        for idx in 0..4 {
            let _ = write!(line, "\t{}", report.forward[idx] + report.reverse[idx]);
        }
        let _ = write!(line, "\t{}", report.deletions[0] + report.deletions[1]);
    }
    let _ = write!(line, "\t{}", report.coverage());
    line
}

/// Writer of the three record streams.
#[derive(Debug)]
pub struct TsvVariantWriter<W: Write> {
    layout: RowLayout,
    snvs: Option<W>,
    indels: Option<W>,
    positions: Option<W>,
}

impl<W: Write> TsvVariantWriter<W> {
    /// Writer with no attached streams; records for absent streams are dropped.
    pub fn new(layout: RowLayout) -> Self {
        Self {
            layout,
            snvs: None,
            indels: None,
            positions: None,
        }
    }

    /// Attach the SNV stream and write its header.
    pub fn with_snv_stream(mut self, mut stream: W) -> Result<Self, OutputError> {
        writeln!(stream, "{}", snv_header(&self.layout))?;
        self.snvs = Some(stream);
        Ok(self)
    }

    /// Attach the indel stream.
    pub fn with_indel_stream(mut self, stream: W) -> Self {
        self.indels = Some(stream);
        self
    }

    /// Attach the position stream and write its header.
    pub fn with_position_stream(mut self, mut stream: W) -> Result<Self, OutputError> {
        writeln!(stream, "{}", position_header(&self.layout))?;
        self.positions = Some(stream);
        Ok(self)
    }

    /// Whether an SNV stream is attached.
    pub fn has_snv_stream(&self) -> bool {
        self.snvs.is_some()
    }

    /// Detach the streams.
    pub fn into_inner(self) -> (Option<W>, Option<W>, Option<W>) {
        (self.snvs, self.indels, self.positions)
    }
}

impl<W: Write> VariantSink for TsvVariantWriter<W> {
    fn write_snv(&mut self, call: &SnvCall) -> Result<(), OutputError> {
        if let Some(stream) = self.snvs.as_mut() {
            writeln!(stream, "{}", render_snv(call, &self.layout))?;
        }
        Ok(())
    }

    fn write_indel(&mut self, call: &IndelCall) -> Result<(), OutputError> {
        if let Some(stream) = self.indels.as_mut() {
            writeln!(stream, "{}", render_indel(call, &self.layout))?;
        }
        Ok(())
    }

    fn write_position(&mut self, report: &PositionReport) -> Result<(), OutputError> {
        if let Some(stream) = self.positions.as_mut() {
            writeln!(stream, "{}", render_position(report, &self.layout))?;
        }
        Ok(())
    }

    fn finish(&mut self) -> Result<(), OutputError> {
        for stream in [&mut self.snvs, &mut self.indels, &mut self.positions].into_iter().flatten() {
            stream.flush()?;
        }
        Ok(())
    }
}

/// Render SNV rows, header included, into a string.
pub fn render_snvs(calls: &[SnvCall], layout: &RowLayout) -> Result<String, OutputError> {
    let mut writer = TsvVariantWriter::new(layout.clone()).with_snv_stream(Vec::new())?;
    for call in calls {
        writer.write_snv(call)?;
    }
    let (buffer, _, _) = writer.into_inner();
    Ok(String::from_utf8(buffer.unwrap_or_default())?)
}

/// Render indel rows into a string.
pub fn render_indels(calls: &[IndelCall], layout: &RowLayout) -> Result<String, OutputError> {
    let mut writer = TsvVariantWriter::new(layout.clone()).with_indel_stream(Vec::new());
    for call in calls {
        writer.write_indel(call)?;
    }
    let (_, buffer, _) = writer.into_inner();
    Ok(String::from_utf8(buffer.unwrap_or_default())?)
}

/// Render position rows, header included, into a string.
pub fn render_positions(reports: &[PositionReport], layout: &RowLayout) -> Result<String, OutputError> {
    let mut writer = TsvVariantWriter::new(layout.clone()).with_position_stream(Vec::new())?;
    for report in reports {
        writer.write_position(report)?;
    }
    let (_, _, buffer) = writer.into_inner();
    Ok(String::from_utf8(buffer.unwrap_or_default())?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::genomics::indel::Zygosity;
    use crate::genomics::pileup::PileupColumn;
    use crate::genomics::statistics::SingleBaseVariant;
    use crate::genomics::types::{pack_genotype, Strand};
    use std::sync::Arc;

    fn snv(called: bool) -> SnvCall {
        let mut column = PileupColumn::new();
        column.observe(b'A', 30, Strand::Forward, 2);
        column.observe(b'A', 20, Strand::Reverse, 1);
        column.observe(b'T', 40, Strand::Reverse, 1);
        SnvCall {
            contig: Arc::from("chr1"),
            position: 41,
            reference: b'T',
            column,
            variant: Some(SingleBaseVariant {
                called,
                genotype: pack_genotype(0, 3),
                count: 3,
                quality: 27,
                snp_quality: Some(33),
                coverage: 4,
            }),
        }
    }

    fn deletion() -> IndelCall {
        IndelCall {
            contig: Arc::from("chr2"),
            position: 108,
            length: 2,
            sequence: None,
            fraction: 1.0,
            count: 4,
            depth: 4,
            ebi_depth: None,
            split_support: 0,
            quality: 30,
            homopolymer_run: 2,
            both_strands: true,
            context: b"TTACACCGTGAACT".to_vec(),
            zygosity: Zygosity::Hom,
        }
    }

    #[test]
    fn snv_row_with_counts() {
        let layout = RowLayout {
            show_quality_strings: false,
            ..RowLayout::default()
        };
        assert_eq!(render_snv(&snv(true), &layout), "chr1\t42\tT\t3\t0\t0\t1\t4\tW\t27\t33");
    }

    #[test]
    fn snv_row_with_quality_strings_per_strand() {
        let layout = RowLayout {
            orientation_aware: true,
            ..RowLayout::default()
        };
        assert_eq!(
            render_snv(&snv(true), &layout),
            "chr1\t42\tT\t[??]\t[]\t[]\t[]\t[5]\t[]\t[]\t[I]\t4\tW\t27\t33"
        );
    }

    #[test]
    fn uncalled_rows_end_with_empty_fields() {
        let layout = RowLayout {
            show_quality_strings: false,
            method: CallingMethod::Threshold,
            ..RowLayout::default()
        };
        assert!(render_snv(&snv(false), &layout).ends_with("\t4\t\t"));
    }

    #[test]
    fn deletion_row_spans_deleted_bases() {
        assert_eq!(
            render_indel(&deletion(), &RowLayout::default()),
            "chr2\tsnpstore\tdeletion\t109\t110\t1\t+\t.\tID=109;size=2;count=4;depth=4;quality=30;homorun=2;bsi;seqContext=TTACACCGTGAACT;geno=hom"
        );
    }

    #[test]
    fn insertion_row_carries_sequence_and_direct_depths() {
        let call = IndelCall {
            length: -2,
            sequence: Some(b"GG".to_vec()),
            fraction: 0.5,
            count: 3,
            depth: 6,
            ebi_depth: Some(6),
            split_support: 3,
            both_strands: false,
            zygosity: Zygosity::Het,
            ..deletion()
        };
        let row = render_indel(&call, &RowLayout::default());
        assert!(row.starts_with("chr2\tsnpstore\tinsertion\t108\t108\t0.5\t"));
        assert!(row.contains("ID=109;size=-2;count=3;seq=GG;ebiDepth=6;depth=6;splitSupport=3;quality=30;homorun=2;seqContext="));
        assert!(!row.contains("bsi"));
    }

    #[test]
    fn position_rows_include_gaps_and_coverage() {
        let report = PositionReport {
            contig: Arc::from("chr1"),
            position: 9,
            forward: [1, 0, 2, 0],
            reverse: [0, 3, 0, 0],
            deletions: [1, 1],
        };
        let rendered = render_positions(&[report], &RowLayout::default()).expect("render");
        assert_eq!(rendered, "#chr\tpos\tA\tC\tG\tT\tgap\tcov\nchr1\t10\t1\t3\t2\t0\t2\t8\n");
    }

    #[test]
    fn rendered_snvs_start_with_header() {
        let rendered = render_snvs(&[snv(true)], &RowLayout::default()).expect("render");
        assert!(rendered.starts_with("#chr\tpos\tref\tA\tC\tG\tT\tcov\tcall\tquality\tsnpQ\n"));
        assert_eq!(rendered.lines().count(), 2);
    }
}
