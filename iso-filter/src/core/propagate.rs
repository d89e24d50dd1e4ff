//! Format filter propagation
//!
//! Every companion file is streamed record by record through a
//! [`FormatAdapter`], and only records whose identifier belongs to the
//! retention set reach the output. Selection is stable: retained records
//! leave in the same relative order they came in. Records without an
//! identifier (SAM header lines, GTF comments) are structural and are
//! always copied.

use config::{FilterError, FAA, FASTA, FASTQ, GTF, SAM};
use rayon::prelude::*;
use serde::Serialize;

use std::fs::File;
use std::io::{BufRead, BufWriter, Lines, Write};
use std::path::{Path, PathBuf};

use crate::core::{RetentionSet, RunConfig};
use crate::utils::open_reader;

pub type Records<R> = Box<dyn Iterator<Item = Result<R, FilterError>> + Send>;

pub trait FormatRecord {
    /// identifier tested against the retention set; None = always emitted
    fn id(&self) -> Option<&str>;
}

pub trait FormatAdapter {
    type Record: FormatRecord;

    fn suffix(&self) -> &'static str;
    fn read(&self, path: &Path) -> Result<Records<Self::Record>, FilterError>;
    fn write<W: Write>(&self, writer: &mut W, record: &Self::Record) -> Result<(), FilterError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CompanionKind {
    Sequence,
    Annotation,
    Alignment,
    Protein,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Companion {
    pub kind: CompanionKind,
    pub path: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FilteredOutput {
    pub kind: CompanionKind,
    pub input: PathBuf,
    pub output: PathBuf,
    pub kept: usize,
    pub dropped: usize,
}

/// stable, order-preserving selection of one companion file
pub fn propagate<A: FormatAdapter>(
    adapter: &A,
    input: &Path,
    output: &Path,
    retained: &RetentionSet,
) -> Result<(usize, usize), FilterError> {
    let records = adapter.read(input)?;
    let mut writer = BufWriter::new(File::create(output)?);
    let (mut kept, mut dropped) = (0, 0);

    for record in records {
        let record = record?;

        match record.id() {
            None => adapter.write(&mut writer, &record)?,
            Some(id) if retained.contains(id) => {
                adapter.write(&mut writer, &record)?;
                kept += 1;
            }
            Some(_) => dropped += 1,
        }
    }

    writer.flush()?;
    log::info!("Output written to: {}", output.display());

    Ok((kept, dropped))
}

pub fn propagate_companion(
    companion: &Companion,
    run: &RunConfig,
    retained: &RetentionSet,
) -> Result<FilteredOutput, FilterError> {
    let input = companion.path.as_path();

    let (output, (kept, dropped)) = match companion.kind {
        CompanionKind::Sequence => {
            let adapter = SequenceAdapter::detect(input)?;
            let output = run.filtered_path(adapter.suffix());
            let counts = propagate(&adapter, input, &output, retained)?;
            (output, counts)
        }
        CompanionKind::Annotation => {
            let output = run.filtered_path(AnnotationAdapter.suffix());
            let counts = propagate(&AnnotationAdapter, input, &output, retained)?;
            (output, counts)
        }
        CompanionKind::Alignment => {
            let output = run.filtered_path(AlignmentAdapter.suffix());
            let counts = propagate(&AlignmentAdapter, input, &output, retained)?;
            (output, counts)
        }
        CompanionKind::Protein => {
            let output = run.filtered_path(ProteinAdapter.suffix());
            let counts = propagate(&ProteinAdapter, input, &output, retained)?;
            (output, counts)
        }
    };

    log::info!(
        "{:?} records kept from {}: {} [dropped: {}]",
        companion.kind,
        input.display(),
        kept,
        dropped
    );

    Ok(FilteredOutput {
        kind: companion.kind,
        input: input.to_path_buf(),
        output,
        kept,
        dropped,
    })
}

/// filter every companion file, one task per file
pub fn propagate_all(
    companions: &[Companion],
    run: &RunConfig,
    retained: &RetentionSet,
) -> Result<Vec<FilteredOutput>, FilterError> {
    if companions.is_empty() {
        log::warn!("No companion files to filter. Skipping propagation...");
        return Ok(Vec::new());
    }

    let results: Vec<Result<FilteredOutput, FilterError>> = companions
        .par_iter()
        .map(|companion| propagate_companion(companion, run, retained))
        .collect();

    if results.iter().any(|r| r.is_err()) {
        for output in results.iter().flatten() {
            log::warn!("Output completed before failure: {}", output.output.display());
        }
        log::warn!(
            "Filtering aborted. Files under {} with prefix '{}' may be partial!",
            run.outdir.display(),
            run.prefix
        );
    }

    results.into_iter().collect()
}

/// shared line cursor with one line of look-ahead
struct LineCursor {
    lines: Lines<Box<dyn BufRead + Send>>,
    path: PathBuf,
    lineno: usize,
    pending: Option<String>,
}

impl LineCursor {
    fn open(path: &Path) -> Result<Self, FilterError> {
        Ok(Self {
            lines: open_reader(path)?.lines(),
            path: path.to_path_buf(),
            lineno: 0,
            pending: None,
        })
    }

    fn next_line(&mut self) -> Option<Result<String, FilterError>> {
        if let Some(line) = self.pending.take() {
            return Some(Ok(line));
        }

        self.lineno += 1;
        self.lines.next().map(|line| {
            line.map(|l| l.trim_end_matches('\r').to_string())
                .map_err(FilterError::from)
        })
    }

    fn push_back(&mut self, line: String) {
        self.pending = Some(line);
    }

    fn malformed(&self, reason: impl Into<String>) -> FilterError {
        FilterError::malformed(&self.path, self.lineno, reason)
    }
}

fn first_token(header: &str) -> &str {
    header.split_whitespace().next().unwrap_or_default()
}

// fasta

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FastaRecord {
    pub description: String,
    pub sequence: Vec<String>,
}

impl FormatRecord for FastaRecord {
    fn id(&self) -> Option<&str> {
        Some(first_token(&self.description))
    }
}

struct FastaReader {
    cursor: LineCursor,
}

impl Iterator for FastaReader {
    type Item = Result<FastaRecord, FilterError>;

    fn next(&mut self) -> Option<Self::Item> {
        let description = loop {
            match self.cursor.next_line()? {
                Err(e) => return Some(Err(e)),
                Ok(line) if line.trim().is_empty() => continue,
                Ok(line) => match line.strip_prefix('>') {
                    Some(description) => break description.to_string(),
                    None => {
                        return Some(Err(self
                            .cursor
                            .malformed("sequence data before any '>' header")))
                    }
                },
            }
        };

        let mut sequence = Vec::new();
        while let Some(line) = self.cursor.next_line() {
            match line {
                Err(e) => return Some(Err(e)),
                Ok(line) if line.starts_with('>') => {
                    self.cursor.push_back(line);
                    break;
                }
                Ok(line) if line.trim().is_empty() => continue,
                Ok(line) => sequence.push(line),
            }
        }

        Some(Ok(FastaRecord {
            description,
            sequence,
        }))
    }
}

// fastq

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FastqRecord {
    pub header: String,
    pub sequence: String,
    pub separator: String,
    pub quality: String,
}

impl FormatRecord for FastqRecord {
    fn id(&self) -> Option<&str> {
        Some(first_token(&self.header))
    }
}

struct FastqReader {
    cursor: LineCursor,
}

impl FastqReader {
    fn record(&mut self, header: String) -> Result<FastqRecord, FilterError> {
        let header = match header.strip_prefix('@') {
            Some(h) => h.to_string(),
            None => return Err(self.cursor.malformed("FASTQ header must start with '@'")),
        };

        let sequence = self.required("sequence")?;
        let separator = self.required("'+' separator")?;
        if !separator.starts_with('+') {
            return Err(self.cursor.malformed("FASTQ separator must start with '+'"));
        }

        let quality = self.required("quality")?;
        if quality.len() != sequence.len() {
            return Err(self
                .cursor
                .malformed("FASTQ quality and sequence lengths differ"));
        }

        Ok(FastqRecord {
            header,
            sequence,
            separator,
            quality,
        })
    }

    fn required(&mut self, what: &str) -> Result<String, FilterError> {
        match self.cursor.next_line() {
            Some(line) => line,
            None => Err(self
                .cursor
                .malformed(format!("unexpected EOF, missing {}", what))),
        }
    }
}

impl Iterator for FastqReader {
    type Item = Result<FastqRecord, FilterError>;

    fn next(&mut self) -> Option<Self::Item> {
        let header = loop {
            match self.cursor.next_line()? {
                Err(e) => return Some(Err(e)),
                Ok(line) if line.trim().is_empty() => continue,
                Ok(line) => break line,
            }
        };

        Some(self.record(header))
    }
}

/// container type of an isoform sequence file
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SequenceKind {
    Fasta,
    Fastq,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SequenceRecord {
    Fasta(FastaRecord),
    Fastq(FastqRecord),
}

impl FormatRecord for SequenceRecord {
    fn id(&self) -> Option<&str> {
        match self {
            SequenceRecord::Fasta(r) => r.id(),
            SequenceRecord::Fastq(r) => r.id(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SequenceAdapter {
    pub kind: SequenceKind,
}

impl SequenceAdapter {
    /// inspect the first record marker
    pub fn detect(path: &Path) -> Result<Self, FilterError> {
        let mut cursor = LineCursor::open(path)?;

        while let Some(line) = cursor.next_line() {
            let line = line?;
            match line.trim_start().as_bytes().first() {
                None => continue,
                Some(b'>') => return Ok(Self { kind: SequenceKind::Fasta }),
                Some(b'@') => return Ok(Self { kind: SequenceKind::Fastq }),
                Some(_) => {
                    return Err(cursor.malformed("expected a '>' or '@' record marker"));
                }
            }
        }

        Err(FilterError::malformed(path, 0, "no sequence records found"))
    }
}

impl FormatAdapter for SequenceAdapter {
    type Record = SequenceRecord;

    fn suffix(&self) -> &'static str {
        match self.kind {
            SequenceKind::Fasta => FASTA,
            SequenceKind::Fastq => FASTQ,
        }
    }

    fn read(&self, path: &Path) -> Result<Records<Self::Record>, FilterError> {
        let cursor = LineCursor::open(path)?;

        Ok(match self.kind {
            SequenceKind::Fasta => Box::new(
                FastaReader { cursor }.map(|r| r.map(SequenceRecord::Fasta)),
            ),
            SequenceKind::Fastq => Box::new(
                FastqReader { cursor }.map(|r| r.map(SequenceRecord::Fastq)),
            ),
        })
    }

    fn write<W: Write>(&self, writer: &mut W, record: &Self::Record) -> Result<(), FilterError> {
        match record {
            SequenceRecord::Fasta(r) => {
                writeln!(writer, ">{}", r.description)?;
                for line in &r.sequence {
                    writeln!(writer, "{}", line)?;
                }
            }
            SequenceRecord::Fastq(r) => {
                writeln!(
                    writer,
                    "@{}\n{}\n{}\n{}",
                    r.header, r.sequence, r.separator, r.quality
                )?;
            }
        }

        Ok(())
    }
}

// gtf

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GtfRecord {
    Comment(String),
    Transcript { id: String, lines: Vec<String> },
}

impl FormatRecord for GtfRecord {
    fn id(&self) -> Option<&str> {
        match self {
            GtfRecord::Comment(_) => None,
            GtfRecord::Transcript { id, .. } => Some(id.as_str()),
        }
    }
}

/// transcript_id value of a GTF attribute column
pub fn transcript_id(attributes: &str) -> Option<&str> {
    attributes
        .split(';')
        .map(str::trim)
        .find_map(|attr| match attr.split_once(char::is_whitespace) {
            Some(("transcript_id", value)) => Some(value),
            _ => None,
        })
        .map(|value| value.trim().trim_matches('"'))
        .filter(|value| !value.is_empty())
}

struct GtfReader {
    cursor: LineCursor,
    orphans: usize,
}

impl GtfReader {
    fn report_orphans(&mut self) {
        if self.orphans > 0 {
            log::warn!(
                "Dropped {} GTF lines without transcript_id from {}",
                self.orphans,
                self.cursor.path.display()
            );
            self.orphans = 0;
        }
    }
}

impl Iterator for GtfReader {
    type Item = Result<GtfRecord, FilterError>;

    fn next(&mut self) -> Option<Self::Item> {
        let mut group: Option<(String, Vec<String>)> = None;

        while let Some(line) = self.cursor.next_line() {
            let line = match line {
                Ok(line) => line,
                Err(e) => return Some(Err(e)),
            };

            if line.trim().is_empty() {
                continue;
            }

            if line.starts_with('#') {
                if group.is_some() {
                    self.cursor.push_back(line);
                    break;
                }
                return Some(Ok(GtfRecord::Comment(line)));
            }

            let fields: Vec<&str> = line.splitn(9, '\t').collect();
            if fields.len() < 9 {
                return Some(Err(self.cursor.malformed(format!(
                    "GTF line has {} columns, expected 9",
                    fields.len()
                ))));
            }

            let Some(id) = transcript_id(fields[8]).map(String::from) else {
                self.orphans += 1;
                continue;
            };

            match group.as_mut() {
                None => group = Some((id, vec![line])),
                Some((current, lines)) if *current == id => lines.push(line),
                Some(_) => {
                    self.cursor.push_back(line);
                    break;
                }
            }
        }

        match group {
            Some((id, lines)) => Some(Ok(GtfRecord::Transcript { id, lines })),
            None => {
                self.report_orphans();
                None
            }
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct AnnotationAdapter;

impl FormatAdapter for AnnotationAdapter {
    type Record = GtfRecord;

    fn suffix(&self) -> &'static str {
        GTF
    }

    fn read(&self, path: &Path) -> Result<Records<Self::Record>, FilterError> {
        Ok(Box::new(GtfReader {
            cursor: LineCursor::open(path)?,
            orphans: 0,
        }))
    }

    fn write<W: Write>(&self, writer: &mut W, record: &Self::Record) -> Result<(), FilterError> {
        match record {
            GtfRecord::Comment(line) => writeln!(writer, "{}", line)?,
            GtfRecord::Transcript { lines, .. } => {
                for line in lines {
                    writeln!(writer, "{}", line)?;
                }
            }
        }

        Ok(())
    }
}

// sam

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SamRecord {
    Header(String),
    Alignment { qname: String, line: String },
}

impl FormatRecord for SamRecord {
    fn id(&self) -> Option<&str> {
        match self {
            SamRecord::Header(_) => None,
            SamRecord::Alignment { qname, .. } => Some(qname.as_str()),
        }
    }
}

struct SamReader {
    cursor: LineCursor,
}

impl Iterator for SamReader {
    type Item = Result<SamRecord, FilterError>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let line = match self.cursor.next_line()? {
                Ok(line) => line,
                Err(e) => return Some(Err(e)),
            };

            if line.is_empty() {
                continue;
            }

            if line.starts_with('@') {
                return Some(Ok(SamRecord::Header(line)));
            }

            let qname = line.split('\t').next().unwrap_or_default();
            if qname.is_empty() {
                return Some(Err(self.cursor.malformed("SAM record without QNAME")));
            }

            return Some(Ok(SamRecord::Alignment {
                qname: qname.to_string(),
                line,
            }));
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct AlignmentAdapter;

impl FormatAdapter for AlignmentAdapter {
    type Record = SamRecord;

    fn suffix(&self) -> &'static str {
        SAM
    }

    fn read(&self, path: &Path) -> Result<Records<Self::Record>, FilterError> {
        Ok(Box::new(SamReader {
            cursor: LineCursor::open(path)?,
        }))
    }

    fn write<W: Write>(&self, writer: &mut W, record: &Self::Record) -> Result<(), FilterError> {
        match record {
            SamRecord::Header(line) => writeln!(writer, "{}", line)?,
            SamRecord::Alignment { line, .. } => writeln!(writer, "{}", line)?,
        }

        Ok(())
    }
}

// faa

#[derive(Debug, Clone, Copy, Default)]
pub struct ProteinAdapter;

impl FormatAdapter for ProteinAdapter {
    type Record = FastaRecord;

    fn suffix(&self) -> &'static str {
        FAA
    }

    fn read(&self, path: &Path) -> Result<Records<Self::Record>, FilterError> {
        Ok(Box::new(FastaReader {
            cursor: LineCursor::open(path)?,
        }))
    }

    // normalized two-line form
    fn write<W: Write>(&self, writer: &mut W, record: &Self::Record) -> Result<(), FilterError> {
        writeln!(
            writer,
            ">{}\n{}",
            record.description,
            record.sequence.concat()
        )?;
        Ok(())
    }
}
