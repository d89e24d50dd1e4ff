use config::{FilterError, CANONICAL, GZ, NA};
use flate2::read::MultiGzDecoder;
use hashbrown::{HashMap, HashSet};

use std::fmt;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};
use std::str::FromStr;

use crate::core::rules::RulesParameters;

// classification columns
pub const ISOFORM: &str = "isoform";
pub const STRUCTURAL_CATEGORY: &str = "structural_category";
pub const EXONS: &str = "exons";
pub const PERC_A_DOWNSTREAM: &str = "perc_A_downstream_TTS";
pub const SEQ_A_DOWNSTREAM: &str = "seq_A_downstream_TTS";
pub const POLYA_MOTIF: &str = "polyA_motif";
pub const RTS_STAGE: &str = "RTS_stage";
pub const ALL_CANONICAL: &str = "all_canonical";
pub const MIN_COV: &str = "min_cov";
pub const DIFF_TO_GENE_TTS: &str = "diff_to_gene_TTS";

const REQUIRED_COLUMNS: [&str; 9] = [
    ISOFORM,
    STRUCTURAL_CATEGORY,
    EXONS,
    PERC_A_DOWNSTREAM,
    POLYA_MOTIF,
    RTS_STAGE,
    ALL_CANONICAL,
    MIN_COV,
    DIFF_TO_GENE_TTS,
];

/// open a file for line reading, decompressing .gz inputs on the fly
pub fn open_reader<P: AsRef<Path>>(path: P) -> Result<Box<dyn BufRead + Send>, FilterError> {
    let path = path.as_ref();
    let file = File::open(path)?;

    match path.extension() {
        Some(ext) if ext == GZ => Ok(Box::new(BufReader::new(MultiGzDecoder::new(file)))),
        _ => Ok(Box::new(BufReader::new(file))),
    }
}

/// SQANTI3 structural categories
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum StructuralCategory {
    FullSpliceMatch,
    IncompleteSpliceMatch,
    NovelInCatalog,
    NovelNotInCatalog,
    Antisense,
    Intergenic,
    Genic,
    GenicIntron,
    Fusion,
    MoreJunctions,
    Unknown(String),
}

impl From<&str> for StructuralCategory {
    fn from(s: &str) -> Self {
        match s {
            "full-splice_match" | "FSM" => StructuralCategory::FullSpliceMatch,
            "incomplete-splice_match" | "ISM" => StructuralCategory::IncompleteSpliceMatch,
            "novel_in_catalog" | "NIC" => StructuralCategory::NovelInCatalog,
            "novel_not_in_catalog" | "NNC" => StructuralCategory::NovelNotInCatalog,
            "antisense" => StructuralCategory::Antisense,
            "intergenic" => StructuralCategory::Intergenic,
            "genic" => StructuralCategory::Genic,
            "genic_intron" => StructuralCategory::GenicIntron,
            "fusion" => StructuralCategory::Fusion,
            "moreJunctions" => StructuralCategory::MoreJunctions,
            other => StructuralCategory::Unknown(other.to_string()),
        }
    }
}

impl fmt::Display for StructuralCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            StructuralCategory::FullSpliceMatch => "full-splice_match",
            StructuralCategory::IncompleteSpliceMatch => "incomplete-splice_match",
            StructuralCategory::NovelInCatalog => "novel_in_catalog",
            StructuralCategory::NovelNotInCatalog => "novel_not_in_catalog",
            StructuralCategory::Antisense => "antisense",
            StructuralCategory::Intergenic => "intergenic",
            StructuralCategory::Genic => "genic",
            StructuralCategory::GenicIntron => "genic_intron",
            StructuralCategory::Fusion => "fusion",
            StructuralCategory::MoreJunctions => "moreJunctions",
            StructuralCategory::Unknown(label) => label.as_str(),
        };

        write!(f, "{}", label)
    }
}

/// one row of the classification table
#[derive(Debug, Clone, PartialEq)]
pub struct IsoformRecord {
    pub id: String,
    pub category: StructuralCategory,
    pub exons: u32,
    pub perc_a_downstream: Option<f32>,
    pub seq_a_downstream: Option<String>,
    pub polya_motif: Option<String>,
    pub rts_stage: bool,
    pub all_canonical: bool,
    pub min_cov: Option<u32>,
    pub diff_to_gene_tts: Option<i64>,
    pub line: String,
}

/// pre-thresholded booleans consumed by the rules engine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct IsoformFlags {
    pub intrapriming: bool,
    pub has_polya_motif: bool,
    pub is_rt_switching: bool,
    pub all_junctions_canonical: bool,
    pub all_junctions_short_read_supported: bool,
    pub is_mono_exonic: bool,
}

impl IsoformRecord {
    /// derive the engine flags under a given parameter set
    pub fn flags(&self, params: &RulesParameters) -> IsoformFlags {
        let valid_3prime_end = self
            .diff_to_gene_tts
            .is_some_and(|d| d.unsigned_abs() <= params.max_distance_to_known_end as u64);

        // strictly above the percentage threshold
        let adenine_rich = self
            .perc_a_downstream
            .is_some_and(|p| f64::from(p) > f64::from(params.intrapriming_threshold) * 100.0);
        let run_a = self
            .seq_a_downstream
            .as_deref()
            .is_some_and(|s| longest_a_run(s) >= params.run_a_length as usize);

        IsoformFlags {
            intrapriming: (adenine_rich || run_a) && !valid_3prime_end,
            has_polya_motif: self.polya_motif.is_some(),
            is_rt_switching: self.rts_stage,
            all_junctions_canonical: self.all_canonical,
            // NA coverage means no short-read data at all
            all_junctions_short_read_supported: self
                .min_cov
                .is_some_and(|c| c >= params.min_junction_coverage),
            is_mono_exonic: self.exons == 1,
        }
    }
}

/// longest run of adenines in a downstream genomic sequence
pub fn longest_a_run(seq: &str) -> usize {
    seq.bytes()
        .fold((0, 0), |(best, current), b| {
            if b == b'A' || b == b'a' {
                (best.max(current + 1), current + 1)
            } else {
                (best, 0)
            }
        })
        .0
}

/// classification table, rows in input order
#[derive(Debug, Clone)]
pub struct ClassificationTable {
    pub path: PathBuf,
    pub header: String,
    pub records: Vec<IsoformRecord>,
}

impl ClassificationTable {
    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn ids(&self) -> impl Iterator<Item = &str> {
        self.records.iter().map(|r| r.id.as_str())
    }
}

struct ColumnIndex {
    columns: HashMap<String, usize>,
}

impl ColumnIndex {
    fn new(header: &str, path: &Path) -> Result<Self, FilterError> {
        let columns: HashMap<String, usize> = header
            .split('\t')
            .enumerate()
            .map(|(i, c)| (c.trim().to_string(), i))
            .collect();

        for column in REQUIRED_COLUMNS {
            if !columns.contains_key(column) {
                return Err(FilterError::malformed(
                    path,
                    1,
                    format!("missing required column '{}'", column),
                ));
            }
        }

        Ok(Self { columns })
    }

    fn get(&self, column: &str) -> Option<usize> {
        self.columns.get(column).copied()
    }
}

/// parse a SQANTI3-like classification table
pub fn read_classification<P: AsRef<Path>>(path: P) -> Result<ClassificationTable, FilterError> {
    let path = path.as_ref();
    let mut lines = open_reader(path)?.lines();

    let header = match lines.next() {
        Some(line) => line?,
        None => return Err(FilterError::malformed(path, 1, "missing header row")),
    };
    let header = header.trim_end_matches('\r').to_string();
    let index = ColumnIndex::new(&header, path)?;

    let mut records = Vec::new();
    let mut seen = HashSet::new();

    for (i, line) in lines.enumerate() {
        let line = line?;
        let line = line.trim_end_matches('\r');
        let lineno = i + 2;

        if line.trim().is_empty() {
            continue;
        }

        let record = parse_row(line, &index, path, lineno)?;
        if !seen.insert(record.id.clone()) {
            return Err(FilterError::malformed(
                path,
                lineno,
                format!("duplicated isoform id '{}'", record.id),
            ));
        }

        records.push(record);
    }

    log::info!(
        "Classification records parsed from {}: {}",
        path.display(),
        records.len()
    );

    Ok(ClassificationTable {
        path: path.to_path_buf(),
        header,
        records,
    })
}

fn parse_row(
    line: &str,
    index: &ColumnIndex,
    path: &Path,
    lineno: usize,
) -> Result<IsoformRecord, FilterError> {
    let fields: Vec<&str> = line.split('\t').collect();
    let field = |column: &'static str| value_of(&fields, index, column, path, lineno);

    let malformed = |column: &str, value: &str| {
        FilterError::malformed(
            path,
            lineno,
            format!("cannot coerce '{}' in column '{}'", value, column),
        )
    };

    let id = field(ISOFORM)?;
    if id.is_empty() {
        return Err(FilterError::malformed(path, lineno, "empty isoform id"));
    }

    let category = StructuralCategory::from(field(STRUCTURAL_CATEGORY)?);

    let exons = field(EXONS)?;
    let exons = exons.parse::<u32>().map_err(|_| malformed(EXONS, exons))?;

    let perc_a = field(PERC_A_DOWNSTREAM)?;
    let perc_a_downstream =
        parse_optional::<f32>(perc_a).map_err(|_| malformed(PERC_A_DOWNSTREAM, perc_a))?;

    let min_cov = field(MIN_COV)?;
    let min_cov = parse_optional::<u32>(min_cov).map_err(|_| malformed(MIN_COV, min_cov))?;

    let diff = field(DIFF_TO_GENE_TTS)?;
    let diff_to_gene_tts =
        parse_optional::<i64>(diff).map_err(|_| malformed(DIFF_TO_GENE_TTS, diff))?;

    let rts = field(RTS_STAGE)?;
    let rts_stage = match rts {
        "TRUE" | "True" | "true" => true,
        "FALSE" | "False" | "false" | NA | "" => false,
        other => return Err(malformed(RTS_STAGE, other)),
    };

    let canonical = field(ALL_CANONICAL)?;
    let all_canonical = match canonical {
        CANONICAL => true,
        "non_canonical" | NA | "" => false,
        other => return Err(malformed(ALL_CANONICAL, other)),
    };

    let polya_motif = optional_text(field(POLYA_MOTIF)?);

    // older tables do not carry the downstream sequence
    let seq_a_downstream = index
        .get(SEQ_A_DOWNSTREAM)
        .and_then(|i| fields.get(i))
        .and_then(|s| optional_text(s.trim()));

    Ok(IsoformRecord {
        id: id.to_string(),
        category,
        exons,
        perc_a_downstream,
        seq_a_downstream,
        polya_motif,
        rts_stage,
        all_canonical,
        min_cov,
        diff_to_gene_tts,
        line: line.to_string(),
    })
}

fn value_of<'a>(
    fields: &[&'a str],
    index: &ColumnIndex,
    column: &'static str,
    path: &Path,
    lineno: usize,
) -> Result<&'a str, FilterError> {
    index
        .get(column)
        .and_then(|i| fields.get(i).copied())
        .map(str::trim)
        .ok_or_else(|| FilterError::malformed(path, lineno, format!("missing value for '{}'", column)))
}

fn parse_optional<T: FromStr>(value: &str) -> Result<Option<T>, T::Err> {
    match value {
        NA | "" => Ok(None),
        v => v.parse::<T>().map(Some),
    }
}

fn optional_text(value: &str) -> Option<String> {
    match value {
        NA | "" => None,
        v => Some(v.to_string()),
    }
}
