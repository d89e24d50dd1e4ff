//! Core module for filtering long-read isoforms
//! Alejandro Gonzales-Irribarren, 2025
//!
//! This module contains the main functions for deciding which
//! isoforms coming out of SQANTI3 QC are genuine and which ones
//! are artifacts, and for carrying that decision over to every
//! companion file of the run.
//!
//! In short, the module reads the classification table, builds a
//! retention set with one of two interchangeable strategies (a
//! rules engine over pre-computed QC attributes or an external
//! machine-learning filter) and streams the isoform sequences,
//! annotation, alignments and predicted proteins through their
//! format adapters, keeping only retained records. The annotated
//! classification, the inclusion list and a JSON summary are
//! written next to the filtered files.

pub mod ml;
pub mod propagate;
pub mod rules;

use config::{
    ArgCheck, FilterError, CLASSIFICATION_SUFFIX, FILTERED, FILTER_RESULT_COLUMN,
    FILTER_SUMMARY, INCLUSION_LIST,
};
use hashbrown::HashSet;
use serde::Serialize;

use std::collections::BTreeMap;
use std::fs::{create_dir_all, File};
use std::io::{BufRead, BufWriter, Write};
use std::path::{Path, PathBuf};

use crate::cli::{CommonArgs, SubArgs};
use crate::utils::{open_reader, read_classification, ClassificationTable};
use ml::ExternalClassifier;
use propagate::{propagate_all, Companion, FilteredOutput};
use rules::{RulesClassifier, RulesParameters};

const ISOFORM_LABEL: &str = "Isoform";
const ARTIFACT_LABEL: &str = "Artifact";

/// immutable output location of a run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunConfig {
    pub outdir: PathBuf,
    pub prefix: String,
}

impl RunConfig {
    /// resolve outdir/prefix defaults from the classification path
    pub fn new(
        classification: &Path,
        dir: Option<PathBuf>,
        output: Option<String>,
    ) -> Result<Self, FilterError> {
        let outdir = match dir {
            Some(dir) => dir,
            None => {
                let parent = classification
                    .parent()
                    .filter(|p| !p.as_os_str().is_empty())
                    .map(Path::to_path_buf)
                    .unwrap_or_else(|| PathBuf::from("."));
                log::warn!(
                    "Output directory not defined. All the outputs will be stored at {}",
                    parent.display()
                );
                parent
            }
        };

        if !outdir.exists() {
            create_dir_all(&outdir)?;
        }

        let prefix = match output {
            Some(prefix) => prefix,
            None => {
                let prefix = default_prefix(classification)?;
                log::warn!(
                    "Output name not defined. All the outputs will have the prefix {}",
                    prefix
                );
                prefix
            }
        };

        Ok(Self { outdir, prefix })
    }

    pub fn from_common(args: &CommonArgs) -> Result<Self, FilterError> {
        RunConfig::new(&args.classification, args.dir.clone(), args.output.clone())
    }

    /// <outdir>/<prefix>.filtered.<suffix>
    pub fn filtered_path(&self, suffix: &str) -> PathBuf {
        self.outdir
            .join(format!("{}.{}.{}", self.prefix, FILTERED, suffix))
    }

    /// <outdir>/<prefix>_inclusion-list.txt
    pub fn inclusion_list(&self) -> PathBuf {
        self.outdir
            .join(format!("{}{}", self.prefix, INCLUSION_LIST))
    }

    pub fn summary_path(&self) -> PathBuf {
        self.outdir
            .join(format!("{}{}", self.prefix, FILTER_SUMMARY))
    }

    pub fn classification_result(&self, strategy: &str) -> PathBuf {
        self.outdir.join(format!(
            "{}_{}Filter_result{}",
            self.prefix, strategy, CLASSIFICATION_SUFFIX
        ))
    }
}

fn default_prefix(classification: &Path) -> Result<String, FilterError> {
    let name = classification
        .file_name()
        .and_then(|f| f.to_str())
        .ok_or_else(|| {
            FilterError::InvalidInput(format!("cannot derive a prefix from {:?}", classification))
        })?;

    let prefix = match name.strip_suffix(CLASSIFICATION_SUFFIX) {
        Some(prefix) => prefix,
        None => Path::new(name)
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or(name),
    };

    Ok(prefix.to_string())
}

/// identifiers of the isoforms to keep
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RetentionSet {
    ids: HashSet<String>,
}

impl RetentionSet {
    pub fn contains(&self, id: &str) -> bool {
        self.ids.contains(id)
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    /// read a newline-delimited id list, keeping only ids known to the table
    pub fn from_inclusion_list(
        path: &Path,
        table: &ClassificationTable,
    ) -> Result<Self, FilterError> {
        let known: HashSet<&str> = table.ids().collect();
        let mut ids = HashSet::new();
        let mut unknown = 0;

        for line in open_reader(path)?.lines() {
            let line = line?;
            let id = line.trim();

            if id.is_empty() {
                continue;
            }

            if known.contains(id) {
                ids.insert(id.to_string());
            } else {
                unknown += 1;
            }
        }

        if unknown > 0 {
            log::warn!(
                "{} identifiers in {} are not in the classification table. Ignoring them...",
                unknown,
                path.display()
            );
        }

        log::info!("Isoforms in inclusion list: {}", ids.len());
        Ok(Self { ids })
    }
}

impl FromIterator<String> for RetentionSet {
    fn from_iter<I: IntoIterator<Item = String>>(iter: I) -> Self {
        Self {
            ids: iter.into_iter().collect(),
        }
    }
}

/// interchangeable strategies that end in a retention set
pub trait IsoformClassifier {
    fn name(&self) -> &'static str;
    fn classify(&self, table: &ClassificationTable) -> Result<RetentionSet, FilterError>;

    fn artifact_reasons(&self) -> Option<BTreeMap<String, u32>> {
        None
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CategoryTally {
    pub kept: usize,
    pub discarded: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FilterSummary {
    pub strategy: String,
    pub total: usize,
    pub retained: usize,
    pub discarded: usize,
    pub categories: BTreeMap<String, CategoryTally>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub artifact_reasons: Option<BTreeMap<String, u32>>,
    pub classification: PathBuf,
    pub inclusion_list: PathBuf,
    pub outputs: Vec<FilteredOutput>,
}

/// check arguments and dispatch to the selected strategy
pub fn filter_isoforms(command: SubArgs) -> Result<FilterSummary, FilterError> {
    match command {
        SubArgs::Rules { args } => {
            args.check()?;
            let params = RulesParameters::try_from(&args)?;
            let table = read_classification(&args.common.classification)?;
            let run = RunConfig::from_common(&args.common)?;

            let classifier = RulesClassifier::new(params, run.clone());
            run_filter(&classifier, &table, &args.common.companions(), &run)
        }
        SubArgs::Ml { args } => {
            args.check()?;
            let table = read_classification(&args.common.classification)?;
            let run = RunConfig::from_common(&args.common)?;

            let classifier = ExternalClassifier::from_args(&args, run.clone())?;
            run_filter(&classifier, &table, &args.common.companions(), &run)
        }
    }
}

/// classify, annotate and propagate with any strategy
pub fn run_filter<C: IsoformClassifier>(
    classifier: &C,
    table: &ClassificationTable,
    companions: &[Companion],
    run: &RunConfig,
) -> Result<FilterSummary, FilterError> {
    log::info!("Running {} filter over {} isoforms...", classifier.name(), table.len());

    let retained = classifier.classify(table)?;
    let classification = write_classification_result(table, &retained, run, classifier.name())?;
    let outputs = propagate_all(companions, run, &retained)?;

    let mut categories: BTreeMap<String, CategoryTally> = BTreeMap::new();
    for record in table.records.iter() {
        let tally = categories.entry(record.category.to_string()).or_default();
        if retained.contains(&record.id) {
            tally.kept += 1;
        } else {
            tally.discarded += 1;
        }
    }

    let summary = FilterSummary {
        strategy: classifier.name().to_string(),
        total: table.len(),
        retained: retained.len(),
        discarded: table.len() - retained.len(),
        categories,
        artifact_reasons: classifier.artifact_reasons(),
        classification,
        inclusion_list: run.inclusion_list(),
        outputs,
    };

    write_summary(&summary, &run.summary_path())?;
    log::info!(
        "Isoforms retained: {} | artifacts: {}",
        summary.retained,
        summary.discarded
    );

    Ok(summary)
}

/// copy the classification table with an extra filter_result column
fn write_classification_result(
    table: &ClassificationTable,
    retained: &RetentionSet,
    run: &RunConfig,
    strategy: &str,
) -> Result<PathBuf, FilterError> {
    let path = run.classification_result(strategy);
    let mut writer = BufWriter::new(File::create(&path)?);

    writeln!(writer, "{}\t{}", table.header, FILTER_RESULT_COLUMN)?;
    for record in table.records.iter() {
        let label = if retained.contains(&record.id) {
            ISOFORM_LABEL
        } else {
            ARTIFACT_LABEL
        };
        writeln!(writer, "{}\t{}", record.line, label)?;
    }

    writer.flush()?;
    log::info!("Annotated classification written to: {}", path.display());

    Ok(path)
}

fn write_summary(summary: &FilterSummary, path: &Path) -> Result<(), FilterError> {
    let mut writer = BufWriter::new(File::create(path)?);
    serde_json::to_writer_pretty(&mut writer, summary).map_err(std::io::Error::from)?;
    writeln!(writer)?;
    writer.flush()?;

    Ok(())
}
