use clap::{ArgAction, Parser, Subcommand};
use config::{
    check_range, ArgCheck, FilterError, INTRAPRIMING_RANGE, INTRAPRIMING_THRESHOLD,
    MAX_CLASS_SIZE, MAX_DIST_TO_KNOWN_END, MIN_JUNCTION_COVERAGE, ML_PROBABILITY_RANGE,
    ML_PROBABILITY_THRESHOLD, ML_SCRIPT, ML_TIMEOUT_SECS, PERCENT_TRAINING,
    PERCENT_TRAINING_RANGE, RSCRIPT, RUN_A_LENGTH, RUN_A_LENGTH_RANGE, VERSION,
};
use std::path::PathBuf;

use crate::core::propagate::{Companion, CompanionKind};

#[derive(Parser, Debug)]
#[command(version = VERSION, about, long_about = None)]
pub struct Args {
    #[command(subcommand)]
    pub command: SubArgs,

    #[arg(
        short = 't',
        long = "threads",
        help = "Number of threads",
        value_name = "THREADS",
        default_value_t = num_cpus::get()
    )]
    pub threads: usize,
}

impl Args {
    pub fn from(args: Vec<String>) -> Self {
        let mut full_args = vec![env!("CARGO_PKG_NAME").to_string()];
        full_args.extend(args);

        Args::parse_from(full_args)
    }
}

#[derive(Debug, Subcommand)]
pub enum SubArgs {
    #[command(name = "rules", about = "Rules filter over SQANTI3 attributes")]
    Rules {
        #[command(flatten)]
        args: RulesArgs,
    },
    #[command(name = "ml", alias = "ML", about = "Machine-learning filter [external]")]
    Ml {
        #[command(flatten)]
        args: MlArgs,
    },
}

#[derive(Debug, Parser, Clone)]
pub struct CommonArgs {
    #[arg(
        required = true,
        value_name = "PATH",
        help = "SQANTI3 QC classification file"
    )]
    pub classification: PathBuf,

    #[arg(
        long = "isoforms",
        required = false,
        value_name = "PATH",
        help = "fasta/fastq isoform file to be filtered"
    )]
    pub isoforms: Option<PathBuf>,

    #[arg(
        long = "gtf",
        required = false,
        value_name = "PATH",
        help = "GTF file to be filtered"
    )]
    pub gtf: Option<PathBuf>,

    #[arg(
        long = "sam",
        required = false,
        value_name = "PATH",
        help = "SAM alignment of the input fasta/fastq"
    )]
    pub sam: Option<PathBuf>,

    #[arg(
        long = "faa",
        required = false,
        value_name = "PATH",
        help = "ORF prediction faa file to be filtered"
    )]
    pub faa: Option<PathBuf>,

    #[arg(
        short = 'o',
        long = "output",
        required = false,
        value_name = "PREFIX",
        help = "Prefix for output files [default: classification name]"
    )]
    pub output: Option<String>,

    #[arg(
        short = 'd',
        long = "dir",
        required = false,
        value_name = "PATH",
        help = "Directory for output files [default: classification directory]"
    )]
    pub dir: Option<PathBuf>,

    #[arg(
        short = 'i',
        long = "intrapriming",
        help = "Adenine fraction at genomic 3' end to flag an isoform as intra-priming",
        value_name = "FRACTION",
        default_value_t = INTRAPRIMING_THRESHOLD,
        action = ArgAction::Set
    )]
    pub intrapriming: f32,

    #[arg(
        short = 'e',
        long = "filter-mono-exonic",
        alias = "filter_mono_exonic",
        required = false,
        value_name = "FLAG",
        help = "Filter out all mono-exonic transcripts",
        default_missing_value("true"),
        default_value("false"),
        num_args(0..=1),
        require_equals(true),
        action = ArgAction::Set,
    )]
    pub filter_mono_exonic: bool,
}

impl CommonArgs {
    /// declared companion files, in a fixed format order
    pub fn companions(&self) -> Vec<Companion> {
        [
            (CompanionKind::Sequence, &self.isoforms),
            (CompanionKind::Annotation, &self.gtf),
            (CompanionKind::Alignment, &self.sam),
            (CompanionKind::Protein, &self.faa),
        ]
        .into_iter()
        .filter_map(|(kind, path)| {
            path.as_ref().map(|p| Companion {
                kind,
                path: p.clone(),
            })
        })
        .collect()
    }

    fn declared(&self) -> Vec<&PathBuf> {
        [&self.isoforms, &self.gtf, &self.sam, &self.faa]
            .into_iter()
            .flatten()
            .collect()
    }
}

#[derive(Debug, Parser, Clone)]
pub struct RulesArgs {
    #[command(flatten)]
    pub common: CommonArgs,

    #[arg(
        short = 'r',
        long = "run-a-length",
        alias = "runAlength",
        help = "Continuous run-A length at genomic 3' end to flag an isoform as intra-priming",
        value_name = "LENGTH",
        default_value_t = RUN_A_LENGTH,
        action = ArgAction::Set
    )]
    pub run_a_length: u32,

    #[arg(
        short = 'm',
        long = "max-dist-to-known-end",
        alias = "max_dist_to_known_end",
        help = "Maximum distance to an annotated 3' end to preserve as a valid 3' end",
        value_name = "DISTANCE",
        default_value_t = MAX_DIST_TO_KNOWN_END,
        action = ArgAction::Set
    )]
    pub max_dist_to_known_end: u32,

    #[arg(
        short = 'c',
        long = "min-cov",
        alias = "min_cov",
        help = "Minimum junction coverage for each isoform [only used if min_cov is not NA]",
        value_name = "COVERAGE",
        default_value_t = MIN_JUNCTION_COVERAGE,
        action = ArgAction::Set
    )]
    pub min_cov: u32,
}

impl ArgCheck for RulesArgs {
    fn check_params(&self) -> Result<(), FilterError> {
        check_range("intrapriming", self.common.intrapriming, INTRAPRIMING_RANGE)?;
        check_range("runAlength", self.run_a_length, RUN_A_LENGTH_RANGE)
    }

    fn get_classification(&self) -> &PathBuf {
        &self.common.classification
    }

    fn get_companions(&self) -> Vec<&PathBuf> {
        self.common.declared()
    }
}

#[derive(Debug, Parser, Clone)]
pub struct MlArgs {
    #[command(flatten)]
    pub common: CommonArgs,

    #[arg(
        short = 't',
        long = "percent-training",
        alias = "percent_training",
        help = "Proportion of the data that goes to training",
        value_name = "FRACTION",
        default_value_t = PERCENT_TRAINING,
        action = ArgAction::Set
    )]
    pub percent_training: f32,

    #[arg(
        short = 'p',
        long = "tp",
        alias = "TP",
        required = false,
        value_name = "PATH",
        help = "List of true positive transcripts, one ID by line, no header"
    )]
    pub tp: Option<PathBuf>,

    #[arg(
        short = 'n',
        long = "tn",
        alias = "TN",
        required = false,
        value_name = "PATH",
        help = "List of true negative transcripts, one ID by line, no header"
    )]
    pub tn: Option<PathBuf>,

    #[arg(
        short = 'j',
        long = "threshold",
        help = "Probability threshold to classify transcripts as positive isoforms",
        value_name = "PROBABILITY",
        default_value_t = ML_PROBABILITY_THRESHOLD,
        action = ArgAction::Set
    )]
    pub threshold: f32,

    #[arg(
        short = 'f',
        long = "force-fsm-in",
        alias = "force_fsm_in",
        required = false,
        value_name = "FLAG",
        help = "Force all FSM transcripts into the retained set",
        default_missing_value("true"),
        default_value("false"),
        num_args(0..=1),
        require_equals(true),
        action = ArgAction::Set,
    )]
    pub force_fsm_in: bool,

    #[arg(
        long = "intermediate-files",
        alias = "intermediate_files",
        required = false,
        value_name = "FLAG",
        help = "Output the ML filter intermediate files",
        default_missing_value("true"),
        default_value("false"),
        num_args(0..=1),
        require_equals(true),
        action = ArgAction::Set,
    )]
    pub intermediate_files: bool,

    #[arg(
        short = 'r',
        long = "remove-columns",
        alias = "remove_columns",
        required = false,
        value_name = "PATH",
        help = "Single-column file with classification columns to exclude from training"
    )]
    pub remove_columns: Option<PathBuf>,

    #[arg(
        short = 'z',
        long = "max-class-size",
        alias = "max_class_size",
        help = "Maximum number of isoforms in the TP and TN sets",
        value_name = "SIZE",
        default_value_t = MAX_CLASS_SIZE,
        action = ArgAction::Set
    )]
    pub max_class_size: usize,

    #[arg(
        long = "rscript",
        help = "Interpreter used to run the ML filter",
        value_name = "PATH",
        default_value = RSCRIPT
    )]
    pub rscript: PathBuf,

    #[arg(
        long = "script",
        help = "ML filter script",
        value_name = "PATH",
        default_value = ML_SCRIPT
    )]
    pub script: PathBuf,

    #[arg(
        long = "timeout",
        help = "Seconds to wait for the ML filter before aborting",
        value_name = "SECONDS",
        default_value_t = ML_TIMEOUT_SECS,
        action = ArgAction::Set
    )]
    pub timeout: u64,
}

impl ArgCheck for MlArgs {
    fn check_params(&self) -> Result<(), FilterError> {
        check_range("intrapriming", self.common.intrapriming, INTRAPRIMING_RANGE)?;
        check_range(
            "percent_training",
            self.percent_training,
            PERCENT_TRAINING_RANGE,
        )?;
        check_range("threshold", self.threshold, ML_PROBABILITY_RANGE)?;

        for side in [&self.tp, &self.tn, &self.remove_columns].into_iter().flatten() {
            config::validate(side)?;
        }

        Ok(())
    }

    fn get_classification(&self) -> &PathBuf {
        &self.common.classification
    }

    fn get_companions(&self) -> Vec<&PathBuf> {
        self.common.declared()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_version_string() {
        assert_eq!(Args::command().get_version(), Some(VERSION));
        assert_eq!(VERSION, env!("CARGO_PKG_VERSION"));
    }

    #[test]
    fn test_rules_defaults() {
        let args = Args::from(vec!["rules".into(), "sample_classification.txt".into()]);

        match args.command {
            SubArgs::Rules { args } => {
                assert_eq!(args.common.intrapriming, 0.6);
                assert_eq!(args.run_a_length, 6);
                assert_eq!(args.max_dist_to_known_end, 50);
                assert_eq!(args.min_cov, 3);
                assert!(!args.common.filter_mono_exonic);
                assert!(args.common.companions().is_empty());
            }
            SubArgs::Ml { .. } => panic!("expected rules subcommand"),
        }
    }

    #[test]
    fn test_rules_companions_keep_format_order() {
        let args = Args::from(
            [
                "rules",
                "sample_classification.txt",
                "--faa",
                "sample.faa",
                "--isoforms",
                "sample.fasta",
                "--filter-mono-exonic",
            ]
            .iter()
            .map(|s| s.to_string())
            .collect(),
        );

        let SubArgs::Rules { args } = args.command else {
            panic!("expected rules subcommand");
        };

        let kinds: Vec<CompanionKind> = args.common.companions().iter().map(|c| c.kind).collect();
        assert_eq!(kinds, vec![CompanionKind::Sequence, CompanionKind::Protein]);
        assert!(args.common.filter_mono_exonic);
    }

    #[test]
    fn test_rules_range_checks() {
        let args = Args::from(
            ["rules", "x_classification.txt", "-i", "0.24"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
        );
        let SubArgs::Rules { args } = args.command else {
            panic!("expected rules subcommand");
        };
        assert!(matches!(
            args.check_params(),
            Err(FilterError::InvalidParameter { .. })
        ));

        let args = Args::from(
            ["rules", "x_classification.txt", "-r", "21"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
        );
        let SubArgs::Rules { args } = args.command else {
            panic!("expected rules subcommand");
        };
        assert!(args.check_params().is_err());
    }

    #[test]
    fn test_ml_range_checks() {
        let args = Args::from(
            ["ml", "x_classification.txt", "-t", "1.5"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
        );
        let SubArgs::Ml { args } = args.command else {
            panic!("expected ml subcommand");
        };

        assert_eq!(args.threshold, 0.7);
        assert_eq!(args.max_class_size, 3000);
        assert!(matches!(
            args.check_params(),
            Err(FilterError::InvalidParameter { .. })
        ));
    }

    #[test]
    fn test_missing_companion_is_reported_with_path() {
        let mut classification = tempfile::NamedTempFile::new().unwrap();
        std::io::Write::write_all(&mut classification, b"isoform\n").unwrap();

        let args = Args::from(vec![
            "rules".into(),
            classification.path().display().to_string(),
            "--gtf".into(),
            "/nonexistent/sample.gtf".into(),
        ]);
        let SubArgs::Rules { args } = args.command else {
            panic!("expected rules subcommand");
        };

        match args.check() {
            Err(FilterError::MissingCompanionFile(path)) => {
                assert_eq!(path, PathBuf::from("/nonexistent/sample.gtf"))
            }
            other => panic!("unexpected result: {:?}", other),
        }
    }
}
