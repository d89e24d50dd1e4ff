//! Shared constants and helpers for iso-filter
//! Alejandro Gonzales-Irribarren, 2025
//!
//! Universal defaults, valid parameter ranges and output
//! file names used across the filtering pipeline, plus
//! the error taxonomy and argument checks every subcommand
//! goes through before touching any data.

pub mod fns;
pub use fns::*;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

// rules defaults
pub const INTRAPRIMING_THRESHOLD: f32 = 0.6;
pub const RUN_A_LENGTH: u32 = 6;
pub const MIN_JUNCTION_COVERAGE: u32 = 3;
pub const MAX_DIST_TO_KNOWN_END: u32 = 50; // 50bp

// ml defaults
pub const PERCENT_TRAINING: f32 = 0.8;
pub const ML_PROBABILITY_THRESHOLD: f32 = 0.7;
pub const MAX_CLASS_SIZE: usize = 3000;
pub const ML_TIMEOUT_SECS: u64 = 21600; // 6h

// valid ranges [inclusive]
pub const INTRAPRIMING_RANGE: (f32, f32) = (0.25, 1.0);
pub const RUN_A_LENGTH_RANGE: (u32, u32) = (4, 20);
pub const PERCENT_TRAINING_RANGE: (f32, f32) = (0.0, 1.0);
pub const ML_PROBABILITY_RANGE: (f32, f32) = (0.0, 1.0);

// sentinels
pub const NA: &str = "NA";
pub const CANONICAL: &str = "canonical";

// external programs
pub const RSCRIPT: &str = "Rscript";
pub const ML_SCRIPT: &str = "SQANTI3_MLfilter.R";

// file names
pub const CLASSIFICATION_SUFFIX: &str = "_classification.txt";
pub const INCLUSION_LIST: &str = "_inclusion-list.txt";
pub const FILTER_SUMMARY: &str = "_filter_summary.json";
pub const FILTER_RESULT_COLUMN: &str = "filter_result";
pub const FILTERED: &str = "filtered";

// companion suffixes
pub const FASTA: &str = "fasta";
pub const FASTQ: &str = "fastq";
pub const GTF: &str = "gtf";
pub const SAM: &str = "sam";
pub const FAA: &str = "faa";
pub const GZ: &str = "gz";
