use indicatif::{ProgressBar, ProgressStyle};
use thiserror::Error;

use std::fmt::Display;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

// os
#[cfg(not(windows))]
const TICK_SETTINGS: (&str, u64) = ("⠋⠙⠹⠸⠼⠴⠦⠧⠇⠏ ", 80);
#[cfg(windows)]
const TICK_SETTINGS: (&str, u64) = (r"+-x| ", 200);

/// return a pre-configured progress bar
pub fn get_progress_bar(length: u64, msg: &str) -> ProgressBar {
    let progress_bar = ProgressBar::new(length);

    if let Ok(style) = ProgressStyle::default_spinner()
        .tick_chars(TICK_SETTINGS.0)
        .template(" {spinner} {msg:<30} {wide_bar} ETA {eta_precise} ")
    {
        progress_bar.set_style(style);
    }

    progress_bar.enable_steady_tick(Duration::from_millis(TICK_SETTINGS.1));
    progress_bar.set_message(msg.to_owned());

    progress_bar
}

/// write one identifier per line, keeping the order of the iterator
pub fn write_ids<I, T>(ids: I, fname: &Path) -> Result<usize, FilterError>
where
    I: IntoIterator<Item = T>,
    T: AsRef<str>,
{
    let f = File::create(fname)?;
    let mut writer = BufWriter::new(f);

    let mut count = 0;
    for id in ids {
        writeln!(writer, "{}", id.as_ref())?;
        count += 1;
    }
    writer.flush()?;

    log::info!("Identifiers in {}: {}", fname.display(), count);
    Ok(count)
}

/// error taxonomy for the whole filtering run
#[derive(Debug, Error)]
pub enum FilterError {
    #[error("Invalid input: {0}")]
    InvalidInput(String),
    #[error("Malformed input at {path:?}, line {line}: {reason}")]
    MalformedInput {
        path: PathBuf,
        line: usize,
        reason: String,
    },
    #[error("Invalid parameter: {name} must be within [{min}, {max}], instead given {value}")]
    InvalidParameter {
        name: &'static str,
        value: String,
        min: String,
        max: String,
    },
    #[error("Companion file {0:?} does not exist")]
    MissingCompanionFile(PathBuf),
    #[error("External classifier produced no output at {0:?}")]
    MissingOutput(PathBuf),
    #[error("External classifier failed: {0}")]
    ExternalClassifier(String),
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

impl FilterError {
    pub fn malformed<P: AsRef<Path>>(path: P, line: usize, reason: impl Into<String>) -> Self {
        FilterError::MalformedInput {
            path: path.as_ref().to_path_buf(),
            line,
            reason: reason.into(),
        }
    }

    /// distinguishable non-zero process status per error kind
    pub fn exit_code(&self) -> i32 {
        match self {
            FilterError::InvalidInput(_) => 2,
            FilterError::MalformedInput { .. } => 3,
            FilterError::InvalidParameter { .. } => 4,
            FilterError::MissingCompanionFile(_) => 5,
            FilterError::MissingOutput(_) => 6,
            FilterError::ExternalClassifier(_) => 7,
            FilterError::IoError(_) => 8,
        }
    }
}

/// inclusive range check for numeric parameters
pub fn check_range<T>(name: &'static str, value: T, range: (T, T)) -> Result<(), FilterError>
where
    T: PartialOrd + Display + Copy,
{
    // NaN fails both comparisons, so it is rejected here too
    if value >= range.0 && value <= range.1 {
        Ok(())
    } else {
        Err(FilterError::InvalidParameter {
            name,
            value: value.to_string(),
            min: range.0.to_string(),
            max: range.1.to_string(),
        })
    }
}

/// argument checker for all subcommands
pub trait ArgCheck {
    fn check(&self) -> Result<(), FilterError> {
        self.validate_args()
    }

    fn validate_args(&self) -> Result<(), FilterError> {
        validate(self.get_classification())?;
        self.check_companions()?;
        self.check_params()
    }

    fn check_companions(&self) -> Result<(), FilterError> {
        let companions = self.get_companions();

        if companions.is_empty() {
            log::warn!("No companion files provided. Only the classification will be filtered...");
        }

        for companion in companions {
            if !companion.exists() {
                return Err(FilterError::MissingCompanionFile(companion.clone()));
            }
        }

        Ok(())
    }

    fn check_params(&self) -> Result<(), FilterError>;
    fn get_classification(&self) -> &PathBuf;
    fn get_companions(&self) -> Vec<&PathBuf>;
}

/// argument validation
pub fn validate(arg: &PathBuf) -> Result<(), FilterError> {
    if !arg.exists() {
        return Err(FilterError::InvalidInput(format!("{:?} does not exist", arg)));
    }

    if !arg.is_file() {
        return Err(FilterError::InvalidInput(format!("{:?} is not a file", arg)));
    }

    match std::fs::metadata(arg) {
        Ok(metadata) if metadata.len() == 0 => {
            Err(FilterError::InvalidInput(format!("file {:?} is empty", arg)))
        }
        Ok(_) => Ok(()),
        Err(e) => Err(FilterError::IoError(e)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_check_range_bounds_are_inclusive() {
        assert!(check_range("intrapriming", 0.25f32, (0.25, 1.0)).is_ok());
        assert!(check_range("intrapriming", 1.0f32, (0.25, 1.0)).is_ok());
        assert!(check_range("intrapriming", 0.24f32, (0.25, 1.0)).is_err());
        assert!(check_range("intrapriming", 1.01f32, (0.25, 1.0)).is_err());
        assert!(check_range("intrapriming", f32::NAN, (0.25, 1.0)).is_err());
    }

    #[test]
    fn test_check_range_reports_offending_value() {
        let err = check_range("runAlength", 21u32, (4, 20)).unwrap_err();

        assert_eq!(err.exit_code(), 4);
        assert_eq!(
            err.to_string(),
            "Invalid parameter: runAlength must be within [4, 20], instead given 21"
        );
    }

    #[test]
    fn test_validate_rejects_missing_and_empty_files() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("missing_classification.txt");
        assert!(matches!(
            validate(&missing),
            Err(FilterError::InvalidInput(_))
        ));

        let empty = dir.path().join("empty_classification.txt");
        File::create(&empty).unwrap();
        assert!(validate(&empty).is_err());

        let full = dir.path().join("full_classification.txt");
        let mut f = File::create(&full).unwrap();
        writeln!(f, "isoform\tstructural_category").unwrap();
        assert!(validate(&full).is_ok());
    }

    #[test]
    fn test_write_ids_keeps_order() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ids.txt");

        let n = write_ids(["PB.2.1", "PB.1.1", "PB.3.4"], &path).unwrap();

        assert_eq!(n, 3);
        assert_eq!(
            std::fs::read_to_string(&path).unwrap(),
            "PB.2.1\nPB.1.1\nPB.3.4\n"
        );
    }

    #[test]
    fn test_exit_codes_are_distinct() {
        let errors = [
            FilterError::InvalidInput(String::new()),
            FilterError::malformed("x", 1, "bad"),
            check_range("x", 5u32, (0, 1)).unwrap_err(),
            FilterError::MissingCompanionFile(PathBuf::from("x")),
            FilterError::MissingOutput(PathBuf::from("x")),
            FilterError::ExternalClassifier(String::new()),
            FilterError::IoError(std::io::Error::other("x")),
        ];

        let mut codes: Vec<i32> = errors.iter().map(|e| e.exit_code()).collect();
        codes.sort_unstable();
        codes.dedup();

        assert_eq!(codes.len(), errors.len());
        assert!(codes.iter().all(|c| *c != 0));
    }
}
