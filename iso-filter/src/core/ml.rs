use config::{
    check_range, FilterError, INTRAPRIMING_RANGE, ML_PROBABILITY_RANGE, PERCENT_TRAINING_RANGE,
};

use std::fs::File;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::time::{Duration, Instant};

use crate::cli::MlArgs;
use crate::core::{IsoformClassifier, RetentionSet, RunConfig};
use crate::utils::ClassificationTable;

const POLL_INTERVAL: Duration = Duration::from_millis(100);
const ML_LOG: &str = "_MLfilter.log";

/// parameters forwarded verbatim to the external ML filter
#[derive(Debug, Clone, PartialEq)]
pub struct MlParameters {
    pub percent_training: f32,
    pub threshold: f32,
    pub intrapriming: f32,
    pub force_fsm_in: bool,
    pub filter_mono_exonic: bool,
    pub intermediate_files: bool,
    pub max_class_size: usize,
    pub tp: Option<PathBuf>,
    pub tn: Option<PathBuf>,
    pub remove_columns: Option<PathBuf>,
}

impl MlParameters {
    pub fn validate(&self) -> Result<(), FilterError> {
        check_range("intrapriming", self.intrapriming, INTRAPRIMING_RANGE)?;
        check_range(
            "percent_training",
            self.percent_training,
            PERCENT_TRAINING_RANGE,
        )?;
        check_range("threshold", self.threshold, ML_PROBABILITY_RANGE)
    }
}

impl TryFrom<&MlArgs> for MlParameters {
    type Error = FilterError;

    fn try_from(args: &MlArgs) -> Result<Self, Self::Error> {
        let params = MlParameters {
            percent_training: args.percent_training,
            threshold: args.threshold,
            intrapriming: args.common.intrapriming,
            force_fsm_in: args.force_fsm_in,
            filter_mono_exonic: args.common.filter_mono_exonic,
            intermediate_files: args.intermediate_files,
            max_class_size: args.max_class_size,
            tp: args.tp.clone(),
            tn: args.tn.clone(),
            remove_columns: args.remove_columns.clone(),
        };

        params.validate()?;
        Ok(params)
    }
}

/// statistical strategy: an opaque program that leaves an inclusion list behind
#[derive(Debug, Clone)]
pub struct ExternalClassifier {
    pub program: PathBuf,
    pub script: PathBuf,
    pub params: MlParameters,
    pub run: RunConfig,
    pub timeout: Duration,
}

impl ExternalClassifier {
    pub fn from_args(args: &MlArgs, run: RunConfig) -> Result<Self, FilterError> {
        Ok(Self {
            program: args.rscript.clone(),
            script: args.script.clone(),
            params: MlParameters::try_from(args)?,
            run,
            timeout: Duration::from_secs(args.timeout),
        })
    }

    fn command(&self, table: &Path) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.arg(&self.script)
            .arg("-c")
            .arg(table)
            .arg("-o")
            .arg(&self.run.prefix)
            .arg("-d")
            .arg(&self.run.outdir)
            .arg("-t")
            .arg(self.params.percent_training.to_string())
            .arg("-j")
            .arg(self.params.threshold.to_string())
            .arg("-i")
            .arg(self.params.intrapriming.to_string())
            .arg("-f")
            .arg(r_bool(self.params.force_fsm_in))
            .arg("-e")
            .arg(r_bool(self.params.filter_mono_exonic))
            .arg("-m")
            .arg(r_bool(self.params.intermediate_files))
            .arg("-z")
            .arg(self.params.max_class_size.to_string());

        if let Some(tp) = &self.params.tp {
            cmd.arg("-p").arg(tp);
        }
        if let Some(tn) = &self.params.tn {
            cmd.arg("-n").arg(tn);
        }
        if let Some(columns) = &self.params.remove_columns {
            cmd.arg("-r").arg(columns);
        }

        cmd
    }

    fn log_path(&self) -> PathBuf {
        self.run.outdir.join(format!("{}{}", self.run.prefix, ML_LOG))
    }
}

impl IsoformClassifier for ExternalClassifier {
    fn name(&self) -> &'static str {
        "ML"
    }

    fn classify(&self, table: &ClassificationTable) -> Result<RetentionSet, FilterError> {
        // a list left by an earlier run must not pass as this run's output
        let inclusion_list = self.run.inclusion_list();
        match std::fs::remove_file(&inclusion_list) {
            Ok(()) => log::warn!(
                "Removed stale inclusion list before running ML filter: {}",
                inclusion_list.display()
            ),
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }

        let log_path = self.log_path();
        let log = File::create(&log_path)?;

        let mut cmd = self.command(&table.path);
        cmd.stdin(Stdio::null())
            .stdout(Stdio::from(log.try_clone()?))
            .stderr(Stdio::from(log));

        log::info!("Running ML filter: {:?}", cmd);

        let mut child = cmd.spawn().map_err(|e| {
            FilterError::ExternalClassifier(format!(
                "cannot launch {}: {}",
                self.program.display(),
                e
            ))
        })?;

        let status = wait_with_timeout(&mut child, self.timeout)?;
        if !status.success() {
            return Err(FilterError::ExternalClassifier(format!(
                "{} exited with {}. See {}",
                self.program.display(),
                status,
                log_path.display()
            )));
        }

        if !inclusion_list.exists() {
            return Err(FilterError::MissingOutput(inclusion_list));
        }

        RetentionSet::from_inclusion_list(&inclusion_list, table)
    }
}

fn r_bool(flag: bool) -> &'static str {
    if flag {
        "TRUE"
    } else {
        "FALSE"
    }
}

/// block until the child exits; kill it once the timeout elapses
fn wait_with_timeout(child: &mut Child, timeout: Duration) -> Result<ExitStatus, FilterError> {
    let start = Instant::now();

    loop {
        if let Some(status) = child.try_wait()? {
            return Ok(status);
        }

        if start.elapsed() >= timeout {
            if let Err(e) = child.kill() {
                log::error!("Could not kill ML filter process: {}", e);
            }
            let _ = child.wait();

            return Err(FilterError::ExternalClassifier(format!(
                "timed out after {:?}",
                timeout
            )));
        }

        std::thread::sleep(POLL_INTERVAL);
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::utils::{IsoformRecord, StructuralCategory};
    use std::io::Write;

    fn params() -> MlParameters {
        MlParameters {
            percent_training: 0.8,
            threshold: 0.7,
            intrapriming: 0.6,
            force_fsm_in: false,
            filter_mono_exonic: false,
            intermediate_files: false,
            max_class_size: 3000,
            tp: None,
            tn: None,
            remove_columns: None,
        }
    }

    fn table(ids: &[&str]) -> ClassificationTable {
        ClassificationTable {
            path: PathBuf::from("sample_classification.txt"),
            header: String::from("isoform"),
            records: ids
                .iter()
                .map(|id| IsoformRecord {
                    id: id.to_string(),
                    category: StructuralCategory::FullSpliceMatch,
                    exons: 2,
                    perc_a_downstream: None,
                    seq_a_downstream: None,
                    polya_motif: None,
                    rts_stage: false,
                    all_canonical: true,
                    min_cov: None,
                    diff_to_gene_tts: None,
                    line: id.to_string(),
                })
                .collect(),
        }
    }

    fn classifier(dir: &Path, body: &str, timeout: Duration) -> ExternalClassifier {
        let script = dir.join("mlfilter.sh");
        let mut f = File::create(&script).unwrap();
        writeln!(f, "{}", body).unwrap();

        ExternalClassifier {
            program: PathBuf::from("sh"),
            script,
            params: params(),
            run: RunConfig {
                outdir: dir.to_path_buf(),
                prefix: "sample".to_string(),
            },
            timeout,
        }
    }

    const WRITES_LIST: &str = r#"
while getopts "c:o:d:t:j:i:f:e:m:z:p:n:r:" opt; do
  case $opt in
    o) out=$OPTARG ;;
    d) dir=$OPTARG ;;
  esac
done
printf 'PB.3.1\n\nPB.1.1\nPB.404.1\n' > "$dir/${out}_inclusion-list.txt"
"#;

    #[test]
    fn test_external_classifier_reads_inclusion_list() {
        let dir = tempfile::tempdir().unwrap();
        let classifier = classifier(dir.path(), WRITES_LIST, Duration::from_secs(30));

        let set = classifier
            .classify(&table(&["PB.1.1", "PB.2.1", "PB.3.1"]))
            .unwrap();

        assert_eq!(set.len(), 2);
        assert!(set.contains("PB.1.1"));
        assert!(set.contains("PB.3.1"));
        assert!(!set.contains("PB.2.1"));
        // not in the table
        assert!(!set.contains("PB.404.1"));
    }

    #[test]
    fn test_external_classifier_non_zero_exit_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let classifier = classifier(dir.path(), "exit 3", Duration::from_secs(30));

        let err = classifier.classify(&table(&["PB.1.1"])).unwrap_err();
        assert!(matches!(err, FilterError::ExternalClassifier(_)));
    }

    #[test]
    fn test_external_classifier_without_output() {
        let dir = tempfile::tempdir().unwrap();
        let classifier = classifier(dir.path(), "exit 0", Duration::from_secs(30));

        let err = classifier.classify(&table(&["PB.1.1"])).unwrap_err();
        assert!(matches!(err, FilterError::MissingOutput(_)));
        assert_eq!(err.exit_code(), 6);
    }

    #[test]
    fn test_stale_inclusion_list_is_not_reused() {
        let dir = tempfile::tempdir().unwrap();
        let classifier = classifier(dir.path(), "exit 0", Duration::from_secs(30));

        let stale = classifier.run.inclusion_list();
        std::fs::write(&stale, "PB.1.1\n").unwrap();

        let err = classifier.classify(&table(&["PB.1.1"])).unwrap_err();
        assert!(matches!(err, FilterError::MissingOutput(_)));
        assert!(!stale.exists());
    }

    #[test]
    fn test_rules_output_does_not_satisfy_ml_run() {
        use crate::core::rules::{RulesClassifier, RulesParameters};

        let dir = tempfile::tempdir().unwrap();
        let classifier = classifier(dir.path(), "exit 0", Duration::from_secs(30));
        let table = table(&["PB.1.1"]);

        let rules = RulesClassifier::new(
            RulesParameters::new(0.6, 6, 3, 50, false).unwrap(),
            classifier.run.clone(),
        );
        assert_eq!(rules.classify(&table).unwrap().len(), 1);
        assert!(classifier.run.inclusion_list().exists());

        let err = classifier.classify(&table).unwrap_err();
        assert!(matches!(err, FilterError::MissingOutput(_)));
    }

    #[test]
    fn test_external_classifier_timeout() {
        let dir = tempfile::tempdir().unwrap();
        let classifier = classifier(dir.path(), "sleep 10", Duration::from_millis(300));

        let start = Instant::now();
        let err = classifier.classify(&table(&["PB.1.1"])).unwrap_err();

        assert!(matches!(err, FilterError::ExternalClassifier(_)));
        assert!(start.elapsed() < Duration::from_secs(10));
    }

    #[test]
    fn test_command_carries_optional_inputs() {
        let dir = tempfile::tempdir().unwrap();
        let mut classifier = classifier(dir.path(), "exit 0", Duration::from_secs(1));
        classifier.params.tp = Some(PathBuf::from("tp.txt"));
        classifier.params.force_fsm_in = true;

        let cmd = classifier.command(Path::new("sample_classification.txt"));
        let args: Vec<String> = cmd
            .get_args()
            .map(|a| a.to_string_lossy().to_string())
            .collect();

        let pos = args.iter().position(|a| a == "-p").unwrap();
        assert_eq!(args[pos + 1], "tp.txt");
        let pos = args.iter().position(|a| a == "-f").unwrap();
        assert_eq!(args[pos + 1], "TRUE");
        assert!(!args.contains(&"-n".to_string()));
        assert!(!args.contains(&"-r".to_string()));
    }

    #[test]
    fn test_ml_parameters_ranges() {
        let mut p = params();
        assert!(p.validate().is_ok());

        p.percent_training = 1.2;
        assert!(p.validate().is_err());

        let mut p = params();
        p.intrapriming = 0.1;
        assert!(matches!(
            p.validate(),
            Err(FilterError::InvalidParameter { .. })
        ));
    }
}
