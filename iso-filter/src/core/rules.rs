use config::{
    check_range, get_progress_bar, write_ids, FilterError, INTRAPRIMING_RANGE, RUN_A_LENGTH_RANGE,
};
use dashmap::{DashMap, DashSet};
use rayon::prelude::*;

use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};

use crate::cli::RulesArgs;
use crate::core::{IsoformClassifier, RetentionSet, RunConfig};
use crate::utils::{ClassificationTable, IsoformFlags, IsoformRecord, StructuralCategory};

/// thresholds of the rules filter, immutable for a run
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RulesParameters {
    pub intrapriming_threshold: f32,
    pub run_a_length: u32,
    pub min_junction_coverage: u32,
    pub max_distance_to_known_end: u32,
    pub filter_mono_exonic: bool,
}

impl RulesParameters {
    pub fn new(
        intrapriming_threshold: f32,
        run_a_length: u32,
        min_junction_coverage: u32,
        max_distance_to_known_end: u32,
        filter_mono_exonic: bool,
    ) -> Result<Self, FilterError> {
        check_range("intrapriming", intrapriming_threshold, INTRAPRIMING_RANGE)?;
        check_range("runAlength", run_a_length, RUN_A_LENGTH_RANGE)?;

        Ok(Self {
            intrapriming_threshold,
            run_a_length,
            min_junction_coverage,
            max_distance_to_known_end,
            filter_mono_exonic,
        })
    }
}

impl TryFrom<&RulesArgs> for RulesParameters {
    type Error = FilterError;

    fn try_from(args: &RulesArgs) -> Result<Self, Self::Error> {
        RulesParameters::new(
            args.common.intrapriming,
            args.run_a_length,
            args.min_cov,
            args.max_dist_to_known_end,
            args.common.filter_mono_exonic,
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ArtifactReason {
    IntraPriming,
    RtSwitching,
    UnsupportedJunctions,
    MonoExonic,
    UnhandledCategory,
}

impl fmt::Display for ArtifactReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let reason = match self {
            ArtifactReason::IntraPriming => "intra-priming",
            ArtifactReason::RtSwitching => "RT-switching",
            ArtifactReason::UnsupportedJunctions => "unsupported-junctions",
            ArtifactReason::MonoExonic => "mono-exonic",
            ArtifactReason::UnhandledCategory => "unhandled-category",
        };
        write!(f, "{}", reason)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Isoform,
    Artifact(ArtifactReason),
}

impl Verdict {
    pub fn keep(&self) -> bool {
        matches!(self, Verdict::Isoform)
    }
}

/// pure boolean evaluation over pre-thresholded flags
pub fn evaluate(
    category: &StructuralCategory,
    flags: &IsoformFlags,
    filter_mono_exonic: bool,
) -> Verdict {
    let polya_ok = !flags.intrapriming || flags.has_polya_motif;

    let verdict = match category {
        StructuralCategory::FullSpliceMatch
        | StructuralCategory::IncompleteSpliceMatch
        | StructuralCategory::NovelInCatalog => {
            if polya_ok {
                Verdict::Isoform
            } else {
                Verdict::Artifact(ArtifactReason::IntraPriming)
            }
        }
        StructuralCategory::NovelNotInCatalog
        | StructuralCategory::Antisense
        | StructuralCategory::Intergenic
        | StructuralCategory::Genic
        | StructuralCategory::GenicIntron => {
            if !polya_ok {
                Verdict::Artifact(ArtifactReason::IntraPriming)
            } else if flags.is_rt_switching {
                Verdict::Artifact(ArtifactReason::RtSwitching)
            } else if !(flags.all_junctions_canonical || flags.all_junctions_short_read_supported)
            {
                Verdict::Artifact(ArtifactReason::UnsupportedJunctions)
            } else {
                Verdict::Isoform
            }
        }
        StructuralCategory::Fusion
        | StructuralCategory::MoreJunctions
        | StructuralCategory::Unknown(_) => Verdict::Artifact(ArtifactReason::UnhandledCategory),
    };

    if verdict.keep() && filter_mono_exonic && flags.is_mono_exonic {
        return Verdict::Artifact(ArtifactReason::MonoExonic);
    }

    verdict
}

#[derive(Debug, Clone, Copy)]
pub struct RulesEngine {
    params: RulesParameters,
}

impl RulesEngine {
    pub fn new(params: RulesParameters) -> Self {
        Self { params }
    }

    pub fn verdict(&self, record: &IsoformRecord) -> Verdict {
        let flags = record.flags(&self.params);
        evaluate(&record.category, &flags, self.params.filter_mono_exonic)
    }

    pub fn keep(&self, record: &IsoformRecord) -> bool {
        self.verdict(record).keep()
    }
}

struct ParallelAccumulator {
    reasons: DashMap<ArtifactReason, u32>,
    unhandled: DashSet<String>,
    kept: AtomicU32,
}

impl Default for ParallelAccumulator {
    fn default() -> Self {
        Self {
            reasons: DashMap::new(),
            unhandled: DashSet::new(),
            kept: AtomicU32::new(0),
        }
    }
}

/// rules strategy of the retention set builder
pub struct RulesClassifier {
    engine: RulesEngine,
    run: RunConfig,
    accumulator: ParallelAccumulator,
}

impl RulesClassifier {
    pub fn new(params: RulesParameters, run: RunConfig) -> Self {
        Self {
            engine: RulesEngine::new(params),
            run,
            accumulator: ParallelAccumulator::default(),
        }
    }

    fn tally(&self, record: &IsoformRecord, verdict: &Verdict) {
        match verdict {
            Verdict::Isoform => {
                self.accumulator.kept.fetch_add(1, Ordering::Relaxed);
            }
            Verdict::Artifact(reason) => {
                *self.accumulator.reasons.entry(*reason).or_insert(0) += 1;

                if *reason == ArtifactReason::UnhandledCategory {
                    self.accumulator.unhandled.insert(record.category.to_string());
                }
            }
        }
    }
}

impl IsoformClassifier for RulesClassifier {
    fn name(&self) -> &'static str {
        "Rules"
    }

    fn classify(&self, table: &ClassificationTable) -> Result<RetentionSet, FilterError> {
        log::info!("Running rules filter with {:?}", self.engine.params);

        let pb = get_progress_bar(table.len() as u64, "Evaluating isoforms...");

        // collect keeps input order
        let verdicts: Vec<Verdict> = table
            .records
            .par_iter()
            .map(|record| {
                let verdict = self.engine.verdict(record);
                self.tally(record, &verdict);
                pb.inc(1);
                verdict
            })
            .collect();

        pb.finish_and_clear();

        for label in self.accumulator.unhandled.iter() {
            log::warn!(
                "No rule for structural category '{}'. Isoforms discarded!",
                label.as_str()
            );
        }

        let retained: Vec<&str> = table
            .records
            .iter()
            .zip(verdicts.iter())
            .filter(|(_, v)| v.keep())
            .map(|(r, _)| r.id.as_str())
            .collect();

        log::info!(
            "Isoforms retained by rules: {}/{}",
            self.accumulator.kept.load(Ordering::Relaxed),
            table.len()
        );

        write_ids(retained.iter(), &self.run.inclusion_list())?;

        Ok(retained.into_iter().map(String::from).collect())
    }

    fn artifact_reasons(&self) -> Option<BTreeMap<String, u32>> {
        Some(
            self.accumulator
                .reasons
                .iter()
                .map(|entry| (entry.key().to_string(), *entry.value()))
                .collect(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn flags(intrapriming: bool, polya: bool) -> IsoformFlags {
        IsoformFlags {
            intrapriming,
            has_polya_motif: polya,
            ..Default::default()
        }
    }

    const LENIENT: [StructuralCategory; 3] = [
        StructuralCategory::FullSpliceMatch,
        StructuralCategory::IncompleteSpliceMatch,
        StructuralCategory::NovelInCatalog,
    ];

    const STRICT: [StructuralCategory; 4] = [
        StructuralCategory::NovelNotInCatalog,
        StructuralCategory::Antisense,
        StructuralCategory::Intergenic,
        StructuralCategory::Genic,
    ];

    fn all_flag_combinations() -> Vec<IsoformFlags> {
        (0u8..32)
            .map(|bits| IsoformFlags {
                intrapriming: bits & 1 != 0,
                has_polya_motif: bits & 2 != 0,
                is_rt_switching: bits & 4 != 0,
                all_junctions_canonical: bits & 8 != 0,
                all_junctions_short_read_supported: bits & 16 != 0,
                is_mono_exonic: false,
            })
            .collect()
    }

    #[test]
    fn test_lenient_categories_only_check_intrapriming() {
        for category in LENIENT.iter() {
            for f in all_flag_combinations() {
                let expected = !f.intrapriming || f.has_polya_motif;
                assert_eq!(evaluate(category, &f, false).keep(), expected);
            }
        }
    }

    #[test]
    fn test_strict_categories_need_all_three_conditions() {
        for category in STRICT.iter() {
            for f in all_flag_combinations() {
                let expected = (!f.intrapriming || f.has_polya_motif)
                    && !f.is_rt_switching
                    && (f.all_junctions_canonical || f.all_junctions_short_read_supported);
                assert_eq!(evaluate(category, &f, false).keep(), expected);
            }
        }
    }

    #[test]
    fn test_nic_intrapriming_rescued_by_polya_motif() {
        let nic = StructuralCategory::NovelInCatalog;

        assert_eq!(
            evaluate(&nic, &flags(true, false), false),
            Verdict::Artifact(ArtifactReason::IntraPriming)
        );
        assert_eq!(evaluate(&nic, &flags(true, true), false), Verdict::Isoform);
    }

    #[test]
    fn test_nnc_short_read_support_qualifies_junctions() {
        let nnc = StructuralCategory::NovelNotInCatalog;
        let supported = IsoformFlags {
            intrapriming: false,
            is_rt_switching: false,
            all_junctions_canonical: false,
            all_junctions_short_read_supported: true,
            ..Default::default()
        };

        assert_eq!(evaluate(&nnc, &supported, false), Verdict::Isoform);

        let unsupported = IsoformFlags {
            all_junctions_short_read_supported: false,
            ..supported
        };
        assert_eq!(
            evaluate(&nnc, &unsupported, false),
            Verdict::Artifact(ArtifactReason::UnsupportedJunctions)
        );
    }

    #[test]
    fn test_rt_switching_discards_strict_categories() {
        let f = IsoformFlags {
            is_rt_switching: true,
            all_junctions_canonical: true,
            ..Default::default()
        };

        assert_eq!(
            evaluate(&StructuralCategory::Antisense, &f, false),
            Verdict::Artifact(ArtifactReason::RtSwitching)
        );
        assert!(evaluate(&StructuralCategory::FullSpliceMatch, &f, false).keep());
    }

    #[test]
    fn test_mono_exonic_modifier() {
        let fsm = StructuralCategory::FullSpliceMatch;
        let mono = IsoformFlags {
            is_mono_exonic: true,
            ..Default::default()
        };

        assert!(evaluate(&fsm, &mono, false).keep());
        assert_eq!(
            evaluate(&fsm, &mono, true),
            Verdict::Artifact(ArtifactReason::MonoExonic)
        );
    }

    #[test]
    fn test_unhandled_categories_are_discarded() {
        let f = IsoformFlags {
            all_junctions_canonical: true,
            ..Default::default()
        };

        for category in [
            StructuralCategory::Fusion,
            StructuralCategory::MoreJunctions,
            StructuralCategory::Unknown("novel_thing".to_string()),
        ] {
            assert_eq!(
                evaluate(&category, &f, false),
                Verdict::Artifact(ArtifactReason::UnhandledCategory)
            );
        }
    }

    #[test]
    fn test_parameter_boundaries() {
        assert!(RulesParameters::new(0.25, 6, 3, 50, false).is_ok());
        assert!(RulesParameters::new(1.0, 6, 3, 50, false).is_ok());
        assert!(matches!(
            RulesParameters::new(0.24, 6, 3, 50, false),
            Err(FilterError::InvalidParameter { .. })
        ));
        assert!(matches!(
            RulesParameters::new(1.01, 6, 3, 50, false),
            Err(FilterError::InvalidParameter { .. })
        ));

        assert!(RulesParameters::new(0.6, 4, 3, 50, false).is_ok());
        assert!(RulesParameters::new(0.6, 20, 3, 50, false).is_ok());
        assert!(RulesParameters::new(0.6, 3, 3, 50, false).is_err());
        assert!(RulesParameters::new(0.6, 21, 3, 50, false).is_err());
    }

    #[test]
    fn test_engine_is_deterministic() {
        let params = RulesParameters::new(0.6, 6, 3, 50, false).unwrap();
        let engine = RulesEngine::new(params);
        let record = IsoformRecord {
            id: "PB.7.2".to_string(),
            category: StructuralCategory::NovelNotInCatalog,
            exons: 3,
            perc_a_downstream: Some(20.0),
            seq_a_downstream: None,
            polya_motif: None,
            rts_stage: false,
            all_canonical: false,
            min_cov: Some(10),
            diff_to_gene_tts: None,
            line: String::new(),
        };

        let first = engine.keep(&record);
        assert!(first);
        for _ in 0..10 {
            assert_eq!(engine.keep(&record), first);
        }

        // NA coverage leaves canonical junctions as the only path
        let no_short_reads = IsoformRecord {
            min_cov: None,
            ..record
        };
        assert!(!engine.keep(&no_short_reads));
    }
}
