//! Thread-safe tally of per-image outcomes.

use crate::scheduler::{Disposition, ImageOutcome};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Mutex;

/// Totals for one run. `sorted() + unknown + errors == total` always holds.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RunStatistics {
    pub total: usize,
    pub per_person: BTreeMap<String, usize>,
    pub unknown: usize,
    pub errors: usize,
    pub moved: usize,
    pub copied: usize,
    /// Copies skipped because identical content was already in place.
    pub already_present: usize,
    /// Images whose decision came from the cache.
    pub cache_hits: usize,
    pub faces_detected: usize,
}

impl RunStatistics {
    pub fn sorted(&self) -> usize {
        self.per_person.values().sum()
    }
}

#[derive(Debug, Default)]
pub struct StatsAggregator {
    inner: Mutex<RunStatistics>,
}

impl StatsAggregator {
    /// Start with a zero count for every known person so they show up in the summary.
    pub fn with_persons<'a>(names: impl IntoIterator<Item = &'a str>) -> Self {
        let per_person = names.into_iter().map(|n| (n.to_string(), 0)).collect();
        Self {
            inner: Mutex::new(RunStatistics {
                per_person,
                ..RunStatistics::default()
            }),
        }
    }

    pub fn record(&self, outcome: &ImageOutcome) {
        let mut stats = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        stats.total += 1;
        if outcome.cached {
            stats.cache_hits += 1;
        }
        match &outcome.disposition {
            Disposition::Sorted {
                person,
                decision,
                placement,
            } => {
                *stats.per_person.entry(person.clone()).or_default() += 1;
                stats.faces_detected += decision.faces;
                if placement.moved {
                    stats.moved += 1;
                } else if placement.already_present {
                    stats.already_present += 1;
                } else {
                    stats.copied += 1;
                }
            }
            Disposition::Unknown { decision } => {
                stats.unknown += 1;
                stats.faces_detected += decision.faces;
            }
            Disposition::Failed { .. } => stats.errors += 1,
        }
    }

    pub fn summary(&self) -> RunStatistics {
        self.inner.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mover::MoveOutcome;
    use crate::scheduler::FailureStage;
    use crate::types::MatchDecision;
    use std::path::PathBuf;
    use std::sync::Arc;

    fn placement(moved: bool) -> MoveOutcome {
        MoveOutcome {
            source_path: PathBuf::from("in/a.jpg"),
            destination_path: Some(PathBuf::from("out/ana/a.jpg")),
            verified: true,
            error: None,
            failed_step: None,
            checksum: None,
            already_present: false,
            moved,
        }
    }

    fn sorted(person: &str, moved: bool) -> ImageOutcome {
        ImageOutcome {
            source: PathBuf::from("in/a.jpg"),
            cached: false,
            disposition: Disposition::Sorted {
                person: person.into(),
                decision: MatchDecision {
                    matched_person: Some(person.into()),
                    confidence: Some(0.2),
                    all_candidates: vec![],
                    faces: 1,
                },
                placement: placement(moved),
            },
        }
    }

    fn unknown() -> ImageOutcome {
        ImageOutcome {
            source: PathBuf::from("in/b.jpg"),
            cached: true,
            disposition: Disposition::Unknown {
                decision: MatchDecision::unknown(2),
            },
        }
    }

    fn failed() -> ImageOutcome {
        ImageOutcome {
            source: PathBuf::from("in/c.jpg"),
            cached: false,
            disposition: Disposition::Failed {
                stage: FailureStage::Detection,
                reason: "boom".into(),
                placement: None,
            },
        }
    }

    #[test]
    fn test_record_classifies_outcomes() {
        let stats = StatsAggregator::with_persons(["ana", "gabe"]);
        stats.record(&sorted("ana", true));
        stats.record(&sorted("ana", false));
        stats.record(&unknown());
        stats.record(&failed());

        let summary = stats.summary();
        assert_eq!(summary.total, 4);
        assert_eq!(summary.per_person["ana"], 2);
        assert_eq!(summary.per_person["gabe"], 0);
        assert_eq!((summary.moved, summary.copied), (1, 1));
        assert_eq!((summary.unknown, summary.errors), (1, 1));
        assert_eq!(summary.cache_hits, 1);
        assert_eq!(summary.faces_detected, 4);
    }

    #[test]
    fn test_concurrent_records_are_conserved() {
        let stats = Arc::new(StatsAggregator::default());
        let handles: Vec<_> = (0..8)
            .map(|t| {
                let stats = Arc::clone(&stats);
                std::thread::spawn(move || {
                    for i in 0..250 {
                        let outcome = match (t + i) % 3 {
                            0 => sorted(if i % 2 == 0 { "ana" } else { "gabe" }, false),
                            1 => unknown(),
                            _ => failed(),
                        };
                        stats.record(&outcome);
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        let summary = stats.summary();
        assert_eq!(summary.total, 2000);
        assert_eq!(summary.sorted() + summary.unknown + summary.errors, summary.total);
    }
}
