//! Conflict detection over a registry snapshot.
//!
//! Rules are data (`RuleMatcher`) interpreted by one small engine. Evaluation
//! is deterministic: rules in manifest order, records and pairs in snapshot
//! discovery order, so identical snapshots produce identical findings.

use std::path::PathBuf;

use serde::Serialize;

use crate::record::RuntimeRecord;
use crate::registry::Snapshot;
use crate::signatures::{RecordPredicate, RuleManifest, RuleMatcher, Severity};

/// Finding ids used for conditions detected outside the rule table.
pub const RULE_SCAN_UNSUPPORTED: &str = "scan-unsupported";
pub const RULE_CLASSIFICATION_AMBIGUOUS: &str = "classification-ambiguous";
pub const RULE_CONTROL_SYMBOL_FAILURE: &str = "control-symbol-failure";
pub const RULE_FORK_UNSAFE_POOL: &str = "fork-unsafe-pool-active";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Finding {
    pub rule_id: String,
    pub severity: Severity,
    pub involved_paths: Vec<PathBuf>,
    pub message: String,
}

fn predicate_matches(pred: &RecordPredicate, rec: &RuntimeRecord) -> bool {
    if let Some(vendor) = pred.vendor {
        if rec.vendor != vendor {
            return false;
        }
    }
    if let Some(api_kind) = pred.api_kind {
        if rec.api_kind != api_kind {
            return false;
        }
    }
    if let Some(fork_safe) = pred.fork_safe {
        if rec.fork_safe != fork_safe {
            return false;
        }
    }
    if let Some(controllable) = pred.controllable {
        if rec.control().is_controllable() != controllable {
            return false;
        }
    }
    true
}

fn file_name(rec: &RuntimeRecord) -> String {
    rec.path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| rec.path.display().to_string())
}

pub fn detect(snapshot: &Snapshot, rules: &RuleManifest) -> Vec<Finding> {
    let mut out: Vec<Finding> = snapshot.notes.clone();
    let records = &snapshot.records;

    for rule in &rules.rules {
        match &rule.matcher {
            RuleMatcher::Pair {
                a,
                b,
                distinct_vendor,
            } => {
                for i in 0..records.len() {
                    for j in (i + 1)..records.len() {
                        let (x, y) = (&records[i], &records[j]);
                        if *distinct_vendor && x.vendor == y.vendor {
                            continue;
                        }
                        let unordered_match = (predicate_matches(a, x) && predicate_matches(b, y))
                            || (predicate_matches(a, y) && predicate_matches(b, x));
                        if !unordered_match {
                            continue;
                        }
                        out.push(Finding {
                            rule_id: rule.rule_id.clone(),
                            severity: rule.severity,
                            involved_paths: vec![x.path.clone(), y.path.clone()],
                            message: rule
                                .message
                                .replace("{a}", &file_name(x))
                                .replace("{b}", &file_name(y)),
                        });
                    }
                }
            }
            RuleMatcher::Multiple { of, at_least } => {
                let matching: Vec<_> =
                    records.iter().filter(|r| predicate_matches(of, r)).collect();
                if matching.len() >= *at_least {
                    out.push(Finding {
                        rule_id: rule.rule_id.clone(),
                        severity: rule.severity,
                        involved_paths: matching.iter().map(|r| r.path.clone()).collect(),
                        message: rule.message.replace("{count}", &matching.len().to_string()),
                    });
                }
            }
            RuleMatcher::Present { of } => {
                for rec in records.iter().filter(|r| predicate_matches(of, r)) {
                    out.push(Finding {
                        rule_id: rule.rule_id.clone(),
                        severity: rule.severity,
                        involved_paths: vec![rec.path.clone()],
                        message: rule.message.replace("{path}", &file_name(rec)),
                    });
                }
            }
        }
    }

    out
}

pub fn has_fatal(findings: &[Finding]) -> bool {
    findings.iter().any(|f| f.severity == Severity::Fatal)
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;
    use std::sync::Arc;

    use super::*;
    use crate::record::{ApiKind, Control, RuntimeRecord, Vendor};
    use crate::registry::Snapshot;
    use crate::signatures::default_rules;

    fn rec(name: &str, vendor: Vendor, kind: ApiKind, fork_safe: bool) -> Arc<RuntimeRecord> {
        Arc::new(RuntimeRecord::new(
            PathBuf::from(format!("/usr/lib/{name}")),
            name.len(),
            vendor,
            kind,
            fork_safe,
            Control::ReadOnly,
            4,
            4,
        ))
    }

    fn snapshot(records: Vec<Arc<RuntimeRecord>>) -> Snapshot {
        Snapshot::new(records, Vec::new(), true)
    }

    #[test]
    fn mixed_omp_vendors_is_exactly_one_fatal_finding() {
        let snap = snapshot(vec![
            rec(
                "libomp.so.5",
                Vendor::LlvmOpenmp,
                ApiKind::ParallelLoopRuntime,
                true,
            ),
            rec(
                "libiomp5.so",
                Vendor::IntelOpenmp,
                ApiKind::ParallelLoopRuntime,
                false,
            ),
        ]);
        let findings = detect(&snap, default_rules());
        let fatal: Vec<_> = findings
            .iter()
            .filter(|f| f.rule_id == "omp-mixed-vendors")
            .collect();
        assert_eq!(fatal.len(), 1);
        assert_eq!(fatal[0].severity, Severity::Fatal);
        assert_eq!(fatal[0].involved_paths.len(), 2);
        assert!(fatal[0].message.contains("libomp.so.5"));
        assert!(fatal[0].message.contains("libiomp5.so"));
    }

    #[test]
    fn same_vendor_pair_does_not_fire_mixed_vendor_rule() {
        let snap = snapshot(vec![
            rec(
                "libgomp.so.1",
                Vendor::GnuOpenmp,
                ApiKind::ParallelLoopRuntime,
                false,
            ),
            rec(
                "libgomp-2.so.1",
                Vendor::GnuOpenmp,
                ApiKind::ParallelLoopRuntime,
                false,
            ),
        ]);
        let findings = detect(&snap, default_rules());
        assert!(!findings.iter().any(|f| f.rule_id == "omp-mixed-vendors"));
    }

    #[test]
    fn two_blas_runtimes_warn_once() {
        let snap = snapshot(vec![
            rec(
                "libopenblas.so.0",
                Vendor::Openblas,
                ApiKind::LinearAlgebraRuntime,
                true,
            ),
            rec(
                "libmkl_rt.so.2",
                Vendor::Mkl,
                ApiKind::LinearAlgebraRuntime,
                false,
            ),
        ]);
        let findings = detect(&snap, default_rules());
        let warns: Vec<_> = findings
            .iter()
            .filter(|f| f.rule_id == "multiple-blas")
            .collect();
        assert_eq!(warns.len(), 1);
        assert_eq!(warns[0].severity, Severity::Warning);
        assert!(warns[0].message.contains('2'));
    }

    #[test]
    fn detection_is_deterministic_for_identical_snapshots() {
        let records = vec![
            rec(
                "libomp.so.5",
                Vendor::LlvmOpenmp,
                ApiKind::ParallelLoopRuntime,
                true,
            ),
            rec(
                "libiomp5.so",
                Vendor::IntelOpenmp,
                ApiKind::ParallelLoopRuntime,
                false,
            ),
            rec(
                "libopenblas.so.0",
                Vendor::Openblas,
                ApiKind::LinearAlgebraRuntime,
                true,
            ),
        ];
        let snap = snapshot(records);
        let first = detect(&snap, default_rules());
        let second = detect(&snap, default_rules());
        assert_eq!(first, second);
    }

    #[test]
    fn snapshot_notes_precede_rule_findings() {
        let note = Finding {
            rule_id: RULE_CLASSIFICATION_AMBIGUOUS.to_string(),
            severity: Severity::Info,
            involved_paths: vec![PathBuf::from("/usr/lib/libwhat.so")],
            message: "ambiguous".to_string(),
        };
        let snap = Snapshot::new(
            vec![rec(
                "libgomp.so.1",
                Vendor::GnuOpenmp,
                ApiKind::ParallelLoopRuntime,
                false,
            )],
            vec![note.clone()],
            true,
        );
        let findings = detect(&snap, default_rules());
        assert_eq!(findings[0], note);
    }
}
