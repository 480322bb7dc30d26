use std::sync::Arc;

use corral::{ApiKind, Registry, Vendor};

use fake_runtime::{controllable, read_only};

#[test]
fn report_serializes_the_documented_record_fields() {
    let (omp, _pool) = controllable(
        "libomp.so.5",
        Vendor::LlvmOpenmp,
        ApiKind::ParallelLoopRuntime,
        true,
        4,
        8,
    );
    let registry = Registry::with_records(vec![omp]);

    let json = serde_json::to_value(registry.current().report()).unwrap();
    assert_eq!(json["schema_version"], "corral.report@0.1.0");
    assert_eq!(json["scan_supported"], true);

    let record = &json["runtimes"][0];
    assert_eq!(record["path"], "/usr/lib/libomp.so.5");
    assert_eq!(record["vendor"], "llvm-openmp");
    assert_eq!(record["api_kind"], "parallel-loop-runtime");
    assert_eq!(record["fork_safe"], true);
    assert_eq!(record["controllable"], true);
    assert_eq!(record["current_limit"], 4);
    assert_eq!(record["native_max"], 8);

    let keys: Vec<&str> = record.as_object().unwrap().keys().map(|k| k.as_str()).collect();
    assert_eq!(
        keys.len(),
        7,
        "record report grew a field the docs do not name: {keys:?}"
    );
}

#[test]
fn uncontrollable_runtimes_are_reported_not_hidden() {
    let registry = Registry::with_records(vec![read_only(
        "libblas.so.3",
        Vendor::ReferenceBlas,
        ApiKind::LinearAlgebraRuntime,
        true,
        2,
    )]);

    let report = registry.current().report();
    assert_eq!(report.runtimes.len(), 1);
    assert!(!report.runtimes[0].controllable);
}
