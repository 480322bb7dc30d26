use std::collections::BTreeMap;
use std::sync::Arc;

use corral::{
    fork_hook, ApiKind, CoordError, Coordinator, Mode, Registry, Vendor, RULE_FORK_UNSAFE_POOL,
};

use fake_runtime::{controllable, read_only};

#[test]
fn strict_mode_blocks_fork_with_active_unsafe_pool() {
    let record = read_only(
        "libgomp.so.1",
        Vendor::GnuOpenmp,
        ApiKind::ParallelLoopRuntime,
        false,
        4,
    );
    let path = record.path.clone();
    let coordinator = Coordinator::new(Arc::new(Registry::with_records(vec![record])), Mode::Strict);

    match coordinator.prepare_fork() {
        Err(CoordError::DuplicationBlocked { paths }) => assert_eq!(paths, vec![path]),
        other => panic!("expected DuplicationBlocked, got {other:?}"),
    }
}

#[test]
fn strict_mode_permits_fork_at_one_worker() {
    let record = read_only(
        "libgomp.so.1",
        Vendor::GnuOpenmp,
        ApiKind::ParallelLoopRuntime,
        false,
        1,
    );
    let coordinator = Coordinator::new(Arc::new(Registry::with_records(vec![record])), Mode::Strict);

    let findings = coordinator.prepare_fork().unwrap();
    assert!(findings.is_empty());
}

#[test]
fn warn_mode_reports_and_proceeds() {
    let record = read_only(
        "libgomp.so.1",
        Vendor::GnuOpenmp,
        ApiKind::ParallelLoopRuntime,
        false,
        4,
    );
    let coordinator = Coordinator::new(Arc::new(Registry::with_records(vec![record])), Mode::Warn);

    let findings = coordinator.prepare_fork().unwrap();
    assert_eq!(findings.len(), 1);
    assert_eq!(findings[0].rule_id, RULE_FORK_UNSAFE_POOL);
}

#[test]
fn narrowing_a_scope_to_one_worker_makes_fork_safe() {
    let (record, _pool) = controllable(
        "libgomp.so.1",
        Vendor::GnuOpenmp,
        ApiKind::ParallelLoopRuntime,
        false,
        8,
        8,
    );
    let coordinator = Coordinator::new(Arc::new(Registry::with_records(vec![record])), Mode::Strict);

    assert!(coordinator.prepare_fork().is_err());

    let handle = coordinator.enter_scope(1, &BTreeMap::new()).unwrap();
    assert!(coordinator.prepare_fork().unwrap().is_empty());
    coordinator.exit_scope(&handle).unwrap();

    assert!(coordinator.prepare_fork().is_err());
}

#[test]
fn fork_safe_runtimes_never_trip_the_guard() {
    let record = read_only(
        "libopenblas.so.0",
        Vendor::Openblas,
        ApiKind::LinearAlgebraRuntime,
        true,
        16,
    );
    let coordinator = Coordinator::new(Arc::new(Registry::with_records(vec![record])), Mode::Strict);
    assert!(coordinator.prepare_fork().unwrap().is_empty());
}

#[test]
fn warn_mode_findings_survive_the_hook_adapter() {
    let record = read_only(
        "libgomp.so.1",
        Vendor::GnuOpenmp,
        ApiKind::ParallelLoopRuntime,
        false,
        4,
    );
    let coordinator = Coordinator::new(Arc::new(Registry::with_records(vec![record])), Mode::Warn);

    // The adapter discards the returned list, but the findings stay
    // reachable through the drain channel.
    fork_hook(&coordinator).unwrap();
    let findings = coordinator.take_scope_findings();
    assert_eq!(findings.len(), 1);
    assert_eq!(findings[0].rule_id, RULE_FORK_UNSAFE_POOL);
    assert!(coordinator.take_scope_findings().is_empty());
}

#[test]
fn fork_hook_adapter_matches_prepare_fork() {
    let record = read_only(
        "libgomp.so.1",
        Vendor::GnuOpenmp,
        ApiKind::ParallelLoopRuntime,
        false,
        4,
    );
    let registry = Arc::new(Registry::with_records(vec![record]));

    let warn = Coordinator::new(registry.clone(), Mode::Warn);
    assert!(fork_hook(&warn).is_ok());

    let strict = Coordinator::new(registry, Mode::Strict);
    assert!(fork_hook(&strict).is_err());
}
