//! Read-mostly registry of classified runtimes.
//!
//! `refresh()` re-runs scanner + classifier and publishes a new snapshot by
//! replacing the `Arc` behind the lock; readers never observe a partial
//! refresh. There is no background refresh: after knowingly loading or
//! unloading native modules the caller is responsible for calling
//! `refresh()`.

use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};

use serde::Serialize;
use tracing::{debug, warn};

use corral_contracts::CORRAL_REPORT_SCHEMA_VERSION;

use crate::classify::{self, Classification};
use crate::conflict::{Finding, RULE_SCAN_UNSUPPORTED};
use crate::error::ScanError;
use crate::record::{RecordReport, RuntimeRecord};
use crate::scan::{self, LoadedModule};
use crate::signatures::{default_signatures, Severity, SignatureManifest};

/// Immutable classification result handed to callers. Records are shared
/// (`Arc`) so an older snapshot and a newer one refer to the same live
/// record for an unchanged module.
#[derive(Debug)]
pub struct Snapshot {
    pub records: Vec<Arc<RuntimeRecord>>,
    /// Classification-time findings (ambiguities, unsupported scanner).
    pub notes: Vec<Finding>,
    pub scan_supported: bool,
}

impl Snapshot {
    pub fn new(records: Vec<Arc<RuntimeRecord>>, notes: Vec<Finding>, scan_supported: bool) -> Self {
        Snapshot {
            records,
            notes,
            scan_supported,
        }
    }

    pub fn report(&self) -> SnapshotReport {
        SnapshotReport {
            schema_version: CORRAL_REPORT_SCHEMA_VERSION.to_string(),
            scan_supported: self.scan_supported,
            runtimes: self.records.iter().map(|r| r.report()).collect(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SnapshotReport {
    pub schema_version: String,
    pub scan_supported: bool,
    pub runtimes: Vec<RecordReport>,
}

enum Source {
    /// Scan the live process with the given tables and the environment as it
    /// was when the registry was constructed.
    Live {
        manifest: Arc<SignatureManifest>,
        env: BTreeMap<String, String>,
    },
    /// Externally supplied records (embedders, tests); `refresh()` keeps them.
    Synthetic,
}

pub struct Registry {
    source: Source,
    published: RwLock<Arc<Snapshot>>,
}

impl Registry {
    /// Registry over the live process with the embedded signature table.
    /// The environment is snapshotted here, once, so limit seeding happens
    /// before any scope is entered.
    pub fn new() -> Self {
        Self::with_manifest(Arc::new(default_signatures().clone()))
    }

    pub fn with_manifest(manifest: Arc<SignatureManifest>) -> Self {
        let env: BTreeMap<String, String> = std::env::vars().collect();
        let registry = Registry {
            source: Source::Live { manifest, env },
            published: RwLock::new(Arc::new(Snapshot::new(Vec::new(), Vec::new(), true))),
        };
        registry.refresh();
        registry
    }

    /// Registry over externally supplied records. Used by embedders that do
    /// their own discovery and by tests; `refresh()` is a no-op.
    pub fn with_records(records: Vec<Arc<RuntimeRecord>>) -> Self {
        Registry {
            source: Source::Synthetic,
            published: RwLock::new(Arc::new(Snapshot::new(records, Vec::new(), true))),
        }
    }

    /// Re-scan and atomically replace the published snapshot.
    pub fn refresh(&self) {
        let Source::Live { manifest, env } = &self.source else {
            return;
        };
        let snapshot = build_snapshot(scan::scan(), manifest, env);
        let mut published = self
            .published
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        *published = Arc::new(snapshot);
    }

    /// Latest published snapshot. Never blocks on an in-progress refresh
    /// beyond the reader lock; two calls without an intervening `refresh()`
    /// return the same snapshot.
    pub fn current(&self) -> Arc<Snapshot> {
        self.published
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }
}

impl Default for Registry {
    fn default() -> Self {
        Registry::new()
    }
}

/// Classify a scan result into a publishable snapshot. An unsupported
/// scanner degrades to an empty snapshot carrying an `info` note, never an
/// error.
fn build_snapshot(
    scanned: Result<Vec<LoadedModule>, ScanError>,
    manifest: &SignatureManifest,
    env: &BTreeMap<String, String>,
) -> Snapshot {
    match scanned {
        Ok(modules) => {
            let Classification { records, notes } =
                classify::classify(modules.as_slice(), manifest, env);
            debug!(
                modules = modules.len(),
                runtimes = records.len(),
                "registry refreshed"
            );
            Snapshot::new(records, notes, true)
        }
        Err(err) => {
            warn!(%err, "module scan unsupported; registry degraded to empty");
            let note = Finding {
                rule_id: RULE_SCAN_UNSUPPORTED.to_string(),
                severity: Severity::Info,
                involved_paths: Vec::new(),
                message: err.to_string(),
            };
            Snapshot::new(Vec::new(), vec![note], false)
        }
    }
}
