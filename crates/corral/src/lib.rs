//! corral — a parallelism coordination layer.
//!
//! A host process often carries several independent native concurrency
//! backends at once: one or more OpenMP builds, one or more threaded BLAS
//! libraries, plus whatever the host itself spawns. Each defaults to all
//! cores and has its own configuration surface, so together they
//! oversubscribe the machine, and some vendor combinations crash outright.
//!
//! corral discovers which backends are mapped into the current process,
//! classifies them against a static signature table, detects known-bad
//! combinations, and provides one scoped, nesting-aware API to bound the
//! total thread budget across all of them:
//!
//! ```no_run
//! use std::collections::BTreeMap;
//! use std::sync::Arc;
//!
//! use corral::{Coordinator, Mode, Registry};
//!
//! # fn work() {}
//! # fn main() -> Result<(), corral::CoordError> {
//! let registry = Arc::new(Registry::new());
//! let coordinator = Coordinator::new(registry, Mode::Warn);
//! coordinator.scope(4, &BTreeMap::new(), || {
//!     // every controllable backend is capped at 4 workers in here
//!     work()
//! })?;
//! // previous limits are restored, even if `work` panicked
//! # Ok(())
//! # }
//! ```
//!
//! Scanning is OS introspection only; nothing here performs network or disk
//! I/O, and all state is process-lifetime.

mod classify;
mod conflict;
mod coordinator;
mod error;
mod forkguard;
mod record;
mod registry;
mod scan;
mod signatures;

pub use classify::{classify, default_parallelism, Classification};
pub use conflict::{
    detect, has_fatal, Finding, RULE_CLASSIFICATION_AMBIGUOUS, RULE_CONTROL_SYMBOL_FAILURE,
    RULE_FORK_UNSAFE_POOL, RULE_SCAN_UNSUPPORTED,
};
pub use coordinator::{Coordinator, Mode, ScopeHandle};
pub use error::{ControlError, CoordError, ScanError};
pub use forkguard::fork_hook;
pub use record::{ApiKind, Control, RecordReport, RuntimeRecord, ThreadControl, Vendor};
pub use registry::{Registry, Snapshot, SnapshotReport};
pub use scan::{scan, LoadedModule};
pub use signatures::{
    default_rules, default_signatures, load_rule_manifest, load_signature_manifest, ConflictRule,
    RecordPredicate, RuleManifest, RuleMatcher, RuntimeSignature, Severity, SignatureManifest,
};
