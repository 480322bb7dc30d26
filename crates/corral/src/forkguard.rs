//! Pre-duplication safety check.
//!
//! A fork-unsafe runtime whose pool is wider than one worker will be
//! inherited by the child in an unusable state. The check itself must be
//! duplication-safe: it spawns no threads and its only allocation is the
//! findings list, built before any caller would fork.

use crate::conflict::{Finding, RULE_FORK_UNSAFE_POOL};
use crate::coordinator::Coordinator;
use crate::error::CoordError;
use crate::registry::Snapshot;
use crate::signatures::Severity;

/// Records that make duplicating the process unsafe right now: known
/// fork-unsafe and currently holding a multi-worker pool. A record capped at
/// one worker is safe to inherit.
pub(crate) fn unsafe_fork_findings(snapshot: &Snapshot) -> Vec<Finding> {
    let mut out = Vec::new();
    for record in &snapshot.records {
        if record.fork_safe || record.current_limit() <= 1 {
            continue;
        }
        out.push(Finding {
            rule_id: RULE_FORK_UNSAFE_POOL.to_string(),
            severity: Severity::Warning,
            involved_paths: vec![record.path.clone()],
            message: format!(
                "{} is not fork-safe and holds an active pool of {} workers",
                record.path.display(),
                record.current_limit()
            ),
        });
    }
    out
}

/// Adapter for host environments with a pre-duplication callback registry:
/// register this against a coordinator and invoke it immediately before
/// forking. Hosts without such a facility simply get no fork checking.
/// Warn-mode findings are not lost here: `prepare_fork` logs them and
/// queues them for `take_scope_findings` before this adapter discards the
/// returned list.
pub fn fork_hook(coordinator: &Coordinator) -> Result<(), CoordError> {
    coordinator.prepare_fork().map(|_| ())
}
