//! Scoped, nesting-aware thread-budget coordination.
//!
//! All mutation of `current_limit` across every record goes through one
//! coordinator lock, so concurrent scopes from different threads observe a
//! linear history of pushes and pops. A coordinator is an ordinary value
//! over a registry; independent coordinators (e.g. in tests) coexist
//! without shared globals.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use tracing::{debug, warn};

use crate::conflict::{self, Finding, RULE_CONTROL_SYMBOL_FAILURE};
use crate::error::CoordError;
use crate::forkguard;
use crate::record::{Control, RuntimeRecord};
use crate::registry::{Registry, Snapshot};
use crate::signatures::{default_rules, RuleManifest, Severity};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// Fatal findings and unsafe forks are reported, never raised.
    Warn,
    /// Fatal findings abort `enter_scope`; unsafe forks are vetoed.
    Strict,
}

/// Handle for one entered scope. Not cloneable: it is consumed by
/// `exit_scope`, and exits must be LIFO.
#[derive(Debug)]
pub struct ScopeHandle {
    token: u64,
}

struct FrameEntry {
    record: Arc<RuntimeRecord>,
    prev_limit: u32,
    effective: u32,
}

struct ScopeFrame {
    token: u64,
    depth: usize,
    requested_limit: u32,
    entries: Vec<FrameEntry>,
}

struct CoordinatorState {
    frames: Vec<ScopeFrame>,
    next_token: u64,
    /// Degradation findings produced while applying or restoring limits,
    /// drained by `take_scope_findings`.
    pending: Vec<Finding>,
}

pub struct Coordinator {
    registry: Arc<Registry>,
    mode: Mode,
    rules: Arc<RuleManifest>,
    state: Mutex<CoordinatorState>,
}

impl Coordinator {
    pub fn new(registry: Arc<Registry>, mode: Mode) -> Self {
        Self::with_rules(registry, mode, Arc::new(default_rules().clone()))
    }

    pub fn with_rules(registry: Arc<Registry>, mode: Mode, rules: Arc<RuleManifest>) -> Self {
        Coordinator {
            registry,
            mode,
            rules,
            state: Mutex::new(CoordinatorState {
                frames: Vec::new(),
                next_token: 1,
                pending: Vec::new(),
            }),
        }
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    pub fn mode(&self) -> Mode {
        self.mode
    }

    pub fn list_runtimes(&self) -> Arc<Snapshot> {
        self.registry.current()
    }

    pub fn check_conflicts(&self) -> Vec<Finding> {
        conflict::detect(&self.registry.current(), &self.rules)
    }

    /// Enter a thread-budget scope. Every controllable, non-degraded record
    /// is set to `min(requested_limit, native_max)`; inside an enclosing
    /// scope the target is further clamped to the enclosing effective limit
    /// for that record (a child narrows, never widens), unless an
    /// `overrides` entry names the record's path to opt it out.
    ///
    /// Overrides are keyed by module path, not by full `(path, base
    /// address)` identity: if the same library is mapped more than once
    /// (e.g. via `dlmopen` namespaces), one override applies to every
    /// mapping of that path.
    ///
    /// In strict mode a fatal conflict finding aborts before any record is
    /// touched.
    pub fn enter_scope(
        &self,
        requested_limit: u32,
        overrides: &BTreeMap<PathBuf, u32>,
    ) -> Result<ScopeHandle, CoordError> {
        if requested_limit == 0 {
            return Err(CoordError::InvalidLimit { requested: 0 });
        }
        if overrides.values().any(|&n| n == 0) {
            return Err(CoordError::InvalidLimit { requested: 0 });
        }

        let mut state = self.lock_state();
        let snapshot = self.registry.current();

        if self.mode == Mode::Strict {
            let findings = conflict::detect(&snapshot, &self.rules);
            if conflict::has_fatal(&findings) {
                let fatal: Vec<Finding> = findings
                    .into_iter()
                    .filter(|f| f.severity == Severity::Fatal)
                    .collect();
                return Err(CoordError::ConfigurationConflict { findings: fatal });
            }
        }

        let depth = state.frames.len();
        let token = state.next_token;
        state.next_token += 1;

        let mut entries: Vec<FrameEntry> = Vec::new();
        for record in &snapshot.records {
            let Control::Controllable(control) = record.control() else {
                continue;
            };
            if record.is_degraded() {
                continue;
            }

            let overridden = overrides.get(&record.path);
            let requested = overridden
                .copied()
                .unwrap_or(requested_limit)
                .min(record.native_max);
            let effective = if overridden.is_none() {
                match enclosing_effective(&state.frames, record) {
                    Some(bound) => requested.min(bound),
                    None => requested,
                }
            } else {
                requested
            };

            let prev_limit = record.current_limit();
            match control.set(effective) {
                Ok(()) => {
                    record.store_limit(effective);
                    entries.push(FrameEntry {
                        record: record.clone(),
                        prev_limit,
                        effective,
                    });
                }
                Err(err) => {
                    record.mark_degraded();
                    warn!(path = %record.path.display(), %err, "runtime degraded while applying limit");
                    state.pending.push(control_failure_finding(record, &err.to_string()));
                }
            }
        }

        debug!(token, depth, requested_limit, records = entries.len(), "scope entered");
        state.frames.push(ScopeFrame {
            token,
            depth,
            requested_limit,
            entries,
        });
        Ok(ScopeHandle { token })
    }

    /// Exit the scope named by `handle`, restoring each touched record's
    /// limit to the value captured at entry. The handle must belong to the
    /// top frame; out-of-order exits (and double exits) are rejected without
    /// restoring anything.
    pub fn exit_scope(&self, handle: &ScopeHandle) -> Result<(), CoordError> {
        let mut state = self.lock_state();
        let top = match state.frames.last() {
            Some(frame) => frame.token,
            None => {
                return Err(CoordError::ScopeOrder {
                    expected: None,
                    got: handle.token,
                })
            }
        };
        if top != handle.token {
            return Err(CoordError::ScopeOrder {
                expected: Some(top),
                got: handle.token,
            });
        }

        let frame = state.frames.pop().expect("frame checked above");
        for entry in frame.entries.iter().rev() {
            let Control::Controllable(control) = entry.record.control() else {
                continue;
            };
            match control.set(entry.prev_limit) {
                Ok(()) => entry.record.store_limit(entry.prev_limit),
                Err(err) => {
                    // Restoration continues for the remaining records.
                    entry.record.mark_degraded();
                    warn!(path = %entry.record.path.display(), %err, "runtime degraded while restoring limit");
                    state
                        .pending
                        .push(control_failure_finding(&entry.record, &err.to_string()));
                }
            }
        }
        debug!(token = frame.token, depth = frame.depth, requested_limit = frame.requested_limit, "scope exited");
        Ok(())
    }

    /// Run `f` inside a scope. The scope is exited on every path out of `f`,
    /// including panic unwind.
    pub fn scope<T>(
        &self,
        requested_limit: u32,
        overrides: &BTreeMap<PathBuf, u32>,
        f: impl FnOnce() -> T,
    ) -> Result<T, CoordError> {
        let handle = self.enter_scope(requested_limit, overrides)?;
        let mut guard = ScopeGuard {
            coordinator: self,
            token: Some(handle.token),
        };
        let out = f();
        guard.finish()?;
        Ok(out)
    }

    /// Drain findings produced while applying or restoring limits
    /// (degraded-record warnings).
    pub fn take_scope_findings(&self) -> Vec<Finding> {
        std::mem::take(&mut self.lock_state().pending)
    }

    /// Pre-duplication check. Holds the coordination lock for the whole
    /// check so it is atomic with respect to concurrent scope changes. In
    /// warn mode the offending records are logged, queued for
    /// `take_scope_findings`, and returned; the fork may proceed. In strict
    /// mode the duplication is vetoed.
    pub fn prepare_fork(&self) -> Result<Vec<Finding>, CoordError> {
        let mut state = self.lock_state();
        let snapshot = self.registry.current();
        let findings = forkguard::unsafe_fork_findings(&snapshot);
        if findings.is_empty() {
            return Ok(findings);
        }
        if self.mode == Mode::Strict {
            return Err(CoordError::DuplicationBlocked {
                paths: findings
                    .iter()
                    .flat_map(|f| f.involved_paths.iter().cloned())
                    .collect(),
            });
        }
        for finding in &findings {
            warn!(rule = finding.rule_id.as_str(), "{}", finding.message);
        }
        state.pending.extend(findings.iter().cloned());
        Ok(findings)
    }

    /// Current nesting depth (number of live frames).
    pub fn depth(&self) -> usize {
        self.lock_state().frames.len()
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, CoordinatorState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

fn control_failure_finding(record: &RuntimeRecord, detail: &str) -> Finding {
    Finding {
        rule_id: RULE_CONTROL_SYMBOL_FAILURE.to_string(),
        severity: Severity::Warning,
        involved_paths: vec![record.path.clone()],
        message: format!(
            "{}: control entry point failed ({detail}); record degraded and skipped",
            record.path.display()
        ),
    }
}

/// Innermost enclosing effective limit for `record`, if any frame touched it.
fn enclosing_effective(frames: &[ScopeFrame], record: &RuntimeRecord) -> Option<u32> {
    frames.iter().rev().find_map(|frame| {
        frame
            .entries
            .iter()
            .find(|e| e.record.identity() == record.identity())
            .map(|e| e.effective)
    })
}

struct ScopeGuard<'a> {
    coordinator: &'a Coordinator,
    token: Option<u64>,
}

impl ScopeGuard<'_> {
    fn finish(&mut self) -> Result<(), CoordError> {
        match self.token.take() {
            Some(token) => self.coordinator.exit_scope(&ScopeHandle { token }),
            None => Ok(()),
        }
    }
}

impl Drop for ScopeGuard<'_> {
    fn drop(&mut self) {
        if let Some(token) = self.token.take() {
            if let Err(err) = self.coordinator.exit_scope(&ScopeHandle { token }) {
                warn!(%err, "scope restore during unwind failed");
            }
        }
    }
}
