use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::ControlError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Vendor {
    GnuOpenmp,
    LlvmOpenmp,
    IntelOpenmp,
    Openblas,
    Mkl,
    Blis,
    ReferenceBlas,
    Custom,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ApiKind {
    ParallelLoopRuntime,
    LinearAlgebraRuntime,
    Other,
}

/// Resolved worker-count entry points of one native runtime. The production
/// implementation wraps `dlsym`-resolved C functions; tests supply in-memory
/// implementations.
pub trait ThreadControl: Send + Sync {
    fn get(&self) -> Result<u32, ControlError>;
    fn set(&self, workers: u32) -> Result<(), ControlError>;
}

#[derive(Clone)]
pub enum Control {
    Controllable(Arc<dyn ThreadControl>),
    ReadOnly,
}

impl Control {
    pub fn is_controllable(&self) -> bool {
        matches!(self, Control::Controllable(_))
    }
}

impl std::fmt::Debug for Control {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Control::Controllable(_) => f.write_str("Controllable"),
            Control::ReadOnly => f.write_str("ReadOnly"),
        }
    }
}

/// One classified native concurrency backend mapped into the process.
///
/// Immutable after classification except for `current_limit`, which only the
/// coordinator writes (while holding its lock), and the degraded flag.
#[derive(Debug)]
pub struct RuntimeRecord {
    pub path: PathBuf,
    pub base_addr: usize,
    pub vendor: Vendor,
    pub api_kind: ApiKind,
    pub fork_safe: bool,
    pub native_max: u32,
    control: Control,
    current_limit: AtomicU32,
    degraded: AtomicBool,
}

impl RuntimeRecord {
    pub fn new(
        path: PathBuf,
        base_addr: usize,
        vendor: Vendor,
        api_kind: ApiKind,
        fork_safe: bool,
        control: Control,
        current_limit: u32,
        native_max: u32,
    ) -> Self {
        RuntimeRecord {
            path,
            base_addr,
            vendor,
            api_kind,
            fork_safe,
            native_max,
            control,
            current_limit: AtomicU32::new(current_limit),
            degraded: AtomicBool::new(false),
        }
    }

    pub fn control(&self) -> &Control {
        &self.control
    }

    pub fn current_limit(&self) -> u32 {
        self.current_limit.load(Ordering::SeqCst)
    }

    pub fn is_degraded(&self) -> bool {
        self.degraded.load(Ordering::SeqCst)
    }

    pub(crate) fn store_limit(&self, workers: u32) {
        self.current_limit.store(workers, Ordering::SeqCst);
    }

    pub(crate) fn mark_degraded(&self) {
        self.degraded.store(true, Ordering::SeqCst);
    }

    /// Identity key: at most one record per (path, base address) pair.
    pub fn identity(&self) -> (&std::path::Path, usize) {
        (self.path.as_path(), self.base_addr)
    }

    pub fn report(&self) -> RecordReport {
        RecordReport {
            path: self.path.clone(),
            vendor: self.vendor,
            api_kind: self.api_kind,
            fork_safe: self.fork_safe,
            controllable: self.control.is_controllable(),
            current_limit: self.current_limit(),
            native_max: self.native_max,
        }
    }
}

/// Serializable view of a record, as emitted by `corral list`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RecordReport {
    pub path: PathBuf,
    pub vendor: Vendor,
    pub api_kind: ApiKind,
    pub fork_safe: bool,
    pub controllable: bool,
    pub current_limit: u32,
    pub native_max: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vendor_and_kind_serialize_kebab_case() {
        assert_eq!(
            serde_json::to_string(&Vendor::LlvmOpenmp).unwrap(),
            "\"llvm-openmp\""
        );
        assert_eq!(
            serde_json::to_string(&ApiKind::LinearAlgebraRuntime).unwrap(),
            "\"linear-algebra-runtime\""
        );
    }

    #[test]
    fn report_reflects_live_limit() {
        let rec = RuntimeRecord::new(
            PathBuf::from("/usr/lib/libopenblas.so.0"),
            0x7f00_0000,
            Vendor::Openblas,
            ApiKind::LinearAlgebraRuntime,
            true,
            Control::ReadOnly,
            8,
            8,
        );
        assert_eq!(rec.report().current_limit, 8);
        rec.store_limit(2);
        assert_eq!(rec.report().current_limit, 2);
        assert!(!rec.report().controllable);
    }
}
