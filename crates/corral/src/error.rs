use std::path::PathBuf;

use crate::conflict::Finding;

/// Module scanning is OS-introspection dependent; on targets without a
/// usable facility the scanner refuses rather than guessing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanError {
    Unsupported,
}

impl std::fmt::Display for ScanError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ScanError::Unsupported => {
                write!(f, "module scanning is not supported on this platform")
            }
        }
    }
}

impl std::error::Error for ScanError {}

/// A resolved control entry point misbehaved at call time. Always recovered
/// locally: the record is marked degraded and coordination continues for the
/// other records.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControlError {
    pub symbol: String,
    pub detail: String,
}

impl std::fmt::Display for ControlError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "control symbol {} failed: {}", self.symbol, self.detail)
    }
}

impl std::error::Error for ControlError {}

#[derive(Debug)]
pub enum CoordError {
    InvalidLimit {
        requested: u32,
    },
    ConfigurationConflict {
        findings: Vec<Finding>,
    },
    /// Scope exits must be LIFO with respect to entries on the same
    /// coordinator; anything else is a caller bug.
    ScopeOrder {
        expected: Option<u64>,
        got: u64,
    },
    DuplicationBlocked {
        paths: Vec<PathBuf>,
    },
}

impl std::fmt::Display for CoordError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CoordError::InvalidLimit { requested } => {
                write!(f, "invalid worker limit: {requested} (must be >= 1)")
            }
            CoordError::ConfigurationConflict { findings } => {
                write!(f, "fatal runtime conflict: ")?;
                for (i, finding) in findings.iter().enumerate() {
                    if i > 0 {
                        write!(f, "; ")?;
                    }
                    write!(f, "[{}] {}", finding.rule_id, finding.message)?;
                }
                Ok(())
            }
            CoordError::ScopeOrder { expected, got } => match expected {
                Some(expected) => write!(
                    f,
                    "out-of-order scope exit: top of stack is scope {expected}, got {got}"
                ),
                None => write!(f, "scope exit with empty scope stack: got {got}"),
            },
            CoordError::DuplicationBlocked { paths } => {
                write!(
                    f,
                    "process duplication blocked: fork-unsafe runtimes hold active thread pools:"
                )?;
                for path in paths {
                    write!(f, " {}", path.display())?;
                }
                Ok(())
            }
        }
    }
}

impl std::error::Error for CoordError {}
