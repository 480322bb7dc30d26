//! Shared, version-pinned schema identifiers.
//!
//! These constants are the single source of truth for schema/version strings
//! that appear in machine-readable I/O: the embedded signature and
//! conflict-rule tables, and the JSON reports emitted by `corral-cli`.

pub const CORRAL_SIGNATURES_SCHEMA_VERSION: &str = "corral.signatures@0.1.0";
pub const CORRAL_RULES_SCHEMA_VERSION: &str = "corral.conflict-rules@0.1.0";
pub const CORRAL_REPORT_SCHEMA_VERSION: &str = "corral.report@0.1.0";
