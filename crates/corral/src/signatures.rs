//! Static signature and conflict-rule tables.
//!
//! Both tables are data, not code: new vendors and rules are added by editing
//! the JSON documents (or loading replacements through the same loaders)
//! without touching the classifier or the detection algorithm.

use anyhow::{Context, Result};
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};

use corral_contracts::{CORRAL_RULES_SCHEMA_VERSION, CORRAL_SIGNATURES_SCHEMA_VERSION};

use crate::record::{ApiKind, Vendor};

const DEFAULT_SIGNATURES_JSON: &str = include_str!("../data/signatures.json");
const DEFAULT_RULES_JSON: &str = include_str!("../data/conflict_rules.json");

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SignatureManifest {
    pub schema_version: String,
    pub signatures: Vec<RuntimeSignature>,
}

/// Recognition data for one `(vendor, api_kind)` combination.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RuntimeSignature {
    pub vendor: Vendor,
    pub api_kind: ApiKind,
    pub fork_safe: bool,
    /// Shared-object file-name prefixes, e.g. "libgomp".
    pub file_prefixes: Vec<String>,
    /// Exported symbols that must all resolve for the match to be confirmed.
    pub probe_symbols: Vec<String>,
    pub get_symbol: Option<String>,
    pub set_symbol: Option<String>,
    /// Recognized worker-limit environment variables, highest precedence
    /// first. Read once, before any scope is entered.
    #[serde(default)]
    pub env_vars: Vec<String>,
}

impl RuntimeSignature {
    pub fn matches_file_name(&self, file_name: &str) -> bool {
        self.file_prefixes.iter().any(|p| file_name.starts_with(p.as_str()))
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RuleManifest {
    pub schema_version: String,
    pub rules: Vec<ConflictRule>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Severity {
    Info,
    Warning,
    Fatal,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ConflictRule {
    pub rule_id: String,
    pub severity: Severity,
    /// Message template. Placeholders: `{a}`/`{b}` (pair), `{path}`
    /// (present), `{count}` (multiple) are replaced with file names.
    pub message: String,
    #[serde(rename = "match")]
    pub matcher: RuleMatcher,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RuleMatcher {
    /// Fires once per unordered pair of distinct records satisfying the two
    /// predicates.
    Pair {
        a: RecordPredicate,
        b: RecordPredicate,
        #[serde(default)]
        distinct_vendor: bool,
    },
    /// Fires once when the number of matching records reaches the threshold.
    Multiple { of: RecordPredicate, at_least: usize },
    /// Fires once per matching record.
    Present { of: RecordPredicate },
}

/// Omitted fields match anything.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RecordPredicate {
    #[serde(default)]
    pub vendor: Option<Vendor>,
    #[serde(default)]
    pub api_kind: Option<ApiKind>,
    #[serde(default)]
    pub fork_safe: Option<bool>,
    #[serde(default)]
    pub controllable: Option<bool>,
}

pub fn load_signature_manifest(text: &str) -> Result<SignatureManifest> {
    let manifest: SignatureManifest =
        serde_json::from_str(text).context("parse signatures manifest JSON")?;
    if manifest.schema_version != CORRAL_SIGNATURES_SCHEMA_VERSION {
        anyhow::bail!(
            "signatures manifest schema_version mismatch: expected {} got {}",
            CORRAL_SIGNATURES_SCHEMA_VERSION,
            manifest.schema_version
        );
    }
    Ok(manifest)
}

pub fn load_rule_manifest(text: &str) -> Result<RuleManifest> {
    let manifest: RuleManifest =
        serde_json::from_str(text).context("parse conflict rules manifest JSON")?;
    if manifest.schema_version != CORRAL_RULES_SCHEMA_VERSION {
        anyhow::bail!(
            "conflict rules manifest schema_version mismatch: expected {} got {}",
            CORRAL_RULES_SCHEMA_VERSION,
            manifest.schema_version
        );
    }
    Ok(manifest)
}

static DEFAULT_SIGNATURES: Lazy<SignatureManifest> = Lazy::new(|| {
    load_signature_manifest(DEFAULT_SIGNATURES_JSON).expect("embedded signatures manifest")
});

static DEFAULT_RULES: Lazy<RuleManifest> =
    Lazy::new(|| load_rule_manifest(DEFAULT_RULES_JSON).expect("embedded conflict rules manifest"));

pub fn default_signatures() -> &'static SignatureManifest {
    &DEFAULT_SIGNATURES
}

pub fn default_rules() -> &'static RuleManifest {
    &DEFAULT_RULES
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn embedded_tables_parse() {
        let sigs = default_signatures();
        assert!(sigs.signatures.len() >= 6);
        assert!(sigs
            .signatures
            .iter()
            .any(|s| s.vendor == Vendor::LlvmOpenmp && s.api_kind == ApiKind::ParallelLoopRuntime));

        let rules = default_rules();
        assert!(rules.rules.iter().any(|r| r.rule_id == "omp-mixed-vendors"));
    }

    #[test]
    fn schema_version_mismatch_is_rejected() {
        let text = r#"{"schema_version":"corral.signatures@9.9.9","signatures":[]}"#;
        let err = load_signature_manifest(text).unwrap_err();
        assert!(err.to_string().contains("schema_version mismatch"));
    }

    #[test]
    fn unknown_fields_are_rejected() {
        let text = format!(
            r#"{{"schema_version":"{CORRAL_SIGNATURES_SCHEMA_VERSION}","signatures":[],"extra":1}}"#
        );
        assert!(load_signature_manifest(&text).is_err());
    }

    #[test]
    fn file_prefix_match_is_prefix_only() {
        let sig = default_signatures()
            .signatures
            .iter()
            .find(|s| s.vendor == Vendor::GnuOpenmp)
            .unwrap();
        assert!(sig.matches_file_name("libgomp.so.1"));
        assert!(!sig.matches_file_name("somelibgomp.so.1"));
    }
}
