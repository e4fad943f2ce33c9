//! Static validation of candidate code.
//!
//! First line of defense only: a script that passes here still runs under
//! full isolation. Validation is pure and deterministic; source that cannot
//! be parsed is rejected rather than waved through.

pub mod ast;
mod lexer;
pub mod parser;
mod rules;

use std::collections::BTreeSet;
use std::fmt;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::digest::sha256_hex;

/// 1-based source position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Location {
    pub line: usize,
    pub column: usize,
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "line {}, column {}", self.line, self.column)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{message} ({location})")]
pub struct ParseError {
    pub location: Location,
    pub message: String,
}

impl ParseError {
    pub fn new(location: Location, message: impl Into<String>) -> Self {
        Self {
            location,
            message: message.into(),
        }
    }
}

/// Stable rule identifiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RuleId {
    NoDynamicImport,
    NoForbiddenImport,
    NoReflection,
    NoCodeEval,
    NoIoHandle,
    NoLookahead,
    SyntaxError,
    CodeTooLarge,
}

impl RuleId {
    pub fn as_str(&self) -> &'static str {
        match self {
            RuleId::NoDynamicImport => "no-dynamic-import",
            RuleId::NoForbiddenImport => "no-forbidden-import",
            RuleId::NoReflection => "no-reflection",
            RuleId::NoCodeEval => "no-code-eval",
            RuleId::NoIoHandle => "no-io-handle",
            RuleId::NoLookahead => "no-lookahead",
            RuleId::SyntaxError => "syntax-error",
            RuleId::CodeTooLarge => "code-too-large",
        }
    }
}

impl fmt::Display for RuleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Violation {
    pub rule_id: RuleId,
    pub location: Location,
    pub description: String,
}

impl fmt::Display for Violation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{} [{}] {}",
            self.location.line, self.location.column, self.rule_id, self.description
        )
    }
}

/// Outcome of validating one piece of code.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SecurityVerdict {
    pub accepted: bool,
    pub violations: Vec<Violation>,
    /// SHA-256 of the validated source.
    pub code_digest: String,
}

impl SecurityVerdict {
    /// Proof of acceptance, required to start an execution.
    pub fn clearance(&self) -> Option<Clearance> {
        self.accepted.then(|| Clearance {
            code_digest: self.code_digest.clone(),
        })
    }
}

/// Issued only for an accepted verdict; bound to the exact source text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Clearance {
    code_digest: String,
}

impl Clearance {
    pub fn code_digest(&self) -> &str {
        &self.code_digest
    }

    /// Whether this clearance was issued for `code`.
    pub fn covers(&self, code: &str) -> bool {
        sha256_hex(code.as_bytes()) == self.code_digest
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidatorSettings {
    /// Top-level modules (or full dotted paths) scripts may import.
    pub allowed_modules: BTreeSet<String>,
    /// Identifiers bound to chronologically ordered series.
    pub time_ordered_inputs: BTreeSet<String>,
    pub max_code_bytes: usize,
}

pub const DEFAULT_ALLOWED_MODULES: &[&str] = &[
    "math",
    "statistics",
    "numpy",
    "pandas",
    "scipy",
    "json",
    "collections",
    "itertools",
    "functools",
    "datetime",
    "decimal",
    "fractions",
    "random",
    "typing",
    "dataclasses",
    "sandbox_result",
];

pub const DEFAULT_TIME_ORDERED_INPUTS: &[&str] = &[
    "prices", "close", "high", "low", "volume", "returns", "data", "df", "series", "bars",
];

pub const DEFAULT_MAX_CODE_BYTES: usize = 256 * 1024;

impl Default for ValidatorSettings {
    fn default() -> Self {
        Self {
            allowed_modules: DEFAULT_ALLOWED_MODULES.iter().map(|s| s.to_string()).collect(),
            time_ordered_inputs: DEFAULT_TIME_ORDERED_INPUTS
                .iter()
                .map(|s| s.to_string())
                .collect(),
            max_code_bytes: DEFAULT_MAX_CODE_BYTES,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct Validator {
    settings: ValidatorSettings,
}

impl Validator {
    pub fn new(settings: ValidatorSettings) -> Self {
        Self { settings }
    }

    pub fn settings(&self) -> &ValidatorSettings {
        &self.settings
    }

    pub fn validate(&self, code: &str) -> SecurityVerdict {
        let code_digest = sha256_hex(code.as_bytes());

        let violations = if code.len() > self.settings.max_code_bytes {
            vec![Violation {
                rule_id: RuleId::CodeTooLarge,
                location: Location { line: 1, column: 1 },
                description: format!(
                    "source is {} bytes; the limit is {}",
                    code.len(),
                    self.settings.max_code_bytes
                ),
            }]
        } else {
            match parser::parse_module(code) {
                Ok(module) => rules::check(&module, &self.settings),
                Err(err) => vec![Violation {
                    rule_id: RuleId::SyntaxError,
                    location: err.location,
                    description: err.message,
                }],
            }
        };

        debug!(
            digest = %code_digest,
            violations = violations.len(),
            "Validated candidate code"
        );

        SecurityVerdict {
            accepted: violations.is_empty(),
            violations,
            code_digest,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_syntax_error_fails_closed() {
        let verdict = Validator::default().validate("def f(:\n    pass\n");
        assert!(!verdict.accepted);
        assert_eq!(verdict.violations.len(), 1);
        assert_eq!(verdict.violations[0].rule_id, RuleId::SyntaxError);
        assert!(verdict.clearance().is_none());
    }

    #[test]
    fn test_runaway_chain_is_a_syntax_error() {
        let validator = Validator::default();
        for code in [
            format!("x = 1{}\n", " + 1".repeat(60_000)),
            format!("y = y{}\n", ".a".repeat(60_000)),
            format!("f{}\n", "()".repeat(60_000)),
        ] {
            let verdict = validator.validate(&code);
            assert!(!verdict.accepted);
            assert_eq!(verdict.violations.len(), 1);
            assert_eq!(verdict.violations[0].rule_id, RuleId::SyntaxError);
        }
    }

    #[test]
    fn test_oversized_source_is_rejected() {
        let validator = Validator::new(ValidatorSettings {
            max_code_bytes: 16,
            ..ValidatorSettings::default()
        });
        let verdict = validator.validate("x = 1\ny = 2\nz = 3\nw = 4\n");
        assert_eq!(verdict.violations[0].rule_id, RuleId::CodeTooLarge);
    }

    #[test]
    fn test_clearance_bound_to_source() {
        let code = "import math\nx = math.sqrt(2)\n";
        let verdict = Validator::default().validate(code);
        assert!(verdict.accepted);
        let clearance = verdict.clearance().unwrap();
        assert!(clearance.covers(code));
        assert!(!clearance.covers("import math\nx = 1\n"));
    }

    #[test]
    fn test_validation_is_deterministic() {
        let code = "import os\nimport importlib\nopen('x')\n";
        let validator = Validator::default();
        assert_eq!(validator.validate(code), validator.validate(code));
    }

    #[test]
    fn test_allowlist_is_configurable() {
        let mut settings = ValidatorSettings::default();
        settings.allowed_modules.insert("talib".to_string());
        let validator = Validator::new(settings);
        assert!(validator.validate("import talib\n").accepted);
        assert!(!Validator::default().validate("import talib\n").accepted);
    }

    #[test]
    fn test_rule_ids_serialize_kebab_case() {
        let json = serde_json::to_string(&RuleId::NoDynamicImport).unwrap();
        assert_eq!(json, "\"no-dynamic-import\"");
        for rule in [RuleId::NoLookahead, RuleId::CodeTooLarge] {
            let json = serde_json::to_string(&rule).unwrap();
            assert_eq!(json.trim_matches('"'), rule.as_str());
        }
    }
}
