//! Vulnerability catalog
//!
//! The classifier reports a type label and whatever detail it has. Missing
//! severity, CWE, description or recommendation are filled in from a fixed
//! catalog keyed by the normalized label.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use vulscan_storage::{Finding, Severity};

pub const DEFAULT_FUNCTION_NAME: &str = "Unknown";
pub const DEFAULT_CONFIDENCE: f64 = 0.5;

/// Finding as reported on the wire by the classify service
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RawFinding {
    #[serde(default)]
    pub function_name: Option<String>,
    #[serde(default)]
    pub line_number: Option<u32>,
    #[serde(default)]
    pub severity: Option<String>,
    #[serde(default, rename = "type")]
    pub vulnerability_type: Option<String>,
    #[serde(default)]
    pub cwe_id: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub recommendation: Option<String>,
    #[serde(default)]
    pub code_snippet: Option<String>,
    #[serde(default, alias = "confidence")]
    pub confidence_score: Option<f64>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CatalogEntry {
    pub label: &'static str,
    pub severity: Severity,
    pub cwe_id: &'static str,
    pub description: &'static str,
    pub recommendation: &'static str,
}

const UNKNOWN: CatalogEntry = CatalogEntry {
    label: "Unknown",
    severity: Severity::Medium,
    cwe_id: "CWE-0",
    description: "Potential vulnerability detected",
    recommendation: "Review the flagged function manually.",
};

#[derive(Debug, Clone)]
pub struct VulnerabilityCatalog {
    entries: HashMap<&'static str, CatalogEntry>,
}

impl Default for VulnerabilityCatalog {
    fn default() -> Self {
        let entries = [
            (
                "buffer_overflow",
                CatalogEntry {
                    label: "Buffer Overflow",
                    severity: Severity::High,
                    cwe_id: "CWE-119",
                    description: "A buffer overflow condition exists when a program attempts \
                                  to put more data in a buffer than it can hold.",
                    recommendation: "Bound every copy by the destination size; prefer \
                                     length-checked functions such as snprintf or strncpy.",
                },
            ),
            (
                "format_string",
                CatalogEntry {
                    label: "Format String Vulnerability",
                    severity: Severity::High,
                    cwe_id: "CWE-134",
                    description: "Uncontrolled format string can lead to data leakage or \
                                  code execution.",
                    recommendation: "Never pass external input as the format argument; use \
                                     a constant format such as \"%s\".",
                },
            ),
            (
                "integer_overflow",
                CatalogEntry {
                    label: "Integer Overflow",
                    severity: Severity::Medium,
                    cwe_id: "CWE-190",
                    description: "An integer overflow condition exists when an integer is \
                                  incremented to a value too large to be stored in the \
                                  allocated space.",
                    recommendation: "Check operands against the type's limits before \
                                     arithmetic that feeds sizes or indices.",
                },
            ),
            (
                "resource_leak",
                CatalogEntry {
                    label: "Resource Leak",
                    severity: Severity::Low,
                    cwe_id: "CWE-772",
                    description: "The program does not release a resource after it has \
                                  been used.",
                    recommendation: "Release handles and memory on every exit path.",
                },
            ),
        ];

        Self {
            entries: entries.into_iter().collect(),
        }
    }
}

impl VulnerabilityCatalog {
    /// `"Buffer Overflow"`, `"buffer-overflow"` and `"buffer_overflow"` all
    /// map to the same key
    pub fn normalize_key(label: &str) -> String {
        label
            .trim()
            .to_ascii_lowercase()
            .chars()
            .map(|c| if c == ' ' || c == '-' { '_' } else { c })
            .collect()
    }

    pub fn get(&self, label: &str) -> Option<&CatalogEntry> {
        let key = Self::normalize_key(label);
        if let Some(entry) = self.entries.get(key.as_str()) {
            return Some(entry);
        }
        // Display labels ("Format String Vulnerability") resolve too
        self.entries
            .values()
            .find(|e| Self::normalize_key(e.label) == key)
    }

    pub fn lookup(&self, label: &str) -> &CatalogEntry {
        self.get(label).unwrap_or(&UNKNOWN)
    }

    /// Fill in whatever the classifier left out. Known types get the
    /// catalog's display label; unknown ones keep the reported label.
    pub fn complete(&self, raw: RawFinding) -> Finding {
        let reported = raw
            .vulnerability_type
            .as_deref()
            .map(str::trim)
            .filter(|t| !t.is_empty());
        let (entry, vulnerability_type) = match reported.and_then(|t| self.get(t)) {
            Some(entry) => (entry, entry.label.to_string()),
            None => (&UNKNOWN, reported.unwrap_or(UNKNOWN.label).to_string()),
        };

        let severity = raw
            .severity
            .as_deref()
            .and_then(|s| s.parse::<Severity>().ok())
            .unwrap_or(entry.severity);

        Finding {
            function_name: non_empty(raw.function_name)
                .unwrap_or_else(|| DEFAULT_FUNCTION_NAME.to_string()),
            line_number: raw.line_number.unwrap_or(0),
            severity,
            vulnerability_type,
            cwe_id: non_empty(raw.cwe_id).unwrap_or_else(|| entry.cwe_id.to_string()),
            description: non_empty(raw.description)
                .unwrap_or_else(|| entry.description.to_string()),
            recommendation: non_empty(raw.recommendation)
                .or_else(|| Some(entry.recommendation.to_string())),
            code_snippet: non_empty(raw.code_snippet),
            confidence: raw.confidence_score.unwrap_or(DEFAULT_CONFIDENCE),
        }
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}
