//! SARIF v2.1.0 output formatter for CI/CD integration.
//!
//! Produces SARIF JSON compatible with GitHub code scanning and other
//! SARIF consumers.

use std::collections::BTreeMap;

use serde::Serialize;

use crate::diagnostic::{Diagnostic, Location, Severity};
use crate::rules::get_rule;

// ---------------------------------------------------------------------------
// SARIF v2.1.0 data model
// ---------------------------------------------------------------------------

/// SARIF v2.1.0 root object.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SarifLog {
    #[serde(rename = "$schema")]
    pub schema: String,
    pub version: String,
    pub runs: Vec<SarifRun>,
}

/// A single SARIF run (one tool execution).
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SarifRun {
    pub tool: SarifTool,
    pub results: Vec<SarifResult>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SarifTool {
    pub driver: SarifDriver,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SarifDriver {
    pub name: String,
    pub version: String,
    pub rules: Vec<SarifRule>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SarifRule {
    pub id: String,
    pub short_description: SarifMessage,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub full_description: Option<SarifMessage>,
    pub default_configuration: SarifRuleConfig,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SarifRuleConfig {
    pub level: String,
}

/// One finding.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SarifResult {
    pub rule_id: String,
    pub level: String,
    pub message: SarifMessage,
    pub locations: Vec<SarifLocation>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub related_locations: Vec<SarifLocation>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SarifMessage {
    pub text: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SarifLocation {
    pub physical_location: SarifPhysicalLocation,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<SarifMessage>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SarifPhysicalLocation {
    pub artifact_location: SarifArtifactLocation,
    pub region: SarifRegion,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SarifArtifactLocation {
    pub uri: String,
}

/// A region within a file (1-based).
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SarifRegion {
    pub start_line: u32,
    pub start_column: u32,
    #[serde(skip_serializing_if = "is_zero")]
    pub end_line: u32,
    #[serde(skip_serializing_if = "is_zero")]
    pub end_column: u32,
}

fn is_zero(v: &u32) -> bool {
    *v == 0
}

// ---------------------------------------------------------------------------
// Conversion functions
// ---------------------------------------------------------------------------

/// Convert diagnostics to a pretty-printed SARIF JSON string.
pub fn to_sarif(diagnostics: &[Diagnostic], version: &str) -> Result<String, serde_json::Error> {
    serde_json::to_string_pretty(&to_sarif_log(diagnostics, version))
}

pub fn to_sarif_log(diagnostics: &[Diagnostic], version: &str) -> SarifLog {
    SarifLog {
        schema: "https://raw.githubusercontent.com/oasis-tcs/sarif-spec/main/sarif-2.1/schema/sarif-schema-2.1.0.json".into(),
        version: "2.1.0".into(),
        runs: vec![SarifRun {
            tool: SarifTool {
                driver: SarifDriver {
                    name: "goat".into(),
                    version: version.into(),
                    rules: collect_rules(diagnostics),
                },
            },
            results: diagnostics.iter().map(diagnostic_to_sarif_result).collect(),
        }],
    }
}

fn severity_to_sarif_level(severity: Severity) -> String {
    match severity {
        Severity::Critical | Severity::Error => "error".into(),
        Severity::Warning => "warning".into(),
        Severity::Info => "note".into(),
    }
}

fn sarif_location(location: &Location, message: Option<&str>) -> SarifLocation {
    SarifLocation {
        physical_location: SarifPhysicalLocation {
            artifact_location: SarifArtifactLocation {
                uri: location.file.clone(),
            },
            region: SarifRegion {
                start_line: location.line,
                start_column: location.column,
                end_line: location.end_line,
                end_column: location.end_column,
            },
        },
        message: message.map(|text| SarifMessage { text: text.into() }),
    }
}

fn diagnostic_to_sarif_result(diag: &Diagnostic) -> SarifResult {
    let message_text = if diag.explanation.is_empty() {
        diag.title.clone()
    } else {
        diag.explanation.clone()
    };

    SarifResult {
        rule_id: diag.rule.clone(),
        level: severity_to_sarif_level(diag.severity),
        message: SarifMessage { text: message_text },
        locations: vec![sarif_location(&diag.location, None)],
        related_locations: diag
            .related
            .iter()
            .map(|r| sarif_location(&r.location, Some(&r.message)))
            .collect(),
    }
}

/// Unique rule definitions, one per rule code, described from the catalog.
fn collect_rules(diagnostics: &[Diagnostic]) -> Vec<SarifRule> {
    let mut seen: BTreeMap<String, SarifRule> = BTreeMap::new();

    for diag in diagnostics {
        seen.entry(diag.rule.clone()).or_insert_with(|| {
            let info = get_rule(&diag.rule);
            SarifRule {
                id: diag.rule.clone(),
                short_description: SarifMessage {
                    text: info
                        .as_ref()
                        .map_or_else(|| diag.title.clone(), |r| r.name.clone()),
                },
                full_description: info.map(|r| SarifMessage {
                    text: r.description,
                }),
                default_configuration: SarifRuleConfig {
                    level: severity_to_sarif_level(diag.severity),
                },
            }
        });
    }

    seen.into_values().collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::diagnostic::{DiagnosticBuilder, DiagnosticSource};

    fn make_test_diag(rule: &str, severity: Severity, file: &str, line: u32) -> Diagnostic {
        DiagnosticBuilder::new(rule, severity, format!("{rule} issue"), DiagnosticSource::Blocking)
            .location(file, line, 5)
            .explanation(format!("Explanation for {rule}"))
            .entry("main.main")
            .build()
    }

    #[test]
    fn test_sarif_schema_and_tool() {
        let log = to_sarif_log(&[], "0.3.0");
        assert_eq!(log.version, "2.1.0");
        assert!(log.schema.contains("sarif"));
        assert_eq!(log.runs.len(), 1);
        assert_eq!(log.runs[0].tool.driver.name, "goat");
        assert!(log.runs[0].results.is_empty());
    }

    #[test]
    fn test_sarif_result_mapping() {
        let diag = DiagnosticBuilder::new(
            "BLOCK001",
            Severity::Critical,
            "deadlock",
            DiagnosticSource::Blocking,
        )
        .location("gossip.go", 18, 2)
        .explanation("main.main blocks on Lock")
        .related("gossip.go", 30, 2, "worker blocks on Lock")
        .build();
        let log = to_sarif_log(&[diag], "0.3.0");
        let result = &log.runs[0].results[0];
        assert_eq!(result.rule_id, "BLOCK001");
        assert_eq!(result.level, "error");
        assert_eq!(result.locations[0].physical_location.region.start_line, 18);
        assert_eq!(result.related_locations.len(), 1);
        assert_eq!(
            result.related_locations[0].message.as_ref().unwrap().text,
            "worker blocks on Lock"
        );
    }

    #[test]
    fn test_sarif_severity_mapping() {
        assert_eq!(severity_to_sarif_level(Severity::Critical), "error");
        assert_eq!(severity_to_sarif_level(Severity::Error), "error");
        assert_eq!(severity_to_sarif_level(Severity::Warning), "warning");
        assert_eq!(severity_to_sarif_level(Severity::Info), "note");
    }

    #[test]
    fn test_sarif_rules_come_from_catalog() {
        let diags = vec![
            make_test_diag("BLOCK002", Severity::Error, "a.go", 1),
            make_test_diag("BLOCK002", Severity::Error, "b.go", 2),
            make_test_diag("PANIC001", Severity::Critical, "c.go", 3),
        ];
        let log = to_sarif_log(&diags, "0.3.0");
        let rules = &log.runs[0].tool.driver.rules;
        assert_eq!(rules.len(), 2);
        assert_eq!(rules[0].id, "BLOCK002");
        assert_eq!(rules[0].short_description.text, "Goroutine leak");
        assert!(rules[1].full_description.is_some());
    }

    #[test]
    fn test_sarif_json_valid() {
        let diags = vec![make_test_diag("BLOCK003", Severity::Warning, "main.go", 10)];
        let json = to_sarif(&diags, "0.3.0").unwrap();
        let parsed: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed["runs"][0]["results"][0]["ruleId"], "BLOCK003");
        assert_eq!(parsed["runs"][0]["results"][0]["level"], "warning");
        assert!(parsed["runs"][0]["results"][0].get("relatedLocations").is_none());
    }
}
