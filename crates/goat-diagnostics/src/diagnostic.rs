//! Core diagnostic types.
//!
//! Every blocking bug and definite panic the analysis reports becomes a
//! `Diagnostic`; all formatters (human, JSON, SARIF) consume them.

use serde::{Deserialize, Serialize};

/// A finding produced for one entry function.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Diagnostic {
    /// Unique ID: RULE_CODE-file:line (e.g., "BLOCK002-main.go:12").
    pub id: String,
    /// Rule code (e.g., "BLOCK001", "PANIC001").
    pub rule: String,
    pub severity: Severity,
    /// One-line summary.
    pub title: String,
    /// Detailed explanation of why the goroutine cannot proceed.
    pub explanation: String,
    /// The blocked or panicking operation.
    pub location: Location,
    /// Operations of the other goroutines involved.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub related: Vec<RelatedLocation>,
    /// Transitions leading from the entry to the finding.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub path: Vec<String>,
    /// Entry function the finding was reached from.
    pub entry: String,
    pub source: DiagnosticSource,
}

/// Severity level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Warning,
    Error,
    /// The program hangs or crashes outright.
    Critical,
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Info => write!(f, "info"),
            Self::Warning => write!(f, "warning"),
            Self::Error => write!(f, "error"),
            Self::Critical => write!(f, "critical"),
        }
    }
}

impl std::str::FromStr for Severity {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "info" => Ok(Self::Info),
            "warning" => Ok(Self::Warning),
            "error" => Ok(Self::Error),
            "critical" => Ok(Self::Critical),
            other => Err(format!("unknown severity {other:?}")),
        }
    }
}

impl Severity {
    pub fn is_at_least(&self, threshold: Severity) -> bool {
        *self >= threshold
    }
}

/// Source code location.
///
/// Lines and columns are 1-based (matching Go's `token.Position`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Location {
    pub file: String,
    pub line: u32,
    pub column: u32,
    pub end_line: u32,
    pub end_column: u32,
}

impl std::fmt::Display for Location {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}:{}", self.file, self.line, self.column)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelatedLocation {
    pub location: Location,
    pub message: String,
}

/// Which kind of finding produced the diagnostic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DiagnosticSource {
    Blocking,
    Panic,
}

impl std::fmt::Display for DiagnosticSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Blocking => write!(f, "blocking"),
            Self::Panic => write!(f, "panic"),
        }
    }
}

/// Builder for creating diagnostics conveniently.
pub struct DiagnosticBuilder {
    rule: String,
    severity: Severity,
    title: String,
    location: Location,
    source: DiagnosticSource,
    explanation: String,
    related: Vec<RelatedLocation>,
    path: Vec<String>,
    entry: String,
}

impl DiagnosticBuilder {
    pub fn new(
        rule: impl Into<String>,
        severity: Severity,
        title: impl Into<String>,
        source: DiagnosticSource,
    ) -> Self {
        Self {
            rule: rule.into(),
            severity,
            title: title.into(),
            location: Location {
                file: String::new(),
                line: 0,
                column: 0,
                end_line: 0,
                end_column: 0,
            },
            source,
            explanation: String::new(),
            related: Vec::new(),
            path: Vec::new(),
            entry: String::new(),
        }
    }

    pub fn location(mut self, file: impl Into<String>, line: u32, column: u32) -> Self {
        self.location = Location {
            file: file.into(),
            line,
            column,
            end_line: line,
            end_column: column,
        };
        self
    }

    pub fn end_location(mut self, end_line: u32, end_column: u32) -> Self {
        self.location.end_line = end_line;
        self.location.end_column = end_column;
        self
    }

    pub fn explanation(mut self, explanation: impl Into<String>) -> Self {
        self.explanation = explanation.into();
        self
    }

    /// Add a secondary location, such as another goroutine of a deadlock.
    pub fn related(
        mut self,
        file: impl Into<String>,
        line: u32,
        column: u32,
        message: impl Into<String>,
    ) -> Self {
        self.related.push(RelatedLocation {
            location: Location {
                file: file.into(),
                line,
                column,
                end_line: line,
                end_column: column,
            },
            message: message.into(),
        });
        self
    }

    pub fn path(mut self, path: Vec<String>) -> Self {
        self.path = path;
        self
    }

    pub fn entry(mut self, entry: impl Into<String>) -> Self {
        self.entry = entry.into();
        self
    }

    pub fn build(self) -> Diagnostic {
        let id = format!("{}-{}:{}", self.rule, self.location.file, self.location.line);
        Diagnostic {
            id,
            rule: self.rule,
            severity: self.severity,
            title: self.title,
            explanation: self.explanation,
            location: self.location,
            related: self.related,
            path: self.path,
            entry: self.entry,
            source: self.source,
        }
    }
}

/// Counts of findings per severity.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AnalysisSummary {
    pub critical: usize,
    pub error: usize,
    pub warning: usize,
    pub info: usize,
    pub analysis_time_ms: u64,
}

impl AnalysisSummary {
    pub fn from_diagnostics(diagnostics: &[Diagnostic], analysis_time_ms: u64) -> Self {
        let mut summary = Self {
            analysis_time_ms,
            ..Self::default()
        };
        for diag in diagnostics {
            match diag.severity {
                Severity::Critical => summary.critical += 1,
                Severity::Error => summary.error += 1,
                Severity::Warning => summary.warning += 1,
                Severity::Info => summary.info += 1,
            }
        }
        summary
    }

    pub fn total(&self) -> usize {
        self.critical + self.error + self.warning + self.info
    }

    /// Whether there are any issues at or above a severity threshold.
    pub fn has_issues_above(&self, threshold: Severity) -> bool {
        match threshold {
            Severity::Info => self.total() > 0,
            Severity::Warning => self.warning + self.error + self.critical > 0,
            Severity::Error => self.error + self.critical > 0,
            Severity::Critical => self.critical > 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn leak() -> Diagnostic {
        DiagnosticBuilder::new(
            "BLOCK002",
            Severity::Error,
            "goroutine leak",
            DiagnosticSource::Blocking,
        )
        .location("main.go", 12, 3)
        .explanation("main.main$1 blocks forever on send")
        .entry("main.main")
        .build()
    }

    #[test]
    fn test_diagnostic_builder() {
        let diag = DiagnosticBuilder::new(
            "BLOCK001",
            Severity::Critical,
            "deadlock",
            DiagnosticSource::Blocking,
        )
        .location("main.go", 18, 5)
        .end_location(18, 14)
        .related("main.go", 25, 2, "main.main blocks on receive")
        .path(vec!["start".into(), "go by main.main".into()])
        .entry("main.main")
        .build();

        assert_eq!(diag.id, "BLOCK001-main.go:18");
        assert_eq!(diag.location.end_column, 14);
        assert_eq!(diag.related.len(), 1);
        assert_eq!(diag.related[0].location.line, 25);
        assert_eq!(diag.path.len(), 2);
    }

    #[test]
    fn test_severity_ordering() {
        assert!(Severity::Critical > Severity::Error);
        assert!(Severity::Error > Severity::Warning);
        assert!(Severity::Warning > Severity::Info);
        assert!(Severity::Warning.is_at_least(Severity::Warning));
        assert!(!Severity::Info.is_at_least(Severity::Warning));
    }

    #[test]
    fn test_severity_parses_its_display() {
        for s in [Severity::Info, Severity::Warning, Severity::Error, Severity::Critical] {
            assert_eq!(s.to_string().parse::<Severity>(), Ok(s));
        }
        assert!("fatal".parse::<Severity>().is_err());
    }

    #[test]
    fn test_analysis_summary() {
        let mut partial = leak();
        partial.severity = Severity::Warning;
        let summary = AnalysisSummary::from_diagnostics(&[leak(), partial], 40);
        assert_eq!(summary.error, 1);
        assert_eq!(summary.warning, 1);
        assert_eq!(summary.total(), 2);
        assert!(summary.has_issues_above(Severity::Error));
        assert!(!summary.has_issues_above(Severity::Critical));
        insta::assert_yaml_snapshot!(summary, @r"
        critical: 0
        error: 1
        warning: 1
        info: 0
        analysis_time_ms: 40
        ");
    }

    #[test]
    fn test_empty_path_and_related_are_omitted_from_json() {
        let json = serde_json::to_string(&leak()).unwrap();
        assert!(!json.contains("related"));
        assert!(!json.contains("\"path\""));
        let parsed: Diagnostic = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, leak());
    }

    #[test]
    fn test_location_display() {
        assert_eq!(leak().location.to_string(), "main.go:12:3");
    }
}
