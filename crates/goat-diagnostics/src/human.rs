//! Human-readable diagnostic output formatter.
//!
//! Uses ariadne for rich terminal output with source context.

use crate::diagnostic::{Diagnostic, Severity};
use ariadne::{Color, Config, Label, Report, ReportKind, Source};
use std::collections::HashMap;

/// Format diagnostics for human-readable terminal output.
pub fn format_human(diags: &[Diagnostic], use_color: bool) -> String {
    if diags.is_empty() {
        return "No blocking bugs found\n".to_string();
    }

    let mut output = Vec::new();
    let mut source_cache: HashMap<String, String> = HashMap::new();

    let config = Config::default().with_color(use_color);

    for diag in diags {
        let file = &diag.location.file;

        let source_text = source_cache
            .entry(file.clone())
            .or_insert_with(|| std::fs::read_to_string(file).unwrap_or_default())
            .clone();

        if source_text.is_empty() {
            output.push(format_fallback(diag));
            continue;
        }

        let kind = match diag.severity {
            Severity::Critical | Severity::Error => ReportKind::Error,
            Severity::Warning => ReportKind::Warning,
            Severity::Info => ReportKind::Advice,
        };
        let color = match diag.severity {
            Severity::Critical | Severity::Error => Color::Red,
            Severity::Warning => Color::Yellow,
            Severity::Info => Color::Cyan,
        };

        let span = label_span(&source_text, diag.location.line, diag.location.column);
        let mut report = Report::build(kind, (file.as_str(), span.clone()))
            .with_config(config)
            .with_code(&diag.rule)
            .with_message(&diag.title)
            .with_label(
                Label::new((file.as_str(), span))
                    .with_message(&diag.explanation)
                    .with_color(color),
            );

        // Related spans are labelled only when they live in the same file.
        for related in diag.related.iter().filter(|r| &r.location.file == file) {
            let span = label_span(&source_text, related.location.line, related.location.column);
            report = report.with_label(
                Label::new((file.as_str(), span))
                    .with_message(&related.message)
                    .with_color(Color::Blue),
            );
        }
        if !diag.path.is_empty() {
            report = report.with_note(format!("path:\n{}", diag.path.join("\n")));
        }
        report = report.with_help(format!("reached from {}", diag.entry));

        let mut buf = Vec::new();
        report
            .finish()
            .write((file.as_str(), Source::from(source_text.as_str())), &mut buf)
            .ok();

        output.push(String::from_utf8_lossy(&buf).to_string());
    }

    let count = |s: Severity| diags.iter().filter(|d| d.severity == s).count();
    output.push(format!(
        "\nFound {} issue(s): {} critical, {} error, {} warning\n",
        diags.len(),
        count(Severity::Critical),
        count(Severity::Error),
        count(Severity::Warning),
    ));

    output.join("\n")
}

fn label_span(source: &str, line: u32, col: u32) -> std::ops::Range<usize> {
    let offset = line_col_to_offset(source, line, col);
    offset..(offset + 1).min(source.len())
}

/// Convert 1-based line:column to byte offset in source text.
fn line_col_to_offset(source: &str, line: u32, col: u32) -> usize {
    let line = line.saturating_sub(1) as usize;
    let col = col.saturating_sub(1) as usize;

    let offset: usize = source
        .lines()
        .take(line)
        .map(|l| l.len() + 1) // +1 for newline
        .sum();

    (offset + col).min(source.len().saturating_sub(1))
}

/// Fallback format when source file is not available.
fn format_fallback(diag: &Diagnostic) -> String {
    let mut out = format!(
        "{}: {} [{}] {}: {}\n",
        diag.location, diag.severity, diag.rule, diag.title, diag.explanation,
    );
    for related in &diag.related {
        out.push_str(&format!("  {}: {}\n", related.location, related.message));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::diagnostic::{DiagnosticBuilder, DiagnosticSource};

    fn make_diag(rule: &str, severity: Severity, file: &str, line: u32) -> Diagnostic {
        DiagnosticBuilder::new(rule, severity, format!("test issue {rule}"), DiagnosticSource::Blocking)
            .location(file, line, 1)
            .explanation(format!("explanation for {rule}"))
            .entry("main.main")
            .build()
    }

    #[test]
    fn test_empty_diagnostics() {
        assert_eq!(format_human(&[], false), "No blocking bugs found\n");
    }

    #[test]
    fn test_fallback_no_source() {
        let diag = DiagnosticBuilder::new(
            "BLOCK001",
            Severity::Critical,
            "deadlock",
            DiagnosticSource::Blocking,
        )
        .location("/nonexistent/main.go", 10, 2)
        .explanation("main.main blocks on Lock")
        .related("/nonexistent/main.go", 14, 2, "worker blocks on receive")
        .build();
        assert_eq!(
            format_human(&[diag], false),
            "/nonexistent/main.go:10:2: critical [BLOCK001] deadlock: main.main blocks on Lock\n  \
             /nonexistent/main.go:14:2: worker blocks on receive\n\n\
             \nFound 1 issue(s): 1 critical, 0 error, 0 warning\n"
        );
    }

    #[test]
    fn test_source_snippet_is_rendered() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("main.go");
        std::fs::write(&path, "package main\n\nfunc main() {\n\tch := make(chan int)\n\t<-ch\n}\n").unwrap();
        let diag = make_diag("BLOCK002", Severity::Error, path.to_str().unwrap(), 5);
        let out = format_human(&[diag], false);
        assert!(out.contains("BLOCK002"));
        assert!(out.contains("<-ch"));
        assert!(out.contains("reached from main.main"));
    }

    #[test]
    fn test_summary_counts() {
        let diags = vec![
            make_diag("BLOCK001", Severity::Critical, "/fake.go", 1),
            make_diag("BLOCK002", Severity::Error, "/fake.go", 2),
            make_diag("BLOCK003", Severity::Warning, "/fake.go", 3),
        ];
        let result = format_human(&diags, false);
        assert!(result.contains("Found 3 issue(s)"));
        assert!(result.contains("1 critical"));
        assert!(result.contains("1 error"));
        assert!(result.contains("1 warning"));
    }

    #[test]
    fn test_line_col_to_offset() {
        let src = "line1\nline2\nline3\n";
        assert_eq!(line_col_to_offset(src, 1, 1), 0);
        assert_eq!(line_col_to_offset(src, 2, 1), 6);
        assert_eq!(line_col_to_offset(src, 2, 3), 8);
        assert_eq!(line_col_to_offset("abc", 100, 1), 2);
    }
}
