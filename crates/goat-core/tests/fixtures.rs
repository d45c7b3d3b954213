//! End-to-end runs over the JSON fixtures shared with the CLI tests.

use goat_core::{analyze_program, Outcome, RunSettings};
use goat_diagnostics::rules::{DEADLOCK, DEFINITE_PANIC, LEAK};
use goat_ir::load_fixture;
use goat_upfront::FragmentPolicy;

fn rules(name: &str, settings: &RunSettings) -> Vec<String> {
    let report = analyze_program(&load_fixture(name), settings).unwrap();
    assert!(!report.has_failures(), "{name} did not complete");
    report.diagnostics(0).into_iter().map(|d| d.rule).collect()
}

#[test]
fn test_fixtures_under_every_policy() {
    for policy in FragmentPolicy::ALL {
        let settings = RunSettings {
            policy,
            ..RunSettings::default()
        };
        assert!(rules("handoff", &settings).is_empty(), "{policy}");
        assert_eq!(rules("leak", &settings), vec![LEAK], "{policy}");
        assert_eq!(rules("double_lock", &settings), vec![DEADLOCK], "{policy}");
        assert_eq!(rules("send_on_closed", &settings), vec![DEFINITE_PANIC], "{policy}");
    }
}

#[test]
fn test_leak_diagnostic_points_at_second_send() {
    let report = analyze_program(&load_fixture("leak"), &RunSettings::default()).unwrap();
    let diags = report.diagnostics(0);
    assert_eq!(diags[0].id, "BLOCK002-main.go:3");
    assert_eq!(diags[0].location.line, 3);
}

#[test]
fn test_spawn_loop_entry_panics() {
    let report = analyze_program(&load_fixture("spawn_loop"), &RunSettings::default()).unwrap();
    assert_eq!(report.summary.panicked, 1);
    assert_eq!(report.entries[0].outcome, Outcome::Panic);
    assert!(report.diagnostics(0).is_empty());
}

#[test]
fn test_dangling_operand_is_rejected() {
    let path = std::path::Path::new(env!("CARGO_MANIFEST_DIR"))
        .join("../goat-cli/tests/fixtures/dangling_operand.json");
    let err = goat_core::analyze_file(&path, &RunSettings::default()).unwrap_err();
    assert!(matches!(err, goat_core::OrchestratorError::Input(_)));
}
