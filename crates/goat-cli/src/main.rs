use std::io::IsTerminal;
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::Context as _;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use goat_core::config::{self, Config, OutputFormat};
use goat_core::{analyze_file, AnalysisReport, OrchestratorError};
use goat_diagnostics::rules::get_rule;
use goat_diagnostics::Severity;

/// "0.3.0 (abc12345)"
fn long_version() -> &'static str {
    concat!(env!("CARGO_PKG_VERSION"), " (", env!("GOAT_GIT_HASH"), ")")
}

#[derive(Parser)]
#[command(name = "goat")]
#[command(about = "Static detection of blocking bugs in Go message-passing programs")]
#[command(version, long_version = long_version())]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Analyze an exported SSA program for deadlocks, leaks and panics
    Check(CheckArgs),
    /// Explain a rule in detail
    Explain {
        /// Rule code (e.g., BLOCK001)
        rule: String,
    },
    /// Write a default goat.toml in the current directory
    Init,
}

#[derive(clap::Args)]
struct CheckArgs {
    /// SSA and points-to input (JSON)
    input: PathBuf,
    /// Output format: human, json, sarif
    #[arg(long)]
    format: Option<OutputFormat>,
    /// Fragment policy: singleton, same-func, total, gcatch, scc
    #[arg(long)]
    policy: Option<String>,
    /// Analyze only functions whose name ends with this suffix
    #[arg(long)]
    entry: Option<String>,
    /// Per entry and P-set (0 = no deadline)
    #[arg(long)]
    deadline_ms: Option<u64>,
    /// Call-string length distinguishing function contexts
    #[arg(long)]
    context_depth: Option<usize>,
    /// Also analyze Test* functions
    #[arg(long)]
    include_tests: bool,
    /// Include per-entry metrics in the report
    #[arg(long)]
    metrics: bool,
    /// Include a listing of the superlocation graph in the report
    #[arg(long)]
    visualize: bool,
    /// Model standard-library primitives precisely
    #[arg(long)]
    no_skip_goroot: bool,
    /// Keep call sites with many callees in the call graph
    #[arg(long)]
    no_prune: bool,
    /// Configuration file (default: nearest goat.toml)
    #[arg(long)]
    config: Option<PathBuf>,
    /// Max findings to report (0 = unlimited)
    #[arg(long)]
    max_findings: Option<usize>,
    /// Hide findings below this severity: info, warning, error, critical
    #[arg(long)]
    severity_threshold: Option<Severity>,
    /// Disable colored output
    #[arg(long)]
    no_color: bool,
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    // Log to stderr so stdout stays clean for machine output
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .init();

    match cli.command {
        Commands::Check(args) => match run_check(args) {
            Ok(code) => code,
            Err(e) => {
                eprintln!("error: {e:#}");
                ExitCode::from(2)
            }
        },
        Commands::Explain { rule } => run_explain(&rule),
        Commands::Init => run_init(),
    }
}

/// Resolve the configuration file and apply command-line overrides.
fn resolve_config(args: &CheckArgs) -> Result<Config, OrchestratorError> {
    let mut config = match &args.config {
        Some(path) => config::load_config_file(path)?,
        None => {
            let dir = args
                .input
                .parent()
                .filter(|p| !p.as_os_str().is_empty())
                .unwrap_or_else(|| Path::new("."));
            config::load_config(dir)?
        }
    };
    let goat = &mut config.goat;
    if let Some(policy) = &args.policy {
        goat.fragment_policy = policy.clone();
    }
    if let Some(entry) = &args.entry {
        goat.entry_function = entry.clone();
    }
    if let Some(deadline) = args.deadline_ms {
        goat.deadline_ms = deadline;
    }
    if let Some(depth) = args.context_depth {
        goat.call_context_depth = depth;
    }
    goat.include_tests |= args.include_tests;
    goat.metrics |= args.metrics;
    goat.visualize |= args.visualize;
    if args.no_skip_goroot {
        goat.skip_goroot = false;
    }
    if args.no_prune {
        goat.prune_large_callsites = false;
    }
    if let Some(format) = args.format {
        config.output.format = format;
    }
    if let Some(max) = args.max_findings {
        config.output.max_findings = max;
    }
    if let Some(threshold) = args.severity_threshold {
        config.output.severity_threshold = threshold;
    }
    Ok(config)
}

fn run_check(args: CheckArgs) -> anyhow::Result<ExitCode> {
    let config = resolve_config(&args)?;
    let settings = config.settings()?;
    tracing::info!(input = %args.input.display(), policy = %settings.policy, "checking");
    let report = analyze_file(&args.input, &settings)
        .with_context(|| format!("analyzing {}", args.input.display()))?;

    let threshold = config.output.severity_threshold;
    let mut diagnostics = report.diagnostics(0);
    diagnostics.retain(|d| d.severity.is_at_least(threshold));
    let max = config.output.max_findings;
    if max > 0 {
        diagnostics.truncate(max);
    }
    match config.output.format {
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        OutputFormat::Sarif => {
            let sarif = goat_diagnostics::sarif::to_sarif(&diagnostics, env!("CARGO_PKG_VERSION"))?;
            println!("{sarif}");
        }
        OutputFormat::Human => {
            let use_color = !args.no_color && std::io::stdout().is_terminal();
            print!("{}", goat_diagnostics::human::format_human(&diagnostics, use_color));
            print_incomplete(&report);
        }
    }

    Ok(exit_code(&report, threshold))
}

/// Entries that did not finish, listed after the findings.
fn print_incomplete(report: &AnalysisReport) {
    for entry in report.entries.iter().filter(|e| e.outcome != goat_core::Outcome::Complete) {
        let reason = entry
            .error
            .as_ref()
            .map_or("deadline elapsed", |e| e.message.as_str());
        println!(
            "{} ({}): {:?}: {reason}",
            entry.entry,
            entry.root,
            entry.outcome
        );
    }
}

/// 2 when an entry did not complete, 1 when something at or above the
/// severity threshold was found, 0 otherwise.
fn exit_code(report: &AnalysisReport, threshold: Severity) -> ExitCode {
    if report.has_failures() {
        ExitCode::from(2)
    } else if report.has_findings_at(threshold) {
        ExitCode::from(1)
    } else {
        ExitCode::SUCCESS
    }
}

fn run_explain(rule: &str) -> ExitCode {
    let Some(info) = get_rule(rule) else {
        eprintln!("Unknown rule: {rule}");
        eprintln!("Available rules: BLOCK001, BLOCK002, BLOCK003, PANIC001");
        return ExitCode::from(2);
    };
    println!("{}: {} ({})\n", info.code, info.name, info.severity);
    println!("{}", info.description);
    if let Some(bad) = &info.example_bad {
        println!("\nExample:\n{}", indent(bad));
    }
    if let Some(good) = &info.example_good {
        println!("\nFix:\n{}", indent(good));
    }
    if let Some(idiom) = &info.go_idiom {
        println!("\nIdiom: {idiom}");
    }
    ExitCode::SUCCESS
}

fn indent(code: &str) -> String {
    code.lines()
        .map(|l| format!("  {l}"))
        .collect::<Vec<_>>()
        .join("\n")
}

fn run_init() -> ExitCode {
    let path = Path::new(config::CONFIG_FILE_NAME);
    if path.exists() {
        eprintln!("{} already exists", config::CONFIG_FILE_NAME);
        return ExitCode::from(2);
    }
    match std::fs::write(path, config::DEFAULT_CONFIG_TOML) {
        Ok(()) => {
            println!("Created {}", config::CONFIG_FILE_NAME);
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("error: {e}");
            ExitCode::from(2)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;
    use goat_upfront::FragmentPolicy;

    #[test]
    fn test_cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_every_policy_name_is_accepted() {
        for policy in FragmentPolicy::ALL {
            let cli = Cli::try_parse_from(["goat", "check", "in.json", "--policy", policy.as_str()])
                .unwrap();
            let Commands::Check(args) = cli.command else {
                panic!("expected check");
            };
            let mut config = Config::default();
            config.goat.fragment_policy = args.policy.unwrap();
            assert_eq!(config.settings().unwrap().policy, policy);
        }
    }

    #[test]
    fn test_missing_explicit_config_is_an_error() {
        let cli = Cli::try_parse_from(["goat", "check", "in.json", "--config", "/nonexistent/goat.toml"])
            .unwrap();
        let Commands::Check(args) = cli.command else {
            panic!("expected check");
        };
        assert!(resolve_config(&args).is_err());
    }

    #[test]
    fn test_overrides_apply_on_top_of_file() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("goat.toml"),
            "[goat]\nfragment_policy = \"scc\"\ndeadline_ms = 100\n",
        )
        .unwrap();
        let cli = Cli::try_parse_from([
            "goat",
            "check",
            dir.path().join("in.json").to_str().unwrap(),
            "--deadline-ms",
            "5",
            "--no-prune",
            "--format",
            "json",
            "--severity-threshold",
            "critical",
        ])
        .unwrap();
        let Commands::Check(args) = cli.command else {
            panic!("expected check");
        };
        let config = resolve_config(&args).unwrap();
        let settings = config.settings().unwrap();
        assert_eq!(settings.policy, FragmentPolicy::Scc);
        assert_eq!(
            settings.analysis.deadline,
            Some(std::time::Duration::from_millis(5))
        );
        assert_eq!(settings.upfront.prune_threshold, None);
        assert_eq!(config.output.format, OutputFormat::Json);
        assert_eq!(config.output.severity_threshold, Severity::Critical);
    }

    #[test]
    fn test_unknown_severity_threshold_is_rejected() {
        assert!(Cli::try_parse_from(["goat", "check", "in.json", "--severity-threshold", "fatal"]).is_err());
    }
}
