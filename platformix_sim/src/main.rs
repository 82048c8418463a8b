//! Platformix test harness CLI
//!
//! Runs the built-in scenarios and reports which tests met their
//! expectations.

use clap::Parser;
use platformix_core::FarmConfig;
use platformix_sim::scenarios::ScenarioId;
use platformix_sim::{ScenarioResult, ScenarioRunner, SequenceDiagram, TestRunner};
use tracing::{error, info, Level};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

/// Platformix test harness CLI
#[derive(Parser, Debug)]
#[command(name = "platformix-sim")]
#[command(about = "Run Platformix test scenarios", long_about = None)]
struct Args {
    /// Seed of the bus context and of seeded stimulus
    #[arg(short, long, default_value = "42")]
    seed: u64,

    /// Scenario to run (platformix_smoke, arith_mock, arith_sequence, dependency_chain, all)
    #[arg(short = 'S', long, default_value = "all")]
    scenario: String,

    /// Run only these tests (single scenario only)
    #[arg(short, long)]
    include: Vec<String>,

    /// Skip these tests
    #[arg(short = 'x', long)]
    exclude: Vec<String>,

    /// Don't start and stop platforms around each test
    #[arg(long)]
    no_start_stop: bool,

    /// List tests without running them
    #[arg(long)]
    dry_run: bool,

    /// Override a generic of the environment, as name=value
    #[arg(short = 'g', long = "generic", value_parser = parse_generic)]
    generics: Vec<(String, String)>,

    /// Use the wall clock instead of the manual bus clock
    #[arg(long)]
    real_time: bool,

    /// Log every channel delivery
    #[arg(long)]
    print_messages: bool,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,

    /// JSON output for CI parsing
    #[arg(long)]
    json: bool,

    /// Export the bus conversation as a sequence diagram (single scenario only)
    #[arg(long)]
    export: Option<String>,
}

fn parse_generic(text: &str) -> Result<(String, String), String> {
    match text.split_once('=') {
        Some((name, value)) if !name.is_empty() => Ok((name.to_string(), value.to_string())),
        _ => Err(format!("expected name=value, got {}", text)),
    }
}

fn report(result: &ScenarioResult) {
    for record in &result.report.records {
        let mark = if record.as_expected() { "✓" } else { "✗" };
        info!("  {} {} [{}] ({:.3}s)", mark, record.name, record.outcome, record.elapsed_secs);
    }
    if result.passed {
        info!("✓ {} (seed={}) PASSED", result.scenario.name(), result.seed);
    } else {
        error!(
            "✗ {} (seed={}) FAILED: {}",
            result.scenario.name(),
            result.seed,
            result.failure_reason.as_deref().unwrap_or("unknown")
        );
    }
}

fn main() {
    let args = Args::parse();

    // Initialize logging; RUST_LOG wins over --verbose
    let level = if args.verbose { Level::DEBUG } else { Level::INFO };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level.as_str()));
    let subscriber = FmtSubscriber::builder().with_env_filter(filter).finish();
    if let Err(e) = tracing::subscriber::set_global_default(subscriber) {
        eprintln!("Failed to set tracing subscriber: {}", e);
    }

    if !args.json {
        info!("Platformix test harness v{}", env!("CARGO_PKG_VERSION"));
        info!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
    }

    let scenarios: Vec<ScenarioId> = if args.scenario == "all" {
        ScenarioId::all().to_vec()
    } else {
        vec![args.scenario.parse().unwrap_or_else(|e| {
            eprintln!("Error: {}", e);
            eprintln!(
                "Available scenarios: {}, all",
                ScenarioId::all().iter().map(|s| s.name()).collect::<Vec<_>>().join(", ")
            );
            std::process::exit(1);
        })]
    };

    if scenarios.len() > 1 && (!args.include.is_empty() || args.export.is_some()) {
        eprintln!("Error: --include and --export only support a single scenario, not 'all'");
        std::process::exit(1);
    }

    let tests = TestRunner::new()
        .with_start_stop(!args.no_start_stop)
        .with_include((!args.include.is_empty()).then(|| args.include.clone()))
        .with_exclude(args.exclude.clone())
        .with_dry_run(args.dry_run);
    let mut config = FarmConfig::default();
    config.print_messages = args.print_messages;
    let runner = ScenarioRunner::new(args.seed)
        .with_real_time(args.real_time)
        .with_generics(args.generics.clone())
        .with_config(config)
        .with_test_runner(tests);

    let mut all_results: Vec<ScenarioResult> = Vec::new();
    for scenario in &scenarios {
        if !args.json {
            info!("{}: {}", scenario.name(), scenario.description());
        }
        let (result, env) = runner.run_with_env(*scenario);

        if let (Some(path), Some(env)) = (&args.export, &env) {
            let mut diagram = SequenceDiagram::new(scenario.name(), args.seed);
            diagram.capture(env.farm());
            match diagram.write_to_file(path) {
                Ok(()) => info!("Exported {} relations to {}", diagram.relations.len(), path),
                Err(e) => error!("Failed to write export: {:?}", e),
            }
        }

        if !args.json {
            report(&result);
        }
        all_results.push(result);
    }

    let total = all_results.len();
    let failed_count = all_results.iter().filter(|r| !r.passed).count();

    if args.json {
        let summary = serde_json::json!({
            "total": total,
            "passed": total - failed_count,
            "failed": failed_count,
            "results": all_results,
        });
        match serde_json::to_string_pretty(&summary) {
            Ok(text) => println!("{}", text),
            Err(e) => error!("Failed to serialize results: {}", e),
        }
    } else {
        info!("");
        info!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");

        if failed_count == 0 {
            info!("✅ All {} scenarios passed!", total);
        } else {
            error!("❌ {}/{} scenarios failed!", failed_count, total);
            for result in all_results.iter().filter(|r| !r.passed) {
                error!(
                    "  - {} seed={}: {}",
                    result.scenario.name(),
                    result.seed,
                    result.failure_reason.as_deref().unwrap_or("unknown")
                );
            }
        }
    }

    if failed_count > 0 {
        std::process::exit(1);
    }
}
