//! EpiView simulator CLI
//!
//! Runs the viewer against seeded synthetic outbreaks and fault scenarios.

use clap::Parser;
use epiview_core::ViewerConfig;
use epiview_sim::scenarios::ScenarioId;
use epiview_sim::{write_png, RerunLogger, ScenarioResult, ScenarioRunner};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

/// EpiView deterministic simulation CLI
#[derive(Parser, Debug)]
#[command(name = "epiview-sim")]
#[command(about = "Run deterministic viewer scenarios for EpiView", long_about = None)]
struct Args {
    /// Master seed for determinism (0 = random from time)
    #[arg(short, long, default_value = "42")]
    seed: u64,

    /// Number of entities in the synthetic contact network
    #[arg(short, long, default_value = "500")]
    entities: usize,

    /// Scenario to run (live_stream, batch_fallback, scrub_storm, ..., all)
    #[arg(short = 'S', long, default_value = "all")]
    scenario: String,

    /// Number of consecutive seeds to run (for CI mode)
    #[arg(long, default_value = "1")]
    seeds: usize,

    /// Maximum virtual duration per run in seconds
    #[arg(short, long, default_value = "30")]
    duration: f64,

    /// Initial playback speed multiplier
    #[arg(long, default_value = "1.0")]
    speed: f64,

    /// Viewer configuration file (JSON)
    #[arg(short, long)]
    config: Option<String>,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,

    /// JSON output for CI parsing
    #[arg(long)]
    json: bool,

    /// Export sampled frames of a single scenario to a JSON file
    #[arg(long)]
    export: Option<String>,

    /// Write the final composited frame of a single scenario as PNG
    #[arg(long)]
    png: Option<String>,

    /// Stream the run to a Rerun viewer (needs the `visualization` feature)
    #[arg(long)]
    rerun: bool,
}

fn init_logging(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}

fn load_config(path: Option<&str>) -> ViewerConfig {
    match path {
        Some(path) => ViewerConfig::from_json_file(path).unwrap_or_else(|e| {
            eprintln!("Error: {}", e);
            std::process::exit(2);
        }),
        None => ViewerConfig::default(),
    }
}

/// Runs one scenario with export, PNG and Rerun output.
fn run_recorded(runner: &ScenarioRunner, scenario: ScenarioId, args: &Args) -> ScenarioResult {
    let logger = if args.rerun {
        RerunLogger::new("epiview-sim")
    } else {
        RerunLogger::disabled()
    };
    let run = runner.run_recorded(scenario, &logger);

    if let Some(path) = &args.export {
        if let Err(e) = run.export.write_to_file(path) {
            error!("Failed to write export: {}", e);
        } else {
            info!("Exported {} frames to {}", run.export.frames.len(), path);
        }
    }
    if let (Some(path), Some(image)) = (&args.png, &run.image) {
        if let Err(e) = write_png(image, path) {
            error!("Failed to write PNG: {}", e);
        }
    }
    run.result
}

fn main() {
    let args = Args::parse();
    init_logging(args.verbose);

    if !args.json {
        info!("EpiView simulator v{}", env!("CARGO_PKG_VERSION"));
        info!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
    }

    let scenarios: Vec<ScenarioId> = if args.scenario == "all" {
        ScenarioId::all()
    } else {
        vec![args.scenario.parse().unwrap_or_else(|e| {
            eprintln!("Error: {}", e);
            let names: Vec<&str> = ScenarioId::all().iter().map(|s| s.name()).collect();
            eprintln!("Available scenarios: {}, all", names.join(", "));
            std::process::exit(1);
        })]
    };

    let recording = args.export.is_some() || args.png.is_some() || args.rerun;
    if recording && (scenarios.len() > 1 || args.seeds > 1) {
        eprintln!("Error: --export, --png and --rerun need a single scenario and seed");
        std::process::exit(1);
    }

    let base_seed = if args.seed == 0 {
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_nanos() as u64)
            .unwrap_or(42)
    } else {
        args.seed
    };

    let config = load_config(args.config.as_deref());
    let mut all_results: Vec<ScenarioResult> = Vec::new();

    for seed_offset in 0..args.seeds {
        let seed = base_seed.wrapping_add(seed_offset as u64);
        let runner = ScenarioRunner::new(seed, args.entities)
            .with_viewer_config(config.clone())
            .with_duration(args.duration)
            .with_speed(args.speed);

        for scenario in &scenarios {
            let result = if recording {
                run_recorded(&runner, *scenario, &args)
            } else {
                runner.run(*scenario)
            };

            if !args.json {
                if result.passed {
                    info!("✓ {} (seed={}) PASSED", scenario.name(), seed);
                } else {
                    error!(
                        "✗ {} (seed={}) FAILED: {}",
                        scenario.name(),
                        seed,
                        result.failure_reason.as_deref().unwrap_or("unknown")
                    );
                }
            }
            all_results.push(result);
        }
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
            Err(e) => eprintln!("Error: {}", e),
        }
    } else {
        info!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
        if failed_count == 0 {
            info!("✅ All {} scenario runs passed!", total);
        } else {
            error!("❌ {}/{} scenario runs failed!", failed_count, total);
            for result in all_results.iter().filter(|r| !r.passed) {
                error!(
                    "  - {} seed={}: {}",
                    result.scenario,
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
