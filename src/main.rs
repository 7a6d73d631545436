//! WdlRunner CLI Entry Point
//!
//! Provides command-line interface for workflow execution.
//!
//! # Usage
//!
//! ```bash
//! # Run a document's workflow with inputs
//! wdlrunner pipeline.yaml inputs.json
//!
//! # Run one task of the document
//! wdlrunner pipeline.yaml inputs.json --target align
//!
//! # Configuration file, run directory root and parallelism
//! wdlrunner pipeline.yaml inputs.json --config wdlrunner.yaml --run-dir /scratch/runs --parallel 8
//!
//! # Reuse results of earlier runs
//! wdlrunner pipeline.yaml inputs.json --cache
//! ```

use std::env;
use std::fs;
use std::path::PathBuf;
use std::process::ExitCode;

use colored::Colorize;
use log::{error, info, warn};
use tokio_util::sync::CancellationToken;

use wdlrunner::{load_document, values_from_json, values_to_json, Config, Engine, Error};
use wdlrunner::{APP_NAME, VERSION};

/// Command-line options parsed from arguments.
#[derive(Debug, Default)]
struct Options {
    document: Option<String>,
    inputs: Option<String>,
    config_path: Option<PathBuf>,
    run_dir: Option<PathBuf>,
    parallel: Option<usize>,
    cache: Option<bool>,
    target: Option<String>,
    verbose: bool,
}

/// Configures the logging system with appropriate formatting.
fn setup_logging(verbose: bool) {
    let level = if verbose { "debug" } else { "info" };

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level))
        .format(|buf, record| {
            use std::io::Write;

            match record.level() {
                log::Level::Warn | log::Level::Error => {
                    writeln!(buf, "[{}] {}", record.level(), record.args())
                }
                _ => writeln!(buf, "{}", record.args()),
            }
        })
        .init();
}

/// Prints usage information.
fn print_usage() {
    println!("Usage: wdlrunner [OPTIONS] <DOCUMENT> [INPUTS_JSON]");
    println!();
    println!("Arguments:");
    println!("  <DOCUMENT>          Workflow document (YAML or JSON)");
    println!("  [INPUTS_JSON]       Inputs as a JSON object");
    println!();
    println!("Options:");
    println!("  --target NAME       Task or workflow to run (default: the document's workflow)");
    println!("  --config PATH       Engine configuration file (YAML)");
    println!("  --run-dir PATH      Directory under which run directories are created");
    println!("  --parallel N        Maximum concurrently running nodes");
    println!("  --cache             Enable the call cache");
    println!("  --no-cache          Disable the call cache");
    println!("  --verbose           Enable debug logging");
    println!("  --help              Show this help message");
    println!("  --version           Show version information");
}

/// Parses command-line arguments into [`Options`].
fn parse_arguments(args: &[String]) -> Result<Options, String> {
    let mut options = Options::default();
    let mut positional_index = 0;
    let mut i = 1; // Skip program name

    let value = |i: usize, flag: &str| -> Result<String, String> {
        args.get(i)
            .cloned()
            .ok_or_else(|| format!("{} requires an argument", flag))
    };

    while i < args.len() {
        let arg = &args[i];

        match arg.as_str() {
            "--help" | "-h" => {
                print_usage();
                std::process::exit(0);
            }
            "--version" | "-V" => {
                println!("{} {}", APP_NAME, VERSION);
                std::process::exit(0);
            }
            "--verbose" | "-v" => options.verbose = true,
            "--cache" => options.cache = Some(true),
            "--no-cache" => options.cache = Some(false),
            "--target" => {
                i += 1;
                options.target = Some(value(i, arg.as_str())?);
            }
            "--config" => {
                i += 1;
                options.config_path = Some(PathBuf::from(value(i, arg.as_str())?));
            }
            "--run-dir" => {
                i += 1;
                options.run_dir = Some(PathBuf::from(value(i, arg.as_str())?));
            }
            "--parallel" => {
                i += 1;
                let n = value(i, arg.as_str())?;
                options.parallel = Some(
                    n.parse()
                        .map_err(|_| format!("Invalid parallel value: {}", n))?,
                );
            }
            arg if arg.starts_with('-') => {
                return Err(format!("Unknown option: {}", arg));
            }
            _ => {
                match positional_index {
                    0 => options.document = Some(arg.clone()),
                    1 => options.inputs = Some(arg.clone()),
                    _ => return Err(format!("Unexpected argument: {}", arg)),
                }
                positional_index += 1;
            }
        }
        i += 1;
    }

    if options.document.is_none() {
        return Err("missing <DOCUMENT> argument".to_string());
    }
    Ok(options)
}

/// File configuration (or defaults), then environment, then flags.
fn load_config(options: &Options) -> Result<Config, Error> {
    let mut config = match &options.config_path {
        Some(path) => Config::load(path)?,
        None => Config::from_env()?,
    };
    if let Some(dir) = &options.run_dir {
        config.run_root = dir.clone();
    }
    if let Some(n) = options.parallel {
        config.max_concurrency = n;
    }
    if let Some(enabled) = options.cache {
        config.call_cache.enabled = enabled;
    }
    config.validate()?;
    Ok(config)
}

/// Prints the failed node, its position and message, and the run directory.
fn report_failure(e: &Error) {
    eprintln!();
    match e {
        Error::RunFailed(run) => {
            eprintln!("{}", "Run failed".red().bold());
            eprintln!("  {:<10} {}", "node:", run.failure.node.bold());
            eprintln!("  {:<10} {}", "position:", run.failure.pos);
            eprintln!("  {:<10} {}", "error:", run.failure.error);
            if let Error::CallFailed { stderr, .. } = run.root_cause() {
                if let Some(last) = stderr.lines().last() {
                    eprintln!("  {:<10} {}", "stderr:", last.dimmed());
                }
            }
            for other in &run.secondary {
                eprintln!("  {:<10} {}", "also:", other);
            }
            eprintln!("  {:<10} {}", "run dir:", run.run_dir.display());
        }
        Error::Cancelled => eprintln!("{}", "Run cancelled".yellow().bold()),
        other => eprintln!("{} {}", "Error:".red().bold(), other),
    }
}

async fn run(options: Options) -> Result<(), Error> {
    let config = load_config(&options)?;
    let document_path = options.document.unwrap_or_default();
    let document = load_document(&document_path)?;
    let target = document.target(options.target.as_deref())?;

    let json = match &options.inputs {
        Some(path) => {
            let text = fs::read_to_string(path)
                .map_err(|e| Error::Input(format!("failed to read {}: {}", path, e)))?;
            serde_json::from_str(&text)?
        }
        None => serde_json::json!({}),
    };
    let inputs = values_from_json(
        &json,
        &target.available_inputs(),
        Some(&target.required_inputs()),
        target.name(),
    )?;
    info!("{} v{}: running {} from {}", APP_NAME, VERSION, target.name(), document_path);

    let cancel = CancellationToken::new();
    let interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, waiting for running calls to finish");
            interrupt.cancel();
        }
    });

    let engine = Engine::new().with_config(config).with_cancellation(cancel);
    let outcome = engine.run(&target, inputs).await?;

    let outputs = serde_json::json!({
        "outputs": values_to_json(&outcome.outputs, target.name()),
        "dir": outcome.run_dir.to_string_lossy(),
    });
    println!("{}", serde_json::to_string_pretty(&outputs)?);
    Ok(())
}

fn main() -> ExitCode {
    let args: Vec<String> = env::args().collect();
    let options = match parse_arguments(&args) {
        Ok(options) => options,
        Err(e) => {
            eprintln!("Error: {}", e);
            eprintln!();
            print_usage();
            return ExitCode::FAILURE;
        }
    };
    setup_logging(options.verbose);

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(runtime) => runtime,
        Err(e) => {
            error!("Failed to start async runtime: {}", e);
            return ExitCode::FAILURE;
        }
    };
    match runtime.block_on(run(options)) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            report_failure(&e);
            ExitCode::FAILURE
        }
    }
}
