//! Graphform CLI entry point.
//!
//! This binary provides the command-line interface for Graphform.

use clap::Parser;
use graphform::cli::{Cli, Commands};
use graphform::graph::export_graph;
use graphform::hook::{DebugHook, ProgressHook};
use graphform::reporter::Reporter;
use graphform::types::parse_variable_assignments;
use graphform::{
    Config, Context, Description, EngineError, FileStateStore, Plan, ProviderRegistry, State, StateStore,
};
use std::error::Error;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    init_logging(cli.verbose, cli.quiet);

    match run(cli).await {
        Ok(exit_code) => exit_code,
        Err(e) => {
            tracing::error!(error = %e, "Fatal error");

            eprintln!("Error: {e}");

            let mut source = e.source();
            if source.is_some() {
                eprintln!("\nCaused by:");
                let mut i = 0;
                while let Some(cause) = source {
                    eprintln!("  {i}: {cause}");
                    source = cause.source();
                    i += 1;
                }
            }

            // Only graphform frames, with their source locations
            let backtrace = e.backtrace();
            if backtrace.status() == std::backtrace::BacktraceStatus::Captured {
                eprintln!("\nStack backtrace:");
                let rendered = format!("{backtrace}");
                let mut in_graphform = false;
                for line in rendered.lines() {
                    let trimmed = line.trim();
                    if trimmed.contains("graphform::") {
                        in_graphform = true;
                        eprintln!("{line}");
                    } else if in_graphform && trimmed.starts_with("at ") && trimmed.contains("./src/") {
                        eprintln!("{line}");
                        in_graphform = false;
                    } else {
                        in_graphform = false;
                    }
                }
            }

            let code = e
                .downcast_ref::<EngineError>()
                .map_or(1, EngineError::exit_code);
            ExitCode::from(u8::try_from(code).unwrap_or(1))
        }
    }
}

fn init_logging(verbose: u8, quiet: bool) {
    let filter = if quiet {
        EnvFilter::new("error")
    } else {
        // RUST_LOG wins over the verbose flag
        EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            let base_level = match verbose {
                0 => "warn",
                1 => "info",
                2 => "debug",
                _ => "trace",
            };
            EnvFilter::new(format!("warn,graphform={base_level}"))
        })
    };

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(true).with_thread_ids(false).with_writer(std::io::stderr))
        .with(filter)
        .init();
}

async fn run(cli: Cli) -> anyhow::Result<ExitCode> {
    tracing::debug!("Loading configuration");
    let mut config = load_config(&cli)?;
    tracing::debug!("Configuration loaded successfully");

    match cli.command {
        Commands::Plan(args) => {
            config.merge_cli_args(&args.run);
            let description = Description::from_path(&args.description)?;
            let variables = parse_variable_assignments(&args.vars)?;
            let store = state_store(&config);
            let state = store.load()?;

            let context = context(&config)?;
            cancel_on_interrupt(&context);
            let plan = context.plan(&description, &variables, &state).await?;

            if let Some(out) = &args.out {
                plan.write_to(out)?;
                tracing::info!(path = %out.display(), "Plan written");
            }

            let report = Reporter::new(&config).plan_report(&plan, args.format)?;
            emit(&report, args.output.as_deref())?;

            if args.detailed_exitcode && plan.summary().has_changes() {
                Ok(ExitCode::from(2))
            } else {
                Ok(ExitCode::SUCCESS)
            }
        }

        Commands::Apply(args) => {
            config.merge_cli_args(&args.run);
            let store = Arc::new(state_store(&config));
            let state = store.load()?;

            let progress = Arc::new(ProgressHook::new());
            let context = context(&config)?
                .with_hook(progress.clone())
                .with_state_store(store.clone());
            cancel_on_interrupt(&context);

            let plan = match (&args.plan, &args.description) {
                (Some(path), _) => {
                    tracing::debug!(path = %path.display(), "Applying saved plan");
                    Plan::read_from(path)?
                }
                (None, Some(path)) => {
                    let description = Description::from_path(path)?;
                    let variables = parse_variable_assignments(&args.vars)?;
                    context.plan(&description, &variables, &state).await?
                }
                (None, None) => anyhow::bail!("either a description or --plan is required"),
            };

            let result = context.apply(&plan, &state).await?;
            progress.finish(if result.is_success() { "done" } else { "failed" });

            let report = Reporter::new(&config).apply_report(&result, args.format)?;
            emit(&report, args.output.as_deref())?;

            result.into_result()?;
            Ok(ExitCode::SUCCESS)
        }

        Commands::Refresh(args) => {
            config.merge_cli_args(&args.run);
            let description = Description::from_path(&args.description)?;
            let variables = parse_variable_assignments(&args.vars)?;
            let store = Arc::new(state_store(&config));
            let state = store.load()?;
            let before = state.serial;

            let context = context(&config)?.with_state_store(store.clone());
            cancel_on_interrupt(&context);
            let refreshed = context.refresh(&description, &variables, state).await?;

            if refreshed.serial == before {
                println!("No changes; {} resources up to date.", refreshed.resources.len());
            } else {
                println!(
                    "State updated to serial {} ({} resources): {}",
                    refreshed.serial,
                    refreshed.resources.len(),
                    store.path().display()
                );
            }
            Ok(ExitCode::SUCCESS)
        }

        Commands::Graph(args) => {
            let description = Description::from_path(&args.description)?;
            let variables = parse_variable_assignments(&args.vars)?;
            let state = match &args.state {
                Some(path) => FileStateStore::new(path).load()?,
                None => State::new(),
            };

            let graph = context(&config)?.build(&description, &state, &variables)?;
            let rendered = export_graph(&graph, args.format)?;
            emit(&rendered, args.output.as_deref())?;
            Ok(ExitCode::SUCCESS)
        }

        Commands::Validate(args) => {
            let description = Description::from_path(&args.description)?;
            let variables = parse_variable_assignments(&args.vars)?;
            let report = context(&config)?.validate(&description, &variables)?;

            for warning in &report.warnings {
                eprintln!("Warning: {warning}");
            }
            println!(
                "Description is valid: {} ({} instances checked)",
                args.description.display(),
                report.checked
            );
            Ok(ExitCode::SUCCESS)
        }

        Commands::Init => {
            let config_path = Path::new("graphform.yaml");
            if config_path.exists() {
                anyhow::bail!("Configuration file already exists: {}", config_path.display());
            }

            std::fs::write(config_path, Config::example_yaml())?;
            println!("Created example configuration: graphform.yaml");
            Ok(ExitCode::SUCCESS)
        }
    }
}

fn load_config(cli: &Cli) -> anyhow::Result<Config> {
    match Config::locate(cli.config.as_deref()) {
        Some(path) => {
            tracing::debug!(path = %path.display(), "Loading configuration file");
            Ok(Config::from_path(&path)?)
        }
        None => {
            tracing::debug!("No configuration file found, using default configuration");
            Ok(Config::default())
        }
    }
}

fn state_store(config: &Config) -> FileStateStore {
    FileStateStore::new(&config.state.path).with_backup(config.state.backup)
}

/// Engine context with the built-in providers and, when enabled, the debug
/// archive.
fn context(config: &Config) -> anyhow::Result<Context> {
    let mut context = Context::new(config.clone(), ProviderRegistry::with_builtins());
    if config.debug.enabled {
        let parent = config.debug.dir.clone().unwrap_or_else(|| PathBuf::from("."));
        context = context.with_hook(Arc::new(DebugHook::new(parent)?));
    }
    Ok(context)
}

/// Stop scheduling new vertices on Ctrl-C; running ones finish and their
/// results are still recorded.
fn cancel_on_interrupt(context: &Context) {
    let token = context.cancel_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("Interrupted, waiting for running operations to finish");
            token.cancel();
        }
    });
}

fn emit(content: &str, output: Option<&Path>) -> anyhow::Result<()> {
    if let Some(path) = output {
        std::fs::write(path, content)?;
        tracing::info!(path = %path.display(), "Report written");
    } else {
        println!("{content}");
    }
    Ok(())
}
