//! genpool - render a list of items with a pool of worker processes.

mod cli;

use std::sync::{Arc, Mutex, MutexGuard};

use anyhow::{Result, anyhow, bail};
use clap::Parser;
use owo_colors::{OwoColorize, Stream::Stderr};
use tracing::{Level, warn};

use cli::{Cli, Commands};
use genpool::command::{CommandOptions, CommandRenderer};
use genpool::logging::{self, LogConfig};
use genpool::master::{HOOK_BUILT, HOOK_DONE};
use genpool::store::{Timer, TimerStore};
use genpool::{Master, ProcessLauncher, RunConfig, RunEvent, RunRequest, paths, report, theme};

/// Subcommand the master re-executes itself with for each worker.
const WORKER_SUBCOMMAND: &str = "internal-worker";

fn main() {
    let cli = Cli::parse();

    if cli.no_color {
        theme::disable_colors();
    }

    let result = match &cli.command {
        Commands::Run(args) => cmd_run(&cli, args),
        Commands::Completions(args) => {
            args.generate();
            Ok(())
        }
        Commands::InternalWorker => run_internal_worker(),
    };

    if let Err(e) = result {
        eprintln!(
            "{}: {}",
            "error"
                .if_supports_color(Stderr, |text| text.red())
                .if_supports_color(Stderr, |text| text.bold()),
            e
        );
        for cause in e.chain().skip(1) {
            eprintln!(
                "  {}: {}",
                "caused by".if_supports_color(Stderr, |text| text.yellow()),
                cause
            );
        }
        std::process::exit(1);
    }
}

/// Set up master logging; returns the level workers should use.
fn init_logging(cli: &Cli) -> Level {
    let mut config = LogConfig::new().with_ansi(!cli.no_color).with_env_overrides();
    if cli.verbosity() != 0 {
        config = config.with_level(logging::adjust_level(cli.verbosity()));
    }
    if let Some(format) = cli.log_format {
        config = config.with_format(format.into());
    }
    if let Some(path) = &cli.log_file {
        config = config.with_file(paths::expand_tilde(path));
    }

    let level = config.level;
    logging::init(config);
    level
}

fn cmd_run(cli: &Cli, args: &cli::RunArgs) -> Result<()> {
    let level = init_logging(cli);

    let config = RunConfig::new()
        .with_workers(args.workers)
        .with_concurrency(args.worker_concurrency)
        .with_fail_on_page_error(args.fail_on_page_error)
        .with_env_overrides()?;

    let options = CommandOptions {
        exec: args.exec.clone(),
        build_cmd: args.build_cmd.clone(),
        items: Some(paths::expand_tilde(&args.items)),
    };

    let launcher = ProcessLauncher::current_exe([WORKER_SUBCOMMAND])?;
    let mut master = Master::new(
        config.clone(),
        Box::new(CommandRenderer::new(options.clone())),
        Box::new(launcher),
    )
    .with_worker_options(serde_json::to_value(&options)?)
    .with_log_level(logging::level_name(level));

    let store = Arc::new(Mutex::new(TimerStore::open_default()));
    if let Err(e) = lock(&store)?.store_time(Timer::Started) {
        warn!(error = %e, "Unable to save run timers");
    }

    let timers = Arc::clone(&store);
    master.hook(HOOK_BUILT, move |_| {
        lock(&timers)?.store_time(Timer::Built)?;
        Ok(())
    });
    let timers = Arc::clone(&store);
    master.hook(HOOK_DONE, move |_| {
        lock(&timers)?.store_time(Timer::Finished)?;
        Ok(())
    });
    let format: report::ReportFormat = args.report.into();
    master.hook(HOOK_DONE, move |event| {
        if let RunEvent::Done(summary) = event {
            report::print_report(summary, format);
        }
        Ok(())
    });

    let params = lock(&store)?.merge_params(args.params.clone().unwrap_or_default());
    let request = RunRequest {
        build: args.build,
        params,
    };

    let Some(summary) = master.run(request)? else {
        return Ok(());
    };

    if summary.has_fatal_exits() {
        bail!("{} worker(s) exited abnormally", summary.fatal_exits());
    }
    if config.fail_on_page_error && summary.has_unhandled_errors() {
        bail!("Stopped on an unhandled item error");
    }
    Ok(())
}

fn lock(store: &Mutex<TimerStore>) -> Result<MutexGuard<'_, TimerStore>> {
    store.lock().map_err(|_| anyhow!("Run timers lock poisoned"))
}

/// Worker process entry point; never returns.
fn run_internal_worker() -> ! {
    std::process::exit(genpool::run_worker_main(CommandRenderer::factory()))
}
