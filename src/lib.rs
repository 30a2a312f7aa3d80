//! genpool - pull-based batch generation over a pool of worker processes.
//!
//! A [`Master`] enumerates work items, keeps them in a de-duplicated queue and
//! hands them out in batches to workers that ask for more whenever they are
//! done. Workers render items with an [`ItemRenderer`] and report failures
//! back; the run is over once every worker exited.
//!
//! ```no_run
//! use genpool::command::{CommandOptions, CommandRenderer};
//! use genpool::{Master, RunConfig, RunRequest, ThreadLauncher};
//!
//! let options = CommandOptions { exec: "echo {}".into(), ..Default::default() };
//! let mut master = Master::new(
//!     RunConfig::new().with_workers(2),
//!     Box::new(CommandRenderer::new(options.clone())),
//!     Box::new(ThreadLauncher::new(CommandRenderer::factory())),
//! )
//! .with_worker_options(serde_json::to_value(&options)?);
//! if let Some(summary) = master.run(RunRequest::default())? {
//!     println!("{} items in {}s", summary.routes_processed(), summary.duration_secs());
//! }
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

pub mod broker;
pub mod command;
pub mod config;
pub mod context;
pub mod error;
pub mod hooks;
pub mod launcher;
pub mod logging;
pub mod master;
pub mod paths;
pub mod queue;
pub mod renderer;
pub mod report;
pub mod store;
pub mod theme;
pub mod watchdog;
pub mod worker;

pub use config::RunConfig;
pub use error::{GenError, Result};
pub use launcher::{Launcher, ProcessLauncher, ThreadLauncher};
pub use master::{Master, RunEvent, RunRequest, RunSummary};
pub use renderer::{ItemRenderer, RendererFactory};
pub use worker::run_worker_main;
