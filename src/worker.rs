//! Worker side of the pool: pull a batch, render it, report, repeat.
//!
//! A worker registers with the master, asks for its first batch and then
//! answers every batch with an error report (if any) followed by a new
//! request. An empty batch, or the master closing the channel, ends it.

use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::sync::mpsc;

use serde_json::Value;
use tracing::{debug, error};

use crate::broker::ipc::{LineReader, PipeFd};
use crate::broker::{Event, MASTER_ALIAS, ProcessTransport, TransportRef, dispatch, services};
use crate::context::{Mailbox, WorkerContext};
use crate::error::{GenError, Result};
use crate::launcher::{WorkerPayload, spawn};
use crate::logging;
use crate::queue::WorkItem;
use crate::renderer::{ErrorRecord, ItemRenderer, RendererFactory};

/// Alias a worker registers under.
pub fn worker_alias(worker_id: u32) -> String {
    format!("worker {}", worker_id)
}

/// Per-worker settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerOptions {
    pub id: u32,
    /// Exit after reporting the first unhandled item error.
    pub fail_on_page_error: bool,
}

impl WorkerOptions {
    pub fn from_payload(id: u32, payload: &WorkerPayload) -> Self {
        Self {
            id,
            fail_on_page_error: payload.cli_options.fail_on_page_error,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WorkerState {
    Init,
    AwaitingBatch,
    Processing,
    ReportingErrors,
    Terminated,
}

/// One worker endpoint.
pub struct Worker {
    options: WorkerOptions,
    ctx: WorkerContext<Worker>,
    renderer: Box<dyn ItemRenderer>,
    state: WorkerState,
    exit_code: i32,
    processed: usize,
}

impl Worker {
    pub fn new(options: WorkerOptions, ctx: WorkerContext<Worker>, renderer: Box<dyn ItemRenderer>) -> Self {
        let mut worker = Self {
            options,
            ctx,
            renderer,
            state: WorkerState::Init,
            exit_code: 0,
            processed: 0,
        };
        worker
            .ctx
            .broker
            .on(services::REQUEST_ROUTES, |worker: &mut Worker, request| {
                let batch: Vec<WorkItem> = request.payload()?;
                worker.handle_batch(batch);
                Ok(())
            });
        worker
    }

    pub fn id(&self) -> u32 {
        self.options.id
    }

    /// Run until terminated and return the exit status.
    pub fn run(mut self) -> i32 {
        if let Err(e) = self.start() {
            error!(worker_id = self.id(), error = %e, "Worker failed to start");
            return 1;
        }

        while self.state != WorkerState::Terminated {
            match self.ctx.mailbox.recv() {
                Some(Event::Message { message, peer }) => {
                    let routed = self.ctx.broker.route(message, peer);
                    dispatch(&mut self, routed);
                }
                Some(Event::Disconnected) | None => {
                    debug!(worker_id = self.id(), "Master closed the channel");
                    self.terminate(0);
                }
                Some(Event::Exit { .. }) => {}
            }
        }

        debug!(
            worker_id = self.id(),
            processed = self.processed,
            exit_code = self.exit_code,
            "Worker finished"
        );
        self.ctx.broker.disconnect();
        self.exit_code
    }

    fn start(&mut self) -> Result<()> {
        self.renderer
            .init()
            .and_then(|_| self.renderer.initiate())
            .map_err(|e| GenError::Renderer(format!("{:#}", e)))?;

        self.ctx.broker.register_with_master();
        self.request_batch();
        Ok(())
    }

    fn request_batch(&mut self) {
        self.state = WorkerState::AwaitingBatch;
        self.ctx.broker.send(None, services::REQUEST_ROUTES, &Value::Null);
    }

    fn terminate(&mut self, code: i32) {
        self.exit_code = code;
        self.state = WorkerState::Terminated;
    }

    fn handle_batch(&mut self, batch: Vec<WorkItem>) {
        if self.state == WorkerState::Terminated {
            return;
        }
        if batch.is_empty() {
            debug!(worker_id = self.id(), "No more routes");
            self.terminate(0);
            return;
        }

        debug!(worker_id = self.id(), "received {} routes", batch.len());
        self.state = WorkerState::Processing;

        let renderer = &mut self.renderer;
        let failures = match panic::catch_unwind(AssertUnwindSafe(|| renderer.process_batch(&batch))) {
            Ok(Ok(failures)) => failures,
            Ok(Err(e)) => {
                error!(worker_id = self.id(), error = %format!("{:#}", e), "Exception while generating routes, exiting");
                self.terminate(1);
                return;
            }
            Err(_) => {
                error!(worker_id = self.id(), "Renderer panicked while generating routes, exiting");
                self.terminate(1);
                return;
            }
        };
        self.processed += batch.len();

        let errors: Vec<ErrorRecord> = failures
            .into_iter()
            .map(|failure| failure.into_record(self.id()))
            .collect();

        let mut fatal = false;
        for record in errors.iter().filter(|r| r.is_unhandled()) {
            if self.options.fail_on_page_error {
                error!(worker_id = self.id(), item = %record.item, "Unhandled page error occurred for route");
                fatal = true;
            } else {
                error!(worker_id = self.id(), item = %record.item, detail = %record.detail, "Unhandled error for route");
            }
        }

        if !errors.is_empty() {
            self.state = WorkerState::ReportingErrors;
            self.ctx.broker.send(None, services::HANDLE_ERRORS, &errors);
        }

        if fatal {
            self.terminate(1);
        } else {
            self.request_batch();
        }
    }
}

/// Entry point of a worker process started by
/// [`ProcessLauncher`](crate::launcher::ProcessLauncher).
///
/// Reads its payload from the environment, talks to the master over
/// stdin/stdout and returns the process exit status.
pub fn run_worker_main(factory: RendererFactory) -> i32 {
    // Pipe errors surface as io::Error instead of killing the worker.
    unsafe {
        nix::sys::signal::signal(
            nix::sys::signal::Signal::SIGPIPE,
            nix::sys::signal::SigHandler::SigIgn,
        )
        .ok();
    }

    let (worker_id, payload) = match spawn::worker_id_from_env()
        .and_then(|id| WorkerPayload::from_env().map(|payload| (id, payload)))
    {
        Ok(found) => found,
        Err(e) => {
            eprintln!("genpool worker: {}", e);
            return 1;
        }
    };

    let alias = worker_alias(worker_id);
    let upstream: TransportRef = Arc::new(ProcessTransport::stdout(MASTER_ALIAS));
    let mailbox = Mailbox::new();
    let ctx = WorkerContext::with_mailbox(alias.clone(), mailbox, Arc::clone(&upstream));

    logging::init_forwarding(
        logging::Forwarder::new(ctx.broker.id(), &alias, upstream),
        payload.log_level.as_deref(),
    );

    let renderer = match factory(&payload) {
        Ok(renderer) => renderer,
        Err(e) => {
            error!(worker_id, error = %format!("{:#}", e), "Unable to create renderer");
            return 1;
        }
    };

    if let Err(e) = spawn_stdin_reader(ctx.mailbox.sender()) {
        error!(worker_id, error = %e, "Unable to read from master");
        return 1;
    }

    Worker::new(WorkerOptions::from_payload(worker_id, &payload), ctx, renderer).run()
}

/// Feed frames from the master (stdin) into the worker's mailbox.
fn spawn_stdin_reader(events: mpsc::Sender<Event>) -> Result<()> {
    // Safety: fd 0 is open for the lifetime of the process and only read here.
    let mut reader = LineReader::new(unsafe { PipeFd::from_raw(0) });
    spawn::spawn_collector_thread("stdin-reader", move || {
        loop {
            match reader.read_message() {
                Ok(Some(message)) => {
                    if events.send(Event::Message { message, peer: None }).is_err() {
                        return;
                    }
                }
                Ok(None) => break,
                Err(GenError::Transport(e)) => debug!(error = %e, "Dropping malformed frame"),
                Err(_) => break,
            }
        }
        let _ = events.send(Event::Disconnected);
    })?;
    Ok(())
}
