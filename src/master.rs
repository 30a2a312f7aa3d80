//! Master side of the pool.
//!
//! The master owns the work queue and the worker pool. A run goes
//!
//! ```text
//! Init -> Build | Initiate -> CollectingRoutes -> Spawning -> Running -> Draining -> Done
//! ```
//!
//! Everything after spawning happens on one event loop: route requests,
//! error reports, forwarded logs and worker exits are handled one at a time
//! in arrival order, so the queue and the watchdog need no locking. The run
//! is finished the moment the watchdog has recorded an exit for every
//! worker; that is the only place `done` is reached from.

use std::time::{Duration, Instant};

use serde::Serialize;
use serde_json::Value;
use tracing::{debug, error, info, warn};

use crate::broker::{Event, MASTER_ALIAS, Message, Request, dispatch, services};
use crate::config::RunConfig;
use crate::context::RunContext;
use crate::error::{GenError, Result};
use crate::hooks::HookRegistry;
use crate::launcher::{Launcher, WorkerPayload};
use crate::logging::{self, LogRecord};
use crate::queue::WorkQueue;
use crate::renderer::{ErrorRecord, ItemRenderer, Params};
use crate::watchdog::{
    ExitInfo, IS_WORKER_ALIVE, STAT_ERRORS, STAT_ROUTES, Stat, Watchdog, WorkerRecord, round_tenths, serialize_secs,
};

/// Hook fired after the build step, with the run params.
pub const HOOK_BUILT: &str = "built";
/// Hook fired once per run after every worker exited, with the summary.
pub const HOOK_DONE: &str = "done";

/// Arguments of [`Master::run`].
#[derive(Debug, Clone, Default)]
pub struct RunRequest {
    /// Run the renderer's build step first.
    pub build: bool,
    pub params: Params,
}

/// What a finished run reports.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunSummary {
    #[serde(serialize_with = "serialize_secs")]
    pub duration: Duration,
    pub errors: Vec<ErrorRecord>,
    pub worker_info: Vec<WorkerRecord>,
}

impl RunSummary {
    /// Wall time in seconds, rounded to 0.1.
    pub fn duration_secs(&self) -> f64 {
        round_tenths(self.duration)
    }

    /// Any worker ended with a nonzero status or a signal.
    pub fn has_fatal_exits(&self) -> bool {
        self.worker_info.iter().any(WorkerRecord::is_fatal)
    }

    /// Workers that ended with a nonzero status or a signal.
    pub fn fatal_exits(&self) -> usize {
        self.worker_info.iter().filter(|w| w.is_fatal()).count()
    }

    pub fn has_unhandled_errors(&self) -> bool {
        self.errors.iter().any(ErrorRecord::is_unhandled)
    }

    /// Items handed out in total.
    pub fn routes_processed(&self) -> u64 {
        self.worker_info.iter().map(WorkerRecord::routes_processed).sum()
    }
}

/// Payload of master hooks.
#[derive(Debug, Clone)]
pub enum RunEvent {
    Built(Params),
    Done(RunSummary),
}

/// Where a run currently is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MasterState {
    Init,
    Build,
    Initiate,
    CollectingRoutes,
    Spawning,
    Running,
    Draining,
    Done,
}

type Completion = Box<dyn FnMut(&RunSummary) -> anyhow::Result<()> + Send>;

/// The coordinator.
pub struct Master {
    config: RunConfig,
    worker_options: Value,
    log_level: Option<String>,
    ctx: RunContext<Master>,
    renderer: Box<dyn ItemRenderer>,
    launcher: Box<dyn Launcher>,
    queue: WorkQueue,
    errors: Vec<ErrorRecord>,
    hooks: HookRegistry<RunEvent>,
    completion: Option<Completion>,
    state: MasterState,
    initialized: bool,
    started: Instant,
    next_worker_id: u32,
    /// Highest worker id of previous runs.
    run_base_id: u32,
}

impl Master {
    pub fn new(config: RunConfig, renderer: Box<dyn ItemRenderer>, launcher: Box<dyn Launcher>) -> Self {
        let mut ctx: RunContext<Master> = RunContext::new(Watchdog::new());

        let live = launcher.live();
        ctx.watchdog
            .hook(IS_WORKER_ALIVE, move |record| Ok(live.contains(record.id)));

        ctx.broker
            .on(services::REQUEST_ROUTES, |master: &mut Master, request: Request| {
                master.send_routes(request)
            });
        ctx.broker
            .on(services::HANDLE_ERRORS, |master: &mut Master, request: Request| {
                let errors: Vec<ErrorRecord> = request.payload()?;
                master.save_errors(&request, errors);
                Ok(())
            });
        ctx.broker.on(services::LOG, |_: &mut Master, request: Request| {
            let record: LogRecord = request.payload()?;
            logging::emit_forwarded(&record);
            Ok(())
        });

        Self {
            config,
            worker_options: Value::Null,
            log_level: None,
            ctx,
            renderer,
            launcher,
            queue: WorkQueue::new(),
            errors: Vec::new(),
            hooks: HookRegistry::new(),
            completion: None,
            state: MasterState::Init,
            initialized: false,
            started: Instant::now(),
            next_worker_id: 0,
            run_base_id: 0,
        }
    }

    /// Renderer options shipped to every worker.
    pub fn with_worker_options(mut self, options: Value) -> Self {
        self.worker_options = options;
        self
    }

    /// Log level workers should run at.
    pub fn with_log_level(mut self, level: impl Into<String>) -> Self {
        self.log_level = Some(level.into());
        self
    }

    /// Subscribe to [`HOOK_BUILT`] or [`HOOK_DONE`].
    pub fn hook<F>(&mut self, name: &str, callback: F)
    where
        F: FnMut(&RunEvent) -> anyhow::Result<()> + Send + 'static,
    {
        self.hooks.hook(name, callback);
    }

    /// Callback run at completion, before the `done` hooks.
    pub fn on_complete<F>(&mut self, callback: F)
    where
        F: FnMut(&RunSummary) -> anyhow::Result<()> + Send + 'static,
    {
        self.completion = Some(Box::new(callback));
    }

    pub fn state(&self) -> MasterState {
        self.state
    }

    pub fn watchdog(&self) -> &Watchdog {
        &self.ctx.watchdog
    }

    pub fn queue(&self) -> &WorkQueue {
        &self.queue
    }

    /// Errors collected so far in the current run.
    pub fn errors(&self) -> &[ErrorRecord] {
        &self.errors
    }

    /// Run to completion.
    ///
    /// Returns the summary handed to the `done` hook, or `None` when there
    /// was nothing to do.
    pub fn run(&mut self, request: RunRequest) -> Result<Option<RunSummary>> {
        if !self.prepare(request)? {
            return Ok(None);
        }
        self.event_loop()
    }

    /// Everything up to and including spawning workers. Returns `false`
    /// when no items were found and the run is already over.
    pub fn prepare(&mut self, request: RunRequest) -> Result<bool> {
        self.started = Instant::now();
        self.run_base_id = self.next_worker_id;
        self.init()?;

        if request.build {
            self.state = MasterState::Build;
            self.renderer
                .build(&request.params)
                .map_err(|e| GenError::Renderer(format!("Build failed: {:#}", e)))?;
            self.hooks
                .call_hook(HOOK_BUILT, &RunEvent::Built(request.params.clone()));
        } else {
            self.state = MasterState::Initiate;
            self.renderer
                .initiate()
                .map_err(|e| GenError::Renderer(format!("{:#}", e)))?;
        }

        self.state = MasterState::CollectingRoutes;
        self.get_routes(&request.params);

        if self.queue.is_empty() {
            warn!("No routes so not starting workers");
            self.state = MasterState::Done;
            return Ok(false);
        }

        self.state = MasterState::Spawning;
        self.start_workers()?;
        self.state = MasterState::Running;
        Ok(true)
    }

    /// Handle events until the run is done.
    pub fn event_loop(&mut self) -> Result<Option<RunSummary>> {
        loop {
            let event = self
                .ctx
                .mailbox
                .recv()
                .ok_or_else(|| GenError::Disconnected(MASTER_ALIAS.to_string()))?;
            if let Some(summary) = self.handle_event(event) {
                return Ok(Some(summary));
            }
        }
    }

    /// Handle one event. Returns the summary when it finished the run.
    pub fn handle_event(&mut self, event: Event) -> Option<RunSummary> {
        match event {
            Event::Message { message, peer } => {
                let routed = self.ctx.broker.route(message, peer);
                dispatch(self, routed);
                None
            }
            Event::Exit { worker_id, exit } => self.on_exit(worker_id, exit),
            Event::Disconnected => None,
        }
    }

    fn init(&mut self) -> Result<()> {
        if self.initialized {
            return Ok(());
        }
        self.renderer
            .init()
            .map_err(|e| GenError::Renderer(format!("{:#}", e)))?;
        self.initialized = true;
        Ok(())
    }

    /// Enumerate items into the queue. Failure counts as zero items.
    fn get_routes(&mut self, params: &Params) -> bool {
        info!("retrieving routes");
        match self.renderer.enumerate_items(params) {
            Ok(items) => {
                let added = self.queue.enqueue(items);
                debug!(added, "Routes enqueued");
                info!("{} routes will be generated", self.queue.len());
                true
            }
            Err(e) => {
                warn!(error = %format!("{:#}", e), "No routes collected");
                false
            }
        }
    }

    /// Top the pool up to `min(workers, queue length)`.
    fn start_workers(&mut self) -> Result<usize> {
        let wanted = self.config.worker_count().min(self.queue.len());
        let alive = self.ctx.watchdog.count_alive();

        let mut started = 0;
        for _ in alive..wanted {
            match self.spawn_worker() {
                Ok(()) => started += 1,
                Err(e) => error!(error = %e, "Unable to start worker"),
            }
        }

        if alive + started == 0 {
            return Err(GenError::NoWorkers);
        }
        Ok(started)
    }

    fn spawn_worker(&mut self) -> Result<()> {
        self.next_worker_id += 1;
        let worker_id = self.next_worker_id;

        let mut payload = WorkerPayload::new(self.worker_options.clone(), self.config.fail_on_page_error);
        payload.log_level = self.log_level.clone();

        let pid = self
            .launcher
            .launch(worker_id, &payload, self.ctx.mailbox.sender())?;
        self.ctx.watchdog.add_worker(worker_id, pid);
        info!(worker_id, pid, "worker {} started with pid {}", worker_id, pid);
        Ok(())
    }

    /// `requestRoutes`: answer with the next batch, or end the worker.
    fn send_routes(&mut self, request: Request) -> Result<()> {
        let Some(peer) = request.peer else {
            warn!(sender = %request.sender_id, "Route request without a transport, ignoring");
            return Ok(());
        };

        let batch = self
            .queue
            .take_batch(self.config.worker_count(), self.config.concurrency);
        let sender = self.ctx.broker.id().to_string();

        if batch.is_empty() {
            info!(worker_id = peer.worker_id, "no more routes, exiting worker {}", peer.worker_id);
            self.state = MasterState::Draining;
            let goodbye = Message::new(sender, &request.sender_id, services::REQUEST_ROUTES, Value::Array(Vec::new()));
            if let Err(e) = peer.transport.send(&goodbye) {
                debug!(worker_id = peer.worker_id, error = %e, "Worker already gone");
            }
            return peer.transport.disconnect();
        }

        debug!(worker_id = peer.worker_id, "sending {} routes to worker {}", batch.len(), peer.worker_id);
        self.ctx
            .watchdog
            .append_info(peer.worker_id, STAT_ROUTES, Stat::Counter(batch.len() as u64));
        let message = Message::new(
            sender,
            &request.sender_id,
            services::REQUEST_ROUTES,
            serde_json::to_value(&batch)?,
        );
        peer.transport.send(&message)
    }

    /// `handleErrors`: keep every reported error.
    fn save_errors(&mut self, request: &Request, errors: Vec<ErrorRecord>) {
        if errors.is_empty() {
            return;
        }
        let worker_id = request
            .peer
            .as_ref()
            .map(|peer| peer.worker_id)
            .unwrap_or(errors[0].worker_id);
        self.ctx
            .watchdog
            .append_info(worker_id, STAT_ERRORS, Stat::Counter(errors.len() as u64));
        self.errors.extend(errors);
    }

    fn on_exit(&mut self, worker_id: u32, exit: ExitInfo) -> Option<RunSummary> {
        if self.ctx.watchdog.get(worker_id).is_none() {
            warn!(worker_id, "Exit of unknown worker");
            return None;
        }

        let mut message = format!("worker {} exited", worker_id);
        if exit.code != 0 {
            message.push_str(&format!(" with status code {}", exit.code));
        }
        if let Some(signal) = exit.signal.as_deref().filter(|s| !s.is_empty()) {
            message.push_str(&format!(" by signal {}", signal));
        }
        let fatal = exit.is_fatal();
        self.ctx.watchdog.exit_worker(worker_id, exit);

        if fatal {
            error!(worker_id, "{}", message);
        } else {
            info!(worker_id, "{}", message);
        }

        let running = matches!(self.state, MasterState::Running | MasterState::Draining);
        if running && self.ctx.watchdog.all_dead() {
            Some(self.done())
        } else {
            None
        }
    }

    fn done(&mut self) -> RunSummary {
        let workers: Vec<WorkerRecord> = self
            .ctx
            .watchdog
            .records()
            .filter(|record| record.id > self.run_base_id)
            .cloned()
            .collect();

        for worker in &workers {
            let mut line = format!(
                "worker {} generated {} routes in {}s",
                worker.id,
                worker.routes_processed(),
                round_tenths(worker.duration)
            );
            if worker.error_count() > 0 {
                line.push_str(&format!(" with {} error(s)", worker.error_count()));
            }
            info!(worker_id = worker.id, "{}", line);
        }

        if let Err(e) = self.renderer.after_run() {
            error!(error = %format!("{:#}", e), "After-run step failed");
        }

        let summary = RunSummary {
            duration: self.started.elapsed(),
            errors: std::mem::take(&mut self.errors),
            worker_info: workers,
        };

        if let Some(completion) = self.completion.as_mut()
            && let Err(e) = completion(&summary)
        {
            error!(error = %format!("{:#}", e), "Completion callback failed");
        }
        self.hooks
            .call_hook(HOOK_DONE, &RunEvent::Done(summary.clone()));

        self.state = MasterState::Done;
        summary
    }
}
