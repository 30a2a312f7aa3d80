//! Starting workers and watching them end.
//!
//! A [`Launcher`] starts one worker, wires its message channel into the
//! master's event queue and guarantees exactly one [`Event::Exit`] for it
//! once it is gone. Two flavours:
//!
//! - [`ProcessLauncher`]: a real OS process talking JSON lines over its
//!   stdin/stdout
//! - [`ThreadLauncher`]: a thread in this process using local transports,
//!   for embedding and tests

pub mod proc;
pub mod signals;
pub mod spawn;

use std::collections::HashSet;
use std::ffi::OsString;
use std::panic::{self, AssertUnwindSafe};
use std::path::PathBuf;
use std::sync::mpsc::Sender;
use std::sync::{Arc, Mutex};

use tracing::{debug, error, warn};

use crate::broker::ipc::LineReader;
use crate::broker::{Event, LocalTransport, MASTER_ALIAS, Peer, ProcessTransport, TransportRef};
use crate::context::{Mailbox, WorkerContext};
use crate::error::{GenError, Result};
use crate::renderer::RendererFactory;
use crate::watchdog::ExitInfo;
use crate::worker::{Worker, WorkerOptions, worker_alias};
use signals::analyze_wait_status;
pub use spawn::{CliOptions, WORKER_ARGS_ENV, WORKER_ID_ENV, WorkerPayload};

/// Exit status reported for a worker thread that panicked.
const PANIC_EXIT_CODE: i32 = 101;

/// Ids of launched workers that have not ended yet.
///
/// Shared between a launcher and the watchdog's liveness hook.
#[derive(Debug, Clone, Default)]
pub struct LiveSet {
    inner: Arc<Mutex<HashSet<u32>>>,
}

impl LiveSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, worker_id: u32) {
        self.lock().insert(worker_id);
    }

    pub fn remove(&self, worker_id: u32) {
        self.lock().remove(&worker_id);
    }

    pub fn contains(&self, worker_id: u32) -> bool {
        self.lock().contains(&worker_id)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashSet<u32>> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Starts workers for the master.
pub trait Launcher: Send {
    /// Start worker `worker_id`. Its messages and its final exit arrive on
    /// `events`. Returns the pid to record.
    fn launch(&mut self, worker_id: u32, payload: &WorkerPayload, events: Sender<Event>) -> Result<u32>;

    /// Workers this launcher started that are still running.
    fn live(&self) -> LiveSet;
}

/// Launches workers as child processes of this executable.
pub struct ProcessLauncher {
    program: PathBuf,
    args: Vec<OsString>,
    live: LiveSet,
}

impl ProcessLauncher {
    /// Re-run the current executable with the given worker-mode arguments.
    pub fn current_exe<I, S>(args: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        let program = std::env::current_exe()
            .map_err(|e| GenError::Spawn(format!("Failed to get current executable: {}", e)))?;
        Ok(Self::new(program, args))
    }

    pub fn new<I, S>(program: impl Into<PathBuf>, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        Self {
            program: program.into(),
            args: args.into_iter().map(Into::into).collect(),
            live: LiveSet::new(),
        }
    }
}

impl Launcher for ProcessLauncher {
    fn launch(&mut self, worker_id: u32, payload: &WorkerPayload, events: Sender<Event>) -> Result<u32> {
        let (mut proc, pipes) = spawn::spawn_worker(&self.program, &self.args, worker_id, payload)?;
        let pid = proc.pid();

        let to_worker: TransportRef =
            Arc::new(ProcessTransport::new(worker_alias(worker_id), pipes.stdin));
        let mut reader = LineReader::new(pipes.stdout);

        self.live.insert(worker_id);
        let live = self.live.clone();
        let collector = spawn::spawn_collector_thread(&format!("collector-{}", worker_id), move || {
            collect(worker_id, &mut reader, &to_worker, &events);
            // Nothing more can be answered once the worker stopped talking.
            let _ = to_worker.disconnect();

            let exit = match proc.wait() {
                Ok(status) => {
                    let reason = analyze_wait_status(status);
                    debug!(worker_id, pid, reason = %reason, "Worker process reaped");
                    reason.to_exit_info()
                }
                Err(e) => {
                    error!(worker_id, pid, error = %e, "Failed to reap worker process");
                    ExitInfo::code(-1)
                }
            };
            live.remove(worker_id);
            let _ = events.send(Event::Exit { worker_id, exit });
        });

        if let Err(e) = collector {
            self.live.remove(worker_id);
            return Err(e);
        }
        Ok(pid)
    }

    fn live(&self) -> LiveSet {
        self.live.clone()
    }
}

/// Forward a worker's outbound frames to the master until end-of-stream.
fn collect(worker_id: u32, reader: &mut LineReader, to_worker: &TransportRef, events: &Sender<Event>) {
    loop {
        match reader.read_message() {
            Ok(Some(message)) => {
                let event = Event::Message {
                    message,
                    peer: Some(Peer::new(worker_id, Arc::clone(to_worker))),
                };
                if events.send(event).is_err() {
                    return;
                }
            }
            Ok(None) => return,
            Err(GenError::Transport(e)) => {
                warn!(worker_id, error = %e, "Dropping malformed frame");
            }
            Err(e) => {
                warn!(worker_id, error = %e, "Worker channel failed");
                return;
            }
        }
    }
}

/// Launches workers as threads of this process.
pub struct ThreadLauncher {
    factory: RendererFactory,
    live: LiveSet,
}

impl ThreadLauncher {
    /// `factory` builds each worker's renderer from its payload.
    pub fn new(factory: RendererFactory) -> Self {
        Self {
            factory,
            live: LiveSet::new(),
        }
    }
}

impl Launcher for ThreadLauncher {
    fn launch(&mut self, worker_id: u32, payload: &WorkerPayload, events: Sender<Event>) -> Result<u32> {
        let renderer = (self.factory)(payload)
            .map_err(|e| GenError::Spawn(format!("{}: {:#}", worker_alias(worker_id), e)))?;

        let mailbox = Mailbox::new();
        let to_worker: TransportRef = Arc::new(LocalTransport::new(
            worker_alias(worker_id),
            mailbox.sender(),
            None,
        ));
        let to_master: TransportRef = Arc::new(LocalTransport::new(
            MASTER_ALIAS,
            events.clone(),
            Some(Peer::new(worker_id, to_worker)),
        ));
        let options = WorkerOptions::from_payload(worker_id, payload);

        self.live.insert(worker_id);
        let live = self.live.clone();
        let spawned = std::thread::Builder::new()
            .name(format!("genpool-worker-{}", worker_id))
            .spawn(move || {
                let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
                    let ctx = WorkerContext::with_mailbox(worker_alias(worker_id), mailbox, to_master);
                    Worker::new(options, ctx, renderer).run()
                }));
                let code = outcome.unwrap_or_else(|_| {
                    error!(worker_id, "Worker thread panicked");
                    PANIC_EXIT_CODE
                });
                live.remove(worker_id);
                let _ = events.send(Event::Exit {
                    worker_id,
                    exit: ExitInfo::code(code),
                });
            });

        if let Err(e) = spawned {
            self.live.remove(worker_id);
            return Err(GenError::Spawn(format!("Failed to spawn worker thread: {}", e)));
        }
        Ok(std::process::id())
    }

    fn live(&self) -> LiveSet {
        self.live.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::Message;
    use crate::broker::ipc::{LineWriter, PipeFd};
    use crate::queue::WorkItem;
    use crate::renderer::{ItemFailure, ItemRenderer, Params};
    use serde_json::json;
    use std::sync::mpsc;

    #[test]
    fn test_live_set() {
        let live = LiveSet::new();
        let shared = live.clone();
        live.insert(1);
        live.insert(2);
        shared.remove(1);
        assert!(!live.contains(1));
        assert!(live.contains(2));
        assert_eq!(live.len(), 1);
    }

    #[test]
    fn test_collect_tags_frames_with_peer() {
        let (read_fd, write_fd) = PipeFd::pipe().unwrap();
        let (unused_read, unused_write) = PipeFd::pipe().unwrap();
        drop(unused_read);
        let to_worker: TransportRef = Arc::new(ProcessTransport::new("worker 4", unused_write));

        let mut writer = LineWriter::new(write_fd);
        writer
            .write_message(&Message::new("w4", "master", "requestRoutes", json!(null)))
            .unwrap();
        writer.write_line("garbage").unwrap();
        writer
            .write_message(&Message::new("w4", "master", "handleErrors", json!([])))
            .unwrap();
        drop(writer);

        let (tx, rx) = mpsc::channel();
        collect(4, &mut LineReader::new(read_fd), &to_worker, &tx);

        let services: Vec<(String, Option<u32>)> = rx
            .try_iter()
            .map(|event| match event {
                Event::Message { message, peer } => (message.service_id, peer.map(|p| p.worker_id)),
                other => panic!("unexpected event {:?}", other),
            })
            .collect();
        assert_eq!(
            services,
            vec![
                ("requestRoutes".to_string(), Some(4)),
                ("handleErrors".to_string(), Some(4)),
            ]
        );
    }

    #[test]
    fn test_process_launcher_reports_exit() {
        let mut launcher = ProcessLauncher::new("sh", ["-c", "exit 3"]);
        let (tx, rx) = mpsc::channel();
        let pid = launcher.launch(1, &WorkerPayload::default(), tx).unwrap();
        assert!(pid > 0);

        match rx.recv().unwrap() {
            Event::Exit { worker_id, exit } => {
                assert_eq!(worker_id, 1);
                assert_eq!(exit, ExitInfo::code(3));
            }
            other => panic!("unexpected event {:?}", other),
        }
        assert!(!launcher.live().contains(1));
    }

    struct PanicOnInit;

    impl ItemRenderer for PanicOnInit {
        fn init(&mut self) -> anyhow::Result<()> {
            panic!("renderer exploded");
        }

        fn enumerate_items(&mut self, _params: &Params) -> anyhow::Result<Vec<WorkItem>> {
            Ok(Vec::new())
        }

        fn process_batch(&mut self, _items: &[WorkItem]) -> anyhow::Result<Vec<ItemFailure>> {
            Ok(Vec::new())
        }
    }

    #[test]
    fn test_thread_launcher_reports_panic_as_exit() {
        let factory: RendererFactory =
            Arc::new(|_: &WorkerPayload| Ok::<_, anyhow::Error>(Box::new(PanicOnInit) as Box<dyn ItemRenderer>));
        let mut launcher = ThreadLauncher::new(factory);
        let (tx, rx) = mpsc::channel();
        launcher.launch(2, &WorkerPayload::default(), tx).unwrap();

        match rx.recv().unwrap() {
            Event::Exit { worker_id, exit } => {
                assert_eq!(worker_id, 2);
                assert_eq!(exit, ExitInfo::code(PANIC_EXIT_CODE));
            }
            other => panic!("unexpected event {:?}", other),
        }
        assert!(!launcher.live().contains(2));
    }

    #[test]
    fn test_thread_launcher_factory_failure() {
        let factory: RendererFactory = Arc::new(|_: &WorkerPayload| Err::<Box<dyn ItemRenderer>, _>(anyhow::anyhow!("no renderer")));
        let mut launcher = ThreadLauncher::new(factory);
        let (tx, _rx) = mpsc::channel();
        let err = launcher.launch(1, &WorkerPayload::default(), tx).unwrap_err();
        assert!(matches!(err, GenError::Spawn(_)));
        assert!(launcher.live().is_empty());
    }

    #[test]
    fn test_process_launcher_spawn_failure() {
        let mut launcher = ProcessLauncher::new("/nonexistent/genpool-worker", Vec::<String>::new());
        let (tx, _rx) = mpsc::channel();
        let err = launcher.launch(1, &WorkerPayload::default(), tx).unwrap_err();
        assert!(matches!(err, GenError::Spawn(_)));
        assert!(launcher.live().is_empty());
    }
}
