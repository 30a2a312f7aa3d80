//! Worker subprocess spawning.
//!
//! Workers are the current executable re-run in worker mode. Everything the
//! worker needs travels in its environment: the serialized [`WorkerPayload`]
//! and the worker id.

use std::ffi::OsString;
use std::path::Path;
use std::process::{Command, Stdio};
use std::sync::Once;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::proc::{Proc, ProcPipes};
use crate::error::{GenError, Result};

/// Env var carrying the serialized [`WorkerPayload`].
pub const WORKER_ARGS_ENV: &str = "GENPOOL_WORKER_ARGS";
/// Env var carrying the worker id.
pub const WORKER_ID_ENV: &str = "GENPOOL_WORKER_ID";

/// Options the worker takes from the command line of the master.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CliOptions {
    #[serde(default)]
    pub fail_on_page_error: bool,
}

/// Everything a worker is started with.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerPayload {
    /// Renderer options, opaque to the pool.
    #[serde(default)]
    pub options: Value,
    #[serde(default)]
    pub cli_options: CliOptions,
    /// Log level the master runs at, so workers match it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log_level: Option<String>,
}

impl WorkerPayload {
    pub fn new(options: Value, fail_on_page_error: bool) -> Self {
        Self {
            options,
            cli_options: CliOptions { fail_on_page_error },
            log_level: None,
        }
    }

    pub fn with_log_level(mut self, level: impl Into<String>) -> Self {
        self.log_level = Some(level.into());
        self
    }

    pub fn to_env_value(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_env_value(value: &str) -> Result<Self> {
        serde_json::from_str(value)
            .map_err(|e| GenError::Worker(format!("Invalid {}: {}", WORKER_ARGS_ENV, e)))
    }

    /// Read the payload a worker process was started with.
    pub fn from_env() -> Result<Self> {
        let value = std::env::var(WORKER_ARGS_ENV)
            .map_err(|_| GenError::Worker(format!("{} is not set", WORKER_ARGS_ENV)))?;
        Self::from_env_value(&value)
    }
}

/// Id of the current worker process.
pub fn worker_id_from_env() -> Result<u32> {
    let value = std::env::var(WORKER_ID_ENV)
        .map_err(|_| GenError::Worker(format!("{} is not set", WORKER_ID_ENV)))?;
    value
        .parse()
        .map_err(|_| GenError::Worker(format!("Invalid {}: '{}'", WORKER_ID_ENV, value)))
}

static PARENT_INIT: Once = Once::new();

/// Prepare the master process before its first spawn.
fn init_parent() {
    PARENT_INIT.call_once(|| {
        // A worker that dies closes its stdin; writing to it must surface as
        // EPIPE instead of killing the master.
        // Safety: installs SIG_IGN, no handler code runs.
        unsafe {
            let _ = nix::sys::signal::signal(
                nix::sys::signal::Signal::SIGPIPE,
                nix::sys::signal::SigHandler::SigIgn,
            );
        }
    });
}

/// Spawn a worker subprocess.
///
/// `program args...` must start the worker entry point. The child's stdin and
/// stdout become the message pipes; stderr is inherited.
pub fn spawn_worker(
    program: &Path,
    args: &[OsString],
    worker_id: u32,
    payload: &WorkerPayload,
) -> Result<(Proc, ProcPipes)> {
    init_parent();

    let mut cmd = Command::new(program);
    cmd.args(args);
    cmd.env(WORKER_ARGS_ENV, payload.to_env_value()?);
    cmd.env(WORKER_ID_ENV, worker_id.to_string());

    cmd.stdin(Stdio::piped());
    cmd.stdout(Stdio::piped());
    cmd.stderr(Stdio::inherit());

    let child = cmd
        .spawn()
        .map_err(|e| GenError::Spawn(format!("{}: {}", program.display(), e)))?;

    Proc::from_child(child)
}

/// Stack size for collector threads. They only shuffle lines around.
pub const COLLECTOR_STACK_SIZE: usize = 256 * 1024;

/// Spawn a named collector thread.
pub fn spawn_collector_thread<F>(name: &str, f: F) -> Result<std::thread::JoinHandle<()>>
where
    F: FnOnce() + Send + 'static,
{
    std::thread::Builder::new()
        .name(name.to_string())
        .stack_size(COLLECTOR_STACK_SIZE)
        .spawn(f)
        .map_err(|e| GenError::Spawn(format!("Failed to spawn collector thread: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_payload_env_contract() {
        let payload = WorkerPayload::new(json!({"exec": "true {}"}), true).with_log_level("debug");
        let value = payload.to_env_value().unwrap();
        let raw: Value = serde_json::from_str(&value).unwrap();
        assert_eq!(raw["cliOptions"]["failOnPageError"], json!(true));
        assert_eq!(raw["options"]["exec"], json!("true {}"));
        assert_eq!(raw["logLevel"], json!("debug"));

        assert_eq!(WorkerPayload::from_env_value(&value).unwrap(), payload);
    }

    #[test]
    fn test_payload_defaults() {
        let payload = WorkerPayload::from_env_value(r#"{"options": {}}"#).unwrap();
        assert!(!payload.cli_options.fail_on_page_error);
        assert!(payload.log_level.is_none());
        assert!(WorkerPayload::from_env_value("nope").is_err());
    }

    #[test]
    fn test_spawn_passes_environment() {
        let (mut proc, pipes) = spawn_worker(
            Path::new("sh"),
            &["-c".into(), "echo \"$GENPOOL_WORKER_ID\"".into()],
            7,
            &WorkerPayload::default(),
        )
        .unwrap();
        drop(pipes.stdin);

        let mut reader = crate::broker::ipc::LineReader::new(pipes.stdout);
        assert_eq!(reader.read_line().unwrap(), Some("7"));
        proc.wait().unwrap();
    }
}
