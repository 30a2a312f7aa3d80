//! Renderer running a shell command per item.
//!
//! Used by the `genpool` binary. Items come from a file (one per line, `#`
//! comments and blank lines skipped) or from stdin. Each item is rendered by
//! `sh -c <exec>` with every `{}` replaced by the shell-quoted item.

use std::io::{BufRead, BufReader};
use std::path::PathBuf;
use std::process::{Command, Stdio};
use std::sync::Arc;

use anyhow::{Context, bail};
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};

use crate::launcher::WorkerPayload;
use crate::queue::WorkItem;
use crate::renderer::{ItemFailure, ItemRenderer, Params, RendererFactory};

/// Placeholder replaced by the item.
pub const PLACEHOLDER: &str = "{}";

/// Renderer options, shipped to workers in the spawn payload.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandOptions {
    /// Per-item command.
    pub exec: String,
    /// Build step.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub build_cmd: Option<String>,
    /// Item list; `None` or `-` reads stdin.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub items: Option<PathBuf>,
}

#[derive(Debug)]
pub struct CommandRenderer {
    options: CommandOptions,
}

impl CommandRenderer {
    pub fn new(options: CommandOptions) -> Self {
        Self { options }
    }

    /// Renderer for a worker, from the options in its payload.
    pub fn from_payload(payload: &WorkerPayload) -> anyhow::Result<Self> {
        let options: CommandOptions = serde_json::from_value(payload.options.clone())
            .context("Invalid renderer options in worker payload")?;
        Ok(Self::new(options))
    }

    /// Factory building each worker's renderer from its payload.
    pub fn factory() -> RendererFactory {
        Arc::new(build_for_worker)
    }

    pub fn options(&self) -> &CommandOptions {
        &self.options
    }

    fn render(&self, item: &str) -> Option<ItemFailure> {
        let script = substitute(&self.options.exec, item);
        let output = match shell(&script).stdin(Stdio::null()).output() {
            Ok(output) => output,
            Err(e) => {
                let error = anyhow::Error::new(e).context(format!("Failed to run '{}'", script));
                return Some(ItemFailure::unhandled(item, &error));
            }
        };

        if !output.stdout.is_empty() {
            debug!(item, "{}", String::from_utf8_lossy(&output.stdout).trim_end());
        }
        if output.status.success() {
            return None;
        }

        let status = match output.status.code() {
            Some(code) => format!("exit status {}", code),
            None => "terminated by signal".to_string(),
        };
        let stderr = String::from_utf8_lossy(&output.stderr);
        let detail = match stderr.trim() {
            "" => status,
            stderr => format!("{}: {}", status, stderr),
        };
        Some(ItemFailure::handled(item, detail))
    }
}

impl ItemRenderer for CommandRenderer {
    fn init(&mut self) -> anyhow::Result<()> {
        if self.options.exec.trim().is_empty() {
            bail!("No command to run for items");
        }
        Ok(())
    }

    #[instrument(skip_all)]
    fn build(&mut self, _params: &Params) -> anyhow::Result<()> {
        let Some(build_cmd) = self.options.build_cmd.as_deref() else {
            debug!("No build command configured");
            return Ok(());
        };
        let status = shell(build_cmd)
            .stdin(Stdio::null())
            .status()
            .with_context(|| format!("Failed to run build command '{}'", build_cmd))?;
        if !status.success() {
            bail!("Build command '{}' failed with {}", build_cmd, status);
        }
        Ok(())
    }

    fn enumerate_items(&mut self, _params: &Params) -> anyhow::Result<Vec<WorkItem>> {
        match self.options.items.as_deref() {
            Some(path) if path.as_os_str() != "-" => {
                let file = std::fs::File::open(path)
                    .with_context(|| format!("Failed to open items file {}", path.display()))?;
                read_items(BufReader::new(file))
            }
            _ => read_items(std::io::stdin().lock()),
        }
    }

    fn process_batch(&mut self, items: &[WorkItem]) -> anyhow::Result<Vec<ItemFailure>> {
        Ok(items.iter().filter_map(|item| self.render(item)).collect())
    }
}

fn build_for_worker(payload: &WorkerPayload) -> anyhow::Result<Box<dyn ItemRenderer>> {
    Ok(Box::new(CommandRenderer::from_payload(payload)?))
}

fn shell(script: &str) -> Command {
    let mut command = Command::new("sh");
    command.arg("-c").arg(script);
    command
}

/// One item per line; blank lines and `#` comments skipped.
pub fn read_items<R: BufRead>(reader: R) -> anyhow::Result<Vec<WorkItem>> {
    let mut items = Vec::new();
    for line in reader.lines() {
        let line = line.context("Failed to read items")?;
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        items.push(line.to_string());
    }
    Ok(items)
}

/// Replace every `{}` in `exec` with `item`, single-quoted for `sh`.
pub fn substitute(exec: &str, item: &str) -> String {
    exec.replace(PLACEHOLDER, &quote(item))
}

fn quote(item: &str) -> String {
    format!("'{}'", item.replace('\'', r"'\''"))
}
