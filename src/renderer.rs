//! The work-executing collaborator and the error records it produces.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::launcher::WorkerPayload;
use crate::queue::WorkItem;

/// Free-form run parameters handed to enumeration and the `built` hook.
pub type Params = Map<String, Value>;

/// How an item failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorKind {
    /// The renderer caught the failure and reported it.
    Handled,
    /// Rendering the item raised; `detail` carries the captured diagnostic text.
    Unhandled,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Handled => write!(f, "handled"),
            Self::Unhandled => write!(f, "unhandled"),
        }
    }
}

/// One failed item as reported by [`ItemRenderer::process_batch`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ItemFailure {
    pub item: WorkItem,
    pub kind: ErrorKind,
    pub detail: String,
}

impl ItemFailure {
    pub fn handled(item: impl Into<WorkItem>, detail: impl Into<String>) -> Self {
        Self {
            item: item.into(),
            kind: ErrorKind::Handled,
            detail: detail.into(),
        }
    }

    /// Capture an error raised while rendering `item`, cause chain included.
    pub fn unhandled(item: impl Into<WorkItem>, error: &anyhow::Error) -> Self {
        Self {
            item: item.into(),
            kind: ErrorKind::Unhandled,
            detail: format!("{:?}", error),
        }
    }

    /// Tag with the reporting worker.
    pub fn into_record(self, worker_id: u32) -> ErrorRecord {
        ErrorRecord {
            item: self.item,
            kind: self.kind,
            detail: self.detail,
            worker_id,
        }
    }
}

/// An item failure as accumulated by the master for one run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorRecord {
    pub item: WorkItem,
    pub kind: ErrorKind,
    pub detail: String,
    pub worker_id: u32,
}

impl ErrorRecord {
    pub fn is_unhandled(&self) -> bool {
        self.kind == ErrorKind::Unhandled
    }
}

/// Executes work items. The master and every worker each own one instance.
///
/// Errors returned from these methods are not item failures: on a worker,
/// an `Err` from [`process_batch`](Self::process_batch) ends the process
/// with a nonzero status.
pub trait ItemRenderer: Send {
    /// One-time setup, called before anything else.
    fn init(&mut self) -> anyhow::Result<()> {
        Ok(())
    }

    /// Build step, run by the master only when a build is requested.
    fn build(&mut self, _params: &Params) -> anyhow::Result<()> {
        Ok(())
    }

    /// Prepare for rendering without building.
    fn initiate(&mut self) -> anyhow::Result<()> {
        Ok(())
    }

    /// Full list of items for this run.
    fn enumerate_items(&mut self, params: &Params) -> anyhow::Result<Vec<WorkItem>>;

    /// Render a batch, returning the items that failed.
    fn process_batch(&mut self, items: &[WorkItem]) -> anyhow::Result<Vec<ItemFailure>>;

    /// Called by the master once every worker has exited.
    fn after_run(&mut self) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Creates a renderer for a worker from its spawn payload.
pub type RendererFactory =
    Arc<dyn Fn(&WorkerPayload) -> anyhow::Result<Box<dyn ItemRenderer>> + Send + Sync>;
