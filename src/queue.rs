//! Ordered, de-duplicated queue of work items owned by the master.

use std::collections::{HashSet, VecDeque};

/// One independently processable unit of work (e.g. a route).
pub type WorkItem = String;

/// Batch size for the next request.
///
/// With `remaining` items left, `workers` workers and a per-request
/// concurrency of `concurrency`: once the queue cannot fill every worker at
/// full concurrency, split what is left evenly (rounding up) instead.
pub fn calculate_batch_size(remaining: usize, workers: usize, concurrency: usize) -> usize {
    let workers = workers.max(1);
    let concurrency = concurrency.max(1);
    if remaining < workers.saturating_mul(concurrency) {
        remaining.div_ceil(workers)
    } else {
        concurrency
    }
}

/// FIFO queue of unique work items.
///
/// Items are only added by [`enqueue`](Self::enqueue) and only removed by
/// [`take_batch`](Self::take_batch).
#[derive(Debug, Default)]
pub struct WorkQueue {
    items: VecDeque<WorkItem>,
    seen: HashSet<WorkItem>,
    /// Share latched when the queue first drops into the final round.
    tail_share: Option<usize>,
}

impl WorkQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append items not seen before, keeping first-occurrence order.
    /// Returns how many were added.
    pub fn enqueue<I>(&mut self, items: I) -> usize
    where
        I: IntoIterator,
        I::Item: Into<WorkItem>,
    {
        let before = self.items.len();
        for item in items {
            let item = item.into();
            if self.seen.insert(item.clone()) {
                self.items.push_back(item);
            }
        }
        let added = self.items.len() - before;
        if added > 0 {
            self.tail_share = None;
        }
        added
    }

    /// Remove up to `size` items from the front.
    pub fn take(&mut self, size: usize) -> Vec<WorkItem> {
        let size = size.min(self.items.len());
        self.items.drain(..size).collect()
    }

    /// Remove the next batch for one request.
    ///
    /// Outside the final round this is [`calculate_batch_size`]. When the
    /// queue first falls short of `workers * concurrency`, the even share
    /// computed at that point is kept for the rest of the queue so the last
    /// workers get near-equal batches: 5 items over 2 workers go out as 3
    /// then 2.
    pub fn take_batch(&mut self, workers: usize, concurrency: usize) -> Vec<WorkItem> {
        let remaining = self.items.len();
        let in_tail = remaining < workers.max(1).saturating_mul(concurrency.max(1));
        let size = if in_tail {
            *self
                .tail_share
                .get_or_insert_with(|| calculate_batch_size(remaining, workers, concurrency))
        } else {
            calculate_batch_size(remaining, workers, concurrency)
        };
        self.take(size)
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &WorkItem> {
        self.items.iter()
    }
}
