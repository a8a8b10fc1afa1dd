//! Dispatch queue for pending instances.

use petgraph::graph::NodeIndex;
use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap};

/// An instance waiting for a worker slot.
#[derive(Debug, Clone)]
pub struct QueuedInstance {
    pub node: NodeIndex,
    pub template: String,
    sequence: u64,
}

impl PartialEq for QueuedInstance {
    fn eq(&self, other: &Self) -> bool {
        self.sequence == other.sequence
    }
}

impl Eq for QueuedInstance {}

impl PartialOrd for QueuedInstance {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for QueuedInstance {
    fn cmp(&self, other: &Self) -> Ordering {
        // Earlier enqueue first
        other.sequence.cmp(&self.sequence)
    }
}

/// FIFO queue bounded by a run-wide and a per-job concurrency limit.
pub struct DispatchQueue {
    queue: BinaryHeap<QueuedInstance>,
    next_sequence: u64,
    max_parallel: Option<usize>,
    running: usize,
    template_running: HashMap<String, usize>,
    template_limits: HashMap<String, usize>,
}

impl DispatchQueue {
    /// `max_parallel` of zero is treated as one.
    pub fn new(max_parallel: Option<usize>) -> Self {
        Self {
            queue: BinaryHeap::new(),
            next_sequence: 0,
            max_parallel: max_parallel.map(|n| n.max(1)),
            running: 0,
            template_running: HashMap::new(),
            template_limits: HashMap::new(),
        }
    }

    /// Bound the number of concurrently running instances of one job.
    pub fn set_template_limit(&mut self, template: impl Into<String>, limit: usize) {
        self.template_limits.insert(template.into(), limit.max(1));
    }

    pub fn enqueue(&mut self, node: NodeIndex, template: impl Into<String>) {
        self.queue.push(QueuedInstance {
            node,
            template: template.into(),
            sequence: self.next_sequence,
        });
        self.next_sequence += 1;
    }

    /// Take the oldest instance that fits within the limits and count it as
    /// running.
    pub fn dequeue(&mut self) -> Option<QueuedInstance> {
        if self.max_parallel.is_some_and(|max| self.running >= max) {
            return None;
        }

        let mut deferred = Vec::new();
        let mut result = None;

        while let Some(item) = self.queue.pop() {
            if self.can_execute(&item) {
                self.running += 1;
                *self.template_running.entry(item.template.clone()).or_insert(0) += 1;
                result = Some(item);
                break;
            }
            deferred.push(item);
        }

        self.queue.extend(deferred);
        result
    }

    /// Free the slot held by a finished instance of `template`.
    pub fn complete(&mut self, template: &str) {
        self.running = self.running.saturating_sub(1);
        if let Some(count) = self.template_running.get_mut(template) {
            *count = count.saturating_sub(1);
        }
    }

    /// Remove queued instances of one job.
    pub fn remove_template(&mut self, template: &str) -> Vec<NodeIndex> {
        let (removed, kept): (Vec<_>, Vec<_>) = std::mem::take(&mut self.queue)
            .into_vec()
            .into_iter()
            .partition(|item| item.template == template);
        self.queue = kept.into();
        sorted_nodes(removed)
    }

    /// Remove every queued instance.
    pub fn drain(&mut self) -> Vec<NodeIndex> {
        sorted_nodes(std::mem::take(&mut self.queue).into_vec())
    }

    pub fn running(&self) -> usize {
        self.running
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    fn can_execute(&self, item: &QueuedInstance) -> bool {
        match self.template_limits.get(&item.template) {
            Some(&limit) => self.template_running.get(&item.template).copied().unwrap_or(0) < limit,
            None => true,
        }
    }
}

fn sorted_nodes(mut items: Vec<QueuedInstance>) -> Vec<NodeIndex> {
    items.sort_by_key(|item| item.sequence);
    items.into_iter().map(|item| item.node).collect()
}

impl Default for DispatchQueue {
    fn default() -> Self {
        Self::new(None)
    }
}
