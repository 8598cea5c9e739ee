//! Per-envoy queues of experiment assignments.

use std::{
    collections::{HashMap, VecDeque},
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use tokio::sync::Notify;

use fedflow_core::{EnvoyName, ExperimentName};

#[derive(Debug, Default)]
struct AssignmentQueue {
    names: Mutex<VecDeque<ExperimentName>>,
    available: Notify,
}

impl AssignmentQueue {
    fn names(&self) -> MutexGuard<'_, VecDeque<ExperimentName>> {
        self.names.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// One unbounded FIFO of experiment names per envoy, created on first use.
///
/// Each queue is independent: pushing to one envoy never wakes a poll of another.
#[derive(Clone, Debug, Default)]
pub struct AssignmentQueues {
    queues: Arc<Mutex<HashMap<EnvoyName, Arc<AssignmentQueue>>>>,
}

impl AssignmentQueues {
    pub fn new() -> Self {
        Self::default()
    }

    fn queue(&self, envoy: &EnvoyName) -> Arc<AssignmentQueue> {
        self.queues
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(envoy.clone())
            .or_default()
            .clone()
    }

    /// Appends an assignment to the queue of `envoy`.
    pub fn push(&self, envoy: &EnvoyName, experiment: ExperimentName) {
        let queue = self.queue(envoy);
        queue.names().push_back(experiment);
        queue.available.notify_one();
    }

    /// Waits for the next assignment of `envoy` and removes it from the queue.
    ///
    /// Cancelling the wait never loses an assignment.
    pub async fn pop(&self, envoy: &EnvoyName) -> ExperimentName {
        let queue = self.queue(envoy);
        loop {
            let next = queue.names().pop_front();
            if let Some(name) = next {
                return name;
            }
            queue.available.notified().await;
        }
    }

    /// Drops every queued assignment of `experiment`. Returns how many were dropped.
    pub fn purge(&self, experiment: &ExperimentName) -> usize {
        let queues: Vec<Arc<AssignmentQueue>> = self
            .queues
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect();
        queues
            .iter()
            .map(|queue| {
                let mut names = queue.names();
                let before = names.len();
                names.retain(|name| name != experiment);
                before - names.len()
            })
            .sum()
    }

    /// The assignments waiting for `envoy`, oldest first.
    pub fn snapshot(&self, envoy: &EnvoyName) -> Vec<ExperimentName> {
        self.queue(envoy).names().iter().cloned().collect()
    }
}
