//! Agent liveness tracking for the health endpoint.

use crate::unix_now;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Clone, Copy)]
pub enum Agent {
    Executor,
    Processor,
    Ingestor,
}

/// Last-progress timestamps, one per agent. Zero means the agent has not
/// reported yet.
#[derive(Debug, Default)]
pub struct Heartbeats {
    executor: AtomicU64,
    processor: AtomicU64,
    ingestor: AtomicU64,
}

impl Heartbeats {
    pub fn beat(&self, agent: Agent) {
        let cell = match agent {
            Agent::Executor => &self.executor,
            Agent::Processor => &self.processor,
            Agent::Ingestor => &self.ingestor,
        };
        cell.store(unix_now(), Ordering::Relaxed);
    }

    pub fn report(&self) -> HealthReport {
        HealthReport {
            executor_last_progress: self.executor.load(Ordering::Relaxed),
            processor_last_progress: self.processor.load(Ordering::Relaxed),
            ingestor_last_progress: self.ingestor.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct HealthReport {
    pub executor_last_progress: u64,
    pub processor_last_progress: u64,
    pub ingestor_last_progress: u64,
}
