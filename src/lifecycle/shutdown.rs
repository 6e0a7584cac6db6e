//! Staged shutdown of background tasks.
//!
//! Every long-running task is registered under a [`Stage`] and watches that
//! stage's cancellation token. On shutdown the stages are stopped one at a
//! time in [`Stage::ORDER`], consumers before producers, so no producer is
//! left blocked sending into a queue nobody reads.

use std::collections::HashMap;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stage {
    Notifier,
    Sinks,
    Settlement,
    Filters,
    Producers,
    Health,
}

impl Stage {
    /// Stop order.
    pub const ORDER: [Stage; 6] = [
        Stage::Notifier,
        Stage::Sinks,
        Stage::Settlement,
        Stage::Filters,
        Stage::Producers,
        Stage::Health,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Notifier => "notifier",
            Stage::Sinks => "sinks",
            Stage::Settlement => "settlement",
            Stage::Filters => "filters",
            Stage::Producers => "producers",
            Stage::Health => "health",
        }
    }
}

/// Summary of a completed shutdown.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ShutdownReport {
    pub stopped: usize,
    pub aborted: usize,
}

/// Coordinator for graceful shutdown.
pub struct Shutdown {
    tokens: HashMap<Stage, CancellationToken>,
    tasks: Vec<(Stage, &'static str, JoinHandle<()>)>,
}

impl Shutdown {
    pub fn new() -> Self {
        Self {
            tokens: Stage::ORDER.iter().map(|s| (*s, CancellationToken::new())).collect(),
            tasks: Vec::new(),
        }
    }

    /// Token a task in `stage` must watch.
    pub fn token(&self, stage: Stage) -> CancellationToken {
        self.tokens.get(&stage).cloned().unwrap_or_default()
    }

    /// Register an already spawned task.
    pub fn track(&mut self, stage: Stage, name: &'static str, handle: JoinHandle<()>) {
        tracing::debug!(stage = stage.as_str(), task = name, "Task registered");
        self.tasks.push((stage, name, handle));
    }

    pub fn task_count(&self) -> usize {
        self.tasks.len()
    }

    /// Stop every stage in order. Each task gets `grace` to exit after its
    /// token fires, then it is aborted.
    pub async fn run(mut self, grace: Duration) -> ShutdownReport {
        let mut report = ShutdownReport::default();

        for stage in Stage::ORDER {
            self.token(stage).cancel();

            let (current, rest): (Vec<_>, Vec<_>) = self.tasks.into_iter().partition(|(s, _, _)| *s == stage);
            self.tasks = rest;
            if current.is_empty() {
                continue;
            }

            tracing::info!(stage = stage.as_str(), tasks = current.len(), "Stopping stage");
            for (_, name, mut handle) in current {
                match tokio::time::timeout(grace, &mut handle).await {
                    Ok(Ok(())) => report.stopped += 1,
                    Ok(Err(e)) => {
                        tracing::error!(stage = stage.as_str(), task = name, error = %e, "Task ended abnormally");
                        report.stopped += 1;
                    }
                    Err(_) => {
                        tracing::warn!(
                            stage = stage.as_str(),
                            task = name,
                            grace_ms = grace.as_millis() as u64,
                            "Task did not stop in time, aborting"
                        );
                        handle.abort();
                        report.aborted += 1;
                    }
                }
            }
        }

        report
    }
}

impl Default for Shutdown {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    #[tokio::test]
    async fn test_stages_stop_in_order() {
        let mut shutdown = Shutdown::new();
        let log = Arc::new(Mutex::new(Vec::new()));

        // Registered in reverse so ordering comes from the stage, not insertion.
        for stage in Stage::ORDER.iter().rev() {
            let token = shutdown.token(*stage);
            let log = log.clone();
            let name = stage.as_str();
            let handle = tokio::spawn(async move {
                token.cancelled().await;
                log.lock().unwrap().push(name);
            });
            shutdown.track(*stage, name, handle);
        }

        let report = shutdown.run(Duration::from_secs(1)).await;
        assert_eq!(report, ShutdownReport { stopped: 6, aborted: 0 });
        assert_eq!(
            *log.lock().unwrap(),
            vec!["notifier", "sinks", "settlement", "filters", "producers", "health"]
        );
    }

    #[tokio::test]
    async fn test_stuck_task_aborted() {
        let mut shutdown = Shutdown::new();
        let handle = tokio::spawn(std::future::pending::<()>());
        shutdown.track(Stage::Settlement, "stuck", handle);

        let report = shutdown.run(Duration::from_millis(20)).await;
        assert_eq!(report, ShutdownReport { stopped: 0, aborted: 1 });
    }

    #[tokio::test]
    async fn test_later_stage_not_cancelled_early() {
        let shutdown = Shutdown::new();
        let producers = shutdown.token(Stage::Producers);
        shutdown.token(Stage::Sinks).cancel();
        assert!(!producers.is_cancelled());
    }
}
