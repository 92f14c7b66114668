use anyhow::Result;
use chrono::Local;
use replab_core::OrchestratorError;
use std::path::PathBuf;
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::observer::observe;
use crate::provision::Replica;
use crate::report::{ExperimentRecord, ResultsReport};
use crate::supervisor::ProcessSupervisor;

#[derive(Debug, Clone)]
pub struct ExperimentSpec {
    pub task_path: PathBuf,
    pub task_id: String,
    pub num_exp: usize,
    pub report_dir: PathBuf,
    pub attempt_pause: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopState {
    Idle,
    Running,
    Recording,
    Stopped,
}

/// Sequential attempts against one replica. Each attempt finishes (run,
/// observe, record, report rewrite) before the next one starts.
pub struct ExperimentLoop<'a> {
    supervisor: &'a ProcessSupervisor,
    replica: &'a Replica,
    spec: &'a ExperimentSpec,
    state: LoopState,
    report: ResultsReport,
}

impl<'a> ExperimentLoop<'a> {
    pub fn new(
        supervisor: &'a ProcessSupervisor,
        replica: &'a Replica,
        spec: &'a ExperimentSpec,
    ) -> Self {
        Self {
            supervisor,
            replica,
            spec,
            state: LoopState::Idle,
            report: ResultsReport::new(spec.task_id.clone(), replica.index, Local::now()),
        }
    }

    pub fn state(&self) -> LoopState {
        self.state
    }

    pub fn report(&self) -> &ResultsReport {
        &self.report
    }

    fn transition(&mut self, next: LoopState) {
        debug!(replica = self.replica.index, from = ?self.state, to = ?next, "loop state");
        self.state = next;
    }

    pub fn run(mut self) -> Result<ResultsReport> {
        let replica = self.replica.index;
        for attempt in 1..=self.spec.num_exp {
            self.transition(LoopState::Running);
            info!(replica, attempt, total = self.spec.num_exp, task_id = %self.spec.task_id, "attempt started");
            let started = Instant::now();
            let outcome = self.supervisor.run_task_once(
                self.replica,
                &self.spec.task_path,
                &self.spec.task_id,
                attempt,
            );
            let (success, error) = match outcome {
                Ok(()) => (observe(&self.replica.paths.agents_dir, &self.replica.agents), None),
                Err(err) if is_recoverable(&err) => {
                    let detail = format!("{:#}", err);
                    warn!(replica, attempt, error = %detail, "attempt counted as failure");
                    (false, Some(detail))
                }
                Err(err) => {
                    self.transition(LoopState::Stopped);
                    return Err(err.context(format!("replica {} attempt {}", replica, attempt)));
                }
            };
            let elapsed = started.elapsed().as_secs_f64();

            self.transition(LoopState::Recording);
            self.report.push(ExperimentRecord {
                attempt,
                success,
                time_taken_secs: elapsed,
                error,
            });
            let path = match self.report.write(&self.spec.report_dir) {
                Ok(path) => path,
                Err(err) => {
                    self.transition(LoopState::Stopped);
                    return Err(err);
                }
            };
            info!(
                replica,
                attempt,
                success,
                elapsed_secs = elapsed,
                report = %path.display(),
                "attempt recorded"
            );
            self.transition(LoopState::Idle);
            if attempt < self.spec.num_exp && !self.spec.attempt_pause.is_zero() {
                thread::sleep(self.spec.attempt_pause);
            }
        }
        self.transition(LoopState::Stopped);
        info!(
            replica,
            successes = self.report.successes(),
            total = self.report.total(),
            ratio = %format!("{:.2}", self.report.success_ratio()),
            "experiments completed"
        );
        Ok(self.report)
    }
}

fn is_recoverable(err: &anyhow::Error) -> bool {
    err.downcast_ref::<OrchestratorError>()
        .map_or(false, |e| e.is_recoverable())
}
