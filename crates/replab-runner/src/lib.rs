use anyhow::{anyhow, Context, Result};
use replab_core::{
    server_session_name, ReplicaPaths, REPLAB_SETTINGS_FILE, REPLAB_SETTINGS_MARKER,
    REPLAB_TASK_RUNNER_LOG_FILE,
};
use serde_json::{json, Map, Value};
use std::collections::BTreeMap;
use std::env;
use std::path::PathBuf;
use std::sync::{mpsc, Arc};
use std::thread;
use tracing::{error, info, warn};

pub mod config;
pub mod experiment;
pub mod observer;
pub mod profiles;
pub mod provision;
pub mod report;
pub mod session;
pub mod settings;
pub mod supervisor;

#[cfg(test)]
pub(crate) mod test_support;

pub use config::{ConfigDocument, PropertiesPatch};
pub use experiment::{ExperimentLoop, ExperimentSpec, LoopState};
pub use profiles::AgentProfile;
pub use provision::{ProvisionFailure, ProvisionReport, Provisioner, Replica};
pub use report::{ExperimentRecord, ResultsReport};
pub use session::{SessionBackend, TmuxBackend};
pub use settings::{load_harness_config, HarnessConfig};
pub use supervisor::{EnvironmentHandle, ProcessSupervisor, SupervisorSettings};

#[derive(Debug, Clone)]
pub struct RunRequest {
    pub task_path: PathBuf,
    pub task_id: String,
    pub num_exp: usize,
    /// 0 runs the implicit replica in the foreground.
    pub num_parallel: usize,
    /// Stop any session this run would use before starting.
    pub fresh: bool,
}

#[derive(Debug, Clone)]
pub struct ReplicaOutcome {
    pub index: usize,
    pub port: u16,
    pub session: String,
    pub result: std::result::Result<ResultsReport, String>,
}

#[derive(Debug, Clone, Default)]
pub struct RunSummary {
    pub outcomes: Vec<ReplicaOutcome>,
    pub provision_failures: Vec<ProvisionFailure>,
}

impl RunSummary {
    pub fn completed(&self) -> usize {
        self.outcomes.iter().filter(|o| o.result.is_ok()).count()
    }

    /// True when no replica produced a report.
    pub fn all_failed(&self) -> bool {
        self.completed() == 0
    }
}

/// Fans experiment loops out over replicas. Replicas share nothing at run
/// time except the read-only template and this coordinator's settings.
pub struct Coordinator {
    config: HarnessConfig,
    supervisor: Arc<ProcessSupervisor>,
}

impl Coordinator {
    pub fn new(config: HarnessConfig, backend: Arc<dyn SessionBackend>) -> Self {
        let supervisor = Arc::new(ProcessSupervisor::new(
            backend,
            SupervisorSettings {
                server_command: config.server_command.clone(),
                task_runner: config.task_runner.clone(),
                project_dir: config.project_dir.clone(),
                settle: config.settle(),
            },
        ));
        Self { config, supervisor }
    }

    pub fn with_tmux(config: HarnessConfig) -> Self {
        let backend = Arc::new(TmuxBackend::new(config.tmux_program.clone()));
        Self::new(config, backend)
    }

    pub fn config(&self) -> &HarnessConfig {
        &self.config
    }

    /// Shared by every worker so `stop_sessions` reaches live task runners.
    pub fn supervisor(&self) -> Arc<ProcessSupervisor> {
        self.supervisor.clone()
    }

    fn provisioner(&self) -> Provisioner {
        Provisioner::new(
            &self.config.template_dir,
            &self.config.work_root,
            self.config.base_port,
            self.config.session_prefix.clone(),
        )
    }

    pub fn session_names(&self, num_parallel: usize) -> Vec<String> {
        (0..num_parallel.max(1))
            .map(|index| server_session_name(&self.config.session_prefix, index))
            .collect()
    }

    pub fn run(&self, request: &RunRequest) -> Result<RunSummary> {
        let cwd = env::current_dir().context("failed resolving working directory")?;
        let spec = ExperimentSpec {
            task_path: settings::absolutize(&cwd, &request.task_path),
            task_id: request.task_id.clone(),
            num_exp: request.num_exp,
            report_dir: self.config.report_dir.clone(),
            attempt_pause: self.config.attempt_pause(),
        };
        if request.fresh {
            self.stop_sessions(request.num_parallel)?;
        }
        if request.num_parallel == 0 {
            Ok(self.run_sequential(&spec))
        } else {
            self.run_parallel(&spec, request.num_parallel)
        }
    }

    fn run_sequential(&self, spec: &ExperimentSpec) -> RunSummary {
        let session = server_session_name(&self.config.session_prefix, 0);
        let supervisor = self.supervisor();
        let result = self
            .implicit_replica(&session)
            .and_then(|replica| {
                info!(agents = ?replica.agents, port = replica.port, "running implicit replica");
                let handle = supervisor.start_environment(&replica)?;
                let result = ExperimentLoop::new(&supervisor, &replica, spec).run();
                stop_quietly(&supervisor, &handle);
                result.map(|report| (replica, report))
            });
        let outcome = match result {
            Ok((replica, report)) => ReplicaOutcome {
                index: 0,
                port: replica.port,
                session,
                result: Ok(report),
            },
            Err(err) => {
                error!(replica = 0, error = %format!("{:#}", err), "replica failed");
                ReplicaOutcome {
                    index: 0,
                    port: self.config.base_port,
                    session,
                    result: Err(format!("{:#}", err)),
                }
            }
        };
        RunSummary {
            outcomes: vec![outcome],
            provision_failures: Vec::new(),
        }
    }

    /// The template server and the agent project used in place, with the
    /// roster read back from the project's settings document.
    fn implicit_replica(&self, session: &str) -> Result<Replica> {
        let project = &self.config.project_dir;
        let settings_path = project.join(REPLAB_SETTINGS_FILE);
        let doc = config::load(&settings_path)?;
        let agents = doc.agent_names();
        if agents.is_empty() {
            warn!(path = %settings_path.display(), "settings document lists no profiles");
        }
        let logs_dir = project.join("replab_logs");
        Ok(Replica {
            index: 0,
            paths: ReplicaPaths {
                root: self.config.template_dir.clone(),
                server_dir: self.config.template_dir.clone(),
                agents_dir: project.clone(),
                properties: self
                    .config
                    .template_dir
                    .join(replab_core::REPLAB_PROPERTIES_FILE),
                settings: settings_path,
                task_runner_log: logs_dir.join(REPLAB_TASK_RUNNER_LOG_FILE),
                logs_dir,
            },
            port: doc.port().unwrap_or(self.config.base_port),
            session: session.to_string(),
            agents,
        })
    }

    fn run_parallel(&self, spec: &ExperimentSpec, num_parallel: usize) -> Result<RunSummary> {
        profiles::check_arity(&self.config.agents, &self.config.models)?;
        let base_settings = self.base_settings_document()?;

        let provisioned = self.provisioner().provision(num_parallel);
        if provisioned.replicas.is_empty() {
            warn!(requested = num_parallel, "no replica could be provisioned");
        }

        let supervisor = self.supervisor();
        let (tx, rx) = mpsc::channel::<ReplicaOutcome>();
        let mut workers = Vec::new();
        let mut early = Vec::new();
        for (n, replica) in provisioned.replicas.into_iter().enumerate() {
            if n > 0 && !self.config.stagger().is_zero() {
                thread::sleep(self.config.stagger());
            }
            let index = replica.index;
            let port = replica.port;
            let session = replica.session.clone();
            let worker = ReplicaWorker {
                supervisor: supervisor.clone(),
                replica,
                base_settings: base_settings.clone(),
                agents: self.config.agents.clone(),
                models: self.config.models.clone(),
                modes: self.config.modes.clone(),
                spec: spec.clone(),
            };
            let tx = tx.clone();
            let spawned = thread::Builder::new()
                .name(format!("replica-{}", index))
                .spawn(move || {
                    let outcome = worker.run();
                    let _ = tx.send(outcome);
                });
            match spawned {
                Ok(handle) => workers.push((index, port, session, handle)),
                Err(err) => early.push(ReplicaOutcome {
                    index,
                    port,
                    session,
                    result: Err(format!("failed to spawn worker: {}", err)),
                }),
            }
        }
        drop(tx);

        let mut outcomes: Vec<ReplicaOutcome> = rx.iter().collect();
        for (index, port, session, handle) in workers {
            if handle.join().is_err() && !outcomes.iter().any(|o| o.index == index) {
                error!(replica = index, "replica worker panicked");
                outcomes.push(ReplicaOutcome {
                    index,
                    port,
                    session,
                    result: Err("replica worker panicked".to_string()),
                });
            }
        }
        outcomes.extend(early);
        outcomes.sort_by_key(|o| o.index);
        Ok(RunSummary {
            outcomes,
            provision_failures: provisioned.failures,
        })
    }

    /// Project settings every replica document starts from. Each replica
    /// gets its own copy; the project file itself is never rewritten here.
    fn base_settings_document(&self) -> Result<ConfigDocument> {
        let path = self.config.project_dir.join(REPLAB_SETTINGS_FILE);
        if path.exists() {
            return config::load(&path);
        }
        warn!(path = %path.display(), "no project settings document; replicas start from an empty one");
        Ok(ConfigDocument::new(
            Some(REPLAB_SETTINGS_MARKER.to_string()),
            Map::new(),
        ))
    }

    /// Tears down every session a run with `num_parallel` replicas would use.
    pub fn stop_sessions(&self, num_parallel: usize) -> Result<()> {
        let supervisor = self.supervisor();
        let mut failures = Vec::new();
        for session in self.session_names(num_parallel) {
            if let Err(err) = supervisor.stop_all(&session) {
                warn!(session = %session, error = %format!("{:#}", err), "failed to stop session");
                failures.push(format!("{}: {:#}", session, err));
            }
        }
        if failures.is_empty() {
            Ok(())
        } else {
            Err(anyhow!("failed to stop sessions: {}", failures.join("; ")))
        }
    }

    /// Removes every replica tree a run with `num_parallel` replicas created.
    pub fn clean(&self, num_parallel: usize) -> Result<usize> {
        let provisioner = self.provisioner();
        let mut removed = 0;
        for index in 0..num_parallel {
            let replica = provisioner.replica(index)?;
            let existed = replica.paths.root.exists();
            provisioner.teardown(&replica)?;
            if existed {
                removed += 1;
            }
        }
        Ok(removed)
    }
}

struct ReplicaWorker {
    supervisor: Arc<ProcessSupervisor>,
    replica: Replica,
    base_settings: ConfigDocument,
    agents: Vec<String>,
    models: Vec<String>,
    modes: BTreeMap<String, bool>,
    spec: ExperimentSpec,
}

impl ReplicaWorker {
    fn run(mut self) -> ReplicaOutcome {
        let index = self.replica.index;
        let port = self.replica.port;
        let session = self.replica.session.clone();
        let result = self.execute().map_err(|err| {
            let detail = format!("{:#}", err);
            error!(replica = index, port, error = %detail, "replica failed");
            detail
        });
        ReplicaOutcome {
            index,
            port,
            session,
            result,
        }
    }

    fn execute(&mut self) -> Result<ResultsReport> {
        let names = profiles::replica_agent_names(&self.agents, &self.replica.token());
        profiles::materialize(
            &self.replica.paths.agents_dir,
            &names,
            &self.models,
            &self.modes,
        )?;
        write_replica_settings(&self.base_settings, &self.replica, &names)?;
        self.replica.agents = names;

        let handle = self.supervisor.start_environment(&self.replica)?;
        let result = ExperimentLoop::new(&self.supervisor, &self.replica, &self.spec).run();
        stop_quietly(&self.supervisor, &handle);
        result
    }
}

/// Writes the replica's private settings document: the project settings with
/// `port` and `profiles` pointing at this replica only.
fn write_replica_settings(base: &ConfigDocument, replica: &Replica, names: &[String]) -> Result<()> {
    let mut doc = base.clone();
    let profiles: Vec<Value> = names
        .iter()
        .map(|name| Value::String(config::profile_reference(name)))
        .collect();
    let patch = json!({ "port": replica.port, "profiles": profiles });
    if let Value::Object(patch) = patch {
        doc.apply(&patch);
    }
    config::save(&replica.paths.settings, &doc)
}

fn stop_quietly(supervisor: &ProcessSupervisor, handle: &EnvironmentHandle) {
    if let Err(err) = supervisor.stop_all(&handle.session) {
        warn!(
            replica = handle.replica,
            session = %handle.session,
            error = %format!("{:#}", err),
            "failed to stop environment"
        );
    }
}
