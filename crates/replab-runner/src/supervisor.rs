use anyhow::{anyhow, Context, Result};
use replab_core::{
    ensure_dir, OrchestratorError, REPLAB_ENV_AGENT_DIR, REPLAB_ENV_PORT, REPLAB_ENV_PROJECT_DIR,
    REPLAB_ENV_REPLICA_INDEX, REPLAB_ENV_SERVER_DIR, REPLAB_ENV_SETTINGS_PATH,
};
use std::collections::BTreeMap;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::provision::Replica;
use crate::session::{run_checked_command, SessionBackend};

#[derive(Debug, Clone)]
pub struct SupervisorSettings {
    /// Line typed into the replica's session to start the environment server.
    pub server_command: String,
    /// Task runner argv; `${REPLAB_*}` placeholders are rendered per replica.
    pub task_runner: Vec<String>,
    pub project_dir: PathBuf,
    pub settle: Duration,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnvironmentHandle {
    pub replica: usize,
    pub session: String,
}

pub struct ProcessSupervisor {
    backend: Arc<dyn SessionBackend>,
    settings: SupervisorSettings,
    /// Process group of the task runner currently live in each session.
    running: Mutex<BTreeMap<String, u32>>,
}

impl ProcessSupervisor {
    pub fn new(backend: Arc<dyn SessionBackend>, settings: SupervisorSettings) -> Self {
        Self {
            backend,
            settings,
            running: Mutex::new(BTreeMap::new()),
        }
    }

    pub fn settings(&self) -> &SupervisorSettings {
        &self.settings
    }

    pub fn start_environment(&self, replica: &Replica) -> Result<EnvironmentHandle> {
        let session = replica.session.as_str();
        if self.backend.has_session(session)? {
            return Err(OrchestratorError::SessionConflict {
                session: session.to_string(),
            }
            .into());
        }
        self.backend
            .new_session(session, &replica.paths.server_dir)
            .with_context(|| format!("replica {}: failed to open session", replica.index))?;
        if let Err(err) = self.launch_in_session(replica) {
            let _ = self.backend.kill_session(session);
            return Err(err);
        }
        info!(
            replica = replica.index,
            session,
            port = replica.port,
            agents = ?replica.agents,
            "environment started"
        );
        thread::sleep(self.settings.settle);
        Ok(EnvironmentHandle {
            replica: replica.index,
            session: session.to_string(),
        })
    }

    fn launch_in_session(&self, replica: &Replica) -> Result<()> {
        self.backend
            .send_line(&replica.session, &self.settings.server_command)?;
        for agent in &replica.agents {
            self.backend
                .send_line(&replica.session, &format!("/op {}", agent))?;
        }
        Ok(())
    }

    pub fn running_task_runner(&self, session: &str) -> Option<u32> {
        self.running
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(session)
            .copied()
    }

    fn track_task_runner(&self, session: &str, pgid: Option<u32>) {
        let mut running = self
            .running
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        match pgid {
            Some(pgid) => {
                running.insert(session.to_string(), pgid);
            }
            None => {
                running.remove(session);
            }
        }
    }

    /// Tears down one execution context: the task runner's process group,
    /// then the session. A context that is not live is fine.
    pub fn stop_all(&self, session: &str) -> Result<()> {
        if let Some(pgid) = self.running_task_runner(session) {
            let mut cmd = Command::new("kill");
            cmd.args(["-TERM", "--", &format!("-{}", pgid)]);
            match run_checked_command(cmd, "kill failed") {
                Ok(()) => info!(session, pgid, "task runner signalled"),
                Err(err) => {
                    warn!(session, pgid, error = %format!("{:#}", err), "could not signal task runner")
                }
            }
        }
        if !self.backend.has_session(session)? {
            debug!(session, "no live session to stop");
            return Ok(());
        }
        self.backend.kill_session(session)?;
        info!(session, "session stopped");
        Ok(())
    }

    /// Runs the task runner to completion. Spawn failures and non-zero exits
    /// come back as `TaskRunnerFailed`.
    pub fn run_task_once(
        &self,
        replica: &Replica,
        task_path: &Path,
        task_id: &str,
        attempt: usize,
    ) -> Result<()> {
        let env = self.task_runner_env(replica);
        let argv = render_command(&self.settings.task_runner, &env);
        if argv.is_empty() {
            return Err(anyhow!("task runner command must not be empty"));
        }
        let log_path = &replica.paths.task_runner_log;
        if let Some(parent) = log_path.parent() {
            ensure_dir(parent)?;
        }
        let mut log = OpenOptions::new()
            .create(true)
            .append(true)
            .open(log_path)
            .with_context(|| format!("failed opening {}", log_path.display()))?;
        writeln!(log, "=== attempt {} task_id={} ===", attempt, task_id)?;

        let mut cmd = Command::new(&argv[0]);
        cmd.args(&argv[1..]);
        cmd.arg("--task_path").arg(task_path);
        cmd.arg("--task_id").arg(task_id);
        cmd.current_dir(&replica.paths.agents_dir);
        for (key, value) in &env {
            cmd.env(key, value);
        }
        cmd.stdin(Stdio::null());
        cmd.stdout(Stdio::from(log.try_clone()?));
        cmd.stderr(Stdio::from(log));
        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            cmd.process_group(0);
        }

        debug!(replica = replica.index, attempt, argv = ?argv, "launching task runner");
        let failed = |status: String| OrchestratorError::TaskRunnerFailed {
            replica: replica.index,
            attempt,
            status,
        };
        let mut child = cmd
            .spawn()
            .map_err(|err| failed(format!("spawn {:?} failed: {}", argv[0], err)))?;
        self.track_task_runner(&replica.session, Some(child.id()));
        let waited = child.wait();
        self.track_task_runner(&replica.session, None);
        let status = waited.map_err(|err| failed(format!("wait failed: {}", err)))?;
        if status.success() {
            return Ok(());
        }
        let status = status
            .code()
            .map(|c| format!("exit code {}", c))
            .unwrap_or_else(|| "terminated by signal".to_string());
        warn!(replica = replica.index, attempt, %status, log = %log_path.display(), "task runner failed");
        Err(failed(status).into())
    }

    pub fn task_runner_env(&self, replica: &Replica) -> BTreeMap<String, String> {
        BTreeMap::from([
            (
                REPLAB_ENV_PROJECT_DIR.to_string(),
                self.settings.project_dir.display().to_string(),
            ),
            (
                REPLAB_ENV_AGENT_DIR.to_string(),
                replica.paths.agents_dir.display().to_string(),
            ),
            (
                REPLAB_ENV_SERVER_DIR.to_string(),
                replica.paths.server_dir.display().to_string(),
            ),
            (
                REPLAB_ENV_SETTINGS_PATH.to_string(),
                replica.paths.settings.display().to_string(),
            ),
            (REPLAB_ENV_PORT.to_string(), replica.port.to_string()),
            (
                REPLAB_ENV_REPLICA_INDEX.to_string(),
                replica.index.to_string(),
            ),
        ])
    }
}

fn render_template(raw: &str, env: &BTreeMap<String, String>) -> String {
    let mut rendered = raw.to_string();
    for (key, value) in env {
        if !key.starts_with("REPLAB_") {
            continue;
        }
        let needle = format!("${{{}}}", key);
        if rendered.contains(&needle) {
            rendered = rendered.replace(&needle, value);
        }
    }
    rendered
}

pub(crate) fn render_command(command: &[String], env: &BTreeMap<String, String>) -> Vec<String> {
    command
        .iter()
        .map(|part| render_template(part, env))
        .collect::<Vec<_>>()
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use replab_core::replica_paths;
    use std::fs;
    use std::sync::Mutex;
    use std::time::Instant;

    /// Session backend that records every call instead of driving tmux.
    #[derive(Default)]
    pub(crate) struct RecordingBackend {
        pub live: Mutex<Vec<String>>,
        pub calls: Mutex<Vec<String>>,
    }

    impl SessionBackend for RecordingBackend {
        fn has_session(&self, name: &str) -> Result<bool> {
            Ok(self.live.lock().unwrap().iter().any(|s| s == name))
        }

        fn new_session(&self, name: &str, cwd: &Path) -> Result<()> {
            self.calls
                .lock()
                .unwrap()
                .push(format!("new {} {}", name, cwd.display()));
            self.live.lock().unwrap().push(name.to_string());
            Ok(())
        }

        fn send_line(&self, name: &str, line: &str) -> Result<()> {
            self.calls
                .lock()
                .unwrap()
                .push(format!("send {} {}", name, line));
            Ok(())
        }

        fn kill_session(&self, name: &str) -> Result<()> {
            self.calls.lock().unwrap().push(format!("kill {}", name));
            self.live.lock().unwrap().retain(|s| s != name);
            Ok(())
        }
    }

    fn fixture(prefix: &str) -> (PathBuf, Replica) {
        let root = std::env::temp_dir().join(format!(
            "{}_{}_{}",
            prefix,
            std::process::id(),
            chrono::Utc::now().timestamp_micros()
        ));
        let paths = replica_paths(&root, 0);
        ensure_dir(&paths.server_dir).expect("server dir");
        ensure_dir(&paths.agents_dir).expect("agents dir");
        let replica = Replica {
            index: 0,
            paths,
            port: 55916,
            session: "replab_server_0".to_string(),
            agents: vec!["andy_0".to_string(), "jill_0".to_string()],
        };
        (root, replica)
    }

    fn supervisor(backend: Arc<dyn SessionBackend>, runner: &[&str]) -> ProcessSupervisor {
        ProcessSupervisor::new(
            backend,
            SupervisorSettings {
                server_command: "java -jar server.jar".to_string(),
                task_runner: runner.iter().map(|s| s.to_string()).collect(),
                project_dir: PathBuf::from("/project"),
                settle: Duration::ZERO,
            },
        )
    }

    #[test]
    fn start_environment_launches_server_and_grants_operators() {
        let (root, replica) = fixture("replab_supervisor_start");
        let backend = Arc::new(RecordingBackend::default());
        let sup = supervisor(backend.clone(), &["true"]);
        let handle = sup.start_environment(&replica).expect("start");
        assert_eq!(handle.session, "replab_server_0");
        let calls = backend.calls.lock().unwrap().clone();
        assert_eq!(
            calls,
            vec![
                format!("new replab_server_0 {}", replica.paths.server_dir.display()),
                "send replab_server_0 java -jar server.jar".to_string(),
                "send replab_server_0 /op andy_0".to_string(),
                "send replab_server_0 /op jill_0".to_string(),
            ]
        );

        let err = sup.start_environment(&replica).expect_err("conflict");
        assert!(matches!(
            err.downcast_ref::<OrchestratorError>(),
            Some(OrchestratorError::SessionConflict { .. })
        ));

        sup.stop_all("replab_server_0").expect("stop");
        sup.stop_all("replab_server_0").expect("stop twice");
        assert_eq!(
            backend
                .calls
                .lock()
                .unwrap()
                .iter()
                .filter(|c| c.starts_with("kill"))
                .count(),
            1
        );
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn run_task_once_passes_task_flags_and_env() {
        let (root, replica) = fixture("replab_supervisor_args");
        let sup = supervisor(
            Arc::new(RecordingBackend::default()),
            &[
                "sh",
                "-c",
                "echo \"$@ port=$REPLAB_PORT\" > args.txt",
                "runner",
            ],
        );
        sup.run_task_once(&replica, Path::new("/tasks.json"), "stone_pickaxe", 1)
            .expect("run");
        let args = fs::read_to_string(replica.paths.agents_dir.join("args.txt")).expect("args");
        assert_eq!(
            args.trim(),
            "--task_path /tasks.json --task_id stone_pickaxe port=55916"
        );
        let log = fs::read_to_string(&replica.paths.task_runner_log).expect("log");
        assert!(log.contains("=== attempt 1 task_id=stone_pickaxe ==="));
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn non_zero_exit_is_task_runner_failed() {
        let (root, replica) = fixture("replab_supervisor_fail");
        let sup = supervisor(Arc::new(RecordingBackend::default()), &["sh", "-c", "exit 7"]);
        let err = sup
            .run_task_once(&replica, Path::new("t.json"), "t", 2)
            .expect_err("fails");
        match err.downcast_ref::<OrchestratorError>() {
            Some(OrchestratorError::TaskRunnerFailed {
                replica: 0,
                attempt: 2,
                status,
            }) => assert_eq!(status, "exit code 7"),
            other => panic!("unexpected: {:?}", other),
        }

        let sup = supervisor(
            Arc::new(RecordingBackend::default()),
            &["replab-missing-task-runner"],
        );
        let err = sup
            .run_task_once(&replica, Path::new("t.json"), "t", 3)
            .expect_err("spawn fails");
        assert!(err
            .downcast_ref::<OrchestratorError>()
            .map(|e| e.is_recoverable())
            .unwrap_or(false));
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn stop_all_terminates_a_running_task_runner() {
        let (root, replica) = fixture("replab_supervisor_stop_runner");
        let sup = Arc::new(supervisor(
            Arc::new(RecordingBackend::default()),
            &["sh", "-c", "sleep 3; touch finished", "runner"],
        ));
        let worker = {
            let sup = sup.clone();
            let replica = replica.clone();
            thread::spawn(move || {
                let started = Instant::now();
                let result = sup.run_task_once(&replica, Path::new("t.json"), "t", 1);
                (result, started.elapsed())
            })
        };
        let deadline = Instant::now() + Duration::from_secs(2);
        while sup.running_task_runner(&replica.session).is_none() && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(10));
        }
        assert!(sup.running_task_runner(&replica.session).is_some());
        thread::sleep(Duration::from_millis(200));

        sup.stop_all(&replica.session).expect("stop");
        let (result, elapsed) = worker.join().expect("worker");
        assert!(elapsed < Duration::from_secs(2), "runner outlived stop_all: {:?}", elapsed);
        match result.expect_err("signalled").downcast_ref::<OrchestratorError>() {
            Some(OrchestratorError::TaskRunnerFailed { status, .. }) => {
                assert_eq!(status, "terminated by signal")
            }
            other => panic!("unexpected: {:?}", other),
        }
        assert!(sup.running_task_runner(&replica.session).is_none());
        thread::sleep(Duration::from_millis(100));
        assert!(!replica.paths.agents_dir.join("finished").exists());
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn command_templates_render_replab_placeholders() {
        let env = BTreeMap::from([
            ("REPLAB_PROJECT_DIR".to_string(), "/p".to_string()),
            ("HOME".to_string(), "/home".to_string()),
        ]);
        let argv = render_command(
            &[
                "node".to_string(),
                "${REPLAB_PROJECT_DIR}/main.js".to_string(),
                "${HOME}".to_string(),
            ],
            &env,
        );
        assert_eq!(argv, vec!["node", "/p/main.js", "${HOME}"]);
    }
}
