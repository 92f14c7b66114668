use anyhow::Result;
use chrono::Utc;
use serde_json::Value;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

mod error;
pub use error::OrchestratorError;

pub const REPLAB_SETTINGS_FILE: &str = "settings.js";
pub const REPLAB_PROPERTIES_FILE: &str = "server.properties";
pub const REPLAB_PROPERTIES_PORT_KEY: &str = "server-port";
pub const REPLAB_AGENT_LOG_DIR: &str = "bots";
pub const REPLAB_AGENT_LOG_FILE: &str = "memory.json";
pub const REPLAB_TASK_RUNNER_LOG_FILE: &str = "task_runner.log";
pub const REPLAB_SETTINGS_MARKER: &str = "export default";

pub const REPLAB_DEFAULT_BASE_PORT: u16 = 55916;
pub const REPLAB_DEFAULT_MODEL: &str = "gpt-4o";
pub const REPLAB_DEFAULT_SESSION_PREFIX: &str = "replab";

pub const REPLAB_ENV_PROJECT_DIR: &str = "REPLAB_PROJECT_DIR";
pub const REPLAB_ENV_AGENT_DIR: &str = "REPLAB_AGENT_DIR";
pub const REPLAB_ENV_SERVER_DIR: &str = "REPLAB_SERVER_DIR";
pub const REPLAB_ENV_SETTINGS_PATH: &str = "REPLAB_SETTINGS_PATH";
pub const REPLAB_ENV_PORT: &str = "REPLAB_PORT";
pub const REPLAB_ENV_REPLICA_INDEX: &str = "REPLAB_REPLICA_INDEX";
pub const REPLAB_ENV_SETTLE_SECS: &str = "REPLAB_SETTLE_SECS";
pub const REPLAB_ENV_STAGGER_SECS: &str = "REPLAB_STAGGER_SECS";
pub const REPLAB_ENV_ATTEMPT_PAUSE_SECS: &str = "REPLAB_ATTEMPT_PAUSE_SECS";

/// Filesystem layout of one provisioned replica under the work root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplicaPaths {
    pub root: PathBuf,
    pub server_dir: PathBuf,
    pub agents_dir: PathBuf,
    pub logs_dir: PathBuf,
    pub properties: PathBuf,
    pub settings: PathBuf,
    pub task_runner_log: PathBuf,
}

pub fn replica_paths(work_root: &Path, index: usize) -> ReplicaPaths {
    let root = work_root.join(format!("replica_{}", index));
    let server_dir = root.join("server");
    let agents_dir = root.join("agents");
    let logs_dir = root.join("logs");
    ReplicaPaths {
        properties: server_dir.join(REPLAB_PROPERTIES_FILE),
        settings: agents_dir.join(REPLAB_SETTINGS_FILE),
        task_runner_log: logs_dir.join(REPLAB_TASK_RUNNER_LOG_FILE),
        root,
        server_dir,
        agents_dir,
        logs_dir,
    }
}

/// Token appended to agent names and session names so replicas never collide.
pub fn session_token(index: usize) -> String {
    index.to_string()
}

pub fn server_session_name(prefix: &str, index: usize) -> String {
    format!("{}_server_{}", prefix, session_token(index))
}

pub fn agent_log_path(agents_dir: &Path, agent: &str) -> PathBuf {
    agents_dir
        .join(REPLAB_AGENT_LOG_DIR)
        .join(agent)
        .join(REPLAB_AGENT_LOG_FILE)
}

pub fn ensure_dir(path: &Path) -> Result<()> {
    fs::create_dir_all(path)?;
    Ok(())
}

pub fn dir_is_empty_or_missing(path: &Path) -> Result<bool> {
    if !path.exists() {
        return Ok(true);
    }
    if !path.is_dir() {
        return Ok(false);
    }
    Ok(fs::read_dir(path)?.next().is_none())
}

pub fn atomic_write_bytes(path: &Path, bytes: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        ensure_dir(parent)?;
    }
    let ts = Utc::now().timestamp_micros();
    let pid = std::process::id();
    let name = path
        .file_name()
        .and_then(|s| s.to_str())
        .unwrap_or("tmpfile");
    let tmp = path.with_file_name(format!(".{}.tmp.{}.{}", name, pid, ts));
    let mut file = fs::File::create(&tmp)?;
    file.write_all(bytes)?;
    file.sync_all()?;
    fs::rename(&tmp, path)?;
    if let Some(parent) = path.parent() {
        if let Ok(dir) = fs::File::open(parent) {
            let _ = dir.sync_all();
        }
    }
    Ok(())
}

pub fn atomic_write_json_pretty(path: &Path, value: &Value) -> Result<()> {
    let bytes = serde_json::to_vec_pretty(value)?;
    atomic_write_bytes(path, &bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn replica_paths_are_index_qualified() {
        let root = Path::new("/work");
        let a = replica_paths(root, 0);
        let b = replica_paths(root, 1);
        assert_eq!(a.root, PathBuf::from("/work/replica_0"));
        assert_eq!(a.properties, PathBuf::from("/work/replica_0/server/server.properties"));
        assert_eq!(a.settings, PathBuf::from("/work/replica_0/agents/settings.js"));
        assert!(!b.root.starts_with(&a.root));
    }

    #[test]
    fn session_names_carry_the_replica_token() {
        assert_eq!(server_session_name("replab", 3), "replab_server_3");
        assert_eq!(
            agent_log_path(Path::new("/a"), "andy_0"),
            PathBuf::from("/a/bots/andy_0/memory.json")
        );
    }

    #[test]
    fn atomic_write_replaces_existing_file() {
        let dir = std::env::temp_dir().join(format!(
            "replab_core_atomic_{}_{}",
            std::process::id(),
            Utc::now().timestamp_micros()
        ));
        let path = dir.join("nested").join("out.txt");
        atomic_write_bytes(&path, b"first").expect("first write");
        atomic_write_bytes(&path, b"second").expect("second write");
        assert_eq!(fs::read_to_string(&path).expect("read"), "second");
        let leftovers = fs::read_dir(path.parent().unwrap())
            .expect("list")
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().contains(".tmp."))
            .count();
        assert_eq!(leftovers, 0);
        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn empty_or_missing_dir_detection() {
        let dir = std::env::temp_dir().join(format!(
            "replab_core_empty_{}_{}",
            std::process::id(),
            Utc::now().timestamp_micros()
        ));
        assert!(dir_is_empty_or_missing(&dir).expect("missing"));
        ensure_dir(&dir).expect("mkdir");
        assert!(dir_is_empty_or_missing(&dir).expect("empty"));
        fs::write(dir.join("f"), b"x").expect("write");
        assert!(!dir_is_empty_or_missing(&dir).expect("non-empty"));
        let _ = fs::remove_dir_all(&dir);
    }
}
