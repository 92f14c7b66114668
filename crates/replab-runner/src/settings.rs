use anyhow::{anyhow, Context, Result};
use replab_core::{
    REPLAB_DEFAULT_BASE_PORT, REPLAB_DEFAULT_MODEL, REPLAB_DEFAULT_SESSION_PREFIX,
    REPLAB_ENV_ATTEMPT_PAUSE_SECS, REPLAB_ENV_SETTLE_SECS, REPLAB_ENV_STAGGER_SECS,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::profiles::default_modes;

const DEFAULT_ROSTER: [&str; 3] = ["andy", "jill", "bob"];

/// Harness configuration, read from an optional YAML file. Every field has a
/// default so an empty file (or no file) describes the stock layout.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct HarnessConfig {
    /// Agent project: its settings document, profiles and `bots/` logs.
    pub project_dir: PathBuf,
    pub template_dir: PathBuf,
    pub work_root: PathBuf,
    pub report_dir: PathBuf,
    pub base_port: u16,
    pub session_prefix: String,
    pub server_command: String,
    pub task_runner: Vec<String>,
    pub tmux_program: String,
    pub agents: Vec<String>,
    pub models: Vec<String>,
    pub modes: BTreeMap<String, bool>,
    pub settle_secs: u64,
    pub stagger_secs: u64,
    pub attempt_pause_secs: u64,
}

impl Default for HarnessConfig {
    fn default() -> Self {
        Self {
            project_dir: PathBuf::from("."),
            template_dir: PathBuf::from("../server_data"),
            work_root: PathBuf::from("../replab_replicas"),
            report_dir: PathBuf::from("."),
            base_port: REPLAB_DEFAULT_BASE_PORT,
            session_prefix: REPLAB_DEFAULT_SESSION_PREFIX.to_string(),
            server_command: "java -jar server.jar".to_string(),
            task_runner: vec![
                "node".to_string(),
                "${REPLAB_PROJECT_DIR}/main.js".to_string(),
            ],
            tmux_program: "tmux".to_string(),
            agents: default_roster(2).unwrap_or_default(),
            models: vec![REPLAB_DEFAULT_MODEL.to_string(); 2],
            modes: default_modes(),
            settle_secs: 5,
            stagger_secs: 5,
            attempt_pause_secs: 1,
        }
    }
}

impl HarnessConfig {
    pub fn settle(&self) -> Duration {
        Duration::from_secs(self.settle_secs)
    }

    pub fn stagger(&self) -> Duration {
        Duration::from_secs(self.stagger_secs)
    }

    pub fn attempt_pause(&self) -> Duration {
        Duration::from_secs(self.attempt_pause_secs)
    }

    /// Replaces the roster with the first `num_agents` stock names, all on `model`.
    pub fn set_roster(&mut self, num_agents: usize, model: &str) -> Result<()> {
        self.agents = default_roster(num_agents)?;
        self.models = vec![model.to_string(); num_agents];
        Ok(())
    }

    pub fn apply_env_overrides(&mut self) -> Result<()> {
        if let Some(secs) = parse_optional_u64_env(REPLAB_ENV_SETTLE_SECS)? {
            self.settle_secs = secs;
        }
        if let Some(secs) = parse_optional_u64_env(REPLAB_ENV_STAGGER_SECS)? {
            self.stagger_secs = secs;
        }
        if let Some(secs) = parse_optional_u64_env(REPLAB_ENV_ATTEMPT_PAUSE_SECS)? {
            self.attempt_pause_secs = secs;
        }
        Ok(())
    }

    /// Makes every relative path absolute against `base` so child processes
    /// running in replica directories see the same locations.
    pub fn resolve_paths(&mut self, base: &Path) {
        for path in [
            &mut self.project_dir,
            &mut self.template_dir,
            &mut self.work_root,
            &mut self.report_dir,
        ] {
            let resolved = absolutize(base, path.as_path());
            *path = resolved;
        }
    }
}

pub fn default_roster(num_agents: usize) -> Result<Vec<String>> {
    if num_agents == 0 || num_agents > DEFAULT_ROSTER.len() {
        return Err(anyhow!(
            "num_agents must be between 1 and {} (got {})",
            DEFAULT_ROSTER.len(),
            num_agents
        ));
    }
    Ok(DEFAULT_ROSTER[..num_agents]
        .iter()
        .map(|s| s.to_string())
        .collect())
}

pub fn load_harness_config(path: Option<&Path>) -> Result<HarnessConfig> {
    let mut config = match path {
        Some(path) => {
            let raw = fs::read_to_string(path)
                .with_context(|| format!("failed reading harness config {}", path.display()))?;
            if raw.trim().is_empty() {
                HarnessConfig::default()
            } else {
                serde_yaml::from_str(&raw)
                    .with_context(|| format!("invalid harness config {}", path.display()))?
            }
        }
        None => HarnessConfig::default(),
    };
    config.apply_env_overrides()?;
    Ok(config)
}

pub fn absolutize(base: &Path, path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        base.join(path)
    }
}

fn parse_optional_u64_env(name: &str) -> Result<Option<u64>> {
    match env::var(name) {
        Ok(raw) => {
            let trimmed = raw.trim();
            if trimmed.is_empty() {
                return Ok(None);
            }
            let parsed = trimmed.parse::<u64>().map_err(|_| {
                anyhow!(
                    "{} must be a non-negative integer when set (got: {})",
                    name,
                    raw
                )
            })?;
            Ok(Some(parsed))
        }
        Err(env::VarError::NotPresent) => Ok(None),
        Err(err) => Err(anyhow!("failed reading {}: {}", name, err)),
    }
}
