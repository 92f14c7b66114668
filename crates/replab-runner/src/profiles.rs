use anyhow::{Context, Result};
use replab_core::{atomic_write_bytes, OrchestratorError};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Identity bound into one replica, persisted as `<dir>/<name>.json`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentProfile {
    pub name: String,
    pub model: String,
    pub modes: BTreeMap<String, bool>,
}

impl AgentProfile {
    pub fn artifact_path(&self, dir: &Path) -> PathBuf {
        dir.join(format!("{}.json", self.name))
    }
}

pub fn default_modes() -> BTreeMap<String, bool> {
    BTreeMap::from([("hunting".to_string(), false)])
}

/// Suffixes each base name with the replica token: `andy` -> `andy_2`.
pub fn replica_agent_names(base_names: &[String], token: &str) -> Vec<String> {
    base_names
        .iter()
        .map(|name| format!("{}_{}", name, token))
        .collect()
}

pub fn check_arity(names: &[String], models: &[String]) -> Result<()> {
    if names.len() != models.len() {
        return Err(OrchestratorError::ArityMismatch {
            names: names.len(),
            models: models.len(),
        }
        .into());
    }
    Ok(())
}

pub fn materialize(
    dir: &Path,
    names: &[String],
    models: &[String],
    modes: &BTreeMap<String, bool>,
) -> Result<Vec<AgentProfile>> {
    check_arity(names, models)?;
    let mut profiles = Vec::with_capacity(names.len());
    for (name, model) in names.iter().zip(models) {
        let profile = AgentProfile {
            name: name.clone(),
            model: model.clone(),
            modes: modes.clone(),
        };
        let path = profile.artifact_path(dir);
        let bytes = serde_json::to_vec(&profile)?;
        atomic_write_bytes(&path, &bytes)
            .with_context(|| format!("failed writing profile {}", path.display()))?;
        debug!(agent = %profile.name, model = %profile.model, path = %path.display(), "profile written");
        profiles.push(profile);
    }
    Ok(profiles)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn temp_dir(prefix: &str) -> PathBuf {
        let path = std::env::temp_dir().join(format!(
            "{}_{}_{}",
            prefix,
            std::process::id(),
            chrono::Utc::now().timestamp_micros()
        ));
        fs::create_dir_all(&path).expect("temp dir");
        path
    }

    #[test]
    fn materialize_writes_one_artifact_per_agent() {
        let dir = temp_dir("replab_profiles");
        let names = replica_agent_names(&["andy".to_string(), "jill".to_string()], "1");
        let models = vec!["gpt-4o".to_string(); 2];
        let profiles = materialize(&dir, &names, &models, &default_modes()).expect("materialize");
        assert_eq!(profiles.len(), 2);
        assert_eq!(profiles[0].name, "andy_1");

        let raw = fs::read_to_string(dir.join("jill_1.json")).expect("artifact");
        let value: serde_json::Value = serde_json::from_str(&raw).expect("json");
        assert_eq!(value["name"], "jill_1");
        assert_eq!(value["model"], "gpt-4o");
        assert_eq!(value["modes"]["hunting"], false);

        let again = materialize(&dir, &names, &models, &default_modes()).expect("rerun");
        assert_eq!(profiles, again);
        assert_eq!(fs::read_to_string(dir.join("jill_1.json")).expect("artifact"), raw);
        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn arity_mismatch_writes_nothing() {
        let dir = temp_dir("replab_profiles_arity");
        let err = materialize(
            &dir,
            &["andy".to_string(), "jill".to_string()],
            &["gpt-4o".to_string()],
            &default_modes(),
        )
        .expect_err("arity");
        assert!(matches!(
            err.downcast_ref::<OrchestratorError>(),
            Some(OrchestratorError::ArityMismatch { names: 2, models: 1 })
        ));
        assert_eq!(fs::read_dir(&dir).expect("list").count(), 0);
        let _ = fs::remove_dir_all(&dir);
    }
}
