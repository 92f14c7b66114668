use anyhow::{anyhow, Context, Result};
use replab_core::{
    dir_is_empty_or_missing, ensure_dir, replica_paths, server_session_name, session_token,
    OrchestratorError, ReplicaPaths,
};
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

use crate::config::{patch_properties_port, PropertiesPatch};

/// One isolated environment instance: its own tree, port and session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Replica {
    pub index: usize,
    pub paths: ReplicaPaths,
    pub port: u16,
    pub session: String,
    pub agents: Vec<String>,
}

impl Replica {
    pub fn token(&self) -> String {
        session_token(self.index)
    }
}

#[derive(Debug, Clone)]
pub struct ProvisionFailure {
    pub index: usize,
    pub path: PathBuf,
    pub error: String,
}

/// Partial success is allowed: replicas that failed are listed, not returned.
#[derive(Debug, Clone, Default)]
pub struct ProvisionReport {
    pub replicas: Vec<Replica>,
    pub failures: Vec<ProvisionFailure>,
}

#[derive(Debug, Clone)]
pub struct Provisioner {
    template: PathBuf,
    work_root: PathBuf,
    base_port: u16,
    session_prefix: String,
}

impl Provisioner {
    pub fn new(
        template: impl AsRef<Path>,
        work_root: impl AsRef<Path>,
        base_port: u16,
        session_prefix: impl Into<String>,
    ) -> Self {
        Self {
            template: template.as_ref().to_path_buf(),
            work_root: work_root.as_ref().to_path_buf(),
            base_port,
            session_prefix: session_prefix.into(),
        }
    }

    /// Describes replica `index` without touching the filesystem.
    pub fn replica(&self, index: usize) -> Result<Replica> {
        let offset = u16::try_from(index).map_err(|_| anyhow!("replica index {} too large", index))?;
        let port = self.base_port.checked_add(offset).ok_or_else(|| {
            anyhow!(
                "replica {} port overflows: base {} + {}",
                index,
                self.base_port,
                index
            )
        })?;
        Ok(Replica {
            index,
            paths: replica_paths(&self.work_root, index),
            port,
            session: server_session_name(&self.session_prefix, index),
            agents: Vec::new(),
        })
    }

    pub fn provision(&self, count: usize) -> ProvisionReport {
        let mut report = ProvisionReport::default();
        for index in 0..count {
            match self.provision_one(index) {
                Ok(replica) => {
                    info!(
                        replica = index,
                        port = replica.port,
                        root = %replica.paths.root.display(),
                        "replica provisioned"
                    );
                    report.replicas.push(replica);
                }
                Err(err) => {
                    let path = replica_paths(&self.work_root, index).root;
                    warn!(
                        replica = index,
                        path = %path.display(),
                        error = %format!("{:#}", err),
                        "replica provisioning failed; skipping"
                    );
                    report.failures.push(ProvisionFailure {
                        index,
                        path,
                        error: format!("{:#}", err),
                    });
                }
            }
        }
        report
    }

    fn provision_one(&self, index: usize) -> Result<Replica> {
        let replica = self.replica(index)?;
        let root = &replica.paths.root;
        if !dir_is_empty_or_missing(root)? {
            return Err(OrchestratorError::ReplicaExists {
                index,
                path: root.clone(),
            }
            .into());
        }
        if !self.template.is_dir() {
            return Err(anyhow!(
                "template directory not found: {}",
                self.template.display()
            ));
        }
        let result = (|| -> Result<()> {
            copy_tree(&self.template, &replica.paths.server_dir).with_context(|| {
                format!(
                    "failed copying {} to {}",
                    self.template.display(),
                    replica.paths.server_dir.display()
                )
            })?;
            ensure_dir(&replica.paths.agents_dir)?;
            ensure_dir(&replica.paths.logs_dir)?;
            if let PropertiesPatch::KeyAbsent =
                patch_properties_port(&replica.paths.properties, replica.port)?
            {
                warn!(replica = index, port = replica.port, "replica keeps template port");
            }
            Ok(())
        })();
        if let Err(err) = result {
            let _ = fs::remove_dir_all(root);
            return Err(err);
        }
        Ok(replica)
    }

    pub fn teardown(&self, replica: &Replica) -> Result<()> {
        teardown(replica)
    }
}

/// Removes a replica's tree. A root that is already gone is only logged.
pub fn teardown(replica: &Replica) -> Result<()> {
    let root = &replica.paths.root;
    match fs::remove_dir_all(root) {
        Ok(()) => {
            info!(replica = replica.index, root = %root.display(), "replica removed");
            Ok(())
        }
        Err(err) if err.kind() == ErrorKind::NotFound => {
            warn!(replica = replica.index, root = %root.display(), "replica already absent");
            Ok(())
        }
        Err(err) => Err(anyhow!(
            "failed removing replica {} at {}: {}",
            replica.index,
            root.display(),
            err
        )),
    }
}

fn copy_tree(src: &Path, dst: &Path) -> Result<()> {
    ensure_dir(dst)?;
    for entry in walkdir::WalkDir::new(src) {
        let entry = entry?;
        let path = entry.path();
        let rel = path.strip_prefix(src)?;
        if rel.as_os_str().is_empty() {
            continue;
        }
        let target = dst.join(rel);
        if entry.file_type().is_dir() {
            ensure_dir(&target)?;
        } else if entry.file_type().is_symlink() {
            if let Some(parent) = target.parent() {
                ensure_dir(parent)?;
            }
            match fs::canonicalize(path) {
                Ok(real) if real.is_file() => {
                    fs::copy(real, &target)?;
                }
                // Directory and dangling links are recreated as links.
                _ => copy_link(path, &target)?,
            }
        } else if entry.file_type().is_file() {
            if let Some(parent) = target.parent() {
                ensure_dir(parent)?;
            }
            fs::copy(path, &target)?;
        }
    }
    Ok(())
}

#[cfg(unix)]
fn copy_link(link: &Path, target: &Path) -> Result<()> {
    let link_target = fs::read_link(link)?;
    std::os::unix::fs::symlink(&link_target, target)?;
    Ok(())
}

#[cfg(not(unix))]
fn copy_link(link: &Path, _target: &Path) -> Result<()> {
    warn!(link = %link.display(), "symlink not copied");
    Ok(())
}
