use anyhow::{anyhow, Context, Result};
use std::path::Path;
use std::process::{Command, Stdio};

/// Named, detachable execution contexts. Everything started inside one
/// context is torn down together by `kill_session`.
pub trait SessionBackend: Send + Sync {
    fn has_session(&self, name: &str) -> Result<bool>;
    fn new_session(&self, name: &str, cwd: &Path) -> Result<()>;
    fn send_line(&self, name: &str, line: &str) -> Result<()>;
    fn kill_session(&self, name: &str) -> Result<()>;
}

#[derive(Debug, Clone)]
pub struct TmuxBackend {
    program: String,
}

impl Default for TmuxBackend {
    fn default() -> Self {
        Self {
            program: "tmux".to_string(),
        }
    }
}

impl TmuxBackend {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
        }
    }

    fn command(&self) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.stdin(Stdio::null());
        cmd
    }
}

impl SessionBackend for TmuxBackend {
    fn has_session(&self, name: &str) -> Result<bool> {
        let mut cmd = self.command();
        cmd.args(["has-session", "-t", name]);
        cmd.stdout(Stdio::null()).stderr(Stdio::null());
        let status = cmd
            .status()
            .with_context(|| format!("failed to run {} has-session", self.program))?;
        Ok(status.success())
    }

    fn new_session(&self, name: &str, cwd: &Path) -> Result<()> {
        let mut cmd = self.command();
        cmd.args(["new-session", "-d", "-s", name, "-c"]);
        cmd.arg(cwd);
        run_checked_command(cmd, "tmux new-session failed")
    }

    fn send_line(&self, name: &str, line: &str) -> Result<()> {
        let mut cmd = self.command();
        cmd.args(["send-keys", "-t", name, line, "C-m"]);
        run_checked_command(cmd, "tmux send-keys failed")
    }

    fn kill_session(&self, name: &str) -> Result<()> {
        let mut cmd = self.command();
        cmd.args(["kill-session", "-t", name]);
        run_checked_command(cmd, "tmux kill-session failed")
    }
}

pub(crate) fn run_checked_command(mut cmd: Command, step: &str) -> Result<()> {
    let out = cmd.output()?;
    if out.status.success() {
        return Ok(());
    }
    let stderr = String::from_utf8_lossy(&out.stderr).trim().to_string();
    let stdout = String::from_utf8_lossy(&out.stdout).trim().to_string();
    let detail = if !stderr.is_empty() {
        stderr
    } else if !stdout.is_empty() {
        stdout
    } else {
        "command exited non-zero".to_string()
    };
    Err(anyhow!("{}: {}", step, detail))
}
