use anyhow::{Context, Result};
use replab_core::agent_log_path;
use serde::Deserialize;
use std::fs;
use std::path::Path;
use tracing::{debug, warn};

pub const SUCCESS_CODE: u32 = 2;
pub const FAILURE_CODE: u32 = 4;

#[derive(Debug, Deserialize)]
struct TurnLog {
    turns: Vec<Turn>,
}

#[derive(Debug, Deserialize)]
struct Turn {
    role: String,
    #[serde(default)]
    content: String,
}

/// Decides one attempt's outcome from the agents' turn logs.
///
/// Agents are consulted in `priority` order and the first conclusive verdict
/// wins, so callers must pass a stable order. Logs that are missing or
/// malformed are skipped; no verdict at all means failure.
pub fn observe(agents_dir: &Path, priority: &[String]) -> bool {
    for agent in priority {
        let path = agent_log_path(agents_dir, agent);
        match read_verdict(&path) {
            Ok(Some(success)) => {
                debug!(agent = %agent, success, path = %path.display(), "conclusive turn found");
                return success;
            }
            Ok(None) => {
                debug!(agent = %agent, path = %path.display(), "no conclusive turn");
            }
            Err(err) => {
                warn!(agent = %agent, path = %path.display(), error = %format!("{:#}", err), "skipping agent log");
            }
        }
    }
    false
}

fn read_verdict(path: &Path) -> Result<Option<bool>> {
    let raw = fs::read_to_string(path).with_context(|| format!("failed reading {}", path.display()))?;
    let log: TurnLog =
        serde_json::from_str(&raw).with_context(|| format!("malformed turn log {}", path.display()))?;
    Ok(verdict(&log.turns))
}

fn verdict(turns: &[Turn]) -> Option<bool> {
    for turn in turns.iter().rev() {
        if turn.role != "system" {
            continue;
        }
        let conclusive = completion_codes(&turn.content)
            .into_iter()
            .find(|code| *code == SUCCESS_CODE || *code == FAILURE_CODE);
        match conclusive {
            Some(SUCCESS_CODE) => return Some(true),
            Some(_) => return Some(false),
            None => {}
        }
    }
    None
}

/// Every `code : n` (spacing optional) in `content`, in order.
pub fn completion_codes(content: &str) -> Vec<u32> {
    let mut codes = Vec::new();
    let mut rest = content;
    while let Some(pos) = rest.find("code") {
        rest = &rest[pos + 4..];
        if let Some(value) = rest.trim_start().strip_prefix(':') {
            let digits: String = value
                .trim_start()
                .chars()
                .take_while(|c| c.is_ascii_digit())
                .collect();
            if let Ok(code) = digits.parse::<u32>() {
                codes.push(code);
            }
        }
    }
    codes
}
