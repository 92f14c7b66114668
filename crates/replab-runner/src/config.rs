use anyhow::{Context, Result};
use replab_core::{
    atomic_write_bytes, OrchestratorError, REPLAB_PROPERTIES_PORT_KEY, REPLAB_SETTINGS_MARKER,
};
use serde_json::{Map, Value};
use std::fs;
use std::path::Path;
use tracing::{debug, warn};

/// Settings document shared by the agent runtime. The on-disk text is a JS
/// module (`export default { ... }`) holding JSON with comments and trailing
/// commas, so it is normalized before parsing and re-rendered with the marker.
#[derive(Debug, Clone, PartialEq)]
pub struct ConfigDocument {
    marker: Option<String>,
    body: Map<String, Value>,
}

impl ConfigDocument {
    pub fn new(marker: Option<String>, body: Map<String, Value>) -> Self {
        Self { marker, body }
    }

    pub fn parse(text: &str, origin: &str) -> Result<Self> {
        let without_comments = strip_line_comments(text);
        let (marker, rest) = split_leading_marker(&without_comments);
        let rest = rest.trim();
        let rest = rest.strip_suffix(';').unwrap_or(rest).trim_end();
        let cleaned = strip_trailing_commas(rest);
        let value: Value =
            serde_json::from_str(&cleaned).map_err(|err| OrchestratorError::MalformedConfig {
                origin: origin.to_string(),
                reason: err.to_string(),
            })?;
        match value {
            Value::Object(body) => Ok(Self { marker, body }),
            other => Err(OrchestratorError::MalformedConfig {
                origin: origin.to_string(),
                reason: format!("top-level value must be an object, got {}", json_kind(&other)),
            }
            .into()),
        }
    }

    pub fn render(&self) -> Result<String> {
        let body = serde_json::to_string_pretty(&Value::Object(self.body.clone()))?;
        Ok(match &self.marker {
            Some(marker) => format!("{}\n{}\n", marker, body),
            None => format!("{}\n", body),
        })
    }

    pub fn marker(&self) -> Option<&str> {
        self.marker.as_deref()
    }

    pub fn body(&self) -> &Map<String, Value> {
        &self.body
    }

    pub fn port(&self) -> Option<u16> {
        self.body
            .get("port")
            .and_then(|v| v.as_u64())
            .and_then(|p| u16::try_from(p).ok())
    }

    pub fn profiles(&self) -> Vec<String> {
        self.body
            .get("profiles")
            .and_then(|v| v.as_array())
            .map(|items| {
                items
                    .iter()
                    .filter_map(|item| item.as_str().map(str::to_string))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Agent names derived from profile references: `./andy.json` -> `andy`.
    pub fn agent_names(&self) -> Vec<String> {
        self.profiles()
            .iter()
            .map(|profile| profile_reference_name(profile))
            .collect()
    }

    /// Replaces keys in place (keeping their position) or appends new ones.
    pub fn apply(&mut self, patch: &Map<String, Value>) {
        for (key, value) in patch {
            self.body.insert(key.clone(), value.clone());
        }
    }
}

pub fn profile_reference(name: &str) -> String {
    format!("./{}.json", name)
}

pub fn profile_reference_name(reference: &str) -> String {
    let file = reference.rsplit('/').next().unwrap_or(reference);
    file.split('.').next().unwrap_or(file).to_string()
}

pub fn load(path: &Path) -> Result<ConfigDocument> {
    let text = fs::read_to_string(path)
        .with_context(|| format!("failed reading config {}", path.display()))?;
    ConfigDocument::parse(&text, &path.display().to_string())
}

pub fn save(path: &Path, doc: &ConfigDocument) -> Result<()> {
    let rendered = doc.render()?;
    atomic_write_bytes(path, rendered.as_bytes())
        .with_context(|| format!("failed writing config {}", path.display()))
}

pub fn apply_patch(path: &Path, patch: &Map<String, Value>) -> Result<()> {
    let mut doc = load(path)?;
    doc.apply(patch);
    save(path, &doc)?;
    debug!(path = %path.display(), keys = ?patch.keys().collect::<Vec<_>>(), "config patched");
    Ok(())
}

/// Result of rewriting a properties file. `KeyAbsent` leaves the file untouched.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PropertiesPatch {
    Updated { lines: usize },
    KeyAbsent,
}

pub fn patch_properties_port(path: &Path, port: u16) -> Result<PropertiesPatch> {
    let text = fs::read_to_string(path)
        .with_context(|| format!("failed reading properties {}", path.display()))?;
    let (patched, lines) =
        patch_properties_text(&text, REPLAB_PROPERTIES_PORT_KEY, &port.to_string());
    if lines == 0 {
        warn!(
            path = %path.display(),
            key = REPLAB_PROPERTIES_PORT_KEY,
            port,
            "properties key absent; port left unchanged"
        );
        return Ok(PropertiesPatch::KeyAbsent);
    }
    atomic_write_bytes(path, patched.as_bytes())
        .with_context(|| format!("failed writing properties {}", path.display()))?;
    debug!(path = %path.display(), port, "server port updated");
    Ok(PropertiesPatch::Updated { lines })
}

/// Rewrites every `key=...` line, keeping each line's terminator. Returns the
/// new text and how many lines changed.
pub fn patch_properties_text(text: &str, key: &str, value: &str) -> (String, usize) {
    let prefix = format!("{}=", key);
    let mut out = String::with_capacity(text.len() + 8);
    let mut changed = 0;
    for line in text.split_inclusive('\n') {
        let (content, ending) = split_line_ending(line);
        if content.starts_with(&prefix) {
            out.push_str(&prefix);
            out.push_str(value);
            out.push_str(ending);
            changed += 1;
        } else {
            out.push_str(line);
        }
    }
    (out, changed)
}

fn split_line_ending(line: &str) -> (&str, &str) {
    if let Some(content) = line.strip_suffix("\r\n") {
        (content, "\r\n")
    } else if let Some(content) = line.strip_suffix('\n') {
        (content, "\n")
    } else {
        (line, "")
    }
}

fn split_leading_marker(text: &str) -> (Option<String>, &str) {
    let trimmed = text.trim_start();
    if let Some(after_export) = trimmed.strip_prefix("export") {
        let after_ws = after_export.trim_start();
        if after_ws.len() < after_export.len() {
            if let Some(rest) = after_ws.strip_prefix("default") {
                return (Some(REPLAB_SETTINGS_MARKER.to_string()), rest);
            }
        }
    }
    (None, trimmed)
}

fn strip_line_comments(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut chars = text.chars().peekable();
    let mut in_string = false;
    let mut escaped = false;
    while let Some(c) = chars.next() {
        if in_string {
            out.push(c);
            if escaped {
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == '"' {
                in_string = false;
            }
            continue;
        }
        match c {
            '"' => {
                in_string = true;
                out.push(c);
            }
            '/' if chars.peek() == Some(&'/') => {
                for skipped in chars.by_ref() {
                    if skipped == '\n' {
                        out.push('\n');
                        break;
                    }
                }
            }
            _ => out.push(c),
        }
    }
    out
}

fn strip_trailing_commas(text: &str) -> String {
    let chars: Vec<char> = text.chars().collect();
    let mut out = String::with_capacity(text.len());
    let mut in_string = false;
    let mut escaped = false;
    for (idx, &c) in chars.iter().enumerate() {
        if in_string {
            out.push(c);
            if escaped {
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == '"' {
                in_string = false;
            }
            continue;
        }
        if c == '"' {
            in_string = true;
        } else if c == ',' {
            let next = chars[idx + 1..].iter().copied().find(|n| !n.is_whitespace());
            if matches!(next, Some('}') | Some(']')) {
                continue;
            }
        }
        out.push(c);
    }
    out
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const SETTINGS: &str = r#"export default
{
    "minecraft_version": "1.20.4", // supports up to 1.21.1
    "host": "127.0.0.1", // or "localhost"
    "port": 55916,
    "auth": "offline",
    "profiles": [
        "./andy.json",
        // "./jill.json",
    ],
    "load_memory": false,
    "docs_url": "https://example.org/docs",
}
"#;

    #[test]
    fn parses_relaxed_settings() {
        let doc = ConfigDocument::parse(SETTINGS, "settings.js").expect("parse");
        assert_eq!(doc.marker(), Some("export default"));
        assert_eq!(doc.port(), Some(55916));
        assert_eq!(doc.profiles(), vec!["./andy.json".to_string()]);
        assert_eq!(doc.agent_names(), vec!["andy".to_string()]);
        assert_eq!(
            doc.body().get("docs_url"),
            Some(&json!("https://example.org/docs"))
        );
    }

    #[test]
    fn render_then_parse_is_structurally_identical() {
        let doc = ConfigDocument::parse(SETTINGS, "settings.js").expect("parse");
        let rendered = doc.render().expect("render");
        assert!(rendered.starts_with("export default\n{\n  \""));
        let reparsed = ConfigDocument::parse(&rendered, "rendered").expect("reparse");
        assert_eq!(doc, reparsed);
        let keys: Vec<&String> = reparsed.body().keys().collect();
        assert_eq!(keys.first().map(|k| k.as_str()), Some("minecraft_version"));
    }

    #[test]
    fn document_without_marker_round_trips_without_one() {
        let doc = ConfigDocument::parse("{\"port\": 1, \"profiles\": [],}", "plain").expect("parse");
        assert_eq!(doc.marker(), None);
        let rendered = doc.render().expect("render");
        assert!(rendered.starts_with('{'));
    }

    #[test]
    fn malformed_text_is_reported_as_malformed_config() {
        let err = ConfigDocument::parse("export default { \"port\": }", "broken.js")
            .expect_err("must fail");
        match err.downcast_ref::<OrchestratorError>() {
            Some(OrchestratorError::MalformedConfig { origin, .. }) => {
                assert_eq!(origin, "broken.js")
            }
            other => panic!("unexpected error: {:?}", other),
        }

        let err = ConfigDocument::parse("export default [1, 2]", "array.js").expect_err("array");
        assert!(err.to_string().contains("must be an object"), "{}", err);
    }

    #[test]
    fn apply_keeps_key_position_and_appends_new_keys() {
        let mut doc = ConfigDocument::parse(SETTINGS, "settings.js").expect("parse");
        let patch = json!({
            "port": 55918,
            "profiles": ["./andy_2.json", "./jill_2.json"],
            "extra": true
        });
        doc.apply(patch.as_object().expect("object"));
        assert_eq!(doc.port(), Some(55918));
        assert_eq!(doc.agent_names(), vec!["andy_2", "jill_2"]);
        let keys: Vec<&str> = doc.body().keys().map(|k| k.as_str()).collect();
        assert_eq!(keys[2], "port");
        assert_eq!(keys.last().copied(), Some("extra"));
    }

    #[test]
    fn properties_patch_touches_only_the_port_line() {
        let text = "#Minecraft server properties\r\nmotd=A Server\nserver-port=25565\nlevel-name=world";
        let (patched, changed) = patch_properties_text(text, "server-port", "55917");
        assert_eq!(changed, 1);
        let before: Vec<&str> = text.split_inclusive('\n').collect();
        let after: Vec<&str> = patched.split_inclusive('\n').collect();
        assert_eq!(before.len(), after.len());
        let differing: Vec<usize> = (0..before.len()).filter(|i| before[*i] != after[*i]).collect();
        assert_eq!(differing, vec![2]);
        assert_eq!(after[2], "server-port=55917\n");
    }

    #[test]
    fn properties_key_absent_is_a_distinguishable_no_op() {
        let dir = std::env::temp_dir().join(format!(
            "replab_props_absent_{}_{}",
            std::process::id(),
            chrono::Utc::now().timestamp_micros()
        ));
        fs::create_dir_all(&dir).expect("dir");
        let path = dir.join("server.properties");
        fs::write(&path, "motd=hi\nserver-portx=1\n").expect("write");
        let outcome = patch_properties_port(&path, 55920).expect("patch");
        assert_eq!(outcome, PropertiesPatch::KeyAbsent);
        assert_eq!(fs::read_to_string(&path).expect("read"), "motd=hi\nserver-portx=1\n");

        fs::write(&path, "server-port=1\n").expect("write");
        let outcome = patch_properties_port(&path, 55920).expect("patch");
        assert_eq!(outcome, PropertiesPatch::Updated { lines: 1 });
        assert_eq!(fs::read_to_string(&path).expect("read"), "server-port=55920\n");
        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn apply_patch_rewrites_file_in_place() {
        let dir = std::env::temp_dir().join(format!(
            "replab_apply_patch_{}_{}",
            std::process::id(),
            chrono::Utc::now().timestamp_micros()
        ));
        fs::create_dir_all(&dir).expect("dir");
        let path = dir.join("settings.js");
        fs::write(&path, SETTINGS).expect("write");
        let patch = json!({ "port": 55917 });
        apply_patch(&path, patch.as_object().expect("object")).expect("patch");
        let doc = load(&path).expect("load");
        assert_eq!(doc.port(), Some(55917));
        assert_eq!(doc.marker(), Some("export default"));
        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn profile_reference_names() {
        assert_eq!(profile_reference_name("./andy.json"), "andy");
        assert_eq!(profile_reference_name("profiles/jill_1.json"), "jill_1");
        assert_eq!(profile_reference("bob_2"), "./bob_2.json");
    }
}
