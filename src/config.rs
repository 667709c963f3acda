/// `config.rs` — host configuration
///
/// Loaded from a JSON file (all fields optional) and then patched from the
/// environment:
///   ELG_SCRIPT_DIR      — directory holding `<extension><suffix>` scripts
///   ELG_BOOTSTRAP       — initialization script run once per runtime
///   ELG_ADVANCE_POLICY  — `ignore` | `warn` | `reject`
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::{error::ElgError, scripting::sandbox::TrustLevel};

pub const DEFAULT_SCRIPT_DIR: &str = "Scripts";
pub const DEFAULT_EXTENSION_SUFFIX: &str = ".upp";

// ── AdvancePolicy ─────────────────────────────────────────────────────────────

/// What to do when a `token_event` proposes an index the buffer cannot honor.
///
/// In every case the engine position is left unchanged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum AdvancePolicy {
    /// Drop the proposal silently.
    Ignore,
    /// Drop the proposal and log a warning.
    #[default]
    Warn,
    /// Surface the proposal as an `AdvanceOutOfBounds` error.
    Reject,
}

impl AdvancePolicy {
    fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "ignore" => Some(Self::Ignore),
            "warn" => Some(Self::Warn),
            "reject" => Some(Self::Reject),
            _ => None,
        }
    }
}

// ── HostConfig ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HostConfig {
    pub script_dir: PathBuf,
    pub extension_suffix: String,
    /// When `None` the built-in bootstrap runs instead.
    pub bootstrap: Option<PathBuf>,
    pub trust: TrustLevel,
    pub advance_policy: AdvancePolicy,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            script_dir: PathBuf::from(DEFAULT_SCRIPT_DIR),
            extension_suffix: DEFAULT_EXTENSION_SUFFIX.to_string(),
            bootstrap: None,
            trust: TrustLevel::Elevated,
            advance_policy: AdvancePolicy::default(),
        }
    }
}

impl HostConfig {
    pub fn from_json(path: &Path, text: &str) -> Result<Self, ElgError> {
        serde_json::from_str(text).map_err(|e| ElgError::Config {
            path: path.to_path_buf(),
            message: e.to_string(),
        })
    }

    pub fn from_file(path: &Path) -> Result<Self, ElgError> {
        let text = std::fs::read_to_string(path).map_err(|source| ElgError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json(path, &text)
    }

    /// Apply `ELG_*` overrides from the process environment.
    pub fn with_env_overrides(self) -> Result<Self, ElgError> {
        self.with_overrides(|key| std::env::var(key).ok())
    }

    fn with_overrides(
        mut self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<Self, ElgError> {
        if let Some(dir) = lookup("ELG_SCRIPT_DIR") {
            self.script_dir = PathBuf::from(dir);
        }
        if let Some(path) = lookup("ELG_BOOTSTRAP") {
            self.bootstrap = Some(PathBuf::from(path));
        }
        if let Some(policy) = lookup("ELG_ADVANCE_POLICY") {
            self.advance_policy = AdvancePolicy::parse(&policy).ok_or_else(|| ElgError::Config {
                path: PathBuf::from("ELG_ADVANCE_POLICY"),
                message: format!("unknown advance policy '{policy}'"),
            })?;
        }
        Ok(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_json_yields_defaults() {
        let cfg = HostConfig::from_json(Path::new("elg.json"), "{}").unwrap();
        assert_eq!(cfg, HostConfig::default());
        assert_eq!(cfg.extension_suffix, ".upp");
        assert_eq!(cfg.advance_policy, AdvancePolicy::Warn);
    }

    #[test]
    fn json_fields_are_snake_case() {
        let cfg = HostConfig::from_json(
            Path::new("elg.json"),
            r#"{ "script_dir": "/opt/elg", "trust": "basic", "advance_policy": "reject" }"#,
        )
        .unwrap();
        assert_eq!(cfg.script_dir, PathBuf::from("/opt/elg"));
        assert_eq!(cfg.trust, TrustLevel::Basic);
        assert_eq!(cfg.advance_policy, AdvancePolicy::Reject);
    }

    #[test]
    fn malformed_json_is_a_config_error() {
        let err = HostConfig::from_json(Path::new("bad.json"), "{ nope").unwrap_err();
        assert!(matches!(err, ElgError::Config { .. }));
        assert!(err.to_string().contains("bad.json"));
    }

    #[test]
    fn env_overrides_replace_fields() {
        let cfg = HostConfig::default()
            .with_overrides(|key| match key {
                "ELG_SCRIPT_DIR" => Some("/srv/scripts".into()),
                "ELG_ADVANCE_POLICY" => Some("Ignore".into()),
                _ => None,
            })
            .unwrap();
        assert_eq!(cfg.script_dir, PathBuf::from("/srv/scripts"));
        assert_eq!(cfg.advance_policy, AdvancePolicy::Ignore);
        assert_eq!(cfg.bootstrap, None);
    }

    #[test]
    fn unknown_policy_override_is_rejected() {
        let err = HostConfig::default()
            .with_overrides(|key| (key == "ELG_ADVANCE_POLICY").then(|| "loud".to_string()))
            .unwrap_err();
        assert!(err.to_string().contains("loud"));
    }
}
