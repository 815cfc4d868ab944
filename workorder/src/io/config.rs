//! Engine configuration stored at `.workorder/config.toml`.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};

use crate::core::paths::normalize_repo_path;
use crate::core::validator::ValidationRules;

/// Repository-relative default location of the config file.
pub const DEFAULT_CONFIG_PATH: &str = ".workorder/config.toml";

/// Engine tunables (TOML).
///
/// Missing fields take their defaults so a partial file stays valid.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct EngineConfig {
    /// Attempts per work order, including the first.
    pub max_attempts: u32,

    /// Wall-clock limit for each verification command.
    pub command_timeout_secs: u64,

    /// Wall-clock limit for one oracle call.
    pub oracle_timeout_secs: u64,

    /// Captured stdout/stderr kept per child process.
    pub output_limit_bytes: usize,

    /// Output tail kept in a failure brief.
    pub brief_output_limit_bytes: usize,

    /// Run summaries, relative to the repository root.
    pub artifacts_dir: PathBuf,

    /// Prefix for generated working branches.
    pub branch_prefix: String,

    pub verify: VerifyConfig,
    pub oracle: OracleConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct VerifyConfig {
    /// Global verification command, run before acceptance commands.
    pub command: Vec<String>,
    /// Script the global command runs; the bootstrap order is the one that writes it.
    pub script_path: String,
}

impl Default for VerifyConfig {
    fn default() -> Self {
        Self {
            command: vec!["sh".to_string(), "scripts/verify.sh".to_string()],
            script_path: "scripts/verify.sh".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct OracleConfig {
    /// Oracle process; the prompt is written to its stdin.
    pub command: Vec<String>,
}

impl Default for OracleConfig {
    fn default() -> Self {
        Self {
            command: vec!["codex".to_string(), "exec".to_string(), "-".to_string()],
        }
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            command_timeout_secs: 600,
            oracle_timeout_secs: 900,
            output_limit_bytes: 100_000,
            brief_output_limit_bytes: 4_000,
            artifacts_dir: PathBuf::from(".workorder/runs"),
            branch_prefix: "workorder/".to_string(),
            verify: VerifyConfig::default(),
            oracle: OracleConfig::default(),
        }
    }
}

impl EngineConfig {
    pub fn validate(&self) -> Result<()> {
        if self.max_attempts == 0 {
            return Err(anyhow!("max_attempts must be > 0"));
        }
        if self.command_timeout_secs == 0 {
            return Err(anyhow!("command_timeout_secs must be > 0"));
        }
        if self.oracle_timeout_secs == 0 {
            return Err(anyhow!("oracle_timeout_secs must be > 0"));
        }
        if self.output_limit_bytes == 0 {
            return Err(anyhow!("output_limit_bytes must be > 0"));
        }
        if self.brief_output_limit_bytes == 0 {
            return Err(anyhow!("brief_output_limit_bytes must be > 0"));
        }
        if self.verify.command.is_empty() || self.verify.command[0].trim().is_empty() {
            return Err(anyhow!("verify.command must be a non-empty array"));
        }
        if self.oracle.command.is_empty() || self.oracle.command[0].trim().is_empty() {
            return Err(anyhow!("oracle.command must be a non-empty array"));
        }
        let script = normalize_repo_path(&self.verify.script_path)
            .map_err(|reason| anyhow!("verify.script_path: {reason}"))?;
        if script != self.verify.script_path {
            return Err(anyhow!(
                "verify.script_path must be normalized (use '{script}')"
            ));
        }
        if self.artifacts_dir.is_absolute() {
            return Err(anyhow!("artifacts_dir must be relative to the repository"));
        }
        let artifacts = self.artifacts_dir.to_string_lossy();
        normalize_repo_path(&artifacts).map_err(|reason| anyhow!("artifacts_dir: {reason}"))?;
        if self.branch_prefix.trim().is_empty() {
            return Err(anyhow!("branch_prefix must not be empty"));
        }
        Ok(())
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_secs)
    }

    pub fn oracle_timeout(&self) -> Duration {
        Duration::from_secs(self.oracle_timeout_secs)
    }

    pub fn validation_rules(&self) -> ValidationRules {
        ValidationRules {
            verify_script_path: self.verify.script_path.clone(),
        }
    }

    /// First component of `artifacts_dir`, as excluded from git.
    pub fn artifacts_root(&self) -> String {
        self.artifacts_dir
            .components()
            .next()
            .map(|c| c.as_os_str().to_string_lossy().to_string())
            .unwrap_or_default()
    }
}

/// Load config from a TOML file.
///
/// If the file is missing, returns `EngineConfig::default()`.
pub fn load_config(path: &Path) -> Result<EngineConfig> {
    if !path.exists() {
        let cfg = EngineConfig::default();
        cfg.validate()?;
        return Ok(cfg);
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let cfg: EngineConfig =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    cfg.validate()
        .with_context(|| format!("validate {}", path.display()))?;
    Ok(cfg)
}

/// Atomically write config to disk (temp file + rename).
pub fn write_config(path: &Path, cfg: &EngineConfig) -> Result<()> {
    cfg.validate()?;
    let mut buf = toml::to_string_pretty(cfg).context("serialize config toml")?;
    buf.push('\n');
    write_atomic(path, &buf)
}

fn write_atomic(path: &Path, contents: &str) -> Result<()> {
    let parent = path
        .parent()
        .with_context(|| format!("config path missing parent {}", path.display()))?;
    fs::create_dir_all(parent).with_context(|| format!("create directory {}", parent.display()))?;
    let tmp_path = path.with_extension("toml.tmp");
    fs::write(&tmp_path, contents)
        .with_context(|| format!("write temp config {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path).with_context(|| format!("replace config {}", path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn load_missing_returns_default() {
        let temp = tempfile::tempdir().expect("tempdir");
        let cfg = load_config(&temp.path().join("missing.toml")).expect("load");
        assert_eq!(cfg, EngineConfig::default());
    }

    #[test]
    fn write_then_load_preserves_values() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join(".workorder").join("config.toml");
        let cfg = EngineConfig {
            max_attempts: 5,
            ..EngineConfig::default()
        };
        write_config(&path, &cfg).expect("write");
        let loaded = load_config(&path).expect("load");
        assert_eq!(loaded, cfg);
    }

    #[test]
    fn partial_file_takes_defaults() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("config.toml");
        fs::write(&path, "max_attempts = 2\n[verify]\nscript_path = \"ci/check.sh\"\n")
            .expect("write");
        let cfg = load_config(&path).expect("load");
        assert_eq!(cfg.max_attempts, 2);
        assert_eq!(cfg.verify.script_path, "ci/check.sh");
        assert_eq!(cfg.verify.command, VerifyConfig::default().command);
        assert_eq!(cfg.oracle_timeout_secs, 900);
    }

    #[test]
    fn rejects_zero_attempts_and_unnormalized_script() {
        let cfg = EngineConfig {
            max_attempts: 0,
            ..EngineConfig::default()
        };
        assert!(cfg.validate().is_err());

        let mut cfg = EngineConfig::default();
        cfg.verify.script_path = "./scripts/verify.sh".to_string();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn artifacts_root_is_first_component() {
        assert_eq!(EngineConfig::default().artifacts_root(), ".workorder");
    }
}
