//! Controller configuration
//!
//! Every tunable lives here with a default matching the documented
//! constants. Sources, lowest precedence first: defaults, a TOML file,
//! `AUDIT_*` environment variables.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

use crate::completion::CompletionPolicy;
use crate::complexity::DepthConfig;
use crate::error::{AuditError, AuditResult};
use crate::judge::JudgeConfig;
use crate::response::FeedbackConfig;
use crate::stagnation::StagnationConfig;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ControllerConfig {
    pub completion: CompletionPolicy,
    pub stagnation: StagnationConfig,
    pub depth: DepthConfig,
    pub feedback: FeedbackConfig,
    pub judge: JudgeConfig,
    /// Directory holding one JSON record per session
    pub state_dir: PathBuf,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            completion: CompletionPolicy::default(),
            stagnation: StagnationConfig::default(),
            depth: DepthConfig::default(),
            feedback: FeedbackConfig::default(),
            judge: JudgeConfig::default(),
            state_dir: PathBuf::from(".audit-sessions"),
        }
    }
}

impl ControllerConfig {
    pub fn from_toml_str(raw: &str) -> AuditResult<Self> {
        let config: Self = toml::from_str(raw)
            .map_err(|e| AuditError::config(format!("invalid config TOML: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: &Path) -> AuditResult<Self> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            AuditError::config(format!("failed to read config {}: {}", path.display(), e))
        })?;
        Self::from_toml_str(&raw)
    }

    /// Load `path` (if any) and overlay the environment. Invalid files or
    /// overrides fall back to defaults with a warning.
    pub fn load_or_default(path: Option<&Path>) -> Self {
        let mut config = match path {
            Some(path) => match Self::load(path) {
                Ok(config) => {
                    info!(path = %path.display(), "Loaded controller config");
                    config
                }
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "Config unusable, using defaults");
                    Self::default()
                }
            },
            None => Self::default(),
        };

        config.apply_env();
        if let Err(e) = config.validate() {
            warn!(error = %e, "Environment overrides produced an invalid config, using defaults");
            config = Self::default();
        }
        config
    }

    /// Overlay `AUDIT_*` variables from the process environment
    pub fn apply_env(&mut self) {
        self.apply_env_from(|key| std::env::var(key).ok());
    }

    /// Overlay `AUDIT_*` variables from `lookup`. Unparseable numbers are
    /// ignored with a warning.
    pub fn apply_env_from<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(dir) = lookup("AUDIT_STATE_DIR") {
            self.state_dir = PathBuf::from(dir);
        }
        if let Some(cap) = lookup("AUDIT_HARD_CAP") {
            match cap.trim().parse() {
                Ok(n) => self.completion.hard_cap = n,
                Err(_) => warn!(value = %cap, "Ignoring unparseable AUDIT_HARD_CAP"),
            }
        }
        if let Some(window) = lookup("AUDIT_WINDOW_SIZE") {
            match window.trim().parse() {
                Ok(n) => self.stagnation.window_size = n,
                Err(_) => warn!(value = %window, "Ignoring unparseable AUDIT_WINDOW_SIZE"),
            }
        }
        if let Some(threshold) = lookup("AUDIT_SIMILARITY_THRESHOLD") {
            match threshold.trim().parse() {
                Ok(t) => self.stagnation.similarity_threshold = t,
                Err(_) => {
                    warn!(value = %threshold, "Ignoring unparseable AUDIT_SIMILARITY_THRESHOLD")
                }
            }
        }
        if let Some(cmd) = lookup("AUDIT_JUDGE_CMD") {
            self.judge.set_command(&cmd);
        }
        if let Some(secs) = lookup("AUDIT_MAX_TIMEOUT_SECS") {
            match secs.trim().parse() {
                Ok(n) => self.depth.max_timeout_secs = n,
                Err(_) => warn!(value = %secs, "Ignoring unparseable AUDIT_MAX_TIMEOUT_SECS"),
            }
        }
    }

    pub fn validate(&self) -> AuditResult<()> {
        self.completion.validate()?;
        self.stagnation.validate()?;
        self.depth.validate()?;
        self.judge.validate()?;
        if self.state_dir.as_os_str().is_empty() {
            return Err(AuditError::config("state_dir must not be empty"));
        }
        Ok(())
    }
}
