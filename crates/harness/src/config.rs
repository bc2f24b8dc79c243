//! Harness configuration
//!
//! Loaded from `utf.toml` when present; every field has a default so an
//! absent or partial file is fine.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::environment::{CommandTemplate, Interpreters};
use crate::error::{HarnessError, HarnessResult};

/// Default config file name, looked up in the working directory
pub const CONFIG_FILE: &str = "utf.toml";

/// Harness configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HarnessConfig {
    /// Directory scanned for `ut_*` files
    pub test_dir: PathBuf,

    /// Modules run concurrently
    pub jobs: usize,

    /// Per-test time limit
    pub test_timeout_secs: u64,

    /// Time limit for setup and shutdown files
    pub setup_timeout_secs: u64,

    /// How long a subprocess may take to exit after its stdin is closed
    pub subprocess_grace_secs: u64,

    /// Accepted test file extensions (empty = any)
    pub extensions: Vec<String>,

    /// Sandboxed runtime. Written as `sandbox = false` when disabled, which makes
    /// `#pragma repy` files fail with an environment error.
    #[serde(with = "sandbox_setting")]
    pub sandbox: Option<CommandTemplate>,

    /// Native interpreter
    pub native: CommandTemplate,
}

impl Default for HarnessConfig {
    fn default() -> Self {
        let interpreters = Interpreters::default();
        Self {
            test_dir: PathBuf::from("."),
            jobs: default_jobs(),
            test_timeout_secs: 60,
            setup_timeout_secs: 120,
            subprocess_grace_secs: 5,
            extensions: Vec::new(),
            sandbox: interpreters.sandbox,
            native: interpreters.native,
        }
    }
}

fn default_jobs() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

/// `sandbox = false`, `sandbox = true` (default runtime) or a command table
mod sandbox_setting {
    use super::*;

    #[derive(Serialize, Deserialize)]
    #[serde(untagged)]
    enum SandboxSetting {
        Toggle(bool),
        Command(CommandTemplate),
    }

    pub fn serialize<S: Serializer>(value: &Option<CommandTemplate>, serializer: S) -> Result<S::Ok, S::Error> {
        match value {
            Some(command) => SandboxSetting::Command(command.clone()).serialize(serializer),
            None => SandboxSetting::Toggle(false).serialize(serializer),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<CommandTemplate>, D::Error> {
        Ok(match SandboxSetting::deserialize(deserializer)? {
            SandboxSetting::Toggle(true) => Interpreters::default().sandbox,
            SandboxSetting::Toggle(false) => None,
            SandboxSetting::Command(command) => Some(command),
        })
    }
}

impl HarnessConfig {
    /// Load configuration from file, falling back to defaults when it does not exist
    pub fn load(path: &Path) -> HarnessResult<Self> {
        if path.exists() {
            let content = std::fs::read_to_string(path)?;
            let config: Self = toml::from_str(&content)?;
            config.validate()?;
            Ok(config)
        } else {
            Ok(Self::default())
        }
    }

    /// Save configuration to file
    pub fn save(&self, path: &Path) -> HarnessResult<()> {
        let content = toml::to_string_pretty(self)?;
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, content)?;
        Ok(())
    }

    pub fn validate(&self) -> HarnessResult<()> {
        if self.jobs == 0 {
            return Err(HarnessError::InvalidConfig("jobs must be at least 1".to_string()));
        }
        if self.test_timeout_secs == 0 || self.setup_timeout_secs == 0 {
            return Err(HarnessError::InvalidConfig("timeouts must be positive".to_string()));
        }
        if self.native.program.is_empty() {
            return Err(HarnessError::InvalidConfig("native interpreter program is empty".to_string()));
        }
        if self.sandbox.as_ref().is_some_and(|s| s.program.is_empty()) {
            return Err(HarnessError::InvalidConfig("sandbox program is empty".to_string()));
        }
        Ok(())
    }

    pub fn interpreters(&self) -> Interpreters {
        Interpreters {
            native: self.native.clone(),
            sandbox: self.sandbox.clone(),
        }
    }

    pub fn test_timeout(&self) -> Duration {
        Duration::from_secs(self.test_timeout_secs)
    }

    pub fn setup_timeout(&self) -> Duration {
        Duration::from_secs(self.setup_timeout_secs)
    }

    pub fn subprocess_grace(&self) -> Duration {
        Duration::from_secs(self.subprocess_grace_secs)
    }
}
