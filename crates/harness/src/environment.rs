//! Execution environment selection
//!
//! A file with a `#pragma repy` line runs inside the sandboxed collaborator,
//! everything else runs under the native interpreter. Which programs those
//! are is configuration, held by [`Interpreters`] and optionally published
//! process-wide through [`registry`].

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;

use crate::error::{HarnessError, HarnessResult};
use crate::pragma::Pragmas;

/// Restrictions used when `#pragma repy` names none
pub const DEFAULT_RESTRICTIONS: &str = "restrictions.default";

/// Where a file runs
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ExecutionEnvironment {
    Native,
    Sandboxed { restrictions: String },
}

impl ExecutionEnvironment {
    pub fn is_sandboxed(&self) -> bool {
        matches!(self, ExecutionEnvironment::Sandboxed { .. })
    }
}

impl fmt::Display for ExecutionEnvironment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExecutionEnvironment::Native => write!(f, "native"),
            ExecutionEnvironment::Sandboxed { restrictions } => write!(f, "sandboxed({})", restrictions),
        }
    }
}

/// Pick the environment for a file from its pragmas
pub fn select(pragmas: &Pragmas) -> ExecutionEnvironment {
    match pragmas.repy() {
        Some(repy) => {
            let restrictions = repy.argument.trim();
            ExecutionEnvironment::Sandboxed {
                restrictions: if restrictions.is_empty() {
                    DEFAULT_RESTRICTIONS.to_string()
                } else {
                    restrictions.to_string()
                },
            }
        }
        None => ExecutionEnvironment::Native,
    }
}

/// A program plus leading arguments
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandTemplate {
    pub program: String,
    #[serde(default)]
    pub args: Vec<String>,
}

impl CommandTemplate {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }
}

/// The programs that actually execute test files
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Interpreters {
    /// Runs native files: `<program> <args..> <file>`
    pub native: CommandTemplate,

    /// Runs sandboxed files: `<program> <args..> <restrictions> <file>`
    pub sandbox: Option<CommandTemplate>,
}

impl Default for Interpreters {
    fn default() -> Self {
        Self {
            native: CommandTemplate::new("python"),
            sandbox: Some(CommandTemplate::new("python").arg("repy.py")),
        }
    }
}

impl Interpreters {
    /// Full argv for running `file` in `env`
    pub fn command_line(&self, env: &ExecutionEnvironment, file: &Path) -> HarnessResult<Vec<String>> {
        let file = file.to_string_lossy().to_string();
        let argv = match env {
            ExecutionEnvironment::Native => {
                let mut argv = vec![self.native.program.clone()];
                argv.extend(self.native.args.iter().cloned());
                argv.push(file);
                argv
            }
            ExecutionEnvironment::Sandboxed { restrictions } => {
                let sandbox = self.sandbox.as_ref().ok_or_else(|| {
                    HarnessError::Environment(format!(
                        "{} requires the sandbox runtime but none is configured",
                        file
                    ))
                })?;
                let mut argv = vec![sandbox.program.clone()];
                argv.extend(sandbox.args.iter().cloned());
                argv.push(restrictions.clone());
                argv.push(file);
                argv
            }
        };
        Ok(argv)
    }
}

/// Process-wide collaborator registry.
///
/// Installed once at startup; the returned guard tears it down when dropped.
pub mod registry {
    use once_cell::sync::Lazy;
    use parking_lot::RwLock;
    use std::sync::Arc;
    use tracing::{debug, info};

    use super::Interpreters;
    use crate::error::{HarnessError, HarnessResult};

    static REGISTRY: Lazy<RwLock<Option<Arc<Interpreters>>>> = Lazy::new(|| RwLock::new(None));

    /// Keeps the registry populated while alive
    #[must_use = "dropping the guard tears the registry down"]
    #[derive(Debug)]
    pub struct RegistryGuard {
        _private: (),
    }

    impl Drop for RegistryGuard {
        fn drop(&mut self) {
            REGISTRY.write().take();
            debug!("Execution collaborator registry torn down");
        }
    }

    /// Publish the collaborators for this process
    pub fn install(interpreters: Interpreters) -> HarnessResult<RegistryGuard> {
        let mut slot = REGISTRY.write();
        if slot.is_some() {
            return Err(HarnessError::Environment(
                "execution collaborators are already installed".to_string(),
            ));
        }
        info!(
            "Registered native interpreter '{}'{}",
            interpreters.native.program,
            interpreters
                .sandbox
                .as_ref()
                .map(|s| format!(", sandbox runtime '{}'", s.program))
                .unwrap_or_default()
        );
        *slot = Some(Arc::new(interpreters));
        Ok(RegistryGuard { _private: () })
    }

    /// Installed collaborators
    pub fn current() -> HarnessResult<Arc<Interpreters>> {
        REGISTRY.read().clone().ok_or_else(|| {
            HarnessError::Environment("no execution collaborators installed".to_string())
        })
    }

    pub fn is_installed() -> bool {
        REGISTRY.read().is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test_case("#pragma repy restrictions.test\n", "restrictions.test" ; "explicit")]
    #[test_case("#pragma repy\n", DEFAULT_RESTRICTIONS ; "default")]
    #[test_case("#pragma repy    \n", DEFAULT_RESTRICTIONS ; "whitespace only")]
    fn test_sandboxed_selection(text: &str, expected: &str) {
        let pragmas = Pragmas::parse(text).unwrap();
        assert_eq!(
            select(&pragmas),
            ExecutionEnvironment::Sandboxed { restrictions: expected.to_string() }
        );
    }

    #[test]
    fn test_native_without_repy() {
        let pragmas = Pragmas::parse("#pragma out hi\n#pragma error\n").unwrap();
        assert_eq!(select(&pragmas), ExecutionEnvironment::Native);
    }

    #[test]
    fn test_command_lines() {
        let interpreters = Interpreters::default();
        let file = Path::new("ut_a_x.py");

        let native = interpreters.command_line(&ExecutionEnvironment::Native, file).unwrap();
        assert_eq!(native, vec!["python", "ut_a_x.py"]);

        let sandboxed = interpreters
            .command_line(
                &ExecutionEnvironment::Sandboxed { restrictions: "restrictions.test".into() },
                file,
            )
            .unwrap();
        assert_eq!(sandboxed, vec!["python", "repy.py", "restrictions.test", "ut_a_x.py"]);
    }

    #[test]
    fn test_missing_sandbox_is_environment_error() {
        let interpreters = Interpreters {
            native: CommandTemplate::new("sh"),
            sandbox: None,
        };
        let err = interpreters
            .command_line(
                &ExecutionEnvironment::Sandboxed { restrictions: DEFAULT_RESTRICTIONS.into() },
                Path::new("ut_a.py"),
            )
            .unwrap_err();
        assert!(matches!(err, HarnessError::Environment(_)));
    }

    // The only test touching the global registry.
    #[test]
    fn test_registry_install_and_teardown() {
        assert!(registry::current().is_err());

        let guard = registry::install(Interpreters::default()).unwrap();
        assert!(registry::is_installed());
        assert_eq!(registry::current().unwrap().native.program, "python");
        assert!(registry::install(Interpreters::default()).is_err());

        drop(guard);
        assert!(!registry::is_installed());

        let again = registry::install(Interpreters::default()).unwrap();
        drop(again);
    }
}
