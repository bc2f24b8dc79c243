//! Runs module lifecycles on a bounded worker pool

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Semaphore;
use tracing::{error, info};

use crate::discovery::{DiscoveryWarning, Roster};
use crate::error::HarnessResult;
use crate::lifecycle::{AbortReason, ModuleLifecycle, ModuleResult};

/// Aggregate of a whole run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunSummary {
    pub started_at: DateTime<Utc>,
    pub duration_ms: u64,
    pub total: usize,
    pub passed: usize,
    pub failed: usize,
    pub not_run: usize,
    pub aborted_modules: usize,
    pub module_failures: usize,
    pub modules: Vec<ModuleResult>,
    pub warnings: Vec<DiscoveryWarning>,
}

impl RunSummary {
    fn collect(
        started_at: DateTime<Utc>,
        duration_ms: u64,
        modules: Vec<ModuleResult>,
        warnings: Vec<DiscoveryWarning>,
    ) -> Self {
        Self {
            started_at,
            duration_ms,
            total: modules.iter().map(|m| m.tests.len()).sum(),
            passed: modules.iter().map(|m| m.passed()).sum(),
            failed: modules.iter().map(|m| m.failed()).sum(),
            not_run: modules.iter().map(|m| m.not_run()).sum(),
            aborted_modules: modules.iter().filter(|m| m.aborted).count(),
            module_failures: modules.iter().map(|m| m.failures.len()).sum(),
            modules,
            warnings,
        }
    }

    /// True when every test passed and no module reported a failure
    pub fn success(&self) -> bool {
        self.modules.iter().all(|m| m.is_clean())
    }

    pub fn module(&self, name: &str) -> Option<&ModuleResult> {
        self.modules.iter().find(|m| m.module == name)
    }

    /// Write the summary as pretty JSON
    pub fn write_json(&self, path: &Path) -> HarnessResult<PathBuf> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)?;

        info!("Results written to: {}", path.display());
        Ok(path.to_path_buf())
    }
}

/// Bounded-concurrency module scheduler
#[derive(Debug, Clone)]
pub struct Scheduler {
    lifecycle: ModuleLifecycle,
    jobs: usize,
}

impl Scheduler {
    pub fn new(lifecycle: ModuleLifecycle, jobs: usize) -> Self {
        Self {
            lifecycle,
            jobs: jobs.max(1),
        }
    }

    /// Run every module of the roster. Results come back in roster order.
    pub async fn run(&self, roster: Roster) -> RunSummary {
        let started_at = Utc::now();
        let start = Instant::now();
        let permits = Arc::new(Semaphore::new(self.jobs));

        info!(
            "Running {} module(s) with up to {} in parallel",
            roster.modules.len(),
            self.jobs
        );

        let tasks: Vec<_> = roster
            .modules
            .into_values()
            .map(|module| {
                let lifecycle = self.lifecycle.clone();
                let permits = permits.clone();
                let placeholder = module.clone();
                let handle = tokio::spawn(async move {
                    // The semaphore is never closed
                    let _permit = permits.acquire_owned().await.ok();
                    lifecycle.run(&module).await
                });
                (placeholder, handle)
            })
            .collect();

        let (modules, handles): (Vec<_>, Vec<_>) = tasks.into_iter().unzip();
        let joined = futures::future::join_all(handles).await;

        let results: Vec<ModuleResult> = modules
            .iter()
            .zip(joined)
            .map(|(module, joined)| match joined {
                Ok(result) => result,
                Err(e) => {
                    error!("Module '{}' task failed: {}", module.name, e);
                    ModuleResult::aborted(module, AbortReason::Panicked(e.to_string()))
                }
            })
            .collect();

        let summary = RunSummary::collect(
            started_at,
            start.elapsed().as_millis() as u64,
            results,
            roster.warnings,
        );

        info!(
            "Test Results: {} passed, {} failed, {} not run ({} ms)",
            summary.passed, summary.failed, summary.not_run, summary.duration_ms
        );
        summary
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::discovery::{Role, TestFile, TestModule};
    use crate::lifecycle::{LifecycleSettings, TestStatus};
    use crate::process::ProcessRunner;
    use crate::environment::Interpreters;

    fn broken_module(name: &str) -> TestModule {
        let mut module = TestModule::new(name);
        module.tests.push(TestFile {
            path: PathBuf::from(format!("ut_{}_x.py", name)),
            module: name.to_string(),
            descriptor: Some("x".to_string()),
            role: Role::Test,
        });
        module.discovery_error = Some("duplicate setup files".to_string());
        module
    }

    #[tokio::test]
    async fn test_results_keep_roster_order_and_counts() {
        let mut roster = Roster::default();
        for name in ["c", "a", "b"] {
            roster.modules.insert(name.to_string(), broken_module(name));
        }

        let scheduler = Scheduler::new(
            ModuleLifecycle::new(ProcessRunner::new(Interpreters::default()), LifecycleSettings::default()),
            2,
        );
        let summary = scheduler.run(roster).await;

        let names: Vec<_> = summary.modules.iter().map(|m| m.module.as_str()).collect();
        assert_eq!(names, vec!["a", "b", "c"]);
        assert_eq!(summary.total, 3);
        assert_eq!(summary.not_run, 3);
        assert_eq!(summary.aborted_modules, 3);
        assert!(!summary.success());
        assert!(matches!(
            summary.module("a").unwrap().tests[0].status,
            TestStatus::NotRun { .. }
        ));
    }

    #[tokio::test]
    async fn test_empty_roster_is_success() {
        let scheduler = Scheduler::new(
            ModuleLifecycle::new(ProcessRunner::new(Interpreters::default()), LifecycleSettings::default()),
            0,
        );
        let summary = scheduler.run(Roster::default()).await;
        assert_eq!(summary.total, 0);
        assert!(summary.success());
    }

    #[test]
    fn test_write_json() {
        let tmp = tempfile::TempDir::new().unwrap();
        let summary = RunSummary::collect(Utc::now(), 5, Vec::new(), Vec::new());
        let path = summary.write_json(&tmp.path().join("out").join("results.json")).unwrap();

        let parsed: serde_json::Value = serde_json::from_str(&std::fs::read_to_string(path).unwrap()).unwrap();
        assert_eq!(parsed["total"], 0);
        assert_eq!(parsed["duration_ms"], 5);
    }
}
