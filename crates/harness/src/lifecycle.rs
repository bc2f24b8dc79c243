//! Per-module lifecycle orchestration
//!
//! ```text
//! Init ──► Setup ──► Running ──► Draining ──► Shutdown ──► Done
//!   │        │          │
//!   └────────┴──────────┴──► Aborted (shutdown still attempted after Init)
//! ```
//!
//! Setup runs at most once and before every test, shutdown runs at most once
//! and after every test (or right after an aborted setup), and the subprocess
//! is alive for the whole test phase.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

use crate::config::HarnessConfig;
use crate::discovery::{TestFile, TestModule};
use crate::environment;
use crate::pragma::Pragmas;
use crate::process::{ExecutionResult, ProcessRunner, SubprocessHandle};
use crate::verify::{self, VerificationOutcome};

/// Lifecycle state of one module
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Init,
    Setup,
    Running,
    Draining,
    Shutdown,
    Done,
    Aborted,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Phase::Init => "init",
            Phase::Setup => "setup",
            Phase::Running => "running",
            Phase::Draining => "draining",
            Phase::Shutdown => "shutdown",
            Phase::Done => "done",
            Phase::Aborted => "aborted",
        };
        f.write_str(name)
    }
}

/// Outcome of one test file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum TestStatus {
    Passed,
    Failed { reason: String },
    NotRun { reason: String },
}

impl TestStatus {
    pub fn is_passed(&self) -> bool {
        matches!(self, TestStatus::Passed)
    }
}

impl From<VerificationOutcome> for TestStatus {
    fn from(outcome: VerificationOutcome) -> Self {
        if outcome.passed {
            TestStatus::Passed
        } else {
            TestStatus::Failed {
                reason: outcome
                    .failing_reason
                    .unwrap_or_else(|| "verification failed".to_string()),
            }
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestRecord {
    pub file: TestFile,
    pub status: TestStatus,
    pub duration_ms: u64,
}

/// Why a module's tests did not run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum AbortReason {
    /// Ambiguous lifecycle found during discovery
    ModuleConfig(String),
    SetupFailure(String),
    /// Subprocess could not be started
    SubprocessFailure(String),
    /// The module's task panicked
    Panicked(String),
}

impl fmt::Display for AbortReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AbortReason::ModuleConfig(d) => write!(f, "module configuration error: {}", d),
            AbortReason::SetupFailure(d) => write!(f, "setup failed: {}", d),
            AbortReason::SubprocessFailure(d) => write!(f, "subprocess failed to start: {}", d),
            AbortReason::Panicked(d) => write!(f, "harness panicked: {}", d),
        }
    }
}

/// Module-level failure that does not change any test outcome
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum ModuleFailure {
    SubprocessShutdown(String),
    Shutdown(String),
}

impl fmt::Display for ModuleFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ModuleFailure::SubprocessShutdown(d) => write!(f, "subprocess shutdown failed: {}", d),
            ModuleFailure::Shutdown(d) => write!(f, "shutdown failed: {}", d),
        }
    }
}

/// Everything known about one module after its lifecycle
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModuleResult {
    pub module: String,
    pub tests: Vec<TestRecord>,
    pub aborted: bool,
    pub abort_reason: Option<AbortReason>,
    pub failures: Vec<ModuleFailure>,
    pub final_phase: Phase,
    pub duration_ms: u64,
}

impl ModuleResult {
    /// Result for a module whose lifecycle never completed
    pub fn aborted(module: &TestModule, reason: AbortReason) -> Self {
        let not_run = format!("not run: {}", reason);
        Self {
            module: module.name.clone(),
            tests: module
                .tests
                .iter()
                .map(|file| TestRecord {
                    file: file.clone(),
                    status: TestStatus::NotRun { reason: not_run.clone() },
                    duration_ms: 0,
                })
                .collect(),
            aborted: true,
            abort_reason: Some(reason),
            failures: Vec::new(),
            final_phase: Phase::Aborted,
            duration_ms: 0,
        }
    }

    pub fn passed(&self) -> usize {
        self.tests.iter().filter(|t| t.status.is_passed()).count()
    }

    pub fn failed(&self) -> usize {
        self.tests
            .iter()
            .filter(|t| matches!(t.status, TestStatus::Failed { .. }))
            .count()
    }

    pub fn not_run(&self) -> usize {
        self.tests
            .iter()
            .filter(|t| matches!(t.status, TestStatus::NotRun { .. }))
            .count()
    }

    /// Every test passed and nothing went wrong at module level
    pub fn is_clean(&self) -> bool {
        !self.aborted && self.failures.is_empty() && self.passed() == self.tests.len()
    }

    pub fn status_of(&self, file_name: &str) -> Option<&TestStatus> {
        self.tests
            .iter()
            .find(|t| t.file.file_name() == file_name)
            .map(|t| &t.status)
    }
}

/// Time limits applied by the orchestrator
#[derive(Debug, Clone, Copy)]
pub struct LifecycleSettings {
    pub test_timeout: Duration,
    pub setup_timeout: Duration,
    pub subprocess_grace: Duration,
}

impl Default for LifecycleSettings {
    fn default() -> Self {
        Self::from(&HarnessConfig::default())
    }
}

impl From<&HarnessConfig> for LifecycleSettings {
    fn from(config: &HarnessConfig) -> Self {
        Self {
            test_timeout: config.test_timeout(),
            setup_timeout: config.setup_timeout(),
            subprocess_grace: config.subprocess_grace(),
        }
    }
}

/// Drives one module through its lifecycle
#[derive(Debug, Clone)]
pub struct ModuleLifecycle {
    runner: ProcessRunner,
    settings: LifecycleSettings,
}

impl ModuleLifecycle {
    pub fn new(runner: ProcessRunner, settings: LifecycleSettings) -> Self {
        Self { runner, settings }
    }

    pub fn settings(&self) -> &LifecycleSettings {
        &self.settings
    }

    /// Run the module. Never fails: every problem ends up in the result.
    pub async fn run(&self, module: &TestModule) -> ModuleResult {
        let start = Instant::now();
        let mut run = RunState::new(&module.name);

        if let Some(err) = &module.discovery_error {
            error!("Module '{}' not run: {}", module.name, err);
            let mut result = ModuleResult::aborted(module, AbortReason::ModuleConfig(err.clone()));
            result.duration_ms = elapsed_ms(start);
            return result;
        }

        info!("Module '{}': {} test(s)", module.name, module.tests.len());

        run.enter(Phase::Setup);
        if let Some(setup) = &module.setup {
            if let Err(reason) = self.run_strict(setup, self.settings.setup_timeout).await {
                error!("Setup of module '{}' failed: {}", module.name, reason);
                return self
                    .abort(module, run, AbortReason::SetupFailure(reason), start)
                    .await;
            }
        }

        run.enter(Phase::Running);
        let mut subprocess = match &module.subprocess {
            Some(file) => match self.start_subprocess(file) {
                Ok(handle) => Some(handle),
                Err(reason) => {
                    error!("Subprocess of module '{}' failed to start: {}", module.name, reason);
                    return self
                        .abort(module, run, AbortReason::SubprocessFailure(reason), start)
                        .await;
                }
            },
            None => None,
        };

        for test in &module.tests {
            let record = self.run_test(test).await;
            run.tests.push(record);
        }

        run.enter(Phase::Draining);
        if let Some(handle) = subprocess.take() {
            self.drain(handle, &mut run).await;
        }

        run.enter(Phase::Shutdown);
        self.run_shutdown(module, &mut run).await;

        run.enter(Phase::Done);
        run.finish(start)
    }

    /// Mark every test not-run, then attempt shutdown
    async fn abort(
        &self,
        module: &TestModule,
        mut run: RunState,
        reason: AbortReason,
        start: Instant,
    ) -> ModuleResult {
        run.enter(Phase::Aborted);
        let mut result = ModuleResult::aborted(module, reason);

        self.run_shutdown(module, &mut run).await;

        result.failures = run.failures;
        result.duration_ms = elapsed_ms(start);
        result
    }

    /// Parse, classify and run one file
    async fn execute(&self, file: &TestFile, limit: Duration) -> Result<(ExecutionResult, Pragmas), String> {
        let pragmas = file.pragmas().map_err(|e| e.to_string())?;
        let env = environment::select(&pragmas);
        debug!("{} runs {}", file.file_name(), env);

        let result = self
            .runner
            .run(&file.path, &env, None, limit)
            .await
            .map_err(|e| e.to_string())?;
        Ok((result, pragmas))
    }

    /// Setup/shutdown: must exit 0 and satisfy its own pragmas
    async fn run_strict(&self, file: &TestFile, limit: Duration) -> Result<(), String> {
        let (result, pragmas) = self.execute(file, limit).await?;

        if !result.exited_cleanly() {
            let stderr = String::from_utf8_lossy(&result.stderr);
            return Err(format!(
                "{} finished with {}{}",
                file.file_name(),
                result.exit_description(),
                if stderr.trim().is_empty() {
                    String::new()
                } else {
                    format!(":\n{}", stderr.trim_end())
                }
            ));
        }

        match verify::verify(&result, &pragmas) {
            VerificationOutcome { passed: true, .. } => Ok(()),
            VerificationOutcome { failing_reason, .. } => Err(format!(
                "{}: {}",
                file.file_name(),
                failing_reason.unwrap_or_default()
            )),
        }
    }

    async fn run_test(&self, test: &TestFile) -> TestRecord {
        let start = Instant::now();
        let status = match self.execute(test, self.settings.test_timeout).await {
            Err(reason) => TestStatus::Failed { reason },
            Ok((result, _)) if result.timed_out => TestStatus::Failed {
                reason: result.exit_description(),
            },
            Ok((result, pragmas)) => verify::verify(&result, &pragmas).into(),
        };

        match &status {
            TestStatus::Passed => info!("{} [ PASS ]", test.file_name()),
            TestStatus::Failed { reason } => warn!("{} [ FAIL ] {}", test.file_name(), reason),
            TestStatus::NotRun { .. } => {}
        }

        TestRecord {
            file: test.clone(),
            status,
            duration_ms: elapsed_ms(start),
        }
    }

    fn start_subprocess(&self, file: &TestFile) -> Result<SubprocessHandle, String> {
        let pragmas = file.pragmas().map_err(|e| e.to_string())?;
        let env = environment::select(&pragmas);
        let handle = self
            .runner
            .spawn_subprocess(&file.path, &env)
            .map_err(|e| e.to_string())?;
        info!("Started subprocess {} (pid: {:?})", file.file_name(), handle.id());
        Ok(handle)
    }

    async fn drain(&self, mut handle: SubprocessHandle, run: &mut RunState) {
        let name = handle
            .file()
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();

        handle.signal_shutdown();
        match handle.wait_for_exit(self.settings.subprocess_grace).await {
            Ok(result) if result.timed_out => {
                run.failures.push(ModuleFailure::SubprocessShutdown(format!(
                    "{} did not exit within {:?} of its stdin closing and was killed",
                    name, self.settings.subprocess_grace
                )));
            }
            Ok(result) => {
                debug!(
                    "Subprocess {} exited ({}), {} bytes stdout, {} bytes stderr",
                    name,
                    result.exit_description(),
                    result.stdout.len(),
                    result.stderr.len()
                );
            }
            Err(e) => run.failures.push(ModuleFailure::SubprocessShutdown(format!("{}: {}", name, e))),
        }
    }

    /// Best-effort; a failure is recorded and never touches test outcomes
    async fn run_shutdown(&self, module: &TestModule, run: &mut RunState) {
        let Some(shutdown) = &module.shutdown else {
            return;
        };
        if let Err(reason) = self.run_strict(shutdown, self.settings.setup_timeout).await {
            warn!("Shutdown of module '{}' failed: {}", module.name, reason);
            run.failures.push(ModuleFailure::Shutdown(reason));
        }
    }
}

/// Mutable bookkeeping for one lifecycle run
struct RunState {
    module: String,
    phase: Phase,
    tests: Vec<TestRecord>,
    failures: Vec<ModuleFailure>,
}

impl RunState {
    fn new(module: &str) -> Self {
        Self {
            module: module.to_string(),
            phase: Phase::Init,
            tests: Vec::new(),
            failures: Vec::new(),
        }
    }

    fn enter(&mut self, next: Phase) {
        debug!("Module '{}': {} -> {}", self.module, self.phase, next);
        self.phase = next;
    }

    fn finish(self, start: Instant) -> ModuleResult {
        ModuleResult {
            module: self.module,
            tests: self.tests,
            aborted: false,
            abort_reason: None,
            failures: self.failures,
            final_phase: self.phase,
            duration_ms: elapsed_ms(start),
        }
    }
}

fn elapsed_ms(start: Instant) -> u64 {
    start.elapsed().as_millis() as u64
}
