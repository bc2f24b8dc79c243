//! UTF - unit-test framework harness
//!
//! Discovers `ut_*` test files, classifies each one through its inline
//! `#pragma` directives, runs it in its own process and checks the captured
//! output against the declared expectations.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │  Discoverer   dir ──► Roster { module ──► TestModule }       │
//! ├──────────────────────────────────────────────────────────────┤
//! │  Scheduler    bounded pool, one task per module              │
//! │    └── ModuleLifecycle                                       │
//! │          setup ─► subprocess ─► tests ─► drain ─► shutdown   │
//! │            each file: Pragmas ──► ExecutionEnvironment       │
//! │                       ProcessRunner ──► ExecutionResult      │
//! │                       verify() ──► VerificationOutcome       │
//! └──────────────────────────────────────────────────────────────┘
//! ```

pub mod config;
pub mod discovery;
pub mod environment;
pub mod error;
pub mod lifecycle;
pub mod pragma;
pub mod process;
pub mod scheduler;
pub mod verify;

pub use config::HarnessConfig;
pub use discovery::{Discoverer, Role, Roster, TestFile, TestModule};
pub use environment::{ExecutionEnvironment, Interpreters};
pub use error::{HarnessError, HarnessResult, PragmaError};
pub use lifecycle::{LifecycleSettings, ModuleLifecycle, ModuleResult, TestStatus};
pub use pragma::{Pragma, PragmaKind, Pragmas};
pub use process::{ExecutionResult, ProcessRunner, SubprocessHandle};
pub use scheduler::{RunSummary, Scheduler};
pub use verify::{verify, VerificationOutcome};
