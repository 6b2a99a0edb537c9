//! Pluggable task abstraction and the concrete ETL debugging task.
//!
//! A task supplies the initial prompt, the reference broken artifact, a
//! one-time setup hook, and a grading function over a trial-scoped sandbox
//! directory. The harness is task-agnostic: new tasks implement [`Task`],
//! they do not branch on type.

mod etl;

pub use etl::{EtlFixTask, ENTRY_POINT};

use anyhow::Result;
use std::path::Path;

#[derive(Debug, Clone)]
pub struct GradeReport {
    pub passed: bool,
    pub message: String,
}

impl GradeReport {
    pub fn fail(message: impl Into<String>) -> Self {
        Self {
            passed: false,
            message: message.into(),
        }
    }
}

/// Shared read-only across all trials; the trial-scoped sandbox directory is
/// the only per-trial argument.
pub trait Task: Send + Sync {
    fn name(&self) -> &str;

    /// Runs once per evaluation session, before any trial starts.
    fn setup(&self) -> Result<()>;

    fn prompt(&self) -> String;

    /// The reference broken artifact the submission is diffed against.
    fn broken_code(&self) -> String;

    /// Grades a submitted artifact inside `trial_dir`. An absent submission
    /// is an automatic fail, never a panic; every internal fault is folded
    /// into the report.
    fn grade(&self, trial_dir: &Path, submission: Option<&str>, verbose: bool) -> GradeReport;
}
